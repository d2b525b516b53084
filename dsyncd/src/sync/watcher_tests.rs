use super::*;
use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};
use std::collections::HashSet;
use std::io::Write;
use tempfile::tempdir;

#[derive(Default)]
struct CollectingSink {
    events: Mutex<Vec<LocalEvent>>,
}

impl CollectingSink {
    fn events(&self) -> Vec<LocalEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl LocalEventSink for CollectingSink {
    fn forward(&self, event: LocalEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn state_for(root: &Path, tracker: OperationTracker) -> (WatchState, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::default());
    let state = WatchState::new(root.to_path_buf(), tracker, sink.clone());
    (state, sink)
}

fn event(kind: EventKind, paths: &[&str]) -> Event {
    Event {
        kind,
        paths: paths.iter().map(PathBuf::from).collect(),
        attrs: Default::default(),
    }
}

#[test]
fn maps_notify_kinds() {
    assert_eq!(
        map_event(event(EventKind::Create(CreateKind::File), &["/r/a"])),
        vec![RawEvent::new("/r/a".into(), LocalEventKind::Create)]
    );
    assert_eq!(
        map_event(event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/r/a"]
        )),
        vec![RawEvent::new("/r/a".into(), LocalEventKind::Modify)]
    );
    assert_eq!(
        map_event(event(EventKind::Remove(RemoveKind::Any), &["/r/a"])),
        vec![RawEvent::new("/r/a".into(), LocalEventKind::Delete)]
    );
    assert_eq!(
        map_event(event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &["/r/old"]
        )),
        vec![RawEvent::new("/r/old".into(), LocalEventKind::Delete)]
    );
    assert_eq!(
        map_event(event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            &["/r/new"]
        )),
        vec![RawEvent::new("/r/new".into(), LocalEventKind::Create)]
    );
    assert!(
        map_event(event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/r/old", "/r/new"]
        ))
        .is_empty()
    );
    assert!(
        map_event(event(
            EventKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime)),
            &["/r/a"]
        ))
        .is_empty()
    );
}

#[test]
fn file_is_forwarded_after_two_equal_samples() {
    let dir = tempdir().unwrap();
    let (state, sink) = state_for(dir.path(), OperationTracker::default());
    let path = dir.path().join("big.bin");
    std::fs::write(&path, b"first chunk").unwrap();

    state.handle(RawEvent::new(path.clone(), LocalEventKind::Create));
    assert_eq!(state.sweep(), 0);

    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b" and more").unwrap();
    drop(file);
    assert_eq!(state.sweep(), 0, "size change resets stabilization");
    assert_eq!(state.sweep(), 0, "first equal sample");
    assert_eq!(state.sweep(), 1, "second equal sample");
    assert_eq!(state.sweep(), 0, "forwarded only once");

    let expected_size = std::fs::metadata(&path).unwrap().len();
    assert_eq!(
        sink.events(),
        vec![LocalEvent::new(
            path,
            LocalEventKind::Create,
            Some(LocalNode::File {
                size: expected_size
            })
        )]
    );
}

#[test]
fn modify_does_not_replace_pending_create() {
    let dir = tempdir().unwrap();
    let (state, sink) = state_for(dir.path(), OperationTracker::default());
    let path = dir.path().join("a.txt");
    std::fs::write(&path, b"abc").unwrap();

    state.handle(RawEvent::new(path.clone(), LocalEventKind::Create));
    state.handle(RawEvent::new(path.clone(), LocalEventKind::Modify));
    state.sweep();
    state.sweep();

    assert_eq!(sink.events()[0].kind, LocalEventKind::Create);
}

#[test]
fn create_restarts_stabilization() {
    let dir = tempdir().unwrap();
    let (state, sink) = state_for(dir.path(), OperationTracker::default());
    let path = dir.path().join("a.txt");
    std::fs::write(&path, b"abc").unwrap();

    state.handle(RawEvent::new(path.clone(), LocalEventKind::Modify));
    state.sweep();
    state.handle(RawEvent::new(path.clone(), LocalEventKind::Create));
    assert_eq!(state.sweep(), 0);
    assert_eq!(state.sweep(), 1);
    assert_eq!(sink.events()[0].kind, LocalEventKind::Create);
}

#[test]
fn delete_of_in_flight_download_is_dropped() {
    let dir = tempdir().unwrap();
    let tracker = OperationTracker::default();
    let (state, sink) = state_for(dir.path(), tracker.clone());

    tracker.start("/docs/report.pdf");
    state.handle(RawEvent::new(
        dir.path().join("Docs/report.pdf"),
        LocalEventKind::Delete,
    ));
    assert!(sink.events().is_empty());

    state.handle(RawEvent::new(
        dir.path().join("Docs/other.pdf"),
        LocalEventKind::Delete,
    ));
    assert_eq!(
        sink.events(),
        vec![LocalEvent::new(
            dir.path().join("Docs/other.pdf"),
            LocalEventKind::Delete,
            None
        )]
    );
}

#[test]
fn delete_clears_pending_record() {
    let dir = tempdir().unwrap();
    let (state, _sink) = state_for(dir.path(), OperationTracker::default());
    let path = dir.path().join("a.txt");
    std::fs::write(&path, b"abc").unwrap();

    state.handle(RawEvent::new(path.clone(), LocalEventKind::Create));
    assert_eq!(state.pending.len(), 1);
    state.handle(RawEvent::new(path, LocalEventKind::Delete));
    assert!(state.pending.is_empty());
}

#[test]
fn file_tracked_before_it_settles_is_not_forwarded() {
    let dir = tempdir().unwrap();
    let tracker = OperationTracker::default();
    let (state, sink) = state_for(dir.path(), tracker.clone());
    let path = dir.path().join("b.txt");
    std::fs::write(&path, b"abc").unwrap();

    state.handle(RawEvent::new(path, LocalEventKind::Create));
    tracker.start("/b.txt");
    state.sweep();
    state.sweep();

    assert!(sink.events().is_empty());
    assert!(state.pending.is_empty());
}

#[test]
fn created_directory_forwards_itself_and_injects_children() {
    let dir = tempdir().unwrap();
    let (state, sink) = state_for(dir.path(), OperationTracker::default());
    let new_dir = dir.path().join("Album");
    std::fs::create_dir_all(new_dir.join("Nested")).unwrap();
    std::fs::write(new_dir.join("one.jpg"), b"1").unwrap();
    std::fs::write(new_dir.join("Nested/two.jpg"), b"22").unwrap();

    state.handle(RawEvent::new(new_dir.clone(), LocalEventKind::Create));

    let dirs: Vec<_> = sink.events().into_iter().map(|event| event.path).collect();
    assert_eq!(dirs.len(), 2);
    assert_eq!(dirs[0], new_dir);
    assert!(dirs.contains(&new_dir.join("Nested")));
    assert!(state.pending.contains_key(&new_dir.join("one.jpg")));
    assert!(state.pending.contains_key(&new_dir.join("Nested/two.jpg")));
}

#[test]
fn partial_and_vanished_files_are_ignored() {
    let dir = tempdir().unwrap();
    let (state, sink) = state_for(dir.path(), OperationTracker::default());
    let partial = dir.path().join("a.txt.partial");
    std::fs::write(&partial, b"x").unwrap();
    let temp = dir.path().join("temp.txt");
    std::fs::write(&temp, b"x").unwrap();

    state.handle(RawEvent::new(partial, LocalEventKind::Create));
    state.handle(RawEvent::new(temp.clone(), LocalEventKind::Create));
    state.handle(RawEvent::new(
        dir.path().join("never-existed"),
        LocalEventKind::Modify,
    ));
    assert_eq!(state.pending.len(), 1);

    std::fs::remove_file(&temp).unwrap();
    assert_eq!(state.sweep(), 0);
    assert!(state.pending.is_empty());
    assert!(sink.events().is_empty());
}

#[tokio::test]
async fn live_watcher_reports_new_file_in_new_directory() {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let sink = Arc::new(CollectingSink::default());
    let watcher = LocalChangeWatcher::start(
        root.clone(),
        OperationTracker::default(),
        sink.clone(),
        WatcherConfig {
            sweep_interval: Duration::from_millis(50),
            ..WatcherConfig::default()
        },
    )
    .unwrap();

    std::fs::create_dir(root.join("Inbox")).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    std::fs::write(root.join("Inbox/note.txt"), b"hi").unwrap();

    let expected = root.join("Inbox/note.txt");
    tokio::time::timeout(Duration::from_secs(10), async {
        while !sink.events().iter().any(|event| event.path == expected) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("file event forwarded");

    assert!(
        sink.events()
            .iter()
            .any(|event| event.path == root.join("Inbox") && event.node == Some(LocalNode::Dir))
    );
    drop(watcher);
}

fn start_live(root: &Path, config: WatcherConfig) -> (LocalChangeWatcher, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::default());
    let watcher = LocalChangeWatcher::start(
        root.to_path_buf(),
        OperationTracker::default(),
        sink.clone(),
        WatcherConfig {
            sweep_interval: Duration::from_millis(50),
            ..config
        },
    )
    .unwrap();
    (watcher, sink)
}

/// Creates `parents` directories holding `children` subdirectories and one
/// small file each; returns the expected directory and file paths.
fn create_nested_tree(
    root: &Path,
    parents: usize,
    children: usize,
) -> (HashSet<PathBuf>, HashSet<PathBuf>) {
    let mut dirs = HashSet::new();
    let mut files = HashSet::new();
    for outer in 0..parents {
        let parent = root.join(format!("batch-{outer:03}"));
        for inner in 0..children {
            let child = parent.join(format!("part-{inner}"));
            std::fs::create_dir_all(&child).unwrap();
            dirs.insert(child);
        }
        let file = parent.join("index.txt");
        std::fs::write(&file, b"entry").unwrap();
        dirs.insert(parent);
        files.insert(file);
    }
    (dirs, files)
}

async fn wait_for_tree(
    sink: &CollectingSink,
    dirs: &HashSet<PathBuf>,
    files: &HashSet<PathBuf>,
) -> Result<(), String> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        let events = sink.events();
        let seen_dirs: HashSet<&PathBuf> = events
            .iter()
            .filter(|event| event.node == Some(LocalNode::Dir))
            .map(|event| &event.path)
            .collect();
        let seen_files: HashSet<&PathBuf> = events
            .iter()
            .filter(|event| matches!(event.node, Some(LocalNode::File { size: 5 })))
            .map(|event| &event.path)
            .collect();
        let missing_dirs = dirs.iter().filter(|dir| !seen_dirs.contains(dir)).count();
        let missing_files = files.iter().filter(|file| !seen_files.contains(file)).count();
        if missing_dirs == 0 && missing_files == 0 {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(format!(
                "{missing_dirs} of {} directories and {missing_files} of {} files not forwarded",
                dirs.len(),
                files.len()
            ));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn live_watcher_keeps_up_with_bulk_directory_creation() {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let (watcher, sink) = start_live(&root, WatcherConfig::default());

    let tree_root = root.clone();
    let (dirs, files) = tokio::task::spawn_blocking(move || create_nested_tree(&tree_root, 200, 5))
        .await
        .unwrap();

    wait_for_tree(&sink, &dirs, &files).await.unwrap();
    drop(watcher);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_slot_queue_with_one_worker_still_drains() {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let (watcher, sink) = start_live(
        &root,
        WatcherConfig {
            queue_capacity: 1,
            workers: 1,
            ..WatcherConfig::default()
        },
    );

    let (dirs, files) = create_nested_tree(&root, 60, 3);

    wait_for_tree(&sink, &dirs, &files).await.unwrap();
    drop(watcher);
}
