use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::entry::{LocalEvent, LocalEventKind, LocalNode};
use super::paths::{PathError, is_partial, tracker_key};
use super::tracker::OperationTracker;

pub const DEFAULT_QUEUE_CAPACITY: usize = 10;
pub const DEFAULT_DEBOUNCE_WORKERS: usize = 10;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch error: {0}")]
    Notify(#[from] notify::Error),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Destination for settled local changes.
pub trait LocalEventSink: Send + Sync + 'static {
    fn forward(&self, event: LocalEvent);
}

#[derive(Debug, Clone, Copy)]
pub struct WatcherConfig {
    pub queue_capacity: usize,
    pub workers: usize,
    pub sweep_interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            workers: DEFAULT_DEBOUNCE_WORKERS,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RawEvent {
    path: PathBuf,
    kind: LocalEventKind,
}

impl RawEvent {
    fn new(path: PathBuf, kind: LocalEventKind) -> Self {
        Self { path, kind }
    }
}

/// A file still being written: forwarded once two consecutive sweeps see
/// the same size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingFile {
    kind: LocalEventKind,
    size: u64,
    first_equal_seen: bool,
}

struct WatchState {
    root: PathBuf,
    tracker: OperationTracker,
    sink: Arc<dyn LocalEventSink>,
    pending: DashMap<PathBuf, PendingFile>,
}

impl WatchState {
    fn new(root: PathBuf, tracker: OperationTracker, sink: Arc<dyn LocalEventSink>) -> Self {
        Self {
            root,
            tracker,
            sink,
            pending: DashMap::new(),
        }
    }

    fn is_tracked(&self, path: &Path) -> bool {
        tracker_key(&self.root, path)
            .map(|key| self.tracker.is_tracked(&key))
            .unwrap_or(false)
    }

    fn forward(&self, event: LocalEvent) {
        match tracker_key(&self.root, &event.path) {
            Ok(key) if self.tracker.is_tracked(&key) => {
                debug!(path = %key, "path is tracked, local change dropped");
            }
            Ok(_) => self.sink.forward(event),
            Err(err) => warn!(path = ?event.path, "ignoring local change: {err}"),
        }
    }

    fn handle(&self, raw: RawEvent) {
        let mut work = vec![raw];
        while let Some(RawEvent { path, kind }) = work.pop() {
            if path == self.root || is_partial(&path) {
                continue;
            }

            if kind == LocalEventKind::Delete {
                self.pending.remove(&path);
                self.forward(LocalEvent::new(path, LocalEventKind::Delete, None));
                continue;
            }

            let Ok(metadata) = std::fs::symlink_metadata(&path) else {
                debug!(path = ?path, "vanished before it could be inspected");
                continue;
            };

            if metadata.is_dir() {
                if kind != LocalEventKind::Create {
                    continue;
                }
                // The recursive watch already covers the new directory, so
                // children found here are only those that predate it.
                self.forward(LocalEvent::new(
                    path.clone(),
                    LocalEventKind::Create,
                    Some(LocalNode::Dir),
                ));
                for child in WalkDir::new(&path).min_depth(1).max_depth(1) {
                    match child {
                        Ok(child) => {
                            work.push(RawEvent::new(child.into_path(), LocalEventKind::Create))
                        }
                        Err(err) => warn!("directory walk failed: {err}"),
                    }
                }
                continue;
            }

            if !metadata.is_file() {
                continue;
            }
            if self.is_tracked(&path) {
                debug!(path = ?path, "path is tracked, local change dropped");
                continue;
            }

            let record = PendingFile {
                kind,
                size: metadata.len(),
                first_equal_seen: false,
            };
            if kind == LocalEventKind::Create {
                self.pending.insert(path, record);
            } else {
                self.pending.entry(path).or_insert(record);
            }
        }
    }

    /// One stabilization pass; returns how many files were forwarded.
    fn sweep(&self) -> usize {
        let mut vanished = Vec::new();
        let mut ready = Vec::new();
        for mut entry in self.pending.iter_mut() {
            let size = match std::fs::metadata(entry.key()) {
                Ok(metadata) => metadata.len(),
                Err(_) => {
                    vanished.push(entry.key().clone());
                    continue;
                }
            };
            let pending = entry.value_mut();
            if size != pending.size {
                pending.size = size;
                pending.first_equal_seen = false;
            } else if !pending.first_equal_seen {
                pending.first_equal_seen = true;
            } else {
                ready.push((entry.key().clone(), size));
            }
        }

        for path in vanished {
            self.pending.remove(&path);
        }

        let mut forwarded = 0;
        for (path, size) in ready {
            let removed = self
                .pending
                .remove_if(&path, |_, pending| pending.first_equal_seen && pending.size == size);
            if let Some((path, pending)) = removed {
                self.forward(LocalEvent::new(
                    path,
                    pending.kind,
                    Some(LocalNode::File { size: pending.size }),
                ));
                forwarded += 1;
            }
        }
        forwarded
    }
}

fn map_event(event: Event) -> Vec<RawEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => LocalEventKind::Create,
        EventKind::Remove(_) => LocalEventKind::Delete,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => LocalEventKind::Delete,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => LocalEventKind::Create,
        // Backends that pair renames also report each side on its own.
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => return Vec::new(),
        EventKind::Modify(ModifyKind::Name(_)) => {
            return event
                .paths
                .into_iter()
                .map(|path| {
                    let kind = if path.exists() {
                        LocalEventKind::Create
                    } else {
                        LocalEventKind::Delete
                    };
                    RawEvent::new(path, kind)
                })
                .collect();
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        EventKind::Modify(_) => LocalEventKind::Modify,
        _ => return Vec::new(),
    };
    event
        .paths
        .into_iter()
        .map(|path| RawEvent::new(path, kind))
        .collect()
}

/// Recursive filesystem watch with write-completion detection. Raw OS events
/// pass through a small bounded queue (the notify thread blocks when it is
/// full) to a pool of debounce threads; a periodic sweep forwards files whose
/// size has settled.
///
/// The debounce pool runs on its own OS threads and never calls back into
/// notify, so a full queue always drains.
pub struct LocalChangeWatcher {
    state: Arc<WatchState>,
    watcher: Option<RecommendedWatcher>,
    sweeper: JoinHandle<()>,
}

impl LocalChangeWatcher {
    pub fn start(
        root: PathBuf,
        tracker: OperationTracker,
        sink: Arc<dyn LocalEventSink>,
        config: WatcherConfig,
    ) -> Result<Self, WatchError> {
        let (tx, rx) = mpsc::channel::<RawEvent>(config.queue_capacity.max(1));
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for raw in map_event(event) {
                        if tx.blocking_send(raw).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => warn!("filesystem watch error: {err}"),
            })?;

        let state = Arc::new(WatchState::new(root, tracker, sink));
        watcher.watch(&state.root, RecursiveMode::Recursive)?;
        info!(root = ?state.root, "local watcher started");

        let rx = Arc::new(Mutex::new(rx));
        for index in 0..config.workers.max(1) {
            let rx = Arc::clone(&rx);
            let state = Arc::clone(&state);
            thread::Builder::new()
                .name(format!("dsync-debounce-{index}"))
                .spawn(move || debounce_loop(&rx, &state))?;
        }

        let sweeper = Arc::clone(&state);
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let state = Arc::clone(&sweeper);
                match tokio::task::spawn_blocking(move || state.sweep()).await {
                    Ok(0) => {}
                    Ok(forwarded) => debug!(forwarded, "settled local changes forwarded"),
                    Err(err) => warn!("stabilization sweep failed: {err}"),
                }
            }
        });

        Ok(Self {
            state,
            watcher: Some(watcher),
            sweeper,
        })
    }

    pub fn pending(&self) -> usize {
        self.state.pending.len()
    }
}

/// Drains the raw queue until every sender is gone.
fn debounce_loop(rx: &Mutex<mpsc::Receiver<RawEvent>>, state: &WatchState) {
    loop {
        let next = rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .blocking_recv();
        match next {
            Some(raw) => state.handle(raw),
            None => break,
        }
    }
}

impl Drop for LocalChangeWatcher {
    fn drop(&mut self) {
        self.sweeper.abort();
        // Dropping the OS watcher closes the raw queue's sender, which ends
        // the debounce threads.
        self.watcher.take();
    }
}

#[cfg(test)]
#[path = "watcher_tests.rs"]
mod tests;
