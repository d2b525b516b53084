use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::content_hash::ContentHasher;
use super::engine::{ChangeEngine, ChangeHandler, EngineConfig, Scheduled, SyncError};
use super::entry::{RemoteEntry, RemoteFile};
use super::feed::ChangeSink;
use super::paths::{local_path_for, partial_path, split_parent, tracker_key};
use super::remote::{RemoteError, RemoteStore};
use super::store::{MetadataStore, StoredEntry};
use super::tracker::{OperationTracker, TrackGuard};

/// Applies remote entries to the local tree.
pub struct DownloadHandler {
    remote: Arc<dyn RemoteStore>,
    store: Arc<MetadataStore>,
    tracker: OperationTracker,
    root: PathBuf,
}

#[async_trait]
impl ChangeHandler for DownloadHandler {
    type Item = RemoteEntry;

    fn is_file(&self, item: &RemoteEntry) -> bool {
        item.is_file()
    }

    fn is_delete(&self, item: &RemoteEntry) -> bool {
        item.is_delete()
    }

    fn file_size(&self, item: &RemoteEntry) -> u64 {
        item.size()
    }

    fn path_key(&self, item: &RemoteEntry) -> String {
        item.path_lower().to_string()
    }

    async fn process(&self, entry: RemoteEntry) -> Result<(), SyncError> {
        let _guard = self.tracker.track(entry.path_lower());
        match entry {
            RemoteEntry::Deleted(deleted) => {
                let local = local_path_for(&self.root, &deleted.path_display)?;
                let _descendants = self.track_descendants(&local).await;
                remove_local(&local).await?;
                self.store.delete_by_path_lower(&deleted.path_lower).await?;
                info!(path = %deleted.path_display, "removed locally");
                Ok(())
            }
            RemoteEntry::Folder(_) => {
                let local = local_path_for(&self.root, entry.path_display())?;
                tokio::fs::create_dir_all(&local).await?;
                self.store
                    .write_entry(&StoredEntry::from_remote(&entry, true)?)
                    .await?;
                debug!(path = %entry.path_display(), "folder materialized");
                Ok(())
            }
            RemoteEntry::File(file) => self.materialize_file(file).await,
        }
    }
}

impl DownloadHandler {
    /// Tracks everything below a directory about to be removed, so the
    /// per-child deletes the watcher reports are not sent back upstream.
    async fn track_descendants(&self, local: &Path) -> Vec<TrackGuard> {
        let root = self.root.clone();
        let dir = local.to_path_buf();
        let keys = tokio::task::spawn_blocking(move || {
            WalkDir::new(&dir)
                .min_depth(1)
                .into_iter()
                .filter_map(Result::ok)
                .filter_map(|entry| tracker_key(&root, entry.path()).ok())
                .collect::<Vec<_>>()
        })
        .await
        .unwrap_or_default();
        keys.into_iter().map(|key| self.tracker.track(key)).collect()
    }

    async fn materialize_file(&self, file: RemoteFile) -> Result<(), SyncError> {
        let file = self.resolve_parent(file).await?;
        let target = local_path_for(&self.root, &file.path_display)?;
        let parent_exists = match target.parent() {
            Some(parent) => tokio::fs::metadata(parent)
                .await
                .map(|meta| meta.is_dir())
                .unwrap_or(false),
            None => false,
        };
        if !parent_exists {
            warn!(path = %file.path_display, "parent folder is missing locally, skipping");
            return Ok(());
        }

        match self.fetch(&file, &target).await {
            Ok(()) => {}
            Err(SyncError::Remote(RemoteError::NotFound)) => {
                self.store.delete_by_id(&file.id).await?;
                info!(path = %file.path_display, "gone on the remote, skipping");
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        let entry = RemoteEntry::File(file);
        self.store
            .write_entry(&StoredEntry::from_remote(&entry, true)?)
            .await?;
        info!(path = %entry.path_display(), size = entry.size(), "downloaded");
        Ok(())
    }

    /// The feed may report a path whose parent casing differs from the folder
    /// already on disk; the stored display path of the parent wins.
    async fn resolve_parent(&self, mut file: RemoteFile) -> Result<RemoteFile, SyncError> {
        let (parent, name) = split_parent(&file.path_display);
        if parent.is_empty() {
            return Ok(file);
        }
        let local_parent = local_path_for(&self.root, parent)?;
        if tokio::fs::metadata(&local_parent).await.is_ok() {
            return Ok(file);
        }

        let parent_lower = parent.to_lowercase();
        let Some(recorded) = self.store.find_by_path_lower(&parent_lower).await? else {
            return Ok(file);
        };
        let repaired = format!("{}/{}", recorded.path_display, name);
        if repaired != file.path_display {
            debug!(from = %file.path_display, to = %repaired, "repaired parent path");
            self.store
                .update_path(&file.id, &repaired, &file.path_lower)
                .await?;
            file.path_display = repaired;
        }
        Ok(file)
    }

    async fn fetch(&self, file: &RemoteFile, target: &Path) -> Result<(), SyncError> {
        let download = self.remote.download(&file.path_lower).await?;
        let expected = file.content_hash.clone().or(download.content_hash);
        let partial = partial_path(target);

        let written = write_stream(download.stream, &partial).await;
        let actual = match written {
            Ok(actual) => actual,
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(err);
            }
        };
        if let Some(expected) = expected
            && !expected.eq_ignore_ascii_case(&actual)
        {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(SyncError::HashMismatch {
                path: file.path_display.clone(),
                expected,
                actual,
            });
        }

        tokio::fs::rename(&partial, target).await?;
        set_modified(target, file.client_modified).await?;
        Ok(())
    }
}

async fn write_stream(
    mut stream: futures_util::stream::BoxStream<'static, Result<Vec<u8>, RemoteError>>,
    partial: &Path,
) -> Result<String, SyncError> {
    let mut out = tokio::fs::File::create(partial).await?;
    let mut hasher = ContentHasher::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        out.write_all(&chunk).await?;
    }
    out.flush().await?;
    out.sync_all().await?;
    Ok(hasher.finalize())
}

async fn set_modified(target: &Path, millis: i64) -> io::Result<()> {
    let Ok(offset) = u64::try_from(millis) else {
        return Ok(());
    };
    let modified = SystemTime::UNIX_EPOCH + Duration::from_millis(offset);
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(target)
        .await?
        .into_std()
        .await;
    tokio::task::spawn_blocking(move || file.set_modified(modified))
        .await
        .map_err(io::Error::other)?
}

async fn remove_local(path: &Path) -> io::Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    let result = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Remote-to-local side: takes feed batches, persists them and schedules the
/// work on its [`ChangeEngine`].
#[derive(Clone)]
pub struct DownloadPipeline {
    engine: ChangeEngine<DownloadHandler>,
}

impl DownloadPipeline {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        store: Arc<MetadataStore>,
        tracker: OperationTracker,
        root: PathBuf,
        config: EngineConfig,
    ) -> Self {
        let handler = DownloadHandler {
            remote,
            store,
            tracker: tracker.clone(),
            root,
        };
        Self {
            engine: ChangeEngine::new("download", handler, tracker, config),
        }
    }

    pub fn start(&self) -> Vec<JoinHandle<()>> {
        self.engine.start()
    }

    pub fn engine(&self) -> &ChangeEngine<DownloadHandler> {
        &self.engine
    }

    /// Runs one entry on the calling task, bypassing the queues.
    pub async fn process(&self, entry: RemoteEntry) -> Result<(), SyncError> {
        self.engine.handler().process(entry).await
    }

    pub async fn submit(&self, entry: RemoteEntry) -> Result<Scheduled, SyncError> {
        let handler = self.engine.handler();
        if self.engine.tracker().is_tracked(entry.path_lower()) {
            debug!(path = %entry.path_display(), "path is tracked, remote change dropped");
            return Ok(Scheduled::Suppressed);
        }
        if entry.is_delete() {
            return Ok(self.engine.schedule(entry));
        }

        let stored = handler.store.merge_remote(&entry).await?;
        if stored.materialized && self.is_present_locally(&stored).await {
            debug!(path = %entry.path_display(), "already materialized");
            return Ok(Scheduled::Suppressed);
        }
        Ok(self.engine.schedule(entry))
    }

    /// Resubmits everything recorded but not yet written locally.
    pub async fn download_all_unmaterialized(&self) -> Result<usize, SyncError> {
        let pending = self.engine.handler().store.list_unmaterialized().await?;
        let count = pending.len();
        for record in pending {
            self.engine.schedule(record.to_remote());
        }
        if count > 0 {
            info!(count, "resuming unmaterialized downloads");
        }
        Ok(count)
    }

    /// Only the kind is compared: a same-revision record whose local copy
    /// differs holds a local edit, which the upload side sends.
    async fn is_present_locally(&self, stored: &StoredEntry) -> bool {
        let root = &self.engine.handler().root;
        let Ok(local) = local_path_for(root, &stored.path_display) else {
            return false;
        };
        match (tokio::fs::metadata(&local).await, stored.rev.is_some()) {
            (Ok(meta), true) => meta.is_file(),
            (Ok(meta), false) => meta.is_dir(),
            (Err(_), _) => false,
        }
    }
}

#[async_trait]
impl ChangeSink for DownloadPipeline {
    async fn accept(&self, entries: Vec<RemoteEntry>) -> Result<(), SyncError> {
        for entry in entries {
            self.submit(entry).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "download_tests.rs"]
mod tests;
