use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::engine::{ChangeEngine, ChangeHandler, EngineConfig, Scheduled, SyncError};
use super::entry::{LocalEvent, LocalEventKind};
use super::paths::remote_path_for;
use super::remote::{RemoteError, RemoteStore, UploadRequest};
use super::store::{MetadataStore, StoredEntry};
use super::tracker::OperationTracker;
use super::watcher::LocalEventSink;

/// Pushes local changes to the remote store.
pub struct UploadHandler {
    remote: Arc<dyn RemoteStore>,
    store: Arc<MetadataStore>,
    tracker: OperationTracker,
    root: PathBuf,
}

#[async_trait]
impl ChangeHandler for UploadHandler {
    type Item = LocalEvent;

    fn is_file(&self, item: &LocalEvent) -> bool {
        item.is_file()
    }

    fn is_delete(&self, item: &LocalEvent) -> bool {
        item.kind == LocalEventKind::Delete
    }

    fn file_size(&self, item: &LocalEvent) -> u64 {
        item.size()
    }

    fn path_key(&self, item: &LocalEvent) -> String {
        match remote_path_for(&self.root, &item.path) {
            Ok(path) => path.to_lowercase(),
            Err(_) => item.path.to_string_lossy().to_lowercase(),
        }
    }

    async fn process(&self, event: LocalEvent) -> Result<(), SyncError> {
        let remote_path = remote_path_for(&self.root, &event.path)?;
        let key = remote_path.to_lowercase();
        let _guard = self.tracker.track(key.as_str());

        let metadata = match tokio::fs::symlink_metadata(&event.path).await {
            Ok(metadata) => Some(metadata),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        match metadata {
            None => self.delete_remote(&remote_path, &key).await,
            Some(metadata) if metadata.is_dir() => {
                if event.kind != LocalEventKind::Create {
                    debug!(path = %remote_path, "directory modify ignored");
                    return Ok(());
                }
                let folder = self.remote.create_folder(&remote_path).await?;
                self.store
                    .write_entry(&StoredEntry::from_remote(&folder, true)?)
                    .await?;
                info!(path = %remote_path, "folder created remotely");
                Ok(())
            }
            Some(metadata) => {
                self.upload_file(&event.path, remote_path, &key, &metadata)
                    .await
            }
        }
    }
}

impl UploadHandler {
    async fn delete_remote(&self, remote_path: &str, key: &str) -> Result<(), SyncError> {
        match self.remote.delete(remote_path).await {
            Ok(()) => info!(path = %remote_path, "deleted remotely"),
            Err(RemoteError::NotFound) => debug!(path = %remote_path, "already absent remotely"),
            Err(err) => return Err(err.into()),
        }
        self.store.delete_by_path_lower(key).await?;
        Ok(())
    }

    async fn upload_file(
        &self,
        local: &Path,
        remote_path: String,
        key: &str,
        metadata: &std::fs::Metadata,
    ) -> Result<(), SyncError> {
        let local_modified = modified_millis(metadata)?;
        let recorded = self.store.find_by_path_lower(key).await?;
        // Last writer wins: only replace the remote copy when it is older
        // than the local change; otherwise let the remote keep both.
        let overwrite = match &recorded {
            None => true,
            Some(record) => record
                .server_modified
                .is_none_or(|server_modified| server_modified < local_modified),
        };

        let file = tokio::fs::File::open(local).await?;
        let request = UploadRequest {
            path: remote_path,
            size: metadata.len(),
            client_modified: local_modified,
            overwrite,
        };
        let uploaded_path = request.path.clone();
        let result = self.remote.upload(request, file).await?;

        let materialized = result.path_lower() == key;
        self.store
            .write_entry(&StoredEntry::from_remote(&result, materialized)?)
            .await?;
        if materialized {
            info!(path = %uploaded_path, overwrite, "uploaded");
        } else {
            info!(
                path = %uploaded_path,
                stored_as = %result.path_display(),
                "uploaded as a renamed copy"
            );
        }
        Ok(())
    }
}

fn modified_millis(metadata: &std::fs::Metadata) -> io::Result<i64> {
    let modified = metadata.modified()?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).map_err(io::Error::other)?;
    Ok(since_epoch.as_millis() as i64)
}

/// Local-to-remote side, fed by the watcher.
#[derive(Clone)]
pub struct UploadPipeline {
    engine: ChangeEngine<UploadHandler>,
}

impl UploadPipeline {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        store: Arc<MetadataStore>,
        tracker: OperationTracker,
        root: PathBuf,
        config: EngineConfig,
    ) -> Self {
        let handler = UploadHandler {
            remote,
            store,
            tracker: tracker.clone(),
            root,
        };
        Self {
            engine: ChangeEngine::new("upload", handler, tracker, config),
        }
    }

    pub fn start(&self) -> Vec<JoinHandle<()>> {
        self.engine.start()
    }

    pub fn engine(&self) -> &ChangeEngine<UploadHandler> {
        &self.engine
    }

    pub fn schedule(&self, event: LocalEvent) -> Scheduled {
        self.engine.schedule(event)
    }

    /// Runs one event on the calling task, bypassing the queues.
    pub async fn process(&self, event: LocalEvent) -> Result<(), SyncError> {
        self.engine.handler().process(event).await
    }
}

impl LocalEventSink for UploadPipeline {
    fn forward(&self, event: LocalEvent) {
        self.schedule(event);
    }
}

#[cfg(test)]
#[path = "upload_tests.rs"]
mod tests;
