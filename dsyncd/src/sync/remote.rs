use std::time::Duration;

use async_trait::async_trait;
use dsync_core::{DropboxClient, DropboxError, Metadata, UploadArg, WriteMode};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use thiserror::Error;
use tokio_util::io::ReaderStream;

use super::entry::{EntryError, RemoteEntry, format_millis};

pub const LONGPOLL_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote path not found")]
    NotFound,
    #[error("api error: {0}")]
    Api(DropboxError),
    #[error("entry error: {0}")]
    Entry(#[from] EntryError),
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

impl From<DropboxError> for RemoteError {
    fn from(err: DropboxError) -> Self {
        if err.is_not_found() {
            RemoteError::NotFound
        } else {
            RemoteError::Api(err)
        }
    }
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangePage {
    pub entries: Vec<RemoteEntry>,
    pub cursor: String,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    pub changed: bool,
    pub backoff: Option<Duration>,
}

pub struct RemoteDownload {
    pub content_hash: Option<String>,
    pub stream: BoxStream<'static, Result<Vec<u8>, RemoteError>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub path: String,
    pub size: u64,
    /// Unix milliseconds.
    pub client_modified: i64,
    pub overwrite: bool,
}

/// The remote side as seen by the pipelines and the change feed.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    async fn list_folder(&self, path: &str, recursive: bool) -> Result<ChangePage, RemoteError>;
    async fn list_changes(&self, cursor: &str) -> Result<ChangePage, RemoteError>;
    async fn long_poll(&self, cursor: &str) -> Result<PollOutcome, RemoteError>;
    async fn download(&self, path: &str) -> Result<RemoteDownload, RemoteError>;
    async fn upload(
        &self,
        request: UploadRequest,
        file: tokio::fs::File,
    ) -> Result<RemoteEntry, RemoteError>;
    async fn create_folder(&self, path: &str) -> Result<RemoteEntry, RemoteError>;
    async fn delete(&self, path: &str) -> Result<(), RemoteError>;
}

fn page_from(result: dsync_core::ListFolderResult) -> Result<ChangePage, RemoteError> {
    let entries = result
        .entries
        .into_iter()
        .map(RemoteEntry::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ChangePage {
        entries,
        cursor: result.cursor,
        has_more: result.has_more,
    })
}

#[async_trait]
impl RemoteStore for DropboxClient {
    async fn list_folder(&self, path: &str, recursive: bool) -> Result<ChangePage, RemoteError> {
        page_from(DropboxClient::list_folder(self, path, recursive).await?)
    }

    async fn list_changes(&self, cursor: &str) -> Result<ChangePage, RemoteError> {
        page_from(self.list_folder_continue(cursor).await?)
    }

    async fn long_poll(&self, cursor: &str) -> Result<PollOutcome, RemoteError> {
        let result = self
            .list_folder_longpoll(cursor, LONGPOLL_TIMEOUT_SECS)
            .await?;
        Ok(PollOutcome {
            changed: result.changes,
            backoff: result.backoff.map(Duration::from_secs),
        })
    }

    async fn download(&self, path: &str) -> Result<RemoteDownload, RemoteError> {
        let download = DropboxClient::download(self, path).await?;
        let content_hash = download
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.content_hash.clone());
        let stream = download
            .into_stream()
            .map(|chunk| chunk.map_err(RemoteError::from))
            .boxed();
        Ok(RemoteDownload {
            content_hash,
            stream,
        })
    }

    async fn upload(
        &self,
        request: UploadRequest,
        file: tokio::fs::File,
    ) -> Result<RemoteEntry, RemoteError> {
        let arg = UploadArg {
            path: request.path,
            mode: if request.overwrite {
                WriteMode::Overwrite
            } else {
                WriteMode::Add
            },
            autorename: !request.overwrite,
            client_modified: Some(format_millis(request.client_modified)?),
            mute: true,
        };
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let metadata = DropboxClient::upload(self, &arg, body).await?;
        Ok(RemoteEntry::try_from(Metadata::File(metadata))?)
    }

    async fn create_folder(&self, path: &str) -> Result<RemoteEntry, RemoteError> {
        let metadata = DropboxClient::create_folder(self, path).await?;
        Ok(RemoteEntry::try_from(Metadata::Folder(metadata))?)
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        DropboxClient::delete(self, path).await?;
        Ok(())
    }
}
