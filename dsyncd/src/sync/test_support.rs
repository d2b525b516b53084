use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::io::AsyncReadExt;

use super::content_hash::ContentHasher;
use super::entry::{RemoteEntry, RemoteFile, RemoteFolder};
use super::remote::{ChangePage, PollOutcome, RemoteDownload, RemoteError, RemoteStore, UploadRequest};
use super::store::MetadataStore;

pub async fn memory_store() -> Arc<MetadataStore> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = MetadataStore::from_pool(pool);
    store.init().await.unwrap();
    Arc::new(store)
}

pub fn remote_file(id: &str, path_display: &str, rev: &str, content: &[u8]) -> RemoteFile {
    RemoteFile {
        id: id.into(),
        path_display: path_display.into(),
        path_lower: path_display.to_lowercase(),
        rev: rev.into(),
        size: content.len() as u64,
        server_modified: 1_700_000_000_000,
        client_modified: 1_600_000_000_000,
        content_hash: None,
    }
}

pub fn remote_folder(id: &str, path_display: &str) -> RemoteEntry {
    RemoteEntry::Folder(RemoteFolder {
        id: id.into(),
        path_display: path_display.into(),
        path_lower: path_display.to_lowercase(),
    })
}

pub fn hash_of(content: &[u8]) -> String {
    let mut hasher = ContentHasher::new();
    hasher.update(content);
    hasher.finalize()
}

#[derive(Debug, Clone)]
pub struct UploadCall {
    pub request: UploadRequest,
    pub content: Vec<u8>,
}

/// In-memory remote. Objects are keyed by lower-cased path; change pages and
/// poll outcomes are scripted by the test.
#[derive(Default)]
pub struct FakeRemote {
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
    pub hashes: Mutex<HashMap<String, String>>,
    pub pages: Mutex<VecDeque<Result<ChangePage, RemoteError>>>,
    pub polls: Mutex<VecDeque<Result<PollOutcome, RemoteError>>>,
    pub uploads: Mutex<Vec<UploadCall>>,
    pub folders: Mutex<Vec<String>>,
    pub deletes: Mutex<Vec<String>>,
    pub downloads: Mutex<Vec<String>>,
    pub rename_uploads_to: Mutex<Option<String>>,
    pub revs: Mutex<u32>,
}

impl FakeRemote {
    pub fn put(&self, path: &str, content: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(path.to_lowercase(), content.to_vec());
    }

    pub fn push_page(&self, entries: Vec<RemoteEntry>, cursor: &str, has_more: bool) {
        self.pages.lock().unwrap().push_back(Ok(ChangePage {
            entries,
            cursor: cursor.into(),
            has_more,
        }));
    }

    pub fn upload_calls(&self) -> Vec<UploadCall> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn list_folder(&self, _path: &str, _recursive: bool) -> Result<ChangePage, RemoteError> {
        self.pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(RemoteError::Unexpected("no scripted page".into())))
    }

    async fn list_changes(&self, cursor: &str) -> Result<ChangePage, RemoteError> {
        self.pages.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(ChangePage {
                entries: Vec::new(),
                cursor: cursor.into(),
                has_more: false,
            })
        })
    }

    async fn long_poll(&self, _cursor: &str) -> Result<PollOutcome, RemoteError> {
        self.polls.lock().unwrap().pop_front().unwrap_or(Ok(PollOutcome {
            changed: false,
            backoff: None,
        }))
    }

    async fn download(&self, path: &str) -> Result<RemoteDownload, RemoteError> {
        self.downloads.lock().unwrap().push(path.to_string());
        let key = path.to_lowercase();
        let content = self
            .objects
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or(RemoteError::NotFound)?;
        let content_hash = self.hashes.lock().unwrap().get(&key).cloned();
        let chunks: Vec<Result<Vec<u8>, RemoteError>> =
            content.chunks(3).map(|chunk| Ok(chunk.to_vec())).collect();
        Ok(RemoteDownload {
            content_hash,
            stream: futures_util::stream::iter(chunks).boxed(),
        })
    }

    async fn upload(
        &self,
        request: UploadRequest,
        mut file: tokio::fs::File,
    ) -> Result<RemoteEntry, RemoteError> {
        let mut content = Vec::new();
        file.read_to_end(&mut content)
            .await
            .map_err(|err| RemoteError::Unexpected(err.to_string()))?;
        let stored_path = self
            .rename_uploads_to
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| request.path.clone());
        self.put(&stored_path, &content);
        let rev = {
            let mut revs = self.revs.lock().unwrap();
            *revs += 1;
            format!("{:04x}", *revs)
        };
        self.uploads.lock().unwrap().push(UploadCall {
            request: request.clone(),
            content: content.clone(),
        });
        Ok(RemoteEntry::File(RemoteFile {
            id: format!("id:{}", stored_path.to_lowercase()),
            path_display: stored_path.clone(),
            path_lower: stored_path.to_lowercase(),
            rev,
            size: content.len() as u64,
            server_modified: request.client_modified + 1_000,
            client_modified: request.client_modified,
            content_hash: Some(hash_of(&content)),
        }))
    }

    async fn create_folder(&self, path: &str) -> Result<RemoteEntry, RemoteError> {
        self.folders.lock().unwrap().push(path.to_string());
        Ok(remote_folder(&format!("id:{}", path.to_lowercase()), path))
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        self.deletes.lock().unwrap().push(path.to_string());
        let removed = self.objects.lock().unwrap().remove(&path.to_lowercase());
        match removed {
            Some(_) => Ok(()),
            None => Err(RemoteError::NotFound),
        }
    }
}
