use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::{Body, Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_API_URL: &str = "https://api.dropboxapi.com";
const DEFAULT_CONTENT_URL: &str = "https://content.dropboxapi.com";
const DEFAULT_NOTIFY_URL: &str = "https://notify.dropboxapi.com";
const API_ARG_HEADER: &str = "Dropbox-API-Arg";
const API_RESULT_HEADER: &str = "Dropbox-API-Result";

#[derive(Debug, Error)]
pub enum DropboxError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// HTTP client for the three Dropbox v2 hosts: RPC (`api`), content transfer
/// (`content`) and change notification (`notify`).
#[derive(Clone)]
pub struct DropboxClient {
    http: Client,
    api_url: Url,
    content_url: Url,
    notify_url: Url,
    token: String,
}

impl DropboxClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DropboxError> {
        Self::with_base_urls(
            DEFAULT_API_URL,
            DEFAULT_CONTENT_URL,
            DEFAULT_NOTIFY_URL,
            token,
        )
    }

    /// Points every host at the same base url; used against local mock servers.
    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DropboxError> {
        Self::with_base_urls(base_url, base_url, base_url, token)
    }

    pub fn with_base_urls(
        api_url: &str,
        content_url: &str,
        notify_url: &str,
        token: impl Into<String>,
    ) -> Result<Self, DropboxError> {
        Ok(Self {
            http: Client::new(),
            api_url: Url::parse(api_url)?,
            content_url: Url::parse(content_url)?,
            notify_url: Url::parse(notify_url)?,
            token: token.into(),
        })
    }

    pub async fn get_current_account(&self) -> Result<Account, DropboxError> {
        let url = self.api_url.join("/2/users/get_current_account")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn get_space_usage(&self) -> Result<SpaceUsage, DropboxError> {
        let url = self.api_url.join("/2/users/get_space_usage")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn get_latest_cursor(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<String, DropboxError> {
        let payload: CursorResponse = self
            .rpc(
                "/2/files/list_folder/get_latest_cursor",
                &ListFolderArg { path, recursive },
            )
            .await?;
        Ok(payload.cursor)
    }

    pub async fn list_folder(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<ListFolderResult, DropboxError> {
        self.rpc("/2/files/list_folder", &ListFolderArg { path, recursive })
            .await
    }

    pub async fn list_folder_continue(
        &self,
        cursor: &str,
    ) -> Result<ListFolderResult, DropboxError> {
        self.rpc("/2/files/list_folder/continue", &CursorArg { cursor })
            .await
    }

    /// Blocks server-side for up to `timeout_secs` waiting for changes after
    /// `cursor`. The notify host does not accept an Authorization header.
    pub async fn list_folder_longpoll(
        &self,
        cursor: &str,
        timeout_secs: u64,
    ) -> Result<LongPollResult, DropboxError> {
        let url = self.notify_url.join("/2/files/list_folder/longpoll")?;
        let response = self
            .http
            .post(url)
            .json(&LongPollArg {
                cursor,
                timeout: timeout_secs,
            })
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn download(&self, path: &str) -> Result<Download, DropboxError> {
        let url = self.content_url.join("/2/files/download")?;
        let arg = header_safe_json(&PathArg { path })?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .header(API_ARG_HEADER, arg)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let metadata = response
            .headers()
            .get(API_RESULT_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(serde_json::from_str::<FileMetadata>)
            .transpose()?;
        Ok(Download { metadata, response })
    }

    pub async fn upload(
        &self,
        arg: &UploadArg,
        body: impl Into<Body>,
    ) -> Result<FileMetadata, DropboxError> {
        let url = self.content_url.join("/2/files/upload")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .header(API_ARG_HEADER, header_safe_json(arg)?)
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn create_folder(&self, path: &str) -> Result<FolderMetadata, DropboxError> {
        let payload: FolderResult = self
            .rpc(
                "/2/files/create_folder_v2",
                &CreateFolderArg {
                    path,
                    autorename: false,
                },
            )
            .await?;
        Ok(payload.metadata)
    }

    pub async fn delete(&self, path: &str) -> Result<Metadata, DropboxError> {
        let payload: DeleteResult = self.rpc("/2/files/delete_v2", &PathArg { path }).await?;
        Ok(payload.metadata)
    }

    async fn rpc<A, T>(&self, endpoint: &str, arg: &A) -> Result<T, DropboxError>
    where
        A: Serialize + ?Sized,
        T: serde::de::DeserializeOwned,
    {
        let url = self.api_url.join(endpoint)?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(arg)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DropboxError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> DropboxError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        DropboxError::Api { status, body }
    }
}

impl DropboxError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DropboxError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            DropboxError::Request(err) => err.is_timeout() || err.is_connect(),
            _ => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
        }
    }

    /// Route errors come back as 409 with an `error_summary` such as
    /// `path_lookup/not_found/..` or `path/not_found/`.
    pub fn is_not_found(&self) -> bool {
        match self {
            DropboxError::Api { status, body } => {
                *status == StatusCode::CONFLICT && body.contains("not_found")
            }
            _ => false,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// HTTP headers must stay ASCII, so everything outside printable ASCII is
/// written as a `\uXXXX` escape (surrogate pairs above the BMP).
fn header_safe_json<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let raw = serde_json::to_string(value)?;
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii() && ch != '\x7f' {
            out.push(ch);
            continue;
        }
        let mut units = [0u16; 2];
        for unit in ch.encode_utf16(&mut units) {
            out.push_str(&format!("\\u{unit:04x}"));
        }
    }
    Ok(out)
}

/// A started download: the file metadata from the `Dropbox-API-Result`
/// header and the still-unread body.
pub struct Download {
    pub metadata: Option<FileMetadata>,
    response: reqwest::Response,
}

impl Download {
    pub fn into_stream(self) -> BoxStream<'static, Result<Vec<u8>, DropboxError>> {
        self.response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(DropboxError::from))
            .boxed()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = ".tag", rename_all = "lowercase")]
pub enum Metadata {
    File(FileMetadata),
    Folder(FolderMetadata),
    Deleted(DeletedMetadata),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct FileMetadata {
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub path_lower: Option<String>,
    #[serde(default)]
    pub path_display: Option<String>,
    pub rev: String,
    pub size: u64,
    pub client_modified: String,
    pub server_modified: String,
    #[serde(default)]
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct FolderMetadata {
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub path_lower: Option<String>,
    #[serde(default)]
    pub path_display: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeletedMetadata {
    pub name: String,
    #[serde(default)]
    pub path_lower: Option<String>,
    #[serde(default)]
    pub path_display: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ListFolderResult {
    pub entries: Vec<Metadata>,
    pub cursor: String,
    pub has_more: bool,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct LongPollResult {
    pub changes: bool,
    #[serde(default)]
    pub backoff: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Account {
    pub account_id: String,
    pub name: AccountName,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AccountName {
    pub display_name: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SpaceUsage {
    pub used: u64,
    pub allocation: SpaceAllocation,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SpaceAllocation {
    #[serde(default)]
    pub allocated: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    Add,
    Overwrite,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadArg {
    pub path: String,
    pub mode: WriteMode,
    pub autorename: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_modified: Option<String>,
    pub mute: bool,
}

#[derive(Serialize)]
struct PathArg<'a> {
    path: &'a str,
}

#[derive(Serialize)]
struct ListFolderArg<'a> {
    path: &'a str,
    recursive: bool,
}

#[derive(Serialize)]
struct CursorArg<'a> {
    cursor: &'a str,
}

#[derive(Serialize)]
struct LongPollArg<'a> {
    cursor: &'a str,
    timeout: u64,
}

#[derive(Serialize)]
struct CreateFolderArg<'a> {
    path: &'a str,
    autorename: bool,
}

#[derive(Deserialize)]
struct CursorResponse {
    cursor: String,
}

#[derive(Deserialize)]
struct FolderResult {
    metadata: FolderMetadata,
}

#[derive(Deserialize)]
struct DeleteResult {
    metadata: Metadata,
}
