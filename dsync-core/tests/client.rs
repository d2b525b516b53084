use dsync_core::{DropboxClient, Metadata, UploadArg, WriteMode};
use futures_util::StreamExt;
use serde_json::json;
use wiremock::matchers::{body_json, body_partial_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn file_json(path_display: &str, rev: &str, size: u64) -> serde_json::Value {
    json!({
        ".tag": "file",
        "name": path_display.rsplit('/').next().unwrap_or_default(),
        "id": format!("id:{rev}"),
        "path_lower": path_display.to_lowercase(),
        "path_display": path_display,
        "rev": rev,
        "size": size,
        "client_modified": "2024-01-01T00:00:00Z",
        "server_modified": "2024-01-01T00:00:05Z"
    })
}

#[tokio::test]
async fn get_current_account_sends_bearer_token() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/users/get_current_account"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "account_id": "dbid:1",
            "name": { "display_name": "Ada Lovelace" },
            "email": "ada@example.com"
        })))
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let account = client.get_current_account().await.unwrap();

    assert_eq!(account.name.display_name, "Ada Lovelace");
    assert_eq!(account.email.as_deref(), Some("ada@example.com"));
}

#[tokio::test]
async fn get_space_usage_parses_allocation() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/users/get_space_usage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "used": 1024,
            "allocation": { ".tag": "individual", "allocated": 2048 }
        })))
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let usage = client.get_space_usage().await.unwrap();

    assert_eq!(usage.used, 1024);
    assert_eq!(usage.allocation.allocated, 2048);
}

#[tokio::test]
async fn list_folder_is_recursive_from_root() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/list_folder"))
        .and(body_json(json!({ "path": "", "recursive": true })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [
                { ".tag": "folder", "name": "A", "id": "id:a", "path_lower": "/a", "path_display": "/A" },
                file_json("/A/b.txt", "015", 3)
            ],
            "cursor": "c1",
            "has_more": true
        })))
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let page = client.list_folder("", true).await.unwrap();

    assert_eq!(page.cursor, "c1");
    assert!(page.has_more);
    assert_eq!(page.entries.len(), 2);
    assert!(matches!(page.entries[0], Metadata::Folder(_)));
    assert!(matches!(page.entries[1], Metadata::File(ref f) if f.size == 3));
}

#[tokio::test]
async fn list_folder_continue_sends_cursor() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/list_folder/continue"))
        .and(body_json(json!({ "cursor": "c1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [
                { ".tag": "deleted", "name": "b.txt", "path_lower": "/a/b.txt", "path_display": "/A/b.txt" }
            ],
            "cursor": "c2",
            "has_more": false
        })))
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let page = client.list_folder_continue("c1").await.unwrap();

    assert_eq!(page.cursor, "c2");
    assert!(!page.has_more);
    assert!(matches!(page.entries[0], Metadata::Deleted(_)));
}

#[tokio::test]
async fn longpoll_omits_authorization_header() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/list_folder/longpoll"))
        .and(body_json(json!({ "cursor": "c2", "timeout": 30 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "changes": false,
            "backoff": 5
        })))
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let result = client.list_folder_longpoll("c2", 30).await.unwrap();

    assert!(!result.changes);
    assert_eq!(result.backoff, Some(5));

    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].headers.get("authorization").is_none());
}

#[tokio::test]
async fn get_latest_cursor_returns_cursor() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/list_folder/get_latest_cursor"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "cursor": "latest" })))
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    assert_eq!(client.get_latest_cursor("", true).await.unwrap(), "latest");
}

#[tokio::test]
async fn download_streams_body_and_parses_result_header() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/download"))
        .and(header("dropbox-api-arg", r#"{"path":"/A/b.txt"}"#))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(
                    "dropbox-api-result",
                    file_json("/A/b.txt", "015", 5).to_string().as_str(),
                )
                .set_body_bytes(b"hello".to_vec()),
        )
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let download = client.download("/A/b.txt").await.unwrap();
    assert_eq!(download.metadata.as_ref().map(|m| m.size), Some(5));

    let mut stream = download.into_stream();
    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        body.extend(chunk.unwrap());
    }
    assert_eq!(body, b"hello");
}

#[tokio::test]
async fn download_missing_path_is_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/download"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error_summary": "path/not_found/..",
            "error": { ".tag": "path", "path": { ".tag": "not_found" } }
        })))
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client.download("/gone.txt").await.err().unwrap();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn upload_sends_mode_in_header_and_raw_body() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/upload"))
        .and(header("content-type", "application/octet-stream"))
        .and(header_exists("dropbox-api-arg"))
        .respond_with(|request: &Request| {
            let arg: serde_json::Value = serde_json::from_str(
                request
                    .headers
                    .get("dropbox-api-arg")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default(),
            )
            .unwrap();
            assert_eq!(arg["mode"], "add");
            assert_eq!(arg["autorename"], true);
            assert_eq!(arg["client_modified"], "2024-01-01T00:00:00Z");
            assert_eq!(request.body, b"payload");
            ResponseTemplate::new(200).set_body_json(file_json("/A/b (1).txt", "016", 7))
        })
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let arg = UploadArg {
        path: "/A/b.txt".into(),
        mode: WriteMode::Add,
        autorename: true,
        client_modified: Some("2024-01-01T00:00:00Z".into()),
        mute: true,
    };
    let result = client.upload(&arg, b"payload".to_vec()).await.unwrap();

    assert_eq!(result.path_lower.as_deref(), Some("/a/b (1).txt"));
    assert_eq!(result.rev, "016");
}

#[tokio::test]
async fn create_folder_unwraps_metadata() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/create_folder_v2"))
        .and(body_partial_json(json!({ "path": "/New" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "metadata": { "name": "New", "id": "id:new", "path_lower": "/new", "path_display": "/New" }
        })))
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let folder = client.create_folder("/New").await.unwrap();

    assert_eq!(folder.id, "id:new");
    assert_eq!(folder.path_display.as_deref(), Some("/New"));
}

#[tokio::test]
async fn delete_reports_not_found_distinctly() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/delete_v2"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error_summary": "path_lookup/not_found/."
        })))
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client.delete("/missing").await.unwrap_err();

    assert!(err.is_not_found());
    assert!(!err.is_retryable());
}
