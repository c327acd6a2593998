use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::{routing::get, Router};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use docvault::api;
use docvault_core::events::EventBus;
use docvault_core::folders::FolderGraph;
use docvault_core::indexer::{IndexFeed, IndexSink, IndexUpdate};
use docvault_core::versions::VersionStore;
use serde_json::{json, Value};
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tower::util::ServiceExt;

struct NullSink;

#[async_trait]
impl IndexSink for NullSink {
    async fn deliver(&self, _update: IndexUpdate) -> anyhow::Result<()> {
        Ok(())
    }
}

fn app(tempdir: &tempfile::TempDir) -> Router {
    let store = Arc::new(RwLock::new(
        VersionStore::new(tempdir.path().join("documents"), EventBus::new()).unwrap(),
    ));
    let folders = Arc::new(RwLock::new(
        FolderGraph::new(tempdir.path().join("folders")).unwrap(),
    ));
    let feed = Arc::new(IndexFeed::new(Arc::new(NullSink), store.clone()));
    Router::new()
        .merge(api::router(store, folders, feed))
        .route("/health", get(|| async { "OK" }))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let req = match body {
        Some(v) => builder.body(Body::from(v.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn server_health_endpoint() {
    let tempdir = tempfile::tempdir().unwrap();
    let app = app(&tempdir);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(axum::serve(listener, app.into_make_service()).into_future());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let resp = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap();
    assert!(resp.status().is_success());
    assert_eq!(resp.text().await.unwrap(), "OK");

    server.abort();
}

#[tokio::test]
async fn document_lifecycle_over_http() {
    let tempdir = tempfile::tempdir().unwrap();
    let app = app(&tempdir);

    let (status, doc) = send(
        &app,
        "POST",
        "/documents",
        Some(json!({
            "name": "handbook.md",
            "document_type": "Manual",
            "description": "employee handbook"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(doc["major_version"], 1);
    assert_eq!(doc["minor_version"], 0);
    let id = doc["id"].as_str().unwrap().to_string();
    let chain = doc["chain_id"].as_str().unwrap().to_string();

    let (status, v2) = send(
        &app,
        "POST",
        &format!("/documents/{id}/versions/major"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(v2["major_version"], 2);
    assert_eq!(v2["minor_version"], 0);

    // the superseded version can no longer be versioned from
    let (status, err) = send(
        &app,
        "POST",
        &format!("/documents/{id}/versions/minor"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["retryable"], false);

    let (status, history) = send(&app, "GET", &format!("/chains/{chain}/history"), None).await;
    assert_eq!(status, StatusCode::OK);
    let labels: Vec<(u64, u64)> = history
        .as_array()
        .unwrap()
        .iter()
        .map(|v| {
            (
                v["major_version"].as_u64().unwrap(),
                v["minor_version"].as_u64().unwrap(),
            )
        })
        .collect();
    assert_eq!(labels, vec![(1, 0), (2, 0)]);

    let (status, latest) = send(&app, "GET", &format!("/chains/{chain}/latest"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(latest["id"], v2["id"]);
}

#[tokio::test]
async fn validation_and_missing_ids_map_to_errors() {
    let tempdir = tempfile::tempdir().unwrap();
    let app = app(&tempdir);

    let (status, _) = send(
        &app,
        "POST",
        "/documents",
        Some(json!({ "name": "  ", "document_type": "Report" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let bogus = uuid::Uuid::new_v4();
    let (status, err) = send(&app, "GET", &format!("/documents/{bogus}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(err["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn upload_is_copy_on_write_across_versions() {
    let tempdir = tempfile::tempdir().unwrap();
    let app = app(&tempdir);

    let (_, doc) = send(
        &app,
        "POST",
        "/documents",
        Some(json!({ "name": "contract.pdf", "document_type": "Contract" })),
    )
    .await;
    let v1 = doc["id"].as_str().unwrap().to_string();

    let (status, row) = send(
        &app,
        "POST",
        &format!("/documents/{v1}/contents"),
        Some(json!({
            "name": "body.txt",
            "content_type": "text/plain",
            "data": BASE64.encode("first draft"),
            "is_primary": true
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let v1_content = row["id"].as_str().unwrap().to_string();

    let (_, v2) = send(
        &app,
        "POST",
        &format!("/documents/{v1}/versions/minor"),
        None,
    )
    .await;
    let v2_id = v2["id"].as_str().unwrap().to_string();

    // overwrite the shared slot on the new version
    let (status, _) = send(
        &app,
        "POST",
        &format!("/documents/{v2_id}/contents"),
        Some(json!({
            "name": "body.txt",
            "content_type": "text/plain",
            "data": BASE64.encode("second draft"),
            "is_primary": true
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    // the old version still serves the old bytes
    let req = Request::builder()
        .uri(format!("/contents/{v1_content}/download"))
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "text/plain"
    );
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"first draft");

    let (_, rows) = send(&app, "GET", &format!("/documents/{v2_id}/contents"), None).await;
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    let v2_content = rows[0]["id"].as_str().unwrap();

    let req = Request::builder()
        .uri(format!("/contents/{v2_content}/download"))
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"second draft");
}

#[tokio::test]
async fn folder_membership_follows_the_chain() {
    let tempdir = tempfile::tempdir().unwrap();
    let app = app(&tempdir);

    let (_, doc) = send(
        &app,
        "POST",
        "/documents",
        Some(json!({ "name": "notes.md", "document_type": "Article" })),
    )
    .await;
    let id = doc["id"].as_str().unwrap().to_string();
    let chain = doc["chain_id"].as_str().unwrap().to_string();

    let (_, folder) = send(&app, "POST", "/folders", Some(json!({ "name": "inbox" }))).await;
    let folder_id = folder["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        &app,
        "POST",
        &format!("/folders/{folder_id}/items/{chain}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // versioning does not move the document out of its folder
    let (_, _v2) = send(
        &app,
        "POST",
        &format!("/documents/{id}/versions/major"),
        None,
    )
    .await;

    let (status, items) = send(&app, "GET", &format!("/folders/{folder_id}/items"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(items.as_array().unwrap().len(), 1);
    assert_eq!(items[0].as_str().unwrap(), chain);

    let (status, containing) = send(&app, "GET", &format!("/items/{chain}/folders"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(containing[0].as_str().unwrap(), folder_id);
}

#[tokio::test]
async fn folder_cycles_rejected_over_http() {
    let tempdir = tempfile::tempdir().unwrap();
    let app = app(&tempdir);

    let (_, a) = send(&app, "POST", "/folders", Some(json!({ "name": "a" }))).await;
    let (_, b) = send(&app, "POST", "/folders", Some(json!({ "name": "b" }))).await;
    let a = a["id"].as_str().unwrap().to_string();
    let b = b["id"].as_str().unwrap().to_string();

    let (status, _) = send(&app, "POST", &format!("/folders/{a}/children/{b}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, err) = send(&app, "POST", &format!("/folders/{b}/children/{a}"), None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(err["error"].as_str().unwrap().contains("cycle"));
}
