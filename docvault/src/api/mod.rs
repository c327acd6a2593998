//! HTTP API layer over the version, content and folder stores.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use docvault_core::errors::StoreError;
use docvault_core::folders::{Folder, FolderGraph, HierarchyEntry, NewFolder};
use docvault_core::indexer::IndexFeed;
use docvault_core::model::{
    Content, ContentUpload, FileStore, FileStoreStatus, MetadataPatch, NewDocument, StorageKind,
    SysObject,
};
use docvault_core::versions::VersionStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RwLock<VersionStore>>,
    pub folders: Arc<RwLock<FolderGraph>>,
    pub feed: Arc<IndexFeed>,
}

/// Store error carried out to the wire with an appropriate status.
pub struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StoreError::Validation(_) => StatusCode::BAD_REQUEST,
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::NotLatestVersion { .. } => StatusCode::CONFLICT,
            StoreError::ConcurrentVersionConflict { .. } => StatusCode::CONFLICT,
            StoreError::Cycle { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            StoreError::InvalidFileStore { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            StoreError::StorageIo(_) | StoreError::Corrupt(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = json!({
            "error": self.0.to_string(),
            "retryable": self.0.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}

pub fn router(
    store: Arc<RwLock<VersionStore>>,
    folders: Arc<RwLock<FolderGraph>>,
    feed: Arc<IndexFeed>,
) -> Router {
    let state = AppState {
        store,
        folders,
        feed,
    };
    Router::new()
        .route("/documents", post(create_document))
        .route(
            "/documents/{id}",
            get(get_document).patch(update_document).delete(delete_document),
        )
        .route("/documents/{id}/versions/major", post(create_major))
        .route("/documents/{id}/versions/minor", post(create_minor))
        .route(
            "/documents/{id}/contents",
            get(list_contents).post(upload_content),
        )
        .route("/contents/{id}", get(get_content))
        .route("/contents/{id}/download", get(download_content))
        .route("/chains/{id}/history", get(chain_history))
        .route("/chains/{id}/latest", get(chain_latest))
        .route("/filestores", get(list_file_stores).post(register_file_store))
        .route("/filestores/{id}/status", put(set_file_store_status))
        .route("/folders", post(create_folder))
        .route("/folders/root", get(root_folders))
        .route("/folders/{id}", get(get_folder).delete(delete_folder))
        .route("/folders/{id}/hierarchy", get(folder_hierarchy))
        .route("/folders/{id}/children/{child}", post(link_child).delete(unlink_child))
        .route(
            "/folders/{id}/items/{item}",
            post(file_item).delete(unfile_item),
        )
        .route("/folders/{id}/items", get(folder_items))
        .route("/items/{id}/folders", get(folders_containing))
        .route("/reindex", post(reindex))
        .with_state(state)
}

async fn create_document(
    State(state): State<AppState>,
    Json(req): Json<NewDocument>,
) -> Result<(StatusCode, Json<SysObject>), ApiError> {
    let obj = state.store.write().await.create_document(req)?;
    Ok((StatusCode::CREATED, Json(obj)))
}

async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SysObject>, ApiError> {
    let store = state.store.read().await;
    let obj = store
        .get(id)
        .cloned()
        .ok_or(StoreError::not_found("version", id))?;
    Ok(Json(obj))
}

async fn update_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<MetadataPatch>,
) -> Result<Json<SysObject>, ApiError> {
    let obj = state.store.write().await.update_metadata(id, patch)?;
    Ok(Json(obj))
}

async fn delete_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.store.write().await.delete_version(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_major(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<SysObject>), ApiError> {
    let obj = state.store.write().await.create_major_version(id)?;
    Ok((StatusCode::CREATED, Json(obj)))
}

async fn create_minor(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<SysObject>), ApiError> {
    let obj = state.store.write().await.create_minor_version(id)?;
    Ok((StatusCode::CREATED, Json(obj)))
}

#[derive(Deserialize)]
struct UploadRequest {
    name: String,
    content_type: Option<String>,
    /// Payload bytes, base64-encoded.
    data: String,
    storage: Option<StorageKind>,
    file_store_id: Option<Uuid>,
    #[serde(default)]
    is_primary: bool,
    #[serde(default)]
    is_indexable: bool,
}

async fn upload_content(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UploadRequest>,
) -> Result<(StatusCode, Json<Content>), ApiError> {
    let bytes = BASE64
        .decode(req.data.as_bytes())
        .map_err(|e| StoreError::Validation(format!("data is not valid base64: {e}")))?;
    let upload = ContentUpload {
        name: req.name,
        content_type: req.content_type,
        bytes: bytes.into(),
        storage: req.storage.unwrap_or(StorageKind::Database),
        file_store_id: req.file_store_id,
        is_primary: req.is_primary,
        is_indexable: req.is_indexable,
    };
    let row = state.store.write().await.attach_content(id, upload)?;
    Ok((StatusCode::CREATED, Json(row)))
}

async fn list_contents(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Content>>, ApiError> {
    let rows = state.store.read().await.contents_for(id)?;
    Ok(Json(rows))
}

async fn get_content(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Content>, ApiError> {
    let store = state.store.read().await;
    let row = store.content(id)?.clone();
    Ok(Json(row))
}

async fn download_content(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let store = state.store.read().await;
    let row = store.content(id)?;
    let content_type = row
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let bytes = store.content_bytes(id)?;
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

async fn chain_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<SysObject>>, ApiError> {
    let history = state.store.read().await.version_history(id)?;
    Ok(Json(history))
}

async fn chain_latest(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SysObject>, ApiError> {
    let store = state.store.read().await;
    let obj = store.latest_of_chain(id)?.clone();
    Ok(Json(obj))
}

#[derive(Deserialize)]
struct FileStoreRequest {
    name: String,
    root_path: PathBuf,
}

async fn register_file_store(
    State(state): State<AppState>,
    Json(req): Json<FileStoreRequest>,
) -> Result<(StatusCode, Json<FileStore>), ApiError> {
    let store = FileStore {
        id: Uuid::new_v4(),
        name: req.name,
        root_path: req.root_path,
        status: FileStoreStatus::Active,
    };
    state
        .store
        .write()
        .await
        .content_store_mut()
        .register_file_store(store.clone())?;
    Ok((StatusCode::CREATED, Json(store)))
}

async fn list_file_stores(
    State(state): State<AppState>,
) -> Result<Json<Vec<FileStore>>, ApiError> {
    let store = state.store.read().await;
    let stores: Vec<FileStore> = store.content_store().file_stores().cloned().collect();
    Ok(Json(stores))
}

#[derive(Deserialize)]
struct StatusRequest {
    status: FileStoreStatus,
}

async fn set_file_store_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<StatusRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .write()
        .await
        .content_store_mut()
        .set_file_store_status(id, req.status)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_folder(
    State(state): State<AppState>,
    Json(req): Json<NewFolder>,
) -> Result<(StatusCode, Json<Folder>), ApiError> {
    let folder = state.folders.write().await.create_folder(req)?;
    Ok((StatusCode::CREATED, Json(folder)))
}

async fn get_folder(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Folder>, ApiError> {
    let folders = state.folders.read().await;
    let folder = folders
        .get(id)
        .cloned()
        .ok_or(StoreError::not_found("folder", id))?;
    Ok(Json(folder))
}

async fn delete_folder(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.folders.write().await.delete_folder(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn root_folders(State(state): State<AppState>) -> Json<Vec<Folder>> {
    let folders = state.folders.read().await;
    Json(folders.root_folders().into_iter().cloned().collect())
}

async fn folder_hierarchy(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<HierarchyEntry>>, ApiError> {
    let entries = state.folders.read().await.folder_hierarchy(id)?;
    Ok(Json(entries))
}

async fn link_child(
    State(state): State<AppState>,
    Path((id, child)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state.folders.write().await.add_child_folder(id, child)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unlink_child(
    State(state): State<AppState>,
    Path((id, child)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state.folders.write().await.remove_child_folder(id, child)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn file_item(
    State(state): State<AppState>,
    Path((id, item)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state.folders.write().await.add_item(id, item)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unfile_item(
    State(state): State<AppState>,
    Path((id, item)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state.folders.write().await.remove_item(id, item)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn folder_items(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BTreeSet<Uuid>>, ApiError> {
    let items = state.folders.read().await.folder_items(id)?;
    Ok(Json(items))
}

async fn folders_containing(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Json<Vec<Uuid>> {
    let folders = state.folders.read().await;
    Json(folders.folders_containing(id))
}

#[derive(Serialize)]
struct ReindexResponse {
    delivered: usize,
}

async fn reindex(State(state): State<AppState>) -> Json<ReindexResponse> {
    let delivered = state.feed.reindex_all().await;
    Json(ReindexResponse { delivered })
}
