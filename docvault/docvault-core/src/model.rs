//! Shared entity definitions for the version, content and folder stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use uuid::Uuid;

/// Kind of document carried by a version chain.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum DocumentType {
    Report,
    Manual,
    Article,
    Specification,
    Contract,
    Presentation,
    Other,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Report => "Report",
            DocumentType::Manual => "Manual",
            DocumentType::Article => "Article",
            DocumentType::Specification => "Specification",
            DocumentType::Contract => "Contract",
            DocumentType::Presentation => "Presentation",
            DocumentType::Other => "Other",
        }
    }
}

/// One version row. A "document" colloquially is the chain of rows sharing
/// a `chain_id`; each row is immutable in its identity fields once
/// superseded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SysObject {
    pub id: Uuid,
    pub chain_id: Uuid,
    pub name: String,
    pub document_type: DocumentType,
    pub description: Option<String>,
    pub keywords: Option<String>,
    pub tags: BTreeSet<String>,
    pub author: Option<String>,
    /// Free-form extension attributes; order irrelevant, kept sorted for
    /// stable serialization.
    pub extra: BTreeMap<String, String>,
    pub major_version: u32,
    pub minor_version: u32,
    pub parent_version_id: Option<Uuid>,
    pub is_latest_version: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl SysObject {
    pub fn version_label(&self) -> String {
        format!("{}.{}", self.major_version, self.minor_version)
    }
}

/// Fields accepted when allocating a new chain.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewDocument {
    pub name: String,
    pub document_type: Option<DocumentType>,
    pub description: Option<String>,
    pub keywords: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub author: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

/// Metadata patch applied to the latest version of a chain.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MetadataPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub keywords: Option<String>,
    pub tags: Option<BTreeSet<String>>,
    pub author: Option<String>,
    pub extra: Option<BTreeMap<String, String>>,
}

/// Where payload bytes physically live.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum StorageKind {
    Database,
    FileStore,
}

/// Opaque reference to a reference-counted payload.
#[derive(
    Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct PayloadId(pub Uuid);

impl PayloadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PayloadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PayloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One content association: a named slot on a version pointing at a
/// payload. The payload may be shared with sibling versions until a
/// mutating upload triggers copy-on-write.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Content {
    pub id: Uuid,
    pub name: String,
    pub content_type: Option<String>,
    pub storage: StorageKind,
    pub file_store_id: Option<Uuid>,
    pub payload: PayloadId,
    pub sys_object_id: Uuid,
    pub is_primary: bool,
    pub is_indexable: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Upload request handled by the copy-on-write logic.
#[derive(Clone, Debug)]
pub struct ContentUpload {
    pub name: String,
    pub content_type: Option<String>,
    pub bytes: bytes::Bytes,
    pub storage: StorageKind,
    pub file_store_id: Option<Uuid>,
    pub is_primary: bool,
    pub is_indexable: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum FileStoreStatus {
    Active,
    Inactive,
}

/// Registered external byte-store target.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileStore {
    pub id: Uuid,
    pub name: String,
    pub root_path: PathBuf,
    pub status: FileStoreStatus,
}

impl FileStore {
    pub fn is_active(&self) -> bool {
        self.status == FileStoreStatus::Active
    }
}
