//! Error taxonomy shared by all store components.
//!
//! Every error carries enough structure (kind plus the offending id) for a
//! caller to decide between retrying and aborting.

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("version {id} is not the latest of its chain")]
    NotLatestVersion { id: Uuid },

    #[error("lost a version-creation race on chain {chain_id}")]
    ConcurrentVersionConflict { chain_id: Uuid },

    #[error("folder edge {parent} -> {child} would create a cycle")]
    Cycle { parent: Uuid, child: Uuid },

    #[error("file store {id} is not registered or not active")]
    InvalidFileStore { id: Uuid },

    #[error("storage I/O failure")]
    StorageIo(#[from] std::io::Error),

    #[error("persisted row is corrupt")]
    Corrupt(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        Self::NotFound { kind, id }
    }

    /// Whether the caller may reasonably retry the same operation.
    /// A conflict retries after re-reading the new latest; an I/O failure
    /// has already been retried a bounded number of times internally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentVersionConflict { .. } | Self::StorageIo(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
