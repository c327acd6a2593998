//! Reference-counted payload store.
//!
//! Payloads live either inline under the store's own blob directory
//! ("database" placement) or inside a registered external file store.
//! Multiple content rows may share one payload; bytes are only deleted
//! when the last reference is released. Writes are staged to a temp file
//! and committed by rename so a payload is never observed half-written.

use crate::errors::{Result, StoreError};
use crate::model::{FileStore, FileStoreStatus, PayloadId, StorageKind};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;
use walkdir::WalkDir;

const META_FILE: &str = "payloads.json";
const STORES_FILE: &str = "file_stores.json";
const IO_ATTEMPTS: u32 = 3;

#[derive(Clone, Debug, Serialize, Deserialize)]
enum PayloadLocation {
    Database { file: String },
    FileStore { store_id: Uuid, rel_path: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PayloadEntry {
    refcount: u32,
    location: PayloadLocation,
}

pub struct ContentStore {
    dir: PathBuf,
    payloads: HashMap<PayloadId, PayloadEntry>,
    file_stores: HashMap<Uuid, FileStore>,
}

impl ContentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join("blobs"))?;

        let payloads = match std::fs::read(dir.join(META_FILE)) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(_) => HashMap::new(),
        };
        let file_stores = match std::fs::read(dir.join(STORES_FILE)) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            dir,
            payloads,
            file_stores,
        })
    }

    fn blob_dir(&self) -> PathBuf {
        self.dir.join("blobs")
    }

    fn save_meta(&self) -> Result<()> {
        let data = serde_json::to_vec(&self.payloads)?;
        with_io_retry(|| write_staged(&self.dir.join(META_FILE), &data))
    }

    fn save_stores(&self) -> Result<()> {
        let data = serde_json::to_vec(&self.file_stores)?;
        with_io_retry(|| write_staged(&self.dir.join(STORES_FILE), &data))
    }

    /// Register an external file-store target and make sure its root
    /// directory exists.
    pub fn register_file_store(&mut self, store: FileStore) -> Result<()> {
        if store.name.trim().is_empty() {
            return Err(StoreError::Validation(
                "file store name is required".into(),
            ));
        }
        std::fs::create_dir_all(&store.root_path)?;
        self.file_stores.insert(store.id, store);
        self.save_stores()
    }

    pub fn set_file_store_status(&mut self, id: Uuid, status: FileStoreStatus) -> Result<()> {
        let store = self
            .file_stores
            .get_mut(&id)
            .ok_or(StoreError::not_found("file store", id))?;
        store.status = status;
        self.save_stores()
    }

    pub fn file_store(&self, id: Uuid) -> Option<&FileStore> {
        self.file_stores.get(&id)
    }

    pub fn file_stores(&self) -> impl Iterator<Item = &FileStore> {
        self.file_stores.values()
    }

    fn active_file_store(&self, id: Uuid) -> Result<&FileStore> {
        match self.file_stores.get(&id) {
            Some(store) if store.is_active() => Ok(store),
            _ => Err(StoreError::InvalidFileStore { id }),
        }
    }

    fn payload_path(&self, entry: &PayloadEntry) -> Result<PathBuf> {
        match &entry.location {
            PayloadLocation::Database { file } => Ok(self.blob_dir().join(file)),
            PayloadLocation::FileStore { store_id, rel_path } => {
                let store = self
                    .file_stores
                    .get(store_id)
                    .ok_or(StoreError::InvalidFileStore { id: *store_id })?;
                Ok(store.root_path.join(rel_path))
            }
        }
    }

    /// Persist a payload and return a reference with refcount 1.
    pub fn store(
        &mut self,
        bytes: &[u8],
        kind: StorageKind,
        file_store_id: Option<Uuid>,
        name: &str,
    ) -> Result<PayloadId> {
        let id = PayloadId::new();
        let location = match kind {
            StorageKind::Database => PayloadLocation::Database {
                file: format!("{}.bin", id),
            },
            StorageKind::FileStore => {
                let store_id = file_store_id.ok_or_else(|| {
                    StoreError::Validation(
                        "file_store_id is required for file-store placement".into(),
                    )
                })?;
                self.active_file_store(store_id)?;
                PayloadLocation::FileStore {
                    store_id,
                    rel_path: storage_path(name),
                }
            }
        };
        let entry = PayloadEntry {
            refcount: 1,
            location,
        };
        let path = self.payload_path(&entry)?;
        with_io_retry(|| write_staged(&path, bytes))?;
        self.payloads.insert(id, entry);
        self.save_meta()?;
        tracing::debug!(payload = %id, size = bytes.len(), "payload stored");
        Ok(id)
    }

    /// Always allocates a fresh payload. Used by copy-on-write when the
    /// existing payload is shared with another version.
    pub fn materialize_new(
        &mut self,
        bytes: &[u8],
        kind: StorageKind,
        file_store_id: Option<Uuid>,
        name: &str,
    ) -> Result<PayloadId> {
        self.store(bytes, kind, file_store_id, name)
    }

    /// Increment the reference count; no bytes are copied.
    pub fn clone_payload(&mut self, id: PayloadId) -> Result<PayloadId> {
        let entry = self
            .payloads
            .get_mut(&id)
            .ok_or(StoreError::not_found("payload", id.0))?;
        entry.refcount += 1;
        self.save_meta()?;
        Ok(id)
    }

    /// Decrement the reference count; at zero the bytes are physically
    /// deleted and, for file-store payloads, empty parent directories are
    /// pruned up to the store root.
    pub fn release(&mut self, id: PayloadId) -> Result<()> {
        let entry = self
            .payloads
            .get_mut(&id)
            .ok_or(StoreError::not_found("payload", id.0))?;
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return self.save_meta();
        }
        let entry = self.payloads.remove(&id).expect("entry present");
        let path = self.payload_path(&entry)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let PayloadLocation::FileStore { store_id, .. } = &entry.location {
            if let Some(store) = self.file_stores.get(store_id) {
                if let Some(parent) = path.parent() {
                    prune_empty_dirs(parent, &store.root_path);
                }
            }
        }
        self.save_meta()?;
        tracing::debug!(payload = %id, "payload released and deleted");
        Ok(())
    }

    /// Rewrite a payload in place. Only valid while the payload is unique
    /// to one content row; shared payloads must go through
    /// [`ContentStore::materialize_new`] instead.
    pub fn overwrite(&mut self, id: PayloadId, bytes: &[u8]) -> Result<()> {
        let entry = self
            .payloads
            .get(&id)
            .ok_or(StoreError::not_found("payload", id.0))?;
        if entry.refcount > 1 {
            return Err(StoreError::Validation(format!(
                "payload {} is shared by {} references and cannot be overwritten in place",
                id, entry.refcount
            )));
        }
        let path = self.payload_path(entry)?;
        with_io_retry(|| write_staged(&path, bytes))
    }

    pub fn fetch(&self, id: PayloadId) -> Result<Bytes> {
        let entry = self
            .payloads
            .get(&id)
            .ok_or(StoreError::not_found("payload", id.0))?;
        let path = self.payload_path(entry)?;
        let data = with_io_retry(|| std::fs::read(&path))?;
        Ok(Bytes::from(data))
    }

    pub fn refcount(&self, id: PayloadId) -> Option<u32> {
        self.payloads.get(&id).map(|e| e.refcount)
    }

    /// Remove blob files no live payload points at. Returns the number of
    /// files removed and the bytes freed.
    pub fn gc_orphans(&mut self) -> Result<(usize, u64)> {
        let active: std::collections::HashSet<PathBuf> = self
            .payloads
            .values()
            .filter_map(|e| match &e.location {
                PayloadLocation::Database { file } => Some(self.blob_dir().join(file)),
                PayloadLocation::FileStore { .. } => None,
            })
            .collect();

        let mut removed = 0usize;
        let mut freed = 0u64;
        for entry in WalkDir::new(self.blob_dir())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            if !active.contains(entry.path()) {
                if let Ok(meta) = entry.metadata() {
                    freed += meta.len();
                }
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok((removed, freed))
    }
}

/// Hierarchical storage path for file-store placement:
/// `aa/bb/cc/dd/<uuid>.ext`. Four two-character levels keep any single
/// directory under ~256 entries regardless of payload count.
fn storage_path(name: &str) -> String {
    let id = Uuid::new_v4();
    let hex = id.simple().to_string();
    let ext = name
        .rsplit_once('.')
        .map(|(_, e)| format!(".{}", e))
        .unwrap_or_default();
    format!(
        "{}/{}/{}/{}/{}{}",
        &hex[0..2],
        &hex[2..4],
        &hex[4..6],
        &hex[6..8],
        id,
        ext
    )
}

/// Write to `<path>.tmp`, then rename over the target so readers never see
/// a partially written payload.
fn write_staged(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

fn with_io_retry<T>(mut op: impl FnMut() -> std::io::Result<T>) -> Result<T> {
    let mut delay = Duration::from_millis(10);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if attempt < IO_ATTEMPTS => {
                tracing::warn!(error = %e, attempt, "payload I/O failed, backing off");
                std::thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn prune_empty_dirs(from: &Path, root: &Path) {
    let mut current = Some(from);
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        let empty = match std::fs::read_dir(dir) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => false,
        };
        if !empty || std::fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}
