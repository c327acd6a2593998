//! Version chain manager.
//!
//! Owns the per-document sequence of versions and their content
//! associations. Rows are persisted individually as JSON under the data
//! directory and loaded at startup. Payload bytes are owned by the
//! embedded [`ContentStore`]; versioning clones content by reference
//! count, and uploads go through copy-on-write so a superseded version's
//! bytes are never observed to change.

use crate::content::ContentStore;
use crate::errors::{Result, StoreError};
use crate::events::{Event, EventBus};
use crate::model::{
    Content, ContentUpload, MetadataPatch, NewDocument, SysObject,
};
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

enum Bump {
    Major,
    Minor,
}

pub struct VersionStore {
    dir: PathBuf,
    objects: HashMap<Uuid, SysObject>,
    contents: HashMap<Uuid, Content>,
    /// chain id -> version ids, unordered.
    by_chain: HashMap<Uuid, Vec<Uuid>>,
    /// chain id -> the single version with `is_latest_version`.
    latest: HashMap<Uuid, Uuid>,
    /// Per-chain creation locks. A contender that cannot take the lock
    /// loses the race instead of waiting.
    chain_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    content_store: ContentStore,
    events: EventBus,
}

impl VersionStore {
    pub fn new(dir: impl Into<PathBuf>, events: EventBus) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join("objects"))?;
        std::fs::create_dir_all(dir.join("contents"))?;
        let content_store = ContentStore::new(dir.join("payloads"))?;

        let mut objects = HashMap::new();
        let mut by_chain: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        let mut latest = HashMap::new();
        for entry in std::fs::read_dir(dir.join("objects"))? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let data = std::fs::read(entry.path())?;
            let obj: SysObject = serde_json::from_slice(&data)?;
            by_chain.entry(obj.chain_id).or_default().push(obj.id);
            if obj.is_latest_version {
                latest.insert(obj.chain_id, obj.id);
            }
            objects.insert(obj.id, obj);
        }

        let mut contents = HashMap::new();
        for entry in std::fs::read_dir(dir.join("contents"))? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let data = std::fs::read(entry.path())?;
            let row: Content = serde_json::from_slice(&data)?;
            contents.insert(row.id, row);
        }

        let mut store = Self {
            dir,
            objects,
            contents,
            by_chain,
            latest,
            chain_locks: Mutex::new(HashMap::new()),
            content_store,
            events,
        };
        let chains: Vec<Uuid> = store.by_chain.keys().copied().collect();
        for chain_id in chains {
            store.reconcile_latest(chain_id)?;
        }
        Ok(store)
    }

    /// Repair a chain whose latest flag was left inconsistent by an
    /// interrupted version clone. Zero or multiple flagged rows both
    /// collapse to the highest (major, minor) version.
    fn reconcile_latest(&mut self, chain_id: Uuid) -> Result<()> {
        let ids = match self.by_chain.get(&chain_id) {
            Some(ids) => ids.clone(),
            None => return Ok(()),
        };
        let flagged: Vec<Uuid> = ids
            .iter()
            .filter(|id| self.objects.get(id).is_some_and(|o| o.is_latest_version))
            .copied()
            .collect();
        if flagged.len() == 1 {
            self.latest.insert(chain_id, flagged[0]);
            return Ok(());
        }
        let winner = match ids
            .iter()
            .filter_map(|id| self.objects.get(id))
            .max_by_key(|o| (o.major_version, o.minor_version))
            .map(|o| o.id)
        {
            Some(id) => id,
            None => return Ok(()),
        };
        tracing::warn!(chain = %chain_id, flagged = flagged.len(), "repairing latest flag");
        for id in ids {
            let obj = match self.objects.get_mut(&id) {
                Some(obj) => obj,
                None => continue,
            };
            let desired = id == winner;
            if obj.is_latest_version != desired {
                obj.is_latest_version = desired;
                let snapshot = obj.clone();
                self.save_object(&snapshot)?;
            }
        }
        self.latest.insert(chain_id, winner);
        Ok(())
    }

    pub fn content_store(&self) -> &ContentStore {
        &self.content_store
    }

    pub fn content_store_mut(&mut self) -> &mut ContentStore {
        &mut self.content_store
    }

    fn object_path(&self, id: Uuid) -> PathBuf {
        self.dir.join("objects").join(format!("{}.json", id))
    }

    fn content_path(&self, id: Uuid) -> PathBuf {
        self.dir.join("contents").join(format!("{}.json", id))
    }

    fn save_object(&self, obj: &SysObject) -> Result<()> {
        let data = serde_json::to_vec(obj)?;
        std::fs::write(self.object_path(obj.id), data)?;
        Ok(())
    }

    fn save_content(&self, row: &Content) -> Result<()> {
        let data = serde_json::to_vec(row)?;
        std::fs::write(self.content_path(row.id), data)?;
        Ok(())
    }

    fn chain_lock(&self, chain_id: Uuid) -> Arc<Mutex<()>> {
        self.chain_locks
            .lock()
            .entry(chain_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Allocate a new chain at version 1.0.
    pub fn create_document(&mut self, new: NewDocument) -> Result<SysObject> {
        if new.name.trim().is_empty() {
            return Err(StoreError::Validation("name is required".into()));
        }
        let document_type = new
            .document_type
            .ok_or_else(|| StoreError::Validation("document_type is required".into()))?;

        let now = Utc::now();
        let obj = SysObject {
            id: Uuid::new_v4(),
            chain_id: Uuid::new_v4(),
            name: new.name,
            document_type,
            description: new.description,
            keywords: new.keywords,
            tags: new.tags,
            author: new.author,
            extra: new.extra,
            major_version: 1,
            minor_version: 0,
            parent_version_id: None,
            is_latest_version: true,
            created_at: now,
            modified_at: now,
        };
        self.save_object(&obj)?;
        self.by_chain.entry(obj.chain_id).or_default().push(obj.id);
        self.latest.insert(obj.chain_id, obj.id);
        self.objects.insert(obj.id, obj.clone());
        tracing::info!(id = %obj.id, chain = %obj.chain_id, name = %obj.name, "document created");
        self.events.send(Event::DocumentCreated {
            id: obj.id,
            chain_id: obj.chain_id,
        });
        Ok(obj)
    }

    pub fn get(&self, id: Uuid) -> Option<&SysObject> {
        self.objects.get(&id)
    }

    fn require(&self, id: Uuid) -> Result<&SysObject> {
        self.objects
            .get(&id)
            .ok_or(StoreError::not_found("version", id))
    }

    pub fn latest_of_chain(&self, chain_id: Uuid) -> Result<&SysObject> {
        let id = self
            .latest
            .get(&chain_id)
            .ok_or(StoreError::not_found("chain", chain_id))?;
        self.require(*id)
    }

    /// Ordered history of one chain, (major, minor) ascending.
    pub fn version_history(&self, chain_id: Uuid) -> Result<Vec<SysObject>> {
        let ids = self
            .by_chain
            .get(&chain_id)
            .ok_or(StoreError::not_found("chain", chain_id))?;
        let mut history: Vec<SysObject> = ids
            .iter()
            .filter_map(|id| self.objects.get(id).cloned())
            .collect();
        history.sort_by_key(|v| (v.major_version, v.minor_version));
        Ok(history)
    }

    /// The current latest of every chain.
    pub fn latest_versions(&self) -> Vec<&SysObject> {
        self.latest
            .values()
            .filter_map(|id| self.objects.get(id))
            .collect()
    }

    pub fn create_major_version(&mut self, version_id: Uuid) -> Result<SysObject> {
        self.clone_version(version_id, Bump::Major)
    }

    pub fn create_minor_version(&mut self, version_id: Uuid) -> Result<SysObject> {
        self.clone_version(version_id, Bump::Minor)
    }

    fn clone_version(&mut self, version_id: Uuid, bump: Bump) -> Result<SysObject> {
        let parent = self.require(version_id)?.clone();
        let chain_id = parent.chain_id;

        let lock = self.chain_lock(chain_id);
        let _guard = lock
            .try_lock()
            .ok_or(StoreError::ConcurrentVersionConflict { chain_id })?;

        // re-check under the chain lock; a contender that committed first
        // has already moved the latest pointer
        if self.latest.get(&chain_id) != Some(&version_id) {
            return Err(StoreError::NotLatestVersion { id: version_id });
        }

        let now = Utc::now();
        let (major, minor) = match bump {
            Bump::Major => (parent.major_version + 1, 0),
            Bump::Minor => (parent.major_version, parent.minor_version + 1),
        };
        let mut new_obj = SysObject {
            id: Uuid::new_v4(),
            parent_version_id: Some(parent.id),
            major_version: major,
            minor_version: minor,
            is_latest_version: false,
            created_at: now,
            modified_at: now,
            ..parent.clone()
        };

        // clone every content association by reference; no bytes move.
        // roll back already-taken references if any clone fails so the
        // chain is left exactly as it was.
        let parent_rows: Vec<Content> = self
            .contents
            .values()
            .filter(|c| c.sys_object_id == version_id)
            .cloned()
            .collect();
        let mut cloned_rows = Vec::with_capacity(parent_rows.len());
        for row in &parent_rows {
            match self.content_store.clone_payload(row.payload) {
                Ok(payload) => cloned_rows.push(Content {
                    id: Uuid::new_v4(),
                    payload,
                    sys_object_id: new_obj.id,
                    created_at: now,
                    modified_at: now,
                    ..row.clone()
                }),
                Err(e) => {
                    for taken in &cloned_rows {
                        let _ = self.content_store.release(taken.payload);
                    }
                    return Err(e);
                }
            }
        }

        // commit order: stage the new row and its content rows with the
        // latest flag unset, demote the parent, then promote the new row.
        // a crash anywhere in between leaves at most zero flagged rows on
        // disk, never two; startup reconciliation promotes the highest
        // version of such a chain.
        let staged: Result<()> = (|| {
            self.save_object(&new_obj)?;
            for row in &cloned_rows {
                self.save_content(row)?;
            }
            Ok(())
        })();
        if let Err(e) = staged {
            self.discard_staged_clone(&new_obj, &cloned_rows);
            return Err(e);
        }

        let old = self.objects.get_mut(&version_id).expect("parent present");
        old.is_latest_version = false;
        old.modified_at = now;
        let old_snapshot = old.clone();
        if let Err(e) = self.save_object(&old_snapshot) {
            let old = self.objects.get_mut(&version_id).expect("parent present");
            old.is_latest_version = true;
            self.discard_staged_clone(&new_obj, &cloned_rows);
            return Err(e);
        }

        new_obj.is_latest_version = true;
        if let Err(e) = self.save_object(&new_obj) {
            let old = self.objects.get_mut(&version_id).expect("parent present");
            old.is_latest_version = true;
            let snapshot = old.clone();
            let _ = self.save_object(&snapshot);
            self.discard_staged_clone(&new_obj, &cloned_rows);
            return Err(e);
        }

        for row in &cloned_rows {
            self.contents.insert(row.id, row.clone());
        }
        self.latest.insert(chain_id, new_obj.id);
        self.by_chain.entry(chain_id).or_default().push(new_obj.id);
        self.objects.insert(new_obj.id, new_obj.clone());

        tracing::info!(
            id = %new_obj.id,
            chain = %chain_id,
            version = %new_obj.version_label(),
            "version created"
        );
        self.events.send(Event::DocumentUpdated {
            id: version_id,
            chain_id,
        });
        self.events.send(Event::DocumentCreated {
            id: new_obj.id,
            chain_id,
        });
        Ok(new_obj)
    }

    /// Remove a half-staged clone from disk and hand back its payload
    /// references. Used when a save fails mid-commit.
    fn discard_staged_clone(&mut self, obj: &SysObject, rows: &[Content]) {
        let _ = std::fs::remove_file(self.object_path(obj.id));
        for row in rows {
            let _ = std::fs::remove_file(self.content_path(row.id));
            let _ = self.content_store.release(row.payload);
        }
    }

    /// Upload bytes into a named content slot of a version.
    ///
    /// If the slot already exists and its payload is shared with a sibling
    /// version, a fresh payload is materialized and only this version's
    /// row is repointed (copy-on-write); an unshared payload is rewritten
    /// in place. Requesting a different placement (database vs. file
    /// store) relocates the payload the same way. A new name creates a
    /// new row.
    pub fn attach_content(&mut self, version_id: Uuid, upload: ContentUpload) -> Result<Content> {
        if upload.name.trim().is_empty() {
            return Err(StoreError::Validation("content name is required".into()));
        }
        let chain_id = self.require(version_id)?.chain_id;

        let existing = self
            .contents
            .values()
            .find(|c| c.sys_object_id == version_id && c.name == upload.name)
            .map(|c| c.id);

        let row = match existing {
            Some(content_id) => {
                let mut row = self.contents.get(&content_id).expect("row present").clone();
                let shared = self.content_store.refcount(row.payload).unwrap_or(0) > 1;
                let placement_changed =
                    row.storage != upload.storage || row.file_store_id != upload.file_store_id;
                if shared || placement_changed {
                    let new_payload = self.content_store.materialize_new(
                        &upload.bytes,
                        upload.storage,
                        upload.file_store_id,
                        &upload.name,
                    )?;
                    let old_payload = row.payload;
                    row.payload = new_payload;
                    row.storage = upload.storage;
                    row.file_store_id = upload.file_store_id;
                    row.content_type = upload.content_type.clone();
                    row.is_primary = upload.is_primary;
                    row.is_indexable = upload.is_indexable;
                    row.modified_at = Utc::now();
                    if let Err(e) = self.save_content(&row) {
                        // nothing points at the fresh payload yet
                        let _ = self.content_store.release(new_payload);
                        return Err(e);
                    }
                    self.contents.insert(content_id, row.clone());
                    self.content_store.release(old_payload)?;
                } else {
                    // unique to this version; the slot keeps its location
                    self.content_store.overwrite(row.payload, &upload.bytes)?;
                    row.content_type = upload.content_type.clone();
                    row.is_primary = upload.is_primary;
                    row.is_indexable = upload.is_indexable;
                    row.modified_at = Utc::now();
                    self.save_content(&row)?;
                    self.contents.insert(content_id, row.clone());
                }
                row
            }
            None => {
                let payload = self.content_store.store(
                    &upload.bytes,
                    upload.storage,
                    upload.file_store_id,
                    &upload.name,
                )?;
                let now = Utc::now();
                let row = Content {
                    id: Uuid::new_v4(),
                    name: upload.name.clone(),
                    content_type: upload.content_type.clone(),
                    storage: upload.storage,
                    file_store_id: upload.file_store_id,
                    payload,
                    sys_object_id: version_id,
                    is_primary: upload.is_primary,
                    is_indexable: upload.is_indexable,
                    created_at: now,
                    modified_at: now,
                };
                if let Err(e) = self.save_content(&row) {
                    let _ = self.content_store.release(payload);
                    return Err(e);
                }
                self.contents.insert(row.id, row.clone());
                row
            }
        };

        // at most one primary content per version
        if row.is_primary {
            let demote: Vec<Uuid> = self
                .contents
                .values()
                .filter(|c| c.sys_object_id == version_id && c.is_primary && c.id != row.id)
                .map(|c| c.id)
                .collect();
            for id in demote {
                let other = self.contents.get_mut(&id).expect("row present");
                other.is_primary = false;
                let snapshot = other.clone();
                self.save_content(&snapshot)?;
            }
        }

        tracing::debug!(version = %version_id, content = %row.id, name = %row.name, "content attached");
        self.events.send(Event::ContentChanged {
            id: version_id,
            chain_id,
            content_id: row.id,
            indexable: row.is_indexable,
        });
        Ok(row)
    }

    pub fn contents_for(&self, version_id: Uuid) -> Result<Vec<Content>> {
        self.require(version_id)?;
        let mut rows: Vec<Content> = self
            .contents
            .values()
            .filter(|c| c.sys_object_id == version_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    pub fn content(&self, content_id: Uuid) -> Result<&Content> {
        self.contents
            .get(&content_id)
            .ok_or(StoreError::not_found("content", content_id))
    }

    pub fn content_bytes(&self, content_id: Uuid) -> Result<Bytes> {
        let row = self.content(content_id)?;
        self.content_store.fetch(row.payload)
    }

    pub fn primary_content(&self, version_id: Uuid) -> Option<&Content> {
        self.contents
            .values()
            .find(|c| c.sys_object_id == version_id && c.is_primary)
    }

    /// UTF-8 text of the version's first indexable content, if any. Fed to
    /// the external search index.
    pub fn indexable_text(&self, version_id: Uuid) -> Option<String> {
        let row = self
            .contents
            .values()
            .find(|c| c.sys_object_id == version_id && c.is_indexable)?;
        let bytes = self.content_store.fetch(row.payload).ok()?;
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Patch descriptive fields of the chain's latest version. Past
    /// versions are immutable.
    pub fn update_metadata(&mut self, version_id: Uuid, patch: MetadataPatch) -> Result<SysObject> {
        let obj = self.require(version_id)?;
        if !obj.is_latest_version {
            return Err(StoreError::NotLatestVersion { id: version_id });
        }
        let chain_id = obj.chain_id;
        let obj = self.objects.get_mut(&version_id).expect("row present");
        if let Some(name) = patch.name {
            if name.trim().is_empty() {
                return Err(StoreError::Validation("name is required".into()));
            }
            obj.name = name;
        }
        if let Some(description) = patch.description {
            obj.description = Some(description);
        }
        if let Some(keywords) = patch.keywords {
            obj.keywords = Some(keywords);
        }
        if let Some(tags) = patch.tags {
            obj.tags = tags;
        }
        if let Some(author) = patch.author {
            obj.author = Some(author);
        }
        if let Some(extra) = patch.extra {
            obj.extra = extra;
        }
        obj.modified_at = Utc::now();
        let snapshot = obj.clone();
        self.save_object(&snapshot)?;
        self.events.send(Event::DocumentUpdated {
            id: version_id,
            chain_id,
        });
        Ok(snapshot)
    }

    /// Delete the chain's latest version, releasing its content payload
    /// references and re-promoting the parent version to latest. Deleting
    /// the only version removes the chain.
    pub fn delete_version(&mut self, version_id: Uuid) -> Result<()> {
        let obj = self.require(version_id)?.clone();
        if !obj.is_latest_version {
            return Err(StoreError::NotLatestVersion { id: version_id });
        }
        let chain_id = obj.chain_id;
        let lock = self.chain_lock(chain_id);
        let _guard = lock
            .try_lock()
            .ok_or(StoreError::ConcurrentVersionConflict { chain_id })?;

        let row_ids: Vec<Uuid> = self
            .contents
            .values()
            .filter(|c| c.sys_object_id == version_id)
            .map(|c| c.id)
            .collect();
        for id in row_ids {
            let row = self.contents.remove(&id).expect("row present");
            self.content_store.release(row.payload)?;
            let _ = std::fs::remove_file(self.content_path(id));
        }

        self.objects.remove(&version_id);
        let _ = std::fs::remove_file(self.object_path(version_id));
        if let Some(ids) = self.by_chain.get_mut(&chain_id) {
            ids.retain(|id| *id != version_id);
            if ids.is_empty() {
                self.by_chain.remove(&chain_id);
            }
        }

        match obj.parent_version_id.and_then(|pid| self.objects.get_mut(&pid)) {
            Some(parent) => {
                parent.is_latest_version = true;
                parent.modified_at = Utc::now();
                let snapshot = parent.clone();
                self.latest.insert(chain_id, snapshot.id);
                self.save_object(&snapshot)?;
            }
            None => {
                self.latest.remove(&chain_id);
            }
        }

        tracing::info!(id = %version_id, chain = %chain_id, "version deleted");
        self.events.send(Event::DocumentDeleted {
            id: version_id,
            chain_id,
        });
        Ok(())
    }
}
