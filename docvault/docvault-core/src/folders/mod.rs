//! Folder graph: hierarchical folders plus a many-to-many membership
//! relation between folders and document chains.
//!
//! Membership is keyed by chain id, not version id, so re-versioning a
//! document never disturbs where it is filed. Parent/child folder edges
//! form a DAG with at most one parent per folder; cycles are rejected.

use crate::errors::{Result, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use uuid::Uuid;

const GRAPH_FILE: &str = "folders.json";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Folder {
    pub id: Uuid,
    pub name: String,
    /// Informational display path; containment is authoritative through
    /// the parent/child edges.
    pub path: Option<String>,
    pub description: Option<String>,
    pub is_public: bool,
    pub permissions: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewFolder {
    pub name: String,
    pub path: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

/// One row of a flattened hierarchy listing.
#[derive(Clone, Debug, Serialize)]
pub struct HierarchyEntry {
    pub folder: Folder,
    pub depth: usize,
}

#[derive(Default, Serialize, Deserialize)]
struct GraphState {
    folders: HashMap<Uuid, Folder>,
    /// child -> parent
    parent: HashMap<Uuid, Uuid>,
    /// folder -> member chain ids
    members: HashMap<Uuid, BTreeSet<Uuid>>,
}

pub struct FolderGraph {
    dir: PathBuf,
    state: GraphState,
}

impl FolderGraph {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let state = match std::fs::read(dir.join(GRAPH_FILE)) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(_) => GraphState::default(),
        };
        Ok(Self { dir, state })
    }

    fn save(&self) -> Result<()> {
        let data = serde_json::to_vec(&self.state)?;
        std::fs::write(self.dir.join(GRAPH_FILE), data)?;
        Ok(())
    }

    fn require(&self, id: Uuid) -> Result<&Folder> {
        self.state
            .folders
            .get(&id)
            .ok_or(StoreError::not_found("folder", id))
    }

    pub fn create_folder(&mut self, new: NewFolder) -> Result<Folder> {
        if new.name.trim().is_empty() {
            return Err(StoreError::Validation("folder name is required".into()));
        }
        let now = Utc::now();
        let folder = Folder {
            id: Uuid::new_v4(),
            name: new.name,
            path: new.path,
            description: new.description,
            is_public: new.is_public,
            permissions: new.permissions,
            created_at: now,
            modified_at: now,
        };
        self.state.folders.insert(folder.id, folder.clone());
        self.save()?;
        tracing::info!(id = %folder.id, name = %folder.name, "folder created");
        Ok(folder)
    }

    pub fn get(&self, id: Uuid) -> Option<&Folder> {
        self.state.folders.get(&id)
    }

    /// Attach `child` under `parent`, re-parenting if the child already
    /// sits elsewhere. Rejected when the edge would close a cycle.
    pub fn add_child_folder(&mut self, parent: Uuid, child: Uuid) -> Result<()> {
        self.require(parent)?;
        self.require(child)?;
        if parent == child {
            return Err(StoreError::Cycle { parent, child });
        }
        // walk existing parent links upward from the would-be parent; if
        // we reach the child, the new edge would close a loop
        let mut current = Some(parent);
        while let Some(id) = current {
            if id == child {
                return Err(StoreError::Cycle { parent, child });
            }
            current = self.state.parent.get(&id).copied();
        }
        self.state.parent.insert(child, parent);
        self.save()
    }

    /// Detach `child` from `parent`; no-op if the edge does not exist.
    pub fn remove_child_folder(&mut self, parent: Uuid, child: Uuid) -> Result<()> {
        self.require(parent)?;
        if self.state.parent.get(&child) == Some(&parent) {
            self.state.parent.remove(&child);
            self.save()?;
        }
        Ok(())
    }

    pub fn child_folders(&self, parent: Uuid) -> Result<Vec<&Folder>> {
        self.require(parent)?;
        Ok(self
            .state
            .parent
            .iter()
            .filter(|(_, p)| **p == parent)
            .filter_map(|(c, _)| self.state.folders.get(c))
            .collect())
    }

    /// File a document chain into a folder. Adding an already-present
    /// pair is a no-op.
    pub fn add_item(&mut self, folder_id: Uuid, item_id: Uuid) -> Result<()> {
        self.require(folder_id)?;
        let inserted = self
            .state
            .members
            .entry(folder_id)
            .or_default()
            .insert(item_id);
        if inserted {
            self.save()?;
        }
        Ok(())
    }

    /// Remove a document chain from a folder. Removing an absent pair is
    /// a no-op rather than an error, so the operation is idempotent.
    pub fn remove_item(&mut self, folder_id: Uuid, item_id: Uuid) -> Result<()> {
        self.require(folder_id)?;
        let removed = self
            .state
            .members
            .get_mut(&folder_id)
            .map(|set| set.remove(&item_id))
            .unwrap_or(false);
        if removed {
            self.save()?;
        }
        Ok(())
    }

    /// Direct members of one folder; child folders are not recursed into.
    pub fn folder_items(&self, folder_id: Uuid) -> Result<BTreeSet<Uuid>> {
        self.require(folder_id)?;
        Ok(self
            .state
            .members
            .get(&folder_id)
            .cloned()
            .unwrap_or_default())
    }

    /// All folders a document chain is filed in.
    pub fn folders_containing(&self, item_id: Uuid) -> Vec<Uuid> {
        self.state
            .members
            .iter()
            .filter(|(_, items)| items.contains(&item_id))
            .map(|(folder, _)| *folder)
            .collect()
    }

    /// Breadth-first descendant closure from `root_id`, annotated with
    /// depth. Terminates because successful edge insertions keep the
    /// graph acyclic.
    pub fn folder_hierarchy(&self, root_id: Uuid) -> Result<Vec<HierarchyEntry>> {
        let root = self.require(root_id)?;
        let mut out = vec![HierarchyEntry {
            folder: root.clone(),
            depth: 0,
        }];
        let mut queue = VecDeque::from([(root_id, 0usize)]);
        while let Some((id, depth)) = queue.pop_front() {
            let mut children: Vec<Uuid> = self
                .state
                .parent
                .iter()
                .filter(|(_, p)| **p == id)
                .map(|(c, _)| *c)
                .collect();
            children.sort();
            for child in children {
                if let Some(folder) = self.state.folders.get(&child) {
                    out.push(HierarchyEntry {
                        folder: folder.clone(),
                        depth: depth + 1,
                    });
                    queue.push_back((child, depth + 1));
                }
            }
        }
        Ok(out)
    }

    /// Folders with no parent edge pointing at them.
    pub fn root_folders(&self) -> Vec<&Folder> {
        self.state
            .folders
            .values()
            .filter(|f| !self.state.parent.contains_key(&f.id))
            .collect()
    }

    pub fn add_permission(&mut self, folder_id: Uuid, permission: String) -> Result<()> {
        self.require(folder_id)?;
        let folder = self.state.folders.get_mut(&folder_id).expect("present");
        folder.permissions.insert(permission);
        folder.modified_at = Utc::now();
        self.save()
    }

    pub fn remove_permission(&mut self, folder_id: Uuid, permission: &str) -> Result<()> {
        self.require(folder_id)?;
        let folder = self.state.folders.get_mut(&folder_id).expect("present");
        folder.permissions.remove(permission);
        folder.modified_at = Utc::now();
        self.save()
    }

    /// Delete a folder. Its children become roots and its memberships are
    /// dropped; member documents themselves are untouched.
    pub fn delete_folder(&mut self, folder_id: Uuid) -> Result<()> {
        self.require(folder_id)?;
        self.state.folders.remove(&folder_id);
        self.state.parent.remove(&folder_id);
        self.state.parent.retain(|_, p| *p != folder_id);
        self.state.members.remove(&folder_id);
        self.save()
    }
}

#[cfg(test)]
mod tests;
