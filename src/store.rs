//! The backing object store collaborator.
//!
//! The mount only ever asks the store for trees by content hash. Fetch, network,
//! and caching policy belong to the store implementation.

use fxhash::hash64;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{EdenError, Result};
use crate::types::{InodeKind, ObjectId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub kind: InodeKind,
    pub id: ObjectId,
}

impl TreeEntry {
    pub fn new(name: impl Into<String>, kind: InodeKind, id: ObjectId) -> Self {
        TreeEntry {
            name: name.into(),
            kind,
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    pub id: ObjectId,
    pub entries: Vec<TreeEntry>,
}

/// Source of committed tree content.
pub trait BackingStore: Send + Sync {
    /// Fetch a tree by hash. Failures are reported as `StoreUnavailable`.
    fn get_tree(&self, id: &ObjectId) -> Result<Tree>;
}

/// In-process store with content-derived ids.
///
/// Serves tests and offline tooling; it can be switched unavailable to
/// exercise fetch failures and counts every fetch it answers.
#[derive(Default)]
pub struct MemoryStore {
    trees: RwLock<HashMap<ObjectId, Tree>>,
    unavailable: AtomicBool,
    fetches: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a tree and return its id.
    pub fn add_tree(&self, mut entries: Vec<TreeEntry>) -> ObjectId {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let key: Vec<(&str, &str, String)> = entries
            .iter()
            .map(|e| (e.name.as_str(), e.kind.as_str(), e.id.to_string()))
            .collect();
        let id = derive_id(&key);
        self.trees.write().insert(id, Tree { id, entries });
        id
    }

    /// Id for a file blob. Blob bytes are never fetched through this layer.
    pub fn blob_id(contents: &[u8]) -> ObjectId {
        derive_id(&contents)
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl BackingStore for MemoryStore {
    fn get_tree(&self, id: &ObjectId) -> Result<Tree> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EdenError::StoreUnavailable(format!(
                "tree {} could not be fetched",
                id
            )));
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.trees
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EdenError::StoreUnavailable(format!("tree {} is not in the store", id)))
    }
}

fn derive_id<T: std::hash::Hash>(key: &T) -> ObjectId {
    let mut bytes = [0u8; ObjectId::LEN];
    for (i, chunk) in bytes.chunks_mut(8).enumerate() {
        let h = hash64(&(i, key)).to_be_bytes();
        chunk.copy_from_slice(&h[..chunk.len()]);
    }
    ObjectId::from_bytes(bytes)
}
