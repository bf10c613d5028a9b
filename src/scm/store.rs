//! Object-store seam: retrieval of immutable trees and blobs by hash.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::errors::{FsError, Result};

use super::{Hash, Tree};

/// Read-only access to source-control objects.
///
/// Implementations are internally thread-safe; fetches may suspend.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Fetch a tree object by hash.
    async fn get_tree(&self, hash: Hash) -> Result<Arc<Tree>>;

    /// Fetch a blob's content by hash.
    async fn get_blob(&self, hash: Hash) -> Result<Bytes>;
}

/// In-memory object store used by tests and local mounts.
///
/// Counts tree fetches so tests can assert that concurrent lookups of the
/// same directory trigger exactly one load.
#[derive(Default)]
pub struct MemoryObjectStore {
    trees: std::sync::Mutex<FxHashMap<Hash, Arc<Tree>>>,
    blobs: std::sync::Mutex<FxHashMap<Hash, Bytes>>,
    tree_fetches: AtomicU64,
}

impl MemoryObjectStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tree object.
    pub fn put_tree(&self, tree: Tree) -> Hash {
        let hash = tree.hash();
        self.trees
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(hash, Arc::new(tree));
        hash
    }

    /// Insert a blob, keyed by the digest of its content.
    pub fn put_blob(&self, content: impl Into<Bytes>) -> Hash {
        let content = content.into();
        let hash = Hash::digest(&content);
        self.blobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(hash, content);
        hash
    }

    /// Total number of `get_tree` calls served so far.
    #[must_use]
    pub fn tree_fetch_count(&self) -> u64 {
        self.tree_fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get_tree(&self, hash: Hash) -> Result<Arc<Tree>> {
        self.tree_fetches.fetch_add(1, Ordering::Relaxed);
        self.trees
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&hash)
            .cloned()
            .ok_or(FsError::ObjectNotFound { hash })
    }

    async fn get_blob(&self, hash: Hash) -> Result<Bytes> {
        self.blobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&hash)
            .cloned()
            .ok_or(FsError::ObjectNotFound { hash })
    }
}
