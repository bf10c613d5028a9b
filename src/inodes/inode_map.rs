//! Process-wide registry of loaded inodes and in-progress loads.
//!
//! The map guarantees the single-loader property: for any inode number,
//! at most one caller constructs the inode while every concurrent caller
//! receives a promise fulfilled with the same object (or the same
//! failure). Parents drive the actual construction; the map only
//! coordinates.

use std::collections::hash_map::Entry;
use std::sync::{Mutex, MutexGuard};

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::oneshot;

use crate::errors::FsError;

use super::{InodeHandle, InodeNumber, WeakInodeHandle};

/// Fulfilled with the loaded inode, or the load failure, exactly once.
pub type InodePromise = oneshot::Sender<Result<InodeHandle, FsError>>;

/// Receiving side handed to each waiter.
pub type InodeFuture = oneshot::Receiver<Result<InodeHandle, FsError>>;

#[derive(Default)]
struct Registry {
    /// Inode number → loaded inode. Weak: parents own their children.
    loaded: FxHashMap<InodeNumber, WeakInodeHandle>,
    /// Inode number → promises waiting on an in-progress load.
    pending: FxHashMap<InodeNumber, Vec<InodePromise>>,
    /// Unloaded inodes the kernel still holds references to.
    remembered: FxHashSet<InodeNumber>,
}

/// Guard proving the unload lock is held.
///
/// Acquired after a parent's content lock, never before; the ordering is
/// uniform across the whole system.
pub struct UnloadGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

/// The mount's inode registry.
#[derive(Default)]
pub struct InodeMap {
    registry: Mutex<Registry>,
    unload_lock: Mutex<()>,
}

impl InodeMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether the caller should construct the inode for `number`.
    ///
    /// Registers `promise` either way. Returns `true` for exactly one
    /// caller per in-flight load; everyone else joins the pending list.
    pub fn should_load_child(&self, number: InodeNumber, promise: InodePromise) -> bool {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match registry.pending.entry(number) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().push(promise);
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(vec![promise]);
                true
            }
        }
    }

    /// Record a completed load and hand back every waiting promise.
    ///
    /// The caller must invoke this while still holding the parent's
    /// content lock (so nobody can find the child by name before it is
    /// registered here), and must fulfill the returned promises only
    /// after releasing that lock.
    #[must_use]
    pub fn inode_load_complete(&self, inode: &InodeHandle) -> Vec<InodePromise> {
        let number = inode.number();
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        registry.loaded.insert(number, inode.downgrade());
        registry.remembered.remove(&number);
        registry.pending.remove(&number).unwrap_or_default()
    }

    /// Record an inode constructed directly by a mutation (create/mkdir).
    pub fn inode_created(&self, inode: &InodeHandle) {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        registry.loaded.insert(inode.number(), inode.downgrade());
    }

    /// Fail an in-progress load, delivering `error` to every waiter.
    pub fn inode_load_failed(&self, number: InodeNumber, error: &FsError) {
        let waiters = {
            let mut registry = self
                .registry
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            registry.pending.remove(&number).unwrap_or_default()
        };
        for promise in waiters {
            let _ = promise.send(Err(error.clone()));
        }
    }

    /// Look up a loaded inode by number.
    #[must_use]
    pub fn lookup_loaded(&self, number: InodeNumber) -> Option<InodeHandle> {
        let registry = self
            .registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        registry.loaded.get(&number).and_then(WeakInodeHandle::upgrade)
    }

    /// Whether an unloaded inode with this number is still referenced by
    /// the kernel.
    #[must_use]
    pub fn is_inode_remembered(&self, number: InodeNumber) -> bool {
        let registry = self
            .registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        registry.remembered.contains(&number)
    }

    /// Acquire the unload lock. Always taken after the parent's content
    /// lock.
    #[must_use]
    pub fn lock_for_unload(&self) -> UnloadGuard<'_> {
        UnloadGuard {
            _guard: self
                .unload_lock
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        }
    }

    /// Remove `inode` from the loaded table while it is being evicted.
    ///
    /// If the kernel still holds references, the number is remembered so a
    /// later kernel operation can observe that fact.
    pub fn unload_inode(&self, number: InodeNumber, kernel_refcount: u64, _guard: &UnloadGuard<'_>) {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        registry.loaded.remove(&number);
        if kernel_refcount > 0 {
            registry.remembered.insert(number);
        }
    }

    /// Number of inodes currently registered as loaded.
    #[must_use]
    pub fn loaded_count(&self) -> usize {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        registry
            .loaded
            .retain(|_, weak| weak.upgrade().is_some());
        registry.loaded.len()
    }
}
