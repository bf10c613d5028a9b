//! Mount-global state and wiring.
//!
//! A [`Mount`] assembles the collaborators (object store, overlay,
//! journal, inode map, metadata table, invalidation channel) and owns the
//! root directory inode plus the reserved control directory. It also
//! hosts the mount-wide rename lock that serializes structural
//! transitions.

use std::ffi::{OsStr, OsString};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::SystemTime;

use crate::errors::{FsError, Result};
use crate::fuse::InvalidationChannel;
use crate::inodes::checkout::{CheckoutContext, CheckoutMode, CheckoutResult};
use crate::inodes::diff::{DiffCallback, DiffContext};
use crate::inodes::dir::{dir_from_tree, DirContents};
use crate::inodes::inode_map::InodeMap;
use crate::inodes::metadata::InodeMetadataTable;
use crate::inodes::{InodeHandle, InodeNumber, InodeTimestamps, TreeInode, ROOT_INODE};
use crate::journal::Journal;
use crate::overlay::Overlay;
use crate::scm::{Hash, ObjectStore};

/// Name of the reserved control directory under the root.
pub const CONTROL_DIR_NAME: &str = ".scmfs";

/// Exclusive hold on the mount-wide rename lock.
///
/// Structural transitions (rename, materialization state changes,
/// checkout) happen only while one of these is held, which is what makes
/// parent back-edge walks coherent. The guard is also the capability
/// token threaded through those code paths.
pub struct RenameLock {
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

/// Shared mount-global state. Every inode holds a reference.
pub(crate) struct MountState {
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) overlay: Overlay,
    pub(crate) journal: Journal,
    pub(crate) inode_map: InodeMap,
    pub(crate) metadata: InodeMetadataTable,
    pub(crate) channel: Option<Arc<dyn InvalidationChannel>>,
    pub(crate) control_name: OsString,
    rename_lock: Arc<tokio::sync::Mutex<()>>,
    root: OnceLock<Arc<TreeInode>>,
    control: OnceLock<Arc<TreeInode>>,
    checked_out: Mutex<Option<Hash>>,
}

impl MountState {
    /// Acquire the mount-wide rename lock.
    pub(crate) async fn acquire_rename_lock(&self) -> RenameLock {
        RenameLock {
            _guard: Arc::clone(&self.rename_lock).lock_owned().await,
        }
    }

    pub(crate) fn root(&self) -> Arc<TreeInode> {
        Arc::clone(self.root.get().expect("mount root is set during Mount::new"))
    }

    pub(crate) fn control(&self) -> Arc<TreeInode> {
        Arc::clone(
            self.control
                .get()
                .expect("control dir is set during Mount::new"),
        )
    }

    /// Whether `number` is the reserved control directory.
    pub(crate) fn is_control(&self, number: InodeNumber) -> bool {
        self.control
            .get()
            .is_some_and(|control| control.number() == number)
    }
}

/// A mounted source-control-backed filesystem.
pub struct Mount {
    state: Arc<MountState>,
}

impl Mount {
    /// Mount `initial_tree` (or an empty root when `None`) backed by
    /// `store` and `overlay`.
    ///
    /// If the overlay already holds a root directory record from an
    /// earlier mount of the same state, that record wins: the root's
    /// entries and materialization are restored from it.
    pub async fn new(
        store: Arc<dyn ObjectStore>,
        overlay: Overlay,
        channel: Option<Arc<dyn InvalidationChannel>>,
        initial_tree: Option<Hash>,
    ) -> Result<Self> {
        let state = Arc::new(MountState {
            store,
            overlay,
            journal: Journal::new(),
            inode_map: InodeMap::new(),
            metadata: InodeMetadataTable::new(),
            channel,
            control_name: OsString::from(CONTROL_DIR_NAME),
            rename_lock: Arc::new(tokio::sync::Mutex::new(())),
            root: OnceLock::new(),
            control: OnceLock::new(),
            checked_out: Mutex::new(initial_tree),
        });

        let now = SystemTime::now();
        let root = if let Some(saved) = state.overlay.load_overlay_dir(ROOT_INODE)? {
            TreeInode::new_root(&state, saved.entries, saved.tree_hash, saved.timestamps)
        } else if let Some(hash) = initial_tree {
            let tree = state.store.get_tree(hash).await?;
            let entries = dir_from_tree(&tree, &state.overlay);
            let timestamps = InodeTimestamps::new(now);
            state
                .overlay
                .save_overlay_dir(ROOT_INODE, &entries, Some(hash), timestamps);
            TreeInode::new_root(&state, entries, Some(hash), timestamps)
        } else {
            let entries = DirContents::new();
            let timestamps = InodeTimestamps::new(now);
            state
                .overlay
                .save_overlay_dir(ROOT_INODE, &entries, None, timestamps);
            TreeInode::new_root(&state, entries, None, timestamps)
        };
        state
            .inode_map
            .inode_created(&InodeHandle::Tree(Arc::clone(&root)));
        state
            .root
            .set(root)
            .map_err(|_| FsError::bug("mount root initialized twice"))?;

        // The control directory is synthetic: it resolves by name under
        // the root but never appears in the root's entries.
        let control_number = state.overlay.allocate_inode_number();
        let timestamps = InodeTimestamps::new(now);
        let control = TreeInode::new(
            control_number,
            &state,
            Some(&state.root()),
            state.control_name.clone(),
            libc::S_IFDIR | 0o755,
            DirContents::new(),
            None,
            timestamps,
        );
        state
            .overlay
            .save_overlay_dir(control_number, &DirContents::new(), None, timestamps);
        state
            .inode_map
            .inode_created(&InodeHandle::Tree(Arc::clone(&control)));
        state
            .control
            .set(control)
            .map_err(|_| FsError::bug("control dir initialized twice"))?;

        Ok(Self { state })
    }

    /// The root directory inode.
    #[must_use]
    pub fn root(&self) -> Arc<TreeInode> {
        self.state.root()
    }

    /// The reserved control directory inode.
    #[must_use]
    pub fn control_dir(&self) -> Arc<TreeInode> {
        self.state.control()
    }

    /// The mount's change journal.
    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.state.journal
    }

    /// The hash of the currently checked-out tree, if any.
    #[must_use]
    pub fn current_tree(&self) -> Option<Hash> {
        *self
            .state
            .checked_out
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Diff the live tree against the currently checked-out tree.
    pub async fn diff(&self, callback: Arc<dyn DiffCallback>, list_ignored: bool) -> Result<()> {
        self.diff_against(self.current_tree(), callback, list_ignored)
            .await
    }

    /// Diff the live tree against an arbitrary tree (or the empty tree).
    pub async fn diff_against(
        &self,
        tree: Option<Hash>,
        callback: Arc<dyn DiffCallback>,
        list_ignored: bool,
    ) -> Result<()> {
        let tree = match tree {
            Some(hash) => Some(self.state.store.get_tree(hash).await?),
            None => None,
        };
        let ctx = Arc::new(DiffContext::new(Arc::clone(&self.state), callback, list_ignored));
        let root_ignore =
            crate::ignore::GitIgnoreStack::root(vec![self.state.control_name.clone()]);
        self.state
            .root()
            .diff(&ctx, std::path::PathBuf::new(), tree, root_ignore, false)
            .await
    }

    /// Atomically transition the mount from the currently checked-out
    /// tree to `to`.
    ///
    /// Holds the rename lock for the duration, so no rename or
    /// materialization change can interleave. Returns the conflicts (and
    /// per-leaf errors) the walk observed.
    pub async fn checkout(&self, to: Option<Hash>, mode: CheckoutMode) -> Result<CheckoutResult> {
        let from_hash = self.current_tree();
        let from_tree = match from_hash {
            Some(hash) => Some(self.state.store.get_tree(hash).await?),
            None => None,
        };
        let to_tree = match to {
            Some(hash) => Some(self.state.store.get_tree(hash).await?),
            None => None,
        };

        let rename_lock = self.state.acquire_rename_lock().await;
        let ctx = Arc::new(CheckoutContext::new(
            Arc::clone(&self.state),
            mode,
            rename_lock,
        ));
        self.state.root().checkout(&ctx, from_tree, to_tree).await?;
        let result = CheckoutContext::finish(ctx);

        if !mode.is_dry_run() {
            *self
                .state
                .checked_out
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = to;
        }
        Ok(result)
    }

    /// Flush buffered overlay writes to their backing store.
    pub fn flush(&self) {
        self.state.overlay.flush();
    }

    /// Flush and shut down the overlay. The mount is unusable for
    /// further writes afterwards.
    pub fn close(&self) {
        self.state.overlay.close();
    }
}

impl Mount {
    /// Name of the reserved control directory.
    #[must_use]
    pub fn control_dir_name(&self) -> &OsStr {
        &self.state.control_name
    }
}
