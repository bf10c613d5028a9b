//! Directory inodes.
//!
//! A `TreeInode` guards one directory's contents behind a reader/writer
//! lock. Contents materialize lazily from an immutable source-control
//! tree on first access; mutations write through the overlay. The lock is
//! never held across a suspension point: every async path inspects state
//! under the lock, releases it, awaits, and reacquires to finalize.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use bytes::Bytes;
use rustc_hash::FxHashSet;
use tokio::sync::oneshot;

use crate::errors::{FsError, Result};
use crate::fuse::is_kernel_request;
use crate::journal::JournalDelta;
use crate::mount::{MountState, RenameLock};
use crate::scm::Hash;

use super::dir::{dir_from_tree, find_entry_differences, DirContents, DirEntry};
use super::file::FileInode;
use super::inode_map::InodeFuture;
use super::{
    validate_name, InodeAttr, InodeCore, InodeHandle, InodeNumber, InodeTimestamps, SetAttr,
    ROOT_INODE,
};

/// State guarded by the per-directory content lock.
pub(crate) struct TreeState {
    /// Children, ordered by name bytes.
    pub(crate) entries: DirContents,
    /// When present, this directory is identical to that source-control
    /// tree. When absent, the directory is materialized.
    pub(crate) tree_hash: Option<Hash>,
}

impl TreeState {
    /// Whether the overlay is this directory's source of truth.
    pub(crate) fn is_materialized(&self) -> bool {
        self.tree_hash.is_none()
    }
}

/// Parameters captured under the content lock for a child load performed
/// after the lock is released.
pub(crate) struct PendingChildLoad {
    name: OsString,
    number: InodeNumber,
    mode: u32,
    hash: Option<Hash>,
}

/// Which kind of child a remove operation expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoveKind {
    /// `unlink`: the child must not be a directory.
    File,
    /// `rmdir`: the child must be an empty directory.
    Dir,
}

/// Bounded retries for remove and rename when a concurrent rename swaps
/// the entry out from under us.
pub(crate) const MAX_STRUCTURAL_RETRIES: u32 = 3;

/// Debug snapshot of one directory.
#[derive(Debug, Clone)]
pub struct TreeInodeDebugInfo {
    /// The directory's inode number.
    pub number: InodeNumber,
    /// Best-effort path.
    pub path: PathBuf,
    /// Whether the directory is materialized.
    pub materialized: bool,
    /// The source-control hash when not materialized.
    pub tree_hash: Option<Hash>,
    /// Per-entry snapshots.
    pub entries: Vec<TreeEntryDebugInfo>,
}

/// Debug snapshot of one directory entry.
#[derive(Debug, Clone)]
pub struct TreeEntryDebugInfo {
    /// Entry name.
    pub name: OsString,
    /// Entry inode number.
    pub number: InodeNumber,
    /// Entry mode bits.
    pub mode: u32,
    /// Whether the entry is materialized.
    pub materialized: bool,
    /// Whether the child inode is loaded.
    pub loaded: bool,
}

/// A directory inode.
pub struct TreeInode {
    core: InodeCore,
    state: RwLock<TreeState>,
}

impl std::fmt::Debug for TreeInode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeInode")
            .field("number", &self.number())
            .finish()
    }
}

impl TreeInode {
    pub(crate) fn new(
        number: InodeNumber,
        mount: &Arc<MountState>,
        parent: Option<&Arc<TreeInode>>,
        name: OsString,
        mode: u32,
        entries: DirContents,
        tree_hash: Option<Hash>,
        timestamps: InodeTimestamps,
    ) -> Arc<Self> {
        mount.metadata.ensure(number, mode, timestamps);
        Arc::new(Self {
            core: InodeCore::new(number, mode, Arc::clone(mount), parent, name),
            state: RwLock::new(TreeState { entries, tree_hash }),
        })
    }

    pub(crate) fn new_root(
        mount: &Arc<MountState>,
        entries: DirContents,
        tree_hash: Option<Hash>,
        timestamps: InodeTimestamps,
    ) -> Arc<Self> {
        Self::new(
            ROOT_INODE,
            mount,
            None,
            OsString::new(),
            libc::S_IFDIR | 0o755,
            entries,
            tree_hash,
            timestamps,
        )
    }

    pub(crate) fn core(&self) -> &InodeCore {
        &self.core
    }

    pub(crate) fn mount(&self) -> &Arc<MountState> {
        &self.core.mount
    }

    /// The directory's inode number.
    #[must_use]
    pub fn number(&self) -> InodeNumber {
        self.core.number
    }

    /// The directory's initial mode bits.
    #[must_use]
    pub fn mode(&self) -> u32 {
        self.core.mode
    }

    /// Whether the directory has been unlinked.
    #[must_use]
    pub fn is_unlinked(&self) -> bool {
        self.core.is_unlinked()
    }

    /// The mount-relative path, or `None` if unlinked.
    #[must_use]
    pub fn get_path(&self) -> Option<PathBuf> {
        self.core.get_path()
    }

    pub(crate) fn log_path(&self) -> PathBuf {
        self.core.log_path()
    }

    pub(crate) fn child_log_path(&self, name: &OsStr) -> PathBuf {
        self.core.log_path().join(name)
    }

    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, TreeState> {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn write_state(&self) -> RwLockWriteGuard<'_, TreeState> {
        self.state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Whether the directory is currently materialized.
    #[must_use]
    pub fn is_materialized(&self) -> bool {
        self.read_state().is_materialized()
    }

    /// The source-control tree this directory equals, if not
    /// materialized.
    #[must_use]
    pub fn tree_hash(&self) -> Option<Hash> {
        self.read_state().tree_hash
    }

    /// Names of the directory's entries, in order.
    #[must_use]
    pub fn entry_names(&self) -> Vec<OsString> {
        self.read_state().entries.keys().cloned().collect()
    }

    // ── Attributes ──────────────────────────────────────────────────────

    /// Return POSIX-like attributes.
    #[must_use]
    pub fn getattr(&self) -> InodeAttr {
        let state = self.read_state();
        let meta = self
            .core
            .mount
            .metadata
            .get(self.core.number)
            .unwrap_or(super::metadata::InodeMetadata {
                mode: self.core.mode,
                timestamps: InodeTimestamps::default(),
            });
        InodeAttr {
            ino: self.core.number,
            mode: meta.mode,
            // "." and ".." plus one link per entry.
            nlink: state.entries.len() as u32 + 2,
            size: 0,
            timestamps: meta.timestamps,
        }
    }

    /// Apply attribute changes. Materializes the directory first so the
    /// change survives a remount.
    pub async fn setattr(self: &Arc<Self>, attr: SetAttr) -> Result<InodeAttr> {
        self.materialize().await;
        let number = self.core.number;
        let mount = &self.core.mount;
        if let Some(mode) = attr.mode {
            mount.metadata.set_permissions(number, mode);
        }
        if let Some(atime) = attr.atime {
            mount.metadata.update_atime(number, atime);
        }
        let now = SystemTime::now();
        mount
            .metadata
            .update_mtime_and_ctime(number, attr.mtime.unwrap_or(now));
        {
            let state = self.read_state();
            self.save_overlay_dir_locked(&state);
        }
        if let Some(path) = self.get_path() {
            mount.journal.add_delta(JournalDelta::Modified(path));
        }
        Ok(self.getattr())
    }

    // ── Child lookup ────────────────────────────────────────────────────

    /// The inode number assigned to `name`, without loading the child.
    pub fn get_child_inode_number(&self, name: &OsStr) -> Result<InodeNumber> {
        let state = self.read_state();
        match state.entries.get(name) {
            Some(entry) => {
                debug_assert!(
                    entry
                        .loaded()
                        .is_none_or(|handle| handle.number() == entry.number()),
                    "loaded inode number diverged from its entry"
                );
                Ok(entry.number())
            }
            None => Err(FsError::NotFound {
                path: self.child_log_path(name),
            }),
        }
    }

    /// Resolve `name` to a child inode, loading it if necessary.
    ///
    /// Concurrent callers for the same child coordinate through the inode
    /// map: exactly one performs the load, everyone receives the same
    /// object.
    pub async fn get_or_load_child(self: &Arc<Self>, name: &OsStr) -> Result<InodeHandle> {
        // Fast path under the read lock.
        {
            let state = self.read_state();
            match state.entries.get(name) {
                Some(entry) => {
                    if let Some(handle) = entry.loaded() {
                        return Ok(handle.clone());
                    }
                }
                None => {
                    drop(state);
                    return self.absent_child(name);
                }
            }
        }

        // Slow path: register with the inode map under the write lock.
        let mut pending = Vec::new();
        let receiver = {
            let state = self.write_state();
            match state.entries.get(name) {
                None => {
                    drop(state);
                    return self.absent_child(name);
                }
                Some(entry) => {
                    if let Some(handle) = entry.loaded() {
                        return Ok(handle.clone());
                    }
                    self.load_child_locked(name, entry, &mut pending)
                }
            }
        };

        // If we won the load election, perform the load now that the lock
        // is released; our own receiver resolves along with everyone
        // else's.
        for load in pending {
            Arc::clone(self).run_pending_load(load).await;
        }
        Self::await_load(receiver).await
    }

    fn absent_child(self: &Arc<Self>, name: &OsStr) -> Result<InodeHandle> {
        if self.core.number == ROOT_INODE && name == self.core.mount.control_name {
            return Ok(InodeHandle::Tree(self.core.mount.control()));
        }
        tracing::trace!(
            parent = %self.log_path().display(),
            ?name,
            "lookup of non-existent entry"
        );
        Err(FsError::NotFound {
            path: self.child_log_path(name),
        })
    }

    pub(crate) async fn await_load(receiver: InodeFuture) -> Result<InodeHandle> {
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(FsError::bug("inode load dropped without completing")),
        }
    }

    /// Resolve `name` to a child directory, failing with *not-a-directory*
    /// for leaf children.
    pub async fn get_or_load_child_tree(self: &Arc<Self>, name: &OsStr) -> Result<Arc<TreeInode>> {
        match self.get_or_load_child(name).await? {
            InodeHandle::Tree(tree) => Ok(tree),
            InodeHandle::File(_) => Err(FsError::NotADirectory {
                path: self.child_log_path(name),
            }),
        }
    }

    /// Resolve a multi-component relative path, loading each step.
    pub async fn get_child_recursive(self: &Arc<Self>, path: &Path) -> Result<InodeHandle> {
        let mut components = path.components().peekable();
        if components.peek().is_none() {
            return Ok(InodeHandle::Tree(Arc::clone(self)));
        }
        let mut current = Arc::clone(self);
        while let Some(component) = components.next() {
            let name = component.as_os_str();
            if components.peek().is_some() {
                current = current.get_or_load_child_tree(name).await?;
            } else {
                return current.get_or_load_child(name).await;
            }
        }
        unreachable!("loop returns on the final component");
    }

    // ── Load machinery ──────────────────────────────────────────────────

    /// Register a load for an unloaded entry while the caller holds the
    /// content lock.
    ///
    /// Returns the receiver every caller waits on. If this caller won the
    /// election, the load parameters are appended to `pending`; the
    /// caller must run them with [`run_pending_load`](Self::run_pending_load)
    /// after releasing the lock.
    pub(crate) fn load_child_locked(
        self: &Arc<Self>,
        name: &OsStr,
        entry: &DirEntry,
        pending: &mut Vec<PendingChildLoad>,
    ) -> InodeFuture {
        debug_assert!(entry.loaded().is_none(), "load requested for loaded entry");
        let (sender, receiver) = oneshot::channel();
        if self
            .core
            .mount
            .inode_map
            .should_load_child(entry.number(), sender)
        {
            pending.push(PendingChildLoad {
                name: name.to_os_string(),
                number: entry.number(),
                mode: entry.mode(),
                hash: entry.hash(),
            });
        }
        receiver
    }

    /// Perform a load won via [`load_child_locked`](Self::load_child_locked):
    /// construct the child, write it back into the entry, and fan the
    /// result out to every waiter.
    pub(crate) async fn run_pending_load(self: Arc<Self>, load: PendingChildLoad) {
        let number = load.number;
        let constructed = self.construct_child(&load).await;
        let handle = match constructed {
            Ok(handle) => handle,
            Err(err) => {
                self.core.mount.inode_map.inode_load_failed(number, &err);
                return;
            }
        };

        let mut state = self.write_state();
        let still_present = matches!(
            state.entries.get(&load.name),
            Some(entry) if entry.number() == number
        );
        if !still_present {
            drop(state);
            // rename(), unlink(), and rmdir() load children before
            // removing them, so a vanished entry here is unexpected.
            tracing::error!(
                name = ?load.name,
                %number,
                parent = %self.log_path().display(),
                "child removed before its load finished"
            );
            let err = FsError::NotFound {
                path: self.child_log_path(&load.name),
            };
            self.core.mount.inode_map.inode_load_failed(number, &err);
            return;
        }
        let entry = state
            .entries
            .get_mut(&load.name)
            .expect("presence checked above");
        entry.set_loaded(handle.clone());
        // Register with the inode map while still holding the content
        // lock so nobody can find the child by name before the map knows
        // it; fulfill the waiters only after releasing it.
        let waiters = self.core.mount.inode_map.inode_load_complete(&handle);
        drop(state);
        for waiter in waiters {
            let _ = waiter.send(Ok(handle.clone()));
        }
    }

    async fn construct_child(self: &Arc<Self>, load: &PendingChildLoad) -> Result<InodeHandle> {
        let mount = &self.core.mount;
        if load.mode & libc::S_IFMT != libc::S_IFDIR {
            return Ok(InodeHandle::File(FileInode::new(
                load.number,
                mount,
                Some(self),
                load.name.clone(),
                load.mode,
                load.hash,
            )));
        }

        if let Some(hash) = load.hash {
            // A directory that still equals a source-control tree. The
            // overlay may nevertheless hold a record for it: inode-number
            // assignments are persisted the first time the directory is
            // loaded, and those assignments win over freshly allocated
            // ones.
            let tree = mount.store.get_tree(hash).await?;
            let (entries, timestamps) = match mount.overlay.load_overlay_dir(load.number)? {
                Some(saved) => {
                    if let Some(differences) = find_entry_differences(&saved.entries, &tree) {
                        tracing::warn!(
                            path = %self.child_log_path(&load.name).display(),
                            %hash,
                            ?differences,
                            "overlay dir diverges from its source-control tree"
                        );
                    }
                    (saved.entries, saved.timestamps)
                }
                None => {
                    let entries = dir_from_tree(&tree, &mount.overlay);
                    let timestamps = InodeTimestamps::new(SystemTime::now());
                    mount
                        .overlay
                        .save_overlay_dir(load.number, &entries, Some(hash), timestamps);
                    (entries, timestamps)
                }
            };
            return Ok(InodeHandle::Tree(TreeInode::new(
                load.number,
                mount,
                Some(self),
                load.name.clone(),
                load.mode,
                entries,
                Some(hash),
                timestamps,
            )));
        }

        // Materialized directory: the overlay record must exist.
        let saved = mount.overlay.load_overlay_dir(load.number)?.ok_or_else(|| {
            tracing::error!(
                path = %self.child_log_path(&load.name).display(),
                number = %load.number,
                "missing overlay data for materialized directory"
            );
            FsError::bug(format!(
                "missing overlay data for materialized directory {}",
                load.number
            ))
        })?;
        Ok(InodeHandle::Tree(TreeInode::new(
            load.number,
            mount,
            Some(self),
            load.name.clone(),
            load.mode,
            saved.entries,
            None,
            saved.timestamps,
        )))
    }

    /// Load a child that has already been unlinked but is still
    /// referenced, reconstructing it from the overlay alone.
    pub(crate) fn load_unlinked_child(
        self: &Arc<Self>,
        name: &OsStr,
        number: InodeNumber,
        hash: Option<Hash>,
        mode: u32,
    ) {
        let mount = Arc::clone(&self.core.mount);
        let result: Result<InodeHandle> = (|| {
            if mode & libc::S_IFMT != libc::S_IFDIR {
                return Ok(InodeHandle::File(FileInode::new(
                    number,
                    &mount,
                    Some(self),
                    name.to_os_string(),
                    mode,
                    hash,
                )));
            }
            let saved = mount.overlay.load_overlay_dir(number)?;
            let (entries, timestamps) = match (hash, saved) {
                (None, Some(saved)) => {
                    if !saved.entries.is_empty() {
                        return Err(FsError::bug(format!(
                            "unlinked directory {number} should have no children"
                        )));
                    }
                    (saved.entries, saved.timestamps)
                }
                (None, None) => {
                    return Err(FsError::bug(format!(
                        "missing overlay data for materialized directory {number}"
                    )))
                }
                (Some(_), Some(saved)) => (saved.entries, saved.timestamps),
                (Some(_), None) => (DirContents::new(), InodeTimestamps::new(SystemTime::now())),
            };
            Ok(InodeHandle::Tree(TreeInode::new(
                number,
                &mount,
                Some(self),
                name.to_os_string(),
                mode,
                entries,
                hash,
                timestamps,
            )))
        })();

        match result {
            Ok(handle) => {
                handle.core().mark_unlinked_after_load();
                let waiters = mount.inode_map.inode_load_complete(&handle);
                for waiter in waiters {
                    let _ = waiter.send(Ok(handle.clone()));
                }
            }
            Err(err) => {
                tracing::error!(
                    %number,
                    ?name,
                    parent = %self.log_path().display(),
                    %err,
                    "failed to load unlinked child from the overlay"
                );
                mount.inode_map.inode_load_failed(number, &err);
            }
        }
    }

    // ── Mutations ───────────────────────────────────────────────────────

    /// Create a regular file with the given content.
    pub async fn create(
        self: &Arc<Self>,
        name: &OsStr,
        mode: u32,
        content: Bytes,
    ) -> Result<Arc<FileInode>> {
        // The caller's mode may lack the file type bits.
        let mode = libc::S_IFREG | (mode & 0o7777);
        self.create_leaf(name, mode, content).await
    }

    /// Create a symbolic link pointing at `target`.
    pub async fn symlink(self: &Arc<Self>, name: &OsStr, target: &OsStr) -> Result<Arc<FileInode>> {
        use std::os::unix::ffi::OsStrExt as _;
        let mode = libc::S_IFLNK | 0o777;
        self.create_leaf(name, mode, Bytes::copy_from_slice(target.as_bytes()))
            .await
    }

    /// Create a special node. Only unix domain sockets are supported.
    pub async fn mknod(self: &Arc<Self>, name: &OsStr, mode: u32) -> Result<Arc<FileInode>> {
        if mode & libc::S_IFMT != libc::S_IFSOCK {
            return Err(FsError::PermissionDenied {
                path: self.child_log_path(name),
            });
        }
        self.create_leaf(name, mode, Bytes::new()).await
    }

    async fn create_leaf(
        self: &Arc<Self>,
        name: &OsStr,
        mode: u32,
        content: Bytes,
    ) -> Result<Arc<FileInode>> {
        validate_name(name)?;
        if self.core.mount.is_control(self.core.number) {
            return Err(FsError::PermissionDenied {
                path: self.child_log_path(name),
            });
        }
        self.materialize().await;

        let mount = Arc::clone(&self.core.mount);
        let now = SystemTime::now();
        let target;
        let file;
        {
            let mut state = self.write_state();
            if state.entries.contains_key(name) {
                return Err(FsError::Exists {
                    path: self.child_log_path(name),
                });
            }
            // Check unlinked status after taking the content lock;
            // otherwise we race rmdir() and rename() affecting us.
            let my_path = self.get_path().ok_or_else(|| FsError::NotFound {
                path: self.log_path(),
            })?;
            target = my_path.join(name);

            let number = mount.overlay.allocate_inode_number();
            // Write the overlay file before the entry becomes visible.
            mount
                .overlay
                .create_overlay_file(number, InodeTimestamps::new(now), &content)?;

            file = FileInode::new(number, &mount, Some(self), name.to_os_string(), mode, None);
            let mut entry = DirEntry::new(mode, number, None);
            entry.set_loaded(InodeHandle::File(Arc::clone(&file)));
            state.entries.insert(name.to_os_string(), entry);
            mount
                .inode_map
                .inode_created(&InodeHandle::File(Arc::clone(&file)));

            mount.metadata.update_mtime_and_ctime(self.core.number, now);
            self.save_overlay_dir_locked(&state);
        }

        self.invalidate_kernel_cache_if_required(name);
        mount.journal.add_delta(JournalDelta::Created(target));
        Ok(file)
    }

    /// Create an empty subdirectory.
    pub async fn mkdir(self: &Arc<Self>, name: &OsStr, mode: u32) -> Result<Arc<TreeInode>> {
        validate_name(name)?;
        if self.core.mount.is_control(self.core.number) {
            return Err(FsError::PermissionDenied {
                path: self.child_log_path(name),
            });
        }
        self.materialize().await;

        let mount = Arc::clone(&self.core.mount);
        let now = SystemTime::now();
        let mode = libc::S_IFDIR | (mode & 0o7777);
        let target;
        let child;
        {
            let mut state = self.write_state();
            let my_path = self.get_path().ok_or_else(|| FsError::NotFound {
                path: self.log_path(),
            })?;
            target = my_path.join(name);
            if state.entries.contains_key(name) {
                return Err(FsError::Exists {
                    path: self.child_log_path(name),
                });
            }

            let number = mount.overlay.allocate_inode_number();
            let timestamps = InodeTimestamps::new(now);
            // Persist the empty child dir before it becomes visible.
            mount
                .overlay
                .save_overlay_dir(number, &DirContents::new(), None, timestamps);

            child = TreeInode::new(
                number,
                &mount,
                Some(self),
                name.to_os_string(),
                mode,
                DirContents::new(),
                None,
                timestamps,
            );
            let mut entry = DirEntry::new(mode, number, None);
            entry.set_loaded(InodeHandle::Tree(Arc::clone(&child)));
            state.entries.insert(name.to_os_string(), entry);
            mount
                .inode_map
                .inode_created(&InodeHandle::Tree(Arc::clone(&child)));

            mount.metadata.update_mtime_and_ctime(self.core.number, now);
            self.save_overlay_dir_locked(&state);
        }

        self.invalidate_kernel_cache_if_required(name);
        mount.journal.add_delta(JournalDelta::Created(target));
        Ok(child)
    }

    /// Remove a non-directory child.
    pub async fn unlink(self: &Arc<Self>, name: &OsStr) -> Result<()> {
        self.remove_child(name, RemoveKind::File).await
    }

    /// Remove an empty child directory.
    pub async fn rmdir(self: &Arc<Self>, name: &OsStr) -> Result<()> {
        self.remove_child(name, RemoveKind::Dir).await
    }

    async fn remove_child(self: &Arc<Self>, name: &OsStr, kind: RemoveKind) -> Result<()> {
        let mut child = self.get_or_load_child(name).await?;
        for attempt in 0..=MAX_STRUCTURAL_RETRIES {
            // Cheap pre-checks before materializing anything.
            self.check_pre_remove(name, &child, kind)?;

            let lock = self.core.mount.acquire_rename_lock().await;
            // Resolve the journal path under the rename lock so it
            // reflects the final location.
            let Some(my_path) = self.get_path() else {
                return Err(FsError::NotFound {
                    path: self.log_path(),
                });
            };
            let target = my_path.join(name);
            let flush = !is_kernel_request();

            // The entry may have been renamed since the child was
            // resolved; remove whatever now lives at this name.
            match self.try_remove_child(&lock, name, None, kind, flush) {
                Ok(()) => {
                    self.core
                        .mount
                        .journal
                        .add_delta(JournalDelta::Removed(target));
                    return Ok(());
                }
                Err(libc::EBADF) if attempt < MAX_STRUCTURAL_RETRIES => {
                    // The entry was replaced and its inode is not loaded;
                    // load the new occupant and retry.
                    drop(lock);
                    child = self.get_or_load_child(name).await?;
                }
                Err(libc::EBADF) => {
                    return Err(FsError::Io {
                        message: format!(
                            "entry {:?} kept changing while being removed",
                            self.child_log_path(name)
                        ),
                    });
                }
                Err(errno) => return Err(self.errno_error(errno, name)),
            }
        }
        unreachable!("retry loop either returns or exhausts attempts");
    }

    fn check_pre_remove(&self, name: &OsStr, child: &InodeHandle, kind: RemoveKind) -> Result<()> {
        match (kind, child) {
            (RemoveKind::File, InodeHandle::Tree(_)) => Err(FsError::IsADirectory {
                path: self.child_log_path(name),
            }),
            (RemoveKind::Dir, InodeHandle::File(_)) => Err(FsError::NotADirectory {
                path: self.child_log_path(name),
            }),
            (RemoveKind::Dir, InodeHandle::Tree(tree)) => {
                if tree.read_state().entries.is_empty() {
                    Ok(())
                } else {
                    Err(FsError::NotEmpty {
                        path: self.child_log_path(name),
                    })
                }
            }
            (RemoveKind::File, InodeHandle::File(_)) => Ok(()),
        }
    }

    /// Remove the entry at `name` under the rename lock.
    ///
    /// Returns raw errnos so retry logic can distinguish `EBADF` ("the
    /// entry changed, reload and retry") from terminal failures.
    pub(crate) fn try_remove_child(
        self: &Arc<Self>,
        lock: &RenameLock,
        name: &OsStr,
        expected: Option<&InodeHandle>,
        kind: RemoveKind,
        flush_kernel_cache: bool,
    ) -> std::result::Result<(), i32> {
        self.materialize_locked(lock);

        if self.core.mount.is_control(self.core.number) {
            return Err(libc::EPERM);
        }

        let deleted;
        {
            let mut state = self.write_state();
            let Some(entry) = state.entries.get(name) else {
                return Err(libc::ENOENT);
            };
            let Some(child) = entry.loaded().cloned() else {
                // Not loaded; the caller must load the current occupant
                // and retry.
                return Err(libc::EBADF);
            };
            if let Some(expected) = expected {
                if !child.same_inode(expected) {
                    return Err(libc::EBADF);
                }
            }
            match (kind, &child) {
                (RemoveKind::File, InodeHandle::Tree(_)) => return Err(libc::EISDIR),
                (RemoveKind::Dir, InodeHandle::File(_)) => return Err(libc::ENOTDIR),
                (RemoveKind::Dir, InodeHandle::Tree(tree)) => {
                    if !tree.read_state().entries.is_empty() {
                        return Err(libc::ENOTEMPTY);
                    }
                }
                (RemoveKind::File, InodeHandle::File(_)) => {}
            }

            child.mark_unlinked(lock);
            let removed = state
                .entries
                .remove(name)
                .expect("entry presence checked above");
            deleted = removed.into_loaded();

            self.core
                .mount
                .metadata
                .update_mtime_and_ctime(self.core.number, SystemTime::now());
            self.save_overlay_dir_locked(&state);
        }

        if flush_kernel_cache {
            self.invalidate_kernel_cache(name);
        }
        drop(deleted);
        Ok(())
    }

    pub(crate) fn errno_error(&self, errno: i32, name: &OsStr) -> FsError {
        let path = self.child_log_path(name);
        match errno {
            libc::ENOENT => FsError::NotFound { path },
            libc::EEXIST => FsError::Exists { path },
            libc::ENOTDIR => FsError::NotADirectory { path },
            libc::EISDIR => FsError::IsADirectory { path },
            libc::ENOTEMPTY => FsError::NotEmpty { path },
            libc::EPERM => FsError::PermissionDenied { path },
            other => FsError::Io {
                message: format!("errno {other} operating on {path:?}"),
            },
        }
    }

    // ── Materialization ─────────────────────────────────────────────────

    /// Make the overlay this directory's source of truth, materializing
    /// ancestors as needed.
    pub async fn materialize(self: &Arc<Self>) {
        {
            let state = self.read_state();
            if state.is_materialized() {
                return;
            }
        }
        let lock = self.core.mount.acquire_rename_lock().await;
        self.materialize_locked(&lock);
    }

    /// Materialize while already holding the rename lock.
    ///
    /// State changes happen only under the rename lock so that
    /// materialization and dematerialization cannot interleave their
    /// updates to this directory's overlay record and the parent's.
    pub(crate) fn materialize_locked(self: &Arc<Self>, lock: &RenameLock) {
        {
            let mut state = self.write_state();
            if state.is_materialized() {
                return;
            }
            // Write our own overlay record before updating the parent: a
            // parent claiming we are materialized while we have no
            // overlay data loses track of which tree our contents came
            // from, whereas the reverse is recoverable.
            state.tree_hash = None;
            self.save_overlay_dir_locked(&state);
        }
        if let Some(parent) = self.core.parent() {
            if !self.is_unlinked() {
                parent.child_materialized(lock, &self.core.name());
            }
        }
    }

    /// Record that the child at `name` became materialized, walking the
    /// materialization up the chain.
    pub(crate) fn child_materialized(self: &Arc<Self>, lock: &RenameLock, name: &OsStr) {
        {
            let mut state = self.write_state();
            let self_materialized = state.is_materialized();
            let Some(entry) = state.entries.get_mut(name) else {
                tracing::error!(
                    parent = %self.log_path().display(),
                    ?name,
                    "childMaterialized for a name that is not present"
                );
                return;
            };
            if self_materialized && entry.is_materialized() {
                return;
            }
            entry.set_materialized();
            state.tree_hash = None;
            self.save_overlay_dir_locked(&state);
        }
        if let Some(parent) = self.core.parent() {
            if !self.is_unlinked() {
                parent.child_materialized(lock, &self.core.name());
            }
        }
    }

    /// Record that the child at `name` dematerialized to `hash`.
    ///
    /// The child's entry gets the hash, but this directory marks itself
    /// materialized so the new hash is captured; checkout's post-pass
    /// re-dematerializes this directory afterwards if possible.
    pub(crate) fn child_dematerialized(
        self: &Arc<Self>,
        lock: &RenameLock,
        name: &OsStr,
        hash: Hash,
    ) {
        {
            let mut state = self.write_state();
            let Some(entry) = state.entries.get_mut(name) else {
                tracing::error!(
                    parent = %self.log_path().display(),
                    ?name,
                    "childDematerialized for a name that is not present"
                );
                return;
            };
            if !entry.is_materialized() && entry.hash() == Some(hash) {
                return;
            }
            entry.set_dematerialized(hash);
            state.tree_hash = None;
            self.save_overlay_dir_locked(&state);
        }
        if let Some(parent) = self.core.parent() {
            if !self.is_unlinked() {
                parent.child_materialized(lock, &self.core.name());
            }
        }
    }

    pub(crate) fn save_overlay_dir_locked(&self, state: &TreeState) {
        let timestamps = self
            .core
            .mount
            .metadata
            .get(self.core.number)
            .map_or_else(InodeTimestamps::default, |meta| meta.timestamps);
        self.core.mount.overlay.save_overlay_dir(
            self.core.number,
            &state.entries,
            state.tree_hash,
            timestamps,
        );
    }

    // ── Kernel cache invalidation ───────────────────────────────────────

    pub(crate) fn invalidate_kernel_cache(&self, name: &OsStr) {
        if let Some(channel) = &self.core.mount.channel {
            channel.invalidate_entry(self.core.number, name);
        }
    }

    pub(crate) fn invalidate_kernel_cache_if_required(&self, name: &OsStr) {
        // The kernel updates its own cache for the operation it is
        // currently asking us to perform.
        if is_kernel_request() {
            return;
        }
        self.invalidate_kernel_cache(name);
    }

    // ── Prefetch and startup loads ──────────────────────────────────────

    /// Load every child of this directory, warming caches.
    pub async fn prefetch(self: &Arc<Self>) -> Result<()> {
        let names = self.entry_names();
        let loads = names.iter().map(|name| self.get_or_load_child(name));
        for outcome in futures::future::join_all(loads).await {
            if let Err(err) = outcome {
                tracing::warn!(%err, "prefetch load failed");
            }
        }
        Ok(())
    }

    /// Recursively load every materialized child, as done after mounting
    /// existing overlay state.
    pub fn load_materialized_children(
        self: &Arc<Self>,
    ) -> futures::future::BoxFuture<'static, Result<()>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            let mut pending = Vec::new();
            let receivers = {
                let state = this.write_state();
                if !state.is_materialized() {
                    return Ok(());
                }
                let mut receivers = Vec::new();
                for (name, entry) in &state.entries {
                    if !entry.is_materialized() || entry.loaded().is_some() {
                        continue;
                    }
                    receivers.push(this.load_child_locked(name, entry, &mut pending));
                }
                receivers
            };

            for load in pending {
                Arc::clone(&this).run_pending_load(load).await;
            }

            for receiver in receivers {
                match Self::await_load(receiver).await {
                    Ok(InodeHandle::Tree(child)) => child.load_materialized_children().await?,
                    Ok(InodeHandle::File(_)) => {}
                    Err(err) => {
                        tracing::warn!(%err, "failed to load materialized child");
                    }
                }
            }
            Ok(())
        })
    }

    // ── Unloading ───────────────────────────────────────────────────────

    /// Unload every loaded descendant with no external references.
    pub fn unload_children_now(self: &Arc<Self>) {
        let tree_children: Vec<Arc<TreeInode>> = {
            let state = self.read_state();
            state
                .entries
                .values()
                .filter_map(|entry| entry.loaded().and_then(InodeHandle::as_tree).cloned())
                .collect()
        };
        // Depth-first: descendants must unload before their parents can.
        for child in &tree_children {
            child.unload_children_now();
        }
        drop(tree_children);

        let mut evicted = Vec::new();
        {
            let mut state = self.write_state();
            let unload_guard = self.core.mount.inode_map.lock_for_unload();
            for entry in state.entries.values_mut() {
                let Some(handle) = entry.loaded() else { continue };
                if !Self::can_evict(handle) {
                    continue;
                }
                let refcount = handle.kernel_refcount();
                self.core
                    .mount
                    .inode_map
                    .unload_inode(entry.number(), refcount, &unload_guard);
                if let Some(handle) = entry.clear_loaded() {
                    evicted.push(handle);
                }
            }
        }
        // Free the inode objects outside of the locks.
        drop(evicted);
    }

    fn can_evict(handle: &InodeHandle) -> bool {
        if handle.kernel_refcount() != 0 {
            return false;
        }
        match handle {
            InodeHandle::File(_) => true,
            InodeHandle::Tree(tree) => tree
                .read_state()
                .entries
                .values()
                .all(|entry| entry.loaded().is_none()),
        }
    }

    /// Unload loaded descendants whose access time is older than
    /// `cutoff`. Returns the number of inodes unloaded.
    pub fn unload_children_last_accessed_before(self: &Arc<Self>, cutoff: SystemTime) -> usize {
        // Phase 1: snapshot strong references under the read lock.
        let children: Vec<InodeHandle> = {
            let state = self.read_state();
            state
                .entries
                .values()
                .filter_map(|entry| entry.loaded().cloned())
                .collect()
        };

        // Phase 2: consult access times without the parent lock held.
        let mut stale: FxHashSet<InodeNumber> = FxHashSet::default();
        for child in &children {
            let atime = self
                .core
                .mount
                .metadata
                .get(child.number())
                .map(|meta| meta.timestamps.atime);
            if atime.is_some_and(|atime| atime < cutoff) {
                stale.insert(child.number());
            }
        }

        // Recurse first: children hold the only references keeping their
        // own descendants loaded.
        let mut unloaded = 0;
        for child in &children {
            if let InodeHandle::Tree(tree) = child {
                unloaded += tree.unload_children_last_accessed_before(cutoff);
            }
        }
        drop(children);

        // Phase 3: evict exactly the stale children whose refcount is now
        // zero.
        let mut evicted = Vec::new();
        {
            let mut state = self.write_state();
            let unload_guard = self.core.mount.inode_map.lock_for_unload();
            for entry in state.entries.values_mut() {
                let Some(handle) = entry.loaded() else { continue };
                if !stale.contains(&entry.number()) || !Self::can_evict(handle) {
                    continue;
                }
                let refcount = handle.kernel_refcount();
                self.core
                    .mount
                    .inode_map
                    .unload_inode(entry.number(), refcount, &unload_guard);
                if let Some(handle) = entry.clear_loaded() {
                    evicted.push(handle);
                }
            }
        }
        unloaded += evicted.len();
        drop(evicted);
        unloaded
    }

    // ── Debugging ───────────────────────────────────────────────────────

    /// Append a snapshot of this directory (and recursively every loaded
    /// child directory) to `out`.
    pub fn debug_status(&self, out: &mut Vec<TreeInodeDebugInfo>) {
        let children: Vec<Arc<TreeInode>>;
        {
            let state = self.read_state();
            let entries = state
                .entries
                .iter()
                .map(|(name, entry)| TreeEntryDebugInfo {
                    name: name.clone(),
                    number: entry.number(),
                    mode: entry.mode(),
                    materialized: entry.is_materialized(),
                    loaded: entry.loaded().is_some(),
                })
                .collect();
            out.push(TreeInodeDebugInfo {
                number: self.core.number,
                path: self.log_path(),
                materialized: state.is_materialized(),
                tree_hash: state.tree_hash,
                entries,
            });
            children = state
                .entries
                .values()
                .filter_map(|entry| entry.loaded().and_then(InodeHandle::as_tree).cloned())
                .collect();
        }
        for child in children {
            child.debug_status(out);
        }
    }
}
