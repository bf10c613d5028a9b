//! In-memory inode graph: directory inodes, leaf file inodes, and the
//! process-wide registry coordinating loads and unloads.
//!
//! Ownership flows strictly downward: a parent directory's entry slot
//! holds the owning [`Arc`] of each loaded child, and children keep
//! non-owning [`Weak`] back-edges to their parents. Back-edges are only
//! mutated under the mount-wide rename lock, which is what makes path
//! computation and ancestor checks coherent.

pub mod checkout;
pub mod diff;
pub mod dir;
pub mod file;
pub mod inode_map;
pub mod metadata;
mod rename;
pub mod tree;

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::mount::{MountState, RenameLock};

pub use file::FileInode;
pub use tree::TreeInode;

/// A mount-unique inode identifier.
///
/// Allocated monotonically by the overlay; unique for the lifetime of the
/// mount's on-disk state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct InodeNumber(pub u64);

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The root directory's reserved inode number.
pub const ROOT_INODE: InodeNumber = InodeNumber(1);

/// Access, modification, and change times for one inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeTimestamps {
    /// Last access time.
    pub atime: SystemTime,
    /// Last content modification time.
    pub mtime: SystemTime,
    /// Last status change time.
    pub ctime: SystemTime,
}

impl InodeTimestamps {
    /// All three timestamps set to `now`.
    #[must_use]
    pub fn new(now: SystemTime) -> Self {
        Self {
            atime: now,
            mtime: now,
            ctime: now,
        }
    }
}

impl Default for InodeTimestamps {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

/// POSIX-like attributes returned by `getattr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeAttr {
    /// Inode number.
    pub ino: InodeNumber,
    /// File type and permission bits.
    pub mode: u32,
    /// Link count. Directories report `entries + 2` for `.` and `..`.
    pub nlink: u32,
    /// Content size in bytes (zero for directories).
    pub size: u64,
    /// Timestamps.
    pub timestamps: InodeTimestamps,
}

/// Attribute changes requested by `setattr`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    /// New permission bits (the file-type bits are preserved).
    pub mode: Option<u32>,
    /// New access time.
    pub atime: Option<SystemTime>,
    /// New modification time.
    pub mtime: Option<SystemTime>,
    /// New content size; only meaningful for regular files.
    pub size: Option<u64>,
}

/// A reference to a loaded inode of either kind.
#[derive(Clone)]
pub enum InodeHandle {
    /// A directory inode.
    Tree(Arc<TreeInode>),
    /// A leaf inode (regular file, symlink, or socket).
    File(Arc<FileInode>),
}

impl InodeHandle {
    /// The inode's number.
    #[must_use]
    pub fn number(&self) -> InodeNumber {
        match self {
            Self::Tree(t) => t.number(),
            Self::File(f) => f.number(),
        }
    }

    /// The inode's initial mode bits.
    #[must_use]
    pub fn mode(&self) -> u32 {
        match self {
            Self::Tree(t) => t.mode(),
            Self::File(f) => f.mode(),
        }
    }

    /// Whether this is a directory inode.
    #[must_use]
    pub fn is_tree(&self) -> bool {
        matches!(self, Self::Tree(_))
    }

    /// Borrow the directory inode, if this is one.
    #[must_use]
    pub fn as_tree(&self) -> Option<&Arc<TreeInode>> {
        match self {
            Self::Tree(t) => Some(t),
            Self::File(_) => None,
        }
    }

    /// Borrow the leaf inode, if this is one.
    #[must_use]
    pub fn as_file(&self) -> Option<&Arc<FileInode>> {
        match self {
            Self::File(f) => Some(f),
            Self::Tree(_) => None,
        }
    }

    /// Whether two handles refer to the same inode object.
    #[must_use]
    pub fn same_inode(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Tree(a), Self::Tree(b)) => Arc::ptr_eq(a, b),
            (Self::File(a), Self::File(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub(crate) fn core(&self) -> &InodeCore {
        match self {
            Self::Tree(t) => t.core(),
            Self::File(f) => f.core(),
        }
    }

    /// Whether the inode has been unlinked from the tree.
    #[must_use]
    pub fn is_unlinked(&self) -> bool {
        self.core().is_unlinked()
    }

    /// The mount-relative path of this inode, or `None` if unlinked.
    #[must_use]
    pub fn get_path(&self) -> Option<PathBuf> {
        self.core().get_path()
    }

    pub(crate) fn mark_unlinked(&self, lock: &RenameLock) {
        self.core().mark_unlinked(lock);
    }

    pub(crate) fn update_location(&self, lock: &RenameLock, parent: &Arc<TreeInode>, name: &OsStr) {
        self.core().update_location(lock, parent, name);
    }

    pub(crate) fn downgrade(&self) -> WeakInodeHandle {
        match self {
            Self::Tree(t) => WeakInodeHandle::Tree(Arc::downgrade(t)),
            Self::File(f) => WeakInodeHandle::File(Arc::downgrade(f)),
        }
    }

    /// External (kernel) reference count of this inode.
    #[must_use]
    pub fn kernel_refcount(&self) -> u64 {
        self.core().kernel_refcount.load(Ordering::Acquire)
    }

    /// Record one more external (kernel) reference.
    pub fn increment_kernel_refcount(&self) -> u64 {
        self.core().kernel_refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop `count` external references, saturating at zero.
    pub fn decrement_kernel_refcount(&self, count: u64) -> u64 {
        let core = self.core();
        let mut current = core.kernel_refcount.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(count);
            match core.kernel_refcount.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }
}

impl fmt::Debug for InodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tree(t) => write!(f, "InodeHandle::Tree({})", t.number()),
            Self::File(file) => write!(f, "InodeHandle::File({})", file.number()),
        }
    }
}

/// Non-owning counterpart of [`InodeHandle`], held by the inode map.
#[derive(Clone)]
pub enum WeakInodeHandle {
    /// A directory inode.
    Tree(Weak<TreeInode>),
    /// A leaf inode.
    File(Weak<FileInode>),
}

impl WeakInodeHandle {
    /// Upgrade to a strong handle if the inode is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<InodeHandle> {
        match self {
            Self::Tree(t) => t.upgrade().map(InodeHandle::Tree),
            Self::File(f) => f.upgrade().map(InodeHandle::File),
        }
    }
}

/// Where an inode currently sits in the tree.
struct Location {
    /// Non-owning edge to the parent directory; `None` for the root.
    parent: Option<Weak<TreeInode>>,
    /// Name of this inode within its parent.
    name: OsString,
    /// Set once the inode has been removed from its parent.
    unlinked: bool,
}

/// Identity and tree-position state shared by both inode kinds.
pub(crate) struct InodeCore {
    pub(crate) number: InodeNumber,
    pub(crate) mode: u32,
    pub(crate) mount: Arc<MountState>,
    location: Mutex<Location>,
    pub(crate) kernel_refcount: AtomicU64,
}

impl InodeCore {
    pub(crate) fn new(
        number: InodeNumber,
        mode: u32,
        mount: Arc<MountState>,
        parent: Option<&Arc<TreeInode>>,
        name: OsString,
    ) -> Self {
        Self {
            number,
            mode,
            mount,
            location: Mutex::new(Location {
                parent: parent.map(Arc::downgrade),
                name,
                unlinked: false,
            }),
            kernel_refcount: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_unlinked(&self) -> bool {
        self.location
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .unlinked
    }

    /// The name of this inode within its parent.
    pub(crate) fn name(&self) -> OsString {
        self.location
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .name
            .clone()
    }

    /// Upgrade the parent back-edge, if this inode has a parent.
    pub(crate) fn parent(&self) -> Option<Arc<TreeInode>> {
        self.location
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Compute the mount-relative path by walking parent edges.
    ///
    /// Returns `None` if this inode or any ancestor has been unlinked.
    pub(crate) fn get_path(&self) -> Option<PathBuf> {
        let mut components: Vec<OsString> = Vec::new();
        let mut cursor: Option<Arc<TreeInode>>;
        {
            let loc = self
                .location
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if loc.unlinked {
                return None;
            }
            match &loc.parent {
                None => return Some(PathBuf::new()),
                Some(parent) => {
                    components.push(loc.name.clone());
                    cursor = parent.upgrade();
                }
            }
        }
        while let Some(node) = cursor {
            let loc = node
                .core()
                .location
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if loc.unlinked {
                return None;
            }
            match &loc.parent {
                None => break,
                Some(parent) => {
                    components.push(loc.name.clone());
                    let next = parent.upgrade();
                    drop(loc);
                    cursor = next;
                }
            }
        }
        let mut path = PathBuf::new();
        for component in components.iter().rev() {
            path.push(component);
        }
        Some(path)
    }

    /// A best-effort path for log messages, never failing.
    pub(crate) fn log_path(&self) -> PathBuf {
        self.get_path()
            .unwrap_or_else(|| PathBuf::from(format!("<unlinked:{}>", self.number)))
    }

    /// Mark the inode unlinked. Requires the rename lock, which is what
    /// serializes location changes mount-wide.
    pub(crate) fn mark_unlinked(&self, _lock: &RenameLock) {
        self.location
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .unlinked = true;
    }

    /// Mark a freshly constructed inode unlinked before anyone else can
    /// observe it. Only valid during `load_unlinked_child`, where the
    /// inode is not yet reachable by name.
    pub(crate) fn mark_unlinked_after_load(&self) {
        self.location
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .unlinked = true;
    }

    /// Move the inode under a new parent and name.
    pub(crate) fn update_location(
        &self,
        _lock: &RenameLock,
        parent: &Arc<TreeInode>,
        name: &OsStr,
    ) {
        let mut loc = self
            .location
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        loc.parent = Some(Arc::downgrade(parent));
        loc.name = name.to_os_string();
    }
}

/// Maximum byte length of a single path component.
pub(crate) const MAX_NAME_LEN: usize = 255;

/// Reject path components the kernel would reject.
pub(crate) fn validate_name(name: &OsStr) -> Result<(), crate::errors::FsError> {
    let length = name.len();
    if length > MAX_NAME_LEN {
        return Err(crate::errors::FsError::NameTooLong { length });
    }
    Ok(())
}
