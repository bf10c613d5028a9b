//! scmfs is the directory-inode core of a source-control-backed writable
//! filesystem.
//!
//! A mount presents the contents of a source-control tree as a live,
//! writable directory hierarchy. Directories materialize lazily from
//! immutable [`scm::Tree`] objects on first access; user writes persist
//! into a local [`overlay::Overlay`] store keyed by inode number. On top
//! of that the crate provides POSIX-like directory mutations, a diff
//! engine honoring gitignore rules, and atomic checkout between trees
//! with conflict detection.
//!
//! The FUSE transport itself is out of scope: the crate exposes the
//! inode operations a transport needs ([`inodes::TreeInode`],
//! [`inodes::FileInode`]) and a [`fuse::InvalidationChannel`] seam for
//! kernel cache invalidation.

#![warn(missing_docs)]

pub mod errors;
pub mod fuse;
pub mod ignore;
pub mod inodes;
pub mod journal;
pub mod mount;
pub mod overlay;
pub mod scm;

pub use errors::{FsError, Result};
pub use inodes::checkout::{
    CheckoutConflict, CheckoutMode, CheckoutResult, ConflictType,
};
pub use inodes::diff::{CollectedDiff, DiffCallback, DiffCollector};
pub use inodes::{
    FileInode, InodeAttr, InodeHandle, InodeNumber, InodeTimestamps, SetAttr, TreeInode,
    ROOT_INODE,
};
pub use mount::{Mount, CONTROL_DIR_NAME};
pub use overlay::Overlay;
pub use scm::{Hash, MemoryObjectStore, ObjectStore, Tree, TreeEntry, TreeEntryType};
