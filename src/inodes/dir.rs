//! Directory contents: the per-directory ordered entry map.

use std::collections::BTreeMap;
use std::ffi::OsString;

use crate::overlay::Overlay;
use crate::scm::{mode_from_tree_entry_type, Hash, Tree};

use super::{InodeHandle, InodeNumber};

/// One child of a directory.
///
/// Two invariants tie the fields together: an entry has a `hash` exactly
/// when it is not materialized, and a set `loaded` handle always carries
/// the entry's own inode number.
#[derive(Debug, Clone)]
pub struct DirEntry {
    mode: u32,
    number: InodeNumber,
    hash: Option<Hash>,
    loaded: Option<InodeHandle>,
}

impl DirEntry {
    /// Create an entry. `hash` present means "identical to that
    /// source-control object"; absent means materialized.
    #[must_use]
    pub fn new(mode: u32, number: InodeNumber, hash: Option<Hash>) -> Self {
        Self {
            mode,
            number,
            hash,
            loaded: None,
        }
    }

    /// The entry's initial file type and permission bits.
    #[must_use]
    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// The entry's inode number.
    #[must_use]
    pub fn number(&self) -> InodeNumber {
        self.number
    }

    /// Whether the entry is a directory.
    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    /// The source-control hash, present iff the entry is not
    /// materialized.
    #[must_use]
    pub fn hash(&self) -> Option<Hash> {
        self.hash
    }

    /// Whether the entry's source of truth is the overlay.
    #[must_use]
    pub fn is_materialized(&self) -> bool {
        self.hash.is_none()
    }

    /// Mark the entry materialized (drop the source-control hash).
    pub fn set_materialized(&mut self) {
        self.hash = None;
    }

    /// Mark the entry identical to the source-control object `hash`.
    pub fn set_dematerialized(&mut self, hash: Hash) {
        self.hash = Some(hash);
    }

    /// The loaded child inode, if present in memory.
    #[must_use]
    pub fn loaded(&self) -> Option<&InodeHandle> {
        self.loaded.as_ref()
    }

    /// Attach the loaded child inode.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if the handle's number differs from the
    /// entry's.
    pub fn set_loaded(&mut self, handle: InodeHandle) {
        debug_assert_eq!(
            handle.number(),
            self.number,
            "loaded inode number must match its directory entry"
        );
        self.loaded = Some(handle);
    }

    /// Detach and return the loaded child inode.
    pub fn clear_loaded(&mut self) -> Option<InodeHandle> {
        self.loaded.take()
    }

    /// Consume the entry, returning the loaded child if any.
    #[must_use]
    pub fn into_loaded(self) -> Option<InodeHandle> {
        self.loaded
    }
}

/// Ordered map of path component → entry.
///
/// `BTreeMap` over `OsString` compares keys by bytes, which matches the
/// order source-control trees enumerate their entries in. The diff and
/// checkout merge-walks rely on the two orders agreeing.
pub type DirContents = BTreeMap<OsString, DirEntry>;

/// Build directory contents from a source-control tree, allocating a
/// fresh inode number for every entry.
#[must_use]
pub fn dir_from_tree(tree: &Tree, overlay: &Overlay) -> DirContents {
    let mut contents = DirContents::new();
    for entry in tree.entries() {
        contents.insert(
            entry.name().to_os_string(),
            DirEntry::new(
                mode_from_tree_entry_type(entry.ttype()),
                overlay.allocate_inode_number(),
                Some(entry.hash()),
            ),
        );
    }
    contents
}

/// Compare directory contents loaded from the overlay against the
/// source-control tree they claim to equal, returning a description of
/// each difference.
///
/// Used when loading a non-materialized directory that has saved overlay
/// data: the overlay's inode-number assignments win, but divergence from
/// the tree indicates an earlier bug and is worth logging.
#[must_use]
pub fn find_entry_differences(contents: &DirContents, tree: &Tree) -> Option<Vec<String>> {
    let mut differences = Vec::new();
    for tree_entry in tree.entries() {
        if !contents.contains_key(tree_entry.name()) {
            differences.push(format!("missing entry {:?}", tree_entry.name()));
        }
    }
    for name in contents.keys() {
        if tree.get(name).is_none() {
            differences.push(format!("extra entry {name:?}"));
        }
    }
    if differences.is_empty() {
        None
    } else {
        Some(differences)
    }
}
