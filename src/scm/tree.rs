//! Source-control tree objects.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt as _;

use super::{Hash, TreeEntryType};

/// One named entry of a source-control tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    name: OsString,
    ttype: TreeEntryType,
    hash: Hash,
}

impl TreeEntry {
    /// Create an entry.
    pub fn new(name: impl Into<OsString>, ttype: TreeEntryType, hash: Hash) -> Self {
        Self {
            name: name.into(),
            ttype,
            hash,
        }
    }

    /// The entry's name within its tree.
    #[must_use]
    pub fn name(&self) -> &OsStr {
        &self.name
    }

    /// The entry's type.
    #[must_use]
    pub fn ttype(&self) -> TreeEntryType {
        self.ttype
    }

    /// Whether the entry refers to a subtree.
    #[must_use]
    pub fn is_tree(&self) -> bool {
        self.ttype.is_tree()
    }

    /// The content hash of the referenced object.
    #[must_use]
    pub fn hash(&self) -> Hash {
        self.hash
    }
}

/// An immutable source-control tree: a list of entries sorted by name
/// bytes.
///
/// The sort order is load-bearing. Directory contents are kept in the
/// same order, and the diff and checkout engines merge-walk the two
/// sequences side by side.
#[derive(Debug, Clone)]
pub struct Tree {
    hash: Hash,
    entries: Vec<TreeEntry>,
}

impl Tree {
    /// Build a tree from entries, sorting them by name bytes.
    pub fn new(hash: Hash, mut entries: Vec<TreeEntry>) -> Self {
        entries.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        Self { hash, entries }
    }

    /// The tree's own content hash.
    #[must_use]
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// The entries, sorted by name bytes.
    #[must_use]
    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tree has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry by name.
    #[must_use]
    pub fn get(&self, name: &OsStr) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|entry| entry.name.as_bytes().cmp(name.as_bytes()))
            .ok()
            .map(|idx| &self.entries[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u8) -> Hash {
        Hash::from_bytes([n; 20])
    }

    #[test]
    fn entries_sorted_by_bytes() {
        let tree = Tree::new(
            h(1),
            vec![
                TreeEntry::new("zebra", TreeEntryType::Blob, h(2)),
                TreeEntry::new("alpha", TreeEntryType::Tree, h(3)),
                TreeEntry::new("Beta", TreeEntryType::Blob, h(4)),
            ],
        );
        let names: Vec<_> = tree.entries().iter().map(|e| e.name().to_owned()).collect();
        // Byte order: uppercase sorts before lowercase.
        assert_eq!(names, ["Beta", "alpha", "zebra"]);
    }

    #[test]
    fn lookup_by_name() {
        let tree = Tree::new(
            h(1),
            vec![
                TreeEntry::new("a", TreeEntryType::Blob, h(2)),
                TreeEntry::new("b", TreeEntryType::Tree, h(3)),
            ],
        );
        assert_eq!(tree.get(OsStr::new("b")).unwrap().hash(), h(3));
        assert!(tree.get(OsStr::new("c")).is_none());
    }
}
