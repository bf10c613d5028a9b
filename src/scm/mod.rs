//! Immutable source-control object model: content hashes, tree entries,
//! and the object-store seam.

mod store;
mod tree;

pub use store::{MemoryObjectStore, ObjectStore};
pub use tree::{Tree, TreeEntry};

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of bytes in a content hash.
pub const HASH_LEN: usize = 20;

/// Opaque content identifier produced by the backing source-control model.
///
/// Equality defines object identity; two trees or blobs with the same hash
/// are the same object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    /// Wrap raw hash bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Digest arbitrary content into a hash (SHA-256, truncated).
    #[must_use]
    pub fn digest(content: &[u8]) -> Self {
        let digest = Sha256::digest(content);
        let mut bytes = [0u8; HASH_LEN];
        bytes.copy_from_slice(&digest[..HASH_LEN]);
        Self(bytes)
    }

    /// The raw hash bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({self})")
    }
}

/// The type of a source-control tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeEntryType {
    /// A regular file blob.
    Blob,
    /// A regular file blob with the executable bit set.
    Executable,
    /// A symbolic link blob.
    Symlink,
    /// A subtree.
    Tree,
}

impl TreeEntryType {
    /// Whether this entry refers to a subtree.
    #[must_use]
    pub fn is_tree(self) -> bool {
        matches!(self, Self::Tree)
    }
}

/// The initial POSIX mode for an entry of the given type.
#[must_use]
pub fn mode_from_tree_entry_type(ttype: TreeEntryType) -> u32 {
    match ttype {
        TreeEntryType::Blob => libc::S_IFREG | 0o644,
        TreeEntryType::Executable => libc::S_IFREG | 0o755,
        TreeEntryType::Symlink => libc::S_IFLNK | 0o777,
        TreeEntryType::Tree => libc::S_IFDIR | 0o755,
    }
}

/// The tree-entry type corresponding to a POSIX mode, if any.
///
/// Returns `None` for modes source control cannot represent (sockets,
/// fifos, devices). Entries with such modes always compare as different
/// from any tree entry.
#[must_use]
pub fn tree_entry_type_from_mode(mode: u32) -> Option<TreeEntryType> {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => Some(TreeEntryType::Tree),
        libc::S_IFLNK => Some(TreeEntryType::Symlink),
        libc::S_IFREG => {
            if mode & 0o111 != 0 {
                Some(TreeEntryType::Executable)
            } else {
                Some(TreeEntryType::Blob)
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_display_is_hex() {
        let mut bytes = [0u8; HASH_LEN];
        bytes[0] = 0xab;
        bytes[19] = 0x01;
        let hash = Hash::from_bytes(bytes);
        let hex = hash.to_string();
        assert_eq!(hex.len(), 40);
        assert!(hex.starts_with("ab"));
        assert!(hex.ends_with("01"));
    }

    #[test]
    fn digest_is_stable() {
        assert_eq!(Hash::digest(b"hello"), Hash::digest(b"hello"));
        assert_ne!(Hash::digest(b"hello"), Hash::digest(b"world"));
    }

    #[test]
    fn mode_round_trip() {
        for ttype in [
            TreeEntryType::Blob,
            TreeEntryType::Executable,
            TreeEntryType::Symlink,
            TreeEntryType::Tree,
        ] {
            let mode = mode_from_tree_entry_type(ttype);
            assert_eq!(tree_entry_type_from_mode(mode), Some(ttype));
        }
        assert_eq!(tree_entry_type_from_mode(libc::S_IFSOCK | 0o644), None);
    }
}
