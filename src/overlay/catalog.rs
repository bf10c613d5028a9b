//! Key-value storage backends for serialized overlay records.
//!
//! The keyspace is inode-number → opaque serialized record. Two backends
//! are provided: an in-memory map for tests and ephemeral mounts, and a
//! sharded file-per-inode directory layout for persistent mounts.

use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::inodes::InodeNumber;

/// Synchronous key-value store of serialized records keyed by inode
/// number.
///
/// Implementations must be internally thread-safe; the buffered catalog
/// calls them from its worker thread while readers fall through from
/// other threads.
pub trait InodeCatalog: Send + Sync + 'static {
    /// Read the record for `number`.
    fn load(&self, number: InodeNumber) -> io::Result<Option<Bytes>>;

    /// Write (or overwrite) the record for `number`.
    fn save(&self, number: InodeNumber, data: Bytes) -> io::Result<()>;

    /// Delete the record for `number`. Deleting an absent record is not
    /// an error.
    fn remove(&self, number: InodeNumber) -> io::Result<()>;

    /// Whether a record exists for `number`.
    fn has(&self, number: InodeNumber) -> io::Result<bool>;

    /// Atomically read and delete the record for `number`.
    fn load_and_remove(&self, number: InodeNumber) -> io::Result<Option<Bytes>>;
}

/// In-memory catalog.
#[derive(Default)]
pub struct MemoryInodeCatalog {
    map: Mutex<FxHashMap<InodeNumber, Bytes>>,
}

impl MemoryInodeCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl InodeCatalog for MemoryInodeCatalog {
    fn load(&self, number: InodeNumber) -> io::Result<Option<Bytes>> {
        Ok(self
            .map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&number)
            .cloned())
    }

    fn save(&self, number: InodeNumber, data: Bytes) -> io::Result<()> {
        self.map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(number, data);
        Ok(())
    }

    fn remove(&self, number: InodeNumber) -> io::Result<()> {
        self.map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&number);
        Ok(())
    }

    fn has(&self, number: InodeNumber) -> io::Result<bool> {
        Ok(self
            .map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(&number))
    }

    fn load_and_remove(&self, number: InodeNumber) -> io::Result<Option<Bytes>> {
        Ok(self
            .map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&number))
    }
}

/// On-disk catalog: one file per inode, sharded by the low byte of the
/// inode number to keep directories small.
pub struct DiskInodeCatalog {
    root: PathBuf,
}

impl DiskInodeCatalog {
    /// Open (creating if needed) a catalog rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, number: InodeNumber) -> PathBuf {
        let shard = format!("{:02x}", number.0 & 0xff);
        self.root.join(shard).join(number.0.to_string())
    }
}

impl InodeCatalog for DiskInodeCatalog {
    fn load(&self, number: InodeNumber) -> io::Result<Option<Bytes>> {
        match std::fs::read(self.path_for(number)) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn save(&self, number: InodeNumber, data: Bytes) -> io::Result<()> {
        let path = self.path_for(number);
        let parent = path.parent().expect("sharded path has a parent");
        std::fs::create_dir_all(parent)?;
        // Write through a temp file and rename so readers never observe a
        // torn record.
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, &path)
    }

    fn remove(&self, number: InodeNumber) -> io::Result<()> {
        match std::fs::remove_file(self.path_for(number)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn has(&self, number: InodeNumber) -> io::Result<bool> {
        Ok(self.path_for(number).exists())
    }

    fn load_and_remove(&self, number: InodeNumber) -> io::Result<Option<Bytes>> {
        let loaded = self.load(number)?;
        if loaded.is_some() {
            self.remove(number)?;
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(catalog: &dyn InodeCatalog) {
        let n = InodeNumber(0x1_02);
        assert!(catalog.load(n).unwrap().is_none());
        assert!(!catalog.has(n).unwrap());

        catalog.save(n, Bytes::from_static(b"one")).unwrap();
        assert_eq!(catalog.load(n).unwrap().unwrap(), Bytes::from_static(b"one"));
        assert!(catalog.has(n).unwrap());

        catalog.save(n, Bytes::from_static(b"two")).unwrap();
        assert_eq!(catalog.load(n).unwrap().unwrap(), Bytes::from_static(b"two"));

        let taken = catalog.load_and_remove(n).unwrap().unwrap();
        assert_eq!(taken, Bytes::from_static(b"two"));
        assert!(catalog.load(n).unwrap().is_none());

        // Idempotent remove.
        catalog.remove(n).unwrap();
    }

    #[test]
    fn memory_catalog() {
        exercise(&MemoryInodeCatalog::new());
    }

    #[test]
    fn disk_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = DiskInodeCatalog::open(dir.path().join("dirs")).unwrap();
        exercise(&catalog);
    }

    #[test]
    fn disk_catalog_shards_by_low_byte() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = DiskInodeCatalog::open(dir.path()).unwrap();
        catalog.save(InodeNumber(0x2ff), Bytes::from_static(b"x")).unwrap();
        assert!(dir.path().join("ff").join("767").exists());
    }
}
