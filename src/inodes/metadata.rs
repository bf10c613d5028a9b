//! Mount-wide storage for inode metadata (mode bits and timestamps).

use std::time::SystemTime;

use super::{InodeNumber, InodeTimestamps};

/// Metadata tracked for every known inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeMetadata {
    /// File type and permission bits.
    pub mode: u32,
    /// Access, modification, and change times.
    pub timestamps: InodeTimestamps,
}

/// Concurrent inode-number → metadata table.
///
/// Shared by every inode in the mount. Entries are inserted when an inode
/// is created or loaded and survive unloads, so timestamps persist across
/// load/unload cycles within one mount lifetime.
#[derive(Default)]
pub struct InodeMetadataTable {
    map: scc::HashMap<InodeNumber, InodeMetadata>,
}

impl InodeMetadataTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the metadata for `number`, if known.
    #[must_use]
    pub fn get(&self, number: InodeNumber) -> Option<InodeMetadata> {
        self.map.read(&number, |_, meta| *meta)
    }

    /// Insert metadata for `number` unless an entry already exists, then
    /// return the entry.
    pub fn ensure(&self, number: InodeNumber, mode: u32, timestamps: InodeTimestamps) -> InodeMetadata {
        let fresh = InodeMetadata { mode, timestamps };
        loop {
            if let Some(existing) = self.map.read(&number, |_, meta| *meta) {
                return existing;
            }
            if self.map.insert(number, fresh).is_ok() {
                return fresh;
            }
        }
    }

    /// Overwrite the permission bits for `number`, preserving the file
    /// type bits.
    pub fn set_permissions(&self, number: InodeNumber, perms: u32) {
        self.update_existing(number, |meta| {
            meta.mode = (meta.mode & libc::S_IFMT) | (perms & 0o7777);
        });
    }

    /// Overwrite the timestamps for `number`.
    pub fn set_timestamps(&self, number: InodeNumber, timestamps: InodeTimestamps) {
        loop {
            if self
                .map
                .update(&number, |_, meta| meta.timestamps = timestamps)
                .is_some()
            {
                return;
            }
            let fresh = InodeMetadata {
                mode: 0,
                timestamps,
            };
            if self.map.insert(number, fresh).is_ok() {
                return;
            }
        }
    }

    /// Bump mtime and ctime to `now`.
    pub fn update_mtime_and_ctime(&self, number: InodeNumber, now: SystemTime) {
        self.update_existing(number, |meta| {
            meta.timestamps.mtime = now;
            meta.timestamps.ctime = now;
        });
    }

    /// Bump atime to `now`.
    pub fn update_atime(&self, number: InodeNumber, now: SystemTime) {
        self.update_existing(number, |meta| meta.timestamps.atime = now);
    }

    fn update_existing(&self, number: InodeNumber, mut update: impl FnMut(&mut InodeMetadata)) {
        if self
            .map
            .update(&number, |_, meta| update(meta))
            .is_none()
        {
            let mut fresh = InodeMetadata {
                mode: 0,
                timestamps: InodeTimestamps::default(),
            };
            update(&mut fresh);
            let _ = self.map.insert(number, fresh);
        }
    }

    /// Drop the entry for `number`.
    pub fn remove(&self, number: InodeNumber) {
        let _ = self.map.remove(&number);
    }
}
