//! The overlay: local persistent storage for materialized state.
//!
//! The overlay owns three things: the mount's monotonic inode-number
//! allocator, serialized directory records (written through the buffered
//! catalog), and file content records for materialized regular files and
//! symlinks.

pub mod buffered;
pub mod catalog;
pub mod codec;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::errors::{FsError, Result};
use crate::inodes::dir::DirContents;
use crate::inodes::{InodeNumber, InodeTimestamps, ROOT_INODE};
use crate::scm::Hash;

pub use buffered::{BufferedInodeCatalog, DEFAULT_BUFFER_BUDGET};
pub use catalog::{DiskInodeCatalog, InodeCatalog, MemoryInodeCatalog};
pub use codec::{LoadedOverlayDir, LoadedOverlayFile};

/// Reserved catalog key holding the allocator high-water mark.
const ALLOCATOR_KEY: InodeNumber = InodeNumber(0);

/// Local persistent store for directory contents and file bytes, keyed
/// by inode number.
pub struct Overlay {
    dirs: BufferedInodeCatalog,
    files: Arc<dyn InodeCatalog>,
    next_inode: AtomicU64,
}

impl Overlay {
    /// An overlay backed entirely by memory.
    #[must_use]
    pub fn memory() -> Self {
        Self::with_catalogs(
            Arc::new(MemoryInodeCatalog::new()),
            Arc::new(MemoryInodeCatalog::new()),
            DEFAULT_BUFFER_BUDGET,
        )
    }

    /// An overlay persisted under `root` on disk.
    pub fn on_disk(root: &Path) -> Result<Self> {
        let dirs = DiskInodeCatalog::open(root.join("dirs")).map_err(|e| FsError::io(&e))?;
        let files = DiskInodeCatalog::open(root.join("files")).map_err(|e| FsError::io(&e))?;
        Ok(Self::with_catalogs(
            Arc::new(dirs),
            Arc::new(files),
            DEFAULT_BUFFER_BUDGET,
        ))
    }

    /// Assemble an overlay from explicit catalog backends.
    #[must_use]
    pub fn with_catalogs(
        dirs: Arc<dyn InodeCatalog>,
        files: Arc<dyn InodeCatalog>,
        buffer_budget: usize,
    ) -> Self {
        // Restore the allocator high-water mark saved by the last clean
        // shutdown. A missing or malformed record falls back to the
        // minimum, which is only safe on a fresh overlay.
        let mut next = ROOT_INODE.0 + 1;
        if let Ok(Some(raw)) = dirs.load(ALLOCATOR_KEY) {
            if let Ok(bytes) = <[u8; 8]>::try_from(&raw[..]) {
                next = next.max(u64::from_be_bytes(bytes));
            }
        }
        Self {
            dirs: BufferedInodeCatalog::new(dirs, buffer_budget),
            files,
            next_inode: AtomicU64::new(next),
        }
    }

    /// Allocate a fresh inode number. Monotonic, process-wide.
    #[must_use]
    pub fn allocate_inode_number(&self) -> InodeNumber {
        InodeNumber(self.next_inode.fetch_add(1, Ordering::Relaxed))
    }

    // ── Directory records ───────────────────────────────────────────────

    /// Load the directory record for `number`, if present.
    pub fn load_overlay_dir(&self, number: InodeNumber) -> Result<Option<LoadedOverlayDir>> {
        match self.dirs.load(number).map_err(|e| FsError::io(&e))? {
            Some(data) => Ok(Some(codec::decode_dir(&data).map_err(|e| FsError::io(&e))?)),
            None => Ok(None),
        }
    }

    /// Write the directory record for `number`.
    pub fn save_overlay_dir(
        &self,
        number: InodeNumber,
        entries: &DirContents,
        tree_hash: Option<Hash>,
        timestamps: InodeTimestamps,
    ) {
        self.dirs
            .save(number, codec::encode_dir(entries, tree_hash, timestamps));
    }

    /// Load and delete the directory record for `number`.
    pub fn load_and_remove_overlay_dir(
        &self,
        number: InodeNumber,
    ) -> Result<Option<LoadedOverlayDir>> {
        match self
            .dirs
            .load_and_remove(number)
            .map_err(|e| FsError::io(&e))?
        {
            Some(data) => Ok(Some(codec::decode_dir(&data).map_err(|e| FsError::io(&e))?)),
            None => Ok(None),
        }
    }

    /// Delete the directory record for `number`.
    pub fn remove_overlay_dir(&self, number: InodeNumber) {
        self.dirs.remove(number);
    }

    /// Whether a directory record exists for `number`.
    pub fn has_overlay_dir(&self, number: InodeNumber) -> Result<bool> {
        self.dirs.has(number).map_err(|e| FsError::io(&e))
    }

    /// Recursively delete all overlay data reachable from `number`.
    ///
    /// Walks directory records depth-first, removing each directory's
    /// record and every file record it references. Used when checkout
    /// discards an unloaded subtree.
    pub fn recursively_remove_overlay_data(&self, number: InodeNumber) {
        let _ = self.files.remove(number);
        let loaded = match self.load_and_remove_overlay_dir(number) {
            Ok(loaded) => loaded,
            Err(err) => {
                tracing::warn!(%number, %err, "failed to load overlay dir during recursive removal");
                return;
            }
        };
        if let Some(dir) = loaded {
            for entry in dir.entries.values() {
                if entry.is_directory() {
                    self.recursively_remove_overlay_data(entry.number());
                } else {
                    let _ = self.files.remove(entry.number());
                }
            }
        }
    }

    // ── File records ────────────────────────────────────────────────────

    /// Create (or replace) the content record for a materialized file.
    pub fn create_overlay_file(
        &self,
        number: InodeNumber,
        timestamps: InodeTimestamps,
        content: &[u8],
    ) -> Result<()> {
        self.files
            .save(number, codec::encode_file(content, timestamps))
            .map_err(|e| FsError::io(&e))
    }

    /// Read a materialized file's content.
    pub fn read_overlay_file(&self, number: InodeNumber) -> Result<Bytes> {
        let data = self
            .files
            .load(number)
            .map_err(|e| FsError::io(&e))?
            .ok_or_else(|| {
                FsError::bug(format!("missing overlay data for materialized file {number}"))
            })?;
        Ok(codec::decode_file(&data).map_err(|e| FsError::io(&e))?.content)
    }

    /// Timestamps recorded with a materialized file's content, if any.
    #[must_use]
    pub fn overlay_file_timestamps(&self, number: InodeNumber) -> Option<InodeTimestamps> {
        let data = self.files.load(number).ok()??;
        codec::decode_file(&data).ok().map(|f| f.timestamps)
    }

    /// Whether a content record exists for `number`.
    pub fn has_overlay_file(&self, number: InodeNumber) -> Result<bool> {
        self.files.has(number).map_err(|e| FsError::io(&e))
    }

    /// Delete a file content record.
    pub fn remove_overlay_file(&self, number: InodeNumber) {
        let _ = self.files.remove(number);
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Block until all buffered directory writes have reached the
    /// underlying catalog.
    pub fn flush(&self) {
        self.dirs.flush();
    }

    /// Flush buffered writes, persist the allocator high-water mark, and
    /// stop the worker.
    pub fn close(&self) {
        let next = self.next_inode.load(Ordering::Relaxed);
        self.dirs
            .save(ALLOCATOR_KEY, Bytes::from(next.to_be_bytes().to_vec()));
        self.dirs.close();
    }
}
