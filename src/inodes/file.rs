//! Leaf inodes: regular files, symlinks, and sockets.
//!
//! The directory core treats these as opaque leaves with a small
//! capability set: read, write (which materializes), attribute access,
//! and content comparison against a source-control blob.

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt as _;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use bytes::Bytes;

use crate::errors::{FsError, Result};
use crate::journal::JournalDelta;
use crate::mount::MountState;
use crate::scm::{tree_entry_type_from_mode, Hash, TreeEntryType};

use super::{
    InodeAttr, InodeCore, InodeNumber, InodeTimestamps, SetAttr, TreeInode,
};

struct FileState {
    /// Source-control blob hash; `None` once the file is materialized
    /// into the overlay.
    hash: Option<Hash>,
}

/// A loaded leaf inode.
pub struct FileInode {
    core: InodeCore,
    state: RwLock<FileState>,
}

impl std::fmt::Debug for FileInode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileInode")
            .field("number", &self.number())
            .finish()
    }
}

impl FileInode {
    pub(crate) fn new(
        number: InodeNumber,
        mount: &Arc<MountState>,
        parent: Option<&Arc<TreeInode>>,
        name: OsString,
        mode: u32,
        hash: Option<Hash>,
    ) -> Arc<Self> {
        let now = SystemTime::now();
        // Materialized files inherit the timestamps saved alongside their
        // overlay content; hash-backed files start from now.
        let timestamps = if hash.is_none() {
            mount
                .overlay
                .overlay_file_timestamps(number)
                .unwrap_or_else(|| InodeTimestamps::new(now))
        } else {
            InodeTimestamps::new(now)
        };
        mount.metadata.ensure(number, mode, timestamps);
        Arc::new(Self {
            core: InodeCore::new(number, mode, Arc::clone(mount), parent, name),
            state: RwLock::new(FileState { hash }),
        })
    }

    pub(crate) fn core(&self) -> &InodeCore {
        &self.core
    }

    /// The inode's number.
    #[must_use]
    pub fn number(&self) -> InodeNumber {
        self.core.number
    }

    /// The inode's initial mode.
    #[must_use]
    pub fn mode(&self) -> u32 {
        self.core.mode
    }

    /// Whether the inode has been unlinked.
    #[must_use]
    pub fn is_unlinked(&self) -> bool {
        self.core.is_unlinked()
    }

    /// The mount-relative path, or `None` if unlinked.
    #[must_use]
    pub fn get_path(&self) -> Option<std::path::PathBuf> {
        self.core.get_path()
    }

    /// The source-control hash this file still equals, if any.
    #[must_use]
    pub fn scm_hash(&self) -> Option<Hash> {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .hash
    }

    /// Whether the file's source of truth is the overlay.
    #[must_use]
    pub fn is_materialized(&self) -> bool {
        self.scm_hash().is_none()
    }

    fn current_mode(&self) -> u32 {
        self.core
            .mount
            .metadata
            .get(self.core.number)
            .map_or(self.core.mode, |meta| meta.mode)
    }

    /// Read the entire file content.
    pub async fn read_all(&self) -> Result<Bytes> {
        let hash = self.scm_hash();
        let content = match hash {
            Some(hash) => self.core.mount.store.get_blob(hash).await?,
            None => self.core.mount.overlay.read_overlay_file(self.core.number)?,
        };
        self.core
            .mount
            .metadata
            .update_atime(self.core.number, SystemTime::now());
        Ok(content)
    }

    /// Replace the entire file content, materializing if needed.
    pub async fn write_all(self: &Arc<Self>, content: Bytes) -> Result<()> {
        let now = SystemTime::now();
        let was_materialized = self.is_materialized();

        if was_materialized {
            self.core
                .mount
                .overlay
                .create_overlay_file(self.core.number, InodeTimestamps::new(now), &content)?;
        } else {
            // First write: persist the new content, then flip our state
            // and walk the materialization up the tree under the rename
            // lock.
            let lock = self.core.mount.acquire_rename_lock().await;
            {
                let mut state = self
                    .state
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                self.core.mount.overlay.create_overlay_file(
                    self.core.number,
                    InodeTimestamps::new(now),
                    &content,
                )?;
                state.hash = None;
            }
            if let Some(parent) = self.core.parent() {
                if !self.is_unlinked() {
                    parent.child_materialized(&lock, &self.core.name());
                }
            }
        }

        self.core
            .mount
            .metadata
            .update_mtime_and_ctime(self.core.number, now);
        if let Some(path) = self.get_path() {
            self.core.mount.journal.add_delta(JournalDelta::Modified(path));
        }
        Ok(())
    }

    /// Return POSIX-like attributes.
    pub async fn getattr(&self) -> Result<InodeAttr> {
        let meta = self
            .core
            .mount
            .metadata
            .get(self.core.number)
            .ok_or_else(|| {
                FsError::bug(format!("missing metadata for inode {}", self.core.number))
            })?;
        let size = match self.scm_hash() {
            Some(hash) => self.core.mount.store.get_blob(hash).await?.len() as u64,
            None => {
                if self.core.mode & libc::S_IFMT == libc::S_IFSOCK {
                    0
                } else {
                    self.core.mount.overlay.read_overlay_file(self.core.number)?.len() as u64
                }
            }
        };
        Ok(InodeAttr {
            ino: self.core.number,
            mode: meta.mode,
            nlink: 1,
            size,
            timestamps: meta.timestamps,
        })
    }

    /// Apply attribute changes, materializing first.
    pub async fn setattr(self: &Arc<Self>, attr: SetAttr) -> Result<InodeAttr> {
        if let Some(size) = attr.size {
            let current = self.read_all().await?;
            let mut resized = current.to_vec();
            resized.resize(size as usize, 0);
            self.write_all(Bytes::from(resized)).await?;
        }

        let number = self.core.number;
        let mount = &self.core.mount;
        if let Some(mode) = attr.mode {
            mount.metadata.set_permissions(number, mode);
        }
        let now = SystemTime::now();
        if let Some(atime) = attr.atime {
            mount.metadata.update_atime(number, atime);
        }
        if let Some(mtime) = attr.mtime {
            mount.metadata.update_mtime_and_ctime(number, mtime);
        } else {
            mount.metadata.update_mtime_and_ctime(number, now);
        }

        if attr.size.is_none() {
            if let Some(path) = self.get_path() {
                mount.journal.add_delta(JournalDelta::Modified(path));
            }
        }
        self.getattr().await
    }

    /// Read a symlink's target.
    pub async fn readlink(&self) -> Result<OsString> {
        if self.core.mode & libc::S_IFMT != libc::S_IFLNK {
            return Err(FsError::InvalidArgument {
                message: format!("inode {} is not a symlink", self.core.number),
            });
        }
        let content = self.read_all().await?;
        Ok(OsString::from_vec(content.to_vec()))
    }

    /// Whether this file's content and type equal the given
    /// source-control entry.
    ///
    /// For non-materialized files this is a hash comparison; materialized
    /// files fall back to comparing bytes against the blob.
    pub(crate) async fn is_same_as(&self, hash: Hash, ttype: TreeEntryType) -> Result<bool> {
        if tree_entry_type_from_mode(self.current_mode()) != Some(ttype) {
            return Ok(false);
        }
        match self.scm_hash() {
            Some(own) => Ok(own == hash),
            None => {
                let mine = self.core.mount.overlay.read_overlay_file(self.core.number)?;
                let theirs = self.core.mount.store.get_blob(hash).await?;
                Ok(mine == theirs)
            }
        }
    }
}
