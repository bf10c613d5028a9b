//! The rename protocol.
//!
//! Rename needs the mount-wide rename lock plus up to three per-inode
//! content locks (source parent, destination parent, and the destination
//! child when it is a loaded directory). Locks are acquired in a fixed
//! order to prevent deadlock: when the source is an ancestor of the
//! destination it is locked first; otherwise the destination side is
//! locked first. All validation and the final entry move happen inside
//! one function invocation so every guard lives on its stack frame.

use std::ffi::OsStr;
use std::sync::{Arc, RwLockWriteGuard};
use std::time::SystemTime;

use crate::errors::{FsError, Result};
use crate::journal::JournalDelta;
use crate::mount::RenameLock;

use super::tree::{TreeInode, TreeState, MAX_STRUCTURAL_RETRIES};
use super::{validate_name, InodeHandle};

/// Where a directory's state lives among the acquired guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Src,
    Dest,
    DestChild,
}

enum RenameOutcome {
    /// The rename was applied (or was a same-inode no-op).
    Done {
        journal: Option<JournalDelta>,
        /// Overwritten destination inode, dropped after the rename lock.
        deleted: Option<InodeHandle>,
    },
    /// One or both of the involved inodes must be loaded; the caller
    /// releases everything, loads, and restarts.
    NeedsLoad { src: bool, dest: bool },
}

/// Whether `a` is an ancestor of `b`. Only meaningful under the rename
/// lock, which freezes parent back-edges.
fn is_ancestor(_lock: &RenameLock, a: &Arc<TreeInode>, b: &Arc<TreeInode>) -> bool {
    let mut parent = b.core().parent();
    while let Some(node) = parent {
        if Arc::ptr_eq(&node, a) {
            return true;
        }
        parent = node.core().parent();
    }
    false
}

fn state_in<'g>(
    slot: Slot,
    src: &'g mut Option<RwLockWriteGuard<'_, TreeState>>,
    dest: &'g mut Option<RwLockWriteGuard<'_, TreeState>>,
    dest_child: &'g mut Option<RwLockWriteGuard<'_, TreeState>>,
) -> &'g mut TreeState {
    match slot {
        Slot::Src => src.as_mut().expect("src guard held"),
        Slot::Dest => dest.as_mut().expect("dest guard held"),
        Slot::DestChild => dest_child.as_mut().expect("dest child guard held"),
    }
}

impl TreeInode {
    /// Move the entry `name` of this directory to `dest_name` under
    /// `dest_parent`, atomically with respect to every other structural
    /// change.
    pub async fn rename(
        self: &Arc<Self>,
        name: &OsStr,
        dest_parent: &Arc<TreeInode>,
        dest_name: &OsStr,
    ) -> Result<()> {
        if self.mount().is_control(self.number()) {
            return Err(FsError::PermissionDenied {
                path: self.child_log_path(name),
            });
        }
        if self.mount().is_control(dest_parent.number()) {
            return Err(FsError::PermissionDenied {
                path: dest_parent.child_log_path(dest_name),
            });
        }
        validate_name(dest_name)?;

        for attempt in 0..=MAX_STRUCTURAL_RETRIES {
            let lock = self.mount().acquire_rename_lock().await;
            self.materialize_locked(&lock);
            if !Arc::ptr_eq(self, dest_parent) {
                dest_parent.materialize_locked(&lock);
            }

            match self.try_rename_locked(&lock, name, dest_parent, dest_name)? {
                RenameOutcome::Done { journal, deleted } => {
                    // Content locks are already released; emitting the
                    // delta while the rename lock is still held keeps
                    // rename and remove events ordered in the journal.
                    if let Some(delta) = journal {
                        self.mount().journal.add_delta(delta);
                    }
                    drop(lock);
                    drop(deleted);
                    return Ok(());
                }
                RenameOutcome::NeedsLoad { src, dest } => {
                    drop(lock);
                    if attempt == MAX_STRUCTURAL_RETRIES {
                        return Err(FsError::Io {
                            message: format!(
                                "rename of {:?} kept requiring loads",
                                self.child_log_path(name)
                            ),
                        });
                    }
                    // Load outside all locks, then restart: any other
                    // rename or unlink may have intervened, so every
                    // validation step must be redone.
                    match (src, dest) {
                        (true, true) => {
                            futures::future::try_join(
                                self.get_or_load_child(name),
                                dest_parent.get_or_load_child(dest_name),
                            )
                            .await?;
                        }
                        (true, false) => {
                            self.get_or_load_child(name).await?;
                        }
                        (false, true) => {
                            dest_parent.get_or_load_child(dest_name).await?;
                        }
                        (false, false) => {
                            return Err(FsError::bug("rename requested a load it does not need"))
                        }
                    }
                }
            }
        }
        unreachable!("retry loop returns before exhausting attempts");
    }

    #[allow(clippy::too_many_lines)]
    fn try_rename_locked(
        self: &Arc<Self>,
        lock: &RenameLock,
        name: &OsStr,
        dest_parent: &Arc<TreeInode>,
        dest_name: &OsStr,
    ) -> Result<RenameOutcome> {
        let same_dir = Arc::ptr_eq(self, dest_parent);

        // Guard slots. Declaration order puts the dest-child guard after
        // the Arc it borrows from so drop order stays valid.
        let mut src_guard: Option<RwLockWriteGuard<'_, TreeState>> = None;
        let mut dest_guard: Option<RwLockWriteGuard<'_, TreeState>> = None;
        let dest_child_arc: Option<Arc<TreeInode>>;
        let mut dest_child_guard: Option<RwLockWriteGuard<'_, TreeState>> = None;
        let src_slot: Slot;
        let dest_slot: Slot;

        if same_dir {
            let guard = self.write_state();
            let child = guard
                .entries
                .get(dest_name)
                .and_then(|entry| entry.loaded().cloned());
            src_guard = Some(guard);
            dest_child_arc = child.as_ref().and_then(InodeHandle::as_tree).cloned();
            if let Some(child) = &dest_child_arc {
                dest_child_guard = Some(child.write_state());
            }
            src_slot = Slot::Src;
            dest_slot = Slot::Src;
        } else if is_ancestor(lock, self, dest_parent) {
            // The source directory is an ancestor of the destination, so
            // it must be locked first.
            src_guard = Some(self.write_state());
            let guard = dest_parent.write_state();
            let child = guard
                .entries
                .get(dest_name)
                .and_then(|entry| entry.loaded().cloned());
            dest_guard = Some(guard);
            dest_child_arc = child.as_ref().and_then(InodeHandle::as_tree).cloned();
            if let Some(child) = &dest_child_arc {
                dest_child_guard = Some(child.write_state());
            }
            src_slot = Slot::Src;
            dest_slot = Slot::Dest;
        } else {
            // Lock the destination side first. The source cannot be an
            // ancestor of the destination child here, but it may BE the
            // destination child; in that case the single lock serves
            // both roles and the rename is rejected as a cycle below.
            let guard = dest_parent.write_state();
            let child = guard
                .entries
                .get(dest_name)
                .and_then(|entry| entry.loaded().cloned());
            dest_guard = Some(guard);
            dest_child_arc = child.as_ref().and_then(InodeHandle::as_tree).cloned();
            let mut aliased = false;
            if let Some(child) = &dest_child_arc {
                dest_child_guard = Some(child.write_state());
                aliased = Arc::ptr_eq(child, self);
            }
            if aliased {
                src_slot = Slot::DestChild;
            } else {
                src_guard = Some(self.write_state());
                src_slot = Slot::Src;
            }
            dest_slot = Slot::Dest;
        }

        // ── Validation ──────────────────────────────────────────────────

        struct SrcInfo {
            is_dir: bool,
            loaded: Option<InodeHandle>,
        }
        let src_info = {
            let state = state_in(src_slot, &mut src_guard, &mut dest_guard, &mut dest_child_guard);
            match state.entries.get(name) {
                None => {
                    return Err(FsError::NotFound {
                        path: self.child_log_path(name),
                    })
                }
                Some(entry) => SrcInfo {
                    is_dir: entry.is_directory(),
                    loaded: entry.loaded().cloned(),
                },
            }
        };
        let dest_info = {
            let state = state_in(dest_slot, &mut src_guard, &mut dest_guard, &mut dest_child_guard);
            state
                .entries
                .get(dest_name)
                .map(|entry| (entry.is_directory(), entry.loaded().cloned()))
        };

        if src_info.is_dir {
            // A directory may only replace nothing, itself, or an empty
            // directory.
            if let Some((dest_is_dir, dest_loaded)) = &dest_info {
                if !dest_is_dir {
                    tracing::debug!(
                        src = %self.child_log_path(name).display(),
                        dest = %dest_parent.child_log_path(dest_name).display(),
                        "rename of directory over non-directory"
                    );
                    return Err(FsError::NotADirectory {
                        path: dest_parent.child_log_path(dest_name),
                    });
                }
                let same_inode = matches!(
                    (&src_info.loaded, dest_loaded),
                    (Some(src), Some(dest)) if src.same_inode(dest)
                );
                if !same_inode && dest_loaded.is_some() {
                    let empty = state_in(
                        Slot::DestChild,
                        &mut src_guard,
                        &mut dest_guard,
                        &mut dest_child_guard,
                    )
                    .entries
                    .is_empty();
                    if !empty {
                        tracing::debug!(
                            src = %self.child_log_path(name).display(),
                            dest = %dest_parent.child_log_path(dest_name).display(),
                            "rename of directory over non-empty directory"
                        );
                        return Err(FsError::NotEmpty {
                            path: dest_parent.child_log_path(dest_name),
                        });
                    }
                }
            }
        } else if let Some((dest_is_dir, _)) = &dest_info {
            if *dest_is_dir {
                return Err(FsError::IsADirectory {
                    path: dest_parent.child_log_path(dest_name),
                });
            }
        }

        if dest_parent.is_unlinked() {
            return Err(FsError::NotFound {
                path: dest_parent.log_path(),
            });
        }

        let need_src = src_info.loaded.is_none();
        let need_dest = dest_info
            .as_ref()
            .is_some_and(|(_, loaded)| loaded.is_none());
        if need_src || need_dest {
            return Ok(RenameOutcome::NeedsLoad {
                src: need_src,
                dest: need_dest,
            });
        }

        // ── Apply ───────────────────────────────────────────────────────

        let src_handle = src_info.loaded.expect("checked by need_src");
        let dest_handle = dest_info.and_then(|(_, loaded)| loaded);

        if let Some(dest) = &dest_handle {
            if dest.same_inode(&src_handle) {
                // Renaming an entry onto itself succeeds without change.
                return Ok(RenameOutcome::Done {
                    journal: None,
                    deleted: None,
                });
            }
        }

        if let InodeHandle::Tree(src_tree) = &src_handle {
            // The destination directory must not live inside the tree
            // being moved. (The source inside the destination is already
            // excluded: the destination would be non-empty.)
            if Arc::ptr_eq(src_tree, dest_parent) || is_ancestor(lock, src_tree, dest_parent) {
                return Err(FsError::InvalidArgument {
                    message: format!(
                        "cannot move {:?} underneath itself",
                        self.child_log_path(name)
                    ),
                });
            }
        }

        let replaced = dest_handle.is_some();
        let deleted = dest_handle.inspect(|dest| dest.mark_unlinked(lock));

        let moved = {
            let state = state_in(src_slot, &mut src_guard, &mut dest_guard, &mut dest_child_guard);
            state
                .entries
                .remove(name)
                .expect("source presence checked above")
        };
        {
            let state = state_in(dest_slot, &mut src_guard, &mut dest_guard, &mut dest_child_guard);
            // The moved entry carries its hash, inode number, and
            // materialization state unchanged.
            state.entries.insert(dest_name.to_os_string(), moved);
        }
        src_handle.update_location(lock, dest_parent, dest_name);

        let now = SystemTime::now();
        self.mount()
            .metadata
            .update_mtime_and_ctime(self.number(), now);
        if !same_dir {
            self.mount()
                .metadata
                .update_mtime_and_ctime(dest_parent.number(), now);
        }

        {
            let state = state_in(src_slot, &mut src_guard, &mut dest_guard, &mut dest_child_guard);
            self.save_overlay_dir_locked(state);
        }
        if !same_dir {
            let state = state_in(dest_slot, &mut src_guard, &mut dest_guard, &mut dest_child_guard);
            dest_parent.save_overlay_dir_locked(state);
        }

        // Release the content locks, then build the journal record while
        // the caller still holds the rename lock.
        drop(dest_child_guard);
        drop(dest_guard);
        drop(src_guard);

        let journal = match (self.get_path(), dest_parent.get_path()) {
            (Some(src_parent), Some(dest_parent_path)) => {
                let from = src_parent.join(name);
                let to = dest_parent_path.join(dest_name);
                Some(if replaced {
                    JournalDelta::Replaced { from, to }
                } else {
                    JournalDelta::Renamed { from, to }
                })
            }
            _ => None,
        };

        Ok(RenameOutcome::Done { journal, deleted })
    }
}
