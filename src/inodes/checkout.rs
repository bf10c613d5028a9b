//! The checkout engine: transition a subtree from one source-control
//! tree to another, detecting conflicts with local changes.
//!
//! Checkout merge-walks the old and new tree entry lists under the
//! content lock, producing at most one deferred action per differing
//! entry. Actions run concurrently after the lock is released; each one
//! recurses into loaded directory children or replaces loaded files.
//! A post-pass then tries to dematerialize the directory when it has
//! become identical to the new tree.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures::future::{join_all, BoxFuture};

use crate::errors::{FsError, Result};
use crate::mount::{MountState, RenameLock};
use crate::scm::{mode_from_tree_entry_type, Hash, Tree, TreeEntry};

use super::dir::DirEntry;
use super::inode_map::InodeFuture;
use super::tree::{RemoveKind, TreeInode, TreeState};
use super::InodeHandle;

/// How a checkout should treat conflicts and state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutMode {
    /// Report conflicts only; change nothing.
    DryRun,
    /// Apply the transition, leaving conflicted entries untouched.
    Normal,
    /// Apply the transition, resolving conflicts in favor of the new
    /// tree.
    Force,
}

impl CheckoutMode {
    /// Whether this mode changes no state.
    #[must_use]
    pub fn is_dry_run(self) -> bool {
        matches!(self, Self::DryRun)
    }

    /// Whether conflicts are resolved in favor of the new tree.
    #[must_use]
    pub fn is_force(self) -> bool {
        matches!(self, Self::Force)
    }
}

/// A mismatch between the expected source state and the observed local
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictType {
    /// A locally added entry collides with an entry in the new tree.
    UntrackedAdded,
    /// A locally modified entry is also changed in the new tree.
    ModifiedModified,
    /// A locally removed entry is changed in the new tree.
    RemovedModified,
    /// A locally removed entry is also removed in the new tree.
    MissingRemoved,
    /// A directory slated for removal still has untracked contents.
    DirectoryNotEmpty,
}

/// One recorded checkout conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutConflict {
    /// Mount-relative path of the conflicting entry.
    pub path: PathBuf,
    /// The kind of mismatch.
    pub conflict_type: ConflictType,
}

/// The outcome of a checkout operation.
#[derive(Debug, Clone, Default)]
pub struct CheckoutResult {
    /// Conflicts, sorted by path.
    pub conflicts: Vec<CheckoutConflict>,
    /// Per-leaf errors that did not abort the walk, stringified.
    pub errors: Vec<(PathBuf, String)>,
}

/// Shared state for one checkout operation.
///
/// Holds the mount-wide rename lock for the operation's entire duration:
/// no rename or materialization change may interleave with a checkout.
pub struct CheckoutContext {
    pub(crate) mount: Arc<MountState>,
    mode: CheckoutMode,
    rename_lock: RenameLock,
    conflicts: Mutex<Vec<CheckoutConflict>>,
    errors: Mutex<Vec<(PathBuf, String)>>,
}

impl CheckoutContext {
    pub(crate) fn new(mount: Arc<MountState>, mode: CheckoutMode, rename_lock: RenameLock) -> Self {
        Self {
            mount,
            mode,
            rename_lock,
            conflicts: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn is_dry_run(&self) -> bool {
        self.mode.is_dry_run()
    }

    pub(crate) fn is_force(&self) -> bool {
        self.mode.is_force()
    }

    pub(crate) fn rename_lock(&self) -> &RenameLock {
        &self.rename_lock
    }

    pub(crate) fn add_conflict(&self, conflict_type: ConflictType, path: PathBuf) {
        tracing::debug!(?conflict_type, path = %path.display(), "checkout conflict");
        self.conflicts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(CheckoutConflict {
                path,
                conflict_type,
            });
    }

    pub(crate) fn add_error(&self, path: PathBuf, error: &FsError) {
        self.errors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((path, error.to_string()));
    }

    /// Collect the recorded conflicts and errors, releasing the rename
    /// lock when the last reference to the context drops.
    pub(crate) fn finish(ctx: Arc<Self>) -> CheckoutResult {
        let mut conflicts = std::mem::take(
            &mut *ctx
                .conflicts
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        conflicts.sort_by(|a, b| a.path.cmp(&b.path));
        let mut errors = std::mem::take(
            &mut *ctx
                .errors
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        errors.sort();
        CheckoutResult { conflicts, errors }
    }
}

enum ChildSource {
    Loaded(InodeHandle),
    Pending(InodeFuture),
}

/// A deferred unit of checkout work for one entry.
struct CheckoutAction {
    name: OsString,
    old_entry: Option<TreeEntry>,
    new_entry: Option<TreeEntry>,
    source: ChildSource,
}

impl CheckoutAction {
    async fn run(self, parent: &Arc<TreeInode>, ctx: &Arc<CheckoutContext>) -> Result<()> {
        let inode = match self.source {
            ChildSource::Loaded(handle) => handle,
            ChildSource::Pending(receiver) => TreeInode::await_load(receiver).await?,
        };

        let old_tree = match &self.old_entry {
            Some(entry) if entry.is_tree() => {
                Some(ctx.mount.store.get_tree(entry.hash()).await?)
            }
            _ => None,
        };
        let new_tree = match &self.new_entry {
            Some(entry) if entry.is_tree() => {
                Some(ctx.mount.store.get_tree(entry.hash()).await?)
            }
            _ => None,
        };

        // Compare the loaded inode against the old source-control state
        // to detect local modifications.
        let mut conflict = None;
        match (&inode, &self.old_entry) {
            (_, None) => conflict = Some(ConflictType::UntrackedAdded),
            (InodeHandle::File(file), Some(old)) => {
                if old.is_tree() || !file.is_same_as(old.hash(), old.ttype()).await? {
                    conflict = Some(ConflictType::ModifiedModified);
                }
            }
            (InodeHandle::Tree(_), Some(old)) => {
                if !old.is_tree() {
                    conflict = Some(ConflictType::ModifiedModified);
                }
            }
        }
        if let Some(conflict_type) = conflict {
            let path = inode
                .get_path()
                .unwrap_or_else(|| parent.child_log_path(&self.name));
            ctx.add_conflict(conflict_type, path);
            if !ctx.is_force() {
                return Ok(());
            }
        }

        parent
            .checkout_update_entry(ctx, self.name, inode, old_tree, new_tree, self.new_entry)
            .await
    }
}

impl TreeInode {
    /// Transition this directory from `from_tree` to `to_tree`. Either
    /// side may be absent, representing the empty tree.
    pub fn checkout(
        self: &Arc<Self>,
        ctx: &Arc<CheckoutContext>,
        from_tree: Option<Arc<Tree>>,
        to_tree: Option<Arc<Tree>>,
    ) -> BoxFuture<'static, Result<()>> {
        let this = Arc::clone(self);
        let ctx = Arc::clone(ctx);
        Box::pin(async move {
            tracing::debug!(
                path = %this.log_path().display(),
                from = ?from_tree.as_ref().map(|t| t.hash()),
                to = ?to_tree.as_ref().map(|t| t.hash()),
                "checkout: starting update"
            );

            let mut actions = Vec::new();
            let mut pending = Vec::new();
            this.compute_checkout_actions(
                &ctx,
                from_tree.as_deref(),
                to_tree.as_deref(),
                &mut actions,
                &mut pending,
            );

            let loads = pending
                .into_iter()
                .map(|load| Arc::clone(&this).run_pending_load(load));
            let runs = actions.into_iter().map(|action| {
                let ctx = Arc::clone(&ctx);
                let parent = Arc::clone(&this);
                async move {
                    let name = action.name.clone();
                    if let Err(err) = action.run(&parent, &ctx).await {
                        let path = parent.child_log_path(&name);
                        tracing::warn!(
                            path = %path.display(),
                            %err,
                            "error processing checkout entry"
                        );
                        ctx.add_error(path, &err);
                    }
                }
            });
            futures::join!(join_all(loads), join_all(runs));

            this.save_overlay_post_checkout(&ctx, to_tree.as_deref());
            Ok(())
        })
    }

    /// Whether this directory (known equal to `tree_hash`) can skip the
    /// whole walk.
    fn can_short_circuit_checkout(
        &self,
        ctx: &CheckoutContext,
        tree_hash: Hash,
        from_tree: Option<&Tree>,
        to_tree: Option<&Tree>,
    ) -> bool {
        if ctx.is_dry_run() {
            // A dry run only reports conflicts against the old state; if
            // we match it there are none below here.
            return match from_tree {
                Some(from) => tree_hash == from.hash(),
                None => to_tree.is_none_or(|to| tree_hash == to.hash()),
            };
        }

        // Applying: we must proceed unless we already match the
        // destination.
        let Some(to) = to_tree else { return false };
        if tree_hash != to.hash() {
            return false;
        }
        match from_tree {
            // Already at the destination and no old state to conflict
            // with.
            None => true,
            // Keep walking when we differ from the old state, purely to
            // report conflicts; the update itself is a no-op.
            Some(from) => tree_hash == from.hash(),
        }
    }

    fn compute_checkout_actions(
        self: &Arc<Self>,
        ctx: &Arc<CheckoutContext>,
        from_tree: Option<&Tree>,
        to_tree: Option<&Tree>,
        actions: &mut Vec<CheckoutAction>,
        pending: &mut Vec<super::tree::PendingChildLoad>,
    ) {
        use std::os::unix::ffi::OsStrExt as _;

        let mut state = self.write_state();
        if let Some(tree_hash) = state.tree_hash {
            if self.can_short_circuit_checkout(ctx, tree_hash, from_tree, to_tree) {
                return;
            }
        }

        // Entries present locally but in neither tree are untracked in
        // both the old and new state; the walk skips them entirely.
        let empty: &[TreeEntry] = &[];
        let old_entries = from_tree.map_or(empty, Tree::entries);
        let new_entries = to_tree.map_or(empty, Tree::entries);
        let mut old_idx = 0;
        let mut new_idx = 0;
        loop {
            let (old_entry, new_entry) = match (old_entries.get(old_idx), new_entries.get(new_idx))
            {
                (None, None) => break,
                (Some(old), None) => {
                    old_idx += 1;
                    (Some(old), None)
                }
                (None, Some(new)) => {
                    new_idx += 1;
                    (None, Some(new))
                }
                (Some(old), Some(new)) => {
                    match old.name().as_bytes().cmp(new.name().as_bytes()) {
                        std::cmp::Ordering::Less => {
                            old_idx += 1;
                            (Some(old), None)
                        }
                        std::cmp::Ordering::Greater => {
                            new_idx += 1;
                            (None, Some(new))
                        }
                        std::cmp::Ordering::Equal => {
                            old_idx += 1;
                            new_idx += 1;
                            (Some(old), Some(new))
                        }
                    }
                }
            };
            self.process_checkout_entry(ctx, &mut state, old_entry, new_entry, actions, pending);
        }
    }

    #[allow(clippy::too_many_lines)]
    fn process_checkout_entry(
        self: &Arc<Self>,
        ctx: &Arc<CheckoutContext>,
        state: &mut TreeState,
        old_entry: Option<&TreeEntry>,
        new_entry: Option<&TreeEntry>,
        actions: &mut Vec<CheckoutAction>,
        pending: &mut Vec<super::tree::PendingChildLoad>,
    ) {
        // Entries identical across the transition need no work, except
        // under force where local modifications must still be reverted.
        if !ctx.is_force() {
            if let (Some(old), Some(new)) = (old_entry, new_entry) {
                if old.ttype() == new.ttype() && old.hash() == new.hash() {
                    return;
                }
            }
        }

        let name = old_entry
            .or(new_entry)
            .expect("at least one side of a checkout entry is present")
            .name();

        let Some(entry) = state.entries.get(name) else {
            match (old_entry, new_entry) {
                (None, Some(new)) => {
                    // Brand new entry, nothing local in the way.
                    if !ctx.is_dry_run() {
                        state.entries.insert(
                            name.to_os_string(),
                            DirEntry::new(
                                mode_from_tree_entry_type(new.ttype()),
                                self.mount().overlay.allocate_inode_number(),
                                Some(new.hash()),
                            ),
                        );
                        self.invalidate_kernel_cache(name);
                    }
                }
                (Some(_), None) => {
                    // Removed in the new tree and already gone locally.
                    ctx.add_conflict(ConflictType::MissingRemoved, self.child_log_path(name));
                }
                (Some(_), Some(new)) => {
                    ctx.add_conflict(ConflictType::RemovedModified, self.child_log_path(name));
                    if ctx.is_force() {
                        state.entries.insert(
                            name.to_os_string(),
                            DirEntry::new(
                                mode_from_tree_entry_type(new.ttype()),
                                self.mount().overlay.allocate_inode_number(),
                                Some(new.hash()),
                            ),
                        );
                        self.invalidate_kernel_cache(name);
                    }
                }
                (None, None) => unreachable!("checked above"),
            }
            return;
        };

        if let Some(handle) = entry.loaded() {
            actions.push(CheckoutAction {
                name: name.to_os_string(),
                old_entry: old_entry.cloned(),
                new_entry: new_entry.cloned(),
                source: ChildSource::Loaded(handle.clone()),
            });
            return;
        }

        if entry.is_materialized()
            || self.mount().inode_map.is_inode_remembered(entry.number())
        {
            // Potentially modified (or with remembered state to update)
            // but not loaded: load it and defer.
            tracing::trace!(
                path = %self.child_log_path(name).display(),
                "checkout: loading child"
            );
            let receiver = self.load_child_locked(name, entry, pending);
            actions.push(CheckoutAction {
                name: name.to_os_string(),
                old_entry: old_entry.cloned(),
                new_entry: new_entry.cloned(),
                source: ChildSource::Pending(receiver),
            });
            return;
        }

        // Conflict detection on the unloaded, unmodified entry.
        let conflict = match old_entry {
            None => Some(ConflictType::UntrackedAdded),
            Some(old) if entry.hash() != Some(old.hash()) => Some(ConflictType::ModifiedModified),
            Some(_) => None,
        };
        if let Some(conflict_type) = conflict {
            if entry.is_directory() {
                // Recurse even though we already know there is a
                // conflict, so every conflicting leaf gets enumerated.
                let receiver = self.load_child_locked(name, entry, pending);
                actions.push(CheckoutAction {
                    name: name.to_os_string(),
                    old_entry: old_entry.cloned(),
                    new_entry: new_entry.cloned(),
                    source: ChildSource::Pending(receiver),
                });
                return;
            }
            ctx.add_conflict(conflict_type, self.child_log_path(name));
            if !ctx.is_force() {
                return;
            }
        }

        if ctx.is_dry_run() {
            return;
        }

        let old_number = entry.number();
        let was_directory = entry.is_directory();
        if let Some(new) = new_entry {
            let slot = state
                .entries
                .get_mut(name)
                .expect("entry presence checked above");
            *slot = DirEntry::new(
                mode_from_tree_entry_type(new.ttype()),
                self.mount().overlay.allocate_inode_number(),
                Some(new.hash()),
            );
        } else {
            state.entries.remove(name);
        }

        if was_directory {
            // Inode numbers remembered for this unloaded subtree are
            // forgotten; the checkout behaves like a removal followed by
            // a fresh checkout of the new state.
            tracing::trace!(
                %old_number,
                path = %self.child_log_path(name).display(),
                "recursively removing overlay data"
            );
            self.mount()
                .overlay
                .recursively_remove_overlay_data(old_number);
        }

        self.invalidate_kernel_cache(name);
    }

    /// Apply a checkout decision to a loaded child.
    pub(crate) async fn checkout_update_entry(
        self: &Arc<Self>,
        ctx: &Arc<CheckoutContext>,
        name: OsString,
        inode: InodeHandle,
        old_tree: Option<Arc<Tree>>,
        new_tree: Option<Arc<Tree>>,
        new_entry: Option<TreeEntry>,
    ) -> Result<()> {
        if inode.as_file().is_some() {
            // A loaded file: replace or remove it in place.
            if ctx.is_dry_run() {
                return Ok(());
            }
            {
                let mut state = self.write_state();
                let Some(entry) = state.entries.get(&name) else {
                    return Err(FsError::bug(format!(
                        "entry {:?} removed while holding the rename lock during checkout",
                        self.child_log_path(&name)
                    )));
                };
                let still_same = entry
                    .loaded()
                    .is_some_and(|loaded| loaded.same_inode(&inode));
                if !still_same {
                    return Err(FsError::bug(format!(
                        "entry {:?} changed while holding the rename lock during checkout",
                        self.child_log_path(&name)
                    )));
                }
                inode.mark_unlinked(ctx.rename_lock());
                if let Some(new) = &new_entry {
                    let slot = state
                        .entries
                        .get_mut(&name)
                        .expect("entry presence checked above");
                    *slot = DirEntry::new(
                        mode_from_tree_entry_type(new.ttype()),
                        self.mount().overlay.allocate_inode_number(),
                        Some(new.hash()),
                    );
                } else {
                    state.entries.remove(&name);
                }
                // Our own overlay record is saved once, in the
                // post-pass, after every child has been processed.
            }
            self.invalidate_kernel_cache(&name);
            return Ok(());
        }

        let child = inode
            .as_tree()
            .cloned()
            .expect("non-file handles are trees");

        // Directory to directory: recurse.
        if new_tree.is_some() {
            return child.checkout(ctx, old_tree, new_tree).await;
        }

        if ctx.is_dry_run() {
            // Note that a DIRECTORY_NOT_EMPTY conflict below is not
            // discovered in dry-run mode; the removal walk never runs.
            return Ok(());
        }

        // The directory is being removed (and possibly replaced with a
        // file). Checking out against the empty tree unlinks everything
        // tracked inside it and removes the directory itself if it ends
        // up empty.
        child.checkout(ctx, old_tree, None).await?;
        if !child.is_unlinked() {
            // Untracked files remain; this conflict cannot be resolved.
            ctx.add_conflict(ConflictType::DirectoryNotEmpty, child.log_path());
            return Ok(());
        }

        if let Some(new) = new_entry {
            let inserted = {
                let mut state = self.write_state();
                if state.entries.contains_key(&name) {
                    false
                } else {
                    state.entries.insert(
                        name.clone(),
                        DirEntry::new(
                            mode_from_tree_entry_type(new.ttype()),
                            self.mount().overlay.allocate_inode_number(),
                            Some(new.hash()),
                        ),
                    );
                    true
                }
            };
            if inserted {
                self.invalidate_kernel_cache(&name);
            } else {
                // File and directory creation is not blocked during
                // checkout, so another caller may have taken the name.
                ctx.add_error(
                    self.child_log_path(&name),
                    &FsError::Exists {
                        path: self.child_log_path(&name),
                    },
                );
            }
        }
        Ok(())
    }

    /// The post-pass: try to dematerialize (or delete) this directory
    /// after all per-entry actions have finished, and propagate any
    /// state change to the parent.
    fn save_overlay_post_checkout(self: &Arc<Self>, ctx: &Arc<CheckoutContext>, tree: Option<&Tree>) {
        if ctx.is_dry_run() {
            return;
        }

        let is_materialized;
        let state_changed;
        let delete_self;
        {
            let mut state = self.write_state();

            // If we are now empty and the new tree has no directory here
            // either, remove this directory entirely.
            delete_self = tree.is_none() && state.entries.is_empty();

            let old_hash = state.tree_hash;
            state.tree_hash = Self::try_to_dematerialize(&state, tree);
            is_materialized = state.is_materialized();
            state_changed = old_hash != state.tree_hash;

            tracing::debug!(
                path = %self.log_path().display(),
                ?old_hash,
                new_hash = ?state.tree_hash,
                delete_self,
                "checkout post-pass"
            );

            // Persist the updated entries even when dematerialized: the
            // record remembers this subtree's inode numbers.
            self.save_overlay_dir_locked(&state);
        }

        if delete_self && self.checkout_try_remove_empty_dir(ctx) {
            return;
        }
        // If the removal failed, someone created an entry in the window
        // after the emptiness check; fall through to the normal state
        // update.

        if state_changed {
            if let Some(parent) = self.core().parent() {
                if !self.is_unlinked() {
                    if is_materialized {
                        parent.child_materialized(ctx.rename_lock(), &self.core().name());
                    } else {
                        let hash = tree
                            .expect("dematerialized directories have a tree")
                            .hash();
                        parent.child_dematerialized(ctx.rename_lock(), &self.core().name(), hash);
                    }
                }
            }
        }
    }

    /// Whether the directory is now identical to `tree`: same entry
    /// count, no materialized child, and every child hash matching.
    fn try_to_dematerialize(state: &TreeState, tree: Option<&Tree>) -> Option<Hash> {
        let tree = tree?;
        let entries = tree.entries();
        if entries.len() != state.entries.len() {
            return None;
        }
        for (scm_entry, (name, entry)) in entries.iter().zip(state.entries.iter()) {
            if name.as_os_str() != scm_entry.name() {
                return None;
            }
            // A materialized child forces us to stay materialized to
            // record that fact, even if its content happens to match.
            if entry.is_materialized() {
                return None;
            }
            if entry.hash() != Some(scm_entry.hash()) {
                return None;
            }
        }
        Some(tree.hash())
    }

    fn checkout_try_remove_empty_dir(self: &Arc<Self>, ctx: &Arc<CheckoutContext>) -> bool {
        let Some(parent) = self.core().parent() else {
            // The root can never remove itself.
            return false;
        };
        if self.is_unlinked() {
            return false;
        }
        let expected = InodeHandle::Tree(Arc::clone(self));
        parent
            .try_remove_child(
                ctx.rename_lock(),
                &self.core().name(),
                Some(&expected),
                RemoveKind::Dir,
                true,
            )
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_predicates() {
        assert!(CheckoutMode::DryRun.is_dry_run());
        assert!(!CheckoutMode::DryRun.is_force());
        assert!(CheckoutMode::Force.is_force());
        assert!(!CheckoutMode::Normal.is_dry_run());
    }
}
