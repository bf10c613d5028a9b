//! The diff engine: classify every leaf of the live tree against a
//! source-control tree.
//!
//! Each directory diff runs in two phases. Under the content write lock
//! it merge-walks its in-memory entries against the tree's entries
//! (both byte-sorted) and queues deferred jobs for anything that needs
//! I/O: child loads, recursive directory diffs, blob comparisons. After
//! releasing the lock it runs the queued loads and jobs concurrently.
//! Per-leaf errors are reported through the callback and never abort the
//! walk.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt as _;

use crate::errors::{FsError, Result};
use crate::ignore::{GitIgnoreStack, IgnoreMatch};
use crate::mount::MountState;
use crate::scm::{tree_entry_type_from_mode, Hash, Tree, TreeEntry};

use super::dir::DirEntry;
use super::inode_map::InodeFuture;
use super::tree::TreeInode;
use super::InodeHandle;

const GITIGNORE_NAME: &str = ".gitignore";
const MAX_SYMLINK_HOPS: usize = 8;

/// Receives one call per differing leaf.
///
/// Implementations must be thread-safe: deferred jobs for sibling
/// subtrees run concurrently.
pub trait DiffCallback: Send + Sync {
    /// A path present locally but not in the tree.
    fn untracked(&self, path: &Path);
    /// An untracked path excluded by ignore rules.
    fn ignored(&self, path: &Path);
    /// A path present in the tree but not locally.
    fn removed(&self, path: &Path);
    /// A path whose content or type differs from the tree.
    fn modified(&self, path: &Path);
    /// A leaf whose diff failed; the walk continues.
    fn diff_error(&self, path: &Path, error: &FsError);
}

/// Shared state for one diff operation.
pub struct DiffContext {
    pub(crate) mount: Arc<MountState>,
    pub(crate) callback: Arc<dyn DiffCallback>,
    pub(crate) list_ignored: bool,
}

impl DiffContext {
    pub(crate) fn new(
        mount: Arc<MountState>,
        callback: Arc<dyn DiffCallback>,
        list_ignored: bool,
    ) -> Self {
        Self {
            mount,
            callback,
            list_ignored,
        }
    }
}

/// Callback that collects results for inspection.
#[derive(Default)]
pub struct DiffCollector {
    results: Mutex<CollectedDiff>,
}

/// Sorted diff results captured by [`DiffCollector`].
#[derive(Default, Debug, Clone)]
pub struct CollectedDiff {
    /// Paths present locally but not in the tree.
    pub untracked: Vec<PathBuf>,
    /// Untracked paths excluded by ignore rules.
    pub ignored: Vec<PathBuf>,
    /// Paths present in the tree but not locally.
    pub removed: Vec<PathBuf>,
    /// Paths whose content or type differs.
    pub modified: Vec<PathBuf>,
    /// Leaf errors, stringified.
    pub errors: Vec<(PathBuf, String)>,
}

impl DiffCollector {
    /// Create an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the collected results, each list sorted.
    #[must_use]
    pub fn results(&self) -> CollectedDiff {
        let mut results = self
            .results
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        results.untracked.sort();
        results.ignored.sort();
        results.removed.sort();
        results.modified.sort();
        results.errors.sort();
        results
    }

    fn with(&self, f: impl FnOnce(&mut CollectedDiff)) {
        f(&mut self
            .results
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner));
    }
}

impl DiffCallback for DiffCollector {
    fn untracked(&self, path: &Path) {
        self.with(|r| r.untracked.push(path.to_path_buf()));
    }
    fn ignored(&self, path: &Path) {
        self.with(|r| r.ignored.push(path.to_path_buf()));
    }
    fn removed(&self, path: &Path) {
        self.with(|r| r.removed.push(path.to_path_buf()));
    }
    fn modified(&self, path: &Path) {
        self.with(|r| r.modified.push(path.to_path_buf()));
    }
    fn diff_error(&self, path: &Path, error: &FsError) {
        self.with(|r| r.errors.push((path.to_path_buf(), error.to_string())));
    }
}

/// A deferred unit of diff work, kept alive until the whole directory's
/// aggregate completes.
struct DeferredJob {
    path: PathBuf,
    future: BoxFuture<'static, Result<()>>,
}

enum ChildSource {
    Loaded(InodeHandle),
    Pending(InodeFuture),
}

impl ChildSource {
    async fn resolve(self) -> Result<InodeHandle> {
        match self {
            Self::Loaded(handle) => Ok(handle),
            Self::Pending(receiver) => TreeInode::await_load(receiver).await,
        }
    }
}

fn report_untracked_leaf(ctx: &DiffContext, path: &Path, ignored: bool) {
    if !ignored {
        tracing::debug!(path = %path.display(), "diff: untracked file");
        ctx.callback.untracked(path);
    } else if ctx.list_ignored {
        tracing::trace!(path = %path.display(), "diff: ignored file");
        ctx.callback.ignored(path);
    }
}

/// Report every leaf of the tree at `hash` as removed, recursively.
fn report_removed_tree(
    ctx: Arc<DiffContext>,
    path: PathBuf,
    hash: Hash,
) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let tree = ctx.mount.store.get_tree(hash).await?;
        let mut subtrees = Vec::new();
        for entry in tree.entries() {
            let entry_path = path.join(entry.name());
            if entry.is_tree() {
                subtrees.push(report_removed_tree(Arc::clone(&ctx), entry_path, entry.hash()));
            } else {
                ctx.callback.removed(&entry_path);
            }
        }
        for outcome in join_all(subtrees).await {
            outcome?;
        }
        Ok(())
    })
}

/// Queue a deferred "both sides present" comparison for a child that is
/// (or is being) loaded.
fn push_modified_job(
    ctx: &Arc<DiffContext>,
    ignore: &Arc<GitIgnoreStack>,
    scm_entry: &TreeEntry,
    entry_path: &Path,
    entry_ignored: bool,
    source: ChildSource,
    jobs: &mut Vec<DeferredJob>,
) {
    let ctx = Arc::clone(ctx);
    let ignore = Arc::clone(ignore);
    let scm_entry = scm_entry.clone();
    let job_path = entry_path.to_path_buf();
    jobs.push(DeferredJob {
        path: entry_path.to_path_buf(),
        future: async move {
            TreeInode::diff_modified_resolved(ctx, job_path, scm_entry, source, ignore, entry_ignored)
                .await
        }
        .boxed(),
    });
}

/// Lexically resolve `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

enum IgnoreSource {
    AlreadyIgnored,
    NoFile,
    Loaded(InodeHandle),
    NeedsLoad,
}

impl TreeInode {
    /// Diff this directory (and its descendants) against `tree`, feeding
    /// results to the context's callback.
    ///
    /// `tree` absent means "the empty tree": everything local is
    /// untracked. `is_ignored` marks directories already inside an
    /// ignored subtree.
    pub fn diff(
        self: &Arc<Self>,
        ctx: &Arc<DiffContext>,
        path: PathBuf,
        tree: Option<Arc<Tree>>,
        parent_ignore: Arc<GitIgnoreStack>,
        is_ignored: bool,
    ) -> BoxFuture<'static, Result<()>> {
        let this = Arc::clone(self);
        let ctx = Arc::clone(ctx);
        Box::pin(async move {
            let source = {
                // A write lock even though diff reads: loading the
                // .gitignore child flips that entry's loaded state.
                let state = this.write_state();
                if !state.is_materialized() {
                    if let Some(tree) = &tree {
                        if state.tree_hash == Some(tree.hash()) {
                            // Identical to the comparison tree; no
                            // changes anywhere below here.
                            return Ok(());
                        }
                    }
                }
                if is_ignored {
                    // Rules cannot un-ignore anything inside an ignored
                    // directory, so skip loading its .gitignore.
                    IgnoreSource::AlreadyIgnored
                } else {
                    match state.entries.get(OsStr::new(GITIGNORE_NAME)) {
                        None => IgnoreSource::NoFile,
                        Some(entry) if entry.is_directory() => {
                            tracing::debug!(
                                path = %this.log_path().display(),
                                "ignoring .gitignore directory"
                            );
                            IgnoreSource::NoFile
                        }
                        Some(entry) => match entry.loaded() {
                            Some(handle) => IgnoreSource::Loaded(handle.clone()),
                            None => IgnoreSource::NeedsLoad,
                        },
                    }
                }
            };

            let ignore = match source {
                IgnoreSource::AlreadyIgnored => Arc::clone(&parent_ignore),
                IgnoreSource::NoFile => GitIgnoreStack::empty(&parent_ignore, path.clone()),
                IgnoreSource::Loaded(handle) => {
                    let content = this.read_ignore_content(&ctx, handle).await;
                    GitIgnoreStack::push(&parent_ignore, path.clone(), &content)
                }
                IgnoreSource::NeedsLoad => {
                    let content = match this.get_or_load_child(OsStr::new(GITIGNORE_NAME)).await {
                        Ok(handle) => this.read_ignore_content(&ctx, handle).await,
                        Err(err) => {
                            tracing::warn!(
                                path = %this.log_path().display(),
                                %err,
                                "failed to load .gitignore"
                            );
                            Bytes::new()
                        }
                    };
                    GitIgnoreStack::push(&parent_ignore, path.clone(), &content)
                }
            };

            this.compute_diff(&ctx, path, tree, ignore, is_ignored).await
        })
    }

    /// Read ignore rule bytes from an inode, resolving symlinks within
    /// the mount. Failures degrade to an empty rule set; a broken ignore
    /// file must not fail the diff.
    async fn read_ignore_content(
        self: &Arc<Self>,
        ctx: &Arc<DiffContext>,
        handle: InodeHandle,
    ) -> Bytes {
        let mut handle = handle;
        for _ in 0..MAX_SYMLINK_HOPS {
            let file = match &handle {
                InodeHandle::Tree(_) => {
                    tracing::warn!(
                        path = %self.log_path().display(),
                        "ignore file resolved to a directory"
                    );
                    return Bytes::new();
                }
                InodeHandle::File(file) => Arc::clone(file),
            };
            if file.mode() & libc::S_IFMT == libc::S_IFLNK {
                match self.resolve_ignore_symlink(ctx, &file).await {
                    Some(next) => {
                        handle = next;
                        continue;
                    }
                    None => return Bytes::new(),
                }
            }
            return match file.read_all().await {
                Ok(content) => content,
                Err(err) => {
                    tracing::warn!(
                        path = %self.log_path().display(),
                        %err,
                        "error reading ignore file"
                    );
                    Bytes::new()
                }
            };
        }
        tracing::warn!(
            path = %self.log_path().display(),
            "too many levels of symlinks resolving ignore file"
        );
        Bytes::new()
    }

    async fn resolve_ignore_symlink(
        self: &Arc<Self>,
        ctx: &Arc<DiffContext>,
        file: &Arc<super::FileInode>,
    ) -> Option<InodeHandle> {
        let target = match file.readlink().await {
            Ok(target) => target,
            Err(err) => {
                tracing::warn!(%err, "error reading gitignore symlink");
                return None;
            }
        };
        let target_path = Path::new(&target);
        if target_path.is_absolute() {
            return None;
        }
        let resolved = normalize(&self.get_path()?.join(target_path));
        match ctx.mount.root().get_child_recursive(&resolved).await {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(%err, "error resolving gitignore symlink");
                None
            }
        }
    }

    async fn compute_diff(
        self: &Arc<Self>,
        ctx: &Arc<DiffContext>,
        path: PathBuf,
        tree: Option<Arc<Tree>>,
        ignore: Arc<GitIgnoreStack>,
        is_ignored: bool,
    ) -> Result<()> {
        use std::os::unix::ffi::OsStrExt as _;

        let mut pending = Vec::new();
        let mut jobs: Vec<DeferredJob> = Vec::new();
        {
            let state = self.write_state();
            let empty: &[TreeEntry] = &[];
            let scm_entries = tree.as_ref().map_or(empty, |t| t.entries());
            let mut scm_idx = 0;
            let mut inode_iter = state.entries.iter();
            let mut inode_next = inode_iter.next();

            loop {
                match (inode_next, scm_entries.get(scm_idx)) {
                    (None, None) => break,
                    (Some((name, entry)), None) => {
                        self.diff_untracked(
                            ctx, &path, name, entry, &ignore, is_ignored, &mut jobs, &mut pending,
                        );
                        inode_next = inode_iter.next();
                    }
                    (None, Some(scm_entry)) => {
                        Self::diff_removed(ctx, &path, scm_entry, &mut jobs);
                        scm_idx += 1;
                    }
                    (Some((name, entry)), Some(scm_entry)) => {
                        match scm_entry.name().as_bytes().cmp(name.as_bytes()) {
                            std::cmp::Ordering::Less => {
                                Self::diff_removed(ctx, &path, scm_entry, &mut jobs);
                                scm_idx += 1;
                            }
                            std::cmp::Ordering::Greater => {
                                self.diff_untracked(
                                    ctx, &path, name, entry, &ignore, is_ignored, &mut jobs,
                                    &mut pending,
                                );
                                inode_next = inode_iter.next();
                            }
                            std::cmp::Ordering::Equal => {
                                self.diff_both(
                                    ctx, &path, scm_entry, name, entry, &ignore, is_ignored,
                                    &mut jobs, &mut pending,
                                );
                                scm_idx += 1;
                                inode_next = inode_iter.next();
                            }
                        }
                    }
                }
            }
        }

        // Drive the loads we won concurrently with the deferred jobs;
        // the jobs' receivers resolve as the loads complete.
        let loads = pending
            .into_iter()
            .map(|load| Arc::clone(self).run_pending_load(load));
        let jobs = jobs.into_iter().map(|job| {
            let ctx = Arc::clone(ctx);
            async move {
                if let Err(err) = job.future.await {
                    tracing::warn!(
                        path = %job.path.display(),
                        %err,
                        "error processing diff entry"
                    );
                    ctx.callback.diff_error(&job.path, &err);
                }
            }
        });
        futures::join!(join_all(loads), join_all(jobs));

        // Leaf errors were already delivered through the callback, so the
        // aggregate reports success and parents do not double-report.
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn diff_untracked(
        self: &Arc<Self>,
        ctx: &Arc<DiffContext>,
        path: &Path,
        name: &OsStr,
        entry: &DirEntry,
        ignore: &Arc<GitIgnoreStack>,
        is_ignored: bool,
        jobs: &mut Vec<DeferredJob>,
        pending: &mut Vec<super::tree::PendingChildLoad>,
    ) {
        let entry_path = path.join(name);
        let mut entry_ignored = is_ignored;
        if !is_ignored {
            match ignore.matches(&entry_path, entry.is_directory()) {
                IgnoreMatch::Hidden => {
                    tracing::trace!(path = %entry_path.display(), "diff: hidden entry");
                    return;
                }
                IgnoreMatch::Exclude => entry_ignored = true,
                IgnoreMatch::Include => entry_ignored = false,
            }
        }

        if entry.is_directory() {
            if !entry_ignored || ctx.list_ignored {
                let source = match entry.loaded() {
                    Some(handle) => ChildSource::Loaded(handle.clone()),
                    None => ChildSource::Pending(self.load_child_locked(name, entry, pending)),
                };
                let ctx = Arc::clone(ctx);
                let ignore = Arc::clone(ignore);
                let job_path = entry_path.clone();
                jobs.push(DeferredJob {
                    path: entry_path.clone(),
                    future: async move {
                        match source.resolve().await? {
                            InodeHandle::Tree(child) => {
                                child
                                    .diff(&ctx, job_path, None, ignore, entry_ignored)
                                    .await
                            }
                            InodeHandle::File(_) => {
                                report_untracked_leaf(&ctx, &job_path, entry_ignored);
                                Ok(())
                            }
                        }
                    }
                    .boxed(),
                });
            }
        } else {
            report_untracked_leaf(ctx, &entry_path, entry_ignored);
        }
    }

    fn diff_removed(
        ctx: &Arc<DiffContext>,
        path: &Path,
        scm_entry: &TreeEntry,
        jobs: &mut Vec<DeferredJob>,
    ) {
        let entry_path = path.join(scm_entry.name());
        if scm_entry.is_tree() {
            jobs.push(DeferredJob {
                path: entry_path.clone(),
                future: report_removed_tree(Arc::clone(ctx), entry_path, scm_entry.hash()),
            });
        } else {
            tracing::debug!(path = %entry_path.display(), "diff: removed file");
            ctx.callback.removed(&entry_path);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn diff_both(
        self: &Arc<Self>,
        ctx: &Arc<DiffContext>,
        path: &Path,
        scm_entry: &TreeEntry,
        name: &OsStr,
        entry: &DirEntry,
        ignore: &Arc<GitIgnoreStack>,
        is_ignored: bool,
        jobs: &mut Vec<DeferredJob>,
        pending: &mut Vec<super::tree::PendingChildLoad>,
    ) {
        let entry_path = path.join(name);

        // The ignore status only matters when a directory is involved; a
        // regular file tracked in source control is reported regardless.
        let mut entry_ignored = is_ignored;
        if !is_ignored && (entry.is_directory() || scm_entry.is_tree()) {
            entry_ignored = match ignore.matches(&entry_path, true) {
                // Source control should not contain reserved names;
                // treat such entries as ignored.
                IgnoreMatch::Hidden | IgnoreMatch::Exclude => true,
                IgnoreMatch::Include => false,
            };
        }

        if let Some(handle) = entry.loaded() {
            push_modified_job(
                ctx,
                ignore,
                scm_entry,
                &entry_path,
                entry_ignored,
                ChildSource::Loaded(handle.clone()),
                jobs,
            );
        } else if entry.is_materialized() {
            // Materialized but unloaded: only loading it can tell whether
            // it still equals the source-control entry.
            let receiver = self.load_child_locked(name, entry, pending);
            push_modified_job(
                ctx,
                ignore,
                scm_entry,
                &entry_path,
                entry_ignored,
                ChildSource::Pending(receiver),
                jobs,
            );
        } else if tree_entry_type_from_mode(entry.mode()) == Some(scm_entry.ttype())
            && entry.hash() == Some(scm_entry.hash())
        {
            tracing::trace!(path = %entry_path.display(), "diff: unchanged unloaded entry");
        } else if entry.is_directory() {
            let receiver = self.load_child_locked(name, entry, pending);
            push_modified_job(
                ctx,
                ignore,
                scm_entry,
                &entry_path,
                entry_ignored,
                ChildSource::Pending(receiver),
                jobs,
            );
        } else if scm_entry.is_tree() {
            // A directory in source control replaced by a local file:
            // report the file, then enumerate the whole subtree as
            // removed.
            report_untracked_leaf(ctx, &entry_path, entry_ignored);
            jobs.push(DeferredJob {
                path: entry_path.clone(),
                future: report_removed_tree(Arc::clone(ctx), entry_path, scm_entry.hash()),
            });
        } else if tree_entry_type_from_mode(entry.mode()) != Some(scm_entry.ttype()) {
            tracing::debug!(path = %entry_path.display(), "diff: modified by type change");
            ctx.callback.modified(&entry_path);
        } else {
            // Same type, different hash: compare content before
            // reporting, in case the two blobs happen to be identical.
            let local_hash = entry.hash().expect("non-materialized entry has a hash");
            let ctx_clone = Arc::clone(ctx);
            let scm_hash = scm_entry.hash();
            let job_path = entry_path.clone();
            jobs.push(DeferredJob {
                path: entry_path,
                future: async move {
                    let (local, scm) = futures::try_join!(
                        ctx_clone.mount.store.get_blob(local_hash),
                        ctx_clone.mount.store.get_blob(scm_hash)
                    )?;
                    if local != scm {
                        ctx_clone.callback.modified(&job_path);
                    }
                    Ok(())
                }
                .boxed(),
            });
        }
    }

    async fn diff_modified_resolved(
        ctx: Arc<DiffContext>,
        path: PathBuf,
        scm_entry: TreeEntry,
        source: ChildSource,
        ignore: Arc<GitIgnoreStack>,
        entry_ignored: bool,
    ) -> Result<()> {
        match source.resolve().await? {
            InodeHandle::Tree(child) => {
                if scm_entry.is_tree() {
                    let subtree = ctx.mount.store.get_tree(scm_entry.hash()).await?;
                    child
                        .diff(&ctx, path, Some(subtree), ignore, entry_ignored)
                        .await
                } else {
                    // Locally a directory, a file in source control: the
                    // file is gone and the directory is untracked.
                    ctx.callback.removed(&path);
                    child.diff(&ctx, path, None, ignore, entry_ignored).await
                }
            }
            InodeHandle::File(file) => {
                if scm_entry.is_tree() {
                    report_untracked_leaf(&ctx, &path, entry_ignored);
                    report_removed_tree(Arc::clone(&ctx), path, scm_entry.hash()).await
                } else {
                    if !file.is_same_as(scm_entry.hash(), scm_entry.ttype()).await? {
                        ctx.callback.modified(&path);
                    }
                    Ok(())
                }
            }
        }
    }
}
