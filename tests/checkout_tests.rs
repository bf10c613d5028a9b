#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::similar_names,
    missing_docs
)]

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;

use common::{os, tree, TestMount};
use scmfs::{CheckoutMode, ConflictType, DiffCollector, MemoryObjectStore};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn checkout_adds_and_removes_entries() {
    let store = Arc::new(MemoryObjectStore::new());
    let from = tree(&store).file("keep", b"same").file("gone", b"old").build();
    let to = tree(&store).file("keep", b"same").file("fresh", b"new").build();
    let tm = TestMount::new(store, Some(from)).await;
    let root = tm.mount.root();

    let result = tm.mount.checkout(Some(to), CheckoutMode::Normal).await.unwrap();
    assert!(result.conflicts.is_empty());
    assert!(result.errors.is_empty());

    let mut names = root.entry_names();
    names.sort();
    assert_eq!(names, vec!["fresh", "keep"]);
    assert_eq!(tm.mount.current_tree(), Some(to));

    let fresh = root.get_or_load_child(os("fresh")).await.unwrap();
    assert_eq!(&fresh.as_file().unwrap().read_all().await.unwrap()[..], b"new");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn checkout_dematerializes_reverted_directory() {
    let store = Arc::new(MemoryObjectStore::new());
    let t0 = tree(&store).file("a", b"content").build();
    let tm = TestMount::new(store, Some(t0)).await;
    let root = tm.mount.root();

    // Materialize the root without changing any entry's source-control
    // identity: create a file, then remove it again.
    root.create(os("tmp"), 0o644, Bytes::new()).await.unwrap();
    root.unlink(os("tmp")).await.unwrap();
    assert!(root.is_materialized());

    let result = tm.mount.checkout(Some(t0), CheckoutMode::Normal).await.unwrap();
    assert!(result.conflicts.is_empty());

    // The post-pass saw every entry matching and dematerialized the
    // directory back to the tree.
    assert_eq!(root.tree_hash(), Some(t0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dry_run_reports_modified_conflict_without_changes() {
    let store = Arc::new(MemoryObjectStore::new());
    let t0 = tree(&store).file("a", b"one").build();
    let t1 = tree(&store).file("a", b"two").build();
    let tm = TestMount::new(store, Some(t0)).await;
    let root = tm.mount.root();

    let a = root.get_or_load_child(os("a")).await.unwrap();
    a.as_file()
        .unwrap()
        .write_all(Bytes::from_static(b"local change"))
        .await
        .unwrap();

    let result = tm.mount.checkout(Some(t1), CheckoutMode::DryRun).await.unwrap();
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].conflict_type, ConflictType::ModifiedModified);
    assert_eq!(result.conflicts[0].path, PathBuf::from("a"));

    // Nothing changed: still on t0, local content intact.
    assert_eq!(tm.mount.current_tree(), Some(t0));
    assert_eq!(
        &a.as_file().unwrap().read_all().await.unwrap()[..],
        b"local change"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn force_checkout_replaces_modified_file() {
    let store = Arc::new(MemoryObjectStore::new());
    let t0 = tree(&store).file("a", b"one").build();
    let t1 = tree(&store).file("a", b"two").build();
    let tm = TestMount::new(store, Some(t0)).await;
    let root = tm.mount.root();

    let a = root.get_or_load_child(os("a")).await.unwrap();
    a.as_file()
        .unwrap()
        .write_all(Bytes::from_static(b"local change"))
        .await
        .unwrap();

    let result = tm.mount.checkout(Some(t1), CheckoutMode::Force).await.unwrap();
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].conflict_type, ConflictType::ModifiedModified);

    // The entry was replaced with the new source-control state and the
    // root dematerialized.
    let replaced = root.get_or_load_child(os("a")).await.unwrap();
    assert_eq!(&replaced.as_file().unwrap().read_all().await.unwrap()[..], b"two");
    assert!(!replaced.as_file().unwrap().is_materialized());
    assert_eq!(root.tree_hash(), Some(t1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_removed_and_removed_modified_conflicts() {
    let store = Arc::new(MemoryObjectStore::new());
    let t0 = tree(&store)
        .file("deleted_both", b"x")
        .file("deleted_then_changed", b"y")
        .build();
    // t1 removes deleted_both and modifies deleted_then_changed.
    let t1 = tree(&store).file("deleted_then_changed", b"updated").build();
    let tm = TestMount::new(store, Some(t0)).await;
    let root = tm.mount.root();

    root.unlink(os("deleted_both")).await.unwrap();
    root.unlink(os("deleted_then_changed")).await.unwrap();

    let result = tm.mount.checkout(Some(t1), CheckoutMode::Normal).await.unwrap();
    let kinds: Vec<_> = result
        .conflicts
        .iter()
        .map(|c| (c.path.clone(), c.conflict_type))
        .collect();
    assert!(kinds.contains(&(PathBuf::from("deleted_both"), ConflictType::MissingRemoved)));
    assert!(kinds.contains(&(
        PathBuf::from("deleted_then_changed"),
        ConflictType::RemovedModified
    )));
    // Without force, the locally deleted entry is left deleted.
    assert!(root.entry_names().is_empty());

    let result = tm.mount.checkout(Some(t1), CheckoutMode::Force).await.unwrap();
    assert!(result
        .conflicts
        .iter()
        .any(|c| c.conflict_type == ConflictType::RemovedModified));
    assert_eq!(root.entry_names(), vec!["deleted_then_changed"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn untracked_added_conflict() {
    let store = Arc::new(MemoryObjectStore::new());
    let t0 = tree(&store).build();
    let t1 = tree(&store).file("x", b"from tree").build();
    let tm = TestMount::new(store, Some(t0)).await;
    let root = tm.mount.root();

    root.create(os("x"), 0o644, Bytes::from_static(b"local"))
        .await
        .unwrap();

    let result = tm.mount.checkout(Some(t1), CheckoutMode::DryRun).await.unwrap();
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].conflict_type, ConflictType::UntrackedAdded);

    let result = tm.mount.checkout(Some(t1), CheckoutMode::Force).await.unwrap();
    assert_eq!(result.conflicts.len(), 1);
    let x = root.get_or_load_child(os("x")).await.unwrap();
    assert_eq!(&x.as_file().unwrap().read_all().await.unwrap()[..], b"from tree");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn directory_with_untracked_contents_is_not_removed() {
    let store = Arc::new(MemoryObjectStore::new());
    let sub = tree(&store).file("tracked", b"t").build();
    let t0 = tree(&store).dir("d", sub).build();
    let t1 = tree(&store).build();
    let tm = TestMount::new(store, Some(t0)).await;
    let root = tm.mount.root();

    let d = root.get_or_load_child_tree(os("d")).await.unwrap();
    d.create(os("untracked"), 0o644, Bytes::new()).await.unwrap();

    let result = tm.mount.checkout(Some(t1), CheckoutMode::Normal).await.unwrap();
    assert!(result
        .conflicts
        .iter()
        .any(|c| c.conflict_type == ConflictType::DirectoryNotEmpty
            && c.path == PathBuf::from("d")));

    // The tracked file is gone, the untracked one survives.
    assert_eq!(root.entry_names(), vec!["d"]);
    assert_eq!(d.entry_names(), vec!["untracked"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_directories_are_removed_when_leaving_them() {
    let store = Arc::new(MemoryObjectStore::new());
    let sub = tree(&store).file("f", b"1").build();
    let t0 = tree(&store).dir("d", sub).build();
    let t1 = tree(&store).build();
    let tm = TestMount::new(store, Some(t0)).await;
    let root = tm.mount.root();

    // Load the directory so the removal goes through the recursive
    // checkout path rather than wholesale entry deletion.
    let d = root.get_or_load_child_tree(os("d")).await.unwrap();
    assert_eq!(d.entry_names(), vec!["f"]);

    let result = tm.mount.checkout(Some(t1), CheckoutMode::Normal).await.unwrap();
    assert!(result.conflicts.is_empty());
    assert!(root.entry_names().is_empty());
    assert!(d.is_unlinked());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn checkout_round_trip_restores_and_dematerializes() {
    let store = Arc::new(MemoryObjectStore::new());
    let sub_a = tree(&store).file("inner", b"a").build();
    let tree_a = tree(&store).file("top", b"a").dir("sub", sub_a).build();
    let sub_b = tree(&store).file("inner", b"b").build();
    let tree_b = tree(&store)
        .file("top", b"b")
        .file("added", b"b")
        .dir("sub", sub_b)
        .build();
    let tm = TestMount::new(store, Some(tree_a)).await;
    let root = tm.mount.root();

    // Load the subtree so checkout visits it recursively.
    let sub = root.get_or_load_child_tree(os("sub")).await.unwrap();
    let _ = sub.get_or_load_child(os("inner")).await.unwrap();

    let result = tm.mount.checkout(Some(tree_b), CheckoutMode::Normal).await.unwrap();
    assert!(result.conflicts.is_empty());
    assert_eq!(tm.mount.current_tree(), Some(tree_b));

    let result = tm.mount.checkout(Some(tree_a), CheckoutMode::Normal).await.unwrap();
    assert!(result.conflicts.is_empty());
    assert_eq!(tm.mount.current_tree(), Some(tree_a));

    // Every visited directory is dematerialized back to tree A.
    assert_eq!(root.tree_hash(), Some(tree_a));
    let mut names = root.entry_names();
    names.sort();
    assert_eq!(names, vec!["sub", "top"]);

    // And the contents match the original state.
    let collector = Arc::new(DiffCollector::new());
    tm.mount.diff(Arc::clone(&collector) as _, false).await.unwrap();
    let results = collector.results();
    assert!(results.untracked.is_empty());
    assert!(results.removed.is_empty());
    assert!(results.modified.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn checkout_to_empty_tree_clears_tracked_state() {
    let store = Arc::new(MemoryObjectStore::new());
    let sub = tree(&store).file("f", b"1").build();
    let t0 = tree(&store).dir("d", sub).file("top", b"t").build();
    let tm = TestMount::new(store, Some(t0)).await;
    let root = tm.mount.root();

    let result = tm.mount.checkout(None, CheckoutMode::Normal).await.unwrap();
    assert!(result.conflicts.is_empty());
    assert!(root.entry_names().is_empty());
    assert!(root.is_materialized());
    assert_eq!(tm.mount.current_tree(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn checkout_invalidates_kernel_entries() {
    let store = Arc::new(MemoryObjectStore::new());
    let t0 = tree(&store).file("gone", b"x").build();
    let t1 = tree(&store).file("new", b"y").build();
    let tm = TestMount::new(store, Some(t0)).await;

    tm.mount.checkout(Some(t1), CheckoutMode::Normal).await.unwrap();

    let invalidated: Vec<_> = tm
        .channel
        .snapshot()
        .into_iter()
        .map(|(_, name)| name)
        .collect();
    assert!(invalidated.iter().any(|n| n == "gone"));
    assert!(invalidated.iter().any(|n| n == "new"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn checkout_forgets_overlay_data_of_replaced_subtrees() {
    let store = Arc::new(MemoryObjectStore::new());
    let sub_a = tree(&store).file("f", b"a").build();
    let tree_a = tree(&store).dir("sub", sub_a).build();
    let sub_b = tree(&store).file("f", b"b").build();
    let tree_b = tree(&store).dir("sub", sub_b).build();
    let tm = TestMount::new(store, Some(tree_a)).await;
    let root = tm.mount.root();

    // Load the subtree (allocating remembered inode numbers), then drop
    // it back out of memory.
    let number_before = {
        let sub = root.get_or_load_child_tree(os("sub")).await.unwrap();
        sub.number()
    };
    root.unload_children_now();

    tm.mount.checkout(Some(tree_b), CheckoutMode::Normal).await.unwrap();

    // The replaced subtree got a fresh inode number; the old one's
    // remembered state is gone.
    let number_after = root.get_child_inode_number(os("sub")).unwrap();
    assert_ne!(number_before, number_after);
}
