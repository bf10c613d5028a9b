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
use scmfs::{DiffCollector, MemoryObjectStore};

fn paths(paths: &[&str]) -> Vec<PathBuf> {
    paths.iter().map(PathBuf::from).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unmodified_mount_diffs_clean() {
    let store = Arc::new(MemoryObjectStore::new());
    let sub = tree(&store).file("c", b"3").build();
    let root_tree = tree(&store).file("a", b"1").dir("b", sub).build();
    let tm = TestMount::new(store, Some(root_tree)).await;

    let collector = Arc::new(DiffCollector::new());
    tm.mount.diff(Arc::clone(&collector) as _, false).await.unwrap();

    let results = collector.results();
    assert!(results.untracked.is_empty());
    assert!(results.removed.is_empty());
    assert!(results.modified.is_empty());
    assert!(results.errors.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn created_file_reports_untracked() {
    let store = Arc::new(MemoryObjectStore::new());
    let root_tree = tree(&store).build();
    let tm = TestMount::new(store, Some(root_tree)).await;
    let root = tm.mount.root();

    root.create(os("x"), 0o644, Bytes::new()).await.unwrap();

    let collector = Arc::new(DiffCollector::new());
    tm.mount.diff(Arc::clone(&collector) as _, false).await.unwrap();
    assert_eq!(collector.results().untracked, paths(&["x"]));
    assert!(root.is_materialized());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn modified_file_reports_modified() {
    let store = Arc::new(MemoryObjectStore::new());
    let root_tree = tree(&store).file("a", b"old").file("b", b"same").build();
    let tm = TestMount::new(store, Some(root_tree)).await;
    let root = tm.mount.root();

    let a = root.get_or_load_child(os("a")).await.unwrap();
    a.as_file()
        .unwrap()
        .write_all(Bytes::from_static(b"new"))
        .await
        .unwrap();

    let collector = Arc::new(DiffCollector::new());
    tm.mount.diff(Arc::clone(&collector) as _, false).await.unwrap();
    let results = collector.results();
    assert_eq!(results.modified, paths(&["a"]));
    assert!(results.untracked.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removed_file_and_tree_report_every_leaf() {
    let store = Arc::new(MemoryObjectStore::new());
    let inner = tree(&store).file("deep", b"d").build();
    let sub = tree(&store).file("leaf", b"l").dir("inner", inner).build();
    let root_tree = tree(&store).file("top", b"t").dir("sub", sub).build();
    let tm = TestMount::new(store, Some(root_tree)).await;
    let root = tm.mount.root();

    root.unlink(os("top")).await.unwrap();
    // Remove the whole subtree.
    let sub_dir = root.get_or_load_child_tree(os("sub")).await.unwrap();
    sub_dir.unlink(os("leaf")).await.unwrap();
    let inner_dir = sub_dir.get_or_load_child_tree(os("inner")).await.unwrap();
    inner_dir.unlink(os("deep")).await.unwrap();
    sub_dir.rmdir(os("inner")).await.unwrap();
    root.rmdir(os("sub")).await.unwrap();

    let collector = Arc::new(DiffCollector::new());
    tm.mount.diff(Arc::clone(&collector) as _, false).await.unwrap();
    assert_eq!(
        collector.results().removed,
        paths(&["sub/inner/deep", "sub/leaf", "top"])
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gitignore_rules_classify_untracked_files() {
    let store = Arc::new(MemoryObjectStore::new());
    let root_tree = tree(&store).build();
    let tm = TestMount::new(store, Some(root_tree)).await;
    let root = tm.mount.root();

    root.create(os(".gitignore"), 0o644, Bytes::from_static(b"*.log\n"))
        .await
        .unwrap();
    root.create(os("build.log"), 0o644, Bytes::new()).await.unwrap();
    root.create(os("notes.txt"), 0o644, Bytes::new()).await.unwrap();

    let collector = Arc::new(DiffCollector::new());
    tm.mount.diff(Arc::clone(&collector) as _, false).await.unwrap();
    let results = collector.results();
    assert_eq!(results.untracked, paths(&[".gitignore", "notes.txt"]));
    // list_ignored was false, so the ignored file is not reported.
    assert!(results.ignored.is_empty());

    let collector = Arc::new(DiffCollector::new());
    tm.mount.diff(Arc::clone(&collector) as _, true).await.unwrap();
    assert_eq!(collector.results().ignored, paths(&["build.log"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gitignore_from_parent_applies_to_subdir() {
    let store = Arc::new(MemoryObjectStore::new());
    let root_tree = tree(&store).build();
    let tm = TestMount::new(store, Some(root_tree)).await;
    let root = tm.mount.root();

    root.create(os(".gitignore"), 0o644, Bytes::from_static(b"*.tmp\n"))
        .await
        .unwrap();
    let sub = root.mkdir(os("sub"), 0o755).await.unwrap();
    sub.create(os("scratch.tmp"), 0o644, Bytes::new())
        .await
        .unwrap();
    sub.create(os("kept.rs"), 0o644, Bytes::new()).await.unwrap();

    let collector = Arc::new(DiffCollector::new());
    tm.mount.diff(Arc::clone(&collector) as _, true).await.unwrap();
    let results = collector.results();
    assert!(results.untracked.contains(&PathBuf::from("sub/kept.rs")));
    assert_eq!(results.ignored, paths(&["sub/scratch.tmp"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ignored_directory_contents_are_summarized() {
    let store = Arc::new(MemoryObjectStore::new());
    let root_tree = tree(&store).build();
    let tm = TestMount::new(store, Some(root_tree)).await;
    let root = tm.mount.root();

    root.create(os(".gitignore"), 0o644, Bytes::from_static(b"target/\n"))
        .await
        .unwrap();
    let target = root.mkdir(os("target"), 0o755).await.unwrap();
    target.create(os("artifact"), 0o644, Bytes::new()).await.unwrap();

    // Without list_ignored the ignored directory is skipped entirely.
    let collector = Arc::new(DiffCollector::new());
    tm.mount.diff(Arc::clone(&collector) as _, false).await.unwrap();
    let results = collector.results();
    assert_eq!(results.untracked, paths(&[".gitignore"]));
    assert!(results.ignored.is_empty());

    // With list_ignored the walk descends and reports the leaves.
    let collector = Arc::new(DiffCollector::new());
    tm.mount.diff(Arc::clone(&collector) as _, true).await.unwrap();
    assert_eq!(collector.results().ignored, paths(&["target/artifact"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn control_dir_name_is_hidden_from_diff() {
    let tm = TestMount::empty().await;
    let root = tm.mount.root();
    // An entry carrying the reserved name is never reported, not even as
    // ignored.
    root.create(os(scmfs::CONTROL_DIR_NAME), 0o644, Bytes::new())
        .await
        .unwrap();
    root.create(os("visible"), 0o644, Bytes::new()).await.unwrap();

    let collector = Arc::new(DiffCollector::new());
    tm.mount.diff(Arc::clone(&collector) as _, true).await.unwrap();
    let results = collector.results();
    assert_eq!(results.untracked, paths(&["visible"]));
    assert!(results.ignored.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unloaded_unchanged_subtree_is_not_fetched() {
    let store = Arc::new(MemoryObjectStore::new());
    let sub = tree(&store).file("f", b"1").build();
    let root_tree = tree(&store).dir("sub", sub).file("top", b"t").build();
    let tm = TestMount::new(Arc::clone(&store), Some(root_tree)).await;
    let root = tm.mount.root();

    // Materialize the root so the whole-directory fast path cannot kick
    // in; the per-entry hash check must skip the subtree instead.
    root.create(os("extra"), 0o644, Bytes::new()).await.unwrap();
    let fetches = store.tree_fetch_count();

    let collector = Arc::new(DiffCollector::new());
    tm.mount.diff(Arc::clone(&collector) as _, false).await.unwrap();

    assert_eq!(collector.results().untracked, paths(&["extra"]));
    // Only the comparison root tree itself was fetched; the unchanged
    // subtree was neither loaded nor fetched.
    assert_eq!(store.tree_fetch_count(), fetches + 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_replacing_directory_reports_both_sides() {
    let store = Arc::new(MemoryObjectStore::new());
    let sub = tree(&store).file("inner", b"1").build();
    let root_tree = tree(&store).dir("thing", sub).build();
    let tm = TestMount::new(store, Some(root_tree)).await;
    let root = tm.mount.root();

    // Replace the directory with a file of the same name.
    let thing = root.get_or_load_child_tree(os("thing")).await.unwrap();
    thing.unlink(os("inner")).await.unwrap();
    root.rmdir(os("thing")).await.unwrap();
    root.create(os("thing"), 0o644, Bytes::new()).await.unwrap();

    let collector = Arc::new(DiffCollector::new());
    tm.mount.diff(Arc::clone(&collector) as _, false).await.unwrap();
    let results = collector.results();
    assert_eq!(results.untracked, paths(&["thing"]));
    assert_eq!(results.removed, paths(&["thing/inner"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn symlinked_gitignore_is_resolved() {
    let store = Arc::new(MemoryObjectStore::new());
    let root_tree = tree(&store).build();
    let tm = TestMount::new(store, Some(root_tree)).await;
    let root = tm.mount.root();

    root.create(os("rules"), 0o644, Bytes::from_static(b"*.o\n"))
        .await
        .unwrap();
    root.symlink(os(".gitignore"), os("rules")).await.unwrap();
    root.create(os("a.o"), 0o644, Bytes::new()).await.unwrap();

    let collector = Arc::new(DiffCollector::new());
    tm.mount.diff(Arc::clone(&collector) as _, true).await.unwrap();
    let results = collector.results();
    assert_eq!(results.ignored, paths(&["a.o"]));
    assert!(results.untracked.contains(&PathBuf::from("rules")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn type_change_reports_modified() {
    let store = Arc::new(MemoryObjectStore::new());
    let root_tree = tree(&store).file("tool", b"#!/bin/sh\n").build();
    let tm = TestMount::new(store, Some(root_tree)).await;
    let root = tm.mount.root();

    let tool = root.get_or_load_child(os("tool")).await.unwrap();
    tool.as_file()
        .unwrap()
        .setattr(scmfs::SetAttr {
            mode: Some(0o755),
            ..scmfs::SetAttr::default()
        })
        .await
        .unwrap();

    let collector = Arc::new(DiffCollector::new());
    tm.mount.diff(Arc::clone(&collector) as _, false).await.unwrap();
    assert_eq!(collector.results().modified, paths(&["tool"]));
}
