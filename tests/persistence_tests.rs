#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::similar_names,
    missing_docs
)]

mod common;

use std::sync::Arc;

use bytes::Bytes;

use common::{os, tree};
use scmfs::overlay::{DiskInodeCatalog, InodeCatalog, MemoryInodeCatalog};
use scmfs::{MemoryObjectStore, Mount, ObjectStore, Overlay};

async fn mount_with(
    store: &Arc<MemoryObjectStore>,
    dirs: &Arc<dyn InodeCatalog>,
    files: &Arc<dyn InodeCatalog>,
    initial: Option<scmfs::Hash>,
) -> Mount {
    common::init_tracing();
    Mount::new(
        Arc::clone(store) as Arc<dyn ObjectStore>,
        Overlay::with_catalogs(
            Arc::clone(dirs),
            Arc::clone(files),
            scmfs::overlay::DEFAULT_BUFFER_BUDGET,
        ),
        None,
        initial,
    )
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn materialized_state_survives_remount() {
    let store = Arc::new(MemoryObjectStore::new());
    let root_tree = tree(&store).file("tracked", b"from scm").build();
    let dirs: Arc<dyn InodeCatalog> = Arc::new(MemoryInodeCatalog::new());
    let files: Arc<dyn InodeCatalog> = Arc::new(MemoryInodeCatalog::new());

    let written_number;
    {
        let mount = mount_with(&store, &dirs, &files, Some(root_tree)).await;
        let root = mount.root();
        let file = root
            .create(os("local"), 0o644, Bytes::from_static(b"local data"))
            .await
            .unwrap();
        written_number = file.number();
        mount.close();
    }

    // A fresh mount over the same overlay restores the root's entries,
    // its materialization, and the file content.
    let mount = mount_with(&store, &dirs, &files, Some(root_tree)).await;
    let root = mount.root();
    assert!(root.is_materialized());
    let mut names = root.entry_names();
    names.sort();
    assert_eq!(names, vec!["local", "tracked"]);

    let local = root.get_or_load_child(os("local")).await.unwrap();
    assert_eq!(local.number(), written_number, "inode numbers are stable");
    assert_eq!(
        &local.as_file().unwrap().read_all().await.unwrap()[..],
        b"local data"
    );

    // The tracked entry still resolves through the object store.
    let tracked = root.get_or_load_child(os("tracked")).await.unwrap();
    assert_eq!(
        &tracked.as_file().unwrap().read_all().await.unwrap()[..],
        b"from scm"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clean_mount_stays_dematerialized_across_remount() {
    let store = Arc::new(MemoryObjectStore::new());
    let root_tree = tree(&store).file("a", b"1").build();
    let dirs: Arc<dyn InodeCatalog> = Arc::new(MemoryInodeCatalog::new());
    let files: Arc<dyn InodeCatalog> = Arc::new(MemoryInodeCatalog::new());

    {
        let mount = mount_with(&store, &dirs, &files, Some(root_tree)).await;
        assert_eq!(mount.root().tree_hash(), Some(root_tree));
        mount.close();
    }

    let mount = mount_with(&store, &dirs, &files, Some(root_tree)).await;
    assert_eq!(mount.root().tree_hash(), Some(root_tree));
    assert!(!mount.root().is_materialized());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn on_disk_overlay_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let dirs: Arc<dyn InodeCatalog> =
        Arc::new(DiskInodeCatalog::open(dir.path().join("dirs")).unwrap());
    let files: Arc<dyn InodeCatalog> =
        Arc::new(DiskInodeCatalog::open(dir.path().join("files")).unwrap());

    {
        let mount = mount_with(&store, &dirs, &files, None).await;
        let root = mount.root();
        let sub = root.mkdir(os("sub"), 0o755).await.unwrap();
        sub.create(os("f"), 0o644, Bytes::from_static(b"on disk"))
            .await
            .unwrap();
        mount.close();
    }

    let mount = mount_with(&store, &dirs, &files, None).await;
    let resolved = mount
        .root()
        .get_child_recursive(std::path::Path::new("sub/f"))
        .await
        .unwrap();
    assert_eq!(
        &resolved.as_file().unwrap().read_all().await.unwrap()[..],
        b"on disk"
    );
}
