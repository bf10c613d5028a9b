#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt as _;
use std::sync::Arc;

use scmfs::fuse::RecordingInvalidationChannel;
use scmfs::{
    Hash, MemoryObjectStore, Mount, ObjectStore, Overlay, Tree, TreeEntry, TreeEntryType,
};

/// Builder for content-addressed source-control trees.
///
/// The tree hash is derived from the (sorted) entry list, so building the
/// same entries twice yields the same hash. Checkout round-trip tests
/// rely on that identity.
pub struct TreeBuilder<'a> {
    store: &'a MemoryObjectStore,
    entries: Vec<TreeEntry>,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(store: &'a MemoryObjectStore) -> Self {
        Self {
            store,
            entries: Vec::new(),
        }
    }

    pub fn file(mut self, name: &str, content: &[u8]) -> Self {
        let hash = self.store.put_blob(content.to_vec());
        self.entries
            .push(TreeEntry::new(name, TreeEntryType::Blob, hash));
        self
    }

    pub fn executable(mut self, name: &str, content: &[u8]) -> Self {
        let hash = self.store.put_blob(content.to_vec());
        self.entries
            .push(TreeEntry::new(name, TreeEntryType::Executable, hash));
        self
    }

    pub fn symlink(mut self, name: &str, target: &str) -> Self {
        let hash = self.store.put_blob(target.as_bytes().to_vec());
        self.entries
            .push(TreeEntry::new(name, TreeEntryType::Symlink, hash));
        self
    }

    pub fn dir(mut self, name: &str, subtree: Hash) -> Self {
        self.entries
            .push(TreeEntry::new(name, TreeEntryType::Tree, subtree));
        self
    }

    pub fn build(mut self) -> Hash {
        self.entries
            .sort_by(|a, b| a.name().as_bytes().cmp(b.name().as_bytes()));
        let mut digest_input = Vec::new();
        for entry in &self.entries {
            digest_input.extend_from_slice(entry.name().as_bytes());
            digest_input.push(0);
            digest_input.push(match entry.ttype() {
                TreeEntryType::Blob => b'b',
                TreeEntryType::Executable => b'x',
                TreeEntryType::Symlink => b'l',
                TreeEntryType::Tree => b't',
            });
            digest_input.extend_from_slice(entry.hash().as_bytes());
        }
        let hash = Hash::digest(&digest_input);
        self.store.put_tree(Tree::new(hash, self.entries))
    }
}

pub fn tree(store: &MemoryObjectStore) -> TreeBuilder<'_> {
    TreeBuilder::new(store)
}

/// Install a tracing subscriber honoring `RUST_LOG`, once per test
/// binary. Later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A mount over an in-memory store and overlay, with a recording
/// invalidation channel.
pub struct TestMount {
    pub mount: Mount,
    pub store: Arc<MemoryObjectStore>,
    pub channel: Arc<RecordingInvalidationChannel>,
}

impl TestMount {
    pub async fn new(store: Arc<MemoryObjectStore>, initial_tree: Option<Hash>) -> Self {
        init_tracing();
        let channel = Arc::new(RecordingInvalidationChannel::new());
        let mount = Mount::new(
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            Overlay::memory(),
            Some(Arc::clone(&channel) as _),
            initial_tree,
        )
        .await
        .expect("mounting in-memory state");
        Self {
            mount,
            store,
            channel,
        }
    }

    pub async fn empty() -> Self {
        Self::new(Arc::new(MemoryObjectStore::new()), None).await
    }
}

pub fn os(name: &str) -> &OsStr {
    OsStr::new(name)
}
