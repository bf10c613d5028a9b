//! Kernel cache invalidation seam.
//!
//! The transport layer registers an [`InvalidationChannel`]; the core
//! calls it whenever a directory entry changes underneath the kernel.
//! Changes made *by* the kernel request currently being served must not
//! be invalidated back at it: the kernel updates its own cache for the
//! requesting operation, and a redundant invalidation can deadlock the
//! request pipeline. Handlers mark themselves with
//! [`scope_kernel_request`] and mutation paths consult
//! [`is_kernel_request`].

use std::ffi::{OsStr, OsString};
use std::future::Future;
use std::sync::Mutex;

use crate::inodes::InodeNumber;

tokio::task_local! {
    static KERNEL_REQUEST: bool;
}

/// Run `fut` with the "current task is serving a kernel request" flag
/// set.
pub async fn scope_kernel_request<F: Future>(fut: F) -> F::Output {
    KERNEL_REQUEST.scope(true, fut).await
}

/// Whether the current task is serving a kernel request.
#[must_use]
pub fn is_kernel_request() -> bool {
    KERNEL_REQUEST.try_with(|flag| *flag).unwrap_or(false)
}

/// Sink for directory-entry invalidation notices to the kernel.
pub trait InvalidationChannel: Send + Sync + 'static {
    /// Tell the kernel that `name` under directory `parent` changed.
    fn invalidate_entry(&self, parent: InodeNumber, name: &OsStr);
}

/// Recording channel for tests.
#[derive(Default)]
pub struct RecordingInvalidationChannel {
    invalidations: Mutex<Vec<(InodeNumber, OsString)>>,
}

impl RecordingInvalidationChannel {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot all recorded invalidations.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(InodeNumber, OsString)> {
        self.invalidations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl InvalidationChannel for RecordingInvalidationChannel {
    fn invalidate_entry(&self, parent: InodeNumber, name: &OsStr) {
        self.invalidations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((parent, name.to_os_string()));
    }
}
