//! Write-behind buffering for the inode catalog.
//!
//! Directory saves are frequent and bursty: a single checkout touches a
//! parent directory once per child. The buffered catalog absorbs those
//! bursts in memory and lets a single worker thread drain them to the
//! underlying store, while reads stay consistent with every write that
//! has been accepted but not yet applied.

use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::inodes::InodeNumber;

use super::catalog::InodeCatalog;

/// Default in-memory budget for buffered writes (bytes).
pub const DEFAULT_BUFFER_BUDGET: usize = 64 * 1024 * 1024;

/// The buffered operation most recently accepted for an inode.
///
/// Only the newest operation per inode matters for reads: a later save or
/// remove completely supersedes an earlier one.
#[derive(Clone)]
enum BufferedOp {
    /// A pending save. The payload is kept here precisely so reads can
    /// return it before the worker has applied it.
    Write(Bytes),
    /// A pending removal.
    Remove,
}

enum WorkItem {
    Save(InodeNumber, Bytes),
    Remove(InodeNumber),
    Flush(std::sync::mpsc::Sender<()>),
    Stop,
}

impl WorkItem {
    fn cost(&self) -> usize {
        match self {
            Self::Save(_, data) => data.len(),
            Self::Remove(_) | Self::Flush(_) | Self::Stop => 0,
        }
    }
}

#[derive(Default)]
struct QueueState {
    work: Vec<WorkItem>,
    /// Newest accepted-but-not-yet-claimed operation per inode.
    waiting: FxHashMap<InodeNumber, BufferedOp>,
    /// Operations the worker has claimed but not finished applying.
    inflight: FxHashMap<InodeNumber, BufferedOp>,
    total_bytes: usize,
    stop_requested: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    /// Signalled when work becomes available.
    work_available: Condvar,
    /// Signalled when the buffer drains below the budget.
    not_full: Condvar,
}

/// Write-behind wrapper around an [`InodeCatalog`].
///
/// Writes are acknowledged as soon as they are queued; `load`, `has`, and
/// `load_and_remove` consult the queued and in-flight operations first so
/// callers always observe their own writes. Enqueueing blocks while the
/// buffered payload bytes exceed the budget, providing backpressure
/// against runaway mutation storms.
pub struct BufferedInodeCatalog {
    inner: Arc<dyn InodeCatalog>,
    shared: Arc<Shared>,
    budget: usize,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedInodeCatalog {
    /// Wrap `inner`, spawning the worker thread.
    #[must_use]
    pub fn new(inner: Arc<dyn InodeCatalog>, budget: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            work_available: Condvar::new(),
            not_full: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name("overlay-buffer".into())
            .spawn(move || worker_loop(&worker_shared, worker_inner.as_ref(), budget))
            .expect("spawning overlay buffer worker");

        Self {
            inner,
            shared,
            budget,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue a save for `number`.
    pub fn save(&self, number: InodeNumber, data: Bytes) {
        self.process(WorkItem::Save(number, data.clone()), number, BufferedOp::Write(data));
    }

    /// Queue a removal for `number`.
    pub fn remove(&self, number: InodeNumber) {
        self.process(WorkItem::Remove(number), number, BufferedOp::Remove);
    }

    fn process(&self, item: WorkItem, number: InodeNumber, op: BufferedOp) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while state.total_bytes >= self.budget && !state.stop_requested {
            state = self
                .shared
                .not_full
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        if state.stop_requested {
            // Shutdown already began; late writes are dropped rather than
            // racing the worker join.
            tracing::warn!(%number, "dropping overlay write queued after shutdown");
            return;
        }
        let cost = item.cost();
        state.work.push(item);
        state.waiting.insert(number, op);
        state.total_bytes += cost;
        drop(state);
        self.shared.work_available.notify_one();
    }

    /// Read the newest record for `number`, observing queued writes.
    pub fn load(&self, number: InodeNumber) -> io::Result<Option<Bytes>> {
        if let Some(buffered) = self.buffered_op(number) {
            return Ok(match buffered {
                BufferedOp::Write(data) => Some(data),
                BufferedOp::Remove => None,
            });
        }
        self.inner.load(number)
    }

    /// Whether a record exists for `number`, observing queued writes.
    pub fn has(&self, number: InodeNumber) -> io::Result<bool> {
        if let Some(buffered) = self.buffered_op(number) {
            return Ok(matches!(buffered, BufferedOp::Write(_)));
        }
        self.inner.has(number)
    }

    /// Read and delete the newest record for `number`.
    ///
    /// When the newest state lives in the buffer, the payload is returned
    /// from there and a removal is queued so the underlying catalog
    /// eventually agrees.
    pub fn load_and_remove(&self, number: InodeNumber) -> io::Result<Option<Bytes>> {
        if let Some(buffered) = self.buffered_op(number) {
            return Ok(match buffered {
                BufferedOp::Write(data) => {
                    self.remove(number);
                    Some(data)
                }
                BufferedOp::Remove => None,
            });
        }
        self.inner.load_and_remove(number)
    }

    fn buffered_op(&self, number: InodeNumber) -> Option<BufferedOp> {
        let state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state
            .waiting
            .get(&number)
            .or_else(|| state.inflight.get(&number))
            .cloned()
    }

    /// Block until every operation queued before this call has been
    /// applied to the underlying catalog.
    pub fn flush(&self) {
        let (tx, rx) = std::sync::mpsc::channel();
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if state.stop_requested {
                return;
            }
            state.work.push(WorkItem::Flush(tx));
        }
        self.shared.work_available.notify_one();
        let _ = rx.recv();
    }

    /// Stop the worker, draining every queued operation first.
    ///
    /// Idempotent; also runs on drop.
    pub fn close(&self) {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if state.stop_requested {
                return;
            }
            state.stop_requested = true;
            // Queue the sentinel directly, bypassing the budget: shutdown
            // must not block behind a full buffer.
            state.work.push(WorkItem::Stop);
        }
        self.shared.work_available.notify_one();
        self.shared.not_full.notify_all();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for BufferedInodeCatalog {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop(shared: &Shared, inner: &dyn InodeCatalog, budget: usize) {
    loop {
        let batch = {
            let mut state = shared
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state.inflight.clear();
            while state.work.is_empty() {
                state = shared
                    .work_available
                    .wait(state)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
            // The stop sentinel rides the queue like any other item so
            // every operation accepted before shutdown is applied first.
            let batch = std::mem::take(&mut state.work);
            state.inflight = std::mem::take(&mut state.waiting);
            let was_full = state.total_bytes >= budget;
            state.total_bytes = 0;
            if was_full {
                shared.not_full.notify_all();
            }
            batch
        };

        for item in batch {
            match item {
                WorkItem::Save(number, data) => {
                    if let Err(err) = inner.save(number, data) {
                        tracing::error!(%number, %err, "buffered overlay save failed");
                    }
                }
                WorkItem::Remove(number) => {
                    if let Err(err) = inner.remove(number) {
                        tracing::error!(%number, %err, "buffered overlay remove failed");
                    }
                }
                WorkItem::Flush(tx) => {
                    let _ = tx.send(());
                }
                WorkItem::Stop => return,
            }
        }
    }
}
