//! Append-only journal of tree changes.
//!
//! Every structural mutation emits one delta after the relevant inode
//! locks are released. Deltas carry monotonically increasing sequence
//! numbers so subscribers can detect gaps after truncation.

use std::path::PathBuf;
use std::sync::Mutex;

/// A single recorded change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalDelta {
    /// A file or directory was created.
    Created(PathBuf),
    /// A file or directory was removed.
    Removed(PathBuf),
    /// A file's content or metadata changed.
    Modified(PathBuf),
    /// An entry moved to a previously empty destination.
    Renamed {
        /// Source path.
        from: PathBuf,
        /// Destination path.
        to: PathBuf,
    },
    /// An entry moved over an existing destination, replacing it.
    Replaced {
        /// Source path.
        from: PathBuf,
        /// Destination path.
        to: PathBuf,
    },
}

struct JournalState {
    next_seq: u64,
    deltas: Vec<(u64, JournalDelta)>,
}

/// Thread-safe, append-only change log.
///
/// Never held across inode locks: callers append after releasing their
/// content locks (the rename lock may still be held, which is what keeps
/// rename and remove deltas correctly ordered).
pub struct Journal {
    state: Mutex<JournalState>,
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

impl Journal {
    /// Create an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(JournalState {
                next_seq: 1,
                deltas: Vec::new(),
            }),
        }
    }

    /// Append a delta, returning its sequence number.
    pub fn add_delta(&self, delta: JournalDelta) -> u64 {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let seq = state.next_seq;
        state.next_seq += 1;
        tracing::trace!(seq, ?delta, "journal delta");
        state.deltas.push((seq, delta));
        seq
    }

    /// The sequence number of the most recent delta, if any.
    #[must_use]
    pub fn latest_seq(&self) -> Option<u64> {
        let state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.deltas.last().map(|(seq, _)| *seq)
    }

    /// Snapshot all deltas with sequence numbers strictly greater than
    /// `after`.
    #[must_use]
    pub fn deltas_since(&self, after: u64) -> Vec<(u64, JournalDelta)> {
        let state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state
            .deltas
            .iter()
            .filter(|(seq, _)| *seq > after)
            .cloned()
            .collect()
    }

    /// Snapshot every recorded delta.
    #[must_use]
    pub fn snapshot(&self) -> Vec<JournalDelta> {
        let state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.deltas.iter().map(|(_, d)| d.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_are_monotonic() {
        let journal = Journal::new();
        let a = journal.add_delta(JournalDelta::Created(PathBuf::from("a")));
        let b = journal.add_delta(JournalDelta::Removed(PathBuf::from("a")));
        assert!(b > a);
        assert_eq!(journal.latest_seq(), Some(b));
    }

    #[test]
    fn deltas_since_filters() {
        let journal = Journal::new();
        let a = journal.add_delta(JournalDelta::Created(PathBuf::from("a")));
        journal.add_delta(JournalDelta::Renamed {
            from: PathBuf::from("a"),
            to: PathBuf::from("b"),
        });
        let tail = journal.deltas_since(a);
        assert_eq!(tail.len(), 1);
        assert!(matches!(tail[0].1, JournalDelta::Renamed { .. }));
    }
}
