use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::LogError;
use crate::message::{EntryKind, LogEntry};
use crate::traits::{LogResult, StorageResult};
use crate::types::now_millis;

use super::store::{LogSegmentStore, LogStoreOptions};

/// State shared between the owning `ReplicatedLog` and its read handles.
struct LogShared {
    store: RwLock<LogSegmentStore>,
    first_index: AtomicU64,
    /// Highest index written and flushed; readers never look past it.
    flushed_index: AtomicU64,
    commit_index: AtomicU64,
    commit_tx: watch::Sender<u64>,
}

/// Index-addressed replicated log of one partition.
///
/// Mutated only by the consensus actor that owns it. Other tasks observe it
/// through [`LogReadHandle`], which sees committed and flushed entries only.
pub struct ReplicatedLog {
    shared: Arc<LogShared>,
    /// Term floor taken from the persisted state; appends below it are stale.
    current_term: u64,
    first_index: u64,
    last_index: u64,
    last_term: u64,
}

impl ReplicatedLog {
    pub fn open(options: LogStoreOptions) -> LogResult<Self> {
        let store = LogSegmentStore::open(options)?;
        let first_index = store.first_index();
        let last_index = store.last_index();
        let last_term = if store.is_empty() {
            0
        } else {
            store.term_at(last_index).unwrap_or(0)
        };

        let (commit_tx, _) = watch::channel(0);
        let shared = Arc::new(LogShared {
            store: RwLock::new(store),
            first_index: AtomicU64::new(first_index),
            // Everything that survived replay is on disk already.
            flushed_index: AtomicU64::new(last_index),
            commit_index: AtomicU64::new(0),
            commit_tx,
        });

        Ok(Self {
            shared,
            current_term: last_term,
            first_index,
            last_index,
            last_term,
        })
    }

    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    pub fn last_term(&self) -> u64 {
        self.last_term
    }

    pub fn is_empty(&self) -> bool {
        self.last_index < self.first_index
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn commit_index(&self) -> u64 {
        self.shared.commit_index.load(Ordering::Acquire)
    }

    pub fn flushed_index(&self) -> u64 {
        self.shared.flushed_index.load(Ordering::Acquire)
    }

    /// Raises the term floor. Never lowers it.
    pub fn observe_term(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
        }
    }

    /// Leader append at `last_index + 1`.
    pub fn append(&mut self, term: u64, kind: EntryKind, payload: Vec<u8>) -> LogResult<u64> {
        if term < self.current_term {
            return Err(LogError::TermStale {
                term,
                current_term: self.current_term,
            });
        }
        let entry = LogEntry {
            index: self.last_index + 1,
            term,
            timestamp: now_millis(),
            kind,
            payload,
        };
        self.append_entry(entry)
    }

    /// Follower append of a replicated entry, which must be the next index.
    pub fn append_entry(&mut self, entry: LogEntry) -> LogResult<u64> {
        let expected = self.last_index + 1;
        if entry.index != expected {
            return Err(LogError::IndexMismatch {
                expected,
                actual: entry.index,
            });
        }
        if entry.term < self.last_term {
            return Err(LogError::TermRegression {
                term: entry.term,
                last_term: self.last_term,
            });
        }

        self.shared.store.write().append(&entry)?;
        self.last_index = entry.index;
        self.last_term = entry.term;
        self.observe_term(entry.term);
        Ok(entry.index)
    }

    pub fn entry_at(&self, index: u64) -> LogResult<LogEntry> {
        if index < self.first_index || index > self.last_index {
            return Err(LogError::NotFound(index));
        }
        self.shared
            .store
            .read()
            .read(index)?
            .ok_or(LogError::NotFound(index))
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.last_index && !self.is_empty() {
            return Some(self.last_term);
        }
        self.shared.store.read().term_at(index)
    }

    /// Entries in `[from, to)` capped at roughly `max_bytes`, used for replication.
    pub fn entries(&self, from: u64, to: u64, max_bytes: usize) -> LogResult<Vec<LogEntry>> {
        if from < self.first_index {
            return Err(LogError::NotFound(from));
        }
        Ok(self.shared.store.read().read_range(from, to, max_bytes)?)
    }

    /// Discards entries `>= index`. Committed entries are never discarded.
    pub fn truncate_from(&mut self, index: u64) -> LogResult<()> {
        let commit_index = self.commit_index();
        if index <= commit_index {
            return Err(LogError::TruncateCommitted {
                index,
                commit_index,
            });
        }
        if index > self.last_index {
            return Ok(());
        }

        warn!(
            "Truncating log from index {} (last index {})",
            index, self.last_index
        );
        let mut store = self.shared.store.write();
        store.truncate_from(index)?;
        self.last_index = store.last_index();
        self.last_term = if store.is_empty() {
            0
        } else {
            store.term_at(self.last_index).unwrap_or(0)
        };
        drop(store);

        self.shared
            .flushed_index
            .fetch_min(self.last_index, Ordering::AcqRel);
        Ok(())
    }

    /// Re-anchors an empty log so its next entry is `new_first_index`.
    pub fn reset_to(&mut self, new_first_index: u64) -> LogResult<()> {
        if !self.is_empty() {
            return Err(LogError::NotEmpty {
                first_index: self.first_index,
                last_index: self.last_index,
            });
        }
        self.reset_unchecked(new_first_index)?;
        Ok(())
    }

    /// Replaces the whole log with an empty one starting at `new_first_index`.
    /// Used when an installed snapshot supersedes the local log.
    pub fn reset_on_snapshot(&mut self, new_first_index: u64) -> LogResult<()> {
        self.reset_unchecked(new_first_index)?;
        // The snapshot covers everything below the new first index.
        self.set_commit_index(new_first_index - 1);
        Ok(())
    }

    fn reset_unchecked(&mut self, new_first_index: u64) -> StorageResult<()> {
        let new_first_index = new_first_index.max(1);
        self.shared.store.write().reset(new_first_index)?;
        self.first_index = new_first_index;
        self.last_index = new_first_index - 1;
        self.last_term = 0;
        self.shared
            .first_index
            .store(new_first_index, Ordering::Release);
        self.shared
            .flushed_index
            .store(self.last_index, Ordering::Release);
        info!("Log reset, first index is now {}", new_first_index);
        Ok(())
    }

    /// Deletes segments fully covered by a snapshot at `snapshot_index`.
    pub fn compact(&mut self, snapshot_index: u64) -> LogResult<usize> {
        let mut store = self.shared.store.write();
        let removed = store.delete_before(snapshot_index)?;
        if removed > 0 {
            self.first_index = store.first_index();
            self.shared
                .first_index
                .store(self.first_index, Ordering::Release);
            debug!(
                "Compacted {} segments up to snapshot index {}, first index {}",
                removed, snapshot_index, self.first_index
            );
        }
        Ok(removed)
    }

    /// Makes everything appended so far durable and visible to readers.
    pub fn flush(&mut self) -> LogResult<()> {
        if self.flushed_index() >= self.last_index {
            return Ok(());
        }
        self.shared.store.read().flush()?;
        self.shared
            .flushed_index
            .store(self.last_index, Ordering::Release);
        // Readers wait on the commit channel; a flush may extend what they see.
        self.notify_readers();
        Ok(())
    }

    /// Advances the commit index. It never moves backwards.
    pub fn set_commit_index(&mut self, index: u64) {
        let prev = self.shared.commit_index.fetch_max(index, Ordering::AcqRel);
        if index > prev {
            self.notify_readers();
        }
    }

    fn notify_readers(&self) {
        let visible = self.commit_index().min(self.flushed_index());
        self.shared.commit_tx.send_replace(visible);
    }

    pub fn read_handle(&self) -> LogReadHandle {
        LogReadHandle {
            shared: self.shared.clone(),
        }
    }
}

/// Shared, read-only view of committed entries.
#[derive(Clone)]
pub struct LogReadHandle {
    shared: Arc<LogShared>,
}

impl LogReadHandle {
    pub fn first_index(&self) -> u64 {
        self.shared.first_index.load(Ordering::Acquire)
    }

    /// Highest index a reader may consume: committed and flushed.
    pub fn committed_index(&self) -> u64 {
        let commit = self.shared.commit_index.load(Ordering::Acquire);
        let flushed = self.shared.flushed_index.load(Ordering::Acquire);
        commit.min(flushed)
    }

    /// Reads a committed entry. Returns `None` above the committed bound or
    /// below the first retained index.
    pub fn read(&self, index: u64) -> StorageResult<Option<LogEntry>> {
        if index > self.committed_index() || index < self.first_index() {
            return Ok(None);
        }
        self.shared.store.read().read(index)
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.commit_tx.subscribe()
    }
}
