use tokio::sync::watch;
use tracing::{debug, warn};

use crate::message::LogEntry;
use crate::storage::LogReadHandle;
use crate::traits::StorageResult;

/// Forward cursor over the committed application entries of a partition.
///
/// The view only grows: entries appear once they are committed and flushed.
/// `Initial` entries are skipped. If compaction removes the entry under the
/// cursor, the reader continues from the new first entry.
pub struct LogStorageReader {
    handle: LogReadHandle,
    /// Index of the next entry to inspect.
    next_index: u64,
    commits: watch::Receiver<u64>,
}

impl LogStorageReader {
    pub fn new(handle: LogReadHandle) -> Self {
        let next_index = handle.first_index();
        let commits = handle.subscribe();
        Self {
            handle,
            next_index,
            commits,
        }
    }

    /// Index the cursor currently points at.
    pub fn position(&self) -> u64 {
        self.next_index
    }

    fn skip_compacted(&mut self) {
        let first_index = self.handle.first_index();
        if self.next_index < first_index {
            debug!(
                "Reader at {} fell behind compaction, moving to {}",
                self.next_index, first_index
            );
            self.next_index = first_index;
        }
    }

    /// Next application entry at or after the cursor, without consuming it.
    fn peek(&mut self) -> StorageResult<Option<LogEntry>> {
        self.skip_compacted();
        loop {
            if self.next_index > self.handle.committed_index() {
                return Ok(None);
            }
            match self.handle.read(self.next_index)? {
                Some(entry) if entry.kind.is_application() => return Ok(Some(entry)),
                Some(_) => self.next_index += 1,
                None => {
                    // 读取期间被压缩
                    let first_index = self.handle.first_index();
                    if self.next_index >= first_index {
                        return Ok(None);
                    }
                    self.next_index = first_index;
                }
            }
        }
    }

    pub fn has_next(&mut self) -> bool {
        match self.peek() {
            Ok(entry) => entry.is_some(),
            Err(err) => {
                warn!("Reader failed at {}: {}", self.next_index, err);
                false
            }
        }
    }

    pub fn try_next(&mut self) -> StorageResult<Option<LogEntry>> {
        let entry = self.peek()?;
        if let Some(entry) = &entry {
            self.next_index = entry.index + 1;
        }
        Ok(entry)
    }

    /// Waits until the next committed application entry is available.
    /// Returns `None` when the log is gone.
    pub async fn wait_for_next(&mut self) -> StorageResult<Option<LogEntry>> {
        loop {
            self.commits.borrow_and_update();
            if let Some(entry) = self.try_next()? {
                return Ok(Some(entry));
            }
            if self.commits.changed().await.is_err() {
                return Ok(None);
            }
        }
    }

    /// 定位到包含 `position` 的条目
    ///
    /// Positions at the entry whose range contains `position`, otherwise at
    /// the entry with the greatest `lowest_position <= position`. When every
    /// entry starts above `position` the cursor goes to the first entry.
    /// Returns the index the cursor now points at.
    pub fn seek(&mut self, position: u64) -> StorageResult<u64> {
        let first_index = self.handle.first_index();
        let committed = self.handle.committed_index();
        self.next_index = first_index;
        if first_index > committed {
            return Ok(self.next_index);
        }

        let (mut low, mut high) = (first_index, committed);
        let mut found = None;
        while low <= high {
            let mid = low + (high - low) / 2;
            match self.application_at_or_after(mid, high)? {
                Some((index, lowest)) if lowest <= position => {
                    found = Some(index);
                    low = index + 1;
                }
                _ => {
                    if mid == 0 {
                        break;
                    }
                    high = mid - 1;
                }
            }
        }

        if let Some(index) = found {
            self.next_index = index;
        }
        Ok(self.next_index)
    }

    /// First application entry in `[from, to]` with its lowest position.
    fn application_at_or_after(&self, from: u64, to: u64) -> StorageResult<Option<(u64, u64)>> {
        for index in from..=to {
            match self.handle.read(index)? {
                Some(entry) => {
                    if let Some((lowest, _)) = entry.kind.positions() {
                        return Ok(Some((index, lowest)));
                    }
                }
                None => return Ok(None),
            }
        }
        Ok(None)
    }
}

impl Iterator for LogStorageReader {
    type Item = LogEntry;

    fn next(&mut self) -> Option<Self::Item> {
        match self.try_next() {
            Ok(entry) => entry,
            Err(err) => {
                warn!("Reader failed at {}: {}", self.next_index, err);
                None
            }
        }
    }
}
