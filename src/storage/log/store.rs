//! Multi-segment log store with rotation and prefix deletion.
//!
//! The store only knows about contiguous indices. Terms, commit rules and
//! visibility to readers live one level up in `ReplicatedLog`.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{LogError, StorageError};
use crate::message::LogEntry;
use crate::traits::{LogResult, StorageResult};

use crate::storage::meta::sync_dir;

use super::segment::{LogSegment, parse_segment_file_name};

/// Records the id of the segment created by the latest reset. Segments with
/// a lower id belong to the replaced log.
const ANCHOR_FILE: &str = "log.anchor";
const ANCHOR_TMP_FILE: &str = "log.anchor.tmp";

/// Default maximum segment size (64MB)
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Configuration options for the segment store
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LogStoreOptions {
    /// Directory for storing segment files
    pub dir: PathBuf,
    /// Maximum segment size in bytes before rotation
    pub max_segment_size: u64,
    /// Whether `flush` issues an fsync
    pub sync_on_write: bool,
}

impl Default for LogStoreOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/log"),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            sync_on_write: true,
        }
    }
}

impl LogStoreOptions {
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn with_max_segment_size(mut self, max_segment_size: u64) -> Self {
        self.max_segment_size = max_segment_size;
        self
    }

    pub fn with_sync_on_write(mut self, sync_on_write: bool) -> Self {
        self.sync_on_write = sync_on_write;
        self
    }
}

/// Durable, index-addressed storage of log entries across segment files.
///
/// Segments are ordered by id and cover contiguous index ranges; only the last
/// one (the active segment) is written to.
pub struct LogSegmentStore {
    options: LogStoreOptions,
    segments: Vec<LogSegment>,
    next_segment_id: u64,
}

impl LogSegmentStore {
    pub fn open(options: LogStoreOptions) -> StorageResult<Self> {
        fs::create_dir_all(&options.dir)
            .map_err(|e| StorageError::io(format!("create log dir {:?}", options.dir), e))?;

        let mut segment_files: Vec<(u64, PathBuf)> = Vec::new();
        let entries = fs::read_dir(&options.dir)
            .map_err(|e| StorageError::io(format!("read log dir {:?}", options.dir), e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if let Some(id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_segment_file_name)
            {
                segment_files.push((id, path));
            }
        }
        segment_files.sort_by_key(|(id, _)| *id);

        // 上次重置之前的段一律作废，无论它们是否因崩溃残留
        if let Some(anchor_id) = read_anchor(&options.dir)? {
            for (id, path) in segment_files.iter().filter(|(id, _)| *id < anchor_id) {
                warn!(
                    "Deleting segment {} left behind by reset to segment {}",
                    id, anchor_id
                );
                fs::remove_file(path)
                    .map_err(|e| StorageError::io(format!("delete {:?}", path), e))?;
            }
            segment_files.retain(|(id, _)| *id >= anchor_id);
            // 锚点段之后可能已被压缩删除，但不会一个段都不剩
            if segment_files.is_empty() {
                return Err(StorageError::corruption(
                    options.dir.join(ANCHOR_FILE).display(),
                    format!("anchor segment {} is missing", anchor_id),
                ));
            }
        }

        let mut segments: Vec<LogSegment> = Vec::with_capacity(segment_files.len());
        for (id, path) in segment_files {
            let segment = LogSegment::open(&path)?;
            if segment.id() != id {
                return Err(StorageError::corruption(
                    path.display(),
                    format!("descriptor id {} does not match file name", segment.id()),
                ));
            }
            if let Some(prev) = segments.last() {
                if segment.base_index() != prev.next_index() {
                    // A crash during rotation, truncation or before a reset
                    // recorded its anchor can leave a later segment that no
                    // longer lines up; anything after a gap was never
                    // acknowledged as flushed.
                    if prev.next_index() < segment.base_index() || segment.is_empty() {
                        warn!(
                            "Discarding segment {:?}: base index {} does not follow {}",
                            path,
                            segment.base_index(),
                            prev.next_index()
                        );
                        segment.delete()?;
                        continue;
                    }
                    return Err(StorageError::corruption(
                        path.display(),
                        format!(
                            "base index {} overlaps previous segment ending before {}",
                            segment.base_index(),
                            prev.next_index()
                        ),
                    ));
                }
            }
            segments.push(segment);
        }

        let mut next_segment_id = segments.last().map(|s| s.id() + 1).unwrap_or(1);
        if segments.is_empty() {
            segments.push(LogSegment::create(&options.dir, next_segment_id, 1)?);
            next_segment_id += 1;
        }

        let store = Self {
            options,
            segments,
            next_segment_id,
        };
        info!(
            "Opened log store {:?}: {} segments, indices [{}, {}]",
            store.options.dir,
            store.segments.len(),
            store.first_index(),
            store.last_index()
        );
        Ok(store)
    }

    pub fn options(&self) -> &LogStoreOptions {
        &self.options
    }

    fn active(&self) -> &LogSegment {
        // open() and reset() always leave at least one segment behind
        &self.segments[self.segments.len() - 1]
    }

    fn active_mut(&mut self) -> &mut LogSegment {
        let last = self.segments.len() - 1;
        &mut self.segments[last]
    }

    pub fn first_index(&self) -> u64 {
        self.segments[0].base_index()
    }

    pub fn last_index(&self) -> u64 {
        self.active().next_index() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.last_index() < self.first_index()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn segment_for(&self, index: u64) -> Option<&LogSegment> {
        if index < self.first_index() || index > self.last_index() {
            return None;
        }
        let pos = self
            .segments
            .partition_point(|s| s.base_index() <= index)
            .checked_sub(1)?;
        self.segments.get(pos)
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.segment_for(index)?.term_at(index)
    }

    pub fn read(&self, index: u64) -> StorageResult<Option<LogEntry>> {
        match self.segment_for(index) {
            Some(segment) => segment.read(index),
            None => Ok(None),
        }
    }

    /// Reads `[from, to)`, stopping early once `max_bytes` is exceeded. At
    /// least one entry is returned when `from` is in range.
    pub fn read_range(&self, from: u64, to: u64, max_bytes: usize) -> StorageResult<Vec<LogEntry>> {
        let from = from.max(self.first_index());
        let to = to.min(self.last_index() + 1);
        let mut entries = Vec::new();
        let mut bytes = 0usize;
        for index in from..to {
            let Some(entry) = self.read(index)? else {
                break;
            };
            bytes += entry.approximate_size();
            if !entries.is_empty() && bytes > max_bytes {
                break;
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Appends at the tail, rotating to a new segment when the active one is full.
    pub fn append(&mut self, entry: &LogEntry) -> LogResult<()> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(LogError::IndexMismatch {
                expected,
                actual: entry.index,
            });
        }
        if self.active().size() >= self.options.max_segment_size && !self.active().is_empty() {
            self.rotate_segment()?;
        }
        self.active_mut().append(entry)?;
        Ok(())
    }

    fn rotate_segment(&mut self) -> StorageResult<()> {
        // Sealed segments are never flushed again.
        self.active().sync_data()?;
        let base_index = self.active().next_index();
        let segment = LogSegment::create(&self.options.dir, self.next_segment_id, base_index)?;
        info!(
            "Rotated to new segment: id={}, base index {}",
            self.next_segment_id, base_index
        );
        self.next_segment_id += 1;
        self.segments.push(segment);
        Ok(())
    }

    /// Discards every entry with index `>= index`.
    pub fn truncate_from(&mut self, index: u64) -> StorageResult<()> {
        let index = index.max(self.first_index());
        while self.segments.len() > 1 && self.active().base_index() >= index {
            if let Some(segment) = self.segments.pop() {
                debug!("Deleting segment {} during truncation", segment.id());
                segment.delete()?;
            }
        }
        self.active_mut().truncate_from(index)?;
        self.active().sync_data()
    }

    /// Deletes whole segments whose entries are all `<= index`. The active
    /// segment is always kept. Returns the number of deleted segments.
    pub fn delete_before(&mut self, index: u64) -> StorageResult<usize> {
        let mut removed = 0;
        while self.segments.len() > 1 && self.segments[0].next_index() <= index + 1 {
            let segment = self.segments.remove(0);
            info!(
                "Deleted compacted segment: id={}, entries [{}, {})",
                segment.id(),
                segment.base_index(),
                segment.next_index()
            );
            segment.delete()?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Drops every segment and starts over with an empty log whose next
    /// entry is `new_first_index`.
    ///
    /// The reset takes effect once the anchor file names the new segment.
    /// A crash before that point keeps the old log; from then on `open`
    /// discards every older segment it still finds.
    pub fn reset(&mut self, new_first_index: u64) -> StorageResult<()> {
        let segment = LogSegment::create(&self.options.dir, self.next_segment_id, new_first_index)?;
        self.next_segment_id += 1;
        write_anchor(&self.options.dir, segment.id(), self.options.sync_on_write)?;
        for old in std::mem::replace(&mut self.segments, vec![segment]) {
            old.delete()?;
        }
        info!(
            "Reset log store {:?} to first index {}",
            self.options.dir, new_first_index
        );
        Ok(())
    }

    pub fn flush(&self) -> StorageResult<()> {
        if self.options.sync_on_write {
            self.active().sync_data()?;
        }
        Ok(())
    }
}

fn read_anchor(dir: &Path) -> StorageResult<Option<u64>> {
    let path = dir.join(ANCHOR_FILE);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io(format!("read {:?}", path), e)),
    };
    text.trim()
        .parse()
        .map(Some)
        .map_err(|_| StorageError::corruption(path.display(), format!("bad anchor {:?}", text)))
}

fn write_anchor(dir: &Path, segment_id: u64, sync: bool) -> StorageResult<()> {
    let tmp_path = dir.join(ANCHOR_TMP_FILE);
    fs::write(&tmp_path, segment_id.to_string())
        .map_err(|e| StorageError::io(format!("write {:?}", tmp_path), e))?;
    if sync {
        fs::File::open(&tmp_path)
            .and_then(|f| f.sync_all())
            .map_err(|e| StorageError::io(format!("sync {:?}", tmp_path), e))?;
    }
    let path = dir.join(ANCHOR_FILE);
    fs::rename(&tmp_path, &path).map_err(|e| StorageError::io(format!("rename {:?}", tmp_path), e))?;
    if sync {
        sync_dir(dir)?;
    }
    debug!("Log anchor is now segment {}", segment_id);
    Ok(())
}
