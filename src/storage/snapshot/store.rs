//! File-based snapshot storage for one partition.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::error::{SnapshotError, StorageError};
use crate::storage::meta::sync_dir;
use crate::traits::SnapshotResult;

const DATA_FILE: &str = "data.bin";
const META_FILE: &str = "meta.json";
const PENDING_DIR: &str = "pending";
const TMP_PREFIX: &str = ".tmp-";

/// Snapshot storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotStoreOptions {
    /// Directory holding this partition's snapshots.
    pub dir: PathBuf,
    /// Whether to verify checksums when loading snapshots.
    pub verify_checksum: bool,
    /// Whether to sync data to disk after writes.
    pub sync_on_write: bool,
}

impl Default for SnapshotStoreOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/snapshots"),
            verify_checksum: true,
            sync_on_write: true,
        }
    }
}

impl SnapshotStoreOptions {
    pub fn with_dir<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }
}

/// Snapshot metadata stored next to the data for quick access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Last included index.
    pub index: u64,
    /// Last included term.
    pub term: u64,
    /// SHA256 checksum of the data file.
    pub checksum: String,
    /// Size of the data file in bytes.
    pub size: u64,
    /// Creation time, milliseconds since the epoch.
    pub created_at: u64,
}

impl SnapshotMeta {
    fn dir_name(&self) -> String {
        snapshot_dir_name(self.index, self.term)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

fn snapshot_dir_name(index: u64, term: u64) -> String {
    format!("{}-{}", index, term)
}

fn parse_snapshot_dir_name(name: &str) -> Option<(u64, u64)> {
    let (index, term) = name.split_once('-')?;
    Some((index.parse().ok()?, term.parse().ok()?))
}

/// Calculate SHA256 checksum of data.
pub(crate) fn calculate_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Persistent snapshots of one partition.
///
/// Layout:
///
/// ```text
/// {dir}/
///   {index}-{term}/           complete snapshot (data.bin + meta.json)
///   .tmp-{index}-{term}/      snapshot being taken locally
///   pending/{index}-{term}/   snapshot being received from a leader
/// ```
///
/// At most one complete snapshot is kept; older ones are removed right after
/// a newer one has been renamed into place.
pub struct FileSnapshotStore {
    options: SnapshotStoreOptions,
    latest: Option<SnapshotMeta>,
}

impl FileSnapshotStore {
    pub fn open(options: SnapshotStoreOptions) -> SnapshotResult<Self> {
        fs::create_dir_all(&options.dir)
            .map_err(|e| StorageError::io(format!("create snapshot dir {:?}", options.dir), e))?;

        let mut store = Self {
            options,
            latest: None,
        };
        let snapshots = store.list()?;
        store.latest = snapshots.last().cloned();
        // Anything older than the newest complete snapshot is left over from a
        // crash between rename and cleanup.
        if let Some(latest) = store.latest.clone() {
            store.delete_older_than(latest.index)?;
        }
        info!(
            "Opened snapshot store {:?}, latest snapshot: {:?}",
            store.options.dir,
            store.latest.as_ref().map(|m| (m.index, m.term))
        );
        Ok(store)
    }

    pub fn latest(&self) -> Option<&SnapshotMeta> {
        self.latest.as_ref()
    }

    /// Index of the latest snapshot, `0` when there is none.
    pub fn latest_index(&self) -> u64 {
        self.latest.as_ref().map(|m| m.index).unwrap_or(0)
    }

    pub fn latest_term(&self) -> u64 {
        self.latest.as_ref().map(|m| m.term).unwrap_or(0)
    }

    /// All complete snapshots on disk, ordered by index.
    pub fn list(&self) -> SnapshotResult<Vec<SnapshotMeta>> {
        let mut result = Vec::new();
        let entries = fs::read_dir(&self.options.dir)
            .map_err(|e| StorageError::io(format!("read dir {:?}", self.options.dir), e))?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if parse_snapshot_dir_name(&name).is_none() {
                continue;
            }
            match self.read_meta(&entry.path()) {
                Ok(meta) => result.push(meta),
                Err(e) => {
                    // A directory without readable metadata was never completed.
                    warn!("Ignoring incomplete snapshot {:?}: {}", entry.path(), e);
                }
            }
        }
        result.sort_by_key(|m| (m.index, m.term));
        Ok(result)
    }

    fn read_meta(&self, dir: &Path) -> SnapshotResult<SnapshotMeta> {
        let meta_path = dir.join(META_FILE);
        let content = fs::read_to_string(&meta_path)
            .map_err(|e| StorageError::io(format!("read {:?}", meta_path), e))?;
        serde_json::from_str(&content)
            .map_err(|e| SnapshotError::DataCorrupted(format!("{:?}: {}", meta_path, e)))
    }

    fn snapshot_dir(&self, meta: &SnapshotMeta) -> PathBuf {
        self.options.dir.join(meta.dir_name())
    }

    fn pending_root(&self) -> PathBuf {
        self.options.dir.join(PENDING_DIR)
    }

    /// Loads the data of a snapshot, verifying its checksum when configured.
    pub fn load(&self, meta: &SnapshotMeta) -> SnapshotResult<Snapshot> {
        let data_path = self.snapshot_dir(meta).join(DATA_FILE);
        let data = fs::read(&data_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SnapshotError::NotFound(meta.index)
            } else {
                StorageError::io(format!("read {:?}", data_path), e).into()
            }
        })?;

        if self.options.verify_checksum && calculate_checksum(&data) != meta.checksum {
            error!("Snapshot checksum verification failed for {:?}", data_path);
            return Err(SnapshotError::DataCorrupted(format!(
                "checksum mismatch in {:?}",
                data_path
            )));
        }

        debug!("Snapshot loaded: index={}, term={}", meta.index, meta.term);
        Ok(Snapshot {
            meta: meta.clone(),
            data,
        })
    }

    /// Reads up to `len` bytes of snapshot data starting at `offset`.
    pub fn read_chunk(&self, meta: &SnapshotMeta, offset: u64, len: usize) -> SnapshotResult<Vec<u8>> {
        let data_path = self.snapshot_dir(meta).join(DATA_FILE);
        let file = File::open(&data_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SnapshotError::NotFound(meta.index)
            } else {
                StorageError::io(format!("open {:?}", data_path), e).into()
            }
        })?;
        let remaining = meta.size.saturating_sub(offset) as usize;
        let mut buf = vec![0u8; remaining.min(len)];
        file.read_exact_at(&mut buf, offset)
            .map_err(|e| StorageError::io(format!("read {:?}", data_path), e))?;
        Ok(buf)
    }

    /// Writes a snapshot atomically: temp dir, fsync, rename, then removal of
    /// older snapshots. A crash at any point leaves the previous snapshot usable.
    pub fn take_snapshot(&mut self, index: u64, term: u64, data: &[u8]) -> SnapshotResult<SnapshotMeta> {
        let current = self.latest_index();
        if index <= current {
            return Err(SnapshotError::TooOld { index, current });
        }

        let meta = SnapshotMeta {
            index,
            term,
            checksum: calculate_checksum(data),
            size: data.len() as u64,
            created_at: crate::types::now_millis(),
        };

        let tmp_dir = self
            .options
            .dir
            .join(format!("{}{}", TMP_PREFIX, meta.dir_name()));
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)
                .map_err(|e| StorageError::io(format!("remove {:?}", tmp_dir), e))?;
        }
        fs::create_dir_all(&tmp_dir)
            .map_err(|e| StorageError::io(format!("create {:?}", tmp_dir), e))?;

        let mut data_file = create_file(&tmp_dir.join(DATA_FILE))?;
        data_file
            .write_all(data)
            .map_err(|e| StorageError::io("write snapshot data", e))?;
        if self.options.sync_on_write {
            data_file
                .sync_all()
                .map_err(|e| StorageError::io("sync snapshot data", e))?;
        }
        drop(data_file);

        self.commit_dir(&tmp_dir, meta)
    }

    /// Writes meta.json into `src_dir` and renames it to its final place.
    fn commit_dir(&mut self, src_dir: &Path, meta: SnapshotMeta) -> SnapshotResult<SnapshotMeta> {
        let meta_json = serde_json::to_string_pretty(&meta)
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        let mut meta_file = create_file(&src_dir.join(META_FILE))?;
        meta_file
            .write_all(meta_json.as_bytes())
            .map_err(|e| StorageError::io("write snapshot meta", e))?;
        if self.options.sync_on_write {
            meta_file
                .sync_all()
                .map_err(|e| StorageError::io("sync snapshot meta", e))?;
        }
        drop(meta_file);

        let final_dir = self.snapshot_dir(&meta);
        if final_dir.exists() {
            return Err(SnapshotError::AlreadyExists {
                index: meta.index,
                term: meta.term,
            });
        }
        fs::rename(src_dir, &final_dir)
            .map_err(|e| StorageError::io(format!("rename {:?}", src_dir), e))?;
        if self.options.sync_on_write {
            sync_dir(&self.options.dir)?;
        }

        info!(
            "Snapshot committed: index={}, term={}, size={}",
            meta.index, meta.term, meta.size
        );
        self.latest = Some(meta.clone());
        self.delete_older_than(meta.index)?;
        Ok(meta)
    }

    fn delete_older_than(&self, index: u64) -> SnapshotResult<()> {
        for meta in self.list()? {
            if meta.index < index {
                let dir = self.snapshot_dir(&meta);
                fs::remove_dir_all(&dir)
                    .map_err(|e| StorageError::io(format!("remove {:?}", dir), e))?;
                debug!("Deleted old snapshot {:?}", dir);
            }
        }
        Ok(())
    }

    /// Starts receiving a snapshot from a leader. Any pending snapshot with
    /// the same id is discarded first.
    pub fn begin_received(&self, index: u64, term: u64) -> SnapshotResult<ReceivedSnapshot> {
        let current = self.latest_index();
        if index <= current {
            return Err(SnapshotError::TooOld { index, current });
        }
        let dir = self.pending_root().join(snapshot_dir_name(index, term));
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| StorageError::io(format!("remove {:?}", dir), e))?;
        }
        fs::create_dir_all(&dir).map_err(|e| StorageError::io(format!("create {:?}", dir), e))?;
        let file = create_file(&dir.join(DATA_FILE))?;
        debug!("Receiving snapshot {}-{} into {:?}", index, term, dir);
        Ok(ReceivedSnapshot {
            index,
            term,
            dir,
            file,
            hasher: Sha256::new(),
            written: 0,
        })
    }

    /// Verifies a fully received snapshot and makes it the current one.
    pub fn persist_received(&mut self, received: ReceivedSnapshot) -> SnapshotResult<SnapshotMeta> {
        let ReceivedSnapshot {
            index,
            term,
            dir,
            file,
            hasher,
            written,
        } = received;

        let current = self.latest_index();
        if index <= current {
            let _ = fs::remove_dir_all(&dir);
            return Err(SnapshotError::TooOld { index, current });
        }
        if self.options.sync_on_write {
            file.sync_all()
                .map_err(|e| StorageError::io("sync received snapshot", e))?;
        }
        drop(file);

        let checksum = format!("{:x}", hasher.finalize());
        if self.options.verify_checksum {
            let on_disk = fs::read(dir.join(DATA_FILE))
                .map_err(|e| StorageError::io("read received snapshot", e))?;
            if on_disk.len() as u64 != written || calculate_checksum(&on_disk) != checksum {
                let _ = fs::remove_dir_all(&dir);
                return Err(SnapshotError::DataCorrupted(format!(
                    "received snapshot {}-{} does not match streamed data",
                    index, term
                )));
            }
        }

        let meta = SnapshotMeta {
            index,
            term,
            checksum,
            size: written,
            created_at: crate::types::now_millis(),
        };
        self.commit_dir(&dir, meta)
    }

    /// Removes orphaned pending and temporary snapshots left by a crash.
    pub fn purge_pending(&self) -> SnapshotResult<usize> {
        let mut purged = 0;
        let pending = self.pending_root();
        if pending.exists() {
            if let Ok(entries) = fs::read_dir(&pending) {
                purged += entries.count();
            }
            fs::remove_dir_all(&pending)
                .map_err(|e| StorageError::io(format!("remove {:?}", pending), e))?;
        }
        let entries = fs::read_dir(&self.options.dir)
            .map_err(|e| StorageError::io(format!("read dir {:?}", self.options.dir), e))?;
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with(TMP_PREFIX) {
                fs::remove_dir_all(entry.path())
                    .map_err(|e| StorageError::io(format!("remove {:?}", entry.path()), e))?;
                purged += 1;
            }
        }
        if purged > 0 {
            info!("Purged {} orphaned snapshots in {:?}", purged, self.options.dir);
        }
        Ok(purged)
    }
}

fn create_file(path: &Path) -> SnapshotResult<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| StorageError::io(format!("create {:?}", path), e).into())
}

/// A snapshot being streamed in chunks from the leader.
pub struct ReceivedSnapshot {
    index: u64,
    term: u64,
    dir: PathBuf,
    file: File,
    hasher: Sha256,
    written: u64,
}

impl std::fmt::Debug for ReceivedSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedSnapshot")
            .field("index", &self.index)
            .field("term", &self.term)
            .field("written", &self.written)
            .finish()
    }
}

impl ReceivedSnapshot {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    /// Offset the next chunk must start at.
    pub fn next_offset(&self) -> u64 {
        self.written
    }

    /// Appends a chunk. Chunks must arrive contiguously.
    pub fn write_chunk(&mut self, offset: u64, chunk: &[u8]) -> SnapshotResult<()> {
        if offset != self.written {
            return Err(SnapshotError::ChunkOutOfOrder {
                expected: self.written,
                actual: offset,
            });
        }
        self.file
            .write_all(chunk)
            .map_err(|e| StorageError::io("write snapshot chunk", e))?;
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Drops the pending snapshot and its directory.
    pub fn abort(self) {
        let dir = self.dir.clone();
        drop(self);
        if let Err(e) = fs::remove_dir_all(&dir) {
            warn!("Failed to remove aborted snapshot {:?}: {}", dir, e);
        } else {
            debug!("Aborted pending snapshot {:?}", dir);
        }
    }
}
