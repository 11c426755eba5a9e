//! Durable `PersistentState` record of a partition.
//!
//! File layout: `| crc32 (u32 LE) | bincode(PersistentState) |`, replaced
//! atomically through a temp file, fsync and rename.
//!
//! The store also holds an exclusive lock on `LOCK` in its directory for as
//! long as it lives, so two replicas can never open the same partition
//! directory at once.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::message::PersistentState;
use crate::traits::StorageResult;

const META_FILE: &str = "meta.bin";
const META_TMP_FILE: &str = "meta.bin.tmp";
const LOCK_FILE: &str = "LOCK";

pub struct MetaStore {
    dir: PathBuf,
    sync_on_write: bool,
    // 文件关闭时锁自动释放
    _lock: File,
}

impl MetaStore {
    pub fn new(dir: impl Into<PathBuf>, sync_on_write: bool) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| StorageError::io(format!("create meta dir {:?}", dir), e))?;
        let lock = lock_dir(&dir)?;
        Ok(Self {
            dir,
            sync_on_write,
            _lock: lock,
        })
    }

    fn path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    pub fn load(&self) -> StorageResult<Option<PersistentState>> {
        let path = self.path();
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(format!("read {:?}", path), e)),
        };
        if data.len() < 4 {
            return Err(StorageError::corruption(path.display(), "meta file truncated"));
        }
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&data[0..4]);
        let expected = u32::from_le_bytes(crc_bytes);
        let actual = crc32fast::hash(&data[4..]);
        if expected != actual {
            warn!("Meta file {:?} crc mismatch: {} != {}", path, expected, actual);
            return Err(StorageError::corruption(path.display(), "crc mismatch"));
        }
        let (state, _) = bincode::decode_from_slice(&data[4..], bincode::config::standard())?;
        Ok(Some(state))
    }

    pub fn store(&self, state: &PersistentState) -> StorageResult<()> {
        let body = bincode::encode_to_vec(state, bincode::config::standard())?;
        let mut buf = Vec::with_capacity(body.len() + 4);
        buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        buf.extend_from_slice(&body);

        let tmp_path = self.dir.join(META_TMP_FILE);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| StorageError::io(format!("create {:?}", tmp_path), e))?;
        file.write_all(&buf)
            .map_err(|e| StorageError::io(format!("write {:?}", tmp_path), e))?;
        if self.sync_on_write {
            file.sync_all()
                .map_err(|e| StorageError::io(format!("sync {:?}", tmp_path), e))?;
        }
        drop(file);

        let path = self.path();
        fs::rename(&tmp_path, &path)
            .map_err(|e| StorageError::io(format!("rename {:?}", tmp_path), e))?;
        if self.sync_on_write {
            sync_dir(&self.dir)?;
        }
        debug!(
            "Persisted state term={} voted_for={:?} commit={}",
            state.current_term, state.voted_for, state.commit_index
        );
        Ok(())
    }
}

fn lock_dir(dir: &Path) -> StorageResult<File> {
    let path = dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| StorageError::io(format!("open {:?}", path), e))?;
    if let Err(e) = file.try_lock_exclusive() {
        warn!("Directory {:?} is already locked: {}", dir, e);
        return Err(StorageError::Locked(dir.display().to_string()));
    }
    Ok(file)
}

/// Makes a rename inside `dir` durable.
pub(crate) fn sync_dir(dir: &Path) -> StorageResult<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| StorageError::io(format!("sync dir {:?}", dir), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_meta_loads_none() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::new(dir.path(), true).unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_store_then_load() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::new(dir.path(), true).unwrap();
        let state = PersistentState {
            current_term: 4,
            voted_for: Some("node-2".to_string()),
            commit_index: 17,
            last_applied: 15,
        };
        store.store(&state).unwrap();
        drop(store);

        let reopened = MetaStore::new(dir.path(), true).unwrap();
        assert_eq!(reopened.load().unwrap(), Some(state));
        assert!(!dir.path().join(META_TMP_FILE).exists());
    }

    #[test]
    fn test_corrupted_meta_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::new(dir.path(), false).unwrap();
        store.store(&PersistentState::default()).unwrap();

        let path = dir.path().join(META_FILE);
        let mut data = fs::read(&path).unwrap();
        data[0] ^= 0xff;
        fs::write(&path, data).unwrap();

        assert!(matches!(
            store.load(),
            Err(StorageError::DataCorruption { .. })
        ));
    }

    #[test]
    fn test_second_store_on_same_dir_is_locked() {
        let dir = TempDir::new().unwrap();
        let first = MetaStore::new(dir.path(), false).unwrap();
        assert!(matches!(
            MetaStore::new(dir.path(), false),
            Err(StorageError::Locked(_))
        ));

        // 其他目录不受影响
        let other = dir.path().join("other");
        assert!(MetaStore::new(&other, false).is_ok());

        drop(first);
        assert!(MetaStore::new(dir.path(), false).is_ok());
    }
}
