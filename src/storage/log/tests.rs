//! Unit tests for the log storage module.

#[cfg(test)]
mod entry_tests {
    use crate::message::{EntryKind, LogEntry};
    use crate::storage::log::entry::*;

    fn create_test_entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            timestamp: 1_700_000_000_000 + index,
            kind: EntryKind::application(index * 10, index * 10 + 9),
            payload: format!("command_{}", index).into_bytes(),
        }
    }

    #[test]
    fn test_frame_decodes_to_same_entry() {
        let entry = create_test_entry(7, 3);
        let frame = encode_frame(&entry).unwrap();
        let header = FrameHeader::deserialize(&frame).unwrap();
        assert_eq!(header.size as usize, frame.len() - FRAME_HEADER_SIZE as usize);

        let decoded = decode_body(&header, &frame[FRAME_HEADER_SIZE as usize..]).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_frame_rejects_flipped_bit() {
        let entry = create_test_entry(1, 1);
        let mut frame = encode_frame(&entry).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        let header = FrameHeader::deserialize(&frame).unwrap();
        assert!(decode_body(&header, &frame[FRAME_HEADER_SIZE as usize..]).is_err());
    }

    #[test]
    fn test_frame_header_rejects_bad_magic() {
        let header = FrameHeader::new(10, 42).serialize();
        let mut bad = header;
        bad[0] = 0;
        assert!(FrameHeader::deserialize(&bad).is_err());
        assert!(FrameHeader::deserialize(&header[..4]).is_err());
    }

    #[test]
    fn test_segment_descriptor_checks_crc() {
        let descriptor = SegmentDescriptor::new(3, 120);
        let mut bytes = descriptor.serialize();
        assert_eq!(SegmentDescriptor::deserialize(&bytes).unwrap(), descriptor);

        bytes[16] ^= 0xff;
        assert!(SegmentDescriptor::deserialize(&bytes).is_err());
    }
}

#[cfg(test)]
mod segment_tests {
    use std::fs::OpenOptions;
    use std::io::Write;

    use tempfile::TempDir;

    use crate::message::{EntryKind, LogEntry};
    use crate::storage::log::segment::LogSegment;

    fn entry(index: u64, term: u64, payload: &[u8]) -> LogEntry {
        LogEntry {
            index,
            term,
            timestamp: index,
            kind: EntryKind::application(index, index),
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_segment_append_and_read() {
        let dir = TempDir::new().unwrap();
        let mut segment = LogSegment::create(dir.path(), 1, 5).unwrap();
        assert!(segment.is_empty());
        assert_eq!(segment.next_index(), 5);

        for i in 5..10 {
            segment.append(&entry(i, 1, b"abc")).unwrap();
        }
        assert_eq!(segment.last_index(), Some(9));
        assert_eq!(segment.read(7).unwrap().unwrap().index, 7);
        assert!(segment.read(4).unwrap().is_none());
        assert!(segment.read(10).unwrap().is_none());
    }

    #[test]
    fn test_segment_reopen_rebuilds_index() {
        let dir = TempDir::new().unwrap();
        let path = {
            let mut segment = LogSegment::create(dir.path(), 1, 1).unwrap();
            for i in 1..=4 {
                segment.append(&entry(i, i, b"payload")).unwrap();
            }
            segment.sync_data().unwrap();
            segment.file_name.clone()
        };

        let segment = LogSegment::open(&path).unwrap();
        assert_eq!(segment.entry_count(), 4);
        assert_eq!(segment.term_at(3), Some(3));
        assert_eq!(segment.read(4).unwrap().unwrap().payload, b"payload");
    }

    #[test]
    fn test_segment_open_truncates_torn_tail() {
        let dir = TempDir::new().unwrap();
        let (path, good_size) = {
            let mut segment = LogSegment::create(dir.path(), 1, 1).unwrap();
            segment.append(&entry(1, 1, b"one")).unwrap();
            segment.append(&entry(2, 1, b"two")).unwrap();
            segment.sync_data().unwrap();
            (segment.file_name.clone(), segment.size())
        };

        // Half a frame from an interrupted write.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0x78, 0x56, 0x34, 0x12, 0xff]).unwrap();
        drop(file);

        let mut segment = LogSegment::open(&path).unwrap();
        assert_eq!(segment.last_index(), Some(2));
        assert_eq!(segment.size(), good_size);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_size);

        // Writing continues right after the last good frame.
        segment.append(&entry(3, 2, b"three")).unwrap();
        assert_eq!(segment.read(3).unwrap().unwrap().payload, b"three");
    }

    #[test]
    fn test_segment_truncate_from() {
        let dir = TempDir::new().unwrap();
        let mut segment = LogSegment::create(dir.path(), 1, 1).unwrap();
        for i in 1..=5 {
            segment.append(&entry(i, 1, b"x")).unwrap();
        }
        segment.truncate_from(3).unwrap();
        assert_eq!(segment.last_index(), Some(2));
        segment.append(&entry(3, 2, b"y")).unwrap();
        assert_eq!(segment.read(3).unwrap().unwrap().term, 2);
    }
}

#[cfg(test)]
mod store_tests {
    use std::fs;
    use std::path::PathBuf;

    use tempfile::TempDir;

    use crate::error::LogError;
    use crate::message::{EntryKind, LogEntry};
    use crate::storage::log::segment::{LogSegment, parse_segment_file_name};
    use crate::storage::log::store::{LogSegmentStore, LogStoreOptions};

    fn create_test_store(dir: &TempDir) -> LogSegmentStore {
        let options = LogStoreOptions::with_dir(dir.path())
            .with_max_segment_size(512) // Small size for testing rotation
            .with_sync_on_write(false);
        LogSegmentStore::open(options).unwrap()
    }

    fn create_test_entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            timestamp: 0,
            kind: EntryKind::application(index, index),
            payload: vec![index as u8; 100], // 100 bytes per entry
        }
    }

    /// Segment files on disk, sorted by id.
    fn segment_files(dir: &TempDir) -> Vec<(u64, PathBuf)> {
        let mut files: Vec<(u64, PathBuf)> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                let id = parse_segment_file_name(path.file_name()?.to_str()?)?;
                Some((id, path))
            })
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_fresh_store_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);
        assert_eq!(store.first_index(), 1);
        assert_eq!(store.last_index(), 0);
        assert!(store.is_empty());
        assert_eq!(store.segment_count(), 1);
    }

    #[test]
    fn test_write_and_rotation() {
        let dir = TempDir::new().unwrap();
        let mut store = create_test_store(&dir);
        for i in 1..=20 {
            store.append(&create_test_entry(i, 1)).unwrap();
        }
        assert!(store.segment_count() > 1);

        let entries = store.read_range(1, 21, usize::MAX).unwrap();
        assert_eq!(entries.len(), 20);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.index, (i + 1) as u64);
        }
    }

    #[test]
    fn test_append_rejects_gap() {
        let dir = TempDir::new().unwrap();
        let mut store = create_test_store(&dir);
        store.append(&create_test_entry(1, 1)).unwrap();
        let err = store.append(&create_test_entry(3, 1)).unwrap_err();
        assert!(matches!(
            err,
            LogError::IndexMismatch {
                expected: 2,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_reopen_across_segments() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = create_test_store(&dir);
            for i in 1..=30 {
                store.append(&create_test_entry(i, i / 10 + 1)).unwrap();
            }
            store.flush().unwrap();
        }
        let store = create_test_store(&dir);
        assert_eq!(store.first_index(), 1);
        assert_eq!(store.last_index(), 30);
        assert_eq!(store.term_at(25), Some(3));
        assert_eq!(store.read(17).unwrap().unwrap().payload, vec![17u8; 100]);
    }

    #[test]
    fn test_truncate_across_segments() {
        let dir = TempDir::new().unwrap();
        let mut store = create_test_store(&dir);
        for i in 1..=30 {
            store.append(&create_test_entry(i, 1)).unwrap();
        }
        let before = store.segment_count();
        store.truncate_from(4).unwrap();
        assert_eq!(store.last_index(), 3);
        assert!(store.segment_count() < before);

        store.append(&create_test_entry(4, 2)).unwrap();
        assert_eq!(store.term_at(4), Some(2));
        drop(store);

        let store = create_test_store(&dir);
        assert_eq!(store.last_index(), 4);
    }

    #[test]
    fn test_delete_before_keeps_active_segment() {
        let dir = TempDir::new().unwrap();
        let mut store = create_test_store(&dir);
        for i in 1..=30 {
            store.append(&create_test_entry(i, 1)).unwrap();
        }
        let removed = store.delete_before(25).unwrap();
        assert!(removed > 0);
        assert!(store.first_index() > 1);
        assert!(store.first_index() <= 26);
        assert_eq!(store.last_index(), 30);

        // Even a request covering everything keeps the active segment.
        store.delete_before(1000).unwrap();
        assert_eq!(store.segment_count(), 1);
        assert_eq!(store.last_index(), 30);
    }

    #[test]
    fn test_reset_reanchors_log() {
        let dir = TempDir::new().unwrap();
        let mut store = create_test_store(&dir);
        store.reset(11).unwrap();
        assert_eq!(store.first_index(), 11);
        assert_eq!(store.last_index(), 10);
        store.append(&create_test_entry(11, 3)).unwrap();
        drop(store);

        let store = create_test_store(&dir);
        assert_eq!(store.first_index(), 11);
        assert_eq!(store.last_index(), 11);
    }

    #[test]
    fn test_reset_survives_resurrected_old_segment() {
        let dir = TempDir::new().unwrap();
        let mut store = create_test_store(&dir);
        for i in 1..=20 {
            store.append(&create_test_entry(i, 1)).unwrap();
        }
        store.flush().unwrap();
        let (_, newest) = segment_files(&dir).pop().unwrap();
        let saved = fs::read(&newest).unwrap();

        store.reset(31).unwrap();
        drop(store);
        // 删除未落盘：旧段在重启后重新出现
        fs::write(&newest, saved).unwrap();

        let store = create_test_store(&dir);
        assert_eq!(store.first_index(), 31);
        assert_eq!(store.last_index(), 30);
        assert!(store.is_empty());
        assert!(!newest.exists());
        assert_eq!(segment_files(&dir).len(), 1);
    }

    #[test]
    fn test_reset_interrupted_before_anchor_keeps_old_log() {
        let dir = TempDir::new().unwrap();
        let mut store = create_test_store(&dir);
        for i in 1..=20 {
            store.append(&create_test_entry(i, 1)).unwrap();
        }
        store.flush().unwrap();
        drop(store);
        // 新段已创建，但锚点文件尚未写入
        let next_id = segment_files(&dir).last().unwrap().0 + 1;
        LogSegment::create(dir.path(), next_id, 31).unwrap();

        let store = create_test_store(&dir);
        assert_eq!(store.first_index(), 1);
        assert_eq!(store.last_index(), 20);
        assert!(segment_files(&dir).iter().all(|(id, _)| *id < next_id));
    }

    #[test]
    fn test_reopen_after_reset_and_compaction() {
        let dir = TempDir::new().unwrap();
        let mut store = create_test_store(&dir);
        store.append(&create_test_entry(1, 1)).unwrap();
        store.reset(31).unwrap();
        for i in 31..=60 {
            store.append(&create_test_entry(i, 2)).unwrap();
        }
        // 锚点段本身被压缩删除
        assert!(store.delete_before(50).unwrap() > 0);
        let first = store.first_index();
        assert!(first > 31);
        store.flush().unwrap();
        drop(store);

        let store = create_test_store(&dir);
        assert_eq!(store.first_index(), first);
        assert_eq!(store.last_index(), 60);
    }
}

#[cfg(test)]
mod replicated_log_tests {
    use tempfile::TempDir;

    use crate::error::LogError;
    use crate::message::{EntryKind, LogEntry};
    use crate::storage::log::{LogStoreOptions, ReplicatedLog};

    fn open_log(dir: &TempDir) -> ReplicatedLog {
        ReplicatedLog::open(
            LogStoreOptions::with_dir(dir.path())
                .with_max_segment_size(1024)
                .with_sync_on_write(false),
        )
        .unwrap()
    }

    fn app(n: u64) -> EntryKind {
        EntryKind::application(n, n)
    }

    #[test]
    fn test_append_read_round_trip_is_byte_exact() {
        let dir = TempDir::new().unwrap();
        let payloads: Vec<Vec<u8>> = (0..50u8)
            .map(|i| (0..(i as usize * 7)).map(|b| (b as u8).wrapping_mul(i)).collect())
            .collect();
        {
            let mut log = open_log(&dir);
            for (i, payload) in payloads.iter().enumerate() {
                let index = log.append(1, app(i as u64), payload.clone()).unwrap();
                assert_eq!(index, i as u64 + 1);
            }
            log.flush().unwrap();
            for (i, payload) in payloads.iter().enumerate() {
                assert_eq!(&log.entry_at(i as u64 + 1).unwrap().payload, payload);
            }
        }

        let log = open_log(&dir);
        assert_eq!(log.last_index(), 50);
        assert_eq!(log.last_term(), 1);
        for (i, payload) in payloads.iter().enumerate() {
            assert_eq!(&log.entry_at(i as u64 + 1).unwrap().payload, payload);
        }
    }

    #[test]
    fn test_append_with_stale_term_fails() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&dir);
        log.observe_term(5);
        let err = log.append(4, app(1), vec![]).unwrap_err();
        assert!(matches!(
            err,
            LogError::TermStale {
                term: 4,
                current_term: 5
            }
        ));
        assert!(log.is_empty());
        assert_eq!(log.append(5, app(1), vec![]).unwrap(), 1);
    }

    #[test]
    fn test_append_entry_requires_next_index_and_term_order() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&dir);
        let entry = |index, term| LogEntry {
            index,
            term,
            timestamp: 0,
            kind: EntryKind::Initial,
            payload: vec![],
        };
        log.append_entry(entry(1, 2)).unwrap();
        assert!(matches!(
            log.append_entry(entry(3, 2)),
            Err(LogError::IndexMismatch { .. })
        ));
        assert!(matches!(
            log.append_entry(entry(2, 1)),
            Err(LogError::TermRegression { .. })
        ));
    }

    #[test]
    fn test_entry_at_out_of_range() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&dir);
        log.append(1, app(1), vec![1]).unwrap();
        assert!(matches!(log.entry_at(0), Err(LogError::NotFound(0))));
        assert!(matches!(log.entry_at(2), Err(LogError::NotFound(2))));
        assert_eq!(log.term_at(1), Some(1));
        assert_eq!(log.term_at(2), None);
    }

    #[test]
    fn test_truncate_never_crosses_commit_index() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&dir);
        for i in 1..=5 {
            log.append(1, app(i), vec![]).unwrap();
        }
        log.flush().unwrap();
        log.set_commit_index(3);

        assert!(matches!(
            log.truncate_from(3),
            Err(LogError::TruncateCommitted {
                index: 3,
                commit_index: 3
            })
        ));
        log.truncate_from(4).unwrap();
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.flushed_index(), 3);
    }

    #[test]
    fn test_reset_to_only_on_empty_log() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&dir);
        log.reset_to(11).unwrap();
        assert_eq!(log.first_index(), 11);
        assert_eq!(log.last_index(), 10);
        assert!(log.is_empty());

        log.append(1, app(1), vec![]).unwrap();
        assert!(matches!(log.reset_to(20), Err(LogError::NotEmpty { .. })));
        assert_eq!(log.last_index(), 11);
    }

    #[test]
    fn test_reset_on_snapshot_discards_log() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&dir);
        for i in 1..=5 {
            log.append(1, app(i), vec![]).unwrap();
        }
        log.reset_on_snapshot(21).unwrap();
        assert!(log.is_empty());
        assert_eq!(log.first_index(), 21);
        assert_eq!(log.commit_index(), 20);
    }

    #[test]
    fn test_compact_advances_first_index() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&dir);
        for i in 1..=40 {
            log.append(1, app(i), vec![0u8; 64]).unwrap();
        }
        log.flush().unwrap();
        let removed = log.compact(30).unwrap();
        assert!(removed > 0);
        assert!(log.first_index() > 1 && log.first_index() <= 31);
        assert_eq!(log.last_index(), 40);
        assert!(log.entry_at(log.first_index()).is_ok());
    }

    #[test]
    fn test_read_handle_sees_only_committed_and_flushed() {
        let dir = TempDir::new().unwrap();
        let mut log = open_log(&dir);
        let handle = log.read_handle();
        for i in 1..=3 {
            log.append(1, app(i), vec![]).unwrap();
        }
        log.set_commit_index(3);
        // Committed but not yet flushed.
        assert_eq!(handle.committed_index(), 0);
        assert!(handle.read(1).unwrap().is_none());

        log.flush().unwrap();
        assert_eq!(handle.committed_index(), 3);
        assert_eq!(handle.read(2).unwrap().unwrap().index, 2);
        assert_eq!(*handle.subscribe().borrow(), 3);
    }
}
