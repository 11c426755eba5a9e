use std::{
    fs::{self, File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use anyhow::anyhow;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::message::LogEntry;
use crate::traits::StorageResult;

use super::entry::{
    EntryMeta, FRAME_HEADER_SIZE, FrameHeader, SEGMENT_DESCRIPTOR_SIZE, SegmentDescriptor,
    decode_body, encode_frame,
};

pub fn segment_file_name(segment_id: u64) -> String {
    format!("segment-{:020}.log", segment_id)
}

/// Parses `segment-{id}.log`, returning the id.
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    name.strip_prefix("segment-")?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

/// One append-only segment file holding a contiguous run of entries.
pub struct LogSegment {
    pub(crate) file_name: PathBuf,
    pub(crate) file: File,
    pub(crate) descriptor: SegmentDescriptor,
    /// entries[i] holds the entry with index `base_index + i`.
    pub(crate) entries: Vec<EntryMeta>,
    /// Current write offset.
    pub(crate) size: u64,
}

impl LogSegment {
    pub fn create(dir: &Path, segment_id: u64, base_index: u64) -> StorageResult<Self> {
        let file_name = dir.join(segment_file_name(segment_id));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&file_name)
            .map_err(|e| StorageError::io(format!("create segment {:?}", file_name), e))?;

        let descriptor = SegmentDescriptor::new(segment_id, base_index);
        file.write_all_at(&descriptor.serialize(), 0)
            .map_err(|e| StorageError::io(format!("write descriptor {:?}", file_name), e))?;
        file.sync_all()
            .map_err(|e| StorageError::io(format!("sync segment {:?}", file_name), e))?;

        debug!(
            "Created log segment {:?} (id {}, base index {})",
            file_name, segment_id, base_index
        );

        Ok(Self {
            file_name,
            file,
            descriptor,
            entries: Vec::new(),
            size: SEGMENT_DESCRIPTOR_SIZE,
        })
    }

    /// Opens an existing segment, rebuilding the entry index by scanning frames.
    ///
    /// Scanning stops at the first frame that fails validation (bad magic,
    /// crc mismatch, short read, unexpected index). Everything from there on
    /// is a torn write from a crash and is cut off.
    pub fn open(file_name: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(file_name)
            .map_err(|e| StorageError::io(format!("open segment {:?}", file_name), e))?;
        let file_size = file
            .metadata()
            .map_err(|e| StorageError::io(format!("stat segment {:?}", file_name), e))?
            .len();

        let mut descriptor_buf = [0u8; SEGMENT_DESCRIPTOR_SIZE as usize];
        if file_size < SEGMENT_DESCRIPTOR_SIZE {
            return Err(StorageError::corruption(
                file_name.display(),
                "segment shorter than its descriptor",
            ));
        }
        file.read_exact_at(&mut descriptor_buf, 0)
            .map_err(|e| StorageError::io(format!("read descriptor {:?}", file_name), e))?;
        let descriptor = SegmentDescriptor::deserialize(&descriptor_buf)
            .map_err(|e| StorageError::corruption(file_name.display(), e.to_string()))?;

        let mut segment = Self {
            file_name: file_name.to_path_buf(),
            file,
            descriptor,
            entries: Vec::new(),
            size: SEGMENT_DESCRIPTOR_SIZE,
        };

        let valid_end = segment.replay_segment(file_size);
        if valid_end < file_size {
            warn!(
                "Segment {:?} has {} trailing bytes after index {}, truncating torn tail",
                segment.file_name,
                file_size - valid_end,
                segment.last_index().unwrap_or(segment.base_index().saturating_sub(1))
            );
            segment
                .file
                .set_len(valid_end)
                .map_err(|e| StorageError::io(format!("truncate {:?}", segment.file_name), e))?;
            segment
                .file
                .sync_all()
                .map_err(|e| StorageError::io(format!("sync {:?}", segment.file_name), e))?;
        }
        segment.size = valid_end;
        Ok(segment)
    }

    /// Scans frames after the descriptor and returns the offset where the valid
    /// data ends.
    fn replay_segment(&mut self, file_size: u64) -> u64 {
        let mut offset = SEGMENT_DESCRIPTOR_SIZE;
        let mut header_buf = [0u8; FRAME_HEADER_SIZE as usize];

        while offset < file_size {
            let result = (|| -> anyhow::Result<EntryMeta> {
                if offset + FRAME_HEADER_SIZE > file_size {
                    return Err(anyhow!("incomplete header"));
                }
                self.file.read_exact_at(&mut header_buf, offset)?;
                let header = FrameHeader::deserialize(&header_buf)?;

                let data_size = header.size as u64;
                if offset + FRAME_HEADER_SIZE + data_size > file_size {
                    return Err(anyhow!("incomplete body"));
                }
                let mut data_buf = vec![0u8; data_size as usize];
                self.file
                    .read_exact_at(&mut data_buf, offset + FRAME_HEADER_SIZE)?;
                let entry = decode_body(&header, &data_buf)?;

                let expected = self.next_index();
                if entry.index != expected {
                    return Err(anyhow!(
                        "expected index {}, found {}",
                        expected,
                        entry.index
                    ));
                }
                Ok(EntryMeta {
                    log_index: entry.index,
                    term: entry.term,
                    offset,
                    size: data_size,
                })
            })();

            match result {
                Ok(meta) => {
                    offset = meta.end_offset();
                    self.entries.push(meta);
                }
                Err(e) => {
                    warn!(
                        "Stopping replay of {:?} at offset {}: {}",
                        self.file_name, offset, e
                    );
                    break;
                }
            }
        }
        offset
    }

    pub fn id(&self) -> u64 {
        self.descriptor.segment_id
    }

    pub fn base_index(&self) -> u64 {
        self.descriptor.base_index
    }

    /// Index the next appended entry must carry.
    pub fn next_index(&self) -> u64 {
        self.descriptor.base_index + self.entries.len() as u64
    }

    pub fn last_index(&self) -> Option<u64> {
        self.entries.last().map(|m| m.log_index)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn contains(&self, index: u64) -> bool {
        index >= self.base_index() && index < self.next_index()
    }

    pub fn meta(&self, index: u64) -> Option<&EntryMeta> {
        if !self.contains(index) {
            return None;
        }
        self.entries.get((index - self.base_index()) as usize)
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.meta(index).map(|m| m.term)
    }

    /// Writes one entry at the tail. The entry must carry `next_index()`.
    pub fn append(&mut self, entry: &LogEntry) -> StorageResult<EntryMeta> {
        let frame = encode_frame(entry).map_err(|e| StorageError::Codec(e.to_string()))?;
        self.file
            .write_all_at(&frame, self.size)
            .map_err(|e| StorageError::io(format!("append to {:?}", self.file_name), e))?;

        let meta = EntryMeta {
            log_index: entry.index,
            term: entry.term,
            offset: self.size,
            size: frame.len() as u64 - FRAME_HEADER_SIZE,
        };
        self.size = meta.end_offset();
        self.entries.push(meta);
        Ok(meta)
    }

    pub fn read(&self, index: u64) -> StorageResult<Option<LogEntry>> {
        let Some(meta) = self.meta(index) else {
            return Ok(None);
        };
        let mut buf = vec![0u8; (FRAME_HEADER_SIZE + meta.size) as usize];
        self.file
            .read_exact_at(&mut buf, meta.offset)
            .map_err(|e| StorageError::io(format!("read from {:?}", self.file_name), e))?;

        let header = FrameHeader::deserialize(&buf[..FRAME_HEADER_SIZE as usize])
            .map_err(|e| StorageError::corruption(self.file_name.display(), e.to_string()))?;
        let entry = decode_body(&header, &buf[FRAME_HEADER_SIZE as usize..])
            .map_err(|e| StorageError::corruption(self.file_name.display(), e.to_string()))?;
        Ok(Some(entry))
    }

    /// Discards every entry with index `>= index`.
    pub fn truncate_from(&mut self, index: u64) -> StorageResult<()> {
        if index >= self.next_index() {
            return Ok(());
        }
        let keep = index.saturating_sub(self.base_index()) as usize;
        let new_size = self
            .entries
            .get(keep)
            .map(|m| m.offset)
            .unwrap_or(self.size);

        self.file
            .set_len(new_size)
            .map_err(|e| StorageError::io(format!("truncate {:?}", self.file_name), e))?;
        self.entries.truncate(keep);
        self.size = new_size;
        Ok(())
    }

    pub fn sync_data(&self) -> StorageResult<()> {
        self.file.sync_data().map_err(|e| {
            warn!("Failed to sync log segment file data: {}", e);
            StorageError::io(format!("sync {:?}", self.file_name), e)
        })
    }

    /// Removes the segment file from disk.
    pub fn delete(self) -> StorageResult<()> {
        let file_name = self.file_name.clone();
        drop(self.file);
        fs::remove_file(&file_name)
            .map_err(|e| StorageError::io(format!("delete segment {:?}", file_name), e))
    }
}
