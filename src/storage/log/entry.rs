use anyhow::{Result, anyhow};
use tracing::warn;

use crate::message::LogEntry;

// Segment file format:
// | SegmentDescriptor | FrameHeader | LogEntry (bincode) | FrameHeader | LogEntry | ...

pub const ENTRY_MAGIC_NUM: u32 = 0x_1234_5678;
pub const FRAME_HEADER_SIZE: u64 = 12; // magic + length + crc

pub const SEGMENT_MAGIC_NUM: u32 = 0x_5345_474d;
pub const SEGMENT_VERSION_V1: u32 = 1;
pub const SEGMENT_DESCRIPTOR_SIZE: u64 = 28; // 4 + 4 + 8 + 8 + 4

/// Location of one entry inside a segment file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryMeta {
    pub log_index: u64,
    pub term: u64,
    /// Offset of the frame header.
    pub offset: u64,
    /// Size of the encoded entry, header excluded.
    pub size: u64,
}

impl EntryMeta {
    pub fn end_offset(&self) -> u64 {
        self.offset + FRAME_HEADER_SIZE + self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic_num: u32,
    pub size: u32,
    pub crc: u32,
}

impl FrameHeader {
    pub fn new(size: u32, crc: u32) -> Self {
        Self {
            magic_num: ENTRY_MAGIC_NUM,
            size,
            crc,
        }
    }

    pub fn serialize(&self) -> [u8; FRAME_HEADER_SIZE as usize] {
        let mut buf = [0u8; FRAME_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&self.magic_num.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_SIZE as usize {
            return Err(anyhow!("Invalid frame header length {}", data.len()));
        }
        let magic_num = read_u32(&data[0..4]);
        if magic_num != ENTRY_MAGIC_NUM {
            return Err(anyhow!("Invalid magic number {:#x}", magic_num));
        }
        Ok(Self {
            magic_num,
            size: read_u32(&data[4..8]),
            crc: read_u32(&data[8..12]),
        })
    }
}

/// Encodes an entry as header + body, ready to be written at the segment tail.
pub fn encode_frame(entry: &LogEntry) -> Result<Vec<u8>> {
    let body = bincode::encode_to_vec(entry, bincode::config::standard())?;
    let size = u32::try_from(body.len())
        .map_err(|_| anyhow!("Log entry {} too large ({} bytes)", entry.index, body.len()))?;
    let header = FrameHeader::new(size, crc32fast::hash(&body));

    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE as usize + body.len());
    buf.extend_from_slice(&header.serialize());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decodes a frame body after checking it against the header crc.
pub fn decode_body(header: &FrameHeader, body: &[u8]) -> Result<LogEntry> {
    let actual_crc = crc32fast::hash(body);
    if actual_crc != header.crc {
        return Err(anyhow!(
            "CRC mismatch: expected {}, got {}",
            header.crc,
            actual_crc
        ));
    }
    let (entry, _) = bincode::decode_from_slice(body, bincode::config::standard()).map_err(|e| {
        warn!("Failed to deserialize log entry: {}", e);
        e
    })?;
    Ok(entry)
}

/// Header written once at the start of every segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub version: u32,
    pub segment_id: u64,
    /// Index of the first entry stored in the segment.
    pub base_index: u64,
}

impl SegmentDescriptor {
    pub fn new(segment_id: u64, base_index: u64) -> Self {
        Self {
            version: SEGMENT_VERSION_V1,
            segment_id,
            base_index,
        }
    }

    pub fn serialize(&self) -> [u8; SEGMENT_DESCRIPTOR_SIZE as usize] {
        let mut buf = [0u8; SEGMENT_DESCRIPTOR_SIZE as usize];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC_NUM.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.segment_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.base_index.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..24]);
        buf[24..28].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < SEGMENT_DESCRIPTOR_SIZE as usize {
            return Err(anyhow!("Segment descriptor truncated"));
        }
        if read_u32(&data[0..4]) != SEGMENT_MAGIC_NUM {
            return Err(anyhow!("Not a segment file"));
        }
        let crc = read_u32(&data[24..28]);
        if crc32fast::hash(&data[0..24]) != crc {
            return Err(anyhow!("Segment descriptor crc mismatch"));
        }
        let version = read_u32(&data[4..8]);
        if version != SEGMENT_VERSION_V1 {
            return Err(anyhow!("Unsupported segment version {}", version));
        }
        Ok(Self {
            version,
            segment_id: read_u64(&data[8..16]),
            base_index: read_u64(&data[16..24]),
        })
    }
}

fn read_u32(data: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[..4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(data: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[..8]);
    u64::from_le_bytes(bytes)
}
