//! Log storage for one partition.
//!
//! # Module Structure
//!
//! - `entry`: frame and segment descriptor encoding
//! - `segment`: a single append-only segment file
//! - `store`: multi-segment store with rotation and prefix deletion
//! - `raft_log`: the replicated log on top of the store, plus read handles

mod entry;
mod raft_log;
mod segment;
mod store;

#[cfg(test)]
mod tests;

pub use entry::{
    ENTRY_MAGIC_NUM, EntryMeta, FRAME_HEADER_SIZE, FrameHeader, SEGMENT_DESCRIPTOR_SIZE,
    SegmentDescriptor,
};
pub use raft_log::{LogReadHandle, ReplicatedLog};
pub use segment::{LogSegment, segment_file_name};
pub use store::{DEFAULT_MAX_SEGMENT_SIZE, LogSegmentStore, LogStoreOptions};
