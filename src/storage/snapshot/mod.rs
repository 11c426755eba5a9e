//! Snapshot storage for one partition.
//!
//! # Directory Structure
//!
//! ```text
//! {partition_dir}/snapshots/
//! ├── {index}-{term}/
//! │   ├── meta.json       # Snapshot metadata (index, term, checksum, size)
//! │   └── data.bin        # Snapshot data
//! └── pending/
//!     └── {index}-{term}/ # Snapshot being received from the leader
//! ```
//!
//! # Features
//!
//! - Atomic snapshot writes using temporary directories and rename
//! - Checksum verification for data integrity
//! - Chunked reception with contiguous offsets

mod store;


pub use store::{
    FileSnapshotStore, ReceivedSnapshot, Snapshot, SnapshotMeta, SnapshotStoreOptions,
};
