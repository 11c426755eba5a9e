pub mod log;
pub mod meta;
pub mod snapshot;

pub use log::{LogReadHandle, LogSegmentStore, LogStoreOptions, ReplicatedLog};
pub use meta::MetaStore;
pub use snapshot::{FileSnapshotStore, ReceivedSnapshot, Snapshot, SnapshotMeta, SnapshotStoreOptions};
