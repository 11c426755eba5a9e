//! Per-partition Raft replication for a partitioned record log.
//!
//! Every partition runs its own consensus group. A replica owns a segmented
//! on-disk log, a snapshot store and its persisted vote, and is driven by a
//! [`PartitionDriver`] that serializes its events. Readers and writers above
//! consensus go through [`LogStorageAdapter`].

pub mod adapter;
pub mod consistency;
pub mod driver;
pub mod error;
pub mod event;
pub mod message;
pub mod mock;
pub mod partition;
pub mod pipeline;
pub mod state;
pub mod storage;
pub mod traits;
pub mod types;

pub use adapter::{LogStorageAdapter, LogStorageReader};
pub use consistency::{ConsistencyChecker, ConsistencyResult};
pub use driver::{HandleEventTrait, PartitionDriver, SendEventResult, Timers};
pub use error::*;
pub use event::{Event, PartitionHealth, Role};
pub use message::*;
pub use partition::{PartitionOptions, PartitionStatus, RaftPartition};
pub use state::{AppendOutcome, RaftState, RaftStateOptions};
pub use traits::*;
pub use types::{NodeId, PartitionId, RaftId, RequestId, TimerId, now_millis};
