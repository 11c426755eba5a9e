//! Position-addressed access to a partition's replicated log for the layers
//! above consensus.

mod reader;

pub use reader::LogStorageReader;

use std::time::Duration;

use tracing::{debug, warn};

use crate::driver::{PartitionDriver, SendEventResult};
use crate::error::ClientError;
use crate::event::Event;
use crate::partition::RaftPartition;
use crate::traits::ClientResult;

const DEFAULT_APPEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Writes application blocks through the partition's leader and hands out
/// readers over committed entries.
#[derive(Clone)]
pub struct LogStorageAdapter {
    partition: RaftPartition,
    driver: PartitionDriver,
    append_timeout: Duration,
}

impl LogStorageAdapter {
    pub fn new(partition: RaftPartition, driver: PartitionDriver) -> Self {
        Self {
            partition,
            driver,
            append_timeout: DEFAULT_APPEND_TIMEOUT,
        }
    }

    pub fn with_append_timeout(mut self, timeout: Duration) -> Self {
        self.append_timeout = timeout;
        self
    }

    /// Appends a block covering `[lowest_position, highest_position]` and
    /// resolves with its index once it is committed.
    ///
    /// Fails with `NotLeader` on a follower, or when leadership was lost and
    /// the index ended up holding another leader's entry.
    pub async fn append(
        &self,
        lowest_position: u64,
        highest_position: u64,
        data: Vec<u8>,
    ) -> ClientResult<u64> {
        let handle = self.partition.read_handle();
        let mut commits = handle.subscribe();
        let (index, term) = self
            .partition
            .append(lowest_position, highest_position, data)
            .await?;

        let wait = async {
            while handle.committed_index() < index {
                if commits.changed().await.is_err() {
                    return Err(ClientError::Unavailable("log closed".to_string()));
                }
            }
            Ok(())
        };
        tokio::time::timeout(self.append_timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout)??;

        match handle.read(index) {
            Ok(Some(entry)) if entry.term == term => {
                debug!("Entry {} committed in term {}", index, term);
                Ok(index)
            }
            Ok(_) => {
                warn!(
                    "Entry {} of term {} was replaced before it committed",
                    index, term
                );
                Err(ClientError::NotLeader(None))
            }
            Err(err) => Err(ClientError::Unavailable(err.to_string())),
        }
    }

    /// A new cursor over committed entries, positioned at the first one.
    pub fn new_reader(&self) -> LogStorageReader {
        LogStorageReader::new(self.partition.read_handle())
    }

    /// Asks the partition to snapshot its applied state and compact the log.
    pub fn request_snapshot(&self) -> bool {
        let result = self
            .driver
            .dispatch_event(self.partition.id().clone(), Event::CreateSnapshot);
        if result != SendEventResult::Success {
            warn!(
                "Failed to request snapshot on {}: {:?}",
                self.partition.id(),
                result
            );
        }
        result == SendEventResult::Success
    }

    pub fn partition(&self) -> &RaftPartition {
        &self.partition
    }
}
