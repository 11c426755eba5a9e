//! Partition replica actor: owns the consensus state behind a mutex and
//! exposes it to the driver, the log adapter and the host.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::info;

use crate::driver::HandleEventTrait;
use crate::event::{Event, PartitionHealth, Role};
use crate::state::{RaftState, RaftStateOptions};
use crate::storage::{
    FileSnapshotStore, LogReadHandle, LogStoreOptions, MetaStore, ReplicatedLog,
    SnapshotStoreOptions,
};
use crate::traits::{ClientResult, RaftCallbacks, RaftResult};
use crate::types::{NodeId, PartitionId, RaftId};

/// Options of one partition replica.
///
/// Files live under `{data_dir}/partition-{partition}/`; the `dir` fields of
/// `log` and `snapshot` are derived from it when the partition opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionOptions {
    pub data_dir: PathBuf,
    pub partition: PartitionId,
    pub node: NodeId,
    #[serde(default)]
    pub raft: RaftStateOptions,
    #[serde(default)]
    pub log: LogStoreOptions,
    #[serde(default)]
    pub snapshot: SnapshotStoreOptions,
}

impl PartitionOptions {
    pub fn new(data_dir: impl AsRef<Path>, partition: PartitionId, node: impl Into<NodeId>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            partition,
            node: node.into(),
            raft: RaftStateOptions::default(),
            log: LogStoreOptions::default(),
            snapshot: SnapshotStoreOptions::default(),
        }
    }

    pub fn with_raft(mut self, raft: RaftStateOptions) -> Self {
        self.raft = raft;
        self
    }

    pub fn with_max_segment_size(mut self, size: u64) -> Self {
        self.log.max_segment_size = size;
        self
    }

    /// Toggles fsync for the log, the snapshots and the persisted state.
    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.log.sync_on_write = sync;
        self.snapshot.sync_on_write = sync;
        self
    }

    pub fn id(&self) -> RaftId {
        RaftId::new(self.partition, self.node.clone())
    }

    pub fn partition_dir(&self) -> PathBuf {
        self.data_dir.join(format!("partition-{}", self.partition))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.partition_dir().join("log")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.partition_dir().join("snapshots")
    }
}

/// Point-in-time view of a replica, mostly for hosts and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStatus {
    pub role: Role,
    pub term: u64,
    pub leader: Option<RaftId>,
    pub first_index: u64,
    pub last_index: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    pub snapshot_index: u64,
    pub health: PartitionHealth,
}

/// Handle to one partition replica. Cheap to clone.
#[derive(Clone)]
pub struct RaftPartition {
    id: RaftId,
    state: Arc<Mutex<RaftState>>,
    health: watch::Receiver<PartitionHealth>,
    reader: LogReadHandle,
}

impl RaftPartition {
    /// 打开分区：加载元数据、日志与快照并执行一致性检查
    pub async fn open(options: PartitionOptions, callbacks: Arc<dyn RaftCallbacks>) -> RaftResult<Self> {
        let id = options.id();
        let log_options = LogStoreOptions {
            dir: options.log_dir(),
            ..options.log.clone()
        };
        let snapshot_options = SnapshotStoreOptions {
            dir: options.snapshot_dir(),
            ..options.snapshot.clone()
        };

        // 先取得目录锁，再打开日志与快照
        let meta = MetaStore::new(options.partition_dir(), log_options.sync_on_write)?;
        let log = ReplicatedLog::open(log_options)?;
        let snapshots = FileSnapshotStore::open(snapshot_options)?;
        let state = RaftState::open(id.clone(), options.raft, meta, log, snapshots, callbacks).await?;

        let health = state.subscribe_health();
        let reader = state.log().read_handle();
        info!("Partition replica {} opened at {:?}", id, options.data_dir);
        Ok(Self {
            id,
            state: Arc::new(Mutex::new(state)),
            health,
            reader,
        })
    }

    /// Replays committed entries and arms the election timer.
    pub async fn start(&self) {
        self.state.lock().await.start().await;
    }

    pub fn id(&self) -> &RaftId {
        &self.id
    }

    pub async fn handle_event(&self, event: Event) {
        self.state.lock().await.handle_event(event).await;
    }

    /// Appends a block on the leader; returns `(index, term)` once flushed
    /// locally. Use [`crate::adapter::LogStorageAdapter`] to wait for commit.
    pub async fn append(
        &self,
        lowest_position: u64,
        highest_position: u64,
        data: Vec<u8>,
    ) -> ClientResult<(u64, u64)> {
        self.state
            .lock()
            .await
            .propose(lowest_position, highest_position, data)
            .await
    }

    pub fn health(&self) -> PartitionHealth {
        self.health.borrow().clone()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<PartitionHealth> {
        self.health.clone()
    }

    /// Resolves once the replica is `Ready` or `Dead`.
    pub async fn wait_ready(&self) -> PartitionHealth {
        let mut health = self.health.clone();
        loop {
            let current = health.borrow_and_update().clone();
            if current.is_ready() || current.is_dead() {
                return current;
            }
            if health.changed().await.is_err() {
                return self.health();
            }
        }
    }

    pub fn read_handle(&self) -> LogReadHandle {
        self.reader.clone()
    }

    pub async fn role(&self) -> Role {
        self.state.lock().await.role()
    }

    pub async fn status(&self) -> PartitionStatus {
        let state = self.state.lock().await;
        PartitionStatus {
            role: state.role(),
            term: state.current_term(),
            leader: state.leader_id(),
            first_index: state.log().first_index(),
            last_index: state.log().last_index(),
            commit_index: state.commit_index(),
            last_applied: state.last_applied(),
            snapshot_index: state.snapshot_index(),
            health: state.health().clone(),
        }
    }
}

#[async_trait::async_trait]
impl HandleEventTrait for RaftPartition {
    async fn handle_event(&self, event: Event) {
        RaftPartition::handle_event(self, event).await;
    }
}
