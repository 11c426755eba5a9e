use std::time::Duration;

use async_trait::async_trait;

use crate::error::*;
use crate::event::{PartitionHealth, Role};
use crate::message::*;
use crate::types::{NodeId, PartitionId, RaftId, TimerId};

// 结果类型别名
pub type RaftResult<T> = Result<T, RaftError>;
pub type RpcResult<T> = Result<T, RpcError>;
pub type StorageResult<T> = Result<T, StorageError>;
pub type LogResult<T> = Result<T, LogError>;
pub type ClientResult<T> = Result<T, ClientError>;
pub type ApplyResult<T> = Result<T, ApplyError>;
pub type SnapshotResult<T> = Result<T, SnapshotError>;

#[async_trait]
pub trait Network: Send + Sync {
    // 发送 RPC 回调
    async fn send_request_vote_request(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: RequestVoteRequest,
    ) -> RpcResult<()>;

    async fn send_request_vote_response(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: RequestVoteResponse,
    ) -> RpcResult<()>;

    async fn send_append_entries_request(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: AppendEntriesRequest,
    ) -> RpcResult<()>;

    async fn send_append_entries_response(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: AppendEntriesResponse,
    ) -> RpcResult<()>;

    async fn send_install_snapshot_request(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: InstallSnapshotRequest,
    ) -> RpcResult<()>;

    async fn send_install_snapshot_response(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: InstallSnapshotResponse,
    ) -> RpcResult<()>;
}

pub trait TimerService: Send + Sync {
    fn del_timer(&self, from: &RaftId, timer_id: TimerId);
    fn set_election_timer(&self, from: &RaftId, dur: Duration) -> TimerId;
    fn set_heartbeat_timer(&self, from: &RaftId, dur: Duration) -> TimerId;
    fn set_apply_timer(&self, from: &RaftId, dur: Duration) -> TimerId;
}

/// The state machine consuming committed entries of one partition.
#[async_trait]
pub trait StateMachine: Send + Sync {
    // 已提交日志应用到状态机的回调，按索引顺序调用
    async fn apply(&self, from: &RaftId, entry: &LogEntry) -> ApplyResult<()>;

    /// Serialize the state covering every entry up to `index`.
    async fn take_snapshot(&self, from: &RaftId, index: u64, term: u64) -> ApplyResult<Vec<u8>>;

    /// Replace the state with an installed snapshot.
    async fn restore_snapshot(
        &self,
        from: &RaftId,
        index: u64,
        term: u64,
        data: Vec<u8>,
    ) -> ApplyResult<()>;
}

#[async_trait]
pub trait EventNotify: Send + Sync {
    // 状态变更通知回调
    async fn on_state_changed(&self, from: &RaftId, role: Role, term: u64);

    async fn on_health_changed(&self, from: &RaftId, health: PartitionHealth);
}

/// Supplies the voter set of a partition. Changes arrive later as
/// `Event::MembershipChanged`.
pub trait MembershipProvider: Send + Sync {
    fn members(&self, partition: PartitionId) -> Vec<NodeId>;
}

pub trait RaftCallbacks:
    StateMachine + Network + TimerService + EventNotify + MembershipProvider
{
}
