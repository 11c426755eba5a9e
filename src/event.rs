use std::fmt::{self, Display};

use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};
use crate::types::NodeId;

/// Raft 事件定义（输入）
#[derive(Debug, Clone)]
pub enum Event {
    // 定时器事件
    /// 选举超时（Follower/Candidate 触发）
    ElectionTimeout,
    /// 心跳超时（Leader 触发日志同步）
    HeartbeatTimeout,
    /// 定期将已提交日志应用到状态机
    ApplyLogTimeout,

    // RPC 请求事件（来自其他节点）
    RequestVoteRequest(crate::RaftId, RequestVoteRequest),
    AppendEntriesRequest(crate::RaftId, AppendEntriesRequest),
    InstallSnapshotRequest(crate::RaftId, InstallSnapshotRequest),

    // RPC 响应事件（其他节点对本节点请求的回复）
    RequestVoteResponse(crate::RaftId, RequestVoteResponse),
    AppendEntriesResponse(crate::RaftId, AppendEntriesResponse),
    InstallSnapshotResponse(crate::RaftId, InstallSnapshotResponse),

    // 快照生成
    CreateSnapshot,

    /// The membership provider reports a new voter set for this partition.
    MembershipChanged(Vec<NodeId>),
}

/// Raft 节点角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

/// Health of a partition replica as seen by the layers above consensus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionHealth {
    /// Opened, consistency check passed, not caught up yet.
    Starting,
    Ready,
    NotReady(String),
    /// The replica stopped participating and will not recover on its own.
    Dead(String),
}

impl PartitionHealth {
    pub fn is_ready(&self) -> bool {
        matches!(self, PartitionHealth::Ready)
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, PartitionHealth::Dead(_))
    }
}

impl Display for PartitionHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionHealth::Starting => write!(f, "Starting"),
            PartitionHealth::Ready => write!(f, "Ready"),
            PartitionHealth::NotReady(reason) => write!(f, "NotReady({})", reason),
            PartitionHealth::Dead(reason) => write!(f, "Dead({})", reason),
        }
    }
}
