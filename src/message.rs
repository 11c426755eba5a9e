use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::RpcError;
use crate::types::{NodeId, RaftId, RequestId};

// === 日志条目 ===

/// What a log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum EntryKind {
    /// No-op entry a new leader appends at the start of its term.
    Initial,
    /// A batch of application records covering `[lowest_position, highest_position]`.
    Application {
        lowest_position: u64,
        highest_position: u64,
    },
}

impl EntryKind {
    pub fn application(lowest_position: u64, highest_position: u64) -> Self {
        EntryKind::Application {
            lowest_position,
            highest_position,
        }
    }

    pub fn is_application(&self) -> bool {
        matches!(self, EntryKind::Application { .. })
    }

    /// Position range of an application entry.
    pub fn positions(&self) -> Option<(u64, u64)> {
        match self {
            EntryKind::Initial => None,
            EntryKind::Application {
                lowest_position,
                highest_position,
            } => Some((*lowest_position, *highest_position)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub timestamp: u64, // 毫秒时间戳
    pub kind: EntryKind,
    pub payload: Vec<u8>,
}

impl LogEntry {
    /// Size the entry occupies in a replication batch.
    pub fn approximate_size(&self) -> usize {
        self.payload.len() + 48
    }
}

// === 网络接口 ===

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: RaftId,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub request_id: RequestId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
    pub request_id: RequestId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: RaftId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
    pub request_id: RequestId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// Highest index known to match the leader's log (flushed).
    pub match_index: u64,
    /// First index the leader should retry from when `success` is false.
    pub conflict_index: Option<u64>,
    pub request_id: RequestId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: RaftId,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub offset: u64,
    pub chunk: Vec<u8>,
    pub done: bool, // 最后一个分块
    pub request_id: RequestId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub success: bool,
    /// Offset the follower expects next; the leader resumes from here.
    pub next_offset: u64,
    pub request_id: RequestId,
}

/// Durable per-partition consensus state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
}

/// Envelope used when a transport carries messages as bytes.
#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub enum RaftMessage {
    RequestVote(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotRequest),
    InstallSnapshotResponse(InstallSnapshotResponse),
}

impl RaftMessage {
    pub fn encode(&self) -> Result<Vec<u8>, RpcError> {
        let config = bincode::config::standard();
        bincode::encode_to_vec(self, config).map_err(|e| RpcError::Codec(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, RpcError> {
        let config = bincode::config::standard();
        let (msg, _) = bincode::decode_from_slice(data, config).map_err(|e| {
            warn!("Failed to decode raft message: {}", e);
            RpcError::Codec(e.to_string())
        })?;
        Ok(msg)
    }
}
