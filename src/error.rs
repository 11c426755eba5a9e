use std::fmt::Display;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::types::RaftId;

/// 顶层Raft错误类型
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Log error: {0}")]
    Log(#[from] LogError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Consistency error: {0}")]
    Consistency(#[from] ConsistencyError),

    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),
}

/// RPC通信相关错误
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Target node {0} not found")]
    NodeNotFound(RaftId),

    #[error("Network error: {0}")]
    Network(String),

    #[error("RPC timeout")]
    Timeout,

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// 存储相关错误
#[derive(Debug, Error, Clone)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(Arc<anyhow::Error>),

    #[error("Corrupted data in {file}: {reason}")]
    DataCorruption { file: String, reason: String },

    #[error("Storage full")]
    StorageFull,

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Directory {0} is locked by another replica")]
    Locked(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::StorageFull {
            return StorageError::StorageFull;
        }
        StorageError::Io(Arc::new(err.into()))
    }
}

impl StorageError {
    /// Wraps an IO failure with the operation and path it happened on.
    pub fn io(context: impl Display, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::StorageFull {
            return StorageError::StorageFull;
        }
        StorageError::Io(Arc::new(anyhow::anyhow!("{}: {}", context, err)))
    }

    pub fn corruption(file: impl Display, reason: impl Into<String>) -> Self {
        StorageError::DataCorruption {
            file: file.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<bincode::error::EncodeError> for StorageError {
    fn from(err: bincode::error::EncodeError) -> Self {
        StorageError::Codec(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for StorageError {
    fn from(err: bincode::error::DecodeError) -> Self {
        StorageError::Codec(err.to_string())
    }
}

/// Errors raised by the replicated log when a caller breaks one of its rules.
#[derive(Debug, Error, Clone)]
pub enum LogError {
    #[error("Append with term {term} rejected, current term is {current_term}")]
    TermStale { term: u64, current_term: u64 },

    #[error("Append with term {term} would go below last entry term {last_term}")]
    TermRegression { term: u64, last_term: u64 },

    #[error("Expected entry at index {expected}, got {actual}")]
    IndexMismatch { expected: u64, actual: u64 },

    #[error("Log entry at index {0} not found")]
    NotFound(u64),

    #[error("Log is not empty (first index {first_index}, last index {last_index})")]
    NotEmpty { first_index: u64, last_index: u64 },

    #[error("Cannot truncate from index {index}, entries up to {commit_index} are committed")]
    TruncateCommitted { index: u64, commit_index: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// 快照相关错误
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot at index {index} is not newer than current snapshot at {current}")]
    TooOld { index: u64, current: u64 },

    #[error("Snapshot {index}-{term} already exists")]
    AlreadyExists { index: u64, term: u64 },

    #[error("Snapshot chunk at offset {actual} out of order, expected offset {expected}")]
    ChunkOutOfOrder { expected: u64, actual: u64 },

    #[error("Snapshot at index {0} not found")]
    NotFound(u64),

    #[error("Snapshot data corrupted: {0}")]
    DataCorrupted(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<std::io::Error> for SnapshotError {
    fn from(err: std::io::Error) -> Self {
        SnapshotError::Storage(err.into())
    }
}

/// 客户端相关错误
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Not leader (current leader: {0:?})")]
    NotLeader(Option<RaftId>),

    #[error("Partition unavailable: {0}")]
    Unavailable(String),

    #[error("Request timeout")]
    Timeout,

    #[error(transparent)]
    Log(#[from] LogError),
}

/// 状态机应用相关错误
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("State machine busy")]
    Busy,

    #[error("State machine error: {0}")]
    Internal(String),
}

/// The retained log cannot be reconciled with the latest snapshot.
#[derive(Debug, Error)]
pub enum ConsistencyError {
    #[error("Partition {partition} inconsistent: {reason}")]
    Inconsistent { partition: RaftId, reason: String },

    #[error("Failed to reset log of partition {partition}: {source}")]
    ResetFailed {
        partition: RaftId,
        #[source]
        source: LogError,
    },
}

// === 统一错误处理机制 ===
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorSeverity {
    /// The partition must stop participating.
    Fatal,
    /// Retried later (with back-off for peers).
    Recoverable,
    /// Only logged.
    Ignorable,
}

pub trait ErrorHandler {
    fn severity(&self) -> ErrorSeverity;
    fn context(&self) -> String;
}

impl ErrorHandler for RpcError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            RpcError::NodeNotFound(_) => ErrorSeverity::Recoverable,
            RpcError::Network(_) => ErrorSeverity::Recoverable,
            RpcError::Timeout => ErrorSeverity::Recoverable,
            RpcError::Codec(_) => ErrorSeverity::Ignorable,
            RpcError::Protocol(_) => ErrorSeverity::Ignorable,
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

impl ErrorHandler for StorageError {
    fn severity(&self) -> ErrorSeverity {
        // 磁盘错误一律视为致命：宁可停止参与共识也不能确认不安全的写入
        ErrorSeverity::Fatal
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

impl ErrorHandler for LogError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            LogError::TermStale { .. } => ErrorSeverity::Ignorable,
            LogError::NotFound(_) => ErrorSeverity::Recoverable,
            LogError::IndexMismatch { .. } => ErrorSeverity::Recoverable,
            LogError::TermRegression { .. } => ErrorSeverity::Fatal,
            LogError::NotEmpty { .. } => ErrorSeverity::Fatal,
            LogError::TruncateCommitted { .. } => ErrorSeverity::Fatal,
            LogError::Storage(e) => e.severity(),
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

impl ErrorHandler for SnapshotError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            SnapshotError::TooOld { .. } => ErrorSeverity::Ignorable,
            SnapshotError::AlreadyExists { .. } => ErrorSeverity::Ignorable,
            SnapshotError::ChunkOutOfOrder { .. } => ErrorSeverity::Recoverable,
            SnapshotError::NotFound(_) => ErrorSeverity::Recoverable,
            SnapshotError::DataCorrupted(_) => ErrorSeverity::Recoverable,
            SnapshotError::Storage(e) => e.severity(),
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

impl ErrorHandler for ApplyError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            ApplyError::Busy => ErrorSeverity::Recoverable,
            ApplyError::Internal(_) => ErrorSeverity::Fatal,
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

impl ErrorHandler for ConsistencyError {
    fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::Fatal
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

/// Classifies callback and storage failures, logging them by severity and
/// remembering the first fatal one.
pub struct CallbackErrorHandler {
    node_id: RaftId,
    fatal: Option<String>,
    failures: u64,
}

impl CallbackErrorHandler {
    pub fn new(node_id: RaftId) -> Self {
        Self {
            node_id,
            fatal: None,
            failures: 0,
        }
    }

    /// 统一处理回调错误
    pub fn handle<T, E: ErrorHandler>(
        &mut self,
        result: Result<T, E>,
        operation: &str,
        target: Option<&RaftId>,
    ) -> Option<T> {
        match result {
            Ok(val) => Some(val),
            Err(e) => {
                let ctx = if let Some(t) = target {
                    format!("{} from {} to {}", operation, self.node_id, t)
                } else {
                    format!("{} on {}", operation, self.node_id)
                };

                match e.severity() {
                    ErrorSeverity::Fatal => {
                        error!("[FATAL] {} failed: {} - partition stops", ctx, e.context());
                        self.enter_fatal(format!("{} failed: {}", operation, e.context()));
                    }
                    ErrorSeverity::Recoverable => {
                        self.failures += 1;
                        // 前三次以及之后每 100 次才记录，避免刷屏
                        if self.failures <= 3 || self.failures % 100 == 0 {
                            warn!(
                                "[RECOVERABLE] {} failed: {} - will retry ({} failures)",
                                ctx,
                                e.context(),
                                self.failures
                            );
                        }
                    }
                    ErrorSeverity::Ignorable => {
                        info!("[IGNORABLE] {} failed: {}", ctx, e.context());
                    }
                }
                None
            }
        }
    }

    /// 处理不需要返回值的操作
    pub fn handle_void<E: ErrorHandler>(
        &mut self,
        result: Result<(), E>,
        operation: &str,
        target: Option<&RaftId>,
    ) -> bool {
        self.handle(result, operation, target).is_some()
    }

    fn enter_fatal(&mut self, reason: String) {
        if self.fatal.is_none() {
            error!(
                "Partition replica {} stops participating in consensus: {}",
                self.node_id, reason
            );
            self.fatal = Some(reason);
        }
    }

    pub fn fatal_reason(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }
}
