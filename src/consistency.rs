//! Startup / post-install check that the retained log lines up with the
//! latest snapshot.

use std::fmt::{self, Display};

use tracing::{error, info, warn};

use crate::error::{ConsistencyError, LogError};
use crate::storage::ReplicatedLog;
use crate::types::RaftId;

/// Outcome of a consistency check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyResult {
    Consistent,
    /// The empty log was re-anchored right after the snapshot.
    RepairedByReset(u64),
    Inconsistent(String),
}

impl ConsistencyResult {
    pub fn is_ok(&self) -> bool {
        !matches!(self, ConsistencyResult::Inconsistent(_))
    }
}

impl Display for ConsistencyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyResult::Consistent => write!(f, "Consistent"),
            ConsistencyResult::RepairedByReset(index) => write!(f, "RepairedByReset({})", index),
            ConsistencyResult::Inconsistent(reason) => write!(f, "Inconsistent({})", reason),
        }
    }
}

/// Core decision: given the snapshot index (`0` = no snapshot) and the log
/// bounds, decide whether the log may be used as is, can be repaired by
/// re-anchoring an empty log, or has lost entries.
///
/// `reset` is only invoked in the repair case, with `snapshot_index + 1`.
pub fn verify_snapshot_log_consistent<E>(
    snapshot_index: u64,
    first_index: u64,
    is_empty: bool,
    reset: impl FnOnce(u64) -> Result<(), E>,
) -> Result<ConsistencyResult, E> {
    let gap = first_index > snapshot_index + 1;
    if !gap {
        return Ok(ConsistencyResult::Consistent);
    }
    if is_empty {
        let new_first_index = snapshot_index + 1;
        reset(new_first_index)?;
        return Ok(ConsistencyResult::RepairedByReset(new_first_index));
    }
    Ok(ConsistencyResult::Inconsistent(format!(
        "log starts at index {} but the latest snapshot only covers up to {}; entries {}..{} are lost (data loss)",
        first_index,
        snapshot_index,
        snapshot_index + 1,
        first_index
    )))
}

/// A persisted commit index must still be covered by the log or the
/// snapshot; anything above both has been committed and then lost.
pub fn verify_commit_retained(
    persisted_commit: u64,
    last_index: u64,
    snapshot_index: u64,
) -> ConsistencyResult {
    let retained = last_index.max(snapshot_index);
    if persisted_commit <= retained {
        return ConsistencyResult::Consistent;
    }
    ConsistencyResult::Inconsistent(format!(
        "commit index {} was persisted but log and snapshot only reach {}; committed entries {}..={} are lost (data loss)",
        persisted_commit,
        retained,
        retained + 1,
        persisted_commit
    ))
}

/// Runs the snapshot/log check against a partition's log.
#[derive(Debug, Clone, Default)]
pub struct ConsistencyChecker {
    /// Also require the log's term at the snapshot index to match the
    /// snapshot term when the two overlap.
    pub verify_snapshot_term: bool,
}

impl ConsistencyChecker {
    pub fn new(verify_snapshot_term: bool) -> Self {
        Self {
            verify_snapshot_term,
        }
    }

    pub fn check(
        &self,
        partition: &RaftId,
        log: &mut ReplicatedLog,
        snapshot_index: u64,
        snapshot_term: u64,
    ) -> Result<ConsistencyResult, ConsistencyError> {
        let first_index = log.first_index();
        let is_empty = log.is_empty();

        let result = verify_snapshot_log_consistent(snapshot_index, first_index, is_empty, |idx| {
            warn!(
                "Partition {} log is empty and starts at {}, resetting it to {} after snapshot {}",
                partition, first_index, idx, snapshot_index
            );
            log.reset_to(idx)
        })
        .map_err(|source: LogError| ConsistencyError::ResetFailed {
            partition: partition.clone(),
            source,
        })?;

        let result = match result {
            ConsistencyResult::Consistent if self.verify_snapshot_term => {
                self.check_term(log, snapshot_index, snapshot_term)
            }
            other => other,
        };

        match &result {
            ConsistencyResult::Consistent => info!(
                "Partition {} consistent: snapshot {} log [{}, {}]",
                partition,
                snapshot_index,
                log.first_index(),
                log.last_index()
            ),
            ConsistencyResult::RepairedByReset(idx) => {
                info!("Partition {} repaired, log now starts at {}", partition, idx)
            }
            ConsistencyResult::Inconsistent(reason) => {
                error!("Partition {} is inconsistent: {}", partition, reason)
            }
        }
        Ok(result)
    }

    /// Runs [`verify_commit_retained`] and logs a loss.
    pub fn check_commit(
        &self,
        partition: &RaftId,
        persisted_commit: u64,
        last_index: u64,
        snapshot_index: u64,
    ) -> ConsistencyResult {
        let result = verify_commit_retained(persisted_commit, last_index, snapshot_index);
        if let ConsistencyResult::Inconsistent(reason) = &result {
            error!("Partition {} is inconsistent: {}", partition, reason);
        }
        result
    }

    fn check_term(
        &self,
        log: &ReplicatedLog,
        snapshot_index: u64,
        snapshot_term: u64,
    ) -> ConsistencyResult {
        if snapshot_index == 0
            || log.is_empty()
            || snapshot_index < log.first_index()
            || snapshot_index > log.last_index()
        {
            return ConsistencyResult::Consistent;
        }
        match log.term_at(snapshot_index) {
            Some(term) if term == snapshot_term => ConsistencyResult::Consistent,
            Some(term) => ConsistencyResult::Inconsistent(format!(
                "log has term {} at snapshot index {}, snapshot term is {}",
                term, snapshot_index, snapshot_term
            )),
            None => ConsistencyResult::Consistent,
        }
    }
}
