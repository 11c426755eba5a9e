use std::sync::atomic::{AtomicBool, Ordering};

use bincode::{Decode, Encode};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::ApplyError;
use crate::message::LogEntry;
use crate::traits::ApplyResult;
use crate::types::RaftId;

/// One application block applied to the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct AppliedBlock {
    pub index: u64,
    pub term: u64,
    pub lowest_position: u64,
    pub highest_position: u64,
    pub payload: Vec<u8>,
}

/// 状态机内容，快照即其编码
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct MemoryState {
    pub applied_index: u64,
    pub applied_term: u64,
    pub blocks: Vec<AppliedBlock>,
}

/// In-memory state machine that records every applied block.
#[derive(Default)]
pub struct MemoryStateMachine {
    state: Mutex<MemoryState>,
    busy: AtomicBool,
    restores: Mutex<Vec<(u64, u64)>>,
}

impl MemoryStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// While busy, `apply` answers `ApplyError::Busy`.
    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }

    pub fn applied_index(&self) -> u64 {
        self.state.lock().applied_index
    }

    pub fn blocks(&self) -> Vec<AppliedBlock> {
        self.state.lock().blocks.clone()
    }

    pub fn state(&self) -> MemoryState {
        self.state.lock().clone()
    }

    /// `(index, term)` of every snapshot restored so far.
    pub fn restores(&self) -> Vec<(u64, u64)> {
        self.restores.lock().clone()
    }

    pub fn apply(&self, from: &RaftId, entry: &LogEntry) -> ApplyResult<()> {
        if self.busy.load(Ordering::Acquire) {
            return Err(ApplyError::Busy);
        }
        let mut state = self.state.lock();
        if entry.index <= state.applied_index {
            // 重放已应用的条目
            return Ok(());
        }
        if entry.index != state.applied_index + 1 {
            return Err(ApplyError::Internal(format!(
                "{} applied {} but received {}",
                from, state.applied_index, entry.index
            )));
        }
        if let Some((lowest_position, highest_position)) = entry.kind.positions() {
            state.blocks.push(AppliedBlock {
                index: entry.index,
                term: entry.term,
                lowest_position,
                highest_position,
                payload: entry.payload.clone(),
            });
        }
        state.applied_index = entry.index;
        state.applied_term = entry.term;
        Ok(())
    }

    pub fn take_snapshot(&self, from: &RaftId, index: u64, term: u64) -> ApplyResult<Vec<u8>> {
        let state = self.state.lock();
        if state.applied_index != index {
            return Err(ApplyError::Internal(format!(
                "{} asked for snapshot at {} while applied {}",
                from, index, state.applied_index
            )));
        }
        debug!("{} snapshot at {} term {}", from, index, term);
        bincode::encode_to_vec(&*state, bincode::config::standard())
            .map_err(|e| ApplyError::Internal(e.to_string()))
    }

    pub fn restore_snapshot(
        &self,
        from: &RaftId,
        index: u64,
        term: u64,
        data: Vec<u8>,
    ) -> ApplyResult<()> {
        let (restored, _): (MemoryState, usize) =
            bincode::decode_from_slice(&data, bincode::config::standard())
                .map_err(|e| ApplyError::Internal(e.to_string()))?;
        if restored.applied_index != index {
            return Err(ApplyError::Internal(format!(
                "{} snapshot data covers {} not {}",
                from, restored.applied_index, index
            )));
        }
        *self.state.lock() = restored;
        self.restores.lock().push((index, term));
        Ok(())
    }
}
