//! Client writes and applying committed entries

use tracing::{debug, trace};

use super::{RaftState, RoleState};
use crate::error::{ApplyError, ClientError};
use crate::event::PartitionHealth;
use crate::message::EntryKind;
use crate::traits::{ClientResult, StateMachine};

impl RaftState {
    /// 处理客户端写入：仅 Leader 接受
    ///
    /// Appends a block covering `[lowest_position, highest_position]` and
    /// returns its `(index, term)`. The entry is flushed locally before the
    /// call returns; commitment is observed through the log's commit watch.
    pub async fn propose(
        &mut self,
        lowest_position: u64,
        highest_position: u64,
        data: Vec<u8>,
    ) -> ClientResult<(u64, u64)> {
        if let PartitionHealth::Dead(reason) = &self.health {
            return Err(ClientError::Unavailable(reason.clone()));
        }
        match &self.role {
            RoleState::Leader(_) => {}
            RoleState::Follower { leader } => return Err(ClientError::NotLeader(leader.clone())),
            RoleState::Candidate { .. } => return Err(ClientError::NotLeader(None)),
        }

        let term = self.current_term;
        let kind = EntryKind::application(lowest_position, highest_position);
        let appended = self.log.append(term, kind, data);
        if let Err(err) = &appended {
            self.error_handler
                .handle_void(Err(err.clone()), "append", None);
        }
        let index = match appended {
            Ok(index) => index,
            Err(err) => {
                self.check_fatal().await;
                return Err(err.into());
            }
        };
        let flushed = self.log.flush();
        if let Err(err) = &flushed {
            self.error_handler
                .handle_void(Err(err.clone()), "flush_log", None);
            self.check_fatal().await;
        }
        flushed?;

        trace!(
            "Node {} appended entry {} for positions [{}, {}]",
            self.id, index, lowest_position, highest_position
        );
        self.update_commit_index().await;
        self.broadcast_append_entries().await;
        self.check_fatal().await;
        Ok((index, term))
    }

    /// 按顺序把已提交的日志应用到状态机
    pub(crate) async fn apply_committed_logs(&mut self) {
        let commit_index = self.log.commit_index();
        if self.last_applied >= commit_index {
            return;
        }

        let batch_size = self.options.apply_batch_size.max(1);
        let mut in_batch = 0;
        while self.last_applied < commit_index {
            let index = self.last_applied + 1;
            let read = self.log.entry_at(index);
            let Some(entry) = self.error_handler.handle(read, "read_committed_entry", None) else {
                self.schedule_apply();
                break;
            };

            let result = self.callbacks.apply(&self.id, &entry).await;
            match result {
                Ok(()) => self.last_applied = index,
                Err(ApplyError::Busy) => {
                    debug!(
                        "Node {} state machine busy at {}, retrying later",
                        self.id, index
                    );
                    self.schedule_apply();
                    break;
                }
                Err(err) => {
                    self.error_handler.handle_void(Err(err), "apply", None);
                    return;
                }
            }

            in_batch += 1;
            if in_batch >= batch_size {
                in_batch = 0;
                tokio::task::yield_now().await;
            }
        }

        trace!(
            "Node {} applied up to {} (commit {})",
            self.id, self.last_applied, commit_index
        );
        self.persist_state();
        self.maybe_take_snapshot().await;
    }
}
