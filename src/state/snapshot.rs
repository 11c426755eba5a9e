//! Snapshot handling for the partition state machine

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{RaftState, RoleState};
use crate::consistency::ConsistencyResult;
use crate::error::SnapshotError;
use crate::message::{InstallSnapshotRequest, InstallSnapshotResponse};
use crate::pipeline::SnapshotTransfer;
use crate::storage::ReceivedSnapshot;
use crate::traits::{Network, StateMachine};
use crate::types::{RaftId, RequestId};

/// `next_offset` answered for a snapshot the follower already covers.
const SNAPSHOT_ALREADY_COVERED: u64 = u64::MAX;

impl RaftState {
    /// 生成快照并压缩日志
    pub(crate) async fn create_snapshot(&mut self) {
        let index = self.last_applied;
        if index == 0 || index <= self.snapshots.latest_index() {
            debug!(
                "Node {} skipping snapshot: applied {} latest {}",
                self.id,
                index,
                self.snapshots.latest_index()
            );
            return;
        }
        let Some(term) = self.term_at(index) else {
            warn!("Node {} has no term for applied index {}", self.id, index);
            return;
        };

        let data = self.callbacks.take_snapshot(&self.id, index, term).await;
        let Some(data) = self.error_handler.handle(data, "take_snapshot", None) else {
            return;
        };
        let taken = self.snapshots.take_snapshot(index, term, &data);
        let Some(meta) = self
            .error_handler
            .handle(taken, "persist_snapshot", None)
        else {
            return;
        };
        info!(
            "Node {} took snapshot at index {} term {} ({} bytes)",
            self.id, meta.index, meta.term, meta.size
        );

        let compacted = self.log.compact(meta.index);
        if let Some(segments) = self.error_handler.handle(compacted, "compact_log", None) {
            if segments > 0 {
                info!(
                    "Node {} compacted {} segments up to {}",
                    self.id, segments, meta.index
                );
            }
        }
    }

    /// Takes a snapshot once enough entries were applied since the last one.
    pub(crate) async fn maybe_take_snapshot(&mut self) {
        let threshold = self.options.snapshot_threshold;
        if threshold == 0 {
            return;
        }
        if self.last_applied.saturating_sub(self.snapshots.latest_index()) >= threshold {
            self.create_snapshot().await;
        }
    }

    /// 准备下一个快照分块（Leader 侧）
    pub(crate) fn prepare_snapshot_chunk(
        &mut self,
        peer: &RaftId,
        now: Instant,
    ) -> Option<InstallSnapshotRequest> {
        let Some(meta) = self.snapshots.latest().cloned() else {
            warn!("Node {} has no snapshot to send to {}", self.id, peer);
            return None;
        };
        let chunk_size = self.options.snapshot_chunk_size.max(1);

        let RoleState::Leader(leader) = &mut self.role else {
            return None;
        };
        let progress = leader.pipeline.progress_mut(peer)?;
        let transfer = progress.snapshot.get_or_insert_with(|| {
            info!(
                "Starting snapshot transfer {}-{} to {}",
                meta.index, meta.term, peer
            );
            SnapshotTransfer {
                index: meta.index,
                term: meta.term,
                offset: 0,
                request_id: None,
                sent_at: None,
            }
        });
        if transfer.index != meta.index || transfer.term != meta.term {
            info!(
                "Restarting snapshot transfer to {} with newer snapshot {}-{}",
                peer, meta.index, meta.term
            );
            *transfer = SnapshotTransfer {
                index: meta.index,
                term: meta.term,
                offset: 0,
                request_id: None,
                sent_at: None,
            };
        }
        if transfer.request_id.is_some() {
            // 等待上一个分块的确认
            return None;
        }
        let offset = transfer.offset;

        let chunk = match self.snapshots.read_chunk(&meta, offset, chunk_size) {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(
                    "Failed to read snapshot {}-{} at {} for {}: {}",
                    meta.index, meta.term, offset, peer, err
                );
                progress.snapshot = None;
                return None;
            }
        };
        let done = offset + chunk.len() as u64 >= meta.size;
        let request_id = RequestId::new();
        if let Some(transfer) = progress.snapshot.as_mut() {
            transfer.request_id = Some(request_id);
            transfer.sent_at = Some(now);
        }

        Some(InstallSnapshotRequest {
            term: self.current_term,
            leader_id: self.id.clone(),
            last_included_index: meta.index,
            last_included_term: meta.term,
            offset,
            chunk,
            done,
            request_id,
        })
    }

    /// 处理快照分块（Follower 侧）
    pub(crate) async fn handle_install_snapshot(
        &mut self,
        sender: RaftId,
        request: InstallSnapshotRequest,
    ) {
        if request.term < self.current_term {
            self.send_snapshot_response(&sender, false, 0, request.request_id)
                .await;
            return;
        }
        let following = matches!(
            &self.role,
            RoleState::Follower { leader: Some(leader) } if *leader == request.leader_id
        );
        if request.term > self.current_term || !following {
            self.become_follower(request.term, Some(request.leader_id.clone()))
                .await;
            if self.error_handler.is_fatal() {
                return;
            }
        } else {
            self.reset_election_timer();
        }

        let index = request.last_included_index;
        let term = request.last_included_term;
        if index <= self.log.commit_index() {
            debug!(
                "Node {} already covers snapshot {} (commit {})",
                self.id,
                index,
                self.log.commit_index()
            );
            self.abort_pending_snapshot();
            self.send_snapshot_response(
                &sender,
                true,
                SNAPSHOT_ALREADY_COVERED,
                request.request_id,
            )
            .await;
            return;
        }

        // 不同快照 ID：放弃旧的接收进度
        if self
            .pending_snapshot
            .as_ref()
            .is_some_and(|p| p.index() != index || p.term() != term)
        {
            info!(
                "Node {} switching to snapshot {}-{}, dropping the previous one",
                self.id, index, term
            );
            self.abort_pending_snapshot();
        }
        if self.pending_snapshot.is_none() {
            if request.offset != 0 {
                self.send_snapshot_response(&sender, false, 0, request.request_id)
                    .await;
                return;
            }
            let begun = self.snapshots.begin_received(index, term);
            let Some(received) = self
                .error_handler
                .handle(begun, "begin_received_snapshot", None)
            else {
                return;
            };
            self.pending_snapshot = Some(received);
        }

        let Some(pending) = self.pending_snapshot.as_mut() else {
            return;
        };
        let next_offset = match pending.write_chunk(request.offset, &request.chunk) {
            Ok(()) => pending.next_offset(),
            Err(SnapshotError::ChunkOutOfOrder { expected, actual }) => {
                debug!(
                    "Node {} snapshot chunk at {} out of order, expecting {}",
                    self.id, actual, expected
                );
                self.send_snapshot_response(&sender, false, expected, request.request_id)
                    .await;
                return;
            }
            Err(err) => {
                self.error_handler
                    .handle_void(Err(err), "write_snapshot_chunk", None);
                self.abort_pending_snapshot();
                self.send_snapshot_response(&sender, false, 0, request.request_id)
                    .await;
                return;
            }
        };

        if !request.done {
            self.send_snapshot_response(&sender, true, next_offset, request.request_id)
                .await;
            return;
        }

        let Some(received) = self.pending_snapshot.take() else {
            return;
        };
        if self.install_received(received).await {
            self.send_snapshot_response(&sender, true, next_offset, request.request_id)
                .await;
            self.update_readiness().await;
        } else if !self.error_handler.is_fatal() {
            self.send_snapshot_response(&sender, false, 0, request.request_id)
                .await;
        }
    }

    /// Installs a fully received snapshot. The snapshot is committed first and
    /// only then is the log reset behind it, so a crash in between leaves the
    /// new snapshot plus the old log, which `open` brings in line.
    async fn install_received(&mut self, received: ReceivedSnapshot) -> bool {
        let persisted = self.snapshots.persist_received(received);
        let Some(meta) = self
            .error_handler
            .handle(persisted, "persist_received_snapshot", None)
        else {
            return false;
        };

        // 快照之后日志从 index + 1 重新开始
        let reconciled = self.log.reset_on_snapshot(meta.index + 1);
        if !self
            .error_handler
            .handle_void(reconciled, "reconcile_log_with_snapshot", None)
        {
            return false;
        }

        let loaded = self.snapshots.load(&meta);
        let Some(snapshot) = self.error_handler.handle(loaded, "load_snapshot", None) else {
            return false;
        };

        let restored = self
            .callbacks
            .restore_snapshot(&self.id, meta.index, meta.term, snapshot.data)
            .await;
        if !self
            .error_handler
            .handle_void(restored, "restore_snapshot", None)
        {
            return false;
        }
        self.last_applied = meta.index;
        if !self.persist_state() {
            return false;
        }

        match self
            .checker
            .check(&self.id, &mut self.log, meta.index, meta.term)
        {
            Ok(ConsistencyResult::Inconsistent(reason)) => {
                error!(
                    "Node {} inconsistent after installing snapshot {}: {}",
                    self.id, meta.index, reason
                );
                self.enter_dead(reason).await;
                return false;
            }
            Ok(_) => {}
            Err(err) => {
                self.error_handler
                    .handle_void(Err(err), "consistency_check", None);
                return false;
            }
        }

        info!(
            "Node {} installed snapshot at index {} term {}",
            self.id, meta.index, meta.term
        );
        true
    }

    fn abort_pending_snapshot(&mut self) {
        if let Some(pending) = self.pending_snapshot.take() {
            pending.abort();
        }
    }

    async fn send_snapshot_response(
        &mut self,
        target: &RaftId,
        success: bool,
        next_offset: u64,
        request_id: RequestId,
    ) {
        let response = InstallSnapshotResponse {
            term: self.current_term,
            success,
            next_offset,
            request_id,
        };
        let result = self
            .callbacks
            .send_install_snapshot_response(&self.id, target, response)
            .await;
        self.error_handler
            .handle_void(result, "send_install_snapshot_response", Some(target));
    }

    /// 处理快照分块响应（Leader 侧）
    pub(crate) async fn handle_install_snapshot_response(
        &mut self,
        sender: RaftId,
        response: InstallSnapshotResponse,
    ) {
        if response.term > self.current_term {
            self.become_follower(response.term, None).await;
            return;
        }
        if response.term < self.current_term {
            return;
        }

        let latest = self.snapshots.latest().map(|m| (m.index, m.term, m.size));
        let now = Instant::now();
        let RoleState::Leader(leader) = &mut self.role else {
            return;
        };
        leader
            .pipeline
            .complete_request(&sender, response.request_id, now);
        let Some(progress) = leader.pipeline.progress_mut(&sender) else {
            return;
        };
        let Some(transfer) = progress.snapshot.as_mut() else {
            return;
        };
        if transfer.request_id != Some(response.request_id) {
            debug!("Ignoring stale snapshot response from {}", sender);
            return;
        }
        transfer.request_id = None;
        transfer.sent_at = None;

        let size = match latest {
            Some((index, term, size)) if index == transfer.index && term == transfer.term => size,
            _ => {
                transfer.offset = 0;
                return;
            }
        };

        let mut completed = false;
        if response.success && response.next_offset >= size {
            let index = transfer.index;
            progress.snapshot = None;
            progress.match_index = progress.match_index.max(index);
            progress.next_index = progress.match_index + 1;
            completed = true;
            info!("Snapshot {} delivered to {}", index, sender);
        } else {
            transfer.offset = response.next_offset.min(size);
        }

        if completed {
            self.update_commit_index().await;
        }
        self.replicate_to(&sender).await;
    }
}
