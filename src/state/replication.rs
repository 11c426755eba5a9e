//! Log replication handling for the partition state machine

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::{RaftState, RoleState};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, LogEntry,
};
use crate::traits::Network;
use crate::types::{RaftId, RequestId};

/// Result of matching a leader's AppendEntries against the local log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Everything up to `match_index` matches the leader and is flushed.
    Accepted { match_index: u64 },
    /// The leader should retry from `conflict_index`.
    Rejected { conflict_index: u64 },
}

/// 待发送给某个 follower 的请求
pub(crate) enum Outgoing {
    Append(AppendEntriesRequest),
    Snapshot(InstallSnapshotRequest),
}

impl Outgoing {
    fn request_id(&self) -> RequestId {
        match self {
            Outgoing::Append(req) => req.request_id,
            Outgoing::Snapshot(req) => req.request_id,
        }
    }
}

impl RaftState {
    /// 处理心跳超时
    pub(crate) async fn handle_heartbeat_timeout(&mut self) {
        self.heartbeat_timer = None;
        let now = Instant::now();
        let lease = self.options.lease_timeout;
        let quorum = self.quorum();
        let RoleState::Leader(leader) = &mut self.role else {
            return;
        };

        // 租约：一段时间内未获得多数派确认则主动退位
        if now.duration_since(leader.elected_at) >= lease
            && leader.pipeline.acked_within(now, lease) + 1 < quorum
        {
            warn!(
                "Node {} lost contact with a majority for {:?}, stepping down in term {}",
                self.id, lease, self.current_term
            );
            self.become_follower(self.current_term, None).await;
            return;
        }

        leader.pipeline.periodic_timeout_check(now);
        self.broadcast_append_entries().await;
        self.reset_heartbeat_timer();
    }

    /// 广播 AppendEntries（或快照分块）给所有 follower
    pub(crate) async fn broadcast_append_entries(&mut self) {
        let peers: Vec<RaftId> = match &self.role {
            RoleState::Leader(leader) => leader.pipeline.peers().cloned().collect(),
            _ => return,
        };
        let now = Instant::now();
        let mut outgoing = Vec::with_capacity(peers.len());
        for peer in peers {
            if let Some(message) = self.prepare_for_peer(&peer, now) {
                outgoing.push((peer, message));
            }
        }
        self.send_outgoing(outgoing, now).await;
    }

    /// Sends the next batch to one follower, if the pipeline allows it.
    pub(crate) async fn replicate_to(&mut self, peer: &RaftId) {
        let now = Instant::now();
        if let Some(message) = self.prepare_for_peer(peer, now) {
            self.send_outgoing(vec![(peer.clone(), message)], now).await;
        }
    }

    fn prepare_for_peer(&mut self, peer: &RaftId, now: Instant) -> Option<Outgoing> {
        let first_index = self.log.first_index();
        let last_index = self.log.last_index();
        let snapshot_index = self.snapshots.latest_index();
        let threshold = self.options.prefer_snapshot_replication_threshold;

        let RoleState::Leader(leader) = &self.role else {
            return None;
        };
        if !leader.pipeline.can_send_to_peer(peer, now) {
            return None;
        }
        let progress = leader.pipeline.progress(peer)?;
        let next_index = progress.next_index;
        let lagging = next_index <= snapshot_index
            && progress.match_index.saturating_add(threshold) < snapshot_index;
        let needs_snapshot = progress.snapshot.is_some()
            || (snapshot_index > 0 && (next_index < first_index || lagging));
        if needs_snapshot {
            return self.prepare_snapshot_chunk(peer, now).map(Outgoing::Snapshot);
        }

        let prev_log_index = next_index - 1;
        let Some(prev_log_term) = self.term_at(prev_log_index) else {
            warn!(
                "Node {} has no term for index {} needed by {}",
                self.id, prev_log_index, peer
            );
            return None;
        };

        let entries = if next_index <= last_index {
            let to = next_index
                .saturating_add(self.options.max_append_entries.max(1) as u64)
                .min(last_index + 1);
            let read = self
                .log
                .entries(next_index, to, self.options.max_append_bytes);
            self.error_handler
                .handle(read, "read_entries", Some(peer))?
        } else {
            Vec::new()
        };

        let request_id = RequestId::new();
        let last_sent = prev_log_index + entries.len() as u64;
        let request = AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.log.commit_index(),
            request_id,
        };
        if let RoleState::Leader(leader) = &mut self.role {
            leader
                .pipeline
                .track_inflight_request(peer, request_id, last_sent, now);
        }
        Some(Outgoing::Append(request))
    }

    pub(crate) async fn send_outgoing(&mut self, outgoing: Vec<(RaftId, Outgoing)>, now: Instant) {
        if outgoing.is_empty() {
            return;
        }
        let from = &self.id;
        let callbacks = &self.callbacks;
        let sends = outgoing.into_iter().map(move |(peer, message)| async move {
            let request_id = message.request_id();
            let is_snapshot = matches!(message, Outgoing::Snapshot(_));
            let result = match message {
                Outgoing::Append(req) => {
                    callbacks
                        .send_append_entries_request(from, &peer, req)
                        .await
                }
                Outgoing::Snapshot(req) => {
                    callbacks
                        .send_install_snapshot_request(from, &peer, req)
                        .await
                }
            };
            (peer, request_id, is_snapshot, result)
        });
        let results = join_all(sends).await;

        let RoleState::Leader(leader) = &mut self.role else {
            return;
        };
        for (peer, request_id, is_snapshot, result) in results {
            let Err(err) = result else {
                continue;
            };
            trace!("Send to {} failed: {}", peer, err);
            leader
                .pipeline
                .record_send_failure(&peer, Some(request_id), now);
            if is_snapshot {
                if let Some(transfer) = leader
                    .pipeline
                    .progress_mut(&peer)
                    .and_then(|p| p.snapshot.as_mut())
                {
                    transfer.request_id = None;
                    transfer.sent_at = None;
                }
            }
        }
    }

    /// 处理 AppendEntries 请求（Follower 侧）
    pub(crate) async fn handle_append_entries_request(
        &mut self,
        sender: RaftId,
        request: AppendEntriesRequest,
    ) {
        if request.term < self.current_term {
            debug!(
                "Node {} rejecting AppendEntries from {} with stale term {} < {}",
                self.id, sender, request.term, self.current_term
            );
            self.send_append_response(&sender, false, 0, None, request.request_id)
                .await;
            return;
        }

        let following = matches!(
            &self.role,
            RoleState::Follower { leader: Some(leader) } if *leader == request.leader_id
        );
        if matches!(self.role, RoleState::Leader(_)) && request.term == self.current_term {
            error!(
                "Node {} received AppendEntries from another leader {} in its own term {}",
                self.id, request.leader_id, request.term
            );
        }
        if request.term > self.current_term || !following {
            self.become_follower(request.term, Some(request.leader_id.clone()))
                .await;
            if self.error_handler.is_fatal() {
                return;
            }
        } else {
            self.reset_election_timer();
        }

        // 收到日志说明 leader 不再发送快照
        if let Some(pending) = self.pending_snapshot.take() {
            info!(
                "Node {} aborting pending snapshot {} on AppendEntries",
                self.id,
                pending.index()
            );
            pending.abort();
        }

        self.leader_commit = request.leader_commit;
        let Some(outcome) = self.append_from_leader(&request) else {
            // 致命错误：不确认
            return;
        };

        match outcome {
            AppendOutcome::Accepted { match_index } => {
                let commit = request.leader_commit.min(match_index);
                if commit > self.log.commit_index() {
                    self.log.set_commit_index(commit);
                }
                self.send_append_response(&sender, true, match_index, None, request.request_id)
                    .await;
                self.apply_committed_logs().await;
            }
            AppendOutcome::Rejected { conflict_index } => {
                self.send_append_response(
                    &sender,
                    false,
                    0,
                    Some(conflict_index),
                    request.request_id,
                )
                .await;
            }
        }
        self.update_readiness().await;
    }

    /// Matches the request against the local log, truncating a conflicting
    /// uncommitted suffix and appending what is missing. Returns `None` when
    /// the log failed fatally.
    pub(crate) fn append_from_leader(&mut self, request: &AppendEntriesRequest) -> Option<AppendOutcome> {
        // 快照之前的日志都已提交，与 leader 一致
        let base = self.log.first_index() - 1;
        let mut prev_index = request.prev_log_index;
        let mut entries: &[LogEntry] = &request.entries;
        let covered_by_snapshot = prev_index < base;
        if covered_by_snapshot {
            let skip = (base - prev_index).min(entries.len() as u64) as usize;
            entries = &entries[skip..];
            prev_index += skip as u64;
            if prev_index < base {
                return Some(AppendOutcome::Accepted { match_index: base });
            }
        }

        let last_index = self.log.last_index();
        if prev_index > last_index {
            return Some(AppendOutcome::Rejected {
                conflict_index: last_index + 1,
            });
        }
        if !covered_by_snapshot {
            let local_term = self.term_at(prev_index);
            if local_term != Some(request.prev_log_term) {
                let conflict_index = self.conflict_hint(prev_index, local_term);
                debug!(
                    "Node {} log mismatch at {} (local {:?}, leader {}), hint {}",
                    self.id, prev_index, local_term, request.prev_log_term, conflict_index
                );
                return Some(AppendOutcome::Rejected { conflict_index });
            }
        }
        if let Some(first) = entries.first() {
            if first.index != prev_index + 1 {
                warn!(
                    "Node {} got entries starting at {} after prev index {}",
                    self.id, first.index, prev_index
                );
                return Some(AppendOutcome::Rejected {
                    conflict_index: self.log.last_index() + 1,
                });
            }
        }

        let mut appended = false;
        for entry in entries {
            if entry.index <= self.log.last_index() {
                if self.term_at(entry.index) == Some(entry.term) {
                    continue;
                }
                // 已提交的日志被要求覆盖时 truncate_from 返回 TruncateCommitted，分区进入 Dead
                info!(
                    "Node {} truncating conflicting entries from {}",
                    self.id, entry.index
                );
                let truncated = self.log.truncate_from(entry.index);
                if !self
                    .error_handler
                    .handle_void(truncated, "truncate_log", None)
                {
                    return None;
                }
            }
            let result = self.log.append_entry(entry.clone());
            self.error_handler.handle(result, "append_entry", None)?;
            appended = true;
        }

        // 先落盘再确认
        if appended {
            let flushed = self.log.flush();
            if !self.error_handler.handle_void(flushed, "flush_log", None) {
                return None;
            }
        }

        Some(AppendOutcome::Accepted {
            match_index: prev_index + entries.len() as u64,
        })
    }

    /// First index of the conflicting term, never inside the committed prefix.
    fn conflict_hint(&self, prev_index: u64, local_term: Option<u64>) -> u64 {
        let floor = (self.log.commit_index() + 1).max(self.log.first_index());
        let Some(term) = local_term else {
            return prev_index.max(floor);
        };
        let mut index = prev_index;
        while index > floor && self.log.term_at(index - 1) == Some(term) {
            index -= 1;
        }
        index.max(floor)
    }

    async fn send_append_response(
        &mut self,
        target: &RaftId,
        success: bool,
        match_index: u64,
        conflict_index: Option<u64>,
        request_id: RequestId,
    ) {
        let response = AppendEntriesResponse {
            term: self.current_term,
            success,
            match_index,
            conflict_index,
            request_id,
        };
        let result = self
            .callbacks
            .send_append_entries_response(&self.id, target, response)
            .await;
        self.error_handler
            .handle_void(result, "send_append_entries_response", Some(target));
    }

    /// 处理 AppendEntries 响应（Leader 侧）
    pub(crate) async fn handle_append_entries_response(
        &mut self,
        sender: RaftId,
        response: AppendEntriesResponse,
    ) {
        if response.term > self.current_term {
            info!(
                "Node {} saw higher term {} from {}, stepping down",
                self.id, response.term, sender
            );
            self.become_follower(response.term, None).await;
            return;
        }
        if response.term < self.current_term {
            return;
        }

        let now = Instant::now();
        let last_index = self.log.last_index();
        let RoleState::Leader(leader) = &mut self.role else {
            return;
        };
        leader
            .pipeline
            .complete_request(&sender, response.request_id, now);

        let resend = if response.success {
            let Some(progress) = leader.pipeline.progress_mut(&sender) else {
                return;
            };
            if response.match_index > progress.match_index {
                progress.match_index = response.match_index.min(last_index);
            }
            progress.next_index = progress.next_index.max(progress.match_index + 1);
            trace!(
                "Node {} peer {} matched up to {}",
                self.id, sender, progress.match_index
            );
            progress.next_index <= last_index || progress.snapshot.is_some()
        } else {
            let Some(progress) = leader.pipeline.progress(&sender) else {
                return;
            };
            let conflict_index = response
                .conflict_index
                .unwrap_or(progress.next_index.saturating_sub(1));
            leader.pipeline.on_rejection(&sender, conflict_index);
            true
        };

        if response.success {
            self.update_commit_index().await;
        }
        if resend {
            self.replicate_to(&sender).await;
        }
    }

    /// 提交规则：多数派已复制且条目属于当前任期
    pub(crate) async fn update_commit_index(&mut self) {
        let RoleState::Leader(leader) = &self.role else {
            return;
        };
        let mut match_indexes: Vec<u64> = leader.pipeline.match_indexes().collect();
        // leader 只计入已落盘的日志
        match_indexes.push(self.log.flushed_index());
        match_indexes.sort_unstable_by(|a, b| b.cmp(a));

        let quorum = self.quorum();
        let Some(&candidate) = match_indexes.get(quorum - 1) else {
            return;
        };
        let commit_index = self.log.commit_index();
        if candidate <= commit_index {
            return;
        }
        if self.term_at(candidate) != Some(self.current_term) {
            trace!(
                "Node {} not committing {} from an earlier term",
                self.id, candidate
            );
            return;
        }

        debug!(
            "Node {} advancing commit index {} -> {}",
            self.id, commit_index, candidate
        );
        self.log.set_commit_index(candidate);
        self.apply_committed_logs().await;
        self.update_readiness().await;
    }
}
