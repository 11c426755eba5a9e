//! Election handling for the partition state machine

use std::collections::BTreeSet;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{LeaderState, RaftState, RoleState};
use crate::message::{EntryKind, RequestVoteRequest, RequestVoteResponse};
use crate::pipeline::PipelineState;
use crate::traits::Network;
use crate::types::{RaftId, RequestId};

impl RaftState {
    /// 处理选举超时
    pub(crate) async fn handle_election_timeout(&mut self) {
        self.election_timer = None;
        if matches!(self.role, RoleState::Leader(_)) {
            debug!("Node {} is the leader and will not start a new election", self.id);
            return;
        }
        if !self.is_voter() {
            warn!("Node {} is not a voter and cannot start an election", self.id);
            return;
        }

        info!(
            "Node {} starting election for term {}",
            self.id,
            self.current_term + 1
        );

        // 递增任期并投票给自己，先持久化再发送请求
        self.current_term += 1;
        self.voted_for = Some(self.id.node.clone());
        self.log.observe_term(self.current_term);
        if !self.persist_state() {
            return;
        }

        let election_id = RequestId::new();
        let mut votes = BTreeSet::new();
        votes.insert(self.id.clone());
        self.role = RoleState::Candidate { election_id, votes };
        self.reset_election_timer();
        self.notify_state_changed().await;
        self.update_readiness().await;

        if self.quorum() <= 1 {
            self.become_leader().await;
            return;
        }

        let request = RequestVoteRequest {
            term: self.current_term,
            candidate_id: self.id.clone(),
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
            request_id: election_id,
        };

        let peers = self.peers();
        let from = &self.id;
        let callbacks = &self.callbacks;
        let sends = peers.iter().map(|peer| {
            let request = request.clone();
            async move {
                let result = callbacks
                    .send_request_vote_request(from, peer, request)
                    .await;
                (peer, result)
            }
        });
        let results = join_all(sends).await;
        for (peer, result) in results {
            self.error_handler
                .handle_void(result, "send_request_vote_request", Some(peer));
        }
    }

    /// 处理投票请求
    pub(crate) async fn handle_request_vote(&mut self, sender: RaftId, request: RequestVoteRequest) {
        if request.candidate_id.partition != self.id.partition {
            warn!(
                "Node {} dropping vote request for another partition from {}",
                self.id, request.candidate_id
            );
            return;
        }

        if request.term > self.current_term {
            info!(
                "Node {} saw term {} from candidate {}, stepping down",
                self.id, request.term, request.candidate_id
            );
            self.become_follower(request.term, None).await;
            if self.error_handler.is_fatal() {
                return;
            }
        }

        // 日志至少和自己一样新才投票
        let last_log_term = self.last_log_term();
        let last_log_index = self.last_log_index();
        let log_ok = request.last_log_term > last_log_term
            || (request.last_log_term == last_log_term
                && request.last_log_index >= last_log_index);
        let can_vote = match &self.voted_for {
            None => true,
            Some(node) => *node == request.candidate_id.node,
        };
        let not_leading = !matches!(self.role, RoleState::Leader(_));

        let vote_granted =
            request.term == self.current_term && can_vote && log_ok && not_leading;
        if vote_granted {
            self.voted_for = Some(request.candidate_id.node.clone());
            if !self.persist_state() {
                return;
            }
            self.reset_election_timer();
            info!(
                "Node {} voted for {} in term {}",
                self.id, request.candidate_id, self.current_term
            );
        } else {
            debug!(
                "Node {} rejected vote for {} in term {} (log_ok={}, voted_for={:?})",
                self.id, request.candidate_id, request.term, log_ok, self.voted_for
            );
        }

        let response = RequestVoteResponse {
            term: self.current_term,
            vote_granted,
            request_id: request.request_id,
        };
        let result = self
            .callbacks
            .send_request_vote_response(&self.id, &sender, response)
            .await;
        self.error_handler
            .handle_void(result, "send_request_vote_response", Some(&sender));
    }

    /// 处理投票响应
    pub(crate) async fn handle_request_vote_response(
        &mut self,
        sender: RaftId,
        response: RequestVoteResponse,
    ) {
        if response.term > self.current_term {
            self.become_follower(response.term, None).await;
            return;
        }
        if !self.voters.contains(&sender) {
            return;
        }

        let quorum = self.quorum();
        let current_term = self.current_term;
        let won = match &mut self.role {
            RoleState::Candidate { election_id, votes }
                if *election_id == response.request_id && response.term == current_term =>
            {
                if response.vote_granted {
                    votes.insert(sender.clone());
                    debug!(
                        "Node {} got vote from {} ({}/{})",
                        self.id,
                        sender,
                        votes.len(),
                        quorum
                    );
                }
                votes.len() >= quorum
            }
            _ => false,
        };
        if won {
            self.become_leader().await;
        }
    }

    /// 成为 Leader：追加本任期的 Initial 日志并立即广播
    pub(crate) async fn become_leader(&mut self) {
        info!(
            "Node {} becoming leader for term {}",
            self.id, self.current_term
        );
        self.cancel_election_timer();

        let appended = self
            .log
            .append(self.current_term, EntryKind::Initial, Vec::new());
        let Some(term_start_index) = self
            .error_handler
            .handle(appended, "append_initial_entry", None)
        else {
            return;
        };
        let flushed = self.log.flush();
        if !self.error_handler.handle_void(flushed, "flush_log", None) {
            return;
        }

        let mut pipeline = PipelineState::new(&self.options);
        let peers = self.peers();
        pipeline.reset(peers.iter(), term_start_index);
        self.role = RoleState::Leader(LeaderState {
            pipeline,
            term_start_index,
            elected_at: Instant::now(),
        });

        self.reset_heartbeat_timer();
        self.notify_state_changed().await;
        self.update_commit_index().await;
        self.broadcast_append_entries().await;
    }
}
