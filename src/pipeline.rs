use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::state::RaftStateOptions;
use crate::types::{RaftId, RequestId};

/// 快照传输进度（Leader 向单个 follower 发送分块快照）
#[derive(Debug, Clone)]
pub struct SnapshotTransfer {
    pub index: u64,
    pub term: u64,
    /// Offset of the next chunk to send.
    pub offset: u64,
    pub request_id: Option<RequestId>,
    pub sent_at: Option<Instant>,
}

/// Leader-side replication state of one follower.
#[derive(Debug, Clone)]
pub struct PeerProgress {
    pub next_index: u64,
    pub match_index: u64,
    /// request_id -> (last index carried, send time)
    inflight: HashMap<RequestId, (u64, Instant)>,
    /// Last time the peer answered anything for the current term.
    pub last_ack: Option<Instant>,
    /// Consecutive send failures, reset by any response.
    failures: u64,
    retry_at: Option<Instant>,
    pub snapshot: Option<SnapshotTransfer>,
}

impl PeerProgress {
    fn new(next_index: u64) -> Self {
        Self {
            next_index,
            match_index: 0,
            inflight: HashMap::new(),
            last_ack: None,
            failures: 0,
            retry_at: None,
            snapshot: None,
        }
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }
}

/// Pipeline 状态管理器：每个 peer 的复制进度、InFlight 限制、超时与退避
pub struct PipelineState {
    peers: HashMap<RaftId, PeerProgress>,
    max_inflight_requests: usize,
    request_timeout: Duration,
    backoff_min: Duration,
    backoff_max: Duration,
}

impl PipelineState {
    pub fn new(options: &RaftStateOptions) -> Self {
        Self {
            peers: HashMap::new(),
            max_inflight_requests: options.max_inflight_requests.max(1),
            request_timeout: options.request_timeout,
            backoff_min: options.backoff_min,
            backoff_max: options.backoff_max,
        }
    }

    /// Starts tracking `peers` for a fresh leadership term.
    pub fn reset<'a>(&mut self, peers: impl IntoIterator<Item = &'a RaftId>, next_index: u64) {
        self.peers = peers
            .into_iter()
            .map(|p| (p.clone(), PeerProgress::new(next_index)))
            .collect();
    }

    pub fn add_peer(&mut self, peer: &RaftId, next_index: u64) {
        self.peers
            .entry(peer.clone())
            .or_insert_with(|| PeerProgress::new(next_index));
    }

    pub fn remove_peer(&mut self, peer: &RaftId) {
        self.peers.remove(peer);
    }

    pub fn peers(&self) -> impl Iterator<Item = &RaftId> {
        self.peers.keys()
    }

    pub fn progress(&self, peer: &RaftId) -> Option<&PeerProgress> {
        self.peers.get(peer)
    }

    pub fn progress_mut(&mut self, peer: &RaftId) -> Option<&mut PeerProgress> {
        self.peers.get_mut(peer)
    }

    pub fn match_indexes(&self) -> impl Iterator<Item = u64> + '_ {
        self.peers.values().map(|p| p.match_index)
    }

    /// 检查是否可以向peer发送请求（InFlight限制 + 退避）
    pub fn can_send_to_peer(&self, peer: &RaftId, now: Instant) -> bool {
        let Some(progress) = self.peers.get(peer) else {
            return false;
        };
        if let Some(retry_at) = progress.retry_at {
            if now < retry_at {
                trace!("Peer {} backing off for {:?}", peer, retry_at - now);
                return false;
            }
        }
        progress.inflight.len() < self.max_inflight_requests
    }

    /// 记录 InFlight 请求，并乐观地推进 next_index
    pub fn track_inflight_request(
        &mut self,
        peer: &RaftId,
        request_id: RequestId,
        last_index: u64,
        now: Instant,
    ) {
        if let Some(progress) = self.peers.get_mut(peer) {
            progress.inflight.insert(request_id, (last_index, now));
            progress.next_index = progress.next_index.max(last_index + 1);
        }
    }

    /// Removes a tracked request. Returns false for unknown (stale or
    /// expired) request ids.
    pub fn complete_request(&mut self, peer: &RaftId, request_id: RequestId, now: Instant) -> bool {
        let Some(progress) = self.peers.get_mut(peer) else {
            return false;
        };
        progress.last_ack = Some(now);
        progress.failures = 0;
        progress.retry_at = None;
        progress.inflight.remove(&request_id).is_some()
    }

    /// Registers a failed send and schedules the next attempt with
    /// exponential back-off.
    pub fn record_send_failure(&mut self, peer: &RaftId, request_id: Option<RequestId>, now: Instant) {
        let Some(progress) = self.peers.get_mut(peer) else {
            return;
        };
        if let Some(request_id) = request_id {
            progress.inflight.remove(&request_id);
        }
        progress.failures += 1;
        let exp = progress.failures.saturating_sub(1).min(16) as u32;
        let delay = self
            .backoff_min
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max);
        progress.retry_at = Some(now + delay);

        // 前三次以及之后每 100 次才记录，避免刷屏
        if progress.failures <= 3 || progress.failures % 100 == 0 {
            warn!(
                "Peer {} unreachable ({} consecutive failures), retrying in {:?}",
                peer, progress.failures, delay
            );
        }
    }

    /// Leader 回退：follower 拒绝后从 conflict_index 重新开始
    pub fn on_rejection(&mut self, peer: &RaftId, conflict_index: u64) {
        if let Some(progress) = self.peers.get_mut(peer) {
            // Pipelined requests sent past the conflict are void.
            progress.inflight.clear();
            progress.next_index = conflict_index.max(progress.match_index + 1).max(1);
            debug!("Peer {} next_index backed up to {}", peer, progress.next_index);
        }
    }

    /// 周期性超时检查 - 在心跳时调用
    pub fn periodic_timeout_check(&mut self, now: Instant) {
        for (peer, progress) in self.peers.iter_mut() {
            let before = progress.inflight.len();
            let timeout = self.request_timeout;
            progress
                .inflight
                .retain(|_, (_, sent)| now.duration_since(*sent) <= timeout);
            let expired = before - progress.inflight.len();
            if expired > 0 {
                debug!("Expired {} inflight requests to {}", expired, peer);
                // Resend from what is known to match.
                progress.next_index = progress.match_index + 1;
            }
            if let Some(snapshot) = progress.snapshot.as_mut() {
                if let Some(sent_at) = snapshot.sent_at {
                    if now.duration_since(sent_at) > timeout {
                        snapshot.request_id = None;
                        snapshot.sent_at = None;
                    }
                }
            }
        }
    }

    /// Number of peers that answered within `lease` of `now`.
    pub fn acked_within(&self, now: Instant, lease: Duration) -> usize {
        self.peers
            .values()
            .filter(|p| p.last_ack.is_some_and(|t| now.duration_since(t) <= lease))
            .count()
    }

    /// 获取当前 InFlight 请求总数
    pub fn get_inflight_request_count(&self) -> usize {
        self.peers.values().map(|p| p.inflight.len()).sum()
    }
}
