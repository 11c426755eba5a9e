//! Raft 共识状态（单个分区副本）
//!
//! 角色相关逻辑分散在子模块中：选举、日志复制、快照、客户端写入。
//! 所有状态只由分区 actor 串行修改。

mod client;
mod election;
mod replication;
mod snapshot;

pub use replication::AppendOutcome;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::consistency::{ConsistencyChecker, ConsistencyResult};
use crate::error::CallbackErrorHandler;
use crate::event::{Event, PartitionHealth, Role};
use crate::message::PersistentState;
use crate::pipeline::PipelineState;
use crate::storage::{FileSnapshotStore, MetaStore, ReceivedSnapshot, ReplicatedLog};
use crate::traits::{
    EventNotify, MembershipProvider, RaftCallbacks, RaftResult, StateMachine, TimerService,
};
use crate::types::{NodeId, RaftId, RequestId, TimerId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftStateOptions {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    /// Leader 在该时间内未获得多数派确认则退位
    pub lease_timeout: Duration,
    pub apply_interval: Duration,
    pub apply_batch_size: u64, // 每批应用到状态机的日志条数
    pub max_append_entries: usize,
    pub max_append_bytes: usize,
    pub snapshot_chunk_size: usize,
    /// Send a snapshot instead of entries once a follower lags the latest
    /// snapshot by more than this many entries.
    pub prefer_snapshot_replication_threshold: u64,
    /// Take a snapshot after this many applied entries; `0` disables it.
    pub snapshot_threshold: u64,
    pub verify_snapshot_term: bool,
    // 复制管道
    pub max_inflight_requests: usize,
    pub request_timeout: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// Seed for election timeout jitter; random when unset.
    pub rng_seed: Option<u64>,
}

impl Default for RaftStateOptions {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(500),
            election_timeout_max: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_millis(50),
            lease_timeout: Duration::from_millis(1000),
            apply_interval: Duration::from_millis(100),
            apply_batch_size: 64,
            max_append_entries: 256,
            max_append_bytes: 4 * 1024 * 1024,
            snapshot_chunk_size: 1024 * 1024,
            prefer_snapshot_replication_threshold: 100,
            snapshot_threshold: 0,
            verify_snapshot_term: false,
            max_inflight_requests: 64,
            request_timeout: Duration::from_secs(1),
            backoff_min: Duration::from_millis(50),
            backoff_max: Duration::from_secs(2),
            rng_seed: None,
        }
    }
}

impl RaftStateOptions {
    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max.max(min);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_lease_timeout(mut self, lease: Duration) -> Self {
        self.lease_timeout = lease;
        self
    }

    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    pub fn with_snapshot_chunk_size(mut self, size: usize) -> Self {
        self.snapshot_chunk_size = size;
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }
}

/// Leader 专用状态
pub(crate) struct LeaderState {
    pub(crate) pipeline: PipelineState,
    /// Index of the `Initial` entry that opened this term.
    pub(crate) term_start_index: u64,
    pub(crate) elected_at: Instant,
}

/// 角色及其专有状态
pub(crate) enum RoleState {
    Follower {
        leader: Option<RaftId>,
    },
    Candidate {
        election_id: RequestId,
        votes: BTreeSet<RaftId>,
    },
    Leader(LeaderState),
}

impl RoleState {
    pub(crate) fn role(&self) -> Role {
        match self {
            RoleState::Follower { .. } => Role::Follower,
            RoleState::Candidate { .. } => Role::Candidate,
            RoleState::Leader(_) => Role::Leader,
        }
    }
}

pub struct RaftState {
    // 节点标识
    pub(crate) id: RaftId,
    pub(crate) voters: BTreeSet<RaftId>,

    // 核心状态
    pub(crate) role: RoleState,
    pub(crate) current_term: u64,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) last_applied: u64,
    /// Commit index announced by the leader in its latest request.
    pub(crate) leader_commit: u64,

    // 存储
    pub(crate) log: ReplicatedLog,
    pub(crate) meta: MetaStore,
    pub(crate) snapshots: FileSnapshotStore,
    pub(crate) pending_snapshot: Option<ReceivedSnapshot>,
    pub(crate) checker: ConsistencyChecker,

    pub(crate) health: PartitionHealth,
    health_tx: watch::Sender<PartitionHealth>,

    // 外部依赖
    pub(crate) callbacks: Arc<dyn RaftCallbacks>,
    pub(crate) error_handler: CallbackErrorHandler,
    pub(crate) options: RaftStateOptions,

    // 定时器
    election_timer: Option<TimerId>,
    heartbeat_timer: Option<TimerId>,
    apply_timer: Option<TimerId>,
    rng: StdRng,
}

impl RaftState {
    /// 从已打开的存储恢复分区状态
    ///
    /// Purges orphaned received snapshots, recovers the term, runs the
    /// snapshot/log consistency check and restores the latest snapshot into
    /// the state machine. An inconsistent partition opens as `Dead`.
    pub async fn open(
        id: RaftId,
        options: RaftStateOptions,
        meta: MetaStore,
        mut log: ReplicatedLog,
        snapshots: FileSnapshotStore,
        callbacks: Arc<dyn RaftCallbacks>,
    ) -> RaftResult<Self> {
        let purged = snapshots.purge_pending()?;
        if purged > 0 {
            info!("Node {} purged {} orphaned pending snapshots", id, purged);
        }

        let (current_term, voted_for, persisted_commit) = match meta.load()? {
            Some(state) => (state.current_term, state.voted_for, state.commit_index),
            None if !log.is_empty() => {
                // 元数据丢失：以最后一条日志的任期作为当前任期
                warn!(
                    "Node {} has no persisted state, recovering term {} from the log",
                    id,
                    log.last_term()
                );
                (log.last_term(), None, 0)
            }
            None => (0, None, 0),
        };
        let snapshot_index = snapshots.latest_index();
        let snapshot_term = snapshots.latest_term();
        // 任期不能落后于日志或快照中已出现的任期
        let current_term = current_term.max(log.last_term()).max(snapshot_term);
        log.observe_term(current_term);

        let checker = ConsistencyChecker::new(options.verify_snapshot_term);
        let checked = checker.check(&id, &mut log, snapshot_index, snapshot_term);
        let health = match checked {
            Ok(ConsistencyResult::Inconsistent(reason)) => PartitionHealth::Dead(reason),
            Ok(_) => {
                // 已持久化的提交位置必须仍被日志或快照覆盖
                let retained =
                    checker.check_commit(&id, persisted_commit, log.last_index(), snapshot_index);
                match retained {
                    ConsistencyResult::Inconsistent(reason) => PartitionHealth::Dead(reason),
                    _ => PartitionHealth::Starting,
                }
            }
            Err(err) => PartitionHealth::Dead(err.to_string()),
        };

        // 快照已提交但日志尚未跟上（安装快照时崩溃）：日志整体让位于快照
        if !health.is_dead() && log.last_index() < snapshot_index {
            warn!(
                "Node {} log ends at {} below snapshot {}, resetting it",
                id,
                log.last_index(),
                snapshot_index
            );
            log.reset_on_snapshot(snapshot_index + 1)?;
        }

        let mut last_applied = 0;
        if !health.is_dead() {
            if let Some(snapshot_meta) = snapshots.latest().cloned() {
                let snapshot = snapshots.load(&snapshot_meta)?;
                callbacks
                    .restore_snapshot(&id, snapshot_meta.index, snapshot_meta.term, snapshot.data)
                    .await?;
                last_applied = snapshot_meta.index;
                info!(
                    "Node {} restored snapshot at index {} term {}",
                    id, snapshot_meta.index, snapshot_meta.term
                );
            }
            let commit = persisted_commit.max(snapshot_index);
            log.set_commit_index(commit);
        }

        let voters = callbacks
            .members(id.partition)
            .into_iter()
            .map(|node| RaftId::new(id.partition, node))
            .collect();

        let rng = match options.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let (health_tx, _) = watch::channel(health.clone());

        info!(
            "Node {} opened: term {} log [{}, {}] snapshot {} health {}",
            id,
            current_term,
            log.first_index(),
            log.last_index(),
            snapshot_index,
            health
        );

        Ok(RaftState {
            error_handler: CallbackErrorHandler::new(id.clone()),
            id,
            voters,
            role: RoleState::Follower { leader: None },
            current_term,
            voted_for,
            last_applied,
            leader_commit: 0,
            log,
            meta,
            snapshots,
            pending_snapshot: None,
            checker,
            health,
            health_tx,
            callbacks,
            options,
            election_timer: None,
            heartbeat_timer: None,
            apply_timer: None,
            rng,
        })
    }

    /// 启动：通知初始健康状态、重放已提交日志并启动选举定时器
    pub async fn start(&mut self) {
        let health = self.health.clone();
        self.callbacks.on_health_changed(&self.id, health).await;
        if self.health.is_dead() {
            warn!("Node {} not started: {}", self.id, self.health);
            return;
        }
        self.apply_committed_logs().await;
        self.reset_election_timer();
        self.check_fatal().await;
    }

    /// 处理事件（主入口）
    pub async fn handle_event(&mut self, event: Event) {
        if self.health.is_dead() {
            trace!("Node {} is dead, dropping event {:?}", self.id, event);
            return;
        }
        match event {
            Event::ElectionTimeout => self.handle_election_timeout().await,
            Event::HeartbeatTimeout => self.handle_heartbeat_timeout().await,
            Event::ApplyLogTimeout => {
                self.apply_timer = None;
                self.apply_committed_logs().await
            }
            Event::RequestVoteRequest(sender, request) => {
                self.handle_request_vote(sender, request).await
            }
            Event::RequestVoteResponse(sender, response) => {
                self.handle_request_vote_response(sender, response).await
            }
            Event::AppendEntriesRequest(sender, request) => {
                self.handle_append_entries_request(sender, request).await
            }
            Event::AppendEntriesResponse(sender, response) => {
                self.handle_append_entries_response(sender, response).await
            }
            Event::InstallSnapshotRequest(sender, request) => {
                self.handle_install_snapshot(sender, request).await
            }
            Event::InstallSnapshotResponse(sender, response) => {
                self.handle_install_snapshot_response(sender, response)
                    .await
            }
            Event::CreateSnapshot => self.create_snapshot().await,
            Event::MembershipChanged(members) => self.handle_membership_changed(members).await,
        }
        self.check_fatal().await;
    }

    // === 查询 ===

    pub fn id(&self) -> &RaftId {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role.role()
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn leader_id(&self) -> Option<RaftId> {
        match &self.role {
            RoleState::Follower { leader } => leader.clone(),
            RoleState::Candidate { .. } => None,
            RoleState::Leader(_) => Some(self.id.clone()),
        }
    }

    pub fn commit_index(&self) -> u64 {
        self.log.commit_index()
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn log(&self) -> &ReplicatedLog {
        &self.log
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshots.latest_index()
    }

    pub fn health(&self) -> &PartitionHealth {
        &self.health
    }

    pub fn subscribe_health(&self) -> watch::Receiver<PartitionHealth> {
        self.health_tx.subscribe()
    }

    pub(crate) fn is_voter(&self) -> bool {
        self.voters.contains(&self.id)
    }

    pub(crate) fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    /// Voters other than this replica.
    pub(crate) fn peers(&self) -> Vec<RaftId> {
        self.voters
            .iter()
            .filter(|peer| **peer != self.id)
            .cloned()
            .collect()
    }

    /// 任期查询，快照边界使用快照的任期
    pub(crate) fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshots.latest_index() {
            return Some(self.snapshots.latest_term());
        }
        self.log.term_at(index)
    }

    pub(crate) fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub(crate) fn last_log_term(&self) -> u64 {
        if self.log.is_empty() {
            self.term_at(self.log.last_index()).unwrap_or(0)
        } else {
            self.log.last_term()
        }
    }

    // === 持久化与错误 ===

    /// 持久化 term / vote / commit，失败视为致命错误
    pub(crate) fn persist_state(&mut self) -> bool {
        let state = PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            commit_index: self.log.commit_index(),
            last_applied: self.last_applied,
        };
        let result = self.meta.store(&state);
        self.error_handler.handle_void(result, "persist_state", None)
    }

    /// Moves the partition to `Dead` once a fatal error was recorded.
    pub(crate) async fn check_fatal(&mut self) {
        if self.health.is_dead() {
            return;
        }
        if let Some(reason) = self.error_handler.fatal_reason() {
            let reason = reason.to_string();
            self.enter_dead(reason).await;
        }
    }

    pub(crate) async fn enter_dead(&mut self, reason: String) {
        if let Some(timer_id) = self.election_timer.take() {
            self.callbacks.del_timer(&self.id, timer_id);
        }
        if let Some(timer_id) = self.heartbeat_timer.take() {
            self.callbacks.del_timer(&self.id, timer_id);
        }
        if let Some(timer_id) = self.apply_timer.take() {
            self.callbacks.del_timer(&self.id, timer_id);
        }
        if let Some(pending) = self.pending_snapshot.take() {
            pending.abort();
        }
        let was_leader = matches!(self.role, RoleState::Leader(_));
        self.role = RoleState::Follower { leader: None };
        if was_leader {
            self.notify_state_changed().await;
        }
        self.set_health(PartitionHealth::Dead(reason)).await;
    }

    // === 角色切换 ===

    /// 切换为 Follower；更高任期会清除投票并先行持久化
    pub(crate) async fn become_follower(&mut self, term: u64, leader: Option<RaftId>) {
        let previous = self.role.role();
        let term_changed = term > self.current_term;
        if term_changed {
            info!(
                "Node {} updating term from {} to {}",
                self.id, self.current_term, term
            );
            self.current_term = term;
            self.voted_for = None;
            self.log.observe_term(term);
            if !self.persist_state() {
                return;
            }
        }

        if previous == Role::Leader {
            if let Some(timer_id) = self.heartbeat_timer.take() {
                self.callbacks.del_timer(&self.id, timer_id);
            }
        }
        if let Some(leader_id) = &leader {
            debug!("Node {} following {} in term {}", self.id, leader_id, term);
        }
        self.role = RoleState::Follower { leader };
        self.reset_election_timer();

        if previous != Role::Follower || term_changed {
            self.notify_state_changed().await;
        }
        self.update_readiness().await;
    }

    pub(crate) async fn notify_state_changed(&self) {
        self.callbacks
            .on_state_changed(&self.id, self.role.role(), self.current_term)
            .await;
    }

    // === 健康状态 ===

    pub(crate) async fn set_health(&mut self, health: PartitionHealth) {
        if self.health == health {
            return;
        }
        info!("Node {} health {} -> {}", self.id, self.health, health);
        self.health = health.clone();
        self.health_tx.send_replace(health.clone());
        self.callbacks.on_health_changed(&self.id, health).await;
    }

    /// Ready once the leader committed the first entry of its term, or once a
    /// follower caught up with the commit index its leader announced.
    pub(crate) async fn update_readiness(&mut self) {
        if self.health.is_dead() {
            return;
        }
        let commit = self.log.commit_index();
        let verdict = match &self.role {
            RoleState::Leader(leader) if commit >= leader.term_start_index => Ok(()),
            RoleState::Leader(_) => Err("leader has not committed its first entry"),
            RoleState::Follower { leader: Some(_) } if commit >= self.leader_commit => Ok(()),
            RoleState::Follower { leader: Some(_) } => Err("catching up with the leader"),
            RoleState::Follower { leader: None } => Err("no known leader"),
            RoleState::Candidate { .. } => Err("election in progress"),
        };
        match verdict {
            Ok(()) => self.set_health(PartitionHealth::Ready).await,
            Err(reason) if self.health.is_ready() => {
                self.set_health(PartitionHealth::NotReady(reason.to_string()))
                    .await
            }
            Err(_) => {}
        }
    }

    // === 定时器 ===

    pub(crate) fn reset_election_timer(&mut self) {
        if let Some(timer_id) = self.election_timer.take() {
            self.callbacks.del_timer(&self.id, timer_id);
        }
        if !self.is_voter() {
            return;
        }
        let min = self.options.election_timeout_min.as_millis() as u64;
        let max = (self.options.election_timeout_max.as_millis() as u64).max(min);
        let timeout = Duration::from_millis(self.rng.random_range(min..=max));
        self.election_timer = Some(self.callbacks.set_election_timer(&self.id, timeout));
    }

    pub(crate) fn cancel_election_timer(&mut self) {
        if let Some(timer_id) = self.election_timer.take() {
            self.callbacks.del_timer(&self.id, timer_id);
        }
    }

    pub(crate) fn reset_heartbeat_timer(&mut self) {
        if let Some(timer_id) = self.heartbeat_timer.take() {
            self.callbacks.del_timer(&self.id, timer_id);
        }
        self.heartbeat_timer = Some(
            self.callbacks
                .set_heartbeat_timer(&self.id, self.options.heartbeat_interval),
        );
    }

    /// Retries applying later, e.g. after the state machine reported `Busy`.
    pub(crate) fn schedule_apply(&mut self) {
        if self.apply_timer.is_none() {
            self.apply_timer = Some(
                self.callbacks
                    .set_apply_timer(&self.id, self.options.apply_interval),
            );
        }
    }

    // === 成员变更 ===

    pub(crate) async fn handle_membership_changed(&mut self, members: Vec<NodeId>) {
        let voters: BTreeSet<RaftId> = members
            .into_iter()
            .map(|node| RaftId::new(self.id.partition, node))
            .collect();
        if voters == self.voters {
            return;
        }
        info!(
            "Node {} voter set changed: {:?} -> {:?}",
            self.id, self.voters, voters
        );
        self.voters = voters;

        let next_index = self.log.last_index() + 1;
        let peers = self.peers();
        if let RoleState::Leader(leader) = &mut self.role {
            let tracked: Vec<RaftId> = leader.pipeline.peers().cloned().collect();
            for peer in tracked.iter().filter(|p| !peers.contains(p)) {
                leader.pipeline.remove_peer(peer);
            }
            for peer in &peers {
                leader.pipeline.add_peer(peer, next_index);
            }
        }

        if !self.is_voter() {
            warn!("Node {} is no longer a voter", self.id);
            self.cancel_election_timer();
            if matches!(self.role, RoleState::Leader(_)) {
                self.become_follower(self.current_term, None).await;
            }
            return;
        }
        if matches!(self.role, RoleState::Leader(_)) {
            self.update_commit_index().await;
        } else if self.election_timer.is_none() {
            self.reset_election_timer();
        }
    }
}
