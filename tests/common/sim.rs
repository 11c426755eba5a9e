//! 确定性模拟：单线程按虚拟时间投递消息与定时器
//!
//! Every replica is a plain `RaftState` driven directly by the simulation.
//! Messages go through the wire codec and get a random latency from a seeded
//! `StdRng`, so they can be delayed, dropped and reordered. The tokio clock is
//! paused and advanced to each event's deadline, which keeps leases, request
//! timeouts and back-off consistent with the simulated time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use partition_raft::mock::{MemoryStateMachine, into_event};
use partition_raft::storage::{
    FileSnapshotStore, LogStoreOptions, MetaStore, ReplicatedLog, SnapshotStoreOptions,
};
use partition_raft::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use tokio::time::Instant;
use tracing::{debug, info};

pub const PARTITION: PartitionId = 1;

struct SimTimer {
    deadline: Instant,
    target: RaftId,
    event: Event,
}

#[derive(Default)]
struct World {
    outbox: Vec<(RaftId, RaftId, RaftMessage)>,
    timers: BTreeMap<TimerId, SimTimer>,
    next_timer_id: TimerId,
}

/// Callbacks of one simulated replica: sends and timers land in the shared world.
pub struct SimCallbacks {
    world: Arc<Mutex<World>>,
    members: Vec<NodeId>,
    pub state_machine: Arc<MemoryStateMachine>,
    roles: Mutex<Vec<(Role, u64)>>,
}

impl SimCallbacks {
    fn send(&self, from: &RaftId, target: &RaftId, msg: RaftMessage) -> RpcResult<()> {
        if !self.members.contains(&target.node) {
            return Err(RpcError::NodeNotFound(target.clone()));
        }
        self.world
            .lock()
            .outbox
            .push((from.clone(), target.clone(), msg));
        Ok(())
    }

    fn add_timer(&self, target: &RaftId, event: Event, dur: Duration) -> TimerId {
        let mut world = self.world.lock();
        world.next_timer_id += 1;
        let timer_id = world.next_timer_id;
        world.timers.insert(
            timer_id,
            SimTimer {
                deadline: Instant::now() + dur,
                target: target.clone(),
                event,
            },
        );
        timer_id
    }

    pub fn role_history(&self) -> Vec<(Role, u64)> {
        self.roles.lock().clone()
    }
}

#[async_trait]
impl Network for SimCallbacks {
    async fn send_request_vote_request(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: RequestVoteRequest,
    ) -> RpcResult<()> {
        self.send(from, target, RaftMessage::RequestVote(args))
    }

    async fn send_request_vote_response(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: RequestVoteResponse,
    ) -> RpcResult<()> {
        self.send(from, target, RaftMessage::RequestVoteResponse(args))
    }

    async fn send_append_entries_request(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: AppendEntriesRequest,
    ) -> RpcResult<()> {
        self.send(from, target, RaftMessage::AppendEntries(args))
    }

    async fn send_append_entries_response(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: AppendEntriesResponse,
    ) -> RpcResult<()> {
        self.send(from, target, RaftMessage::AppendEntriesResponse(args))
    }

    async fn send_install_snapshot_request(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: InstallSnapshotRequest,
    ) -> RpcResult<()> {
        self.send(from, target, RaftMessage::InstallSnapshot(args))
    }

    async fn send_install_snapshot_response(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: InstallSnapshotResponse,
    ) -> RpcResult<()> {
        self.send(from, target, RaftMessage::InstallSnapshotResponse(args))
    }
}

impl TimerService for SimCallbacks {
    fn del_timer(&self, _from: &RaftId, timer_id: TimerId) {
        self.world.lock().timers.remove(&timer_id);
    }

    fn set_election_timer(&self, from: &RaftId, dur: Duration) -> TimerId {
        self.add_timer(from, Event::ElectionTimeout, dur)
    }

    fn set_heartbeat_timer(&self, from: &RaftId, dur: Duration) -> TimerId {
        self.add_timer(from, Event::HeartbeatTimeout, dur)
    }

    fn set_apply_timer(&self, from: &RaftId, dur: Duration) -> TimerId {
        self.add_timer(from, Event::ApplyLogTimeout, dur)
    }
}

#[async_trait]
impl StateMachine for SimCallbacks {
    async fn apply(&self, from: &RaftId, entry: &LogEntry) -> ApplyResult<()> {
        self.state_machine.apply(from, entry)
    }

    async fn take_snapshot(&self, from: &RaftId, index: u64, term: u64) -> ApplyResult<Vec<u8>> {
        self.state_machine.take_snapshot(from, index, term)
    }

    async fn restore_snapshot(
        &self,
        from: &RaftId,
        index: u64,
        term: u64,
        data: Vec<u8>,
    ) -> ApplyResult<()> {
        self.state_machine.restore_snapshot(from, index, term, data)
    }
}

#[async_trait]
impl EventNotify for SimCallbacks {
    async fn on_state_changed(&self, _from: &RaftId, role: Role, term: u64) {
        self.roles.lock().push((role, term));
    }

    async fn on_health_changed(&self, _from: &RaftId, _health: PartitionHealth) {}
}

impl MembershipProvider for SimCallbacks {
    fn members(&self, _partition: PartitionId) -> Vec<NodeId> {
        self.members.clone()
    }
}

impl RaftCallbacks for SimCallbacks {}

/// Opens a replica's stores under the partition layout and restores its state.
pub async fn open_state(
    options: &PartitionOptions,
    callbacks: Arc<dyn RaftCallbacks>,
) -> RaftResult<RaftState> {
    let meta = MetaStore::new(options.partition_dir(), options.log.sync_on_write)?;
    let log = ReplicatedLog::open(LogStoreOptions {
        dir: options.log_dir(),
        ..options.log.clone()
    })?;
    let snapshots = FileSnapshotStore::open(SnapshotStoreOptions {
        dir: options.snapshot_dir(),
        ..options.snapshot.clone()
    })?;
    RaftState::open(
        options.id(),
        options.raft.clone(),
        meta,
        log,
        snapshots,
        callbacks,
    )
    .await
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub nodes: usize,
    pub seed: u64,
    pub min_latency: Duration,
    pub max_latency: Duration,
    pub drop_rate: f64,
    pub raft: RaftStateOptions,
    pub max_segment_size: u64,
}

impl SimConfig {
    pub fn new(nodes: usize, seed: u64) -> Self {
        let raft = RaftStateOptions {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(30),
            lease_timeout: Duration::from_millis(600),
            apply_interval: Duration::from_millis(20),
            request_timeout: Duration::from_millis(200),
            backoff_min: Duration::from_millis(20),
            backoff_max: Duration::from_millis(200),
            max_append_entries: 32,
            ..RaftStateOptions::default()
        };
        Self {
            nodes,
            seed,
            min_latency: Duration::from_millis(1),
            max_latency: Duration::from_millis(15),
            drop_rate: 0.0,
            raft,
            max_segment_size: 4 * 1024,
        }
    }

    pub fn with_drop_rate(mut self, drop_rate: f64) -> Self {
        self.drop_rate = drop_rate;
        self
    }

    pub fn with_latency(mut self, min: Duration, max: Duration) -> Self {
        self.min_latency = min;
        self.max_latency = max.max(min);
        self
    }

    pub fn with_raft(mut self, raft: RaftStateOptions) -> Self {
        self.raft = raft;
        self
    }
}

struct InFlight {
    deliver_at: Instant,
    seq: u64,
    target: RaftId,
    event: Event,
}

enum NextEvent {
    Timer(TimerId),
    Message(usize),
}

pub struct SimNode {
    pub state: Option<RaftState>,
    pub callbacks: Arc<SimCallbacks>,
}

/// A simulated cluster of one partition.
pub struct Sim {
    config: SimConfig,
    rng: StdRng,
    world: Arc<Mutex<World>>,
    dir: TempDir,
    nodes: BTreeMap<NodeId, SimNode>,
    in_flight: Vec<InFlight>,
    seq: u64,
    isolated: HashSet<NodeId>,
    /// 每个任期的 leader，用于检查选举安全性
    leaders: BTreeMap<u64, NodeId>,
    /// index -> term of every entry some replica reported committed
    committed: BTreeMap<u64, u64>,
    verified: HashMap<NodeId, u64>,
    next_position: u64,
    opens: u64,
}

impl Sim {
    pub async fn new(config: SimConfig) -> Self {
        let mut sim = Self {
            rng: StdRng::seed_from_u64(config.seed),
            world: Arc::new(Mutex::new(World::default())),
            dir: TempDir::new().expect("temp dir"),
            nodes: BTreeMap::new(),
            in_flight: Vec::new(),
            seq: 0,
            isolated: HashSet::new(),
            leaders: BTreeMap::new(),
            committed: BTreeMap::new(),
            verified: HashMap::new(),
            next_position: 1,
            opens: 0,
            config,
        };
        for name in sim.members() {
            sim.open_node(&name).await;
        }
        sim
    }

    pub fn members(&self) -> Vec<NodeId> {
        (1..=self.config.nodes).map(|i| format!("n{}", i)).collect()
    }

    pub fn options(&self, name: &str) -> PartitionOptions {
        let raft = RaftStateOptions {
            rng_seed: Some(self.config.seed.wrapping_mul(1000).wrapping_add(self.opens)),
            ..self.config.raft.clone()
        };
        PartitionOptions::new(self.dir.path().join(name), PARTITION, name)
            .with_raft(raft)
            .with_sync_on_write(false)
            .with_max_segment_size(self.config.max_segment_size)
    }

    async fn open_node(&mut self, name: &str) {
        self.opens += 1;
        let options = self.options(name);
        let callbacks = Arc::new(SimCallbacks {
            world: self.world.clone(),
            members: self.members(),
            state_machine: Arc::new(MemoryStateMachine::new()),
            roles: Mutex::new(Vec::new()),
        });
        let mut state = open_state(&options, callbacks.clone())
            .await
            .expect("open replica");
        state.start().await;
        self.verified.remove(name);
        self.nodes.insert(
            name.to_string(),
            SimNode {
                state: Some(state),
                callbacks,
            },
        );
    }

    /// Drops the replica's in-memory state and its pending timers and
    /// incoming messages. On-disk state survives.
    pub fn crash(&mut self, name: &str) {
        info!("sim: crashing {}", name);
        if let Some(node) = self.nodes.get_mut(name) {
            node.state = None;
        }
        self.world
            .lock()
            .timers
            .retain(|_, timer| timer.target.node != name);
        self.in_flight.retain(|msg| msg.target.node != name);
    }

    pub async fn restart(&mut self, name: &str) {
        info!("sim: restarting {}", name);
        self.open_node(name).await;
    }

    pub fn isolate(&mut self, name: &str) {
        debug!("sim: isolating {}", name);
        self.isolated.insert(name.to_string());
    }

    pub fn heal_all(&mut self) {
        self.isolated.clear();
    }

    pub fn state(&self, name: &str) -> Option<&RaftState> {
        self.nodes.get(name).and_then(|node| node.state.as_ref())
    }

    pub fn callbacks(&self, name: &str) -> Arc<SimCallbacks> {
        self.nodes[name].callbacks.clone()
    }

    pub fn committed(&self) -> &BTreeMap<u64, u64> {
        &self.committed
    }

    pub fn leaders(&self) -> &BTreeMap<u64, NodeId> {
        &self.leaders
    }

    /// Live leader with the highest term.
    pub fn leader(&self) -> Option<NodeId> {
        self.nodes
            .iter()
            .filter_map(|(name, node)| node.state.as_ref().map(|s| (name, s)))
            .filter(|(_, state)| state.role() == Role::Leader)
            .max_by_key(|(_, state)| state.current_term())
            .map(|(name, _)| name.clone())
    }

    /// Runs until some leader is ready, up to `max`.
    pub async fn wait_for_leader(&mut self, max: Duration) -> NodeId {
        let deadline = Instant::now() + max;
        while Instant::now() < deadline {
            self.run_for(Duration::from_millis(50)).await;
            if let Some(name) = self.leader() {
                let ready = self
                    .state(&name)
                    .is_some_and(|state| state.health().is_ready());
                if ready && !self.isolated.contains(&name) {
                    return name;
                }
            }
        }
        panic!("no leader within {:?}", max);
    }

    pub async fn run_for(&mut self, duration: Duration) {
        self.run(duration, None).await;
    }

    /// Runs while proposing a block to the current leader every `every`.
    pub async fn run_with_load(&mut self, duration: Duration, every: Duration) {
        self.run(duration, Some(every)).await;
    }

    async fn run(&mut self, duration: Duration, load: Option<Duration>) {
        let end = Instant::now() + duration;
        let mut next_propose = load.map(|every| Instant::now() + every);
        loop {
            self.schedule_outbox();
            let next = self.next_event();
            let next_at = next.as_ref().map(|(at, _)| *at);
            let propose_due = match (next_propose, next_at) {
                (Some(propose_at), Some(at)) => propose_at <= at,
                (Some(_), None) => true,
                (None, _) => false,
            };
            let at = if propose_due { next_propose } else { next_at };
            let Some(at) = at.filter(|at| *at <= end) else {
                self.advance_to(end).await;
                return;
            };
            self.advance_to(at).await;

            if propose_due {
                self.propose().await;
                next_propose = load.map(|every| at + every);
            } else if let Some((_, event)) = next {
                self.deliver(event).await;
            }
        }
    }

    async fn advance_to(&self, at: Instant) {
        let now = Instant::now();
        if at > now {
            tokio::time::advance(at - now).await;
        }
    }

    fn schedule_outbox(&mut self) {
        let outbox = std::mem::take(&mut self.world.lock().outbox);
        for (from, to, msg) in outbox {
            if self.isolated.contains(&from.node) || self.isolated.contains(&to.node) {
                continue;
            }
            if self.config.drop_rate > 0.0 && self.rng.random::<f64>() < self.config.drop_rate {
                continue;
            }
            let bytes = msg.encode().expect("encode");
            let msg = RaftMessage::decode(&bytes).expect("decode");
            let min = self.config.min_latency.as_millis() as u64;
            let max = self.config.max_latency.as_millis() as u64;
            let latency = Duration::from_millis(self.rng.random_range(min..=max));
            self.seq += 1;
            self.in_flight.push(InFlight {
                deliver_at: Instant::now() + latency,
                seq: self.seq,
                target: to,
                event: into_event(from, msg),
            });
        }
    }

    fn next_event(&self) -> Option<(Instant, NextEvent)> {
        let timer = self
            .world
            .lock()
            .timers
            .iter()
            .min_by_key(|(id, timer)| (timer.deadline, **id))
            .map(|(id, timer)| (timer.deadline, NextEvent::Timer(*id)));
        let message = self
            .in_flight
            .iter()
            .enumerate()
            .min_by_key(|(_, msg)| (msg.deliver_at, msg.seq))
            .map(|(i, msg)| (msg.deliver_at, NextEvent::Message(i)));
        match (timer, message) {
            (Some(t), Some(m)) => Some(if m.0 < t.0 { m } else { t }),
            (t, m) => t.or(m),
        }
    }

    async fn deliver(&mut self, next: NextEvent) {
        let (target, event) = match next {
            NextEvent::Timer(timer_id) => {
                let Some(timer) = self.world.lock().timers.remove(&timer_id) else {
                    return;
                };
                (timer.target, timer.event)
            }
            NextEvent::Message(i) => {
                let msg = self.in_flight.swap_remove(i);
                // 隔离期间在途的消息同样丢失
                if self.isolated.contains(&msg.target.node) {
                    return;
                }
                (msg.target, msg.event)
            }
        };
        let Some(state) = self
            .nodes
            .get_mut(&target.node)
            .and_then(|node| node.state.as_mut())
        else {
            return;
        };
        state.handle_event(event).await;
        self.check_node(&target.node);
    }

    async fn propose(&mut self) {
        let Some(name) = self.leader() else {
            return;
        };
        let lowest = self.next_position;
        let highest = lowest + 9;
        let Some(state) = self.nodes.get_mut(&name).and_then(|n| n.state.as_mut()) else {
            return;
        };
        let payload = format!("block-{}", lowest).into_bytes();
        if state.propose(lowest, highest, payload).await.is_ok() {
            self.next_position = highest + 1;
        }
        self.check_node(&name);
    }

    /// 选举安全性与提交持久性检查
    fn check_node(&mut self, name: &str) {
        let Some(state) = self.state(name) else {
            return;
        };
        let role = state.role();
        let term = state.current_term();
        let commit = state.commit_index();
        let first_index = state.log().first_index();
        let last_index = state.log().last_index();

        let mut fresh = Vec::new();
        let from = (self.verified.get(name).copied().unwrap_or(0) + 1).max(first_index);
        for index in from..=commit.min(last_index) {
            if let Some(entry_term) = state.log().term_at(index) {
                fresh.push((index, entry_term));
            }
        }

        if role == Role::Leader {
            let previous = self
                .leaders
                .entry(term)
                .or_insert_with(|| name.to_string())
                .clone();
            assert_eq!(
                previous, name,
                "two leaders in term {}: {} and {}",
                term, previous, name
            );
        }
        for (index, entry_term) in fresh {
            let known = *self.committed.entry(index).or_insert(entry_term);
            assert_eq!(
                known, entry_term,
                "{} committed index {} with term {} but term {} was committed before",
                name, index, entry_term, known
            );
        }
        self.verified.insert(name.to_string(), commit);
    }

    fn live_states(&self) -> Vec<(&NodeId, &RaftState)> {
        self.nodes
            .iter()
            .filter_map(|(name, node)| node.state.as_ref().map(|state| (name, state)))
            .collect()
    }

    /// If two logs hold the same term at an index, they agree on every
    /// entry up to it.
    pub fn assert_log_matching(&self) {
        let states = self.live_states();
        for (i, (name_a, a)) in states.iter().enumerate() {
            for (name_b, b) in states.iter().skip(i + 1) {
                let (la, lb) = (a.log(), b.log());
                let low = la.first_index().max(lb.first_index());
                let high = la.last_index().min(lb.last_index());
                if low > high {
                    continue;
                }
                let Some(top) = (low..=high)
                    .rev()
                    .find(|index| la.term_at(*index) == lb.term_at(*index))
                else {
                    continue;
                };
                for index in low..=top {
                    assert_eq!(
                        la.entry_at(index).expect("entry"),
                        lb.entry_at(index).expect("entry"),
                        "{} and {} differ at {} below matching index {}",
                        name_a,
                        name_b,
                        index,
                        top
                    );
                }
            }
        }
    }

    /// Every committed index is held by a majority: in the log with the
    /// committed term, or below a snapshot.
    pub fn assert_committed_on_majority(&self) {
        let quorum = self.config.nodes / 2 + 1;
        let states = self.live_states();
        for (&index, &term) in &self.committed {
            let holders = states
                .iter()
                .filter(|(_, state)| {
                    state.snapshot_index() >= index || state.log().term_at(index) == Some(term)
                })
                .count();
            assert!(
                holders >= quorum,
                "committed index {} (term {}) held by {} replicas",
                index,
                term,
                holders
            );
        }
    }

    /// All live replicas applied the same commit and hold the same blocks.
    pub fn assert_converged(&self) {
        let states = self.live_states();
        let Some((first_name, first)) = states.first() else {
            return;
        };
        let expected_blocks = self.nodes[first_name.as_str()]
            .callbacks
            .state_machine
            .blocks();
        for (name, state) in &states {
            assert_eq!(
                state.commit_index(),
                first.commit_index(),
                "{} commit differs from {}",
                name,
                first_name
            );
            assert_eq!(
                state.last_applied(),
                state.commit_index(),
                "{} has not applied everything",
                name
            );
            let blocks = self.nodes[name.as_str()].callbacks.state_machine.blocks();
            assert_eq!(blocks, expected_blocks, "{} state differs", name);
        }
    }
}
