use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use super::network::MockNodeNetwork;
use super::state_machine::MemoryStateMachine;
use crate::driver::Timers;
use crate::event::{Event, PartitionHealth, Role};
use crate::message::*;
use crate::traits::*;
use crate::types::{NodeId, PartitionId, RaftId, TimerId};

/// Callbacks of one partition replica backed by the mock network, the
/// driver's timers and a [`MemoryStateMachine`].
pub struct MockCallbacks {
    network: MockNodeNetwork,
    timers: Timers,
    state_machine: Arc<MemoryStateMachine>,
    members: Mutex<Vec<NodeId>>,
    roles: Mutex<Vec<(Role, u64)>>,
    health: Mutex<Vec<PartitionHealth>>,
}

impl MockCallbacks {
    pub fn new(
        network: MockNodeNetwork,
        timers: Timers,
        state_machine: Arc<MemoryStateMachine>,
        members: Vec<NodeId>,
    ) -> Self {
        Self {
            network,
            timers,
            state_machine,
            members: Mutex::new(members),
            roles: Mutex::new(Vec::new()),
            health: Mutex::new(Vec::new()),
        }
    }

    pub fn state_machine(&self) -> &Arc<MemoryStateMachine> {
        &self.state_machine
    }

    /// Replaces the voter set returned by `members`. The partition learns
    /// about it through `Event::MembershipChanged`.
    pub fn set_members(&self, members: Vec<NodeId>) {
        *self.members.lock() = members;
    }

    /// Every `(role, term)` the replica reported, oldest first.
    pub fn role_history(&self) -> Vec<(Role, u64)> {
        self.roles.lock().clone()
    }

    pub fn health_history(&self) -> Vec<PartitionHealth> {
        self.health.lock().clone()
    }
}

#[async_trait]
impl Network for MockCallbacks {
    async fn send_request_vote_request(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: RequestVoteRequest,
    ) -> RpcResult<()> {
        self.network
            .send_request_vote_request(from, target, args)
            .await
    }

    async fn send_request_vote_response(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: RequestVoteResponse,
    ) -> RpcResult<()> {
        self.network
            .send_request_vote_response(from, target, args)
            .await
    }

    async fn send_append_entries_request(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: AppendEntriesRequest,
    ) -> RpcResult<()> {
        self.network
            .send_append_entries_request(from, target, args)
            .await
    }

    async fn send_append_entries_response(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: AppendEntriesResponse,
    ) -> RpcResult<()> {
        self.network
            .send_append_entries_response(from, target, args)
            .await
    }

    async fn send_install_snapshot_request(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: InstallSnapshotRequest,
    ) -> RpcResult<()> {
        self.network
            .send_install_snapshot_request(from, target, args)
            .await
    }

    async fn send_install_snapshot_response(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: InstallSnapshotResponse,
    ) -> RpcResult<()> {
        self.network
            .send_install_snapshot_response(from, target, args)
            .await
    }
}

impl TimerService for MockCallbacks {
    fn del_timer(&self, _from: &RaftId, timer_id: TimerId) {
        self.timers.del_timer(timer_id);
    }

    fn set_election_timer(&self, from: &RaftId, dur: Duration) -> TimerId {
        self.timers.add_timer(from, Event::ElectionTimeout, dur)
    }

    fn set_heartbeat_timer(&self, from: &RaftId, dur: Duration) -> TimerId {
        self.timers.add_timer(from, Event::HeartbeatTimeout, dur)
    }

    fn set_apply_timer(&self, from: &RaftId, dur: Duration) -> TimerId {
        self.timers.add_timer(from, Event::ApplyLogTimeout, dur)
    }
}

#[async_trait]
impl StateMachine for MockCallbacks {
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
impl EventNotify for MockCallbacks {
    async fn on_state_changed(&self, from: &RaftId, role: Role, term: u64) {
        info!("{} became {} in term {}", from, role, term);
        self.roles.lock().push((role, term));
    }

    async fn on_health_changed(&self, from: &RaftId, health: PartitionHealth) {
        info!("{} health {}", from, health);
        self.health.lock().push(health);
    }
}

impl MembershipProvider for MockCallbacks {
    fn members(&self, _partition: PartitionId) -> Vec<NodeId> {
        self.members.lock().clone()
    }
}

impl RaftCallbacks for MockCallbacks {}
