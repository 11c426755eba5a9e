//! 基于驱动器与模拟网络的测试集群

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use partition_raft::mock::{MemoryStateMachine, MockCallbacks, MockNetworkConfig, MockNetworkHub};
use partition_raft::{
    LogStorageAdapter, NodeId, PartitionDriver, PartitionId, PartitionOptions, RaftPartition,
    RaftStateOptions, Role,
};
use tempfile::TempDir;
use tracing::info;

pub const PARTITION: PartitionId = 1;

pub struct TestNode {
    pub driver: PartitionDriver,
    pub partition: RaftPartition,
    pub callbacks: Arc<MockCallbacks>,
    pub adapter: LogStorageAdapter,
}

impl TestNode {
    pub fn state_machine(&self) -> &Arc<MemoryStateMachine> {
        self.callbacks.state_machine()
    }
}

pub struct TestCluster {
    pub hub: MockNetworkHub,
    pub nodes: BTreeMap<NodeId, TestNode>,
    _dir: TempDir,
}

pub fn fast_raft_options() -> RaftStateOptions {
    RaftStateOptions::default()
        .with_election_timeout(Duration::from_millis(150), Duration::from_millis(300))
        .with_heartbeat_interval(Duration::from_millis(30))
        .with_lease_timeout(Duration::from_millis(600))
}

impl TestCluster {
    pub async fn new(size: usize, raft: RaftStateOptions) -> Self {
        Self::with_segment_size(size, raft, 64 * 1024 * 1024).await
    }

    pub async fn with_segment_size(size: usize, raft: RaftStateOptions, max_segment_size: u64) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let hub = MockNetworkHub::with_seed(MockNetworkConfig::default(), 42);
        let members: Vec<NodeId> = (1..=size).map(|i| format!("node{}", i)).collect();

        // 先注册所有节点，再启动分区
        let mut drivers = Vec::new();
        for name in &members {
            let driver = PartitionDriver::new();
            let network = hub.register_node(name.clone(), driver.clone());
            drivers.push((name.clone(), driver, network));
        }

        let mut nodes = BTreeMap::new();
        for (i, (name, driver, network)) in drivers.into_iter().enumerate() {
            let callbacks = Arc::new(MockCallbacks::new(
                network,
                driver.timers(),
                Arc::new(MemoryStateMachine::new()),
                members.clone(),
            ));
            // 每个节点独占自己的数据目录
            let node_dir = dir.path().join(&name);
            let options = PartitionOptions::new(node_dir, PARTITION, name.clone())
                .with_raft(raft.clone().with_rng_seed(i as u64 + 1))
                .with_sync_on_write(false)
                .with_max_segment_size(max_segment_size);
            let partition = RaftPartition::open(options, callbacks.clone())
                .await
                .expect("open partition");
            driver.add_partition(partition.id().clone(), Box::new(partition.clone()));
            let main_loop = driver.clone();
            tokio::spawn(async move { main_loop.main_loop().await });

            let adapter = LogStorageAdapter::new(partition.clone(), driver.clone())
                .with_append_timeout(Duration::from_secs(5));
            nodes.insert(
                name,
                TestNode {
                    driver,
                    partition,
                    callbacks,
                    adapter,
                },
            );
        }
        for node in nodes.values() {
            node.partition.start().await;
        }

        Self {
            hub,
            nodes,
            _dir: dir,
        }
    }

    pub fn node(&self, name: &str) -> &TestNode {
        &self.nodes[name]
    }

    /// Leader with the highest term among reachable-or-not replicas.
    pub async fn leader(&self) -> Option<NodeId> {
        let mut best: Option<(u64, NodeId)> = None;
        for (name, node) in &self.nodes {
            let status = node.partition.status().await;
            if status.role == Role::Leader && best.as_ref().is_none_or(|(t, _)| status.term > *t) {
                best = Some((status.term, name.clone()));
            }
        }
        best.map(|(_, name)| name)
    }

    /// Waits for a ready leader that is not `excluding`.
    pub async fn wait_for_leader(&self, excluding: Option<&str>, timeout: Duration) -> NodeId {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            for (name, node) in &self.nodes {
                if Some(name.as_str()) == excluding {
                    continue;
                }
                let status = node.partition.status().await;
                if status.role == Role::Leader && status.health.is_ready() {
                    info!("Leader {} in term {}", name, status.term);
                    return name.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no leader within {:?}", timeout);
    }

    /// Waits until every listed replica applied at least `index`.
    pub async fn wait_for_applied(&self, names: &[&str], index: u64, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if names
                .iter()
                .all(|name| self.node(name).state_machine().applied_index() >= index)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{:?} did not apply {} within {:?}", names, index, timeout);
    }

    pub fn names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn shutdown(&self) {
        for node in self.nodes.values() {
            node.driver.stop();
        }
    }
}
