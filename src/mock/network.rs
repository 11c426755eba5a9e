use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::driver::{PartitionDriver, SendEventResult};
use crate::error::RpcError;
use crate::event::Event;
use crate::message::*;
use crate::traits::{Network, RpcResult};
use crate::types::{NodeId, RaftId};

// --- 模拟网络配置 ---

/// 模拟网络行为的配置
#[derive(Debug, Clone)]
pub struct MockNetworkConfig {
    /// 基础延迟
    pub base_latency: Duration,
    /// 额外随机延迟的最大值
    pub jitter_max: Duration,
    /// 消息丢失的概率 (0.0 - 1.0)
    pub drop_rate: f64,
}

impl Default for MockNetworkConfig {
    fn default() -> Self {
        Self {
            base_latency: Duration::from_millis(1),
            jitter_max: Duration::from_millis(4),
            drop_rate: 0.0,
        }
    }
}

/// 在链路队列中等待投递的消息
struct DelayedMessage {
    deliver_at: Instant,
    from: RaftId,
    target: RaftId,
    bytes: Vec<u8>,
}

struct Link {
    tx: mpsc::UnboundedSender<DelayedMessage>,
    /// Delivery time of the last queued message; later messages never overtake it.
    last_deliver_at: Instant,
}

struct MockNetworkHubInner {
    /// 每个节点的驱动，消息最终通过它投递到分区
    drivers: RwLock<HashMap<NodeId, PartitionDriver>>,
    config: RwLock<MockNetworkConfig>,
    isolated: RwLock<HashSet<NodeId>>,
    /// 每对节点一条链路，保证同一链路上的 FIFO 顺序
    links: Mutex<HashMap<(NodeId, NodeId), Link>>,
    rng: Mutex<StdRng>,
}

/// In-process transport between the drivers of several nodes.
///
/// Every message goes through the wire codec, waits out a simulated latency
/// and is dispatched to the target node's driver as an [`Event`].
#[derive(Clone)]
pub struct MockNetworkHub {
    inner: Arc<MockNetworkHubInner>,
}

impl MockNetworkHub {
    pub fn new(config: MockNetworkConfig) -> Self {
        Self::with_seed(config, rand::random())
    }

    pub fn with_seed(config: MockNetworkConfig, seed: u64) -> Self {
        Self {
            inner: Arc::new(MockNetworkHubInner {
                drivers: RwLock::new(HashMap::new()),
                config: RwLock::new(config),
                isolated: RwLock::new(HashSet::new()),
                links: Mutex::new(HashMap::new()),
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
            }),
        }
    }

    /// 注册节点的驱动，返回该节点使用的网络接口
    pub fn register_node(&self, node: impl Into<NodeId>, driver: PartitionDriver) -> MockNodeNetwork {
        let node = node.into();
        self.inner.drivers.write().insert(node.clone(), driver);
        MockNodeNetwork {
            node,
            hub: self.clone(),
        }
    }

    pub fn update_config(&self, config: MockNetworkConfig) {
        *self.inner.config.write() = config;
    }

    /// Cuts every link of `node` in both directions.
    pub fn isolate(&self, node: &str) {
        debug!("MockNetwork: isolating {}", node);
        self.inner.isolated.write().insert(node.to_string());
    }

    pub fn heal(&self, node: &str) {
        debug!("MockNetwork: healing {}", node);
        self.inner.isolated.write().remove(node);
    }

    pub fn heal_all(&self) {
        self.inner.isolated.write().clear();
    }

    fn is_cut(&self, from: &RaftId, target: &RaftId) -> bool {
        let isolated = self.inner.isolated.read();
        isolated.contains(&from.node) || isolated.contains(&target.node)
    }

    fn send(&self, from: &RaftId, target: &RaftId, msg: RaftMessage) -> RpcResult<()> {
        if !self.inner.drivers.read().contains_key(&target.node) {
            return Err(RpcError::NodeNotFound(target.clone()));
        }
        if self.is_cut(from, target) {
            trace!("MockNetwork: link {} -> {} is cut", from, target);
            return Ok(());
        }

        let (drop_rate, base, jitter) = {
            let config = self.inner.config.read();
            (config.drop_rate, config.base_latency, config.jitter_max)
        };
        let delay = {
            let mut rng = self.inner.rng.lock();
            // 丢包被视为发送成功
            if drop_rate > 0.0 && rng.random::<f64>() < drop_rate {
                debug!("MockNetwork: dropping message from {} to {}", from, target);
                return Ok(());
            }
            let jitter_ms = jitter.as_millis() as u64;
            base + Duration::from_millis(rng.random_range(0..=jitter_ms))
        };

        let bytes = msg.encode()?;
        let mut links = self.inner.links.lock();
        let link = links
            .entry((from.node.clone(), target.node.clone()))
            .or_insert_with(|| self.spawn_link());
        let deliver_at = (Instant::now() + delay).max(link.last_deliver_at);
        link.last_deliver_at = deliver_at;
        link.tx
            .send(DelayedMessage {
                deliver_at,
                from: from.clone(),
                target: target.clone(),
                bytes,
            })
            .map_err(|_| RpcError::Network("link closed".to_string()))
    }

    fn spawn_link(&self) -> Link {
        let (tx, mut rx) = mpsc::unbounded_channel::<DelayedMessage>();
        let hub = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                tokio::time::sleep_until(msg.deliver_at).await;
                hub.deliver(msg);
            }
        });
        Link {
            tx,
            last_deliver_at: Instant::now(),
        }
    }

    fn deliver(&self, msg: DelayedMessage) {
        // 投递时再检查一次，在途消息也会因隔离而丢失
        if self.is_cut(&msg.from, &msg.target) {
            return;
        }
        let decoded = match RaftMessage::decode(&msg.bytes) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!("MockNetwork: undecodable message from {}: {}", msg.from, err);
                return;
            }
        };
        let Some(driver) = self.inner.drivers.read().get(&msg.target.node).cloned() else {
            return;
        };
        let event = into_event(msg.from, decoded);
        match driver.dispatch_event(msg.target.clone(), event) {
            SendEventResult::Success => {}
            result => trace!(
                "MockNetwork: delivery to {} failed: {:?}",
                msg.target, result
            ),
        }
    }
}

/// 将网络消息转换为目标分区的事件
pub fn into_event(from: RaftId, msg: RaftMessage) -> Event {
    match msg {
        RaftMessage::RequestVote(req) => Event::RequestVoteRequest(from, req),
        RaftMessage::RequestVoteResponse(resp) => Event::RequestVoteResponse(from, resp),
        RaftMessage::AppendEntries(req) => Event::AppendEntriesRequest(from, req),
        RaftMessage::AppendEntriesResponse(resp) => Event::AppendEntriesResponse(from, resp),
        RaftMessage::InstallSnapshot(req) => Event::InstallSnapshotRequest(from, req),
        RaftMessage::InstallSnapshotResponse(resp) => Event::InstallSnapshotResponse(from, resp),
    }
}

/// 代表单个节点的网络接口实现
#[derive(Clone)]
pub struct MockNodeNetwork {
    node: NodeId,
    hub: MockNetworkHub,
}

impl MockNodeNetwork {
    pub fn node(&self) -> &NodeId {
        &self.node
    }
}

#[async_trait]
impl Network for MockNodeNetwork {
    async fn send_request_vote_request(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: RequestVoteRequest,
    ) -> RpcResult<()> {
        self.hub.send(from, target, RaftMessage::RequestVote(args))
    }

    async fn send_request_vote_response(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: RequestVoteResponse,
    ) -> RpcResult<()> {
        self.hub
            .send(from, target, RaftMessage::RequestVoteResponse(args))
    }

    async fn send_append_entries_request(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: AppendEntriesRequest,
    ) -> RpcResult<()> {
        self.hub.send(from, target, RaftMessage::AppendEntries(args))
    }

    async fn send_append_entries_response(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: AppendEntriesResponse,
    ) -> RpcResult<()> {
        self.hub
            .send(from, target, RaftMessage::AppendEntriesResponse(args))
    }

    async fn send_install_snapshot_request(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: InstallSnapshotRequest,
    ) -> RpcResult<()> {
        self.hub
            .send(from, target, RaftMessage::InstallSnapshot(args))
    }

    async fn send_install_snapshot_response(
        &self,
        from: &RaftId,
        target: &RaftId,
        args: InstallSnapshotResponse,
    ) -> RpcResult<()> {
        self.hub
            .send(from, target, RaftMessage::InstallSnapshotResponse(args))
    }
}
