//! 分区驱动器
//!
//! 为每个分区维护一个事件队列，保证单个分区同一时刻只处理一个事件，
//! 多个分区在 tokio 运行时上并发执行；同时提供定时器服务。

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::event::Event;
use crate::types::{RaftId, TimerId};

/// 事件通道容量（提供背压保护）
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// 分区调度状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
    /// 无待处理事件
    Idle = 0,
    /// 有待处理事件，已加入 active 集合
    Pending = 1,
    /// 正在被某个任务处理
    Active = 2,
    Stopped = 3,
}

impl PartitionStatus {
    fn from_u8(val: u8) -> Self {
        match val {
            0 => PartitionStatus::Idle,
            1 => PartitionStatus::Pending,
            2 => PartitionStatus::Active,
            _ => PartitionStatus::Stopped,
        }
    }
}

struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    fn new(status: PartitionStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    fn load(&self) -> PartitionStatus {
        PartitionStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, status: PartitionStatus) {
        self.0.store(status as u8, Ordering::Release);
    }

    fn transition(&self, from: PartitionStatus, to: PartitionStatus) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// 定时器事件
#[derive(Debug)]
struct TimerEvent {
    timer_id: TimerId,
    target: RaftId,
    event: Event,
    trigger_time: Instant,
}

impl PartialEq for TimerEvent {
    fn eq(&self, other: &Self) -> bool {
        self.trigger_time.eq(&other.trigger_time)
    }
}

impl Eq for TimerEvent {}

impl PartialOrd for TimerEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // 反转顺序实现最小堆
        other.trigger_time.cmp(&self.trigger_time)
    }
}

/// 事件处理 trait
#[async_trait::async_trait]
pub trait HandleEventTrait: Send + Sync {
    async fn handle_event(&self, event: Event);
}

struct PartitionCore {
    status: AtomicStatus,
    sender: mpsc::Sender<Event>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Event>>,
    handler: Box<dyn HandleEventTrait>,
}

pub struct TimerInner {
    next_timer_id: AtomicU64,
    heap: Mutex<BinaryHeap<TimerEvent>>,
    /// 已取消的定时器 ID（惰性删除）
    cancelled: Mutex<HashSet<TimerId>>,
}

/// 定时器服务：最小堆 + 惰性取消
#[derive(Clone)]
pub struct Timers {
    inner: Arc<TimerInner>,
    notify: Arc<Notify>,
}

impl Timers {
    fn new(notify: Arc<Notify>) -> Self {
        Self {
            notify,
            inner: Arc::new(TimerInner {
                next_timer_id: AtomicU64::new(1),
                heap: Mutex::new(BinaryHeap::new()),
                cancelled: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// 添加定时器，返回定时器 ID
    pub fn add_timer(&self, target: &RaftId, event: Event, delay: Duration) -> TimerId {
        let timer_id = self.inner.next_timer_id.fetch_add(1, Ordering::Relaxed);
        self.inner.heap.lock().push(TimerEvent {
            timer_id,
            target: target.clone(),
            event,
            trigger_time: Instant::now() + delay,
        });
        self.notify.notify_one();
        trace!("Added timer {} for {} with delay {:?}", timer_id, target, delay);
        timer_id
    }

    pub fn del_timer(&self, timer_id: TimerId) {
        self.inner.cancelled.lock().insert(timer_id);
    }

    pub fn del_all_timers_for(&self, target: &RaftId) {
        let mut heap = self.inner.heap.lock();
        let before = heap.len();
        let remaining: Vec<_> = heap.drain().filter(|t| &t.target != target).collect();
        heap.extend(remaining);
        let removed = before - heap.len();
        if removed > 0 {
            debug!("Removed {} timers for {}", removed, target);
        }
    }

    pub fn pending_timers(&self) -> usize {
        self.inner.heap.lock().len()
    }

    /// 弹出所有到期定时器，并返回距下一个定时器的时间
    fn take_expired(&self) -> (Vec<TimerEvent>, Option<Duration>) {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut heap = self.inner.heap.lock();
        let mut cancelled = self.inner.cancelled.lock();

        while let Some(timer) = heap.peek() {
            if cancelled.remove(&timer.timer_id) {
                heap.pop();
                continue;
            }
            if timer.trigger_time > now {
                return (expired, Some(timer.trigger_time - now));
            }
            if let Some(timer) = heap.pop() {
                expired.push(timer);
            }
        }
        (expired, None)
    }

    /// 清理已不在堆中的取消记录
    fn cleanup_cancelled(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        if cancelled.len() > 1000 {
            let heap = self.inner.heap.lock();
            let live: HashSet<_> = heap.iter().map(|t| t.timer_id).collect();
            cancelled.retain(|id| live.contains(id));
        }
    }
}

/// 发送事件结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendEventResult {
    Success,
    NotFound,
    SendFailed,
    ChannelFull,
}

pub struct PartitionDriverInner {
    timers: Timers,
    partitions: Mutex<HashMap<RaftId, Arc<PartitionCore>>>,
    active: Mutex<HashSet<RaftId>>,
    notify: Arc<Notify>,
    stop: AtomicBool,
}

/// Schedules events of many partition replicas.
#[derive(Clone)]
pub struct PartitionDriver {
    inner: Arc<PartitionDriverInner>,
}

impl Deref for PartitionDriver {
    type Target = PartitionDriverInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl PartitionDriver {
    pub fn new() -> Self {
        let notify = Arc::new(Notify::new());
        Self {
            inner: Arc::new(PartitionDriverInner {
                timers: Timers::new(notify.clone()),
                partitions: Mutex::new(HashMap::new()),
                active: Mutex::new(HashSet::new()),
                notify,
                stop: AtomicBool::new(false),
            }),
        }
    }

    pub fn timers(&self) -> Timers {
        self.inner.timers.clone()
    }

    pub fn add_partition(&self, id: RaftId, handler: Box<dyn HandleEventTrait>) {
        let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let core = PartitionCore {
            status: AtomicStatus::new(PartitionStatus::Idle),
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            handler,
        };
        self.partitions.lock().insert(id.clone(), Arc::new(core));
        info!("Added partition replica {}", id);
    }

    pub fn del_partition(&self, id: &RaftId) {
        if let Some(core) = self.partitions.lock().remove(id) {
            core.status.store(PartitionStatus::Stopped);
            self.timers.del_all_timers_for(id);
            info!("Removed partition replica {}", id);
        }
    }

    pub fn contains(&self, id: &RaftId) -> bool {
        self.partitions.lock().contains_key(id)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.notify.notify_waiters();
        // 唤醒可能处于等待中的主循环
        self.notify.notify_one();
        info!("PartitionDriver stop signal sent");
    }

    /// 向指定分区发送事件
    pub fn dispatch_event(&self, target: RaftId, event: Event) -> SendEventResult {
        let core = match self.partitions.lock().get(&target) {
            Some(core) => core.clone(),
            None => return SendEventResult::NotFound,
        };

        match core.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Event channel full for {}", target);
                return SendEventResult::ChannelFull;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return SendEventResult::SendFailed,
        }

        match core.status.load() {
            PartitionStatus::Idle => {
                if core
                    .status
                    .transition(PartitionStatus::Idle, PartitionStatus::Pending)
                {
                    self.active.lock().insert(target);
                    self.notify.notify_one();
                }
            }
            PartitionStatus::Pending | PartitionStatus::Active => {}
            PartitionStatus::Stopped => {
                warn!("Partition {} is stopped", target);
                return SendEventResult::NotFound;
            }
        }
        SendEventResult::Success
    }

    fn fire_expired_timers(&self) -> Option<Duration> {
        let (expired, next) = self.timers.take_expired();
        for timer in expired {
            match self.dispatch_event(timer.target.clone(), timer.event) {
                SendEventResult::Success => {}
                SendEventResult::NotFound => {
                    debug!("Timer {} for removed partition {} ignored", timer.timer_id, timer.target)
                }
                SendEventResult::SendFailed | SendEventResult::ChannelFull => {
                    warn!("Failed to deliver timer {} to {}", timer.timer_id, timer.target)
                }
            }
        }
        self.timers.cleanup_cancelled();
        next
    }

    /// 主循环：触发定时器并调度有事件的分区
    pub async fn main_loop(&self) {
        info!("Starting PartitionDriver main loop");
        loop {
            if self.stop.load(Ordering::Acquire) {
                info!("Stop signal received, exiting main loop");
                break;
            }
            let next = self.fire_expired_timers();
            self.process_active_partitions();

            match next {
                Some(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    fn process_active_partitions(&self) {
        let pending: HashSet<RaftId> = std::mem::take(&mut *self.active.lock());
        for id in pending {
            let driver = self.clone();
            tokio::spawn(async move {
                driver.process_partition(id).await;
            });
        }
    }

    /// 处理单个分区的所有排队事件
    async fn process_partition(&self, id: RaftId) {
        let core = match self.partitions.lock().get(&id) {
            Some(core) => core.clone(),
            None => return,
        };
        if !core
            .status
            .transition(PartitionStatus::Pending, PartitionStatus::Active)
        {
            trace!("Partition {} not pending: {:?}", id, core.status.load());
            return;
        }

        let mut receiver = core.receiver.lock().await;
        loop {
            match receiver.try_recv() {
                Ok(event) => {
                    if core.status.load() == PartitionStatus::Stopped {
                        return;
                    }
                    core.handler.handle_event(event).await;
                }
                Err(mpsc::error::TryRecvError::Empty) => {
                    if !core
                        .status
                        .transition(PartitionStatus::Active, PartitionStatus::Idle)
                    {
                        break;
                    }
                    // 转为 Idle 之后再检查一次，避免与 dispatch 竞争丢失唤醒
                    match receiver.try_recv() {
                        Ok(event) => {
                            let reclaimed = core
                                .status
                                .transition(PartitionStatus::Idle, PartitionStatus::Active);
                            // 仍持有接收端锁，先处理这条事件以保持顺序；
                            // 若已被重新调度，剩余事件交给新任务
                            core.handler.handle_event(event).await;
                            if reclaimed {
                                continue;
                            }
                            break;
                        }
                        Err(_) => break,
                    }
                }
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    core.status.store(PartitionStatus::Idle);
                    return;
                }
            }
        }
    }
}

impl Default for PartitionDriver {
    fn default() -> Self {
        Self::new()
    }
}
