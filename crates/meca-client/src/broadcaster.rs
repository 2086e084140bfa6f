//! 状态广播
//!
//! 固定节拍（默认 100ms）把所有机械臂的状态快照推给订阅者，与命令通路互不影响。
//! 服务层和序列引擎通过 [`EventPublisher`] 投递的事件在下一个节拍一并送出。
//!
//! 每个订阅者有独立的有界缓冲；缓冲满时丢弃最旧的消息，慢订阅者不会阻塞其他订阅者，
//! 也不会阻塞广播线程。投递是尽力而为、每节拍至多一次。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use meca_tools::BroadcasterSettings;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::events::{BroadcastMessage, StatusSnapshot};

/// 状态来源（通常是 [`RobotRegistry`](crate::RobotRegistry)）
pub trait StatusSource: Send + Sync {
    fn status_snapshots(&self) -> Vec<StatusSnapshot>;
}

/// 事件投递端
pub type EventPublisher = Sender<BroadcastMessage>;

struct Subscriber {
    id: u64,
    robot_filter: Option<String>,
    sender: Sender<BroadcastMessage>,
    /// 同一通道的接收端，缓冲满时用来弹出最旧的消息
    overflow: Receiver<BroadcastMessage>,
    alive: Weak<()>,
}

impl Subscriber {
    fn wants(&self, message: &BroadcastMessage) -> bool {
        self.robot_filter
            .as_deref()
            .is_none_or(|robot_id| robot_id == message.robot_id())
    }

    /// 投递；返回 false 表示订阅者已离开
    fn deliver(&self, message: BroadcastMessage, dropped: &AtomicU64) -> bool {
        if self.alive.strong_count() == 0 {
            return false;
        }
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                let _ = self.overflow.try_recv();
                dropped.fetch_add(1, Ordering::Relaxed);
                trace!("Subscriber {} lagging, dropped oldest message", self.id);
                // 只有广播线程写入，弹出后必有空位
                self.sender.try_send(message).is_ok()
            },
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// 订阅句柄（drop 即退订）
pub struct Subscription {
    id: u64,
    receiver: Receiver<BroadcastMessage>,
    _alive: Arc<()>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn try_recv(&self) -> Option<BroadcastMessage> {
        self.receiver.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<BroadcastMessage> {
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => Some(message),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// 取出当前缓冲中的全部消息
    pub fn drain(&self) -> Vec<BroadcastMessage> {
        self.receiver.try_iter().collect()
    }

    pub fn receiver(&self) -> &Receiver<BroadcastMessage> {
        &self.receiver
    }
}

struct Hub {
    subscribers: Mutex<Vec<Subscriber>>,
    events: Receiver<BroadcastMessage>,
    dropped: AtomicU64,
}

impl Hub {
    fn broadcast(&self, message: &BroadcastMessage) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| {
            if !subscriber.wants(message) {
                return subscriber.alive.strong_count() > 0;
            }
            let kept = subscriber.deliver(message.clone(), &self.dropped);
            if !kept {
                debug!("Subscriber {} gone, removed", subscriber.id);
            }
            kept
        });
    }

    fn tick(&self, source: Option<&dyn StatusSource>) {
        let pending: Vec<_> = self.events.try_iter().collect();
        for message in &pending {
            self.broadcast(message);
        }
        if let Some(source) = source {
            for snapshot in source.status_snapshots() {
                self.broadcast(&BroadcastMessage::StatusUpdate(snapshot));
            }
        }
    }
}

struct Worker {
    handle: thread::JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

/// 状态广播器
pub struct StatusBroadcaster {
    settings: BroadcasterSettings,
    hub: Arc<Hub>,
    publisher: EventPublisher,
    next_id: AtomicU64,
    worker: Mutex<Option<Worker>>,
}

impl StatusBroadcaster {
    pub fn new(settings: BroadcasterSettings) -> Self {
        let (publisher, events) = crossbeam_channel::unbounded();
        Self {
            settings,
            hub: Arc::new(Hub {
                subscribers: Mutex::new(Vec::new()),
                events,
                dropped: AtomicU64::new(0),
            }),
            publisher,
            next_id: AtomicU64::new(1),
            worker: Mutex::new(None),
        }
    }

    /// 事件投递端（可克隆，发送不阻塞）
    pub fn publisher(&self) -> EventPublisher {
        self.publisher.clone()
    }

    /// 订阅所有机械臂
    pub fn subscribe(&self) -> Subscription {
        self.add_subscriber(None)
    }

    /// 只订阅一台机械臂
    pub fn subscribe_to(&self, robot_id: &str) -> Subscription {
        self.add_subscriber(Some(robot_id.to_string()))
    }

    fn add_subscriber(&self, robot_filter: Option<String>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = crossbeam_channel::bounded(self.settings.buffer.max(1));
        let alive = Arc::new(());

        self.hub.subscribers.lock().push(Subscriber {
            id,
            robot_filter,
            sender,
            overflow: receiver.clone(),
            alive: Arc::downgrade(&alive),
        });
        debug!("Subscriber {} added", id);

        Subscription {
            id,
            receiver,
            _alive: alive,
        }
    }

    /// 退订；返回订阅是否存在
    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut subscribers = self.hub.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.id != id);
        before != subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.hub.subscribers.lock();
        subscribers.retain(|subscriber| subscriber.alive.strong_count() > 0);
        subscribers.len()
    }

    /// 因缓冲满被丢弃的消息总数
    pub fn dropped_messages(&self) -> u64 {
        self.hub.dropped.load(Ordering::Relaxed)
    }

    /// 立即投递一条消息（不等节拍）
    pub fn broadcast(&self, message: &BroadcastMessage) {
        self.hub.broadcast(message);
    }

    /// 手动执行一个节拍：先送出积压事件，再送出状态快照
    pub fn tick(&self, source: &dyn StatusSource) {
        self.hub.tick(Some(source));
    }

    /// 启动广播线程（已启动则忽略）
    pub fn start(&self, source: Arc<dyn StatusSource>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let hub = self.hub.clone();
        let period = self.settings.interval();

        match thread::Builder::new()
            .name("meca-broadcaster".into())
            .spawn(move || Self::broadcast_loop(hub, source, period, shutdown_clone))
        {
            Ok(handle) => *worker = Some(Worker { handle, shutdown }),
            Err(e) => warn!("Failed to spawn broadcaster: {}", e),
        }
    }

    fn broadcast_loop(
        hub: Arc<Hub>,
        source: Arc<dyn StatusSource>,
        period: Duration,
        shutdown: Arc<AtomicBool>,
    ) {
        let mut next_tick = Instant::now() + period;

        while !shutdown.load(Ordering::Relaxed) {
            hub.tick(Some(source.as_ref()));

            let now = Instant::now();
            if next_tick > now {
                spin_sleep::sleep(next_tick - now);
                next_tick += period;
            } else {
                // 超时则重置锚点，不追赶
                next_tick = now + period;
            }
        }
        // 退出前送出剩余事件
        hub.tick(None);
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// 停止广播线程
    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.shutdown.store(true, Ordering::Relaxed);
            let _ = worker.handle.join();
        }
    }
}

impl Drop for StatusBroadcaster {
    fn drop(&mut self) {
        self.stop();
    }
}
