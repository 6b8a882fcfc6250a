//! 状态更新广播
//!
//! 每个订阅者持有一个独立的有界 broadcast 通道，发布方只做 `send`，永远不会因为慢订阅者阻塞。
//! 通道写满时最旧的事件被覆盖，订阅端按溢出策略决定跳过还是断开。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use futures::stream::{self, Stream};
use taskq_config::{BroadcastConfig, OverflowPolicy};
use taskq_domain::events::{EventFilter, StatusUpdateEvent};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::observability::MetricsCollector;

struct SubscriberSlot {
    filter: EventFilter,
    sender: broadcast::Sender<StatusUpdateEvent>,
}

pub struct StatusBroadcaster {
    subscribers: RwLock<HashMap<u64, SubscriberSlot>>,
    next_id: AtomicU64,
    buffer: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

impl StatusBroadcaster {
    pub fn new(config: &BroadcastConfig) -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: config.subscriber_buffer.max(1),
            policy: config.overflow_policy,
            dropped: AtomicU64::new(0),
        })
    }

    pub fn subscribe(self: &Arc<Self>, filter: EventFilter) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = broadcast::channel(self.buffer);
        match self.subscribers.write() {
            Ok(mut subscribers) => {
                subscribers.insert(
                    id,
                    SubscriberSlot {
                        filter: filter.clone(),
                        sender,
                    },
                );
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(
                    id,
                    SubscriberSlot {
                        filter: filter.clone(),
                        sender,
                    },
                );
            }
        }
        debug!("新增订阅者 {}: {:?}", id, filter);
        MetricsCollector::set_subscribers(self.subscriber_count());

        Subscription {
            id,
            filter,
            receiver,
            policy: self.policy,
            broadcaster: Arc::downgrade(self),
            pending: None,
            finished: false,
        }
    }

    /// 向所有匹配的订阅者投递事件，返回投递数量
    ///
    /// 单任务订阅即使不匹配其余条件也会收到该任务的终态事件，用于结束订阅。
    pub fn publish(&self, event: &StatusUpdateEvent) -> usize {
        let subscribers = match self.subscribers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut delivered = 0;
        for slot in subscribers.values() {
            let relevant = slot.filter.matches(event) || slot.filter.ends_with(event);
            if relevant && slot.sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        match self.subscribers.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// 因订阅端落后而被丢弃的事件总数
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn unsubscribe(&self, id: u64) {
        let removed = match self.subscribers.write() {
            Ok(mut guard) => guard.remove(&id).is_some(),
            Err(poisoned) => poisoned.into_inner().remove(&id).is_some(),
        };
        if removed {
            debug!("订阅者 {} 已注销", id);
            MetricsCollector::set_subscribers(self.subscriber_count());
        }
    }

    fn record_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
        MetricsCollector::record_events_dropped(n);
    }
}

/// 订阅句柄，drop 时自动注销
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    filter: EventFilter,
    receiver: broadcast::Receiver<StatusUpdateEvent>,
    policy: OverflowPolicy,
    broadcaster: Weak<StatusBroadcaster>,
    pending: Option<StatusUpdateEvent>,
    finished: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    /// 在通道中的事件之前先投递一个快照事件（例如订阅时任务已处于终态）
    pub fn prepend(&mut self, event: StatusUpdateEvent) {
        self.pending = Some(event);
    }

    /// 接收下一个事件；返回 None 表示订阅结束
    ///
    /// 单任务订阅在终态事件之后结束；Disconnect 策略下落后的订阅者也会结束。
    pub async fn recv(&mut self) -> Option<StatusUpdateEvent> {
        if self.finished {
            return None;
        }
        if let Some(event) = self.pending.take() {
            if let Some(event) = self.accept(event) {
                return Some(event);
            }
        }
        loop {
            if self.finished {
                return None;
            }
            match self.receiver.recv().await {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    if let Some(broadcaster) = self.broadcaster.upgrade() {
                        broadcaster.record_dropped(skipped);
                    }
                    match self.policy {
                        OverflowPolicy::DropOldest => {
                            warn!("订阅者 {} 处理过慢，丢弃 {} 个旧事件", self.id, skipped);
                        }
                        OverflowPolicy::Disconnect => {
                            warn!("订阅者 {} 处理过慢，断开订阅", self.id);
                            self.finished = true;
                            return None;
                        }
                    }
                }
                Err(RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// 终态事件结束订阅；不匹配过滤条件的终态事件只用于结束，不投递
    fn accept(&mut self, event: StatusUpdateEvent) -> Option<StatusUpdateEvent> {
        if self.filter.ends_with(&event) {
            self.finished = true;
        }
        self.filter.matches(&event).then_some(event)
    }

    pub fn into_stream(self) -> impl Stream<Item = StatusUpdateEvent> + Send {
        stream::unfold(self, |mut subscription| async move {
            subscription
                .recv()
                .await
                .map(|event| (event, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(broadcaster) = self.broadcaster.upgrade() {
            broadcaster.unsubscribe(self.id);
        }
    }
}
