//! 邮箱注册表 / Mailbox registry
//!
//! 路由键 -> 在线出站通道。每个路由键同一时刻最多一个邮箱；重复注册会替换并关闭旧邮箱。
//! Routing key -> live outbound channel. At most one mailbox per key at any instant;
//! registering again replaces the old mailbox and closes it.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::domain::{Event, RoutingKey};

/// 邮箱唯一ID（注册代次）/ Mailbox id (registration generation)
pub type MailboxId = u64;

pub type MailboxStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// 投递结果 / Delivery result
#[derive(Debug)]
pub enum Delivery {
    /// 已进入在线邮箱 / Accepted by a live mailbox
    Delivered,
    /// 没有在线邮箱，事件原样返回 / No live mailbox, event handed back
    NoMailbox(Event),
    /// 邮箱已满被驱逐，事件原样返回 / Mailbox full and evicted, event handed back
    Saturated(Event),
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered)
    }
}

/// 连接侧持有的邮箱接收端 / Receiving half owned by the connection handler
///
/// 订阅时取出的离线积压总是先于在线事件被读取。
/// A backlog drained at subscribe time is always read before live events.
#[derive(Debug)]
pub struct Mailbox {
    id: MailboxId,
    key: RoutingKey,
    backlog: VecDeque<Event>,
    receiver: mpsc::Receiver<Event>,
}

impl Mailbox {
    pub fn id(&self) -> MailboxId {
        self.id
    }

    pub fn key(&self) -> &RoutingKey {
        &self.key
    }

    /// 积压中尚未读取的事件数 / Backlog events not yet read
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// 接收下一个事件；邮箱被注销或替换后返回 None
    /// Receive the next event; `None` once the mailbox was unregistered or replaced
    pub async fn recv(&mut self) -> Option<Event> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.backlog.pop_front().or_else(|| self.receiver.try_recv().ok())
    }

    pub(crate) fn extend_backlog(&mut self, events: Vec<Event>) {
        self.backlog.extend(events);
    }

    /// 转为事件流，便于连接层合并多个邮箱 / Turn into a stream so a connection can merge mailboxes
    pub fn into_stream(self) -> MailboxStream {
        Box::pin(futures_util::stream::unfold(self, |mut mailbox| async move {
            mailbox.recv().await.map(|event| (event, mailbox))
        }))
    }
}

struct Slot {
    id: MailboxId,
    sender: mpsc::Sender<Event>,
}

/// 邮箱注册表 / Mailbox registry
///
/// 所有变更在同一把锁内完成，临界区只包含查表与非阻塞发送。
/// Every mutation runs under one lock; the critical section is a map lookup plus a
/// non-blocking send.
pub struct MailboxRegistry {
    slots: Mutex<HashMap<RoutingKey, Slot>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl MailboxRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// 注册新邮箱，替换并关闭旧邮箱 / Register a new mailbox, replacing and closing any old one
    pub fn register(&self, key: &RoutingKey) -> Mailbox {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let replaced = self.slots.lock().insert(key.clone(), Slot { id, sender });
        if let Some(old) = replaced {
            debug!("🔁 mailbox {} for {} replaced by {}", old.id, key, id);
        }
        Mailbox { id, key: key.clone(), backlog: VecDeque::new(), receiver }
    }

    /// 注销并关闭邮箱；不存在时为空操作 / Remove and close the mailbox; no-op when absent
    pub fn unregister(&self, key: &RoutingKey) -> bool {
        self.slots.lock().remove(key).is_some()
    }

    /// 仅当槽位仍是该邮箱时注销 / Unregister only if the slot still holds this mailbox
    pub fn release(&self, key: &RoutingKey, id: MailboxId) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(key) {
            Some(slot) if slot.id == id => {
                slots.remove(key);
                true
            }
            _ => false,
        }
    }

    /// 投递到在线邮箱 / Deliver to the live mailbox
    pub fn deliver(&self, key: &RoutingKey, event: Event) -> Delivery {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get(key) else {
            return Delivery::NoMailbox(event);
        };
        match slot.sender.try_send(event) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(event)) => {
                let evicted = slots.remove(key).map(|s| s.id);
                warn!("⚠️  邮箱已满，驱逐慢消费者 / Mailbox full, evicting slow consumer {:?} for {}", evicted, key);
                Delivery::Saturated(event)
            }
            Err(TrySendError::Closed(event)) => {
                slots.remove(key);
                debug!("mailbox for {} dropped by its consumer", key);
                Delivery::NoMailbox(event)
            }
        }
    }

    pub fn is_online(&self, key: &RoutingKey) -> bool {
        self.slots.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ev(n: i64) -> Event {
        Event::new("message", json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_deliver_preserves_order() {
        let registry = MailboxRegistry::new(3);
        let key = RoutingKey::presence("bob");
        let mut mailbox = registry.register(&key);
        for n in 0..3 {
            assert!(registry.deliver(&key, ev(n)).is_delivered());
        }
        for n in 0..3 {
            assert_eq!(mailbox.recv().await.unwrap(), ev(n));
        }
    }

    #[tokio::test]
    async fn test_register_twice_closes_previous() {
        let registry = MailboxRegistry::new(3);
        let key = RoutingKey::dm("bob", "d1");
        let mut first = registry.register(&key);
        let mut second = registry.register(&key);
        assert_eq!(registry.len(), 1);
        assert!(first.recv().await.is_none());

        assert!(registry.deliver(&key, ev(1)).is_delivered());
        assert_eq!(second.recv().await.unwrap(), ev(1));
    }

    #[tokio::test]
    async fn test_unregister_is_noop_when_absent() {
        let registry = MailboxRegistry::new(3);
        let key = RoutingKey::presence("nobody");
        assert!(!registry.unregister(&key));
        match registry.deliver(&key, ev(1)) {
            Delivery::NoMailbox(event) => assert_eq!(event, ev(1)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_release_ignores_replaced_mailbox() {
        let registry = MailboxRegistry::new(3);
        let key = RoutingKey::group("bob", "g1");
        let stale = registry.register(&key);
        let fresh = registry.register(&key);
        assert!(!registry.release(&key, stale.id()));
        assert!(registry.is_online(&key));
        assert!(registry.release(&key, fresh.id()));
        assert!(!registry.is_online(&key));
    }

    #[tokio::test]
    async fn test_saturated_mailbox_is_evicted() {
        let registry = MailboxRegistry::new(2);
        let key = RoutingKey::presence("slow");
        let mut mailbox = registry.register(&key);
        assert!(registry.deliver(&key, ev(1)).is_delivered());
        assert!(registry.deliver(&key, ev(2)).is_delivered());
        assert!(matches!(registry.deliver(&key, ev(3)), Delivery::Saturated(_)));
        assert!(!registry.is_online(&key));

        // 已缓冲的事件仍可读完，之后关闭 / buffered events drain, then closed
        assert_eq!(mailbox.recv().await.unwrap(), ev(1));
        assert_eq!(mailbox.recv().await.unwrap(), ev(2));
        assert!(mailbox.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_consumer_counts_as_offline() {
        let registry = MailboxRegistry::new(2);
        let key = RoutingKey::presence("gone");
        drop(registry.register(&key));
        assert!(matches!(registry.deliver(&key, ev(1)), Delivery::NoMailbox(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_backlog_precedes_live_events() {
        let registry = MailboxRegistry::new(3);
        let key = RoutingKey::presence("bob");
        let mut mailbox = registry.register(&key);
        assert!(registry.deliver(&key, ev(3)).is_delivered());
        mailbox.extend_backlog(vec![ev(1), ev(2)]);
        assert_eq!(mailbox.try_recv(), Some(ev(1)));
        assert_eq!(mailbox.recv().await, Some(ev(2)));
        assert_eq!(mailbox.recv().await, Some(ev(3)));
    }
}
