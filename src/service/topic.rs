//! 主题注册表 / Topic registry
//!
//! 在邮箱注册表之上按作用域（在线、单聊会话、群聊会话）提供订阅/退订/发送，
//! 每个作用域一个实例，互不共享邮箱状态，并各自拥有离线兜底表。
//! Per-scope subscribe/unsubscribe/send over the mailbox registry. One instance per
//! scope (presence, dm session, group session); instances never share mailbox state
//! and each owns its own offline fallback table.

use std::sync::Arc;

use tracing::{debug, error, info};

use super::mailbox::{Delivery, Mailbox, MailboxId, MailboxRegistry};
use crate::domain::{Event, RoutingKey, Scope};
use crate::error::{DeliveryError, Result};
use crate::storage::DeliveryStore;

/// 发送结果 / Send outcome
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// 推送到在线邮箱 / Pushed to a live mailbox
    Live,
    /// 写入离线队列 / Written to the pending queue
    Queued,
}

pub struct Topic {
    scope: Scope,
    registry: MailboxRegistry,
    store: Arc<dyn DeliveryStore>,
}

impl Topic {
    pub fn new(scope: Scope, store: Arc<dyn DeliveryStore>, mailbox_capacity: usize) -> Self {
        Self { scope, registry: MailboxRegistry::new(mailbox_capacity), store }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    fn ensure_scope(&self, key: &RoutingKey) -> Result<()> {
        if key.scope() != self.scope {
            return Err(DeliveryError::ScopeMismatch { key: key.clone(), expected: self.scope });
        }
        Ok(())
    }

    /// 订阅：注册邮箱后同步取出离线事件（最旧在前）放入邮箱积压
    /// Subscribe: register the mailbox, then synchronously drain pending entries
    /// (oldest first) into its backlog before handing it back.
    pub async fn subscribe(&self, key: &RoutingKey) -> Result<Mailbox> {
        self.ensure_scope(key)?;
        let mut mailbox = self.registry.register(key);
        match self.store.drain_pending(key).await {
            Ok(pending) => {
                if !pending.is_empty() {
                    info!("📬 离线投递 / Draining {} pending events into {}", pending.len(), key);
                }
                mailbox.extend_backlog(pending);
                Ok(mailbox)
            }
            Err(e) => {
                // 离线队列未被消费，下次订阅时重试 / pending rows stay put for the next subscribe
                self.registry.release(key, mailbox.id());
                error!("❌ 离线队列读取失败 / Failed to drain pending for {}: {}", key, e);
                Err(e.into())
            }
        }
    }

    pub fn unsubscribe(&self, key: &RoutingKey) -> bool {
        self.registry.unregister(key)
    }

    /// 连接关闭时释放自己的邮箱 / Release a connection's own mailbox on close
    pub fn release(&self, key: &RoutingKey, id: MailboxId) -> bool {
        self.registry.release(key, id)
    }

    /// 发送：在线则推送，否则写入离线队列 / Push when online, otherwise persist
    pub async fn send(&self, key: &RoutingKey, event: Event) -> Result<SendOutcome> {
        match self.deliver_live(key, event)? {
            None => Ok(SendOutcome::Live),
            Some(event) => {
                self.persist(key, &event).await?;
                Ok(SendOutcome::Queued)
            }
        }
    }

    /// 非阻塞在线推送；未送达时把事件交还给调用方 / Non-blocking live push; hands the event back when not delivered
    pub fn deliver_live(&self, key: &RoutingKey, event: Event) -> Result<Option<Event>> {
        self.ensure_scope(key)?;
        match self.registry.deliver(key, event) {
            Delivery::Delivered => {
                debug!("📤 live delivery to {}", key);
                Ok(None)
            }
            Delivery::NoMailbox(event) | Delivery::Saturated(event) => Ok(Some(event)),
        }
    }

    /// 写入离线队列 / Write to the pending queue
    pub async fn persist(&self, key: &RoutingKey, event: &Event) -> Result<()> {
        self.ensure_scope(key)?;
        self.store.enqueue_pending(key, event).await?;
        debug!("📥 queued {} for offline {}", event.event, key);
        Ok(())
    }

    pub fn is_online(&self, key: &RoutingKey) -> bool {
        self.registry.is_online(key)
    }

    pub fn online_count(&self) -> usize {
        self.registry.len()
    }
}

/// 三个作用域的主题实例 / The three per-scope topic instances
pub struct TopicSet {
    presence: Topic,
    dm: Topic,
    group: Topic,
}

impl TopicSet {
    pub fn new(store: Arc<dyn DeliveryStore>, mailbox_capacity: usize) -> Self {
        Self {
            presence: Topic::new(Scope::Presence, store.clone(), mailbox_capacity),
            dm: Topic::new(Scope::DmSession, store.clone(), mailbox_capacity),
            group: Topic::new(Scope::GroupSession, store, mailbox_capacity),
        }
    }

    pub fn for_scope(&self, scope: Scope) -> &Topic {
        match scope {
            Scope::Presence => &self.presence,
            Scope::DmSession => &self.dm,
            Scope::GroupSession => &self.group,
        }
    }

    /// 按路由键形态选择主题 / Pick the topic by routing key shape
    pub fn for_key(&self, key: &RoutingKey) -> &Topic {
        self.for_scope(key.scope())
    }

    pub async fn subscribe(&self, key: &RoutingKey) -> Result<Mailbox> {
        self.for_key(key).subscribe(key).await
    }

    pub fn unsubscribe(&self, key: &RoutingKey) -> bool {
        self.for_key(key).unsubscribe(key)
    }

    pub fn release(&self, key: &RoutingKey, id: MailboxId) -> bool {
        self.for_key(key).release(key, id)
    }

    pub fn is_online(&self, key: &RoutingKey) -> bool {
        self.for_key(key).is_online(key)
    }

    pub fn online_count(&self) -> usize {
        Scope::ALL.iter().map(|s| self.for_scope(*s).online_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn ev(name: &str) -> Event {
        Event::new(name, json!({ "name": name }))
    }

    fn fixture() -> (Arc<MemoryStore>, Topic) {
        let store = Arc::new(MemoryStore::new());
        let topic = Topic::new(Scope::DmSession, store.clone(), 3);
        (store, topic)
    }

    #[tokio::test]
    async fn test_subscribe_drains_then_live() {
        let (store, topic) = fixture();
        let key = RoutingKey::dm("bob", "d1");
        assert_eq!(topic.send(&key, ev("e1")).await.unwrap(), SendOutcome::Queued);
        assert_eq!(topic.send(&key, ev("e2")).await.unwrap(), SendOutcome::Queued);

        let mut mailbox = topic.subscribe(&key).await.unwrap();
        assert_eq!(store.pending_len(&key), 0);
        assert_eq!(topic.send(&key, ev("e3")).await.unwrap(), SendOutcome::Live);

        for expected in ["e1", "e2", "e3"] {
            assert_eq!(mailbox.recv().await.unwrap().event, expected);
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_then_send_is_persisted() {
        let (store, topic) = fixture();
        let key = RoutingKey::dm("bob", "d1");
        let _mailbox = topic.subscribe(&key).await.unwrap();
        assert!(topic.unsubscribe(&key));
        assert_eq!(topic.send(&key, ev("late")).await.unwrap(), SendOutcome::Queued);
        assert_eq!(store.pending_len(&key), 1);
    }

    #[tokio::test]
    async fn test_wrong_scope_rejected() {
        let (_store, topic) = fixture();
        let key = RoutingKey::group("bob", "g1");
        assert!(matches!(
            topic.send(&key, ev("x")).await,
            Err(DeliveryError::ScopeMismatch { .. })
        ));
        assert!(topic.subscribe(&key).await.is_err());
    }

    #[tokio::test]
    async fn test_drain_failure_keeps_pending_and_releases() {
        let (store, topic) = fixture();
        let key = RoutingKey::dm("bob", "d1");
        topic.send(&key, ev("e1")).await.unwrap();
        store.fail_next("drain_pending");
        assert!(topic.subscribe(&key).await.is_err());
        assert!(!topic.is_online(&key));
        assert_eq!(store.pending_len(&key), 1);
    }

    #[tokio::test]
    async fn test_store_failure_on_queue_is_reported() {
        let (store, topic) = fixture();
        let key = RoutingKey::dm("bob", "d1");
        store.fail_next("enqueue_pending");
        assert!(topic.send(&key, ev("lost")).await.is_err());
    }

    #[tokio::test]
    async fn test_topics_do_not_share_mailboxes() {
        let store = Arc::new(MemoryStore::new());
        let topics = TopicSet::new(store.clone(), 3);
        let dm = RoutingKey::dm("bob", "7");
        let _mailbox = topics.subscribe(&dm).await.unwrap();
        assert!(topics.is_online(&dm));
        assert!(!topics.is_online(&RoutingKey::group("bob", "7")));
        assert_eq!(topics.for_scope(Scope::GroupSession).online_count(), 0);
        assert_eq!(topics.online_count(), 1);
    }
}
