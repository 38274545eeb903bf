use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::domain::RoutingKey;
use crate::error::Result;
use crate::service::{Mailbox, MailboxId, TopicSet};

/// 单个连接拥有的订阅 / Subscriptions owned by one connection
///
/// 关闭时只释放仍属于自己的邮箱，不会影响替换了它的新连接。
/// On close only mailboxes still owned by this connection are released, so a newer
/// connection that replaced it is left alone.
pub struct ConnectionSession {
    connection_id: String,
    user_id: Option<String>,
    topics: Arc<TopicSet>,
    owned: HashMap<RoutingKey, MailboxId>,
}

impl ConnectionSession {
    pub fn new(connection_id: impl Into<String>, topics: Arc<TopicSet>) -> Self {
        Self { connection_id: connection_id.into(), user_id: None, topics, owned: HashMap::new() }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn set_user(&mut self, user_id: impl Into<String>) {
        self.user_id = Some(user_id.into());
    }

    /// 订阅并记录所有权 / Subscribe and record ownership
    pub async fn open(&mut self, key: RoutingKey) -> Result<Mailbox> {
        let mailbox = self.topics.subscribe(&key).await?;
        debug!("connection {} opened {} as mailbox {}", self.connection_id, key, mailbox.id());
        self.owned.insert(key, mailbox.id());
        Ok(mailbox)
    }

    /// 关闭一个订阅 / Close one subscription
    pub fn close_key(&mut self, key: &RoutingKey) -> bool {
        match self.owned.remove(key) {
            Some(id) => self.topics.release(key, id),
            None => false,
        }
    }

    /// 邮箱在外部被关闭（被替换或驱逐）时忘记它，返回是否仍归本连接所有
    /// Forget a mailbox closed from outside (replaced or evicted); returns whether it was still ours
    pub fn forget(&mut self, key: &RoutingKey, id: MailboxId) -> bool {
        if self.owned.get(key) == Some(&id) {
            self.owned.remove(key);
            return true;
        }
        false
    }

    /// 释放全部订阅 / Release every subscription
    pub fn close(&mut self) {
        for (key, id) in self.owned.drain() {
            if self.topics.release(&key, id) {
                debug!("connection {} released {}", self.connection_id, key);
            }
        }
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn topics() -> Arc<TopicSet> {
        Arc::new(TopicSet::new(Arc::new(MemoryStore::new()), 3))
    }

    #[tokio::test]
    async fn test_close_releases_all_scopes() {
        let topics = topics();
        let mut session = ConnectionSession::new("c1", topics.clone());
        let keys = [RoutingKey::presence("bob"), RoutingKey::dm("bob", "d1"), RoutingKey::group("bob", "g1")];
        for key in keys.iter() {
            session.open(key.clone()).await.unwrap();
        }
        assert_eq!(topics.online_count(), 3);
        session.close();
        assert_eq!(topics.online_count(), 0);
    }

    #[tokio::test]
    async fn test_replaced_connection_does_not_evict_successor() {
        let topics = topics();
        let key = RoutingKey::presence("bob");
        let mut old = ConnectionSession::new("old", topics.clone());
        let old_mailbox = old.open(key.clone()).await.unwrap();
        let mut new = ConnectionSession::new("new", topics.clone());
        let _new_mailbox = new.open(key.clone()).await.unwrap();

        drop(old);
        assert!(topics.is_online(&key));
        assert!(!new.forget(&key, old_mailbox.id()));
        assert!(new.close_key(&key));
        assert!(!topics.is_online(&key));
    }
}
