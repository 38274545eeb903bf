//! 生产者通知 / Producer notifications
//!
//! 聊天业务处理器（发消息、上下线、新建会话、输入状态）通过这里把事件交给投递代理。
//! Chat handlers (message sent, presence change, new chat, activity change) hand their
//! events to the broker through these helpers.

use serde_json::json;

use super::broker::{DeliveryBroker, PublishHandle};
use crate::domain::{DmMessageMeta, Event, GroupMessageMeta, RoutingKey};

pub const NEW_DM_MESSAGE: &str = "new_dm_message";
pub const NEW_GROUP_MESSAGE: &str = "new_group_message";
pub const PRESENCE_CHANGED: &str = "presence_changed";
pub const NEW_CHAT: &str = "new_chat";
pub const ACTIVITY_CHANGED: &str = "activity_changed";

#[derive(Clone)]
pub struct Notifier {
    broker: DeliveryBroker,
}

impl Notifier {
    pub fn new(broker: DeliveryBroker) -> Self {
        Self { broker }
    }

    /// 单聊新消息 -> 接收者的单聊会话 / New DM -> recipient's DM session
    pub fn dm_message_sent(&self, meta: &DmMessageMeta, payload: serde_json::Value) -> PublishHandle {
        self.broker.publish(
            RoutingKey::dm(&meta.recipient_id, &meta.dm_chat_id),
            Event::new(
                NEW_DM_MESSAGE,
                json!({
                    "messageId": meta.message_id,
                    "dmChatId": meta.dm_chat_id,
                    "senderId": meta.sender_id,
                    "message": payload,
                }),
            ),
        )
    }

    /// 群聊新消息 -> 除发送者外每个成员的群聊会话
    /// New group message -> every member's group session except the sender
    pub fn group_message_sent<'a, I>(&self, meta: &GroupMessageMeta, members: I, payload: serde_json::Value) -> Vec<PublishHandle>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let event = Event::new(
            NEW_GROUP_MESSAGE,
            json!({
                "messageId": meta.message_id,
                "groupId": meta.group_id,
                "senderId": meta.sender_id,
                "message": payload,
            }),
        );
        let keys = members
            .into_iter()
            .filter(|m| *m != meta.sender_id)
            .map(|m| RoutingKey::group(m, &meta.group_id));
        self.broker.fan_out(keys, &event)
    }

    /// 上下线 -> 联系人的在线通道 / Presence change -> contacts' presence keys
    pub fn presence_changed<'a, I>(&self, user_id: &str, online: bool, contacts: I) -> Vec<PublishHandle>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let event = Event::new(
            PRESENCE_CHANGED,
            json!({ "userId": user_id, "online": online, "at": chrono::Utc::now().timestamp_millis() }),
        );
        self.broker.fan_out(contacts.into_iter().map(RoutingKey::presence), &event)
    }

    /// 新建会话 -> 成员的在线通道 / New chat -> members' presence keys
    pub fn chat_created<'a, I>(&self, chat: serde_json::Value, members: I) -> Vec<PublishHandle>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let event = Event::new(NEW_CHAT, chat);
        self.broker.fan_out(members.into_iter().map(RoutingKey::presence), &event)
    }

    /// 输入状态 -> 对端的会话通道 / Activity change -> peer's chat session
    pub fn activity_changed(&self, target: RoutingKey, user_id: &str, activity: &str) -> PublishHandle {
        self.broker.publish(
            target,
            Event::new(ACTIVITY_CHANGED, json!({ "userId": user_id, "activity": activity })),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::topic::TopicSet;
    use crate::storage::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_group_message_skips_sender() {
        let store = Arc::new(MemoryStore::new());
        let broker = DeliveryBroker::new(Arc::new(TopicSet::new(store.clone(), 3)), 8);
        let notifier = Notifier::new(broker);
        let meta = GroupMessageMeta { message_id: "m1".into(), group_id: "g1".into(), sender_id: "alice".into() };

        let handles = notifier.group_message_sent(&meta, ["alice", "bob", "carol"], json!("hi"));
        assert_eq!(handles.len(), 2);
        for h in handles {
            h.await;
        }
        assert_eq!(store.pending_len(&RoutingKey::group("alice", "g1")), 0);
        assert_eq!(store.pending_len(&RoutingKey::group("bob", "g1")), 1);
        assert_eq!(store.pending_len(&RoutingKey::group("carol", "g1")), 1);
    }

    #[tokio::test]
    async fn test_dm_message_goes_to_recipient_session() {
        let store = Arc::new(MemoryStore::new());
        let broker = DeliveryBroker::new(Arc::new(TopicSet::new(store.clone(), 3)), 8);
        let mut mailbox = broker.topics().subscribe(&RoutingKey::dm("bob", "d1")).await.unwrap();
        let notifier = Notifier::new(broker);
        let meta = DmMessageMeta {
            message_id: "m1".into(),
            dm_chat_id: "d1".into(),
            sender_id: "alice".into(),
            recipient_id: "bob".into(),
        };
        notifier.dm_message_sent(&meta, json!({ "text": "hey" })).await;
        let ev = mailbox.recv().await.unwrap();
        assert_eq!(ev.event, NEW_DM_MESSAGE);
        assert_eq!(ev.data["message"]["text"], "hey");
    }
}
