pub mod event;
pub mod routing;
pub mod status;

use serde::{Deserialize, Serialize};

pub use event::Event;
pub use routing::{RoutingKey, Scope};
pub use status::DeliveryStatus;

/// 离线待投递记录 / Pending (offline) entry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingEntry {
    pub id: u64,
    pub key: RoutingKey,
    pub event: Event,
    pub created_at: i64,
}

/// 单聊消息元信息 / Direct message metadata
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DmMessageMeta {
    pub message_id: String,
    pub dm_chat_id: String,
    pub sender_id: String,
    pub recipient_id: String,
}

/// 群聊消息元信息 / Group message metadata
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupMessageMeta {
    pub message_id: String,
    pub group_id: String,
    pub sender_id: String,
}

/// 回执请求 / Acknowledgement request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AckRequest {
    pub message_id: String,
    pub status: DeliveryStatus,
    pub actor_user_id: String,
    /// 毫秒时间戳 / Millisecond timestamp
    pub at: i64,
}

impl AckRequest {
    pub fn new(message_id: impl Into<String>, status: DeliveryStatus, actor_user_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            status,
            actor_user_id: actor_user_id.into(),
            at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 回执处理结果 / Acknowledgement outcome
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AckOutcome {
    /// 处理后对外可见的状态 / Externally visible status after processing
    pub status: DeliveryStatus,
    pub changed: bool,
    pub should_broadcast: bool,
}
