//! 存储模块 - 外部持久化协作方
//! Storage Module - external durable collaborator
//!
//! 投递核心只通过 [`DeliveryStore`] 访问持久化：离线兜底队列、单聊状态、群聊回执与成员。
//! The delivery core reaches persistence only through [`DeliveryStore`]: the offline
//! fallback queue, DM status, group acknowledgements and membership.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{DeliveryStatus, DmMessageMeta, Event, GroupMessageMeta, RoutingKey};

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// 存储错误 / Store error
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("存储不可用: {0}")]
    Unavailable(String),
    #[error("未找到记录: {0}")]
    NotFound(String),
    #[error("存储后端错误: {0}")]
    Backend(String),
    #[error("序列化错误: {0}")]
    Serde(#[from] serde_json::Error),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(e.to_string())
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// 投递存储trait，便于测试替换 / Delivery store trait, swappable for tests
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// 追加离线事件 / Append an offline event
    async fn enqueue_pending(&self, key: &RoutingKey, event: &Event) -> StoreResult<()>;

    /// 按写入顺序取出并消费离线事件 / Take pending events oldest first; they are not returned again
    async fn drain_pending(&self, key: &RoutingKey) -> StoreResult<Vec<Event>>;

    /// 条件推进单聊状态，返回是否变更 / Conditionally advance DM status, returns whether it changed
    async fn advance_dm_status(&self, message_id: &str, status: DeliveryStatus, at: i64) -> StoreResult<bool>;

    /// 记录群聊成员回执（幂等），并可在同一原子操作内条件推进聚合状态
    /// Record a member's group acknowledgement (idempotent) and, in the same atomic
    /// step, conditionally advance the aggregate to `advance_to`. Returns whether the
    /// aggregate changed. On error nothing is written.
    async fn record_group_ack(
        &self,
        message_id: &str,
        recipient_id: &str,
        status: DeliveryStatus,
        at: i64,
        advance_to: Option<DeliveryStatus>,
    ) -> StoreResult<bool>;

    /// 当前群成员（排除指定用户）/ Current group members excluding one user
    async fn current_group_recipients(&self, group_id: &str, excluding_user_id: &str) -> StoreResult<HashSet<String>>;

    /// 条件推进群聊聚合状态，返回是否变更 / Conditionally advance group aggregate status
    async fn advance_group_status(&self, message_id: &str, status: DeliveryStatus) -> StoreResult<bool>;

    /// 已回执到该阶段或之后的成员 / Members that acknowledged this stage or later
    async fn group_acks(&self, message_id: &str, status: DeliveryStatus) -> StoreResult<HashSet<String>>;

    async fn dm_message(&self, message_id: &str) -> StoreResult<DmMessageMeta>;

    async fn group_message(&self, message_id: &str) -> StoreResult<GroupMessageMeta>;

    async fn dm_status(&self, message_id: &str) -> StoreResult<DeliveryStatus>;

    async fn group_status(&self, message_id: &str) -> StoreResult<DeliveryStatus>;
}
