use thiserror::Error;

use crate::domain::{RoutingKey, Scope};
use crate::storage::StoreError;

pub type Result<T> = std::result::Result<T, DeliveryError>;

/// 投递子系统统一错误 / Unified delivery subsystem error
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("非法路由键: {0}")]
    InvalidRoutingKey(String),

    #[error("非法状态: {0}")]
    InvalidStatus(String),

    #[error("路由键 {key} 不属于作用域 {expected}")]
    ScopeMismatch { key: RoutingKey, expected: Scope },

    #[error("用户 {actor} 不是消息 {message_id} 的接收者")]
    NotRecipient { message_id: String, actor: String },

    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
}

impl DeliveryError {
    /// 调用方是否可以重试 / Whether the caller may retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Store(StoreError::Unavailable(_)))
    }

    /// 错误代码 / Error code for client frames
    pub fn error_code(&self) -> &'static str {
        match self {
            DeliveryError::InvalidRoutingKey(_) => "invalid_routing_key",
            DeliveryError::InvalidStatus(_) => "invalid_status",
            DeliveryError::ScopeMismatch { .. } => "scope_mismatch",
            DeliveryError::NotRecipient { .. } => "not_recipient",
            DeliveryError::Store(StoreError::NotFound(_)) => "not_found",
            DeliveryError::Store(_) => "store_unavailable",
        }
    }
}

/// 获取详细错误描述（中英文）/ Get detailed error description (CN/EN)
pub fn describe_error(e: &DeliveryError) -> String {
    match e {
        DeliveryError::InvalidRoutingKey(k) => format!("非法路由键 / Invalid routing key: {}", k),
        DeliveryError::InvalidStatus(s) => format!("非法状态 / Invalid status: {}", s),
        DeliveryError::ScopeMismatch { key, expected } => {
            format!("作用域不匹配 / Scope mismatch: {} is not {}", key, expected)
        }
        DeliveryError::NotRecipient { message_id, actor } => {
            format!("非接收者回执 / Not a recipient: {} for {}", actor, message_id)
        }
        DeliveryError::Store(err) => format!("存储错误 / Store error: {}", err),
    }
}
