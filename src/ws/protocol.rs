use serde::Deserialize;
use serde_json::json;

use crate::domain::{AckOutcome, DeliveryStatus, Event};
use crate::error::{describe_error, DeliveryError};

/// 回执类型 / Acknowledgement kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckKind {
    Dm,
    Group,
}

/// 客户端帧 / Client frame
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Hello { user_id: String },
    OpenDm { chat_id: String },
    OpenGroup { chat_id: String },
    CloseDm { chat_id: String },
    CloseGroup { chat_id: String },
    Ack { kind: AckKind, message_id: String, status: DeliveryStatus },
    Ping,
}

pub fn connected(connection_id: &str) -> Event {
    Event::new("connected", json!({ "connectionId": connection_id }))
}

pub fn subscribed(key: &str, backlog: usize) -> Event {
    Event::new("subscribed", json!({ "key": key, "pending": backlog }))
}

pub fn mailbox_closed(key: &str) -> Event {
    Event::new("mailbox_closed", json!({ "key": key }))
}

pub fn pong() -> Event {
    Event::new("pong", json!({ "timestamp": chrono::Utc::now().timestamp_millis() }))
}

pub fn ack_result(message_id: &str, outcome: &AckOutcome) -> Event {
    Event::new(
        "ack_result",
        json!({
            "messageId": message_id,
            "status": outcome.status,
            "changed": outcome.changed,
        }),
    )
}

pub fn error(code: &str, message: impl Into<String>) -> Event {
    Event::new("error", json!({ "code": code, "message": message.into(), "retryable": false }))
}

pub fn delivery_error(e: &DeliveryError) -> Event {
    Event::new(
        "error",
        json!({
            "code": e.error_code(),
            "message": describe_error(e),
            "retryable": e.is_retryable(),
        }),
    )
}
