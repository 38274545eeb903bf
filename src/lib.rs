//! v-chat-delivery: 实时消息投递与回执聚合
//! v-chat-delivery: real-time message delivery and acknowledgement aggregation
//!
//! - 邮箱注册表 / Mailbox registry: routing key -> live outbound channel
//! - 主题注册表 / Topic registry: per-scope subscribe/send with offline fallback
//! - 投递代理 / Delivery broker: fire-and-forget entry point for producers
//! - 回执聚合 / Ack aggregator: DM status and group convergence

pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod server;
pub mod service;
pub mod storage;
pub mod ws;

pub use domain::{AckOutcome, AckRequest, DeliveryStatus, Event, RoutingKey, Scope};
pub use error::{DeliveryError, Result};
pub use server::DeliveryServer;
pub use service::{AckAggregator, DeliveryBroker, Mailbox, Notifier, PublishHandle, SendOutcome, TopicSet};
pub use storage::{DeliveryStore, MemoryStore, StoreError};
