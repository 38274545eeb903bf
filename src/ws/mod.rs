//! WebSocket 连接层适配 / WebSocket connection-layer adapter
//!
//! 投递核心不感知传输；这里把每个连接映射为一组作用域订阅。
//! The delivery core is transport-agnostic; this maps each connection onto a set of
//! scoped subscriptions.

pub mod connection;
pub mod protocol;
pub mod server;
pub mod session;

pub use session::ConnectionSession;
