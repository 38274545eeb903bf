//! WebSocket 网关集成测试 / WebSocket gateway integration tests

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use v_chat_delivery::config::AppConfig;
use v_chat_delivery::domain::DmMessageMeta;
use v_chat_delivery::{DeliveryServer, Event, MemoryStore, RoutingKey};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start(config: AppConfig) -> Result<(Arc<MemoryStore>, DeliveryServer, String)> {
    let (store, server) = DeliveryServer::in_memory(config);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}", listener.local_addr()?);
    let accept = server.clone();
    tokio::spawn(async move {
        let _ = accept.serve(listener).await;
    });
    Ok((store, server, url))
}

async fn next_json(client: &mut Client) -> Result<Value> {
    loop {
        let msg = timeout(Duration::from_secs(2), client.next())
            .await?
            .ok_or_else(|| anyhow!("connection closed"))??;
        if let Message::Text(text) = msg {
            return Ok(serde_json::from_str(&text)?);
        }
    }
}

async fn send_json(client: &mut Client, frame: Value) -> Result<()> {
    client.send(Message::Text(frame.to_string())).await?;
    Ok(())
}

async fn connect_as(url: &str, user_id: &str) -> Result<Client> {
    let (mut client, _) = connect_async(url).await?;
    assert_eq!(next_json(&mut client).await?["event"], "connected");
    send_json(&mut client, json!({ "type": "hello", "user_id": user_id })).await?;
    Ok(client)
}

#[cfg(test)]
mod ws_gateway_tests {
    use super::*;

    /// hello 后收到离线事件 / Pending events arrive after hello
    #[tokio::test]
    async fn test_hello_drains_presence_pending() -> Result<()> {
        let (store, server, url) = start(AppConfig::default()).await?;
        let key = RoutingKey::presence("bob");
        server
            .broker
            .dispatch(&key, Event::new("presence_changed", json!({ "userId": "alice" })))
            .await?;
        assert_eq!(store.pending_len(&key), 1);

        let mut bob = connect_as(&url, "bob").await?;
        let subscribed = next_json(&mut bob).await?;
        assert_eq!(subscribed["event"], "subscribed");
        assert_eq!(subscribed["data"]["key"], "user:bob");
        assert_eq!(subscribed["data"]["pending"], 1);

        let pending = next_json(&mut bob).await?;
        assert_eq!(pending["event"], "presence_changed");
        assert_eq!(pending["data"]["userId"], "alice");
        Ok(())
    }

    /// 打开单聊会话并接收实时消息 / Open a DM session and receive live events
    #[tokio::test]
    async fn test_open_dm_receives_live_events() -> Result<()> {
        let (_store, server, url) = start(AppConfig::default()).await?;
        let mut bob = connect_as(&url, "bob").await?;
        assert_eq!(next_json(&mut bob).await?["event"], "subscribed");

        send_json(&mut bob, json!({ "type": "open_dm", "chat_id": "d1" })).await?;
        let subscribed = next_json(&mut bob).await?;
        assert_eq!(subscribed["data"]["key"], "user:bob::dm:d1");

        server
            .broker
            .publish(RoutingKey::dm("bob", "d1"), Event::new("new_dm_message", json!({ "n": 1 })))
            .await;
        let live = next_json(&mut bob).await?;
        assert_eq!(live["event"], "new_dm_message");
        assert_eq!(live["data"]["n"], 1);
        Ok(())
    }

    /// 通过连接回执并通知发送者 / Ack over the socket notifies the sender
    #[tokio::test]
    async fn test_ack_frame_notifies_sender() -> Result<()> {
        let (store, _server, url) = start(AppConfig::default()).await?;
        store.insert_dm_message(DmMessageMeta {
            message_id: "m1".into(),
            dm_chat_id: "d1".into(),
            sender_id: "alice".into(),
            recipient_id: "bob".into(),
        });

        let mut alice = connect_as(&url, "alice").await?;
        assert_eq!(next_json(&mut alice).await?["event"], "subscribed");
        let mut bob = connect_as(&url, "bob").await?;
        assert_eq!(next_json(&mut bob).await?["event"], "subscribed");

        send_json(&mut bob, json!({ "type": "ack", "kind": "dm", "message_id": "m1", "status": "delivered" })).await?;
        let result = next_json(&mut bob).await?;
        assert_eq!(result["event"], "ack_result");
        assert_eq!(result["data"]["changed"], true);

        let notified = next_json(&mut alice).await?;
        assert_eq!(notified["event"], "dm_message_status_changed");
        assert_eq!(notified["data"]["newStatus"], "delivered");

        send_json(&mut alice, json!({ "type": "ack", "kind": "dm", "message_id": "m1", "status": "read" })).await?;
        let rejected = next_json(&mut alice).await?;
        assert_eq!(rejected["event"], "error");
        assert_eq!(rejected["data"]["code"], "not_recipient");
        Ok(())
    }

    /// 未 hello 的请求被拒绝 / Frames before hello are rejected
    #[tokio::test]
    async fn test_frames_before_hello_rejected() -> Result<()> {
        let (_store, _server, url) = start(AppConfig::default()).await?;
        let (mut client, _) = connect_async(url.as_str()).await?;
        assert_eq!(next_json(&mut client).await?["event"], "connected");

        send_json(&mut client, json!({ "type": "open_dm", "chat_id": "d1" })).await?;
        assert_eq!(next_json(&mut client).await?["data"]["code"], "hello_required");

        client.send(Message::Text("not json".to_string())).await?;
        assert_eq!(next_json(&mut client).await?["data"]["code"], "invalid_frame");

        send_json(&mut client, json!({ "type": "ping" })).await?;
        assert_eq!(next_json(&mut client).await?["event"], "pong");
        Ok(())
    }

    /// 未在超时内 hello 的连接被断开 / Clients that never say hello are disconnected
    #[tokio::test]
    async fn test_hello_timeout_disconnects() -> Result<()> {
        let mut config = AppConfig::default();
        config.server.hello_timeout_ms = 50;
        let (_store, _server, url) = start(config).await?;
        let (mut client, _) = connect_async(url.as_str()).await?;
        assert_eq!(next_json(&mut client).await?["event"], "connected");

        let closed = timeout(Duration::from_secs(2), async {
            loop {
                match client.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await?;
        assert!(closed);
        Ok(())
    }

    /// 新连接替换旧连接后旧连接收到 mailbox_closed
    /// A replaced connection is told its mailbox closed
    #[tokio::test]
    async fn test_second_connection_takes_over_presence() -> Result<()> {
        let (_store, server, url) = start(AppConfig::default()).await?;
        let mut first = connect_as(&url, "bob").await?;
        assert_eq!(next_json(&mut first).await?["event"], "subscribed");
        let mut second = connect_as(&url, "bob").await?;
        assert_eq!(next_json(&mut second).await?["event"], "subscribed");

        let closed = next_json(&mut first).await?;
        assert_eq!(closed["event"], "mailbox_closed");
        assert_eq!(closed["data"]["key"], "user:bob");

        drop(first);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.topics.is_online(&RoutingKey::presence("bob")));
        Ok(())
    }
}
