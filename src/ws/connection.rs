use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use futures_util::stream::{self, SelectAll, SplitSink};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::protocol::{self, AckKind, ClientFrame};
use super::session::ConnectionSession;
use crate::domain::{AckRequest, Event, RoutingKey};
use crate::server::DeliveryServer;
use crate::service::{Mailbox, MailboxId};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// 连接收件箱条目 / Connection inbox item
enum InboxItem {
    Event(Event),
    /// 邮箱已关闭（被替换、驱逐或主动关闭）/ Mailbox closed (replaced, evicted or closed by us)
    Closed(RoutingKey, MailboxId),
}

type InboxStream = Pin<Box<dyn Stream<Item = InboxItem> + Send>>;

fn inbox_stream(mailbox: Mailbox) -> InboxStream {
    let key = mailbox.key().clone();
    let id = mailbox.id();
    Box::pin(
        mailbox
            .into_stream()
            .map(InboxItem::Event)
            .chain(stream::once(async move { InboxItem::Closed(key, id) })),
    )
}

/// 处理新连接 / Handle new connection
pub async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, server: DeliveryServer) -> Result<()> {
    info!("📨 New connection from: {}", peer_addr);

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let connection_id = Uuid::new_v4().to_string();
    let mut session = ConnectionSession::new(connection_id.clone(), server.topics.clone());
    let mut inbox: SelectAll<InboxStream> = SelectAll::new();

    send_event(&mut ws_sender, &protocol::connected(&connection_id)).await?;

    let hello_deadline = tokio::time::sleep(Duration::from_millis(server.config.server.hello_timeout_ms));
    tokio::pin!(hello_deadline);

    loop {
        tokio::select! {
            _ = &mut hello_deadline, if session.user_id().is_none() => {
                warn!("disconnecting unidentified client connection_id={}", connection_id);
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
            Some(item) = inbox.next(), if !inbox.is_empty() => {
                let outbound = match item {
                    InboxItem::Event(event) => event,
                    InboxItem::Closed(key, id) => {
                        if !session.forget(&key, id) {
                            continue;
                        }
                        debug!("mailbox {} for {} taken away from {}", id, key, connection_id);
                        protocol::mailbox_closed(&key.to_string())
                    }
                };
                if let Err(e) = send_event(&mut ws_sender, &outbound).await {
                    error!("Failed to send message to {}: {}", connection_id, e);
                    break;
                }
            }
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let replies = handle_frame(&server, &mut session, &mut inbox, &text).await;
                        let mut failed = false;
                        for reply in replies {
                            if let Err(e) = send_event(&mut ws_sender, &reply).await {
                                error!("Failed to send reply to {}: {}", connection_id, e);
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws_sender.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", connection_id, e);
                        break;
                    }
                }
            }
        }
    }

    session.close();
    info!("👋 Client {} disconnected", connection_id);
    Ok(())
}

async fn send_event(sink: &mut WsSink, event: &Event) -> Result<()> {
    sink.send(Message::Text(event.to_json()?)).await?;
    Ok(())
}

async fn open(session: &mut ConnectionSession, inbox: &mut SelectAll<InboxStream>, key: RoutingKey) -> Vec<Event> {
    match session.open(key.clone()).await {
        Ok(mailbox) => {
            let pending = mailbox.backlog_len();
            inbox.push(inbox_stream(mailbox));
            vec![protocol::subscribed(&key.to_string(), pending)]
        }
        Err(e) => vec![protocol::delivery_error(&e)],
    }
}

/// 处理客户端帧，返回需要回复的事件 / Handle one client frame, returning replies
async fn handle_frame(
    server: &DeliveryServer,
    session: &mut ConnectionSession,
    inbox: &mut SelectAll<InboxStream>,
    text: &str,
) -> Vec<Event> {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => return vec![protocol::error("invalid_frame", e.to_string())],
    };
    let user = session.user_id().map(str::to_string);

    match (frame, user) {
        (ClientFrame::Ping, _) => vec![protocol::pong()],
        (ClientFrame::Hello { user_id }, None) => {
            info!("🙋 connection {} identified as {}", session.connection_id(), user_id);
            session.set_user(user_id.clone());
            open(session, inbox, RoutingKey::presence(user_id)).await
        }
        (ClientFrame::Hello { .. }, Some(_)) => vec![protocol::error("already_identified", "hello already received")],
        (_, None) => vec![protocol::error("hello_required", "send hello first")],
        (ClientFrame::OpenDm { chat_id }, Some(user)) => open(session, inbox, RoutingKey::dm(user, chat_id)).await,
        (ClientFrame::OpenGroup { chat_id }, Some(user)) => open(session, inbox, RoutingKey::group(user, chat_id)).await,
        (ClientFrame::CloseDm { chat_id }, Some(user)) => {
            session.close_key(&RoutingKey::dm(user, chat_id));
            Vec::new()
        }
        (ClientFrame::CloseGroup { chat_id }, Some(user)) => {
            session.close_key(&RoutingKey::group(user, chat_id));
            Vec::new()
        }
        (ClientFrame::Ack { kind, message_id, status }, Some(user)) => {
            let req = AckRequest::new(message_id.clone(), status, user);
            let result = match kind {
                AckKind::Dm => server.aggregator.ack_dm(&req).await,
                AckKind::Group => server.aggregator.ack_group(&req).await,
            };
            match result {
                Ok(outcome) => vec![protocol::ack_result(&message_id, &outcome)],
                Err(e) => {
                    warn!("⚠️  回执失败 / Ack {} from {} failed: {}", message_id, req.actor_user_id, e);
                    vec![protocol::delivery_error(&e)]
                }
            }
        }
    }
}
