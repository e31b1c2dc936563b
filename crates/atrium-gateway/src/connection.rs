use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use atrium_db::Database;
use atrium_db::models::{MessageRow, format_timestamp};
use atrium_types::api::Claims;
use atrium_types::events::{ClientCommand, ServerEvent};
use atrium_types::models::Message as ChatMessage;

use crate::dispatcher::{ConnectionSignal, Dispatcher};

/// Everything a connection handler needs: the shared dispatcher, the
/// conversation store, and the validation config.
#[derive(Clone)]
pub struct ConnectionContext {
    pub dispatcher: Dispatcher,
    pub db: Arc<Database>,
    pub jwt_secret: String,
    pub max_content_len: usize,
}

/// Identity and reply channel of an authenticated connection.
pub(crate) struct Session {
    pub user_id: Uuid,
    pub username: String,
    pub conn_id: Uuid,
    pub tx: mpsc::UnboundedSender<ConnectionSignal>,
}

impl Session {
    fn reply(&self, event: ServerEvent) {
        let _ = self.tx.send(ConnectionSignal::Event(event));
    }
}

/// Handle a single WebSocket connection through its whole lifecycle:
/// Connected-Unauthenticated -> Authenticated -> Closed.
pub async fn handle_connection(socket: WebSocket, ctx: ConnectionContext) {
    let (mut sink, mut stream) = socket.split();

    // Connected-Unauthenticated: only `authenticate` does anything. Typing
    // and read receipts are best-effort and silently dropped; send_message
    // gets an error event but the connection stays open.
    let claims = loop {
        let Some(Ok(msg)) = stream.next().await else {
            return;
        };
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(ClientCommand::Authenticate { token }) => {
                    match validate_token(&ctx.jwt_secret, &token) {
                        Some(claims) => break claims,
                        None => {
                            warn!("WebSocket client failed to authenticate, closing");
                            let _ = send_event(
                                &mut sink,
                                &ServerEvent::Error {
                                    message: "Authentication failed".into(),
                                },
                            )
                            .await;
                            let _ = sink.send(Message::Close(None)).await;
                            return;
                        }
                    }
                }
                Ok(ClientCommand::SendMessage { .. }) => {
                    let _ = send_event(
                        &mut sink,
                        &ServerEvent::Error {
                            message: "Not authenticated".into(),
                        },
                    )
                    .await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        "unauthenticated client sent bad command: {} -- raw: {}",
                        e,
                        &text[..text.len().min(200)]
                    );
                }
            },
            Message::Close(_) => return,
            _ => {}
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut session = Session {
        user_id: claims.sub,
        username: claims.username,
        conn_id: Uuid::new_v4(),
        tx,
    };

    info!("{} ({}) connected to gateway", session.username, session.user_id);

    ctx.dispatcher
        .register(session.user_id, session.conn_id, session.tx.clone())
        .await;

    // Ack to the caller first, then tell everyone else.
    if send_event(&mut sink, &ServerEvent::Authenticated { user_id: session.user_id })
        .await
        .is_err()
    {
        ctx.dispatcher.disconnect(session.user_id, session.conn_id).await;
        return;
    }
    ctx.dispatcher
        .broadcast(ServerEvent::UserOnline { user_id: session.user_id });

    let mut broadcast_rx = ctx.dispatcher.subscribe();

    // Authenticated: one sequential loop per connection. Inbound commands
    // are handled to completion (store write included) before the next one,
    // which is what keeps per-pair delivery in append order.
    loop {
        tokio::select! {
            inbound = stream.next() => {
                let Some(Ok(msg)) = inbound else { break };
                match msg {
                    Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                        Ok(cmd) => {
                            if !handle_command(&ctx, &mut session, cmd).await {
                                let _ = sink.send(Message::Close(None)).await;
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(
                                "{} ({}) bad command: {} -- raw: {}",
                                session.username,
                                session.user_id,
                                e,
                                &text[..text.len().min(200)]
                            );
                        }
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            signal = rx.recv() => {
                match signal {
                    Some(ConnectionSignal::Event(event)) => {
                        if send_event(&mut sink, &event).await.is_err() {
                            break;
                        }
                    }
                    Some(ConnectionSignal::Replaced) | None => {
                        info!(
                            "{} ({}) replaced by a newer connection",
                            session.username, session.user_id
                        );
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            result = broadcast_rx.recv() => {
                match result {
                    Ok(event) => {
                        if send_event(&mut sink, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Broadcast receiver lagged by {} events", n);
                    }
                    Err(_) => break,
                }
            }
        }
    }

    // No-op if a newer connection took over the presence entry.
    ctx.dispatcher.disconnect(session.user_id, session.conn_id).await;
    info!("{} ({}) disconnected from gateway", session.username, session.user_id);
}

/// Apply one client command. Returns false when the connection must close.
pub(crate) async fn handle_command(
    ctx: &ConnectionContext,
    session: &mut Session,
    cmd: ClientCommand,
) -> bool {
    match cmd {
        ClientCommand::Authenticate { token } => match validate_token(&ctx.jwt_secret, &token) {
            Some(claims) => {
                if claims.sub != session.user_id {
                    // Rebinding to a different identity: the old one goes
                    // offline before the new one registers.
                    ctx.dispatcher.disconnect(session.user_id, session.conn_id).await;
                    session.user_id = claims.sub;
                    session.username = claims.username;
                }
                ctx.dispatcher
                    .register(session.user_id, session.conn_id, session.tx.clone())
                    .await;
                session.reply(ServerEvent::Authenticated { user_id: session.user_id });
                ctx.dispatcher
                    .broadcast(ServerEvent::UserOnline { user_id: session.user_id });
                true
            }
            None => {
                session.reply(ServerEvent::Error {
                    message: "Authentication failed".into(),
                });
                false
            }
        },

        ClientCommand::SendMessage { receiver_id, content } => {
            send_message(ctx, session, receiver_id, content).await;
            true
        }

        ClientCommand::TypingStart { receiver_id } => {
            ctx.dispatcher.typing_start(session.user_id, receiver_id).await;
            true
        }

        ClientCommand::TypingStop { receiver_id } => {
            ctx.dispatcher.typing_stop(session.user_id, receiver_id).await;
            true
        }

        ClientCommand::MarkRead { message_id } => {
            mark_read(ctx, session, message_id).await;
            true
        }
    }
}

/// Validate, store, ack, deliver, in that order. The store write is the
/// durability boundary: it completes before either side hears about the
/// message, and an offline receiver simply sees it on their next history
/// fetch.
async fn send_message(
    ctx: &ConnectionContext,
    session: &Session,
    receiver_id: Uuid,
    content: String,
) {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        session.reply(ServerEvent::Error {
            message: "Message content required".into(),
        });
        return;
    }
    if trimmed.chars().count() > ctx.max_content_len {
        session.reply(ServerEvent::Error {
            message: format!(
                "Message too long. Maximum {} characters",
                ctx.max_content_len
            ),
        });
        return;
    }
    if receiver_id == session.user_id {
        session.reply(ServerEvent::Error {
            message: "Cannot send messages to yourself".into(),
        });
        return;
    }

    let db = ctx.db.clone();
    let rid = receiver_id.to_string();
    let receiver = match tokio::task::spawn_blocking(move || db.get_user_by_id(&rid)).await {
        Ok(Ok(receiver)) => receiver,
        Ok(Err(e)) => {
            error!("receiver lookup failed: {}", e);
            session.reply(ServerEvent::Error {
                message: "Failed to send message".into(),
            });
            return;
        }
        Err(e) => {
            error!("spawn_blocking join error: {}", e);
            session.reply(ServerEvent::Error {
                message: "Failed to send message".into(),
            });
            return;
        }
    };
    if receiver.is_none() {
        session.reply(ServerEvent::Error {
            message: "Receiver not found".into(),
        });
        return;
    }

    let message = ChatMessage {
        id: Uuid::new_v4(),
        sender_id: session.user_id,
        receiver_id,
        content: trimmed.to_string(),
        read: false,
        created_at: Utc::now(),
    };

    let row = MessageRow {
        id: message.id.to_string(),
        sender_id: message.sender_id.to_string(),
        receiver_id: message.receiver_id.to_string(),
        content: message.content.clone(),
        read: false,
        created_at: format_timestamp(message.created_at),
    };

    let db = ctx.db.clone();
    let stored = tokio::task::spawn_blocking(move || db.insert_message(&row)).await;
    match stored {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("message append failed: {}", e);
            session.reply(ServerEvent::Error {
                message: "Failed to send message".into(),
            });
            return;
        }
        Err(e) => {
            error!("spawn_blocking join error: {}", e);
            session.reply(ServerEvent::Error {
                message: "Failed to send message".into(),
            });
            return;
        }
    }

    // The delivered message supersedes any pending typing indicator.
    ctx.dispatcher.cancel_typing(session.user_id, receiver_id).await;

    session.reply(ServerEvent::MessageSent(message.clone()));
    ctx.dispatcher
        .send_to_user(receiver_id, ServerEvent::NewMessage(message))
        .await;

    info!("Message sent from {} to {}", session.user_id, receiver_id);
}

/// Read-state may only be advanced by the receiver; anything else (unknown
/// id included) is a silent no-op so ids are never probeable.
async fn mark_read(ctx: &ConnectionContext, session: &Session, message_id: Uuid) {
    let db = ctx.db.clone();
    let mid = message_id.to_string();
    let uid = session.user_id.to_string();
    let updated = match tokio::task::spawn_blocking(move || db.mark_read(&mid, &uid)).await {
        Ok(Ok(updated)) => updated,
        Ok(Err(e)) => {
            error!("mark_read failed: {}", e);
            return;
        }
        Err(e) => {
            error!("spawn_blocking join error: {}", e);
            return;
        }
    };

    if let Some(row) = updated {
        if let Ok(sender_id) = row.sender_id.parse::<Uuid>() {
            ctx.dispatcher
                .send_to_user(sender_id, ServerEvent::MessageRead { message_id })
                .await;
        }
    }
}

fn validate_token(secret: &str, token: &str) -> Option<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()
    .map(|data| data.claims)
}

async fn send_event(
    sink: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).unwrap();
    sink.send(Message::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use atrium_types::models::Role;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    const SECRET: &str = "test-secret";

    fn test_ctx() -> ConnectionContext {
        ConnectionContext {
            dispatcher: Dispatcher::with_typing_expiry(Duration::from_millis(50)),
            db: Arc::new(Database::open_in_memory().unwrap()),
            jwt_secret: SECRET.into(),
            max_content_len: 1000,
        }
    }

    fn add_user(ctx: &ConnectionContext, name: &str, role: Role) -> Uuid {
        let id = Uuid::new_v4();
        ctx.db
            .create_user(
                &id.to_string(),
                name,
                &format!("{name}@example.com"),
                "hash",
                role,
                "2026-01-01T00:00:00Z",
            )
            .unwrap();
        id
    }

    fn token_for(user_id: Uuid, username: &str, role: Role) -> String {
        let claims = Claims {
            sub: user_id,
            username: username.to_string(),
            role,
            exp: 4102444800, // 2100-01-01
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    /// An authenticated session wired into the dispatcher, with its
    /// targeted receiver exposed for assertions.
    async fn open_session(
        ctx: &ConnectionContext,
        user_id: Uuid,
        username: &str,
    ) -> (Session, UnboundedReceiver<ConnectionSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session {
            user_id,
            username: username.to_string(),
            conn_id: Uuid::new_v4(),
            tx,
        };
        ctx.dispatcher
            .register(session.user_id, session.conn_id, session.tx.clone())
            .await;
        (session, rx)
    }

    async fn next_event(rx: &mut UnboundedReceiver<ConnectionSignal>) -> ServerEvent {
        match timeout(Duration::from_millis(200), rx.recv()).await {
            Ok(Some(ConnectionSignal::Event(event))) => event,
            other => panic!("expected an event, got {other:?}"),
        }
    }

    async fn assert_no_event(rx: &mut UnboundedReceiver<ConnectionSignal>) {
        if let Ok(Some(signal)) = timeout(Duration::from_millis(100), rx.recv()).await {
            panic!("expected silence, got {signal:?}");
        }
    }

    #[tokio::test]
    async fn authenticate_binds_identity_and_acks() {
        let ctx = test_ctx();
        let alice = add_user(&ctx, "alice", Role::User);
        let (mut session, mut rx) = open_session(&ctx, alice, "alice").await;

        let keep_open = handle_command(
            &ctx,
            &mut session,
            ClientCommand::Authenticate {
                token: token_for(alice, "alice", Role::User),
            },
        )
        .await;

        assert!(keep_open);
        match next_event(&mut rx).await {
            ServerEvent::Authenticated { user_id } => assert_eq!(user_id, alice),
            other => panic!("expected Authenticated, got {other:?}"),
        }
        assert!(ctx.dispatcher.is_online(alice).await);
    }

    #[tokio::test]
    async fn authenticate_failure_closes_the_connection() {
        let ctx = test_ctx();
        let alice = add_user(&ctx, "alice", Role::User);
        let (mut session, mut rx) = open_session(&ctx, alice, "alice").await;

        let keep_open = handle_command(
            &ctx,
            &mut session,
            ClientCommand::Authenticate {
                token: "not-a-jwt".into(),
            },
        )
        .await;

        assert!(!keep_open);
        match next_event(&mut rx).await {
            ServerEvent::Error { message } => assert_eq!(message, "Authentication failed"),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_message_acks_sender_and_pushes_to_online_receiver() {
        let ctx = test_ctx();
        let alice = add_user(&ctx, "alice", Role::User);
        let admin = add_user(&ctx, "admin", Role::Admin);
        let (mut alice_session, mut alice_rx) = open_session(&ctx, alice, "alice").await;
        let (_admin_session, mut admin_rx) = open_session(&ctx, admin, "admin").await;

        handle_command(
            &ctx,
            &mut alice_session,
            ClientCommand::SendMessage {
                receiver_id: admin,
                content: "  hello  ".into(),
            },
        )
        .await;

        let sent = match next_event(&mut alice_rx).await {
            ServerEvent::MessageSent(m) => m,
            other => panic!("expected MessageSent, got {other:?}"),
        };
        assert_eq!(sent.content, "hello");
        assert_eq!(sent.sender_id, alice);
        assert_eq!(sent.receiver_id, admin);
        assert!(!sent.read);

        let pushed = match next_event(&mut admin_rx).await {
            ServerEvent::NewMessage(m) => m,
            other => panic!("expected NewMessage, got {other:?}"),
        };
        assert_eq!(pushed.id, sent.id);

        // the durable write happened before either event
        let stored = ctx.db.get_message(&sent.id.to_string()).unwrap().unwrap();
        assert_eq!(stored.content, "hello");
        assert!(!stored.read);
    }

    #[tokio::test]
    async fn mark_read_notifies_the_original_sender() {
        let ctx = test_ctx();
        let alice = add_user(&ctx, "alice", Role::User);
        let admin = add_user(&ctx, "admin", Role::Admin);
        let (mut alice_session, mut alice_rx) = open_session(&ctx, alice, "alice").await;
        let (mut admin_session, mut admin_rx) = open_session(&ctx, admin, "admin").await;

        handle_command(
            &ctx,
            &mut alice_session,
            ClientCommand::SendMessage {
                receiver_id: admin,
                content: "hello".into(),
            },
        )
        .await;
        let sent = match next_event(&mut alice_rx).await {
            ServerEvent::MessageSent(m) => m,
            other => panic!("expected MessageSent, got {other:?}"),
        };
        let _ = next_event(&mut admin_rx).await; // NewMessage

        handle_command(
            &ctx,
            &mut admin_session,
            ClientCommand::MarkRead { message_id: sent.id },
        )
        .await;

        match next_event(&mut alice_rx).await {
            ServerEvent::MessageRead { message_id } => assert_eq!(message_id, sent.id),
            other => panic!("expected MessageRead, got {other:?}"),
        }
        assert!(ctx.db.get_message(&sent.id.to_string()).unwrap().unwrap().read);
    }

    #[tokio::test]
    async fn mark_read_by_non_receiver_is_silent() {
        let ctx = test_ctx();
        let alice = add_user(&ctx, "alice", Role::User);
        let admin = add_user(&ctx, "admin", Role::Admin);
        let (mut alice_session, mut alice_rx) = open_session(&ctx, alice, "alice").await;

        handle_command(
            &ctx,
            &mut alice_session,
            ClientCommand::SendMessage {
                receiver_id: admin,
                content: "hello".into(),
            },
        )
        .await;
        let sent = match next_event(&mut alice_rx).await {
            ServerEvent::MessageSent(m) => m,
            other => panic!("expected MessageSent, got {other:?}"),
        };

        // the sender cannot advance their own message's read flag
        handle_command(
            &ctx,
            &mut alice_session,
            ClientCommand::MarkRead { message_id: sent.id },
        )
        .await;

        assert_no_event(&mut alice_rx).await;
        assert!(!ctx.db.get_message(&sent.id.to_string()).unwrap().unwrap().read);
    }

    #[tokio::test]
    async fn send_message_rejects_empty_content() {
        let ctx = test_ctx();
        let alice = add_user(&ctx, "alice", Role::User);
        let admin = add_user(&ctx, "admin", Role::Admin);
        let (mut session, mut rx) = open_session(&ctx, alice, "alice").await;

        handle_command(
            &ctx,
            &mut session,
            ClientCommand::SendMessage {
                receiver_id: admin,
                content: "   ".into(),
            },
        )
        .await;

        match next_event(&mut rx).await {
            ServerEvent::Error { message } => assert_eq!(message, "Message content required"),
            other => panic!("expected Error, got {other:?}"),
        }
        assert!(ctx.db.messages_for_user(&alice.to_string()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_message_rejects_oversized_content() {
        let ctx = test_ctx();
        let alice = add_user(&ctx, "alice", Role::User);
        let admin = add_user(&ctx, "admin", Role::Admin);
        let (mut session, mut rx) = open_session(&ctx, alice, "alice").await;

        handle_command(
            &ctx,
            &mut session,
            ClientCommand::SendMessage {
                receiver_id: admin,
                content: "x".repeat(1001),
            },
        )
        .await;

        match next_event(&mut rx).await {
            ServerEvent::Error { message } => {
                assert_eq!(message, "Message too long. Maximum 1000 characters")
            }
            other => panic!("expected Error, got {other:?}"),
        }
        assert!(ctx.db.messages_for_user(&alice.to_string()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_message_rejects_unknown_receiver() {
        let ctx = test_ctx();
        let alice = add_user(&ctx, "alice", Role::User);
        let (mut session, mut rx) = open_session(&ctx, alice, "alice").await;

        handle_command(
            &ctx,
            &mut session,
            ClientCommand::SendMessage {
                receiver_id: Uuid::new_v4(),
                content: "hello".into(),
            },
        )
        .await;

        match next_event(&mut rx).await {
            ServerEvent::Error { message } => assert_eq!(message, "Receiver not found"),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn offline_receiver_gets_no_push_but_the_write_lands() {
        let ctx = test_ctx();
        let alice = add_user(&ctx, "alice", Role::User);
        let admin = add_user(&ctx, "admin", Role::Admin);
        let (mut session, mut rx) = open_session(&ctx, alice, "alice").await;
        // admin never opens a connection

        handle_command(
            &ctx,
            &mut session,
            ClientCommand::SendMessage {
                receiver_id: admin,
                content: "hello".into(),
            },
        )
        .await;

        match next_event(&mut rx).await {
            ServerEvent::MessageSent(m) => {
                let stored = ctx.db.get_message(&m.id.to_string()).unwrap().unwrap();
                assert!(!stored.read);
            }
            other => panic!("expected MessageSent, got {other:?}"),
        }
        assert!(!ctx.dispatcher.is_online(admin).await);
    }

    #[tokio::test]
    async fn send_cancels_the_pending_typing_timer() {
        let ctx = test_ctx();
        let alice = add_user(&ctx, "alice", Role::User);
        let admin = add_user(&ctx, "admin", Role::Admin);
        let (mut alice_session, mut alice_rx) = open_session(&ctx, alice, "alice").await;
        let (_admin_session, mut admin_rx) = open_session(&ctx, admin, "admin").await;

        ctx.dispatcher.typing_start(alice, admin).await;
        handle_command(
            &ctx,
            &mut alice_session,
            ClientCommand::SendMessage {
                receiver_id: admin,
                content: "hello".into(),
            },
        )
        .await;
        let _ = next_event(&mut alice_rx).await; // MessageSent

        // drain the admin's events past the expiry window; the timer must
        // not fire after the send superseded it
        let mut stops = 0;
        while let Ok(Some(signal)) =
            timeout(Duration::from_millis(150), admin_rx.recv()).await
        {
            if let ConnectionSignal::Event(ServerEvent::StopTyping { .. }) = signal {
                stops += 1;
            }
        }
        assert_eq!(stops, 0);
    }
}

