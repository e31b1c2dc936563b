use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Message;

/// Commands sent FROM client TO server over the WebSocket gateway.
///
/// Wire shape: `{"type": "send_message", "data": {"receiverId": ..., "content": ...}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    /// Bind the connection to an identity. The only command accepted
    /// before the connection is authenticated.
    Authenticate { token: String },

    /// Create a message and deliver it live if the receiver is online.
    SendMessage { receiver_id: Uuid, content: String },

    /// Typing indicator control. Best-effort: silently ignored when
    /// unauthenticated.
    TypingStart { receiver_id: Uuid },
    TypingStop { receiver_id: Uuid },

    /// Advance the read flag of a message addressed to the caller.
    MarkRead { message_id: Uuid },
}

/// Events pushed FROM server TO clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Ack of successful connection authentication.
    Authenticated { user_id: Uuid },

    /// Auth or validation failure.
    Error { message: String },

    /// Ack to the sender carrying the stored message.
    MessageSent(Message),

    /// Push to the receiver, only when they hold a live connection.
    NewMessage(Message),

    Typing { user_id: Uuid },
    StopTyping { user_id: Uuid },

    /// The receiver marked this message read; pushed to the original sender.
    MessageRead { message_id: Uuid },

    /// Presence change, broadcast to every connection.
    UserOnline { user_id: Uuid },
    UserOffline { user_id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_names_are_snake_case() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"type":"send_message","data":{"receiverId":"00000000-0000-0000-0000-000000000001","content":"hello"}}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::SendMessage { content, .. } => assert_eq!(content, "hello"),
            other => panic!("parsed wrong variant: {other:?}"),
        }
    }

    #[test]
    fn presence_event_payload_is_camel_case() {
        let event = ServerEvent::UserOnline { user_id: Uuid::nil() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "user_online");
        assert!(json["data"].get("userId").is_some());
    }
}
