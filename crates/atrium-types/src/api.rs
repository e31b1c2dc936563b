use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, Role, User};

// -- JWT Claims --

/// JWT claims shared by atrium-api (REST middleware) and atrium-gateway
/// (WebSocket authentication). Canonical definition lives here to keep the
/// two auth paths from drifting apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub role: Role,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: User,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SendMessageRequest {
    pub receiver_id: Uuid,
    pub content: String,
}

// -- Conversations (admin) --

/// One row of the admin conversation list: the visitor, the newest message
/// either direction, how many of their messages the admin has not read yet,
/// and whether they hold a live gateway connection right now.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub user: User,
    pub last_message: Option<Message>,
    pub unread_count: u32,
    pub is_online: bool,
}

#[derive(Debug, Serialize)]
pub struct ConversationDetail {
    pub user: User,
    pub messages: Vec<Message>,
}
