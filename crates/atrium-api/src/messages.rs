use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use uuid::Uuid;

use atrium_db::models::{MessageRow, format_timestamp};
use atrium_types::api::{Claims, SendMessageRequest};
use atrium_types::events::ServerEvent;
use atrium_types::models::Message;

use crate::auth::AppState;
use crate::error::{ApiError, blocking};

/// Create a message over REST. The stored record is indistinguishable from
/// one created over the gateway: same id format, same fields, same
/// validation. This path does not push to the receiver; clients that want
/// live delivery use the gateway.
pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = req.content.trim().to_string();
    if content.is_empty() {
        return Err(ApiError::Validation("Message content required".into()));
    }
    if content.chars().count() > state.max_message_len {
        return Err(ApiError::Validation(format!(
            "Message too long. Maximum {} characters",
            state.max_message_len
        )));
    }
    if req.receiver_id == claims.sub {
        return Err(ApiError::Validation(
            "Cannot send messages to yourself".into(),
        ));
    }

    let db = state.db.clone();
    let rid = req.receiver_id.to_string();
    if blocking(move || db.get_user_by_id(&rid)).await?.is_none() {
        return Err(ApiError::NotFound("Receiver not found"));
    }

    let message = Message {
        id: Uuid::new_v4(),
        sender_id: claims.sub,
        receiver_id: req.receiver_id,
        content,
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

    let db = state.db.clone();
    blocking(move || db.insert_message(&row)).await?;

    Ok((StatusCode::CREATED, Json(message)))
}

/// Every message the caller sent or received, oldest first.
pub async fn get_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let uid = claims.sub.to_string();
    let rows = blocking(move || db.messages_for_user(&uid)).await?;

    let messages: Vec<Message> = rows.into_iter().map(|r| r.into_message()).collect();
    Ok(Json(messages))
}

/// The conversation between the caller and one other user, in the same
/// order the gateway delivers it live.
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let a = claims.sub.to_string();
    let b = user_id.to_string();
    let rows = blocking(move || db.conversation_between(&a, &b)).await?;

    let messages: Vec<Message> = rows.into_iter().map(|r| r.into_message()).collect();
    Ok(Json(messages))
}

/// Receiver-only read receipt. Unlike the gateway path this one is loud:
/// unknown ids are 404 and non-receivers get 403, because the REST caller
/// already proved they hold a valid token.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let mid = message_id.to_string();
    let row = blocking(move || db.get_message(&mid))
        .await?
        .ok_or(ApiError::NotFound("Message not found"))?;

    if row.receiver_id != claims.sub.to_string() {
        return Err(ApiError::Forbidden("Not authorized"));
    }

    let db = state.db.clone();
    let mid = message_id.to_string();
    let uid = claims.sub.to_string();
    let updated = blocking(move || db.mark_read(&mid, &uid))
        .await?
        .ok_or(ApiError::NotFound("Message not found"))?;

    // Keep the live path in sync: the original sender sees the receipt
    // exactly as if mark_read had arrived over the gateway.
    if let Ok(sender_id) = updated.sender_id.parse::<Uuid>() {
        state
            .dispatcher
            .send_to_user(sender_id, ServerEvent::MessageRead { message_id })
            .await;
    }

    Ok(Json(updated.into_message()))
}
