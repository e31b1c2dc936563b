use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use atrium_db::models::{MessageRow, UserRow};
use atrium_types::api::{ConversationDetail, ConversationSummary};
use atrium_types::models::Message;

use crate::auth::AppState;
use crate::error::{ApiError, blocking};

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
    pub unread: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteQuery {
    pub delete_user: Option<String>,
}

/// The admin inbox: one row per visitor who has exchanged messages with the
/// admin, newest conversation first.
pub async fn list_conversations(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let mut conversations = summaries(&state).await?;
    conversations.retain(|c| c.last_message.is_some());
    sort_newest_first(&mut conversations);
    Ok(Json(conversations))
}

/// Same shape as the inbox, filtered by a name/email substring and/or
/// restricted to conversations with unread messages.
pub async fn search_conversations(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let mut conversations = summaries(&state).await?;

    if let Some(q) = query.q.as_deref().filter(|q| !q.is_empty()) {
        let q = q.to_lowercase();
        conversations.retain(|c| {
            c.user.username.to_lowercase().contains(&q) || c.user.email.to_lowercase().contains(&q)
        });
    }

    if query.unread.as_deref() == Some("true") {
        conversations.retain(|c| c.unread_count > 0);
    } else {
        conversations.retain(|c| c.last_message.is_some());
    }

    sort_newest_first(&mut conversations);
    Ok(Json(conversations))
}

/// Fetch one visitor's conversation with the admin. Opening it implicitly
/// marks everything they sent the admin as read, so unread counts drop to
/// zero on the REST and gateway paths alike.
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let uid = user_id.to_string();
    let (user, rows) = blocking(move || {
        let Some(user) = db.get_user_by_id(&uid)? else {
            return Ok(None);
        };
        let Some(admin) = db.admin_user()? else {
            return Ok(None);
        };
        let rows = db.conversation_between(&admin.id, &uid)?;
        let flipped = db.mark_conversation_read(&uid, &admin.id)?;
        if flipped > 0 {
            info!("Marked {} messages from {} as read", flipped, uid);
        }
        Ok(Some((user, rows)))
    })
    .await?
    .ok_or(ApiError::NotFound("User not found"))?;

    let messages: Vec<Message> = rows.into_iter().map(MessageRow::into_message).collect();
    Ok(Json(ConversationDetail {
        user: user.into_user(),
        messages,
    }))
}

/// Administrative bulk delete of a conversation, optionally cascading to
/// the visitor's account.
pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<DeleteQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let delete_user = query.delete_user.as_deref() == Some("true");

    let db = state.db.clone();
    let uid = user_id.to_string();
    let deleted = blocking(move || {
        let Some(admin) = db.admin_user()? else {
            return Ok(None);
        };
        let deleted = db.delete_conversation(&uid, &admin.id)?;
        if delete_user {
            db.delete_user(&uid)?;
        }
        Ok(Some(deleted))
    })
    .await?
    .ok_or(ApiError::NotFound("Admin user not found"))?;

    info!(
        "Deleted conversation with {} ({} messages{})",
        user_id,
        deleted,
        if delete_user { ", user removed" } else { "" }
    );
    Ok(Json(json!({ "message": "Conversation deleted successfully" })))
}

/// Build the per-visitor summary rows shared by the inbox and search.
async fn summaries(state: &AppState) -> Result<Vec<ConversationSummary>, ApiError> {
    let db = state.db.clone();
    let rows: Vec<(UserRow, Option<MessageRow>, u32)> = blocking(move || {
        let Some(admin) = db.admin_user()? else {
            return Ok(None);
        };
        let mut out = Vec::new();
        for user in db.visitor_users()? {
            let last = db.last_message(&user.id, &admin.id)?;
            let unread = db.unread_count(&user.id, &admin.id)?;
            out.push((user, last, unread));
        }
        Ok(Some(out))
    })
    .await?
    .ok_or(ApiError::NotFound("Admin user not found"))?;

    let mut conversations = Vec::with_capacity(rows.len());
    for (user, last, unread) in rows {
        let user = user.into_user();
        let is_online = state.dispatcher.is_online(user.id).await;
        conversations.push(ConversationSummary {
            user,
            last_message: last.map(MessageRow::into_message),
            unread_count: unread,
            is_online,
        });
    }
    Ok(conversations)
}

fn sort_newest_first(conversations: &mut [ConversationSummary]) {
    conversations.sort_by_key(|c| {
        std::cmp::Reverse(c.last_message.as_ref().map(|m| m.created_at).unwrap_or_default())
    });
}
