pub mod auth;
pub mod conversations;
pub mod error;
pub mod messages;
pub mod middleware;

use axum::{
    Router,
    middleware as axum_middleware,
    routing::{get, post, put},
};

use crate::auth::AppState;

/// Assemble the REST surface. The server binary mounts the WebSocket
/// gateway route next to this.
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login));

    let authed = Router::new()
        .route("/messages/send", post(messages::send_message))
        .route("/messages", get(messages::get_messages))
        .route("/messages/{id}", get(messages::get_conversation))
        .route("/messages/{id}/read", put(messages::mark_read))
        .layer(axum_middleware::from_fn(middleware::require_auth));

    let admin = Router::new()
        .route("/conversations", get(conversations::list_conversations))
        .route(
            "/conversations/search/query",
            get(conversations::search_conversations),
        )
        .route(
            "/conversations/{user_id}",
            get(conversations::get_conversation).delete(conversations::delete_conversation),
        )
        .layer(axum_middleware::from_fn(middleware::require_admin))
        .layer(axum_middleware::from_fn(middleware::require_auth));

    Router::new()
        .merge(public)
        .merge(authed)
        .merge(admin)
        .with_state(state)
}
