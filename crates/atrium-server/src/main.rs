use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use atrium_api::auth::{AppState, AppStateInner, seed_admin};
use atrium_gateway::connection::{self, ConnectionContext};
use atrium_gateway::dispatcher::Dispatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "atrium=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("ATRIUM_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("ATRIUM_DB_PATH").unwrap_or_else(|_| "atrium.db".into());
    let host = std::env::var("ATRIUM_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("ATRIUM_PORT")
        .unwrap_or_else(|_| "5000".into())
        .parse()?;
    let max_message_len: usize = std::env::var("ATRIUM_MAX_MESSAGE_LENGTH")
        .unwrap_or_else(|_| "1000".into())
        .parse()?;

    // Init database
    let db = Arc::new(atrium_db::Database::open(&PathBuf::from(&db_path))?);

    // First-boot admin account, when configured
    if let (Ok(email), Ok(password)) = (
        std::env::var("ATRIUM_ADMIN_EMAIL"),
        std::env::var("ATRIUM_ADMIN_PASSWORD"),
    ) {
        let username = std::env::var("ATRIUM_ADMIN_USERNAME").unwrap_or_else(|_| "admin".into());
        seed_admin(&db, &username, &email, &password)?;
    }

    // Shared state
    let dispatcher = Dispatcher::new();
    let state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        dispatcher: dispatcher.clone(),
        jwt_secret: jwt_secret.clone(),
        max_message_len,
    });

    let ctx = ConnectionContext {
        dispatcher,
        db,
        jwt_secret,
        max_content_len: max_message_len,
    };

    let ws_route = Router::new().route("/gateway", get(ws_upgrade)).with_state(ctx);

    let app = atrium_api::router(state)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Atrium server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(
    State(ctx): State<ConnectionContext>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, ctx))
}
