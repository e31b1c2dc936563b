use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::Utc;
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::info;
use uuid::Uuid;

use atrium_db::Database;
use atrium_db::models::format_timestamp;
use atrium_gateway::dispatcher::Dispatcher;
use atrium_types::api::{AuthResponse, Claims, LoginRequest, RegisterRequest};
use atrium_types::models::{Role, User};

use crate::error::{ApiError, blocking};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub jwt_secret: String,
    pub max_message_len: usize,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.username.len() < 3 || req.username.len() > 32 {
        return Err(ApiError::Validation(
            "Username must be 3-32 characters".into(),
        ));
    }
    if !req.email.contains('@') {
        return Err(ApiError::Validation("Valid email required".into()));
    }
    if req.password.len() < 8 {
        return Err(ApiError::Validation(
            "Password must be at least 8 characters".into(),
        ));
    }

    let db = state.db.clone();
    let email = req.email.clone();
    if blocking(move || db.get_user_by_email(&email)).await?.is_some() {
        return Err(ApiError::Conflict("Email already registered"));
    }

    let db = state.db.clone();
    let username = req.username.clone();
    if blocking(move || db.get_user_by_username(&username))
        .await?
        .is_some()
    {
        return Err(ApiError::Conflict("Username already taken"));
    }

    // Argon2id with a fresh salt
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("password hash failed: {e}")))?
        .to_string();

    let user = User {
        id: Uuid::new_v4(),
        username: req.username,
        email: req.email,
        role: Role::User,
        created_at: Utc::now(),
        last_login: None,
    };

    let db = state.db.clone();
    let row = user.clone();
    blocking(move || {
        db.create_user(
            &row.id.to_string(),
            &row.username,
            &row.email,
            &password_hash,
            row.role,
            &format_timestamp(row.created_at),
        )
    })
    .await?;

    info!("Registered user {} ({})", user.username, user.id);

    let token = create_token(&state.jwt_secret, &user)?;
    Ok((StatusCode::CREATED, Json(AuthResponse { token, user })))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let email = req.email.clone();
    let row = blocking(move || db.get_user_by_email(&email))
        .await?
        .ok_or(ApiError::Unauthorized("Invalid credentials"))?;

    let parsed_hash = PasswordHash::new(&row.password)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("corrupt password hash: {e}")))?;

    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| ApiError::Unauthorized("Invalid credentials"))?;

    let now = Utc::now();
    let db = state.db.clone();
    let id = row.id.clone();
    blocking(move || db.touch_last_login(&id, &format_timestamp(now))).await?;

    let mut user = row.into_user();
    user.last_login = Some(now);

    let token = create_token(&state.jwt_secret, &user)?;
    Ok(Json(AuthResponse { token, user }))
}

pub fn create_token(secret: &str, user: &User) -> Result<String, ApiError> {
    let claims = Claims {
        sub: user.id,
        username: user.username.clone(),
        role: user.role,
        exp: (Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ApiError::Internal(anyhow::anyhow!("token encode failed: {e}")))
}

/// Create the admin account on first boot. No-op when an admin already
/// exists, which keeps the exactly-one-admin invariant intact.
pub fn seed_admin(db: &Database, username: &str, email: &str, password: &str) -> anyhow::Result<()> {
    if db.admin_user()?.is_some() {
        return Ok(());
    }

    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hash failed: {e}"))?
        .to_string();

    db.create_user(
        &Uuid::new_v4().to_string(),
        username,
        email,
        &hash,
        Role::Admin,
        &format_timestamp(Utc::now()),
    )?;

    info!("Seeded admin account {}", email);
    Ok(())
}
