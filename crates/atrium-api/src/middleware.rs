use axum::{
    extract::Request,
    http::header,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{DecodingKey, Validation, decode};

use atrium_types::api::Claims;
use atrium_types::models::Role;

use crate::error::ApiError;

/// Extract and validate the bearer JWT from the Authorization header.
pub async fn require_auth(mut req: Request, next: Next) -> Result<Response, ApiError> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized("No token provided"))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(ApiError::Unauthorized("No token provided"))?;

    let secret = jwt_secret();

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::Unauthorized("Invalid token"))?;

    req.extensions_mut().insert(token_data.claims);
    Ok(next.run(req).await)
}

/// Gate for admin-only routes. Runs after require_auth, which put the
/// validated claims into the request extensions.
pub async fn require_admin(req: Request, next: Next) -> Result<Response, ApiError> {
    let claims = req
        .extensions()
        .get::<Claims>()
        .ok_or(ApiError::Unauthorized("No token provided"))?;

    if claims.role != Role::Admin {
        return Err(ApiError::Forbidden("Admin access required"));
    }

    Ok(next.run(req).await)
}

pub(crate) fn jwt_secret() -> String {
    std::env::var("ATRIUM_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into())
}
