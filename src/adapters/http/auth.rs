use axum::http::{HeaderMap, header::AUTHORIZATION};
use axum_extra::extract::CookieJar;
use secrecy::ExposeSecret;

use crate::{
    adapters::http::app_state::AppState,
    app_error::{AppError, AppResult},
    infra::webhook_verifier::constant_time_eq,
    jwt,
};

pub const ACCESS_TOKEN_COOKIE: &str = "access_token";

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// User id from a verified access token. The `Authorization` header wins
/// over the cookie.
pub fn current_user_id(headers: &HeaderMap, jar: &CookieJar, app_state: &AppState) -> AppResult<String> {
    let token = match bearer_token(headers) {
        Some(token) => token.to_string(),
        None => jar
            .get(ACCESS_TOKEN_COOKIE)
            .map(|c| c.value().to_string())
            .ok_or(AppError::InvalidCredentials)?,
    };
    let claims = jwt::verify(&token, &app_state.config.jwt_secret)?;
    if claims.sub.trim().is_empty() {
        return Err(AppError::InvalidCredentials);
    }
    Ok(claims.sub)
}

/// Service-to-service routes take the shared internal token as a bearer.
pub fn require_internal_token(headers: &HeaderMap, app_state: &AppState) -> AppResult<()> {
    let expected = app_state.config.internal_api_token.expose_secret();
    match bearer_token(headers) {
        Some(token) if !expected.is_empty() && constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => Err(AppError::InvalidCredentials),
    }
}
