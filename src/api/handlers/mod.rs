//! Route handlers and the session/bearer helpers they share.

pub mod admin;
pub mod codes;
pub mod health;
pub mod oauth;
pub mod providers;
pub mod session;

use axum::http::{
    header::{InvalidHeaderValue, AUTHORIZATION, COOKIE},
    HeaderMap, HeaderValue,
};
use tracing::debug;

use super::error::ApiError;
use crate::app::Services;
use crate::iam::Principal;
use crate::oauth::AuthConfig;

pub const SESSION_COOKIE_NAME: &str = "gatehouse_session";

/// Build the `HttpOnly` session cookie.
pub(crate) fn session_cookie(config: &AuthConfig, token: &str) -> Result<HeaderValue, InvalidHeaderValue> {
    let ttl_seconds = config.session_ttl_seconds();
    let mut cookie = format!(
        "{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={ttl_seconds}"
    );
    if config.session_cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(crate) fn clear_session_cookie(config: &AuthConfig) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!("{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    if config.session_cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(crate) fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(value) = header.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            let Some((key, val)) = pair.trim().split_once('=') else {
                continue;
            };
            if key.trim() == SESSION_COOKIE_NAME && !val.trim().is_empty() {
                return Some(val.trim().to_string());
            }
        }
    }
    None
}

pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Resolve the caller from the session cookie or a bearer access token.
///
/// Returns `Ok(None)` when neither is present or valid.
pub(crate) async fn current_principal(
    services: &Services,
    headers: &HeaderMap,
) -> Result<Option<Principal>, ApiError> {
    if let Some(token) = extract_session_token(headers) {
        if let Some(session) = services.sessions.get(&token) {
            return Ok(services.principal_for(&session.user_public_id).await?);
        }
    }
    if let Some(token) = extract_bearer_token(headers) {
        match services.verifier.verify(&token).await {
            Ok(claims) => return Ok(services.principal_for(&claims.sub).await?),
            Err(err) => debug!("bearer token rejected: {err}"),
        }
    }
    Ok(None)
}

/// Like [`current_principal`] but fails with 401.
pub(crate) async fn require_principal(
    services: &Services,
    headers: &HeaderMap,
) -> Result<Principal, ApiError> {
    current_principal(services, headers)
        .await?
        .ok_or(ApiError::Unauthorized)
}
