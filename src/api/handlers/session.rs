//! Session endpoints for the cookie issued after sign-in.

use axum::{
    extract::Extension,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;
use utoipa::ToSchema;

use super::{clear_session_cookie, extract_session_token};
use crate::api::error::ApiError;
use crate::app::Services;
use crate::session::RefreshError;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SessionResponse {
    pub user_id: String,
    pub email: String,
    pub provider: Option<String>,
    /// Unix seconds.
    pub expires_at: i64,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RefreshResponse {
    /// Unix seconds of the refreshed upstream access token, when known.
    pub expires_at: Option<i64>,
}

fn cleared(services: &Services) -> HeaderMap {
    let mut headers = HeaderMap::new();
    match clear_session_cookie(&services.config.auth) {
        Ok(cookie) => {
            headers.insert(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to build session cookie: {err}"),
    }
    headers
}

#[utoipa::path(
    get,
    path = "/auth/session",
    responses(
        (status = 200, description = "Session is active", body = SessionResponse),
        (status = 204, description = "No active session")
    ),
    tag = "auth"
)]
pub async fn session(headers: HeaderMap, services: Extension<Arc<Services>>) -> impl IntoResponse {
    // Missing or unknown cookies are "no session", never an error.
    let Some(session) = extract_session_token(&headers).and_then(|token| services.sessions.get(&token))
    else {
        return StatusCode::NO_CONTENT.into_response();
    };
    match services.principal_for(&session.user_public_id).await {
        Ok(Some(_)) => Json(SessionResponse {
            user_id: session.user_public_id,
            email: session.email,
            provider: session.provider,
            expires_at: session.expires_at.timestamp(),
        })
        .into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 204, description = "Session cleared")
    ),
    tag = "auth"
)]
pub async fn logout(headers: HeaderMap, services: Extension<Arc<Services>>) -> impl IntoResponse {
    if let Some(token) = extract_session_token(&headers) {
        services.sessions.delete(&token);
    }
    // The cookie is cleared even if the session was already gone.
    (StatusCode::NO_CONTENT, cleared(&services))
}

/// Refresh the upstream provider tokens held by the session.
#[utoipa::path(
    post,
    path = "/auth/refresh",
    responses(
        (status = 200, description = "Upstream tokens refreshed", body = RefreshResponse),
        (status = 400, description = "Session has no refresh token"),
        (status = 401, description = "No session, or the provider revoked it"),
        (status = 502, description = "Identity provider error")
    ),
    tag = "auth"
)]
pub async fn refresh(headers: HeaderMap, services: Extension<Arc<Services>>) -> impl IntoResponse {
    let Some(token) = extract_session_token(&headers) else {
        return ApiError::Unauthorized.into_response();
    };
    match services.refresher.refresh(&token).await {
        Ok(tokens) => Json(RefreshResponse {
            expires_at: tokens.expires_at.map(|at| at.timestamp()),
        })
        .into_response(),
        Err(RefreshError::InvalidGrant) => {
            (cleared(&services), ApiError::from(RefreshError::InvalidGrant)).into_response()
        }
        Err(err) => ApiError::from(err).into_response(),
    }
}
