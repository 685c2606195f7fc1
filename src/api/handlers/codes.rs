//! One-time login codes and email verification.

use axum::{
    extract::Extension,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};
use utoipa::ToSchema;

use super::{session::SessionResponse, session_cookie};
use crate::api::error::ApiError;
use crate::app::Services;
use crate::otp::CodeError;
use crate::store::User;

#[derive(ToSchema, Deserialize, Debug)]
pub struct CodeRequest {
    pub email: String,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct CodeVerifyRequest {
    pub email: String,
    pub code: String,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct VerifyEmailRequest {
    pub token: String,
}

fn missing_payload() -> Response {
    ApiError::BadRequest("missing payload".to_string()).into_response()
}

/// Active user for `email`, or `None` without saying why.
async fn active_user(services: &Services, email: &str) -> Result<Option<User>, ApiError> {
    let email = email.trim();
    if email.is_empty() {
        return Ok(None);
    }
    Ok(services
        .stores
        .iam
        .find_user_by_email(email)
        .await?
        .filter(|user| user.is_active))
}

/// Send a login code. Unknown addresses get the same answer as known ones.
#[utoipa::path(
    post,
    path = "/auth/otp",
    request_body = CodeRequest,
    responses(
        (status = 202, description = "Code sent if the address belongs to an account"),
        (status = 429, description = "Too many codes requested"),
        (status = 502, description = "Code delivery failed")
    ),
    tag = "auth"
)]
pub async fn request_otp(
    services: Extension<Arc<Services>>,
    payload: Option<Json<CodeRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return missing_payload();
    };
    let user = match active_user(&services, &request.email).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            debug!("login code requested for unknown address");
            return StatusCode::ACCEPTED.into_response();
        }
        Err(err) => return err.into_response(),
    };
    match services.otp.issue(&user).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

/// Exchange a login code for a session cookie.
#[utoipa::path(
    post,
    path = "/auth/otp/verify",
    request_body = CodeVerifyRequest,
    responses(
        (status = 200, description = "Signed in", body = SessionResponse),
        (status = 400, description = "Invalid or expired code")
    ),
    tag = "auth"
)]
pub async fn verify_otp(
    services: Extension<Arc<Services>>,
    payload: Option<Json<CodeVerifyRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return missing_payload();
    };
    let user = match active_user(&services, &request.email).await {
        Ok(Some(user)) => user,
        Ok(None) => return ApiError::from(CodeError::Invalid).into_response(),
        Err(err) => return err.into_response(),
    };
    if let Err(err) = services.otp.verify(&user, &request.code).await {
        return ApiError::from(err).into_response();
    }

    let (token, session) =
        match services
            .sessions
            .create(user.public_id.clone(), user.email.clone(), None, None)
        {
            Ok(created) => created,
            Err(err) => return ApiError::unexpected("create_session", &format!("{err:#}")).into_response(),
        };
    let cookie = match session_cookie(&services.config.auth, &token) {
        Ok(cookie) => cookie,
        Err(err) => return ApiError::unexpected("session_cookie", &err).into_response(),
    };
    info!(user = %user.public_id, "signed in with login code");

    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, cookie);
    (
        headers,
        Json(SessionResponse {
            user_id: session.user_public_id,
            email: session.email,
            provider: None,
            expires_at: session.expires_at.timestamp(),
        }),
    )
        .into_response()
}

#[utoipa::path(
    post,
    path = "/auth/verify-email",
    request_body = VerifyEmailRequest,
    responses(
        (status = 204, description = "Email verified"),
        (status = 400, description = "Invalid or expired token")
    ),
    tag = "auth"
)]
pub async fn verify_email(
    services: Extension<Arc<Services>>,
    payload: Option<Json<VerifyEmailRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return missing_payload();
    };
    match services.email_verification.verify(&request.token).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/auth/verify-email/resend",
    request_body = CodeRequest,
    responses(
        (status = 202, description = "Link sent if the address needs verification"),
        (status = 429, description = "Too many links requested"),
        (status = 502, description = "Delivery failed")
    ),
    tag = "auth"
)]
pub async fn resend_verification(
    services: Extension<Arc<Services>>,
    payload: Option<Json<CodeRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return missing_payload();
    };
    let user = match active_user(&services, &request.email).await {
        Ok(Some(user)) => user,
        Ok(None) => return StatusCode::ACCEPTED.into_response(),
        Err(err) => return err.into_response(),
    };
    match services.email_verification.issue(&user).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}
