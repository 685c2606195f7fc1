//! Maps domain errors onto HTTP responses.
//!
//! Internal detail never crosses this boundary: unexpected failures are logged
//! here and answered with a fixed body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use tracing::error;
use utoipa::ToSchema;

use crate::iam::IamError;
use crate::oauth::{FederationError, OAuthError, OAuthErrorCode};
use crate::otp::CodeError;
use crate::session::RefreshError;
use crate::store::StoreError;

#[derive(ToSchema, Serialize, Debug)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug)]
pub enum ApiError {
    /// RFC 6749 shaped error.
    OAuth(OAuthError),
    Unauthorized,
    Forbidden,
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    RateLimited,
    /// An upstream dependency (mail, identity provider) failed.
    BadGateway(&'static str),
    Unexpected,
}

impl ApiError {
    /// Log `err` with the failing operation and return the opaque variant.
    pub fn unexpected(operation: &str, err: &dyn std::fmt::Display) -> Self {
        error!(operation, "{err}");
        Self::Unexpected
    }
}

fn json(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::OAuth(err) => {
                let status = match err.code {
                    OAuthErrorCode::InvalidClient => StatusCode::UNAUTHORIZED,
                    OAuthErrorCode::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
                    OAuthErrorCode::AccessDenied => StatusCode::FORBIDDEN,
                    _ => StatusCode::BAD_REQUEST,
                };
                (status, Json(err.body())).into_response()
            }
            Self::Unauthorized => json(StatusCode::UNAUTHORIZED, "unauthorized"),
            Self::Forbidden => json(StatusCode::FORBIDDEN, "forbidden"),
            Self::NotFound(what) => json(StatusCode::NOT_FOUND, format!("not found: {what}")),
            Self::Conflict(what) => json(StatusCode::CONFLICT, what),
            Self::BadRequest(what) => json(StatusCode::BAD_REQUEST, what),
            Self::RateLimited => json(StatusCode::TOO_MANY_REQUESTS, "rate limited"),
            Self::BadGateway(what) => json(StatusCode::BAD_GATEWAY, what),
            Self::Unexpected => json(StatusCode::INTERNAL_SERVER_ERROR, "unexpected error"),
        }
    }
}

impl From<OAuthError> for ApiError {
    fn from(err: OAuthError) -> Self {
        Self::OAuth(err)
    }
}

impl From<IamError> for ApiError {
    fn from(err: IamError) -> Self {
        match err {
            IamError::Forbidden => Self::Forbidden,
            IamError::NotFound(what) => Self::NotFound(what),
            IamError::Conflict(what) => Self::Conflict(format!("already exists: {what}")),
            IamError::InUse(what) => Self::Conflict(format!("in use: {what}")),
            IamError::Protected(what) => Self::Conflict(format!("protected: {what}")),
            IamError::Invalid(what) => Self::BadRequest(what),
            IamError::Unexpected(err) => Self::unexpected("iam", &format!("{err:#}")),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        IamError::from(err).into()
    }
}

impl From<CodeError> for ApiError {
    fn from(err: CodeError) -> Self {
        match err {
            CodeError::RateLimited => Self::RateLimited,
            CodeError::Delivery(_) => Self::BadGateway("code delivery failed"),
            CodeError::Invalid | CodeError::Expired => {
                Self::BadRequest("invalid or expired code".to_string())
            }
            CodeError::UnknownUser => Self::NotFound("user".to_string()),
            CodeError::Unexpected(err) => Self::unexpected("codes", &format!("{err:#}")),
        }
    }
}

impl From<FederationError> for ApiError {
    fn from(err: FederationError) -> Self {
        match err {
            FederationError::UnknownProvider(name) => Self::NotFound(format!("provider {name}")),
            FederationError::Protocol(err) => Self::OAuth(err),
            FederationError::InvalidGrant => {
                Self::OAuth(OAuthError::invalid_grant("provider rejected the authorization"))
            }
            FederationError::Upstream(detail) => {
                error!("identity provider request failed: {detail}");
                Self::BadGateway("identity provider error")
            }
            FederationError::AccountDisabled => Self::Forbidden,
            FederationError::Unexpected(err) => Self::unexpected("federation", &format!("{err:#}")),
        }
    }
}

impl From<RefreshError> for ApiError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::NoSession | RefreshError::InvalidGrant => Self::Unauthorized,
            RefreshError::NotRefreshable => {
                Self::BadRequest("session has no refresh token".to_string())
            }
            RefreshError::Upstream(detail) => {
                error!("session refresh failed: {detail}");
                Self::BadGateway("identity provider error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses() {
        let cases = [
            (ApiError::from(IamError::Forbidden), StatusCode::FORBIDDEN),
            (ApiError::from(IamError::Protected("root".into())), StatusCode::CONFLICT),
            (ApiError::from(IamError::InUse("role".into())), StatusCode::CONFLICT),
            (ApiError::from(IamError::NotFound("role".into())), StatusCode::NOT_FOUND),
            (ApiError::from(CodeError::RateLimited), StatusCode::TOO_MANY_REQUESTS),
            (
                ApiError::from(CodeError::Delivery(anyhow::anyhow!("smtp"))),
                StatusCode::BAD_GATEWAY,
            ),
            (
                ApiError::from(OAuthError::invalid_grant("used")),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(OAuthError::invalid_client("bad secret")),
                StatusCode::UNAUTHORIZED,
            ),
            (ApiError::from(RefreshError::InvalidGrant), StatusCode::UNAUTHORIZED),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
