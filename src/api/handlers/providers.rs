//! Sign-in through upstream identity providers.

use axum::{
    extract::{Extension, Path, Query},
    http::{header::SET_COOKIE, HeaderMap},
    response::{IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use utoipa::IntoParams;

use super::session_cookie;
use crate::api::error::ApiError;
use crate::app::Services;

#[derive(Deserialize, IntoParams, Debug, Default)]
#[into_params(parameter_in = Query)]
pub struct LoginParams {
    /// Relative path to land on after sign-in.
    pub return_to: Option<String>,
}

#[derive(Deserialize, IntoParams, Debug, Default)]
#[into_params(parameter_in = Query)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[utoipa::path(
    get,
    path = "/auth/providers/{provider}/login",
    params(
        ("provider" = String, Path, description = "Provider name, e.g. google"),
        LoginParams
    ),
    responses(
        (status = 303, description = "Redirect to the provider"),
        (status = 404, description = "Unknown or disabled provider")
    ),
    tag = "auth"
)]
pub async fn login(
    Path(provider): Path<String>,
    services: Extension<Arc<Services>>,
    Query(params): Query<LoginParams>,
) -> Response {
    match services
        .federation
        .begin(&provider, params.return_to.as_deref())
        .await
    {
        Ok(location) => Redirect::to(&location).into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/auth/providers/{provider}/callback",
    params(
        ("provider" = String, Path, description = "Provider name, e.g. google"),
        CallbackParams
    ),
    responses(
        (status = 303, description = "Signed in; redirect to the return path with a session cookie"),
        (status = 400, description = "Invalid or reused state"),
        (status = 403, description = "Sign-in denied or account disabled"),
        (status = 502, description = "Identity provider error")
    ),
    tag = "auth"
)]
pub async fn callback(
    Path(provider): Path<String>,
    services: Extension<Arc<Services>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let signed_in = match services
        .federation
        .callback(
            &provider,
            params.code.as_deref(),
            params.state.as_deref(),
            params.error.as_deref(),
        )
        .await
    {
        Ok(signed_in) => signed_in,
        Err(err) => return ApiError::from(err).into_response(),
    };

    let cookie = match session_cookie(&services.config.auth, &signed_in.session_token) {
        Ok(cookie) => cookie,
        Err(err) => return ApiError::unexpected("session_cookie", &err).into_response(),
    };
    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, cookie);
    (headers, Redirect::to(&signed_in.return_to)).into_response()
}
