//! OAuth2 endpoints: authorize, token, revoke and the public key set.

use axum::{
    extract::{Extension, Form, Query},
    http::{
        header::{AUTHORIZATION, CACHE_CONTROL, PRAGMA},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Json, Redirect, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use url::Url;
use utoipa::IntoParams;

use super::current_principal;
use crate::api::error::ApiError;
use crate::app::Services;
use crate::oauth::{
    parse_basic, resolve_credentials, AuthorizeError, AuthorizeOutcome, AuthorizeRequest,
    ClientCredentials, CodeExchange, OAuthError, OAuthErrorBody, OAuthErrorCode, RevokeRequest,
    TokenRequest, TokenResponse,
};
use crate::token::Jwks;

fn authorize_error(err: AuthorizeError) -> Response {
    match err.redirect_url() {
        Some(location) => Redirect::to(&location).into_response(),
        None => ApiError::OAuth(err.error().clone()).into_response(),
    }
}

fn login_redirect(services: &Services, continuation: &str) -> Result<Response, ApiError> {
    let base = format!("{}/login", services.config.auth.frontend_base_url());
    let mut url =
        Url::parse(&base).map_err(|err| ApiError::unexpected("login_redirect", &err))?;
    url.query_pairs_mut()
        .append_pair("continuation", continuation);
    Ok(Redirect::to(url.as_str()).into_response())
}

fn basic_credentials(headers: &HeaderMap) -> Option<ClientCredentials> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_basic)
}

/// Token responses must not be cached (RFC 6749 section 5.1).
fn no_store(body: impl IntoResponse) -> Response {
    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

#[utoipa::path(
    get,
    path = "/oauth/authorize",
    params(AuthorizeRequest),
    responses(
        (status = 303, description = "Redirect to the client with a code or error, or to the login page"),
        (status = 400, description = "Unknown client or redirect_uri", body = OAuthErrorBody)
    ),
    tag = "oauth"
)]
pub async fn authorize(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Query(request): Query<AuthorizeRequest>,
) -> Response {
    let principal = match current_principal(&services, &headers).await {
        Ok(principal) => principal,
        Err(err) => return err.into_response(),
    };
    match services.oauth.authorize(&request, principal.as_ref()).await {
        Ok(AuthorizeOutcome::Redirect(location)) => Redirect::to(&location).into_response(),
        Ok(AuthorizeOutcome::LoginRequired { continuation }) => {
            login_redirect(&services, &continuation).unwrap_or_else(IntoResponse::into_response)
        }
        Err(err) => authorize_error(err),
    }
}

#[derive(Deserialize, IntoParams, Debug)]
#[into_params(parameter_in = Query)]
pub struct ContinueParams {
    pub continuation: String,
}

/// Resume a parked authorization request after sign-in.
#[utoipa::path(
    get,
    path = "/oauth/authorize/continue",
    params(ContinueParams),
    responses(
        (status = 303, description = "Redirect to the client with a code"),
        (status = 400, description = "Unknown or expired continuation", body = OAuthErrorBody),
        (status = 401, description = "Not signed in")
    ),
    tag = "oauth"
)]
pub async fn authorize_continue(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Query(params): Query<ContinueParams>,
) -> Response {
    let principal = match current_principal(&services, &headers).await {
        Ok(Some(principal)) => principal,
        Ok(None) => return ApiError::Unauthorized.into_response(),
        Err(err) => return err.into_response(),
    };
    match services.oauth.resume(&params.continuation, &principal) {
        Ok(location) => Redirect::to(&location).into_response(),
        Err(err) => authorize_error(err),
    }
}

#[utoipa::path(
    post,
    path = "/oauth/token",
    request_body(content = TokenRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 400, description = "Invalid grant or request", body = OAuthErrorBody),
        (status = 401, description = "Client authentication failed", body = OAuthErrorBody)
    ),
    tag = "oauth"
)]
pub async fn token(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Form(request): Form<TokenRequest>,
) -> Response {
    no_store(match token_grant(&services, &headers, request).await {
        Ok(tokens) => Json(tokens).into_response(),
        Err(err) => ApiError::OAuth(err).into_response(),
    })
}

async fn token_grant(
    services: &Services,
    headers: &HeaderMap,
    request: TokenRequest,
) -> Result<TokenResponse, OAuthError> {
    let credentials = resolve_credentials(
        basic_credentials(headers),
        request.client_id.as_deref(),
        request.client_secret.as_deref(),
    )?;

    match request.grant_type.as_deref() {
        Some("authorization_code") => {
            let code = request
                .code
                .filter(|code| !code.is_empty())
                .ok_or_else(|| OAuthError::invalid_request("missing code"))?;
            services
                .oauth
                .exchange(
                    CodeExchange {
                        code,
                        state: request.state,
                        redirect_uri: request.redirect_uri,
                        code_verifier: request.code_verifier,
                        error: request.error,
                    },
                    &credentials,
                )
                .await
        }
        Some("refresh_token") => {
            let refresh_token = request.refresh_token.unwrap_or_default();
            services.oauth.refresh(&refresh_token, &credentials).await
        }
        Some(_) => Err(OAuthError::new(
            OAuthErrorCode::UnsupportedGrantType,
            "grant_type is not supported",
        )),
        None => Err(OAuthError::invalid_request("missing grant_type")),
    }
}

#[utoipa::path(
    post,
    path = "/oauth/revoke",
    request_body(content = RevokeRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Token revoked or unknown"),
        (status = 401, description = "Client authentication failed", body = OAuthErrorBody)
    ),
    tag = "oauth"
)]
pub async fn revoke(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Form(request): Form<RevokeRequest>,
) -> Response {
    let result = async {
        let credentials = resolve_credentials(
            basic_credentials(&headers),
            request.client_id.as_deref(),
            request.client_secret.as_deref(),
        )?;
        let token = request
            .token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| OAuthError::invalid_request("missing token"))?;
        services.oauth.revoke(&token, &credentials).await
    }
    .await;

    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => ApiError::OAuth(err).into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/.well-known/jwks.json",
    responses(
        (status = 200, description = "Public signing keys", body = Jwks)
    ),
    tag = "oauth"
)]
pub async fn jwks(services: Extension<Arc<Services>>) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("public, max-age=300"));
    (headers, Json(services.signer.jwks().clone()))
}
