//! Shared harness: in-memory services behind the real router.

#![allow(dead_code, clippy::unwrap_used)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{
        header::{CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE},
        Request, Response, StatusCode,
    },
    Router,
};
use secrecy::SecretString;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

use gatehouse::app::{AppConfig, Components, Services, Stores};
use gatehouse::crypto::FieldCipher;
use gatehouse::oauth::{FederationError, ProviderClient, ProviderProfile};
use gatehouse::otp::{CodeMessage, Notifier};
use gatehouse::session::UpstreamTokens;
use gatehouse::store::{NewOAuthClient, NewUser, OAuthProvider, User};
use gatehouse::token::TokenSigner;

pub const ISSUER: &str = "https://id.example.com";
pub const KID: &str = "test-key";
pub const CLIENT_ID: &str = "web";
pub const REDIRECT_URI: &str = "https://app.example.com/callback";
pub const PRIVATE_KEY_PEM: &str = include_str!("../fixtures/jwt_private_key.pem");

/// Notifier that keeps every message for inspection.
#[derive(Default)]
pub struct Outbox {
    sent: Mutex<Vec<CodeMessage>>,
}

impl Outbox {
    pub fn last_payload(&self) -> Option<Value> {
        let sent = self.sent.lock().unwrap();
        sent.last()
            .and_then(|message| serde_json::from_str(&message.payload_json).ok())
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for Outbox {
    async fn send(&self, message: &CodeMessage) -> Result<()> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Provider that never leaves the process.
pub struct FakeProvider;

#[async_trait]
impl ProviderClient for FakeProvider {
    async fn exchange_code(
        &self,
        _provider: &OAuthProvider,
        _client_secret: &SecretString,
        code: &str,
        _code_verifier: &str,
    ) -> Result<UpstreamTokens, FederationError> {
        if code == "bad" {
            return Err(FederationError::InvalidGrant);
        }
        Ok(UpstreamTokens {
            access_token: format!("upstream-{code}"),
            refresh_token: Some("upstream-refresh".to_string()),
            expires_at: None,
        })
    }

    async fn refresh(
        &self,
        _provider: &OAuthProvider,
        _client_secret: &SecretString,
        _refresh_token: &str,
    ) -> Result<UpstreamTokens, FederationError> {
        Err(FederationError::InvalidGrant)
    }

    async fn fetch_profile(
        &self,
        _provider: &OAuthProvider,
        _access_token: &str,
    ) -> Result<ProviderProfile, FederationError> {
        Ok(ProviderProfile {
            subject: "upstream-42".to_string(),
            email: "federated@example.com".to_string(),
            email_verified: true,
            given_name: Some("Fed".to_string()),
            family_name: None,
        })
    }
}

pub struct Harness {
    pub services: Arc<Services>,
    pub app: Router,
    pub outbox: Arc<Outbox>,
}

pub fn signer() -> Result<TokenSigner> {
    Ok(TokenSigner::from_pem_or_der(
        PRIVATE_KEY_PEM.as_bytes(),
        KID.to_string(),
        ISSUER.to_string(),
    )?)
}

impl Harness {
    pub async fn new() -> Result<Self> {
        let outbox = Arc::new(Outbox::default());
        let components = Components {
            stores: Stores::memory(),
            signer: Arc::new(signer()?),
            cipher: FieldCipher::new([7u8; 32]),
            notifier: outbox.clone(),
            provider_client: Arc::new(FakeProvider),
            jwks_fetcher: None,
        };
        let services = Arc::new(Services::build(components, AppConfig::default()).await?);
        let app = gatehouse::api::app(services.clone())?;

        services
            .stores
            .clients
            .create_client(NewOAuthClient {
                client_id: CLIENT_ID.to_string(),
                name: "Web".to_string(),
                confidential: false,
                client_secret_hash: None,
                redirect_uris: vec![REDIRECT_URI.to_string()],
                scopes: Vec::new(),
                pkce_required: true,
                is_default: true,
            })
            .await?;

        Ok(Self {
            services,
            app,
            outbox,
        })
    }

    pub async fn user(&self, email: &str) -> Result<User> {
        Ok(self
            .services
            .stores
            .iam
            .create_user(NewUser {
                email: email.to_string(),
                email_verified: true,
                ..NewUser::default()
            })
            .await?)
    }

    /// A user holding the built-in `superadmin` role.
    pub async fn superadmin(&self, email: &str) -> Result<User> {
        let user = self.user(email).await?;
        let role = self
            .services
            .stores
            .iam
            .find_role_by_name("superadmin")
            .await?
            .context("superadmin role is seeded")?;
        self.services
            .stores
            .iam
            .assign_user_roles(&user.public_id, &[role.public_id])
            .await?;
        Ok(user)
    }

    /// Open a session for `user` and return its cookie header value.
    pub fn session_cookie(&self, user: &User) -> Result<String> {
        let (token, _) =
            self.services
                .sessions
                .create(user.public_id.clone(), user.email.clone(), None, None)?;
        Ok(format!("gatehouse_session={token}"))
    }

    pub async fn send(&self, request: Request<Body>) -> Result<Response<Body>> {
        Ok(self.app.clone().oneshot(request).await?)
    }

    pub async fn get(&self, uri: &str, cookie: Option<&str>) -> Result<Response<Body>> {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(COOKIE, cookie);
        }
        self.send(builder.body(Body::empty())?).await
    }

    pub async fn json(
        &self,
        method: &str,
        uri: &str,
        cookie: Option<&str>,
        body: &Value,
    ) -> Result<Response<Body>> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json");
        if let Some(cookie) = cookie {
            builder = builder.header(COOKIE, cookie);
        }
        self.send(builder.body(Body::from(body.to_string()))?).await
    }

    pub async fn form(&self, uri: &str, pairs: &[(&str, &str)]) -> Result<Response<Body>> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))?;
        self.send(request).await
    }
}

pub async fn body_json(response: Response<Body>) -> Result<Value> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn location(response: &Response<Body>) -> Option<url::Url> {
    response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| url::Url::parse(value).ok())
}

pub fn query_param(url: &url::Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// `name=value` of the first `Set-Cookie` header.
pub fn set_cookie(response: &Response<Body>) -> Option<String> {
    response
        .headers()
        .get(SET_COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(str::to_string)
}

pub fn is_redirect(status: StatusCode) -> bool {
    status == StatusCode::SEE_OTHER
}
