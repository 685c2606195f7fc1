//! Sign-in through an upstream identity provider (Google, GitHub, ...).
//!
//! The browser is sent to the provider with a fresh `state` and PKCE
//! challenge; the callback consumes the matching pending record, exchanges the
//! code, links the upstream subject to a local user and opens a session.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::{header::ACCEPT, Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use url::Url;

use super::pkce::{self, CODE_CHALLENGE_METHOD_S256};
use super::OAuthError;
use crate::crypto::{generate_token, hash_token_hex};
use crate::iam::{valid_email, IamError, ProviderService};
use crate::session::{
    PendingAuthorization, PendingTarget, RefreshError, Session, SessionStore, UpstreamRefresher,
    UpstreamTokens,
};
use crate::store::{ClientStore, IamStore, NewUser, OAuthProvider, StoreError, User, UserIdentity};

const DEFAULT_RETURN_TO: &str = "/";

fn provider_key(state: &str) -> String {
    format!("provider:{}", hash_token_hex(state))
}

#[derive(Debug, Error)]
pub enum FederationError {
    #[error("unknown or disabled provider: {0}")]
    UnknownProvider(String),
    #[error(transparent)]
    Protocol(#[from] OAuthError),
    /// The provider rejected the code or refresh token.
    #[error("upstream rejected the grant")]
    InvalidGrant,
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("account disabled")]
    AccountDisabled,
    #[error("unexpected error")]
    Unexpected(#[source] anyhow::Error),
}

impl From<StoreError> for FederationError {
    fn from(err: StoreError) -> Self {
        Self::Unexpected(anyhow::Error::new(err))
    }
}

impl From<IamError> for FederationError {
    fn from(err: IamError) -> Self {
        Self::Unexpected(anyhow::Error::new(err))
    }
}

/// Identity claims read from the provider's userinfo endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderProfile {
    pub subject: String,
    pub email: String,
    pub email_verified: bool,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
}

/// Talks to an upstream provider's token and userinfo endpoints.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn exchange_code(
        &self,
        provider: &OAuthProvider,
        client_secret: &SecretString,
        code: &str,
        code_verifier: &str,
    ) -> Result<UpstreamTokens, FederationError>;

    async fn refresh(
        &self,
        provider: &OAuthProvider,
        client_secret: &SecretString,
        refresh_token: &str,
    ) -> Result<UpstreamTokens, FederationError>;

    async fn fetch_profile(
        &self,
        provider: &OAuthProvider,
        access_token: &str,
    ) -> Result<ProviderProfile, FederationError>;
}

#[derive(Deserialize)]
struct UpstreamTokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
}

/// [`ProviderClient`] over HTTPS.
pub struct HttpProviderClient {
    client: Client,
}

impl HttpProviderClient {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(timeout)
            .build()
            .context("Failed to build provider HTTP client")?;
        Ok(Self { client })
    }

    async fn token_request(
        &self,
        provider: &OAuthProvider,
        form: &[(&str, &str)],
    ) -> Result<UpstreamTokens, FederationError> {
        let span = info_span!("provider.token", provider = %provider.name);
        let response = self
            .client
            .post(&provider.token_url)
            .header(ACCEPT, "application/json")
            .form(form)
            .send()
            .instrument(span)
            .await
            .map_err(|err| FederationError::Upstream(err.to_string()))?;

        let status = response.status();
        let body: UpstreamTokenResponse = response
            .json()
            .await
            .map_err(|err| FederationError::Upstream(err.to_string()))?;

        if body.error.as_deref() == Some("invalid_grant") {
            return Err(FederationError::InvalidGrant);
        }
        if !status.is_success() || body.error.is_some() {
            return Err(FederationError::Upstream(format!(
                "token endpoint returned {status}"
            )));
        }
        let access_token = body
            .access_token
            .ok_or_else(|| FederationError::Upstream("missing access_token".to_string()))?;
        Ok(UpstreamTokens {
            access_token,
            refresh_token: body.refresh_token,
            expires_at: body
                .expires_in
                .map(|seconds| Utc::now() + ChronoDuration::seconds(seconds)),
        })
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn exchange_code(
        &self,
        provider: &OAuthProvider,
        client_secret: &SecretString,
        code: &str,
        code_verifier: &str,
    ) -> Result<UpstreamTokens, FederationError> {
        self.token_request(
            provider,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", provider.redirect_url.as_str()),
                ("client_id", provider.client_id.as_str()),
                ("client_secret", client_secret.expose_secret()),
                ("code_verifier", code_verifier),
            ],
        )
        .await
    }

    async fn refresh(
        &self,
        provider: &OAuthProvider,
        client_secret: &SecretString,
        refresh_token: &str,
    ) -> Result<UpstreamTokens, FederationError> {
        self.token_request(
            provider,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", provider.client_id.as_str()),
                ("client_secret", client_secret.expose_secret()),
            ],
        )
        .await
    }

    async fn fetch_profile(
        &self,
        provider: &OAuthProvider,
        access_token: &str,
    ) -> Result<ProviderProfile, FederationError> {
        let span = info_span!("provider.userinfo", provider = %provider.name);
        let response = self
            .client
            .get(&provider.userinfo_url)
            .bearer_auth(access_token)
            .header(ACCEPT, "application/json")
            .send()
            .instrument(span)
            .await
            .map_err(|err| FederationError::Upstream(err.to_string()))?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(FederationError::InvalidGrant);
        }
        if !response.status().is_success() {
            return Err(FederationError::Upstream(format!(
                "userinfo returned {}",
                response.status()
            )));
        }
        let claims: serde_json::Value = response
            .json()
            .await
            .map_err(|err| FederationError::Upstream(err.to_string()))?;
        profile_from_claims(&claims)
    }
}

/// Map OIDC userinfo (`sub`) or GitHub-style (`id`) claims to a profile.
fn profile_from_claims(claims: &serde_json::Value) -> Result<ProviderProfile, FederationError> {
    let subject = match (claims.get("sub"), claims.get("id")) {
        (Some(serde_json::Value::String(sub)), _) => sub.clone(),
        (_, Some(serde_json::Value::Number(id))) => id.to_string(),
        (_, Some(serde_json::Value::String(id))) => id.clone(),
        _ => return Err(FederationError::Upstream("profile has no subject".to_string())),
    };
    let email = claims
        .get("email")
        .and_then(serde_json::Value::as_str)
        .filter(|email| valid_email(email))
        .ok_or_else(|| FederationError::Upstream("profile has no usable email".to_string()))?;
    let text = |key: &str| {
        claims
            .get(key)
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
    };
    Ok(ProviderProfile {
        subject,
        email: email.to_string(),
        email_verified: claims
            .get("email_verified")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false),
        given_name: text("given_name"),
        family_name: text("family_name"),
    })
}

/// Keep only same-site relative paths; anything else falls back to `/`.
#[must_use]
pub fn sanitize_return_to(return_to: Option<&str>) -> String {
    match return_to {
        Some(path)
            if path.starts_with('/')
                && !path.starts_with("//")
                && !path.contains('\\')
                && !path.chars().any(char::is_control) =>
        {
            path.to_string()
        }
        _ => DEFAULT_RETURN_TO.to_string(),
    }
}

/// A session opened by a successful provider callback.
#[derive(Clone, Debug)]
pub struct FederatedSession {
    pub session_token: String,
    pub session: Session,
    pub user: User,
    pub return_to: String,
}

pub struct FederatedLogin {
    clients: Arc<dyn ClientStore>,
    iam: Arc<dyn IamStore>,
    sessions: Arc<SessionStore>,
    providers: Arc<ProviderService>,
    upstream: Arc<dyn ProviderClient>,
}

impl FederatedLogin {
    #[must_use]
    pub fn new(
        clients: Arc<dyn ClientStore>,
        iam: Arc<dyn IamStore>,
        sessions: Arc<SessionStore>,
        providers: Arc<ProviderService>,
        upstream: Arc<dyn ProviderClient>,
    ) -> Self {
        Self {
            clients,
            iam,
            sessions,
            providers,
            upstream,
        }
    }

    async fn enabled_provider(&self, name: &str) -> Result<OAuthProvider, FederationError> {
        self.clients
            .find_provider(name)
            .await?
            .filter(|provider| provider.enabled)
            .ok_or_else(|| FederationError::UnknownProvider(name.to_string()))
    }

    /// Start a provider login and return the URL to send the browser to.
    ///
    /// # Errors
    /// `UnknownProvider` when the provider is missing or disabled.
    pub async fn begin(&self, provider: &str, return_to: Option<&str>) -> Result<String, FederationError> {
        let provider = self.enabled_provider(provider).await?;
        let state = generate_token().map_err(FederationError::Unexpected)?;
        let code_verifier = pkce::generate_verifier().map_err(FederationError::Unexpected)?;
        let code_challenge = pkce::challenge_s256(&code_verifier);

        let mut url = Url::parse(&provider.authorize_url)
            .with_context(|| format!("invalid authorize_url for {}", provider.name))
            .map_err(FederationError::Unexpected)?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &provider.client_id)
            .append_pair("redirect_uri", &provider.redirect_url)
            .append_pair("scope", &provider.scopes.join(" "))
            .append_pair("state", &state)
            .append_pair("code_challenge", &code_challenge)
            .append_pair("code_challenge_method", CODE_CHALLENGE_METHOD_S256);

        let pending = PendingAuthorization::new(
            state.clone(),
            PendingTarget::Provider {
                provider: provider.name.clone(),
                code_verifier,
            },
            provider.redirect_url.clone(),
        )
        .with_return_to(Some(sanitize_return_to(return_to)));
        self.sessions.insert_pending(provider_key(&state), pending);

        Ok(url.to_string())
    }

    /// Finish a provider login.
    ///
    /// # Errors
    /// `Protocol` for an `error` parameter, an unknown, reused or expired
    /// `state`; `InvalidGrant`/`Upstream` when the provider exchange fails.
    pub async fn callback(
        &self,
        provider: &str,
        code: Option<&str>,
        state: Option<&str>,
        error: Option<&str>,
    ) -> Result<FederatedSession, FederationError> {
        if let Some(error) = error {
            info!(provider, error, "provider returned an error");
            return Err(OAuthError::access_denied("sign-in was cancelled or denied").into());
        }
        let state = state.ok_or_else(|| OAuthError::invalid_request("missing state"))?;
        let pending = self
            .sessions
            .take_pending(&provider_key(state))
            .ok_or_else(|| OAuthError::invalid_grant("unknown or already used state"))?;

        let expired = pending.is_expired_at(Utc::now());
        let PendingTarget::Provider {
            provider: expected,
            code_verifier,
        } = pending.target
        else {
            return Err(OAuthError::invalid_grant("state mismatch").into());
        };
        if expected != provider || pending.state != state {
            warn!(provider, "state bound to another provider");
            return Err(OAuthError::invalid_grant("state mismatch").into());
        }
        if expired {
            return Err(OAuthError::invalid_grant("login request expired").into());
        }
        let code = code.ok_or_else(|| OAuthError::invalid_request("missing code"))?;

        let provider = self.enabled_provider(provider).await?;
        let client_secret = self.providers.client_secret(&provider)?;
        let tokens = self
            .upstream
            .exchange_code(&provider, &client_secret, code, &code_verifier)
            .await?;
        let profile = self
            .upstream
            .fetch_profile(&provider, &tokens.access_token)
            .await?;

        let user = self.link_user(&provider, &profile).await?;
        if !user.is_active {
            warn!(user = %user.public_id, provider = %provider.name, "inactive user attempted sign-in");
            return Err(FederationError::AccountDisabled);
        }

        let (session_token, session) = self
            .sessions
            .create(
                user.public_id.clone(),
                user.email.clone(),
                Some(provider.name.clone()),
                Some(tokens),
            )
            .map_err(FederationError::Unexpected)?;
        info!(user = %user.public_id, provider = %provider.name, "federated sign-in");

        Ok(FederatedSession {
            session_token,
            session,
            user,
            return_to: pending
                .return_to
                .unwrap_or_else(|| DEFAULT_RETURN_TO.to_string()),
        })
    }

    /// Resolve the local user for an upstream subject, creating or linking it
    /// on first sign-in.
    async fn link_user(
        &self,
        provider: &OAuthProvider,
        profile: &ProviderProfile,
    ) -> Result<User, FederationError> {
        let linked = match self.iam.find_identity(&provider.name, &profile.subject).await? {
            Some(identity) => self.iam.find_user_by_id(identity.user_id).await?,
            None => None,
        };

        let user = match linked {
            Some(user) => user,
            None => match self.iam.find_user_by_email(&profile.email).await? {
                // Only link an existing account when the provider vouches for the email.
                Some(user) if profile.email_verified => user,
                Some(_) => {
                    warn!(provider = %provider.name, "unverified email matches an existing account");
                    return Err(OAuthError::access_denied("email address is not verified").into());
                }
                None => {
                    self.iam
                        .create_user(NewUser {
                            email: profile.email.clone(),
                            given_name: profile.given_name.clone(),
                            family_name: profile.family_name.clone(),
                            email_verified: profile.email_verified,
                        })
                        .await?
                }
            },
        };

        self.iam
            .upsert_identity(UserIdentity {
                user_id: user.id,
                provider: provider.name.clone(),
                provider_user_id: profile.subject.clone(),
                client_id: Some(provider.client_id.clone()),
                last_login_at: Utc::now(),
            })
            .await?;
        Ok(user)
    }
}

#[async_trait]
impl UpstreamRefresher for FederatedLogin {
    async fn refresh_upstream(
        &self,
        provider: &str,
        refresh_token: &str,
    ) -> Result<UpstreamTokens, RefreshError> {
        let provider = self
            .enabled_provider(provider)
            .await
            .map_err(|err| RefreshError::Upstream(err.to_string()))?;
        let client_secret = self
            .providers
            .client_secret(&provider)
            .map_err(|err| RefreshError::Upstream(err.to_string()))?;
        match self
            .upstream
            .refresh(&provider, &client_secret, refresh_token)
            .await
        {
            Ok(mut tokens) => {
                // Providers may omit the refresh token when it was not rotated.
                if tokens.refresh_token.is_none() {
                    tokens.refresh_token = Some(refresh_token.to_string());
                }
                Ok(tokens)
            }
            Err(FederationError::InvalidGrant) => Err(RefreshError::InvalidGrant),
            Err(err) => Err(RefreshError::Upstream(err.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::FieldCipher;
    use crate::iam::{seed_builtins, Authorizer, Principal, ProviderDraft, SUPERADMIN_ROLE};
    use crate::store::MemoryStore;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProvider {
        profile: ProviderProfile,
        exchanges: AtomicUsize,
    }

    #[async_trait]
    impl ProviderClient for FakeProvider {
        async fn exchange_code(
            &self,
            _provider: &OAuthProvider,
            client_secret: &SecretString,
            code: &str,
            code_verifier: &str,
        ) -> Result<UpstreamTokens, FederationError> {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            assert_eq!(client_secret.expose_secret(), "gh-secret");
            assert!(pkce::valid_verifier(code_verifier));
            if code == "bad" {
                return Err(FederationError::InvalidGrant);
            }
            Ok(UpstreamTokens {
                access_token: "upstream-access".to_string(),
                refresh_token: Some("upstream-refresh".to_string()),
                expires_at: None,
            })
        }

        async fn refresh(
            &self,
            _provider: &OAuthProvider,
            _client_secret: &SecretString,
            refresh_token: &str,
        ) -> Result<UpstreamTokens, FederationError> {
            if refresh_token == "revoked" {
                return Err(FederationError::InvalidGrant);
            }
            Ok(UpstreamTokens {
                access_token: "rotated-access".to_string(),
                refresh_token: None,
                expires_at: None,
            })
        }

        async fn fetch_profile(
            &self,
            _provider: &OAuthProvider,
            _access_token: &str,
        ) -> Result<ProviderProfile, FederationError> {
            Ok(self.profile.clone())
        }
    }

    struct Fixture {
        login: FederatedLogin,
        store: Arc<MemoryStore>,
        upstream: Arc<FakeProvider>,
    }

    async fn fixture(email_verified: bool) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        seed_builtins(store.as_ref()).await.unwrap();
        let admin = store
            .create_user(NewUser {
                email: "admin@example.com".to_string(),
                ..NewUser::default()
            })
            .await
            .unwrap();
        let superadmin = store.find_role_by_name(SUPERADMIN_ROLE).await.unwrap().unwrap();
        store
            .assign_user_roles(&admin.public_id, &[superadmin.public_id])
            .await
            .unwrap();

        let authorizer = Arc::new(Authorizer::new(store.clone()));
        let providers = Arc::new(ProviderService::new(
            store.clone(),
            authorizer,
            FieldCipher::new([3u8; 32]),
        ));
        providers
            .upsert(
                &Principal::from(&admin),
                ProviderDraft {
                    name: "github".to_string(),
                    client_id: "gh-client".to_string(),
                    client_secret: SecretString::from("gh-secret".to_string()),
                    authorize_url: "https://github.com/login/oauth/authorize".to_string(),
                    token_url: "https://github.com/login/oauth/access_token".to_string(),
                    userinfo_url: "https://api.github.com/user".to_string(),
                    redirect_url: "https://id.example.com/auth/providers/github/callback"
                        .to_string(),
                    scopes: vec!["read:user".to_string(), "user:email".to_string()],
                    enabled: true,
                },
            )
            .await
            .unwrap();

        let upstream = Arc::new(FakeProvider {
            profile: ProviderProfile {
                subject: "12345".to_string(),
                email: "octo@example.com".to_string(),
                email_verified,
                given_name: Some("Octo".to_string()),
                family_name: None,
            },
            exchanges: AtomicUsize::new(0),
        });
        let login = FederatedLogin::new(
            store.clone(),
            store.clone(),
            Arc::new(SessionStore::default()),
            providers,
            upstream.clone(),
        );
        Fixture {
            login,
            store,
            upstream,
        }
    }

    fn state_of(url: &str) -> String {
        let params: HashMap<String, String> = Url::parse(url)
            .unwrap()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(params.get("code_challenge_method").map(String::as_str), Some("S256"));
        assert_eq!(params.get("client_id").map(String::as_str), Some("gh-client"));
        params.get("state").cloned().unwrap()
    }

    #[tokio::test]
    async fn first_login_creates_user_and_session() {
        let fx = fixture(true).await;
        let url = fx.login.begin("github", Some("/projects")).await.unwrap();
        let state = state_of(&url);

        let signed_in = fx
            .login
            .callback("github", Some("code"), Some(&state), None)
            .await
            .unwrap();
        assert_eq!(signed_in.return_to, "/projects");
        assert_eq!(signed_in.user.email, "octo@example.com");
        assert_eq!(signed_in.session.provider.as_deref(), Some("github"));
        assert!(fx.store.find_identity("github", "12345").await.unwrap().is_some());

        let again = fx
            .login
            .callback("github", Some("code"), Some(&state), None)
            .await
            .unwrap_err();
        assert!(matches!(again, FederationError::Protocol(_)));
        assert_eq!(fx.upstream.exchanges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn returning_user_is_linked_by_identity() {
        let fx = fixture(true).await;
        let state = state_of(&fx.login.begin("github", None).await.unwrap());
        let first = fx.login.callback("github", Some("c"), Some(&state), None).await.unwrap();
        let state = state_of(&fx.login.begin("github", None).await.unwrap());
        let second = fx.login.callback("github", Some("c"), Some(&state), None).await.unwrap();
        assert_eq!(first.user.public_id, second.user.public_id);
        assert_eq!(second.return_to, "/");
    }

    #[tokio::test]
    async fn unverified_email_does_not_take_over_account() {
        let fx = fixture(false).await;
        fx.store
            .create_user(NewUser {
                email: "octo@example.com".to_string(),
                ..NewUser::default()
            })
            .await
            .unwrap();
        let state = state_of(&fx.login.begin("github", None).await.unwrap());
        let err = fx
            .login
            .callback("github", Some("c"), Some(&state), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::Protocol(_)));
    }

    #[tokio::test]
    async fn error_param_and_unknown_provider() {
        let fx = fixture(true).await;
        let state = state_of(&fx.login.begin("github", None).await.unwrap());
        let err = fx
            .login
            .callback("github", None, Some(&state), Some("access_denied"))
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::Protocol(_)));
        assert!(matches!(
            fx.login.begin("google", None).await,
            Err(FederationError::UnknownProvider(_))
        ));
    }

    #[tokio::test]
    async fn refresh_keeps_refresh_token_and_maps_invalid_grant() {
        let fx = fixture(true).await;
        let tokens = fx.login.refresh_upstream("github", "upstream-refresh").await.unwrap();
        assert_eq!(tokens.refresh_token.as_deref(), Some("upstream-refresh"));
        assert_eq!(
            fx.login.refresh_upstream("github", "revoked").await,
            Err(RefreshError::InvalidGrant)
        );
    }

    #[test]
    fn return_to_must_be_relative() {
        assert_eq!(sanitize_return_to(Some("/a?b=c")), "/a?b=c");
        assert_eq!(sanitize_return_to(Some("//evil.example.com")), "/");
        assert_eq!(sanitize_return_to(Some("https://evil.example.com")), "/");
        assert_eq!(sanitize_return_to(Some("/\\evil")), "/");
        assert_eq!(sanitize_return_to(None), "/");
    }

    #[test]
    fn github_style_profile() {
        let claims = serde_json::json!({"id": 42, "email": "x@example.com", "login": "x"});
        let profile = profile_from_claims(&claims).unwrap();
        assert_eq!(profile.subject, "42");
        assert!(!profile.email_verified);
        let missing = serde_json::json!({"sub": "abc"});
        assert!(profile_from_claims(&missing).is_err());
    }
}
