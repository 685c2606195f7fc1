use chrono::{Duration as ChronoDuration, Utc};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use url::Url;

use super::pkce::{self, CODE_CHALLENGE_METHOD_S256};
use super::{
    AuthorizeOutcome, AuthorizeRequest, ClientCredentials, CodeExchange, OAuthError,
    OAuthErrorCode, TokenResponse,
};
use crate::crypto::{generate_token, hash_token, hash_token_hex, verify_secret};
use crate::iam::Principal;
use crate::session::{
    AuthorizationStage, ClientAuthorization, PendingAuthorization, PendingTarget, SessionStore,
};
use crate::single_flight::SingleFlight;
use crate::store::{ClientStore, GrantStore, IamStore, OAuthClient, RefreshGrant, StoreError};
use crate::token::TokenSigner;

const TOKEN_TYPE: &str = "Bearer";
const DEFAULT_REFRESH_TOKEN_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

fn code_key(code: &str) -> String {
    format!("code:{}", hash_token_hex(code))
}

fn login_key(continuation: &str) -> String {
    format!("login:{}", hash_token_hex(continuation))
}

fn unexpected(operation: &str, err: impl Display) -> OAuthError {
    error!(operation, "{err}");
    OAuthError::server_error()
}

fn with_query(base: &str, pairs: &[(&str, &str)]) -> Option<String> {
    let mut url = Url::parse(base).ok()?;
    url.query_pairs_mut().extend_pairs(pairs);
    Some(url.to_string())
}

/// Failure of the authorize step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthorizeError {
    /// The client or redirect URI is unknown; show the error, never redirect.
    Untrusted(OAuthError),
    /// Report back to the client through its registered redirect URI.
    Redirect {
        redirect_uri: String,
        state: Option<String>,
        error: OAuthError,
    },
}

impl AuthorizeError {
    #[must_use]
    pub fn error(&self) -> &OAuthError {
        match self {
            Self::Untrusted(error) | Self::Redirect { error, .. } => error,
        }
    }

    /// Redirect target carrying `error`, `error_description` and `state`.
    #[must_use]
    pub fn redirect_url(&self) -> Option<String> {
        let Self::Redirect {
            redirect_uri,
            state,
            error,
        } = self
        else {
            return None;
        };
        let mut pairs = vec![
            ("error", error.code.as_str()),
            ("error_description", error.description.as_str()),
        ];
        if let Some(state) = state {
            pairs.push(("state", state.as_str()));
        }
        with_query(redirect_uri, &pairs)
    }
}

/// Signs access tokens and records their refresh grants.
#[derive(Clone)]
struct TokenMinter {
    signer: Arc<TokenSigner>,
    grants: Arc<dyn GrantStore>,
    iam: Arc<dyn IamStore>,
    refresh_token_ttl: Duration,
}

impl TokenMinter {
    async fn mint(
        &self,
        client_id: &str,
        user_public_id: &str,
        scope: Option<&str>,
        rotate_from: Option<&[u8]>,
    ) -> Result<TokenResponse, OAuthError> {
        let access = self
            .signer
            .sign_access_token(user_public_id, client_id, scope)
            .map_err(|err| unexpected("sign_access_token", err))?;
        let refresh_token =
            generate_token().map_err(|err| unexpected("generate_refresh_token", err))?;
        let ttl = ChronoDuration::from_std(self.refresh_token_ttl)
            .unwrap_or_else(|_| ChronoDuration::days(30));
        let grant = RefreshGrant {
            token_hash: hash_token(&refresh_token),
            client_id: client_id.to_string(),
            user_public_id: user_public_id.to_string(),
            scope: scope.map(str::to_string),
            expires_at: Utc::now() + ttl,
            revoked: false,
        };

        match rotate_from {
            Some(old_hash) => {
                let rotated = self
                    .grants
                    .rotate_refresh_grant(old_hash, grant)
                    .await
                    .map_err(|err| unexpected("rotate_refresh_grant", err))?;
                if !rotated {
                    return Err(OAuthError::invalid_grant("refresh token is no longer valid"));
                }
            }
            None => self
                .grants
                .insert_refresh_grant(grant)
                .await
                .map_err(|err| unexpected("insert_refresh_grant", err))?,
        }

        Ok(TokenResponse {
            access_token: access.token,
            token_type: TOKEN_TYPE.to_string(),
            expires_in: access.expires_in,
            refresh_token: Some(refresh_token),
            scope: scope.map(str::to_string),
        })
    }
}

async fn rotate_grant(
    minter: &TokenMinter,
    refresh_token: &str,
    client_id: &str,
) -> Result<TokenResponse, OAuthError> {
    let token_hash = hash_token(refresh_token);
    let grant = minter
        .grants
        .find_refresh_grant(&token_hash)
        .await
        .map_err(|err| unexpected("find_refresh_grant", err))?
        .ok_or_else(|| OAuthError::invalid_grant("refresh token is invalid"))?;

    if grant.client_id != client_id {
        warn!(client_id, "refresh token presented by another client");
        return Err(OAuthError::invalid_grant("refresh token is invalid"));
    }
    if grant.revoked {
        warn!(client_id, user = %grant.user_public_id, "revoked refresh token presented");
        return Err(OAuthError::invalid_grant("refresh token is no longer valid"));
    }
    if grant.expires_at <= Utc::now() {
        return Err(OAuthError::invalid_grant("refresh token expired"));
    }
    let active = match minter.iam.get_user(&grant.user_public_id).await {
        Ok(user) => user.is_active,
        Err(StoreError::NotFound(_)) => false,
        Err(err) => return Err(unexpected("get_user", err)),
    };
    if !active {
        warn!(client_id, user = %grant.user_public_id, "refresh for missing or inactive user");
        return Err(OAuthError::invalid_grant("refresh token is no longer valid"));
    }

    let response = minter
        .mint(
            client_id,
            &grant.user_public_id,
            grant.scope.as_deref(),
            Some(token_hash.as_slice()),
        )
        .await?;
    info!(client_id, user = %grant.user_public_id, "refresh token rotated");
    Ok(response)
}

/// The OAuth2 authorization-code + PKCE state machine.
///
/// Pending authorizations live in the [`SessionStore`]: a request waiting for
/// sign-in is parked under a server-generated continuation key, an issued code
/// under the hash of the code. Both are consumed atomically, so a code can be
/// exchanged at most once.
pub struct AuthorizationServer {
    clients: Arc<dyn ClientStore>,
    sessions: Arc<SessionStore>,
    minter: TokenMinter,
    flight: SingleFlight<Result<TokenResponse, OAuthError>>,
}

impl AuthorizationServer {
    #[must_use]
    pub fn new(
        clients: Arc<dyn ClientStore>,
        grants: Arc<dyn GrantStore>,
        iam: Arc<dyn IamStore>,
        sessions: Arc<SessionStore>,
        signer: Arc<TokenSigner>,
    ) -> Self {
        Self {
            clients,
            sessions,
            minter: TokenMinter {
                signer,
                grants,
                iam,
                refresh_token_ttl: DEFAULT_REFRESH_TOKEN_TTL,
            },
            flight: SingleFlight::default(),
        }
    }

    #[must_use]
    pub fn with_refresh_token_ttl(mut self, ttl: Duration) -> Self {
        self.minter.refresh_token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_single_flight(
        mut self,
        flight: SingleFlight<Result<TokenResponse, OAuthError>>,
    ) -> Self {
        self.flight = flight;
        self
    }

    /// Validate an authorization request and either issue a code for the
    /// signed-in `principal` or park the request until sign-in.
    ///
    /// # Errors
    /// [`AuthorizeError::Untrusted`] while the client and redirect URI are not
    /// yet validated, [`AuthorizeError::Redirect`] afterwards.
    pub async fn authorize(
        &self,
        request: &AuthorizeRequest,
        principal: Option<&Principal>,
    ) -> Result<AuthorizeOutcome, AuthorizeError> {
        let client_id = request
            .client_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                AuthorizeError::Untrusted(OAuthError::invalid_request("missing client_id"))
            })?;
        let client = self
            .clients
            .find_client(client_id)
            .await
            .map_err(|err| AuthorizeError::Untrusted(unexpected("find_client", err)))?
            .ok_or_else(|| AuthorizeError::Untrusted(OAuthError::invalid_client("unknown client")))?;
        let redirect_uri = request.redirect_uri.as_deref().ok_or_else(|| {
            AuthorizeError::Untrusted(OAuthError::invalid_request("missing redirect_uri"))
        })?;
        if !client.allows_redirect(redirect_uri) {
            warn!(client_id, redirect_uri, "unregistered redirect_uri");
            return Err(AuthorizeError::Untrusted(OAuthError::invalid_request(
                "redirect_uri is not registered for this client",
            )));
        }

        let redirect_error = |error: OAuthError| AuthorizeError::Redirect {
            redirect_uri: redirect_uri.to_string(),
            state: request.state.clone(),
            error,
        };

        if request.response_type.as_deref() != Some("code") {
            return Err(redirect_error(OAuthError::new(
                OAuthErrorCode::UnsupportedResponseType,
                "only response_type=code is supported",
            )));
        }
        if let Some(scope) = request.scope.as_deref() {
            if !scope_allowed(&client, scope) {
                return Err(redirect_error(OAuthError::new(
                    OAuthErrorCode::InvalidScope,
                    "requested scope is not allowed for this client",
                )));
            }
        }

        let code_challenge = match request.code_challenge.as_deref() {
            Some(challenge) => {
                if request.code_challenge_method.as_deref() != Some(CODE_CHALLENGE_METHOD_S256) {
                    return Err(redirect_error(OAuthError::invalid_request(
                        "code_challenge_method must be S256",
                    )));
                }
                if !pkce::valid_challenge(challenge) {
                    return Err(redirect_error(OAuthError::invalid_request(
                        "malformed code_challenge",
                    )));
                }
                Some(challenge.to_string())
            }
            None if client.pkce_required => {
                return Err(redirect_error(OAuthError::invalid_request(
                    "code_challenge is required",
                )));
            }
            None => None,
        };

        let authorization = ClientAuthorization {
            client_id: client.client_id.clone(),
            client_state: request.state.clone(),
            scope: request.scope.clone(),
            user_public_id: None,
            code_challenge,
            stage: AuthorizationStage::Pending,
        };

        match principal {
            Some(principal) => self
                .issue_code(authorization, redirect_uri, principal)
                .map(AuthorizeOutcome::Redirect),
            None => {
                let continuation = generate_token()
                    .map_err(|err| redirect_error(unexpected("generate_continuation", err)))?;
                self.sessions.insert_pending(
                    login_key(&continuation),
                    PendingAuthorization::new(
                        continuation.clone(),
                        PendingTarget::Client(authorization),
                        redirect_uri,
                    ),
                );
                Ok(AuthorizeOutcome::LoginRequired { continuation })
            }
        }
    }

    /// Finish a parked authorization request once the user has signed in.
    ///
    /// # Errors
    /// [`AuthorizeError::Untrusted`] when the continuation is unknown, used or
    /// expired.
    pub fn resume(&self, continuation: &str, principal: &Principal) -> Result<String, AuthorizeError> {
        let expired = || {
            AuthorizeError::Untrusted(OAuthError::invalid_request(
                "authorization request expired or unknown",
            ))
        };
        let pending = self
            .sessions
            .take_pending(&login_key(continuation))
            .ok_or_else(expired)?;
        if pending.is_expired_at(Utc::now()) {
            return Err(expired());
        }
        let PendingTarget::Client(authorization) = pending.target else {
            return Err(expired());
        };
        if authorization.stage != AuthorizationStage::Pending {
            return Err(expired());
        }
        self.issue_code(authorization, &pending.redirect_uri, principal)
    }

    fn issue_code(
        &self,
        mut authorization: ClientAuthorization,
        redirect_uri: &str,
        principal: &Principal,
    ) -> Result<String, AuthorizeError> {
        let redirect_error = |error: OAuthError| AuthorizeError::Redirect {
            redirect_uri: redirect_uri.to_string(),
            state: authorization.client_state.clone(),
            error,
        };
        let code = generate_token()
            .map_err(|err| redirect_error(unexpected("generate_authorization_code", err)))?;

        let mut pairs = vec![("code", code.as_str())];
        if let Some(state) = authorization.client_state.as_deref() {
            pairs.push(("state", state));
        }
        let location = with_query(redirect_uri, &pairs).ok_or_else(|| {
            redirect_error(unexpected("build_redirect", "redirect_uri is not a URL"))
        })?;

        authorization.user_public_id = Some(principal.public_id.clone());
        authorization.stage = AuthorizationStage::CodeIssued;
        let client_id = authorization.client_id.clone();
        let key = code_key(&code);
        self.sessions.insert_pending(
            key.clone(),
            PendingAuthorization::new(key, PendingTarget::Client(authorization), redirect_uri),
        );
        info!(client_id = %client_id, user = %principal.public_id, "authorization code issued");
        Ok(location)
    }

    /// Exchange an authorization code for tokens.
    ///
    /// The pending record is consumed before any other check, so a code is
    /// burnt by the first attempt whatever its outcome.
    ///
    /// # Errors
    /// `invalid_grant` for unknown, used, expired or mismatched codes and PKCE
    /// failures; `invalid_client` when client authentication fails.
    pub async fn exchange(
        &self,
        exchange: CodeExchange,
        credentials: &ClientCredentials,
    ) -> Result<TokenResponse, OAuthError> {
        if let Some(error) = exchange.error.as_deref() {
            info!(error, "authorization failed upstream of the exchange");
            return Err(OAuthError::access_denied("authorization was not granted"));
        }

        let pending = self
            .sessions
            .take_pending(&code_key(&exchange.code))
            .ok_or_else(|| {
                OAuthError::invalid_grant("authorization code is invalid or already used")
            })?;

        let expired = pending.is_expired_at(Utc::now());
        let PendingTarget::Client(authorization) = pending.target else {
            return Err(OAuthError::invalid_grant("authorization code is invalid"));
        };
        if authorization.stage != AuthorizationStage::CodeIssued {
            return Err(OAuthError::invalid_grant("authorization code is invalid"));
        }
        if exchange
            .state
            .as_deref()
            .is_some_and(|state| authorization.client_state.as_deref() != Some(state))
        {
            warn!(client_id = %authorization.client_id, "state mismatch at code exchange");
            return Err(OAuthError::invalid_grant("state mismatch"));
        }
        if exchange.redirect_uri.as_deref() != Some(pending.redirect_uri.as_str()) {
            return Err(OAuthError::invalid_grant("redirect_uri mismatch"));
        }
        if expired {
            return Err(OAuthError::invalid_grant("authorization code expired"));
        }

        if let Some(challenge) = authorization.code_challenge.as_deref() {
            let verified = exchange
                .code_verifier
                .as_deref()
                .is_some_and(|verifier| {
                    pkce::valid_verifier(verifier) && pkce::verify_s256(verifier, challenge)
                });
            if !verified {
                warn!(client_id = %authorization.client_id, "PKCE verification failed");
                return Err(OAuthError::invalid_grant("PKCE verification failed"));
            }
        }

        let client = self.authenticate_client(credentials).await?;
        if client.client_id != authorization.client_id {
            warn!(client_id = %client.client_id, "code presented by another client");
            return Err(OAuthError::invalid_grant("authorization code is invalid"));
        }

        let user_public_id = authorization
            .user_public_id
            .as_deref()
            .ok_or_else(|| OAuthError::invalid_grant("authorization code is invalid"))?;
        let response = self
            .minter
            .mint(
                &client.client_id,
                user_public_id,
                authorization.scope.as_deref(),
                None,
            )
            .await?;
        info!(client_id = %client.client_id, user = user_public_id, "tokens issued");
        Ok(response)
    }

    /// Rotate a refresh token.
    ///
    /// Concurrent calls for the same token and client share one rotation and
    /// its result is replayed for the single-flight minimum interval.
    ///
    /// # Errors
    /// `invalid_grant` for unknown, revoked, expired or foreign refresh tokens.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        credentials: &ClientCredentials,
    ) -> Result<TokenResponse, OAuthError> {
        if refresh_token.is_empty() {
            return Err(OAuthError::invalid_request("missing refresh_token"));
        }
        let client = self.authenticate_client(credentials).await?;

        let key = format!("{}:{}", client.client_id, hash_token_hex(refresh_token));
        let minter = self.minter.clone();
        let token = refresh_token.to_string();
        let client_id = client.client_id;
        self.flight
            .run(&key, move || async move {
                rotate_grant(&minter, &token, &client_id).await
            })
            .await
    }

    /// Revoke a refresh token (RFC 7009). Unknown tokens are not an error.
    ///
    /// # Errors
    /// `invalid_client` when client authentication fails.
    pub async fn revoke(&self, token: &str, credentials: &ClientCredentials) -> Result<(), OAuthError> {
        let client = self.authenticate_client(credentials).await?;
        let token_hash = hash_token(token);
        let grant = self
            .minter
            .grants
            .find_refresh_grant(&token_hash)
            .await
            .map_err(|err| unexpected("find_refresh_grant", err))?;
        if let Some(grant) = grant.filter(|grant| grant.client_id == client.client_id) {
            let revoked = self
                .minter
                .grants
                .revoke_refresh_grant(&token_hash)
                .await
                .map_err(|err| unexpected("revoke_refresh_grant", err))?;
            if revoked {
                info!(client_id = %client.client_id, user = %grant.user_public_id, "refresh token revoked");
            }
        }
        Ok(())
    }

    /// Look up the client and check its secret when it is confidential.
    ///
    /// # Errors
    /// `invalid_client` for unknown clients or bad secrets.
    pub async fn authenticate_client(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<OAuthClient, OAuthError> {
        let client = self
            .clients
            .find_client(&credentials.client_id)
            .await
            .map_err(|err| unexpected("find_client", err))?
            .ok_or_else(|| OAuthError::invalid_client("client authentication failed"))?;

        if client.confidential {
            let authenticated = match (
                credentials.client_secret.as_deref(),
                client.client_secret_hash.as_deref(),
            ) {
                (Some(secret), Some(hash)) => verify_secret(secret, hash),
                _ => false,
            };
            if !authenticated {
                warn!(client_id = %client.client_id, "client authentication failed");
                return Err(OAuthError::invalid_client("client authentication failed"));
            }
        }
        Ok(client)
    }
}

fn scope_allowed(client: &OAuthClient, scope: &str) -> bool {
    client.scopes.is_empty()
        || scope
            .split_whitespace()
            .all(|requested| client.scopes.iter().any(|allowed| allowed == requested))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::hash_secret;
    use crate::store::{MemoryStore, NewOAuthClient, NewUser};
    use crate::token::TEST_PRIVATE_KEY_PEM;
    use std::collections::HashMap;

    const REDIRECT: &str = "https://app.example.com/callback";
    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    struct Fixture {
        server: AuthorizationServer,
        sessions: Arc<SessionStore>,
        store: Arc<MemoryStore>,
        alice: Principal,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store
            .create_client(NewOAuthClient {
                client_id: "spa".to_string(),
                name: "Single page app".to_string(),
                confidential: false,
                client_secret_hash: None,
                redirect_uris: vec![REDIRECT.to_string()],
                scopes: vec!["openid".to_string(), "profile".to_string()],
                pkce_required: true,
                is_default: false,
            })
            .await
            .unwrap();
        store
            .create_client(NewOAuthClient {
                client_id: "backend".to_string(),
                name: "Backend".to_string(),
                confidential: true,
                client_secret_hash: Some(hash_secret("backend-secret").unwrap()),
                redirect_uris: vec![REDIRECT.to_string()],
                scopes: Vec::new(),
                pkce_required: false,
                is_default: false,
            })
            .await
            .unwrap();

        let signer = Arc::new(
            TokenSigner::from_pem_or_der(TEST_PRIVATE_KEY_PEM.as_bytes(), "kid-1", "https://id.example.com")
                .unwrap(),
        );
        let sessions = Arc::new(SessionStore::default());
        let server = AuthorizationServer::new(
            store.clone(),
            store.clone(),
            store.clone(),
            sessions.clone(),
            signer,
        );
        let alice = store
            .create_user(NewUser {
                email: "alice@example.com".to_string(),
                email_verified: true,
                ..NewUser::default()
            })
            .await
            .unwrap();
        Fixture {
            server,
            sessions,
            store,
            alice: Principal {
                user_id: alice.id,
                public_id: alice.public_id,
                email: alice.email,
            },
        }
    }

    fn spa_request() -> AuthorizeRequest {
        AuthorizeRequest {
            response_type: Some("code".to_string()),
            client_id: Some("spa".to_string()),
            redirect_uri: Some(REDIRECT.to_string()),
            scope: Some("openid".to_string()),
            state: Some("xyz".to_string()),
            code_challenge: Some(CHALLENGE.to_string()),
            code_challenge_method: Some("S256".to_string()),
        }
    }

    fn query(location: &str) -> HashMap<String, String> {
        Url::parse(location)
            .unwrap()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    async fn issue_code(fx: &Fixture, request: &AuthorizeRequest) -> String {
        let outcome = fx.server.authorize(request, Some(&fx.alice)).await.unwrap();
        let AuthorizeOutcome::Redirect(location) = outcome else {
            panic!("expected redirect");
        };
        query(&location).remove("code").unwrap()
    }

    fn exchange(code: &str, verifier: Option<&str>) -> CodeExchange {
        CodeExchange {
            code: code.to_string(),
            state: Some("xyz".to_string()),
            redirect_uri: Some(REDIRECT.to_string()),
            code_verifier: verifier.map(str::to_string),
            error: None,
        }
    }

    #[tokio::test]
    async fn code_is_single_use() {
        let fx = fixture().await;
        let code = issue_code(&fx, &spa_request()).await;
        let creds = ClientCredentials::public("spa");

        let tokens = fx.server.exchange(exchange(&code, Some(VERIFIER)), &creds).await.unwrap();
        assert_eq!(tokens.token_type, "Bearer");
        assert!(tokens.refresh_token.is_some());
        assert_eq!(tokens.scope.as_deref(), Some("openid"));

        let err = fx
            .server
            .exchange(exchange(&code, Some(VERIFIER)), &creds)
            .await
            .unwrap_err();
        assert_eq!(err.code, OAuthErrorCode::InvalidGrant);
    }

    #[tokio::test]
    async fn pkce_mismatch_is_invalid_grant() {
        let fx = fixture().await;
        let code = issue_code(&fx, &spa_request()).await;
        let wrong = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let err = fx
            .server
            .exchange(exchange(&code, Some(wrong)), &ClientCredentials::public("spa"))
            .await
            .unwrap_err();
        assert_eq!(err.code, OAuthErrorCode::InvalidGrant);
        assert_eq!(fx.sessions.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_param_and_state_mismatch_fail() {
        let fx = fixture().await;
        let creds = ClientCredentials::public("spa");

        let mut with_error = exchange("anything", Some(VERIFIER));
        with_error.error = Some("access_denied".to_string());
        let err = fx.server.exchange(with_error, &creds).await.unwrap_err();
        assert_eq!(err.code, OAuthErrorCode::AccessDenied);

        let code = issue_code(&fx, &spa_request()).await;
        let mut mismatched = exchange(&code, Some(VERIFIER));
        mismatched.state = Some("other".to_string());
        let err = fx.server.exchange(mismatched, &creds).await.unwrap_err();
        assert_eq!(err.code, OAuthErrorCode::InvalidGrant);
    }

    #[tokio::test]
    async fn expired_pending_authorization_is_rejected() {
        let fx = fixture().await;
        let code = issue_code(&fx, &spa_request()).await;

        let key = code_key(&code);
        let mut pending = fx.sessions.take_pending(&key).unwrap();
        pending.created_at -= ChronoDuration::minutes(6);
        fx.sessions.insert_pending(key, pending);

        let err = fx
            .server
            .exchange(exchange(&code, Some(VERIFIER)), &ClientCredentials::public("spa"))
            .await
            .unwrap_err();
        assert_eq!(err.code, OAuthErrorCode::InvalidGrant);
        assert_eq!(err.description, "authorization code expired");
    }

    #[tokio::test]
    async fn untrusted_redirect_is_never_followed() {
        let fx = fixture().await;
        let mut request = spa_request();
        request.redirect_uri = Some("https://evil.example.com/cb".to_string());
        let err = fx.server.authorize(&request, Some(&fx.alice)).await.unwrap_err();
        assert!(matches!(err, AuthorizeError::Untrusted(_)));
        assert!(err.redirect_url().is_none());

        let mut request = spa_request();
        request.code_challenge = None;
        let err = fx.server.authorize(&request, Some(&fx.alice)).await.unwrap_err();
        let location = err.redirect_url().unwrap();
        let params = query(&location);
        assert_eq!(params.get("error").map(String::as_str), Some("invalid_request"));
        assert_eq!(params.get("state").map(String::as_str), Some("xyz"));
    }

    #[tokio::test]
    async fn login_required_then_resume() {
        let fx = fixture().await;
        let outcome = fx.server.authorize(&spa_request(), None).await.unwrap();
        let AuthorizeOutcome::LoginRequired { continuation } = outcome else {
            panic!("expected login");
        };
        let location = fx.server.resume(&continuation, &fx.alice).unwrap();
        let code = query(&location).remove("code").unwrap();
        assert!(fx.server.resume(&continuation, &fx.alice).is_err());

        let tokens = fx
            .server
            .exchange(exchange(&code, Some(VERIFIER)), &ClientCredentials::public("spa"))
            .await
            .unwrap();
        assert!(!tokens.access_token.is_empty());
    }

    #[tokio::test]
    async fn confidential_client_must_authenticate() {
        let fx = fixture().await;
        let mut request = spa_request();
        request.client_id = Some("backend".to_string());
        request.code_challenge = None;
        request.code_challenge_method = None;

        let code = issue_code(&fx, &request).await;
        let err = fx
            .server
            .exchange(
                exchange(&code, None),
                &ClientCredentials::with_secret("backend", "wrong"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, OAuthErrorCode::InvalidClient);

        let code = issue_code(&fx, &request).await;
        let tokens = fx
            .server
            .exchange(
                exchange(&code, None),
                &ClientCredentials::with_secret("backend", "backend-secret"),
            )
            .await
            .unwrap();
        assert!(tokens.refresh_token.is_some());
    }

    #[tokio::test]
    async fn refresh_rotates_and_old_token_dies() {
        let fx = fixture().await;
        let code = issue_code(&fx, &spa_request()).await;
        let creds = ClientCredentials::public("spa");
        let first = fx.server.exchange(exchange(&code, Some(VERIFIER)), &creds).await.unwrap();
        let first_refresh = first.refresh_token.unwrap();

        let server = AuthorizationServer::new(
            fx.store.clone(),
            fx.store.clone(),
            fx.store.clone(),
            fx.sessions.clone(),
            Arc::new(
                TokenSigner::from_pem_or_der(TEST_PRIVATE_KEY_PEM.as_bytes(), "kid-1", "https://id.example.com")
                    .unwrap(),
            ),
        )
        .with_single_flight(SingleFlight::new(Duration::ZERO));

        let second = server.refresh(&first_refresh, &creds).await.unwrap();
        assert_ne!(second.refresh_token.as_deref(), Some(first_refresh.as_str()));

        let err = server.refresh(&first_refresh, &creds).await.unwrap_err();
        assert_eq!(err.code, OAuthErrorCode::InvalidGrant);

        let err = server
            .refresh(second.refresh_token.as_deref().unwrap(), &ClientCredentials::with_secret("backend", "backend-secret"))
            .await
            .unwrap_err();
        assert_eq!(err.code, OAuthErrorCode::InvalidGrant);
    }

    #[tokio::test]
    async fn concurrent_refresh_rotates_once() {
        let fx = fixture().await;
        let code = issue_code(&fx, &spa_request()).await;
        let creds = ClientCredentials::public("spa");
        let tokens = fx.server.exchange(exchange(&code, Some(VERIFIER)), &creds).await.unwrap();
        let refresh_token = tokens.refresh_token.unwrap();

        let (a, b) = tokio::join!(
            fx.server.refresh(&refresh_token, &creds),
            fx.server.refresh(&refresh_token, &creds)
        );
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[tokio::test]
    async fn revoke_kills_refresh_token() {
        let fx = fixture().await;
        let code = issue_code(&fx, &spa_request()).await;
        let creds = ClientCredentials::public("spa");
        let tokens = fx.server.exchange(exchange(&code, Some(VERIFIER)), &creds).await.unwrap();
        let refresh_token = tokens.refresh_token.unwrap();

        fx.server.revoke(&refresh_token, &creds).await.unwrap();
        fx.server.revoke("unknown-token", &creds).await.unwrap();
        let err = fx.server.refresh(&refresh_token, &creds).await.unwrap_err();
        assert_eq!(err.code, OAuthErrorCode::InvalidGrant);
    }

    #[tokio::test]
    async fn refresh_stops_for_deactivated_user() {
        let fx = fixture().await;
        let code = issue_code(&fx, &spa_request()).await;
        let creds = ClientCredentials::public("spa");
        let tokens = fx.server.exchange(exchange(&code, Some(VERIFIER)), &creds).await.unwrap();
        let refresh_token = tokens.refresh_token.unwrap();

        fx.store.set_user_active(&fx.alice.public_id, false).await.unwrap();
        let err = fx.server.refresh(&refresh_token, &creds).await.unwrap_err();
        assert_eq!(err.code, OAuthErrorCode::InvalidGrant);
    }
}
