use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

use super::TtlStore;
use crate::crypto::{generate_token, hash_token_hex};

const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(12 * 60 * 60);
/// Pending authorizations are single-use and live for five minutes.
pub const PENDING_AUTHORIZATION_TTL: Duration = Duration::from_secs(5 * 60);

/// Tokens obtained from an upstream identity provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct Session {
    pub user_public_id: String,
    pub email: String,
    pub provider: Option<String>,
    pub tokens: Option<UpstreamTokens>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthorizationStage {
    /// Waiting for the user to sign in.
    Pending,
    /// An authorization code is bound to this record.
    CodeIssued,
}

#[derive(Clone, Debug)]
pub struct ClientAuthorization {
    pub client_id: String,
    /// `state` as sent by the client on `/oauth/authorize`.
    pub client_state: Option<String>,
    pub scope: Option<String>,
    pub user_public_id: Option<String>,
    pub code_challenge: Option<String>,
    pub stage: AuthorizationStage,
}

#[derive(Clone, Debug)]
pub enum PendingTarget {
    Client(ClientAuthorization),
    Provider {
        provider: String,
        code_verifier: String,
    },
}

#[derive(Clone, Debug)]
pub struct PendingAuthorization {
    pub state: String,
    pub target: PendingTarget,
    pub redirect_uri: String,
    pub return_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PendingAuthorization {
    #[must_use]
    pub fn new(state: impl Into<String>, target: PendingTarget, redirect_uri: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            target,
            redirect_uri: redirect_uri.into(),
            return_to: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_return_to(mut self, return_to: Option<String>) -> Self {
        self.return_to = return_to;
        self
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let max_age = ChronoDuration::from_std(PENDING_AUTHORIZATION_TTL)
            .unwrap_or_else(|_| ChronoDuration::minutes(5));
        now - self.created_at > max_age
    }
}

/// Server-side sessions and in-flight authorizations.
///
/// Sessions are keyed by the SHA-256 of the opaque token handed to the
/// browser; the raw token is never kept.
pub struct SessionStore {
    sessions: TtlStore<Session>,
    pending: TtlStore<PendingAuthorization>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl SessionStore {
    #[must_use]
    pub fn new(session_ttl: Duration) -> Self {
        Self {
            sessions: TtlStore::new(session_ttl),
            pending: TtlStore::new(PENDING_AUTHORIZATION_TTL),
        }
    }

    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        self.sessions.default_ttl()
    }

    /// Open a session and return its opaque token.
    ///
    /// # Errors
    /// Returns an error if token generation fails.
    pub fn create(
        &self,
        user_public_id: impl Into<String>,
        email: impl Into<String>,
        provider: Option<String>,
        tokens: Option<UpstreamTokens>,
    ) -> Result<(String, Session)> {
        let token = generate_token()?;
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(self.session_ttl()).unwrap_or(ChronoDuration::hours(12));
        let session = Session {
            user_public_id: user_public_id.into(),
            email: email.into(),
            provider,
            tokens,
            created_at: now,
            expires_at: now + ttl,
        };
        self.sessions.insert(hash_token_hex(&token), session.clone());
        Ok((token, session))
    }

    pub fn get(&self, token: &str) -> Option<Session> {
        self.sessions.get(&hash_token_hex(token))
    }

    pub fn delete(&self, token: &str) -> bool {
        self.sessions.remove(&hash_token_hex(token))
    }

    pub fn set_upstream_tokens(&self, token: &str, tokens: UpstreamTokens) -> bool {
        self.sessions
            .update(&hash_token_hex(token), |session| session.tokens = Some(tokens))
    }

    pub fn insert_pending(&self, key: impl Into<String>, pending: PendingAuthorization) {
        self.pending.insert(key, pending);
    }

    /// Atomically consume a pending authorization.
    pub fn take_pending(&self, key: &str) -> Option<PendingAuthorization> {
        self.pending.take(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop expired sessions and pending records.
    pub fn purge_expired(&self) -> usize {
        self.sessions.purge_expired() + self.pending.purge_expired()
    }
}
