use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use super::{SessionStore, UpstreamTokens};
use crate::crypto::hash_token_hex;
use crate::single_flight::SingleFlight;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("session not found")]
    NoSession,
    #[error("session has no refresh token")]
    NotRefreshable,
    /// The refresh token was revoked or rotated away; the session is gone.
    #[error("invalid_grant")]
    InvalidGrant,
    #[error("upstream refresh failed: {0}")]
    Upstream(String),
}

/// Exchanges an upstream refresh token for a new token set.
#[async_trait]
pub trait UpstreamRefresher: Send + Sync {
    async fn refresh_upstream(
        &self,
        provider: &str,
        refresh_token: &str,
    ) -> Result<UpstreamTokens, RefreshError>;
}

/// Refreshes the upstream tokens held by a session.
///
/// Calls for the same refresh token share one upstream request and its result
/// is replayed for the single-flight minimum interval.
pub struct SessionRefresher {
    sessions: Arc<SessionStore>,
    upstream: Arc<dyn UpstreamRefresher>,
    flight: SingleFlight<Result<UpstreamTokens, RefreshError>>,
}

impl SessionRefresher {
    #[must_use]
    pub fn new(sessions: Arc<SessionStore>, upstream: Arc<dyn UpstreamRefresher>) -> Self {
        Self {
            sessions,
            upstream,
            flight: SingleFlight::default(),
        }
    }

    #[must_use]
    pub fn with_single_flight(mut self, flight: SingleFlight<Result<UpstreamTokens, RefreshError>>) -> Self {
        self.flight = flight;
        self
    }

    /// # Errors
    /// `InvalidGrant` after deleting the session when upstream rejects the
    /// refresh token; `NoSession`/`NotRefreshable` when there is nothing to do.
    pub async fn refresh(&self, session_token: &str) -> Result<UpstreamTokens, RefreshError> {
        let session = self.sessions.get(session_token).ok_or(RefreshError::NoSession)?;
        let provider = session.provider.clone().ok_or(RefreshError::NotRefreshable)?;
        let refresh_token = session
            .tokens
            .as_ref()
            .and_then(|tokens| tokens.refresh_token.clone())
            .ok_or(RefreshError::NotRefreshable)?;

        let upstream = Arc::clone(&self.upstream);
        let result = self
            .flight
            .run(&hash_token_hex(&refresh_token), || async move {
                upstream.refresh_upstream(&provider, &refresh_token).await
            })
            .await;

        match result {
            Ok(tokens) => {
                self.sessions.set_upstream_tokens(session_token, tokens.clone());
                info!(user = %session.user_public_id, "session tokens refreshed");
                Ok(tokens)
            }
            Err(RefreshError::InvalidGrant) => {
                warn!(user = %session.user_public_id, "refresh token rejected, clearing session");
                self.sessions.delete(session_token);
                Err(RefreshError::InvalidGrant)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeUpstream {
        calls: AtomicUsize,
        reject: bool,
    }

    #[async_trait]
    impl UpstreamRefresher for FakeUpstream {
        async fn refresh_upstream(
            &self,
            _provider: &str,
            _refresh_token: &str,
        ) -> Result<UpstreamTokens, RefreshError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.reject {
                return Err(RefreshError::InvalidGrant);
            }
            Ok(UpstreamTokens {
                access_token: format!("access-{n}"),
                refresh_token: Some(format!("refresh-{n}")),
                expires_at: None,
            })
        }
    }

    fn session_with_tokens(store: &SessionStore) -> String {
        let tokens = UpstreamTokens {
            access_token: "access-0".to_string(),
            refresh_token: Some("refresh-0".to_string()),
            expires_at: None,
        };
        store
            .create("01USER", "a@example.com", Some("github".to_string()), Some(tokens))
            .unwrap()
            .0
    }

    #[tokio::test]
    async fn concurrent_refreshes_rotate_once() {
        let sessions = Arc::new(SessionStore::default());
        let token = session_with_tokens(&sessions);
        let upstream = Arc::new(FakeUpstream {
            calls: AtomicUsize::new(0),
            reject: false,
        });
        let refresher = SessionRefresher::new(Arc::clone(&sessions), upstream.clone());

        let (a, b) = tokio::join!(refresher.refresh(&token), refresher.refresh(&token));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            sessions.get(&token).unwrap().tokens.unwrap().access_token,
            "access-1"
        );
    }

    #[tokio::test]
    async fn invalid_grant_clears_session() {
        let sessions = Arc::new(SessionStore::default());
        let token = session_with_tokens(&sessions);
        let upstream = Arc::new(FakeUpstream {
            calls: AtomicUsize::new(0),
            reject: true,
        });
        let refresher = SessionRefresher::new(Arc::clone(&sessions), upstream);

        assert_eq!(refresher.refresh(&token).await, Err(RefreshError::InvalidGrant));
        assert!(sessions.get(&token).is_none());
        assert_eq!(refresher.refresh(&token).await, Err(RefreshError::NoSession));
    }

    #[tokio::test]
    async fn session_without_refresh_token_is_not_refreshable() {
        let sessions = Arc::new(SessionStore::default());
        let (token, _) = sessions.create("01USER", "a@example.com", None, None).unwrap();
        let upstream = Arc::new(FakeUpstream {
            calls: AtomicUsize::new(0),
            reject: false,
        });
        let refresher = SessionRefresher::new(sessions, upstream);
        assert_eq!(refresher.refresh(&token).await, Err(RefreshError::NotRefreshable));
    }
}
