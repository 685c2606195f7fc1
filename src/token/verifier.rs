use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use super::{decode_header, now_unix_seconds, verify_rs256, AccessTokenClaims, TokenError};
use crate::jwks::{JwksCache, JwksError};

/// Validates bearer access tokens against a cached, remotely published JWKS.
pub struct AccessTokenVerifier {
    cache: Arc<JwksCache>,
    issuer: String,
    audience: Option<String>,
}

impl AccessTokenVerifier {
    #[must_use]
    pub fn new(cache: Arc<JwksCache>, issuer: impl Into<String>) -> Self {
        Self {
            cache,
            issuer: issuer.into(),
            audience: None,
        }
    }

    #[must_use]
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    #[must_use]
    pub fn cache(&self) -> &JwksCache {
        &self.cache
    }

    /// Verify `token` and return its claims.
    ///
    /// An unknown `kid` triggers exactly one forced JWKS refresh followed by a
    /// single retry, so a key rotated in upstream is picked up without a restart.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::UnknownKid` when the key is still missing after the
    /// refresh, `TokenError::KeyLookup` when the refresh itself failed (including
    /// the refresh rate limit), or a validation error for bad tokens.
    pub async fn verify(&self, token: &str) -> Result<AccessTokenClaims, TokenError> {
        let header = decode_header(token)?;
        let looked_up_at = Instant::now();

        let key = match self.cache.get_key(&header.kid).await {
            Ok(key) => key,
            Err(JwksError::KeyNotFound(kid)) => {
                debug!(kid = %kid, "unknown kid, forcing jwks refresh");
                self.cache.force_refresh(looked_up_at).await.map_err(|err| {
                    warn!(kid = %kid, error = %err, "forced jwks refresh failed");
                    TokenError::KeyLookup(err)
                })?;
                match self.cache.get_key(&header.kid).await {
                    Ok(key) => key,
                    Err(JwksError::KeyNotFound(kid)) => return Err(TokenError::UnknownKid(kid)),
                    Err(err) => return Err(TokenError::KeyLookup(err)),
                }
            }
            Err(err) => return Err(TokenError::KeyLookup(err)),
        };

        verify_rs256(
            token,
            &key,
            &self.issuer,
            self.audience.as_deref(),
            now_unix_seconds(),
        )
    }
}
