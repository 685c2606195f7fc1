use rsa::RsaPublicKey;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{JwksError, JwksFetcher};
use crate::ratelimit::{RateLimitDecision, SlidingWindow};
use crate::token::Jwk;

const DEFAULT_TTL_SECONDS: u64 = 300;
const DEFAULT_REFRESH_PER_MINUTE: usize = 3;

#[derive(Clone, Debug)]
pub struct JwksCacheConfig {
    ttl: Duration,
    refresh_limit: usize,
    refresh_window: Duration,
}

impl Default for JwksCacheConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl JwksCacheConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_TTL_SECONDS),
            refresh_limit: DEFAULT_REFRESH_PER_MINUTE,
            refresh_window: Duration::from_secs(60),
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_limit(mut self, limit: usize) -> Self {
        self.refresh_limit = limit;
        self
    }

    #[must_use]
    pub fn with_refresh_window(mut self, window: Duration) -> Self {
        self.refresh_window = window;
        self
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn refresh_limit(&self) -> usize {
        self.refresh_limit
    }

    #[must_use]
    pub fn refresh_window(&self) -> Duration {
        self.refresh_window
    }
}

#[derive(Default)]
struct CacheState {
    keys: HashMap<String, RsaPublicKey>,
    last_fetch: Option<Instant>,
}

impl CacheState {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.last_fetch
            .is_some_and(|fetched_at| fetched_at.elapsed() < ttl)
    }
}

/// `kid -> RsaPublicKey` cache in front of a [`JwksFetcher`].
///
/// Readers share the `RwLock`; refreshes are serialized by a separate gate so
/// the key map is never locked while the fetch is in flight.
pub struct JwksCache {
    fetcher: Arc<dyn JwksFetcher>,
    config: JwksCacheConfig,
    state: RwLock<CacheState>,
    limiter: SlidingWindow,
    refresh_gate: Mutex<()>,
}

impl JwksCache {
    #[must_use]
    pub fn new(fetcher: Arc<dyn JwksFetcher>, config: JwksCacheConfig) -> Self {
        let limiter = SlidingWindow::new(config.refresh_limit(), config.refresh_window());
        Self {
            fetcher,
            config,
            state: RwLock::new(CacheState::default()),
            limiter,
            refresh_gate: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &JwksCacheConfig {
        &self.config
    }

    /// Key ids currently cached, sorted.
    pub async fn key_ids(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut kids: Vec<String> = state.keys.keys().cloned().collect();
        kids.sort();
        kids
    }

    /// Return the key for `kid`.
    ///
    /// A fresh cache answers directly, including `KeyNotFound` for unknown ids.
    /// A stale cache is refreshed first; if that refresh fails the stale key is
    /// still served when present.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` when the id is absent, or the refresh error when the cache
    /// is stale and the id cannot be served from the old key set.
    pub async fn get_key(&self, kid: &str) -> Result<RsaPublicKey, JwksError> {
        let (cached, fresh) = {
            let state = self.state.read().await;
            (state.keys.get(kid).cloned(), state.is_fresh(self.config.ttl()))
        };

        if fresh {
            return cached.ok_or_else(|| JwksError::KeyNotFound(kid.to_string()));
        }

        match self.refresh(Instant::now()).await {
            Ok(()) => {
                let state = self.state.read().await;
                state
                    .keys
                    .get(kid)
                    .cloned()
                    .ok_or_else(|| JwksError::KeyNotFound(kid.to_string()))
            }
            Err(err) => match cached {
                Some(key) => {
                    warn!(kid, error = %err, "using stale jwks cache");
                    Ok(key)
                }
                None => Err(err),
            },
        }
    }

    /// Refresh regardless of the TTL unless a fetch completed at or after
    /// `since`. Still subject to the refresh rate limit.
    ///
    /// Callers that queue behind an in-flight refresh, or whose lookup already
    /// refreshed a stale cache, reuse that result instead of fetching again.
    ///
    /// # Errors
    ///
    /// `RateLimited` when the refresh budget for the window is spent, or
    /// `Fetch` when the key set cannot be retrieved.
    pub async fn force_refresh(&self, since: Instant) -> Result<(), JwksError> {
        self.refresh(since).await
    }

    async fn refresh(&self, requested_at: Instant) -> Result<(), JwksError> {
        let _gate = self.refresh_gate.lock().await;

        {
            let state = self.state.read().await;
            if state
                .last_fetch
                .is_some_and(|fetched_at| fetched_at >= requested_at)
            {
                debug!("jwks refreshed by a concurrent caller");
                return Ok(());
            }
        }

        if self.limiter.try_acquire() == RateLimitDecision::Limited {
            warn!(
                limit = self.config.refresh_limit(),
                "jwks refresh rate limit exceeded"
            );
            return Err(JwksError::RateLimited);
        }

        let document = self.fetcher.fetch().await?;
        let keys = parse_keys(&document)?;

        let mut state = self.state.write().await;
        info!(keys = keys.len(), "jwks cache refreshed");
        state.keys = keys;
        state.last_fetch = Some(Instant::now());
        Ok(())
    }
}

/// Parse RSA keys from a JWKS document, skipping any entry that does not decode.
fn parse_keys(document: &Value) -> Result<HashMap<String, RsaPublicKey>, JwksError> {
    let Some(entries) = document.get("keys").and_then(Value::as_array) else {
        return Err(JwksError::Fetch("jwks document has no keys array".to_string()));
    };

    let mut keys = HashMap::with_capacity(entries.len());
    for entry in entries {
        let jwk: Jwk = match serde_json::from_value(entry.clone()) {
            Ok(jwk) => jwk,
            Err(err) => {
                debug!(error = %err, "skipping malformed jwk");
                continue;
            }
        };
        if jwk.kid.is_empty() {
            debug!("skipping jwk without kid");
            continue;
        }
        match jwk.to_rsa_public_key() {
            Ok(key) => {
                keys.insert(jwk.kid, key);
            }
            Err(err) => debug!(kid = %jwk.kid, error = %err, "skipping unusable jwk"),
        }
    }

    if keys.is_empty() {
        return Err(JwksError::Fetch("jwks contains no usable RSA keys".to_string()));
    }
    Ok(keys)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::token::TEST_PRIVATE_KEY_PEM;
    use crate::token::{decode_private_key, Jwks};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingFetcher {
        document: Value,
        calls: AtomicUsize,
        failing: AtomicBool,
        delay: Duration,
    }

    impl CountingFetcher {
        fn new(document: Value) -> Self {
            Self {
                document,
                calls: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JwksFetcher for CountingFetcher {
        async fn fetch(&self) -> Result<Value, JwksError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(JwksError::Fetch("upstream down".to_string()));
            }
            Ok(self.document.clone())
        }
    }

    fn document(kid: &str) -> Value {
        let private_key = decode_private_key(TEST_PRIVATE_KEY_PEM.as_bytes()).unwrap();
        let jwks = Jwks {
            keys: vec![Jwk::from_rsa_public_key(&RsaPublicKey::from(&private_key), kid)],
        };
        serde_json::to_value(jwks).unwrap()
    }

    #[tokio::test]
    async fn serves_cached_key_within_ttl() {
        let fetcher = Arc::new(CountingFetcher::new(document("k1")));
        let cache = JwksCache::new(fetcher.clone(), JwksCacheConfig::new());

        cache.get_key("k1").await.unwrap();
        cache.get_key("k1").await.unwrap();
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn unknown_kid_in_fresh_cache_does_not_fetch() {
        let fetcher = Arc::new(CountingFetcher::new(document("k1")));
        let cache = JwksCache::new(fetcher.clone(), JwksCacheConfig::new());

        cache.get_key("k1").await.unwrap();
        let err = cache.get_key("k2").await.unwrap_err();
        assert_eq!(err, JwksError::KeyNotFound("k2".to_string()));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn force_refresh_is_rate_limited() {
        let fetcher = Arc::new(CountingFetcher::new(document("k1")));
        let cache = JwksCache::new(
            fetcher.clone(),
            JwksCacheConfig::new().with_refresh_limit(3),
        );

        for _ in 0..3 {
            cache.force_refresh(Instant::now()).await.unwrap();
        }
        assert_eq!(cache.force_refresh(Instant::now()).await, Err(JwksError::RateLimited));
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn concurrent_force_refreshes_share_one_fetch() {
        let mut inner = CountingFetcher::new(document("k1"));
        inner.delay = Duration::from_millis(50);
        let fetcher = Arc::new(inner);
        let cache = JwksCache::new(fetcher.clone(), JwksCacheConfig::new());

        let requested_at = Instant::now();
        let (first, second) = tokio::join!(
            cache.force_refresh(requested_at),
            cache.force_refresh(requested_at)
        );
        first.unwrap();
        second.unwrap();
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn skips_malformed_and_non_rsa_keys() {
        let mut doc = document("good");
        let keys = doc["keys"].as_array_mut().unwrap();
        keys.push(json!({"kty": "EC", "kid": "ec", "crv": "P-256", "x": "AA", "y": "AA"}));
        keys.push(json!({"kty": "RSA", "kid": "broken", "n": "!!", "e": "AQAB"}));
        keys.push(json!({"kid": "no-kty"}));

        let cache = JwksCache::new(Arc::new(CountingFetcher::new(doc)), JwksCacheConfig::new());
        cache.force_refresh(Instant::now()).await.unwrap();
        assert_eq!(cache.key_ids().await, vec!["good".to_string()]);
    }

    #[tokio::test]
    async fn stale_key_survives_failed_refresh() {
        let fetcher = Arc::new(CountingFetcher::new(document("k1")));
        let cache = JwksCache::new(
            fetcher.clone(),
            JwksCacheConfig::new().with_ttl(Duration::ZERO),
        );

        cache.get_key("k1").await.unwrap();
        fetcher.failing.store(true, Ordering::SeqCst);
        assert!(cache.get_key("k1").await.is_ok());
        assert!(matches!(
            cache.get_key("k2").await,
            Err(JwksError::Fetch(_))
        ));
    }

    #[test]
    fn rejects_document_without_keys() {
        assert!(parse_keys(&json!({"nope": []})).is_err());
    }
}
