//! Verifier-side JWKS cache with TTL expiry and rate-limited refresh.
//!
//! Resource servers hold a `kid -> public key` map fetched from the issuer's
//! `/.well-known/jwks.json`. Keys are served from memory while fresh; a stale
//! cache triggers a refresh, and an unknown `kid` lets the caller force one.
//! Refreshes are capped by a one-minute sliding window so a flood of tokens
//! with bogus `kid`s cannot hammer the issuer.

mod cache;
mod fetcher;

pub use cache::{JwksCache, JwksCacheConfig};
pub use fetcher::{HttpJwksFetcher, JwksFetcher, StaticJwksFetcher};

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JwksError {
    #[error("jwks fetch failed: {0}")]
    Fetch(String),
    #[error("jwks refresh rate limit exceeded")]
    RateLimited,
    #[error("key not found: {0}")]
    KeyNotFound(String),
}
