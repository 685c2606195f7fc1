//! # Gatehouse (OAuth2 authorization server and RBAC engine)
//!
//! `gatehouse` issues RS256 access tokens through the OAuth2 authorization
//! code flow with PKCE, publishes its signing keys as a JWKS, and answers
//! "may this principal do that?" from roles, permissions and project
//! memberships.
//!
//! ## Tokens
//!
//! Access tokens are short-lived JWTs signed with the configured RSA key and
//! verified against the published key set. Refresh tokens are opaque, stored
//! only as SHA-256 hashes, and rotated on every use. Resource servers verify
//! bearer tokens through a cached JWKS that refreshes once on an unknown `kid`
//! and rate-limits forced refreshes.
//!
//! ## Authorization
//!
//! Effective permissions are the union of role and direct grants. The
//! `superadmin` role bypasses every check and, together with the `root`
//! permission, can never be deleted.
//!
//! ## Sign-in
//!
//! Users sign in through upstream identity providers or one-time login codes.
//! Either path ends in a server-side session referenced by an `HttpOnly`
//! cookie.

pub mod api;
pub mod app;
pub mod cli;
pub mod crypto;
pub mod iam;
pub mod jwks;
pub mod oauth;
pub mod otp;
pub mod ratelimit;
pub mod session;
pub mod single_flight;
pub mod store;
pub mod token;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
