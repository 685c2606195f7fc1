//! Access-token signing and verification.
//!
//! Tokens are RS256 JWTs. The signer publishes its public key as a JWK with a
//! stable `kid`; retired keys stay in the published set until every token they
//! signed has expired, so verifiers can keep validating across a rotation.

mod error;
mod jwk;
mod jwt;
mod signer;
mod verifier;

pub use error::TokenError;
pub use jwk::{decode_private_key, Jwk, Jwks};
pub use jwt::{decode_header, sign_rs256, verify_rs256, AccessTokenClaims, AccessTokenHeader};
pub use signer::{IssuedAccessToken, TokenSigner};
pub use verifier::AccessTokenVerifier;

#[cfg(test)]
pub(crate) use signer::tests::TEST_PRIVATE_KEY_PEM;

/// Unix seconds used for `iat`/`exp` math.
pub(crate) fn now_unix_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}
