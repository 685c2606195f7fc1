//! Proof Key for Code Exchange (RFC 7636), S256 only.

use anyhow::Result;
use base64ct::{Base64UrlUnpadded, Encoding};
use sha2::{Digest, Sha256};

use crate::crypto::{constant_time_eq, generate_token};

pub const CODE_CHALLENGE_METHOD_S256: &str = "S256";

/// `base64url(sha256(verifier))` without padding.
#[must_use]
pub fn challenge_s256(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    Base64UrlUnpadded::encode_string(&digest)
}

#[must_use]
pub fn verify_s256(verifier: &str, challenge: &str) -> bool {
    constant_time_eq(challenge_s256(verifier).as_bytes(), challenge.as_bytes())
}

/// 43 to 128 unreserved characters.
#[must_use]
pub fn valid_verifier(verifier: &str) -> bool {
    (43..=128).contains(&verifier.len())
        && verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}

/// A challenge is the unpadded base64url encoding of a SHA-256 digest.
#[must_use]
pub fn valid_challenge(challenge: &str) -> bool {
    challenge.len() == 43
        && challenge
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_'))
}

/// # Errors
/// Returns an error if the OS random source fails.
pub fn generate_verifier() -> Result<String> {
    generate_token()
}
