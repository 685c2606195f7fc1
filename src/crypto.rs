//! Random tokens, one-way hashes, and field encryption.

use anyhow::{anyhow, Context, Result};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64ct::{Base64, Base64UrlUnpadded, Encoding};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;
const FIELD_KEY_LEN: usize = 32;

/// Generate a 32-byte random token encoded as unpadded base64url.
///
/// # Errors
/// Returns an error if the OS random source fails.
pub fn generate_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate random token")?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// SHA-256 of a bearer secret; the raw value is never stored.
#[must_use]
pub fn hash_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

/// Hex form of [`hash_token`], used as an in-memory map key.
#[must_use]
pub fn hash_token_hex(token: &str) -> String {
    hash_token(token)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Hash a client secret into an Argon2id PHC string.
///
/// # Errors
/// Returns an error if hashing fails.
pub fn hash_secret(secret: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|e| anyhow!("failed to hash secret: {e}"))?;
    Ok(hash.to_string())
}

/// Check `secret` against a PHC string. Malformed hashes never verify.
#[must_use]
pub fn verify_secret(secret: &str, phc: &str) -> bool {
    PasswordHash::new(phc).is_ok_and(|hash| {
        Argon2::default()
            .verify_password(secret.as_bytes(), &hash)
            .is_ok()
    })
}

#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// ChaCha20-Poly1305 encryption for secrets stored at rest (provider client
/// secrets). Output is `nonce (12 bytes) || ciphertext`.
#[derive(Clone)]
pub struct FieldCipher {
    key: [u8; FIELD_KEY_LEN],
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher").finish_non_exhaustive()
    }
}

impl FieldCipher {
    #[must_use]
    pub fn new(key: [u8; FIELD_KEY_LEN]) -> Self {
        Self { key }
    }

    /// Build from a base64 (standard alphabet) encoded 32-byte key.
    ///
    /// # Errors
    /// Returns an error if the value is not base64 or not 32 bytes long.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = Base64::decode_vec(encoded.trim())
            .map_err(|_| anyhow!("encryption key is not valid base64"))?;
        let key: [u8; FIELD_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| anyhow!("encryption key must be {FIELD_KEY_LEN} bytes"))?;
        Ok(Self::new(key))
    }

    /// # Errors
    /// Returns an error if encryption fails.
    #[allow(deprecated)]
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| anyhow!("encryption failure: {e}"))?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// # Errors
    /// Returns an error if the data is truncated, tampered, or bound to other AAD.
    #[allow(deprecated)]
    pub fn decrypt(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(anyhow!("invalid ciphertext length"));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|e| anyhow!("decryption failure: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn field_cipher_roundtrip_and_aad_binding() {
        let cipher = FieldCipher::new([7u8; 32]);
        let sealed = cipher.encrypt(b"client-secret", b"google").unwrap();
        assert_eq!(cipher.decrypt(&sealed, b"google").unwrap(), b"client-secret");
        assert!(cipher.decrypt(&sealed, b"github").is_err());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn field_cipher_rejects_tampering() {
        let cipher = FieldCipher::new([7u8; 32]);
        let mut sealed = cipher.encrypt(b"secret", b"aad").unwrap();
        if let Some(byte) = sealed.last_mut() {
            *byte ^= 0xFF;
        }
        assert!(cipher.decrypt(&sealed, b"aad").is_err());
        assert!(cipher.decrypt(&[0u8; 4], b"aad").is_err());
    }

    #[test]
    fn field_cipher_key_must_be_32_bytes() {
        assert!(FieldCipher::from_base64("c2hvcnQ=").is_err());
        let key = Base64::encode_string(&[1u8; 32]);
        assert!(FieldCipher::from_base64(&key).is_ok());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn tokens_are_unique_and_hashes_stable() {
        let a = generate_token().unwrap();
        let b = generate_token().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert_eq!(hash_token(&a), hash_token(&a));
        assert_eq!(hash_token_hex("abc").len(), 64);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn secret_hash_verifies_only_the_secret() {
        let phc = hash_secret("s3cret").unwrap();
        assert!(phc.starts_with("$argon2"));
        assert!(verify_secret("s3cret", &phc));
        assert!(!verify_secret("other", &phc));
        assert!(!verify_secret("s3cret", "not-a-phc"));
    }

    #[test]
    fn constant_time_eq_matches_equality() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
