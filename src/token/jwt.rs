use base64ct::{Base64UrlUnpadded, Encoding};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::TokenError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessTokenHeader {
    pub alg: String,
    pub typ: String,
    pub kid: String,
}

impl AccessTokenHeader {
    fn rs256(kid: impl Into<String>) -> Self {
        Self {
            alg: "RS256".to_string(),
            typ: "JWT".to_string(),
            kid: kid.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessTokenClaims {
    pub iss: String,
    /// Public ID of the user the token was issued to.
    pub sub: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, TokenError> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, TokenError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| TokenError::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn split_token(token: &str) -> Result<(&str, &str, &str), TokenError> {
    let mut parts = token.split('.');
    let header_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
    let claims_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
    let sig_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
    if parts.next().is_some() {
        return Err(TokenError::TokenFormat);
    }
    Ok((header_b64, claims_b64, sig_b64))
}

/// Create an RS256 signed access token (JWT) carrying `kid` in its header.
///
/// # Errors
///
/// Returns an error if header or claims JSON cannot be encoded.
pub fn sign_rs256(
    private_key: &RsaPrivateKey,
    kid: impl Into<String>,
    claims: &AccessTokenClaims,
) -> Result<String, TokenError> {
    let header = AccessTokenHeader::rs256(kid);
    let header_b64 = b64e_json(&header)?;
    let claims_b64 = b64e_json(claims)?;
    let signing_input = format!("{header_b64}.{claims_b64}");

    let signing_key = SigningKey::<Sha256>::new(private_key.clone());
    let signature: Signature = signing_key.sign(signing_input.as_bytes());
    let signature_b64 = Base64UrlUnpadded::encode_string(&signature.to_vec());

    Ok(format!("{signing_input}.{signature_b64}"))
}

/// Decode the JOSE header without verifying the signature.
///
/// Only used to pick the verification key by `kid`.
///
/// # Errors
///
/// Returns an error for malformed tokens or a non-RS256 `alg`.
pub fn decode_header(token: &str) -> Result<AccessTokenHeader, TokenError> {
    let (header_b64, _, _) = split_token(token)?;
    let header: AccessTokenHeader = b64d_json(header_b64)?;
    if header.alg != "RS256" {
        return Err(TokenError::UnsupportedAlg(header.alg));
    }
    Ok(header)
}

/// Verify an RS256 access token against a known public key and return its claims.
///
/// `expected_audience` is skipped when `None`.
///
/// # Errors
///
/// Returns an error if the token is malformed, the signature does not match, or
/// `iss`/`aud`/`exp` fail validation.
pub fn verify_rs256(
    token: &str,
    public_key: &RsaPublicKey,
    expected_issuer: &str,
    expected_audience: Option<&str>,
    now_unix_seconds: i64,
) -> Result<AccessTokenClaims, TokenError> {
    let (header_b64, claims_b64, sig_b64) = split_token(token)?;
    let header: AccessTokenHeader = b64d_json(header_b64)?;
    if header.alg != "RS256" {
        return Err(TokenError::UnsupportedAlg(header.alg));
    }

    let verifying_key = VerifyingKey::<Sha256>::new(public_key.clone());
    let signing_input = format!("{header_b64}.{claims_b64}");
    let signature_bytes = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| TokenError::Base64)?;
    let signature =
        Signature::try_from(signature_bytes.as_slice()).map_err(|_| TokenError::InvalidSignature)?;
    verifying_key
        .verify(signing_input.as_bytes(), &signature)
        .map_err(|_| TokenError::InvalidSignature)?;

    let claims: AccessTokenClaims = b64d_json(claims_b64)?;
    if claims.iss != expected_issuer {
        return Err(TokenError::InvalidIssuer);
    }
    if let Some(audience) = expected_audience {
        if claims.aud != audience {
            return Err(TokenError::InvalidAudience);
        }
    }
    if claims.exp <= now_unix_seconds {
        return Err(TokenError::Expired);
    }

    Ok(claims)
}
