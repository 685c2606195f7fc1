use base64ct::{Base64, Encoding};

use super::OAuthError;

/// Client identity presented at the token endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Option<String>,
}

impl ClientCredentials {
    #[must_use]
    pub fn public(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
        }
    }

    #[must_use]
    pub fn with_secret(client_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: Some(secret.into()),
        }
    }
}

/// Parse an `Authorization: Basic ...` header value.
#[must_use]
pub fn parse_basic(header: &str) -> Option<ClientCredentials> {
    let trimmed = header.trim();
    let encoded = trimmed
        .strip_prefix("Basic ")
        .or_else(|| trimmed.strip_prefix("basic "))?
        .trim();
    let decoded = Base64::decode_vec(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (client_id, secret) = decoded.split_once(':')?;
    if client_id.is_empty() {
        return None;
    }
    Some(ClientCredentials::with_secret(client_id, secret))
}

/// Merge HTTP Basic and form-body credentials.
///
/// # Errors
/// `invalid_request` when no client is identified or both methods carry a
/// secret; `invalid_client` when they name different clients.
pub fn resolve_credentials(
    basic: Option<ClientCredentials>,
    body_client_id: Option<&str>,
    body_client_secret: Option<&str>,
) -> Result<ClientCredentials, OAuthError> {
    let body_client_id = body_client_id.filter(|id| !id.is_empty());
    let body_client_secret = body_client_secret.filter(|secret| !secret.is_empty());

    match basic {
        Some(basic) => {
            if body_client_secret.is_some() {
                return Err(OAuthError::invalid_request(
                    "use a single client authentication method",
                ));
            }
            if body_client_id.is_some_and(|id| id != basic.client_id) {
                return Err(OAuthError::invalid_client("client_id mismatch"));
            }
            Ok(basic)
        }
        None => {
            let client_id = body_client_id
                .ok_or_else(|| OAuthError::invalid_request("missing client_id"))?;
            Ok(ClientCredentials {
                client_id: client_id.to_string(),
                client_secret: body_client_secret.map(str::to_string),
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::oauth::OAuthErrorCode;

    fn basic(id: &str, secret: &str) -> String {
        let raw = format!("{id}:{secret}");
        format!("Basic {}", Base64::encode_string(raw.as_bytes()))
    }

    #[test]
    fn parses_basic_header() {
        let creds = parse_basic(&basic("backend", "s3:cret")).unwrap();
        assert_eq!(creds.client_id, "backend");
        assert_eq!(creds.client_secret.as_deref(), Some("s3:cret"));
        assert!(parse_basic("Bearer abc").is_none());
        assert!(parse_basic("Basic !!!").is_none());
    }

    #[test]
    fn body_only_credentials() {
        let creds = resolve_credentials(None, Some("spa"), None).unwrap();
        assert_eq!(creds, ClientCredentials::public("spa"));
        let err = resolve_credentials(None, None, None).unwrap_err();
        assert_eq!(err.code, OAuthErrorCode::InvalidRequest);
    }

    #[test]
    fn conflicting_methods_are_rejected() {
        let header = parse_basic(&basic("backend", "secret"));
        let err = resolve_credentials(header.clone(), Some("backend"), Some("secret")).unwrap_err();
        assert_eq!(err.code, OAuthErrorCode::InvalidRequest);
        let err = resolve_credentials(header.clone(), Some("other"), None).unwrap_err();
        assert_eq!(err.code, OAuthErrorCode::InvalidClient);
        assert_eq!(
            resolve_credentials(header, Some("backend"), None).unwrap(),
            ClientCredentials::with_secret("backend", "secret")
        );
    }
}
