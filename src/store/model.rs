use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Internal ids (`id`, `user_id`) are storage-local and never leave the crate
/// boundary; callers address entities by `public_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub public_id: String,
    pub email: String,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub is_active: bool,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct NewUser {
    pub email: String,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub email_verified: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: i64,
    pub provider: String,
    pub provider_user_id: String,
    pub client_id: Option<String>,
    pub last_login_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Role {
    pub id: i64,
    pub public_id: String,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Permission {
    pub id: i64,
    pub public_id: String,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Project {
    pub id: i64,
    pub public_id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectMember {
    pub project_public_id: String,
    pub user_public_id: String,
    pub role: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OAuthClient {
    pub id: i64,
    pub public_id: String,
    pub client_id: String,
    pub name: String,
    pub confidential: bool,
    /// Argon2 PHC string; required for confidential clients.
    pub client_secret_hash: Option<String>,
    pub redirect_uris: Vec<String>,
    pub scopes: Vec<String>,
    pub pkce_required: bool,
    pub is_default: bool,
}

impl OAuthClient {
    #[must_use]
    pub fn allows_redirect(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|uri| uri == redirect_uri)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewOAuthClient {
    pub client_id: String,
    pub name: String,
    pub confidential: bool,
    pub client_secret_hash: Option<String>,
    pub redirect_uris: Vec<String>,
    pub scopes: Vec<String>,
    pub pkce_required: bool,
    pub is_default: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OAuthProvider {
    /// Stable key such as `google` or `github`.
    pub name: String,
    pub client_id: String,
    /// `nonce || ciphertext`, bound to `name` as AAD.
    pub client_secret_encrypted: Vec<u8>,
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub redirect_url: String,
    pub scopes: Vec<String>,
    pub enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshGrant {
    pub token_hash: Vec<u8>,
    pub client_id: String,
    pub user_public_id: String,
    pub scope: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CodePurpose {
    Otp,
    EmailVerification,
}

impl CodePurpose {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Otp => "otp",
            Self::EmailVerification => "email_verification",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewCode {
    pub user_id: i64,
    pub purpose: CodePurpose,
    pub code_hash: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeOutcome {
    Consumed { user_id: i64 },
    Expired,
    NotFound,
}

/// Everything the authorizer needs about a principal, read in one go.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessProfile {
    pub is_superadmin: bool,
    pub permissions: HashSet<String>,
}
