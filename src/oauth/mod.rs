//! OAuth2 authorization server (authorization code + PKCE, refresh token
//! rotation, revocation) and sign-in through upstream identity providers.

mod client_auth;
mod config;
mod error;
mod federation;
pub mod pkce;
mod server;
mod types;

pub use client_auth::{parse_basic, resolve_credentials, ClientCredentials};
pub use config::AuthConfig;
pub use error::{OAuthError, OAuthErrorBody, OAuthErrorCode};
pub use federation::{
    sanitize_return_to, FederatedLogin, FederatedSession, FederationError, HttpProviderClient,
    ProviderClient, ProviderProfile,
};
pub use server::{AuthorizationServer, AuthorizeError};
pub use types::{
    AuthorizeOutcome, AuthorizeRequest, CodeExchange, RevokeRequest, TokenRequest, TokenResponse,
};
