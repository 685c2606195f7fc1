//! Rate-limited, expiring, single-use codes: numeric login codes and email
//! verification links. Only SHA-256 hashes of the codes are stored.

mod config;
mod notifier;
mod service;

pub use config::CodeConfig;
pub use notifier::{CodeMessage, LogNotifier, Notifier};
pub use service::{EmailVerificationService, OtpService};

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum CodeError {
    #[error("too many codes requested")]
    RateLimited,
    /// The code was issued but could not be sent.
    #[error("code delivery failed")]
    Delivery(#[source] anyhow::Error),
    #[error("invalid code")]
    Invalid,
    #[error("code expired")]
    Expired,
    #[error("user not found")]
    UnknownUser,
    #[error("unexpected error")]
    Unexpected(#[source] anyhow::Error),
}

impl From<StoreError> for CodeError {
    fn from(err: StoreError) -> Self {
        Self::Unexpected(anyhow::Error::new(err))
    }
}
