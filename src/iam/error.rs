use thiserror::Error;

use super::AuthzError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum IamError {
    #[error("forbidden")]
    Forbidden,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("in use: {0}")]
    InUse(String),
    /// Attempted to delete or strip a built-in entity.
    #[error("protected: {0}")]
    Protected(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("unexpected error")]
    Unexpected(#[source] anyhow::Error),
}

impl From<StoreError> for IamError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Conflict(what) => Self::Conflict(what),
            StoreError::InUse(what) => Self::InUse(what),
            StoreError::Unexpected(err) => Self::Unexpected(err),
        }
    }
}

impl From<AuthzError> for IamError {
    fn from(err: AuthzError) -> Self {
        match err {
            AuthzError::Forbidden => Self::Forbidden,
            AuthzError::Unexpected(err) => Self::Unexpected(err),
        }
    }
}
