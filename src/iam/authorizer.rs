use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

use super::Principal;
use crate::store::{AccessProfile, IamStore, StoreError};

/// Outcome of a failed check. Callers are never told which half of a
/// project check failed.
#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("forbidden")]
    Forbidden,
    #[error("unexpected error")]
    Unexpected(#[source] anyhow::Error),
}

impl From<StoreError> for AuthzError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unexpected(err) => Self::Unexpected(err),
            other => Self::Unexpected(anyhow::Error::new(other)),
        }
    }
}

/// Evaluates permission checks against the current mapping state.
///
/// Every check reads a fresh [`AccessProfile`]; nothing is cached between
/// requests.
pub struct Authorizer {
    store: Arc<dyn IamStore>,
}

impl Authorizer {
    #[must_use]
    pub fn new(store: Arc<dyn IamStore>) -> Self {
        Self { store }
    }

    /// Superadmin flag and effective permission names for `principal`.
    ///
    /// # Errors
    /// Returns `AuthzError::Unexpected` if the store fails.
    pub async fn effective_permissions(&self, principal: &Principal) -> Result<AccessProfile, AuthzError> {
        self.store
            .access_profile(principal.user_id)
            .await
            .map_err(|err| {
                error!(user = %principal.public_id, error = %err, "failed to resolve permissions");
                AuthzError::from(err)
            })
    }

    /// # Errors
    /// Returns `AuthzError::Forbidden` unless the principal is superadmin or
    /// holds `permission` through a role or a direct grant.
    pub async fn check_permission(&self, principal: &Principal, permission: &str) -> Result<(), AuthzError> {
        let profile = self.effective_permissions(principal).await?;
        if profile.is_superadmin || profile.permissions.contains(permission) {
            return Ok(());
        }
        debug!(user = %principal.public_id, permission, "permission denied");
        Err(AuthzError::Forbidden)
    }

    /// # Errors
    /// Returns `AuthzError::Forbidden` unless the principal is superadmin, or
    /// holds `permission` and is a member of `project`.
    pub async fn check_project_access(
        &self,
        principal: &Principal,
        permission: &str,
        project: &str,
    ) -> Result<(), AuthzError> {
        let profile = self.effective_permissions(principal).await?;
        if profile.is_superadmin {
            return Ok(());
        }

        let has_permission = profile.permissions.contains(permission);
        let is_member = has_permission
            && self
                .store
                .is_project_member(principal.user_id, project)
                .await
                .map_err(|err| {
                    error!(user = %principal.public_id, project, error = %err, "failed to check project membership");
                    AuthzError::from(err)
                })?;

        if is_member {
            return Ok(());
        }
        debug!(user = %principal.public_id, permission, project, "project access denied");
        Err(AuthzError::Forbidden)
    }
}
