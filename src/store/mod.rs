//! Storage capabilities behind the IAM, OAuth and one-time-code services.
//!
//! Each trait is a narrow capability set so services depend only on what
//! they use. [`MemoryStore`] backs tests and single-node development;
//! [`PgStore`] is the durable PostgreSQL backend.

pub mod memory;
pub mod model;
pub mod postgres;

pub use memory::MemoryStore;
pub use model::{
    AccessProfile, CodeOutcome, CodePurpose, NewCode, NewOAuthClient, NewUser, OAuthClient,
    OAuthProvider, Permission, Project, ProjectMember, RefreshGrant, Role, User, UserIdentity,
};
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// The entity is still referenced by a mapping.
    #[error("in use: {0}")]
    InUse(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Users, roles, permissions, projects and the mappings between them.
#[async_trait]
pub trait IamStore: Send + Sync {
    async fn create_user(&self, user: NewUser) -> StoreResult<User>;
    async fn get_user(&self, public_id: &str) -> StoreResult<User>;
    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    async fn find_user_by_id(&self, user_id: i64) -> StoreResult<Option<User>>;
    async fn set_user_active(&self, public_id: &str, active: bool) -> StoreResult<()>;
    async fn set_email_verified(&self, user_id: i64) -> StoreResult<()>;

    async fn find_identity(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> StoreResult<Option<UserIdentity>>;
    /// Insert the identity or bump `last_login_at` when it already exists.
    async fn upsert_identity(&self, identity: UserIdentity) -> StoreResult<UserIdentity>;

    async fn create_role(&self, name: &str, description: Option<&str>) -> StoreResult<Role>;
    async fn get_role(&self, public_id: &str) -> StoreResult<Role>;
    async fn find_role_by_name(&self, name: &str) -> StoreResult<Option<Role>>;
    async fn list_roles(&self) -> StoreResult<Vec<Role>>;
    async fn update_role(
        &self,
        public_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> StoreResult<Role>;
    async fn delete_role(&self, public_id: &str) -> StoreResult<()>;

    async fn create_permission(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> StoreResult<Permission>;
    async fn get_permission(&self, public_id: &str) -> StoreResult<Permission>;
    async fn find_permission_by_name(&self, name: &str) -> StoreResult<Option<Permission>>;
    async fn list_permissions(&self) -> StoreResult<Vec<Permission>>;
    async fn update_permission(
        &self,
        public_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> StoreResult<Permission>;
    async fn delete_permission(&self, public_id: &str) -> StoreResult<()>;

    async fn create_project(&self, name: &str) -> StoreResult<Project>;

    async fn assign_user_roles(&self, user: &str, roles: &[String]) -> StoreResult<()>;
    async fn remove_user_roles(&self, user: &str, roles: &[String]) -> StoreResult<()>;
    async fn assign_role_permissions(&self, role: &str, permissions: &[String]) -> StoreResult<()>;
    async fn remove_role_permissions(&self, role: &str, permissions: &[String]) -> StoreResult<()>;
    async fn assign_user_permissions(&self, user: &str, permissions: &[String]) -> StoreResult<()>;
    async fn remove_user_permissions(&self, user: &str, permissions: &[String]) -> StoreResult<()>;
    async fn add_project_member(&self, project: &str, user: &str, role: &str) -> StoreResult<()>;
    async fn remove_project_member(&self, project: &str, user: &str) -> StoreResult<()>;

    async fn roles_for_user(&self, user: &str) -> StoreResult<Vec<Role>>;
    async fn permissions_for_role(&self, role: &str) -> StoreResult<Vec<Permission>>;
    async fn direct_permissions_for_user(&self, user: &str) -> StoreResult<Vec<Permission>>;
    async fn project_members(&self, project: &str) -> StoreResult<Vec<ProjectMember>>;
    async fn projects_for_user(&self, user: &str) -> StoreResult<Vec<Project>>;

    /// Superadmin flag plus the union of role and direct permissions.
    async fn access_profile(&self, user_id: i64) -> StoreResult<AccessProfile>;
    async fn is_project_member(&self, user_id: i64, project: &str) -> StoreResult<bool>;
}

/// Registered OAuth clients and upstream identity providers.
#[async_trait]
pub trait ClientStore: Send + Sync {
    async fn create_client(&self, client: NewOAuthClient) -> StoreResult<OAuthClient>;
    async fn find_client(&self, client_id: &str) -> StoreResult<Option<OAuthClient>>;
    async fn get_client(&self, public_id: &str) -> StoreResult<OAuthClient>;
    async fn list_clients(&self) -> StoreResult<Vec<OAuthClient>>;
    async fn update_client(&self, client: OAuthClient) -> StoreResult<OAuthClient>;
    async fn delete_client(&self, public_id: &str) -> StoreResult<()>;

    async fn upsert_provider(&self, provider: OAuthProvider) -> StoreResult<OAuthProvider>;
    async fn find_provider(&self, name: &str) -> StoreResult<Option<OAuthProvider>>;
    async fn list_providers(&self) -> StoreResult<Vec<OAuthProvider>>;
    async fn set_provider_enabled(&self, name: &str, enabled: bool) -> StoreResult<()>;
}

/// Hashed refresh tokens.
#[async_trait]
pub trait GrantStore: Send + Sync {
    async fn insert_refresh_grant(&self, grant: RefreshGrant) -> StoreResult<()>;
    async fn find_refresh_grant(&self, token_hash: &[u8]) -> StoreResult<Option<RefreshGrant>>;
    /// Revoke `old_hash` and store `next` atomically. Returns `false` when the
    /// old grant was already revoked or missing.
    async fn rotate_refresh_grant(&self, old_hash: &[u8], next: RefreshGrant) -> StoreResult<bool>;
    async fn revoke_refresh_grant(&self, token_hash: &[u8]) -> StoreResult<bool>;
    async fn revoke_grants_for_user(&self, user_public_id: &str) -> StoreResult<u64>;
}

/// Hashed one-time codes.
#[async_trait]
pub trait CodeStore: Send + Sync {
    /// Insert `code` unless `limit` codes were already issued for the same
    /// user and purpose since `window_start`. Older unconsumed codes for the
    /// pair are invalidated. Returns `false` when the limit was hit.
    async fn insert_code_within_limit(
        &self,
        code: NewCode,
        window_start: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<bool>;
    /// Consume a live code matching `code_hash`, optionally scoped to a user.
    async fn consume_code(
        &self,
        purpose: CodePurpose,
        code_hash: &[u8],
        user_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> StoreResult<CodeOutcome>;
}
