//! Role-based access control: principals, permission resolution and the
//! administrative services that maintain roles, permissions, mappings,
//! OAuth clients and upstream providers.

mod admin;
mod authorizer;
mod error;
mod mapper;
mod validation;

pub use admin::{
    ClientDraft, ClientService, ClientUpdate, CreatedClient, PermissionService, ProviderDraft,
    ProviderService, RoleService, UserService,
};
pub use authorizer::{AuthzError, Authorizer};
pub use error::IamError;
pub use mapper::IamMapper;
pub use validation::{validate_permission_name, validate_role_name};
pub(crate) use validation::valid_email;

use crate::store::{IamStore, StoreError, User};
use tracing::info;

/// Role that bypasses every permission and membership check.
pub const SUPERADMIN_ROLE: &str = "superadmin";
/// Permission that can never be deleted.
pub const ROOT_PERMISSION: &str = "root";

/// Permission names guarding the administrative services.
pub mod permissions {
    pub const ROLE_READ: &str = "role:read";
    pub const ROLE_WRITE: &str = "role:write";
    pub const PERMISSION_READ: &str = "permission:read";
    pub const PERMISSION_WRITE: &str = "permission:write";
    pub const IAM_READ: &str = "iam:read";
    pub const IAM_ASSIGN: &str = "iam:assign";
    pub const CLIENT_READ: &str = "client:read";
    pub const CLIENT_WRITE: &str = "client:write";
    pub const PROVIDER_READ: &str = "provider:read";
    pub const PROVIDER_WRITE: &str = "provider:write";
}

/// The authenticated caller of an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub user_id: i64,
    pub public_id: String,
    pub email: String,
}

impl From<&User> for Principal {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id,
            public_id: user.public_id.clone(),
            email: user.email.clone(),
        }
    }
}

pub(crate) fn is_superadmin_role(name: &str) -> bool {
    name.eq_ignore_ascii_case(SUPERADMIN_ROLE)
}

pub(crate) fn is_root_permission(name: &str) -> bool {
    name.eq_ignore_ascii_case(ROOT_PERMISSION)
}

/// Ensure the `superadmin` role and `root` permission exist and are linked.
///
/// Safe to call on every start.
///
/// # Errors
/// Returns an error if the store fails.
pub async fn seed_builtins(store: &dyn IamStore) -> Result<(), StoreError> {
    let role = match store.find_role_by_name(SUPERADMIN_ROLE).await? {
        Some(role) => role,
        None => {
            info!(role = SUPERADMIN_ROLE, "seeding built-in role");
            store
                .create_role(SUPERADMIN_ROLE, Some("Unrestricted access"))
                .await?
        }
    };
    let root = match store.find_permission_by_name(ROOT_PERMISSION).await? {
        Some(permission) => permission,
        None => {
            info!(permission = ROOT_PERMISSION, "seeding built-in permission");
            store
                .create_permission(ROOT_PERMISSION, Some("Built-in root permission"))
                .await?
        }
    };
    store
        .assign_role_permissions(&role.public_id, &[root.public_id])
        .await
}
