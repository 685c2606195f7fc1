use std::sync::Arc;
use tracing::{info, warn};

use super::permissions::{IAM_ASSIGN, IAM_READ};
use super::{is_superadmin_role, Authorizer, IamError, Principal};
use crate::store::{IamStore, Permission, Project, ProjectMember, Role};

/// Maintains the many-to-many mappings behind permission resolution.
///
/// Assigning an existing pair or removing a missing one is a no-op. Every
/// call is checked against `iam:assign` (writes) or `iam:read` (reads).
pub struct IamMapper {
    store: Arc<dyn IamStore>,
    authorizer: Arc<Authorizer>,
}

impl IamMapper {
    #[must_use]
    pub fn new(store: Arc<dyn IamStore>, authorizer: Arc<Authorizer>) -> Self {
        Self { store, authorizer }
    }

    pub async fn assign_user_roles(
        &self,
        actor: &Principal,
        user: &str,
        roles: &[String],
    ) -> Result<(), IamError> {
        self.authorizer.check_permission(actor, IAM_ASSIGN).await?;
        self.store.assign_user_roles(user, roles).await?;
        info!(actor = %actor.public_id, user, roles = roles.len(), "assigned user roles");
        Ok(())
    }

    pub async fn remove_user_roles(
        &self,
        actor: &Principal,
        user: &str,
        roles: &[String],
    ) -> Result<(), IamError> {
        self.authorizer.check_permission(actor, IAM_ASSIGN).await?;
        self.store.remove_user_roles(user, roles).await?;
        info!(actor = %actor.public_id, user, roles = roles.len(), "removed user roles");
        Ok(())
    }

    pub async fn assign_role_permissions(
        &self,
        actor: &Principal,
        role: &str,
        permissions: &[String],
    ) -> Result<(), IamError> {
        self.authorizer.check_permission(actor, IAM_ASSIGN).await?;
        self.store.assign_role_permissions(role, permissions).await?;
        info!(actor = %actor.public_id, role, permissions = permissions.len(), "assigned role permissions");
        Ok(())
    }

    /// # Errors
    /// `IamError::Protected` when `role` is the superadmin role.
    pub async fn remove_role_permissions(
        &self,
        actor: &Principal,
        role: &str,
        permissions: &[String],
    ) -> Result<(), IamError> {
        self.authorizer.check_permission(actor, IAM_ASSIGN).await?;
        let target = self.store.get_role(role).await?;
        if is_superadmin_role(&target.name) {
            warn!(actor = %actor.public_id, role = %target.name, "refused to strip permissions from protected role");
            return Err(IamError::Protected(target.name));
        }
        self.store.remove_role_permissions(role, permissions).await?;
        info!(actor = %actor.public_id, role, permissions = permissions.len(), "removed role permissions");
        Ok(())
    }

    pub async fn assign_user_permissions(
        &self,
        actor: &Principal,
        user: &str,
        permissions: &[String],
    ) -> Result<(), IamError> {
        self.authorizer.check_permission(actor, IAM_ASSIGN).await?;
        self.store.assign_user_permissions(user, permissions).await?;
        Ok(())
    }

    pub async fn remove_user_permissions(
        &self,
        actor: &Principal,
        user: &str,
        permissions: &[String],
    ) -> Result<(), IamError> {
        self.authorizer.check_permission(actor, IAM_ASSIGN).await?;
        self.store.remove_user_permissions(user, permissions).await?;
        Ok(())
    }

    pub async fn add_project_member(
        &self,
        actor: &Principal,
        project: &str,
        user: &str,
        role: &str,
    ) -> Result<(), IamError> {
        self.authorizer.check_permission(actor, IAM_ASSIGN).await?;
        self.store.add_project_member(project, user, role).await?;
        Ok(())
    }

    pub async fn remove_project_member(
        &self,
        actor: &Principal,
        project: &str,
        user: &str,
    ) -> Result<(), IamError> {
        self.authorizer.check_permission(actor, IAM_ASSIGN).await?;
        self.store.remove_project_member(project, user).await?;
        Ok(())
    }

    pub async fn roles_for_user(&self, actor: &Principal, user: &str) -> Result<Vec<Role>, IamError> {
        self.authorizer.check_permission(actor, IAM_READ).await?;
        Ok(self.store.roles_for_user(user).await?)
    }

    pub async fn permissions_for_role(
        &self,
        actor: &Principal,
        role: &str,
    ) -> Result<Vec<Permission>, IamError> {
        self.authorizer.check_permission(actor, IAM_READ).await?;
        Ok(self.store.permissions_for_role(role).await?)
    }

    pub async fn direct_permissions_for_user(
        &self,
        actor: &Principal,
        user: &str,
    ) -> Result<Vec<Permission>, IamError> {
        self.authorizer.check_permission(actor, IAM_READ).await?;
        Ok(self.store.direct_permissions_for_user(user).await?)
    }

    /// Members of `project`. Needs `iam:read` plus membership, unless superadmin.
    pub async fn project_members(
        &self,
        actor: &Principal,
        project: &str,
    ) -> Result<Vec<ProjectMember>, IamError> {
        self.authorizer
            .check_project_access(actor, IAM_READ, project)
            .await?;
        Ok(self.store.project_members(project).await?)
    }

    /// Projects of `user`. Users may always list their own.
    pub async fn projects_for_user(
        &self,
        actor: &Principal,
        user: &str,
    ) -> Result<Vec<Project>, IamError> {
        if actor.public_id != user {
            self.authorizer.check_permission(actor, IAM_READ).await?;
        }
        Ok(self.store.projects_for_user(user).await?)
    }
}
