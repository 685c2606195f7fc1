//! In-memory implementation of every store capability.
//!
//! All tables live behind one `tokio::sync::RwLock`, so each trait method is
//! atomic with respect to the others. State is lost on restart; multiple
//! processes do not share it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;
use ulid::Ulid;

use super::{
    AccessProfile, ClientStore, CodeOutcome, CodePurpose, CodeStore, GrantStore, IamStore, NewCode,
    NewOAuthClient, NewUser, OAuthClient, OAuthProvider, Permission, Project, ProjectMember,
    RefreshGrant, Role, StoreError, StoreResult, User, UserIdentity,
};
use crate::iam::SUPERADMIN_ROLE;

#[derive(Debug)]
struct StoredCode {
    code: NewCode,
    consumed: bool,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    users: HashMap<i64, User>,
    identities: Vec<UserIdentity>,
    roles: HashMap<i64, Role>,
    permissions: HashMap<i64, Permission>,
    projects: HashMap<i64, Project>,
    user_roles: HashSet<(i64, i64)>,
    role_permissions: HashSet<(i64, i64)>,
    user_permissions: HashSet<(i64, i64)>,
    /// `(project_id, user_id) -> role label`
    project_members: HashMap<(i64, i64), String>,
    clients: HashMap<i64, OAuthClient>,
    providers: BTreeMap<String, OAuthProvider>,
    grants: HashMap<Vec<u8>, RefreshGrant>,
    codes: Vec<StoredCode>,
}

impl State {
    /// Drop grants past their expiry; revoked ones stay until then.
    fn prune_grants(&mut self, now: DateTime<Utc>) {
        self.grants.retain(|_, grant| grant.expires_at > now);
    }

    /// Drop dead codes of `purpose` that no longer count toward its window.
    fn prune_codes(&mut self, purpose: CodePurpose, window_start: DateTime<Utc>, now: DateTime<Utc>) {
        self.codes.retain(|stored| {
            stored.code.purpose != purpose
                || stored.created_at >= window_start
                || !(stored.consumed || stored.code.expires_at <= now)
        });
    }

    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn user_id(&self, public_id: &str) -> StoreResult<i64> {
        self.users
            .values()
            .find(|user| user.public_id == public_id)
            .map(|user| user.id)
            .ok_or_else(|| StoreError::NotFound(format!("user {public_id}")))
    }

    fn role_id(&self, public_id: &str) -> StoreResult<i64> {
        self.roles
            .values()
            .find(|role| role.public_id == public_id)
            .map(|role| role.id)
            .ok_or_else(|| StoreError::NotFound(format!("role {public_id}")))
    }

    fn permission_id(&self, public_id: &str) -> StoreResult<i64> {
        self.permissions
            .values()
            .find(|permission| permission.public_id == public_id)
            .map(|permission| permission.id)
            .ok_or_else(|| StoreError::NotFound(format!("permission {public_id}")))
    }

    fn project_id(&self, public_id: &str) -> StoreResult<i64> {
        self.projects
            .values()
            .find(|project| project.public_id == public_id)
            .map(|project| project.id)
            .ok_or_else(|| StoreError::NotFound(format!("project {public_id}")))
    }

    fn role_ids(&self, public_ids: &[String]) -> StoreResult<Vec<i64>> {
        public_ids.iter().map(|id| self.role_id(id)).collect()
    }

    fn permission_ids(&self, public_ids: &[String]) -> StoreResult<Vec<i64>> {
        public_ids.iter().map(|id| self.permission_id(id)).collect()
    }

    fn role_name_taken(&self, name: &str, except: Option<i64>) -> bool {
        self.roles
            .values()
            .any(|role| Some(role.id) != except && role.name.eq_ignore_ascii_case(name))
    }

    fn permission_name_taken(&self, name: &str, except: Option<i64>) -> bool {
        self.permissions.values().any(|permission| {
            Some(permission.id) != except && permission.name.eq_ignore_ascii_case(name)
        })
    }

    fn client_id_taken(&self, client_id: &str, except: Option<i64>) -> bool {
        self.clients
            .values()
            .any(|client| Some(client.id) != except && client.client_id == client_id)
    }

    fn default_client_taken(&self, except: Option<i64>) -> bool {
        self.clients
            .values()
            .any(|client| Some(client.id) != except && client.is_default)
    }

    fn client_by_public_id(&self, public_id: &str) -> StoreResult<&OAuthClient> {
        self.clients
            .values()
            .find(|client| client.public_id == public_id)
            .ok_or_else(|| StoreError::NotFound(format!("client {public_id}")))
    }
}

fn sorted_by_name<T, F>(mut items: Vec<T>, name: F) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    items.sort_by(|a, b| name(a).cmp(name(b)));
    items
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IamStore for MemoryStore {
    async fn create_user(&self, user: NewUser) -> StoreResult<User> {
        let mut state = self.state.write().await;
        if state
            .users
            .values()
            .any(|existing| existing.email.eq_ignore_ascii_case(&user.email))
        {
            return Err(StoreError::Conflict(format!("email {}", user.email)));
        }
        let id = state.next_id();
        let created = User {
            id,
            public_id: Ulid::new().to_string(),
            email: user.email,
            given_name: user.given_name,
            family_name: user.family_name,
            is_active: true,
            email_verified: user.email_verified,
            created_at: Utc::now(),
        };
        state.users.insert(id, created.clone());
        Ok(created)
    }

    async fn get_user(&self, public_id: &str) -> StoreResult<User> {
        let state = self.state.read().await;
        let id = state.user_id(public_id)?;
        state
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("user {public_id}")))
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let state = self.state.read().await;
        Ok(state
            .users
            .values()
            .find(|user| user.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_user_by_id(&self, user_id: i64) -> StoreResult<Option<User>> {
        Ok(self.state.read().await.users.get(&user_id).cloned())
    }

    async fn set_user_active(&self, public_id: &str, active: bool) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let id = state.user_id(public_id)?;
        if let Some(user) = state.users.get_mut(&id) {
            user.is_active = active;
        }
        Ok(())
    }

    async fn set_email_verified(&self, user_id: i64) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user #{user_id}")))?;
        user.email_verified = true;
        Ok(())
    }

    async fn find_identity(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> StoreResult<Option<UserIdentity>> {
        let state = self.state.read().await;
        Ok(state
            .identities
            .iter()
            .find(|identity| {
                identity.provider == provider && identity.provider_user_id == provider_user_id
            })
            .cloned())
    }

    async fn upsert_identity(&self, identity: UserIdentity) -> StoreResult<UserIdentity> {
        let mut state = self.state.write().await;
        if !state.users.contains_key(&identity.user_id) {
            return Err(StoreError::NotFound(format!("user #{}", identity.user_id)));
        }
        if let Some(existing) = state.identities.iter_mut().find(|existing| {
            existing.provider == identity.provider
                && existing.provider_user_id == identity.provider_user_id
        }) {
            existing.last_login_at = identity.last_login_at;
            return Ok(existing.clone());
        }
        state.identities.push(identity.clone());
        Ok(identity)
    }

    async fn create_role(&self, name: &str, description: Option<&str>) -> StoreResult<Role> {
        let mut state = self.state.write().await;
        if state.role_name_taken(name, None) {
            return Err(StoreError::Conflict(format!("role {name}")));
        }
        let id = state.next_id();
        let role = Role {
            id,
            public_id: Ulid::new().to_string(),
            name: name.to_string(),
            description: description.map(ToString::to_string),
        };
        state.roles.insert(id, role.clone());
        Ok(role)
    }

    async fn get_role(&self, public_id: &str) -> StoreResult<Role> {
        let state = self.state.read().await;
        let id = state.role_id(public_id)?;
        state
            .roles
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("role {public_id}")))
    }

    async fn find_role_by_name(&self, name: &str) -> StoreResult<Option<Role>> {
        let state = self.state.read().await;
        Ok(state
            .roles
            .values()
            .find(|role| role.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn list_roles(&self) -> StoreResult<Vec<Role>> {
        let state = self.state.read().await;
        Ok(sorted_by_name(
            state.roles.values().cloned().collect(),
            |role| role.name.as_str(),
        ))
    }

    async fn update_role(
        &self,
        public_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> StoreResult<Role> {
        let mut state = self.state.write().await;
        let id = state.role_id(public_id)?;
        if state.role_name_taken(name, Some(id)) {
            return Err(StoreError::Conflict(format!("role {name}")));
        }
        let role = state
            .roles
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("role {public_id}")))?;
        role.name = name.to_string();
        role.description = description.map(ToString::to_string);
        Ok(role.clone())
    }

    async fn delete_role(&self, public_id: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let id = state.role_id(public_id)?;
        let in_use = state.user_roles.iter().any(|(_, role)| *role == id)
            || state.role_permissions.iter().any(|(role, _)| *role == id);
        if in_use {
            return Err(StoreError::InUse(format!("role {public_id}")));
        }
        state.roles.remove(&id);
        Ok(())
    }

    async fn create_permission(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> StoreResult<Permission> {
        let mut state = self.state.write().await;
        if state.permission_name_taken(name, None) {
            return Err(StoreError::Conflict(format!("permission {name}")));
        }
        let id = state.next_id();
        let permission = Permission {
            id,
            public_id: Ulid::new().to_string(),
            name: name.to_string(),
            description: description.map(ToString::to_string),
        };
        state.permissions.insert(id, permission.clone());
        Ok(permission)
    }

    async fn get_permission(&self, public_id: &str) -> StoreResult<Permission> {
        let state = self.state.read().await;
        let id = state.permission_id(public_id)?;
        state
            .permissions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("permission {public_id}")))
    }

    async fn find_permission_by_name(&self, name: &str) -> StoreResult<Option<Permission>> {
        let state = self.state.read().await;
        Ok(state
            .permissions
            .values()
            .find(|permission| permission.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn list_permissions(&self) -> StoreResult<Vec<Permission>> {
        let state = self.state.read().await;
        Ok(sorted_by_name(
            state.permissions.values().cloned().collect(),
            |permission| permission.name.as_str(),
        ))
    }

    async fn update_permission(
        &self,
        public_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> StoreResult<Permission> {
        let mut state = self.state.write().await;
        let id = state.permission_id(public_id)?;
        if state.permission_name_taken(name, Some(id)) {
            return Err(StoreError::Conflict(format!("permission {name}")));
        }
        let permission = state
            .permissions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("permission {public_id}")))?;
        permission.name = name.to_string();
        permission.description = description.map(ToString::to_string);
        Ok(permission.clone())
    }

    async fn delete_permission(&self, public_id: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let id = state.permission_id(public_id)?;
        let in_use = state.role_permissions.iter().any(|(_, p)| *p == id)
            || state.user_permissions.iter().any(|(_, p)| *p == id);
        if in_use {
            return Err(StoreError::InUse(format!("permission {public_id}")));
        }
        state.permissions.remove(&id);
        Ok(())
    }

    async fn create_project(&self, name: &str) -> StoreResult<Project> {
        let mut state = self.state.write().await;
        let id = state.next_id();
        let project = Project {
            id,
            public_id: Ulid::new().to_string(),
            name: name.to_string(),
        };
        state.projects.insert(id, project.clone());
        Ok(project)
    }

    async fn assign_user_roles(&self, user: &str, roles: &[String]) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let user_id = state.user_id(user)?;
        let role_ids = state.role_ids(roles)?;
        state
            .user_roles
            .extend(role_ids.into_iter().map(|role_id| (user_id, role_id)));
        Ok(())
    }

    async fn remove_user_roles(&self, user: &str, roles: &[String]) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let user_id = state.user_id(user)?;
        for role_id in state.role_ids(roles)? {
            state.user_roles.remove(&(user_id, role_id));
        }
        Ok(())
    }

    async fn assign_role_permissions(&self, role: &str, permissions: &[String]) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let role_id = state.role_id(role)?;
        let permission_ids = state.permission_ids(permissions)?;
        state
            .role_permissions
            .extend(permission_ids.into_iter().map(|p| (role_id, p)));
        Ok(())
    }

    async fn remove_role_permissions(&self, role: &str, permissions: &[String]) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let role_id = state.role_id(role)?;
        for permission_id in state.permission_ids(permissions)? {
            state.role_permissions.remove(&(role_id, permission_id));
        }
        Ok(())
    }

    async fn assign_user_permissions(&self, user: &str, permissions: &[String]) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let user_id = state.user_id(user)?;
        let permission_ids = state.permission_ids(permissions)?;
        state
            .user_permissions
            .extend(permission_ids.into_iter().map(|p| (user_id, p)));
        Ok(())
    }

    async fn remove_user_permissions(&self, user: &str, permissions: &[String]) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let user_id = state.user_id(user)?;
        for permission_id in state.permission_ids(permissions)? {
            state.user_permissions.remove(&(user_id, permission_id));
        }
        Ok(())
    }

    async fn add_project_member(&self, project: &str, user: &str, role: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let project_id = state.project_id(project)?;
        let user_id = state.user_id(user)?;
        state
            .project_members
            .entry((project_id, user_id))
            .or_insert_with(|| role.to_string());
        Ok(())
    }

    async fn remove_project_member(&self, project: &str, user: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let project_id = state.project_id(project)?;
        let user_id = state.user_id(user)?;
        state.project_members.remove(&(project_id, user_id));
        Ok(())
    }

    async fn roles_for_user(&self, user: &str) -> StoreResult<Vec<Role>> {
        let state = self.state.read().await;
        let user_id = state.user_id(user)?;
        let roles = state
            .user_roles
            .iter()
            .filter(|(u, _)| *u == user_id)
            .filter_map(|(_, role_id)| state.roles.get(role_id).cloned())
            .collect();
        Ok(sorted_by_name(roles, |role| role.name.as_str()))
    }

    async fn permissions_for_role(&self, role: &str) -> StoreResult<Vec<Permission>> {
        let state = self.state.read().await;
        let role_id = state.role_id(role)?;
        let permissions = state
            .role_permissions
            .iter()
            .filter(|(r, _)| *r == role_id)
            .filter_map(|(_, p)| state.permissions.get(p).cloned())
            .collect();
        Ok(sorted_by_name(permissions, |p| p.name.as_str()))
    }

    async fn direct_permissions_for_user(&self, user: &str) -> StoreResult<Vec<Permission>> {
        let state = self.state.read().await;
        let user_id = state.user_id(user)?;
        let permissions = state
            .user_permissions
            .iter()
            .filter(|(u, _)| *u == user_id)
            .filter_map(|(_, p)| state.permissions.get(p).cloned())
            .collect();
        Ok(sorted_by_name(permissions, |p| p.name.as_str()))
    }

    async fn project_members(&self, project: &str) -> StoreResult<Vec<ProjectMember>> {
        let state = self.state.read().await;
        let project_id = state.project_id(project)?;
        let mut members: Vec<ProjectMember> = state
            .project_members
            .iter()
            .filter(|((p, _), _)| *p == project_id)
            .filter_map(|((_, user_id), role)| {
                state.users.get(user_id).map(|user| ProjectMember {
                    project_public_id: project.to_string(),
                    user_public_id: user.public_id.clone(),
                    role: role.clone(),
                })
            })
            .collect();
        members.sort_by(|a, b| a.user_public_id.cmp(&b.user_public_id));
        Ok(members)
    }

    async fn projects_for_user(&self, user: &str) -> StoreResult<Vec<Project>> {
        let state = self.state.read().await;
        let user_id = state.user_id(user)?;
        let projects = state
            .project_members
            .keys()
            .filter(|(_, u)| *u == user_id)
            .filter_map(|(project_id, _)| state.projects.get(project_id).cloned())
            .collect();
        Ok(sorted_by_name(projects, |project| project.name.as_str()))
    }

    async fn access_profile(&self, user_id: i64) -> StoreResult<AccessProfile> {
        let state = self.state.read().await;
        let role_ids: Vec<i64> = state
            .user_roles
            .iter()
            .filter(|(u, _)| *u == user_id)
            .map(|(_, role_id)| *role_id)
            .collect();

        let is_superadmin = role_ids.iter().any(|role_id| {
            state
                .roles
                .get(role_id)
                .is_some_and(|role| role.name.eq_ignore_ascii_case(SUPERADMIN_ROLE))
        });

        let via_roles = state
            .role_permissions
            .iter()
            .filter(|(role_id, _)| role_ids.contains(role_id))
            .map(|(_, p)| *p);
        let direct = state
            .user_permissions
            .iter()
            .filter(|(u, _)| *u == user_id)
            .map(|(_, p)| *p);
        let permissions = via_roles
            .chain(direct)
            .filter_map(|p| state.permissions.get(&p).map(|perm| perm.name.clone()))
            .collect();

        Ok(AccessProfile {
            is_superadmin,
            permissions,
        })
    }

    async fn is_project_member(&self, user_id: i64, project: &str) -> StoreResult<bool> {
        let state = self.state.read().await;
        let Ok(project_id) = state.project_id(project) else {
            return Ok(false);
        };
        Ok(state.project_members.contains_key(&(project_id, user_id)))
    }
}

#[async_trait]
impl ClientStore for MemoryStore {
    async fn create_client(&self, client: NewOAuthClient) -> StoreResult<OAuthClient> {
        let mut state = self.state.write().await;
        if state.client_id_taken(&client.client_id, None) {
            return Err(StoreError::Conflict(format!("client {}", client.client_id)));
        }
        if client.is_default && state.default_client_taken(None) {
            return Err(StoreError::Conflict("default client already exists".to_string()));
        }
        let id = state.next_id();
        let created = OAuthClient {
            id,
            public_id: Ulid::new().to_string(),
            client_id: client.client_id,
            name: client.name,
            confidential: client.confidential,
            client_secret_hash: client.client_secret_hash,
            redirect_uris: client.redirect_uris,
            scopes: client.scopes,
            pkce_required: client.pkce_required,
            is_default: client.is_default,
        };
        state.clients.insert(id, created.clone());
        Ok(created)
    }

    async fn find_client(&self, client_id: &str) -> StoreResult<Option<OAuthClient>> {
        let state = self.state.read().await;
        Ok(state
            .clients
            .values()
            .find(|client| client.client_id == client_id)
            .cloned())
    }

    async fn get_client(&self, public_id: &str) -> StoreResult<OAuthClient> {
        let state = self.state.read().await;
        state.client_by_public_id(public_id).cloned()
    }

    async fn list_clients(&self) -> StoreResult<Vec<OAuthClient>> {
        let state = self.state.read().await;
        let mut clients: Vec<OAuthClient> = state.clients.values().cloned().collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        Ok(clients)
    }

    async fn update_client(&self, client: OAuthClient) -> StoreResult<OAuthClient> {
        let mut state = self.state.write().await;
        let id = state.client_by_public_id(&client.public_id)?.id;
        if state.client_id_taken(&client.client_id, Some(id)) {
            return Err(StoreError::Conflict(format!("client {}", client.client_id)));
        }
        if client.is_default && state.default_client_taken(Some(id)) {
            return Err(StoreError::Conflict("default client already exists".to_string()));
        }
        let updated = OAuthClient { id, ..client };
        state.clients.insert(id, updated.clone());
        Ok(updated)
    }

    async fn delete_client(&self, public_id: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let id = state.client_by_public_id(public_id)?.id;
        state.clients.remove(&id);
        Ok(())
    }

    async fn upsert_provider(&self, provider: OAuthProvider) -> StoreResult<OAuthProvider> {
        let mut state = self.state.write().await;
        state
            .providers
            .insert(provider.name.clone(), provider.clone());
        Ok(provider)
    }

    async fn find_provider(&self, name: &str) -> StoreResult<Option<OAuthProvider>> {
        let state = self.state.read().await;
        Ok(state.providers.get(name).cloned())
    }

    async fn list_providers(&self) -> StoreResult<Vec<OAuthProvider>> {
        let state = self.state.read().await;
        Ok(state.providers.values().cloned().collect())
    }

    async fn set_provider_enabled(&self, name: &str, enabled: bool) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let provider = state
            .providers
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("provider {name}")))?;
        provider.enabled = enabled;
        Ok(())
    }
}

#[async_trait]
impl GrantStore for MemoryStore {
    async fn insert_refresh_grant(&self, grant: RefreshGrant) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.prune_grants(Utc::now());
        if state.grants.contains_key(&grant.token_hash) {
            return Err(StoreError::Conflict("refresh grant".to_string()));
        }
        state.grants.insert(grant.token_hash.clone(), grant);
        Ok(())
    }

    async fn find_refresh_grant(&self, token_hash: &[u8]) -> StoreResult<Option<RefreshGrant>> {
        let state = self.state.read().await;
        Ok(state.grants.get(token_hash).cloned())
    }

    async fn rotate_refresh_grant(&self, old_hash: &[u8], next: RefreshGrant) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        match state.grants.get_mut(old_hash) {
            Some(old) if !old.revoked => old.revoked = true,
            _ => return Ok(false),
        }
        state.prune_grants(Utc::now());
        state.grants.insert(next.token_hash.clone(), next);
        Ok(true)
    }

    async fn revoke_refresh_grant(&self, token_hash: &[u8]) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        match state.grants.get_mut(token_hash) {
            Some(grant) if !grant.revoked => {
                grant.revoked = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_grants_for_user(&self, user_public_id: &str) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let mut revoked = 0;
        for grant in state
            .grants
            .values_mut()
            .filter(|grant| grant.user_public_id == user_public_id && !grant.revoked)
        {
            grant.revoked = true;
            revoked += 1;
        }
        Ok(revoked)
    }
}

#[async_trait]
impl CodeStore for MemoryStore {
    async fn insert_code_within_limit(
        &self,
        code: NewCode,
        window_start: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        state.prune_codes(code.purpose, window_start, Utc::now());
        let issued = state
            .codes
            .iter()
            .filter(|stored| {
                stored.code.user_id == code.user_id
                    && stored.code.purpose == code.purpose
                    && stored.created_at >= window_start
            })
            .count();
        if issued >= usize::try_from(limit).unwrap_or(usize::MAX) {
            return Ok(false);
        }
        for stored in state.codes.iter_mut().filter(|stored| {
            stored.code.user_id == code.user_id && stored.code.purpose == code.purpose
        }) {
            stored.consumed = true;
        }
        state.codes.push(StoredCode {
            code,
            consumed: false,
            created_at: Utc::now(),
        });
        Ok(true)
    }

    async fn consume_code(
        &self,
        purpose: CodePurpose,
        code_hash: &[u8],
        user_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> StoreResult<CodeOutcome> {
        let mut state = self.state.write().await;
        let Some(stored) = state.codes.iter_mut().find(|stored| {
            !stored.consumed
                && stored.code.purpose == purpose
                && stored.code.code_hash == code_hash
                && user_id.is_none_or(|id| stored.code.user_id == id)
        }) else {
            return Ok(CodeOutcome::NotFound);
        };
        stored.consumed = true;
        if stored.code.expires_at <= now {
            return Ok(CodeOutcome::Expired);
        }
        Ok(CodeOutcome::Consumed {
            user_id: stored.code.user_id,
        })
    }
}
