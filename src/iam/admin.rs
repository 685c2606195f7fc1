//! Administrative services for roles, permissions, OAuth clients and
//! upstream identity providers.

use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use super::permissions::{
    CLIENT_READ, CLIENT_WRITE, IAM_ASSIGN, PERMISSION_READ, PERMISSION_WRITE, PROVIDER_READ,
    PROVIDER_WRITE, ROLE_READ, ROLE_WRITE,
};
use super::{
    is_root_permission, is_superadmin_role, validate_permission_name, validate_role_name,
    Authorizer, IamError, Principal,
};
use crate::crypto::{generate_token, hash_secret, FieldCipher};
use crate::store::{
    ClientStore, GrantStore, IamStore, NewOAuthClient, OAuthClient, OAuthProvider, Permission,
    Role,
};

/// Account state changes.
pub struct UserService {
    store: Arc<dyn IamStore>,
    grants: Arc<dyn GrantStore>,
    authorizer: Arc<Authorizer>,
}

impl UserService {
    #[must_use]
    pub fn new(
        store: Arc<dyn IamStore>,
        grants: Arc<dyn GrantStore>,
        authorizer: Arc<Authorizer>,
    ) -> Self {
        Self {
            store,
            grants,
            authorizer,
        }
    }

    /// Activate or deactivate an account. Deactivation also revokes every
    /// refresh grant the user holds.
    pub async fn set_active(
        &self,
        actor: &Principal,
        public_id: &str,
        active: bool,
    ) -> Result<(), IamError> {
        self.authorizer.check_permission(actor, IAM_ASSIGN).await?;
        if !active && actor.public_id == public_id {
            return Err(IamError::Invalid("cannot deactivate yourself".to_string()));
        }
        self.store.set_user_active(public_id, active).await?;
        if active {
            info!(actor = %actor.public_id, user = public_id, "user activated");
        } else {
            let revoked = self.grants.revoke_grants_for_user(public_id).await?;
            info!(actor = %actor.public_id, user = public_id, revoked, "user deactivated");
        }
        Ok(())
    }
}

pub struct RoleService {
    store: Arc<dyn IamStore>,
    authorizer: Arc<Authorizer>,
}

impl RoleService {
    #[must_use]
    pub fn new(store: Arc<dyn IamStore>, authorizer: Arc<Authorizer>) -> Self {
        Self { store, authorizer }
    }

    pub async fn create(
        &self,
        actor: &Principal,
        name: &str,
        description: Option<&str>,
    ) -> Result<Role, IamError> {
        self.authorizer.check_permission(actor, ROLE_WRITE).await?;
        validate_role_name(name)?;
        let role = self.store.create_role(name, description).await?;
        info!(actor = %actor.public_id, role = %role.name, "role created");
        Ok(role)
    }

    pub async fn get(&self, actor: &Principal, public_id: &str) -> Result<Role, IamError> {
        self.authorizer.check_permission(actor, ROLE_READ).await?;
        Ok(self.store.get_role(public_id).await?)
    }

    pub async fn list(&self, actor: &Principal) -> Result<Vec<Role>, IamError> {
        self.authorizer.check_permission(actor, ROLE_READ).await?;
        Ok(self.store.list_roles().await?)
    }

    /// # Errors
    /// `IamError::Protected` when renaming the superadmin role.
    pub async fn update(
        &self,
        actor: &Principal,
        public_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<Role, IamError> {
        self.authorizer.check_permission(actor, ROLE_WRITE).await?;
        validate_role_name(name)?;
        let current = self.store.get_role(public_id).await?;
        if is_superadmin_role(&current.name) && !is_superadmin_role(name) {
            warn!(actor = %actor.public_id, role = %current.name, "refused to rename protected role");
            return Err(IamError::Protected(current.name));
        }
        Ok(self.store.update_role(public_id, name, description).await?)
    }

    /// # Errors
    /// `IamError::Protected` for the superadmin role, `IamError::InUse` when
    /// any mapping still references the role.
    pub async fn delete(&self, actor: &Principal, public_id: &str) -> Result<(), IamError> {
        self.authorizer.check_permission(actor, ROLE_WRITE).await?;
        let role = self.store.get_role(public_id).await?;
        if is_superadmin_role(&role.name) {
            warn!(actor = %actor.public_id, role = %role.name, "refused to delete protected role");
            return Err(IamError::Protected(role.name));
        }
        self.store.delete_role(public_id).await?;
        info!(actor = %actor.public_id, role = %role.name, "role deleted");
        Ok(())
    }
}

pub struct PermissionService {
    store: Arc<dyn IamStore>,
    authorizer: Arc<Authorizer>,
}

impl PermissionService {
    #[must_use]
    pub fn new(store: Arc<dyn IamStore>, authorizer: Arc<Authorizer>) -> Self {
        Self { store, authorizer }
    }

    pub async fn create(
        &self,
        actor: &Principal,
        name: &str,
        description: Option<&str>,
    ) -> Result<Permission, IamError> {
        self.authorizer.check_permission(actor, PERMISSION_WRITE).await?;
        validate_permission_name(name)?;
        let permission = self.store.create_permission(name, description).await?;
        info!(actor = %actor.public_id, permission = %permission.name, "permission created");
        Ok(permission)
    }

    pub async fn get(&self, actor: &Principal, public_id: &str) -> Result<Permission, IamError> {
        self.authorizer.check_permission(actor, PERMISSION_READ).await?;
        Ok(self.store.get_permission(public_id).await?)
    }

    pub async fn list(&self, actor: &Principal) -> Result<Vec<Permission>, IamError> {
        self.authorizer.check_permission(actor, PERMISSION_READ).await?;
        Ok(self.store.list_permissions().await?)
    }

    pub async fn update(
        &self,
        actor: &Principal,
        public_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<Permission, IamError> {
        self.authorizer.check_permission(actor, PERMISSION_WRITE).await?;
        validate_permission_name(name)?;
        let current = self.store.get_permission(public_id).await?;
        if is_root_permission(&current.name) && !is_root_permission(name) {
            warn!(actor = %actor.public_id, permission = %current.name, "refused to rename protected permission");
            return Err(IamError::Protected(current.name));
        }
        Ok(self.store.update_permission(public_id, name, description).await?)
    }

    /// # Errors
    /// `IamError::Protected` for `root`, `IamError::InUse` when the permission
    /// is still granted to a role or user.
    pub async fn delete(&self, actor: &Principal, public_id: &str) -> Result<(), IamError> {
        self.authorizer.check_permission(actor, PERMISSION_WRITE).await?;
        let permission = self.store.get_permission(public_id).await?;
        if is_root_permission(&permission.name) {
            warn!(actor = %actor.public_id, permission = %permission.name, "refused to delete protected permission");
            return Err(IamError::Protected(permission.name));
        }
        self.store.delete_permission(public_id).await?;
        info!(actor = %actor.public_id, permission = %permission.name, "permission deleted");
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ClientDraft {
    pub client_id: String,
    pub name: String,
    pub confidential: bool,
    pub redirect_uris: Vec<String>,
    pub scopes: Vec<String>,
    pub pkce_required: bool,
    pub is_default: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ClientUpdate {
    pub name: Option<String>,
    pub redirect_uris: Option<Vec<String>>,
    pub scopes: Option<Vec<String>>,
    pub pkce_required: Option<bool>,
}

/// A stored client plus its plaintext secret, which is shown exactly once.
#[derive(Debug)]
pub struct CreatedClient {
    pub client: OAuthClient,
    pub client_secret: Option<SecretString>,
}

fn validate_client_shape(
    confidential: bool,
    pkce_required: bool,
    redirect_uris: &[String],
) -> Result<(), IamError> {
    if !confidential && !pkce_required {
        return Err(IamError::Invalid(
            "public clients must require PKCE".to_string(),
        ));
    }
    if redirect_uris.is_empty() {
        return Err(IamError::Invalid(
            "at least one redirect URI is required".to_string(),
        ));
    }
    for uri in redirect_uris {
        let parsed = Url::parse(uri)
            .map_err(|_| IamError::Invalid(format!("redirect URI is not absolute: {uri}")))?;
        if parsed.fragment().is_some() {
            return Err(IamError::Invalid(format!(
                "redirect URI must not contain a fragment: {uri}"
            )));
        }
    }
    Ok(())
}

fn new_client_secret() -> Result<(SecretString, String), IamError> {
    let secret = generate_token().map_err(IamError::Unexpected)?;
    let hash = hash_secret(&secret).map_err(IamError::Unexpected)?;
    Ok((SecretString::from(secret), hash))
}

pub struct ClientService {
    store: Arc<dyn ClientStore>,
    authorizer: Arc<Authorizer>,
}

impl ClientService {
    #[must_use]
    pub fn new(store: Arc<dyn ClientStore>, authorizer: Arc<Authorizer>) -> Self {
        Self { store, authorizer }
    }

    /// Register a client. Confidential clients get a generated secret.
    ///
    /// # Errors
    /// `IamError::Invalid` for a public client without PKCE or a relative
    /// redirect URI, `IamError::Conflict` for a duplicate `client_id`.
    pub async fn create(&self, actor: &Principal, draft: ClientDraft) -> Result<CreatedClient, IamError> {
        self.authorizer.check_permission(actor, CLIENT_WRITE).await?;
        validate_client_shape(draft.confidential, draft.pkce_required, &draft.redirect_uris)?;
        if draft.client_id.trim().is_empty() {
            return Err(IamError::Invalid("client_id is required".to_string()));
        }

        let (client_secret, client_secret_hash) = if draft.confidential {
            let (secret, hash) = new_client_secret()?;
            (Some(secret), Some(hash))
        } else {
            (None, None)
        };

        let client = self
            .store
            .create_client(NewOAuthClient {
                client_id: draft.client_id,
                name: draft.name,
                confidential: draft.confidential,
                client_secret_hash,
                redirect_uris: draft.redirect_uris,
                scopes: draft.scopes,
                pkce_required: draft.pkce_required,
                is_default: draft.is_default,
            })
            .await?;
        info!(actor = %actor.public_id, client_id = %client.client_id, confidential = client.confidential, "client registered");
        Ok(CreatedClient {
            client,
            client_secret,
        })
    }

    pub async fn get(&self, actor: &Principal, public_id: &str) -> Result<OAuthClient, IamError> {
        self.authorizer.check_permission(actor, CLIENT_READ).await?;
        Ok(self.store.get_client(public_id).await?)
    }

    pub async fn list(&self, actor: &Principal) -> Result<Vec<OAuthClient>, IamError> {
        self.authorizer.check_permission(actor, CLIENT_READ).await?;
        Ok(self.store.list_clients().await?)
    }

    pub async fn update(
        &self,
        actor: &Principal,
        public_id: &str,
        update: ClientUpdate,
    ) -> Result<OAuthClient, IamError> {
        self.authorizer.check_permission(actor, CLIENT_WRITE).await?;
        let mut client = self.store.get_client(public_id).await?;
        if let Some(name) = update.name {
            client.name = name;
        }
        if let Some(redirect_uris) = update.redirect_uris {
            client.redirect_uris = redirect_uris;
        }
        if let Some(scopes) = update.scopes {
            client.scopes = scopes;
        }
        if let Some(pkce_required) = update.pkce_required {
            client.pkce_required = pkce_required;
        }
        validate_client_shape(client.confidential, client.pkce_required, &client.redirect_uris)?;
        Ok(self.store.update_client(client).await?)
    }

    /// # Errors
    /// `IamError::Protected` for the default client.
    pub async fn delete(&self, actor: &Principal, public_id: &str) -> Result<(), IamError> {
        self.authorizer.check_permission(actor, CLIENT_WRITE).await?;
        let client = self.store.get_client(public_id).await?;
        if client.is_default {
            warn!(actor = %actor.public_id, client_id = %client.client_id, "refused to delete default client");
            return Err(IamError::Protected(client.client_id));
        }
        self.store.delete_client(public_id).await?;
        info!(actor = %actor.public_id, client_id = %client.client_id, "client deleted");
        Ok(())
    }

    /// Replace a confidential client's secret and return the new plaintext.
    pub async fn rotate_secret(&self, actor: &Principal, public_id: &str) -> Result<SecretString, IamError> {
        self.authorizer.check_permission(actor, CLIENT_WRITE).await?;
        let mut client = self.store.get_client(public_id).await?;
        if !client.confidential {
            return Err(IamError::Invalid(
                "public clients have no secret".to_string(),
            ));
        }
        let (secret, hash) = new_client_secret()?;
        client.client_secret_hash = Some(hash);
        let client = self.store.update_client(client).await?;
        info!(actor = %actor.public_id, client_id = %client.client_id, "client secret rotated");
        Ok(secret)
    }
}

#[derive(Clone, Debug)]
pub struct ProviderDraft {
    pub name: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub redirect_url: String,
    pub scopes: Vec<String>,
    pub enabled: bool,
}

pub struct ProviderService {
    store: Arc<dyn ClientStore>,
    authorizer: Arc<Authorizer>,
    cipher: FieldCipher,
}

impl ProviderService {
    #[must_use]
    pub fn new(store: Arc<dyn ClientStore>, authorizer: Arc<Authorizer>, cipher: FieldCipher) -> Self {
        Self {
            store,
            authorizer,
            cipher,
        }
    }

    /// Create or replace a provider; the client secret is encrypted with the
    /// provider name as associated data.
    pub async fn upsert(&self, actor: &Principal, draft: ProviderDraft) -> Result<OAuthProvider, IamError> {
        self.authorizer.check_permission(actor, PROVIDER_WRITE).await?;
        if draft.name.is_empty()
            || !draft
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(IamError::Invalid(format!("invalid provider name: {:?}", draft.name)));
        }
        for url in [
            &draft.authorize_url,
            &draft.token_url,
            &draft.userinfo_url,
            &draft.redirect_url,
        ] {
            Url::parse(url).map_err(|_| IamError::Invalid(format!("URL is not absolute: {url}")))?;
        }

        let client_secret_encrypted = self
            .cipher
            .encrypt(
                draft.client_secret.expose_secret().as_bytes(),
                draft.name.as_bytes(),
            )
            .map_err(IamError::Unexpected)?;

        let provider = self
            .store
            .upsert_provider(OAuthProvider {
                name: draft.name,
                client_id: draft.client_id,
                client_secret_encrypted,
                authorize_url: draft.authorize_url,
                token_url: draft.token_url,
                userinfo_url: draft.userinfo_url,
                redirect_url: draft.redirect_url,
                scopes: draft.scopes,
                enabled: draft.enabled,
            })
            .await?;
        info!(actor = %actor.public_id, provider = %provider.name, "provider saved");
        Ok(provider)
    }

    pub async fn get(&self, actor: &Principal, name: &str) -> Result<OAuthProvider, IamError> {
        self.authorizer.check_permission(actor, PROVIDER_READ).await?;
        self.store
            .find_provider(name)
            .await?
            .ok_or_else(|| IamError::NotFound(format!("provider {name}")))
    }

    pub async fn list(&self, actor: &Principal) -> Result<Vec<OAuthProvider>, IamError> {
        self.authorizer.check_permission(actor, PROVIDER_READ).await?;
        Ok(self.store.list_providers().await?)
    }

    pub async fn set_enabled(&self, actor: &Principal, name: &str, enabled: bool) -> Result<(), IamError> {
        self.authorizer.check_permission(actor, PROVIDER_WRITE).await?;
        self.store.set_provider_enabled(name, enabled).await?;
        info!(actor = %actor.public_id, provider = name, enabled, "provider toggled");
        Ok(())
    }

    /// Decrypt a provider's client secret for an upstream token request.
    ///
    /// # Errors
    /// Returns an error if the ciphertext does not belong to this provider.
    pub fn client_secret(&self, provider: &OAuthProvider) -> Result<SecretString, IamError> {
        let plaintext = self
            .cipher
            .decrypt(&provider.client_secret_encrypted, provider.name.as_bytes())
            .map_err(IamError::Unexpected)?;
        let secret = String::from_utf8(plaintext)
            .map_err(|err| IamError::Unexpected(anyhow::Error::new(err)))?;
        Ok(SecretString::from(secret))
    }
}
