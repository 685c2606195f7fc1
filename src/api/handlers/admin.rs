//! Administrative endpoints. Every handler resolves the caller first; the
//! services enforce the permission checks.

use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use super::require_principal;
use crate::api::error::ApiError;
use crate::app::Services;
use crate::iam::{ClientDraft, ClientUpdate, ProviderDraft};
use crate::store::{
    OAuthClient, OAuthProvider, Permission, Project, ProjectMember, Role,
};

type AdminResult<T> = Result<T, ApiError>;

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RoleBody {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

impl From<Role> for RoleBody {
    fn from(role: Role) -> Self {
        Self {
            id: role.public_id,
            name: role.name,
            description: role.description,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PermissionBody {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

impl From<Permission> for PermissionBody {
    fn from(permission: Permission) -> Self {
        Self {
            id: permission.public_id,
            name: permission.name,
            description: permission.description,
        }
    }
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct NamedRequest {
    pub name: String,
    pub description: Option<String>,
}

/// Public IDs of roles or permissions to add or remove.
#[derive(ToSchema, Deserialize, Debug)]
pub struct IdsRequest {
    pub ids: Vec<String>,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct MemberRequest {
    pub role: String,
}

#[derive(ToSchema, Serialize, Debug)]
pub struct MemberBody {
    pub project_id: String,
    pub user_id: String,
    pub role: String,
}

impl From<ProjectMember> for MemberBody {
    fn from(member: ProjectMember) -> Self {
        Self {
            project_id: member.project_public_id,
            user_id: member.user_public_id,
            role: member.role,
        }
    }
}

#[derive(ToSchema, Serialize, Debug)]
pub struct ProjectBody {
    pub id: String,
    pub name: String,
}

impl From<Project> for ProjectBody {
    fn from(project: Project) -> Self {
        Self {
            id: project.public_id,
            name: project.name,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ClientBody {
    pub id: String,
    pub client_id: String,
    pub name: String,
    pub confidential: bool,
    pub redirect_uris: Vec<String>,
    pub scopes: Vec<String>,
    pub pkce_required: bool,
    pub is_default: bool,
    /// Present only in the response that created or rotated it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

impl From<OAuthClient> for ClientBody {
    fn from(client: OAuthClient) -> Self {
        Self {
            id: client.public_id,
            client_id: client.client_id,
            name: client.name,
            confidential: client.confidential,
            redirect_uris: client.redirect_uris,
            scopes: client.scopes,
            pkce_required: client.pkce_required,
            is_default: client.is_default,
            client_secret: None,
        }
    }
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct ClientCreateRequest {
    pub client_id: String,
    pub name: String,
    #[serde(default)]
    pub confidential: bool,
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_true")]
    pub pkce_required: bool,
}

const fn default_true() -> bool {
    true
}

#[derive(ToSchema, Deserialize, Debug, Default)]
pub struct ClientUpdateRequest {
    pub name: Option<String>,
    pub redirect_uris: Option<Vec<String>>,
    pub scopes: Option<Vec<String>>,
    pub pkce_required: Option<bool>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SecretBody {
    pub client_secret: String,
}

/// Providers are returned without their client secret.
#[derive(ToSchema, Serialize, Debug)]
pub struct ProviderBody {
    pub name: String,
    pub client_id: String,
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub redirect_url: String,
    pub scopes: Vec<String>,
    pub enabled: bool,
}

impl From<OAuthProvider> for ProviderBody {
    fn from(provider: OAuthProvider) -> Self {
        Self {
            name: provider.name,
            client_id: provider.client_id,
            authorize_url: provider.authorize_url,
            token_url: provider.token_url,
            userinfo_url: provider.userinfo_url,
            redirect_url: provider.redirect_url,
            scopes: provider.scopes,
            enabled: provider.enabled,
        }
    }
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct ProviderRequest {
    pub client_id: String,
    pub client_secret: String,
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub redirect_url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct EnabledRequest {
    pub enabled: bool,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct ActiveRequest {
    pub active: bool,
}

fn collect<T, B: From<T>>(items: Vec<T>) -> Json<Vec<B>> {
    Json(items.into_iter().map(B::from).collect())
}

// Roles

#[utoipa::path(get, path = "/admin/roles", responses((status = 200, body = [RoleBody]), (status = 403)), tag = "admin")]
pub async fn list_roles(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
) -> AdminResult<Json<Vec<RoleBody>>> {
    let actor = require_principal(&services, &headers).await?;
    Ok(collect(services.roles.list(&actor).await?))
}

#[utoipa::path(
    post,
    path = "/admin/roles",
    request_body = NamedRequest,
    responses((status = 201, body = RoleBody), (status = 400), (status = 403), (status = 409)),
    tag = "admin"
)]
pub async fn create_role(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Json(request): Json<NamedRequest>,
) -> AdminResult<impl IntoResponse> {
    let actor = require_principal(&services, &headers).await?;
    let role = services
        .roles
        .create(&actor, &request.name, request.description.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(RoleBody::from(role))))
}

#[utoipa::path(
    get,
    path = "/admin/roles/{id}",
    params(("id" = String, Path, description = "Role public ID")),
    responses((status = 200, body = RoleBody), (status = 404)),
    tag = "admin"
)]
pub async fn get_role(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(id): Path<String>,
) -> AdminResult<Json<RoleBody>> {
    let actor = require_principal(&services, &headers).await?;
    Ok(Json(services.roles.get(&actor, &id).await?.into()))
}

#[utoipa::path(
    put,
    path = "/admin/roles/{id}",
    params(("id" = String, Path, description = "Role public ID")),
    request_body = NamedRequest,
    responses((status = 200, body = RoleBody), (status = 409, description = "Protected or duplicate name")),
    tag = "admin"
)]
pub async fn update_role(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(id): Path<String>,
    Json(request): Json<NamedRequest>,
) -> AdminResult<Json<RoleBody>> {
    let actor = require_principal(&services, &headers).await?;
    let role = services
        .roles
        .update(&actor, &id, &request.name, request.description.as_deref())
        .await?;
    Ok(Json(role.into()))
}

#[utoipa::path(
    delete,
    path = "/admin/roles/{id}",
    params(("id" = String, Path, description = "Role public ID")),
    responses((status = 204), (status = 409, description = "Protected or still assigned")),
    tag = "admin"
)]
pub async fn delete_role(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(id): Path<String>,
) -> AdminResult<StatusCode> {
    let actor = require_principal(&services, &headers).await?;
    services.roles.delete(&actor, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// Permissions

#[utoipa::path(get, path = "/admin/permissions", responses((status = 200, body = [PermissionBody]), (status = 403)), tag = "admin")]
pub async fn list_permissions(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
) -> AdminResult<Json<Vec<PermissionBody>>> {
    let actor = require_principal(&services, &headers).await?;
    Ok(collect(services.permissions.list(&actor).await?))
}

#[utoipa::path(
    post,
    path = "/admin/permissions",
    request_body = NamedRequest,
    responses((status = 201, body = PermissionBody), (status = 400), (status = 403), (status = 409)),
    tag = "admin"
)]
pub async fn create_permission(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Json(request): Json<NamedRequest>,
) -> AdminResult<impl IntoResponse> {
    let actor = require_principal(&services, &headers).await?;
    let permission = services
        .permissions
        .create(&actor, &request.name, request.description.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(PermissionBody::from(permission))))
}

#[utoipa::path(
    get,
    path = "/admin/permissions/{id}",
    params(("id" = String, Path, description = "Permission public ID")),
    responses((status = 200, body = PermissionBody), (status = 404)),
    tag = "admin"
)]
pub async fn get_permission(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(id): Path<String>,
) -> AdminResult<Json<PermissionBody>> {
    let actor = require_principal(&services, &headers).await?;
    Ok(Json(services.permissions.get(&actor, &id).await?.into()))
}

#[utoipa::path(
    put,
    path = "/admin/permissions/{id}",
    params(("id" = String, Path, description = "Permission public ID")),
    request_body = NamedRequest,
    responses((status = 200, body = PermissionBody), (status = 409)),
    tag = "admin"
)]
pub async fn update_permission(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(id): Path<String>,
    Json(request): Json<NamedRequest>,
) -> AdminResult<Json<PermissionBody>> {
    let actor = require_principal(&services, &headers).await?;
    let permission = services
        .permissions
        .update(&actor, &id, &request.name, request.description.as_deref())
        .await?;
    Ok(Json(permission.into()))
}

#[utoipa::path(
    delete,
    path = "/admin/permissions/{id}",
    params(("id" = String, Path, description = "Permission public ID")),
    responses((status = 204), (status = 409, description = "Protected or still granted")),
    tag = "admin"
)]
pub async fn delete_permission(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(id): Path<String>,
) -> AdminResult<StatusCode> {
    let actor = require_principal(&services, &headers).await?;
    services.permissions.delete(&actor, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// Mappings

#[utoipa::path(
    get,
    path = "/admin/users/{user}/roles",
    params(("user" = String, Path, description = "User public ID")),
    responses((status = 200, body = [RoleBody])),
    tag = "admin"
)]
pub async fn user_roles(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(user): Path<String>,
) -> AdminResult<Json<Vec<RoleBody>>> {
    let actor = require_principal(&services, &headers).await?;
    Ok(collect(services.mapper.roles_for_user(&actor, &user).await?))
}

#[utoipa::path(
    post,
    path = "/admin/users/{user}/roles",
    params(("user" = String, Path, description = "User public ID")),
    request_body = IdsRequest,
    responses((status = 204), (status = 404)),
    tag = "admin"
)]
pub async fn assign_user_roles(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(user): Path<String>,
    Json(request): Json<IdsRequest>,
) -> AdminResult<StatusCode> {
    let actor = require_principal(&services, &headers).await?;
    services
        .mapper
        .assign_user_roles(&actor, &user, &request.ids)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/admin/users/{user}/roles",
    params(("user" = String, Path, description = "User public ID")),
    request_body = IdsRequest,
    responses((status = 204), (status = 404)),
    tag = "admin"
)]
pub async fn remove_user_roles(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(user): Path<String>,
    Json(request): Json<IdsRequest>,
) -> AdminResult<StatusCode> {
    let actor = require_principal(&services, &headers).await?;
    services
        .mapper
        .remove_user_roles(&actor, &user, &request.ids)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/admin/users/{user}/permissions",
    params(("user" = String, Path, description = "User public ID")),
    responses((status = 200, body = [PermissionBody])),
    tag = "admin"
)]
pub async fn user_permissions(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(user): Path<String>,
) -> AdminResult<Json<Vec<PermissionBody>>> {
    let actor = require_principal(&services, &headers).await?;
    Ok(collect(
        services
            .mapper
            .direct_permissions_for_user(&actor, &user)
            .await?,
    ))
}

#[utoipa::path(
    post,
    path = "/admin/users/{user}/permissions",
    params(("user" = String, Path, description = "User public ID")),
    request_body = IdsRequest,
    responses((status = 204), (status = 404)),
    tag = "admin"
)]
pub async fn assign_user_permissions(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(user): Path<String>,
    Json(request): Json<IdsRequest>,
) -> AdminResult<StatusCode> {
    let actor = require_principal(&services, &headers).await?;
    services
        .mapper
        .assign_user_permissions(&actor, &user, &request.ids)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/admin/users/{user}/permissions",
    params(("user" = String, Path, description = "User public ID")),
    request_body = IdsRequest,
    responses((status = 204), (status = 404)),
    tag = "admin"
)]
pub async fn remove_user_permissions(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(user): Path<String>,
    Json(request): Json<IdsRequest>,
) -> AdminResult<StatusCode> {
    let actor = require_principal(&services, &headers).await?;
    services
        .mapper
        .remove_user_permissions(&actor, &user, &request.ids)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/admin/roles/{id}/permissions",
    params(("id" = String, Path, description = "Role public ID")),
    responses((status = 200, body = [PermissionBody])),
    tag = "admin"
)]
pub async fn role_permissions(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(id): Path<String>,
) -> AdminResult<Json<Vec<PermissionBody>>> {
    let actor = require_principal(&services, &headers).await?;
    Ok(collect(services.mapper.permissions_for_role(&actor, &id).await?))
}

#[utoipa::path(
    post,
    path = "/admin/roles/{id}/permissions",
    params(("id" = String, Path, description = "Role public ID")),
    request_body = IdsRequest,
    responses((status = 204), (status = 404)),
    tag = "admin"
)]
pub async fn assign_role_permissions(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(id): Path<String>,
    Json(request): Json<IdsRequest>,
) -> AdminResult<StatusCode> {
    let actor = require_principal(&services, &headers).await?;
    services
        .mapper
        .assign_role_permissions(&actor, &id, &request.ids)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/admin/roles/{id}/permissions",
    params(("id" = String, Path, description = "Role public ID")),
    request_body = IdsRequest,
    responses((status = 204), (status = 409, description = "Role is protected")),
    tag = "admin"
)]
pub async fn remove_role_permissions(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(id): Path<String>,
    Json(request): Json<IdsRequest>,
) -> AdminResult<StatusCode> {
    let actor = require_principal(&services, &headers).await?;
    services
        .mapper
        .remove_role_permissions(&actor, &id, &request.ids)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    put,
    path = "/admin/users/{user}/active",
    params(("user" = String, Path, description = "User public ID")),
    request_body = ActiveRequest,
    responses((status = 204), (status = 400), (status = 403), (status = 404)),
    tag = "admin"
)]
pub async fn set_user_active(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(user): Path<String>,
    Json(request): Json<ActiveRequest>,
) -> AdminResult<StatusCode> {
    let actor = require_principal(&services, &headers).await?;
    services
        .users
        .set_active(&actor, &user, request.active)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// Projects

#[utoipa::path(
    get,
    path = "/admin/users/{user}/projects",
    params(("user" = String, Path, description = "User public ID")),
    responses((status = 200, body = [ProjectBody])),
    tag = "admin"
)]
pub async fn user_projects(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(user): Path<String>,
) -> AdminResult<Json<Vec<ProjectBody>>> {
    let actor = require_principal(&services, &headers).await?;
    Ok(collect(services.mapper.projects_for_user(&actor, &user).await?))
}

#[utoipa::path(
    get,
    path = "/admin/projects/{project}/members",
    params(("project" = String, Path, description = "Project public ID")),
    responses((status = 200, body = [MemberBody]), (status = 403)),
    tag = "admin"
)]
pub async fn project_members(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(project): Path<String>,
) -> AdminResult<Json<Vec<MemberBody>>> {
    let actor = require_principal(&services, &headers).await?;
    Ok(collect(services.mapper.project_members(&actor, &project).await?))
}

#[utoipa::path(
    put,
    path = "/admin/projects/{project}/members/{user}",
    params(
        ("project" = String, Path, description = "Project public ID"),
        ("user" = String, Path, description = "User public ID")
    ),
    request_body = MemberRequest,
    responses((status = 204), (status = 404)),
    tag = "admin"
)]
pub async fn add_project_member(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path((project, user)): Path<(String, String)>,
    Json(request): Json<MemberRequest>,
) -> AdminResult<StatusCode> {
    let actor = require_principal(&services, &headers).await?;
    services
        .mapper
        .add_project_member(&actor, &project, &user, &request.role)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/admin/projects/{project}/members/{user}",
    params(
        ("project" = String, Path, description = "Project public ID"),
        ("user" = String, Path, description = "User public ID")
    ),
    responses((status = 204), (status = 404)),
    tag = "admin"
)]
pub async fn remove_project_member(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path((project, user)): Path<(String, String)>,
) -> AdminResult<StatusCode> {
    let actor = require_principal(&services, &headers).await?;
    services
        .mapper
        .remove_project_member(&actor, &project, &user)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// Clients

#[utoipa::path(get, path = "/admin/clients", responses((status = 200, body = [ClientBody]), (status = 403)), tag = "admin")]
pub async fn list_clients(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
) -> AdminResult<Json<Vec<ClientBody>>> {
    let actor = require_principal(&services, &headers).await?;
    Ok(collect(services.clients.list(&actor).await?))
}

#[utoipa::path(
    post,
    path = "/admin/clients",
    request_body = ClientCreateRequest,
    responses(
        (status = 201, description = "Client registered; a confidential client's secret is shown once", body = ClientBody),
        (status = 400),
        (status = 409)
    ),
    tag = "admin"
)]
pub async fn create_client(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Json(request): Json<ClientCreateRequest>,
) -> AdminResult<impl IntoResponse> {
    let actor = require_principal(&services, &headers).await?;
    let created = services
        .clients
        .create(
            &actor,
            ClientDraft {
                client_id: request.client_id,
                name: request.name,
                confidential: request.confidential,
                redirect_uris: request.redirect_uris,
                scopes: request.scopes,
                pkce_required: request.pkce_required,
                is_default: false,
            },
        )
        .await?;
    let mut body = ClientBody::from(created.client);
    body.client_secret = created
        .client_secret
        .map(|secret| secret.expose_secret().to_string());
    Ok((StatusCode::CREATED, Json(body)))
}

#[utoipa::path(
    get,
    path = "/admin/clients/{id}",
    params(("id" = String, Path, description = "Client public ID")),
    responses((status = 200, body = ClientBody), (status = 404)),
    tag = "admin"
)]
pub async fn get_client(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(id): Path<String>,
) -> AdminResult<Json<ClientBody>> {
    let actor = require_principal(&services, &headers).await?;
    Ok(Json(services.clients.get(&actor, &id).await?.into()))
}

#[utoipa::path(
    patch,
    path = "/admin/clients/{id}",
    params(("id" = String, Path, description = "Client public ID")),
    request_body = ClientUpdateRequest,
    responses((status = 200, body = ClientBody), (status = 400)),
    tag = "admin"
)]
pub async fn update_client(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(id): Path<String>,
    Json(request): Json<ClientUpdateRequest>,
) -> AdminResult<Json<ClientBody>> {
    let actor = require_principal(&services, &headers).await?;
    let update = ClientUpdate {
        name: request.name,
        redirect_uris: request.redirect_uris,
        scopes: request.scopes,
        pkce_required: request.pkce_required,
    };
    Ok(Json(services.clients.update(&actor, &id, update).await?.into()))
}

#[utoipa::path(
    delete,
    path = "/admin/clients/{id}",
    params(("id" = String, Path, description = "Client public ID")),
    responses((status = 204), (status = 409, description = "Default client")),
    tag = "admin"
)]
pub async fn delete_client(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(id): Path<String>,
) -> AdminResult<StatusCode> {
    let actor = require_principal(&services, &headers).await?;
    services.clients.delete(&actor, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/admin/clients/{id}/secret",
    params(("id" = String, Path, description = "Client public ID")),
    responses((status = 200, body = SecretBody), (status = 400, description = "Public client")),
    tag = "admin"
)]
pub async fn rotate_client_secret(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(id): Path<String>,
) -> AdminResult<Json<SecretBody>> {
    let actor = require_principal(&services, &headers).await?;
    let secret = services.clients.rotate_secret(&actor, &id).await?;
    Ok(Json(SecretBody {
        client_secret: secret.expose_secret().to_string(),
    }))
}

// Providers

#[utoipa::path(get, path = "/admin/providers", responses((status = 200, body = [ProviderBody]), (status = 403)), tag = "admin")]
pub async fn list_providers(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
) -> AdminResult<Json<Vec<ProviderBody>>> {
    let actor = require_principal(&services, &headers).await?;
    Ok(collect(services.providers.list(&actor).await?))
}

#[utoipa::path(
    get,
    path = "/admin/providers/{name}",
    params(("name" = String, Path, description = "Provider name")),
    responses((status = 200, body = ProviderBody), (status = 404)),
    tag = "admin"
)]
pub async fn get_provider(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(name): Path<String>,
) -> AdminResult<Json<ProviderBody>> {
    let actor = require_principal(&services, &headers).await?;
    Ok(Json(services.providers.get(&actor, &name).await?.into()))
}

#[utoipa::path(
    put,
    path = "/admin/providers/{name}",
    params(("name" = String, Path, description = "Provider name")),
    request_body = ProviderRequest,
    responses((status = 200, body = ProviderBody), (status = 400)),
    tag = "admin"
)]
pub async fn upsert_provider(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(name): Path<String>,
    Json(request): Json<ProviderRequest>,
) -> AdminResult<Json<ProviderBody>> {
    let actor = require_principal(&services, &headers).await?;
    let draft = ProviderDraft {
        name,
        client_id: request.client_id,
        client_secret: SecretString::from(request.client_secret),
        authorize_url: request.authorize_url,
        token_url: request.token_url,
        userinfo_url: request.userinfo_url,
        redirect_url: request.redirect_url,
        scopes: request.scopes,
        enabled: request.enabled,
    };
    Ok(Json(services.providers.upsert(&actor, draft).await?.into()))
}

#[utoipa::path(
    put,
    path = "/admin/providers/{name}/enabled",
    params(("name" = String, Path, description = "Provider name")),
    request_body = EnabledRequest,
    responses((status = 204), (status = 404)),
    tag = "admin"
)]
pub async fn set_provider_enabled(
    headers: HeaderMap,
    services: Extension<Arc<Services>>,
    Path(name): Path<String>,
    Json(request): Json<EnabledRequest>,
) -> AdminResult<StatusCode> {
    let actor = require_principal(&services, &headers).await?;
    services
        .providers
        .set_enabled(&actor, &name, request.enabled)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
