//! PostgreSQL implementation of the store capabilities.
//!
//! Queries are built at runtime with `sqlx::query` and run inside `db.query`
//! spans. Unique violations (`23505`) surface as `Conflict` and foreign-key
//! violations (`23503`) as `InUse`, so callers never see raw SQL errors.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{info_span, Instrument, Span};
use ulid::Ulid;

use super::{
    AccessProfile, ClientStore, CodeOutcome, CodePurpose, CodeStore, GrantStore, IamStore, NewCode,
    NewOAuthClient, NewUser, OAuthClient, OAuthProvider, Permission, Project, ProjectMember,
    RefreshGrant, Role, StoreError, StoreResult, User, UserIdentity,
};
use crate::iam::SUPERADMIN_ROLE;

const SCHEMA: &str = include_str!("../../sql/schema.sql");

const USER_COLUMNS: &str =
    "id, public_id, email, given_name, family_name, is_active, email_verified, created_at";
const CLIENT_COLUMNS: &str = "id, public_id, client_id, name, confidential, client_secret_hash, \
     redirect_uris, scopes, pkce_required, is_default";
const PROVIDER_COLUMNS: &str = "name, client_id, client_secret_encrypted, authorize_url, \
     token_url, userinfo_url, redirect_url, scopes, enabled";

fn db_span(operation: &'static str) -> Span {
    info_span!("db.query", db.system = "postgresql", db.operation = operation)
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    has_sqlstate(err, "23505")
}

pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    has_sqlstate(err, "23503")
}

fn has_sqlstate(err: &sqlx::Error, sqlstate: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == sqlstate),
        _ => false,
    }
}

fn map_err(err: sqlx::Error, subject: &str) -> StoreError {
    if is_unique_violation(&err) {
        StoreError::Conflict(subject.to_string())
    } else if is_foreign_key_violation(&err) {
        StoreError::InUse(subject.to_string())
    } else {
        StoreError::Unexpected(anyhow::Error::new(err).context(format!("query failed: {subject}")))
    }
}

fn user_from_row(row: &PgRow) -> User {
    User {
        id: row.get("id"),
        public_id: row.get("public_id"),
        email: row.get("email"),
        given_name: row.get("given_name"),
        family_name: row.get("family_name"),
        is_active: row.get("is_active"),
        email_verified: row.get("email_verified"),
        created_at: row.get("created_at"),
    }
}

fn role_from_row(row: &PgRow) -> Role {
    Role {
        id: row.get("id"),
        public_id: row.get("public_id"),
        name: row.get("name"),
        description: row.get("description"),
    }
}

fn permission_from_row(row: &PgRow) -> Permission {
    Permission {
        id: row.get("id"),
        public_id: row.get("public_id"),
        name: row.get("name"),
        description: row.get("description"),
    }
}

fn project_from_row(row: &PgRow) -> Project {
    Project {
        id: row.get("id"),
        public_id: row.get("public_id"),
        name: row.get("name"),
    }
}

fn identity_from_row(row: &PgRow) -> UserIdentity {
    UserIdentity {
        user_id: row.get("user_id"),
        provider: row.get("provider"),
        provider_user_id: row.get("provider_user_id"),
        client_id: row.get("client_id"),
        last_login_at: row.get("last_login_at"),
    }
}

fn client_from_row(row: &PgRow) -> OAuthClient {
    OAuthClient {
        id: row.get("id"),
        public_id: row.get("public_id"),
        client_id: row.get("client_id"),
        name: row.get("name"),
        confidential: row.get("confidential"),
        client_secret_hash: row.get("client_secret_hash"),
        redirect_uris: row.get("redirect_uris"),
        scopes: row.get("scopes"),
        pkce_required: row.get("pkce_required"),
        is_default: row.get("is_default"),
    }
}

fn provider_from_row(row: &PgRow) -> OAuthProvider {
    OAuthProvider {
        name: row.get("name"),
        client_id: row.get("client_id"),
        client_secret_encrypted: row.get("client_secret_encrypted"),
        authorize_url: row.get("authorize_url"),
        token_url: row.get("token_url"),
        userinfo_url: row.get("userinfo_url"),
        redirect_url: row.get("redirect_url"),
        scopes: row.get("scopes"),
        enabled: row.get("enabled"),
    }
}

fn grant_from_row(row: &PgRow) -> RefreshGrant {
    RefreshGrant {
        token_hash: row.get("token_hash"),
        client_id: row.get("client_id"),
        user_public_id: row.get("user_public_id"),
        scope: row.get("scope"),
        expires_at: row.get("expires_at"),
        revoked: row.get("revoked"),
    }
}

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `dsn` and make sure the pool is usable.
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established.
    pub async fn connect(dsn: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .connect(dsn)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool))
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply `sql/schema.sql`; every statement is idempotent.
    ///
    /// # Errors
    /// Returns an error if any statement fails.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .instrument(db_span("DDL"))
            .await
            .context("failed to apply schema")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the database does not answer.
    pub async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .instrument(db_span("SELECT"))
            .await
            .map_err(|err| map_err(err, "health check"))?;
        Ok(())
    }

    async fn id_for(&self, table: &'static str, public_id: &str) -> StoreResult<i64> {
        let query = format!("SELECT id FROM {table} WHERE public_id = $1");
        let row = sqlx::query(&query)
            .bind(public_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT"))
            .await
            .map_err(|err| map_err(err, table))?;
        row.map(|row| row.get::<i64, _>("id"))
            .ok_or_else(|| StoreError::NotFound(format!("{table} {public_id}")))
    }

    /// Resolve every public id or fail with `NotFound` naming the first missing one.
    async fn ids_for(&self, table: &'static str, public_ids: &[String]) -> StoreResult<Vec<i64>> {
        let query = format!("SELECT id, public_id FROM {table} WHERE public_id = ANY($1)");
        let rows = sqlx::query(&query)
            .bind(public_ids)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT"))
            .await
            .map_err(|err| map_err(err, table))?;
        let found: Vec<(i64, String)> = rows
            .iter()
            .map(|row| (row.get("id"), row.get("public_id")))
            .collect();
        for public_id in public_ids {
            if !found.iter().any(|(_, found_id)| found_id == public_id) {
                return Err(StoreError::NotFound(format!("{table} {public_id}")));
            }
        }
        Ok(found.into_iter().map(|(id, _)| id).collect())
    }

    async fn modify_pairs(
        &self,
        query: &'static str,
        operation: &'static str,
        left: i64,
        right: Vec<i64>,
        subject: &str,
    ) -> StoreResult<()> {
        sqlx::query(query)
            .bind(left)
            .bind(right)
            .execute(&self.pool)
            .instrument(db_span(operation))
            .await
            .map_err(|err| map_err(err, subject))?;
        Ok(())
    }
}

#[async_trait]
impl IamStore for PgStore {
    async fn create_user(&self, user: NewUser) -> StoreResult<User> {
        let query = format!(
            "INSERT INTO users (public_id, email, given_name, family_name, email_verified) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {USER_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(Ulid::new().to_string())
            .bind(&user.email)
            .bind(&user.given_name)
            .bind(&user.family_name)
            .bind(user.email_verified)
            .fetch_one(&self.pool)
            .instrument(db_span("INSERT"))
            .await
            .map_err(|err| map_err(err, &format!("email {}", user.email)))?;
        Ok(user_from_row(&row))
    }

    async fn get_user(&self, public_id: &str) -> StoreResult<User> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE public_id = $1");
        let row = sqlx::query(&query)
            .bind(public_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT"))
            .await
            .map_err(|err| map_err(err, "users"))?;
        row.map(|row| user_from_row(&row))
            .ok_or_else(|| StoreError::NotFound(format!("user {public_id}")))
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE lower(email) = lower($1)");
        let row = sqlx::query(&query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT"))
            .await
            .map_err(|err| map_err(err, "users"))?;
        Ok(row.map(|row| user_from_row(&row)))
    }

    async fn find_user_by_id(&self, user_id: i64) -> StoreResult<Option<User>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT"))
            .await
            .map_err(|err| map_err(err, "users"))?;
        Ok(row.map(|row| user_from_row(&row)))
    }

    async fn set_user_active(&self, public_id: &str, active: bool) -> StoreResult<()> {
        let result = sqlx::query("UPDATE users SET is_active = $2 WHERE public_id = $1")
            .bind(public_id)
            .bind(active)
            .execute(&self.pool)
            .instrument(db_span("UPDATE"))
            .await
            .map_err(|err| map_err(err, "users"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {public_id}")));
        }
        Ok(())
    }

    async fn set_email_verified(&self, user_id: i64) -> StoreResult<()> {
        let result = sqlx::query("UPDATE users SET email_verified = TRUE WHERE id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .instrument(db_span("UPDATE"))
            .await
            .map_err(|err| map_err(err, "users"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user #{user_id}")));
        }
        Ok(())
    }

    async fn find_identity(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> StoreResult<Option<UserIdentity>> {
        let row = sqlx::query(
            "SELECT user_id, provider, provider_user_id, client_id, last_login_at \
             FROM user_identities WHERE provider = $1 AND provider_user_id = $2",
        )
        .bind(provider)
        .bind(provider_user_id)
        .fetch_optional(&self.pool)
        .instrument(db_span("SELECT"))
        .await
        .map_err(|err| map_err(err, "user_identities"))?;
        Ok(row.map(|row| identity_from_row(&row)))
    }

    async fn upsert_identity(&self, identity: UserIdentity) -> StoreResult<UserIdentity> {
        let row = sqlx::query(
            "INSERT INTO user_identities (user_id, provider, provider_user_id, client_id, last_login_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (provider, provider_user_id) DO UPDATE SET last_login_at = EXCLUDED.last_login_at \
             RETURNING user_id, provider, provider_user_id, client_id, last_login_at",
        )
        .bind(identity.user_id)
        .bind(&identity.provider)
        .bind(&identity.provider_user_id)
        .bind(&identity.client_id)
        .bind(identity.last_login_at)
        .fetch_one(&self.pool)
        .instrument(db_span("INSERT"))
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                StoreError::NotFound(format!("user #{}", identity.user_id))
            } else {
                map_err(err, "user_identities")
            }
        })?;
        Ok(identity_from_row(&row))
    }

    async fn create_role(&self, name: &str, description: Option<&str>) -> StoreResult<Role> {
        let row = sqlx::query(
            "INSERT INTO roles (public_id, name, description) VALUES ($1, $2, $3) \
             RETURNING id, public_id, name, description",
        )
        .bind(Ulid::new().to_string())
        .bind(name)
        .bind(description)
        .fetch_one(&self.pool)
        .instrument(db_span("INSERT"))
        .await
        .map_err(|err| map_err(err, &format!("role {name}")))?;
        Ok(role_from_row(&row))
    }

    async fn get_role(&self, public_id: &str) -> StoreResult<Role> {
        let row = sqlx::query("SELECT id, public_id, name, description FROM roles WHERE public_id = $1")
            .bind(public_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT"))
            .await
            .map_err(|err| map_err(err, "roles"))?;
        row.map(|row| role_from_row(&row))
            .ok_or_else(|| StoreError::NotFound(format!("role {public_id}")))
    }

    async fn find_role_by_name(&self, name: &str) -> StoreResult<Option<Role>> {
        let row = sqlx::query(
            "SELECT id, public_id, name, description FROM roles WHERE lower(name) = lower($1)",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .instrument(db_span("SELECT"))
        .await
        .map_err(|err| map_err(err, "roles"))?;
        Ok(row.map(|row| role_from_row(&row)))
    }

    async fn list_roles(&self) -> StoreResult<Vec<Role>> {
        let rows = sqlx::query("SELECT id, public_id, name, description FROM roles ORDER BY name")
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT"))
            .await
            .map_err(|err| map_err(err, "roles"))?;
        Ok(rows.iter().map(role_from_row).collect())
    }

    async fn update_role(
        &self,
        public_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> StoreResult<Role> {
        let row = sqlx::query(
            "UPDATE roles SET name = $2, description = $3 WHERE public_id = $1 \
             RETURNING id, public_id, name, description",
        )
        .bind(public_id)
        .bind(name)
        .bind(description)
        .fetch_optional(&self.pool)
        .instrument(db_span("UPDATE"))
        .await
        .map_err(|err| map_err(err, &format!("role {name}")))?;
        row.map(|row| role_from_row(&row))
            .ok_or_else(|| StoreError::NotFound(format!("role {public_id}")))
    }

    async fn delete_role(&self, public_id: &str) -> StoreResult<()> {
        let subject = format!("role {public_id}");
        let result = sqlx::query("DELETE FROM roles WHERE public_id = $1")
            .bind(public_id)
            .execute(&self.pool)
            .instrument(db_span("DELETE"))
            .await
            .map_err(|err| map_err(err, &subject))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(subject));
        }
        Ok(())
    }

    async fn create_permission(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> StoreResult<Permission> {
        let row = sqlx::query(
            "INSERT INTO permissions (public_id, name, description) VALUES ($1, $2, $3) \
             RETURNING id, public_id, name, description",
        )
        .bind(Ulid::new().to_string())
        .bind(name)
        .bind(description)
        .fetch_one(&self.pool)
        .instrument(db_span("INSERT"))
        .await
        .map_err(|err| map_err(err, &format!("permission {name}")))?;
        Ok(permission_from_row(&row))
    }

    async fn get_permission(&self, public_id: &str) -> StoreResult<Permission> {
        let row = sqlx::query(
            "SELECT id, public_id, name, description FROM permissions WHERE public_id = $1",
        )
        .bind(public_id)
        .fetch_optional(&self.pool)
        .instrument(db_span("SELECT"))
        .await
        .map_err(|err| map_err(err, "permissions"))?;
        row.map(|row| permission_from_row(&row))
            .ok_or_else(|| StoreError::NotFound(format!("permission {public_id}")))
    }

    async fn find_permission_by_name(&self, name: &str) -> StoreResult<Option<Permission>> {
        let row = sqlx::query(
            "SELECT id, public_id, name, description FROM permissions WHERE lower(name) = lower($1)",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .instrument(db_span("SELECT"))
        .await
        .map_err(|err| map_err(err, "permissions"))?;
        Ok(row.map(|row| permission_from_row(&row)))
    }

    async fn list_permissions(&self) -> StoreResult<Vec<Permission>> {
        let rows =
            sqlx::query("SELECT id, public_id, name, description FROM permissions ORDER BY name")
                .fetch_all(&self.pool)
                .instrument(db_span("SELECT"))
                .await
                .map_err(|err| map_err(err, "permissions"))?;
        Ok(rows.iter().map(permission_from_row).collect())
    }

    async fn update_permission(
        &self,
        public_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> StoreResult<Permission> {
        let row = sqlx::query(
            "UPDATE permissions SET name = $2, description = $3 WHERE public_id = $1 \
             RETURNING id, public_id, name, description",
        )
        .bind(public_id)
        .bind(name)
        .bind(description)
        .fetch_optional(&self.pool)
        .instrument(db_span("UPDATE"))
        .await
        .map_err(|err| map_err(err, &format!("permission {name}")))?;
        row.map(|row| permission_from_row(&row))
            .ok_or_else(|| StoreError::NotFound(format!("permission {public_id}")))
    }

    async fn delete_permission(&self, public_id: &str) -> StoreResult<()> {
        let subject = format!("permission {public_id}");
        let result = sqlx::query("DELETE FROM permissions WHERE public_id = $1")
            .bind(public_id)
            .execute(&self.pool)
            .instrument(db_span("DELETE"))
            .await
            .map_err(|err| map_err(err, &subject))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(subject));
        }
        Ok(())
    }

    async fn create_project(&self, name: &str) -> StoreResult<Project> {
        let row = sqlx::query(
            "INSERT INTO projects (public_id, name) VALUES ($1, $2) RETURNING id, public_id, name",
        )
        .bind(Ulid::new().to_string())
        .bind(name)
        .fetch_one(&self.pool)
        .instrument(db_span("INSERT"))
        .await
        .map_err(|err| map_err(err, &format!("project {name}")))?;
        Ok(project_from_row(&row))
    }

    async fn assign_user_roles(&self, user: &str, roles: &[String]) -> StoreResult<()> {
        let user_id = self.id_for("users", user).await?;
        let role_ids = self.ids_for("roles", roles).await?;
        self.modify_pairs(
            "INSERT INTO user_roles (user_id, role_id) SELECT $1, UNNEST($2::bigint[]) \
             ON CONFLICT DO NOTHING",
            "INSERT",
            user_id,
            role_ids,
            "user_roles",
        )
        .await
    }

    async fn remove_user_roles(&self, user: &str, roles: &[String]) -> StoreResult<()> {
        let user_id = self.id_for("users", user).await?;
        let role_ids = self.ids_for("roles", roles).await?;
        self.modify_pairs(
            "DELETE FROM user_roles WHERE user_id = $1 AND role_id = ANY($2)",
            "DELETE",
            user_id,
            role_ids,
            "user_roles",
        )
        .await
    }

    async fn assign_role_permissions(&self, role: &str, permissions: &[String]) -> StoreResult<()> {
        let role_id = self.id_for("roles", role).await?;
        let permission_ids = self.ids_for("permissions", permissions).await?;
        self.modify_pairs(
            "INSERT INTO role_permissions (role_id, permission_id) SELECT $1, UNNEST($2::bigint[]) \
             ON CONFLICT DO NOTHING",
            "INSERT",
            role_id,
            permission_ids,
            "role_permissions",
        )
        .await
    }

    async fn remove_role_permissions(&self, role: &str, permissions: &[String]) -> StoreResult<()> {
        let role_id = self.id_for("roles", role).await?;
        let permission_ids = self.ids_for("permissions", permissions).await?;
        self.modify_pairs(
            "DELETE FROM role_permissions WHERE role_id = $1 AND permission_id = ANY($2)",
            "DELETE",
            role_id,
            permission_ids,
            "role_permissions",
        )
        .await
    }

    async fn assign_user_permissions(&self, user: &str, permissions: &[String]) -> StoreResult<()> {
        let user_id = self.id_for("users", user).await?;
        let permission_ids = self.ids_for("permissions", permissions).await?;
        self.modify_pairs(
            "INSERT INTO user_permissions (user_id, permission_id) SELECT $1, UNNEST($2::bigint[]) \
             ON CONFLICT DO NOTHING",
            "INSERT",
            user_id,
            permission_ids,
            "user_permissions",
        )
        .await
    }

    async fn remove_user_permissions(&self, user: &str, permissions: &[String]) -> StoreResult<()> {
        let user_id = self.id_for("users", user).await?;
        let permission_ids = self.ids_for("permissions", permissions).await?;
        self.modify_pairs(
            "DELETE FROM user_permissions WHERE user_id = $1 AND permission_id = ANY($2)",
            "DELETE",
            user_id,
            permission_ids,
            "user_permissions",
        )
        .await
    }

    async fn add_project_member(&self, project: &str, user: &str, role: &str) -> StoreResult<()> {
        let project_id = self.id_for("projects", project).await?;
        let user_id = self.id_for("users", user).await?;
        sqlx::query(
            "INSERT INTO project_members (project_id, user_id, role) VALUES ($1, $2, $3) \
             ON CONFLICT DO NOTHING",
        )
        .bind(project_id)
        .bind(user_id)
        .bind(role)
        .execute(&self.pool)
        .instrument(db_span("INSERT"))
        .await
        .map_err(|err| map_err(err, "project_members"))?;
        Ok(())
    }

    async fn remove_project_member(&self, project: &str, user: &str) -> StoreResult<()> {
        let project_id = self.id_for("projects", project).await?;
        let user_id = self.id_for("users", user).await?;
        sqlx::query("DELETE FROM project_members WHERE project_id = $1 AND user_id = $2")
            .bind(project_id)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(db_span("DELETE"))
            .await
            .map_err(|err| map_err(err, "project_members"))?;
        Ok(())
    }

    async fn roles_for_user(&self, user: &str) -> StoreResult<Vec<Role>> {
        let user_id = self.id_for("users", user).await?;
        let rows = sqlx::query(
            "SELECT r.id, r.public_id, r.name, r.description FROM roles r \
             JOIN user_roles ur ON ur.role_id = r.id WHERE ur.user_id = $1 ORDER BY r.name",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .instrument(db_span("SELECT"))
        .await
        .map_err(|err| map_err(err, "user_roles"))?;
        Ok(rows.iter().map(role_from_row).collect())
    }

    async fn permissions_for_role(&self, role: &str) -> StoreResult<Vec<Permission>> {
        let role_id = self.id_for("roles", role).await?;
        let rows = sqlx::query(
            "SELECT p.id, p.public_id, p.name, p.description FROM permissions p \
             JOIN role_permissions rp ON rp.permission_id = p.id WHERE rp.role_id = $1 ORDER BY p.name",
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .instrument(db_span("SELECT"))
        .await
        .map_err(|err| map_err(err, "role_permissions"))?;
        Ok(rows.iter().map(permission_from_row).collect())
    }

    async fn direct_permissions_for_user(&self, user: &str) -> StoreResult<Vec<Permission>> {
        let user_id = self.id_for("users", user).await?;
        let rows = sqlx::query(
            "SELECT p.id, p.public_id, p.name, p.description FROM permissions p \
             JOIN user_permissions up ON up.permission_id = p.id WHERE up.user_id = $1 ORDER BY p.name",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .instrument(db_span("SELECT"))
        .await
        .map_err(|err| map_err(err, "user_permissions"))?;
        Ok(rows.iter().map(permission_from_row).collect())
    }

    async fn project_members(&self, project: &str) -> StoreResult<Vec<ProjectMember>> {
        let project_id = self.id_for("projects", project).await?;
        let rows = sqlx::query(
            "SELECT u.public_id AS user_public_id, pm.role FROM project_members pm \
             JOIN users u ON u.id = pm.user_id WHERE pm.project_id = $1 ORDER BY u.public_id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .instrument(db_span("SELECT"))
        .await
        .map_err(|err| map_err(err, "project_members"))?;
        Ok(rows
            .iter()
            .map(|row| ProjectMember {
                project_public_id: project.to_string(),
                user_public_id: row.get("user_public_id"),
                role: row.get("role"),
            })
            .collect())
    }

    async fn projects_for_user(&self, user: &str) -> StoreResult<Vec<Project>> {
        let user_id = self.id_for("users", user).await?;
        let rows = sqlx::query(
            "SELECT p.id, p.public_id, p.name FROM projects p \
             JOIN project_members pm ON pm.project_id = p.id WHERE pm.user_id = $1 ORDER BY p.name",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .instrument(db_span("SELECT"))
        .await
        .map_err(|err| map_err(err, "project_members"))?;
        Ok(rows.iter().map(project_from_row).collect())
    }

    async fn access_profile(&self, user_id: i64) -> StoreResult<AccessProfile> {
        let query = r"
            SELECT
                EXISTS (
                    SELECT 1 FROM user_roles ur
                    JOIN roles r ON r.id = ur.role_id
                    WHERE ur.user_id = $1 AND lower(r.name) = lower($2)
                ) AS is_superadmin,
                ARRAY(
                    SELECT p.name FROM user_roles ur
                    JOIN role_permissions rp ON rp.role_id = ur.role_id
                    JOIN permissions p ON p.id = rp.permission_id
                    WHERE ur.user_id = $1
                    UNION
                    SELECT p.name FROM user_permissions up
                    JOIN permissions p ON p.id = up.permission_id
                    WHERE up.user_id = $1
                ) AS permissions
        ";
        let row = sqlx::query(query)
            .bind(user_id)
            .bind(SUPERADMIN_ROLE)
            .fetch_one(&self.pool)
            .instrument(db_span("SELECT"))
            .await
            .map_err(|err| map_err(err, "access profile"))?;
        let permissions: Vec<String> = row.get("permissions");
        Ok(AccessProfile {
            is_superadmin: row.get("is_superadmin"),
            permissions: permissions.into_iter().collect(),
        })
    }

    async fn is_project_member(&self, user_id: i64, project: &str) -> StoreResult<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM project_members pm JOIN projects p ON p.id = pm.project_id \
             WHERE pm.user_id = $1 AND p.public_id = $2) AS member",
        )
        .bind(user_id)
        .bind(project)
        .fetch_one(&self.pool)
        .instrument(db_span("SELECT"))
        .await
        .map_err(|err| map_err(err, "project_members"))?;
        Ok(row.get("member"))
    }
}

#[async_trait]
impl ClientStore for PgStore {
    async fn create_client(&self, client: NewOAuthClient) -> StoreResult<OAuthClient> {
        let query = format!(
            "INSERT INTO oauth_clients (public_id, client_id, name, confidential, client_secret_hash, \
             redirect_uris, scopes, pkce_required, is_default) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING {CLIENT_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(Ulid::new().to_string())
            .bind(&client.client_id)
            .bind(&client.name)
            .bind(client.confidential)
            .bind(&client.client_secret_hash)
            .bind(&client.redirect_uris)
            .bind(&client.scopes)
            .bind(client.pkce_required)
            .bind(client.is_default)
            .fetch_one(&self.pool)
            .instrument(db_span("INSERT"))
            .await
            .map_err(|err| map_err(err, &format!("client {}", client.client_id)))?;
        Ok(client_from_row(&row))
    }

    async fn find_client(&self, client_id: &str) -> StoreResult<Option<OAuthClient>> {
        let query = format!("SELECT {CLIENT_COLUMNS} FROM oauth_clients WHERE client_id = $1");
        let row = sqlx::query(&query)
            .bind(client_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT"))
            .await
            .map_err(|err| map_err(err, "oauth_clients"))?;
        Ok(row.map(|row| client_from_row(&row)))
    }

    async fn get_client(&self, public_id: &str) -> StoreResult<OAuthClient> {
        let query = format!("SELECT {CLIENT_COLUMNS} FROM oauth_clients WHERE public_id = $1");
        let row = sqlx::query(&query)
            .bind(public_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT"))
            .await
            .map_err(|err| map_err(err, "oauth_clients"))?;
        row.map(|row| client_from_row(&row))
            .ok_or_else(|| StoreError::NotFound(format!("client {public_id}")))
    }

    async fn list_clients(&self) -> StoreResult<Vec<OAuthClient>> {
        let query = format!("SELECT {CLIENT_COLUMNS} FROM oauth_clients ORDER BY client_id");
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT"))
            .await
            .map_err(|err| map_err(err, "oauth_clients"))?;
        Ok(rows.iter().map(client_from_row).collect())
    }

    async fn update_client(&self, client: OAuthClient) -> StoreResult<OAuthClient> {
        let query = format!(
            "UPDATE oauth_clients SET client_id = $2, name = $3, confidential = $4, \
             client_secret_hash = $5, redirect_uris = $6, scopes = $7, pkce_required = $8, \
             is_default = $9 WHERE public_id = $1 RETURNING {CLIENT_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(&client.public_id)
            .bind(&client.client_id)
            .bind(&client.name)
            .bind(client.confidential)
            .bind(&client.client_secret_hash)
            .bind(&client.redirect_uris)
            .bind(&client.scopes)
            .bind(client.pkce_required)
            .bind(client.is_default)
            .fetch_optional(&self.pool)
            .instrument(db_span("UPDATE"))
            .await
            .map_err(|err| map_err(err, &format!("client {}", client.client_id)))?;
        row.map(|row| client_from_row(&row))
            .ok_or_else(|| StoreError::NotFound(format!("client {}", client.public_id)))
    }

    async fn delete_client(&self, public_id: &str) -> StoreResult<()> {
        let subject = format!("client {public_id}");
        let result = sqlx::query("DELETE FROM oauth_clients WHERE public_id = $1")
            .bind(public_id)
            .execute(&self.pool)
            .instrument(db_span("DELETE"))
            .await
            .map_err(|err| map_err(err, &subject))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(subject));
        }
        Ok(())
    }

    async fn upsert_provider(&self, provider: OAuthProvider) -> StoreResult<OAuthProvider> {
        let query = format!(
            "INSERT INTO oauth_providers ({PROVIDER_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (name) DO UPDATE SET client_id = EXCLUDED.client_id, \
             client_secret_encrypted = EXCLUDED.client_secret_encrypted, \
             authorize_url = EXCLUDED.authorize_url, token_url = EXCLUDED.token_url, \
             userinfo_url = EXCLUDED.userinfo_url, redirect_url = EXCLUDED.redirect_url, \
             scopes = EXCLUDED.scopes, enabled = EXCLUDED.enabled \
             RETURNING {PROVIDER_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(&provider.name)
            .bind(&provider.client_id)
            .bind(&provider.client_secret_encrypted)
            .bind(&provider.authorize_url)
            .bind(&provider.token_url)
            .bind(&provider.userinfo_url)
            .bind(&provider.redirect_url)
            .bind(&provider.scopes)
            .bind(provider.enabled)
            .fetch_one(&self.pool)
            .instrument(db_span("INSERT"))
            .await
            .map_err(|err| map_err(err, &format!("provider {}", provider.name)))?;
        Ok(provider_from_row(&row))
    }

    async fn find_provider(&self, name: &str) -> StoreResult<Option<OAuthProvider>> {
        let query = format!("SELECT {PROVIDER_COLUMNS} FROM oauth_providers WHERE name = $1");
        let row = sqlx::query(&query)
            .bind(name)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT"))
            .await
            .map_err(|err| map_err(err, "oauth_providers"))?;
        Ok(row.map(|row| provider_from_row(&row)))
    }

    async fn list_providers(&self) -> StoreResult<Vec<OAuthProvider>> {
        let query = format!("SELECT {PROVIDER_COLUMNS} FROM oauth_providers ORDER BY name");
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT"))
            .await
            .map_err(|err| map_err(err, "oauth_providers"))?;
        Ok(rows.iter().map(provider_from_row).collect())
    }

    async fn set_provider_enabled(&self, name: &str, enabled: bool) -> StoreResult<()> {
        let result = sqlx::query("UPDATE oauth_providers SET enabled = $2 WHERE name = $1")
            .bind(name)
            .bind(enabled)
            .execute(&self.pool)
            .instrument(db_span("UPDATE"))
            .await
            .map_err(|err| map_err(err, "oauth_providers"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("provider {name}")));
        }
        Ok(())
    }
}

#[async_trait]
impl GrantStore for PgStore {
    async fn insert_refresh_grant(&self, grant: RefreshGrant) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO refresh_grants (token_hash, client_id, user_public_id, scope, expires_at, revoked) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&grant.token_hash)
        .bind(&grant.client_id)
        .bind(&grant.user_public_id)
        .bind(&grant.scope)
        .bind(grant.expires_at)
        .bind(grant.revoked)
        .execute(&self.pool)
        .instrument(db_span("INSERT"))
        .await
        .map_err(|err| map_err(err, "refresh grant"))?;
        Ok(())
    }

    async fn find_refresh_grant(&self, token_hash: &[u8]) -> StoreResult<Option<RefreshGrant>> {
        let row = sqlx::query(
            "SELECT token_hash, client_id, user_public_id, scope, expires_at, revoked \
             FROM refresh_grants WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .instrument(db_span("SELECT"))
        .await
        .map_err(|err| map_err(err, "refresh_grants"))?;
        Ok(row.map(|row| grant_from_row(&row)))
    }

    async fn rotate_refresh_grant(&self, old_hash: &[u8], next: RefreshGrant) -> StoreResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| map_err(err, "refresh grant rotation"))?;

        let revoked = sqlx::query(
            "UPDATE refresh_grants SET revoked = TRUE WHERE token_hash = $1 AND NOT revoked",
        )
        .bind(old_hash)
        .execute(&mut *tx)
        .instrument(db_span("UPDATE"))
        .await
        .map_err(|err| map_err(err, "refresh grant rotation"))?;
        if revoked.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|err| map_err(err, "refresh grant rotation"))?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO refresh_grants (token_hash, client_id, user_public_id, scope, expires_at, revoked) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&next.token_hash)
        .bind(&next.client_id)
        .bind(&next.user_public_id)
        .bind(&next.scope)
        .bind(next.expires_at)
        .bind(next.revoked)
        .execute(&mut *tx)
        .instrument(db_span("INSERT"))
        .await
        .map_err(|err| map_err(err, "refresh grant rotation"))?;

        tx.commit()
            .await
            .map_err(|err| map_err(err, "refresh grant rotation"))?;
        Ok(true)
    }

    async fn revoke_refresh_grant(&self, token_hash: &[u8]) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE refresh_grants SET revoked = TRUE WHERE token_hash = $1 AND NOT revoked",
        )
        .bind(token_hash)
        .execute(&self.pool)
        .instrument(db_span("UPDATE"))
        .await
        .map_err(|err| map_err(err, "refresh_grants"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_grants_for_user(&self, user_public_id: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE refresh_grants SET revoked = TRUE WHERE user_public_id = $1 AND NOT revoked",
        )
        .bind(user_public_id)
        .execute(&self.pool)
        .instrument(db_span("UPDATE"))
        .await
        .map_err(|err| map_err(err, "refresh_grants"))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CodeStore for PgStore {
    async fn insert_code_within_limit(
        &self,
        code: NewCode,
        window_start: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<bool> {
        let subject = "one_time_codes";
        let mut tx = self.pool.begin().await.map_err(|err| map_err(err, subject))?;

        // Serialize issuance per (user, purpose) so the count and insert agree.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("code:{}:{}", code.user_id, code.purpose.as_str()))
            .execute(&mut *tx)
            .instrument(db_span("SELECT"))
            .await
            .map_err(|err| map_err(err, subject))?;

        let row = sqlx::query(
            "SELECT COUNT(*) AS issued FROM one_time_codes \
             WHERE user_id = $1 AND purpose = $2 AND created_at >= $3",
        )
        .bind(code.user_id)
        .bind(code.purpose.as_str())
        .bind(window_start)
        .fetch_one(&mut *tx)
        .instrument(db_span("SELECT"))
        .await
        .map_err(|err| map_err(err, subject))?;
        let issued: i64 = row.get("issued");
        if issued >= i64::from(limit) {
            tx.rollback().await.map_err(|err| map_err(err, subject))?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE one_time_codes SET consumed_at = NOW() \
             WHERE user_id = $1 AND purpose = $2 AND consumed_at IS NULL",
        )
        .bind(code.user_id)
        .bind(code.purpose.as_str())
        .execute(&mut *tx)
        .instrument(db_span("UPDATE"))
        .await
        .map_err(|err| map_err(err, subject))?;

        sqlx::query(
            "INSERT INTO one_time_codes (user_id, purpose, code_hash, expires_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(code.user_id)
        .bind(code.purpose.as_str())
        .bind(&code.code_hash)
        .bind(code.expires_at)
        .execute(&mut *tx)
        .instrument(db_span("INSERT"))
        .await
        .map_err(|err| map_err(err, subject))?;

        tx.commit().await.map_err(|err| map_err(err, subject))?;
        Ok(true)
    }

    async fn consume_code(
        &self,
        purpose: CodePurpose,
        code_hash: &[u8],
        user_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> StoreResult<CodeOutcome> {
        let query = r"
            UPDATE one_time_codes SET consumed_at = $4
            WHERE id = (
                SELECT id FROM one_time_codes
                WHERE purpose = $1 AND code_hash = $2 AND consumed_at IS NULL
                  AND ($3::bigint IS NULL OR user_id = $3)
                ORDER BY created_at DESC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING user_id, expires_at
        ";
        let row = sqlx::query(query)
            .bind(purpose.as_str())
            .bind(code_hash)
            .bind(user_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(db_span("UPDATE"))
            .await
            .map_err(|err| map_err(err, "one_time_codes"))?;

        let Some(row) = row else {
            return Ok(CodeOutcome::NotFound);
        };
        let expires_at: DateTime<Utc> = row.get("expires_at");
        if expires_at <= now {
            return Ok(CodeOutcome::Expired);
        }
        Ok(CodeOutcome::Consumed {
            user_id: row.get("user_id"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;

    #[derive(Debug)]
    struct TestDbError {
        code: Option<&'static str>,
    }

    impl fmt::Display for TestDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test database error")
        }
    }

    impl StdError for TestDbError {}

    impl DatabaseError for TestDbError {
        fn message(&self) -> &'static str {
            "test database error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            self.code.map(Cow::Borrowed)
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::Other
        }
    }

    fn db_error(code: &'static str) -> sqlx::Error {
        sqlx::Error::Database(Box::new(TestDbError { code: Some(code) }))
    }

    #[test]
    fn sqlstates_map_to_store_errors() {
        assert!(matches!(map_err(db_error("23505"), "role x"), StoreError::Conflict(_)));
        assert!(matches!(map_err(db_error("23503"), "role x"), StoreError::InUse(_)));
        assert!(matches!(map_err(db_error("99999"), "role x"), StoreError::Unexpected(_)));
        assert!(matches!(
            map_err(sqlx::Error::RowNotFound, "role x"),
            StoreError::Unexpected(_)
        ));
    }

    #[test]
    fn schema_restricts_mapping_deletes() {
        assert!(SCHEMA.contains("ON DELETE RESTRICT"));
        assert!(SCHEMA.contains("oauth_clients_public_requires_pkce"));
    }
}
