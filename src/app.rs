//! Composition root: builds leaf components (stores, signer, caches) first and
//! wires the services that depend on them.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::crypto::FieldCipher;
use crate::iam::{
    seed_builtins, Authorizer, ClientService, IamMapper, PermissionService, Principal,
    ProviderService, RoleService, UserService,
};
use crate::jwks::{JwksCache, JwksCacheConfig, JwksFetcher, StaticJwksFetcher};
use crate::oauth::{AuthConfig, AuthorizationServer, FederatedLogin, ProviderClient};
use crate::otp::{CodeConfig, EmailVerificationService, Notifier, OtpService};
use crate::session::{SessionRefresher, SessionStore};
use crate::store::{ClientStore, CodeStore, GrantStore, IamStore, MemoryStore, PgStore, StoreResult};
use crate::token::{AccessTokenVerifier, TokenSigner};

/// The four storage capabilities, backed by one implementation.
#[derive(Clone)]
pub struct Stores {
    pub iam: Arc<dyn IamStore>,
    pub clients: Arc<dyn ClientStore>,
    pub grants: Arc<dyn GrantStore>,
    pub codes: Arc<dyn CodeStore>,
    postgres: Option<PgStore>,
}

impl Stores {
    /// Process-local storage for development and tests.
    #[must_use]
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            iam: store.clone(),
            clients: store.clone(),
            grants: store.clone(),
            codes: store,
            postgres: None,
        }
    }

    /// Connect to PostgreSQL and make sure the schema exists.
    ///
    /// # Errors
    /// Returns an error if the connection or schema setup fails.
    pub async fn postgres(dsn: &str) -> Result<Self> {
        let pg = PgStore::connect(dsn).await?;
        pg.ensure_schema().await.context("Failed to apply schema")?;
        let store = Arc::new(pg.clone());
        Ok(Self {
            iam: store.clone(),
            clients: store.clone(),
            grants: store.clone(),
            codes: store,
            postgres: Some(pg),
        })
    }

    #[must_use]
    pub fn backend(&self) -> &'static str {
        if self.postgres.is_some() {
            "postgresql"
        } else {
            "memory"
        }
    }

    /// # Errors
    /// Returns an error if the database cannot be reached.
    pub async fn health_check(&self) -> StoreResult<()> {
        match &self.postgres {
            Some(pg) => pg.health_check().await,
            None => Ok(()),
        }
    }
}

/// Tunables that are not carried by a component's constructor.
#[derive(Clone, Debug, Default)]
pub struct AppConfig {
    pub auth: AuthConfig,
    pub otp: Option<CodeConfig>,
    pub email_verification: Option<CodeConfig>,
    pub jwks: JwksCacheConfig,
    pub audience: Option<String>,
}

/// Externally supplied collaborators.
pub struct Components {
    pub stores: Stores,
    pub signer: Arc<TokenSigner>,
    pub cipher: FieldCipher,
    pub notifier: Arc<dyn Notifier>,
    pub provider_client: Arc<dyn ProviderClient>,
    /// Remote key set for bearer verification; defaults to the local signer.
    pub jwks_fetcher: Option<Arc<dyn JwksFetcher>>,
}

pub struct Services {
    pub config: AppConfig,
    pub stores: Stores,
    pub signer: Arc<TokenSigner>,
    pub sessions: Arc<SessionStore>,
    pub authorizer: Arc<Authorizer>,
    pub mapper: IamMapper,
    pub users: UserService,
    pub roles: RoleService,
    pub permissions: PermissionService,
    pub clients: ClientService,
    pub providers: Arc<ProviderService>,
    pub oauth: AuthorizationServer,
    pub federation: Arc<FederatedLogin>,
    pub refresher: SessionRefresher,
    pub otp: OtpService,
    pub email_verification: EmailVerificationService,
    pub verifier: AccessTokenVerifier,
}

impl Services {
    /// Build every service and seed the built-in role and permission.
    ///
    /// # Errors
    /// Returns an error if seeding the store fails.
    pub async fn build(components: Components, config: AppConfig) -> Result<Self> {
        let Components {
            stores,
            signer,
            cipher,
            notifier,
            provider_client,
            jwks_fetcher,
        } = components;

        seed_builtins(stores.iam.as_ref())
            .await
            .context("Failed to seed built-in role and permission")?;

        let sessions = Arc::new(SessionStore::new(config.auth.session_ttl()));
        let authorizer = Arc::new(Authorizer::new(stores.iam.clone()));
        let providers = Arc::new(ProviderService::new(
            stores.clients.clone(),
            authorizer.clone(),
            cipher,
        ));

        let oauth = AuthorizationServer::new(
            stores.clients.clone(),
            stores.grants.clone(),
            stores.iam.clone(),
            sessions.clone(),
            signer.clone(),
        )
        .with_refresh_token_ttl(config.auth.refresh_token_ttl());

        let federation = Arc::new(FederatedLogin::new(
            stores.clients.clone(),
            stores.iam.clone(),
            sessions.clone(),
            providers.clone(),
            provider_client,
        ));
        let refresher = SessionRefresher::new(sessions.clone(), federation.clone());

        let otp = OtpService::new(
            stores.codes.clone(),
            notifier.clone(),
            config.otp.unwrap_or_else(CodeConfig::otp),
        );
        let email_verification = EmailVerificationService::new(
            stores.iam.clone(),
            stores.codes.clone(),
            notifier,
            config
                .email_verification
                .unwrap_or_else(CodeConfig::email_verification),
        )
        .with_frontend_base_url(config.auth.frontend_base_url());

        let fetcher =
            jwks_fetcher.unwrap_or_else(|| Arc::new(StaticJwksFetcher::new(signer.clone())));
        let cache = Arc::new(JwksCache::new(fetcher, config.jwks.clone()));
        let mut verifier = AccessTokenVerifier::new(cache, signer.issuer());
        if let Some(audience) = config.audience.as_deref() {
            verifier = verifier.with_audience(audience);
        }

        info!(backend = stores.backend(), kid = signer.kid(), "services ready");

        Ok(Self {
            mapper: IamMapper::new(stores.iam.clone(), authorizer.clone()),
            users: UserService::new(
                stores.iam.clone(),
                stores.grants.clone(),
                authorizer.clone(),
            ),
            roles: RoleService::new(stores.iam.clone(), authorizer.clone()),
            permissions: PermissionService::new(stores.iam.clone(), authorizer.clone()),
            clients: ClientService::new(stores.clients.clone(), authorizer.clone()),
            config,
            stores,
            signer,
            sessions,
            authorizer,
            providers,
            oauth,
            federation,
            refresher,
            otp,
            email_verification,
            verifier,
        })
    }

    /// Resolve an active user by public ID into a [`Principal`].
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn principal_for(&self, user_public_id: &str) -> StoreResult<Option<Principal>> {
        match self.stores.iam.get_user(user_public_id).await {
            Ok(user) if user.is_active => Ok(Some(Principal::from(&user))),
            Ok(_) | Err(crate::store::StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}
