use crate::{
    api,
    app::{AppConfig, Components, Services, Stores},
    cli::{commands::tokens::RetiredKey, telemetry},
    crypto::FieldCipher,
    jwks::{HttpJwksFetcher, JwksCacheConfig, JwksFetcher},
    oauth::{AuthConfig, HttpProviderClient},
    otp::{CodeConfig, LogNotifier},
    token::{Jwk, TokenSigner},
};
use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use std::{fs, sync::Arc, time::Duration};
use tracing::{debug, info};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub jwt_private_key_path: String,
    pub jwt_key_id: String,
    pub jwt_retired_public_keys: Vec<RetiredKey>,
    pub issuer: String,
    pub audience: Option<String>,
    pub access_token_ttl_seconds: u64,
    pub refresh_token_ttl_seconds: u64,
    pub session_ttl_seconds: u64,
    pub frontend_base_url: String,
    pub iam_encryption_key: SecretString,
    pub otp_ttl_seconds: u64,
    pub otp_max_per_window: u32,
    pub code_window_seconds: u64,
    pub email_token_ttl_seconds: u64,
    pub email_max_per_window: u32,
    pub jwks_url: Option<String>,
    pub jwks_ttl_seconds: u64,
    pub jwks_refresh_per_minute: usize,
}

impl Args {
    fn app_config(&self) -> AppConfig {
        let window = Duration::from_secs(self.code_window_seconds);
        AppConfig {
            auth: AuthConfig::new(self.frontend_base_url.clone())
                .with_refresh_token_ttl_seconds(self.refresh_token_ttl_seconds)
                .with_session_ttl_seconds(self.session_ttl_seconds),
            otp: Some(
                CodeConfig::otp()
                    .with_ttl(Duration::from_secs(self.otp_ttl_seconds))
                    .with_max_per_window(self.otp_max_per_window)
                    .with_window(window),
            ),
            email_verification: Some(
                CodeConfig::email_verification()
                    .with_ttl(Duration::from_secs(self.email_token_ttl_seconds))
                    .with_max_per_window(self.email_max_per_window)
                    .with_window(window),
            ),
            jwks: JwksCacheConfig::new()
                .with_ttl(Duration::from_secs(self.jwks_ttl_seconds))
                .with_refresh_limit(self.jwks_refresh_per_minute)
                .with_refresh_window(Duration::from_secs(60)),
            audience: self.audience.clone(),
        }
    }
}

/// Load the signing key and append the retired public keys to its JWKS.
fn load_signer(args: &Args) -> Result<TokenSigner> {
    let key = fs::read(&args.jwt_private_key_path)
        .with_context(|| format!("Failed to read signing key: {}", args.jwt_private_key_path))?;
    let mut signer =
        TokenSigner::from_pem_or_der(&key, args.jwt_key_id.clone(), args.issuer.clone())
            .context("Invalid signing key")?
            .with_access_token_ttl(Duration::from_secs(args.access_token_ttl_seconds));
    for retired in &args.jwt_retired_public_keys {
        let public_key = fs::read(&retired.path)
            .with_context(|| format!("Failed to read retired key: {}", retired.path))?;
        let jwk = Jwk::from_rsa_public_key_pem_or_der(&public_key, retired.kid.clone())
            .with_context(|| format!("Invalid retired key: {}", retired.kid))?;
        signer = signer.with_retired_key(jwk);
    }
    Ok(signer)
}

/// Execute the server action.
/// # Errors
/// Returns an error if the signing key, encryption key or database cannot be
/// loaded, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let signer = Arc::new(load_signer(&args)?);
    debug!(
        kid = signer.kid(),
        published = signer.jwks().keys.len(),
        "signing key loaded"
    );

    let cipher = FieldCipher::from_base64(args.iam_encryption_key.expose_secret())
        .context("Invalid IAM encryption key")?;

    let stores = match &args.dsn {
        Some(dsn) => Stores::postgres(dsn).await?,
        None => {
            info!("No DSN configured, using in-memory storage");
            Stores::memory()
        }
    };

    let jwks_fetcher: Option<Arc<dyn JwksFetcher>> = match &args.jwks_url {
        Some(url) => Some(Arc::new(HttpJwksFetcher::new(url.clone(), UPSTREAM_TIMEOUT)?)),
        None => None,
    };

    let components = Components {
        stores,
        signer,
        cipher,
        notifier: Arc::new(LogNotifier),
        provider_client: Arc::new(HttpProviderClient::new(UPSTREAM_TIMEOUT)?),
        jwks_fetcher,
    };

    let services = Arc::new(Services::build(components, args.app_config()).await?);
    let result = api::serve(args.port, services).await;

    telemetry::shutdown_tracer();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> Args {
        Args {
            port: 8080,
            dsn: None,
            jwt_private_key_path: "/tmp/jwt.pem".to_string(),
            jwt_key_id: "k1".to_string(),
            jwt_retired_public_keys: Vec::new(),
            issuer: "https://id.example.com".to_string(),
            audience: Some("api".to_string()),
            access_token_ttl_seconds: 900,
            refresh_token_ttl_seconds: 3600,
            session_ttl_seconds: 600,
            frontend_base_url: "https://app.example.com/".to_string(),
            iam_encryption_key: SecretString::from("key"),
            otp_ttl_seconds: 120,
            otp_max_per_window: 5,
            code_window_seconds: 300,
            email_token_ttl_seconds: 1800,
            email_max_per_window: 2,
            jwks_url: None,
            jwks_ttl_seconds: 60,
            jwks_refresh_per_minute: 4,
        }
    }

    #[test]
    fn app_config_from_args() {
        let config = args().app_config();
        assert_eq!(config.auth.frontend_base_url(), "https://app.example.com");
        assert_eq!(config.auth.session_ttl_seconds(), 600);
        assert_eq!(config.auth.refresh_token_ttl(), Duration::from_secs(3600));

        let otp = config.otp.unwrap_or_else(CodeConfig::otp);
        assert_eq!(otp.ttl(), Duration::from_secs(120));
        assert_eq!(otp.max_per_window(), 5);
        assert_eq!(otp.window(), Duration::from_secs(300));

        let email = config
            .email_verification
            .unwrap_or_else(CodeConfig::email_verification);
        assert_eq!(email.max_per_window(), 2);

        assert_eq!(config.jwks.ttl(), Duration::from_secs(60));
        assert_eq!(config.jwks.refresh_limit(), 4);
        assert_eq!(config.audience.as_deref(), Some("api"));
    }

    #[tokio::test]
    async fn missing_key_file_is_reported() {
        let mut args = args();
        args.jwt_private_key_path = "/nonexistent/gatehouse/jwt.pem".to_string();
        let err = execute(args).await.err().map(|err| err.to_string());
        assert!(err.is_some_and(|msg| msg.contains("Failed to read signing key")));
    }

    #[test]
    fn retired_keys_stay_published() {
        use rsa::pkcs8::{EncodePublicKey, LineEnding};

        let dir = std::env::temp_dir().join(format!("gatehouse-keys-{}", ulid::Ulid::new()));
        fs::create_dir_all(&dir).unwrap();
        let private_path = dir.join("jwt.pem");
        fs::write(&private_path, crate::token::TEST_PRIVATE_KEY_PEM).unwrap();
        let private_key =
            crate::token::decode_private_key(crate::token::TEST_PRIVATE_KEY_PEM.as_bytes()).unwrap();
        let public_pem = rsa::RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        let retired_path = dir.join("old.pub");
        fs::write(&retired_path, public_pem).unwrap();

        let mut args = args();
        args.jwt_private_key_path = private_path.display().to_string();
        args.jwt_retired_public_keys = vec![RetiredKey {
            kid: "k0".to_string(),
            path: retired_path.display().to_string(),
        }];
        let signer = load_signer(&args).unwrap();
        let kids: Vec<&str> = signer.jwks().keys.iter().map(|key| key.kid.as_str()).collect();
        assert_eq!(kids, ["k1", "k0"]);

        args.jwt_retired_public_keys[0].path = dir.join("missing.pub").display().to_string();
        let err = load_signer(&args).err().map(|err| err.to_string());
        assert!(err.is_some_and(|msg| msg.contains("Failed to read retired key")));

        fs::remove_dir_all(dir).unwrap();
    }
}
