use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info_span, Instrument};

use super::JwksError;
use crate::token::TokenSigner;

/// Source of the raw JWKS document.
///
/// Implementations return the parsed JSON body; key-level validation happens
/// in the cache so one bad key never poisons the whole set.
#[async_trait]
pub trait JwksFetcher: Send + Sync {
    async fn fetch(&self) -> Result<Value, JwksError>;
}

/// Fetches the key set over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpJwksFetcher {
    url: String,
    client: Client,
}

impl HttpJwksFetcher {
    /// Build a fetcher with a bounded request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl JwksFetcher for HttpJwksFetcher {
    async fn fetch(&self) -> Result<Value, JwksError> {
        let span = info_span!("jwks.fetch", http.url = %self.url);
        async {
            let response = self
                .client
                .get(&self.url)
                .send()
                .await
                .map_err(|err| JwksError::Fetch(err.to_string()))?;
            if !response.status().is_success() {
                return Err(JwksError::Fetch(format!(
                    "unexpected status {}",
                    response.status()
                )));
            }
            response
                .json::<Value>()
                .await
                .map_err(|err| JwksError::Fetch(err.to_string()))
        }
        .instrument(span)
        .await
    }
}

/// Serves the key set of an in-process signer.
#[derive(Debug, Clone)]
pub struct StaticJwksFetcher {
    signer: Arc<TokenSigner>,
}

impl StaticJwksFetcher {
    #[must_use]
    pub fn new(signer: Arc<TokenSigner>) -> Self {
        Self { signer }
    }
}

#[async_trait]
impl JwksFetcher for StaticJwksFetcher {
    async fn fetch(&self) -> Result<Value, JwksError> {
        serde_json::to_value(self.signer.jwks()).map_err(|err| JwksError::Fetch(err.to_string()))
    }
}
