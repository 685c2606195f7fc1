use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

#[derive(Clone, Debug)]
pub struct CodeMessage {
    pub to_email: String,
    pub template: String,
    pub payload_json: String,
}

/// Delivery of one-time codes (email, SMS, ...).
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a message or return an error to report it as failed.
    async fn send(&self, message: &CodeMessage) -> Result<()>;
}

/// Local dev notifier that logs the payload instead of sending it.
#[derive(Clone, Debug)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &CodeMessage) -> Result<()> {
        info!(
            to_email = %message.to_email,
            template = %message.template,
            payload = %message.payload_json,
            "code delivery stub"
        );
        Ok(())
    }
}
