use chrono::{Duration as ChronoDuration, Utc};
use rand::{rngs::OsRng, Rng};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info, warn};

use super::{CodeConfig, CodeError, CodeMessage, Notifier};
use crate::crypto::{generate_token, hash_token};
use crate::ratelimit::{RateLimitDecision, SlidingWindow};
use crate::store::{CodeOutcome, CodePurpose, CodeStore, IamStore, NewCode, User};

const OTP_DIGITS: usize = 6;
/// Guesses allowed per user within one code lifetime.
const MAX_VERIFY_ATTEMPTS: usize = 5;
const OTP_TEMPLATE: &str = "login_code";
const EMAIL_TEMPLATE: &str = "email_verification";

fn chrono_duration(duration: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::minutes(15))
}

/// Six decimal digits from the OS random source.
fn generate_otp() -> String {
    let value: u32 = OsRng.gen_range(0..1_000_000);
    format!("{value:0width$}", width = OTP_DIGITS)
}

/// Shared issue-then-deliver logic for one code purpose.
struct CodeIssuer {
    codes: Arc<dyn CodeStore>,
    notifier: Arc<dyn Notifier>,
    config: CodeConfig,
    purpose: CodePurpose,
}

impl CodeIssuer {
    /// Record the hashed code within the rate limit, then deliver it.
    ///
    /// The code stays valid when delivery fails, so a retry counts against
    /// the same limit instead of bypassing it.
    async fn issue(&self, user: &User, code: &str, message: CodeMessage) -> Result<(), CodeError> {
        let now = Utc::now();
        let accepted = self
            .codes
            .insert_code_within_limit(
                NewCode {
                    user_id: user.id,
                    purpose: self.purpose,
                    code_hash: hash_token(code),
                    expires_at: now + chrono_duration(self.config.ttl()),
                },
                now - chrono_duration(self.config.window()),
                self.config.max_per_window(),
            )
            .await?;
        if !accepted {
            warn!(user = %user.public_id, purpose = self.purpose.as_str(), "code issuance rate limited");
            return Err(CodeError::RateLimited);
        }

        if let Err(err) = self.notifier.send(&message).await {
            error!(user = %user.public_id, purpose = self.purpose.as_str(), "code delivery failed: {err:#}");
            return Err(CodeError::Delivery(err));
        }
        info!(user = %user.public_id, purpose = self.purpose.as_str(), "code issued");
        Ok(())
    }

    async fn consume(&self, code: &str, user_id: Option<i64>) -> Result<i64, CodeError> {
        match self
            .codes
            .consume_code(self.purpose, &hash_token(code), user_id, Utc::now())
            .await?
        {
            CodeOutcome::Consumed { user_id } => Ok(user_id),
            CodeOutcome::Expired => Err(CodeError::Expired),
            CodeOutcome::NotFound => Err(CodeError::Invalid),
        }
    }
}

/// Numeric one-time login codes.
pub struct OtpService {
    issuer: CodeIssuer,
    attempts: Mutex<HashMap<i64, SlidingWindow>>,
}

impl OtpService {
    #[must_use]
    pub fn new(codes: Arc<dyn CodeStore>, notifier: Arc<dyn Notifier>, config: CodeConfig) -> Self {
        Self {
            issuer: CodeIssuer {
                codes,
                notifier,
                config,
                purpose: CodePurpose::Otp,
            },
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn attempt(&self, user_id: i64) -> RateLimitDecision {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        attempts.retain(|_, window| window.in_window() > 0);
        attempts
            .entry(user_id)
            .or_insert_with(|| SlidingWindow::new(MAX_VERIFY_ATTEMPTS, self.issuer.config.ttl()))
            .try_acquire()
    }

    fn clear_attempts(&self, user_id: i64) {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&user_id);
    }

    /// Issue a login code and deliver it to the user's email.
    ///
    /// # Errors
    /// `RateLimited` past the issuance limit, `Delivery` when sending fails.
    pub async fn issue(&self, user: &User) -> Result<(), CodeError> {
        let code = generate_otp();
        let payload = serde_json::json!({
            "code": code,
            "expires_in": self.issuer.config.ttl().as_secs(),
        });
        let message = CodeMessage {
            to_email: user.email.clone(),
            template: OTP_TEMPLATE.to_string(),
            payload_json: payload.to_string(),
        };
        self.issuer.issue(user, &code, message).await
    }

    /// Consume a login code for `user`.
    ///
    /// # Errors
    /// `Invalid` for a wrong or already used code, `Expired` past its lifetime,
    /// `RateLimited` once the user has spent their guesses for the window.
    pub async fn verify(&self, user: &User, code: &str) -> Result<(), CodeError> {
        let code = code.trim();
        if code.len() != OTP_DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CodeError::Invalid);
        }
        if self.attempt(user.id) == RateLimitDecision::Limited {
            warn!(user = %user.public_id, "login code guesses exhausted");
            return Err(CodeError::RateLimited);
        }
        self.issuer.consume(code, Some(user.id)).await?;
        self.clear_attempts(user.id);
        info!(user = %user.public_id, "login code accepted");
        Ok(())
    }
}

/// Email ownership confirmation through a one-time link.
pub struct EmailVerificationService {
    issuer: CodeIssuer,
    iam: Arc<dyn IamStore>,
    frontend_base_url: String,
}

impl EmailVerificationService {
    #[must_use]
    pub fn new(
        iam: Arc<dyn IamStore>,
        codes: Arc<dyn CodeStore>,
        notifier: Arc<dyn Notifier>,
        config: CodeConfig,
    ) -> Self {
        Self {
            issuer: CodeIssuer {
                codes,
                notifier,
                config,
                purpose: CodePurpose::EmailVerification,
            },
            iam,
            frontend_base_url: String::new(),
        }
    }

    #[must_use]
    pub fn with_frontend_base_url(mut self, frontend_base_url: impl Into<String>) -> Self {
        self.frontend_base_url = frontend_base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Send a verification link. Already verified users get nothing.
    ///
    /// # Errors
    /// `RateLimited` past the issuance limit, `Delivery` when sending fails.
    pub async fn issue(&self, user: &User) -> Result<(), CodeError> {
        if user.email_verified {
            return Ok(());
        }
        let token = generate_token().map_err(CodeError::Unexpected)?;
        let link = format!("{}/verify-email#token={token}", self.frontend_base_url);
        let payload = serde_json::json!({
            "verify_url": link,
            "expires_in": self.issuer.config.ttl().as_secs(),
        });
        let message = CodeMessage {
            to_email: user.email.clone(),
            template: EMAIL_TEMPLATE.to_string(),
            payload_json: payload.to_string(),
        };
        self.issuer.issue(user, &token, message).await
    }

    /// Consume a verification token and mark the owner's email verified.
    ///
    /// # Errors
    /// `Invalid` for unknown or used tokens, `Expired` past their lifetime.
    pub async fn verify(&self, token: &str) -> Result<User, CodeError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(CodeError::Invalid);
        }
        let user_id = self.issuer.consume(token, None).await?;
        self.iam.set_email_verified(user_id).await?;
        let user = self
            .iam
            .find_user_by_id(user_id)
            .await?
            .ok_or(CodeError::UnknownUser)?;
        info!(user = %user.public_id, "email verified");
        Ok(user)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, NewUser};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<CodeMessage>>,
        fail: bool,
    }

    impl Outbox {
        fn last_payload(&self) -> serde_json::Value {
            let sent = self.sent.lock().unwrap();
            serde_json::from_str(&sent.last().unwrap().payload_json).unwrap()
        }
    }

    #[async_trait]
    impl Notifier for Outbox {
        async fn send(&self, message: &CodeMessage) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("smtp unavailable");
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    async fn user(store: &MemoryStore) -> User {
        store
            .create_user(NewUser {
                email: "dana@example.com".to_string(),
                ..NewUser::default()
            })
            .await
            .unwrap()
    }

    #[test]
    fn otp_has_six_digits() {
        for _ in 0..50 {
            let code = generate_otp();
            assert_eq!(code.len(), 6);
            assert!(code.bytes().all(|b| b.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn fourth_issue_in_window_is_rate_limited() {
        let store = Arc::new(MemoryStore::new());
        let outbox = Arc::new(Outbox::default());
        let otp = OtpService::new(store.clone(), outbox.clone(), CodeConfig::otp());
        let dana = user(&store).await;

        for _ in 0..3 {
            otp.issue(&dana).await.unwrap();
        }
        assert!(matches!(otp.issue(&dana).await, Err(CodeError::RateLimited)));
        assert_eq!(outbox.sent.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn code_is_single_use_and_latest_wins() {
        let store = Arc::new(MemoryStore::new());
        let outbox = Arc::new(Outbox::default());
        let otp = OtpService::new(store.clone(), outbox.clone(), CodeConfig::otp());
        let dana = user(&store).await;

        otp.issue(&dana).await.unwrap();
        let first = outbox.last_payload()["code"].as_str().unwrap().to_string();
        otp.issue(&dana).await.unwrap();
        let second = outbox.last_payload()["code"].as_str().unwrap().to_string();

        if first != second {
            assert!(matches!(otp.verify(&dana, &first).await, Err(CodeError::Invalid)));
        }
        otp.verify(&dana, &second).await.unwrap();
        assert!(matches!(otp.verify(&dana, &second).await, Err(CodeError::Invalid)));
        assert!(matches!(otp.verify(&dana, "12ab56").await, Err(CodeError::Invalid)));
    }

    #[tokio::test]
    async fn expired_code_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let outbox = Arc::new(Outbox::default());
        let otp = OtpService::new(
            store.clone(),
            outbox.clone(),
            CodeConfig::otp().with_ttl(std::time::Duration::ZERO),
        );
        let dana = user(&store).await;
        otp.issue(&dana).await.unwrap();
        let code = outbox.last_payload()["code"].as_str().unwrap().to_string();
        assert!(matches!(otp.verify(&dana, &code).await, Err(CodeError::Expired)));
    }

    #[tokio::test]
    async fn delivery_failure_is_distinct_and_counts() {
        let store = Arc::new(MemoryStore::new());
        let failing = Arc::new(Outbox {
            fail: true,
            ..Outbox::default()
        });
        let otp = OtpService::new(
            store.clone(),
            failing,
            CodeConfig::otp().with_max_per_window(1),
        );
        let dana = user(&store).await;
        assert!(matches!(otp.issue(&dana).await, Err(CodeError::Delivery(_))));
        assert!(matches!(otp.issue(&dana).await, Err(CodeError::RateLimited)));
    }

    #[tokio::test]
    async fn email_verification_marks_user() {
        let store = Arc::new(MemoryStore::new());
        let outbox = Arc::new(Outbox::default());
        let service = EmailVerificationService::new(
            store.clone(),
            store.clone(),
            outbox.clone(),
            CodeConfig::email_verification(),
        )
        .with_frontend_base_url("https://id.example.com/");
        let dana = user(&store).await;

        service.issue(&dana).await.unwrap();
        let link = outbox.last_payload()["verify_url"].as_str().unwrap().to_string();
        let token = link
            .strip_prefix("https://id.example.com/verify-email#token=")
            .unwrap();

        let verified = service.verify(token).await.unwrap();
        assert!(verified.email_verified);
        assert!(matches!(service.verify(token).await, Err(CodeError::Invalid)));

        let sent = outbox.sent.lock().unwrap().len();
        service.issue(&verified).await.unwrap();
        assert_eq!(outbox.sent.lock().unwrap().len(), sent);
    }

    #[tokio::test]
    async fn guesses_are_capped_per_user() {
        let store = Arc::new(MemoryStore::new());
        let outbox = Arc::new(Outbox::default());
        let otp = OtpService::new(store.clone(), outbox.clone(), CodeConfig::otp());
        let dana = user(&store).await;
        otp.issue(&dana).await.unwrap();
        let code = outbox.last_payload()["code"].as_str().unwrap().to_string();
        let wrong = if code == "000000" { "000001" } else { "000000" };

        for _ in 0..MAX_VERIFY_ATTEMPTS {
            assert!(matches!(otp.verify(&dana, wrong).await, Err(CodeError::Invalid)));
        }
        assert!(matches!(otp.verify(&dana, &code).await, Err(CodeError::RateLimited)));
    }
}
