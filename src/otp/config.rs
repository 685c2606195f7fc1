use std::time::Duration;

const DEFAULT_OTP_TTL_SECONDS: u64 = 5 * 60;
const DEFAULT_EMAIL_TOKEN_TTL_SECONDS: u64 = 30 * 60;
const DEFAULT_MAX_PER_WINDOW: u32 = 3;
const DEFAULT_WINDOW_SECONDS: u64 = 15 * 60;

/// Lifetime and issuance limit for one kind of one-time code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodeConfig {
    ttl: Duration,
    max_per_window: u32,
    window: Duration,
}

impl CodeConfig {
    /// Login codes: 5 minute lifetime, 3 per 15 minutes.
    #[must_use]
    pub fn otp() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_OTP_TTL_SECONDS),
            max_per_window: DEFAULT_MAX_PER_WINDOW,
            window: Duration::from_secs(DEFAULT_WINDOW_SECONDS),
        }
    }

    /// Email verification links: 30 minute lifetime, 3 per 15 minutes.
    #[must_use]
    pub fn email_verification() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_EMAIL_TOKEN_TTL_SECONDS),
            ..Self::otp()
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_max_per_window(mut self, max_per_window: u32) -> Self {
        self.max_per_window = max_per_window;
        self
    }

    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn max_per_window(&self) -> u32 {
        self.max_per_window
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }
}
