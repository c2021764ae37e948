//! Lifetimes and policy knobs for the auth engine.

use chrono::Duration;

const DEFAULT_RESET_TTL_MINUTES: i64 = 30;
const DEFAULT_VERIFICATION_TTL_HOURS: i64 = 24;
const DEFAULT_OTP_TTL_MINUTES: i64 = 10;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_IP_MAX_ATTEMPTS: u32 = 20;
const DEFAULT_WINDOW_MINUTES: i64 = 15;
const DEFAULT_ATTEMPT_RETENTION_HOURS: i64 = 24;
const DEFAULT_STORE_TIMEOUT_SECONDS: u64 = 5;
const DEFAULT_ROLE: &str = "user";

/// Failed-login throttling policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_attempts: u32,
    pub ip_max_attempts: u32,
    pub window: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            ip_max_attempts: DEFAULT_IP_MAX_ATTEMPTS,
            window: Duration::minutes(DEFAULT_WINDOW_MINUTES),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    frontend_base_url: String,
    reset_token_ttl: Duration,
    verification_token_ttl: Duration,
    otp_ttl: Duration,
    rate_limit: RateLimitPolicy,
    attempt_retention: Duration,
    store_timeout: std::time::Duration,
    default_role: String,
}

impl AuthConfig {
    #[must_use]
    pub fn new(frontend_base_url: String) -> Self {
        Self {
            frontend_base_url: frontend_base_url.trim_end_matches('/').to_string(),
            reset_token_ttl: Duration::minutes(DEFAULT_RESET_TTL_MINUTES),
            verification_token_ttl: Duration::hours(DEFAULT_VERIFICATION_TTL_HOURS),
            otp_ttl: Duration::minutes(DEFAULT_OTP_TTL_MINUTES),
            rate_limit: RateLimitPolicy::default(),
            attempt_retention: Duration::hours(DEFAULT_ATTEMPT_RETENTION_HOURS),
            store_timeout: std::time::Duration::from_secs(DEFAULT_STORE_TIMEOUT_SECONDS),
            default_role: DEFAULT_ROLE.to_string(),
        }
    }

    #[must_use]
    pub fn with_reset_token_ttl(mut self, ttl: Duration) -> Self {
        self.reset_token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_verification_token_ttl(mut self, ttl: Duration) -> Self {
        self.verification_token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_otp_ttl(mut self, ttl: Duration) -> Self {
        self.otp_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit = policy;
        self
    }

    #[must_use]
    pub fn with_attempt_retention(mut self, retention: Duration) -> Self {
        self.attempt_retention = retention;
        self
    }

    #[must_use]
    pub fn with_store_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_default_role(mut self, role: String) -> Self {
        self.default_role = role;
        self
    }

    #[must_use]
    pub fn frontend_base_url(&self) -> &str {
        &self.frontend_base_url
    }

    #[must_use]
    pub fn reset_token_ttl(&self) -> Duration {
        self.reset_token_ttl
    }

    #[must_use]
    pub fn verification_token_ttl(&self) -> Duration {
        self.verification_token_ttl
    }

    #[must_use]
    pub fn otp_ttl(&self) -> Duration {
        self.otp_ttl
    }

    #[must_use]
    pub fn rate_limit(&self) -> RateLimitPolicy {
        self.rate_limit
    }

    #[must_use]
    pub fn attempt_retention(&self) -> Duration {
        self.attempt_retention
    }

    #[must_use]
    pub fn store_timeout(&self) -> std::time::Duration {
        self.store_timeout
    }

    #[must_use]
    pub fn default_role(&self) -> &str {
        &self.default_role
    }

    /// Link placed in password reset emails.
    #[must_use]
    pub fn reset_url(&self, token: &str) -> String {
        format!("{}/reset-password#token={token}", self.frontend_base_url)
    }

    /// Link placed in verification emails.
    #[must_use]
    pub fn verify_url(&self, token: &str) -> String {
        format!("{}/verify-email#token={token}", self.frontend_base_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = AuthConfig::new("https://app.example.com/".to_string());
        assert_eq!(config.frontend_base_url(), "https://app.example.com");
        assert_eq!(config.reset_token_ttl(), Duration::minutes(30));
        assert_eq!(config.verification_token_ttl(), Duration::hours(24));
        assert_eq!(config.rate_limit().max_attempts, 5);
        assert_eq!(config.rate_limit().ip_max_attempts, 20);
        assert_eq!(config.rate_limit().window, Duration::minutes(15));
        assert_eq!(config.store_timeout(), std::time::Duration::from_secs(5));
        assert_eq!(config.default_role(), "user");
    }

    #[test]
    fn links_use_fragment() {
        let config = AuthConfig::new("https://app.example.com".to_string());
        assert_eq!(
            config.reset_url("abc"),
            "https://app.example.com/reset-password#token=abc"
        );
        assert_eq!(
            config.verify_url("abc"),
            "https://app.example.com/verify-email#token=abc"
        );
    }

    #[test]
    fn builders_override() {
        let config = AuthConfig::new("http://localhost".to_string())
            .with_reset_token_ttl(Duration::minutes(5))
            .with_rate_limit(RateLimitPolicy {
                max_attempts: 3,
                ip_max_attempts: 9,
                window: Duration::minutes(1),
            })
            .with_default_role("member".to_string());
        assert_eq!(config.reset_token_ttl(), Duration::minutes(5));
        assert_eq!(config.rate_limit().max_attempts, 3);
        assert_eq!(config.default_role(), "member");
    }
}
