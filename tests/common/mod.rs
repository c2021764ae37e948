//! Shared harness for the integration scenarios.
//!
//! Runs against the in-memory store, or against Postgres when
//! `CREDO_TEST_DSN` is set.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use credo::auth::{
    service::{AccountSummary, LoginOutcome, LoginRequest, Registration},
    Argon2Params, AttemptCounter, StoreAttemptCounter, AuthConfig, AuthResult, AuthService, HashingPool, Keyring, ManualClock,
    PasswordConfig, PasswordHasher, PublicIdCodec, RateLimitPolicy, SecretHasher, TokenSigner,
};
use credo::email::{EmailMessage, EmailSender, EmailTemplate};
use credo::store::{
    AttemptKey, AuthStore, DeviceInfo, FailureReason, LoginAttempt, MemoryStore, PgStore,
};
use secrecy::SecretString;
use std::sync::Arc;
use tokio::sync::Mutex;
use ulid::Ulid;

pub const PASSWORD: &str = "correct horse battery";

/// Records every message instead of delivering it.
#[derive(Default)]
pub struct CapturingMailer {
    sent: Mutex<Vec<EmailMessage>>,
}

impl CapturingMailer {
    pub async fn last_for(&self, email: &str, template: EmailTemplate) -> Option<EmailMessage> {
        self.sent
            .lock()
            .await
            .iter()
            .rev()
            .find(|m| m.to_email == email && m.template == template)
            .cloned()
    }

    pub async fn count(&self, template: EmailTemplate) -> usize {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|m| m.template == template)
            .count()
    }

    /// Secret carried in the fragment of a link, e.g. `.../reset-password#token=...`.
    pub async fn link_token(&self, email: &str, template: EmailTemplate) -> Result<String> {
        let message = self
            .last_for(email, template)
            .await
            .ok_or_else(|| anyhow!("no {} mail for {email}", template.as_str()))?;
        let key = match template {
            EmailTemplate::PasswordReset => "reset_url",
            _ => "verify_url",
        };
        let url = message.payload[key]
            .as_str()
            .ok_or_else(|| anyhow!("mail without {key}"))?;
        url.split_once("#token=")
            .map(|(_, token)| token.to_string())
            .ok_or_else(|| anyhow!("link without token: {url}"))
    }

    pub async fn otp_code(&self, email: &str) -> Result<String> {
        let message = self
            .last_for(email, EmailTemplate::OneTimeCode)
            .await
            .ok_or_else(|| anyhow!("no code mail for {email}"))?;
        message.payload["code"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("mail without code"))
    }
}

#[async_trait]
impl EmailSender for CapturingMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        self.sent.lock().await.push(message.clone());
        Ok(())
    }
}

/// Store-backed attempt counting that also keeps what was recorded.
pub struct RecordingCounter {
    inner: StoreAttemptCounter<dyn AuthStore>,
    seen: Mutex<Vec<LoginAttempt>>,
}

impl RecordingCounter {
    fn new(store: Arc<dyn AuthStore>) -> Self {
        Self {
            inner: StoreAttemptCounter::new(store),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Failure reasons recorded for `identifier`, oldest first.
    pub async fn failure_reasons(&self, identifier: &str) -> Vec<FailureReason> {
        self.seen
            .lock()
            .await
            .iter()
            .filter(|attempt| attempt.identifier == identifier)
            .filter_map(|attempt| attempt.failure_reason)
            .collect()
    }
}

#[async_trait]
impl AttemptCounter for RecordingCounter {
    async fn record(&self, attempt: &LoginAttempt) -> Result<()> {
        self.seen.lock().await.push(attempt.clone());
        self.inner.record(attempt).await
    }

    async fn failures_since(&self, key: AttemptKey<'_>, since: DateTime<Utc>) -> Result<u32> {
        self.inner.failures_since(key, since).await
    }
}

pub struct Harness {
    pub auth: Arc<AuthService>,
    pub clock: ManualClock,
    pub mailer: Arc<CapturingMailer>,
    pub keys: Arc<Keyring>,
    pub attempts: Arc<RecordingCounter>,
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

/// Unique per call so scenarios never collide on a shared database.
pub fn unique(prefix: &str) -> String {
    format!("{prefix}{}", Ulid::new().to_string().to_lowercase())
}

/// Per-scenario client address; the attempts table outlives a single run.
pub fn unique_ip() -> String {
    unique("ip-")
}

pub fn device(ip: &str) -> DeviceInfo {
    DeviceInfo {
        ip: Some(ip.to_string()),
        user_agent: Some("integration-test".to_string()),
    }
}

pub fn secret(value: &str) -> SecretString {
    SecretString::from(value.to_string())
}

fn keyring() -> Result<Keyring> {
    Ok(Keyring::new(
        TokenSigner::new(
            &secret("test-access-secret"),
            &secret("test-refresh-secret"),
            chrono::Duration::minutes(15),
            chrono::Duration::days(7),
        )?,
        PublicIdCodec::new(&[42u8; 32])?,
        SecretHasher::new(&secret("test-token-hash"))?,
    ))
}

fn hashing_pool() -> HashingPool {
    let params = Argon2Params {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
        ..Argon2Params::default()
    };
    HashingPool::new(
        PasswordHasher::new(PasswordConfig::new(1, secret("test-pepper")).with_params(params)),
        2,
    )
}

async fn store() -> Result<Arc<dyn AuthStore>> {
    match std::env::var("CREDO_TEST_DSN") {
        Ok(dsn) => {
            let store = PgStore::connect(&dsn, 5).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        Err(_) => Ok(Arc::new(MemoryStore::new())),
    }
}

impl Harness {
    pub async fn new() -> Result<Self> {
        Self::with_policy(RateLimitPolicy::default()).await
    }

    pub async fn with_policy(policy: RateLimitPolicy) -> Result<Self> {
        let clock = ManualClock::new(start_time());
        let mailer = Arc::new(CapturingMailer::default());
        let keys = Arc::new(keyring()?);
        let config =
            AuthConfig::new("https://app.example.com/".to_string()).with_rate_limit(policy);
        let store = store().await?;
        let attempts = Arc::new(RecordingCounter::new(Arc::clone(&store)));
        let auth = AuthService::builder(store, Arc::clone(&keys), hashing_pool(), config)
            .with_clock(Arc::new(clock.clone()))
            .with_mailer(mailer.clone())
            .with_attempt_counter(attempts.clone())
            .build();
        Ok(Self {
            auth: Arc::new(auth),
            clock,
            mailer,
            keys,
            attempts,
        })
    }

    /// Register a fresh account and return its summary.
    pub async fn register(&self) -> Result<AccountSummary> {
        let username = unique("u");
        let account = self
            .auth
            .register(Registration {
                email: format!("{username}@example.com"),
                username,
                password: secret(PASSWORD),
            })
            .await?;
        Ok(account)
    }

    /// Internal key behind a public id. Public ids are re-encoded with a
    /// fresh nonce each time, so compare these instead.
    pub fn key_of(&self, public_id: &str) -> Result<i64> {
        Ok(self.keys.ids.decode_key(public_id)?)
    }

    pub async fn login(
        &self,
        identifier: &str,
        password: &str,
        ip: &str,
    ) -> AuthResult<LoginOutcome> {
        self.auth
            .login(LoginRequest {
                identifier: identifier.to_string(),
                password: secret(password),
                device: device(ip),
            })
            .await
    }
}
