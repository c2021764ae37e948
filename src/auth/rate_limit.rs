//! Failed-login throttling.
//!
//! Counting is pluggable through [`AttemptCounter`]. The store-backed counter
//! derives counts from the append-only `login_attempts` audit rows: a failure
//! appends a row, a success appends a success row that hides earlier failures
//! of the same identifier. Per-IP counts ignore successes, so logging into one
//! account does not reset a spray against others. History is never rewritten.
//!
//! Any error while checking the limit is treated as *limited*.

use super::{bounded, clock::Clock, config::RateLimitPolicy};
use crate::store::{AttemptKey, LoginAttempt, LoginAttemptStore};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

#[async_trait]
pub trait AttemptCounter: Send + Sync {
    async fn record(&self, attempt: &LoginAttempt) -> Result<()>;

    /// Failures for `key` at or after `since`. For identifier keys only those
    /// after the latest success count.
    async fn failures_since(&self, key: AttemptKey<'_>, since: DateTime<Utc>) -> Result<u32>;
}

/// Counts from the persistent audit trail. Shared across processes.
pub struct StoreAttemptCounter<S: ?Sized = dyn LoginAttemptStore> {
    store: Arc<S>,
}

impl<S: ?Sized + LoginAttemptStore> StoreAttemptCounter<S> {
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: ?Sized + LoginAttemptStore + 'static> AttemptCounter for StoreAttemptCounter<S> {
    async fn record(&self, attempt: &LoginAttempt) -> Result<()> {
        self.store.record_attempt(attempt).await
    }

    async fn failures_since(&self, key: AttemptKey<'_>, since: DateTime<Utc>) -> Result<u32> {
        self.store.count_failed_attempts(key, since).await
    }
}

/// Process-local counter for single-instance deployments.
///
/// Keeps failure timestamps per identifier and per IP; entries older than
/// `retention` are dropped whenever a new attempt is recorded.
pub struct MemoryAttemptCounter {
    retention: chrono::Duration,
    failures: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl MemoryAttemptCounter {
    #[must_use]
    pub fn new(retention: chrono::Duration) -> Self {
        Self {
            retention,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

fn counter_key(key: AttemptKey<'_>) -> String {
    match key {
        AttemptKey::Identifier(identifier) => format!("id:{identifier}"),
        AttemptKey::Ip(ip) => format!("ip:{ip}"),
    }
}

fn attempt_keys(attempt: &LoginAttempt) -> Vec<String> {
    let mut keys = vec![counter_key(AttemptKey::Identifier(&attempt.identifier))];
    if let Some(ip) = attempt.ip.as_deref() {
        keys.push(counter_key(AttemptKey::Ip(ip)));
    }
    keys
}

#[async_trait]
impl AttemptCounter for MemoryAttemptCounter {
    async fn record(&self, attempt: &LoginAttempt) -> Result<()> {
        let mut failures = self.failures.lock().await;
        let horizon = attempt.attempted_at - self.retention;
        failures.retain(|_, times| {
            times.retain(|at| *at >= horizon);
            !times.is_empty()
        });

        if attempt.success {
            failures.remove(&counter_key(AttemptKey::Identifier(&attempt.identifier)));
        } else {
            for key in attempt_keys(attempt) {
                failures.entry(key).or_default().push(attempt.attempted_at);
            }
        }
        Ok(())
    }

    async fn failures_since(&self, key: AttemptKey<'_>, since: DateTime<Utc>) -> Result<u32> {
        let failures = self.failures.lock().await;
        let count = failures
            .get(&counter_key(key))
            .map_or(0, |times| times.iter().filter(|at| **at >= since).count());
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}

/// Decides whether a login may proceed and records its outcome.
pub struct LoginGuard {
    counter: Arc<dyn AttemptCounter>,
    policy: RateLimitPolicy,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl LoginGuard {
    #[must_use]
    pub fn new(
        counter: Arc<dyn AttemptCounter>,
        policy: RateLimitPolicy,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            counter,
            policy,
            clock,
            timeout,
        }
    }

    #[must_use]
    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    async fn exceeded(&self, key: AttemptKey<'_>, max: u32) -> bool {
        let since = self.clock.now() - self.policy.window;
        match bounded(
            self.timeout,
            "count login failures",
            self.counter.failures_since(key, since),
        )
        .await
        {
            Ok(failures) => failures >= max,
            Err(err) => {
                error!("Rate limit check failed, refusing login: {err:#}");
                true
            }
        }
    }

    /// True once `max_attempts` failures fall inside the window.
    pub async fn is_rate_limited(&self, identifier: &str) -> bool {
        self.exceeded(AttemptKey::Identifier(identifier), self.policy.max_attempts)
            .await
    }

    pub async fn is_ip_rate_limited(&self, ip: &str) -> bool {
        self.exceeded(AttemptKey::Ip(ip), self.policy.ip_max_attempts)
            .await
    }

    pub async fn check(&self, identifier: &str, ip: Option<&str>) -> RateLimitDecision {
        if self.is_rate_limited(identifier).await {
            return RateLimitDecision::Limited;
        }
        if let Some(ip) = ip {
            if self.is_ip_rate_limited(ip).await {
                return RateLimitDecision::Limited;
            }
        }
        RateLimitDecision::Allowed
    }

    pub async fn record_failed_attempt(&self, attempt: &LoginAttempt) {
        if let Err(err) = bounded(
            self.timeout,
            "record login failure",
            self.counter.record(attempt),
        )
        .await
        {
            warn!("Failed to record login failure: {err:#}");
        }
    }

    /// Records a success, which clears the failure count for the identifier.
    /// The per-IP count is left alone.
    pub async fn reset_attempts(&self, attempt: &LoginAttempt) {
        if let Err(err) = bounded(
            self.timeout,
            "record login success",
            self.counter.record(attempt),
        )
        .await
        {
            warn!("Failed to record login success: {err:#}");
        }
    }
}
