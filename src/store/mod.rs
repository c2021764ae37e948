//! Persistence boundary for users, token families, sessions, and attempts.
//!
//! Every operation that must be atomic is a single trait method so each
//! backend can wrap it in one transaction (or one lock).

pub mod memory;
pub mod models;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryStore;
pub use models::{
    AttemptKey, DeviceInfo, EmailOtp, FailureReason, LoginAttempt, NewEmailOtp, NewRefreshToken,
    NewUser, OneTimePurpose, OneTimeToken, OpenedFamily, PruneReport, RefreshTokenFamily,
    RefreshTokenRecord, Rotation, User, UserSession,
};
pub use postgres::PgStore;

/// Builds the first token of a family once its id is known.
pub type FirstToken<'a> = &'a (dyn Fn(i64) -> Result<NewRefreshToken> + Send + Sync);

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Returns `None` when the email or username is taken.
    async fn create_user(&self, user: NewUser, now: DateTime<Utc>) -> Result<Option<User>>;

    /// Lookup by email or username (already normalized).
    async fn find_user_by_identifier(&self, identifier: &str) -> Result<Option<User>>;

    async fn find_user_by_id(&self, user_id: i64) -> Result<Option<User>>;

    async fn update_password_hash(&self, user_id: i64, password_hash: &str) -> Result<()>;

    async fn mark_email_verified(&self, user_id: i64) -> Result<()>;

    async fn set_locked(&self, user_id: i64, locked: bool) -> Result<()>;

    async fn soft_delete_user(&self, user_id: i64, now: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Inserts a family, its first token, and its session in one transaction.
    async fn open_family(
        &self,
        user_id: i64,
        device: &DeviceInfo,
        now: DateTime<Utc>,
        first: FirstToken<'_>,
    ) -> Result<OpenedFamily>;

    /// Marks the presented token used and inserts its successor, or revokes
    /// the family when the token was already consumed or its owner can no
    /// longer sign in. One transaction.
    async fn rotate_refresh_token(
        &self,
        presented_hash: &str,
        successor: NewRefreshToken,
        now: DateTime<Utc>,
    ) -> Result<Rotation>;

    async fn find_refresh_token(&self, token_hash: &str) -> Result<Option<RefreshTokenRecord>>;

    async fn find_family(&self, family_id: i64) -> Result<Option<RefreshTokenFamily>>;

    async fn families_for_user(&self, user_id: i64) -> Result<Vec<RefreshTokenFamily>>;

    async fn tokens_in_family(&self, family_id: i64) -> Result<Vec<RefreshTokenRecord>>;

    /// Revokes the family, every token in it, and closes its session.
    /// Returns `false` when the family was already revoked or is unknown.
    async fn revoke_family(&self, family_id: i64, now: DateTime<Utc>) -> Result<bool>;

    /// Deletes tokens of revoked families that expired before `before`.
    /// Tokens of live families stay so a replayed one is still detected.
    async fn prune_refresh_tokens(&self, before: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn find_session(&self, session_id: i64) -> Result<Option<UserSession>>;

    async fn touch_session(&self, session_id: i64, now: DateTime<Utc>) -> Result<()>;

    async fn active_sessions(&self, user_id: i64) -> Result<Vec<UserSession>>;
}

#[async_trait]
pub trait LoginAttemptStore: Send + Sync {
    async fn record_attempt(&self, attempt: &LoginAttempt) -> Result<()>;

    /// Failures for `key` at or after `since`. Identifier keys only count
    /// failures after their latest success; IP keys count every failure.
    async fn count_failed_attempts(&self, key: AttemptKey<'_>, since: DateTime<Utc>)
        -> Result<u32>;

    async fn prune_attempts(&self, before: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait OneTimeTokenStore: Send + Sync {
    async fn insert_one_time_token(
        &self,
        purpose: OneTimePurpose,
        user_id: i64,
        token_hash: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn find_one_time_token(
        &self,
        purpose: OneTimePurpose,
        token_hash: &str,
    ) -> Result<Option<OneTimeToken>>;

    /// Sets `used_at` if unset. Returns `false` when someone else got there first.
    async fn consume_one_time_token(
        &self,
        purpose: OneTimePurpose,
        token_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn prune_one_time_tokens(&self, before: DateTime<Utc>) -> Result<u64>;

    /// Drops earlier codes for the same email and purpose before inserting.
    async fn replace_email_otp(&self, otp: NewEmailOtp, now: DateTime<Utc>) -> Result<EmailOtp>;

    async fn find_email_otp(
        &self,
        email: &str,
        purpose: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EmailOtp>>;

    /// Returns `false` when the code was already consumed.
    async fn delete_email_otp(&self, otp_id: i64) -> Result<bool>;

    async fn prune_email_otps(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// Everything the engine needs from a backend.
pub trait AuthStore:
    UserStore + TokenStore + SessionStore + LoginAttemptStore + OneTimeTokenStore
{
}

impl<T> AuthStore for T where
    T: UserStore + TokenStore + SessionStore + LoginAttemptStore + OneTimeTokenStore
{
}
