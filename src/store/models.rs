//! Records persisted by the auth engine.

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub role: String,
    pub locked: bool,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub role: String,
}

/// Client metadata captured with tokens, sessions, and attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenFamily {
    pub id: i64,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl RefreshTokenFamily {
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// One link of a family. Only the keyed hash of the token is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenRecord {
    pub id: i64,
    pub family_id: i64,
    pub user_id: i64,
    pub jti: String,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub used_at: Option<DateTime<Utc>>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl RefreshTokenRecord {
    /// Still eligible for rotation, ignoring expiry.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.revoked_at.is_none() && self.used_at.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct NewRefreshToken {
    pub jti: String,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub device: DeviceInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSession {
    pub id: i64,
    pub user_id: i64,
    pub family_id: i64,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub login_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub logout_at: Option<DateTime<Utc>>,
}

impl UserSession {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.logout_at.is_none()
    }
}

/// Rows written together when a login opens a family.
#[derive(Debug, Clone)]
pub struct OpenedFamily {
    pub family: RefreshTokenFamily,
    pub token: RefreshTokenRecord,
    pub session: UserSession,
}

/// Result of the atomic rotation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rotation {
    Rotated {
        user_id: i64,
        /// Owner's role at rotation time, for the new access token.
        role: String,
        family_id: i64,
        session_id: Option<i64>,
        successor: RefreshTokenRecord,
    },
    /// The owner is locked, deleted or gone; the family is now revoked.
    Refused {
        user_id: i64,
        family_id: i64,
        locked: bool,
    },
    NotFound,
    /// The presented token was already used or revoked; its family is now revoked.
    Reused { user_id: i64, family_id: i64 },
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    UnknownIdentifier,
    BadPassword,
    AccountLocked,
    /// Wrong one-time code.
    InvalidCode,
}

impl FailureReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownIdentifier => "unknown_identifier",
            Self::BadPassword => "bad_password",
            Self::AccountLocked => "account_locked",
            Self::InvalidCode => "invalid_code",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown_identifier" => Ok(Self::UnknownIdentifier),
            "bad_password" => Ok(Self::BadPassword),
            "account_locked" => Ok(Self::AccountLocked),
            "invalid_code" => Ok(Self::InvalidCode),
            other => Err(format!("unknown failure reason: {other}")),
        }
    }
}

/// Append-only audit row; also the source for attempt counting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAttempt {
    pub identifier: String,
    pub user_id: Option<i64>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub success: bool,
    pub failure_reason: Option<FailureReason>,
    pub attempted_at: DateTime<Utc>,
}

impl LoginAttempt {
    #[must_use]
    pub fn failure(
        identifier: &str,
        user_id: Option<i64>,
        device: &DeviceInfo,
        reason: FailureReason,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            identifier: identifier.to_string(),
            user_id,
            ip: device.ip.clone(),
            user_agent: device.user_agent.clone(),
            success: false,
            failure_reason: Some(reason),
            attempted_at: at,
        }
    }

    #[must_use]
    pub fn success(identifier: &str, user_id: i64, device: &DeviceInfo, at: DateTime<Utc>) -> Self {
        Self {
            identifier: identifier.to_string(),
            user_id: Some(user_id),
            ip: device.ip.clone(),
            user_agent: device.user_agent.clone(),
            success: true,
            failure_reason: None,
            attempted_at: at,
        }
    }
}

/// What a login attempt is counted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptKey<'a> {
    Identifier(&'a str),
    Ip(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OneTimePurpose {
    PasswordReset,
    EmailVerification,
}

/// Password reset and email verification secrets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneTimeToken {
    pub id: i64,
    pub purpose: OneTimePurpose,
    pub user_id: i64,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailOtp {
    pub id: i64,
    pub email: String,
    pub purpose: String,
    pub otp_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewEmailOtp {
    pub email: String,
    pub purpose: String,
    pub otp_hash: String,
    pub expires_at: DateTime<Utc>,
    pub device: DeviceInfo,
}

/// Rows removed by a maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub refresh_tokens: u64,
    pub one_time_tokens: u64,
    pub email_otps: u64,
    pub login_attempts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reason_round_trip() {
        for reason in [
            FailureReason::UnknownIdentifier,
            FailureReason::BadPassword,
            FailureReason::AccountLocked,
            FailureReason::InvalidCode,
        ] {
            assert_eq!(reason.as_str().parse::<FailureReason>(), Ok(reason));
        }
        assert!("nope".parse::<FailureReason>().is_err());
    }
}
