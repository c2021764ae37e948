//! Request and response bodies of the HTTP API.
//!
//! Request types carrying passwords or tokens do not derive `Debug`.

use crate::auth::{service::AccountSummary, ActiveSession, IssuedCredentials};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

#[derive(ToSchema, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AccountResponse {
    pub id: String,
    pub email: String,
    pub username: String,
    pub role: String,
    pub email_verified: bool,
}

impl From<AccountSummary> for AccountResponse {
    fn from(account: AccountSummary) -> Self {
        Self {
            id: account.id,
            email: account.email,
            username: account.username,
            role: account.role,
            email_verified: account.email_verified,
        }
    }
}

#[derive(ToSchema, Deserialize)]
pub struct LoginRequest {
    /// Email or username.
    pub identifier: String,
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    /// Seconds until the access token expires.
    pub expires_in: i64,
    /// Also set as an `HttpOnly` cookie for browser clients.
    pub refresh_token: String,
    pub refresh_expires_at: DateTime<Utc>,
}

impl TokenResponse {
    #[must_use]
    pub fn new(credentials: &IssuedCredentials, now: DateTime<Utc>) -> Self {
        Self {
            access_token: credentials.access_token.clone(),
            token_type: "Bearer".to_string(),
            expires_at: credentials.access_expires_at,
            expires_in: (credentials.access_expires_at - now).num_seconds().max(0),
            refresh_token: credentials.refresh_token.clone(),
            refresh_expires_at: credentials.refresh_expires_at,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone)]
pub struct LoginResponse {
    pub user: AccountResponse,
    pub tokens: TokenResponse,
}

/// Optional body for clients that cannot use the refresh cookie.
#[derive(ToSchema, Deserialize, Default)]
pub struct RefreshRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogoutAllResponse {
    pub revoked: usize,
}

#[derive(ToSchema, Deserialize)]
pub struct TokenRequest {
    pub token: String,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(ToSchema, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub new_password: String,
}

#[derive(ToSchema, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct OtpIssueRequest {
    pub email: String,
    pub purpose: String,
}

#[derive(ToSchema, Deserialize)]
pub struct OtpVerifyRequest {
    pub email: String,
    pub purpose: String,
    pub code: String,
}

#[derive(ToSchema, Deserialize)]
pub struct DeleteAccountRequest {
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionResponse {
    pub id: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub login_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub current: bool,
}

impl From<ActiveSession> for SessionResponse {
    fn from(session: ActiveSession) -> Self {
        Self {
            id: session.id,
            ip: session.ip,
            user_agent: session.user_agent,
            login_at: session.login_at,
            last_seen_at: session.last_seen_at,
            current: session.current,
        }
    }
}
