//! Error taxonomy surfaced by the auth boundary.
//!
//! Callers only ever see one of these kinds. Store and crypto failures are
//! folded into [`AuthError::Internal`], whose `Display` carries no detail; the
//! source chain is logged where the error is produced.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Unknown identifier or wrong password. The two are never distinguished.
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("too many attempts")]
    RateLimited,
    #[error("account locked")]
    AccountLocked,
    #[error("token not found")]
    TokenNotFound,
    #[error("token expired")]
    TokenExpired,
    /// Raised only after the family of the presented token has been revoked.
    #[error("token reuse detected")]
    TokenReuseDetected,
    #[error("reset token invalid")]
    ResetTokenInvalid,
    #[error("reset token already used")]
    ResetTokenUsed,
    #[error("new password must differ from the current one")]
    PasswordSameAsOld,
    #[error("password does not meet the policy")]
    WeakPassword,
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("account already exists")]
    AlreadyExists,
    #[error("internal failure")]
    Internal(#[source] anyhow::Error),
}

impl AuthError {
    /// Errors that share the generic "authentication failed" response class.
    #[must_use]
    pub fn is_generic_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredentials
                | Self::TokenNotFound
                | Self::TokenExpired
                | Self::TokenReuseDetected
        )
    }
}

impl From<anyhow::Error> for AuthError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

pub type AuthResult<T> = Result<T, AuthError>;
