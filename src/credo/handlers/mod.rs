pub mod account;
pub mod auth;
pub mod health;
pub mod password;
pub mod sessions;
pub mod types;
mod utils;
pub mod verification;

use crate::auth::{service::Principal, AuthError};
use axum::{
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use secrecy::SecretString;
use tracing::error;
use types::ErrorBody;

use super::ApiState;

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code, field) = match &self {
            Self::InvalidCredentials
            | Self::TokenNotFound
            | Self::TokenExpired
            | Self::TokenReuseDetected => (StatusCode::UNAUTHORIZED, "invalid_credentials", None),
            Self::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate_limited", None),
            Self::AccountLocked => (StatusCode::LOCKED, "account_locked", None),
            Self::ResetTokenInvalid => (StatusCode::BAD_REQUEST, "reset_token_invalid", None),
            Self::ResetTokenUsed => (StatusCode::BAD_REQUEST, "reset_token_used", None),
            Self::PasswordSameAsOld => (StatusCode::BAD_REQUEST, "password_same_as_old", None),
            Self::WeakPassword => (StatusCode::BAD_REQUEST, "weak_password", None),
            Self::InvalidInput(field) => (StatusCode::BAD_REQUEST, "invalid_input", Some(*field)),
            Self::AlreadyExists => (StatusCode::CONFLICT, "already_exists", None),
            Self::Internal(source) => {
                error!("Request failed: {source:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None)
            }
        };
        let body = ErrorBody {
            error: code.to_string(),
            field: field.map(str::to_string),
        };
        (status, Json(body)).into_response()
    }
}

/// Resolve the `Authorization: Bearer` header into the calling principal.
pub(crate) async fn authenticate(
    headers: &HeaderMap,
    state: &ApiState,
) -> Result<Principal, AuthError> {
    let token = utils::extract_bearer_token(headers).ok_or(AuthError::InvalidCredentials)?;
    state.auth().authenticate(&token).await
}

fn secret(value: String) -> SecretString {
    SecretString::from(value)
}

/// Append a cookie that removes the refresh token from the browser.
fn with_cleared_cookie(mut response: Response, secure: bool) -> Response {
    match utils::clear_refresh_cookie(secure) {
        Ok(cookie) => {
            response.headers_mut().append(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to build refresh cookie: {err}"),
    }
    response
}
