//! Email verification links and one-time codes.

use super::{
    types::{EmailRequest, ErrorBody, OtpIssueRequest, OtpVerifyRequest, TokenRequest},
    utils::ClientDevice,
};
use crate::auth::AuthError;
use crate::credo::ApiState;
use axum::{
    extract::Extension,
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::instrument;

const MAX_PURPOSE_LEN: usize = 64;

#[utoipa::path(
    post,
    path = "/v1/auth/verify-email",
    request_body = TokenRequest,
    responses(
        (status = 204, description = "Email verified"),
        (status = 401, description = "Token invalid, expired, or used", body = ErrorBody),
    ),
    tag = "verification"
)]
#[instrument(skip_all)]
pub async fn verify_email(
    state: Extension<Arc<ApiState>>,
    Json(request): Json<TokenRequest>,
) -> Result<StatusCode, AuthError> {
    state.auth().verify_email(request.token.trim()).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/v1/auth/verify-email/resend",
    request_body = EmailRequest,
    responses(
        (status = 202, description = "Verification link sent if the account needs one"),
    ),
    tag = "verification"
)]
#[instrument(skip_all)]
pub async fn resend_verification(
    state: Extension<Arc<ApiState>>,
    Json(request): Json<EmailRequest>,
) -> StatusCode {
    state.auth().resend_verification(&request.email).await;
    StatusCode::ACCEPTED
}

#[utoipa::path(
    post,
    path = "/v1/auth/otp",
    request_body = OtpIssueRequest,
    responses(
        (status = 202, description = "Code sent"),
        (status = 400, description = "Invalid email or purpose", body = ErrorBody),
    ),
    tag = "verification"
)]
#[instrument(skip_all)]
pub async fn issue_otp(
    ClientDevice(device): ClientDevice,
    state: Extension<Arc<ApiState>>,
    Json(request): Json<OtpIssueRequest>,
) -> Result<StatusCode, AuthError> {
    let purpose = valid_purpose(&request.purpose)?;
    state
        .auth()
        .issue_email_otp(&request.email, purpose, &device)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

#[utoipa::path(
    post,
    path = "/v1/auth/otp/verify",
    request_body = OtpVerifyRequest,
    responses(
        (status = 204, description = "Code accepted and consumed"),
        (status = 401, description = "Code wrong, expired, or used", body = ErrorBody),
        (status = 429, description = "Too many wrong codes", body = ErrorBody),
    ),
    tag = "verification"
)]
#[instrument(skip_all)]
pub async fn verify_otp(
    ClientDevice(device): ClientDevice,
    state: Extension<Arc<ApiState>>,
    Json(request): Json<OtpVerifyRequest>,
) -> Result<StatusCode, AuthError> {
    let purpose = valid_purpose(&request.purpose)?;
    state
        .auth()
        .verify_email_otp(&request.email, purpose, &request.code, &device)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

fn valid_purpose(purpose: &str) -> Result<&str, AuthError> {
    let purpose = purpose.trim();
    let ok = !purpose.is_empty()
        && purpose.len() <= MAX_PURPOSE_LEN
        && purpose
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if ok {
        Ok(purpose)
    } else {
        Err(AuthError::InvalidInput("purpose"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purpose_must_be_a_slug() {
        assert_eq!(valid_purpose(" login ").ok(), Some("login"));
        assert!(valid_purpose("email_change").is_ok());
        assert!(valid_purpose("").is_err());
        assert!(valid_purpose("Login").is_err());
        assert!(valid_purpose("a:b").is_err());
        assert!(valid_purpose(&"x".repeat(65)).is_err());
    }
}
