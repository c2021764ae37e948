use super::{
    authenticate, secret,
    types::{ChangePasswordRequest, EmailRequest, ErrorBody, ResetPasswordRequest},
    with_cleared_cookie,
};
use crate::auth::AuthError;
use crate::credo::ApiState;
use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::instrument;

#[utoipa::path(
    post,
    path = "/v1/auth/password/change",
    request_body = ChangePasswordRequest,
    responses(
        (status = 204, description = "Password changed; every session revoked"),
        (status = 400, description = "New password rejected", body = ErrorBody),
        (status = 401, description = "Current password or access token invalid", body = ErrorBody),
    ),
    security(("bearer" = [])),
    tag = "password"
)]
#[instrument(skip_all)]
pub async fn change_password(
    headers: HeaderMap,
    state: Extension<Arc<ApiState>>,
    Json(request): Json<ChangePasswordRequest>,
) -> Result<Response, AuthError> {
    let principal = authenticate(&headers, &state).await?;
    state
        .auth()
        .change_password(
            principal.user_id,
            secret(request.current_password),
            secret(request.new_password),
        )
        .await?;
    Ok(with_cleared_cookie(
        StatusCode::NO_CONTENT.into_response(),
        state.cookie_secure(),
    ))
}

#[utoipa::path(
    post,
    path = "/v1/auth/password/forgot",
    request_body = EmailRequest,
    responses(
        (status = 202, description = "Reset link sent if the account exists"),
    ),
    tag = "password"
)]
#[instrument(skip_all)]
pub async fn forgot_password(
    state: Extension<Arc<ApiState>>,
    Json(request): Json<EmailRequest>,
) -> StatusCode {
    state.auth().forgot_password(&request.email).await;
    StatusCode::ACCEPTED
}

#[utoipa::path(
    post,
    path = "/v1/auth/password/reset",
    request_body = ResetPasswordRequest,
    responses(
        (status = 204, description = "Password replaced; every session revoked"),
        (status = 400, description = "Token invalid, used, or password rejected", body = ErrorBody),
    ),
    tag = "password"
)]
#[instrument(skip_all)]
pub async fn reset_password(
    state: Extension<Arc<ApiState>>,
    Json(request): Json<ResetPasswordRequest>,
) -> Result<StatusCode, AuthError> {
    state
        .auth()
        .reset_password(request.token.trim(), secret(request.new_password))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
