use super::{
    authenticate, secret,
    types::{AccountResponse, DeleteAccountRequest, ErrorBody},
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
    get,
    path = "/v1/me",
    responses(
        (status = 200, description = "The caller's account", body = AccountResponse),
        (status = 401, description = "Missing or invalid access token", body = ErrorBody),
    ),
    security(("bearer" = [])),
    tag = "account"
)]
#[instrument(skip_all)]
pub async fn me(
    headers: HeaderMap,
    state: Extension<Arc<ApiState>>,
) -> Result<Json<AccountResponse>, AuthError> {
    let principal = authenticate(&headers, &state).await?;
    let account = state.auth().account(principal.user_id).await?;
    Ok(Json(AccountResponse::from(account)))
}

#[utoipa::path(
    delete,
    path = "/v1/me",
    request_body = DeleteAccountRequest,
    responses(
        (status = 204, description = "Account deleted; every session revoked"),
        (status = 401, description = "Password or access token invalid", body = ErrorBody),
    ),
    security(("bearer" = [])),
    tag = "account"
)]
#[instrument(skip_all)]
pub async fn delete_me(
    headers: HeaderMap,
    state: Extension<Arc<ApiState>>,
    Json(request): Json<DeleteAccountRequest>,
) -> Result<Response, AuthError> {
    let principal = authenticate(&headers, &state).await?;
    state
        .auth()
        .delete_account(principal.user_id, secret(request.password))
        .await?;
    Ok(with_cleared_cookie(
        StatusCode::NO_CONTENT.into_response(),
        state.cookie_secure(),
    ))
}
