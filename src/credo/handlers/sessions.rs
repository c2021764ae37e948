use super::{
    authenticate,
    types::{ErrorBody, SessionResponse},
    utils::extract_refresh_token,
};
use crate::auth::AuthError;
use crate::credo::ApiState;
use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;
use tracing::instrument;

#[utoipa::path(
    get,
    path = "/v1/me/sessions",
    responses(
        (status = 200, description = "Open sessions, most recently seen first", body = [SessionResponse]),
        (status = 401, description = "Missing or invalid access token", body = ErrorBody),
    ),
    security(("bearer" = [])),
    tag = "sessions"
)]
#[instrument(skip_all)]
pub async fn list_sessions(
    headers: HeaderMap,
    state: Extension<Arc<ApiState>>,
) -> Result<Json<Vec<SessionResponse>>, AuthError> {
    let principal = authenticate(&headers, &state).await?;
    // Browsers only send the refresh cookie to /v1/auth; API clients may
    // still pass it here.
    let refresh_token = extract_refresh_token(&headers);
    let sessions = state
        .auth()
        .active_sessions(&principal, refresh_token.as_deref())
        .await?;
    Ok(Json(sessions.into_iter().map(SessionResponse::from).collect()))
}

#[utoipa::path(
    delete,
    path = "/v1/me/sessions/{id}",
    params(("id" = String, Path, description = "Public session id")),
    responses(
        (status = 204, description = "Session closed"),
        (status = 401, description = "Missing or invalid access token", body = ErrorBody),
        (status = 404, description = "No such open session"),
    ),
    security(("bearer" = [])),
    tag = "sessions"
)]
#[instrument(skip_all)]
pub async fn revoke_session(
    headers: HeaderMap,
    Path(id): Path<String>,
    state: Extension<Arc<ApiState>>,
) -> Result<StatusCode, AuthError> {
    let principal = authenticate(&headers, &state).await?;
    if state.auth().logout_session(principal.user_id, &id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}
