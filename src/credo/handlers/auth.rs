//! Registration, login, refresh rotation, and logout.
//!
//! Refresh tokens travel in the `credo_refresh` cookie scoped to `/v1/auth`.
//! Clients without cookie support may send the token in the JSON body instead.

use super::{
    authenticate, secret,
    types::{
        AccountResponse, ErrorBody, LoginRequest, LoginResponse, LogoutAllResponse,
        RefreshRequest, RegisterRequest, TokenResponse,
    },
    utils::{extract_refresh_token, refresh_cookie, ClientDevice},
    with_cleared_cookie,
};
use crate::auth::{
    service::{self, Registration},
    AuthError, IssuedCredentials,
};
use crate::credo::ApiState;
use axum::{
    extract::Extension,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, instrument};

#[utoipa::path(
    post,
    path = "/v1/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created, verification email sent", body = AccountResponse),
        (status = 400, description = "Invalid email, username, or password", body = ErrorBody),
        (status = 409, description = "Email or username already taken", body = ErrorBody),
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn register(
    state: Extension<Arc<ApiState>>,
    Json(request): Json<RegisterRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let account = state
        .auth()
        .register(Registration {
            email: request.email,
            username: request.username,
            password: secret(request.password),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(AccountResponse::from(account))))
}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Authenticated; refresh token also set as cookie", body = LoginResponse),
        (status = 401, description = "Invalid credentials", body = ErrorBody),
        (status = 423, description = "Account locked", body = ErrorBody),
        (status = 429, description = "Too many failed attempts", body = ErrorBody),
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn login(
    ClientDevice(device): ClientDevice,
    state: Extension<Arc<ApiState>>,
    Json(request): Json<LoginRequest>,
) -> Result<Response, AuthError> {
    let outcome = state
        .auth()
        .login(service::LoginRequest {
            identifier: request.identifier,
            password: secret(request.password),
            device,
        })
        .await?;

    let now = Utc::now();
    let body = LoginResponse {
        user: AccountResponse::from(outcome.account),
        tokens: TokenResponse::new(&outcome.credentials, now),
    };
    Ok(with_refresh_cookie(
        Json(body).into_response(),
        &outcome.credentials,
        state.cookie_secure(),
    ))
}

#[utoipa::path(
    post,
    path = "/v1/auth/refresh",
    request_body(content = RefreshRequest, description = "Only needed without the refresh cookie"),
    responses(
        (status = 200, description = "Token rotated", body = TokenResponse),
        (status = 401, description = "Refresh token invalid, expired, or reused", body = ErrorBody),
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn refresh(
    headers: HeaderMap,
    ClientDevice(device): ClientDevice,
    state: Extension<Arc<ApiState>>,
    body: Option<Json<RefreshRequest>>,
) -> Response {
    let Some(token) = presented_refresh_token(&headers, body) else {
        return with_cleared_cookie(
            AuthError::TokenNotFound.into_response(),
            state.cookie_secure(),
        );
    };

    match state.auth().refresh(&token, &device).await {
        Ok(credentials) => with_refresh_cookie(
            Json(TokenResponse::new(&credentials, Utc::now())).into_response(),
            &credentials,
            state.cookie_secure(),
        ),
        Err(err) if err.is_generic_auth_failure() => {
            with_cleared_cookie(err.into_response(), state.cookie_secure())
        }
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    request_body(content = RefreshRequest, description = "Only needed without the refresh cookie"),
    responses(
        (status = 204, description = "Session closed; cookie cleared"),
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn logout(
    headers: HeaderMap,
    state: Extension<Arc<ApiState>>,
    body: Option<Json<RefreshRequest>>,
) -> Result<Response, AuthError> {
    if let Some(token) = presented_refresh_token(&headers, body) {
        state.auth().logout(&token).await?;
    }
    // Always clear the cookie, even if the token was unknown.
    Ok(with_cleared_cookie(
        StatusCode::NO_CONTENT.into_response(),
        state.cookie_secure(),
    ))
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout-all",
    responses(
        (status = 200, description = "Every session of the caller closed", body = LogoutAllResponse),
        (status = 401, description = "Missing or invalid access token", body = ErrorBody),
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn logout_all(
    headers: HeaderMap,
    state: Extension<Arc<ApiState>>,
) -> Result<Response, AuthError> {
    let principal = authenticate(&headers, &state).await?;
    let revoked = state.auth().logout_all(principal.user_id).await?;
    Ok(with_cleared_cookie(
        Json(LogoutAllResponse { revoked }).into_response(),
        state.cookie_secure(),
    ))
}

fn presented_refresh_token(
    headers: &HeaderMap,
    body: Option<Json<RefreshRequest>>,
) -> Option<String> {
    extract_refresh_token(headers).or_else(|| {
        body.and_then(|Json(request)| request.refresh_token)
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
    })
}

fn with_refresh_cookie(
    mut response: Response,
    credentials: &IssuedCredentials,
    secure: bool,
) -> Response {
    match refresh_cookie(
        &credentials.refresh_token,
        credentials.refresh_expires_at,
        Utc::now(),
        secure,
    ) {
        Ok(cookie) => {
            response.headers_mut().append(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to build refresh cookie: {err}"),
    }
    response
}
