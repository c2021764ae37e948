//! Header and cookie helpers shared by the handlers.

use crate::credo::ApiState;
use crate::store::DeviceInfo;
use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::{
        header::{InvalidHeaderValue, AUTHORIZATION, COOKIE, USER_AGENT},
        request::Parts,
        HeaderMap, HeaderValue,
    },
};
use chrono::{DateTime, Utc};
use std::{
    convert::Infallible,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

pub(super) const REFRESH_COOKIE_NAME: &str = "credo_refresh";
const REFRESH_COOKIE_PATH: &str = "/v1/auth";
const MAX_USER_AGENT_LEN: usize = 512;

/// Build the `HttpOnly` refresh cookie. Its lifetime ends exactly when the
/// stored token expires.
pub(super) fn refresh_cookie(
    token: &str,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
    secure: bool,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let max_age = (expires_at - now).num_seconds().max(0);
    let expires = expires_at.format("%a, %d %b %Y %H:%M:%S GMT");
    let mut cookie = format!(
        "{REFRESH_COOKIE_NAME}={token}; Path={REFRESH_COOKIE_PATH}; HttpOnly; SameSite=Strict; Max-Age={max_age}; Expires={expires}"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(super) fn clear_refresh_cookie(secure: bool) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!(
        "{REFRESH_COOKIE_NAME}=; Path={REFRESH_COOKIE_PATH}; HttpOnly; SameSite=Strict; Max-Age=0"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(super) fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|header| header.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| {
            let (key, val) = pair.trim().split_once('=')?;
            (key.trim() == name && !val.trim().is_empty()).then(|| val.trim().to_string())
        })
}

pub(super) fn extract_refresh_token(headers: &HeaderMap) -> Option<String> {
    extract_cookie(headers, REFRESH_COOKIE_NAME)
}

pub(super) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Client address: the forwarding headers when the proxy is trusted,
/// otherwise the socket peer.
pub(super) fn extract_client_ip(
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    trust_forwarded: bool,
) -> Option<String> {
    let peer = peer.map(|ip| ip.to_string());
    if !trust_forwarded {
        return peer;
    }
    forwarded_ip(headers).or(peer)
}

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub(super) fn device_info(
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    trust_forwarded: bool,
) -> DeviceInfo {
    DeviceInfo {
        ip: extract_client_ip(headers, peer, trust_forwarded),
        user_agent: headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(|agent| agent.chars().take(MAX_USER_AGENT_LEN).collect()),
    }
}

/// Address and user agent of the calling client.
pub(crate) struct ClientDevice(pub DeviceInfo);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ClientDevice {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let trust = parts
            .extensions
            .get::<Arc<ApiState>>()
            .is_some_and(|state| state.trust_forwarded());
        Ok(Self(device_info(&parts.headers, peer, trust)))
    }
}
