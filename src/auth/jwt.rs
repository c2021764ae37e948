//! HS256 bearer tokens with a fixed claim schema.
//!
//! Access and refresh tokens are signed with independent keys and carry a
//! `typ` discriminator, so neither can stand in for the other. Every
//! verification failure collapses into [`InvalidToken`]; the specific cause is
//! only logged.

use anyhow::{anyhow, Context, Result};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;
use tracing::debug;
use ulid::Ulid;

pub const CLAIMS_VERSION: u8 = 1;
const ALG: &str = "HS256";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct TokenHeader {
    alg: String,
    typ: String,
}

impl TokenHeader {
    fn hs256() -> Self {
        Self {
            alg: ALG.to_string(),
            typ: "JWT".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Versioned claim set. Unknown claims are rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Claims {
    pub v: u8,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub typ: TokenKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    /// Public id of the refresh token family.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Public id of the login session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
}

/// Optional named claims an access token may carry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessExtras {
    pub role: Option<String>,
    pub session: Option<String>,
}

/// Verified token contents handed back to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPayload {
    pub subject: String,
    pub kind: TokenKind,
    pub token_id: Option<String>,
    pub family: Option<String>,
    pub role: Option<String>,
    pub session: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub token_id: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid token")]
pub struct InvalidToken;

/// Internal rejection causes, logged but never returned.
#[derive(Debug)]
enum Rejection {
    Format,
    Base64,
    Json,
    Algorithm(String),
    Signature,
    Version,
    Kind(TokenKind),
    Expired,
    Shape(&'static str),
}

impl From<Rejection> for InvalidToken {
    fn from(rejection: Rejection) -> Self {
        debug!(?rejection, "bearer token rejected");
        Self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Expiry {
    Enforce,
    Ignore,
}

#[derive(Clone)]
pub struct TokenSigner {
    access_key: Hmac<Sha256>,
    refresh_key: Hmac<Sha256>,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenSigner {
    /// # Errors
    /// Returns an error if either key is empty or the keys are identical.
    pub fn new(
        access_secret: &SecretString,
        refresh_secret: &SecretString,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Result<Self> {
        let access = access_secret.expose_secret().as_bytes();
        let refresh = refresh_secret.expose_secret().as_bytes();
        anyhow::ensure!(
            !access.is_empty() && !refresh.is_empty(),
            "token signing secrets must not be empty"
        );
        anyhow::ensure!(
            access != refresh,
            "access and refresh signing secrets must differ"
        );
        Ok(Self {
            access_key: Hmac::<Sha256>::new_from_slice(access)
                .map_err(|_| anyhow!("invalid access signing key"))?,
            refresh_key: Hmac::<Sha256>::new_from_slice(refresh)
                .map_err(|_| anyhow!("invalid refresh signing key"))?,
            access_ttl,
            refresh_ttl,
        })
    }

    #[must_use]
    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    #[must_use]
    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    /// # Errors
    /// Returns an error if the claims cannot be encoded.
    pub fn generate_access_token(
        &self,
        subject: &str,
        extras: &AccessExtras,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken> {
        let exp = now.timestamp() + self.access_ttl.num_seconds();
        let claims = Claims {
            v: CLAIMS_VERSION,
            sub: subject.to_string(),
            iat: now.timestamp(),
            exp,
            typ: TokenKind::Access,
            jti: None,
            fid: None,
            role: extras.role.clone(),
            sid: extras.session.clone(),
        };
        Ok(IssuedToken {
            token: sign(&self.access_key, &claims)?,
            token_id: None,
            expires_at: unix_to_datetime(exp)?,
        })
    }

    /// Issue a refresh token with a fresh `jti` for the given family.
    ///
    /// `expires_at` is second-aligned so the stored row and cookie can share it.
    ///
    /// # Errors
    /// Returns an error if the claims cannot be encoded.
    pub fn generate_refresh_token(
        &self,
        subject: &str,
        family: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken> {
        let jti = Ulid::new().to_string();
        let exp = now.timestamp() + self.refresh_ttl.num_seconds();
        let claims = Claims {
            v: CLAIMS_VERSION,
            sub: subject.to_string(),
            iat: now.timestamp(),
            exp,
            typ: TokenKind::Refresh,
            jti: Some(jti.clone()),
            fid: Some(family.to_string()),
            role: None,
            sid: None,
        };
        Ok(IssuedToken {
            token: sign(&self.refresh_key, &claims)?,
            token_id: Some(jti),
            expires_at: unix_to_datetime(exp)?,
        })
    }

    /// # Errors
    /// Returns [`InvalidToken`] for any signature, type, expiry or shape failure.
    pub fn verify_access_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<TokenPayload, InvalidToken> {
        verify(&self.access_key, token, TokenKind::Access, now, Expiry::Enforce)
    }

    /// # Errors
    /// Returns [`InvalidToken`] for any signature, type, expiry or shape failure.
    pub fn verify_refresh_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<TokenPayload, InvalidToken> {
        verify(&self.refresh_key, token, TokenKind::Refresh, now, Expiry::Enforce)
    }

    /// Authenticate a refresh token without judging its expiry.
    ///
    /// Rotation looks at the stored row first so that replay of an expired but
    /// already-rotated token is still caught as reuse.
    pub(crate) fn authenticate_refresh_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<TokenPayload, InvalidToken> {
        verify(&self.refresh_key, token, TokenKind::Refresh, now, Expiry::Ignore)
    }
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}

fn unix_to_datetime(seconds: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0).context("token timestamp out of range")
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value).context("failed to encode token segment")?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(segment: &str) -> Result<T, Rejection> {
    let bytes = Base64UrlUnpadded::decode_vec(segment).map_err(|_| Rejection::Base64)?;
    serde_json::from_slice(&bytes).map_err(|_| Rejection::Json)
}

fn sign(key: &Hmac<Sha256>, claims: &Claims) -> Result<String> {
    let signing_input = format!("{}.{}", b64e_json(&TokenHeader::hs256())?, b64e_json(claims)?);
    let mut mac = key.clone();
    mac.update(signing_input.as_bytes());
    let signature = Base64UrlUnpadded::encode_string(&mac.finalize().into_bytes());
    Ok(format!("{signing_input}.{signature}"))
}

fn verify(
    key: &Hmac<Sha256>,
    token: &str,
    expected: TokenKind,
    now: DateTime<Utc>,
    expiry: Expiry,
) -> Result<TokenPayload, InvalidToken> {
    let mut parts = token.split('.');
    let header_b64 = parts.next().ok_or(Rejection::Format)?;
    let claims_b64 = parts.next().ok_or(Rejection::Format)?;
    let sig_b64 = parts.next().ok_or(Rejection::Format)?;
    if parts.next().is_some() {
        return Err(Rejection::Format.into());
    }

    let header: TokenHeader = b64d_json(header_b64)?;
    if header.alg != ALG {
        return Err(Rejection::Algorithm(header.alg).into());
    }

    let signature = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| Rejection::Base64)?;
    let mut mac = key.clone();
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(claims_b64.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| Rejection::Signature)?;

    let claims: Claims = b64d_json(claims_b64)?;
    if claims.v != CLAIMS_VERSION {
        return Err(Rejection::Version.into());
    }
    if claims.typ != expected {
        return Err(Rejection::Kind(claims.typ).into());
    }
    if expiry == Expiry::Enforce && claims.exp <= now.timestamp() {
        return Err(Rejection::Expired.into());
    }
    check_shape(&claims)?;

    Ok(TokenPayload {
        subject: claims.sub,
        kind: claims.typ,
        token_id: claims.jti,
        family: claims.fid,
        role: claims.role,
        session: claims.sid,
        issued_at: DateTime::from_timestamp(claims.iat, 0).ok_or(Rejection::Shape("iat"))?,
        expires_at: DateTime::from_timestamp(claims.exp, 0).ok_or(Rejection::Shape("exp"))?,
    })
}

fn check_shape(claims: &Claims) -> Result<(), Rejection> {
    if claims.sub.is_empty() {
        return Err(Rejection::Shape("sub"));
    }
    if claims.exp <= claims.iat {
        return Err(Rejection::Shape("exp before iat"));
    }
    match claims.typ {
        TokenKind::Access => {
            if claims.jti.is_some() || claims.fid.is_some() {
                return Err(Rejection::Shape("refresh claims on access token"));
            }
        }
        TokenKind::Refresh => {
            let jti = claims.jti.as_deref().ok_or(Rejection::Shape("jti"))?;
            Ulid::from_string(jti).map_err(|_| Rejection::Shape("jti"))?;
            if claims.fid.as_deref().is_none_or(str::is_empty) {
                return Err(Rejection::Shape("fid"));
            }
            if claims.role.is_some() || claims.sid.is_some() {
                return Err(Rejection::Shape("access claims on refresh token"));
            }
        }
    }
    Ok(())
}
