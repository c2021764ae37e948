//! Refresh token families.
//!
//! A family is opened at login and grows one token per rotation. At most one
//! token per family is live. Presenting a consumed token revokes the family
//! inside the same transaction that detected the replay, so the caller can
//! never observe the error without the revocation having happened.

use super::{bounded, clock::Clock, jwt::AccessExtras, AuthError, AuthResult, Keyring};
use crate::store::{AuthStore, DeviceInfo, NewRefreshToken, Rotation, User};
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tokens handed to the client after login or rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCredentials {
    pub access_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_token: String,
    pub refresh_expires_at: DateTime<Utc>,
    pub family_id: i64,
    pub session_id: Option<i64>,
}

pub struct FamilyEngine {
    store: Arc<dyn AuthStore>,
    keys: Arc<Keyring>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl FamilyEngine {
    #[must_use]
    pub fn new(
        store: Arc<dyn AuthStore>,
        keys: Arc<Keyring>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            clock,
            timeout,
        }
    }

    /// Open a new family and session for an authenticated user.
    ///
    /// # Errors
    /// Returns [`AuthError::Internal`] if signing or persistence fails.
    pub async fn issue_for_login(
        &self,
        user: &User,
        device: &DeviceInfo,
    ) -> AuthResult<IssuedCredentials> {
        let now = self.clock.now();
        let subject = self
            .keys
            .ids
            .encode_key(user.id)
            .context("failed to encode user id")?;

        let issued = OnceLock::new();
        let opened = {
            let keys = &self.keys;
            let subject = &subject;
            let issued = &issued;
            let build = move |family_id: i64| -> anyhow::Result<NewRefreshToken> {
                let family = keys.ids.encode_key(family_id)?;
                let token = keys.signer.generate_refresh_token(subject, &family, now)?;
                let row = NewRefreshToken {
                    jti: token.token_id.clone().context("refresh token without jti")?,
                    token_hash: keys.secrets.hash(&token.token),
                    expires_at: token.expires_at,
                    device: device.clone(),
                };
                let _ = issued.set(token);
                Ok(row)
            };
            bounded(
                self.timeout,
                "open token family",
                self.store.open_family(user.id, device, now, &build),
            )
            .await?
        };
        let refresh = issued
            .into_inner()
            .context("refresh token was not issued")?;

        let access = self.access_token(&subject, &user.role, Some(opened.session.id), now)?;

        info!(
            user_id = user.id,
            family_id = opened.family.id,
            session_id = opened.session.id,
            "Opened refresh token family"
        );

        Ok(IssuedCredentials {
            access_token: access.token,
            access_expires_at: access.expires_at,
            refresh_token: refresh.token,
            refresh_expires_at: refresh.expires_at,
            family_id: opened.family.id,
            session_id: Some(opened.session.id),
        })
    }

    /// Exchange a live refresh token for a fresh pair.
    ///
    /// # Errors
    /// - [`AuthError::TokenNotFound`] for unknown or malformed tokens.
    /// - [`AuthError::TokenExpired`] when the token is on record but past expiry.
    /// - [`AuthError::TokenReuseDetected`] when the token was already consumed;
    ///   the family has been revoked by the time this is returned.
    pub async fn refresh(
        &self,
        presented: &str,
        device: &DeviceInfo,
    ) -> AuthResult<IssuedCredentials> {
        let now = self.clock.now();
        let payload = self
            .keys
            .signer
            .authenticate_refresh_token(presented, now)
            .map_err(|_| AuthError::TokenNotFound)?;
        let family = payload.family.as_deref().ok_or(AuthError::TokenNotFound)?;

        let successor = self
            .keys
            .signer
            .generate_refresh_token(&payload.subject, family, now)?;
        let row = NewRefreshToken {
            jti: successor
                .token_id
                .clone()
                .context("refresh token without jti")?,
            token_hash: self.keys.secrets.hash(&successor.token),
            expires_at: successor.expires_at,
            device: device.clone(),
        };

        let presented_hash = self.keys.secrets.hash(presented);
        let rotation = bounded(
            self.timeout,
            "rotate refresh token",
            self.store.rotate_refresh_token(&presented_hash, row, now),
        )
        .await?;

        match rotation {
            Rotation::NotFound => {
                debug!("Refresh token is not on record");
                Err(AuthError::TokenNotFound)
            }
            Rotation::Expired => Err(AuthError::TokenExpired),
            Rotation::Reused { user_id, family_id } => {
                warn!(user_id, family_id, "Refresh token reuse detected, family revoked");
                Err(AuthError::TokenReuseDetected)
            }
            Rotation::Refused {
                user_id,
                family_id,
                locked,
            } => {
                info!(user_id, family_id, locked, "Refresh refused, family revoked");
                if locked {
                    Err(AuthError::AccountLocked)
                } else {
                    Err(AuthError::TokenNotFound)
                }
            }
            Rotation::Rotated {
                user_id,
                role,
                family_id,
                session_id,
                ..
            } => {
                let access = self.access_token(&payload.subject, &role, session_id, now)?;
                debug!(user_id, family_id, "Rotated refresh token");

                Ok(IssuedCredentials {
                    access_token: access.token,
                    access_expires_at: access.expires_at,
                    refresh_token: successor.token,
                    refresh_expires_at: successor.expires_at,
                    family_id,
                    session_id,
                })
            }
        }
    }

    /// Revoke the family of `presented`. Unknown tokens are a no-op.
    ///
    /// # Errors
    /// Returns [`AuthError::Internal`] if the store fails.
    pub async fn revoke(&self, presented: &str) -> AuthResult<()> {
        if self
            .keys
            .signer
            .authenticate_refresh_token(presented, self.clock.now())
            .is_err()
        {
            return Ok(());
        }
        let hash = self.keys.secrets.hash(presented);
        let token = bounded(
            self.timeout,
            "lookup refresh token",
            self.store.find_refresh_token(&hash),
        )
        .await?;
        if let Some(token) = token {
            self.revoke_family(token.family_id).await?;
        }
        Ok(())
    }

    /// Returns `true` if the family was live before this call.
    ///
    /// # Errors
    /// Returns [`AuthError::Internal`] if the store fails.
    pub async fn revoke_family(&self, family_id: i64) -> AuthResult<bool> {
        let revoked = bounded(
            self.timeout,
            "revoke token family",
            self.store.revoke_family(family_id, self.clock.now()),
        )
        .await?;
        if revoked {
            info!(family_id, "Revoked refresh token family");
        }
        Ok(revoked)
    }

    /// Revoke every live family of a user, one transaction per family.
    ///
    /// # Errors
    /// Returns [`AuthError::Internal`] on the first store failure; families
    /// revoked before it stay revoked.
    pub async fn revoke_all_for_user(&self, user_id: i64) -> AuthResult<usize> {
        let families = bounded(
            self.timeout,
            "list token families",
            self.store.families_for_user(user_id),
        )
        .await?;
        let mut revoked = 0;
        for family in families.iter().filter(|family| !family.is_revoked()) {
            if self.revoke_family(family.id).await? {
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    fn access_token(
        &self,
        subject: &str,
        role: &str,
        session_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> AuthResult<super::jwt::IssuedToken> {
        let session = session_id
            .map(|id| self.keys.ids.encode_key(id))
            .transpose()
            .context("failed to encode session id")?;
        let extras = AccessExtras {
            role: Some(role.to_string()),
            session,
        };
        Ok(self
            .keys
            .signer
            .generate_access_token(subject, &extras, now)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{
        clock::ManualClock, jwt::TokenSigner, public_id::PublicIdCodec, secret::SecretHasher,
    };
    use crate::store::{MemoryStore, NewUser, SessionStore, TokenStore, UserStore};
    use chrono::TimeZone;
    use secrecy::SecretString;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: ManualClock,
        engine: FamilyEngine,
        user: User,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let keys = Arc::new(Keyring::new(
            TokenSigner::new(
                &SecretString::from("access-secret"),
                &SecretString::from("refresh-secret"),
                chrono::Duration::minutes(15),
                chrono::Duration::days(7),
            )
            .unwrap(),
            PublicIdCodec::new(&[7u8; 32]).unwrap(),
            SecretHasher::new(&SecretString::from("hash-key")).unwrap(),
        ));
        let user = store
            .create_user(
                NewUser {
                    email: "ada@example.com".to_string(),
                    username: "ada".to_string(),
                    password_hash: "unused".to_string(),
                    role: "user".to_string(),
                },
                clock.now(),
            )
            .await
            .unwrap()
            .unwrap();
        let engine = FamilyEngine::new(
            store.clone(),
            keys,
            Arc::new(clock.clone()),
            Duration::from_secs(1),
        );
        Fixture {
            store,
            clock,
            engine,
            user,
        }
    }

    #[tokio::test]
    async fn login_opens_family_and_session() {
        let fx = fixture().await;
        let creds = fx
            .engine
            .issue_for_login(&fx.user, &DeviceInfo::default())
            .await
            .unwrap();
        let tokens = fx.store.tokens_in_family(creds.family_id).await.unwrap();
        assert_eq!(tokens.len(), 1);
        assert_ne!(tokens[0].token_hash, creds.refresh_token);
        let sessions = fx.store.active_sessions(fx.user.id).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(Some(sessions[0].id), creds.session_id);
    }

    #[tokio::test]
    async fn rotation_then_replay_revokes_family() {
        let fx = fixture().await;
        let first = fx
            .engine
            .issue_for_login(&fx.user, &DeviceInfo::default())
            .await
            .unwrap();
        fx.clock.advance(chrono::Duration::seconds(30));
        let second = fx
            .engine
            .refresh(&first.refresh_token, &DeviceInfo::default())
            .await
            .unwrap();
        assert_eq!(second.family_id, first.family_id);
        assert_ne!(second.refresh_token, first.refresh_token);

        let replay = fx
            .engine
            .refresh(&first.refresh_token, &DeviceInfo::default())
            .await;
        assert!(matches!(replay, Err(AuthError::TokenReuseDetected)));

        let legit = fx
            .engine
            .refresh(&second.refresh_token, &DeviceInfo::default())
            .await;
        assert!(matches!(legit, Err(AuthError::TokenReuseDetected)));
        let family = fx.store.find_family(first.family_id).await.unwrap().unwrap();
        assert!(family.is_revoked());
    }

    #[tokio::test]
    async fn expired_token_is_rejected_without_revocation() {
        let fx = fixture().await;
        let creds = fx
            .engine
            .issue_for_login(&fx.user, &DeviceInfo::default())
            .await
            .unwrap();
        fx.clock.advance(chrono::Duration::days(8));
        let result = fx
            .engine
            .refresh(&creds.refresh_token, &DeviceInfo::default())
            .await;
        assert!(matches!(result, Err(AuthError::TokenExpired)));
        let family = fx.store.find_family(creds.family_id).await.unwrap().unwrap();
        assert!(!family.is_revoked());
    }

    #[tokio::test]
    async fn garbage_token_is_not_found() {
        let fx = fixture().await;
        let result = fx
            .engine
            .refresh("not.a.token", &DeviceInfo::default())
            .await;
        assert!(matches!(result, Err(AuthError::TokenNotFound)));
        assert!(fx.engine.revoke("not.a.token").await.is_ok());
    }

    #[tokio::test]
    async fn revoke_all_only_touches_live_families() {
        let fx = fixture().await;
        let a = fx
            .engine
            .issue_for_login(&fx.user, &DeviceInfo::default())
            .await
            .unwrap();
        fx.engine
            .issue_for_login(&fx.user, &DeviceInfo::default())
            .await
            .unwrap();
        fx.engine.revoke(&a.refresh_token).await.unwrap();
        assert_eq!(fx.engine.revoke_all_for_user(fx.user.id).await.unwrap(), 1);
        assert_eq!(fx.engine.revoke_all_for_user(fx.user.id).await.unwrap(), 0);
        assert!(fx.store.active_sessions(fx.user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn locked_user_cannot_rotate() {
        let fx = fixture().await;
        let creds = fx
            .engine
            .issue_for_login(&fx.user, &DeviceInfo::default())
            .await
            .unwrap();
        fx.store.set_locked(fx.user.id, true).await.unwrap();
        let result = fx
            .engine
            .refresh(&creds.refresh_token, &DeviceInfo::default())
            .await;
        assert!(matches!(result, Err(AuthError::AccountLocked)));
        let family = fx.store.find_family(creds.family_id).await.unwrap().unwrap();
        assert!(family.is_revoked());
    }

    #[tokio::test]
    async fn deleted_user_cannot_rotate() {
        let fx = fixture().await;
        let creds = fx
            .engine
            .issue_for_login(&fx.user, &DeviceInfo::default())
            .await
            .unwrap();
        fx.store
            .soft_delete_user(fx.user.id, fx.clock.now())
            .await
            .unwrap();
        let result = fx
            .engine
            .refresh(&creds.refresh_token, &DeviceInfo::default())
            .await;
        assert!(matches!(result, Err(AuthError::TokenNotFound)));
        let family = fx.store.find_family(creds.family_id).await.unwrap().unwrap();
        assert!(family.is_revoked());

        // The presented token was never consumed, so a retry sees a revoked
        // family rather than a second rotation.
        let retry = fx
            .engine
            .refresh(&creds.refresh_token, &DeviceInfo::default())
            .await;
        assert!(matches!(retry, Err(AuthError::TokenReuseDetected)));
    }
}
