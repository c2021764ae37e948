//! Login sessions, one per refresh token family.

use super::{bounded, clock::Clock, AuthResult, Keyring};
use crate::store::{AuthStore, UserSession};
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// A session as shown to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    /// Opaque public id.
    pub id: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub login_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
    /// The caller's own session.
    pub current: bool,
}

pub struct SessionRegistry {
    store: Arc<dyn AuthStore>,
    keys: Arc<Keyring>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl SessionRegistry {
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

    /// # Errors
    /// Returns [`super::AuthError::Internal`] if the store fails.
    pub async fn update_last_seen(&self, session_id: i64) -> AuthResult<()> {
        bounded(
            self.timeout,
            "touch session",
            self.store.touch_session(session_id, self.clock.now()),
        )
        .await?;
        Ok(())
    }

    /// Close a session and revoke its refresh token family.
    ///
    /// # Errors
    /// Returns [`super::AuthError::Internal`] if the store fails.
    pub async fn revoke_by_family(&self, family_id: i64) -> AuthResult<bool> {
        let revoked = bounded(
            self.timeout,
            "revoke session family",
            self.store.revoke_family(family_id, self.clock.now()),
        )
        .await?;
        Ok(revoked)
    }

    /// Log out one of the user's own sessions by its public id.
    ///
    /// Returns `false` when the id is unknown, belongs to someone else, or the
    /// session is already closed.
    ///
    /// # Errors
    /// Returns [`super::AuthError::Internal`] if the store fails.
    pub async fn logout(&self, user_id: i64, session_public_id: &str) -> AuthResult<bool> {
        let Ok(session_id) = self.keys.ids.decode_key(session_public_id) else {
            return Ok(false);
        };
        let session = bounded(
            self.timeout,
            "lookup session",
            self.store.find_session(session_id),
        )
        .await?;
        match session {
            Some(session) if session.user_id == user_id && session.is_active() => {
                let revoked = self.revoke_by_family(session.family_id).await?;
                info!(user_id, session_id, "Session logged out");
                Ok(revoked)
            }
            _ => Ok(false),
        }
    }

    /// Open sessions of a user, most recently seen first.
    ///
    /// A session is `current` when its id is `current_session` (the `sid` of
    /// the caller's access token) or when it belongs to the family of
    /// `current_refresh_token`.
    ///
    /// # Errors
    /// Returns [`super::AuthError::Internal`] if the store fails.
    pub async fn active_sessions(
        &self,
        user_id: i64,
        current_session: Option<i64>,
        current_refresh_token: Option<&str>,
    ) -> AuthResult<Vec<ActiveSession>> {
        let current_family = match current_refresh_token {
            Some(token) => bounded(
                self.timeout,
                "lookup refresh token",
                self.store
                    .find_refresh_token(&self.keys.secrets.hash(token)),
            )
            .await?
            .filter(|record| record.user_id == user_id)
            .map(|record| record.family_id),
            None => None,
        };

        let sessions = bounded(
            self.timeout,
            "list sessions",
            self.store.active_sessions(user_id),
        )
        .await?;

        sessions
            .into_iter()
            .map(|session| {
                let current = current_session == Some(session.id)
                    || current_family == Some(session.family_id);
                self.present(session, current)
            })
            .collect()
    }

    fn present(&self, session: UserSession, current: bool) -> AuthResult<ActiveSession> {
        Ok(ActiveSession {
            id: self
                .keys
                .ids
                .encode_key(session.id)
                .context("failed to encode session id")?,
            current,
            ip: session.ip,
            user_agent: session.user_agent,
            login_at: session.login_at,
            last_seen_at: session.last_seen_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{
        clock::ManualClock, families::FamilyEngine, jwt::TokenSigner, public_id::PublicIdCodec,
        secret::SecretHasher,
    };
    use crate::store::{DeviceInfo, MemoryStore, NewUser, User, UserStore};
    use chrono::TimeZone;
    use secrecy::SecretString;

    async fn setup() -> (FamilyEngine, SessionRegistry, ManualClock, User, Arc<Keyring>) {
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
            PublicIdCodec::new(&[3u8; 32]).unwrap(),
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
            keys.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(1),
        );
        let registry = SessionRegistry::new(
            store,
            keys.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(1),
        );
        (engine, registry, clock, user, keys)
    }

    fn laptop() -> DeviceInfo {
        DeviceInfo {
            ip: Some("192.0.2.10".to_string()),
            user_agent: Some("laptop".to_string()),
        }
    }

    #[tokio::test]
    async fn current_session_is_flagged() {
        let (engine, registry, clock, user, _) = setup().await;
        let laptop_creds = engine.issue_for_login(&user, &laptop()).await.unwrap();
        clock.advance(chrono::Duration::minutes(1));
        let phone = engine
            .issue_for_login(&user, &DeviceInfo::default())
            .await
            .unwrap();

        let sessions = registry
            .active_sessions(user.id, None, Some(&phone.refresh_token))
            .await
            .unwrap();
        assert_eq!(sessions.len(), 2);
        let current: Vec<_> = sessions.iter().filter(|s| s.current).collect();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].user_agent, None);

        let laptop_entry = sessions
            .iter()
            .find(|s| s.user_agent.as_deref() == Some("laptop"))
            .unwrap();
        assert!(!laptop_entry.current);
        assert!(registry.logout(user.id, &laptop_entry.id).await.unwrap());

        let rotated = engine.refresh(&laptop_creds.refresh_token, &laptop()).await;
        assert!(rotated.is_err());
        assert_eq!(
            registry.active_sessions(user.id, None, None).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn access_token_session_is_flagged_without_cookie() {
        let (engine, registry, _clock, user, _) = setup().await;
        let laptop_creds = engine.issue_for_login(&user, &laptop()).await.unwrap();
        engine
            .issue_for_login(&user, &DeviceInfo::default())
            .await
            .unwrap();

        let sessions = registry
            .active_sessions(user.id, laptop_creds.session_id, None)
            .await
            .unwrap();
        let current: Vec<_> = sessions.iter().filter(|s| s.current).collect();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].user_agent.as_deref(), Some("laptop"));

        // Ids are encoded with a fresh nonce on every listing.
        let again = registry
            .active_sessions(user.id, laptop_creds.session_id, None)
            .await
            .unwrap();
        assert_ne!(again[0].id, sessions[0].id);
        assert!(again.iter().any(|s| s.current));
    }

    #[tokio::test]
    async fn cannot_log_out_foreign_session() {
        let (engine, registry, _clock, user, keys) = setup().await;
        let creds = engine
            .issue_for_login(&user, &DeviceInfo::default())
            .await
            .unwrap();
        let public = keys.ids.encode_key(creds.session_id.unwrap()).unwrap();
        assert!(!registry.logout(user.id + 1, &public).await.unwrap());
        assert!(!registry.logout(user.id, "garbage").await.unwrap());
        assert!(registry.logout(user.id, &public).await.unwrap());
        assert!(!registry.logout(user.id, &public).await.unwrap());
    }

    #[tokio::test]
    async fn last_seen_moves_forward() {
        let (engine, registry, clock, user, _) = setup().await;
        let creds = engine
            .issue_for_login(&user, &DeviceInfo::default())
            .await
            .unwrap();
        clock.advance(chrono::Duration::minutes(5));
        registry
            .update_last_seen(creds.session_id.unwrap())
            .await
            .unwrap();
        let sessions = registry.active_sessions(user.id, None, None).await.unwrap();
        assert_eq!(sessions[0].last_seen_at, Some(clock.now()));
    }
}
