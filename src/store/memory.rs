//! In-process backend. Every trait method runs under one mutex, which gives
//! the same atomicity the Postgres backend gets from transactions.

use super::{
    AttemptKey, DeviceInfo, EmailOtp, FirstToken, LoginAttempt, LoginAttemptStore, NewEmailOtp,
    NewRefreshToken, NewUser, OneTimePurpose, OneTimeToken, OneTimeTokenStore, OpenedFamily,
    RefreshTokenFamily, RefreshTokenRecord, Rotation, SessionStore, TokenStore, User, UserSession,
    UserStore,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

#[derive(Default)]
struct State {
    next_id: i64,
    users: BTreeMap<i64, User>,
    families: BTreeMap<i64, RefreshTokenFamily>,
    tokens: BTreeMap<i64, RefreshTokenRecord>,
    sessions: BTreeMap<i64, UserSession>,
    attempts: Vec<LoginAttempt>,
    one_time: BTreeMap<i64, OneTimeToken>,
    otps: BTreeMap<i64, EmailOtp>,
}

impl State {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn insert_token(
        &mut self,
        family_id: i64,
        user_id: i64,
        token: NewRefreshToken,
        now: DateTime<Utc>,
    ) -> RefreshTokenRecord {
        let id = self.id();
        let record = RefreshTokenRecord {
            id,
            family_id,
            user_id,
            jti: token.jti,
            token_hash: token.token_hash,
            expires_at: token.expires_at,
            created_at: now,
            revoked_at: None,
            used_at: None,
            ip: token.device.ip,
            user_agent: token.device.user_agent,
        };
        self.tokens.insert(id, record.clone());
        record
    }

    fn revoke_family(&mut self, family_id: i64, now: DateTime<Utc>) -> bool {
        let Some(family) = self.families.get_mut(&family_id) else {
            return false;
        };
        let newly = family.revoked_at.is_none();
        family.revoked_at.get_or_insert(now);

        for token in self.tokens.values_mut().filter(|t| t.family_id == family_id) {
            token.revoked_at.get_or_insert(now);
        }
        for session in self
            .sessions
            .values_mut()
            .filter(|s| s.family_id == family_id)
        {
            session.logout_at.get_or_insert(now);
        }
        newly
    }

    fn family_revoked(&self, family_id: i64) -> bool {
        self.families
            .get(&family_id)
            .map_or(true, RefreshTokenFamily::is_revoked)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

fn same_identity(user: &User, email: &str, username: &str) -> bool {
    user.email.eq_ignore_ascii_case(email) || user.username.eq_ignore_ascii_case(username)
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create_user(&self, user: NewUser, now: DateTime<Utc>) -> Result<Option<User>> {
        let mut state = self.state.lock().await;
        if state
            .users
            .values()
            .any(|u| same_identity(u, &user.email, &user.username))
        {
            return Ok(None);
        }
        let id = state.id();
        let record = User {
            id,
            email: user.email,
            username: user.username,
            password_hash: user.password_hash,
            role: user.role,
            locked: false,
            email_verified: false,
            created_at: now,
            deleted_at: None,
        };
        state.users.insert(id, record.clone());
        Ok(Some(record))
    }

    async fn find_user_by_identifier(&self, identifier: &str) -> Result<Option<User>> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .values()
            .find(|u| same_identity(u, identifier, identifier))
            .cloned())
    }

    async fn find_user_by_id(&self, user_id: i64) -> Result<Option<User>> {
        Ok(self.state.lock().await.users.get(&user_id).cloned())
    }

    async fn update_password_hash(&self, user_id: i64, password_hash: &str) -> Result<()> {
        if let Some(user) = self.state.lock().await.users.get_mut(&user_id) {
            password_hash.clone_into(&mut user.password_hash);
        }
        Ok(())
    }

    async fn mark_email_verified(&self, user_id: i64) -> Result<()> {
        if let Some(user) = self.state.lock().await.users.get_mut(&user_id) {
            user.email_verified = true;
        }
        Ok(())
    }

    async fn set_locked(&self, user_id: i64, locked: bool) -> Result<()> {
        if let Some(user) = self.state.lock().await.users.get_mut(&user_id) {
            user.locked = locked;
        }
        Ok(())
    }

    async fn soft_delete_user(&self, user_id: i64, now: DateTime<Utc>) -> Result<()> {
        if let Some(user) = self.state.lock().await.users.get_mut(&user_id) {
            user.deleted_at.get_or_insert(now);
        }
        Ok(())
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn open_family(
        &self,
        user_id: i64,
        device: &DeviceInfo,
        now: DateTime<Utc>,
        first: FirstToken<'_>,
    ) -> Result<OpenedFamily> {
        let mut state = self.state.lock().await;
        let family_id = state.id();
        // Build before mutating so a failing builder leaves no trace.
        let first = first(family_id)?;

        let family = RefreshTokenFamily {
            id: family_id,
            user_id,
            created_at: now,
            revoked_at: None,
        };
        state.families.insert(family_id, family.clone());
        let token = state.insert_token(family_id, user_id, first, now);

        let session_id = state.id();
        let session = UserSession {
            id: session_id,
            user_id,
            family_id,
            ip: device.ip.clone(),
            user_agent: device.user_agent.clone(),
            login_at: now,
            last_seen_at: Some(now),
            logout_at: None,
        };
        state.sessions.insert(session_id, session.clone());

        Ok(OpenedFamily {
            family,
            token,
            session,
        })
    }

    async fn rotate_refresh_token(
        &self,
        presented_hash: &str,
        successor: NewRefreshToken,
        now: DateTime<Utc>,
    ) -> Result<Rotation> {
        let mut state = self.state.lock().await;
        let Some(current) = state
            .tokens
            .values()
            .find(|t| t.token_hash == presented_hash)
            .cloned()
        else {
            return Ok(Rotation::NotFound);
        };

        if !current.is_live() || state.family_revoked(current.family_id) {
            state.revoke_family(current.family_id, now);
            return Ok(Rotation::Reused {
                user_id: current.user_id,
                family_id: current.family_id,
            });
        }

        if current.expires_at <= now {
            return Ok(Rotation::Expired);
        }

        let owner = state
            .users
            .get(&current.user_id)
            .filter(|user| !user.is_deleted())
            .map(|user| (user.role.clone(), user.locked));
        let role = match owner {
            Some((role, false)) => role,
            other => {
                state.revoke_family(current.family_id, now);
                return Ok(Rotation::Refused {
                    user_id: current.user_id,
                    family_id: current.family_id,
                    locked: other.is_some(),
                });
            }
        };

        if let Some(token) = state.tokens.get_mut(&current.id) {
            token.used_at = Some(now);
        }
        let successor = state.insert_token(current.family_id, current.user_id, successor, now);

        let session_id = state
            .sessions
            .values_mut()
            .find(|s| s.family_id == current.family_id && s.is_active())
            .map(|session| {
                session.last_seen_at = Some(now);
                session.id
            });

        Ok(Rotation::Rotated {
            user_id: current.user_id,
            role,
            family_id: current.family_id,
            session_id,
            successor,
        })
    }

    async fn find_refresh_token(&self, token_hash: &str) -> Result<Option<RefreshTokenRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .tokens
            .values()
            .find(|t| t.token_hash == token_hash)
            .cloned())
    }

    async fn find_family(&self, family_id: i64) -> Result<Option<RefreshTokenFamily>> {
        Ok(self.state.lock().await.families.get(&family_id).cloned())
    }

    async fn families_for_user(&self, user_id: i64) -> Result<Vec<RefreshTokenFamily>> {
        let state = self.state.lock().await;
        Ok(state
            .families
            .values()
            .filter(|f| f.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn tokens_in_family(&self, family_id: i64) -> Result<Vec<RefreshTokenRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .tokens
            .values()
            .filter(|t| t.family_id == family_id)
            .cloned()
            .collect())
    }

    async fn revoke_family(&self, family_id: i64, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.state.lock().await.revoke_family(family_id, now))
    }

    async fn prune_refresh_tokens(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let State {
            tokens, families, ..
        } = &mut *state;
        let len = tokens.len();
        tokens.retain(|_, t| {
            let revoked = families
                .get(&t.family_id)
                .is_some_and(RefreshTokenFamily::is_revoked);
            !revoked || t.expires_at >= before
        });
        Ok((len - tokens.len()) as u64)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn find_session(&self, session_id: i64) -> Result<Option<UserSession>> {
        Ok(self.state.lock().await.sessions.get(&session_id).cloned())
    }

    async fn touch_session(&self, session_id: i64, now: DateTime<Utc>) -> Result<()> {
        if let Some(session) = self.state.lock().await.sessions.get_mut(&session_id) {
            if session.is_active() {
                session.last_seen_at = Some(now);
            }
        }
        Ok(())
    }

    async fn active_sessions(&self, user_id: i64) -> Result<Vec<UserSession>> {
        let state = self.state.lock().await;
        let mut sessions: Vec<UserSession> = state
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && s.is_active())
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        Ok(sessions)
    }
}

fn attempt_matches(attempt: &LoginAttempt, key: AttemptKey<'_>) -> bool {
    match key {
        AttemptKey::Identifier(identifier) => attempt.identifier == identifier,
        AttemptKey::Ip(ip) => attempt.ip.as_deref() == Some(ip),
    }
}

#[async_trait]
impl LoginAttemptStore for MemoryStore {
    async fn record_attempt(&self, attempt: &LoginAttempt) -> Result<()> {
        self.state.lock().await.attempts.push(attempt.clone());
        Ok(())
    }

    async fn count_failed_attempts(
        &self,
        key: AttemptKey<'_>,
        since: DateTime<Utc>,
    ) -> Result<u32> {
        let state = self.state.lock().await;
        let last_success = match key {
            AttemptKey::Identifier(_) => state
                .attempts
                .iter()
                .filter(|a| a.success && attempt_matches(a, key))
                .map(|a| a.attempted_at)
                .max(),
            AttemptKey::Ip(_) => None,
        };

        let count = state
            .attempts
            .iter()
            .filter(|a| !a.success && attempt_matches(a, key) && a.attempted_at >= since)
            .filter(|a| last_success.map_or(true, |success| a.attempted_at > success))
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn prune_attempts(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let len = state.attempts.len();
        state.attempts.retain(|a| a.attempted_at >= before);
        Ok((len - state.attempts.len()) as u64)
    }
}

#[async_trait]
impl OneTimeTokenStore for MemoryStore {
    async fn insert_one_time_token(
        &self,
        purpose: OneTimePurpose,
        user_id: i64,
        token_hash: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let id = state.id();
        state.one_time.insert(
            id,
            OneTimeToken {
                id,
                purpose,
                user_id,
                token_hash: token_hash.to_string(),
                expires_at,
                created_at: now,
                used_at: None,
            },
        );
        Ok(())
    }

    async fn find_one_time_token(
        &self,
        purpose: OneTimePurpose,
        token_hash: &str,
    ) -> Result<Option<OneTimeToken>> {
        let state = self.state.lock().await;
        Ok(state
            .one_time
            .values()
            .find(|t| t.purpose == purpose && t.token_hash == token_hash)
            .cloned())
    }

    async fn consume_one_time_token(
        &self,
        purpose: OneTimePurpose,
        token_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.one_time.get_mut(&token_id) {
            Some(token) if token.purpose == purpose && token.used_at.is_none() => {
                token.used_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn prune_one_time_tokens(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let len = state.one_time.len();
        state.one_time.retain(|_, t| t.expires_at >= before);
        Ok((len - state.one_time.len()) as u64)
    }

    async fn replace_email_otp(&self, otp: NewEmailOtp, now: DateTime<Utc>) -> Result<EmailOtp> {
        let mut state = self.state.lock().await;
        state
            .otps
            .retain(|_, o| !(o.email == otp.email && o.purpose == otp.purpose));
        let id = state.id();
        let record = EmailOtp {
            id,
            email: otp.email,
            purpose: otp.purpose,
            otp_hash: otp.otp_hash,
            expires_at: otp.expires_at,
            created_at: now,
            ip: otp.device.ip,
            user_agent: otp.device.user_agent,
        };
        state.otps.insert(id, record.clone());
        Ok(record)
    }

    async fn find_email_otp(
        &self,
        email: &str,
        purpose: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EmailOtp>> {
        let state = self.state.lock().await;
        Ok(state
            .otps
            .values()
            .filter(|o| o.email == email && o.purpose == purpose && o.expires_at > now)
            .max_by_key(|o| o.created_at)
            .cloned())
    }

    async fn delete_email_otp(&self, otp_id: i64) -> Result<bool> {
        Ok(self.state.lock().await.otps.remove(&otp_id).is_some())
    }

    async fn prune_email_otps(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let len = state.otps.len();
        state.otps.retain(|_, o| o.expires_at >= before);
        Ok((len - state.otps.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FailureReason;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().unwrap_or_default()
    }

    fn token(jti: &str, expires_at: DateTime<Utc>) -> NewRefreshToken {
        NewRefreshToken {
            jti: jti.to_string(),
            token_hash: format!("hash-{jti}"),
            expires_at,
            device: DeviceInfo::default(),
        }
    }

    async fn user(store: &MemoryStore) -> User {
        store
            .create_user(
                NewUser {
                    email: "ada@example.com".to_string(),
                    username: "ada".to_string(),
                    password_hash: "x".to_string(),
                    role: "user".to_string(),
                },
                t0(),
            )
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_user_is_rejected() {
        let store = MemoryStore::new();
        user(&store).await;
        let dup = store
            .create_user(
                NewUser {
                    email: "ADA@example.com".to_string(),
                    username: "other".to_string(),
                    password_hash: "x".to_string(),
                    role: "user".to_string(),
                },
                t0(),
            )
            .await
            .unwrap();
        assert!(dup.is_none());
    }

    #[tokio::test]
    async fn rotation_is_single_use() {
        let store = MemoryStore::new();
        let user = user(&store).await;
        let expires = t0() + Duration::days(7);
        let opened = store
            .open_family(user.id, &DeviceInfo::default(), t0(), &|_| {
                Ok(token("a", expires))
            })
            .await
            .unwrap();

        let first = store
            .rotate_refresh_token("hash-a", token("b", expires), t0())
            .await
            .unwrap();
        assert!(matches!(first, Rotation::Rotated { family_id, .. } if family_id == opened.family.id));

        let replay = store
            .rotate_refresh_token("hash-a", token("c", expires), t0())
            .await
            .unwrap();
        assert_eq!(
            replay,
            Rotation::Reused {
                user_id: user.id,
                family_id: opened.family.id
            }
        );

        // The legitimate successor died with the family.
        let after = store
            .rotate_refresh_token("hash-b", token("d", expires), t0())
            .await
            .unwrap();
        assert!(matches!(after, Rotation::Reused { .. }));
        assert!(store.active_sessions(user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn locked_owner_is_refused_in_the_same_step() {
        let store = MemoryStore::new();
        let user = user(&store).await;
        let expires = t0() + Duration::days(7);
        let opened = store
            .open_family(user.id, &DeviceInfo::default(), t0(), &|_| {
                Ok(token("a", expires))
            })
            .await
            .unwrap();
        store.set_locked(user.id, true).await.unwrap();

        let outcome = store
            .rotate_refresh_token("hash-a", token("b", expires), t0())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Rotation::Refused {
                user_id: user.id,
                family_id: opened.family.id,
                locked: true,
            }
        );
        assert!(store.find_refresh_token("hash-b").await.unwrap().is_none());
        let presented = store.find_refresh_token("hash-a").await.unwrap().unwrap();
        assert_eq!(presented.used_at, None);
        assert!(presented.revoked_at.is_some());
        assert!(store.active_sessions(user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rotation_carries_the_owner_role() {
        let store = MemoryStore::new();
        let user = user(&store).await;
        let expires = t0() + Duration::days(7);
        store
            .open_family(user.id, &DeviceInfo::default(), t0(), &|_| {
                Ok(token("a", expires))
            })
            .await
            .unwrap();
        let outcome = store
            .rotate_refresh_token("hash-a", token("b", expires), t0())
            .await
            .unwrap();
        assert!(matches!(outcome, Rotation::Rotated { ref role, .. } if role == "user"));
    }

    #[tokio::test]
    async fn expired_token_is_not_rotated() {
        let store = MemoryStore::new();
        let user = user(&store).await;
        store
            .open_family(user.id, &DeviceInfo::default(), t0(), &|_| {
                Ok(token("a", t0() + Duration::minutes(1)))
            })
            .await
            .unwrap();
        let outcome = store
            .rotate_refresh_token("hash-a", token("b", t0()), t0() + Duration::minutes(2))
            .await
            .unwrap();
        assert_eq!(outcome, Rotation::Expired);
    }

    #[tokio::test]
    async fn success_resets_identifier_but_not_ip_count() {
        let store = MemoryStore::new();
        let attempt = |success: bool, minute: i64| LoginAttempt {
            identifier: "ada".to_string(),
            user_id: None,
            ip: Some("10.0.0.1".to_string()),
            user_agent: None,
            success,
            failure_reason: (!success).then_some(FailureReason::BadPassword),
            attempted_at: t0() + Duration::minutes(minute),
        };
        for (success, minute) in [(false, 0), (false, 1), (true, 2), (false, 3)] {
            store.record_attempt(&attempt(success, minute)).await.unwrap();
        }
        let count = store
            .count_failed_attempts(AttemptKey::Identifier("ada"), t0())
            .await
            .unwrap();
        assert_eq!(count, 1);
        let by_ip = store
            .count_failed_attempts(AttemptKey::Ip("10.0.0.1"), t0())
            .await
            .unwrap();
        assert_eq!(by_ip, 3);
    }

    #[tokio::test]
    async fn one_time_token_consumed_once() {
        let store = MemoryStore::new();
        store
            .insert_one_time_token(
                OneTimePurpose::PasswordReset,
                1,
                "h",
                t0() + Duration::minutes(30),
                t0(),
            )
            .await
            .unwrap();
        let found = store
            .find_one_time_token(OneTimePurpose::PasswordReset, "h")
            .await
            .unwrap()
            .unwrap();
        assert!(store
            .find_one_time_token(OneTimePurpose::EmailVerification, "h")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .consume_one_time_token(OneTimePurpose::PasswordReset, found.id, t0())
            .await
            .unwrap());
        assert!(!store
            .consume_one_time_token(OneTimePurpose::PasswordReset, found.id, t0())
            .await
            .unwrap());
    }
}
