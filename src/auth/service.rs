//! Account flows built on the engine components.
//!
//! Every public method maps its failures onto [`AuthError`]. Flows that could
//! reveal whether an email is registered (forgot password, resend
//! verification) report success regardless and only log what happened.

use super::{
    bounded,
    clock::{Clock, SystemClock},
    config::AuthConfig,
    families::{FamilyEngine, IssuedCredentials},
    password::{meets_policy, HashingPool},
    rate_limit::{AttemptCounter, LoginGuard, RateLimitDecision, StoreAttemptCounter},
    secret::{generate_otp, generate_secret},
    sessions::{ActiveSession, SessionRegistry},
    AuthError, AuthResult, Keyring,
};
use crate::email::{EmailMessage, EmailSender, EmailTemplate, LogEmailSender};
use crate::store::{
    AuthStore, DeviceInfo, FailureReason, LoginAttempt, NewEmailOtp, NewUser, OneTimePurpose,
    PruneReport, User,
};
use anyhow::Context;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

const DUMMY_PASSWORD: &str = "credo-timing-equalizer";

/// Public view of an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSummary {
    pub id: String,
    pub email: String,
    pub username: String,
    pub role: String,
    pub email_verified: bool,
}

#[derive(Debug)]
pub struct Registration {
    pub email: String,
    pub username: String,
    pub password: SecretString,
}

#[derive(Debug)]
pub struct LoginRequest {
    /// Email or username.
    pub identifier: String,
    pub password: SecretString,
    pub device: DeviceInfo,
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub account: AccountSummary,
    pub credentials: IssuedCredentials,
}

/// Caller identity recovered from an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: i64,
    pub public_id: String,
    pub role: Option<String>,
    pub session_id: Option<i64>,
}

#[must_use]
pub fn normalize_identifier(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}

fn valid_email(email: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email))
}

fn valid_username(username: &str) -> bool {
    (3..=32).contains(&username.len())
        && Regex::new(r"^[a-z0-9][a-z0-9_-]*$").is_ok_and(|regex| regex.is_match(username))
}

pub struct AuthServiceBuilder {
    store: Arc<dyn AuthStore>,
    keys: Arc<Keyring>,
    passwords: HashingPool,
    config: AuthConfig,
    clock: Arc<dyn Clock>,
    mailer: Arc<dyn EmailSender>,
    counter: Option<Arc<dyn AttemptCounter>>,
}

impl AuthServiceBuilder {
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_mailer(mut self, mailer: Arc<dyn EmailSender>) -> Self {
        self.mailer = mailer;
        self
    }

    /// Replace the store-backed attempt counter.
    #[must_use]
    pub fn with_attempt_counter(mut self, counter: Arc<dyn AttemptCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    #[must_use]
    pub fn build(self) -> AuthService {
        let timeout = self.config.store_timeout();
        let counter: Arc<dyn AttemptCounter> = match self.counter {
            Some(counter) => counter,
            None => Arc::new(StoreAttemptCounter::new(Arc::clone(&self.store))),
        };
        AuthService {
            guard: LoginGuard::new(
                counter,
                self.config.rate_limit(),
                Arc::clone(&self.clock),
                timeout,
            ),
            families: FamilyEngine::new(
                Arc::clone(&self.store),
                Arc::clone(&self.keys),
                Arc::clone(&self.clock),
                timeout,
            ),
            sessions: SessionRegistry::new(
                Arc::clone(&self.store),
                Arc::clone(&self.keys),
                Arc::clone(&self.clock),
                timeout,
            ),
            store: self.store,
            keys: self.keys,
            passwords: self.passwords,
            config: self.config,
            clock: self.clock,
            mailer: self.mailer,
            dummy_hash: OnceCell::new(),
        }
    }
}

pub struct AuthService {
    store: Arc<dyn AuthStore>,
    keys: Arc<Keyring>,
    passwords: HashingPool,
    guard: LoginGuard,
    families: FamilyEngine,
    sessions: SessionRegistry,
    config: AuthConfig,
    clock: Arc<dyn Clock>,
    mailer: Arc<dyn EmailSender>,
    dummy_hash: OnceCell<String>,
}

impl AuthService {
    #[must_use]
    pub fn builder(
        store: Arc<dyn AuthStore>,
        keys: Arc<Keyring>,
        passwords: HashingPool,
        config: AuthConfig,
    ) -> AuthServiceBuilder {
        AuthServiceBuilder {
            store,
            keys,
            passwords,
            config,
            clock: Arc::new(SystemClock),
            mailer: Arc::new(LogEmailSender),
            counter: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn families(&self) -> &FamilyEngine {
        &self.families
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    #[must_use]
    pub fn guard(&self) -> &LoginGuard {
        &self.guard
    }

    fn summary(&self, user: &User) -> AuthResult<AccountSummary> {
        Ok(AccountSummary {
            id: self
                .keys
                .ids
                .encode_key(user.id)
                .context("failed to encode user id")?,
            email: user.email.clone(),
            username: user.username.clone(),
            role: user.role.clone(),
            email_verified: user.email_verified,
        })
    }

    async fn find_user(&self, identifier: &str) -> AuthResult<Option<User>> {
        let user = bounded(
            self.config.store_timeout(),
            "lookup user",
            self.store.find_user_by_identifier(identifier),
        )
        .await?;
        Ok(user.filter(|user| !user.is_deleted()))
    }

    async fn user_by_id(&self, user_id: i64) -> AuthResult<Option<User>> {
        let user = bounded(
            self.config.store_timeout(),
            "lookup user by id",
            self.store.find_user_by_id(user_id),
        )
        .await?;
        Ok(user.filter(|user| !user.is_deleted()))
    }

    async fn deliver(&self, message: EmailMessage) {
        if let Err(err) = self.mailer.send(&message).await {
            error!(
                template = message.template.as_str(),
                "Failed to deliver email: {err:#}"
            );
        }
    }

    /// Burn the same Argon2 cost as a real check when the account is unknown.
    async fn equalize_timing(&self, password: SecretString) {
        let dummy = self
            .dummy_hash
            .get_or_try_init(|| {
                self.passwords
                    .hash(SecretString::from(DUMMY_PASSWORD.to_string()))
            })
            .await;
        match dummy {
            Ok(dummy) => {
                let _ = self.passwords.verify(password, dummy.clone()).await;
            }
            Err(err) => warn!("Failed to prepare timing hash: {err:#}"),
        }
    }

    /// Create an account and send its verification link.
    ///
    /// # Errors
    /// - [`AuthError::InvalidInput`] for a malformed email or username.
    /// - [`AuthError::WeakPassword`] when the password fails the policy.
    /// - [`AuthError::AlreadyExists`] when the email or username is taken.
    pub async fn register(&self, registration: Registration) -> AuthResult<AccountSummary> {
        let email = normalize_identifier(&registration.email);
        let username = normalize_identifier(&registration.username);
        if !valid_email(&email) {
            return Err(AuthError::InvalidInput("email"));
        }
        if !valid_username(&username) {
            return Err(AuthError::InvalidInput("username"));
        }
        if !meets_policy(registration.password.expose_secret()) {
            return Err(AuthError::WeakPassword);
        }

        let password_hash = self.passwords.hash(registration.password).await?;
        let user = bounded(
            self.config.store_timeout(),
            "create user",
            self.store.create_user(
                NewUser {
                    email,
                    username,
                    password_hash,
                    role: self.config.default_role().to_string(),
                },
                self.clock.now(),
            ),
        )
        .await?
        .ok_or(AuthError::AlreadyExists)?;

        info!(user_id = user.id, "Account registered");
        if let Err(err) = self.send_verification(&user).await {
            error!(user_id = user.id, "Failed to issue verification token: {err}");
        }
        self.summary(&user)
    }

    async fn send_verification(&self, user: &User) -> AuthResult<()> {
        let token = generate_secret()?;
        let now = self.clock.now();
        bounded(
            self.config.store_timeout(),
            "insert verification token",
            self.store.insert_one_time_token(
                OneTimePurpose::EmailVerification,
                user.id,
                &self.keys.secrets.hash(&token),
                now + self.config.verification_token_ttl(),
                now,
            ),
        )
        .await?;
        self.deliver(EmailMessage {
            to_email: user.email.clone(),
            template: EmailTemplate::VerifyEmail,
            payload: json!({ "verify_url": self.config.verify_url(&token) }),
        })
        .await;
        Ok(())
    }

    /// Issue a new verification link if the account exists and is unverified.
    /// Always succeeds from the caller's point of view.
    pub async fn resend_verification(&self, email: &str) {
        let email = normalize_identifier(email);
        match self.find_user(&email).await {
            Ok(Some(user)) if !user.email_verified && user.email == email => {
                if let Err(err) = self.send_verification(&user).await {
                    error!(user_id = user.id, "Failed to resend verification: {err}");
                }
            }
            Ok(_) => debug!("Verification resend skipped"),
            Err(err) => error!("Verification resend lookup failed: {err}"),
        }
    }

    /// Consume a verification token and mark the email verified.
    ///
    /// # Errors
    /// [`AuthError::TokenNotFound`] for unknown or used tokens,
    /// [`AuthError::TokenExpired`] past the token lifetime.
    pub async fn verify_email(&self, token: &str) -> AuthResult<()> {
        let now = self.clock.now();
        let record = bounded(
            self.config.store_timeout(),
            "lookup verification token",
            self.store.find_one_time_token(
                OneTimePurpose::EmailVerification,
                &self.keys.secrets.hash(token),
            ),
        )
        .await?
        .ok_or(AuthError::TokenNotFound)?;

        if record.used_at.is_some() {
            return Err(AuthError::TokenNotFound);
        }
        if record.expires_at <= now {
            return Err(AuthError::TokenExpired);
        }
        let consumed = bounded(
            self.config.store_timeout(),
            "consume verification token",
            self.store.consume_one_time_token(
                OneTimePurpose::EmailVerification,
                record.id,
                now,
            ),
        )
        .await?;
        if !consumed {
            return Err(AuthError::TokenNotFound);
        }
        bounded(
            self.config.store_timeout(),
            "mark email verified",
            self.store.mark_email_verified(record.user_id),
        )
        .await?;
        info!(user_id = record.user_id, "Email verified");
        Ok(())
    }

    /// Authenticate a password and open a new token family.
    ///
    /// # Errors
    /// - [`AuthError::RateLimited`] once the identifier or IP exceeded the
    ///   failure threshold; credentials are not checked.
    /// - [`AuthError::InvalidCredentials`] for an unknown identifier or a wrong
    ///   password, indistinguishably.
    /// - [`AuthError::AccountLocked`] when the password matched a locked account.
    pub async fn login(&self, request: LoginRequest) -> AuthResult<LoginOutcome> {
        let identifier = normalize_identifier(&request.identifier);
        let device = request.device;

        if self.guard.check(&identifier, device.ip.as_deref()).await == RateLimitDecision::Limited
        {
            debug!("Login refused by rate limit");
            return Err(AuthError::RateLimited);
        }

        let Some(user) = self.find_user(&identifier).await? else {
            self.equalize_timing(request.password).await;
            self.guard
                .record_failed_attempt(&LoginAttempt::failure(
                    &identifier,
                    None,
                    &device,
                    FailureReason::UnknownIdentifier,
                    self.clock.now(),
                ))
                .await;
            debug!("Login failed: unknown identifier");
            return Err(AuthError::InvalidCredentials);
        };

        let verification = self
            .passwords
            .verify(request.password.clone(), user.password_hash.clone())
            .await?;
        if !verification.matched {
            self.guard
                .record_failed_attempt(&LoginAttempt::failure(
                    &identifier,
                    Some(user.id),
                    &device,
                    FailureReason::BadPassword,
                    self.clock.now(),
                ))
                .await;
            debug!(user_id = user.id, "Login failed: bad password");
            return Err(AuthError::InvalidCredentials);
        }

        if user.locked {
            self.guard
                .record_failed_attempt(&LoginAttempt::failure(
                    &identifier,
                    Some(user.id),
                    &device,
                    FailureReason::AccountLocked,
                    self.clock.now(),
                ))
                .await;
            info!(user_id = user.id, "Login refused: account locked");
            return Err(AuthError::AccountLocked);
        }

        self.guard
            .reset_attempts(&LoginAttempt::success(
                &identifier,
                user.id,
                &device,
                self.clock.now(),
            ))
            .await;

        if verification.should_rehash {
            self.rehash(&user, request.password).await;
        }

        let credentials = self.families.issue_for_login(&user, &device).await?;
        info!(user_id = user.id, "Login succeeded");
        Ok(LoginOutcome {
            account: self.summary(&user)?,
            credentials,
        })
    }

    /// Upgrade a hash to the current pepper. Failures leave the old hash usable.
    async fn rehash(&self, user: &User, password: SecretString) {
        let result = async {
            let hash = self.passwords.hash(password).await?;
            bounded(
                self.config.store_timeout(),
                "update password hash",
                self.store.update_password_hash(user.id, &hash),
            )
            .await
        }
        .await;
        match result {
            Ok(()) => info!(user_id = user.id, "Password rehashed with current pepper"),
            Err(err) => warn!(user_id = user.id, "Password rehash failed: {err:#}"),
        }
    }

    /// # Errors
    /// See [`FamilyEngine::refresh`].
    pub async fn refresh(
        &self,
        refresh_token: &str,
        device: &DeviceInfo,
    ) -> AuthResult<IssuedCredentials> {
        self.families.refresh(refresh_token, device).await
    }

    /// Revoke the family of a refresh token. Unknown tokens succeed silently.
    ///
    /// # Errors
    /// Returns [`AuthError::Internal`] if the store fails.
    pub async fn logout(&self, refresh_token: &str) -> AuthResult<()> {
        self.families.revoke(refresh_token).await
    }

    /// # Errors
    /// Returns [`AuthError::Internal`] if the store fails.
    pub async fn logout_all(&self, user_id: i64) -> AuthResult<usize> {
        let revoked = self.families.revoke_all_for_user(user_id).await?;
        info!(user_id, revoked, "Logged out everywhere");
        Ok(revoked)
    }

    /// Validate an access token and touch its session.
    ///
    /// # Errors
    /// [`AuthError::InvalidCredentials`] for any invalid token.
    pub async fn authenticate(&self, access_token: &str) -> AuthResult<Principal> {
        let payload = self
            .keys
            .signer
            .verify_access_token(access_token, self.clock.now())
            .map_err(|_| AuthError::InvalidCredentials)?;
        let user_id = self
            .keys
            .ids
            .decode_key(&payload.subject)
            .map_err(|_| AuthError::InvalidCredentials)?;
        let session_id = payload
            .session
            .as_deref()
            .map(|sid| self.keys.ids.decode_key(sid))
            .transpose()
            .map_err(|_| AuthError::InvalidCredentials)?;

        if let Some(session_id) = session_id {
            if let Err(err) = self.sessions.update_last_seen(session_id).await {
                warn!(session_id, "Failed to touch session: {err}");
            }
        }

        Ok(Principal {
            user_id,
            public_id: payload.subject,
            role: payload.role,
            session_id,
        })
    }

    /// # Errors
    /// Returns [`AuthError::Internal`] if the store fails.
    pub async fn account(&self, user_id: i64) -> AuthResult<AccountSummary> {
        let user = self
            .user_by_id(user_id)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        self.summary(&user)
    }

    /// Open sessions of `principal`, flagging the one it authenticated with.
    ///
    /// # Errors
    /// Returns [`AuthError::Internal`] if the store fails.
    pub async fn active_sessions(
        &self,
        principal: &Principal,
        current_refresh_token: Option<&str>,
    ) -> AuthResult<Vec<ActiveSession>> {
        self.sessions
            .active_sessions(
                principal.user_id,
                principal.session_id,
                current_refresh_token,
            )
            .await
    }

    /// # Errors
    /// Returns [`AuthError::Internal`] if the store fails.
    pub async fn logout_session(&self, user_id: i64, session_public_id: &str) -> AuthResult<bool> {
        self.sessions.logout(user_id, session_public_id).await
    }

    /// Change the password of an authenticated user and end every session.
    ///
    /// # Errors
    /// - [`AuthError::InvalidCredentials`] when `current` is wrong.
    /// - [`AuthError::WeakPassword`] or [`AuthError::PasswordSameAsOld`] for a
    ///   rejected new password.
    pub async fn change_password(
        &self,
        user_id: i64,
        current: SecretString,
        new_password: SecretString,
    ) -> AuthResult<()> {
        let user = self
            .user_by_id(user_id)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        let verification = self
            .passwords
            .verify(current.clone(), user.password_hash.clone())
            .await?;
        if !verification.matched {
            return Err(AuthError::InvalidCredentials);
        }
        if !meets_policy(new_password.expose_secret()) {
            return Err(AuthError::WeakPassword);
        }
        if new_password.expose_secret() == current.expose_secret() {
            return Err(AuthError::PasswordSameAsOld);
        }

        self.replace_password(&user, new_password).await
    }

    async fn replace_password(&self, user: &User, new_password: SecretString) -> AuthResult<()> {
        let hash = self.passwords.hash(new_password).await?;
        bounded(
            self.config.store_timeout(),
            "update password hash",
            self.store.update_password_hash(user.id, &hash),
        )
        .await?;
        let revoked = self.families.revoke_all_for_user(user.id).await?;
        info!(user_id = user.id, revoked, "Password replaced, sessions revoked");

        self.deliver(EmailMessage {
            to_email: user.email.clone(),
            template: EmailTemplate::PasswordChanged,
            payload: json!({ "username": user.username }),
        })
        .await;
        Ok(())
    }

    /// Email a reset link if the address belongs to an account.
    /// Always succeeds from the caller's point of view.
    pub async fn forgot_password(&self, email: &str) {
        let email = normalize_identifier(email);
        let user = match self.find_user(&email).await {
            Ok(Some(user)) if user.email == email => user,
            Ok(_) => {
                debug!("Password reset requested for unknown email");
                return;
            }
            Err(err) => {
                error!("Password reset lookup failed: {err}");
                return;
            }
        };

        let issued = async {
            let token = generate_secret()?;
            let now = self.clock.now();
            bounded(
                self.config.store_timeout(),
                "insert reset token",
                self.store.insert_one_time_token(
                    OneTimePurpose::PasswordReset,
                    user.id,
                    &self.keys.secrets.hash(&token),
                    now + self.config.reset_token_ttl(),
                    now,
                ),
            )
            .await?;
            anyhow::Ok(token)
        }
        .await;

        match issued {
            Ok(token) => {
                info!(user_id = user.id, "Password reset issued");
                self.deliver(EmailMessage {
                    to_email: user.email.clone(),
                    template: EmailTemplate::PasswordReset,
                    payload: json!({ "reset_url": self.config.reset_url(&token) }),
                })
                .await;
            }
            Err(err) => error!(user_id = user.id, "Failed to issue reset token: {err:#}"),
        }
    }

    /// Set a new password from a reset token and revoke every family.
    ///
    /// # Errors
    /// - [`AuthError::ResetTokenInvalid`] for unknown or expired tokens.
    /// - [`AuthError::ResetTokenUsed`] when the token was consumed already.
    /// - [`AuthError::WeakPassword`] or [`AuthError::PasswordSameAsOld`].
    pub async fn reset_password(&self, token: &str, new_password: SecretString) -> AuthResult<()> {
        if !meets_policy(new_password.expose_secret()) {
            return Err(AuthError::WeakPassword);
        }
        let now = self.clock.now();
        let record = bounded(
            self.config.store_timeout(),
            "lookup reset token",
            self.store
                .find_one_time_token(OneTimePurpose::PasswordReset, &self.keys.secrets.hash(token)),
        )
        .await?
        .ok_or(AuthError::ResetTokenInvalid)?;

        if record.used_at.is_some() {
            return Err(AuthError::ResetTokenUsed);
        }
        if record.expires_at <= now {
            return Err(AuthError::ResetTokenInvalid);
        }

        let user = self
            .user_by_id(record.user_id)
            .await?
            .ok_or(AuthError::ResetTokenInvalid)?;
        let same = self
            .passwords
            .verify(new_password.clone(), user.password_hash.clone())
            .await?;
        if same.matched {
            return Err(AuthError::PasswordSameAsOld);
        }

        let consumed = bounded(
            self.config.store_timeout(),
            "consume reset token",
            self.store
                .consume_one_time_token(OneTimePurpose::PasswordReset, record.id, now),
        )
        .await?;
        if !consumed {
            return Err(AuthError::ResetTokenUsed);
        }

        self.replace_password(&user, new_password).await
    }

    /// Send a one-time code to `email` for `purpose`, replacing earlier codes.
    ///
    /// # Errors
    /// [`AuthError::InvalidInput`] for a malformed email, otherwise internal failures.
    pub async fn issue_email_otp(
        &self,
        email: &str,
        purpose: &str,
        device: &DeviceInfo,
    ) -> AuthResult<()> {
        let email = normalize_identifier(email);
        if !valid_email(&email) {
            return Err(AuthError::InvalidInput("email"));
        }
        let code = generate_otp();
        let now = self.clock.now();
        bounded(
            self.config.store_timeout(),
            "store email otp",
            self.store.replace_email_otp(
                NewEmailOtp {
                    email: email.clone(),
                    purpose: purpose.to_string(),
                    otp_hash: self.keys.secrets.hash(&code),
                    expires_at: now + self.config.otp_ttl(),
                    device: device.clone(),
                },
                now,
            ),
        )
        .await?;

        self.deliver(EmailMessage {
            to_email: email,
            template: EmailTemplate::OneTimeCode,
            payload: json!({
                "code": code,
                "purpose": purpose,
                "expires_in_minutes": self.config.otp_ttl().num_minutes(),
            }),
        })
        .await;
        Ok(())
    }

    /// Check and consume a one-time code. Guessing is throttled like logins.
    ///
    /// # Errors
    /// [`AuthError::RateLimited`] after too many wrong codes,
    /// [`AuthError::InvalidCredentials`] for a wrong, expired, or used code.
    pub async fn verify_email_otp(
        &self,
        email: &str,
        purpose: &str,
        code: &str,
        device: &DeviceInfo,
    ) -> AuthResult<()> {
        let email = normalize_identifier(email);
        let key = format!("otp:{purpose}:{email}");
        if self.guard.is_rate_limited(&key).await {
            return Err(AuthError::RateLimited);
        }

        let now = self.clock.now();
        let otp = bounded(
            self.config.store_timeout(),
            "lookup email otp",
            self.store.find_email_otp(&email, purpose, now),
        )
        .await?;

        let matched = otp
            .as_ref()
            .is_some_and(|otp| self.keys.secrets.matches(&otp.otp_hash, code.trim()));
        let Some(otp) = otp.filter(|_| matched) else {
            self.guard
                .record_failed_attempt(&LoginAttempt::failure(
                    &key,
                    None,
                    device,
                    FailureReason::InvalidCode,
                    now,
                ))
                .await;
            return Err(AuthError::InvalidCredentials);
        };

        let deleted = bounded(
            self.config.store_timeout(),
            "consume email otp",
            self.store.delete_email_otp(otp.id),
        )
        .await?;
        if !deleted {
            return Err(AuthError::InvalidCredentials);
        }
        self.guard
            .reset_attempts(&LoginAttempt {
                identifier: key,
                user_id: None,
                ip: device.ip.clone(),
                user_agent: device.user_agent.clone(),
                success: true,
                failure_reason: None,
                attempted_at: now,
            })
            .await;
        Ok(())
    }

    /// Lock or unlock an account. Locking also revokes every family.
    ///
    /// # Errors
    /// Returns [`AuthError::Internal`] if the store fails.
    pub async fn set_account_locked(&self, user_id: i64, locked: bool) -> AuthResult<()> {
        bounded(
            self.config.store_timeout(),
            "update lock flag",
            self.store.set_locked(user_id, locked),
        )
        .await?;
        if locked {
            self.families.revoke_all_for_user(user_id).await?;
        }
        info!(user_id, locked, "Account lock updated");
        Ok(())
    }

    /// Soft-delete an account after re-checking its password.
    ///
    /// # Errors
    /// [`AuthError::InvalidCredentials`] when the password is wrong.
    pub async fn delete_account(&self, user_id: i64, password: SecretString) -> AuthResult<()> {
        let user = self
            .user_by_id(user_id)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        let verification = self
            .passwords
            .verify(password, user.password_hash.clone())
            .await?;
        if !verification.matched {
            return Err(AuthError::InvalidCredentials);
        }
        bounded(
            self.config.store_timeout(),
            "delete user",
            self.store.soft_delete_user(user.id, self.clock.now()),
        )
        .await?;
        self.families.revoke_all_for_user(user.id).await?;
        info!(user_id, "Account deleted");
        Ok(())
    }

    /// Remove expired tokens, codes, and attempts past retention.
    ///
    /// # Errors
    /// Returns [`AuthError::Internal`] if the store fails.
    pub async fn prune(&self) -> AuthResult<PruneReport> {
        let now = self.clock.now();
        let timeout = self.config.store_timeout();
        let report = PruneReport {
            refresh_tokens: bounded(
                timeout,
                "prune refresh tokens",
                self.store.prune_refresh_tokens(now),
            )
            .await?,
            one_time_tokens: bounded(
                timeout,
                "prune one-time tokens",
                self.store.prune_one_time_tokens(now),
            )
            .await?,
            email_otps: bounded(timeout, "prune otps", self.store.prune_email_otps(now)).await?,
            login_attempts: bounded(
                timeout,
                "prune login attempts",
                self.store
                    .prune_attempts(now - self.config.attempt_retention()),
            )
            .await?,
        };
        info!(?report, "Pruned expired auth state");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_normalized() {
        assert_eq!(normalize_identifier("  Ada@Example.COM "), "ada@example.com");
    }

    #[test]
    fn email_and_username_validation() {
        assert!(valid_email("ada@example.com"));
        assert!(!valid_email("ada@example"));
        assert!(!valid_email("ada example@x.io"));
        assert!(valid_username("ada_l-1"));
        assert!(!valid_username("ab"));
        assert!(!valid_username("-ada"));
        assert!(!valid_username("ada lovelace"));
    }
}
