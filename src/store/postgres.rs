//! PostgreSQL backend.
//!
//! Multi-row state changes (opening a family, rotating a token, revoking a
//! family) each run in a single transaction. Rotation locks the presented
//! token and its family with `FOR UPDATE` so concurrent presentations of the
//! same token serialize and exactly one of them wins.

use super::{
    AttemptKey, DeviceInfo, EmailOtp, FirstToken, LoginAttempt, LoginAttemptStore, NewEmailOtp,
    NewRefreshToken, NewUser, OneTimePurpose, OneTimeToken, OneTimeTokenStore, OpenedFamily,
    RefreshTokenFamily, RefreshTokenRecord, Rotation, SessionStore, TokenStore, User, UserSession,
    UserStore,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    PgPool, Postgres, Row, Transaction,
};
use std::time::Duration;
use tracing::{Instrument, Span};

const SCHEMA: &str = include_str!("../../sql/schema.sql");

fn db_span(operation: &'static str, statement: &'static str) -> Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with a bounded pool.
    ///
    /// # Errors
    /// Returns an error if the DSN is invalid or the database is unreachable.
    pub async fn connect(dsn: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(dsn)
            .await
            .context("failed to connect to database")?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they are missing.
    ///
    /// # Errors
    /// Returns an error if any statement fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .instrument(db_span("MIGRATE", "schema.sql"))
            .await
            .context("failed to apply schema")?;
        Ok(())
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn user_from_row(row: &PgRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        role: row.try_get("role")?,
        locked: row.try_get("locked")?,
        email_verified: row.try_get("email_verified")?,
        created_at: row.try_get("created_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn family_from_row(row: &PgRow) -> Result<RefreshTokenFamily> {
    Ok(RefreshTokenFamily {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        created_at: row.try_get("created_at")?,
        revoked_at: row.try_get("revoked_at")?,
    })
}

fn token_from_row(row: &PgRow) -> Result<RefreshTokenRecord> {
    Ok(RefreshTokenRecord {
        id: row.try_get("id")?,
        family_id: row.try_get("family_id")?,
        user_id: row.try_get("user_id")?,
        jti: row.try_get("jti")?,
        token_hash: row.try_get("token_hash")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
        revoked_at: row.try_get("revoked_at")?,
        used_at: row.try_get("used_at")?,
        ip: row.try_get("ip")?,
        user_agent: row.try_get("user_agent")?,
    })
}

fn session_from_row(row: &PgRow) -> Result<UserSession> {
    Ok(UserSession {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        family_id: row.try_get("family_id")?,
        ip: row.try_get("ip")?,
        user_agent: row.try_get("user_agent")?,
        login_at: row.try_get("login_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        logout_at: row.try_get("logout_at")?,
    })
}

fn one_time_from_row(purpose: OneTimePurpose, row: &PgRow) -> Result<OneTimeToken> {
    Ok(OneTimeToken {
        id: row.try_get("id")?,
        purpose,
        user_id: row.try_get("user_id")?,
        token_hash: row.try_get("token_hash")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
        used_at: row.try_get("used_at")?,
    })
}

fn otp_from_row(row: &PgRow) -> Result<EmailOtp> {
    Ok(EmailOtp {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        purpose: row.try_get("purpose")?,
        otp_hash: row.try_get("otp_hash")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
        ip: row.try_get("ip")?,
        user_agent: row.try_get("user_agent")?,
    })
}

async fn insert_token(
    tx: &mut Transaction<'_, Postgres>,
    family_id: i64,
    user_id: i64,
    token: &NewRefreshToken,
    now: DateTime<Utc>,
) -> Result<RefreshTokenRecord> {
    let query = r"
        INSERT INTO refresh_tokens
            (family_id, user_id, jti, token_hash, expires_at, created_at, ip, user_agent)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id, family_id, user_id, jti, token_hash, expires_at, created_at,
                  revoked_at, used_at, ip, user_agent
    ";
    let row = sqlx::query(query)
        .bind(family_id)
        .bind(user_id)
        .bind(&token.jti)
        .bind(&token.token_hash)
        .bind(token.expires_at)
        .bind(now)
        .bind(token.device.ip.as_deref())
        .bind(token.device.user_agent.as_deref())
        .fetch_one(&mut **tx)
        .instrument(db_span("INSERT", query))
        .await
        .context("failed to insert refresh token")?;
    token_from_row(&row)
}

async fn revoke_family_tx(
    tx: &mut Transaction<'_, Postgres>,
    family_id: i64,
    now: DateTime<Utc>,
) -> Result<bool> {
    let query = "UPDATE refresh_token_families SET revoked_at = $2 WHERE id = $1 AND revoked_at IS NULL";
    let newly = sqlx::query(query)
        .bind(family_id)
        .bind(now)
        .execute(&mut **tx)
        .instrument(db_span("UPDATE", query))
        .await
        .context("failed to revoke family")?
        .rows_affected()
        > 0;

    let query = "UPDATE refresh_tokens SET revoked_at = $2 WHERE family_id = $1 AND revoked_at IS NULL";
    sqlx::query(query)
        .bind(family_id)
        .bind(now)
        .execute(&mut **tx)
        .instrument(db_span("UPDATE", query))
        .await
        .context("failed to revoke family tokens")?;

    let query = "UPDATE user_sessions SET logout_at = $2 WHERE family_id = $1 AND logout_at IS NULL";
    sqlx::query(query)
        .bind(family_id)
        .bind(now)
        .execute(&mut **tx)
        .instrument(db_span("UPDATE", query))
        .await
        .context("failed to close family session")?;

    Ok(newly)
}

#[async_trait]
impl UserStore for PgStore {
    async fn create_user(&self, user: NewUser, now: DateTime<Utc>) -> Result<Option<User>> {
        let query = r"
            INSERT INTO users (email, username, password_hash, role, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, email, username, password_hash, role, locked, email_verified,
                      created_at, deleted_at
        ";
        let row = sqlx::query(query)
            .bind(&user.email)
            .bind(&user.username)
            .bind(&user.password_hash)
            .bind(&user.role)
            .bind(now)
            .fetch_one(&self.pool)
            .instrument(db_span("INSERT", query))
            .await;

        match row {
            Ok(row) => user_from_row(&row).map(Some),
            Err(err) if is_unique_violation(&err) => Ok(None),
            Err(err) => Err(err).context("failed to insert user"),
        }
    }

    async fn find_user_by_identifier(&self, identifier: &str) -> Result<Option<User>> {
        let query = r"
            SELECT id, email, username, password_hash, role, locked, email_verified,
                   created_at, deleted_at
            FROM users
            WHERE lower(email) = lower($1) OR lower(username) = lower($1)
            ORDER BY deleted_at NULLS FIRST
            LIMIT 1
        ";
        let row = sqlx::query(query)
            .bind(identifier)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lookup user")?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_user_by_id(&self, user_id: i64) -> Result<Option<User>> {
        let query = r"
            SELECT id, email, username, password_hash, role, locked, email_verified,
                   created_at, deleted_at
            FROM users
            WHERE id = $1
        ";
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lookup user by id")?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn update_password_hash(&self, user_id: i64, password_hash: &str) -> Result<()> {
        let query = "UPDATE users SET password_hash = $2 WHERE id = $1";
        sqlx::query(query)
            .bind(user_id)
            .bind(password_hash)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to update password hash")?;
        Ok(())
    }

    async fn mark_email_verified(&self, user_id: i64) -> Result<()> {
        let query = "UPDATE users SET email_verified = TRUE WHERE id = $1";
        sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to mark email verified")?;
        Ok(())
    }

    async fn set_locked(&self, user_id: i64, locked: bool) -> Result<()> {
        let query = "UPDATE users SET locked = $2 WHERE id = $1";
        sqlx::query(query)
            .bind(user_id)
            .bind(locked)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to update lock flag")?;
        Ok(())
    }

    async fn soft_delete_user(&self, user_id: i64, now: DateTime<Utc>) -> Result<()> {
        let query = "UPDATE users SET deleted_at = $2 WHERE id = $1 AND deleted_at IS NULL";
        sqlx::query(query)
            .bind(user_id)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to delete user")?;
        Ok(())
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn open_family(
        &self,
        user_id: i64,
        device: &DeviceInfo,
        now: DateTime<Utc>,
        first: FirstToken<'_>,
    ) -> Result<OpenedFamily> {
        let mut tx = self.pool.begin().await.context("begin login transaction")?;

        let query = r"
            INSERT INTO refresh_token_families (user_id, created_at)
            VALUES ($1, $2)
            RETURNING id, user_id, created_at, revoked_at
        ";
        let row = sqlx::query(query)
            .bind(user_id)
            .bind(now)
            .fetch_one(&mut *tx)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to insert token family")?;
        let family = family_from_row(&row)?;

        let first = first(family.id)?;
        let token = insert_token(&mut tx, family.id, user_id, &first, now).await?;

        let query = r"
            INSERT INTO user_sessions (user_id, family_id, ip, user_agent, login_at, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            RETURNING id, user_id, family_id, ip, user_agent, login_at, last_seen_at, logout_at
        ";
        let row = sqlx::query(query)
            .bind(user_id)
            .bind(family.id)
            .bind(device.ip.as_deref())
            .bind(device.user_agent.as_deref())
            .bind(now)
            .fetch_one(&mut *tx)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to insert session")?;
        let session = session_from_row(&row)?;

        tx.commit().await.context("commit login transaction")?;

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
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin rotation transaction")?;

        let query = r"
            SELECT t.id, t.family_id, t.user_id, t.expires_at, t.revoked_at, t.used_at,
                   f.revoked_at AS family_revoked_at,
                   u.role, u.locked, u.deleted_at
            FROM refresh_tokens t
            JOIN refresh_token_families f ON f.id = t.family_id
            JOIN users u ON u.id = t.user_id
            WHERE t.token_hash = $1
            FOR UPDATE OF t, f
            FOR SHARE OF u
        ";
        let row = sqlx::query(query)
            .bind(presented_hash)
            .fetch_optional(&mut *tx)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lock refresh token")?;

        let Some(row) = row else {
            tx.rollback().await.context("rollback rotation")?;
            return Ok(Rotation::NotFound);
        };

        let token_id: i64 = row.try_get("id")?;
        let family_id: i64 = row.try_get("family_id")?;
        let user_id: i64 = row.try_get("user_id")?;
        let expires_at: DateTime<Utc> = row.try_get("expires_at")?;
        let revoked_at: Option<DateTime<Utc>> = row.try_get("revoked_at")?;
        let used_at: Option<DateTime<Utc>> = row.try_get("used_at")?;
        let family_revoked_at: Option<DateTime<Utc>> = row.try_get("family_revoked_at")?;
        let role: String = row.try_get("role")?;
        let locked: bool = row.try_get("locked")?;
        let deleted_at: Option<DateTime<Utc>> = row.try_get("deleted_at")?;

        if revoked_at.is_some() || used_at.is_some() || family_revoked_at.is_some() {
            revoke_family_tx(&mut tx, family_id, now).await?;
            tx.commit().await.context("commit family revocation")?;
            return Ok(Rotation::Reused { user_id, family_id });
        }

        if expires_at <= now {
            tx.rollback().await.context("rollback rotation")?;
            return Ok(Rotation::Expired);
        }

        if locked || deleted_at.is_some() {
            revoke_family_tx(&mut tx, family_id, now).await?;
            tx.commit().await.context("commit family revocation")?;
            return Ok(Rotation::Refused {
                user_id,
                family_id,
                locked: locked && deleted_at.is_none(),
            });
        }

        let query = r"
            UPDATE refresh_tokens SET used_at = $2
            WHERE id = $1 AND used_at IS NULL AND revoked_at IS NULL
        ";
        let consumed = sqlx::query(query)
            .bind(token_id)
            .bind(now)
            .execute(&mut *tx)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to consume refresh token")?
            .rows_affected();

        if consumed == 0 {
            revoke_family_tx(&mut tx, family_id, now).await?;
            tx.commit().await.context("commit family revocation")?;
            return Ok(Rotation::Reused { user_id, family_id });
        }

        let successor = insert_token(&mut tx, family_id, user_id, &successor, now).await?;

        let query = r"
            UPDATE user_sessions SET last_seen_at = $2
            WHERE family_id = $1 AND logout_at IS NULL
            RETURNING id
        ";
        let session_id: Option<i64> = sqlx::query(query)
            .bind(family_id)
            .bind(now)
            .fetch_optional(&mut *tx)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to touch session")?
            .map(|row| row.try_get("id"))
            .transpose()?;

        tx.commit().await.context("commit rotation transaction")?;

        Ok(Rotation::Rotated {
            user_id,
            role,
            family_id,
            session_id,
            successor,
        })
    }

    async fn find_refresh_token(&self, token_hash: &str) -> Result<Option<RefreshTokenRecord>> {
        let query = r"
            SELECT id, family_id, user_id, jti, token_hash, expires_at, created_at,
                   revoked_at, used_at, ip, user_agent
            FROM refresh_tokens
            WHERE token_hash = $1
        ";
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lookup refresh token")?;
        row.as_ref().map(token_from_row).transpose()
    }

    async fn find_family(&self, family_id: i64) -> Result<Option<RefreshTokenFamily>> {
        let query =
            "SELECT id, user_id, created_at, revoked_at FROM refresh_token_families WHERE id = $1";
        let row = sqlx::query(query)
            .bind(family_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lookup token family")?;
        row.as_ref().map(family_from_row).transpose()
    }

    async fn families_for_user(&self, user_id: i64) -> Result<Vec<RefreshTokenFamily>> {
        let query = r"
            SELECT id, user_id, created_at, revoked_at
            FROM refresh_token_families
            WHERE user_id = $1
            ORDER BY id
        ";
        let rows = sqlx::query(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to list token families")?;
        rows.iter().map(family_from_row).collect()
    }

    async fn tokens_in_family(&self, family_id: i64) -> Result<Vec<RefreshTokenRecord>> {
        let query = r"
            SELECT id, family_id, user_id, jti, token_hash, expires_at, created_at,
                   revoked_at, used_at, ip, user_agent
            FROM refresh_tokens
            WHERE family_id = $1
            ORDER BY id
        ";
        let rows = sqlx::query(query)
            .bind(family_id)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to list family tokens")?;
        rows.iter().map(token_from_row).collect()
    }

    async fn revoke_family(&self, family_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin revocation transaction")?;
        let newly = revoke_family_tx(&mut tx, family_id, now).await?;
        tx.commit().await.context("commit revocation transaction")?;
        Ok(newly)
    }

    async fn prune_refresh_tokens(&self, before: DateTime<Utc>) -> Result<u64> {
        let query = r"
            DELETE FROM refresh_tokens t
            USING refresh_token_families f
            WHERE t.family_id = f.id
              AND f.revoked_at IS NOT NULL
              AND t.expires_at < $1
        ";
        let result = sqlx::query(query)
            .bind(before)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to prune refresh tokens")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn find_session(&self, session_id: i64) -> Result<Option<UserSession>> {
        let query = r"
            SELECT id, user_id, family_id, ip, user_agent, login_at, last_seen_at, logout_at
            FROM user_sessions
            WHERE id = $1
        ";
        let row = sqlx::query(query)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lookup session")?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn touch_session(&self, session_id: i64, now: DateTime<Utc>) -> Result<()> {
        let query =
            "UPDATE user_sessions SET last_seen_at = $2 WHERE id = $1 AND logout_at IS NULL";
        sqlx::query(query)
            .bind(session_id)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to touch session")?;
        Ok(())
    }

    async fn active_sessions(&self, user_id: i64) -> Result<Vec<UserSession>> {
        let query = r"
            SELECT id, user_id, family_id, ip, user_agent, login_at, last_seen_at, logout_at
            FROM user_sessions
            WHERE user_id = $1 AND logout_at IS NULL
            ORDER BY last_seen_at DESC NULLS LAST
        ";
        let rows = sqlx::query(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to list sessions")?;
        rows.iter().map(session_from_row).collect()
    }
}

#[async_trait]
impl LoginAttemptStore for PgStore {
    async fn record_attempt(&self, attempt: &LoginAttempt) -> Result<()> {
        let query = r"
            INSERT INTO login_attempts
                (identifier, user_id, ip, user_agent, success, failure_reason, attempted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
        ";
        sqlx::query(query)
            .bind(&attempt.identifier)
            .bind(attempt.user_id)
            .bind(attempt.ip.as_deref())
            .bind(attempt.user_agent.as_deref())
            .bind(attempt.success)
            .bind(attempt.failure_reason.map(|reason| reason.as_str()))
            .bind(attempt.attempted_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to record login attempt")?;
        Ok(())
    }

    async fn count_failed_attempts(
        &self,
        key: AttemptKey<'_>,
        since: DateTime<Utc>,
    ) -> Result<u32> {
        let (query, value) = match key {
            AttemptKey::Identifier(identifier) => (
                r"
                SELECT COUNT(*) AS failures
                FROM login_attempts a
                WHERE a.identifier = $1
                  AND NOT a.success
                  AND a.attempted_at >= $2
                  AND a.attempted_at > COALESCE(
                      (SELECT MAX(s.attempted_at) FROM login_attempts s
                       WHERE s.identifier = $1 AND s.success),
                      '-infinity'::timestamptz)
                ",
                identifier,
            ),
            AttemptKey::Ip(ip) => (
                r"
                SELECT COUNT(*) AS failures
                FROM login_attempts a
                WHERE a.ip = $1
                  AND NOT a.success
                  AND a.attempted_at >= $2
                ",
                ip,
            ),
        };
        let row = sqlx::query(query)
            .bind(value)
            .bind(since)
            .fetch_one(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to count login attempts")?;
        let failures: i64 = row.try_get("failures")?;
        Ok(u32::try_from(failures).unwrap_or(u32::MAX))
    }

    async fn prune_attempts(&self, before: DateTime<Utc>) -> Result<u64> {
        let query = "DELETE FROM login_attempts WHERE attempted_at < $1";
        let result = sqlx::query(query)
            .bind(before)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to prune login attempts")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl OneTimeTokenStore for PgStore {
    async fn insert_one_time_token(
        &self,
        purpose: OneTimePurpose,
        user_id: i64,
        token_hash: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let query = match purpose {
            OneTimePurpose::PasswordReset => {
                "INSERT INTO password_reset_tokens (user_id, token_hash, expires_at, created_at) VALUES ($1, $2, $3, $4)"
            }
            OneTimePurpose::EmailVerification => {
                "INSERT INTO email_verification_tokens (user_id, token_hash, expires_at, created_at) VALUES ($1, $2, $3, $4)"
            }
        };
        sqlx::query(query)
            .bind(user_id)
            .bind(token_hash)
            .bind(expires_at)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to insert one-time token")?;
        Ok(())
    }

    async fn find_one_time_token(
        &self,
        purpose: OneTimePurpose,
        token_hash: &str,
    ) -> Result<Option<OneTimeToken>> {
        let query = match purpose {
            OneTimePurpose::PasswordReset => {
                "SELECT id, user_id, token_hash, expires_at, created_at, used_at FROM password_reset_tokens WHERE token_hash = $1"
            }
            OneTimePurpose::EmailVerification => {
                "SELECT id, user_id, token_hash, expires_at, created_at, used_at FROM email_verification_tokens WHERE token_hash = $1"
            }
        };
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lookup one-time token")?;
        row.as_ref()
            .map(|row| one_time_from_row(purpose, row))
            .transpose()
    }

    async fn consume_one_time_token(
        &self,
        purpose: OneTimePurpose,
        token_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let query = match purpose {
            OneTimePurpose::PasswordReset => {
                "UPDATE password_reset_tokens SET used_at = $2 WHERE id = $1 AND used_at IS NULL"
            }
            OneTimePurpose::EmailVerification => {
                "UPDATE email_verification_tokens SET used_at = $2 WHERE id = $1 AND used_at IS NULL"
            }
        };
        let result = sqlx::query(query)
            .bind(token_id)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to consume one-time token")?;
        Ok(result.rows_affected() == 1)
    }

    async fn prune_one_time_tokens(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut removed = 0;
        for query in [
            "DELETE FROM password_reset_tokens WHERE expires_at < $1",
            "DELETE FROM email_verification_tokens WHERE expires_at < $1",
        ] {
            removed += sqlx::query(query)
                .bind(before)
                .execute(&self.pool)
                .instrument(db_span("DELETE", query))
                .await
                .context("failed to prune one-time tokens")?
                .rows_affected();
        }
        Ok(removed)
    }

    async fn replace_email_otp(&self, otp: NewEmailOtp, now: DateTime<Utc>) -> Result<EmailOtp> {
        let mut tx = self.pool.begin().await.context("begin otp transaction")?;

        let query = "DELETE FROM email_otps WHERE email = $1 AND purpose = $2";
        sqlx::query(query)
            .bind(&otp.email)
            .bind(&otp.purpose)
            .execute(&mut *tx)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to clear previous otp")?;

        let query = r"
            INSERT INTO email_otps (email, purpose, otp_hash, expires_at, created_at, ip, user_agent)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, email, purpose, otp_hash, expires_at, created_at, ip, user_agent
        ";
        let row = sqlx::query(query)
            .bind(&otp.email)
            .bind(&otp.purpose)
            .bind(&otp.otp_hash)
            .bind(otp.expires_at)
            .bind(now)
            .bind(otp.device.ip.as_deref())
            .bind(otp.device.user_agent.as_deref())
            .fetch_one(&mut *tx)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to insert otp")?;
        let record = otp_from_row(&row)?;

        tx.commit().await.context("commit otp transaction")?;
        Ok(record)
    }

    async fn find_email_otp(
        &self,
        email: &str,
        purpose: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EmailOtp>> {
        let query = r"
            SELECT id, email, purpose, otp_hash, expires_at, created_at, ip, user_agent
            FROM email_otps
            WHERE email = $1 AND purpose = $2 AND expires_at > $3
            ORDER BY created_at DESC
            LIMIT 1
        ";
        let row = sqlx::query(query)
            .bind(email)
            .bind(purpose)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lookup otp")?;
        row.as_ref().map(otp_from_row).transpose()
    }

    async fn delete_email_otp(&self, otp_id: i64) -> Result<bool> {
        let query = "DELETE FROM email_otps WHERE id = $1";
        let result = sqlx::query(query)
            .bind(otp_id)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to delete otp")?;
        Ok(result.rows_affected() == 1)
    }

    async fn prune_email_otps(&self, before: DateTime<Utc>) -> Result<u64> {
        let query = "DELETE FROM email_otps WHERE expires_at < $1";
        let result = sqlx::query(query)
            .bind(before)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to prune otps")?;
        Ok(result.rows_affected())
    }
}
