//! Credential and token lifecycle.
//!
//! [`service::AuthService`] is the entry point; the other modules are its
//! building blocks and are usable on their own.

pub mod clock;
pub mod config;
pub mod error;
pub mod families;
pub mod jwt;
pub mod password;
pub mod public_id;
pub mod rate_limit;
pub mod secret;
pub mod service;
pub mod sessions;

use anyhow::{anyhow, Context};
use std::future::Future;
use std::time::Duration;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AuthConfig, RateLimitPolicy};
pub use error::{AuthError, AuthResult};
pub use families::{FamilyEngine, IssuedCredentials};
pub use jwt::{TokenKind, TokenPayload, TokenSigner};
pub use password::{Argon2Params, HashingPool, PasswordConfig, PasswordHasher, Verification};
pub use public_id::PublicIdCodec;
pub use rate_limit::{AttemptCounter, LoginGuard, MemoryAttemptCounter, StoreAttemptCounter};
pub use secret::SecretHasher;
pub use service::AuthService;
pub use sessions::{ActiveSession, SessionRegistry};

/// Keys shared by every component that mints or reads tokens.
#[derive(Debug)]
pub struct Keyring {
    pub signer: TokenSigner,
    pub ids: PublicIdCodec,
    pub secrets: SecretHasher,
}

impl Keyring {
    #[must_use]
    pub fn new(signer: TokenSigner, ids: PublicIdCodec, secrets: SecretHasher) -> Self {
        Self {
            signer,
            ids,
            secrets,
        }
    }
}

/// Run a store call under a deadline. Elapsed deadlines become errors.
pub(crate) async fn bounded<T, F>(limit: Duration, what: &'static str, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.with_context(|| format!("{what} failed")),
        Err(_) => Err(anyhow!("{what} timed out after {limit:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_times_out() {
        let result: anyhow::Result<()> = bounded(Duration::from_millis(10), "sleep", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        let err = result.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(err.contains("sleep timed out"), "{err}");
    }

    #[tokio::test]
    async fn bounded_passes_through() {
        let value = bounded(Duration::from_secs(1), "noop", async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
