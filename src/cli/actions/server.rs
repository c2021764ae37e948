use crate::{
    auth::{
        Argon2Params, AttemptCounter, AuthConfig, AuthService, HashingPool, Keyring,
        MemoryAttemptCounter, PasswordConfig, PasswordHasher, PublicIdCodec, RateLimitPolicy,
        SecretHasher, TokenSigner,
    },
    cli::globals::GlobalArgs,
    credo::{self, ApiState},
    email::{EmailSender, LogEmailSender, WebhookEmailSender},
    store::{AuthStore, MemoryStore, PgStore},
};
use anyhow::{anyhow, Context, Result};
use secrecy::SecretString;
use sqlx::PgPool;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};
use url::Url;

const MAIL_TIMEOUT_SECONDS: u64 = 10;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub max_connections: u32,
    pub frontend_base_url: String,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
    pub reset_token_ttl_seconds: i64,
    pub verification_token_ttl_seconds: i64,
    pub otp_ttl_seconds: i64,
    pub max_login_attempts: u32,
    pub max_ip_attempts: u32,
    pub login_window_seconds: i64,
    pub memory_rate_limit: bool,
    pub trust_forwarded_for: bool,
    pub store_timeout_seconds: u64,
    pub prune_interval_seconds: u64,
    pub mail_webhook_url: Option<Url>,
    pub argon2: Argon2Params,
    pub hash_workers: Option<usize>,
}

impl Args {
    fn auth_config(&self) -> AuthConfig {
        AuthConfig::new(self.frontend_base_url.clone())
            .with_reset_token_ttl(chrono::Duration::seconds(self.reset_token_ttl_seconds))
            .with_verification_token_ttl(chrono::Duration::seconds(
                self.verification_token_ttl_seconds,
            ))
            .with_otp_ttl(chrono::Duration::seconds(self.otp_ttl_seconds))
            .with_rate_limit(RateLimitPolicy {
                max_attempts: self.max_login_attempts,
                ip_max_attempts: self.max_ip_attempts,
                window: chrono::Duration::seconds(self.login_window_seconds),
            })
            .with_store_timeout(Duration::from_secs(self.store_timeout_seconds))
    }

    /// Cookies are only marked `Secure` when the frontend is served over HTTPS.
    fn cookie_secure(&self) -> bool {
        self.frontend_base_url.starts_with("https://")
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if key material is invalid, the database is unreachable,
/// or the server fails to start.
pub async fn execute(args: Args, globals: &GlobalArgs) -> Result<()> {
    let keys = Arc::new(keyring(&args, globals)?);
    let passwords = hashing_pool(&args, globals)?;

    let (store, pool) = open_store(&args).await?;
    let mailer = mailer(&args)?;
    let config = args.auth_config();

    let mut builder =
        AuthService::builder(Arc::clone(&store), keys, passwords, config).with_mailer(mailer);
    if args.memory_rate_limit {
        let counter: Arc<dyn AttemptCounter> = Arc::new(MemoryAttemptCounter::new(
            chrono::Duration::seconds(args.login_window_seconds),
        ));
        builder = builder.with_attempt_counter(counter);
    }
    let auth = Arc::new(builder.build());

    if args.trust_forwarded_for {
        info!("Client addresses are taken from X-Forwarded-For");
    }
    let state = Arc::new(
        ApiState::new(auth, pool, args.cookie_secure()).with_trusted_proxy(args.trust_forwarded_for),
    );
    credo::new(
        args.port,
        state,
        Duration::from_secs(args.prune_interval_seconds),
    )
    .await
}

fn keyring(args: &Args, globals: &GlobalArgs) -> Result<Keyring> {
    let signer = TokenSigner::new(
        &globals.access_secret,
        &globals.refresh_secret,
        chrono::Duration::seconds(args.access_ttl_seconds),
        chrono::Duration::seconds(args.refresh_ttl_seconds),
    )
    .context("Invalid token signing keys")?;
    let ids = PublicIdCodec::new(&globals.public_id_key).context("Invalid public id key")?;
    let secrets =
        SecretHasher::new(&globals.token_hash_secret).context("Invalid token hash key")?;
    Ok(Keyring::new(signer, ids, secrets))
}

fn hashing_pool(args: &Args, globals: &GlobalArgs) -> Result<HashingPool> {
    let current: SecretString = globals
        .current_pepper()
        .cloned()
        .ok_or_else(|| anyhow!("No pepper configured for version {}", globals.pepper_version))?;

    let config = globals
        .peppers
        .iter()
        .filter(|(version, _)| *version != globals.pepper_version)
        .fold(
            PasswordConfig::new(globals.pepper_version, current).with_params(args.argon2),
            |config, (version, pepper)| config.with_pepper(*version, pepper.clone()),
        );

    let workers = args.hash_workers.unwrap_or_else(HashingPool::default_workers);
    info!(
        pepper_version = globals.pepper_version,
        workers, "Password hashing configured"
    );
    Ok(HashingPool::new(PasswordHasher::new(config), workers))
}

async fn open_store(args: &Args) -> Result<(Arc<dyn AuthStore>, Option<PgPool>)> {
    match &args.dsn {
        Some(dsn) => {
            let store = PgStore::connect(dsn, args.max_connections).await?;
            store.migrate().await?;
            let pool = store.pool().clone();
            info!("Using Postgres store");
            Ok((Arc::new(store), Some(pool)))
        }
        None => {
            warn!("No DSN configured, using the in-memory store; state is lost on restart");
            Ok((Arc::new(MemoryStore::new()), None))
        }
    }
}

fn mailer(args: &Args) -> Result<Arc<dyn EmailSender>> {
    match &args.mail_webhook_url {
        Some(url) => {
            info!(url = %url, "Delivering email through webhook");
            Ok(Arc::new(WebhookEmailSender::new(
                url.clone(),
                Duration::from_secs(MAIL_TIMEOUT_SECONDS),
            )?))
        }
        None => Ok(Arc::new(LogEmailSender)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::Zeroizing;

    fn args() -> Args {
        Args {
            port: 8080,
            dsn: None,
            max_connections: 5,
            frontend_base_url: "https://app.example.com".to_string(),
            access_ttl_seconds: 900,
            refresh_ttl_seconds: 604_800,
            reset_token_ttl_seconds: 1800,
            verification_token_ttl_seconds: 86_400,
            otp_ttl_seconds: 600,
            max_login_attempts: 5,
            max_ip_attempts: 20,
            login_window_seconds: 900,
            memory_rate_limit: false,
            trust_forwarded_for: false,
            store_timeout_seconds: 5,
            prune_interval_seconds: 3600,
            mail_webhook_url: None,
            argon2: Argon2Params::default(),
            hash_workers: Some(1),
        }
    }

    fn globals() -> GlobalArgs {
        GlobalArgs {
            access_secret: SecretString::from("access"),
            refresh_secret: SecretString::from("refresh"),
            token_hash_secret: SecretString::from("hash"),
            public_id_key: Zeroizing::new(vec![9u8; 32]),
            peppers: vec![(1, SecretString::from("pepper"))],
            pepper_version: 1,
        }
    }

    #[test]
    fn config_follows_args() {
        let config = args().auth_config();
        assert_eq!(config.rate_limit().max_attempts, 5);
        assert_eq!(config.reset_token_ttl(), chrono::Duration::minutes(30));
        assert_eq!(config.store_timeout(), Duration::from_secs(5));
        assert!(args().cookie_secure());
    }

    #[test]
    fn keyring_rejects_identical_signing_keys() {
        let mut globals = globals();
        assert!(keyring(&args(), &globals).is_ok());
        globals.refresh_secret = SecretString::from("access");
        assert!(keyring(&args(), &globals).is_err());
    }

    #[test]
    fn hashing_pool_requires_current_pepper() {
        let mut globals = globals();
        assert!(hashing_pool(&args(), &globals).is_ok());
        globals.pepper_version = 3;
        assert!(hashing_pool(&args(), &globals).is_err());
    }
}
