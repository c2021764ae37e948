//! Map validated CLI arguments to an action and its key material.

use crate::auth::Argon2Params;
use crate::cli::{
    actions::{server::Args, Action},
    commands::{auth, keys},
    globals::GlobalArgs,
};
use anyhow::{anyhow, Context, Result};
use secrecy::SecretString;
use url::Url;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<(Action, GlobalArgs)> {
    let globals = globals(matches)?;

    let mail_webhook_url = matches
        .get_one::<String>(auth::ARG_MAIL_WEBHOOK_URL)
        .map(|url| Url::parse(url).context("invalid --mail-webhook-url"))
        .transpose()?;
    let frontend_base_url = required::<String>(matches, auth::ARG_FRONTEND_BASE_URL)?;
    Url::parse(&frontend_base_url).context("invalid --frontend-base-url")?;

    let args = Args {
        port: matches.get_one::<u16>("port").copied().unwrap_or(8080),
        dsn: matches.get_one::<String>("dsn").cloned(),
        max_connections: matches
            .get_one::<u32>("max-connections")
            .copied()
            .unwrap_or(5),
        frontend_base_url,
        access_ttl_seconds: required(matches, auth::ARG_ACCESS_TTL)?,
        refresh_ttl_seconds: required(matches, auth::ARG_REFRESH_TTL)?,
        reset_token_ttl_seconds: required(matches, auth::ARG_RESET_TTL)?,
        verification_token_ttl_seconds: required(matches, auth::ARG_VERIFICATION_TTL)?,
        otp_ttl_seconds: required(matches, auth::ARG_OTP_TTL)?,
        max_login_attempts: required(matches, auth::ARG_MAX_LOGIN_ATTEMPTS)?,
        max_ip_attempts: required(matches, auth::ARG_MAX_IP_ATTEMPTS)?,
        login_window_seconds: required(matches, auth::ARG_LOGIN_WINDOW)?,
        memory_rate_limit: matches.get_flag(auth::ARG_MEMORY_RATE_LIMIT),
        trust_forwarded_for: matches.get_flag(auth::ARG_TRUST_FORWARDED_FOR),
        store_timeout_seconds: required(matches, auth::ARG_STORE_TIMEOUT)?,
        prune_interval_seconds: required(matches, auth::ARG_PRUNE_INTERVAL)?,
        mail_webhook_url,
        argon2: Argon2Params {
            memory_kib: required(matches, keys::ARG_ARGON2_MEMORY)?,
            iterations: required(matches, keys::ARG_ARGON2_ITERATIONS)?,
            parallelism: required(matches, keys::ARG_ARGON2_PARALLELISM)?,
            ..Argon2Params::default()
        },
        hash_workers: matches.get_one::<usize>(keys::ARG_HASH_WORKERS).copied(),
    };

    Ok((Action::Server(args), globals))
}

fn required<T: Clone + Send + Sync + 'static>(matches: &clap::ArgMatches, id: &str) -> Result<T> {
    matches
        .get_one::<T>(id)
        .cloned()
        .ok_or_else(|| anyhow!("missing required argument: --{id}"))
}

fn secret(matches: &clap::ArgMatches, id: &str) -> Result<SecretString> {
    required::<String>(matches, id).map(SecretString::from)
}

fn globals(matches: &clap::ArgMatches) -> Result<GlobalArgs> {
    let peppers = matches
        .get_many::<String>(keys::ARG_PEPPER)
        .ok_or_else(|| anyhow!("missing required argument: --{}", keys::ARG_PEPPER))?
        .map(|value| keys::parse_pepper(value))
        .collect::<Result<Vec<_>>>()?;

    let pepper_version = match matches.get_one::<u32>(keys::ARG_PEPPER_VERSION) {
        Some(version) => *version,
        None => peppers
            .iter()
            .map(|(version, _)| *version)
            .max()
            .ok_or_else(|| anyhow!("at least one pepper is required"))?,
    };
    if !peppers.iter().any(|(version, _)| *version == pepper_version) {
        return Err(anyhow!("no pepper configured for version {pepper_version}"));
    }

    let public_id_key = keys::parse_public_id_key(&required::<String>(
        matches,
        keys::ARG_PUBLIC_ID_KEY,
    )?)?;

    Ok(GlobalArgs {
        access_secret: secret(matches, keys::ARG_ACCESS_SECRET)?,
        refresh_secret: secret(matches, keys::ARG_REFRESH_SECRET)?,
        token_hash_secret: secret(matches, keys::ARG_TOKEN_HASH_SECRET)?,
        public_id_key,
        peppers,
        pepper_version,
    })
}
