//! Signing keys, peppers, and hashing cost.

use anyhow::{anyhow, Context, Result};
use base64ct::{Base64, Encoding};
use clap::{Arg, ArgAction, Command};
use secrecy::SecretString;
use zeroize::Zeroizing;

pub const ARG_ACCESS_SECRET: &str = "access-secret";
pub const ARG_REFRESH_SECRET: &str = "refresh-secret";
pub const ARG_TOKEN_HASH_SECRET: &str = "token-hash-secret";
pub const ARG_PUBLIC_ID_KEY: &str = "public-id-key";
pub const ARG_PEPPER: &str = "pepper";
pub const ARG_PEPPER_VERSION: &str = "pepper-version";
pub const ARG_ARGON2_MEMORY: &str = "argon2-memory-kib";
pub const ARG_ARGON2_ITERATIONS: &str = "argon2-iterations";
pub const ARG_ARGON2_PARALLELISM: &str = "argon2-parallelism";
pub const ARG_HASH_WORKERS: &str = "hash-workers";

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_secret_args(command);
    with_argon2_args(command)
}

fn with_secret_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ACCESS_SECRET)
                .long(ARG_ACCESS_SECRET)
                .help("HMAC key for access tokens")
                .env("CREDO_ACCESS_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_REFRESH_SECRET)
                .long(ARG_REFRESH_SECRET)
                .help("HMAC key for refresh tokens, must differ from the access key")
                .env("CREDO_REFRESH_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_TOKEN_HASH_SECRET)
                .long(ARG_TOKEN_HASH_SECRET)
                .help("HMAC key used to hash stored refresh, reset, and verification tokens")
                .env("CREDO_TOKEN_HASH_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_PUBLIC_ID_KEY)
                .long(ARG_PUBLIC_ID_KEY)
                .help("Base64 encoded 32 byte key for opaque public ids")
                .env("CREDO_PUBLIC_ID_KEY")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_PEPPER)
                .long(ARG_PEPPER)
                .help("Password pepper as VERSION:SECRET, repeat to keep older peppers")
                .env("CREDO_PEPPERS")
                .hide_env_values(true)
                .action(ArgAction::Append)
                .value_delimiter(',')
                .required(true),
        )
        .arg(
            Arg::new(ARG_PEPPER_VERSION)
                .long(ARG_PEPPER_VERSION)
                .help("Pepper version used for new hashes (default: highest configured)")
                .env("CREDO_PEPPER_VERSION")
                .value_parser(clap::value_parser!(u32)),
        )
}

fn with_argon2_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ARGON2_MEMORY)
                .long(ARG_ARGON2_MEMORY)
                .help("Argon2id memory cost in KiB")
                .env("CREDO_ARGON2_MEMORY_KIB")
                .default_value("65536")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_ARGON2_ITERATIONS)
                .long(ARG_ARGON2_ITERATIONS)
                .help("Argon2id iterations")
                .env("CREDO_ARGON2_ITERATIONS")
                .default_value("3")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_ARGON2_PARALLELISM)
                .long(ARG_ARGON2_PARALLELISM)
                .help("Argon2id lanes")
                .env("CREDO_ARGON2_PARALLELISM")
                .default_value("2")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_HASH_WORKERS)
                .long(ARG_HASH_WORKERS)
                .help("Concurrent password hashing jobs (default: CPUs - 1)")
                .env("CREDO_HASH_WORKERS")
                .value_parser(clap::value_parser!(usize)),
        )
}

/// Parse `VERSION:SECRET`.
///
/// # Errors
/// Returns an error if the version is not a number or the secret is empty.
pub fn parse_pepper(value: &str) -> Result<(u32, SecretString)> {
    let (version, secret) = value
        .split_once(':')
        .ok_or_else(|| anyhow!("pepper must be VERSION:SECRET"))?;
    let version = version
        .trim()
        .parse::<u32>()
        .context("pepper version must be a number")?;
    if secret.is_empty() {
        return Err(anyhow!("pepper {version} has an empty secret"));
    }
    Ok((version, SecretString::from(secret.to_string())))
}

/// Decode the base64 public id key.
///
/// # Errors
/// Returns an error unless the value decodes to exactly 32 bytes.
pub fn parse_public_id_key(value: &str) -> Result<Zeroizing<Vec<u8>>> {
    let key = Zeroizing::new(
        Base64::decode_vec(value.trim()).map_err(|_| anyhow!("public id key is not base64"))?,
    );
    if key.len() != 32 {
        return Err(anyhow!(
            "public id key must be 32 bytes, got {}",
            key.len()
        ));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn pepper_parses_version_and_secret() {
        let (version, secret) = parse_pepper("2:s3cr:et").unwrap();
        assert_eq!(version, 2);
        assert_eq!(secret.expose_secret(), "s3cr:et");
    }

    #[test]
    fn pepper_rejects_bad_input() {
        assert!(parse_pepper("nope").is_err());
        assert!(parse_pepper("x:secret").is_err());
        assert!(parse_pepper("1:").is_err());
    }

    #[test]
    fn public_id_key_length_checked() {
        let key = Base64::encode_string(&[7u8; 32]);
        assert_eq!(parse_public_id_key(&key).unwrap().len(), 32);

        let short = Base64::encode_string(&[7u8; 16]);
        assert!(parse_public_id_key(&short).is_err());
        assert!(parse_public_id_key("***").is_err());
    }
}
