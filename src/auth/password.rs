//! Password hashing with a versioned pepper.
//!
//! Encoded hashes are self-describing:
//!
//! ```text
//! $argon2id$v=19$m=65536,t=3,p=2$pepver=1$<salt>$<digest>
//! ```
//!
//! Salt and digest are unpadded standard base64. The Argon2 input is
//! `HMAC-SHA256(pepper, password)`; the pepper itself is never stored.
//! Hashes without a `pepver` segment predate peppering and are verified
//! against the raw password.

use argon2::{Algorithm, Argon2, Params, Version};
use base64ct::{Base64Unpadded, Encoding};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::Semaphore;
use zeroize::Zeroizing;

const ALGORITHM: &str = "argon2id";
const ARGON2_VERSION: u32 = 19;
const MIN_PASSWORD_CHARS: usize = 8;
const MAX_PASSWORD_CHARS: usize = 256;

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("malformed password hash")]
    MalformedHash,
    #[error("unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("pepper version {0} not available")]
    UnknownPepperVersion(u32),
    #[error("invalid argon2 parameters: {0}")]
    Params(argon2::Error),
    #[error("failed to generate salt")]
    Random(#[from] rand::Error),
}

/// Tunable Argon2id cost parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Argon2Params {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
    pub salt_len: usize,
    pub output_len: usize,
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 2,
            salt_len: 16,
            output_len: 32,
        }
    }
}

#[derive(Clone)]
pub struct PasswordConfig {
    params: Argon2Params,
    peppers: BTreeMap<u32, SecretString>,
    current_pepper_version: u32,
}

impl PasswordConfig {
    #[must_use]
    pub fn new(current_pepper_version: u32, current_pepper: SecretString) -> Self {
        let mut peppers = BTreeMap::new();
        peppers.insert(current_pepper_version, current_pepper);
        Self {
            params: Argon2Params::default(),
            peppers,
            current_pepper_version,
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: Argon2Params) -> Self {
        self.params = params;
        self
    }

    /// Keep an older pepper around so hashes made with it still verify.
    #[must_use]
    pub fn with_pepper(mut self, version: u32, pepper: SecretString) -> Self {
        self.peppers.insert(version, pepper);
        self
    }

    /// Promote `version` to be used for new hashes. The pepper must be known.
    ///
    /// # Errors
    /// Returns [`PasswordError::UnknownPepperVersion`] if no pepper is registered for `version`.
    pub fn with_current_pepper_version(mut self, version: u32) -> Result<Self, PasswordError> {
        if !self.peppers.contains_key(&version) {
            return Err(PasswordError::UnknownPepperVersion(version));
        }
        self.current_pepper_version = version;
        Ok(self)
    }

    #[must_use]
    pub fn params(&self) -> Argon2Params {
        self.params
    }

    #[must_use]
    pub fn current_pepper_version(&self) -> u32 {
        self.current_pepper_version
    }
}

impl fmt::Debug for PasswordConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordConfig")
            .field("params", &self.params)
            .field("pepper_versions", &self.peppers.keys().collect::<Vec<_>>())
            .field("current_pepper_version", &self.current_pepper_version)
            .finish()
    }
}

/// Result of checking a password against a stored hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Verification {
    pub matched: bool,
    /// Set only on a match whose pepper version is older than the current one.
    pub should_rehash: bool,
}

/// Parameters recovered from an encoded hash.
#[derive(Debug, PartialEq, Eq)]
struct ParsedHash {
    memory_kib: u32,
    iterations: u32,
    parallelism: u32,
    pepper_version: Option<u32>,
    salt: Vec<u8>,
    digest: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct PasswordHasher {
    config: PasswordConfig,
}

impl PasswordHasher {
    #[must_use]
    pub fn new(config: PasswordConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &PasswordConfig {
        &self.config
    }

    /// Hash `password` with the current parameters and pepper.
    ///
    /// # Errors
    /// Returns an error if the salt cannot be generated or the parameters are invalid.
    pub fn hash(&self, password: &str) -> Result<String, PasswordError> {
        let params = self.config.params;
        let version = self.config.current_pepper_version;

        let mut salt = Zeroizing::new(vec![0u8; params.salt_len]);
        OsRng.try_fill_bytes(&mut salt)?;

        let input = self.peppered_input(password, Some(version))?;
        let digest = derive(
            &input,
            &salt,
            params.memory_kib,
            params.iterations,
            params.parallelism,
            params.output_len,
        )?;

        Ok(format!(
            "${ALGORITHM}$v={ARGON2_VERSION}$m={},t={},p={}$pepver={version}${}${}",
            params.memory_kib,
            params.iterations,
            params.parallelism,
            Base64Unpadded::encode_string(&salt),
            Base64Unpadded::encode_string(&digest),
        ))
    }

    /// Verify `password` against `encoded` using the parameters stored in the hash.
    ///
    /// # Errors
    /// Returns an error if the hash cannot be parsed or references an unknown pepper.
    pub fn verify(&self, password: &str, encoded: &str) -> Result<Verification, PasswordError> {
        let parsed = parse_hash(encoded)?;
        let input = self.peppered_input(password, parsed.pepper_version)?;
        let computed = derive(
            &input,
            &parsed.salt,
            parsed.memory_kib,
            parsed.iterations,
            parsed.parallelism,
            parsed.digest.len(),
        )?;

        let matched: bool = computed.as_slice().ct_eq(parsed.digest.as_slice()).into();
        let used_version = parsed.pepper_version.unwrap_or(0);
        Ok(Verification {
            matched,
            should_rehash: matched && used_version < self.config.current_pepper_version,
        })
    }

    fn peppered_input(
        &self,
        password: &str,
        version: Option<u32>,
    ) -> Result<Zeroizing<Vec<u8>>, PasswordError> {
        let Some(version) = version else {
            return Ok(Zeroizing::new(password.as_bytes().to_vec()));
        };
        let pepper = self
            .config
            .peppers
            .get(&version)
            .ok_or(PasswordError::UnknownPepperVersion(version))?;
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(pepper.expose_secret().as_bytes()) else {
            return Err(PasswordError::UnknownPepperVersion(version));
        };
        mac.update(password.as_bytes());
        Ok(Zeroizing::new(mac.finalize().into_bytes().to_vec()))
    }
}

fn derive(
    input: &[u8],
    salt: &[u8],
    memory_kib: u32,
    iterations: u32,
    parallelism: u32,
    output_len: usize,
) -> Result<Zeroizing<Vec<u8>>, PasswordError> {
    let params = Params::new(memory_kib, iterations, parallelism, Some(output_len))
        .map_err(PasswordError::Params)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = Zeroizing::new(vec![0u8; output_len]);
    argon2
        .hash_password_into(input, salt, &mut out)
        .map_err(PasswordError::Params)?;
    Ok(out)
}

fn parse_hash(encoded: &str) -> Result<ParsedHash, PasswordError> {
    let parts: Vec<&str> = encoded.split('$').collect();
    let (algorithm, version, costs, pepper, salt, digest) = match parts.as_slice() {
        ["", algorithm, version, costs, pepper, salt, digest] => {
            (*algorithm, *version, *costs, Some(*pepper), *salt, *digest)
        }
        ["", algorithm, version, costs, salt, digest] => {
            (*algorithm, *version, *costs, None, *salt, *digest)
        }
        _ => return Err(PasswordError::MalformedHash),
    };

    if algorithm != ALGORITHM {
        return Err(PasswordError::UnsupportedAlgorithm(algorithm.to_string()));
    }
    if version != format!("v={ARGON2_VERSION}") {
        return Err(PasswordError::MalformedHash);
    }

    let mut memory_kib = None;
    let mut iterations = None;
    let mut parallelism = None;
    for pair in costs.split(',') {
        let (key, value) = pair.split_once('=').ok_or(PasswordError::MalformedHash)?;
        let value: u32 = value.parse().map_err(|_| PasswordError::MalformedHash)?;
        match key {
            "m" => memory_kib = Some(value),
            "t" => iterations = Some(value),
            "p" => parallelism = Some(value),
            _ => return Err(PasswordError::MalformedHash),
        }
    }

    let pepper_version = match pepper {
        Some(segment) => Some(
            segment
                .strip_prefix("pepver=")
                .and_then(|v| v.parse::<u32>().ok())
                .ok_or(PasswordError::MalformedHash)?,
        ),
        None => None,
    };

    let salt = Base64Unpadded::decode_vec(salt).map_err(|_| PasswordError::MalformedHash)?;
    let digest = Base64Unpadded::decode_vec(digest).map_err(|_| PasswordError::MalformedHash)?;
    if salt.is_empty() || digest.is_empty() {
        return Err(PasswordError::MalformedHash);
    }

    Ok(ParsedHash {
        memory_kib: memory_kib.ok_or(PasswordError::MalformedHash)?,
        iterations: iterations.ok_or(PasswordError::MalformedHash)?,
        parallelism: parallelism.ok_or(PasswordError::MalformedHash)?,
        pepper_version,
        salt,
        digest,
    })
}

/// Length bounds applied to new passwords.
#[must_use]
pub fn meets_policy(password: &str) -> bool {
    let chars = password.chars().count();
    (MIN_PASSWORD_CHARS..=MAX_PASSWORD_CHARS).contains(&chars)
}

/// Runs hash/verify on the blocking pool, bounded below the CPU count.
///
/// No lock is held across the Argon2 call; concurrency is capped by a
/// semaphore so credential stuffing cannot starve request handling.
#[derive(Clone, Debug)]
pub struct HashingPool {
    hasher: Arc<PasswordHasher>,
    permits: Arc<Semaphore>,
}

impl HashingPool {
    #[must_use]
    pub fn new(hasher: PasswordHasher, workers: usize) -> Self {
        Self {
            hasher: Arc::new(hasher),
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// One less than the available parallelism, never zero.
    #[must_use]
    pub fn default_workers() -> usize {
        std::thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .saturating_sub(1)
            .max(1)
    }

    #[must_use]
    pub fn hasher(&self) -> &PasswordHasher {
        &self.hasher
    }

    /// # Errors
    /// Returns an error if hashing fails or the worker task panics.
    pub async fn hash(&self, password: SecretString) -> anyhow::Result<String> {
        let permit = self.permits.clone().acquire_owned().await?;
        let hasher = Arc::clone(&self.hasher);
        let encoded = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            hasher.hash(password.expose_secret())
        })
        .await??;
        Ok(encoded)
    }

    /// # Errors
    /// Returns an error if the stored hash is unusable or the worker task panics.
    pub async fn verify(
        &self,
        password: SecretString,
        encoded: String,
    ) -> anyhow::Result<Verification> {
        let permit = self.permits.clone().acquire_owned().await?;
        let hasher = Arc::clone(&self.hasher);
        let verification = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            hasher.verify(password.expose_secret(), &encoded)
        })
        .await??;
        Ok(verification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Cheap parameters so tests stay fast; production defaults are much higher.
    fn fast_params() -> Argon2Params {
        Argon2Params {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
            salt_len: 16,
            output_len: 32,
        }
    }

    fn hasher_v1() -> PasswordHasher {
        PasswordHasher::new(
            PasswordConfig::new(1, SecretString::from("pepper-one")).with_params(fast_params()),
        )
    }

    #[test]
    fn hash_round_trip_current_pepper() -> Result<(), PasswordError> {
        let hasher = hasher_v1();
        let encoded = hasher.hash("correct horse battery staple")?;
        let verification = hasher.verify("correct horse battery staple", &encoded)?;
        assert_eq!(
            verification,
            Verification {
                matched: true,
                should_rehash: false
            }
        );
        Ok(())
    }

    #[test]
    fn wrong_password_does_not_match() -> Result<(), PasswordError> {
        let hasher = hasher_v1();
        let encoded = hasher.hash("correct horse battery staple")?;
        let verification = hasher.verify("Tr0ub4dor&3", &encoded)?;
        assert!(!verification.matched);
        assert!(!verification.should_rehash);
        Ok(())
    }

    #[test]
    fn encoding_is_self_describing() -> Result<(), PasswordError> {
        let encoded = hasher_v1().hash("password123")?;
        assert!(encoded.starts_with("$argon2id$v=19$m=64,t=1,p=1$pepver=1$"));
        let parsed = parse_hash(&encoded)?;
        assert_eq!(parsed.salt.len(), 16);
        assert_eq!(parsed.digest.len(), 32);
        assert_eq!(parsed.pepper_version, Some(1));
        Ok(())
    }

    #[test]
    fn pepper_rotation_requests_rehash() -> Result<(), PasswordError> {
        let old_hash = hasher_v1().hash("password123")?;

        let rotated = PasswordHasher::new(
            PasswordConfig::new(1, SecretString::from("pepper-one"))
                .with_params(fast_params())
                .with_pepper(2, SecretString::from("pepper-two"))
                .with_current_pepper_version(2)?,
        );
        let verification = rotated.verify("password123", &old_hash)?;
        assert!(verification.matched);
        assert!(verification.should_rehash);

        let new_hash = rotated.hash("password123")?;
        assert!(new_hash.contains("$pepver=2$"));
        let verification = rotated.verify("password123", &new_hash)?;
        assert!(verification.matched);
        assert!(!verification.should_rehash);
        Ok(())
    }

    #[test]
    fn old_cost_parameters_still_verify() -> Result<(), PasswordError> {
        let legacy = hasher_v1().hash("password123")?;
        let upgraded = PasswordHasher::new(
            PasswordConfig::new(1, SecretString::from("pepper-one")).with_params(Argon2Params {
                memory_kib: 128,
                iterations: 2,
                ..fast_params()
            }),
        );
        assert!(upgraded.verify("password123", &legacy)?.matched);
        Ok(())
    }

    #[test]
    fn missing_pepper_is_an_error() -> Result<(), PasswordError> {
        let encoded = hasher_v1().hash("password123")?;
        let other = PasswordHasher::new(
            PasswordConfig::new(3, SecretString::from("pepper-three")).with_params(fast_params()),
        );
        assert!(matches!(
            other.verify("password123", &encoded),
            Err(PasswordError::UnknownPepperVersion(1))
        ));
        Ok(())
    }

    #[test]
    fn unpeppered_legacy_hash_verifies_and_rehashes() -> Result<(), PasswordError> {
        let peppered = hasher_v1().hash("password123")?;
        // Build the same shape without a pepper segment over the raw password.
        let parsed = parse_hash(&peppered)?;
        let digest = derive(b"password123", &parsed.salt, 64, 1, 1, 32)?;
        let legacy = format!(
            "$argon2id$v=19$m=64,t=1,p=1${}${}",
            Base64Unpadded::encode_string(&parsed.salt),
            Base64Unpadded::encode_string(&digest)
        );
        let verification = hasher_v1().verify("password123", &legacy)?;
        assert!(verification.matched);
        assert!(verification.should_rehash);
        Ok(())
    }

    #[test]
    fn malformed_hashes_are_rejected() {
        let hasher = hasher_v1();
        for encoded in [
            "",
            "plain",
            "$bcrypt$v=19$m=64,t=1,p=1$pepver=1$c2FsdHNhbHQ$ZGlnZXN0",
            "$argon2id$v=18$m=64,t=1,p=1$pepver=1$c2FsdHNhbHQ$ZGlnZXN0",
            "$argon2id$v=19$m=64,t=1$pepver=1$c2FsdHNhbHQ$ZGlnZXN0",
            "$argon2id$v=19$m=64,t=1,p=1$pepper=1$c2FsdHNhbHQ$ZGlnZXN0",
            "$argon2id$v=19$m=64,t=1,p=1$pepver=1$***$ZGlnZXN0",
        ] {
            assert!(hasher.verify("password123", encoded).is_err(), "{encoded}");
        }
    }

    #[test]
    fn policy_bounds() {
        assert!(!meets_policy("short"));
        assert!(meets_policy("long enough"));
        assert!(!meets_policy(&"x".repeat(257)));
    }

    #[tokio::test]
    async fn pool_hashes_off_the_runtime() -> anyhow::Result<()> {
        let pool = HashingPool::new(hasher_v1(), 2);
        let encoded = pool.hash(SecretString::from("password123")).await?;
        let verification = pool
            .verify(SecretString::from("password123"), encoded)
            .await?;
        assert!(verification.matched);
        Ok(())
    }

    #[test]
    fn default_workers_is_positive() {
        assert!(HashingPool::default_workers() >= 1);
    }
}
