//! Single-use secrets and the keyed hash used to store them.
//!
//! Raw secrets are handed to the client (or to the mailer) exactly once; the
//! store only ever sees `HMAC-SHA256(server_key, secret)`.

use anyhow::{anyhow, Context, Result};
use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, Rng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use std::fmt;

const SECRET_BYTES: usize = 48;
const OTP_DIGITS: u32 = 6;

/// Keyed hasher for secrets that are looked up by value.
#[derive(Clone)]
pub struct SecretHasher {
    mac: Hmac<Sha256>,
}

impl SecretHasher {
    /// # Errors
    /// Returns an error if the key is rejected by the MAC.
    pub fn new(key: &SecretString) -> Result<Self> {
        let mac = Hmac::<Sha256>::new_from_slice(key.expose_secret().as_bytes())
            .map_err(|_| anyhow!("invalid token hash key"))?;
        Ok(Self { mac })
    }

    /// Deterministic digest suitable for an indexed lookup column.
    #[must_use]
    pub fn hash(&self, secret: &str) -> String {
        let mut mac = self.mac();
        mac.update(secret.as_bytes());
        Base64UrlUnpadded::encode_string(&mac.finalize().into_bytes())
    }

    /// Constant-time comparison of a stored digest and a presented secret.
    #[must_use]
    pub fn matches(&self, stored: &str, secret: &str) -> bool {
        let Ok(expected) = Base64UrlUnpadded::decode_vec(stored) else {
            return false;
        };
        let mut mac = self.mac();
        mac.update(secret.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }

    fn mac(&self) -> Hmac<Sha256> {
        self.mac.clone()
    }
}

impl fmt::Debug for SecretHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretHasher { .. }")
    }
}

/// 384 random bits, URL-safe.
///
/// # Errors
/// Returns an error if the OS random source fails.
pub fn generate_secret() -> Result<String> {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate secret")?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// Zero-padded numeric one-time code.
#[must_use]
pub fn generate_otp() -> String {
    let code = OsRng.gen_range(0..10u32.pow(OTP_DIGITS));
    format!("{code:0width$}", width = OTP_DIGITS as usize)
}
