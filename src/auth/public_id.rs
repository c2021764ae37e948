//! Opaque public identifiers.
//!
//! Internal numeric keys are sealed with AES-256-GCM under a fresh nonce, so
//! the same id encodes differently on every call and any tampering fails
//! authentication. Wire form: `base64url(nonce || ciphertext || tag)`.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};
use std::fmt;
use thiserror::Error;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const ENCODED_LEN: usize = NONCE_LEN + 8 + TAG_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublicIdError {
    #[error("public id key must be 32 bytes")]
    KeyLength,
    #[error("invalid public id")]
    Invalid,
    #[error("failed to seal public id")]
    Seal,
}

#[derive(Clone)]
pub struct PublicIdCodec {
    cipher: Aes256Gcm,
}

impl PublicIdCodec {
    /// # Errors
    /// Returns [`PublicIdError::KeyLength`] unless `key` is exactly 32 bytes.
    pub fn new(key: &[u8]) -> Result<Self, PublicIdError> {
        if key.len() != KEY_LEN {
            return Err(PublicIdError::KeyLength);
        }
        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        })
    }

    /// # Errors
    /// Returns an error if the random source or the cipher fails.
    pub fn encode(&self, id: u64) -> Result<String, PublicIdError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .map_err(|_| PublicIdError::Seal)?;
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), id.to_be_bytes().as_slice())
            .map_err(|_| PublicIdError::Seal)?;

        let mut sealed = Vec::with_capacity(ENCODED_LEN);
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(Base64UrlUnpadded::encode_string(&sealed))
    }

    /// Fails closed on any malformed, truncated, or forged input.
    ///
    /// # Errors
    /// Returns [`PublicIdError::Invalid`] for anything that does not authenticate.
    pub fn decode(&self, public_id: &str) -> Result<u64, PublicIdError> {
        let data = Base64UrlUnpadded::decode_vec(public_id).map_err(|_| PublicIdError::Invalid)?;
        if data.len() != ENCODED_LEN {
            return Err(PublicIdError::Invalid);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| PublicIdError::Invalid)?;
        let bytes: [u8; 8] = plain.try_into().map_err(|_| PublicIdError::Invalid)?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Convenience for database keys, which are signed.
    ///
    /// # Errors
    /// Returns an error for negative ids or when sealing fails.
    pub fn encode_key(&self, id: i64) -> Result<String, PublicIdError> {
        let id = u64::try_from(id).map_err(|_| PublicIdError::Invalid)?;
        self.encode(id)
    }

    /// # Errors
    /// Returns [`PublicIdError::Invalid`] if the value does not decode to a database key.
    pub fn decode_key(&self, public_id: &str) -> Result<i64, PublicIdError> {
        i64::try_from(self.decode(public_id)?).map_err(|_| PublicIdError::Invalid)
    }
}

impl fmt::Debug for PublicIdCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PublicIdCodec { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> Result<PublicIdCodec, PublicIdError> {
        PublicIdCodec::new(&[7u8; KEY_LEN])
    }

    #[test]
    fn round_trip_across_range() -> Result<(), PublicIdError> {
        let codec = codec()?;
        for id in [0, 1, 42, 1 << 32, u64::MAX - 1, u64::MAX] {
            assert_eq!(codec.decode(&codec.encode(id)?)?, id);
        }
        Ok(())
    }

    #[test]
    fn encoding_is_randomized_and_url_safe() -> Result<(), PublicIdError> {
        let codec = codec()?;
        let first = codec.encode(42)?;
        let second = codec.encode(42)?;
        assert_ne!(first, second);
        assert!(first
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        Ok(())
    }

    #[test]
    fn any_single_byte_flip_is_rejected() -> Result<(), PublicIdError> {
        let codec = codec()?;
        let encoded = codec.encode(123_456_789)?;
        let raw = Base64UrlUnpadded::decode_vec(&encoded).map_err(|_| PublicIdError::Invalid)?;
        for index in 0..raw.len() {
            let mut tampered = raw.clone();
            if let Some(byte) = tampered.get_mut(index) {
                *byte ^= 0x01;
            }
            let tampered = Base64UrlUnpadded::encode_string(&tampered);
            assert_eq!(codec.decode(&tampered), Err(PublicIdError::Invalid));
        }
        Ok(())
    }

    #[test]
    fn truncated_and_garbage_input_fail() -> Result<(), PublicIdError> {
        let codec = codec()?;
        let encoded = codec.encode(9)?;
        assert!(codec.decode(&encoded[..encoded.len() - 2]).is_err());
        assert!(codec.decode("").is_err());
        assert!(codec.decode("not/base64url").is_err());
        Ok(())
    }

    #[test]
    fn wrong_key_fails() -> Result<(), PublicIdError> {
        let encoded = codec()?.encode(9)?;
        let other = PublicIdCodec::new(&[8u8; KEY_LEN])?;
        assert_eq!(other.decode(&encoded), Err(PublicIdError::Invalid));
        Ok(())
    }

    #[test]
    fn key_length_is_enforced() {
        assert_eq!(
            PublicIdCodec::new(&[0u8; 16]).err(),
            Some(PublicIdError::KeyLength)
        );
    }

    #[test]
    fn negative_keys_are_rejected() -> Result<(), PublicIdError> {
        let codec = codec()?;
        assert!(codec.encode_key(-1).is_err());
        assert_eq!(codec.decode_key(&codec.encode_key(77)?)?, 77);
        assert!(codec.decode_key(&codec.encode(u64::MAX)?).is_err());
        Ok(())
    }
}
