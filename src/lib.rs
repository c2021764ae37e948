//! # Credo (credential and token lifecycle engine)
//!
//! `credo` owns the security-sensitive half of an account backend: password
//! hashing with a rotatable pepper, signed bearer tokens, opaque public
//! identifiers, login throttling, and refresh-token rotation with family-based
//! reuse detection.
//!
//! ## Refresh token families
//!
//! Every login opens a *family*: a chain of refresh tokens where exactly one
//! link is valid for rotation at any time. Rotating marks the presented token
//! used and appends a successor in one transaction. Presenting a token that was
//! already used or revoked is treated as theft and revokes the whole family
//! together with its session.
//!
//! ## Passwords
//!
//! Hashes are `Argon2id` over `HMAC-SHA256(pepper, password)`. The pepper
//! version is embedded in the encoded hash, so promoting a new pepper only
//! causes a transparent rehash on the next successful login.

pub mod auth;
pub mod cli;
pub mod credo;
pub mod email;
pub mod store;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
