use secrecy::SecretString;
use std::fmt;
use zeroize::Zeroizing;

/// Key material parsed from the command line. Exposed only where used.
#[derive(Clone)]
pub struct GlobalArgs {
    pub access_secret: SecretString,
    pub refresh_secret: SecretString,
    pub token_hash_secret: SecretString,
    pub public_id_key: Zeroizing<Vec<u8>>,
    pub peppers: Vec<(u32, SecretString)>,
    pub pepper_version: u32,
}

impl GlobalArgs {
    /// The pepper used for new hashes.
    #[must_use]
    pub fn current_pepper(&self) -> Option<&SecretString> {
        self.peppers
            .iter()
            .find(|(version, _)| *version == self.pepper_version)
            .map(|(_, pepper)| pepper)
    }
}

impl fmt::Debug for GlobalArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalArgs")
            .field(
                "pepper_versions",
                &self.peppers.iter().map(|(v, _)| v).collect::<Vec<_>>(),
            )
            .field("pepper_version", &self.pepper_version)
            .finish_non_exhaustive()
    }
}
