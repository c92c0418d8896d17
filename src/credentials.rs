//! Credential-at-rest plumbing.
//!
//! Encryption itself happens in the appliance's credential library, outside
//! this codebase. Everything here treats credential material as opaque
//! ciphertext: the API accepts ciphertext, the queries store ciphertext, and
//! discovery requests carry a credential *reference*, never the secret.
//!
//! The one hard requirement owned here: the orchestrator refuses to start
//! when the encryption key is absent or malformed, because a running
//! orchestrator without the key would accept credentials it can never use.

use sha2::{Digest, Sha256};
use std::env;
use thiserror::Error;

/// Environment variable holding the 32-byte hex credential encryption key.
pub const ENC_KEY_VAR: &str = "OSSEA_MIGRATE_ENC_KEY";

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("{ENC_KEY_VAR} is not set; refusing to start without the credential encryption key")]
    KeyMissing,

    #[error("{ENC_KEY_VAR} must be 64 hex characters (32 bytes), got {0} characters")]
    KeyMalformed(usize),

    #[error("credential ciphertext is empty")]
    EmptyCiphertext,
}

/// Handle to the credential encryption key.
///
/// The key bytes never leave this struct; the rest of the codebase only ever
/// sees the fingerprint, which is safe to log.
pub struct EncryptionKey {
    key: [u8; 32],
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey").field("fingerprint", &self.fingerprint()).finish()
    }
}

impl EncryptionKey {
    /// Loads and validates the key from the environment. Called once at
    /// orchestrator startup; a failure here is fatal.
    pub fn from_env() -> Result<Self, CredentialError> {
        let raw = env::var(ENC_KEY_VAR).map_err(|_| CredentialError::KeyMissing)?;
        Self::from_hex(&raw)
    }

    fn from_hex(raw: &str) -> Result<Self, CredentialError> {
        let trimmed = raw.trim();
        let bytes = hex::decode(trimmed).map_err(|_| CredentialError::KeyMalformed(trimmed.len()))?;
        if bytes.len() != 32 {
            return Err(CredentialError::KeyMalformed(trimmed.len()));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(Self { key })
    }

    /// Short identifier for logs and the health endpoint.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.key);
        hex::encode(&digest[..4])
    }
}

/// Validates a ciphertext blob on its way into the persistence layer.
/// The blob is opaque; the only invariant we can enforce is non-emptiness.
pub fn validate_ciphertext(ciphertext: &str) -> Result<(), CredentialError> {
    if ciphertext.trim().is_empty() {
        return Err(CredentialError::EmptyCiphertext);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_key() {
        let err = EncryptionKey::from_hex("abcd").unwrap_err();
        assert!(matches!(err, CredentialError::KeyMalformed(4)));
    }

    #[test]
    fn rejects_non_hex_key() {
        let raw = "zz".repeat(32);
        assert!(EncryptionKey::from_hex(&raw).is_err());
    }

    #[test]
    fn accepts_valid_key_and_fingerprints_it() {
        let raw = "0f".repeat(32);
        let key = EncryptionKey::from_hex(&raw).unwrap();
        assert_eq!(key.fingerprint().len(), 8);
    }

    #[test]
    fn empty_ciphertext_is_rejected() {
        assert!(validate_ciphertext("  ").is_err());
        assert!(validate_ciphertext("sealed:v1:abcdef").is_ok());
    }
}
