//! Bearer-token auth for the agent API.
//!
//! The control tunnel already restricts who can reach the listener; the
//! token layer is the second factor, so a process on the VMA that can reach
//! loopback still cannot drive the agent. The HS256 secret is derived from
//! enrollment material both sides already hold (key body + pairing code),
//! so no extra secret distribution step exists.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Token rejected: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Caller identity, e.g. "orchestrator"
    pub sub: String,
    pub iat: u64,
    pub exp: u64,
}

pub struct TokenAuthority {
    secret: Vec<u8>,
}

impl TokenAuthority {
    /// Derives the shared secret from the enrollment public key and the
    /// pairing code the operator confirmed.
    pub fn derive(public_key: &str, pairing_code: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public_key.trim().as_bytes());
        hasher.update(pairing_code.as_bytes());
        Self {
            secret: hasher.finalize().to_vec(),
        }
    }

    pub fn issue(&self, subject: &str, ttl: Duration) -> Result<String, AuthError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before the epoch")
            .as_secs();

        let claims = Claims {
            sub: subject.to_string(),
            iat: now,
            exp: now + ttl.as_secs(),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(|e| AuthError::Invalid(e.to_string()))
    }

    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(&self.secret),
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|e| AuthError::Invalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_validate_round_trip() {
        let authority = TokenAuthority::derive("ssh-ed25519 AAAA... vma", "A1B2C3D4");
        let token = authority.issue("orchestrator", Duration::from_secs(3600)).unwrap();
        let claims = authority.validate(&token).unwrap();
        assert_eq!(claims.sub, "orchestrator");
    }

    #[test]
    fn tokens_from_a_different_pairing_are_rejected() {
        let issuing = TokenAuthority::derive("ssh-ed25519 AAAA... vma", "A1B2C3D4");
        let validating = TokenAuthority::derive("ssh-ed25519 AAAA... vma", "ZZZZZZZZ");
        let token = issuing.issue("orchestrator", Duration::from_secs(3600)).unwrap();
        assert!(validating.validate(&token).is_err());
    }
}
