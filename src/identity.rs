//! Irreversible visitor identity tokens

use anyhow::Result;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::db::Database;

/// Length in hex characters of every token
pub const TOKEN_LEN: usize = 64;

/// Random bytes in a generated salt
const SALT_BYTES: usize = 32;

/// Hex-encoded random salt
pub fn generate_salt() -> String {
    let mut buf = [0u8; SALT_BYTES];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Maps a client address to a deterministic, one-way token.
///
/// The same input (and salt) always produces the same token, which is what lets the
/// rollup recognise repeat visitors without ever storing the address itself. The salt
/// keeps the IPv4 space from being enumerated back into addresses.
#[derive(Debug, Clone)]
pub struct IdentityHasher {
    salt: String,
}

impl IdentityHasher {
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    /// The configured salt, or else the one persisted in the store (generated on first start)
    pub async fn for_deployment(configured: &str, db: &Database) -> Result<Self> {
        if !configured.is_empty() {
            return Ok(Self::new(configured));
        }
        let salt = db.identity_salt(&generate_salt()).await?;
        info!("Using the identity salt stored in the database");
        Ok(Self::new(salt))
    }

    pub fn hash(&self, identifier: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(identifier.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_fixed_length_hex() {
        let token = IdentityHasher::new("pepper").hash("203.0.113.7");
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn token_is_deterministic() {
        let hasher = IdentityHasher::new("pepper");
        assert_eq!(hasher.hash("203.0.113.7"), hasher.hash("203.0.113.7"));
    }

    #[test]
    fn distinct_addresses_get_distinct_tokens() {
        let hasher = IdentityHasher::new("pepper");
        let a = hasher.hash("203.0.113.7");
        let b = hasher.hash("203.0.113.8");
        assert_ne!(a, b);
        assert!(!a.contains("203.0.113.7"));
    }

    #[test]
    fn salt_changes_the_token() {
        let plain = IdentityHasher::new("").hash("203.0.113.7");
        let salted = IdentityHasher::new("pepper").hash("203.0.113.7");
        assert_ne!(plain, salted);
    }

    #[test]
    fn generated_salts_are_random_hex() {
        let a = generate_salt();
        assert_eq!(a.len(), SALT_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, generate_salt());
    }

    #[tokio::test]
    async fn default_deployment_hashes_with_a_stored_salt() {
        let db = Database::in_memory().await.unwrap();
        let unsalted = IdentityHasher::new("").hash("203.0.113.7");

        let first = IdentityHasher::for_deployment("", &db).await.unwrap();
        let token = first.hash("203.0.113.7");
        assert_ne!(token, unsalted);

        // Restarting keeps the salt, so tokens still match within a day
        let second = IdentityHasher::for_deployment("", &db).await.unwrap();
        assert_eq!(second.hash("203.0.113.7"), token);
    }

    #[tokio::test]
    async fn configured_salt_takes_precedence() {
        let db = Database::in_memory().await.unwrap();
        let hasher = IdentityHasher::for_deployment("pepper", &db).await.unwrap();
        assert_eq!(
            hasher.hash("203.0.113.7"),
            IdentityHasher::new("pepper").hash("203.0.113.7")
        );
    }
}
