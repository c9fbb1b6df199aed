//! Admission: admin token bootstrap, hashing, validation, and revocation.
//!
//! The first `POST /admin/tokens` call on an empty store mints a token
//! without authentication (bootstrap rule). Once any non-revoked token
//! exists, every admin endpoint and every `protected` route requires a valid
//! `X-Admin-Token` header.

pub mod handler;
pub mod store;

use std::sync::{Arc, Once};

use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::AdmissionConfig;
use crate::error::{Error, Result};

pub use store::{AdminToken, SqliteTokenStore, TokenStore};

static SHA256_DOWNGRADE_WARNED: Once = Once::new();

/// Coordinates token minting, hashing, and constant-time validation against
/// the durable [`TokenStore`].
pub struct Admission {
    store: Arc<dyn TokenStore>,
    bcrypt_cost: u32,
}

/// Result of minting a new token: the plaintext is shown exactly once.
pub struct MintedToken {
    /// Assigned id.
    pub id: i64,
    /// The plaintext bearer value. Never recoverable after this point.
    pub token_plaintext: String,
}

impl Admission {
    /// Build a new admission coordinator over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn TokenStore>, config: &AdmissionConfig) -> Self {
        Self {
            store,
            bcrypt_cost: config.bcrypt_cost,
        }
    }

    /// Whether the caller may create a token without presenting one: true
    /// only when the store has zero tokens at all (including revoked ones
    /// would still count — the bootstrap rule is about the store being
    /// empty, not about active tokens only, so a store with only revoked
    /// tokens stays in bootstrap mode forever; in practice revoke never
    /// deletes, so this matches "zero tokens" literally).
    ///
    /// # Errors
    ///
    /// Propagates any persistence error from the underlying store.
    pub async fn is_bootstrap(&self) -> Result<bool> {
        Ok(self.store.list().await?.is_empty())
    }

    /// Mint and durably persist a new token. Returns the plaintext exactly once.
    ///
    /// # Errors
    ///
    /// Propagates any persistence error from the underlying store.
    pub async fn create_token(&self) -> Result<MintedToken> {
        let plaintext = generate_plaintext_token();
        let (scheme, hash, salt) = hash_token(&plaintext, self.bcrypt_cost);
        let record = self.store.append_token(scheme, &hash, salt.as_deref()).await?;
        Ok(MintedToken {
            id: record.id,
            token_plaintext: plaintext,
        })
    }

    /// List every token record (id/created_at/revoked_at only — never the hash).
    ///
    /// # Errors
    ///
    /// Propagates any persistence error from the underlying store.
    pub async fn list(&self) -> Result<Vec<AdminToken>> {
        self.store.list().await
    }

    /// Revoke a token by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenNotFound`] if the id does not exist. Revoking an
    /// already-revoked token is a no-op that returns the existing record.
    pub async fn revoke(&self, id: i64) -> Result<AdminToken> {
        self.store.revoke_by_id(id).await
    }

    /// Validate a candidate bearer value against every non-revoked record.
    ///
    /// Every record is checked with its own scheme/salt — there is no
    /// hash-once-compare-many optimisation, since per-record salted schemes
    /// make that optimisation unsound.
    ///
    /// # Errors
    ///
    /// Propagates any persistence error from the underlying store.
    pub async fn validate(&self, candidate: &str) -> Result<bool> {
        let records = self.store.list().await?;
        let mut any_match = false;
        for record in &records {
            if record.is_revoked() {
                continue;
            }
            if verify_token(candidate, record) {
                any_match = true;
            }
        }
        Ok(any_match)
    }
}

/// Generate a random 256-bit plaintext token, URL-safe base64, no padding.
fn generate_plaintext_token() -> String {
    let random_bytes: [u8; 32] = rand::rng().random();
    format!(
        "kilo_{}",
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes)
    )
}

/// Hash a plaintext token, preferring bcrypt (memory-hard-equivalent, cost
/// factor = the spec's "work-factor"). Falls back to salted SHA-256 with a
/// logged downgrade warning if bcrypt hashing ever fails to initialize.
fn hash_token(plaintext: &str, cost: u32) -> (&'static str, String, Option<String>) {
    match bcrypt::hash(plaintext, cost) {
        Ok(hash) => ("bcrypt", hash, None),
        Err(e) => {
            SHA256_DOWNGRADE_WARNED.call_once(|| {
                tracing::warn!(
                    error = %e,
                    "bcrypt hashing unavailable; falling back to salted SHA-256 for admin tokens"
                );
            });
            let salt: [u8; 16] = rand::rng().random();
            let salt_hex = hex::encode(salt);
            let hash = sha256_with_salt(plaintext, &salt_hex);
            ("sha256", hash, Some(salt_hex))
        }
    }
}

fn sha256_with_salt(plaintext: &str, salt_hex: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt_hex.as_bytes());
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

/// Verify a candidate against a single record using that record's own scheme.
fn verify_token(candidate: &str, record: &AdminToken) -> bool {
    match record.scheme.as_str() {
        "bcrypt" => bcrypt::verify(candidate, &record.hash).unwrap_or(false),
        "sha256" => {
            let Some(salt) = record.salt.as_deref() else {
                return false;
            };
            let computed = sha256_with_salt(candidate, salt);
            computed.as_bytes().ct_eq(record.hash.as_bytes()).into()
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn admission() -> (tempfile::TempDir, Admission) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn TokenStore> =
            Arc::new(SqliteTokenStore::open(&dir.path().join("gateway.state")).unwrap());
        let admission = Admission::new(store, &AdmissionConfig::default());
        (dir, admission)
    }

    #[tokio::test]
    async fn bootstrap_is_true_on_empty_store() {
        let (_d, a) = admission().await;
        assert!(a.is_bootstrap().await.unwrap());
    }

    #[tokio::test]
    async fn created_token_validates_and_is_not_bootstrap_afterwards() {
        let (_d, a) = admission().await;
        let minted = a.create_token().await.unwrap();
        assert!(!a.is_bootstrap().await.unwrap());
        assert!(a.validate(&minted.token_plaintext).await.unwrap());
        assert!(!a.validate("wrong-token").await.unwrap());
    }

    #[tokio::test]
    async fn revoked_token_never_validates_again() {
        let (_d, a) = admission().await;
        let minted = a.create_token().await.unwrap();
        a.revoke(minted.id).await.unwrap();
        assert!(!a.validate(&minted.token_plaintext).await.unwrap());
    }

    #[tokio::test]
    async fn revoking_one_token_does_not_affect_another() {
        let (_d, a) = admission().await;
        let first = a.create_token().await.unwrap();
        let second = a.create_token().await.unwrap();
        a.revoke(first.id).await.unwrap();

        assert!(!a.validate(&first.token_plaintext).await.unwrap());
        assert!(a.validate(&second.token_plaintext).await.unwrap());
    }

    #[test]
    fn generated_tokens_have_the_expected_prefix_and_entropy() {
        let a = generate_plaintext_token();
        let b = generate_plaintext_token();
        assert!(a.starts_with("kilo_"));
        assert_ne!(a, b);
    }

    #[test]
    fn sha256_fallback_verifies_with_matching_salt_and_rejects_mismatches() {
        let salt_hex = hex::encode([7u8; 16]);
        let hash = sha256_with_salt("plaintext-value", &salt_hex);
        let record = AdminToken {
            id: 1,
            scheme: "sha256".to_string(),
            hash,
            salt: Some(salt_hex),
            created_at: chrono::Utc::now(),
            revoked_at: None,
        };
        assert!(verify_token("plaintext-value", &record));
        assert!(!verify_token("wrong-value", &record));
    }
}
