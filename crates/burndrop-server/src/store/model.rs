use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

/// Stored as bincode-encoded bytes in the `secrets` table.
/// `ciphertext` is an opaque [`Cipher`](super::crypto::Cipher) blob; the store never opens it.
/// Timestamps are plaintext so purge can evict without decrypting.
#[derive(Debug, Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SecretRecord {
    pub ciphertext: Vec<u8>,
    /// Unix timestamp (seconds) when the record was created.
    pub created_at: i64,
    /// Optional Unix timestamp (seconds) from which the record is unretrievable.
    pub expires_at: Option<i64>,
}

impl SecretRecord {
    pub fn new(ciphertext: Vec<u8>, created_at: i64, expires_at: Option<i64>) -> Self {
        Self {
            ciphertext,
            created_at,
            expires_at,
        }
    }

    /// Returns true once `now` has reached the expiry moment.
    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(exp) if now >= exp)
    }
}
