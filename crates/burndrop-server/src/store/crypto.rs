use std::sync::Arc;

use anyhow::{Context, Result};
use argon2::{password_hash::SaltString, Argon2, Params, PasswordHasher};
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use thiserror::Error;
use zeroize::ZeroizeOnDrop;

const NONCE_LEN: usize = 12;
/// Poly1305 tag appended by the AEAD.
const TAG_LEN: usize = 16;

/// 32-byte ChaCha20Poly1305 key. Held for the process lifetime, never
/// written next to the records it protects.
#[derive(ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Generate a fresh random key.
pub fn generate_key() -> EncryptionKey {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    EncryptionKey(key)
}

/// Load a raw key file. Returns `None` unless `bytes` is exactly 32 bytes long.
pub fn load_key(bytes: &[u8]) -> Option<EncryptionKey> {
    let key: [u8; 32] = bytes.try_into().ok()?;
    Some(EncryptionKey(key))
}

/// Derive a 32-byte encryption key from `master_key` and `salt` using Argon2id.
/// The salt is persisted (`burndrop.salt`) and reused across restarts.
pub fn derive_key(master_key: &str, salt: &[u8; 32]) -> Result<EncryptionKey> {
    let salt_string =
        SaltString::encode_b64(salt).map_err(|e| anyhow::anyhow!("invalid salt for argon2: {e}"))?;

    let params = Params::new(
        65536, // m_cost: 64 MiB
        3,     // t_cost: 3 iterations
        1,     // p_cost: 1 lane
        Some(32),
    )
    .map_err(|e| anyhow::anyhow!("argon2 params: {e}"))?;

    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let hash = argon2
        .hash_password(master_key.as_bytes(), &salt_string)
        .map_err(|e| anyhow::anyhow!("argon2 hash: {e}"))?;

    let output = hash.hash.context("no hash output")?;
    let hash_bytes = output.as_bytes();
    if hash_bytes.len() < 32 {
        anyhow::bail!("argon2 output too short: {} bytes", hash_bytes.len());
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&hash_bytes[..32]);
    Ok(EncryptionKey(key))
}

/// Generate a fresh 32-byte random salt.
pub fn generate_salt() -> [u8; 32] {
    let mut salt = [0u8; 32];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Why a blob could not be opened. Both cases mean the stored data is
/// unusable; neither is ever surfaced as plaintext.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecryptError {
    #[error("ciphertext blob too short ({0} bytes)")]
    Truncated(usize),
    #[error("ciphertext failed authentication")]
    Authentication,
}

/// AEAD wrapper producing self-contained blobs: `nonce (12) || ciphertext + tag`.
///
/// Stateless apart from the injected key; cloning shares the key.
#[derive(Clone)]
pub struct Cipher {
    key: Arc<EncryptionKey>,
}

impl Cipher {
    pub fn new(key: EncryptionKey) -> Self {
        Self { key: Arc::new(key) }
    }

    fn aead(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(self.key.as_bytes()))
    }

    /// Encrypt `plaintext` under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = self
            .aead()
            .encrypt(&nonce, plaintext)
            .map_err(|e| anyhow::anyhow!("encrypt: {e}"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Exact inverse of [`Cipher::encrypt`] for blobs sealed with the same key.
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, DecryptError> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(DecryptError::Truncated(blob.len()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.aead()
            .decrypt(nonce, ciphertext)
            .map_err(|_| DecryptError::Authentication)
    }
}
