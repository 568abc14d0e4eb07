//! Secret lifecycle: validate and seal on store, burn on read, purge on expiry.
//!
//! Every id moves `pending -> consumed` (a winning retrieve) or
//! `pending -> expired` (a winning purge or a lazy eviction). Callers cannot
//! tell the terminal states apart, nor tell either from an id that never
//! existed.

use std::sync::Arc;

use anyhow::Context;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::clock::{Clock, SystemClock};
use crate::store::{Cipher, SecretStore, UnreadableRecord};

/// Default cap on secret length, in characters.
pub const DEFAULT_MAX_CONTENT_CHARS: usize = 10_000;
/// Default TTL ceiling: 30 days.
pub const DEFAULT_MAX_TTL_MINUTES: i64 = 43_200;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller input out of bounds.
    #[error("{message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    /// A row existed but could not be decoded or decrypted. The row is gone.
    #[error("stored secret could not be opened")]
    Corruption,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }
}

/// Input bounds enforced by [`SecretEngine::store`].
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_content_chars: usize,
    pub max_ttl_minutes: i64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_content_chars: DEFAULT_MAX_CONTENT_CHARS,
            max_ttl_minutes: DEFAULT_MAX_TTL_MINUTES,
        }
    }
}

/// What the creator of a secret gets back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretHandle {
    pub id: String,
    pub url: String,
    pub expires_at: Option<i64>,
}

/// What the single successful reader gets back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealedSecret {
    pub content: String,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct SecretEngine {
    store: Arc<dyn SecretStore>,
    cipher: Cipher,
    clock: Arc<dyn Clock>,
    limits: Limits,
    public_url: String,
}

impl SecretEngine {
    /// `public_url` is the externally visible base, e.g. `https://drop.example.com`.
    pub fn new(store: Arc<dyn SecretStore>, cipher: Cipher, public_url: impl Into<String>) -> Self {
        Self {
            store,
            cipher,
            clock: Arc::new(SystemClock),
            limits: Limits::default(),
            public_url: public_url.into().trim_end_matches('/').to_owned(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Retrieval URL for `id`.
    pub fn locator(&self, id: &str) -> String {
        format!("{}/v1/secrets/{id}", self.public_url)
    }

    /// Encrypt and persist `content`. Nothing is written if validation fails.
    pub fn store(
        &self,
        content: &str,
        ttl_minutes: Option<i64>,
    ) -> Result<SecretHandle, EngineError> {
        self.validate(content, ttl_minutes)?;

        let now = self.clock.now();
        let expires_at =
            ttl_minutes.map(|minutes| now.saturating_add(minutes.saturating_mul(60)));

        let ciphertext = self
            .cipher
            .encrypt(content.as_bytes())
            .context("encrypt secret")?;
        let id = self
            .store
            .create(ciphertext, now, expires_at)
            .context("persist secret")?;

        debug!(id = %id, ttl_minutes = ?ttl_minutes, "secret created");
        Ok(SecretHandle {
            url: self.locator(&id),
            id,
            expires_at,
        })
    }

    /// Burn-on-read retrieval. `Ok(None)` covers unknown, consumed, and
    /// expired ids alike.
    pub fn retrieve(&self, id: &str) -> Result<Option<RevealedSecret>, EngineError> {
        // Ids are always UUIDs; anything else cannot exist. Any accepted
        // spelling is looked up under the hyphenated lowercase key.
        let Ok(uuid) = uuid::Uuid::parse_str(id) else {
            return Ok(None);
        };
        let id = uuid.hyphenated().to_string();

        let taken = self.store.take(&id, self.clock.now()).map_err(|e| {
            if e.downcast_ref::<UnreadableRecord>().is_some() {
                error!(id = %id, error = %e, "consumed secret could not be decoded");
                EngineError::Corruption
            } else {
                EngineError::Storage(e.context("take secret"))
            }
        })?;
        let Some(record) = taken else {
            return Ok(None);
        };

        let plaintext = self.cipher.decrypt(&record.ciphertext).map_err(|e| {
            error!(id = %id, error = %e, "consumed secret could not be decrypted");
            EngineError::Corruption
        })?;
        let content = String::from_utf8(plaintext).map_err(|_| {
            error!(id = %id, "consumed secret is not valid UTF-8");
            EngineError::Corruption
        })?;

        debug!(id = %id, "secret burned after read");
        Ok(Some(RevealedSecret {
            content,
            created_at: record.created_at,
        }))
    }

    /// Remove every expired record. Safe to call repeatedly and concurrently.
    pub fn purge_expired(&self) -> Result<usize, EngineError> {
        let removed = self
            .store
            .purge_expired(self.clock.now())
            .context("purge expired secrets")?;
        if removed > 0 {
            info!(removed, "purged expired secrets");
        }
        Ok(removed)
    }

    fn validate(&self, content: &str, ttl_minutes: Option<i64>) -> Result<(), EngineError> {
        if content.is_empty() {
            return Err(EngineError::validation(
                "content",
                "The content field is required.",
            ));
        }
        if content.chars().count() > self.limits.max_content_chars {
            return Err(EngineError::validation(
                "content",
                format!(
                    "The content field must not be greater than {} characters.",
                    self.limits.max_content_chars
                ),
            ));
        }
        if let Some(ttl) = ttl_minutes {
            if !(1..=self.limits.max_ttl_minutes).contains(&ttl) {
                return Err(EngineError::validation(
                    "ttl_minutes",
                    format!(
                        "The ttl minutes field must be between 1 and {}.",
                        self.limits.max_ttl_minutes
                    ),
                ));
            }
        }
        Ok(())
    }
}
