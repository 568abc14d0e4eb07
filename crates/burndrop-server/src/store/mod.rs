pub mod crypto;
pub mod db;
pub mod memory;
pub mod model;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;

pub use crypto::{Cipher, DecryptError, EncryptionKey};
pub use db::RedbStore;
pub use memory::MemoryStore;
pub use model::SecretRecord;

/// A row was found but its stored encoding could not be read. `take` still
/// removes the row before reporting this.
#[derive(Debug, thiserror::Error)]
#[error("stored record is unreadable: {0}")]
pub struct UnreadableRecord(pub String);

/// Keyed storage of encrypted secrets.
///
/// `take` and `purge_expired` must resolve races on the same id inside the
/// backend: whichever call removes the row decides its fate, and every other
/// caller sees it as absent.
pub trait SecretStore: Send + Sync {
    /// Persist a new record under a freshly generated id and return the id.
    fn create(&self, ciphertext: Vec<u8>, created_at: i64, expires_at: Option<i64>)
        -> Result<String>;

    /// Remove and return the record for `id` in one atomic step.
    ///
    /// Returns `None` if the id is unknown, already taken, or expired at
    /// `now`. An expired row is deleted as a side effect.
    fn take(&self, id: &str, now: i64) -> Result<Option<SecretRecord>>;

    /// Delete every record whose expiry is at or before `now`.
    /// Returns how many rows this call removed.
    fn purge_expired(&self, now: i64) -> Result<usize>;

    /// Number of rows currently held, expired or not.
    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// 128-bit identifier (UUID v4, 122 random bits) in hyphenated form.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Which [`SecretStore`] backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Durable embedded database in the data directory.
    Redb,
    /// Process-local sharded map; contents vanish on restart.
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "redb" => Ok(Self::Redb),
            "memory" => Ok(Self::Memory),
            other => anyhow::bail!("unknown store backend '{other}' (expected redb or memory)"),
        }
    }
}

/// Open the configured backend. `data_dir` is only touched by [`StoreBackend::Redb`].
pub fn open(backend: StoreBackend, data_dir: &Path) -> Result<Arc<dyn SecretStore>> {
    match backend {
        StoreBackend::Redb => Ok(Arc::new(RedbStore::open(&data_dir.join("burndrop.db"))?)),
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}
