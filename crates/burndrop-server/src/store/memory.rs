use anyhow::Result;
use dashmap::{mapref::entry::Entry, DashMap};
use tracing::debug;

use super::model::SecretRecord;
use super::{new_id, SecretStore};

/// In-process [`SecretStore`] backed by a sharded map.
///
/// Every operation on an id holds only that id's shard lock, so distinct ids
/// on distinct shards never contend. `take` is a single `remove`.
#[derive(Default)]
pub struct MemoryStore {
    secrets: DashMap<String, SecretRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemoryStore {
    fn create(
        &self,
        ciphertext: Vec<u8>,
        created_at: i64,
        expires_at: Option<i64>,
    ) -> Result<String> {
        let record = SecretRecord::new(ciphertext, created_at, expires_at);
        loop {
            let id = new_id();
            if let Entry::Vacant(slot) = self.secrets.entry(id.clone()) {
                slot.insert(record);
                debug!(id = %id, "stored secret");
                return Ok(id);
            }
        }
    }

    fn take(&self, id: &str, now: i64) -> Result<Option<SecretRecord>> {
        let Some((_, record)) = self.secrets.remove(id) else {
            return Ok(None);
        };
        if record.is_expired(now) {
            debug!(id = %id, "lazy-evicted expired secret");
            return Ok(None);
        }
        Ok(Some(record))
    }

    fn purge_expired(&self, now: i64) -> Result<usize> {
        let mut removed = 0usize;
        self.secrets.retain(|_, record| {
            let expired = record.is_expired(now);
            if expired {
                removed += 1;
            }
            !expired
        });
        Ok(removed)
    }

    fn len(&self) -> Result<usize> {
        Ok(self.secrets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_take_once() {
        let s = MemoryStore::new();
        let id = s.create(b"blob".to_vec(), 1000, None).unwrap();
        assert_eq!(s.take(&id, 1001).unwrap().unwrap().ciphertext, b"blob");
        assert!(s.take(&id, 1001).unwrap().is_none());
        assert!(s.is_empty().unwrap());
    }

    #[test]
    fn take_expired_deletes_row() {
        let s = MemoryStore::new();
        let id = s.create(b"blob".to_vec(), 1000, Some(1060)).unwrap();
        assert!(s.take(&id, 1061).unwrap().is_none());
        assert!(s.is_empty().unwrap());
    }

    #[test]
    fn purge_counts_only_its_own_removals() {
        let s = MemoryStore::new();
        let a = s.create(b"a".to_vec(), 1000, Some(1060)).unwrap();
        s.create(b"b".to_vec(), 1000, Some(1060)).unwrap();
        s.create(b"c".to_vec(), 1000, None).unwrap();

        // `a` is lazily evicted before the purge gets to it.
        assert!(s.take(&a, 2000).unwrap().is_none());
        assert_eq!(s.purge_expired(2000).unwrap(), 1);
        assert_eq!(s.purge_expired(2000).unwrap(), 0);
        assert_eq!(s.len().unwrap(), 1);
    }
}
