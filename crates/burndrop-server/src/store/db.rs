use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::debug;

use super::model::SecretRecord;
use super::{new_id, SecretStore, UnreadableRecord};

const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");
/// `(expires_at, id)` for every record with a TTL. Kept in lockstep with
/// `SECRETS` inside the same write transaction.
const SECRETS_BY_EXPIRY: TableDefinition<(i64, &str), ()> =
    TableDefinition::new("secrets_by_expiry");

/// Leading byte of every encoded record, reserved for future layout changes.
const RECORD_V1_MARKER: u8 = 0x01;

/// Durable [`SecretStore`] on top of redb.
///
/// redb admits one write transaction at a time, so a read-then-remove inside
/// a single write transaction is an indivisible delete-returning step.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)
            .with_context(|| format!("open redb database at {}", path.display()))?;

        // Ensure all tables exist.
        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.open_table(SECRETS_BY_EXPIRY)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl SecretStore for RedbStore {
    fn create(
        &self,
        ciphertext: Vec<u8>,
        created_at: i64,
        expires_at: Option<i64>,
    ) -> Result<String> {
        let record = SecretRecord::new(ciphertext, created_at, expires_at);
        let bytes = encode(&record)?;

        let write_txn = self.db.begin_write()?;
        let id = {
            let mut table = write_txn.open_table(SECRETS)?;
            let mut id = new_id();
            while table.get(id.as_str())?.is_some() {
                id = new_id();
            }
            table.insert(id.as_str(), bytes.as_slice())?;

            if let Some(exp) = expires_at {
                let mut index = write_txn.open_table(SECRETS_BY_EXPIRY)?;
                index.insert((exp, id.as_str()), ())?;
            }
            id
        };
        write_txn.commit()?;

        debug!(id = %id, "stored secret");
        Ok(id)
    }

    fn take(&self, id: &str, now: i64) -> Result<Option<SecretRecord>> {
        let write_txn = self.db.begin_write()?;
        let taken = {
            let mut table = write_txn.open_table(SECRETS)?;

            // Copy the bytes out so the guard's borrow of `table` ends here.
            let removed: Option<Vec<u8>> = table.remove(id)?.map(|guard| guard.value().to_vec());

            match removed {
                None => Ok(None),
                // The removal still commits; an orphaned index entry is
                // dropped by the next purge without being counted.
                Some(bytes) => match decode(&bytes) {
                    Err(e) => Err(UnreadableRecord(format!("{e:#}"))),
                    Ok(record) => {
                        if let Some(exp) = record.expires_at {
                            let mut index = write_txn.open_table(SECRETS_BY_EXPIRY)?;
                            index.remove((exp, id))?;
                        }
                        if record.is_expired(now) {
                            debug!(id = %id, "lazy-evicted expired secret");
                            Ok(None)
                        } else {
                            Ok(Some(record))
                        }
                    }
                },
            }
        };
        write_txn.commit()?;
        Ok(taken?)
    }

    fn purge_expired(&self, now: i64) -> Result<usize> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut index = write_txn.open_table(SECRETS_BY_EXPIRY)?;
            // Every key below `(now + 1, "")` has `expires_at <= now`.
            let due: Vec<(i64, String)> = index
                .range::<(i64, &str)>(..(now.saturating_add(1), ""))?
                .map(|item| {
                    item.map(|(key, _)| {
                        let (exp, id) = key.value();
                        (exp, id.to_owned())
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let mut table = write_txn.open_table(SECRETS)?;
            let mut removed = 0usize;
            for (exp, id) in &due {
                index.remove((*exp, id.as_str()))?;
                if table.remove(id.as_str())?.is_some() {
                    removed += 1;
                }
            }
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    fn len(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;
        Ok(table.len()? as usize)
    }
}

/// Encode a record as `[RECORD_V1_MARKER] + bincode(record)`.
fn encode(record: &SecretRecord) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .context("bincode encode")?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_V1_MARKER);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode(bytes: &[u8]) -> Result<SecretRecord> {
    match bytes.split_first() {
        Some((&RECORD_V1_MARKER, payload)) => {
            let (record, _) =
                bincode::serde::decode_from_slice(payload, bincode::config::standard())
                    .context("bincode decode")?;
            Ok(record)
        }
        Some((marker, _)) => anyhow::bail!("unknown record format marker {marker:#04x}"),
        None => anyhow::bail!("empty record"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_store() -> (RedbStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(&dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    #[test]
    fn create_take_once() {
        let (s, _dir) = make_store();
        let id = s.create(b"blob".to_vec(), 1000, None).unwrap();
        let record = s.take(&id, 1001).unwrap().unwrap();
        assert_eq!(record.ciphertext, b"blob");
        assert_eq!(record.created_at, 1000);
        assert!(s.take(&id, 1002).unwrap().is_none());
        assert_eq!(s.len().unwrap(), 0);
    }

    #[test]
    fn take_unknown_id() {
        let (s, _dir) = make_store();
        assert!(s.take("nope", 0).unwrap().is_none());
    }

    #[test]
    fn take_expired_deletes_row() {
        let (s, _dir) = make_store();
        let id = s.create(b"blob".to_vec(), 1000, Some(1060)).unwrap();
        assert!(s.take(&id, 1060).unwrap().is_none());
        assert_eq!(s.len().unwrap(), 0);
        // The expiry index entry went with it.
        assert_eq!(s.purge_expired(2000).unwrap(), 0);
    }

    #[test]
    fn take_before_expiry_returns_record() {
        let (s, _dir) = make_store();
        let id = s.create(b"blob".to_vec(), 1000, Some(1060)).unwrap();
        assert!(s.take(&id, 1059).unwrap().is_some());
        assert_eq!(s.purge_expired(2000).unwrap(), 0);
    }

    #[test]
    fn purge_removes_only_expired() {
        let (s, _dir) = make_store();
        s.create(b"a".to_vec(), 1000, Some(1060)).unwrap();
        s.create(b"b".to_vec(), 1000, Some(1120)).unwrap();
        let forever = s.create(b"c".to_vec(), 1000, None).unwrap();

        assert_eq!(s.purge_expired(1060).unwrap(), 1);
        assert_eq!(s.len().unwrap(), 2);
        assert_eq!(s.purge_expired(1060).unwrap(), 0);
        assert_eq!(s.purge_expired(5000).unwrap(), 1);
        assert_eq!(s.len().unwrap(), 1);
        assert!(s.take(&forever, 5000).unwrap().is_some());
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let id = {
            let s = RedbStore::open(&path).unwrap();
            s.create(b"durable".to_vec(), 1000, Some(9000)).unwrap()
        };
        let s = RedbStore::open(&path).unwrap();
        assert_eq!(s.take(&id, 1001).unwrap().unwrap().ciphertext, b"durable");
    }

    #[test]
    fn unreadable_row_is_removed_on_take() {
        let (s, _dir) = make_store();
        let write_txn = s.db.begin_write().unwrap();
        {
            let mut table = write_txn.open_table(SECRETS).unwrap();
            table.insert("garbled", [0x7fu8, 1, 2].as_slice()).unwrap();
        }
        write_txn.commit().unwrap();

        let err = s.take("garbled", 0).unwrap_err();
        assert!(err.downcast_ref::<UnreadableRecord>().is_some());
        assert_eq!(s.len().unwrap(), 0);
        assert!(s.take("garbled", 0).unwrap().is_none());
    }

    #[test]
    fn decode_rejects_unknown_marker() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[0x7f, 0, 0]).is_err());
    }
}
