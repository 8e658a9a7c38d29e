use std::path::Path;

use ahash::AHashMap as HashMap;
use log::debug;
use rocksdb::{DB, Direction, IteratorMode, Options, WriteBatch};

use crate::errors::{Result, TxnError};
use crate::runtime::ActorId;
use crate::storage::{StateStore, StorageMutation};

/// Separates the components of a RocksDB key: `kind SEP actor-key SEP state-key`.
const SEP: u8 = 0x1f;

/// A durable [`StateStore`] over RocksDB.
///
/// Each actor's keys share the prefix `kind SEP key SEP`; one call to
/// `apply_mutations` becomes one `WriteBatch`, which RocksDB applies atomically.
pub struct RocksStateStore {
    db: DB,
}

impl RocksStateStore {
    /// Opens (creating if needed) a store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DB::open(&options, path.as_ref())?;
        debug!("Opened state store at {}", path.as_ref().display());
        Ok(Self { db })
    }

    fn actor_prefix(actor: &ActorId) -> Vec<u8> {
        let mut prefix = Self::kind_prefix(actor.kind());
        prefix.extend_from_slice(actor.key().as_bytes());
        prefix.push(SEP);
        prefix
    }

    fn kind_prefix(kind: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(kind.len() + 1);
        prefix.extend_from_slice(kind.as_bytes());
        prefix.push(SEP);
        prefix
    }

    fn full_key(actor: &ActorId, key: &str) -> Vec<u8> {
        let mut full = Self::actor_prefix(actor);
        full.extend_from_slice(key.as_bytes());
        full
    }

    /// Every (key, value) pair whose key starts with `prefix`.
    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let mut entries = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| TxnError::StorageError(format!("corrupt key in state store: {}", e)))
}

impl StateStore for RocksStateStore {
    fn get(&self, actor: &ActorId, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(Self::full_key(actor, key))?)
    }

    fn get_all(&self, actor: &ActorId) -> Result<HashMap<String, Vec<u8>>> {
        let prefix = Self::actor_prefix(actor);
        self.scan(&prefix)?
            .into_iter()
            .map(|(key, value)| Ok((utf8(&key[prefix.len()..])?, value.into_vec())))
            .collect()
    }

    fn apply_mutations(&self, actor: &ActorId, mutations: Vec<StorageMutation>) -> Result<()> {
        let mut batch = WriteBatch::default();
        for mutation in mutations {
            match mutation {
                StorageMutation::Put(key, value) => batch.put(Self::full_key(actor, &key), value),
                StorageMutation::Delete(key) => batch.delete(Self::full_key(actor, &key)),
            }
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn list_actors(&self, kind: &str) -> Result<Vec<ActorId>> {
        let prefix = Self::kind_prefix(kind);
        let mut ids: Vec<ActorId> = Vec::new();
        for (key, _) in self.scan(&prefix)? {
            let rest = &key[prefix.len()..];
            let Some(end) = rest.iter().position(|b| *b == SEP) else {
                continue;
            };
            let id = ActorId::new(kind, utf8(&rest[..end])?);
            if ids.last() != Some(&id) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn actors_with_shared_key_prefix_stay_apart() {
        let dir = TempDir::new().unwrap();
        let store = RocksStateStore::open(dir.path()).unwrap();
        let (short, long) = (ActorId::new("account", "a"), ActorId::new("account", "ab"));

        store
            .apply_mutations(&short, vec![StorageMutation::Put("state".into(), vec![1])])
            .unwrap();
        store
            .apply_mutations(
                &long,
                vec![
                    StorageMutation::Put("state".into(), vec![2]),
                    StorageMutation::Put("preparedTxns".into(), vec![3]),
                ],
            )
            .unwrap();

        assert_eq!(store.get_all(&short).unwrap().len(), 1);
        assert_eq!(store.get_all(&long).unwrap().len(), 2);
        assert_eq!(store.list_actors("account").unwrap(), vec![short.clone(), long.clone()]);
        assert!(store.list_actors("transfer").unwrap().is_empty());

        store
            .apply_mutations(&short, vec![StorageMutation::Delete("state".into())])
            .unwrap();
        assert!(store.get(&short, "state").unwrap().is_none());
        assert_eq!(store.list_actors("account").unwrap(), vec![long.clone()]);
        assert_eq!(store.get(&long, "state").unwrap(), Some(vec![2]));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let actor = ActorId::new("transfer", "t1");
        {
            let store = RocksStateStore::open(dir.path()).unwrap();
            store
                .apply_mutations(
                    &actor,
                    vec![
                        StorageMutation::Put("decision".into(), vec![1]),
                        StorageMutation::Put("txnId".into(), vec![9]),
                        StorageMutation::Delete("txnId".into()),
                    ],
                )
                .unwrap();
        }

        let store = RocksStateStore::open(dir.path()).unwrap();
        assert_eq!(store.get(&actor, "decision").unwrap(), Some(vec![1]));
        assert!(store.get(&actor, "txnId").unwrap().is_none());
    }
}
