use std::sync::Arc;

use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::Result;
use crate::runtime::ActorId;

/// Represents a single mutation to one key of one actor's durable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageMutation {
    /// Insert or overwrite the value stored under the key.
    Put(String, Vec<u8>),
    /// Remove the key. Removing an absent key is a no-op.
    Delete(String),
}

/// Trait for the per-actor durable key/value store.
///
/// Every actor owns a private map of string keys to opaque byte values. The
/// store must apply all mutations of one [`apply_mutations`] call atomically,
/// but it gives no atomicity across actors: that is what the two-phase commit
/// layer adds on top.
///
/// Implementations must be `Send` and `Sync`; every hosted actor shares one
/// store.
///
/// [`apply_mutations`]: StateStore::apply_mutations
pub trait StateStore: Send + Sync {
    /// Reads one key of an actor's state.
    fn get(&self, actor: &ActorId, key: &str) -> Result<Option<Vec<u8>>>;

    /// Reads an actor's entire state.
    fn get_all(&self, actor: &ActorId) -> Result<HashMap<String, Vec<u8>>>;

    /// Atomically applies the given mutations to an actor's state.
    ///
    /// # Errors
    ///
    /// Returns `TxnError::StorageError` if the batch could not be persisted,
    /// in which case none of it may be visible.
    fn apply_mutations(&self, actor: &ActorId, mutations: Vec<StorageMutation>) -> Result<()>;

    /// Lists every actor of `kind` that has persisted state.
    fn list_actors(&self, kind: &str) -> Result<Vec<ActorId>>;
}

/// An in-memory [`StateStore`]. Nothing survives the process, but state does
/// survive an [`ActorSystem`](crate::ActorSystem) being shut down and replaced,
/// which is how tests model a crash.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    data: RwLock<HashMap<ActorId, HashMap<String, Vec<u8>>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, actor: &ActorId, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .data
            .read()
            .get(actor)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    fn get_all(&self, actor: &ActorId) -> Result<HashMap<String, Vec<u8>>> {
        Ok(self.data.read().get(actor).cloned().unwrap_or_default())
    }

    fn apply_mutations(&self, actor: &ActorId, mutations: Vec<StorageMutation>) -> Result<()> {
        let mut data = self.data.write();
        let entries = data.entry(actor.clone()).or_default();
        for mutation in mutations {
            match mutation {
                StorageMutation::Put(key, value) => {
                    entries.insert(key, value);
                }
                StorageMutation::Delete(key) => {
                    entries.remove(&key);
                }
            }
        }
        if entries.is_empty() {
            data.remove(actor);
        }
        Ok(())
    }

    fn list_actors(&self, kind: &str) -> Result<Vec<ActorId>> {
        let mut ids: Vec<ActorId> = self
            .data
            .read()
            .keys()
            .filter(|id| id.kind() == kind)
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// One actor's typed view of the state store. Values are bincode-encoded.
#[derive(Clone)]
pub struct ActorState {
    store: Arc<dyn StateStore>,
    actor: ActorId,
}

impl ActorState {
    pub fn new(store: Arc<dyn StateStore>, actor: ActorId) -> Self {
        Self { store, actor }
    }

    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(&self.actor, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut batch = StateBatch::new();
        batch.put(key, value)?;
        self.write(batch)
    }

    /// Atomically persists every mutation collected in `batch`.
    pub fn write(&self, batch: StateBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.store.apply_mutations(&self.actor, batch.mutations)
    }
}

/// Mutations collected for one atomic [`ActorState::write`].
#[derive(Debug, Default)]
pub struct StateBatch {
    mutations: Vec<StorageMutation>,
}

impl StateBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<T: Serialize>(&mut self, key: &str, value: &T) -> Result<&mut Self> {
        self.mutations
            .push(StorageMutation::Put(key.to_string(), bincode::serialize(value)?));
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}
