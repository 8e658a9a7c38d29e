use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::storage::{ActorState, StateBatch};
use crate::twopc::{Payload, TxnId};

pub const PREPARED_TXNS: &str = "preparedTxns";
pub const COMMITTED_TXNS: &str = "committedTxns";
pub const PREPARED_SNAPSHOTS: &str = "preparedSnapshots";

/// A participant's durable record of transaction outcomes.
///
/// `prepared` and `committed` make prepare and commit idempotent under retry:
/// entries are written once and never changed until the coordinator purges
/// them. A committed entry only ever exists next to a prepared entry for the
/// same transaction. `snapshots` holds the values returned with a positive
/// vote until the transaction commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantLedger<V> {
    prepared: HashMap<TxnId, bool>,
    committed: HashMap<TxnId, bool>,
    snapshots: HashMap<TxnId, V>,
}

impl<V> Default for ParticipantLedger<V> {
    fn default() -> Self {
        Self {
            prepared: HashMap::new(),
            committed: HashMap::new(),
            snapshots: HashMap::new(),
        }
    }
}

impl<V: Payload> ParticipantLedger<V> {
    /// Reads the ledger from an actor's durable state; missing keys are empty.
    pub fn load(state: &ActorState) -> Result<Self> {
        Ok(Self {
            prepared: state.get(PREPARED_TXNS)?.unwrap_or_default(),
            committed: state.get(COMMITTED_TXNS)?.unwrap_or_default(),
            snapshots: state.get(PREPARED_SNAPSHOTS)?.unwrap_or_default(),
        })
    }

    /// The vote recorded for `txn_id`, if it was prepared.
    pub fn prepared(&self, txn_id: TxnId) -> Option<bool> {
        self.prepared.get(&txn_id).copied()
    }

    /// The decision recorded for `txn_id`, if it was committed.
    pub fn committed(&self, txn_id: TxnId) -> Option<bool> {
        self.committed.get(&txn_id).copied()
    }

    pub fn snapshot(&self, txn_id: TxnId) -> Option<&V> {
        self.snapshots.get(&txn_id)
    }

    /// Transactions that voted yes and have not committed yet.
    pub fn in_doubt(&self) -> impl Iterator<Item = TxnId> + '_ {
        self.prepared
            .iter()
            .filter(|(txn_id, vote)| **vote && !self.committed.contains_key(txn_id))
            .map(|(txn_id, _)| *txn_id)
    }

    pub fn is_empty(&self) -> bool {
        self.prepared.is_empty() && self.committed.is_empty()
    }

    pub(crate) fn record_prepared(&mut self, txn_id: TxnId, vote: bool, snapshot: Option<V>) {
        debug_assert!(!self.prepared.contains_key(&txn_id));
        self.prepared.insert(txn_id, vote);
        if let Some(snapshot) = snapshot {
            self.snapshots.insert(txn_id, snapshot);
        }
    }

    pub(crate) fn record_committed(&mut self, txn_id: TxnId, decision: bool) {
        debug_assert!(self.prepared.contains_key(&txn_id));
        debug_assert!(!self.committed.contains_key(&txn_id));
        self.committed.insert(txn_id, decision);
        self.snapshots.remove(&txn_id);
    }

    /// Records a commit that arrived for a transaction never prepared here:
    /// both entries become `false`, so a late prepare for it votes no.
    pub(crate) fn record_rejected(&mut self, txn_id: TxnId) {
        self.prepared.insert(txn_id, false);
        self.committed.insert(txn_id, false);
    }

    /// Forgets `txn_id`. Returns whether there was anything to forget.
    pub(crate) fn purge(&mut self, txn_id: TxnId) -> bool {
        let prepared = self.prepared.remove(&txn_id).is_some();
        let committed = self.committed.remove(&txn_id).is_some();
        let snapshot = self.snapshots.remove(&txn_id).is_some();
        prepared || committed || snapshot
    }

    /// Adds the whole ledger to `batch`.
    pub(crate) fn stage(&self, batch: &mut StateBatch) -> Result<()> {
        batch.put(PREPARED_TXNS, &self.prepared)?;
        batch.put(COMMITTED_TXNS, &self.committed)?;
        batch.put(PREPARED_SNAPSHOTS, &self.snapshots)?;
        Ok(())
    }
}
