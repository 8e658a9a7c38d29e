use std::fmt;
use std::future::Future;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::Result;
use crate::runtime::ActorId;

/// A unique identifier for a distributed transaction.
///
/// Generated by the coordinator when it first activates and persisted together
/// with the participant list, so it stays stable across coordinator restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(Uuid);

impl TxnId {
    /// Generates a fresh random transaction id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TxnId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TxnId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bound shared by every value that crosses an actor boundary or is persisted
/// in the state store.
pub trait Payload: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {}

/// A participant's answer to a prepare request.
///
/// A positive vote carries the snapshot of the fields the request named, read
/// while the transaction's locks were taken. The coordinator uses it to plan
/// the update it later sends with the commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote<V> {
    Yes(V),
    No,
}

impl<V> Vote<V> {
    pub fn is_yes(&self) -> bool {
        matches!(self, Vote::Yes(_))
    }
}

/// What a participant did with a commit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitOutcome {
    /// The decision was true and the update was applied.
    Applied,
    /// The decision was false; locks were released and nothing was applied.
    Aborted,
    /// `committedTxns` already held an entry for the transaction.
    Duplicate,
    /// The transaction was never prepared here. Recorded as rejected.
    Unprepared,
}

/// Trait for interacting with a participant in the two-phase commit protocol.
///
/// The coordinator talks to participants only through this seam. The actor
/// host implements it for participant actor references; tests wrap those to
/// inject failures.
///
/// Implementations must be `Clone` so that the coordinator can move one handle
/// into each task of a fan-out.
pub trait RemoteParticipant: Clone + Send + Sync + 'static {
    /// Payload of a prepare request, naming the fields and intent.
    type Op: Payload;
    /// Payload of a commit request, applied when the decision is true.
    type Update: Payload;
    /// Snapshot returned with a positive vote.
    type Values: Payload;

    /// The stable identity of the participant actor.
    fn key(&self) -> &ActorId;

    /// Phase 1: asks the participant to vote on `txn_id`.
    ///
    /// # Errors
    ///
    /// Returns an error when the request could not be delivered or answered.
    /// A negative vote is `Ok(Vote::No)`, not an error.
    fn prepare(
        &self,
        txn_id: TxnId,
        op: Self::Op,
    ) -> impl Future<Output = Result<Vote<Self::Values>>> + Send;

    /// Phase 2: delivers the global decision.
    ///
    /// `update` is `Some` only when `decision` is true.
    fn commit(
        &self,
        txn_id: TxnId,
        decision: bool,
        update: Option<Self::Update>,
    ) -> impl Future<Output = Result<CommitOutcome>> + Send;

    /// Drops both ledger entries for a globally completed transaction.
    fn purge(&self, txn_id: TxnId) -> impl Future<Output = Result<()>> + Send;
}
