use thiserror::Error;

use crate::runtime::ActorId;
use crate::twopc::TxnId;

#[derive(Error, Debug)]
pub enum TxnError {
    #[error("{participants} participants but {operations} operations were supplied")]
    ArgumentMismatch {
        participants: usize,
        operations: usize,
    },

    #[error("Participant {0} appears more than once in one transaction")]
    DuplicateParticipant(ActorId),

    #[error("Participant unreachable: {0}")]
    ParticipantUnreachable(String),

    #[error("Transaction {0} was never prepared and cannot be committed")]
    UnpreparedCommit(TxnId),

    #[error("Call to actor {0} timed out")]
    Timeout(ActorId),

    #[error("Actor {0} is not running")]
    ActorUnavailable(ActorId),

    #[error("No actor kind registered under {0:?}")]
    UnknownActorKind(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl TxnError {
    /// Whether the failure came from the invocation layer rather than from the
    /// callee's own logic. Such failures are retried during commit dispatch.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            TxnError::ParticipantUnreachable(_)
                | TxnError::Timeout(_)
                | TxnError::ActorUnavailable(_)
        )
    }
}

impl From<bincode::Error> for TxnError {
    fn from(e: bincode::Error) -> Self {
        TxnError::Serialization(e.to_string())
    }
}

#[cfg(feature = "rocksdb")]
impl From<rocksdb::Error> for TxnError {
    fn from(e: rocksdb::Error) -> Self {
        TxnError::StorageError(e.into_string())
    }
}

pub type Result<T> = std::result::Result<T, TxnError>;
