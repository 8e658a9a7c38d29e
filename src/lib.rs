pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod data_store;
pub mod errors;
pub mod participant;
#[cfg(feature = "rocksdb")]
pub mod rocks_storage;
pub mod runtime;
pub mod storage;
pub mod twopc;

// Re-export key types and structs for easier access
pub use config::TxnConfig;
pub use conflict::{ConflictType, FieldSpec};
pub use coordinator::{
    CoordinatorActor, Directory, Phase, ProxyDirectory, ReplayOperation, TxnStatus, UpdatePlanner,
};
pub use data_store::{FieldLock, LockMeta, ParticipantLedger, TransactionalState};
pub use errors::{Result, TxnError};
pub use participant::{ParticipantActor, ParticipantLogic, ParticipantView, TransactionParticipant};
#[cfg(feature = "rocksdb")]
pub use rocks_storage::RocksStateStore;
pub use runtime::{Actor, ActorContext, ActorId, ActorRef, ActorSystem, Pending};
pub use storage::{ActorState, MemoryStateStore, StateBatch, StateStore, StorageMutation};
pub use twopc::{CommitOutcome, Payload, RemoteParticipant, TxnId, Vote};

/// Everything needed to define participants and run transactions.
pub mod prelude {
    pub use crate::config::TxnConfig;
    pub use crate::conflict::FieldSpec;
    pub use crate::coordinator::{CoordinatorActor, Directory, ProxyDirectory, ReplayOperation, UpdatePlanner};
    pub use crate::data_store::{FieldLock, LockMeta, TransactionalState};
    pub use crate::errors::{Result, TxnError};
    pub use crate::participant::{ParticipantActor, ParticipantLogic};
    pub use crate::runtime::{ActorId, ActorRef, ActorSystem};
    pub use crate::storage::{MemoryStateStore, StateStore};
    pub use crate::twopc::{CommitOutcome, RemoteParticipant, TxnId, Vote};
}
