pub mod field_lock;
pub mod ledger;

pub use field_lock::{FieldLock, LockMeta, TransactionalState};
pub use ledger::ParticipantLedger;
