use std::fmt::Debug;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::twopc::TxnId;

/// Lock metadata of one transactional field.
///
/// Either one transaction holds the exclusive write lock, or any number of
/// transactions hold shared read locks, or the field is free. A writer and a
/// non-empty reader set never coexist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMeta {
    writer: Option<TxnId>,
    readers: Vec<TxnId>,
}

impl LockMeta {
    pub fn writer(&self) -> Option<TxnId> {
        self.writer
    }

    pub fn readers(&self) -> &[TxnId] {
        &self.readers
    }

    pub fn is_free(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }

    /// Whether an exclusive lock could be granted now.
    pub fn can_write(&self) -> bool {
        self.is_free()
    }

    /// Whether a shared lock could be granted now. Readers never block readers.
    pub fn can_read(&self) -> bool {
        self.writer.is_none()
    }

    pub fn held_by(&self, txn_id: TxnId) -> bool {
        self.writer == Some(txn_id) || self.readers.contains(&txn_id)
    }

    /// Grants the exclusive lock. Callers check [`can_write`](Self::can_write) first.
    pub(crate) fn grant_write(&mut self, txn_id: TxnId) {
        debug_assert!(self.can_write(), "write lock granted over a held lock");
        self.writer = Some(txn_id);
    }

    /// Grants a shared lock. Callers check [`can_read`](Self::can_read) first.
    pub(crate) fn grant_read(&mut self, txn_id: TxnId) {
        debug_assert!(self.can_read(), "read lock granted under a writer");
        if !self.readers.contains(&txn_id) {
            self.readers.push(txn_id);
        }
    }

    /// Drops whatever `txn_id` holds on this field. Returns whether it held anything.
    pub(crate) fn release(&mut self, txn_id: TxnId) -> bool {
        let mut released = false;
        if self.writer == Some(txn_id) {
            self.writer = None;
            released = true;
        }
        let before = self.readers.len();
        self.readers.retain(|reader| *reader != txn_id);
        released || self.readers.len() != before
    }
}

/// A transactional field: its committed value plus its lock metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldLock<V> {
    value: V,
    lock: LockMeta,
}

impl<V> FieldLock<V> {
    pub fn new(value: V) -> Self {
        Self {
            value,
            lock: LockMeta::default(),
        }
    }

    /// The last committed value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Replaces the committed value. Only commit application and
    /// non-transactional administration should do this.
    pub fn set(&mut self, value: V) {
        self.value = value;
    }

    pub fn value_mut(&mut self) -> &mut V {
        &mut self.value
    }

    pub fn lock(&self) -> &LockMeta {
        &self.lock
    }

    pub fn lock_mut(&mut self) -> &mut LockMeta {
        &mut self.lock
    }
}

/// The fixed schema of a participant's transactional state.
///
/// A participant type declares its transactional fields as [`FieldLock`]
/// struct members and names them with a small enum, `Field`. The lock
/// algorithm resolves fields through that enum, never through strings.
///
/// ```no_run
/// use actor_txn::prelude::*;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// enum AccountField {
///     Balance,
/// }
///
/// #[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// struct AccountState {
///     balance: FieldLock<i64>,
/// }
///
/// impl TransactionalState for AccountState {
///     type Field = AccountField;
///     const FIELDS: &'static [AccountField] = &[AccountField::Balance];
///
///     fn lock(&self, field: AccountField) -> &LockMeta {
///         match field {
///             AccountField::Balance => self.balance.lock(),
///         }
///     }
///
///     fn lock_mut(&mut self, field: AccountField) -> &mut LockMeta {
///         match field {
///             AccountField::Balance => self.balance.lock_mut(),
///         }
///     }
/// }
/// ```
pub trait TransactionalState:
    Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Field: Copy + Eq + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Every transactional field, used when releasing a transaction's locks.
    const FIELDS: &'static [Self::Field];

    fn lock(&self, field: Self::Field) -> &LockMeta;

    fn lock_mut(&mut self, field: Self::Field) -> &mut LockMeta;
}
