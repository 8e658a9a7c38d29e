use serde::{Deserialize, Serialize};

use crate::data_store::TransactionalState;
use crate::twopc::TxnId;

/// The fields one prepare request touches, split by access mode.
///
/// `rw` fields need exclusive access for the prepare-to-commit window. `ro`
/// fields only need the absence of a concurrent writer. A field named in both
/// lists is treated as `rw`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec<F> {
    pub rw: Vec<F>,
    pub ro: Vec<F>,
}

impl<F> Default for FieldSpec<F> {
    fn default() -> Self {
        Self {
            rw: Vec::new(),
            ro: Vec::new(),
        }
    }
}

impl<F: Copy + PartialEq> FieldSpec<F> {
    pub fn read_write(fields: impl IntoIterator<Item = F>) -> Self {
        Self {
            rw: fields.into_iter().collect(),
            ro: Vec::new(),
        }
    }

    pub fn read_only(fields: impl IntoIterator<Item = F>) -> Self {
        Self {
            rw: Vec::new(),
            ro: fields.into_iter().collect(),
        }
    }

    pub fn with_read_only(mut self, fields: impl IntoIterator<Item = F>) -> Self {
        self.ro.extend(fields);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rw.is_empty() && self.ro.is_empty()
    }

    /// `ro` fields that are not also requested for writing.
    pub fn shared_only(&self) -> impl Iterator<Item = F> + '_ {
        self.ro.iter().copied().filter(|f| !self.rw.contains(f))
    }

    /// Every requested field once, writes first.
    pub fn fields(&self) -> impl Iterator<Item = F> + '_ {
        self.rw.iter().copied().chain(self.shared_only())
    }
}

/// Represents the type of conflict detected on one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictType {
    /// A write was requested but another transaction holds the write lock.
    WriteWrite(TxnId),
    /// A write was requested but transactions hold read locks.
    WriteRead,
    /// A read was requested but another transaction holds the write lock.
    ReadWrite(TxnId),
}

/// Checks the requested fields against the current lock metadata.
///
/// Returns every conflicting field with the kind of conflict; an empty result
/// means the locks can be granted. Nothing is modified.
pub fn detect_conflicts<S: TransactionalState>(
    spec: &FieldSpec<S::Field>,
    state: &S,
) -> Vec<(S::Field, ConflictType)> {
    let mut conflicts = Vec::new();

    for field in spec.rw.iter().copied() {
        let lock = state.lock(field);
        if let Some(writer) = lock.writer() {
            conflicts.push((field, ConflictType::WriteWrite(writer)));
        } else if !lock.readers().is_empty() {
            conflicts.push((field, ConflictType::WriteRead));
        }
    }

    for field in spec.shared_only() {
        if let Some(writer) = state.lock(field).writer() {
            conflicts.push((field, ConflictType::ReadWrite(writer)));
        }
    }

    conflicts
}

/// Grants `txn_id` the locks named by `spec`. Callers run
/// [`detect_conflicts`] first and only acquire when it found nothing.
pub fn acquire_locks<S: TransactionalState>(txn_id: TxnId, spec: &FieldSpec<S::Field>, state: &mut S) {
    for field in spec.rw.iter().copied() {
        state.lock_mut(field).grant_write(txn_id);
    }
    for field in spec.shared_only() {
        state.lock_mut(field).grant_read(txn_id);
    }
}

/// Releases every lock `txn_id` holds on any field of `state`.
/// Returns how many fields were released.
pub fn release_locks<S: TransactionalState>(txn_id: TxnId, state: &mut S) -> usize {
    S::FIELDS
        .iter()
        .filter(|field| state.lock_mut(**field).release(txn_id))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_store::{FieldLock, LockMeta};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    enum Field {
        Ytd,
        NextOrderId,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct District {
        ytd: FieldLock<i64>,
        next_order_id: FieldLock<u32>,
    }

    impl TransactionalState for District {
        type Field = Field;
        const FIELDS: &'static [Field] = &[Field::Ytd, Field::NextOrderId];

        fn lock(&self, field: Field) -> &LockMeta {
            match field {
                Field::Ytd => self.ytd.lock(),
                Field::NextOrderId => self.next_order_id.lock(),
            }
        }

        fn lock_mut(&mut self, field: Field) -> &mut LockMeta {
            match field {
                Field::Ytd => self.ytd.lock_mut(),
                Field::NextOrderId => self.next_order_id.lock_mut(),
            }
        }
    }

    #[test]
    fn writer_blocks_readers_and_writers() {
        let t1 = TxnId::new();
        let mut district = District::default();
        let spec = FieldSpec::read_write([Field::Ytd]);

        assert!(detect_conflicts(&spec, &district).is_empty());
        acquire_locks(t1, &spec, &mut district);

        assert_eq!(
            detect_conflicts(&spec, &district),
            vec![(Field::Ytd, ConflictType::WriteWrite(t1))]
        );
        assert_eq!(
            detect_conflicts(&FieldSpec::read_only([Field::Ytd]), &district),
            vec![(Field::Ytd, ConflictType::ReadWrite(t1))]
        );
        // untouched field stays available
        assert!(detect_conflicts(&FieldSpec::read_write([Field::NextOrderId]), &district).is_empty());

        assert_eq!(release_locks(t1, &mut district), 1);
        assert!(detect_conflicts(&spec, &district).is_empty());
    }

    #[test]
    fn readers_block_only_writers() {
        let (t1, t2) = (TxnId::new(), TxnId::new());
        let mut district = District::default();
        let read = FieldSpec::read_only([Field::Ytd, Field::NextOrderId]);

        acquire_locks(t1, &read, &mut district);
        assert!(detect_conflicts(&read, &district).is_empty());
        acquire_locks(t2, &read, &mut district);
        assert_eq!(district.ytd.lock().readers(), &[t1, t2]);

        assert_eq!(
            detect_conflicts(&FieldSpec::read_write([Field::Ytd]), &district),
            vec![(Field::Ytd, ConflictType::WriteRead)]
        );

        assert_eq!(release_locks(t1, &mut district), 2);
        assert_eq!(release_locks(t2, &mut district), 2);
        assert!(district.ytd.lock().is_free());
    }

    #[test]
    fn field_in_both_lists_is_written() {
        let t1 = TxnId::new();
        let mut district = District::default();
        let spec = FieldSpec::read_write([Field::Ytd]).with_read_only([Field::Ytd, Field::NextOrderId]);

        assert_eq!(spec.fields().collect::<Vec<_>>(), vec![Field::Ytd, Field::NextOrderId]);
        acquire_locks(t1, &spec, &mut district);
        assert_eq!(district.ytd.lock().writer(), Some(t1));
        assert!(district.ytd.lock().readers().is_empty());
        assert_eq!(district.next_order_id.lock().readers(), &[t1]);
    }
}
