//! Common utilities for actor-txn integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use actor_txn::coordinator::TxnStatus;
use actor_txn::prelude::*;
use serde::{Deserialize, Serialize};

pub const ACCOUNT: &str = "account";
pub const TRANSFER: &str = "transfer";
pub const ITEM: &str = "item";
pub const RESTOCK: &str = "restock";

pub const OPENING_BALANCE: i64 = 1000;

// --- Bank account domain ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountField {
    Balance,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountState {
    pub balance: FieldLock<i64>,
}

impl TransactionalState for AccountState {
    type Field = AccountField;
    const FIELDS: &'static [AccountField] = &[AccountField::Balance];

    fn lock(&self, field: AccountField) -> &LockMeta {
        match field {
            AccountField::Balance => self.balance.lock(),
        }
    }

    fn lock_mut(&mut self, field: AccountField) -> &mut LockMeta {
        match field {
            AccountField::Balance => self.balance.lock_mut(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub balance: i64,
}

/// Operations and updates are signed amounts added to the balance.
pub struct AccountLogic {
    pub opening_balance: i64,
}

impl ParticipantLogic for AccountLogic {
    type State = AccountState;
    type Op = i64;
    type Update = i64;
    type Values = AccountSnapshot;

    fn initial_state(&self, _id: &ActorId) -> AccountState {
        AccountState {
            balance: FieldLock::new(self.opening_balance),
        }
    }

    fn access(&self, _op: &i64) -> FieldSpec<AccountField> {
        FieldSpec::read_write([AccountField::Balance])
    }

    fn admits(&self, state: &AccountState, amount: &i64) -> bool {
        state.balance.value() + amount > 0
    }

    fn snapshot(&self, state: &AccountState, _spec: &FieldSpec<AccountField>) -> AccountSnapshot {
        AccountSnapshot {
            balance: *state.balance.value(),
        }
    }

    fn apply(&self, state: &mut AccountState, amount: &i64) {
        *state.balance.value_mut() += amount;
    }
}

pub type AccountRef = ActorRef<ParticipantActor<AccountLogic>>;
pub type Transfer = CoordinatorActor<AccountRef>;
pub type FlakyTransfer = CoordinatorActor<Flaky<AccountRef>>;

pub fn account(key: &str) -> ActorId {
    ActorId::new(ACCOUNT, key)
}

// --- Catalog item domain: several fields, explicit rw/ro requests ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemField {
    Price,
    Stock,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemState {
    pub price: FieldLock<i64>,
    pub stock: FieldLock<i64>,
}

impl TransactionalState for ItemState {
    type Field = ItemField;
    const FIELDS: &'static [ItemField] = &[ItemField::Price, ItemField::Stock];

    fn lock(&self, field: ItemField) -> &LockMeta {
        match field {
            ItemField::Price => self.price.lock(),
            ItemField::Stock => self.stock.lock(),
        }
    }

    fn lock_mut(&mut self, field: ItemField) -> &mut LockMeta {
        match field {
            ItemField::Price => self.price.lock_mut(),
            ItemField::Stock => self.stock.lock_mut(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub price: Option<i64>,
    pub stock: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ItemUpdate {
    pub price: Option<i64>,
    pub stock_delta: i64,
}

/// The prepare operation is the field request itself.
pub struct ItemLogic;

impl ParticipantLogic for ItemLogic {
    type State = ItemState;
    type Op = FieldSpec<ItemField>;
    type Update = ItemUpdate;
    type Values = ItemSnapshot;

    fn initial_state(&self, _id: &ActorId) -> ItemState {
        ItemState {
            price: FieldLock::new(10),
            stock: FieldLock::new(0),
        }
    }

    fn access(&self, op: &FieldSpec<ItemField>) -> FieldSpec<ItemField> {
        op.clone()
    }

    fn snapshot(&self, state: &ItemState, spec: &FieldSpec<ItemField>) -> ItemSnapshot {
        let mut snapshot = ItemSnapshot::default();
        for field in spec.fields() {
            match field {
                ItemField::Price => snapshot.price = Some(*state.price.value()),
                ItemField::Stock => snapshot.stock = Some(*state.stock.value()),
            }
        }
        snapshot
    }

    fn apply(&self, state: &mut ItemState, update: &ItemUpdate) {
        if let Some(price) = update.price {
            state.price.set(price);
        }
        *state.stock.value_mut() += update.stock_delta;
    }
}

pub type ItemRef = ActorRef<ParticipantActor<ItemLogic>>;
pub type Restock = CoordinatorActor<ItemRef>;

/// Brings the stock of every item to `target`, using the stock each item
/// reported with its vote.
pub struct RestockPlanner {
    pub target: i64,
}

impl UpdatePlanner<ItemRef> for RestockPlanner {
    fn plan(&self, _key: &ActorId, _op: &FieldSpec<ItemField>, values: Option<&ItemSnapshot>) -> ItemUpdate {
        let current = values.and_then(|v| v.stock).unwrap_or_default();
        ItemUpdate {
            price: None,
            stock_delta: self.target - current,
        }
    }
}

pub fn item(key: &str) -> ActorId {
    ActorId::new(ITEM, key)
}

// --- Fault injection ---

/// Counters and switches for one participant behind a [`FlakyDirectory`].
#[derive(Debug, Default)]
pub struct Faults {
    pub fail_prepares: AtomicBool,
    pub commit_failures_left: AtomicUsize,
    pub prepare_attempts: AtomicUsize,
    pub commit_attempts: AtomicUsize,
}

impl Faults {
    pub fn fail_next_commits(&self, count: usize) {
        self.commit_failures_left.store(count, Ordering::SeqCst);
    }

    fn take_commit_failure(&self) -> bool {
        self.commit_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

/// Wraps a participant handle so requests can fail before reaching it.
#[derive(Clone)]
pub struct Flaky<P> {
    inner: P,
    faults: Arc<Faults>,
}

impl<P: RemoteParticipant> RemoteParticipant for Flaky<P> {
    type Op = P::Op;
    type Update = P::Update;
    type Values = P::Values;

    fn key(&self) -> &ActorId {
        self.inner.key()
    }

    async fn prepare(&self, txn_id: TxnId, op: P::Op) -> Result<Vote<P::Values>> {
        self.faults.prepare_attempts.fetch_add(1, Ordering::SeqCst);
        if self.faults.fail_prepares.load(Ordering::SeqCst) {
            return Err(TxnError::ParticipantUnreachable(self.key().to_string()));
        }
        self.inner.prepare(txn_id, op).await
    }

    async fn commit(&self, txn_id: TxnId, decision: bool, update: Option<P::Update>) -> Result<CommitOutcome> {
        self.faults.commit_attempts.fetch_add(1, Ordering::SeqCst);
        if self.faults.take_commit_failure() {
            return Err(TxnError::ParticipantUnreachable(self.key().to_string()));
        }
        self.inner.commit(txn_id, decision, update).await
    }

    async fn purge(&self, txn_id: TxnId) -> Result<()> {
        self.inner.purge(txn_id).await
    }
}

/// Resolves account actors wrapped in [`Flaky`], sharing one [`Faults`] per key.
#[derive(Clone, Default)]
pub struct FlakyDirectory {
    faults: Arc<Mutex<HashMap<ActorId, Arc<Faults>>>>,
}

impl FlakyDirectory {
    pub fn faults(&self, key: &ActorId) -> Arc<Faults> {
        self.faults
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .clone()
    }
}

impl Directory<Flaky<AccountRef>> for FlakyDirectory {
    fn resolve(&self, system: &ActorSystem, key: &ActorId) -> Result<Flaky<AccountRef>> {
        Ok(Flaky {
            inner: system.participant::<AccountLogic>(key)?,
            faults: self.faults(key),
        })
    }
}

// --- Helper Functions ---

/// Short timeouts and backoffs so retry paths finish quickly.
pub fn test_config() -> TxnConfig {
    TxnConfig::default()
        .with_call_timeout(Some(Duration::from_secs(5)))
        .with_commit_retry_backoff(Duration::from_millis(1), Duration::from_millis(20))
        .with_purge_retry_backoff(Duration::from_millis(5))
}

/// A system hosting accounts and transfer coordinators.
pub fn setup_bank(store: Arc<dyn StateStore>, config: TxnConfig) -> ActorSystem {
    let system = ActorSystem::new(store, config);
    system.register_participant(
        ACCOUNT,
        AccountLogic {
            opening_balance: OPENING_BALANCE,
        },
    );
    system.register_coordinator::<AccountRef, _, _>(TRANSFER, ProxyDirectory, ReplayOperation);
    system
}

/// Like [`setup_bank`], but transfers reach accounts through `directory`.
pub fn setup_flaky_bank(store: Arc<dyn StateStore>, config: TxnConfig, directory: FlakyDirectory) -> ActorSystem {
    let system = ActorSystem::new(store, config);
    system.register_participant(
        ACCOUNT,
        AccountLogic {
            opening_balance: OPENING_BALANCE,
        },
    );
    system.register_coordinator::<Flaky<AccountRef>, _, _>(TRANSFER, directory, ReplayOperation);
    system
}

pub fn setup_catalog(store: Arc<dyn StateStore>, target_stock: i64) -> ActorSystem {
    let system = ActorSystem::new(store, test_config());
    system.register_participant(ITEM, ItemLogic);
    system.register_coordinator::<ItemRef, _, _>(RESTOCK, ProxyDirectory, RestockPlanner { target: target_stock });
    system
}

pub fn memory_store() -> Arc<dyn StateStore> {
    Arc::new(MemoryStateStore::new())
}

/// Polls `check` until it holds or `timeout` expires. Returns the last result.
pub async fn wait_for_condition<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Polls until the commit phase is complete. A coordinator that already
/// retired is activated again by id to read its record.
pub async fn wait_complete<P: RemoteParticipant>(
    system: &ActorSystem,
    coordinator: &ActorRef<CoordinatorActor<P>>,
) -> TxnStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = match coordinator.status().await {
            Ok(status) => status,
            Err(TxnError::ActorUnavailable(_)) => system
                .coordinator::<P>(coordinator.id())
                .unwrap()
                .status()
                .await
                .unwrap(),
            Err(e) => panic!("status of {} failed: {}", coordinator.id(), e),
        };
        if status.commit_complete {
            return status;
        }
        assert!(Instant::now() < deadline, "transaction never completed: {:?}", status);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn balance(system: &ActorSystem, key: &str) -> i64 {
    let view = system
        .participant::<AccountLogic>(&account(key))
        .unwrap()
        .inspect()
        .await
        .unwrap();
    *view.state.balance.value()
}

/// Waits until the account holds no locks and its ledger was purged.
pub async fn wait_settled(system: &ActorSystem, key: &str) -> bool {
    let account = system.participant::<AccountLogic>(&account(key)).unwrap();
    wait_for_condition(Duration::from_secs(5), || {
        let account = account.clone();
        async move {
            let view = account.inspect().await.unwrap();
            view.ledger.is_empty() && view.state.balance.lock().is_free()
        }
    })
    .await
}
