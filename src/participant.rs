//! The participant side of the protocol.
//!
//! [`TransactionParticipant`] owns the generic part: the idempotence ledger,
//! the per-field locks and the atomic persistence of both. Everything
//! domain-specific (which fields an operation touches, whether it is
//! admissible, how an update changes the state) comes from an injected
//! [`ParticipantLogic`].

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::oneshot;

use crate::conflict::{FieldSpec, acquire_locks, detect_conflicts, release_locks};
use crate::data_store::{ParticipantLedger, TransactionalState};
use crate::errors::{Result, TxnError};
use crate::runtime::{Actor, ActorContext, ActorId, ActorRef, ActorSystem};
use crate::storage::{ActorState, StateBatch};
use crate::twopc::{CommitOutcome, Payload, RemoteParticipant, TxnId, Vote};

/// Key under which a participant persists its [`TransactionalState`].
pub const STATE_KEY: &str = "state";

/// Shorthand for the field enum of a logic's state.
pub type FieldOf<L> = <<L as ParticipantLogic>::State as TransactionalState>::Field;

/// Domain semantics plugged into a [`TransactionParticipant`].
pub trait ParticipantLogic: Send + Sync + 'static {
    type State: TransactionalState;
    /// Prepare payload.
    type Op: Payload;
    /// Commit payload.
    type Update: Payload;
    /// Snapshot returned with a positive vote.
    type Values: Payload;

    /// State of an actor that has never persisted anything.
    fn initial_state(&self, id: &ActorId) -> Self::State;

    /// The fields `op` reads and writes.
    fn access(&self, op: &Self::Op) -> FieldSpec<<Self::State as TransactionalState>::Field>;

    /// Domain admission check, run only when no lock conflicts. A `false`
    /// here is a negative vote, e.g. a debit larger than the balance.
    fn admits(&self, _state: &Self::State, _op: &Self::Op) -> bool {
        true
    }

    /// Reads the values handed back with a positive vote.
    fn snapshot(
        &self,
        state: &Self::State,
        spec: &FieldSpec<<Self::State as TransactionalState>::Field>,
    ) -> Self::Values;

    /// Applies a committed update to the field values. Lock metadata is
    /// managed by the caller and must be left alone.
    fn apply(&self, state: &mut Self::State, update: &Self::Update);
}

/// The generic prepare/commit capability of one participant actor.
pub struct TransactionParticipant<L: ParticipantLogic> {
    logic: Arc<L>,
    state: L::State,
    ledger: ParticipantLedger<L::Values>,
}

impl<L: ParticipantLogic> TransactionParticipant<L> {
    /// Restores the participant from its durable state, or starts it from
    /// [`ParticipantLogic::initial_state`] if nothing was persisted yet.
    pub fn load(logic: Arc<L>, store: &ActorState) -> Result<Self> {
        let state = match store.get::<L::State>(STATE_KEY)? {
            Some(state) => state,
            None => logic.initial_state(store.actor()),
        };
        let ledger = ParticipantLedger::load(store)?;
        Ok(Self {
            logic,
            state,
            ledger,
        })
    }

    pub fn state(&self) -> &L::State {
        &self.state
    }

    pub fn ledger(&self) -> &ParticipantLedger<L::Values> {
        &self.ledger
    }

    /// Phase 1.
    ///
    /// A transaction already in the ledger gets its recorded vote back with no
    /// side effect. Otherwise the requested locks are checked, then the domain
    /// admission check runs; on success the locks are taken and the vote, the
    /// locks and the snapshot are persisted in one atomic write.
    ///
    /// # Errors
    ///
    /// Only storage failures are errors. Nothing changes in memory when the
    /// write fails.
    pub fn prepare(&mut self, store: &ActorState, txn_id: TxnId, op: &L::Op) -> Result<Vote<L::Values>> {
        if let Some(vote) = self.ledger.prepared(txn_id) {
            debug!("{} replaying prepare of {}: vote {}", store.actor(), txn_id, vote);
            return Ok(self.replay(txn_id, vote, op));
        }

        let spec = self.logic.access(op);
        let conflicts = detect_conflicts(&spec, &self.state);
        let granted = if !conflicts.is_empty() {
            debug!(
                "{} votes no on {}: lock conflicts {:?}",
                store.actor(),
                txn_id,
                conflicts
            );
            false
        } else if !self.logic.admits(&self.state, op) {
            debug!("{} votes no on {}: operation not admitted", store.actor(), txn_id);
            false
        } else {
            true
        };

        let mut ledger = self.ledger.clone();
        let mut batch = StateBatch::new();

        if !granted {
            ledger.record_prepared(txn_id, false, None);
            ledger.stage(&mut batch)?;
            store.write(batch)?;
            self.ledger = ledger;
            return Ok(Vote::No);
        }

        let mut state = self.state.clone();
        acquire_locks(txn_id, &spec, &mut state);
        let values = self.logic.snapshot(&state, &spec);
        ledger.record_prepared(txn_id, true, Some(values.clone()));
        ledger.stage(&mut batch)?;
        batch.put(STATE_KEY, &state)?;
        store.write(batch)?;

        self.state = state;
        self.ledger = ledger;
        debug!("{} votes yes on {}", store.actor(), txn_id);
        Ok(Vote::Yes(values))
    }

    fn replay(&self, txn_id: TxnId, vote: bool, op: &L::Op) -> Vote<L::Values> {
        if !vote {
            return Vote::No;
        }
        match self.ledger.snapshot(txn_id) {
            Some(values) => Vote::Yes(values.clone()),
            // snapshot is dropped at commit; a late replay reads current values
            None => Vote::Yes(self.logic.snapshot(&self.state, &self.logic.access(op))),
        }
    }

    /// Phase 2.
    ///
    /// A commit for a transaction never prepared here is recorded as rejected
    /// and ignored. A commit already in the ledger is a no-op. Otherwise the
    /// update is applied when `decision` is true, every lock the transaction
    /// holds is released, and the new values are persisted together with the
    /// ledger entry.
    pub fn commit(
        &mut self,
        store: &ActorState,
        txn_id: TxnId,
        decision: bool,
        update: Option<&L::Update>,
    ) -> Result<CommitOutcome> {
        if self.ledger.prepared(txn_id).is_none() {
            warn!("{}: {}", store.actor(), TxnError::UnpreparedCommit(txn_id));
            let mut ledger = self.ledger.clone();
            ledger.record_rejected(txn_id);
            let mut batch = StateBatch::new();
            ledger.stage(&mut batch)?;
            store.write(batch)?;
            self.ledger = ledger;
            return Ok(CommitOutcome::Unprepared);
        }

        if let Some(recorded) = self.ledger.committed(txn_id) {
            debug!(
                "{} already committed {} with decision {}",
                store.actor(),
                txn_id,
                recorded
            );
            return Ok(CommitOutcome::Duplicate);
        }

        let mut state = self.state.clone();
        let outcome = if decision {
            match update {
                Some(update) => self.logic.apply(&mut state, update),
                None => warn!("{}: commit of {} carried no update", store.actor(), txn_id),
            }
            CommitOutcome::Applied
        } else {
            CommitOutcome::Aborted
        };
        let released = release_locks(txn_id, &mut state);

        let mut ledger = self.ledger.clone();
        ledger.record_committed(txn_id, decision);
        let mut batch = StateBatch::new();
        ledger.stage(&mut batch)?;
        batch.put(STATE_KEY, &state)?;
        store.write(batch)?;

        self.state = state;
        self.ledger = ledger;
        debug!(
            "{} committed {} ({:?}), released {} field locks",
            store.actor(),
            txn_id,
            outcome,
            released
        );
        Ok(outcome)
    }

    /// Removes `txn_id` from both ledgers once the coordinator has seen the
    /// commit phase complete everywhere.
    pub fn purge(&mut self, store: &ActorState, txn_id: TxnId) -> Result<()> {
        let mut ledger = self.ledger.clone();
        if !ledger.purge(txn_id) {
            return Ok(());
        }
        let mut batch = StateBatch::new();
        ledger.stage(&mut batch)?;
        store.write(batch)?;
        self.ledger = ledger;
        debug!("{} purged {}", store.actor(), txn_id);
        Ok(())
    }

    /// Non-transactional change of the field values, persisted immediately.
    /// No ACID guarantee: meant for setup and administration.
    pub fn modify(&mut self, store: &ActorState, change: impl FnOnce(&mut L::State)) -> Result<()> {
        let mut state = self.state.clone();
        change(&mut state);
        store.set(STATE_KEY, &state)?;
        self.state = state;
        Ok(())
    }
}

/// A consistent copy of a participant's state and ledger.
#[derive(Debug, Clone)]
pub struct ParticipantView<S, V> {
    pub state: S,
    pub ledger: ParticipantLedger<V>,
}

type StateChange<S> = Box<dyn FnOnce(&mut S) + Send>;

pub enum ParticipantMsg<L: ParticipantLogic> {
    Prepare {
        txn_id: TxnId,
        op: L::Op,
        reply: oneshot::Sender<Result<Vote<L::Values>>>,
    },
    Commit {
        txn_id: TxnId,
        decision: bool,
        update: Option<L::Update>,
        reply: oneshot::Sender<Result<CommitOutcome>>,
    },
    Purge {
        txn_id: TxnId,
        reply: oneshot::Sender<Result<()>>,
    },
    Inspect {
        reply: oneshot::Sender<ParticipantView<L::State, L::Values>>,
    },
    Modify {
        change: StateChange<L::State>,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Hosts a [`TransactionParticipant`] as an actor.
pub struct ParticipantActor<L: ParticipantLogic> {
    logic: Arc<L>,
    core: Option<TransactionParticipant<L>>,
}

impl<L: ParticipantLogic> ParticipantActor<L> {
    pub fn new(logic: Arc<L>) -> Self {
        Self { logic, core: None }
    }
}

impl<L: ParticipantLogic> Actor for ParticipantActor<L> {
    type Message = ParticipantMsg<L>;

    async fn activate(&mut self, ctx: &ActorContext<Self>) -> Result<()> {
        let core = TransactionParticipant::load(Arc::clone(&self.logic), ctx.state())?;
        let in_doubt = core.ledger().in_doubt().count();
        if in_doubt > 0 {
            info!(
                "{} activated with {} prepared transactions awaiting commit",
                ctx.id(),
                in_doubt
            );
        }
        self.core = Some(core);
        Ok(())
    }

    async fn handle(&mut self, msg: Self::Message, ctx: &ActorContext<Self>) {
        let Some(core) = self.core.as_mut() else {
            return;
        };
        let store = ctx.state();
        match msg {
            ParticipantMsg::Prepare { txn_id, op, reply } => {
                let _ = reply.send(core.prepare(store, txn_id, &op));
            }
            ParticipantMsg::Commit {
                txn_id,
                decision,
                update,
                reply,
            } => {
                let _ = reply.send(core.commit(store, txn_id, decision, update.as_ref()));
            }
            ParticipantMsg::Purge { txn_id, reply } => {
                let _ = reply.send(core.purge(store, txn_id));
            }
            ParticipantMsg::Inspect { reply } => {
                let _ = reply.send(ParticipantView {
                    state: core.state().clone(),
                    ledger: core.ledger().clone(),
                });
            }
            ParticipantMsg::Modify { change, reply } => {
                let _ = reply.send(core.modify(store, change));
            }
        }
    }
}

impl<L: ParticipantLogic> RemoteParticipant for ActorRef<ParticipantActor<L>> {
    type Op = L::Op;
    type Update = L::Update;
    type Values = L::Values;

    fn key(&self) -> &ActorId {
        self.id()
    }

    async fn prepare(&self, txn_id: TxnId, op: L::Op) -> Result<Vote<L::Values>> {
        self.call(|reply| ParticipantMsg::Prepare { txn_id, op, reply })
            .await?
    }

    async fn commit(
        &self,
        txn_id: TxnId,
        decision: bool,
        update: Option<L::Update>,
    ) -> Result<CommitOutcome> {
        self.call(|reply| ParticipantMsg::Commit {
            txn_id,
            decision,
            update,
            reply,
        })
        .await?
    }

    async fn purge(&self, txn_id: TxnId) -> Result<()> {
        self.call(|reply| ParticipantMsg::Purge { txn_id, reply })
            .await?
    }
}

impl<L: ParticipantLogic> ActorRef<ParticipantActor<L>> {
    /// Reads the participant's current state and ledger.
    pub async fn inspect(&self) -> Result<ParticipantView<L::State, L::Values>> {
        self.call(|reply| ParticipantMsg::Inspect { reply }).await
    }

    /// Non-transactional state change; see [`TransactionParticipant::modify`].
    pub async fn modify<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut L::State) + Send + 'static,
    {
        self.call(|reply| ParticipantMsg::Modify {
            change: Box::new(change),
            reply,
        })
        .await?
    }
}

impl ActorSystem {
    /// Registers `logic` as the participant implementation for actors of `kind`.
    pub fn register_participant<L: ParticipantLogic>(&self, kind: impl Into<String>, logic: L) {
        let logic = Arc::new(logic);
        self.register(kind, move |_id: &ActorId| ParticipantActor::new(Arc::clone(&logic)));
    }

    /// Handle to the participant actor `id`.
    pub fn participant<L: ParticipantLogic>(&self, id: &ActorId) -> Result<ActorRef<ParticipantActor<L>>> {
        self.proxy(id)
    }
}
