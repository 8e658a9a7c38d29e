//! The coordinator side of the protocol.
//!
//! One [`CoordinatorActor`] runs exactly one transaction. Its record (the
//! transaction id, the participant list with their operations, snapshots and
//! planned updates, the decision and the commit-complete flag) is persisted at
//! every step, so a restarted coordinator either finishes the commit phase on
//! its own or answers a repeated `start` from its record. Once every
//! participant has purged the transaction the coordinator retires: it stops,
//! and [`ActorSystem::resume`] no longer activates it.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashSet as HashSet;
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::errors::{Result, TxnError};
use crate::participant::{ParticipantActor, ParticipantLogic};
use crate::runtime::{Actor, ActorContext, ActorId, ActorRef, ActorSystem};
use crate::storage::{ActorState, StateBatch};
use crate::twopc::{CommitOutcome, Payload, RemoteParticipant, TxnId, Vote};

pub const TXN_ID: &str = "txnId";
pub const PARTICIPANT_UPDATES: &str = "participantUpdates";
pub const DECISION: &str = "decision";
pub const COMMIT_COMPLETE: &str = "commitComplete";

/// One participant of a transaction as the coordinator records it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantEntry<O, U, V> {
    pub key: ActorId,
    pub operation: O,
    /// Snapshot returned with the participant's positive vote.
    pub values: Option<V>,
    /// Update planned for the participant once every vote was positive.
    pub update: Option<U>,
}

type EntryOf<P> = ParticipantEntry<
    <P as RemoteParticipant>::Op,
    <P as RemoteParticipant>::Update,
    <P as RemoteParticipant>::Values,
>;

/// The durable record of one transaction.
#[derive(Debug, Clone)]
pub struct TransactionRecord<O, U, V> {
    pub txn_id: TxnId,
    pub participants: Vec<ParticipantEntry<O, U, V>>,
    pub decision: Option<bool>,
    pub commit_complete: bool,
}

impl<O: Payload, U: Payload, V: Payload> TransactionRecord<O, U, V> {
    /// Loads the record. A coordinator that never started gets a fresh
    /// transaction id, persisted only once `start` records its participants.
    pub fn load(state: &ActorState) -> Result<Self> {
        Ok(Self {
            txn_id: state.get(TXN_ID)?.unwrap_or_default(),
            participants: state.get(PARTICIPANT_UPDATES)?.unwrap_or_default(),
            decision: state.get(DECISION)?,
            commit_complete: state.get(COMMIT_COMPLETE)?.unwrap_or(false),
        })
    }
}

/// Where a transaction stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// No participants recorded yet.
    Init,
    /// Participants recorded, no decision yet.
    Preparing,
    /// Decision durable, no commit dispatch running.
    Decided,
    /// Commit dispatch running or waiting to retry.
    Committing,
    /// Every participant acknowledged the decision.
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnStatus {
    pub txn_id: TxnId,
    pub phase: Phase,
    pub decision: Option<bool>,
    pub commit_complete: bool,
}

/// Maps participant ids to handles the coordinator can call.
pub trait Directory<P>: Send + Sync + 'static {
    fn resolve(&self, system: &ActorSystem, key: &ActorId) -> Result<P>;
}

/// Resolves participants through [`ActorSystem::proxy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyDirectory;

impl<L: ParticipantLogic> Directory<ActorRef<ParticipantActor<L>>> for ProxyDirectory {
    fn resolve(&self, system: &ActorSystem, key: &ActorId) -> Result<ActorRef<ParticipantActor<L>>> {
        system.proxy(key)
    }
}

/// Computes each participant's commit payload from its operation and the
/// snapshot it returned with its vote.
pub trait UpdatePlanner<P: RemoteParticipant>: Send + Sync + 'static {
    fn plan(&self, key: &ActorId, op: &P::Op, values: Option<&P::Values>) -> P::Update;
}

/// Commits the prepare operation itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayOperation;

impl<P> UpdatePlanner<P> for ReplayOperation
where
    P: RemoteParticipant,
    P::Op: Into<P::Update>,
{
    fn plan(&self, _key: &ActorId, op: &P::Op, _values: Option<&P::Values>) -> P::Update {
        op.clone().into()
    }
}

pub enum CoordinatorMsg<P: RemoteParticipant> {
    Start {
        participants: Vec<ActorId>,
        operations: Vec<P::Op>,
        reply: oneshot::Sender<Result<bool>>,
    },
    Status {
        reply: oneshot::Sender<TxnStatus>,
    },
    /// Starts a commit dispatch unless one is already running.
    SendCommit,
    /// Result of a dispatch: whether every participant acknowledged.
    CommitAttempted { delivered: bool },
    /// A failed dispatch's backoff elapsed.
    RetryCommit,
    Purge,
    PurgeAttempted { purged: bool },
}

/// Runs one transaction.
pub struct CoordinatorActor<P: RemoteParticipant> {
    directory: Arc<dyn Directory<P>>,
    planner: Arc<dyn UpdatePlanner<P>>,
    record: TransactionRecord<P::Op, P::Update, P::Values>,
    commit_in_flight: bool,
    failed_attempts: u32,
    purge_in_flight: bool,
    retired: bool,
}

impl<P: RemoteParticipant> CoordinatorActor<P> {
    pub fn new(directory: Arc<dyn Directory<P>>, planner: Arc<dyn UpdatePlanner<P>>) -> Self {
        Self {
            directory,
            planner,
            record: TransactionRecord {
                txn_id: TxnId::new(),
                participants: Vec::new(),
                decision: None,
                commit_complete: false,
            },
            commit_in_flight: false,
            failed_attempts: 0,
            purge_in_flight: false,
            retired: false,
        }
    }

    fn status(&self) -> TxnStatus {
        let phase = match (self.record.decision, self.record.commit_complete) {
            (_, true) => Phase::Complete,
            (Some(_), false) if self.commit_in_flight => Phase::Committing,
            (Some(_), false) => Phase::Decided,
            (None, _) if self.record.participants.is_empty() => Phase::Init,
            (None, _) => Phase::Preparing,
        };
        TxnStatus {
            txn_id: self.record.txn_id,
            phase,
            decision: self.record.decision,
            commit_complete: self.record.commit_complete,
        }
    }

    /// Runs phase 1 if no decision is durable yet, then dispatches the
    /// commit phase in the background and answers with the decision.
    async fn start(
        &mut self,
        ctx: &ActorContext<Self>,
        participants: Vec<ActorId>,
        operations: Vec<P::Op>,
    ) -> Result<bool> {
        if participants.len() != operations.len() {
            return Err(TxnError::ArgumentMismatch {
                participants: participants.len(),
                operations: operations.len(),
            });
        }

        let mut seen = HashSet::with_capacity(participants.len());
        if let Some(duplicate) = participants.iter().find(|&key| !seen.insert(key)) {
            return Err(TxnError::DuplicateParticipant(duplicate.clone()));
        }
        drop(seen);

        let txn_id = self.record.txn_id;
        if let Some(decision) = self.record.decision {
            debug!("Transaction {} already decided {}", txn_id, decision);
            self.dispatch_commit(ctx);
            return Ok(decision);
        }

        let handles = if self.record.participants.is_empty() {
            // nothing is persisted for a participant list that cannot be reached
            let handles = self.resolve_all(ctx.system(), &participants)?;
            let entries: Vec<EntryOf<P>> = participants
                .into_iter()
                .zip(operations)
                .map(|(key, operation)| ParticipantEntry {
                    key,
                    operation,
                    values: None,
                    update: None,
                })
                .collect();
            let mut batch = StateBatch::new();
            batch.put(TXN_ID, &txn_id)?.put(PARTICIPANT_UPDATES, &entries)?;
            ctx.state().write(batch)?;
            self.record.participants = entries;
            Some(handles)
        } else {
            // a crash during phase 1 left the list behind; prepare is idempotent
            debug!(
                "Transaction {} re-preparing its {} recorded participants",
                txn_id,
                self.record.participants.len()
            );
            let keys: Vec<ActorId> = self.record.participants.iter().map(|e| e.key.clone()).collect();
            match self.resolve_all(ctx.system(), &keys) {
                Ok(handles) => Some(handles),
                Err(e) => {
                    warn!("Transaction {} cannot reach a participant: {}", txn_id, e);
                    None
                }
            }
        };

        info!(
            "Transaction {} preparing {} participants",
            txn_id,
            self.record.participants.len()
        );
        let (decision, entries) = match handles {
            Some(handles) => self.prepare_all(handles).await,
            None => (false, self.record.participants.clone()),
        };

        let mut batch = StateBatch::new();
        batch.put(DECISION, &decision)?;
        batch.put(PARTICIPANT_UPDATES, &entries)?;
        ctx.state().write(batch)?;
        self.record.participants = entries;
        self.record.decision = Some(decision);
        info!(
            "Transaction {} decided {}",
            txn_id,
            if decision { "commit" } else { "abort" }
        );

        self.dispatch_commit(ctx);
        Ok(decision)
    }

    fn resolve_all(&self, system: &ActorSystem, keys: &[ActorId]) -> Result<Vec<P>> {
        keys.iter().map(|key| self.directory.resolve(system, key)).collect()
    }

    /// Sends prepare to every participant concurrently and combines the votes.
    /// Any failure to deliver or answer counts as a negative vote.
    async fn prepare_all(&self, handles: Vec<P>) -> (bool, Vec<EntryOf<P>>) {
        let txn_id = self.record.txn_id;
        let mut entries = self.record.participants.clone();

        let tasks = handles.into_iter().zip(&entries).map(move |(participant, entry)| {
            let op = entry.operation.clone();
            tokio::spawn(async move { participant.prepare(txn_id, op).await })
        });
        let results = join_all(tasks.collect::<Vec<_>>()).await;

        let mut decision = true;
        for (entry, result) in entries.iter_mut().zip(results) {
            match result {
                Ok(Ok(Vote::Yes(values))) => entry.values = Some(values),
                Ok(Ok(Vote::No)) => {
                    debug!("Participant {} voted no on {}", entry.key, txn_id);
                    decision = false;
                }
                Ok(Err(e)) => {
                    warn!(
                        "{}",
                        TxnError::ParticipantUnreachable(format!("{} on prepare of {}: {}", entry.key, txn_id, e))
                    );
                    decision = false;
                }
                Err(e) => {
                    error!("Prepare task for {} panicked: {}", entry.key, e);
                    decision = false;
                }
            }
        }

        if decision {
            for entry in entries.iter_mut() {
                entry.update = Some(self.planner.plan(&entry.key, &entry.operation, entry.values.as_ref()));
            }
        }
        (decision, entries)
    }

    /// Decides abort for a transaction whose coordinator stopped after recording
    /// its participants but before deciding. Participants that voted yes hold
    /// locks until they hear the decision.
    fn abort_undecided(&mut self, ctx: &ActorContext<Self>) -> Result<()> {
        ctx.state().set(DECISION, &false)?;
        self.record.decision = Some(false);
        info!(
            "Transaction {} was interrupted before its decision; aborting {} participants",
            self.record.txn_id,
            self.record.participants.len()
        );
        self.dispatch_commit(ctx);
        Ok(())
    }

    fn dispatch_commit(&self, ctx: &ActorContext<Self>) {
        if self.record.commit_complete {
            return;
        }
        if let Err(e) = ctx.myself().tell(CoordinatorMsg::SendCommit) {
            warn!("Transaction {} could not schedule its commit phase: {}", self.record.txn_id, e);
        }
    }

    fn send_commit(&mut self, ctx: &ActorContext<Self>) {
        let Some(decision) = self.record.decision else {
            return;
        };
        if self.record.commit_complete || self.commit_in_flight {
            return;
        }
        self.commit_in_flight = true;

        let txn_id = self.record.txn_id;
        let targets: Vec<(ActorId, Option<P::Update>)> = self
            .record
            .participants
            .iter()
            .map(|entry| (entry.key.clone(), entry.update.clone().filter(|_| decision)))
            .collect();
        let directory = Arc::clone(&self.directory);
        let system = ctx.system().clone();
        let myself = ctx.myself().clone();

        debug!(
            "Transaction {} dispatching {} to {} participants",
            txn_id,
            decision,
            targets.len()
        );
        tokio::spawn(async move {
            let delivered = deliver_commit(directory, &system, txn_id, decision, targets).await;
            let _ = myself.tell(CoordinatorMsg::CommitAttempted { delivered });
        });
    }

    fn commit_attempted(&mut self, ctx: &ActorContext<Self>, delivered: bool) {
        let txn_id = self.record.txn_id;
        if delivered {
            match ctx.state().set(COMMIT_COMPLETE, &true) {
                Ok(()) => {
                    self.commit_in_flight = false;
                    self.record.commit_complete = true;
                    self.failed_attempts = 0;
                    info!("Transaction {} commit phase complete", txn_id);
                    let _ = ctx.myself().tell(CoordinatorMsg::Purge);
                    return;
                }
                Err(e) => error!("Transaction {} failed to persist completion: {}", txn_id, e),
            }
        }

        let delay = ctx.system().config().commit_backoff(self.failed_attempts);
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        warn!(
            "Transaction {} commit attempt {} incomplete, retrying in {:?}",
            txn_id, self.failed_attempts, delay
        );
        // stays in flight until the retry fires
        tell_later(ctx.myself().clone(), delay, CoordinatorMsg::RetryCommit);
    }

    fn purge(&mut self, ctx: &ActorContext<Self>) {
        if !self.record.commit_complete || self.purge_in_flight || self.retired {
            return;
        }
        self.purge_in_flight = true;

        let txn_id = self.record.txn_id;
        let keys: Vec<ActorId> = self.record.participants.iter().map(|e| e.key.clone()).collect();
        let directory = Arc::clone(&self.directory);
        let system = ctx.system().clone();
        let myself = ctx.myself().clone();

        tokio::spawn(async move {
            let purged = purge_all(directory, &system, txn_id, keys).await;
            let _ = myself.tell(CoordinatorMsg::PurgeAttempted { purged });
        });
    }

    fn purge_attempted(&mut self, ctx: &ActorContext<Self>, purged: bool) {
        self.purge_in_flight = false;
        if purged {
            match ctx.retire() {
                Ok(()) => {
                    self.retired = true;
                    debug!("Transaction {} purged from every participant; retiring", self.record.txn_id);
                    return;
                }
                Err(e) => error!("Transaction {} failed to persist retirement: {}", self.record.txn_id, e),
            }
        }
        let delay = ctx.system().config().purge_retry_backoff;
        warn!(
            "Transaction {} purge incomplete, retrying in {:?}",
            self.record.txn_id, delay
        );
        tell_later(ctx.myself().clone(), delay, CoordinatorMsg::Purge);
    }
}

impl<P: RemoteParticipant> Actor for CoordinatorActor<P> {
    type Message = CoordinatorMsg<P>;

    async fn activate(&mut self, ctx: &ActorContext<Self>) -> Result<()> {
        self.record = TransactionRecord::load(ctx.state())?;
        self.retired = ctx.is_retired()?;
        if self.retired || !ctx.system().config().resume_on_activate {
            return Ok(());
        }
        match (self.record.decision, self.record.commit_complete) {
            (None, _) if !self.record.participants.is_empty() => self.abort_undecided(ctx)?,
            (Some(decision), false) => {
                info!(
                    "Transaction {} resuming commit phase with decision {}",
                    self.record.txn_id, decision
                );
                self.dispatch_commit(ctx);
            }
            (Some(_), true) => {
                let _ = ctx.myself().tell(CoordinatorMsg::Purge);
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle(&mut self, msg: Self::Message, ctx: &ActorContext<Self>) {
        match msg {
            CoordinatorMsg::Start {
                participants,
                operations,
                reply,
            } => {
                let result = self.start(ctx, participants, operations).await;
                let _ = reply.send(result);
            }
            CoordinatorMsg::Status { reply } => {
                let _ = reply.send(self.status());
            }
            CoordinatorMsg::SendCommit => self.send_commit(ctx),
            CoordinatorMsg::CommitAttempted { delivered } => self.commit_attempted(ctx, delivered),
            CoordinatorMsg::RetryCommit => {
                self.commit_in_flight = false;
                self.send_commit(ctx);
            }
            CoordinatorMsg::Purge => self.purge(ctx),
            CoordinatorMsg::PurgeAttempted { purged } => self.purge_attempted(ctx, purged),
        }
    }
}

/// Sends the decision to every participant concurrently. Returns whether every
/// one of them acknowledged.
async fn deliver_commit<P: RemoteParticipant>(
    directory: Arc<dyn Directory<P>>,
    system: &ActorSystem,
    txn_id: TxnId,
    decision: bool,
    targets: Vec<(ActorId, Option<P::Update>)>,
) -> bool {
    let mut delivered = true;
    let mut tasks = Vec::with_capacity(targets.len());
    for (key, update) in targets {
        match directory.resolve(system, &key) {
            Ok(participant) => tasks.push(tokio::spawn(async move {
                let outcome = participant.commit(txn_id, decision, update).await;
                (key, outcome)
            })),
            Err(e) => {
                warn!("Commit of {} cannot reach {}: {}", txn_id, key, e);
                delivered = false;
            }
        }
    }

    for result in join_all(tasks).await {
        match result {
            Ok((key, Ok(CommitOutcome::Unprepared))) if decision => {
                error!("Participant {} never prepared committed transaction {}", key, txn_id);
            }
            Ok((key, Ok(outcome))) => debug!("Participant {} acknowledged {}: {:?}", key, txn_id, outcome),
            Ok((key, Err(e))) => {
                warn!("Commit of {} to {} failed: {}", txn_id, key, e);
                delivered = false;
            }
            Err(e) => {
                error!("Commit task of {} panicked: {}", txn_id, e);
                delivered = false;
            }
        }
    }
    delivered
}

async fn purge_all<P: RemoteParticipant>(
    directory: Arc<dyn Directory<P>>,
    system: &ActorSystem,
    txn_id: TxnId,
    keys: Vec<ActorId>,
) -> bool {
    let mut purged = true;
    let mut tasks = Vec::with_capacity(keys.len());
    for key in keys {
        match directory.resolve(system, &key) {
            Ok(participant) => tasks.push(tokio::spawn(async move { participant.purge(txn_id).await })),
            Err(e) => {
                warn!("Purge of {} cannot reach {}: {}", txn_id, key, e);
                purged = false;
            }
        }
    }
    for result in join_all(tasks).await {
        if !matches!(result, Ok(Ok(()))) {
            purged = false;
        }
    }
    purged
}

fn tell_later<A: Actor>(target: ActorRef<A>, delay: Duration, msg: A::Message) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = target.tell(msg);
    });
}

impl<P: RemoteParticipant> ActorRef<CoordinatorActor<P>> {
    /// Runs the transaction: `operations[i]` is prepared on `participants[i]`.
    ///
    /// Resolves to the global decision once it is durable. The commit phase
    /// continues in the background. Calling this again after a decision was
    /// reached returns the same decision without contacting anyone.
    pub async fn start(&self, participants: Vec<ActorId>, operations: Vec<P::Op>) -> Result<bool> {
        self.call(|reply| CoordinatorMsg::Start {
            participants,
            operations,
            reply,
        })
        .await?
    }

    pub async fn status(&self) -> Result<TxnStatus> {
        self.call(|reply| CoordinatorMsg::Status { reply }).await
    }
}

impl ActorSystem {
    /// Registers the coordinator implementation for actors of `kind`.
    pub fn register_coordinator<P, D, U>(&self, kind: impl Into<String>, directory: D, planner: U)
    where
        P: RemoteParticipant,
        D: Directory<P>,
        U: UpdatePlanner<P>,
    {
        let directory: Arc<dyn Directory<P>> = Arc::new(directory);
        let planner: Arc<dyn UpdatePlanner<P>> = Arc::new(planner);
        self.register(kind, move |_id: &ActorId| {
            CoordinatorActor::new(Arc::clone(&directory), Arc::clone(&planner))
        });
    }

    /// Handle to the coordinator `id`.
    pub fn coordinator<P: RemoteParticipant>(&self, id: &ActorId) -> Result<ActorRef<CoordinatorActor<P>>> {
        self.proxy(id)
    }

    /// Handle to a fresh coordinator of `kind` with a random key.
    pub fn new_coordinator<P: RemoteParticipant>(&self, kind: &str) -> Result<ActorRef<CoordinatorActor<P>>> {
        self.proxy(&ActorId::unique(kind))
    }
}
