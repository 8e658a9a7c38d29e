//! A minimal in-process actor host.
//!
//! Every activated actor is a tokio task that owns the actor value and drains
//! an unbounded mailbox, so an actor's handlers never run concurrently with
//! each other. That serialized execution is the only synchronization the
//! transaction layer relies on inside one actor.

mod system;

pub use system::ActorSystem;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::errors::{Result, TxnError};
use crate::storage::ActorState;

/// State key marking an actor whose work is finished. Retired actors are
/// skipped by [`ActorSystem::resume`] but can still be activated by id.
pub const RETIRED: &str = "retired";

/// The (type, id) pair naming a durable actor instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorId {
    kind: String,
    key: String,
}

impl ActorId {
    pub fn new(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// An id of the given kind with a random key, for one-shot actors such as
    /// a transaction coordinator.
    pub fn unique(kind: impl Into<String>) -> Self {
        Self::new(kind, Uuid::new_v4().to_string())
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.key)
    }
}

/// An actor hosted by an [`ActorSystem`].
pub trait Actor: Send + Sized + 'static {
    type Message: Send + 'static;

    /// Loads the actor's in-memory fields from its durable state. Runs once per
    /// activation, before the first message is handled.
    fn activate(&mut self, ctx: &ActorContext<Self>) -> impl Future<Output = Result<()>> + Send;

    /// Handles one message. The next message is not taken from the mailbox
    /// until the returned future completes.
    fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &ActorContext<Self>,
    ) -> impl Future<Output = ()> + Send;
}

/// What an actor can reach while it runs.
pub struct ActorContext<A: Actor> {
    id: ActorId,
    state: ActorState,
    myself: ActorRef<A>,
    system: ActorSystem,
    stopping: AtomicBool,
}

impl<A: Actor> ActorContext<A> {
    pub fn id(&self) -> &ActorId {
        &self.id
    }

    /// The actor's own slice of the durable state store.
    pub fn state(&self) -> &ActorState {
        &self.state
    }

    /// A reference to this actor, for self-directed `tell`.
    pub fn myself(&self) -> &ActorRef<A> {
        &self.myself
    }

    pub fn system(&self) -> &ActorSystem {
        &self.system
    }

    /// Deactivates the actor once the current message is handled. Messages
    /// still queued are dropped; the next `proxy` activates it again.
    pub(crate) fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Durably marks the actor retired, then stops it.
    pub fn retire(&self) -> Result<()> {
        self.state.set(RETIRED, &true)?;
        self.stop();
        Ok(())
    }

    pub fn is_retired(&self) -> Result<bool> {
        Ok(self.state.get(RETIRED)?.unwrap_or(false))
    }
}

/// A stable handle to an actor instance.
pub struct ActorRef<A: Actor> {
    id: ActorId,
    sender: mpsc::UnboundedSender<A::Message>,
    call_timeout: Option<Duration>,
}

impl<A: Actor> Clone for ActorRef<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            sender: self.sender.clone(),
            call_timeout: self.call_timeout,
        }
    }
}

impl<A: Actor> fmt::Debug for ActorRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRef").field("id", &self.id).finish()
    }
}

impl<A: Actor> ActorRef<A> {
    pub fn id(&self) -> &ActorId {
        &self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Fire-and-forget delivery.
    pub fn tell(&self, msg: A::Message) -> Result<()> {
        self.sender
            .send(msg)
            .map_err(|_| TxnError::ActorUnavailable(self.id.clone()))
    }

    /// Sends a request now and returns a handle to await its reply later.
    ///
    /// `build` receives the reply channel and wraps it into the actor's
    /// message type.
    pub fn ask<R, F>(&self, build: F) -> Result<Pending<R>>
    where
        F: FnOnce(oneshot::Sender<R>) -> A::Message,
    {
        let (reply, receiver) = oneshot::channel();
        self.tell(build(reply))?;
        Ok(Pending {
            actor: self.id.clone(),
            receiver,
            timeout: self.call_timeout,
        })
    }

    /// Sends a request and waits for its reply.
    pub async fn call<R, F>(&self, build: F) -> Result<R>
    where
        F: FnOnce(oneshot::Sender<R>) -> A::Message,
    {
        self.ask(build)?.wait().await
    }
}

/// A reply that has been requested but not yet awaited.
#[must_use = "a pending reply does nothing unless awaited"]
pub struct Pending<R> {
    actor: ActorId,
    receiver: oneshot::Receiver<R>,
    timeout: Option<Duration>,
}

impl<R> Pending<R> {
    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    /// Waits for the reply. A dropped request (the actor stopped) or an
    /// expired call timeout is a rejected future.
    pub async fn wait(self) -> Result<R> {
        let Pending {
            actor,
            receiver,
            timeout,
        } = self;
        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, receiver).await {
                Ok(received) => received,
                Err(_) => return Err(TxnError::Timeout(actor)),
            },
            None => receiver.await,
        };
        received.map_err(|_| TxnError::ActorUnavailable(actor))
    }
}

pub(crate) type Factory<A> = Arc<dyn Fn(&ActorId) -> A + Send + Sync>;
