use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use ahash::AHashMap as HashMap;
use log::{debug, error, info};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

use super::{Actor, ActorContext, ActorId, ActorRef, Factory, RETIRED};
use crate::config::TxnConfig;
use crate::errors::{Result, TxnError};
use crate::storage::{ActorState, StateStore};

type Erased = Box<dyn Any + Send + Sync>;

struct SystemInner {
    store: Arc<dyn StateStore>,
    config: TxnConfig,
    /// kind -> `Factory<A>`
    factories: Mutex<HashMap<String, Erased>>,
    /// id -> `ActorRef<A>` of the current activation
    actors: Mutex<HashMap<ActorId, Erased>>,
    shutdown: watch::Sender<bool>,
}

/// Hosts actors over a shared durable [`StateStore`].
///
/// Cloning is cheap; clones share the same actors.
#[derive(Clone)]
pub struct ActorSystem {
    inner: Arc<SystemInner>,
}

impl ActorSystem {
    pub fn new(store: Arc<dyn StateStore>, config: TxnConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(SystemInner {
                store,
                config,
                factories: Mutex::new(HashMap::new()),
                actors: Mutex::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &TxnConfig {
        &self.inner.config
    }

    /// Installs the constructor used to activate actors of `kind`.
    /// Registering a kind again replaces its factory for future activations.
    pub fn register<A, F>(&self, kind: impl Into<String>, factory: F)
    where
        A: Actor,
        F: Fn(&ActorId) -> A + Send + Sync + 'static,
    {
        let factory: Factory<A> = Arc::new(factory);
        self.inner
            .factories
            .lock()
            .insert(kind.into(), Box::new(factory));
    }

    /// Returns the handle for `id`, activating the actor if it is not running.
    ///
    /// # Errors
    ///
    /// Fails with `UnknownActorKind` if no factory of actor type `A` is
    /// registered for the id's kind, and with `ActorUnavailable` once the
    /// system has been shut down.
    pub fn proxy<A: Actor>(&self, id: &ActorId) -> Result<ActorRef<A>> {
        if self.is_shut_down() {
            return Err(TxnError::ActorUnavailable(id.clone()));
        }

        let mut actors = self.inner.actors.lock();
        if let Some(existing) = actors.get(id) {
            match existing.downcast_ref::<ActorRef<A>>() {
                Some(actor_ref) if !actor_ref.is_closed() => return Ok(actor_ref.clone()),
                Some(_) => debug!("Actor {} stopped; re-activating", id),
                None => return Err(TxnError::UnknownActorKind(id.kind().to_string())),
            }
        }

        let factory = self
            .inner
            .factories
            .lock()
            .get(id.kind())
            .and_then(|erased| erased.downcast_ref::<Factory<A>>())
            .cloned()
            .ok_or_else(|| TxnError::UnknownActorKind(id.kind().to_string()))?;

        let actor_ref = self.spawn(id.clone(), factory(id))?;
        actors.insert(id.clone(), Box::new(actor_ref.clone()));
        Ok(actor_ref)
    }

    /// Activates every persisted actor of `kind` that has not retired.
    /// Coordinators resume their commit phase on activation, so this is the
    /// recovery sweep after a restart.
    pub fn resume<A: Actor>(&self, kind: &str) -> Result<Vec<ActorRef<A>>> {
        let persisted = self.inner.store.list_actors(kind)?;
        let mut active = Vec::with_capacity(persisted.len());
        for id in persisted.iter() {
            if self.inner.store.get(id, RETIRED)?.is_none() {
                active.push(id.clone());
            }
        }
        info!(
            "Resuming {} persisted {} actors ({} retired)",
            active.len(),
            kind,
            persisted.len() - active.len()
        );
        active.iter().map(|id| self.proxy::<A>(id)).collect()
    }

    /// Stops every actor after the message it is currently handling.
    ///
    /// Durable state is untouched; a new system over the same store picks up
    /// where this one stopped.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.actors.lock().clear();
        info!("Actor system shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Drops the table entry for `id` if it still points at a stopped activation.
    fn forget<A: Actor>(&self, id: &ActorId) {
        let mut actors = self.inner.actors.lock();
        let stopped = actors
            .get(id)
            .and_then(|existing| existing.downcast_ref::<ActorRef<A>>())
            .is_some_and(|actor_ref| actor_ref.is_closed());
        if stopped {
            actors.remove(id);
        }
    }

    fn spawn<A: Actor>(&self, id: ActorId, mut actor: A) -> Result<ActorRef<A>> {
        let runtime = Handle::try_current()
            .map_err(|e| TxnError::Other(format!("actor {} needs a tokio runtime: {}", id, e)))?;

        let (sender, mut mailbox) = mpsc::unbounded_channel();
        let myself = ActorRef {
            id: id.clone(),
            sender,
            call_timeout: self.inner.config.call_timeout,
        };
        let ctx = ActorContext {
            state: ActorState::new(Arc::clone(&self.inner.store), id.clone()),
            id,
            myself: myself.clone(),
            system: self.clone(),
            stopping: AtomicBool::new(false),
        };
        let mut shutdown = self.inner.shutdown.subscribe();

        runtime.spawn(async move {
            if let Err(e) = actor.activate(&ctx).await {
                error!("Failed to activate actor {}: {}", ctx.id, e);
                return;
            }
            debug!("Activated actor {}", ctx.id);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    msg = mailbox.recv() => match msg {
                        Some(msg) => actor.handle(msg, &ctx).await,
                        None => break,
                    },
                }
                if ctx.is_stopping() {
                    break;
                }
            }
            // closes every outstanding ref before the table entry goes away
            drop(mailbox);
            ctx.system.forget::<A>(&ctx.id);
            debug!("Actor {} stopped", ctx.id);
        });

        Ok(myself)
    }
}
