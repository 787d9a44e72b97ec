//! Backend registry and the manager owning live backend instances.
//!
//! The manager is an actor: one task owns the active-backend map and
//! processes [`Command`]s in order, so creating an instance and evicting it
//! on shutdown are never interleaved.

use overlay_common::{OverlayError, OverlayResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use super::{Backend, BackendContext};

/// Constructor for one backend type.
pub type BackendCtor =
    Box<dyn Fn(&BackendContext) -> OverlayResult<Arc<dyn Backend>> + Send + Sync>;

const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Name to constructor map, filled once by the composition root.
#[derive(Default)]
pub struct BackendRegistry {
    ctors: HashMap<String, BackendCtor>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor; the name is matched case-insensitively.
    pub fn register<F>(&mut self, name: &str, ctor: F)
    where
        F: Fn(&BackendContext) -> OverlayResult<Arc<dyn Backend>> + Send + Sync + 'static,
    {
        let name = name.to_lowercase();
        if self.ctors.insert(name.clone(), Box::new(ctor)).is_some() {
            warn!(backend = %name, "Backend constructor registered twice; keeping the last");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ctors.contains_key(&name.to_lowercase())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ctors.keys().cloned().collect();
        names.sort();
        names
    }

    fn get(&self, name: &str) -> Option<&BackendCtor> {
        self.ctors.get(name)
    }
}

/// Commands processed by the manager task.
enum Command {
    Get {
        name: String,
        responder: oneshot::Sender<OverlayResult<Arc<dyn Backend>>>,
    },
    /// Drop the cached instance if it is still the given generation.
    Evict { name: String, generation: u64 },
    List {
        responder: oneshot::Sender<Vec<String>>,
    },
}

struct Active {
    backend: Arc<dyn Backend>,
    generation: u64,
}

struct ManagerActor {
    registry: BackendRegistry,
    ctx: BackendContext,
    active: HashMap<String, Active>,
    next_generation: u64,
    command_rx: mpsc::Receiver<Command>,
    // Weak so eviction waiters never keep the actor alive.
    command_tx: mpsc::WeakSender<Command>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl ManagerActor {
    async fn run(mut self) {
        debug!("Backend manager running");
        while let Some(cmd) = self.command_rx.recv().await {
            self.handle_command(cmd);
        }
        debug!("Backend manager channel closed, shutting down");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Get { name, responder } => {
                let _ = responder.send(self.get_or_create(name));
            }
            Command::Evict { name, generation } => {
                let current = self.active.get(&name).map(|a| a.generation);
                if current == Some(generation) {
                    self.active.remove(&name);
                    info!(backend = %name, "Evicted backend");
                }
            }
            Command::List { responder } => {
                let mut names: Vec<String> = self.active.keys().cloned().collect();
                names.sort();
                let _ = responder.send(names);
            }
        }
    }

    fn get_or_create(&mut self, name: String) -> OverlayResult<Arc<dyn Backend>> {
        if let Some(active) = self.active.get(&name) {
            return Ok(active.backend.clone());
        }

        let ctor = self
            .registry
            .get(&name)
            .ok_or_else(|| OverlayError::unknown_backend(&name))?;
        let backend = ctor(&self.ctx)?;

        let generation = self.next_generation;
        self.next_generation += 1;
        self.active.insert(
            name.clone(),
            Active {
                backend: backend.clone(),
                generation,
            },
        );
        info!(backend = %name, "Created backend");

        self.spawn_evictor(name, generation);
        Ok(backend)
    }

    /// Evict the instance once shutdown begins.
    fn spawn_evictor(&self, name: String, generation: u64) {
        let cancel = self.cancel.clone();
        let command_tx = self.command_tx.clone();
        self.tracker.spawn(async move {
            cancel.cancelled().await;
            if let Some(tx) = command_tx.upgrade() {
                let _ = tx.send(Command::Evict { name, generation }).await;
            }
        });
    }
}

/// Cloneable handle to the backend manager task.
#[derive(Clone)]
pub struct BackendManager {
    command_tx: mpsc::Sender<Command>,
    tracker: TaskTracker,
}

impl BackendManager {
    /// Start the manager task. Instances are evicted when `cancel` fires.
    pub fn new(registry: BackendRegistry, ctx: BackendContext, cancel: CancellationToken) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let tracker = TaskTracker::new();

        let actor = ManagerActor {
            registry,
            ctx,
            active: HashMap::new(),
            next_generation: 0,
            command_rx,
            command_tx: command_tx.downgrade(),
            cancel,
            tracker: tracker.clone(),
        };
        tokio::spawn(actor.run());

        Self {
            command_tx,
            tracker,
        }
    }

    /// Return the live backend for `name`, creating it on first use.
    #[instrument(skip(self))]
    pub async fn get_backend(&self, name: &str) -> OverlayResult<Arc<dyn Backend>> {
        let (responder, rx) = oneshot::channel();
        let cmd = Command::Get {
            name: name.to_lowercase(),
            responder,
        };
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| OverlayError::internal("backend manager stopped"))?;
        rx.await
            .map_err(|_| OverlayError::internal("backend manager dropped request"))?
    }

    /// Names of the backends currently cached.
    pub async fn active_backends(&self) -> OverlayResult<Vec<String>> {
        let (responder, rx) = oneshot::channel();
        self.command_tx
            .send(Command::List { responder })
            .await
            .map_err(|_| OverlayError::internal("backend manager stopped"))?;
        rx.await
            .map_err(|_| OverlayError::internal("backend manager dropped request"))
    }

    /// Wait for every eviction to finish. Call after cancelling.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
