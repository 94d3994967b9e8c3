mod driver;
pub mod envelope;
pub mod events;
pub mod host;
pub mod identity;
pub mod merge;
pub mod model;
pub mod orchestrator;
pub mod protocol;
pub mod session;
pub mod snapshot;
pub mod transport;

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigStore, SyncConfig};
use crate::error::{Result, SyncError};
use driver::{Command, SessionDriver};
use events::{Notifier, SyncEvent, SyncInfo};
use host::HostStore;
use identity::{PeerId, Role, SharedSecret};
use orchestrator::Orchestrator;
use session::Session;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use transport::Transport;

/// Entry point: binds the host store, config store and tunables, and starts
/// sessions over a given transport.
pub struct SyncService {
    host: Arc<dyn HostStore>,
    store: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl SyncService {
    pub fn new(host: Arc<dyn HostStore>, store: Arc<dyn ConfigStore>) -> Self {
        Self {
            host,
            store,
            clock: Arc::new(SystemClock),
            config: SyncConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the passphrase, remember it together with the role, and
    /// start a session. Must be called from inside a tokio runtime.
    pub fn start(&self, secret: &str, role: Role, transport: Arc<dyn Transport>) -> Result<SyncHandle> {
        let secret = SharedSecret::new(secret)?;
        let mut persisted = self.store.load()?;
        persisted.shared_secret = Some(secret.expose().to_string());
        persisted.role = Some(role);
        self.store.save(&persisted)?;
        self.spawn(secret, role, transport)
    }

    /// Start from the remembered passphrase and role, if both are set.
    pub fn resume(&self, transport: Arc<dyn Transport>) -> Result<Option<SyncHandle>> {
        let persisted = self.store.load()?;
        match (persisted.shared_secret, persisted.role) {
            (Some(raw), Some(role)) => {
                let secret = SharedSecret::new(&raw)?;
                self.spawn(secret, role, transport).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn spawn(&self, secret: SharedSecret, role: Role, transport: Arc<dyn Transport>) -> Result<SyncHandle> {
        let peer_id = secret.peer_id(role);
        tracing::info!(%role, peer = %peer_id, "starting sync session");

        let notifier = Notifier::new(SyncInfo::new(role, peer_id.clone()), self.clock.clone());
        let orchestrator = Orchestrator::new(
            secret.clone(),
            self.host.clone(),
            self.store.clone(),
            self.clock.clone(),
            notifier.clone(),
            &self.config,
        )?;
        let (commands, rx) = mpsc::unbounded_channel();
        let driver = SessionDriver::new(
            Session::new(&secret, role),
            self.config.session.clone(),
            transport,
            orchestrator,
            notifier.clone(),
            self.clock.clone(),
            rx,
        );
        let task = tokio::spawn(driver.run());

        Ok(SyncHandle {
            commands,
            notifier,
            peer_id,
            task,
        })
    }
}

/// Control surface of a running session. Dropping every handle disconnects.
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    notifier: Notifier,
    peer_id: PeerId,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn status(&self) -> SyncInfo {
        self.notifier.status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.notifier.subscribe()
    }

    /// Run one sync cycle. Resolves once our frames are on the wire; the
    /// outcome arrives as events.
    pub async fn sync_now(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::SyncNow(tx))
            .map_err(|_| SyncError::ServiceStopped)?;
        rx.await.map_err(|_| SyncError::ServiceStopped)?
    }

    pub async fn disconnect(self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(tx)).is_ok() {
            let _ = rx.await;
        }
        self.task.await.map_err(|_| SyncError::ServiceStopped)
    }
}
