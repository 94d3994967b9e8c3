use super::identity::{PeerId, Role};
use super::model::{ApplyResult, SyncStats};
use super::session::ConnectionState;
use crate::clock::Clock;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_BUFFER: usize = 64;

/// What observers (the UI, logs) are told about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
    StateChanged {
        state: ConnectionState,
        message: String,
        timestamp: i64,
    },
    Progress {
        message: String,
        timestamp: i64,
    },
    /// we applied the peer's snapshot
    SyncCompleted {
        results: ApplyResult,
        timestamp: i64,
    },
    /// the peer applied ours
    PeerCompleted {
        results: Option<ApplyResult>,
        timestamp: i64,
    },
    SyncFailed {
        message: String,
        timestamp: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncInfo {
    pub state: ConnectionState,
    pub message: String,
    pub role: Role,
    pub peer_id: PeerId,
    pub remote_peer_id: Option<PeerId>,
    pub is_connected: bool,
    pub last_heartbeat: Option<i64>,
    pub reconnect_attempts: u32,
    pub reconnect_exhausted: bool,
    pub sync_in_progress: bool,
    pub last_sync_time: Option<i64>,
    pub stats: SyncStats,
}

impl SyncInfo {
    pub fn new(role: Role, peer_id: PeerId) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            message: String::new(),
            role,
            peer_id,
            remote_peer_id: None,
            is_connected: false,
            last_heartbeat: None,
            reconnect_attempts: 0,
            reconnect_exhausted: false,
            sync_in_progress: false,
            last_sync_time: None,
            stats: SyncStats::default(),
        }
    }
}

/// Shared by the driver and the orchestrator: keeps the status record
/// current and fans events out to subscribers.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<SyncEvent>,
    status: Arc<Mutex<SyncInfo>>,
    clock: Arc<dyn Clock>,
}

impl Notifier {
    pub fn new(info: SyncInfo, clock: Arc<dyn Clock>) -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            tx,
            status: Arc::new(Mutex::new(info)),
            clock,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn status(&self) -> SyncInfo {
        self.status.lock().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut SyncInfo)) {
        f(&mut *self.status.lock());
    }

    fn emit(&self, event: SyncEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn state_changed(&self, state: ConnectionState, message: &str) {
        tracing::info!(%state, "{}", message);
        self.update(|info| {
            info.state = state;
            info.message = message.to_string();
            info.is_connected = state == ConnectionState::Connected;
        });
        self.emit(SyncEvent::StateChanged {
            state,
            message: message.to_string(),
            timestamp: self.clock.now_ms(),
        });
    }

    pub fn progress(&self, message: &str) {
        tracing::debug!("{}", message);
        self.emit(SyncEvent::Progress {
            message: message.to_string(),
            timestamp: self.clock.now_ms(),
        });
    }

    pub fn completed(&self, results: &ApplyResult) {
        tracing::info!(
            bookmarks_added = results.bookmarks_added,
            bookmarks_updated = results.bookmarks_updated,
            history_added = results.history_added,
            errors = results.errors.len(),
            "sync applied"
        );
        self.emit(SyncEvent::SyncCompleted {
            results: results.clone(),
            timestamp: self.clock.now_ms(),
        });
    }

    pub fn peer_completed(&self, results: Option<ApplyResult>) {
        self.emit(SyncEvent::PeerCompleted {
            results,
            timestamp: self.clock.now_ms(),
        });
    }

    pub fn failed(&self, message: &str) {
        tracing::warn!("{}", message);
        self.emit(SyncEvent::SyncFailed {
            message: message.to_string(),
            timestamp: self.clock.now_ms(),
        });
    }
}
