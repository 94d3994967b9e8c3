//! One sync cycle over an established channel.
//!
//! Initiator: `sync-request` + sealed snapshot, then waits for the peer's
//! snapshot (which it applies) and the peer's `sync-complete`. Responder:
//! answers a `sync-request` with its own snapshot and any snapshot with a
//! `sync-complete` once applied.

use super::envelope;
use super::events::Notifier;
use super::host::HostStore;
use super::identity::SharedSecret;
use super::merge::{compute_delta, MergeEngine};
use super::model::{ApplyResult, Snapshot};
use super::protocol::WireMessage;
use super::session::ConnectionState;
use super::snapshot::SnapshotExtractor;
use crate::clock::Clock;
use crate::config::{ConfigStore, PersistedConfig, SyncConfig};
use crate::error::{Result, SyncError};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct InFlight {
    started_at: i64,
    awaiting_peer_snapshot: bool,
    awaiting_peer_complete: bool,
}

pub struct Orchestrator {
    secret: SharedSecret,
    extractor: SnapshotExtractor,
    engine: MergeEngine,
    store: Arc<dyn ConfigStore>,
    persisted: PersistedConfig,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
    in_flight: Option<InFlight>,
}

impl Orchestrator {
    pub fn new(
        secret: SharedSecret,
        host: Arc<dyn HostStore>,
        store: Arc<dyn ConfigStore>,
        clock: Arc<dyn Clock>,
        notifier: Notifier,
        config: &SyncConfig,
    ) -> Result<Self> {
        let persisted = store.load()?;
        notifier.update(|info| {
            info.stats = persisted.stats.clone();
            info.last_sync_time = persisted.last_sync_time;
        });
        Ok(Self {
            secret,
            extractor: SnapshotExtractor::new(host.clone(), clock.clone(), config),
            engine: MergeEngine::new(host),
            store,
            persisted,
            clock,
            notifier,
            in_flight: None,
        })
    }

    pub fn sync_in_progress(&self) -> bool {
        self.in_flight.is_some()
    }

    /// First frame on a fresh channel.
    pub fn on_channel_open(&self) -> WireMessage {
        WireMessage::handshake(self.clock.now_ms())
    }

    /// The channel is gone; whatever was in flight will never finish.
    pub fn abandon(&mut self) {
        if self.in_flight.take().is_some() {
            self.set_in_progress(false);
            self.notifier.failed("Sync abandoned: connection lost");
        }
    }

    /// Start a cycle. Returns the frames to send, in order.
    pub async fn initiate_sync(&mut self, state: ConnectionState) -> Result<Vec<WireMessage>> {
        if state != ConnectionState::Connected {
            return Err(SyncError::NotConnected);
        }
        if self.in_flight.is_some() {
            return Err(SyncError::SyncAlreadyInProgress);
        }

        let now = self.clock.now_ms();
        self.in_flight = Some(InFlight {
            started_at: now,
            awaiting_peer_snapshot: true,
            awaiting_peer_complete: true,
        });
        self.set_in_progress(true);
        self.notifier.progress("Creating snapshot...");

        match self.sealed_snapshot().await {
            Ok(data) => {
                self.notifier.progress("Sending snapshot to peer...");
                Ok(vec![
                    WireMessage::SyncRequest { timestamp: now },
                    WireMessage::Snapshot {
                        data,
                        timestamp: self.clock.now_ms(),
                    },
                ])
            }
            Err(e) => {
                self.fail_cycle(&format!("Sync failed: {}", e));
                Err(e)
            }
        }
    }

    /// Handle one application frame; returns the replies.
    pub async fn handle_message(&mut self, msg: WireMessage) -> Vec<WireMessage> {
        match msg {
            WireMessage::Handshake { version, .. } => {
                tracing::debug!(%version, "peer handshake");
                vec![WireMessage::HandshakeAck {
                    timestamp: self.clock.now_ms(),
                }]
            }
            WireMessage::HandshakeAck { .. } => Vec::new(),
            WireMessage::SyncRequest { .. } => self.answer_sync_request().await,
            WireMessage::Snapshot { data, .. } | WireMessage::SyncResponse { data, .. } => {
                self.apply_remote(data).await
            }
            WireMessage::SyncComplete { results, .. } => {
                self.notifier.peer_completed(results);
                if let Some(flight) = self.in_flight.as_mut() {
                    flight.awaiting_peer_complete = false;
                }
                self.maybe_finish();
                Vec::new()
            }
            WireMessage::Error { message, .. } => {
                let text = format!("Peer reported error: {}", message);
                if self.in_flight.is_some() {
                    self.fail_cycle(&text);
                } else {
                    // nothing of ours to fail; the peer's own cycle went wrong
                    tracing::warn!("{}", text);
                    self.notifier.progress(&text);
                }
                Vec::new()
            }
            // liveness is the driver's business
            WireMessage::Heartbeat { .. } | WireMessage::HeartbeatAck { .. } => Vec::new(),
            WireMessage::Unknown { kind } => {
                tracing::warn!(%kind, "ignoring unknown message type");
                Vec::new()
            }
        }
    }

    async fn sealed_snapshot(&self) -> Result<String> {
        let snapshot = self.extractor.extract().await?;
        envelope::seal_async(&snapshot, self.secret.expose()).await
    }

    async fn answer_sync_request(&mut self) -> Vec<WireMessage> {
        self.notifier.progress("Peer requested sync, creating snapshot...");
        match self.sealed_snapshot().await {
            Ok(data) => vec![WireMessage::Snapshot {
                data,
                timestamp: self.clock.now_ms(),
            }],
            Err(e) => {
                self.notifier.failed(&format!("Could not answer sync request: {}", e));
                vec![self.error_frame(&e)]
            }
        }
    }

    async fn apply_remote(&mut self, data: String) -> Vec<WireMessage> {
        let started = self.clock.now_ms();
        self.notifier.progress("Applying sync...");

        let results = match self.merge_remote(data).await {
            Ok(results) => results,
            Err(e) => {
                self.fail_cycle(&format!("Sync failed: {}", e));
                return vec![self.error_frame(&e)];
            }
        };

        let finished = self.clock.now_ms();
        self.persisted.stats.record(&results, finished - started);
        self.persisted.last_sync_time = Some(finished);
        self.persist();
        self.notifier.completed(&results);

        if let Some(flight) = self.in_flight.as_mut() {
            flight.awaiting_peer_snapshot = false;
        }
        self.maybe_finish();

        vec![WireMessage::SyncComplete {
            results: Some(results),
            timestamp: finished,
        }]
    }

    async fn merge_remote(&self, data: String) -> Result<ApplyResult> {
        let remote: Snapshot = envelope::open_async(data, self.secret.expose()).await?;
        let local = self.extractor.extract().await?;
        let delta = compute_delta(&local, &remote);
        tracing::debug!(
            add = delta.bookmarks_to_add.len(),
            update = delta.bookmarks_to_update.len(),
            history = delta.history_to_add.len(),
            "delta computed"
        );
        Ok(self.engine.apply_delta(&delta).await)
    }

    fn maybe_finish(&mut self) {
        let Some(flight) = self.in_flight else { return };
        if flight.awaiting_peer_snapshot || flight.awaiting_peer_complete {
            return;
        }
        self.in_flight = None;
        self.persisted.stats.last_sync_duration = self.clock.now_ms() - flight.started_at;
        self.persist();
        self.set_in_progress(false);
        self.notifier.progress("Sync completed successfully");
    }

    fn fail_cycle(&mut self, message: &str) {
        self.in_flight = None;
        self.set_in_progress(false);
        self.notifier.failed(message);
    }

    fn error_frame(&self, err: &SyncError) -> WireMessage {
        WireMessage::Error {
            message: err.to_string(),
            timestamp: self.clock.now_ms(),
        }
    }

    fn set_in_progress(&self, in_progress: bool) {
        self.notifier.update(|info| info.sync_in_progress = in_progress);
    }

    fn persist(&self) {
        let stats = self.persisted.stats.clone();
        let last = self.persisted.last_sync_time;
        self.notifier.update(|info| {
            info.stats = stats;
            info.last_sync_time = last;
        });
        // stats are best effort; a failed write must not fail the sync
        if let Err(e) = self.store.save(&self.persisted) {
            tracing::warn!("could not persist sync stats: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::MemoryConfigStore;
    use crate::sync::events::{SyncEvent, SyncInfo};
    use crate::sync::host::MemoryHost;
    use crate::sync::identity::Role;
    use tokio::sync::broadcast;

    const SECRET: &str = "correct horse battery";

    struct Side {
        orch: Orchestrator,
        host: Arc<MemoryHost>,
        store: Arc<MemoryConfigStore>,
        events: broadcast::Receiver<SyncEvent>,
    }

    fn side(role: Role, secret: &str, clock: &ManualClock) -> Side {
        let secret = SharedSecret::new(secret).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let host = Arc::new(MemoryHost::new(clock.clone()));
        let store = Arc::new(MemoryConfigStore::default());
        let notifier = Notifier::new(SyncInfo::new(role, secret.peer_id(role)), clock.clone());
        let events = notifier.subscribe();
        let orch = Orchestrator::new(secret, host.clone(), store.clone(), clock, notifier, &SyncConfig::default())
            .unwrap();
        Side { orch, host, store, events }
    }

    /// Deliver frames back and forth until both sides go quiet.
    async fn pump(a: &mut Orchestrator, b: &mut Orchestrator, mut to_b: Vec<WireMessage>) {
        let mut to_a = Vec::new();
        while !to_a.is_empty() || !to_b.is_empty() {
            for msg in std::mem::take(&mut to_b) {
                to_a.extend(b.handle_message(msg).await);
            }
            for msg in std::mem::take(&mut to_a) {
                to_b.extend(a.handle_message(msg).await);
            }
        }
    }

    fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn completed(events: &[SyncEvent]) -> Vec<ApplyResult> {
        events
            .iter()
            .filter_map(|e| match e {
                SyncEvent::SyncCompleted { results, .. } => Some(results.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn full_cycle_moves_a_bookmark() {
        let clock = ManualClock::new(10_000);
        let mut primary = side(Role::Primary, SECRET, &clock);
        let mut secondary = side(Role::Secondary, SECRET, &clock);
        primary.host.insert(MemoryHost::BAR_ID, "A", Some("https://a.com"), 1000);

        let frames = secondary.orch.initiate_sync(ConnectionState::Connected).await.unwrap();
        assert_eq!(frames[0].kind(), "sync-request");
        assert_eq!(frames[1].kind(), "snapshot");
        assert!(secondary.orch.sync_in_progress());

        pump(&mut secondary.orch, &mut primary.orch, frames).await;
        assert!(!secondary.orch.sync_in_progress());

        let got = completed(&drain(&mut secondary.events));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].bookmarks_added, 1);
        assert_eq!(got[0].bookmarks_updated, 0);
        assert_eq!(got[0].history_added, 0);
        assert!(got[0].errors.is_empty());

        let found = secondary.host.search_bookmarks_by_url("https://a.com").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].title.as_deref(), Some("A"));

        // primary applied secondary's snapshot too, which had nothing new
        let got = completed(&drain(&mut primary.events));
        assert_eq!(got, [ApplyResult::default()]);

        let saved = secondary.store.snapshot();
        assert_eq!(saved.stats.sync_count, 1);
        assert_eq!(saved.stats.total_bookmarks_synced, 1);
        assert_eq!(saved.last_sync_time, Some(10_000));
        assert_eq!(primary.store.snapshot().stats.sync_count, 1);
    }

    #[tokio::test]
    async fn titles_survive_repeated_cycles_unchanged() {
        let clock = ManualClock::new(10_000);
        let mut a = side(Role::Primary, SECRET, &clock);
        let mut b = side(Role::Secondary, SECRET, &clock);
        let title = "C++ <3 & a<b";
        a.host.insert(MemoryHost::BAR_ID, title, Some("https://a.com"), 1000);

        for _ in 0..2 {
            let frames = b.orch.initiate_sync(ConnectionState::Connected).await.unwrap();
            pump(&mut b.orch, &mut a.orch, frames).await;
            clock.advance(60_000);
        }

        let on_b = b.host.search_bookmarks_by_url("https://a.com").await.unwrap();
        assert_eq!(on_b[0].title.as_deref(), Some(title));
        let on_a = a.host.search_bookmarks_by_url("https://a.com").await.unwrap();
        assert_eq!(on_a.len(), 1);
        assert_eq!(on_a[0].title.as_deref(), Some(title));

        // second round moved nothing in either direction
        let a_results = completed(&drain(&mut a.events));
        assert_eq!(a_results.len(), 2);
        assert_eq!(a_results[1], ApplyResult::default());
        let b_results = completed(&drain(&mut b.events));
        assert_eq!(b_results[0].bookmarks_added, 1);
        assert_eq!(b_results[1], ApplyResult::default());
    }

    #[tokio::test]
    async fn history_converges_to_larger_counts() {
        let clock = ManualClock::new(10_000);
        let mut a = side(Role::Primary, SECRET, &clock);
        let mut b = side(Role::Secondary, SECRET, &clock);
        a.host.insert_history("https://b.com", "B", 3, 500);
        b.host.insert_history("https://b.com", "B", 5, 900);

        let frames = a.orch.initiate_sync(ConnectionState::Connected).await.unwrap();
        pump(&mut a.orch, &mut b.orch, frames).await;

        let item = a.host.history_item("https://b.com").unwrap();
        assert_eq!(item.last_visit_time, Some(900));
        // b's side was newer, so b had nothing to take
        assert_eq!(b.host.history_item("https://b.com").unwrap().visit_count, Some(5));
        assert_eq!(completed(&drain(&mut b.events))[0].history_added, 0);
        assert_eq!(completed(&drain(&mut a.events))[0].history_added, 1);
    }

    #[tokio::test]
    async fn single_flight() {
        let clock = ManualClock::new(1);
        let mut a = side(Role::Primary, SECRET, &clock);
        let mut b = side(Role::Secondary, SECRET, &clock);

        let first = a.orch.initiate_sync(ConnectionState::Connected).await.unwrap();
        let second = a.orch.initiate_sync(ConnectionState::Connected).await;
        assert_eq!(second.unwrap_err(), SyncError::SyncAlreadyInProgress);

        pump(&mut a.orch, &mut b.orch, first).await;
        assert!(!a.orch.sync_in_progress());
        assert!(a.orch.initiate_sync(ConnectionState::Connected).await.is_ok());
    }

    #[tokio::test]
    async fn needs_a_connection() {
        let clock = ManualClock::new(1);
        let mut a = side(Role::Primary, SECRET, &clock);
        for state in [ConnectionState::Waiting, ConnectionState::Disconnected, ConnectionState::Connecting] {
            assert_eq!(a.orch.initiate_sync(state).await.unwrap_err(), SyncError::NotConnected);
        }
        assert!(!a.orch.sync_in_progress());
    }

    #[tokio::test]
    async fn failed_extract_clears_the_flag() {
        let clock = ManualClock::new(1);
        let mut a = side(Role::Primary, SECRET, &clock);
        a.host.set_tree_unavailable(true);
        assert!(matches!(
            a.orch.initiate_sync(ConnectionState::Connected).await,
            Err(SyncError::Host(_))
        ));
        assert!(!a.orch.sync_in_progress());

        a.host.set_tree_unavailable(false);
        assert!(a.orch.initiate_sync(ConnectionState::Connected).await.is_ok());
    }

    #[tokio::test]
    async fn mismatched_secret_fails_the_cycle() {
        let clock = ManualClock::new(1);
        let mut a = side(Role::Primary, SECRET, &clock);
        let mut b = side(Role::Secondary, "a different passphrase", &clock);
        b.host.insert(MemoryHost::BAR_ID, "A", Some("https://a.com"), 1000);

        let frames = a.orch.initiate_sync(ConnectionState::Connected).await.unwrap();
        pump(&mut a.orch, &mut b.orch, frames).await;

        assert!(!a.orch.sync_in_progress());
        assert!(a.host.search_bookmarks_by_url("https://a.com").await.unwrap().is_empty());
        let events = drain(&mut a.events);
        assert!(events.iter().any(|e| matches!(e, SyncEvent::SyncFailed { message, .. } if message.contains("decrypt"))));
        assert!(completed(&events).is_empty());
        assert_eq!(a.store.save_count(), 0);
    }

    #[tokio::test]
    async fn handshake_and_unknown_frames() {
        let clock = ManualClock::new(77);
        let mut a = side(Role::Primary, SECRET, &clock);
        let hello = a.orch.on_channel_open();
        let replies = a.orch.handle_message(hello).await;
        assert_eq!(replies, [WireMessage::HandshakeAck { timestamp: 77 }]);
        assert!(a.orch.handle_message(WireMessage::Unknown { kind: "x".into() }).await.is_empty());
        assert!(a.orch.handle_message(WireMessage::HandshakeAck { timestamp: 1 }).await.is_empty());
    }

    #[tokio::test]
    async fn peer_error_only_fails_a_cycle_in_flight() {
        let clock = ManualClock::new(5);
        let mut a = side(Role::Primary, SECRET, &clock);
        let oops = || WireMessage::Error { message: "could not read bookmarks".into(), timestamp: 1 };

        assert!(a.orch.handle_message(oops()).await.is_empty());
        let events = drain(&mut a.events);
        assert!(!events.iter().any(|e| matches!(e, SyncEvent::SyncFailed { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::Progress { message, .. } if message.contains("could not read bookmarks"))));

        a.orch.initiate_sync(ConnectionState::Connected).await.unwrap();
        drain(&mut a.events);
        a.orch.handle_message(oops()).await;
        assert!(!a.orch.sync_in_progress());
        assert!(drain(&mut a.events)
            .iter()
            .any(|e| matches!(e, SyncEvent::SyncFailed { message, .. } if message.contains("could not read bookmarks"))));
    }

    #[tokio::test]
    async fn abandon_releases_the_flag() {
        let clock = ManualClock::new(1);
        let mut a = side(Role::Primary, SECRET, &clock);
        a.orch.initiate_sync(ConnectionState::Connected).await.unwrap();
        a.orch.abandon();
        assert!(!a.orch.sync_in_progress());
        assert!(drain(&mut a.events)
            .iter()
            .any(|e| matches!(e, SyncEvent::SyncFailed { .. })));
        assert!(a.orch.initiate_sync(ConnectionState::Connected).await.is_ok());
    }
}
