//! The single task that owns a [`Session`] and an [`Orchestrator`].
//!
//! Inputs are transport events, timer firings and handle commands. Each is
//! turned into a session [`Event`], run through [`transition`], and the
//! resulting effects are carried out here, which may queue more events.

use super::events::Notifier;
use super::orchestrator::Orchestrator;
use super::protocol::{self, WireMessage};
use super::session::{transition, Effect, Event, Session};
use super::transport::{Transport, TransportEvent};
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::error::{Result, SyncError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub(crate) enum Command {
    SyncNow(oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    Signaling,
    Connect { attempt: u64 },
    Reconnect,
    Heartbeat,
}

#[derive(Default)]
struct Timers {
    signaling: Option<JoinHandle<()>>,
    connect: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

fn cancel(slot: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = slot.take() {
        handle.abort();
    }
}

impl Timers {
    fn cancel_all(&mut self) {
        cancel(&mut self.signaling);
        cancel(&mut self.connect);
        cancel(&mut self.reconnect);
        cancel(&mut self.heartbeat);
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

pub(crate) struct SessionDriver {
    session: Session,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    orchestrator: Orchestrator,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    timers: Timers,
    timer_tx: mpsc::UnboundedSender<Timer>,
    timer_rx: mpsc::UnboundedReceiver<Timer>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl SessionDriver {
    pub(crate) fn new(
        session: Session,
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        orchestrator: Orchestrator,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        Self {
            session,
            config,
            transport,
            orchestrator,
            notifier,
            clock,
            timers: Timers::default(),
            timer_tx,
            timer_rx,
            transport_tx,
            transport_rx,
            commands,
        }
    }

    pub(crate) async fn run(mut self) {
        self.dispatch(Event::Start).await;

        loop {
            tokio::select! {
                // drain peer traffic before timers so a queued ping is seen
                // before the tick that would declare the link dead
                biased;

                Some(ev) = self.transport_rx.recv() => self.on_transport(ev).await,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::SyncNow(reply)) => {
                        let result = self.sync_now().await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Disconnect(reply)) => {
                        self.dispatch(Event::Disconnect).await;
                        let _ = reply.send(());
                        break;
                    }
                    // every handle is gone
                    None => {
                        self.dispatch(Event::Disconnect).await;
                        break;
                    }
                },
                Some(timer) = self.timer_rx.recv() => self.on_timer(timer).await,
            }
        }
        tracing::debug!(peer = %self.session.peer_id(), "session driver stopped");
    }

    async fn sync_now(&mut self) -> Result<()> {
        let frames = self.orchestrator.initiate_sync(self.session.state()).await?;
        for frame in frames {
            if let Err(e) = self.send(&frame).await {
                self.orchestrator.abandon();
                return Err(e);
            }
        }
        Ok(())
    }

    async fn on_transport(&mut self, ev: TransportEvent) {
        let now = self.clock.now_ms();
        let event = match ev {
            TransportEvent::SignalingReady => Event::SignalingReady,
            TransportEvent::SignalingFault(fault) => Event::SignalingFault(fault),
            TransportEvent::IncomingConnection { remote } => Event::IncomingConnection { remote },
            TransportEvent::ChannelOpen => Event::ChannelOpen { now },
            TransportEvent::ChannelClosed => Event::ChannelClosed,
            TransportEvent::ChannelFault(fault) => Event::ChannelFault(fault),
            TransportEvent::ChannelMessage(text) => {
                self.on_frame(&text, now).await;
                return;
            }
        };
        self.dispatch(event).await;
    }

    async fn on_frame(&mut self, text: &str, now: i64) {
        if !self.session.is_connected() {
            tracing::debug!("dropping frame received while not connected");
            return;
        }
        let msg = match protocol::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("bad frame from peer: {}", e);
                return;
            }
        };
        match msg {
            WireMessage::Heartbeat { .. } => self.dispatch(Event::HeartbeatReceived { now }).await,
            WireMessage::HeartbeatAck { .. } => self.dispatch(Event::HeartbeatAckReceived { now }).await,
            other => {
                let replies = self.orchestrator.handle_message(other).await;
                for reply in replies {
                    if let Err(e) = self.send(&reply).await {
                        tracing::warn!("reply to peer failed: {}", e);
                        break;
                    }
                }
            }
        }
    }

    async fn on_timer(&mut self, timer: Timer) {
        let now = self.clock.now_ms();
        let event = match timer {
            Timer::Signaling => Event::SignalingTimeout,
            Timer::Connect { attempt } => Event::ConnectTimeout { attempt },
            Timer::Reconnect => Event::ReconnectDue,
            Timer::Heartbeat => Event::HeartbeatTick { now },
        };
        self.dispatch(event).await;
    }

    async fn dispatch(&mut self, first: Event) {
        let mut queue = VecDeque::from([first]);
        while let Some(event) = queue.pop_front() {
            let session = self.session.clone();
            let (next, effects) = transition(session, event, &self.config);
            self.session = next;
            self.sync_status();
            for effect in effects {
                if let Some(follow_up) = self.execute(effect).await {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    fn sync_status(&self) {
        let s = &self.session;
        let remote = s.remote_peer_id().cloned();
        let (attempts, exhausted, heartbeat) = (s.reconnect_attempts(), s.reconnect_exhausted(), s.last_heartbeat_at());
        self.notifier.update(|info| {
            info.remote_peer_id = remote;
            info.reconnect_attempts = attempts;
            info.reconnect_exhausted = exhausted;
            info.last_heartbeat = heartbeat;
        });
    }

    /// Carry out one effect. A transport failure comes back as the event
    /// the session should see next.
    async fn execute(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::Notify { state, message } => {
                self.notifier.state_changed(state, &message);
            }
            Effect::OpenSignaling { self_id } => {
                if let Err(fault) = self.transport.open(&self_id, self.transport_tx.clone()).await {
                    return Some(Event::SignalingFault(fault));
                }
            }
            Effect::StartSignalingTimer => {
                let handle = self.arm(self.config.signaling_timeout(), Timer::Signaling);
                replace(&mut self.timers.signaling, handle);
            }
            Effect::CancelSignalingTimer => cancel(&mut self.timers.signaling),
            Effect::Connect { remote } => {
                if let Err(fault) = self.transport.connect(&remote).await {
                    return Some(Event::ChannelFault(fault));
                }
            }
            Effect::StartConnectTimer { attempt } => {
                let handle = self.arm(self.config.connect_timeout(), Timer::Connect { attempt });
                replace(&mut self.timers.connect, handle);
            }
            Effect::CancelConnectTimer => cancel(&mut self.timers.connect),
            Effect::Accept { remote } => {
                if let Err(fault) = self.transport.accept(&remote).await {
                    tracing::warn!(%remote, "accept failed: {}", fault);
                    return Some(Event::ChannelClosed);
                }
            }
            Effect::Reject { remote } => {
                tracing::info!(%remote, "rejecting connection");
                self.transport.reject(&remote).await;
            }
            Effect::StartHeartbeat => {
                let handle = self.arm_interval(self.config.heartbeat_interval(), Timer::Heartbeat);
                replace(&mut self.timers.heartbeat, handle);
            }
            Effect::StopHeartbeat => cancel(&mut self.timers.heartbeat),
            Effect::SendHeartbeat => {
                let ping = WireMessage::Heartbeat { timestamp: self.clock.now_ms() };
                if let Err(e) = self.send(&ping).await {
                    tracing::debug!("heartbeat send failed: {}", e);
                }
            }
            Effect::SendHeartbeatAck => {
                let ack = WireMessage::HeartbeatAck { timestamp: self.clock.now_ms() };
                if let Err(e) = self.send(&ack).await {
                    tracing::debug!("heartbeat ack send failed: {}", e);
                }
            }
            Effect::ScheduleReconnect { delay, attempt } => {
                tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                let handle = self.arm(delay, Timer::Reconnect);
                replace(&mut self.timers.reconnect, handle);
            }
            Effect::CancelReconnect => cancel(&mut self.timers.reconnect),
            Effect::CloseChannel => self.transport.close_channel().await,
            Effect::Destroy => {
                self.timers.cancel_all();
                self.transport.destroy().await;
            }
            Effect::ChannelUp => {
                let hello = self.orchestrator.on_channel_open();
                if let Err(e) = self.send(&hello).await {
                    tracing::warn!("handshake send failed: {}", e);
                }
            }
            Effect::ChannelDown => self.orchestrator.abandon(),
            Effect::ReconnectExhausted => {
                tracing::warn!("giving up on reconnecting");
            }
        }
        None
    }

    async fn send(&self, msg: &WireMessage) -> Result<()> {
        let text = protocol::encode(msg)?;
        self.transport.send(text).await.map_err(SyncError::Connection)
    }

    fn arm(&self, after: Duration, timer: Timer) -> JoinHandle<()> {
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(timer);
        })
    }

    fn arm_interval(&self, every: Duration, timer: Timer) -> JoinHandle<()> {
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                ticker.tick().await;
                if tx.send(timer).is_err() {
                    break;
                }
            }
        })
    }
}

fn replace(slot: &mut Option<JoinHandle<()>>, handle: JoinHandle<()>) {
    cancel(slot);
    *slot = Some(handle);
}
