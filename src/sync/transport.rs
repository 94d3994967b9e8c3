//! Data channel seam. A transport registers an id with a signaling relay,
//! opens or accepts a single channel to a remote id, and moves text frames.
//! Everything the remote side or the relay does arrives as a
//! [`TransportEvent`] on the sink handed to [`Transport::open`].

use super::identity::PeerId;
use crate::error::{FaultKind, TransportFault};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// our id is registered; remote peers can reach us
    SignalingReady,
    SignalingFault(TransportFault),
    IncomingConnection { remote: PeerId },
    ChannelOpen,
    ChannelMessage(String),
    ChannelClosed,
    ChannelFault(TransportFault),
}

pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, self_id: &PeerId, events: EventSink) -> Result<(), TransportFault>;
    async fn connect(&self, remote: &PeerId) -> Result<(), TransportFault>;
    async fn accept(&self, remote: &PeerId) -> Result<(), TransportFault>;
    async fn reject(&self, remote: &PeerId);
    async fn send(&self, text: String) -> Result<(), TransportFault>;
    /// Drop the current channel. The remote end sees `ChannelClosed`.
    async fn close_channel(&self);
    /// Leave the relay for good.
    async fn destroy(&self);
}

// ── in-process relay ──

struct Endpoint {
    sink: EventSink,
    partner: Option<PeerId>,
    muted: bool,
}

#[derive(Default)]
struct RelayState {
    endpoints: HashMap<PeerId, Endpoint>,
    // dialer -> target, waiting for accept/reject
    pending: HashMap<PeerId, PeerId>,
}

impl RelayState {
    fn emit(&self, id: &PeerId, event: TransportEvent) {
        if let Some(ep) = self.endpoints.get(id) {
            let _ = ep.sink.send(event);
        }
    }

    fn unlink(&mut self, id: &PeerId) -> Option<PeerId> {
        let partner = self.endpoints.get_mut(id).and_then(|ep| ep.partner.take())?;
        if let Some(ep) = self.endpoints.get_mut(&partner) {
            if ep.partner.as_ref() == Some(id) {
                ep.partner = None;
            }
        }
        Some(partner)
    }
}

/// Loopback signaling relay: every [`MemoryTransport`] built from the same
/// relay can reach the others by id.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            relay: self.clone(),
            me: Mutex::new(None),
        }
    }

    pub fn is_registered(&self, id: &PeerId) -> bool {
        self.state.lock().endpoints.contains_key(id)
    }

    pub fn partner_of(&self, id: &PeerId) -> Option<PeerId> {
        self.state.lock().endpoints.get(id).and_then(|ep| ep.partner.clone())
    }

    /// Silently drop every frame to or from `id`, like a dead link that
    /// nobody has noticed yet.
    pub fn set_muted(&self, id: &PeerId, muted: bool) {
        if let Some(ep) = self.state.lock().endpoints.get_mut(id) {
            ep.muted = muted;
        }
    }

    /// Cut `id`'s channel; both ends see `ChannelClosed`.
    pub fn sever(&self, id: &PeerId) {
        let mut st = self.state.lock();
        if let Some(partner) = st.unlink(id) {
            st.emit(id, TransportEvent::ChannelClosed);
            st.emit(&partner, TransportEvent::ChannelClosed);
        }
    }

    /// Raise a signaling fault on `id`.
    pub fn fault(&self, id: &PeerId, fault: TransportFault) {
        self.state.lock().emit(id, TransportEvent::SignalingFault(fault));
    }
}

pub struct MemoryTransport {
    relay: MemoryRelay,
    me: Mutex<Option<PeerId>>,
}

impl MemoryTransport {
    fn me(&self) -> Result<PeerId, TransportFault> {
        self.me
            .lock()
            .clone()
            .ok_or_else(|| TransportFault::new(FaultKind::SignalingLost, "not registered"))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, self_id: &PeerId, events: EventSink) -> Result<(), TransportFault> {
        let mut st = self.relay.state.lock();
        if st.endpoints.contains_key(self_id) {
            return Err(TransportFault::new(
                FaultKind::UnavailableId,
                format!("id {} is taken", self_id),
            ));
        }
        let _ = events.send(TransportEvent::SignalingReady);
        st.endpoints.insert(
            self_id.clone(),
            Endpoint {
                sink: events,
                partner: None,
                muted: false,
            },
        );
        *self.me.lock() = Some(self_id.clone());
        Ok(())
    }

    async fn connect(&self, remote: &PeerId) -> Result<(), TransportFault> {
        let me = self.me()?;
        let mut st = self.relay.state.lock();
        if !st.endpoints.contains_key(remote) {
            return Err(TransportFault::new(
                FaultKind::PeerUnavailable,
                format!("could not connect to peer {}", remote),
            ));
        }
        st.pending.insert(me.clone(), remote.clone());
        st.emit(remote, TransportEvent::IncomingConnection { remote: me });
        Ok(())
    }

    async fn accept(&self, remote: &PeerId) -> Result<(), TransportFault> {
        let me = self.me()?;
        let mut st = self.relay.state.lock();
        if st.pending.get(remote) != Some(&me) {
            return Err(TransportFault::new(FaultKind::ChannelClosed, "dialer went away"));
        }
        st.pending.remove(remote);
        if let Some(ep) = st.endpoints.get_mut(&me) {
            ep.partner = Some(remote.clone());
        }
        if let Some(ep) = st.endpoints.get_mut(remote) {
            ep.partner = Some(me.clone());
        }
        st.emit(&me, TransportEvent::ChannelOpen);
        st.emit(remote, TransportEvent::ChannelOpen);
        Ok(())
    }

    async fn reject(&self, remote: &PeerId) {
        let Ok(me) = self.me() else { return };
        let mut st = self.relay.state.lock();
        if st.pending.get(remote) == Some(&me) {
            st.pending.remove(remote);
            st.emit(remote, TransportEvent::ChannelClosed);
        }
    }

    async fn send(&self, text: String) -> Result<(), TransportFault> {
        let me = self.me()?;
        let st = self.relay.state.lock();
        let ep = st
            .endpoints
            .get(&me)
            .ok_or_else(|| TransportFault::new(FaultKind::SignalingLost, "not registered"))?;
        let partner = ep
            .partner
            .clone()
            .ok_or_else(|| TransportFault::new(FaultKind::ChannelClosed, "no open channel"))?;
        let remote_muted = st.endpoints.get(&partner).map(|p| p.muted).unwrap_or(true);
        if !ep.muted && !remote_muted {
            st.emit(&partner, TransportEvent::ChannelMessage(text));
        }
        Ok(())
    }

    async fn close_channel(&self) {
        let Ok(me) = self.me() else { return };
        let mut st = self.relay.state.lock();
        st.pending.remove(&me);
        if let Some(partner) = st.unlink(&me) {
            st.emit(&partner, TransportEvent::ChannelClosed);
        }
    }

    async fn destroy(&self) {
        let Some(me) = self.me.lock().take() else { return };
        let mut st = self.relay.state.lock();
        st.pending.remove(&me);
        if let Some(partner) = st.unlink(&me) {
            st.emit(&partner, TransportEvent::ChannelClosed);
        }
        st.endpoints.remove(&me);
    }
}
