//! Connection lifecycle as a pure state machine.
//!
//! [`transition`] takes the current [`Session`] and one [`Event`] and returns
//! the next session plus the [`Effect`]s the driver must carry out. No I/O,
//! no timers, no clock: time arrives inside events.

use super::identity::{PeerId, Role, SharedSecret};
use crate::config::SessionConfig;
use crate::error::TransportFault;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Waiting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Waiting => "waiting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    role: Role,
    peer_id_self: PeerId,
    /// the counterpart id, known up front for either role
    primary_id: PeerId,
    peer_id_remote: Option<PeerId>,
    state: ConnectionState,
    signaling_ready: bool,
    reconnect_attempts: u32,
    reconnect_pending: bool,
    exhausted: bool,
    last_heartbeat_at: Option<i64>,
    connect_attempt: u64,
    closed: bool,
}

impl Session {
    pub fn new(secret: &SharedSecret, role: Role) -> Self {
        Self {
            role,
            peer_id_self: secret.peer_id(role),
            primary_id: secret.peer_id(Role::Primary),
            peer_id_remote: None,
            state: ConnectionState::Disconnected,
            signaling_ready: false,
            reconnect_attempts: 0,
            reconnect_pending: false,
            exhausted: false,
            last_heartbeat_at: None,
            connect_attempt: 0,
            closed: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id_self
    }

    pub fn remote_peer_id(&self) -> Option<&PeerId> {
        self.peer_id_remote.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn reconnect_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn last_heartbeat_at(&self) -> Option<i64> {
        self.last_heartbeat_at
    }

    /// Destroyed, either by request or by a fatal fault. Terminal.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start,
    SignalingReady,
    SignalingTimeout,
    SignalingFault(TransportFault),
    IncomingConnection { remote: PeerId },
    ChannelOpen { now: i64 },
    ChannelClosed,
    ChannelFault(TransportFault),
    /// `attempt` ties the timer to the dial that armed it
    ConnectTimeout { attempt: u64 },
    ReconnectDue,
    HeartbeatTick { now: i64 },
    HeartbeatReceived { now: i64 },
    HeartbeatAckReceived { now: i64 },
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Notify { state: ConnectionState, message: String },
    OpenSignaling { self_id: PeerId },
    StartSignalingTimer,
    CancelSignalingTimer,
    Connect { remote: PeerId },
    StartConnectTimer { attempt: u64 },
    CancelConnectTimer,
    Accept { remote: PeerId },
    Reject { remote: PeerId },
    StartHeartbeat,
    StopHeartbeat,
    SendHeartbeat,
    SendHeartbeatAck,
    ScheduleReconnect { delay: Duration, attempt: u32 },
    CancelReconnect,
    CloseChannel,
    Destroy,
    /// channel is usable: open the application conversation
    ChannelUp,
    /// channel is gone: abandon anything in flight
    ChannelDown,
    ReconnectExhausted,
}

pub fn transition(mut s: Session, event: Event, cfg: &SessionConfig) -> (Session, Vec<Effect>) {
    let mut fx = Vec::new();
    if s.closed {
        return (s, fx);
    }

    match event {
        Event::Start => {
            if s.signaling_ready || s.state != ConnectionState::Disconnected {
                return (s, fx);
            }
            fx.push(Effect::OpenSignaling { self_id: s.peer_id_self.clone() });
            fx.push(Effect::StartSignalingTimer);
            if s.role == Role::Secondary {
                set_state(&mut s, &mut fx, ConnectionState::Connecting, "Connecting to signaling server");
            }
        }

        Event::SignalingReady => {
            if s.signaling_ready {
                return (s, fx);
            }
            s.signaling_ready = true;
            fx.push(Effect::CancelSignalingTimer);
            match s.role {
                Role::Primary => {
                    set_state(&mut s, &mut fx, ConnectionState::Waiting, "Waiting for peer to connect");
                }
                Role::Secondary => dial(&mut s, &mut fx),
            }
        }

        Event::SignalingTimeout => {
            if !s.signaling_ready {
                fail(&mut s, &mut fx, "Signaling server did not respond".into());
            }
        }

        Event::SignalingFault(fault) => {
            if !fault.is_recoverable() {
                fail(&mut s, &mut fx, fault.to_string());
            } else if s.state == ConnectionState::Connected {
                // the relay dropped but the peer channel is independent of it
            } else {
                match s.role {
                    Role::Primary => {
                        set_state(&mut s, &mut fx, ConnectionState::Waiting, &format!("Retrying: {}", fault));
                    }
                    Role::Secondary if s.state == ConnectionState::Connecting => {
                        fx.push(Effect::CancelConnectTimer);
                        connection_lost(&mut s, &mut fx, cfg, &fault.to_string());
                    }
                    Role::Secondary => {}
                }
            }
        }

        Event::IncomingConnection { remote } => {
            let can_accept = s.role == Role::Primary
                && s.state == ConnectionState::Waiting
                && s.peer_id_remote.is_none();
            if can_accept {
                s.connect_attempt += 1;
                s.peer_id_remote = Some(remote.clone());
                fx.push(Effect::Accept { remote });
                fx.push(Effect::StartConnectTimer { attempt: s.connect_attempt });
            } else {
                fx.push(Effect::Reject { remote });
            }
        }

        Event::ChannelOpen { now } => {
            let expected = match s.role {
                Role::Primary => s.state == ConnectionState::Waiting && s.peer_id_remote.is_some(),
                Role::Secondary => s.state == ConnectionState::Connecting,
            };
            if expected {
                s.reconnect_attempts = 0;
                s.exhausted = false;
                s.last_heartbeat_at = Some(now);
                fx.push(Effect::CancelConnectTimer);
                fx.push(Effect::StartHeartbeat);
                let msg = match &s.peer_id_remote {
                    Some(remote) => format!("Connected to peer {}", remote),
                    None => "Connected to peer".to_string(),
                };
                set_state(&mut s, &mut fx, ConnectionState::Connected, &msg);
                fx.push(Effect::ChannelUp);
            }
        }

        Event::ChannelClosed => match s.state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                fx.push(Effect::CancelConnectTimer);
                connection_lost(&mut s, &mut fx, cfg, "Peer connection closed");
            }
            // an accepted dial that never opened
            ConnectionState::Waiting => {
                fx.push(Effect::CancelConnectTimer);
                s.peer_id_remote = None;
            }
            _ => {}
        },

        Event::ChannelFault(fault) => {
            if !fault.is_recoverable() {
                fail(&mut s, &mut fx, fault.to_string());
            } else if matches!(s.state, ConnectionState::Connected | ConnectionState::Connecting) {
                fx.push(Effect::CancelConnectTimer);
                fx.push(Effect::CloseChannel);
                connection_lost(&mut s, &mut fx, cfg, &fault.to_string());
            }
        }

        Event::ConnectTimeout { attempt } if attempt == s.connect_attempt => match s.state {
            ConnectionState::Connecting => {
                fx.push(Effect::CloseChannel);
                connection_lost(&mut s, &mut fx, cfg, "Connection timed out");
            }
            // accepted but never opened: drop it so the next dial gets in
            ConnectionState::Waiting => {
                if let Some(remote) = s.peer_id_remote.take() {
                    fx.push(Effect::Reject { remote: remote.clone() });
                    let msg = format!("Peer {} never opened the channel; waiting for peer", remote);
                    set_state(&mut s, &mut fx, ConnectionState::Waiting, &msg);
                }
            }
            _ => {}
        },
        Event::ConnectTimeout { .. } => {}

        Event::ReconnectDue => {
            if s.reconnect_pending && s.state == ConnectionState::Disconnected {
                s.reconnect_pending = false;
                dial(&mut s, &mut fx);
            }
        }

        Event::HeartbeatTick { now } => {
            if s.state == ConnectionState::Connected {
                let last = s.last_heartbeat_at.unwrap_or(now);
                if now - last > cfg.heartbeat_timeout_ms as i64 {
                    fx.push(Effect::CloseChannel);
                    connection_lost(&mut s, &mut fx, cfg, "Heartbeat timeout, connection may be dead");
                } else {
                    fx.push(Effect::SendHeartbeat);
                }
            }
        }

        Event::HeartbeatReceived { now } => {
            if s.state == ConnectionState::Connected {
                s.last_heartbeat_at = Some(now);
                fx.push(Effect::SendHeartbeatAck);
            }
        }

        Event::HeartbeatAckReceived { now } => {
            if s.state == ConnectionState::Connected {
                s.last_heartbeat_at = Some(now);
            }
        }

        Event::Disconnect => {
            if s.state == ConnectionState::Connected {
                fx.push(Effect::ChannelDown);
            }
            fx.push(Effect::StopHeartbeat);
            fx.push(Effect::CancelSignalingTimer);
            fx.push(Effect::CancelConnectTimer);
            fx.push(Effect::CancelReconnect);
            fx.push(Effect::CloseChannel);
            fx.push(Effect::Destroy);
            s.closed = true;
            s.reconnect_pending = false;
            s.peer_id_remote = None;
            set_state(&mut s, &mut fx, ConnectionState::Disconnected, "Disconnected");
        }
    }

    (s, fx)
}

fn set_state(s: &mut Session, fx: &mut Vec<Effect>, state: ConnectionState, message: &str) {
    s.state = state;
    fx.push(Effect::Notify {
        state,
        message: message.to_string(),
    });
}

fn dial(s: &mut Session, fx: &mut Vec<Effect>) {
    s.connect_attempt += 1;
    let remote = s.primary_id.clone();
    s.peer_id_remote = Some(remote.clone());
    fx.push(Effect::Connect { remote: remote.clone() });
    fx.push(Effect::StartConnectTimer { attempt: s.connect_attempt });
    set_state(s, fx, ConnectionState::Connecting, &format!("Connecting to peer {}", remote));
}

fn fail(s: &mut Session, fx: &mut Vec<Effect>, message: String) {
    if s.state == ConnectionState::Connected {
        fx.push(Effect::ChannelDown);
    }
    fx.push(Effect::StopHeartbeat);
    fx.push(Effect::CancelSignalingTimer);
    fx.push(Effect::CancelConnectTimer);
    fx.push(Effect::CancelReconnect);
    fx.push(Effect::Destroy);
    s.closed = true;
    s.reconnect_pending = false;
    set_state(s, fx, ConnectionState::Error, &message);
}

/// Common teardown for every way a live or pending channel can go away.
/// The primary goes back to waiting; the secondary backs off and redials
/// until it runs out of attempts.
fn connection_lost(s: &mut Session, fx: &mut Vec<Effect>, cfg: &SessionConfig, reason: &str) {
    if s.state == ConnectionState::Connected {
        fx.push(Effect::StopHeartbeat);
        fx.push(Effect::ChannelDown);
    }
    s.last_heartbeat_at = None;

    match s.role {
        Role::Primary => {
            s.peer_id_remote = None;
            set_state(s, fx, ConnectionState::Disconnected, reason);
            set_state(s, fx, ConnectionState::Waiting, "Waiting for peer to reconnect");
        }
        Role::Secondary => {
            if s.reconnect_attempts >= cfg.max_reconnect_attempts {
                s.exhausted = true;
                s.reconnect_pending = false;
                let msg = format!("{}; max reconnect attempts reached", reason);
                set_state(s, fx, ConnectionState::Disconnected, &msg);
                fx.push(Effect::ReconnectExhausted);
                return;
            }
            s.reconnect_attempts += 1;
            s.reconnect_pending = true;
            let delay = cfg.backoff_delay(s.reconnect_attempts);
            fx.push(Effect::ScheduleReconnect {
                delay,
                attempt: s.reconnect_attempts,
            });
            let msg = format!(
                "{}; reconnecting in {}s (attempt {}/{})",
                reason,
                delay.as_secs(),
                s.reconnect_attempts,
                cfg.max_reconnect_attempts
            );
            set_state(s, fx, ConnectionState::Disconnected, &msg);
        }
    }
}
