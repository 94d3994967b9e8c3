use std::fmt;
use thiserror::Error;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("invalid shared secret: {0}")]
    Identity(String),

    /// Same error for a wrong passphrase and a tampered payload.
    #[error("failed to decrypt data - wrong passphrase or corrupted data")]
    Decryption,

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("connection error: {0}")]
    Connection(TransportFault),

    #[error("sync already in progress")]
    SyncAlreadyInProgress,

    #[error("not connected to peer")]
    NotConnected,

    #[error("host storage: {0}")]
    Host(#[from] HostError),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("config: {0}")]
    Config(String),

    #[error("sync service stopped")]
    ServiceStopped,
}

impl SyncError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            SyncError::Connection(fault) => fault.is_recoverable(),
            _ => false,
        }
    }
}

impl From<TransportFault> for SyncError {
    fn from(fault: TransportFault) -> Self {
        SyncError::Connection(fault)
    }
}

/// Failure reported by the browser-side bookmark/history store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("host unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// remote id not registered with the signaling relay (yet)
    PeerUnavailable,
    Network,
    ServerError,
    SignalingLost,
    /// our own id is already taken on the relay
    UnavailableId,
    ChannelClosed,
    Other,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::PeerUnavailable => "peer-unavailable",
            FaultKind::Network => "network",
            FaultKind::ServerError => "server-error",
            FaultKind::SignalingLost => "signaling-lost",
            FaultKind::UnavailableId => "unavailable-id",
            FaultKind::ChannelClosed => "channel-closed",
            FaultKind::Other => "other",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transport-level failure as raised by the signaling relay or data channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TransportFault {
    pub kind: FaultKind,
    pub message: String,
}

impl TransportFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind,
            FaultKind::PeerUnavailable
                | FaultKind::Network
                | FaultKind::ServerError
                | FaultKind::SignalingLost
                | FaultKind::ChannelClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_classification() {
        assert!(TransportFault::new(FaultKind::PeerUnavailable, "x").is_recoverable());
        assert!(TransportFault::new(FaultKind::Network, "x").is_recoverable());
        assert!(TransportFault::new(FaultKind::ServerError, "x").is_recoverable());
        assert!(!TransportFault::new(FaultKind::UnavailableId, "x").is_recoverable());
        assert!(!TransportFault::new(FaultKind::Other, "x").is_recoverable());
    }

    #[test]
    fn connection_error_inherits_recoverability() {
        let err: SyncError = TransportFault::new(FaultKind::Network, "reset").into();
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "connection error: network: reset");
        assert!(!SyncError::Decryption.is_recoverable());
    }
}
