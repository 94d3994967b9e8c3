//! Peer-to-peer bookmark and history sync between two browser profiles that
//! share a passphrase.
//!
//! [`sync::SyncService`] is the entry point. The browser side plugs in
//! through [`sync::host::HostStore`], the network side through
//! [`sync::transport::Transport`], and settings live behind
//! [`config::ConfigStore`].

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod sync;

pub use error::{Result, SyncError};
pub use sync::events::{SyncEvent, SyncInfo};
pub use sync::identity::{PeerId, Role};
pub use sync::{SyncHandle, SyncService};
