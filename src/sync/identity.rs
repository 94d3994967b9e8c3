use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroizing;

const PEER_ID_PREFIX: &str = "sp-";
const PEER_ID_HEX_LEN: usize = 28;
pub const MIN_SECRET_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Registers on the relay and waits to be dialed.
    Primary,
    /// Dials the primary and owns reconnection.
    Secondary,
}

impl Role {
    fn suffix(self) -> &'static str {
        match self {
            Role::Primary => "-primary",
            Role::Secondary => "-secondary",
        }
    }

    pub fn counterpart(self) -> Role {
        match self {
            Role::Primary => Role::Secondary,
            Role::Secondary => Role::Primary,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Secondary => "secondary",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of a device on the signaling relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// `sp-` followed by the first 28 hex chars of SHA-256(secret ‖ role suffix).
/// Both devices compute both ids, so nothing but the passphrase is exchanged.
pub fn derive_peer_id(secret: &str, role: Role) -> PeerId {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(role.suffix().as_bytes());
    let hex = hex_encode(&hasher.finalize());
    PeerId(format!("{}{}", PEER_ID_PREFIX, &hex[..PEER_ID_HEX_LEN]))
}

/// The passphrase both devices were configured with. Wiped on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret(Zeroizing<String>);

impl SharedSecret {
    pub fn new(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.chars().count() < MIN_SECRET_LEN {
            return Err(SyncError::Identity(format!(
                "passphrase must be at least {} characters",
                MIN_SECRET_LEN
            )));
        }
        Ok(Self(Zeroizing::new(trimmed.to_string())))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn peer_id(&self, role: Role) -> PeerId {
        derive_peer_id(self.expose(), role)
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        assert_eq!(
            derive_peer_id("correct horse battery", Role::Primary).as_str(),
            "sp-4db3290168bf1e6046fd096efc6a"
        );
        assert_eq!(
            derive_peer_id("correct horse battery", Role::Secondary).as_str(),
            "sp-772edecec59c12094cb8e6a02e12"
        );
    }

    #[test]
    fn roles_get_distinct_stable_ids() {
        let a = derive_peer_id("hunter2hunter2", Role::Primary);
        let b = derive_peer_id("hunter2hunter2", Role::Secondary);
        assert_ne!(a, b);
        assert_eq!(a, derive_peer_id("hunter2hunter2", Role::Primary));
        assert_eq!(a.as_str().len(), 3 + PEER_ID_HEX_LEN);
        assert!(a.as_str().starts_with("sp-"));
    }

    #[test]
    fn different_secrets_differ() {
        assert_ne!(
            derive_peer_id("passphrase-one", Role::Primary),
            derive_peer_id("passphrase-two", Role::Primary)
        );
    }

    #[test]
    fn secret_is_trimmed_and_validated() {
        assert!(SharedSecret::new("short").is_err());
        assert!(SharedSecret::new("   1234567   ").is_err());
        let s = SharedSecret::new("  12345678 ").unwrap();
        assert_eq!(s.expose(), "12345678");
        assert_eq!(s.peer_id(Role::Primary), derive_peer_id("12345678", Role::Primary));
        assert_eq!(format!("{:?}", s), "SharedSecret(<redacted>)");
    }

    #[test]
    fn counterpart_flips() {
        assert_eq!(Role::Primary.counterpart(), Role::Secondary);
        assert_eq!(Role::Secondary.counterpart(), Role::Primary);
    }
}
