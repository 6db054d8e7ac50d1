//! Core primitives shared by the `capsync` server and its client harness.
//!
//! Both ends of the protocol depend on this crate so the single-character
//! toggle frames and the status frames have exactly one definition.

pub mod protocol;

pub use protocol::{ProtocolError, StatusMessage, ToggleRequest, COUNT_PREFIX};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity assigned to a connection when its handshake completes.
///
/// Generated rather than derived from the peer address so that two sockets
/// from the same host (or behind the same proxy) never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        ConnectionId(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ConnectionId {
    fn from(value: Uuid) -> Self {
        ConnectionId(value)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The part a connection plays for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Reads the flag and may toggle it (`/ws`).
    Participant,
    /// Read-only watcher of the flag and the participant count (`/status`).
    Observer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Participant => "participant",
            Role::Observer => "observer",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn connection_ids_are_unique() {
        let first = ConnectionId::new();
        let second = ConnectionId::new();
        assert_ne!(first, second);
        assert_eq!(first.to_string().len(), 36);
    }

    #[test_timeout::timeout]
    fn role_labels() {
        assert_eq!(Role::Participant.to_string(), "participant");
        assert_eq!(Role::Observer.as_str(), "observer");
    }
}
