//! Connection lifecycle states.

use std::fmt;

/// Where the connection is in its lifecycle.
///
/// `Disconnected → Connecting → Registering → Ready`, any I/O failure goes to
/// `Reconnecting → Connecting …`, and an explicit shutdown ends in
/// `Disconnected` for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Registering,
    Ready,
    Reconnecting,
}

impl ConnectionState {
    /// Only a registered connection accepts user sends.
    pub fn accepts_sends(self) -> bool {
        self == ConnectionState::Ready
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Registering => "registering",
            ConnectionState::Ready => "ready",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}
