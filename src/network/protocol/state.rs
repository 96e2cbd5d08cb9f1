//! Connection state machine for a peer endpoint.
//!
//! ```text
//! Initializing ──► Syncing ──► Running ──► Disconnected ──► Shutdown
//! ```
//!
//! - **Initializing**: created but not yet started.
//! - **Syncing**: exchanging handshake roundtrips with the peer.
//! - **Running**: normal operation; inputs, quality reports, keep-alives.
//!   May raise interrupted/resumed notifications on inactivity.
//! - **Disconnected**: the connection is being torn down; a final grace
//!   period lets queued messages drain.
//! - **Shutdown**: terminal; all messages are dropped.

/// The lifecycle state of a [`PeerConnection`](super::PeerConnection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Created but not yet started.
    Initializing,
    /// Exchanging handshake roundtrips with the peer.
    Syncing,
    /// Normal operation, exchanging inputs.
    Running,
    /// Torn down; waiting out the shutdown grace period.
    Disconnected,
    /// Terminal state; the endpoint is inert.
    Shutdown,
}

impl ProtocolState {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::Syncing => "Syncing",
            Self::Running => "Running",
            Self::Disconnected => "Disconnected",
            Self::Shutdown => "Shutdown",
        }
    }
}

impl std::fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_distinct() {
        let states = [
            ProtocolState::Initializing,
            ProtocolState::Syncing,
            ProtocolState::Running,
            ProtocolState::Disconnected,
            ProtocolState::Shutdown,
        ];
        for (i, a) in states.iter().enumerate() {
            for (j, b) in states.iter().enumerate() {
                assert_eq!(i == j, a == b);
            }
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(ProtocolState::Syncing.to_string(), "Syncing");
        assert_eq!(ProtocolState::Shutdown.to_string(), "Shutdown");
    }
}
