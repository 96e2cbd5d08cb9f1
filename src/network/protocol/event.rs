use web_time::Duration;

use crate::frame_info::GameInput;
use crate::{Config, PlayerHandle};

/// Events a [`PeerConnection`](super::PeerConnection) hands to the session
/// that owns it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event<T>
where
    T: Config,
{
    /// First valid packet from the peer arrived.
    Connected,
    /// The handshake made progress.
    Synchronizing {
        total: u32,
        count: u32,
    },
    /// The handshake completed; the connection is running.
    Synchronized {
        ping: Duration,
    },
    /// The handshake timed out.
    SyncFailure,
    /// No packets for longer than the notify threshold.
    NetworkInterrupted {
        disconnect_timeout: Duration,
    },
    /// Packets resumed after an interruption.
    NetworkResumed,
    /// The peer timed out or requested disconnection.
    Disconnected,
    /// An authoritative remote input arrived.
    Input {
        input: GameInput<T::Input>,
        player: PlayerHandle,
    },
}
