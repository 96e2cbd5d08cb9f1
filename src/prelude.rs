//! Re-exports of the most commonly used types:
//! `use netplay::prelude::*;`

pub use crate::error::{NetplayError, TransportError};
pub use crate::frame_info::{ConfirmedInputs, GameInput};
pub use crate::network::messages::{ConnectionStatus, Message};
pub use crate::network::network_stats::NetworkStats;
pub use crate::network::udp_socket::UdpNonBlockingSocket;
pub use crate::sessions::any_session::AnySession;
pub use crate::sessions::builder::SessionBuilder;
pub use crate::sessions::config::{ConfirmedFrameMode, ProtocolConfig, SyncConfig};
pub use crate::sessions::p2p_session::P2PSession;
pub use crate::sessions::replay_session::ReplaySession;
pub use crate::sessions::spectator_session::SpectatorSession;
pub use crate::time_sync::TimeSyncConfig;
pub use crate::{
    Config, Frame, FrameSpan, InputStatus, InputVec, NetplayResult, NonBlockingSocket, PeerEvent,
    PlayerHandle, PlayerType, SessionHandler, SessionState, MAX_PLAYERS, MAX_SPECTATORS,
    NULL_FRAME,
};

#[cfg(feature = "tokio")]
pub use crate::background::BackgroundJobManager;
#[cfg(feature = "tokio")]
pub use crate::network::tokio_socket::{ReceiveTask, TokioUdpSocket};
