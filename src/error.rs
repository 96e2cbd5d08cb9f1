//! Error types returned by netplay sessions and transports.

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::{Frame, PlayerHandle};

/// Errors from the transport layer.
///
/// Transports are unreliable by design, so most send failures are harmless
/// (protocol resend recovers lost packets); the variants exist so sessions
/// can count drops and surface background I/O failures.
#[derive(Debug)]
pub enum TransportError {
    /// The message could not be sent right now without blocking.
    WouldBlock,
    /// Serializing or deserializing a message failed.
    Codec {
        /// The underlying codec error message.
        message: String,
    },
    /// An I/O error occurred on the socket.
    Io(std::io::Error),
}

impl Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldBlock => write!(f, "send would block"),
            Self::Codec { message } => write!(f, "message codec failed: {}", message),
            Self::Io(err) => write!(f, "socket I/O error: {}", err),
        }
    }
}

impl Error for TransportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// The error type for all session operations.
///
/// The first group of variants is *expected contention*: the host is free to
/// retry on the next frame. The second group marks misuse of the API. The
/// last group is fatal: the session cannot continue and must be closed.
#[derive(Debug)]
pub enum NetplayError {
    // --- expected contention, retry next frame ---
    /// The session is not (yet) synchronized with all remote clients.
    NotSynchronized,
    /// The operation is only available while the session is synchronizing;
    /// it already started.
    AlreadySynchronized,
    /// The simulation has run `max_prediction` frames past the last
    /// confirmed frame; the host should stall until remote inputs arrive.
    PredictionThreshold,
    /// The input was registered locally, but transmitting it to at least one
    /// peer failed; resend will recover it.
    InputDropped,

    // --- programmer errors ---
    /// The handle does not refer to a participant of this session.
    InvalidPlayerHandle {
        /// The offending handle.
        handle: PlayerHandle,
    },
    /// The handle refers to a participant, but one of the wrong kind or out
    /// of the valid player range for this operation.
    PlayerOutOfRange {
        /// The offending handle.
        handle: PlayerHandle,
        /// The number of players in the session.
        num_players: usize,
    },
    /// The session is mid-rollback; the operation is not allowed until the
    /// rollback completes.
    InRollback,
    /// The session already holds the maximum number of players.
    TooManyPlayers {
        /// The compile-time player limit.
        max: usize,
    },
    /// The session already holds the maximum number of spectators.
    TooManySpectators {
        /// The compile-time spectator limit.
        max: usize,
    },
    /// A participant with this handle was already added.
    DuplicatedPlayer {
        /// The offending handle.
        handle: PlayerHandle,
    },
    /// The operation is not supported by this session kind.
    NotSupported {
        /// The rejected operation.
        operation: &'static str,
    },
    /// A local input for this player and frame was expected but not given.
    MissingInput {
        /// The player whose input is missing.
        player: PlayerHandle,
        /// The frame the input was expected for.
        frame: Frame,
    },
    /// A request that violates the session contract.
    InvalidRequest {
        /// Human-readable description of the violation.
        info: String,
    },

    // --- fatal ---
    /// The spectator fell further behind the host than its input buffer can
    /// cover; the missing inputs are gone.
    SpectatorTooFarBehind,
    /// The simulation state diverged irrecoverably: a rollback required a
    /// snapshot that is no longer (or not yet) in the state store.
    Desync {
        /// The frame whose snapshot was required.
        frame: Frame,
        /// What the rollback machinery was doing.
        context: &'static str,
    },
    /// A transport error latched by the background I/O driver.
    Transport(TransportError),
}

impl Display for NetplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSynchronized => {
                write!(f, "the session is not yet synchronized with all remote clients")
            },
            Self::AlreadySynchronized => {
                write!(f, "the session has already synchronized and started")
            },
            Self::PredictionThreshold => write!(
                f,
                "prediction threshold reached; too many frames ahead of the last confirmed frame"
            ),
            Self::InputDropped => {
                write!(f, "local input could not be transmitted to at least one peer")
            },
            Self::InvalidPlayerHandle { handle } => {
                write!(f, "invalid player handle {}", handle)
            },
            Self::PlayerOutOfRange { handle, num_players } => write!(
                f,
                "player handle {} out of range for {} player(s)",
                handle, num_players
            ),
            Self::InRollback => write!(f, "operation not allowed during rollback"),
            Self::TooManyPlayers { max } => {
                write!(f, "too many players (maximum {})", max)
            },
            Self::TooManySpectators { max } => {
                write!(f, "too many spectators (maximum {})", max)
            },
            Self::DuplicatedPlayer { handle } => {
                write!(f, "a participant with handle {} was already added", handle)
            },
            Self::NotSupported { operation } => {
                write!(f, "operation not supported by this session kind: {}", operation)
            },
            Self::MissingInput { player, frame } => write!(
                f,
                "missing local input for player {} at frame {}",
                player, frame
            ),
            Self::InvalidRequest { info } => write!(f, "invalid request: {}", info),
            Self::SpectatorTooFarBehind => {
                write!(f, "spectator fell behind the host further than its input buffer covers")
            },
            Self::Desync { frame, context } => write!(
                f,
                "unrecoverable desync: no snapshot for frame {} ({})",
                frame, context
            ),
            Self::Transport(err) => write!(f, "transport failure: {}", err),
        }
    }
}

impl Error for NetplayError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransportError> for NetplayError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

// #########
// # TESTS #
// #########
