//! # netplay
//!
//! `netplay` is a peer-to-peer rollback networking library for
//! lockstep-deterministic real-time simulations, written in 100% safe Rust.
//!
//! Peers advance a shared simulation in lockstep while hiding wide-area
//! latency by *predicting* remote inputs, running the simulation
//! speculatively, and *rolling back* when authoritative remote inputs
//! disagree with the prediction.
//!
//! The host application drives a session once per simulation tick:
//!
//! 1. [`P2PSession::begin_frame`]: drain the network, run protocol timers,
//!    roll back and re-simulate if a misprediction was detected, advance the
//!    confirmed frame and feed spectators.
//! 2. [`P2PSession::add_local_input`]: register (and transmit) the local
//!    player's input for the current frame.
//! 3. [`P2PSession::synchronize_inputs`]: obtain the input set for the
//!    current frame (confirmed where known, predicted otherwise).
//! 4. The host advances its simulation with those inputs.
//! 5. [`P2PSession::advance_frame`]: snapshot the new state and move to the
//!    next frame.
//!
//! The session calls back into the host through [`SessionHandler`]: state
//! save/load during rollback, re-simulation, peer events and time-sync
//! recommendations. All callbacks happen on the host thread, only from
//! inside session calls.
//!
//! Saved states are opaque byte buffers produced by the host; the library
//! never interprets them beyond attaching a checksum.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::{fmt::Debug, hash::Hash};

use serde::{de::DeserializeOwned, Serialize};
use smallvec::SmallVec;
use web_time::Duration;

pub use error::{NetplayError, TransportError};
pub use frame_info::{ConfirmedInputs, GameInput};
pub use network::messages::{ConnectionStatus, Message};
pub use network::network_stats::NetworkStats;
pub use network::udp_socket::UdpNonBlockingSocket;
pub use sessions::any_session::AnySession;
pub use sessions::builder::SessionBuilder;
pub use sessions::config::{ConfirmedFrameMode, ProtocolConfig, SyncConfig};
pub use sessions::p2p_session::P2PSession;
pub use sessions::replay_session::ReplaySession;
pub use sessions::spectator_session::SpectatorSession;
pub use time_sync::TimeSyncConfig;

#[cfg(feature = "tokio")]
pub use background::BackgroundJobManager;
#[cfg(feature = "tokio")]
pub use network::tokio_socket::{ReceiveTask, TokioUdpSocket};

/// A specialized `Result` type for netplay operations.
///
/// Named `NetplayResult` rather than `Result` so that glob imports do not
/// shadow `std::result::Result`.
pub type NetplayResult<T, E = NetplayError> = std::result::Result<T, E>;

pub mod error;
#[doc(hidden)]
pub mod frame_info;
#[doc(hidden)]
pub mod input_queue;
#[doc(hidden)]
pub mod state_store;
#[doc(hidden)]
pub mod synchronizer;
#[doc(hidden)]
pub mod time_sync;

#[cfg(feature = "tokio")]
pub mod background;

/// Convenient re-exports for common usage.
pub mod prelude;

#[doc(hidden)]
pub mod network {
    pub mod codec;
    #[doc(hidden)]
    pub mod compression;
    #[doc(hidden)]
    pub mod messages;
    #[doc(hidden)]
    pub mod network_stats;
    #[doc(hidden)]
    pub mod protocol;
    #[cfg(feature = "tokio")]
    pub mod tokio_socket;
    #[doc(hidden)]
    pub mod udp_socket;
}

#[doc(hidden)]
pub mod sessions {
    #[doc(hidden)]
    pub mod any_session;
    #[doc(hidden)]
    pub mod builder;
    #[doc(hidden)]
    pub mod config;
    #[doc(hidden)]
    pub mod p2p_session;
    #[doc(hidden)]
    pub mod player_registry;
    #[doc(hidden)]
    pub mod replay_session;
    #[doc(hidden)]
    pub mod spectator_session;
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// The maximum number of players (local + remote) a session supports.
pub const MAX_PLAYERS: usize = 4;

/// The maximum number of spectators a session supports.
pub const MAX_SPECTATORS: usize = 32;

/// A frame is a single step of simulation execution.
///
/// Frames are the fundamental unit of time in rollback networking. Frame
/// numbers start at 0 and increment sequentially; the special value
/// [`Frame::NULL`] (-1) represents "no frame" or "uninitialized".
///
/// `Frame` is a newtype around `i32`: it keeps frame numbers from mixing
/// with arbitrary integers and carries the arithmetic the library needs.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// The null frame constant, representing "no frame".
    pub const NULL: Self = Self(NULL_FRAME);

    /// Frame zero, the first frame of a session.
    pub const ZERO: Self = Self(0);

    /// Creates a new `Frame` from an `i32` value.
    ///
    /// This does not validate the frame number; use [`Frame::is_valid`] to
    /// check for a non-negative frame.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Self(frame)
    }

    /// Returns the underlying `i32` value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` if this frame is the null frame.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is valid (non-negative).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Returns the next frame, saturating at `i32::MAX`.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns the previous frame, saturating at `i32::MIN`.
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Returns the smaller of two frames.
    #[inline]
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        std::cmp::min(self, other)
    }

    /// Returns the larger of two frames.
    #[inline]
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        std::cmp::max(self, other)
    }

    /// Returns the signed span from `other` to `self` (`self - other`).
    #[inline]
    #[must_use]
    pub const fn span_since(self, other: Self) -> FrameSpan {
        FrameSpan(self.0.saturating_sub(other.0))
    }

    /// Returns the frame as a `usize`, or `None` if the frame is negative.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> Option<usize> {
        if self.0 >= 0 {
            Some(self.0 as usize)
        } else {
            None
        }
    }

    /// Maps this frame to a slot in a ring buffer of the given capacity.
    ///
    /// Returns `None` if the frame is negative or `capacity` is zero.
    #[inline]
    #[must_use]
    pub const fn ring_index(self, capacity: usize) -> Option<usize> {
        if self.0 >= 0 && capacity > 0 {
            Some(self.0 as usize % capacity)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Self;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl std::ops::Sub<Self> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<Frame> for i32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

impl PartialEq<i32> for Frame {
    #[inline]
    fn eq(&self, other: &i32) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<i32> for Frame {
    #[inline]
    fn partial_cmp(&self, other: &i32) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// A signed count of frames, as opposed to an absolute frame number.
///
/// Spans are what time-sync recommendations and rollback depths are measured
/// in; [`FrameSpan::as_duration`] converts a span to wall time at a given
/// simulation rate.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct FrameSpan(i32);

impl FrameSpan {
    /// A span of zero frames.
    pub const ZERO: Self = Self(0);

    /// Creates a span from a signed frame count.
    #[inline]
    #[must_use]
    pub const fn new(frames: i32) -> Self {
        Self(frames)
    }

    /// Returns the signed frame count.
    #[inline]
    #[must_use]
    pub const fn count(self) -> i32 {
        self.0
    }

    /// Returns `true` if the span covers no frames.
    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Converts the span to wall time at `fps` simulation steps per second.
    ///
    /// Negative spans convert to their absolute duration.
    #[must_use]
    pub fn as_duration(self, fps: usize) -> Duration {
        if fps == 0 {
            return Duration::ZERO;
        }
        let frames = self.0.unsigned_abs() as u64;
        Duration::from_micros(frames * 1_000_000 / fps as u64)
    }
}

impl std::fmt::Display for FrameSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} frame(s)", self.0)
    }
}

impl From<i32> for FrameSpan {
    #[inline]
    fn from(value: i32) -> Self {
        Self(value)
    }
}

/// A unique identifier for a player or spectator in a session.
///
/// Handles `0` through `num_players - 1` identify active players; handles
/// `num_players` and above identify spectators. The handle doubles as the
/// dense input-queue index used internally for players.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PlayerHandle(usize);

impl PlayerHandle {
    /// Creates a new `PlayerHandle` from a `usize` value.
    #[inline]
    #[must_use]
    pub const fn new(handle: usize) -> Self {
        Self(handle)
    }

    /// Returns the underlying `usize` value.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns `true` if this handle refers to a player (not a spectator)
    /// in a session with `num_players` players.
    #[inline]
    #[must_use]
    pub const fn is_player_for(self, num_players: usize) -> bool {
        self.0 < num_players
    }

    /// Returns `true` if this handle refers to a spectator in a session
    /// with `num_players` players.
    #[inline]
    #[must_use]
    pub const fn is_spectator_for(self, num_players: usize) -> bool {
        self.0 >= num_players
    }
}

impl std::fmt::Display for PlayerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for PlayerHandle {
    #[inline]
    fn from(value: usize) -> Self {
        Self(value)
    }
}

/// The three kinds of session participants:
/// - local players, who play on the local device,
/// - remote players, who play on other devices, and
/// - spectators, who receive confirmed inputs but never contribute input.
///
/// [`PlayerType::Remote`] and [`PlayerType::Spectator`] carry the transport
/// address of the peer.
#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlayerType<A>
where
    A: Clone + PartialEq + Eq + PartialOrd + Ord + Hash,
{
    /// This player plays on the local device.
    #[default]
    Local,
    /// This player plays on a remote device identified by the address.
    Remote(A),
    /// This peer receives confirmed inputs only and never contributes input.
    Spectator(A),
}

impl<A> std::fmt::Display for PlayerType<A>
where
    A: Clone + PartialEq + Eq + PartialOrd + Ord + Hash + std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "Local"),
            Self::Remote(addr) => write!(f, "Remote({})", addr),
            Self::Spectator(addr) => write!(f, "Spectator({})", addr),
        }
    }
}

/// A session is always in one of these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// The session is establishing connections to the remote clients.
    Synchronizing,
    /// The session is synchronized and ready to take and transmit input.
    Running,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Synchronizing => write!(f, "Synchronizing"),
            Self::Running => write!(f, "Running"),
        }
    }
}

/// Provenance of a player input handed to the host for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputStatus {
    /// The input is an actual received (or local) input.
    Confirmed,
    /// The input is a prediction; a later rollback may correct it.
    Predicted,
    /// The player has disconnected at or before this frame; the input is a
    /// neutral placeholder.
    Disconnected,
}

impl std::fmt::Display for InputStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Confirmed => write!(f, "Confirmed"),
            Self::Predicted => write!(f, "Predicted"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Stack-allocated vector of per-player inputs for a single frame.
///
/// Inline capacity covers [`MAX_PLAYERS`], so frame-by-frame input exchange
/// does not allocate.
pub type InputVec<I> = SmallVec<[(I, InputStatus); MAX_PLAYERS]>;

/// Connection events reported to the host through
/// [`SessionHandler::on_peer_event`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PeerEvent<A> {
    /// First contact with the peer was established.
    Connected {
        /// The address of the endpoint.
        addr: A,
    },
    /// The handshake with the peer made progress. After `total` roundtrips
    /// the connection is synchronized.
    Synchronizing {
        /// The address of the endpoint.
        addr: A,
        /// Completed handshake roundtrips.
        count: u32,
        /// Required handshake roundtrips.
        total: u32,
    },
    /// The connection is synchronized and input exchange has begun.
    Synchronized {
        /// The address of the endpoint.
        addr: A,
        /// Rough roundtrip estimate measured during the handshake.
        ping: Duration,
    },
    /// No packets have arrived from the peer for a while; the peer will be
    /// disconnected after `disconnect_timeout` unless traffic resumes.
    NetworkInterrupted {
        /// The address of the endpoint.
        addr: A,
        /// Time remaining until forced disconnect.
        disconnect_timeout: Duration,
    },
    /// Packets from an interrupted peer are flowing again.
    NetworkResumed {
        /// The address of the endpoint.
        addr: A,
    },
    /// The peer has been disconnected.
    Disconnected {
        /// The address of the endpoint.
        addr: A,
    },
    /// The handshake with the peer timed out.
    SyncFailure {
        /// The address of the endpoint.
        addr: A,
    },
}

/// Compile-time parameterization for sessions.
pub trait Config: 'static {
    /// The input type of the simulation. This is the only game-related data
    /// transmitted over the network, so it should be kept small and
    /// bit-copyable.
    ///
    /// The [`Default`] value represents "no input", including for
    /// disconnected players.
    type Input: Copy + Clone + PartialEq + Default + Serialize + DeserializeOwned + Send + Sync;

    /// The address type which identifies remote clients.
    type Address: Clone + PartialEq + Eq + PartialOrd + Ord + Hash + Send + Sync + Debug;
}

/// The host-side callbacks a session drives.
///
/// All methods are invoked on the host thread, only from inside a session
/// call ([`P2PSession::begin_frame`], [`P2PSession::advance_frame`], ...).
pub trait SessionHandler<T: Config> {
    /// Serialize the current simulation state. The returned bytes are opaque
    /// to the library; they are stored (with a checksum) so the simulation
    /// can be rewound to `frame` later. The state must describe the
    /// beginning of `frame`, before its inputs are applied.
    fn save_state(&mut self, frame: Frame) -> Vec<u8>;

    /// Restore a state previously produced by
    /// [`save_state`](SessionHandler::save_state) for `frame`.
    fn load_state(&mut self, frame: Frame, state: &[u8]);

    /// Advance the simulation by one frame using `inputs`. Only called
    /// during rollback re-simulation; in the normal path the host advances
    /// its simulation itself between
    /// [`synchronize_inputs`](P2PSession::synchronize_inputs) and
    /// [`advance_frame`](P2PSession::advance_frame).
    fn advance_frame(&mut self, inputs: &[(T::Input, InputStatus)]);

    /// All peers finished synchronizing; input exchange begins.
    fn on_session_start(&mut self) {}

    /// The session is shutting down.
    fn on_session_close(&mut self) {}

    /// The local client is running ahead of its peers; skipping `skip`
    /// frames would let them catch up.
    fn on_time_sync(&mut self, skip: FrameSpan) {
        let _ = skip;
    }

    /// A connection-related event occurred for the given participant.
    fn on_peer_event(&mut self, player: PlayerHandle, event: PeerEvent<T::Address>) {
        let _ = (player, event);
    }

    /// A frame's inputs became confirmed by every player. Useful for replay
    /// recording; invoked in strictly increasing frame order.
    fn on_confirmed_inputs(&mut self, inputs: &ConfirmedInputs<T::Input>) {
        let _ = inputs;
    }
}

/// Transport abstraction used by sessions to exchange datagrams.
///
/// Messages are sent in a UDP-like fashion, unordered and unreliable; the
/// internal protocol takes care of delivery of everything that matters.
pub trait NonBlockingSocket<A>: Send + Sync
where
    A: Clone + PartialEq + Eq + Hash + Send + Sync,
{
    /// Sends a [`Message`] to the given address without blocking.
    ///
    /// # Errors
    /// Returns [`TransportError::WouldBlock`] if the message could not be
    /// sent right now. Dropped messages are recovered by protocol resend.
    fn send_to(&mut self, msg: &Message, addr: &A) -> Result<(), TransportError>;

    /// Returns all messages received since the last call, paired with the
    /// address each was received from.
    fn receive_all_messages(&mut self) -> Vec<(A, Message)>;

    /// Takes an error latched by a background I/O driver, if any.
    ///
    /// Sessions check this at the start of every [`P2PSession::begin_frame`]
    /// so background failures surface synchronously on the host thread.
    fn take_error(&mut self) -> Option<TransportError> {
        None
    }
}

// #########
// # TESTS #
// #########
