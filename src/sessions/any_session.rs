use crate::sessions::p2p_session::P2PSession;
use crate::sessions::replay_session::ReplaySession;
use crate::sessions::spectator_session::SpectatorSession;
use crate::{
    Config, Frame, InputVec, NetplayError, PlayerHandle, SessionHandler, SessionState,
};

/// The session kinds behind one contract, as a tagged enum.
///
/// Lets a game loop drive any backend (remote, spectator, or replay)
/// without generics or trait objects. Operations a backend does not support
/// return [`NetplayError::NotSupported`].
pub enum AnySession<T>
where
    T: Config,
{
    /// A live peer-to-peer session.
    Remote(P2PSession<T>),
    /// A session watching a remote host.
    Spectator(SpectatorSession<T>),
    /// A session playing back a recording.
    Replay(ReplaySession<T>),
}

impl<T: Config> AnySession<T> {
    /// Starts a simulation tick. A no-op for replays.
    ///
    /// # Errors
    /// See [`P2PSession::begin_frame`].
    pub fn begin_frame<H: SessionHandler<T>>(&mut self, handler: &mut H) -> Result<(), NetplayError> {
        match self {
            Self::Remote(session) => session.begin_frame(handler),
            Self::Spectator(session) => session.begin_frame(handler),
            Self::Replay(_) => Ok(()),
        }
    }

    /// Registers a local input. Only supported by the remote backend.
    ///
    /// # Errors
    /// [`NetplayError::NotSupported`] for spectators and replays; otherwise
    /// see [`P2PSession::add_local_input`].
    pub fn add_local_input(
        &mut self,
        player_handle: PlayerHandle,
        input: T::Input,
    ) -> Result<(), NetplayError> {
        match self {
            Self::Remote(session) => session.add_local_input(player_handle, input),
            Self::Spectator(_) | Self::Replay(_) => Err(NetplayError::NotSupported {
                operation: "add_local_input",
            }),
        }
    }

    /// Returns the inputs of every player for the current frame.
    ///
    /// # Errors
    /// See the respective backend's `synchronize_inputs`.
    pub fn synchronize_inputs(&mut self) -> Result<InputVec<T::Input>, NetplayError> {
        match self {
            Self::Remote(session) => session.synchronize_inputs(),
            Self::Spectator(session) => session.synchronize_inputs(),
            Self::Replay(session) => session.synchronize_inputs(),
        }
    }

    /// Ends the tick after the host advanced its simulation.
    ///
    /// # Errors
    /// See the respective backend's `advance_frame`.
    pub fn advance_frame<H: SessionHandler<T>>(&mut self, handler: &mut H) -> Result<(), NetplayError> {
        match self {
            Self::Remote(session) => session.advance_frame(handler),
            Self::Spectator(session) => session.advance_frame(),
            Self::Replay(session) => {
                session.advance_frame();
                Ok(())
            },
        }
    }

    /// The frame the session has simulated up to.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        match self {
            Self::Remote(session) => session.current_frame(),
            Self::Spectator(session) => session.current_frame(),
            Self::Replay(session) => session.current_frame(),
        }
    }

    /// The current session state.
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        match self {
            Self::Remote(session) => session.current_state(),
            Self::Spectator(session) => session.current_state(),
            Self::Replay(session) => session.current_state(),
        }
    }
}

impl<T: Config> From<P2PSession<T>> for AnySession<T> {
    fn from(session: P2PSession<T>) -> Self {
        Self::Remote(session)
    }
}

impl<T: Config> From<SpectatorSession<T>> for AnySession<T> {
    fn from(session: SpectatorSession<T>) -> Self {
        Self::Spectator(session)
    }
}

impl<T: Config> From<ReplaySession<T>> for AnySession<T> {
    fn from(session: ReplaySession<T>) -> Self {
        Self::Replay(session)
    }
}

// #########
// # TESTS #
// #########
