use crate::frame_info::ConfirmedInputs;
use crate::{Config, Frame, InputStatus, InputVec, NetplayError, SessionState};

/// A replay session: feeds the simulation from a fixed sequence of
/// confirmed inputs instead of the network.
///
/// The sequence is typically captured through
/// [`SessionHandler::on_confirmed_inputs`] during a live session. Each
/// [`synchronize_inputs`](Self::synchronize_inputs) call consumes one entry;
/// once the recording is exhausted the session reports `NotSynchronized`.
/// There is no prediction and no rollback.
///
/// [`SessionHandler::on_confirmed_inputs`]: crate::SessionHandler::on_confirmed_inputs
pub struct ReplaySession<T>
where
    T: Config,
{
    script: Vec<ConfirmedInputs<T::Input>>,
    cursor: usize,
    current_frame: Frame,
}

impl<T: Config> ReplaySession<T> {
    /// Creates a replay session over a recorded input sequence.
    #[must_use]
    pub fn new(script: Vec<ConfirmedInputs<T::Input>>) -> Self {
        Self {
            script,
            cursor: 0,
            current_frame: Frame::NULL,
        }
    }

    /// Returns the next recorded frame's inputs, advancing the playback
    /// cursor.
    ///
    /// # Errors
    /// [`NetplayError::NotSynchronized`] once the recording is exhausted.
    pub fn synchronize_inputs(&mut self) -> Result<InputVec<T::Input>, NetplayError> {
        let Some(entry) = self.script.get(self.cursor) else {
            return Err(NetplayError::NotSynchronized);
        };
        self.cursor += 1;
        Ok(entry
            .inputs
            .iter()
            .map(|&input| (input, InputStatus::Confirmed))
            .collect())
    }

    /// Moves the frame counter forward after the host advanced its
    /// simulation.
    pub fn advance_frame(&mut self) {
        self.current_frame = self.current_frame.next();
    }

    /// The frame the replay has been simulated up to.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.current_frame
    }

    /// A replay is running while recorded frames remain.
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        if self.cursor < self.script.len() {
            SessionState::Running
        } else {
            SessionState::Synchronizing
        }
    }

    /// The number of recorded frames left to play.
    #[must_use]
    pub fn frames_remaining(&self) -> usize {
        self.script.len().saturating_sub(self.cursor)
    }
}

// #########
// # TESTS #
// #########
