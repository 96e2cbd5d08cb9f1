//! The synchronizer owns the per-player input queues and the snapshot ring,
//! and performs rollback and re-simulation through the host's
//! [`SessionHandler`].

use tracing::{debug, trace, warn};

use crate::frame_info::{ConfirmedInputs, GameInput};
use crate::input_queue::InputQueue;
use crate::network::messages::ConnectionStatus;
use crate::state_store::StateStore;
use crate::{
    Config, Frame, FrameSpan, InputStatus, InputVec, NetplayError, PlayerHandle, SessionHandler,
};

/// Coordinates input queues and the state store. The session fans host
/// calls into this type; the protocol layer never touches it.
///
/// The synchronizer tracks the current simulation frame, saves a snapshot at
/// the beginning of every frame, and rewinds the simulation whenever a queue
/// reports that a prediction turned out wrong.
pub(crate) struct Synchronizer<T>
where
    T: Config,
{
    num_players: usize,
    max_prediction: usize,
    state_store: StateStore,
    /// The newest frame for which every player's input is confirmed.
    last_confirmed_frame: Frame,
    /// The current simulation frame.
    current_frame: Frame,
    /// Set while re-simulating inside a rollback.
    in_rollback: bool,
    input_queues: Vec<InputQueue<T>>,
}

impl<T: Config> Synchronizer<T> {
    pub(crate) fn new(num_players: usize, max_prediction: usize, queue_length: usize) -> Self {
        Self {
            num_players,
            max_prediction,
            state_store: StateStore::new(max_prediction),
            last_confirmed_frame: Frame::NULL,
            current_frame: Frame::ZERO,
            in_rollback: false,
            input_queues: (0..num_players).map(|_| InputQueue::new(queue_length)).collect(),
        }
    }

    pub(crate) fn current_frame(&self) -> Frame {
        self.current_frame
    }

    pub(crate) fn last_confirmed_frame(&self) -> Frame {
        self.last_confirmed_frame
    }

    pub(crate) fn in_rollback(&self) -> bool {
        self.in_rollback
    }

    pub(crate) fn max_prediction(&self) -> usize {
        self.max_prediction
    }

    /// How many frames the simulation has run past the last confirmed frame.
    pub(crate) fn frames_ahead(&self) -> i32 {
        if self.last_confirmed_frame.is_null() {
            // nothing confirmed yet, every advanced frame is speculative
            self.current_frame.as_i32()
        } else {
            self.current_frame - self.last_confirmed_frame
        }
    }

    pub(crate) fn set_frame_delay(
        &mut self,
        player_handle: PlayerHandle,
        delay: usize,
    ) -> Result<(), NetplayError> {
        let num_players = self.num_players;
        self.input_queues
            .get_mut(player_handle.as_usize())
            .ok_or(NetplayError::PlayerOutOfRange {
                handle: player_handle,
                num_players,
            })?
            .set_frame_delay(delay);
        Ok(())
    }

    /// Adds a local input for the current frame. Returns the frame the input
    /// was placed at, which differs from the current frame when an input
    /// delay is configured.
    ///
    /// # Errors
    /// `PredictionThreshold` when the simulation is already a full
    /// speculation window ahead of the last confirmed frame.
    pub(crate) fn add_local_input(
        &mut self,
        player_handle: PlayerHandle,
        input: GameInput<T::Input>,
    ) -> Result<Frame, NetplayError> {
        if self.frames_ahead() >= self.max_prediction as i32 {
            trace!(
                "prediction threshold: current {} vs confirmed {}",
                self.current_frame,
                self.last_confirmed_frame
            );
            return Err(NetplayError::PredictionThreshold);
        }

        if input.frame != self.current_frame {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "local input is for frame {} but the current frame is {}",
                    input.frame, self.current_frame
                ),
            });
        }

        let num_players = self.num_players;
        let queue = self
            .input_queues
            .get_mut(player_handle.as_usize())
            .ok_or(NetplayError::PlayerOutOfRange {
                handle: player_handle,
                num_players,
            })?;
        Ok(queue.add_input(input))
    }

    /// Adds an input that arrived from a remote player. Remote inputs were
    /// validated on the sending side; out-of-sequence duplicates are dropped
    /// by the queue.
    pub(crate) fn add_remote_input(&mut self, player_handle: PlayerHandle, input: GameInput<T::Input>) {
        if let Some(queue) = self.input_queues.get_mut(player_handle.as_usize()) {
            queue.add_input(input);
        }
    }

    /// Collects the inputs of every player for the current frame, serving
    /// predictions where real inputs are missing and neutral inputs for
    /// disconnected players.
    pub(crate) fn synchronize_inputs(
        &mut self,
        connect_status: &[ConnectionStatus],
    ) -> InputVec<T::Input> {
        let mut inputs = InputVec::new();
        for (i, status) in connect_status.iter().enumerate() {
            if status.disconnected && status.last_frame < self.current_frame {
                inputs.push((T::Input::default(), InputStatus::Disconnected));
            } else if let Some(queue) = self.input_queues.get_mut(i) {
                inputs.push(queue.input(self.current_frame));
            }
        }
        inputs
    }

    /// Collects the confirmed inputs of every player for `frame`. Fails if
    /// any non-disconnected player's input for that frame is not confirmed
    /// (or already discarded).
    pub(crate) fn confirmed_inputs(
        &self,
        frame: Frame,
        connect_status: &[ConnectionStatus],
    ) -> Result<ConfirmedInputs<T::Input>, NetplayError> {
        let mut inputs = ConfirmedInputs::empty(frame);
        for (i, status) in connect_status.iter().enumerate() {
            if status.disconnected && status.last_frame < frame {
                inputs.inputs.push(T::Input::default());
            } else {
                let queue = self.input_queues.get(i).ok_or(NetplayError::InvalidRequest {
                    info: format!("no input queue for player {}", i),
                })?;
                inputs.inputs.push(queue.confirmed_input(frame)?.input);
            }
        }
        Ok(inputs)
    }

    /// Raises the last confirmed frame, discarding queue entries that can no
    /// longer be needed. One frame before the confirmed frame is kept as the
    /// rollback anchor.
    pub(crate) fn set_last_confirmed_frame(&mut self, mut frame: Frame) {
        // Never confirm past a pending misprediction; the inputs at and
        // after it are still needed to adjust the simulation.
        let mut first_incorrect = Frame::NULL;
        for queue in &self.input_queues {
            let incorrect = queue.first_incorrect_frame();
            if !incorrect.is_null() && (first_incorrect.is_null() || incorrect < first_incorrect) {
                first_incorrect = incorrect;
            }
        }
        if !first_incorrect.is_null() && first_incorrect < frame {
            warn!(
                "clamping confirmed frame {} to pending misprediction at {}",
                frame, first_incorrect
            );
            frame = first_incorrect;
        }

        // never confirm ahead of the simulation
        frame = frame.min(self.current_frame);

        self.last_confirmed_frame = frame;
        if self.last_confirmed_frame > 0 {
            for queue in &mut self.input_queues {
                queue.discard_confirmed_frames(frame.prev());
            }
        }
    }

    /// Snapshots the state at the beginning of the current frame.
    pub(crate) fn save_current_state<H: SessionHandler<T>>(&mut self, handler: &mut H) {
        let data = handler.save_state(self.current_frame);
        self.state_store.save(self.current_frame, data);
    }

    /// Moves to the next frame and snapshots it.
    pub(crate) fn increment_frame<H: SessionHandler<T>>(&mut self, handler: &mut H) {
        self.current_frame = self.current_frame.next();
        self.save_current_state(handler);
    }

    /// Checksum of the stored snapshot for `frame`, if still in the ring.
    pub(crate) fn saved_checksum(&self, frame: Frame) -> Option<u32> {
        self.state_store.checksum(frame)
    }

    pub(crate) fn state_store_is_empty(&self) -> bool {
        self.state_store.is_empty()
    }

    /// The earliest frame any queue knows to have been predicted wrong,
    /// merged with an externally supplied candidate (used for disconnect
    /// adjustments). [`Frame::NULL`] when the simulation is consistent.
    pub(crate) fn first_incorrect_frame(&self, mut candidate: Frame) -> Frame {
        for queue in &self.input_queues {
            let incorrect = queue.first_incorrect_frame();
            if !incorrect.is_null() && (candidate.is_null() || incorrect < candidate) {
                candidate = incorrect;
            }
        }
        candidate
    }

    /// Checks whether the speculated timeline still matches the inputs that
    /// actually arrived; if not, rewinds and re-simulates. Returns the
    /// number of frames rolled back.
    pub(crate) fn check_simulation<H: SessionHandler<T>>(
        &mut self,
        handler: &mut H,
        disconnect_frame: Frame,
        connect_status: &[ConnectionStatus],
    ) -> Result<FrameSpan, NetplayError> {
        let seek_to = self.first_incorrect_frame(disconnect_frame);
        if seek_to.is_null() {
            return Ok(FrameSpan::ZERO);
        }
        self.adjust_simulation(handler, seek_to, connect_status)
    }

    /// Rewinds to `seek_to` and re-simulates forward to where the
    /// simulation was, using corrected inputs where they are now known.
    pub(crate) fn adjust_simulation<H: SessionHandler<T>>(
        &mut self,
        handler: &mut H,
        seek_to: Frame,
        connect_status: &[ConnectionStatus],
    ) -> Result<FrameSpan, NetplayError> {
        let saved_current = self.current_frame;

        if seek_to >= saved_current {
            // A misprediction at the current frame: nothing has been
            // simulated on top of it yet, so dropping the predictions is
            // enough.
            trace!("skipping rollback to {}; predictions reset only", seek_to);
            self.reset_prediction();
            return Ok(FrameSpan::ZERO);
        }

        let count = saved_current - seek_to;
        debug!("rolling back {} frame(s) to frame {}", count, seek_to);
        debug_assert!(count as usize <= self.max_prediction + 1);

        self.load_frame(handler, seek_to)?;
        self.reset_prediction();

        // Step forward to where we were, feeding the host the corrected
        // inputs (still predictions where nothing new arrived).
        self.in_rollback = true;
        while self.current_frame < saved_current {
            let inputs = self.synchronize_inputs(connect_status);
            handler.advance_frame(&inputs);
            self.increment_frame(handler);
        }
        self.in_rollback = false;

        debug_assert!(self.current_frame == saved_current);
        Ok(FrameSpan::new(count))
    }

    /// Restores the snapshot for `frame` through the host and rewinds the
    /// current frame to it.
    ///
    /// # Errors
    /// [`NetplayError::Desync`] if the snapshot is no longer in the ring.
    /// Under a correctly bounded speculation window this cannot happen; it
    /// indicates a tuning or protocol bug and the session must be closed.
    pub(crate) fn load_frame<H: SessionHandler<T>>(
        &mut self,
        handler: &mut H,
        frame: Frame,
    ) -> Result<(), NetplayError> {
        if frame.is_null() || frame >= self.current_frame {
            return Err(NetplayError::Desync {
                frame,
                context: "rollback target not in the past",
            });
        }

        let saved = self.state_store.get(frame).ok_or(NetplayError::Desync {
            frame,
            context: "snapshot missing from the state store",
        })?;
        handler.load_state(frame, &saved.data);
        self.current_frame = frame;
        Ok(())
    }

    fn reset_prediction(&mut self) {
        for queue in &mut self.input_queues {
            queue.reset_prediction();
        }
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod synchronizer_tests {
    use std::net::SocketAddr;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::input_queue::INPUT_QUEUE_LENGTH;

    #[repr(C)]
    #[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize, Debug)]
    struct TestInput {
        inp: u8,
    }

    struct TestConfig;

    impl Config for TestConfig {
        type Input = TestInput;
        type Address = SocketAddr;
    }

    /// Minimal deterministic host: the state is a running sum of inputs.
    #[derive(Default)]
    struct TestHandler {
        frame: i32,
        accum: u64,
        loads: usize,
        resimulated: usize,
    }

    impl SessionHandler<TestConfig> for TestHandler {
        fn save_state(&mut self, _frame: Frame) -> Vec<u8> {
            let mut data = self.frame.to_be_bytes().to_vec();
            data.extend_from_slice(&self.accum.to_be_bytes());
            data
        }

        fn load_state(&mut self, _frame: Frame, state: &[u8]) {
            self.frame = i32::from_be_bytes(state[0..4].try_into().unwrap());
            self.accum = u64::from_be_bytes(state[4..12].try_into().unwrap());
            self.loads += 1;
        }

        fn advance_frame(&mut self, inputs: &[(TestInput, InputStatus)]) {
            for (input, _) in inputs {
                self.accum = self.accum.wrapping_mul(31).wrapping_add(input.inp as u64);
            }
            self.frame += 1;
            self.resimulated += 1;
        }
    }

    fn sync2() -> Synchronizer<TestConfig> {
        Synchronizer::new(2, 8, INPUT_QUEUE_LENGTH)
    }

    fn statuses(frame: i32) -> Vec<ConnectionStatus> {
        vec![
            ConnectionStatus {
                disconnected: false,
                last_frame: Frame::new(frame),
            };
            2
        ]
    }

    /// Simulate one host frame: inputs in, host advance, snapshot.
    fn host_advance(
        sync: &mut Synchronizer<TestConfig>,
        handler: &mut TestHandler,
        connect_status: &[ConnectionStatus],
    ) {
        let inputs = sync.synchronize_inputs(connect_status);
        for (input, _) in &inputs {
            handler.accum = handler.accum.wrapping_mul(31).wrapping_add(input.inp as u64);
        }
        handler.frame += 1;
        sync.increment_frame(handler);
    }

    #[test]
    fn test_initial_state() {
        let sync = sync2();
        assert_eq!(sync.current_frame(), Frame::ZERO);
        assert_eq!(sync.last_confirmed_frame(), Frame::NULL);
        assert!(!sync.in_rollback());
    }

    #[test]
    fn test_prediction_threshold() {
        let mut sync = sync2();
        let mut handler = TestHandler::default();
        sync.save_current_state(&mut handler);

        // advance 8 frames with only local input confirmed
        for i in 0..8 {
            let input = GameInput::new(Frame::new(i), TestInput { inp: 1 });
            sync.add_local_input(PlayerHandle::new(0), input).unwrap();
            host_advance(&mut sync, &mut handler, &statuses(i));
        }

        // the ninth speculative frame must be refused
        let input = GameInput::new(Frame::new(8), TestInput { inp: 1 });
        assert!(matches!(
            sync.add_local_input(PlayerHandle::new(0), input),
            Err(NetplayError::PredictionThreshold)
        ));
    }

    #[test]
    fn test_wrong_frame_local_input() {
        let mut sync = sync2();
        let input = GameInput::new(Frame::new(5), TestInput { inp: 1 });
        assert!(matches!(
            sync.add_local_input(PlayerHandle::new(0), input),
            Err(NetplayError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_rollback_restores_and_resimulates() {
        let mut sync = sync2();
        let mut handler = TestHandler::default();
        sync.save_current_state(&mut handler);

        // both players play frame 0 confirmed
        sync.add_local_input(PlayerHandle::new(0), GameInput::new(Frame::ZERO, TestInput { inp: 1 }))
            .unwrap();
        sync.add_remote_input(PlayerHandle::new(1), GameInput::new(Frame::ZERO, TestInput { inp: 1 }));
        host_advance(&mut sync, &mut handler, &statuses(0));

        // frames 1..4: local input only, remote predicted (as repeat of 1)
        for i in 1..4 {
            sync.add_local_input(
                PlayerHandle::new(0),
                GameInput::new(Frame::new(i), TestInput { inp: 1 }),
            )
            .unwrap();
            host_advance(&mut sync, &mut handler, &statuses(0));
        }
        assert_eq!(sync.current_frame(), Frame::new(4));

        // the remote actually pressed something different from frame 1 on
        for i in 1..4 {
            sync.add_remote_input(
                PlayerHandle::new(1),
                GameInput::new(Frame::new(i), TestInput { inp: 9 }),
            );
        }

        let rolled = sync
            .check_simulation(&mut handler, Frame::NULL, &statuses(3))
            .unwrap();
        assert_eq!(rolled, FrameSpan::new(3));
        assert_eq!(handler.loads, 1);
        assert_eq!(sync.current_frame(), Frame::new(4));
        assert!(!sync.in_rollback());

        // the resimulated timeline must match a clean run with the same inputs
        let mut reference = TestHandler::default();
        for i in 0..4 {
            let local = TestInput { inp: 1 };
            let remote = if i == 0 { TestInput { inp: 1 } } else { TestInput { inp: 9 } };
            reference.accum = reference.accum.wrapping_mul(31).wrapping_add(local.inp as u64);
            reference.accum = reference.accum.wrapping_mul(31).wrapping_add(remote.inp as u64);
            reference.frame += 1;
        }
        assert_eq!(handler.accum, reference.accum);
    }

    #[test]
    fn test_rollback_bounded_by_prediction_window() {
        let mut sync = sync2();
        let mut handler = TestHandler::default();
        sync.save_current_state(&mut handler);

        for i in 0..6 {
            sync.add_local_input(
                PlayerHandle::new(0),
                GameInput::new(Frame::new(i), TestInput { inp: 2 }),
            )
            .unwrap();
            host_advance(&mut sync, &mut handler, &statuses(-1));
        }

        for i in 0..6 {
            sync.add_remote_input(
                PlayerHandle::new(1),
                GameInput::new(Frame::new(i), TestInput { inp: 7 }),
            );
        }

        let rolled = sync
            .check_simulation(&mut handler, Frame::NULL, &statuses(5))
            .unwrap();
        assert!(rolled.count() <= 8);
        assert_eq!(rolled, FrameSpan::new(6));
    }

    #[test]
    fn test_missing_snapshot_is_fatal() {
        let mut sync = sync2();
        let mut handler = TestHandler::default();
        // no snapshot was ever recorded for frame 1
        sync.current_frame = Frame::new(5);
        let result = sync.load_frame(&mut handler, Frame::new(1));
        assert!(matches!(result, Err(NetplayError::Desync { .. })));
    }

    #[test]
    fn test_set_last_confirmed_discards_inputs() {
        let mut sync = sync2();
        let mut handler = TestHandler::default();
        sync.save_current_state(&mut handler);

        for i in 0..10 {
            sync.add_local_input(
                PlayerHandle::new(0),
                GameInput::new(Frame::new(i), TestInput { inp: 0 }),
            )
            .ok();
            sync.add_remote_input(
                PlayerHandle::new(1),
                GameInput::new(Frame::new(i), TestInput { inp: 0 }),
            );
            host_advance(&mut sync, &mut handler, &statuses(i));
        }

        sync.set_last_confirmed_frame(Frame::new(6));
        assert_eq!(sync.last_confirmed_frame(), Frame::new(6));
        // the anchor frame right before the confirmed frame is retained
        assert!(sync.confirmed_inputs(Frame::new(5), &statuses(9)).is_ok());
    }

    #[test]
    fn test_confirmed_frame_never_ahead_of_simulation() {
        let mut sync = sync2();
        sync.set_last_confirmed_frame(Frame::new(50));
        assert_eq!(sync.last_confirmed_frame(), Frame::ZERO);
    }

    #[test]
    fn test_state_round_trip_checksum() {
        let mut sync = sync2();
        let mut handler = TestHandler::default();
        sync.save_current_state(&mut handler);

        for i in 0..5 {
            sync.add_local_input(
                PlayerHandle::new(0),
                GameInput::new(Frame::new(i), TestInput { inp: 3 }),
            )
            .unwrap();
            sync.add_remote_input(
                PlayerHandle::new(1),
                GameInput::new(Frame::new(i), TestInput { inp: 4 }),
            );
            host_advance(&mut sync, &mut handler, &statuses(i));
        }

        let final_checksum = sync.saved_checksum(Frame::new(5)).unwrap();

        // rewind to frame 2 and replay with identical inputs
        sync.load_frame(&mut handler, Frame::new(2)).unwrap();
        while sync.current_frame() < Frame::new(5) {
            let inputs = sync.synchronize_inputs(&statuses(4));
            handler.advance_frame(&inputs);
            sync.increment_frame(&mut handler);
        }

        assert_eq!(sync.saved_checksum(Frame::new(5)), Some(final_checksum));
    }
}
