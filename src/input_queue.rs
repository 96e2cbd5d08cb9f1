use tracing::{trace, warn};

use crate::frame_info::GameInput;
use crate::{Config, Frame, InputStatus};

/// The default length of the input queue: the number of inputs kept per
/// player at the same time (about two seconds of play at 60 fps).
pub const INPUT_QUEUE_LENGTH: usize = 128;

/// `InputQueue` handles the inputs of a single player, stored in a circular
/// array keyed by frame. Valid inputs live between `tail` and `head`.
///
/// The queue serves three clients: the local producer ([`add_input`] with a
/// configured frame delay), the remote producer (same entry point, delay 0),
/// and the synchronizer consumer ([`input`]), which receives a *prediction*
/// when the requested frame has not arrived yet.
///
/// [`add_input`]: InputQueue::add_input
/// [`input`]: InputQueue::input
#[derive(Debug, Clone)]
pub(crate) struct InputQueue<T>
where
    T: Config,
{
    /// The head of the queue. The newest input is written here.
    head: usize,
    /// The tail of the queue. The oldest retained input lives here.
    tail: usize,
    /// The current number of retained inputs.
    length: usize,
    /// True until the first input has been added.
    first_frame: bool,

    /// The frame of the newest input in the queue.
    last_added_frame: Frame,
    /// The first frame known to have been predicted incorrectly.
    first_incorrect_frame: Frame,
    /// The last frame handed to the consumer. Nothing at or after it may be
    /// discarded, as it may still be needed for a rollback.
    last_requested_frame: Frame,

    /// Local input delay in frames; shifts user frames forward on insertion.
    frame_delay: usize,

    /// The cyclic input storage.
    inputs: Vec<GameInput<T::Input>>,
    /// The running prediction served while inputs are missing.
    prediction: GameInput<T::Input>,
}

impl<T: Config> InputQueue<T> {
    pub(crate) fn new(queue_length: usize) -> Self {
        let queue_length = queue_length.max(2);
        Self {
            head: 0,
            tail: 0,
            length: 0,
            frame_delay: 0,
            first_frame: true,
            last_added_frame: Frame::NULL,
            first_incorrect_frame: Frame::NULL,
            last_requested_frame: Frame::NULL,
            prediction: GameInput::blank(Frame::NULL),
            inputs: vec![GameInput::blank(Frame::NULL); queue_length],
        }
    }

    pub(crate) fn first_incorrect_frame(&self) -> Frame {
        self.first_incorrect_frame
    }

    pub(crate) fn last_added_frame(&self) -> Frame {
        self.last_added_frame
    }

    pub(crate) fn is_predicting(&self) -> bool {
        !self.prediction.frame.is_null()
    }

    pub(crate) fn set_frame_delay(&mut self, delay: usize) {
        self.frame_delay = delay;
    }

    /// Clears the predicted tail of the queue and drops out of prediction
    /// mode. Called after a rollback restored the simulation to a frame
    /// before the first incorrect prediction.
    pub(crate) fn reset_prediction(&mut self) {
        self.prediction.frame = Frame::NULL;
        self.first_incorrect_frame = Frame::NULL;
        self.last_requested_frame = Frame::NULL;
    }

    /// Returns the stored input for `requested_frame` without falling back
    /// to a prediction.
    pub(crate) fn confirmed_input(
        &self,
        requested_frame: Frame,
    ) -> Result<GameInput<T::Input>, crate::NetplayError> {
        let offset = match requested_frame.ring_index(self.inputs.len()) {
            Some(offset) => offset,
            None => {
                return Err(crate::NetplayError::InvalidRequest {
                    info: format!("confirmed input requested for invalid frame {}", requested_frame),
                });
            },
        };

        if self.inputs[offset].frame == requested_frame {
            return Ok(self.inputs[offset]);
        }

        // The caller asked for a frame that is either not yet confirmed or
        // already overwritten by the ring.
        Err(crate::NetplayError::InvalidRequest {
            info: format!(
                "no confirmed input for frame {} (tail={}, head={}, length={})",
                requested_frame, self.tail, self.head, self.length
            ),
        })
    }

    /// Discards confirmed frames up to the given `frame` from the queue. All
    /// confirmed frames are synchronized between players, so they are no
    /// longer needed.
    pub(crate) fn discard_confirmed_frames(&mut self, mut frame: Frame) {
        // only drop frames up to the last requested frame, anything newer
        // may still be served again during a rollback
        if !self.last_requested_frame.is_null() {
            frame = frame.min(self.last_requested_frame);
        }

        if frame >= self.last_added_frame {
            // delete all but the most recent input
            self.tail = self.head;
            self.length = 1;
        } else if frame <= self.inputs[self.tail].frame {
            // nothing to delete
        } else {
            let offset = (frame - self.inputs[self.tail].frame) as usize;
            self.tail = (self.tail + offset) % self.inputs.len();
            self.length -= offset;
        }
    }

    /// Returns the input of this player for `requested_frame` together with
    /// its provenance. If the real input has not arrived yet, a prediction
    /// (the last known input, rebadged to the requested frame) is served
    /// instead.
    pub(crate) fn input(&mut self, requested_frame: Frame) -> (T::Input, InputStatus) {
        // Serving inputs while a known misprediction is pending would walk
        // further down the wrong timeline; the synchronizer rolls back first.
        debug_assert!(self.first_incorrect_frame.is_null());

        // Remember the last requested frame; add_input uses it to decide
        // when prediction mode can end.
        self.last_requested_frame = requested_frame;

        debug_assert!(requested_frame >= self.inputs[self.tail].frame);

        if self.prediction.frame.is_null() {
            // If the requested frame is in our range, fetch it from the
            // queue and return it.
            let mut offset = (requested_frame - self.inputs[self.tail].frame).max(0) as usize;

            if offset < self.length {
                offset = (offset + self.tail) % self.inputs.len();
                debug_assert!(self.inputs[offset].frame == requested_frame);
                return (self.inputs[offset].input, InputStatus::Confirmed);
            }

            // The requested frame isn't in the queue; go into prediction
            // mode. Predict that the player will do the same thing they did
            // last time. The prediction's frame tracks the next frame whose
            // real input must be verified against it, i.e. the frame right
            // after the newest confirmed one.
            if requested_frame == 0 || self.last_added_frame.is_null() {
                self.prediction = GameInput::blank(Frame::NULL);
            } else {
                let previous_position = match self.head {
                    0 => self.inputs.len() - 1,
                    _ => self.head - 1,
                };
                self.prediction = self.inputs[previous_position];
            }
            self.prediction.frame = self.prediction.frame.next();
            trace!("queue entering prediction mode at frame {}", requested_frame);
        }

        (self.prediction.input, InputStatus::Predicted)
    }

    /// Adds an input to the queue, applying the configured frame delay.
    /// Returns the frame the input was actually placed at, or [`Frame::NULL`]
    /// if the input was dropped (out of sequence, or the queue is full).
    pub(crate) fn add_input(&mut self, input: GameInput<T::Input>) -> Frame {
        // inputs must arrive sequentially, regardless of frame delay
        if !self.last_added_frame.is_null()
            && input.frame + self.frame_delay as i32 != self.last_added_frame.next()
        {
            trace!(
                "dropping out-of-sequence input for frame {} (last added {})",
                input.frame,
                self.last_added_frame
            );
            return Frame::NULL;
        }

        if self.length >= self.inputs.len() {
            warn!("input queue full, dropping input for frame {}", input.frame);
            return Frame::NULL;
        }

        let new_frame = self.advance_queue_head(input.frame);
        if !new_frame.is_null() {
            self.add_input_by_frame(input, new_frame);
        }
        new_frame
    }

    /// Adds an input at a specific frame number, checking any outstanding
    /// prediction against it.
    fn add_input_by_frame(&mut self, input: GameInput<T::Input>, frame_number: Frame) {
        let previous_position = match self.head {
            0 => self.inputs.len() - 1,
            _ => self.head - 1,
        };

        debug_assert!(self.last_added_frame.is_null() || frame_number == self.last_added_frame.next());
        debug_assert!(frame_number == 0 || self.inputs[previous_position].frame == frame_number.prev());

        self.inputs[self.head] = input;
        self.inputs[self.head].frame = frame_number;
        self.head = (self.head + 1) % self.inputs.len();
        self.length += 1;
        self.first_frame = false;
        self.last_added_frame = frame_number;

        // If we have been predicting, check whether the real input matches
        // what we served.
        if !self.prediction.frame.is_null() {
            debug_assert!(frame_number == self.prediction.frame);

            // remember the first incorrect input so the rollback can seek to it
            if self.first_incorrect_frame.is_null() && !self.prediction.equal(&input, true) {
                trace!("prediction was incorrect at frame {}", frame_number);
                self.first_incorrect_frame = frame_number;
            }

            // If the prediction caught up with the last requested frame and
            // no misprediction was found, leave prediction mode. Otherwise
            // keep predicting forward.
            if self.prediction.frame == self.last_requested_frame
                && self.first_incorrect_frame.is_null()
            {
                self.prediction.frame = Frame::NULL;
            } else {
                self.prediction.frame = self.prediction.frame.next();
            }
        }
    }

    /// Advances the queue head to the next frame, replicating or dropping
    /// inputs if the frame delay changed since the last insertion.
    fn advance_queue_head(&mut self, input_frame: Frame) -> Frame {
        let previous_position = match self.head {
            0 => self.inputs.len() - 1,
            _ => self.head - 1,
        };

        let mut expected_frame = if self.first_frame {
            Frame::ZERO
        } else {
            self.inputs[previous_position].frame.next()
        };

        let input_frame = input_frame + self.frame_delay as i32;
        // The frame delay has dropped since the last insertion; there is no
        // room in the sequence for this input. Toss it.
        if expected_frame > input_frame {
            return Frame::NULL;
        }

        // The frame delay has increased since the last insertion; replicate
        // the previous input to fill the gap.
        while expected_frame < input_frame {
            let input_to_replicate = self.inputs[previous_position];
            self.add_input_by_frame(input_to_replicate, expected_frame);
            expected_frame = expected_frame.next();
        }

        input_frame
    }
}

// #########
// # TESTS #
// #########
