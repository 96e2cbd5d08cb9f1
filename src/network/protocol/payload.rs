//! Byte-level encoding of per-frame input payloads.
//!
//! A single transmitted frame carries the inputs of every player the sending
//! endpoint feeds, serialized back to back in handle order. With fixed-int
//! encoding every player slice has the same size, so the receiving side can
//! split the buffer without any framing.

use std::collections::BTreeMap;

use tracing::warn;

use crate::frame_info::GameInput;
use crate::network::codec;
use crate::{Config, Frame, PlayerHandle};

/// The serialized inputs of one frame, possibly covering multiple players.
#[derive(Debug, Clone)]
pub(crate) struct FramePayload {
    /// The frame the payload belongs to; [`Frame::NULL`] for the zeroed
    /// bootstrap reference.
    pub frame: Frame,
    /// The serialized input bytes.
    pub bytes: Vec<u8>,
}

impl FramePayload {
    /// The all-zero payload used as the delta reference before any input has
    /// been exchanged. `None` if the input type cannot be serialized at all.
    pub fn zeroed<T: Config>(num_players: usize) -> Option<Self> {
        match codec::encoded_len(&T::Input::default()) {
            Ok(input_size) => Some(Self {
                frame: Frame::NULL,
                bytes: vec![0; input_size * num_players],
            }),
            Err(e) => {
                warn!("failed to serialize the default input: {}", e);
                None
            },
        }
    }

    /// Serializes the inputs of one frame, in ascending handle order.
    pub fn from_inputs<T: Config>(
        handles: &[PlayerHandle],
        inputs: &BTreeMap<PlayerHandle, GameInput<T::Input>>,
    ) -> Self {
        let mut bytes = Vec::new();
        let mut frame = Frame::NULL;
        for handle in handles {
            let Some(input) = inputs.get(handle) else {
                continue;
            };
            if frame.is_null() {
                frame = input.frame;
            } else if !input.frame.is_null() && frame != input.frame {
                warn!(
                    "input frame mismatch while serializing: frame {} vs player {} at {}",
                    frame, handle, input.frame
                );
            }
            match codec::encode(&input.input) {
                Ok(mut encoded) => bytes.append(&mut encoded),
                Err(e) => {
                    warn!("failed to serialize input for player {}: {}", handle, e);
                    return Self {
                        frame: Frame::NULL,
                        bytes: Vec::new(),
                    };
                },
            }
        }
        Self { frame, bytes }
    }

    /// Splits the payload back into one input per player. Returns an empty
    /// vector if the buffer does not divide evenly (corrupted packet).
    pub fn to_inputs<T: Config>(&self, num_players: usize) -> Vec<GameInput<T::Input>> {
        let mut inputs = Vec::with_capacity(num_players);

        if num_players == 0 || self.bytes.len() % num_players != 0 {
            warn!(
                "input payload of {} byte(s) does not divide into {} player(s)",
                self.bytes.len(),
                num_players
            );
            return inputs;
        }

        let size = self.bytes.len() / num_players;
        for slice in self.bytes.chunks_exact(size) {
            match codec::decode::<T::Input>(slice) {
                Ok((input, _)) => inputs.push(GameInput::new(self.frame, input)),
                Err(e) => {
                    warn!("failed to deserialize a player input: {}", e);
                    return Vec::new();
                },
            }
        }
        inputs
    }
}

// #########
// # TESTS #
// #########
