use smallvec::SmallVec;

use crate::{Frame, MAX_PLAYERS};

/// An input of a single player for a single frame.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct GameInput<I>
where
    I: Copy + Clone + PartialEq,
{
    /// The frame this input belongs to. [`Frame::NULL`] represents an
    /// invalid frame.
    pub frame: Frame,
    /// The input value given by the host.
    pub input: I,
}

impl<I: Copy + Clone + PartialEq + Default> GameInput<I> {
    /// Creates a new `GameInput` with the given frame and input.
    pub fn new(frame: Frame, input: I) -> Self {
        Self { frame, input }
    }

    /// Creates a blank input carrying the default ("no input") value.
    #[must_use]
    pub fn blank(frame: Frame) -> Self {
        Self {
            frame,
            input: I::default(),
        }
    }

    /// Bitwise input comparison; with `input_only` the frame numbers are not
    /// required to match.
    pub(crate) fn equal(&self, other: &Self, input_only: bool) -> bool {
        (input_only || self.frame == other.frame) && self.input == other.input
    }
}

/// The inputs of every player for one frame, emitted only once all of them
/// are confirmed.
///
/// Spectators and replay recordings are fed exclusively from these.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedInputs<I>
where
    I: Copy + Clone + PartialEq,
{
    /// The frame these inputs belong to.
    pub frame: Frame,
    /// One input per player, in handle order. Inline capacity covers
    /// [`MAX_PLAYERS`].
    pub inputs: SmallVec<[I; MAX_PLAYERS]>,
}

impl<I: Copy + Clone + PartialEq> ConfirmedInputs<I> {
    /// Creates a confirmed input set for `frame`.
    pub fn new(frame: Frame, inputs: impl IntoIterator<Item = I>) -> Self {
        Self {
            frame,
            inputs: inputs.into_iter().collect(),
        }
    }

    /// Creates a set for `frame` with no inputs collected yet.
    #[must_use]
    pub fn empty(frame: Frame) -> Self {
        Self {
            frame,
            inputs: SmallVec::new(),
        }
    }

    /// The number of players covered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    /// Returns `true` if no player inputs are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

// #########
// # TESTS #
// #########


#[cfg(test)]
mod confirmed_inputs_tests {
    use super::*;

    #[test]
    fn test_confirmed_inputs_len() {
        let set = ConfirmedInputs::new(Frame::new(2), [1u8, 2u8]);
        assert_eq!(set.len(), 2);
        assert!(!set.is_empty());
        assert_eq!(set.frame, Frame::new(2));
    }

    #[test]
    fn test_confirmed_inputs_empty() {
        let set = ConfirmedInputs::<u8>::new(Frame::ZERO, []);
        assert!(set.is_empty());
    }
}
