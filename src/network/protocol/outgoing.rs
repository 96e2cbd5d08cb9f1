//! The pending-input window: outgoing inputs not yet acknowledged by the
//! peer, retransmitted as one delta-compressed batch until acked.

use std::collections::VecDeque;

use tracing::warn;

use super::payload::FramePayload;
use crate::network::messages::{ConnectionStatus, Input};
use crate::{Config, Frame};

/// Accumulates outgoing inputs starting right after the last acknowledged
/// frame. Every transmission carries the whole window, so a single arriving
/// packet repairs any amount of loss before it.
pub(crate) struct OutgoingInputs {
    pending: VecDeque<FramePayload>,
    last_acked: FramePayload,
    limit: usize,
}

impl OutgoingInputs {
    /// Returns `None` if the input type cannot be serialized.
    pub(crate) fn new<T: Config>(local_players: usize, limit: usize) -> Option<Self> {
        Some(Self {
            pending: VecDeque::new(),
            last_acked: FramePayload::zeroed::<T>(local_players)?,
            limit,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Appends a frame to the window. Returns `false` when the window
    /// overflowed: the peer has not acknowledged anything for far too long
    /// and should be considered gone.
    #[must_use]
    pub(crate) fn push(&mut self, payload: FramePayload) -> bool {
        self.pending.push_back(payload);
        self.pending.len() <= self.limit
    }

    /// Advances the window past `ack_frame`; the newest acked payload
    /// becomes the delta reference for future batches.
    pub(crate) fn ack(&mut self, ack_frame: Frame) {
        while let Some(front) = self.pending.front() {
            if front.frame <= ack_frame {
                // the unwrap cannot fire, front() just succeeded
                if let Some(acked) = self.pending.pop_front() {
                    self.last_acked = acked;
                }
            } else {
                break;
            }
        }
    }

    /// Builds the `Input` packet carrying the whole pending window, or
    /// `None` while the window is empty.
    pub(crate) fn make_packet(
        &self,
        connect_status: &[ConnectionStatus],
        ack_frame: Frame,
        disconnect_requested: bool,
    ) -> Option<Input> {
        let front = self.pending.front()?;

        // the window must continue seamlessly from the delta reference
        if !self.last_acked.frame.is_null() && self.last_acked.frame.next() != front.frame {
            warn!(
                "pending window out of sequence: last acked {}, window starts at {}",
                self.last_acked.frame, front.frame
            );
            return None;
        }

        let bytes = crate::network::compression::encode(
            &self.last_acked.bytes,
            self.pending.iter().map(|payload| &payload.bytes),
        );

        Some(Input {
            peer_connect_status: connect_status.to_vec(),
            disconnect_requested,
            start_frame: front.frame,
            ack_frame,
            bytes,
        })
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod outgoing_tests {
    use std::net::SocketAddr;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::network::compression::decode;

    #[repr(C)]
    #[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize, Debug)]
    struct TestInput {
        inp: u8,
    }

    struct TestConfig;

    impl crate::Config for TestConfig {
        type Input = TestInput;
        type Address = SocketAddr;
    }

    fn payload(frame: i32, value: u8) -> FramePayload {
        FramePayload {
            frame: Frame::new(frame),
            bytes: vec![value],
        }
    }

    #[test]
    fn test_window_accumulates_until_acked() {
        let mut outgoing = OutgoingInputs::new::<TestConfig>(1, 64).unwrap();
        assert!(outgoing.push(payload(0, 1)));
        assert!(outgoing.push(payload(1, 2)));
        assert!(outgoing.push(payload(2, 3)));
        assert_eq!(outgoing.len(), 3);

        outgoing.ack(Frame::new(1));
        assert_eq!(outgoing.len(), 1);

        // the newest acked frame is now the delta reference
        assert_eq!(outgoing.last_acked.frame, Frame::new(1));
    }

    #[test]
    fn test_packet_covers_whole_window() {
        let mut outgoing = OutgoingInputs::new::<TestConfig>(1, 64).unwrap();
        let _ = outgoing.push(payload(0, 5));
        let _ = outgoing.push(payload(1, 6));

        let packet = outgoing
            .make_packet(&[ConnectionStatus::default()], Frame::new(9), false)
            .unwrap();
        assert_eq!(packet.start_frame, Frame::ZERO);
        assert_eq!(packet.ack_frame, Frame::new(9));

        let decoded = decode(&[0u8], &packet.bytes).unwrap();
        assert_eq!(decoded, vec![vec![5u8], vec![6u8]]);
    }

    #[test]
    fn test_empty_window_makes_no_packet() {
        let outgoing = OutgoingInputs::new::<TestConfig>(1, 64).unwrap();
        assert!(outgoing.make_packet(&[], Frame::NULL, false).is_none());
    }

    #[test]
    fn test_overflow_reported() {
        let mut outgoing = OutgoingInputs::new::<TestConfig>(1, 2).unwrap();
        assert!(outgoing.push(payload(0, 1)));
        assert!(outgoing.push(payload(1, 1)));
        assert!(!outgoing.push(payload(2, 1)));
    }

    #[test]
    fn test_ack_of_everything_empties_window() {
        let mut outgoing = OutgoingInputs::new::<TestConfig>(1, 64).unwrap();
        let _ = outgoing.push(payload(0, 1));
        let _ = outgoing.push(payload(1, 2));
        outgoing.ack(Frame::new(50));
        assert_eq!(outgoing.len(), 0);
        assert!(outgoing.make_packet(&[], Frame::NULL, false).is_none());
    }
}
