//! The sending half of a peer connection: header stamping, the send queue,
//! and transmission accounting.

use std::collections::VecDeque;

use tracing::trace;
use web_time::Instant;

use crate::network::messages::{Message, MessageBody, MessageHeader};
use crate::NonBlockingSocket;

/// Owns everything about the outgoing direction of one peer connection.
///
/// Every queued message is stamped with the local connection magic and a
/// monotonically increasing sequence number; the receiving side uses both
/// to drop stale datagrams.
pub(crate) struct Outbox {
    magic: u16,
    next_sequence: u16,
    queue: VecDeque<Message>,
    last_send_time: Instant,
    packets_sent: usize,
    bytes_sent: usize,
    dropped_sends: usize,
}

impl Outbox {
    pub(crate) fn new(magic: u16) -> Self {
        Self {
            magic,
            next_sequence: 0,
            queue: VecDeque::new(),
            last_send_time: Instant::now(),
            packets_sent: 0,
            bytes_sent: 0,
            dropped_sends: 0,
        }
    }

    pub(crate) fn magic(&self) -> u16 {
        self.magic
    }

    pub(crate) fn last_send_time(&self) -> Instant {
        self.last_send_time
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn packets_sent(&self) -> usize {
        self.packets_sent
    }

    pub(crate) fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    /// Stamps a header onto the body and queues the message.
    pub(crate) fn push(&mut self, body: MessageBody) {
        self.next_sequence = self.next_sequence.wrapping_add(1);
        let header = MessageHeader {
            magic: self.magic,
            sequence: self.next_sequence,
        };
        let msg = Message { header, body };

        self.packets_sent += 1;
        self.last_send_time = Instant::now();
        self.bytes_sent += std::mem::size_of_val(&msg);
        self.queue.push_back(msg);
    }

    /// Sends all queued messages to `addr`. Failed sends are counted and
    /// dropped; resend recovers anything that mattered. Returns the number
    /// of messages dropped by this flush.
    pub(crate) fn flush<A, S>(&mut self, socket: &mut S, addr: &A) -> usize
    where
        A: Clone + PartialEq + Eq + std::hash::Hash + Send + Sync,
        S: NonBlockingSocket<A> + ?Sized,
    {
        let mut dropped = 0;
        for msg in self.queue.drain(..) {
            if let Err(e) = socket.send_to(&msg, addr) {
                trace!("dropping outgoing message: {}", e);
                dropped += 1;
            }
        }
        self.dropped_sends += dropped;
        dropped
    }

    /// Drops all queued messages without sending (shutdown path).
    pub(crate) fn discard_queued(&mut self) {
        if !self.queue.is_empty() {
            trace!("discarding {} queued message(s)", self.queue.len());
            self.queue.clear();
        }
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod outbox_tests {
    use super::*;
    use crate::TransportError;

    #[derive(Default)]
    struct RecordingSocket {
        sent: Vec<(u64, Message)>,
        fail: bool,
    }

    impl NonBlockingSocket<u64> for RecordingSocket {
        fn send_to(&mut self, msg: &Message, addr: &u64) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::WouldBlock);
            }
            self.sent.push((*addr, msg.clone()));
            Ok(())
        }

        fn receive_all_messages(&mut self) -> Vec<(u64, Message)> {
            Vec::new()
        }
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let mut outbox = Outbox::new(0x77);
        let mut socket = RecordingSocket::default();

        outbox.push(MessageBody::KeepAlive);
        outbox.push(MessageBody::KeepAlive);
        outbox.push(MessageBody::KeepAlive);
        assert_eq!(outbox.flush(&mut socket, &1), 0);

        let sequences: Vec<u16> = socket.sent.iter().map(|(_, m)| m.header.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert!(socket.sent.iter().all(|(_, m)| m.header.magic == 0x77));
    }

    #[test]
    fn test_failed_sends_counted() {
        let mut outbox = Outbox::new(1);
        let mut socket = RecordingSocket {
            fail: true,
            ..RecordingSocket::default()
        };

        outbox.push(MessageBody::KeepAlive);
        assert_eq!(outbox.flush(&mut socket, &1), 1);
        assert_eq!(outbox.queue_len(), 0);
    }

    #[test]
    fn test_discard_queued() {
        let mut outbox = Outbox::new(1);
        outbox.push(MessageBody::KeepAlive);
        outbox.discard_queued();
        assert_eq!(outbox.queue_len(), 0);
    }
}
