//! The receiving half of a peer connection: datagram filtering, input
//! decoding, and the received-input history.

use std::collections::{BTreeMap, VecDeque};

use tracing::{trace, warn};

use super::event::Event;
use super::payload::FramePayload;
use crate::network::compression::decode;
use crate::network::messages::{sequence_newer, ConnectionStatus, Input, MessageHeader};
use crate::{Config, Frame, PlayerHandle};

/// Owns everything about the incoming direction of one peer connection.
///
/// The inbox filters datagrams (wrong magic, stale sequence), decodes input
/// batches against its received-input history, and publishes one
/// `(player, input)` event per newly seen frame onto the connection's event
/// queue, always in strictly increasing frame order.
pub(crate) struct Inbox<T>
where
    T: Config,
{
    /// The peer's connection magic; 0 until the handshake learned it.
    remote_magic: u16,
    /// Newest sequence number accepted from the peer.
    last_sequence: Option<u16>,
    /// Received payloads by frame; the delta decode reference lives here.
    /// Seeded with the zeroed payload at [`Frame::NULL`].
    recv_inputs: BTreeMap<Frame, FramePayload>,
    /// The peer's own view of every player queue, from its `Input` packets.
    peer_connect_status: Vec<ConnectionStatus>,
    /// How many frames of received history to retain.
    history_frames: i32,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Config> Inbox<T> {
    /// `num_players` is the session-wide player count (for the status
    /// table); `feed_players` is how many players this peer's payloads
    /// carry. Returns `None` if the input type cannot be serialized.
    pub(crate) fn new(num_players: usize, feed_players: usize, history_frames: i32) -> Option<Self> {
        let mut recv_inputs = BTreeMap::new();
        recv_inputs.insert(Frame::NULL, FramePayload::zeroed::<T>(feed_players)?);

        Some(Self {
            remote_magic: 0,
            last_sequence: None,
            recv_inputs,
            peer_connect_status: vec![ConnectionStatus::default(); num_players],
            history_frames,
            _marker: std::marker::PhantomData,
        })
    }

    pub(crate) fn remote_magic(&self) -> u16 {
        self.remote_magic
    }

    pub(crate) fn set_remote_magic(&mut self, magic: u16) {
        self.remote_magic = magic;
    }

    pub(crate) fn peer_connect_status(&self, handle: PlayerHandle) -> ConnectionStatus {
        self.peer_connect_status
            .get(handle.as_usize())
            .copied()
            .unwrap_or_default()
    }

    /// The frame of the newest received input, [`Frame::NULL`] before any.
    pub(crate) fn last_received_frame(&self) -> Frame {
        match self.recv_inputs.keys().next_back() {
            Some(frame) => *frame,
            None => Frame::NULL,
        }
    }

    /// Header admission check: magic and sequence filtering. Accepted
    /// headers advance the sequence watermark.
    pub(crate) fn accepts(&mut self, header: MessageHeader) -> bool {
        if self.remote_magic != 0 && header.magic != self.remote_magic {
            trace!("dropping message with wrong magic");
            return false;
        }
        if let Some(last) = self.last_sequence {
            if !sequence_newer(header.sequence, last) {
                trace!(
                    "dropping stale sequence {} (last accepted {})",
                    header.sequence,
                    last
                );
                return false;
            }
        }
        self.last_sequence = Some(header.sequence);
        true
    }

    /// Processes an `Input` body: updates the peer status view, decodes the
    /// batch, and publishes events for frames not seen before. Returns
    /// `true` if the batch was usable (an ack should be scheduled).
    pub(crate) fn handle_input(
        &mut self,
        body: &Input,
        handles: &[PlayerHandle],
        events: &mut VecDeque<Event<T>>,
    ) -> bool {
        if !body.disconnect_requested {
            // merge the peer's view of every player queue into ours
            for (local, remote) in self
                .peer_connect_status
                .iter_mut()
                .zip(body.peer_connect_status.iter())
            {
                local.disconnected = remote.disconnected || local.disconnected;
                local.last_frame = local.last_frame.max(remote.last_frame);
            }
        }

        // A batch starting beyond the next expected frame cannot be decoded:
        // its delta reference is an input we never received. Normal UDP loss;
        // drop it and wait for the retransmit.
        let last_recv = self.last_received_frame();
        if !last_recv.is_null() && last_recv.next() < body.start_frame {
            trace!(
                "dropping input batch starting at {} (last received {})",
                body.start_frame,
                last_recv
            );
            return false;
        }

        // decode against the input right before the batch (or the zeroed
        // bootstrap payload if nothing was received yet)
        let decode_frame = if last_recv.is_null() {
            Frame::NULL
        } else {
            body.start_frame.prev()
        };
        let Some(reference) = self.recv_inputs.get(&decode_frame) else {
            trace!("no reference payload for frame {}", decode_frame);
            return false;
        };

        let decoded = match decode(&reference.bytes, &body.bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("failed to decode input batch: {}", e);
                return false;
            },
        };

        for (i, bytes) in decoded.into_iter().enumerate() {
            let frame = body.start_frame + i as i32;
            // frames we already have were retransmitted; skip them
            if frame <= self.last_received_frame() {
                continue;
            }

            let payload = FramePayload { frame, bytes };
            let inputs = payload.to_inputs::<T>(handles.len());
            self.recv_inputs.insert(frame, payload);

            for (slot, input) in inputs.into_iter().enumerate() {
                if let Some(&player) = handles.get(slot) {
                    events.push_back(Event::Input { input, player });
                }
            }
        }

        // trim history beyond the retransmit horizon
        let oldest_to_keep = self.last_received_frame() - self.history_frames;
        self.recv_inputs
            .retain(|&frame, _| frame.is_null() || frame >= oldest_to_keep);

        true
    }
}

// #########
// # TESTS #
// #########
