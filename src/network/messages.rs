use serde::{Deserialize, Serialize};

use crate::Frame;

/// The local view of one player queue's progress: whether the peer feeding
/// it disconnected and the last frame received from it. A copy of the whole
/// table is piggybacked in every outgoing `Input` packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Whether this peer has disconnected.
    pub disconnected: bool,
    /// The last confirmed frame received from this peer.
    pub last_frame: Frame,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            disconnected: false,
            last_frame: Frame::NULL,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct SyncRequest {
    pub random_request: u32, // please reply back with this random data
    // tag fields kept for parity with the classic handshake layout; they are
    // not consulted on receipt
    pub remote_magic: u16,
    pub remote_endpoint: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct SyncReply {
    pub random_reply: u32, // here's your random data back
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Input {
    pub peer_connect_status: Vec<ConnectionStatus>,
    pub disconnect_requested: bool,
    /// First frame of the encoded batch.
    pub start_frame: Frame,
    /// Everything up to this frame has been received from the addressee.
    pub ack_frame: Frame,
    /// Delta + RLE compressed input payload for `start_frame..`.
    pub bytes: Vec<u8>,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            peer_connect_status: Vec::new(),
            disconnect_requested: false,
            start_frame: Frame::NULL,
            ack_frame: Frame::NULL,
            bytes: Vec::new(),
        }
    }
}

impl std::fmt::Debug for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            peer_connect_status,
            disconnect_requested,
            start_frame,
            ack_frame,
            bytes,
        } = self;

        f.debug_struct("Input")
            .field("peer_connect_status", peer_connect_status)
            .field("disconnect_requested", disconnect_requested)
            .field("start_frame", start_frame)
            .field("ack_frame", ack_frame)
            .field("bytes", &BytesDebug(bytes))
            .finish()
    }
}

struct BytesDebug<'a>(&'a [u8]);

impl std::fmt::Debug for BytesDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("0x")?;
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct InputAck {
    pub ack_frame: Frame,
}

impl Default for InputAck {
    fn default() -> Self {
        Self {
            ack_frame: Frame::NULL,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct QualityReport {
    /// Wall-clock send time in milliseconds, echoed back in the reply.
    pub ping_ms: u64,
    /// Sender's frame advantage over the addressee (positive = ahead),
    /// clamped to the i8 range.
    pub frame_advantage: i8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct QualityReply {
    pub pong_ms: u64,
}

/// Every packet starts with this header.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MessageHeader {
    /// Random per-connection tag of the sender; discriminates connection
    /// instances and rejects stale datagrams.
    pub magic: u16,
    /// Monotonically increasing per-peer sequence number. Receivers drop
    /// packets whose sequence is not strictly newer.
    pub sequence: u16,
}

/// The tagged message bodies. The codec writes the variant index as the
/// message-type discriminant, in declaration order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum MessageBody {
    SyncRequest(SyncRequest),
    SyncReply(SyncReply),
    Input(Input),
    InputAck(InputAck),
    QualityReport(QualityReport),
    QualityReply(QualityReply),
    KeepAlive,
}

/// A message that a [`NonBlockingSocket`] sends and receives. Custom
/// transport implementations deserialize received datagrams into this type
/// through [`network::codec`] and hand them to the session.
///
/// [`NonBlockingSocket`]: crate::NonBlockingSocket
/// [`network::codec`]: crate::network::codec
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub(crate) header: MessageHeader,
    pub(crate) body: MessageBody,
}

/// Strictly-newer comparison on wrapping u16 sequence numbers.
pub(crate) fn sequence_newer(incoming: u16, last_seen: u16) -> bool {
    incoming != last_seen && incoming.wrapping_sub(last_seen) < 0x8000
}

// #########
// # TESTS #
// #########
