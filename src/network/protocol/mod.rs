//! The per-peer wire protocol: handshake, input exchange, quality reports,
//! keep-alives, and disconnect detection.

mod event;
mod handshake;
mod inbox;
mod outbox;
mod outgoing;
mod payload;
mod state;

pub(crate) use event::Event;
pub use state::ProtocolState;
use payload::FramePayload;

use std::collections::{BTreeMap, VecDeque};
use std::collections::vec_deque::Drain;
use std::sync::Arc;

use tracing::trace;
use web_time::{Duration, Instant};

use crate::frame_info::GameInput;
use crate::network::messages::{
    ConnectionStatus, InputAck, Message, MessageBody, QualityReply, QualityReport,
};
use crate::network::network_stats::NetworkStats;
use crate::sessions::config::{ProtocolConfig, SyncConfig};
use crate::time_sync::{TimeSync, TimeSyncConfig};
use crate::{Config, Frame, NetplayError, NonBlockingSocket, PlayerHandle};

use handshake::{Handshake, SyncProgress};
use inbox::Inbox;
use outbox::Outbox;
use outgoing::OutgoingInputs;

const UDP_HEADER_SIZE: usize = 28; // size of IP + UDP headers

/// Wall-clock milliseconds since UNIX_EPOCH, used only for values that must
/// be comparable across a roundtrip (quality report ping/pong). `None` when
/// the system clock is in an abnormal state (NTP rewind, stale VM snapshot).
fn millis_since_epoch() -> Option<u64> {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(duration) => Some(duration.as_millis() as u64),
        Err(_) => {
            trace!("system clock is before UNIX_EPOCH, skipping timestamp");
            None
        },
    }
}

/// One peer of the session, driving the wire protocol state machine
/// `Syncing -> Running -> Disconnected` and composing the four protocol
/// subcomponents: [`Handshake`], [`Outbox`], [`Inbox`], [`OutgoingInputs`].
///
/// The session calls [`handle_message`](Self::handle_message) for every
/// datagram from this peer's address, [`poll`](Self::poll) once per tick to
/// drive timers and collect events, [`send_input`](Self::send_input) to
/// transmit local inputs, and [`send_all_messages`](Self::send_all_messages)
/// to flush the outbox.
pub(crate) struct PeerConnection<T>
where
    T: Config,
{
    /// The player queues this peer feeds, in ascending order.
    handles: Arc<[PlayerHandle]>,
    /// The player handles whose inputs we transmit to this peer.
    send_handles: Arc<[PlayerHandle]>,
    peer_addr: T::Address,
    state: ProtocolState,

    handshake: Handshake,
    outbox: Outbox,
    inbox: Inbox<T>,
    outgoing: OutgoingInputs,
    event_queue: VecDeque<Event<T>>,

    sync_config: SyncConfig,
    protocol_config: ProtocolConfig,
    fps: usize,

    last_recv_time: Instant,
    last_input_recv_time: Instant,
    last_quality_report: Instant,
    shutdown_at: Instant,
    stats_start: Instant,
    connected_event_sent: bool,
    interrupted_notice_sent: bool,
    disconnect_event_sent: bool,

    time_sync: TimeSync,
    local_frame_advantage: i32,
    remote_frame_advantage: i32,
    round_trip_time: Duration,
}

impl<T: Config> PartialEq for PeerConnection<T> {
    fn eq(&self, other: &Self) -> bool {
        self.peer_addr == other.peer_addr
    }
}

impl<T: Config> PeerConnection<T> {
    /// `handles` are the queues this peer feeds; `send_handles` the players
    /// whose inputs are transmitted to it (the local players for a remote
    /// peer, every player for a spectator). Returns `None` if the input type
    /// cannot be serialized.
    pub(crate) fn new(
        mut handles: Vec<PlayerHandle>,
        mut send_handles: Vec<PlayerHandle>,
        peer_addr: T::Address,
        num_players: usize,
        max_prediction: usize,
        fps: usize,
        sync_config: SyncConfig,
        protocol_config: ProtocolConfig,
        time_sync_config: TimeSyncConfig,
    ) -> Option<Self> {
        // non-zero random magic tags this connection instance
        let mut magic: u16 = rand::random();
        while magic == 0 {
            magic = rand::random();
        }

        handles.sort_unstable();
        send_handles.sort_unstable();

        let history_frames =
            (protocol_config.input_history_multiplier * max_prediction.max(1)) as i32;
        let inbox = Inbox::new(num_players, handles.len(), history_frames)?;
        let outgoing =
            OutgoingInputs::new::<T>(send_handles.len(), protocol_config.pending_input_limit)?;

        let now = Instant::now();
        Some(Self {
            handles: handles.into(),
            send_handles: send_handles.into(),
            peer_addr,
            state: ProtocolState::Initializing,

            handshake: Handshake::new(sync_config.num_sync_packets, sync_config.handshake_timeout),
            outbox: Outbox::new(magic),
            inbox,
            outgoing,
            event_queue: VecDeque::new(),

            sync_config,
            protocol_config,
            fps,

            last_recv_time: now,
            last_input_recv_time: now,
            last_quality_report: now,
            shutdown_at: now,
            stats_start: now,
            connected_event_sent: false,
            interrupted_notice_sent: false,
            disconnect_event_sent: false,

            time_sync: TimeSync::with_config(time_sync_config),
            local_frame_advantage: 0,
            remote_frame_advantage: 0,
            round_trip_time: Duration::ZERO,
        })
    }

    pub(crate) fn handles(&self) -> Arc<[PlayerHandle]> {
        Arc::clone(&self.handles)
    }

    pub(crate) fn peer_addr(&self) -> T::Address {
        self.peer_addr.clone()
    }

    pub(crate) fn is_handling_message(&self, addr: &T::Address) -> bool {
        self.peer_addr == *addr
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state == ProtocolState::Running
    }

    /// Whether the initial synchronization no longer blocks on this peer
    /// (completed, or the peer is gone).
    pub(crate) fn is_synchronized(&self) -> bool {
        matches!(
            self.state,
            ProtocolState::Running | ProtocolState::Disconnected | ProtocolState::Shutdown
        )
    }

    pub(crate) fn peer_connect_status(&self, handle: PlayerHandle) -> ConnectionStatus {
        self.inbox.peer_connect_status(handle)
    }

    /// Starts the handshake. Only valid once, from `Initializing`.
    pub(crate) fn synchronize(&mut self) -> Result<(), NetplayError> {
        if self.state != ProtocolState::Initializing {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "cannot synchronize a connection in state {}",
                    self.state
                ),
            });
        }
        self.state = ProtocolState::Syncing;
        self.handshake.begin();
        self.stats_start = Instant::now();
        self.send_sync_request();
        Ok(())
    }

    /// Tears the connection down; queued messages get a grace period to
    /// drain before the endpoint goes inert.
    pub(crate) fn disconnect(&mut self) {
        if self.state == ProtocolState::Shutdown {
            return;
        }
        self.state = ProtocolState::Disconnected;
        self.shutdown_at = Instant::now() + self.protocol_config.shutdown_delay;
    }

    /// Publishes the local simulation frame so quality reports carry a
    /// current advantage value. The remote frame is estimated from the last
    /// received input plus half a roundtrip.
    pub(crate) fn update_local_frame_advantage(&mut self, local_frame: Frame) {
        let last_recv = self.inbox.last_received_frame();
        if local_frame.is_null() || last_recv.is_null() {
            return;
        }
        let ping_ms = i32::try_from(self.round_trip_time.as_millis() / 2).unwrap_or(i32::MAX);
        let remote_frame = last_recv + (ping_ms.saturating_mul(self.fps as i32)) / 1000;
        self.local_frame_advantage = local_frame - remote_frame;
    }

    /// Frames the local client should idle to let this peer catch up.
    pub(crate) fn recommended_wait(&self) -> u32 {
        self.time_sync.recommended_wait()
    }

    pub(crate) fn network_stats(&self) -> Result<NetworkStats, NetplayError> {
        if self.state != ProtocolState::Syncing && self.state != ProtocolState::Running {
            return Err(NetplayError::NotSynchronized);
        }

        let seconds = self.stats_start.elapsed().as_secs();
        if seconds == 0 {
            return Err(NetplayError::NotSynchronized);
        }

        let total_bytes_sent =
            self.outbox.bytes_sent() + self.outbox.packets_sent() * UDP_HEADER_SIZE;
        Ok(NetworkStats {
            ping: self.round_trip_time,
            send_queue_len: self.outgoing.len(),
            kbps_sent: total_bytes_sent / seconds as usize / 1024,
            local_frame_advantage: self.local_frame_advantage,
            remote_frame_advantage: self.remote_frame_advantage,
        })
    }

    /// Drives protocol timers for the current state and drains the events
    /// that accumulated since the last poll.
    pub(crate) fn poll(&mut self, connect_status: &[ConnectionStatus]) -> Drain<'_, Event<T>> {
        let now = Instant::now();
        match self.state {
            ProtocolState::Syncing => {
                if self.handshake.check_timeout() {
                    self.event_queue.push_back(Event::SyncFailure);
                }
                // no reply for a while, fire another request
                if self.outbox.last_send_time() + self.sync_config.sync_retry_interval < now {
                    self.send_sync_request();
                }
            },
            ProtocolState::Running => {
                // resend the pending input window if the peer went quiet
                if self.last_input_recv_time + self.sync_config.resend_interval < now {
                    self.send_pending_inputs(connect_status);
                    self.last_input_recv_time = now;
                }

                if self.last_quality_report + self.protocol_config.quality_report_interval < now {
                    self.send_quality_report();
                }

                if self.outbox.last_send_time() + self.sync_config.keepalive_interval < now {
                    trace!("sending keep alive to {:?}", self.peer_addr);
                    self.outbox.push(MessageBody::KeepAlive);
                }

                if !self.interrupted_notice_sent
                    && self.last_recv_time + self.protocol_config.disconnect_notify_start < now
                {
                    let remaining = self.protocol_config.disconnect_timeout
                        - self.protocol_config.disconnect_notify_start;
                    self.event_queue.push_back(Event::NetworkInterrupted {
                        disconnect_timeout: remaining,
                    });
                    self.interrupted_notice_sent = true;
                }

                if !self.disconnect_event_sent
                    && self.last_recv_time + self.protocol_config.disconnect_timeout < now
                {
                    self.event_queue.push_back(Event::Disconnected);
                    self.disconnect_event_sent = true;
                }
            },
            ProtocolState::Disconnected => {
                if self.shutdown_at < now {
                    self.state = ProtocolState::Shutdown;
                }
            },
            ProtocolState::Initializing | ProtocolState::Shutdown => (),
        }
        self.event_queue.drain(..)
    }

    /// Registers the local inputs of one frame for transmission and sends
    /// the pending window.
    pub(crate) fn send_input(
        &mut self,
        inputs: &BTreeMap<PlayerHandle, GameInput<T::Input>>,
        connect_status: &[ConnectionStatus],
    ) {
        if self.state != ProtocolState::Running {
            return;
        }

        let payload = FramePayload::from_inputs::<T>(&self.send_handles, inputs);

        self.time_sync.advance_frame(
            payload.frame,
            self.local_frame_advantage,
            self.remote_frame_advantage,
        );

        // A peer that stopped acking for a whole window's worth of inputs is
        // gone (a spectator that fell off); force the disconnect.
        if !self.outgoing.push(payload) && !self.disconnect_event_sent {
            self.event_queue.push_back(Event::Disconnected);
            self.disconnect_event_sent = true;
        }

        self.send_pending_inputs(connect_status);
    }

    /// Flushes all queued messages onto the socket. Returns the number of
    /// messages that could not be sent.
    pub(crate) fn send_all_messages(
        &mut self,
        socket: &mut Box<dyn NonBlockingSocket<T::Address>>,
    ) -> usize {
        if self.state == ProtocolState::Shutdown {
            self.outbox.discard_queued();
            return 0;
        }
        self.outbox.flush(socket.as_mut(), &self.peer_addr)
    }

    /// Dispatches a datagram received from this peer's address.
    pub(crate) fn handle_message(&mut self, msg: &Message) {
        if self.state == ProtocolState::Shutdown {
            return;
        }
        if !self.inbox.accepts(msg.header) {
            return;
        }

        self.last_recv_time = Instant::now();

        if !self.connected_event_sent {
            self.event_queue.push_back(Event::Connected);
            self.connected_event_sent = true;
        }

        // traffic resumed after an interruption notice
        if self.interrupted_notice_sent && self.state == ProtocolState::Running {
            self.interrupted_notice_sent = false;
            self.event_queue.push_back(Event::NetworkResumed);
        }

        match &msg.body {
            MessageBody::SyncRequest(body) => {
                self.outbox
                    .push(MessageBody::SyncReply(Handshake::reply_to(*body)));
            },
            MessageBody::SyncReply(body) => {
                if self.state != ProtocolState::Syncing {
                    return;
                }
                match self.handshake.on_reply(*body) {
                    SyncProgress::Ignored => (),
                    SyncProgress::Step { count, total } => {
                        self.event_queue.push_back(Event::Synchronizing { total, count });
                        self.send_sync_request();
                    },
                    SyncProgress::Finished { elapsed } => {
                        self.state = ProtocolState::Running;
                        // the remote endpoint is now authorized
                        self.inbox.set_remote_magic(msg.header.magic);
                        let roundtrips = self.handshake.total_roundtrips().max(1);
                        self.event_queue.push_back(Event::Synchronized {
                            ping: elapsed / roundtrips,
                        });
                    },
                }
            },
            MessageBody::Input(body) => {
                self.outgoing.ack(body.ack_frame);

                if body.disconnect_requested {
                    if self.state != ProtocolState::Disconnected && !self.disconnect_event_sent {
                        self.event_queue.push_back(Event::Disconnected);
                        self.disconnect_event_sent = true;
                    }
                    return;
                }

                let handles = Arc::clone(&self.handles);
                if self.inbox.handle_input(body, &handles, &mut self.event_queue) {
                    self.last_input_recv_time = Instant::now();
                    self.outbox.push(MessageBody::InputAck(InputAck {
                        ack_frame: self.inbox.last_received_frame(),
                    }));
                }
            },
            MessageBody::InputAck(body) => {
                self.outgoing.ack(body.ack_frame);
            },
            MessageBody::QualityReport(body) => {
                self.remote_frame_advantage = i32::from(body.frame_advantage);
                self.outbox.push(MessageBody::QualityReply(QualityReply {
                    pong_ms: body.ping_ms,
                }));
            },
            MessageBody::QualityReply(body) => {
                if let Some(now_ms) = millis_since_epoch() {
                    self.round_trip_time =
                        Duration::from_millis(now_ms.saturating_sub(body.pong_ms));
                }
            },
            MessageBody::KeepAlive => (),
        }
    }

    fn send_sync_request(&mut self) {
        let request = self.handshake.next_request(self.inbox.remote_magic());
        self.outbox.push(MessageBody::SyncRequest(request));
    }

    fn send_pending_inputs(&mut self, connect_status: &[ConnectionStatus]) {
        let disconnect_requested = self.state == ProtocolState::Disconnected;
        if let Some(body) = self.outgoing.make_packet(
            connect_status,
            self.inbox.last_received_frame(),
            disconnect_requested,
        ) {
            self.outbox.push(MessageBody::Input(body));
        }
    }

    fn send_quality_report(&mut self) {
        self.last_quality_report = Instant::now();

        // If the clock is broken, skip this report; the next cycle retries.
        let Some(ping_ms) = millis_since_epoch() else {
            return;
        };

        let advantage = self
            .local_frame_advantage
            .clamp(i32::from(i8::MIN), i32::from(i8::MAX)) as i8;
        self.outbox.push(MessageBody::QualityReport(QualityReport {
            ping_ms,
            frame_advantage: advantage,
        }));
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod protocol_tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::TransportError;

    #[repr(C)]
    #[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize, Debug)]
    struct TestInput {
        inp: u8,
    }

    #[derive(Debug)]
    struct TestConfig;

    impl Config for TestConfig {
        type Input = TestInput;
        type Address = SocketAddr;
    }

    #[derive(Default)]
    struct CollectingSocket {
        sent: Vec<(SocketAddr, Message)>,
    }

    impl NonBlockingSocket<SocketAddr> for CollectingSocket {
        fn send_to(&mut self, msg: &Message, addr: &SocketAddr) -> Result<(), TransportError> {
            self.sent.push((*addr, msg.clone()));
            Ok(())
        }

        fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
            Vec::new()
        }
    }

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn connection(port: u16) -> PeerConnection<TestConfig> {
        PeerConnection::new(
            vec![PlayerHandle::new(1)],
            vec![PlayerHandle::new(0)],
            test_addr(port),
            2,
            8,
            60,
            SyncConfig::default(),
            ProtocolConfig::default(),
            TimeSyncConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_new_connection_is_initializing() {
        let conn = connection(7000);
        assert_eq!(conn.state, ProtocolState::Initializing);
        assert!(!conn.is_running());
        assert!(!conn.is_synchronized());
    }

    #[test]
    fn test_synchronize_transitions_to_syncing() {
        let mut conn = connection(7000);
        assert!(conn.synchronize().is_ok());
        assert_eq!(conn.state, ProtocolState::Syncing);
        // a second synchronize call is a contract violation
        assert!(conn.synchronize().is_err());
    }

    #[test]
    fn test_sync_request_answered_with_reply() {
        let mut a = connection(7000);
        let mut b = connection(7001);
        a.synchronize().unwrap();

        let mut socket = CollectingSocket::default();
        a.outbox.flush(&mut socket, &test_addr(7001));
        assert_eq!(socket.sent.len(), 1);
        let request = &socket.sent[0].1;
        assert!(matches!(request.body, MessageBody::SyncRequest(_)));

        b.handle_message(request);
        let mut socket = CollectingSocket::default();
        b.outbox.flush(&mut socket, &test_addr(7000));
        assert!(matches!(socket.sent[0].1.body, MessageBody::SyncReply(_)));
    }

    #[test]
    fn test_full_handshake_reaches_running() {
        let mut a = connection(7000);
        let mut b = connection(7001);
        a.synchronize().unwrap();
        b.synchronize().unwrap();

        let status = vec![ConnectionStatus::default(); 2];
        for _ in 0..16 {
            let mut socket = CollectingSocket::default();
            a.outbox.flush(&mut socket, &test_addr(7001));
            for (_, msg) in &socket.sent {
                b.handle_message(msg);
            }
            let mut socket = CollectingSocket::default();
            b.outbox.flush(&mut socket, &test_addr(7000));
            for (_, msg) in &socket.sent {
                a.handle_message(msg);
            }
            let _ = a.poll(&status).count();
            let _ = b.poll(&status).count();
            if a.is_running() && b.is_running() {
                break;
            }
        }

        assert!(a.is_running());
        assert!(b.is_running());
        assert_eq!(a.inbox.remote_magic(), b.outbox.magic());
        assert_eq!(b.inbox.remote_magic(), a.outbox.magic());
    }

    #[test]
    fn test_wrong_magic_rejected_after_sync() {
        let mut conn = connection(7000);
        conn.inbox.set_remote_magic(0x1234);
        conn.state = ProtocolState::Running;

        let stale = Message {
            header: crate::network::messages::MessageHeader {
                magic: 0x9999,
                sequence: 1,
            },
            body: MessageBody::KeepAlive,
        };
        conn.handle_message(&stale);
        // nothing happened: no events, no replies queued
        assert!(conn.event_queue.is_empty());
        assert_eq!(conn.outbox.queue_len(), 0);
    }

    #[test]
    fn test_input_exchange_after_handshake() {
        let mut a = connection(7000);
        let mut b = connection(7001);
        a.synchronize().unwrap();
        b.synchronize().unwrap();
        // drive both to running
        let status = vec![ConnectionStatus::default(); 2];
        for _ in 0..16 {
            let mut sa = CollectingSocket::default();
            a.outbox.flush(&mut sa, &test_addr(7001));
            for (_, msg) in &sa.sent {
                b.handle_message(msg);
            }
            let mut sb = CollectingSocket::default();
            b.outbox.flush(&mut sb, &test_addr(7000));
            for (_, msg) in &sb.sent {
                a.handle_message(msg);
            }
            if a.is_running() && b.is_running() {
                break;
            }
        }
        let _ = a.poll(&status).count();
        let _ = b.poll(&status).count();

        // a sends its local player 0 input for frame 0
        let mut inputs = BTreeMap::new();
        inputs.insert(
            PlayerHandle::new(0),
            GameInput::new(Frame::ZERO, TestInput { inp: 42 }),
        );
        a.send_input(&inputs, &status);

        let mut socket = CollectingSocket::default();
        a.outbox.flush(&mut socket, &test_addr(7001));
        for (_, msg) in &socket.sent {
            b.handle_message(msg);
        }

        let events: Vec<Event<TestConfig>> = b.poll(&status).collect();
        let received: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::Input { input, player } => Some((*player, input.frame, input.input.inp)),
                _ => None,
            })
            .collect();
        assert_eq!(received, vec![(PlayerHandle::new(1), Frame::ZERO, 42)]);

        // and b acked it
        let mut socket = CollectingSocket::default();
        b.outbox.flush(&mut socket, &test_addr(7000));
        assert!(socket
            .sent
            .iter()
            .any(|(_, msg)| matches!(msg.body, MessageBody::InputAck(_))));
    }

    #[test]
    fn test_quality_report_generates_reply() {
        let mut conn = connection(7000);
        conn.state = ProtocolState::Running;

        let report = Message {
            header: crate::network::messages::MessageHeader {
                magic: 5,
                sequence: 1,
            },
            body: MessageBody::QualityReport(QualityReport {
                ping_ms: 1234,
                frame_advantage: -3,
            }),
        };
        conn.handle_message(&report);

        assert_eq!(conn.remote_frame_advantage, -3);
        let mut socket = CollectingSocket::default();
        conn.outbox.flush(&mut socket, &test_addr(7000));
        assert!(socket.sent.iter().any(|(_, msg)| matches!(
            msg.body,
            MessageBody::QualityReply(QualityReply { pong_ms: 1234 })
        )));
    }

    #[test]
    fn test_disconnect_schedules_shutdown() {
        let mut conn = connection(7000);
        conn.state = ProtocolState::Running;
        conn.disconnect();
        assert_eq!(conn.state, ProtocolState::Disconnected);
        assert!(conn.is_synchronized()); // no longer blocks the sync gate
    }

    #[test]
    fn test_messages_dropped_after_shutdown() {
        let mut conn = connection(7000);
        conn.state = ProtocolState::Shutdown;
        let msg = Message {
            header: crate::network::messages::MessageHeader { magic: 1, sequence: 1 },
            body: MessageBody::KeepAlive,
        };
        conn.handle_message(&msg);
        assert!(conn.event_queue.is_empty());
    }

    #[test]
    fn test_local_frame_advantage_estimation() {
        let mut conn = connection(7000);
        conn.state = ProtocolState::Running;
        // nothing received yet: no estimate possible
        conn.update_local_frame_advantage(Frame::new(10));
        assert_eq!(conn.local_frame_advantage, 0);
    }
}
