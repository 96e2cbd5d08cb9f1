//! Tokio-backed transport: a non-blocking socket fed by a background
//! receive task.
//!
//! [`TokioUdpSocket::bind`] returns the socket half (handed to the session)
//! and a [`ReceiveTask`] (handed to a [`BackgroundJobManager`]). The task
//! reads datagrams off the wire, deserializes them, and forwards
//! `(addr, Message)` pairs over an unbounded channel; the session drains the
//! channel on the host thread in `begin_frame`. The task never touches any
//! session state.
//!
//! Outgoing sends happen directly on the shared UDP socket via
//! `try_send_to`: they either complete synchronously or count as a dropped
//! packet, which protocol resend recovers.
//!
//! I/O errors observed on the background task are latched and re-surfaced
//! synchronously from the next session call through
//! [`NonBlockingSocket::take_error`].
//!
//! [`BackgroundJobManager`]: crate::BackgroundJobManager

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::network::codec;
use crate::{network::messages::Message, NonBlockingSocket, TransportError};

const RECV_BUFFER_SIZE: usize = 4096;

/// Shared latch for errors observed off the host thread.
#[derive(Clone, Default)]
pub(crate) struct ErrorLatch {
    inner: Arc<Mutex<Option<std::io::Error>>>,
}

impl ErrorLatch {
    fn set(&self, err: std::io::Error) {
        let mut slot = self.inner.lock();
        // keep the first error; later ones are usually consequences
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn take(&self) -> Option<std::io::Error> {
        self.inner.lock().take()
    }
}

/// The socket half of the tokio transport. Implements
/// [`NonBlockingSocket`]; receive reads from the channel filled by the
/// paired [`ReceiveTask`].
pub struct TokioUdpSocket {
    socket: Arc<UdpSocket>,
    incoming: mpsc::UnboundedReceiver<(SocketAddr, Message)>,
    errors: ErrorLatch,
}

impl std::fmt::Debug for TokioUdpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioUdpSocket")
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}

impl TokioUdpSocket {
    /// Binds a UDP socket and splits it into the session-facing socket and
    /// the background receive task.
    pub async fn bind(addr: impl ToSocketAddrs) -> std::io::Result<(Self, ReceiveTask)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let (tx, rx) = mpsc::unbounded_channel();
        let errors = ErrorLatch::default();

        let task = ReceiveTask {
            socket: Arc::clone(&socket),
            outgoing: tx,
            errors: errors.clone(),
        };
        Ok((
            Self {
                socket,
                incoming: rx,
                errors,
            },
            task,
        ))
    }

    /// The local address the socket is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl NonBlockingSocket<SocketAddr> for TokioUdpSocket {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) -> Result<(), TransportError> {
        let buf = codec::encode(msg).map_err(TransportError::from)?;
        match self.socket.try_send_to(&buf, *addr) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(TransportError::WouldBlock),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
        let mut received = Vec::new();
        while let Ok(pair) = self.incoming.try_recv() {
            received.push(pair);
        }
        received
    }

    fn take_error(&mut self) -> Option<TransportError> {
        self.errors.take().map(TransportError::Io)
    }
}

/// The background half of the tokio transport: an endless receive loop that
/// deserializes datagrams and forwards them to the session's channel.
///
/// Run it under a [`BackgroundJobManager`](crate::BackgroundJobManager):
///
/// ```ignore
/// let (socket, task) = TokioUdpSocket::bind("0.0.0.0:7000").await?;
/// let mut jobs = BackgroundJobManager::new();
/// jobs.spawn(|shutdown| task.run(shutdown));
/// let session = builder.start_p2p_session(socket)?;
/// ```
pub struct ReceiveTask {
    socket: Arc<UdpSocket>,
    outgoing: mpsc::UnboundedSender<(SocketAddr, Message)>,
    errors: ErrorLatch,
}

impl ReceiveTask {
    /// Drives the receive loop until `shutdown` flips to `true` or a fatal
    /// socket error occurs. On cancellation the current receive finishes
    /// (or is abandoned at the next await point) and the task returns.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        debug!("transport receive task started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // a closed channel means the manager is gone; stop too
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("transport receive task stopping");
                        return;
                    }
                },
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, src_addr)) => {
                            match codec::decode::<Message>(&buffer[..len]) {
                                Ok((msg, _)) => {
                                    // the session dropped its socket half;
                                    // nothing left to do
                                    if self.outgoing.send((src_addr, msg)).is_err() {
                                        return;
                                    }
                                },
                                Err(e) => trace!("dropping undecodable datagram: {}", e),
                            }
                        },
                        Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                        Err(e) => {
                            warn!("transport receive failed: {}", e);
                            self.errors.set(e);
                            return;
                        },
                    }
                },
            }
        }
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::messages::{MessageBody, MessageHeader};
    use web_time::Duration;

    fn keep_alive(sequence: u16) -> Message {
        Message {
            header: MessageHeader {
                magic: 0xFEED,
                sequence,
            },
            body: MessageBody::KeepAlive,
        }
    }

    #[tokio::test]
    async fn test_bind_and_local_addr() {
        let (socket, _task) = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        assert!(socket.local_addr().is_ok());
    }

    #[tokio::test]
    async fn test_round_trip_through_background_task() {
        let (mut socket_a, _task_a) = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (mut socket_b, task_b) = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr_b = socket_b.local_addr().unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(task_b.run(shutdown_rx));

        socket_a.send_to(&keep_alive(1), &addr_b).unwrap();

        let mut received = Vec::new();
        for _ in 0..50 {
            received = socket_b.receive_all_messages();
            if !received.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, keep_alive(1));
        assert!(socket_b.take_error().is_none());
        handle.abort();
    }

    #[tokio::test]
    async fn test_shutdown_stops_task() {
        let (_socket, task) = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(task.run(shutdown_rx));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("task should stop after cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn test_error_latch_keeps_first() {
        let latch = ErrorLatch::default();
        latch.set(std::io::Error::new(ErrorKind::Other, "first"));
        latch.set(std::io::Error::new(ErrorKind::Other, "second"));
        assert_eq!(latch.take().unwrap().to_string(), "first");
        assert!(latch.take().is_none());
    }
}
