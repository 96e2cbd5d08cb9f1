use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
};

use tracing::warn;

use crate::network::codec;
use crate::{network::messages::Message, NonBlockingSocket, TransportError};

const RECV_BUFFER_SIZE: usize = 4096;
/// A packet larger than this may be fragmented, so ideally no packet should
/// exceed it.
/// Source: <https://stackoverflow.com/a/35697810/775982>
const IDEAL_MAX_UDP_PACKET_SIZE: usize = 508;

/// A simple non-blocking UDP socket for netplay sessions. Listens on
/// 0.0.0.0 at a given port; the session itself drains it once per tick.
#[derive(Debug)]
pub struct UdpNonBlockingSocket {
    socket: UdpSocket,
    buffer: [u8; RECV_BUFFER_SIZE],
}

impl UdpNonBlockingSocket {
    /// Binds a UDP socket to `0.0.0.0:port` and sets it to non-blocking
    /// mode.
    pub fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            buffer: [0; RECV_BUFFER_SIZE],
        })
    }

    /// The local address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }
}

impl NonBlockingSocket<SocketAddr> for UdpNonBlockingSocket {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) -> Result<(), TransportError> {
        let buf = codec::encode(msg).map_err(TransportError::from)?;

        // An oversized packet risks fragmentation, which multiplies the
        // chance of loss. The usual cause is an input struct that is too
        // large or compresses poorly; the host should know about it.
        if buf.len() > IDEAL_MAX_UDP_PACKET_SIZE {
            warn!(
                "sending UDP packet of {} bytes, larger than the ideal {}",
                buf.len(),
                IDEAL_MAX_UDP_PACKET_SIZE
            );
        }

        match self.socket.send_to(&buf, addr) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(TransportError::WouldBlock),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
        let mut received_messages = Vec::new();
        loop {
            match self.socket.recv_from(&mut self.buffer) {
                Ok((number_of_bytes, src_addr)) => {
                    debug_assert!(number_of_bytes <= RECV_BUFFER_SIZE);
                    // garbage datagrams are silently dropped
                    if let Ok((msg, _)) = codec::decode(&self.buffer[0..number_of_bytes]) {
                        received_messages.push((src_addr, msg));
                    }
                },
                // no more messages
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return received_messages,
                // datagram sockets report this after send_to on some platforms
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    warn!("unexpected socket error: {:?}: {}", err.kind(), err);
                    return received_messages;
                },
            }
        }
    }
}

// #########
// # TESTS #
// #########
