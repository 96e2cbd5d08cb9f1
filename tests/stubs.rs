//! Shared test fixtures: a deterministic game stub and an in-memory
//! transport for lockstep two-session tests.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use netplay::{
    Config, ConfirmedInputs, Frame, FrameSpan, InputStatus, Message, NonBlockingSocket, PeerEvent,
    PlayerHandle, SessionHandler, TransportError,
};

#[repr(C)]
#[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize, Debug)]
pub struct StubInput {
    pub inp: u32,
}

#[derive(Debug)]
pub struct StubConfig;

impl Config for StubConfig {
    type Input = StubInput;
    type Address = MemoryAddress;
}

#[derive(Debug)]
pub struct SocketConfig;

impl Config for SocketConfig {
    type Input = StubInput;
    type Address = std::net::SocketAddr;
}

/// Deterministic simulation: the state is a frame counter plus a running
/// hash of every input ever applied.
#[derive(Debug, Default)]
pub struct GameStub {
    pub frame: i32,
    pub accum: u64,

    // observability for assertions
    pub loads: usize,
    pub max_rollback_depth: i32,
    pub started: bool,
    pub closed: bool,
    pub time_sync_recommendations: Vec<FrameSpan>,
    pub peer_events: Vec<(PlayerHandle, String)>,
    pub confirmed_frames: Vec<ConfirmedInputs<StubInput>>,
}

impl GameStub {
    pub fn new() -> Self {
        Self::default()
    }

    /// The state transition; used by the handler during rollback and by the
    /// test loop during normal play. Must be identical on every peer.
    pub fn apply(&mut self, inputs: &[(StubInput, InputStatus)]) {
        for (input, _) in inputs {
            self.accum = self
                .accum
                .wrapping_mul(6364136223846793005)
                .wrapping_add(u64::from(input.inp));
        }
        self.frame += 1;
    }
}

impl SessionHandler<StubConfig> for GameStub {
    fn save_state(&mut self, _frame: Frame) -> Vec<u8> {
        let mut data = self.frame.to_be_bytes().to_vec();
        data.extend_from_slice(&self.accum.to_be_bytes());
        data
    }

    fn load_state(&mut self, frame: Frame, state: &[u8]) {
        let depth = self.frame - frame.as_i32();
        self.max_rollback_depth = self.max_rollback_depth.max(depth);
        self.loads += 1;
        self.frame = i32::from_be_bytes(state[0..4].try_into().unwrap());
        self.accum = u64::from_be_bytes(state[4..12].try_into().unwrap());
    }

    fn advance_frame(&mut self, inputs: &[(StubInput, InputStatus)]) {
        self.apply(inputs);
    }

    fn on_session_start(&mut self) {
        self.started = true;
    }

    fn on_session_close(&mut self) {
        self.closed = true;
    }

    fn on_time_sync(&mut self, skip: FrameSpan) {
        self.time_sync_recommendations.push(skip);
    }

    fn on_peer_event(&mut self, player: PlayerHandle, event: PeerEvent<MemoryAddress>) {
        self.peer_events.push((player, format!("{:?}", event)));
    }

    fn on_confirmed_inputs(&mut self, inputs: &ConfirmedInputs<StubInput>) {
        self.confirmed_frames.push(inputs.clone());
    }
}

pub type MemoryAddress = usize;

#[derive(Debug, Clone)]
struct MemoryMsg {
    from: MemoryAddress,
    to: MemoryAddress,
    msg: Message,
}

#[derive(Debug, Default)]
struct MemoryTransportInner {
    messages: Vec<MemoryMsg>,
    /// Links on which delivery is currently suppressed; suppressed messages
    /// are dropped, just like lost datagrams.
    blocked: Vec<(MemoryAddress, MemoryAddress)>,
}

/// A deterministic in-memory datagram network. Sockets share a message
/// vector; links can be blocked to emulate loss.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<MemoryTransportInner>>,
    next_address: Arc<Mutex<MemoryAddress>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_socket(&self) -> MemorySocket {
        let mut next = self.next_address.lock();
        let address = *next;
        *next += 1;
        MemorySocket {
            address,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Drops every message sent from `from` to `to` until unblocked.
    pub fn block(&self, from: MemoryAddress, to: MemoryAddress) {
        self.inner.lock().blocked.push((from, to));
    }

    pub fn unblock(&self, from: MemoryAddress, to: MemoryAddress) {
        self.inner.lock().blocked.retain(|&link| link != (from, to));
    }
}

pub struct MemorySocket {
    address: MemoryAddress,
    inner: Arc<Mutex<MemoryTransportInner>>,
}

impl MemorySocket {
    pub fn address(&self) -> MemoryAddress {
        self.address
    }
}

impl NonBlockingSocket<MemoryAddress> for MemorySocket {
    fn send_to(&mut self, msg: &Message, addr: &MemoryAddress) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if inner.blocked.contains(&(self.address, *addr)) {
            // dropped like a lost datagram; the caller still considers it sent
            return Ok(());
        }
        inner.messages.push(MemoryMsg {
            from: self.address,
            to: *addr,
            msg: msg.clone(),
        });
        Ok(())
    }

    fn receive_all_messages(&mut self) -> Vec<(MemoryAddress, Message)> {
        let mut received = Vec::new();
        self.inner.lock().messages.retain(|entry| {
            if entry.to == self.address {
                received.push((entry.from, entry.msg.clone()));
                false
            } else {
                true
            }
        });
        received
    }
}
