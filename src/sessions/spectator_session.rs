use tracing::warn;

use crate::frame_info::GameInput;
use crate::network::messages::ConnectionStatus;
use crate::network::network_stats::NetworkStats;
use crate::network::protocol::{Event, PeerConnection};
use crate::{
    Config, Frame, InputStatus, InputVec, NetplayError, NonBlockingSocket, PeerEvent, PlayerHandle,
    SessionHandler, SessionState,
};

/// A spectator session: a single upstream peer in place of a full mesh.
///
/// The host of the watched session broadcasts every confirmed frame; a
/// spectator never contributes input, never predicts, and never rolls back.
/// The host-side call pattern maps onto the same four calls as
/// [`P2PSession`](crate::P2PSession), with `save_state`/`load_state` never
/// invoked.
pub struct SpectatorSession<T>
where
    T: Config,
{
    state: SessionState,
    num_players: usize,
    buffer_size: usize,
    /// Ring of received confirmed inputs, keyed by `frame % buffer_size`.
    inputs: Vec<Vec<GameInput<T::Input>>>,
    host_connect_status: Vec<ConnectionStatus>,
    socket: Box<dyn NonBlockingSocket<T::Address>>,
    host: PeerConnection<T>,
    current_frame: Frame,
    last_recv_frame: Frame,
}

impl<T: Config> SpectatorSession<T> {
    pub(crate) fn new(
        num_players: usize,
        socket: Box<dyn NonBlockingSocket<T::Address>>,
        host: PeerConnection<T>,
        buffer_size: usize,
    ) -> Self {
        let buffer_size = buffer_size.max(1);
        Self {
            state: SessionState::Synchronizing,
            num_players,
            buffer_size,
            inputs: vec![vec![GameInput::blank(Frame::NULL); num_players]; buffer_size],
            host_connect_status: vec![ConnectionStatus::default(); num_players],
            socket,
            host,
            current_frame: Frame::NULL,
            last_recv_frame: Frame::NULL,
        }
    }

    /// Drives the connection to the host: drains the transport, runs
    /// protocol timers, stores received confirmed inputs, and delivers peer
    /// events.
    ///
    /// # Errors
    /// [`NetplayError::Transport`] for latched background I/O failures.
    pub fn begin_frame<H: SessionHandler<T>>(&mut self, handler: &mut H) -> Result<(), NetplayError> {
        if let Some(err) = self.socket.take_error() {
            return Err(NetplayError::Transport(err));
        }
        self.poll_host(handler);
        Ok(())
    }

    /// Returns the confirmed inputs for the next frame.
    ///
    /// # Errors
    /// - [`NetplayError::NotSynchronized`] before the host connection is up.
    /// - [`NetplayError::PredictionThreshold`] while the inputs for the next
    ///   frame have not arrived yet; retry next tick.
    /// - [`NetplayError::SpectatorTooFarBehind`] when the host ran more than
    ///   the buffer size ahead; the missing inputs are gone and the session
    ///   cannot recover.
    pub fn synchronize_inputs(&mut self) -> Result<InputVec<T::Input>, NetplayError> {
        if self.state != SessionState::Running {
            return Err(NetplayError::NotSynchronized);
        }

        let frame_to_grab = self.current_frame.next();
        let Some(slot) = frame_to_grab.ring_index(self.buffer_size) else {
            return Err(NetplayError::NotSynchronized);
        };
        let player_inputs = &self.inputs[slot];

        // the host has not broadcast this frame yet
        if player_inputs[0].frame < frame_to_grab {
            return Err(NetplayError::PredictionThreshold);
        }
        // the ring wrapped past the frame we still need
        if player_inputs[0].frame > frame_to_grab {
            return Err(NetplayError::SpectatorTooFarBehind);
        }

        Ok(player_inputs
            .iter()
            .enumerate()
            .map(|(idx, input)| {
                let status = &self.host_connect_status[idx];
                if status.disconnected && status.last_frame < frame_to_grab {
                    (input.input, InputStatus::Disconnected)
                } else {
                    (input.input, InputStatus::Confirmed)
                }
            })
            .collect())
    }

    /// Moves to the next frame after the host advanced its simulation.
    pub fn advance_frame(&mut self) -> Result<(), NetplayError> {
        if self.state != SessionState::Running {
            return Err(NetplayError::NotSynchronized);
        }
        self.current_frame = self.current_frame.next();
        Ok(())
    }

    /// The frame this spectator has simulated up to.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.current_frame
    }

    /// The current session state.
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        self.state
    }

    /// The number of players in the watched session.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// How many frames the spectator lags behind the newest broadcast.
    #[must_use]
    pub fn frames_behind_host(&self) -> u32 {
        let diff = self.last_recv_frame - self.current_frame;
        diff.max(0) as u32
    }

    /// Network statistics of the upstream connection.
    ///
    /// # Errors
    /// [`NetplayError::NotSynchronized`] while no statistics exist yet.
    pub fn network_stats(&self) -> Result<NetworkStats, NetplayError> {
        self.host.network_stats()
    }

    fn poll_host<H: SessionHandler<T>>(&mut self, handler: &mut H) {
        for (from, msg) in &self.socket.receive_all_messages() {
            if self.host.is_handling_message(from) {
                self.host.handle_message(msg);
            }
        }

        let addr = self.host.peer_addr();
        let events: Vec<Event<T>> = self.host.poll(&self.host_connect_status).collect();
        for event in events {
            self.handle_event(handler, event, addr.clone());
        }

        self.host.send_all_messages(&mut self.socket);
    }

    fn handle_event<H: SessionHandler<T>>(
        &mut self,
        handler: &mut H,
        event: Event<T>,
        addr: T::Address,
    ) {
        // the upstream host is reported as participant 0
        let primary = PlayerHandle::new(0);
        match event {
            Event::Connected => {
                handler.on_peer_event(primary, PeerEvent::Connected { addr });
            },
            Event::Synchronizing { total, count } => {
                handler.on_peer_event(primary, PeerEvent::Synchronizing { addr, count, total });
            },
            Event::Synchronized { ping } => {
                self.state = SessionState::Running;
                handler.on_peer_event(primary, PeerEvent::Synchronized { addr, ping });
                handler.on_session_start();
            },
            Event::SyncFailure => {
                handler.on_peer_event(primary, PeerEvent::SyncFailure { addr });
            },
            Event::NetworkInterrupted { disconnect_timeout } => {
                handler.on_peer_event(
                    primary,
                    PeerEvent::NetworkInterrupted {
                        addr,
                        disconnect_timeout,
                    },
                );
            },
            Event::NetworkResumed => {
                handler.on_peer_event(primary, PeerEvent::NetworkResumed { addr });
            },
            Event::Disconnected => {
                handler.on_peer_event(primary, PeerEvent::Disconnected { addr });
            },
            Event::Input { input, player } => {
                self.store_input(input, player);
            },
        }
    }

    fn store_input(&mut self, input: GameInput<T::Input>, player: PlayerHandle) {
        if !input.frame.is_valid() {
            warn!("ignoring broadcast input with invalid frame");
            return;
        }
        if player.as_usize() >= self.num_players {
            warn!(
                "ignoring broadcast input for player {} of {}",
                player, self.num_players
            );
            return;
        }

        let Some(slot) = input.frame.ring_index(self.buffer_size) else {
            return;
        };
        self.inputs[slot][player.as_usize()] = input;

        if input.frame > self.last_recv_frame {
            self.last_recv_frame = input.frame;
        }

        // keep the frame advantage fresh so the host can throttle itself
        self.host.update_local_frame_advantage(input.frame);

        for idx in 0..self.num_players {
            self.host_connect_status[idx] = self.host.peer_connect_status(PlayerHandle::new(idx));
        }
    }
}

// #########
// # TESTS #
// #########
