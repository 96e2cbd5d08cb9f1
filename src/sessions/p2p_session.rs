use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::frame_info::GameInput;
use crate::network::messages::ConnectionStatus;
use crate::network::network_stats::NetworkStats;
use crate::network::protocol::{Event, PeerConnection};
use crate::sessions::config::{ConfirmedFrameMode, ProtocolConfig, SyncConfig};
use crate::sessions::player_registry::PlayerRegistry;
use crate::synchronizer::Synchronizer;
use crate::time_sync::TimeSyncConfig;
use crate::{
    Config, Frame, FrameSpan, InputVec, NetplayError, NonBlockingSocket, PeerEvent, PlayerHandle,
    PlayerType, SessionHandler, SessionState, MAX_SPECTATORS,
};

/// A peer-to-peer rollback session: the remote backend.
///
/// A `P2PSession` multiplexes one [`PeerConnection`] per remote address,
/// fans the host's calls into the [`Synchronizer`], feeds spectators with
/// confirmed inputs, and throttles the faster peer through time sync.
///
/// The host drives it once per simulation tick:
/// [`begin_frame`](Self::begin_frame), [`add_local_input`](Self::add_local_input),
/// [`synchronize_inputs`](Self::synchronize_inputs), simulate,
/// [`advance_frame`](Self::advance_frame).
pub struct P2PSession<T>
where
    T: Config,
{
    num_players: usize,
    fps: usize,

    sync: Synchronizer<T>,
    state: SessionState,

    socket: Box<dyn NonBlockingSocket<T::Address>>,
    players: PlayerRegistry<T>,
    /// The authoritative local view of every player queue's progress;
    /// piggybacked in each outgoing input packet.
    local_connect_status: Vec<ConnectionStatus>,

    /// Next confirmed frame to broadcast to spectators and the confirmed
    /// input listener.
    next_spectator_frame: Frame,
    /// The soonest frame at which a time-sync recommendation may fire again.
    next_recommendation_check: Frame,
    recommendation_interval: u32,
    confirmed_frame_mode: ConfirmedFrameMode,

    /// When a peer disconnected at an earlier frame, the simulation must be
    /// adjusted back to it; checked on the next `begin_frame`.
    disconnect_frame: Frame,

    /// Local inputs for the current frame, until all local players provided
    /// theirs.
    local_inputs: BTreeMap<PlayerHandle, GameInput<T::Input>>,
    /// The frame whose local inputs were already committed and transmitted.
    inputs_committed_for: Frame,

    // configs kept for spectators that join while synchronizing
    sync_config: SyncConfig,
    protocol_config: ProtocolConfig,
    time_sync_config: TimeSyncConfig,
}

impl<T: Config> P2PSession<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        num_players: usize,
        fps: usize,
        max_prediction: usize,
        queue_length: usize,
        input_delay: usize,
        socket: Box<dyn NonBlockingSocket<T::Address>>,
        players: PlayerRegistry<T>,
        recommendation_interval: u32,
        confirmed_frame_mode: ConfirmedFrameMode,
        sync_config: SyncConfig,
        protocol_config: ProtocolConfig,
        time_sync_config: TimeSyncConfig,
    ) -> Self {
        let local_connect_status = vec![ConnectionStatus::default(); num_players];

        let mut sync = Synchronizer::new(num_players, max_prediction, queue_length);
        for (player_handle, player_type) in players.handles.iter() {
            if matches!(player_type, PlayerType::Local) {
                // handles were validated when added to the builder
                if let Err(e) = sync.set_frame_delay(*player_handle, input_delay) {
                    warn!("failed to set frame delay for player {}: {}", player_handle, e);
                }
            }
        }

        // without any endpoints there is nothing to synchronize with
        let state = if players.remotes.is_empty() && players.spectators.is_empty() {
            SessionState::Running
        } else {
            SessionState::Synchronizing
        };

        Self {
            num_players,
            fps,
            sync,
            state,
            socket,
            players,
            local_connect_status,
            next_spectator_frame: Frame::ZERO,
            next_recommendation_check: Frame::ZERO,
            recommendation_interval,
            confirmed_frame_mode,
            disconnect_frame: Frame::NULL,
            local_inputs: BTreeMap::new(),
            inputs_committed_for: Frame::NULL,
            sync_config,
            protocol_config,
            time_sync_config,
        }
    }

    /// Starts a simulation tick: surfaces latched background errors, drains
    /// the transport, drives peer protocol timers, performs any pending
    /// rollback through `handler`, advances the confirmed frame, feeds
    /// spectators, and emits time-sync recommendations.
    ///
    /// While the session is still synchronizing this only drives the
    /// handshakes; [`SessionHandler::on_session_start`] fires once every
    /// peer is synchronized.
    ///
    /// # Errors
    /// - [`NetplayError::Transport`] for background I/O failures.
    /// - [`NetplayError::Desync`] when a required rollback cannot be
    ///   serviced; the session must be closed.
    pub fn begin_frame<H: SessionHandler<T>>(&mut self, handler: &mut H) -> Result<(), NetplayError> {
        if let Some(err) = self.socket.take_error() {
            return Err(NetplayError::Transport(err));
        }

        self.poll_remote_clients(handler)?;

        if self.state != SessionState::Running {
            return Ok(());
        }

        // the first running tick snapshots frame 0 as the rollback floor
        if self.sync.state_store_is_empty() {
            trace!("saving the initial state");
            self.sync.save_current_state(handler);
        }

        // propagate disconnects other peers observed before we did
        self.update_player_disconnects();

        let confirmed_frame = self.min_confirmed_frame();

        // roll back if any queue saw a misprediction (or a disconnect
        // happened in the past)
        let rolled = self
            .sync
            .check_simulation(handler, self.disconnect_frame, &self.local_connect_status)?;
        if !rolled.is_zero() {
            debug!("rolled back {}", rolled);
        }
        self.disconnect_frame = Frame::NULL;

        // broadcast confirmed inputs before they are discarded
        self.feed_confirmed_inputs(handler, confirmed_frame)?;
        self.sync.set_last_confirmed_frame(confirmed_frame);

        self.check_time_sync(handler);

        Ok(())
    }

    /// Registers the local input of one player for the current frame. Once
    /// every local player's input is registered, the set is committed to
    /// the input queues and transmitted to all remote peers.
    ///
    /// # Errors
    /// - [`NetplayError::NotSynchronized`] before the session started.
    /// - [`NetplayError::InRollback`] while a rollback is in progress.
    /// - [`NetplayError::PredictionThreshold`] when the simulation is a
    ///   full speculation window ahead; stall one frame and retry.
    /// - [`NetplayError::InputDropped`] when transmission to at least one
    ///   peer failed (the input is still committed locally).
    pub fn add_local_input(
        &mut self,
        player_handle: PlayerHandle,
        input: T::Input,
    ) -> Result<(), NetplayError> {
        if self.state != SessionState::Running {
            return Err(NetplayError::NotSynchronized);
        }
        if self.sync.in_rollback() {
            return Err(NetplayError::InRollback);
        }
        match self.players.handles.get(&player_handle) {
            None => {
                return Err(NetplayError::InvalidPlayerHandle {
                    handle: player_handle,
                })
            },
            Some(PlayerType::Local) => (),
            Some(_) => {
                return Err(NetplayError::PlayerOutOfRange {
                    handle: player_handle,
                    num_players: self.num_players,
                })
            },
        }

        let current_frame = self.sync.current_frame();
        if self.inputs_committed_for == current_frame {
            return Err(NetplayError::InvalidRequest {
                info: format!("local inputs for frame {} were already committed", current_frame),
            });
        }

        self.local_inputs
            .insert(player_handle, GameInput::new(current_frame, input));

        // wait for the rest of the local players
        if self.local_inputs.len() < self.players.local_player_handles().len() {
            return Ok(());
        }

        self.commit_and_send_local_inputs()
    }

    /// Returns the inputs of every player for the current frame: confirmed
    /// where the real input is known, predicted otherwise, neutral for
    /// disconnected players.
    ///
    /// # Errors
    /// - [`NetplayError::NotSynchronized`] before the session started.
    /// - [`NetplayError::MissingInput`] when called before all local inputs
    ///   for this frame were registered.
    pub fn synchronize_inputs(&mut self) -> Result<InputVec<T::Input>, NetplayError> {
        if self.state != SessionState::Running {
            return Err(NetplayError::NotSynchronized);
        }
        if self.inputs_committed_for != self.sync.current_frame() {
            let missing = self
                .players
                .local_player_handles()
                .into_iter()
                .find(|h| !self.local_inputs.contains_key(h))
                .unwrap_or_default();
            return Err(NetplayError::MissingInput {
                player: missing,
                frame: self.sync.current_frame(),
            });
        }
        Ok(self.sync.synchronize_inputs(&self.local_connect_status))
    }

    /// Ends the tick after the host advanced its simulation: snapshots the
    /// new frame and moves the session to it.
    pub fn advance_frame<H: SessionHandler<T>>(&mut self, handler: &mut H) -> Result<(), NetplayError> {
        if self.state != SessionState::Running {
            return Err(NetplayError::NotSynchronized);
        }
        if self.inputs_committed_for != self.sync.current_frame() {
            return Err(NetplayError::MissingInput {
                player: self.players.local_player_handles().first().copied().unwrap_or_default(),
                frame: self.sync.current_frame(),
            });
        }

        self.sync.increment_frame(handler);
        self.local_inputs.clear();
        Ok(())
    }

    /// Disconnects a remote player (and every other player sharing its
    /// address). If the disconnect frame lies in the past, the simulation
    /// is rolled back there on the next [`begin_frame`](Self::begin_frame),
    /// treating the player's inputs as absent from then on.
    ///
    /// # Errors
    /// [`NetplayError::InvalidRequest`] for local players, unknown handles,
    /// or players that are already disconnected.
    pub fn disconnect_player(&mut self, player_handle: PlayerHandle) -> Result<(), NetplayError> {
        match self.players.handles.get(&player_handle) {
            None => Err(NetplayError::InvalidPlayerHandle {
                handle: player_handle,
            }),
            Some(PlayerType::Local) => Err(NetplayError::InvalidRequest {
                info: "local players cannot be disconnected".to_owned(),
            }),
            Some(PlayerType::Remote(_)) => {
                let status = self
                    .local_connect_status
                    .get(player_handle.as_usize())
                    .copied()
                    .unwrap_or_default();
                if status.disconnected {
                    return Err(NetplayError::InvalidRequest {
                        info: "player already disconnected".to_owned(),
                    });
                }
                self.disconnect_player_at_frame(player_handle, status.last_frame);
                Ok(())
            },
            Some(PlayerType::Spectator(_)) => {
                self.disconnect_player_at_frame(player_handle, Frame::NULL);
                Ok(())
            },
        }
    }

    /// Adds a spectator while the session is still synchronizing.
    ///
    /// # Errors
    /// - [`NetplayError::AlreadySynchronized`] once the session started.
    /// - [`NetplayError::TooManySpectators`] beyond [`MAX_SPECTATORS`].
    pub fn add_spectator(&mut self, addr: T::Address) -> Result<PlayerHandle, NetplayError> {
        if self.state != SessionState::Synchronizing {
            return Err(NetplayError::AlreadySynchronized);
        }
        if self.players.num_spectators() >= MAX_SPECTATORS {
            return Err(NetplayError::TooManySpectators { max: MAX_SPECTATORS });
        }
        if self.players.spectators.contains_key(&addr) {
            return Err(NetplayError::InvalidRequest {
                info: format!("a spectator at {:?} was already added", addr),
            });
        }

        let handle = PlayerHandle::new(self.num_players + self.players.num_spectators());
        let all_players: Vec<PlayerHandle> = (0..self.num_players).map(PlayerHandle::new).collect();
        let mut endpoint = PeerConnection::new(
            all_players.clone(),
            all_players,
            addr.clone(),
            self.num_players,
            self.sync.max_prediction(),
            self.fps,
            self.sync_config,
            self.protocol_config,
            self.time_sync_config,
        )
        .ok_or(NetplayError::InvalidRequest {
            info: "the input type cannot be serialized".to_owned(),
        })?;
        endpoint.synchronize()?;

        self.players
            .handles
            .insert(handle, PlayerType::Spectator(addr.clone()));
        self.players.spectators.insert(addr, endpoint);
        Ok(handle)
    }

    /// Network statistics for a remote player or spectator.
    ///
    /// # Errors
    /// [`NetplayError::NotSynchronized`] while the connection has no stats
    /// yet; [`NetplayError::InvalidPlayerHandle`] for local or unknown
    /// handles.
    pub fn network_stats(&self, player_handle: PlayerHandle) -> Result<NetworkStats, NetplayError> {
        match self.players.handles.get(&player_handle) {
            Some(PlayerType::Remote(addr)) => match self.players.remotes.get(addr) {
                Some(endpoint) => endpoint.network_stats(),
                None => Err(NetplayError::InvalidPlayerHandle {
                    handle: player_handle,
                }),
            },
            Some(PlayerType::Spectator(addr)) => match self.players.spectators.get(addr) {
                Some(endpoint) => endpoint.network_stats(),
                None => Err(NetplayError::InvalidPlayerHandle {
                    handle: player_handle,
                }),
            },
            _ => Err(NetplayError::InvalidPlayerHandle {
                handle: player_handle,
            }),
        }
    }

    /// Sets the input delay of a local player.
    ///
    /// # Errors
    /// [`NetplayError::InvalidPlayerHandle`] unless the handle refers to a
    /// local player.
    pub fn set_frame_delay(
        &mut self,
        player_handle: PlayerHandle,
        delay: usize,
    ) -> Result<(), NetplayError> {
        match self.players.handles.get(&player_handle) {
            Some(PlayerType::Local) => self.sync.set_frame_delay(player_handle, delay),
            _ => Err(NetplayError::InvalidPlayerHandle {
                handle: player_handle,
            }),
        }
    }

    /// Shuts the session down: requests disconnection from every peer,
    /// flushes the outboxes, and notifies the handler.
    pub fn close<H: SessionHandler<T>>(&mut self, handler: &mut H) {
        for endpoint in self.players.remotes.values_mut() {
            endpoint.disconnect();
            endpoint.send_all_messages(&mut self.socket);
        }
        for endpoint in self.players.spectators.values_mut() {
            endpoint.disconnect();
            endpoint.send_all_messages(&mut self.socket);
        }
        handler.on_session_close();
    }

    /// The current simulation frame.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.sync.current_frame()
    }

    /// The newest frame for which every player's input is confirmed.
    #[must_use]
    pub fn last_confirmed_frame(&self) -> Frame {
        self.sync.last_confirmed_frame()
    }

    /// The current session state.
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        self.state
    }

    /// The number of players (local + remote, without spectators).
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// The number of spectators attached to this session.
    #[must_use]
    pub fn num_spectators(&self) -> usize {
        self.players.num_spectators()
    }

    /// Handles of all local players.
    #[must_use]
    pub fn local_player_handles(&self) -> Vec<PlayerHandle> {
        self.players.local_player_handles()
    }

    /// Handles of all remote players.
    #[must_use]
    pub fn remote_player_handles(&self) -> Vec<PlayerHandle> {
        self.players.remote_player_handles()
    }

    /// Handles of all spectators.
    #[must_use]
    pub fn spectator_handles(&self) -> Vec<PlayerHandle> {
        self.players.spectator_handles()
    }

    /// All handles registered for a given remote address.
    #[must_use]
    pub fn handles_by_address(&self, addr: &T::Address) -> Vec<PlayerHandle> {
        self.players.handles_by_address(addr)
    }

    /// The checksum recorded for `frame`, while its snapshot is still in
    /// the store. Useful for cross-peer state comparison.
    #[must_use]
    pub fn saved_checksum(&self, frame: Frame) -> Option<u32> {
        self.sync.saved_checksum(frame)
    }

    /// Drains the transport, dispatches datagrams to the peer inboxes,
    /// drives protocol timers, and delivers events to the handler. Called
    /// from [`begin_frame`](Self::begin_frame); may additionally be called
    /// between ticks to keep the protocol responsive at low tick rates.
    pub fn poll_remote_clients<H: SessionHandler<T>>(
        &mut self,
        handler: &mut H,
    ) -> Result<(), NetplayError> {
        // distribute datagrams to the endpoint for their source address
        for (from_addr, msg) in &self.socket.receive_all_messages() {
            if let Some(endpoint) = self.players.remotes.get_mut(from_addr) {
                endpoint.handle_message(msg);
            }
            if let Some(endpoint) = self.players.spectators.get_mut(from_addr) {
                endpoint.handle_message(msg);
            }
        }

        // publish the local frame so quality reports carry fresh advantages
        let current_frame = self.sync.current_frame();
        for endpoint in self.players.remotes.values_mut() {
            if endpoint.is_running() {
                endpoint.update_local_frame_advantage(current_frame);
            }
        }

        // drive timers and collect events
        let mut events = VecDeque::new();
        for endpoint in self.players.remotes.values_mut() {
            let handles = endpoint.handles();
            let addr = endpoint.peer_addr();
            for event in endpoint.poll(&self.local_connect_status) {
                events.push_back((event, Arc::clone(&handles), addr.clone(), false));
            }
        }
        for endpoint in self.players.spectators.values_mut() {
            let handles = endpoint.handles();
            let addr = endpoint.peer_addr();
            for event in endpoint.poll(&self.local_connect_status) {
                events.push_back((event, Arc::clone(&handles), addr.clone(), true));
            }
        }

        for (event, handles, addr, from_spectator) in events {
            self.handle_event(handler, event, &handles, addr, from_spectator)?;
        }

        // the gate may have opened (or a failed spectator was dropped)
        self.check_initial_sync(handler);

        // flush everything the above queued
        for endpoint in self.players.remotes.values_mut() {
            endpoint.send_all_messages(&mut self.socket);
        }
        for endpoint in self.players.spectators.values_mut() {
            endpoint.send_all_messages(&mut self.socket);
        }

        Ok(())
    }

    /*
     * INTERNALS
     */

    fn commit_and_send_local_inputs(&mut self) -> Result<(), NetplayError> {
        let current_frame = self.sync.current_frame();

        // committing the first input checks the prediction threshold for
        // the whole set; the threshold depends only on session state
        for (&handle, &input) in self.local_inputs.clone().iter() {
            let actual_frame = self.sync.add_local_input(handle, input)?;
            if actual_frame.is_null() {
                return Err(NetplayError::InvalidRequest {
                    info: format!("input for player {} was not accepted by its queue", handle),
                });
            }
            // with an input delay the queue places the input a few frames
            // ahead of the current frame
            if let Some(entry) = self.local_inputs.get_mut(&handle) {
                entry.frame = actual_frame;
            }
            if let Some(status) = self.local_connect_status.get_mut(handle.as_usize()) {
                status.last_frame = actual_frame;
            }
        }
        self.inputs_committed_for = current_frame;

        // transmit to every remote peer
        let mut dropped = 0;
        for endpoint in self.players.remotes.values_mut() {
            endpoint.send_input(&self.local_inputs, &self.local_connect_status);
            dropped += endpoint.send_all_messages(&mut self.socket);
        }

        if dropped > 0 {
            trace!("{} message(s) dropped while sending local input", dropped);
            return Err(NetplayError::InputDropped);
        }
        Ok(())
    }

    /// Flips the session to running once every endpoint finished its
    /// handshake.
    fn check_initial_sync<H: SessionHandler<T>>(&mut self, handler: &mut H) {
        if self.state != SessionState::Synchronizing {
            return;
        }
        let all_synchronized = self
            .players
            .remotes
            .values()
            .chain(self.players.spectators.values())
            .all(|endpoint| endpoint.is_synchronized());
        if all_synchronized {
            debug!("all endpoints synchronized, session starts");
            self.state = SessionState::Running;
            handler.on_session_start();
        }
    }

    fn handle_event<H: SessionHandler<T>>(
        &mut self,
        handler: &mut H,
        event: Event<T>,
        player_handles: &[PlayerHandle],
        addr: T::Address,
        from_spectator: bool,
    ) -> Result<(), NetplayError> {
        let primary = player_handles.first().copied().unwrap_or_default();
        match event {
            Event::Connected => {
                handler.on_peer_event(primary, PeerEvent::Connected { addr });
            },
            Event::Synchronizing { total, count } => {
                handler.on_peer_event(primary, PeerEvent::Synchronizing { addr, count, total });
            },
            Event::Synchronized { ping } => {
                handler.on_peer_event(primary, PeerEvent::Synchronized { addr, ping });
            },
            Event::SyncFailure => {
                if from_spectator {
                    // a spectator that cannot connect is silently dropped;
                    // the sync gate is re-checked by the caller
                    debug!("removing spectator {:?} after sync failure", addr);
                    self.players.spectators.remove(&addr);
                    self.players
                        .handles
                        .retain(|_, t| !matches!(t, PlayerType::Spectator(a) if *a == addr));
                } else {
                    handler.on_peer_event(primary, PeerEvent::SyncFailure { addr });
                }
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
                for &handle in player_handles {
                    let last_frame = if handle.is_player_for(self.num_players) {
                        self.local_connect_status
                            .get(handle.as_usize())
                            .map(|s| s.last_frame)
                            .unwrap_or(Frame::NULL)
                    } else {
                        Frame::NULL // spectator
                    };
                    self.disconnect_player_at_frame(handle, last_frame);
                }
                handler.on_peer_event(primary, PeerEvent::Disconnected { addr });
            },
            Event::Input { input, player } => {
                self.on_remote_input(player, input)?;
            },
        }
        Ok(())
    }

    /// Feeds one authoritative remote input into the synchronizer,
    /// enforcing per-player frame continuity.
    fn on_remote_input(
        &mut self,
        player: PlayerHandle,
        input: GameInput<T::Input>,
    ) -> Result<(), NetplayError> {
        if !player.is_player_for(self.num_players) {
            warn!("ignoring input for non-player handle {}", player);
            return Ok(());
        }
        let Some(status) = self.local_connect_status.get_mut(player.as_usize()) else {
            return Ok(());
        };
        if status.disconnected {
            return Ok(());
        }

        let last_received = status.last_frame;
        if !last_received.is_null() {
            // duplicates from a resend overlap are dropped silently
            if input.frame <= last_received {
                return Ok(());
            }
            // a gap means the sequenced delivery of the inbox broke down
            if input.frame > last_received.next() {
                return Err(NetplayError::Desync {
                    frame: input.frame,
                    context: "remote input skipped frames",
                });
            }
        }

        status.last_frame = input.frame;
        self.sync.add_remote_input(player, input);
        Ok(())
    }

    fn disconnect_player_at_frame(&mut self, player_handle: PlayerHandle, last_frame: Frame) {
        let Some(player_type) = self.players.handles.get(&player_handle) else {
            return;
        };

        match player_type {
            PlayerType::Remote(addr) => {
                let Some(endpoint) = self.players.remotes.get_mut(addr) else {
                    return;
                };

                // all players fed by this endpoint go down together
                for &handle in endpoint.handles().iter() {
                    if let Some(status) = self.local_connect_status.get_mut(handle.as_usize()) {
                        status.disconnected = true;
                        status.last_frame = last_frame;
                    }
                }
                endpoint.disconnect();

                if self.sync.current_frame() > last_frame {
                    // the player was simulated with predictions past their
                    // disconnect; re-run those frames with neutral inputs
                    debug!(
                        "disconnect at {} behind current {}, scheduling adjustment",
                        last_frame,
                        self.sync.current_frame()
                    );
                    self.disconnect_frame = last_frame.next();
                }
            },
            PlayerType::Spectator(addr) => {
                if let Some(endpoint) = self.players.spectators.get_mut(addr) {
                    endpoint.disconnect();
                }
            },
            PlayerType::Local => (),
        }
    }

    /// Disconnects players that other peers observed disconnecting at an
    /// earlier frame than we did.
    fn update_player_disconnects(&mut self) {
        for handle_idx in 0..self.num_players {
            let handle = PlayerHandle::new(handle_idx);
            let mut queue_connected = true;
            let mut queue_min_confirmed = Frame::new(i32::MAX);

            for endpoint in self.players.remotes.values() {
                if !endpoint.is_running() {
                    continue;
                }
                let status = endpoint.peer_connect_status(handle);
                queue_connected = queue_connected && !status.disconnected;
                queue_min_confirmed = queue_min_confirmed.min(status.last_frame);
            }

            let Some(local_status) = self.local_connect_status.get(handle_idx).copied() else {
                continue;
            };
            if !local_status.disconnected {
                queue_min_confirmed = queue_min_confirmed.min(local_status.last_frame);
            }

            if !queue_connected {
                // another peer disconnected this player earlier than we
                // did; adjust to the earlier frame
                if !local_status.disconnected || local_status.last_frame > queue_min_confirmed {
                    debug!(
                        "peer-reported disconnect of player {} at {}",
                        handle, queue_min_confirmed
                    );
                    self.disconnect_player_at_frame(handle, queue_min_confirmed);
                }
            }
        }
    }

    /// The minimum frame for which inputs count as confirmed, per the
    /// configured [`ConfirmedFrameMode`].
    fn min_confirmed_frame(&self) -> Frame {
        let mut total_min = Frame::new(i32::MAX);

        for handle_idx in 0..self.num_players {
            let Some(local_status) = self.local_connect_status.get(handle_idx) else {
                continue;
            };
            if local_status.disconnected {
                continue;
            }

            let mut queue_min = local_status.last_frame;
            if self.confirmed_frame_mode == ConfirmedFrameMode::PeerConsensus {
                // a frame only counts once every running peer has it
                let handle = PlayerHandle::new(handle_idx);
                for endpoint in self.players.remotes.values() {
                    if endpoint.is_running() {
                        queue_min = queue_min.min(endpoint.peer_connect_status(handle).last_frame);
                    }
                }
            }
            total_min = total_min.min(queue_min);
        }

        if total_min.as_i32() == i32::MAX {
            // every queue disconnected; nothing to confirm
            return Frame::NULL;
        }
        total_min
    }

    /// Sends all freshly confirmed frames to the spectators and the
    /// confirmed-input listener, in order.
    fn feed_confirmed_inputs<H: SessionHandler<T>>(
        &mut self,
        handler: &mut H,
        confirmed_frame: Frame,
    ) -> Result<(), NetplayError> {
        while self.next_spectator_frame <= confirmed_frame {
            let frame = self.next_spectator_frame;
            let confirmed = self.sync.confirmed_inputs(frame, &self.local_connect_status)?;

            handler.on_confirmed_inputs(&confirmed);

            if self.players.num_spectators() > 0 {
                let mut input_map = BTreeMap::new();
                for (idx, &input) in confirmed.inputs.iter().enumerate() {
                    input_map.insert(PlayerHandle::new(idx), GameInput::new(frame, input));
                }
                for endpoint in self.players.spectators.values_mut() {
                    if endpoint.is_running() {
                        endpoint.send_input(&input_map, &self.local_connect_status);
                        endpoint.send_all_messages(&mut self.socket);
                    }
                }
            }

            self.next_spectator_frame = frame.next();
        }
        Ok(())
    }

    /// Every `recommendation_interval` frames, asks the time sync of each
    /// endpoint whether the local client should idle and reports the
    /// largest recommendation.
    fn check_time_sync<H: SessionHandler<T>>(&mut self, handler: &mut H) {
        if self.sync.current_frame() < self.next_recommendation_check {
            return;
        }
        self.next_recommendation_check =
            self.sync.current_frame() + self.recommendation_interval as i32;

        let mut skip_frames = 0u32;
        for (handle_idx, status) in self.local_connect_status.iter().enumerate() {
            if status.disconnected {
                continue;
            }
            let handle = PlayerHandle::new(handle_idx);
            if let Some(PlayerType::Remote(addr)) = self.players.handles.get(&handle) {
                if let Some(endpoint) = self.players.remotes.get(addr) {
                    skip_frames = skip_frames.max(endpoint.recommended_wait());
                }
            }
        }

        if skip_frames > 0 {
            handler.on_time_sync(FrameSpan::new(skip_frames as i32));
        }
    }
}

// #########
// # TESTS #
// #########
