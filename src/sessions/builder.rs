//! Step-by-step construction of sessions.

use std::collections::BTreeMap;

use crate::input_queue::INPUT_QUEUE_LENGTH;
use crate::network::protocol::PeerConnection;
use crate::sessions::config::{ConfirmedFrameMode, ProtocolConfig, SyncConfig};
use crate::sessions::player_registry::PlayerRegistry;
use crate::sessions::p2p_session::P2PSession;
use crate::sessions::spectator_session::SpectatorSession;
use crate::time_sync::TimeSyncConfig;
use crate::{
    Config, NetplayError, NonBlockingSocket, PlayerHandle, PlayerType, MAX_PLAYERS, MAX_SPECTATORS,
};

const DEFAULT_MAX_PREDICTION: usize = 8;
const DEFAULT_INPUT_DELAY: usize = 2;
const DEFAULT_FPS: usize = 60;
const DEFAULT_RECOMMENDATION_INTERVAL: u32 = 240;

/// Collects the participants and tuning values of a session, then starts
/// one of the backends.
///
/// ```ignore
/// let mut session = SessionBuilder::<MyConfig>::new()
///     .with_num_players(2)?
///     .add_player(PlayerType::Local, PlayerHandle::new(0))?
///     .add_player(PlayerType::Remote(peer_addr), PlayerHandle::new(1))?
///     .start_p2p_session(socket)?;
/// ```
pub struct SessionBuilder<T>
where
    T: Config,
{
    num_players: usize,
    max_prediction: usize,
    input_delay: usize,
    fps: usize,
    queue_length: usize,
    recommendation_interval: u32,
    confirmed_frame_mode: ConfirmedFrameMode,
    sync_config: SyncConfig,
    protocol_config: ProtocolConfig,
    time_sync_config: TimeSyncConfig,
    players: BTreeMap<PlayerHandle, PlayerType<T::Address>>,
}

impl<T: Config> Default for SessionBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Config> SessionBuilder<T> {
    /// Creates a builder for a two-player session with default tuning.
    #[must_use]
    pub fn new() -> Self {
        Self {
            num_players: 2,
            max_prediction: DEFAULT_MAX_PREDICTION,
            input_delay: DEFAULT_INPUT_DELAY,
            fps: DEFAULT_FPS,
            queue_length: INPUT_QUEUE_LENGTH,
            recommendation_interval: DEFAULT_RECOMMENDATION_INTERVAL,
            confirmed_frame_mode: ConfirmedFrameMode::default(),
            sync_config: SyncConfig::default(),
            protocol_config: ProtocolConfig::default(),
            time_sync_config: TimeSyncConfig::default(),
            players: BTreeMap::new(),
        }
    }

    /// Sets the number of players (local + remote, excluding spectators).
    ///
    /// # Errors
    /// [`NetplayError::TooManyPlayers`] beyond [`MAX_PLAYERS`],
    /// [`NetplayError::InvalidRequest`] for zero.
    pub fn with_num_players(mut self, num_players: usize) -> Result<Self, NetplayError> {
        if num_players == 0 {
            return Err(NetplayError::InvalidRequest {
                info: "a session needs at least one player".to_owned(),
            });
        }
        if num_players > MAX_PLAYERS {
            return Err(NetplayError::TooManyPlayers { max: MAX_PLAYERS });
        }
        self.num_players = num_players;
        Ok(self)
    }

    /// Registers a participant. Player handles must be `0..num_players`;
    /// spectator handles `num_players` and above.
    ///
    /// # Errors
    /// - [`NetplayError::DuplicatedPlayer`] when the handle is taken.
    /// - [`NetplayError::PlayerOutOfRange`] when a player handle exceeds
    ///   the configured player count.
    /// - [`NetplayError::TooManySpectators`] beyond [`MAX_SPECTATORS`].
    pub fn add_player(
        mut self,
        player_type: PlayerType<T::Address>,
        handle: PlayerHandle,
    ) -> Result<Self, NetplayError> {
        if self.players.contains_key(&handle) {
            return Err(NetplayError::DuplicatedPlayer { handle });
        }

        match &player_type {
            PlayerType::Local | PlayerType::Remote(_) => {
                if !handle.is_player_for(self.num_players) {
                    return Err(NetplayError::PlayerOutOfRange {
                        handle,
                        num_players: self.num_players,
                    });
                }
            },
            PlayerType::Spectator(_) => {
                if handle.is_player_for(self.num_players) {
                    return Err(NetplayError::InvalidRequest {
                        info: format!(
                            "spectator handles start at {} for this session",
                            self.num_players
                        ),
                    });
                }
                let spectators = self
                    .players
                    .values()
                    .filter(|t| matches!(t, PlayerType::Spectator(_)))
                    .count();
                if spectators >= MAX_SPECTATORS {
                    return Err(NetplayError::TooManySpectators { max: MAX_SPECTATORS });
                }
            },
        }

        self.players.insert(handle, player_type);
        Ok(self)
    }

    /// Sets the speculation window: how many frames the simulation may run
    /// past the last confirmed frame. Default 8.
    #[must_use]
    pub fn with_max_prediction_window(mut self, window: usize) -> Self {
        self.max_prediction = window.max(1);
        self
    }

    /// Sets the local input delay in frames. Default 2.
    #[must_use]
    pub fn with_input_delay(mut self, delay: usize) -> Self {
        self.input_delay = delay;
        self
    }

    /// Sets the simulation rate used to convert roundtrip times into
    /// frames. Default 60.
    ///
    /// # Errors
    /// [`NetplayError::InvalidRequest`] for zero.
    pub fn with_fps(mut self, fps: usize) -> Result<Self, NetplayError> {
        if fps == 0 {
            return Err(NetplayError::InvalidRequest {
                info: "fps must be nonzero".to_owned(),
            });
        }
        self.fps = fps;
        Ok(self)
    }

    /// Sets the per-player input queue length. Default 128.
    #[must_use]
    pub fn with_input_queue_length(mut self, length: usize) -> Self {
        self.queue_length = length.max(2);
        self
    }

    /// Sets how many frames pass between time-sync recommendations.
    /// Default 240.
    #[must_use]
    pub fn with_recommendation_interval(mut self, interval: u32) -> Self {
        self.recommendation_interval = interval.max(1);
        self
    }

    /// Selects the confirmed-frame computation mode.
    #[must_use]
    pub fn with_confirmed_frame_mode(mut self, mode: ConfirmedFrameMode) -> Self {
        self.confirmed_frame_mode = mode;
        self
    }

    /// Overrides the handshake and delivery timer configuration.
    #[must_use]
    pub fn with_sync_config(mut self, sync_config: SyncConfig) -> Self {
        self.sync_config = sync_config;
        self
    }

    /// Overrides the running-phase protocol configuration.
    #[must_use]
    pub fn with_protocol_config(mut self, protocol_config: ProtocolConfig) -> Self {
        self.protocol_config = protocol_config;
        self
    }

    /// Overrides the time synchronization configuration.
    #[must_use]
    pub fn with_time_sync_config(mut self, time_sync_config: TimeSyncConfig) -> Self {
        self.time_sync_config = time_sync_config;
        self
    }

    /// Starts the remote backend over the given transport.
    ///
    /// # Errors
    /// [`NetplayError::InvalidRequest`] if any player handle in
    /// `0..num_players` was not registered or the input type cannot be
    /// serialized.
    pub fn start_p2p_session(
        self,
        socket: impl NonBlockingSocket<T::Address> + 'static,
    ) -> Result<P2PSession<T>, NetplayError> {
        // every player slot must be assigned
        for idx in 0..self.num_players {
            if !self.players.contains_key(&PlayerHandle::new(idx)) {
                return Err(NetplayError::InvalidRequest {
                    info: format!("no player was registered for handle {}", idx),
                });
            }
        }

        let local_handles: Vec<PlayerHandle> = self
            .players
            .iter()
            .filter_map(|(h, t)| matches!(t, PlayerType::Local).then_some(*h))
            .collect();

        let mut registry = PlayerRegistry::new();
        registry.handles = self.players.clone();

        // group remote players by address; one endpoint feeds all queues of
        // its address
        let mut remote_groups: BTreeMap<T::Address, Vec<PlayerHandle>> = BTreeMap::new();
        let mut spectator_addrs: Vec<T::Address> = Vec::new();
        for (handle, player_type) in &self.players {
            match player_type {
                PlayerType::Remote(addr) => {
                    remote_groups.entry(addr.clone()).or_default().push(*handle)
                },
                PlayerType::Spectator(addr) => spectator_addrs.push(addr.clone()),
                PlayerType::Local => (),
            }
        }

        for (addr, handles) in remote_groups {
            let mut endpoint = PeerConnection::new(
                handles,
                local_handles.clone(),
                addr.clone(),
                self.num_players,
                self.max_prediction,
                self.fps,
                self.sync_config,
                self.protocol_config,
                self.time_sync_config,
            )
            .ok_or(NetplayError::InvalidRequest {
                info: "the input type cannot be serialized".to_owned(),
            })?;
            endpoint.synchronize()?;
            registry.remotes.insert(addr, endpoint);
        }

        let all_players: Vec<PlayerHandle> = (0..self.num_players).map(PlayerHandle::new).collect();
        for addr in spectator_addrs {
            let mut endpoint = PeerConnection::new(
                all_players.clone(),
                all_players.clone(),
                addr.clone(),
                self.num_players,
                self.max_prediction,
                self.fps,
                self.sync_config,
                self.protocol_config,
                self.time_sync_config,
            )
            .ok_or(NetplayError::InvalidRequest {
                info: "the input type cannot be serialized".to_owned(),
            })?;
            endpoint.synchronize()?;
            registry.spectators.insert(addr, endpoint);
        }

        Ok(P2PSession::new(
            self.num_players,
            self.fps,
            self.max_prediction,
            self.queue_length,
            self.input_delay,
            Box::new(socket),
            registry,
            self.recommendation_interval,
            self.confirmed_frame_mode,
            self.sync_config,
            self.protocol_config,
            self.time_sync_config,
        ))
    }

    /// Starts the spectator backend, receiving confirmed inputs from the
    /// session hosted at `host_addr`.
    ///
    /// # Errors
    /// [`NetplayError::InvalidRequest`] if the input type cannot be
    /// serialized.
    pub fn start_spectator_session(
        self,
        host_addr: T::Address,
        socket: impl NonBlockingSocket<T::Address> + 'static,
    ) -> Result<SpectatorSession<T>, NetplayError> {
        let all_players: Vec<PlayerHandle> = (0..self.num_players).map(PlayerHandle::new).collect();
        let mut host = PeerConnection::new(
            all_players,
            Vec::new(),
            host_addr,
            self.num_players,
            self.max_prediction,
            self.fps,
            self.sync_config,
            self.protocol_config,
            self.time_sync_config,
        )
        .ok_or(NetplayError::InvalidRequest {
            info: "the input type cannot be serialized".to_owned(),
        })?;
        host.synchronize()?;

        Ok(SpectatorSession::new(
            self.num_players,
            Box::new(socket),
            host,
            self.queue_length,
        ))
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod builder_tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{Message, TransportError};

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

    struct NullSocket;

    impl NonBlockingSocket<SocketAddr> for NullSocket {
        fn send_to(&mut self, _msg: &Message, _addr: &SocketAddr) -> Result<(), TransportError> {
            Ok(())
        }

        fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
            Vec::new()
        }
    }

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn test_zero_players_rejected() {
        assert!(SessionBuilder::<TestConfig>::new().with_num_players(0).is_err());
    }

    #[test]
    fn test_too_many_players_rejected() {
        assert!(matches!(
            SessionBuilder::<TestConfig>::new().with_num_players(MAX_PLAYERS + 1),
            Err(NetplayError::TooManyPlayers { .. })
        ));
    }

    #[test]
    fn test_duplicate_handle_rejected() {
        let result = SessionBuilder::<TestConfig>::new()
            .add_player(PlayerType::Local, PlayerHandle::new(0))
            .unwrap()
            .add_player(PlayerType::Remote(test_addr(1)), PlayerHandle::new(0));
        assert!(matches!(result, Err(NetplayError::DuplicatedPlayer { .. })));
    }

    #[test]
    fn test_player_handle_out_of_range_rejected() {
        let result = SessionBuilder::<TestConfig>::new()
            .add_player(PlayerType::Local, PlayerHandle::new(2));
        assert!(matches!(result, Err(NetplayError::PlayerOutOfRange { .. })));
    }

    #[test]
    fn test_spectator_handle_below_player_range_rejected() {
        let result = SessionBuilder::<TestConfig>::new()
            .add_player(PlayerType::Spectator(test_addr(1)), PlayerHandle::new(1));
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_player_slot_rejected() {
        let result = SessionBuilder::<TestConfig>::new()
            .add_player(PlayerType::Local, PlayerHandle::new(0))
            .unwrap()
            .start_p2p_session(NullSocket);
        assert!(result.is_err()); // handle 1 never registered
    }

    #[test]
    fn test_full_session_with_spectator() {
        let session = SessionBuilder::<TestConfig>::new()
            .add_player(PlayerType::Local, PlayerHandle::new(0))
            .unwrap()
            .add_player(PlayerType::Remote(test_addr(8080)), PlayerHandle::new(1))
            .unwrap()
            .add_player(PlayerType::Spectator(test_addr(9090)), PlayerHandle::new(2))
            .unwrap()
            .start_p2p_session(NullSocket)
            .unwrap();
        assert_eq!(session.num_players(), 2);
        assert_eq!(session.num_spectators(), 1);
    }

    #[test]
    fn test_couch_coop_shares_one_endpoint() {
        let addr = test_addr(8080);
        let session = SessionBuilder::<TestConfig>::new()
            .with_num_players(3)
            .unwrap()
            .add_player(PlayerType::Local, PlayerHandle::new(0))
            .unwrap()
            .add_player(PlayerType::Remote(addr), PlayerHandle::new(1))
            .unwrap()
            .add_player(PlayerType::Remote(addr), PlayerHandle::new(2))
            .unwrap()
            .start_p2p_session(NullSocket)
            .unwrap();
        assert_eq!(
            session.handles_by_address(&addr),
            vec![PlayerHandle::new(1), PlayerHandle::new(2)]
        );
    }

    #[test]
    fn test_spectator_session_construction() {
        let session = SessionBuilder::<TestConfig>::new()
            .start_spectator_session(test_addr(8080), NullSocket)
            .unwrap();
        assert_eq!(session.num_players(), 2);
    }
}
