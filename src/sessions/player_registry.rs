//! Registry of session participants and their protocol endpoints.

use std::collections::BTreeMap;

use crate::network::protocol::PeerConnection;
use crate::{Config, PlayerHandle, PlayerType};

/// Tracks every participant of a session and the protocol endpoint serving
/// each remote address.
///
/// Multiple player handles may share one endpoint (couch co-op on a remote
/// machine); the endpoint then feeds several input queues.
pub(crate) struct PlayerRegistry<T>
where
    T: Config,
{
    /// Participant kind by handle.
    pub handles: BTreeMap<PlayerHandle, PlayerType<T::Address>>,
    /// Protocol endpoints of remote players, by address.
    pub remotes: BTreeMap<T::Address, PeerConnection<T>>,
    /// Protocol endpoints of spectators, by address.
    pub spectators: BTreeMap<T::Address, PeerConnection<T>>,
}

impl<T> std::fmt::Debug for PlayerRegistry<T>
where
    T: Config,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            handles,
            remotes,
            spectators,
        } = self;

        f.debug_struct("PlayerRegistry")
            .field("handles", handles)
            .field("remotes", &remotes.keys())
            .field("spectators", &spectators.keys())
            .finish()
    }
}

impl<T: Config> PlayerRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            handles: BTreeMap::new(),
            remotes: BTreeMap::new(),
            spectators: BTreeMap::new(),
        }
    }

    pub(crate) fn local_player_handles(&self) -> Vec<PlayerHandle> {
        self.handles
            .iter()
            .filter_map(|(k, v)| matches!(v, PlayerType::Local).then_some(*k))
            .collect()
    }

    pub(crate) fn remote_player_handles(&self) -> Vec<PlayerHandle> {
        self.handles
            .iter()
            .filter_map(|(k, v)| matches!(v, PlayerType::Remote(_)).then_some(*k))
            .collect()
    }

    pub(crate) fn spectator_handles(&self) -> Vec<PlayerHandle> {
        self.handles
            .iter()
            .filter_map(|(k, v)| matches!(v, PlayerType::Spectator(_)).then_some(*k))
            .collect()
    }

    pub(crate) fn num_players(&self) -> usize {
        self.handles
            .values()
            .filter(|v| matches!(v, PlayerType::Local | PlayerType::Remote(_)))
            .count()
    }

    pub(crate) fn num_spectators(&self) -> usize {
        self.handles
            .values()
            .filter(|v| matches!(v, PlayerType::Spectator(_)))
            .count()
    }

    /// All handles registered for a given remote address.
    pub(crate) fn handles_by_address(&self, addr: &T::Address) -> Vec<PlayerHandle> {
        self.handles
            .iter()
            .filter_map(|(h, player_type)| match player_type {
                PlayerType::Local => None,
                PlayerType::Remote(a) | PlayerType::Spectator(a) => (a == addr).then_some(*h),
            })
            .collect()
    }
}

impl<T: Config> Default for PlayerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod registry_tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use super::*;

    struct TestConfig;

    impl Config for TestConfig {
        type Input = u8;
        type Address = SocketAddr;
    }

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn test_empty_registry() {
        let registry = PlayerRegistry::<TestConfig>::new();
        assert_eq!(registry.num_players(), 0);
        assert_eq!(registry.num_spectators(), 0);
        assert!(registry.local_player_handles().is_empty());
    }

    #[test]
    fn test_mixed_participants() {
        let mut registry = PlayerRegistry::<TestConfig>::new();
        registry.handles.insert(PlayerHandle::new(0), PlayerType::Local);
        registry
            .handles
            .insert(PlayerHandle::new(1), PlayerType::Remote(test_addr(8080)));
        registry
            .handles
            .insert(PlayerHandle::new(2), PlayerType::Spectator(test_addr(9090)));

        assert_eq!(registry.num_players(), 2);
        assert_eq!(registry.num_spectators(), 1);
        assert_eq!(registry.local_player_handles(), vec![PlayerHandle::new(0)]);
        assert_eq!(registry.remote_player_handles(), vec![PlayerHandle::new(1)]);
        assert_eq!(registry.spectator_handles(), vec![PlayerHandle::new(2)]);
    }

    #[test]
    fn test_handles_by_address() {
        let mut registry = PlayerRegistry::<TestConfig>::new();
        let addr = test_addr(8080);
        registry.handles.insert(PlayerHandle::new(1), PlayerType::Remote(addr));
        registry.handles.insert(PlayerHandle::new(2), PlayerType::Remote(addr));
        registry.handles.insert(PlayerHandle::new(0), PlayerType::Local);

        let found = registry.handles_by_address(&addr);
        assert_eq!(found, vec![PlayerHandle::new(1), PlayerHandle::new(2)]);
        assert!(registry.handles_by_address(&test_addr(1)).is_empty());
    }
}
