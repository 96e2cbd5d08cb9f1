//! Configuration values for session and protocol behavior.

use web_time::Duration;

/// Configuration of the connection handshake and input delivery timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// The number of handshake roundtrips required before a connection is
    /// considered synchronized.
    pub num_sync_packets: u32,
    /// How long to wait for a handshake reply before firing another
    /// request.
    pub sync_retry_interval: Duration,
    /// After this long without completing the handshake, the connection
    /// reports a synchronization failure. `None` disables the check.
    pub handshake_timeout: Option<Duration>,
    /// The pending input window is retransmitted whenever the peer has been
    /// quiet for this long.
    pub resend_interval: Duration,
    /// A keep-alive is sent if nothing else was sent for this long.
    pub keepalive_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            num_sync_packets: 5,
            sync_retry_interval: Duration::from_millis(200),
            handshake_timeout: Some(Duration::from_millis(5000)),
            resend_interval: Duration::from_millis(200),
            keepalive_interval: Duration::from_millis(200),
        }
    }
}

impl SyncConfig {
    /// Creates a `SyncConfig` with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Configuration of the running-phase protocol behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// How often quality reports (ping and frame advantage) are exchanged.
    pub quality_report_interval: Duration,
    /// Inactivity threshold after which the peer is reported interrupted.
    pub disconnect_notify_start: Duration,
    /// Inactivity threshold after which the peer is disconnected.
    pub disconnect_timeout: Duration,
    /// Maximum number of unacknowledged outgoing inputs before the peer is
    /// considered gone.
    pub pending_input_limit: usize,
    /// Grace period between tearing a connection down and dropping its
    /// queued messages.
    pub shutdown_delay: Duration,
    /// Received-input history is retained for this multiple of the
    /// prediction window, covering late retransmits.
    pub input_history_multiplier: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            quality_report_interval: Duration::from_millis(1000),
            disconnect_notify_start: Duration::from_millis(750),
            disconnect_timeout: Duration::from_millis(5000),
            pending_input_limit: 64,
            shutdown_delay: Duration::from_millis(1000),
            input_history_multiplier: 4,
        }
    }
}

impl ProtocolConfig {
    /// Creates a `ProtocolConfig` with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// How the session computes the minimum confirmed frame across peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmedFrameMode {
    /// A frame counts as confirmed for a player only when every running
    /// peer reports having that player's input for it. Also detects and
    /// force-disconnects queues that fall behind. The default for any
    /// player count.
    #[default]
    PeerConsensus,
    /// Trust only the locally received inputs (the classic two-player
    /// path). Compatibility toggle for matching older peers bit-exactly.
    LocalOnly,
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.num_sync_packets, 5);
        assert_eq!(config.keepalive_interval, Duration::from_millis(200));
        assert!(config.handshake_timeout.is_some());
    }

    #[test]
    fn test_protocol_config_defaults() {
        let config = ProtocolConfig::default();
        assert_eq!(config.quality_report_interval, Duration::from_millis(1000));
        assert_eq!(config.disconnect_notify_start, Duration::from_millis(750));
        assert_eq!(config.disconnect_timeout, Duration::from_millis(5000));
        assert_eq!(config.pending_input_limit, 64);
    }

    #[test]
    fn test_confirmed_frame_mode_default() {
        assert_eq!(ConfirmedFrameMode::default(), ConfirmedFrameMode::PeerConsensus);
    }
}
