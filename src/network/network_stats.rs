use web_time::Duration;

/// Statistics about the connection quality to one remote client.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[must_use = "NetworkStats should be inspected after being queried"]
pub struct NetworkStats {
    /// The number of input packets not yet acknowledged by the remote
    /// client. A growing send queue is a rough indication of a poor
    /// connection.
    pub send_queue_len: usize,
    /// The measured packet roundtrip time.
    pub ping: Duration,
    /// Estimated bandwidth to this client in kilobytes per second.
    pub kbps_sent: usize,
    /// How many frames the local client is ahead of this remote client at
    /// this instant (negative when behind).
    pub local_frame_advantage: i32,
    /// The advantage the remote client last reported for itself.
    pub remote_frame_advantage: i32,
}

impl NetworkStats {
    /// Creates a `NetworkStats` with default values.
    pub fn new() -> Self {
        Self::default()
    }
}
