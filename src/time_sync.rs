use tracing::trace;

use crate::Frame;

/// Default window size for the frame-advantage rolling average.
const DEFAULT_FRAME_WINDOW_SIZE: usize = 40;

/// Below this average advantage no sleep is recommended; tiny imbalances
/// resolve themselves through normal jitter.
const DEFAULT_MIN_FRAME_ADVANTAGE: i32 = 2;

/// Recommendations are clamped to this many frames.
const DEFAULT_MAX_FRAME_ADVANTAGE: i32 = 9;

/// Configuration for the time synchronization behavior.
///
/// Time sync tracks local and remote frame advantages over a sliding window
/// to decide how many frames the faster peer should give up so the slower
/// one can catch up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSyncConfig {
    /// The number of samples averaged when calculating frame advantage.
    /// A larger window is more stable but slower to react to network
    /// changes.
    pub window_size: usize,
    /// Averages below this value produce no recommendation.
    pub min_frame_advantage: i32,
    /// Recommendations never exceed this many frames.
    pub max_frame_advantage: i32,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_FRAME_WINDOW_SIZE,
            min_frame_advantage: DEFAULT_MIN_FRAME_ADVANTAGE,
            max_frame_advantage: DEFAULT_MAX_FRAME_ADVANTAGE,
        }
    }
}

impl TimeSyncConfig {
    /// Creates a `TimeSyncConfig` with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Rolling-window frame-advantage estimator for one peer connection.
///
/// Every running frame records the local advantage (how many frames we are
/// ahead of the peer, negative when behind) and the advantage the peer last
/// reported for itself. [`recommended_wait`](TimeSync::recommended_wait)
/// turns the averages into a number of frames the local client should idle.
#[derive(Debug)]
pub struct TimeSync {
    local: Vec<i32>,
    remote: Vec<i32>,
    min_frame_advantage: i32,
    max_frame_advantage: i32,
}

impl Default for TimeSync {
    fn default() -> Self {
        Self::with_config(TimeSyncConfig::default())
    }
}

impl TimeSync {
    /// Creates a new `TimeSync` with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new `TimeSync` with the given configuration.
    #[must_use]
    pub fn with_config(config: TimeSyncConfig) -> Self {
        let window_size = config.window_size.max(1);
        Self {
            local: vec![0; window_size],
            remote: vec![0; window_size],
            min_frame_advantage: config.min_frame_advantage,
            max_frame_advantage: config.max_frame_advantage,
        }
    }

    /// Records the advantage pair observed at `frame`.
    pub fn advance_frame(&mut self, frame: Frame, local_adv: i32, remote_adv: i32) {
        // Invalid frames can show up during initialization edge cases; skip
        // the sample instead of indexing with a negative frame.
        if !frame.is_valid() {
            trace!("time sync skipping sample for invalid frame {:?}", frame);
            return;
        }
        let idx = frame.as_i32() as usize % self.local.len();
        self.local[idx] = local_adv;
        self.remote[idx] = remote_adv;
    }

    /// The number of frames the local client should idle to let the peer
    /// catch up, or 0 when the local client is not meaningfully ahead.
    #[must_use]
    pub fn recommended_wait(&self) -> u32 {
        let local_sum: i32 = self.local.iter().sum();
        let local_avg = local_sum as f32 / self.local.len() as f32;
        let remote_sum: i32 = self.remote.iter().sum();
        let remote_avg = remote_sum as f32 / self.remote.len() as f32;

        // the peer is ahead of us (or even); sleeping would only widen the gap
        if local_avg < remote_avg {
            return 0;
        }

        // meet in the middle
        let sleep_frames = ((local_avg - remote_avg) / 2.0) as i32;
        if sleep_frames < self.min_frame_advantage {
            return 0;
        }
        sleep_frames.clamp(0, self.max_frame_advantage) as u32
    }
}

// #########
// # TESTS #
// #########
