//! The connection handshake: repeated nonce roundtrips that weed out stale
//! peers and establish the remote connection tag.

use std::collections::BTreeSet;

use web_time::{Duration, Instant};

use crate::network::messages::{SyncReply, SyncRequest};

/// Outcome of feeding a `SyncReply` to the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncProgress {
    /// The reply did not match any outstanding nonce.
    Ignored,
    /// One more roundtrip completed; more are required.
    Step {
        count: u32,
        total: u32,
    },
    /// All roundtrips completed.
    Finished {
        /// Total handshake duration; divided by the roundtrip count this
        /// gives a first ping estimate.
        elapsed: Duration,
    },
}

/// Handshake bookkeeping for one peer connection.
///
/// Both sides keep sending `SyncRequest`s carrying random nonces until the
/// required number of matching `SyncReply`s came back. Replies that answer
/// a nonce we never sent (stale peers, forged packets) are ignored.
pub(crate) struct Handshake {
    total_roundtrips: u32,
    roundtrips_remaining: u32,
    pending_nonces: BTreeSet<u32>,
    started_at: Instant,
    timeout: Option<Duration>,
    timeout_reported: bool,
    requests_sent: u32,
}

impl Handshake {
    pub(crate) fn new(total_roundtrips: u32, timeout: Option<Duration>) -> Self {
        Self {
            total_roundtrips: total_roundtrips.max(1),
            roundtrips_remaining: total_roundtrips.max(1),
            pending_nonces: BTreeSet::new(),
            started_at: Instant::now(),
            timeout,
            timeout_reported: false,
            requests_sent: 0,
        }
    }

    /// Restarts the roundtrip counter and the failure clock.
    pub(crate) fn begin(&mut self) {
        self.roundtrips_remaining = self.total_roundtrips;
        self.started_at = Instant::now();
        self.timeout_reported = false;
    }

    /// Produces the next request to transmit, remembering its nonce.
    pub(crate) fn next_request(&mut self, remote_magic: u16) -> SyncRequest {
        let nonce: u32 = rand::random();
        self.pending_nonces.insert(nonce);
        self.requests_sent += 1;
        SyncRequest {
            random_request: nonce,
            remote_magic,
            remote_endpoint: 0,
        }
    }

    /// Answers an incoming request. Requests are always answered, even while
    /// this side already finished its own roundtrips.
    pub(crate) fn reply_to(request: SyncRequest) -> SyncReply {
        SyncReply {
            random_reply: request.random_request,
        }
    }

    /// Feeds a reply into the handshake.
    pub(crate) fn on_reply(&mut self, reply: SyncReply) -> SyncProgress {
        if !self.pending_nonces.remove(&reply.random_reply) {
            return SyncProgress::Ignored;
        }
        self.roundtrips_remaining = self.roundtrips_remaining.saturating_sub(1);
        if self.roundtrips_remaining > 0 {
            SyncProgress::Step {
                count: self.total_roundtrips - self.roundtrips_remaining,
                total: self.total_roundtrips,
            }
        } else {
            SyncProgress::Finished {
                elapsed: self.started_at.elapsed(),
            }
        }
    }

    /// Whether the handshake has exceeded its failure timeout. Reports only
    /// once per `begin`.
    pub(crate) fn check_timeout(&mut self) -> bool {
        let Some(timeout) = self.timeout else {
            return false;
        };
        if !self.timeout_reported && self.started_at.elapsed() > timeout {
            self.timeout_reported = true;
            return true;
        }
        false
    }

    pub(crate) fn total_roundtrips(&self) -> u32 {
        self.total_roundtrips
    }
}

// #########
// # TESTS #
// #########
