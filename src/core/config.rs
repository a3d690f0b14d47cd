//! Runtime configuration for a consensus node

use std::time::Duration;

use rand::Rng;

/// Timing and compaction parameters for a node.
///
/// The election timeout must be much larger than the heartbeat interval,
/// which in turn must be much larger than the expected network round trip.
/// The timeout is randomized per election from `[election_timeout_min,
/// election_timeout_max]` to break split votes.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Interval between leader heartbeats.
    pub heartbeat_interval: Duration,
    /// Lower bound of the randomized election timeout.
    pub election_timeout_min: Duration,
    /// Upper bound of the randomized election timeout.
    pub election_timeout_max: Duration,
    /// Applied entries between automatic snapshots (0 disables them).
    pub snapshot_threshold: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            snapshot_threshold: 1000,
        }
    }
}

impl RaftConfig {
    /// Config with timeouts scaled for tests driven by virtual time.
    pub fn with_timeouts(heartbeat: Duration, election_min: Duration, election_max: Duration) -> Self {
        RaftConfig {
            heartbeat_interval: heartbeat,
            election_timeout_min: election_min,
            election_timeout_max: election_max,
            ..Default::default()
        }
    }

    pub fn snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    /// Draw a fresh randomized election timeout.
    pub fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        if min >= max {
            return self.election_timeout_min;
        }
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}
