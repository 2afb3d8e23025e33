//! Delay policies: exponential backoff for retrying a single operation, and
//! an adaptive per-batch delay driven by how many verifications succeeded.

use std::time::Duration;

/// Exponential backoff, `base * factor^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub factor: u32,
}

impl Backoff {
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            factor: 2,
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(multiplier)
            .map_or(self.max, |d| d.min(self.max))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(2))
    }
}

/// Pause between batches, longer the worse the last batch went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveDelay {
    /// Majority of the batch succeeded.
    pub healthy: Duration,
    /// Some successes, but not a majority.
    pub degraded: Duration,
    /// Nothing succeeded.
    pub stalled: Duration,
}

impl AdaptiveDelay {
    pub fn for_batch(&self, successes: usize, attempted: usize) -> Duration {
        if successes == 0 {
            self.stalled
        } else if successes * 2 < attempted {
            self.degraded
        } else {
            self.healthy
        }
    }
}

impl Default for AdaptiveDelay {
    fn default() -> Self {
        Self {
            healthy: Duration::from_secs(2),
            degraded: Duration::from_secs(5),
            stalled: Duration::from_secs(10),
        }
    }
}
