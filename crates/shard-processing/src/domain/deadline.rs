//! Caller-supplied time budget for one block attempt.

use std::time::Duration;
use tokio::time::Instant;

/// Point in time after which a block attempt must give up.
///
/// Built on `tokio::time::Instant` so paused-clock tests control it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    /// Deadline at a fixed instant.
    pub fn at(at: Instant) -> Self {
        Self { at }
    }

    /// Deadline that has already passed.
    pub fn expired() -> Self {
        Self { at: Instant::now() }
    }

    /// Time left, zero once passed.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// True while there is time left.
    pub fn has_time(&self) -> bool {
        !self.remaining().is_zero()
    }

    /// The underlying instant.
    pub fn instant(&self) -> Instant {
        self.at
    }
}
