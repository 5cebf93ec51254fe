//! Loop-mode pacing.
//!
//! A looping command must not start a new iteration sooner than its minimum
//! loop time after the previous iteration started.

use std::time::Duration;

use tokio::time::Instant;

/// Timing of one loop iteration.
#[derive(Debug, Clone, Copy)]
pub struct LoopPacing {
    /// Minimum time between iteration starts.
    pub min_loop_time: Duration,
    /// When the current iteration started.
    pub started_at: Instant,
}

impl LoopPacing {
    pub fn new(min_loop_time: Duration, started_at: Instant) -> Self {
        Self {
            min_loop_time,
            started_at,
        }
    }

    /// Earliest moment the next iteration may start.
    pub fn ready_at(&self) -> Instant {
        self.started_at + self.min_loop_time
    }

    /// Delay still owed before the next iteration, zero if already due.
    pub fn remaining(&self) -> Duration {
        self.ready_at().saturating_duration_since(Instant::now())
    }
}
