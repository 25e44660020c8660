//! Wall-clock milliseconds derived from the runtime's monotonic timer.
//!
//! Anchoring to `tokio::time::Instant` keeps pipeline timestamps in step
//! with paused/advanced time in tests.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct PipelineClock {
    epoch_unix_ms: i64,
    started: Instant,
}

impl PipelineClock {
    pub fn system() -> Self {
        let epoch_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis() as i64)
            .unwrap_or(0);
        Self::starting_at(epoch_unix_ms)
    }

    pub fn starting_at(epoch_unix_ms: i64) -> Self {
        Self {
            epoch_unix_ms,
            started: Instant::now(),
        }
    }

    pub fn now_unix_ms(&self) -> i64 {
        let elapsed = i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.epoch_unix_ms.saturating_add(elapsed)
    }
}
