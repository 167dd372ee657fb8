//! Wall-clock SimulationContext backed by Tokio.

use crate::SimulationContext;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Real-time context for runs against a live deployment.
///
/// Run timeouts measured against this context are wall-clock timeouts.
/// `system_time` is derived from the monotonic clock, so record timestamps
/// never go backwards during a run even if the system clock is adjusted.
pub struct TokioContext {
    started: Instant,
    epoch: SystemTime,
}

impl TokioContext {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            epoch: SystemTime::now(),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SimulationContext for TokioContext {
    fn now(&self) -> Duration {
        self.started.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.started.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(duration).await;
        }
    }

    fn seed(&self) -> u64 {
        0
    }
}
