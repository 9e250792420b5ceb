//! Injectable time source.
//!
//! Every time-based decision in the scheduler (idle eviction, announce
//! cadence, blacklist expiry, request timeouts, preemption ticks) reads the
//! injected clock, never wall time. Production uses [`SystemClock`]; tests
//! substitute a manually advanced clock so scenarios run in discrete ticks.

use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Monotonic time capability.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// Current monotonic time.
    fn now(&self) -> Instant;

    /// Completes once `duration` of clock time has elapsed.
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by the tokio timer wheel.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
