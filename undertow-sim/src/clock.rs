//! Manually advanced clock.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::oneshot;
use undertow_core::Clock;

/// Clock whose time only moves when a test advances it.
///
/// Sleepers register their deadline and are woken by [`advance`]. Time
/// never moves backwards, and sleeps that are already due complete
/// immediately, so scenarios run in discrete ticks independent of wall
/// time.
///
/// [`advance`]: SimulatedClock::advance
pub struct SimulatedClock {
    inner: Mutex<ClockInner>,
}

struct ClockInner {
    now: Instant,
    sleepers: Vec<(Instant, oneshot::Sender<()>)>,
}

impl SimulatedClock {
    /// Creates a clock starting at an arbitrary epoch.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ClockInner {
                now: Instant::now(),
                sleepers: Vec::new(),
            }),
        }
    }

    /// Moves time forward and wakes every sleeper whose deadline passed.
    ///
    /// Yields to the runtime briefly first so freshly spawned timer tasks
    /// get a chance to register their deadlines against the old time.
    pub async fn advance(&self, duration: Duration) {
        tokio::time::sleep(Duration::from_millis(2)).await;
        let woken: Vec<oneshot::Sender<()>> = {
            let mut inner = self.inner.lock().expect("clock lock poisoned");
            inner.now += duration;
            let now = inner.now;
            let mut woken = Vec::new();
            inner.sleepers.retain_mut(|(deadline, tx)| {
                if *deadline <= now {
                    // retain_mut gives us &mut; swap the sender out.
                    let (dummy_tx, _dummy_rx) = oneshot::channel();
                    woken.push(std::mem::replace(tx, dummy_tx));
                    false
                } else {
                    true
                }
            });
            woken
        };
        tracing::debug!(?duration, sleepers_woken = woken.len(), "simulated clock advanced");
        for tx in woken {
            let _ = tx.send(());
        }
        // Let woken tasks run before the test continues.
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    /// Current simulated time.
    pub fn now_instant(&self) -> Instant {
        self.inner.lock().expect("clock lock poisoned").now
    }
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SimulatedClock {
    fn now(&self) -> Instant {
        self.now_instant()
    }

    async fn sleep(&self, duration: Duration) {
        let rx = {
            let mut inner = self.inner.lock().expect("clock lock poisoned");
            let deadline = inner.now + duration;
            if deadline <= inner.now {
                return;
            }
            let (tx, rx) = oneshot::channel();
            inner.sleepers.push((deadline, tx));
            rx
        };
        // A dropped sender means the clock itself went away; sleeping
        // forever is the right behaviour for an orphaned timer.
        if rx.await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_sleep_completes_only_after_advance() {
        let clock = Arc::new(SimulatedClock::new());
        let sleeper = {
            let clock = clock.clone();
            tokio::spawn(async move { clock.sleep(Duration::from_secs(10)).await })
        };

        clock.advance(Duration::from_secs(5)).await;
        assert!(!sleeper.is_finished());

        clock.advance(Duration::from_secs(5)).await;
        sleeper.await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_sleep_returns_immediately() {
        let clock = SimulatedClock::new();
        clock.sleep(Duration::ZERO).await;
    }

    #[tokio::test]
    async fn test_single_advance_wakes_multiple_sleepers() {
        let clock = Arc::new(SimulatedClock::new());
        let mut sleepers = Vec::new();
        for i in 1..=3u64 {
            let clock = clock.clone();
            sleepers.push(tokio::spawn(async move {
                clock.sleep(Duration::from_secs(i)).await;
            }));
        }
        clock.advance(Duration::from_secs(3)).await;
        for sleeper in sleepers {
            sleeper.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_now_reflects_advancement() {
        let clock = SimulatedClock::new();
        let before = clock.now();
        clock.advance(Duration::from_secs(30)).await;
        assert_eq!(clock.now().duration_since(before), Duration::from_secs(30));
    }
}
