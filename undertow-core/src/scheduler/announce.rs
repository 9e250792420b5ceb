//! Announce driver.
//!
//! Each torrent announces immediately on entry and then on a jittered
//! interval; failures back off exponentially until the next success. The
//! tracker call itself runs in a spawned task so the loop never blocks on
//! it; the task reports back with an `AnnounceResponse` event and the loop
//! arms the next round with an `AnnounceTick` timer.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;

use super::events::{EventQueue, SchedulerEvent};
use crate::clock::Clock;
use crate::config::AnnounceConfig;
use crate::torrent::{InfoHash, PeerHandle};
use crate::tracker::TrackerClient;

/// Jitter applied to the nominal announce interval, as a fraction.
const ANNOUNCE_JITTER: f64 = 0.2;

/// Computes the delay before the next announce round.
///
/// Zero failures yields the nominal interval jittered by up to ±20%;
/// otherwise the delay doubles per failure from `backoff_base`, capped at
/// `backoff_max`.
pub fn next_announce_delay(
    config: &AnnounceConfig,
    failures: u32,
    rng: &mut impl Rng,
) -> Duration {
    if failures == 0 {
        let jitter = rng.gen_range(-ANNOUNCE_JITTER..=ANNOUNCE_JITTER);
        return config.interval.mul_f64(1.0 + jitter);
    }
    let exponent = failures.saturating_sub(1).min(16);
    let backoff = config
        .backoff_base
        .saturating_mul(1u32 << exponent)
        .min(config.backoff_max);
    backoff.max(config.backoff_base)
}

/// Runs one tracker announce in the background and posts the result.
pub(crate) fn spawn_announce(
    tracker: Arc<dyn TrackerClient>,
    info_hash: InfoHash,
    local: PeerHandle,
    complete: bool,
    queue: EventQueue,
) {
    tokio::spawn(async move {
        let result = tracker.announce(info_hash, local, complete).await;
        let _ = queue
            .post(SchedulerEvent::AnnounceResponse { info_hash, result })
            .await;
    });
}

/// Arms the timer for the next announce round.
pub(crate) fn spawn_announce_timer(
    clock: Arc<dyn Clock>,
    delay: Duration,
    info_hash: InfoHash,
    queue: EventQueue,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        clock.sleep(delay).await;
        let _ = queue.post(SchedulerEvent::AnnounceTick { info_hash }).await;
    })
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn config() -> AnnounceConfig {
        AnnounceConfig {
            interval: Duration::from_secs(10),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_healthy_interval_stays_within_jitter() {
        let config = config();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..100 {
            let delay = next_announce_delay(&config, 0, &mut rng);
            assert!(delay >= Duration::from_secs(8), "{delay:?}");
            assert!(delay <= Duration::from_secs(12), "{delay:?}");
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = config();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(
            next_announce_delay(&config, 1, &mut rng),
            Duration::from_secs(1)
        );
        assert_eq!(
            next_announce_delay(&config, 2, &mut rng),
            Duration::from_secs(2)
        );
        assert_eq!(
            next_announce_delay(&config, 3, &mut rng),
            Duration::from_secs(4)
        );
        assert_eq!(
            next_announce_delay(&config, 10, &mut rng),
            Duration::from_secs(30)
        );
        // Far past the cap the shift must not overflow.
        assert_eq!(
            next_announce_delay(&config, 40, &mut rng),
            Duration::from_secs(30)
        );
    }
}
