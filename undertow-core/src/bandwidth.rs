//! Token-bucket bandwidth gate for piece traffic.
//!
//! Two buckets, one per direction. Refill is driven by the caller-supplied
//! `Instant` rather than wall time, so behaviour is identical under the
//! simulated clock. When throttling is disabled every reservation is
//! granted immediately.

use std::time::Instant;

use crate::config::ConnConfig;

/// Rate gate over ingress and egress piece bytes.
#[derive(Debug)]
pub struct BandwidthGate {
    disabled: bool,
    ingress: TokenBucket,
    egress: TokenBucket,
}

impl BandwidthGate {
    /// Builds a gate from connection config, starting refill at `now`.
    pub fn new(config: &ConnConfig, now: Instant) -> Self {
        Self {
            disabled: config.disable_throttling,
            ingress: TokenBucket::new(config.ingress_bytes_per_sec, now),
            egress: TokenBucket::new(config.egress_bytes_per_sec, now),
        }
    }

    /// Attempts to reserve `bytes` of download budget.
    pub fn try_reserve_ingress(&mut self, bytes: u64, now: Instant) -> bool {
        self.disabled || self.ingress.try_consume(bytes, now)
    }

    /// Attempts to reserve `bytes` of upload budget.
    pub fn try_reserve_egress(&mut self, bytes: u64, now: Instant) -> bool {
        self.disabled || self.egress.try_consume(bytes, now)
    }
}

/// Classic token bucket with injected refill time.
///
/// Capacity equals one second of budget, which bounds bursts to the
/// configured rate while letting a full-size piece through after idling.
#[derive(Debug)]
struct TokenBucket {
    capacity: u64,
    tokens: u64,
    refill_rate: u64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: u64, now: Instant) -> Self {
        let capacity = rate_per_sec.max(1);
        Self {
            capacity,
            tokens: capacity,
            refill_rate: capacity,
            last_refill: now,
        }
    }

    fn try_consume(&mut self, tokens: u64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let added = (elapsed.as_secs_f64() * self.refill_rate as f64) as u64;
        if added > 0 {
            self.tokens = (self.tokens + added).min(self.capacity);
            self.last_refill = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::ConnConfig;

    fn gate(rate: u64, now: Instant) -> BandwidthGate {
        let config = ConnConfig {
            ingress_bytes_per_sec: rate,
            egress_bytes_per_sec: rate,
            disable_throttling: false,
            ..ConnConfig::default()
        };
        BandwidthGate::new(&config, now)
    }

    #[test]
    fn test_starts_with_one_second_of_budget() {
        let now = Instant::now();
        let mut gate = gate(1000, now);
        assert!(gate.try_reserve_ingress(1000, now));
        assert!(!gate.try_reserve_ingress(1, now));
    }

    #[test]
    fn test_refill_follows_injected_clock() {
        let start = Instant::now();
        let mut gate = gate(1000, start);
        assert!(gate.try_reserve_egress(1000, start));
        assert!(!gate.try_reserve_egress(500, start));

        // Half a second of injected time restores half the budget.
        let later = start + Duration::from_millis(500);
        assert!(gate.try_reserve_egress(500, later));
        assert!(!gate.try_reserve_egress(1, later));
    }

    #[test]
    fn test_directions_are_independent() {
        let now = Instant::now();
        let mut gate = gate(100, now);
        assert!(gate.try_reserve_ingress(100, now));
        assert!(gate.try_reserve_egress(100, now));
    }

    #[test]
    fn test_capacity_never_exceeds_one_second() {
        let start = Instant::now();
        let mut gate = gate(100, start);
        let much_later = start + Duration::from_secs(3600);
        assert!(gate.try_reserve_ingress(100, much_later));
        assert!(!gate.try_reserve_ingress(1, much_later));
    }

    #[test]
    fn test_disabled_gate_admits_everything() {
        let now = Instant::now();
        let config = ConnConfig {
            disable_throttling: true,
            ingress_bytes_per_sec: 1,
            egress_bytes_per_sec: 1,
            ..ConnConfig::default()
        };
        let mut gate = BandwidthGate::new(&config, now);
        assert!(gate.try_reserve_ingress(u64::MAX, now));
        assert!(gate.try_reserve_egress(u64::MAX, now));
    }
}
