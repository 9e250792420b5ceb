//! Scheduler configuration.
//!
//! All tunable parameters live here, grouped into sections. Defaults are
//! production-shaped; [`SchedulerConfig::for_testing`] tightens every timer
//! so simulated scenarios converge in milliseconds of clock time.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tracker announce cadence and retry behaviour.
    pub announce: AnnounceConfig,
    /// Per-connection protocol parameters.
    pub conn: ConnConfig,
    /// Connection admission caps and blacklist policy.
    pub conn_state: ConnStateConfig,

    /// Active connections idle longer than this are closed and blacklisted.
    pub conn_tti: Duration,
    /// Seeding torrents with no piece transfer for this long are evicted.
    pub seeder_tti: Duration,
    /// Downloads that have not completed within this window fail with a
    /// timeout and are evicted.
    pub leecher_tti: Duration,
    /// Connections older than this are preempted regardless of activity,
    /// spreading peer diversity over long seeding sessions.
    pub conn_ttl: Duration,
    /// How often the eviction and TTL sweep runs.
    pub preemption_interval: Duration,
    /// How often scheduler counters are logged.
    pub emit_stats_interval: Duration,
    /// Grace period for draining on stop before the loop is abandoned.
    pub stop_timeout: Duration,
    /// Once this few pieces remain, the dispatcher enters end-game and may
    /// request the same piece from several peers at once.
    pub endgame_threshold: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            announce: AnnounceConfig::default(),
            conn: ConnConfig::default(),
            conn_state: ConnStateConfig::default(),
            conn_tti: Duration::from_secs(30),
            seeder_tti: Duration::from_secs(5 * 60),
            leecher_tti: Duration::from_secs(15 * 60),
            conn_ttl: Duration::from_secs(60 * 60),
            preemption_interval: Duration::from_secs(30),
            emit_stats_interval: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(10),
            endgame_threshold: 5,
        }
    }
}

impl SchedulerConfig {
    /// Configuration with tight timers for simulated scenarios.
    pub fn for_testing() -> Self {
        Self {
            announce: AnnounceConfig {
                interval: Duration::from_millis(500),
                backoff_base: Duration::from_millis(100),
                backoff_max: Duration::from_secs(2),
            },
            conn: ConnConfig {
                handshake_timeout: Duration::from_secs(5),
                piece_request_timeout: Duration::from_secs(5),
                ..ConnConfig::default()
            },
            conn_state: ConnStateConfig::default(),
            conn_tti: Duration::from_secs(10),
            seeder_tti: Duration::from_secs(20),
            leecher_tti: Duration::from_secs(60),
            conn_ttl: Duration::from_secs(5 * 60),
            preemption_interval: Duration::from_secs(5),
            emit_stats_interval: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            endgame_threshold: 5,
        }
    }
}

/// Tracker announce settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnounceConfig {
    /// Nominal interval between announces; each round is jittered ±20%.
    pub interval: Duration,
    /// First retry delay after an announce failure.
    pub backoff_base: Duration,
    /// Ceiling for exponential announce backoff.
    pub backoff_max: Duration,
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

/// Per-connection protocol parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnConfig {
    /// Deadline for completing the dial + handshake exchange.
    pub handshake_timeout: Duration,
    /// Deadline for each outstanding piece request.
    pub piece_request_timeout: Duration,
    /// Request timeouts tolerated before the connection is closed.
    pub request_strike_limit: u32,
    /// Maximum piece requests in flight per connection.
    pub pipeline_depth: u32,
    /// When set, every bandwidth reservation is granted immediately.
    pub disable_throttling: bool,
    /// Download budget in bytes per second.
    pub ingress_bytes_per_sec: u64,
    /// Upload budget in bytes per second.
    pub egress_bytes_per_sec: u64,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            piece_request_timeout: Duration::from_secs(15),
            request_strike_limit: 3,
            pipeline_depth: 8,
            disable_throttling: false,
            ingress_bytes_per_sec: 200 * 1024 * 1024,
            egress_bytes_per_sec: 200 * 1024 * 1024,
        }
    }
}

/// Connection admission and blacklist policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnStateConfig {
    /// Cap on non-closed connections per torrent.
    pub max_open_connections_per_torrent: usize,
    /// Cap on non-closed connections across all torrents.
    pub max_global_connections: usize,
    /// How long a (peer, torrent) pair stays banned after misbehaviour or
    /// idleness.
    pub blacklist_duration: Duration,
}

impl Default for ConnStateConfig {
    fn default() -> Self {
        Self {
            max_open_connections_per_torrent: 10,
            max_global_connections: 1000,
            blacklist_duration: Duration::from_secs(30),
        }
    }
}
