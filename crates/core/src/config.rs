//! Runtime configuration read from `KINDWATCH_*` environment variables.

use std::time::Duration;

pub const ENV_TRACK_TTL_SECS: &str = "KINDWATCH_TRACK_TTL_SECS";
pub const ENV_MAX_ASSOCIATIONS: &str = "KINDWATCH_MAX_ASSOCIATIONS";
pub const ENV_QUEUE_CAP: &str = "KINDWATCH_QUEUE_CAP";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// How long a tracked dependency stays live without being re-tracked.
    pub track_ttl: Duration,
    /// Upper bound on stored (tracked key, dependent) pairs; unbounded when `None`.
    pub max_associations: Option<usize>,
    /// Capacity of the observed-object and reconcile-request channels.
    pub queue_cap: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self { track_ttl: Duration::from_secs(300), max_associations: None, queue_cap: 2048 }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary variable source. Unparseable values fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let track_ttl = get(ENV_TRACK_TTL_SECS)
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(d.track_ttl);
        let max_associations = get(ENV_MAX_ASSOCIATIONS).and_then(|s| s.parse::<usize>().ok());
        let queue_cap = get(ENV_QUEUE_CAP)
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(d.queue_cap);
        Self { track_ttl, max_associations, queue_cap }
    }
}
