//! kindwatch store: expiring (tracked key -> dependent) associations.
//!
//! Expiry is lazy. Nothing sweeps in the background; pairs whose TTL elapsed
//! are dropped the next time their key is queried (or when the store is full).

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use kindwatch_core::{Config, NamespacedName, TrackedKey};
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

mod clock;
pub mod testing;

pub use clock::{Clock, ManualClock, SystemClock};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("association store full ({cap} pairs); cannot track {key}")]
    Full { cap: usize, key: String },
    #[error("association store rejected {key}: {reason}")]
    Rejected { key: String, reason: String },
}

/// Records which dependents care about which tracked keys, for a limited time.
pub trait AssociationStore: Send + Sync {
    /// Store the pair with a fresh expiry. Re-recording an existing pair only refreshes it.
    fn record(&self, key: &TrackedKey, dependent: &NamespacedName) -> Result<(), StoreError>;

    /// Dependents of `key` whose association has not expired, in insertion order.
    /// Expired pairs for `key` are dropped.
    fn query(&self, key: &TrackedKey) -> Vec<NamespacedName>;
}

impl<S: AssociationStore + ?Sized> AssociationStore for Arc<S> {
    fn record(&self, key: &TrackedKey, dependent: &NamespacedName) -> Result<(), StoreError> {
        (**self).record(key, dependent)
    }

    fn query(&self, key: &TrackedKey) -> Vec<NamespacedName> {
        (**self).query(key)
    }
}

#[derive(Debug, Clone)]
struct Association {
    dependent: NamespacedName,
    /// `None` when the TTL overflows the clock: never expires.
    expires_at: Option<Instant>,
}

impl Association {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |t| now < t)
    }
}

#[derive(Default)]
struct Inner {
    map: FxHashMap<TrackedKey, Vec<Association>>,
    len: usize,
}

impl Inner {
    /// Drop expired pairs under `key`; returns how many were dropped.
    fn purge_key(&mut self, key: &TrackedKey, now: Instant) -> usize {
        let Some(list) = self.map.get_mut(key) else { return 0 };
        let before = list.len();
        list.retain(|a| a.live(now));
        let dropped = before - list.len();
        if list.is_empty() {
            self.map.remove(key);
        }
        self.len -= dropped;
        dropped
    }

    fn purge_all(&mut self, now: Instant) -> usize {
        let before = self.len;
        self.map.retain(|_, list| {
            list.retain(|a| a.live(now));
            !list.is_empty()
        });
        self.len = self.map.values().map(Vec::len).sum();
        before - self.len
    }
}

/// In-memory [`AssociationStore`] with a fixed time-to-live per pair.
pub struct TtlStore<C: Clock = SystemClock> {
    ttl: Duration,
    cap: Option<usize>,
    clock: C,
    inner: Mutex<Inner>,
}

impl TtlStore<SystemClock> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, SystemClock)
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.track_ttl).with_capacity(cfg.max_associations)
    }
}

impl<C: Clock> TtlStore<C> {
    pub fn with_clock(ttl: Duration, clock: C) -> Self {
        Self { ttl, cap: None, clock, inner: Mutex::new(Inner::default()) }
    }

    /// Bound the number of stored pairs. `None` means unbounded.
    pub fn with_capacity(mut self, cap: Option<usize>) -> Self {
        self.cap = cap;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of stored pairs, including expired ones not yet dropped.
    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: Clock> AssociationStore for TtlStore<C> {
    fn record(&self, key: &TrackedKey, dependent: &NamespacedName) -> Result<(), StoreError> {
        let now = self.clock.now();
        let expires_at = now.checked_add(self.ttl);
        let mut inner = self.lock();
        let expired = inner.purge_key(key, now);
        if expired > 0 {
            counter!("store_expired_total", expired as u64);
        }

        if let Some(existing) = inner
            .map
            .get_mut(key)
            .and_then(|list| list.iter_mut().find(|a| &a.dependent == dependent))
        {
            existing.expires_at = expires_at;
            return Ok(());
        }

        if let Some(cap) = self.cap {
            if inner.len >= cap {
                let swept = inner.purge_all(now);
                if swept > 0 {
                    counter!("store_expired_total", swept as u64);
                    debug!(swept, "store: swept expired pairs at capacity");
                }
                if inner.len >= cap {
                    warn!(cap, key = %key, by = %dependent, "store: at capacity; refusing new pair");
                    return Err(StoreError::Full { cap, key: key.to_string() });
                }
            }
        }

        inner
            .map
            .entry(key.clone())
            .or_default()
            .push(Association { dependent: dependent.clone(), expires_at });
        inner.len += 1;
        gauge!("store_associations", inner.len as f64);
        Ok(())
    }

    fn query(&self, key: &TrackedKey) -> Vec<NamespacedName> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let expired = inner.purge_key(key, now);
        if expired > 0 {
            counter!("store_expired_total", expired as u64);
            gauge!("store_associations", inner.len as f64);
            debug!(key = %key, expired, "store: dropped expired pairs");
        }
        inner
            .map
            .get(key)
            .map(|list| list.iter().map(|a| a.dependent.clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindwatch_core::GroupVersionKind;

    fn key(name: &str) -> TrackedKey {
        TrackedKey::new(GroupVersionKind::new("g", "v1", "k"), NamespacedName::new("ns", name))
    }

    fn dep(name: &str) -> NamespacedName {
        NamespacedName::new("ns", name)
    }

    #[test]
    fn query_returns_live_pairs_in_insertion_order() {
        let clock = ManualClock::new();
        let store = TtlStore::with_clock(Duration::from_secs(10), clock.clone());
        store.record(&key("a"), &dep("d1")).unwrap();
        store.record(&key("a"), &dep("d2")).unwrap();
        store.record(&key("b"), &dep("d3")).unwrap();
        assert_eq!(store.query(&key("a")), vec![dep("d1"), dep("d2")]);
        assert_eq!(store.query(&key("b")), vec![dep("d3")]);
        assert!(store.query(&key("c")).is_empty());
    }

    #[test]
    fn re_record_refreshes_without_duplicating() {
        let clock = ManualClock::new();
        let store = TtlStore::with_clock(Duration::from_secs(10), clock.clone());
        store.record(&key("a"), &dep("d1")).unwrap();
        store.record(&key("a"), &dep("d2")).unwrap();
        clock.advance(Duration::from_secs(8));
        store.record(&key("a"), &dep("d1")).unwrap();
        assert_eq!(store.len(), 2);

        // d2 expires at t=10, the refreshed d1 lives until t=18 and keeps its position.
        clock.advance(Duration::from_secs(4));
        assert_eq!(store.query(&key("a")), vec![dep("d1")]);
        assert_eq!(store.len(), 1);

        clock.advance(Duration::from_secs(6));
        assert!(store.query(&key("a")).is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn zero_ttl_expires_before_first_query() {
        let store = TtlStore::with_clock(Duration::ZERO, ManualClock::new());
        store.record(&key("a"), &dep("d1")).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.query(&key("a")).is_empty());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn max_ttl_never_expires() {
        let clock = ManualClock::new();
        let store = TtlStore::with_clock(Duration::MAX, clock.clone());
        store.record(&key("a"), &dep("d1")).unwrap();
        clock.advance(Duration::from_secs(60 * 60 * 24 * 365));
        assert_eq!(store.query(&key("a")), vec![dep("d1")]);
    }

    #[test]
    fn capacity_rejects_new_pairs_but_allows_refresh() {
        let clock = ManualClock::new();
        let store = TtlStore::with_clock(Duration::from_secs(10), clock.clone()).with_capacity(Some(2));
        store.record(&key("a"), &dep("d1")).unwrap();
        store.record(&key("b"), &dep("d2")).unwrap();
        assert_eq!(
            store.record(&key("c"), &dep("d3")),
            Err(StoreError::Full { cap: 2, key: key("c").to_string() })
        );
        store.record(&key("a"), &dep("d1")).unwrap();

        // Once b's pair has expired the sweep makes room.
        clock.advance(Duration::from_secs(9));
        store.record(&key("a"), &dep("d1")).unwrap();
        clock.advance(Duration::from_secs(2));
        store.record(&key("c"), &dep("d3")).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.query(&key("b")).is_empty());
    }
}
