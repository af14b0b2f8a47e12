//! Test doubles for code that consumes an [`AssociationStore`].

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use kindwatch_core::{GroupVersionKind, NamespacedName, TrackedKey};

use crate::{AssociationStore, ManualClock, StoreError, TtlStore};

/// One `record` call as seen by a [`RecordingStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackRequest {
    pub tracked: TrackedKey,
    pub by: NamespacedName,
}

impl TrackRequest {
    pub fn new(group: &str, version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            tracked: TrackedKey::new(GroupVersionKind::new(group, version, kind), NamespacedName::new(namespace, name)),
            by: NamespacedName::default(),
        }
    }

    pub fn by(mut self, namespace: &str, name: &str) -> Self {
        self.by = NamespacedName::new(namespace, name);
        self
    }
}

/// A [`TtlStore`] on a [`ManualClock`] that remembers every `record` call and
/// can be told to fail them.
pub struct RecordingStore {
    inner: TtlStore<ManualClock>,
    clock: ManualClock,
    requests: Mutex<Vec<TrackRequest>>,
    fail_with: Mutex<Option<String>>,
}

impl RecordingStore {
    pub fn new(ttl: Duration) -> Self {
        let clock = ManualClock::new();
        Self {
            inner: TtlStore::with_clock(ttl, clock.clone()),
            clock,
            requests: Mutex::new(Vec::new()),
            fail_with: Mutex::new(None),
        }
    }

    /// Pairs never expire.
    pub fn forever() -> Self {
        Self::new(Duration::MAX)
    }

    /// Pairs are already expired when first queried.
    pub fn expired() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn track_requests(&self) -> Vec<TrackRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Make subsequent `record` calls fail with `reason`; `None` restores normal behaviour.
    pub fn fail_records(&self, reason: Option<&str>) {
        *self.fail_with.lock().unwrap_or_else(PoisonError::into_inner) = reason.map(str::to_string);
    }
}

impl AssociationStore for RecordingStore {
    fn record(&self, key: &TrackedKey, dependent: &NamespacedName) -> Result<(), StoreError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(TrackRequest { tracked: key.clone(), by: dependent.clone() });
        if let Some(reason) = self.fail_with.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            return Err(StoreError::Rejected { key: key.to_string(), reason });
        }
        self.inner.record(key, dependent)
    }

    fn query(&self, key: &TrackedKey) -> Vec<NamespacedName> {
        self.inner.query(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_requests_even_when_failing() {
        let store = RecordingStore::forever();
        let tr = TrackRequest::new("g", "v1", "k", "ns", "a").by("ns", "dep");
        store.record(&tr.tracked, &tr.by).unwrap();
        store.fail_records(Some("boom"));
        assert!(matches!(store.record(&tr.tracked, &tr.by), Err(StoreError::Rejected { .. })));
        assert_eq!(store.track_requests(), vec![tr.clone(), tr.clone()]);
        assert_eq!(store.query(&tr.tracked), vec![tr.by]);
    }
}
