//! kindwatch tracker: records dynamic dependencies and keeps exactly one watch
//! open per group-kind that something still depends on.
//!
//! `track` opens the watch the first time a group-kind is referenced.
//! `lookup` reports dependents and, when a key has no live association left,
//! drops it; the watch is cancelled once its group-kind has no live keys.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use kindwatch_core::{GroupKind, GroupVersionKind, NamespacedName, TrackedKey};
use kindwatch_store::{AssociationStore, StoreError};
use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Span};

mod establish;

pub use establish::{establish_fn, CancelHandle, EstablishFn, WatchEstablisher};

#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    /// The establisher could not open a watch. Displays the establisher's message as-is.
    #[error("{source}")]
    Establish { gvk: GroupVersionKind, source: anyhow::Error },
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The caller's context fired, or the tracker shut down, before the watch was open.
    #[error("cancelled while establishing watch for {gvk}")]
    Cancelled { gvk: GroupVersionKind },
}

/// What dependents and event adapters need from a tracker.
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Declare that `dependent` must be re-reconciled when `key` changes.
    async fn track(&self, ctx: &CancellationToken, key: &TrackedKey, dependent: &NamespacedName) -> Result<(), TrackError>;

    /// Dependents of `key` that are still live. Never fails; a miss is empty.
    fn lookup(&self, key: &TrackedKey) -> Vec<NamespacedName>;
}

struct ActiveWatch {
    /// Version the watch was opened with; later versions of the kind share it.
    gvk: GroupVersionKind,
    live: FxHashSet<TrackedKey>,
    cancel: CancelHandle,
}

/// Outcome of an establish call, published to callers waiting on it.
#[derive(Clone, Debug)]
enum Settled {
    Watching,
    Failed(String),
    Shutdown,
}

type SettledRx = watch::Receiver<Option<Settled>>;
type SettledTx = watch::Sender<Option<Settled>>;

enum KindState {
    /// An establish call is in flight. The sender closes without a value if
    /// the establishing caller is cancelled or dropped.
    Establishing(SettledRx),
    Watching(ActiveWatch),
}

type Kinds = FxHashMap<GroupKind, KindState>;

fn lock_kinds(kinds: &Mutex<Kinds>) -> MutexGuard<'_, Kinds> {
    kinds.lock().unwrap_or_else(PoisonError::into_inner)
}

fn watching_count(kinds: &Kinds) -> usize {
    kinds.values().filter(|s| matches!(s, KindState::Watching(_))).count()
}

/// Clears the `Establishing` marker unless disarmed, then wakes waiters by
/// dropping the sender. Covers establish failure and a dropped `track` future.
struct EstablishGuard<'a> {
    kinds: &'a Mutex<Kinds>,
    gk: GroupKind,
    armed: bool,
    settled: SettledTx,
}

impl EstablishGuard<'_> {
    fn settle(&self, outcome: Settled) {
        // No receivers left is fine.
        let _ = self.settled.send(Some(outcome));
    }
}

impl Drop for EstablishGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut kinds = lock_kinds(self.kinds);
        if matches!(kinds.get(&self.gk), Some(KindState::Establishing(_))) {
            kinds.remove(&self.gk);
        }
    }
}

enum Step {
    Done(Result<(), TrackError>),
    Wait(SettledRx),
    Establish(SettledTx, u64),
}

/// Dependency tracker that manages one watch per group-kind.
///
/// Lock order is kinds map, then store. The map lock is never held across an
/// `.await`.
pub struct WatchingTracker<S, E> {
    store: S,
    establisher: E,
    span: Span,
    kinds: Mutex<Kinds>,
    /// Bumped by `shutdown` under the map lock.
    generation: AtomicU64,
}

impl<S: AssociationStore, E: WatchEstablisher> WatchingTracker<S, E> {
    /// `span` parents every event the tracker logs; pass `Span::none()` to discard them.
    pub fn new(store: S, establisher: E, span: Span) -> Self {
        Self { store, establisher, span, kinds: Mutex::new(FxHashMap::default()), generation: AtomicU64::new(0) }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn track(&self, ctx: &CancellationToken, key: &TrackedKey, dependent: &NamespacedName) -> Result<(), TrackError> {
        let gk = key.group_kind();
        loop {
            let step = {
                let mut kinds = lock_kinds(&self.kinds);
                match kinds.get_mut(&gk) {
                    Some(KindState::Watching(active)) => {
                        if active.live.insert(key.clone()) {
                            debug!(parent: &self.span, key = %key, watch_gvk = %active.gvk, "tracker: key joined existing watch");
                        }
                        Step::Done(self.record(key, dependent))
                    }
                    Some(KindState::Establishing(rx)) => Step::Wait(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        kinds.insert(gk.clone(), KindState::Establishing(rx));
                        Step::Establish(tx, self.generation.load(Ordering::Acquire))
                    }
                }
            };
            match step {
                Step::Done(res) => return res,
                Step::Establish(settled, generation) => {
                    return self.establish_and_track(ctx, key, dependent, settled, generation).await
                }
                Step::Wait(mut rx) => {
                    debug!(parent: &self.span, gk = %gk, "tracker: waiting for in-flight establish");
                    tokio::select! {
                        _ = ctx.cancelled() => {
                            return Err(TrackError::Cancelled { gvk: key.group_version_kind().clone() });
                        }
                        // Err means the establishing caller went away without an outcome.
                        _ = rx.changed() => {}
                    }
                    let outcome = rx.borrow().clone();
                    match outcome {
                        Some(Settled::Failed(msg)) => {
                            return Err(TrackError::Establish {
                                gvk: key.group_version_kind().clone(),
                                source: anyhow::Error::msg(msg),
                            });
                        }
                        Some(Settled::Shutdown) => {
                            return Err(TrackError::Cancelled { gvk: key.group_version_kind().clone() });
                        }
                        // Watching: join it. None: the marker was abandoned, try again.
                        Some(Settled::Watching) | None => {}
                    }
                }
            }
        }
    }

    async fn establish_and_track(
        &self,
        ctx: &CancellationToken,
        key: &TrackedKey,
        dependent: &NamespacedName,
        settled: SettledTx,
        generation: u64,
    ) -> Result<(), TrackError> {
        let gk = key.group_kind();
        let gvk = key.group_version_kind();
        let mut guard = EstablishGuard { kinds: &self.kinds, gk: gk.clone(), armed: true, settled };
        let t0 = Instant::now();
        info!(parent: &self.span, gvk = %gvk, "tracker: establishing watch");
        let res = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                warn!(parent: &self.span, gvk = %gvk, "tracker: establish cancelled");
                return Err(TrackError::Cancelled { gvk: gvk.clone() });
            }
            r = self.establisher.establish(ctx, gvk) => r,
        };
        histogram!("tracker_establish_ms", t0.elapsed().as_secs_f64() * 1000.0);
        let cancel = match res {
            Ok(cancel) => cancel,
            Err(source) => {
                counter!("tracker_establish_failed_total", 1u64);
                warn!(parent: &self.span, gvk = %gvk, error = %source, "tracker: establish failed");
                guard.settle(Settled::Failed(format!("{:#}", source)));
                return Err(TrackError::Establish { gvk: gvk.clone(), source });
            }
        };
        counter!("tracker_establish_total", 1u64);
        info!(parent: &self.span, gvk = %gvk, took_ms = %t0.elapsed().as_millis(), "tracker: watch established");

        let mut kinds = lock_kinds(&self.kinds);
        if self.generation.load(Ordering::Acquire) != generation {
            drop(kinds);
            info!(parent: &self.span, gvk = %gvk, "tracker: shut down while establishing; cancelling watch");
            counter!("tracker_cancel_total", 1u64);
            cancel.cancel();
            guard.settle(Settled::Shutdown);
            return Err(TrackError::Cancelled { gvk: gvk.clone() });
        }
        let mut live = FxHashSet::default();
        live.insert(key.clone());
        kinds.insert(gk, KindState::Watching(ActiveWatch { gvk: gvk.clone(), live, cancel }));
        guard.armed = false;
        guard.settle(Settled::Watching);
        gauge!("tracker_active_watches", watching_count(&kinds) as f64);
        // The entry stays even if this fails; the next empty lookup collects it.
        self.record(key, dependent)
    }

    fn record(&self, key: &TrackedKey, dependent: &NamespacedName) -> Result<(), TrackError> {
        self.store.record(key, dependent).map_err(|e| {
            warn!(parent: &self.span, key = %key, by = %dependent, error = %e, "tracker: association not recorded");
            TrackError::from(e)
        })
    }

    pub fn lookup(&self, key: &TrackedKey) -> Vec<NamespacedName> {
        let gk = key.group_kind();
        let (found, released) = {
            let mut kinds = lock_kinds(&self.kinds);
            let found = self.store.query(key);
            let mut released = None;
            if found.is_empty() {
                if let Some(KindState::Watching(active)) = kinds.get_mut(&gk) {
                    if active.live.remove(key) {
                        debug!(parent: &self.span, key = %key, "tracker: key expired");
                    }
                    if active.live.is_empty() {
                        if let Some(KindState::Watching(active)) = kinds.remove(&gk) {
                            released = Some(active);
                        }
                        gauge!("tracker_active_watches", watching_count(&kinds) as f64);
                    }
                }
            }
            (found, released)
        };
        if let Some(active) = released {
            info!(parent: &self.span, gk = %gk, gvk = %active.gvk, "tracker: no live dependents; cancelling watch");
            counter!("tracker_cancel_total", 1u64);
            active.cancel.cancel();
        }
        found
    }

    /// Group-kinds with an open watch, each with the version it was opened with.
    pub fn active_kinds(&self) -> Vec<(GroupKind, GroupVersionKind)> {
        let kinds = lock_kinds(&self.kinds);
        let mut out: Vec<_> = kinds
            .iter()
            .filter_map(|(gk, s)| match s {
                KindState::Watching(active) => Some((gk.clone(), active.gvk.clone())),
                KindState::Establishing(_) => None,
            })
            .collect();
        out.sort();
        out
    }

    pub fn is_watching(&self, gk: &GroupKind) -> bool {
        matches!(lock_kinds(&self.kinds).get(gk), Some(KindState::Watching(_)))
    }

    /// Keys currently counted as live for `gk`, sorted.
    pub fn live_keys(&self, gk: &GroupKind) -> Vec<TrackedKey> {
        let kinds = lock_kinds(&self.kinds);
        let mut out: Vec<_> = match kinds.get(gk) {
            Some(KindState::Watching(active)) => active.live.iter().cloned().collect(),
            _ => Vec::new(),
        };
        out.sort();
        out
    }

    /// Cancel every open watch and forget all live keys. Associations in the
    /// store are untouched; a later `track` opens watches again.
    ///
    /// Establish calls already in flight are cancelled as soon as they open
    /// their watch, and their callers get [`TrackError::Cancelled`].
    pub fn shutdown(&self) {
        let drained: Vec<ActiveWatch> = {
            let mut kinds = lock_kinds(&self.kinds);
            self.generation.fetch_add(1, Ordering::AcqRel);
            let gks: Vec<GroupKind> = kinds
                .iter()
                .filter(|(_, s)| matches!(s, KindState::Watching(_)))
                .map(|(gk, _)| gk.clone())
                .collect();
            let drained = gks
                .iter()
                .filter_map(|gk| match kinds.remove(gk) {
                    Some(KindState::Watching(active)) => Some(active),
                    _ => None,
                })
                .collect();
            gauge!("tracker_active_watches", watching_count(&kinds) as f64);
            drained
        };
        info!(parent: &self.span, watches = drained.len(), "tracker: shutting down watches");
        for active in drained {
            counter!("tracker_cancel_total", 1u64);
            active.cancel.cancel();
        }
    }
}

#[async_trait]
impl<S: AssociationStore, E: WatchEstablisher> Tracker for WatchingTracker<S, E> {
    async fn track(&self, ctx: &CancellationToken, key: &TrackedKey, dependent: &NamespacedName) -> Result<(), TrackError> {
        WatchingTracker::track(self, ctx, key, dependent).await
    }

    fn lookup(&self, key: &TrackedKey) -> Vec<NamespacedName> {
        WatchingTracker::lookup(self, key)
    }
}
