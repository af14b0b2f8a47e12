//! kindwatch kubehub: opens dynamic watches against the cluster and turns
//! observed objects into reconcile requests for their tracked dependents.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use kindwatch_core::{GroupVersionKind, NamespacedName, ReconcileRequest, TrackedKey};
use kindwatch_tracker::{CancelHandle, Tracker, WatchEstablisher};
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    discovery::Discovery,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, ResourceExt,
};
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

pub fn to_kube_gvk(gvk: &GroupVersionKind) -> kube::core::GroupVersionKind {
    kube::core::GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind)
}

pub fn from_kube_gvk(gvk: &kube::core::GroupVersionKind) -> GroupVersionKind {
    GroupVersionKind::new(gvk.group.clone(), gvk.version.clone(), gvk.kind.clone())
}

/// Tracked key of an object observed through a watch opened for `gvk`.
pub fn tracked_key_for(gvk: &GroupVersionKind, obj: &DynamicObject) -> TrackedKey {
    TrackedKey::new(gvk.clone(), NamespacedName::new(obj.namespace().unwrap_or_default(), obj.name_any()))
}

/// One request per live dependent of `key`.
pub fn requests_for<T: Tracker + ?Sized>(tracker: &T, key: &TrackedKey) -> Vec<ReconcileRequest> {
    tracker.lookup(key).into_iter().map(ReconcileRequest::from).collect()
}

/// Event mapper for objects of `gvk`: asks the tracker who depends on the
/// object and yields a reconcile request for each.
pub fn enqueue_tracked<T: Tracker + ?Sized>(
    gvk: GroupVersionKind,
    tracker: Arc<T>,
) -> impl Fn(&DynamicObject) -> Vec<ReconcileRequest> + Send + Sync {
    move |obj| requests_for(tracker.as_ref(), &tracked_key_for(&gvk, obj))
}

/// Drain observed keys, look each up and forward the resulting requests.
/// Returns when either channel closes.
pub async fn dispatch<T: Tracker + ?Sized>(
    tracker: Arc<T>,
    mut observed_rx: mpsc::Receiver<TrackedKey>,
    request_tx: mpsc::Sender<ReconcileRequest>,
) {
    let mut forwarded = 0u64;
    while let Some(key) = observed_rx.recv().await {
        let requests = requests_for(tracker.as_ref(), &key);
        debug!(key = %key, requests = requests.len(), "dispatch: observed");
        for req in requests {
            if request_tx.send(req).await.is_err() {
                info!(forwarded, "dispatch: request channel closed");
                return;
            }
            forwarded += 1;
        }
    }
    info!(forwarded, "dispatch: observed channel closed");
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<ApiResource> {
    let discovery = Discovery::new(client)
        .filter(&[gvk.group.as_str()])
        .run()
        .await
        .with_context(|| format!("discovering api group {:?}", gvk.group))?;
    discovery
        .resolve_gvk(&to_kube_gvk(gvk))
        .map(|(ar, _caps)| ar)
        .ok_or_else(|| anyhow!("GVK not found: {}", gvk))
}

/// [`WatchEstablisher`] backed by a cluster-wide list+watch per kind.
///
/// Every applied, deleted or relisted object is sent as a [`TrackedKey`] on the
/// observed channel; feed that into [`dispatch`].
///
/// Observed keys carry the version the watch was opened with. A dependency
/// tracked under another version of the same kind shares the watch but is never
/// matched by `dispatch`, so it is neither notified nor garbage collected through
/// it. Track every dependency of a kind under one version.
#[derive(Clone)]
pub struct KubeEstablisher {
    client: Client,
    observed_tx: mpsc::Sender<TrackedKey>,
}

impl KubeEstablisher {
    pub fn new(client: Client, observed_tx: mpsc::Sender<TrackedKey>) -> Self {
        Self { client, observed_tx }
    }

    pub async fn try_default(observed_tx: mpsc::Sender<TrackedKey>) -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self::new(client, observed_tx))
    }
}

#[async_trait::async_trait]
impl WatchEstablisher for KubeEstablisher {
    async fn establish(&self, ctx: &CancellationToken, gvk: &GroupVersionKind) -> Result<CancelHandle> {
        let t0 = Instant::now();
        let ar = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(anyhow!("discovery for {} cancelled", gvk)),
            res = find_api_resource(self.client.clone(), gvk) => res?,
        };
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let span = info_span!("watch", gvk = %gvk);
        let task = tokio::spawn(run_watch(api, gvk.clone(), self.observed_tx.clone()).instrument(span));
        info!(gvk = %gvk, plural = %ar.plural, took_ms = %t0.elapsed().as_millis(), "kubehub: watch started");
        Ok(CancelHandle::from_task(task))
    }
}

async fn run_watch(api: Api<DynamicObject>, gvk: GroupVersionKind, observed_tx: mpsc::Sender<TrackedKey>) {
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    loop {
        let objects = match stream.try_next().await {
            Ok(Some(Event::Applied(o))) | Ok(Some(Event::Deleted(o))) => vec![o],
            Ok(Some(Event::Restarted(list))) => {
                debug!(count = list.len(), "watch restart");
                list
            }
            Ok(None) => break,
            Err(e) => {
                counter!("kubehub_watch_errors_total", 1u64);
                warn!(error = %e, "watch error; backing off");
                continue;
            }
        };
        counter!("kubehub_watch_events_total", objects.len() as u64);
        for o in objects.iter() {
            if observed_tx.send(tracked_key_for(&gvk, o)).await.is_err() {
                info!("observed channel closed; stopping watch");
                return;
            }
        }
    }
    warn!("watcher stream ended");
}
