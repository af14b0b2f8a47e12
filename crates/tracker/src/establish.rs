//! The capability that opens a watch for a kind, and the handle that stops it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use kindwatch_core::GroupVersionKind;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Opens a watch on every object of a kind.
///
/// Implementations may block on remote I/O and may fail. The tracker calls
/// `establish` at most once per group-kind while a watch for it is open or
/// being opened, and only with no internal lock held.
#[async_trait::async_trait]
pub trait WatchEstablisher: Send + Sync {
    async fn establish(&self, ctx: &CancellationToken, gvk: &GroupVersionKind) -> Result<CancelHandle>;
}

#[async_trait::async_trait]
impl<E: WatchEstablisher + ?Sized> WatchEstablisher for Arc<E> {
    async fn establish(&self, ctx: &CancellationToken, gvk: &GroupVersionKind) -> Result<CancelHandle> {
        (**self).establish(ctx, gvk).await
    }
}

/// Adapts an async closure into a [`WatchEstablisher`]. See [`establish_fn`].
pub struct EstablishFn<F>(F);

/// Wrap `f` so it can be handed to the tracker as its establisher.
pub fn establish_fn<F, Fut>(f: F) -> EstablishFn<F>
where
    F: Fn(CancellationToken, GroupVersionKind) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CancelHandle>> + Send,
{
    EstablishFn(f)
}

#[async_trait::async_trait]
impl<F, Fut> WatchEstablisher for EstablishFn<F>
where
    F: Fn(CancellationToken, GroupVersionKind) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CancelHandle>> + Send,
{
    async fn establish(&self, ctx: &CancellationToken, gvk: &GroupVersionKind) -> Result<CancelHandle> {
        (self.0)(ctx.clone(), gvk.clone()).await
    }
}

/// Stops a watch. Cancelling is best-effort and fire-and-forget; dropping the
/// handle without calling [`CancelHandle::cancel`] leaves the watch running.
#[derive(Default)]
pub struct CancelHandle(Option<Box<dyn FnOnce() + Send>>);

impl CancelHandle {
    pub fn noop() -> Self {
        Self(None)
    }

    pub fn from_fn(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub fn from_token(token: CancellationToken) -> Self {
        Self::from_fn(move || token.cancel())
    }

    /// Abort the task driving the watch.
    pub fn from_task(task: JoinHandle<()>) -> Self {
        Self::from_fn(move || task.abort())
    }

    pub fn is_noop(&self) -> bool {
        self.0.is_none()
    }

    pub fn cancel(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancelHandle").field(&if self.is_noop() { "noop" } else { "fn" }).finish()
    }
}
