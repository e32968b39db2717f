//! Fiber groups: the set of fibers belonging to one raft group.

use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::FiberError;
use crate::fiber::dispatcher::Dispatcher;
use crate::GroupId;

/// A handle returned by [`FiberGroup::fire_fiber`]. Dropping it does not
/// cancel the fiber — a group's fibers run to completion (or group
/// shutdown) independent of whether anything still holds their handle,
/// mirroring the teacher crate's detached-task style.
pub struct FiberHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> FiberHandle<T> {
    pub async fn join(self) -> Result<T, FiberError> {
        self.rx.await.map_err(|_| FiberError::GroupShutdown)
    }
}

/// The set of fibers belonging to one raft group, all scheduled on the same
/// dispatcher's single-threaded `LocalSet`. No state owned by a group's
/// fibers is ever shared across threads; cross-thread hand-off happens only
/// through the dispatcher's submission queue (see [`super::Dispatcher`]).
#[derive(Clone)]
pub struct FiberGroup {
    id: GroupId,
    dispatcher: Arc<Dispatcher>,
    live_fibers: Arc<AtomicU64>,
    shutdown: Arc<tokio::sync::Notify>,
}

impl FiberGroup {
    pub(crate) fn new(id: GroupId, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            id,
            dispatcher,
            live_fibers: Arc::new(AtomicU64::new(0)),
            shutdown: Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Spawn a new fiber: a cooperatively scheduled, single-logical-owner
    /// task running on this group's dispatcher thread. This is
    /// `group.fireFiber(frame)` from §3's Fiber lifecycle description; the
    /// "frame" here is the future `make_fut` produces.
    ///
    /// `make_fut` is called on the dispatcher thread itself, so the future it
    /// returns may freely be `!Send` (and may freely hold `!Send` state, such
    /// as an `Rc`-shared log store) — it never has to cross a thread
    /// boundary. `make_fut` itself does cross into the dispatcher thread
    /// through its submission queue, so it must be `Send`; in practice it is
    /// just a thin closure over already-`Send` constructor arguments (configs,
    /// `Arc` handles, channel endpoints). The eventual output crosses back to
    /// the calling thread through a `oneshot` channel, so it must be `Send`.
    pub fn fire_fiber<F, Fut>(&self, make_fut: F) -> FiberHandle<Fut::Output>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future + 'static,
        Fut::Output: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let live = self.live_fibers.clone();
        live.fetch_add(1, Ordering::SeqCst);
        self.dispatcher.submit(move || {
            tokio::task::spawn_local(async move {
                let out = make_fut().await;
                live.fetch_sub(1, Ordering::SeqCst);
                let _ = tx.send(out);
            });
        });
        FiberHandle { rx }
    }

    /// Number of fibers currently live in this group.
    pub fn live_fiber_count(&self) -> u64 {
        self.live_fibers.load(Ordering::SeqCst)
    }

    /// Request that the group be torn down. Existing fibers are not forcibly
    /// aborted — each is expected to observe shutdown at its next
    /// suspension point and unwind, per §4.1's interrupt semantics.
    pub fn request_shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    /// Resolves once [`request_shutdown`](Self::request_shutdown) has been
    /// called. Long-running fibers (the appender, the fsync loop, the
    /// election timer) `select!` against this to exit promptly.
    pub async fn shutdown_signal(&self) {
        self.shutdown.notified().await
    }
}
