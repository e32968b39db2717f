//! The dispatcher: a dedicated OS thread owning zero or more fiber groups.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::runtime::Builder;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

use crate::fiber::group::FiberGroup;
use crate::GroupId;

/// A boxed unit of work submitted across the thread boundary into a
/// dispatcher. This is the *only* legal ingress from non-dispatcher threads
/// into a group's fiber-local state (§4.1's cross-thread hand-off rule):
/// everything else — map lookups, tail-cache reads, replication-cursor
/// writes — happens synchronously from inside a fiber already running on
/// the dispatcher.
type SubmittedTask = Box<dyn FnOnce() + Send + 'static>;

/// A single dispatcher thread. Owns a current-thread Tokio runtime driving
/// one `LocalSet`, on which every fiber group assigned to this dispatcher
/// schedules its fibers. Every fiber spawned through [`Dispatcher::spawn_local`]
/// (directly, or via a [`FiberGroup`] created by this dispatcher) runs
/// inside that single `LocalSet`, so `!Send` fiber state never has to cross
/// a thread boundary.
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<SubmittedTask>,
    _runtime_thread: std::thread::JoinHandle<()>,
}

impl Dispatcher {
    fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<SubmittedTask>();
        let runtime_thread = std::thread::Builder::new()
            .name("raft-dispatcher".into())
            .spawn(move || {
                let rt: Runtime = Builder::new_current_thread().enable_all().build().expect("build dispatcher runtime");
                let local = tokio::task::LocalSet::new();
                rt.block_on(local.run_until(async move {
                    // Main dispatcher loop (§4.1 step 1): block on the
                    // cross-thread submission queue, draining pending tasks
                    // on wake. Every submitted closure runs inside this
                    // `LocalSet`'s task context, so it may freely call the
                    // free function `tokio::task::spawn_local` to fire a new
                    // fiber. Timer promotion (step 2) and per-fiber
                    // execution (step 3) are delegated to Tokio's own
                    // single-threaded task scheduler, per the §9 design-note
                    // binding.
                    while let Some(task) = rx.recv().await {
                        task();
                    }
                }));
            })
            .expect("spawn dispatcher thread");
        Self { tx, _runtime_thread: runtime_thread }
    }

    /// Create a new fiber group scheduled on this dispatcher.
    pub fn new_group(self: &Arc<Self>, id: GroupId) -> FiberGroup {
        FiberGroup::new(id, self.clone())
    }

    /// Submit an arbitrary `FnOnce` to run inside this dispatcher's
    /// `LocalSet` context, from any thread. This is the cross-thread
    /// hand-off point used by, e.g., a completed future on a blocking-I/O
    /// executor waking the dispatcher that owns the fiber awaiting it, or by
    /// [`FiberGroup::fire_fiber`] to queue a new fiber.
    pub fn submit(&self, f: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Box::new(f));
    }
}

/// A small, fixed pool of dispatcher threads shared by every raft group
/// hosted on this node, matching §2's "assigned to one of a small pool of
/// dispatcher threads" component description. Groups are assigned
/// round-robin; a node with more groups than dispatchers shares dispatchers
/// across groups, exactly as the spec intends ("zero or more fiber groups"
/// per dispatcher).
pub struct DispatcherPool {
    dispatchers: Vec<Arc<Dispatcher>>,
    next: AtomicUsize,
}

impl DispatcherPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let dispatchers = (0..size).map(|_| Arc::new(Dispatcher::spawn())).collect();
        Self { dispatchers, next: AtomicUsize::new(0) }
    }

    /// Assign the next dispatcher in round-robin order and create a new
    /// fiber group for `group_id` on it.
    pub fn assign_group(&self, group_id: GroupId) -> FiberGroup {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.dispatchers.len();
        self.dispatchers[idx].new_group(group_id)
    }

    pub fn size(&self) -> usize {
        self.dispatchers.len()
    }
}
