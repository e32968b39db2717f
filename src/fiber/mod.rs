//! The cooperative fiber runtime (§4.1).
//!
//! Per the design notes in §9, this binds option (a): native stackless
//! async with a single-threaded executor per dispatcher. A [`Dispatcher`]
//! is a dedicated OS thread driving a `tokio::task::LocalSet`; a "fiber" is
//! simply a task spawned onto that `LocalSet` via
//! [`FiberGroup::fire_fiber`]. Because a `LocalSet`'s tasks never migrate
//! across threads, and because every mutation of a group's state happens
//! from inside a task spawned on that group's `LocalSet`, the "no locks
//! against intra-group state" invariant from §5 holds for free — the
//! borrow checker enforces it.
//!
//! The four suspension points named in §4.1 (`call`, `awaitOn`, `sleep`, and
//! the blocking-I/O wrapper) all become ordinary `.await` points under this
//! binding; the "at most one suspension per step" rule is therefore
//! structural rather than something this crate must police at runtime.

mod dispatcher;
mod group;
mod wait;

pub use dispatcher::Dispatcher;
pub use dispatcher::DispatcherPool;
pub use group::FiberGroup;
pub use group::FiberHandle;
pub use wait::Condition;
