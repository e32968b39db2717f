//! `WaitSource` implementations: conditions a fiber can `awaitOn`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::FiberError;

/// A condition variable a fiber group uses to wake a consumer fiber
/// whenever a producer makes progress — e.g. the appender's
/// `needAppendCondition`/`needFsyncCondition` from §4.2.
///
/// This is a thin wrapper around `tokio::sync::Notify` configured so that a
/// `notify` which arrives before anyone is waiting is not lost (the
/// "permit" semantics `Notify::notify_one` already provides), matching the
/// spec's requirement that a `WaitSource` maintain waiters reliably rather
/// than dropping a wakeup that raced a suspend.
#[derive(Clone)]
pub struct Condition {
    inner: Arc<Notify>,
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}

impl Condition {
    pub fn new() -> Self {
        Self { inner: Arc::new(Notify::new()) }
    }

    /// Wake exactly one waiting fiber, or arm a permit if none is waiting yet.
    pub fn signal(&self) {
        self.inner.notify_one();
    }

    /// Wake every fiber currently waiting on this condition.
    pub fn signal_all(&self) {
        self.inner.notify_waiters();
    }

    /// Suspend the calling fiber until [`signal`](Self::signal) is called,
    /// or until `timeout` elapses (§4.1's `awaitOn(waitSource, timeoutMs, ...)`).
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<(), FiberError> {
        match timeout {
            None => {
                self.inner.notified().await;
                Ok(())
            }
            Some(d) => tokio::time::timeout(d, self.inner.notified()).await.map_err(|_| FiberError::TimedOut),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_before_wait_is_not_lost() {
        let c = Condition::new();
        c.signal();
        // `notify_one` stores a permit: a `wait` issued afterwards still
        // returns immediately rather than hanging forever.
        tokio::time::timeout(Duration::from_millis(50), c.wait(None)).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_times_out_without_signal() {
        let c = Condition::new();
        let res = c.wait(Some(Duration::from_millis(10))).await;
        assert!(matches!(res, Err(FiberError::TimedOut)));
    }
}
