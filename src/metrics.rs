//! Metrics reporting: a `watch` channel broadcasting the latest snapshot of
//! a raft node's state, plus a small combinator API for tests and
//! applications to wait on a condition becoming true.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;

use crate::core::State;
use crate::raft::MembershipConfig;
use crate::LogId;
use crate::NodeId;

/// A point-in-time snapshot of a raft node's state, broadcast on every
/// state transition or log/commit advance.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub state: State,
    pub current_term: u64,
    pub last_log_index: u64,
    pub last_applied: u64,
    pub current_leader: Option<NodeId>,
    pub membership_config: MembershipConfig,
    pub snapshot: LogId,
    pub leader_metrics: Option<LeaderMetrics>,
}

impl RaftMetrics {
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::default(),
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            current_leader: None,
            membership_config: MembershipConfig::new_initial(id),
            snapshot: LogId::default(),
            leader_metrics: None,
        }
    }
}

/// Metrics specific to the leader role: per-peer replication cursors and
/// readiness, refreshed by the member/replication managers.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LeaderMetrics {
    pub replication: std::collections::BTreeMap<NodeId, ReplicationMetrics>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicationMetrics {
    pub matched: LogId,
    pub ready: bool,
}

/// A handle used to block (with a timeout) until a raft node's metrics
/// satisfy some condition.
///
/// ```ignore
/// r.wait(Some(Duration::from_millis(200))).log(3).await?;
/// r.wait(None).current_leader(2).await?;
/// r.wait(None).state(State::Follower).await?;
/// ```
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

#[derive(thiserror::Error, Debug)]
pub enum WaitError {
    #[error("timed out after {0:?} waiting for condition")]
    Timeout(Duration),
    #[error("metrics channel closed")]
    Closed,
}

impl Wait {
    pub async fn metrics(&mut self) -> Result<RaftMetrics, WaitError> {
        Ok(self.rx.borrow().clone())
    }

    async fn wait_for(&mut self, mut pred: impl FnMut(&RaftMetrics) -> bool) -> Result<RaftMetrics, WaitError> {
        if pred(&self.rx.borrow()) {
            return Ok(self.rx.borrow().clone());
        }
        let fut = async {
            loop {
                self.rx.changed().await.map_err(|_| WaitError::Closed)?;
                let m = self.rx.borrow().clone();
                if pred(&m) {
                    return Ok(m);
                }
            }
        };
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(WaitError::Timeout(self.timeout)),
        }
    }

    pub async fn log(&mut self, index: u64) -> Result<RaftMetrics, WaitError> {
        self.wait_for(|m| m.last_log_index >= index).await
    }

    pub async fn applied_index(&mut self, index: u64) -> Result<RaftMetrics, WaitError> {
        self.wait_for(|m| m.last_applied >= index).await
    }

    pub async fn current_leader(&mut self, leader: NodeId) -> Result<RaftMetrics, WaitError> {
        self.wait_for(|m| m.current_leader == Some(leader)).await
    }

    pub async fn state(&mut self, state: State) -> Result<RaftMetrics, WaitError> {
        self.wait_for(|m| m.state == state).await
    }
}
