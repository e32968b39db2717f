//! `multiraft` is a multi-group Raft consensus engine.
//!
//! A node may host any number of independent Raft groups, each bound to its
//! own [`fiber::FiberGroup`] and replicating an independent
//! [`storage::StateMachine`]. The network transport, the wire codec and the
//! state machine itself are external collaborators; see [`network`] and
//! [`storage`] for the seams.

pub mod config;
pub mod core;
pub mod error;
pub mod fiber;
pub mod metrics;
pub mod network;
pub mod raft;
pub mod replication;
pub mod storage;
pub mod store;

pub use async_trait;
pub use config::Config;
pub use core::RaftCore;
pub use core::State;
pub use error::RaftError;
pub use metrics::RaftMetrics;
pub use network::RaftNetwork;
pub use raft::Raft;
pub use storage::RaftStorageDebug;
pub use storage::StateMachine;

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A Raft node identifier. Stable across restarts and unique within a group.
pub type NodeId = u64;

/// A `(term, index)` pair uniquely and totally ordering every entry ever
/// appended to a group's log.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, serde::Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl std::fmt::Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{term:{},index:{}}}", self.term, self.index)
    }
}

impl LogId {
    pub const fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

/// A unique identifier for a raft group hosted on a node.
pub type GroupId = u32;

/// A marker trait satisfied by any type which may be used as the payload of
/// a client write request.
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A marker trait satisfied by any type returned from applying an
/// [`AppData`] entry to the state machine.
pub trait AppDataResponse: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Implemented by types which can produce a short, loggable one-line summary
/// of themselves, used pervasively in `tracing` calls instead of `{:?}` so
/// that large payloads never leak into logs.
pub trait MessageSummary {
    fn summary(&self) -> String;
}

/// Returns the minimum number of members required to form a majority of a
/// group of the given size.
pub fn quorum(len: usize) -> usize {
    (len / 2) + 1
}

/// An instruction on how to update a piece of derived state: compute a new
/// value, or leave the previously-reported value untouched.
#[derive(Debug)]
pub enum Update<T> {
    Update(T),
    Ignore,
}
