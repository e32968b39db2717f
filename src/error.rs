//! Error taxonomy. Mirrors §7 of the design: usage-fatal, io-retryable,
//! io-fatal, protocol-reject, client-timeout and interrupt/cancellation are
//! distinct kinds rather than one flat error, so callers can tell a
//! programming bug from a transient disk hiccup from an expected protocol
//! rejection.

use thiserror::Error;

use crate::NodeId;

pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Programming-contract violations inside the fiber runtime: a fiber
/// suspending twice in one step, or a resume point left non-empty after
/// `call`. These always fail the whole fiber group — they indicate a bug,
/// not a recoverable condition.
#[derive(Error, Debug)]
pub enum FiberError {
    #[error("fiber attempted to suspend twice in a single scheduling step")]
    DoubleSuspend,
    #[error("fiber group is shutting down")]
    GroupShutdown,
    #[error("fiber was interrupted")]
    Interrupted,
    #[error("fiber wait timed out")]
    TimedOut,
}

/// Errors from the durable log store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error (retryable): {0}")]
    IoRetryable(#[source] std::io::Error),
    #[error("io error (fatal, retries exhausted): {0}")]
    IoFatal(#[source] std::io::Error),
    #[error("corrupt log record: {0}")]
    Corrupt(String),
    #[error("non-contiguous write: expected next pos {expected}, got {got}")]
    NonContiguousWrite { expected: u64, got: u64 },
    #[error("status file record invalid: {0}")]
    BadStatusFile(String),
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, StoreError::IoRetryable(_))
    }
}

/// Top level error returned by the raft API surface.
#[derive(Error, Debug)]
pub enum RaftError {
    #[error("raft node is shutting down")]
    ShuttingDown,
    #[error("fatal storage error, group is shutting down: {0}")]
    Store(#[from] StoreError),
    #[error("fatal fiber runtime error, group is shutting down: {0}")]
    Fiber(#[from] FiberError),
    #[error("request rejected: {0}")]
    ProtocolReject(#[from] ProtocolReject),
    #[error("state machine error: {0}")]
    StateMachine(#[source] anyhow::Error),
}

/// A rejection driven entirely by Raft protocol rules (stale term, log
/// mismatch). Never logged above `warn` — this is expected cluster chatter,
/// not a fault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolReject {
    #[error("stale term: local={local_term}, request={request_term}")]
    StaleTerm { local_term: u64, request_term: u64 },
    #[error("log mismatch at prev_log_index={prev_log_index}")]
    LogMismatch { prev_log_index: u64 },
    #[error("snapshot stream mismatch: expected {expected_id}@{expected_offset}, got {got_id}@{got_offset}")]
    SnapshotMismatch { expected_id: String, expected_offset: u64, got_id: String, got_offset: u64 },
}

#[derive(Error, Debug)]
pub enum InitializeError {
    #[error(transparent)]
    RaftError(#[from] RaftError),
    #[error("the cluster is already initialized; this operation is not allowed")]
    NotAllowed,
}

#[derive(Error, Debug)]
pub enum ChangeConfigError {
    #[error(transparent)]
    RaftError(#[from] RaftError),
    #[error("this node is not the cluster leader, current leader: {0:?}")]
    NodeNotLeader(Option<NodeId>),
    #[error("a config change is already in progress")]
    InProgress,
    #[error("the proposed new membership set is empty")]
    EmptyMembers,
    #[error("node {0} is already part of the cluster or its proposed non-voter set")]
    NodeAlreadyProposed(NodeId),
}

#[derive(Error, Debug)]
pub enum ResponseError {
    #[error(transparent)]
    RaftError(#[from] RaftError),
    #[error(transparent)]
    ChangeConfig(#[from] ChangeConfigError),
}

#[derive(Error, Debug)]
pub enum ClientReadError {
    #[error(transparent)]
    RaftError(#[from] RaftError),
    #[error("this node is not the cluster leader, forward to {0:?}")]
    ForwardToLeader(Option<NodeId>),
    #[error("read deadline elapsed before a quorum heartbeat was confirmed")]
    RaftExecTimeout,
}

#[derive(Error, Debug)]
pub enum ClientWriteError<D: std::fmt::Debug> {
    #[error(transparent)]
    RaftError(#[from] RaftError),
    #[error("this node is not the cluster leader, forward to {leader:?}")]
    ForwardToLeader { entry: D, leader: Option<NodeId> },
    #[error("the apply deadline elapsed before the entry was applied")]
    RaftExecTimeout,
}
