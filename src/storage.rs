//! The state machine collaborator interface.
//!
//! Per §6, the user's business state machine is an external collaborator:
//! this crate owns the log and drives `exec` in strict index order, but
//! never interprets entry payloads beyond the opaque bytes and `biz_type`
//! tag described in §3.

use std::fmt::Debug;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncSeek;
use tokio::io::AsyncWrite;

use crate::raft::MembershipConfig;
use crate::LogId;

/// Identifies one snapshot instance. Two snapshots built with the same
/// `last_log_id` may still differ in bytes, so transfers are keyed by this
/// id rather than by `last_log_id` alone.
pub type SnapshotId = String;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SnapshotMeta {
    /// Log entries up to which this snapshot includes, inclusive.
    pub last_log_id: LogId,
    /// The membership configuration covered by the snapshot.
    pub membership: MembershipConfig,
    /// Identifies this snapshot instance when transferring it.
    pub snapshot_id: SnapshotId,
}

/// A readable/writable handle to a snapshot's bytes, along with its metadata.
pub struct Snapshot<S>
where S: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin + 'static
{
    pub meta: SnapshotMeta,
    pub data: Box<S>,
}

/// Implemented by the application's business state machine.
///
/// `exec` is called strictly in index order on the dispatcher owning the
/// raft group (§4.4, §6); write-path errors returned from it are fatal to
/// the group per §7, while the apply manager surfaces read-path errors only
/// to the requesting client's future.
#[async_trait]
pub trait StateMachine<D, R>: Send + Sync + 'static
where
    D: Send + Sync + Debug + 'static,
    R: Send + Sync + Debug + 'static,
{
    /// The associated type exposed for reading/writing snapshot bytes.
    type SnapshotData: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin + 'static;
    /// An error which, if returned from `exec`, indicates the state machine
    /// itself requires the group to shut down rather than merely failing
    /// this one request.
    type ShutdownError: std::error::Error + Send + Sync + 'static;

    /// Decode an opaque log entry body into the application's request type.
    fn decode(&self, biz_type: u16, body: &[u8]) -> anyhow::Result<D>;

    /// Apply one committed, already-decoded entry to the state machine.
    async fn exec(&self, index: u64, input: D) -> anyhow::Result<R>;

    /// Begin streaming a new snapshot of the current state, covering
    /// entries up to and including `last_applied`.
    async fn take_snapshot(&self) -> anyhow::Result<Snapshot<Self::SnapshotData>>;

    /// Allocate a blank handle to receive an incoming snapshot stream.
    async fn begin_receiving_snapshot(&self) -> anyhow::Result<Box<Self::SnapshotData>>;

    /// Finalize the installation of a snapshot streamed in from the leader,
    /// replacing the state machine's contents.
    async fn install_snapshot(
        &self,
        meta: &SnapshotMeta,
        data: Box<Self::SnapshotData>,
    ) -> anyhow::Result<()>;

    /// Return the currently installed snapshot, if any.
    async fn get_current_snapshot(&self) -> anyhow::Result<Option<Snapshot<Self::SnapshotData>>>;
}

/// Debugging-only extensions used by tests to peek into a state machine's
/// contents without going through the committed-apply path.
#[async_trait]
pub trait RaftStorageDebug<SM> {
    async fn get_state_machine(&self) -> SM;
}
