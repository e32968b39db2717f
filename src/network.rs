//! The network transport seam.
//!
//! Per §1 and §6 of the design, the wire codec (protobuf-style framing over
//! a custom RPC) and the transport itself are external collaborators. This
//! crate only specifies the interface a transport must expose to carry the
//! four RPC families: vote, append-entries, install-snapshot and the
//! member-manager's liveness ping.

use async_trait::async_trait;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::RaftPing;
use crate::raft::RaftPingResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::NodeId;

/// A network transport capable of delivering decoded Raft RPCs to a target
/// node and returning its decoded reply. Implementations own connection
/// management, retry-at-the-transport-layer, and the actual wire codec.
#[async_trait]
pub trait RaftNetwork<D: AppData>: Send + Sync + 'static {
    /// Send an `AppendEntriesRequest` to the target node.
    async fn append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest<D>,
    ) -> anyhow::Result<AppendEntriesResponse>;

    /// Send a `VoteRequest` (covers both pre-vote and vote rounds) to the target node.
    async fn vote(&self, target: NodeId, rpc: VoteRequest) -> anyhow::Result<VoteResponse>;

    /// Send one chunk of an `InstallSnapshotRequest` to the target node.
    async fn install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> anyhow::Result<InstallSnapshotResponse>;

    /// Send a liveness/handshake ping to the target node, used by the
    /// member manager to compute the `ready` flag independent of whether a
    /// replication stream happens to be flowing.
    async fn ping(&self, target: NodeId, rpc: RaftPing) -> anyhow::Result<RaftPingResponse>;
}
