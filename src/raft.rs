//! Public Raft interface and wire data types.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tracing::Span;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::ChangeConfigError;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::ResponseError;
use crate::fiber::DispatcherPool;
use crate::fiber::FiberHandle;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::storage::SnapshotMeta;
use crate::storage::StateMachine;
use crate::AppData;
use crate::AppDataResponse;
use crate::GroupId;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;

struct RaftInner<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> {
    tx_api: mpsc::UnboundedSender<(RaftMsg<D, R>, Span)>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<FiberHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_sm: std::marker::PhantomData<SM>,
}

/// The handle applications use to interact with one running Raft group.
///
/// A node hosting several groups holds one `Raft` per group, all sharing the
/// same [`DispatcherPool`]; the consensus loop itself runs as a fiber on
/// whichever dispatcher the pool assigns this group's ID to, not as a
/// freestanding `tokio::spawn` task — see [`crate::fiber`].
///
/// ### clone
/// This type implements `Clone` and should be cloned liberally; the clone is
/// very cheap and just bumps an `Arc` refcount.
///
/// ### shutting down
/// If any of the interfaces below returns `RaftError::ShuttingDown`, the
/// group is shutting down, typically because the durable log store hit an
/// unrecoverable I/O error; call [`Raft::shutdown`] to await the fiber
/// group's teardown.
pub struct Raft<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> {
    inner: Arc<RaftInner<D, R, N, SM>>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> Raft<D, R, N, SM> {
    /// Create and spawn a new Raft group.
    ///
    /// `group_id` identifies this group among every group hosted on this
    /// node; `dispatcher_pool` assigns it a fiber group on one of the node's
    /// shared dispatcher threads. `id` is this node's stable identifier
    /// within the group.
    #[tracing::instrument(level = "trace", skip(config, network, state_machine, dispatcher_pool), fields(cluster = %config.cluster_name))]
    pub async fn new(
        group_id: GroupId,
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        state_machine: Arc<SM>,
        dispatcher_pool: &DispatcherPool,
    ) -> RaftResult<Self> {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let fiber_group = dispatcher_pool.assign_group(group_id);
        let raft_handle = RaftCore::spawn(group_id, id, config, network, state_machine, fiber_group, rx_api, tx_metrics, rx_shutdown).await?;
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
            marker_sm: std::marker::PhantomData,
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    /// Submit an AppendEntries RPC to this Raft node.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc = %rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse, RaftError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner.tx_api.send((RaftMsg::AppendEntries { rpc, tx }, span)).map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Submit a VoteRequest RPC to this Raft node (§5.2). `rpc.pre_vote`
    /// distinguishes a non-disruptive pre-vote probe from a real vote
    /// (§4.3): granting a pre-vote never bumps this node's term or resets
    /// its election timer.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner.tx_api.send((RaftMsg::RequestVote { rpc, tx }, span)).map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Submit an InstallSnapshot RPC to this Raft node (§7).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(snapshot_id = %rpc.meta.last_log_id))]
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse, RaftError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner.tx_api.send((RaftMsg::InstallSnapshot { rpc, tx }, span)).map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Respond to a member-manager readiness probe (§4.5). This is not part
    /// of core replication; it's how a leader learns a non-voter/slow peer
    /// has caught up enough to be promoted or kept in the replica set.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn ping(&self, rpc: RaftPing) -> Result<RaftPingResponse, RaftError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner.tx_api.send((RaftMsg::Ping { rpc, tx }, span)).map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Get the ID of the current leader from this Raft node's metrics.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn current_leader(&self) -> Option<NodeId> {
        self.metrics().borrow().current_leader
    }

    /// Check that this node is still the cluster leader, guarding against
    /// stale reads (§8).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn client_read(&self) -> Result<(), ClientReadError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::ClientReadRequest { tx }, span))
            .map_err(|_| ClientReadError::RaftError(RaftError::ShuttingDown))?;
        rx.await.map_err(|_| ClientReadError::RaftError(RaftError::ShuttingDown)).and_then(|res| res)
    }

    /// Submit a mutating client request (§5.1): appended to the log,
    /// committed, and applied to the state machine; the applied response is
    /// returned.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn client_write(&self, rpc: ClientWriteRequest<D>) -> Result<ClientWriteResponse<R>, ClientWriteError<D>> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        if let Err(e) = self.inner.tx_api.send((RaftMsg::ClientWriteRequest { rpc, tx }, span)) {
            tracing::error!("error when Raft::client_write: send to tx_api: {}", e);
            return Err(ClientWriteError::RaftError(RaftError::ShuttingDown));
        }
        match rx.await {
            Ok(v) => {
                if let Err(ref e) = v {
                    tracing::error!("error Raft::client_write: {:?}", e);
                }
                v
            }
            Err(e) => {
                tracing::error!("error when Raft::client_write: recv from rx: {}", e);
                Err(ClientWriteError::RaftError(RaftError::ShuttingDown))
            }
        }
    }

    /// Initialize a pristine node (log index 0, `NonVoter`) with the given
    /// member set. Safe to call redundantly — `NotAllowed` just means the
    /// cluster is already up.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn initialize(&self, members: BTreeSet<NodeId>) -> Result<(), InitializeError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::Initialize { members, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| InitializeError::RaftError(RaftError::ShuttingDown)).and_then(|res| res)
    }

    /// Begin syncing a new node as a non-voter (§6). Returns once the node
    /// has caught up; callers then call [`Raft::change_membership`].
    #[tracing::instrument(level = "debug", skip(self, id), fields(target = id))]
    pub async fn add_non_voter(&self, id: NodeId) -> Result<(), ResponseError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner.tx_api.send((RaftMsg::AddNonVoter { id, tx }, span)).map_err(|_| RaftError::ShuttingDown)?;
        let res = match rx.await {
            Ok(x) => x,
            Err(e) => {
                tracing::error!("recv rx error: {}", e);
                return Err(ChangeConfigError::RaftError(RaftError::ShuttingDown).into());
            }
        };
        res?;
        Ok(())
    }

    /// Propose a membership change (§6), entering joint consensus until the
    /// new config is safely committed.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn change_membership(&self, members: BTreeSet<NodeId>) -> Result<(), ResponseError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::ChangeMembership { members, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;
        let res = match rx.await {
            Ok(x) => x,
            Err(e) => {
                tracing::error!("recv rx error: {}", e);
                return Err(ChangeConfigError::RaftError(RaftError::ShuttingDown).into());
            }
        };
        res?;
        Ok(())
    }

    /// A handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// A handle for waiting on a metrics condition; see [`Wait`].
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = timeout.unwrap_or_else(|| Duration::from_millis(500));
        Wait { timeout, rx: self.inner.rx_metrics.clone() }
    }

    /// Shut down this group: request the fiber group's teardown and await it.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            handle.join().await??;
        }
        Ok(())
    }
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> Clone for Raft<D, R, N, SM> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

pub(crate) type ClientWriteResponseTx<D, R> = oneshot::Sender<Result<ClientWriteResponse<R>, ClientWriteError<D>>>;
pub(crate) type ClientReadResponseTx = oneshot::Sender<Result<(), ClientReadError>>;
pub(crate) type ResponseTx = oneshot::Sender<Result<u64, ResponseError>>;

/// A message coming from the [`Raft`] API into the core consensus fiber.
pub(crate) enum RaftMsg<D: AppData, R: AppDataResponse> {
    AppendEntries { rpc: AppendEntriesRequest<D>, tx: oneshot::Sender<Result<AppendEntriesResponse, RaftError>> },
    RequestVote { rpc: VoteRequest, tx: oneshot::Sender<Result<VoteResponse, RaftError>> },
    InstallSnapshot { rpc: InstallSnapshotRequest, tx: oneshot::Sender<Result<InstallSnapshotResponse, RaftError>> },
    Ping { rpc: RaftPing, tx: oneshot::Sender<Result<RaftPingResponse, RaftError>> },
    ClientWriteRequest { rpc: ClientWriteRequest<D>, tx: ClientWriteResponseTx<D, R> },
    ClientReadRequest { tx: ClientReadResponseTx },
    Initialize { members: BTreeSet<NodeId>, tx: oneshot::Sender<Result<(), InitializeError>> },
    AddNonVoter { id: NodeId, tx: ResponseTx },
    ChangeMembership { members: BTreeSet<NodeId>, tx: ResponseTx },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by a cluster leader to replicate log entries (§5.3), and as a heartbeat (§5.2).
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest<D: AppData> {
    pub term: u64,
    pub leader_id: u64,
    pub prev_log_id: LogId,
    #[serde(bound = "D: AppData")]
    pub entries: Vec<Entry<D>>,
    pub leader_commit: u64,
}

impl<D: AppData> MessageSummary for AppendEntriesRequest<D> {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, prev_log_id={}, leader_commit={}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_id,
            self.leader_commit,
            self.entries.len()
        )
    }
}

/// The response to an `AppendEntriesRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// Present, and only meaningful, when `success` is `false` (§5.3's
    /// conflicting-term optimization).
    pub conflict_opt: Option<ConflictOpt>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ConflictOpt {
    pub log_id: LogId,
}

/// A Raft log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub log_id: LogId,
    #[serde(bound = "D: AppData")]
    pub payload: EntryPayload<D>,
}

impl<D: AppData> Entry<D> {
    pub fn new_purged_marker(log_id: LogId) -> Self {
        Entry { log_id, payload: EntryPayload::PurgedMarker }
    }
}

impl<D: AppData> MessageSummary for Entry<D> {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

impl<D: AppData> MessageSummary for &[Entry<D>] {
    fn summary(&self) -> String {
        self.iter().map(|x| format!("{}:{}", x.log_id, x.payload.summary())).collect::<Vec<_>>().join(",")
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload<D: AppData> {
    /// An empty payload committed by a new leader to confirm its term (§8's
    /// no-op-on-election-rule: a leader cannot safely advance its commit
    /// index purely off prior-term entries until it has committed one of
    /// its own).
    Blank,
    #[serde(bound = "D: AppData")]
    Normal(EntryNormal<D>),
    ConfigChange(EntryConfigChange),
    /// Marks that all entries before this point have been purged by a
    /// snapshot/compaction.
    PurgedMarker,
}

impl<D: AppData> MessageSummary for EntryPayload<D> {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Blank => "blank".to_string(),
            EntryPayload::Normal(_) => "normal".to_string(),
            EntryPayload::ConfigChange(c) => format!("config-change: {:?}", c.membership),
            EntryPayload::PurgedMarker => "purged-marker".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryNormal<D: AppData> {
    #[serde(bound = "D: AppData")]
    pub data: D,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryConfigChange {
    pub membership: MembershipConfig,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The membership configuration of the cluster. Unlike classic single-config
/// Raft, this is always (potentially trivially) a joint config: a quorum
/// requires a majority of *every* member set present, which collapses to
/// ordinary single-config majority when `members_after_consensus` is `None`.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipConfig {
    pub members: BTreeSet<NodeId>,
    /// Present only while a configuration change is in joint consensus.
    pub members_after_consensus: Option<BTreeSet<NodeId>>,
}

impl MembershipConfig {
    pub fn all_nodes(&self) -> BTreeSet<u64> {
        let mut all = self.members.clone();
        if let Some(members) = &self.members_after_consensus {
            all.extend(members);
        }
        all
    }

    pub fn contains(&self, x: &NodeId) -> bool {
        self.members.contains(x) || self.members_after_consensus.as_ref().map(|m| m.contains(x)).unwrap_or(false)
    }

    pub fn is_in_joint_consensus(&self) -> bool {
        self.members_after_consensus.is_some()
    }

    pub fn new_initial(id: NodeId) -> Self {
        let mut members = BTreeSet::new();
        members.insert(id);
        Self { members, members_after_consensus: None }
    }

    pub fn to_final_config(&self) -> Self {
        match &self.members_after_consensus {
            None => self.clone(),
            Some(m) => MembershipConfig { members: m.clone(), members_after_consensus: None },
        }
    }

    /// A set is a quorum of this config only if it is a majority of
    /// `members` AND (when in joint consensus) a majority of
    /// `members_after_consensus` too (§4.3's joint-consensus quorum rule).
    pub fn is_quorum<'a>(&self, ids: impl Iterator<Item = &'a NodeId> + Clone) -> bool {
        let is_majority_of = |set: &BTreeSet<NodeId>| -> bool {
            if set.is_empty() {
                return true;
            }
            let count = ids.clone().filter(|id| set.contains(id)).count();
            count >= crate::quorum(set.len())
        };
        is_majority_of(&self.members) && self.members_after_consensus.as_ref().map(is_majority_of).unwrap_or(true)
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by candidates to gather votes (§5.2). `pre_vote` marks a
/// non-disruptive probe (§4.3): a responder grants a pre-vote purely based
/// on log up-to-dateness, without persisting a term bump or a real vote.
#[derive(Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub pre_vote: bool,
    /// Tags the voting round this request belongs to (§4.3's `voteId`), so the
    /// candidate can silently discard a response that arrives after it has
    /// already moved on to a later round.
    pub vote_id: u64,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

impl VoteRequest {
    pub fn new(term: u64, candidate_id: u64, last_log_index: u64, last_log_term: u64, pre_vote: bool, vote_id: u64) -> Self {
        Self { term, candidate_id, last_log_index, last_log_term, pre_vote, vote_id }
    }
}

/// The response to a `VoteRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
    /// Echoes the request's `pre_vote` flag so the candidate can tell which
    /// phase this response belongs to.
    pub pre_vote: bool,
    /// Echoes the request's `vote_id` so stale rounds can be discarded.
    pub vote_id: u64,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the Raft leader to send chunks of a snapshot to a follower (§7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: u64,
    pub meta: SnapshotMeta,
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, meta={:?}, offset={}, len={}, done={}",
            self.term,
            self.leader_id,
            self.meta,
            self.offset,
            self.data.len(),
            self.done
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A member-manager readiness probe (§4.5): a cheap RPC used to decide
/// whether a peer is alive and how far behind it is, independent of the
/// replication stream's own AppendEntries cadence. Carries the prober's full
/// view of group and ID-set membership so the responder can notice a
/// split-brain on which nodes belong to the group.
#[derive(Debug, Serialize, Deserialize)]
pub struct RaftPing {
    pub term: u64,
    pub group_id: GroupId,
    pub node_id: NodeId,
    pub member_ids: BTreeSet<NodeId>,
    pub observer_ids: BTreeSet<NodeId>,
}

/// Echoes the responder's own view of group membership back to the prober,
/// so a mismatch against what was sent is observable.
#[derive(Debug, Serialize, Deserialize)]
pub struct RaftPingResponse {
    pub term: u64,
    pub last_log_index: u64,
    pub member_ids: BTreeSet<NodeId>,
    pub observer_ids: BTreeSet<NodeId>,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An application specific client request to update the state of the system (§5.1).
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientWriteRequest<D: AppData> {
    #[serde(bound = "D: AppData")]
    pub(crate) entry: EntryPayload<D>,
}

impl<D: AppData> MessageSummary for ClientWriteRequest<D> {
    fn summary(&self) -> String {
        self.entry.summary()
    }
}

impl<D: AppData> ClientWriteRequest<D> {
    pub fn new(entry: D) -> Self {
        Self::new_base(EntryPayload::Normal(EntryNormal { data: entry }))
    }

    pub(crate) fn new_base(entry: EntryPayload<D>) -> Self {
        Self { entry }
    }

    pub(crate) fn new_config(membership: MembershipConfig) -> Self {
        Self::new_base(EntryPayload::ConfigChange(EntryConfigChange { membership }))
    }

    pub(crate) fn new_blank_payload() -> Self {
        Self::new_base(EntryPayload::Blank)
    }
}

/// The response to a `ClientWriteRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientWriteResponse<R: AppDataResponse> {
    pub index: u64,
    #[serde(bound = "R: AppDataResponse")]
    pub data: R,
}
