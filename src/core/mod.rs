//! The core logic of a Raft node.

mod admin;
mod append_entries;
mod client;
mod install_snapshot;
mod member_manager;
mod vote;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::interval;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tokio::time::Interval;
use tracing::Span;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::config::SnapshotPolicy;
use crate::core::client::ClientRequestEntry;
use crate::error::ChangeConfigError;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::StoreError;
use crate::fiber::FiberGroup;
use crate::fiber::FiberHandle;
use crate::metrics::LeaderMetrics;
use crate::metrics::RaftMetrics;
use crate::raft::ClientReadResponseTx;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponseTx;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft::MembershipConfig;
use crate::raft::RaftMsg;
use crate::raft::RaftPingResponse;
use crate::raft::ResponseTx;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::store::segment::EntryType;
use crate::store::segment::LogItem;
use crate::store::status_file::VoteStatus;
use crate::store::LogStore;
use crate::AppData;
use crate::AppDataResponse;
use crate::GroupId;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::StateMachine;
use crate::Update;

/// The core type implementing the Raft protocol for one group.
pub struct RaftCore<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> {
    id: NodeId,
    group_id: GroupId,
    config: Arc<Config>,
    membership: MembershipConfig,
    network: Arc<N>,
    state_machine: Arc<SM>,
    /// Shared with every replication stream fiber spawned off this group; `Arc<Mutex<_>>`
    /// rather than `Rc<RefCell<_>>` because the outer `FnOnce` passed to
    /// `FiberGroup::fire_fiber` must be `Send`, even though the future it produces need not be.
    log_store: Arc<tokio::sync::Mutex<LogStore>>,
    fiber_group: FiberGroup,

    /// The non-voters this node is currently aware of, for echoing back in a member-manager
    /// ping response (§4.5). Only ever non-empty while this node is leader; kept in sync with
    /// `LeaderState::non_voters` by `LeaderState::sync_known_observers`.
    known_observers: BTreeSet<NodeId>,

    target_state: State,

    /// The index of the highest log entry known to be committed cluster-wide.
    commit_index: u64,

    /// The log id of the highest log entry applied to the local state machine.
    last_applied: LogId,

    /// The current term.
    current_term: u64,
    /// The ID of the current leader of the Raft cluster.
    current_leader: Option<NodeId>,
    /// The ID of the candidate this node voted for in the current term.
    voted_for: Option<NodeId>,
    /// Monotonically increasing tag for the active voting round (§4.3's `voteId`). Bumped at
    /// the start of every pre-vote and every real-vote broadcast so that a response belonging
    /// to an abandoned round can be recognized and silently dropped.
    current_vote_id: u64,

    /// The last entry appended to the log.
    last_log_id: LogId,

    /// The node's current snapshot state.
    snapshot_state: Option<SnapshotState<SM::SnapshotData>>,
    /// The log id up to which the current snapshot includes, inclusive, if one exists.
    snapshot_last_log_id: LogId,
    /// Bumped every time a compaction job is started; guards against a stale completion from
    /// an aborted job clobbering a newer one's result.
    compaction_generation: u64,

    /// The last time a heartbeat was received.
    last_heartbeat: Option<Instant>,
    /// The duration until the next election timeout.
    next_election_timeout: Option<Instant>,

    tx_compaction: mpsc::Sender<SnapshotUpdate>,
    rx_compaction: mpsc::Receiver<SnapshotUpdate>,

    rx_api: mpsc::UnboundedReceiver<(RaftMsg<D, R>, Span)>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> RaftCore<D, R, N, SM> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn spawn(
        group_id: GroupId,
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        state_machine: Arc<SM>,
        fiber_group: FiberGroup,
        rx_api: mpsc::UnboundedReceiver<(RaftMsg<D, R>, Span)>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> RaftResult<FiberHandle<RaftResult<()>>> {
        let log_store = LogStore::open(&config).await?;
        let membership = MembershipConfig::new_initial(id); // Replaced from the log in `main`.
        let (tx_compaction, rx_compaction) = mpsc::channel(1);
        let this = Self {
            id,
            group_id,
            config,
            membership,
            network,
            state_machine,
            log_store: Arc::new(tokio::sync::Mutex::new(log_store)),
            fiber_group: fiber_group.clone(),
            known_observers: BTreeSet::new(),
            target_state: State::Follower,
            commit_index: 0,
            last_applied: LogId::default(),
            current_term: 0,
            current_leader: None,
            voted_for: None,
            current_vote_id: 0,
            last_log_id: LogId::default(),
            snapshot_state: None,
            snapshot_last_log_id: LogId::default(),
            compaction_generation: 0,
            last_heartbeat: None,
            next_election_timeout: None,
            tx_compaction,
            rx_compaction,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        Ok(fiber_group.fire_fiber(move || this.main().instrument(tracing::debug_span!("spawn"))))
    }

    /// The main loop of the Raft protocol.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!("raft node is initializing");

        {
            let log_store = self.log_store.lock().await;
            let last_index = log_store.last_log_index().unwrap_or(0);
            let last_term = log_store.last_log_term().unwrap_or(0) as u64;
            self.last_log_id = LogId::new(last_term, last_index);
            let vote = log_store.vote_status();
            self.current_term = vote.current_term;
            self.voted_for = vote.voted_for;
        }

        // No separate membership record is persisted: the last ConfigChange entry in the log
        // is the source of truth, so reconstruct it by walking backward from the tail.
        self.membership = self.rebuild_membership_from_log().await?;

        if let Some(snapshot) =
            self.state_machine.get_current_snapshot().await.map_err(|err| self.map_sm_error(err))?
        {
            self.snapshot_last_log_id = snapshot.meta.last_log_id;
            self.last_applied = snapshot.meta.last_log_id;
            self.report_metrics(Update::Ignore);
        }
        // It is unsafe to initialize the node's commit index to any other value. The commit
        // index must be re-derived by a leader after successfully committing a new log, or
        // learned from a leader's AppendEntries RPC.
        self.commit_index = 0;

        let has_log = self.last_log_id.index != u64::MIN;
        let single = self.membership.members.len() == 1;
        let is_voter = self.membership.contains(&self.id);

        self.target_state = match (has_log, single, is_voter) {
            (true, true, false) => State::NonVoter,
            (true, false, false) => State::NonVoter,
            (false, true, false) => State::NonVoter,
            (false, false, false) => State::NonVoter,
            (true, true, true) => State::Leader,
            (false, true, true) => State::NonVoter,
            (true, false, true) => State::Follower,
            (false, false, true) => State::Follower,
        };

        if self.target_state == State::Follower {
            // A restarted node gets a generous grace period before it may time out and disrupt
            // an otherwise stable cluster while network links re-establish.
            let inst = Instant::now()
                + Duration::from_secs(2)
                + Duration::from_millis(self.config.new_rand_election_timeout());
            self.next_election_timeout = Some(inst);
        }

        tracing::debug!("id={} target_state: {:?}", self.id, self.target_state);

        loop {
            match &self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::NonVoter => NonVoterState::new(&mut self).run().await?,
                State::Shutdown => {
                    tracing::info!("node has shutdown");
                    return Ok(());
                }
            }
        }
    }

    /// Walk the log backward from its tail looking for the most recent `ConfigChange` entry.
    /// Falls back to a single-node initial membership if none is found (pristine node).
    async fn rebuild_membership_from_log(&self) -> RaftResult<MembershipConfig> {
        let mut idx = self.last_log_id.index;
        if idx == 0 {
            return Ok(MembershipConfig::new_initial(self.id));
        }
        let log_store = self.log_store.lock().await;
        while idx > 0 {
            let item = log_store.read_at(idx).await.map_err(RaftError::Store)?;
            let entry: Entry<D> = decode_entry(&item)?;
            if let EntryPayload::ConfigChange(change) = entry.payload {
                return Ok(change.membership);
            }
            idx -= 1;
        }
        Ok(MembershipConfig::new_initial(self.id))
    }

    /// Report a metrics payload on the current state of the Raft node.
    #[tracing::instrument(level = "trace", skip(self))]
    fn report_metrics(&mut self, leader_metrics: Update<Option<&LeaderMetrics>>) {
        let leader_metrics = match leader_metrics {
            Update::Update(v) => v.cloned(),
            Update::Ignore => self.tx_metrics.borrow().leader_metrics.clone(),
        };

        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id,
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            last_applied: self.last_applied.index,
            current_leader: self.current_leader,
            membership_config: self.membership.clone(),
            snapshot: self.snapshot_last_log_id,
            leader_metrics,
        });

        if let Err(err) = res {
            tracing::error!(error=%err, id=self.id, "error reporting metrics");
        }
    }

    /// Persist the node's current term and vote to the status file.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_hard_state(&mut self) -> RaftResult<()> {
        let status = VoteStatus {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        let res = self.log_store.lock().await.persist_vote(status).await;
        res.map_err(|err| self.map_store_error(err))
    }

    /// Update core's target state, ensuring all invariants are upheld.
    #[tracing::instrument(level = "trace", skip(self))]
    fn set_target_state(&mut self, target_state: State) {
        if target_state == State::Follower && !self.membership.contains(&self.id) {
            self.target_state = State::NonVoter;
        } else {
            self.target_state = target_state;
        }
    }

    /// Get the next election timeout, generating a new value if not set.
    #[tracing::instrument(level = "trace", skip(self))]
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = Duration::from_millis(self.config.new_rand_election_timeout());
                tracing::debug!("create election timeout after: {:?}", t);
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Set a value for the next election timeout.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();
        let t = Duration::from_millis(self.config.new_rand_election_timeout());
        self.next_election_timeout = Some(now + t);
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    /// Push the next election timeout forward by a flat second, per §4.3's throttle on a
    /// failed pre-vote round ("lastElectTimeNs is pushed forward by one second to throttle
    /// failed pre-votes"), rather than drawing a fresh jittered interval.
    #[tracing::instrument(level = "trace", skip(self))]
    fn throttle_failed_pre_vote(&mut self) {
        let now = Instant::now();
        let base = self.next_election_timeout.unwrap_or(now);
        self.next_election_timeout = Some(std::cmp::max(base, now) + Duration::from_secs(1));
    }

    /// Update the value of the `current_leader` property.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        match update {
            UpdateCurrentLeader::ThisNode => self.current_leader = Some(self.id),
            UpdateCurrentLeader::OtherNode(target) => self.current_leader = Some(target),
            UpdateCurrentLeader::Unknown => self.current_leader = None,
        }
    }

    /// Encapsulates updating the current term, as `voted_for` must also be updated in step.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// Map a fatal log-store error, initiating shutdown.
    #[tracing::instrument(level = "trace", skip(self))]
    fn map_store_error(&mut self, err: StoreError) -> RaftError {
        tracing::error!({error=?err, id=self.id}, "fatal storage error, shutting down");
        self.set_target_state(State::Shutdown);
        RaftError::Store(err)
    }

    /// Map a fatal state machine error, initiating shutdown. Per the state machine's write-path
    /// contract, an `exec` failure is always fatal to the group.
    #[tracing::instrument(level = "trace", skip(self))]
    fn map_sm_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!({error=?err, id=self.id}, "fatal state machine error, shutting down");
        self.set_target_state(State::Shutdown);
        RaftError::StateMachine(err)
    }

    /// Update the node's current membership config.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_membership(&mut self, cfg: MembershipConfig) -> RaftResult<()> {
        self.membership = cfg;
        if !self.membership.contains(&self.id) {
            self.set_target_state(State::NonVoter);
        } else if self.target_state == State::NonVoter && self.membership.members.contains(&self.id) {
            self.set_target_state(State::Follower);
        }
        Ok(())
    }

    /// Update the system's snapshot state based on the given data.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_snapshot_state(&mut self, update: SnapshotUpdate) {
        match update {
            SnapshotUpdate::SnapshotComplete(log_id, generation) => {
                if generation == self.compaction_generation {
                    self.snapshot_last_log_id = log_id;
                    self.snapshot_state = None;
                    self.report_metrics(Update::Ignore);
                }
            }
            SnapshotUpdate::SnapshotFailed(generation) => {
                if generation == self.compaction_generation {
                    self.snapshot_state = None;
                }
            }
        }
    }

    /// Trigger a log compaction (snapshot) job if needed. If `force`, skip the threshold check.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(self) fn trigger_log_compaction_if_needed(&mut self, force: bool) {
        if self.snapshot_state.is_some() {
            return;
        }
        let threshold = match &self.config.snapshot_policy {
            SnapshotPolicy::Disabled => return,
            SnapshotPolicy::LogsSinceLast(threshold) => *threshold,
        };
        if self.last_applied.index == 0 || self.last_applied.index < self.snapshot_last_log_id.index {
            return;
        }
        if !force && self.last_applied.index < self.snapshot_last_log_id.index + threshold {
            return;
        }

        self.compaction_generation += 1;
        let generation = self.compaction_generation;
        self.snapshot_state = Some(SnapshotState::Snapshotting);

        let state_machine = self.state_machine.clone();
        let tx_compaction = self.tx_compaction.clone();
        self.fiber_group.fire_fiber(move || async move {
            match state_machine.take_snapshot().await {
                Ok(snapshot) => {
                    let _ = tx_compaction.send(SnapshotUpdate::SnapshotComplete(snapshot.meta.last_log_id, generation)).await;
                }
                Err(err) => {
                    tracing::error!(error=%err, "error while generating snapshot");
                    let _ = tx_compaction.send(SnapshotUpdate::SnapshotFailed(generation)).await;
                }
            }
        });
    }

    /// Apply a single entry to the state machine, updating membership in-place for config
    /// changes. Used for background catch-up; the leader's client-visible apply path goes
    /// through `LeaderState::apply_client_entry` instead, since it must also return `R`.
    pub(crate) async fn apply_entry(&mut self, entry: &Entry<D>) -> RaftResult<()> {
        match &entry.payload {
            EntryPayload::Blank | EntryPayload::PurgedMarker => {}
            EntryPayload::Normal(normal) => {
                self.state_machine
                    .exec(entry.log_id.index, normal.data.clone())
                    .await
                    .map_err(|err| self.map_sm_error(err))?;
            }
            EntryPayload::ConfigChange(change) => {
                self.update_membership(change.membership.clone())?;
            }
        }
        self.last_applied = entry.log_id;
        self.report_metrics(Update::Ignore);
        Ok(())
    }

    /// Apply every committed-but-unapplied entry up to and including `upto_index`.
    pub(crate) async fn catch_up_apply(&mut self, upto_index: u64) -> RaftResult<()> {
        while self.last_applied.index < upto_index {
            let batch = self.load_apply_batch(upto_index).await?;
            for entry in &batch {
                self.apply_entry(entry).await?;
            }
        }
        Ok(())
    }

    /// Batch-load committed-but-unapplied entries from the log store,
    /// starting just after `last_applied` and capped at `upto_index` (§4.4's
    /// follower/restart-path "batch-load up to 100 items or 16 MiB"): reads
    /// stop as soon as either `max_apply_batch_entries` entries or
    /// `max_apply_batch_bytes` of header+body bytes have been accumulated,
    /// whichever limit is hit first.
    async fn load_apply_batch(&mut self, upto_index: u64) -> RaftResult<Vec<Entry<D>>> {
        let max_entries = self.config.max_apply_batch_entries.max(1) as u64;
        let max_bytes = self.config.max_apply_batch_bytes;
        let start_index = self.last_applied.index + 1;
        let end_index = upto_index.min(start_index + max_entries - 1);

        let mut items = Vec::new();
        let mut bytes = 0usize;
        let mut idx = start_index;
        while idx <= end_index {
            let item = {
                let log_store = self.log_store.lock().await;
                log_store.read_at(idx).await
            };
            let item = item.map_err(|err| self.map_store_error(err))?;
            bytes += item.header.len() + item.body.len();
            let over_budget = bytes >= max_bytes;
            items.push(item);
            if over_budget {
                break;
            }
            idx += 1;
        }

        items.iter().map(decode_entry).collect()
    }

    /// Apply every entry up to the current commit index, then check for compaction.
    pub(crate) async fn apply_committed_entries(&mut self) -> RaftResult<()> {
        let target = self.commit_index;
        self.catch_up_apply(target).await?;
        self.trigger_log_compaction_if_needed(false);
        Ok(())
    }

    /// Read the term at `index`, or `None` if no such entry exists locally.
    pub(crate) async fn term_at(&mut self, index: u64) -> RaftResult<Option<u64>> {
        if index == 0 {
            return Ok(Some(0));
        }
        if index == self.last_log_id.index {
            return Ok(Some(self.last_log_id.term));
        }
        if index > self.last_log_id.index {
            return Ok(None);
        }
        let item = {
            let log_store = self.log_store.lock().await;
            log_store.read_at(index).await
        };
        match item {
            Ok(item) => Ok(Some(item.term as u64)),
            Err(StoreError::Corrupt(_)) => Ok(None),
            Err(err) => Err(self.map_store_error(err)),
        }
    }

    /// Recompute `last_log_id` after a truncation down to `new_last_index`.
    pub(crate) async fn recompute_last_log_id(&mut self, new_last_index: u64) -> RaftResult<LogId> {
        if new_last_index == 0 {
            return Ok(LogId::default());
        }
        let item = {
            let log_store = self.log_store.lock().await;
            log_store.read_at(new_last_index).await
        };
        match item {
            Ok(item) => Ok(LogId::new(item.term as u64, new_last_index)),
            Err(err) => Err(self.map_store_error(err)),
        }
    }

    /// Reject an init config request due to the Raft node being in a state which prohibits it.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn reject_init_with_config(&self, tx: oneshot::Sender<Result<(), InitializeError>>) {
        let _ = tx.send(Err(InitializeError::NotAllowed));
    }

    /// Reject a proposed config change request due to this node not being leader.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn reject_config_change_not_leader(&self, tx: ResponseTx) {
        let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(self.current_leader).into()));
    }

    /// Forward the given client write request to the leader.
    #[tracing::instrument(level = "trace", skip(self, req, tx))]
    fn forward_client_write_request(&self, req: ClientWriteRequest<D>, tx: ClientWriteResponseTx<D, R>) {
        match req.entry {
            EntryPayload::Normal(entry) => {
                let _ = tx.send(Err(ClientWriteError::ForwardToLeader {
                    entry: entry.data,
                    leader: self.current_leader,
                }));
            }
            _ => {
                tracing::error!("unreachable branch hit, attempting to forward a raft-internal entry");
            }
        }
    }

    /// Forward the given client read request to the leader.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn forward_client_read_request(&self, tx: ClientReadResponseTx) {
        let _ = tx.send(Err(ClientReadError::ForwardToLeader(self.current_leader)));
    }

    /// Answer a member-manager liveness ping (§4.5): log a mismatch against this node's own
    /// group/term, then echo back this node's current term, log position and membership view
    /// so the prober can detect a split-brain on the member/observer ID sets.
    fn handle_ping(&self, rpc: crate::raft::RaftPing) -> crate::raft::RaftPingResponse {
        if rpc.group_id != self.group_id {
            tracing::warn!(
                from = rpc.node_id,
                expected_group = self.group_id,
                got_group = rpc.group_id,
                "received a member-manager ping addressed to the wrong group"
            );
        }
        crate::raft::RaftPingResponse {
            term: self.current_term,
            last_log_index: self.last_log_id.index,
            member_ids: self.membership.all_nodes(),
            observer_ids: self.known_observers.clone(),
        }
    }
}

/// Turn an `Entry<D>` into the on-disk `LogItem` it is appended as. The whole payload enum is
/// serialized into the body rather than just `D`, so that config changes and blank leader
/// entries round-trip through the log without the state machine ever being asked to decode them.
pub(crate) fn encode_entry<D: AppData>(entry: &Entry<D>, prev_log_term: u64) -> RaftResult<LogItem> {
    let entry_type = match &entry.payload {
        EntryPayload::Normal(_) => EntryType::Normal,
        EntryPayload::ConfigChange(_) => EntryType::ConfigChange,
        EntryPayload::Blank | EntryPayload::PurgedMarker => EntryType::NoOp,
    };
    let body = serde_json::to_vec(&entry.payload).map_err(|err| RaftError::StateMachine(err.into()))?;
    let timestamp_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let header = LogItem::pack_header(0, timestamp_ms, &[]);
    Ok(LogItem {
        index: entry.log_id.index,
        term: entry.log_id.term as u32,
        prev_log_term: prev_log_term as u32,
        entry_type,
        biz_type: 0,
        timestamp_ms,
        header,
        body,
    })
}

/// Reconstruct an `Entry<D>` from its on-disk `LogItem`.
pub(crate) fn decode_entry<D: AppData>(item: &LogItem) -> RaftResult<Entry<D>> {
    let payload: EntryPayload<D> = serde_json::from_slice(&item.body).map_err(|err| RaftError::StateMachine(err.into()))?;
    Ok(Entry {
        log_id: LogId::new(item.term as u64, item.index),
        payload,
    })
}

/// An enum describing the way the current leader property is to be updated.
#[derive(Debug)]
pub(self) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeId),
    ThisNode,
}

/// The current snapshot state of the Raft node.
pub(self) enum SnapshotState<S> {
    /// The Raft node is compacting itself.
    Snapshotting,
    /// The Raft node is streaming in a snapshot from the leader.
    Streaming {
        /// The offset of the last byte written to the snapshot.
        offset: u64,
        /// The ID of the snapshot being written.
        id: String,
        /// A handle to the snapshot writer.
        snapshot: Box<S>,
    },
}

/// An update on a snapshot creation process, tagged with the generation that started it.
#[derive(Debug)]
pub(self) enum SnapshotUpdate {
    SnapshotComplete(LogId, u64),
    SnapshotFailed(u64),
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible states of a Raft node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// The node is completely passive; replicating entries, but neither voting nor timing out.
    #[default]
    NonVoter,
    /// The node is replicating logs from the leader.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the Raft cluster leader.
    Leader,
    /// The Raft node is shutting down.
    Shutdown,
}

impl State {
    pub fn is_non_voter(&self) -> bool {
        matches!(self, Self::NonVoter)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the Raft leader.
struct LeaderState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> {
    pub(super) core: &'a mut RaftCore<D, R, N, SM>,
    /// A mapping of node IDs to the replication state of the target node.
    pub(super) nodes: BTreeMap<NodeId, ReplicationState<D>>,
    /// A mapping of new nodes (non-voters) being synced in order to join the cluster.
    pub(super) non_voters: BTreeMap<NodeId, NonVoterReplicationState<D>>,
    /// Whether this node will be stepping down after committing the current config change.
    pub(super) is_stepping_down: bool,

    pub leader_metrics: LeaderMetrics,

    /// The stream of events coming from replication streams.
    pub(super) replication_rx: mpsc::UnboundedReceiver<(ReplicaEvent<SM::SnapshotData>, Span)>,
    /// The cloneable sender channel for replication stream events.
    pub(super) replication_tx: mpsc::UnboundedSender<(ReplicaEvent<SM::SnapshotData>, Span)>,

    /// A buffer of client requests appended locally, awaiting cluster-wide commit.
    pub(super) awaiting_committed: Vec<ClientRequestEntry<D, R>>,

    /// Tracks the cluster's current consensus state, for dynamic membership.
    pub(super) consensus_state: ConsensusState,

    /// Per-peer state for the member manager's liveness probe (§4.5), keyed by `NodeId` so it
    /// survives a non-voter's promotion from `non_voters` into `nodes`.
    pub(super) ping_states: BTreeMap<NodeId, PeerPingState>,
    /// Bumped every time a peer's replication stream is (re)spawned; the value at that moment
    /// becomes the peer's new ping epoch.
    pub(super) next_ping_epoch: u64,
    /// Fires on `config.ping_interval_ms` to launch the next round of member-manager pings.
    pub(super) ping_interval: Interval,
    /// The stream of ping outcomes coming back from fibers spawned by `send_member_pings`.
    pub(super) ping_rx: mpsc::UnboundedReceiver<PingOutcome>,
    /// The cloneable sender channel for ping outcomes.
    pub(super) ping_tx: mpsc::UnboundedSender<PingOutcome>,
}

/// A ping round's outcome reported back by its fiber: the target, the epoch it was launched
/// under, and either the peer's response or a stringified network/timeout error.
pub(super) type PingOutcome = (NodeId, u64, Result<RaftPingResponse, String>);

/// Per-peer state for the member manager's liveness probe (§4.5).
pub(super) struct PeerPingState {
    /// The epoch this peer's replication stream was last (re)spawned under. A response carrying
    /// an older epoch belongs to a connection that no longer exists and must be dropped.
    pub epoch: u64,
    pub in_flight: bool,
    pub ready: bool,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> LeaderState<'a, D, R, N, SM> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, SM>) -> Self {
        let consensus_state = if core.membership.is_in_joint_consensus() {
            ConsensusState::Joint { is_committed: false }
        } else {
            ConsensusState::Uniform
        };
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        let (ping_tx, ping_rx) = mpsc::unbounded_channel();
        let ping_interval_ms = core.config.ping_interval_ms;
        core.known_observers.clear();
        Self {
            core,
            nodes: BTreeMap::new(),
            non_voters: BTreeMap::new(),
            is_stepping_down: false,
            leader_metrics: LeaderMetrics::default(),
            replication_tx,
            replication_rx,
            consensus_state,
            awaiting_committed: Vec::new(),
            ping_states: BTreeMap::new(),
            next_ping_epoch: 0,
            ping_interval: interval(Duration::from_millis(ping_interval_ms)),
            ping_rx,
            ping_tx,
        }
    }

    /// Spawn a replication stream targeting the given node, registering a fresh ping epoch for
    /// it so that a liveness response belonging to a previous connection to this target cannot
    /// be mistaken for one belonging to the new stream.
    pub(super) fn spawn_replication_stream(&mut self, target: NodeId) -> ReplicationState<D> {
        let replstream = ReplicationStream::new(
            self.core.group_id,
            self.core.id,
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.last_log_id,
            self.core.commit_index,
            self.core.network.clone(),
            self.core.log_store.clone(),
            self.replication_tx.clone(),
            &self.core.fiber_group,
        );
        self.next_ping_epoch += 1;
        self.ping_states.insert(target, PeerPingState { epoch: self.next_ping_epoch, in_flight: false, ready: false });
        ReplicationState {
            matched: LogId::default(),
            remove_after_commit: None,
            replstream,
        }
    }

    /// Keep `core.known_observers` in sync with the non-voters currently tracked here, so a
    /// member-manager ping answered while this node is leader reports an accurate observer set.
    pub(super) fn sync_known_observers(&mut self) {
        self.core.known_observers = self.non_voters.keys().cloned().collect();
    }

    /// Transition to the Raft leader state.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        let targets = self
            .core
            .membership
            .all_nodes()
            .into_iter()
            .filter(|elem| elem != &self.core.id)
            .collect::<Vec<_>>();

        for target in targets {
            let state = self.spawn_replication_stream(target);
            self.nodes.insert(target, state);
        }

        self.core.last_heartbeat = None;
        self.core.next_election_timeout = None;
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        self.leader_report_metrics();

        // Per §8, commit an initial entry as part of becoming the cluster leader.
        self.commit_initial_leader_entry().await?;

        loop {
            if !self.core.target_state.is_leader() {
                tracing::info!("id={} state becomes: {:?}", self.core.id, self.core.target_state);
                for node in self.nodes.values() {
                    let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
                }
                for node in self.non_voters.values() {
                    let _ = node.state.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
                }
                return Ok(());
            }

            let span = tracing::debug_span!("CHrx:LeaderState");
            let _ent = span.enter();

            tokio::select! {
                Some((msg,span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries{rpc, tx} => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote{rpc, tx} => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot{rpc, tx} => {
                            let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        RaftMsg::Ping{rpc, tx} => {
                            let _ = tx.send(Ok(self.core.handle_ping(rpc)));
                        }
                        RaftMsg::ClientReadRequest{tx} => {
                            self.handle_client_read_request(tx).await;
                        }
                        RaftMsg::ClientWriteRequest{rpc, tx} => {
                            self.handle_client_write_request(rpc, tx).await;
                        }
                        RaftMsg::Initialize{tx, ..} => {
                            self.core.reject_init_with_config(tx);
                        }
                        RaftMsg::AddNonVoter{id, tx} => {
                            self.add_member(id, tx);
                        }
                        RaftMsg::ChangeMembership{members, tx} => {
                            self.change_membership(members, tx).await;
                        }
                    }
                },
                Some(update) = self.core.rx_compaction.recv() => {
                    self.core.update_snapshot_state(update);
                }
                Some((event, span)) = self.replication_rx.recv() => {
                    let _ent = span.enter();
                    self.handle_replica_event(event).await;
                }
                _ = self.ping_interval.tick() => {
                    self.send_member_pings();
                }
                Some((target, epoch, result)) = self.ping_rx.recv() => {
                    self.handle_ping_response(target, epoch, result);
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }

    /// Report metrics with leader specific state.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn leader_report_metrics(&mut self) {
        self.core.report_metrics(Update::Update(Some(&self.leader_metrics)));
    }
}

/// A struct tracking the state of a replication stream from the perspective of the Raft actor.
struct ReplicationState<D: AppData> {
    pub matched: LogId,
    pub remove_after_commit: Option<u64>,
    pub replstream: ReplicationStream<D>,
}

/// The same as `ReplicationState`, except for non-voters.
struct NonVoterReplicationState<D: AppData> {
    pub state: ReplicationState<D>,
    /// Whether this non-voter is ready to join the cluster.
    pub is_ready_to_join: bool,
    /// The response channel to use once this node has successfully synced with the cluster.
    pub tx: Option<ResponseTx>,
}

/// A state enum used by Raft leaders to navigate the joint consensus protocol.
pub enum ConsensusState {
    /// The cluster is preparing to enter joint consensus, but the leader is still syncing
    /// non-voters to prepare them for cluster membership.
    NonVoterSync {
        awaiting: HashSet<NodeId>,
        members: BTreeSet<NodeId>,
        tx: ResponseTx,
    },
    /// The cluster is in a joint consensus state and is syncing new nodes.
    Joint {
        /// Whether the config which started this joint consensus has yet been committed.
        is_committed: bool,
    },
    /// The cluster consensus is uniform; not in a joint consensus state.
    Uniform,
}

impl ConsensusState {
    pub fn is_joint_consensus_safe_to_finalize(&self) -> bool {
        match self {
            ConsensusState::Joint { is_committed } => *is_committed,
            _ => false,
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in candidate state.
struct CandidateState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> {
    core: &'a mut RaftCore<D, R, N, SM>,
    votes_granted_old: u64,
    votes_needed_old: u64,
    votes_granted_new: u64,
    votes_needed_new: u64,
    /// The `vote_id` tagging the real-vote round currently in flight, used to discard stale
    /// responses from an abandoned round.
    vote_id: u64,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> CandidateState<'a, D, R, N, SM> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, SM>) -> Self {
        Self {
            core,
            votes_granted_old: 0,
            votes_needed_old: 0,
            votes_granted_new: 0,
            votes_needed_new: 0,
            vote_id: 0,
        }
    }

    /// Run the candidate loop. Each iteration first runs a non-disruptive pre-vote round
    /// (§4.3): only a quorum-granted pre-vote earns the right to actually bump `current_term`
    /// and cast a real, persisted vote. A failed pre-vote throttles the next attempt by a flat
    /// second rather than retrying immediately, so a partitioned node doesn't spin.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            if !self.run_pre_vote_round().await? {
                if self.core.target_state.is_candidate() {
                    self.core.throttle_failed_pre_vote();
                }
                continue;
            }
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            self.votes_granted_old = 1; // We vote for ourselves.
            self.votes_needed_old = crate::quorum(self.core.membership.members.len()) as u64;
            if let Some(nodes) = &self.core.membership.members_after_consensus {
                self.votes_granted_new = 1;
                self.votes_needed_new = crate::quorum(nodes.len()) as u64;
            }

            self.core.update_next_election_timeout(false);
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_hard_state().await?;
            self.core.report_metrics(Update::Update(None));

            let mut pending_votes = self.spawn_parallel_vote_requests();

            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());

                let span = tracing::debug_span!("CHrx:CandidateState");
                let _ent = span.enter();

                tokio::select! {
                    _ = timeout_fut => break,
                    Some((res, peer)) = pending_votes.recv() => self.handle_vote_response(res, peer).await?,
                    Some((msg,span)) = self.core.rx_api.recv() => {
                        let _ent = span.enter();
                        match msg {
                            RaftMsg::AppendEntries{rpc, tx} => {
                                let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                            }
                            RaftMsg::RequestVote{rpc, tx} => {
                                let _ = tx.send(self.core.handle_vote_request(rpc).await);
                            }
                            RaftMsg::InstallSnapshot{rpc, tx} => {
                                let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                            }
                            RaftMsg::Ping{rpc, tx} => {
                                let _ = tx.send(Ok(self.core.handle_ping(rpc)));
                            }
                            RaftMsg::ClientReadRequest{tx} => {
                                self.core.forward_client_read_request(tx);
                            }
                            RaftMsg::ClientWriteRequest{rpc, tx} => {
                                self.core.forward_client_write_request(rpc, tx);
                            }
                            RaftMsg::Initialize{tx, ..} => {
                                self.core.reject_init_with_config(tx);
                            }
                            RaftMsg::AddNonVoter{tx, ..} => {
                                self.core.reject_config_change_not_leader(tx);
                            }
                            RaftMsg::ChangeMembership{tx, ..} => {
                                self.core.reject_config_change_not_leader(tx);
                            }
                        }
                    },
                    Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update),
                    Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in follower state.
pub struct FollowerState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> {
    core: &'a mut RaftCore<D, R, N, SM>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> FollowerState<'a, D, R, N, SM> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, SM>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="follower"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.report_metrics(Update::Update(None));
        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }
            let election_timeout = sleep_until(self.core.get_next_election_timeout());

            let span = tracing::debug_span!("CHrx:FollowerState");
            let _ent = span.enter();

            tokio::select! {
                _ = election_timeout => self.core.set_target_state(State::Candidate),
                Some((msg,span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries{rpc, tx} => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote{rpc, tx} => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot{rpc, tx} => {
                            let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        RaftMsg::Ping{rpc, tx} => {
                            let _ = tx.send(Ok(self.core.handle_ping(rpc)));
                        }
                        RaftMsg::ClientReadRequest{tx} => {
                            self.core.forward_client_read_request(tx);
                        }
                        RaftMsg::ClientWriteRequest{rpc, tx} => {
                            self.core.forward_client_write_request(rpc, tx);
                        }
                        RaftMsg::Initialize{tx, ..} => {
                            self.core.reject_init_with_config(tx);
                        }
                        RaftMsg::AddNonVoter{tx, ..} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::ChangeMembership{tx, ..} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                    }
                },
                Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update),
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in non-voter state.
pub struct NonVoterState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> {
    core: &'a mut RaftCore<D, R, N, SM>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> NonVoterState<'a, D, R, N, SM> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, SM>) -> Self {
        Self { core }
    }

    /// Run the non-voter loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="non-voter"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        self.core.report_metrics(Update::Update(None));
        loop {
            if !self.core.target_state.is_non_voter() {
                return Ok(());
            }

            let span = tracing::debug_span!("CHrx:NonVoterState");
            let _ent = span.enter();

            tokio::select! {
                Some((msg,span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries{rpc, tx} => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote{rpc, tx} => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot{rpc, tx} => {
                            let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        RaftMsg::Ping{rpc, tx} => {
                            let _ = tx.send(Ok(self.core.handle_ping(rpc)));
                        }
                        RaftMsg::ClientReadRequest{tx} => {
                            self.core.forward_client_read_request(tx);
                        }
                        RaftMsg::ClientWriteRequest{rpc, tx} => {
                            self.core.forward_client_write_request(rpc, tx);
                        }
                        RaftMsg::Initialize{members, tx} => {
                            let _ = tx.send(self.handle_init_with_config(members).await);
                        }
                        RaftMsg::AddNonVoter{tx, ..} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::ChangeMembership{tx, ..} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                    }
                },
                Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update),
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}
