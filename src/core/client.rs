use std::sync::Arc;

use anyhow::anyhow;
use futures::stream::FuturesUnordered;
use futures::stream::StreamExt;
use tokio::time::timeout;
use tokio::time::Duration;

use crate::core::LeaderState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::RaftResult;
use crate::error::ResponseError;
use crate::quorum;
use crate::raft::AppendEntriesRequest;
use crate::raft::ClientReadResponseTx;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponse;
use crate::raft::ClientWriteResponseTx;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft::ResponseTx;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::storage::StateMachine;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;
use crate::RaftNetwork;

/// A wrapper around a client request which has been transformed into an entry, along with its
/// response channel.
pub(super) struct ClientRequestEntry<D: AppData, R: AppDataResponse> {
    /// The Arc'd entry of the client request.
    ///
    /// This value is Arc'd so that it may be sent across thread boundaries for replication
    /// without having to clone the data payload itself.
    pub entry: Arc<Entry<D>>,
    /// The response channel for the request.
    pub tx: ClientOrInternalResponseTx<D, R>,
}

impl<D: AppData, R: AppDataResponse> ClientRequestEntry<D, R> {
    /// Create a new instance from the raw components of a client request.
    pub(crate) fn from_entry<T: Into<ClientOrInternalResponseTx<D, R>>>(entry: Entry<D>, tx: T) -> Self {
        Self { entry: Arc::new(entry), tx: tx.into() }
    }
}

/// An enum type wrapping either a client response channel or an internal Raft response channel.
#[derive(derive_more::From)]
pub enum ClientOrInternalResponseTx<D: AppData, R: AppDataResponse> {
    Client(ClientWriteResponseTx<D, R>),
    Internal(Option<ResponseTx>),
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> LeaderState<'a, D, R, N, SM> {
    /// Commit the initial entry which new leaders are obligated to create when first coming to
    /// power (§8).
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        // If the cluster has just formed, and the current index is 0, then commit the current
        // config, else a blank payload.
        let last_index = self.core.last_log_id.index;

        let req: ClientWriteRequest<D> = if last_index == 0 {
            ClientWriteRequest::new_config(self.core.membership.clone())
        } else {
            // Complete a partial member-change:
            //
            // Raft appends two consecutive membership change logs: the joint config and the
            // final config, to implement a membership change.
            //
            // It is possible only the first one, the joint config log, was ever written to
            // storage or replicated. If a new leader sees only that one, it must append the
            // final config log itself to let the change-membership operation finish.
            let last_log = self.core.read_decoded_entry(last_index).await?;

            let req = match last_log.payload {
                EntryPayload::ConfigChange(ref mem) => {
                    if mem.membership.members_after_consensus.is_some() {
                        let final_config = mem.membership.to_final_config();
                        Some(ClientWriteRequest::new_config(final_config))
                    } else {
                        None
                    }
                }
                _ => None,
            };

            req.unwrap_or_else(ClientWriteRequest::new_blank_payload)
        };

        // Commit the initial payload to the cluster.
        let entry = self.append_payload_to_log(req.entry).await?;

        let cr_entry = ClientRequestEntry::from_entry(entry, None);
        self.replicate_client_request(cr_entry).await;

        Ok(())
    }

    /// Handle client read requests.
    ///
    /// Spawn requests to all members of the cluster, including members being added in joint
    /// consensus. Each request has a timeout, and we respond once we have majority agreement
    /// from each config group. Most of the time there is a single uniform config group.
    ///
    /// Per §8: a leader must check whether it has been deposed before answering a read-only
    /// request (its information may be stale if a more recent leader has been elected). This is
    /// handled by exchanging heartbeats with a majority of the cluster before responding.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_client_read_request(&mut self, tx: ClientReadResponseTx) {
        // Will never be zero, as we don't allow it when proposing config changes.
        let len_members = self.core.membership.members.len();
        let c0_needed = quorum(len_members);
        let mut c0_confirmed = 1usize; // Count ourselves.

        let mut c1_confirmed = 0usize;
        let mut c1_needed = 0usize;
        if let Some(joint_members) = &self.core.membership.members_after_consensus {
            c1_needed = quorum(joint_members.len());
            if joint_members.contains(&self.core.id) {
                c1_confirmed += 1;
            }
        }

        // If we already have all needed confirmations — the case for single node clusters —
        // then respond immediately.
        if c0_confirmed >= c0_needed && c1_confirmed >= c1_needed {
            let _ = tx.send(Ok(()));
            return;
        }

        // Spawn parallel heartbeats, all with the standard timeout.
        let mut pending = FuturesUnordered::new();
        for (id, node) in self.nodes.iter() {
            let rpc = AppendEntriesRequest {
                term: self.core.current_term,
                leader_id: self.core.id,
                prev_log_id: node.matched,
                entries: vec![],
                leader_commit: self.core.commit_index,
            };
            let target = *id;
            let network = self.core.network.clone();
            let ttl = Duration::from_millis(self.core.config.heartbeat_interval_ms);
            pending.push(async move {
                match timeout(ttl, network.append_entries(target, rpc)).await {
                    Ok(Ok(res)) => Ok((target, res)),
                    Ok(Err(err)) => Err((target, err)),
                    Err(_timeout) => Err((target, anyhow!("timeout waiting for leadership confirmation"))),
                }
            });
        }

        // Handle responses as they return.
        while let Some(res) = pending.next().await {
            let (target, data) = match res {
                Ok(res) => res,
                Err((target, err)) => {
                    tracing::warn!(target, error=%err, "error confirming leadership for read request");
                    continue;
                }
            };

            // If we receive a response with a greater term, revert to follower and abort.
            if data.term > self.core.current_term {
                self.core.update_current_term(data.term, None);
                self.core.set_target_state(State::Follower);
                let _ = tx.send(Err(ClientReadError::ForwardToLeader(None)));
                return;
            }

            if self.core.membership.members.contains(&target) {
                c0_confirmed += 1;
            }
            if self
                .core
                .membership
                .members_after_consensus
                .as_ref()
                .map(|members| members.contains(&target))
                .unwrap_or(false)
            {
                c1_confirmed += 1;
            }
            if c0_confirmed >= c0_needed && c1_confirmed >= c1_needed {
                let _ = tx.send(Ok(()));
                return;
            }
        }

        // If we've hit this location, we failed to gather the needed confirmations because too
        // many heartbeats timed out or errored.
        let _ = tx.send(Err(ClientReadError::RaftExecTimeout));
    }

    /// Handle client write requests.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) async fn handle_client_write_request(&mut self, rpc: ClientWriteRequest<D>, tx: ClientWriteResponseTx<D, R>) {
        let entry = match self.append_payload_to_log(rpc.entry).await {
            Ok(entry) => ClientRequestEntry::from_entry(entry, tx),
            Err(err) => {
                let _ = tx.send(Err(ClientWriteError::RaftError(err)));
                return;
            }
        };
        self.replicate_client_request(entry).await;
    }

    /// Transform the given payload into an entry, assign an index and term, and append it to the
    /// log.
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(super) async fn append_payload_to_log(&mut self, payload: EntryPayload<D>) -> RaftResult<Entry<D>> {
        let entry = Entry {
            log_id: LogId::new(self.core.current_term, self.core.last_log_id.index + 1),
            payload,
        };
        let item = crate::core::encode_entry(&entry, self.core.last_log_id.term)?;
        self.core.log_store.lock().await.append(item).await.map_err(|err| self.core.map_store_error(err))?;
        self.core.last_log_id = entry.log_id;

        self.leader_report_metrics();

        Ok(entry)
    }

    /// Begin the process of replicating the given client request.
    ///
    /// NOTE WELL: this routine does not wait for the request to actually finish replication, it
    /// merely begins the process. Once the request is committed to the cluster, its response is
    /// generated asynchronously by `handle_replica_event`/`drain_awaiting_committed`.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn replicate_client_request(&mut self, req: ClientRequestEntry<D, R>) {
        let entry_arc = req.entry.clone();

        if self.nodes.is_empty() && self.non_voters.is_empty() {
            // There are no other voting nodes, so the payload is already committed.
            self.core.commit_index = entry_arc.log_id.index;
            self.leader_report_metrics();
            self.client_request_post_commit(req).await;
            return;
        }

        self.awaiting_committed.push(req);

        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send((
                RaftEvent::Replicate { entry: entry_arc.clone(), commit_index: self.core.commit_index },
                tracing::debug_span!("CH"),
            ));
        }
        for node in self.non_voters.values() {
            let _ = node.state.replstream.repl_tx.send((
                RaftEvent::Replicate { entry: entry_arc.clone(), commit_index: self.core.commit_index },
                tracing::debug_span!("CH"),
            ));
        }
    }

    /// Handle every event emitted by a replication stream: a line-rate/lagging transition, a
    /// new match index, a peer revealing a newer term, a snapshot request, or a fatal error.
    #[tracing::instrument(level = "trace", skip(self, event))]
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent<SM::SnapshotData>) {
        match event {
            ReplicaEvent::RateUpdate { target, is_line_rate } => {
                tracing::debug!(target, is_line_rate, "replication stream rate update");
            }
            ReplicaEvent::UpdateMatchIndex { target, matched } => {
                self.update_match_index(target, matched).await;
            }
            ReplicaEvent::RevertToFollower { target, term } => {
                tracing::debug!(target, term, "replication stream observed a newer term");
                if term > self.core.current_term {
                    self.core.update_current_term(term, None);
                    self.core.update_current_leader(UpdateCurrentLeader::Unknown);
                    self.core.set_target_state(State::Follower);
                    if let Err(err) = self.core.save_hard_state().await {
                        tracing::error!(error=%err, "error saving hard state while reverting to follower");
                    }
                }
            }
            ReplicaEvent::NeedsSnapshot { target, tx } => {
                match self.core.state_machine.get_current_snapshot().await {
                    Ok(Some(snapshot)) => {
                        let _ = tx.send(snapshot);
                    }
                    Ok(None) => {
                        tracing::warn!(target, "replication stream requested a snapshot, but none exists yet");
                    }
                    Err(err) => {
                        tracing::error!(target, error=%err, "error fetching current snapshot for replication");
                    }
                }
            }
            ReplicaEvent::Shutdown => {
                self.core.set_target_state(State::Shutdown);
            }
        }
    }

    /// Record a peer's newly confirmed match index, recompute the commit index, and drain any
    /// client requests that have become committed as a result.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn update_match_index(&mut self, target: NodeId, matched: LogId) {
        let mut newly_ready_non_voter = false;

        if let Some(state) = self.nodes.get_mut(&target) {
            state.matched = matched;
        } else if let Some(non_voter) = self.non_voters.get_mut(&target) {
            non_voter.state.matched = matched;
            // A non-voter counts as ready to join once it has caught up to the leader's commit
            // index at the time replication started.
            if !non_voter.is_ready_to_join && matched.index >= self.core.commit_index {
                non_voter.is_ready_to_join = true;
                if let Some(tx) = non_voter.tx.take() {
                    let _ = tx.send(Ok(matched.index));
                }
                if let crate::core::ConsensusState::NonVoterSync { awaiting, .. } = &mut self.consensus_state {
                    awaiting.remove(&target);
                }
                newly_ready_non_voter = true;
            }
        }

        // `is_ready_to_join` gates promotion eligibility and latches true forever once a
        // non-voter has caught up; it says nothing about whether the peer is still alive right
        // now. The metrics `ready` flag instead tracks the member manager's liveness probe
        // (§4.5), which keeps refreshing independent of whether any more writes ever reach this
        // peer to update `matched`.
        self.leader_metrics.replication.insert(target, crate::metrics::ReplicationMetrics {
            matched,
            ready: self.ping_states.get(&target).map(|p| p.ready).unwrap_or(false),
        });
        self.leader_report_metrics();

        if newly_ready_non_voter {
            self.maybe_finalize_non_voter_sync().await;
        }

        if let Err(err) = self.advance_commit_index().await {
            tracing::error!(error=%err, "error advancing commit index");
        }
    }

    /// If every non-voter being synced for a pending config change has caught up, proceed to
    /// enter joint consensus.
    async fn maybe_finalize_non_voter_sync(&mut self) {
        let ready = matches!(&self.consensus_state, crate::core::ConsensusState::NonVoterSync { awaiting, .. } if awaiting.is_empty());
        if !ready {
            return;
        }
        if let crate::core::ConsensusState::NonVoterSync { members, tx, .. } =
            std::mem::replace(&mut self.consensus_state, crate::core::ConsensusState::Uniform)
        {
            self.change_membership(members, tx).await;
        }
    }

    /// Recompute the commit index: the highest index replicated to a quorum whose term matches
    /// the current term (§5.4's leader commit rule — a leader may only commit entries from its
    /// own term by counting replicas directly).
    #[tracing::instrument(level = "trace", skip(self))]
    async fn advance_commit_index(&mut self) -> RaftResult<()> {
        let mut indices: Vec<(NodeId, u64)> = self.nodes.iter().map(|(id, state)| (*id, state.matched.index)).collect();
        indices.push((self.core.id, self.core.last_log_id.index));
        indices.sort_unstable_by(|a, b| b.1.cmp(&a.1));

        let mut new_commit = self.core.commit_index;
        for (_, idx) in &indices {
            let idx = *idx;
            if idx <= new_commit {
                continue;
            }
            let holders: Vec<NodeId> = indices.iter().filter(|(_, i)| *i >= idx).map(|(id, _)| *id).collect();
            if !self.core.membership.is_quorum(holders.iter()) {
                continue;
            }
            if self.core.term_at(idx).await?.map(|term| term == self.core.current_term).unwrap_or(false) {
                new_commit = idx;
                break;
            }
        }

        if new_commit > self.core.commit_index {
            self.core.commit_index = new_commit;
            // Drain buffered client requests first: each applies its own entry directly so its
            // response carries the state machine's real result. Afterwards, catch up on any
            // remaining committed entries that have no waiting response (e.g. those committed
            // by a prior leader before this node took over).
            self.drain_awaiting_committed().await;
            self.core.apply_committed_entries().await?;
            self.leader_report_metrics();
        }
        Ok(())
    }

    /// Answer every buffered client request whose entry has become committed, in log order.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn drain_awaiting_committed(&mut self) {
        while let Some(req) = self.awaiting_committed.first() {
            if req.entry.log_id.index > self.core.commit_index {
                break;
            }
            let req = self.awaiting_committed.remove(0);
            self.client_request_post_commit(req).await;
        }
    }

    /// Handle the post-commit logic for a client request.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn client_request_post_commit(&mut self, req: ClientRequestEntry<D, R>) {
        let entry = &req.entry;

        match req.tx {
            ClientOrInternalResponseTx::Client(tx) => match &entry.payload {
                EntryPayload::Normal(_) => match self.apply_client_entry(entry).await {
                    Ok(data) => {
                        let _ = tx.send(Ok(ClientWriteResponse { index: entry.log_id.index, data }));
                    }
                    Err(err) => {
                        let _ = tx.send(Err(ClientWriteError::RaftError(err)));
                    }
                },
                _ => {
                    // Client-visible response channels are only ever attached to `Normal`
                    // entries; anything else reaching here is a programming bug.
                    tracing::error!("critical error in raft core, this is a programming bug, please open an issue");
                    self.core.set_target_state(State::Shutdown);
                }
            },
            ClientOrInternalResponseTx::Internal(tx) => {
                self.handle_special_log(entry);

                // Catch up through and including this entry, rather than applying it alone, so
                // that any earlier committed-but-unapplied entries are never skipped.
                let res = self.core.catch_up_apply(entry.log_id.index).await;
                let res = res.map(|_| entry.log_id.index);
                if let Err(ref err) = res {
                    tracing::error!(error=%err, "error applying internal entry to state machine");
                }

                self.leader_report_metrics();

                if let Some(tx) = tx {
                    let send_res = tx.send(res.map_err(ResponseError::from));
                    tracing::debug!(?send_res, "sent internal response");
                }
            }
        }

        self.core.trigger_log_compaction_if_needed(false);
    }

    pub(super) fn handle_special_log(&mut self, entry: &Arc<Entry<D>>) {
        match &entry.payload {
            EntryPayload::ConfigChange(ref mem) => {
                let m = &mem.membership;
                if m.is_in_joint_consensus() {
                    self.handle_joint_consensus_committed();
                } else {
                    self.handle_uniform_consensus_committed(entry.log_id.index);
                }
            }
            EntryPayload::Blank | EntryPayload::Normal(_) | EntryPayload::PurgedMarker => {}
        }
    }

    /// Apply a client-visible `Normal` entry to the state machine and return its response,
    /// first catching up on anything committed-but-unapplied before it.
    #[tracing::instrument(level = "trace", skip(self, entry))]
    pub(super) async fn apply_client_entry(&mut self, entry: &Entry<D>) -> RaftResult<R> {
        let index = entry.log_id.index;
        self.core.catch_up_apply(index.saturating_sub(1)).await?;

        let data = match &entry.payload {
            EntryPayload::Normal(normal) => {
                self.core.state_machine.exec(index, normal.data.clone()).await.map_err(|err| self.core.map_sm_error(err))?
            }
            _ => unreachable!("apply_client_entry is only ever called with a Normal payload"),
        };

        self.core.last_applied = entry.log_id;
        self.leader_report_metrics();

        Ok(data)
    }
}
