use tokio::sync::mpsc;
use tokio::time::sleep_until;
use tokio::time::Duration;

use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::storage::StateMachine;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftNetwork;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> RaftCore<D, R, N, SM> {
    /// Handle a VoteRequest RPC (§5.2), covering both the non-disruptive pre-vote probe and a
    /// real vote (§4.3).
    #[tracing::instrument(level = "debug", skip(self, req))]
    pub(super) async fn handle_vote_request(&mut self, req: VoteRequest) -> RaftResult<VoteResponse> {
        if req.term < self.current_term {
            return Ok(VoteResponse { term: self.current_term, vote_granted: false, pre_vote: req.pre_vote, vote_id: req.vote_id });
        }

        if req.pre_vote {
            // A pre-vote never persists state or resets this node's own timer: granting one
            // costs nothing if the candidate turns out to lose the real election.
            let recently_heard_from_leader = self
                .last_heartbeat
                .map(|t| t.elapsed() < Duration::from_millis(self.config.election_timeout_min_ms))
                .unwrap_or(false);
            let grant = self.log_is_at_least_as_current(&req) && !recently_heard_from_leader;
            return Ok(VoteResponse { term: self.current_term, vote_granted: grant, pre_vote: true, vote_id: req.vote_id });
        }

        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.set_target_state(State::Follower);
            self.save_hard_state().await?;
        }

        let grant = self.log_is_at_least_as_current(&req) && (self.voted_for.is_none() || self.voted_for == Some(req.candidate_id));

        if grant {
            self.voted_for = Some(req.candidate_id);
            self.update_next_election_timeout(false);
            self.save_hard_state().await?;
        }

        Ok(VoteResponse { term: self.current_term, vote_granted: grant, pre_vote: false, vote_id: req.vote_id })
    }

    /// §5.4's log up-to-dateness check: the candidate's log must be at least as current as
    /// ours, comparing by last term first, then by index.
    fn log_is_at_least_as_current(&self, req: &VoteRequest) -> bool {
        req.last_log_term > self.last_log_id.term
            || (req.last_log_term == self.last_log_id.term && req.last_log_index >= self.last_log_id.index)
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> CandidateState<'a, D, R, N, SM> {
    /// Broadcast a `VoteRequest` to every other voting member, returning the channel its
    /// responses stream back on. `term` is the term the request carries: for a pre-vote round
    /// this is `current_term + 1` speculatively, without actually bumping `current_term`.
    pub(super) fn spawn_vote_requests(&self, term: u64, pre_vote: bool, vote_id: u64) -> mpsc::UnboundedReceiver<(VoteResponse, NodeId)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let targets: Vec<NodeId> = self.core.membership.all_nodes().into_iter().filter(|id| *id != self.core.id).collect();

        for target in targets {
            let rpc = VoteRequest::new(term, self.core.id, self.core.last_log_id.index, self.core.last_log_id.term, pre_vote, vote_id);
            let network = self.core.network.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                match network.vote(target, rpc).await {
                    Ok(res) => {
                        let _ = tx.send((res, target));
                    }
                    Err(err) => {
                        tracing::warn!(target, error=%err, "vote request failed");
                    }
                }
            });
        }

        rx
    }

    /// Run the non-disruptive pre-vote round (§4.3): ask for votes at `current_term + 1`
    /// without persisting anything. Returns `true` once a quorum of both halves of the
    /// membership (plain majority outside joint consensus) has granted, `false` if the
    /// election timeout elapses first or a higher term is observed. Responses tagged with a
    /// stale `vote_id` (an earlier round this candidate has already abandoned) are discarded.
    pub(self) async fn run_pre_vote_round(&mut self) -> RaftResult<bool> {
        self.core.current_vote_id += 1;
        let vote_id = self.core.current_vote_id;
        let speculative_term = self.core.current_term + 1;

        let mut granted_old = 1u64; // We grant ourselves a pre-vote.
        let needed_old = crate::quorum(self.core.membership.members.len()) as u64;
        let mut granted_new = 1u64;
        let needed_new = self
            .core
            .membership
            .members_after_consensus
            .as_ref()
            .map(|nodes| crate::quorum(nodes.len()) as u64)
            .unwrap_or(0);

        let mut pending = self.spawn_vote_requests(speculative_term, true, vote_id);
        self.core.update_next_election_timeout(false);

        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(false);
            }
            if granted_old >= needed_old && granted_new >= needed_new {
                return Ok(true);
            }

            let timeout_fut = sleep_until(self.core.get_next_election_timeout());
            tokio::select! {
                _ = timeout_fut => return Ok(false),
                Some((res, target)) = pending.recv() => {
                    if res.vote_id != vote_id || !res.pre_vote {
                        continue; // Stale round, ignore.
                    }
                    if res.term > self.core.current_term {
                        self.core.update_current_term(res.term, None);
                        self.core.update_current_leader(UpdateCurrentLeader::Unknown);
                        self.core.set_target_state(State::Follower);
                        self.core.save_hard_state().await?;
                        return Ok(false);
                    }
                    if !res.vote_granted {
                        continue;
                    }
                    if self.core.membership.members.contains(&target) {
                        granted_old += 1;
                    }
                    let is_in_new = self.core.membership.members_after_consensus.as_ref().map(|m| m.contains(&target)).unwrap_or(false);
                    if is_in_new {
                        granted_new += 1;
                    }
                }
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    self.handle_rpc_while_campaigning(msg).await?;
                }
                Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update),
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_state(State::Shutdown);
                    return Ok(false);
                }
            }
        }
    }

    /// Broadcast the real `VoteRequest` for the term this candidate has already incremented
    /// into and voted for itself in, tagging the round with a fresh `vote_id`.
    pub(super) fn spawn_parallel_vote_requests(&mut self) -> mpsc::UnboundedReceiver<(VoteResponse, NodeId)> {
        self.core.current_vote_id += 1;
        self.vote_id = self.core.current_vote_id;
        self.spawn_vote_requests(self.core.current_term, false, self.vote_id)
    }

    /// Handle an inbound RPC while campaigning (pre-vote or real-vote wait), mirroring what the
    /// candidate loop does with the same message types.
    async fn handle_rpc_while_campaigning(&mut self, msg: crate::raft::RaftMsg<D, R>) -> RaftResult<()> {
        use crate::raft::RaftMsg;
        match msg {
            RaftMsg::AppendEntries { rpc, tx } => {
                let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
            }
            RaftMsg::RequestVote { rpc, tx } => {
                let _ = tx.send(self.core.handle_vote_request(rpc).await);
            }
            RaftMsg::InstallSnapshot { rpc, tx } => {
                let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
            }
            RaftMsg::Ping { rpc, tx } => {
                let _ = tx.send(Ok(self.core.handle_ping(rpc)));
            }
            RaftMsg::ClientReadRequest { tx } => {
                self.core.forward_client_read_request(tx);
            }
            RaftMsg::ClientWriteRequest { rpc, tx } => {
                self.core.forward_client_write_request(rpc, tx);
            }
            RaftMsg::Initialize { tx, .. } => {
                self.core.reject_init_with_config(tx);
            }
            RaftMsg::AddNonVoter { tx, .. } => {
                self.core.reject_config_change_not_leader(tx);
            }
            RaftMsg::ChangeMembership { tx, .. } => {
                self.core.reject_config_change_not_leader(tx);
            }
        }
        Ok(())
    }

    /// Tally a single `VoteResponse`, stepping down if it reveals a newer term, otherwise
    /// counting the grant toward both halves of a joint-consensus quorum where relevant.
    /// Responses from a round this candidate has already abandoned (`vote_id` mismatch) are
    /// silently discarded, per §4.3.
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, target: NodeId) -> RaftResult<()> {
        if res.vote_id != self.vote_id || res.pre_vote {
            return Ok(());
        }

        if res.term > self.core.current_term {
            self.core.update_current_term(res.term, None);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
            self.core.save_hard_state().await?;
            return Ok(());
        }

        if !res.vote_granted {
            return Ok(());
        }

        if self.core.membership.members.contains(&target) {
            self.votes_granted_old += 1;
        }
        let is_in_new = self.core.membership.members_after_consensus.as_ref().map(|m| m.contains(&target)).unwrap_or(false);
        if is_in_new {
            self.votes_granted_new += 1;
        }

        if self.votes_granted_old >= self.votes_needed_old && self.votes_granted_new >= self.votes_needed_new {
            self.core.set_target_state(State::Leader);
        }

        Ok(())
    }
}
