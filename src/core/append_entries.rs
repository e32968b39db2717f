use crate::core::decode_entry;
use crate::core::encode_entry;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::ConflictOpt;
use crate::raft::Entry;
use crate::storage::StateMachine;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::RaftNetwork;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> RaftCore<D, R, N, SM> {
    /// Handle an AppendEntries RPC (§5.3), the leader's only mechanism for replicating log
    /// entries and, with an empty `entries`, for heartbeating (§5.2).
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        rpc: AppendEntriesRequest<D>,
    ) -> RaftResult<AppendEntriesResponse> {
        if rpc.term < self.current_term {
            return Ok(AppendEntriesResponse { term: self.current_term, success: false, conflict_opt: None });
        }

        if rpc.term > self.current_term {
            self.update_current_term(rpc.term, None);
        }
        self.set_target_state(State::Follower);
        self.update_next_election_timeout(true);
        self.update_current_leader(UpdateCurrentLeader::OtherNode(rpc.leader_id));
        self.save_hard_state().await?;

        // 1. The log must agree with the leader at `prev_log_id`, or we reject and report
        // enough information for the leader's conflict-optimization to skip ahead efficiently.
        if rpc.prev_log_id.index > 0 {
            let local_term = self.term_at(rpc.prev_log_id.index).await?;
            match local_term {
                None => {
                    let conflict_index = self.last_log_id.index.min(rpc.prev_log_id.index);
                    return Ok(AppendEntriesResponse {
                        term: self.current_term,
                        success: false,
                        conflict_opt: Some(ConflictOpt { log_id: LogId::new(0, conflict_index) }),
                    });
                }
                Some(term) if term != rpc.prev_log_id.term => {
                    let conflict_index = self.first_index_of_term(term, rpc.prev_log_id.index).await?;
                    self.log_store.lock().await.truncate_from(conflict_index).await.map_err(|err| self.map_store_error(err))?;
                    self.last_log_id = self.recompute_last_log_id(conflict_index.saturating_sub(1)).await?;
                    return Ok(AppendEntriesResponse {
                        term: self.current_term,
                        success: false,
                        conflict_opt: Some(ConflictOpt { log_id: LogId::new(term, conflict_index) }),
                    });
                }
                _ => {}
            }
        }

        // 2. Reconcile the suffix: skip entries already present with a matching term, truncate
        // at the first mismatch, then append whatever remains.
        for entry in &rpc.entries {
            if entry.log_id.index <= self.last_log_id.index {
                let existing_term = self.term_at(entry.log_id.index).await?;
                if existing_term == Some(entry.log_id.term) {
                    continue;
                }
                self.log_store.lock().await.truncate_from(entry.log_id.index).await.map_err(|err| self.map_store_error(err))?;
                self.last_log_id = self.recompute_last_log_id(entry.log_id.index.saturating_sub(1)).await?;
            }
            let prev_term = self.last_log_id.term;
            let item = encode_entry(entry, prev_term)?;
            self.log_store.lock().await.append(item).await.map_err(|err| self.map_store_error(err))?;
            self.last_log_id = entry.log_id;
        }

        // 3. Advance the commit index and apply anything newly committed.
        if rpc.leader_commit > self.commit_index {
            self.commit_index = rpc.leader_commit.min(self.last_log_id.index);
            self.apply_committed_entries().await?;
        }

        Ok(AppendEntriesResponse { term: self.current_term, success: true, conflict_opt: None })
    }

    /// Find the first index, at or before `at_index`, holding `term`. Used to let a leader's
    /// next AppendEntries jump straight past an entire conflicting term rather than retry one
    /// index at a time.
    async fn first_index_of_term(&mut self, term: u64, at_index: u64) -> RaftResult<u64> {
        let mut idx = at_index;
        while idx > 1 {
            if self.term_at(idx - 1).await? != Some(term) {
                break;
            }
            idx -= 1;
        }
        Ok(idx)
    }

    /// Decode a single previously-appended entry. Exposed to `client.rs`/`replication` for the
    /// catch-up and commit-initial-entry paths that need to look at one specific log record.
    pub(super) async fn read_decoded_entry(&mut self, index: u64) -> RaftResult<Entry<D>> {
        let item = {
            let log_store = self.log_store.lock().await;
            log_store.read_at(index).await
        };
        let item = item.map_err(|err| self.map_store_error(err))?;
        decode_entry(&item)
    }
}
