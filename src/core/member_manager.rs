//! The member manager's liveness probe (§4.5): independent of whatever
//! AppendEntries traffic happens to be flowing, periodically ping every
//! tracked peer and use the round trip to maintain a `ready` flag that
//! reflects current liveness rather than historical replication catch-up.

use std::collections::BTreeSet;

use tokio::time::timeout;
use tokio::time::Duration;

use crate::core::LeaderState;
use crate::raft::RaftPing;
use crate::raft::RaftPingResponse;
use crate::storage::StateMachine;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftNetwork;

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> LeaderState<'a, D, R, N, SM> {
    /// Launch one ping fiber per tracked peer not already awaiting a response. Each carries the
    /// epoch current for that peer at launch time, so a response arriving after the peer's
    /// replication stream has been torn down and respawned is recognized as stale.
    pub(super) fn send_member_pings(&mut self) {
        let group_id = self.core.group_id;
        let node_id = self.core.id;
        let member_ids: BTreeSet<NodeId> = self.core.membership.all_nodes();
        let observer_ids: BTreeSet<NodeId> = self.non_voters.keys().cloned().collect();
        let ping_timeout = Duration::from_millis(self.core.config.ping_interval_ms);

        let targets: Vec<NodeId> = self.ping_states.keys().cloned().collect();
        for target in targets {
            let epoch = match self.ping_states.get(&target) {
                Some(state) if !state.in_flight => state.epoch,
                _ => continue,
            };
            if let Some(state) = self.ping_states.get_mut(&target) {
                state.in_flight = true;
            }

            let rpc = RaftPing {
                term: self.core.current_term,
                group_id,
                node_id,
                member_ids: member_ids.clone(),
                observer_ids: observer_ids.clone(),
            };
            let network = self.core.network.clone();
            let ping_tx = self.ping_tx.clone();
            self.core.fiber_group.fire_fiber(move || async move {
                let outcome = match timeout(ping_timeout, network.ping(target, rpc)).await {
                    Ok(Ok(resp)) => Ok(resp),
                    Ok(Err(err)) => Err(err.to_string()),
                    Err(_) => Err("ping timed out".to_string()),
                };
                let _ = ping_tx.send((target, epoch, outcome));
            });
        }
    }

    /// Apply a ping round's outcome. A response (or failure) carrying an epoch that no longer
    /// matches the peer's current one belongs to a connection since torn down and respawned, and
    /// is dropped rather than used to update readiness.
    pub(super) fn handle_ping_response(&mut self, target: NodeId, epoch: u64, result: Result<RaftPingResponse, String>) {
        let ready = match self.ping_states.get_mut(&target) {
            Some(state) if state.epoch == epoch => {
                state.in_flight = false;
                state.ready = result.is_ok();
                state.ready
            }
            _ => {
                tracing::debug!(target, epoch, "dropping stale member-manager ping response");
                return;
            }
        };

        match &result {
            Ok(resp) if resp.member_ids != self.core.membership.all_nodes() => {
                tracing::debug!(target, ours = ?self.core.membership.all_nodes(), theirs = ?resp.member_ids, "member-manager ping reports a diverging member set");
            }
            Err(err) => tracing::debug!(target, error=%err, "member-manager ping failed"),
            _ => {}
        }

        let matched = self
            .nodes
            .get(&target)
            .map(|s| s.matched)
            .or_else(|| self.non_voters.get(&target).map(|n| n.state.matched))
            .unwrap_or_default();
        self.leader_metrics.replication.insert(target, crate::metrics::ReplicationMetrics { matched, ready });
        self.leader_report_metrics();
    }
}
