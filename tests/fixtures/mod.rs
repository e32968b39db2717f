//! Shared fixtures for integration tests: an in-memory key/value state
//! machine and an in-process `RaftNetwork` that routes RPCs directly
//! between the `Raft` handles a single test process hosts, without any real
//! transport. Modeled on the teacher crate's own router-based test harness.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncSeek;
use tokio::io::AsyncWrite;
use tokio::io::ReadBuf;
use tokio::sync::Mutex;
use tokio::sync::RwLock;

use multiraft::config::Config;
use multiraft::fiber::DispatcherPool;
use multiraft::metrics::RaftMetrics;
use multiraft::network::RaftNetwork;
use multiraft::raft::AppendEntriesRequest;
use multiraft::raft::AppendEntriesResponse;
use multiraft::raft::ClientWriteRequest;
use multiraft::raft::InstallSnapshotRequest;
use multiraft::raft::InstallSnapshotResponse;
use multiraft::raft::RaftPing;
use multiraft::raft::RaftPingResponse;
use multiraft::raft::VoteRequest;
use multiraft::raft::VoteResponse;
use multiraft::storage::Snapshot;
use multiraft::storage::SnapshotMeta;
use multiraft::storage::StateMachine;
use multiraft::AppData;
use multiraft::AppDataResponse;
use multiraft::GroupId;
use multiraft::NodeId;
use multiraft::Raft;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).with_test_writer().try_init();
}

/// A client write op against the in-memory KV map.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemClientRequest {
    pub key: String,
    pub value: String,
}
impl AppData for MemClientRequest {}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemClientResponse {
    pub previous: Option<String>,
}
impl AppDataResponse for MemClientResponse {}

/// A `Cursor<Vec<u8>>` adapted to tokio's async I/O traits. Every operation
/// is a synchronous memory copy, so polling always resolves immediately —
/// there is never a reason to return `Pending`.
#[derive(Default)]
pub struct MemSnapshotData(std::io::Cursor<Vec<u8>>);

impl MemSnapshotData {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(std::io::Cursor::new(bytes))
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0.into_inner()
    }
}

impl AsyncRead for MemSnapshotData {
    fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        use std::io::Read;
        let mut tmp = vec![0u8; buf.remaining()];
        let n = self.0.read(&mut tmp)?;
        buf.put_slice(&tmp[..n]);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MemSnapshotData {
    fn poll_write(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        use std::io::Write;
        Poll::Ready(self.0.write(buf))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for MemSnapshotData {
    fn start_seek(mut self: Pin<&mut Self>, position: std::io::SeekFrom) -> std::io::Result<()> {
        use std::io::Seek;
        self.0.seek(position).map(|_| ())
    }

    fn poll_complete(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        use std::io::Seek;
        Poll::Ready(self.0.stream_position())
    }
}

#[derive(Default, Clone, Serialize, Deserialize)]
struct MemStateMachineState {
    data: BTreeMap<String, String>,
    last_applied_log: u64,
}

/// A trivial KV state machine, just enough to exercise §8's apply-order and
/// replication properties: `exec` inserts `key -> value` and returns
/// whatever was previously there.
pub struct MemStateMachine {
    state: Mutex<MemStateMachineState>,
    current_snapshot: Mutex<Option<(SnapshotMeta, Vec<u8>)>>,
}

impl MemStateMachine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(MemStateMachineState::default()), current_snapshot: Mutex::new(None) })
    }

    pub async fn last_applied_log(&self) -> u64 {
        self.state.lock().await.last_applied_log
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.state.lock().await.data.get(key).cloned()
    }
}

#[async_trait]
impl StateMachine<MemClientRequest, MemClientResponse> for MemStateMachine {
    type SnapshotData = MemSnapshotData;
    type ShutdownError = std::io::Error;

    fn decode(&self, _biz_type: u16, body: &[u8]) -> anyhow::Result<MemClientRequest> {
        Ok(serde_json::from_slice(body)?)
    }

    async fn exec(&self, index: u64, input: MemClientRequest) -> anyhow::Result<MemClientResponse> {
        let mut state = self.state.lock().await;
        let previous = state.data.insert(input.key, input.value);
        state.last_applied_log = index;
        Ok(MemClientResponse { previous })
    }

    async fn take_snapshot(&self) -> anyhow::Result<Snapshot<Self::SnapshotData>> {
        let state = self.state.lock().await.clone();
        let bytes = serde_json::to_vec(&state)?;
        let meta = SnapshotMeta {
            last_log_id: multiraft::LogId::new(0, state.last_applied_log),
            membership: multiraft::raft::MembershipConfig::default(),
            snapshot_id: format!("snap-{}", state.last_applied_log),
        };
        *self.current_snapshot.lock().await = Some((meta.clone(), bytes.clone()));
        Ok(Snapshot { meta, data: Box::new(MemSnapshotData::new(bytes)) })
    }

    async fn begin_receiving_snapshot(&self) -> anyhow::Result<Box<Self::SnapshotData>> {
        Ok(Box::new(MemSnapshotData::default()))
    }

    async fn install_snapshot(&self, meta: &SnapshotMeta, data: Box<Self::SnapshotData>) -> anyhow::Result<()> {
        let bytes = data.into_inner();
        let restored: MemStateMachineState = serde_json::from_slice(&bytes)?;
        *self.state.lock().await = restored;
        *self.current_snapshot.lock().await = Some((meta.clone(), bytes));
        Ok(())
    }

    async fn get_current_snapshot(&self) -> anyhow::Result<Option<Snapshot<Self::SnapshotData>>> {
        let snap = self.current_snapshot.lock().await.clone();
        Ok(snap.map(|(meta, bytes)| Snapshot { meta, data: Box::new(MemSnapshotData::new(bytes)) }))
    }
}

type TestRaft = Raft<MemClientRequest, MemClientResponse, RaftRouter, MemStateMachine>;

/// An in-process stand-in for the network transport (§1/§6 treat it as an
/// external collaborator): `append_entries`/`vote`/`install_snapshot`/`ping`
/// simply look the target up in `nodes` and call straight through, with no
/// real serialization or socket involved.
pub struct RaftRouter {
    group_id: GroupId,
    config: Arc<Config>,
    dispatcher_pool: DispatcherPool,
    nodes: RwLock<BTreeMap<NodeId, TestRaft>>,
    state_machines: RwLock<BTreeMap<NodeId, Arc<MemStateMachine>>>,
}

impl RaftRouter {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            group_id: 1,
            config,
            dispatcher_pool: DispatcherPool::new(2),
            nodes: RwLock::new(BTreeMap::new()),
            state_machines: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn new_raft_node(self: &Arc<Self>, id: NodeId) {
        let sm = MemStateMachine::new();
        let raft = Raft::new(self.group_id, id, self.config.clone(), self.clone(), sm.clone(), &self.dispatcher_pool)
            .await
            .expect("spawn raft node");
        self.nodes.write().await.insert(id, raft);
        self.state_machines.write().await.insert(id, sm);
    }

    pub async fn remove_node(&self, id: NodeId) {
        self.nodes.write().await.remove(&id);
    }

    pub async fn get_raft_handle(&self, id: &NodeId) -> TestRaft {
        self.nodes.read().await.get(id).expect("node must exist").clone()
    }

    pub async fn get_state_machine(&self, id: &NodeId) -> Arc<MemStateMachine> {
        self.state_machines.read().await.get(id).cloned().expect("node must exist")
    }

    pub async fn initialize_from(&self, leader: NodeId, members: BTreeSet<NodeId>) -> Result<()> {
        let raft = self.get_raft_handle(&leader).await;
        raft.initialize(members).await.map_err(|e| anyhow!(e))?;
        Ok(())
    }

    pub async fn client_write(&self, target: NodeId, key: impl Into<String>, value: impl Into<String>) -> Result<MemClientResponse> {
        let raft = self.get_raft_handle(&target).await;
        let rpc = ClientWriteRequest::new(MemClientRequest { key: key.into(), value: value.into() });
        Ok(raft.client_write(rpc).await.map_err(|e| anyhow!(e.to_string()))?.data)
    }

    pub async fn change_membership(&self, target: NodeId, members: BTreeSet<NodeId>) -> Result<()> {
        let raft = self.get_raft_handle(&target).await;
        raft.change_membership(members).await.map_err(|e| anyhow!(e))?;
        Ok(())
    }

    pub async fn add_non_voter(&self, target: NodeId, id: NodeId) -> Result<()> {
        let raft = self.get_raft_handle(&target).await;
        raft.add_non_voter(id).await.map_err(|e| anyhow!(e))?;
        Ok(())
    }

    pub async fn metrics(&self, id: &NodeId) -> RaftMetrics {
        self.get_raft_handle(id).await.metrics().borrow().clone()
    }

    pub async fn wait_for_metrics(
        &self,
        id: &NodeId,
        mut pred: impl FnMut(&RaftMetrics) -> bool,
        timeout: Duration,
        msg: &str,
    ) -> Result<RaftMetrics> {
        let raft = self.get_raft_handle(id).await;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let m = raft.metrics().borrow().clone();
            if pred(&m) {
                return Ok(m);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("timed out waiting for {}: last metrics {:?}", msg, m));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_state(&self, ids: &BTreeSet<NodeId>, state: multiraft::State, timeout: Duration, msg: &str) -> Result<()> {
        for id in ids {
            self.wait_for_metrics(id, |m| m.state == state, timeout, msg).await?;
        }
        Ok(())
    }

    pub async fn shutdown_all(&self) {
        let ids: Vec<NodeId> = self.nodes.read().await.keys().cloned().collect();
        for id in ids {
            let raft = self.nodes.read().await.get(&id).cloned();
            if let Some(raft) = raft {
                let _ = raft.shutdown().await;
            }
        }
    }
}

#[async_trait]
impl RaftNetwork<MemClientRequest> for RaftRouter {
    async fn append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<MemClientRequest>) -> anyhow::Result<AppendEntriesResponse> {
        let raft = self.get_raft_handle(&target).await;
        raft.append_entries(rpc).await.map_err(|e| anyhow!(e.to_string()))
    }

    async fn vote(&self, target: NodeId, rpc: VoteRequest) -> anyhow::Result<VoteResponse> {
        let raft = self.get_raft_handle(&target).await;
        raft.vote(rpc).await.map_err(|e| anyhow!(e.to_string()))
    }

    async fn install_snapshot(&self, target: NodeId, rpc: InstallSnapshotRequest) -> anyhow::Result<InstallSnapshotResponse> {
        let raft = self.get_raft_handle(&target).await;
        raft.install_snapshot(rpc).await.map_err(|e| anyhow!(e.to_string()))
    }

    async fn ping(&self, target: NodeId, rpc: RaftPing) -> anyhow::Result<RaftPingResponse> {
        let raft = self.get_raft_handle(&target).await;
        raft.ping(rpc).await.map_err(|e| anyhow!(e.to_string()))
    }
}

/// Build a `Config` rooted at a fresh temp directory per test process.
pub fn build_test_config(cluster_name: &str) -> Arc<Config> {
    let dir = tempfile::tempdir().expect("tempdir").into_path();
    Arc::new(Config::build(cluster_name, dir).expect("valid test config"))
}
