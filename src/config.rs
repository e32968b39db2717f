//! Runtime configuration for a raft group.

use rand::thread_rng;
use rand::Rng;
use thiserror::Error;

/// Default segment file size: 64 MiB. Must remain a power of two — the
/// appender derives a log position's owning segment via `p & !(S - 1)`.
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Bytes reserved at the start of every segment file for magic/version; no
/// item is ever written inside this region.
pub const DEFAULT_SEGMENT_HEADER_BYTES: u32 = 4096;

/// The snapshot policy governing when a log-compaction job is triggered.
#[derive(Clone, Debug)]
pub enum SnapshotPolicy {
    /// Trigger a new snapshot once this many logs have been applied since
    /// the last one.
    LogsSinceLast(u64),
    /// Never trigger snapshots automatically; the application must call the
    /// admin API directly.
    Disabled,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        SnapshotPolicy::LogsSinceLast(5000)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("segment_size_bytes must be a power of two, got {0}")]
    SegmentSizeNotPowerOfTwo(u64),
    #[error("segment_size_bytes must be greater than segment_header_bytes")]
    SegmentTooSmall,
    #[error("election_timeout_min_ms must be < election_timeout_max_ms")]
    BadElectionTimeoutRange,
    #[error("io_retry_backoff_ms must not be empty unless io_retry_forever is false and retries are disabled")]
    EmptyBackoffVector,
}

/// Runtime configuration for a raft group's fiber runtime, log store and
/// election timing.
///
/// Construct via [`Config::build`] rather than by field literal, so that
/// invariants (segment size a power of two, sane election timeout range) are
/// validated once at startup rather than deep inside the appender.
#[derive(Clone, Debug)]
pub struct Config {
    /// Human-readable name for this cluster, used only in log lines.
    pub cluster_name: String,

    /// Directory under which `log/`, `idx/` and `status` live.
    pub data_dir: std::path::PathBuf,

    /// Fixed size of every log segment file. Must be a power of two.
    pub segment_size_bytes: u64,
    /// Bytes reserved at the head of every segment for magic/version.
    pub segment_header_bytes: u32,

    /// Lower bound, inclusive, of the randomized election timeout.
    pub election_timeout_min_ms: u64,
    /// Upper bound, exclusive, of the randomized election timeout.
    pub election_timeout_max_ms: u64,
    /// Interval between leader heartbeats (AppendEntries with no entries).
    pub heartbeat_interval_ms: u64,
    /// Interval between member-manager raft-pings.
    pub ping_interval_ms: u64,

    /// Maximum number of log entries the apply manager batch-loads from the
    /// store in a single pass on the follower/restart path.
    pub max_apply_batch_entries: usize,
    /// Maximum cumulative byte size of a single apply-manager batch load.
    pub max_apply_batch_bytes: usize,
    /// Maximum number of entries packed into one AppendEntries RPC.
    pub max_append_batch_entries: usize,
    /// Number of entries a follower may lag the leader's last log index by
    /// before its replication stream is considered lagging rather than
    /// line-rate, switching from per-entry pushes to bulk catch-up reads.
    pub replication_lag_threshold: u64,

    /// Backoff, in milliseconds, applied between retries of a failed
    /// segment write or fsync. The last element repeats once exhausted.
    pub io_retry_backoff_ms: Vec<u64>,
    /// When true, I/O retries never give up (retry forever); when false,
    /// exhausting `io_retry_backoff_ms` raises an `io-fatal` error.
    pub io_retry_forever: bool,

    /// Snapshot / log-compaction policy.
    pub snapshot_policy: SnapshotPolicy,

    /// How long a leader waits for a follower to acknowledge one chunk of an
    /// InstallSnapshot RPC before treating the follower as unresponsive.
    pub install_snapshot_timeout_ms: u64,
    /// Maximum number of bytes packed into one InstallSnapshot chunk.
    pub snapshot_chunk_bytes: usize,

    /// Number of dispatcher threads in the shared pool backing every raft
    /// group's fiber runtime on this node.
    pub dispatcher_pool_size: usize,
}

impl Config {
    /// Validate and build a [`Config`]. Mirrors the teacher crate's
    /// emphasis on failing fast at startup rather than deep in the log
    /// appender.
    pub fn build(cluster_name: impl Into<String>, data_dir: impl Into<std::path::PathBuf>) -> Result<Self, ConfigError> {
        let this = Self {
            cluster_name: cluster_name.into(),
            data_dir: data_dir.into(),
            segment_size_bytes: DEFAULT_SEGMENT_SIZE,
            segment_header_bytes: DEFAULT_SEGMENT_HEADER_BYTES,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            ping_interval_ms: 1000,
            max_apply_batch_entries: 100,
            max_apply_batch_bytes: 16 * 1024 * 1024,
            max_append_batch_entries: 300,
            replication_lag_threshold: 1000,
            io_retry_backoff_ms: vec![10, 50, 200, 1000],
            io_retry_forever: true,
            snapshot_policy: SnapshotPolicy::default(),
            install_snapshot_timeout_ms: 10_000,
            snapshot_chunk_bytes: 4 * 1024 * 1024,
            dispatcher_pool_size: num_cpus(),
        };
        this.validate()?;
        Ok(this)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.segment_size_bytes.is_power_of_two() {
            return Err(ConfigError::SegmentSizeNotPowerOfTwo(self.segment_size_bytes));
        }
        if self.segment_size_bytes <= self.segment_header_bytes as u64 {
            return Err(ConfigError::SegmentTooSmall);
        }
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err(ConfigError::BadElectionTimeoutRange);
        }
        if self.io_retry_backoff_ms.is_empty() {
            return Err(ConfigError::EmptyBackoffVector);
        }
        Ok(())
    }

    /// Generate a new randomized election timeout within the configured
    /// `[min, max)` range, per §4.3: `INTERVAL = 150 + rand[0,150)`.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min_ms..self.election_timeout_max_ms)
    }

    /// The byte position of the start of the segment owning byte position `p`.
    pub fn segment_start(&self, p: u64) -> u64 {
        p & !(self.segment_size_bytes - 1)
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4).min(8).max(1)
}
