//! The durable log store (§4.2): segmented, CRC-framed append-only files,
//! an index mapping `index -> file position`, and a status file for
//! `(currentTerm, votedFor)`. This is the crate-owned "hard core" subsystem
//! — unlike the teacher crate's fully pluggable `RaftStorage`, applications
//! do not supply their own log implementation; they only supply a
//! [`crate::storage::StateMachine`] (see `src/storage.rs` and DESIGN.md).

pub mod index;
pub mod restore;
pub mod segment;
pub mod status_file;

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::AsyncWriteExt;

use crate::config::Config;
use crate::error::StoreError;
use crate::fiber::Condition;
use crate::store::index::IndexStore;
use crate::store::segment::LogItem;
use crate::store::segment::Segment;
use crate::store::status_file::StatusFile;
use crate::store::status_file::VoteStatus;

/// The append pipeline's durable state: everything needed to resume writing
/// right where the last successful `fsync` left off.
struct AppendCursor {
    /// Absolute byte position the next item will be written at.
    next_pos: u64,
    last_index: Option<u64>,
    last_term: Option<u32>,
}

/// One raft group's durable log: segment files on disk, the index, and the
/// status file, plus the condition variables the append/fsync pipeline
/// wakes on (§4.2's `needAppendCondition`/`needFsyncCondition`).
pub struct LogStore {
    log_dir: PathBuf,
    segment_size: u64,
    header_bytes: u64,
    io_retry_backoff: Vec<Duration>,
    io_retry_forever: bool,

    index: IndexStore,
    status: StatusFile,
    cursor: AppendCursor,

    /// Signaled whenever a write becomes durable; the replication/apply
    /// layers wait on this to learn `last_log_index` advanced.
    pub need_fsync_condition: Condition,
}

impl LogStore {
    /// Open (creating if absent) the on-disk store rooted at
    /// `config.data_dir`, running the crash-recovery Restorer first.
    #[tracing::instrument(level = "info", skip(config))]
    pub async fn open(config: &Config) -> Result<Self, StoreError> {
        let log_dir = config.data_dir.join("log");
        let idx_dir = config.data_dir.join("idx");
        tokio::fs::create_dir_all(&log_dir).await.map_err(StoreError::IoRetryable)?;
        tokio::fs::create_dir_all(&idx_dir).await.map_err(StoreError::IoRetryable)?;

        let status = StatusFile::open(&config.data_dir).await?;
        let index = IndexStore::open(&idx_dir).await?;

        // The restorer re-validates the last index the index store already
        // knows about (the persisted "commitIndexPos" of §4.2), then walks
        // forward from there; an empty index store has no constraint on
        // the very first item's index.
        let expect_first_index = index.last_index();
        let from_pos = index.last_index().and_then(|i| index.position_of(i)).unwrap_or(0);
        let result = restore::restore(&log_dir, config.segment_header_bytes as u64, config.segment_size_bytes, from_pos, expect_first_index).await?;

        let mut index = index;
        for (i, pos) in &result.index_entries {
            if index.position_of(*i).is_none() {
                index.append(*i, *pos).await?;
            }
        }
        // If the restorer stopped short of re-validating even the
        // previously-known last index (a corruption reaching further back
        // than expected), drop the now-unconfirmed tail of the index too.
        let confirmed_cut = result.last_item.as_ref().map(|i| i.index + 1).or(expect_first_index).unwrap_or(1);
        index.truncate_from(confirmed_cut).await?;

        let cursor = AppendCursor {
            next_pos: if result.resume_pos == 0 { config.segment_header_bytes as u64 } else { result.resume_pos },
            last_index: result.last_item.as_ref().map(|i| i.index),
            last_term: result.last_item.as_ref().map(|i| i.term),
        };

        tracing::info!(
            last_index = ?cursor.last_index,
            last_term = ?cursor.last_term,
            resume_pos = cursor.next_pos,
            "log store restored"
        );

        Ok(Self {
            log_dir,
            segment_size: config.segment_size_bytes,
            header_bytes: config.segment_header_bytes as u64,
            io_retry_backoff: config.io_retry_backoff_ms.iter().map(|ms| Duration::from_millis(*ms)).collect(),
            io_retry_forever: config.io_retry_forever,
            index,
            status,
            cursor,
            need_fsync_condition: Condition::new(),
        })
    }

    pub fn last_log_index(&self) -> Option<u64> {
        self.cursor.last_index
    }

    pub fn last_log_term(&self) -> Option<u32> {
        self.cursor.last_term
    }

    pub fn vote_status(&self) -> &VoteStatus {
        self.status.current()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn persist_vote(&mut self, status: VoteStatus) -> Result<(), StoreError> {
        self.status.persist(status).await
    }

    /// Append a single item, durably: pick/create the owning segment,
    /// encode the frame, write it, `fsync`, then record its position in the
    /// index (§4.2 steps 1-5, collapsed into one synchronous pipeline — see
    /// DESIGN.md for why this crate does not split the append/fsync stages
    /// across two cooperating fibers the way the design note sketches).
    ///
    /// Retries transient I/O failures per `io_retry_backoff_ms`; an
    /// unrecoverable failure surfaces as `StoreError::IoFatal`, which the
    /// caller's fiber group must treat as fatal (§4.2 "Retry").
    #[tracing::instrument(level = "debug", skip(self, item))]
    pub async fn append(&mut self, item: LogItem) -> Result<u64, StoreError> {
        if let Some(last) = self.cursor.last_index {
            if item.index != last + 1 {
                return Err(StoreError::NonContiguousWrite { expected: last + 1, got: item.index });
            }
        }

        let encoded = item.encode();
        let start_segment = self.segment_size_floor(self.cursor.next_pos);
        let remaining_in_segment = start_segment + self.segment_size - self.cursor.next_pos;

        // Items never span segments (§4.2 step 2). Segment files are
        // preallocated to their full fixed size and start out zero-filled,
        // so whatever tail space is left unused already reads back as the
        // end-of-data sentinel (§4.2 step 3) without this store writing
        // anything into it explicitly; rolling the cursor forward is enough.
        if (encoded.len() as u64) > remaining_in_segment {
            self.cursor.next_pos = start_segment + self.segment_size;
        }

        let write_pos = self.cursor.next_pos;
        self.write_with_retry(write_pos, &encoded).await?;

        let mut segment = Segment::new(&self.log_dir, self.segment_size_floor(write_pos), self.segment_size);
        segment.observe_first_item(&item);
        let _ = segment; // metadata currently only used for the file-name mapping above

        self.index.append(item.index, write_pos).await?;

        self.cursor.next_pos = write_pos + encoded.len() as u64;
        self.cursor.last_index = Some(item.index);
        self.cursor.last_term = Some(item.term);

        self.need_fsync_condition.signal_all();
        Ok(write_pos)
    }

    /// Truncate the log (and its index) so that `index` and everything
    /// after it is discarded — used when a follower's log conflicts with
    /// its leader's and must roll back before accepting new entries.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn truncate_from(&mut self, index: u64) -> Result<(), StoreError> {
        let pos = self.index.position_of(index);
        self.index.truncate_from(index).await?;
        if let Some(pos) = pos {
            let start = self.segment_size_floor(pos);
            let path = Segment::path_for(&self.log_dir, start);
            let file = tokio::fs::OpenOptions::new().write(true).open(&path).await.map_err(StoreError::IoRetryable)?;
            file.set_len(pos - start).await.map_err(StoreError::IoFatal)?;
            file.sync_all().await.map_err(StoreError::IoFatal)?;
            self.cursor.next_pos = pos;
        }
        let prior = self.index.last_index().and_then(|i| self.index.position_of(i));
        self.cursor.last_index = self.index.last_index();
        if let Some(prior_pos) = prior {
            let item = restore::read_item_at(&self.log_dir, self.segment_size, prior_pos).await?;
            self.cursor.last_term = Some(item.term);
        } else {
            self.cursor.last_term = None;
        }
        Ok(())
    }

    /// Read back a single entry by `index`.
    pub async fn read_at(&self, index: u64) -> Result<LogItem, StoreError> {
        let pos = self.index.position_of(index).ok_or_else(|| StoreError::Corrupt(format!("no index entry for {}", index)))?;
        restore::read_item_at(&self.log_dir, self.segment_size, pos).await
    }

    fn segment_size_floor(&self, pos: u64) -> u64 {
        pos & !(self.segment_size - 1)
    }

    async fn write_with_retry(&self, pos: u64, bytes: &[u8]) -> Result<(), StoreError> {
        let start = self.segment_size_floor(pos);
        let path = Segment::path_for(&self.log_dir, start);

        let mut attempt = 0usize;
        loop {
            match self.write_once(&path, pos - start, bytes).await {
                Ok(()) => return Ok(()),
                Err(StoreError::IoRetryable(e)) => {
                    if !self.io_retry_forever && attempt >= self.io_retry_backoff.len() {
                        return Err(StoreError::IoFatal(e));
                    }
                    let delay = self.io_retry_backoff[attempt.min(self.io_retry_backoff.len() - 1)];
                    tracing::warn!(error = %e, attempt, "retrying log write after io error");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn write_once(&self, path: &Path, offset_in_file: u64, bytes: &[u8]) -> Result<(), StoreError> {
        use tokio::io::AsyncSeekExt;

        let needs_header = !tokio::fs::try_exists(path).await.map_err(StoreError::IoRetryable)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .await
            .map_err(StoreError::IoRetryable)?;
        if needs_header {
            file.set_len(self.segment_size).await.map_err(StoreError::IoRetryable)?;
        }
        file.seek(std::io::SeekFrom::Start(offset_in_file)).await.map_err(StoreError::IoRetryable)?;
        file.write_all(bytes).await.map_err(StoreError::IoRetryable)?;
        file.sync_all().await.map_err(StoreError::IoFatal)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::segment::EntryType;

    fn test_config(dir: &Path) -> Config {
        let mut c = Config::build("test-cluster", dir).unwrap();
        c.segment_size_bytes = 1 << 16; // small segments to exercise rollover in tests
        c.segment_header_bytes = 64;
        c
    }

    fn item(index: u64, term: u32, prev_log_term: u32, body: &[u8]) -> LogItem {
        LogItem {
            index,
            term,
            prev_log_term,
            entry_type: EntryType::Normal,
            biz_type: 1,
            timestamp_ms: 0,
            header: LogItem::pack_header(1, 0, &[]),
            body: body.to_vec(),
        }
    }

    #[tokio::test]
    async fn append_read_and_reopen_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut store = LogStore::open(&config).await.unwrap();

        store.append(item(1, 1, 0, b"alpha")).await.unwrap();
        store.append(item(2, 1, 1, b"beta")).await.unwrap();
        store.append(item(3, 2, 1, b"gamma")).await.unwrap();

        assert_eq!(store.last_log_index(), Some(3));
        let read_back = store.read_at(2).await.unwrap();
        assert_eq!(read_back.body, b"beta");

        drop(store);
        let reopened = LogStore::open(&config).await.unwrap();
        assert_eq!(reopened.last_log_index(), Some(3));
        assert_eq!(reopened.last_log_term(), Some(2));
    }

    #[tokio::test]
    async fn truncate_from_rolls_back_conflicting_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut store = LogStore::open(&config).await.unwrap();

        store.append(item(1, 1, 0, b"a")).await.unwrap();
        store.append(item(2, 1, 1, b"b")).await.unwrap();
        store.append(item(3, 1, 1, b"c")).await.unwrap();
        store.truncate_from(2).await.unwrap();

        assert_eq!(store.last_log_index(), Some(1));
        assert_eq!(store.last_log_term(), Some(1));

        store.append(item(2, 2, 1, b"b-reproposed")).await.unwrap();
        assert_eq!(store.last_log_index(), Some(2));
        assert_eq!(store.read_at(2).await.unwrap().body, b"b-reproposed");
    }

    #[tokio::test]
    async fn rejects_non_contiguous_append() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut store = LogStore::open(&config).await.unwrap();
        store.append(item(1, 1, 0, b"a")).await.unwrap();
        let err = store.append(item(3, 1, 1, b"c")).await.unwrap_err();
        assert!(matches!(err, StoreError::NonContiguousWrite { expected: 2, got: 3 }));
    }
}
