//! The durable status file: a single 512-byte CRC-protected record holding
//! `(currentTerm, votedFor)` (§6). Rewritten wholesale on every vote or term
//! change rather than appended to — it is tiny and a torn partial write is
//! easy to detect, so there is no need for the log's segment/CRC-framing
//! machinery here.
//!
//! On-disk layout, exactly 512 bytes:
//!
//! ```text
//! <8 hex crc digits>\r\n
//! currentTerm=<u64>\n
//! votedFor=<node id or "none">\n
//! <space padding out to 512 bytes>
//! ```
//!
//! The CRC covers bytes `[10..512)` — everything after the `\r\n` that
//! terminates the CRC line itself.

use std::path::Path;
use std::path::PathBuf;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;
use tokio::io::AsyncWriteExt;

use crate::error::StoreError;
use crate::NodeId;

pub const STATUS_FILE_LEN: usize = 512;
const CRC_LINE_LEN: usize = 10; // 8 hex digits + "\r\n"

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct VoteStatus {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

impl VoteStatus {
    fn encode(&self) -> [u8; STATUS_FILE_LEN] {
        let voted_for = match self.voted_for {
            Some(id) => id.to_string(),
            None => "none".to_string(),
        };
        let body = format!("currentTerm={}\nvotedFor={}\n", self.current_term, voted_for);
        if CRC_LINE_LEN + body.len() > STATUS_FILE_LEN {
            panic!("status file body overflowed 512 bytes: {} bytes", body.len());
        }
        let crc = crc32c::crc32c(body.as_bytes());

        let mut buf = [b' '; STATUS_FILE_LEN];
        let header = format!("{:08x}\r\n", crc);
        buf[..CRC_LINE_LEN].copy_from_slice(header.as_bytes());
        buf[CRC_LINE_LEN..CRC_LINE_LEN + body.len()].copy_from_slice(body.as_bytes());
        buf
    }

    fn decode(buf: &[u8; STATUS_FILE_LEN]) -> Result<Self, StoreError> {
        let header = std::str::from_utf8(&buf[..CRC_LINE_LEN])
            .map_err(|e| StoreError::BadStatusFile(format!("header not utf8: {}", e)))?;
        if !header.ends_with("\r\n") {
            return Err(StoreError::BadStatusFile("missing CRLF after crc field".into()));
        }
        let stored_crc = u32::from_str_radix(&header[..8], 16)
            .map_err(|e| StoreError::BadStatusFile(format!("bad crc hex: {}", e)))?;

        let rest = &buf[CRC_LINE_LEN..];
        let computed_crc = crc32c::crc32c(rest);
        if computed_crc != stored_crc {
            return Err(StoreError::BadStatusFile("crc mismatch".into()));
        }

        let text = std::str::from_utf8(rest).map_err(|e| StoreError::BadStatusFile(format!("body not utf8: {}", e)))?;
        let text = text.trim_end_matches(' ');

        let mut current_term = None;
        let mut voted_for = None;
        for line in text.lines() {
            if let Some(v) = line.strip_prefix("currentTerm=") {
                current_term =
                    Some(v.parse::<u64>().map_err(|e| StoreError::BadStatusFile(format!("bad currentTerm: {}", e)))?);
            } else if let Some(v) = line.strip_prefix("votedFor=") {
                voted_for = Some(if v == "none" {
                    None
                } else {
                    Some(v.parse::<NodeId>().map_err(|e| StoreError::BadStatusFile(format!("bad votedFor: {}", e)))?)
                });
            }
        }
        let current_term = current_term.ok_or_else(|| StoreError::BadStatusFile("missing currentTerm".into()))?;
        let voted_for = voted_for.ok_or_else(|| StoreError::BadStatusFile("missing votedFor".into()))?;
        Ok(VoteStatus { current_term, voted_for })
    }
}

/// The status file handle for one raft group. Each write is a full
/// 512-byte overwrite at offset 0 followed by an `fsync`, so a crash mid
/// write leaves either the old or the new record intact (never a mix) as
/// long as the underlying filesystem honors single-block writes, and is
/// otherwise caught by the CRC on the next read.
pub struct StatusFile {
    path: PathBuf,
    current: VoteStatus,
}

impl StatusFile {
    /// Open (or create, defaulted to term 0 / no vote) the status file for a
    /// group rooted at `dir` (typically `<data_dir>/<group_id>/status`).
    pub async fn open(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join("status");
        if !tokio::fs::try_exists(&path).await.map_err(StoreError::IoRetryable)? {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .await
                .map_err(StoreError::IoRetryable)?;
            let initial = VoteStatus::default();
            file.write_all(&initial.encode()).await.map_err(StoreError::IoRetryable)?;
            file.sync_all().await.map_err(StoreError::IoFatal)?;
            return Ok(Self { path, current: initial });
        }

        let mut file = tokio::fs::File::open(&path).await.map_err(StoreError::IoRetryable)?;
        let mut buf = [0u8; STATUS_FILE_LEN];
        let n = file.read(&mut buf).await.map_err(StoreError::IoRetryable)?;
        if n != STATUS_FILE_LEN {
            return Err(StoreError::BadStatusFile(format!("short read: {} of {} bytes", n, STATUS_FILE_LEN)));
        }
        let current = VoteStatus::decode(&buf)?;
        Ok(Self { path, current })
    }

    pub fn current(&self) -> &VoteStatus {
        &self.current
    }

    /// Persist a new `(currentTerm, votedFor)` pair, overwriting the whole
    /// file and fsyncing before returning. Per §4.3, this must complete
    /// before a vote response or a term bump is observable to the rest of
    /// the cluster.
    pub async fn persist(&mut self, status: VoteStatus) -> Result<(), StoreError> {
        let encoded = status.encode();
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(StoreError::IoRetryable)?;
        file.seek(std::io::SeekFrom::Start(0)).await.map_err(StoreError::IoRetryable)?;
        file.write_all(&encoded).await.map_err(StoreError::IoRetryable)?;
        file.sync_all().await.map_err(StoreError::IoFatal)?;
        self.current = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persists_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let mut sf = StatusFile::open(dir.path()).await.unwrap();
        assert_eq!(sf.current().current_term, 0);
        assert_eq!(sf.current().voted_for, None);

        sf.persist(VoteStatus { current_term: 7, voted_for: Some(3) }).await.unwrap();

        let reopened = StatusFile::open(dir.path()).await.unwrap();
        assert_eq!(reopened.current().current_term, 7);
        assert_eq!(reopened.current().voted_for, Some(3));
    }

    #[tokio::test]
    async fn detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let mut sf = StatusFile::open(dir.path()).await.unwrap();
        sf.persist(VoteStatus { current_term: 1, voted_for: None }).await.unwrap();

        let path = dir.path().join("status");
        let mut bytes = tokio::fs::read(&path).await.unwrap();
        bytes[20] ^= 0xFF; // corrupt a byte inside the CRC-covered body
        tokio::fs::write(&path, &bytes).await.unwrap();

        let err = StatusFile::open(dir.path()).await.unwrap_err();
        assert!(matches!(err, StoreError::BadStatusFile(_)));
    }
}
