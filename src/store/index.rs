//! The index store: a fixed-record-size mapping from log `index` to the
//! absolute byte position of that entry's frame inside the log segments.
//! Kept as its own small append-only file, with the same "checksum every
//! record, stop at the first bad one" discipline as the log itself (§3: "a
//! separate indexed store maps index -> file position with the same
//! CRC/segmenting discipline"), just without segment rotation since each
//! record is tiny and fixed-width.
//!
//! Record layout, 20 bytes:
//! ```text
//! index(8) | position(8) | crc32c(4)
//! ```

use std::collections::BTreeMap;
use std::convert::TryInto;
use std::path::Path;
use std::path::PathBuf;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;

use crate::error::StoreError;

const RECORD_LEN: usize = 8 + 8 + 4;

fn encode_record(index: u64, position: u64) -> [u8; RECORD_LEN] {
    let mut buf = [0u8; RECORD_LEN];
    buf[0..8].copy_from_slice(&index.to_le_bytes());
    buf[8..16].copy_from_slice(&position.to_le_bytes());
    let crc = crc32c::crc32c(&buf[0..16]);
    buf[16..20].copy_from_slice(&crc.to_le_bytes());
    buf
}

fn decode_record(buf: &[u8; RECORD_LEN]) -> Result<(u64, u64), StoreError> {
    let crc = u32::from_le_bytes(buf[16..20].try_into().unwrap());
    if crc32c::crc32c(&buf[0..16]) != crc {
        return Err(StoreError::Corrupt("index record crc mismatch".into()));
    }
    let index = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let position = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    Ok((index, position))
}

/// The in-memory index, backed by an append-only on-disk log of records.
pub struct IndexStore {
    path: PathBuf,
    file: tokio::fs::File,
    map: BTreeMap<u64, u64>,
}

impl IndexStore {
    /// Open (creating if absent) the index file under `dir`, replaying any
    /// well-formed records already present. A torn trailing record (from a
    /// crash mid-append) is silently dropped, exactly like a torn log item —
    /// the restorer will re-derive it from the log itself.
    pub async fn open(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join("index");
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await
            .map_err(StoreError::IoRetryable)?;

        let mut bytes = Vec::new();
        {
            let mut reader = tokio::fs::File::open(&path).await.map_err(StoreError::IoRetryable)?;
            reader.read_to_end(&mut bytes).await.map_err(StoreError::IoRetryable)?;
        }

        let mut map = BTreeMap::new();
        let mut good_len = 0usize;
        for chunk in bytes.chunks(RECORD_LEN) {
            if chunk.len() != RECORD_LEN {
                break;
            }
            let record: [u8; RECORD_LEN] = chunk.try_into().unwrap();
            match decode_record(&record) {
                Ok((index, position)) => {
                    map.insert(index, position);
                    good_len += RECORD_LEN;
                }
                Err(_) => break,
            }
        }
        if good_len < bytes.len() {
            // Truncate away the torn tail so future appends start clean.
            file.set_len(good_len as u64).await.map_err(StoreError::IoFatal)?;
        }

        Ok(Self { path, file, map })
    }

    pub fn position_of(&self, index: u64) -> Option<u64> {
        self.map.get(&index).copied()
    }

    pub fn last_index(&self) -> Option<u64> {
        self.map.keys().next_back().copied()
    }

    /// Append a new `(index, position)` pair, durably.
    pub async fn append(&mut self, index: u64, position: u64) -> Result<(), StoreError> {
        let record = encode_record(index, position);
        self.file.write_all(&record).await.map_err(StoreError::IoRetryable)?;
        self.file.sync_all().await.map_err(StoreError::IoFatal)?;
        self.map.insert(index, position);
        Ok(())
    }

    /// Drop every mapping for `index >= from`, used when the log truncates a
    /// conflicting suffix (§4.2's "index-file truncation mirrors the log's").
    pub async fn truncate_from(&mut self, from: u64) -> Result<(), StoreError> {
        let keep = self.map.range(..from).count();
        self.map.split_off(&from);
        self.file.set_len((keep * RECORD_LEN) as u64).await.map_err(StoreError::IoFatal)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let mut idx = IndexStore::open(dir.path()).await.unwrap();
        idx.append(1, 0).await.unwrap();
        idx.append(2, 128).await.unwrap();
        idx.append(3, 300).await.unwrap();
        assert_eq!(idx.position_of(2), Some(128));
        assert_eq!(idx.last_index(), Some(3));

        let reopened = IndexStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.position_of(3), Some(300));
    }

    #[tokio::test]
    async fn drops_torn_trailing_record() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut idx = IndexStore::open(dir.path()).await.unwrap();
            idx.append(1, 0).await.unwrap();
            idx.append(2, 50).await.unwrap();
        }
        // Corrupt the tail of the file to simulate a torn last record.
        let path = dir.path().join("index");
        let mut bytes = tokio::fs::read(&path).await.unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        tokio::fs::write(&path, &bytes).await.unwrap();

        let idx = IndexStore::open(dir.path()).await.unwrap();
        assert_eq!(idx.position_of(1), Some(0));
        assert_eq!(idx.position_of(2), None);
    }

    #[tokio::test]
    async fn truncate_from_drops_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let mut idx = IndexStore::open(dir.path()).await.unwrap();
        idx.append(1, 0).await.unwrap();
        idx.append(2, 50).await.unwrap();
        idx.append(3, 100).await.unwrap();
        idx.truncate_from(2).await.unwrap();
        assert_eq!(idx.position_of(1), Some(0));
        assert_eq!(idx.position_of(2), None);
        assert_eq!(idx.last_index(), Some(1));
    }
}
