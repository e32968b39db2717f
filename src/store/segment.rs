//! On-disk item framing and segment files (§3, §4.2).
//!
//! ```text
//! crc32c(4) | totalLen(4) | headLen(2) | type(1) | _(1) |
//! term(4) | prevLogTerm(4) | index(8) |
//! [header bytes] | [header-crc(4)] |
//! [body bytes]   | [body-crc(4)]
//! ```
//!
//! `crc32c` covers the 24 bytes of fixed fields following itself
//! (`totalLen..index`). The header and body each carry their own trailing
//! CRC so that a torn write is detected per-section rather than only at the
//! granularity of the whole item.

use std::convert::TryInto;
use std::path::Path;
use std::path::PathBuf;

use crate::error::StoreError;

/// Bytes consumed by the fixed-width portion of every item frame, before
/// the variable-length header/body sections.
pub const FRAME_FIXED_LEN: usize = 4 + 4 + 2 + 1 + 1 + 4 + 4 + 8;

/// The kind of log entry, per §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum EntryType {
    Normal = 0,
    NoOp = 1,
    ConfigChange = 2,
}

impl EntryType {
    fn from_u8(b: u8) -> Result<Self, StoreError> {
        match b {
            0 => Ok(EntryType::Normal),
            1 => Ok(EntryType::NoOp),
            2 => Ok(EntryType::ConfigChange),
            other => Err(StoreError::Corrupt(format!("unknown entry type byte {}", other))),
        }
    }
}

/// One Raft log entry, in memory, with its precomputed on-disk sizes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogItem {
    pub index: u64,
    pub term: u32,
    pub prev_log_term: u32,
    pub entry_type: EntryType,
    pub biz_type: u16,
    pub timestamp_ms: u64,
    pub header: Vec<u8>,
    pub body: Vec<u8>,
}

impl LogItem {
    /// Total on-disk size of this item's frame, including the fixed prefix
    /// and both trailing CRCs.
    pub fn encoded_len(&self) -> usize {
        FRAME_FIXED_LEN + self.header.len() + 4 + self.body.len() + 4
    }

    pub fn encode(&self) -> Vec<u8> {
        let head_len: u16 = self.header.len().try_into().expect("header too large");
        let total_len: u32 =
            (self.header.len() + 4 + self.body.len() + 4).try_into().expect("item too large");

        let mut buf = Vec::with_capacity(self.encoded_len());
        // crc32c placeholder, filled in below.
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&total_len.to_le_bytes());
        buf.extend_from_slice(&head_len.to_le_bytes());
        buf.push(self.entry_type as u8);
        buf.push(0); // reserved
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf.extend_from_slice(&self.prev_log_term.to_le_bytes());
        buf.extend_from_slice(&self.index.to_le_bytes());

        let header_crc = crc32c::crc32c(&self.header);
        buf.extend_from_slice(&self.header);
        buf.extend_from_slice(&header_crc.to_le_bytes());

        let body_crc = crc32c::crc32c(&self.body);
        buf.extend_from_slice(&self.body);
        buf.extend_from_slice(&body_crc.to_le_bytes());

        let head_crc = crc32c::crc32c(&buf[4..FRAME_FIXED_LEN]);
        buf[0..4].copy_from_slice(&head_crc.to_le_bytes());

        // biz_type and timestamp are carried inside the header bytes by
        // convention of the encoder that builds `header` from a typed
        // request; they are not part of the fixed frame.
        buf
    }

    /// Write this item's `biz_type`/`timestamp_ms` into a header buffer the
    /// caller then passes in through `header`. Kept as a free helper so
    /// callers can build `header` once and reuse `encode`/`decode`
    /// symmetrically.
    pub fn pack_header(biz_type: u16, timestamp_ms: u64, extra: &[u8]) -> Vec<u8> {
        let mut h = Vec::with_capacity(2 + 8 + extra.len());
        h.extend_from_slice(&biz_type.to_le_bytes());
        h.extend_from_slice(&timestamp_ms.to_le_bytes());
        h.extend_from_slice(extra);
        h
    }

    pub fn unpack_header(header: &[u8]) -> Result<(u16, u64, &[u8]), StoreError> {
        if header.len() < 10 {
            return Err(StoreError::Corrupt("header shorter than biz_type+timestamp prefix".into()));
        }
        let biz_type = u16::from_le_bytes(header[0..2].try_into().unwrap());
        let timestamp_ms = u64::from_le_bytes(header[2..10].try_into().unwrap());
        Ok((biz_type, timestamp_ms, &header[10..]))
    }
}

/// Outcome of attempting to decode one frame at a given offset.
pub enum DecodeOutcome {
    /// A fully valid item, plus the number of bytes its frame occupied.
    Item(LogItem, usize),
    /// An all-zero header: the clean end-of-data sentinel (§4.2 step 3).
    EndOfData,
    /// Not enough bytes remain in the buffer to even read a fixed header;
    /// the caller should treat this as end-of-segment.
    Truncated,
}

/// Decode one item frame starting at `buf[0]`. Never panics on malformed
/// input; CRC/length problems surface as `Err(StoreError::Corrupt)` so the
/// restorer can stop exactly before the bad frame, per the CRC-tear-detection
/// testable property in §8.
pub fn decode_item(buf: &[u8]) -> Result<DecodeOutcome, StoreError> {
    if buf.len() < FRAME_FIXED_LEN {
        return Ok(DecodeOutcome::Truncated);
    }
    let stored_crc = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    // Fixed fields occupy: crc(0..4) totalLen(4..8) headLen(8..10) type(10)
    // pad(11) term(12..16) prevLogTerm(16..20) index(20..28).
    let prev_log_term = u32::from_le_bytes(buf[16..20].try_into().unwrap());
    if stored_crc == 0 && prev_log_term == 0 && buf[4..FRAME_FIXED_LEN].iter().all(|b| *b == 0) {
        return Ok(DecodeOutcome::EndOfData);
    }

    let computed_crc = crc32c::crc32c(&buf[4..FRAME_FIXED_LEN]);
    if computed_crc != stored_crc {
        return Err(StoreError::Corrupt("frame header crc mismatch".into()));
    }

    let total_len = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
    let head_len = u16::from_le_bytes(buf[8..10].try_into().unwrap()) as usize;
    let entry_type = EntryType::from_u8(buf[10])?;
    let term = u32::from_le_bytes(buf[12..16].try_into().unwrap());
    let index = u64::from_le_bytes(buf[20..28].try_into().unwrap());

    if head_len == 0 || total_len < head_len + 8 {
        return Err(StoreError::Corrupt("totalLen too small for headLen plus both section crcs".into()));
    }
    if term == 0 {
        return Err(StoreError::Corrupt("term must be > 0".into()));
    }

    let frame_len = FRAME_FIXED_LEN + total_len;
    if buf.len() < frame_len {
        return Ok(DecodeOutcome::Truncated);
    }

    let header_start = FRAME_FIXED_LEN;
    let header_end = header_start + head_len;
    let header = &buf[header_start..header_end];
    let header_crc_stored = u32::from_le_bytes(buf[header_end..header_end + 4].try_into().unwrap());
    if crc32c::crc32c(header) != header_crc_stored {
        return Err(StoreError::Corrupt("header section crc mismatch".into()));
    }

    let body_start = header_end + 4;
    let body_len = total_len - head_len - 4 - 4;
    let body_end = body_start + body_len;
    let body = &buf[body_start..body_end];
    let body_crc_stored = u32::from_le_bytes(buf[body_end..body_end + 4].try_into().unwrap());
    if crc32c::crc32c(body) != body_crc_stored {
        return Err(StoreError::Corrupt("body section crc mismatch".into()));
    }

    let (biz_type, timestamp_ms, rest) = LogItem::unpack_header(header)?;
    let item = LogItem {
        index,
        term,
        prev_log_term,
        entry_type,
        biz_type,
        timestamp_ms,
        header: rest.to_vec(),
        body: body.to_vec(),
    };
    Ok(DecodeOutcome::Item(item, frame_len))
}

/// One fixed-size segment of the log, named by its zero-padded hex start
/// offset (§6.2: `<data_dir>/log/<16-hex-startPos>.lf`).
#[derive(Debug)]
pub struct Segment {
    pub start_pos: u64,
    pub end_pos: u64,
    pub path: PathBuf,
    pub first_index: Option<u64>,
    pub first_term: Option<u32>,
    pub first_timestamp_ms: Option<u64>,
}

impl Segment {
    pub fn file_name(start_pos: u64) -> String {
        format!("{:016x}.lf", start_pos)
    }

    pub fn path_for(dir: &Path, start_pos: u64) -> PathBuf {
        dir.join(Self::file_name(start_pos))
    }

    pub fn new(dir: &Path, start_pos: u64, size: u64) -> Self {
        Self {
            start_pos,
            end_pos: start_pos + size,
            path: Self::path_for(dir, start_pos),
            first_index: None,
            first_term: None,
            first_timestamp_ms: None,
        }
    }

    /// Record the first item written into this segment (§3: "written
    /// lazily on first append").
    pub fn observe_first_item(&mut self, item: &LogItem) {
        if self.first_index.is_none() {
            self.first_index = Some(item.index);
            self.first_term = Some(item.term);
            self.first_timestamp_ms = Some(item.timestamp_ms);
        }
    }

    pub fn remaining(&self, pos_in_file: u64) -> u64 {
        self.end_pos.saturating_sub(self.start_pos + pos_in_file)
    }
}

/// Parse a segment's start offset back out of its 16-hex-digit file stem.
pub fn parse_start_pos(file_name: &str) -> Option<u64> {
    let stem = file_name.strip_suffix(".lf")?;
    u64::from_str_radix(stem, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item(index: u64, term: u32, prev_log_term: u32, body: &[u8]) -> LogItem {
        LogItem {
            index,
            term,
            prev_log_term,
            entry_type: EntryType::Normal,
            biz_type: 7,
            timestamp_ms: 1234,
            header: LogItem::pack_header(7, 1234, b"extra-header"),
            body: body.to_vec(),
        }
    }

    #[test]
    fn round_trip_encode_decode() {
        let item = sample_item(1, 1, 0, b"hello world");
        let encoded = item.encode();
        match decode_item(&encoded).unwrap() {
            DecodeOutcome::Item(decoded, len) => {
                assert_eq!(len, encoded.len());
                assert_eq!(decoded.index, item.index);
                assert_eq!(decoded.term, item.term);
                assert_eq!(decoded.prev_log_term, item.prev_log_term);
                assert_eq!(decoded.body, item.body);
                assert_eq!(decoded.biz_type, item.biz_type);
            }
            _ => panic!("expected a decoded item"),
        }
    }

    #[test]
    fn truncated_body_is_detected_as_corrupt_not_panic() {
        let item = sample_item(2, 3, 2, b"a reasonably long body payload");
        let encoded = item.encode();
        for k in 1..=item.body.len() {
            let truncated = &encoded[..encoded.len() - k];
            // Either Truncated (not enough bytes for the declared total_len)
            // or a detected CRC mismatch — never a false-positive decode.
            match decode_item(truncated) {
                Ok(DecodeOutcome::Item(_, _)) => panic!("must not decode a torn body as valid, k={}", k),
                Ok(DecodeOutcome::Truncated) | Err(_) => {}
                Ok(DecodeOutcome::EndOfData) => panic!("unexpected end-of-data sentinel, k={}", k),
            }
        }
    }

    #[test]
    fn all_zero_header_is_end_of_data_sentinel() {
        let zeros = vec![0u8; FRAME_FIXED_LEN];
        match decode_item(&zeros).unwrap() {
            DecodeOutcome::EndOfData => {}
            _ => panic!("expected end-of-data sentinel"),
        }
    }

    #[test]
    fn corrupt_header_crc_is_rejected() {
        let item = sample_item(5, 2, 1, b"body");
        let mut encoded = item.encode();
        // Flip a bit inside the fixed header region without updating its CRC.
        encoded[12] ^= 0xFF;
        assert!(matches!(decode_item(&encoded), Err(StoreError::Corrupt(_))));
    }
}
