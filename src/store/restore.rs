//! Crash recovery (§4.2 "Restorer"): reconstruct the last valid log state
//! from whatever is actually on disk, tolerating a torn final write.

use std::path::Path;
use std::path::PathBuf;

use tokio::io::AsyncReadExt;

use crate::error::StoreError;
use crate::store::segment::decode_item;
use crate::store::segment::parse_start_pos;
use crate::store::segment::DecodeOutcome;
use crate::store::segment::LogItem;

/// Outcome of a full restore pass: the last validated item (if any), the
/// exact byte position immediately after it (where the next append should
/// begin), and the `(index, position)` pairs needed to repopulate the index
/// store.
pub struct RestoreResult {
    pub last_item: Option<LogItem>,
    pub resume_pos: u64,
    pub index_entries: Vec<(u64, u64)>,
}

/// Scan every `*.lf` segment file under `log_dir` in start-position order,
/// starting from `from_pos` (the byte position immediately after the last
/// previously-known-good item, or 0 on a fresh store), validating the chain
/// per §4.2 steps 2-4.
///
/// `header_bytes` is the per-segment reserved header region skipped at the
/// start of every segment file.
pub async fn restore(
    log_dir: &Path,
    header_bytes: u64,
    segment_size: u64,
    from_pos: u64,
    expect_first_index: Option<u64>,
) -> Result<RestoreResult, StoreError> {
    let mut segment_paths = list_segments(log_dir).await?;
    segment_paths.sort_by_key(|(start, _)| *start);

    let mut last_item: Option<LogItem> = None;
    let mut previous_term: Option<u32> = None;
    let mut previous_index: Option<u64> = None;
    let mut index_entries = Vec::new();
    let mut resume_pos = from_pos;
    let mut stop = false;
    let mut needs_truncate = false;

    for (start_pos, path) in &segment_paths {
        if *start_pos + segment_size <= from_pos {
            continue; // entirely before the resume point
        }
        let offset_in_file = if from_pos > *start_pos { from_pos - *start_pos } else { header_bytes };
        let offset_in_file = offset_in_file.max(header_bytes);

        let bytes = tokio::fs::read(path).await.map_err(StoreError::IoRetryable)?;
        if offset_in_file as usize > bytes.len() {
            continue;
        }
        let mut cursor = offset_in_file as usize;

        loop {
            if cursor >= bytes.len() {
                break;
            }
            match decode_item(&bytes[cursor..]) {
                Ok(DecodeOutcome::Item(item, frame_len)) => {
                    if let Some(expect) = expect_first_index {
                        if last_item.is_none() && item.index != expect {
                            // First item doesn't match the expected resume
                            // point: treat everything from here as
                            // unvalidated and truncate it away.
                            stop = true;
                            needs_truncate = true;
                            break;
                        }
                    }
                    if let (Some(prev_term), Some(prev_index)) = (previous_term, previous_index) {
                        let chain_ok = item.prev_log_term == prev_term
                            && item.index == prev_index + 1
                            && item.term >= prev_term;
                        if !chain_ok {
                            stop = true;
                            needs_truncate = true;
                            break;
                        }
                    }
                    index_entries.push((item.index, *start_pos + cursor as u64));
                    previous_term = Some(item.term);
                    previous_index = Some(item.index);
                    cursor += frame_len;
                    resume_pos = *start_pos + cursor as u64;
                    last_item = Some(item);
                }
                Ok(DecodeOutcome::EndOfData) => {
                    // A clean end-of-data sentinel (§4.2 step 3): this
                    // segment's remaining space is unused zero-fill, not
                    // proof the log ends here — the appender rolls to the
                    // next segment whenever an item doesn't fit in the
                    // current one's tail (§4.2 step 2), leaving exactly
                    // this sentinel behind while later segment files still
                    // hold further valid, durable items. Stop scanning
                    // *this* file only; the outer loop continues on to
                    // whatever segment comes next.
                    break;
                }
                Ok(DecodeOutcome::Truncated) => {
                    // A torn write: not enough bytes follow to even read a
                    // fixed header. Truncate at the last validated item
                    // (§4.2 step 4).
                    stop = true;
                    needs_truncate = true;
                    break;
                }
                Err(_) => {
                    // CRC mismatch or header inconsistency: truncate at the
                    // last validated item (§4.2 step 4).
                    stop = true;
                    needs_truncate = true;
                    break;
                }
            }
        }
        if stop {
            break;
        }
    }

    if needs_truncate {
        truncate_tail(log_dir, &segment_paths, resume_pos, segment_size).await?;
    }

    Ok(RestoreResult { last_item, resume_pos, index_entries })
}

async fn list_segments(log_dir: &Path) -> Result<Vec<(u64, PathBuf)>, StoreError> {
    if !tokio::fs::try_exists(log_dir).await.map_err(StoreError::IoRetryable)? {
        tokio::fs::create_dir_all(log_dir).await.map_err(StoreError::IoRetryable)?;
        return Ok(Vec::new());
    }
    let mut entries = tokio::fs::read_dir(log_dir).await.map_err(StoreError::IoRetryable)?;
    let mut out = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(StoreError::IoRetryable)? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(start) = parse_start_pos(&name) {
            out.push((start, entry.path()));
        }
    }
    Ok(out)
}

/// Truncate the segment containing `resume_pos` to exactly that length, and
/// delete every segment whose start position is beyond it (§4.2 step 4:
/// "subsequent files are deleted").
async fn truncate_tail(log_dir: &Path, segments: &[(u64, PathBuf)], resume_pos: u64, segment_size: u64) -> Result<(), StoreError> {
    let resume_segment_start = resume_pos - (resume_pos % segment_size);
    for (start, path) in segments {
        if *start == resume_segment_start {
            let file = tokio::fs::OpenOptions::new().write(true).open(path).await.map_err(StoreError::IoRetryable)?;
            let len_in_file = resume_pos - start;
            file.set_len(len_in_file).await.map_err(StoreError::IoFatal)?;
            file.sync_all().await.map_err(StoreError::IoFatal)?;
        } else if *start > resume_segment_start {
            tokio::fs::remove_file(path).await.map_err(StoreError::IoRetryable)?;
        }
    }
    let _ = log_dir;
    Ok(())
}

/// Read a single raw frame back out of its segment file at an absolute log
/// position, used by [`super::LogStore::read_at`].
pub async fn read_item_at(log_dir: &Path, segment_size: u64, position: u64) -> Result<LogItem, StoreError> {
    use tokio::io::AsyncSeekExt;

    let start_pos = position - (position % segment_size);
    let path = crate::store::segment::Segment::path_for(log_dir, start_pos);
    let mut file = tokio::fs::File::open(&path).await.map_err(StoreError::IoRetryable)?;
    let offset = position - start_pos;
    file.seek(std::io::SeekFrom::Start(offset)).await.map_err(StoreError::IoRetryable)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await.map_err(StoreError::IoRetryable)?;
    match decode_item(&buf)? {
        DecodeOutcome::Item(item, _) => Ok(item),
        _ => Err(StoreError::Corrupt(format!("no valid item at offset {}", offset))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::segment::EntryType;

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
    async fn restores_a_clean_chain() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("log");
        tokio::fs::create_dir_all(&log_dir).await.unwrap();
        let path = crate::store::segment::Segment::path_for(&log_dir, 0);

        let mut bytes = Vec::new();
        bytes.extend(item(1, 1, 0, b"a").encode());
        bytes.extend(item(2, 1, 1, b"bb").encode());
        bytes.extend(item(3, 2, 1, b"ccc").encode());
        tokio::fs::write(&path, &bytes).await.unwrap();

        let result = restore(&log_dir, 0, 1 << 26, 0, Some(1)).await.unwrap();
        assert_eq!(result.last_item.unwrap().index, 3);
        assert_eq!(result.index_entries.len(), 3);
        assert_eq!(result.resume_pos as usize, bytes.len());
    }

    #[tokio::test]
    async fn stops_before_a_torn_final_item() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("log");
        tokio::fs::create_dir_all(&log_dir).await.unwrap();
        let path = crate::store::segment::Segment::path_for(&log_dir, 0);

        let good = item(1, 1, 0, b"a").encode();
        let torn = item(2, 1, 1, b"this body gets torn off").encode();
        let mut bytes = good.clone();
        bytes.extend(&torn[..torn.len() - 5]);
        tokio::fs::write(&path, &bytes).await.unwrap();

        let result = restore(&log_dir, 0, 1 << 26, 0, Some(1)).await.unwrap();
        assert_eq!(result.last_item.unwrap().index, 1);
        assert_eq!(result.resume_pos as usize, good.len());

        let on_disk = tokio::fs::read(&path).await.unwrap();
        assert_eq!(on_disk.len(), good.len());
    }

    #[tokio::test]
    async fn stops_cleanly_at_end_of_data_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("log");
        tokio::fs::create_dir_all(&log_dir).await.unwrap();
        let path = crate::store::segment::Segment::path_for(&log_dir, 0);

        let good = item(1, 1, 0, b"a").encode();
        let mut bytes = good.clone();
        bytes.extend(vec![0u8; crate::store::segment::FRAME_FIXED_LEN]);
        tokio::fs::write(&path, &bytes).await.unwrap();

        let result = restore(&log_dir, 0, 1 << 26, 0, Some(1)).await.unwrap();
        assert_eq!(result.last_item.unwrap().index, 1);
        assert_eq!(result.resume_pos as usize, good.len());
    }

    #[tokio::test]
    async fn end_of_data_in_one_segment_does_not_hide_a_later_segment() {
        // Reproduces the append-pipeline's segment rollover (§4.2 step 2): an
        // item that doesn't fit in segment 0's remaining space starts segment
        // 1 instead, leaving segment 0's unused tail reading back as the
        // end-of-data sentinel while segment 1 already holds durable items.
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("log");
        tokio::fs::create_dir_all(&log_dir).await.unwrap();

        const SEGMENT_SIZE: u64 = 128;

        let mut segment0 = vec![0u8; SEGMENT_SIZE as usize];
        let item1 = item(1, 1, 0, b"a").encode();
        segment0[..item1.len()].copy_from_slice(&item1);
        tokio::fs::write(crate::store::segment::Segment::path_for(&log_dir, 0), &segment0).await.unwrap();

        let mut segment1 = vec![0u8; SEGMENT_SIZE as usize];
        let item2 = item(2, 1, 1, b"bb").encode();
        let item3 = item(3, 2, 1, b"ccc").encode();
        segment1[..item2.len()].copy_from_slice(&item2);
        segment1[item2.len()..item2.len() + item3.len()].copy_from_slice(&item3);
        tokio::fs::write(crate::store::segment::Segment::path_for(&log_dir, SEGMENT_SIZE), &segment1).await.unwrap();

        let result = restore(&log_dir, 0, SEGMENT_SIZE, 0, Some(1)).await.unwrap();
        assert_eq!(result.last_item.unwrap().index, 3);
        assert_eq!(result.index_entries.len(), 3);
        assert_eq!(result.resume_pos, SEGMENT_SIZE + (item2.len() + item3.len()) as u64);
    }
}
