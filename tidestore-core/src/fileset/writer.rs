//! Appending blocks to a file group
//!
//! The data file is append-only; the index is rewritten atomically after
//! the data file has been synced, so the index never references bytes that
//! are not durably on disk.

use super::{BlockIndexEntry, FileGroup, FinishedBlock, DATA_FILE, INDEX_FILE};
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub(crate) const INDEX_MAGIC: &[u8; 4] = b"TDIX";
pub(crate) const INDEX_VERSION: u32 = 1;

/// Append finished blocks to the group's data file and publish them in
/// the index.
pub(super) fn append_blocks(group: &FileGroup, blocks: &[FinishedBlock]) -> Result<()> {
    if blocks.is_empty() {
        return Ok(());
    }
    let _guard = group.write_lock.lock();

    let dir = group.dir();
    let data_path = dir.join(DATA_FILE);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&data_path)?;
    let mut offset = file.metadata()?.len();

    let mut entries: Vec<BlockIndexEntry> = group.index().as_ref().clone();
    for block in blocks {
        file.write_all(&block.bytes)?;
        entries.push(BlockIndexEntry {
            table: block.table,
            sversion: block.sversion,
            offset,
            len: block.bytes.len() as u32,
            window: block.window,
            rows: block.rows,
            cols: block.cols,
            raw_bytes: block.raw_bytes,
            statis: block.statis.clone(),
        });
        offset += block.bytes.len() as u64;
    }
    file.sync_all()?;

    write_index(&dir, &entries)?;
    *group.index.write() = Arc::new(entries);

    debug!(
        fid = group.fid(),
        blocks = blocks.len(),
        "appended blocks to file group"
    );
    Ok(())
}

/// Atomically rewrite a group's index file
pub(super) fn write_index(dir: &Path, entries: &[BlockIndexEntry]) -> Result<()> {
    let payload =
        bincode::serialize(entries).map_err(|e| Error::Corrupted(e.to_string()))?;
    let mut buf = BytesMut::with_capacity(payload.len() + 16);
    buf.put_slice(INDEX_MAGIC);
    buf.put_u32_le(INDEX_VERSION);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);
    let checksum = crc32fast::hash(&buf);
    buf.put_u32_le(checksum);

    let path = dir.join(INDEX_FILE);
    let tmp = dir.join("index.tmp");
    std::fs::write(&tmp, &buf)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}
