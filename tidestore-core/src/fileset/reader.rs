//! Reading blocks and indexes back from a file group

use super::writer::{INDEX_MAGIC, INDEX_VERSION};
use super::{BlockIndexEntry, EncodedBlock, FileGroup, DATA_FILE, INDEX_FILE};
use crate::{Error, Result};
use bytes::{Buf, Bytes};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Load a group's index; an absent index means an empty group
pub(super) fn load_index(dir: &Path) -> Result<Vec<BlockIndexEntry>> {
    let path = dir.join(INDEX_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = std::fs::read(&path)?;
    if data.len() < 16 {
        return Err(Error::Corrupted("group index too short".into()));
    }

    let body = &data[..data.len() - 4];
    let expected = {
        let mut cursor = std::io::Cursor::new(&data[data.len() - 4..]);
        cursor.get_u32_le()
    };
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(Error::ChecksumMismatch { expected, actual });
    }

    let mut cursor = std::io::Cursor::new(body);
    let mut magic = [0u8; 4];
    cursor.copy_to_slice(&mut magic);
    if &magic != INDEX_MAGIC {
        return Err(Error::Corrupted("bad group index magic".into()));
    }
    let version = cursor.get_u32_le();
    if version != INDEX_VERSION {
        return Err(Error::Corrupted(format!(
            "unsupported group index version {}",
            version
        )));
    }
    let len = cursor.get_u32_le() as usize;
    let pos = cursor.position() as usize;
    if body.len() < pos + len {
        return Err(Error::Corrupted("group index truncated".into()));
    }
    bincode::deserialize(&body[pos..pos + len]).map_err(|e| Error::Corrupted(e.to_string()))
}

/// Read and verify one block. A missing file on an expired group is the
/// clean end-of-data signal, not a crash.
pub fn read_block(group: &FileGroup, entry: &BlockIndexEntry) -> Result<EncodedBlock> {
    let path = group.dir().join(DATA_FILE);
    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(e) => {
            if group.is_expired() {
                return Err(Error::Expired(group.fid()));
            }
            return Err(Error::Io(e));
        }
    };

    file.seek(SeekFrom::Start(entry.offset))?;
    let mut data = vec![0u8; entry.len as usize];
    if let Err(e) = file.read_exact(&mut data) {
        if group.is_expired() {
            return Err(Error::Expired(group.fid()));
        }
        return Err(Error::Io(e));
    }

    let block = EncodedBlock::parse(Bytes::from(data))?;
    if block.table() != entry.table {
        return Err(Error::Corrupted(format!(
            "block at {} belongs to table {}, index says {}",
            entry.offset,
            block.table(),
            entry.table
        )));
    }
    Ok(block)
}
