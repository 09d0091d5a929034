//! File set manager
//!
//! Data is sharded into time-bounded file groups, one per `days_per_file`
//! interval. A group is a directory `g_<fid>` holding an append-only block
//! log (`data.tds`) and a checksummed index (`index.tds`); readers trust
//! only the index, so a torn append is invisible. Groups are totally
//! ordered by `fid` and never overlap.
//!
//! Retention works in tiers: groups older than `keep1` relocate to
//! `tier1/`, older than `keep2` to `tier2/`, and groups past `keep` are
//! expired. An expired group's files are deleted only when the last
//! iterator reference to it is gone.

mod block;
mod reader;
mod writer;

pub use block::{
    compute_statistics, BlockBuilder, ColumnStatis, EncodedBlock, FinishedBlock,
};
pub use reader::read_block;

use crate::{Compression, Error, Result, TableId, TimeWindow, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Name of a group's block log
pub(crate) const DATA_FILE: &str = "data.tds";
/// Name of a group's index file
pub(crate) const INDEX_FILE: &str = "index.tds";

const TIER_DIRS: [&str; 3] = ["data", "tier1", "tier2"];

/// Index record for one block inside a group's data file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockIndexEntry {
    pub table: TableId,
    pub sversion: i32,
    pub offset: u64,
    pub len: u32,
    pub window: TimeWindow,
    pub rows: u32,
    pub cols: u16,
    /// Uncompressed payload size, for logical-size accounting
    pub raw_bytes: u64,
    /// Per-column statistics of the whole block
    pub statis: Vec<ColumnStatis>,
}

/// One time-sharding interval's files
pub struct FileGroup {
    fid: i64,
    window: TimeWindow,
    dir: RwLock<PathBuf>,
    tier: AtomicU8,
    expired: AtomicBool,
    index: RwLock<Arc<Vec<BlockIndexEntry>>>,
    /// Serializes appends against each other and against tier moves
    write_lock: Mutex<()>,
}

impl FileGroup {
    fn new(fid: i64, window: TimeWindow, dir: PathBuf, tier: u8, index: Vec<BlockIndexEntry>) -> Self {
        Self {
            fid,
            window,
            dir: RwLock::new(dir),
            tier: AtomicU8::new(tier),
            expired: AtomicBool::new(false),
            index: RwLock::new(Arc::new(index)),
            write_lock: Mutex::new(()),
        }
    }

    pub fn fid(&self) -> i64 {
        self.fid
    }

    /// The time interval this group covers
    pub fn window(&self) -> TimeWindow {
        self.window
    }

    /// Current on-disk location; tier moves change it
    pub fn dir(&self) -> PathBuf {
        self.dir.read().clone()
    }

    pub fn tier(&self) -> u8 {
        self.tier.load(Ordering::Acquire)
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    /// A consistent view of the group's block index
    pub fn index(&self) -> Arc<Vec<BlockIndexEntry>> {
        self.index.read().clone()
    }

    /// Blocks of one table overlapping a window, ordered by start time
    pub fn blocks_for(&self, uid: u64, window: &TimeWindow) -> Vec<BlockIndexEntry> {
        let index = self.index();
        let mut entries: Vec<_> = index
            .iter()
            .filter(|e| e.table.uid == uid && e.window.overlaps(window))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.window.start);
        entries
    }

    /// Uncompressed bytes of all indexed blocks
    pub fn raw_bytes(&self) -> u64 {
        self.index().iter().map(|e| e.raw_bytes).sum()
    }

    fn disk_size(&self) -> u64 {
        let dir = self.dir();
        [DATA_FILE, INDEX_FILE]
            .iter()
            .filter_map(|name| std::fs::metadata(dir.join(name)).ok())
            .map(|m| m.len())
            .sum()
    }
}

impl Drop for FileGroup {
    fn drop(&mut self) {
        if self.is_expired() {
            let dir = self.dir.read().clone();
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                if dir.exists() {
                    warn!(fid = self.fid, "failed to remove expired group: {}", e);
                }
            }
        }
    }
}

/// What a retention sweep did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    pub expired: usize,
    pub relocated: usize,
}

/// One on-disk file, for backup/replication enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the repository root
    pub name: String,
    pub size: u64,
}

/// The ordered set of file groups of one repository
pub struct FileSet {
    root: PathBuf,
    span: i64,
    compression: Compression,
    groups: RwLock<BTreeMap<i64, Arc<FileGroup>>>,
}

impl FileSet {
    /// Create the directory skeleton for a new repository
    pub fn create(root: &Path) -> Result<()> {
        for tier in TIER_DIRS {
            std::fs::create_dir_all(root.join(tier))?;
        }
        Ok(())
    }

    /// Open the file set under `root`, loading every group's index
    pub fn open(root: &Path, span: i64, compression: Compression) -> Result<Self> {
        let set = Self {
            root: root.to_path_buf(),
            span,
            compression,
            groups: RwLock::new(BTreeMap::new()),
        };

        let mut groups = BTreeMap::new();
        for (tier, tier_dir) in TIER_DIRS.iter().enumerate() {
            let dir = root.join(tier_dir);
            if !dir.exists() {
                continue;
            }
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                let Some(fid) = name.strip_prefix("g_").and_then(|s| s.parse::<i64>().ok())
                else {
                    continue;
                };
                let index = reader::load_index(&entry.path())?;
                let group = FileGroup::new(
                    fid,
                    set.window_of(fid),
                    entry.path(),
                    tier as u8,
                    index,
                );
                if groups.insert(fid, Arc::new(group)).is_some() {
                    return Err(Error::Corrupted(format!(
                        "file group {} present in two tiers",
                        fid
                    )));
                }
            }
        }
        info!("loaded {} file groups", groups.len());
        *set.groups.write() = groups;
        Ok(set)
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// The file group owning a timestamp
    pub fn fid_for(&self, ts: Timestamp) -> i64 {
        ts.div_euclid(self.span)
    }

    /// The interval a group covers
    pub fn window_of(&self, fid: i64) -> TimeWindow {
        TimeWindow::new(fid * self.span, (fid + 1) * self.span - 1)
    }

    /// Number of file groups
    pub fn count(&self) -> usize {
        self.groups.read().len()
    }

    /// Get a group for appending, creating it hot if absent
    pub fn group_for_write(&self, fid: i64) -> Result<Arc<FileGroup>> {
        if let Some(group) = self.groups.read().get(&fid) {
            return Ok(group.clone());
        }
        let mut groups = self.groups.write();
        if let Some(group) = groups.get(&fid) {
            return Ok(group.clone());
        }
        let dir = self.root.join(TIER_DIRS[0]).join(format!("g_{}", fid));
        std::fs::create_dir_all(&dir)?;
        let group = Arc::new(FileGroup::new(fid, self.window_of(fid), dir, 0, Vec::new()));
        groups.insert(fid, group.clone());
        Ok(group)
    }

    /// Groups overlapping a window, ascending by interval
    pub fn groups_overlapping(&self, window: &TimeWindow) -> Vec<Arc<FileGroup>> {
        let start_fid = self.fid_for(window.start);
        let end_fid = self.fid_for(window.end);
        self.groups
            .read()
            .range(start_fid..=end_fid)
            .map(|(_, g)| g.clone())
            .collect()
    }

    /// All groups, ascending
    pub fn all_groups(&self) -> Vec<Arc<FileGroup>> {
        self.groups.read().values().cloned().collect()
    }

    /// Append finished blocks to one group's files
    pub fn append_blocks(&self, group: &FileGroup, blocks: &[FinishedBlock]) -> Result<()> {
        writer::append_blocks(group, blocks)
    }

    /// Incremental enumeration of on-disk files for backup tooling.
    /// Returns the entry at `index` and the continuation index.
    pub fn file_info(&self, index: u32) -> Option<(FileEntry, u32)> {
        let groups = self.groups.read();
        let mut files = Vec::new();
        for group in groups.values() {
            let dir = group.dir();
            for name in [DATA_FILE, INDEX_FILE] {
                let path = dir.join(name);
                if let Ok(meta) = std::fs::metadata(&path) {
                    let rel = path
                        .strip_prefix(&self.root)
                        .unwrap_or(&path)
                        .to_string_lossy()
                        .to_string();
                    files.push(FileEntry {
                        name: rel,
                        size: meta.len(),
                    });
                }
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        files
            .into_iter()
            .nth(index as usize)
            .map(|entry| (entry, index + 1))
    }

    /// Total bytes on disk across all groups
    pub fn total_disk_size(&self) -> u64 {
        self.groups.read().values().map(|g| g.disk_size()).sum()
    }

    /// Total uncompressed bytes across all groups
    pub fn total_raw_bytes(&self) -> u64 {
        self.groups.read().values().map(|g| g.raw_bytes()).sum()
    }

    /// Apply the retention policy. `now` is in repository precision;
    /// thresholds are in ticks. A group being written right now is left
    /// for the next sweep.
    pub fn sweep(&self, now: Timestamp, keep: i64, keep1: i64, keep2: i64) -> SweepSummary {
        let mut summary = SweepSummary::default();
        let candidates: Vec<Arc<FileGroup>> = self.groups.read().values().cloned().collect();

        for group in candidates {
            let age_cutoff = group.window.end;
            let target_tier = if age_cutoff < now - keep {
                None
            } else if age_cutoff < now - keep2 {
                Some(2u8)
            } else if age_cutoff < now - keep1 {
                Some(1u8)
            } else {
                continue;
            };

            let Some(_guard) = group.write_lock.try_lock() else {
                continue;
            };

            match target_tier {
                None => {
                    group.expired.store(true, Ordering::Release);
                    self.groups.write().remove(&group.fid);
                    info!(fid = group.fid, "expired file group");
                    summary.expired += 1;
                    // files are deleted by the group's Drop once the last
                    // iterator holding it lets go
                }
                Some(tier) if tier > group.tier() => {
                    match self.relocate(&group, tier) {
                        Ok(()) => {
                            info!(fid = group.fid, tier, "relocated file group");
                            summary.relocated += 1;
                        }
                        Err(e) => {
                            warn!(fid = group.fid, tier, "tier move failed: {}", e);
                        }
                    }
                }
                Some(_) => {}
            }
        }
        summary
    }

    fn relocate(&self, group: &FileGroup, tier: u8) -> Result<()> {
        let target = self
            .root
            .join(TIER_DIRS[tier as usize])
            .join(format!("g_{}", group.fid));
        let mut dir = group.dir.write();
        std::fs::rename(&*dir, &target)?;
        *dir = target;
        group.tier.store(tier, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, ColumnType, ColumnValue, RowData, Schema};
    use tempfile::TempDir;

    const DAY: i64 = 86_400_000;

    fn schema() -> Schema {
        Schema::new(
            1,
            vec![
                ColumnSchema::new(0, "ts", ColumnType::Timestamp),
                ColumnSchema::new(1, "v", ColumnType::Float),
            ],
        )
        .unwrap()
    }

    fn finished_block(table: TableId, base_ts: i64, rows: usize) -> FinishedBlock {
        let mut builder = BlockBuilder::new(table, schema(), 1, Compression::Lz4);
        for i in 0..rows as i64 {
            let ts = base_ts + i;
            let row = RowData::new(vec![
                ColumnValue::Timestamp(ts),
                ColumnValue::Float(i as f64),
            ]);
            builder.push_row(ts, &row);
        }
        builder.finish().unwrap()
    }

    fn open_set(root: &Path) -> FileSet {
        FileSet::create(root).unwrap();
        FileSet::open(root, DAY, Compression::Lz4).unwrap()
    }

    #[test]
    fn test_fid_mapping() {
        let dir = TempDir::new().unwrap();
        let set = open_set(dir.path());

        assert_eq!(set.fid_for(0), 0);
        assert_eq!(set.fid_for(DAY - 1), 0);
        assert_eq!(set.fid_for(DAY), 1);
        assert_eq!(set.fid_for(-1), -1);

        let w = set.window_of(1);
        assert_eq!(w, TimeWindow::new(DAY, 2 * DAY - 1));
    }

    #[test]
    fn test_append_and_reload() {
        let dir = TempDir::new().unwrap();
        let table = TableId::new(1, 1);
        {
            let set = open_set(dir.path());
            let group = set.group_for_write(0).unwrap();
            set.append_blocks(&group, &[finished_block(table, 100, 50)])
                .unwrap();
            set.append_blocks(&group, &[finished_block(table, 1000, 30)])
                .unwrap();
            assert_eq!(group.index().len(), 2);
        }

        let set = FileSet::open(dir.path(), DAY, Compression::Lz4).unwrap();
        assert_eq!(set.count(), 1);
        let group = set.groups_overlapping(&TimeWindow::new(0, DAY - 1))[0].clone();
        let entries = group.blocks_for(1, &TimeWindow::all());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].rows, 50);

        let block = read_block(&group, &entries[1]).unwrap();
        assert_eq!(block.num_rows(), 30);
        let ts = block.decode_column(0).unwrap();
        assert_eq!(ts[0], ColumnValue::Timestamp(1000));
    }

    #[test]
    fn test_sweep_expires_and_tiers() {
        let dir = TempDir::new().unwrap();
        let set = open_set(dir.path());
        let table = TableId::new(1, 1);

        for fid in 0..4 {
            let group = set.group_for_write(fid).unwrap();
            set.append_blocks(&group, &[finished_block(table, fid * DAY, 10)])
                .unwrap();
        }

        // now = end of day 9; keep 8 days, tier1 after 2, tier2 after 5
        let now = 10 * DAY;
        let summary = set.sweep(now, 8 * DAY, 2 * DAY, 5 * DAY);
        // day 0 ends at DAY-1 which is older than now-keep (2*DAY)
        assert_eq!(summary.expired, 2);
        assert!(summary.relocated >= 1);
        assert_eq!(set.count(), 2);

        // expired groups' directories are gone once their Arcs drop
        assert!(!dir.path().join("data/g_0").exists());
        assert!(!dir.path().join("data/g_1").exists());
        // relocated group still readable at its new home
        let group = set.groups_overlapping(&set.window_of(2))[0].clone();
        assert!(group.tier() > 0);
        let entries = group.blocks_for(1, &TimeWindow::all());
        assert_eq!(entries.len(), 1);
        assert!(read_block(&group, &entries[0]).is_ok());
    }

    #[test]
    fn test_pinned_group_survives_sweep() {
        let dir = TempDir::new().unwrap();
        let set = open_set(dir.path());
        let table = TableId::new(1, 1);
        let group = set.group_for_write(0).unwrap();
        set.append_blocks(&group, &[finished_block(table, 0, 10)])
            .unwrap();

        let pinned = set.groups_overlapping(&TimeWindow::new(0, DAY))[0].clone();
        let entry = pinned.blocks_for(1, &TimeWindow::all())[0].clone();
        drop(group);

        let summary = set.sweep(100 * DAY, DAY, DAY, DAY);
        assert_eq!(summary.expired, 1);
        assert_eq!(set.count(), 0);

        // still readable through the pinned reference
        let block = read_block(&pinned, &entry).unwrap();
        assert_eq!(block.num_rows(), 10);

        drop(block);
        drop(pinned);
        assert!(!dir.path().join("data/g_0").exists());
    }

    #[test]
    fn test_file_enumeration() {
        let dir = TempDir::new().unwrap();
        let set = open_set(dir.path());
        let table = TableId::new(1, 1);
        let group = set.group_for_write(3).unwrap();
        set.append_blocks(&group, &[finished_block(table, 3 * DAY, 10)])
            .unwrap();

        let mut index = 0;
        let mut names = Vec::new();
        while let Some((entry, next)) = set.file_info(index) {
            assert!(entry.size > 0);
            names.push(entry.name);
            index = next;
        }
        assert_eq!(names.len(), 2);
        assert!(names.iter().any(|n| n.ends_with(DATA_FILE)));
        assert!(names.iter().any(|n| n.ends_with(INDEX_FILE)));
    }
}
