//! Core types for tidestore

use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp in the repository's configured precision
pub type Timestamp = i64;

/// Table identity: globally unique id plus repository-local short id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId {
    /// Globally unique table id
    pub uid: u64,
    /// Short id, local to one repository
    pub tid: u32,
}

impl TableId {
    /// Create a new table id
    pub fn new(uid: u64, tid: u32) -> Self {
        Self { uid, tid }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.uid, self.tid)
    }
}

/// Time window for queries, both bounds inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (inclusive)
    pub end: Timestamp,
}

impl TimeWindow {
    /// Create a new time window
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// The window covering all representable timestamps
    pub fn all() -> Self {
        Self::new(i64::MIN, i64::MAX)
    }

    /// Check if a timestamp is within the window
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Check if two windows overlap
    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    /// Check if `other` lies entirely within this window
    pub fn covers(&self, other: &TimeWindow) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Result ordering for block iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanOrder {
    /// Ascending by primary timestamp
    Asc,
    /// Descending by primary timestamp
    Desc,
}

impl Default for ScanOrder {
    fn default() -> Self {
        ScanOrder::Asc
    }
}

/// Timestamp precision of a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimePrecision {
    Millis,
    Micros,
    Nanos,
}

impl TimePrecision {
    /// Number of timestamp ticks in one day at this precision
    pub fn ticks_per_day(&self) -> i64 {
        match self {
            TimePrecision::Millis => 86_400_000,
            TimePrecision::Micros => 86_400_000_000,
            TimePrecision::Nanos => 86_400_000_000_000,
        }
    }
}

impl Default for TimePrecision {
    fn default() -> Self {
        TimePrecision::Millis
    }
}

/// Block payload compression mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    Lz4,
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Lz4
    }
}

/// Repository configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoCfg {
    /// Repository id, assigned by the surrounding server
    pub repo_id: i32,
    /// Size of one cache block in bytes
    pub cache_block_size: usize,
    /// Total cache blocks; the write buffer is bounded by
    /// `cache_block_size * total_cache_blocks`
    pub total_cache_blocks: usize,
    /// Maximum number of tables this repository can hold
    pub max_tables: usize,
    /// Days of data per file group
    pub days_per_file: i32,
    /// Days of data to keep; older groups are reclaimed
    pub keep: i32,
    /// First tier threshold in days; data older moves to tier1 storage
    pub keep1: i32,
    /// Second tier threshold in days; data older moves to tier2 storage
    pub keep2: i32,
    /// Minimum rows per file block
    pub min_rows_per_block: usize,
    /// Maximum rows per file block
    pub max_rows_per_block: usize,
    /// Age in seconds after which buffered rows are committed
    pub commit_interval_secs: u64,
    /// Timestamp precision
    pub precision: TimePrecision,
    /// Block compression mode
    pub compression: Compression,
}

impl Default for RepoCfg {
    fn default() -> Self {
        Self {
            repo_id: 0,
            cache_block_size: crate::config::CACHE_BLOCK_SIZE,
            total_cache_blocks: crate::config::TOTAL_CACHE_BLOCKS,
            max_tables: crate::config::MAX_TABLES,
            days_per_file: crate::config::DAYS_PER_FILE,
            keep: crate::config::KEEP_DAYS,
            keep1: crate::config::KEEP_DAYS,
            keep2: crate::config::KEEP_DAYS,
            min_rows_per_block: crate::config::MIN_ROWS_PER_BLOCK,
            max_rows_per_block: crate::config::MAX_ROWS_PER_BLOCK,
            commit_interval_secs: crate::config::COMMIT_INTERVAL_SECS,
            precision: TimePrecision::default(),
            compression: Compression::default(),
        }
    }
}

impl RepoCfg {
    /// Validate configuration invariants
    pub fn validate(&self) -> crate::Result<()> {
        if self.cache_block_size == 0 || self.total_cache_blocks == 0 {
            return Err(crate::Error::InvalidArgument(
                "cache block size and count must be non-zero".into(),
            ));
        }
        if self.max_tables == 0 {
            return Err(crate::Error::InvalidArgument(
                "max_tables must be non-zero".into(),
            ));
        }
        if self.days_per_file <= 0 {
            return Err(crate::Error::InvalidArgument(
                "days_per_file must be positive".into(),
            ));
        }
        if self.keep <= 0 {
            return Err(crate::Error::InvalidArgument("keep must be positive".into()));
        }
        // Tier thresholds are monotonically non-decreasing: keep1 <= keep2 <= keep
        if !(0 < self.keep1 && self.keep1 <= self.keep2 && self.keep2 <= self.keep) {
            return Err(crate::Error::InvalidArgument(
                "retention tiers must satisfy 0 < keep1 <= keep2 <= keep".into(),
            ));
        }
        if self.min_rows_per_block == 0 || self.min_rows_per_block > self.max_rows_per_block {
            return Err(crate::Error::InvalidArgument(
                "rows per block must satisfy 0 < min <= max".into(),
            ));
        }
        Ok(())
    }

    /// Write buffer capacity in bytes
    pub fn buffer_capacity(&self) -> usize {
        self.cache_block_size * self.total_cache_blocks
    }

    /// Timestamp span of one file group
    pub fn group_span(&self) -> i64 {
        self.days_per_file as i64 * self.precision.ticks_per_day()
    }
}

/// Runtime-mutable subset of [`RepoCfg`]
#[derive(Debug, Clone, Default)]
pub struct RepoCfgPatch {
    pub keep: Option<i32>,
    pub keep1: Option<i32>,
    pub keep2: Option<i32>,
    pub commit_interval_secs: Option<u64>,
    pub min_rows_per_block: Option<usize>,
    pub max_rows_per_block: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_window() {
        let w1 = TimeWindow::new(100, 200);
        let w2 = TimeWindow::new(150, 250);
        let w3 = TimeWindow::new(300, 400);

        assert!(w1.overlaps(&w2));
        assert!(!w1.overlaps(&w3));
        assert!(w1.contains(200));
        assert!(!w1.contains(250));
        assert!(TimeWindow::new(0, 1000).covers(&w1));
        assert!(!w1.covers(&w2));
    }

    #[test]
    fn test_cfg_validation() {
        let mut cfg = RepoCfg::default();
        assert!(cfg.validate().is_ok());

        cfg.keep1 = cfg.keep + 1;
        assert!(cfg.validate().is_err());

        cfg = RepoCfg {
            days_per_file: 0,
            ..RepoCfg::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_group_span() {
        let cfg = RepoCfg {
            days_per_file: 2,
            precision: TimePrecision::Millis,
            ..RepoCfg::default()
        };
        assert_eq!(cfg.group_span(), 2 * 86_400_000);
    }
}
