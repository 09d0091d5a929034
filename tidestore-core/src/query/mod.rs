//! Query side of the repository
//!
//! A query is an explicit time window, a column projection, an ordering
//! and a table group to scan. The result is a lazy, restartable sequence
//! of data blocks produced by [`QueryHandle`], each guaranteed to lie
//! fully inside the window.

mod handle;

pub use handle::QueryHandle;

use crate::schema::ColumnValue;
use crate::{ScanOrder, TableId, TimeWindow};

/// Condition a block iterator is bound to
#[derive(Debug, Clone)]
pub struct QueryCond {
    /// Time window, both bounds inclusive
    pub window: TimeWindow,
    /// Result ordering by primary timestamp
    pub order: ScanOrder,
    /// Required column ids; empty means every column of each block
    pub columns: Vec<i16>,
}

impl QueryCond {
    pub fn new(window: TimeWindow, order: ScanOrder, columns: Vec<i16>) -> Self {
        Self {
            window,
            order,
            columns,
        }
    }
}

/// A query-time partition of table ids, owned by the caller.
/// Sub-groups carry GROUP BY semantics; the iterator scans them in order.
#[derive(Debug, Clone, Default)]
pub struct TableGroup {
    pub groups: Vec<Vec<TableId>>,
}

impl TableGroup {
    /// Group holding a single table
    pub fn single(id: TableId) -> Self {
        Self {
            groups: vec![vec![id]],
        }
    }

    /// Total number of tables across all sub-groups
    pub fn num_tables(&self) -> usize {
        self.groups.iter().map(|g| g.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.num_tables() == 0
    }

    /// Tables flattened in group order
    pub fn tables(&self) -> impl Iterator<Item = TableId> + '_ {
        self.groups.iter().flatten().copied()
    }
}

/// Cheap per-block peek: window, size and owner without column data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// The block's (trimmed) time window
    pub window: TimeWindow,
    /// Rows in the block
    pub rows: usize,
    /// Columns in the block
    pub num_cols: usize,
    /// Owning table
    pub table: TableId,
}

/// One materialized column of the current block
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnData {
    pub col_id: i16,
    pub values: Vec<ColumnValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_group() {
        let group = TableGroup {
            groups: vec![
                vec![TableId::new(1, 1), TableId::new(2, 2)],
                vec![TableId::new(3, 3)],
            ],
        };
        assert_eq!(group.num_tables(), 3);
        assert!(!group.is_empty());
        let flat: Vec<_> = group.tables().collect();
        assert_eq!(flat[2], TableId::new(3, 3));

        assert!(TableGroup::default().is_empty());
        assert_eq!(TableGroup::single(TableId::new(9, 1)).num_tables(), 1);
    }
}
