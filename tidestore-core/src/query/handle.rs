//! The block iterator behind a query handle
//!
//! `next_data_block` is the single advance point: it walks the tables of
//! the group in order and, per table, the qualifying blocks in timestamp
//! order, merged from the in-memory buffer and the on-disk file groups.
//! Every block handed back lies fully inside the query window; a disk
//! block spanning the boundary is trimmed into a logical sub-block.
//!
//! The handle pins (holds an `Arc` to) every file group it may touch, so
//! a retention sweep cannot delete files out from under a paused
//! iterator; the group's files go away only after the handle is cleaned
//! up.

use super::{BlockInfo, ColumnData, QueryCond, TableGroup};
use crate::buffer::MemBuffer;
use crate::fileset::{
    read_block, BlockIndexEntry, ColumnStatis, EncodedBlock, FileGroup, FileSet,
};
use crate::meta::TableDirectory;
use crate::schema::{ColumnValue, RowData, Schema};
use crate::{Error, Result, ScanOrder, TableId, TimeWindow, Timestamp};
use std::collections::HashMap;
use std::sync::Arc;

/// Restartable, lazy block iterator over one table group
pub struct QueryHandle<'g> {
    directory: Arc<TableDirectory>,
    buffer: Arc<MemBuffer>,
    fileset: Arc<FileSet>,
    cond: QueryCond,
    #[allow(dead_code)]
    group: &'g TableGroup,
    last_row: bool,
    /// Groups held alive for the whole iteration
    pinned: Vec<Arc<FileGroup>>,
    tables: Vec<TableId>,
    table_pos: usize,
    scan: Option<TableScan>,
    current: Option<CurrentBlock>,
}

struct TableScan {
    blocks: Vec<Option<BlockRef>>,
    next: usize,
}

enum BlockRef {
    File {
        group: Arc<FileGroup>,
        entry: BlockIndexEntry,
    },
    Cache {
        schema: Schema,
        rows: Vec<(Timestamp, RowData)>,
    },
}

enum Source {
    Cache {
        schema: Schema,
        rows: Vec<(Timestamp, RowData)>,
    },
    File {
        group: Arc<FileGroup>,
        entry: BlockIndexEntry,
        block: Option<EncodedBlock>,
        lo: usize,
        hi: usize,
    },
}

struct CurrentBlock {
    info: BlockInfo,
    statis: Option<Vec<ColumnStatis>>,
    source: Source,
    decoded: HashMap<i16, Vec<ColumnValue>>,
}

impl<'g> QueryHandle<'g> {
    /// Bind an iterator to a condition and a caller-owned table group.
    /// The group is not copied; it must outlive the handle.
    pub(crate) fn open(
        directory: Arc<TableDirectory>,
        buffer: Arc<MemBuffer>,
        fileset: Arc<FileSet>,
        cond: QueryCond,
        group: &'g TableGroup,
        last_row: bool,
    ) -> Result<Self> {
        if cond.window.start > cond.window.end {
            return Err(Error::InvalidArgument(
                "query window start is after its end".into(),
            ));
        }
        let pinned = fileset.groups_overlapping(&cond.window);
        let tables = group.tables().collect();
        Ok(Self {
            directory,
            buffer,
            fileset,
            cond,
            group,
            last_row,
            pinned,
            tables,
            table_pos: 0,
            scan: None,
            current: None,
        })
    }

    /// The tables this handle scans, flattened in group order
    pub fn table_list(&self) -> Vec<TableId> {
        self.tables.clone()
    }

    /// Advance to the next qualifying block. Returns `false` when the
    /// sequence is exhausted; further calls keep returning `false`.
    pub fn next_data_block(&mut self) -> Result<bool> {
        loop {
            if self.scan.is_none() {
                if self.table_pos >= self.tables.len() {
                    self.current = None;
                    return Ok(false);
                }
                let table = self.tables[self.table_pos];
                let scan = self.build_scan(table)?;
                self.scan = Some(scan);
            }

            let scan = self.scan.as_mut().expect("scan built above");
            if scan.next >= scan.blocks.len() {
                self.scan = None;
                self.table_pos += 1;
                continue;
            }
            let block_ref = scan.blocks[scan.next].take().expect("block not yet taken");
            scan.next += 1;

            if let Some(current) = self.realize(block_ref)? {
                self.current = Some(current);
                return Ok(true);
            }
        }
    }

    /// Cheap peek at the current block
    pub fn data_block_info(&self) -> Option<BlockInfo> {
        self.current.as_ref().map(|c| c.info)
    }

    /// Pre-computed statistics of the current block. Available only for
    /// an on-disk block returned whole; cache-resident and trimmed blocks
    /// yield `None` and the caller falls back to scanning raw values.
    pub fn data_block_statistics(&self) -> Option<&[ColumnStatis]> {
        self.current.as_ref().and_then(|c| c.statis.as_deref())
    }

    /// Materialize the requested columns of the current block. Columns
    /// decoded earlier are reused; an empty request means every column
    /// the block has. Requested columns the block's schema version does
    /// not know are skipped.
    pub fn data_block(&mut self, column_ids: &[i16]) -> Result<Vec<ColumnData>> {
        let order = self.cond.order;
        let current = self
            .current
            .as_mut()
            .ok_or_else(|| Error::InvalidArgument("no current data block".into()))?;

        let requested: Vec<i16> = if column_ids.is_empty() {
            current.own_column_ids()?
        } else {
            column_ids.to_vec()
        };

        for &id in &requested {
            if !current.decoded.contains_key(&id) {
                current.materialize(id, order)?;
            }
        }

        Ok(requested
            .iter()
            .filter_map(|id| {
                current.decoded.get(id).map(|values| ColumnData {
                    col_id: *id,
                    values: values.clone(),
                })
            })
            .collect())
    }

    /// Release every iterator-local resource
    pub fn cleanup(self) {
        drop(self);
    }

    fn build_scan(&mut self, id: TableId) -> Result<TableScan> {
        // a table that vanished from the directory contributes no blocks
        let Ok(table) = self.directory.table(id.uid) else {
            return Ok(TableScan {
                blocks: Vec::new(),
                next: 0,
            });
        };

        // pinned groups, plus any group committed into existence since open
        for group in self.fileset.groups_overlapping(&self.cond.window) {
            if !self.pinned.iter().any(|g| g.fid() == group.fid()) {
                self.pinned.push(group);
            }
        }
        let mut groups = self.pinned.clone();
        groups.sort_by_key(|g| g.fid());

        let mut entries: Vec<(Arc<FileGroup>, BlockIndexEntry)> = Vec::new();
        for group in &groups {
            for entry in group.blocks_for(id.uid, &self.cond.window) {
                entries.push((group.clone(), entry));
            }
        }

        // buffer snapshot; rows shadowed by an indexed block window are
        // already durable and would come back twice
        let cache = self
            .buffer
            .get(id.uid)
            .map(|t| t.snapshot(self.cond.window.start, self.cond.window.end))
            .unwrap_or_default();
        let cache: Vec<_> = cache
            .into_iter()
            .filter(|(ts, _)| !entries.iter().any(|(_, e)| e.window.contains(*ts)))
            .collect();

        if self.last_row {
            return self.build_last_row_scan(&table, entries, cache);
        }

        let mut refs: Vec<(TimeWindow, BlockRef)> = entries
            .into_iter()
            .map(|(group, entry)| (entry.window, BlockRef::File { group, entry }))
            .collect();

        // split buffered rows into runs per schema version
        let mut runs: Vec<(i32, Vec<(Timestamp, RowData)>)> = Vec::new();
        for (ts, buf_row) in cache {
            match runs.last_mut() {
                Some((version, items)) if *version == buf_row.sversion => {
                    items.push((ts, buf_row.row));
                }
                _ => runs.push((buf_row.sversion, vec![(ts, buf_row.row)])),
            }
        }
        for (sversion, rows) in runs {
            let schema = self.directory.row_schema(&table, Some(sversion))?;
            let window = TimeWindow::new(rows[0].0, rows[rows.len() - 1].0);
            refs.push((window, BlockRef::Cache { schema, rows }));
        }

        match self.cond.order {
            ScanOrder::Asc => refs.sort_by_key(|(w, _)| w.start),
            ScanOrder::Desc => refs.sort_by_key(|(w, _)| std::cmp::Reverse(w.end)),
        }

        Ok(TableScan {
            blocks: refs.into_iter().map(|(_, r)| Some(r)).collect(),
            next: 0,
        })
    }

    /// A scan producing at most one block of one row: the most recent
    /// qualifying row of the table.
    fn build_last_row_scan(
        &self,
        table: &crate::meta::Table,
        entries: Vec<(Arc<FileGroup>, BlockIndexEntry)>,
        cache: Vec<(Timestamp, crate::buffer::BufRow)>,
    ) -> Result<TableScan> {
        let mut best: Option<(Timestamp, i32, RowData)> = cache
            .into_iter()
            .next_back()
            .map(|(ts, buf_row)| (ts, buf_row.sversion, buf_row.row));

        let mut by_end = entries;
        by_end.sort_by_key(|(_, e)| std::cmp::Reverse(e.window.end));
        for (group, entry) in &by_end {
            if let Some((best_ts, _, _)) = &best {
                if *best_ts >= entry.window.end {
                    break;
                }
            }
            let block = read_block(group, entry)?;
            let ts = block.timestamps()?;
            let hi = ts.partition_point(|t| *t <= self.cond.window.end);
            if hi == 0 || ts[hi - 1] < self.cond.window.start {
                continue;
            }
            let row_ts = ts[hi - 1];
            if best.as_ref().map(|(t, _, _)| row_ts > *t).unwrap_or(true) {
                let row = rebuild_row(&block, hi - 1)?;
                best = Some((row_ts, entry.sversion, row));
            }
        }

        let blocks = match best {
            Some((ts, sversion, row)) => {
                let schema = self.directory.row_schema(table, Some(sversion))?;
                vec![Some(BlockRef::Cache {
                    schema,
                    rows: vec![(ts, row)],
                })]
            }
            None => Vec::new(),
        };
        Ok(TableScan { blocks, next: 0 })
    }

    fn realize(&mut self, block_ref: BlockRef) -> Result<Option<CurrentBlock>> {
        match block_ref {
            BlockRef::Cache { schema, rows } => {
                if rows.is_empty() {
                    return Ok(None);
                }
                let window = TimeWindow::new(rows[0].0, rows[rows.len() - 1].0);
                let info = BlockInfo {
                    window,
                    rows: rows.len(),
                    num_cols: schema.num_cols(),
                    table: self.tables[self.table_pos],
                };
                Ok(Some(CurrentBlock {
                    info,
                    statis: None,
                    source: Source::Cache { schema, rows },
                    decoded: HashMap::new(),
                }))
            }
            BlockRef::File { group, entry } => {
                if self.cond.window.covers(&entry.window) {
                    // whole block qualifies: info and statistics come from
                    // the index, column data stays on disk until asked for
                    let info = BlockInfo {
                        window: entry.window,
                        rows: entry.rows as usize,
                        num_cols: entry.cols as usize,
                        table: entry.table,
                    };
                    let statis = Some(entry.statis.clone());
                    let hi = entry.rows as usize - 1;
                    Ok(Some(CurrentBlock {
                        info,
                        statis,
                        source: Source::File {
                            group,
                            entry,
                            block: None,
                            lo: 0,
                            hi,
                        },
                        decoded: HashMap::new(),
                    }))
                } else {
                    // boundary block: load timestamps and trim
                    let block = read_block(&group, &entry)?;
                    let ts = block.timestamps()?;
                    let lo = ts.partition_point(|t| *t < self.cond.window.start);
                    let hi = ts.partition_point(|t| *t <= self.cond.window.end);
                    if lo >= hi {
                        return Ok(None);
                    }
                    let info = BlockInfo {
                        window: TimeWindow::new(ts[lo], ts[hi - 1]),
                        rows: hi - lo,
                        num_cols: entry.cols as usize,
                        table: entry.table,
                    };
                    Ok(Some(CurrentBlock {
                        info,
                        statis: None,
                        source: Source::File {
                            group,
                            entry,
                            block: Some(block),
                            lo,
                            hi: hi - 1,
                        },
                        decoded: HashMap::new(),
                    }))
                }
            }
        }
    }
}

impl CurrentBlock {
    /// Column ids the block itself carries
    fn own_column_ids(&mut self) -> Result<Vec<i16>> {
        match &mut self.source {
            Source::Cache { schema, .. } => Ok(schema.columns.iter().map(|c| c.id).collect()),
            Source::File {
                group,
                entry,
                block,
                ..
            } => {
                if block.is_none() {
                    *block = Some(read_block(group, entry)?);
                }
                Ok(block.as_ref().expect("loaded above").column_ids())
            }
        }
    }

    fn materialize(&mut self, col_id: i16, order: ScanOrder) -> Result<()> {
        let values = match &mut self.source {
            Source::Cache { schema, rows } => {
                let Some(index) = schema.col_index(col_id) else {
                    return Ok(());
                };
                let mut values: Vec<ColumnValue> = rows
                    .iter()
                    .map(|(_, row)| {
                        row.value(index).cloned().ok_or_else(|| {
                            Error::Corrupted("row shorter than its schema".into())
                        })
                    })
                    .collect::<Result<_>>()?;
                if order == ScanOrder::Desc {
                    values.reverse();
                }
                values
            }
            Source::File {
                group,
                entry,
                block,
                lo,
                hi,
            } => {
                if block.is_none() {
                    *block = Some(read_block(group, entry)?);
                }
                let block = block.as_ref().expect("loaded above");
                if !block.column_ids().contains(&col_id) {
                    return Ok(());
                }
                let full = block.decode_column(col_id)?;
                let mut values = full[*lo..=*hi].to_vec();
                if order == ScanOrder::Desc {
                    values.reverse();
                }
                values
            }
        };
        self.decoded.insert(col_id, values);
        Ok(())
    }
}

/// Reassemble one row of a block from its columns
fn rebuild_row(block: &EncodedBlock, index: usize) -> Result<RowData> {
    let mut values = Vec::with_capacity(block.num_cols());
    for col_id in block.column_ids() {
        let column = block.decode_column(col_id)?;
        let value = column
            .into_iter()
            .nth(index)
            .ok_or_else(|| Error::Corrupted("row index out of block bounds".into()))?;
        values.push(value);
    }
    Ok(RowData::new(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileset::BlockBuilder;
    use crate::meta::{TableCfg, TableDirectory};
    use crate::schema::{ColumnSchema, ColumnType};
    use crate::Compression;
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

    fn row(ts: Timestamp, v: f64) -> RowData {
        RowData::new(vec![ColumnValue::Timestamp(ts), ColumnValue::Float(v)])
    }

    struct Fixture {
        _dir: TempDir,
        directory: Arc<TableDirectory>,
        buffer: Arc<MemBuffer>,
        fileset: Arc<FileSet>,
        id: TableId,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let directory = Arc::new(TableDirectory::new(dir.path(), 16));
        let id = directory
            .create_table(TableCfg::normal("m", TableId::new(1, 0), schema()))
            .unwrap();
        FileSet::create(dir.path()).unwrap();
        let fileset = Arc::new(FileSet::open(dir.path(), DAY, Compression::Lz4).unwrap());
        Fixture {
            _dir: dir,
            directory,
            buffer: Arc::new(MemBuffer::new(1 << 20)),
            fileset,
            id,
        }
    }

    fn write_disk_rows(f: &Fixture, rows: &[(Timestamp, f64)]) {
        let mut builder = BlockBuilder::new(f.id, schema(), 1, Compression::Lz4);
        for (ts, v) in rows {
            builder.push_row(*ts, &row(*ts, *v));
        }
        let block = builder.finish().unwrap();
        let fid = f.fileset.fid_for(rows[0].0);
        let group = f.fileset.group_for_write(fid).unwrap();
        f.fileset.append_blocks(&group, &[block]).unwrap();
    }

    fn collect_ts(handle: &mut QueryHandle<'_>) -> Vec<Timestamp> {
        let mut out = Vec::new();
        while handle.next_data_block().unwrap() {
            let columns = handle.data_block(&[0]).unwrap();
            for value in &columns[0].values {
                match value {
                    ColumnValue::Timestamp(ts) => out.push(*ts),
                    other => panic!("unexpected value {:?}", other),
                }
            }
        }
        out
    }

    #[test]
    fn test_cache_only_iteration() {
        let f = fixture();
        for i in 0..10 {
            f.buffer.append(f.id, 1, row(i * 100, i as f64), i * 100);
        }

        let group = TableGroup::single(f.id);
        let cond = QueryCond::new(TimeWindow::new(200, 700), ScanOrder::Asc, vec![]);
        let mut handle = QueryHandle::open(
            f.directory.clone(),
            f.buffer.clone(),
            f.fileset.clone(),
            cond,
            &group,
            false,
        )
        .unwrap();

        assert_eq!(handle.table_list(), vec![f.id]);
        assert!(handle.next_data_block().unwrap());
        let info = handle.data_block_info().unwrap();
        assert_eq!(info.rows, 6);
        assert_eq!(info.window, TimeWindow::new(200, 700));
        // cache blocks never carry statistics
        assert!(handle.data_block_statistics().is_none());

        assert!(!handle.next_data_block().unwrap());
        assert!(!handle.next_data_block().unwrap());
        handle.cleanup();
    }

    #[test]
    fn test_disk_and_cache_split() {
        let f = fixture();
        write_disk_rows(&f, &[(100, 1.0), (200, 2.0), (300, 3.0)]);
        for ts in [400i64, 500] {
            f.buffer.append(f.id, 1, row(ts, 0.0), ts);
        }

        let group = TableGroup::single(f.id);
        let cond = QueryCond::new(TimeWindow::all(), ScanOrder::Asc, vec![0, 1]);
        let mut handle = QueryHandle::open(
            f.directory.clone(),
            f.buffer.clone(),
            f.fileset.clone(),
            cond,
            &group,
            false,
        )
        .unwrap();
        let ts = collect_ts(&mut handle);
        assert_eq!(ts, vec![100, 200, 300, 400, 500]);
    }

    #[test]
    fn test_window_trims_disk_block() {
        let f = fixture();
        write_disk_rows(&f, &[(100, 1.0), (200, 2.0), (300, 3.0), (400, 4.0)]);

        let group = TableGroup::single(f.id);
        let cond = QueryCond::new(TimeWindow::new(150, 350), ScanOrder::Asc, vec![]);
        let mut handle = QueryHandle::open(
            f.directory.clone(),
            f.buffer.clone(),
            f.fileset.clone(),
            cond,
            &group,
            false,
        )
        .unwrap();

        assert!(handle.next_data_block().unwrap());
        let info = handle.data_block_info().unwrap();
        assert_eq!(info.window, TimeWindow::new(200, 300));
        assert_eq!(info.rows, 2);
        // trimmed block: statistics describe the whole disk block, so none
        assert!(handle.data_block_statistics().is_none());

        let columns = handle.data_block(&[1]).unwrap();
        assert_eq!(columns.len(), 1);
        assert_eq!(
            columns[0].values,
            vec![ColumnValue::Float(2.0), ColumnValue::Float(3.0)]
        );
        assert!(!handle.next_data_block().unwrap());
    }

    #[test]
    fn test_whole_disk_block_has_statistics() {
        let f = fixture();
        write_disk_rows(&f, &[(100, 1.0), (200, 2.0)]);

        let group = TableGroup::single(f.id);
        let cond = QueryCond::new(TimeWindow::new(0, 1000), ScanOrder::Asc, vec![]);
        let mut handle = QueryHandle::open(
            f.directory.clone(),
            f.buffer.clone(),
            f.fileset.clone(),
            cond,
            &group,
            false,
        )
        .unwrap();

        assert!(handle.next_data_block().unwrap());
        let statis = handle.data_block_statistics().unwrap();
        assert_eq!(statis.len(), 1);
        assert_eq!(statis[0].min, 1.0);
        assert_eq!(statis[0].max, 2.0);
    }

    #[test]
    fn test_descending_order() {
        let f = fixture();
        write_disk_rows(&f, &[(100, 1.0), (200, 2.0)]);
        f.buffer.append(f.id, 1, row(300, 3.0), 300);

        let group = TableGroup::single(f.id);
        let cond = QueryCond::new(TimeWindow::all(), ScanOrder::Desc, vec![0]);
        let mut handle = QueryHandle::open(
            f.directory.clone(),
            f.buffer.clone(),
            f.fileset.clone(),
            cond,
            &group,
            false,
        )
        .unwrap();
        let ts = collect_ts(&mut handle);
        assert_eq!(ts, vec![300, 200, 100]);
    }

    #[test]
    fn test_empty_group_yields_no_blocks() {
        let f = fixture();
        let group = TableGroup::default();
        let cond = QueryCond::new(TimeWindow::all(), ScanOrder::Asc, vec![]);
        let mut handle = QueryHandle::open(
            f.directory.clone(),
            f.buffer.clone(),
            f.fileset.clone(),
            cond,
            &group,
            false,
        )
        .unwrap();
        assert!(!handle.next_data_block().unwrap());
    }

    #[test]
    fn test_last_row_across_sources() {
        let f = fixture();
        write_disk_rows(&f, &[(100, 1.0), (200, 2.0)]);
        f.buffer.append(f.id, 1, row(250, 9.0), 250);

        let group = TableGroup::single(f.id);
        // window ends before the buffered row; the disk row at 200 wins...
        let cond = QueryCond::new(TimeWindow::new(0, 220), ScanOrder::Asc, vec![]);
        let mut handle = QueryHandle::open(
            f.directory.clone(),
            f.buffer.clone(),
            f.fileset.clone(),
            cond,
            &group,
            true,
        )
        .unwrap();
        assert!(handle.next_data_block().unwrap());
        let info = handle.data_block_info().unwrap();
        assert_eq!(info.rows, 1);
        assert_eq!(info.window, TimeWindow::new(200, 200));
        assert!(!handle.next_data_block().unwrap());

        // ...and a wider window makes the buffered row the last one
        let cond = QueryCond::new(TimeWindow::new(0, 300), ScanOrder::Asc, vec![]);
        let mut handle = QueryHandle::open(
            f.directory.clone(),
            f.buffer.clone(),
            f.fileset.clone(),
            cond,
            &group,
            true,
        )
        .unwrap();
        assert!(handle.next_data_block().unwrap());
        let columns = handle.data_block(&[]).unwrap();
        assert_eq!(columns[1].values, vec![ColumnValue::Float(9.0)]);
    }

    #[test]
    fn test_invalid_window_rejected() {
        let f = fixture();
        let group = TableGroup::single(f.id);
        let cond = QueryCond::new(TimeWindow::new(100, 50), ScanOrder::Asc, vec![]);
        let result = QueryHandle::open(
            f.directory.clone(),
            f.buffer.clone(),
            f.fileset.clone(),
            cond,
            &group,
            false,
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
