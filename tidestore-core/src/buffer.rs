//! In-memory write buffer
//!
//! Accepted rows live here, partitioned by table and ordered by timestamp,
//! until the commit machinery drains them into file groups. Writers to
//! different tables never contend: each table has its own lock. A duplicate
//! timestamp overwrites the buffered row (last write wins).

use crate::schema::RowData;
use crate::{TableId, Timestamp};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A buffered row and the schema version it was validated against
#[derive(Debug, Clone)]
pub struct BufRow {
    pub sversion: i32,
    pub row: RowData,
}

/// Rows buffered for one table
pub struct TableBuffer {
    id: TableId,
    rows: Mutex<BTreeMap<Timestamp, BufRow>>,
    bytes: AtomicUsize,
}

impl TableBuffer {
    fn new(id: TableId) -> Self {
        Self {
            id,
            rows: Mutex::new(BTreeMap::new()),
            bytes: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    /// Buffered bytes for this table
    pub fn size(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Clone the buffered rows inside a window, in ascending timestamp order
    pub fn snapshot(&self, start: Timestamp, end: Timestamp) -> Vec<(Timestamp, BufRow)> {
        let rows = self.rows.lock();
        rows.range(start..=end)
            .map(|(ts, row)| (*ts, row.clone()))
            .collect()
    }

    /// The most recent buffered timestamp, if any
    pub fn last_key(&self) -> Option<Timestamp> {
        self.rows.lock().keys().next_back().copied()
    }
}

/// Rows drained from the buffer for one commit
pub struct CommitSet {
    pub tables: Vec<(TableId, BTreeMap<Timestamp, BufRow>)>,
    pub bytes: usize,
}

impl CommitSet {
    pub fn is_empty(&self) -> bool {
        self.tables.iter().all(|(_, rows)| rows.is_empty())
    }

    pub fn num_rows(&self) -> usize {
        self.tables.iter().map(|(_, rows)| rows.len()).sum()
    }
}

/// The repository-wide write buffer
pub struct MemBuffer {
    capacity: usize,
    size: AtomicUsize,
    tables: RwLock<HashMap<u64, Arc<TableBuffer>>>,
    first_write: Mutex<Option<Instant>>,
    space_lock: Mutex<()>,
    space_cond: Condvar,
}

impl MemBuffer {
    /// Create a buffer bounded at `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            size: AtomicUsize::new(0),
            tables: RwLock::new(HashMap::new()),
            first_write: Mutex::new(None),
            space_lock: Mutex::new(()),
            space_cond: Condvar::new(),
        }
    }

    /// Total buffered bytes
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the buffer holds no rows
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Whether appending `incoming` more bytes would exceed capacity
    pub fn is_full(&self, incoming: usize) -> bool {
        self.size() + incoming > self.capacity
    }

    /// Age of the oldest unbuffered-to-disk write
    pub fn age(&self) -> Option<Duration> {
        self.first_write.lock().map(|t| t.elapsed())
    }

    /// Append one validated row. Returns the buffered size afterwards.
    pub fn append(&self, id: TableId, sversion: i32, row: RowData, ts: Timestamp) -> usize {
        let table = self.table_buffer(id);
        let entry_size = row.size() + 8;

        let replaced = {
            let mut rows = table.rows.lock();
            rows.insert(ts, BufRow { sversion, row })
        };

        let delta = match replaced {
            Some(old) => {
                let old_size = old.row.size() + 8;
                table.bytes.fetch_sub(old_size, Ordering::Relaxed);
                self.size.fetch_sub(old_size, Ordering::Relaxed);
                entry_size
            }
            None => entry_size,
        };
        table.bytes.fetch_add(delta, Ordering::Relaxed);
        let total = self.size.fetch_add(delta, Ordering::Relaxed) + delta;

        let mut first = self.first_write.lock();
        if first.is_none() {
            *first = Some(Instant::now());
        }
        total
    }

    /// Handle for one table's buffered rows, if any
    pub fn get(&self, uid: u64) -> Option<Arc<TableBuffer>> {
        self.tables.read().get(&uid).cloned()
    }

    /// Swap out every table's rows for a commit. New writes land in fresh
    /// maps and are not blocked by the commit in progress.
    pub fn drain(&self) -> CommitSet {
        let buffers: Vec<Arc<TableBuffer>> = self.tables.read().values().cloned().collect();

        let mut tables = Vec::with_capacity(buffers.len());
        let mut bytes = 0usize;
        for buffer in buffers {
            let rows = std::mem::take(&mut *buffer.rows.lock());
            if rows.is_empty() {
                continue;
            }
            let table_bytes = buffer.bytes.swap(0, Ordering::Relaxed);
            bytes += table_bytes;
            tables.push((buffer.id, rows));
        }
        tables.sort_by_key(|(id, _)| id.tid);

        self.size.fetch_sub(bytes, Ordering::Relaxed);
        *self.first_write.lock() = None;
        self.space_cond.notify_all();

        CommitSet { tables, bytes }
    }

    /// Put a failed commit's rows back so a retry can pick them up. Rows
    /// re-written while the commit was in flight win over restored ones.
    pub fn restore(&self, set: CommitSet) {
        let mut restored = 0usize;
        for (id, rows) in set.tables {
            let table = self.table_buffer(id);
            let mut live = table.rows.lock();
            for (ts, row) in rows {
                if let std::collections::btree_map::Entry::Vacant(slot) = live.entry(ts) {
                    let size = row.row.size() + 8;
                    slot.insert(row);
                    table.bytes.fetch_add(size, Ordering::Relaxed);
                    restored += size;
                }
            }
        }
        if restored > 0 {
            self.size.fetch_add(restored, Ordering::Relaxed);
            let mut first = self.first_write.lock();
            if first.is_none() {
                *first = Some(Instant::now());
            }
        }
    }

    /// Block until buffered bytes drop below capacity or the timeout
    /// elapses. Returns whether space is available.
    pub fn wait_for_space(&self, incoming: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.space_lock.lock();
        while self.is_full(incoming) {
            if self
                .space_cond
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                return !self.is_full(incoming);
            }
        }
        true
    }

    fn table_buffer(&self, id: TableId) -> Arc<TableBuffer> {
        if let Some(buffer) = self.tables.read().get(&id.uid) {
            return buffer.clone();
        }
        let mut tables = self.tables.write();
        tables
            .entry(id.uid)
            .or_insert_with(|| Arc::new(TableBuffer::new(id)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnValue;

    fn row(ts: Timestamp, v: f64) -> RowData {
        RowData::new(vec![ColumnValue::Timestamp(ts), ColumnValue::Float(v)])
    }

    #[test]
    fn test_append_ordering_and_dedup() {
        let buffer = MemBuffer::new(1 << 20);
        let id = TableId::new(1, 1);

        buffer.append(id, 1, row(30, 3.0), 30);
        buffer.append(id, 1, row(10, 1.0), 10);
        buffer.append(id, 1, row(20, 2.0), 20);
        // overwrite ts=10
        buffer.append(id, 1, row(10, 9.0), 10);

        let table = buffer.get(1).unwrap();
        let rows = table.snapshot(i64::MIN, i64::MAX);
        let keys: Vec<_> = rows.iter().map(|(ts, _)| *ts).collect();
        assert_eq!(keys, vec![10, 20, 30]);
        assert_eq!(
            rows[0].1.row.values[1],
            ColumnValue::Float(9.0),
            "last write wins"
        );
        assert_eq!(table.last_key(), Some(30));
    }

    #[test]
    fn test_drain_and_restore() {
        let buffer = MemBuffer::new(1 << 20);
        let id = TableId::new(1, 1);
        for i in 0..10 {
            buffer.append(id, 1, row(i, i as f64), i);
        }
        assert!(!buffer.is_empty());

        let set = buffer.drain();
        assert!(buffer.is_empty());
        assert_eq!(set.num_rows(), 10);

        // a write while the commit is in flight
        buffer.append(id, 1, row(5, 55.0), 5);

        buffer.restore(set);
        let table = buffer.get(1).unwrap();
        let rows = table.snapshot(i64::MIN, i64::MAX);
        assert_eq!(rows.len(), 10);
        // the in-flight write survived the restore
        assert_eq!(rows[5].1.row.values[1], ColumnValue::Float(55.0));
    }

    #[test]
    fn test_size_accounting() {
        let buffer = MemBuffer::new(1 << 20);
        let id = TableId::new(1, 1);

        buffer.append(id, 1, row(1, 1.0), 1);
        let single = buffer.size();
        assert!(single > 0);

        // overwriting the same timestamp keeps the total stable
        buffer.append(id, 1, row(1, 2.0), 1);
        assert_eq!(buffer.size(), single);

        buffer.drain();
        assert_eq!(buffer.size(), 0);
    }

    #[test]
    fn test_backpressure_wait() {
        let buffer = Arc::new(MemBuffer::new(64));
        let id = TableId::new(1, 1);
        buffer.append(id, 1, row(1, 1.0), 1);
        assert!(buffer.is_full(64));

        let waiter = buffer.clone();
        let handle = std::thread::spawn(move || {
            waiter.wait_for_space(32, Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(50));
        buffer.drain();
        assert!(handle.join().unwrap());
    }
}
