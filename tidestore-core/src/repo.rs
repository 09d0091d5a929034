//! Repository lifecycle and the write path
//!
//! A repository is one storage instance rooted at a directory: a table
//! directory, a bounded write buffer, a file set and a background commit
//! worker. It is created once, opened into a shared handle, written
//! through [`Repository::insert`] and read through query handles.

use crate::buffer::MemBuffer;
use crate::commit::{
    now_ticks, CommitEnv, CommitState, CommitSummary, Committer, NoopListener, RepoListener,
};
use crate::fileset::{FileEntry, FileSet, SweepSummary};
use crate::meta::{TableCfg, TableDirectory, TableKind};
use crate::query::{QueryCond, QueryHandle, TableGroup};
use crate::schema::{ColumnType, ColumnValue, RowData};
use crate::tags::{self, TagCond, TagCondEvaluator};
use crate::{Error, RepoCfg, RepoCfgPatch, Result, TableId, Timestamp};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const CONFIG_FILE: &str = "config.json";
/// How long an insert waits for the buffer to drain under backpressure
const BACKPRESSURE_WAIT: Duration = Duration::from_secs(5);

/// Rows for one table within a submission batch
#[derive(Debug, Clone)]
pub struct SubmitBlock {
    pub table: TableId,
    /// Schema version the client built the rows against
    pub sversion: i32,
    pub rows: Vec<RowData>,
}

impl SubmitBlock {
    pub fn new(table: TableId, sversion: i32, rows: Vec<RowData>) -> Self {
        Self {
            table,
            sversion,
            rows,
        }
    }
}

/// A batched submission, grouped by table
#[derive(Debug, Clone, Default)]
pub struct SubmitBatch {
    pub blocks: Vec<SubmitBlock>,
}

impl SubmitBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, block: SubmitBlock) {
        self.blocks.push(block);
    }

    pub fn num_rows(&self) -> usize {
        self.blocks.iter().map(|b| b.rows.len()).sum()
    }
}

/// Collaborators supplied when opening a repository
pub struct OpenOptions {
    pub listener: Arc<dyn RepoListener>,
    pub tag_evaluator: Option<Arc<dyn TagCondEvaluator>>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            listener: Arc::new(NoopListener),
            tag_evaluator: None,
        }
    }
}

/// Configuration snapshot and sizes of a repository
#[derive(Debug, Clone)]
pub struct RepoInfo {
    pub cfg: RepoCfg,
    pub version: String,
    /// Uncompressed bytes: buffered rows plus committed block payloads
    pub total_data_size: u64,
    /// Bytes the file set occupies on disk
    pub total_disk_size: u64,
}

/// Per-table report
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub id: TableId,
    pub name: String,
    pub kind: TableKind,
    pub schema_version: Option<i32>,
    pub last_key: Option<Timestamp>,
    pub disk_blocks: usize,
    pub disk_rows: u64,
    pub buffered_bytes: usize,
}

/// One storage instance rooted at a directory
pub struct Repository {
    root: PathBuf,
    cfg: Arc<RwLock<RepoCfg>>,
    directory: Arc<TableDirectory>,
    buffer: Arc<MemBuffer>,
    fileset: Arc<FileSet>,
    committer: Committer,
    listener: Arc<dyn RepoListener>,
    evaluator: Option<Arc<dyn TagCondEvaluator>>,
    state: Arc<AtomicU8>,
    write_fault: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl Repository {
    /// Initialize a repository root: write the config and the directory
    /// skeleton. Refuses a root that is already initialized.
    pub fn create(root: &Path, cfg: &RepoCfg) -> Result<()> {
        cfg.validate()?;
        let config_path = root.join(CONFIG_FILE);
        if config_path.exists() {
            return Err(Error::InvalidArgument(format!(
                "repository already initialized at {:?}",
                root
            )));
        }
        std::fs::create_dir_all(root)?;
        FileSet::create(root)?;
        let json = serde_json::to_string_pretty(cfg)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        std::fs::write(&config_path, json)?;
        info!(root = %root.display(), "created repository");
        Ok(())
    }

    /// Open a created repository, starting its commit worker
    pub fn open(root: &Path, options: OpenOptions) -> Result<Arc<Repository>> {
        let config_path = root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(Error::NotFound(format!("repository at {:?}", root)));
        }
        let json = std::fs::read_to_string(&config_path)?;
        let cfg: RepoCfg =
            serde_json::from_str(&json).map_err(|e| Error::Corrupted(e.to_string()))?;
        cfg.validate()?;

        let directory = Arc::new(TableDirectory::load(root, cfg.max_tables)?);
        let fileset = Arc::new(FileSet::open(root, cfg.group_span(), cfg.compression)?);
        let buffer = Arc::new(MemBuffer::new(cfg.buffer_capacity()));
        let cfg = Arc::new(RwLock::new(cfg));
        let state = Arc::new(AtomicU8::new(CommitState::Idle as u8));
        let write_fault = Arc::new(AtomicBool::new(false));
        let listener = options.listener;

        let committer = Committer::start(Arc::new(CommitEnv {
            cfg: cfg.clone(),
            buffer: buffer.clone(),
            fileset: fileset.clone(),
            directory: directory.clone(),
            listener: listener.clone(),
            state: state.clone(),
            write_fault: write_fault.clone(),
        }));

        info!(root = %root.display(), "opened repository");
        Ok(Arc::new(Repository {
            root: root.to_path_buf(),
            cfg,
            directory,
            buffer,
            fileset,
            committer,
            listener,
            evaluator: options.tag_evaluator,
            state,
            write_fault,
            closed: AtomicBool::new(false),
        }))
    }

    /// Close the repository, optionally forcing a final commit. Idempotent.
    pub fn close(&self, commit: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = if commit {
            self.committer.commit_and_wait().map(|_| ())
        } else {
            Ok(())
        };
        self.committer.shutdown();
        self.directory.save()?;
        info!(root = %self.root.display(), "closed repository");
        result
    }

    /// Destroy the repository on disk. Refuses while other repository or
    /// query handles are still open.
    pub fn destroy(repo: Arc<Repository>) -> Result<()> {
        let repo = Arc::try_unwrap(repo).map_err(|_| {
            Error::InvalidArgument("repository handles still open".into())
        })?;
        repo.close(false)?;
        if Arc::strong_count(&repo.fileset) > 1 {
            return Err(Error::InvalidArgument(
                "query handles still open".into(),
            ));
        }
        std::fs::remove_dir_all(&repo.root)?;
        info!(root = %repo.root.display(), "destroyed repository");
        Ok(())
    }

    /// Apply the runtime-mutable configuration subset. Clears a write
    /// fault and re-runs the retention sweep under the new thresholds.
    pub fn reconfigure(&self, patch: &RepoCfgPatch) -> Result<()> {
        {
            let mut cfg = self.cfg.write();
            let mut next = cfg.clone();
            if let Some(keep) = patch.keep {
                next.keep = keep;
            }
            if let Some(keep1) = patch.keep1 {
                next.keep1 = keep1;
            }
            if let Some(keep2) = patch.keep2 {
                next.keep2 = keep2;
            }
            if let Some(interval) = patch.commit_interval_secs {
                next.commit_interval_secs = interval;
            }
            if let Some(min_rows) = patch.min_rows_per_block {
                next.min_rows_per_block = min_rows;
            }
            if let Some(max_rows) = patch.max_rows_per_block {
                next.max_rows_per_block = max_rows;
            }
            next.validate()?;
            *cfg = next;
        }
        self.write_fault.store(false, Ordering::Release);
        self.retention_sweep();
        info!("reconfigured repository");
        Ok(())
    }

    /// Current commit state, for replication/notification collaborators
    pub fn commit_state(&self) -> CommitState {
        CommitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Force a commit and wait for its outcome
    pub fn commit(&self) -> Result<CommitSummary> {
        self.committer.commit_and_wait()
    }

    /// Run the retention sweep now
    pub fn retention_sweep(&self) -> SweepSummary {
        let cfg = self.cfg.read().clone();
        let tpd = cfg.precision.ticks_per_day();
        self.fileset.sweep(
            now_ticks(cfg.precision),
            cfg.keep as i64 * tpd,
            cfg.keep1 as i64 * tpd,
            cfg.keep2 as i64 * tpd,
        )
    }

    // ------------------------------------------------------------------
    // table management
    // ------------------------------------------------------------------

    /// Create a table; fires the membership-change notification
    pub fn create_table(&self, cfg: TableCfg) -> Result<TableId> {
        let id = self.directory.create_table(cfg)?;
        self.listener.on_schema_changed(id);
        Ok(id)
    }

    /// Drop a table. Its committed blocks are not purged; they age out
    /// via retention.
    pub fn drop_table(&self, id: TableId) -> Result<()> {
        self.directory.drop_table(id)?;
        self.listener.on_schema_changed(id);
        Ok(())
    }

    /// Alter a table's schema to a new version; old versions stay readable
    pub fn alter_table(&self, cfg: TableCfg) -> Result<()> {
        let id = cfg.table_id;
        self.directory.alter_table(cfg)?;
        self.listener.on_schema_changed(id);
        Ok(())
    }

    /// Read-only name lookup
    pub fn table_name(&self, id: TableId) -> Result<String> {
        self.directory.table_name(id)
    }

    /// Read-only tag value lookup
    pub fn table_tag_value(&self, id: TableId, col_id: i16) -> Result<(ColumnType, ColumnValue)> {
        self.directory.table_tag_value(id, col_id)
    }

    /// Last written timestamp of a table, `None` before any write
    pub fn table_last_key(&self, uid: u64) -> Result<Option<Timestamp>> {
        Ok(self.directory.table(uid)?.last_key())
    }

    // ------------------------------------------------------------------
    // write path
    // ------------------------------------------------------------------

    /// Insert a batched submission. Returns the number of rows accepted.
    /// The first invalid row fails the whole batch; the error reports how
    /// many rows were accepted before it. A single row is never partially
    /// applied.
    pub fn insert(&self, batch: &SubmitBatch) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::InvalidArgument("repository is closed".into()));
        }
        if self.write_fault.load(Ordering::Acquire) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "repository is write-faulted; reconfigure to clear",
            )));
        }

        let incoming: usize = batch
            .blocks
            .iter()
            .flat_map(|b| b.rows.iter())
            .map(|r| r.size() + 8)
            .sum();
        if self.buffer.is_full(incoming) {
            self.committer.request_commit();
            if !self.buffer.wait_for_space(incoming, BACKPRESSURE_WAIT) {
                return Err(Error::LimitExceeded("write buffer is full".into()));
            }
        }

        let mut accepted = 0usize;
        for block in &batch.blocks {
            let table = self
                .directory
                .table(block.table.uid)
                .map_err(|e| with_accepted(e, accepted))?;
            if table.id() != block.table {
                return Err(with_accepted(
                    Error::NotFound(format!("table {}", block.table)),
                    accepted,
                ));
            }
            if table.kind() == TableKind::Super {
                return Err(Error::InvalidArgument(format!(
                    "table {:?} is a super table and holds no rows",
                    table.name()
                )));
            }

            let schema = self
                .directory
                .row_schema(&table, None)
                .map_err(|e| with_accepted(e, accepted))?;
            if block.sversion != schema.version {
                return Err(Error::schema_mismatch(
                    format!(
                        "submission uses schema version {}, table is at {}",
                        block.sversion, schema.version
                    ),
                    accepted,
                ));
            }

            for row in &block.rows {
                schema
                    .validate_row(row)
                    .map_err(|e| with_accepted(e, accepted))?;
                if row.size() > crate::config::MAX_ROW_BYTES {
                    return Err(Error::LimitExceeded(format!(
                        "row of {} bytes exceeds the {} byte limit",
                        row.size(),
                        crate::config::MAX_ROW_BYTES
                    )));
                }
                let ts = row.timestamp()?;
                self.buffer.append(table.id(), schema.version, row.clone(), ts);
                table.observe_key(ts);
                accepted += 1;
            }

            // a single table outgrowing one cache block also triggers a commit
            let table_full = self
                .buffer
                .get(block.table.uid)
                .map(|t| t.size() > self.cfg.read().cache_block_size)
                .unwrap_or(false);
            if table_full {
                self.committer.request_commit();
            }
        }

        // past three quarters of the bound, ask for an asynchronous commit
        if self.buffer.size() * 4 > self.buffer.capacity() * 3 {
            self.committer.request_commit();
        }
        Ok(accepted)
    }

    // ------------------------------------------------------------------
    // read path
    // ------------------------------------------------------------------

    /// Open a block iterator over the group. The group is borrowed, not
    /// copied; it must outlive the handle.
    pub fn query_tables<'g>(
        &self,
        cond: QueryCond,
        group: &'g TableGroup,
    ) -> Result<QueryHandle<'g>> {
        QueryHandle::open(
            self.directory.clone(),
            self.buffer.clone(),
            self.fileset.clone(),
            cond,
            group,
            false,
        )
    }

    /// Iterator yielding at most one row per table: the most recent
    /// qualifying one.
    pub fn query_last_row<'g>(
        &self,
        cond: QueryCond,
        group: &'g TableGroup,
    ) -> Result<QueryHandle<'g>> {
        QueryHandle::open(
            self.directory.clone(),
            self.buffer.clone(),
            self.fileset.clone(),
            cond,
            group,
            true,
        )
    }

    /// Resolve a super table and an optional opaque tag predicate into a
    /// table group, partitioned by the `group_by` tag columns.
    pub fn query_super_table_by_tag_cond(
        &self,
        super_uid: u64,
        cond: Option<TagCond<'_>>,
        group_by: &[i16],
    ) -> Result<TableGroup> {
        tags::query_super_table_by_tag_cond(
            &self.directory,
            self.evaluator.as_deref(),
            super_uid,
            cond,
            group_by,
        )
    }

    /// Single-table group for a normal-table query
    pub fn one_table_group(&self, uid: u64) -> Result<TableGroup> {
        tags::one_table_group(&self.directory, uid)
    }

    // ------------------------------------------------------------------
    // introspection
    // ------------------------------------------------------------------

    /// Configuration snapshot plus logical and physical sizes
    pub fn repo_info(&self) -> RepoInfo {
        RepoInfo {
            cfg: self.cfg.read().clone(),
            version: crate::VERSION.to_string(),
            total_data_size: self.fileset.total_raw_bytes() + self.buffer.size() as u64,
            total_disk_size: self.fileset.total_disk_size(),
        }
    }

    /// Per-table report
    pub fn table_info(&self, uid: u64) -> Result<TableInfo> {
        let table = self.directory.table(uid)?;
        let mut disk_blocks = 0usize;
        let mut disk_rows = 0u64;
        for group in self.fileset.all_groups() {
            for entry in group.index().iter() {
                if entry.table.uid == uid {
                    disk_blocks += 1;
                    disk_rows += entry.rows as u64;
                }
            }
        }
        let schema_version = match table.super_uid() {
            Some(super_uid) => self.directory.table(super_uid)?.current_version(),
            None => table.current_version(),
        };
        Ok(TableInfo {
            id: table.id(),
            name: table.name().to_string(),
            kind: table.kind(),
            schema_version,
            last_key: table.last_key(),
            disk_blocks,
            disk_rows,
            buffered_bytes: self
                .buffer
                .get(uid)
                .map(|t| t.size())
                .unwrap_or(0),
        })
    }

    /// Incremental enumeration of on-disk file names for backup tooling
    pub fn file_info(&self, index: u32) -> Option<(FileEntry, u32)> {
        self.fileset.file_info(index)
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.committer.shutdown();
            if let Err(e) = self.directory.save() {
                warn!("failed to persist table directory on drop: {}", e);
            }
        }
    }
}

fn with_accepted(error: Error, accepted: usize) -> Error {
    match error {
        Error::SchemaMismatch { reason, .. } => Error::SchemaMismatch { reason, accepted },
        other => other,
    }
}
