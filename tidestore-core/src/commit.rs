//! Commit state machine and background commit worker
//!
//! Buffered rows move to durable file groups through
//! `Idle -> CommitStart -> CommitOver -> Idle`. The worker owns one thread
//! fed by a channel; a commit drains the buffer into a fresh generation,
//! so new writes are never blocked by a commit in progress. Transient I/O
//! failures retry a bounded number of times; a final failure restores the
//! un-durable rows into the buffer and marks the repository write-faulted.

use crate::buffer::{BufRow, CommitSet, MemBuffer};
use crate::fileset::{BlockBuilder, FileSet, FinishedBlock};
use crate::meta::TableDirectory;
use crate::schema::RowData;
use crate::{Error, RepoCfg, Result, TableId, TimePrecision, Timestamp};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

/// How often a failed group write is retried before the commit fails
const COMMIT_MAX_RETRIES: usize = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(20);

/// Commit state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Idle = 0,
    CommitStart = 1,
    CommitOver = 2,
}

impl CommitState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => CommitState::CommitStart,
            2 => CommitState::CommitOver,
            _ => CommitState::Idle,
        }
    }
}

/// What one commit wrote
#[derive(Debug, Default, Clone)]
pub struct CommitSummary {
    pub tables: usize,
    pub blocks: usize,
    pub rows: usize,
}

/// Notification contract to the management/continuous-query collaborator
pub trait RepoListener: Send + Sync {
    /// Fired when buffered rows begin moving to disk
    fn on_commit_start(&self) {}
    /// Fired when a commit finished, successfully or not
    fn on_commit_over(&self, _result: &Result<CommitSummary>) {}
    /// Fired after a schema or membership change
    fn on_schema_changed(&self, _table: TableId) {}
}

/// Listener that ignores every notification
pub struct NoopListener;

impl RepoListener for NoopListener {}

/// Current wall time in the repository's precision
pub(crate) fn now_ticks(precision: TimePrecision) -> Timestamp {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    match precision {
        TimePrecision::Millis => now.as_millis() as i64,
        TimePrecision::Micros => now.as_micros() as i64,
        TimePrecision::Nanos => now.as_nanos() as i64,
    }
}

/// Everything the commit worker touches
pub(crate) struct CommitEnv {
    pub cfg: Arc<RwLock<RepoCfg>>,
    pub buffer: Arc<MemBuffer>,
    pub fileset: Arc<FileSet>,
    pub directory: Arc<TableDirectory>,
    pub listener: Arc<dyn RepoListener>,
    pub state: Arc<AtomicU8>,
    pub write_fault: Arc<AtomicBool>,
}

enum CommitMsg {
    Commit(Option<Sender<Result<CommitSummary>>>),
    Shutdown,
}

/// Handle to the background commit worker
pub(crate) struct Committer {
    tx: Sender<CommitMsg>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Committer {
    /// Spawn the worker thread
    pub fn start(env: Arc<CommitEnv>) -> Committer {
        let (tx, rx) = unbounded();
        let handle = std::thread::Builder::new()
            .name("tidestore-commit".into())
            .spawn(move || worker_loop(env, rx))
            .expect("spawn commit worker");
        Committer {
            tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Schedule a commit without waiting for it
    pub fn request_commit(&self) {
        let _ = self.tx.send(CommitMsg::Commit(None));
    }

    /// Run a commit and wait for its outcome
    pub fn commit_and_wait(&self) -> Result<CommitSummary> {
        let (ack_tx, ack_rx) = bounded(1);
        self.tx
            .send(CommitMsg::Commit(Some(ack_tx)))
            .map_err(|_| Error::InvalidArgument("repository is closed".into()))?;
        ack_rx
            .recv()
            .map_err(|_| Error::InvalidArgument("commit worker stopped".into()))?
    }

    /// Stop the worker; pending requests are drained first
    pub fn shutdown(&self) {
        let _ = self.tx.send(CommitMsg::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(env: Arc<CommitEnv>, rx: Receiver<CommitMsg>) {
    loop {
        let interval = Duration::from_secs(env.cfg.read().commit_interval_secs.max(1));
        match rx.recv_timeout(interval) {
            Ok(CommitMsg::Commit(ack)) => {
                let result = run_commit(&env);
                if let Some(ack) = ack {
                    let _ = ack.send(result);
                }
            }
            Ok(CommitMsg::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => {
                let aged = env
                    .buffer
                    .age()
                    .map(|age| age >= interval)
                    .unwrap_or(false);
                if aged {
                    let _ = run_commit(&env);
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn run_commit(env: &CommitEnv) -> Result<CommitSummary> {
    if env.buffer.is_empty() {
        return Ok(CommitSummary::default());
    }

    env.state
        .store(CommitState::CommitStart as u8, Ordering::Release);
    env.listener.on_commit_start();

    let result = commit_once(env);

    env.state
        .store(CommitState::CommitOver as u8, Ordering::Release);
    env.listener.on_commit_over(&result);
    env.state.store(CommitState::Idle as u8, Ordering::Release);

    match &result {
        Ok(summary) => {
            info!(
                tables = summary.tables,
                blocks = summary.blocks,
                rows = summary.rows,
                "commit finished"
            );
            run_sweep(env);
        }
        Err(e) => {
            env.write_fault.store(true, Ordering::Release);
            warn!("commit failed, repository write-faulted: {}", e);
        }
    }
    result
}

fn run_sweep(env: &CommitEnv) {
    let cfg = env.cfg.read().clone();
    let tpd = cfg.precision.ticks_per_day();
    let now = now_ticks(cfg.precision);
    let summary = env.fileset.sweep(
        now,
        cfg.keep as i64 * tpd,
        cfg.keep1 as i64 * tpd,
        cfg.keep2 as i64 * tpd,
    );
    if summary.expired > 0 || summary.relocated > 0 {
        info!(
            expired = summary.expired,
            relocated = summary.relocated,
            "retention sweep"
        );
    }
}

struct GroupPayload {
    fid: i64,
    blocks: Vec<FinishedBlock>,
    rows: Vec<(TableId, Timestamp, BufRow)>,
}

fn commit_once(env: &CommitEnv) -> Result<CommitSummary> {
    let cfg = env.cfg.read().clone();
    let set = env.buffer.drain();
    if set.is_empty() {
        return Ok(CommitSummary::default());
    }

    let payloads = match build_payloads(env, &cfg, &set) {
        Ok(payloads) => payloads,
        Err(e) => {
            env.buffer.restore(set);
            return Err(e);
        }
    };
    // the drained set is consumed; rows needing restore live in the payloads
    drop(set);

    let mut summary = CommitSummary::default();
    let mut touched = std::collections::HashSet::new();
    for (i, payload) in payloads.iter().enumerate() {
        if let Err(e) = write_group(env, payload) {
            // everything from the failed group onward is not durable
            restore_payloads(env, &payloads[i..]);
            return Err(e);
        }
        summary.blocks += payload.blocks.len();
        summary.rows += payload.rows.len();
        for (id, _, _) in &payload.rows {
            touched.insert(id.uid);
        }
    }
    summary.tables = touched.len();
    Ok(summary)
}

/// Turn drained rows into per-group block payloads. Blocks are cut at
/// `max_rows_per_block`, never span a file-group boundary or a schema
/// version change, and a trailing fragment smaller than
/// `min_rows_per_block` folds into its predecessor when one exists.
fn build_payloads(
    env: &CommitEnv,
    cfg: &RepoCfg,
    set: &CommitSet,
) -> Result<Vec<GroupPayload>> {
    let mut by_group: BTreeMap<i64, GroupPayload> = BTreeMap::new();

    for (id, rows) in &set.tables {
        let table = match env.directory.table(id.uid) {
            Ok(table) => table,
            Err(_) => {
                // dropped while buffered; its rows age out with it
                warn!(uid = id.uid, "skipping buffered rows of dropped table");
                continue;
            }
        };

        // runs of consecutive rows sharing a file group and schema version
        let mut runs: Vec<(i64, i32, Vec<(Timestamp, RowData)>)> = Vec::new();
        for (ts, buf_row) in rows {
            let fid = env.fileset.fid_for(*ts);
            match runs.last_mut() {
                Some((run_fid, run_ver, items))
                    if *run_fid == fid
                        && *run_ver == buf_row.sversion
                        && items.len() < cfg.max_rows_per_block =>
                {
                    items.push((*ts, buf_row.row.clone()));
                }
                _ => runs.push((fid, buf_row.sversion, vec![(*ts, buf_row.row.clone())])),
            }
        }

        // fold an undersized trailing run into its predecessor
        if runs.len() >= 2 {
            let last = runs.len() - 1;
            let (last_fid, last_ver, last_len) =
                (runs[last].0, runs[last].1, runs[last].2.len());
            let prev = &runs[last - 1];
            if last_len < cfg.min_rows_per_block
                && prev.0 == last_fid
                && prev.1 == last_ver
                && prev.2.len() + last_len <= cfg.max_rows_per_block
            {
                let tail = runs.pop().expect("two runs").2;
                runs.last_mut().expect("one run").2.extend(tail);
            }
        }

        for (fid, sversion, items) in runs {
            let schema = env.directory.row_schema(&table, Some(sversion))?;
            let mut builder =
                BlockBuilder::new(*id, schema, sversion, env.fileset.compression());
            for (ts, row) in &items {
                builder.push_row(*ts, row);
            }
            let block = builder.finish()?;

            let payload = by_group.entry(fid).or_insert_with(|| GroupPayload {
                fid,
                blocks: Vec::new(),
                rows: Vec::new(),
            });
            payload.blocks.push(block);
            payload.rows.extend(
                items
                    .into_iter()
                    .map(|(ts, row)| (*id, ts, BufRow { sversion, row })),
            );
        }
    }

    Ok(by_group.into_values().collect())
}

fn write_group(env: &CommitEnv, payload: &GroupPayload) -> Result<()> {
    let mut attempt = 0;
    loop {
        let result = env
            .fileset
            .group_for_write(payload.fid)
            .and_then(|group| env.fileset.append_blocks(&group, &payload.blocks));
        match result {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt + 1 < COMMIT_MAX_RETRIES => {
                attempt += 1;
                warn!(
                    fid = payload.fid,
                    attempt, "group write failed, retrying: {}", e
                );
                std::thread::sleep(RETRY_BACKOFF);
            }
            Err(e) => return Err(e),
        }
    }
}

fn restore_payloads(env: &CommitEnv, payloads: &[GroupPayload]) {
    let mut tables: BTreeMap<TableId, BTreeMap<Timestamp, BufRow>> = BTreeMap::new();
    for payload in payloads {
        for (id, ts, row) in &payload.rows {
            tables.entry(*id).or_default().insert(*ts, row.clone());
        }
    }
    let bytes = tables
        .iter()
        .flat_map(|(_, rows)| rows.values())
        .map(|r| r.row.size() + 8)
        .sum();
    env.buffer.restore(CommitSet {
        tables: tables.into_iter().collect(),
        bytes,
    });
}
