//! Table directory
//!
//! Maps table uids, short ids and names to schema, tag values and
//! super-table linkage. The directory is persisted to `meta.tds` as a
//! checksummed snapshot on every mutation and reloaded on open, so the
//! create-then-open lifecycle survives restarts. Table handles are
//! `Arc<Table>`; a dropped table's memory goes away with its last handle.

use crate::schema::{ColumnType, ColumnValue, RowData, Schema};
use crate::{Error, Result, TableId, Timestamp};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

const META_MAGIC: &[u8; 4] = b"TDSM";
const META_VERSION: u32 = 1;

/// Table kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableKind {
    /// Standalone table with its own row schema
    Normal,
    /// Template table; holds row and tag schemas, never holds rows itself
    Super,
    /// Concrete table instantiated from a super table
    Child,
}

/// Table creation / alteration configuration
#[derive(Debug, Clone)]
pub struct TableCfg {
    pub kind: TableKind,
    pub name: String,
    pub table_id: TableId,
    pub super_uid: Option<u64>,
    pub schema: Option<Schema>,
    pub tag_schema: Option<Schema>,
    pub tag_values: Option<RowData>,
}

impl TableCfg {
    /// Configuration for a normal table
    pub fn normal(name: impl Into<String>, table_id: TableId, schema: Schema) -> Self {
        Self {
            kind: TableKind::Normal,
            name: name.into(),
            table_id,
            super_uid: None,
            schema: Some(schema),
            tag_schema: None,
            tag_values: None,
        }
    }

    /// Configuration for a super (template) table
    pub fn super_table(
        name: impl Into<String>,
        table_id: TableId,
        schema: Schema,
        tag_schema: Schema,
    ) -> Self {
        Self {
            kind: TableKind::Super,
            name: name.into(),
            table_id,
            super_uid: None,
            schema: Some(schema),
            tag_schema: Some(tag_schema),
            tag_values: None,
        }
    }

    /// Configuration for a child table instantiated from a super table
    pub fn child(
        name: impl Into<String>,
        table_id: TableId,
        super_uid: u64,
        tag_values: RowData,
    ) -> Self {
        Self {
            kind: TableKind::Child,
            name: name.into(),
            table_id,
            super_uid: Some(super_uid),
            schema: None,
            tag_schema: None,
            tag_values: Some(tag_values),
        }
    }
}

/// A registered table
pub struct Table {
    id: TableId,
    name: String,
    kind: TableKind,
    super_uid: Option<u64>,
    /// Schema versions, ascending; empty for child tables (resolved via super)
    schemas: RwLock<Vec<Schema>>,
    tag_schema: Option<Schema>,
    tag_values: RwLock<Option<RowData>>,
    last_key: AtomicI64,
    dropped: AtomicBool,
}

impl Table {
    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn super_uid(&self) -> Option<u64> {
        self.super_uid
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    /// Current schema version of this table (child tables have none of their own)
    pub fn current_version(&self) -> Option<i32> {
        self.schemas.read().last().map(|s| s.version)
    }

    /// Resolve a schema version held by this table
    pub fn schema_for_version(&self, version: i32) -> Option<Schema> {
        self.schemas
            .read()
            .iter()
            .find(|s| s.version == version)
            .cloned()
    }

    /// The current schema held by this table
    pub fn current_schema(&self) -> Option<Schema> {
        self.schemas.read().last().cloned()
    }

    pub fn tag_schema(&self) -> Option<&Schema> {
        self.tag_schema.as_ref()
    }

    pub fn tag_values(&self) -> Option<RowData> {
        self.tag_values.read().clone()
    }

    /// Last written timestamp, `None` before any write
    pub fn last_key(&self) -> Option<Timestamp> {
        let v = self.last_key.load(Ordering::Acquire);
        (v != i64::MIN).then_some(v)
    }

    pub(crate) fn observe_key(&self, ts: Timestamp) {
        self.last_key.fetch_max(ts, Ordering::AcqRel);
    }

    fn to_meta(&self) -> TableMeta {
        TableMeta {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            super_uid: self.super_uid,
            schemas: self.schemas.read().clone(),
            tag_schema: self.tag_schema.clone(),
            tag_values: self.tag_values.read().clone(),
            last_key: self.last_key.load(Ordering::Acquire),
        }
    }

    fn from_meta(meta: TableMeta) -> Self {
        Self {
            id: meta.id,
            name: meta.name,
            kind: meta.kind,
            super_uid: meta.super_uid,
            schemas: RwLock::new(meta.schemas),
            tag_schema: meta.tag_schema,
            tag_values: RwLock::new(meta.tag_values),
            last_key: AtomicI64::new(meta.last_key),
            dropped: AtomicBool::new(false),
        }
    }
}

/// Persisted form of a table
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableMeta {
    id: TableId,
    name: String,
    kind: TableKind,
    super_uid: Option<u64>,
    schemas: Vec<Schema>,
    tag_schema: Option<Schema>,
    tag_values: Option<RowData>,
    last_key: i64,
}

#[derive(Default)]
struct DirectoryInner {
    by_uid: HashMap<u64, Arc<Table>>,
    by_tid: HashMap<u32, u64>,
    by_name: HashMap<String, u64>,
    children: HashMap<u64, Vec<u64>>,
    next_tid: u32,
}

/// The table directory of one repository
pub struct TableDirectory {
    path: PathBuf,
    max_tables: usize,
    inner: RwLock<DirectoryInner>,
}

impl TableDirectory {
    /// Create an empty directory backed by `meta.tds` under `root`
    pub fn new(root: &Path, max_tables: usize) -> Self {
        Self {
            path: root.join("meta.tds"),
            max_tables,
            inner: RwLock::new(DirectoryInner {
                next_tid: 1,
                ..DirectoryInner::default()
            }),
        }
    }

    /// Load a persisted directory; an absent meta file yields an empty directory
    pub fn load(root: &Path, max_tables: usize) -> Result<Self> {
        let dir = Self::new(root, max_tables);
        if !dir.path.exists() {
            return Ok(dir);
        }

        let data = std::fs::read(&dir.path)?;
        let metas = decode_snapshot(&data)?;
        {
            let mut inner = dir.inner.write();
            for meta in metas {
                let table = Arc::new(Table::from_meta(meta));
                inner.next_tid = inner.next_tid.max(table.id.tid + 1);
                index_table(&mut inner, table);
            }
            debug!("loaded {} tables from meta", inner.by_uid.len());
        }
        Ok(dir)
    }

    /// Number of registered tables
    pub fn count(&self) -> usize {
        self.inner.read().by_uid.len()
    }

    /// Create a table from a configuration object.
    /// Returns the assigned table id (the short id may have been allocated here).
    pub fn create_table(&self, cfg: TableCfg) -> Result<TableId> {
        let table = {
            let mut inner = self.inner.write();

            if inner.by_uid.len() >= self.max_tables {
                return Err(Error::LimitExceeded(format!(
                    "table count limit {} reached",
                    self.max_tables
                )));
            }
            if inner.by_name.contains_key(&cfg.name) {
                return Err(Error::InvalidArgument(format!(
                    "table name {:?} already exists",
                    cfg.name
                )));
            }
            if inner.by_uid.contains_key(&cfg.table_id.uid) {
                return Err(Error::InvalidArgument(format!(
                    "table uid {} already exists",
                    cfg.table_id.uid
                )));
            }

            let tid = if cfg.table_id.tid == 0 {
                let tid = inner.next_tid;
                inner.next_tid += 1;
                tid
            } else {
                if inner.by_tid.contains_key(&cfg.table_id.tid) {
                    return Err(Error::InvalidArgument(format!(
                        "short id {} already in use",
                        cfg.table_id.tid
                    )));
                }
                inner.next_tid = inner.next_tid.max(cfg.table_id.tid + 1);
                cfg.table_id.tid
            };
            let id = TableId::new(cfg.table_id.uid, tid);

            let table = match cfg.kind {
                TableKind::Normal => {
                    let schema = cfg.schema.ok_or_else(|| {
                        Error::InvalidArgument("normal table requires a schema".into())
                    })?;
                    Table {
                        id,
                        name: cfg.name,
                        kind: TableKind::Normal,
                        super_uid: None,
                        schemas: RwLock::new(vec![schema]),
                        tag_schema: None,
                        tag_values: RwLock::new(None),
                        last_key: AtomicI64::new(i64::MIN),
                        dropped: AtomicBool::new(false),
                    }
                }
                TableKind::Super => {
                    let schema = cfg.schema.ok_or_else(|| {
                        Error::InvalidArgument("super table requires a schema".into())
                    })?;
                    let tag_schema = cfg.tag_schema.ok_or_else(|| {
                        Error::InvalidArgument("super table requires a tag schema".into())
                    })?;
                    Table {
                        id,
                        name: cfg.name,
                        kind: TableKind::Super,
                        super_uid: None,
                        schemas: RwLock::new(vec![schema]),
                        tag_schema: Some(tag_schema),
                        tag_values: RwLock::new(None),
                        last_key: AtomicI64::new(i64::MIN),
                        dropped: AtomicBool::new(false),
                    }
                }
                TableKind::Child => {
                    let super_uid = cfg.super_uid.ok_or_else(|| {
                        Error::InvalidArgument("child table requires a super uid".into())
                    })?;
                    let parent = inner
                        .by_uid
                        .get(&super_uid)
                        .cloned()
                        .ok_or_else(|| Error::NotFound(format!("super table {}", super_uid)))?;
                    if parent.kind != TableKind::Super {
                        return Err(Error::InvalidArgument(format!(
                            "table {} is not a super table",
                            super_uid
                        )));
                    }
                    let tag_values = cfg.tag_values.ok_or_else(|| {
                        Error::InvalidArgument("child table requires tag values".into())
                    })?;
                    let tag_schema = parent.tag_schema.clone().expect("super has tag schema");
                    tag_schema.validate_row(&tag_values)?;
                    Table {
                        id,
                        name: cfg.name,
                        kind: TableKind::Child,
                        super_uid: Some(super_uid),
                        schemas: RwLock::new(Vec::new()),
                        tag_schema: Some(tag_schema),
                        tag_values: RwLock::new(Some(tag_values)),
                        last_key: AtomicI64::new(i64::MIN),
                        dropped: AtomicBool::new(false),
                    }
                }
            };

            let table = Arc::new(table);
            index_table(&mut inner, table.clone());
            table
        };

        self.save()?;
        info!(uid = table.id.uid, tid = table.id.tid, name = %table.name, "created table");
        Ok(table.id)
    }

    /// Drop a table. Already-written blocks are not purged; they age out
    /// via retention.
    pub fn drop_table(&self, id: TableId) -> Result<()> {
        {
            let mut inner = self.inner.write();
            let table = inner
                .by_uid
                .get(&id.uid)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("table {}", id)))?;
            if table.id.tid != id.tid {
                return Err(Error::NotFound(format!("table {}", id)));
            }
            if table.kind == TableKind::Super {
                let has_children = inner
                    .children
                    .get(&id.uid)
                    .map(|c| !c.is_empty())
                    .unwrap_or(false);
                if has_children {
                    return Err(Error::InvalidArgument(
                        "super table still has child tables".into(),
                    ));
                }
            }

            table.dropped.store(true, Ordering::Release);
            inner.by_uid.remove(&id.uid);
            inner.by_tid.remove(&id.tid);
            inner.by_name.remove(&table.name);
            if let Some(super_uid) = table.super_uid {
                if let Some(children) = inner.children.get_mut(&super_uid) {
                    children.retain(|&uid| uid != id.uid);
                }
            }
            inner.children.remove(&id.uid);
        }

        self.save()?;
        info!(uid = id.uid, tid = id.tid, "dropped table");
        Ok(())
    }

    /// Alter a table: append a new schema version. Rows committed under
    /// prior versions stay readable through `schema_for_version`.
    pub fn alter_table(&self, cfg: TableCfg) -> Result<()> {
        {
            let inner = self.inner.read();
            let table = inner
                .by_uid
                .get(&cfg.table_id.uid)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("table uid {}", cfg.table_id.uid)))?;
            if table.kind == TableKind::Child {
                return Err(Error::InvalidArgument(
                    "child tables are altered through their super table".into(),
                ));
            }
            let schema = cfg
                .schema
                .ok_or_else(|| Error::InvalidArgument("alter requires a schema".into()))?;

            let mut schemas = table.schemas.write();
            let current = schemas.last().expect("table has a schema").version;
            if schema.version <= current {
                return Err(Error::InvalidArgument(format!(
                    "schema version {} is not newer than {}",
                    schema.version, current
                )));
            }
            schemas.push(schema);
        }

        self.save()?;
        info!(uid = cfg.table_id.uid, "altered table schema");
        Ok(())
    }

    /// Look up a table handle by uid
    pub fn table(&self, uid: u64) -> Result<Arc<Table>> {
        self.inner
            .read()
            .by_uid
            .get(&uid)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("table uid {}", uid)))
    }

    /// Look up a table handle by short id
    pub fn table_by_tid(&self, tid: u32) -> Result<Arc<Table>> {
        let inner = self.inner.read();
        let uid = inner
            .by_tid
            .get(&tid)
            .ok_or_else(|| Error::NotFound(format!("table tid {}", tid)))?;
        Ok(inner.by_uid[uid].clone())
    }

    /// Look up a table handle by name
    pub fn table_by_name(&self, name: &str) -> Result<Arc<Table>> {
        let inner = self.inner.read();
        let uid = inner
            .by_name
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("table {:?}", name)))?;
        Ok(inner.by_uid[uid].clone())
    }

    /// Read-only name lookup
    pub fn table_name(&self, id: TableId) -> Result<String> {
        let table = self.table(id.uid)?;
        Ok(table.name().to_string())
    }

    /// Read-only tag value lookup by tag column id
    pub fn table_tag_value(&self, id: TableId, col_id: i16) -> Result<(ColumnType, ColumnValue)> {
        let table = self.table(id.uid)?;
        let tag_schema = table
            .tag_schema()
            .ok_or_else(|| Error::InvalidArgument(format!("table {} has no tags", id)))?;
        let index = tag_schema
            .col_index(col_id)
            .ok_or_else(|| Error::NotFound(format!("tag column {}", col_id)))?;
        let ty = tag_schema.columns[index].ty;
        let values = table
            .tag_values()
            .ok_or_else(|| Error::NotFound(format!("table {} has no tag row", id)))?;
        let value = values
            .value(index)
            .cloned()
            .ok_or_else(|| Error::Corrupted("tag row shorter than tag schema".into()))?;
        Ok((ty, value))
    }

    /// Child uids of a super table, in creation order
    pub fn children_of(&self, super_uid: u64) -> Result<Vec<Arc<Table>>> {
        let inner = self.inner.read();
        let parent = inner
            .by_uid
            .get(&super_uid)
            .ok_or_else(|| Error::NotFound(format!("super table {}", super_uid)))?;
        if parent.kind != TableKind::Super {
            return Err(Error::InvalidArgument(format!(
                "table {} is not a super table",
                super_uid
            )));
        }
        let children = inner
            .children
            .get(&super_uid)
            .map(|uids| uids.iter().map(|uid| inner.by_uid[uid].clone()).collect())
            .unwrap_or_default();
        Ok(children)
    }

    /// Resolve the row schema a table's data must be read/validated with.
    /// Child tables resolve through their super table.
    pub fn row_schema(&self, table: &Table, version: Option<i32>) -> Result<Schema> {
        let owner: Arc<Table>;
        let holder: &Table = if let Some(super_uid) = table.super_uid() {
            owner = self.table(super_uid)?;
            &owner
        } else {
            table
        };
        let schema = match version {
            Some(v) => holder.schema_for_version(v),
            None => holder.current_schema(),
        };
        schema.ok_or_else(|| {
            Error::NotFound(format!(
                "schema version {:?} of table {}",
                version,
                table.id()
            ))
        })
    }

    /// All live table handles
    pub fn all_tables(&self) -> Vec<Arc<Table>> {
        self.inner.read().by_uid.values().cloned().collect()
    }

    /// Persist the directory snapshot (atomic rewrite)
    pub fn save(&self) -> Result<()> {
        let metas: Vec<TableMeta> = {
            let inner = self.inner.read();
            let mut metas: Vec<_> = inner.by_uid.values().map(|t| t.to_meta()).collect();
            metas.sort_by_key(|m| m.id.tid);
            metas
        };

        let data = encode_snapshot(&metas)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn index_table(inner: &mut DirectoryInner, table: Arc<Table>) {
    inner.by_tid.insert(table.id.tid, table.id.uid);
    inner.by_name.insert(table.name.clone(), table.id.uid);
    if let Some(super_uid) = table.super_uid {
        inner.children.entry(super_uid).or_default().push(table.id.uid);
    }
    inner.by_uid.insert(table.id.uid, table);
}

fn encode_snapshot(metas: &[TableMeta]) -> Result<Vec<u8>> {
    let payload =
        bincode::serialize(metas).map_err(|e| Error::Corrupted(e.to_string()))?;
    let mut buf = BytesMut::with_capacity(payload.len() + 16);
    buf.put_slice(META_MAGIC);
    buf.put_u32_le(META_VERSION);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);
    let checksum = crc32fast::hash(&buf);
    buf.put_u32_le(checksum);
    Ok(buf.to_vec())
}

fn decode_snapshot(data: &[u8]) -> Result<Vec<TableMeta>> {
    if data.len() < 16 {
        return Err(Error::Corrupted("meta snapshot too short".into()));
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
    if &magic != META_MAGIC {
        return Err(Error::Corrupted("bad meta magic".into()));
    }
    let version = cursor.get_u32_le();
    if version != META_VERSION {
        return Err(Error::Corrupted(format!(
            "unsupported meta version {}",
            version
        )));
    }
    let len = cursor.get_u32_le() as usize;
    let pos = cursor.position() as usize;
    if body.len() < pos + len {
        return Err(Error::Corrupted("meta snapshot truncated".into()));
    }
    bincode::deserialize(&body[pos..pos + len]).map_err(|e| Error::Corrupted(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSchema;
    use tempfile::TempDir;

    fn row_schema() -> Schema {
        Schema::new(
            1,
            vec![
                ColumnSchema::new(0, "ts", ColumnType::Timestamp),
                ColumnSchema::new(1, "value", ColumnType::Float),
            ],
        )
        .unwrap()
    }

    fn tag_schema() -> Schema {
        Schema::new(
            1,
            vec![
                ColumnSchema::new(0, "ts", ColumnType::Timestamp),
                ColumnSchema::new(1, "location", ColumnType::Text),
            ],
        )
        .unwrap()
    }

    fn tag_row(location: &str) -> RowData {
        RowData::new(vec![
            ColumnValue::Timestamp(0),
            ColumnValue::Text(location.into()),
        ])
    }

    #[test]
    fn test_create_and_lookup() {
        let dir = TempDir::new().unwrap();
        let directory = TableDirectory::new(dir.path(), 16);

        let id = directory
            .create_table(TableCfg::normal("m1", TableId::new(10, 0), row_schema()))
            .unwrap();
        assert_eq!(id.uid, 10);
        assert!(id.tid > 0);

        assert_eq!(directory.table_name(id).unwrap(), "m1");
        assert_eq!(directory.table(10).unwrap().kind(), TableKind::Normal);
        assert!(directory.table(99).is_err());

        // duplicate name
        let dup = directory.create_table(TableCfg::normal("m1", TableId::new(11, 0), row_schema()));
        assert!(matches!(dup, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_table_limit() {
        let dir = TempDir::new().unwrap();
        let directory = TableDirectory::new(dir.path(), 1);

        directory
            .create_table(TableCfg::normal("one", TableId::new(1, 0), row_schema()))
            .unwrap();
        let err = directory
            .create_table(TableCfg::normal("two", TableId::new(2, 0), row_schema()))
            .unwrap_err();
        assert!(matches!(err, Error::LimitExceeded(_)));
    }

    #[test]
    fn test_super_and_child() {
        let dir = TempDir::new().unwrap();
        let directory = TableDirectory::new(dir.path(), 16);

        directory
            .create_table(TableCfg::super_table(
                "sensors",
                TableId::new(1, 0),
                row_schema(),
                tag_schema(),
            ))
            .unwrap();
        let child_id = directory
            .create_table(TableCfg::child("s1", TableId::new(2, 0), 1, tag_row("a")))
            .unwrap();

        // child row schema resolves through the super table
        let child = directory.table(child_id.uid).unwrap();
        let schema = directory.row_schema(&child, Some(1)).unwrap();
        assert_eq!(schema.num_cols(), 2);

        let (ty, value) = directory.table_tag_value(child_id, 1).unwrap();
        assert_eq!(ty, ColumnType::Text);
        assert_eq!(value, ColumnValue::Text("a".into()));

        // tag row must conform to the super's tag schema
        let bad_tags = RowData::new(vec![
            ColumnValue::Timestamp(0),
            ColumnValue::Integer(3),
        ]);
        let err = directory
            .create_table(TableCfg::child("s2", TableId::new(3, 0), 1, bad_tags))
            .unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { .. }));

        // super with children refuses to drop
        let err = directory.drop_table(TableId::new(1, 1)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        directory.drop_table(child_id).unwrap();
        directory.drop_table(TableId::new(1, 1)).unwrap();
        assert_eq!(directory.count(), 0);
    }

    #[test]
    fn test_alter_keeps_old_versions() {
        let dir = TempDir::new().unwrap();
        let directory = TableDirectory::new(dir.path(), 16);

        let id = directory
            .create_table(TableCfg::normal("m", TableId::new(1, 0), row_schema()))
            .unwrap();

        let v2 = Schema::new(
            2,
            vec![
                ColumnSchema::new(0, "ts", ColumnType::Timestamp),
                ColumnSchema::new(1, "value", ColumnType::Float),
                ColumnSchema::new(2, "extra", ColumnType::Integer),
            ],
        )
        .unwrap();
        directory
            .alter_table(TableCfg::normal("m", id, v2))
            .unwrap();

        let table = directory.table(1).unwrap();
        assert_eq!(table.current_version(), Some(2));
        assert_eq!(table.schema_for_version(1).unwrap().num_cols(), 2);
        assert_eq!(table.schema_for_version(2).unwrap().num_cols(), 3);

        // stale version is rejected
        let err = directory
            .alter_table(TableCfg::normal("m", id, row_schema()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = TempDir::new().unwrap();
        {
            let directory = TableDirectory::new(dir.path(), 16);
            directory
                .create_table(TableCfg::super_table(
                    "sensors",
                    TableId::new(1, 0),
                    row_schema(),
                    tag_schema(),
                ))
                .unwrap();
            directory
                .create_table(TableCfg::child("s1", TableId::new(2, 0), 1, tag_row("b")))
                .unwrap();
        }

        let reloaded = TableDirectory::load(dir.path(), 16).unwrap();
        assert_eq!(reloaded.count(), 2);
        let child = reloaded.table_by_name("s1").unwrap();
        assert_eq!(child.super_uid(), Some(1));
        assert_eq!(reloaded.children_of(1).unwrap().len(), 1);

        // allocated short ids do not collide after reload
        let id = reloaded
            .create_table(TableCfg::normal("m", TableId::new(9, 0), row_schema()))
            .unwrap();
        assert!(id.tid >= 3);
    }

    #[test]
    fn test_snapshot_checksum() {
        let dir = TempDir::new().unwrap();
        let directory = TableDirectory::new(dir.path(), 16);
        directory
            .create_table(TableCfg::normal("m", TableId::new(1, 0), row_schema()))
            .unwrap();

        let path = dir.path().join("meta.tds");
        let mut data = std::fs::read(&path).unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        let result = TableDirectory::load(dir.path(), 16);
        assert!(result.is_err());
    }
}
