//! Tag resolver bridge
//!
//! The storage core treats a tag predicate as an opaque byte string plus a
//! relational-operator tag; evaluation happens in an injected
//! [`TagCondEvaluator`] capability. The core's only obligation is to hand
//! the evaluator the candidate tables' tag rows and partition the matches
//! into a [`TableGroup`] preserving the caller's GROUP BY semantics.

use crate::meta::{Table, TableDirectory, TableKind};
use crate::query::TableGroup;
use crate::schema::{encode_value, RowData};
use crate::{Error, Result, TableId};
use bytes::BytesMut;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// An opaque tag predicate, passed through to the evaluator verbatim
pub struct TagCond<'a> {
    /// Serialized predicate expression
    pub expr: &'a [u8],
    /// Relational operator tag understood by the evaluator
    pub rel: i16,
}

/// One candidate table offered to the evaluator
pub struct TagEntry {
    pub id: TableId,
    pub tags: RowData,
}

/// Injected tag-predicate evaluator. The core never parses the
/// expression; it only consumes the returned uid set.
pub trait TagCondEvaluator: Send + Sync {
    /// Return the uids of the candidates matching the predicate
    fn evaluate(
        &self,
        super_uid: u64,
        cond: &TagCond<'_>,
        candidates: &[TagEntry],
    ) -> Result<Vec<u64>>;
}

/// Resolve a super table plus an optional tag predicate into a table
/// group, partitioned by the `group_by` tag columns.
pub(crate) fn query_super_table_by_tag_cond(
    directory: &TableDirectory,
    evaluator: Option<&dyn TagCondEvaluator>,
    super_uid: u64,
    cond: Option<TagCond<'_>>,
    group_by: &[i16],
) -> Result<TableGroup> {
    let children = directory.children_of(super_uid)?;

    let survivors: Vec<Arc<Table>> = match cond {
        None => children,
        Some(cond) => {
            let evaluator = evaluator.ok_or_else(|| {
                Error::InvalidArgument(
                    "tag predicate given but no evaluator installed".into(),
                )
            })?;
            let candidates: Vec<TagEntry> = children
                .iter()
                .map(|table| TagEntry {
                    id: table.id(),
                    tags: table
                        .tag_values()
                        .unwrap_or_else(|| RowData::new(Vec::new())),
                })
                .collect();
            let matched: HashSet<u64> = evaluator
                .evaluate(super_uid, &cond, &candidates)?
                .into_iter()
                .collect();
            children
                .into_iter()
                .filter(|table| matched.contains(&table.id().uid))
                .collect()
        }
    };

    if group_by.is_empty() {
        let ids: Vec<TableId> = survivors.iter().map(|t| t.id()).collect();
        let groups = if ids.is_empty() { Vec::new() } else { vec![ids] };
        return Ok(TableGroup { groups });
    }

    // partition by the binary encoding of the group-by tag values;
    // BTreeMap keeps group order deterministic
    let mut groups: BTreeMap<Vec<u8>, Vec<TableId>> = BTreeMap::new();
    for table in survivors {
        let key = group_key(&table, group_by)?;
        groups.entry(key).or_default().push(table.id());
    }
    Ok(TableGroup {
        groups: groups.into_values().collect(),
    })
}

/// Single-table group for a normal-table query
pub(crate) fn one_table_group(directory: &TableDirectory, uid: u64) -> Result<TableGroup> {
    let table = directory.table(uid)?;
    if table.kind() == TableKind::Super {
        return Err(Error::InvalidArgument(
            "a super table holds no rows; resolve it by tag condition".into(),
        ));
    }
    Ok(TableGroup::single(table.id()))
}

fn group_key(table: &Table, group_by: &[i16]) -> Result<Vec<u8>> {
    let tag_schema = table
        .tag_schema()
        .ok_or_else(|| Error::InvalidArgument(format!("table {} has no tags", table.id())))?;
    let tags = table
        .tag_values()
        .ok_or_else(|| Error::NotFound(format!("table {} has no tag row", table.id())))?;

    let mut buf = BytesMut::new();
    for col_id in group_by {
        let index = tag_schema
            .col_index(*col_id)
            .ok_or_else(|| Error::NotFound(format!("tag column {}", col_id)))?;
        let value = tags
            .value(index)
            .ok_or_else(|| Error::Corrupted("tag row shorter than tag schema".into()))?;
        encode_value(&mut buf, value);
    }
    Ok(buf.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::TableCfg;
    use crate::schema::{ColumnSchema, ColumnType, ColumnValue, Schema};
    use tempfile::TempDir;

    fn row_schema() -> Schema {
        Schema::new(
            1,
            vec![
                ColumnSchema::new(0, "ts", ColumnType::Timestamp),
                ColumnSchema::new(1, "v", ColumnType::Float),
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
                ColumnSchema::new(2, "floor", ColumnType::Integer),
            ],
        )
        .unwrap()
    }

    fn tags(location: &str, floor: i64) -> RowData {
        RowData::new(vec![
            ColumnValue::Timestamp(0),
            ColumnValue::Text(location.into()),
            ColumnValue::Integer(floor),
        ])
    }

    fn build_directory(dir: &TempDir) -> TableDirectory {
        let directory = TableDirectory::new(dir.path(), 16);
        directory
            .create_table(TableCfg::super_table(
                "sensors",
                TableId::new(1, 0),
                row_schema(),
                tag_schema(),
            ))
            .unwrap();
        for (i, (location, floor)) in
            [("a", 1i64), ("a", 2), ("b", 1), ("b", 2)].iter().enumerate()
        {
            directory
                .create_table(TableCfg::child(
                    format!("s{}", i),
                    TableId::new(10 + i as u64, 0),
                    1,
                    tags(location, *floor),
                ))
                .unwrap();
        }
        directory
    }

    /// Evaluator matching tables whose `location` tag equals the predicate
    struct LocationEquals;

    impl TagCondEvaluator for LocationEquals {
        fn evaluate(
            &self,
            _super_uid: u64,
            cond: &TagCond<'_>,
            candidates: &[TagEntry],
        ) -> Result<Vec<u64>> {
            let wanted = std::str::from_utf8(cond.expr)
                .map_err(|e| Error::InvalidArgument(e.to_string()))?;
            Ok(candidates
                .iter()
                .filter(|entry| {
                    matches!(entry.tags.value(1), Some(ColumnValue::Text(s)) if s == wanted)
                })
                .map(|entry| entry.id.uid)
                .collect())
        }
    }

    #[test]
    fn test_all_children_one_group() {
        let dir = TempDir::new().unwrap();
        let directory = build_directory(&dir);
        let group =
            query_super_table_by_tag_cond(&directory, None, 1, None, &[]).unwrap();
        assert_eq!(group.groups.len(), 1);
        assert_eq!(group.num_tables(), 4);
    }

    #[test]
    fn test_predicate_filters_children() {
        let dir = TempDir::new().unwrap();
        let directory = build_directory(&dir);
        let cond = TagCond { expr: b"a", rel: 0 };
        let group = query_super_table_by_tag_cond(
            &directory,
            Some(&LocationEquals),
            1,
            Some(cond),
            &[],
        )
        .unwrap();
        assert_eq!(group.num_tables(), 2);

        // predicate without an installed evaluator is refused
        let cond = TagCond { expr: b"a", rel: 0 };
        let err =
            query_super_table_by_tag_cond(&directory, None, 1, Some(cond), &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_group_by_partitions() {
        let dir = TempDir::new().unwrap();
        let directory = build_directory(&dir);
        let group = query_super_table_by_tag_cond(&directory, None, 1, None, &[1]).unwrap();
        // two locations -> two sub-groups of two tables each
        assert_eq!(group.groups.len(), 2);
        assert!(group.groups.iter().all(|g| g.len() == 2));

        let group = query_super_table_by_tag_cond(&directory, None, 1, None, &[1, 2]).unwrap();
        assert_eq!(group.groups.len(), 4);
    }

    #[test]
    fn test_one_table_group() {
        let dir = TempDir::new().unwrap();
        let directory = build_directory(&dir);
        let group = one_table_group(&directory, 10).unwrap();
        assert_eq!(group.num_tables(), 1);

        // a super table is not a queryable table on its own
        assert!(one_table_group(&directory, 1).is_err());
        assert!(matches!(
            one_table_group(&directory, 999),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_unknown_super_table() {
        let dir = TempDir::new().unwrap();
        let directory = build_directory(&dir);
        let err = query_super_table_by_tag_cond(&directory, None, 42, None, &[]).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
