//! Column schema and binary row model
//!
//! A schema is a fixed, versioned layout of columns; column 0 is always the
//! primary timestamp. The same binary row codec is used for data rows and
//! for the tag-value rows attached to super/child tables, and the block
//! codec reuses the per-cell encoding for its columnar payloads.

use crate::{Error, Result, Timestamp};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Column data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// Primary timestamp, column 0 only
    Timestamp,
    /// 64-bit signed integer
    Integer,
    /// 64-bit float
    Float,
    /// Boolean
    Boolean,
    /// UTF-8 string
    Text,
}

impl ColumnType {
    /// Whether statistics are computed for this column type
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Float)
    }
}

/// A single cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnValue {
    Null,
    Timestamp(Timestamp),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Text(String),
}

impl ColumnValue {
    /// Check the value against a column type; `Null` fits any non-timestamp column
    pub fn conforms_to(&self, ty: ColumnType) -> bool {
        match (self, ty) {
            (ColumnValue::Null, ColumnType::Timestamp) => false,
            (ColumnValue::Null, _) => true,
            (ColumnValue::Timestamp(_), ColumnType::Timestamp) => true,
            (ColumnValue::Integer(_), ColumnType::Integer) => true,
            (ColumnValue::Float(_), ColumnType::Float) => true,
            (ColumnValue::Boolean(_), ColumnType::Boolean) => true,
            (ColumnValue::Text(_), ColumnType::Text) => true,
            _ => false,
        }
    }

    /// Get as f64 if numeric
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ColumnValue::Integer(v) => Some(*v as f64),
            ColumnValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Approximate encoded size in bytes
    pub fn size(&self) -> usize {
        match self {
            ColumnValue::Null => 1,
            ColumnValue::Timestamp(_) | ColumnValue::Integer(_) | ColumnValue::Float(_) => 9,
            ColumnValue::Boolean(_) => 2,
            ColumnValue::Text(s) => 5 + s.len(),
        }
    }
}

const TAG_NULL: u8 = 0;
const TAG_TIMESTAMP: u8 = 1;
const TAG_INTEGER: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_BOOLEAN: u8 = 4;
const TAG_TEXT: u8 = 5;

/// Encode one cell into a buffer
pub(crate) fn encode_value(buf: &mut BytesMut, value: &ColumnValue) {
    match value {
        ColumnValue::Null => buf.put_u8(TAG_NULL),
        ColumnValue::Timestamp(v) => {
            buf.put_u8(TAG_TIMESTAMP);
            buf.put_i64_le(*v);
        }
        ColumnValue::Integer(v) => {
            buf.put_u8(TAG_INTEGER);
            buf.put_i64_le(*v);
        }
        ColumnValue::Float(v) => {
            buf.put_u8(TAG_FLOAT);
            buf.put_f64_le(*v);
        }
        ColumnValue::Boolean(v) => {
            buf.put_u8(TAG_BOOLEAN);
            buf.put_u8(*v as u8);
        }
        ColumnValue::Text(s) => {
            buf.put_u8(TAG_TEXT);
            buf.put_u32_le(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
    }
}

/// Decode one cell from a cursor
pub(crate) fn decode_value(cursor: &mut std::io::Cursor<&[u8]>) -> Result<ColumnValue> {
    if cursor.remaining() < 1 {
        return Err(Error::Corrupted("truncated cell".into()));
    }
    let tag = cursor.get_u8();
    let value = match tag {
        TAG_NULL => ColumnValue::Null,
        TAG_TIMESTAMP => {
            ensure_remaining(cursor, 8)?;
            ColumnValue::Timestamp(cursor.get_i64_le())
        }
        TAG_INTEGER => {
            ensure_remaining(cursor, 8)?;
            ColumnValue::Integer(cursor.get_i64_le())
        }
        TAG_FLOAT => {
            ensure_remaining(cursor, 8)?;
            ColumnValue::Float(cursor.get_f64_le())
        }
        TAG_BOOLEAN => {
            ensure_remaining(cursor, 1)?;
            ColumnValue::Boolean(cursor.get_u8() != 0)
        }
        TAG_TEXT => {
            ensure_remaining(cursor, 4)?;
            let len = cursor.get_u32_le() as usize;
            ensure_remaining(cursor, len)?;
            let pos = cursor.position() as usize;
            let data = &cursor.get_ref()[pos..pos + len];
            let s = String::from_utf8(data.to_vec())
                .map_err(|e| Error::Corrupted(e.to_string()))?;
            cursor.set_position((pos + len) as u64);
            ColumnValue::Text(s)
        }
        _ => return Err(Error::Corrupted(format!("invalid cell tag: {}", tag))),
    };
    Ok(value)
}

fn ensure_remaining(cursor: &std::io::Cursor<&[u8]>, n: usize) -> Result<()> {
    if cursor.remaining() < n {
        return Err(Error::Corrupted("truncated cell".into()));
    }
    Ok(())
}

/// One column in a schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column id, unique within the schema
    pub id: i16,
    /// Column name
    pub name: String,
    /// Column type
    pub ty: ColumnType,
}

impl ColumnSchema {
    pub fn new(id: i16, name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            id,
            name: name.into(),
            ty,
        }
    }
}

/// A versioned column layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Schema version, bumped by every alteration
    pub version: i32,
    /// Ordered columns; column 0 is the primary timestamp
    pub columns: Vec<ColumnSchema>,
}

impl Schema {
    /// Create a schema, checking structural invariants
    pub fn new(version: i32, columns: Vec<ColumnSchema>) -> Result<Self> {
        let schema = Self { version, columns };
        schema.check()?;
        Ok(schema)
    }

    fn check(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(Error::InvalidArgument("schema has no columns".into()));
        }
        if self.columns[0].ty != ColumnType::Timestamp {
            return Err(Error::InvalidArgument(
                "column 0 must be the primary timestamp".into(),
            ));
        }
        for (i, col) in self.columns.iter().enumerate() {
            if i > 0 && col.ty == ColumnType::Timestamp {
                return Err(Error::InvalidArgument(
                    "only column 0 may be a timestamp".into(),
                ));
            }
            for other in &self.columns[..i] {
                if other.id == col.id {
                    return Err(Error::InvalidArgument(format!(
                        "duplicate column id {}",
                        col.id
                    )));
                }
                if other.name == col.name {
                    return Err(Error::InvalidArgument(format!(
                        "duplicate column name {:?}",
                        col.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Number of columns
    pub fn num_cols(&self) -> usize {
        self.columns.len()
    }

    /// Find a column by id
    pub fn column(&self, id: i16) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.id == id)
    }

    /// Position of a column id within the row layout
    pub fn col_index(&self, id: i16) -> Option<usize> {
        self.columns.iter().position(|c| c.id == id)
    }

    /// Validate a row against this schema
    pub fn validate_row(&self, row: &RowData) -> Result<()> {
        if row.values.len() != self.columns.len() {
            return Err(Error::schema_mismatch(
                format!(
                    "row has {} columns, schema v{} has {}",
                    row.values.len(),
                    self.version,
                    self.columns.len()
                ),
                0,
            ));
        }
        for (value, col) in row.values.iter().zip(&self.columns) {
            if !value.conforms_to(col.ty) {
                return Err(Error::schema_mismatch(
                    format!("value {:?} does not fit column {:?}", value, col.name),
                    0,
                ));
            }
        }
        Ok(())
    }
}

/// An ordered tuple of cell values keyed by its timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowData {
    pub values: Vec<ColumnValue>,
}

impl RowData {
    pub fn new(values: Vec<ColumnValue>) -> Self {
        Self { values }
    }

    /// The primary timestamp (column 0)
    pub fn timestamp(&self) -> Result<Timestamp> {
        match self.values.first() {
            Some(ColumnValue::Timestamp(ts)) => Ok(*ts),
            _ => Err(Error::InvalidArgument(
                "row column 0 is not a timestamp".into(),
            )),
        }
    }

    /// Cell at a row position
    pub fn value(&self, index: usize) -> Option<&ColumnValue> {
        self.values.get(index)
    }

    /// Approximate encoded size in bytes
    pub fn size(&self) -> usize {
        2 + self.values.iter().map(|v| v.size()).sum::<usize>()
    }

    /// Serialize to the binary row format
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());
        buf.put_u16_le(self.values.len() as u16);
        for value in &self.values {
            encode_value(&mut buf, value);
        }
        buf.freeze()
    }

    /// Deserialize from the binary row format
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(data);
        if cursor.remaining() < 2 {
            return Err(Error::Corrupted("truncated row".into()));
        }
        let count = cursor.get_u16_le() as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(decode_value(&mut cursor)?);
        }
        Ok(Self { values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> Schema {
        Schema::new(
            1,
            vec![
                ColumnSchema::new(0, "ts", ColumnType::Timestamp),
                ColumnSchema::new(1, "value", ColumnType::Float),
                ColumnSchema::new(2, "flag", ColumnType::Boolean),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_schema_invariants() {
        // timestamp must lead
        let bad = Schema::new(1, vec![ColumnSchema::new(0, "v", ColumnType::Float)]);
        assert!(bad.is_err());

        // duplicate column ids rejected
        let bad = Schema::new(
            1,
            vec![
                ColumnSchema::new(0, "ts", ColumnType::Timestamp),
                ColumnSchema::new(0, "v", ColumnType::Float),
            ],
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_row_validation() {
        let schema = sample_schema();
        let good = RowData::new(vec![
            ColumnValue::Timestamp(1000),
            ColumnValue::Float(3.5),
            ColumnValue::Boolean(true),
        ]);
        assert!(schema.validate_row(&good).is_ok());

        let null_ok = RowData::new(vec![
            ColumnValue::Timestamp(1000),
            ColumnValue::Null,
            ColumnValue::Null,
        ]);
        assert!(schema.validate_row(&null_ok).is_ok());

        let wrong_type = RowData::new(vec![
            ColumnValue::Timestamp(1000),
            ColumnValue::Text("x".into()),
            ColumnValue::Boolean(false),
        ]);
        assert!(schema.validate_row(&wrong_type).is_err());

        let short = RowData::new(vec![ColumnValue::Timestamp(1000)]);
        assert!(schema.validate_row(&short).is_err());
    }

    #[test]
    fn test_row_codec() {
        let row = RowData::new(vec![
            ColumnValue::Timestamp(1_700_000_000_000),
            ColumnValue::Float(-2.25),
            ColumnValue::Integer(42),
            ColumnValue::Boolean(false),
            ColumnValue::Text("building-a".into()),
            ColumnValue::Null,
        ]);

        let bytes = row.encode();
        let restored = RowData::decode(&bytes).unwrap();
        assert_eq!(restored, row);
        assert_eq!(restored.timestamp().unwrap(), 1_700_000_000_000);
    }

    #[test]
    fn test_row_codec_truncated() {
        let row = RowData::new(vec![ColumnValue::Timestamp(5), ColumnValue::Integer(7)]);
        let bytes = row.encode();
        let result = RowData::decode(&bytes[..bytes.len() - 3]);
        assert!(matches!(result, Err(Error::Corrupted(_))));
    }
}
