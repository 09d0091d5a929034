//! On-disk data block codec
//!
//! A block holds a run of rows for one table under one schema version,
//! stored column by column so a query can decode only the columns it
//! projects. The whole block is covered by a trailing CRC32; per-column
//! statistics are computed at build time and stored in the group index,
//! not in the block itself.

use crate::schema::{decode_value, encode_value, ColumnType, ColumnValue, RowData, Schema};
use crate::{Compression, Error, Result, TableId, TimeWindow, Timestamp};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

const BLOCK_MAGIC: &[u8; 4] = b"TDBK";

/// Pre-computed per-column statistics for one block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStatis {
    pub col_id: i16,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub null_count: u32,
    pub count: u32,
}

/// Compute statistics for the numeric columns of a block
pub fn compute_statistics(schema: &Schema, columns: &[Vec<ColumnValue>]) -> Vec<ColumnStatis> {
    let mut out = Vec::new();
    for (col, values) in schema.columns.iter().zip(columns) {
        if !col.ty.is_numeric() {
            continue;
        }
        let mut statis = ColumnStatis {
            col_id: col.id,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            null_count: 0,
            count: values.len() as u32,
        };
        for value in values {
            match value.as_f64() {
                Some(v) => {
                    statis.min = statis.min.min(v);
                    statis.max = statis.max.max(v);
                    statis.sum += v;
                }
                None => statis.null_count += 1,
            }
        }
        if statis.count == statis.null_count {
            statis.min = 0.0;
            statis.max = 0.0;
        }
        out.push(statis);
    }
    out
}

fn type_tag(ty: ColumnType) -> u8 {
    match ty {
        ColumnType::Timestamp => 0,
        ColumnType::Integer => 1,
        ColumnType::Float => 2,
        ColumnType::Boolean => 3,
        ColumnType::Text => 4,
    }
}

/// A fully built block ready to append to a group's data file
pub struct FinishedBlock {
    pub table: TableId,
    pub sversion: i32,
    pub bytes: Bytes,
    pub window: TimeWindow,
    pub rows: u32,
    pub cols: u16,
    pub statis: Vec<ColumnStatis>,
    /// Uncompressed payload bytes, for logical-size accounting
    pub raw_bytes: u64,
}

/// Accumulates rows for one table into a columnar block
pub struct BlockBuilder {
    table: TableId,
    sversion: i32,
    compression: Compression,
    schema: Schema,
    columns: Vec<Vec<ColumnValue>>,
    min_ts: Timestamp,
    max_ts: Timestamp,
}

impl BlockBuilder {
    /// Start a block for one table and schema version
    pub fn new(table: TableId, schema: Schema, sversion: i32, compression: Compression) -> Self {
        let columns = schema.columns.iter().map(|_| Vec::new()).collect();
        Self {
            table,
            sversion,
            compression,
            schema,
            columns,
            min_ts: i64::MAX,
            max_ts: i64::MIN,
        }
    }

    /// Append a row already validated against this block's schema
    pub fn push_row(&mut self, ts: Timestamp, row: &RowData) {
        for (column, value) in self.columns.iter_mut().zip(&row.values) {
            column.push(value.clone());
        }
        self.min_ts = self.min_ts.min(ts);
        self.max_ts = self.max_ts.max(ts);
    }

    /// Rows accumulated so far
    pub fn len(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode the block
    pub fn finish(self) -> Result<FinishedBlock> {
        if self.is_empty() {
            return Err(Error::InvalidArgument("empty block".into()));
        }
        let rows = self.len() as u32;
        let statis = compute_statistics(&self.schema, &self.columns);

        // encode and optionally compress each column payload
        let mut payloads = Vec::with_capacity(self.columns.len());
        let mut raw_bytes = 0u64;
        for values in &self.columns {
            let mut raw = BytesMut::new();
            for value in values {
                encode_value(&mut raw, value);
            }
            raw_bytes += raw.len() as u64;
            let encoded = match self.compression {
                Compression::None => raw.to_vec(),
                Compression::Lz4 => lz4_flex::compress_prepend_size(&raw),
            };
            payloads.push((raw.len() as u32, encoded));
        }

        let mut buf = BytesMut::new();
        buf.put_slice(BLOCK_MAGIC);
        buf.put_u64_le(self.table.uid);
        buf.put_u32_le(self.table.tid);
        buf.put_i32_le(self.sversion);
        buf.put_u32_le(rows);
        buf.put_u16_le(self.schema.num_cols() as u16);
        buf.put_u8(match self.compression {
            Compression::None => 0,
            Compression::Lz4 => 1,
        });
        buf.put_i64_le(self.min_ts);
        buf.put_i64_le(self.max_ts);

        for (col, (raw_len, encoded)) in self.schema.columns.iter().zip(&payloads) {
            buf.put_i16_le(col.id);
            buf.put_u8(type_tag(col.ty));
            buf.put_u32_le(encoded.len() as u32);
            buf.put_u32_le(*raw_len);
        }
        for (_, encoded) in &payloads {
            buf.put_slice(encoded);
        }

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        Ok(FinishedBlock {
            table: self.table,
            sversion: self.sversion,
            bytes: buf.freeze(),
            window: TimeWindow::new(self.min_ts, self.max_ts),
            rows,
            cols: self.schema.num_cols() as u16,
            statis,
            raw_bytes,
        })
    }
}

struct ColEntry {
    id: i16,
    comp_len: u32,
    raw_len: u32,
    offset: usize,
}

/// A block read back from disk, decoded lazily column by column
pub struct EncodedBlock {
    data: Bytes,
    table: TableId,
    sversion: i32,
    rows: u32,
    window: TimeWindow,
    compression: Compression,
    dir: Vec<ColEntry>,
}

impl EncodedBlock {
    /// Parse a block's raw bytes, verifying magic and checksum
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() < 43 {
            return Err(Error::Corrupted("block too short".into()));
        }
        let body_len = data.len() - 4;
        let expected = {
            let mut cursor = std::io::Cursor::new(&data[body_len..]);
            cursor.get_u32_le()
        };
        let actual = crc32fast::hash(&data[..body_len]);
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        let mut cursor = std::io::Cursor::new(&data[..body_len]);
        let mut magic = [0u8; 4];
        cursor.copy_to_slice(&mut magic);
        if &magic != BLOCK_MAGIC {
            return Err(Error::Corrupted("bad block magic".into()));
        }

        let uid = cursor.get_u64_le();
        let tid = cursor.get_u32_le();
        let sversion = cursor.get_i32_le();
        let rows = cursor.get_u32_le();
        let cols = cursor.get_u16_le() as usize;
        let compression = match cursor.get_u8() {
            0 => Compression::None,
            1 => Compression::Lz4,
            other => {
                return Err(Error::Corrupted(format!(
                    "unknown block compression {}",
                    other
                )))
            }
        };
        let min_ts = cursor.get_i64_le();
        let max_ts = cursor.get_i64_le();

        if cursor.remaining() < cols * 11 {
            return Err(Error::Corrupted("block column directory truncated".into()));
        }
        let mut dir = Vec::with_capacity(cols);
        for _ in 0..cols {
            let id = cursor.get_i16_le();
            let _ty = cursor.get_u8();
            let comp_len = cursor.get_u32_le();
            let raw_len = cursor.get_u32_le();
            dir.push(ColEntry {
                id,
                comp_len,
                raw_len,
                offset: 0,
            });
        }
        let mut offset = cursor.position() as usize;
        for entry in &mut dir {
            entry.offset = offset;
            offset += entry.comp_len as usize;
        }
        if offset != body_len {
            return Err(Error::Corrupted("block payload length mismatch".into()));
        }

        Ok(Self {
            data,
            table: TableId::new(uid, tid),
            sversion,
            rows,
            window: TimeWindow::new(min_ts, max_ts),
            compression,
            dir,
        })
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn sversion(&self) -> i32 {
        self.sversion
    }

    pub fn num_rows(&self) -> usize {
        self.rows as usize
    }

    pub fn num_cols(&self) -> usize {
        self.dir.len()
    }

    pub fn window(&self) -> TimeWindow {
        self.window
    }

    /// Decode one column's values
    pub fn decode_column(&self, col_id: i16) -> Result<Vec<ColumnValue>> {
        let entry = self
            .dir
            .iter()
            .find(|e| e.id == col_id)
            .ok_or_else(|| Error::NotFound(format!("column {} in block", col_id)))?;

        let raw_region = &self.data[entry.offset..entry.offset + entry.comp_len as usize];
        let raw = match self.compression {
            Compression::None => raw_region.to_vec(),
            Compression::Lz4 => lz4_flex::decompress_size_prepended(raw_region)
                .map_err(|e| Error::Compression(e.to_string()))?,
        };
        if raw.len() != entry.raw_len as usize {
            return Err(Error::Corrupted("column payload length mismatch".into()));
        }

        let mut cursor = std::io::Cursor::new(raw.as_slice());
        let mut values = Vec::with_capacity(self.rows as usize);
        for _ in 0..self.rows {
            values.push(decode_value(&mut cursor)?);
        }
        Ok(values)
    }

    /// Column ids in block order
    pub fn column_ids(&self) -> Vec<i16> {
        self.dir.iter().map(|e| e.id).collect()
    }

    /// Decode the primary timestamp column (always the block's first column)
    pub fn timestamps(&self) -> Result<Vec<Timestamp>> {
        let first = self
            .dir
            .first()
            .ok_or_else(|| Error::Corrupted("block has no columns".into()))?;
        let values = self.decode_column(first.id)?;
        values
            .into_iter()
            .map(|v| match v {
                ColumnValue::Timestamp(ts) => Ok(ts),
                other => Err(Error::Corrupted(format!(
                    "non-timestamp value {:?} in primary column",
                    other
                ))),
            })
            .collect()
    }
}
