//! Bounded chunks of decoded rows, and Arrow IPC slices for hosts that take
//! columnar buffers.

use std::sync::Arc;

use arrow::error::ArrowError;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};

use crate::convert::{NormalizedValue, Row};

/// Byte estimate charged for a row whose decoding failed.
const FAILED_ROW_BYTES: usize = 1;
/// Upper bound for a JSON-rendered double.
const FLOAT_BYTES: usize = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChunkLimits {
    pub max_bytes: usize,
    pub max_rows: usize,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            max_bytes: 5 * 1024 * 1024,
            max_rows: 500,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    /// Position of this chunk within its query, starting at 0.
    pub seq: u64,
    pub columns: Arc<[String]>,
    pub rows: Vec<Row>,
    pub byte_size: usize,
}

#[derive(Serialize)]
struct ChunkBody<'a> {
    columns: &'a [String],
    rows: &'a [Row],
}

impl Chunk {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// `{"columns":[...],"rows":[...]}`
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&ChunkBody {
            columns: &self.columns,
            rows: &self.rows,
        })
    }
}

/// Groups rows into chunks that respect [`ChunkLimits`].
///
/// Limits are checked before a row is appended, so a chunk only goes over
/// the byte ceiling when it holds a single oversized row.
#[derive(Debug)]
pub struct ChunkAssembler {
    limits: ChunkLimits,
    columns: Arc<[String]>,
    rows: Vec<Row>,
    bytes: usize,
    next_seq: u64,
}

impl ChunkAssembler {
    pub fn new(limits: ChunkLimits) -> Self {
        Self {
            limits,
            columns: Arc::from(Vec::new()),
            rows: Vec::new(),
            bytes: 0,
            next_seq: 0,
        }
    }

    /// Column names for the rows that follow. A pending chunk with different
    /// columns is flushed first.
    pub fn set_columns(&mut self, columns: Arc<[String]>) -> Option<Chunk> {
        if *self.columns == *columns {
            return None;
        }
        let flushed = self.flush();
        self.columns = columns;
        flushed
    }

    pub fn push(&mut self, row: Row) -> Option<Chunk> {
        let size = estimate_row_bytes(&row);
        let full = self.rows.len() + 1 > self.limits.max_rows
            || self.bytes + size > self.limits.max_bytes;
        let flushed = if full { self.flush() } else { None };
        self.rows.push(row);
        self.bytes += size;
        flushed
    }

    /// Emits whatever is pending.
    pub fn finish(&mut self) -> Option<Chunk> {
        self.flush()
    }

    fn flush(&mut self) -> Option<Chunk> {
        if self.rows.is_empty() {
            return None;
        }
        let chunk = Chunk {
            seq: self.next_seq,
            columns: self.columns.clone(),
            rows: std::mem::take(&mut self.rows),
            byte_size: std::mem::take(&mut self.bytes),
        };
        self.next_seq += 1;
        Some(chunk)
    }
}

/// Approximate JSON size of a row, including the separator that precedes
/// it in the rows array.
pub fn estimate_row_bytes(row: &Row) -> usize {
    match row {
        Row::Failed { .. } => FAILED_ROW_BYTES,
        Row::Values(values) => {
            1 + 2
                + values.len().saturating_sub(1)
                + values.iter().map(estimate_value_bytes).sum::<usize>()
        }
    }
}

/// Iterative so deeply nested values cannot exhaust the stack.
pub fn estimate_value_bytes(value: &NormalizedValue) -> usize {
    let mut total = 0;
    let mut pending = vec![value];
    while let Some(value) = pending.pop() {
        total += match value {
            NormalizedValue::Null => 4,
            NormalizedValue::Bool(true) => 4,
            NormalizedValue::Bool(false) => 5,
            NormalizedValue::Int(v) => decimal_len(*v),
            NormalizedValue::Float(_) => FLOAT_BYTES,
            NormalizedValue::BigInt(text)
            | NormalizedValue::DecimalText(text)
            | NormalizedValue::Text(text) => text.len() + 2,
            NormalizedValue::Array(items) => {
                pending.extend(items.iter());
                2 + items.len().saturating_sub(1)
            }
            NormalizedValue::Object(entries) => {
                pending.extend(entries.iter().map(|(_, value)| value));
                2 + entries.len().saturating_sub(1)
                    + entries.iter().map(|(key, _)| key.len() + 3).sum::<usize>()
            }
        };
    }
    total
}

fn decimal_len(value: i64) -> usize {
    let sign = usize::from(value < 0);
    let mut magnitude = value.unsigned_abs();
    let mut digits = 1;
    while magnitude >= 10 {
        magnitude /= 10;
        digits += 1;
    }
    sign + digits
}

/// Splits `batch` into slices that respect the row ceiling and, judged by
/// the batch's average in-memory row size, the byte ceiling.
pub fn split_batch(batch: &RecordBatch, limits: &ChunkLimits) -> Vec<RecordBatch> {
    let rows = batch.num_rows();
    if rows == 0 {
        return Vec::new();
    }
    let per_row = batch.get_array_memory_size().div_ceil(rows).max(1);
    let rows_per_slice = (limits.max_bytes / per_row).clamp(1, limits.max_rows.max(1));
    (0..rows)
        .step_by(rows_per_slice)
        .map(|offset| batch.slice(offset, rows_per_slice.min(rows - offset)))
        .collect()
}

/// One self-describing Arrow IPC stream: schema followed by `batch`.
pub fn encode_ipc(batch: &RecordBatch) -> Result<Vec<u8>, ArrowError> {
    let mut writer = StreamWriter::try_new(Vec::new(), batch.schema_ref())?;
    writer.write(batch)?;
    writer.finish()?;
    writer.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::ipc::reader::StreamReader;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn text_row(len: usize) -> Row {
        Row::Values(vec![NormalizedValue::Text("x".repeat(len))])
    }

    fn columns(names: &[&str]) -> Arc<[String]> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn flushes_on_row_ceiling() {
        let mut assembler = ChunkAssembler::new(ChunkLimits {
            max_bytes: usize::MAX,
            max_rows: 2,
        });
        assert!(assembler.push(text_row(1)).is_none());
        assert!(assembler.push(text_row(1)).is_none());
        let chunk = assembler.push(text_row(1)).expect("flush");
        assert_eq!(chunk.row_count(), 2);
        assert_eq!(chunk.seq, 0);
        let last = assembler.finish().expect("tail");
        assert_eq!(last.row_count(), 1);
        assert_eq!(last.seq, 1);
        assert!(assembler.finish().is_none());
    }

    #[test]
    fn oversized_row_gets_its_own_chunk() {
        let mut assembler = ChunkAssembler::new(ChunkLimits {
            max_bytes: 64,
            max_rows: 100,
        });
        assert!(assembler.push(text_row(4)).is_none());
        let small = assembler.push(text_row(500)).expect("flush before big row");
        assert_eq!(small.row_count(), 1);
        let big = assembler.push(text_row(4)).expect("big row alone");
        assert_eq!(big.row_count(), 1);
        assert!(big.byte_size > 64);
    }

    #[test]
    fn failed_rows_count_as_one_byte() {
        let failed = Row::Failed {
            row: 3,
            message: "x".repeat(10_000),
        };
        assert_eq!(estimate_row_bytes(&failed), 1);
    }

    #[test]
    fn estimate_matches_json_for_simple_rows() {
        let row = Row::Values(vec![
            NormalizedValue::Int(-42),
            NormalizedValue::Text("abc".into()),
            NormalizedValue::Null,
            NormalizedValue::Object(vec![("k".into(), NormalizedValue::Bool(false))]),
        ]);
        let json = serde_json::to_string(&row).expect("json");
        assert_eq!(estimate_row_bytes(&row), json.len() + 1);
    }

    #[test]
    fn column_change_flushes() {
        let mut assembler = ChunkAssembler::new(ChunkLimits::default());
        assert!(assembler.set_columns(columns(&["a"])).is_none());
        assembler.push(text_row(1));
        assert!(assembler.set_columns(columns(&["a"])).is_none());
        let chunk = assembler.set_columns(columns(&["b"])).expect("flush");
        assert_eq!(&*chunk.columns, &["a".to_string()]);
    }

    #[test]
    fn json_body_shape() {
        let chunk = Chunk {
            seq: 0,
            columns: columns(&["n"]),
            rows: vec![
                Row::Values(vec![NormalizedValue::Int(1)]),
                Row::Failed {
                    row: 1,
                    message: "bad".into(),
                },
            ],
            byte_size: 0,
        };
        let body = String::from_utf8(chunk.to_json().expect("json")).expect("utf8");
        assert_eq!(body, r#"{"columns":["n"],"rows":[[1],{"error":"bad","row":1}]}"#);
    }

    #[test]
    fn arrow_slices_respect_row_ceiling_and_decode() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, false),
        ]));
        let ids: Vec<i64> = (0..1000).collect();
        let names: Vec<String> = ids.iter().map(|id| format!("row-{id}")).collect();
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(names)),
            ],
        )
        .expect("batch");
        let slices = split_batch(
            &batch,
            &ChunkLimits {
                max_bytes: usize::MAX,
                max_rows: 300,
            },
        );
        let sizes: Vec<_> = slices.iter().map(RecordBatch::num_rows).collect();
        assert_eq!(sizes, vec![300, 300, 300, 100]);

        let bytes = encode_ipc(&slices[3]).expect("ipc");
        let mut reader = StreamReader::try_new(Cursor::new(bytes), None).expect("reader");
        let decoded = reader.next().expect("batch").expect("decode");
        assert_eq!(decoded.num_rows(), 100);
        let names = decoded.column(1).as_any().downcast_ref::<StringArray>().expect("utf8");
        assert_eq!(names.value(0), "row-900");
    }

    #[test]
    fn tiny_byte_ceiling_still_makes_progress() {
        let batch = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)])),
            vec![Arc::new(Int64Array::from(vec![1, 2, 3]))],
        )
        .expect("batch");
        let slices = split_batch(
            &batch,
            &ChunkLimits {
                max_bytes: 1,
                max_rows: 500,
            },
        );
        assert_eq!(slices.len(), 3);
    }

    proptest! {
        #[test]
        fn chunks_stay_within_limits(
            lens in proptest::collection::vec(0usize..400, 0..200),
            failed in proptest::collection::vec(any::<bool>(), 200),
            max_bytes in 16usize..2048,
            max_rows in 1usize..20,
        ) {
            let limits = ChunkLimits { max_bytes, max_rows };
            let mut assembler = ChunkAssembler::new(limits);
            let mut chunks = Vec::new();
            for (idx, len) in lens.iter().enumerate() {
                let row = if failed[idx] {
                    Row::Failed { row: idx as u64, message: "bad".into() }
                } else {
                    text_row(*len)
                };
                chunks.extend(assembler.push(row));
            }
            chunks.extend(assembler.finish());

            let total: usize = chunks.iter().map(Chunk::row_count).sum();
            prop_assert_eq!(total, lens.len());
            for (seq, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.seq, seq as u64);
                prop_assert!(chunk.row_count() <= max_rows);
                prop_assert!(chunk.byte_size <= max_bytes || chunk.row_count() == 1);
            }
        }
    }
}
