//! SQLite engine: rusqlite connection rows packed into Arrow record batches.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{
    Array, ArrayRef, AsArray, BinaryArray, Float64Array, Int64Array, NullArray, StringArray,
};
use arrow::csv::ReaderBuilder;
use arrow::csv::reader::Format;
use arrow::datatypes::{DataType, Field, Float64Type, Int64Type, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use rusqlite::types::Value;
use rusqlite::{Connection, ErrorCode, InterruptHandle, OpenFlags, params_from_iter};
use tempfile::TempDir;
use tracing::debug;

use crate::engine::{BatchSink, Engine, EngineConnector, EngineSetting, Interrupt};
use crate::error::EngineError;

const BUSY_TIMEOUT_MS: u64 = 100;
const MEMORY_SOURCE: &str = ":memory:";
const SQLITE_MAGIC: &[u8] = b"SQLite format 3\0";
const CSV_SCHEMA_SAMPLE_ROWS: usize = 1000;
/// Largest integer magnitude a Float64 column holds exactly.
const MAX_EXACT_FLOAT_INT: i64 = (1 << 53) - 1;

/// Opens SQLite databases; falls back to a private in-memory database.
#[derive(Clone, Copy, Debug, Default)]
pub struct SqliteConnector;

impl EngineConnector for SqliteConnector {
    fn open(&self, source: &str) -> Result<Box<dyn Engine>, EngineError> {
        Ok(Box::new(SqliteEngine::open(source)?))
    }

    fn default_source(&self) -> &str {
        MEMORY_SOURCE
    }
}

pub struct SqliteEngine {
    conn: Connection,
    // Registered database images live here until the engine closes.
    scratch: Option<TempDir>,
}

impl SqliteEngine {
    /// Opens an existing database file or `file:` URI. Candidates are never
    /// created, so a mistyped source fails its probe instead of producing an
    /// empty database.
    pub fn open(source: &str) -> Result<Self, EngineError> {
        let conn = if source == MEMORY_SOURCE {
            Connection::open_in_memory()?
        } else {
            let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            Connection::open_with_flags(Path::new(source), flags)?
        };
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        Ok(Self {
            conn,
            scratch: None,
        })
    }

    pub fn open_in_memory() -> Result<Self, EngineError> {
        Self::open(MEMORY_SOURCE)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn attach_database(&mut self, alias: &str, bytes: &[u8]) -> Result<(), EngineError> {
        if self.scratch.is_none() {
            self.scratch = Some(tempfile::tempdir()?);
        }
        let Some(scratch) = self.scratch.as_ref() else {
            return Err(EngineError::Message("scratch directory unavailable".into()));
        };
        let path = scratch.path().join(format!("{alias}.sqlite"));
        std::fs::write(&path, bytes)?;
        let path = path.to_string_lossy();
        self.conn
            .execute(
                &format!("ATTACH DATABASE ?1 AS {}", quote_identifier(alias)),
                [path.as_ref()],
            )
            .map_err(|source| EngineError::Attach {
                alias: alias.to_string(),
                source,
            })?;
        debug!(alias, bytes = bytes.len(), "attached registered database");
        Ok(())
    }

    fn load_csv(&mut self, table: &str, bytes: &[u8]) -> Result<(), EngineError> {
        let format = Format::default().with_header(true);
        let (schema, _) = format.infer_schema(Cursor::new(bytes), Some(CSV_SCHEMA_SAMPLE_ROWS))?;
        let schema = Arc::new(schema);
        let reader = ReaderBuilder::new(schema.clone())
            .with_header(true)
            .build(Cursor::new(bytes))?;

        let table_name = quote_identifier(table);
        let column_defs = schema
            .fields()
            .iter()
            .map(|field| {
                format!(
                    "{} {}",
                    quote_identifier(field.name()),
                    sqlite_type(field.data_type())
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=schema.fields().len())
            .map(|idx| format!("?{idx}"))
            .collect::<Vec<_>>()
            .join(", ");

        let tx = self.conn.transaction()?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {table_name}; CREATE TABLE {table_name} ({column_defs});"
        ))?;
        let mut loaded = 0usize;
        {
            let mut insert =
                tx.prepare(&format!("INSERT INTO {table_name} VALUES ({placeholders})"))?;
            for batch in reader {
                let batch = batch?;
                for row in 0..batch.num_rows() {
                    let values = batch
                        .columns()
                        .iter()
                        .map(|column| sql_value(column, row))
                        .collect::<Result<Vec<_>, _>>()?;
                    insert.execute(params_from_iter(values.iter()))?;
                }
                loaded += batch.num_rows();
            }
        }
        tx.commit()?;
        debug!(table, rows = loaded, "loaded registered csv");
        Ok(())
    }
}

impl Engine for SqliteEngine {
    fn probe(&mut self) -> Result<(), EngineError> {
        let one: i64 = self
            .conn
            .query_row("SELECT 1", [], |row| row.get(0))
            .map_err(engine_error)?;
        if one != 1 {
            return Err(EngineError::Message(format!("probe returned {one}")));
        }
        Ok(())
    }

    fn apply(&mut self, setting: &EngineSetting) -> Result<(), EngineError> {
        match setting {
            EngineSetting::MemoryLimit(bytes) => {
                let limit = i64::try_from(*bytes).unwrap_or(i64::MAX);
                let applied: i64 = self.conn.pragma_update_and_check(
                    None,
                    "soft_heap_limit",
                    limit,
                    |row| row.get(0),
                )?;
                debug!(applied, "sqlite soft heap limit set");
            }
            EngineSetting::Threads(threads) => {
                let requested = i64::try_from(*threads).unwrap_or(i64::MAX);
                let applied: i64 =
                    self.conn
                        .pragma_update_and_check(None, "threads", requested, |row| row.get(0))?;
                debug!(applied, "sqlite helper threads set");
            }
            EngineSetting::PreserveInsertionOrder(_) | EngineSetting::TimeZone(_) => {
                return Err(EngineError::Unsupported(format!(
                    "sqlite has no {} setting",
                    setting.name()
                )));
            }
        }
        Ok(())
    }

    fn execute(
        &mut self,
        sql: &str,
        batch_rows: usize,
        sink: &mut BatchSink<'_>,
    ) -> Result<(), EngineError> {
        let batch_rows = batch_rows.max(1);
        let mut stmt = self.conn.prepare(sql).map_err(engine_error)?;
        let names: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut columns: Vec<Vec<Value>> = names
            .iter()
            .map(|_| Vec::with_capacity(batch_rows))
            .collect();
        let mut rows = stmt.query([]).map_err(engine_error)?;
        while let Some(row) = rows.next().map_err(engine_error)? {
            for (idx, column) in columns.iter_mut().enumerate() {
                column.push(row.get::<_, Value>(idx).map_err(engine_error)?);
            }
            if columns.first().is_some_and(|column| column.len() >= batch_rows) {
                let batch = build_batch(&names, &mut columns)?;
                if sink(batch).is_break() {
                    return Ok(());
                }
            }
        }
        if columns.first().is_some_and(|column| !column.is_empty()) {
            let batch = build_batch(&names, &mut columns)?;
            let _ = sink(batch);
        }
        Ok(())
    }

    fn describe(&mut self, sql: &str) -> Result<SchemaRef, EngineError> {
        let stmt = self.conn.prepare(sql).map_err(engine_error)?;
        let fields: Vec<Field> = stmt
            .columns()
            .iter()
            .map(|column| Field::new(column.name(), declared_type(column.decl_type()), true))
            .collect();
        Ok(Arc::new(Schema::new(fields)))
    }

    fn register_file(&mut self, name: &str, bytes: &[u8]) -> Result<(), EngineError> {
        let alias = source_alias(name)?;
        if bytes.starts_with(SQLITE_MAGIC) {
            return self.attach_database(&alias, bytes);
        }
        if name.to_ascii_lowercase().ends_with(".csv") {
            return self.load_csv(&alias, bytes);
        }
        Err(EngineError::Unsupported(format!(
            "cannot register '{name}': expected a SQLite database image or a .csv file"
        )))
    }

    fn release_memory(&mut self) -> Result<(), EngineError> {
        self.conn.execute_batch("PRAGMA shrink_memory")?;
        Ok(())
    }

    fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        Some(Arc::new(SqliteInterrupt(self.conn.get_interrupt_handle())))
    }

    fn close(self: Box<Self>) -> Result<(), EngineError> {
        let SqliteEngine { conn, scratch } = *self;
        let closed = conn.close().map_err(|(_, err)| EngineError::from(err));
        drop(scratch);
        closed
    }
}

struct SqliteInterrupt(InterruptHandle);

impl Interrupt for SqliteInterrupt {
    fn interrupt(&self) {
        self.0.interrupt();
    }
}

fn engine_error(err: rusqlite::Error) -> EngineError {
    if err.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) {
        return EngineError::Interrupted;
    }
    EngineError::Sqlite(err)
}

fn build_batch(names: &[String], columns: &mut [Vec<Value>]) -> Result<RecordBatch, EngineError> {
    let mut fields = Vec::with_capacity(names.len());
    let mut arrays = Vec::with_capacity(names.len());
    for (name, column) in names.iter().zip(columns.iter_mut()) {
        let capacity = column.len();
        let values = std::mem::replace(column, Vec::with_capacity(capacity));
        let array = column_array(&values);
        fields.push(Field::new(name, array.data_type().clone(), true));
        arrays.push(array);
    }
    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

/// SQLite is dynamically typed, so the Arrow type is chosen per batch from
/// the storage classes actually present in the column. Integers mixed with
/// reals widen to Float64 only while every integer survives the widening;
/// otherwise the column is stringified.
fn column_array(values: &[Value]) -> ArrayRef {
    let (mut ints, mut reals, mut texts, mut blobs) = (false, false, false, false);
    let mut wide_ints = false;
    for value in values {
        match value {
            Value::Null => {}
            Value::Integer(v) => {
                ints = true;
                wide_ints |= v.unsigned_abs() > MAX_EXACT_FLOAT_INT as u64;
            }
            Value::Real(_) => reals = true,
            Value::Text(_) => texts = true,
            Value::Blob(_) => blobs = true,
        }
    }
    if texts || (blobs && (ints || reals)) || (reals && wide_ints) {
        Arc::new(values.iter().map(stringify_value).collect::<StringArray>())
    } else if blobs {
        Arc::new(
            values
                .iter()
                .map(|value| match value {
                    Value::Blob(bytes) => Some(bytes.as_slice()),
                    _ => None,
                })
                .collect::<BinaryArray>(),
        )
    } else if reals {
        Arc::new(
            values
                .iter()
                .map(|value| match value {
                    Value::Integer(v) => Some(*v as f64),
                    Value::Real(v) => Some(*v),
                    _ => None,
                })
                .collect::<Float64Array>(),
        )
    } else if ints {
        Arc::new(
            values
                .iter()
                .map(|value| match value {
                    Value::Integer(v) => Some(*v),
                    _ => None,
                })
                .collect::<Int64Array>(),
        )
    } else {
        Arc::new(NullArray::new(values.len()))
    }
}

fn stringify_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Integer(v) => Some(v.to_string()),
        Value::Real(v) => Some(v.to_string()),
        Value::Text(text) => Some(text.clone()),
        Value::Blob(bytes) => Some(format!("0x{}", hex::encode(bytes))),
    }
}

/// Column affinity rules from the SQLite type documentation.
fn declared_type(decl: Option<&str>) -> DataType {
    let Some(decl) = decl else {
        return DataType::Null;
    };
    let upper = decl.to_ascii_uppercase();
    if upper.contains("INT") {
        DataType::Int64
    } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
        DataType::Utf8
    } else if upper.is_empty() || upper.contains("BLOB") {
        DataType::Binary
    } else {
        DataType::Float64
    }
}

fn sqlite_type(data_type: &DataType) -> &'static str {
    match data_type {
        DataType::Boolean
        | DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => "INTEGER",
        DataType::Float16 | DataType::Float32 | DataType::Float64 => "REAL",
        _ => "TEXT",
    }
}

fn sql_value(column: &ArrayRef, row: usize) -> Result<Value, EngineError> {
    if column.is_null(row) {
        return Ok(Value::Null);
    }
    let value = match column.data_type() {
        DataType::Int64 => Value::Integer(column.as_primitive::<Int64Type>().value(row)),
        DataType::Float64 => Value::Real(column.as_primitive::<Float64Type>().value(row)),
        DataType::Boolean => Value::Integer(i64::from(column.as_boolean().value(row))),
        DataType::Utf8 => Value::Text(column.as_string::<i32>().value(row).to_string()),
        _ => {
            let options = FormatOptions::default();
            let formatter = ArrayFormatter::try_new(column.as_ref(), &options)?;
            Value::Text(formatter.value(row).try_to_string()?)
        }
    };
    Ok(value)
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Table or schema alias derived from a registered file name.
fn source_alias(file_name: &str) -> Result<String, EngineError> {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut alias: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if alias.is_empty() {
        return Err(EngineError::Unsupported(format!(
            "file name '{file_name}' has no usable table name"
        )));
    }
    if alias.starts_with(|c: char| c.is_ascii_digit()) {
        alias.insert(0, '_');
    }
    Ok(alias)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::ControlFlow;

    fn collect(engine: &mut SqliteEngine, sql: &str, batch_rows: usize) -> Vec<RecordBatch> {
        let mut batches = Vec::new();
        engine
            .execute(sql, batch_rows, &mut |batch| {
                batches.push(batch);
                ControlFlow::Continue(())
            })
            .expect("execute");
        batches
    }

    #[test]
    fn probe_in_memory() {
        let mut engine = SqliteEngine::open_in_memory().expect("open");
        engine.probe().expect("probe");
    }

    #[test]
    fn missing_file_is_not_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.db");
        assert!(SqliteEngine::open(path.to_str().expect("path")).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn rows_are_split_into_batches() {
        let mut engine = SqliteEngine::open_in_memory().expect("open");
        let sql = "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 10) SELECT x FROM n";
        let batches = collect(&mut engine, sql, 4);
        let sizes: Vec<_> = batches.iter().map(RecordBatch::num_rows).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(batches[0].schema().field(0).data_type(), &DataType::Int64);
    }

    #[test]
    fn break_stops_the_statement() {
        let mut engine = SqliteEngine::open_in_memory().expect("open");
        let sql = "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 100) SELECT x FROM n";
        let mut seen = 0;
        engine
            .execute(sql, 10, &mut |_| {
                seen += 1;
                ControlFlow::Break(())
            })
            .expect("execute");
        assert_eq!(seen, 1);
    }

    #[test]
    fn column_types_follow_storage_classes() {
        let mut engine = SqliteEngine::open_in_memory().expect("open");
        let batches = collect(
            &mut engine,
            "SELECT 1 AS i, 1.5 AS r, 'a' AS t, x'00ff' AS b, NULL AS n",
            16,
        );
        let schema = batches[0].schema();
        let types: Vec<_> = schema.fields().iter().map(|f| f.data_type().clone()).collect();
        assert_eq!(
            types,
            vec![
                DataType::Int64,
                DataType::Float64,
                DataType::Utf8,
                DataType::Binary,
                DataType::Null
            ]
        );
    }

    #[test]
    fn mixed_numeric_column_widens_to_float() {
        let mut engine = SqliteEngine::open_in_memory().expect("open");
        let batches = collect(&mut engine, "SELECT 1 UNION ALL SELECT 2.5", 16);
        assert_eq!(batches[0].schema().field(0).data_type(), &DataType::Float64);
    }

    #[test]
    fn mixed_numeric_column_with_wide_integer_stays_exact() {
        let mut engine = SqliteEngine::open_in_memory().expect("open");
        let batches = collect(
            &mut engine,
            "SELECT 9007199254740993 AS v UNION ALL SELECT 0.5",
            16,
        );
        let column = batches[0].column(0).as_string::<i32>();
        assert_eq!(column.value(0), "9007199254740993");
        assert_eq!(column.value(1), "0.5");

        let batches = collect(
            &mut engine,
            "SELECT 9007199254740991 AS v UNION ALL SELECT 0.5",
            16,
        );
        assert_eq!(batches[0].schema().field(0).data_type(), &DataType::Float64);
    }

    #[test]
    fn mixed_text_column_is_stringified() {
        let mut engine = SqliteEngine::open_in_memory().expect("open");
        let batches = collect(&mut engine, "SELECT 1 UNION ALL SELECT 'x'", 16);
        let column = batches[0].column(0).as_string::<i32>();
        assert_eq!(column.value(0), "1");
        assert_eq!(column.value(1), "x");
    }

    #[test]
    fn describe_reports_declared_types() {
        let mut engine = SqliteEngine::open_in_memory().expect("open");
        engine
            .connection()
            .execute_batch("CREATE TABLE t (id INTEGER, name TEXT, score REAL, raw BLOB)")
            .expect("create");
        let schema = engine.describe("SELECT * FROM t").expect("describe");
        let types: Vec<_> = schema.fields().iter().map(|f| f.data_type().clone()).collect();
        assert_eq!(
            types,
            vec![DataType::Int64, DataType::Utf8, DataType::Float64, DataType::Binary]
        );
    }

    #[test]
    fn time_zone_is_unsupported() {
        let mut engine = SqliteEngine::open_in_memory().expect("open");
        let err = engine
            .apply(&EngineSetting::TimeZone("UTC".into()))
            .expect_err("unsupported");
        assert!(matches!(err, EngineError::Unsupported(_)));
        engine
            .apply(&EngineSetting::MemoryLimit(64 * 1024 * 1024))
            .expect("soft heap limit");
    }

    #[test]
    fn register_csv_creates_table() {
        let mut engine = SqliteEngine::open_in_memory().expect("open");
        engine
            .register_file("sales-2024.csv", b"region,amount\nwest,10\neast,32\n")
            .expect("register");
        let batches = collect(
            &mut engine,
            "SELECT SUM(amount) AS total FROM sales_2024",
            16,
        );
        let total = batches[0].column(0).as_primitive::<Int64Type>().value(0);
        assert_eq!(total, 42);
    }

    #[test]
    fn register_database_image_attaches_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("source.db");
        {
            let conn = Connection::open(&path).expect("create");
            conn.execute_batch("CREATE TABLE items (v INTEGER); INSERT INTO items VALUES (7);")
                .expect("seed");
        }
        let bytes = std::fs::read(&path).expect("read image");
        let mut engine = SqliteEngine::open_in_memory().expect("open");
        engine.register_file("lookup.db", &bytes).expect("register");
        let batches = collect(&mut engine, "SELECT v FROM lookup.items", 16);
        assert_eq!(batches[0].column(0).as_primitive::<Int64Type>().value(0), 7);
    }

    #[test]
    fn register_unknown_format_fails() {
        let mut engine = SqliteEngine::open_in_memory().expect("open");
        let err = engine
            .register_file("notes.txt", b"hello")
            .expect_err("unsupported");
        assert!(matches!(err, EngineError::Unsupported(_)));
    }

    #[test]
    fn aliases_are_sanitized() {
        assert_eq!(source_alias("my data.v2.csv").expect("alias"), "my_data_v2");
        assert_eq!(source_alias("2024.csv").expect("alias"), "_2024");
        assert_eq!(source_alias(".csv").expect("alias"), "_csv");
        assert!(source_alias("").is_err());
    }
}
