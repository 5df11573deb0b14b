use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::datatypes::{
    DataType, Date32Type, Date64Type, DurationMicrosecondType, DurationMillisecondType,
    DurationNanosecondType, DurationSecondType, Float16Type, Float32Type, Float64Type, Int8Type,
    Int16Type, Int32Type, Int64Type, IntervalDayTimeType, IntervalMonthDayNanoType, IntervalUnit,
    IntervalYearMonthType, Time32MillisecondType, Time32SecondType, Time64MicrosecondType,
    Time64NanosecondType, TimeUnit, TimestampMicrosecondType, TimestampMillisecondType,
    TimestampNanosecondType, TimestampSecondType, UInt8Type, UInt16Type, UInt32Type, UInt64Type,
};
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};

use super::composite::CompositeArena;
use super::temporal::IntervalParts;
use super::wide::Unscaled;
use super::{DecodeError, NormalizedValue, RawColumnValue, Row, normalize_scalar};

const NANOS_PER_MILLI: i64 = 1_000_000;

/// How a column is read, decided once from its Arrow type.
enum ColumnKind {
    Null,
    Scalar,
    /// Dictionary columns resolve each distinct value once up front.
    Dictionary {
        keys: Vec<usize>,
        entries: Vec<RawColumnValue>,
    },
    Composite,
}

pub struct ColumnDecoder {
    array: ArrayRef,
    kind: ColumnKind,
}

impl ColumnDecoder {
    pub fn new(array: &ArrayRef) -> Self {
        let kind = match array.data_type() {
            DataType::Null => ColumnKind::Null,
            DataType::Dictionary(_, _) => match array.as_any_dictionary_opt() {
                Some(dictionary) => {
                    let values = dictionary.values();
                    let entries = (0..values.len())
                        .map(|idx| dictionary_label(values.as_ref(), idx))
                        .collect();
                    ColumnKind::Dictionary {
                        keys: dictionary.normalized_keys(),
                        entries,
                    }
                }
                None => ColumnKind::Scalar,
            },
            DataType::Struct(_)
            | DataType::List(_)
            | DataType::LargeList(_)
            | DataType::FixedSizeList(_, _)
            | DataType::Map(_, _) => ColumnKind::Composite,
            _ => ColumnKind::Scalar,
        };
        Self {
            array: array.clone(),
            kind,
        }
    }

    pub fn decode(
        &self,
        row: usize,
        arena: &mut CompositeArena,
        max_depth: usize,
    ) -> Result<NormalizedValue, DecodeError> {
        if is_null_at(self.array.as_ref(), row) {
            return Ok(NormalizedValue::Null);
        }
        match &self.kind {
            ColumnKind::Null => Ok(NormalizedValue::Null),
            ColumnKind::Scalar => Ok(normalize_scalar(&scalar_value(self.array.as_ref(), row)?)),
            ColumnKind::Dictionary { keys, entries } => Ok(keys
                .get(row)
                .and_then(|key| entries.get(*key))
                .map_or(NormalizedValue::Null, normalize_scalar)),
            ColumnKind::Composite => {
                arena.clear();
                let root = arena.extract(&self.array, row)?;
                arena.normalize(root, max_depth)
            }
        }
    }
}

/// Decodes the rows of one record batch.
pub struct BatchDecoder {
    columns: Arc<[String]>,
    decoders: Vec<ColumnDecoder>,
    rows: usize,
    arena: CompositeArena,
    max_depth: usize,
}

impl BatchDecoder {
    pub fn new(batch: &RecordBatch, max_depth: usize) -> Self {
        let columns: Arc<[String]> = batch
            .schema()
            .fields()
            .iter()
            .map(|field| field.name().clone())
            .collect();
        Self {
            columns,
            decoders: batch.columns().iter().map(ColumnDecoder::new).collect(),
            rows: batch.num_rows(),
            arena: CompositeArena::new(),
            max_depth,
        }
    }

    pub fn columns(&self) -> Arc<[String]> {
        self.columns.clone()
    }

    pub fn num_rows(&self) -> usize {
        self.rows
    }

    /// Decodes `row`; `ordinal` is the row's position in the whole result
    /// and is reported when a cell fails.
    pub fn decode_row(&mut self, row: usize, ordinal: u64) -> Row {
        let mut values = Vec::with_capacity(self.decoders.len());
        for (column, decoder) in self.columns.iter().zip(&self.decoders) {
            match decoder.decode(row, &mut self.arena, self.max_depth) {
                Ok(value) => values.push(value),
                Err(err) => {
                    return Row::Failed {
                        row: ordinal,
                        message: format!("column \"{column}\": {err}"),
                    };
                }
            }
        }
        Row::Values(values)
    }
}

/// `NullArray` reports no nulls through `is_null`, so its type is checked.
pub(crate) fn is_null_at(array: &dyn Array, row: usize) -> bool {
    matches!(array.data_type(), DataType::Null) || array.is_null(row)
}

/// Resolves one cell of a dictionary array nested inside a composite,
/// reading only the key at `row`.
pub(crate) fn dictionary_entry(array: &dyn Array, row: usize) -> Result<RawColumnValue, DecodeError> {
    let Some(dictionary) = array.as_any_dictionary_opt() else {
        return fallback(array, row);
    };
    let keys = dictionary.keys();
    if row >= keys.len() || keys.is_null(row) {
        return Ok(RawColumnValue::Null);
    }
    let key = match scalar_value(keys, row)? {
        RawColumnValue::Int64(key) => usize::try_from(key).ok(),
        RawColumnValue::UInt64(key) => usize::try_from(key).ok(),
        _ => None,
    };
    Ok(key.map_or(RawColumnValue::Null, |key| {
        dictionary_label(dictionary.values().as_ref(), key)
    }))
}

fn dictionary_label(values: &dyn Array, index: usize) -> RawColumnValue {
    if index >= values.len() || is_null_at(values, index) {
        return RawColumnValue::Null;
    }
    let label = match scalar_value(values, index) {
        Ok(RawColumnValue::Text(text)) => Some(text),
        Ok(raw) => Some(normalize_scalar(&raw).to_key()),
        Err(_) => None,
    };
    RawColumnValue::Enum { index, label }
}

/// Lifts one non-null, non-nested cell out of an Arrow array.
pub(crate) fn scalar_value(array: &dyn Array, row: usize) -> Result<RawColumnValue, DecodeError> {
    let value = match array.data_type() {
        DataType::Null => RawColumnValue::Null,
        DataType::Boolean => RawColumnValue::Bool(array.as_boolean().value(row)),
        DataType::Int8 => RawColumnValue::Int64(array.as_primitive::<Int8Type>().value(row).into()),
        DataType::Int16 => {
            RawColumnValue::Int64(array.as_primitive::<Int16Type>().value(row).into())
        }
        DataType::Int32 => {
            RawColumnValue::Int64(array.as_primitive::<Int32Type>().value(row).into())
        }
        DataType::Int64 => RawColumnValue::Int64(array.as_primitive::<Int64Type>().value(row)),
        DataType::UInt8 => {
            RawColumnValue::UInt64(array.as_primitive::<UInt8Type>().value(row).into())
        }
        DataType::UInt16 => {
            RawColumnValue::UInt64(array.as_primitive::<UInt16Type>().value(row).into())
        }
        DataType::UInt32 => {
            RawColumnValue::UInt64(array.as_primitive::<UInt32Type>().value(row).into())
        }
        DataType::UInt64 => RawColumnValue::UInt64(array.as_primitive::<UInt64Type>().value(row)),
        DataType::Float16 => {
            RawColumnValue::Float32(array.as_primitive::<Float16Type>().value(row).to_f32())
        }
        DataType::Float32 => RawColumnValue::Float32(array.as_primitive::<Float32Type>().value(row)),
        DataType::Float64 => RawColumnValue::Float64(array.as_primitive::<Float64Type>().value(row)),
        DataType::Decimal128(precision, scale) => {
            let unscaled = array.as_primitive::<arrow::datatypes::Decimal128Type>().value(row);
            RawColumnValue::Decimal {
                unscaled: Unscaled::Words(le_words(&unscaled.to_le_bytes())),
                scale: i32::from(*scale),
                precision: *precision,
            }
        }
        DataType::Decimal256(precision, scale) => {
            let unscaled = array.as_primitive::<arrow::datatypes::Decimal256Type>().value(row);
            RawColumnValue::Decimal {
                unscaled: Unscaled::Words(le_words(&unscaled.to_le_bytes())),
                scale: i32::from(*scale),
                precision: *precision,
            }
        }
        DataType::Utf8 => RawColumnValue::Text(array.as_string::<i32>().value(row).to_string()),
        DataType::LargeUtf8 => {
            RawColumnValue::Text(array.as_string::<i64>().value(row).to_string())
        }
        DataType::Utf8View => RawColumnValue::Text(array.as_string_view().value(row).to_string()),
        DataType::Binary => RawColumnValue::Binary(array.as_binary::<i32>().value(row).to_vec()),
        DataType::LargeBinary => {
            RawColumnValue::Binary(array.as_binary::<i64>().value(row).to_vec())
        }
        DataType::BinaryView => RawColumnValue::Binary(array.as_binary_view().value(row).to_vec()),
        DataType::FixedSizeBinary(_) => {
            RawColumnValue::Binary(array.as_fixed_size_binary().value(row).to_vec())
        }
        DataType::Date32 => RawColumnValue::Date(
            array
                .as_primitive::<Date32Type>()
                .value_as_date(row)
                .ok_or_else(|| out_of_range(array, row))?,
        ),
        DataType::Date64 => RawColumnValue::Date(
            array
                .as_primitive::<Date64Type>()
                .value_as_date(row)
                .ok_or_else(|| out_of_range(array, row))?,
        ),
        DataType::Timestamp(unit, tz) => {
            let value = match unit {
                TimeUnit::Second => array
                    .as_primitive::<TimestampSecondType>()
                    .value_as_datetime(row),
                TimeUnit::Millisecond => array
                    .as_primitive::<TimestampMillisecondType>()
                    .value_as_datetime(row),
                TimeUnit::Microsecond => array
                    .as_primitive::<TimestampMicrosecondType>()
                    .value_as_datetime(row),
                TimeUnit::Nanosecond => array
                    .as_primitive::<TimestampNanosecondType>()
                    .value_as_datetime(row),
            };
            RawColumnValue::Timestamp {
                value: value.ok_or_else(|| out_of_range(array, row))?,
                utc: tz.is_some(),
            }
        }
        DataType::Time32(TimeUnit::Second) => RawColumnValue::Time(
            array
                .as_primitive::<Time32SecondType>()
                .value_as_time(row)
                .ok_or_else(|| out_of_range(array, row))?,
        ),
        DataType::Time32(TimeUnit::Millisecond) => RawColumnValue::Time(
            array
                .as_primitive::<Time32MillisecondType>()
                .value_as_time(row)
                .ok_or_else(|| out_of_range(array, row))?,
        ),
        DataType::Time64(TimeUnit::Microsecond) => RawColumnValue::Time(
            array
                .as_primitive::<Time64MicrosecondType>()
                .value_as_time(row)
                .ok_or_else(|| out_of_range(array, row))?,
        ),
        DataType::Time64(TimeUnit::Nanosecond) => RawColumnValue::Time(
            array
                .as_primitive::<Time64NanosecondType>()
                .value_as_time(row)
                .ok_or_else(|| out_of_range(array, row))?,
        ),
        DataType::Duration(unit) => {
            let (value, factor) = match unit {
                TimeUnit::Second => (
                    array.as_primitive::<DurationSecondType>().value(row),
                    1_000_000_000,
                ),
                TimeUnit::Millisecond => (
                    array.as_primitive::<DurationMillisecondType>().value(row),
                    NANOS_PER_MILLI,
                ),
                TimeUnit::Microsecond => (
                    array.as_primitive::<DurationMicrosecondType>().value(row),
                    1_000,
                ),
                TimeUnit::Nanosecond => {
                    (array.as_primitive::<DurationNanosecondType>().value(row), 1)
                }
            };
            let nanos = value
                .checked_mul(factor)
                .ok_or_else(|| out_of_range(array, row))?;
            RawColumnValue::Interval(IntervalParts {
                nanos,
                ..IntervalParts::default()
            })
        }
        DataType::Interval(IntervalUnit::YearMonth) => RawColumnValue::Interval(IntervalParts {
            months: array.as_primitive::<IntervalYearMonthType>().value(row),
            ..IntervalParts::default()
        }),
        DataType::Interval(IntervalUnit::DayTime) => {
            let value = array.as_primitive::<IntervalDayTimeType>().value(row);
            RawColumnValue::Interval(IntervalParts {
                months: 0,
                days: value.days,
                nanos: i64::from(value.milliseconds) * NANOS_PER_MILLI,
            })
        }
        DataType::Interval(IntervalUnit::MonthDayNano) => {
            let array = array.as_primitive::<IntervalMonthDayNanoType>();
            // The typed accessor does not expose the packed words, so the
            // interval is read from the value buffer directly.
            let parts = IntervalParts::from_le_bytes(array.values().inner().as_slice(), row)
                .unwrap_or_else(|| {
                    let value = array.value(row);
                    IntervalParts {
                        months: value.months,
                        days: value.days,
                        nanos: value.nanoseconds,
                    }
                });
            RawColumnValue::Interval(parts)
        }
        _ => return fallback(array, row),
    };
    Ok(value)
}

/// Arrow's display formatter for types without a dedicated conversion.
fn fallback(array: &dyn Array, row: usize) -> Result<RawColumnValue, DecodeError> {
    let options = FormatOptions::default();
    let format_error = |err: arrow::error::ArrowError| DecodeError::Format {
        data_type: array.data_type().to_string(),
        reason: err.to_string(),
    };
    let formatter = ArrayFormatter::try_new(array, &options).map_err(format_error)?;
    let text = formatter.value(row).try_to_string().map_err(format_error)?;
    Ok(RawColumnValue::Text(text))
}

fn out_of_range(array: &dyn Array, row: usize) -> DecodeError {
    DecodeError::OutOfRange(format!("{} value at row {row}", array.data_type()))
}

fn le_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
