//! Conversion of engine values into values the host can represent exactly.
//!
//! Every Arrow column is classified once ([`ColumnDecoder`]), each cell is
//! lifted into a [`RawColumnValue`] (or a [`RawNode`] tree for nested
//! values) and then normalized. Integers that do not fit the host's
//! safe-integer range travel as decimal strings, non-finite floats become
//! null, and a cell that cannot be decoded turns its row into
//! [`Row::Failed`] instead of failing the query.

mod column;
mod composite;
mod temporal;
mod wide;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use thiserror::Error;

pub use column::{BatchDecoder, ColumnDecoder};
pub use composite::{CIRCULAR_MARKER, CompositeArena, MAX_DEPTH_MARKER, NodeId, RawNode};
pub use temporal::{IntervalParts, format_date, format_interval, format_time, format_timestamp};
pub use wide::{Unscaled, decode_decimal, decode_i64, decode_u64, decode_wide, wide_to_bigint};

/// Largest integer an IEEE-754 double represents exactly (2^53 - 1).
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;
pub const MIN_SAFE_INTEGER: i64 = -MAX_SAFE_INTEGER;

/// Placeholder text produced by naive object-to-string coercion; never a
/// real label.
const PLACEHOLDER_LABELS: &[&str] = &["[object Object]"];

/// Host-safe value.
#[derive(Clone, Debug, PartialEq)]
pub enum NormalizedValue {
    Null,
    Bool(bool),
    /// Always within `MIN_SAFE_INTEGER..=MAX_SAFE_INTEGER`.
    Int(i64),
    /// Exact decimal digits of an integer outside the safe range.
    BigInt(String),
    /// Always finite.
    Float(f64),
    /// Exact scaled decimal too wide for a double.
    DecimalText(String),
    Text(String),
    Array(Vec<NormalizedValue>),
    /// Entries keep their source order.
    Object(Vec<(String, NormalizedValue)>),
}

impl NormalizedValue {
    pub fn float(value: f64) -> Self {
        if value.is_finite() {
            NormalizedValue::Float(value)
        } else {
            NormalizedValue::Null
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, NormalizedValue::Null)
    }

    /// Text form used where a value must become a string, such as map keys
    /// and dictionary labels.
    pub fn to_key(&self) -> String {
        match self {
            NormalizedValue::Text(text)
            | NormalizedValue::BigInt(text)
            | NormalizedValue::DecimalText(text) => text.clone(),
            other => serde_json::to_string(other).unwrap_or_else(|_| "null".to_string()),
        }
    }
}

impl Serialize for NormalizedValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            NormalizedValue::Null => serializer.serialize_unit(),
            NormalizedValue::Bool(value) => serializer.serialize_bool(*value),
            NormalizedValue::Int(value) => serializer.serialize_i64(*value),
            NormalizedValue::Float(value) => serializer.serialize_f64(*value),
            NormalizedValue::BigInt(text)
            | NormalizedValue::DecimalText(text)
            | NormalizedValue::Text(text) => serializer.serialize_str(text),
            NormalizedValue::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            NormalizedValue::Object(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

/// Engine-native scalar as lifted out of a result batch.
#[derive(Clone, Debug, PartialEq)]
pub enum RawColumnValue {
    Null,
    Bool(bool),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    /// Little-endian 32-bit words, 4 or 8 of them.
    WideInt {
        words: Vec<u32>,
        signed: bool,
    },
    Decimal {
        unscaled: Unscaled,
        scale: i32,
        precision: u8,
    },
    Binary(Vec<u8>),
    Text(String),
    Enum {
        index: usize,
        label: Option<String>,
    },
    Date(NaiveDate),
    Timestamp {
        value: NaiveDateTime,
        utc: bool,
    },
    Time(NaiveTime),
    Interval(IntervalParts),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{0} is out of range")]
    OutOfRange(String),

    #[error("cannot format {data_type}: {reason}")]
    Format { data_type: String, reason: String },

    #[error("composite value references missing node {0}")]
    DanglingNode(usize),
}

/// One decoded result row.
#[derive(Clone, Debug, PartialEq)]
pub enum Row {
    Values(Vec<NormalizedValue>),
    /// A cell in this row could not be decoded; `row` is its ordinal within
    /// the query result.
    Failed { row: u64, message: String },
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Row::Values(values) => values.serialize(serializer),
            Row::Failed { row, message } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("error", message)?;
                map.serialize_entry("row", row)?;
                map.end()
            }
        }
    }
}

/// Normalizes one scalar. Never fails: out-of-range numbers become strings
/// and malformed numeric input becomes null.
pub fn normalize_scalar(raw: &RawColumnValue) -> NormalizedValue {
    match raw {
        RawColumnValue::Null => NormalizedValue::Null,
        RawColumnValue::Bool(value) => NormalizedValue::Bool(*value),
        RawColumnValue::Int64(value) => decode_i64(*value),
        RawColumnValue::UInt64(value) => decode_u64(*value),
        RawColumnValue::Float32(value) => NormalizedValue::float(f64::from(*value)),
        RawColumnValue::Float64(value) => NormalizedValue::float(*value),
        RawColumnValue::WideInt { words, signed } => decode_wide(words, *signed),
        RawColumnValue::Decimal {
            unscaled, scale, ..
        } => decode_decimal(unscaled, *scale),
        RawColumnValue::Binary(bytes) => NormalizedValue::Text(format!("0x{}", hex::encode(bytes))),
        RawColumnValue::Text(text) => NormalizedValue::Text(text.clone()),
        RawColumnValue::Enum { index, label } => match label {
            Some(label) if !PLACEHOLDER_LABELS.contains(&label.as_str()) => {
                NormalizedValue::Text(label.clone())
            }
            _ => NormalizedValue::Text(index.to_string()),
        },
        RawColumnValue::Date(date) => NormalizedValue::Text(format_date(date)),
        RawColumnValue::Timestamp { value, utc } => {
            NormalizedValue::Text(format_timestamp(value, *utc))
        }
        RawColumnValue::Time(time) => NormalizedValue::Text(format_time(time)),
        RawColumnValue::Interval(parts) => NormalizedValue::Text(format_interval(parts)),
    }
}
