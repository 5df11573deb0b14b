use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{One, ToPrimitive, Zero};

use super::{MAX_SAFE_INTEGER, MIN_SAFE_INTEGER, NormalizedValue};

/// Unscaled part of a decimal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Unscaled {
    /// Two's-complement little-endian 32-bit words.
    Words(Vec<u32>),
    /// Decimal digits as reported by engines that hand decimals over as text.
    Digits(String),
}

/// Folds little-endian 32-bit words into an integer, recovering the sign
/// from the top bit when `signed`.
pub fn wide_to_bigint(words: &[u32], signed: bool) -> BigInt {
    let mut acc = BigUint::zero();
    for word in words.iter().rev() {
        acc = (acc << 32u32) | BigUint::from(*word);
    }
    let mut value = BigInt::from_biguint(Sign::Plus, acc);
    if signed && !words.is_empty() {
        let bits = 32 * words.len();
        if value >= BigInt::one() << (bits - 1) {
            value -= BigInt::one() << bits;
        }
    }
    value
}

pub fn decode_wide(words: &[u32], signed: bool) -> NormalizedValue {
    integer_value(&wide_to_bigint(words, signed))
}

pub fn decode_i64(value: i64) -> NormalizedValue {
    if (MIN_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&value) {
        NormalizedValue::Int(value)
    } else {
        NormalizedValue::BigInt(value.to_string())
    }
}

pub fn decode_u64(value: u64) -> NormalizedValue {
    match i64::try_from(value) {
        Ok(value) if value <= MAX_SAFE_INTEGER => NormalizedValue::Int(value),
        _ => NormalizedValue::BigInt(value.to_string()),
    }
}

/// Applies `scale` to the unscaled integer.
///
/// Safe-range unscaled values become a double (`unscaled / 10^scale`); wider
/// ones become an exact decimal string. A non-positive scale leaves the
/// integer untouched, and text that is not an integer yields null.
pub fn decode_decimal(unscaled: &Unscaled, scale: i32) -> NormalizedValue {
    let value = match unscaled {
        Unscaled::Words(words) => wide_to_bigint(words, true),
        Unscaled::Digits(digits) => match digits.trim().parse::<BigInt>() {
            Ok(value) => value,
            Err(_) => return NormalizedValue::Null,
        },
    };
    if scale <= 0 {
        return integer_value(&value);
    }
    match value.to_i64() {
        Some(small) if (MIN_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&small) => {
            NormalizedValue::float(small as f64 / 10f64.powi(scale))
        }
        _ => NormalizedValue::DecimalText(scaled_digits(&value, scale as usize)),
    }
}

fn integer_value(value: &BigInt) -> NormalizedValue {
    match value.to_i64() {
        Some(small) => decode_i64(small),
        None => NormalizedValue::BigInt(value.to_string()),
    }
}

fn scaled_digits(value: &BigInt, scale: usize) -> String {
    let mut digits = value.magnitude().to_string();
    if digits.len() <= scale {
        digits.insert_str(0, &"0".repeat(scale + 1 - digits.len()));
    }
    let point = digits.len() - scale;
    let sign = if value.sign() == Sign::Minus { "-" } else { "" };
    format!("{sign}{}.{}", &digits[..point], &digits[point..])
}
