//! Shard field values and numeric deltas.
//!
//! Shard documents are JSON-like maps of fields ([`Fields`]). Two field names
//! are reserved for rollup bookkeeping and can never be written by callers:
//!
//! | Field | Constant | Meaning |
//! |-------|----------|---------|
//! | `did` | [`DOCUMENT_ID_FIELD`] | Path of the parent document owning the shard |
//! | `ct`  | [`CREATION_TICK_FIELD`] | Tick of the last write, plus one interval |
//!
//! `did` stores the parent's full path (`posts/p1`), not its bare id, so
//! parents with the same id in different collections never share a group
//! during rollup.
//!
//! Every other numeric field holds a partial count. Deltas are expressed as a
//! [`Delta`], which is either a 64-bit signed integer or a finite 64-bit
//! float. The sealed [`IntoDelta`] trait converts every primitive integer and
//! float type, and JSON numbers, refusing values that would be truncated.
//!
//! ```rust
//! use contatori_distribuiti::value::{Delta, IntoDelta};
//!
//! assert_eq!(5u8.into_delta().unwrap(), Delta::Integer(5));
//! assert_eq!(0.5f32.into_delta().unwrap(), Delta::Float(0.5));
//! assert!(u64::MAX.into_delta().is_err());
//! assert!(f64::NAN.into_delta().is_err());
//! ```

use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use thiserror::Error;

use crate::error::ConfigError;

/// Field holding the parent document path of a shard.
pub const DOCUMENT_ID_FIELD: &str = "did";

/// Field holding the tick at which a shard becomes eligible for rollup.
pub const CREATION_TICK_FIELD: &str = "ct";

/// All field names reserved for rollup bookkeeping.
pub const RESERVED_FIELDS: [&str; 2] = [DOCUMENT_ID_FIELD, CREATION_TICK_FIELD];

/// The fields of a document.
pub type Fields = serde_json::Map<String, Value>;

/// Returns `true` if `field` is reserved for rollup bookkeeping.
pub fn is_reserved_field(field: &str) -> bool {
    RESERVED_FIELDS.contains(&field)
}

/// Rejects reserved field names.
pub(crate) fn check_field(field: &str) -> Result<(), ConfigError> {
    if is_reserved_field(field) {
        Err(ConfigError::ReservedField(field.to_string()))
    } else {
        Ok(())
    }
}

/// Rejects a field map that uses any reserved field name.
pub(crate) fn check_fields(fields: &Fields) -> Result<(), ConfigError> {
    fields.keys().try_for_each(|key| check_field(key))
}

/// Human readable name of a JSON value kind.
pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A numeric amount added to a shard or parent field.
///
/// Integer plus integer stays an integer; as soon as a float is involved the
/// result is a float, mirroring how document stores apply increments.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Delta {
    /// A signed 64-bit integer amount.
    Integer(i64),
    /// A finite 64-bit float amount.
    Float(f64),
}

impl Delta {
    /// Returns `true` if adding this delta changes nothing.
    pub fn is_zero(&self) -> bool {
        match self {
            Delta::Integer(v) => *v == 0,
            Delta::Float(v) => *v == 0.0,
        }
    }

    /// Adds two deltas, returning `None` on integer overflow or if a float
    /// sum is no longer finite.
    pub fn checked_add(self, other: Delta) -> Option<Delta> {
        match (self, other) {
            (Delta::Integer(a), Delta::Integer(b)) => a.checked_add(b).map(Delta::Integer),
            (a, b) => {
                let sum = a.as_f64() + b.as_f64();
                sum.is_finite().then_some(Delta::Float(sum))
            }
        }
    }

    /// Returns the delta as a float.
    pub fn as_f64(&self) -> f64 {
        match self {
            Delta::Integer(v) => *v as f64,
            Delta::Float(v) => *v,
        }
    }

    /// Reads a JSON number as a delta.
    ///
    /// Returns `None` for unsigned values above `i64::MAX`.
    pub fn from_number(number: &Number) -> Option<Delta> {
        if let Some(v) = number.as_i64() {
            Some(Delta::Integer(v))
        } else if number.is_f64() {
            number.as_f64().map(Delta::Float)
        } else {
            None
        }
    }

    /// Converts the delta into a JSON value.
    pub fn to_value(self) -> Value {
        match self {
            Delta::Integer(v) => Value::from(v),
            Delta::Float(v) => Number::from_f64(v).map_or(Value::Null, Value::Number),
        }
    }

    /// Applies the delta to an existing field value.
    ///
    /// A missing or non-numeric value counts as zero. Returns `None` if the
    /// sum overflows.
    pub fn apply_to(self, existing: Option<&Value>) -> Option<Value> {
        let base = match existing {
            Some(Value::Number(number)) => Delta::from_number(number)?,
            _ => Delta::Integer(0),
        };
        base.checked_add(self).map(Delta::to_value)
    }
}

/// A value that cannot be used as a [`Delta`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct UnsupportedValue(String);

mod sealed {
    pub trait Sealed {}
}

/// Conversion into a [`Delta`].
///
/// Implemented for every primitive integer and float type, for [`Delta`]
/// itself and for JSON values. The trait is sealed: any other type is
/// rejected at compile time, and values that cannot be represented exactly
/// are rejected at run time.
pub trait IntoDelta: sealed::Sealed {
    /// Converts `self` into a delta.
    fn into_delta(self) -> Result<Delta, UnsupportedValue>;
}

macro_rules! impl_integer_delta {
    ($($t:ty),*) => {$(
        impl sealed::Sealed for $t {}

        impl IntoDelta for $t {
            #[inline]
            fn into_delta(self) -> Result<Delta, UnsupportedValue> {
                self.to_i64().map(Delta::Integer).ok_or_else(|| {
                    UnsupportedValue(format!("{self} does not fit in a 64-bit signed integer"))
                })
            }
        }
    )*};
}

macro_rules! impl_float_delta {
    ($($t:ty),*) => {$(
        impl sealed::Sealed for $t {}

        impl IntoDelta for $t {
            #[inline]
            fn into_delta(self) -> Result<Delta, UnsupportedValue> {
                match self.to_f64() {
                    Some(v) if v.is_finite() => Ok(Delta::Float(v)),
                    _ => Err(UnsupportedValue(format!("{self} is not a finite number"))),
                }
            }
        }
    )*};
}

impl_integer_delta!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);
impl_float_delta!(f32, f64);

impl sealed::Sealed for Delta {}

impl IntoDelta for Delta {
    fn into_delta(self) -> Result<Delta, UnsupportedValue> {
        match self {
            Delta::Float(v) => v.into_delta(),
            integer => Ok(integer),
        }
    }
}

impl sealed::Sealed for &Value {}

impl IntoDelta for &Value {
    fn into_delta(self) -> Result<Delta, UnsupportedValue> {
        match self {
            Value::Number(number) => Delta::from_number(number).ok_or_else(|| {
                UnsupportedValue(format!("{number} does not fit in a 64-bit signed integer"))
            }),
            other => Err(UnsupportedValue(format!(
                "expected a number, got {}",
                value_kind(other)
            ))),
        }
    }
}

impl sealed::Sealed for Value {}

impl IntoDelta for Value {
    fn into_delta(self) -> Result<Delta, UnsupportedValue> {
        (&self).into_delta()
    }
}

impl TryFrom<&Value> for Delta {
    type Error = UnsupportedValue;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        value.into_delta()
    }
}
