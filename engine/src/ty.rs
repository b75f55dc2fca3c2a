//! The type caster.
//!
//! [`FieldType::cast`] converts an arbitrary value into a value of the
//! declared type or rejects it. Casting never panics: every input either
//! yields a typed value or a [`CastError`]. `Null` casts to `Null` for every
//! type, including custom ones.

use crate::Value;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use indexmap::IndexMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::{fmt, str::FromStr, sync::Arc};
use uuid::Uuid;

/// Why a value could not be cast.
///
/// Built-in types always fail with the default message. Custom types may
/// supply their own message and options, which end up on the field error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CastError {
    pub message: Option<String>,
    pub opts: Vec<(String, Value)>,
}

impl CastError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            opts: Vec::new(),
        }
    }

    pub fn opt(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.opts.push((key.into(), value.into()));
        self
    }
}

/// A user-defined field type.
pub trait CustomType: fmt::Debug + Send + Sync {
    /// Name shown in error metadata.
    fn name(&self) -> &str;

    /// Cast external input. Never called with `Null`.
    fn cast(&self, value: &Value) -> Result<Value, CastError>;

    /// Convert a value read from storage.
    fn load(&self, value: &Value) -> Result<Value, CastError> {
        self.cast(value)
    }

    /// Convert a value for storage.
    fn dump(&self, value: &Value) -> Result<Value, CastError> {
        Ok(value.clone())
    }

    /// Decide whether two cast values are the same for change tracking.
    fn equal(&self, a: &Value, b: &Value) -> bool {
        a == b
    }
}

/// Field types supported in schemas.
#[derive(Debug, Clone)]
pub enum FieldType {
    /// Integer primary key
    Id,
    /// UUID primary key
    BinaryId,
    Integer,
    Float,
    Boolean,
    String,
    Binary,
    Decimal,
    Date,
    /// Time of day, whole seconds
    Time,
    /// Time of day, microsecond precision
    TimeUsec,
    NaiveDatetime,
    NaiveDatetimeUsec,
    UtcDatetime,
    UtcDatetimeUsec,
    Uuid,
    /// Map with arbitrary values
    Map,
    /// Accepts anything
    Any,
    Array(Box<FieldType>),
    /// Map whose values all have the inner type
    MapOf(Box<FieldType>),
    Custom(Arc<dyn CustomType>),
}

impl PartialEq for FieldType {
    fn eq(&self, other: &Self) -> bool {
        use FieldType::*;

        match (self, other) {
            (Array(a), Array(b)) | (MapOf(a), MapOf(b)) => a == b,
            (Custom(a), Custom(b)) => Arc::ptr_eq(a, b) || a.name() == b.name(),
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Id => f.write_str("id"),
            FieldType::BinaryId => f.write_str("binary_id"),
            FieldType::Integer => f.write_str("integer"),
            FieldType::Float => f.write_str("float"),
            FieldType::Boolean => f.write_str("boolean"),
            FieldType::String => f.write_str("string"),
            FieldType::Binary => f.write_str("binary"),
            FieldType::Decimal => f.write_str("decimal"),
            FieldType::Date => f.write_str("date"),
            FieldType::Time => f.write_str("time"),
            FieldType::TimeUsec => f.write_str("time_usec"),
            FieldType::NaiveDatetime => f.write_str("naive_datetime"),
            FieldType::NaiveDatetimeUsec => f.write_str("naive_datetime_usec"),
            FieldType::UtcDatetime => f.write_str("utc_datetime"),
            FieldType::UtcDatetimeUsec => f.write_str("utc_datetime_usec"),
            FieldType::Uuid => f.write_str("uuid"),
            FieldType::Map => f.write_str("map"),
            FieldType::Any => f.write_str("any"),
            FieldType::Array(inner) => write!(f, "array<{inner}>"),
            FieldType::MapOf(inner) => write!(f, "map<{inner}>"),
            FieldType::Custom(custom) => f.write_str(custom.name()),
        }
    }
}

impl FieldType {
    pub fn array(inner: FieldType) -> Self {
        Self::Array(Box::new(inner))
    }

    pub fn map_of(inner: FieldType) -> Self {
        Self::MapOf(Box::new(inner))
    }

    pub fn custom(custom: impl CustomType + 'static) -> Self {
        Self::Custom(Arc::new(custom))
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, FieldType::Id | FieldType::Integer)
    }

    /// Cast `value` into this type.
    pub fn cast(&self, value: &Value) -> Result<Value, CastError> {
        if value.is_null() {
            return Ok(Value::Null);
        }

        let fail = || Err(CastError::new());

        match (self, value) {
            (FieldType::Any, value) => Ok(value.clone()),

            (FieldType::Id | FieldType::Integer, Value::Integer(v)) => Ok(Value::Integer(*v)),
            (FieldType::Id | FieldType::Integer, Value::String(s)) => {
                s.parse::<i64>().map(Value::Integer).or_else(|_| fail())
            }

            (FieldType::Float, Value::Float(v)) if v.is_finite() => Ok(Value::Float(*v)),
            (FieldType::Float, Value::Integer(v)) => Ok(Value::Float(*v as f64)),
            (FieldType::Float, Value::Decimal(d)) => d.to_f64().map(Value::Float).ok_or_default(),
            (FieldType::Float, Value::String(s)) => match s.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(Value::Float(v)),
                _ => fail(),
            },

            (FieldType::Boolean, Value::Bool(v)) => Ok(Value::Bool(*v)),
            (FieldType::Boolean, Value::String(s)) => match s.as_str() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => fail(),
            },

            (FieldType::String, Value::String(s)) => Ok(Value::String(s.clone())),

            (FieldType::Binary, Value::Binary(b)) => Ok(Value::Binary(b.clone())),
            (FieldType::Binary, Value::String(s)) => Ok(Value::Binary(s.as_bytes().to_vec())),

            (FieldType::Decimal, Value::Decimal(d)) => Ok(Value::Decimal(*d)),
            (FieldType::Decimal, Value::Integer(v)) => Ok(Value::Decimal(Decimal::from(*v))),
            (FieldType::Decimal, Value::Float(v)) => Decimal::try_from(*v)
                .map(Value::Decimal)
                .or_else(|_| fail()),
            (FieldType::Decimal, Value::String(s)) => Decimal::from_str(s.trim())
                .or_else(|_| Decimal::from_scientific(s.trim()))
                .map(Value::Decimal)
                .or_else(|_| fail()),

            (FieldType::Uuid | FieldType::BinaryId, Value::Uuid(u)) => Ok(Value::Uuid(*u)),
            (FieldType::Uuid | FieldType::BinaryId, Value::String(s)) => {
                Uuid::parse_str(s).map(Value::Uuid).or_else(|_| fail())
            }
            (FieldType::Uuid | FieldType::BinaryId, Value::Binary(b)) => {
                Uuid::from_slice(b).map(Value::Uuid).or_else(|_| fail())
            }

            (FieldType::Date, value) => cast_date(value).map(|date| date.map_or(Value::Null, Value::Date)),
            (FieldType::Time, value) => cast_time(value, Precision::Second),
            (FieldType::TimeUsec, value) => cast_time(value, Precision::Microsecond),
            (FieldType::NaiveDatetime, value) => cast_naive_datetime(value, Precision::Second),
            (FieldType::NaiveDatetimeUsec, value) => {
                cast_naive_datetime(value, Precision::Microsecond)
            }
            (FieldType::UtcDatetime, value) => cast_utc_datetime(value, Precision::Second),
            (FieldType::UtcDatetimeUsec, value) => cast_utc_datetime(value, Precision::Microsecond),

            (FieldType::Map, Value::Map(map)) => Ok(Value::Map(map.clone())),

            (FieldType::Array(inner), Value::Array(items)) => items
                .iter()
                .map(|item| inner.cast(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            (FieldType::MapOf(inner), Value::Map(map)) => map
                .iter()
                .map(|(key, item)| inner.cast(item).map(|v| (key.clone(), v)))
                .collect::<Result<IndexMap<_, _>, _>>()
                .map(Value::Map),

            (FieldType::Custom(custom), value) => custom.cast(value),

            _ => fail(),
        }
    }

    /// Convert a stored value into this type.
    pub fn load(&self, value: &Value) -> Result<Value, CastError> {
        match self {
            FieldType::Custom(custom) if !value.is_null() => custom.load(value),
            _ => self.cast(value),
        }
    }

    /// Convert a value of this type for storage.
    ///
    /// Fails unless the value already satisfies the type.
    pub fn dump(&self, value: &Value) -> Result<Value, CastError> {
        match self {
            FieldType::Custom(custom) if !value.is_null() => custom.dump(value),
            _ if self.is_a(value) => Ok(value.clone()),
            _ => Err(CastError::new()),
        }
    }

    /// Returns `true` if `value` already satisfies this type's contract.
    pub fn is_a(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) | (FieldType::Any, _) => true,
            (FieldType::Id | FieldType::Integer, Value::Integer(_)) => true,
            (FieldType::Float, Value::Float(v)) => v.is_finite(),
            (FieldType::Boolean, Value::Bool(_)) => true,
            (FieldType::String, Value::String(_)) => true,
            (FieldType::Binary, Value::Binary(_)) => true,
            (FieldType::Decimal, Value::Decimal(_)) => true,
            (FieldType::Uuid | FieldType::BinaryId, Value::Uuid(_)) => true,
            (FieldType::Date, Value::Date(_)) => true,
            (FieldType::Time, Value::Time(t)) => Precision::Second.holds(t.nanosecond()),
            (FieldType::TimeUsec, Value::Time(t)) => Precision::Microsecond.holds(t.nanosecond()),
            (FieldType::NaiveDatetime, Value::NaiveDateTime(t)) => {
                Precision::Second.holds(t.nanosecond())
            }
            (FieldType::NaiveDatetimeUsec, Value::NaiveDateTime(t)) => {
                Precision::Microsecond.holds(t.nanosecond())
            }
            (FieldType::UtcDatetime, Value::UtcDateTime(t)) => {
                Precision::Second.holds(t.nanosecond())
            }
            (FieldType::UtcDatetimeUsec, Value::UtcDateTime(t)) => {
                Precision::Microsecond.holds(t.nanosecond())
            }
            (FieldType::Map, Value::Map(_)) => true,
            (FieldType::Array(inner), Value::Array(items)) => items.iter().all(|v| inner.is_a(v)),
            (FieldType::MapOf(inner), Value::Map(map)) => map.values().all(|v| inner.is_a(v)),
            (FieldType::Custom(custom), value) => custom
                .cast(value)
                .map(|cast| custom.equal(&cast, value))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Compare two values of this type for change tracking.
    pub fn equal(&self, a: &Value, b: &Value) -> bool {
        match (self, a, b) {
            (FieldType::Custom(custom), a, b) if !a.is_null() && !b.is_null() => {
                custom.equal(a, b)
            }
            (FieldType::Array(inner), Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(a, b)| inner.equal(a, b))
            }
            (FieldType::MapOf(inner), Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(key, a)| b.get(key).is_some_and(|b| inner.equal(a, b)))
            }
            _ => a == b,
        }
    }
}

trait OkOrDefault<T> {
    fn ok_or_default(self) -> Result<T, CastError>;
}

impl<T> OkOrDefault<T> for Option<T> {
    fn ok_or_default(self) -> Result<T, CastError> {
        self.ok_or_else(CastError::new)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Precision {
    Second,
    Microsecond,
}

impl Precision {
    fn holds(self, nanos: u32) -> bool {
        match self {
            Precision::Second => nanos == 0,
            Precision::Microsecond => nanos % 1_000 == 0,
        }
    }

    /// Whole-second types reject fractions; microsecond types truncate
    /// anything finer than a microsecond.
    fn apply<T: Timelike>(self, value: T) -> Result<T, CastError> {
        let nanos = value.nanosecond();
        match self {
            Precision::Second if nanos == 0 => Ok(value),
            Precision::Second => Err(CastError::new()),
            Precision::Microsecond => value.with_nanosecond(nanos / 1_000 * 1_000).ok_or_default(),
        }
    }
}

/// One component of a `{year, month, day, ...}` map.
enum Component {
    Blank,
    Present(i64),
    Invalid,
}

fn component(map: &IndexMap<String, Value>, key: &str) -> Component {
    match map.get(key) {
        None | Some(Value::Null) => Component::Blank,
        Some(Value::String(s)) if s.is_empty() => Component::Blank,
        Some(Value::Integer(v)) => Component::Present(*v),
        Some(Value::String(s)) => s
            .parse()
            .map(Component::Present)
            .unwrap_or(Component::Invalid),
        Some(_) => Component::Invalid,
    }
}

/// Reads the required components of a map; all blank yields `None`,
/// partially blank is an error.
fn components<const N: usize>(
    map: &IndexMap<String, Value>,
    keys: [&str; N],
) -> Result<Option<[i64; N]>, CastError> {
    let mut out = [0i64; N];
    let mut blank = 0;

    for (slot, key) in out.iter_mut().zip(keys) {
        match component(map, key) {
            Component::Blank => blank += 1,
            Component::Present(v) => *slot = v,
            Component::Invalid => return Err(CastError::new()),
        }
    }

    match blank {
        0 => Ok(Some(out)),
        n if n == N => Ok(None),
        _ => Err(CastError::new()),
    }
}

/// Optional components default to zero but must still be well-formed.
fn optional_component(map: &IndexMap<String, Value>, key: &str) -> Result<i64, CastError> {
    match component(map, key) {
        Component::Blank => Ok(0),
        Component::Present(v) => Ok(v),
        Component::Invalid => Err(CastError::new()),
    }
}

fn to_u32(v: i64) -> Result<u32, CastError> {
    u32::try_from(v).map_err(|_| CastError::new())
}

fn to_i32(v: i64) -> Result<i32, CastError> {
    i32::try_from(v).map_err(|_| CastError::new())
}

fn date_from_parts([year, month, day]: [i64; 3]) -> Result<NaiveDate, CastError> {
    NaiveDate::from_ymd_opt(to_i32(year)?, to_u32(month)?, to_u32(day)?).ok_or_default()
}

fn time_from_parts(hour: i64, minute: i64, second: i64, micro: i64) -> Result<NaiveTime, CastError> {
    NaiveTime::from_hms_micro_opt(to_u32(hour)?, to_u32(minute)?, to_u32(second)?, to_u32(micro)?)
        .ok_or_default()
}

fn parse_naive(s: &str) -> Option<NaiveDateTime> {
    let normalized = s.trim().replacen(' ', "T", 1);
    let normalized = normalized.strip_suffix('Z').unwrap_or(&normalized);

    NaiveDateTime::from_str(normalized)
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(normalized, "%Y-%m-%dT%H:%M").ok())
        .or_else(|| {
            DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|dt| dt.naive_local())
        })
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::from_str(s)
        .ok()
        .or_else(|| NaiveTime::parse_from_str(s, "%H:%M").ok())
}

fn cast_date(value: &Value) -> Result<Option<NaiveDate>, CastError> {
    match value {
        Value::Date(date) => Ok(Some(*date)),
        Value::NaiveDateTime(dt) => Ok(Some(dt.date())),
        Value::UtcDateTime(dt) => Ok(Some(dt.date_naive())),
        Value::String(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .or_else(|| parse_naive(s).map(|dt| dt.date()))
            .map(Some)
            .ok_or_default(),
        Value::Map(map) => match components(map, ["year", "month", "day"])? {
            Some(parts) => date_from_parts(parts).map(Some),
            None => Ok(None),
        },
        _ => Err(CastError::new()),
    }
}

fn cast_time(value: &Value, precision: Precision) -> Result<Value, CastError> {
    let time = match value {
        Value::Time(time) => *time,
        Value::NaiveDateTime(dt) => dt.time(),
        Value::UtcDateTime(dt) => dt.time(),
        Value::String(s) => parse_time(s).ok_or_default()?,
        Value::Map(map) => match components(map, ["hour", "minute"])? {
            Some([hour, minute]) => time_from_parts(
                hour,
                minute,
                optional_component(map, "second")?,
                optional_component(map, "microsecond")?,
            )?,
            None => return Ok(Value::Null),
        },
        _ => return Err(CastError::new()),
    };

    precision.apply(time).map(Value::Time)
}

fn naive_from_map(map: &IndexMap<String, Value>) -> Result<Option<NaiveDateTime>, CastError> {
    match components(map, ["year", "month", "day", "hour", "minute"])? {
        Some([year, month, day, hour, minute]) => {
            let date = date_from_parts([year, month, day])?;
            let time = time_from_parts(
                hour,
                minute,
                optional_component(map, "second")?,
                optional_component(map, "microsecond")?,
            )?;
            Ok(Some(date.and_time(time)))
        }
        None => Ok(None),
    }
}

fn cast_naive_datetime(value: &Value, precision: Precision) -> Result<Value, CastError> {
    let naive = match value {
        Value::NaiveDateTime(dt) => *dt,
        Value::UtcDateTime(dt) => dt.naive_utc(),
        Value::Date(date) => date.and_time(NaiveTime::MIN),
        Value::String(s) => parse_naive(s).ok_or_default()?,
        Value::Map(map) => match naive_from_map(map)? {
            Some(naive) => naive,
            None => return Ok(Value::Null),
        },
        _ => return Err(CastError::new()),
    };

    precision.apply(naive).map(Value::NaiveDateTime)
}

fn cast_utc_datetime(value: &Value, precision: Precision) -> Result<Value, CastError> {
    let utc = match value {
        Value::UtcDateTime(dt) => *dt,
        Value::NaiveDateTime(dt) => Utc.from_utc_datetime(dt),
        Value::Date(date) => Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)),
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| parse_naive(s).map(|naive| Utc.from_utc_datetime(&naive)))
            .ok_or_default()?,
        Value::Map(map) => match naive_from_map(map)? {
            Some(naive) => Utc.from_utc_datetime(&naive),
            None => return Ok(Value::Null),
        },
        _ => return Err(CastError::new()),
    };

    precision.apply(utc).map(Value::UtcDateTime)
}
