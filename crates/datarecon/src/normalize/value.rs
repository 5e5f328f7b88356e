//! Cell normalization into a canonical comparable form.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, DurationRound, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::config::{
    DateTimeConfig, DateTimeMode, DateTimePrecision, NumericConfig, ReconcileConfig, RoundingMode,
};
use crate::core::{SqlValue, TypeClass};

/// Formats tried, in order, when a datetime arrives as text.
const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

const OFFSET_DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%.f %#z"];

/// A normalized cell value.
///
/// Equality of two `ComparableValue`s is the only criterion for a cell
/// match. The derived ordering is total and is what key ordering relies on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComparableValue {
    /// NULL and every null-equivalent representation.
    Absent,
    Bool(bool),
    Number(Decimal),
    Text(String),
    /// UTC timestamp at the configured precision.
    DateTime(NaiveDateTime),
    Bytes(Vec<u8>),
}

impl ComparableValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, ComparableValue::Absent)
    }
}

impl fmt::Display for ComparableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparableValue::Absent => f.write_str("NULL"),
            ComparableValue::Bool(v) => write!(f, "{}", v),
            ComparableValue::Number(v) => write!(f, "{}", v),
            ComparableValue::Text(v) => f.write_str(v),
            ComparableValue::DateTime(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
            ComparableValue::Bytes(v) => write!(f, "0x{}", hex::encode(v)),
        }
    }
}

/// Back to a raw value, so normalized output can be fed through again.
impl From<&ComparableValue> for SqlValue<'static> {
    fn from(value: &ComparableValue) -> Self {
        match value {
            ComparableValue::Absent => SqlValue::Null,
            ComparableValue::Bool(v) => SqlValue::Bool(*v),
            ComparableValue::Number(v) => SqlValue::Decimal(*v),
            ComparableValue::Text(v) => SqlValue::Text(Cow::Owned(v.clone())),
            ComparableValue::DateTime(v) => SqlValue::DateTime(*v),
            ComparableValue::Bytes(v) => SqlValue::Bytes(Cow::Owned(v.clone())),
        }
    }
}

/// Converts raw cells into [`ComparableValue`]s.
///
/// Rules, applied in order:
///
/// 1. NULL, float NaN, the text `nan` in a numeric column and any configured
///    null marker become `Absent`.
/// 2. Numbers become a decimal rounded to `numeric.scale` digits. Numeric
///    infinities become the text `inf` or `-inf`.
/// 3. Text loses trailing blank padding and, if configured, its case.
/// 4. Datetimes move to UTC and drop digits below `datetime.precision`.
///
/// Normalizing an already normalized value returns it unchanged.
#[derive(Debug, Clone, Default)]
pub struct ValueNormalizer {
    numeric: NumericConfig,
    datetime: DateTimeConfig,
    case_insensitive: bool,
    null_markers: Vec<String>,
    /// Keep every digit the source delivered: no rounding, no truncation.
    exact: bool,
}

impl ValueNormalizer {
    pub fn new(numeric: NumericConfig, datetime: DateTimeConfig) -> Self {
        Self {
            numeric,
            datetime,
            case_insensitive: false,
            null_markers: Vec::new(),
            exact: false,
        }
    }

    /// Normalizer configured from the `reconcile` section.
    pub fn from_config(config: &ReconcileConfig) -> Self {
        Self::new(config.numeric, config.datetime)
            .with_case_insensitive(config.case_insensitive)
            .with_null_markers(config.null_markers.iter().cloned())
    }

    pub fn with_case_insensitive(mut self, enabled: bool) -> Self {
        self.case_insensitive = enabled;
        self
    }

    pub fn with_null_markers<I: IntoIterator<Item = String>>(mut self, markers: I) -> Self {
        self.null_markers = markers.into_iter().map(|m| m.to_lowercase()).collect();
        self
    }

    /// Normalizer for key columns.
    ///
    /// Keys must stay distinct wherever the database orders them apart, so
    /// case folding, decimal rounding and datetime truncation are all off.
    /// Null handling, padding trim and the UTC shift still apply.
    pub fn for_keys(&self) -> Self {
        Self {
            case_insensitive: false,
            exact: true,
            ..self.clone()
        }
    }

    /// Normalize one cell of the given comparison class.
    pub fn normalize(&self, raw: &SqlValue<'_>, class: TypeClass) -> ComparableValue {
        if self.is_null_like(raw, class) {
            return ComparableValue::Absent;
        }

        let normalized = match class {
            TypeClass::Integer | TypeClass::Decimal => self.number(raw),
            TypeClass::Boolean => boolean(raw),
            TypeClass::DateTime => self.datetime(raw),
            TypeClass::Binary => binary(raw),
            TypeClass::Text | TypeClass::Unknown => None,
        };
        normalized.unwrap_or_else(|| self.text(raw))
    }

    fn is_null_like(&self, raw: &SqlValue<'_>, class: TypeClass) -> bool {
        match raw {
            SqlValue::Null => true,
            SqlValue::F32(v) => v.is_nan(),
            SqlValue::F64(v) => v.is_nan(),
            SqlValue::Text(s) => {
                let trimmed = s.trim();
                (class.is_numeric() && trimmed.eq_ignore_ascii_case("nan"))
                    || (!self.null_markers.is_empty()
                        && self.null_markers.contains(&trimmed.to_lowercase()))
            }
            _ => false,
        }
    }

    fn number(&self, raw: &SqlValue<'_>) -> Option<ComparableValue> {
        let value = match raw {
            SqlValue::I16(v) => Decimal::from(*v),
            SqlValue::I32(v) => Decimal::from(*v),
            SqlValue::I64(v) => Decimal::from(*v),
            SqlValue::Decimal(v) => *v,
            SqlValue::Bool(v) => Decimal::from(u8::from(*v)),
            // Shortest round-trip rendering, so distinct floats stay distinct
            SqlValue::F32(v) if self.exact => {
                return Some(self.float(f64::from(*v), Decimal::from_str(&v.to_string()).ok()))
            }
            SqlValue::F64(v) if self.exact => {
                return Some(self.float(*v, Decimal::from_str(&v.to_string()).ok()))
            }
            SqlValue::F32(v) => return Some(self.float(f64::from(*v), Decimal::from_f32(*v))),
            SqlValue::F64(v) => return Some(self.float(*v, Decimal::from_f64(*v))),
            SqlValue::Text(s) => {
                let s = s.trim();
                match Decimal::from_str(s).or_else(|_| Decimal::from_scientific(s)) {
                    Ok(d) => d,
                    Err(_) => return infinity(s),
                }
            }
            _ => return None,
        };
        Some(ComparableValue::Number(self.round(value)))
    }

    fn float(&self, v: f64, converted: Option<Decimal>) -> ComparableValue {
        match converted {
            Some(d) => ComparableValue::Number(self.round(d)),
            None if v.is_infinite() && v > 0.0 => ComparableValue::Text("inf".to_string()),
            None if v.is_infinite() => ComparableValue::Text("-inf".to_string()),
            // Finite but outside Decimal's range
            None => ComparableValue::Text(v.to_string()),
        }
    }

    fn round(&self, value: Decimal) -> Decimal {
        if self.exact {
            return value.normalize();
        }
        let strategy = match self.numeric.rounding {
            RoundingMode::HalfEven => RoundingStrategy::MidpointNearestEven,
            RoundingMode::HalfAwayFromZero => RoundingStrategy::MidpointAwayFromZero,
            RoundingMode::Truncate => RoundingStrategy::ToZero,
        };
        value
            .round_dp_with_strategy(self.numeric.scale, strategy)
            .normalize()
    }

    fn datetime(&self, raw: &SqlValue<'_>) -> Option<ComparableValue> {
        let utc = match raw {
            SqlValue::DateTime(v) => *v,
            SqlValue::DateTimeOffset(v) => v.naive_utc(),
            SqlValue::Date(d) => d.and_time(NaiveTime::MIN),
            SqlValue::Time(t) => epoch_date().and_time(*t),
            SqlValue::Text(s) => parse_datetime(s.trim())?,
            _ => return None,
        };
        Some(ComparableValue::DateTime(self.truncate_time(utc)))
    }

    fn truncate_time(&self, value: NaiveDateTime) -> NaiveDateTime {
        if self.exact {
            return value;
        }
        let unit = match self.datetime.precision {
            DateTimePrecision::Seconds => TimeDelta::seconds(1),
            DateTimePrecision::Milliseconds => TimeDelta::milliseconds(1),
            DateTimePrecision::Microseconds => TimeDelta::microseconds(1),
        };
        let adjusted = match self.datetime.mode {
            DateTimeMode::Truncate => value.duration_trunc(unit),
            DateTimeMode::Round => value.duration_round(unit),
        };
        adjusted.unwrap_or(value)
    }

    fn text(&self, raw: &SqlValue<'_>) -> ComparableValue {
        let rendered = match raw {
            SqlValue::Text(s) => s.trim_end_matches(' ').to_string(),
            SqlValue::Uuid(u) => u.hyphenated().to_string(),
            other => other.to_string(),
        };
        if self.case_insensitive {
            ComparableValue::Text(rendered.to_lowercase())
        } else {
            ComparableValue::Text(rendered)
        }
    }
}

/// PostgreSQL numeric infinities arrive as text. They compare like float ones.
fn infinity(s: &str) -> Option<ComparableValue> {
    match s.to_lowercase().as_str() {
        "infinity" | "+infinity" | "inf" | "+inf" => Some(ComparableValue::Text("inf".to_string())),
        "-infinity" | "-inf" => Some(ComparableValue::Text("-inf".to_string())),
        _ => None,
    }
}

fn boolean(raw: &SqlValue<'_>) -> Option<ComparableValue> {
    let value = match raw {
        SqlValue::Bool(v) => *v,
        SqlValue::I16(v) => *v != 0,
        SqlValue::I32(v) => *v != 0,
        SqlValue::I64(v) => *v != 0,
        SqlValue::Decimal(v) => !v.is_zero(),
        SqlValue::Text(s) => match s.trim().to_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "1" => true,
            "false" | "f" | "no" | "n" | "0" => false,
            _ => return None,
        },
        _ => return None,
    };
    Some(ComparableValue::Bool(value))
}

fn binary(raw: &SqlValue<'_>) -> Option<ComparableValue> {
    match raw {
        SqlValue::Bytes(b) => Some(ComparableValue::Bytes(b.to_vec())),
        SqlValue::Uuid(u) => Some(ComparableValue::Bytes(u.as_bytes().to_vec())),
        SqlValue::Text(s) => {
            let s = s.trim();
            let hex_digits = s
                .strip_prefix("0x")
                .or_else(|| s.strip_prefix("\\x"))?;
            hex::decode(hex_digits).ok().map(ComparableValue::Bytes)
        }
        _ => None,
    }
}

fn epoch_date() -> NaiveDate {
    NaiveDate::default()
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for fmt in OFFSET_DATETIME_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.naive_utc());
        }
    }
    for fmt in NAIVE_DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d.and_time(NaiveTime::MIN));
    }
    NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
        .ok()
        .map(|t| epoch_date().and_time(t))
}
