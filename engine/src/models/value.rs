//! Scalar values and column types.
//!
//! `Value` is shared by query literals, bound SQL parameters and result cells.
//! Its `Display` implementation renders canonical KQL literal syntax, which is
//! what keeps a printed AST re-parseable.

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::cmp::Ordering;

/// The scalar type of a column or expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Boolean
    Bool,
    /// 64-bit signed integer
    Long,
    /// 64-bit floating point
    Real,
    /// UTF-8 string
    String,
    /// Point in time (UTC)
    Datetime,
    /// Signed time interval
    Timespan,
    /// GUID / UUID
    Guid,
    /// Untyped or mixed content
    Dynamic,
}

impl ColumnType {
    /// Returns true for `Long` and `Real`.
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Long | Self::Real)
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Long => write!(f, "long"),
            Self::Real => write!(f, "real"),
            Self::String => write!(f, "string"),
            Self::Datetime => write!(f, "datetime"),
            Self::Timespan => write!(f, "timespan"),
            Self::Guid => write!(f, "guid"),
            Self::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// A scalar value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Long(i64),
    /// Floating point value
    Real(f64),
    /// String value
    String(String),
    /// Datetime value
    Datetime(DateTime<Utc>),
    /// Timespan value
    Timespan(TimeDelta),
    /// GUID value, lowercase hyphenated form
    Guid(String),
}

impl Value {
    /// Returns the column type of this value, or `None` for `Null`.
    #[must_use]
    pub fn kind(&self) -> Option<ColumnType> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(ColumnType::Bool),
            Self::Long(_) => Some(ColumnType::Long),
            Self::Real(_) => Some(ColumnType::Real),
            Self::String(_) => Some(ColumnType::String),
            Self::Datetime(_) => Some(ColumnType::Datetime),
            Self::Timespan(_) => Some(ColumnType::Timespan),
            Self::Guid(_) => Some(ColumnType::Guid),
        }
    }

    /// Returns true if the value is `Null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns true only for `Bool(true)`. Null and non-boolean values are falsy.
    #[must_use]
    pub fn is_true(&self) -> bool {
        matches!(self, Self::Bool(true))
    }

    /// Numeric view of the value, if it has one.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Long(i) => Some(*i as f64),
            Self::Real(r) => Some(*r),
            _ => None,
        }
    }

    /// String view of the value, if it is a string or GUID.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Guid(s) => Some(s),
            _ => None,
        }
    }

    /// Text form used by string operators applied to non-string values.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::String(s) | Self::Guid(s) => s.clone(),
            Self::Datetime(dt) => dt.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            Self::Timespan(ts) => format_timespan(*ts),
            Self::Bool(b) => b.to_string(),
            Self::Long(i) => i.to_string(),
            Self::Real(r) => r.to_string(),
        }
    }

    /// Compares two values of compatible types.
    ///
    /// Longs and reals compare numerically. Returns `None` for incompatible
    /// types or when either side is null.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Long(a), Self::Long(b)) => Some(a.cmp(b)),
            (Self::Long(_) | Self::Real(_), Self::Long(_) | Self::Real(_)) => {
                self.as_f64()?.partial_cmp(&other.as_f64()?)
            }
            (Self::String(a), Self::String(b)) | (Self::Guid(a), Self::Guid(b)) => Some(a.cmp(b)),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Datetime(a), Self::Datetime(b)) => Some(a.cmp(b)),
            (Self::Timespan(a), Self::Timespan(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Total order used for sorting: nulls first, then by `compare`, falling
    /// back to a type rank for incompatible values.
    #[must_use]
    pub fn sort_cmp(&self, other: &Self) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self
                .compare(other)
                .unwrap_or_else(|| self.type_rank().cmp(&other.type_rank())),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Long(_) | Self::Real(_) => 2,
            Self::Timespan(_) => 3,
            Self::Datetime(_) => 4,
            Self::Guid(_) => 5,
            Self::String(_) => 6,
        }
    }

    /// Stable textual key used for grouping and distinct-value tracking.
    #[must_use]
    pub fn group_key(&self) -> String {
        format!("{self:?}")
    }

    /// Converts a JSON value into a scalar. Arrays and objects are kept as
    /// their JSON text.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Long)
                .or_else(|| n.as_f64().map(Self::Real))
                .unwrap_or(Self::Null),
            serde_json::Value::String(s) => Self::String(s.clone()),
            other => Self::String(other.to_string()),
        }
    }

    /// Converts a raw value into the given column type where an unambiguous
    /// conversion exists (e.g. datetime text coming back from the store).
    /// Values that cannot be converted are returned unchanged.
    #[must_use]
    pub fn coerce(self, kind: ColumnType) -> Self {
        match (kind, self) {
            (ColumnType::Datetime, Self::String(s)) => {
                parse_datetime(&s).map_or(Self::String(s), Self::Datetime)
            }
            (ColumnType::Guid, Self::String(s)) => Self::Guid(s.to_lowercase()),
            // 64-bit integers may arrive quoted
            (ColumnType::Long, Self::String(s)) => {
                s.trim().parse().map_or(Self::String(s), Self::Long)
            }
            (ColumnType::Real, Self::String(s)) => {
                s.trim().parse().map_or(Self::String(s), Self::Real)
            }
            (ColumnType::Real, Self::Long(i)) => {
                #[allow(clippy::cast_precision_loss)]
                let r = i as f64;
                Self::Real(r)
            }
            (ColumnType::Bool, Self::Long(i)) => Self::Bool(i != 0),
            (ColumnType::Timespan, Self::Long(ms)) => Self::Timespan(TimeDelta::milliseconds(ms)),
            (_, value) => value,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Long(i)
    }
}

impl From<f64> for Value {
    fn from(r: f64) -> Self {
        Self::Real(r)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_none(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Long(i) => serializer.serialize_i64(*i),
            Self::Real(r) => serializer.serialize_f64(*r),
            Self::String(s) | Self::Guid(s) => serializer.serialize_str(s),
            Self::Datetime(dt) => {
                serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Self::Timespan(ts) => serializer.serialize_str(&format_timespan(*ts)),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Long(i) => write!(f, "{i}"),
            Self::Real(r) => write!(f, "{r:?}"),
            Self::String(s) => write!(f, "{}", quote_string(s)),
            Self::Datetime(dt) => write!(
                f,
                "datetime({})",
                dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
            ),
            Self::Timespan(ts) => write!(f, "{}", format_timespan(*ts)),
            Self::Guid(g) => write!(f, "guid({g})"),
        }
    }
}

/// Renders a string as a double-quoted KQL literal.
#[must_use]
pub fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Formats a timespan as a compound KQL literal, e.g. `2h30m` or `1500ms`.
#[must_use]
pub fn format_timespan(ts: TimeDelta) -> String {
    let Some(total_us) = ts.num_microseconds() else {
        return format!("{}d", ts.num_days());
    };
    if total_us == 0 {
        return "0s".to_string();
    }

    let sign = if total_us < 0 { "-" } else { "" };
    let mut rest = total_us.unsigned_abs();
    let units: [(&str, u64); 6] = [
        ("d", 86_400_000_000),
        ("h", 3_600_000_000),
        ("m", 60_000_000),
        ("s", 1_000_000),
        ("ms", 1_000),
        ("us", 1),
    ];

    let mut out = String::from(sign);
    for (suffix, size) in units {
        let count = rest / size;
        if count > 0 {
            out.push_str(&count.to_string());
            out.push_str(suffix);
            rest %= size;
        }
    }
    out
}

/// Parses the datetime forms accepted inside `datetime(...)`.
#[must_use]
pub fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    use chrono::{NaiveDate, NaiveDateTime};

    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }

    let naive_formats = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ];
    let trimmed = text.trim_end_matches('Z');
    for format in naive_formats {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_timespan_compound() {
        let ts = TimeDelta::hours(2) + TimeDelta::minutes(30);
        assert_eq!(format_timespan(ts), "2h30m");
        assert_eq!(format_timespan(TimeDelta::days(1)), "1d");
        assert_eq!(format_timespan(TimeDelta::milliseconds(1500)), "1s500ms");
        assert_eq!(format_timespan(TimeDelta::zero()), "0s");
        assert_eq!(format_timespan(-TimeDelta::minutes(5)), "-5m");
    }

    #[test]
    fn test_parse_datetime_forms() {
        let expected = parse_datetime("2024-03-01T10:15:00Z").unwrap();
        assert_eq!(parse_datetime("2024-03-01 10:15"), Some(expected));
        assert_eq!(parse_datetime("2024-03-01T10:15:00"), Some(expected));
        assert!(parse_datetime("2024-03-01").is_some());
        assert!(parse_datetime("yesterday").is_none());
    }

    #[test]
    fn test_compare_mixed_numeric() {
        assert_eq!(
            Value::Long(2).compare(&Value::Real(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Long(1).compare(&Value::String("1".into())), None);
        assert_eq!(Value::Null.compare(&Value::Null), None);
    }

    #[test]
    fn test_sort_cmp_puts_nulls_first() {
        let mut values = vec![Value::Long(3), Value::Null, Value::Long(1)];
        values.sort_by(Value::sort_cmp);
        assert_eq!(values, vec![Value::Null, Value::Long(1), Value::Long(3)]);
    }

    #[test]
    fn test_display_is_kql_literal() {
        assert_eq!(Value::String("a\"b".into()).to_string(), r#""a\"b""#);
        assert_eq!(Value::Real(1.0).to_string(), "1.0");
        assert_eq!(
            Value::Timespan(TimeDelta::minutes(90)).to_string(),
            "1h30m"
        );
    }

    #[test]
    fn test_coerce_datetime_text() {
        let v = Value::String("2024-01-02 03:04:05".into()).coerce(ColumnType::Datetime);
        assert!(matches!(v, Value::Datetime(_)));

        let untouched = Value::String("not a date".into()).coerce(ColumnType::Datetime);
        assert_eq!(untouched, Value::String("not a date".into()));
    }

    #[test]
    fn test_coerce_quoted_numbers() {
        assert_eq!(
            Value::String("4625".into()).coerce(ColumnType::Long),
            Value::Long(4625)
        );
        assert_eq!(
            Value::String("0.5".into()).coerce(ColumnType::Real),
            Value::Real(0.5)
        );
        assert_eq!(
            Value::String("n/a".into()).coerce(ColumnType::Long),
            Value::String("n/a".into())
        );
    }

    #[test]
    fn test_value_serialization() {
        let json = serde_json::to_string(&vec![
            Value::Long(1),
            Value::Null,
            Value::String("x".into()),
        ])
        .unwrap();
        assert_eq!(json, r#"[1,null,"x"]"#);
    }

    #[test]
    fn test_column_type_serialization() {
        let json = serde_json::to_string(&ColumnType::Datetime).unwrap();
        assert_eq!(json, "\"datetime\"");
        let back: ColumnType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ColumnType::Datetime);
    }
}
