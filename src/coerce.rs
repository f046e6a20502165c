//! Type Coercion
//!
//! Conversion between the JSON wire representation used by tool callers and a neutral
//! SQL value model that every driver knows how to bind and decode.
//!
//! Coercion runs in two stages:
//! 1. [`to_sql_value`] turns a wire value into a [`SqlValue`] under a [`DeclaredType`]
//!    (the column's type when known, [`DeclaredType::Unknown`] otherwise).
//! 2. Each driver turns the [`SqlValue`] into its native parameter type.
//!
//! The reverse direction is [`SqlValue::to_wire`]: drivers decode result columns into
//! `SqlValue` and the wire form is produced here, so every engine renders results the same way.
//!
//! # Wire conventions
//! - Binary values: `{"$base64": "..."}` on input, base64 strings on output
//! - Temporal values: ISO-8601 strings
//! - Decimals: strings (no precision loss)
//! - Non-finite floats: `"NaN"`, `"Infinity"`, `"-Infinity"`

use std::sync::LazyLock;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use serde_json::{Number, Value};
use uuid::Uuid;

use crate::error::{GatewayError, Result};

/// Key of the single-entry object that marks a base64-encoded binary value
pub const BASE64_KEY: &str = "$base64";

/// Largest integer a double represents exactly (2^53)
const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_992;

/// Digits a `NUMERIC` value may carry before and after the decimal point
const MAX_DECIMAL_INT_DIGITS: i64 = 131_072;
const MAX_DECIMAL_SCALE: i64 = 16_383;

static DECIMAL_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[-+]?(\d+(\.\d*)?|\.\d+)([eE][-+]?\d+)?$").expect("static regex")
});

/// Neutral SQL value, independent of any driver
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Exact numeric in canonical decimal text
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
    Uuid(Uuid),
    Json(Value),
}

/// Column type as far as coercion is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclaredType {
    Unknown,
    Boolean,
    Integer { bits: u8 },
    Float { single: bool },
    Decimal,
    Text,
    Binary,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Uuid,
    Json,
}

/// A bound statement parameter
///
/// `name` identifies where the value came from in the tool arguments
/// (`parameters[2]`, `rows[0].created_at`) so coercion failures can point at it.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub value: SqlValue,
}

impl Param {
    pub fn new(name: impl Into<String>, value: SqlValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

impl DeclaredType {
    /// Classify a SQL type name as reported by `information_schema` or a driver
    ///
    /// Length, precision and scale modifiers are ignored. Names that no rule recognises
    /// classify as `Unknown`, which lets the wire value pick its own representation.
    #[must_use]
    pub fn classify(type_name: &str) -> Self {
        let lowered = type_name.trim().to_ascii_lowercase();
        let unsigned = lowered.contains("unsigned");
        let base = lowered
            .split('(')
            .next()
            .unwrap_or_default()
            .replace("unsigned", "")
            .replace("zerofill", "");
        let base = base.trim();

        match base {
            "bool" | "boolean" => Self::Boolean,
            "tinyint" | "int1" => Self::Integer {
                bits: if unsigned { 16 } else { 8 },
            },
            "smallint" | "int2" | "smallserial" | "serial2" => {
                Self::Integer {
                    bits: if unsigned { 32 } else { 16 },
                }
            }
            "mediumint" | "int" | "integer" | "int4" | "serial" | "serial4" => {
                Self::Integer {
                    bits: if unsigned { 64 } else { 32 },
                }
            }
            "bigint" | "int8" | "bigserial" | "serial8" => Self::Integer { bits: 64 },
            "real" | "float4" | "float" => Self::Float { single: true },
            "double" | "double precision" | "float8" => Self::Float { single: false },
            "numeric" | "decimal" | "dec" | "fixed" => Self::Decimal,
            "char" | "character" | "varchar" | "character varying" | "nchar" | "nvarchar"
            | "text" | "tinytext" | "mediumtext" | "longtext" | "clob" | "name" | "citext"
            | "bpchar" | "enum" | "set" => Self::Text,
            "bytea" | "blob" | "tinyblob" | "mediumblob" | "longblob" | "binary" | "varbinary" => {
                Self::Binary
            }
            "date" => Self::Date,
            "time" | "time without time zone" => Self::Time,
            "timestamp" | "timestamp without time zone" | "datetime" => Self::Timestamp,
            "timestamptz" | "timestamp with time zone" => Self::TimestampTz,
            "uuid" => Self::Uuid,
            "json" | "jsonb" => Self::Json,
            _ => Self::Unknown,
        }
    }
}

/// Stage one: wire value → neutral SQL value under a declared type
///
/// `argument` names the value in the tool call and is carried into every error.
pub fn to_sql_value(argument: &str, wire: &Value, declared: DeclaredType) -> Result<SqlValue> {
    if wire.is_null() {
        return Ok(SqlValue::Null);
    }

    let unsupported = |detail: String| GatewayError::unsupported_type(argument, detail);

    match declared {
        DeclaredType::Unknown => match wire {
            Value::Bool(b) => Ok(SqlValue::Bool(*b)),
            Value::Number(n) => number_value(n).map_err(unsupported),
            Value::String(s) => Ok(SqlValue::Text(s.clone())),
            other => match base64_object(other) {
                Some(encoded) => decode_base64(encoded).map(SqlValue::Bytes).map_err(unsupported),
                None => Err(unsupported(format!(
                    "{} values need a declared JSON column",
                    wire_kind(other)
                ))),
            },
        },

        DeclaredType::Boolean => match wire {
            Value::Bool(b) => Ok(SqlValue::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(SqlValue::Bool(false)),
                Some(1) => Ok(SqlValue::Bool(true)),
                _ => Err(unsupported(format!("{n} is not a boolean"))),
            },
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "1" => Ok(SqlValue::Bool(true)),
                "false" | "f" | "0" => Ok(SqlValue::Bool(false)),
                _ => Err(unsupported(format!("'{s}' is not a boolean"))),
            },
            other => Err(unsupported(format!("expected boolean, got {}", wire_kind(other)))),
        },

        DeclaredType::Integer { bits } => {
            let value = match wire {
                Value::Number(n) => integral(n).map_err(&unsupported)?,
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| unsupported(format!("'{s}' is not an integer")))?,
                other => {
                    return Err(unsupported(format!("expected integer, got {}", wire_kind(other))))
                }
            };
            check_width(value, bits).map_err(unsupported)?;
            Ok(SqlValue::Int(value))
        }

        DeclaredType::Float { single } => {
            let value = match wire {
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        if i.unsigned_abs() > MAX_SAFE_INTEGER as u64 {
                            return Err(unsupported(format!(
                                "{i} cannot be represented exactly as a floating-point value"
                            )));
                        }
                    } else if n.is_u64() {
                        return Err(unsupported(format!(
                            "{n} cannot be represented exactly as a floating-point value"
                        )));
                    }
                    n.as_f64().ok_or_else(|| unsupported(format!("{n} is not a number")))?
                }
                Value::String(s) => parse_float(s)
                    .ok_or_else(|| unsupported(format!("'{s}' is not a number")))?,
                other => {
                    return Err(unsupported(format!("expected number, got {}", wire_kind(other))))
                }
            };
            if single {
                check_single_precision(value).map_err(unsupported)?;
            }
            Ok(SqlValue::Float(value))
        }

        DeclaredType::Decimal => {
            let text = match wire {
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.trim().to_string(),
                other => {
                    return Err(unsupported(format!("expected decimal, got {}", wire_kind(other))))
                }
            };
            if !is_decimal_literal(&text) {
                return Err(unsupported(format!("'{text}' is not a decimal number")));
            }
            if !decimal_in_range(&text) {
                return Err(unsupported(format!("'{text}' is outside the decimal range")));
            }
            Ok(SqlValue::Decimal(text.trim_start_matches('+').to_string()))
        }

        DeclaredType::Text => match wire {
            Value::String(s) => Ok(SqlValue::Text(s.clone())),
            Value::Number(n) => Ok(SqlValue::Text(n.to_string())),
            Value::Bool(b) => Ok(SqlValue::Text(b.to_string())),
            other => Err(unsupported(format!("expected text, got {}", wire_kind(other)))),
        },

        DeclaredType::Binary => {
            let encoded = match wire {
                Value::String(s) => s.as_str(),
                other => base64_object(other).ok_or_else(|| {
                    unsupported(format!("expected base64 binary, got {}", wire_kind(other)))
                })?,
            };
            decode_base64(encoded).map(SqlValue::Bytes).map_err(unsupported)
        }

        DeclaredType::Date => {
            let s = expect_str(wire).map_err(&unsupported)?;
            NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map(SqlValue::Date)
                .map_err(|_| unsupported(format!("'{s}' is not an ISO-8601 date")))
        }

        DeclaredType::Time => {
            let s = expect_str(wire).map_err(&unsupported)?;
            parse_time(s.trim())
                .map(SqlValue::Time)
                .ok_or_else(|| unsupported(format!("'{s}' is not an ISO-8601 time")))
        }

        DeclaredType::Timestamp => {
            let s = expect_str(wire).map_err(&unsupported)?;
            parse_timestamp(s.trim())
                .or_else(|| DateTime::parse_from_rfc3339(s.trim()).ok().map(|dt| dt.naive_utc()))
                .map(SqlValue::Timestamp)
                .ok_or_else(|| unsupported(format!("'{s}' is not an ISO-8601 timestamp")))
        }

        DeclaredType::TimestampTz => {
            let s = expect_str(wire).map_err(&unsupported)?;
            let s = s.trim();
            DateTime::parse_from_rfc3339(s)
                .ok()
                .or_else(|| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z").ok())
                .or_else(|| parse_timestamp(s).map(|naive| naive.and_utc().fixed_offset()))
                .map(SqlValue::TimestampTz)
                .ok_or_else(|| unsupported(format!("'{s}' is not an ISO-8601 timestamp")))
        }

        DeclaredType::Uuid => {
            let s = expect_str(wire).map_err(&unsupported)?;
            Uuid::parse_str(s.trim())
                .map(SqlValue::Uuid)
                .map_err(|_| unsupported(format!("'{s}' is not a UUID")))
        }

        DeclaredType::Json => Ok(SqlValue::Json(wire.clone())),
    }
}

impl SqlValue {
    /// Wire representation of a decoded column value
    #[must_use]
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::Number((*i).into()),
            Self::Float(f) => match Number::from_f64(*f) {
                Some(n) => Value::Number(n),
                None if f.is_nan() => Value::String("NaN".to_string()),
                None if *f > 0.0 => Value::String("Infinity".to_string()),
                None => Value::String("-Infinity".to_string()),
            },
            Self::Decimal(d) => Value::String(d.clone()),
            Self::Text(s) => Value::String(s.clone()),
            Self::Bytes(bytes) => Value::String(BASE64.encode(bytes)),
            Self::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            Self::Time(t) => Value::String(t.format("%H:%M:%S%.f").to_string()),
            Self::Timestamp(ts) => Value::String(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            Self::TimestampTz(ts) => Value::String(ts.to_rfc3339()),
            Self::Uuid(u) => Value::String(u.hyphenated().to_string()),
            Self::Json(v) => v.clone(),
        }
    }

    /// Re-run stage one against a more specific declared type
    ///
    /// Used by drivers that learn parameter types at prepare time.
    pub fn refine(&self, argument: &str, declared: DeclaredType) -> Result<SqlValue> {
        match (self, declared) {
            (_, DeclaredType::Unknown) | (Self::Null, _) => Ok(self.clone()),
            (Self::Bytes(_), DeclaredType::Binary) | (Self::Json(_), DeclaredType::Json) => {
                Ok(self.clone())
            }
            _ => to_sql_value(argument, &self.to_wire(), declared),
        }
    }

    /// Short name of the value's kind, for diagnostics
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Decimal(_) => "decimal",
            Self::Text(_) => "text",
            Self::Bytes(_) => "binary",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
            Self::Timestamp(_) => "timestamp",
            Self::TimestampTz(_) => "timestamptz",
            Self::Uuid(_) => "uuid",
            Self::Json(_) => "json",
        }
    }
}

/// Widen a single-precision value through its shortest decimal form
///
/// `0.1f32` becomes `0.1` rather than `0.10000000149011612`.
#[must_use]
pub fn widen_single(value: f32) -> f64 {
    value.to_string().parse().unwrap_or_else(|_| f64::from(value))
}

/// Whether `text` is a plain decimal literal (`-12.50`, `1e-3`)
pub fn is_decimal_literal(text: &str) -> bool {
    DECIMAL_LITERAL.is_match(text)
}

/// Whether a decimal literal's magnitude and scale fit a `NUMERIC` value
fn decimal_in_range(text: &str) -> bool {
    let unsigned = text.trim_start_matches(['-', '+']);
    let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
        Some(pos) => match unsigned[pos + 1..].parse::<i64>() {
            Ok(exponent) => (&unsigned[..pos], exponent),
            Err(_) => return false,
        },
        None => (unsigned, 0),
    };
    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let int_digits = int_part.trim_start_matches('0').len() as i64;
    let magnitude_ok = int_digits
        .checked_add(exponent)
        .is_some_and(|digits| digits <= MAX_DECIMAL_INT_DIGITS);
    let scale_ok = (frac_part.len() as i64)
        .checked_sub(exponent)
        .is_some_and(|scale| scale <= MAX_DECIMAL_SCALE);
    magnitude_ok && scale_ok
}

fn base64_object(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get(BASE64_KEY).and_then(Value::as_str),
        _ => None,
    }
}

fn decode_base64(encoded: &str) -> std::result::Result<Vec<u8>, String> {
    BASE64.decode(encoded.trim()).map_err(|e| format!("invalid base64: {e}"))
}

fn number_value(n: &Number) -> std::result::Result<SqlValue, String> {
    if let Some(i) = n.as_i64() {
        Ok(SqlValue::Int(i))
    } else if n.is_u64() {
        Err(format!("integer {n} is out of range for a 64-bit signed integer"))
    } else {
        n.as_f64().map(SqlValue::Float).ok_or_else(|| format!("{n} is not a number"))
    }
}

fn integral(n: &Number) -> std::result::Result<i64, String> {
    if let Some(i) = n.as_i64() {
        return Ok(i);
    }
    if n.is_u64() {
        return Err(format!("integer {n} is out of range"));
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER as f64 => Ok(f as i64),
        Some(f) if f.fract() == 0.0 => Err(format!("integer {n} is out of range")),
        _ => Err(format!("{n} is not an integer")),
    }
}

fn check_width(value: i64, bits: u8) -> std::result::Result<(), String> {
    let in_range = match bits {
        8 => i8::try_from(value).is_ok(),
        16 => i16::try_from(value).is_ok(),
        32 => i32::try_from(value).is_ok(),
        _ => true,
    };
    if in_range {
        Ok(())
    } else {
        Err(format!("integer {value} is out of range for a {bits}-bit column"))
    }
}

fn parse_float(text: &str) -> Option<f64> {
    match text.trim() {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        t if is_decimal_literal(t) => t.parse().ok(),
        _ => None,
    }
}

fn check_single_precision(value: f64) -> std::result::Result<(), String> {
    #[allow(clippy::cast_possible_truncation)]
    let narrowed = value as f32;
    if value.is_finite() && narrowed.to_string() != value.to_string() {
        return Err(format!(
            "{value} cannot be stored in a single-precision column without rounding"
        ));
    }
    Ok(())
}

fn parse_time(text: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M"))
        .ok()
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn expect_str(wire: &Value) -> std::result::Result<&str, String> {
    wire.as_str().ok_or_else(|| format!("expected ISO-8601 text, got {}", wire_kind(wire)))
}

fn wire_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn coerce(wire: Value, declared: DeclaredType) -> Result<SqlValue> {
        to_sql_value("parameters[0]", &wire, declared)
    }

    #[test]
    fn test_classify_common_type_names() {
        assert_eq!(DeclaredType::classify("INTEGER"), DeclaredType::Integer { bits: 32 });
        assert_eq!(DeclaredType::classify("bigint"), DeclaredType::Integer { bits: 64 });
        assert_eq!(DeclaredType::classify("int unsigned"), DeclaredType::Integer { bits: 64 });
        assert_eq!(DeclaredType::classify("VARCHAR(100)"), DeclaredType::Text);
        assert_eq!(DeclaredType::classify("character varying"), DeclaredType::Text);
        assert_eq!(DeclaredType::classify("NUMERIC(10, 2)"), DeclaredType::Decimal);
        assert_eq!(DeclaredType::classify("real"), DeclaredType::Float { single: true });
        assert_eq!(
            DeclaredType::classify("double precision"),
            DeclaredType::Float { single: false }
        );
        assert_eq!(
            DeclaredType::classify("timestamp with time zone"),
            DeclaredType::TimestampTz
        );
        assert_eq!(DeclaredType::classify("datetime"), DeclaredType::Timestamp);
        assert_eq!(DeclaredType::classify("bytea"), DeclaredType::Binary);
        assert_eq!(DeclaredType::classify("jsonb"), DeclaredType::Json);
        assert_eq!(DeclaredType::classify("geometry"), DeclaredType::Unknown);
    }

    #[test]
    fn test_null_for_every_declared_type() {
        for declared in [
            DeclaredType::Unknown,
            DeclaredType::Integer { bits: 16 },
            DeclaredType::Date,
            DeclaredType::Binary,
        ] {
            assert_eq!(coerce(Value::Null, declared).unwrap(), SqlValue::Null);
        }
    }

    #[test]
    fn test_unknown_declared_type() {
        assert_eq!(coerce(json!(42), DeclaredType::Unknown).unwrap(), SqlValue::Int(42));
        assert_eq!(coerce(json!(1.5), DeclaredType::Unknown).unwrap(), SqlValue::Float(1.5));
        assert_eq!(
            coerce(json!("abc"), DeclaredType::Unknown).unwrap(),
            SqlValue::Text("abc".into())
        );
        assert_eq!(
            coerce(json!({"$base64": "AQID"}), DeclaredType::Unknown).unwrap(),
            SqlValue::Bytes(vec![1, 2, 3])
        );
    }

    #[test]
    fn test_unknown_rejects_structures_and_huge_integers() {
        let err = coerce(json!([1, 2]), DeclaredType::Unknown).unwrap_err();
        assert_eq!(err.kind(), "UnsupportedType");
        assert!(err.message().contains("parameters[0]"));

        let err = coerce(json!(u64::MAX), DeclaredType::Unknown).unwrap_err();
        assert_eq!(err.kind(), "UnsupportedType");
    }

    #[test]
    fn test_integer_width_is_enforced() {
        assert_eq!(
            coerce(json!(32767), DeclaredType::Integer { bits: 16 }).unwrap(),
            SqlValue::Int(32767)
        );
        assert!(coerce(json!(32768), DeclaredType::Integer { bits: 16 }).is_err());
        assert!(coerce(json!(3_000_000_000_i64), DeclaredType::Integer { bits: 32 }).is_err());
        assert_eq!(
            coerce(json!("17"), DeclaredType::Integer { bits: 64 }).unwrap(),
            SqlValue::Int(17)
        );
    }

    #[test]
    fn test_integer_never_truncates_fractions() {
        let err = coerce(json!(1.5), DeclaredType::Integer { bits: 64 }).unwrap_err();
        assert_eq!(err.kind(), "UnsupportedType");
        assert_eq!(
            coerce(json!(2.0), DeclaredType::Integer { bits: 64 }).unwrap(),
            SqlValue::Int(2)
        );
    }

    #[test]
    fn test_single_precision_narrowing() {
        assert_eq!(
            coerce(json!(0.5), DeclaredType::Float { single: true }).unwrap(),
            SqlValue::Float(0.5)
        );
        assert_eq!(
            coerce(json!(0.1), DeclaredType::Float { single: true }).unwrap(),
            SqlValue::Float(0.1)
        );
        let single = DeclaredType::Float { single: true };
        let err = coerce(json!(0.123_456_789_123), single).unwrap_err();
        assert_eq!(err.kind(), "UnsupportedType");
        assert!(coerce(json!(16_777_217), DeclaredType::Float { single: true }).is_err());
    }

    #[test]
    fn test_double_rejects_inexact_integers() {
        let double = DeclaredType::Float { single: false };
        assert!(coerce(json!(9_007_199_254_740_993_i64), double).is_err());
        assert_eq!(
            coerce(json!("NaN"), DeclaredType::Float { single: false })
                .unwrap()
                .to_wire(),
            json!("NaN")
        );
    }

    #[test]
    fn test_decimal_canonical_text() {
        assert_eq!(
            coerce(json!("+12.50"), DeclaredType::Decimal).unwrap(),
            SqlValue::Decimal("12.50".into())
        );
        assert_eq!(
            coerce(json!(3), DeclaredType::Decimal).unwrap(),
            SqlValue::Decimal("3".into())
        );
        assert!(coerce(json!("12,50"), DeclaredType::Decimal).is_err());
    }

    #[test]
    fn test_decimal_exponent_outside_numeric_range_is_rejected() {
        for text in ["1e9223372036854775807", "1e99999999999999999999", "1e131073", "5e-16384"] {
            let err = coerce(json!(text), DeclaredType::Decimal).unwrap_err();
            assert_eq!(err.kind(), "UnsupportedType", "{text}");
        }
        assert_eq!(
            coerce(json!("1e131071"), DeclaredType::Decimal).unwrap(),
            SqlValue::Decimal("1e131071".into())
        );
        assert_eq!(
            coerce(json!("-2.5e-10"), DeclaredType::Decimal).unwrap(),
            SqlValue::Decimal("-2.5e-10".into())
        );
    }

    #[test]
    fn test_temporal_parsing() {
        assert_eq!(
            coerce(json!("2024-05-01"), DeclaredType::Date).unwrap().to_wire(),
            json!("2024-05-01")
        );
        assert_eq!(
            coerce(json!("13:45:00"), DeclaredType::Time).unwrap().to_wire(),
            json!("13:45:00")
        );
        assert_eq!(
            coerce(json!("2024-05-01 13:45:00.250"), DeclaredType::Timestamp)
                .unwrap()
                .to_wire(),
            json!("2024-05-01T13:45:00.250")
        );
        assert_eq!(
            coerce(json!("2024-05-01T13:45:00"), DeclaredType::TimestampTz)
                .unwrap()
                .to_wire(),
            json!("2024-05-01T13:45:00+00:00")
        );
        assert_eq!(
            coerce(json!("2024-05-01T13:45:00+02:00"), DeclaredType::TimestampTz)
                .unwrap()
                .to_wire(),
            json!("2024-05-01T13:45:00+02:00")
        );
        assert!(coerce(json!("May 1st"), DeclaredType::Date).is_err());
    }

    #[test]
    fn test_binary_accepts_object_and_plain_string() {
        assert_eq!(
            coerce(json!("AQID"), DeclaredType::Binary).unwrap(),
            SqlValue::Bytes(vec![1, 2, 3])
        );
        assert_eq!(
            coerce(json!({"$base64": "AQID"}), DeclaredType::Binary).unwrap(),
            SqlValue::Bytes(vec![1, 2, 3])
        );
        assert!(coerce(json!("not base64!"), DeclaredType::Binary).is_err());
    }

    #[test]
    fn test_uuid_and_json() {
        let id = "67e55044-10b1-426f-9247-bb680e5fe0c8";
        assert_eq!(coerce(json!(id), DeclaredType::Uuid).unwrap().to_wire(), json!(id));
        let doc = json!({"nested": [1, {"a": true}]});
        assert_eq!(coerce(doc.clone(), DeclaredType::Json).unwrap(), SqlValue::Json(doc));
    }

    #[test]
    fn test_wire_output() {
        assert_eq!(SqlValue::Int(7).to_wire(), json!(7));
        assert_eq!(SqlValue::Float(f64::INFINITY).to_wire(), json!("Infinity"));
        assert_eq!(SqlValue::Float(f64::NEG_INFINITY).to_wire(), json!("-Infinity"));
        assert_eq!(SqlValue::Bytes(b"Hello".to_vec()).to_wire(), json!("SGVsbG8="));
        assert_eq!(SqlValue::Decimal("10.25".into()).to_wire(), json!("10.25"));
    }

    #[test]
    fn test_widen_single() {
        assert_eq!(widen_single(0.1), 0.1);
        assert!(widen_single(f32::NAN).is_nan());
    }

    #[test]
    fn test_refine_text_to_date() {
        let refined = SqlValue::Text("2024-05-01".into())
            .refine("parameters[0]", DeclaredType::Date)
            .unwrap();
        assert_eq!(refined, SqlValue::Date(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()));

        let err = SqlValue::Text("soon".into())
            .refine("parameters[3]", DeclaredType::Date)
            .unwrap_err();
        assert!(err.message().contains("parameters[3]"));
    }

    #[test]
    fn test_coercion_is_deterministic() {
        let first = coerce(json!("2024-05-01T00:00:00Z"), DeclaredType::TimestampTz).unwrap();
        let second = coerce(json!("2024-05-01T00:00:00Z"), DeclaredType::TimestampTz).unwrap();
        assert_eq!(first, second);
    }
}
