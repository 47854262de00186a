// Record scalar sum-type (§3 Data Model), grounded on the teacher's
// `common::Value` tagged union — narrowed to the scalar set the spec
// actually names (string | number | boolean | null | timestamp) and
// extended with the dynamic-typed-record => tagged-union Design Note (§9).

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// A single scalar cell in a `Record`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Timestamp(_) => "timestamp",
        }
    }

    /// Best-effort coercion to a numeric value, following the dual-
    /// evaluation contract's "number and numeric-looking string coerces"
    /// rule (§4.A).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// String form used by `=in=`/`=out=` membership comparison (§4.A:
    /// "`=in=` compares by string form after normalisation").
    pub fn as_normalized_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Boolean(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.clone(),
            Value::Timestamp(t) => t.to_rfc3339(),
        }
    }

    /// Parse as an instant if this value is a timestamp or an ISO-8601
    /// string that round-trips, for the "date-like strings are compared as
    /// instants when both sides parse" rule (§4.A).
    pub fn as_instant(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(t) => Some(*t),
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            _ => None,
        }
    }

    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Boolean(*b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => match DateTime::parse_from_rfc3339(s) {
                Ok(dt) => Value::Timestamp(dt.with_timezone(&Utc)),
                Err(_) => Value::String(s.clone()),
            },
            other => Value::String(other.to_string()),
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Boolean(b) => Json::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::Timestamp(t) => Json::String(t.to_rfc3339()),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_normalized_string())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            // Cross-type equality per §4.A: number <=> numeric-looking string.
            (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
                match (self.as_f64(), other.as_f64()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

impl Eq for Value {}

/// Ordering used by range/ordered operators and cursor keyset comparison.
/// Codepoint order for strings, numeric order for numbers, instant order
/// when both sides parse as timestamps (§4.A).
impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => {
                match (self.as_instant(), other.as_instant()) {
                    (Some(x), Some(y)) => x.partial_cmp(&y),
                    _ => a.partial_cmp(b),
                }
            }
            (Value::Timestamp(a), Value::Timestamp(b)) => a.partial_cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => a.partial_cmp(b),
            (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
                match (self.as_f64(), other.as_f64()) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

/// A key-value mapping from field name to scalar (§3 Data Model). Backed by
/// a `BTreeMap` so iteration order is deterministic (useful for hashing the
/// cursor `orderHash` and for stable JSON output).
pub type Record = BTreeMap<String, Value>;

/// Convert a JSON object into a `Record`. Non-object input is rejected by
/// callers before it reaches this point (shape-checking is out of scope,
/// §1, but a `Record` is always a flat object by construction here).
pub fn record_from_json(json: &Json) -> Option<Record> {
    let obj = json.as_object()?;
    Some(
        obj.iter()
            .map(|(k, v)| (k.clone(), Value::from_json(v)))
            .collect(),
    )
}

pub fn record_to_json(record: &Record) -> Json {
    Json::Object(
        record
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_string_coerces_for_equality() {
        assert_eq!(Value::Number(42.0), Value::String("42".to_string()));
    }

    #[test]
    fn timestamps_compare_as_instants_when_both_sides_parse() {
        let a = Value::String("2024-01-01T00:00:00Z".to_string());
        let b = Value::String("2024-06-01T00:00:00Z".to_string());
        assert_eq!(a.partial_cmp(&b), Some(Ordering::Less));
    }

    #[test]
    fn non_date_strings_compare_by_codepoint() {
        let a = Value::String("apple".to_string());
        let b = Value::String("banana".to_string());
        assert_eq!(a.partial_cmp(&b), Some(Ordering::Less));
    }

    #[test]
    fn normalized_string_membership_form() {
        assert_eq!(Value::Number(7.0).as_normalized_string(), "7");
        assert_eq!(Value::String("7".to_string()).as_normalized_string(), "7");
    }
}
