//! Dynamic value types for the WrenDB SQL engine

mod table;

pub use table::{Column, ColumnType, Table};

use chrono::{NaiveDate, NaiveDateTime};
use std::cmp::Ordering;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Dynamically typed SQL value
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    Uuid(Uuid),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// SQL equality: text compares case-insensitively, Int/Float compare
    /// numerically, and two nulls are equal (the engine collapses
    /// three-valued logic).
    pub fn sql_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Null, _) | (_, Value::Null) => false,
            (a, b) if a.is_numeric() && b.is_numeric() => a.to_f64() == b.to_f64(),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Uuid(a), Value::Uuid(b)) => a == b,
            (a, b) => a.render().eq_ignore_ascii_case(&b.render()),
        }
    }

    /// Total order used by ORDER BY, MIN/MAX and BETWEEN: nulls sort first,
    /// numbers compare numerically, timestamps chronologically, everything
    /// else by case-insensitive text.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (a, b) if a.is_numeric() && b.is_numeric() => {
                a.to_f64().partial_cmp(&b.to_f64()).unwrap_or(Ordering::Equal)
            }
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (a, b) => a.render().to_lowercase().cmp(&b.render().to_lowercase()),
        }
    }

    /// Boolean coercion: null is false, numbers are nonzero, text is
    /// nonempty, everything else is true.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Text(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Numeric coercion with textual parsing fallback. Unparseable text
    /// coerces to 0.
    pub fn to_f64(&self) -> f64 {
        match self {
            Value::Int(i) => *i as f64,
            Value::Float(f) => *f,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Text(s) => s.trim().parse::<f64>().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    pub fn to_i64(&self) -> i64 {
        match self {
            Value::Int(i) => *i,
            _ => self.to_f64() as i64,
        }
    }

    /// Canonical display text. Null renders empty; use [`Value::key_text`]
    /// where null must stay distinguishable.
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::Timestamp(t) => t.format("%Y-%m-%dT%H:%M:%S").to_string(),
            Value::Uuid(u) => u.to_string(),
        }
    }

    /// Rendering used for group and DISTINCT keys, where null must not
    /// collide with the empty string.
    pub fn key_text(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            other => other.render(),
        }
    }

    /// The concrete column type this value would pin an `Any` column to.
    pub fn natural_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Bool),
            Value::Int(_) => Some(ColumnType::Int),
            Value::Float(_) => Some(ColumnType::Float),
            Value::Text(_) => Some(ColumnType::Text),
            Value::Timestamp(_) => Some(ColumnType::Timestamp),
            Value::Uuid(_) => Some(ColumnType::Uuid),
        }
    }

    /// Coerce into a declared column type. Nulls always pass through;
    /// otherwise conversion goes through textual parsing where the variant
    /// does not match directly.
    pub fn coerce_to(&self, ty: ColumnType) -> Result<Value> {
        if self.is_null() || ty == ColumnType::Any {
            return Ok(self.clone());
        }
        let fail = || {
            EngineError::TypeMismatch(format!(
                "cannot convert {} to {:?}",
                self.key_text(),
                ty
            ))
        };
        match ty {
            ColumnType::Int => match self {
                Value::Int(_) => Ok(self.clone()),
                Value::Float(f) => Ok(Value::Int(*f as i64)),
                Value::Bool(b) => Ok(Value::Int(*b as i64)),
                Value::Text(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::Int)
                    .or_else(|_| s.trim().parse::<f64>().map(|f| Value::Int(f as i64)))
                    .map_err(|_| fail()),
                _ => Err(fail()),
            },
            ColumnType::Float => match self {
                Value::Float(_) => Ok(self.clone()),
                Value::Int(i) => Ok(Value::Float(*i as f64)),
                Value::Bool(b) => Ok(Value::Float(*b as i64 as f64)),
                Value::Text(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| fail()),
                _ => Err(fail()),
            },
            ColumnType::Bool => match self {
                Value::Bool(_) => Ok(self.clone()),
                Value::Int(i) => Ok(Value::Bool(*i != 0)),
                Value::Float(f) => Ok(Value::Bool(*f != 0.0)),
                Value::Text(s) => match s.trim().to_lowercase().as_str() {
                    "true" | "1" => Ok(Value::Bool(true)),
                    "false" | "0" => Ok(Value::Bool(false)),
                    _ => Err(fail()),
                },
                _ => Err(fail()),
            },
            ColumnType::Text => Ok(Value::Text(self.render())),
            ColumnType::Timestamp => match self {
                Value::Timestamp(_) => Ok(self.clone()),
                Value::Text(s) => parse_timestamp(s).map(Value::Timestamp).ok_or_else(fail),
                _ => Err(fail()),
            },
            ColumnType::Uuid => match self {
                Value::Uuid(_) => Ok(self.clone()),
                Value::Text(s) => Uuid::parse_str(s.trim()).map(Value::Uuid).map_err(|_| fail()),
                _ => Err(fail()),
            },
            ColumnType::Any => unreachable!(),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render())
    }
}

/// Parse an ISO-8601-ish timestamp, with or without a time part.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let s = text.trim().trim_end_matches('Z');
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(t);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// A named row: a case-insensitive map from bare or `alias.column` keys to
/// values. Keys are folded to lowercase on insert.
#[derive(Debug, Clone, Default)]
pub struct Row {
    entries: HashMap<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.entries.insert(key.to_lowercase(), value);
    }

    /// Insert only if the key is not already bound. Used when merging join
    /// sources, where the first source's bare names win.
    pub fn insert_if_absent(&mut self, key: &str, value: Value) {
        self.entries.entry(key.to_lowercase()).or_insert(value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(&key.to_lowercase())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_lowercase())
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_equality_ignores_case() {
        assert!(Value::Text("Tools".into()).sql_eq(&Value::Text("TOOLS".into())));
        assert!(!Value::Text("Tools".into()).sql_eq(&Value::Text("Paint".into())));
    }

    #[test]
    fn test_numeric_equality_across_kinds() {
        assert!(Value::Int(3).sql_eq(&Value::Float(3.0)));
        assert!(!Value::Int(3).sql_eq(&Value::Float(3.5)));
    }

    #[test]
    fn test_null_equality_collapses() {
        assert!(Value::Null.sql_eq(&Value::Null));
        assert!(!Value::Null.sql_eq(&Value::Int(0)));
    }

    #[test]
    fn test_total_order_nulls_first() {
        assert_eq!(Value::Null.total_cmp(&Value::Int(-100)), Ordering::Less);
        assert_eq!(Value::Int(2).total_cmp(&Value::Float(2.5)), Ordering::Less);
        assert_eq!(
            Value::Text("apple".into()).total_cmp(&Value::Text("Banana".into())),
            Ordering::Less
        );
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.truthy());
        assert!(!Value::Int(0).truthy());
        assert!(Value::Int(-1).truthy());
        assert!(!Value::Text("".into()).truthy());
        assert!(Value::Text("x".into()).truthy());
        assert!(Value::Uuid(Uuid::nil()).truthy());
    }

    #[test]
    fn test_coerce_text_to_int() {
        let v = Value::Text("42".into()).coerce_to(ColumnType::Int).unwrap();
        assert!(matches!(v, Value::Int(42)));
        assert!(Value::Text("nope".into()).coerce_to(ColumnType::Int).is_err());
    }

    #[test]
    fn test_coerce_null_passes_through() {
        assert!(Value::Null.coerce_to(ColumnType::Timestamp).unwrap().is_null());
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2024-05-01T10:30:00").is_some());
        assert!(parse_timestamp("2024-05-01 10:30:00.125").is_some());
        assert!(parse_timestamp("2024-05-01").is_some());
        assert!(parse_timestamp("May 1st").is_none());
    }

    #[test]
    fn test_row_keys_case_insensitive() {
        let mut row = Row::new();
        row.insert("Price", Value::Float(12.99));
        assert!(row.get("PRICE").is_some());
        row.insert_if_absent("price", Value::Null);
        assert!(!row.get("price").unwrap().is_null());
    }
}
