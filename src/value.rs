//! Dynamic record value model (spec.md §3, §9).
//!
//! A `Record` is a `Value::Map`'s contents: a mapping from field name to a
//! dynamically-typed value. `BTreeMap` is used (rather than `HashMap`) so
//! canonical serialization for DISTINCT never needs a separate key sort.

use std::collections::BTreeMap;
use std::fmt;

/// A dynamically-typed record field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Map(Record),
}

/// A record: field name -> value. Insertion order is irrelevant (spec.md §3).
pub type Record = BTreeMap<String, Value>;

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s.parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// HAVING truthiness rule (spec.md §4.G step 4, §9 open question): any
    /// non-null value is true, except numbers must be `> 0` and strings
    /// must be non-empty. This diverges from standard SQL and is
    /// intentionally preserved from the source behavior.
    pub fn is_having_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Number(n) => *n > 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Bool(b) => *b,
            Value::List(_) | Value::Map(_) => true,
        }
    }

    /// Resolve a dot-separated path against a record, honoring
    /// backtick-escaped segments (spec.md §9): `` `a.b`.c `` addresses key
    /// `a.b` then `c`, rather than splitting on every dot.
    pub fn get_path<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
        let segments = split_path(path);
        let mut cur: Option<&Value> = record.get(segments.first()?.as_str());
        for seg in segments.iter().skip(1) {
            cur = match cur? {
                Value::Map(m) => m.get(seg.as_str()),
                _ => return None,
            };
        }
        cur
    }

    /// Canonical JSON form used for DISTINCT de-duplication: keys are
    /// already sorted because `Record` is a `BTreeMap`, and `serde_json`
    /// preserves `BTreeMap`'s iteration order when serializing.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Split a dot-path into segments, treating backtick-wrapped runs as a
/// single segment even if they contain a literal `.`.
fn split_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut chars = path.chars().peekable();
    let mut cur = String::new();
    let mut in_backtick = false;

    while let Some(c) = chars.next() {
        match c {
            '`' => in_backtick = !in_backtick,
            '.' if !in_backtick => {
                segments.push(std::mem::take(&mut cur));
            }
            _ => cur.push(c),
        }
    }
    segments.push(cur);
    segments
}

pub fn canonical_record_json(record: &Record) -> String {
    Value::Map(record.clone()).canonical_json()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s}"),
            Value::List(_) | Value::Map(_) => write!(f, "{}", self.canonical_json()),
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => serializer.serialize_f64(*n),
            Value::String(s) => serializer.serialize_str(s),
            Value::List(items) => items.serialize(serializer),
            Value::Map(m) => m.serialize(serializer),
        }
    }
}

impl<'de> serde::Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let j = serde_json::Value::deserialize(deserializer)?;
        Ok(json_to_value(j))
    }
}

pub fn json_to_value(v: serde_json::Value) -> Value {
    match v {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => {
            Value::List(items.into_iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(map) => {
            let mut record = Record::new();
            for (k, v) in map {
                record.insert(k, json_to_value(v));
            }
            Value::Map(record)
        }
    }
}

pub fn value_to_json(v: &Value) -> serde_json::Value {
    match v {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::List(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Map(m) => {
            let mut obj = serde_json::Map::new();
            for (k, v) in m {
                obj.insert(k.clone(), value_to_json(v));
            }
            serde_json::Value::Object(obj)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(pairs: &[(&str, Value)]) -> Record {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn path_lookup_plain() {
        let r = rec(&[("a", Value::Map(rec(&[("b", Value::Number(1.0))])))]);
        assert_eq!(Value::get_path(&r, "a.b"), Some(&Value::Number(1.0)));
    }

    #[test]
    fn path_lookup_missing() {
        let r = rec(&[("a", Value::Number(1.0))]);
        assert_eq!(Value::get_path(&r, "a.b"), None);
    }

    #[test]
    fn path_lookup_backtick_escaped_dot() {
        let mut inner = Record::new();
        inner.insert("c".to_string(), Value::Number(42.0));
        let mut r = Record::new();
        r.insert("a.b".to_string(), Value::Map(inner));
        assert_eq!(Value::get_path(&r, "`a.b`.c"), Some(&Value::Number(42.0)));
    }

    #[test]
    fn having_truthy_rules() {
        assert!(!Value::Null.is_having_truthy());
        assert!(Value::Number(1.0).is_having_truthy());
        assert!(!Value::Number(0.0).is_having_truthy());
        assert!(!Value::Number(-1.0).is_having_truthy());
        assert!(Value::String("x".into()).is_having_truthy());
        assert!(!Value::String("".into()).is_having_truthy());
        assert!(Value::List(vec![]).is_having_truthy());
    }

    #[test]
    fn canonical_json_is_stable_across_insertion_order() {
        let mut r1 = Record::new();
        r1.insert("b".to_string(), Value::Number(2.0));
        r1.insert("a".to_string(), Value::Number(1.0));

        let mut r2 = Record::new();
        r2.insert("a".to_string(), Value::Number(1.0));
        r2.insert("b".to_string(), Value::Number(2.0));

        assert_eq!(canonical_record_json(&r1), canonical_record_json(&r2));
    }
}
