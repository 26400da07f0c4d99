//! Runtime value model.
//!
//! Containers are reference-counted with interior mutability so that type
//! coercion can intern its result back into the input copy: a container
//! coerced once keeps its identity on every later lookup, and identity is
//! what the resolver's memo tables key on.
//!
//! `Missing` is the distinguished sentinel that inhabits every type. It
//! propagates through arithmetic, compares equal to `null`, and is elided
//! from JSON output.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use indexmap::IndexMap;
use regex::Regex;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde_json::{Map, Number, Value as Json};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::LazyLock;

/// Interned object key.
pub type Key = Rc<str>;
/// Shared mutable object container.
pub type ObjectRef = Rc<RefCell<IndexMap<Key, Value>>>;
/// Shared mutable array container.
pub type ArrayRef = Rc<RefCell<Vec<Value>>>;

static DECIMAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?(\d+(\.\d+)?([eE][+-]?\d+)?)$").expect("decimal pattern"));
static TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([01]\d|2[0-3]):[0-5]\d(:[0-5]\d(\.\d+)?)?$").expect("time pattern")
});

/// Engine value. Scalars are inline; containers are `Rc`-shared.
#[derive(Debug, Clone)]
pub enum Value {
    /// The sentinel inhabiting every type. Carries an optional reason,
    /// populated only while debug tracing is on.
    Missing(Option<Arc<str>>),
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Decimal(Decimal),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Array(ArrayRef),
    Object(ObjectRef),
}

impl Value {
    /// An untagged missing value.
    #[inline]
    pub fn missing() -> Self {
        Value::Missing(None)
    }

    /// A missing value tagged with a reason.
    pub fn missing_because(reason: impl Into<String>) -> Self {
        Value::Missing(Some(Arc::from(reason.into().as_str())))
    }

    /// Fresh empty object container.
    pub fn new_object() -> Self {
        Value::Object(Rc::new(RefCell::new(IndexMap::new())))
    }

    /// Fresh array container with the given elements.
    pub fn new_array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    #[inline]
    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing(_))
    }

    #[inline]
    pub fn is_container(&self) -> bool {
        matches!(self, Value::Array(_) | Value::Object(_))
    }

    /// Reason string of a tagged missing value.
    pub fn missing_reason(&self) -> Option<&str> {
        match self {
            Value::Missing(Some(r)) => Some(r.as_ref()),
            _ => None,
        }
    }

    /// Container identity for memo keys and cycle sentinels. Scalars are 0.
    pub fn address(&self) -> usize {
        match self {
            Value::Object(o) => Rc::as_ptr(o) as usize,
            Value::Array(a) => Rc::as_ptr(a) as usize,
            _ => 0,
        }
    }

    #[inline]
    pub fn truthy(&self) -> bool {
        match self {
            Value::Missing(_) | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Decimal(d) => !d.is_zero(),
            Value::Str(s) => !s.is_empty(),
            Value::Date(_) | Value::Timestamp(_) => true,
            Value::Array(a) => !a.borrow().is_empty(),
            Value::Object(o) => !o.borrow().is_empty(),
        }
    }

    /// Integer view. `Missing → 0`.
    pub fn to_i(&self) -> i64 {
        match self {
            Value::Int(n) => *n,
            Value::Float(f) => *f as i64,
            Value::Decimal(d) => d.to_i64().unwrap_or(0),
            Value::Bool(b) => i64::from(*b),
            Value::Str(s) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }

    /// Float view. `Missing → 0.0`.
    pub fn to_f(&self) -> f64 {
        match self {
            Value::Int(n) => *n as f64,
            Value::Float(f) => *f,
            Value::Decimal(d) => d.to_f64().unwrap_or(0.0),
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Str(s) => s.parse().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_ref()),
            _ => None,
        }
    }

    /// Human-readable rendering, used for dynamic path segments and traces.
    pub fn display_string(&self) -> String {
        match self {
            Value::Missing(_) => String::new(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => format_f64(*f),
            Value::Decimal(d) => d.to_string(),
            Value::Str(s) => s.to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Timestamp(t) => t.to_rfc3339(),
            Value::Array(_) | Value::Object(_) => self.to_json().to_string(),
        }
    }

    /// Deep-copy a JSON document into a fresh mutable tree with interned keys.
    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Json::String(s) => Value::Str(Rc::from(s.as_str())),
            Json::Array(items) => Value::new_array(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => {
                let out: IndexMap<Key, Value> = map
                    .iter()
                    .map(|(k, v)| (Rc::from(k.as_str()), Value::from_json(v)))
                    .collect();
                Value::Object(Rc::new(RefCell::new(out)))
            }
        }
    }

    /// Render to JSON: object keys bound to missing are dropped, missing
    /// array elements become `null`, a revisited container becomes the
    /// `{"^ref": "circular"}` sentinel.
    pub fn to_json(&self) -> Json {
        self.json_with(&mut HashSet::new())
    }

    fn json_with(&self, seen: &mut HashSet<usize>) -> Json {
        match self {
            Value::Missing(_) | Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(n) => Json::Number(Number::from(*n)),
            Value::Float(f) => Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
            Value::Decimal(d) => d
                .to_f64()
                .and_then(Number::from_f64)
                .map(Json::Number)
                .unwrap_or_else(|| Json::String(d.to_string())),
            Value::Str(s) => Json::String(s.to_string()),
            Value::Date(d) => Json::String(d.format("%Y-%m-%d").to_string()),
            Value::Timestamp(t) => Json::String(t.to_rfc3339()),
            Value::Array(items) => {
                let addr = self.address();
                if !seen.insert(addr) {
                    return circular_sentinel();
                }
                let out = items.borrow().iter().map(|v| v.json_with(seen)).collect();
                seen.remove(&addr);
                Json::Array(out)
            }
            Value::Object(map) => {
                let addr = self.address();
                if !seen.insert(addr) {
                    return circular_sentinel();
                }
                let mut out = Map::new();
                for (k, v) in map.borrow().iter() {
                    if v.is_missing() {
                        continue;
                    }
                    out.insert(k.to_string(), v.json_with(seen));
                }
                seen.remove(&addr);
                Json::Object(out)
            }
        }
    }
}

fn circular_sentinel() -> Json {
    let mut map = Map::new();
    map.insert("^ref".to_string(), Json::String("circular".to_string()));
    Json::Object(map)
}

pub(crate) fn format_f64(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() {
        format!("{:.0}", f)
    } else {
        f.to_string()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            // Missing compares equal to null (and to itself).
            (Missing(_), Missing(_) | Null) | (Null, Missing(_) | Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Int(a), Float(b)) | (Float(b), Int(a)) => (*a as f64) == *b,
            (Decimal(a), Decimal(b)) => a == b,
            (Decimal(a), Int(b)) | (Int(b), Decimal(a)) => *a == rust_decimal::Decimal::from(*b),
            (Decimal(a), Float(b)) | (Float(b), Decimal(a)) => {
                a.to_f64().map(|x| x == *b).unwrap_or(false)
            }
            (Str(a), Str(b)) => a == b,
            (Date(a), Date(b)) => a == b,
            (Timestamp(a), Timestamp(b)) => a == b,
            (Array(a), Array(b)) => *a.borrow() == *b.borrow(),
            (Object(a), Object(b)) => *a.borrow() == *b.borrow(),
            _ => false,
        }
    }
}

/// Declared type of a schema node, including the extended scalar types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Object,
    Array,
    String,
    Integer,
    Number,
    Boolean,
    Null,
    Const,
    Decimal,
    Date,
    Time,
    Timestamp,
    /// No declared type: values pass through untouched.
    Any,
}

impl NodeType {
    pub fn parse(name: &str) -> Option<NodeType> {
        Some(match name {
            "object" => NodeType::Object,
            "array" => NodeType::Array,
            "string" => NodeType::String,
            "integer" => NodeType::Integer,
            "number" => NodeType::Number,
            "boolean" => NodeType::Boolean,
            "null" => NodeType::Null,
            "const" => NodeType::Const,
            "decimal" => NodeType::Decimal,
            "date" => NodeType::Date,
            "time" => NodeType::Time,
            "timestamp" => NodeType::Timestamp,
            _ => return None,
        })
    }

    /// True for types whose coercion is the identity on valid input.
    /// Extended types and booleans always coerce, so they are excluded.
    pub fn passthrough(&self) -> bool {
        matches!(
            self,
            NodeType::String
                | NodeType::Integer
                | NodeType::Number
                | NodeType::Null
                | NodeType::Const
                | NodeType::Any
        )
    }

    /// Apply this type's coercion to a value. Missing passes through every
    /// type except `boolean`, which folds it to `false`.
    pub fn coerce(&self, value: Value) -> Result<Value, String> {
        match self {
            NodeType::Boolean => Ok(Value::Bool(value.truthy())),
            _ if value.is_missing() => Ok(value),
            NodeType::Object | NodeType::Array | NodeType::Const | NodeType::Any => Ok(value),
            NodeType::Decimal => coerce_decimal(value),
            NodeType::Date => coerce_date(value),
            NodeType::Time => coerce_time(value),
            NodeType::Timestamp => coerce_timestamp(value),
            NodeType::String => Ok(match value {
                Value::Str(_) => value,
                other if other.is_container() => {
                    return Err("cannot coerce container to string".to_string())
                }
                other => Value::Str(Rc::from(other.display_string().as_str())),
            }),
            NodeType::Integer => match value {
                Value::Int(_) => Ok(value),
                other => Err(format!("not an integer: {}", other.display_string())),
            },
            NodeType::Number => match value {
                Value::Int(_) | Value::Float(_) | Value::Decimal(_) => Ok(value),
                other => Err(format!("not a number: {}", other.display_string())),
            },
            NodeType::Null => match value {
                Value::Null => Ok(value),
                other => Err(format!("expected null, got {}", other.display_string())),
            },
        }
    }
}

fn coerce_decimal(value: Value) -> Result<Value, String> {
    match value {
        Value::Decimal(_) => Ok(value),
        Value::Int(n) => Ok(Value::Decimal(Decimal::from(n))),
        Value::Float(f) => Decimal::from_f64(f)
            .map(Value::Decimal)
            .ok_or_else(|| format!("float {} has no decimal representation", f)),
        Value::Str(s) => {
            if !DECIMAL_RE.is_match(&s) {
                return Err(format!("not a decimal literal: {:?}", s.as_ref()));
            }
            let parsed = if s.contains(['e', 'E']) {
                Decimal::from_scientific(&s)
            } else {
                s.parse::<Decimal>()
            };
            parsed
                .map(Value::Decimal)
                .map_err(|e| format!("decimal parse failed for {:?}: {}", s.as_ref(), e))
        }
        other => Err(format!("cannot coerce {} to decimal", other.display_string())),
    }
}

fn coerce_date(value: Value) -> Result<Value, String> {
    match value {
        Value::Date(_) => Ok(value),
        Value::Timestamp(t) => Ok(Value::Date(t.date_naive())),
        Value::Str(s) => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .map(Value::Date)
            .map_err(|e| format!("date parse failed for {:?}: {}", s.as_ref(), e)),
        other => Err(format!("cannot coerce {} to date", other.display_string())),
    }
}

fn coerce_time(value: Value) -> Result<Value, String> {
    match value {
        Value::Str(ref s) if TIME_RE.is_match(s) => Ok(value),
        Value::Str(s) => Err(format!("not a time of day: {:?}", s.as_ref())),
        other => Err(format!("cannot coerce {} to time", other.display_string())),
    }
}

fn coerce_timestamp(value: Value) -> Result<Value, String> {
    match value {
        Value::Timestamp(_) => Ok(value),
        Value::Date(d) => Ok(Value::Timestamp(
            Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).expect("midnight exists")),
        )),
        Value::Int(secs) => Utc
            .timestamp_opt(secs, 0)
            .single()
            .map(Value::Timestamp)
            .ok_or_else(|| format!("epoch seconds out of range: {}", secs)),
        Value::Float(secs) => {
            let whole = secs.trunc() as i64;
            let nanos = (secs.fract().abs() * 1e9) as u32;
            Utc.timestamp_opt(whole, nanos)
                .single()
                .map(Value::Timestamp)
                .ok_or_else(|| format!("epoch seconds out of range: {}", secs))
        }
        Value::Str(s) => parse_timestamp(&s)
            .map(Value::Timestamp)
            .ok_or_else(|| format!("timestamp parse failed for {:?}", s.as_ref())),
        other => Err(format!(
            "cannot coerce {} to timestamp",
            other.display_string()
        )),
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(|d| Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).expect("midnight exists")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_equals_null() {
        assert_eq!(Value::missing(), Value::Null);
        assert_eq!(Value::Null, Value::missing_because("gone"));
        assert_ne!(Value::missing(), Value::Int(0));
    }

    #[test]
    fn missing_numeric_views() {
        assert_eq!(Value::missing().to_i(), 0);
        assert_eq!(Value::missing().to_f(), 0.0);
        assert!(!Value::missing().truthy());
    }

    #[test]
    fn decimal_coercions() {
        let d = NodeType::Decimal.coerce(Value::Str(Rc::from("10.25"))).unwrap();
        assert_eq!(d, Value::Decimal("10.25".parse().unwrap()));
        let d = NodeType::Decimal.coerce(Value::Int(4)).unwrap();
        assert_eq!(d, Value::Decimal(Decimal::from(4)));
        let d = NodeType::Decimal.coerce(Value::Str(Rc::from("1e3"))).unwrap();
        assert_eq!(d, Value::Decimal(Decimal::from(1000)));
        assert!(NodeType::Decimal.coerce(Value::Str(Rc::from("1.2.3"))).is_err());
    }

    #[test]
    fn date_and_timestamp_coercions() {
        let d = NodeType::Date.coerce(Value::Str(Rc::from("2024-02-29"))).unwrap();
        assert_eq!(d, Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()));

        let t = NodeType::Timestamp.coerce(Value::Int(0)).unwrap();
        assert_eq!(t, Value::Timestamp(Utc.timestamp_opt(0, 0).unwrap()));

        let t = NodeType::Timestamp
            .coerce(Value::Str(Rc::from("2024-01-02T03:04:05Z")))
            .unwrap();
        match t {
            Value::Timestamp(ts) => assert_eq!(ts.timestamp(), 1_704_164_645),
            other => panic!("expected timestamp, got {:?}", other),
        }
    }

    #[test]
    fn boolean_folds_missing_to_false() {
        assert_eq!(NodeType::Boolean.coerce(Value::missing()).unwrap(), Value::Bool(false));
        assert_eq!(NodeType::Boolean.coerce(Value::Int(2)).unwrap(), Value::Bool(true));
        assert_eq!(
            NodeType::Boolean.coerce(Value::Str(Rc::from(""))).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn time_is_pattern_validated() {
        assert!(NodeType::Time.coerce(Value::Str(Rc::from("23:59:59"))).is_ok());
        assert!(NodeType::Time.coerce(Value::Str(Rc::from("24:00"))).is_err());
    }

    #[test]
    fn json_round_trip_drops_missing_keys() {
        let v = Value::from_json(&json!({"a": 1, "b": [1, 2]}));
        if let Value::Object(map) = &v {
            map.borrow_mut().insert(Rc::from("gone"), Value::missing());
        }
        assert_eq!(v.to_json(), json!({"a": 1, "b": [1, 2]}));
    }

    #[test]
    fn missing_array_elements_serialize_as_null() {
        let v = Value::new_array(vec![Value::Int(1), Value::missing(), Value::Int(3)]);
        assert_eq!(v.to_json(), json!([1, null, 3]));
    }

    #[test]
    fn circular_containers_get_a_sentinel() {
        let outer = Value::new_object();
        if let Value::Object(map) = &outer {
            map.borrow_mut().insert(Rc::from("me"), outer.clone());
        }
        assert_eq!(outer.to_json(), json!({"me": {"^ref": "circular"}}));
    }

    #[test]
    fn container_identity_survives_clone() {
        let v = Value::new_object();
        let w = v.clone();
        assert_eq!(v.address(), w.address());
        assert_ne!(v.address(), Value::new_object().address());
    }
}
