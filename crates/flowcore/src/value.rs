use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Dynamic value type stored in the variable pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    /// Non-finite floats serialize as the strings `NaN`, `inf` and `-inf`
    Float(#[serde(with = "float_repr")] f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    File(FileValue),
    /// Credential material; rendered masked in logs and text output
    Secret(String),
}

/// Reference to a file uploaded by the user or produced by a node
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileValue {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub transfer_method: Option<String>,
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the variant, used in type mismatch errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Integer(_) | Value::Float(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::File(_) => "file",
            Value::Secret(_) => "secret",
        }
    }

    /// Whether the value counts as empty for `empty` / `not empty` conditions
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) | Value::Secret(s) => s.is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::Object(map) => map.is_empty(),
            Value::Bool(_) | Value::Integer(_) | Value::Float(_) | Value::File(_) => false,
        }
    }

    /// Follow a path of object keys / array indexes into a nested value.
    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> Option<&Value> {
        let mut current = self;
        for segment in path {
            let segment = segment.as_ref();
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Convert plain JSON into a `Value`. Objects and arrays are converted
    /// recursively; there is no way to produce `File` or `Secret` from
    /// untyped JSON.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(obj) => Value::Object(
                obj.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Plain JSON view of the value, as node bodies and HTTP payloads expect it
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Integer(n) => serde_json::Value::from(*n),
            Value::Float(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) | Value::Secret(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::File(file) => serde_json::to_value(file).unwrap_or(serde_json::Value::Null),
        }
    }

    /// Text rendering used by templates and string comparisons
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            Value::Secret(s) => s.clone(),
            Value::Integer(n) => n.to_string(),
            Value::Float(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::File(file) => file
                .filename
                .clone()
                .or_else(|| file.url.clone())
                .unwrap_or_default(),
            Value::Array(_) | Value::Object(_) => self.to_json().to_string(),
        }
    }
}

/// Integers and floats compare by numeric value; everything else structurally.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Integer(a), Value::Float(b)) | (Value::Float(b), Value::Integer(a)) => {
                *a as f64 == *b
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::File(a), Value::File(b)) => a == b,
            (Value::Secret(a), Value::Secret(b)) => a == b,
            _ => false,
        }
    }
}

mod float_repr {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(n: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if n.is_nan() {
            serializer.serialize_str("NaN")
        } else if n.is_infinite() {
            serializer.serialize_str(if *n > 0.0 { "inf" } else { "-inf" })
        } else {
            serializer.serialize_f64(*n)
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(n),
            Repr::Text(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("invalid float `{}`", other))),
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Secret(_) => write!(f, "******"),
            other => write!(f, "{}", other.to_text()),
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        i64::try_from(n)
            .map(Value::Integer)
            .unwrap_or(Value::Float(n as f64))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Object(map)
    }
}

impl From<FileValue> for Value {
    fn from(file: FileValue) -> Self {
        Value::File(file)
    }
}

impl From<serde_json::Value> for Value {
    fn from(j: serde_json::Value) -> Self {
        Value::from_json(j)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_path_lookup() {
        let value = Value::from_json(serde_json::json!({
            "user": { "tags": ["a", "b"] }
        }));
        assert_eq!(
            value.get_path(&["user", "tags", "1"]),
            Some(&Value::String("b".to_string()))
        );
        assert_eq!(value.get_path(&["user", "missing"]), None);
    }

    #[test]
    fn secrets_are_masked_when_displayed() {
        let secret = Value::Secret("sk-123".to_string());
        assert_eq!(secret.to_string(), "******");
        assert_eq!(secret.to_text(), "sk-123");
    }

    #[test]
    fn integers_and_floats_keep_their_kind() {
        assert_eq!(Value::Integer(3).to_text(), "3");
        assert_eq!(Value::Float(2.5).to_text(), "2.5");
        assert_eq!(Value::Integer(3).to_json(), serde_json::json!(3));
        assert_eq!(Value::Float(2.5).to_json(), serde_json::json!(2.5));

        assert!(matches!(Value::from_json(serde_json::json!(7)), Value::Integer(7)));
        assert!(matches!(Value::from_json(serde_json::json!(7.5)), Value::Float(_)));

        let big = Value::Integer(9_007_199_254_740_993);
        let json = serde_json::to_string(&big).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_i64(), Some(9_007_199_254_740_993));
    }

    #[test]
    fn numbers_compare_across_kinds() {
        assert_eq!(Value::Integer(1), Value::Float(1.0));
        assert_ne!(Value::Integer(1), Value::Float(1.5));
        assert_ne!(Value::Integer(1), Value::String("1".to_string()));
    }

    #[test]
    fn non_finite_floats_survive_serialization() {
        for n in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, -0.5] {
            let json = serde_json::to_string(&Value::Float(n)).unwrap();
            let back: Value = serde_json::from_str(&json).unwrap();
            match back {
                Value::Float(m) if n.is_nan() => assert!(m.is_nan()),
                Value::Float(m) => assert_eq!(m, n),
                other => panic!("expected a float, got {:?}", other),
            }
        }
        assert_eq!(
            serde_json::to_value(Value::Float(f64::NEG_INFINITY)).unwrap(),
            serde_json::json!({"type": "Float", "value": "-inf"})
        );
        assert!(serde_json::from_str::<Value>(r#"{"type":"Float","value":"lots"}"#).is_err());
    }
}
