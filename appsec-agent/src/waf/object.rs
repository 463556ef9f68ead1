use crate::error::{AppSecError, Result};
use serde_json::Value;

/// Maximum byte length of an encoded string; longer values are truncated.
pub const MAX_STRING_LENGTH: usize = 4096;

/// Maximum number of entries in an encoded array or map; extra entries are
/// dropped.
pub const MAX_CONTAINER_SIZE: usize = 256;

/// Maximum container nesting depth; deeper containers are clipped to empty.
pub const MAX_CONTAINER_DEPTH: usize = 20;

/// Owned tagged-union tree handed to the evaluation engine.
///
/// Built fresh per evaluation call and moved into the context; nothing
/// borrows into it across the call boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum WafObject {
    Invalid,
    Signed(i64),
    Unsigned(u64),
    String(String),
    Bool(bool),
    Array(Vec<WafObject>),
    Map(Vec<(String, WafObject)>),
}

impl WafObject {
    /// Encode a host JSON value into the bounded tree representation.
    ///
    /// Supported inputs are null, booleans, integers, strings, arrays and
    /// string-keyed objects. Values exceeding the string/container bounds
    /// are clipped, never rejected; only unsupported types (floats) fail.
    pub fn encode(value: &Value) -> Result<WafObject> {
        encode_at_depth(value, 1)
    }

    /// Decode back into a host JSON value. Total over the tag set;
    /// `Invalid` decodes to null.
    pub fn decode(&self) -> Value {
        match self {
            WafObject::Invalid => Value::Null,
            WafObject::Signed(n) => Value::from(*n),
            WafObject::Unsigned(n) => Value::from(*n),
            WafObject::String(s) => Value::from(s.clone()),
            WafObject::Bool(b) => Value::from(*b),
            WafObject::Array(items) => Value::Array(items.iter().map(WafObject::decode).collect()),
            WafObject::Map(entries) => {
                let mut map = serde_json::Map::new();
                for (key, item) in entries {
                    map.insert(key.clone(), item.decode());
                }
                Value::Object(map)
            }
        }
    }

    /// Entry count for containers, 0 for scalars.
    pub fn len(&self) -> usize {
        match self {
            WafObject::Array(items) => items.len(),
            WafObject::Map(entries) => entries.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn encode_at_depth(value: &Value, depth: usize) -> Result<WafObject> {
    match value {
        Value::Null => Ok(WafObject::Invalid),
        Value::Bool(b) => Ok(WafObject::Bool(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(WafObject::Signed(i))
            } else if let Some(u) = n.as_u64() {
                Ok(WafObject::Unsigned(u))
            } else {
                Err(AppSecError::UnsupportedType(format!(
                    "non-integer number {n}"
                )))
            }
        }
        Value::String(s) => Ok(WafObject::String(truncate_utf8(s, MAX_STRING_LENGTH))),
        Value::Array(items) => {
            if depth > MAX_CONTAINER_DEPTH {
                return Ok(WafObject::Array(Vec::new()));
            }
            let mut encoded = Vec::with_capacity(items.len().min(MAX_CONTAINER_SIZE));
            for item in items.iter().take(MAX_CONTAINER_SIZE) {
                encoded.push(encode_at_depth(item, depth + 1)?);
            }
            Ok(WafObject::Array(encoded))
        }
        Value::Object(entries) => {
            if depth > MAX_CONTAINER_DEPTH {
                return Ok(WafObject::Map(Vec::new()));
            }
            let mut encoded = Vec::with_capacity(entries.len().min(MAX_CONTAINER_SIZE));
            for (key, item) in entries.iter().take(MAX_CONTAINER_SIZE) {
                encoded.push((
                    truncate_utf8(key, MAX_STRING_LENGTH),
                    encode_at_depth(item, depth + 1)?,
                ));
            }
            Ok(WafObject::Map(encoded))
        }
    }
}

/// Truncate to at most `max` bytes without splitting a UTF-8 scalar.
fn truncate_utf8(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_round_trip() {
        for value in [
            json!(null),
            json!(true),
            json!(-42),
            json!(u64::MAX),
            json!("hello"),
        ] {
            let encoded = WafObject::encode(&value).unwrap();
            assert_eq!(encoded.decode(), value);
        }
    }

    #[test]
    fn test_container_round_trip_preserves_order() {
        let value = json!({"zeta": [1, 2], "alpha": {"b": "x", "a": "y"}});
        let encoded = WafObject::encode(&value).unwrap();
        assert_eq!(encoded.decode(), value);
        if let WafObject::Map(entries) = &encoded {
            assert_eq!(entries[0].0, "zeta");
            assert_eq!(entries[1].0, "alpha");
        } else {
            panic!("expected map");
        }
    }

    #[test]
    fn test_float_is_unsupported() {
        let err = WafObject::encode(&json!(1.5)).unwrap_err();
        assert!(matches!(err, AppSecError::UnsupportedType(_)));
    }

    #[test]
    fn test_long_string_is_truncated() {
        let value = Value::from("x".repeat(MAX_STRING_LENGTH + 100));
        match WafObject::encode(&value).unwrap() {
            WafObject::String(s) => assert_eq!(s.len(), MAX_STRING_LENGTH),
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn test_truncation_respects_char_boundary() {
        let s = "é".repeat(MAX_STRING_LENGTH);
        match WafObject::encode(&Value::from(s)).unwrap() {
            WafObject::String(out) => {
                assert!(out.len() <= MAX_STRING_LENGTH);
                assert!(out.chars().all(|c| c == 'é'));
            }
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn test_oversized_container_is_clipped() {
        let value = Value::Array((0..MAX_CONTAINER_SIZE + 10).map(Value::from).collect());
        assert_eq!(WafObject::encode(&value).unwrap().len(), MAX_CONTAINER_SIZE);
    }

    #[test]
    fn test_deep_nesting_is_clipped_not_rejected() {
        let mut value = json!("leaf");
        for _ in 0..MAX_CONTAINER_DEPTH + 5 {
            value = json!([value]);
        }
        let encoded = WafObject::encode(&value).unwrap();
        // Walk to the clipping point: every level above the limit keeps one
        // entry, the level at the limit becomes empty.
        let mut cursor = &encoded;
        let mut depth = 1;
        while let WafObject::Array(items) = cursor {
            if items.is_empty() {
                break;
            }
            cursor = &items[0];
            depth += 1;
        }
        assert!(depth <= MAX_CONTAINER_DEPTH + 1);
    }
}
