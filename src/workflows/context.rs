// Execution context threaded through every step of a workflow.
// Each step receives the current value and produces a new one; nothing is mutated in place.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque key/value document carried between steps.
///
/// The engine only relies on shallow merge semantics: keys present in the merged
/// data overwrite keys of the same name, everything else is kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context(Map<String, Value>);

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Build a context from a JSON value. Anything other than an object is rejected.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            Value::Null => Some(Self::default()),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Return a copy of this context with `key` set to `value`.
    pub fn with(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut next = self.0.clone();
        next.insert(key.into(), value.into());
        Self(next)
    }

    /// Shallow merge: returns a new context where `data` wins on key collisions.
    pub fn merge(&self, data: &Map<String, Value>) -> Self {
        let mut next = self.0.clone();
        for (key, value) in data {
            next.insert(key.clone(), value.clone());
        }
        Self(next)
    }

    pub fn merge_context(&self, other: &Context) -> Self {
        self.merge(&other.0)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl From<Map<String, Value>> for Context {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_overwrites_and_keeps() {
        let ctx = Context::new().with("a", 1).with("b", "keep");
        let data = json!({"a": 2, "c": true});
        let merged = ctx.merge(data.as_object().unwrap());

        assert_eq!(merged.get_i64("a"), Some(2));
        assert_eq!(merged.get_str("b"), Some("keep"));
        assert_eq!(merged.get_bool("c"), Some(true));
        // original untouched
        assert_eq!(ctx.get_i64("a"), Some(1));
        assert!(!ctx.contains_key("c"));
    }

    #[test]
    fn test_merge_is_shallow() {
        let ctx = Context::from_value(json!({"nested": {"x": 1, "y": 2}})).unwrap();
        let merged = ctx.merge(json!({"nested": {"x": 9}}).as_object().unwrap());
        assert_eq!(merged.get("nested"), Some(&json!({"x": 9})));
    }

    #[test]
    fn test_from_value_rejects_non_objects() {
        assert!(Context::from_value(json!([1, 2])).is_none());
        assert!(Context::from_value(json!("text")).is_none());
        assert_eq!(Context::from_value(Value::Null), Some(Context::new()));
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let ctx = Context::new().with("count", 3);
        let text = serde_json::to_string(&ctx).unwrap();
        assert_eq!(text, r#"{"count":3}"#);
        let back: Context = serde_json::from_str(&text).unwrap();
        assert_eq!(back, ctx);
    }
}
