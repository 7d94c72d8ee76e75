use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Mutable key-value state owned by a session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionState(Map<String, Value>);

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Deserialize a value, `None` when absent or of the wrong shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.0
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overlay every entry of `other` onto this state.
    pub fn merge(&mut self, other: SessionState) {
        self.0.extend(other.0);
    }
}

impl From<Map<String, Value>> for SessionState {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for SessionState {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Render a state value for inclusion in a prompt: strings verbatim,
/// everything else as pretty JSON.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_overwrites_and_returns_previous() {
        let mut state = SessionState::new();
        assert!(state.insert("sql", "SELECT 1").is_none());
        let prev = state.insert("sql", "SELECT 2");
        assert_eq!(prev, Some(json!("SELECT 1")));
        assert_eq!(state.get_str("sql"), Some("SELECT 2"));
    }

    #[test]
    fn get_as_rejects_wrong_shape() {
        let state: SessionState = [("rows", json!([{"n": 1}])), ("name", json!("x"))]
            .into_iter()
            .collect();
        let rows: Option<Vec<Map<String, Value>>> = state.get_as("rows");
        assert_eq!(rows.map(|r| r.len()), Some(1));
        let bad: Option<Vec<u32>> = state.get_as("name");
        assert!(bad.is_none());
    }

    #[test]
    fn render_value_formats() {
        assert_eq!(render_value(&json!("plain")), "plain");
        assert_eq!(render_value(&Value::Null), "");
        assert!(render_value(&json!({"a": 1})).contains("\"a\": 1"));
    }

    #[test]
    fn merge_overlays() {
        let mut base: SessionState = [("a", json!(1)), ("b", json!(2))].into_iter().collect();
        let top: SessionState = [("b", json!(3))].into_iter().collect();
        base.merge(top);
        assert_eq!(base.get("b"), Some(&json!(3)));
        assert_eq!(base.len(), 2);
    }
}
