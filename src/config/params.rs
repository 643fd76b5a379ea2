//! Module parameter sets.
//!
//! A `ParameterSet` is the YAML table configuring one module or source,
//! with typed accessors and a stable content hash.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};

use crate::error::FrameworkError;

/// Key naming the plugin type inside a module table
pub const MODULE_TYPE_KEY: &str = "module_type";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet(Mapping);

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_mapping(mapping: Mapping) -> Self {
        Self(mapping)
    }

    pub fn from_map(map: &BTreeMap<String, Value>) -> Self {
        let mut mapping = Mapping::new();
        for (k, v) in map {
            mapping.insert(Value::String(k.clone()), v.clone());
        }
        Self(mapping)
    }

    /// Build from a YAML value, which must be a table
    pub fn from_value(value: &Value, what: &str) -> Result<Self, FrameworkError> {
        match value {
            Value::Mapping(m) => Ok(Self(m.clone())),
            Value::Null => Ok(Self::new()),
            other => Err(FrameworkError::configuration(format!(
                "{} must be a table, found {}",
                what,
                describe(other)
            ))),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn raw(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().filter_map(|k| k.as_str())
    }

    /// Required parameter
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, FrameworkError> {
        let value = self.0.get(key).ok_or_else(|| {
            FrameworkError::configuration(format!("Missing required parameter '{}'", key))
        })?;
        convert(key, value)
    }

    /// Optional parameter with a default
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, FrameworkError> {
        match self.0.get(key) {
            Some(value) => convert(key, value),
            None => Ok(default),
        }
    }

    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, FrameworkError> {
        self.0.get(key).map(|value| convert(key, value)).transpose()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(Value::String(key.to_string()), value.into());
    }

    pub fn module_type(&self) -> Option<&str> {
        self.0.get(MODULE_TYPE_KEY).and_then(|v| v.as_str())
    }

    /// Hex SHA-256 of the canonical JSON rendering (keys sorted)
    pub fn id(&self) -> String {
        let canonical = serde_json::to_value(&self.0)
            .map(|v| v.to_string())
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn convert<T: DeserializeOwned>(key: &str, value: &Value) -> Result<T, FrameworkError> {
    serde_yaml::from_value(value.clone()).map_err(|e| {
        FrameworkError::configuration(format!("Parameter '{}' has the wrong type: {}", key, e))
    })
}

pub(crate) fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a table",
        Value::Tagged(_) => "a tagged value",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pset(yaml: &str) -> ParameterSet {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_typed_access() {
        let p = pset("module_type: Prescaler\nprescaleFactor: 3\nnames: [a, b]\n");
        assert_eq!(p.module_type(), Some("Prescaler"));
        assert_eq!(p.get::<u64>("prescaleFactor").unwrap(), 3);
        assert_eq!(p.get::<Vec<String>>("names").unwrap(), vec!["a", "b"]);
        assert_eq!(p.get_or::<u64>("prescaleOffset", 0).unwrap(), 0);
        assert!(p.get_opt::<String>("missing").unwrap().is_none());
        assert!(matches!(p.get::<u64>("missing"), Err(FrameworkError::Configuration(_))));
        assert!(matches!(p.get::<u64>("names"), Err(FrameworkError::Configuration(_))));
    }

    #[test]
    fn test_id_ignores_key_order() {
        let a = pset("x: 1\ny: 2\n");
        let b = pset("y: 2\nx: 1\n");
        let c = pset("x: 1\ny: 3\n");
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(a.id().len(), 64);
    }

    #[test]
    fn test_from_value_requires_table() {
        let v: Value = serde_yaml::from_str("[1, 2]").unwrap();
        assert!(ParameterSet::from_value(&v, "Module 'a'").is_err());
        assert!(ParameterSet::from_value(&Value::Null, "x").unwrap().keys().next().is_none());
    }
}
