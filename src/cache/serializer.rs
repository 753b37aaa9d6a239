//! Serializer Module
//!
//! Composite values are stored as opaque bytes produced by a named
//! serializer. Providers may register serializers after the cache has been
//! built, so the cache resolves its configured name on first use.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cache::value::Value;
use crate::error::{CacheError, Result};

/// Name of the built-in serializer.
pub const DEFAULT_SERIALIZER: &str = "default";

/// Converts values to and from bytes.
pub trait Serializer: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn serialize(&self, value: &Value) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Value>;
}

// == JSON Serializer ==
/// The built-in serializer, registered as `default` and `json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &str {
        "json"
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Serialization(e.to_string()))
    }
}

// == Registry ==
/// Serializers by name.
#[derive(Debug)]
pub struct SerializerRegistry {
    serializers: RwLock<HashMap<String, Arc<dyn Serializer>>>,
}

impl SerializerRegistry {
    /// A registry holding only the built-in serializer.
    pub fn new() -> Self {
        let registry = Self {
            serializers: RwLock::new(HashMap::new()),
        };
        let json: Arc<dyn Serializer> = Arc::new(JsonSerializer);
        registry.register_as(DEFAULT_SERIALIZER, json.clone());
        registry.register(json);
        registry
    }

    /// Registers a serializer under its own name.
    pub fn register(&self, serializer: Arc<dyn Serializer>) {
        let name = serializer.name().to_string();
        self.register_as(&name, serializer);
    }

    /// Registers a serializer under an alias.
    pub fn register_as(&self, name: &str, serializer: Arc<dyn Serializer>) {
        self.serializers.write().insert(name.to_string(), serializer);
    }

    pub fn find(&self, name: &str) -> Result<Arc<dyn Serializer>> {
        self.serializers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::UnknownSerializer(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.serializers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Reversed;

    impl Serializer for Reversed {
        fn name(&self) -> &str {
            "reversed"
        }

        fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
            let mut bytes = JsonSerializer.serialize(value)?;
            bytes.reverse();
            Ok(bytes)
        }

        fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
            let mut bytes = bytes.to_vec();
            bytes.reverse();
            JsonSerializer.deserialize(&bytes)
        }
    }

    #[test]
    fn test_registry_has_builtin() {
        let registry = SerializerRegistry::new();
        assert_eq!(registry.find(DEFAULT_SERIALIZER).unwrap().name(), "json");
        assert_eq!(registry.names(), vec!["default".to_string(), "json".to_string()]);
    }

    #[test]
    fn test_late_registration_is_found() {
        let registry = SerializerRegistry::new();
        assert!(matches!(
            registry.find("reversed"),
            Err(CacheError::UnknownSerializer(_))
        ));
        registry.register(Arc::new(Reversed));

        let serializer = registry.find("reversed").unwrap();
        let value = Value::List(vec![Value::Long(1), Value::Str("a".into())]);
        let bytes = serializer.serialize(&value).unwrap();
        assert_eq!(serializer.deserialize(&bytes).unwrap(), value);
    }

    #[test]
    fn test_json_rejects_garbage() {
        assert!(matches!(
            JsonSerializer.deserialize(b"{not json"),
            Err(CacheError::Serialization(_))
        ));
    }
}
