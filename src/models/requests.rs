//! Request DTOs for the worker API
//!
//! Defines the structure of incoming HTTP request bodies.

use serde::Deserialize;

use crate::cache::{Value, MAX_KEY_LENGTH};

/// Request body for PUT /store and PUT /add
///
/// # Fields
/// - `key`: The cache key to store the value under
/// - `value`: Any JSON value; integers are stored as counters
/// - `ttl`: Optional TTL in seconds (0 or absent uses the configured default)
#[derive(Debug, Clone, Deserialize)]
pub struct StoreRequest {
    /// The cache key
    pub key: String,
    /// The value to store
    pub value: Value,
    /// Optional TTL in seconds
    #[serde(default)]
    pub ttl: Option<u32>,
}

impl StoreRequest {
    /// Validates the request data
    ///
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        if self.key.is_empty() {
            return Some("Key cannot be empty".to_string());
        }
        if self.key.len() > MAX_KEY_LENGTH {
            return Some(format!(
                "Key exceeds maximum length of {} bytes",
                MAX_KEY_LENGTH
            ));
        }
        None
    }
}

/// Request body for POST /inc/:key and POST /dec/:key
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepRequest {
    /// Amount to add or subtract (default 1)
    #[serde(default)]
    pub step: Option<i64>,
}

impl StepRequest {
    pub fn step(&self) -> i64 {
        self.step.unwrap_or(1)
    }
}

/// Request body for POST /cas/:key
#[derive(Debug, Clone, Deserialize)]
pub struct CasRequest {
    /// Value the counter must currently hold
    pub old: i64,
    /// Value to swap in
    pub new: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_request_deserialize() {
        let json = r#"{"key": "test", "value": "hello"}"#;
        let req: StoreRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.key, "test");
        assert_eq!(req.value, Value::from("hello"));
        assert!(req.ttl.is_none());
    }

    #[test]
    fn test_store_request_with_ttl_and_counter() {
        let json = r#"{"key": "hits", "value": 41, "ttl": 60}"#;
        let req: StoreRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.value, Value::Long(41));
        assert_eq!(req.ttl, Some(60));
    }

    #[test]
    fn test_validate_empty_key() {
        let req = StoreRequest {
            key: "".to_string(),
            value: Value::Null,
            ttl: None,
        };
        assert!(req.validate().is_some());
    }

    #[test]
    fn test_validate_long_key() {
        let req = StoreRequest {
            key: "k".repeat(MAX_KEY_LENGTH + 1),
            value: Value::Null,
            ttl: None,
        };
        assert!(req.validate().is_some());
    }

    #[test]
    fn test_step_defaults_to_one() {
        let req: StepRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.step(), 1);

        let req: StepRequest = serde_json::from_str(r#"{"step": -3}"#).unwrap();
        assert_eq!(req.step(), -3);
    }
}
