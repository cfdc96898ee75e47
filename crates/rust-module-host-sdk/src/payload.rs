//! Message payloads with typed, validating accessors

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::error::HandlerError;

/// String-keyed payload carried by messages and events.
///
/// Values are arbitrary JSON. Typed access goes through [`Payload::require`]
/// and [`Payload::optional`], which report a missing or mistyped field as
/// [`HandlerError::Validation`] instead of panicking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(HashMap<String, JsonValue>);

impl Payload {
    /// Create an empty payload
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value (builder pattern).
    ///
    /// # Example
    /// ```ignore
    /// let data = Payload::new().with("greeting", "hi").with("count", 3);
    /// ```
    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert a value, returning the previous one
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Option<JsonValue> {
        self.0.insert(key.into(), value.into())
    }

    /// Raw access to a value
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.0.iter()
    }

    /// Get a required field converted to `T`.
    ///
    /// # Example
    /// ```ignore
    /// let name: String = msg.data.require("name")?;
    /// ```
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T, HandlerError> {
        let value = self
            .0
            .get(key)
            .ok_or_else(|| HandlerError::validation(key, "missing required field"))?;
        convert_field(key, value)
    }

    /// Get an optional field converted to `T`.
    ///
    /// A missing key or JSON `null` yields `Ok(None)`; a present value of the
    /// wrong type is still a validation error.
    pub fn optional<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, HandlerError> {
        match self.0.get(key) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(value) => convert_field(key, value).map(Some),
        }
    }

    pub fn into_inner(self) -> HashMap<String, JsonValue> {
        self.0
    }
}

/// Convert one JSON value into `T`, naming the field on failure
pub(crate) fn convert_field<T: DeserializeOwned>(key: &str, value: &JsonValue) -> Result<T, HandlerError> {
    T::deserialize(value).map_err(|e| HandlerError::validation(key, e.to_string()))
}

impl From<HashMap<String, JsonValue>> for Payload {
    fn from(map: HashMap<String, JsonValue>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<JsonValue>> FromIterator<(K, V)> for Payload {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_typed_field() {
        let data = Payload::new().with("name", "ada").with("age", 36);

        let name: String = data.require("name").unwrap();
        let age: u32 = data.require("age").unwrap();
        assert_eq!(name, "ada");
        assert_eq!(age, 36);
    }

    #[test]
    fn test_require_missing_field_is_validation_error() {
        let data = Payload::new();
        match data.require::<String>("name") {
            Err(HandlerError::Validation { field, .. }) => assert_eq!(field, "name"),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_require_wrong_type_is_validation_error() {
        let data = Payload::new().with("age", "old");
        assert!(matches!(
            data.require::<u32>("age"),
            Err(HandlerError::Validation { .. })
        ));
    }

    #[test]
    fn test_optional_field() {
        let data = Payload::new().with("nick", JsonValue::Null).with("count", 2);

        assert_eq!(data.optional::<String>("nick").unwrap(), None);
        assert_eq!(data.optional::<String>("absent").unwrap(), None);
        assert_eq!(data.optional::<i64>("count").unwrap(), Some(2));
        assert!(data.optional::<String>("count").is_err());
    }
}
