//! HTTP request as seen by a module route handler

use crate::error::HandlerError;
use crate::payload::{convert_field, Payload};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::str::FromStr;

/// An incoming HTTP request routed to a module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// HTTP method, uppercase
    pub method: String,

    /// Full request path as received (e.g. "/shop/cart/add")
    pub path: String,

    /// Path relative to the module, normalized (e.g. "cart/add")
    #[serde(default)]
    pub route: String,

    /// Raw query string without the leading `?`
    #[serde(default)]
    pub query_string: Option<String>,

    #[serde(default)]
    pub query: HashMap<String, String>,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub body: Option<String>,

    #[serde(default)]
    pub client_ip: Option<String>,

    /// Request ID for tracing
    #[serde(default)]
    pub request_id: String,

    /// Session identifier from the session cookie
    #[serde(default)]
    pub session_id: Option<String>,
}

impl Request {
    /// Parse the body as JSON into a typed struct.
    ///
    /// # Example
    /// ```ignore
    /// #[derive(Deserialize)]
    /// struct CreateUser { name: String, email: String }
    ///
    /// let user: CreateUser = req.json()?;
    /// ```
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_str(self.body.as_deref().unwrap_or("null"))
            .map_err(|e| HandlerError::BadRequest(format!("Invalid JSON: {}", e)))
    }

    /// Request data as a payload: query parameters for GET and DELETE,
    /// otherwise the JSON object body. A missing or non-object body is empty.
    pub fn data(&self) -> Payload {
        if self.is_method("GET") || self.is_method("DELETE") {
            return self
                .query
                .iter()
                .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
                .collect();
        }

        match self.body.as_deref().map(serde_json::from_str::<JsonValue>) {
            Some(Ok(JsonValue::Object(map))) => map.into_iter().collect(),
            _ => Payload::new(),
        }
    }

    /// Get a required field from the request data.
    ///
    /// Query values are strings, so for GET a numeric field is parsed from
    /// its text. Missing or mistyped fields are validation errors.
    ///
    /// # Example
    /// ```ignore
    /// let name: String = req.require_field("name")?;
    /// ```
    pub fn require_field<T: DeserializeOwned>(&self, key: &str) -> Result<T, HandlerError> {
        let data = self.data();
        let value = data
            .get(key)
            .ok_or_else(|| HandlerError::validation(key, "missing required field"))?;
        convert_lenient(key, value)
    }

    /// Get an optional field from the request data
    pub fn field<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, HandlerError> {
        match self.data().get(key) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(value) => convert_lenient(key, value).map(Some),
        }
    }

    pub fn query_param(&self, key: &str) -> Option<&String> {
        self.query.get(key)
    }

    /// Get a query parameter parsed as a specific type.
    /// Returns None if the parameter doesn't exist or can't be parsed.
    ///
    /// # Example
    /// ```ignore
    /// // URL: /items?page=2&limit=10
    /// let page: i64 = req.query_param_as("page").unwrap_or(1);
    /// ```
    pub fn query_param_as<T: FromStr>(&self, key: &str) -> Option<T> {
        self.query.get(key).and_then(|v| v.parse().ok())
    }

    /// Get a required query parameter parsed as a specific type.
    pub fn require_query_param<T: FromStr>(&self, key: &str) -> Result<T, HandlerError> {
        self.query
            .get(key)
            .ok_or_else(|| HandlerError::validation(key, "missing required query parameter"))?
            .parse()
            .map_err(|_| HandlerError::validation(key, "invalid value for query parameter"))
    }

    /// Get a header value (case-insensitive lookup).
    pub fn header(&self, key: &str) -> Option<&String> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    pub fn require_header(&self, key: &str) -> Result<&String, HandlerError> {
        self.header(key)
            .ok_or_else(|| HandlerError::BadRequest(format!("Missing required header: {}", key)))
    }

    /// Check if request method matches (case-insensitive).
    pub fn is_method(&self, method: &str) -> bool {
        self.method.eq_ignore_ascii_case(method)
    }

    pub fn content_type(&self) -> Option<&String> {
        self.header("Content-Type")
    }

    pub fn is_json(&self) -> bool {
        self.content_type()
            .map(|ct| ct.contains("application/json"))
            .unwrap_or(false)
    }

    /// Path and query string, as needed for a redirect `Location`
    pub fn path_and_query(&self) -> String {
        match &self.query_string {
            Some(q) if !q.is_empty() => format!("{}?{}", self.path, q),
            _ => self.path.clone(),
        }
    }
}

/// Like [`convert_field`], but retries a string value as a JSON literal so
/// `"42"` from a query string converts to a number.
fn convert_lenient<T: DeserializeOwned>(key: &str, value: &JsonValue) -> Result<T, HandlerError> {
    match convert_field(key, value) {
        Ok(v) => Ok(v),
        Err(err) => match value {
            JsonValue::String(s) => serde_json::from_str::<JsonValue>(s)
                .ok()
                .and_then(|parsed| convert_field(key, &parsed).ok())
                .ok_or(err),
            _ => Err(err),
        },
    }
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            path: "/".to_string(),
            route: String::new(),
            query_string: None,
            query: HashMap::new(),
            headers: HashMap::new(),
            body: None,
            client_ip: None,
            request_id: String::new(),
            session_id: None,
        }
    }
}
