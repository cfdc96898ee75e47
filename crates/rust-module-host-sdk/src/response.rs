//! HTTP response produced by a module route handler

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An outgoing HTTP response.
///
/// # Quick Reference
///
/// | Method | Status | Use Case |
/// |--------|--------|----------|
/// | `ok(body)` | 200 | JSON result |
/// | `created(body)` | 201 | Resource created |
/// | `no_content()` | 204 | Nothing to return |
/// | `redirect(status, location)` | 3xx | Redirect |
/// | `bad_request(msg)` | 400 | Invalid input |
/// | `forbidden(msg)` | 403 | Request refused |
/// | `not_found()` | 404 | No such route or resource |
/// | `method_not_allowed()` | 405 | Route exists for another method |
/// | `internal_error(msg)` | 500 | Handler failure |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub body: Option<String>,
}

impl Response {
    /// Create a response with the given status code and no body.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: None,
        }
    }

    /// Create a 200 OK response with JSON body.
    ///
    /// # Example
    /// ```ignore
    /// Response::ok(json!({"message": "Success"}))
    /// ```
    pub fn ok<T: Serialize>(body: T) -> Self {
        Self::json(200, body)
    }

    /// Create a JSON response with a custom status code.
    pub fn json<T: Serialize>(status: u16, body: T) -> Self {
        Self {
            status,
            headers: HashMap::from([("Content-Type".to_string(), "application/json".to_string())]),
            body: serde_json::to_string(&body).ok(),
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(body)
    }

    pub fn html(status: u16, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/html; charset=utf-8")
            .with_body(body)
    }

    pub fn created<T: Serialize>(body: T) -> Self {
        Self::json(201, body)
    }

    pub fn no_content() -> Self {
        Self::new(204)
    }

    /// Create a redirect response.
    ///
    /// # Example
    /// ```ignore
    /// Response::redirect(302, "/shop/")
    /// ```
    pub fn redirect(status: u16, location: impl Into<String>) -> Self {
        Self::new(status).with_header("Location", location)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::error(400, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::error(403, message)
    }

    pub fn not_found() -> Self {
        Self::error(404, "Not Found")
    }

    pub fn not_found_msg(message: impl Into<String>) -> Self {
        Self::error(404, message)
    }

    pub fn method_not_allowed() -> Self {
        Self::error(405, "Method Not Allowed")
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::error(500, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::error(503, message)
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self::json(status, serde_json::json!({ "error": message.into() }))
    }

    /// Add a header to the response (builder pattern).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Header value by case-insensitive name
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(200)
    }
}
