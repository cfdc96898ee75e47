//! Error types for Rust Module Host modules

use thiserror::Error;

/// Errors that can occur in a module handler
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A payload or request field is missing or has the wrong type.
    ///
    /// Produced uniformly by [`crate::Payload`] and [`crate::Request`] accessors
    /// so HTTP handlers and message handlers report validation the same way.
    #[error("Invalid field '{field}': {reason}")]
    Validation { field: String, reason: String },

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Not found: {0}")]
    NotFoundMessage(String),

    #[error("Not found")]
    NotFound,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("No reply to message {id} within {timeout_ms} ms")]
    Timeout { id: u64, timeout_ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Build a validation error for `field`
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        HandlerError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Convert the error to an HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            HandlerError::BadRequest(_)
            | HandlerError::Validation { .. }
            | HandlerError::SerializationError(_) => 400,
            HandlerError::Unauthorized(_) => 401,
            HandlerError::NotFound | HandlerError::NotFoundMessage(_) => 404,
            HandlerError::Timeout { .. } => 504,
            HandlerError::ServiceUnavailable(_) => 503,
            _ => 500,
        }
    }

    /// Convert to a Response
    pub fn to_response(&self) -> crate::Response {
        let mut body = serde_json::json!({ "error": self.to_string() });
        if let HandlerError::Validation { field, .. } = self {
            body["field"] = serde_json::Value::String(field.clone());
        }
        crate::Response::json(self.status_code(), body)
    }

    /// Consume the error and convert it into a Response
    pub fn into_response(self) -> crate::Response {
        self.to_response()
    }
}

impl From<HandlerError> for crate::Response {
    fn from(err: HandlerError) -> Self {
        err.to_response()
    }
}
