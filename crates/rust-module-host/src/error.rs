//! Error types for the module runtime

use std::any::Any;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use rust_module_host_sdk::HandlerError;
use thiserror::Error;

/// Why a module failed to load. Every variant is a load failure: no
/// descriptor remains and the working copy is removed.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file is held by another process. Retried once before giving up.
    #[error("{path:?} is locked by another process")]
    Locked {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot derive a module name from {path:?}")]
    InvalidName { path: PathBuf },

    #[error("failed to open library {path:?}: {source}")]
    Library {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("ABI version mismatch: host expects {expected}, module exports {found}")]
    AbiMismatch { expected: u32, found: u32 },

    #[error("library does not export `{symbol}`")]
    MissingEntry { symbol: &'static str },

    #[error("failed to resolve dependency {name}: {source}")]
    Dependency {
        name: String,
        #[source]
        source: ContextError,
    },

    #[error("module initialization failed: {0}")]
    InitFailed(String),
}

impl LoadError {
    /// Classify an I/O error, recognizing transient file locks
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if is_lock_error(&source) {
            LoadError::Locked { path, source }
        } else {
            LoadError::Io { path, source }
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, LoadError::Locked { .. })
    }
}

/// Sharing violation on Windows, text file busy on Unix
fn is_lock_error(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    match err.raw_os_error() {
        Some(code) if cfg!(windows) => code == 32 || code == 33,
        Some(code) => code == 26,
        None => false,
    }
}

/// Result of a load that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    /// A module with the same name is already registered; nothing was done
    AlreadyLoaded,
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("execution context has been unloaded")]
    Unloaded,

    #[error("failed to load {path:?}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },
}

impl From<ContextError> for HandlerError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Unloaded => HandlerError::ServiceUnavailable(err.to_string()),
            ContextError::Load { .. } => HandlerError::NotFoundMessage(err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("no reply to message {id} within {timeout:?}")]
    Timeout { id: u64, timeout: Duration },
}

impl From<MessengerError> for HandlerError {
    fn from(err: MessengerError) -> Self {
        match err {
            MessengerError::Timeout { id, timeout } => HandlerError::Timeout {
                id,
                timeout_ms: timeout.as_millis() as u64,
            },
        }
    }
}

/// Best-effort text of a caught panic
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_errors_are_transient() {
        let would_block = io::Error::from(io::ErrorKind::WouldBlock);
        assert!(LoadError::io("a.so", would_block).is_transient());

        let code = if cfg!(windows) { 32 } else { 26 };
        assert!(LoadError::io("a.so", io::Error::from_raw_os_error(code)).is_transient());

        let missing = io::Error::from(io::ErrorKind::NotFound);
        assert!(!LoadError::io("a.so", missing).is_transient());
    }

    #[test]
    fn test_timeout_maps_to_handler_error() {
        let err: HandlerError = MessengerError::Timeout {
            id: 9,
            timeout: Duration::from_secs(1),
        }
        .into();
        assert!(matches!(err, HandlerError::Timeout { id: 9, timeout_ms: 1000 }));
        assert_eq!(err.status_code(), 504);
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");
    }
}
