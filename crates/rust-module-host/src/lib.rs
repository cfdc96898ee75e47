//! Rust Module Host
//!
//! Loads independently built module libraries at runtime, routes HTTP
//! requests to them by path prefix, lets them message each other, and swaps
//! a module's code in place when its file changes.

pub mod config;
pub mod error;
pub mod gateway;
pub mod runtime;
pub mod session;
pub mod storage;

pub use config::HostConfig;
pub use error::{LoadError, LoadOutcome};
pub use runtime::Host;
