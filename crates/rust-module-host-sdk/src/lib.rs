//! Rust Module Host SDK - types and traits for writing hot-swappable modules
//!
//! A module is a `cdylib` that implements [`Module`] and exports itself with
//! [`export_module!`]. The host hands it a [`ModuleContext`] for messaging,
//! lifecycle events, storage and sessions, and dispatches HTTP requests to
//! the routes it registers in its [`RouteTable`].

pub mod error;
pub mod event;
pub mod host;
pub mod message;
pub mod module;
pub mod payload;
pub mod request;
pub mod response;
pub mod route;

pub mod prelude {
    //! Common imports for module authors
    pub use crate::error::HandlerError;
    pub use crate::event::{channels, LifecycleEvent};
    pub use crate::export_module;
    pub use crate::host::{BoxFuture, Dependency, KeyValueStore, ModuleContext, SessionStore};
    pub use crate::message::Message;
    pub use crate::module::{CorsPolicy, Module};
    pub use crate::payload::Payload;
    pub use crate::request::Request;
    pub use crate::response::Response;
    pub use crate::route::RouteTable;
    pub use serde::{Deserialize, Serialize};
    pub use serde_json::{json, Value as JsonValue};
}

// Re-export key types at crate root
pub use error::HandlerError;
pub use event::LifecycleEvent;
pub use host::ModuleContext;
pub use message::Message;
pub use module::{CorsPolicy, Module};
pub use payload::Payload;
pub use request::Request;
pub use response::Response;
pub use route::RouteTable;
