//! The module trait and the dynamic library entry points
//!
//! A module is compiled as a `cdylib` against this crate and exports its
//! constructor with [`export_module!`]. The host loads the library, checks
//! [`ABI_VERSION`], calls the factory and drives the returned [`Module`]
//! through its lifecycle.
//!
//! # Example
//!
//! ```ignore
//! use rust_module_host_sdk::prelude::*;
//!
//! struct Greeter;
//!
//! impl Module for Greeter {
//!     fn routes(&self, routes: &mut RouteTable) {
//!         routes.get("hello", |ctx, _req| async move {
//!             Response::ok(json!({"from": ctx.module_name()}))
//!         });
//!     }
//! }
//!
//! export_module!(Greeter);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::HandlerError;
use crate::host::{BoxFuture, ModuleContext};
use crate::route::RouteTable;

/// Bumped whenever the `Module` trait or any type crossing the boundary changes
pub const ABI_VERSION: u32 = 1;

/// Symbol of the exported `extern "C" fn() -> u32`
pub const ABI_VERSION_SYMBOL: &[u8] = b"module_abi_version\0";

/// Symbol of the exported `extern "C" fn() -> *mut ModuleBox`
pub const MODULE_ENTRY_SYMBOL: &[u8] = b"module_entry\0";

/// The module handle returned by the factory
pub type ModuleBox = Box<dyn Module>;

pub type AbiVersionFn = unsafe extern "C" fn() -> u32;

#[allow(improper_ctypes_definitions)]
pub type ModuleEntryFn = unsafe extern "C" fn() -> *mut ModuleBox;

/// Cross-origin policy a module declares for its routes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorsPolicy {
    /// Allowed `Origin` values; empty means any origin
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Allowed `Access-Control-Request-Headers` entries; empty means any
    #[serde(default)]
    pub allowed_headers: Vec<String>,

    /// Refuse requests that fail the policy instead of only reporting them
    #[serde(default)]
    pub block_failed_requests: bool,
}

impl CorsPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.allowed_headers.push(header.into());
        self
    }

    pub fn blocking(mut self) -> Self {
        self.block_failed_requests = true;
        self
    }
}

/// A dynamically loaded module
pub trait Module: Send + Sync {
    /// Cross-origin policy for the module's routes
    fn cors(&self) -> CorsPolicy {
        CorsPolicy::default()
    }

    /// Names of shared libraries the module needs, resolved from the host's
    /// dependencies directory before `on_load` runs
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Register the module's HTTP routes
    fn routes(&self, routes: &mut RouteTable);

    /// Called once after the routes are collected. An error aborts the load.
    fn on_load<'a>(&'a self, ctx: &'a ModuleContext) -> BoxFuture<'a, Result<(), HandlerError>> {
        let _ = ctx;
        Box::pin(async { Ok(()) })
    }

    /// Called during unload, after the module's subscriptions are revoked
    fn on_unload(&self, ctx: &ModuleContext) {
        let _ = ctx;
    }
}

/// Export a module constructor from a `cdylib`.
///
/// Generates `module_abi_version` and `module_entry`. A panicking
/// constructor makes `module_entry` return null, which the host reports as a
/// failed load.
#[macro_export]
macro_rules! export_module {
    ($ctor:expr) => {
        #[no_mangle]
        pub extern "C" fn module_abi_version() -> u32 {
            $crate::module::ABI_VERSION
        }

        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn module_entry() -> *mut $crate::module::ModuleBox {
            match ::std::panic::catch_unwind(|| {
                let module: $crate::module::ModuleBox = ::std::boxed::Box::new($ctor);
                module
            }) {
                Ok(module) => ::std::boxed::Box::into_raw(::std::boxed::Box::new(module)),
                Err(_) => ::std::ptr::null_mut(),
            }
        }
    };
}
