//! Per-module route table
//!
//! Routes are keyed by a normalized path (leading and trailing `/` trimmed)
//! and an uppercase HTTP method. Lookup is an exact string match on the
//! normalized path; there is no pattern matching.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::HandlerError;
use crate::host::{BoxFuture, ModuleContext};
use crate::{Request, Response};

/// A route handler. Receives the owning module's context and the request.
pub type RouteHandler = Arc<dyn Fn(ModuleContext, Request) -> BoxFuture<'static, Response> + Send + Sync>;

/// Trim leading and trailing separators from a route path
pub fn normalize_path(path: &str) -> &str {
    path.trim_matches('/')
}

/// Result of looking up a (path, method) pair
pub enum RouteLookup<'a> {
    Found(&'a RouteHandler),
    /// No route at all for the path
    PathNotFound,
    /// The path exists but not for this method
    MethodNotAllowed,
}

struct RouteEntry {
    path: String,
    methods: Vec<(String, RouteHandler)>,
}

/// Ordered set of (method, path) → handler mappings for one module
#[derive(Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
    index: HashMap<String, usize>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a handler for `method` on `path`.
    ///
    /// Mapping the same (method, path) twice replaces the earlier handler.
    ///
    /// # Example
    /// ```ignore
    /// routes.map("POST", "/login", |ctx, req| async move {
    ///     Response::ok(json!({"module": ctx.module_name()}))
    /// });
    /// ```
    pub fn map<F, Fut>(&mut self, method: &str, path: &str, handler: F)
    where
        F: Fn(ModuleContext, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        let handler: RouteHandler = Arc::new(move |ctx, req| Box::pin(handler(ctx, req)));
        self.insert(method, path, handler);
    }

    /// Map a handler returning `Result`; errors become their HTTP response.
    ///
    /// # Example
    /// ```ignore
    /// routes.map_result("POST", "login", |_ctx, req| async move {
    ///     let user: String = req.require_field("user")?;
    ///     Ok(Response::ok(json!({"user": user})))
    /// });
    /// ```
    pub fn map_result<F, Fut>(&mut self, method: &str, path: &str, handler: F)
    where
        F: Fn(ModuleContext, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        let handler: RouteHandler = Arc::new(move |ctx, req| {
            let fut = handler(ctx, req);
            Box::pin(async move {
                match fut.await {
                    Ok(response) => response,
                    Err(err) => err.into_response(),
                }
            })
        });
        self.insert(method, path, handler);
    }

    pub fn get<F, Fut>(&mut self, path: &str, handler: F)
    where
        F: Fn(ModuleContext, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.map("GET", path, handler);
    }

    pub fn post<F, Fut>(&mut self, path: &str, handler: F)
    where
        F: Fn(ModuleContext, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.map("POST", path, handler);
    }

    /// Insert an already boxed handler
    pub fn insert(&mut self, method: &str, path: &str, handler: RouteHandler) {
        let path = normalize_path(path).to_string();
        let method = method.to_uppercase();

        let idx = match self.index.get(&path) {
            Some(idx) => *idx,
            None => {
                self.entries.push(RouteEntry { path: path.clone(), methods: Vec::new() });
                self.index.insert(path, self.entries.len() - 1);
                self.entries.len() - 1
            }
        };

        let methods = &mut self.entries[idx].methods;
        match methods.iter_mut().find(|(m, _)| *m == method) {
            Some(slot) => slot.1 = handler,
            None => methods.push((method, handler)),
        }
    }

    pub fn contains_path(&self, path: &str) -> bool {
        self.index.contains_key(normalize_path(path))
    }

    pub fn contains_method(&self, path: &str, method: &str) -> bool {
        matches!(self.lookup(path, method), RouteLookup::Found(_))
    }

    /// Methods registered for `path`, in registration order
    pub fn methods(&self, path: &str) -> Option<Vec<&str>> {
        let idx = self.index.get(normalize_path(path))?;
        Some(self.entries[*idx].methods.iter().map(|(m, _)| m.as_str()).collect())
    }

    /// Registered paths, in registration order
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.path.as_str())
    }

    pub fn lookup(&self, path: &str, method: &str) -> RouteLookup<'_> {
        let Some(idx) = self.index.get(normalize_path(path)) else {
            return RouteLookup::PathNotFound;
        };

        self.entries[*idx]
            .methods
            .iter()
            .find(|(m, _)| m.eq_ignore_ascii_case(method))
            .map(|(_, handler)| RouteLookup::Found(handler))
            .unwrap_or(RouteLookup::MethodNotAllowed)
    }

    /// Number of (method, path) pairs
    pub fn len(&self) -> usize {
        self.entries.iter().map(|e| e.methods.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for entry in &self.entries {
            let methods: Vec<&str> = entry.methods.iter().map(|(m, _)| m.as_str()).collect();
            map.entry(&entry.path, &methods);
        }
        map.finish()
    }
}
