//! Path-prefix dispatch to module route tables
//!
//! `/<base>/<module>/<route...>` selects the Active module named by the first
//! segment after the base path and looks `<route>` up in its route table.
//! The root path selects the `index` module.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use rust_module_host_sdk::route::{normalize_path, RouteLookup};
use rust_module_host_sdk::{Request, Response};

use super::registry::{ModuleInstance, ModuleRegistry};
use crate::error::panic_message;

/// Module serving the root path
pub const INDEX_MODULE: &str = "index";

/// How a request was handled
#[derive(Debug)]
pub enum RouteOutcome {
    Handled(Response),
    /// The module exists but has no route for the path
    NotFound,
    /// The route exists for other methods
    MethodNotAllowed,
    /// Module root requested without a trailing slash
    Redirect(String),
    /// No module matched; the caller decides what to serve
    FallThrough,
}

impl RouteOutcome {
    /// The response for this outcome, or `None` for `FallThrough`
    pub fn into_response(self) -> Option<Response> {
        match self {
            RouteOutcome::Handled(response) => Some(response),
            RouteOutcome::NotFound => Some(Response::not_found()),
            RouteOutcome::MethodNotAllowed => Some(Response::method_not_allowed()),
            RouteOutcome::Redirect(location) => Some(Response::redirect(302, location)),
            RouteOutcome::FallThrough => None,
        }
    }
}

/// Module name and in-module route parsed from a request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub module: String,
    pub route: String,
}

/// A target whose module is Active
pub struct Resolved {
    pub target: RouteTarget,
    pub instance: Arc<ModuleInstance>,
}

pub struct ModuleRouter {
    registry: Arc<ModuleRegistry>,
    base_path: String,
}

impl ModuleRouter {
    pub fn new(registry: Arc<ModuleRegistry>, base_path: &str) -> Self {
        Self {
            registry,
            base_path: normalize_path(base_path).to_string(),
        }
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Split `path` into module and route, without consulting the registry
    pub fn parse(&self, path: &str) -> Option<RouteTarget> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Some(RouteTarget {
                module: INDEX_MODULE.to_string(),
                route: String::new(),
            });
        }

        let rest = if self.base_path.is_empty() {
            trimmed
        } else {
            match trimmed.strip_prefix(self.base_path.as_str()) {
                Some("") => "",
                Some(rest) if rest.starts_with('/') => rest.trim_start_matches('/'),
                _ => return None,
            }
        };

        if rest.is_empty() {
            return Some(RouteTarget {
                module: INDEX_MODULE.to_string(),
                route: String::new(),
            });
        }

        let (module, route) = rest.split_once('/').unwrap_or((rest, ""));
        Some(RouteTarget {
            module: module.to_lowercase(),
            route: normalize_path(route).to_string(),
        })
    }

    /// Resolve `path` to an Active module
    pub fn resolve(&self, path: &str) -> Option<Resolved> {
        let target = self.parse(path)?;
        let instance = self.registry.active(&target.module)?;
        Some(Resolved { target, instance })
    }

    /// Name of the Active module `path` resolves to
    pub fn resolve_module(&self, path: &str) -> Option<String> {
        self.resolve(path).map(|r| r.target.module)
    }

    pub async fn dispatch(&self, mut request: Request) -> RouteOutcome {
        let Some(Resolved { target, instance }) = self.resolve(&request.path) else {
            return RouteOutcome::FallThrough;
        };

        let at_module_root = target.route.is_empty() && !request.path.trim_matches('/').is_empty();
        if at_module_root && !request.path.ends_with('/') {
            let location = match request.query_string.as_deref() {
                Some(q) if !q.is_empty() => format!("{}/?{}", request.path, q),
                _ => format!("{}/", request.path),
            };
            return RouteOutcome::Redirect(location);
        }

        let handler = match instance.routes().lookup(&target.route, &request.method) {
            RouteLookup::Found(handler) => handler.clone(),
            RouteLookup::PathNotFound => return RouteOutcome::NotFound,
            RouteLookup::MethodNotAllowed => return RouteOutcome::MethodNotAllowed,
        };

        request.route = target.route;
        let context = instance.context().clone();

        // `instance` outlives the handler and its future, keeping the image mapped
        let response = match catch_unwind(AssertUnwindSafe(|| handler(context, request))) {
            Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
            Err(payload) => Err(payload),
        };
        drop(handler);

        let outcome = match response {
            Ok(response) => RouteOutcome::Handled(response),
            Err(payload) => {
                tracing::error!(
                    module = %target.module,
                    error = %panic_message(payload.as_ref()),
                    "Route handler panicked"
                );
                RouteOutcome::Handled(Response::internal_error("Internal Server Error"))
            }
        };
        drop(instance);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{FakeLoader, Fixture, TestHost};
    use std::time::Duration;

    fn router(host: &TestHost, base: &str) -> ModuleRouter {
        ModuleRouter::new(host.registry.clone(), base)
    }

    fn request(method: &str, path: &str) -> Request {
        Request {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    fn target(module: &str, route: &str) -> Option<RouteTarget> {
        Some(RouteTarget {
            module: module.into(),
            route: route.into(),
        })
    }

    #[test]
    fn test_parse_without_base() {
        let host = TestHost::new(FakeLoader::new());
        let router = router(&host, "");

        assert_eq!(router.parse(""), target("index", ""));
        assert_eq!(router.parse("/"), target("index", ""));
        assert_eq!(router.parse("/Api/login/"), target("api", "login"));
        assert_eq!(router.parse("/api/users/info"), target("api", "users/info"));
        assert_eq!(router.parse("/api"), target("api", ""));
    }

    #[test]
    fn test_parse_with_base() {
        let host = TestHost::new(FakeLoader::new());
        let router = router(&host, "/base/");

        assert_eq!(router.base_path(), "base");
        assert_eq!(router.parse("/base/api/login"), target("api", "login"));
        assert_eq!(router.parse("/base"), target("index", ""));
        assert_eq!(router.parse("/"), target("index", ""));
        assert_eq!(router.parse("/basement/api"), None);
        assert_eq!(router.parse("/other/api"), None);
    }

    async fn loaded(modules: &[(&str, fn() -> rust_module_host_sdk::module::ModuleBox)]) -> TestHost {
        let mut loader = FakeLoader::new();
        for (name, factory) in modules {
            loader = loader.with(name, *factory);
        }
        let host = TestHost::new(loader);
        for (name, _) in modules {
            host.registry.load(&host.module_file(name, name)).await.unwrap();
        }
        host
    }

    #[tokio::test]
    async fn test_api_login_scenario() {
        let host = loaded(&[("api", Fixture::greeter)]).await;
        let router = router(&host, "/base");

        let mut login = request("POST", "/base/api/login");
        login.body = Some(r#"{"user": "ada"}"#.into());
        match router.dispatch(login).await {
            RouteOutcome::Handled(response) => assert_eq!(response.status, 200),
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            router.dispatch(request("GET", "/base/api/login")).await,
            RouteOutcome::MethodNotAllowed
        ));
        assert!(matches!(
            router.dispatch(request("POST", "/base/api/unknown")).await,
            RouteOutcome::NotFound
        ));
        assert!(matches!(
            router.dispatch(request("POST", "/elsewhere/api/login")).await,
            RouteOutcome::FallThrough
        ));
    }

    #[tokio::test]
    async fn test_validation_error_is_400() {
        let host = loaded(&[("api", Fixture::greeter)]).await;
        let router = router(&host, "");

        let mut login = request("POST", "/api/login");
        login.body = Some("{}".into());
        let response = router.dispatch(login).await.into_response().unwrap();
        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn test_root_falls_through_without_index() {
        let host = loaded(&[("api", Fixture::greeter)]).await;
        let router = router(&host, "");
        assert!(matches!(router.dispatch(request("GET", "/")).await, RouteOutcome::FallThrough));
    }

    #[tokio::test]
    async fn test_root_served_by_index() {
        let host = loaded(&[("index", Fixture::greeter)]).await;
        let router = router(&host, "");

        let response = router.dispatch(request("GET", "/")).await.into_response().unwrap();
        assert_eq!(response.body.as_deref(), Some("root of greeter"));
    }

    #[tokio::test]
    async fn test_module_root_redirects_with_query() {
        let host = loaded(&[("api", Fixture::greeter)]).await;
        let router = router(&host, "");

        let mut req = request("GET", "/api");
        req.query_string = Some("page=2".into());
        match router.dispatch(req).await {
            RouteOutcome::Redirect(location) => assert_eq!(location, "/api/?page=2"),
            other => panic!("unexpected {:?}", other),
        }

        let response = router.dispatch(request("GET", "/api/")).await.into_response().unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_module_name_case_insensitive() {
        let host = loaded(&[("api", Fixture::greeter)]).await;
        let router = router(&host, "");

        let response = router.dispatch(request("GET", "/API/hello")).await.into_response().unwrap();
        let body: serde_json::Value = serde_json::from_str(response.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["module"], "api");
    }

    #[tokio::test]
    async fn test_unloaded_module_not_resolved() {
        let host = loaded(&[("api", Fixture::greeter)]).await;
        let router = router(&host, "");
        host.registry.unload("api").await;

        assert!(router.resolve("/api/hello").is_none());
        assert!(matches!(
            router.dispatch(request("GET", "/api/hello")).await,
            RouteOutcome::FallThrough
        ));
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_500() {
        let host = loaded(&[("api", Fixture::greeter)]).await;
        let router = router(&host, "");

        let response = router.dispatch(request("GET", "/api/panic")).await.into_response().unwrap();
        assert_eq!(response.status, 500);

        let response = router.dispatch(request("GET", "/api/hello")).await.into_response().unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_request_keeps_image_alive() {
        let host = loaded(&[("api", Fixture::greeter)]).await;
        let router = Arc::new(router(&host, ""));
        let image = Arc::downgrade(host.registry.active("api").unwrap().image().unwrap());

        let in_flight = tokio::spawn({
            let router = router.clone();
            async move { router.dispatch(request("GET", "/api/slow")).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        host.registry.unload("api").await;
        assert!(image.upgrade().is_some());

        let response = in_flight.await.unwrap().into_response().unwrap();
        assert_eq!(response.body.as_deref(), Some("\"done\""));
        assert_eq!(image.strong_count(), 0);
    }
}
