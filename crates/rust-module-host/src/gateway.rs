//! HTTP gateway - converts axum requests for the module router
//!
//! Every request goes through the resolved module's CORS guard, is announced
//! on the event bus, and is then dispatched to the module. Paths no module
//! claims get a 404, except `/health`, which reports host status when no
//! module named `health` is active.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use http_body_util::LengthLimitError;
use rust_module_host_sdk::event::LifecycleEvent;
use rust_module_host_sdk::CorsPolicy;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::runtime::{Host, RouteOutcome};
use crate::session::{new_session_id, session_cookie, session_id_from_cookies, SessionService};

const REQUEST_HEADERS: &str = "access-control-request-headers";
const REQUEST_METHOD: &str = "access-control-request-method";
const HEALTH_PATH: &str = "/health";

/// Shared state of the gateway routes
pub struct GatewayState {
    pub host: Host,
    pub sessions: Option<Arc<SessionService>>,
    pub max_body_size: usize,
}

impl GatewayState {
    pub fn new(host: Host) -> Self {
        Self {
            host,
            sessions: None,
            max_body_size: 1024 * 1024,
        }
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionService>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_max_body_size(mut self, limit: usize) -> Self {
        self.max_body_size = limit;
        self
    }
}

/// Build the gateway router
pub fn create_gateway_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/{*path}", any(handle_module_request))
        .route("/", any(handle_module_request))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Host status. Served at `/health` unless a module claims that path.
fn health_check(state: &GatewayState) -> Response {
    let stats = state.host.registry.stats();
    (
        StatusCode::OK,
        axum::Json(serde_json::json!({
            "status": "ok",
            "modules": stats.active,
            "leaked_contexts": stats.leaked_contexts,
        })),
    )
        .into_response()
}

/// Result of checking a request against a module's CORS policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsVerdict {
    pub origin_passed: bool,
    pub headers_passed: bool,
    /// Explanations for the rejection, one line each
    pub failures: Vec<String>,
}

impl CorsVerdict {
    fn pass() -> Self {
        Self {
            origin_passed: true,
            headers_passed: true,
            failures: Vec::new(),
        }
    }

    pub fn passed(&self) -> bool {
        self.origin_passed && self.headers_passed
    }
}

/// Evaluate the CORS guard. Only policies that block failed requests can fail.
pub fn check_cors(policy: &CorsPolicy, origin: Option<&str>, requested_headers: &[String]) -> CorsVerdict {
    let mut verdict = CorsVerdict::pass();
    if !policy.block_failed_requests {
        return verdict;
    }

    if !policy.allowed_origins.is_empty() {
        let allowed = origin
            .map(|o| policy.allowed_origins.iter().any(|a| a.eq_ignore_ascii_case(o)))
            .unwrap_or(false);
        if !allowed {
            verdict.origin_passed = false;
            verdict.failures.push("Origin not allowed.".to_string());
        }
    }

    if !policy.allowed_headers.is_empty() {
        for requested in requested_headers {
            if !policy.allowed_headers.iter().any(|a| a.eq_ignore_ascii_case(requested)) {
                verdict.headers_passed = false;
                verdict.failures.push(format!("Header '{}' not allowed.", requested));
            }
        }
    }

    verdict
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn requested_headers(headers: &HeaderMap) -> Vec<String> {
    header_str(headers, REQUEST_HEADERS)
        .map(|raw| {
            raw.split(',')
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// `Access-Control-Allow-*` headers for an allowed cross-origin request
fn cors_headers(policy: &CorsPolicy, origin: Option<&str>) -> Vec<(header::HeaderName, String)> {
    let Some(origin) = origin else {
        return Vec::new();
    };
    let allow_origin = if policy.allowed_origins.is_empty() {
        "*".to_string()
    } else if policy.allowed_origins.iter().any(|a| a.eq_ignore_ascii_case(origin)) {
        origin.to_string()
    } else {
        return Vec::new();
    };

    let allow_headers = if policy.allowed_headers.is_empty() {
        "*".to_string()
    } else {
        policy.allowed_headers.join(", ")
    };

    vec![
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin),
        (header::ACCESS_CONTROL_ALLOW_HEADERS, allow_headers),
        (header::ACCESS_CONTROL_ALLOW_METHODS, "*".to_string()),
    ]
}

fn client_ip(request: &Request<Body>) -> Option<String> {
    header_str(request.headers(), "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
}

async fn handle_module_request(State(state): State<Arc<GatewayState>>, request: Request<Body>) -> Response {
    let method = request.method().as_str().to_uppercase();
    let path = request.uri().path().to_string();
    let request_id = Uuid::new_v4().to_string();

    let resolved = state.host.router.resolve_module(&path);
    if resolved.is_none() && path == HEALTH_PATH && *request.method() == Method::GET {
        return health_check(&state);
    }
    let policy = resolved
        .as_deref()
        .and_then(|name| state.host.registry.get(name))
        .map(|d| d.cors().clone())
        .unwrap_or_default();

    let origin = header_str(request.headers(), "origin").map(str::to_string);
    let verdict = check_cors(&policy, origin.as_deref(), &requested_headers(request.headers()));

    tracing::debug!(
        request_id = %request_id,
        method = %method,
        path = %path,
        module = ?resolved,
        "Incoming request"
    );

    state.host.events.publish(LifecycleEvent::RequestReceived {
        request_id: request_id.clone(),
        method: method.clone(),
        path: path.clone(),
        module: resolved.clone(),
        cors_passed: verdict.passed(),
        origin_passed: verdict.origin_passed,
        headers_passed: verdict.headers_passed,
    });

    if !verdict.passed() {
        tracing::info!(request_id = %request_id, path = %path, "Request rejected by CORS guard");
        return (StatusCode::FORBIDDEN, verdict.failures.join("\n")).into_response();
    }

    let allow = cors_headers(&policy, origin.as_deref());

    if resolved.is_some() && *request.method() == Method::OPTIONS && request.headers().contains_key(REQUEST_METHOD) {
        let mut response = StatusCode::NO_CONTENT.into_response();
        append_headers(response.headers_mut(), allow);
        return response;
    }

    // Session cookie, minted on first contact when sessions are enabled
    let (session_id, new_session) = match &state.sessions {
        Some(_) => match header_str(request.headers(), "cookie").and_then(session_id_from_cookies) {
            Some(id) => (Some(id), false),
            None => (Some(new_session_id()), true),
        },
        None => (None, false),
    };
    let secure = request.uri().scheme_str() == Some("https")
        || header_str(request.headers(), "x-forwarded-proto") == Some("https");

    let sdk_request = match to_sdk_request(request, &state, request_id.clone(), session_id.clone()).await {
        Ok(req) => req,
        Err(response) => return response,
    };

    let mut response = match state.host.router.dispatch(sdk_request).await {
        RouteOutcome::FallThrough => (StatusCode::NOT_FOUND, "Module not found").into_response(),
        outcome => match outcome.into_response() {
            Some(sdk_response) => from_sdk_response(sdk_response),
            None => (StatusCode::NOT_FOUND, "Module not found").into_response(),
        },
    };

    append_headers(response.headers_mut(), allow);
    if let (true, Some(id), Some(sessions)) = (new_session, session_id.as_deref(), &state.sessions) {
        let cookie = session_cookie(id, sessions.timeout(), secure);
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}

fn append_headers(headers: &mut HeaderMap, extra: Vec<(header::HeaderName, String)>) {
    for (name, value) in extra {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
}

/// Whether reading a body failed because it exceeded the size limit
fn is_length_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = source {
        if current.is::<LengthLimitError>() {
            return true;
        }
        source = current.source();
    }
    false
}

async fn to_sdk_request(
    request: Request<Body>,
    state: &GatewayState,
    request_id: String,
    session_id: Option<String>,
) -> Result<rust_module_host_sdk::Request, Response> {
    let declared_length = header_str(request.headers(), "content-length").and_then(|v| v.parse::<usize>().ok());
    if declared_length.is_some_and(|len| len > state.max_body_size) {
        return Err((StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response());
    }

    let query_string = request.uri().query().map(str::to_string);
    let query: HashMap<String, String> = query_string
        .as_deref()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let headers: HashMap<String, String> = request
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();

    let method = request.method().as_str().to_uppercase();
    let path = request.uri().path().to_string();
    let client_ip = client_ip(&request);

    let body_bytes = match axum::body::to_bytes(request.into_body(), state.max_body_size).await {
        Ok(bytes) => bytes,
        Err(e) if is_length_limit(&e) => {
            tracing::info!(request_id = %request_id, limit = state.max_body_size, "Request body too large");
            return Err((StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response());
        }
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e, "Failed to read body");
            return Err((StatusCode::BAD_REQUEST, "Failed to read body").into_response());
        }
    };
    let body = if body_bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&body_bytes).to_string())
    };

    Ok(rust_module_host_sdk::Request {
        method,
        path,
        route: String::new(),
        query_string,
        query,
        headers,
        body,
        client_ip,
        request_id,
        session_id,
    })
}

fn from_sdk_response(sdk_response: rust_module_host_sdk::Response) -> Response {
    let mut builder =
        Response::builder().status(StatusCode::from_u16(sdk_response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));

    for (key, value) in &sdk_response.headers {
        builder = builder.header(key.as_str(), value.as_str());
    }

    match builder.body(Body::from(sdk_response.body.unwrap_or_default())) {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, "Module returned an invalid response");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to build response").into_response()
        }
    }
}

/// Periodically purge expired sessions until the task is aborted
pub fn spawn_session_cleanup(sessions: Arc<SessionService>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = sessions.cleanup_expired() {
                tracing::warn!(error = %e, "Session cleanup failed");
            }
        }
    })
}
