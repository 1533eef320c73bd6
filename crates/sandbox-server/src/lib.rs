//! HTTP boundary of the code sandbox
//!
//! Accepts execution requests, validates them, queues them as jobs and
//! replies with the job's result once a worker has produced it. The server
//! never touches the container engine itself; it only talks to the queue.

pub mod error;

pub use error::{Result, ServerError};

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Json as AxumJson, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::{middleware, Router};
use sandbox_core::{ExecutionQueue, ExecutionRequest, Language, QueueCounts};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub const SERVICE_NAME: &str = "sandbox-service";

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub enable_cors: bool,
    /// Upper bound on handling one request, result wait included
    pub request_timeout: Duration,
    pub max_body_size: usize,
    pub enable_logging: bool,
    /// Added to a job's own timeout when waiting for its result
    pub result_slack: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            enable_cors: true,
            request_timeout: Duration::from_secs(30),
            max_body_size: 1024 * 1024, // 1MB
            enable_logging: true,
            result_slack: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Parse and set the bind address from a string.
    pub fn with_bind_addr_str(mut self, addr: &str) -> Result<Self> {
        self.bind_addr = addr
            .parse()
            .map_err(|e| ServerError::config_error(format!("Invalid bind address: {}", e)))?;
        Ok(self)
    }

    pub fn with_cors(mut self, enable: bool) -> Self {
        self.enable_cors = enable;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    pub fn with_logging(mut self, enable: bool) -> Self {
        self.enable_logging = enable;
        self
    }

    pub fn with_result_slack(mut self, slack: Duration) -> Self {
        self.result_slack = slack;
        self
    }

    /// Build from the `server` section of the service configuration.
    pub fn from_service_config(config: &sandbox_core::ServiceConfig) -> Result<Self> {
        Ok(Self::default()
            .with_bind_addr_str(&config.server.bind_addr())?
            .with_cors(config.server.enable_cors)
            .with_request_timeout(Duration::from_secs(config.server.request_timeout_secs))
            .with_max_body_size(config.server.body_limit_bytes)
            .with_result_slack(Duration::from_millis(config.server.result_slack_ms)))
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub queue: ExecutionQueue,
    pub config: ServerConfig,
    pub started_at: Instant,
}

/// Body of `POST /api/execute`. `input` and `timeout` are accepted as older
/// spellings of `stdin` and `timeoutMs`.
#[derive(Debug, Deserialize)]
struct ExecuteBody {
    language: String,
    code: String,
    #[serde(default, alias = "input")]
    stdin: String,
    #[serde(default, rename = "timeoutMs", alias = "timeout")]
    timeout_ms: Option<u64>,
}

type HandlerError = (StatusCode, Json<serde_json::Value>);

/// Map a failure onto its HTTP reply. Client faults get a validation body;
/// service faults get a 500 body that still has the shape of an execution
/// result.
fn error_response(error: &ServerError) -> HandlerError {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = if error.is_client_error() {
        json!({
            "error": "Validation failed",
            "type": error.error_type(),
            "details": error.to_string(),
        })
    } else {
        json!({
            "status": "error",
            "stdout": "",
            "stderr": error.to_string(),
            "runtime": "0ms",
            "memory": "0mb",
        })
    };
    (status, Json(body))
}

fn parse_request(body: ExecuteBody) -> Result<ExecutionRequest> {
    let language: Language = body.language.parse()?;
    let mut request = ExecutionRequest::new(language, body.code).with_stdin(body.stdin);
    request.timeout_ms = body.timeout_ms;
    Ok(request)
}

/// Handler for the /api/execute POST endpoint.
async fn execute_handler(
    State(app_state): State<AppState>,
    body: std::result::Result<AxumJson<ExecuteBody>, JsonRejection>,
) -> std::result::Result<Response, HandlerError> {
    let body = match body {
        Ok(AxumJson(body)) => body,
        Err(rejection) => {
            log::warn!("Rejected execution request: {}", rejection.body_text());
            return Err(error_response(&ServerError::invalid_request(rejection.body_text())));
        }
    };

    let request = parse_request(body).map_err(|e| {
        log::warn!("Rejected execution request: {}", e);
        error_response(&e)
    })?;
    log::info!(
        "Received execution request ({}, {} chars)",
        request.language,
        request.code.chars().count()
    );
    let timeout_ms = request.effective_timeout_ms(app_state.queue.limits());

    let handle = app_state.queue.submit(request).await.map_err(|e| {
        let error = ServerError::from(e);
        if error.is_client_error() {
            log::warn!("Rejected execution request: {}", error);
        } else {
            log::error!("Failed to queue execution request: {}", error);
        }
        error_response(&error)
    })?;

    let deadline = Duration::from_millis(timeout_ms) + app_state.config.result_slack;

    match handle.wait(deadline).await {
        Ok(result) => Ok(Json(result).into_response()),
        Err(e) => {
            log::error!("Execution request {} failed: {}", handle.id(), e);
            Err(error_response(&ServerError::Queue(e)))
        }
    }
}

/// Handler for the /api/queue/stats GET endpoint.
async fn queue_stats_handler(
    State(app_state): State<AppState>,
) -> std::result::Result<Json<QueueCounts>, HandlerError> {
    log::debug!("Received queue stats request");

    match app_state.queue.counts().await {
        Ok(counts) => Ok(Json(counts)),
        Err(e) => {
            log::error!("Failed to read queue stats: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "Failed to read queue stats",
                    "details": e.to_string(),
                })),
            ))
        }
    }
}

/// Handler for the /api/languages GET endpoint.
async fn languages_handler(State(app_state): State<AppState>) -> Json<serde_json::Value> {
    let supported: Vec<&'static str> = app_state
        .queue
        .registry()
        .languages()
        .into_iter()
        .map(|language| language.as_str())
        .collect();
    Json(json!({
        "supported": supported,
        "count": supported.len(),
    }))
}

async fn health_handler(State(app_state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "timestamp": chrono::Utc::now().timestamp_millis(),
        "uptime": app_state.started_at.elapsed().as_secs_f64(),
    }))
}

/// The sandbox HTTP server.
pub struct SandboxServer {
    queue: ExecutionQueue,
    config: ServerConfig,
}

impl SandboxServer {
    pub fn new(queue: ExecutionQueue) -> Self {
        Self {
            queue,
            config: ServerConfig::default(),
        }
    }

    pub fn with_config(queue: ExecutionQueue, config: ServerConfig) -> Self {
        Self { queue, config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Build the Axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            queue: self.queue.clone(),
            config: self.config.clone(),
            started_at: Instant::now(),
        };

        let api = Router::new()
            .route("/execute", post(execute_handler))
            .route("/queue/stats", get(queue_stats_handler))
            .route("/languages", get(languages_handler));

        let mut router = Router::new()
            .route("/health", get(health_handler))
            .nest("/api", api)
            .layer(DefaultBodyLimit::max(self.config.max_body_size))
            .with_state(state);

        let request_timeout = self.config.request_timeout;
        router = router.layer(middleware::from_fn(
            move |request: axum::http::Request<axum::body::Body>, next: axum::middleware::Next| async move {
                match tokio::time::timeout(request_timeout, next.run(request)).await {
                    Ok(response) => response,
                    Err(_) => (
                        StatusCode::REQUEST_TIMEOUT,
                        Json(json!({
                            "error": "Request timed out",
                            "details": format!("no response within {:?}", request_timeout),
                        })),
                    )
                        .into_response(),
                }
            },
        ));

        if self.config.enable_logging {
            router = router.layer(middleware::from_fn(
                |request: axum::http::Request<axum::body::Body>, next: axum::middleware::Next| async {
                    let request_id = uuid::Uuid::new_v4().to_string();
                    let method = request.method().clone();
                    let uri = request.uri().clone();

                    // health probes arrive every few seconds
                    if uri.path() == "/health" {
                        log::debug!("Request {} {} {}", request_id, method, uri);
                    } else {
                        log::info!("Request {} {} {}", request_id, method, uri);
                    }

                    let start = Instant::now();
                    let response = next.run(request).await;
                    let duration = start.elapsed();

                    if uri.path() == "/health" {
                        log::debug!("Response {} {} in {:?}", request_id, response.status(), duration);
                    } else {
                        log::info!("Response {} {} in {:?}", request_id, response.status(), duration);
                    }

                    response
                },
            ));
        }

        router = router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            router = router.layer(CorsLayer::permissive());
        }

        router
    }

    /// Start the server; returns once `shutdown_signal` resolves and in-flight
    /// requests have drained.
    pub async fn serve_with_shutdown<F>(self, shutdown_signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| {
                ServerError::config_error(format!(
                    "Failed to bind to {}: {}",
                    self.config.bind_addr, e
                ))
            })?;

        log::info!("Sandbox service running on http://{}", self.config.bind_addr);
        log::info!("Health check: http://{}/health", self.config.bind_addr);
        log::info!("Execute API: http://{}/api/execute", self.config.bind_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::internal(format!("Server error: {}", e)))?;

        log::info!("HTTP server shut down gracefully");
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}
