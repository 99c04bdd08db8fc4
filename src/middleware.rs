//! HTTP auto-instrumentation middleware.
//!
//! [`TelemetryLayer`] wraps any `tower::Service` handling `http` requests so
//! every request produces one log entry (severity derived from the response
//! status) and optionally one `http.request.duration` metric. The metrics
//! entity is resolved lazily, once per layer, on the first instrumented
//! request.
//!
//! Telemetry is strictly best-effort: handler panics and errors become plain
//! 500 responses, and failures inside the telemetry path itself never reach
//! the HTTP stack.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use http::{Request, Response, StatusCode};
use serde_json::json;
use tower::{Layer, Service};
use tracing::debug;

use crate::logger::{Logger, Severity, Tags};
use crate::metrics::{BoundMetrics, CreateEntityOptions, Metrics};

/// Metric name used for request durations.
const DURATION_METRIC: &str = "http.request.duration";

/// Configuration for [`TelemetryLayer`].
pub struct MiddlewareConfig {
    /// Logger receiving per-request entries (required).
    pub logger: Arc<Logger>,
    /// Metrics client for duration metrics (optional).
    pub metrics: Option<Arc<Metrics>>,
    /// Entity name for lazy resolution. Defaults to the logger's hostname
    /// when left empty.
    pub entity_name: String,
    /// Emit one log entry per request.
    pub log_requests: bool,
    /// Emit a duration metric per request (requires `metrics`).
    pub log_metrics: bool,
    /// Paths excluded from both logging and metrics.
    pub ignore_paths: HashSet<String>,
}

impl MiddlewareConfig {
    /// Creates a config with request logging and metrics enabled.
    pub fn new(logger: Arc<Logger>) -> Self {
        Self {
            logger,
            metrics: None,
            entity_name: String::new(),
            log_requests: true,
            log_metrics: true,
            ignore_paths: HashSet::new(),
        }
    }
}

struct Shared {
    logger: Arc<Logger>,
    metrics: Option<Arc<Metrics>>,
    entity_name: String,
    log_requests: bool,
    log_metrics: bool,
    ignore_paths: HashSet<String>,
    /// Lazily resolved entity-bound client. The async lock also serializes
    /// resolution so concurrent first requests cannot create duplicates.
    bound: tokio::sync::Mutex<Option<Arc<BoundMetrics>>>,
}

/// Tower layer wrapping services in [`Telemetry`].
#[derive(Clone)]
pub struct TelemetryLayer {
    shared: Arc<Shared>,
}

impl TelemetryLayer {
    /// Builds the layer from its configuration.
    pub fn new(config: MiddlewareConfig) -> Self {
        let entity_name = if config.entity_name.is_empty() {
            config.logger.hostname().to_string()
        } else {
            config.entity_name
        };
        Self {
            shared: Arc::new(Shared {
                logger: config.logger,
                metrics: config.metrics,
                entity_name,
                log_requests: config.log_requests,
                log_metrics: config.log_metrics,
                ignore_paths: config.ignore_paths,
                bound: tokio::sync::Mutex::new(None),
            }),
        }
    }
}

impl<S> Layer<S> for TelemetryLayer {
    type Service = Telemetry<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Telemetry {
            inner,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Service produced by [`TelemetryLayer`].
#[derive(Clone)]
pub struct Telemetry<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S, B, RB> Service<Request<B>> for Telemetry<S>
where
    S: Service<Request<B>, Response = Response<RB>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    B: Send + 'static,
    RB: Default + Send + 'static,
{
    type Response = Response<RB>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response<RB>, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let shared = Arc::clone(&self.shared);
        let method = request.method().to_string();
        let path = request.uri().path().to_string();
        let skip = shared.ignore_paths.contains(&path);

        // Take the ready service and leave a clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            if skip {
                return inner.call(request).await;
            }

            let start = Instant::now();
            let outcome = AssertUnwindSafe(inner.call(request)).catch_unwind().await;
            let duration_ms = round2(start.elapsed().as_secs_f64() * 1000.0);

            let response = match outcome {
                Ok(Ok(response)) => response,
                // Handler errors and panics both collapse to a plain 500.
                Ok(Err(_)) | Err(_) => internal_error_response(),
            };
            let status = response.status().as_u16();

            let _ = AssertUnwindSafe(shared.observe(&method, &path, status, duration_ms))
                .catch_unwind()
                .await;

            Ok(response)
        })
    }
}

impl Shared {
    async fn observe(&self, method: &str, path: &str, status: u16, duration_ms: f64) {
        if self.log_requests {
            self.log_request(method, path, status, duration_ms).await;
        }
        if self.log_metrics && self.metrics.is_some() {
            self.send_metric(method, path, status, duration_ms).await;
        }
    }

    async fn log_request(&self, method: &str, path: &str, status: u16, duration_ms: f64) {
        let message = format!("{method} {path} {status} ({duration_ms:.0}ms)");
        let mut tags = Tags::new();
        tags.insert("http_method".to_string(), json!(method));
        tags.insert("http_path".to_string(), json!(path));
        tags.insert("http_status".to_string(), json!(status));
        tags.insert("duration_ms".to_string(), json!(duration_ms));
        tags.insert("source".to_string(), json!("http_middleware"));

        let severity = severity_from_status(status);
        if let Err(err) = self.logger.log(severity, message, Some(tags)).await {
            debug!(error = %err, "request log dropped");
        }
    }

    async fn send_metric(&self, method: &str, path: &str, status: u16, duration_ms: f64) {
        let Some(bound) = self.ensure_entity().await else {
            return;
        };
        let mut tags = Tags::new();
        tags.insert("method".to_string(), json!(method));
        tags.insert("path".to_string(), json!(path));
        tags.insert("status".to_string(), json!(status.to_string()));

        if let Err(err) = bound
            .send(DURATION_METRIC, duration_ms, "ms", Some(tags))
            .await
        {
            debug!(error = %err, "duration metric dropped");
        }
    }

    /// Returns the bound metrics client, resolving the entity on first use.
    /// A failed resolution leaves the slot empty so the next request retries.
    async fn ensure_entity(&self) -> Option<Arc<BoundMetrics>> {
        let metrics = self.metrics.as_ref()?;
        let mut slot = self.bound.lock().await;
        if let Some(bound) = slot.as_ref() {
            return Some(Arc::clone(bound));
        }

        let opts = CreateEntityOptions {
            name: self.entity_name.clone(),
            description: format!("HTTP service: {}", self.entity_name),
            metadata: None,
        };
        match metrics.get_or_create_entity(opts).await {
            Ok(entity) => {
                let bound = Arc::new(metrics.for_entity(entity.id));
                *slot = Some(Arc::clone(&bound));
                Some(bound)
            }
            Err(err) => {
                debug!(error = %err, "entity resolution failed, will retry on next request");
                None
            }
        }
    }
}

fn internal_error_response<RB: Default>() -> Response<RB> {
    let mut response = Response::new(RB::default());
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

fn severity_from_status(status: u16) -> Severity {
    match status {
        500.. => Severity::Error,
        400..=499 => Severity::Warn,
        _ => Severity::Info,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoggerConfig, MetricsConfig};
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use std::convert::Infallible;
    use tower::{service_fn, ServiceExt};

    async fn handler(request: Request<()>) -> Result<Response<String>, Infallible> {
        let response = match request.uri().path() {
            "/error" => {
                let mut response = Response::new(String::new());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
            "/notfound" => {
                let mut response = Response::new(String::new());
                *response.status_mut() = StatusCode::NOT_FOUND;
                response
            }
            "/panic" => panic!("handler exploded"),
            _ => Response::new("ok".to_string()),
        };
        Ok(response)
    }

    /// A logger in batch mode captures entries in memory, so middleware
    /// behavior is observable without a network.
    fn capture_logger() -> Arc<Logger> {
        let logger =
            Logger::new(LoggerConfig::new("test_key", "test-service")).expect("logger");
        logger.begin_batch();
        Arc::new(logger)
    }

    fn request(method: &str, path: &str) -> Request<()> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(())
            .expect("request")
    }

    #[tokio::test]
    async fn passes_the_response_through() {
        let logger = capture_logger();
        let service = TelemetryLayer::new(MiddlewareConfig::new(Arc::clone(&logger)))
            .layer(service_fn(handler));

        let response = service.oneshot(request("GET", "/api/users")).await.expect("call");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), "ok");
    }

    #[tokio::test]
    async fn logs_severity_by_status_class() {
        for (path, severity, status) in [
            ("/api/users", Severity::Info, "200"),
            ("/notfound", Severity::Warn, "404"),
            ("/error", Severity::Error, "500"),
        ] {
            let logger = capture_logger();
            let service = TelemetryLayer::new(MiddlewareConfig::new(Arc::clone(&logger)))
                .layer(service_fn(handler));
            service.oneshot(request("GET", path)).await.expect("call");

            let entries = logger.queued_entries();
            assert_eq!(entries.len(), 1, "exactly one entry for {path}");
            let entry = &entries[0];
            assert_eq!(entry.severity, severity);
            assert!(entry.message.contains("GET"), "message: {}", entry.message);
            assert!(entry.message.contains(path), "message: {}", entry.message);
            assert!(entry.message.contains(status), "message: {}", entry.message);
        }
    }

    #[tokio::test]
    async fn log_entry_carries_request_tags() {
        let logger = capture_logger();
        let service = TelemetryLayer::new(MiddlewareConfig::new(Arc::clone(&logger)))
            .layer(service_fn(handler));
        service.oneshot(request("POST", "/api/orders")).await.expect("call");

        let entries = logger.queued_entries();
        let tags = entries[0].tags.as_ref().expect("tags present");
        assert_eq!(tags["http_method"], json!("POST"));
        assert_eq!(tags["http_path"], json!("/api/orders"));
        assert_eq!(tags["http_status"], json!(200));
        assert_eq!(tags["source"], json!("http_middleware"));
        assert!(tags.contains_key("duration_ms"));
    }

    #[tokio::test]
    async fn handler_panic_becomes_a_500_response() {
        let logger = capture_logger();
        let service = TelemetryLayer::new(MiddlewareConfig::new(Arc::clone(&logger)))
            .layer(service_fn(handler));

        let response = service.oneshot(request("GET", "/panic")).await.expect("call");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let entries = logger.queued_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].severity, Severity::Error);
        assert!(entries[0].message.contains("500"));
    }

    #[tokio::test]
    async fn ignored_paths_are_not_observed() {
        let logger = capture_logger();
        let mut config = MiddlewareConfig::new(Arc::clone(&logger));
        config.ignore_paths.insert("/healthz".to_string());
        let service = TelemetryLayer::new(config).layer(service_fn(handler));

        let response = service.oneshot(request("GET", "/healthz")).await.expect("call");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(logger.batch_size(), 0);
    }

    #[tokio::test]
    async fn entity_is_resolved_once_across_requests() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/api/v1/entities/by-name/test-entity",
            ))
            .times(1)
            .respond_with(json_encoded(serde_json::json!({
                "data": {"id": "e1", "name": "test-entity", "description": ""}
            }))),
        );
        server.expect(
            Expectation::matching(request::method_path("POST", "/api/v1/metrics"))
                .times(2)
                .respond_with(status_code(200)),
        );

        let metrics = Arc::new(
            Metrics::new(MetricsConfig {
                base_url: server.url_str("/api/v1"),
                ..MetricsConfig::new("test_key")
            })
            .expect("metrics"),
        );
        let mut config = MiddlewareConfig::new(capture_logger());
        config.metrics = Some(metrics);
        config.entity_name = "test-entity".to_string();
        config.log_requests = false;
        let layer = TelemetryLayer::new(config);

        for _ in 0..2 {
            let service = layer.layer(service_fn(handler));
            service.oneshot(request("GET", "/api/users")).await.expect("call");
        }
    }

    #[tokio::test]
    async fn failed_entity_resolution_is_retried_on_the_next_request() {
        let server = Server::run();
        // First request: lookup and create both fail, metric is skipped.
        // Second request: lookup succeeds and the metric goes out.
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/api/v1/entities/by-name/flaky",
            ))
            .times(2)
            .respond_with(cycle![
                status_code(500),
                json_encoded(serde_json::json!({
                    "data": {"id": "e2", "name": "flaky", "description": ""}
                })),
            ]),
        );
        server.expect(
            Expectation::matching(request::method_path("POST", "/api/v1/entities"))
                .times(1)
                .respond_with(status_code(500)),
        );
        server.expect(
            Expectation::matching(request::method_path("POST", "/api/v1/metrics"))
                .times(1)
                .respond_with(status_code(200)),
        );

        let metrics = Arc::new(
            Metrics::new(MetricsConfig {
                base_url: server.url_str("/api/v1"),
                ..MetricsConfig::new("test_key")
            })
            .expect("metrics"),
        );
        let mut config = MiddlewareConfig::new(capture_logger());
        config.metrics = Some(metrics);
        config.entity_name = "flaky".to_string();
        config.log_requests = false;
        let layer = TelemetryLayer::new(config);

        for _ in 0..2 {
            let service = layer.layer(service_fn(handler));
            service.oneshot(request("GET", "/api/users")).await.expect("call");
        }
    }

    #[test]
    fn severity_thresholds() {
        assert_eq!(severity_from_status(200), Severity::Info);
        assert_eq!(severity_from_status(304), Severity::Info);
        assert_eq!(severity_from_status(400), Severity::Warn);
        assert_eq!(severity_from_status(499), Severity::Warn);
        assert_eq!(severity_from_status(500), Severity::Error);
        assert_eq!(severity_from_status(503), Severity::Error);
    }

    #[test]
    fn round2_keeps_two_decimals() {
        assert_eq!(round2(12.3456), 12.35);
        assert_eq!(round2(0.004), 0.0);
    }
}
