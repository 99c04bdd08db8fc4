//! Client library for the LogDot logging and metrics ingestion service.
//!
//! The crate exposes four surfaces:
//!
//! - [`Logger`]: structured log transmission with persistent context tags,
//!   batching, and message truncation.
//! - [`Metrics`] / [`BoundMetrics`]: entity management and per-entity metric
//!   transmission with single- and multi-metric batch modes.
//! - [`middleware::TelemetryLayer`]: a `tower` layer that instruments HTTP
//!   services with per-request logs and duration metrics.
//! - [`bridge::BridgeLayer`]: a `tracing_subscriber` layer that forwards
//!   `tracing` events to LogDot.
//!
//! All network calls go through one retrying transport: transport-level
//! failures are retried with exponential backoff and jitter, while any HTTP
//! response is returned immediately.
//!
//! ```no_run
//! use logdot::{Logger, LoggerConfig};
//!
//! # async fn run() -> logdot::Result<()> {
//! let logger = Logger::new(LoggerConfig::new("ilog_live_abc123", "api-server"))?;
//! logger.info("service started", None).await?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod logger;
pub mod metrics;
pub mod middleware;
mod transport;

pub use config::{LoggerConfig, MetricsConfig, RetryConfig};
pub use error::{Error, Result};
pub use logger::{LogEntry, Logger, Severity, Tags};
pub use metrics::{BoundMetrics, CreateEntityOptions, Entity, Metrics};
