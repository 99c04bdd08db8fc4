//! Metrics transmission: entity lifecycle and the per-entity batch state
//! machine.
//!
//! [`Metrics`] manages entities (create, lookup, get-or-create) and hands out
//! [`BoundMetrics`] clients tied to one entity id. A bound client is in one
//! of three mutually exclusive modes: idle (every `send` goes straight to the
//! API), single-metric batch (one name/unit, values accumulated via `add`),
//! or multi-metric batch (heterogeneous entries via `add_metric`). Queued
//! entries are shipped in one request by `send_batch`.

use std::sync::{Arc, Mutex, MutexGuard};

use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MetricsConfig;
use crate::error::{Error, Result};
use crate::logger::Tags;
use crate::transport::{is_success, Transport};

/// An entity as returned by create/lookup operations. The id is
/// server-assigned and opaque; callers cache it for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub description: String,
}

/// Options for [`Metrics::create_entity`] and
/// [`Metrics::get_or_create_entity`].
#[derive(Debug, Clone, Default)]
pub struct CreateEntityOptions {
    pub name: String,
    pub description: String,
    pub metadata: Option<Tags>,
}

/// A single metric as sent on the wire. Tags are pre-formatted `"key:value"`
/// strings at entry-creation time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricEntry {
    #[serde(rename = "entity_id", skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub name: String,
    pub value: f64,
    pub unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Serialize)]
struct EntityPayload<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a Tags>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    data: ApiEntity,
}

#[derive(Debug, Default, Deserialize)]
struct ApiEntity {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Serialize)]
struct BatchMetricsPayload<'a> {
    entity_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    metrics: Vec<BatchMetricEntry>,
}

#[derive(Serialize)]
struct BatchMetricEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    value: f64,
    unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tags: Option<Vec<String>>,
}

/// Last error message and HTTP status observed by a client, kept as an
/// observational side channel for post-hoc inspection.
#[derive(Debug)]
struct LastStatus {
    error: Option<String>,
    http_code: i32,
}

impl Default for LastStatus {
    fn default() -> Self {
        // -1 means no response has been observed yet.
        Self {
            error: None,
            http_code: -1,
        }
    }
}

/// Client for the LogDot metrics API: entity management plus creation of
/// entity-bound metric clients.
pub struct Metrics {
    transport: Arc<Transport>,
    base_url: Url,
    status: Mutex<LastStatus>,
}

impl Metrics {
    /// Creates a metrics client from the given configuration.
    pub fn new(config: MetricsConfig) -> Result<Self> {
        config.validate()?;
        let base_url = Url::parse(config.base_url.trim_end_matches('/'))
            .map_err(|err| Error::InvalidConfig(format!("invalid base URL: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::InvalidConfig(
                "base URL must be an absolute http(s) URL".to_string(),
            ));
        }
        let transport = Transport::new(
            &config.api_key,
            config.timeout,
            config.retry.clone(),
            config.debug,
            config.cancel.clone(),
        )?;
        Ok(Self {
            transport: Arc::new(transport),
            base_url,
            status: Mutex::new(LastStatus::default()),
        })
    }

    /// Creates a new entity via `POST /entities`. Fails on a non-success
    /// status or when the response carries no entity id.
    pub async fn create_entity(&self, opts: CreateEntityOptions) -> Result<Entity> {
        let url = endpoint(&self.base_url, &["entities"]);
        let payload = EntityPayload {
            name: &opts.name,
            description: &opts.description,
            metadata: opts.metadata.as_ref(),
        };

        let (status, body) = match self.transport.post(url.as_str(), &payload).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.status().fail(err.to_string());
                return Err(err);
            }
        };
        self.status().set_code(status);
        if !is_success(status) {
            self.status().fail(format!("HTTP {}", status.as_u16()));
            return Err(Error::Status {
                operation: "entity creation",
                status: status.as_u16(),
            });
        }

        let response: ApiResponse = match serde_json::from_slice(&body) {
            Ok(response) => response,
            Err(err) => {
                self.status().fail(err.to_string());
                return Err(Error::Decode(err));
            }
        };
        if response.data.id.is_empty() {
            self.status().fail("no entity id in response".to_string());
            return Err(Error::MissingEntityId);
        }

        self.status().clear();
        debug!(entity_id = %response.data.id, "entity created");
        Ok(Entity {
            id: response.data.id,
            name: opts.name,
            description: opts.description,
        })
    }

    /// Looks up an entity by name via `GET /entities/by-name/{name}` (the
    /// name is path-escaped). Succeeds only on status 200 with an id present.
    pub async fn get_entity_by_name(&self, name: &str) -> Result<Entity> {
        let url = endpoint(&self.base_url, &["entities", "by-name", name]);

        let (status, body) = match self.transport.get(url.as_str()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.status().fail(err.to_string());
                return Err(err);
            }
        };
        self.status().set_code(status);
        if status != StatusCode::OK {
            self.status().fail(format!("HTTP {}", status.as_u16()));
            return Err(Error::Status {
                operation: "entity lookup",
                status: status.as_u16(),
            });
        }

        let response: ApiResponse = match serde_json::from_slice(&body) {
            Ok(response) => response,
            Err(err) => {
                self.status().fail(err.to_string());
                return Err(Error::Decode(err));
            }
        };
        if response.data.id.is_empty() {
            self.status().fail("no entity id in response".to_string());
            return Err(Error::MissingEntityId);
        }

        self.status().clear();
        debug!(entity_id = %response.data.id, "entity found");
        Ok(Entity {
            id: response.data.id,
            name: response.data.name,
            description: response.data.description,
        })
    }

    /// Looks up the entity by name and falls back to creating it.
    ///
    /// Any lookup failure triggers creation, not just "not found": transport
    /// errors and outages are indistinguishable from a missing entity here.
    /// The server is expected to deduplicate creates by name.
    pub async fn get_or_create_entity(&self, opts: CreateEntityOptions) -> Result<Entity> {
        match self.get_entity_by_name(&opts.name).await {
            Ok(entity) => Ok(entity),
            Err(_) => self.create_entity(opts).await,
        }
    }

    /// Binds a metrics client to an existing entity id. No network call.
    pub fn for_entity(&self, entity_id: impl Into<String>) -> BoundMetrics {
        BoundMetrics {
            transport: Arc::clone(&self.transport),
            base_url: self.base_url.clone(),
            entity_id: entity_id.into(),
            state: Mutex::new(BatchState {
                mode: BatchMode::Idle,
                queue: Vec::new(),
            }),
            status: Mutex::new(LastStatus::default()),
        }
    }

    /// Last error message observed, if any.
    pub fn last_error(&self) -> Option<String> {
        self.status().error.clone()
    }

    /// Last HTTP status code observed, or -1 before any response.
    pub fn last_http_code(&self) -> i32 {
        self.status().http_code
    }

    fn status(&self) -> MutexGuard<'_, LastStatus> {
        #[allow(clippy::expect_used)]
        self.status.lock().expect("lock poisoned")
    }
}

impl LastStatus {
    fn set_code(&mut self, status: StatusCode) {
        self.http_code = i32::from(status.as_u16());
    }

    fn fail(&mut self, message: String) {
        self.error = Some(message);
    }

    fn clear(&mut self) {
        self.error = None;
    }
}

#[derive(Debug)]
enum BatchMode {
    Idle,
    Single { name: String, unit: String },
    Multi,
}

#[derive(Debug)]
struct BatchState {
    mode: BatchMode,
    queue: Vec<MetricEntry>,
}

/// Metrics client bound to one entity id.
///
/// Mode transitions and the queue are guarded by one lock; network calls are
/// never made while it is held.
pub struct BoundMetrics {
    transport: Arc<Transport>,
    base_url: Url,
    entity_id: String,
    state: Mutex<BatchState>,
    status: Mutex<LastStatus>,
}

impl BoundMetrics {
    /// The entity id this client is bound to.
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Sends a single metric immediately. Only legal while no batch is open.
    pub async fn send(
        &self,
        name: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        tags: Option<Tags>,
    ) -> Result<()> {
        {
            let state = self.state();
            if !matches!(state.mode, BatchMode::Idle) {
                drop(state);
                self.status().fail(Error::BatchModeActive.to_string());
                return Err(Error::BatchModeActive);
            }
        }

        let entry = MetricEntry {
            entity_id: Some(self.entity_id.clone()),
            name: name.into(),
            value,
            unit: unit.into(),
            tags: format_tags(tags.as_ref()),
        };

        let url = endpoint(&self.base_url, &["metrics"]);
        let (status, _) = match self.transport.post(url.as_str(), &entry).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.status().fail(err.to_string());
                return Err(err);
            }
        };
        self.status().set_code(status);
        if !is_success(status) {
            self.status().fail(format!("HTTP {}", status.as_u16()));
            return Err(Error::Status {
                operation: "metric send",
                status: status.as_u16(),
            });
        }

        self.status().clear();
        Ok(())
    }

    /// Enters single-metric batch mode: all subsequent [`BoundMetrics::add`]
    /// calls share this name and unit. Resets the queue.
    pub fn begin_batch(&self, name: impl Into<String>, unit: impl Into<String>) {
        let mut state = self.state();
        state.mode = BatchMode::Single {
            name: name.into(),
            unit: unit.into(),
        };
        state.queue.clear();
    }

    /// Queues one value in single-metric batch mode.
    pub fn add(&self, value: f64, tags: Option<Tags>) -> Result<()> {
        let mut state = self.state();
        let (name, unit) = match &state.mode {
            BatchMode::Single { name, unit } => (name.clone(), unit.clone()),
            _ => {
                drop(state);
                self.status().fail(Error::NotInSingleBatch.to_string());
                return Err(Error::NotInSingleBatch);
            }
        };
        state.queue.push(MetricEntry {
            entity_id: None,
            name,
            value,
            unit,
            tags: format_tags(tags.as_ref()),
        });
        Ok(())
    }

    /// Enters multi-metric batch mode. Resets the queue.
    pub fn begin_multi_batch(&self) {
        let mut state = self.state();
        state.mode = BatchMode::Multi;
        state.queue.clear();
    }

    /// Queues one named metric in multi-metric batch mode.
    pub fn add_metric(
        &self,
        name: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        tags: Option<Tags>,
    ) -> Result<()> {
        let mut state = self.state();
        if !matches!(state.mode, BatchMode::Multi) {
            drop(state);
            self.status().fail(Error::NotInMultiBatch.to_string());
            return Err(Error::NotInMultiBatch);
        }
        state.queue.push(MetricEntry {
            entity_id: None,
            name: name.into(),
            value,
            unit: unit.into(),
            tags: format_tags(tags.as_ref()),
        });
        Ok(())
    }

    /// Ships the queued metrics in one request. A no-op while idle or with an
    /// empty queue. In single-metric mode the name travels once at the
    /// envelope level; in multi-metric mode it travels per entry. The queue
    /// is cleared on success only; the mode is preserved either way.
    pub async fn send_batch(&self) -> Result<()> {
        let (queue, envelope_name) = {
            let state = self.state();
            if matches!(state.mode, BatchMode::Idle) || state.queue.is_empty() {
                return Ok(());
            }
            let envelope_name = match &state.mode {
                BatchMode::Single { name, .. } => Some(name.clone()),
                _ => None,
            };
            (state.queue.clone(), envelope_name)
        };

        let multi = envelope_name.is_none();
        let metrics = queue
            .into_iter()
            .map(|entry| BatchMetricEntry {
                name: multi.then_some(entry.name),
                value: entry.value,
                unit: entry.unit,
                tags: entry.tags,
            })
            .collect();
        let payload = BatchMetricsPayload {
            entity_id: &self.entity_id,
            name: envelope_name.as_deref(),
            metrics,
        };

        let url = endpoint(&self.base_url, &["metrics", "batch"]);
        let (status, _) = match self.transport.post(url.as_str(), &payload).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.status().fail(err.to_string());
                return Err(err);
            }
        };
        self.status().set_code(status);
        if !is_success(status) {
            self.status().fail(format!("HTTP {}", status.as_u16()));
            return Err(Error::Status {
                operation: "metric batch send",
                status: status.as_u16(),
            });
        }

        self.clear_batch();
        self.status().clear();
        Ok(())
    }

    /// Forces idle mode and empties the queue.
    pub fn end_batch(&self) {
        let mut state = self.state();
        state.mode = BatchMode::Idle;
        state.queue.clear();
    }

    /// Empties the queue without changing mode.
    pub fn clear_batch(&self) {
        self.state().queue.clear();
    }

    /// Number of metrics currently queued.
    pub fn batch_size(&self) -> usize {
        self.state().queue.len()
    }

    /// Last error message observed, if any.
    pub fn last_error(&self) -> Option<String> {
        self.status().error.clone()
    }

    /// Last HTTP status code observed, or -1 before any response.
    pub fn last_http_code(&self) -> i32 {
        self.status().http_code
    }

    fn state(&self) -> MutexGuard<'_, BatchState> {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned")
    }

    fn status(&self) -> MutexGuard<'_, LastStatus> {
        #[allow(clippy::expect_used)]
        self.status.lock().expect("lock poisoned")
    }
}

/// Joins path segments onto the base URL with proper escaping.
fn endpoint(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    {
        #[allow(clippy::expect_used)]
        let mut parts = url
            .path_segments_mut()
            .expect("base URL validated at construction");
        parts.pop_if_empty().extend(segments);
    }
    url
}

/// Renders a tags mapping to `"key:value"` strings. String values appear
/// verbatim, everything else through its JSON rendering. Empty or absent
/// mappings become `None` so the field is left off the wire.
fn format_tags(tags: Option<&Tags>) -> Option<Vec<String>> {
    let tags = tags?;
    if tags.is_empty() {
        return None;
    }
    Some(
        tags.iter()
            .map(|(key, value)| match value {
                serde_json::Value::String(text) => format!("{key}:{text}"),
                other => format!("{key}:{other}"),
            })
            .collect(),
    )
}
