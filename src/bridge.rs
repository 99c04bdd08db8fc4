//! Bridge from the `tracing` ecosystem into LogDot.
//!
//! [`BridgeLayer`] is a `tracing_subscriber` layer that forwards events to a
//! [`Logger`]. Event levels map onto LogDot severities, span fields become
//! tags prefixed with the dot-joined span path, and every forwarded entry is
//! tagged `source: "tracing"`.
//!
//! The transport itself emits `tracing` events when debug traces are on, so
//! the layer carries a reentrancy guard: events produced while a forward is
//! in progress on the same thread or task are dropped instead of looping.
//! Forwarding never fails the caller; without a Tokio runtime, or on any
//! transport error, the event is silently discarded.

use std::cell::Cell;
use std::sync::Arc;

use serde_json::json;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;

use crate::logger::{Logger, Severity, Tags};

tokio::task_local! {
    /// Present on tasks spawned by the bridge to send an entry.
    static FORWARDING: ();
}

thread_local! {
    /// Set while the synchronous part of `on_event` runs.
    static IN_HANDLER: Cell<bool> = const { Cell::new(false) };
}

fn reentrant() -> bool {
    IN_HANDLER.with(Cell::get) || FORWARDING.try_with(|_| ()).is_ok()
}

/// Layer forwarding `tracing` events to a [`Logger`].
pub struct BridgeLayer {
    logger: Arc<Logger>,
    min_severity: Severity,
}

/// Keeps the bridge installed for the current thread; dropping it restores
/// the previous subscriber.
pub struct BridgeGuard {
    _guard: DefaultGuard,
}

impl BridgeLayer {
    /// Creates a layer forwarding every event (threshold [`Severity::Debug`]).
    pub fn new(logger: Arc<Logger>) -> Self {
        Self {
            logger,
            min_severity: Severity::Debug,
        }
    }

    /// Sets the minimum severity that gets forwarded.
    pub fn with_min_severity(mut self, min_severity: Severity) -> Self {
        self.min_severity = min_severity;
        self
    }

    /// Installs the bridge as the thread-local default subscriber, scoped to
    /// the returned guard's lifetime.
    pub fn install_scoped(self) -> BridgeGuard {
        let subscriber = tracing_subscriber::registry().with(self);
        BridgeGuard {
            _guard: tracing::subscriber::set_default(subscriber),
        }
    }

    /// Installs the bridge as the process-wide default subscriber. Fails if
    /// another global subscriber was installed first.
    pub fn install_global(self) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
        tracing::subscriber::set_global_default(tracing_subscriber::registry().with(self))
    }
}

/// Span fields captured at creation time, stored in the span's extensions.
struct SpanFields(Tags);

impl<S> Layer<S> for BridgeLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        span.extensions_mut().insert(SpanFields(visitor.fields));
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut visitor = FieldVisitor::default();
        values.record(&mut visitor);
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<SpanFields>() {
            Some(SpanFields(fields)) => fields.append(&mut visitor.fields),
            None => extensions.insert(SpanFields(visitor.fields)),
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let severity = severity_from_level(event.metadata().level());
        if severity < self.min_severity || reentrant() {
            return;
        }
        // Events emitted while building the entry (for example by accessors
        // on the logger itself) must not re-enter the bridge.
        IN_HANDLER.with(|flag| flag.set(true));
        self.forward(severity, event, ctx);
        IN_HANDLER.with(|flag| flag.set(false));
    }
}

impl BridgeLayer {
    fn forward<S>(&self, severity: Severity, event: &Event<'_>, ctx: Context<'_, S>)
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut tags = Tags::new();
        tags.insert("source".to_string(), json!("tracing"));

        // Span fields, outermost span first so inner spans win collisions.
        // Each field key is prefixed with the dot-joined span path.
        if let Some(scope) = ctx.event_scope(event) {
            let mut path = String::new();
            for span in scope.from_root() {
                if !path.is_empty() {
                    path.push('.');
                }
                path.push_str(span.name());
                if let Some(SpanFields(fields)) = span.extensions().get::<SpanFields>() {
                    for (key, value) in fields {
                        tags.insert(format!("{path}.{key}"), value.clone());
                    }
                }
            }
        }
        for (key, value) in visitor.fields {
            tags.insert(key, value);
        }

        let message = visitor
            .message
            .unwrap_or_else(|| event.metadata().name().to_string());

        // Sending is async; hand it to the runtime if one is around. The
        // task_local marker stops transport traces from looping back in.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let logger = Arc::clone(&self.logger);
        handle.spawn(FORWARDING.scope((), async move {
            let _ = logger.log(severity, message, Some(tags)).await;
        }));
    }
}

fn severity_from_level(level: &Level) -> Severity {
    match *level {
        Level::ERROR => Severity::Error,
        Level::WARN => Severity::Warn,
        Level::INFO => Severity::Info,
        _ => Severity::Debug,
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Tags,
}

impl FieldVisitor {
    fn capture(&mut self, field: &Field, value: serde_json::Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                serde_json::Value::String(text) => text,
                other => other.to_string(),
            });
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.capture(field, json!(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.capture(field, json!(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.capture(field, json!(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.capture(field, json!(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.capture(field, json!(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.capture(field, json!(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.capture(field, json!(format!("{value:?}")));
    }
}
