//! Structured JSON logging with PII masking
//!
//! Log lines carry `{ts, level, service, message, logger, correlation_id,
//! ...context}`. Sensitive fields are masked before serialization; the
//! masking set matches the columns the exporter treats as sensitive.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use sabt_clock::Clock;
use serde_json::{json, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

const SENSITIVE_KEYS: [&str; 6] = [
    "authorization",
    "token",
    "secret",
    "mobile",
    "national_id",
    "mentor_id",
];

/// Mask a sensitive value to `AB***YZ`, or `***` when too short to keep
/// any context
pub fn mask_value(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    if value.chars().count() <= 4 {
        return "***".to_string();
    }
    let head: String = value.chars().take(2).collect();
    let tail: String = value.chars().rev().take(2).collect::<Vec<_>>().into_iter().rev().collect();
    format!("{head}***{tail}")
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    fields: BTreeMap<String, Value>,
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .insert(field.name().to_string(), json!(format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), json!(value));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), json!(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), json!(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), json!(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), json!(value));
    }
}

/// JSON log layer writing one masked object per line
pub struct JsonLogLayer<W = fn() -> std::io::Stdout> {
    service: String,
    clock: Arc<dyn Clock>,
    make_writer: W,
}

impl JsonLogLayer {
    pub fn new(service: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            service: service.into(),
            clock,
            make_writer: std::io::stdout,
        }
    }
}

impl<W, O> JsonLogLayer<W>
where
    W: Fn() -> O + Send + Sync + 'static,
    O: Write,
{
    pub fn with_writer(service: impl Into<String>, clock: Arc<dyn Clock>, make_writer: W) -> Self {
        Self {
            service: service.into(),
            clock,
            make_writer,
        }
    }

    fn render(&self, event: &Event<'_>) -> Value {
        let mut collector = FieldCollector::default();
        event.record(&mut collector);

        let metadata = event.metadata();
        let mut payload = serde_json::Map::new();
        payload.insert("ts".into(), json!(self.clock.now().to_rfc3339()));
        payload.insert("level".into(), json!(metadata.level().to_string()));
        payload.insert("service".into(), json!(self.service));
        payload.insert("message".into(), json!(collector.message));
        payload.insert("logger".into(), json!(metadata.target()));

        let correlation_id = collector
            .fields
            .remove("correlation_id")
            .unwrap_or(Value::Null);
        payload.insert("correlation_id".into(), correlation_id);

        for (key, value) in collector.fields {
            let lowered = key.to_lowercase();
            if SENSITIVE_KEYS.contains(&lowered.as_str()) {
                let text = match &value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                payload.insert(key, json!(mask_value(&text)));
            } else {
                payload.insert(key, value);
            }
        }
        Value::Object(payload)
    }
}

impl<S, W, O> Layer<S> for JsonLogLayer<W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: Fn() -> O + Send + Sync + 'static,
    O: Write,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let payload = self.render(event);
        let mut writer = (self.make_writer)();
        let _ = writeln!(writer, "{payload}");
    }
}
