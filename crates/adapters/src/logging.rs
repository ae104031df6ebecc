//! Log output formats.
//!
//! Text lines are prefixed with the pipeline name.  Setting
//! `SMARTCITY_LOG_JSON` to `1`, `true`, `yes` or `on` switches to one JSON
//! object per line, for log collectors:
//!
//! ```text
//! {"timestamp":"2024-03-01T08:00:00.123456Z","level":"INFO","target":"smartcity_adapters::controller::sink",
//!  "pipeline":"city","stream":"vehicle","message":"flushed batch ...","fields":{}}
//! ```
//!
//! `stream` comes from the `stream` span each chain runs in.  Fields of
//! enclosing spans other than the stream kind are reported under `spans`.

use chrono::{SecondsFormat, Utc};
use colored::{ColoredString, Colorize};
use serde_json::{Map, Number, Value};
use std::fmt::Debug;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::{Format, Writer};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable that selects the JSON log format.
pub const LOG_JSON_ENV: &str = "SMARTCITY_LOG_JSON";

/// Span field that names the stream a chain reads.
const STREAM_FIELD: &str = "kind";

/// Tracing fields collected as JSON values.
#[derive(Clone, Debug, Default)]
pub struct JsonFields(pub Map<String, Value>);

impl JsonFields {
    fn put(&mut self, field: &Field, value: Value) {
        self.0.insert(field.name().to_string(), value);
    }
}

impl Visit for JsonFields {
    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        self.put(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_i128(&mut self, field: &Field, value: i128) {
        self.put(
            field,
            i64::try_from(value).map_or_else(|_| Value::String(value.to_string()), Value::from),
        );
    }

    fn record_u128(&mut self, field: &Field, value: u128) {
        self.put(
            field,
            u64::try_from(value).map_or_else(|_| Value::String(value.to_string()), Value::from),
        );
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        // NaN and infinities have no JSON representation.
        self.put(
            field,
            Number::from_f64(value).map_or_else(|| Value::String(value.to_string()), Value::Number),
        );
    }
}

/// Keeps the fields of every span as [`JsonFields`] in the span's
/// extensions, where [`JsonPipelineFormat`] finds them.
pub struct SpanFieldsLayer;

impl<S> Layer<S> for SpanFieldsLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            let mut fields = JsonFields::default();
            attrs.record(&mut fields);
            span.extensions_mut().insert(fields);
        }
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            if let Some(fields) = span.extensions_mut().get_mut::<JsonFields>() {
                values.record(fields);
            }
        }
    }
}

/// JSON formatter that tags every event with the pipeline name and the
/// stream it was emitted for.
pub struct JsonPipelineFormat {
    pipeline: String,
}

impl JsonPipelineFormat {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
        }
    }
}

impl<S, N> FormatEvent<S, N> for JsonPipelineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let mut line = Map::new();
        line.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        line.insert("level".to_string(), Value::from(metadata.level().as_str()));
        line.insert("target".to_string(), Value::from(metadata.target()));
        line.insert("pipeline".to_string(), Value::from(self.pipeline.as_str()));

        // Outer spans first, so inner spans win on conflicting names.
        let mut span_fields = Map::new();
        for span in ctx.event_scope().into_iter().flat_map(|scope| scope.from_root()) {
            if let Some(JsonFields(fields)) = span.extensions().get::<JsonFields>() {
                span_fields.extend(fields.clone());
            }
        }
        if let Some(stream) = span_fields.remove(STREAM_FIELD) {
            line.insert("stream".to_string(), stream);
        }
        if !span_fields.is_empty() {
            line.insert("spans".to_string(), Value::Object(span_fields));
        }

        let mut fields = JsonFields::default();
        event.record(&mut fields);
        if let Some(message) = fields.0.remove("message") {
            line.insert("message".to_string(), message);
        }
        line.insert("fields".to_string(), Value::Object(fields.0));

        writeln!(writer, "{}", Value::Object(line))
    }
}

/// True when structured JSON logging is requested via [`LOG_JSON_ENV`].
pub fn use_json_log_format() -> bool {
    is_enabled(&std::env::var(LOG_JSON_ENV).unwrap_or_default())
}

fn is_enabled(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Text formatter that prepends the pipeline name to each event.
pub struct FormatWithPrefix {
    prefix: ColoredString,
    inner: Format,
}

impl FormatWithPrefix {
    pub fn new(pipeline_name: &str) -> Self {
        Self {
            prefix: format!("[{pipeline_name}]").cyan(),
            inner: Format::default(),
        }
    }
}

impl<S, N> FormatEvent<S, N> for FormatWithPrefix
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        write!(writer, "{} ", self.prefix)?;
        self.inner.format_event(ctx, writer, event)
    }
}

/// Installs the global subscriber, in JSON or text format.
pub fn init_pipeline_logging(
    pipeline_name: &str,
    env_filter: EnvFilter,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    if use_json_log_format() {
        tracing_subscriber::registry()
            .with(SpanFieldsLayer)
            .with(
                tracing_subscriber::fmt::layer()
                    .event_format(JsonPipelineFormat::new(pipeline_name))
                    .with_ansi(false),
            )
            .with(env_filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .event_format(FormatWithPrefix::new(pipeline_name)),
            )
            .with(env_filter)
            .try_init()
    }
}
