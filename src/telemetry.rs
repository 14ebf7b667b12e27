//! Logging and span export.
//!
//! [`init`] installs the process-wide `tracing` subscriber (console output, plus an
//! OpenTelemetry log bridge when a log endpoint is configured) and, when a trace endpoint is
//! configured, an OTLP tracer provider. [`OtelReporter`] feeds finished RPC spans into
//! OpenTelemetry so they are exported through that provider.

use std::borrow::Cow;

use doku::Document;
use opentelemetry::trace::{
    Span as _, SpanContext, SpanId, Status, TraceContextExt as _, TraceFlags, TraceId, TraceState,
    Tracer,
};
use opentelemetry::{global, Context, KeyValue};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{ExporterBuildError, LogExporter, SpanExporter, WithExportConfig};
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::span::{FinishedSpan, Reporter};
use crate::ServiceInfo;

/// Instrumentation scope under which RPC spans are exported.
const INSTRUMENTATION_SCOPE: &str = env!("CARGO_PKG_NAME");

/// Telemetry initialization errors.
#[derive(Debug, Snafu)]
pub enum Error {
    /// The OTLP log exporter could not be built.
    #[snafu(display("Could not initialize logging: {source}"))]
    InitLog {
        /// The exporter error
        source: ExporterBuildError,
    },

    /// The OTLP span exporter could not be built.
    #[snafu(display("Could not initialize tracing: {source}"))]
    InitTrace {
        /// The exporter error
        source: ExporterBuildError,
    },

    /// A log level directive could not be parsed.
    #[snafu(display("Invalid log filter {directives:?}: {source}"))]
    InvalidFilter {
        /// The directives as configured
        directives: String,
        /// The parse error
        source: tracing_subscriber::filter::ParseError,
    },

    /// Another global subscriber is already installed.
    #[snafu(display("Could not install the log subscriber: {source}"))]
    InstallSubscriber {
        /// The subscriber error
        source: tracing_subscriber::util::TryInitError,
    },
}

/// Log output settings.
#[derive(Debug, Default, Serialize, Deserialize, Document)]
#[serde(default)]
pub struct LogSettings {
    /// Filter for console output
    #[doku(example = "info,grpc_trace_context=debug")]
    pub console_level: String,

    /// Filter for logs exported over OTLP
    #[doku(example = "warn,grpc_trace_context=info")]
    pub otel_level: String,

    /// OTLP endpoint for logs; logs stay local when unset
    #[doku(example = "http://localhost:4317")]
    pub endpoint: Option<String>,
}

/// Span export settings.
#[derive(Debug, Default, Serialize, Deserialize, Document)]
#[serde(default)]
pub struct TraceExportSettings {
    /// OTLP endpoint for finished spans; spans are not exported when unset
    #[doku(example = "http://localhost:4317")]
    pub endpoint: Option<String>,
}

/// Telemetry settings.
#[derive(Debug, Default, Serialize, Deserialize, Document)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Span export
    pub trace: TraceExportSettings,

    /// Logging
    pub log: LogSettings,
}

/// Keeps the installed providers alive; dropping it flushes and shuts them down.
pub struct Telemetry {
    tracer_provider: Option<SdkTracerProvider>,
    logger_provider: SdkLoggerProvider,
}

impl Telemetry {
    /// Returns `true` if finished spans are exported.
    pub fn exports_spans(&self) -> bool {
        self.tracer_provider.is_some()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(tracer_provider) = self.tracer_provider.take() {
            if let Err(err) = tracer_provider.shutdown() {
                eprintln!("Error shutting down Telemetry tracer provider: {err}");
            }
        }
        if let Err(err) = self.logger_provider.shutdown() {
            eprintln!("Error shutting down Telemetry logger provider: {err}");
        }
    }
}

fn resource(service_info: &ServiceInfo) -> Resource {
    Resource::builder()
        .with_attribute(KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            service_info.name_in_telemetry.clone(),
        ))
        .with_attribute(KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            service_info.version,
        ))
        .build()
}

fn init_traces(
    service_info: &ServiceInfo,
    settings: &TraceExportSettings,
) -> Result<Option<SdkTracerProvider>, ExporterBuildError> {
    let Some(endpoint) = &settings.endpoint else {
        return Ok(None);
    };

    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    Ok(Some(
        SdkTracerProvider::builder()
            .with_resource(resource(service_info))
            .with_batch_exporter(exporter)
            .build(),
    ))
}

fn filter(directives: &str) -> Result<EnvFilter, Error> {
    EnvFilter::try_new(directives).context(InvalidFilterSnafu { directives })
}

fn init_logs(service_info: &ServiceInfo, settings: &LogSettings) -> Result<SdkLoggerProvider, Error> {
    let builder = SdkLoggerProvider::builder();
    let builder = match &settings.endpoint {
        Some(endpoint) => {
            let exporter = LogExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()
                .context(InitLogSnafu)?;

            builder
                .with_resource(resource(service_info))
                .with_batch_exporter(exporter)
        }
        None => builder,
    };
    let logger_provider = builder.build();

    let otel_layer = match &settings.endpoint {
        Some(_) => {
            // The exporter's own transport (tonic, h2, hyper) must not feed back into it.
            let directives = format!(
                "{},hyper=off,opentelemetry=off,tonic=off,h2=off,reqwest=off",
                settings.otel_level
            );
            let layer =
                OpenTelemetryTracingBridge::new(&logger_provider).with_filter(filter(&directives)?);
            Some(layer)
        }
        None => None,
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_thread_names(true)
        .with_filter(filter(&settings.console_level)?);

    tracing_subscriber::registry()
        .with(otel_layer)
        .with(fmt_layer)
        .try_init()
        .context(InstallSubscriberSnafu)?;

    Ok(logger_provider)
}

/// Installs logging and, if configured, span export.
///
/// When a trace endpoint is set the OTLP tracer provider becomes the global provider, which
/// [`OtelReporter::global`] reports into.
///
/// # Errors
/// Fails if an exporter cannot be built, a filter does not parse, or a global subscriber is
/// already installed.
pub fn init(service_info: &ServiceInfo, settings: &TelemetrySettings) -> Result<Telemetry, Error> {
    let logger_provider = init_logs(service_info, &settings.log)?;

    let tracer_provider = init_traces(service_info, &settings.trace).context(InitTraceSnafu)?;
    if let Some(tracer_provider) = &tracer_provider {
        global::set_tracer_provider(tracer_provider.clone());
    }

    tracing::debug!(
        service = service_info.name,
        exports_spans = tracer_provider.is_some(),
        "telemetry initialized"
    );

    Ok(Telemetry {
        tracer_provider,
        logger_provider,
    })
}

/// Reporter that re-creates finished spans on an OpenTelemetry tracer.
///
/// Each span keeps its trace id, span id, parent span id and timestamps; its labels become
/// attributes, and an `error` label sets an error status. Trace ids that are not
/// hexadecimal cannot be represented; such spans start a trace of their own.
#[derive(Debug)]
pub struct OtelReporter<T = global::BoxedTracer> {
    tracer: T,
}

impl OtelReporter {
    /// Reports through the global tracer provider.
    pub fn global() -> Self {
        Self::new(global::tracer(INSTRUMENTATION_SCOPE))
    }
}

impl<T> OtelReporter<T> {
    /// Reports through `tracer`.
    pub fn new(tracer: T) -> Self {
        Self { tracer }
    }
}

impl<T> Reporter for OtelReporter<T>
where
    T: Tracer + Send + Sync + 'static,
{
    fn report(&self, span: FinishedSpan) {
        let trace_id = TraceId::from_hex(&span.trace_id).unwrap_or(TraceId::INVALID);
        let flags = if span.options.is_sampled() {
            TraceFlags::SAMPLED
        } else {
            TraceFlags::default()
        };

        let parent = if trace_id != TraceId::INVALID && span.parent_span_id != 0 {
            Context::new().with_remote_span_context(SpanContext::new(
                trace_id,
                SpanId::from_bytes(span.parent_span_id.to_be_bytes()),
                flags,
                true,
                TraceState::default(),
            ))
        } else {
            Context::new()
        };

        let error = span.labels.get("error").cloned();
        let attributes: Vec<KeyValue> = span
            .labels
            .into_iter()
            .map(|(key, value)| KeyValue::new(key, value))
            .collect();

        let mut builder = self
            .tracer
            .span_builder(Cow::Owned(span.name))
            .with_span_id(SpanId::from_bytes(span.span_id.to_be_bytes()))
            .with_start_time(span.start)
            .with_attributes(attributes);
        if trace_id != TraceId::INVALID {
            builder = builder.with_trace_id(trace_id);
        }
        let mut otel_span = builder.start_with_context(&self.tracer, &parent);

        if let Some(error) = error {
            otel_span.set_status(Status::error(error));
        }
        otel_span.end_with_timestamp(span.end);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::{Duration, SystemTime};

    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::trace::InMemorySpanExporter;

    use super::*;
    use crate::header::TraceOptions;

    fn finished(trace_id: &str, parent_span_id: u64, labels: &[(&str, &str)]) -> FinishedSpan {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        FinishedSpan {
            name: "/svc/Method".to_owned(),
            trace_id: trace_id.to_owned(),
            span_id: 0x1234,
            parent_span_id,
            options: TraceOptions::SAMPLED,
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect::<BTreeMap<_, _>>(),
            start,
            end: start + Duration::from_millis(5),
        }
    }

    #[test]
    fn otel_reporter_keeps_ids_and_timestamps() {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let reporter = OtelReporter::new(provider.tracer("test"));

        let span = finished("4bf92f3577b34da6a3ce929d0e0e4736", 42, &[("error", "boom")]);
        let (start, end) = (span.start, span.end);
        reporter.report(span);

        let spans = exporter.get_finished_spans().expect("spans exported");
        assert_eq!(spans.len(), 1);
        let exported = &spans[0];
        assert_eq!(exported.name, "/svc/Method");
        assert_eq!(
            exported.span_context.trace_id(),
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").expect("valid hex")
        );
        assert_eq!(exported.span_context.span_id(), SpanId::from_bytes(0x1234u64.to_be_bytes()));
        assert_eq!(exported.parent_span_id, SpanId::from_bytes(42u64.to_be_bytes()));
        assert_eq!(exported.start_time, start);
        assert_eq!(exported.end_time, end);
        assert!(matches!(exported.status, Status::Error { .. }));
    }

    #[test]
    fn otel_reporter_accepts_foreign_trace_ids() {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let reporter = OtelReporter::new(provider.tracer("test"));

        reporter.report(finished("not-a-hex-trace-id", 42, &[]));

        let spans = exporter.get_finished_spans().expect("spans exported");
        assert_eq!(spans.len(), 1);
        assert_ne!(spans[0].span_context.trace_id(), TraceId::INVALID);
        assert_eq!(spans[0].parent_span_id, SpanId::INVALID);
    }

    #[test]
    fn filter_rejects_bad_directives() {
        assert!(filter("info,grpc_trace_context=debug").is_ok());
        assert!(matches!(
            filter("grpc_trace_context=loud"),
            Err(Error::InvalidFilter { .. })
        ));
    }
}
