//! Trace sessions: the server-side source of spans rebuilt from trace headers.

use std::fmt;
use std::sync::Arc;

use crate::config::TraceSettings;
use crate::header::{self, TraceOptions};
use crate::span::{Reporter, Span};

/// Rebuilds spans from incoming trace headers.
///
/// Server-side interceptors are bound to a session so that the options policy for traces
/// arriving without usable identifiers stays in one place.
pub trait TraceSession: Send + Sync + 'static {
    /// Creates the server span for an incoming call carrying `header`.
    fn span_from_header(&self, default_name: &str, header: &str) -> Span;
}

impl<T: TraceSession + ?Sized> TraceSession for Arc<T> {
    fn span_from_header(&self, default_name: &str, header: &str) -> Span {
        (**self).span_from_header(default_name, header)
    }
}

/// Creates spans and reports them through a [`Reporter`].
#[derive(Clone)]
pub struct Tracer {
    reporter: Arc<dyn Reporter>,
    default_options: TraceOptions,
}

impl Tracer {
    /// Creates a tracer whose new traces carry `default_options`.
    pub fn new(reporter: impl Reporter, default_options: TraceOptions) -> Self {
        Self {
            reporter: Arc::new(reporter),
            default_options,
        }
    }

    /// Creates a tracer configured from `settings`.
    pub fn from_settings(settings: &TraceSettings, reporter: impl Reporter) -> Self {
        Self::new(reporter, TraceOptions::NONE.with_sampled(settings.sampled))
    }

    /// Starts the root span of a new trace.
    pub fn new_span(&self, name: &str) -> Span {
        Span::new_root(name, self.default_options, self.reporter.clone())
    }

    /// Options given to traces started by this tracer.
    pub fn default_options(&self) -> TraceOptions {
        self.default_options
    }
}

impl TraceSession for Tracer {
    /// Continues the trace named by `header`, or starts a new one when the header has no
    /// trace id. The caller's span id becomes the parent of the returned span.
    fn span_from_header(&self, default_name: &str, header: &str) -> Span {
        let ctx = header::decode(header);
        if !ctx.has_trace_id() {
            tracing::debug!(header, "trace header has no trace id, starting a new trace");
            return self.new_span(default_name);
        }

        Span::new_remote_child(
            default_name,
            &ctx.trace_id,
            ctx.span_id,
            ctx.options,
            self.reporter.clone(),
        )
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("default_options", &self.default_options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::NoopReporter;

    #[test]
    fn span_from_header_continues_the_trace() {
        let tracer = Tracer::new(NoopReporter, TraceOptions::NONE);
        let span = tracer.span_from_header("/pkg.Service/Method", "abc/42;o=1");

        assert_eq!(span.trace_id(), "abc");
        assert_eq!(span.parent_span_id(), 42);
        assert!(span.options().is_sampled());
        assert_eq!(span.name(), "/pkg.Service/Method");
        assert_ne!(span.span_id(), 42);
    }

    #[test]
    fn span_from_header_without_trace_id_starts_a_new_trace() {
        let tracer = Tracer::new(NoopReporter, TraceOptions::SAMPLED);
        let span = tracer.span_from_header("method", "garbage");

        assert_eq!(span.trace_id().len(), 32);
        assert_eq!(span.parent_span_id(), 0);
        assert_eq!(span.options(), TraceOptions::SAMPLED);
    }

    #[test]
    fn from_settings_sets_sampling() {
        let settings = TraceSettings {
            sampled: true,
            ..TraceSettings::default()
        };
        let tracer = Tracer::from_settings(&settings, NoopReporter);
        assert!(tracer.default_options().is_sampled());
        assert!(tracer.new_span("root").options().is_sampled());
    }
}
