//! Tower layers that trace RPC calls.
//!
//! Four layers are provided, one per interceptor kind:
//!
//! | Layer | Wraps | Span lifetime |
//! |---|---|---|
//! | [`UnaryClientLayer`] | the invoker of an outgoing unary call | until the call returns |
//! | [`UnaryServerLayer`] | the handler of an incoming unary call | until the handler returns |
//! | [`StreamClientLayer`] | the opener of an outgoing stream | until half-close, a failed send or receive, or drop |
//! | [`StreamServerLayer`] | the handler of an incoming stream | until the first stream error or the handler returns |
//!
//! Client layers derive a child of the ambient span of the [`CallContext`] and send its
//! parent's identifiers in the `x-cloud-trace-context` header. Server layers rebuild a span
//! from that header through a [`TraceSession`] and expose it through the handler's context.
//! Calls without an ambient span, or without a trace header, pass through untouched.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use crate::context::CallContext;
use crate::header::{self, TRACE_HEADER};
use crate::metadata::Metadata;
use crate::session::TraceSession;
use crate::span::Span;

mod stream;
mod unary;

pub use stream::{
    ClientStream, ClientStreamWrapper, ServerCallStream, ServerStream, ServerStreamWrapper,
    StreamClient, StreamClientFuture, StreamClientLayer, StreamServer, StreamServerLayer,
};
pub use unary::{UnaryClient, UnaryClientLayer, UnaryServer, UnaryServerLayer};

/// One RPC call as seen by an interceptor.
///
/// Unary calls carry their request message; stream establishment carries `()`.
#[derive(Clone, Debug)]
pub struct Call<M = ()> {
    /// Context the call runs under.
    pub context: CallContext,
    /// Full method name, e.g. `/helloworld.Greeter/SayHello`.
    pub method: String,
    /// Request message.
    pub message: M,
}

impl<M> Call<M> {
    /// Creates a call.
    pub fn new(context: CallContext, method: impl Into<String>, message: M) -> Self {
        Self {
            context,
            method: method.into(),
            message,
        }
    }
}

impl Call<()> {
    /// Creates a stream establishment call.
    pub fn stream(context: CallContext, method: impl Into<String>) -> Self {
        Self::new(context, method, ())
    }
}

/// Owns a span and finishes it when dropped.
///
/// Futures hold one of these so that a span is finished on every exit: completion, error,
/// cancellation by drop, or unwinding.
#[derive(Debug)]
pub(crate) struct SpanGuard(Option<Span>);

impl SpanGuard {
    pub(crate) fn new(span: Option<Span>) -> Self {
        Self(span)
    }

    /// Records `error` on the span, if there is one.
    pub(crate) fn record_error(&self, error: &dyn fmt::Display) {
        if let Some(span) = &self.0 {
            span.set_label("error", error.to_string());
        }
    }

    /// Hands the span over without finishing it.
    pub(crate) fn take(&mut self) -> Option<Span> {
        self.0.take()
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if let Some(span) = self.0.take() {
            span.finish();
        }
    }
}

pin_project_lite::pin_project! {
    /// Response future of the unary layers and of [`StreamServer`].
    ///
    /// Finishes the call's span when the inner future resolves or when it is dropped. An
    /// error result is recorded on the span as the `error` label first.
    pub struct TracedFuture<F> {
        #[pin]
        inner: F,
        guard: SpanGuard,
    }
}

impl<F> TracedFuture<F> {
    pub(crate) fn new(inner: F, span: Option<Span>) -> Self {
        Self {
            inner,
            guard: SpanGuard::new(span),
        }
    }
}

impl<F, R, E> Future for TracedFuture<F>
where
    F: Future<Output = Result<R, E>>,
    E: fmt::Display,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = ready!(this.inner.poll(cx));
        if let Err(error) = &result {
            this.guard.record_error(error);
        }
        if let Some(span) = this.guard.take() {
            span.finish();
        }
        Poll::Ready(result)
    }
}

/// Derives the child span of an outgoing call and installs its trace header.
///
/// Returns the call unchanged and no span when the context has no ambient span.
pub(crate) fn start_client_span<M>(mut call: Call<M>) -> (Call<M>, Option<Span>) {
    let Some(parent) = call.context.span() else {
        tracing::trace!(method = %call.method, "no ambient span, call is not traced");
        return (call, None);
    };

    let child = parent.new_child(&call.method);
    // The caller's span id goes on the wire: the remote span becomes its child.
    let value = header::encode(child.trace_id(), child.parent_span_id(), child.options());

    let metadata = match call.context.outgoing_metadata() {
        Some(metadata) => metadata.with_value(TRACE_HEADER, value),
        None => Metadata::pairs([(TRACE_HEADER, value)]),
    };
    call.context = call
        .context
        .with_span(child.clone())
        .with_outgoing_metadata(metadata);

    tracing::debug!(
        method = %call.method,
        trace_id = %child.trace_id(),
        span_id = child.span_id(),
        "tracing outgoing call"
    );
    (call, Some(child))
}

/// Rebuilds the span of an incoming call from its trace header.
///
/// Returns a context carrying the span, or `None` when the call has no trace header.
pub(crate) fn start_server_span<T>(
    session: &T,
    context: &CallContext,
    method: &str,
) -> Option<(CallContext, Span)>
where
    T: TraceSession + ?Sized,
{
    let Some(value) = context
        .incoming_metadata()
        .and_then(|metadata| metadata.get_joined(TRACE_HEADER))
    else {
        tracing::trace!(method, "no trace header, call is not traced");
        return None;
    };

    let span = session.span_from_header(method, &value);
    tracing::debug!(
        method,
        trace_id = %span.trace_id(),
        parent_span_id = span.parent_span_id(),
        "tracing incoming call"
    );
    Some((context.with_span(span.clone()), span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::TraceOptions;
    use crate::session::Tracer;
    use crate::span::NoopReporter;

    fn tracer() -> Tracer {
        Tracer::new(NoopReporter, TraceOptions::SAMPLED)
    }

    #[test]
    fn client_span_header_names_the_callers_span() {
        let root = tracer().new_span("root");
        let call = Call::new(CallContext::new().with_span(root.clone()), "/svc/M", 1u8);

        let (call, child) = start_client_span(call);
        let child = child.expect("ambient span present");

        assert_eq!(child.parent_span_id(), root.span_id());
        assert!(call.context.span().is_some_and(|s| s.ptr_eq(&child)));

        let value = call
            .context
            .outgoing_metadata()
            .and_then(|md| md.get(TRACE_HEADER))
            .expect("trace header installed");
        assert_eq!(value.len(), 1);
        let decoded = header::decode(&value[0]);
        assert_eq!(decoded.trace_id, root.trace_id());
        assert_eq!(decoded.span_id, root.span_id());
        assert!(decoded.options.is_sampled());
    }

    #[test]
    fn client_span_replaces_an_existing_header_on_a_copy() {
        let root = tracer().new_span("root");
        let original = Metadata::pairs([(TRACE_HEADER, "stale/1;o=0"), ("authorization", "t")]);
        let context = CallContext::new()
            .with_span(root)
            .with_outgoing_metadata(original.clone());

        let (call, _child) = start_client_span(Call::stream(context.clone(), "/svc/M"));

        assert_eq!(context.outgoing_metadata(), Some(&original));
        assert_eq!(original.get_joined(TRACE_HEADER).as_deref(), Some("stale/1;o=0"));
        let outgoing = call.context.outgoing_metadata().expect("outgoing metadata");
        assert_eq!(outgoing.get(TRACE_HEADER).map(<[String]>::len), Some(1));
        assert_ne!(outgoing.get_joined(TRACE_HEADER).as_deref(), Some("stale/1;o=0"));
        assert_eq!(outgoing.get_joined("authorization").as_deref(), Some("t"));
    }

    #[test]
    fn client_span_without_ambient_span() {
        let (call, span) = start_client_span(Call::stream(CallContext::new(), "/svc/M"));
        assert!(span.is_none());
        assert!(call.context.outgoing_metadata().is_none());
    }

    #[test]
    fn server_span_joins_split_header_values() {
        let context = CallContext::new()
            .with_incoming_metadata(Metadata::pairs([(TRACE_HEADER, "abc/4"), (TRACE_HEADER, "2;o=1")]));

        let (context, span) =
            start_server_span(&tracer(), &context, "/svc/M").expect("header present");

        assert_eq!(span.parent_span_id(), 42);
        assert_eq!(span.trace_id(), "abc");
        assert!(context.span().is_some_and(|s| s.ptr_eq(&span)));
    }

    #[test]
    fn server_span_without_header() {
        assert!(start_server_span(&tracer(), &CallContext::new(), "/svc/M").is_none());
    }

    #[test]
    fn guard_finishes_on_drop_unless_disarmed() {
        let span = tracer().new_span("root");
        drop(SpanGuard::new(Some(span.clone())));
        assert!(span.is_finished());

        let span = tracer().new_span("root");
        let kept = SpanGuard::new(Some(span.clone())).take();
        assert!(!span.is_finished());
        assert!(kept.is_some());
    }
}
