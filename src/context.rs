//! Call-scoped context.
//!
//! [`CallContext`] is an immutable carrier of the values that travel with one call: the
//! ambient span and the outgoing and incoming metadata bags. Deriving a context never
//! changes the one it was derived from.

use crate::metadata::Metadata;
use crate::span::Span;

/// Ambient values of a single RPC call.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    span: Option<Span>,
    outgoing: Option<Metadata>,
    incoming: Option<Metadata>,
}

impl CallContext {
    /// An empty context: no span, no metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// The ambient span, if any.
    pub fn span(&self) -> Option<&Span> {
        self.span.as_ref()
    }

    /// Derives a context carrying `span`.
    pub fn with_span(&self, span: Span) -> Self {
        Self {
            span: Some(span),
            ..self.clone()
        }
    }

    /// Metadata to be sent with an outgoing call.
    pub fn outgoing_metadata(&self) -> Option<&Metadata> {
        self.outgoing.as_ref()
    }

    /// Derives a context whose outgoing metadata is `metadata`.
    pub fn with_outgoing_metadata(&self, metadata: Metadata) -> Self {
        Self {
            outgoing: Some(metadata),
            ..self.clone()
        }
    }

    /// Metadata received with an incoming call.
    pub fn incoming_metadata(&self) -> Option<&Metadata> {
        self.incoming.as_ref()
    }

    /// Derives a context whose incoming metadata is `metadata`.
    pub fn with_incoming_metadata(&self, metadata: Metadata) -> Self {
        Self {
            incoming: Some(metadata),
            ..self.clone()
        }
    }

    /// Builds the server-side context of a tonic request: its metadata becomes the
    /// incoming bag, and a [`Span`] stored in its extensions becomes the ambient span.
    pub fn from_request<T>(request: &tonic::Request<T>) -> Self {
        Self {
            span: request.extensions().get::<Span>().cloned(),
            outgoing: None,
            incoming: Some(Metadata::from(request.metadata())),
        }
    }

    /// Builds a tonic request for an outgoing call made under this context.
    ///
    /// The outgoing bag becomes the request metadata and the ambient span is stored in the
    /// request extensions.
    pub fn into_request<T>(self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        if let Some(metadata) = &self.outgoing {
            *request.metadata_mut() = metadata.to_metadata_map();
        }
        if let Some(span) = self.span {
            request.extensions_mut().insert(span);
        }
        request
    }
}

/// The ambient span of `ctx`.
pub fn span_from_context(ctx: &CallContext) -> Option<&Span> {
    ctx.span()
}

/// Derives a context from `ctx` carrying `span`.
pub fn context_with_span(ctx: &CallContext, span: Span) -> CallContext {
    ctx.with_span(span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::TraceOptions;
    use crate::session::Tracer;
    use crate::span::NoopReporter;

    #[test]
    fn with_span_does_not_touch_the_parent_context() {
        let tracer = Tracer::new(NoopReporter, TraceOptions::NONE);
        let base = CallContext::new().with_outgoing_metadata(Metadata::pairs([("k", "v")]));

        let derived = context_with_span(&base, tracer.new_span("root"));

        assert!(span_from_context(&base).is_none());
        assert!(span_from_context(&derived).is_some());
        assert_eq!(derived.outgoing_metadata(), base.outgoing_metadata());
    }

    #[test]
    fn into_request_carries_metadata_and_span() {
        let tracer = Tracer::new(NoopReporter, TraceOptions::NONE);
        let span = tracer.new_span("root");
        let ctx = CallContext::new()
            .with_span(span.clone())
            .with_outgoing_metadata(Metadata::pairs([("x-cloud-trace-context", "abc/1;o=0")]));

        let request = ctx.into_request(());

        assert_eq!(
            request
                .metadata()
                .get("x-cloud-trace-context")
                .and_then(|v| v.to_str().ok()),
            Some("abc/1;o=0")
        );

        let server_ctx = CallContext::from_request(&request);
        assert!(server_ctx.span().is_some_and(|s| s.ptr_eq(&span)));
        assert_eq!(
            server_ctx
                .incoming_metadata()
                .and_then(|md| md.get_joined("x-cloud-trace-context"))
                .as_deref(),
            Some("abc/1;o=0")
        );
        assert!(server_ctx.outgoing_metadata().is_none());
    }
}
