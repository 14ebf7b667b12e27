//! Streaming calls.
//!
//! A stream outlives the call that opened it, so its span is tied to events on the stream
//! rather than to a single return. Send and receive take `&self` and may run concurrently;
//! every trigger goes through [`Span::finish`], which reports only once.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tonic::Status;
use tower::{Layer, Service};

use super::{start_client_span, start_server_span, Call, SpanGuard, TracedFuture};
use crate::config::TraceSettings;
use crate::context::CallContext;
use crate::metadata::Metadata;
use crate::session::TraceSession;
use crate::span::Span;

/// Client side of an established stream, as provided by the transport.
pub trait ClientStream: Send + Sync {
    /// Messages sent to the server.
    type Request: Send;
    /// Messages received from the server.
    type Response: Send;

    /// Waits for the response headers.
    fn header(&self) -> impl Future<Output = Result<Metadata, Status>> + Send;

    /// Response trailers; empty until the stream has completed.
    fn trailer(&self) -> Metadata;

    /// Half-closes the sending side.
    fn close_send(&self) -> Result<(), Status>;

    /// Context the stream was opened under.
    fn context(&self) -> &CallContext;

    /// Sends one message.
    fn send_msg(&self, message: Self::Request) -> impl Future<Output = Result<(), Status>> + Send;

    /// Receives the next message; `Ok(None)` once the server has closed the stream.
    fn recv_msg(&self) -> impl Future<Output = Result<Option<Self::Response>, Status>> + Send;
}

/// Server side of an incoming stream, as provided by the transport.
pub trait ServerStream: Send + Sync {
    /// Messages received from the client.
    type Request: Send;
    /// Messages sent to the client.
    type Response: Send;

    /// Full method name of the call.
    fn method(&self) -> &str;

    /// Context of the incoming call.
    fn context(&self) -> &CallContext;

    /// Sets headers to be sent with the first message.
    fn set_header(&self, metadata: Metadata) -> Result<(), Status>;

    /// Sends headers immediately.
    fn send_header(&self, metadata: Metadata) -> impl Future<Output = Result<(), Status>> + Send;

    /// Sets trailers sent when the handler returns.
    fn set_trailer(&self, metadata: Metadata);

    /// Sends one message.
    fn send_msg(&self, message: Self::Response) -> impl Future<Output = Result<(), Status>> + Send;

    /// Receives the next message; `Ok(None)` once the client has half-closed.
    fn recv_msg(&self) -> impl Future<Output = Result<Option<Self::Request>, Status>> + Send;
}

/// Client stream whose span ends with the stream.
///
/// The span is finished by the first of: [`close_send`](ClientStream::close_send), a failed
/// send, a failed receive, the end of the response stream, or dropping the wrapper.
pub struct ClientStreamWrapper<St> {
    stream: St,
    span: Option<Span>,
}

impl<St> ClientStreamWrapper<St> {
    /// Wraps `stream`, binding `span` to it.
    pub fn new(stream: St, span: Option<Span>) -> Self {
        Self { stream, span }
    }

    /// The span bound to this stream, if the call is traced.
    pub fn span(&self) -> Option<&Span> {
        self.span.as_ref()
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &St {
        &self.stream
    }

    fn finish(&self) {
        if let Some(span) = &self.span {
            span.finish();
        }
    }

    fn fail(&self, error: &Status) {
        if let Some(span) = &self.span {
            span.set_label("error", error.to_string());
            span.finish();
        }
    }
}

impl<St: ClientStream> ClientStream for ClientStreamWrapper<St> {
    type Request = St::Request;
    type Response = St::Response;

    fn header(&self) -> impl Future<Output = Result<Metadata, Status>> + Send {
        self.stream.header()
    }

    fn trailer(&self) -> Metadata {
        self.stream.trailer()
    }

    fn close_send(&self) -> Result<(), Status> {
        self.finish();
        self.stream.close_send()
    }

    fn context(&self) -> &CallContext {
        self.stream.context()
    }

    fn send_msg(&self, message: Self::Request) -> impl Future<Output = Result<(), Status>> + Send {
        async move {
            let result = self.stream.send_msg(message).await;
            if let Err(error) = &result {
                self.fail(error);
            }
            result
        }
    }

    fn recv_msg(&self) -> impl Future<Output = Result<Option<Self::Response>, Status>> + Send {
        async move {
            let result = self.stream.recv_msg().await;
            match &result {
                Ok(Some(_)) => {}
                Ok(None) => self.finish(),
                Err(error) => self.fail(error),
            }
            result
        }
    }
}

impl<St> Drop for ClientStreamWrapper<St> {
    fn drop(&mut self) {
        self.finish();
    }
}

impl<St: fmt::Debug> fmt::Debug for ClientStreamWrapper<St> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStreamWrapper")
            .field("stream", &self.stream)
            .field("span", &self.span)
            .finish()
    }
}

/// Server stream carrying the span rebuilt from the call's trace header.
///
/// [`context`](ServerStream::context) returns a context holding the span. The span is
/// finished by the first failed send or receive, by the handler returning, or by dropping
/// the wrapper.
pub struct ServerStreamWrapper<St> {
    stream: St,
    span: Span,
    context: CallContext,
}

impl<St> ServerStreamWrapper<St> {
    /// Wraps `stream`; `context` must be the stream's context carrying `span`.
    pub fn new(stream: St, span: Span, context: CallContext) -> Self {
        Self {
            stream,
            span,
            context,
        }
    }

    /// The span bound to this stream.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &St {
        &self.stream
    }

    fn fail(&self, error: &Status) {
        self.span.set_label("error", error.to_string());
        self.span.finish();
    }
}

impl<St: ServerStream> ServerStream for ServerStreamWrapper<St> {
    type Request = St::Request;
    type Response = St::Response;

    fn method(&self) -> &str {
        self.stream.method()
    }

    fn context(&self) -> &CallContext {
        &self.context
    }

    fn set_header(&self, metadata: Metadata) -> Result<(), Status> {
        self.stream.set_header(metadata)
    }

    fn send_header(&self, metadata: Metadata) -> impl Future<Output = Result<(), Status>> + Send {
        self.stream.send_header(metadata)
    }

    fn set_trailer(&self, metadata: Metadata) {
        self.stream.set_trailer(metadata)
    }

    fn send_msg(&self, message: Self::Response) -> impl Future<Output = Result<(), Status>> + Send {
        async move {
            let result = self.stream.send_msg(message).await;
            if let Err(error) = &result {
                self.fail(error);
            }
            result
        }
    }

    fn recv_msg(&self) -> impl Future<Output = Result<Option<Self::Request>, Status>> + Send {
        async move {
            let result = self.stream.recv_msg().await;
            if let Err(error) = &result {
                self.fail(error);
            }
            result
        }
    }
}

impl<St> Drop for ServerStreamWrapper<St> {
    fn drop(&mut self) {
        self.span.finish();
    }
}

impl<St: fmt::Debug> fmt::Debug for ServerStreamWrapper<St> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerStreamWrapper")
            .field("stream", &self.stream)
            .field("span", &self.span)
            .finish_non_exhaustive()
    }
}

/// Stream handed to a handler behind [`StreamServerLayer`].
///
/// Untraced calls get their original stream back, unwrapped.
#[derive(Debug)]
pub enum ServerCallStream<St> {
    /// The call carried no trace header.
    Passthrough(St),
    /// The call is traced.
    Traced(ServerStreamWrapper<St>),
}

impl<St> ServerCallStream<St> {
    /// The span of a traced call.
    pub fn span(&self) -> Option<&Span> {
        match self {
            ServerCallStream::Passthrough(_) => None,
            ServerCallStream::Traced(wrapper) => Some(wrapper.span()),
        }
    }

    /// The transport's stream.
    pub fn get_ref(&self) -> &St {
        match self {
            ServerCallStream::Passthrough(stream) => stream,
            ServerCallStream::Traced(wrapper) => wrapper.get_ref(),
        }
    }
}

impl<St: ServerStream> ServerStream for ServerCallStream<St> {
    type Request = St::Request;
    type Response = St::Response;

    fn method(&self) -> &str {
        match self {
            ServerCallStream::Passthrough(stream) => stream.method(),
            ServerCallStream::Traced(wrapper) => wrapper.method(),
        }
    }

    fn context(&self) -> &CallContext {
        match self {
            ServerCallStream::Passthrough(stream) => stream.context(),
            ServerCallStream::Traced(wrapper) => wrapper.context(),
        }
    }

    fn set_header(&self, metadata: Metadata) -> Result<(), Status> {
        match self {
            ServerCallStream::Passthrough(stream) => stream.set_header(metadata),
            ServerCallStream::Traced(wrapper) => wrapper.set_header(metadata),
        }
    }

    fn send_header(&self, metadata: Metadata) -> impl Future<Output = Result<(), Status>> + Send {
        async move {
            match self {
                ServerCallStream::Passthrough(stream) => stream.send_header(metadata).await,
                ServerCallStream::Traced(wrapper) => wrapper.send_header(metadata).await,
            }
        }
    }

    fn set_trailer(&self, metadata: Metadata) {
        match self {
            ServerCallStream::Passthrough(stream) => stream.set_trailer(metadata),
            ServerCallStream::Traced(wrapper) => wrapper.set_trailer(metadata),
        }
    }

    fn send_msg(&self, message: Self::Response) -> impl Future<Output = Result<(), Status>> + Send {
        async move {
            match self {
                ServerCallStream::Passthrough(stream) => stream.send_msg(message).await,
                ServerCallStream::Traced(wrapper) => wrapper.send_msg(message).await,
            }
        }
    }

    fn recv_msg(&self) -> impl Future<Output = Result<Option<Self::Request>, Status>> + Send {
        async move {
            match self {
                ServerCallStream::Passthrough(stream) => stream.recv_msg().await,
                ServerCallStream::Traced(wrapper) => wrapper.recv_msg().await,
            }
        }
    }
}

/// Layer tracing outgoing streams.
///
/// The inner service opens the stream and resolves to the transport's [`ClientStream`];
/// this layer resolves to a [`ClientStreamWrapper`] around it. If opening fails the span
/// is finished at once and the error returned; no wrapper is created.
#[derive(Clone, Copy, Debug)]
pub struct StreamClientLayer {
    enabled: bool,
}

impl StreamClientLayer {
    /// Creates an enabled layer.
    pub fn new() -> Self {
        Self { enabled: true }
    }

    /// Creates a layer enabled according to [`TraceSettings::client_enabled`].
    pub fn from_settings(settings: &TraceSettings) -> Self {
        Self {
            enabled: settings.client_enabled,
        }
    }
}

impl Default for StreamClientLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for StreamClientLayer {
    type Service = StreamClient<S>;

    fn layer(&self, inner: S) -> Self::Service {
        StreamClient {
            inner,
            enabled: self.enabled,
        }
    }
}

/// Service produced by [`StreamClientLayer`].
#[derive(Clone, Debug)]
pub struct StreamClient<S> {
    inner: S,
    enabled: bool,
}

impl<S, M> Service<Call<M>> for StreamClient<S>
where
    S: Service<Call<M>>,
    S::Error: fmt::Display,
{
    type Response = ClientStreamWrapper<S::Response>;
    type Error = S::Error;
    type Future = StreamClientFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: Call<M>) -> Self::Future {
        let (call, span) = if self.enabled {
            start_client_span(call)
        } else {
            (call, None)
        };

        StreamClientFuture {
            inner: self.inner.call(call),
            guard: SpanGuard::new(span),
        }
    }
}

pin_project_lite::pin_project! {
    /// Response future of [`StreamClient`].
    ///
    /// Hands the span to the [`ClientStreamWrapper`] once the stream is open. Until then
    /// the future owns it: a failed or abandoned establishment finishes it.
    pub struct StreamClientFuture<F> {
        #[pin]
        inner: F,
        guard: SpanGuard,
    }
}

impl<F, St, E> Future for StreamClientFuture<F>
where
    F: Future<Output = Result<St, E>>,
    E: fmt::Display,
{
    type Output = Result<ClientStreamWrapper<St>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match ready!(this.inner.poll(cx)) {
            Ok(stream) => Poll::Ready(Ok(ClientStreamWrapper::new(stream, this.guard.take()))),
            Err(error) => {
                this.guard.record_error(&error);
                if let Some(span) = this.guard.take() {
                    tracing::debug!(trace_id = %span.trace_id(), "stream establishment failed");
                    span.finish();
                }
                Poll::Ready(Err(error))
            }
        }
    }
}

/// Layer tracing incoming streams.
///
/// The inner service is the stream handler. It receives a [`ServerCallStream`]: the
/// original stream when the call has no trace header, otherwise a [`ServerStreamWrapper`]
/// whose context carries the span rebuilt by the session. The span is finished when the
/// handler returns if no stream error finished it first.
pub struct StreamServerLayer<T: ?Sized> {
    session: Arc<T>,
    enabled: bool,
}

impl<T: ?Sized> StreamServerLayer<T> {
    /// Creates an enabled layer bound to `session`.
    pub fn new(session: Arc<T>) -> Self {
        Self {
            session,
            enabled: true,
        }
    }

    /// Creates a layer enabled according to [`TraceSettings::server_enabled`].
    pub fn from_settings(session: Arc<T>, settings: &TraceSettings) -> Self {
        Self {
            session,
            enabled: settings.server_enabled,
        }
    }
}

impl<T: ?Sized> Clone for StreamServerLayer<T> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            enabled: self.enabled,
        }
    }
}

impl<S, T: ?Sized> Layer<S> for StreamServerLayer<T> {
    type Service = StreamServer<S, T>;

    fn layer(&self, inner: S) -> Self::Service {
        StreamServer {
            inner,
            session: self.session.clone(),
            enabled: self.enabled,
        }
    }
}

/// Service produced by [`StreamServerLayer`].
pub struct StreamServer<S, T: ?Sized> {
    inner: S,
    session: Arc<T>,
    enabled: bool,
}

impl<S: Clone, T: ?Sized> Clone for StreamServer<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            session: self.session.clone(),
            enabled: self.enabled,
        }
    }
}

impl<S, T, St> Service<St> for StreamServer<S, T>
where
    S: Service<ServerCallStream<St>>,
    S::Error: fmt::Display,
    T: TraceSession + ?Sized,
    St: ServerStream,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = TracedFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, stream: St) -> Self::Future {
        let traced = if self.enabled {
            start_server_span(&*self.session, stream.context(), stream.method())
        } else {
            None
        };

        let (stream, span) = match traced {
            Some((context, span)) => (
                ServerCallStream::Traced(ServerStreamWrapper::new(stream, span.clone(), context)),
                Some(span),
            ),
            None => (ServerCallStream::Passthrough(stream), None),
        };

        TracedFuture::new(self.inner.call(stream), span)
    }
}
