use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::{Layer, Service};

use super::{start_client_span, start_server_span, Call, TracedFuture};
use crate::config::TraceSettings;
use crate::session::TraceSession;

/// Layer tracing outgoing unary calls.
///
/// Each call made under a context with an ambient span gets a child span named after the
/// method. The child is finished when the call's future completes or is dropped; an error
/// result is recorded on it as the `error` label.
#[derive(Clone, Copy, Debug)]
pub struct UnaryClientLayer {
    enabled: bool,
}

impl UnaryClientLayer {
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

impl Default for UnaryClientLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for UnaryClientLayer {
    type Service = UnaryClient<S>;

    fn layer(&self, inner: S) -> Self::Service {
        UnaryClient {
            inner,
            enabled: self.enabled,
        }
    }
}

/// Service produced by [`UnaryClientLayer`].
#[derive(Clone, Debug)]
pub struct UnaryClient<S> {
    inner: S,
    enabled: bool,
}

impl<S, M> Service<Call<M>> for UnaryClient<S>
where
    S: Service<Call<M>>,
    S::Error: fmt::Display,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = TracedFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: Call<M>) -> Self::Future {
        let (call, span) = if self.enabled {
            start_client_span(call)
        } else {
            (call, None)
        };

        TracedFuture::new(self.inner.call(call), span)
    }
}

/// Layer tracing incoming unary calls.
///
/// Calls carrying an `x-cloud-trace-context` header run their handler under a context that
/// holds the span rebuilt by the session. The span is finished once the handler returns.
pub struct UnaryServerLayer<T: ?Sized> {
    session: Arc<T>,
    enabled: bool,
}

impl<T: ?Sized> UnaryServerLayer<T> {
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

impl<T: ?Sized> Clone for UnaryServerLayer<T> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            enabled: self.enabled,
        }
    }
}

impl<S, T: ?Sized> Layer<S> for UnaryServerLayer<T> {
    type Service = UnaryServer<S, T>;

    fn layer(&self, inner: S) -> Self::Service {
        UnaryServer {
            inner,
            session: self.session.clone(),
            enabled: self.enabled,
        }
    }
}

/// Service produced by [`UnaryServerLayer`].
pub struct UnaryServer<S, T: ?Sized> {
    inner: S,
    session: Arc<T>,
    enabled: bool,
}

impl<S: Clone, T: ?Sized> Clone for UnaryServer<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            session: self.session.clone(),
            enabled: self.enabled,
        }
    }
}

impl<S, T, M> Service<Call<M>> for UnaryServer<S, T>
where
    S: Service<Call<M>>,
    S::Error: fmt::Display,
    T: TraceSession + ?Sized,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = TracedFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut call: Call<M>) -> Self::Future {
        let traced = if self.enabled {
            start_server_span(&*self.session, &call.context, &call.method)
        } else {
            None
        };

        let span = traced.map(|(context, span)| {
            call.context = context;
            span
        });

        TracedFuture::new(self.inner.call(call), span)
    }
}
