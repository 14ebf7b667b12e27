/*!
Trace-context propagation for gRPC calls.

Every traced call carries an `x-cloud-trace-context` header of the form
`<trace-id>/<span-id>;o=<options>`. Clients derive a child of the span in their
[`CallContext`] and send the caller's identifiers in that header; servers rebuild a span from it
and hand the handler a context carrying that span. Spans are finished exactly once, however
the call ends, and sampled spans are passed to a [`Reporter`].

The interceptors are [tower](https://docs.rs/tower) layers:

 * [`UnaryClientLayer`] and [`UnaryServerLayer`] wrap services taking a [`Call`]
 * [`StreamClientLayer`] wraps the service opening an outgoing [`ClientStream`]
 * [`StreamServerLayer`] wraps the handler of an incoming [`ServerStream`]

It also provides:
 * config file generation and loading (via Doku & Figment)
 * environment variable overrides for configs (via Figment)
 * logging and span export (via tracing & opentelemetry)

### Tutorial

1. Build a [`Tracer`] and start a span for the work at hand:

```rust
use grpc_trace_context::{CallContext, LogReporter, TraceOptions, Tracer};

let tracer = Tracer::new(LogReporter, TraceOptions::SAMPLED);
let root = tracer.new_span("handle-order");
let context = CallContext::new().with_span(root.clone());
# assert!(context.span().is_some());
```

2. Wrap the outgoing call. The layer adds the trace header to the call's outgoing metadata:

```rust
# use grpc_trace_context::{Call, CallContext, NoopReporter, TraceOptions, Tracer, TRACE_HEADER};
use grpc_trace_context::UnaryClientLayer;
use tower::{service_fn, ServiceBuilder, ServiceExt as _};

# #[tokio::main(flavor = "current_thread")]
# async fn main() -> Result<(), tonic::Status> {
# let tracer = Tracer::new(NoopReporter, TraceOptions::SAMPLED);
# let context = CallContext::new().with_span(tracer.new_span("handle-order"));
let client = ServiceBuilder::new()
    .layer(UnaryClientLayer::new())
    .service(service_fn(|call: Call<&str>| async move {
        // Hand `call.context.into_request(call.message)` to the transport.
        let header = call.context.outgoing_metadata().and_then(|md| md.get_joined(TRACE_HEADER));
        Ok::<_, tonic::Status>(header)
    }));

let header = client.oneshot(Call::new(context, "/shop.Orders/Place", "order")).await?;
assert!(header.is_some());
# Ok(())
# }
```

3. On the server, rebuild the span from the incoming header:

```rust
# use std::sync::Arc;
# use grpc_trace_context::{Call, CallContext, Metadata, NoopReporter, TraceOptions, Tracer, TRACE_HEADER};
use grpc_trace_context::UnaryServerLayer;
use tower::{service_fn, ServiceBuilder, ServiceExt as _};

# #[tokio::main(flavor = "current_thread")]
# async fn main() -> Result<(), tonic::Status> {
let tracer = Arc::new(Tracer::new(NoopReporter, TraceOptions::NONE));
let server = ServiceBuilder::new()
    .layer(UnaryServerLayer::new(tracer))
    .service(service_fn(|call: Call<()>| async move {
        Ok::<_, tonic::Status>(call.context.span().map(|span| span.parent_span_id()))
    }));

let incoming = Metadata::pairs([(TRACE_HEADER, "0af7651916cd43dd8448eb211c80319c/42;o=1")]);
let context = CallContext::new().with_incoming_metadata(incoming);
let parent = server.oneshot(Call::new(context, "/shop.Orders/Place", ())).await?;
assert_eq!(parent, Some(42));
# Ok(())
# }
```

With tonic, [`CallContext::from_request`] and [`CallContext::into_request`] move metadata and
the ambient span between a [`tonic::Request`] and a [`CallContext`].

### Configuration

Layers and tracers can be built from [`config::TraceSettings`]; see [`config`] for loading
settings from a TOML file with environment overrides. Overrides can be nested: to override
`tracing.sampled` one would set an environment value like so, replacing the dot (`.`) with
double underscores (`__`):
```sh
MYAPP_TRACING__SAMPLED=true ./my_service
```

Finished spans can be exported over OTLP with [`telemetry::OtelReporter`] once
[`telemetry::init`] has installed a tracer provider.
*/
#![deny(
    future_incompatible,
    deprecated_safe,
    rust_2018_compatibility,
    rust_2018_idioms,
    rust_2021_compatibility
)]
// Document ALL THE THINGS!
#![deny(missing_docs)]

use std::path::PathBuf;

pub mod config;
pub mod context;
pub mod header;
pub mod interceptor;
pub mod metadata;
pub mod session;
pub mod span;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use context::{context_with_span, span_from_context, CallContext};
pub use header::{decode, encode, TraceContext, TraceOptions, TRACE_HEADER};
pub use interceptor::{
    Call, ClientStream, ClientStreamWrapper, ServerCallStream, ServerStream, ServerStreamWrapper,
    StreamClientLayer, StreamServerLayer, TracedFuture, UnaryClientLayer, UnaryServerLayer,
};
pub use metadata::Metadata;
pub use session::{TraceSession, Tracer};
pub use span::{FinishedSpan, LogReporter, NoopReporter, Reporter, Span};

/// Configuration related errors
#[derive(Debug, snafu::Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// Figment could not extract a config from the file with env overrides
    #[snafu(display("Could not load configuration: {source}"))]
    ConfigLoad {
        /// The source figment error
        source: Box<figment::Error>,
    },

    /// The given config file does not exist
    #[snafu(display("Config file {path:?} does not exist"))]
    ConfigFileMissing {
        /// path that was given as the config file
        path: PathBuf,
    },

    /// Writing to the config file was not possible
    #[snafu(display("Could not write to the config file at {path:?}: {source}"))]
    ConfigFileWrite {
        /// path where the config file was trying to be written to
        path: PathBuf,
        /// the IO error that occurred
        source: std::io::Error,
    },
}

/// Service information collected from the build.
#[derive(Clone, Debug, Default)]
pub struct ServiceInfo {
    /// The name of the service.
    pub name: &'static str,

    /// The service identifier as exported to telemetry backends.
    ///
    /// Usually the same as [`ServiceInfo::name`], with hyphens (`-`) replaced by underscores `_`.
    pub name_in_telemetry: String,

    /// The version of the service.
    pub version: &'static str,

    /// Service author.
    pub author: &'static str,
    /// The description of the service.
    pub description: &'static str,
}

/**
Creates [`ServiceInfo`] from the information in `Cargo.toml` manifest of the service.

ServiceInfo names the service in exported spans and logs.
```rust,no_run
use grpc_trace_context::config::Settings;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let service_info = grpc_trace_context::service_info!();
    let settings = Settings::load(Some("service.toml"), Some("MYAPP_"))?;
    let _telemetry = grpc_trace_context::telemetry::init(&service_info, &settings.telemetry)?;

    // ...

    Ok(())
}
```

[`ServiceInfo::name_in_telemetry`] is the same as the package name, with hyphens (`-`) replaced
by underscores (`_`).
*/
#[macro_export]
macro_rules! service_info {
    () => {
        $crate::ServiceInfo {
            name: env!("CARGO_PKG_NAME"),
            name_in_telemetry: env!("CARGO_PKG_NAME").replace("-", "_"),
            version: env!("CARGO_PKG_VERSION"),
            author: env!("CARGO_PKG_AUTHORS"),
            description: env!("CARGO_PKG_DESCRIPTION"),
        }
    };
}
