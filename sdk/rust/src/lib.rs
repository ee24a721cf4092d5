//! GraphQL server SDK with transport multiplexing.
//!
//! One endpoint serves every operation. The dispatcher picks the wire format
//! from the shape of the execution result:
//!
//! - a single result is sent as `application/json`,
//! - `@defer`/`@stream` results as `multipart/mixed` parts,
//! - subscriptions as `text/event-stream` events, or over a
//!   `graphql-transport-ws` WebSocket.
//!
//! The same [`Pipeline`] (error masking, depth limit, context extension,
//! telemetry and user plugins) applies to all of them.
//!
//! # Server
//!
//! ```ignore
//! use gqlmux_sdk::{DepthLimit, GqlmuxServer, PipelineOptions, ServerConfig};
//! use gqlmux_sdk::runtime::{ObjectDef, SchemaBuilder, TypeRef};
//!
//! let schema = SchemaBuilder::new()
//!     .object(ObjectDef::new("Query").field("version", TypeRef::named("String")))
//!     .resolver_fn("Query", "version", |_, _, _, _| Ok(json!("1.0.0")))
//!     .build()?;
//!
//! GqlmuxServer::builder()
//!     .config(ServerConfig::new().port(4000))
//!     .pipeline(PipelineOptions::new().depth_limit(DepthLimit::new(10)))
//!     .schema(schema)
//!     .build()?
//!     .serve()
//!     .await?;
//! ```

pub mod context;
pub mod dispatch;
pub mod error;
pub mod framing;
pub(crate) mod http;
pub mod pipeline;
pub mod pubsub;
pub mod request;
pub mod server;
pub mod websocket;

pub use context::RequestContext;
pub use dispatch::Dispatcher;
pub use error::{ErrorCode, IntoSdkError, ResultExt, SdkError, SdkResult};
pub use framing::{BoxBody, ExecutionResult, SingleResponse};
pub use pipeline::{
    DepthLimit, MaskErrors, OperationInfo, Pipeline, PipelineOptions, PipelinePrimitives, Plugin,
    TelemetryOptions,
};
pub use pubsub::PubSub;
pub use request::{normalize, NormalizedOperation};
pub use server::{GqlmuxServer, GqlmuxServerBuilder, ServerConfig};
pub use websocket::{ConnectionRegistry, WebSocketAdapter};

/// The execution runtime, re-exported for schema construction.
pub use gqlmux_runtime as runtime;
pub use gqlmux_core::{parse_size, ByteSize, SizeError};
