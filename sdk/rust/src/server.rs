//! Server configuration and the top-level server type.
//!
//! # Example
//!
//! ```ignore
//! use gqlmux_sdk::{GqlmuxServer, PipelineOptions, ServerConfig};
//!
//! let server = GqlmuxServer::builder()
//!     .config(ServerConfig::new().port(4000).upload_limit("10mb"))
//!     .pipeline(PipelineOptions::new().depth_limit(DepthLimit::new(8)))
//!     .schema(schema)
//!     .build()?;
//! server.serve().await?;
//! ```

use crate::context::RequestContext;
use crate::dispatch::Dispatcher;
use crate::error::{SdkError, SdkResult};
use crate::framing::BoxBody;
use crate::http;
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::websocket::{WebSocketAdapter, DEFAULT_INIT_TIMEOUT};
use bytes::Bytes;
use gqlmux_core::parse_size;
use gqlmux_runtime::{Schema, SchemaProvider, StaticSchema};
use hyper::body::Body;
use hyper::http::request::Parts;
use hyper::Request;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

pub const DEFAULT_UPLOAD_LIMIT: &str = "20mb";

/// Server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Port to listen on.
    pub port: u16,
    /// IP address to bind to.
    pub host: String,
    /// Path of the GraphQL endpoint.
    pub path: String,
    /// Maximum request body size, e.g. `"20mb"`.
    pub upload_limit: String,
    /// How long a WebSocket client may take to send `connection_init`.
    pub websocket_init_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerConfig {
    /// Creates a new config with default values.
    pub fn new() -> Self {
        Self {
            port: 4000,
            host: "127.0.0.1".to_string(),
            path: "/graphql".to_string(),
            upload_limit: DEFAULT_UPLOAD_LIMIT.to_string(),
            websocket_init_timeout: DEFAULT_INIT_TIMEOUT,
        }
    }

    /// Sets the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the endpoint path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Sets the request body limit.
    pub fn upload_limit(mut self, limit: impl Into<String>) -> Self {
        self.upload_limit = limit.into();
        self
    }

    /// Sets how long a WebSocket client may wait before `connection_init`.
    pub fn websocket_init_timeout(mut self, timeout: Duration) -> Self {
        self.websocket_init_timeout = timeout;
        self
    }

    /// The upload limit in bytes.
    pub fn upload_limit_bytes(&self) -> SdkResult<u64> {
        parse_size(&self.upload_limit).map_err(|e| {
            SdkError::configuration(format!(
                "Invalid upload limit \"{}\": {e}",
                self.upload_limit
            ))
        })
    }

    /// The address to bind, from `host` and `port`.
    pub fn socket_addr(&self) -> SdkResult<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| SdkError::configuration(format!("Invalid address: {e}")))
    }

    /// Checks every field, failing with a configuration error.
    pub fn validate(&self) -> SdkResult<()> {
        if !self.path.starts_with('/') {
            return Err(SdkError::configuration(format!(
                "Endpoint path must start with '/', got \"{}\"",
                self.path
            )));
        }
        if self.path == http::HEALTH_PATH {
            return Err(SdkError::configuration(
                "Endpoint path conflicts with the health check",
            ));
        }
        self.upload_limit_bytes()?;
        self.socket_addr()?;
        Ok(())
    }
}

type ContextHook = Arc<dyn Fn(&Parts) -> RequestContext + Send + Sync>;

/// Builder for [`GqlmuxServer`].
#[derive(Default)]
pub struct GqlmuxServerBuilder {
    config: ServerConfig,
    options: PipelineOptions,
    schema: Option<Arc<dyn SchemaProvider>>,
    context: Option<ContextHook>,
}

impl GqlmuxServerBuilder {
    /// Sets the server configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the pipeline options.
    pub fn pipeline(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Serves a fixed schema.
    pub fn schema(self, schema: Schema) -> Self {
        self.schema_provider(Arc::new(StaticSchema::new(schema)))
    }

    /// Loads the schema from `provider` on every operation.
    pub fn schema_provider(mut self, provider: Arc<dyn SchemaProvider>) -> Self {
        self.schema = Some(provider);
        self
    }

    /// Replaces the default request context population.
    pub fn request_context<F>(mut self, f: F) -> Self
    where
        F: Fn(&Parts) -> RequestContext + Send + Sync + 'static,
    {
        self.context = Some(Arc::new(f));
        self
    }

    /// Validates the configuration and builds the server.
    pub fn build(self) -> SdkResult<GqlmuxServer> {
        self.config.validate()?;
        let schema = self
            .schema
            .ok_or_else(|| SdkError::configuration("A schema or schema provider is required"))?;
        let pipeline = Pipeline::build(self.options)?;
        let dispatcher =
            Dispatcher::new(pipeline, schema).with_upload_limit(self.config.upload_limit_bytes()?);
        let websocket = WebSocketAdapter::new(dispatcher.clone())
            .with_init_timeout(self.config.websocket_init_timeout);

        Ok(GqlmuxServer {
            config: self.config,
            dispatcher,
            websocket,
            context: self
                .context
                .unwrap_or_else(|| Arc::new(RequestContext::from_parts)),
        })
    }
}

/// A GraphQL server: one endpoint, JSON, multipart, SSE and WebSocket.
pub struct GqlmuxServer {
    config: ServerConfig,
    dispatcher: Dispatcher,
    websocket: WebSocketAdapter,
    context: ContextHook,
}

impl std::fmt::Debug for GqlmuxServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GqlmuxServer")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl GqlmuxServer {
    /// Creates a server builder.
    pub fn builder() -> GqlmuxServerBuilder {
        GqlmuxServerBuilder::default()
    }

    /// Gets the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Gets the HTTP dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Gets the WebSocket adapter.
    pub fn websocket(&self) -> &WebSocketAdapter {
        &self.websocket
    }

    pub(crate) fn request_context(&self, parts: &Parts) -> RequestContext {
        (self.context)(parts)
    }

    /// Routes one request. Never fails; errors become responses.
    pub async fn handle<B>(&self, request: Request<B>) -> hyper::Response<BoxBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        http::route(self, request).await
    }

    /// Binds the configured address and serves until the process exits.
    pub async fn serve(self) -> SdkResult<()> {
        let listener = self.bind().await?;
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> SdkResult<TcpListener> {
        let addr = self.config.socket_addr()?;
        TcpListener::bind(addr)
            .await
            .map_err(|e| SdkError::transport(format!("Failed to bind {addr}: {e}")))
    }

    /// Serves connections from `listener` until `shutdown` resolves.
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, shutdown: F) -> SdkResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        http::run_server(Arc::new(self), listener, shutdown).await
    }
}
