//! Built-in HTTP server.
//!
//! Routes:
//! - `GET|POST <path>`: GraphQL over HTTP, framed by the dispatcher
//! - `GET <path>` with `Upgrade: websocket`: `graphql-transport-ws`
//! - `GET /health`: health check

use crate::error::{SdkError, SdkResult};
use crate::framing::{full, BoxBody, SingleResponse, JSON_CONTENT_TYPE};
use crate::server::GqlmuxServer;
use crate::websocket;
use bytes::Bytes;
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

pub(crate) const HEALTH_PATH: &str = "/health";

fn json_response(status: StatusCode, body: &'static str) -> Response<BoxBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    response
}

pub(crate) fn health_response() -> Response<BoxBody> {
    json_response(StatusCode::OK, r#"{"status":"healthy"}"#)
}

fn not_found() -> Response<BoxBody> {
    json_response(StatusCode::NOT_FOUND, r#"{"error":"Not Found"}"#)
}

/// Error response for failures that escaped the dispatcher, masked like any
/// other error.
fn error_response(server: &GqlmuxServer, err: &SdkError) -> Response<BoxBody> {
    let errors = server
        .dispatcher()
        .pipeline()
        .primitives()
        .process_errors(vec![err.to_field_error()]);
    SingleResponse::from_errors(err.status(), errors).into_http()
}

pub(crate) async fn route<B>(server: &GqlmuxServer, request: Request<B>) -> Response<BoxBody>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let path = request.uri().path();
    if path == HEALTH_PATH && request.method() == Method::GET {
        return health_response();
    }
    if path != server.config().path {
        return not_found();
    }

    let (parts, body) = request.into_parts();
    let context = server.request_context(&parts);
    let request = Request::from_parts(parts, body);

    if request.method() == Method::GET && websocket::is_upgrade_request(&request) {
        return websocket::upgrade(server.websocket().clone(), request, context)
            .unwrap_or_else(|err| {
                debug!(code = %err.code, message = %err.message, "websocket upgrade refused");
                error_response(server, &err)
            });
    }

    match server.dispatcher().handle(request, context).await {
        Ok(response) => response,
        Err(err) => {
            error!(code = %err.code, message = %err.message, "request failed");
            error_response(server, &err)
        }
    }
}

/// Accepts connections until `shutdown` resolves. One task per connection.
pub(crate) async fn run_server<F>(
    server: Arc<GqlmuxServer>,
    listener: TcpListener,
    shutdown: F,
) -> SdkResult<()>
where
    F: Future<Output = ()> + Send,
{
    let addr = listener
        .local_addr()
        .map_err(|e| SdkError::transport(format!("Failed to read local address: {e}")))?;
    info!(%addr, path = %server.config().path, "listening");

    tokio::pin!(shutdown);
    loop {
        let (stream, remote) = tokio::select! {
            () = &mut shutdown => {
                info!("shutting down");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!(%error, "failed to accept connection");
                    continue;
                }
            },
        };

        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let service = service_fn(move |request: Request<Incoming>| {
                let server = Arc::clone(&server);
                async move { Ok::<_, Infallible>(server.handle(request).await) }
            });
            let connection = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades();
            if let Err(err) = connection.await {
                if !err.is_incomplete_message() {
                    debug!(%remote, error = %err, "connection error");
                }
            }
        });
    }
}
