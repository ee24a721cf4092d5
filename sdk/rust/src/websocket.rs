//! GraphQL over WebSocket, `graphql-transport-ws` subprotocol.
//!
//! Each connection must send `connection_init` within the init timeout. After
//! the ack, every `subscribe` message runs through the same dispatcher as HTTP
//! requests in its own task; results are sent as `next` messages followed by
//! `complete`. Live operations are tracked in a [`ConnectionRegistry`] so a
//! client `complete` or the end of the connection releases them exactly once.

use crate::context::RequestContext;
use crate::dispatch::Dispatcher;
use crate::error::{SdkError, SdkResult};
use crate::framing::{full, BoxBody, ExecutionResult};
use crate::request::NormalizedOperation;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use gqlmux_runtime::{Subscription, SubscriptionHandle};
use hyper::header::{
    HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
    UPGRADE,
};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, warn};

pub const GRAPHQL_TRANSPORT_WS_PROTOCOL: &str = "graphql-transport-ws";
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Close codes defined by the subprotocol.
pub mod close_code {
    pub const INVALID_MESSAGE: u16 = 4400;
    pub const UNAUTHORIZED: u16 = 4401;
    pub const INIT_TIMEOUT: u16 = 4408;
    pub const SUBSCRIBER_EXISTS: u16 = 4409;
    pub const TOO_MANY_INIT: u16 = 4429;
}

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ConnectionInit {
        #[serde(default)]
        payload: Option<Value>,
    },
    Subscribe {
        id: String,
        payload: Value,
    },
    Complete {
        id: String,
    },
    Ping {
        #[serde(default)]
        payload: Option<Value>,
    },
    Pong {
        #[serde(default)]
        payload: Option<Value>,
    },
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionAck {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Next {
        id: String,
        payload: Value,
    },
    Error {
        id: String,
        payload: Value,
    },
    Complete {
        id: String,
    },
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
}

impl ServerMessage {
    fn into_message(self) -> Option<Message> {
        match serde_json::to_string(&self) {
            Ok(text) => Some(Message::text(text)),
            Err(error) => {
                error!(%error, "failed to encode websocket message");
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CloseReason {
    code: u16,
    reason: String,
}

impl CloseReason {
    fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    fn into_message(self) -> Message {
        Message::Close(Some(CloseFrame {
            code: CloseCode::from(self.code),
            reason: self.reason.into(),
        }))
    }
}

pub type ConnectionId = u64;

#[derive(Debug)]
struct Operation {
    seq: u64,
    handle: SubscriptionHandle,
}

#[derive(Debug, Default)]
struct RegistryState {
    next_connection: ConnectionId,
    next_operation: u64,
    connections: HashMap<ConnectionId, IndexMap<String, Operation>>,
}

/// Live operations of every WebSocket connection, keyed by connection id and
/// operation id.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new connection.
    pub fn open(&self) -> ConnectionId {
        let mut state = self.lock();
        state.next_connection += 1;
        let id = state.next_connection;
        state.connections.insert(id, IndexMap::new());
        id
    }

    /// Reserves an operation id. Returns `None` when the id is already live on
    /// this connection or the connection is unknown.
    fn start(&self, connection: ConnectionId, id: &str) -> Option<(u64, SubscriptionHandle)> {
        let mut state = self.lock();
        state.next_operation += 1;
        let seq = state.next_operation;
        let operations = state.connections.get_mut(&connection)?;
        if operations.contains_key(id) {
            return None;
        }
        let handle = SubscriptionHandle::new();
        operations.insert(
            id.to_string(),
            Operation {
                seq,
                handle: handle.clone(),
            },
        );
        Some((seq, handle))
    }

    /// Unsubscribes one operation. Returns false if it was not live.
    pub fn complete(&self, connection: ConnectionId, id: &str) -> bool {
        let removed = self
            .lock()
            .connections
            .get_mut(&connection)
            .and_then(|operations| operations.shift_remove(id));
        match removed {
            Some(operation) => {
                operation.handle.unsubscribe();
                true
            }
            None => false,
        }
    }

    /// Forgets an operation that ended on its own.
    fn finish(&self, connection: ConnectionId, id: &str, seq: u64) {
        let mut state = self.lock();
        if let Some(operations) = state.connections.get_mut(&connection) {
            if operations.get(id).is_some_and(|op| op.seq == seq) {
                operations.shift_remove(id);
            }
        }
    }

    /// Removes a connection and unsubscribes all of its operations. Returns
    /// how many were live.
    pub fn close(&self, connection: ConnectionId) -> usize {
        let operations = self.lock().connections.remove(&connection).unwrap_or_default();
        for operation in operations.values() {
            operation.handle.unsubscribe();
        }
        operations.len()
    }

    /// Ids of the live operations of a connection, oldest first.
    pub fn operations(&self, connection: ConnectionId) -> Vec<String> {
        self.lock()
            .connections
            .get(&connection)
            .map(|ops| ops.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }
}

type Outgoing = mpsc::Sender<Message>;

/// Serves `graphql-transport-ws` connections.
#[derive(Debug, Clone)]
pub struct WebSocketAdapter {
    dispatcher: Dispatcher,
    registry: ConnectionRegistry,
    init_timeout: Duration,
}

impl WebSocketAdapter {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            registry: ConnectionRegistry::new(),
            init_timeout: DEFAULT_INIT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: ConnectionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Runs the protocol until either side closes the connection.
    pub async fn serve<S>(&self, socket: WebSocketStream<S>, context: RequestContext)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, mut stream) = socket.split();

        // The sink is not cloneable, so operations write through a channel
        // drained by a pump task.
        let (sender, receiver) = mpsc::channel(16);
        let pump = tokio::spawn(pump(sink, receiver));

        let params = match self.accept(&mut stream, &sender).await {
            Ok(params) => params,
            Err(close) => {
                if let Some(close) = close {
                    debug!(code = close.code, reason = %close.reason, "closing websocket before ack");
                    sender.send(close.into_message()).await.ok();
                }
                drop(sender);
                pump.await.ok();
                return;
            }
        };

        let connection = self.registry.open();
        debug!(connection, "websocket connection acknowledged");
        let mut tasks = JoinSet::new();

        let close = loop {
            tokio::select! {
                incoming = next_message(&mut stream) => {
                    let message = match incoming {
                        None => break None,
                        Some(Err(close)) => break Some(close),
                        Some(Ok(message)) => message,
                    };
                    let outcome = self
                        .on_message(message, connection, params.as_ref(), &context, &sender, &mut tasks)
                        .await;
                    if let Some(close) = outcome {
                        break Some(close);
                    }
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        };

        if let Some(close) = close {
            debug!(connection, code = close.code, reason = %close.reason, "closing websocket");
            sender.send(close.into_message()).await.ok();
        }
        let released = self.registry.close(connection);
        tasks.shutdown().await;
        drop(sender);
        pump.await.ok();
        debug!(connection, released, "websocket connection closed");
    }

    /// Waits for `connection_init` and acknowledges it. `Err(None)` means the
    /// client went away.
    async fn accept<S>(
        &self,
        stream: &mut SplitStream<WebSocketStream<S>>,
        sender: &Outgoing,
    ) -> Result<Option<Value>, Option<CloseReason>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let deadline = tokio::time::sleep(self.init_timeout);
        tokio::pin!(deadline);

        loop {
            let incoming = tokio::select! {
                () = &mut deadline => {
                    return Err(Some(CloseReason::new(
                        close_code::INIT_TIMEOUT,
                        "Connection initialisation timeout",
                    )));
                }
                incoming = next_message(stream) => incoming,
            };
            match incoming {
                None => return Err(None),
                Some(Err(close)) => return Err(Some(close)),
                Some(Ok(ClientMessage::ConnectionInit { payload })) => {
                    if let Some(payload) = payload.as_ref().filter(|p| !p.is_object()) {
                        warn!(%payload, "connection_init payload is not an object");
                        return Err(Some(CloseReason::new(
                            close_code::INVALID_MESSAGE,
                            "Invalid message received",
                        )));
                    }
                    send(sender, ServerMessage::ConnectionAck { payload: None }).await;
                    return Ok(payload);
                }
                Some(Ok(ClientMessage::Subscribe { .. })) => {
                    return Err(Some(CloseReason::new(close_code::UNAUTHORIZED, "Unauthorized")));
                }
                Some(Ok(ClientMessage::Ping { payload })) => {
                    send(sender, ServerMessage::Pong { payload }).await;
                }
                Some(Ok(ClientMessage::Pong { .. } | ClientMessage::Complete { .. })) => {}
            }
        }
    }

    async fn on_message(
        &self,
        message: ClientMessage,
        connection: ConnectionId,
        params: Option<&Value>,
        context: &RequestContext,
        sender: &Outgoing,
        tasks: &mut JoinSet<()>,
    ) -> Option<CloseReason> {
        match message {
            ClientMessage::ConnectionInit { .. } => Some(CloseReason::new(
                close_code::TOO_MANY_INIT,
                "Too many initialisation requests",
            )),
            ClientMessage::Ping { payload } => {
                send(sender, ServerMessage::Pong { payload }).await;
                None
            }
            ClientMessage::Pong { .. } => None,
            ClientMessage::Complete { id } => {
                if self.registry.complete(connection, &id) {
                    debug!(connection, id, "operation completed by client");
                }
                None
            }
            ClientMessage::Subscribe { id, payload } => {
                let Some((seq, handle)) = self.registry.start(connection, &id) else {
                    return Some(CloseReason::new(
                        close_code::SUBSCRIBER_EXISTS,
                        format!("Subscriber for {id} already exists"),
                    ));
                };
                let operation = match NormalizedOperation::from_json(payload) {
                    Ok(operation) => operation,
                    Err(err) => {
                        self.registry.finish(connection, &id, seq);
                        let errors = self
                            .dispatcher
                            .pipeline()
                            .primitives()
                            .process_errors(vec![err.to_field_error()]);
                        let payload = serde_json::to_value(errors).unwrap_or_default();
                        send(sender, ServerMessage::Error { id, payload }).await;
                        return None;
                    }
                };

                let run = OperationRun {
                    adapter: self.clone(),
                    connection,
                    id,
                    seq,
                    handle,
                    sender: sender.clone(),
                };
                let context = context.clone();
                let params = params.cloned();
                tasks.spawn(run.execute(operation, context, params));
                None
            }
        }
    }
}

/// One operation of one connection.
struct OperationRun {
    adapter: WebSocketAdapter,
    connection: ConnectionId,
    id: String,
    seq: u64,
    handle: SubscriptionHandle,
    sender: Outgoing,
}

impl OperationRun {
    async fn execute(self, operation: NormalizedOperation, context: RequestContext, params: Option<Value>) {
        let mut extra = Map::new();
        extra.insert(
            "connectionParams".into(),
            params.unwrap_or_else(|| Value::Object(Map::new())),
        );

        let dispatch = self
            .adapter
            .dispatcher
            .dispatch_with(&Method::POST, operation, context, extra);
        let result = tokio::select! {
            biased;
            () = self.handle.cancelled() => return,
            result = dispatch => result,
        };

        match result {
            Err(err) => {
                error!(code = %err.code, message = %err.message, "websocket operation failed");
                let errors = self
                    .adapter
                    .dispatcher
                    .pipeline()
                    .primitives()
                    .process_errors(vec![err.to_field_error()]);
                let payload = serde_json::to_value(errors).unwrap_or_default();
                self.emit(ServerMessage::Error { id: self.id.clone(), payload }).await;
            }
            Ok(ExecutionResult::Single(single)) if !single.status.is_success() => {
                let payload = single.payload.get("errors").cloned().unwrap_or_default();
                self.emit(ServerMessage::Error { id: self.id.clone(), payload }).await;
            }
            Ok(ExecutionResult::Single(single)) => {
                if self.next(single.payload).await {
                    self.complete().await;
                }
            }
            Ok(ExecutionResult::Incremental(payloads)) => self.forward(payloads).await,
            Ok(ExecutionResult::Live(events)) => self.forward(events).await,
        }
        self.adapter.registry.finish(self.connection, &self.id, self.seq);
    }

    async fn forward<T: Serialize>(&self, subscription: Subscription<T>) {
        let mut subscription = subscription.with_handle(&self.handle);
        while let Some(item) = subscription.next().await {
            let payload = serde_json::to_value(&item).unwrap_or_default();
            if !self.next(payload).await {
                return;
            }
        }
        if !self.handle.is_unsubscribed() {
            self.complete().await;
        }
    }

    async fn next(&self, payload: Value) -> bool {
        self.emit(ServerMessage::Next {
            id: self.id.clone(),
            payload,
        })
        .await
    }

    async fn complete(&self) {
        self.emit(ServerMessage::Complete { id: self.id.clone() }).await;
    }

    async fn emit(&self, message: ServerMessage) -> bool {
        send(&self.sender, message).await
    }
}

async fn send(sender: &Outgoing, message: ServerMessage) -> bool {
    match message.into_message() {
        Some(message) => sender.send(message).await.is_ok(),
        None => false,
    }
}

async fn pump<S>(mut sink: SplitSink<WebSocketStream<S>, Message>, mut receiver: mpsc::Receiver<Message>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = receiver.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(error) = sink.send(message).await {
            debug!(%error, "websocket send failed");
            break;
        }
        if closing {
            break;
        }
    }
}

/// Reads the next protocol message, skipping control frames. `None` once the
/// connection is closed.
async fn next_message<S>(
    stream: &mut SplitStream<WebSocketStream<S>>,
) -> Option<Result<ClientMessage, CloseReason>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = stream.next().await {
        let parsed = match message {
            Ok(Message::Text(text)) => serde_json::from_str::<ClientMessage>(&text),
            Ok(Message::Binary(bytes)) => serde_json::from_slice::<ClientMessage>(&bytes),
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
            Ok(Message::Close(_)) => return None,
            Err(error) => {
                debug!(%error, "websocket receive failed");
                return None;
            }
        };
        return Some(parsed.map_err(|error| {
            warn!(%error, "invalid websocket message");
            CloseReason::new(close_code::INVALID_MESSAGE, "Invalid message received")
        }));
    }
    None
}

/// Returns true if the request asks for a WebSocket upgrade.
pub fn is_upgrade_request<B>(request: &Request<B>) -> bool {
    let has_token = |name, token: &str| {
        request
            .headers()
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|part| part.trim().eq_ignore_ascii_case(token))
    };
    has_token(CONNECTION, "upgrade") && has_token(UPGRADE, "websocket")
}

/// Accepts a WebSocket upgrade and serves the connection in the background.
pub fn upgrade<B>(
    adapter: WebSocketAdapter,
    mut request: Request<B>,
    context: RequestContext,
) -> SdkResult<hyper::Response<BoxBody>> {
    let key = request
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .ok_or_else(|| SdkError::malformed("Missing Sec-WebSocket-Key header."))?;
    let accept = HeaderValue::from_str(&derive_accept_key(key.as_bytes()))
        .map_err(|e| SdkError::internal(format!("Invalid Sec-WebSocket-Accept value: {e}")))?;

    let offered = request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|protocol| protocol.trim() == GRAPHQL_TRANSPORT_WS_PROTOCOL);
    if !offered {
        return Err(SdkError::malformed(format!(
            "WebSocket clients must use the {GRAPHQL_TRANSPORT_WS_PROTOCOL} subprotocol."
        )));
    }

    let on_upgrade = hyper::upgrade::on(&mut request);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let socket =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                        .await;
                adapter.serve(socket, context).await;
            }
            Err(error) => warn!(%error, "websocket upgrade failed"),
        }
    });

    let mut response = hyper::Response::new(full(""));
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    headers.insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(GRAPHQL_TRANSPORT_WS_PROTOCOL),
    );
    Ok(response)
}
