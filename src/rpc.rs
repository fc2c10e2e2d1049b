//! Bidirectional JSON-RPC 2.0 multiplexer.
//!
//! One connection serves both directions over the same byte stream:
//! inbound requests and notifications are routed through a method
//! registry (with `_`-prefixed names falling through to the extension
//! registry), while outbound requests park a waiter keyed by a
//! monotonically increasing id and resolve when the matching response
//! arrives. A single writer task serialises outbound frames, so
//! concurrent senders never interleave bytes.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering::SeqCst},
    },
};

use futures::{
    AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _, FutureExt as _,
    StreamExt as _,
    channel::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    future::BoxFuture,
    io::BufReader,
    select_biased,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, value::RawValue};
use tokio_util::sync::CancellationToken;

use crate::{
    Error, SessionId,
    agent::SESSION_CANCEL_METHOD_NAME,
    ext::ExtensionRegistry,
    stream::{StreamBroadcast, StreamReceiver, StreamSender},
    transport,
};

/// Context handed to every inbound handler.
pub struct RequestCtx {
    pub params: Option<Value>,
    /// The session the request is tagged with, when its params carry a
    /// `sessionId`.
    pub session_id: Option<SessionId>,
    /// Cancelled when `session/cancel` arrives for the tagged session.
    /// Handlers poll it at coarse boundaries and short-circuit reverse
    /// calls when set.
    pub cancel: CancellationToken,
}

impl RequestCtx {
    /// Deserializes the params payload, mapping failures to `-32602`.
    pub fn parse<P: DeserializeOwned>(&self) -> Result<P, Error> {
        parse_params(self.params.as_ref())
    }
}

pub fn parse_params<P: DeserializeOwned>(params: Option<&Value>) -> Result<P, Error> {
    let value = params.cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|err| Error::invalid_params().with_data(err.to_string()))
}

type MethodHandler =
    Arc<dyn Fn(RequestCtx) -> BoxFuture<'static, Result<Value, Error>> + Send + Sync>;
type NotificationHandler =
    Arc<dyn Fn(RequestCtx) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// The dispatch table for one side of the connection.
#[derive(Default)]
pub struct MethodRegistry {
    methods: HashMap<&'static str, MethodHandler>,
    notifications: HashMap<&'static str, NotificationHandler>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F>(&mut self, name: &'static str, handler: F)
    where
        F: Fn(RequestCtx) -> BoxFuture<'static, Result<Value, Error>> + Send + Sync + 'static,
    {
        self.methods.insert(name, Arc::new(handler));
    }

    pub fn notification<F>(&mut self, name: &'static str, handler: F)
    where
        F: Fn(RequestCtx) -> BoxFuture<'static, Result<(), Error>> + Send + Sync + 'static,
    {
        self.notifications.insert(name, Arc::new(handler));
    }
}

/// Per-session cancellation tokens, shared between the multiplexer and
/// the components that fan cancellation out.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<Mutex<HashMap<SessionId, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live token for a session, created on first use.
    pub fn token_for(&self, session_id: &SessionId) -> CancellationToken {
        self.tokens
            .lock()
            .entry(session_id.clone())
            .or_default()
            .clone()
    }

    /// Cancels the session's current token. A later request for the same
    /// session gets a fresh token.
    pub fn cancel(&self, session_id: &SessionId) {
        if let Some(token) = self.tokens.lock().remove(session_id) {
            token.cancel();
        }
    }
}

/// Routes inbound traffic: registered methods first, then `_`-prefixed
/// extensions, then `-32601`.
pub struct RpcHandler {
    methods: MethodRegistry,
    extensions: Arc<ExtensionRegistry>,
    cancellations: CancellationRegistry,
}

impl RpcHandler {
    pub fn new(
        methods: MethodRegistry,
        extensions: Arc<ExtensionRegistry>,
        cancellations: CancellationRegistry,
    ) -> Self {
        Self {
            methods,
            extensions,
            cancellations,
        }
    }

    fn ctx(&self, params: Option<Value>) -> RequestCtx {
        let session_id = params
            .as_ref()
            .and_then(|params| params.get("sessionId"))
            .and_then(|value| value.as_str())
            .map(|id| SessionId(id.into()));
        let cancel = match &session_id {
            Some(session_id) => self.cancellations.token_for(session_id),
            None => CancellationToken::new(),
        };
        RequestCtx {
            params,
            session_id,
            cancel,
        }
    }

    fn dispatch_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> BoxFuture<'static, Result<Value, Error>> {
        if let Some(handler) = self.methods.methods.get(method) {
            handler(self.ctx(params))
        } else if method.starts_with('_') {
            self.extensions.call_method(method, params)
        } else {
            log::debug!("unknown method: {method}");
            async { Err(Error::method_not_found()) }.boxed()
        }
    }

    fn dispatch_notification(&self, method: &str, params: Option<Value>) -> BoxFuture<'static, ()> {
        if method == SESSION_CANCEL_METHOD_NAME {
            // Signal in-flight handlers before the registered handler runs
            // its own fan-out.
            if let Some(session_id) = params
                .as_ref()
                .and_then(|params| params.get("sessionId"))
                .and_then(|value| value.as_str())
            {
                self.cancellations.cancel(&SessionId(session_id.into()));
            }
        }

        if let Some(handler) = self.methods.notifications.get(method) {
            let fut = handler(self.ctx(params));
            let method = method.to_string();
            async move {
                if let Err(err) = fut.await {
                    log::error!("failed to handle notification {method}: {err}");
                }
            }
            .boxed()
        } else if method.starts_with('_') {
            self.extensions.call_notification(method, params)
        } else {
            log::debug!("ignoring unknown notification: {method}");
            async {}.boxed()
        }
    }
}

/// A live JSON-RPC connection over a pair of byte streams.
pub struct RpcConnection {
    outgoing_tx: UnboundedSender<OutgoingFrame>,
    pending_responses: Arc<Mutex<HashMap<i64, PendingResponse>>>,
    next_id: AtomicI64,
    broadcast: StreamBroadcast,
    cancellations: CancellationRegistry,
}

struct PendingResponse {
    respond: oneshot::Sender<Result<Box<RawValue>, Error>>,
}

impl RpcConnection {
    /// Starts a connection. The returned future is the IO task: it owns
    /// both byte streams and must be polled for the connection to make
    /// progress. Handlers run on tasks created through `spawn`.
    pub fn new(
        handler: RpcHandler,
        outgoing_bytes: impl Unpin + AsyncWrite,
        incoming_bytes: impl Unpin + AsyncRead,
        spawn: impl Fn(BoxFuture<'static, ()>) + Send + Sync + 'static,
    ) -> (Self, impl Future<Output = Result<(), Error>>) {
        let (incoming_tx, incoming_rx) = mpsc::unbounded();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded();
        let (stream_tx, broadcast) = StreamBroadcast::new();

        let pending_responses: Arc<Mutex<HashMap<i64, PendingResponse>>> = Arc::default();
        let cancellations = handler.cancellations.clone();

        let io_task = {
            let pending_responses = pending_responses.clone();
            async move {
                let result = Self::handle_io(
                    incoming_tx,
                    outgoing_rx,
                    outgoing_bytes,
                    incoming_bytes,
                    pending_responses.clone(),
                    stream_tx,
                )
                .await;
                pending_responses.lock().clear();
                result
            }
        };

        Self::handle_incoming(outgoing_tx.clone(), incoming_rx, handler, spawn);

        let this = Self {
            outgoing_tx,
            pending_responses,
            next_id: AtomicI64::new(0),
            broadcast,
            cancellations,
        };

        (this, io_task)
    }

    /// Subscribes to a copy of every frame crossing this connection.
    pub fn subscribe(&self) -> StreamReceiver {
        self.broadcast.receiver()
    }

    pub fn cancellations(&self) -> CancellationRegistry {
        self.cancellations.clone()
    }

    /// Sends a one-way notification.
    pub fn notify(&self, method: impl Into<Arc<str>>, params: Option<Value>) -> Result<(), Error> {
        self.outgoing_tx
            .unbounded_send(OutgoingFrame::Notification {
                method: method.into(),
                params,
            })
            .map_err(|_| Error::internal_error().with_data("failed to send notification"))
    }

    /// Sends a request and waits for the correlated response.
    pub fn request<M: Into<Arc<str>>, Out: DeserializeOwned + Send + 'static>(
        &self,
        method: M,
        params: Option<Value>,
    ) -> impl Future<Output = Result<Out, Error>> + use<M, Out> {
        let rx = self.send_request(method.into(), params);
        async move { decode_response(rx.await) }
    }

    /// Like [`RpcConnection::request`], but abandons the waiter when the
    /// token fires; a response that arrives later is dropped.
    pub fn request_with_cancel<M: Into<Arc<str>>, Out: DeserializeOwned + Send + 'static>(
        &self,
        method: M,
        params: Option<Value>,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Out, Error>> + use<M, Out> {
        let pending_responses = self.pending_responses.clone();
        let id = self.next_id.fetch_add(1, SeqCst);
        let rx = self.send_request_with_id(id, method.into(), params);
        async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    pending_responses.lock().remove(&id);
                    Err(Error::internal_error().with_data("request cancelled"))
                }
                response = rx => decode_response(response),
            }
        }
    }

    fn send_request(
        &self,
        method: Arc<str>,
        params: Option<Value>,
    ) -> oneshot::Receiver<Result<Box<RawValue>, Error>> {
        let id = self.next_id.fetch_add(1, SeqCst);
        self.send_request_with_id(id, method, params)
    }

    fn send_request_with_id(
        &self,
        id: i64,
        method: Arc<str>,
        params: Option<Value>,
    ) -> oneshot::Receiver<Result<Box<RawValue>, Error>> {
        let (tx, rx) = oneshot::channel();
        self.pending_responses
            .lock()
            .insert(id, PendingResponse { respond: tx });
        if self
            .outgoing_tx
            .unbounded_send(OutgoingFrame::Request { id, method, params })
            .is_err()
        {
            self.pending_responses.lock().remove(&id);
        }
        rx
    }

    async fn handle_io(
        incoming_tx: UnboundedSender<IncomingMessage>,
        mut outgoing_rx: UnboundedReceiver<OutgoingFrame>,
        mut outgoing_bytes: impl Unpin + AsyncWrite,
        incoming_bytes: impl Unpin + AsyncRead,
        pending_responses: Arc<Mutex<HashMap<i64, PendingResponse>>>,
        stream_tx: StreamSender,
    ) -> Result<(), Error> {
        let mut input_reader = BufReader::new(incoming_bytes);
        let mut incoming_line = String::new();
        loop {
            select_biased! {
                message = outgoing_rx.next() => {
                    if let Some(message) = message {
                        let frame = transport::encode_frame(&JsonRpcEnvelope {
                            jsonrpc: JsonRpcVersion::V2,
                            message: &message,
                        })?;
                        log::trace!("send: {}", String::from_utf8_lossy(&frame));
                        outgoing_bytes.write_all(&frame).await.ok();
                        broadcast_outgoing(&stream_tx, &message);
                    } else {
                        break;
                    }
                }
                bytes_read = input_reader.read_line(&mut incoming_line).fuse() => {
                    if bytes_read.map_err(Error::into_internal_error)? == 0 {
                        break
                    }
                    log::trace!("recv: {}", &incoming_line);

                    match serde_json::from_str::<RawIncomingMessage>(&incoming_line) {
                        Ok(message) => {
                            if let Some(id) = message.id {
                                if let Some(method) = message.method {
                                    // Request
                                    let params = parse_raw(message.params);
                                    stream_tx.incoming_request(id, method, params.as_ref());
                                    incoming_tx.unbounded_send(IncomingMessage::Request {
                                        id,
                                        method: method.to_string(),
                                        params,
                                    }).ok();
                                } else if let Some(pending) = pending_responses.lock().remove(&id) {
                                    // Response
                                    if let Some(error) = message.error {
                                        stream_tx.incoming_response(id, Err(&error));
                                        pending.respond.send(Err(error)).ok();
                                    } else {
                                        let result = message
                                            .result
                                            .map(|raw| raw.to_owned())
                                            .unwrap_or_else(null_raw_value);
                                        stream_tx.incoming_response(id, Ok(Some(result.as_ref())));
                                        pending.respond.send(Ok(result)).ok();
                                    }
                                } else {
                                    log::error!("received response for unknown request id: {id}");
                                }
                            } else if let Some(method) = message.method {
                                // Notification
                                let params = parse_raw(message.params);
                                stream_tx.incoming_notification(method, params.as_ref());
                                incoming_tx.unbounded_send(IncomingMessage::Notification {
                                    method: method.to_string(),
                                    params,
                                }).ok();
                            } else {
                                log::error!("received message with neither id nor method");
                            }
                        }
                        Err(error) => {
                            log::error!("failed to parse incoming message: {error}. Raw: {incoming_line}");
                        }
                    }
                    incoming_line.clear();
                }
            }
        }
        Ok(())
    }

    fn handle_incoming(
        outgoing_tx: UnboundedSender<OutgoingFrame>,
        mut incoming_rx: UnboundedReceiver<IncomingMessage>,
        handler: RpcHandler,
        spawn: impl Fn(BoxFuture<'static, ()>) + Send + Sync + 'static,
    ) {
        let spawn = Arc::new(spawn);
        let spawn_loop = spawn.clone();
        spawn_loop(
            async move {
                while let Some(message) = incoming_rx.next().await {
                    match message {
                        IncomingMessage::Request { id, method, params } => {
                            let fut = handler.dispatch_request(&method, params);
                            let outgoing_tx = outgoing_tx.clone();
                            spawn(
                                async move {
                                    let result = fut.await;
                                    outgoing_tx
                                        .unbounded_send(OutgoingFrame::Response {
                                            id,
                                            result: result.into(),
                                        })
                                        .ok();
                                }
                                .boxed(),
                            )
                        }
                        IncomingMessage::Notification { method, params } => {
                            spawn(handler.dispatch_notification(&method, params))
                        }
                    }
                }
            }
            .boxed(),
        )
    }
}

fn parse_raw(raw: Option<&RawValue>) -> Option<Value> {
    raw.and_then(|raw| serde_json::from_str(raw.get()).ok())
}

fn null_raw_value() -> Box<RawValue> {
    RawValue::from_string("null".into()).expect("null is valid JSON")
}

fn decode_response<Out: DeserializeOwned>(
    response: Result<Result<Box<RawValue>, Error>, oneshot::Canceled>,
) -> Result<Out, Error> {
    let raw = response.map_err(|_| Error::internal_error().with_data("connection closed"))??;
    serde_json::from_str(raw.get())
        .map_err(|_| Error::internal_error().with_data("failed to deserialize response"))
}

fn broadcast_outgoing(stream_tx: &StreamSender, message: &OutgoingFrame) {
    match message {
        OutgoingFrame::Request { id, method, params } => {
            stream_tx.outgoing_request(*id, method.clone(), params.as_ref())
        }
        OutgoingFrame::Response { id, result } => stream_tx.outgoing_response(
            *id,
            match result {
                ResponseResult::Result(value) => Ok(Some(value.clone())),
                ResponseResult::Error(error) => Err(error.clone()),
            },
        ),
        OutgoingFrame::Notification { method, params } => {
            stream_tx.outgoing_notification(method.clone(), params.as_ref())
        }
    }
}

#[derive(Deserialize)]
struct RawIncomingMessage<'a> {
    id: Option<i64>,
    method: Option<&'a str>,
    #[serde(borrow)]
    params: Option<&'a RawValue>,
    #[serde(borrow)]
    result: Option<&'a RawValue>,
    error: Option<Error>,
}

enum IncomingMessage {
    Request {
        id: i64,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

#[derive(Serialize)]
#[serde(untagged)]
enum OutgoingFrame {
    Request {
        id: i64,
        method: Arc<str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    Response {
        id: i64,
        #[serde(flatten)]
        result: ResponseResult,
    },
    Notification {
        method: Arc<str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "snake_case")]
pub enum ResponseResult {
    Result(Value),
    Error(Error),
}

impl From<Result<Value, Error>> for ResponseResult {
    fn from(result: Result<Value, Error>) -> Self {
        match result {
            Ok(value) => ResponseResult::Result(value),
            Err(error) => ResponseResult::Error(error),
        }
    }
}

#[derive(Serialize)]
enum JsonRpcVersion {
    #[serde(rename = "2.0")]
    V2,
}

#[derive(Serialize)]
struct JsonRpcEnvelope<'a> {
    jsonrpc: JsonRpcVersion,
    #[serde(flatten)]
    message: &'a OutgoingFrame,
}
