//! The orchestrator: wires the protocol engine to the runtime components
//! and serves the inbound method surface.

use std::{pin::pin, sync::Arc, time::Duration};

use futures::{AsyncRead, AsyncWrite, FutureExt as _, StreamExt as _, channel::mpsc, future::BoxFuture};
use parking_lot::Mutex;
use serde_json::Value;

use crate::{
    Error, ErrorCode, SessionId,
    agent::{
        AUTHENTICATE_METHOD_NAME, CallToolRequest, CancelNotification, INITIALIZE_METHOD_NAME,
        InitializeRequest, InitializeResponse, LoadSessionResponse, NewSessionResponse,
        PROMPT_METHOD_NAME, PromptRequest, PromptResponse, SESSION_CANCEL_METHOD_NAME,
        SESSION_LOAD_METHOD_NAME, SESSION_NEW_METHOD_NAME, SESSION_SET_MODE_METHOD_NAME,
        SessionModeId, SetSessionModeRequest, SetSessionModeResponse, StopReason,
        TOOLS_CALL_METHOD_NAME, VERSION,
    },
    bridge::{AssistantBridge, AssistantEvent, BridgeTurn},
    client::{
        ClientCapabilities, ClientProxy, SESSION_REQUEST_PERMISSION_METHOD_NAME,
        SessionNotification, SessionUpdate,
    },
    ext::ExtensionRegistry,
    fs::{FsToolProvider, RetryPolicy, RpcFsClient},
    permission::{DEFAULT_PERMISSION_TIMEOUT, PermissionBroker},
    rpc::{
        CancellationRegistry, MethodRegistry, RequestCtx, RpcConnection, RpcHandler,
    },
    session::{Session, SessionManager},
    terminal::{TerminalManager, TerminalPolicy},
    tool_call::{DEFAULT_TOOL_CALL_RETENTION, ToolCallManager},
    tools::ToolRegistry,
    transport::{self, HttpReply},
};

#[derive(Clone)]
pub struct AdapterConfig {
    pub terminal_enabled: bool,
    pub terminal: TerminalPolicy,
    pub permission_timeout: Duration,
    /// Whether permission requests are forwarded to the client instead of
    /// answered by the default policy.
    pub interactive_permissions: bool,
    pub tool_call_retention: Duration,
    pub fs_retry: RetryPolicy,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            terminal_enabled: true,
            terminal: TerminalPolicy::default(),
            permission_timeout: DEFAULT_PERMISSION_TIMEOUT,
            interactive_permissions: false,
            tool_call_retention: DEFAULT_TOOL_CALL_RETENTION,
            fs_retry: RetryPolicy::default(),
        }
    }
}

impl AdapterConfig {
    /// Tolerant validation: pending pieces are fine, contradictions are
    /// not.
    pub fn validate(&self) -> Result<(), Error> {
        let invalid =
            |message: String| Error::new((ErrorCode::INVALID_PARAMS.code, message));
        if self.terminal_enabled && self.terminal.max_concurrent_terminals == 0 {
            return Err(invalid(
                "terminal support enabled but maxConcurrentTerminals is 0".to_string(),
            ));
        }
        if self.terminal.max_output_byte_limit == 0 {
            return Err(invalid("maxOutputByteLimit must be positive".to_string()));
        }
        if self.terminal.default_output_byte_limit > self.terminal.max_output_byte_limit {
            return Err(invalid(
                "default output byte limit exceeds the maximum".to_string(),
            ));
        }
        if self.permission_timeout.is_zero() {
            return Err(invalid("permission timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// The long-lived agent process: protocol engine plus runtime components.
pub struct Adapter {
    config: AdapterConfig,
    bridge: Arc<dyn AssistantBridge>,
    proxy: ClientProxy,
    extensions: Arc<ExtensionRegistry>,
    cancellations: CancellationRegistry,
    tool_calls: Arc<ToolCallManager>,
    tools: Arc<ToolRegistry>,
    fs_provider: Arc<FsToolProvider>,
    terminals: Arc<TerminalManager>,
    permissions: Arc<PermissionBroker>,
    sessions: Arc<SessionManager>,
    client_capabilities: Mutex<Option<ClientCapabilities>>,
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter").finish_non_exhaustive()
    }
}

impl Adapter {
    pub fn new(
        bridge: Arc<dyn AssistantBridge>,
        config: AdapterConfig,
    ) -> Result<Arc<Self>, Error> {
        config.validate()?;

        let proxy = ClientProxy::new();
        let tool_calls = Arc::new(ToolCallManager::with_retention(
            Arc::new(proxy.clone()),
            config.tool_call_retention,
        ));
        let tools = Arc::new(ToolRegistry::new(tool_calls.clone()));
        let fs_client = Arc::new(RpcFsClient::with_policy(proxy.clone(), config.fs_retry));
        let fs_provider = Arc::new(FsToolProvider::new(fs_client));
        tools.register_provider(fs_provider.clone());

        let terminals = Arc::new(TerminalManager::new(
            Arc::new(proxy.clone()),
            config.terminal.clone(),
        ));
        let permissions = Arc::new(PermissionBroker::with_timeout(config.permission_timeout));
        if config.interactive_permissions {
            permissions.set_frontend(Arc::new(proxy.clone()));
        }
        let sessions = Arc::new(SessionManager::new(
            tool_calls.clone(),
            permissions.clone(),
            terminals.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            bridge,
            proxy,
            extensions: Arc::new(ExtensionRegistry::new()),
            cancellations: CancellationRegistry::new(),
            tool_calls,
            tools,
            fs_provider,
            terminals,
            permissions,
            sessions,
            client_capabilities: Mutex::new(None),
        }))
    }

    pub fn extensions(&self) -> &Arc<ExtensionRegistry> {
        &self.extensions
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn terminals(&self) -> &Arc<TerminalManager> {
        &self.terminals
    }

    pub fn tool_calls(&self) -> &Arc<ToolCallManager> {
        &self.tool_calls
    }

    pub fn permissions(&self) -> &Arc<PermissionBroker> {
        &self.permissions
    }

    pub fn client_proxy(&self) -> &ClientProxy {
        &self.proxy
    }

    /// Starts serving a byte-stream transport (stdio or an in-process
    /// pipe). The returned IO task must be polled to completion.
    pub fn serve<W, R, S>(
        self: &Arc<Self>,
        outgoing_bytes: W,
        incoming_bytes: R,
        spawn: S,
    ) -> (
        Arc<RpcConnection>,
        impl Future<Output = Result<(), Error>> + use<W, R, S>,
    )
    where
        W: Unpin + AsyncWrite,
        R: Unpin + AsyncRead,
        S: Fn(BoxFuture<'static, ()>) + Send + Sync + 'static,
    {
        let handler = RpcHandler::new(
            self.method_registry(),
            self.extensions.clone(),
            self.cancellations.clone(),
        );
        let (connection, io_task) =
            RpcConnection::new(handler, outgoing_bytes, incoming_bytes, spawn);
        let connection = Arc::new(connection);
        self.proxy.bind(connection.clone());
        (connection, io_task)
    }

    /// Serves one HTTP exchange: the body is the sole inbound message,
    /// the reply carries the sole outbound one (or no content for a
    /// notification). Reverse calls issued mid-request go to the bound
    /// stream connection when one exists.
    pub async fn handle_one_shot(self: &Arc<Self>, body: Vec<u8>) -> HttpReply {
        let (reader, writer, reply) = match transport::one_shot(body) {
            Ok(parts) => parts,
            Err(err) => return HttpReply::failure(err),
        };
        let handler = RpcHandler::new(
            self.method_registry(),
            self.extensions.clone(),
            self.cancellations.clone(),
        );
        let (_connection, io_task) = RpcConnection::new(handler, writer, reader, |fut| {
            tokio::spawn(fut);
        });
        let io = tokio::spawn(io_task);
        let reply = reply.into_reply().await;
        io.abort();
        reply
    }

    /// Tears down the components that hold external resources.
    pub async fn shutdown(&self) {
        self.tools.cleanup().await;
        if let Err(err) = self.bridge.close().await {
            log::warn!("failed to close assistant bridge: {err}");
        }
    }

    fn method_registry(self: &Arc<Self>) -> MethodRegistry {
        let mut methods = MethodRegistry::new();

        macro_rules! method {
            ($name:expr, $handler:ident) => {{
                let adapter = self.clone();
                methods.method($name, move |ctx| {
                    let adapter = adapter.clone();
                    async move { adapter.$handler(ctx).await }.boxed()
                });
            }};
        }

        method!(INITIALIZE_METHOD_NAME, handle_initialize);
        method!(AUTHENTICATE_METHOD_NAME, handle_authenticate);
        method!(SESSION_NEW_METHOD_NAME, handle_session_new);
        method!(SESSION_LOAD_METHOD_NAME, handle_session_load);
        method!(SESSION_SET_MODE_METHOD_NAME, handle_set_mode);
        method!(
            SESSION_REQUEST_PERMISSION_METHOD_NAME,
            handle_request_permission
        );
        method!(TOOLS_CALL_METHOD_NAME, handle_tools_call);
        method!(PROMPT_METHOD_NAME, handle_prompt);

        let adapter = self.clone();
        methods.notification(SESSION_CANCEL_METHOD_NAME, move |ctx| {
            let adapter = adapter.clone();
            async move { adapter.handle_cancel(ctx).await }.boxed()
        });

        methods
    }

    async fn handle_initialize(self: Arc<Self>, ctx: RequestCtx) -> Result<Value, Error> {
        let request: InitializeRequest = ctx.parse()?;
        log::info!(
            "initialize: client protocol v{}, terminal={}",
            request.protocol_version,
            request.client_capabilities.terminal
        );

        self.fs_provider
            .set_capabilities(request.client_capabilities.fs.clone());
        self.tools.refresh();
        self.terminals
            .set_supported(self.config.terminal_enabled && request.client_capabilities.terminal);
        *self.client_capabilities.lock() = Some(request.client_capabilities);

        let meta = (!self.extensions.is_empty()).then(|| self.extensions.capabilities());
        let response = InitializeResponse {
            protocol_version: VERSION.min(request.protocol_version),
            agent_capabilities: crate::agent::AgentCapabilities {
                load_session: true,
                prompt_capabilities: self.bridge.prompt_capabilities(),
                meta,
            },
            auth_methods: Vec::new(),
            modes: self.sessions.mode_infos(),
        };
        to_value(response)
    }

    async fn handle_authenticate(self: Arc<Self>, _ctx: RequestCtx) -> Result<Value, Error> {
        if self.bridge.check_auth().await? {
            Ok(Value::Object(serde_json::Map::new()))
        } else {
            Err(Error::auth_required())
        }
    }

    async fn handle_session_new(self: Arc<Self>, ctx: RequestCtx) -> Result<Value, Error> {
        let cwd = crate::session::validate_cwd(ctx.params.as_ref())?;
        let name = ctx
            .params
            .as_ref()
            .and_then(|params| params.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let mode = ctx
            .params
            .as_ref()
            .and_then(|params| params.get("mode"))
            .and_then(Value::as_str)
            .map(SessionModeId::from);

        let session = self.sessions.create_session(cwd, name, mode)?;
        let response = NewSessionResponse {
            session_id: session.id.clone(),
            modes: self.sessions.mode_state(&session),
        };
        to_value(response)
    }

    async fn handle_session_load(self: Arc<Self>, ctx: RequestCtx) -> Result<Value, Error> {
        let cwd = crate::session::validate_cwd(ctx.params.as_ref())?;
        let Some(session_id) = ctx.session_id.clone() else {
            return Err(Error::new((
                ErrorCode::INVALID_PARAMS.code,
                "sessionId is required".to_string(),
            )));
        };

        let session = self.sessions.load_session(&session_id, cwd)?;
        let response = LoadSessionResponse {
            modes: self.sessions.mode_state(&session),
        };
        to_value(response)
    }

    async fn handle_set_mode(self: Arc<Self>, ctx: RequestCtx) -> Result<Value, Error> {
        let request: SetSessionModeRequest = ctx.parse()?;
        let previous = self
            .sessions
            .set_session_mode(&request.session_id, request.mode_id.clone())?;

        // Best-effort UI refresh; mode switching never fails on a broken
        // notification channel.
        self.proxy
            .session_update(SessionNotification {
                session_id: request.session_id,
                update: SessionUpdate::CurrentModeUpdate {
                    current_mode_id: request.mode_id,
                },
            })
            .ok();

        to_value(SetSessionModeResponse {
            previous_mode_id: previous,
        })
    }

    async fn handle_request_permission(self: Arc<Self>, ctx: RequestCtx) -> Result<Value, Error> {
        let request = PermissionBroker::validate(ctx.params.as_ref())?;
        let response = self.permissions.request(request).await;
        to_value(response)
    }

    async fn handle_tools_call(self: Arc<Self>, ctx: RequestCtx) -> Result<Value, Error> {
        let request: CallToolRequest = ctx.parse()?;
        if request.name.is_empty() {
            return Err(Error::new((
                ErrorCode::INVALID_PARAMS.code,
                "name is required".to_string(),
            )));
        }

        // The session may ride at the top level or inside the tool's own
        // parameters.
        let session_id = request
            .session_id
            .or(ctx.session_id)
            .or_else(|| {
                request
                    .parameters
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .map(SessionId::from)
            });

        let outcome = self
            .tools
            .execute(&request.name, request.parameters, session_id.as_ref())
            .await;
        to_value(outcome)
    }

    async fn handle_prompt(self: Arc<Self>, ctx: RequestCtx) -> Result<Value, Error> {
        let request: PromptRequest = ctx.parse()?;
        let Some(session) = self.sessions.get_session(&request.session_id) else {
            return Err(Error::new((
                ErrorCode::INVALID_PARAMS.code,
                format!("unknown session: {}", request.session_id),
            )));
        };
        self.sessions.touch(&session.id);

        let stop_reason = self.drive_prompt(&ctx, session, request).await?;
        to_value(PromptResponse { stop_reason })
    }

    /// Runs one prompt turn: the bridge streams events, tool requests
    /// loop through the dispatcher, chunks surface as session updates,
    /// and `session/cancel` short-circuits the whole turn.
    async fn drive_prompt(
        &self,
        ctx: &RequestCtx,
        session: Session,
        request: PromptRequest,
    ) -> Result<StopReason, Error> {
        let session_id = session.id.clone();
        let system_prompt = self
            .sessions
            .mode(&session.mode)
            .and_then(|mode| mode.system_prompt.clone());
        let turn = BridgeTurn {
            session_id: session_id.clone(),
            cwd: session.cwd,
            mode: session.mode,
            system_prompt,
            prompt: request.prompt,
        };

        let (events_tx, mut events_rx) = mpsc::unbounded();
        let mut bridge_turn = pin!(self.bridge.prompt_turn(turn, events_tx));
        let mut events_open = true;

        let stop_reason = loop {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    // The turn is abandoned; session-level fan-out runs in
                    // the cancel notification handler.
                    break StopReason::Cancelled;
                }
                result = &mut bridge_turn => {
                    while let Ok(Some(event)) = events_rx.try_next() {
                        self.handle_assistant_event(&session_id, event).await;
                    }
                    break result?;
                }
                event = events_rx.next(), if events_open => {
                    match event {
                        Some(event) => self.handle_assistant_event(&session_id, event).await,
                        None => events_open = false,
                    }
                }
            }
        };
        Ok(stop_reason)
    }

    async fn handle_assistant_event(&self, session_id: &SessionId, event: AssistantEvent) {
        match event {
            AssistantEvent::MessageChunk(content) => {
                self.proxy
                    .session_update(SessionNotification {
                        session_id: session_id.clone(),
                        update: SessionUpdate::AgentMessageChunk { content },
                    })
                    .ok();
            }
            AssistantEvent::ThoughtChunk(content) => {
                self.proxy
                    .session_update(SessionNotification {
                        session_id: session_id.clone(),
                        update: SessionUpdate::AgentThoughtChunk { content },
                    })
                    .ok();
            }
            AssistantEvent::ToolRequest {
                name,
                parameters,
                reply,
            } => {
                let outcome = self
                    .tools
                    .execute(&name, parameters, Some(session_id))
                    .await;
                reply.send(outcome).ok();
            }
        }
    }

    async fn handle_cancel(self: Arc<Self>, ctx: RequestCtx) -> Result<(), Error> {
        let notification: CancelNotification = ctx.parse()?;
        self.sessions.cancel_session(&notification.session_id).await;
        Ok(())
    }
}

fn to_value(value: impl serde::Serialize) -> Result<Value, Error> {
    serde_json::to_value(value).map_err(Error::into_internal_error)
}
