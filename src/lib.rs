//! An adapter exposing an external coding assistant to editors over the
//! Agent Client Protocol (ACP).
//!
//! The crate is the protocol engine plus the concurrent runtime around
//! it: a bidirectional JSON-RPC 2.0 multiplexer over newline-delimited
//! JSON (stdio) or one-shot HTTP exchanges, a session layer with modes
//! and cancellation fan-out, a tool registry with a published call
//! lifecycle, client-hosted terminals under policy, a connection pool,
//! and an extension registry for `_namespaced` methods.
//!
//! The pieces compose without global state: construct an [`Adapter`]
//! around an [`AssistantBridge`], then [`Adapter::serve`] a byte-stream
//! transport or [`Adapter::handle_one_shot`] an HTTP body.

mod adapter;
pub mod agent;
mod bridge;
pub mod client;
mod content;
mod error;
pub mod exec;
mod ext;
pub mod fs;
mod permission;
pub mod pool;
mod rpc;
mod session;
mod stream;
pub mod terminal;
mod tool_call;
pub mod tools;
pub mod transport;

#[cfg(test)]
mod adapter_tests;

pub use adapter::{Adapter, AdapterConfig};
pub use agent::{
    AgentCapabilities, AuthMethod, AuthMethodId, CancelNotification, InitializeRequest,
    InitializeResponse, LoadSessionRequest, LoadSessionResponse, NewSessionRequest,
    NewSessionResponse, PromptCapabilities, PromptRequest, PromptResponse, ProtocolVersion,
    SessionId, SessionModeId, SessionModeInfo, SessionModeState, SetSessionModeRequest,
    SetSessionModeResponse, StopReason, VERSION,
};
pub use bridge::{AssistantBridge, AssistantEvent, BridgeTurn};
pub use client::{
    ClientCapabilities, ClientProxy, FileSystemCapability, PermissionOption, PermissionOptionId,
    PermissionOptionKind, RequestPermissionOutcome, RequestPermissionRequest,
    RequestPermissionResponse, SessionNotification, SessionUpdate, TerminalExitStatus, TerminalId,
};
pub use content::{Annotations, ContentBlock, ImageContent, ResourceLink, Role, TextContent};
pub use error::{Error, ErrorCode};
pub use ext::ExtensionRegistry;
pub use permission::{DEFAULT_PERMISSION_TIMEOUT, PermissionBroker, PermissionFrontend};
pub use rpc::{
    CancellationRegistry, MethodRegistry, RequestCtx, RpcConnection, RpcHandler, parse_params,
};
pub use session::{
    CancelOutcome, DEFAULT_MODE, PermissionBehavior, Session, SessionManager, SessionMode,
    default_mode_catalog, validate_cwd,
};
pub use stream::{StreamMessage, StreamMessageContent, StreamMessageDirection, StreamReceiver};
pub use tool_call::{
    ActiveToolCall, DEFAULT_TOOL_CALL_RETENTION, Diff, SessionUpdateSink, ToolCall, ToolCallContent,
    ToolCallId, ToolCallLocation, ToolCallManager, ToolCallPatch, ToolCallReport, ToolCallStatus,
    ToolCallUpdate, ToolCallUpdateFields, ToolKind,
};
