//! The seam to the upstream coding assistant.
//!
//! The assistant process itself is an external collaborator; the core
//! only drives it through this interface: check its version and auth
//! state, run prompt turns that stream events back, and shut it down.

use std::path::PathBuf;

use async_trait::async_trait;
use futures::channel::{mpsc::UnboundedSender, oneshot};
use serde_json::Value;

use crate::{
    ContentBlock, Error, SessionId,
    agent::{PromptCapabilities, SessionModeId, StopReason},
    tools::ToolOutcome,
};

/// Everything the assistant needs to run one prompt turn.
#[derive(Debug, Clone)]
pub struct BridgeTurn {
    pub session_id: SessionId,
    pub cwd: PathBuf,
    pub mode: SessionModeId,
    /// Mode-specific system prompt, when the catalog declares one.
    pub system_prompt: Option<String>,
    pub prompt: Vec<ContentBlock>,
}

/// What the assistant streams while a turn runs.
pub enum AssistantEvent {
    /// A chunk of the assistant's visible response.
    MessageChunk(ContentBlock),
    /// A chunk of the assistant's reasoning.
    ThoughtChunk(ContentBlock),
    /// The assistant wants a tool run; the outcome goes back through
    /// `reply`.
    ToolRequest {
        name: String,
        parameters: Value,
        reply: oneshot::Sender<ToolOutcome>,
    },
}

/// The upstream assistant process.
#[async_trait]
pub trait AssistantBridge: Send + Sync {
    /// The assistant's version string, for diagnostics.
    async fn version(&self) -> Result<String, Error>;

    /// Whether the assistant is authenticated and ready.
    async fn check_auth(&self) -> Result<bool, Error>;

    /// Runs one prompt turn, streaming events into `events` until the
    /// returned stop reason. Dropping the future abandons the turn.
    async fn prompt_turn(
        &self,
        turn: BridgeTurn,
        events: UnboundedSender<AssistantEvent>,
    ) -> Result<StopReason, Error>;

    /// Shuts the assistant down.
    async fn close(&self) -> Result<(), Error>;

    /// What the assistant accepts inside prompts.
    fn prompt_capabilities(&self) -> PromptCapabilities {
        PromptCapabilities {
            image: false,
            audio: false,
            embedded_context: true,
        }
    }
}
