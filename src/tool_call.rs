//! Tool-call types and the lifecycle manager that publishes them.
//!
//! Every tool call moves `pending → in_progress → completed | failed`, and
//! each transition surfaces to the client as a `session/update`
//! notification. The manager keeps terminal entries readable for a short
//! inspection window before evicting them.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering::Relaxed},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    ContentBlock, Error, SessionId, TextContent,
    client::{ClientProxy, SessionNotification, SessionUpdate},
};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(rename = "toolCallId")]
    pub id: ToolCallId,
    pub title: String,
    pub kind: ToolKind,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ToolCallContent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<ToolCallLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallUpdate {
    #[serde(rename = "toolCallId")]
    pub id: ToolCallId,
    #[serde(flatten)]
    pub fields: ToolCallUpdateFields,
}

/// Only the fields being changed; everything else stays absent on the wire.
#[derive(Default, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallUpdateFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ToolKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ToolCallStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ToolCallContent>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<ToolCallLocation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ToolCallId(pub Arc<str>);

impl std::fmt::Display for ToolCallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Read,
    Edit,
    Delete,
    Move,
    Search,
    Execute,
    Think,
    Fetch,
    SwitchMode,
    Other,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    /// The tool call has been reported but has not started running.
    Pending,
    /// The tool call is currently running.
    InProgress,
    /// The tool call completed successfully.
    Completed,
    /// The tool call failed.
    Failed,
}

impl ToolCallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ToolCallStatus::Completed | ToolCallStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolCallContent {
    Content {
        content: ContentBlock,
    },
    Diff {
        #[serde(flatten)]
        diff: Diff,
    },
    /// Points at a live terminal whose output the client streams itself.
    #[serde(rename_all = "camelCase")]
    Terminal {
        terminal_id: crate::client::TerminalId,
    },
}

impl<T: Into<ContentBlock>> From<T> for ToolCallContent {
    fn from(content: T) -> Self {
        ToolCallContent::Content {
            content: content.into(),
        }
    }
}

impl From<Diff> for ToolCallContent {
    fn from(diff: Diff) -> Self {
        ToolCallContent::Diff { diff }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Diff {
    pub path: PathBuf,
    pub old_text: Option<String>,
    pub new_text: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallLocation {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

// Lifecycle manager

/// Where lifecycle notifications go. The RPC client proxy is the
/// production sink; tests collect into memory.
pub trait SessionUpdateSink: Send + Sync {
    fn send_update(&self, notification: SessionNotification) -> Result<(), Error>;
}

impl SessionUpdateSink for ClientProxy {
    fn send_update(&self, notification: SessionNotification) -> Result<(), Error> {
        self.session_update(notification)
    }
}

/// A tracked call, kept while active and for a short window after it
/// reaches a terminal status.
#[derive(Debug, Clone)]
pub struct ActiveToolCall {
    pub id: ToolCallId,
    pub session_id: SessionId,
    pub tool_name: String,
    pub title: String,
    pub kind: ToolKind,
    pub status: ToolCallStatus,
    pub raw_input: Option<serde_json::Value>,
    pub raw_output: Option<serde_json::Value>,
    pub locations: Vec<ToolCallLocation>,
    pub started_at: SystemTime,
    pub ended_at: Option<SystemTime>,
}

/// Fields for the initial report of a call.
#[derive(Debug, Clone)]
pub struct ToolCallReport {
    pub title: String,
    pub kind: ToolKind,
    pub status: ToolCallStatus,
    pub raw_input: Option<serde_json::Value>,
    pub locations: Vec<ToolCallLocation>,
}

impl ToolCallReport {
    pub fn new(title: impl Into<String>, kind: ToolKind) -> Self {
        Self {
            title: title.into(),
            kind,
            status: ToolCallStatus::Pending,
            raw_input: None,
            locations: Vec::new(),
        }
    }
}

/// Fields for a subsequent update; only set fields are published.
#[derive(Default, Debug, Clone)]
pub struct ToolCallPatch {
    pub title: Option<String>,
    pub status: Option<ToolCallStatus>,
    pub content: Option<Vec<ToolCallContent>>,
    pub locations: Option<Vec<ToolCallLocation>>,
    pub raw_output: Option<serde_json::Value>,
}

pub struct ToolCallManager {
    sink: Arc<dyn SessionUpdateSink>,
    active: Arc<Mutex<HashMap<ToolCallId, ActiveToolCall>>>,
    counter: AtomicU64,
    /// How long terminal entries stay readable before eviction.
    retention: Duration,
}

pub const DEFAULT_TOOL_CALL_RETENTION: Duration = Duration::from_secs(30);

impl ToolCallManager {
    pub fn new(sink: Arc<dyn SessionUpdateSink>) -> Self {
        Self::with_retention(sink, DEFAULT_TOOL_CALL_RETENTION)
    }

    pub fn with_retention(sink: Arc<dyn SessionUpdateSink>, retention: Duration) -> Self {
        Self {
            sink,
            active: Arc::default(),
            counter: AtomicU64::new(0),
            retention,
        }
    }

    /// Reports a new tool call and emits the `tool_call` update.
    pub fn report(
        &self,
        session_id: &SessionId,
        tool_name: &str,
        report: ToolCallReport,
    ) -> ToolCallId {
        let id = self.next_id(tool_name);
        let call = ActiveToolCall {
            id: id.clone(),
            session_id: session_id.clone(),
            tool_name: tool_name.to_string(),
            title: report.title.clone(),
            kind: report.kind,
            status: report.status,
            raw_input: report.raw_input.clone(),
            raw_output: None,
            locations: report.locations.clone(),
            started_at: SystemTime::now(),
            ended_at: None,
        };
        self.active.lock().insert(id.clone(), call);

        self.emit(
            session_id,
            SessionUpdate::ToolCall(ToolCall {
                id: id.clone(),
                title: report.title,
                kind: report.kind,
                status: report.status,
                content: Vec::new(),
                locations: report.locations,
                raw_input: report.raw_input,
            }),
        );
        if report.status.is_terminal() {
            self.schedule_eviction(&id);
        }
        id
    }

    /// Applies a patch and emits a `tool_call_update` carrying only the
    /// changed fields. Updates against a terminal call are no-ops.
    pub fn update(&self, session_id: &SessionId, id: &ToolCallId, patch: ToolCallPatch) {
        let mut reached_terminal = false;
        {
            let mut active = self.active.lock();
            let Some(call) = active.get_mut(id) else {
                log::debug!("update for unknown tool call {id}");
                return;
            };
            if call.status.is_terminal() {
                return;
            }
            if call.session_id != *session_id {
                log::error!("tool call {id} updated from a different session, ignoring");
                return;
            }
            if let Some(title) = &patch.title {
                call.title = title.clone();
            }
            if let Some(status) = patch.status {
                call.status = status;
                if status.is_terminal() {
                    call.ended_at = Some(SystemTime::now());
                    reached_terminal = true;
                }
            }
            if let Some(locations) = &patch.locations {
                call.locations = locations.clone();
            }
            if let Some(raw_output) = &patch.raw_output {
                call.raw_output = Some(raw_output.clone());
            }
        }

        self.emit(
            session_id,
            SessionUpdate::ToolCallUpdate(ToolCallUpdate {
                id: id.clone(),
                fields: ToolCallUpdateFields {
                    kind: None,
                    status: patch.status,
                    title: patch.title,
                    content: patch.content,
                    locations: patch.locations,
                    raw_output: patch.raw_output,
                },
            }),
        );
        if reached_terminal {
            self.schedule_eviction(id);
        }
    }

    pub fn complete(
        &self,
        session_id: &SessionId,
        id: &ToolCallId,
        content: Option<Vec<ToolCallContent>>,
        raw_output: Option<serde_json::Value>,
    ) {
        self.update(
            session_id,
            id,
            ToolCallPatch {
                status: Some(ToolCallStatus::Completed),
                content,
                raw_output,
                ..Default::default()
            },
        );
    }

    pub fn fail(
        &self,
        session_id: &SessionId,
        id: &ToolCallId,
        error: &str,
        raw_output: Option<serde_json::Value>,
    ) {
        let content = vec![ToolCallContent::Content {
            content: ContentBlock::Text(TextContent {
                annotations: None,
                text: format!("Error: {error}"),
            }),
        }];
        self.update(
            session_id,
            id,
            ToolCallPatch {
                status: Some(ToolCallStatus::Failed),
                content: Some(content),
                raw_output,
                ..Default::default()
            },
        );
    }

    /// Fails every non-terminal call of the session. Returns how many
    /// calls were transitioned.
    pub fn cancel_session(&self, session_id: &SessionId) -> usize {
        let ids: Vec<ToolCallId> = self
            .active
            .lock()
            .values()
            .filter(|call| call.session_id == *session_id && !call.status.is_terminal())
            .map(|call| call.id.clone())
            .collect();
        for id in &ids {
            self.update(
                session_id,
                id,
                ToolCallPatch {
                    status: Some(ToolCallStatus::Failed),
                    title: Some("Cancelled by user".to_string()),
                    ..Default::default()
                },
            );
        }
        ids.len()
    }

    /// Snapshot of a tracked call, including recently finished ones still
    /// inside the inspection window.
    pub fn get(&self, id: &ToolCallId) -> Option<ActiveToolCall> {
        self.active.lock().get(id).cloned()
    }

    /// Ids of the session's calls that have not reached a terminal status.
    pub fn active_calls(&self, session_id: &SessionId) -> Vec<ToolCallId> {
        self.active
            .lock()
            .values()
            .filter(|call| call.session_id == *session_id && !call.status.is_terminal())
            .map(|call| call.id.clone())
            .collect()
    }

    pub fn tracked_count(&self) -> usize {
        self.active.lock().len()
    }

    fn next_id(&self, tool_name: &str) -> ToolCallId {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let counter = self.counter.fetch_add(1, Relaxed);
        ToolCallId(format!("tool_{tool_name}_{epoch_ms}_{counter}").into())
    }

    fn emit(&self, session_id: &SessionId, update: SessionUpdate) {
        // Notifications are best-effort; a failed send never fails the call.
        if let Err(err) = self.sink.send_update(SessionNotification {
            session_id: session_id.clone(),
            update,
        }) {
            log::error!("failed to send session update: {err}");
        }
    }

    fn schedule_eviction(&self, id: &ToolCallId) {
        let active = self.active.clone();
        let id = id.clone();
        let retention = self.retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            active.lock().remove(&id);
        });
    }
}
