//! Tool registry and dispatcher.
//!
//! Providers contribute named tools; the dispatcher validates parameters,
//! derives the presentation (kind, title, locations) for the tool-call
//! lifecycle, runs the handler, and folds every failure into a structured
//! outcome. Handlers never take the process down: thrown errors become
//! `{success: false, error}` results.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    SessionId,
    tool_call::{
        Diff, ToolCallContent, ToolCallId, ToolCallLocation, ToolCallManager, ToolCallPatch,
        ToolCallReport, ToolCallStatus, ToolKind,
    },
};

/// The structured result of one tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ToolOutcome {
    pub fn success(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            metadata: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Tool execution failures that did not produce a structured outcome.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),
    #[error("Invalid parameters for {name}: {detail}")]
    InvalidParameters { name: String, detail: String },
    #[error("Tool '{tool}' failed: {message}")]
    Failed {
        tool: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ToolError {
    pub fn failed(tool: impl Into<String>, message: impl Into<String>) -> Self {
        ToolError::Failed {
            tool: tool.into(),
            message: message.into(),
            source: None,
        }
    }
}

pub type ToolHandlerFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<ToolOutcome, ToolError>> + Send + Sync>;

/// A named, validated capability.
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// JSON-Schema-style parameter description:
    /// `{"type": "object", "properties": {..}, "required": [..]}`.
    pub parameters: Value,
    pub handler: ToolHandlerFn,
}

impl Tool {
    pub fn new<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> BoxFuture<'static, Result<ToolOutcome, ToolError>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(handler),
        }
    }
}

/// A source of tools. Providers may yield zero tools until they learn the
/// client's capabilities; the registry re-indexes on demand.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn tools(&self) -> Vec<Tool>;
    async fn cleanup(&self) {}
}

/// Advertised dispatcher surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryCapabilities {
    pub tools: Vec<String>,
    pub providers: Vec<String>,
    /// True iff `read_file` or `write_file` is currently indexed.
    pub filesystem: bool,
    /// True iff the upstream assistant's provider is registered.
    pub assistant: bool,
}

pub struct ToolRegistry {
    providers: Mutex<Vec<Arc<dyn ToolProvider>>>,
    index: Mutex<HashMap<String, Tool>>,
    tool_calls: Arc<ToolCallManager>,
}

impl ToolRegistry {
    pub fn new(tool_calls: Arc<ToolCallManager>) -> Self {
        Self {
            providers: Mutex::new(Vec::new()),
            index: Mutex::new(HashMap::new()),
            tool_calls,
        }
    }

    pub fn register_provider(&self, provider: Arc<dyn ToolProvider>) {
        self.providers.lock().push(provider);
        self.refresh();
    }

    /// Rebuilds the flat name index from every provider. Call after a
    /// provider's tool set changes (e.g. client capabilities arrived).
    pub fn refresh(&self) {
        let providers = self.providers.lock().clone();
        let mut index = HashMap::new();
        for provider in providers {
            for tool in provider.tools() {
                if index.insert(tool.name.clone(), tool).is_some() {
                    log::warn!("duplicate tool name registered; later provider wins");
                }
            }
        }
        *self.index.lock() = index;
    }

    pub fn get(&self, name: &str) -> Option<Tool> {
        self.index.lock().get(name).cloned()
    }

    pub fn capabilities(&self) -> RegistryCapabilities {
        let index = self.index.lock();
        let mut tools: Vec<String> = index.keys().cloned().collect();
        tools.sort();
        let filesystem = index.contains_key("read_file") || index.contains_key("write_file");
        drop(index);

        let providers_guard = self.providers.lock();
        let providers: Vec<String> = providers_guard
            .iter()
            .map(|provider| provider.name().to_string())
            .collect();
        let assistant = providers_guard
            .iter()
            .any(|provider| provider.name() == "assistant");
        drop(providers_guard);

        RegistryCapabilities {
            tools,
            providers,
            filesystem,
            assistant,
        }
    }

    /// Runs every provider's cleanup and drops the index.
    pub async fn cleanup(&self) {
        let providers = std::mem::take(&mut *self.providers.lock());
        for provider in providers {
            provider.cleanup().await;
        }
        self.index.lock().clear();
    }

    /// Executes a tool by name.
    ///
    /// With a session in scope the call is reported through the tool-call
    /// manager (`pending → in_progress → completed | failed`) and
    /// `_sessionId` is injected into the handler's params. All failures
    /// come back as structured outcomes carrying `{toolName, duration,
    /// executedAt}` metadata, plus `toolCallId` once one was issued.
    pub async fn execute(
        &self,
        name: &str,
        parameters: Value,
        session_id: Option<&SessionId>,
    ) -> ToolOutcome {
        let started = Instant::now();
        let executed_at = epoch_ms();

        let Some(tool) = self.get(name) else {
            return finish(
                ToolOutcome::failure(ToolError::NotFound(name.to_string()).to_string()),
                name,
                started,
                executed_at,
                None,
            );
        };

        if let Err(err) = validate_parameters(name, &tool.parameters, &parameters) {
            return finish(
                ToolOutcome::failure(err.to_string()),
                name,
                started,
                executed_at,
                None,
            );
        }

        let report = session_id.map(|session_id| {
            let id = self.tool_calls.report(
                session_id,
                name,
                ToolCallReport {
                    title: derive_title(name, &parameters),
                    kind: derive_kind(name),
                    status: ToolCallStatus::Pending,
                    raw_input: Some(parameters.clone()),
                    locations: derive_locations(&parameters),
                },
            );
            self.tool_calls.update(
                session_id,
                &id,
                ToolCallPatch {
                    status: Some(ToolCallStatus::InProgress),
                    ..Default::default()
                },
            );
            (session_id.clone(), id)
        });

        let mut handler_params = parameters;
        if let (Some(session_id), Some(object)) = (session_id, handler_params.as_object_mut()) {
            object.insert(
                "_sessionId".to_string(),
                Value::String(session_id.to_string()),
            );
        }

        let outcome = match (tool.handler)(handler_params).await {
            Ok(outcome) => outcome,
            Err(err) => ToolOutcome::failure(err.to_string()),
        };

        if let Some((session_id, id)) = &report {
            if outcome.success {
                let content = outcome.metadata.as_ref().and_then(diffs_to_content);
                self.tool_calls
                    .complete(session_id, id, content, outcome.result.clone());
            } else {
                let message = outcome.error.as_deref().unwrap_or("tool failed");
                self.tool_calls
                    .fail(session_id, id, message, outcome.result.clone());
            }
        }

        finish(
            outcome,
            name,
            started,
            executed_at,
            report.map(|(_, id)| id),
        )
    }
}

fn finish(
    mut outcome: ToolOutcome,
    name: &str,
    started: Instant,
    executed_at: u128,
    tool_call_id: Option<ToolCallId>,
) -> ToolOutcome {
    let mut metadata = match outcome.metadata.take() {
        Some(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    metadata.insert("toolName".to_string(), Value::String(name.to_string()));
    metadata.insert(
        "duration".to_string(),
        Value::from(started.elapsed().as_millis() as u64),
    );
    metadata.insert("executedAt".to_string(), Value::from(executed_at as u64));
    if let Some(id) = tool_call_id {
        metadata.insert("toolCallId".to_string(), Value::String(id.to_string()));
    }
    outcome.metadata = Some(Value::Object(metadata));
    outcome
}

fn epoch_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Checks the params object against the tool's declared schema: the value
/// must be an object and every `required` key must be present and
/// non-null.
fn validate_parameters(name: &str, schema: &Value, params: &Value) -> Result<(), ToolError> {
    let Some(params) = params.as_object() else {
        return Err(ToolError::InvalidParameters {
            name: name.to_string(),
            detail: format!("expected an object, got {}", json_type_name(params)),
        });
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            match params.get(key) {
                None | Some(Value::Null) => {
                    return Err(ToolError::MissingParameter(key.to_string()));
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The fixed tool-name → kind mapping.
pub fn derive_kind(name: &str) -> ToolKind {
    match name {
        "read_file" | "copy_file" | "list_directory" | "get_file_info" | "analyze_code"
        | "get_project_info" => ToolKind::Read,
        "write_file" | "append_file" | "create_file" | "patch_file" | "apply_code_changes" => {
            ToolKind::Edit
        }
        "delete_file" | "remove_file" | "remove_directory" => ToolKind::Delete,
        "move_file" | "rename_file" => ToolKind::Move,
        "search_codebase" | "search_files" | "grep" | "find_files" | "find_references"
        | "find_definitions" => ToolKind::Search,
        "run_tests" | "run_command" | "execute_command" | "run_script" | "shell" => {
            ToolKind::Execute
        }
        "fetch_url" | "http_request" | "download_file" | "api_request" | "web_search" => {
            ToolKind::Fetch
        }
        "think" | "reason" | "plan" | "analyze" | "explain_code" => ToolKind::Think,
        "switch_mode" | "set_mode" | "change_mode" => ToolKind::SwitchMode,
        _ => ToolKind::Other,
    }
}

/// Human-readable title for the tool call, from well-known params.
pub fn derive_title(name: &str, params: &Value) -> String {
    let str_param = |key: &str| params.get(key).and_then(Value::as_str);
    let path = || str_param("path").unwrap_or("?");
    match name {
        "read_file" => format!("Reading file: {}", path()),
        "write_file" => format!("Writing file: {}", path()),
        "create_file" => format!("Creating file: {}", path()),
        "append_file" => format!("Appending to file: {}", path()),
        "patch_file" | "apply_code_changes" => format!("Editing file: {}", path()),
        "delete_file" | "remove_file" => format!("Deleting file: {}", path()),
        "remove_directory" => format!("Removing directory: {}", path()),
        "copy_file" | "move_file" | "rename_file" => {
            let source = str_param("source")
                .or_else(|| str_param("sourcePath"))
                .or_else(|| str_param("path"))
                .unwrap_or("?");
            let destination = str_param("destination")
                .or_else(|| str_param("destinationPath"))
                .unwrap_or("?");
            let verb = if name == "copy_file" { "Copying" } else { "Moving" };
            format!("{verb} {source} to {destination}")
        }
        "search_codebase" | "search_files" | "grep" | "find_files" | "find_references"
        | "find_definitions" => {
            let query = str_param("query")
                .or_else(|| str_param("pattern"))
                .unwrap_or("?");
            format!("Searching: {query}")
        }
        "run_command" | "execute_command" | "run_script" | "shell" => {
            format!("$ {}", str_param("command").unwrap_or("?"))
        }
        "run_tests" => "Running tests".to_string(),
        "fetch_url" | "http_request" | "download_file" | "api_request" => {
            format!("Fetching: {}", str_param("url").unwrap_or("?"))
        }
        "web_search" => format!("Searching the web: {}", str_param("query").unwrap_or("?")),
        "think" | "reason" | "plan" | "analyze" => "Thinking".to_string(),
        "explain_code" => format!("Explaining: {}", path()),
        "switch_mode" | "set_mode" | "change_mode" => {
            let mode = str_param("mode")
                .or_else(|| str_param("modeId"))
                .unwrap_or("?");
            format!("Switching mode: {mode}")
        }
        _ => format!("Running {name}"),
    }
}

/// Extracts file locations from well-known params.
pub fn derive_locations(params: &Value) -> Vec<ToolCallLocation> {
    let mut locations = Vec::new();
    let mut push = |path: &str| {
        locations.push(ToolCallLocation {
            path: PathBuf::from(path),
            line: None,
        })
    };

    for key in ["path", "source", "sourcePath", "destination", "destinationPath"] {
        if let Some(path) = params.get(key).and_then(Value::as_str) {
            push(path);
        }
    }
    if let Some(files) = params.get("files").and_then(Value::as_array) {
        for file in files.iter().filter_map(Value::as_str) {
            push(file);
        }
    }
    locations
}

/// Converts a handler's `metadata.diffs` list into diff content blocks.
///
/// The entry shape belongs to the upstream assistant; beyond "a list of
/// objects with path/old/new-ish keys" it is treated as opaque.
pub fn diffs_to_content(metadata: &Value) -> Option<Vec<ToolCallContent>> {
    let diffs = metadata.get("diffs")?.as_array()?;
    let content: Vec<ToolCallContent> = diffs
        .iter()
        .filter_map(|entry| {
            let path = entry
                .get("path")
                .or_else(|| entry.get("file"))
                .or_else(|| entry.get("filePath"))
                .and_then(Value::as_str)?;
            let old_text = entry
                .get("oldText")
                .or_else(|| entry.get("old_text"))
                .or_else(|| entry.get("oldString"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let new_text = entry
                .get("newText")
                .or_else(|| entry.get("new_text"))
                .or_else(|| entry.get("newString"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Some(ToolCallContent::Diff {
                diff: Diff {
                    path: PathBuf::from(path),
                    old_text,
                    new_text,
                },
            })
        })
        .collect();
    if content.is_empty() { None } else { Some(content) }
}
