//! Session lifecycle, the mode catalog, and cancellation fan-out.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    Error, ErrorCode, SessionId,
    agent::{SessionModeId, SessionModeInfo, SessionModeState},
    permission::PermissionBroker,
    terminal::TerminalManager,
    tool_call::ToolCallManager,
};

/// How eagerly a mode grants tool permissions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionBehavior {
    Strict,
    Permissive,
    Auto,
}

/// One entry of the fixed mode catalog.
#[derive(Debug, Clone)]
pub struct SessionMode {
    pub id: SessionModeId,
    pub name: String,
    pub description: Option<String>,
    pub permission_behavior: PermissionBehavior,
    /// Provider names visible in this mode; `None` means everything.
    pub available_tools: Option<Vec<String>>,
    pub system_prompt: Option<String>,
}

impl SessionMode {
    pub fn info(&self) -> SessionModeInfo {
        SessionModeInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }
}

/// The catalog every session draws from. Tool visibility grows
/// monotonically: `ask ⊆ plan ⊆ agent`.
pub fn default_mode_catalog() -> Vec<SessionMode> {
    vec![
        SessionMode {
            id: SessionModeId::from("ask"),
            name: "Ask".to_string(),
            description: Some("Answer questions without touching the workspace".to_string()),
            permission_behavior: PermissionBehavior::Strict,
            available_tools: Some(vec![]),
            system_prompt: None,
        },
        SessionMode {
            id: SessionModeId::from("plan"),
            name: "Plan".to_string(),
            description: Some("Read the workspace and draft changes".to_string()),
            permission_behavior: PermissionBehavior::Strict,
            available_tools: Some(vec!["filesystem".to_string()]),
            system_prompt: None,
        },
        SessionMode {
            id: SessionModeId::from("agent"),
            name: "Agent".to_string(),
            description: Some("Edit files and run commands".to_string()),
            permission_behavior: PermissionBehavior::Strict,
            available_tools: Some(vec!["filesystem".to_string(), "terminal".to_string()]),
            system_prompt: None,
        },
    ]
}

pub const DEFAULT_MODE: &str = "ask";

#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub cwd: PathBuf,
    pub name: Option<String>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    pub mode: SessionModeId,
    /// Assistant-specific state carried across turns, opaque to the core.
    pub scratch: Value,
}

/// What a cancellation actually reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelOutcome {
    pub tool_calls_failed: usize,
    pub permissions_cancelled: usize,
    pub terminals_released: usize,
}

pub struct SessionManager {
    sessions: Mutex<HashMap<SessionId, Session>>,
    catalog: Vec<SessionMode>,
    tool_calls: Arc<ToolCallManager>,
    permissions: Arc<PermissionBroker>,
    terminals: Arc<TerminalManager>,
}

impl SessionManager {
    pub fn new(
        tool_calls: Arc<ToolCallManager>,
        permissions: Arc<PermissionBroker>,
        terminals: Arc<TerminalManager>,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            catalog: default_mode_catalog(),
            tool_calls,
            permissions,
            terminals,
        }
    }

    pub fn catalog(&self) -> &[SessionMode] {
        &self.catalog
    }

    pub fn mode_infos(&self) -> Vec<SessionModeInfo> {
        self.catalog.iter().map(SessionMode::info).collect()
    }

    pub fn mode(&self, id: &SessionModeId) -> Option<&SessionMode> {
        self.catalog.iter().find(|mode| mode.id == *id)
    }

    pub fn create_session(
        &self,
        cwd: PathBuf,
        name: Option<String>,
        mode: Option<SessionModeId>,
    ) -> Result<Session, Error> {
        if !is_absolute_path(&cwd) {
            return Err(invalid_cwd_path());
        }
        let mode = mode.unwrap_or_else(|| SessionModeId::from(DEFAULT_MODE));
        if self.mode(&mode).is_none() {
            return Err(unknown_mode(&mode));
        }

        let now = SystemTime::now();
        let session = Session {
            id: SessionId(format!("sess_{}", Uuid::new_v4()).into()),
            cwd,
            name,
            created_at: now,
            updated_at: now,
            mode,
            scratch: Value::Null,
        };
        self.sessions
            .lock()
            .insert(session.id.clone(), session.clone());
        log::info!("created session {} in {}", session.id, session.cwd.display());
        Ok(session)
    }

    /// Rehydrates a session under a known id: returns the live one when
    /// present, otherwise recreates it fresh in the given directory.
    pub fn load_session(&self, id: &SessionId, cwd: PathBuf) -> Result<Session, Error> {
        if !is_absolute_path(&cwd) {
            return Err(invalid_cwd_path());
        }
        if let Some(session) = self.sessions.lock().get(id) {
            return Ok(session.clone());
        }

        let now = SystemTime::now();
        let session = Session {
            id: id.clone(),
            cwd,
            name: None,
            created_at: now,
            updated_at: now,
            mode: SessionModeId::from(DEFAULT_MODE),
            scratch: Value::Null,
        };
        self.sessions
            .lock()
            .insert(session.id.clone(), session.clone());
        log::info!("rehydrated session {id}");
        Ok(session)
    }

    pub fn get_session(&self, id: &SessionId) -> Option<Session> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Switches the session's mode, returning the previous mode id.
    pub fn set_session_mode(
        &self,
        id: &SessionId,
        mode_id: SessionModeId,
    ) -> Result<SessionModeId, Error> {
        if self.mode(&mode_id).is_none() {
            return Err(unknown_mode(&mode_id));
        }
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(id) else {
            return Err(unknown_session(id));
        };
        let previous = std::mem::replace(&mut session.mode, mode_id);
        session.updated_at = SystemTime::now();
        Ok(previous)
    }

    /// Marks activity on a session.
    pub fn touch(&self, id: &SessionId) {
        if let Some(session) = self.sessions.lock().get_mut(id) {
            session.updated_at = SystemTime::now();
        }
    }

    pub fn mode_state(&self, session: &Session) -> SessionModeState {
        SessionModeState {
            current_mode_id: session.mode.clone(),
            available_modes: self.mode_infos(),
        }
    }

    /// Best-effort cancellation fan-out: fail the session's live tool
    /// calls, resolve its pending permission requests, release its
    /// terminals. Safe to call for unknown sessions.
    pub async fn cancel_session(&self, id: &SessionId) -> CancelOutcome {
        let outcome = CancelOutcome {
            tool_calls_failed: self.tool_calls.cancel_session(id),
            permissions_cancelled: self.permissions.cancel_session(id),
            terminals_released: self.terminals.release_session_terminals(id).await,
        };
        self.touch(id);
        log::info!(
            "cancelled session {id}: {} tool calls, {} permissions, {} terminals",
            outcome.tool_calls_failed,
            outcome.permissions_cancelled,
            outcome.terminals_released,
        );
        outcome
    }
}

fn unknown_mode(mode: &SessionModeId) -> Error {
    Error::new((
        ErrorCode::INVALID_PARAMS.code,
        format!("unknown mode: {mode}"),
    ))
}

fn unknown_session(id: &SessionId) -> Error {
    Error::new((
        ErrorCode::INVALID_PARAMS.code,
        format!("unknown session: {id}"),
    ))
}

fn invalid_cwd_path() -> Error {
    Error::new((
        ErrorCode::INVALID_PARAMS.code,
        "cwd must be an absolute path".to_string(),
    ))
}

/// Unix absolute (`/…`) or Windows absolute (`X:\…` or `X:/…`).
fn is_absolute_str(path: &str) -> bool {
    if path.starts_with('/') {
        return true;
    }
    let bytes = path.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'/' || bytes[2] == b'\\')
}

fn is_absolute_path(path: &Path) -> bool {
    path.to_str().is_some_and(is_absolute_str)
}

/// Pulls `cwd` out of raw request params, enforcing the wire contract:
/// wrong type and wrong shape produce distinct `-32602` messages.
pub fn validate_cwd(params: Option<&Value>) -> Result<PathBuf, Error> {
    let cwd = params.and_then(|params| params.get("cwd"));
    match cwd {
        Some(Value::String(path)) if is_absolute_str(path) => Ok(PathBuf::from(path)),
        Some(Value::String(_)) => Err(invalid_cwd_path()),
        _ => Err(Error::new((
            ErrorCode::INVALID_PARAMS.code,
            "cwd must be a string".to_string(),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::{TerminalPolicy, tests::manager_with};
    use crate::tool_call::tests::CollectorSink;
    use serde_json::json;

    fn sessions() -> SessionManager {
        let sink = Arc::new(CollectorSink::default());
        let tool_calls = Arc::new(ToolCallManager::new(sink));
        let permissions = Arc::new(PermissionBroker::new());
        let (_, terminals) = manager_with(TerminalPolicy::default());
        SessionManager::new(tool_calls, permissions, Arc::new(terminals))
    }

    #[tokio::test]
    async fn create_requires_an_absolute_cwd() {
        let manager = sessions();
        let err = manager
            .create_session(PathBuf::from("relative/path"), None, None)
            .unwrap_err();
        assert!(err.message.contains("cwd must be an absolute path"));

        let session = manager
            .create_session(PathBuf::from("/work"), None, None)
            .unwrap();
        assert_eq!(session.mode, SessionModeId::from("ask"));
        assert!(session.updated_at >= session.created_at);
    }

    #[tokio::test]
    async fn set_mode_validates_and_returns_previous() {
        let manager = sessions();
        let session = manager
            .create_session(PathBuf::from("/work"), None, None)
            .unwrap();

        let previous = manager
            .set_session_mode(&session.id, SessionModeId::from("agent"))
            .unwrap();
        assert_eq!(previous, SessionModeId::from("ask"));
        assert_eq!(
            manager.get_session(&session.id).unwrap().mode,
            SessionModeId::from("agent")
        );

        let err = manager
            .set_session_mode(&session.id, SessionModeId::from("yolo"))
            .unwrap_err();
        assert_eq!(err.code, -32602);
    }

    #[tokio::test]
    async fn load_returns_live_sessions_and_rehydrates_unknown_ids() {
        let manager = sessions();
        let created = manager
            .create_session(PathBuf::from("/work"), Some("w".to_string()), None)
            .unwrap();

        let loaded = manager
            .load_session(&created.id, PathBuf::from("/work"))
            .unwrap();
        assert_eq!(loaded.name.as_deref(), Some("w"));

        let rehydrated = manager
            .load_session(&SessionId::from("sess_gone"), PathBuf::from("/elsewhere"))
            .unwrap();
        assert_eq!(rehydrated.cwd, PathBuf::from("/elsewhere"));
        assert_eq!(manager.list_sessions().len(), 2);
    }

    #[test]
    fn mode_catalog_tool_visibility_is_monotonic() {
        let catalog = default_mode_catalog();
        let tools_of = |id: &str| -> Vec<String> {
            catalog
                .iter()
                .find(|mode| mode.id == SessionModeId::from(id))
                .unwrap()
                .available_tools
                .clone()
                .unwrap()
        };
        let ask = tools_of("ask");
        let plan = tools_of("plan");
        let agent = tools_of("agent");
        assert!(ask.iter().all(|tool| plan.contains(tool)));
        assert!(plan.iter().all(|tool| agent.contains(tool)));
    }

    #[test]
    fn cwd_wire_validation_distinguishes_type_and_shape() {
        for path in ["/u/x", "C:\\w", "D:/w"] {
            assert!(
                validate_cwd(Some(&json!({"cwd": path}))).is_ok(),
                "{path} should be accepted"
            );
        }
        for path in ["relative/path", "./x", "../x", ""] {
            let err = validate_cwd(Some(&json!({"cwd": path}))).unwrap_err();
            assert!(err.message.contains("cwd must be an absolute path"), "{path}");
        }
        let err = validate_cwd(Some(&json!({"cwd": 42}))).unwrap_err();
        assert!(err.message.contains("cwd must be a string"));
        let err = validate_cwd(Some(&json!({}))).unwrap_err();
        assert!(err.message.contains("cwd must be a string"));
    }

    #[tokio::test]
    async fn cancel_session_reports_fanned_out_work() {
        use crate::tool_call::{ToolCallReport, ToolKind};

        let sink = Arc::new(CollectorSink::default());
        let tool_calls = Arc::new(ToolCallManager::new(sink));
        let permissions = Arc::new(PermissionBroker::new());
        let (_, terminals) = manager_with(TerminalPolicy::default());
        let terminals = Arc::new(terminals);
        let manager = SessionManager::new(tool_calls.clone(), permissions, terminals.clone());

        let session = manager
            .create_session(PathBuf::from("/work"), None, None)
            .unwrap();
        tool_calls.report(
            &session.id,
            "grep",
            ToolCallReport::new("g", ToolKind::Search),
        );
        terminals
            .create(
                &session.id,
                crate::terminal::CreateTerminalSpec {
                    command: "sleep 100".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let outcome = manager.cancel_session(&session.id).await;
        assert_eq!(
            outcome,
            CancelOutcome {
                tool_calls_failed: 1,
                permissions_cancelled: 0,
                terminals_released: 1,
            }
        );
        assert!(manager.get_session(&session.id).is_some());
    }
}
