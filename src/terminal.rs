//! Client-hosted terminals.
//!
//! The client owns the processes; the adapter holds capability references
//! and enforces policy: which commands may run, how many terminals may be
//! live at once, and how much output a terminal may buffer. A managed
//! handle wraps the client handle so that releasing it also drops the
//! manager's tracking, exactly once.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::SystemTime,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    Error, SessionId,
    client::{
        ClientProxy, CreateTerminalRequest, CreateTerminalResponse, EnvVariable,
        KillTerminalRequest, ReleaseTerminalRequest, TerminalExitStatus, TerminalId,
        TerminalOutputRequest, TerminalOutputResponse, WaitForTerminalExitRequest,
    },
};

/// The terminal operations the client must serve.
#[async_trait]
pub trait TerminalClient: Send + Sync {
    async fn create(&self, request: CreateTerminalRequest)
    -> Result<CreateTerminalResponse, Error>;
    async fn output(&self, request: TerminalOutputRequest) -> Result<TerminalOutputResponse, Error>;
    async fn wait_for_exit(
        &self,
        request: WaitForTerminalExitRequest,
    ) -> Result<TerminalExitStatus, Error>;
    async fn kill(&self, request: KillTerminalRequest) -> Result<(), Error>;
    async fn release(&self, request: ReleaseTerminalRequest) -> Result<(), Error>;
}

#[async_trait]
impl TerminalClient for ClientProxy {
    async fn create(
        &self,
        request: CreateTerminalRequest,
    ) -> Result<CreateTerminalResponse, Error> {
        self.create_terminal(&request).await
    }

    async fn output(
        &self,
        request: TerminalOutputRequest,
    ) -> Result<TerminalOutputResponse, Error> {
        self.terminal_output(&request).await
    }

    async fn wait_for_exit(
        &self,
        request: WaitForTerminalExitRequest,
    ) -> Result<TerminalExitStatus, Error> {
        Ok(self.wait_for_terminal_exit(&request).await?.exit_status)
    }

    async fn kill(&self, request: KillTerminalRequest) -> Result<(), Error> {
        self.kill_terminal(&request).await
    }

    async fn release(&self, request: ReleaseTerminalRequest) -> Result<(), Error> {
        self.release_terminal(&request).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("Terminal capability not supported by client")]
    NotSupported,
    #[error("Invalid command: must be a non-empty string")]
    InvalidCommand,
    #[error("Command contains forbidden pattern: {0}")]
    ForbiddenCommand(String),
    #[error("Command not in allowed list: {0}")]
    CommandNotAllowed(String),
    #[error("Invalid output byte limit: must be non-negative, got {0}")]
    NegativeOutputLimit(i64),
    #[error("Maximum concurrent terminals reached")]
    ConcurrencyLimit,
    #[error("Terminal already released")]
    AlreadyReleased,
    #[error(transparent)]
    Rpc(#[from] Error),
}

impl From<TerminalError> for Error {
    fn from(err: TerminalError) -> Self {
        match err {
            TerminalError::InvalidCommand
            | TerminalError::ForbiddenCommand(_)
            | TerminalError::CommandNotAllowed(_)
            | TerminalError::NegativeOutputLimit(_) => {
                Error::invalid_params().with_data(err.to_string())
            }
            TerminalError::Rpc(err) => err,
            other => Error::internal_error().with_data(other.to_string()),
        }
    }
}

/// What the manager lets through.
#[derive(Debug, Clone)]
pub struct TerminalPolicy {
    /// When set, a command's first token must be in this list.
    pub allowed_commands: Option<Vec<String>>,
    /// Substring matches against the full command string reject it.
    pub forbidden_commands: Vec<String>,
    /// Applied when the caller does not pick a limit.
    pub default_output_byte_limit: u64,
    /// Requests above this are capped (with a warning), not rejected.
    pub max_output_byte_limit: u64,
    pub max_concurrent_terminals: usize,
}

impl Default for TerminalPolicy {
    fn default() -> Self {
        Self {
            allowed_commands: None,
            forbidden_commands: Vec::new(),
            default_output_byte_limit: 1024 * 1024,
            max_output_byte_limit: 10 * 1024 * 1024,
            max_concurrent_terminals: 16,
        }
    }
}

/// What to run. `output_byte_limit` is signed so that out-of-range caller
/// input can be rejected rather than silently wrapped.
#[derive(Debug, Clone, Default)]
pub struct CreateTerminalSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<EnvVariable>,
    pub cwd: Option<PathBuf>,
    pub output_byte_limit: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct TerminalMeta {
    pub session_id: SessionId,
    pub command: String,
    pub args: Vec<String>,
    pub created_at: SystemTime,
    pub last_activity: SystemTime,
}

pub struct TerminalManager {
    client: Arc<dyn TerminalClient>,
    policy: TerminalPolicy,
    supported: AtomicBool,
    active: Arc<Mutex<HashMap<TerminalId, TerminalMeta>>>,
    /// Creations in flight: counted against the concurrency cap before
    /// the client has answered.
    reserved: AtomicUsize,
}

impl TerminalManager {
    pub fn new(client: Arc<dyn TerminalClient>, policy: TerminalPolicy) -> Self {
        Self {
            client,
            policy,
            supported: AtomicBool::new(false),
            active: Arc::default(),
            reserved: AtomicUsize::new(0),
        }
    }

    /// Records whether the client advertised terminal support during
    /// `initialize`.
    pub fn set_supported(&self, supported: bool) {
        self.supported.store(supported, Ordering::SeqCst);
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn session_terminals(&self, session_id: &SessionId) -> Vec<TerminalId> {
        self.active
            .lock()
            .iter()
            .filter(|(_, meta)| meta.session_id == *session_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn meta(&self, id: &TerminalId) -> Option<TerminalMeta> {
        self.active.lock().get(id).cloned()
    }

    /// Bumps a terminal's last-activity timestamp.
    pub fn touch(&self, id: &TerminalId) {
        if let Some(meta) = self.active.lock().get_mut(id) {
            meta.last_activity = SystemTime::now();
        }
    }

    /// Creates a client-hosted terminal after running the policy gauntlet:
    /// capability, command validation, output-byte limits, concurrency cap.
    pub async fn create(
        &self,
        session_id: &SessionId,
        spec: CreateTerminalSpec,
    ) -> Result<ManagedTerminalHandle, TerminalError> {
        if !self.supported.load(Ordering::SeqCst) {
            return Err(TerminalError::NotSupported);
        }

        let command = spec.command.trim();
        if command.is_empty() {
            return Err(TerminalError::InvalidCommand);
        }
        for pattern in &self.policy.forbidden_commands {
            if spec.command.contains(pattern.as_str()) {
                return Err(TerminalError::ForbiddenCommand(pattern.clone()));
            }
        }
        if let Some(allowed) = &self.policy.allowed_commands {
            let first_token = command.split_whitespace().next().unwrap_or_default();
            if !allowed.iter().any(|entry| entry == first_token) {
                return Err(TerminalError::CommandNotAllowed(first_token.to_string()));
            }
        }

        let output_byte_limit = match spec.output_byte_limit {
            Some(limit) if limit < 0 => return Err(TerminalError::NegativeOutputLimit(limit)),
            Some(limit) if limit as u64 > self.policy.max_output_byte_limit => {
                log::warn!(
                    "output byte limit {limit} exceeds the maximum, capping to {}",
                    self.policy.max_output_byte_limit
                );
                self.policy.max_output_byte_limit
            }
            Some(limit) => limit as u64,
            None => self.policy.default_output_byte_limit,
        };

        {
            let active = self.active.lock();
            if active.len() + self.reserved.load(Ordering::SeqCst)
                >= self.policy.max_concurrent_terminals
            {
                return Err(TerminalError::ConcurrencyLimit);
            }
            self.reserved.fetch_add(1, Ordering::SeqCst);
        }

        let request = CreateTerminalRequest {
            session_id: session_id.clone(),
            command: spec.command.clone(),
            args: spec.args.clone(),
            env: spec.env,
            cwd: spec.cwd,
            output_byte_limit: Some(output_byte_limit),
        };
        let created = self.client.create(request).await;
        self.reserved.fetch_sub(1, Ordering::SeqCst);
        let created = created?;

        let now = SystemTime::now();
        self.active.lock().insert(
            created.terminal_id.clone(),
            TerminalMeta {
                session_id: session_id.clone(),
                command: spec.command,
                args: spec.args,
                created_at: now,
                last_activity: now,
            },
        );

        Ok(ManagedTerminalHandle {
            id: created.terminal_id,
            session_id: session_id.clone(),
            client: self.client.clone(),
            active: self.active.clone(),
            released: AtomicBool::new(false),
        })
    }

    /// Releases every terminal the session still holds. Part of the
    /// session-cancel fan-out; release failures are logged, not raised.
    pub async fn release_session_terminals(&self, session_id: &SessionId) -> usize {
        let ids: Vec<TerminalId> = {
            let mut active = self.active.lock();
            let ids: Vec<TerminalId> = active
                .iter()
                .filter(|(_, meta)| meta.session_id == *session_id)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                active.remove(id);
            }
            ids
        };

        for id in &ids {
            let request = ReleaseTerminalRequest {
                session_id: session_id.clone(),
                terminal_id: id.clone(),
            };
            if let Err(err) = self.client.release(request).await {
                log::error!("failed to release terminal {id}: {err}");
            }
        }
        ids.len()
    }
}

/// Wraps a client terminal handle with manager tracking.
///
/// All operations fail once the handle is released; release itself is
/// idempotent and untracks exactly once.
pub struct ManagedTerminalHandle {
    id: TerminalId,
    session_id: SessionId,
    client: Arc<dyn TerminalClient>,
    active: Arc<Mutex<HashMap<TerminalId, TerminalMeta>>>,
    released: AtomicBool,
}

impl std::fmt::Debug for ManagedTerminalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedTerminalHandle")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("released", &self.released)
            .finish()
    }
}

impl ManagedTerminalHandle {
    pub fn id(&self) -> &TerminalId {
        &self.id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn check_released(&self) -> Result<(), TerminalError> {
        if self.released.load(Ordering::SeqCst) {
            Err(TerminalError::AlreadyReleased)
        } else {
            Ok(())
        }
    }

    pub async fn current_output(&self) -> Result<TerminalOutputResponse, TerminalError> {
        self.check_released()?;
        Ok(self
            .client
            .output(TerminalOutputRequest {
                session_id: self.session_id.clone(),
                terminal_id: self.id.clone(),
            })
            .await?)
    }

    pub async fn wait_for_exit(&self) -> Result<TerminalExitStatus, TerminalError> {
        self.check_released()?;
        Ok(self
            .client
            .wait_for_exit(WaitForTerminalExitRequest {
                session_id: self.session_id.clone(),
                terminal_id: self.id.clone(),
            })
            .await?)
    }

    pub async fn kill(&self) -> Result<(), TerminalError> {
        self.check_released()?;
        Ok(self
            .client
            .kill(KillTerminalRequest {
                session_id: self.session_id.clone(),
                terminal_id: self.id.clone(),
            })
            .await?)
    }

    /// Releases the client handle and drops manager tracking. Calling it
    /// again is a no-op.
    pub async fn release(&self) -> Result<(), TerminalError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.active.lock().remove(&self.id);
        self.client
            .release(ReleaseTerminalRequest {
                session_id: self.session_id.clone(),
                terminal_id: self.id.clone(),
            })
            .await?;
        Ok(())
    }
}
