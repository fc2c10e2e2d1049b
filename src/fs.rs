//! File-system access through the client.
//!
//! The adapter never touches the disk itself: reads and writes travel the
//! reverse channel into the editor, which owns the file system. The
//! `FsClient` seam keeps that pluggable, the RPC-backed implementation
//! retries transient failures, and the tool provider exposes the pair of
//! `read_file`/`write_file` tools once the client advertises the matching
//! capabilities.

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::FutureExt as _;
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::{
    Error, SessionId,
    client::{
        ClientProxy, FileSystemCapability, ReadTextFileRequest, ReadTextFileResponse,
        WriteTextFileRequest,
    },
    tools::{Tool, ToolOutcome, ToolProvider},
};

/// The file-system interface the core consumes.
#[async_trait]
pub trait FsClient: Send + Sync {
    async fn read_text_file(
        &self,
        request: ReadTextFileRequest,
    ) -> Result<ReadTextFileResponse, Error>;

    async fn write_text_file(&self, request: WriteTextFileRequest) -> Result<(), Error>;
}

/// Retry schedule for transient file-system failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure.
    pub retries: u32,
    /// Base delay; attempt `n` waits `retry_delay * n`.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// `FsClient` backed by the client's `fs/read_text_file` and
/// `fs/write_text_file` methods.
pub struct RpcFsClient {
    proxy: ClientProxy,
    policy: RetryPolicy,
}

impl RpcFsClient {
    pub fn new(proxy: ClientProxy) -> Self {
        Self::with_policy(proxy, RetryPolicy::default())
    }

    pub fn with_policy(proxy: ClientProxy, policy: RetryPolicy) -> Self {
        Self { proxy, policy }
    }
}

/// Retries `call` on transient failures according to the policy. Final
/// errors (validation, not-found, permission) surface immediately.
pub(crate) async fn with_retries<T, F, Fut>(policy: &RetryPolicy, mut call: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.retries => {
                attempt += 1;
                log::debug!("transient fs failure (attempt {attempt}): {err}");
                tokio::time::sleep(policy.retry_delay * attempt).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[async_trait]
impl FsClient for RpcFsClient {
    async fn read_text_file(
        &self,
        request: ReadTextFileRequest,
    ) -> Result<ReadTextFileResponse, Error> {
        with_retries(&self.policy, || self.proxy.read_text_file(&request)).await
    }

    async fn write_text_file(&self, request: WriteTextFileRequest) -> Result<(), Error> {
        with_retries(&self.policy, || self.proxy.write_text_file(&request)).await
    }
}

/// Exposes `read_file`/`write_file` tools, gated on the client's
/// advertised file-system capabilities.
///
/// The provider can be registered before `initialize` arrives; it yields
/// no tools until [`FsToolProvider::set_capabilities`] runs and the
/// registry refreshes.
pub struct FsToolProvider {
    fs: Arc<dyn FsClient>,
    capabilities: Mutex<FileSystemCapability>,
}

impl FsToolProvider {
    pub fn new(fs: Arc<dyn FsClient>) -> Self {
        Self {
            fs,
            capabilities: Mutex::new(FileSystemCapability::default()),
        }
    }

    pub fn set_capabilities(&self, capabilities: FileSystemCapability) {
        *self.capabilities.lock() = capabilities;
    }
}

#[async_trait]
impl ToolProvider for FsToolProvider {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn description(&self) -> &str {
        "Text-file access through the connected client"
    }

    fn tools(&self) -> Vec<Tool> {
        let capabilities = self.capabilities.lock().clone();
        let mut tools = Vec::new();
        if capabilities.read_text_file {
            tools.push(read_file_tool(self.fs.clone()));
        }
        if capabilities.write_text_file {
            tools.push(write_file_tool(self.fs.clone()));
        }
        tools
    }
}

/// The session a file tool runs under: the dispatcher injects
/// `_sessionId`; a bare `sessionId` param is accepted for direct calls.
fn session_from_params(params: &Value) -> Option<SessionId> {
    params
        .get("_sessionId")
        .or_else(|| params.get("sessionId"))
        .and_then(Value::as_str)
        .map(SessionId::from)
}

fn read_file_tool(fs: Arc<dyn FsClient>) -> Tool {
    Tool::new(
        "read_file",
        "Read a text file from the client's workspace",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Absolute path to the file"},
                "line": {"type": "number", "description": "1-based line to start from"},
                "limit": {"type": "number", "description": "Maximum number of lines"},
            },
            "required": ["path"],
        }),
        move |params| {
            let fs = fs.clone();
            async move {
                let Some(session_id) = session_from_params(&params) else {
                    return Ok(ToolOutcome::failure("read_file requires a session"));
                };
                let path = params
                    .get("path")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let request = ReadTextFileRequest {
                    session_id,
                    path: PathBuf::from(&path),
                    line: params.get("line").and_then(Value::as_u64).map(|l| l as u32),
                    limit: params
                        .get("limit")
                        .and_then(Value::as_u64)
                        .map(|l| l as u32),
                };
                match fs.read_text_file(request).await {
                    Ok(response) => {
                        let lines = response.content.lines().count();
                        Ok(ToolOutcome::success(json!({
                            "path": path,
                            "content": response.content,
                            "_meta": {"lines": lines},
                        })))
                    }
                    Err(err) => Ok(ToolOutcome::failure(format!(
                        "Failed to read {path}: {err}"
                    ))),
                }
            }
            .boxed()
        },
    )
}

fn write_file_tool(fs: Arc<dyn FsClient>) -> Tool {
    Tool::new(
        "write_file",
        "Write a text file in the client's workspace",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Absolute path to the file"},
                "content": {"type": "string", "description": "Full new file contents"},
            },
            "required": ["path", "content"],
        }),
        move |params| {
            let fs = fs.clone();
            async move {
                let Some(session_id) = session_from_params(&params) else {
                    return Ok(ToolOutcome::failure("write_file requires a session"));
                };
                let path = params
                    .get("path")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let content = params
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let bytes = content.len();
                let request = WriteTextFileRequest {
                    session_id,
                    path: PathBuf::from(&path),
                    content,
                };
                match fs.write_text_file(request).await {
                    Ok(()) => Ok(ToolOutcome::success(json!({
                        "path": path,
                        "bytesWritten": bytes,
                    }))),
                    Err(err) => Ok(ToolOutcome::failure(format!(
                        "Failed to write {path}: {err}"
                    ))),
                }
            }
            .boxed()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyFs {
        failures_left: AtomicU32,
        error: fn() -> Error,
    }

    #[async_trait]
    impl FsClient for FlakyFs {
        async fn read_text_file(
            &self,
            _request: ReadTextFileRequest,
        ) -> Result<ReadTextFileResponse, Error> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                Err((self.error)())
            } else {
                Ok(ReadTextFileResponse {
                    content: "hello".to_string(),
                })
            }
        }

        async fn write_text_file(&self, _request: WriteTextFileRequest) -> Result<(), Error> {
            Ok(())
        }
    }

    #[test]
    fn transient_classification_excludes_validation_errors() {
        assert!(Error::internal_error().is_transient());
        assert!(!Error::invalid_params().is_transient());
        assert!(!Error::method_not_found().is_transient());
        assert!(!Error::auth_required().is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_up_to_the_limit() {
        let policy = RetryPolicy {
            retries: 3,
            retry_delay: Duration::from_millis(10),
        };
        let fs = FlakyFs {
            failures_left: AtomicU32::new(2),
            error: Error::internal_error,
        };
        let request = ReadTextFileRequest {
            session_id: SessionId::from("S"),
            path: PathBuf::from("/tmp/a.txt"),
            line: None,
            limit: None,
        };

        let response = with_retries(&policy, || fs.read_text_file(request.clone()))
            .await
            .unwrap();
        assert_eq!(response.content, "hello");

        let fs = FlakyFs {
            failures_left: AtomicU32::new(10),
            error: Error::internal_error,
        };
        assert!(
            with_retries(&policy, || fs.read_text_file(request.clone()))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn non_retriable_failures_surface_immediately() {
        let policy = RetryPolicy::default();
        let fs = FlakyFs {
            failures_left: AtomicU32::new(10),
            error: Error::invalid_params,
        };
        let request = ReadTextFileRequest {
            session_id: SessionId::from("S"),
            path: PathBuf::from("/tmp/a.txt"),
            line: None,
            limit: None,
        };

        let err = with_retries(&policy, || fs.read_text_file(request.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.code, -32602);
        // Only the first attempt ran.
        assert_eq!(fs.failures_left.load(Ordering::SeqCst), 9);
    }

    #[tokio::test]
    async fn provider_yields_tools_only_after_capabilities_arrive() {
        let fs = Arc::new(FlakyFs {
            failures_left: AtomicU32::new(0),
            error: Error::internal_error,
        });
        let provider = FsToolProvider::new(fs);
        assert!(provider.tools().is_empty());

        provider.set_capabilities(FileSystemCapability {
            read_text_file: true,
            write_text_file: false,
        });
        let tools: Vec<String> = provider.tools().into_iter().map(|t| t.name).collect();
        assert_eq!(tools, vec!["read_file".to_string()]);

        provider.set_capabilities(FileSystemCapability {
            read_text_file: true,
            write_text_file: true,
        });
        let tools: Vec<String> = provider.tools().into_iter().map(|t| t.name).collect();
        assert_eq!(tools, vec!["read_file".to_string(), "write_file".to_string()]);
    }

    #[tokio::test]
    async fn read_tool_reports_missing_session_as_failure() {
        let fs: Arc<dyn FsClient> = Arc::new(FlakyFs {
            failures_left: AtomicU32::new(0),
            error: Error::internal_error,
        });
        let tool = read_file_tool(fs);
        let outcome = (tool.handler)(json!({"path": "/tmp/a.txt"})).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("requires a session"));
    }

    #[tokio::test]
    async fn read_tool_returns_content_and_meta() {
        let fs: Arc<dyn FsClient> = Arc::new(FlakyFs {
            failures_left: AtomicU32::new(0),
            error: Error::internal_error,
        });
        let tool = read_file_tool(fs);
        let outcome = (tool.handler)(json!({"_sessionId": "S", "path": "/tmp/a.txt"}))
            .await
            .unwrap();
        assert!(outcome.success);
        let result = outcome.result.unwrap();
        assert_eq!(result["path"], "/tmp/a.txt");
        assert_eq!(result["content"], "hello");
        assert_eq!(result["_meta"]["lines"], 1);
    }
}
