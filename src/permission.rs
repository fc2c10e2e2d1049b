//! Permission brokering.
//!
//! A permission request maps a tool call plus a set of client-proposed
//! options to an outcome. With no interactive frontend wired, a default
//! policy answers immediately: safe kinds allow, mutating kinds reject.
//! With a frontend, the broker parks a resolver and waits for the
//! client's reply, a timeout, or session cancellation, whichever is
//! first.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering::Relaxed},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::channel::oneshot;
use parking_lot::Mutex;
use serde_json::Value;

use crate::{
    Error, ErrorCode, SessionId,
    client::{
        ClientProxy, PermissionOption, RequestPermissionOutcome, RequestPermissionRequest,
        RequestPermissionResponse,
    },
    rpc::parse_params,
    tool_call::ToolKind,
};

/// Whoever can put a permission question in front of the user.
#[async_trait]
pub trait PermissionFrontend: Send + Sync {
    async fn prompt(
        &self,
        request: RequestPermissionRequest,
    ) -> Result<RequestPermissionResponse, Error>;
}

#[async_trait]
impl PermissionFrontend for ClientProxy {
    async fn prompt(
        &self,
        request: RequestPermissionRequest,
    ) -> Result<RequestPermissionResponse, Error> {
        self.request_permission(&request).await
    }
}

pub const DEFAULT_PERMISSION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

struct PendingRequest {
    session_id: SessionId,
    resolve: oneshot::Sender<RequestPermissionOutcome>,
}

pub struct PermissionBroker {
    frontend: Mutex<Option<Arc<dyn PermissionFrontend>>>,
    pending: Arc<Mutex<HashMap<u64, PendingRequest>>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl Default for PermissionBroker {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_PERMISSION_TIMEOUT)
    }
}

impl PermissionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            frontend: Mutex::new(None),
            pending: Arc::default(),
            next_id: AtomicU64::new(0),
            timeout,
        }
    }

    /// Wires the interactive flow. Without this, the default policy
    /// answers every request without blocking.
    pub fn set_frontend(&self, frontend: Arc<dyn PermissionFrontend>) {
        *self.frontend.lock() = Some(frontend);
    }

    /// Validates raw params into a well-formed request. Anything missing
    /// or malformed fails with `-32602` before any policy runs.
    pub fn validate(params: Option<&Value>) -> Result<RequestPermissionRequest, Error> {
        let invalid = |message: &str| {
            Error::new((ErrorCode::INVALID_PARAMS.code, message.to_string()))
        };

        let Some(object) = params.and_then(Value::as_object) else {
            return Err(invalid("params must be an object"));
        };
        if !object.get("sessionId").is_some_and(Value::is_string) {
            return Err(invalid("sessionId is required"));
        }
        if !object.get("toolCall").is_some_and(Value::is_object) {
            return Err(invalid("toolCall is required"));
        }
        match object.get("options").and_then(Value::as_array) {
            Some(options) if !options.is_empty() => {}
            _ => return Err(invalid("options must be a non-empty list")),
        }

        // Unknown option kinds and other shape mismatches surface here.
        parse_params(params)
    }

    /// Resolves a validated request to an outcome. Never fails: policy
    /// and timeouts always produce a selection (or a cancellation).
    pub async fn request(&self, request: RequestPermissionRequest) -> RequestPermissionResponse {
        let frontend = self.frontend.lock().clone();
        let Some(frontend) = frontend else {
            return RequestPermissionResponse {
                outcome: default_policy(request.tool_call.fields.kind, &request.options),
            };
        };

        let id = self.next_id.fetch_add(1, Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            id,
            PendingRequest {
                session_id: request.session_id.clone(),
                resolve: tx,
            },
        );

        let options = request.options.clone();
        let prompt = frontend.prompt(request);
        let outcome = tokio::select! {
            response = prompt => {
                self.pending.lock().remove(&id);
                match response {
                    Ok(response) => response.outcome,
                    Err(err) => {
                        log::error!("permission prompt failed, rejecting: {err}");
                        reject_outcome(&options)
                    }
                }
            }
            cancelled = rx => {
                cancelled.unwrap_or(RequestPermissionOutcome::Cancelled)
            }
            _ = tokio::time::sleep(self.timeout) => {
                self.pending.lock().remove(&id);
                log::warn!("permission request timed out, rejecting");
                reject_outcome(&options)
            }
        };
        RequestPermissionResponse { outcome }
    }

    /// Resolves every pending request of the session as cancelled.
    pub fn cancel_session(&self, session_id: &SessionId) -> usize {
        let resolved: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, entry)| entry.session_id == *session_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id))
                .collect()
        };
        let count = resolved.len();
        for entry in resolved {
            entry.resolve.send(RequestPermissionOutcome::Cancelled).ok();
        }
        count
    }

    pub fn pending_count(&self, session_id: &SessionId) -> usize {
        self.pending
            .lock()
            .values()
            .filter(|entry| entry.session_id == *session_id)
            .count()
    }
}

/// No client prompt wired: safe kinds auto-allow, mutating kinds
/// auto-reject, anything else takes the first option.
fn default_policy(kind: Option<ToolKind>, options: &[PermissionOption]) -> RequestPermissionOutcome {
    let pick = match kind {
        Some(ToolKind::Read | ToolKind::Search | ToolKind::Think | ToolKind::Fetch) => {
            options.iter().find(|option| option.kind.is_allow())
        }
        Some(ToolKind::Edit | ToolKind::Delete | ToolKind::Move | ToolKind::Execute) => {
            options.iter().find(|option| option.kind.is_reject())
        }
        _ => None,
    };
    let selected = pick.or_else(|| options.first());
    match selected {
        Some(option) => RequestPermissionOutcome::Selected {
            option_id: option.id.clone(),
        },
        None => RequestPermissionOutcome::Cancelled,
    }
}

/// The first reject-flavored option, falling back to the first option.
fn reject_outcome(options: &[PermissionOption]) -> RequestPermissionOutcome {
    let selected = options
        .iter()
        .find(|option| option.kind.is_reject())
        .or_else(|| options.first());
    match selected {
        Some(option) => RequestPermissionOutcome::Selected {
            option_id: option.id.clone(),
        },
        None => RequestPermissionOutcome::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{PermissionOptionId, PermissionOptionKind};
    use crate::tool_call::{ToolCallId, ToolCallUpdate, ToolCallUpdateFields};
    use serde_json::json;

    fn options() -> Vec<PermissionOption> {
        vec![
            PermissionOption {
                id: PermissionOptionId("allow-once".into()),
                name: "Allow once".to_string(),
                kind: PermissionOptionKind::AllowOnce,
            },
            PermissionOption {
                id: PermissionOptionId("reject-once".into()),
                name: "Reject".to_string(),
                kind: PermissionOptionKind::RejectOnce,
            },
        ]
    }

    fn request(kind: ToolKind) -> RequestPermissionRequest {
        RequestPermissionRequest {
            session_id: SessionId::from("S"),
            tool_call: ToolCallUpdate {
                id: ToolCallId("tool_x_0_0".into()),
                fields: ToolCallUpdateFields {
                    kind: Some(kind),
                    ..Default::default()
                },
            },
            options: options(),
        }
    }

    fn selected_id(outcome: &RequestPermissionOutcome) -> &str {
        match outcome {
            RequestPermissionOutcome::Selected { option_id } => option_id.0.as_ref(),
            RequestPermissionOutcome::Cancelled => "cancelled",
        }
    }

    #[tokio::test]
    async fn default_policy_allows_safe_kinds() {
        let broker = PermissionBroker::new();
        for kind in [ToolKind::Read, ToolKind::Search, ToolKind::Think, ToolKind::Fetch] {
            let response = broker.request(request(kind)).await;
            assert_eq!(selected_id(&response.outcome), "allow-once", "{kind:?}");
        }
    }

    #[tokio::test]
    async fn default_policy_rejects_mutating_kinds() {
        let broker = PermissionBroker::new();
        for kind in [
            ToolKind::Edit,
            ToolKind::Delete,
            ToolKind::Move,
            ToolKind::Execute,
        ] {
            let response = broker.request(request(kind)).await;
            assert_eq!(selected_id(&response.outcome), "reject-once", "{kind:?}");
        }
    }

    #[tokio::test]
    async fn default_policy_falls_back_to_the_first_option() {
        let broker = PermissionBroker::new();
        let response = broker.request(request(ToolKind::Other)).await;
        assert_eq!(selected_id(&response.outcome), "allow-once");
    }

    #[test]
    fn validation_rejects_malformed_requests() {
        let valid = json!({
            "sessionId": "S",
            "toolCall": {"toolCallId": "t1", "kind": "read"},
            "options": [{"optionId": "a", "name": "Allow", "kind": "allow_once"}],
        });
        assert!(PermissionBroker::validate(Some(&valid)).is_ok());

        let cases = [
            json!({}),
            json!({"toolCall": {}, "options": [{"optionId": "a", "name": "A", "kind": "allow_once"}]}),
            json!({"sessionId": "S", "options": [{"optionId": "a", "name": "A", "kind": "allow_once"}]}),
            json!({"sessionId": "S", "toolCall": {"toolCallId": "t"}, "options": []}),
            json!({"sessionId": "S", "toolCall": {"toolCallId": "t"},
                   "options": [{"optionId": "a", "name": "A", "kind": "allow_forever"}]}),
        ];
        for params in cases {
            let err = PermissionBroker::validate(Some(&params)).unwrap_err();
            assert_eq!(err.code, -32602, "{params}");
        }
    }

    struct NeverAnswers;

    #[async_trait]
    impl PermissionFrontend for NeverAnswers {
        async fn prompt(
            &self,
            _request: RequestPermissionRequest,
        ) -> Result<RequestPermissionResponse, Error> {
            futures::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn interactive_timeout_rejects() {
        let broker = PermissionBroker::with_timeout(Duration::from_millis(100));
        broker.set_frontend(Arc::new(NeverAnswers));

        let response = broker.request(request(ToolKind::Read)).await;
        assert_eq!(selected_id(&response.outcome), "reject-once");
    }

    #[tokio::test]
    async fn cancellation_resolves_pending_requests() {
        let broker = Arc::new(PermissionBroker::new());
        broker.set_frontend(Arc::new(NeverAnswers));
        let session = SessionId::from("S");

        let in_flight = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.request(request(ToolKind::Read)).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(broker.pending_count(&session), 1);

        assert_eq!(broker.cancel_session(&session), 1);
        let response = in_flight.await.unwrap();
        assert_eq!(response.outcome, RequestPermissionOutcome::Cancelled);
        assert_eq!(broker.pending_count(&session), 0);
    }

    struct Approves;

    #[async_trait]
    impl PermissionFrontend for Approves {
        async fn prompt(
            &self,
            request: RequestPermissionRequest,
        ) -> Result<RequestPermissionResponse, Error> {
            Ok(RequestPermissionResponse {
                outcome: RequestPermissionOutcome::Selected {
                    option_id: request.options[0].id.clone(),
                },
            })
        }
    }

    #[tokio::test]
    async fn interactive_reply_wins_and_clears_pending() {
        let broker = PermissionBroker::new();
        broker.set_frontend(Arc::new(Approves));
        let session = SessionId::from("S");

        let response = broker.request(request(ToolKind::Edit)).await;
        assert_eq!(selected_id(&response.outcome), "allow-once");
        assert_eq!(broker.pending_count(&session), 0);
    }
}
