//! End-to-end tests: a real adapter served over in-process pipes, with
//! the test acting as the ACP client on the raw wire.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{
    AsyncBufReadExt as _, AsyncWriteExt as _,
    channel::{mpsc::UnboundedSender, oneshot},
    io::BufReader,
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use crate::{
    adapter::{Adapter, AdapterConfig},
    bridge::{AssistantBridge, AssistantEvent, BridgeTurn},
    error::Error,
    agent::{PromptCapabilities, StopReason},
    tools::ToolOutcome,
    transport::{self, PipeReader, PipeWriter},
};

// Test doubles

/// Scripted assistant: replies with a canned chunk, optionally routes one
/// tool request, then ends the turn.
struct TestBridge {
    tool_request: Option<(String, Value)>,
    stall: bool,
}

impl TestBridge {
    fn chatty() -> Arc<Self> {
        Arc::new(Self {
            tool_request: None,
            stall: false,
        })
    }

    fn with_tool(name: &str, parameters: Value) -> Arc<Self> {
        Arc::new(Self {
            tool_request: Some((name.to_string(), parameters)),
            stall: false,
        })
    }

    fn stalling() -> Arc<Self> {
        Arc::new(Self {
            tool_request: None,
            stall: true,
        })
    }
}

#[async_trait]
impl AssistantBridge for TestBridge {
    async fn version(&self) -> Result<String, Error> {
        Ok("test-assistant 1.0.0".to_string())
    }

    async fn check_auth(&self) -> Result<bool, Error> {
        Ok(true)
    }

    async fn prompt_turn(
        &self,
        _turn: BridgeTurn,
        events: UnboundedSender<AssistantEvent>,
    ) -> Result<StopReason, Error> {
        events
            .unbounded_send(AssistantEvent::MessageChunk("Working on it. ".into()))
            .ok();

        if self.stall {
            futures::future::pending::<()>().await;
        }

        if let Some((name, parameters)) = &self.tool_request {
            let (tx, rx) = oneshot::channel();
            events
                .unbounded_send(AssistantEvent::ToolRequest {
                    name: name.clone(),
                    parameters: parameters.clone(),
                    reply: tx,
                })
                .ok();
            let outcome: ToolOutcome = rx
                .await
                .map_err(|_| Error::internal_error().with_data("tool reply dropped"))?;
            let summary = if outcome.success { "Done." } else { "That failed." };
            events
                .unbounded_send(AssistantEvent::MessageChunk(summary.into()))
                .ok();
        }

        Ok(StopReason::EndTurn)
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }

    fn prompt_capabilities(&self) -> PromptCapabilities {
        PromptCapabilities {
            image: false,
            audio: false,
            embedded_context: true,
        }
    }
}

/// The test's seat on the wire: raw frames in both directions.
struct WireClient {
    adapter: Arc<Adapter>,
    connection: Arc<crate::rpc::RpcConnection>,
    writer: PipeWriter,
    reader: BufReader<PipeReader>,
    next_id: i64,
}

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

impl WireClient {
    fn start(bridge: Arc<dyn AssistantBridge>, config: AdapterConfig) -> Self {
        let adapter = Adapter::new(bridge, config).expect("config is valid");
        let (client_writer, agent_reader) = transport::pipe();
        let (agent_writer, client_reader) = transport::pipe();
        let (connection, io_task) = adapter.serve(agent_writer, agent_reader, |fut| {
            tokio::spawn(fut);
        });
        tokio::spawn(io_task);
        Self {
            adapter,
            connection,
            writer: client_writer,
            reader: BufReader::new(client_reader),
            next_id: 100,
        }
    }

    async fn send(&mut self, frame: Value) {
        let mut line = frame.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let mut line = String::new();
        tokio::time::timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a frame")
            .unwrap();
        assert!(!line.is_empty(), "transport closed unexpectedly");
        serde_json::from_str(&line).expect("agent wrote invalid JSON")
    }

    /// Sends a request and reads frames until its response arrives,
    /// returning the notifications observed on the way.
    async fn request(&mut self, method: &str, params: Value) -> (Value, Vec<Value>) {
        let id = self.next_id;
        self.next_id += 1;
        self.send(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await;

        let mut notifications = Vec::new();
        loop {
            let frame = self.recv().await;
            if frame.get("id") == Some(&Value::from(id)) && frame.get("method").is_none() {
                return (frame, notifications);
            }
            assert!(
                frame.get("method").is_some(),
                "unexpected frame while waiting for response: {frame}"
            );
            notifications.push(frame);
        }
    }

    async fn notify(&mut self, method: &str, params: Value) {
        self.send(json!({"jsonrpc": "2.0", "method": method, "params": params}))
            .await;
    }

    async fn new_session(&mut self) -> String {
        let (response, _) = self
            .request("session/new", json!({"cwd": "/workspace"}))
            .await;
        response["result"]["sessionId"]
            .as_str()
            .expect("session id in response")
            .to_string()
    }

    async fn initialize(&mut self, terminal: bool) -> Value {
        let (response, _) = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": 1,
                    "clientCapabilities": {
                        "fs": {"readTextFile": true, "writeTextFile": true},
                        "terminal": terminal,
                    },
                }),
            )
            .await;
        response
    }
}

fn assert_well_formed_response(frame: &Value) {
    assert_eq!(frame["jsonrpc"], "2.0");
    let has_result = frame.get("result").is_some();
    let has_error = frame.get("error").is_some();
    assert!(
        has_result ^ has_error,
        "response must carry exactly one of result/error: {frame}"
    );
}

#[tokio::test]
async fn responses_are_well_formed_and_unknown_methods_fail() {
    let mut client = WireClient::start(TestBridge::chatty(), AdapterConfig::default());

    let response = client.initialize(false).await;
    assert_well_formed_response(&response);
    assert_eq!(response["result"]["protocolVersion"], 1);
    assert_eq!(response["result"]["agentCapabilities"]["loadSession"], true);
    assert_eq!(response["result"]["modes"][0]["id"], "ask");

    let (response, _) = client.request("no/such_method", json!({})).await;
    assert_well_formed_response(&response);
    assert_eq!(response["error"]["code"], -32601);
}

#[tokio::test]
async fn extension_methods_route_by_underscore_prefix() {
    use futures::FutureExt as _;

    let mut client = WireClient::start(TestBridge::chatty(), AdapterConfig::default());
    client
        .adapter
        .extensions()
        .register_method("_app/echo", |params| {
            async move { Ok(params.unwrap_or(Value::Null)) }.boxed()
        })
        .unwrap();

    let (response, _) = client.request("_app/echo", json!({"x": 7})).await;
    assert_eq!(response["result"], json!({"x": 7}));

    client.adapter.extensions().unregister_method("_app/echo");
    let (response, _) = client.request("_app/echo", json!({})).await;
    assert_eq!(response["error"]["code"], -32601);
}

#[tokio::test]
async fn initialize_advertises_extension_namespaces() {
    use futures::FutureExt as _;

    let mut client = WireClient::start(TestBridge::chatty(), AdapterConfig::default());
    client
        .adapter
        .extensions()
        .register_method("_myapp/action", |_| async { Ok(Value::Null) }.boxed())
        .unwrap();
    client
        .adapter
        .extensions()
        .register_notification("_myapp/ping", |_| async { Ok(()) }.boxed())
        .unwrap();

    let response = client.initialize(false).await;
    let meta = &response["result"]["agentCapabilities"]["_meta"];
    assert_eq!(meta["myapp"]["methods"], json!(["_myapp/action"]));
    assert_eq!(meta["myapp"]["notifications"], json!(["_myapp/ping"]));
}

#[tokio::test]
async fn read_file_tool_round_trips_through_the_client() {
    let mut client = WireClient::start(TestBridge::chatty(), AdapterConfig::default());
    client.initialize(false).await;
    client.new_session().await;

    let call_id = client.next_id;
    client.next_id += 1;
    client
        .send(json!({
            "jsonrpc": "2.0",
            "id": call_id,
            "method": "tools/call",
            "params": {"name": "read_file", "parameters": {"sessionId": "S", "path": "/tmp/a.txt"}},
        }))
        .await;

    let mut lifecycle = Vec::new();
    let response = loop {
        let frame = client.recv().await;
        if frame.get("method") == Some(&Value::from("fs/read_text_file")) {
            assert_eq!(frame["params"]["sessionId"], "S");
            assert_eq!(frame["params"]["path"], "/tmp/a.txt");
            client
                .send(json!({
                    "jsonrpc": "2.0",
                    "id": frame["id"],
                    "result": {"content": "hello"},
                }))
                .await;
            continue;
        }
        if frame.get("method") == Some(&Value::from("session/update")) {
            lifecycle.push(frame["params"]["update"].clone());
            continue;
        }
        if frame.get("id") == Some(&Value::from(call_id)) {
            break frame;
        }
        panic!("unexpected frame: {frame}");
    };

    assert_well_formed_response(&response);
    let result = &response["result"];
    assert_eq!(result["success"], true);
    assert_eq!(result["result"]["path"], "/tmp/a.txt");
    assert_eq!(result["result"]["content"], "hello");
    assert!(result["result"]["_meta"].is_object());

    assert_eq!(lifecycle.len(), 3);
    assert_eq!(lifecycle[0]["sessionUpdate"], "tool_call");
    assert_eq!(lifecycle[0]["kind"], "read");
    assert_eq!(lifecycle[0]["status"], "pending");
    assert_eq!(lifecycle[0]["title"], "Reading file: /tmp/a.txt");
    assert_eq!(lifecycle[0]["locations"], json!([{"path": "/tmp/a.txt"}]));
    assert_eq!(lifecycle[1]["sessionUpdate"], "tool_call_update");
    assert_eq!(lifecycle[1]["status"], "in_progress");
    assert_eq!(lifecycle[2]["sessionUpdate"], "tool_call_update");
    assert_eq!(lifecycle[2]["status"], "completed");
    assert_eq!(
        lifecycle[0]["toolCallId"], lifecycle[1]["toolCallId"],
        "updates must reference the same call"
    );
}

#[tokio::test]
async fn permission_defaults_reject_destructive_tool_calls() {
    let mut client = WireClient::start(TestBridge::chatty(), AdapterConfig::default());

    let (response, _) = client
        .request(
            "session/request_permission",
            json!({
                "sessionId": "S",
                "toolCall": {"toolCallId": "t1", "kind": "delete"},
                "options": [
                    {"optionId": "allow-once", "name": "Allow", "kind": "allow_once"},
                    {"optionId": "reject-once", "name": "Reject", "kind": "reject_once"},
                ],
            }),
        )
        .await;
    assert_eq!(
        response["result"]["outcome"],
        json!({"outcome": "selected", "optionId": "reject-once"})
    );

    let (response, _) = client
        .request(
            "session/request_permission",
            json!({
                "sessionId": "S",
                "toolCall": {"toolCallId": "t2", "kind": "read"},
                "options": [
                    {"optionId": "allow-once", "name": "Allow", "kind": "allow_once"},
                    {"optionId": "reject-once", "name": "Reject", "kind": "reject_once"},
                ],
            }),
        )
        .await;
    assert_eq!(response["result"]["outcome"]["optionId"], "allow-once");

    let (response, _) = client
        .request(
            "session/request_permission",
            json!({"sessionId": "S", "toolCall": {"toolCallId": "t3"}, "options": []}),
        )
        .await;
    assert_eq!(response["error"]["code"], -32602);
}

#[tokio::test]
async fn session_load_validates_cwd_shapes() {
    let mut client = WireClient::start(TestBridge::chatty(), AdapterConfig::default());

    for (cwd, expected) in [
        (json!("relative/path"), Some("cwd must be an absolute path")),
        (json!("./x"), Some("cwd must be an absolute path")),
        (json!("../x"), Some("cwd must be an absolute path")),
        (json!(42), Some("cwd must be a string")),
        (json!("/u/x"), None),
        (json!("C:\\w"), None),
        (json!("D:/w"), None),
    ] {
        let (response, _) = client
            .request(
                "session/load",
                json!({"sessionId": "sess_test", "cwd": cwd}),
            )
            .await;
        match expected {
            Some(message) => {
                assert_eq!(response["error"]["code"], -32602, "cwd={cwd}");
                assert!(
                    response["error"]["message"]
                        .as_str()
                        .unwrap()
                        .contains(message),
                    "cwd={cwd}: {response}"
                );
            }
            None => {
                assert!(response.get("error").is_none(), "cwd={cwd}: {response}");
                assert_eq!(response["result"]["modes"]["currentModeId"], "ask");
            }
        }
    }
}

#[tokio::test]
async fn set_mode_returns_previous_and_notifies() {
    let mut client = WireClient::start(TestBridge::chatty(), AdapterConfig::default());
    let session_id = client.new_session().await;

    let (response, notifications) = client
        .request(
            "session/set_mode",
            json!({"sessionId": session_id, "modeId": "agent"}),
        )
        .await;
    assert_eq!(response["result"]["previousModeId"], "ask");
    assert!(notifications.iter().any(|frame| {
        frame["params"]["update"]["sessionUpdate"] == "current_mode_update"
            && frame["params"]["update"]["currentModeId"] == "agent"
    }));

    let (response, _) = client
        .request(
            "session/set_mode",
            json!({"sessionId": session_id, "modeId": "nonsense"}),
        )
        .await;
    assert_eq!(response["error"]["code"], -32602);
}

#[tokio::test]
async fn prompt_streams_chunks_and_tool_lifecycle() {
    let bridge = TestBridge::with_tool("read_file", json!({"path": "/tmp/a.txt"}));
    let mut client = WireClient::start(bridge, AdapterConfig::default());
    client.initialize(false).await;
    let session_id = client.new_session().await;

    let prompt_id = client.next_id;
    client.next_id += 1;
    client
        .send(json!({
            "jsonrpc": "2.0",
            "id": prompt_id,
            "method": "prompt",
            "params": {
                "sessionId": session_id,
                "prompt": [{"type": "text", "text": "read that file"}],
            },
        }))
        .await;

    let mut chunks = Vec::new();
    let mut statuses = Vec::new();
    let response = loop {
        let frame = client.recv().await;
        if frame.get("method") == Some(&Value::from("fs/read_text_file")) {
            client
                .send(json!({
                    "jsonrpc": "2.0",
                    "id": frame["id"],
                    "result": {"content": "hello"},
                }))
                .await;
            continue;
        }
        if frame.get("method") == Some(&Value::from("session/update")) {
            let update = &frame["params"]["update"];
            match update["sessionUpdate"].as_str().unwrap() {
                "agent_message_chunk" => {
                    chunks.push(update["content"]["text"].as_str().unwrap().to_string())
                }
                "tool_call" | "tool_call_update" => {
                    if let Some(status) = update["status"].as_str() {
                        statuses.push(status.to_string());
                    }
                }
                other => panic!("unexpected update kind {other}"),
            }
            continue;
        }
        if frame.get("id") == Some(&Value::from(prompt_id)) {
            break frame;
        }
        panic!("unexpected frame: {frame}");
    };

    assert_eq!(response["result"]["stopReason"], "end_turn");
    assert_eq!(chunks, vec!["Working on it. ", "Done."]);
    assert_eq!(statuses, vec!["pending", "in_progress", "completed"]);
}

#[tokio::test]
async fn session_cancel_fails_live_tool_calls_and_stops_the_prompt() {
    let mut client = WireClient::start(TestBridge::stalling(), AdapterConfig::default());
    client.initialize(false).await;
    let session_id = client.new_session().await;

    // Two in-flight tool calls for the session.
    use crate::tool_call::{ToolCallReport, ToolKind};
    let session = crate::SessionId(session_id.as_str().into());
    client.adapter.tool_calls().report(
        &session,
        "grep",
        ToolCallReport::new("Searching: x", ToolKind::Search),
    );
    client.adapter.tool_calls().report(
        &session,
        "run_command",
        ToolCallReport::new("$ make", ToolKind::Execute),
    );

    let prompt_id = client.next_id;
    client.next_id += 1;
    client
        .send(json!({
            "jsonrpc": "2.0",
            "id": prompt_id,
            "method": "prompt",
            "params": {"sessionId": session_id, "prompt": [{"type": "text", "text": "go"}]},
        }))
        .await;

    // Wait for the stalling bridge's first chunk so the prompt is running.
    loop {
        let frame = client.recv().await;
        if frame["params"]["update"]["sessionUpdate"] == "agent_message_chunk" {
            break;
        }
    }

    client
        .notify("session/cancel", json!({"sessionId": session_id}))
        .await;

    // The prompt response and the fan-out updates race on independent
    // tasks; collect until both have fully arrived.
    let mut cancelled_updates = 0;
    let mut response = None;
    while response.is_none() || cancelled_updates < 2 {
        let frame = client.recv().await;
        if frame.get("method") == Some(&Value::from("session/update")) {
            let update = &frame["params"]["update"];
            if update["sessionUpdate"] == "tool_call_update"
                && update["status"] == "failed"
                && update["title"] == "Cancelled by user"
            {
                cancelled_updates += 1;
            }
            continue;
        }
        if frame.get("id") == Some(&Value::from(prompt_id)) {
            response = Some(frame);
        }
    }

    assert_eq!(cancelled_updates, 2);
    let response = response.unwrap();
    assert_eq!(response["result"]["stopReason"], "cancelled");
    assert!(client.adapter.tool_calls().active_calls(&session).is_empty());
}

#[tokio::test]
async fn one_shot_exchange_answers_requests_and_swallows_notifications() {
    let adapter = Adapter::new(TestBridge::chatty(), AdapterConfig::default()).unwrap();

    let body = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "session/new",
        "params": {"cwd": "/workspace"},
    });
    let reply = adapter.handle_one_shot(body.to_string().into_bytes()).await;
    assert_eq!(reply.status, 200);
    assert!(
        reply
            .headers
            .iter()
            .any(|(k, v)| *k == "Access-Control-Allow-Origin" && v == "*")
    );
    let frame: Value = serde_json::from_slice(&reply.body).unwrap();
    assert_well_formed_response(&frame);
    assert!(frame["result"]["sessionId"].as_str().is_some());

    let body = json!({
        "jsonrpc": "2.0",
        "method": "session/cancel",
        "params": {"sessionId": "sess_unknown"},
    });
    let reply = adapter.handle_one_shot(body.to_string().into_bytes()).await;
    assert_eq!(reply.status, 204);
    assert!(reply.body.is_empty());

    let reply = adapter.handle_one_shot(b"not json at all".to_vec()).await;
    assert_eq!(reply.status, 500);
    let envelope: Value = serde_json::from_slice(&reply.body).unwrap();
    assert_eq!(envelope["error"]["code"], -32603);
}

#[tokio::test]
async fn stream_subscribers_observe_both_directions() {
    use crate::stream::{StreamMessageContent, StreamMessageDirection};

    let mut client = WireClient::start(TestBridge::chatty(), AdapterConfig::default());
    let mut observer = client.connection.subscribe();

    client.initialize(false).await;

    let first = observer.recv().await.unwrap();
    assert_eq!(first.direction, StreamMessageDirection::Incoming);
    match first.message {
        StreamMessageContent::Request { method, .. } => assert_eq!(method.as_ref(), "initialize"),
        other => panic!("expected the incoming request, got {other:?}"),
    }

    let second = observer.recv().await.unwrap();
    assert_eq!(second.direction, StreamMessageDirection::Outgoing);
    match second.message {
        StreamMessageContent::Response { result, .. } => {
            assert!(result.unwrap().is_some());
        }
        other => panic!("expected the outgoing response, got {other:?}"),
    }
}

#[tokio::test]
async fn contradictory_configuration_is_rejected() {
    let mut config = AdapterConfig::default();
    config.terminal.max_concurrent_terminals = 0;
    let err = Adapter::new(TestBridge::chatty(), config).unwrap_err();
    assert!(err.message.contains("maxConcurrentTerminals"));

    // Disabling terminals makes the same knob irrelevant.
    let mut config = AdapterConfig::default();
    config.terminal_enabled = false;
    config.terminal.max_concurrent_terminals = 0;
    assert!(Adapter::new(TestBridge::chatty(), config).is_ok());
}

#[tokio::test]
async fn authenticate_delegates_to_the_bridge() {
    let mut client = WireClient::start(TestBridge::chatty(), AdapterConfig::default());
    let (response, _) = client
        .request("authenticate", json!({"methodId": "none"}))
        .await;
    assert!(response.get("error").is_none());
}

#[tokio::test]
async fn terminal_capability_gates_direct_terminal_use() {
    let mut client = WireClient::start(TestBridge::chatty(), AdapterConfig::default());
    client.initialize(false).await;
    let session_id = client.new_session().await;
    let session = crate::SessionId(session_id.as_str().into());

    let err = client
        .adapter
        .terminals()
        .create(
            &session,
            crate::terminal::CreateTerminalSpec {
                command: "echo hi".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Terminal capability not supported by client"
    );
}
