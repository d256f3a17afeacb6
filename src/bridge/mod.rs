//! Host side of the sandbox RPC channel.
//!
//! Once the script reports it is listening, the host connects to it as a
//! WebSocket client and then serves the requests the sandbox sends: the
//! script calls, the host answers. One connection carries tool calls, a
//! second one (workspace-sync mode only) carries file transfers.

pub mod files;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::content::{extract_all_text, ComplexContent};
use crate::executor::RunAbort;
use crate::tools::ToolCatalog;

pub use files::FileCallHandler;

const CONNECT_ATTEMPTS: usize = 20;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Remote call sent by the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub call_id: Option<String>,
}

/// Outcome of one call as the stub sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResult {
    pub error: bool,
    pub value: Value,
}

impl RpcResult {
    pub fn ok(value: Value) -> Self {
        Self { error: false, value }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            error: true,
            value: Value::String(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub result: RpcResult,
    pub result_type: Option<String>,
    pub call_id: Option<String>,
}

/// Any frame on the channel. Exactly one side is set in practice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RpcRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<RpcResponse>,
}

impl RpcFrame {
    pub fn response(call_id: Option<String>, result: RpcResult) -> Self {
        Self {
            request: None,
            response: Some(RpcResponse {
                jsonrpc: "2.0".to_string(),
                result,
                result_type: None,
                call_id,
            }),
        }
    }
}

/// Token left in the console output in place of a rich tool result.
pub fn marker_token(call_id: &str) -> String {
    format!("<<TOOL_RESPONSE:{call_id}>>")
}

/// Rich output of one tool call, kept for splicing.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub tool_name: String,
    pub content: Vec<ComplexContent>,
}

/// Rich results of one execution, keyed by call id.
#[derive(Debug, Clone, Default)]
pub struct ToolResponseRegistry {
    inner: Arc<Mutex<HashMap<String, ToolOutput>>>,
}

impl ToolResponseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, call_id: String, output: ToolOutput) {
        self.inner.lock().await.insert(call_id, output);
    }

    pub async fn get(&self, call_id: &str) -> Option<ToolOutput> {
        self.inner.lock().await.get(call_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Take every stored output, leaving the registry empty.
    pub async fn drain(&self) -> HashMap<String, ToolOutput> {
        std::mem::take(&mut *self.inner.lock().await)
    }
}

/// Answers the requests arriving on one endpoint.
#[async_trait]
pub trait CallHandler: Send + Sync {
    async fn handle(&self, request: RpcRequest) -> RpcResult;
}

/// Serves tool calls from the catalog.
pub struct ToolCallHandler {
    catalog: Arc<ToolCatalog>,
    registry: ToolResponseRegistry,
}

impl ToolCallHandler {
    pub fn new(catalog: Arc<ToolCatalog>, registry: ToolResponseRegistry) -> Self {
        Self { catalog, registry }
    }
}

#[async_trait]
impl CallHandler for ToolCallHandler {
    async fn handle(&self, request: RpcRequest) -> RpcResult {
        if let Some(result) = builtin_method(&request) {
            return result;
        }

        let Some(entry) = self.catalog.get(&request.method) else {
            tracing::warn!(method = %request.method, "Sandbox called unknown tool");
            return RpcResult::err(format!("Tool {} not found", request.method));
        };
        let tool = &entry.tool;
        let call_id = request
            .call_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        tracing::debug!(tool = %tool.name(), call_id = %call_id, "Invoking tool for sandbox");

        let args = match request.arguments {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        let content = match tool.execute(args, self.catalog.working_dir()).await {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(tool = %tool.name(), call_id = %call_id, "Tool failed: {}", e);
                return RpcResult::err(e.to_string());
            }
        };

        if tool.output_schema().is_some() {
            let text = extract_all_text(&content);
            return match serde_json::from_str::<Value>(&text) {
                Ok(value) => RpcResult::ok(value),
                Err(e) => RpcResult::err(format!(
                    "Tool {} returned invalid structured output: {}",
                    tool.name(),
                    e
                )),
            };
        }

        self.registry
            .insert(
                call_id.clone(),
                ToolOutput {
                    tool_name: tool.name().to_string(),
                    content,
                },
            )
            .await;
        RpcResult::ok(Value::String(marker_token(&call_id)))
    }
}

/// Methods every RPC peer is expected to answer.
fn builtin_method(request: &RpcRequest) -> Option<RpcResult> {
    match request.method.as_str() {
        "_ping_" => Some(RpcResult::ok(Value::String("pong".to_string()))),
        _ => None,
    }
}

fn decode_frame(message: WsMessage) -> Option<Result<RpcFrame, serde_json::Error>> {
    match message {
        WsMessage::Text(payload) => Some(serde_json::from_str(&payload)),
        WsMessage::Binary(payload) => {
            Some(serde_json::from_str(&String::from_utf8_lossy(&payload)))
        }
        _ => None,
    }
}

/// Connect to `url` and serve requests until the sandbox closes the channel.
///
/// Each request runs in its own task so the socket keeps being read (and
/// pings answered) while a slow tool is working. Responses carry the
/// request's call id and may go out in any order.
pub async fn serve_channel(url: &str, handler: Arc<dyn CallHandler>) -> Result<(), BridgeError> {
    let mut last_error = String::new();
    let mut socket = None;
    for attempt in 1..=CONNECT_ATTEMPTS {
        match connect_async(url).await {
            Ok((stream, _)) => {
                socket = Some(stream);
                break;
            }
            Err(e) => {
                tracing::debug!(url, attempt, "Bridge connect failed: {}", e);
                last_error = e.to_string();
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
        }
    }
    let Some(socket) = socket else {
        return Err(BridgeError::Connect {
            url: url.to_string(),
            message: last_error,
        });
    };
    tracing::debug!(url, "Bridge connected");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let writer_url = url.to_string();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = sink.send(message).await {
                tracing::debug!(url = %writer_url, "Failed to send response: {}", e);
                break;
            }
        }
    });

    let mut in_flight = JoinSet::new();
    let mut outcome = Ok(());
    while let Some(message) = stream.next().await {
        while in_flight.try_join_next().is_some() {}

        // Pings are answered by tungstenite itself while the stream is read.
        let message = match message {
            Ok(WsMessage::Close(_)) => break,
            Ok(message) => message,
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed) => break,
            Err(e) => {
                outcome = Err(e.into());
                break;
            }
        };

        let frame = match decode_frame(message) {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::warn!(url, "Ignoring undecodable frame: {}", e);
                continue;
            }
            None => continue,
        };
        let Some(request) = frame.request else {
            continue;
        };

        let handler = Arc::clone(&handler);
        let tx = tx.clone();
        in_flight.spawn(async move {
            let call_id = request.call_id.clone();
            let result = handler.handle(request).await;
            match serde_json::to_string(&RpcFrame::response(call_id, result)) {
                Ok(payload) => {
                    let _ = tx.send(WsMessage::Text(payload.into()));
                }
                Err(e) => tracing::warn!("Failed to encode response: {}", e),
            }
        });
    }

    // Nobody is left to receive answers for calls still running.
    in_flight.abort_all();
    while in_flight.join_next().await.is_some() {}
    drop(tx);
    if let Err(e) = writer.await {
        tracing::debug!(url, "Response writer ended abnormally: {}", e);
    }

    tracing::debug!(url, "Bridge channel closed");
    outcome
}

/// Spawn [`serve_channel`] in the background.
///
/// Errors are logged. A channel that never connects also aborts the run
/// through `abort`: the script does not start the user code until every
/// channel it serves is connected.
pub fn attach(url: String, handler: Arc<dyn CallHandler>, abort: RunAbort) -> JoinHandle<()> {
    tokio::spawn(async move {
        match serve_channel(&url, handler).await {
            Ok(()) => {}
            Err(e @ BridgeError::Connect { .. }) => {
                tracing::warn!(url = %url, "Bridge terminated: {}", e);
                abort.abort(format!("Host bridge unavailable: {e}"));
            }
            Err(e) => tracing::warn!(url = %url, "Bridge terminated: {}", e),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Tool;
    use serde_json::json;
    use std::path::Path;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    struct Clock;

    #[async_trait]
    impl Tool for Clock {
        fn name(&self) -> &str {
            "get_time"
        }
        fn description(&self) -> &str {
            "Current time"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: Value, _wd: &Path) -> anyhow::Result<Vec<ComplexContent>> {
            Ok(vec![ComplexContent::text("12:00")])
        }
    }

    struct Weather {
        reply: &'static str,
    }

    #[async_trait]
    impl Tool for Weather {
        fn name(&self) -> &str {
            "weather"
        }
        fn description(&self) -> &str {
            "Structured weather"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn output_schema(&self) -> Option<Value> {
            Some(json!({"type": "object"}))
        }
        async fn execute(&self, args: Value, _wd: &Path) -> anyhow::Result<Vec<ComplexContent>> {
            if args.get("fail").is_some() {
                anyhow::bail!("weather service unavailable");
            }
            Ok(vec![ComplexContent::text(self.reply)])
        }
    }

    fn handler(reply: &'static str) -> (ToolCallHandler, ToolResponseRegistry) {
        let catalog = ToolCatalog::new(
            vec![
                Arc::new(Clock) as Arc<dyn Tool>,
                Arc::new(Weather { reply }) as Arc<dyn Tool>,
            ],
            std::env::temp_dir(),
        )
        .unwrap();
        let registry = ToolResponseRegistry::new();
        (ToolCallHandler::new(Arc::new(catalog), registry.clone()), registry)
    }

    fn request(method: &str, arguments: Value, call_id: &str) -> RpcRequest {
        RpcRequest {
            method: method.to_string(),
            arguments,
            call_id: Some(call_id.to_string()),
        }
    }

    #[tokio::test]
    async fn structured_output_round_trips_unchanged() {
        let payload = r#"{"temp":21.5,"tags":["a","b"],"nested":{"n":null,"big":12345678901234}}"#;
        let (handler, registry) = handler(payload);
        let result = handler.handle(request("weather", json!({}), "c1")).await;

        assert!(!result.error);
        assert_eq!(result.value, serde_json::from_str::<Value>(payload).unwrap());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn rich_output_returns_marker_and_is_registered() {
        let (handler, registry) = handler("{}");
        let result = handler.handle(request("get_time", json!({}), "abc-123")).await;

        assert_eq!(result, RpcResult::ok(json!("<<TOOL_RESPONSE:abc-123>>")));
        let stored = registry.get("abc-123").await.unwrap();
        assert_eq!(stored.tool_name, "get_time");
        assert_eq!(stored.content, vec![ComplexContent::text("12:00")]);
    }

    #[tokio::test]
    async fn tool_failure_becomes_error_envelope() {
        let (handler, _) = handler("{}");
        let result = handler.handle(request("weather", json!({"fail": true}), "c2")).await;
        assert_eq!(result, RpcResult::err("weather service unavailable"));
    }

    #[tokio::test]
    async fn unknown_tool_and_invalid_structured_output_are_errors() {
        let (handler, _) = handler("not json");
        let unknown = handler.handle(request("nope", json!({}), "c3")).await;
        assert!(unknown.error);
        assert_eq!(unknown.value, json!("Tool nope not found"));

        let invalid = handler.handle(request("weather", json!({}), "c4")).await;
        assert!(invalid.error);
        assert!(invalid.value.as_str().unwrap().contains("invalid structured output"));
    }

    #[test]
    fn response_frame_matches_wire_format() {
        let frame = RpcFrame::response(Some("id-1".to_string()), RpcResult::ok(json!(3)));
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"response": {"jsonrpc": "2.0", "result": {"error": false, "value": 3}, "result_type": null, "call_id": "id-1"}})
        );
    }

    /// Stand-in for the sandbox: accepts one connection, sends the given
    /// frames, and returns whatever came back before closing.
    async fn fake_sandbox(frames: Vec<WsMessage>) -> (String, JoinHandle<Vec<Value>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mut replies = Vec::new();
            for frame in frames {
                ws.send(frame).await.unwrap();
                match ws.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        replies.push(serde_json::from_str(&text).unwrap())
                    }
                    other => panic!("unexpected reply: {other:?}"),
                }
            }
            ws.close(None).await.unwrap();
            replies
        });
        (url, server)
    }

    #[tokio::test]
    async fn serves_text_and_binary_frames_until_close() {
        let text = json!({"request": {"method": "get_time", "arguments": {}, "call_id": "t1"}});
        let binary = json!({"request": {"method": "weather", "arguments": {}, "call_id": "b1"}});
        let (url, server) = fake_sandbox(vec![
            WsMessage::Text(text.to_string().into()),
            WsMessage::Binary(binary.to_string().into_bytes().into()),
        ])
        .await;

        let (handler, registry) = handler(r#"{"ok":true}"#);
        serve_channel(&url, Arc::new(handler)).await.unwrap();
        let replies = server.await.unwrap();

        assert_eq!(replies[0]["response"]["call_id"], "t1");
        assert_eq!(replies[0]["response"]["result"]["value"], "<<TOOL_RESPONSE:t1>>");
        assert_eq!(replies[1]["response"]["call_id"], "b1");
        assert_eq!(replies[1]["response"]["result"]["value"], json!({"ok": true}));
        assert_eq!(registry.len().await, 1);
    }

    struct Slow;

    #[async_trait]
    impl CallHandler for Slow {
        async fn handle(&self, request: RpcRequest) -> RpcResult {
            if request.method == "slow" {
                tokio::time::sleep(Duration::from_millis(1500)).await;
            }
            RpcResult::ok(json!(request.method))
        }
    }

    #[tokio::test]
    async fn pings_and_other_calls_are_answered_while_a_tool_runs() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let slow = json!({"request": {"method": "slow", "arguments": {}, "call_id": "s1"}});
            let fast = json!({"request": {"method": "fast", "arguments": {}, "call_id": "f1"}});
            ws.send(WsMessage::Text(slow.to_string().into())).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            ws.send(WsMessage::Ping(b"keepalive".to_vec().into())).await.unwrap();
            ws.send(WsMessage::Text(fast.to_string().into())).await.unwrap();

            let mut seen = Vec::new();
            while seen.len() < 3 {
                match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
                    Ok(Some(Ok(WsMessage::Pong(payload)))) => {
                        assert_eq!(&payload[..], b"keepalive");
                        seen.push("pong".to_string());
                    }
                    Ok(Some(Ok(WsMessage::Text(text)))) => {
                        let reply: Value = serde_json::from_str(&text).unwrap();
                        seen.push(reply["response"]["call_id"].as_str().unwrap().to_string());
                    }
                    other => panic!("unexpected frame: {other:?}"),
                }
            }
            ws.close(None).await.unwrap();
            seen
        });

        serve_channel(&url, Arc::new(Slow)).await.unwrap();
        let seen = server.await.unwrap();

        assert_eq!(seen.len(), 3);
        assert_eq!(seen.last().unwrap(), "s1");
        assert!(seen[..2].contains(&"pong".to_string()));
        assert!(seen[..2].contains(&"f1".to_string()));
    }

    #[tokio::test]
    async fn connect_failure_aborts_the_run() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        drop(listener);

        let (abort, mut aborted) = RunAbort::channel();
        attach(url, Arc::new(Slow), abort).await.unwrap();
        let reason = aborted.recv().await.unwrap();
        assert!(reason.starts_with("Host bridge unavailable: Failed to connect"));
    }

    #[tokio::test]
    async fn connect_gives_up_when_nothing_listens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        drop(listener);

        let (handler, _) = handler("{}");
        let err = serve_channel(&url, Arc::new(handler)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Connect { .. }));
    }
}
