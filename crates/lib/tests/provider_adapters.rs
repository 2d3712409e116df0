//! Production adapter tests against a local scripted HTTP server: the real
//! tool-call loop, transcript assembly, step cap, and cancellation paths.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use lib::cancel::CancelToken;
use lib::llm::{AnthropicAdapter, OpenAiAdapter, ProviderAdapter, ProviderError, SendOptions};
use lib::message::{ContentBlock, Message, Role, ToolResultContent};
use lib::settings::{ProviderSettings, StaticSettings, UserSettings};
use lib::tools::{ToolDescriptor, ToolError, ToolOutcome, ToolRegistry};

struct CalcTools;

#[async_trait::async_trait]
impl ToolRegistry for CalcTools {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        Ok(vec![ToolDescriptor {
            name: "calc".to_string(),
            description: "Evaluate an arithmetic expression".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": { "expr": { "type": "string" } },
            }),
        }])
    }

    async fn call_tool(
        &self,
        name: &str,
        args: &serde_json::Value,
    ) -> Result<ToolOutcome, ToolError> {
        match (name, args["expr"].as_str()) {
            ("calc", Some("2+2")) => Ok(ToolOutcome::text("4")),
            _ => Ok(ToolOutcome::error(format!("unknown call: {}", name))),
        }
    }
}

/// Minimal HTTP/1.1 stub: serves the scripted bodies one connection each (or
/// the first body forever), capturing every request body it receives.
async fn spawn_stub(bodies: Vec<String>, repeat: bool) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut served = 0;
        loop {
            let body = if repeat {
                bodies[0].clone()
            } else {
                match bodies.get(served) {
                    Some(b) => b.clone(),
                    None => return,
                }
            };
            served += 1;
            let (mut socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let request_body = read_request(&mut socket).await;
            let _ = tx.send(request_body);
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    (base_url, rx)
}

/// Read one request and return its body (content-length framing only).
async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf: Vec<u8> = Vec::new();
    let mut tmp = [0u8; 4096];
    let (body_start, content_length) = loop {
        let n = match socket.read(&mut tmp).await {
            Ok(0) | Err(_) => return String::from_utf8_lossy(&buf).into_owned(),
            Ok(n) => n,
        };
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
            let length = headers
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            break (pos + 4, length);
        }
    };
    while buf.len() < body_start + content_length {
        match socket.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
        }
    }
    String::from_utf8_lossy(&buf[body_start..]).into_owned()
}

fn settings_for(provider: &str, base_url: &str) -> Arc<StaticSettings> {
    let mut settings = UserSettings::default();
    settings.provider_settings.insert(
        provider.to_string(),
        ProviderSettings {
            api_key: Some("sk-test".to_string()),
            base_url: Some(base_url.to_string()),
            models: vec![],
        },
    );
    Arc::new(StaticSettings(settings))
}

async fn collect(mut stream: lib::llm::MessageStream) -> Vec<Result<Message, ProviderError>> {
    let mut out = Vec::new();
    while let Some(item) = stream.recv().await {
        out.push(item);
    }
    out
}

fn sse(events: &[&str]) -> String {
    let mut body = String::new();
    for event in events {
        body.push_str("data: ");
        body.push_str(event);
        body.push_str("\n\n");
    }
    body.push_str("data: [DONE]\n\n");
    body
}

#[tokio::test]
async fn openai_loop_runs_tools_and_builds_the_transcript() {
    let tool_turn = sse(&[
        r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"tu-1","function":{"name":"calc","arguments":"{\"expr\":"}}]}}]}"#,
        r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"2+2\"}"}}]}}]}"#,
    ]);
    let final_turn = sse(&[
        r#"{"choices":[{"delta":{"content":"The answer"}}]}"#,
        r#"{"choices":[{"delta":{"content":" is 4"}}]}"#,
    ]);
    let (base_url, mut requests) = spawn_stub(vec![tool_turn, final_turn], false).await;

    let adapter = OpenAiAdapter::new(settings_for("openai", &base_url), Arc::new(CalcTools));
    assert!(adapter.load_settings().await.success);

    let stream = adapter
        .send_message(
            vec![Message::user("what is 2+2?")],
            SendOptions::model("gpt-4o"),
            CancelToken::new(),
        )
        .await
        .unwrap();
    let out: Vec<Message> = collect(stream).await.into_iter().map(|r| r.unwrap()).collect();

    let roles: Vec<Role> = out.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::Assistant, Role::ToolResult, Role::Assistant]);

    let uses = out[0].tool_uses();
    assert_eq!(uses.len(), 1);
    assert_eq!(uses[0].0, "tu-1");
    assert_eq!(uses[0].1, "calc");
    assert_eq!(uses[0].2, &serde_json::json!({"expr": "2+2"}));

    match &out[1].content.as_blocks()[..] {
        [ContentBlock::ToolResult {
            tool_use_id,
            is_error,
            content,
        }] => {
            assert_eq!(tool_use_id, "tu-1");
            assert!(!*is_error);
            assert_eq!(
                content,
                &vec![ToolResultContent::Text {
                    text: "4".to_string()
                }]
            );
        }
        other => panic!("expected one tool result block, got {:?}", other),
    }
    assert_eq!(out[2].text(), "The answer is 4");

    // The second request must carry the whole loop transcript.
    let _first = requests.recv().await.unwrap();
    let second: serde_json::Value =
        serde_json::from_str(&requests.recv().await.unwrap()).unwrap();
    assert_eq!(second["tools"][0]["function"]["name"], "calc");
    let messages = second["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["tool_calls"][0]["id"], "tu-1");
    assert_eq!(messages[2]["role"], "tool");
    assert_eq!(messages[2]["tool_call_id"], "tu-1");
    assert_eq!(messages[2]["content"], "4");
}

#[tokio::test]
async fn openai_runaway_loop_stops_at_the_cap() {
    let tool_turn = sse(&[
        r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"tu-1","function":{"name":"calc","arguments":"{\"expr\":\"2+2\"}"}}]}}]}"#,
    ]);
    let (base_url, _requests) = spawn_stub(vec![tool_turn], true).await;

    let adapter = OpenAiAdapter::new(settings_for("openai", &base_url), Arc::new(CalcTools));
    assert!(adapter.load_settings().await.success);

    let stream = adapter
        .send_message(
            vec![Message::user("loop forever")],
            SendOptions::model("gpt-4o"),
            CancelToken::new(),
        )
        .await
        .unwrap();
    let out = collect(stream).await;

    // assistant/tool_result pairs up to the cap, then the limit error
    assert_eq!(out.len(), 21);
    assert!(out[..20].iter().all(|r| r.is_ok()));
    assert!(matches!(
        out.last().unwrap(),
        Err(ProviderError::ToolLoopLimit(_))
    ));
}

#[tokio::test]
async fn openai_cancelled_token_aborts_before_any_request() {
    let (base_url, mut requests) = spawn_stub(Vec::new(), false).await;

    let adapter = OpenAiAdapter::new(settings_for("openai", &base_url), Arc::new(CalcTools));
    assert!(adapter.load_settings().await.success);

    let cancel = CancelToken::new();
    cancel.cancel();
    let stream = adapter
        .send_message(
            vec![Message::user("hello")],
            SendOptions::model("gpt-4o"),
            cancel,
        )
        .await
        .unwrap();
    let out = collect(stream).await;

    assert_eq!(out.len(), 1);
    assert!(matches!(out[0], Err(ProviderError::Aborted)));
    assert!(requests.try_recv().is_err());
}

#[tokio::test]
async fn anthropic_loop_runs_tools_and_drops_thinking_blocks() {
    let tool_turn =
        r#"{"content":[{"type":"tool_use","id":"tu-1","name":"calc","input":{"expr":"2+2"}}]}"#
            .to_string();
    let final_turn = r#"{"content":[{"type":"thinking","thinking":"hmm","signature":"s"},{"type":"text","text":"The answer is 4"}]}"#
        .to_string();
    let (base_url, mut requests) = spawn_stub(vec![tool_turn, final_turn], false).await;

    let adapter = AnthropicAdapter::new(settings_for("anthropic", &base_url), Arc::new(CalcTools));
    assert!(adapter.load_settings().await.success);

    let stream = adapter
        .send_message(
            vec![Message::user("what is 2+2?")],
            SendOptions::model("claude-3-5-haiku-20241022"),
            CancelToken::new(),
        )
        .await
        .unwrap();
    let out: Vec<Message> = collect(stream).await.into_iter().map(|r| r.unwrap()).collect();

    let roles: Vec<Role> = out.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::Assistant, Role::ToolResult, Role::Assistant]);
    assert_eq!(out[0].tool_uses().len(), 1);
    assert_eq!(
        out[2].content.as_blocks(),
        vec![ContentBlock::Text {
            text: "The answer is 4".to_string()
        }]
    );

    let _first = requests.recv().await.unwrap();
    let second: serde_json::Value =
        serde_json::from_str(&requests.recv().await.unwrap()).unwrap();
    assert!(second["max_tokens"].as_u64().unwrap() > 0);
    assert_eq!(second["tools"][0]["name"], "calc");
    let messages = second["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[2]["role"], "user");
    assert_eq!(messages[2]["content"][0]["type"], "tool_result");
    assert_eq!(messages[2]["content"][0]["tool_use_id"], "tu-1");
    assert_eq!(messages[2]["content"][0]["is_error"], false);
    assert_eq!(messages[2]["content"][0]["content"][0]["text"], "4");
}

#[tokio::test]
async fn anthropic_runaway_loop_stops_at_the_cap() {
    let tool_turn =
        r#"{"content":[{"type":"tool_use","id":"tu-1","name":"calc","input":{"expr":"2+2"}}]}"#
            .to_string();
    let (base_url, _requests) = spawn_stub(vec![tool_turn], true).await;

    let adapter = AnthropicAdapter::new(settings_for("anthropic", &base_url), Arc::new(CalcTools));
    assert!(adapter.load_settings().await.success);

    let stream = adapter
        .send_message(
            vec![Message::user("loop forever")],
            SendOptions::model("claude-3-5-haiku-20241022"),
            CancelToken::new(),
        )
        .await
        .unwrap();
    let out = collect(stream).await;

    assert_eq!(out.len(), 21);
    assert!(matches!(
        out.last().unwrap(),
        Err(ProviderError::ToolLoopLimit(_))
    ));
}

#[tokio::test]
async fn adapter_without_credentials_fails_fast() {
    std::env::remove_var("OPENAI_API_KEY");
    let adapter = OpenAiAdapter::new(
        Arc::new(StaticSettings(UserSettings::default())),
        Arc::new(CalcTools),
    );
    let outcome = adapter.load_settings().await;
    assert!(!outcome.success);

    let err = adapter
        .send_message(
            vec![Message::user("hello")],
            SendOptions::model("gpt-4o"),
            CancelToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::NotConfigured(_)));
}
