//! OpenAI-compatible adapter: /v1/chat/completions with SSE streaming.
//!
//! Runs the tool-call loop against any OpenAI-compatible endpoint (the base
//! URL is configurable for local servers). Conversion notes: one internal
//! tool_result message fans out to N `role:"tool"` wire messages; this wire
//! shape has no error flag on tool messages, so `is_error` rides in-band as a
//! leading `[error]` marker; images inside tool results cannot be carried and
//! are dropped with a warning.

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::cancel::CancelToken;
use crate::message::{ContentBlock, Message, MessageContent, Role};
use crate::settings::{resolve_api_key, SettingsStore};
use crate::tools::{ToolDescriptor, ToolRegistry};

use super::{
    send_with_retry, LoadOutcome, MessageStream, ModelCapabilities, ModelInfo, ProviderAdapter,
    ProviderError, SendOptions, FALLBACK_TITLE, MAX_TOOL_STEPS,
};

const PROVIDER_NAME: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODELS: &[(&str, &str)] = &[("gpt-4o", "GPT-4o"), ("gpt-4o-mini", "GPT-4o mini")];
const TITLE_MAX_TOKENS: u32 = 24;
const TITLE_PROMPT: &str =
    "Reply with a short title (at most six words) for a conversation that starts \
     with the following message. Reply with the title only, no quotes.";
/// In-band error flag for tool wire messages (this wire shape has no
/// `is_error` field). The marker is not escaped: a genuine tool result whose
/// text starts with `"[error] "` reads back as an error through
/// [`messages_from_wire`]. The model sees the same text either way.
const ERROR_MARKER: &str = "[error] ";

#[derive(Clone)]
struct ClientState {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

/// Adapter for OpenAI-compatible chat completion endpoints.
pub struct OpenAiAdapter {
    settings: Arc<dyn SettingsStore>,
    tools: Arc<dyn ToolRegistry>,
    state: RwLock<Option<ClientState>>,
}

impl OpenAiAdapter {
    pub fn new(settings: Arc<dyn SettingsStore>, tools: Arc<dyn ToolRegistry>) -> Self {
        Self {
            settings,
            tools,
            state: RwLock::new(None),
        }
    }

    async fn snapshot(&self) -> Result<ClientState, ProviderError> {
        self.state.read().await.clone().ok_or_else(|| {
            ProviderError::NotConfigured(format!("no api key configured for {}", PROVIDER_NAME))
        })
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider_name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn supported_models(&self) -> Vec<ModelInfo> {
        let available = self.state.read().await.is_some();
        let configured = self
            .settings
            .get_user_settings()
            .map(|s| s.provider(PROVIDER_NAME).models)
            .unwrap_or_default();
        let catalog: Vec<(String, String)> = if configured.is_empty() {
            DEFAULT_MODELS
                .iter()
                .map(|(id, name)| (id.to_string(), name.to_string()))
                .collect()
        } else {
            configured.into_iter().map(|id| (id.clone(), id)).collect()
        };
        catalog
            .into_iter()
            .map(|(id, name)| ModelInfo {
                id,
                name,
                provider: PROVIDER_NAME.to_string(),
                available,
                capabilities: ModelCapabilities::default(),
            })
            .collect()
    }

    async fn load_settings(&self) -> LoadOutcome {
        let settings = match self.settings.get_user_settings() {
            Ok(s) => s,
            Err(e) => {
                *self.state.write().await = None;
                return LoadOutcome::failed(format!("reading settings: {}", e));
            }
        };
        match resolve_api_key(&settings, PROVIDER_NAME) {
            Some(api_key) => {
                let base_url = settings
                    .provider(PROVIDER_NAME)
                    .base_url
                    .map(|u| u.trim_end_matches('/').to_string())
                    .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
                *self.state.write().await = Some(ClientState {
                    client: reqwest::Client::new(),
                    api_key,
                    base_url,
                });
                LoadOutcome::ok()
            }
            None => {
                *self.state.write().await = None;
                LoadOutcome::failed(format!("no api key configured for {}", PROVIDER_NAME))
            }
        }
    }

    async fn send_message(
        &self,
        history: Vec<Message>,
        options: SendOptions,
        cancel: CancelToken,
    ) -> Result<MessageStream, ProviderError> {
        let state = self.snapshot().await?;
        let descriptors = self.tools.list_tools().await?;
        let wire_tools: Vec<WireTool> = descriptors.iter().map(tool_to_wire).collect();

        let mut transcript = Vec::new();
        if let Some(system) = &options.system_prompt {
            transcript.push(WireMessage::System {
                content: system.clone(),
            });
        }
        transcript.extend(messages_to_wire(&history));

        let registry = self.tools.clone();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            run_tool_loop(state, registry, transcript, wire_tools, options, cancel, tx).await;
        });
        Ok(rx)
    }

    async fn generate_title(&self, message: &str, model: &str) -> String {
        let state = match self.snapshot().await {
            Ok(s) => s,
            Err(_) => return FALLBACK_TITLE.to_string(),
        };
        let transcript = vec![
            WireMessage::System {
                content: TITLE_PROMPT.to_string(),
            },
            WireMessage::User {
                content: UserContent::Text(message.chars().take(2000).collect()),
            },
        ];
        match chat_once(&state, model, &transcript, Some(TITLE_MAX_TOKENS)).await {
            Ok(text) => {
                let title = clean_title(&text);
                if title.is_empty() {
                    FALLBACK_TITLE.to_string()
                } else {
                    title
                }
            }
            Err(e) => {
                log::warn!("openai: title generation failed: {}", e);
                FALLBACK_TITLE.to_string()
            }
        }
    }
}

/// One model-request → tool-invocation cycle until the model stops asking for
/// tools or the step cap is reached.
async fn run_tool_loop(
    state: ClientState,
    registry: Arc<dyn ToolRegistry>,
    mut transcript: Vec<WireMessage>,
    wire_tools: Vec<WireTool>,
    options: SendOptions,
    cancel: CancelToken,
    tx: mpsc::Sender<Result<Message, ProviderError>>,
) {
    for step in 0..MAX_TOOL_STEPS {
        if cancel.is_cancelled() {
            let _ = tx.send(Err(ProviderError::Aborted)).await;
            return;
        }
        log::debug!("openai: loop step {}", step + 1);
        let turn = match chat_stream(&state, &options.model, &transcript, &wire_tools, &cancel).await
        {
            Ok(t) => t,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        let assistant = turn.to_message();
        transcript.push(turn.to_wire());
        if tx.send(Ok(assistant)).await.is_err() {
            return;
        }
        if turn.tool_calls.is_empty() {
            return;
        }

        let mut result_blocks = Vec::with_capacity(turn.tool_calls.len());
        for call in &turn.tool_calls {
            log::info!("openai: invoking tool {}", call.name);
            let outcome = match registry.call_tool(&call.name, &call.args).await {
                Ok(o) => o,
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            };
            result_blocks.push(ContentBlock::ToolResult {
                tool_use_id: call.id.clone(),
                is_error: outcome.is_error,
                content: outcome.content.into_iter().map(Into::into).collect(),
            });
        }
        let tool_message = Message::tool_result(result_blocks);
        transcript.extend(messages_to_wire(std::slice::from_ref(&tool_message)));
        if tx.send(Ok(tool_message)).await.is_err() {
            return;
        }
    }
    let _ = tx.send(Err(ProviderError::ToolLoopLimit(MAX_TOOL_STEPS))).await;
}

// --- Wire types (OpenAI chat completions) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub(crate) enum WireMessage {
    System {
        content: String,
    },
    User {
        content: UserContent,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<WireToolCall>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum UserContent {
    Text(String),
    Parts(Vec<UserPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum UserPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub typ: String,
    pub function: WireFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireFunctionCall {
    pub name: String,
    /// JSON-encoded arguments object.
    pub arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    typ: String,
    function: WireToolFunction,
}

#[derive(Debug, Serialize)]
struct WireToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

fn tool_to_wire(descriptor: &ToolDescriptor) -> WireTool {
    WireTool {
        typ: "function".to_string(),
        function: WireToolFunction {
            name: descriptor.name.clone(),
            description: descriptor.description.clone(),
            parameters: descriptor.input_schema.clone(),
        },
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [WireMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [WireTool]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

fn data_uri(mime_type: &str, data: &str) -> String {
    format!("data:{};base64,{}", mime_type, data)
}

fn parse_data_uri(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (mime_type, data) = rest.split_once(";base64,")?;
    Some((mime_type.to_string(), data.to_string()))
}

/// Convert internal messages to wire form. A tool_result message with N
/// blocks becomes N consecutive tool wire messages.
pub(crate) fn messages_to_wire(messages: &[Message]) -> Vec<WireMessage> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            Role::User => out.push(user_to_wire(message)),
            Role::Assistant => out.push(assistant_to_wire(message)),
            Role::ToolResult => out.extend(tool_result_to_wire(message)),
        }
    }
    out
}

fn user_to_wire(message: &Message) -> WireMessage {
    match &message.content {
        MessageContent::Text(text) => WireMessage::User {
            content: UserContent::Text(text.clone()),
        },
        MessageContent::Blocks(blocks) => {
            let mut parts = Vec::with_capacity(blocks.len());
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => {
                        parts.push(UserPart::Text { text: text.clone() })
                    }
                    ContentBlock::Image { data, mime_type } => parts.push(UserPart::ImageUrl {
                        image_url: ImageUrl {
                            url: data_uri(mime_type, data),
                        },
                    }),
                    other => {
                        log::warn!("openai: dropping non-user block in user message: {:?}", other)
                    }
                }
            }
            WireMessage::User {
                content: UserContent::Parts(parts),
            }
        }
    }
}

fn assistant_to_wire(message: &Message) -> WireMessage {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in message.content.as_blocks() {
        match block {
            ContentBlock::Text { text: t } => text.push_str(&t),
            ContentBlock::ToolUse { id, name, args } => tool_calls.push(WireToolCall {
                id,
                typ: "function".to_string(),
                function: WireFunctionCall {
                    name,
                    arguments: serde_json::to_string(&args)
                        .unwrap_or_else(|_| "{}".to_string()),
                },
            }),
            other => log::warn!(
                "openai: dropping unsupported block in assistant message: {:?}",
                other
            ),
        }
    }
    WireMessage::Assistant {
        content: if text.is_empty() { None } else { Some(text) },
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
    }
}

fn tool_result_to_wire(message: &Message) -> Vec<WireMessage> {
    let mut out = Vec::new();
    for block in message.content.as_blocks() {
        match block {
            ContentBlock::ToolResult {
                tool_use_id,
                is_error,
                content,
            } => {
                let mut texts = Vec::new();
                for c in content {
                    match c {
                        crate::message::ToolResultContent::Text { text } => texts.push(text),
                        crate::message::ToolResultContent::Image { .. } => {
                            log::warn!(
                                "openai: dropping image from tool result {} (wire cannot carry it)",
                                tool_use_id
                            );
                        }
                    }
                }
                let body = texts.join("\n");
                let content = if is_error {
                    format!("{}{}", ERROR_MARKER, body)
                } else {
                    body
                };
                out.push(WireMessage::Tool {
                    tool_call_id: tool_use_id,
                    content,
                });
            }
            other => log::warn!(
                "openai: dropping non-result block in tool_result message: {:?}",
                other
            ),
        }
    }
    out
}

/// Inverse of [`messages_to_wire`]: consecutive tool wire messages regroup
/// into one tool_result message. Message ids are regenerated, and a tool
/// message starting with the error marker maps to `is_error: true` whether
/// or not the original outcome was an error (see [`ERROR_MARKER`]).
pub(crate) fn messages_from_wire(wire: &[WireMessage]) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::new();
    let mut pending_results: Vec<ContentBlock> = Vec::new();

    let flush = |pending: &mut Vec<ContentBlock>, out: &mut Vec<Message>| {
        if !pending.is_empty() {
            out.push(Message::tool_result(std::mem::take(pending)));
        }
    };

    for w in wire {
        match w {
            WireMessage::Tool {
                tool_call_id,
                content,
            } => {
                let (is_error, body) = match content.strip_prefix(ERROR_MARKER) {
                    Some(rest) => (true, rest),
                    None => (false, content.as_str()),
                };
                pending_results.push(ContentBlock::ToolResult {
                    tool_use_id: tool_call_id.clone(),
                    is_error,
                    content: vec![crate::message::ToolResultContent::Text {
                        text: body.to_string(),
                    }],
                });
            }
            WireMessage::System { .. } => {
                flush(&mut pending_results, &mut out);
                log::warn!("openai: dropping system message in wire conversion");
            }
            WireMessage::User { content } => {
                flush(&mut pending_results, &mut out);
                out.push(user_from_wire(content));
            }
            WireMessage::Assistant {
                content,
                tool_calls,
            } => {
                flush(&mut pending_results, &mut out);
                out.push(assistant_from_wire(
                    content.as_deref(),
                    tool_calls.as_deref(),
                ));
            }
        }
    }
    flush(&mut pending_results, &mut out);
    out
}

fn user_from_wire(content: &UserContent) -> Message {
    match content {
        UserContent::Text(text) => Message::user(text.clone()),
        UserContent::Parts(parts) => {
            let mut blocks = Vec::with_capacity(parts.len());
            for part in parts {
                match part {
                    UserPart::Text { text } => {
                        blocks.push(ContentBlock::Text { text: text.clone() })
                    }
                    UserPart::ImageUrl { image_url } => match parse_data_uri(&image_url.url) {
                        Some((mime_type, data)) => {
                            blocks.push(ContentBlock::Image { data, mime_type })
                        }
                        None => log::warn!("openai: dropping non-data image url"),
                    },
                }
            }
            Message {
                id: crate::message::new_message_id(),
                role: Role::User,
                content: MessageContent::Blocks(blocks),
            }
        }
    }
}

fn assistant_from_wire(content: Option<&str>, tool_calls: Option<&[WireToolCall]>) -> Message {
    let calls = tool_calls.unwrap_or(&[]);
    if calls.is_empty() {
        return Message::assistant(content.unwrap_or_default().to_string());
    }
    let mut blocks = Vec::new();
    if let Some(text) = content {
        if !text.is_empty() {
            blocks.push(ContentBlock::Text {
                text: text.to_string(),
            });
        }
    }
    for call in calls {
        blocks.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.function.name.clone(),
            args: serde_json::from_str(&call.function.arguments)
                .unwrap_or(serde_json::Value::Null),
        });
    }
    Message::assistant_blocks(blocks)
}

// --- Streaming ---

/// One complete assistant response accumulated from the stream.
struct AssistantTurn {
    content: String,
    tool_calls: Vec<CompletedToolCall>,
}

struct CompletedToolCall {
    id: String,
    name: String,
    args: serde_json::Value,
    raw_arguments: String,
}

impl AssistantTurn {
    fn to_message(&self) -> Message {
        let wire = self.to_wire();
        messages_from_wire(std::slice::from_ref(&wire))
            .pop()
            .unwrap_or_else(|| Message::assistant(String::new()))
    }

    fn to_wire(&self) -> WireMessage {
        let calls: Vec<WireToolCall> = self
            .tool_calls
            .iter()
            .map(|c| WireToolCall {
                id: c.id.clone(),
                typ: "function".to_string(),
                function: WireFunctionCall {
                    name: c.name.clone(),
                    arguments: c.raw_arguments.clone(),
                },
            })
            .collect();
        WireMessage::Assistant {
            content: if self.content.is_empty() {
                None
            } else {
                Some(self.content.clone())
            },
            tool_calls: if calls.is_empty() { None } else { Some(calls) },
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamDeltaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamDeltaToolCall {
    index: Option<u32>,
    id: Option<String>,
    function: Option<StreamDeltaFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamDeltaFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// POST /chat/completions with stream: true; accumulate text and indexed
/// tool-call deltas into one complete assistant turn.
async fn chat_stream(
    state: &ClientState,
    model: &str,
    transcript: &[WireMessage],
    tools: &[WireTool],
    cancel: &CancelToken,
) -> Result<AssistantTurn, ProviderError> {
    let url = format!("{}/chat/completions", state.base_url);
    let body = ChatRequest {
        model,
        messages: transcript,
        stream: true,
        tools: if tools.is_empty() { None } else { Some(tools) },
        max_tokens: None,
    };
    let request = state
        .client
        .post(&url)
        .bearer_auth(&state.api_key)
        .json(&body);
    let res = send_with_retry(request, cancel).await?;
    if !res.status().is_success() {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        return Err(ProviderError::Api(format!("{} {}", status, body)));
    }

    let mut stream = res.bytes_stream();
    let mut buffer = Vec::new();
    let mut content = String::new();
    let mut partial: Vec<PartialToolCall> = Vec::new();

    'outer: while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(ProviderError::Aborted);
        }
        let chunk = chunk.map_err(ProviderError::Request)?;
        buffer.extend_from_slice(&chunk);
        while let Some(pos) = buffer.windows(2).position(|w| w == b"\n\n") {
            let line_bytes: Vec<u8> = buffer.drain(..pos).collect();
            buffer.drain(..2);
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data: ") {
                if data == "[DONE]" {
                    break 'outer;
                }
                let event: StreamChunk = match serde_json::from_str(data) {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                let delta = event
                    .choices
                    .and_then(|c| c.into_iter().next())
                    .and_then(|c| c.delta);
                let Some(delta) = delta else { continue };
                if let Some(c) = delta.content {
                    content.push_str(&c);
                }
                for tc in delta.tool_calls.unwrap_or_default() {
                    let Some(idx) = tc.index else { continue };
                    while partial.len() <= idx as usize {
                        partial.push(PartialToolCall::default());
                    }
                    let slot = &mut partial[idx as usize];
                    if let Some(id) = tc.id {
                        slot.id = id;
                    }
                    if let Some(f) = tc.function {
                        if let Some(name) = f.name {
                            slot.name = name;
                        }
                        if let Some(args) = f.arguments {
                            slot.arguments.push_str(&args);
                        }
                    }
                }
            }
        }
    }

    let tool_calls = partial
        .into_iter()
        .enumerate()
        .map(|(i, p)| CompletedToolCall {
            id: if p.id.is_empty() {
                format!("call_{}", i)
            } else {
                p.id
            },
            name: p.name,
            args: serde_json::from_str(&p.arguments).unwrap_or(serde_json::Value::Null),
            raw_arguments: p.arguments,
        })
        .collect();

    Ok(AssistantTurn {
        content,
        tool_calls,
    })
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Option<Vec<ChatChoice>>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// Single non-streaming completion; used for title generation.
async fn chat_once(
    state: &ClientState,
    model: &str,
    transcript: &[WireMessage],
    max_tokens: Option<u32>,
) -> Result<String, ProviderError> {
    let url = format!("{}/chat/completions", state.base_url);
    let body = ChatRequest {
        model,
        messages: transcript,
        stream: false,
        tools: None,
        max_tokens,
    };
    let request = state
        .client
        .post(&url)
        .bearer_auth(&state.api_key)
        .json(&body);
    let res = send_with_retry(request, &CancelToken::new()).await?;
    if !res.status().is_success() {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        return Err(ProviderError::Api(format!("{} {}", status, body)));
    }
    let data: ChatResponse = res.json().await?;
    Ok(data
        .choices
        .and_then(|c| c.into_iter().next())
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .unwrap_or_default())
}

pub(crate) fn clean_title(raw: &str) -> String {
    let first_line = raw.lines().next().unwrap_or_default();
    let trimmed = first_line.trim().trim_matches(['"', '\'']).trim();
    trimmed.chars().take(80).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolResultContent;

    fn roles_and_content(messages: &[Message]) -> Vec<(Role, MessageContent)> {
        messages
            .iter()
            .map(|m| (m.role, m.content.clone()))
            .collect()
    }

    #[test]
    fn tool_result_with_n_blocks_expands_to_n_wire_messages() {
        let message = Message::tool_result(vec![
            ContentBlock::ToolResult {
                tool_use_id: "tu-1".to_string(),
                is_error: false,
                content: vec![ToolResultContent::Text {
                    text: "4".to_string(),
                }],
            },
            ContentBlock::ToolResult {
                tool_use_id: "tu-2".to_string(),
                is_error: true,
                content: vec![ToolResultContent::Text {
                    text: "boom".to_string(),
                }],
            },
        ]);
        let wire = messages_to_wire(std::slice::from_ref(&message));
        assert_eq!(wire.len(), 2);
        match &wire[0] {
            WireMessage::Tool {
                tool_call_id,
                content,
            } => {
                assert_eq!(tool_call_id, "tu-1");
                assert_eq!(content, "4");
            }
            other => panic!("expected tool message, got {:?}", other),
        }
        match &wire[1] {
            WireMessage::Tool {
                tool_call_id,
                content,
            } => {
                assert_eq!(tool_call_id, "tu-2");
                assert_eq!(content, "[error] boom");
            }
            other => panic!("expected tool message, got {:?}", other),
        }
    }

    #[test]
    fn wire_round_trip_preserves_roles_and_content() {
        let history = vec![
            Message::user("what's in this picture?"),
            Message {
                id: crate::message::new_message_id(),
                role: Role::User,
                content: MessageContent::Blocks(vec![
                    ContentBlock::Text {
                        text: "see attached".to_string(),
                    },
                    ContentBlock::Image {
                        data: "aGVsbG8=".to_string(),
                        mime_type: "image/png".to_string(),
                    },
                ]),
            },
            Message::assistant_blocks(vec![
                ContentBlock::Text {
                    text: "let me check".to_string(),
                },
                ContentBlock::ToolUse {
                    id: "tu-1".to_string(),
                    name: "calc".to_string(),
                    args: serde_json::json!({"expr": "2+2"}),
                },
                ContentBlock::ToolUse {
                    id: "tu-2".to_string(),
                    name: "clock".to_string(),
                    args: serde_json::json!({}),
                },
            ]),
            Message::tool_result(vec![
                ContentBlock::ToolResult {
                    tool_use_id: "tu-1".to_string(),
                    is_error: false,
                    content: vec![ToolResultContent::Text {
                        text: "4".to_string(),
                    }],
                },
                ContentBlock::ToolResult {
                    tool_use_id: "tu-2".to_string(),
                    is_error: true,
                    content: vec![ToolResultContent::Text {
                        text: "clock offline".to_string(),
                    }],
                },
            ]),
            Message::assistant("The answer is 4"),
        ];

        let wire = messages_to_wire(&history);
        let back = messages_from_wire(&wire);
        assert_eq!(roles_and_content(&back), roles_and_content(&history));
    }

    #[test]
    fn tool_use_arguments_survive_as_json() {
        let message = Message::assistant_blocks(vec![ContentBlock::ToolUse {
            id: "tu-9".to_string(),
            name: "search".to_string(),
            args: serde_json::json!({"query": "rust", "limit": 3}),
        }]);
        let wire = messages_to_wire(std::slice::from_ref(&message));
        let back = messages_from_wire(&wire);
        let uses = back[0].tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].2["limit"], 3);
    }

    #[test]
    fn marker_prefixed_text_reads_back_as_error() {
        // The marker is in-band and unescaped, so this collision is by
        // definition of the wire encoding.
        let message = Message::tool_result(vec![ContentBlock::ToolResult {
            tool_use_id: "tu-1".to_string(),
            is_error: false,
            content: vec![ToolResultContent::Text {
                text: "[error] is how the log line starts".to_string(),
            }],
        }]);
        let back = messages_from_wire(&messages_to_wire(std::slice::from_ref(&message)));
        match &back[0].content.as_blocks()[..] {
            [ContentBlock::ToolResult { is_error, content, .. }] => {
                assert!(*is_error);
                assert_eq!(
                    content,
                    &vec![ToolResultContent::Text {
                        text: "is how the log line starts".to_string()
                    }]
                );
            }
            other => panic!("expected one tool result block, got {:?}", other),
        }
    }

    #[test]
    fn data_uri_parse_round_trip() {
        let uri = data_uri("image/jpeg", "QUJD");
        assert_eq!(
            parse_data_uri(&uri),
            Some(("image/jpeg".to_string(), "QUJD".to_string()))
        );
        assert_eq!(parse_data_uri("https://example.com/x.png"), None);
    }

    #[test]
    fn clean_title_strips_quotes_and_extra_lines() {
        assert_eq!(clean_title("\"Weather talk\"\nmore"), "Weather talk");
        assert_eq!(clean_title("  plain  "), "plain");
        assert_eq!(clean_title(""), "");
    }
}
