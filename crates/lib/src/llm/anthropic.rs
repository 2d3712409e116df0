//! Anthropic Messages API adapter.
//!
//! Non-streaming: each loop step is one POST to /v1/messages and the complete
//! assistant turn comes back in the response body. The wire format is
//! block-structured like the internal model, so conversion is lossless in
//! both directions (images in tool results included). Thinking blocks in
//! responses are dropped with a warning.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::cancel::CancelToken;
use crate::message::{ContentBlock, Message, MessageContent, Role, ToolResultContent};
use crate::settings::{resolve_api_key, SettingsStore};
use crate::tools::{ToolDescriptor, ToolRegistry};

use super::{
    send_with_retry, LoadOutcome, MessageStream, ModelCapabilities, ModelInfo, ProviderAdapter,
    ProviderError, SendOptions, FALLBACK_TITLE, MAX_TOOL_STEPS,
};

const PROVIDER_NAME: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;
const THINKING_BUDGET_TOKENS: u32 = 1024;
const TITLE_MAX_TOKENS: u32 = 24;
const TITLE_PROMPT: &str =
    "Reply with a short title (at most six words) for a conversation that starts \
     with the following message. Reply with the title only, no quotes.";

const DEFAULT_MODELS: &[(&str, &str, bool)] = &[
    ("claude-3-7-sonnet-20250219", "Claude 3.7 Sonnet", true),
    ("claude-3-5-haiku-20241022", "Claude 3.5 Haiku", false),
];

#[derive(Clone)]
struct ClientState {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

/// Adapter for the Anthropic Messages API.
pub struct AnthropicAdapter {
    settings: Arc<dyn SettingsStore>,
    tools: Arc<dyn ToolRegistry>,
    state: RwLock<Option<ClientState>>,
}

impl AnthropicAdapter {
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

fn thinking_capable(model_id: &str) -> bool {
    DEFAULT_MODELS
        .iter()
        .any(|(id, _, thinking)| *thinking && model_id == *id)
}

#[async_trait::async_trait]
impl ProviderAdapter for AnthropicAdapter {
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
        let catalog: Vec<(String, String, bool)> = if configured.is_empty() {
            DEFAULT_MODELS
                .iter()
                .map(|(id, name, thinking)| (id.to_string(), name.to_string(), *thinking))
                .collect()
        } else {
            configured
                .into_iter()
                .map(|id| {
                    let thinking = thinking_capable(&id);
                    (id.clone(), id, thinking)
                })
                .collect()
        };
        catalog
            .into_iter()
            .map(|(id, name, thinking)| ModelInfo {
                id,
                name,
                provider: PROVIDER_NAME.to_string(),
                available,
                capabilities: ModelCapabilities { thinking },
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
        let transcript = messages_to_wire(&history);

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
        let transcript = vec![WireMessage {
            role: "user".to_string(),
            content: vec![WireBlock::Text {
                text: message.chars().take(2000).collect(),
            }],
        }];
        let request = ApiRequest {
            model,
            max_tokens: TITLE_MAX_TOKENS,
            messages: &transcript,
            system: Some(TITLE_PROMPT),
            tools: None,
            thinking: None,
        };
        match request_once(&state, &request, &CancelToken::new()).await {
            Ok(response) => {
                let text = response_text(&response);
                let title = super::openai::clean_title(&text);
                if title.is_empty() {
                    FALLBACK_TITLE.to_string()
                } else {
                    title
                }
            }
            Err(e) => {
                log::warn!("anthropic: title generation failed: {}", e);
                FALLBACK_TITLE.to_string()
            }
        }
    }
}

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
        log::debug!("anthropic: loop step {}", step + 1);
        let request = ApiRequest {
            model: &options.model,
            max_tokens: MAX_TOKENS,
            messages: &transcript,
            system: options.system_prompt.as_deref(),
            tools: if wire_tools.is_empty() {
                None
            } else {
                Some(&wire_tools)
            },
            thinking: if options.thinking {
                Some(ThinkingConfig {
                    typ: "enabled",
                    budget_tokens: THINKING_BUDGET_TOKENS,
                })
            } else {
                None
            },
        };
        let response = match request_once(&state, &request, &cancel).await {
            Ok(r) => r,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        let blocks = response_blocks(&response);
        let assistant = assistant_message(&blocks);
        let tool_calls: Vec<(String, String, serde_json::Value)> = assistant
            .tool_uses()
            .into_iter()
            .map(|(id, name, args)| (id.to_string(), name.to_string(), args.clone()))
            .collect();
        transcript.push(WireMessage {
            role: "assistant".to_string(),
            content: blocks,
        });
        if tx.send(Ok(assistant)).await.is_err() {
            return;
        }
        if tool_calls.is_empty() {
            return;
        }

        let mut result_blocks = Vec::with_capacity(tool_calls.len());
        for (id, name, args) in &tool_calls {
            log::info!("anthropic: invoking tool {}", name);
            let outcome = match registry.call_tool(name, args).await {
                Ok(o) => o,
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            };
            result_blocks.push(ContentBlock::ToolResult {
                tool_use_id: id.clone(),
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

// --- Wire types (Anthropic messages) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireMessage {
    pub role: String,
    pub content: Vec<WireBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum WireBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        is_error: bool,
        content: Vec<WireResultContent>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ImageSource {
    #[serde(rename = "type")]
    pub typ: String,
    pub media_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum WireResultContent {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

fn tool_to_wire(descriptor: &ToolDescriptor) -> WireTool {
    WireTool {
        name: descriptor.name.clone(),
        description: descriptor.description.clone(),
        input_schema: descriptor.input_schema.clone(),
    }
}

#[derive(Debug, Serialize)]
struct ThinkingConfig {
    #[serde(rename = "type")]
    typ: &'static str,
    budget_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: &'a [WireMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [WireTool]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<ThinkingConfig>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    /// Raw content blocks; unknown block types are tolerated and dropped.
    content: Vec<serde_json::Value>,
}

fn base64_source(mime_type: &str, data: &str) -> ImageSource {
    ImageSource {
        typ: "base64".to_string(),
        media_type: mime_type.to_string(),
        data: data.to_string(),
    }
}

fn block_to_wire(block: &ContentBlock) -> WireBlock {
    match block {
        ContentBlock::Text { text } => WireBlock::Text { text: text.clone() },
        ContentBlock::Image { data, mime_type } => WireBlock::Image {
            source: base64_source(mime_type, data),
        },
        ContentBlock::ToolUse { id, name, args } => WireBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: args.clone(),
        },
        ContentBlock::ToolResult {
            tool_use_id,
            is_error,
            content,
        } => WireBlock::ToolResult {
            tool_use_id: tool_use_id.clone(),
            is_error: *is_error,
            content: content
                .iter()
                .map(|c| match c {
                    ToolResultContent::Text { text } => {
                        WireResultContent::Text { text: text.clone() }
                    }
                    ToolResultContent::Image { data, mime_type } => WireResultContent::Image {
                        source: base64_source(mime_type, data),
                    },
                })
                .collect(),
        },
    }
}

fn block_from_wire(block: &WireBlock) -> ContentBlock {
    match block {
        WireBlock::Text { text } => ContentBlock::Text { text: text.clone() },
        WireBlock::Image { source } => ContentBlock::Image {
            data: source.data.clone(),
            mime_type: source.media_type.clone(),
        },
        WireBlock::ToolUse { id, name, input } => ContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            args: input.clone(),
        },
        WireBlock::ToolResult {
            tool_use_id,
            is_error,
            content,
        } => ContentBlock::ToolResult {
            tool_use_id: tool_use_id.clone(),
            is_error: *is_error,
            content: content
                .iter()
                .map(|c| match c {
                    WireResultContent::Text { text } => {
                        ToolResultContent::Text { text: text.clone() }
                    }
                    WireResultContent::Image { source } => ToolResultContent::Image {
                        data: source.data.clone(),
                        mime_type: source.media_type.clone(),
                    },
                })
                .collect(),
        },
    }
}

/// Convert internal messages to wire form. Tool results travel as user-role
/// messages, per the Messages API.
pub(crate) fn messages_to_wire(messages: &[Message]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|message| {
            let role = match message.role {
                Role::Assistant => "assistant",
                Role::User | Role::ToolResult => "user",
            };
            WireMessage {
                role: role.to_string(),
                content: message.content.as_blocks().iter().map(block_to_wire).collect(),
            }
        })
        .collect()
}

/// Inverse of [`messages_to_wire`]. A user-role wire message made entirely of
/// tool_result blocks maps back to a tool_result message. Ids are
/// regenerated.
pub(crate) fn messages_from_wire(wire: &[WireMessage]) -> Vec<Message> {
    wire.iter()
        .map(|w| {
            let blocks: Vec<ContentBlock> = w.content.iter().map(block_from_wire).collect();
            let all_results = !blocks.is_empty()
                && blocks
                    .iter()
                    .all(|b| matches!(b, ContentBlock::ToolResult { .. }));
            let role = match (w.role.as_str(), all_results) {
                ("assistant", _) => Role::Assistant,
                (_, true) => Role::ToolResult,
                (_, false) => Role::User,
            };
            Message {
                id: crate::message::new_message_id(),
                role,
                content: MessageContent::Blocks(blocks),
            }
        })
        .collect()
}

/// Parse response content, keeping text/tool_use blocks and dropping
/// thinking and any unknown block types.
fn response_blocks(response: &ApiResponse) -> Vec<WireBlock> {
    let mut out = Vec::with_capacity(response.content.len());
    for value in &response.content {
        match serde_json::from_value::<WireBlock>(value.clone()) {
            Ok(block) => out.push(block),
            Err(_) => {
                let typ = value
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("unknown");
                log::warn!("anthropic: dropping unsupported response block: {}", typ);
            }
        }
    }
    out
}

fn assistant_message(blocks: &[WireBlock]) -> Message {
    let wire = WireMessage {
        role: "assistant".to_string(),
        content: blocks.to_vec(),
    };
    messages_from_wire(std::slice::from_ref(&wire))
        .pop()
        .unwrap_or_else(|| Message::assistant(String::new()))
}

fn response_text(response: &ApiResponse) -> String {
    response_blocks(response)
        .iter()
        .filter_map(|b| match b {
            WireBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

async fn request_once(
    state: &ClientState,
    request: &ApiRequest<'_>,
    cancel: &CancelToken,
) -> Result<ApiResponse, ProviderError> {
    let url = format!("{}/messages", state.base_url);
    let builder = state
        .client
        .post(&url)
        .header("x-api-key", &state.api_key)
        .header("anthropic-version", API_VERSION)
        .json(request);
    let res = send_with_retry(builder, cancel).await?;
    if !res.status().is_success() {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        return Err(ProviderError::Api(format!("{} {}", status, body)));
    }
    Ok(res.json().await?)
}
