//! LLM provider abstraction: adapter contract, model catalog types, and the
//! router that maps model ids to adapters.
//!
//! Each vendor adapter owns its wire conversion and runs the tool-call loop
//! itself; consumers only observe the normalized message stream.

mod anthropic;
mod openai;
mod router;

pub use anthropic::AnthropicAdapter;
pub use openai::OpenAiAdapter;
pub use router::ProviderRouter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::cancel::CancelToken;
use crate::message::Message;

/// Feature flags a model supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCapabilities {
    /// Extended "thinking" mode.
    pub thinking: bool,
}

/// One model in a provider's catalog, annotated with live availability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    /// Provider-specific identifier (e.g. "gpt-4o").
    pub id: String,
    /// Display name.
    pub name: String,
    pub provider: String,
    /// Whether a usable credential is currently configured.
    pub available: bool,
    #[serde(default)]
    pub capabilities: ModelCapabilities,
}

/// Options for one send.
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub model: String,
    pub thinking: bool,
    pub system_prompt: Option<String>,
}

impl SendOptions {
    pub fn model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            thinking: false,
            system_prompt: None,
        }
    }
}

/// Result of (re)building a vendor client from current credentials. Never an
/// `Err`: failures are data so reloads can't take the router down.
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl LoadOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider api error: {0}")]
    Api(String),
    #[error("provider not configured: {0}")]
    NotConfigured(String),
    /// Cooperative cancellation observed. A distinct non-error outcome for
    /// logging and UI purposes.
    #[error("run aborted")]
    Aborted,
    #[error(transparent)]
    Tool(#[from] crate::tools::ToolError),
    /// The per-run step cap on the tool-call loop was reached.
    #[error("tool-call loop exceeded {0} steps")]
    ToolLoopLimit(usize),
}

/// Stream of normalized messages from one run of the tool-call loop. The
/// channel closes when the model produces a final answer; failures arrive
/// in-stream.
pub type MessageStream = mpsc::Receiver<Result<Message, ProviderError>>;

/// Uniform per-vendor adapter contract.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_name(&self) -> &str;

    /// Static catalog annotated with a live `available` flag.
    async fn supported_models(&self) -> Vec<ModelInfo>;

    /// (Re)build the vendor client from current credentials. Idempotent and
    /// infallible at the signature level; failures are in the outcome.
    async fn load_settings(&self) -> LoadOutcome;

    /// Run the tool-call loop for one conversation turn. Configuration errors
    /// fail fast as `Err`; everything after the stream starts flows through
    /// the stream.
    async fn send_message(
        &self,
        history: Vec<Message>,
        options: SendOptions,
        cancel: CancelToken,
    ) -> Result<MessageStream, ProviderError>;

    /// Single low-token-budget title request. Best-effort: any failure yields
    /// the fixed fallback, never an error.
    async fn generate_title(&self, message: &str, model: &str) -> String;
}

/// Fallback title used whenever title generation fails.
pub const FALLBACK_TITLE: &str = "New conversation";

/// Upper bound on model-request round-trips within one run.
pub(crate) const MAX_TOOL_STEPS: usize = 10;

/// Retries for idempotent, pre-first-byte request failures only.
pub(crate) const MAX_REQUEST_RETRIES: usize = 2;

/// Send a request, retrying transient pre-first-byte failures with doubling
/// backoff and racing the whole attempt against cancellation. Never retries
/// once a response (and thus a byte) has been obtained.
pub(crate) async fn send_with_retry(
    request: reqwest::RequestBuilder,
    cancel: &CancelToken,
) -> Result<reqwest::Response, ProviderError> {
    let mut delay = Duration::from_millis(250);
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(ProviderError::Aborted);
        }
        let this = request
            .try_clone()
            .ok_or_else(|| ProviderError::Api("request body not retryable".to_string()))?;
        tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Aborted),
            res = this.send() => match res {
                Ok(response) => return Ok(response),
                Err(e) if attempt < MAX_REQUEST_RETRIES && (e.is_connect() || e.is_timeout()) => {
                    attempt += 1;
                    log::warn!(
                        "provider request failed before first byte (attempt {}), retrying: {}",
                        attempt,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(ProviderError::Request(e)),
            }
        }
    }
}
