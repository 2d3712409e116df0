//! Conversation orchestrator: owns active runs, persists messages as they
//! arrive, and broadcasts events for the UI layer.
//!
//! Ordering contract: every message is written to the store before its event
//! is published, so a client that loads the conversation and then follows
//! events never observes a gap.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::cancel::CancelToken;
use crate::conversation::{ConversationStatus, ConversationStore, StoreError};
use crate::events::{topics, Broadcaster};
use crate::llm::{
    ModelInfo, ProviderAdapter, ProviderError, ProviderRouter, SendOptions, FALLBACK_TITLE,
};
use crate::message::Message;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("a run is already active for conversation {0}")]
    AlreadyRunning(String),
    #[error("no provider serves model {0}")]
    UnknownModel(String),
    #[error("conversation {0} not found")]
    ConversationNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

enum RunOutcome {
    Completed,
    Cancelled,
}

/// Drives model runs against conversations. At most one run per conversation
/// is active at a time.
pub struct ChatService {
    router: Arc<ProviderRouter>,
    store: Arc<dyn ConversationStore>,
    broadcaster: Arc<dyn Broadcaster>,
    runs: RwLock<HashMap<String, CancelToken>>,
}

impl ChatService {
    pub fn new(
        router: Arc<ProviderRouter>,
        store: Arc<dyn ConversationStore>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self {
            router,
            store,
            broadcaster,
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Aggregated model catalog across every registered provider.
    pub async fn all_supported_models(&self) -> Vec<ModelInfo> {
        self.router.all_supported_models().await
    }

    /// Run the model against the conversation's current history, persisting
    /// and broadcasting each message the adapter emits. Returns once the run
    /// finishes; Ok covers both completion and cancellation.
    pub async fn start_chat(
        &self,
        conversation_id: &str,
        options: SendOptions,
    ) -> Result<(), ChatError> {
        let adapter = self
            .router
            .service_for_model(&options.model)
            .await
            .ok_or_else(|| ChatError::UnknownModel(options.model.clone()))?;
        let mut conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| ChatError::ConversationNotFound(conversation_id.to_string()))?;

        let cancel = CancelToken::new();
        {
            let mut runs = self.runs.write().await;
            if runs.contains_key(conversation_id) {
                return Err(ChatError::AlreadyRunning(conversation_id.to_string()));
            }
            runs.insert(conversation_id.to_string(), cancel.clone());
        }

        conversation.status = ConversationStatus::Active;
        conversation.touch();
        let result = match self.store.update_conversation(conversation).await {
            Ok(()) => {
                self.publish_status(conversation_id, ConversationStatus::Active, None);
                self.drive_run(adapter, conversation_id, options, cancel).await
            }
            Err(e) => Err(ChatError::Store(e)),
        };

        self.runs.write().await.remove(conversation_id);
        let reason = match &result {
            Ok(RunOutcome::Completed) => "completed",
            Ok(RunOutcome::Cancelled) => "cancelled",
            Err(_) => "error",
        };
        self.finish_run(conversation_id, reason).await;
        result.map(|_| ())
    }

    async fn drive_run(
        &self,
        adapter: Arc<dyn ProviderAdapter>,
        conversation_id: &str,
        options: SendOptions,
        cancel: CancelToken,
    ) -> Result<RunOutcome, ChatError> {
        let history = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| ChatError::ConversationNotFound(conversation_id.to_string()))?
            .messages;
        let mut stream = adapter.send_message(history, options, cancel).await?;

        while let Some(item) = stream.recv().await {
            match item {
                Ok(message) => {
                    let mut conversation = self
                        .store
                        .get_conversation(conversation_id)
                        .await?
                        .ok_or_else(|| {
                            ChatError::ConversationNotFound(conversation_id.to_string())
                        })?;
                    conversation.push_message(message.clone());
                    self.store.update_conversation(conversation).await?;
                    self.broadcaster.publish(
                        topics::MESSAGE,
                        json!({ "conversationId": conversation_id, "message": message }),
                    );
                }
                Err(ProviderError::Aborted) => return Ok(RunOutcome::Cancelled),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(RunOutcome::Completed)
    }

    /// Mark the conversation inactive and announce how the run ended.
    /// Store failures here are logged, never propagated.
    async fn finish_run(&self, conversation_id: &str, reason: &str) {
        match self.store.get_conversation(conversation_id).await {
            Ok(Some(mut conversation)) => {
                conversation.status = ConversationStatus::Inactive;
                conversation.touch();
                if let Err(e) = self.store.update_conversation(conversation).await {
                    log::error!(
                        "failed to mark conversation {} inactive: {}",
                        conversation_id,
                        e
                    );
                }
            }
            Ok(None) => {
                log::warn!("conversation {} vanished during run", conversation_id);
            }
            Err(e) => {
                log::error!("failed to load conversation {}: {}", conversation_id, e);
            }
        }
        self.publish_status(conversation_id, ConversationStatus::Inactive, Some(reason));
    }

    fn publish_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
        reason: Option<&str>,
    ) {
        let mut payload = json!({ "conversationId": conversation_id, "status": status });
        if let Some(reason) = reason {
            payload["reason"] = json!(reason);
        }
        self.broadcaster.publish(topics::STATUS, payload);
    }

    /// Request cancellation of the conversation's active run. No-op when no
    /// run is active.
    pub async fn stop_chat(&self, conversation_id: &str) {
        if let Some(token) = self.runs.read().await.get(conversation_id).cloned() {
            token.cancel();
        }
    }

    /// Request cancellation of every active run.
    pub async fn stop_all(&self) {
        for token in self.runs.read().await.values() {
            token.cancel();
        }
    }

    /// Best-effort title generation from the conversation's first message.
    /// Every failure path falls back to a fixed title; nothing here can fail
    /// the caller.
    pub async fn generate_title(&self, conversation_id: &str, message: &str, model: &str) {
        let title = match self.router.service_for_model(model).await {
            Some(adapter) => adapter.generate_title(message, model).await,
            None => {
                log::warn!("no provider serves model {}; using fallback title", model);
                FALLBACK_TITLE.to_string()
            }
        };
        match self.store.get_conversation(conversation_id).await {
            Ok(Some(mut conversation)) => {
                conversation.title = title.clone();
                conversation.touch();
                if let Err(e) = self.store.update_conversation(conversation).await {
                    log::warn!("failed to persist title for {}: {}", conversation_id, e);
                    return;
                }
                self.broadcaster.publish(
                    topics::TITLE,
                    json!({ "conversationId": conversation_id, "title": title }),
                );
            }
            Ok(None) => {
                log::warn!("conversation {} not found for title update", conversation_id);
            }
            Err(e) => {
                log::warn!("failed to load conversation {}: {}", conversation_id, e);
            }
        }
    }

    /// Append a user message to the conversation, persisting before the
    /// event goes out.
    pub async fn append_user_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> Result<(), ChatError> {
        let mut conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| ChatError::ConversationNotFound(conversation_id.to_string()))?;
        conversation.push_message(message.clone());
        self.store.update_conversation(conversation).await?;
        self.broadcaster.publish(
            topics::MESSAGE,
            json!({ "conversationId": conversation_id, "message": message }),
        );
        Ok(())
    }
}
