//! Conversations and the storage seam the orchestrator appends through.
//!
//! A conversation is created empty and inactive, flips to active while a run
//! is in flight, and always reverts to inactive when the run ends. History is
//! append-only during a run; `updated_at` is refreshed on every mutation and
//! is the sort key for listings.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Inactive,
}

/// A conversation: ordered message history plus lifecycle status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub messages: Vec<Message>,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// New empty conversation, status inactive.
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("conv-{}", uuid::Uuid::new_v4()),
            title: title.into(),
            project_id: None,
            messages: Vec::new(),
            status: ConversationStatus::Inactive,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a message and refresh `updated_at`.
    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conversation not found: {0}")]
    NotFound(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Storage collaborator. `get`/`update` are an atomic single-record
/// read/replace pair; the orchestrator only ever appends through them during
/// a run.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError>;
    /// Replace the stored record wholesale. Errors if the id is unknown.
    async fn update_conversation(&self, conversation: Conversation) -> Result<(), StoreError>;
    async fn create_conversation(&self, conversation: Conversation) -> Result<(), StoreError>;
    async fn delete_conversation(&self, id: &str) -> Result<(), StoreError>;
    /// All conversations, most recently updated first.
    async fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError>;
}

/// In-memory store used by the CLI and tests.
pub struct MemoryConversationStore {
    inner: Arc<RwLock<HashMap<String, Conversation>>>,
}

impl Default for MemoryConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        Ok(self.inner.read().await.get(id).cloned())
    }

    async fn update_conversation(&self, mut conversation: Conversation) -> Result<(), StoreError> {
        let mut g = self.inner.write().await;
        if !g.contains_key(&conversation.id) {
            return Err(StoreError::NotFound(conversation.id));
        }
        conversation.touch();
        g.insert(conversation.id.clone(), conversation);
        Ok(())
    }

    async fn create_conversation(&self, conversation: Conversation) -> Result<(), StoreError> {
        let mut g = self.inner.write().await;
        if g.contains_key(&conversation.id) {
            return Err(StoreError::Backend(format!(
                "conversation already exists: {}",
                conversation.id
            )));
        }
        g.insert(conversation.id.clone(), conversation);
        Ok(())
    }

    async fn delete_conversation(&self, id: &str) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        let mut all: Vec<Conversation> = self.inner.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get_roundtrip() {
        let store = MemoryConversationStore::new();
        let conv = Conversation::new("test");
        let id = conv.id.clone();
        store.create_conversation(conv).await.unwrap();
        let loaded = store.get_conversation(&id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "test");
        assert_eq!(loaded.status, ConversationStatus::Inactive);
        assert!(loaded.messages.is_empty());
    }

    #[tokio::test]
    async fn update_unknown_conversation_errors() {
        let store = MemoryConversationStore::new();
        let conv = Conversation::new("orphan");
        let err = store.update_conversation(conv).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_refreshes_updated_at_and_sorts_listing() {
        let store = MemoryConversationStore::new();
        let a = Conversation::new("a");
        let b = Conversation::new("b");
        let a_id = a.id.clone();
        store.create_conversation(a).await.unwrap();
        store.create_conversation(b).await.unwrap();

        let mut a = store.get_conversation(&a_id).await.unwrap().unwrap();
        a.push_message(Message::user("hi"));
        store.update_conversation(a).await.unwrap();

        let listed = store.list_conversations().await.unwrap();
        assert_eq!(listed[0].id, a_id);
    }
}
