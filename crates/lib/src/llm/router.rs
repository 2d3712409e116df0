//! Routes model ids to the provider adapter that serves them.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{ModelInfo, ProviderAdapter};

/// Registry of provider adapters with a model-id index for O(1) dispatch.
///
/// When two providers claim the same model id the last registration wins and
/// a warning is logged.
#[derive(Default)]
pub struct ProviderRouter {
    providers: RwLock<HashMap<String, Arc<dyn ProviderAdapter>>>,
    model_index: RwLock<HashMap<String, String>>,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_provider(&self, adapter: Arc<dyn ProviderAdapter>) {
        let name = adapter.provider_name().to_string();
        let models = adapter.supported_models().await;
        {
            let mut index = self.model_index.write().await;
            for model in models {
                if let Some(previous) = index.get(&model.id) {
                    if previous != &name {
                        log::warn!(
                            "model id {} claimed by both {} and {}; routing to {}",
                            model.id,
                            previous,
                            name,
                            name
                        );
                    }
                }
                index.insert(model.id, name.clone());
            }
        }
        self.providers.write().await.insert(name, adapter);
    }

    /// Look up the adapter serving a model id.
    pub async fn service_for_model(&self, model_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        let provider = self.model_index.read().await.get(model_id).cloned()?;
        self.providers.read().await.get(&provider).cloned()
    }

    /// Catalog of every model from every registered provider, sorted by
    /// provider then model id so the output is stable.
    pub async fn all_supported_models(&self) -> Vec<ModelInfo> {
        let providers: Vec<Arc<dyn ProviderAdapter>> =
            self.providers.read().await.values().cloned().collect();
        let mut models = Vec::new();
        for provider in providers {
            models.extend(provider.supported_models().await);
        }
        models.sort_by(|a, b| (&a.provider, &a.id).cmp(&(&b.provider, &b.id)));
        models
    }

    /// Re-read settings on every adapter and rebuild the model index.
    /// Adapters that fail to load stay registered but report unavailable
    /// models.
    pub async fn reload_all_settings(&self) {
        let providers: Vec<(String, Arc<dyn ProviderAdapter>)> = self
            .providers
            .read()
            .await
            .iter()
            .map(|(name, adapter)| (name.clone(), adapter.clone()))
            .collect();

        let mut rebuilt: HashMap<String, String> = HashMap::new();
        for (name, adapter) in providers {
            let outcome = adapter.load_settings().await;
            if !outcome.success {
                log::warn!(
                    "provider {} failed to load settings: {}",
                    name,
                    outcome.error.unwrap_or_default()
                );
            }
            for model in adapter.supported_models().await {
                if let Some(previous) = rebuilt.get(&model.id) {
                    if previous != &name {
                        log::warn!(
                            "model id {} claimed by both {} and {}; routing to {}",
                            model.id,
                            previous,
                            name,
                            name
                        );
                    }
                }
                rebuilt.insert(model.id, name.clone());
            }
        }
        *self.model_index.write().await = rebuilt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::llm::{
        LoadOutcome, MessageStream, ModelCapabilities, ProviderError, SendOptions, FALLBACK_TITLE,
    };
    use crate::message::Message;

    struct StubAdapter {
        name: &'static str,
        models: Vec<&'static str>,
    }

    #[async_trait::async_trait]
    impl ProviderAdapter for StubAdapter {
        fn provider_name(&self) -> &str {
            self.name
        }

        async fn supported_models(&self) -> Vec<ModelInfo> {
            self.models
                .iter()
                .map(|id| ModelInfo {
                    id: id.to_string(),
                    name: id.to_string(),
                    provider: self.name.to_string(),
                    available: true,
                    capabilities: ModelCapabilities::default(),
                })
                .collect()
        }

        async fn load_settings(&self) -> LoadOutcome {
            LoadOutcome::ok()
        }

        async fn send_message(
            &self,
            _history: Vec<Message>,
            _options: SendOptions,
            _cancel: CancelToken,
        ) -> Result<MessageStream, ProviderError> {
            Err(ProviderError::NotConfigured("stub".to_string()))
        }

        async fn generate_title(&self, _message: &str, _model: &str) -> String {
            FALLBACK_TITLE.to_string()
        }
    }

    #[tokio::test]
    async fn routes_model_ids_to_their_provider() {
        let router = ProviderRouter::new();
        router
            .register_provider(Arc::new(StubAdapter {
                name: "alpha",
                models: vec!["a-1", "a-2"],
            }))
            .await;
        router
            .register_provider(Arc::new(StubAdapter {
                name: "beta",
                models: vec!["b-1"],
            }))
            .await;

        let adapter = router.service_for_model("b-1").await.unwrap();
        assert_eq!(adapter.provider_name(), "beta");
        assert!(router.service_for_model("missing").await.is_none());
    }

    #[tokio::test]
    async fn last_registration_wins_on_model_id_collision() {
        let router = ProviderRouter::new();
        router
            .register_provider(Arc::new(StubAdapter {
                name: "alpha",
                models: vec!["shared"],
            }))
            .await;
        router
            .register_provider(Arc::new(StubAdapter {
                name: "beta",
                models: vec!["shared"],
            }))
            .await;

        let adapter = router.service_for_model("shared").await.unwrap();
        assert_eq!(adapter.provider_name(), "beta");
    }

    #[tokio::test]
    async fn catalog_is_sorted_and_complete() {
        let router = ProviderRouter::new();
        router
            .register_provider(Arc::new(StubAdapter {
                name: "beta",
                models: vec!["b-2", "b-1"],
            }))
            .await;
        router
            .register_provider(Arc::new(StubAdapter {
                name: "alpha",
                models: vec!["a-1"],
            }))
            .await;

        let ids: Vec<String> = router
            .all_supported_models()
            .await
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["a-1", "b-1", "b-2"]);
    }
}
