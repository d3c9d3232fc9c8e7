//! Provider registry: provider tag → client, plus the flattened model index.
//!
//! Written once at startup, read concurrently afterwards.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::info;

use crate::error::GatewayError;
use crate::models::{Model, Provider};
use crate::providers::ProviderClient;

#[derive(Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error("model {model} from {provider} is already registered by {existing}")]
    DuplicateModel {
        model: String,
        provider: Provider,
        existing: Provider,
    },
}

#[derive(Default)]
struct Inner {
    clients: HashMap<Provider, Arc<dyn ProviderClient>>,
    models: HashMap<String, Model>,
}

#[derive(Default)]
pub struct ProviderRegistry {
    inner: RwLock<Inner>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `client` and index its catalogue.
    ///
    /// Model ids must be unique across providers; a collision leaves the registry
    /// untouched. Registering a provider again replaces its client and models.
    pub fn register(&self, client: Arc<dyn ProviderClient>) -> Result<(), RegistryError> {
        let provider = client.provider();
        let models = client.list_models();

        let mut inner = self.write();
        for model in &models {
            if let Some(existing) = inner.models.get(&model.id) {
                if existing.provider != provider {
                    return Err(RegistryError::DuplicateModel {
                        model: model.id.clone(),
                        provider,
                        existing: existing.provider,
                    });
                }
            }
        }

        inner.models.retain(|_, m| m.provider != provider);
        for model in models {
            inner.models.insert(model.id.clone(), model);
        }
        inner.clients.insert(provider, client);

        info!(
            provider = %provider,
            models = inner.models.values().filter(|m| m.provider == provider).count(),
            "Registered provider client"
        );
        Ok(())
    }

    pub fn client_for(&self, provider: Provider) -> Result<Arc<dyn ProviderClient>, GatewayError> {
        self.read()
            .clients
            .get(&provider)
            .cloned()
            .ok_or(GatewayError::ProviderNotSupported(provider))
    }

    pub fn model_for(&self, id: &str) -> Option<Model> {
        self.read().models.get(id).cloned()
    }

    /// Snapshot of every registered model; order is unspecified.
    pub fn all_models(&self) -> Vec<Model> {
        self.read().models.values().cloned().collect()
    }

    pub fn providers(&self) -> Vec<Provider> {
        let mut out: Vec<Provider> = self.read().clients.keys().copied().collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_completions::ChatCompletionsClient;
    use crate::error::Result;
    use crate::gemini::GeminiClient;
    use crate::models::{Request, Response};
    use crate::providers::CallContext;
    use async_trait::async_trait;

    struct StaticClient {
        provider: Provider,
        models: Vec<Model>,
    }

    #[async_trait]
    impl ProviderClient for StaticClient {
        async fn query(&self, _: &CallContext, _: &Request, _: &str) -> Result<Response> {
            Err(GatewayError::EmptyResponse(self.provider))
        }
        fn list_models(&self) -> Vec<Model> {
            self.models.clone()
        }
        fn provider(&self) -> Provider {
            self.provider
        }
    }

    fn defaults() -> ProviderRegistry {
        let http = reqwest::Client::new();
        let reg = ProviderRegistry::new();
        reg.register(Arc::new(ChatCompletionsClient::openai(http.clone(), None)))
            .unwrap();
        reg.register(Arc::new(ChatCompletionsClient::groq(http.clone(), None)))
            .unwrap();
        reg.register(Arc::new(GeminiClient::new(http, None))).unwrap();
        reg
    }

    #[test]
    fn models_per_provider_match_client_catalogue() {
        let reg = defaults();
        for provider in reg.providers() {
            let client = reg.client_for(provider).unwrap();
            let mut expected: Vec<String> =
                client.list_models().into_iter().map(|m| m.id).collect();
            let mut actual: Vec<String> = reg
                .all_models()
                .into_iter()
                .filter(|m| m.provider == provider)
                .map(|m| m.id)
                .collect();
            expected.sort();
            actual.sort();
            assert_eq!(actual, expected, "provider {provider}");
        }
        assert_eq!(reg.all_models().len(), 6);
    }

    #[test]
    fn unknown_provider_is_not_supported() {
        let reg = defaults();
        assert!(matches!(
            reg.client_for(Provider::Anthropic),
            Err(GatewayError::ProviderNotSupported(Provider::Anthropic))
        ));
        assert!(reg.model_for("claude-3-opus").is_none());
        assert_eq!(reg.model_for("gpt-4").unwrap().provider, Provider::OpenAI);
    }

    #[test]
    fn duplicate_model_across_providers_is_rejected() {
        let reg = defaults();
        let clash = StaticClient {
            provider: Provider::Mistral,
            models: vec![Model::new("gpt-4", Provider::Mistral, "Fake", "", 10, 1.0)],
        };
        let err = reg.register(Arc::new(clash)).unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateModel {
                model: "gpt-4".into(),
                provider: Provider::Mistral,
                existing: Provider::OpenAI,
            }
        );
        assert!(reg.client_for(Provider::Mistral).is_err());
        assert_eq!(reg.model_for("gpt-4").unwrap().provider, Provider::OpenAI);
    }

    #[test]
    fn reregistering_replaces_the_catalogue() {
        let reg = ProviderRegistry::new();
        reg.register(Arc::new(StaticClient {
            provider: Provider::Mistral,
            models: vec![Model::new("old", Provider::Mistral, "Old", "", 10, 1.0)],
        }))
        .unwrap();
        reg.register(Arc::new(StaticClient {
            provider: Provider::Mistral,
            models: vec![Model::new("new", Provider::Mistral, "New", "", 10, 1.0)],
        }))
        .unwrap();
        assert!(reg.model_for("old").is_none());
        assert!(reg.model_for("new").is_some());
    }
}
