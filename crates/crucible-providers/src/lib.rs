use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use parking_lot::RwLock;

use crucible_core::AppConfig;
use crucible_types::{CompletionRequest, ModelDescriptor, ProviderInfo};

mod client;
mod openai;

pub use client::{CompletionClient, RetryPolicy};
pub use openai::{LocalEchoProvider, OpenAICompatibleProvider};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("model call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("provider exhausted after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("no provider configured for model `{0}`")]
    NotConfigured(String),

    #[error("provider request failed: {0}")]
    Request(String),
}

/// Model provider collaborator. Implementations only need to turn a chat
/// request into text; retries and timeouts live in [`CompletionClient`].
#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    fn models(&self) -> Vec<ModelDescriptor>;

    async fn generate_completion(&self, request: &CompletionRequest) -> anyhow::Result<String>;
}

struct Routing {
    providers: Vec<Arc<dyn Provider>>,
    catalog: Vec<ModelDescriptor>,
    default_provider: Option<String>,
}

impl Routing {
    fn find(&self, provider_id: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .iter()
            .find(|p| p.info().id == provider_id)
            .cloned()
    }

    /// Configured catalog first, then whatever the providers advertise that
    /// the catalog does not already name.
    fn models(&self) -> Vec<ModelDescriptor> {
        let mut out = self.catalog.clone();
        for provider in &self.providers {
            for model in provider.models() {
                if !out.iter().any(|known| known.id == model.id) {
                    out.push(model);
                }
            }
        }
        out
    }
}

/// Providers, model catalog and default provider, swapped as one unit on
/// reload. The lock is never held across an await, so sync and async readers
/// always see a complete snapshot.
#[derive(Clone)]
pub struct ProviderRegistry {
    routing: Arc<RwLock<Routing>>,
}

impl ProviderRegistry {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_providers(
            build_providers(config),
            config.models.clone(),
            config.default_provider.clone(),
        )
    }

    pub fn with_providers(
        providers: Vec<Arc<dyn Provider>>,
        catalog: Vec<ModelDescriptor>,
        default_provider: Option<String>,
    ) -> Self {
        Self {
            routing: Arc::new(RwLock::new(Routing {
                providers,
                catalog,
                default_provider,
            })),
        }
    }

    pub async fn reload(&self, config: &AppConfig) {
        let rebuilt = Routing {
            providers: build_providers(config),
            catalog: config.models.clone(),
            default_provider: config.default_provider.clone(),
        };
        *self.routing.write() = rebuilt;
    }

    pub async fn list(&self) -> Vec<ProviderInfo> {
        self.routing
            .read()
            .providers
            .iter()
            .map(|p| p.info())
            .collect()
    }

    pub async fn models(&self) -> Vec<ModelDescriptor> {
        self.routing.read().models()
    }

    /// Routes a model id to a provider: catalog entry, then a
    /// `provider/model` prefix, then the default provider. Returns the
    /// provider and the model name it should be asked for.
    pub async fn route(&self, model_id: &str) -> Result<(Arc<dyn Provider>, String), ProviderError> {
        let routing = self.routing.read();
        let catalog_provider = routing
            .catalog
            .iter()
            .find(|m| m.id == model_id)
            .map(|m| m.provider_id.clone());
        if let Some(provider_id) = catalog_provider {
            let provider = routing
                .find(&provider_id)
                .ok_or_else(|| ProviderError::NotConfigured(model_id.to_string()))?;
            let prefix = format!("{provider_id}/");
            let name = model_id.strip_prefix(&prefix).unwrap_or(model_id);
            return Ok((provider, name.to_string()));
        }

        if let Some((provider_id, name)) = model_id.split_once('/') {
            if let Some(provider) = routing.find(provider_id) {
                return Ok((provider, name.to_string()));
            }
        }

        let provider = select_from(&routing, None)
            .map_err(|_| ProviderError::NotConfigured(model_id.to_string()))?;
        Ok((provider, model_id.to_string()))
    }

    pub async fn select_provider(
        &self,
        provider_id: Option<&str>,
    ) -> anyhow::Result<Arc<dyn Provider>> {
        select_from(&self.routing.read(), provider_id)
    }
}

fn select_from(routing: &Routing, provider_id: Option<&str>) -> anyhow::Result<Arc<dyn Provider>> {
    if let Some(id) = provider_id {
        if let Some(provider) = routing.find(id) {
            return Ok(provider);
        }
        let available = routing
            .providers
            .iter()
            .map(|p| p.info().id)
            .collect::<Vec<_>>();
        anyhow::bail!(
            "provider `{}` is not configured. configured providers: {}",
            id,
            available.join(", ")
        );
    }

    if let Some(provider) = routing
        .default_provider
        .as_deref()
        .and_then(|default_id| routing.find(default_id))
    {
        return Ok(provider);
    }

    let Some(provider) = routing.providers.first() else {
        anyhow::bail!("No provider configured.");
    };
    Ok(provider.clone())
}

/// The registry is itself a provider: requests are routed by model id, so a
/// [`CompletionClient`] can sit on top of it unchanged.
#[async_trait]
impl Provider for ProviderRegistry {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "registry".to_string(),
            name: "Provider Registry".to_string(),
        }
    }

    fn models(&self) -> Vec<ModelDescriptor> {
        self.routing.read().models()
    }

    async fn generate_completion(&self, request: &CompletionRequest) -> anyhow::Result<String> {
        let (provider, model) = self.route(&request.model_id).await?;
        tracing::debug!(
            provider = %provider.info().id,
            model = %model,
            "routing completion request"
        );
        if model == request.model_id {
            return provider.generate_completion(request).await;
        }
        let mut routed = request.clone();
        routed.model_id = model;
        provider.generate_completion(&routed).await
    }
}

fn build_providers(config: &AppConfig) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    add_openai_provider(
        config,
        &mut providers,
        "ollama",
        "Ollama",
        "http://127.0.0.1:11434/v1",
        "llama3.1:8b",
        false,
    );
    add_openai_provider(
        config,
        &mut providers,
        "openai",
        "OpenAI",
        "https://api.openai.com/v1",
        "gpt-4o-mini",
        true,
    );
    add_openai_provider(
        config,
        &mut providers,
        "openrouter",
        "OpenRouter",
        "https://openrouter.ai/api/v1",
        "openai/gpt-4o-mini",
        true,
    );
    add_openai_provider(
        config,
        &mut providers,
        "groq",
        "Groq",
        "https://api.groq.com/openai/v1",
        "llama-3.1-8b-instant",
        true,
    );
    add_openai_provider(
        config,
        &mut providers,
        "mistral",
        "Mistral",
        "https://api.mistral.ai/v1",
        "mistral-small-latest",
        true,
    );
    add_openai_provider(
        config,
        &mut providers,
        "together",
        "Together",
        "https://api.together.xyz/v1",
        "meta-llama/Llama-3.1-8B-Instruct-Turbo",
        true,
    );

    if providers.is_empty() {
        providers.push(Arc::new(LocalEchoProvider));
    }

    providers
}

fn add_openai_provider(
    config: &AppConfig,
    providers: &mut Vec<Arc<dyn Provider>>,
    id: &str,
    name: &str,
    default_url: &str,
    default_model: &str,
    use_api_key: bool,
) {
    let Some(entry) = config.providers.get(id) else {
        return;
    };
    let api_key = if use_api_key {
        entry
            .api_key
            .as_deref()
            .filter(|key| !is_placeholder_api_key(key))
            .map(|key| key.to_string())
    } else {
        None
    };
    providers.push(Arc::new(OpenAICompatibleProvider::new(
        id,
        name,
        entry.url.as_deref().unwrap_or(default_url),
        api_key,
        entry.default_model.as_deref().unwrap_or(default_model),
    )));
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}
