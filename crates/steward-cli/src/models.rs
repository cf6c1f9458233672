use std::sync::Arc;

use anyhow::Result;
#[allow(deprecated)]
use rig::client::completion::CompletionModelHandle;
use rig::client::{CompletionClient, Nothing};
use rig::providers::{anthropic, deepseek, gemini, ollama, openai, openrouter};
use steward_config::{Config, ProviderConfig};
use steward_core::model::{ModelPool, RigProvider};
use steward_core::ModelProvider;

const VALID_PROVIDERS: &str = "anthropic, openai, ollama, openrouter, deepseek, gemini";

/// Resolve an API key from config, falling back to an environment variable.
fn resolve_api_key(provider_cfg: &Option<ProviderConfig>, env_var: &str) -> Option<String> {
    provider_cfg
        .as_ref()
        .and_then(|c| c.api_key.clone())
        .filter(|k| !k.is_empty())
        .or_else(|| std::env::var(env_var).ok().filter(|k| !k.is_empty()))
}

fn api_base(provider_cfg: &Option<ProviderConfig>) -> Option<String> {
    provider_cfg
        .as_ref()
        .and_then(|c| c.api_base.clone())
        .filter(|b| !b.is_empty())
}

fn missing_key(label: &str, field: &str, env_var: &str) -> anyhow::Error {
    anyhow::anyhow!(
        "{label} provider selected but no API key found. \
         Set providers.{field}.apiKey in config.json or {env_var} env var."
    )
}

/// Create a completion model for a provider + model combination.
#[allow(deprecated)]
fn create_model_for(
    provider: &str,
    model_name: &str,
    config: &Config,
) -> Result<CompletionModelHandle<'static>> {
    if provider.is_empty() {
        anyhow::bail!("No provider configured.\nValid providers: {VALID_PROVIDERS}");
    }
    if model_name.is_empty() {
        anyhow::bail!("No model configured for provider '{provider}'.");
    }

    let providers = &config.providers;
    match provider {
        "anthropic" => {
            let key = resolve_api_key(&providers.anthropic, "ANTHROPIC_API_KEY")
                .ok_or_else(|| missing_key("Anthropic", "anthropic", "ANTHROPIC_API_KEY"))?;
            let client: anthropic::Client = anthropic::Client::builder()
                .api_key(&key)
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create Anthropic client: {e}"))?;
            let model = client.completion_model(model_name).with_prompt_caching();
            tracing::info!("Using Anthropic provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "openai" => {
            let key = resolve_api_key(&providers.openai, "OPENAI_API_KEY")
                .ok_or_else(|| missing_key("OpenAI", "openai", "OPENAI_API_KEY"))?;
            let mut builder = openai::CompletionsClient::builder().api_key(&key);
            if let Some(ref base) = api_base(&providers.openai) {
                builder = builder.base_url(base);
                tracing::info!("Using OpenAI provider with custom base: {base}");
            }
            let client: openai::CompletionsClient = builder
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create OpenAI client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using OpenAI provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "ollama" => {
            let mut builder = ollama::Client::builder().api_key(Nothing);
            if let Some(ref base) = api_base(&providers.ollama) {
                builder = builder.base_url(base);
            }
            let client: ollama::Client = builder
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create Ollama client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using Ollama provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "openrouter" => {
            let key = resolve_api_key(&providers.openrouter, "OPENROUTER_API_KEY")
                .ok_or_else(|| missing_key("OpenRouter", "openrouter", "OPENROUTER_API_KEY"))?;
            let client: openrouter::Client = openrouter::Client::new(&key)
                .map_err(|e| anyhow::anyhow!("Failed to create OpenRouter client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using OpenRouter provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "deepseek" => {
            let key = resolve_api_key(&providers.deepseek, "DEEPSEEK_API_KEY")
                .ok_or_else(|| missing_key("DeepSeek", "deepseek", "DEEPSEEK_API_KEY"))?;
            let client: deepseek::Client = deepseek::Client::new(&key)
                .map_err(|e| anyhow::anyhow!("Failed to create DeepSeek client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using DeepSeek provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "gemini" => {
            let key = resolve_api_key(&providers.gemini, "GEMINI_API_KEY")
                .ok_or_else(|| missing_key("Gemini", "gemini", "GEMINI_API_KEY"))?;
            let client: gemini::Client = gemini::Client::new(key)
                .map_err(|e| anyhow::anyhow!("Failed to create Gemini client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using Gemini provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        other => {
            anyhow::bail!("Unknown provider '{other}'. Valid providers: {VALID_PROVIDERS}");
        }
    }
}

/// Resolve the `capable` and `light` tiers to concrete model handles.
///
/// `capable` is required. Without `light`, light requests use the capable model.
#[allow(deprecated)]
pub fn create_model_pool(config: &Config) -> Result<ModelPool> {
    let models = &config.agents.models;
    let Some(capable) = models.get("capable") else {
        anyhow::bail!(
            "No capable model configured. Set agents.models.capable in config.json.\n\
             Example:\n  \
             \"models\": {{ \"capable\": {{ \"provider\": \"anthropic\", \"model\": \"claude-sonnet-4-5\" }} }}"
        );
    };

    for name in models.keys() {
        if name != "capable" && name != "light" {
            tracing::warn!("Ignoring unknown model tier '{name}' (expected 'capable' or 'light')");
        }
    }

    let handle = create_model_for(&capable.provider, &capable.model, config)
        .map_err(|e| anyhow::anyhow!("Failed to create model for tier 'capable': {e}"))?;
    tracing::info!("Model tier 'capable': {} / {}", capable.provider, capable.model);

    let light = match models.get("light") {
        Some(light) => {
            let handle = create_model_for(&light.provider, &light.model, config)
                .map_err(|e| anyhow::anyhow!("Failed to create model for tier 'light': {e}"))?;
            tracing::info!("Model tier 'light': {} / {}", light.provider, light.model);
            Some((handle, light.model.clone()))
        }
        None => {
            tracing::info!("No light tier configured; light requests use the capable model");
            None
        }
    };

    Ok(ModelPool::new((handle, capable.model.clone()), light))
}

pub fn create_provider(config: &Config) -> Result<Arc<dyn ModelProvider>> {
    let pool = create_model_pool(config)?;
    let defaults = &config.agents.defaults;
    Ok(Arc::new(RigProvider::new(
        pool,
        defaults.temperature as f64,
        defaults.max_tokens as u64,
    )))
}
