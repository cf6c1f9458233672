use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub agents: AgentsConfig,
    pub providers: ProvidersConfig,
    pub memory: MemoryConfig,
    pub tools: ToolsConfig,
    pub collector: CollectorConfig,
    pub storage: StorageConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsConfig {
    pub defaults: AgentDefaults,
    /// Named model tiers: "capable" (required) and "light".
    pub models: HashMap<String, ModelRef>,
}

/// Reference to a provider + model combination for a named tier.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDefaults {
    pub workspace: String,
    /// Owner id used until requests carry an authenticated identity.
    pub owner_id: String,
    /// Path to a persona markdown file. Relative paths resolve against the workspace.
    pub persona: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Step budget: maximum model calls per interactive turn.
    pub max_tool_iterations: u32,
    pub memory_window: usize,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            workspace: "~/.steward/workspace".into(),
            owner_id: "default".into(),
            persona: None,
            max_tokens: 8192,
            temperature: 0.7,
            max_tool_iterations: 5,
            memory_window: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvidersConfig {
    pub ollama: Option<ProviderConfig>,
    pub anthropic: Option<ProviderConfig>,
    pub openai: Option<ProviderConfig>,
    pub openrouter: Option<ProviderConfig>,
    pub deepseek: Option<ProviderConfig>,
    pub gemini: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryConfig {
    /// Minimum cosine similarity for a vector match.
    pub similarity_threshold: f32,
    pub vector_limit: usize,
    pub keyword_limit: usize,
    pub embedding: EmbeddingConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.7,
            vector_limit: 5,
            keyword_limit: 5,
            embedding: EmbeddingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub model: String,
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Hashing,
            model: "text-embedding-3-small".into(),
            dimensions: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    Openai,
    #[default]
    Hashing,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsConfig {
    pub search: SearchConfig,
    pub github: GithubConfig,
    pub vercel: VercelConfig,
    pub script: ScriptConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchConfig {
    pub api_key: String,
    pub max_results: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            max_results: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GithubConfig {
    pub token: String,
    /// Default repository owner when a call omits one.
    pub owner: String,
    pub repo: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct VercelConfig {
    pub token: String,
    pub project_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScriptConfig {
    pub timeout_secs: u64,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

/// Settings for the background contact collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CollectorConfig {
    pub default_query: String,
    /// Query used after an iteration whose search came back empty.
    pub fallback_query: String,
    /// Hard cap on committed iterations for one run.
    pub max_iterations: u64,
    pub interval_secs: u64,
    pub retry_interval_secs: u64,
    pub max_duration_hours: u64,
    pub lease_ttl_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            default_query: "dziennikarze email Polska".into(),
            fallback_query: "redakcja kontakt email".into(),
            max_iterations: 600,
            interval_secs: 60,
            retry_interval_secs: 10,
            max_duration_hours: 10,
            lease_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    pub path: String,
    pub retry: RetryConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "~/.steward/steward.sqlite".into(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 18790,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: Config = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(cfg.agents.defaults.max_tool_iterations, 5);
        assert_eq!(cfg.memory.similarity_threshold, 0.7);
        assert_eq!(cfg.memory.embedding.provider, EmbeddingProvider::Hashing);
        assert_eq!(cfg.storage.retry.max_retries, 3);
        assert_eq!(cfg.collector.interval_secs, 60);
        assert!(cfg.agents.models.is_empty());
    }

    #[test]
    fn model_tiers_parsed() {
        let cfg: Config = serde_json::from_value(serde_json::json!({
            "agents": {
                "models": {
                    "light": { "provider": "gemini", "model": "gemini-2.5-flash-lite" },
                    "capable": { "provider": "anthropic", "model": "claude-sonnet-4-5" }
                }
            }
        }))
        .unwrap();
        assert_eq!(cfg.agents.models["light"].provider, "gemini");
        assert_eq!(cfg.agents.models["capable"].model, "claude-sonnet-4-5");
    }

    #[test]
    fn camel_case_fields_parsed() {
        let cfg: Config = serde_json::from_value(serde_json::json!({
            "agents": { "defaults": { "maxToolIterations": 3, "ownerId": "u-1" } },
            "memory": { "similarityThreshold": 0.8, "embedding": { "provider": "openai" } },
            "collector": { "maxIterations": 10, "retryIntervalSecs": 2 },
            "tools": { "vercel": { "projectId": "prj_1" } }
        }))
        .unwrap();
        assert_eq!(cfg.agents.defaults.max_tool_iterations, 3);
        assert_eq!(cfg.agents.defaults.owner_id, "u-1");
        assert_eq!(cfg.memory.similarity_threshold, 0.8);
        assert_eq!(cfg.memory.embedding.provider, EmbeddingProvider::Openai);
        assert_eq!(cfg.memory.embedding.dimensions, 256);
        assert_eq!(cfg.collector.max_iterations, 10);
        assert_eq!(cfg.collector.retry_interval_secs, 2);
        assert_eq!(cfg.tools.vercel.project_id, "prj_1");
    }
}
