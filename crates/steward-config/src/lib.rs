pub mod loader;
pub mod schema;

pub use loader::{expand_home, find_config_path, load_config, save_config, CONFIG_ENV};
pub use schema::{
    AgentDefaults, CollectorConfig, Config, EmbeddingConfig, EmbeddingProvider, GatewayConfig,
    GithubConfig, MemoryConfig, ModelRef, ProviderConfig, ProvidersConfig, RetryConfig,
    ScriptConfig, SearchConfig, StorageConfig, ToolsConfig, VercelConfig,
};
