pub mod embedding;
pub mod retriever;

use std::sync::Arc;

use steward_config::{EmbeddingProvider, MemoryConfig, ProviderConfig};
use tracing::{info, warn};

pub use embedding::{Embedder, HashingEmbedder, OpenAiEmbedder};
pub use retriever::MemoryRetriever;

/// Build the configured embedder. Falls back to local hashing when the
/// OpenAI embedder has no API key.
pub fn create_embedder(config: &MemoryConfig, openai: Option<&ProviderConfig>) -> Arc<dyn Embedder> {
    let embedding = &config.embedding;
    match embedding.provider {
        EmbeddingProvider::Openai => {
            let key = openai
                .and_then(|c| c.api_key.clone())
                .filter(|k| !k.is_empty())
                .or_else(|| std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()));
            match key {
                Some(key) => {
                    info!("Using OpenAI embeddings ({})", embedding.model);
                    Arc::new(OpenAiEmbedder::new(
                        key,
                        openai.and_then(|c| c.api_base.clone()),
                        embedding.model.clone(),
                        embedding.dimensions,
                    ))
                }
                None => {
                    warn!("OpenAI embeddings configured but no API key found; using hashing embedder");
                    Arc::new(HashingEmbedder::new(embedding.dimensions))
                }
            }
        }
        EmbeddingProvider::Hashing => Arc::new(HashingEmbedder::new(embedding.dimensions)),
    }
}
