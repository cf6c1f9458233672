use std::sync::Arc;

use anyhow::Result;
use steward_config::MemoryConfig;
use tracing::{debug, warn};

use super::Embedder;
use crate::store::PersistenceStore;
use crate::util;

pub const VECTOR_SECTION: &str = "### Related memories";
pub const KEYWORD_MEMORY_SECTION: &str = "### Memory keyword matches";
pub const KEYWORD_MESSAGE_SECTION: &str = "### Past conversation matches";

/// Longest single hit carried into the context block.
const MAX_HIT_CHARS: usize = 500;

/// Hybrid (vector + keyword) lookup over long-term memory and history.
///
/// Sections are emitted in a fixed order and never merged or re-ranked
/// against each other.
pub struct MemoryRetriever {
    store: Arc<dyn PersistenceStore>,
    embedder: Arc<dyn Embedder>,
    threshold: f32,
    vector_limit: usize,
    keyword_limit: usize,
}

impl MemoryRetriever {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        embedder: Arc<dyn Embedder>,
        config: &MemoryConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            threshold: config.similarity_threshold,
            vector_limit: config.vector_limit,
            keyword_limit: config.keyword_limit,
        }
    }

    /// Build the memory context block for `query`. Empty on empty input or
    /// on any retrieval failure.
    pub async fn retrieve(&self, query: &str, owner_id: &str) -> String {
        if query.trim().is_empty() {
            return String::new();
        }
        match self.try_retrieve(query, owner_id).await {
            Ok(context) => context,
            Err(e) => {
                warn!("Memory retrieval failed for owner '{owner_id}': {e}");
                String::new()
            }
        }
    }

    async fn try_retrieve(&self, query: &str, owner_id: &str) -> Result<String> {
        let embedding = self.embedder.embed(query).await?;
        let vector = self
            .store
            .similar_memories(owner_id, &embedding, self.threshold, self.vector_limit)
            .await?;
        let keyword_memories = self
            .store
            .search_memories(owner_id, query, self.keyword_limit)
            .await?;
        let keyword_messages = self
            .store
            .search_messages(owner_id, query, self.keyword_limit)
            .await?;

        debug!(
            "Memory retrieval: {} vector, {} keyword-memory, {} keyword-message hits",
            vector.len(),
            keyword_memories.len(),
            keyword_messages.len()
        );

        let mut sections = Vec::new();
        if !vector.is_empty() {
            let lines: Vec<String> = vector
                .iter()
                .map(|m| {
                    format!(
                        "- {} (similarity {:.2})",
                        util::preview(&m.content, MAX_HIT_CHARS),
                        m.similarity
                    )
                })
                .collect();
            sections.push(format!("{VECTOR_SECTION}\n{}", lines.join("\n")));
        }
        if !keyword_memories.is_empty() {
            let lines: Vec<String> = keyword_memories
                .iter()
                .map(|h| format!("- {}", util::preview(&h.content, MAX_HIT_CHARS)))
                .collect();
            sections.push(format!("{KEYWORD_MEMORY_SECTION}\n{}", lines.join("\n")));
        }
        if !keyword_messages.is_empty() {
            let lines: Vec<String> = keyword_messages
                .iter()
                .map(|h| format!("- {}", util::preview(&h.content, MAX_HIT_CHARS)))
                .collect();
            sections.push(format!("{KEYWORD_MESSAGE_SECTION}\n{}", lines.join("\n")));
        }

        if sections.is_empty() {
            return Ok(String::new());
        }
        Ok(format!(
            "## Long-term memory context\n\n{}",
            sections.join("\n\n")
        ))
    }
}
