use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use schemars::JsonSchema;
use serde::Deserialize;

use super::{Tool, ToolError};
use crate::memory::{Embedder, MemoryRetriever};
use crate::store::{MemoryRecord, PersistenceStore};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SaveMemoryArgs {
    /// The fact or preference to remember, as a self-contained sentence.
    pub content: String,
    /// Optional labels such as "preference" or "project".
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Append a fact to long-term memory.
pub struct SaveMemoryTool {
    store: Arc<dyn PersistenceStore>,
    embedder: Arc<dyn Embedder>,
    owner_id: String,
}

impl SaveMemoryTool {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        embedder: Arc<dyn Embedder>,
        owner_id: String,
    ) -> Self {
        Self {
            store,
            embedder,
            owner_id,
        }
    }
}

#[async_trait]
impl Tool for SaveMemoryTool {
    type Args = SaveMemoryArgs;
    const NAME: &'static str = "save_memory";
    const MUTATING: bool = false;

    fn description(&self) -> &str {
        "Save an important fact, preference or decision to long-term memory so it can be recalled in later conversations."
    }

    async fn execute(&self, args: SaveMemoryArgs) -> Result<serde_json::Value, ToolError> {
        let content = args.content.trim();
        if content.is_empty() {
            return Err(ToolError::InvalidArguments("content must not be empty".into()));
        }
        let embedding = self
            .embedder
            .embed(content)
            .await
            .map_err(|e| ToolError::Execution(format!("embedding failed: {e}")))?;
        let record = MemoryRecord {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: self.owner_id.clone(),
            content: content.to_string(),
            embedding,
            tags: args.tags,
            source: "save_memory".into(),
            created_at: Utc::now(),
        };
        self.store
            .insert_memory(&record)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        Ok(serde_json::json!({ "id": record.id, "message": "Memory saved" }))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MemorySearchArgs {
    /// What to look for in memory and past conversations.
    pub query: String,
}

/// Explicit hybrid search over memory, for when the automatic context is not enough.
pub struct MemorySearchTool {
    retriever: Arc<MemoryRetriever>,
    owner_id: String,
}

impl MemorySearchTool {
    pub fn new(retriever: Arc<MemoryRetriever>, owner_id: String) -> Self {
        Self {
            retriever,
            owner_id,
        }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    type Args = MemorySearchArgs;
    const NAME: &'static str = "memory_search";
    const MUTATING: bool = false;

    fn description(&self) -> &str {
        "Search long-term memory and past conversations. Returns matching passages."
    }

    async fn execute(&self, args: MemorySearchArgs) -> Result<serde_json::Value, ToolError> {
        if args.query.trim().is_empty() {
            return Err(ToolError::InvalidArguments("query is required".into()));
        }
        let context = self.retriever.retrieve(&args.query, &self.owner_id).await;
        if context.is_empty() {
            return Ok(serde_json::json!({ "results": "No results found." }));
        }
        Ok(serde_json::json!({ "results": context }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HashingEmbedder;
    use crate::store::SqliteStore;
    use steward_config::MemoryConfig;

    #[tokio::test]
    async fn saved_memory_is_searchable() {
        let store: Arc<dyn PersistenceStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(64));
        let save = SaveMemoryTool::new(store.clone(), embedder.clone(), "owner".into());
        let search = MemorySearchTool::new(
            Arc::new(MemoryRetriever::new(
                store.clone(),
                embedder,
                &MemoryConfig::default(),
            )),
            "owner".into(),
        );

        let saved = save
            .execute(SaveMemoryArgs {
                content: "The newsletter goes out every Tuesday".into(),
                tags: vec!["schedule".into()],
            })
            .await
            .unwrap();
        assert_eq!(saved["message"], "Memory saved");

        let found = search
            .execute(MemorySearchArgs {
                query: "newsletter".into(),
            })
            .await
            .unwrap();
        assert!(found["results"]
            .as_str()
            .unwrap()
            .contains("every Tuesday"));
    }

    #[tokio::test]
    async fn blank_content_is_rejected() {
        let store: Arc<dyn PersistenceStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let save = SaveMemoryTool::new(store, Arc::new(HashingEmbedder::new(8)), "o".into());
        let err = save
            .execute(SaveMemoryArgs {
                content: "   ".into(),
                tags: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
