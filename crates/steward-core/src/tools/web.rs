use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{send_json, Tool, ToolError};

const TAVILY_ENDPOINT: &str = "https://api.tavily.com/search";

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub content: String,
}

/// External web search capability, shared by the `web_search` tool and the
/// background collector.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<SearchHit>, ToolError>;
}

/// Tavily search API client.
pub struct TavilySearch {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl TavilySearch {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            endpoint: TAVILY_ENDPOINT.to_string(),
        }
    }
}

#[async_trait]
impl SearchProvider for TavilySearch {
    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<SearchHit>, ToolError> {
        if self.api_key.is_empty() {
            return Err(ToolError::MissingCredential("TAVILY_API_KEY"));
        }
        let body = send_json(
            self.client
                .post(&self.endpoint)
                .json(&serde_json::json!({
                    "api_key": self.api_key,
                    "query": query,
                    "max_results": max_results,
                }))
                .timeout(Duration::from_secs(20)),
        )
        .await?;

        let results = body
            .get("results")
            .cloned()
            .unwrap_or_else(|| serde_json::json!([]));
        serde_json::from_value(results)
            .map_err(|e| ToolError::Execution(format!("malformed search response: {e}")))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WebSearchArgs {
    /// Search query.
    pub query: String,
    /// Number of results (1-10).
    pub max_results: Option<u32>,
}

pub struct WebSearchTool {
    provider: Arc<dyn SearchProvider>,
    max_results: u32,
}

impl WebSearchTool {
    pub fn new(provider: Arc<dyn SearchProvider>, max_results: u32) -> Self {
        Self {
            provider,
            max_results,
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    type Args = WebSearchArgs;
    const NAME: &'static str = "web_search";
    const MUTATING: bool = false;

    fn description(&self) -> &str {
        "Search the web. Returns titles, URLs, and content snippets."
    }

    async fn execute(&self, args: WebSearchArgs) -> Result<serde_json::Value, ToolError> {
        if args.query.trim().is_empty() {
            return Err(ToolError::InvalidArguments("query is required".into()));
        }
        let count = args.max_results.unwrap_or(self.max_results).clamp(1, 10);
        let hits = self.provider.search(&args.query, count).await?;
        Ok(serde_json::json!({ "query": args.query, "results": hits }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records the requested result count.
    struct Recording {
        counts: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl SearchProvider for Recording {
        async fn search(&self, query: &str, max_results: u32) -> Result<Vec<SearchHit>, ToolError> {
            self.counts.lock().unwrap().push(max_results);
            Ok(vec![SearchHit {
                title: format!("About {query}"),
                url: "https://example.org".into(),
                content: String::new(),
            }])
        }
    }

    #[tokio::test]
    async fn result_count_is_clamped() {
        let provider = Arc::new(Recording {
            counts: Mutex::new(Vec::new()),
        });
        let tool = WebSearchTool::new(provider.clone(), 5);
        tool.execute(WebSearchArgs {
            query: "rust".into(),
            max_results: None,
        })
        .await
        .unwrap();
        let out = tool
            .execute(WebSearchArgs {
                query: "rust".into(),
                max_results: Some(50),
            })
            .await
            .unwrap();
        assert_eq!(out["results"][0]["title"], "About rust");
        assert_eq!(*provider.counts.lock().unwrap(), vec![5, 10]);
    }

    #[tokio::test]
    async fn tavily_without_key_is_configuration_error() {
        let err = TavilySearch::new(String::new())
            .search("anything", 5)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::MissingCredential("TAVILY_API_KEY")));
    }

    #[test]
    fn search_hit_tolerates_missing_content() {
        let hit: SearchHit =
            serde_json::from_value(serde_json::json!({"title": "t", "url": "u"})).unwrap();
        assert_eq!(hit.content, "");
    }
}
