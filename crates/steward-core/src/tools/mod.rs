pub mod database;
pub mod gateway;
pub mod github;
pub mod memory;
pub mod script;
pub mod validate;
pub mod vercel;
pub mod web;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use steward_config::ToolsConfig;

use crate::memory::{Embedder, MemoryRetriever};
use crate::model::structured::schema_value;
use crate::model::ToolSpec;
use crate::store::{RetryPolicy, SqliteStore};

pub use gateway::{InvocationState, ToolGateway, ToolInvocation, ToolResult};

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0} is not configured")]
    MissingCredential(&'static str),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("{0}")]
    Execution(String),
}

impl ToolError {
    /// Timeouts, dropped connections, rate limits and upstream 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            ToolError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ToolError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Send a prepared request and decode the JSON body. Non-2xx responses
/// become [`ToolError::Api`] with the response text. Transient failures are
/// retried with [`RetryPolicy::external`].
pub(crate) async fn send_json(req: reqwest::RequestBuilder) -> Result<serde_json::Value, ToolError> {
    send_json_with(&RetryPolicy::external(), req).await
}

async fn send_json_with(
    policy: &RetryPolicy,
    req: reqwest::RequestBuilder,
) -> Result<serde_json::Value, ToolError> {
    policy
        .retry(
            "HTTP request",
            || {
                let attempt = req.try_clone();
                async move {
                    let req = attempt.ok_or_else(|| {
                        ToolError::Execution("request body cannot be replayed".into())
                    })?;
                    send_once(req).await
                }
            },
            ToolError::is_transient,
        )
        .await
}

async fn send_once(req: reqwest::RequestBuilder) -> Result<serde_json::Value, ToolError> {
    let resp = req.send().await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ToolError::Api {
            status: status.as_u16(),
            body: body.chars().take(500).collect(),
        });
    }
    if status == reqwest::StatusCode::NO_CONTENT {
        return Ok(serde_json::Value::Null);
    }
    Ok(resp.json().await?)
}

/// A tool with typed arguments.
///
/// `MUTATING` tools change external state and go through the approval gate.
#[async_trait]
pub trait Tool: Send + Sync + 'static {
    type Args: DeserializeOwned + JsonSchema + Send;
    const NAME: &'static str;
    const MUTATING: bool;

    fn description(&self) -> &str;

    /// Arguments as shown to a human in an approval request.
    fn preview(&self, args: &serde_json::Value) -> serde_json::Value {
        args.clone()
    }

    async fn execute(&self, args: Self::Args) -> Result<serde_json::Value, ToolError>;
}

/// Object-safe view of a [`Tool`] held by the registry.
#[async_trait]
pub trait DynTool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &str;
    fn mutating(&self) -> bool;
    fn parameters_schema(&self) -> serde_json::Value;
    fn preview(&self, args: &serde_json::Value) -> serde_json::Value;
    async fn call(&self, args: serde_json::Value) -> Result<serde_json::Value, ToolError>;
}

struct Typed<T>(T);

#[async_trait]
impl<T: Tool> DynTool for Typed<T> {
    fn name(&self) -> &'static str {
        T::NAME
    }

    fn description(&self) -> &str {
        self.0.description()
    }

    fn mutating(&self) -> bool {
        T::MUTATING
    }

    fn parameters_schema(&self) -> serde_json::Value {
        let mut schema = schema_value::<T::Args>();
        if let Some(obj) = schema.as_object_mut() {
            obj.remove("title");
            if T::MUTATING {
                if let Some(props) = obj
                    .entry("properties")
                    .or_insert_with(|| serde_json::json!({}))
                    .as_object_mut()
                {
                    props.insert(
                        "confirm".into(),
                        serde_json::json!({
                            "type": "boolean",
                            "description": "Set to true only after the user explicitly approved this exact action"
                        }),
                    );
                }
            }
        }
        schema
    }

    fn preview(&self, args: &serde_json::Value) -> serde_json::Value {
        self.0.preview(args)
    }

    async fn call(&self, args: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let args: T::Args = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        self.0.execute(args).await
    }
}

/// Static set of tools, assembled once at start-up.
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Box<dyn DynTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    pub fn register<T: Tool>(&mut self, tool: T) {
        self.tools.insert(T::NAME, Box::new(Typed(tool)));
    }

    pub fn get(&self, name: &str) -> Option<&dyn DynTool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Tools in name order.
    pub fn list(&self) -> Vec<&dyn DynTool> {
        self.tools.values().map(|t| t.as_ref()).collect()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.list()
            .into_iter()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handles the standard tool set is built from.
pub struct ToolContext {
    pub store: Arc<SqliteStore>,
    pub embedder: Arc<dyn Embedder>,
    pub retriever: Arc<MemoryRetriever>,
    pub search: Arc<dyn web::SearchProvider>,
    pub owner_id: String,
    /// Working directory for utility scripts.
    pub workspace: PathBuf,
}

/// Register every built-in tool.
pub fn standard_registry(config: &ToolsConfig, ctx: ToolContext) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(memory::SaveMemoryTool::new(
        ctx.store.clone(),
        ctx.embedder,
        ctx.owner_id.clone(),
    ));
    registry.register(memory::MemorySearchTool::new(ctx.retriever, ctx.owner_id));
    registry.register(web::WebSearchTool::new(ctx.search, config.search.max_results));

    let github = Arc::new(github::GithubClient::new(&config.github));
    registry.register(github::GithubReadFileTool::new(github.clone()));
    registry.register(github::GithubListFilesTool::new(github.clone()));
    registry.register(github::GithubCreateIssueTool::new(github.clone()));
    registry.register(github::GithubCreateBranchTool::new(github.clone()));
    registry.register(github::GithubPushFileTool::new(github.clone()));
    registry.register(github::GithubCreatePullRequestTool::new(github));

    let vercel = Arc::new(vercel::VercelClient::new(&config.vercel));
    registry.register(vercel::VercelRedeployTool::new(vercel.clone()));
    registry.register(vercel::VercelGetLogsTool::new(vercel.clone()));
    registry.register(vercel::VercelAddEnvTool::new(vercel));
    registry.register(database::DatabaseExecuteRawTool::new(ctx.store));
    registry.register(script::RunUtilityScriptTool::new(
        ctx.workspace,
        config.script.timeout_secs,
    ));

    registry
}
