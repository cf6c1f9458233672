use std::sync::Arc;

use anyhow::{Context, Result};
use steward_config::Config;
use steward_core::agent::ContextBuilder;
use steward_core::memory::{create_embedder, MemoryRetriever};
use steward_core::model::ModelProvider;
use steward_core::store::{PersistenceStore, RetryPolicy, SqliteStore};
use steward_core::task::{DurableTaskExecutor, ExecutorSettings, TaskSupervisor};
use steward_core::tools::web::{SearchProvider, TavilySearch};
use steward_core::tools::{standard_registry, ToolContext, ToolGateway};
use steward_core::AgentLoop;
use tracing::{info, warn};

/// Shared handles behind every request. Also used by the CLI.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteStore>,
    pub gateway: Arc<ToolGateway>,
    /// Absent when no model tier is configured.
    pub agent: Option<Arc<AgentLoop>>,
    /// Background collector runs. Absent without a model.
    pub tasks: Option<Arc<TaskSupervisor>>,
    pub owner_id: String,
}

impl AppState {
    pub fn new(store: Arc<SqliteStore>, gateway: Arc<ToolGateway>, owner_id: &str) -> Self {
        Self {
            store,
            gateway,
            agent: None,
            tasks: None,
            owner_id: owner_id.to_string(),
        }
    }

    pub fn with_agent(mut self, agent: Arc<AgentLoop>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_tasks(mut self, tasks: Arc<TaskSupervisor>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Wire store, memory, tools, agent and collector from `config`.
    /// Without a `provider` only the store-backed surface is available.
    pub fn build(config: &Config, provider: Option<Arc<dyn ModelProvider>>) -> Result<Self> {
        let defaults = &config.agents.defaults;
        let workspace = config.workspace_dir();
        std::fs::create_dir_all(&workspace)
            .with_context(|| format!("failed to create workspace {}", workspace.display()))?;

        let db_path = config.database_path();
        let store = Arc::new(
            SqliteStore::open(&db_path, RetryPolicy::from_config(&config.storage.retry))
                .with_context(|| format!("failed to open store at {}", db_path.display()))?,
        );
        let dyn_store: Arc<dyn PersistenceStore> = store.clone();

        let embedder = create_embedder(&config.memory, config.providers.openai.as_ref());
        let retriever = Arc::new(MemoryRetriever::new(
            dyn_store.clone(),
            embedder.clone(),
            &config.memory,
        ));

        let search_key = config.tools.search.api_key.clone();
        if search_key.is_empty() {
            warn!("No search API key configured; web_search and the collector will fail");
        }
        let search: Arc<dyn SearchProvider> = Arc::new(TavilySearch::new(search_key));

        let registry = standard_registry(
            &config.tools,
            ToolContext {
                store: store.clone(),
                embedder,
                retriever: retriever.clone(),
                search: search.clone(),
                owner_id: defaults.owner_id.clone(),
                workspace: workspace.clone(),
            },
        );
        info!("Registered {} tools", registry.len());
        let gateway = Arc::new(ToolGateway::new(registry));

        let mut state = Self::new(store, gateway.clone(), &defaults.owner_id);

        let Some(provider) = provider else {
            warn!("No model configured; chat and the collector are disabled");
            return Ok(state);
        };

        let context = ContextBuilder::new(&workspace, defaults.persona.as_deref());
        let agent = AgentLoop::new(
            provider.clone(),
            retriever,
            gateway,
            dyn_store.clone(),
            context,
        )
        .with_limits(
            defaults.max_tool_iterations as usize,
            defaults.memory_window,
        );
        state = state.with_agent(Arc::new(agent));

        let collector = DurableTaskExecutor::new(
            dyn_store,
            search,
            provider,
            ExecutorSettings::from_config(&config.collector, config.tools.search.max_results),
        );
        Ok(state.with_tasks(Arc::new(TaskSupervisor::new(Arc::new(collector)))))
    }
}
