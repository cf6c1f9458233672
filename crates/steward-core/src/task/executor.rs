use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use steward_config::CollectorConfig;
use tracing::{debug, error, info, warn};

use super::extraction::extract_contacts;
use crate::model::ModelProvider;
use crate::store::{Checkpoint, PersistenceStore, StoreError, TaskRun, TaskStatus};
use crate::tools::web::SearchProvider;

/// Timing and bounds of a collector run.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub default_query: String,
    pub fallback_query: String,
    /// Hard cap on committed iterations.
    pub max_iterations: u64,
    pub interval: Duration,
    pub retry_interval: Duration,
    pub max_duration: Duration,
    pub lease_ttl: Duration,
    pub results_per_search: u32,
}

impl ExecutorSettings {
    pub fn from_config(config: &CollectorConfig, results_per_search: u32) -> Self {
        Self {
            default_query: config.default_query.clone(),
            fallback_query: config.fallback_query.clone(),
            max_iterations: config.max_iterations,
            interval: Duration::from_secs(config.interval_secs),
            retry_interval: Duration::from_secs(config.retry_interval_secs),
            max_duration: Duration::from_secs(config.max_duration_hours * 3600),
            lease_ttl: Duration::from_secs(config.lease_ttl_secs),
            results_per_search,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { iterations: u64 },
    Stopped { iterations: u64 },
    /// The caller's shutdown signal fired. The run stays `in_progress` and
    /// its lease is released, so it can be resumed right away.
    Interrupted { iterations: u64 },
}

/// Runs the search / extract / upsert loop for one task run, committing a
/// checkpoint after every iteration and resuming from the latest one.
pub struct DurableTaskExecutor {
    store: Arc<dyn PersistenceStore>,
    search: Arc<dyn SearchProvider>,
    provider: Arc<dyn ModelProvider>,
    settings: ExecutorSettings,
    holder: String,
}

impl DurableTaskExecutor {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        search: Arc<dyn SearchProvider>,
        provider: Arc<dyn ModelProvider>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            search,
            provider,
            settings,
            holder: format!("executor-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Run until the iteration cap, the wall-clock bound, or an external stop.
    ///
    /// Fails when the lease is held elsewhere, the run does not exist, or a
    /// checkpoint cannot be committed.
    pub async fn run(
        &self,
        task_run_id: &str,
        override_query: Option<&str>,
    ) -> Result<RunOutcome, StoreError> {
        self.run_until(task_run_id, override_query, std::future::pending())
            .await
    }

    /// Like [`run`](Self::run), but stops at the next await point once
    /// `shutdown` resolves. The lease is released on every exit path.
    pub async fn run_until<S>(
        &self,
        task_run_id: &str,
        override_query: Option<&str>,
        shutdown: S,
    ) -> Result<RunOutcome, StoreError>
    where
        S: Future<Output = ()> + Send,
    {
        self.store
            .acquire_lease(task_run_id, &self.holder, self.settings.lease_ttl)
            .await?;
        info!("Task run '{task_run_id}' started by {}", self.holder);

        let result = tokio::select! {
            result = self.drive(task_run_id, override_query) => result,
            _ = shutdown => {
                let iterations = self
                    .store
                    .latest_checkpoint(task_run_id)
                    .await
                    .ok()
                    .flatten()
                    .map_or(0, |c| c.iteration);
                Ok(RunOutcome::Interrupted { iterations })
            }
        };

        if let Err(e) = self.store.release_lease(task_run_id, &self.holder).await {
            warn!("Failed to release lease on '{task_run_id}': {e}");
        }
        match &result {
            Ok(outcome) => info!("Task run '{task_run_id}' finished: {outcome:?}"),
            Err(e) => error!("Task run '{task_run_id}' aborted: {e}"),
        }
        result
    }

    async fn load_run(&self, task_run_id: &str) -> Result<TaskRun, StoreError> {
        self.store
            .task_run(task_run_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("task run '{task_run_id}'")))
    }

    /// `None` while the run should continue, otherwise the outcome to return.
    async fn check_status(
        &self,
        task_run_id: &str,
        iterations: u64,
    ) -> Result<Option<RunOutcome>, StoreError> {
        let run = self.load_run(task_run_id).await?;
        match run.status {
            TaskStatus::InProgress => {}
            TaskStatus::Stopped => return Ok(Some(RunOutcome::Stopped { iterations })),
            TaskStatus::Completed => return Ok(Some(RunOutcome::Completed { iterations })),
        }

        let elapsed = (Utc::now() - run.started_at).to_std().unwrap_or_default();
        if elapsed > self.settings.max_duration {
            info!(
                "Task run '{task_run_id}' exceeded {}h, completing",
                self.settings.max_duration.as_secs() / 3600
            );
            self.store
                .set_task_status(task_run_id, TaskStatus::Completed)
                .await?;
            return Ok(Some(RunOutcome::Completed { iterations }));
        }
        Ok(None)
    }

    async fn drive(
        &self,
        task_run_id: &str,
        override_query: Option<&str>,
    ) -> Result<RunOutcome, StoreError> {
        let latest = self.store.latest_checkpoint(task_run_id).await?;
        let mut iteration = latest.as_ref().map_or(0, |c| c.iteration);
        let mut query = match (override_query, latest) {
            (Some(q), _) => q.to_string(),
            (None, Some(checkpoint)) => checkpoint.state,
            (None, None) => self.settings.default_query.clone(),
        };
        info!("Task run '{task_run_id}' resuming at iteration {iteration} with query: {query}");

        loop {
            // An operator stop wins over the cap; the run is never flipped
            // from stopped to completed.
            if let Some(outcome) = self.check_status(task_run_id, iteration).await? {
                return Ok(outcome);
            }
            if iteration >= self.settings.max_iterations {
                self.store
                    .set_task_status(task_run_id, TaskStatus::Completed)
                    .await?;
                return Ok(RunOutcome::Completed {
                    iterations: iteration,
                });
            }
            self.store
                .acquire_lease(task_run_id, &self.holder, self.settings.lease_ttl)
                .await?;

            let hits = match self
                .search
                .search(&query, self.settings.results_per_search)
                .await
            {
                Ok(hits) => hits,
                Err(e) => {
                    warn!("Search failed for '{query}': {e}; retrying");
                    tokio::time::sleep(self.settings.retry_interval).await;
                    continue;
                }
            };

            let next_query = if hits.is_empty() {
                warn!("No results for '{query}', falling back to generic query");
                self.settings.fallback_query.clone()
            } else {
                let extraction =
                    match extract_contacts(self.provider.as_ref(), &hits, &query).await {
                        Ok(e) => e,
                        Err(e) => {
                            warn!("Extraction discarded for '{query}': {e}");
                            tokio::time::sleep(self.settings.retry_interval).await;
                            continue;
                        }
                    };

                let total = extraction.journalists.len();
                let mut saved = 0;
                for contact in &extraction.journalists {
                    match self.store.upsert_contact(contact).await {
                        Ok(()) => saved += 1,
                        Err(e) => warn!("Failed to upsert {}: {e}", contact.email),
                    }
                }
                debug!("Upserted {saved}/{total} contacts");
                extraction.next_query
            };

            // A stop that arrived mid-iteration must not be followed by a commit
            if let Some(outcome) = self.check_status(task_run_id, iteration).await? {
                return Ok(outcome);
            }

            let checkpoint = Checkpoint {
                task_run_id: task_run_id.to_string(),
                iteration: iteration + 1,
                state: next_query,
                timestamp: Utc::now(),
            };
            if let Err(e) = self.store.save_checkpoint(&checkpoint).await {
                error!(
                    "Checkpoint {} for '{task_run_id}' failed to commit: {e}",
                    checkpoint.iteration
                );
                return Err(e);
            }
            iteration = checkpoint.iteration;
            query = checkpoint.state;
            info!("Task run '{task_run_id}' iteration {iteration} committed, next query: {query}");

            tokio::time::sleep(self.settings.interval).await;
        }
    }
}
