use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::executor::DurableTaskExecutor;
use crate::store::{PersistenceStore, StoreError, TaskStatus};

/// Owns the background collector tasks of one process.
///
/// Runs are spawned onto the runtime and share a shutdown signal, so a
/// process that is going away hands its leases back before exiting.
pub struct TaskSupervisor {
    executor: Arc<DurableTaskExecutor>,
    shutdown: watch::Sender<bool>,
    running: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskSupervisor {
    pub fn new(executor: Arc<DurableTaskExecutor>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            executor,
            shutdown,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn executor(&self) -> &Arc<DurableTaskExecutor> {
        &self.executor
    }

    fn lock_running(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether this process is currently driving the run.
    pub fn is_running(&self, task_run_id: &str) -> bool {
        self.lock_running()
            .get(task_run_id)
            .is_some_and(|h| !h.is_finished())
    }

    /// Drive a run in the background. Returns `false` when this process is
    /// already driving it.
    pub fn spawn(&self, task_run_id: &str, override_query: Option<String>) -> bool {
        let mut running = self.lock_running();
        running.retain(|_, h| !h.is_finished());
        if running.contains_key(task_run_id) {
            return false;
        }

        let executor = self.executor.clone();
        let mut shutdown = self.shutdown.subscribe();
        let id = task_run_id.to_string();
        let handle = tokio::spawn(async move {
            let signal = async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            };
            if let Err(e) = executor
                .run_until(&id, override_query.as_deref(), signal)
                .await
            {
                warn!("Background task run '{id}' ended with error: {e}");
            }
        });
        running.insert(task_run_id.to_string(), handle);
        true
    }

    /// Pick up every `in_progress` run left behind by a previous process.
    ///
    /// Runs whose lease is still held by a live executor fail their first
    /// lease acquisition and are left alone.
    pub async fn recover(&self, store: &dyn PersistenceStore) -> Result<Vec<String>, StoreError> {
        let runs = store.task_runs_with_status(TaskStatus::InProgress).await?;
        let mut spawned = Vec::new();
        for run in runs {
            if self.spawn(&run.id, None) {
                info!("Recovering task run '{}'", run.id);
                spawned.push(run.id);
            }
        }
        Ok(spawned)
    }

    /// Signal every run to stop at its next await point and wait for all of
    /// them to release their leases.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<_> = self.lock_running().drain().map(|(_, h)| h).collect();
        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Task run join error: {e}");
            }
        }
        if count > 0 {
            info!("Stopped {count} background task run(s)");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::model::{ChatMessage, EventStream, ModelProvider, ModelTier, ProviderError, ToolSpec};
    use crate::store::{SqliteStore, TaskRun};
    use crate::task::executor::ExecutorSettings;
    use crate::task::{resume_run, stop_run};
    use crate::tools::web::{SearchHit, SearchProvider};
    use crate::tools::ToolError;

    struct OneHit;

    #[async_trait]
    impl SearchProvider for OneHit {
        async fn search(&self, _query: &str, _max: u32) -> Result<Vec<SearchHit>, ToolError> {
            Ok(vec![SearchHit {
                title: "Desk".into(),
                url: "https://example.pl".into(),
                content: "anna@gazeta.pl".into(),
            }])
        }
    }

    struct Extractor;

    #[async_trait]
    impl ModelProvider for Extractor {
        async fn classify(
            &self,
            _prompt: &str,
            _schema: &serde_json::Value,
        ) -> Result<serde_json::Value, ProviderError> {
            Err(ProviderError::Transport("unused".into()))
        }

        async fn converse(
            &self,
            _tier: ModelTier,
            _system_prompt: &str,
            _messages: &[ChatMessage],
            _tools: &[ToolSpec],
        ) -> Result<EventStream, ProviderError> {
            Err(ProviderError::Transport("unused".into()))
        }

        async fn extract(
            &self,
            _prompt: &str,
            _schema: &serde_json::Value,
        ) -> Result<serde_json::Value, ProviderError> {
            Ok(serde_json::json!({
                "journalists": [{"name": "Anna Nowak", "email": "anna@gazeta.pl"}],
                "nextQuery": "next"
            }))
        }
    }

    fn supervisor(store: Arc<SqliteStore>, max_iterations: u64, interval: Duration) -> TaskSupervisor {
        let settings = ExecutorSettings {
            default_query: "default query".into(),
            fallback_query: "fallback query".into(),
            max_iterations,
            interval,
            retry_interval: Duration::from_millis(1),
            max_duration: Duration::from_secs(3600),
            lease_ttl: Duration::from_secs(60),
            results_per_search: 5,
        };
        let executor = DurableTaskExecutor::new(store, Arc::new(OneHit), Arc::new(Extractor), settings);
        TaskSupervisor::new(Arc::new(executor))
    }

    async fn add_run(store: &SqliteStore, id: &str, status: TaskStatus) {
        store
            .create_task_run(&TaskRun {
                id: id.into(),
                owner_id: "owner".into(),
                status,
                started_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    async fn wait_for_status(store: &SqliteStore, id: &str, status: TaskStatus) {
        for _ in 0..200 {
            if store.task_run(id).await.unwrap().unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {id} never reached {status:?}");
    }

    #[tokio::test]
    async fn recover_restarts_only_in_progress_runs() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        add_run(&store, "active", TaskStatus::InProgress).await;
        add_run(&store, "stopped", TaskStatus::Stopped).await;
        let sup = supervisor(store.clone(), 2, Duration::from_millis(1));

        let spawned = sup.recover(store.as_ref()).await.unwrap();
        assert_eq!(spawned, vec!["active".to_string()]);

        wait_for_status(&store, "active", TaskStatus::Completed).await;
        assert_eq!(store.checkpoints("active").await.unwrap().len(), 2);
        assert!(store.checkpoints("stopped").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recover_skips_runs_leased_elsewhere() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        add_run(&store, "r1", TaskStatus::InProgress).await;
        store
            .acquire_lease("r1", "other-process", Duration::from_secs(60))
            .await
            .unwrap();
        let sup = supervisor(store.clone(), 2, Duration::from_millis(1));

        sup.recover(store.as_ref()).await.unwrap();
        sup.shutdown().await;
        assert!(store.checkpoints("r1").await.unwrap().is_empty());
        let run = store.task_run("r1").await.unwrap().unwrap();
        assert_eq!(run.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn stopped_run_can_be_resumed() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        add_run(&store, "r1", TaskStatus::InProgress).await;
        let sup = supervisor(store.clone(), 3, Duration::from_millis(1));

        stop_run(store.as_ref(), "r1").await.unwrap();
        assert!(sup.spawn("r1", None));
        wait_for_status(&store, "r1", TaskStatus::Stopped).await;
        sup.shutdown().await;

        let sup = supervisor(store.clone(), 3, Duration::from_millis(1));
        resume_run(store.as_ref(), "r1").await.unwrap();
        assert!(sup.spawn("r1", None));
        wait_for_status(&store, "r1", TaskStatus::Completed).await;
        assert_eq!(store.checkpoints("r1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn shutdown_hands_back_the_lease() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        add_run(&store, "r1", TaskStatus::InProgress).await;
        let sup = supervisor(store.clone(), 100, Duration::from_secs(3600));

        assert!(sup.spawn("r1", None));
        assert!(!sup.spawn("r1", None));
        assert!(sup.is_running("r1"));
        for _ in 0..200 {
            if store.latest_checkpoint("r1").await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sup.shutdown().await;

        store
            .acquire_lease("r1", "next-process", Duration::from_secs(60))
            .await
            .unwrap();
        let run = store.task_run("r1").await.unwrap().unwrap();
        assert_eq!(run.status, TaskStatus::InProgress);
    }
}
