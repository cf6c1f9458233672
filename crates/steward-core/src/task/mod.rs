pub mod executor;
pub mod extraction;
pub mod supervisor;

use chrono::Utc;
use serde::Serialize;

use crate::store::{Checkpoint, PersistenceStore, StoreError, TaskRun, TaskStatus};

pub use executor::{DurableTaskExecutor, ExecutorSettings, RunOutcome};
pub use extraction::Extraction;
pub use supervisor::TaskSupervisor;

/// Snapshot of a run for operators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub run: TaskRun,
    pub latest_checkpoint: Option<Checkpoint>,
    pub contacts: usize,
}

/// Create a new run in `in_progress`.
pub async fn start_run(store: &dyn PersistenceStore, owner_id: &str) -> Result<TaskRun, StoreError> {
    let run = TaskRun {
        id: uuid::Uuid::new_v4().to_string(),
        owner_id: owner_id.to_string(),
        status: TaskStatus::InProgress,
        started_at: Utc::now(),
    };
    store.create_task_run(&run).await?;
    Ok(run)
}

/// Ask a run to stop. The executor notices at its next status check.
pub async fn stop_run(store: &dyn PersistenceStore, id: &str) -> Result<(), StoreError> {
    store.set_task_status(id, TaskStatus::Stopped).await
}

/// Put a stopped run back to `in_progress` so an executor can pick it up
/// from its latest checkpoint. Completed runs stay completed.
pub async fn resume_run(store: &dyn PersistenceStore, id: &str) -> Result<TaskRun, StoreError> {
    let mut run = store
        .task_run(id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("task run {id}")))?;
    match run.status {
        TaskStatus::Completed => Err(StoreError::InvalidState(format!(
            "task run {id} is completed"
        ))),
        TaskStatus::InProgress => Ok(run),
        TaskStatus::Stopped => {
            store.set_task_status(id, TaskStatus::InProgress).await?;
            run.status = TaskStatus::InProgress;
            Ok(run)
        }
    }
}

pub async fn run_status(
    store: &dyn PersistenceStore,
    id: &str,
) -> Result<Option<RunStatus>, StoreError> {
    let Some(run) = store.task_run(id).await? else {
        return Ok(None);
    };
    Ok(Some(RunStatus {
        latest_checkpoint: store.latest_checkpoint(id).await?,
        contacts: store.contacts().await?.len(),
        run,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    #[tokio::test]
    async fn start_stop_and_status() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = start_run(&store, "owner").await.unwrap();
        assert_eq!(run.status, TaskStatus::InProgress);

        let status = run_status(&store, &run.id).await.unwrap().unwrap();
        assert!(status.latest_checkpoint.is_none());
        assert_eq!(status.contacts, 0);

        stop_run(&store, &run.id).await.unwrap();
        let status = run_status(&store, &run.id).await.unwrap().unwrap();
        assert_eq!(status.run.status, TaskStatus::Stopped);

        assert!(run_status(&store, "missing").await.unwrap().is_none());
        assert!(stop_run(&store, "missing").await.is_err());
    }

    #[tokio::test]
    async fn resume_reopens_stopped_run_only() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = start_run(&store, "owner").await.unwrap();
        stop_run(&store, &run.id).await.unwrap();

        let resumed = resume_run(&store, &run.id).await.unwrap();
        assert_eq!(resumed.status, TaskStatus::InProgress);
        let stored = store.task_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::InProgress);

        store
            .set_task_status(&run.id, TaskStatus::Completed)
            .await
            .unwrap();
        assert!(matches!(
            resume_run(&store, &run.id).await,
            Err(StoreError::InvalidState(_))
        ));
        assert!(matches!(
            resume_run(&store, "missing").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
