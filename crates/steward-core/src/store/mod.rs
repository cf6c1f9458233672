pub mod retry;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::Message;

pub use retry::RetryPolicy;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database busy: {0}")]
    Busy(String),
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("checkpoint out of order: expected iteration {expected}, got {got}")]
    CheckpointOutOfOrder { expected: u64, got: u64 },
    #[error("task run lease held by '{holder}'")]
    LeaseHeld { holder: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("lock poisoned: {0}")]
    Lock(String),
}

impl StoreError {
    /// Transient driver errors are worth retrying; everything else fails fast.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                StoreError::Busy(e.to_string())
            }
            _ => StoreError::Sqlite(e),
        }
    }
}

/// A long-term memory entry. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    pub id: String,
    pub owner_id: String,
    pub content: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// A memory returned by vector search.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub content: String,
    pub similarity: f32,
}

/// A row returned by full-text search.
#[derive(Debug, Clone)]
pub struct KeywordHit {
    pub content: String,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    InProgress,
    Stopped,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Stopped => "stopped",
            TaskStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "in_progress" | "inprogress" => Some(Self::InProgress),
            "stopped" => Some(Self::Stopped),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// One run of the background collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRun {
    pub id: String,
    pub owner_id: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
}

/// Durable resumable state of a task run after `iteration` committed iterations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub task_run_id: String,
    pub iteration: u64,
    pub state: String,
    pub timestamp: DateTime<Utc>,
}

/// A collected contact, keyed by e-mail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, schemars::JsonSchema)]
pub struct Contact {
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outlet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Durable storage used by every core component.
///
/// Implementations serialize conflicting writes; messages, memories and
/// checkpoints are append-only.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn append_message(&self, message: &Message) -> Result<(), StoreError>;
    async fn session_messages(&self, session_id: &str) -> Result<Vec<Message>, StoreError>;
    async fn search_messages(
        &self,
        owner_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KeywordHit>, StoreError>;

    async fn insert_memory(&self, record: &MemoryRecord) -> Result<(), StoreError>;
    /// Memories with cosine similarity >= `threshold`, best first.
    async fn similar_memories(
        &self,
        owner_id: &str,
        embedding: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<ScoredMemory>, StoreError>;
    async fn search_memories(
        &self,
        owner_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KeywordHit>, StoreError>;

    async fn create_task_run(&self, run: &TaskRun) -> Result<(), StoreError>;
    async fn task_run(&self, id: &str) -> Result<Option<TaskRun>, StoreError>;
    /// Runs currently in `status`, oldest first.
    async fn task_runs_with_status(&self, status: TaskStatus) -> Result<Vec<TaskRun>, StoreError>;
    async fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<(), StoreError>;
    /// Take or renew the single-owner lease on a run.
    async fn acquire_lease(&self, id: &str, holder: &str, ttl: Duration)
        -> Result<(), StoreError>;
    async fn release_lease(&self, id: &str, holder: &str) -> Result<(), StoreError>;

    async fn latest_checkpoint(&self, task_run_id: &str)
        -> Result<Option<Checkpoint>, StoreError>;
    /// Commit a checkpoint. The iteration must be exactly one past the latest.
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;
    async fn checkpoints(&self, task_run_id: &str) -> Result<Vec<Checkpoint>, StoreError>;

    /// Insert or update by natural key (e-mail).
    async fn upsert_contact(&self, contact: &Contact) -> Result<(), StoreError>;
    async fn contacts(&self) -> Result<Vec<Contact>, StoreError>;
}

/// Cosine similarity of two vectors. Mismatched or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}
