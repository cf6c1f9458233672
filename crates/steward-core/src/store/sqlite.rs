use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use super::{
    cosine_similarity, Checkpoint, Contact, KeywordHit, MemoryRecord, PersistenceStore,
    RetryPolicy, ScoredMemory, StoreError, TaskRun, TaskStatus,
};
use crate::session::{ContentPart, Message, Role};
use crate::tools::database::QueryExecutor;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    parts TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);

CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    content,
    content=messages,
    content_rowid=id
);

CREATE TRIGGER IF NOT EXISTS messages_ai AFTER INSERT ON messages BEGIN
    INSERT INTO messages_fts(rowid, content) VALUES (new.id, new.content);
END;

CREATE TRIGGER IF NOT EXISTS messages_ad AFTER DELETE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, content)
    VALUES ('delete', old.id, old.content);
END;

CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    content TEXT NOT NULL,
    embedding BLOB NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    source TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memories_owner ON memories(owner_id);

CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    content,
    content=memories,
    content_rowid=rowid
);

CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts(rowid, content) VALUES (new.rowid, new.content);
END;

CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content)
    VALUES ('delete', old.rowid, old.content);
END;

CREATE TABLE IF NOT EXISTS task_runs (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    lease_holder TEXT,
    lease_expires_at INTEGER
);

CREATE TABLE IF NOT EXISTS checkpoints (
    task_run_id TEXT NOT NULL,
    iteration INTEGER NOT NULL,
    state TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (task_run_id, iteration)
);

CREATE TABLE IF NOT EXISTS contacts (
    email TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    outlet TEXT,
    role TEXT,
    updated_at TEXT NOT NULL
);
";

/// SQLite-backed [`PersistenceStore`].
///
/// One connection behind a mutex; every call goes through the retry policy
/// so transient busy/locked errors are absorbed.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    retry: RetryPolicy,
}

impl SqliteStore {
    /// Open (or create) the database file.
    pub fn open(db_path: &Path, retry: RetryPolicy) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        debug!("Opened store at {}", db_path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            retry,
        })
    }

    /// Private in-memory database, used as the test fake.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            retry: RetryPolicy::none(),
        })
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))
    }

    async fn with_conn<T, F>(&self, label: &str, mut f: F) -> Result<T, StoreError>
    where
        F: FnMut(&mut Connection) -> Result<T, StoreError> + Send,
        T: Send,
    {
        self.retry
            .run(label, || {
                let mut conn = self.lock_conn()?;
                f(&mut conn)
            })
            .await
    }
}

/// Build an FTS5 query: each token quoted, joined with OR so partial
/// matches still rank.
fn build_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| {
            let escaped = token.replace('"', "\"\"");
            format!("\"{escaped}\"")
        })
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn encode_embedding(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn keyword_search(
    conn: &Connection,
    sql: &str,
    owner_id: &str,
    query: &str,
    limit: usize,
) -> Result<Vec<KeywordHit>, StoreError> {
    let fts_query = build_fts_query(query);
    if fts_query.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(sql)?;
    let hits = stmt
        .query_map(params![fts_query, owner_id, limit as i64], |row| {
            Ok(KeywordHit {
                content: row.get(0)?,
                // FTS5 rank is negative (lower = better), negate for display
                score: -row.get::<_, f64>(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(hits)
}

fn checkpoint_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, i64, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_checkpoint((task_run_id, iteration, state, ts): (String, i64, String, String)) -> Checkpoint {
    Checkpoint {
        task_run_id,
        iteration: iteration as u64,
        state,
        timestamp: parse_ts(&ts),
    }
}

#[async_trait]
impl PersistenceStore for SqliteStore {
    async fn append_message(&self, message: &Message) -> Result<(), StoreError> {
        let parts = serde_json::to_string(&message.parts)?;
        let text = message.flat_text();
        let created_at = message.created_at.to_rfc3339();
        self.with_conn("append_message", |conn| {
            conn.execute(
                "INSERT INTO messages (session_id, owner_id, role, content, parts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.session_id,
                    message.owner_id,
                    message.role.as_str(),
                    text,
                    parts,
                    created_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn session_messages(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<(String, String, String, String, String)> = self
            .with_conn("session_messages", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, owner_id, role, parts, created_at
                     FROM messages WHERE session_id = ?1 ORDER BY id ASC",
                )?;
                let rows = stmt
                    .query_map([session_id], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for (session_id, owner_id, role, parts, created_at) in rows {
            let Some(role) = Role::parse(&role) else {
                warn!("Skipping message with unknown role '{role}' in session {session_id}");
                continue;
            };
            let parts: Vec<ContentPart> = match serde_json::from_str(&parts) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Skipping malformed message parts in session {session_id}: {e}");
                    continue;
                }
            };
            messages.push(Message {
                session_id,
                owner_id,
                role,
                parts,
                created_at: parse_ts(&created_at),
            });
        }
        Ok(messages)
    }

    async fn search_messages(
        &self,
        owner_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KeywordHit>, StoreError> {
        self.with_conn("search_messages", |conn| {
            keyword_search(
                conn,
                "SELECT m.content, rank
                 FROM messages_fts
                 JOIN messages m ON messages_fts.rowid = m.id
                 WHERE messages_fts MATCH ?1 AND m.owner_id = ?2
                 ORDER BY rank
                 LIMIT ?3",
                owner_id,
                query,
                limit,
            )
        })
        .await
    }

    async fn insert_memory(&self, record: &MemoryRecord) -> Result<(), StoreError> {
        let tags = serde_json::to_string(&record.tags)?;
        let embedding = encode_embedding(&record.embedding);
        let created_at = record.created_at.to_rfc3339();
        self.with_conn("insert_memory", |conn| {
            conn.execute(
                "INSERT INTO memories (id, owner_id, content, embedding, tags, source, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.id,
                    record.owner_id,
                    record.content,
                    embedding,
                    tags,
                    record.source,
                    created_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn similar_memories(
        &self,
        owner_id: &str,
        embedding: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<ScoredMemory>, StoreError> {
        let rows: Vec<(String, Vec<u8>)> = self
            .with_conn("similar_memories", |conn| {
                let mut stmt =
                    conn.prepare("SELECT content, embedding FROM memories WHERE owner_id = ?1")?;
                let rows = stmt
                    .query_map([owner_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut scored: Vec<ScoredMemory> = rows
            .into_iter()
            .map(|(content, blob)| ScoredMemory {
                similarity: cosine_similarity(embedding, &decode_embedding(&blob)),
                content,
            })
            .filter(|m| m.similarity >= threshold)
            .collect();
        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn search_memories(
        &self,
        owner_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KeywordHit>, StoreError> {
        self.with_conn("search_memories", |conn| {
            keyword_search(
                conn,
                "SELECT m.content, rank
                 FROM memories_fts
                 JOIN memories m ON memories_fts.rowid = m.rowid
                 WHERE memories_fts MATCH ?1 AND m.owner_id = ?2
                 ORDER BY rank
                 LIMIT ?3",
                owner_id,
                query,
                limit,
            )
        })
        .await
    }

    async fn create_task_run(&self, run: &TaskRun) -> Result<(), StoreError> {
        let started_at = run.started_at.to_rfc3339();
        self.with_conn("create_task_run", |conn| {
            conn.execute(
                "INSERT INTO task_runs (id, owner_id, status, started_at) VALUES (?1, ?2, ?3, ?4)",
                params![run.id, run.owner_id, run.status.as_str(), started_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn task_run(&self, id: &str) -> Result<Option<TaskRun>, StoreError> {
        let row: Option<(String, String, String, String)> = self
            .with_conn("task_run", |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, owner_id, status, started_at FROM task_runs WHERE id = ?1",
                        [id],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                    )
                    .optional()?)
            })
            .await?;

        Ok(row.map(|(id, owner_id, status, started_at)| TaskRun {
            // Unknown status strings are treated as stopped so the executor halts.
            status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Stopped),
            id,
            owner_id,
            started_at: parse_ts(&started_at),
        }))
    }

    async fn task_runs_with_status(&self, status: TaskStatus) -> Result<Vec<TaskRun>, StoreError> {
        let rows: Vec<(String, String, String)> = self
            .with_conn("task_runs_with_status", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, owner_id, started_at FROM task_runs
                     WHERE status = ?1 ORDER BY started_at ASC",
                )?;
                let rows = stmt
                    .query_map([status.as_str()], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, owner_id, started_at)| TaskRun {
                id,
                owner_id,
                status,
                started_at: parse_ts(&started_at),
            })
            .collect())
    }

    async fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<(), StoreError> {
        self.with_conn("set_task_status", |conn| {
            let changed = conn.execute(
                "UPDATE task_runs SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("task run {id}")));
            }
            Ok(())
        })
        .await
    }

    async fn acquire_lease(
        &self,
        id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.with_conn("acquire_lease", |conn| {
            let now = Utc::now().timestamp_millis();
            let expires = now + ttl.as_millis() as i64;
            let changed = conn.execute(
                "UPDATE task_runs SET lease_holder = ?2, lease_expires_at = ?3
                 WHERE id = ?1 AND (lease_holder IS NULL OR lease_holder = ?2
                                    OR lease_expires_at IS NULL OR lease_expires_at <= ?4)",
                params![id, holder, expires, now],
            )?;
            if changed > 0 {
                return Ok(());
            }
            let current: Option<Option<String>> = conn
                .query_row(
                    "SELECT lease_holder FROM task_runs WHERE id = ?1",
                    [id],
                    |row| row.get(0),
                )
                .optional()?;
            match current {
                None => Err(StoreError::NotFound(format!("task run {id}"))),
                Some(holder) => Err(StoreError::LeaseHeld {
                    holder: holder.unwrap_or_default(),
                }),
            }
        })
        .await
    }

    async fn release_lease(&self, id: &str, holder: &str) -> Result<(), StoreError> {
        self.with_conn("release_lease", |conn| {
            conn.execute(
                "UPDATE task_runs SET lease_holder = NULL, lease_expires_at = NULL
                 WHERE id = ?1 AND lease_holder = ?2",
                params![id, holder],
            )?;
            Ok(())
        })
        .await
    }

    async fn latest_checkpoint(
        &self,
        task_run_id: &str,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let row = self
            .with_conn("latest_checkpoint", |conn| {
                Ok(conn
                    .query_row(
                        "SELECT task_run_id, iteration, state, created_at FROM checkpoints
                         WHERE task_run_id = ?1 ORDER BY iteration DESC LIMIT 1",
                        [task_run_id],
                        checkpoint_from_row,
                    )
                    .optional()?)
            })
            .await?;
        Ok(row.map(into_checkpoint))
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let created_at = checkpoint.timestamp.to_rfc3339();
        self.with_conn("save_checkpoint", |conn| {
            let tx = conn.transaction()?;
            let current: Option<i64> = tx.query_row(
                "SELECT MAX(iteration) FROM checkpoints WHERE task_run_id = ?1",
                [&checkpoint.task_run_id],
                |row| row.get(0),
            )?;
            let expected = current.map_or(1, |c| c as u64 + 1);
            if checkpoint.iteration != expected {
                return Err(StoreError::CheckpointOutOfOrder {
                    expected,
                    got: checkpoint.iteration,
                });
            }
            tx.execute(
                "INSERT INTO checkpoints (task_run_id, iteration, state, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    checkpoint.task_run_id,
                    checkpoint.iteration as i64,
                    checkpoint.state,
                    created_at,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn checkpoints(&self, task_run_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        let rows = self
            .with_conn("checkpoints", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT task_run_id, iteration, state, created_at FROM checkpoints
                     WHERE task_run_id = ?1 ORDER BY iteration ASC",
                )?;
                let rows = stmt
                    .query_map([task_run_id], checkpoint_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows.into_iter().map(into_checkpoint).collect())
    }

    async fn upsert_contact(&self, contact: &Contact) -> Result<(), StoreError> {
        let email = contact.email.trim().to_lowercase();
        let now = Utc::now().to_rfc3339();
        self.with_conn("upsert_contact", |conn| {
            conn.execute(
                "INSERT INTO contacts (email, name, outlet, role, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(email) DO UPDATE SET
                    name = excluded.name,
                    outlet = excluded.outlet,
                    role = excluded.role,
                    updated_at = excluded.updated_at",
                params![email, contact.name, contact.outlet, contact.role, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn contacts(&self) -> Result<Vec<Contact>, StoreError> {
        self.with_conn("contacts", |conn| {
            let mut stmt =
                conn.prepare("SELECT name, email, outlet, role FROM contacts ORDER BY email")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(Contact {
                        name: row.get(0)?,
                        email: row.get(1)?,
                        outlet: row.get(2)?,
                        role: row.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

fn json_to_sql(v: &serde_json::Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match v {
        serde_json::Value::Null => Sql::Null,
        serde_json::Value::Bool(b) => Sql::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Sql::Integer(i),
            None => Sql::Real(n.as_f64().unwrap_or(0.0)),
        },
        serde_json::Value::String(s) => Sql::Text(s.clone()),
        other => Sql::Text(other.to_string()),
    }
}

fn sql_to_json(v: rusqlite::types::ValueRef<'_>) -> serde_json::Value {
    use rusqlite::types::ValueRef;
    match v {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::json!(i),
        ValueRef::Real(f) => serde_json::json!(f),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::String(format!("<blob {} bytes>", b.len())),
    }
}

#[async_trait]
impl QueryExecutor for SqliteStore {
    async fn execute_raw(
        &self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> Result<serde_json::Value, StoreError> {
        let values: Vec<rusqlite::types::Value> = params.iter().map(json_to_sql).collect();
        self.with_conn("execute_raw", |conn| {
            let mut stmt = conn.prepare(sql)?;
            if stmt.column_count() == 0 {
                let affected = stmt.execute(rusqlite::params_from_iter(values.iter()))?;
                return Ok(serde_json::json!({ "rowsAffected": affected }));
            }
            let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
            let mut rows = stmt.query(rusqlite::params_from_iter(values.iter()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut obj = serde_json::Map::new();
                for (i, name) in names.iter().enumerate() {
                    obj.insert(name.clone(), sql_to_json(row.get_ref(i)?));
                }
                out.push(serde_json::Value::Object(obj));
            }
            Ok(serde_json::json!({ "rows": out }))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn memory(owner: &str, content: &str, embedding: Vec<f32>) -> MemoryRecord {
        MemoryRecord {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner.into(),
            content: content.into(),
            embedding,
            tags: vec![],
            source: "test".into(),
            created_at: Utc::now(),
        }
    }

    fn run(id: &str) -> TaskRun {
        TaskRun {
            id: id.into(),
            owner_id: "owner".into(),
            status: TaskStatus::InProgress,
            started_at: Utc::now(),
        }
    }

    fn checkpoint(run: &str, iteration: u64, state: &str) -> Checkpoint {
        Checkpoint {
            task_run_id: run.into(),
            iteration,
            state: state.into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_build_fts_query() {
        assert_eq!(build_fts_query("hello world"), "\"hello\" OR \"world\"");
        assert_eq!(build_fts_query("single"), "\"single\"");
        assert_eq!(build_fts_query("   "), "");
        assert_eq!(build_fts_query(r#"say "hi""#), r#""say" OR """hi""""#);
    }

    #[test]
    fn test_embedding_blob_round_trip() {
        let v = vec![0.25f32, -1.5, 3.0];
        assert_eq!(decode_embedding(&encode_embedding(&v)), v);
    }

    #[test]
    fn test_open_on_disk_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("steward.sqlite");
        let store = SqliteStore::open(&path, RetryPolicy::default()).unwrap();
        assert!(path.exists());

        let conn = store.lock_conn().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table'
                 AND name IN ('messages', 'memories', 'task_runs', 'checkpoints', 'contacts')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn test_messages_append_in_order() {
        let store = store();
        store
            .append_message(&Message::text("s1", "o", Role::User, "first"))
            .await
            .unwrap();
        store
            .append_message(&Message::text("s1", "o", Role::Assistant, "second"))
            .await
            .unwrap();
        store
            .append_message(&Message::text("s2", "o", Role::User, "other session"))
            .await
            .unwrap();

        let messages = store.session_messages("s1").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].flat_text(), "first");
        assert_eq!(messages[1].role, Role::Assistant);
        assert!(store.session_messages("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_messages_scoped_to_owner() {
        let store = store();
        store
            .append_message(&Message::text("s1", "alice", Role::User, "deploy the staging branch"))
            .await
            .unwrap();
        store
            .append_message(&Message::text("s2", "bob", Role::User, "deploy production now"))
            .await
            .unwrap();

        let hits = store.search_messages("alice", "deploy", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("staging"));
        assert!(store.search_messages("alice", "", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_similar_memories_threshold_and_order() {
        let store = store();
        store
            .insert_memory(&memory("o", "exact", vec![1.0, 0.0]))
            .await
            .unwrap();
        store
            .insert_memory(&memory("o", "close", vec![0.9, 0.3]))
            .await
            .unwrap();
        store
            .insert_memory(&memory("o", "orthogonal", vec![0.0, 1.0]))
            .await
            .unwrap();
        store
            .insert_memory(&memory("other", "foreign", vec![1.0, 0.0]))
            .await
            .unwrap();

        let hits = store.similar_memories("o", &[1.0, 0.0], 0.7, 5).await.unwrap();
        let contents: Vec<&str> = hits.iter().map(|h| h.content.as_str()).collect();
        assert_eq!(contents, vec!["exact", "close"]);

        let limited = store.similar_memories("o", &[1.0, 0.0], 0.7, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_search_memories_keyword() {
        let store = store();
        store
            .insert_memory(&memory("o", "User prefers Rust over Python", vec![0.0]))
            .await
            .unwrap();
        let hits = store.search_memories("o", "rust", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(store.search_memories("o", "xyznothing", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_checkpoints_are_gap_free() {
        let store = store();
        store.create_task_run(&run("r1")).await.unwrap();

        assert!(store.latest_checkpoint("r1").await.unwrap().is_none());
        store.save_checkpoint(&checkpoint("r1", 1, "q1")).await.unwrap();
        store.save_checkpoint(&checkpoint("r1", 2, "q2")).await.unwrap();

        let err = store
            .save_checkpoint(&checkpoint("r1", 4, "q4"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::CheckpointOutOfOrder {
                expected: 3,
                got: 4
            }
        ));

        let err = store
            .save_checkpoint(&checkpoint("r1", 2, "again"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CheckpointOutOfOrder { .. }));

        let latest = store.latest_checkpoint("r1").await.unwrap().unwrap();
        assert_eq!(latest.iteration, 2);
        assert_eq!(latest.state, "q2");
        assert_eq!(store.checkpoints("r1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_first_checkpoint_must_be_one() {
        let store = store();
        let err = store
            .save_checkpoint(&checkpoint("r1", 0, "q"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::CheckpointOutOfOrder {
                expected: 1,
                got: 0
            }
        ));
    }

    #[tokio::test]
    async fn test_upsert_contact_is_idempotent_by_email() {
        let store = store();
        let mut contact = Contact {
            name: "Anna Nowak".into(),
            email: "anna@gazeta.pl".into(),
            outlet: Some("Gazeta".into()),
            role: None,
        };
        store.upsert_contact(&contact).await.unwrap();
        store.upsert_contact(&contact).await.unwrap();

        contact.email = " ANNA@gazeta.pl ".into();
        contact.role = Some("editor".into());
        store.upsert_contact(&contact).await.unwrap();

        let all = store.contacts().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].email, "anna@gazeta.pl");
        assert_eq!(all[0].role.as_deref(), Some("editor"));
    }

    #[tokio::test]
    async fn test_task_status_updates() {
        let store = store();
        store.create_task_run(&run("r1")).await.unwrap();
        store
            .set_task_status("r1", TaskStatus::Stopped)
            .await
            .unwrap();
        let loaded = store.task_run("r1").await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Stopped);

        assert!(store.task_run("nope").await.unwrap().is_none());
        let err = store
            .set_task_status("nope", TaskStatus::Stopped)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_task_runs_filtered_by_status() {
        let store = store();
        store.create_task_run(&run("r1")).await.unwrap();
        store.create_task_run(&run("r2")).await.unwrap();
        store
            .set_task_status("r2", TaskStatus::Stopped)
            .await
            .unwrap();

        let active = store
            .task_runs_with_status(TaskStatus::InProgress)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "r1");
        assert_eq!(active[0].status, TaskStatus::InProgress);
        assert!(store
            .task_runs_with_status(TaskStatus::Completed)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_lease_excludes_second_holder() {
        let store = store();
        store.create_task_run(&run("r1")).await.unwrap();
        let ttl = Duration::from_secs(60);

        store.acquire_lease("r1", "worker-a", ttl).await.unwrap();
        // Renewal by the same holder succeeds
        store.acquire_lease("r1", "worker-a", ttl).await.unwrap();

        let err = store.acquire_lease("r1", "worker-b", ttl).await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseHeld { ref holder } if holder == "worker-a"));

        store.release_lease("r1", "worker-a").await.unwrap();
        store.acquire_lease("r1", "worker-b", ttl).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken() {
        let store = store();
        store.create_task_run(&run("r1")).await.unwrap();
        store
            .acquire_lease("r1", "worker-a", Duration::ZERO)
            .await
            .unwrap();
        store
            .acquire_lease("r1", "worker-b", Duration::from_secs(60))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_lease_on_missing_run() {
        let store = store();
        let err = store
            .acquire_lease("missing", "w", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_execute_raw_query_and_statement() {
        let store = store();
        let result = store
            .execute_raw(
                "INSERT INTO contacts (email, name, updated_at) VALUES (?1, ?2, ?3)",
                &[
                    serde_json::json!("x@y.pl"),
                    serde_json::json!("X"),
                    serde_json::json!("2025-01-01T00:00:00Z"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(result["rowsAffected"], 1);

        let result = store
            .execute_raw("SELECT email, name FROM contacts", &[])
            .await
            .unwrap();
        assert_eq!(result["rows"][0]["email"], "x@y.pl");
        assert_eq!(result["rows"][0]["name"], "X");
    }

    #[tokio::test]
    async fn test_execute_raw_invalid_sql_is_error() {
        let store = store();
        assert!(store.execute_raw("SELEKT nope", &[]).await.is_err());
    }
}
