use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;

use super::{Tool, ToolError};
use crate::store::StoreError;

/// Raw SQL execution against the application database.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Returns `{rows: [...]}` for queries and `{rowsAffected}` for statements.
    async fn execute_raw(
        &self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> Result<serde_json::Value, StoreError>;
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteRawArgs {
    /// A single SQL statement. Use ?1, ?2 ... placeholders for parameters.
    pub sql: String,
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
}

pub struct DatabaseExecuteRawTool {
    executor: Arc<dyn QueryExecutor>,
}

impl DatabaseExecuteRawTool {
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Tool for DatabaseExecuteRawTool {
    type Args = ExecuteRawArgs;
    const NAME: &'static str = "database_execute_raw";
    const MUTATING: bool = true;

    fn description(&self) -> &str {
        "Execute a raw SQL statement against the application database and return rows or the affected row count."
    }

    async fn execute(&self, args: ExecuteRawArgs) -> Result<serde_json::Value, ToolError> {
        if args.sql.trim().is_empty() {
            return Err(ToolError::InvalidArguments("sql must not be empty".into()));
        }
        self.executor
            .execute_raw(&args.sql, &args.params)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    #[tokio::test]
    async fn runs_statement_and_query() {
        let tool = DatabaseExecuteRawTool::new(Arc::new(SqliteStore::open_in_memory().unwrap()));
        tool.execute(ExecuteRawArgs {
            sql: "CREATE TABLE notes (body TEXT)".into(),
            params: vec![],
        })
        .await
        .unwrap();
        let inserted = tool
            .execute(ExecuteRawArgs {
                sql: "INSERT INTO notes (body) VALUES (?1)".into(),
                params: vec![serde_json::json!("hello")],
            })
            .await
            .unwrap();
        assert_eq!(inserted["rowsAffected"], 1);

        let rows = tool
            .execute(ExecuteRawArgs {
                sql: "SELECT body FROM notes".into(),
                params: vec![],
            })
            .await
            .unwrap();
        assert_eq!(rows["rows"][0]["body"], "hello");
    }

    #[tokio::test]
    async fn sql_errors_are_execution_errors() {
        let tool = DatabaseExecuteRawTool::new(Arc::new(SqliteStore::open_in_memory().unwrap()));
        let err = tool
            .execute(ExecuteRawArgs {
                sql: "DROP TABLE nothing_here".into(),
                params: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Execution(_)));
    }
}
