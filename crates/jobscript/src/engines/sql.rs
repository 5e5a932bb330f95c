//! SQL engine: executes script statements against a database
//!
//! Connections come from a configured pool or, per script, from a `dsn`
//! entry in the metadata bag. Scripts are split into statements by a
//! boundary marker (default `--job`) or by `;`. With `transaction` enabled
//! every statement runs inside one transaction that rolls back on the first
//! failure.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sqlx::{AnyPool, Connection};
use tracing::{debug, error, info};

use crate::context::ExecContext;
use crate::errors::{codes, JobError, JobResult};
use crate::metadata::MetadataParser;
use crate::model::ExecutionMessage;
use crate::sources::SourceProvider;
use crate::tasks::{Task, TaskIdProvider, TaskIdProviderAware};

use super::{Engine, EngineCore};

pub struct SqlEngine {
    core: EngineCore,
    pool: Option<AnyPool>,
    database_url: Option<String>,
    statement_boundary: String,
}

impl SqlEngine {
    pub fn new() -> Self {
        Self {
            core: EngineCore::new("sql", &[".sql"]),
            pool: None,
            database_url: None,
            statement_boundary: "--job".to_string(),
        }
    }

    /// Use an already-connected pool for every script.
    pub fn with_pool(mut self, pool: AnyPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Connection URL used when scripts do not carry their own `dsn`.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Marker splitting a script into statements. An empty marker falls
    /// back to `;` splitting.
    pub fn with_statement_boundary(mut self, boundary: impl Into<String>) -> Self {
        self.statement_boundary = boundary.into();
        self
    }

    pub fn with_extension(mut self, ext: &str) -> Self {
        self.core.add_extension(ext);
        self
    }

    pub fn with_default_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.core.set_default_timeout(timeout);
        self
    }

    pub fn with_metadata_parser(mut self, parser: MetadataParser) -> Self {
        self.core.set_parser(parser);
        self
    }

    pub fn with_source_provider(self, provider: Arc<dyn SourceProvider>) -> Self {
        self.core.set_source_provider(provider);
        self
    }

    /// The configured pool, or a per-script connection from `dsn` metadata
    /// (pinged before use).
    async fn acquire_pool(&self, msg: &ExecutionMessage) -> JobResult<(AnyPool, bool)> {
        if let Some(pool) = &self.pool {
            return Ok((pool.clone(), false));
        }

        let dsn = msg
            .config
            .metadata_str("dsn")
            .map(str::to_string)
            .or_else(|| self.database_url.clone())
            .ok_or_else(|| {
                JobError::external(
                    codes::SQL_CONNECTION_ERROR,
                    "database connection details not provided",
                )
                .with_metadata("script_path", msg.script_path.clone())
            })?;

        let pool = AnyPool::connect(&dsn).await.map_err(|e| {
            JobError::external(
                codes::SQL_CONNECTION_ERROR,
                "failed to establish database connection",
            )
            .with_metadata("script_path", msg.script_path.clone())
            .with_metadata("operation", "establish_connection")
            .with_source(e)
        })?;

        let mut conn = pool.acquire().await.map_err(|e| {
            JobError::external(codes::SQL_CONNECTION_ERROR, "failed to acquire connection")
                .with_source(e)
        })?;
        conn.ping().await.map_err(|e| {
            JobError::external(codes::SQL_CONNECTION_ERROR, "database ping failed")
                .with_metadata("script_path", msg.script_path.clone())
                .with_source(e)
        })?;

        Ok((pool, true))
    }

    async fn execute_in_transaction(&self, pool: &AnyPool, script: &str) -> JobResult<()> {
        let mut tx = pool.begin().await.map_err(|e| {
            JobError::external(codes::SQL_TRANSACTION_ERROR, "failed to start transaction")
                .with_metadata("operation", "begin_transaction")
                .with_source(e)
        })?;

        let statements = split_statements(script, &self.statement_boundary);
        let total = statements.len();

        for (i, stmt) in statements.iter().enumerate() {
            if let Err(e) = sqlx::query(stmt).execute(&mut *tx).await {
                if let Err(rollback_err) = tx.rollback().await {
                    error!(error = %rollback_err, "rollback failed after statement error");
                }
                return Err(statement_error(e, i + 1, total, stmt));
            }
        }

        tx.commit().await.map_err(|e| {
            JobError::external(codes::SQL_TRANSACTION_ERROR, "failed to commit transaction")
                .with_metadata("operation", "commit_transaction")
                .with_source(e)
        })
    }

    async fn execute_directly(&self, pool: &AnyPool, script: &str) -> JobResult<()> {
        let statements = split_statements(script, &self.statement_boundary);
        let total = statements.len();

        for (i, stmt) in statements.iter().enumerate() {
            debug!(statement = %stmt, "executing statement");
            match sqlx::query(stmt).execute(pool).await {
                Ok(done) => {
                    debug!(rows = done.rows_affected(), "statement completed");
                }
                Err(e) => return Err(statement_error(e, i + 1, total, stmt)),
            }
        }
        Ok(())
    }
}

impl Default for SqlEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskIdProviderAware for SqlEngine {
    fn set_task_id_provider(&self, provider: TaskIdProvider) {
        self.core.set_task_id_provider(provider);
    }
}

#[async_trait]
impl Engine for SqlEngine {
    fn name(&self) -> String {
        self.core.name()
    }

    fn can_handle(&self, path: &str) -> bool {
        self.core.can_handle(path)
    }

    fn parse_job(self: Arc<Self>, path: &str, content: &[u8]) -> JobResult<Task> {
        let engine: Arc<dyn Engine> = self.clone();
        self.core.parse_job(engine, path, content)
    }

    async fn execute(&self, ctx: &ExecContext, msg: &ExecutionMessage) -> JobResult<()> {
        let script = self.core.script_content(msg).await?;
        let exec_ctx = self.core.execution_context(ctx, &msg.config);

        debug!(engine = "sql", script_path = %msg.script_path, "sql script starting");
        let start = Instant::now();

        let (pool, owned) = self.acquire_pool(msg).await?;

        // transaction metadata overrides the config flag when present.
        let use_transaction = msg
            .config
            .metadata_bool("transaction")
            .unwrap_or(msg.config.transaction);

        let run = async {
            if use_transaction {
                self.execute_in_transaction(&pool, &script).await
            } else {
                self.execute_directly(&pool, &script).await
            }
        };

        let exec_result = tokio::select! {
            result = run => result,
            _ = exec_ctx.done() => Err(JobError::cancelled()
                .with_metadata("script_path", msg.script_path.clone())),
        };

        if owned {
            pool.close().await;
        }

        let duration = start.elapsed();
        match exec_result {
            Ok(()) => {
                info!(
                    engine = "sql",
                    script_path = %msg.script_path,
                    duration_ms = duration.as_millis() as u64,
                    "sql script completed"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    engine = "sql",
                    script_path = %msg.script_path,
                    duration_ms = duration.as_millis() as u64,
                    error = %e,
                    "sql script failed"
                );
                Err(e)
            }
        }
    }

    fn as_task_id_aware(&self) -> Option<&dyn TaskIdProviderAware> {
        Some(self)
    }
}

fn statement_error(e: sqlx::Error, index: usize, total: usize, stmt: &str) -> JobError {
    JobError::external(
        codes::SQL_EXECUTION_ERROR,
        format!("failed to execute statement {index}"),
    )
    .with_metadata("operation", "execute_statement")
    .with_metadata("statement_index", index as i64)
    .with_metadata("total_statements", total as i64)
    .with_metadata("statement", stmt)
    .with_source(e)
}

/// Split a script into statements by the boundary marker, or by `;` when the
/// marker is empty. The `;` fallback is naive: it does not understand quoted
/// semicolons or PL/SQL blocks.
fn split_statements(script: &str, boundary: &str) -> Vec<String> {
    if !boundary.is_empty() && script.contains(boundary) {
        return script
            .split(boundary)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }

    script
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("{s};"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use sqlx::any::AnyPoolOptions;
    use sqlx::Row;

    async fn memory_pool() -> AnyPool {
        sqlx::any::install_default_drivers();
        AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    fn message(script: &str) -> ExecutionMessage {
        let mut msg = ExecutionMessage::new("job.sql");
        msg.script_path = "jobs/job.sql".to_string();
        msg.parameters.insert(
            crate::model::SCRIPT_PARAMETER.to_string(),
            Value::from(script),
        );
        msg
    }

    #[test]
    fn split_by_boundary_marker() {
        let script = "CREATE TABLE a (x INT)\n--job\nINSERT INTO a VALUES (1)\n--job\n";
        let statements = split_statements(script, "--job");
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], "CREATE TABLE a (x INT)");
    }

    #[test]
    fn split_by_semicolon_fallback() {
        let statements = split_statements("SELECT 1; SELECT 2;  ", "");
        assert_eq!(statements, vec!["SELECT 1;", "SELECT 2;"]);
    }

    #[tokio::test]
    async fn executes_statements_against_pool() {
        let pool = memory_pool().await;
        let engine = SqlEngine::new().with_pool(pool.clone());

        let msg = message(
            "CREATE TABLE runs (id INTEGER PRIMARY KEY, label TEXT);\nINSERT INTO runs (label) VALUES ('first');",
        );
        engine
            .execute(&ExecContext::background(), &msg)
            .await
            .unwrap();

        let row = sqlx::query("SELECT COUNT(*) FROM runs")
            .fetch_one(&pool)
            .await
            .unwrap();
        let count: i64 = row.try_get(0).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn statement_errors_carry_index_and_text() {
        let pool = memory_pool().await;
        let engine = SqlEngine::new().with_pool(pool);

        let msg = message("CREATE TABLE t (x INT);\nINSERT INTO nonexistent VALUES (1);");
        let err = engine
            .execute(&ExecContext::background(), &msg)
            .await
            .unwrap_err();

        assert_eq!(err.code, codes::SQL_EXECUTION_ERROR);
        assert_eq!(err.metadata.get("statement_index"), Some(&Value::from(2)));
        assert!(err
            .metadata
            .get("statement")
            .unwrap()
            .as_str()
            .unwrap()
            .contains("nonexistent"));
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_failure() {
        let pool = memory_pool().await;
        sqlx::query("CREATE TABLE t (x INTEGER)")
            .execute(&pool)
            .await
            .unwrap();

        let engine = SqlEngine::new().with_pool(pool.clone());
        let mut msg = message("INSERT INTO t VALUES (1);\nINSERT INTO nonexistent VALUES (2);");
        msg.config.transaction = true;

        let err = engine
            .execute(&ExecContext::background(), &msg)
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::SQL_EXECUTION_ERROR);

        // First insert must not survive.
        let row = sqlx::query("SELECT COUNT(*) FROM t")
            .fetch_one(&pool)
            .await
            .unwrap();
        let count: i64 = row.try_get(0).unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn transaction_commits_on_success() {
        let pool = memory_pool().await;
        sqlx::query("CREATE TABLE t (x INTEGER)")
            .execute(&pool)
            .await
            .unwrap();

        let engine = SqlEngine::new().with_pool(pool.clone());
        let mut msg = message("INSERT INTO t VALUES (1);\nINSERT INTO t VALUES (2);");
        msg.config.transaction = true;

        engine
            .execute(&ExecContext::background(), &msg)
            .await
            .unwrap();

        let row = sqlx::query("SELECT COUNT(*) FROM t")
            .fetch_one(&pool)
            .await
            .unwrap();
        let count: i64 = row.try_get(0).unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn metadata_transaction_flag_overrides_config() {
        let pool = memory_pool().await;
        sqlx::query("CREATE TABLE t (x INTEGER)")
            .execute(&pool)
            .await
            .unwrap();

        let engine = SqlEngine::new().with_pool(pool.clone());
        let mut msg = message("INSERT INTO t VALUES (1);\nINSERT INTO nonexistent VALUES (2);");
        msg.config.transaction = true;
        // Metadata says no transaction, so the first insert persists.
        msg.config
            .metadata
            .insert("transaction".to_string(), Value::from(false));

        engine
            .execute(&ExecContext::background(), &msg)
            .await
            .unwrap_err();

        let row = sqlx::query("SELECT COUNT(*) FROM t")
            .fetch_one(&pool)
            .await
            .unwrap();
        let count: i64 = row.try_get(0).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn missing_connection_details_is_a_connection_error() {
        let engine = SqlEngine::new();
        let msg = message("SELECT 1;");
        let err = engine
            .execute(&ExecContext::background(), &msg)
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::SQL_CONNECTION_ERROR);
    }

    #[tokio::test]
    async fn dsn_metadata_opens_its_own_connection() {
        sqlx::any::install_default_drivers();
        let engine = SqlEngine::new();
        let mut msg = message("CREATE TABLE scratch (x INT); INSERT INTO scratch VALUES (1);");
        msg.config
            .metadata
            .insert("dsn".to_string(), Value::from("sqlite::memory:"));

        engine
            .execute(&ExecContext::background(), &msg)
            .await
            .unwrap();
    }
}
