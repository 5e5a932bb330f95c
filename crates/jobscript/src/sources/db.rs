//! Database source provider
//!
//! Reads scripts from a table with (path, content) columns through a
//! runtime-selected sqlx driver. The table name is validated against a
//! strict identifier pattern before any query is built, and row iteration
//! honors cancellation.

use std::sync::LazyLock;

use async_trait::async_trait;
use futures::TryStreamExt;
use regex::Regex;
use sqlx::{AnyPool, Row};

use crate::context::ExecContext;
use crate::errors::{codes, JobError, JobResult};
use crate::model::ScriptInfo;

use super::SourceProvider;

static TABLE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+(\.[A-Za-z0-9_]+)*$").expect("table name regex"));

/// Which bind-parameter syntax the backing driver expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaceholderStyle {
    /// `$1`, `$2`, ... (PostgreSQL style)
    #[default]
    Dollar,
    /// `?` (SQLite / MySQL style)
    Question,
}

impl PlaceholderStyle {
    fn render(&self, index: usize) -> String {
        match self {
            PlaceholderStyle::Dollar => format!("${index}"),
            PlaceholderStyle::Question => "?".to_string(),
        }
    }
}

/// Fetches scripts from a database table.
pub struct DbSourceProvider {
    pool: AnyPool,
    table: String,
    placeholder: PlaceholderStyle,
}

impl DbSourceProvider {
    pub fn new(pool: AnyPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
            placeholder: PlaceholderStyle::default(),
        }
    }

    pub fn with_placeholder(mut self, style: PlaceholderStyle) -> Self {
        self.placeholder = style;
        self
    }

    /// Validate the configured table name before interpolating it into SQL.
    /// Bind parameters cannot carry identifiers, so this is the injection
    /// guard.
    fn safe_table(&self) -> JobResult<&str> {
        if self.table.is_empty() {
            return Err(JobError::bad_input(
                codes::VALIDATION_FAILED,
                "table name must be provided",
            ));
        }
        if !TABLE_NAME.is_match(&self.table) {
            return Err(JobError::bad_input(
                codes::VALIDATION_FAILED,
                format!("invalid table name {:?}", self.table),
            ));
        }
        Ok(&self.table)
    }
}

#[async_trait]
impl SourceProvider for DbSourceProvider {
    async fn get_script(&self, path: &str) -> JobResult<Vec<u8>> {
        let table = self.safe_table()?;
        let query = format!(
            "SELECT content FROM {table} WHERE path = {} LIMIT 1",
            self.placeholder.render(1)
        );

        let row = sqlx::query(&query)
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                JobError::external(
                    codes::SCRIPT_READ_ERROR,
                    format!("failed to get script {path}"),
                )
                .with_source(e)
            })?;

        match row {
            Some(row) => content_bytes(&row, 0),
            None => Err(JobError::bad_input(
                codes::SCRIPT_READ_ERROR,
                format!("script not found at path {path}"),
            )),
        }
    }

    async fn list_scripts(&self, ctx: &ExecContext) -> JobResult<Vec<ScriptInfo>> {
        let table = self.safe_table()?;
        let query = format!("SELECT path, content FROM {table}");

        let mut scripts = Vec::new();
        let mut rows = sqlx::query(&query).fetch(&self.pool);

        while let Some(row) = rows.try_next().await.map_err(|e| {
            JobError::external(codes::SCRIPT_READ_ERROR, "failed to query scripts").with_source(e)
        })? {
            ctx.check()?;

            let path: String = row.try_get(0).map_err(|e| {
                JobError::external(codes::SCRIPT_READ_ERROR, "failed to scan row").with_source(e)
            })?;
            let content = content_bytes(&row, 1)?;

            scripts.push(ScriptInfo {
                id: basename(&path),
                path,
                content,
            });
        }

        Ok(scripts)
    }
}

/// Script content columns may be BLOB or TEXT depending on the schema.
fn content_bytes(row: &sqlx::any::AnyRow, index: usize) -> JobResult<Vec<u8>> {
    if let Ok(bytes) = row.try_get::<Vec<u8>, _>(index) {
        return Ok(bytes);
    }
    row.try_get::<String, _>(index)
        .map(String::into_bytes)
        .map_err(|e| {
            JobError::external(codes::SCRIPT_READ_ERROR, "failed to scan content column")
                .with_source(e)
        })
}

fn basename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}
