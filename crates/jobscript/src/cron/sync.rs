//! Schedule sync: periodic reconciliation from an external source
//!
//! Desired schedule definitions come from a pluggable loader (typically a
//! JSON or YAML file maintained by an operator); on each pass the loader's
//! output is reconciled into the cron manager. The service runs on its own
//! cron cadence until cancelled.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use tracing::{error, info, warn};

use crate::context::ExecContext;
use crate::errors::{codes, JobError, JobResult};

use super::definition::{ReconcileResult, ScheduleDefinition};
use super::manager::CronManager;
use super::schedule::next_run;

/// Fetches the desired schedule set.
pub type ScheduleLoader =
    Arc<dyn Fn() -> BoxFuture<'static, JobResult<Vec<ScheduleDefinition>>> + Send + Sync>;

/// Default reconciliation cadence.
pub const DEFAULT_SYNC_EXPRESSION: &str = "*/5 * * * *";

/// Reconciles schedules from an external source into the cron manager.
pub struct ScheduleSync {
    manager: Arc<CronManager>,
    loader: ScheduleLoader,
    expression: String,
}

impl ScheduleSync {
    pub fn new(manager: Arc<CronManager>, loader: ScheduleLoader) -> Self {
        Self {
            manager,
            loader,
            expression: DEFAULT_SYNC_EXPRESSION.to_string(),
        }
    }

    /// Build a sync whose loader reads a JSON or YAML file on each pass.
    pub fn from_file(manager: Arc<CronManager>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let loader: ScheduleLoader = Arc::new(move || {
            let path = path.clone();
            Box::pin(async move { load_schedules_from_file(&path).await })
        });
        Self::new(manager, loader)
    }

    /// Override the reconciliation cadence.
    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        let expression = expression.into();
        if !expression.is_empty() {
            self.expression = expression;
        }
        self
    }

    /// One reconciliation pass.
    pub async fn sync(&self, ctx: &ExecContext) -> (ReconcileResult, Option<JobError>) {
        let defs = match (self.loader)().await {
            Ok(defs) => defs,
            Err(e) => return (ReconcileResult::default(), Some(e)),
        };
        self.manager.reconcile(ctx, &defs)
    }

    /// Run reconciliation on the configured cadence until cancelled.
    pub async fn run(&self, ctx: &ExecContext) -> JobResult<()> {
        info!(expression = %self.expression, "schedule sync starting");

        loop {
            let now = Utc::now();
            let next = match next_run(&self.expression, now)? {
                Some(next) => next,
                None => {
                    warn!("sync schedule has no future fires, stopping");
                    return Ok(());
                }
            };

            let wait = (next - now).to_std().unwrap_or_default();
            ctx.sleep(wait).await?;

            let (result, err) = self.sync(ctx).await;
            if !result.is_noop() {
                info!(
                    added = result.added.len(),
                    updated = result.updated.len(),
                    removed = result.removed.len(),
                    "schedules reconciled"
                );
            }
            if let Some(e) = err {
                if e.is_cancelled() {
                    return Err(e);
                }
                error!(error = %e, "schedule sync failed");
            }
        }
    }
}

/// Parse a schedules file as JSON first, then YAML.
pub async fn load_schedules_from_file(path: &Path) -> JobResult<Vec<ScheduleDefinition>> {
    let content = tokio::fs::read(path).await.map_err(|e| {
        JobError::external(
            codes::SCHEDULE_ERROR,
            format!("read schedules file {}", path.display()),
        )
        .with_source(e)
    })?;

    if let Ok(defs) = serde_json::from_slice::<Vec<ScheduleDefinition>>(&content) {
        return Ok(defs);
    }
    if let Ok(defs) = serde_yaml::from_slice::<Vec<ScheduleDefinition>>(&content) {
        return Ok(defs);
    }

    Err(JobError::bad_input(
        codes::SCHEDULE_ERROR,
        format!(
            "failed to parse schedules file {} as JSON or YAML",
            path.display()
        ),
    ))
}
