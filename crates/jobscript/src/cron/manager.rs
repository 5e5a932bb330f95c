//! Cron manager: runtime CRUD and reconciliation for schedules
//!
//! The manager owns a map of schedule ID to (resolved definition, scheduler
//! subscription). Each subscription's handler runs the target task through
//! a commander wired with the manager's idempotency tracker, concurrency
//! limiter, quota checker, and scope extractor. Updates register the new
//! subscription before unsubscribing the old one, so a schedule is never
//! entirely unsubscribed across the swap.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::commander::{
    ConcurrencyLimiter, IdempotencyTracker, NoopQuotaChecker, QuotaChecker, ScopeExtractor,
    TaskCommander,
};
use crate::context::ExecContext;
use crate::errors::{codes, JobError, JobResult};
use crate::model::{merge_config_defaults, ExecutionMessage, HandlerOptions};
use crate::tasks::Registry;

use super::definition::{ReconcileResult, ScheduleDefinition};
use super::scheduler::{JobHandler, Scheduler, SchedulerSubscription};

struct ScheduledEntry {
    definition: ScheduleDefinition,
    subscription: Box<dyn SchedulerSubscription>,
}

/// Declarative schedule lifecycle against a task registry and a scheduler.
pub struct CronManager {
    registry: Arc<dyn Registry>,
    scheduler: Arc<dyn Scheduler>,

    tracker: Arc<IdempotencyTracker>,
    limiter: Arc<ConcurrencyLimiter>,
    quotas: Arc<dyn QuotaChecker>,
    scope: Option<ScopeExtractor>,

    schedules: RwLock<HashMap<String, ScheduledEntry>>,
}

impl CronManager {
    pub fn new(registry: Arc<dyn Registry>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            registry,
            scheduler,
            tracker: Arc::new(IdempotencyTracker::new()),
            limiter: Arc::new(ConcurrencyLimiter::new()),
            quotas: Arc::new(NoopQuotaChecker),
            scope: None,
            schedules: RwLock::new(HashMap::new()),
        }
    }

    /// Override the tracker used for scheduled runs.
    pub fn with_idempotency_tracker(mut self, tracker: Arc<IdempotencyTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Override the limiter used for scheduled runs.
    pub fn with_concurrency_limiter(mut self, limiter: Arc<ConcurrencyLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Override quota enforcement for scheduled runs.
    pub fn with_quota_checker(mut self, quotas: Arc<dyn QuotaChecker>) -> Self {
        self.quotas = quotas;
        self
    }

    /// Derive concurrency scopes from scheduled messages.
    pub fn with_scope_extractor(mut self, scope: ScopeExtractor) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Register a new schedule; rejects duplicate IDs.
    pub fn register(&self, ctx: &ExecContext, def: &ScheduleDefinition) -> JobResult<()> {
        ctx.check()?;
        def.validate()?;

        {
            let schedules = self.schedules.read().expect("schedules poisoned");
            if schedules.contains_key(&def.id) {
                return Err(JobError::new(
                    crate::errors::ErrorCategory::Conflict,
                    codes::SCHEDULE_ERROR,
                    format!("schedule with ID {:?} already exists", def.id),
                ));
            }
        }

        let (resolved, handler_opts, message) = self.resolve(def)?;
        let subscription = self.subscribe(&resolved, handler_opts, message)?;

        self.schedules
            .write()
            .expect("schedules poisoned")
            .insert(
                resolved.id.clone(),
                ScheduledEntry {
                    definition: resolved,
                    subscription,
                },
            );

        info!(schedule = %def.id, "schedule registered");
        Ok(())
    }

    /// Replace an existing schedule in place. The new subscription is
    /// active before the old one is torn down.
    pub fn update(&self, ctx: &ExecContext, def: &ScheduleDefinition) -> JobResult<()> {
        ctx.check()?;
        def.validate()?;

        {
            let schedules = self.schedules.read().expect("schedules poisoned");
            if !schedules.contains_key(&def.id) {
                return Err(JobError::bad_input(
                    codes::SCHEDULE_ERROR,
                    format!("schedule {:?} not found", def.id),
                ));
            }
        }

        let (resolved, handler_opts, message) = self.resolve(def)?;
        let subscription = self.subscribe(&resolved, handler_opts, message)?;

        let previous = self
            .schedules
            .write()
            .expect("schedules poisoned")
            .insert(
                resolved.id.clone(),
                ScheduledEntry {
                    definition: resolved,
                    subscription,
                },
            );

        if let Some(previous) = previous {
            previous.subscription.unsubscribe();
        }

        info!(schedule = %def.id, "schedule updated");
        Ok(())
    }

    /// Remove a schedule and unsubscribe it from the scheduler.
    pub fn delete(&self, ctx: &ExecContext, id: &str) -> JobResult<()> {
        ctx.check()?;
        if id.is_empty() {
            return Err(JobError::bad_input(
                codes::SCHEDULE_ERROR,
                "schedule id is required",
            ));
        }

        let entry = self
            .schedules
            .write()
            .expect("schedules poisoned")
            .remove(id);

        match entry {
            Some(entry) => {
                entry.subscription.unsubscribe();
                info!(schedule = %id, "schedule deleted");
                Ok(())
            }
            None => Err(JobError::bad_input(
                codes::SCHEDULE_ERROR,
                format!("schedule {id:?} not found"),
            )),
        }
    }

    /// Deep clones of the registered definitions.
    pub fn list(&self) -> Vec<ScheduleDefinition> {
        let schedules = self.schedules.read().expect("schedules poisoned");
        let mut out: Vec<ScheduleDefinition> = schedules
            .values()
            .map(|entry| entry.definition.deep_clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Align current schedules with the desired set: add missing, update
    /// changed, remove absent. Cancellation between operations aborts and
    /// returns the partial result.
    pub fn reconcile(
        &self,
        ctx: &ExecContext,
        desired: &[ScheduleDefinition],
    ) -> (ReconcileResult, Option<JobError>) {
        let mut result = ReconcileResult::default();

        let mut targets: HashMap<&str, &ScheduleDefinition> = HashMap::new();
        for def in desired {
            targets.insert(def.id.as_str(), def);
        }

        let mut ordered: Vec<&ScheduleDefinition> = desired.iter().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));

        for def in ordered {
            if let Err(cancel) = ctx.check() {
                return (result, Some(cancel));
            }

            let exists = {
                let schedules = self.schedules.read().expect("schedules poisoned");
                schedules.contains_key(&def.id)
            };

            if !exists {
                if let Err(e) = self.register(ctx, def) {
                    return (result, Some(e));
                }
                result.added.push(def.id.clone());
                continue;
            }

            let resolved = match self.resolve(def) {
                Ok((resolved, _, _)) => resolved,
                Err(e) => return (result, Some(e)),
            };

            let changed = {
                let schedules = self.schedules.read().expect("schedules poisoned");
                schedules
                    .get(&def.id)
                    .is_some_and(|entry| entry.definition != resolved)
            };

            if changed {
                if let Err(e) = self.update(ctx, def) {
                    return (result, Some(e));
                }
                result.updated.push(def.id.clone());
            } else {
                debug!(schedule = %def.id, "schedule unchanged");
            }
        }

        let current_ids: Vec<String> = {
            let schedules = self.schedules.read().expect("schedules poisoned");
            let mut ids: Vec<String> = schedules.keys().cloned().collect();
            ids.sort();
            ids
        };

        for id in current_ids {
            if let Err(cancel) = ctx.check() {
                return (result, Some(cancel));
            }
            if !targets.contains_key(id.as_str()) {
                if let Err(e) = self.delete(ctx, &id) {
                    return (result, Some(e));
                }
                result.removed.push(id);
            }
        }

        (result, None)
    }

    /// Resolve a definition against the registry: merge message config with
    /// task defaults, overlay the cron expression, and derive the handler
    /// options (with scheduler-side retries zeroed).
    fn resolve(
        &self,
        def: &ScheduleDefinition,
    ) -> JobResult<(ScheduleDefinition, HandlerOptions, ExecutionMessage)> {
        let task = self.registry.get(&def.message.job_id).ok_or_else(|| {
            JobError::bad_input(
                codes::JOB_TASK_MISSING,
                format!(
                    "task {:?} not found for schedule {:?}",
                    def.message.job_id, def.id
                ),
            )
        })?;

        let mut merged = merge_config_defaults(task.config(), &def.message.config);
        if !def.expression.is_empty() {
            merged.schedule = def.expression.clone();
        }

        let mut template = def.message.deep_clone();
        template.config = merged.clone();

        let message = task.complete_execution_message(&template);
        message.validate()?;

        let handler_opts = task.handler_options().clone().apply_config(&merged);

        let resolved = ScheduleDefinition {
            id: def.id.clone(),
            expression: handler_opts.expression.clone(),
            message: message.deep_clone(),
        };

        Ok((resolved, handler_opts, message))
    }

    /// Build the per-tick handler: a commander around the target task,
    /// executing a fresh clone of the message so per-tick mutations cannot
    /// leak.
    fn subscribe(
        &self,
        resolved: &ScheduleDefinition,
        handler_opts: HandlerOptions,
        message: ExecutionMessage,
    ) -> JobResult<Box<dyn SchedulerSubscription>> {
        let task = self.registry.get(&resolved.message.job_id).ok_or_else(|| {
            JobError::bad_input(
                codes::JOB_TASK_MISSING,
                format!("task {:?} not found", resolved.message.job_id),
            )
        })?;

        let mut commander = TaskCommander::new(task)
            .with_idempotency_tracker(self.tracker.clone())
            .with_concurrency_limiter(self.limiter.clone())
            .with_quota_checker(self.quotas.clone());
        if let Some(scope) = &self.scope {
            commander = commander.with_scope_extractor(scope.clone());
        }
        let commander = Arc::new(commander);

        let handler: JobHandler = Arc::new(move || {
            let commander = commander.clone();
            let message = message.deep_clone();
            Box::pin(async move {
                commander
                    .execute(&ExecContext::background(), &message)
                    .await
            })
        });

        self.scheduler
            .add_handler(handler_opts, handler)
            .map_err(|e| {
                JobError::internal(
                    codes::SCHEDULE_ERROR,
                    format!("failed to register schedule {:?}", resolved.id),
                )
                .with_source(e)
            })
    }
}
