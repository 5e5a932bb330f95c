//! The task commander: the execution pipeline around a task
//!
//! For each inbound message the commander runs, in order: completion (merge
//! with task defaults), validation, idempotency pre-check, quota check,
//! concurrency acquisition, the retry loop around the engine, and the
//! idempotency post-hook. Sentinel outcomes (idempotent drop, concurrency
//! limit, quota breach) are distinguished errors the caller can branch on.

mod concurrency;
mod idempotency;
mod quota;
mod retry;

pub use concurrency::{ConcurrencyLimiter, ConcurrencySlot, ScopeExtractor};
pub use idempotency::{DedupDecision, IdempotencyTracker};
pub use quota::{BasicQuotaChecker, NoopQuotaChecker, QuotaChecker};
pub use retry::{
    compute_backoff_delay, DEFAULT_BACKOFF_INTERVAL, DEFAULT_BACKOFF_MAX_INTERVAL,
};

use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::ExecContext;
use crate::errors::{JobError, JobResult};
use crate::model::ExecutionMessage;
use crate::tasks::Task;

/// Wraps a task with validation, dedup, quota, concurrency, and retry.
pub struct TaskCommander {
    task: Arc<Task>,
    tracker: Arc<IdempotencyTracker>,
    limiter: Arc<ConcurrencyLimiter>,
    quotas: Arc<dyn QuotaChecker>,
    scope: Option<ScopeExtractor>,
}

impl TaskCommander {
    pub fn new(task: Arc<Task>) -> Self {
        Self {
            task,
            tracker: Arc::new(IdempotencyTracker::new()),
            limiter: Arc::new(ConcurrencyLimiter::new()),
            quotas: Arc::new(NoopQuotaChecker),
            scope: None,
        }
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Override the tracker used for deduplication checks.
    pub fn with_idempotency_tracker(mut self, tracker: Arc<IdempotencyTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Override the limiter used for concurrency control.
    pub fn with_concurrency_limiter(mut self, limiter: Arc<ConcurrencyLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Override quota enforcement.
    pub fn with_quota_checker(mut self, quotas: Arc<dyn QuotaChecker>) -> Self {
        self.quotas = quotas;
        self
    }

    /// Derive concurrency scope keys (e.g. tenant) from messages.
    pub fn with_scope_extractor(mut self, scope: ScopeExtractor) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Run the pipeline for one message.
    pub async fn execute(&self, ctx: &ExecContext, msg: &ExecutionMessage) -> JobResult<()> {
        // 1. Completion: overlay the caller's message onto task defaults and
        //    attach cached script content.
        let final_msg = self.task.complete_execution_message(msg);

        // 2. Validation.
        final_msg.validate()?;

        // 3. Idempotency pre-check.
        match self
            .tracker
            .before_execute(&final_msg.idempotency_key, final_msg.dedup_policy)
        {
            DedupDecision::Proceed => {}
            DedupDecision::Drop(prior) => {
                debug!(
                    job_id = %final_msg.job_id,
                    prior_error = prior.as_ref().map(|e| e.code),
                    "duplicate submission dropped"
                );
                return Err(JobError::idempotent_drop()
                    .with_metadata("job_id", final_msg.job_id.clone())
                    .with_metadata("idempotency_key", final_msg.idempotency_key.clone()));
            }
            DedupDecision::Merge(prior) => {
                debug!(job_id = %final_msg.job_id, "duplicate submission merged");
                return match prior {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            }
        }

        // 4. Quota. Failing here leaves the dedup entry with no recorded
        //    outcome; the post-hook only wraps the retry loop.
        self.quotas.check(&final_msg)?;

        // 5. Concurrency. The slot releases on every exit path below.
        let slot = self.acquire_concurrency(&final_msg)?;

        // 6. Retry loop.
        let result = self.run_with_retries(ctx, &final_msg).await;

        drop(slot);

        // 7. Idempotency post-hook: always record the final outcome.
        self.after_execute(&final_msg, result.as_ref().err());

        result
    }

    async fn run_with_retries(
        &self,
        ctx: &ExecContext,
        msg: &ExecutionMessage,
    ) -> JobResult<()> {
        let max_retries = msg.config.retries;
        let backoff = msg.config.backoff.clone();

        let mut attempt: u32 = 0;
        loop {
            match self.task.execute(ctx, msg).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if attempt >= max_retries {
                        return Err(err);
                    }
                    warn!(
                        job_id = %msg.job_id,
                        attempt = attempt + 1,
                        max_retries,
                        error = %err,
                        "execution failed, retrying"
                    );

                    let delay = compute_backoff_delay(attempt + 1, &backoff);
                    // A cancellation during the sleep aborts further
                    // attempts with the context error.
                    ctx.sleep(delay).await?;
                    attempt += 1;
                }
            }
        }
    }

    /// The commander-level scope extractor pre-bakes the compound key into
    /// the message handed to the shared limiter.
    fn acquire_concurrency(&self, msg: &ExecutionMessage) -> JobResult<ConcurrencySlot> {
        let limit = msg.config.max_concurrency;
        if limit == 0 {
            return Ok(ConcurrencySlot::Unlimited);
        }

        if let Some(extractor) = &self.scope {
            if let Some(scope) = extractor(msg).filter(|s| !s.is_empty()) {
                let mut scoped = msg.deep_clone();
                scoped.job_id = format!("{}|{}", msg.job_id, scope);
                return self.limiter.acquire(&scoped, limit);
            }
        }
        self.limiter.acquire(msg, limit)
    }

    fn after_execute(&self, msg: &ExecutionMessage, err: Option<&JobError>) {
        self.tracker
            .after_execute(&msg.idempotency_key, msg.dedup_policy, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::testing::StaticEngine;
    use crate::errors::codes;
    use crate::model::{
        BackoffConfig, BackoffStrategy, DedupPolicy, HandlerOptions, JobConfig,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn task_with_engine(engine: Arc<StaticEngine>, config: JobConfig) -> Arc<Task> {
        Arc::new(Task::new(
            "report.sh",
            "jobs/report.sh",
            "shell",
            HandlerOptions::from_config(&config),
            config,
            "echo hi",
            engine,
        ))
    }

    fn commander(engine: Arc<StaticEngine>, config: JobConfig) -> TaskCommander {
        TaskCommander::new(task_with_engine(engine, config))
    }

    #[tokio::test]
    async fn successful_execution_returns_ok() {
        let engine = StaticEngine::ok();
        let commander = commander(engine.clone(), JobConfig::with_defaults());

        let msg = ExecutionMessage::new("report.sh");
        commander
            .execute(&ExecContext::background(), &msg)
            .await
            .unwrap();
        assert_eq!(engine.executions(), 1);
    }

    #[tokio::test]
    async fn message_defaults_are_completed_from_task() {
        let observed = Arc::new(std::sync::Mutex::new(None::<ExecutionMessage>));
        let sink = observed.clone();
        let engine = StaticEngine::with_outcome(move |msg| {
            *sink.lock().unwrap() = Some(msg.deep_clone());
            Ok(())
        });
        let config = JobConfig {
            schedule: "*/9 * * * *".to_string(),
            ..JobConfig::with_defaults()
        };
        let commander = commander(engine, config);

        // Empty message: everything comes from the task.
        let msg = ExecutionMessage::default();
        commander
            .execute(&ExecContext::background(), &msg)
            .await
            .unwrap();

        let seen = observed.lock().unwrap().clone().unwrap();
        assert_eq!(seen.job_id, "report.sh");
        assert_eq!(seen.script_path, "jobs/report.sh");
        assert_eq!(seen.config.schedule, "*/9 * * * *");
        assert_eq!(seen.cached_script(), Some("echo hi"));
    }

    #[tokio::test]
    async fn invalid_completed_message_is_rejected() {
        // A task constructed with an empty id cannot produce a valid
        // message even after completion.
        let engine = StaticEngine::ok();
        let task = Arc::new(Task::new(
            "",
            "",
            "shell",
            HandlerOptions::default(),
            JobConfig::default(),
            "",
            engine.clone(),
        ));
        let commander = TaskCommander::new(task);

        let err = commander
            .execute(&ExecContext::background(), &ExecutionMessage::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::JOB_EXEC_MSG_INVALID);
        assert_eq!(engine.executions(), 0);
    }

    #[tokio::test]
    async fn retries_up_to_configured_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let engine = StaticEngine::with_outcome(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(JobError::external(codes::SHELL_EXECUTION_ERROR, "always fails"))
        });

        let config = JobConfig {
            retries: 2,
            backoff: BackoffConfig {
                strategy: BackoffStrategy::Fixed,
                interval: Some(Duration::from_millis(1)),
                ..Default::default()
            },
            ..JobConfig::with_defaults()
        };
        let commander = commander(engine, config);

        let err = commander
            .execute(&ExecContext::background(), &ExecutionMessage::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::SHELL_EXECUTION_ERROR);
        // Retries+1 attempts total.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn success_after_failure_stops_retrying() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let engine = StaticEngine::with_outcome(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(JobError::external(codes::SHELL_EXECUTION_ERROR, "first fails"))
            } else {
                Ok(())
            }
        });

        let config = JobConfig {
            retries: 5,
            backoff: BackoffConfig {
                strategy: BackoffStrategy::Fixed,
                interval: Some(Duration::from_millis(1)),
                ..Default::default()
            },
            ..JobConfig::with_defaults()
        };
        let commander = commander(engine, config);

        commander
            .execute(&ExecContext::background(), &ExecutionMessage::default())
            .await
            .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_during_backoff_aborts() {
        let engine = StaticEngine::failing("always fails");
        let config = JobConfig {
            retries: 5,
            backoff: BackoffConfig {
                strategy: BackoffStrategy::Fixed,
                interval: Some(Duration::from_secs(60)),
                ..Default::default()
            },
            ..JobConfig::with_defaults()
        };
        let commander = Arc::new(commander(engine.clone(), config));

        let token = tokio_util::sync::CancellationToken::new();
        let ctx = ExecContext::with_token(token.clone());
        let run = tokio::spawn({
            let commander = commander.clone();
            async move {
                commander
                    .execute(&ctx, &ExecutionMessage::default())
                    .await
            }
        });

        // Give the first attempt time to fail and enter the sleep.
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let err = run.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(engine.executions(), 1);
    }

    #[tokio::test]
    async fn drop_policy_executes_once_and_drops_duplicates() {
        let engine = StaticEngine::ok();
        let commander = commander(engine.clone(), JobConfig::with_defaults());

        let mut msg = ExecutionMessage::default();
        msg.idempotency_key = "k".to_string();
        msg.dedup_policy = DedupPolicy::Drop;

        commander
            .execute(&ExecContext::background(), &msg)
            .await
            .unwrap();

        let err = commander
            .execute(&ExecContext::background(), &msg)
            .await
            .unwrap_err();
        assert!(err.is_idempotent_drop());
        assert_eq!(engine.executions(), 1);
    }

    #[tokio::test]
    async fn merge_policy_returns_prior_outcome_without_reexecuting() {
        let engine = StaticEngine::failing("first run failed");
        let commander = commander(engine.clone(), JobConfig::with_defaults());

        let mut msg = ExecutionMessage::default();
        msg.idempotency_key = "k".to_string();
        msg.dedup_policy = DedupPolicy::Merge;

        let first = commander
            .execute(&ExecContext::background(), &msg)
            .await
            .unwrap_err();
        assert_eq!(first.code, codes::SHELL_EXECUTION_ERROR);

        let second = commander
            .execute(&ExecContext::background(), &msg)
            .await
            .unwrap_err();
        assert_eq!(second.code, codes::SHELL_EXECUTION_ERROR);
        assert_eq!(engine.executions(), 1);
    }

    #[tokio::test]
    async fn replace_policy_allows_repeated_execution() {
        let engine = StaticEngine::ok();
        let commander = commander(engine.clone(), JobConfig::with_defaults());

        let mut msg = ExecutionMessage::default();
        msg.idempotency_key = "k".to_string();
        msg.dedup_policy = DedupPolicy::Replace;

        for _ in 0..3 {
            commander
                .execute(&ExecContext::background(), &msg)
                .await
                .unwrap();
        }
        assert_eq!(engine.executions(), 3);
    }

    #[tokio::test]
    async fn quota_breach_short_circuits_before_execution() {
        let engine = StaticEngine::ok();
        let commander = commander(engine.clone(), JobConfig::with_defaults())
            .with_quota_checker(Arc::new(BasicQuotaChecker {
                payload_size_limit: 8,
                max_retries: 0,
            }));

        let mut msg = ExecutionMessage::default();
        msg.parameters
            .insert("big".to_string(), serde_json::Value::from("x".repeat(64)));

        let err = commander
            .execute(&ExecContext::background(), &msg)
            .await
            .unwrap_err();
        assert!(err.is_quota_exceeded());
        assert_eq!(engine.executions(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_limit_surfaces_sentinel() {
        // An engine that blocks until told to finish.
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let engine = StaticEngine::with_outcome(move |_| {
            let mut rx = release_rx.clone();
            // Block the executing thread's future until released.
            futures::executor::block_on(async {
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            });
            Ok(())
        });

        let config = JobConfig {
            max_concurrency: 1,
            ..JobConfig::with_defaults()
        };
        let limiter = Arc::new(ConcurrencyLimiter::new());
        let commander = Arc::new(
            commander(engine.clone(), config).with_concurrency_limiter(limiter),
        );

        let first = tokio::task::spawn({
            let commander = commander.clone();
            async move {
                commander
                    .execute(&ExecContext::background(), &ExecutionMessage::default())
                    .await
            }
        });

        // Wait until the first execution holds the slot.
        while engine.executions() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = commander
            .execute(&ExecContext::background(), &ExecutionMessage::default())
            .await
            .unwrap_err();
        assert!(err.is_concurrency_limit());

        release_tx.send(true).unwrap();
        first.await.unwrap().unwrap();

        // Slot released: a new execution may proceed.
        commander
            .execute(&ExecContext::background(), &ExecutionMessage::default())
            .await
            .unwrap();
    }
}
