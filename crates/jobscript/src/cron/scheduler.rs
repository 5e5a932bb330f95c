//! The scheduler contract and the default in-process implementation
//!
//! The cron manager talks to an external time-driven scheduler through the
//! [`Scheduler`] trait: register a handler with options, get back a
//! subscription to cancel later. [`TokioScheduler`] is the default
//! implementation: one tokio task per subscription evaluating the cron
//! expression and firing the handler, honoring run-once / max-runs /
//! deadline / timeout options and cooperative shutdown.

use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::{JobError, JobResult};
use crate::model::HandlerOptions;

use super::schedule::parse_expression;

/// The work fired on each tick.
pub type JobHandler = Arc<dyn Fn() -> BoxFuture<'static, JobResult<()>> + Send + Sync>;

/// A registered schedule that can be torn down.
pub trait SchedulerSubscription: Send + Sync + std::fmt::Debug {
    fn id(&self) -> Uuid;
    fn unsubscribe(&self);
}

/// An external time-driven scheduler.
pub trait Scheduler: Send + Sync {
    fn add_handler(
        &self,
        options: HandlerOptions,
        handler: JobHandler,
    ) -> JobResult<Box<dyn SchedulerSubscription>>;
}

/// Default scheduler: a tick loop per subscription on the tokio runtime.
pub struct TokioScheduler {
    root: CancellationToken,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
        }
    }

    /// Cancel every subscription spawned from this scheduler.
    pub fn shutdown(&self) {
        self.root.cancel();
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TokioScheduler {
    fn add_handler(
        &self,
        options: HandlerOptions,
        handler: JobHandler,
    ) -> JobResult<Box<dyn SchedulerSubscription>> {
        // Reject bad expressions at registration, not first fire.
        let spec = parse_expression(&options.expression)?;

        let id = Uuid::new_v4();
        let token = self.root.child_token();
        let loop_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut runs: u32 = 0;

            loop {
                let now = Utc::now();
                let Some(next) = spec.next_after(now) else {
                    debug!(subscription = %id, "schedule has no future fires");
                    break;
                };

                if let Some(deadline) = options.deadline {
                    if next > deadline {
                        info!(subscription = %id, "schedule deadline reached");
                        break;
                    }
                }

                let wait = (next - now).to_std().unwrap_or_default();
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = loop_token.cancelled() => {
                        debug!(subscription = %id, "subscription cancelled");
                        return;
                    }
                }

                // Scheduler-side retries exist in the contract but the cron
                // manager zeroes them; the commander owns retry semantics.
                let mut outcome = Ok(());
                for attempt in 0..=options.max_retries {
                    outcome = run_handler(&options, &handler).await;
                    match &outcome {
                        Ok(()) => break,
                        Err(e) if attempt < options.max_retries => {
                            warn!(
                                subscription = %id,
                                attempt = attempt + 1,
                                error = %e,
                                "handler failed, scheduler retrying"
                            );
                        }
                        Err(_) => {}
                    }
                }

                runs += 1;

                if let Err(e) = outcome {
                    error!(subscription = %id, error = %e, "scheduled handler failed");
                    if options.exit_on_error {
                        break;
                    }
                }

                if options.run_once {
                    break;
                }
                if options.max_runs > 0 && runs >= options.max_runs {
                    info!(subscription = %id, runs, "schedule reached max runs");
                    break;
                }
            }
        });

        Ok(Box::new(TokioSubscription {
            id,
            token,
            handle: Mutex::new(Some(handle)),
        }))
    }
}

async fn run_handler(options: &HandlerOptions, handler: &JobHandler) -> JobResult<()> {
    let fut = handler();
    match options.timeout.filter(|_| !options.no_timeout) {
        Some(timeout) => match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(JobError::cancelled().with_metadata("reason", "handler timeout")),
        },
        None => fut.await,
    }
}

struct TokioSubscription {
    id: Uuid,
    token: CancellationToken,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for TokioSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioSubscription")
            .field("id", &self.id)
            .finish()
    }
}

impl SchedulerSubscription for TokioSubscription {
    fn id(&self) -> Uuid {
        self.id
    }

    fn unsubscribe(&self) {
        self.token.cancel();
        if let Some(handle) = self.handle.lock().expect("subscription poisoned").take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_handler() -> (JobHandler, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handler: JobHandler = Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        (handler, count)
    }

    #[tokio::test]
    async fn invalid_expression_is_rejected_at_registration() {
        let scheduler = TokioScheduler::new();
        let (handler, _) = counting_handler();
        let err = scheduler
            .add_handler(
                HandlerOptions {
                    expression: "bogus".to_string(),
                    ..Default::default()
                },
                handler,
            )
            .unwrap_err();
        assert_eq!(err.code, crate::errors::codes::SCHEDULE_ERROR);
    }

    #[tokio::test]
    async fn interval_schedule_fires_and_respects_run_once() {
        let scheduler = TokioScheduler::new();
        let (handler, count) = counting_handler();

        let sub = scheduler
            .add_handler(
                HandlerOptions {
                    expression: "@every 50ms".to_string(),
                    run_once: true,
                    timeout: None,
                    ..Default::default()
                },
                handler,
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1, "run_once fires exactly once");
        sub.unsubscribe();
    }

    #[tokio::test]
    async fn max_runs_bounds_firing() {
        let scheduler = TokioScheduler::new();
        let (handler, count) = counting_handler();

        let sub = scheduler
            .add_handler(
                HandlerOptions {
                    expression: "@every 30ms".to_string(),
                    max_runs: 2,
                    timeout: None,
                    ..Default::default()
                },
                handler,
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        sub.unsubscribe();
    }

    #[tokio::test]
    async fn unsubscribe_stops_future_fires() {
        let scheduler = TokioScheduler::new();
        let (handler, count) = counting_handler();

        let sub = scheduler
            .add_handler(
                HandlerOptions {
                    expression: "@every 40ms".to_string(),
                    timeout: None,
                    ..Default::default()
                },
                handler,
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        sub.unsubscribe();
        let after_cancel = count.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
    }

    #[tokio::test]
    async fn exit_on_error_stops_the_loop() {
        let scheduler = TokioScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handler: JobHandler = Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(JobError::internal(
                    crate::errors::codes::SHELL_EXECUTION_ERROR,
                    "fails",
                ))
            })
        });

        let sub = scheduler
            .add_handler(
                HandlerOptions {
                    expression: "@every 30ms".to_string(),
                    exit_on_error: true,
                    timeout: None,
                    ..Default::default()
                },
                handler,
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        sub.unsubscribe();
    }

    #[tokio::test]
    async fn shutdown_cancels_all_subscriptions() {
        let scheduler = TokioScheduler::new();
        let (handler, count) = counting_handler();

        let _sub = scheduler
            .add_handler(
                HandlerOptions {
                    expression: "@every 40ms".to_string(),
                    timeout: None,
                    ..Default::default()
                },
                handler,
            )
            .unwrap();

        scheduler.shutdown();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
