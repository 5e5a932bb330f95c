//! Test doubles for engine-dependent units

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::context::ExecContext;
use crate::errors::{codes, JobError, JobResult};
use crate::model::ExecutionMessage;
use crate::tasks::Task;

use super::{Engine, EngineCore};

/// An engine whose executions succeed or fail on demand, recording every
/// call.
pub struct StaticEngine {
    core: EngineCore,
    outcome: Mutex<Box<dyn Fn(&ExecutionMessage) -> JobResult<()> + Send>>,
    executions: AtomicUsize,
}

impl StaticEngine {
    pub fn ok() -> Arc<Self> {
        Self::with_outcome(|_| Ok(()))
    }

    pub fn failing(message: &'static str) -> Arc<Self> {
        Self::with_outcome(move |_| {
            Err(JobError::external(codes::SHELL_EXECUTION_ERROR, message))
        })
    }

    pub fn with_outcome(
        outcome: impl Fn(&ExecutionMessage) -> JobResult<()> + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: EngineCore::new("static", &[".sh", ".js", ".sql"]),
            outcome: Mutex::new(Box::new(outcome)),
            executions: AtomicUsize::new(0),
        })
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Engine for StaticEngine {
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

    async fn execute(&self, _ctx: &ExecContext, msg: &ExecutionMessage) -> JobResult<()> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        (self.outcome.lock().expect("outcome poisoned"))(msg)
    }
}
