//! Task runner: orchestrate creators and register their tasks

use std::sync::Arc;

use tracing::{info, warn};

use crate::context::ExecContext;
use crate::errors::{JobError, JobResult};

use super::{
    ErrorHandler, MemoryRegistry, Registry, Task, TaskCreator, TaskEvent, TaskEventEmitter,
    TaskEventHandler, TaskIdProvider, TaskIdProviderAware,
};

/// Collects tasks from creators in registration order and registers them.
/// A task that fails to register is reported and skipped; cancellation
/// aborts the run after emitting one failure event carrying the cause.
pub struct TaskRunner {
    creators: Vec<Arc<TaskCreator>>,
    registry: Arc<dyn Registry>,
    event_handlers: Vec<TaskEventHandler>,
    task_id_provider: Option<TaskIdProvider>,
    error_handler: ErrorHandler,
}

impl TaskRunner {
    pub fn new() -> Self {
        Self {
            creators: Vec::new(),
            registry: Arc::new(MemoryRegistry::new()),
            event_handlers: Vec::new(),
            task_id_provider: None,
            error_handler: Arc::new(|err| {
                warn!(error = %err, "task runner error");
            }),
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = registry;
        self
    }

    /// Append a creator, pushing down the runner's configured handlers and
    /// ID strategy.
    pub fn with_creator(mut self, creator: Arc<TaskCreator>) -> Self {
        for handler in &self.event_handlers {
            creator.add_task_event_handler(handler.clone());
        }
        if let Some(provider) = &self.task_id_provider {
            creator.set_task_id_provider(provider.clone());
        }
        self.creators.push(creator);
        self
    }

    /// Set the task-ID strategy, propagating to already-registered
    /// creators.
    pub fn with_task_id_provider(mut self, provider: TaskIdProvider) -> Self {
        for creator in &self.creators {
            creator.set_task_id_provider(provider.clone());
        }
        self.task_id_provider = Some(provider);
        self
    }

    /// Add a registration-event handler, propagating to already-registered
    /// creators.
    pub fn with_event_handler(mut self, handler: TaskEventHandler) -> Self {
        for creator in &self.creators {
            creator.add_task_event_handler(handler.clone());
        }
        self.event_handlers.push(handler);
        self
    }

    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Run every creator and register the produced tasks.
    pub async fn start(&self, ctx: &ExecContext) -> JobResult<()> {
        for creator in &self.creators {
            if let Err(cancel) = ctx.check() {
                return Err(self.abort(cancel));
            }

            let tasks = match creator.create_tasks(ctx).await {
                Ok(tasks) => tasks,
                Err(err) if err.is_cancelled() => return Err(self.abort(err)),
                Err(err) => {
                    // A broken provider does not abort the other creators.
                    (self.error_handler)(&err);
                    continue;
                }
            };

            for task in tasks {
                if let Err(cancel) = ctx.check() {
                    return Err(self.abort(cancel));
                }

                let task_id = task.id().to_string();
                let script_path = task.script_path().to_string();

                match self.registry.add(task) {
                    Ok(()) => {
                        info!(task_id = %task_id, script_path = %script_path, "task registered");
                        self.emit(&TaskEvent::registered(&task_id, &script_path));
                    }
                    Err(err) => {
                        (self.error_handler)(&err);
                        self.emit(&TaskEvent::registration_failed(
                            &task_id,
                            &script_path,
                            err.to_string(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Nothing to tear down for the in-process registry.
    pub fn stop(&self) {}

    pub fn registered_tasks(&self) -> Vec<Arc<Task>> {
        self.registry.list()
    }

    fn abort(&self, cause: JobError) -> JobError {
        self.emit(&TaskEvent::registration_failed(
            "",
            "",
            format!("run aborted: {cause}"),
        ));
        cause
    }

    fn emit(&self, event: &TaskEvent) {
        for handler in &self.event_handlers {
            handler(event);
        }
        // Creator-registered handlers already saw creator-side events; the
        // runner-side events go to its own handlers only.
    }
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::{Engine, ShellEngine};
    use crate::model::ScriptInfo;
    use crate::sources::SourceProvider;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StaticProvider {
        scripts: Vec<ScriptInfo>,
    }

    #[async_trait]
    impl SourceProvider for StaticProvider {
        async fn get_script(&self, _path: &str) -> JobResult<Vec<u8>> {
            unimplemented!("not used")
        }

        async fn list_scripts(&self, ctx: &ExecContext) -> JobResult<Vec<ScriptInfo>> {
            ctx.check()?;
            Ok(self.scripts.clone())
        }
    }

    fn script(id: &str, content: &str) -> ScriptInfo {
        ScriptInfo {
            id: id.to_string(),
            path: format!("jobs/{id}"),
            content: content.as_bytes().to_vec(),
        }
    }

    fn creator_for(scripts: Vec<ScriptInfo>) -> Arc<TaskCreator> {
        let engines: Vec<Arc<dyn Engine>> = vec![Arc::new(ShellEngine::new())];
        Arc::new(TaskCreator::new(
            Arc::new(StaticProvider { scripts }),
            engines,
        ))
    }

    #[tokio::test]
    async fn registers_tasks_from_all_creators() {
        let runner = TaskRunner::new()
            .with_creator(creator_for(vec![script("a.sh", "echo a")]))
            .with_creator(creator_for(vec![script("b.sh", "echo b")]));

        runner.start(&ExecContext::background()).await.unwrap();

        let tasks = runner.registered_tasks();
        assert_eq!(tasks.len(), 2);
        assert!(runner.registry().get("a.sh").is_some());
        assert!(runner.registry().get("b.sh").is_some());
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected_and_run_continues() {
        // Same file name from two creators: second registration fails.
        let runner = TaskRunner::new()
            .with_creator(creator_for(vec![script("a.sh", "echo one")]))
            .with_creator(creator_for(vec![
                script("a.sh", "echo two"),
                script("b.sh", "echo b"),
            ]));

        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        let runner = runner.with_event_handler(Arc::new(move |event| {
            if event.kind == super::super::TaskEventKind::RegistrationFailed {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        runner.start(&ExecContext::background()).await.unwrap();

        assert_eq!(runner.registered_tasks().len(), 2);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn registered_events_fire_for_each_task() {
        let registered: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = registered.clone();

        let runner = TaskRunner::new()
            .with_event_handler(Arc::new(move |event| {
                if event.kind == super::super::TaskEventKind::Registered {
                    sink.lock().unwrap().push(event.task_id.clone());
                }
            }))
            .with_creator(creator_for(vec![
                script("a.sh", "echo a"),
                script("b.sh", "echo b"),
            ]));

        runner.start(&ExecContext::background()).await.unwrap();
        assert_eq!(registered.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cancellation_aborts_with_one_failure_event() {
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();

        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();

        let runner = TaskRunner::new()
            .with_event_handler(Arc::new(move |event| {
                if event.kind == super::super::TaskEventKind::RegistrationFailed {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }))
            .with_creator(creator_for(vec![script("a.sh", "echo a")]));

        let err = runner
            .start(&ExecContext::with_token(token))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn task_id_provider_propagates_through_creators() {
        let runner = TaskRunner::new()
            .with_creator(creator_for(vec![script("a.sh", "echo a")]))
            .with_task_id_provider(Arc::new(|path: &str| format!("t:{path}")));

        runner.start(&ExecContext::background()).await.unwrap();
        assert!(runner.registry().get("t:jobs/a.sh").is_some());
    }
}
