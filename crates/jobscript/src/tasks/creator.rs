//! Task creator: join a source provider with engines to produce tasks

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::context::ExecContext;
use crate::engines::Engine;
use crate::errors::JobResult;
use crate::sources::SourceProvider;

use super::{
    ErrorHandler, Task, TaskEvent, TaskEventEmitter, TaskEventHandler, TaskIdProvider,
    TaskIdProviderAware,
};

/// Enumerates scripts from one provider and parses each with the first
/// engine that can handle it. Scripts with no matching engine or failing to
/// parse are reported and skipped; they never abort the batch.
pub struct TaskCreator {
    provider: Arc<dyn SourceProvider>,
    engines: Vec<Arc<dyn Engine>>,
    error_handler: Mutex<ErrorHandler>,
    event_handlers: Mutex<Vec<TaskEventHandler>>,
}

impl TaskCreator {
    pub fn new(provider: Arc<dyn SourceProvider>, engines: Vec<Arc<dyn Engine>>) -> Self {
        Self {
            provider,
            engines,
            error_handler: Mutex::new(Arc::new(|err| {
                warn!(error = %err, "task creator error");
            })),
            event_handlers: Mutex::new(Vec::new()),
        }
    }

    /// Replace the recoverable-error handler.
    pub fn with_error_handler(self, handler: ErrorHandler) -> Self {
        *self.error_handler.lock().expect("creator poisoned") = handler;
        self
    }

    pub fn engines(&self) -> &[Arc<dyn Engine>] {
        &self.engines
    }

    /// Enumerate scripts and build tasks, checking cancellation before each
    /// script.
    pub async fn create_tasks(&self, ctx: &ExecContext) -> JobResult<Vec<Task>> {
        let scripts = self.provider.list_scripts(ctx).await?;

        let mut tasks = Vec::new();
        for script in scripts {
            ctx.check()?;

            let engine = self
                .engines
                .iter()
                .find(|engine| engine.can_handle(&script.path));

            let Some(engine) = engine else {
                debug!(path = %script.path, "no engine can handle script");
                self.emit(&TaskEvent::registration_failed(
                    &script.id,
                    &script.path,
                    "no engine can handle script",
                ));
                continue;
            };

            match engine.clone().parse_job(&script.path, &script.content) {
                Ok(task) => tasks.push(task),
                Err(err) => {
                    let err = err.with_metadata("script_path", script.path.clone());
                    (self.error_handler.lock().expect("creator poisoned"))(&err);
                    self.emit(&TaskEvent::registration_failed(
                        &script.id,
                        &script.path,
                        err.to_string(),
                    ));
                }
            }
        }
        Ok(tasks)
    }

    pub(crate) fn emit(&self, event: &TaskEvent) {
        for handler in self.event_handlers.lock().expect("creator poisoned").iter() {
            handler(event);
        }
    }
}

impl TaskEventEmitter for TaskCreator {
    fn add_task_event_handler(&self, handler: TaskEventHandler) {
        self.event_handlers
            .lock()
            .expect("creator poisoned")
            .push(handler);
    }
}

impl TaskIdProviderAware for TaskCreator {
    /// Push the strategy down to every engine that advertises the
    /// capability.
    fn set_task_id_provider(&self, provider: TaskIdProvider) {
        for engine in &self.engines {
            if let Some(aware) = engine.as_task_id_aware() {
                aware.set_task_id_provider(provider.clone());
            }
        }
    }
}
