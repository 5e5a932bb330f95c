//! Task registration events and capability contracts

use std::sync::Arc;

/// Strategy deriving a task identifier from a script path.
pub type TaskIdProvider = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// The default strategy: the file name is the task ID.
pub fn default_task_id_provider() -> TaskIdProvider {
    Arc::new(|script_path: &str| {
        script_path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(script_path)
            .to_string()
    })
}

/// What happened during task registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEventKind {
    Registered,
    RegistrationFailed,
}

impl TaskEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskEventKind::Registered => "registered",
            TaskEventKind::RegistrationFailed => "registration_failed",
        }
    }
}

/// Contextual information about a task registration outcome.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub kind: TaskEventKind,
    pub task_id: String,
    pub script_path: String,
    pub error: Option<String>,
}

impl TaskEvent {
    pub fn registered(task_id: impl Into<String>, script_path: impl Into<String>) -> Self {
        Self {
            kind: TaskEventKind::Registered,
            task_id: task_id.into(),
            script_path: script_path.into(),
            error: None,
        }
    }

    pub fn registration_failed(
        task_id: impl Into<String>,
        script_path: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            kind: TaskEventKind::RegistrationFailed,
            task_id: task_id.into(),
            script_path: script_path.into(),
            error: Some(error.into()),
        }
    }
}

/// Consumes registration events emitted by creators and the runner.
pub type TaskEventHandler = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

/// Handler invoked with recoverable errors (a script that failed to parse or
/// register) instead of aborting the surrounding loop.
pub type ErrorHandler = Arc<dyn Fn(&crate::errors::JobError) + Send + Sync>;

/// Components that can accept a task-ID derivation strategy.
pub trait TaskIdProviderAware {
    fn set_task_id_provider(&self, provider: TaskIdProvider);
}

/// Components that publish registration events upstream.
pub trait TaskEventEmitter {
    fn add_task_event_handler(&self, handler: TaskEventHandler);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_provider_uses_basename() {
        let provider = default_task_id_provider();
        assert_eq!(provider("jobs/nested/report.sh"), "report.sh");
        assert_eq!(provider("report.sh"), "report.sh");
        assert_eq!(provider(""), "");
    }

    #[test]
    fn event_kinds_render_wire_names() {
        assert_eq!(TaskEventKind::Registered.as_str(), "registered");
        assert_eq!(
            TaskEventKind::RegistrationFailed.as_str(),
            "registration_failed"
        );
    }
}
