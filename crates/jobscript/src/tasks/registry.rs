//! In-memory task registry

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::errors::{codes, JobError, JobResult};
use crate::model::ExecutionResult;

use super::Task;

/// A mapping from task ID to task, plus a parallel results map. Insertion
/// rejects duplicate IDs.
pub trait Registry: Send + Sync {
    fn add(&self, task: Task) -> JobResult<()>;
    fn get(&self, id: &str) -> Option<Arc<Task>>;
    fn list(&self) -> Vec<Arc<Task>>;
    fn set_result(&self, id: &str, result: ExecutionResult) -> JobResult<()>;
    fn get_result(&self, id: &str) -> Option<ExecutionResult>;
}

/// The default registry: process-local maps behind one mutex.
#[derive(Default)]
pub struct MemoryRegistry {
    inner: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    tasks: HashMap<String, Arc<Task>>,
    results: HashMap<String, ExecutionResult>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Registry for MemoryRegistry {
    fn add(&self, task: Task) -> JobResult<()> {
        let mut state = self.inner.lock().expect("registry poisoned");

        let id = task.id().to_string();
        if state.tasks.contains_key(&id) {
            return Err(JobError::new(
                crate::errors::ErrorCategory::Conflict,
                codes::VALIDATION_FAILED,
                format!("job with ID {id} already exists"),
            )
            .with_metadata("task_id", id));
        }

        state.tasks.insert(id, Arc::new(task));
        Ok(())
    }

    fn get(&self, id: &str) -> Option<Arc<Task>> {
        self.inner
            .lock()
            .expect("registry poisoned")
            .tasks
            .get(id)
            .cloned()
    }

    fn list(&self) -> Vec<Arc<Task>> {
        self.inner
            .lock()
            .expect("registry poisoned")
            .tasks
            .values()
            .cloned()
            .collect()
    }

    fn set_result(&self, id: &str, result: ExecutionResult) -> JobResult<()> {
        if id.is_empty() {
            return Err(JobError::bad_input(
                codes::VALIDATION_FAILED,
                "job id required",
            ));
        }
        self.inner
            .lock()
            .expect("registry poisoned")
            .results
            .insert(id.to_string(), result);
        Ok(())
    }

    fn get_result(&self, id: &str) -> Option<ExecutionResult> {
        self.inner
            .lock()
            .expect("registry poisoned")
            .results
            .get(id)
            .cloned()
    }
}
