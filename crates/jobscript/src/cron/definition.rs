//! Schedule definitions: desired state for cron-managed execution

use serde::{Deserialize, Serialize};

use crate::errors::{FieldError, JobError, JobResult};
use crate::model::ExecutionMessage;

/// A cron expression plus the message template to fire periodically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleDefinition {
    pub id: String,
    pub expression: String,
    pub message: ExecutionMessage,
}

impl ScheduleDefinition {
    pub fn new(
        id: impl Into<String>,
        expression: impl Into<String>,
        message: ExecutionMessage,
    ) -> Self {
        Self {
            id: id.into(),
            expression: expression.into(),
            message,
        }
    }

    /// Required fields: id, expression, and the target job.
    pub fn validate(&self) -> JobResult<()> {
        let mut fields = Vec::new();

        if self.id.is_empty() {
            fields.push(FieldError::new("id", "cannot be empty"));
        }
        if self.expression.is_empty() {
            fields.push(FieldError::new("expression", "cannot be empty"));
        }
        if self.message.job_id.is_empty() {
            fields.push(FieldError::new("message.job_id", "cannot be empty"));
        }

        if fields.is_empty() {
            Ok(())
        } else {
            Err(JobError::validation("schedule validation failed", fields))
        }
    }

    /// Clone with detached parameter and result state so external readers
    /// cannot mutate manager internals.
    pub fn deep_clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            expression: self.expression.clone(),
            message: self.message.deep_clone(),
        }
    }
}

/// The diff outcome of aligning current schedules with a desired set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileResult {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

impl ReconcileResult {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}
