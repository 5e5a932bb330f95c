//! The unit of work dispatched through the commander pipeline

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{codes, FieldError, JobError, JobResult};

use super::{DedupPolicy, ExecutionResult, JobConfig};

/// Reserved parameter key carrying cached script content. Engines look here
/// before re-reading from the source provider.
pub const SCRIPT_PARAMETER: &str = "script";

/// Callback receiving captured (stdout, stderr) from engines that produce
/// process output.
pub type OutputCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// A request to execute a job script.
///
/// Callers typically populate only the fields they want to override; the
/// commander merges the rest from the task's defaults before validation.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionMessage {
    pub job_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub script_path: String,
    #[serde(skip_serializing_if = "config_is_empty")]
    pub config: JobConfig,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub idempotency_key: String,
    pub dedup_policy: DedupPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(skip)]
    pub output_callback: Option<OutputCallback>,
}

fn config_is_empty(config: &JobConfig) -> bool {
    *config == JobConfig::default()
}

impl ExecutionMessage {
    /// Longest accepted idempotency key, in bytes.
    pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 256;

    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            ..Self::default()
        }
    }

    /// Cached script content, when present under the reserved parameter.
    pub fn cached_script(&self) -> Option<&str> {
        self.parameters.get(SCRIPT_PARAMETER).and_then(Value::as_str)
    }

    /// Ensure the message satisfies the pipeline's entry requirements: job id
    /// and script path present, idempotency key within bounds, embedded
    /// result (if any) well-formed.
    pub fn validate(&self) -> JobResult<()> {
        let mut fields = Vec::new();

        if self.job_id.is_empty() {
            fields.push(FieldError::new("job_id", "cannot be empty"));
        }
        if self.script_path.is_empty() {
            fields.push(FieldError::new("script_path", "cannot be empty"));
        }
        if self.idempotency_key.len() > Self::MAX_IDEMPOTENCY_KEY_LEN {
            fields.push(
                FieldError::new(
                    "idempotency_key",
                    format!(
                        "must be at most {} bytes",
                        Self::MAX_IDEMPOTENCY_KEY_LEN
                    ),
                )
                .with_value(self.idempotency_key.len() as i64),
            );
        }
        if let Some(result) = &self.result {
            if result.size < 0 {
                fields.push(FieldError::new("result.size", "must be non-negative"));
            }
            if result.duration < 0 {
                fields.push(FieldError::new("result.duration", "must be non-negative"));
            }
        }

        if fields.is_empty() {
            Ok(())
        } else {
            let mut err = JobError::validation("invalid execution message", fields);
            err.code = codes::JOB_EXEC_MSG_INVALID;
            Err(err)
        }
    }

    /// Deep-clone the message so per-dispatch mutations cannot leak back
    /// into schedule or task state. The output callback handle is shared.
    pub fn deep_clone(&self) -> Self {
        Self {
            job_id: self.job_id.clone(),
            script_path: self.script_path.clone(),
            config: self.config.clone(),
            parameters: self.parameters.clone(),
            idempotency_key: self.idempotency_key.clone(),
            dedup_policy: self.dedup_policy,
            result: self.result.clone(),
            output_callback: self.output_callback.clone(),
        }
    }
}

impl fmt::Debug for ExecutionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionMessage")
            .field("job_id", &self.job_id)
            .field("script_path", &self.script_path)
            .field("config", &self.config)
            .field("parameters", &self.parameters.keys())
            .field("idempotency_key", &self.idempotency_key)
            .field("dedup_policy", &self.dedup_policy)
            .field("result", &self.result)
            .field(
                "output_callback",
                &self.output_callback.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

/// Structural comparison ignores the output callback: two messages are the
/// same work item when their data agrees.
impl PartialEq for ExecutionMessage {
    fn eq(&self, other: &Self) -> bool {
        self.job_id == other.job_id
            && self.script_path == other.script_path
            && self.config == other.config
            && self.parameters == other.parameters
            && self.idempotency_key == other.idempotency_key
            && self.dedup_policy == other.dedup_policy
            && self.result == other.result
    }
}
