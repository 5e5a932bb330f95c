//! Error type definitions for the jobscript runtime
//!
//! [`JobError`] is deliberately a struct rather than a deep enum hierarchy:
//! the dispatch pipeline routes on the coarse [`ErrorCategory`] and on stable
//! textual codes, while the metadata bag carries whatever context the failing
//! layer wants to surface (statement index, payload size, exit code, ...).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coarse classification used by callers to decide how to react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The caller handed us something malformed
    BadInput,
    /// A bug or broken invariant inside this process
    Internal,
    /// A collaborator (database, subprocess, remote host) failed
    External,
    /// A quota or concurrency ceiling was hit; retrying later may succeed
    RateLimit,
    /// The operation conflicts with earlier state (e.g. duplicate submission)
    Conflict,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::BadInput => "bad_input",
            ErrorCategory::Internal => "internal",
            ErrorCategory::External => "external",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Conflict => "conflict",
        };
        f.write_str(s)
    }
}

/// Stable textual codes exchanged on the wire.
///
/// These are part of the external contract: logs, API responses, and tests
/// match on them. Add codes, never repurpose them.
pub mod codes {
    pub const JOB_EXEC_MSG_NIL: &str = "JOB_EXEC_MSG_NIL";
    pub const JOB_EXEC_MSG_INVALID: &str = "JOB_EXEC_MSG_INVALID";
    pub const JOB_TASK_MISSING: &str = "JOB_TASK_MISSING";

    pub const SCRIPT_READ_ERROR: &str = "SCRIPT_READ_ERROR";
    pub const SCRIPT_PARSE_ERROR: &str = "SCRIPT_PARSE_ERROR";
    pub const SCRIPT_TOO_LARGE: &str = "SCRIPT_TOO_LARGE";

    pub const SHELL_EXECUTION_ERROR: &str = "SHELL_EXECUTION_ERROR";

    pub const SQL_CONNECTION_ERROR: &str = "SQL_CONNECTION_ERROR";
    pub const SQL_TRANSACTION_ERROR: &str = "SQL_TRANSACTION_ERROR";
    pub const SQL_EXECUTION_ERROR: &str = "SQL_EXECUTION_ERROR";

    pub const JS_LOOP_TERMINATED: &str = "JS_LOOP_TERMINATED";
    pub const JS_VM_CONFIG_ERROR: &str = "JS_VM_CONFIG_ERROR";
    pub const JS_EXECUTION_ERROR: &str = "JS_EXECUTION_ERROR";
    pub const JS_EXECUTION_TIMEOUT: &str = "JS_EXECUTION_TIMEOUT";

    pub const FETCH_REQUEST_ERROR: &str = "FETCH_REQUEST_ERROR";
    pub const FETCH_EXECUTION_ERROR: &str = "FETCH_EXECUTION_ERROR";
    pub const FETCH_MARSHAL_ERROR: &str = "FETCH_MARSHAL_ERROR";
    pub const FETCH_READ_BODY_ERROR: &str = "FETCH_READ_BODY_ERROR";

    pub const PAYLOAD_TOO_LARGE: &str = "PAYLOAD_TOO_LARGE";
    pub const RETRY_LIMIT_EXCEEDED: &str = "RETRY_LIMIT_EXCEEDED";

    pub const IDEMPOTENT_DROP: &str = "IDEMPOTENT_DROP";
    pub const CONCURRENCY_LIMIT: &str = "CONCURRENCY_LIMIT";
    pub const QUOTA_EXCEEDED: &str = "QUOTA_EXCEEDED";

    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    pub const CONTEXT_CANCELLED: &str = "CONTEXT_CANCELLED";
    pub const SCHEDULE_ERROR: &str = "SCHEDULE_ERROR";
}

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            value: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// The error type shared by every jobscript component.
#[derive(Clone)]
pub struct JobError {
    pub category: ErrorCategory,
    pub code: &'static str,
    pub message: String,
    pub metadata: HashMap<String, Value>,
    pub fields: Vec<FieldError>,
    source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl JobError {
    pub fn new(category: ErrorCategory, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            category,
            code,
            message: message.into(),
            metadata: HashMap::new(),
            fields: Vec::new(),
            source: None,
        }
    }

    pub fn bad_input(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::BadInput, code, message)
    }

    pub fn internal(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, code, message)
    }

    pub fn external(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::External, code, message)
    }

    /// Validation failure carrying per-field detail.
    pub fn validation(message: impl Into<String>, fields: Vec<FieldError>) -> Self {
        let mut err = Self::new(ErrorCategory::BadInput, codes::VALIDATION_FAILED, message);
        err.fields = fields;
        err
    }

    /// Sentinel: a duplicate submission was dropped by the idempotency policy.
    /// Callers may treat this as a successful no-op.
    pub fn idempotent_drop() -> Self {
        Self::new(
            ErrorCategory::Conflict,
            codes::IDEMPOTENT_DROP,
            "job dropped due to idempotency policy",
        )
    }

    /// Sentinel: the per-key concurrency gate is full. Callers may retry later.
    pub fn concurrency_limit() -> Self {
        Self::new(
            ErrorCategory::RateLimit,
            codes::CONCURRENCY_LIMIT,
            "concurrency limit reached",
        )
    }

    /// Sentinel: a payload or retry quota was exceeded. The code names the
    /// offending dimension (`PAYLOAD_TOO_LARGE`, `RETRY_LIMIT_EXCEEDED`).
    pub fn quota_exceeded(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::RateLimit, code, message)
    }

    /// Sentinel: a script exceeded the provider's configured size ceiling.
    pub fn script_too_large(path: &str, size: u64, limit: u64) -> Self {
        Self::new(
            ErrorCategory::BadInput,
            codes::SCRIPT_TOO_LARGE,
            format!("script {path} exceeds maximum size limit"),
        )
        .with_metadata("path", path)
        .with_metadata("size", size)
        .with_metadata("limit", limit)
    }

    /// The fatal condition every loop observes and propagates.
    pub fn cancelled() -> Self {
        Self::new(
            ErrorCategory::Internal,
            codes::CONTEXT_CANCELLED,
            "operation cancelled",
        )
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_idempotent_drop(&self) -> bool {
        self.code == codes::IDEMPOTENT_DROP
    }

    pub fn is_concurrency_limit(&self) -> bool {
        self.code == codes::CONCURRENCY_LIMIT
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(
            self.code,
            codes::QUOTA_EXCEEDED | codes::PAYLOAD_TOO_LARGE | codes::RETRY_LIMIT_EXCEEDED
        )
    }

    pub fn is_script_too_large(&self) -> bool {
        self.code == codes::SCRIPT_TOO_LARGE
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == codes::CONTEXT_CANCELLED
    }

    /// True for sentinel outcomes the retry loop must not re-attempt.
    pub fn is_sentinel(&self) -> bool {
        self.is_idempotent_drop() || self.is_concurrency_limit() || self.is_quota_exceeded()
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.category, self.code, self.message)?;
        if !self.fields.is_empty() {
            let detail: Vec<String> = self
                .fields
                .iter()
                .map(|fe| format!("{}: {}", fe.field, fe.message))
                .collect();
            write!(f, " ({})", detail.join("; "))?;
        }
        Ok(())
    }
}

impl fmt::Debug for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobError")
            .field("category", &self.category)
            .field("code", &self.code)
            .field("message", &self.message)
            .field("metadata", &self.metadata)
            .field("fields", &self.fields)
            .field("source", &self.source.as_ref().map(|e| e.to_string()))
            .finish()
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl PartialEq for JobError {
    /// Errors compare by identity on the wire: category and code. Message
    /// text and metadata are advisory.
    fn eq(&self, other: &Self) -> bool {
        self.category == other.category && self.code == other.code
    }
}
