//! Quota enforcement ahead of execution

use crate::errors::{codes, JobError, JobResult};
use crate::model::ExecutionMessage;

/// Checked by the commander before any slot is acquired.
pub trait QuotaChecker: Send + Sync {
    fn check(&self, msg: &ExecutionMessage) -> JobResult<()>;
}

/// A checker that allows everything; the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopQuotaChecker;

impl QuotaChecker for NoopQuotaChecker {
    fn check(&self, _msg: &ExecutionMessage) -> JobResult<()> {
        Ok(())
    }
}

/// Enforces payload size and retry count ceilings. A zero ceiling disables
/// that dimension.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicQuotaChecker {
    pub payload_size_limit: usize,
    pub max_retries: u32,
}

impl QuotaChecker for BasicQuotaChecker {
    fn check(&self, msg: &ExecutionMessage) -> JobResult<()> {
        if self.payload_size_limit > 0 {
            let payload = serde_json::to_vec(&msg.parameters).map_err(|e| {
                JobError::internal(codes::QUOTA_EXCEEDED, "quota marshal parameters")
                    .with_source(e)
            })?;
            if payload.len() > self.payload_size_limit {
                return Err(JobError::quota_exceeded(
                    codes::PAYLOAD_TOO_LARGE,
                    "payload exceeds size limit",
                )
                .with_metadata("size", payload.len() as i64)
                .with_metadata("limit", self.payload_size_limit as i64));
            }
        }

        if self.max_retries > 0 && msg.config.retries > self.max_retries {
            return Err(JobError::quota_exceeded(
                codes::RETRY_LIMIT_EXCEEDED,
                "retry count exceeds limit",
            )
            .with_metadata("retries", msg.config.retries)
            .with_metadata("limit", self.max_retries));
        }

        Ok(())
    }
}
