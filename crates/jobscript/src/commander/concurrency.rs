//! Per-key concurrency limiting
//!
//! Each compound key (`job_id`, optionally suffixed with a caller-derived
//! scope) owns a counting semaphore sized by the first limit seen for that
//! key. Acquisition is deliberately non-blocking: when the gate is full the
//! caller gets a sentinel error immediately instead of queueing, surfacing
//! backpressure rather than hiding it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::errors::{JobError, JobResult};
use crate::model::ExecutionMessage;

/// Derives a scope (tenant, shard, ...) from a message to split capacity
/// per scope under the same job.
pub type ScopeExtractor = Arc<dyn Fn(&ExecutionMessage) -> Option<String> + Send + Sync>;

/// A held slot; capacity is returned when this is dropped.
#[derive(Debug)]
pub enum ConcurrencySlot {
    /// The gate was disabled (limit <= 0); nothing to release.
    Unlimited,
    /// One unit of the key's semaphore.
    Held(OwnedSemaphorePermit),
}

/// Enforces per-key concurrency limits.
#[derive(Default)]
pub struct ConcurrencyLimiter {
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    scope_extractor: Option<ScopeExtractor>,
}

impl ConcurrencyLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive scope keys (e.g. tenant) for per-scope limits.
    pub fn with_scope_extractor(mut self, extractor: ScopeExtractor) -> Self {
        self.scope_extractor = Some(extractor);
        self
    }

    /// Reserve a slot for the message under the limit. Non-blocking: a full
    /// gate fails immediately with the concurrency sentinel.
    pub fn acquire(&self, msg: &ExecutionMessage, limit: u32) -> JobResult<ConcurrencySlot> {
        if limit == 0 {
            return Ok(ConcurrencySlot::Unlimited);
        }

        let key = self.compound_key(msg);
        let semaphore = {
            let mut semaphores = self.semaphores.lock().expect("limiter poisoned");
            semaphores
                .entry(key)
                // The first limit observed for a key fixes its capacity.
                .or_insert_with(|| Arc::new(Semaphore::new(limit as usize)))
                .clone()
        };

        match semaphore.try_acquire_owned() {
            Ok(permit) => Ok(ConcurrencySlot::Held(permit)),
            Err(_) => Err(JobError::concurrency_limit()
                .with_metadata("job_id", msg.job_id.clone())
                .with_metadata("limit", limit)),
        }
    }

    fn compound_key(&self, msg: &ExecutionMessage) -> String {
        match &self.scope_extractor {
            Some(extractor) => match extractor(msg) {
                Some(scope) if !scope.is_empty() => format!("{}|{}", msg.job_id, scope),
                _ => msg.job_id.clone(),
            },
            None => msg.job_id.clone(),
        }
    }
}
