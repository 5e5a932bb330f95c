//! Config merging: overlay caller overrides onto task defaults
//!
//! Scalars replace the base only when the override is non-zero, booleans are
//! only ever promoted to `true`, and maps replace wholesale when the override
//! carries one. This keeps task-level defaults authoritative unless the
//! caller explicitly says otherwise.

use super::{BackoffConfig, JobConfig};

/// Overlay `override_cfg` onto `base`, preserving base values wherever the
/// override is still at its zero value.
pub fn merge_config_defaults(base: &JobConfig, override_cfg: &JobConfig) -> JobConfig {
    let mut result = base.clone();

    if !override_cfg.schedule.is_empty() {
        result.schedule = override_cfg.schedule.clone();
    }
    if override_cfg.retries != 0 {
        result.retries = override_cfg.retries;
    }
    if override_cfg.timeout.is_some() {
        result.timeout = override_cfg.timeout;
    }
    if override_cfg.deadline.is_some() {
        result.deadline = override_cfg.deadline;
    }
    if override_cfg.no_timeout {
        result.no_timeout = true;
    }
    if override_cfg.debug {
        result.debug = true;
    }
    if override_cfg.run_once {
        result.run_once = true;
    }
    if override_cfg.max_runs != 0 {
        result.max_runs = override_cfg.max_runs;
    }
    if override_cfg.exit_on_error {
        result.exit_on_error = true;
    }
    if override_cfg.max_concurrency != 0 {
        result.max_concurrency = override_cfg.max_concurrency;
    }
    if !override_cfg.script_type.is_empty() {
        result.script_type = override_cfg.script_type.clone();
    }
    if override_cfg.transaction {
        result.transaction = true;
    }
    if !override_cfg.metadata.is_empty() {
        result.metadata = override_cfg.metadata.clone();
    }
    if !override_cfg.env.is_empty() {
        result.env = override_cfg.env.clone();
    }
    if !override_cfg.backoff.is_unset() {
        result.backoff = merge_backoff_defaults(&base.backoff, &override_cfg.backoff);
    }

    result
}

/// Field-wise overlay for the backoff sub-struct.
pub fn merge_backoff_defaults(base: &BackoffConfig, override_cfg: &BackoffConfig) -> BackoffConfig {
    let mut result = base.clone();
    if override_cfg.strategy != super::BackoffStrategy::None {
        result.strategy = override_cfg.strategy;
    }
    if override_cfg.interval.is_some() {
        result.interval = override_cfg.interval;
    }
    if override_cfg.max_interval.is_some() {
        result.max_interval = override_cfg.max_interval;
    }
    if override_cfg.jitter {
        result.jitter = true;
    }
    result
}
