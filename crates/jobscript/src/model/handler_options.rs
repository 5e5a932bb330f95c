//! Scheduler-facing execution options derived from a job's config

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobConfig, DEFAULT_SCHEDULE, DEFAULT_TIMEOUT};

/// Options handed to the external scheduler when a task is registered.
///
/// Retries deliberately live on the commander side of the fence; the
/// [`apply_config`](HandlerOptions::apply_config) overlay forces
/// `max_retries` to zero so ticks are never re-run by the scheduler on top
/// of the commander's own retry loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerOptions {
    pub expression: String,
    #[serde(
        with = "crate::config::duration_serde::option_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub max_retries: u32,
    pub max_runs: u32,
    pub run_once: bool,
    pub no_timeout: bool,
    pub exit_on_error: bool,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            expression: DEFAULT_SCHEDULE.to_string(),
            timeout: Some(DEFAULT_TIMEOUT),
            deadline: None,
            max_retries: 0,
            max_runs: 0,
            run_once: false,
            no_timeout: false,
            exit_on_error: false,
        }
    }
}

impl HandlerOptions {
    /// Derive handler options from a parsed job config.
    pub fn from_config(config: &JobConfig) -> Self {
        let mut opts = Self::default();
        if !config.schedule.is_empty() {
            opts.expression = config.schedule.clone();
        }
        opts.max_retries = config.retries;
        opts.max_runs = config.max_runs;
        opts.run_once = config.run_once;
        opts.exit_on_error = config.exit_on_error;
        opts.deadline = config.deadline;
        if config.no_timeout {
            opts.no_timeout = true;
            opts.timeout = None;
        } else if let Some(timeout) = config.timeout {
            opts.timeout = Some(timeout);
        }
        opts
    }

    /// Overlay a merged config onto existing options for scheduler
    /// registration. Retries are zeroed: the commander owns them.
    pub fn apply_config(mut self, config: &JobConfig) -> Self {
        if !config.schedule.is_empty() {
            self.expression = config.schedule.clone();
        }
        self.max_retries = 0;
        if let Some(timeout) = config.timeout {
            self.timeout = Some(timeout);
        }
        if config.no_timeout {
            self.no_timeout = true;
            self.timeout = None;
        }
        if config.deadline.is_some() {
            self.deadline = config.deadline;
        }
        if config.max_runs != 0 {
            self.max_runs = config.max_runs;
        }
        if config.run_once {
            self.run_once = true;
        }
        if config.exit_on_error {
            self.exit_on_error = true;
        }
        if self.expression.is_empty() {
            self.expression = DEFAULT_SCHEDULE.to_string();
        }
        self
    }
}
