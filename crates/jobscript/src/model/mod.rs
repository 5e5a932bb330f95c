//! Core data model shared across the runtime
//!
//! [`JobConfig`] is the parsed form of a script's comment header; it flows
//! from the metadata parser into tasks, execution messages, and schedule
//! definitions. Zero/empty fields mean "unset" so that merging can overlay
//! caller overrides onto task defaults without clobbering them.

mod handler_options;
mod merge;
mod message;

pub use handler_options::HandlerOptions;
pub use merge::{merge_backoff_defaults, merge_config_defaults};
pub use message::{ExecutionMessage, OutputCallback, SCRIPT_PARAMETER};

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Fallback cron expression when a script declares none.
pub const DEFAULT_SCHEDULE: &str = "* * * * *";

/// Fallback execution timeout when a script declares none.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// A discovered script artifact: identifier, provider path, and raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptInfo {
    pub id: String,
    pub path: String,
    pub content: Vec<u8>,
}

/// How duplicate submissions sharing an idempotency key are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DedupPolicy {
    /// Duplicates are not tracked at all
    #[default]
    Ignore,
    /// Later submissions are rejected with a sentinel
    Drop,
    /// Later submissions coalesce onto the first outcome
    Merge,
    /// Later submissions reset the entry and run again
    Replace,
}

impl DedupPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupPolicy::Ignore => "ignore",
            DedupPolicy::Drop => "drop",
            DedupPolicy::Merge => "merge",
            DedupPolicy::Replace => "replace",
        }
    }
}

impl fmt::Display for DedupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DedupPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "ignore" => Ok(DedupPolicy::Ignore),
            "drop" => Ok(DedupPolicy::Drop),
            "merge" => Ok(DedupPolicy::Merge),
            "replace" => Ok(DedupPolicy::Replace),
            other => Err(format!("unknown dedup policy {other:?}")),
        }
    }
}

impl Serialize for DedupPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DedupPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Delay curve applied between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Retry immediately
    #[default]
    None,
    /// Constant delay per attempt
    Fixed,
    /// Doubling delay capped at `max_interval`
    Exponential,
}

/// Retry timing configuration. Unset intervals fall back to the runtime
/// defaults (100 ms base, 5 s cap).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub strategy: BackoffStrategy,
    #[serde(
        with = "crate::config::duration_serde::option_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub interval: Option<Duration>,
    #[serde(
        with = "crate::config::duration_serde::option_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_interval: Option<Duration>,
    pub jitter: bool,
}

impl BackoffConfig {
    /// True when every field is still at its zero value.
    pub fn is_unset(&self) -> bool {
        self.strategy == BackoffStrategy::None
            && self.interval.is_none()
            && self.max_interval.is_none()
            && !self.jitter
    }
}

/// Parsed metadata for one script.
///
/// Unknown header keys pass through verbatim in `metadata`; the core never
/// interprets them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub schedule: String,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub retries: u32,
    #[serde(
        with = "crate::config::duration_serde::option_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "is_false")]
    pub no_timeout: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub debug: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub run_once: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub exit_on_error: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub transaction: bool,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_runs: u32,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_concurrency: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub script_type: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    #[serde(skip_serializing_if = "BackoffConfig::is_unset")]
    pub backoff: BackoffConfig,
}

impl JobConfig {
    /// A config carrying only the parser defaults: run every minute, one
    /// minute timeout.
    pub fn with_defaults() -> Self {
        Self {
            schedule: DEFAULT_SCHEDULE.to_string(),
            timeout: Some(DEFAULT_TIMEOUT),
            ..Self::default()
        }
    }

    /// Effective timeout for execution: the declared one, or the runtime
    /// default, or none at all when `no_timeout` is set.
    pub fn effective_timeout(&self) -> Option<Duration> {
        if self.no_timeout {
            return None;
        }
        Some(self.timeout.unwrap_or(DEFAULT_TIMEOUT))
    }

    /// Typed lookup into the opaque metadata bag.
    pub fn metadata_bool(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(Value::as_bool)
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Execution outcome reported back into the registry.
///
/// `duration` travels as integer nanoseconds on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionResult {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output_url: String,
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub size: i64,
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub duration: i64,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl ExecutionResult {
    pub fn set_duration(&mut self, elapsed: Duration) {
        self.duration = elapsed.as_nanos().min(i64::MAX as u128) as i64;
    }

    pub fn duration_std(&self) -> Option<Duration> {
        u64::try_from(self.duration)
            .ok()
            .map(Duration::from_nanos)
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}
