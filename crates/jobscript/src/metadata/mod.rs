//! Metadata parser: lift scheduling config out of script comment headers
//!
//! Scripts carry their configuration in one of four header styles, checked
//! in priority order:
//!
//! 1. YAML front-matter delimited by `---` lines
//! 2. Line-comment headers: `// config`, `# config`, `-- config`, whose body
//!    lines start with two or more of the same marker
//! 3. Block-comment headers: `/** config ... */` with `*`-prefixed body lines
//!
//! The header body is YAML. Recognized keys map onto [`JobConfig`]; unknown
//! keys pass through into `config.metadata` untouched. When no header
//! matches, the parser returns the default config (run every minute, one
//! minute timeout) and the full input as the script body.

mod patterns;

pub use patterns::MatchPattern;

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::errors::{codes, JobError};
use crate::model::{BackoffConfig, JobConfig, DEFAULT_SCHEDULE, DEFAULT_TIMEOUT};

/// A recoverable problem found while decoding a header. The surrounding
/// parse still yields a usable config and script body.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseIssue {
    #[error("invalid timeout duration: {0}")]
    InvalidTimeout(String),
    #[error("invalid deadline: {0}")]
    InvalidDeadline(String),
}

/// Extracts a [`JobConfig`] and the remaining script body from raw bytes.
///
/// Parsing is pure: the same input always yields the same output.
#[derive(Debug, Clone)]
pub struct MetadataParser {
    patterns: Vec<MatchPattern>,
}

impl Default for MetadataParser {
    fn default() -> Self {
        Self {
            patterns: MatchPattern::defaults(),
        }
    }
}

/// Outcome of a parse: a usable config and script body are produced even
/// when soft errors (bad timeout/deadline values) were encountered.
#[derive(Debug)]
pub struct ParsedScript {
    pub config: JobConfig,
    pub script: String,
    pub error: Option<JobError>,
}

impl MetadataParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend custom patterns ahead of the built-in ones.
    pub fn with_patterns(mut self, patterns: Vec<MatchPattern>) -> Self {
        let mut all = patterns;
        all.extend(self.patterns);
        self.patterns = all;
        self
    }

    /// Parse raw script bytes into config + remaining script.
    ///
    /// The script body is returned in every case, including parse failures,
    /// so callers can still recover the executable content.
    pub fn parse(&self, content: &[u8]) -> ParsedScript {
        let text = String::from_utf8_lossy(content);
        let processed = quote_schedule_descriptors(&text);
        let lines: Vec<&str> = processed.split('\n').collect();

        for (i, orig_line) in lines.iter().enumerate() {
            let line = orig_line.trim();
            for pattern in &self.patterns {
                if !pattern.matches_start(line) {
                    continue;
                }

                return if pattern.is_block {
                    self.parse_block(pattern, line, &lines, i)
                } else if pattern.comment_prefix.is_empty() {
                    self.parse_front_matter(pattern, &lines, i)
                } else {
                    self.parse_line_comments(pattern, &lines, i)
                };
            }
        }

        // No header anywhere: the whole input is the script.
        ParsedScript {
            config: JobConfig::with_defaults(),
            script: text.into_owned(),
            error: None,
        }
    }

    /// `/** config ... */` style: body runs until the closing `*/`, each
    /// line stripped of its leading `*`.
    fn parse_block(
        &self,
        pattern: &MatchPattern,
        start_line: &str,
        lines: &[&str],
        start: usize,
    ) -> ParsedScript {
        let mut metadata_lines: Vec<String> = Vec::new();

        // Anything after "config" on the opening line counts as body.
        if let Some(trailing) = pattern.start_capture(start_line) {
            if !trailing.trim().is_empty() {
                metadata_lines.push(trailing.trim().to_string());
            }
        }

        let mut end = lines.len();
        for (j, raw) in lines.iter().enumerate().skip(start + 1) {
            let trimmed = raw.trim();
            if pattern.matches_end(trimmed) {
                end = j;
                break;
            }
            metadata_lines.push(pattern.strip_prefix(trimmed));
        }

        let script = if end + 1 < lines.len() {
            lines[end + 1..].join("\n")
        } else {
            String::new()
        };

        let (config, error) = decode_raw_config(&metadata_lines.join("\n"));
        ParsedScript {
            config,
            script,
            error,
        }
    }

    /// `--- ... ---` YAML front-matter: body lines are taken verbatim.
    fn parse_front_matter(
        &self,
        pattern: &MatchPattern,
        lines: &[&str],
        start: usize,
    ) -> ParsedScript {
        let mut end = lines.len();
        for (j, raw) in lines.iter().enumerate().skip(start + 1) {
            if pattern.matches_end(raw.trim()) {
                end = j;
                break;
            }
        }

        let metadata: Vec<&str> = lines[start + 1..end.min(lines.len())]
            .iter()
            .map(|l| l.trim())
            .collect();

        let script = if end + 1 < lines.len() {
            lines[end + 1..].join("\n")
        } else {
            String::new()
        };

        let (config, error) = decode_raw_config(&metadata.join("\n"));
        ParsedScript {
            config,
            script,
            error,
        }
    }

    /// `// config` / `# config` / `-- config` style: the header ends at the
    /// first line not carrying the repeated marker.
    fn parse_line_comments(
        &self,
        pattern: &MatchPattern,
        lines: &[&str],
        start: usize,
    ) -> ParsedScript {
        let mut end = lines.len();
        for (j, raw) in lines.iter().enumerate().skip(start + 1) {
            if !pattern.matches_continuation(raw.trim()) {
                end = j;
                break;
            }
        }

        let metadata: Vec<String> = lines[start + 1..end.min(lines.len())]
            .iter()
            .map(|l| pattern.strip_prefix(l.trim()))
            .collect();

        // The script keeps the first non-header line onward, spacing intact.
        let script = if end < lines.len() {
            lines[end..].join("\n")
        } else {
            String::new()
        };

        let (config, error) = decode_raw_config(&metadata.join("\n"));
        ParsedScript {
            config,
            script,
            error,
        }
    }
}

/// The YAML-facing shape of a header: identical to [`JobConfig`] except that
/// timeout stays a raw string so lenient parsing can run afterwards, and
/// unrecognized keys are collected for the metadata bag.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    schedule: String,
    retries: u32,
    timeout: Option<RawTimeout>,
    deadline: String,
    no_timeout: bool,
    debug: bool,
    run_once: bool,
    max_runs: u32,
    max_concurrency: u32,
    exit_on_error: bool,
    env: HashMap<String, String>,
    script_type: String,
    transaction: bool,
    metadata: HashMap<String, Value>,
    backoff: BackoffConfig,
    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

/// Timeout values arrive as strings (`"300s"`) or bare numbers (`120`).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTimeout {
    Seconds(u64),
    Text(String),
}

fn decode_raw_config(body: &str) -> (JobConfig, Option<JobError>) {
    if body.trim().is_empty() {
        return (JobConfig::with_defaults(), None);
    }
    let raw: RawConfig = match serde_yaml::from_str(body) {
        Ok(raw) => raw,
        Err(e) => {
            // A malformed header is the sole error; callers still get the
            // script body from the surrounding parse.
            return (
                JobConfig::default(),
                Some(
                    JobError::bad_input(codes::SCRIPT_PARSE_ERROR, "failed to parse metadata")
                        .with_source(e),
                ),
            );
        }
    };

    let mut issues: Vec<ParseIssue> = Vec::new();

    let mut config = JobConfig {
        schedule: raw.schedule,
        retries: raw.retries,
        timeout: Some(DEFAULT_TIMEOUT),
        no_timeout: raw.no_timeout,
        debug: raw.debug,
        run_once: raw.run_once,
        max_runs: raw.max_runs,
        max_concurrency: raw.max_concurrency,
        exit_on_error: raw.exit_on_error,
        env: raw.env,
        script_type: raw.script_type,
        transaction: raw.transaction,
        metadata: raw.metadata,
        backoff: raw.backoff,
        ..Default::default()
    };

    match raw.timeout {
        Some(RawTimeout::Seconds(secs)) => {
            if secs > 0 {
                config.timeout = Some(Duration::from_secs(secs));
            }
        }
        Some(RawTimeout::Text(text)) => match parse_timeout_text(&text) {
            Some(d) if !d.is_zero() => config.timeout = Some(d),
            Some(_) => {}
            None => issues.push(ParseIssue::InvalidTimeout(text)),
        },
        None => {}
    }

    if config.schedule.is_empty() {
        config.schedule = DEFAULT_SCHEDULE.to_string();
    }

    if !raw.deadline.is_empty() {
        match DateTime::parse_from_rfc3339(&raw.deadline) {
            Ok(dt) => config.deadline = Some(dt.with_timezone(&Utc)),
            Err(_) => issues.push(ParseIssue::InvalidDeadline(raw.deadline)),
        }
    }

    // Unknown header keys are opaque to the core.
    for (key, value) in raw.extra {
        config.metadata.entry(key).or_insert(value);
    }

    let error = if issues.is_empty() {
        None
    } else {
        let rendered: Vec<String> = issues.iter().map(ToString::to_string).collect();
        Some(
            JobError::bad_input(codes::SCRIPT_PARSE_ERROR, rendered.join("; "))
                .with_metadata("issues", Value::from(rendered)),
        )
    };

    (config, error)
}

/// Parse a timeout string: humantime-style durations first (`"300s"`,
/// `"2m"`), then digits with optional underscore separators read as whole
/// seconds (`"30_000"` -> 30000 s).
fn parse_timeout_text(text: &str) -> Option<Duration> {
    if let Ok(d) = humantime::parse_duration(text) {
        return Some(d);
    }
    let cleaned = text.replace('_', "");
    cleaned.parse::<u64>().ok().map(Duration::from_secs)
}

static SCHEDULE_DESCRIPTOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)^((?:[#/*-]+\s*)?)(schedule:\s*)(@(?:(?:every(?:\s+\S+)?)|yearly|annually|monthly|weekly|daily|midnight|hourly|reboot)\b.*)$"#,
    )
    .expect("schedule descriptor regex")
});

/// Quote `schedule: @foo ...` values, optionally behind a comment marker,
/// so the YAML layer does not reject the `@` sigil. Runs over the whole
/// input before header detection.
fn quote_schedule_descriptors(content: &str) -> String {
    SCHEDULE_DESCRIPTOR
        .replace_all(content, "$1$2\"$3\"")
        .into_owned()
}
