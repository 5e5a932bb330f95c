//! Application configuration
//!
//! Loaded from a TOML file with an environment-variable overlay
//! (`JOBSCRIPT_*`, double underscore for nesting). Durations accept either
//! integer seconds or humantime strings.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub mod defaults;
pub mod duration_serde;

use defaults::*;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub engines: EnginesConfig,
    pub scheduler: SchedulerConfig,
    pub limits: LimitsConfig,
}

/// Where scripts are discovered from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// `filesystem` or `database`
    pub kind: SourceKind,
    /// Root directory for the filesystem provider
    pub root: String,
    /// Glob patterns skipped during discovery (matched against walk-relative paths)
    pub ignore_globs: Vec<String>,
    /// Exact relative paths skipped during discovery
    pub ignore_paths: Vec<String>,
    /// Per-script size ceiling in bytes; 0 disables the check
    pub max_file_size: u64,
    /// Connection URL for the database provider
    pub database_url: Option<String>,
    /// Table holding (path, content) rows for the database provider
    pub table: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Filesystem,
            root: default_script_root(),
            ignore_globs: Vec::new(),
            ignore_paths: Vec::new(),
            max_file_size: 0,
            database_url: None,
            table: default_scripts_table(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Filesystem,
    Database,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EnginesConfig {
    pub shell: ShellEngineConfig,
    pub javascript: JsEngineConfig,
    pub sql: SqlEngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellEngineConfig {
    pub shell: String,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    /// Extra `K=V` pairs appended to every script's environment
    pub environment: Vec<String>,
}

impl Default for ShellEngineConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            args: default_shell_args(),
            working_directory: None,
            environment: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JsEngineConfig {
    /// Per-call timeout for the `fetch` builtin, in milliseconds semantics
    #[serde(with = "duration_serde::duration")]
    pub fetch_timeout: Duration,
}

impl Default for JsEngineConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: default_fetch_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlEngineConfig {
    /// Marker splitting a script into statements; `;` fallback when absent
    pub statement_boundary: String,
    /// Connection URL used when scripts do not carry their own `dsn` metadata
    pub database_url: Option<String>,
}

impl Default for SqlEngineConfig {
    fn default() -> Self {
        Self {
            statement_boundary: default_sql_boundary(),
            database_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// JSON or YAML file holding desired schedule definitions
    pub sync_file: Option<PathBuf>,
    /// Cron cadence of the reconciliation pass
    pub sync_expression: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            sync_file: None,
            sync_expression: default_sync_expression(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// JSON-encoded parameter payload ceiling for the quota checker
    pub payload_size_limit: usize,
    /// Retry count ceiling for the quota checker; 0 disables the check
    pub max_retries: u32,
    /// Encoded envelope ceiling
    pub envelope_max_bytes: usize,
    /// Encoded result ceiling
    pub result_max_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            payload_size_limit: default_payload_size_limit(),
            max_retries: 0,
            envelope_max_bytes: default_envelope_max_bytes(),
            result_max_bytes: default_result_max_bytes(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file overlaid with `JOBSCRIPT_*`
    /// environment variables.
    pub fn load(path: &str) -> Result<Self> {
        let config = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("JOBSCRIPT_").split("__"))
            .extract()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.source.kind, SourceKind::Filesystem);
        assert_eq!(config.source.root, "./jobs");
        assert_eq!(config.engines.shell.shell, "/bin/sh");
        assert_eq!(config.engines.sql.statement_boundary, "--job");
        assert_eq!(config.limits.envelope_max_bytes, 64 * 1024);
        assert_eq!(config.limits.result_max_bytes, 32 * 1024);
        assert!(config.scheduler.enabled);
    }

    #[test]
    fn env_overlay_wins_over_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "jobscript.toml",
                r#"
                    [source]
                    root = "/srv/jobs"
                "#,
            )?;
            jail.set_env("JOBSCRIPT_SOURCE__TABLE", "custom_scripts");

            let config = Config::load("jobscript.toml").expect("config loads");
            assert_eq!(config.source.root, "/srv/jobs");
            assert_eq!(config.source.table, "custom_scripts");
            Ok(())
        });
    }
}
