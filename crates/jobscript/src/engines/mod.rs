//! Execution engines
//!
//! An [`Engine`] binds one script language to an execution strategy. Every
//! engine shares the same lifecycle: `can_handle` selects by file extension,
//! `parse_job` lifts the metadata header into a [`Task`], and `execute` runs
//! the script under the execution context's deadline.
//!
//! [`EngineCore`] carries the behavior common to all engines (extension
//! matching, metadata parsing, script-content resolution, deadline
//! derivation); concrete engines compose it rather than inherit from it and
//! pass themselves in at task-construction time.

mod javascript;
mod shell;
mod sql;

pub use javascript::JavaScriptEngine;
pub use shell::ShellEngine;
pub use sql::SqlEngine;

#[cfg(test)]
pub mod testing;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::context::ExecContext;
use crate::errors::{codes, JobError, JobResult};
use crate::metadata::MetadataParser;
use crate::model::{ExecutionMessage, HandlerOptions, JobConfig};
use crate::sources::SourceProvider;
use crate::tasks::{default_task_id_provider, Task, TaskIdProvider, TaskIdProviderAware};

/// Default per-engine execution timeout when neither the context nor the
/// script supplies one.
pub const DEFAULT_ENGINE_TIMEOUT: Duration = Duration::from_secs(30);

/// An execution strategy for one script language.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Engine identifier, `engine:<type>`.
    fn name(&self) -> String;

    /// Whether this engine handles the given script path.
    fn can_handle(&self, path: &str) -> bool;

    /// Parse a script into a task bound to this engine.
    fn parse_job(self: Arc<Self>, path: &str, content: &[u8]) -> JobResult<Task>;

    /// Execute a script under the context's deadline and cancellation.
    async fn execute(&self, ctx: &ExecContext, msg: &ExecutionMessage) -> JobResult<()>;

    /// Capability opt-in: engines that accept a task-ID strategy expose it
    /// here.
    fn as_task_id_aware(&self) -> Option<&dyn TaskIdProviderAware> {
        None
    }
}

/// Shared engine behavior, composed by each concrete engine.
pub struct EngineCore {
    engine_type: String,
    extensions: Vec<String>,
    default_timeout: Duration,
    parser: MetadataParser,
    source_provider: RwLock<Option<Arc<dyn SourceProvider>>>,
    task_id_provider: RwLock<TaskIdProvider>,
}

impl EngineCore {
    pub fn new(engine_type: impl Into<String>, extensions: &[&str]) -> Self {
        Self {
            engine_type: engine_type.into(),
            extensions: extensions.iter().map(|e| normalize_extension(e)).collect(),
            default_timeout: DEFAULT_ENGINE_TIMEOUT,
            parser: MetadataParser::new(),
            source_provider: RwLock::new(None),
            task_id_provider: RwLock::new(default_task_id_provider()),
        }
    }

    pub fn engine_type(&self) -> &str {
        &self.engine_type
    }

    pub fn name(&self) -> String {
        format!("engine:{}", self.engine_type)
    }

    pub fn set_default_timeout(&mut self, timeout: Duration) {
        if !timeout.is_zero() {
            self.default_timeout = timeout;
        }
    }

    pub fn add_extension(&mut self, ext: &str) {
        if !ext.is_empty() {
            self.extensions.push(normalize_extension(ext));
        }
    }

    pub fn set_parser(&mut self, parser: MetadataParser) {
        self.parser = parser;
    }

    pub fn set_source_provider(&self, provider: Arc<dyn SourceProvider>) {
        *self
            .source_provider
            .write()
            .expect("engine provider poisoned") = Some(provider);
    }

    pub fn set_task_id_provider(&self, provider: TaskIdProvider) {
        *self
            .task_id_provider
            .write()
            .expect("engine id provider poisoned") = provider;
    }

    /// Extension match, lowercased.
    pub fn can_handle(&self, path: &str) -> bool {
        let ext = match path.rsplit_once('.') {
            Some((_, ext)) => format!(".{}", ext.to_lowercase()),
            None => return false,
        };
        self.extensions.iter().any(|e| *e == ext)
    }

    /// Extract metadata and content from a script and build a task bound to
    /// `engine`.
    pub fn parse_job(
        &self,
        engine: Arc<dyn Engine>,
        path: &str,
        content: &[u8],
    ) -> JobResult<Task> {
        let parsed = self.parser.parse(content);
        if let Some(err) = parsed.error {
            return Err(err.with_metadata("script_path", path));
        }

        let mut config = parsed.config;
        if config.script_type.is_empty() {
            config.script_type = self.engine_type.clone();
        }

        let id = {
            let provider = self
                .task_id_provider
                .read()
                .expect("engine id provider poisoned");
            provider(path)
        };

        let handler_options = HandlerOptions::from_config(&config);

        Ok(Task::new(
            id,
            path,
            self.engine_type.clone(),
            handler_options,
            config,
            parsed.script,
            engine,
        ))
    }

    /// Script-only content for a message: the cached parameter when present,
    /// otherwise a provider read followed by a re-parse that discards the
    /// metadata header.
    pub async fn script_content(&self, msg: &ExecutionMessage) -> JobResult<String> {
        if let Some(cached) = msg.cached_script() {
            return Ok(cached.to_string());
        }

        let provider = self
            .source_provider
            .read()
            .expect("engine provider poisoned")
            .clone()
            .ok_or_else(|| {
                JobError::internal(
                    codes::SCRIPT_READ_ERROR,
                    format!(
                        "{} engine has no source provider for {}",
                        self.engine_type, msg.script_path
                    ),
                )
            })?;

        let content = provider.get_script(&msg.script_path).await.map_err(|e| {
            JobError::external(codes::SCRIPT_READ_ERROR, "failed to read script file")
                .with_metadata("script_path", msg.script_path.clone())
                .with_source(e)
        })?;

        let parsed = self.parser.parse(&content);
        if let Some(err) = parsed.error {
            return Err(
                JobError::bad_input(codes::SCRIPT_PARSE_ERROR, "failed to parse script content")
                    .with_metadata("script_path", msg.script_path.clone())
                    .with_source(err),
            );
        }
        Ok(parsed.script)
    }

    /// Derive the execution context: an inbound deadline is inherited
    /// verbatim; otherwise the engine's default timeout is applied.
    /// `no_timeout` on the message's config bypasses wrapping entirely.
    pub fn execution_context(&self, ctx: &ExecContext, config: &JobConfig) -> ExecContext {
        if config.no_timeout {
            return ctx.clone();
        }
        if ctx.deadline().is_some() {
            return ctx.clone();
        }
        ctx.with_timeout(self.default_timeout)
    }
}

fn normalize_extension(ext: &str) -> String {
    let lower = ext.to_lowercase();
    if lower.starts_with('.') {
        lower
    } else {
        format!(".{lower}")
    }
}
