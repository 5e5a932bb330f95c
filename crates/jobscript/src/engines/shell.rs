//! Shell engine: runs scripts in a subprocess
//!
//! Scripts execute as `sh -c <script>` by default; the shell and its
//! arguments are configurable. The child environment starts empty unless
//! `use_env` is set in the script's metadata, then engine-level variables
//! and the script's `env` map are appended. Stdout and stderr are captured
//! and attached to failures.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::context::ExecContext;
use crate::errors::{codes, JobError, JobResult};
use crate::metadata::MetadataParser;
use crate::model::ExecutionMessage;
use crate::sources::SourceProvider;
use crate::tasks::{Task, TaskIdProvider, TaskIdProviderAware};

use super::{Engine, EngineCore};

pub struct ShellEngine {
    core: EngineCore,
    shell: String,
    shell_args: Vec<String>,
    working_directory: Option<String>,
    environment: Vec<String>,
}

impl ShellEngine {
    pub fn new() -> Self {
        Self {
            core: EngineCore::new("shell", &[".sh", ".bash"]),
            shell: "/bin/sh".to_string(),
            shell_args: vec!["-c".to_string()],
            working_directory: None,
            environment: Vec::new(),
        }
    }

    /// Override the shell executable and its arguments.
    pub fn with_shell(mut self, shell: impl Into<String>, args: Vec<String>) -> Self {
        let shell = shell.into();
        if !shell.is_empty() {
            self.shell = shell;
            self.shell_args = args;
        }
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        let dir = dir.into();
        if !dir.is_empty() {
            self.working_directory = Some(dir);
        }
        self
    }

    /// Extra `K=V` pairs appended to every script's environment.
    pub fn with_environment(mut self, env: Vec<String>) -> Self {
        self.environment = env;
        self
    }

    pub fn with_extension(mut self, ext: &str) -> Self {
        self.core.add_extension(ext);
        self
    }

    pub fn with_default_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.core.set_default_timeout(timeout);
        self
    }

    pub fn with_metadata_parser(mut self, parser: MetadataParser) -> Self {
        self.core.set_parser(parser);
        self
    }

    pub fn with_source_provider(self, provider: Arc<dyn SourceProvider>) -> Self {
        self.core.set_source_provider(provider);
        self
    }

    fn build_command(&self, script: &str, msg: &ExecutionMessage) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.args(&self.shell_args);
        cmd.arg(script);

        if let Some(dir) = &self.working_directory {
            cmd.current_dir(dir);
        }

        // The child starts from an empty environment unless the script opts
        // into inheriting the parent's.
        if !msg.config.metadata_bool("use_env").unwrap_or(false) {
            cmd.env_clear();
        }

        for pair in &self.environment {
            if let Some((key, value)) = pair.split_once('=') {
                cmd.env(key, value);
            }
        }
        for (key, value) in &msg.config.env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

impl Default for ShellEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskIdProviderAware for ShellEngine {
    fn set_task_id_provider(&self, provider: TaskIdProvider) {
        self.core.set_task_id_provider(provider);
    }
}

#[async_trait]
impl Engine for ShellEngine {
    fn name(&self) -> String {
        self.core.name()
    }

    fn can_handle(&self, path: &str) -> bool {
        self.core.can_handle(path)
    }

    fn parse_job(self: Arc<Self>, path: &str, content: &[u8]) -> JobResult<Task> {
        let engine: Arc<dyn Engine> = self.clone();
        self.core.parse_job(engine, path, content)
    }

    async fn execute(&self, ctx: &ExecContext, msg: &ExecutionMessage) -> JobResult<()> {
        let script = self.core.script_content(msg).await?;
        let exec_ctx = self.core.execution_context(ctx, &msg.config);

        debug!(engine = "shell", script_path = %msg.script_path, "shell script starting");
        let start = Instant::now();

        let mut cmd = self.build_command(&script, msg);
        let child = cmd.spawn().map_err(|e| {
            JobError::external(codes::SHELL_EXECUTION_ERROR, "failed to spawn shell")
                .with_metadata("script_path", msg.script_path.clone())
                .with_metadata("shell", self.shell.clone())
                .with_source(e)
        })?;

        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(|e| {
                JobError::external(codes::SHELL_EXECUTION_ERROR, "failed to collect script output")
                    .with_metadata("script_path", msg.script_path.clone())
                    .with_source(e)
            })?,
            _ = exec_ctx.done() => {
                // kill_on_drop reaps the child once the future is dropped.
                let duration = start.elapsed();
                error!(
                    engine = "shell",
                    script_path = %msg.script_path,
                    duration_ms = duration.as_millis() as u64,
                    "shell script timed out"
                );
                return Err(exec_ctx.check().err().unwrap_or_else(JobError::cancelled)
                    .with_metadata("script_path", msg.script_path.clone()));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if let Some(callback) = &msg.output_callback {
            callback(&stdout, &stderr);
        }

        let duration = start.elapsed();
        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            error!(
                engine = "shell",
                script_path = %msg.script_path,
                duration_ms = duration.as_millis() as u64,
                exit_code,
                "shell script failed"
            );
            return Err(JobError::external(
                codes::SHELL_EXECUTION_ERROR,
                format!("script exited with non-zero status: {exit_code}"),
            )
            .with_metadata("script_path", msg.script_path.clone())
            .with_metadata("exit_code", exit_code)
            .with_metadata("stdout", stdout)
            .with_metadata("stderr", stderr));
        }

        info!(
            engine = "shell",
            script_path = %msg.script_path,
            duration_ms = duration.as_millis() as u64,
            "shell script completed"
        );
        Ok(())
    }

    fn as_task_id_aware(&self) -> Option<&dyn TaskIdProviderAware> {
        Some(self)
    }
}
