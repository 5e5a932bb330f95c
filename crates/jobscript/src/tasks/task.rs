//! The immutable task descriptor

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::context::ExecContext;
use crate::engines::Engine;
use crate::errors::JobResult;
use crate::model::{
    merge_config_defaults, DedupPolicy, ExecutionMessage, HandlerOptions, JobConfig,
    SCRIPT_PARAMETER,
};

/// An immutable, pre-parsed script descriptor bound to an engine.
///
/// Created by an engine's `parse_job`, registered once, and read-only
/// thereafter. The task exclusively owns its cached script content; the
/// engine reference is a shared non-owning capability.
#[derive(Clone)]
pub struct Task {
    id: String,
    script_path: String,
    script_type: String,
    handler_options: HandlerOptions,
    config: JobConfig,
    script_content: String,
    engine: Arc<dyn Engine>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        script_path: impl Into<String>,
        script_type: impl Into<String>,
        handler_options: HandlerOptions,
        config: JobConfig,
        script_content: impl Into<String>,
        engine: Arc<dyn Engine>,
    ) -> Self {
        Self {
            id: id.into(),
            script_path: script_path.into(),
            script_type: script_type.into(),
            handler_options,
            config,
            script_content: script_content.into(),
            engine,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn script_path(&self) -> &str {
        &self.script_path
    }

    pub fn script_type(&self) -> &str {
        &self.script_type
    }

    pub fn handler_options(&self) -> &HandlerOptions {
        &self.handler_options
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn script_content(&self) -> &str {
        &self.script_content
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Run this task's script through its engine.
    pub async fn execute(&self, ctx: &ExecContext, msg: &ExecutionMessage) -> JobResult<()> {
        self.engine.execute(ctx, msg).await
    }

    /// Build an execution message pre-filled with this task's defaults and
    /// cached script content, avoiding a re-read from the provider.
    pub fn build_execution_message(
        &self,
        parameters: Option<std::collections::HashMap<String, Value>>,
    ) -> ExecutionMessage {
        let mut msg = ExecutionMessage::new(&self.id);
        msg.script_path = self.script_path.clone();
        msg.config = self.config.clone();
        if let Some(parameters) = parameters {
            msg.parameters = parameters;
        }
        msg.parameters.entry(SCRIPT_PARAMETER.to_string()).or_insert_with(|| {
            Value::String(self.script_content.clone())
        });
        msg
    }

    /// Merge a caller-supplied message (which may already carry overrides)
    /// with this task's defaults and cached script content.
    pub fn complete_execution_message(&self, msg: &ExecutionMessage) -> ExecutionMessage {
        let mut base = self.build_execution_message(None);

        if !msg.job_id.is_empty() {
            base.job_id = msg.job_id.clone();
        }
        if !msg.script_path.is_empty() {
            base.script_path = msg.script_path.clone();
        }
        if !msg.idempotency_key.is_empty() {
            base.idempotency_key = msg.idempotency_key.clone();
        }
        if msg.dedup_policy != DedupPolicy::Ignore {
            base.dedup_policy = msg.dedup_policy;
        }
        if msg.output_callback.is_some() {
            base.output_callback = msg.output_callback.clone();
        }
        if msg.result.is_some() {
            base.result = msg.result.clone();
        }

        base.config = merge_config_defaults(&self.config, &msg.config);

        for (key, value) in &msg.parameters {
            base.parameters.insert(key.clone(), value.clone());
        }
        base.parameters
            .entry(SCRIPT_PARAMETER.to_string())
            .or_insert_with(|| Value::String(self.script_content.clone()));

        base
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("script_path", &self.script_path)
            .field("script_type", &self.script_type)
            .field("handler_options", &self.handler_options)
            .field("config", &self.config)
            .field("script_bytes", &self.script_content.len())
            .field("engine", &self.engine.name())
            .finish()
    }
}
