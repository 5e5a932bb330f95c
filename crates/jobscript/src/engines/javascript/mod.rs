//! JavaScript engine: runs scripts in an embedded per-invocation VM
//!
//! Each execution owns a fresh `boa_engine` context with its own job queue;
//! invocations never share a loop. Before the user script runs the engine
//! installs `console`, a Node-ish `process` shim, lightweight `URL` and
//! `Buffer` helpers, a `fetch` builtin over the host HTTP client,
//! `__dirname`/`__filename`, the script's `env` entries, and every message
//! parameter (except the reserved cached-script slot) as globals.
//!
//! The VM itself is single-threaded and non-preemptible, so execution runs
//! on a blocking thread; on deadline the invocation reports a timeout and
//! the VM thread is abandoned to finish on its own.

mod fetch;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use boa_engine::property::Attribute;
use boa_engine::{js_string, Context, JsString, JsValue, Source};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::context::ExecContext;
use crate::errors::{codes, JobError, JobResult};
use crate::metadata::MetadataParser;
use crate::model::{ExecutionMessage, SCRIPT_PARAMETER};
use crate::sources::SourceProvider;
use crate::tasks::{Task, TaskIdProvider, TaskIdProviderAware};

use super::{Engine, EngineCore};

/// Default per-call timeout of the `fetch` builtin (milliseconds semantics).
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimal Node-ish surface installed ahead of the user script. Pure
/// JavaScript so the host-side API stays small.
const RUNTIME_PRELUDE: &str = r##"
const process = {
    env: JSON.parse(__ENV_JSON),
    argv: [],
    platform: __PLATFORM,
    cwd: function () { return __dirname; },
};

class URL {
    constructor(input) {
        const m = /^([a-zA-Z][a-zA-Z0-9+.-]*):\/\/([^\/?#:]*)(?::(\d+))?([^?#]*)(?:\?([^#]*))?(?:#(.*))?$/.exec(String(input));
        if (!m) {
            throw new TypeError("Invalid URL: " + input);
        }
        this.protocol = m[1] + ":";
        this.hostname = m[2];
        this.port = m[3] || "";
        this.pathname = m[4] || "/";
        this.search = m[5] ? "?" + m[5] : "";
        this.hash = m[6] ? "#" + m[6] : "";
        this.host = this.port ? this.hostname + ":" + this.port : this.hostname;
        this.origin = this.protocol + "//" + this.host;
        this.href = String(input);
    }
    toString() { return this.href; }
}

const Buffer = {
    from: function (input) {
        if (typeof input === "string") {
            const out = new Uint8Array(input.length);
            for (let i = 0; i < input.length; i++) {
                out[i] = input.charCodeAt(i) & 0xff;
            }
            return out;
        }
        return new Uint8Array(input);
    },
    byteLength: function (input) {
        return Buffer.from(input).length;
    },
};
"##;

pub struct JavaScriptEngine {
    core: EngineCore,
    fetch_timeout: Duration,
}

impl JavaScriptEngine {
    pub fn new() -> Self {
        Self {
            core: EngineCore::new("javascript", &[".js"]),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    /// Default per-call timeout for the `fetch` builtin.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.fetch_timeout = timeout;
        }
        self
    }

    pub fn with_extension(mut self, ext: &str) -> Self {
        self.core.add_extension(ext);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
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
}

impl Default for JavaScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskIdProviderAware for JavaScriptEngine {
    fn set_task_id_provider(&self, provider: TaskIdProvider) {
        self.core.set_task_id_provider(provider);
    }
}

#[async_trait]
impl Engine for JavaScriptEngine {
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

        debug!(engine = "javascript", script_path = %msg.script_path, "js script starting");
        let start = Instant::now();

        let job = VmJob {
            script,
            script_path: msg.script_path.clone(),
            parameters: msg
                .parameters
                .iter()
                .filter(|(k, _)| k.as_str() != SCRIPT_PARAMETER)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            env: msg.config.env.clone(),
            fetch_timeout: self.fetch_timeout,
        };

        let handle = tokio::task::spawn_blocking(move || run_vm(job));

        let result = tokio::select! {
            joined = handle => match joined {
                Ok(result) => result,
                Err(join_err) => Err(JobError::internal(
                    codes::JS_LOOP_TERMINATED,
                    "loop was terminated before completing",
                )
                .with_metadata("script_path", msg.script_path.clone())
                .with_metadata("panicked", join_err.is_panic())),
            },
            _ = exec_ctx.done() => {
                // The VM has no preemption hook; the thread is abandoned and
                // will finish on its own.
                if ctx.token().is_cancelled() {
                    Err(JobError::cancelled().with_metadata("script_path", msg.script_path.clone()))
                } else {
                    Err(JobError::external(
                        codes::JS_EXECUTION_TIMEOUT,
                        "script execution timed out",
                    )
                    .with_metadata("script_path", msg.script_path.clone())
                    .with_metadata("timeout", "context_deadline"))
                }
            }
        };

        let duration = start.elapsed();
        match &result {
            Ok(()) => info!(
                engine = "javascript",
                script_path = %msg.script_path,
                duration_ms = duration.as_millis() as u64,
                "js script completed"
            ),
            Err(e) => error!(
                engine = "javascript",
                script_path = %msg.script_path,
                duration_ms = duration.as_millis() as u64,
                error = %e,
                "js script failed"
            ),
        }
        result
    }

    fn as_task_id_aware(&self) -> Option<&dyn TaskIdProviderAware> {
        Some(self)
    }
}

/// Everything the VM thread needs, detached from the async world.
struct VmJob {
    script: String,
    script_path: String,
    parameters: HashMap<String, Value>,
    env: HashMap<String, String>,
    fetch_timeout: Duration,
}

fn run_vm(job: VmJob) -> JobResult<()> {
    let mut context = Context::default();

    configure_vm(&mut context, &job).map_err(|detail| {
        JobError::internal(
            codes::JS_VM_CONFIG_ERROR,
            "failed to configure the VM environment",
        )
        .with_metadata("script_path", job.script_path.clone())
        .with_metadata("detail", detail)
    })?;

    if let Err(e) = context.eval(Source::from_bytes(job.script.as_bytes())) {
        return Err(JobError::internal(
            codes::JS_EXECUTION_ERROR,
            format!("script execution failed: {e}"),
        )
        .with_metadata("script_path", job.script_path.clone()));
    }

    // Drain queued promise jobs (fetch continuations, then-chains).
    let _ = context.run_jobs();
    Ok(())
}

fn configure_vm(context: &mut Context, job: &VmJob) -> Result<(), String> {
    let console = boa_runtime::Console::init(context);
    context
        .register_global_property(js_string!("console"), console, Attribute::all())
        .map_err(|e| format!("console: {e}"))?;

    let script_dir = match job.script_path.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => ".".to_string(),
    };
    context
        .register_global_property(
            js_string!("__dirname"),
            JsValue::from(JsString::from(script_dir)),
            Attribute::all(),
        )
        .map_err(|e| format!("__dirname: {e}"))?;
    context
        .register_global_property(
            js_string!("__filename"),
            JsValue::from(JsString::from(job.script_path.as_str())),
            Attribute::all(),
        )
        .map_err(|e| format!("__filename: {e}"))?;

    let env_json =
        serde_json::to_string(&job.env).map_err(|e| format!("env serialization: {e}"))?;
    context
        .register_global_property(
            js_string!("__ENV_JSON"),
            JsValue::from(JsString::from(env_json)),
            Attribute::all(),
        )
        .map_err(|e| format!("__ENV_JSON: {e}"))?;
    context
        .register_global_property(
            js_string!("__PLATFORM"),
            JsValue::from(JsString::from(std::env::consts::OS)),
            Attribute::all(),
        )
        .map_err(|e| format!("__PLATFORM: {e}"))?;

    // env entries double as plain globals, matching the shell engine's
    // environment semantics.
    for (key, value) in &job.env {
        context
            .register_global_property(
                JsString::from(key.as_str()),
                JsValue::from(JsString::from(value.as_str())),
                Attribute::all(),
            )
            .map_err(|e| format!("env {key}: {e}"))?;
    }

    for (key, value) in &job.parameters {
        let converted = JsValue::from_json(value, context)
            .map_err(|e| format!("parameter {key}: {e}"))?;
        context
            .register_global_property(JsString::from(key.as_str()), converted, Attribute::all())
            .map_err(|e| format!("parameter {key}: {e}"))?;
    }

    fetch::install(context, job.fetch_timeout).map_err(|e| format!("fetch: {e}"))?;

    context
        .eval(Source::from_bytes(RUNTIME_PRELUDE.as_bytes()))
        .map_err(|e| format!("prelude: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(script: &str) -> ExecutionMessage {
        let mut msg = ExecutionMessage::new("job.js");
        msg.script_path = "jobs/job.js".to_string();
        msg.parameters
            .insert(SCRIPT_PARAMETER.to_string(), Value::from(script));
        msg
    }

    async fn run(script: &str) -> JobResult<()> {
        JavaScriptEngine::new()
            .execute(&ExecContext::background(), &message(script))
            .await
    }

    #[tokio::test]
    async fn simple_script_succeeds() {
        run("console.log('hello from js');").await.unwrap();
    }

    #[tokio::test]
    async fn thrown_errors_surface_as_execution_errors() {
        let err = run("throw new Error('boom');").await.unwrap_err();
        assert_eq!(err.code, codes::JS_EXECUTION_ERROR);
        assert!(err.message.contains("boom"));
    }

    #[tokio::test]
    async fn syntax_errors_surface_as_execution_errors() {
        let err = run("function {").await.unwrap_err();
        assert_eq!(err.code, codes::JS_EXECUTION_ERROR);
    }

    #[tokio::test]
    async fn parameters_become_globals_except_reserved_script() {
        let engine = JavaScriptEngine::new();
        let mut msg = message(
            "if (count !== 3) throw new Error('missing count');\n\
             if (name !== 'report') throw new Error('missing name');\n\
             if (typeof script !== 'undefined') throw new Error('script leaked');",
        );
        msg.parameters.insert("count".to_string(), Value::from(3));
        msg.parameters
            .insert("name".to_string(), Value::from("report"));

        engine
            .execute(&ExecContext::background(), &msg)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn env_entries_are_globals_and_process_env() {
        let engine = JavaScriptEngine::new();
        let mut msg = message(
            "if (API_URL !== 'https://api.internal') throw new Error('global env missing');\n\
             if (process.env.API_URL !== 'https://api.internal') throw new Error('process.env missing');",
        );
        msg.config.env.insert(
            "API_URL".to_string(),
            "https://api.internal".to_string(),
        );

        engine
            .execute(&ExecContext::background(), &msg)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dirname_and_filename_are_set() {
        run(
            "if (__dirname !== 'jobs') throw new Error('dirname: ' + __dirname);\n\
             if (__filename !== 'jobs/job.js') throw new Error('filename: ' + __filename);",
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn url_shim_parses_components() {
        run(
            "const u = new URL('https://example.com:8443/path/to?x=1#frag');\n\
             if (u.hostname !== 'example.com') throw new Error('hostname');\n\
             if (u.port !== '8443') throw new Error('port');\n\
             if (u.pathname !== '/path/to') throw new Error('pathname');\n\
             if (u.search !== '?x=1') throw new Error('search');",
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn buffer_shim_round_trips_bytes() {
        run(
            "const b = Buffer.from('abc');\n\
             if (b.length !== 3 || b[0] !== 97) throw new Error('buffer bytes');",
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn fetch_is_installed() {
        run("if (typeof fetch !== 'function') throw new Error('fetch missing');")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn response_body_is_single_consumption() {
        run(
            "const r = __makeResponse({status: 200, status_text: 'OK', url: 'u', \
             headers: {'Content-Type': ['application/json']}, body: '{\"a\":1}'});\n\
             if (!r.ok) throw new Error('not ok');\n\
             if (r.headers.get('Content-Type') !== 'application/json') throw new Error('headers');\n\
             r.__takeBody();\n\
             let threw = false;\n\
             try { r.__takeBody(); } catch (e) { threw = true; \n\
               if (e.message !== 'body has already been consumed') throw e; }\n\
             if (!threw) throw new Error('second read did not fail');",
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn deadline_reports_timeout() {
        let engine = JavaScriptEngine::new();
        // Spin briefly so the abandoned VM thread exits on its own.
        let msg = message("const end = Date.now() + 2000; while (Date.now() < end) {}");
        let ctx = ExecContext::background().with_timeout(Duration::from_millis(100));

        let err = engine.execute(&ctx, &msg).await.unwrap_err();
        assert_eq!(err.code, codes::JS_EXECUTION_TIMEOUT);
    }

    #[tokio::test]
    async fn cancellation_wins_over_timeout_code() {
        let engine = JavaScriptEngine::new();
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let ctx = ExecContext::with_token(token);

        let msg = message("const end = Date.now() + 1000; while (Date.now() < end) {}");
        let err = engine.execute(&ctx, &msg).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
