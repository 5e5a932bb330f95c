use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use jobscript::{
    commander::{BasicQuotaChecker, ConcurrencyLimiter, IdempotencyTracker},
    config::{Config, SourceKind},
    context::ExecContext,
    cron::{CronManager, ScheduleSync, TokioScheduler},
    engines::{Engine, JavaScriptEngine, ShellEngine, SqlEngine},
    sources::{DbSourceProvider, FileSystemSourceProvider, SourceProvider},
    tasks::{MemoryRegistry, TaskCreator, TaskRunner},
};

#[derive(Parser)]
#[command(name = "jobscript")]
#[command(version)]
#[command(about = "Metadata-driven script job runner")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "jobscript.toml")]
    config: String,

    /// Log level filter (overrides RUST_LOG)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    /// Discover and register tasks, print them, then exit
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;

    sqlx::any::install_default_drivers();

    let provider = build_provider(&config).await?;

    let shell = ShellEngine::new()
        .with_shell(
            config.engines.shell.shell.clone(),
            config.engines.shell.args.clone(),
        )
        .with_environment(config.engines.shell.environment.clone())
        .with_source_provider(provider.clone());
    let shell = match &config.engines.shell.working_directory {
        Some(dir) => shell.with_working_directory(dir.to_string_lossy().into_owned()),
        None => shell,
    };

    let javascript = JavaScriptEngine::new()
        .with_fetch_timeout(config.engines.javascript.fetch_timeout)
        .with_source_provider(provider.clone());

    let mut sql = SqlEngine::new()
        .with_statement_boundary(config.engines.sql.statement_boundary.clone())
        .with_source_provider(provider.clone());
    if let Some(url) = &config.engines.sql.database_url {
        sql = sql.with_database_url(url.clone());
    }

    let engines: Vec<Arc<dyn Engine>> =
        vec![Arc::new(shell), Arc::new(javascript), Arc::new(sql)];

    let registry = Arc::new(MemoryRegistry::new());
    let creator = Arc::new(TaskCreator::new(provider, engines));
    let runner = TaskRunner::new()
        .with_registry(registry.clone())
        .with_creator(creator)
        .with_event_handler(Arc::new(|event| {
            info!(
                kind = event.kind.as_str(),
                task_id = %event.task_id,
                script_path = %event.script_path,
                error = event.error.as_deref(),
                "task event"
            );
        }));

    let shutdown = tokio_util::sync::CancellationToken::new();
    let ctx = ExecContext::with_token(shutdown.clone());

    runner.start(&ctx).await.context("task discovery failed")?;
    let tasks = runner.registered_tasks();
    info!(count = tasks.len(), "tasks registered");

    if cli.dry_run {
        for task in &tasks {
            println!(
                "{}\t{}\t{}",
                task.id(),
                task.script_type(),
                task.config().schedule
            );
        }
        return Ok(());
    }

    let scheduler = Arc::new(TokioScheduler::new());
    let manager = Arc::new(
        CronManager::new(registry, scheduler.clone())
            .with_idempotency_tracker(Arc::new(IdempotencyTracker::new()))
            .with_concurrency_limiter(Arc::new(ConcurrencyLimiter::new()))
            .with_quota_checker(Arc::new(BasicQuotaChecker {
                payload_size_limit: config.limits.payload_size_limit,
                max_retries: config.limits.max_retries,
            })),
    );

    if config.scheduler.enabled {
        // Every discovered task gets a schedule derived from its header.
        let definitions: Vec<_> = tasks
            .iter()
            .map(|task| {
                jobscript::cron::ScheduleDefinition::new(
                    task.id(),
                    task.config().schedule.clone(),
                    jobscript::model::ExecutionMessage::new(task.id()),
                )
            })
            .collect();
        let (result, err) = manager.reconcile(&ctx, &definitions);
        info!(
            added = result.added.len(),
            updated = result.updated.len(),
            removed = result.removed.len(),
            "initial schedules registered"
        );
        if let Some(e) = err {
            warn!(error = %e, "some schedules failed to register");
        }
    }

    let sync_task = config.scheduler.sync_file.as_ref().map(|path| {
        let sync = ScheduleSync::from_file(manager.clone(), path.clone())
            .with_expression(config.scheduler.sync_expression.clone());
        let sync_ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = sync.run(&sync_ctx).await {
                if !e.is_cancelled() {
                    warn!(error = %e, "schedule sync stopped");
                }
            }
        })
    });

    info!("jobscript running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("signal handler")?;

    info!("shutting down");
    shutdown.cancel();
    scheduler.shutdown();
    if let Some(task) = sync_task {
        let _ = task.await;
    }
    runner.stop();

    Ok(())
}

async fn build_provider(config: &Config) -> Result<Arc<dyn SourceProvider>> {
    match config.source.kind {
        SourceKind::Filesystem => {
            let mut provider = FileSystemSourceProvider::new(config.source.root.clone())
                .with_ignore_globs(config.source.ignore_globs.iter().map(String::as_str))
                .with_ignore_paths(config.source.ignore_paths.iter().map(String::as_str));
            if config.source.max_file_size > 0 {
                provider = provider.with_max_file_size(config.source.max_file_size);
            }
            Ok(Arc::new(provider))
        }
        SourceKind::Database => {
            let url = config
                .source
                .database_url
                .as_deref()
                .context("source.database_url is required for the database provider")?;
            let pool = sqlx::any::AnyPoolOptions::new()
                .connect(url)
                .await
                .context("connecting to script database")?;
            Ok(Arc::new(DbSourceProvider::new(
                pool,
                config.source.table.clone(),
            )))
        }
    }
}
