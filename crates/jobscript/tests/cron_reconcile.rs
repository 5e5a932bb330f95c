//! Cron manager scenarios: declarative reconciliation over discovered
//! tasks, with the in-process scheduler actually firing handlers.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use jobscript::context::ExecContext;
use jobscript::cron::{CronManager, ScheduleDefinition, ScheduleSync, TokioScheduler};
use jobscript::engines::{Engine, ShellEngine};
use jobscript::model::ExecutionMessage;
use jobscript::sources::{FileSystemSourceProvider, SourceProvider};
use jobscript::tasks::{MemoryRegistry, TaskCreator, TaskRunner};
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    manager: Arc<CronManager>,
    scheduler: Arc<TokioScheduler>,
    marker: PathBuf,
}

async fn harness(scripts: &[(&str, &str)]) -> Harness {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("marker.log");
    for (name, content) in scripts {
        let content = content.replace("{MARKER}", &marker.display().to_string());
        fs::write(dir.path().join(name), content).unwrap();
    }

    let provider: Arc<dyn SourceProvider> = Arc::new(
        FileSystemSourceProvider::new(dir.path()).with_ignore_globs(["*.log"]),
    );
    let shell: Arc<dyn Engine> =
        Arc::new(ShellEngine::new().with_source_provider(provider.clone()));

    let registry = Arc::new(MemoryRegistry::new());
    let runner = TaskRunner::new()
        .with_registry(registry.clone())
        .with_creator(Arc::new(TaskCreator::new(provider, vec![shell])));
    runner.start(&ExecContext::background()).await.unwrap();

    let scheduler = Arc::new(TokioScheduler::new());
    let manager = Arc::new(CronManager::new(registry, scheduler.clone()));

    Harness {
        _dir: dir,
        manager,
        scheduler,
        marker,
    }
}

fn marker_lines(path: &Path) -> usize {
    fs::read_to_string(path)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

fn definition(id: &str, expression: &str, job_id: &str) -> ScheduleDefinition {
    ScheduleDefinition::new(id, expression, ExecutionMessage::new(job_id))
}

#[tokio::test]
async fn reconcile_applies_add_update_remove_in_sequence() {
    let h = harness(&[("job.sh", "exit 0")]).await;
    let ctx = ExecContext::background();

    // Initial state: A at hourly.
    h.manager
        .register(&ctx, &definition("A", "0 * * * *", "job.sh"))
        .unwrap();

    // Desired: A every 30 minutes, B at 01:30.
    let desired = vec![
        definition("A", "*/30 * * * *", "job.sh"),
        definition("B", "30 1 * * *", "job.sh"),
    ];
    let (result, err) = h.manager.reconcile(&ctx, &desired);
    assert!(err.is_none());
    assert_eq!(result.added, vec!["B".to_string()]);
    assert_eq!(result.updated, vec!["A".to_string()]);
    assert!(result.removed.is_empty());

    // Desired: only B remains.
    let desired = vec![definition("B", "30 1 * * *", "job.sh")];
    let (result, err) = h.manager.reconcile(&ctx, &desired);
    assert!(err.is_none());
    assert!(result.added.is_empty());
    assert!(result.updated.is_empty());
    assert_eq!(result.removed, vec!["A".to_string()]);

    let listed = h.manager.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "B");

    h.scheduler.shutdown();
}

#[tokio::test]
async fn scheduled_tasks_actually_fire() {
    let h = harness(&[(
        "tick.sh",
        "# config\necho tick >> {MARKER}\n",
    )])
    .await;
    let ctx = ExecContext::background();

    h.manager
        .register(&ctx, &definition("ticker", "@every 60ms", "tick.sh"))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    h.scheduler.shutdown();

    let fired = marker_lines(&h.marker);
    assert!(fired >= 2, "expected at least two fires, got {fired}");
}

#[tokio::test]
async fn deleted_schedules_stop_firing() {
    let h = harness(&[(
        "tick.sh",
        "# config\necho tick >> {MARKER}\n",
    )])
    .await;
    let ctx = ExecContext::background();

    h.manager
        .register(&ctx, &definition("ticker", "@every 50ms", "tick.sh"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.manager.delete(&ctx, "ticker").unwrap();

    // Give in-flight work a moment, then measure.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after_delete = marker_lines(&h.marker);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(marker_lines(&h.marker), after_delete);

    h.scheduler.shutdown();
}

#[tokio::test]
async fn schedule_sync_reconciles_from_a_file() {
    let h = harness(&[("job.sh", "exit 0")]).await;
    let ctx = ExecContext::background();

    let schedules = h._dir.path().join("schedules.yaml");
    fs::write(
        &schedules,
        "- id: from-file\n  expression: \"0 3 * * *\"\n  message:\n    job_id: job.sh\n",
    )
    .unwrap();

    let sync = ScheduleSync::from_file(h.manager.clone(), schedules.clone());
    let (result, err) = sync.sync(&ctx).await;
    assert!(err.is_none());
    assert_eq!(result.added, vec!["from-file".to_string()]);

    // A second pass is a no-op.
    let (result, err) = sync.sync(&ctx).await;
    assert!(err.is_none());
    assert!(result.is_noop());

    h.scheduler.shutdown();
}

#[tokio::test]
async fn schedule_expression_overrides_task_header() {
    let h = harness(&[(
        "job.sh",
        "# config\n# schedule: \"*/5 * * * *\"\nexit 0\n",
    )])
    .await;
    let ctx = ExecContext::background();

    h.manager
        .register(&ctx, &definition("override", "15 4 * * *", "job.sh"))
        .unwrap();

    let listed = h.manager.list();
    assert_eq!(listed[0].expression, "15 4 * * *");
    assert_eq!(listed[0].message.config.schedule, "15 4 * * *");

    h.scheduler.shutdown();
}
