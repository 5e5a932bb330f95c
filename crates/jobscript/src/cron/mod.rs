//! Cron-driven schedule management
//!
//! [`CronManager`] reconciles declarative [`ScheduleDefinition`]s against a
//! [`Scheduler`], the external time-driven collaborator that actually
//! fires handlers. [`TokioScheduler`] is the in-process default.
//! [`ScheduleSync`] keeps the manager aligned with an external source of
//! definitions on its own cadence.

mod definition;
mod manager;
mod schedule;
mod scheduler;
mod sync;

pub use definition::{ReconcileResult, ScheduleDefinition};
pub use manager::CronManager;
pub use schedule::{next_run, parse_expression, CronSpec, TaskSchedule};
pub use scheduler::{JobHandler, Scheduler, SchedulerSubscription, TokioScheduler};
pub use sync::{
    load_schedules_from_file, ScheduleLoader, ScheduleSync, DEFAULT_SYNC_EXPRESSION,
};
