//! Cron expression parsing and next-run evaluation
//!
//! Job headers use classic 5-field cron expressions plus the `@hourly`
//! family and `@every <duration>` intervals. The `cron` crate wants a
//! seconds field, so 5-field expressions get a `0` prepended before
//! parsing.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::errors::{codes, JobError, JobResult};
use crate::model::JobConfig;

/// A parsed schedule: either a cron expression or a fixed interval.
#[derive(Debug, Clone)]
pub enum CronSpec {
    Cron(Box<Schedule>),
    Every(Duration),
}

impl CronSpec {
    /// The next fire time strictly after `after`, when one exists.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            CronSpec::Cron(schedule) => schedule.after(&after).next(),
            CronSpec::Every(interval) => {
                chrono::Duration::from_std(*interval)
                    .ok()
                    .map(|d| after + d)
            }
        }
    }
}

/// Parse a schedule expression into a [`CronSpec`].
pub fn parse_expression(expression: &str) -> JobResult<CronSpec> {
    let expression = expression.trim();
    if expression.is_empty() {
        return Err(JobError::bad_input(
            codes::SCHEDULE_ERROR,
            "cron expression cannot be empty",
        ));
    }

    if let Some(rest) = expression.strip_prefix("@every ") {
        let interval = humantime::parse_duration(rest.trim()).map_err(|e| {
            JobError::bad_input(
                codes::SCHEDULE_ERROR,
                format!("invalid @every interval {rest:?}"),
            )
            .with_source(e)
        })?;
        if interval.is_zero() {
            return Err(JobError::bad_input(
                codes::SCHEDULE_ERROR,
                "@every interval must be positive",
            ));
        }
        return Ok(CronSpec::Every(interval));
    }

    let normalized = normalize_fields(expression);
    let schedule = Schedule::from_str(&normalized).map_err(|e| {
        JobError::bad_input(
            codes::SCHEDULE_ERROR,
            format!("failed to parse cron expression {expression:?}"),
        )
        .with_source(e)
    })?;
    Ok(CronSpec::Cron(Box::new(schedule)))
}

/// The next execution time for an expression after `after`. `None` means
/// the schedule has no future fires.
pub fn next_run(expression: &str, after: DateTime<Utc>) -> JobResult<Option<DateTime<Utc>>> {
    Ok(parse_expression(expression)?.next_after(after))
}

/// Classic 5-field expressions gain a `0` seconds field; descriptors and
/// 6/7-field expressions pass through untouched.
fn normalize_fields(expression: &str) -> String {
    if expression.starts_with('@') {
        return expression.to_string();
    }
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

/// Scheduling semantics summarized from a job config.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSchedule {
    pub expression: String,
    pub run_once: bool,
    pub max_retries: u32,
    pub timeout: Option<Duration>,
}

impl TaskSchedule {
    pub fn from_config(config: &JobConfig) -> Self {
        let expression = if config.schedule.is_empty() {
            crate::model::DEFAULT_SCHEDULE.to_string()
        } else {
            config.schedule.clone()
        };

        Self {
            expression,
            run_once: config.run_once,
            max_retries: config.retries,
            timeout: config.effective_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expressions_are_accepted() {
        let after = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 30).unwrap();
        let next = next_run("*/5 * * * *", after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2030, 1, 1, 0, 5, 0).unwrap());
    }

    #[test]
    fn six_field_expressions_pass_through() {
        let after = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let next = next_run("30 * * * * *", after).unwrap().unwrap();
        assert_eq!(next.timestamp() % 60, 30);
    }

    #[test]
    fn descriptors_are_supported() {
        let after = Utc.with_ymd_and_hms(2030, 1, 1, 5, 30, 0).unwrap();
        let next = next_run("@hourly", after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2030, 1, 1, 6, 0, 0).unwrap());

        let next = next_run("@daily", after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2030, 1, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn every_intervals_add_to_the_base_time() {
        let after = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let next = next_run("@every 5m", after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2030, 1, 1, 0, 5, 0).unwrap());
    }

    #[test]
    fn invalid_expressions_error() {
        assert!(next_run("", Utc::now()).is_err());
        assert!(next_run("not a cron", Utc::now()).is_err());
        assert!(next_run("@every soon", Utc::now()).is_err());
    }

    #[test]
    fn task_schedule_summarizes_config() {
        let config = JobConfig {
            schedule: "0 12 * * *".to_string(),
            retries: 2,
            run_once: true,
            timeout: Some(Duration::from_secs(90)),
            ..Default::default()
        };
        let schedule = TaskSchedule::from_config(&config);
        assert_eq!(schedule.expression, "0 12 * * *");
        assert!(schedule.run_once);
        assert_eq!(schedule.max_retries, 2);
        assert_eq!(schedule.timeout, Some(Duration::from_secs(90)));

        // Empty schedule falls back to the default; no_timeout suppresses
        // the timeout.
        let config = JobConfig {
            no_timeout: true,
            ..Default::default()
        };
        let schedule = TaskSchedule::from_config(&config);
        assert_eq!(schedule.expression, crate::model::DEFAULT_SCHEDULE);
        assert_eq!(schedule.timeout, None);
    }
}
