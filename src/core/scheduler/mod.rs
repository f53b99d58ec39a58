//! Unattended agent runs.
//!
//! One ticking loop scans enabled schedules and dispatches each due one as an
//! independent task. A compare-and-set on `last_run_at` claims the window, so
//! overlapping ticks (or several processes sharing the database) cannot fire
//! the same window twice.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::core::agent::Runtime;
use crate::core::memory::types::ScheduleRecord;

/// What to do with a due window that is older than the misfire grace, e.g.
/// after downtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchUpPolicy {
    /// Mark the window as handled and log it.
    #[default]
    Skip,
    /// Run once for all missed windows.
    RunOnce,
}

/// Where a schedule stands at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Due {
    NotDue,
    Fresh(DateTime<Utc>),
    Stale(DateTime<Utc>),
}

/// Evaluate a parsed trigger against its anchor (`last_run_at`, or
/// `created_at` for a schedule that never ran).
pub fn due_state(
    trigger: &cron::Schedule,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
    grace: chrono::Duration,
) -> Due {
    let Some(first) = trigger.after(&anchor).next() else {
        return Due::NotDue;
    };
    if first > now {
        return Due::NotDue;
    }
    // Any fire inside the grace window makes this a regular run.
    match trigger.after(&(now - grace)).next() {
        Some(recent) if recent <= now => Due::Fresh(recent),
        _ => Due::Stale(first),
    }
}

pub struct Dispatched {
    pub schedule_id: String,
    pub handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct TickReport {
    pub dispatched: Vec<Dispatched>,
    pub skipped: Vec<String>,
    pub invalid: Vec<String>,
}

impl TickReport {
    /// Wait for every run dispatched by this tick.
    pub async fn join(self) {
        for run in self.dispatched {
            if let Err(e) = run.handle.await {
                error!(schedule = %run.schedule_id, "Scheduled run panicked: {}", e);
            }
        }
    }
}

pub struct Scheduler {
    runtime: Arc<Runtime>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(runtime: Arc<Runtime>, config: SchedulerConfig) -> Self {
        Self { runtime, config }
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let schedules = self.runtime.memory().list_enabled_schedules().await?;
        let grace = self.config.misfire_grace();
        let mut report = TickReport::default();

        for schedule in schedules {
            let trigger = match cron::Schedule::from_str(&schedule.trigger_spec) {
                Ok(t) => t,
                Err(e) => {
                    warn!(
                        schedule = %schedule.id,
                        trigger = %schedule.trigger_spec,
                        "Invalid trigger spec: {}", e
                    );
                    report.invalid.push(schedule.id);
                    continue;
                }
            };

            let anchor = schedule.last_run_at.unwrap_or(schedule.created_at);
            let run = match due_state(&trigger, anchor, now, grace) {
                Due::NotDue => continue,
                Due::Fresh(_) => true,
                Due::Stale(missed) => {
                    if self.config.catch_up == CatchUpPolicy::Skip {
                        info!(
                            schedule = %schedule.id,
                            missed = %missed,
                            "Skipping missed schedule window"
                        );
                    }
                    self.config.catch_up == CatchUpPolicy::RunOnce
                }
            };

            match self
                .runtime
                .memory()
                .claim_schedule_run(&schedule.id, schedule.last_run_at, now)
                .await
            {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!(schedule = %schedule.id, "Failed to claim schedule run: {}", e);
                    continue;
                }
            }

            if !run {
                report.skipped.push(schedule.id);
                continue;
            }

            let schedule_id = schedule.id.clone();
            let runtime = self.runtime.clone();
            let config = self.config.clone();
            let handle = tokio::spawn(async move {
                execute(runtime, config, schedule).await;
            });
            report.dispatched.push(Dispatched {
                schedule_id,
                handle,
            });
        }

        Ok(report)
    }
}

async fn execute(runtime: Arc<Runtime>, config: SchedulerConfig, schedule: ScheduleRecord) {
    info!(
        schedule = %schedule.id,
        agent = %schedule.agent_name,
        user = %schedule.user_id,
        "Running scheduled invocation"
    );

    let outcome = tokio::time::timeout(
        config.job_timeout(),
        runtime.run_scheduled(&schedule.user_id, &schedule.agent_name, &schedule.prompt),
    )
    .await;

    let (success, status, payload) = match outcome {
        Ok(Ok(response)) => (true, "ok", response.output),
        Ok(Err(e)) => {
            error!(schedule = %schedule.id, "Scheduled invocation failed: {}", e);
            (false, "error", e.user_message())
        }
        Err(_) => {
            error!(
                schedule = %schedule.id,
                timeout_secs = config.job_timeout_secs,
                "Scheduled invocation timed out"
            );
            (
                false,
                "timeout",
                format!("Timed out after {} seconds.", config.job_timeout_secs),
            )
        }
    };

    let memory = runtime.memory();
    if let Err(e) = memory
        .insert_scheduled_result(&schedule, success, &payload, Utc::now())
        .await
    {
        error!(schedule = %schedule.id, "Failed to store scheduled result: {}", e);
    }

    match memory
        .record_schedule_outcome(&schedule.id, status, success, config.max_consecutive_errors)
        .await
    {
        Ok((errors, true)) => warn!(
            schedule = %schedule.id,
            consecutive_errors = errors,
            "Schedule disabled after repeated failures"
        ),
        Ok(_) => {}
        Err(e) => error!(schedule = %schedule.id, "Failed to record schedule outcome: {}", e),
    }
}
