//! The hourly trigger, gated to a business-hours window in KST.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Timelike};
use ksa_core::{kst_now, RunOutcome};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

use crate::Pipeline;

/// Top of every hour.
pub(crate) const HOURLY_CRON: &str = "0 0 * * * *";

/// Time-of-day gate for scheduled runs, `[start_hour, end_hour)` in KST.
/// A window with `start_hour > end_hour` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BusinessHours {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            start_hour: 9,
            end_hour: 18,
        }
    }
}

impl BusinessHours {
    pub fn contains(&self, now: DateTime<FixedOffset>) -> bool {
        let hour = now.hour();
        if self.start_hour <= self.end_hour {
            self.start_hour <= hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub cron: String,
    pub window: BusinessHours,
    pub timezone: &'static str,
}

/// Owns the cron job that issues pipeline runs. Runs are serial by
/// construction: one job, each tick awaited to completion.
pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    window: BusinessHours,
    cron: String,
    inner: Mutex<Option<JobScheduler>>,
}

impl Scheduler {
    pub fn new(pipeline: Arc<Pipeline>, window: BusinessHours, cron: impl Into<String>) -> Self {
        Self {
            pipeline,
            window,
            cron: cron.into(),
            inner: Mutex::new(None),
        }
    }

    pub fn hourly(pipeline: Arc<Pipeline>, window: BusinessHours) -> Self {
        Self::new(pipeline, window, HOURLY_CRON)
    }

    /// Starts the cron job. Returns `false` when already running.
    pub async fn start(&self) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        if guard.is_some() {
            return Ok(false);
        }

        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = self.pipeline.clone();
        let window = self.window;
        let job = Job::new_async(self.cron.as_str(), move |_uuid, _lock| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                let now = kst_now();
                if !window.contains(now) {
                    debug!(hour = now.hour(), "outside the notification window, skipping run");
                    return;
                }
                let outcome = pipeline.check_and_notify().await;
                if outcome.success {
                    info!(new = outcome.new_announcements, "scheduled check finished");
                } else {
                    warn!(
                        message = %outcome.message,
                        errors = outcome.errors.len(),
                        "scheduled check reported errors"
                    );
                }
            })
        })
        .with_context(|| format!("creating check job for cron {}", self.cron))?;
        scheduler.add(job).await.context("adding check job")?;
        scheduler.start().await.context("starting scheduler")?;

        *guard = Some(scheduler);
        info!(cron = %self.cron, "scheduler started");
        Ok(true)
    }

    /// Stops the cron job. Returns `false` when not running.
    pub async fn stop(&self) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        match guard.take() {
            Some(mut scheduler) => {
                scheduler.shutdown().await.context("shutting scheduler down")?;
                info!("scheduler stopped");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.inner.lock().await.is_some(),
            cron: self.cron.clone(),
            window: self.window,
            timezone: "UTC+09:00",
        }
    }

    /// Immediate manual run, bypassing the window gate.
    pub async fn run_once(&self) -> RunOutcome {
        self.pipeline.check_and_notify().await
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use ksa_core::kst;

    use super::*;

    fn at_hour(hour: u32) -> DateTime<FixedOffset> {
        kst().with_ymd_and_hms(2026, 8, 7, hour, 15, 0).unwrap()
    }

    #[test]
    fn daytime_window_is_half_open() {
        let window = BusinessHours::default();
        assert!(!window.contains(at_hour(8)));
        assert!(window.contains(at_hour(9)));
        assert!(window.contains(at_hour(17)));
        assert!(!window.contains(at_hour(18)));
        assert!(!window.contains(at_hour(23)));
    }

    #[test]
    fn overnight_window_wraps_past_midnight() {
        let window = BusinessHours {
            start_hour: 22,
            end_hour: 6,
        };
        assert!(window.contains(at_hour(23)));
        assert!(window.contains(at_hour(2)));
        assert!(!window.contains(at_hour(6)));
        assert!(!window.contains(at_hour(12)));
    }
}
