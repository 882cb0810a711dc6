//! Recurrence Rules and Schedules

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;

use crate::error::{Error, Result};

/// When a task repeats
#[derive(Debug, Clone)]
pub enum Recurrence {
    /// Fixed period, measured from the previous dispatch
    Interval(Duration),
    /// Cron expression with a seconds field, e.g. `0 0 3 * * *`
    Cron(Box<Schedule>),
}

impl Recurrence {
    pub fn every(period: Duration) -> Result<Self> {
        if period.is_zero() {
            return Err(Error::InvalidSchedule {
                expr: format!("{:?}", period),
                reason: "interval must be positive".to_string(),
            });
        }
        Ok(Recurrence::Interval(period))
    }

    pub fn every_secs(seconds: u64) -> Result<Self> {
        Self::every(Duration::from_secs(seconds))
    }

    pub fn cron(expr: &str) -> Result<Self> {
        let schedule = Schedule::from_str(expr).map_err(|e| Error::InvalidSchedule {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Recurrence::Cron(Box::new(schedule)))
    }

    /// First run time strictly after `from`, `None` when the rule is exhausted
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Recurrence::Interval(period) => {
                chrono::Duration::from_std(*period).ok().map(|p| from + p)
            }
            Recurrence::Cron(schedule) => schedule.after(&from).next(),
        }
    }

    /// First run time for a freshly attached schedule
    ///
    /// Intervals are due immediately; cron rules wait for their next match.
    pub fn first_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Recurrence::Interval(_) => Some(now),
            Recurrence::Cron(schedule) => schedule.after(&now).next(),
        }
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recurrence::Interval(period) => write!(f, "every {}s", period.as_secs_f64()),
            Recurrence::Cron(schedule) => write!(f, "cron {}", schedule),
        }
    }
}

/// A recurrence attached to a registered task
#[derive(Debug, Clone)]
pub struct TaskSchedule {
    pub task_id: String,
    pub recurrence: Recurrence,
    pub next_run: DateTime<Utc>,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub max_concurrent: usize,
}

impl TaskSchedule {
    pub fn new(
        task_id: impl Into<String>,
        recurrence: Recurrence,
        max_concurrent: usize,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let task_id = task_id.into();
        let next_run = recurrence
            .first_run(now)
            .ok_or_else(|| Error::InvalidSchedule {
                expr: recurrence.to_string(),
                reason: "no upcoming run time".to_string(),
            })?;

        Ok(Self {
            task_id,
            recurrence,
            next_run,
            enabled: true,
            last_run: None,
            max_concurrent: max_concurrent.max(1),
        })
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run <= now
    }

    /// Advance after a dispatch; an exhausted rule disables the schedule
    pub fn mark_dispatched(&mut self, now: DateTime<Utc>) {
        self.last_run = Some(now);
        match self.recurrence.next_after(now) {
            Some(next) => self.next_run = next,
            None => self.enabled = false,
        }
    }

    pub fn snapshot(&self) -> ScheduleSnapshot {
        ScheduleSnapshot {
            task_id: self.task_id.clone(),
            recurrence: self.recurrence.to_string(),
            next_run: self.next_run,
            last_run: self.last_run,
            enabled: self.enabled,
            max_concurrent: self.max_concurrent,
        }
    }
}

/// Serializable view of a schedule
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleSnapshot {
    pub task_id: String,
    pub recurrence: String,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub max_concurrent: usize,
}
