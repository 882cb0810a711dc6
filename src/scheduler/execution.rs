//! Task Executions - one run of a task and its retries
//!
//! # State Machine
//!
//! ```text
//! Pending ──▶ Running ──▶ Completed
//!                │  ▲
//!                ▼  │
//!              Failed ──▶ Retrying
//!
//! any non-terminal state ──▶ Cancelled
//! ```
//!
//! `Failed` is terminal once retries are exhausted.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl TaskStatus {
    /// Counted against `max_concurrent`
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Running | TaskStatus::Retrying
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Retrying)
                | (Retrying, Running)
                | (Pending | Running | Retrying, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dispatched run of a task
#[derive(Debug, Clone, Serialize)]
pub struct TaskExecution {
    pub id: Uuid,
    pub task_id: String,
    pub status: TaskStatus,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall time from first start to the terminal state
    pub duration: Option<Duration>,
    pub retry_count: u32,
    pub error: Option<String>,
    pub result: Option<Value>,
    pub context: HashMap<String, Value>,
}

impl TaskExecution {
    pub fn new(task_id: impl Into<String>, context: HashMap<String, Value>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            duration: None,
            retry_count: 0,
            error: None,
            result: None,
            context,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !self.status.is_live()
            && !(self.status == TaskStatus::Failed && self.completed_at.is_none())
    }

    fn transition(&mut self, next: TaskStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.completed_at = Some(now);
        self.duration = self
            .started_at
            .and_then(|started| (now - started).to_std().ok());
    }

    /// Pending or Retrying to Running
    pub fn start(&mut self, now: DateTime<Utc>) -> bool {
        if !self.transition(TaskStatus::Running) {
            return false;
        }
        self.started_at.get_or_insert(now);
        true
    }

    pub fn complete(&mut self, result: Value, now: DateTime<Utc>) -> bool {
        if !self.transition(TaskStatus::Completed) {
            return false;
        }
        self.result = Some(result);
        self.error = None;
        self.finish(now);
        true
    }

    /// Record a failed attempt
    ///
    /// With `retry` set the execution moves on to Retrying, otherwise the
    /// failure is terminal.
    pub fn fail(&mut self, error: impl Into<String>, retry: bool, now: DateTime<Utc>) -> bool {
        if !self.transition(TaskStatus::Failed) {
            return false;
        }
        self.error = Some(error.into());
        if retry {
            self.transition(TaskStatus::Retrying);
            self.retry_count += 1;
        } else {
            self.finish(now);
        }
        true
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if !self.transition(TaskStatus::Cancelled) {
            return false;
        }
        self.finish(now);
        true
    }

    /// Total attempts made so far
    pub fn attempts(&self) -> u32 {
        match self.status {
            TaskStatus::Pending => 0,
            TaskStatus::Retrying => self.retry_count,
            _ => self.retry_count + 1,
        }
    }
}
