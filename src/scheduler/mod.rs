//! Task Scheduling - recurring and on-demand units of work
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      TaskScheduler                          │
//! │                                                             │
//! │  tick loop ──▶ due schedules (by priority)                  │
//! │                   │                                         │
//! │                   ▼                                         │
//! │          dependency gate ──▶ concurrency gate ──▶ dispatch   │
//! │                                                   │         │
//! │                             TaskTracker ◀─────────┘         │
//! │                 (timeout, retries, cancellation)            │
//! └────────────────────────────────────────────────────────────┘
//! ```

mod dependency;
mod engine;
mod execution;
mod schedule;
mod task;

pub use dependency::{find_cycle, validate_graph};
pub use engine::{ExecutionStats, SchedulerConfig, SchedulerStats, TaskScheduler, TickReport};
pub use execution::{TaskExecution, TaskStatus};
pub use schedule::{Recurrence, ScheduleSnapshot, TaskSchedule};
pub use task::{
    task_fn, FnTask, TaskContext, TaskDefinition, TaskPriority, TaskWork, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_DELAY, DEFAULT_TIMEOUT,
};
