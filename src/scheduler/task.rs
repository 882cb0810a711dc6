//! Task Definitions and Units of Work

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default attempt timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default retries after the first failure
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default wait between attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Dispatch priority; due tasks are evaluated highest first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Normal => write!(f, "normal"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Critical => write!(f, "critical"),
        }
    }
}

/// Everything a unit of work gets to see about its run
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub execution_id: Uuid,
    pub task_id: String,
    /// Zero on the first attempt
    pub attempt: u32,
    /// Caller-supplied data from `run_now`
    pub data: HashMap<String, Value>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(
        execution_id: Uuid,
        task_id: impl Into<String>,
        attempt: u32,
        data: HashMap<String, Value>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            execution_id,
            task_id: task_id.into(),
            attempt,
            data,
            cancel,
        }
    }

    /// Token cancelled when the scheduler stops
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

/// A unit of work the scheduler can run
///
/// Errors are recorded on the execution and drive the retry policy.
#[async_trait]
pub trait TaskWork: Send + Sync {
    async fn execute(&self, ctx: TaskContext) -> anyhow::Result<Value>;
}

/// Adapter turning an async closure into a [`TaskWork`]
pub struct FnTask<F>(F);

#[async_trait]
impl<F, Fut> TaskWork for FnTask<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn execute(&self, ctx: TaskContext) -> anyhow::Result<Value> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as shareable work
pub fn task_fn<F, Fut>(f: F) -> Arc<dyn TaskWork>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnTask(f))
}

/// Static description of a task
#[derive(Clone)]
pub struct TaskDefinition {
    pub id: String,
    pub name: String,
    pub priority: TaskPriority,
    pub work: Arc<dyn TaskWork>,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
    pub depends_on: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl TaskDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, work: Arc<dyn TaskWork>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            priority: TaskPriority::Normal,
            work,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            timeout: DEFAULT_TIMEOUT,
            depends_on: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.depends_on.push(task_id.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("timeout", &self.timeout)
            .field("depends_on", &self.depends_on)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}
