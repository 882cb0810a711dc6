//! Task Scheduler - the dispatch state machine
//!
//! Holds definitions, schedules and execution history, and runs a
//! cooperative tick loop that dispatches due tasks.
//!
//! # Guarantees
//!
//! 1. A dispatch is admitted only when every dependency completed within the
//!    recency window
//! 2. The live-execution count and the new Pending record are checked and
//!    written under one lock, so `max_concurrent` is never exceeded
//! 3. A failing task makes exactly `max_retries + 1` attempts
//! 4. `stop()` returns only after every in-flight execution has unwound

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::dependency::validate_graph;
use super::execution::{TaskExecution, TaskStatus};
use super::schedule::{Recurrence, ScheduleSnapshot, TaskSchedule};
use super::task::{
    TaskContext, TaskDefinition, TaskPriority, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY,
    DEFAULT_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::telemetry;

// =============================================================================
// Configuration
// =============================================================================

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sleep between loop evaluations
    pub tick_interval: Duration,
    /// Sleep after a tick that failed unexpectedly
    pub error_backoff: Duration,
    /// How recent a dependency's completion must be
    pub dependency_window: Duration,
    /// Terminal executions older than this are dropped
    pub history_retention: Duration,
    /// Upper bound on retained executions
    pub max_history: usize,
    /// Defaults applied by task catalogues
    pub default_timeout: Duration,
    pub default_max_retries: u32,
    pub default_retry_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            error_backoff: Duration::from_secs(60),
            dependency_window: Duration::from_secs(60 * 60),
            history_retention: Duration::from_secs(24 * 60 * 60),
            max_history: 1000,
            default_timeout: DEFAULT_TIMEOUT,
            default_max_retries: DEFAULT_MAX_RETRIES,
            default_retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

// =============================================================================
// Reports and Statistics
// =============================================================================

/// Outcome of one loop evaluation
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    /// Enabled schedules whose next run had arrived
    pub due: usize,
    /// (task id, execution id) per dispatch, highest priority first
    pub dispatched: Vec<(String, Uuid)>,
    /// Skipped until a dependency completes
    pub waiting_on_dependencies: Vec<String>,
    /// Skipped because `max_concurrent` executions are live
    pub at_capacity: Vec<String>,
    /// Executions dropped from history
    pub pruned: usize,
}

/// Rolling totals over finished executions
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionStats {
    pub tasks_executed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub total_execution_time: Duration,
    pub average_execution_time: Duration,
}

impl ExecutionStats {
    fn record_success(&mut self, duration: Option<Duration>) {
        self.tasks_executed += 1;
        if let Some(duration) = duration {
            self.total_execution_time += duration;
        }
        self.average_execution_time = self
            .total_execution_time
            .checked_div(self.tasks_executed as u32)
            .unwrap_or_default();
    }
}

/// Scheduler snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub is_running: bool,
    pub registered_tasks: usize,
    pub scheduled_tasks: usize,
    /// Executions in Pending, Running or Retrying
    pub running_executions: usize,
    /// Retained executions dispatched within the dependency window
    pub recent_executions: usize,
    /// Dispatches since the scheduler was created
    pub total_executions: u64,
    pub aggregate: ExecutionStats,
}

// =============================================================================
// Internal State
// =============================================================================

#[derive(Default)]
struct Registry {
    definitions: HashMap<String, TaskDefinition>,
    schedules: HashMap<String, TaskSchedule>,
    executions: HashMap<Uuid, TaskExecution>,
    /// Execution ids in dispatch order
    history: VecDeque<Uuid>,
    totals: ExecutionStats,
}

enum Admission {
    Admitted(TaskDefinition, Uuid),
    WaitingOn(String),
    AtCapacity,
}

impl Registry {
    fn live_count(&self, task_id: &str) -> usize {
        self.executions
            .values()
            .filter(|e| e.task_id == task_id && e.status.is_live())
            .count()
    }

    fn live_total(&self) -> usize {
        self.executions.values().filter(|e| e.status.is_live()).count()
    }

    fn completed_since(&self, task_id: &str, cutoff: DateTime<Utc>) -> bool {
        self.executions.values().any(|e| {
            e.task_id == task_id
                && e.status == TaskStatus::Completed
                && e.completed_at.is_some_and(|at| at >= cutoff)
        })
    }

    /// Gate checks and the Pending insert happen under the caller's write lock
    fn admit(
        &mut self,
        task_id: &str,
        context: HashMap<String, Value>,
        dependency_cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Admission> {
        let definition = self
            .definitions
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;

        if let Some(missing) = definition
            .depends_on
            .iter()
            .find(|dep| !self.completed_since(dep, dependency_cutoff))
        {
            return Ok(Admission::WaitingOn(missing.clone()));
        }

        let max_concurrent = self
            .schedules
            .get(task_id)
            .map_or(1, |schedule| schedule.max_concurrent);
        if self.live_count(task_id) >= max_concurrent {
            return Ok(Admission::AtCapacity);
        }

        let execution = TaskExecution::new(task_id, context, now);
        let id = execution.id;
        self.executions.insert(id, execution);
        self.history.push_back(id);
        Ok(Admission::Admitted(definition, id))
    }

    /// Drop old terminal executions, then enforce the size cap
    fn prune(&mut self, retention_cutoff: DateTime<Utc>, max_history: usize) -> usize {
        let before = self.executions.len();
        let executions = &mut self.executions;

        self.history.retain(|id| {
            let expired = executions.get(id).map_or(true, |e| {
                e.is_terminal() && e.completed_at.is_some_and(|at| at < retention_cutoff)
            });
            if expired {
                executions.remove(id);
            }
            !expired
        });

        let mut excess = executions.len().saturating_sub(max_history);
        if excess > 0 {
            self.history.retain(|id| {
                if excess == 0 {
                    return true;
                }
                let terminal = executions.get(id).map_or(true, TaskExecution::is_terminal);
                if terminal {
                    executions.remove(id);
                    excess -= 1;
                }
                !terminal
            });
        }

        before - self.executions.len()
    }
}

struct Inner {
    config: SchedulerConfig,
    state: RwLock<Registry>,
    /// Root token; replaced on each start
    cancel: Mutex<CancellationToken>,
    tracker: TaskTracker,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    dispatched: AtomicU64,
}

enum AttemptOutcome {
    Completed(Value),
    Failed(String),
    Cancelled,
}

// =============================================================================
// Task Scheduler
// =============================================================================

/// The task scheduler
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: RwLock::new(Registry::default()),
                cancel: Mutex::new(CancellationToken::new()),
                tracker: TaskTracker::new(),
                loop_handle: Mutex::new(None),
                running: AtomicBool::new(false),
                dispatched: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Register a definition; a duplicate id is ignored and returns false
    pub fn register(&self, definition: TaskDefinition) -> bool {
        let mut state = self.inner.state.write();
        if state.definitions.contains_key(&definition.id) {
            warn!(task = %definition.id, "Task already registered, ignoring");
            return false;
        }
        info!(
            task = %definition.id,
            priority = %definition.priority,
            depends_on = ?definition.depends_on,
            "Registered task"
        );
        state.definitions.insert(definition.id.clone(), definition);
        true
    }

    /// Attach (or replace) a task's recurrence
    pub fn schedule(&self, task_id: &str, recurrence: Recurrence, max_concurrent: usize) -> Result<()> {
        let mut state = self.inner.state.write();
        if !state.definitions.contains_key(task_id) {
            return Err(Error::TaskNotFound(task_id.to_string()));
        }
        let schedule = TaskSchedule::new(task_id, recurrence, max_concurrent, Utc::now())?;
        info!(task = task_id, recurrence = %schedule.recurrence, next_run = %schedule.next_run, "Scheduled task");
        state.schedules.insert(task_id.to_string(), schedule);
        Ok(())
    }

    /// Pause or resume a schedule
    pub fn set_enabled(&self, task_id: &str, enabled: bool) -> Result<()> {
        let mut state = self.inner.state.write();
        let schedule = state
            .schedules
            .get_mut(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        schedule.enabled = enabled;
        info!(task = task_id, enabled, "Schedule toggled");
        Ok(())
    }

    /// Check that dependencies are registered and acyclic
    pub fn validate(&self) -> Result<()> {
        let graph: HashMap<String, Vec<String>> = self
            .inner
            .state
            .read()
            .definitions
            .values()
            .map(|d| (d.id.clone(), d.depends_on.clone()))
            .collect();
        validate_graph(&graph)
    }

    /// Dispatch immediately, subject to the dependency and concurrency gates
    ///
    /// Returns `Ok(None)` when a gate refuses. Must be called within a Tokio
    /// runtime.
    #[instrument(skip(self, context))]
    pub fn run_now(&self, task_id: &str, context: HashMap<String, Value>) -> Result<Option<Uuid>> {
        let now = Utc::now();
        let admission = self
            .inner
            .state
            .write()
            .admit(task_id, context, self.dependency_cutoff(now), now)?;

        match admission {
            Admission::Admitted(definition, id) => {
                self.spawn_execution(definition, id);
                Ok(Some(id))
            }
            Admission::WaitingOn(dependency) => {
                info!(task = task_id, dependency = %dependency, "Manual run refused, dependency not satisfied");
                Ok(None)
            }
            Admission::AtCapacity => {
                info!(task = task_id, "Manual run refused, task at capacity");
                Ok(None)
            }
        }
    }

    pub fn status(&self, execution_id: Uuid) -> Option<TaskExecution> {
        self.inner.state.read().executions.get(&execution_id).cloned()
    }

    /// Retained executions of one task, oldest first
    pub fn executions_for(&self, task_id: &str) -> Vec<TaskExecution> {
        let state = self.inner.state.read();
        state
            .history
            .iter()
            .filter_map(|id| state.executions.get(id))
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }

    pub fn schedules(&self) -> Vec<ScheduleSnapshot> {
        let state = self.inner.state.read();
        let mut snapshots: Vec<ScheduleSnapshot> =
            state.schedules.values().map(TaskSchedule::snapshot).collect();
        snapshots.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        snapshots
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.read();
        let recent_cutoff = self.dependency_cutoff(Utc::now());
        SchedulerStats {
            is_running: self.is_running(),
            registered_tasks: state.definitions.len(),
            scheduled_tasks: state.schedules.len(),
            running_executions: state.live_total(),
            recent_executions: state
                .executions
                .values()
                .filter(|e| e.scheduled_at >= recent_cutoff)
                .count(),
            total_executions: self.inner.dispatched.load(Ordering::Relaxed),
            aggregate: state.totals.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn dependency_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::from_std(self.inner.config.dependency_window).unwrap_or(chrono::Duration::zero())
    }

    /// One evaluation pass: dispatch due schedules in priority order
    ///
    /// Must be called within a Tokio runtime.
    pub fn tick(&self) -> TickReport {
        let now = Utc::now();
        let cutoff = self.dependency_cutoff(now);
        let mut report = TickReport::default();
        let mut to_spawn = Vec::new();

        {
            let mut state = self.inner.state.write();

            let mut due: Vec<(String, TaskPriority)> = state
                .schedules
                .values()
                .filter(|s| s.is_due(now))
                .filter_map(|s| {
                    state
                        .definitions
                        .get(&s.task_id)
                        .map(|d| (s.task_id.clone(), d.priority))
                })
                .collect();
            due.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            report.due = due.len();

            for (task_id, _) in due {
                match state.admit(&task_id, HashMap::new(), cutoff, now) {
                    Ok(Admission::Admitted(definition, id)) => {
                        if let Some(schedule) = state.schedules.get_mut(&task_id) {
                            schedule.mark_dispatched(now);
                        }
                        report.dispatched.push((task_id, id));
                        to_spawn.push((definition, id));
                    }
                    Ok(Admission::WaitingOn(dependency)) => {
                        debug!(task = %task_id, dependency = %dependency, "Waiting on dependency");
                        report.waiting_on_dependencies.push(task_id);
                    }
                    Ok(Admission::AtCapacity) => {
                        debug!(task = %task_id, "At capacity");
                        report.at_capacity.push(task_id);
                    }
                    Err(e) => warn!(task = %task_id, error = %e, "Scheduled task vanished"),
                }
            }

            let retention = chrono::Duration::from_std(self.inner.config.history_retention)
                .unwrap_or(chrono::Duration::zero());
            report.pruned = state.prune(now - retention, self.inner.config.max_history);
        }

        for (definition, id) in to_spawn {
            self.spawn_execution(definition, id);
        }

        telemetry::record_scheduler_tick();
        report
    }

    fn spawn_execution(&self, definition: TaskDefinition, execution_id: Uuid) {
        self.inner.dispatched.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.cancel.lock().child_token();
        let scheduler = self.clone();
        self.inner.tracker.spawn(async move {
            scheduler.run_execution(definition, execution_id, cancel).await;
        });
    }

    /// Drive one execution through its attempts
    #[instrument(skip(self, definition, cancel), fields(task = %definition.id))]
    async fn run_execution(&self, definition: TaskDefinition, execution_id: Uuid, cancel: CancellationToken) {
        loop {
            let (attempt, data) = {
                let mut guard = self.inner.state.write();
                let state = &mut *guard;
                let Some(execution) = state.executions.get_mut(&execution_id) else {
                    return;
                };
                if cancel.is_cancelled() {
                    execution.cancel(Utc::now());
                    state.totals.tasks_cancelled += 1;
                    return;
                }
                if !execution.start(Utc::now()) {
                    return;
                }
                let started = (execution.retry_count, execution.context.clone());
                telemetry::set_running_tasks(state.live_total());
                started
            };

            debug!(attempt, "Starting attempt");
            let ctx = TaskContext::new(execution_id, definition.id.clone(), attempt, data, cancel.clone());

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => AttemptOutcome::Cancelled,
                result = tokio::time::timeout(definition.timeout, definition.work.execute(ctx)) => match result {
                    Ok(Ok(value)) => AttemptOutcome::Completed(value),
                    Ok(Err(e)) => AttemptOutcome::Failed(format!("{:#}", e)),
                    Err(_) => AttemptOutcome::Failed(format!("timed out after {:?}", definition.timeout)),
                },
            };

            let retry = {
                let mut guard = self.inner.state.write();
                let state = &mut *guard;
                let now = Utc::now();
                let Some(execution) = state.executions.get_mut(&execution_id) else {
                    return;
                };

                let retry = match outcome {
                    AttemptOutcome::Completed(value) => {
                        execution.complete(value, now);
                        let duration = execution.duration;
                        info!(?duration, "Task completed");
                        telemetry::record_task_finished(&definition.id, TaskStatus::Completed.as_str(), duration);
                        state.totals.record_success(duration);
                        false
                    }
                    AttemptOutcome::Cancelled => {
                        execution.cancel(now);
                        info!("Task cancelled");
                        telemetry::record_task_finished(&definition.id, TaskStatus::Cancelled.as_str(), None);
                        state.totals.tasks_cancelled += 1;
                        false
                    }
                    AttemptOutcome::Failed(reason) => {
                        let retry = execution.retry_count < definition.max_retries;
                        execution.fail(reason.clone(), retry, now);
                        if retry {
                            warn!(
                                attempt,
                                error = %reason,
                                delay = ?definition.retry_delay,
                                "Task failed, retrying"
                            );
                        } else {
                            error!(attempt, error = %reason, "Task failed, retries exhausted");
                            telemetry::record_task_finished(
                                &definition.id,
                                TaskStatus::Failed.as_str(),
                                execution.duration,
                            );
                            state.totals.tasks_failed += 1;
                        }
                        retry
                    }
                };
                telemetry::set_running_tasks(state.live_total());
                retry
            };

            if !retry {
                return;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    // Loop head records the cancellation.
                }
                _ = tokio::time::sleep(definition.retry_delay) => {}
            }
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Validate the task graph and spawn the tick loop
    pub fn start(&self) -> Result<()> {
        self.validate()?;
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        let cancel = self.inner.cancel.lock().clone();

        let scheduler = self.clone();
        let handle = tokio::spawn(async move { scheduler.run_loop(cancel).await });
        *self.inner.loop_handle.lock() = Some(handle);

        info!(
            tick_interval = ?self.inner.config.tick_interval,
            "Task scheduler started"
        );
        Ok(())
    }

    async fn run_loop(&self, cancel: CancellationToken) {
        loop {
            let scheduler = self.clone();
            // A panicking tick is contained by its own task.
            let delay = match tokio::spawn(async move { scheduler.tick() }).await {
                Ok(report) => {
                    if !report.dispatched.is_empty() || report.pruned > 0 {
                        debug!(
                            dispatched = report.dispatched.len(),
                            waiting = report.waiting_on_dependencies.len(),
                            at_capacity = report.at_capacity.len(),
                            pruned = report.pruned,
                            "Scheduler tick"
                        );
                    }
                    self.inner.config.tick_interval
                }
                Err(e) => {
                    error!(error = %e, "Scheduler tick failed");
                    self.inner.config.error_backoff
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("Scheduler loop exited");
    }

    /// Stop the loop, cancel every in-flight execution and wait for them
    pub async fn stop(&self) {
        let was_running = self.inner.running.swap(false, Ordering::SeqCst);
        self.inner.cancel.lock().cancel();

        let handle = self.inner.loop_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Scheduler loop ended abnormally");
            }
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        // Admitted but never started (spawn raced with shutdown).
        let now = Utc::now();
        let mut state = self.inner.state.write();
        let mut cancelled = 0;
        for execution in state.executions.values_mut() {
            if execution.status.is_live() && execution.cancel(now) {
                cancelled += 1;
            }
        }
        state.totals.tasks_cancelled += cancelled;
        drop(state);
        telemetry::set_running_tasks(0);

        // Leave the scheduler usable for manual runs and a later start.
        *self.inner.cancel.lock() = CancellationToken::new();
        self.inner.tracker.reopen();

        if was_running {
            info!("Task scheduler stopped");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::task_fn;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_millis(10),
            ..SchedulerConfig::default()
        }
    }

    fn ok_task(id: &str) -> TaskDefinition {
        TaskDefinition::new(id, id, task_fn(|_| async { Ok(json!("ok")) }))
    }

    async fn wait_for_status(scheduler: &TaskScheduler, id: Uuid, status: TaskStatus) -> TaskExecution {
        for _ in 0..2000 {
            if let Some(e) = scheduler.status(id) {
                if e.status == status {
                    return e;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("execution {} never reached {:?}: {:?}", id, status, scheduler.status(id));
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let scheduler = TaskScheduler::new(fast_config());
        assert!(scheduler.register(ok_task("a")));
        assert!(!scheduler.register(ok_task("a")));
        assert_eq!(scheduler.stats().registered_tasks, 1);
    }

    #[tokio::test]
    async fn test_schedule_unknown_task() {
        let scheduler = TaskScheduler::new(fast_config());
        let err = scheduler
            .schedule("ghost", Recurrence::every_secs(10).unwrap(), 1)
            .unwrap_err();
        assert_matches!(err, Error::TaskNotFound(id) if id == "ghost");
        assert_matches!(scheduler.run_now("ghost", HashMap::new()), Err(Error::TaskNotFound(_)));
        assert_matches!(scheduler.set_enabled("ghost", false), Err(Error::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_run_now_completes() {
        let scheduler = TaskScheduler::new(fast_config());
        scheduler.register(TaskDefinition::new(
            "echo",
            "Echo",
            task_fn(|ctx: TaskContext| async move { Ok(json!({ "who": ctx.get("who").cloned() })) }),
        ));

        let mut context = HashMap::new();
        context.insert("who".to_string(), json!("operator"));
        let id = scheduler.run_now("echo", context).unwrap().unwrap();

        let execution = wait_for_status(&scheduler, id, TaskStatus::Completed).await;
        assert_eq!(execution.result, Some(json!({ "who": "operator" })));
        assert_eq!(execution.retry_count, 0);
        assert!(execution.duration.is_some());

        let stats = scheduler.stats();
        assert_eq!(stats.aggregate.tasks_executed, 1);
        assert_eq!(stats.total_executions, 1);
        assert_eq!(scheduler.executions_for("echo").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let scheduler = TaskScheduler::new(fast_config());
        scheduler.register(
            TaskDefinition::new(
                "flaky",
                "Always fails",
                task_fn(move |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        anyhow::bail!("upstream unavailable")
                    }
                }),
            )
            .max_retries(2)
            .retry_delay(Duration::from_secs(1)),
        );

        let id = scheduler.run_now("flaky", HashMap::new()).unwrap().unwrap();
        let execution = wait_for_status(&scheduler, id, TaskStatus::Failed).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(execution.retry_count, 2);
        assert_eq!(execution.attempts(), 3);
        assert_eq!(execution.error.as_deref(), Some("upstream unavailable"));
        assert_eq!(scheduler.stats().aggregate.tasks_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let scheduler = TaskScheduler::new(fast_config());
        scheduler.register(
            TaskDefinition::new(
                "slow",
                "Slow",
                task_fn(|_| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Value::Null)
                }),
            )
            .timeout(Duration::from_secs(1))
            .max_retries(0),
        );

        let id = scheduler.run_now("slow", HashMap::new()).unwrap().unwrap();
        let execution = wait_for_status(&scheduler, id, TaskStatus::Failed).await;
        assert!(execution.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_concurrency_gate() {
        let scheduler = TaskScheduler::new(fast_config());
        let release = CancellationToken::new();
        let gate = release.clone();
        scheduler.register(TaskDefinition::new(
            "blocking",
            "Blocking",
            task_fn(move |_| {
                let gate = gate.clone();
                async move {
                    gate.cancelled().await;
                    Ok(Value::Null)
                }
            }),
        ));
        scheduler
            .schedule("blocking", Recurrence::every_secs(3600).unwrap(), 2)
            .unwrap();

        let first = scheduler.run_now("blocking", HashMap::new()).unwrap();
        let second = scheduler.run_now("blocking", HashMap::new()).unwrap();
        let third = scheduler.run_now("blocking", HashMap::new()).unwrap();
        assert!(first.is_some());
        assert!(second.is_some());
        assert!(third.is_none());

        let report = scheduler.tick();
        assert_eq!(report.at_capacity, vec!["blocking"]);
        assert_eq!(scheduler.stats().running_executions, 2);

        release.cancel();
        wait_for_status(&scheduler, first.unwrap(), TaskStatus::Completed).await;
        wait_for_status(&scheduler, second.unwrap(), TaskStatus::Completed).await;
        assert!(scheduler.run_now("blocking", HashMap::new()).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dependency_gate_and_priority_order() {
        let scheduler = TaskScheduler::new(fast_config());
        scheduler.register(ok_task("sync_weather").priority(TaskPriority::High));
        scheduler.register(ok_task("synthesize_mood").depends_on("sync_weather"));
        scheduler.register(ok_task("cleanup").priority(TaskPriority::Low));
        for id in ["sync_weather", "synthesize_mood", "cleanup"] {
            scheduler.schedule(id, Recurrence::every_secs(3600).unwrap(), 1).unwrap();
        }

        let report = scheduler.tick();
        assert_eq!(report.due, 3);
        let order: Vec<&str> = report.dispatched.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(order, vec!["sync_weather", "cleanup"]);
        assert_eq!(report.waiting_on_dependencies, vec!["synthesize_mood"]);

        wait_for_status(&scheduler, report.dispatched[0].1, TaskStatus::Completed).await;

        let report = scheduler.tick();
        assert_eq!(report.due, 1);
        assert_eq!(report.dispatched.len(), 1);
        assert_eq!(report.dispatched[0].0, "synthesize_mood");
    }

    #[tokio::test]
    async fn test_stale_dependency_does_not_count() {
        let config = SchedulerConfig {
            dependency_window: Duration::from_millis(50),
            ..fast_config()
        };
        let scheduler = TaskScheduler::new(config);
        scheduler.register(ok_task("a"));
        scheduler.register(ok_task("b").depends_on("a"));

        let id = scheduler.run_now("a", HashMap::new()).unwrap().unwrap();
        wait_for_status(&scheduler, id, TaskStatus::Completed).await;
        assert!(scheduler.run_now("b", HashMap::new()).unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(scheduler.run_now("b", HashMap::new()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disabled_schedule_skipped() {
        let scheduler = TaskScheduler::new(fast_config());
        scheduler.register(ok_task("a"));
        scheduler.schedule("a", Recurrence::every_secs(10).unwrap(), 1).unwrap();
        scheduler.set_enabled("a", false).unwrap();

        assert_eq!(scheduler.tick().due, 0);
        scheduler.set_enabled("a", true).unwrap();
        assert_eq!(scheduler.tick().dispatched.len(), 1);
    }

    #[tokio::test]
    async fn test_start_rejects_cycle() {
        let scheduler = TaskScheduler::new(fast_config());
        scheduler.register(ok_task("a").depends_on("b"));
        scheduler.register(ok_task("b").depends_on("a"));

        assert_matches!(scheduler.start(), Err(Error::DependencyCycle { .. }));
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_start_rejects_unknown_dependency() {
        let scheduler = TaskScheduler::new(fast_config());
        scheduler.register(ok_task("a").depends_on("missing"));
        assert_matches!(scheduler.start(), Err(Error::UnknownDependency { .. }));
    }

    #[tokio::test]
    async fn test_double_start() {
        let scheduler = TaskScheduler::new(fast_config());
        scheduler.start().unwrap();
        assert_matches!(scheduler.start(), Err(Error::AlreadyRunning));
        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight() {
        let scheduler = TaskScheduler::new(fast_config());
        scheduler.register(TaskDefinition::new(
            "forever",
            "Never finishes",
            task_fn(|_| async {
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }),
        ));
        scheduler.start().unwrap();

        let id = scheduler.run_now("forever", HashMap::new()).unwrap().unwrap();
        wait_for_status(&scheduler, id, TaskStatus::Running).await;

        scheduler.stop().await;
        let execution = scheduler.status(id).unwrap();
        assert_eq!(execution.status, TaskStatus::Cancelled);
        assert_eq!(scheduler.stats().running_executions, 0);
        assert_eq!(scheduler.stats().aggregate.tasks_cancelled, 1);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let scheduler = TaskScheduler::new(fast_config());
        scheduler.register(ok_task("a"));
        scheduler.start().unwrap();
        scheduler.stop().await;

        scheduler.start().unwrap();
        let id = scheduler.run_now("a", HashMap::new()).unwrap().unwrap();
        wait_for_status(&scheduler, id, TaskStatus::Completed).await;
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_history_cap() {
        let config = SchedulerConfig {
            max_history: 3,
            ..fast_config()
        };
        let scheduler = TaskScheduler::new(config);
        scheduler.register(ok_task("a"));

        let mut ids = Vec::new();
        for _ in 0..5 {
            let id = scheduler.run_now("a", HashMap::new()).unwrap().unwrap();
            wait_for_status(&scheduler, id, TaskStatus::Completed).await;
            ids.push(id);
        }

        let report = scheduler.tick();
        assert_eq!(report.pruned, 2);
        assert!(scheduler.status(ids[0]).is_none());
        assert!(scheduler.status(ids[1]).is_none());
        assert!(scheduler.status(ids[4]).is_some());
        assert_eq!(scheduler.stats().total_executions, 5);
    }
}
