//! Worker-pool scheduler for processing tasks from the queue.
//!
//! The scheduler owns a fixed pool of workers plus one maintenance task.
//! Each worker runs as an independent tokio task and pulls tasks from the
//! shared queue.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Cooperative shutdown through a `CancellationToken`
//! - Bounded retries with capped quadratic backoff
//! - Periodic cleanup of expired tasks and, optionally, expired leases
//! - Scheduler statistics tracking

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::MetricsCollector;

use super::processor::TaskProcessor;
use super::queue::{QueueError, TaskQueue};
use super::task::{Task, TaskStats, TaskStatus, TaskType};

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Scheduler is already running.
    #[error("Scheduler is already running")]
    AlreadyRunning,

    /// Scheduler is not running.
    #[error("Scheduler is not running")]
    NotRunning,

    /// No processor is registered for the task type.
    #[error("No processor registered for task type: {0}")]
    NoProcessor(TaskType),

    /// Workers did not stop within the shutdown timeout.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// Queue operation failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Capped quadratic backoff between retries.
///
/// Retry `n` (1-based) waits `min(n² × base_delay, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(30 * 60),
        }
    }
}

impl RetryPolicy {
    /// Returns the delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = retry.saturating_mul(retry);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How long a worker waits for a task before checking for shutdown.
    pub poll_timeout: Duration,
    /// Maximum time allowed for processing a single task.
    pub job_timeout: Duration,
    /// Interval between maintenance passes.
    pub cleanup_interval: Duration,
    /// Pause after a failed store call.
    pub error_backoff: Duration,
    /// Bound on `stop`; `None` waits for every worker.
    pub shutdown_timeout: Option<Duration>,
    /// Release tasks whose lease expired during maintenance passes.
    pub reclaim_leases: bool,
    pub retry_policy: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: 3,
            poll_timeout: Duration::from_secs(5),
            job_timeout: Duration::from_secs(600), // 10 minutes
            cleanup_interval: Duration::from_secs(3600),
            error_backoff: Duration::from_secs(1),
            shutdown_timeout: None,
            reclaim_leases: false,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the dequeue wait per poll.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Sets the job timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Sets the maintenance interval.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    /// Enables lease reclamation during maintenance passes.
    pub fn with_reclaim_leases(mut self, enabled: bool) -> Self {
        self.reclaim_leases = enabled;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// Snapshot of scheduler activity.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub workers_count: usize,
    pub running: bool,
    /// Workers currently processing a task.
    pub active_workers: u64,
    /// Tasks completed successfully.
    pub processed_tasks: u64,
    /// Tasks that failed terminally.
    pub failed_tasks: u64,
    /// Retries scheduled.
    pub retried_tasks: u64,
    /// Total processing time of completed tasks.
    pub processing_time_ms: u64,
    pub average_processing_time_ms: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
    /// Registered processor name per task type.
    pub processors: HashMap<TaskType, String>,
    /// Store counters; `None` if the store could not be read.
    pub queue_stats: Option<TaskStats>,
}

/// Shared state for tracking scheduler statistics.
struct SharedSchedulerStats {
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
    /// Epoch milliseconds; 0 when nothing was processed yet.
    last_processed_ms: AtomicI64,
}

impl SharedSchedulerStats {
    fn new() -> Self {
        Self {
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
            last_processed_ms: AtomicI64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.processed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
        self.last_processed_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn snapshot(&self, workers_count: usize, running: bool) -> SchedulerStats {
        let processed = self.processed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let last_processed_ms = self.last_processed_ms.load(Ordering::SeqCst);

        let average = if processed > 0 {
            total_duration_ms / processed
        } else {
            0
        };

        SchedulerStats {
            workers_count,
            running,
            active_workers: self.active_workers.load(Ordering::SeqCst),
            processed_tasks: processed,
            failed_tasks: self.failed.load(Ordering::SeqCst),
            retried_tasks: self.retried.load(Ordering::SeqCst),
            processing_time_ms: total_duration_ms,
            average_processing_time_ms: average,
            last_processed_at: (last_processed_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_processed_ms).single())
                .flatten(),
            processors: HashMap::new(),
            queue_stats: None,
        }
    }
}

type ProcessorMap = HashMap<TaskType, Arc<dyn TaskProcessor>>;

/// Handles of a started scheduler.
struct Running {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Scheduler that runs a pool of workers against a task queue.
pub struct Scheduler {
    config: SchedulerConfig,
    queue: Arc<dyn TaskQueue>,
    processors: ProcessorMap,
    running: Option<Running>,
    stats: Arc<SharedSchedulerStats>,
}

impl Scheduler {
    pub fn new(queue: Arc<dyn TaskQueue>, config: SchedulerConfig) -> Self {
        Self {
            config,
            queue,
            processors: HashMap::new(),
            running: None,
            stats: Arc::new(SharedSchedulerStats::new()),
        }
    }

    /// Registers a processor for every task type it can handle.
    ///
    /// A later registration for the same type replaces the earlier one.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::AlreadyRunning` once the scheduler started;
    /// the processor set is fixed while workers run.
    pub fn register_processor(
        &mut self,
        processor: Arc<dyn TaskProcessor>,
    ) -> Result<(), SchedulerError> {
        if self.running.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        for task_type in TaskType::ALL {
            if processor.can_process(task_type) {
                info!(
                    processor = processor.name(),
                    task_type = %task_type,
                    "Registered task processor"
                );
                self.processors.insert(task_type, Arc::clone(&processor));
            }
        }

        Ok(())
    }

    /// Starts all workers and the maintenance task.
    ///
    /// Every spawned task listens on a child of `parent`, so cancelling
    /// `parent` also stops the scheduler's workers.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::AlreadyRunning` if the scheduler is already running.
    pub fn start(&mut self, parent: &CancellationToken) -> Result<(), SchedulerError> {
        if self.running.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let cancel = parent.child_token();
        let processors = Arc::new(self.processors.clone());
        let mut handles = Vec::with_capacity(self.config.num_workers + 1);

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                queue: Arc::clone(&self.queue),
                processors: Arc::clone(&processors),
                config: self.config.clone(),
                stats: Arc::clone(&self.stats),
                metrics: MetricsCollector::new(),
                cancel: cancel.clone(),
            };

            handles.push(tokio::spawn(worker.run()));
        }

        handles.push(tokio::spawn(maintenance_loop(
            Arc::clone(&self.queue),
            self.config.clone(),
            cancel.clone(),
        )));

        self.running = Some(Running { cancel, handles });
        info!(num_workers = self.config.num_workers, "Scheduler started");

        Ok(())
    }

    /// Stops all workers and waits for them to finish their current task.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::NotRunning` if the scheduler is not running and
    /// `SchedulerError::ShutdownTimeout` if the configured timeout elapsed, in
    /// which case the remaining tasks are aborted.
    pub async fn stop(&mut self) -> Result<(), SchedulerError> {
        let Some(running) = self.running.take() else {
            return Err(SchedulerError::NotRunning);
        };

        info!("Initiating scheduler shutdown");
        running.cancel.cancel();

        let abort_handles: Vec<_> = running.handles.iter().map(|h| h.abort_handle()).collect();
        let shutdown_future = async move {
            for handle in running.handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Scheduler task panicked during shutdown");
                }
            }
        };

        match self.config.shutdown_timeout {
            Some(limit) => match tokio::time::timeout(limit, shutdown_future).await {
                Ok(()) => {
                    info!("Scheduler shutdown complete");
                    Ok(())
                }
                Err(_) => {
                    for handle in abort_handles {
                        handle.abort();
                    }
                    warn!(timeout = ?limit, "Scheduler shutdown timed out, aborted remaining workers");
                    Err(SchedulerError::ShutdownTimeout(limit))
                }
            },
            None => {
                shutdown_future.await;
                info!("Scheduler shutdown complete");
                Ok(())
            }
        }
    }

    /// Submits a task for processing.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::NoProcessor` without enqueuing anything when
    /// no processor handles the task's type.
    pub async fn schedule_task(&self, task: &Task) -> Result<(), SchedulerError> {
        let task_type = task.task_type();
        if !self.processors.contains_key(&task_type) {
            return Err(SchedulerError::NoProcessor(task_type));
        }

        self.queue.enqueue(task).await?;

        debug!(
            task_id = %task.id,
            task_type = %task_type,
            priority = task.priority,
            "Task scheduled"
        );

        Ok(())
    }

    /// Returns current scheduler statistics merged with the store counters.
    pub async fn stats(&self) -> SchedulerStats {
        let mut stats = self
            .stats
            .snapshot(self.config.num_workers, self.is_running());

        stats.processors = self
            .processors
            .iter()
            .map(|(task_type, processor)| (*task_type, processor.name().to_string()))
            .collect();

        stats.queue_stats = match self.queue.get_stats().await {
            Ok(queue_stats) => Some(queue_stats),
            Err(e) => {
                warn!(error = %e, "Failed to read queue stats");
                None
            }
        };

        stats
    }

    /// Returns whether the scheduler is currently running.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Returns a reference to the task queue.
    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }
}

/// Periodic maintenance: TTL cleanup and, when enabled, lease reclamation.
async fn maintenance_loop(
    queue: Arc<dyn TaskQueue>,
    config: SchedulerConfig,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(config.cleanup_interval.max(Duration::from_millis(1)));
    // The first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        match queue.cleanup_expired_tasks().await {
            Ok(0) => debug!("No expired tasks to clean up"),
            Ok(count) => info!(count = count, "Cleaned up expired tasks"),
            Err(e) => error!(error = %e, "Failed to clean up expired tasks"),
        }

        if config.reclaim_leases {
            match queue.reclaim_expired_leases().await {
                Ok(0) => {}
                Ok(count) => warn!(count = count, "Reclaimed tasks with expired leases"),
                Err(e) => error!(error = %e, "Failed to reclaim expired leases"),
            }
        }

        match queue.get_stats().await {
            Ok(stats) => MetricsCollector::new().update_queue_depth(&stats),
            Err(e) => debug!(error = %e, "Failed to read queue stats for metrics"),
        }
    }

    debug!("Maintenance task stopped");
}

/// A single worker that processes tasks from the queue.
struct Worker {
    id: String,
    queue: Arc<dyn TaskQueue>,
    processors: Arc<ProcessorMap>,
    config: SchedulerConfig,
    stats: Arc<SharedSchedulerStats>,
    metrics: MetricsCollector,
    cancel: CancellationToken,
}

impl Worker {
    /// Main worker loop.
    ///
    /// A dequeue in progress is never interrupted: a task that was already
    /// claimed is always processed before the worker exits.
    async fn run(self) {
        info!(worker_id = %self.id, "Worker started");

        while !self.cancel.is_cancelled() {
            match self.queue.dequeue_with_timeout(self.config.poll_timeout).await {
                Ok(Some(task)) => {
                    self.process_task(task).await;
                }
                Ok(None) => {
                    debug!(worker_id = %self.id, "No tasks available");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue task");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Processes a single claimed task and persists the outcome.
    async fn process_task(&self, mut task: Task) {
        let task_id = task.id;
        let task_type = task.task_type();

        info!(
            worker_id = %self.id,
            task_id = %task_id,
            task_type = %task_type,
            attempt = task.retry_count + 1,
            "Processing task"
        );

        let Some(processor) = self.processors.get(&task_type) else {
            error!(
                worker_id = %self.id,
                task_id = %task_id,
                task_type = %task_type,
                "No processor found for task type"
            );
            task.mark_as_failed(format!("no processor found for task type: {}", task_type));
            self.stats.record_failure();
            self.metrics.record_task(TaskStatus::Failed, task_type, 0.0);
            self.persist(&task).await;
            return;
        };

        let start_time = Instant::now();
        self.stats.increment_active();
        self.metrics.inc_active_workers();

        let execution = processor.process_task(&task);
        let outcome = match tokio::time::timeout(self.config.job_timeout, execution).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => Err(format!(
                "task processing timed out after {:?}",
                self.config.job_timeout
            )),
        };

        let duration = start_time.elapsed();
        self.stats.decrement_active();
        self.metrics.dec_active_workers();

        match outcome {
            Ok(result) => {
                task.mark_as_completed(Some(result));
                self.stats.record_completion(duration);
                info!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    duration_ms = duration.as_millis() as u64,
                    "Task completed successfully"
                );
            }
            Err(message) if task.should_retry() => {
                let delay = self.config.retry_policy.delay_for(task.retry_count + 1);
                // error_msg is reserved for terminal failures
                task.mark_as_retrying(delay);
                self.stats.record_retry();
                self.metrics.record_retry(task_type);
                warn!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    error = %message,
                    retry = task.retry_count,
                    remaining_retries = task.remaining_retries(),
                    delay = ?delay,
                    "Task failed, scheduled for retry"
                );
            }
            Err(message) => {
                error!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    error = %message,
                    retries = task.retry_count,
                    "Task failed permanently"
                );
                task.mark_as_failed(message);
                self.stats.record_failure();
            }
        }

        self.metrics
            .record_task(task.status, task_type, duration.as_secs_f64());
        self.persist(&task).await;
    }

    async fn persist(&self, task: &Task) {
        if let Err(e) = self.queue.update_task(task).await {
            error!(
                worker_id = %self.id,
                task_id = %task.id,
                error = %e,
                "Failed to update task"
            );
        }
    }
}
