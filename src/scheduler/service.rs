//! Facade over the queue and scheduler used by the API layer and the CLI.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::analysis::{HttpAnalysisBackend, LogAnalysisProcessor};
use crate::config::AppConfig;
use crate::error::AnalysisError;

use super::processor::TaskProcessor;
use super::queue::{QueueError, TaskQueue};
use super::redis_queue::RedisTaskQueue;
use super::task::{Task, TaskFilter, TaskStats};
use super::worker_pool::{Scheduler, SchedulerConfig, SchedulerError, SchedulerStats};

/// Errors returned by [`QueueService`].
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A log analysis was requested without any log ids.
    #[error("log_ids cannot be empty")]
    EmptyLogIds,

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Analysis backend setup failed: {0}")]
    Analysis(#[from] AnalysisError),
}

/// Per-submission overrides of the task defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    pub priority: Option<i32>,
    pub max_retries: Option<u32>,
}

/// Queue service tying a task queue to its scheduler.
pub struct QueueService {
    queue: Arc<dyn TaskQueue>,
    scheduler: Scheduler,
}

impl QueueService {
    /// Connects to Redis and wires the log analysis processor against the
    /// HTTP analysis backend.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::Queue` if Redis is unreachable and
    /// `ServiceError::Analysis` if the HTTP client cannot be built.
    pub async fn connect(config: &AppConfig) -> Result<Self, ServiceError> {
        let queue = RedisTaskQueue::connect(&config.redis_url, &config.key_prefix).await?;
        let backend =
            HttpAnalysisBackend::new(&config.analysis_service_url, config.analysis_timeout)?;

        info!(
            redis_url = %config.redis_url,
            key_prefix = %config.key_prefix,
            analysis_service = %backend.base_url(),
            "Queue service connected"
        );

        let processor: Arc<dyn TaskProcessor> =
            Arc::new(LogAnalysisProcessor::new(Arc::new(backend)));
        Self::new(Arc::new(queue), config.scheduler.clone(), [processor])
    }

    /// Creates a service over any queue backend.
    pub fn new<I>(
        queue: Arc<dyn TaskQueue>,
        config: SchedulerConfig,
        processors: I,
    ) -> Result<Self, ServiceError>
    where
        I: IntoIterator<Item = Arc<dyn TaskProcessor>>,
    {
        let mut scheduler = Scheduler::new(Arc::clone(&queue), config);
        for processor in processors {
            scheduler.register_processor(processor)?;
        }

        Ok(Self { queue, scheduler })
    }

    /// Starts the worker pool.
    pub fn start(&mut self, shutdown: &CancellationToken) -> Result<(), ServiceError> {
        self.scheduler.start(shutdown)?;
        Ok(())
    }

    /// Stops the worker pool and releases the queue.
    pub async fn stop(&mut self) -> Result<(), ServiceError> {
        self.scheduler.stop().await?;
        self.queue.close().await?;
        Ok(())
    }

    /// Submits a log analysis task with default priority and retries.
    pub async fn schedule_log_analysis(&self, log_ids: Vec<String>) -> Result<Task, ServiceError> {
        self.schedule_log_analysis_with(log_ids, SubmitOptions::default())
            .await
    }

    /// Submits a log analysis task with explicit options.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::EmptyLogIds` if `log_ids` is empty.
    pub async fn schedule_log_analysis_with(
        &self,
        log_ids: Vec<String>,
        options: SubmitOptions,
    ) -> Result<Task, ServiceError> {
        if log_ids.is_empty() {
            return Err(ServiceError::EmptyLogIds);
        }

        let mut task = Task::log_analysis(log_ids);
        if let Some(priority) = options.priority {
            task = task.with_priority(priority);
        }
        if let Some(max_retries) = options.max_retries {
            task = task.with_max_retries(max_retries);
        }

        self.scheduler.schedule_task(&task).await?;

        info!(
            task_id = %task.id,
            priority = task.priority,
            "Scheduled log analysis task"
        );

        Ok(task)
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Task, ServiceError> {
        Ok(self.queue.get_task(id).await?)
    }

    pub async fn get_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, ServiceError> {
        Ok(self.queue.get_tasks(filter).await?)
    }

    pub async fn delete_task(&self, id: Uuid) -> Result<(), ServiceError> {
        Ok(self.queue.delete_task(id).await?)
    }

    pub async fn get_queue_stats(&self) -> Result<TaskStats, ServiceError> {
        Ok(self.queue.get_stats().await?)
    }

    pub async fn get_scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats().await
    }

    pub async fn cleanup_expired_tasks(&self) -> Result<u64, ServiceError> {
        Ok(self.queue.cleanup_expired_tasks().await?)
    }

    pub async fn reclaim_expired_leases(&self) -> Result<u64, ServiceError> {
        Ok(self.queue.reclaim_expired_leases().await?)
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }
}
