//! Persistent task queue and worker-pool scheduler.
//!
//! This module decouples submitting analysis work from running it:
//!
//! - **TaskQueue**: persistent queue with priority ordering, delayed retries
//!   and aggregate counters. `RedisTaskQueue` is the production backend,
//!   `MemoryTaskQueue` an in-process one with the same semantics.
//! - **Scheduler**: pool of workers that claim tasks and hand them to the
//!   registered `TaskProcessor`
//! - **QueueService**: the entry point used by callers
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │ QueueService │
//!                      │  (API/CLI)   │
//!                      └──────┬───────┘
//!                             │ enqueue
//!                      ┌──────▼───────┐
//!                      │    Redis     │ ◄── retry with backoff
//!                      │    Queue     │
//!                      └──────┬───────┘
//!                             │ dequeue (atomic claim)
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use loganalysis::config::AppConfig;
//! use loganalysis::scheduler::QueueService;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = AppConfig::from_env()?;
//! let mut service = QueueService::connect(&config).await?;
//!
//! let shutdown = CancellationToken::new();
//! service.start(&shutdown)?;
//!
//! let task = service
//!     .schedule_log_analysis(vec!["log-1".to_string(), "log-2".to_string()])
//!     .await?;
//!
//! // Graceful shutdown
//! service.stop().await?;
//! ```
//!
//! # Delivery
//!
//! - **Atomic claim**: a ready task is handed to exactly one worker
//! - **Bounded retries**: failures are retried with capped quadratic backoff
//!   until `max_retries`, then the task is marked failed
//! - **Leases**: every claim records a lease; expired leases can be reclaimed
//! - **Graceful shutdown**: workers finish their current task before stopping

pub mod memory_queue;
pub mod processor;
pub mod queue;
pub mod redis_queue;
pub mod service;
pub mod task;
pub mod worker_pool;

// Re-export main types for convenience
pub use memory_queue::MemoryTaskQueue;
pub use processor::TaskProcessor;
pub use queue::{QueueError, QueueKeys, TaskQueue, DEFAULT_KEY_PREFIX, LEASE_DURATION};
pub use redis_queue::RedisTaskQueue;
pub use service::{QueueService, ServiceError, SubmitOptions};
pub use task::{
    ResultMap, Task, TaskFilter, TaskPayload, TaskStats, TaskStatus, TaskType,
    DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY, TASK_TTL,
};
pub use worker_pool::{RetryPolicy, Scheduler, SchedulerConfig, SchedulerError, SchedulerStats};
