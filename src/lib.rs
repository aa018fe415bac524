//! loganalysis: persistent task queue and worker-pool scheduler for
//! asynchronous log analysis.
//!
//! Callers submit analysis tasks through [`scheduler::QueueService`]; a pool
//! of workers claims them from a Redis-backed queue, runs the registered
//! processor and records the outcome, retrying failures with backoff.

pub mod analysis;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod scheduler;

// Re-export commonly used types
pub use config::{AppConfig, ConfigError};
pub use error::AnalysisError;
pub use scheduler::{
    QueueError, QueueService, SchedulerError, ServiceError, Task, TaskQueue, TaskStatus, TaskType,
};
