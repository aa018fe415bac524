//! Task queue abstraction over the persistent store.
//!
//! A queue keeps five structures per deployment:
//!
//! - `{prefix}:data:{id}`: serialized task body (expires after the task TTL)
//! - `{prefix}:queue`: ready index, a sorted set scored by priority
//! - `{prefix}:schedule`: delayed index, a sorted set scored by `scheduled_at`
//! - `{prefix}:processing`: lease index, a sorted set scored by lease expiry
//! - `{prefix}:status`: status index, a hash of id -> status
//! - `{prefix}:stats`: aggregate counters, a hash of counter -> value
//!
//! # Atomicity
//!
//! Every enqueue, claim and update is written as one atomic unit, so the
//! counters never drift from the indices and a task is never reachable from
//! two indices at once. Claiming a ready task is an atomic pop: two workers
//! can never receive the same task.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use super::task::{Task, TaskFilter, TaskStats};

/// How long a worker may hold a claimed task before its lease expires.
pub const LEASE_DURATION: Duration = Duration::from_secs(10 * 60);

/// Default prefix for every store key.
pub const DEFAULT_KEY_PREFIX: &str = "task";

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to the store.
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    /// Store operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialize or deserialize a task body.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Task not found in the store.
    #[error("Task {0} not found")]
    TaskNotFound(Uuid),
}

/// Operations every queue backend provides.
///
/// Implementations must make claiming atomic: concurrent
/// [`dequeue_with_timeout`](TaskQueue::dequeue_with_timeout) calls never
/// return the same task twice.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Stores a task and indexes it according to its status.
    ///
    /// `pending` tasks go to the ready index, `retrying` tasks to the delayed
    /// index. The total and per-status counters are incremented.
    async fn enqueue(&self, task: &Task) -> Result<(), QueueError>;

    /// Claims the next task, blocking until one is available.
    async fn dequeue(&self) -> Result<Option<Task>, QueueError> {
        self.dequeue_with_timeout(Duration::ZERO).await
    }

    /// Claims the next task, waiting at most `timeout`.
    ///
    /// Delayed tasks that are due are promoted first. A zero timeout waits
    /// indefinitely. Returns `Ok(None)` when the timeout expires. The claimed
    /// task is returned in `processing` status with a lease recorded.
    async fn dequeue_with_timeout(&self, timeout: Duration) -> Result<Option<Task>, QueueError>;

    /// Persists a task and reconciles indices and counters with its status.
    async fn update_task(&self, task: &Task) -> Result<(), QueueError>;

    /// Retrieves a task by ID.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::TaskNotFound` if no body is stored for `id`.
    async fn get_task(&self, id: Uuid) -> Result<Task, QueueError>;

    /// Retrieves tasks matching `filter`.
    async fn get_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, QueueError>;

    /// Removes a task from every index and adjusts the counters.
    async fn delete_task(&self, id: Uuid) -> Result<(), QueueError>;

    /// Returns the maintained counters without scanning.
    async fn get_stats(&self) -> Result<TaskStats, QueueError>;

    /// Deletes every task older than the TTL, returning how many were removed.
    async fn cleanup_expired_tasks(&self) -> Result<u64, QueueError>;

    /// Releases tasks whose worker lease has expired.
    ///
    /// Each expired claim goes through the normal retry decision: it is
    /// rescheduled immediately if retries remain, failed otherwise. Returns
    /// the number of tasks released.
    async fn reclaim_expired_leases(&self) -> Result<u64, QueueError>;

    /// Releases backend resources.
    async fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Key layout of a queue in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    prefix: String,
    pub ready: String,
    pub schedule: String,
    pub processing: String,
    pub status: String,
    pub stats: String,
}

impl QueueKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            ready: format!("{}:queue", prefix),
            schedule: format!("{}:schedule", prefix),
            processing: format!("{}:processing", prefix),
            status: format!("{}:status", prefix),
            stats: format!("{}:stats", prefix),
            prefix,
        }
    }

    /// Key holding the body of one task.
    pub fn data(&self, id: Uuid) -> String {
        format!("{}:data:{}", self.prefix, id)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for QueueKeys {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

/// Message recorded on a task whose lease expired with no retries left.
pub(crate) fn lease_expired_message(task: &Task) -> String {
    format!(
        "processing lease expired after {} retries",
        task.retry_count
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let id = Uuid::new_v4();
        let err = QueueError::TaskNotFound(id);
        assert!(err.to_string().contains("not found"));
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn test_default_key_layout() {
        let keys = QueueKeys::default();
        let id = Uuid::nil();

        assert_eq!(keys.ready, "task:queue");
        assert_eq!(keys.schedule, "task:schedule");
        assert_eq!(keys.processing, "task:processing");
        assert_eq!(keys.status, "task:status");
        assert_eq!(keys.stats, "task:stats");
        assert_eq!(
            keys.data(id),
            "task:data:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_custom_prefix() {
        let keys = QueueKeys::new("staging");
        assert_eq!(keys.prefix(), "staging");
        assert_eq!(keys.ready, "staging:queue");
        assert!(keys.data(Uuid::new_v4()).starts_with("staging:data:"));
    }

    #[test]
    fn test_lease_duration() {
        assert_eq!(LEASE_DURATION, Duration::from_secs(600));
    }
}
