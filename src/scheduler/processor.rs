//! Processor abstraction invoked by workers.

use async_trait::async_trait;

use super::task::{ResultMap, Task, TaskType};

/// Handles the work behind one or more task types.
///
/// A processor error is not fatal: the worker records it on the task and
/// either schedules a retry or marks the task failed.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Runs the task and returns its result map.
    async fn process_task(&self, task: &Task) -> anyhow::Result<ResultMap>;

    /// Returns whether this processor handles `task_type`.
    fn can_process(&self, task_type: TaskType) -> bool;

    /// Name used in logs and scheduler stats.
    fn name(&self) -> &str;
}
