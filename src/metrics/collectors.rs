//! Metric recording for queue operations.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics with the label sets
//! the scheduler uses. Every method is a no-op until `init_metrics()` runs.

use crate::scheduler::{TaskStats, TaskStatus, TaskType};

use super::prometheus::{ACTIVE_WORKERS, QUEUE_DEPTH, TASKS_TOTAL, TASK_DURATION, TASK_RETRIES};

/// Metrics collector for recording scheduler metrics.
///
/// # Example
///
/// ```ignore
/// use loganalysis::metrics::{init_metrics, MetricsCollector};
/// use loganalysis::scheduler::{TaskStatus, TaskType};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_task(TaskStatus::Completed, TaskType::LogAnalysis, 1.5);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a task outcome and how long processing took.
    pub fn record_task(&self, status: TaskStatus, task_type: TaskType, duration_secs: f64) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total
                .with_label_values(&[status.as_str(), task_type.as_str()])
                .inc();
        }

        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[task_type.as_str()])
                .observe(duration_secs);
        }

        tracing::trace!(
            status = %status,
            task_type = %task_type,
            duration_secs = duration_secs,
            "Recorded task metric"
        );
    }

    /// Record a scheduled retry.
    pub fn record_retry(&self, task_type: TaskType) {
        if let Some(retries) = TASK_RETRIES.get() {
            retries.with_label_values(&[task_type.as_str()]).inc();
        }
    }

    /// Update the per-status depth gauges from store counters.
    pub fn update_queue_depth(&self, stats: &TaskStats) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            for status in TaskStatus::ALL {
                queue_depth
                    .with_label_values(&[status.as_str()])
                    .set(stats.count(status) as f64);
            }
        }

        tracing::trace!(
            pending = stats.pending_tasks,
            processing = stats.processing_tasks,
            retrying = stats.retrying_tasks,
            "Updated queue depth metric"
        );
    }

    pub fn inc_active_workers(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.inc();
        }
    }

    pub fn dec_active_workers(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.dec();
        }
    }
}
