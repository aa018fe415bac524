//! Task definitions for the scheduler.
//!
//! This module defines the core task types used in the scheduling system:
//!
//! - `Task`: A unit of work stored in the queue and executed by workers
//! - `TaskPayload`: Typed payload, one variant per task type
//! - `TaskStatus`: Position of a task in its lifecycle
//! - `TaskFilter`: Read-side query used by introspection APIs
//! - `TaskStats`: Aggregate counters maintained by the queue

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default maximum number of retries for a task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default priority for tasks (0 is normal priority).
pub const DEFAULT_PRIORITY: i32 = 0;

/// Tasks older than this are purged regardless of status.
pub const TASK_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Opaque result map attached to a completed task.
pub type ResultMap = serde_json::Map<String, serde_json::Value>;

/// Lifecycle status of a task.
///
/// ```text
/// pending -> processing -> completed
///                      \-> failed
///                      \-> retrying -> pending
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the ready index.
    Pending,
    /// Claimed by a worker.
    Processing,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully, no more retries.
    Failed,
    /// Waiting in the delayed index for its backoff to elapse.
    Retrying,
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
        }
    }

    /// Name of the aggregate counter tracking this status.
    pub fn counter_field(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending_tasks",
            TaskStatus::Processing => "processing_tasks",
            TaskStatus::Completed => "completed_tasks",
            TaskStatus::Failed => "failed_tasks",
            TaskStatus::Retrying => "retrying_tasks",
        }
    }

    /// Returns whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Returns whether a task in this status may be handed to a worker.
    pub fn is_dequeueable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Retrying)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status '{}'", s))
    }
}

/// Kind of work a task represents; selects the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Run anomaly analysis over a batch of stored log records.
    LogAnalysis,
}

impl TaskType {
    /// Every known task type.
    pub const ALL: [TaskType; 1] = [TaskType::LogAnalysis];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::LogAnalysis => "log_analysis",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|task_type| task_type.as_str() == s)
            .ok_or_else(|| format!("unknown task type '{}'", s))
    }
}

/// Typed payload of a task.
///
/// Serialized adjacently tagged so that a task record carries
/// `"type": "log_analysis", "payload": {"log_ids": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Identifiers of the log records to analyze.
    LogAnalysis { log_ids: Vec<String> },
}

impl TaskPayload {
    /// Returns the task type this payload belongs to.
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskPayload::LogAnalysis { .. } => TaskType::LogAnalysis,
        }
    }
}

/// A task representing a unit of schedulable work.
///
/// Tasks are stored in the queue and processed by workers. They carry
/// retry bookkeeping and the timestamps of every lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: Uuid,
    /// Work description; also determines the task type.
    #[serde(flatten)]
    pub payload: TaskPayload,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Priority of the task (higher values = dequeued sooner).
    pub priority: i32,
    /// Maximum number of retries before the task is failed.
    pub max_retries: u32,
    /// Number of retries performed so far.
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time the task may be dequeued.
    pub scheduled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Reason of the last terminal failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    /// Output produced by the processor on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultMap>,
}

impl Task {
    /// Creates a new pending task with default settings.
    ///
    /// The task will have:
    /// - A new UUID
    /// - Default priority (0)
    /// - Default max retries (3)
    /// - Current timestamp as creation, update and schedule time
    pub fn new(payload: TaskPayload) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            payload,
            status: TaskStatus::Pending,
            priority: DEFAULT_PRIORITY,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            error_msg: None,
            result: None,
        }
    }

    /// Creates a log analysis task over the given log record identifiers.
    pub fn log_analysis<I, S>(log_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(TaskPayload::LogAnalysis {
            log_ids: log_ids.into_iter().map(Into::into).collect(),
        })
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the maximum number of retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn task_type(&self) -> TaskType {
        self.payload.task_type()
    }

    /// Marks the task as claimed by a worker.
    pub fn mark_as_processing(&mut self) {
        let now = Utc::now();
        self.status = TaskStatus::Processing;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    /// Marks the task as finished successfully.
    pub fn mark_as_completed(&mut self, result: Option<ResultMap>) {
        let now = Utc::now();
        self.status = TaskStatus::Completed;
        self.completed_at = Some(now);
        self.updated_at = now;
        self.result = result;
        self.error_msg = None;
    }

    /// Marks the task as terminally failed.
    pub fn mark_as_failed(&mut self, error_msg: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.updated_at = Utc::now();
        self.error_msg = Some(error_msg.into());
    }

    /// Schedules another attempt after `delay` and bumps the retry counter.
    pub fn mark_as_retrying(&mut self, delay: Duration) {
        let now = Utc::now();
        self.status = TaskStatus::Retrying;
        self.retry_count += 1;
        self.updated_at = now;
        self.scheduled_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    /// Moves a retrying task whose backoff elapsed back to the ready state.
    pub fn mark_as_pending(&mut self) {
        self.status = TaskStatus::Pending;
        self.updated_at = Utc::now();
    }

    /// Returns whether the task should be retried after a failure.
    pub fn should_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Returns the number of remaining retries.
    pub fn remaining_retries(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }

    /// Returns whether the task is past its TTL.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match (now - self.created_at).to_std() {
            Ok(age) => age > TASK_TTL,
            Err(_) => false,
        }
    }
}

/// Filtering criteria for task queries.
///
/// Used by introspection only; the scheduler never filters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    /// Inclusive lower bound on `created_at`.
    pub start_time: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`.
    pub end_time: Option<DateTime<Utc>>,
    /// Maximum number of tasks to return; 0 means unlimited.
    pub limit: usize,
    pub offset: usize,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    pub fn with_time_range(
        mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Returns whether a task satisfies the type and time-range criteria.
    ///
    /// Status is matched against the status index before tasks are loaded,
    /// so it is not rechecked here.
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(task_type) = self.task_type {
            if task.task_type() != task_type {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if task.created_at < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if task.created_at > end {
                return false;
            }
        }
        true
    }

    /// Applies offset/limit pagination to a list of ids.
    pub fn paginate<T>(&self, items: Vec<T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.offset);
        if self.limit == 0 {
            iter.collect()
        } else {
            iter.take(self.limit).collect()
        }
    }
}

/// Aggregate task counters maintained by the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total_tasks: i64,
    pub pending_tasks: i64,
    pub processing_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub retrying_tasks: i64,
}

impl TaskStats {
    /// Name of the counter holding the total.
    pub const TOTAL_FIELD: &'static str = "total_tasks";

    /// Returns the counter for one status.
    pub fn count(&self, status: TaskStatus) -> i64 {
        match status {
            TaskStatus::Pending => self.pending_tasks,
            TaskStatus::Processing => self.processing_tasks,
            TaskStatus::Completed => self.completed_tasks,
            TaskStatus::Failed => self.failed_tasks,
            TaskStatus::Retrying => self.retrying_tasks,
        }
    }

    /// Adds `delta` to the counter for one status.
    pub fn adjust(&mut self, status: TaskStatus, delta: i64) {
        let bucket = match status {
            TaskStatus::Pending => &mut self.pending_tasks,
            TaskStatus::Processing => &mut self.processing_tasks,
            TaskStatus::Completed => &mut self.completed_tasks,
            TaskStatus::Failed => &mut self.failed_tasks,
            TaskStatus::Retrying => &mut self.retrying_tasks,
        };
        *bucket += delta;
    }

    /// Moves one task from the `from` bucket to the `to` bucket.
    pub fn transition(&mut self, from: TaskStatus, to: TaskStatus) {
        if from != to {
            self.adjust(from, -1);
            self.adjust(to, 1);
        }
    }

    /// Builds stats from a counter hash as stored by the queue.
    ///
    /// Missing fields count as zero.
    pub fn from_counters<'a, I>(counters: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, i64)>,
    {
        let mut stats = TaskStats::default();
        for (field, value) in counters {
            if field == Self::TOTAL_FIELD {
                stats.total_tasks = value;
                continue;
            }
            if let Some(status) = TaskStatus::ALL
                .into_iter()
                .find(|status| status.counter_field() == field)
            {
                stats.adjust(status, value);
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_new_defaults() {
        let task = Task::log_analysis(["log-1", "log-2"]);

        assert!(!task.id.is_nil());
        assert_eq!(task.task_type(), TaskType::LogAnalysis);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, 0);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.created_at, task.scheduled_at);
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_none());
        assert!(task.error_msg.is_none());
        assert!(task.result.is_none());
        assert!(task.should_retry());
    }

    #[test]
    fn test_task_builder() {
        let task = Task::log_analysis(["log-1"])
            .with_priority(5)
            .with_max_retries(1);

        assert_eq!(task.priority, 5);
        assert_eq!(task.max_retries, 1);
        assert_eq!(task.remaining_retries(), 1);
    }

    #[test]
    fn test_task_serialization_shape() {
        let task = Task::log_analysis(["a", "b"]).with_priority(2);
        let value = serde_json::to_value(&task).expect("task should serialize");

        assert_eq!(value["type"], "log_analysis");
        assert_eq!(value["payload"]["log_ids"], serde_json::json!(["a", "b"]));
        assert_eq!(value["status"], "pending");
        assert_eq!(value["priority"], 2);
        assert_eq!(value["max_retries"], 3);
        assert!(value.get("started_at").is_none());
        assert!(value.get("error_msg").is_none());

        let parsed: Task = serde_json::from_value(value).expect("task should deserialize");
        assert_eq!(parsed, task);
    }

    #[test]
    fn test_processing_and_completion() {
        let mut task = Task::log_analysis(["log-1"]);
        task.mark_as_processing();
        assert_eq!(task.status, TaskStatus::Processing);
        assert!(task.started_at.is_some());

        let mut result = ResultMap::new();
        result.insert("analyzed_logs".to_string(), 1.into());
        task.mark_as_completed(Some(result.clone()));

        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.status.is_terminal());
        assert!(task.error_msg.is_none());
        assert!(task.completed_at.is_some());
        assert_eq!(task.result, Some(result));
    }

    #[test]
    fn test_retry_bookkeeping() {
        let mut task = Task::log_analysis(["log-1"]).with_max_retries(2);

        task.mark_as_processing();
        task.mark_as_retrying(Duration::from_secs(60));
        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(task.retry_count, 1);
        assert!(task.scheduled_at > task.created_at);
        assert!(task.should_retry());

        task.mark_as_pending();
        task.mark_as_processing();
        task.mark_as_retrying(Duration::ZERO);
        assert_eq!(task.retry_count, 2);
        assert!(!task.should_retry());
        assert_eq!(task.remaining_retries(), 0);

        task.mark_as_processing();
        task.mark_as_failed("backend unavailable");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_msg.as_deref(), Some("backend unavailable"));
    }

    #[test]
    fn test_completion_clears_stale_error() {
        let mut task = Task::log_analysis(["log-1"]);
        task.error_msg = Some("transient 503".to_string());

        task.mark_as_processing();
        task.mark_as_completed(None);

        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.error_msg.is_none());
    }

    #[test]
    fn test_expiry() {
        let mut task = Task::log_analysis(["log-1"]);
        assert!(!task.is_expired());

        task.created_at = Utc::now() - chrono::Duration::hours(25);
        assert!(task.is_expired());

        task.created_at = Utc::now() - chrono::Duration::hours(23);
        assert!(!task.is_expired());
    }

    #[test]
    fn test_status_roundtrip_and_classification() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>(), Ok(status));
        }
        assert!("unknown".parse::<TaskStatus>().is_err());

        assert!(TaskStatus::Pending.is_dequeueable());
        assert!(TaskStatus::Retrying.is_dequeueable());
        assert!(!TaskStatus::Processing.is_dequeueable());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
        assert_eq!(format!("{}", TaskStatus::Retrying), "retrying");
    }

    #[test]
    fn test_task_type_parse() {
        assert_eq!("log_analysis".parse::<TaskType>(), Ok(TaskType::LogAnalysis));
        assert!("image".parse::<TaskType>().is_err());
    }

    #[test]
    fn test_filter_matches_and_paginates() {
        let task = Task::log_analysis(["log-1"]);
        let filter = TaskFilter::new().with_task_type(TaskType::LogAnalysis);
        assert!(filter.matches(&task));

        let later = TaskFilter::new()
            .with_time_range(Some(Utc::now() + chrono::Duration::hours(1)), None);
        assert!(!later.matches(&task));

        let earlier = TaskFilter::new()
            .with_time_range(None, Some(Utc::now() - chrono::Duration::hours(1)));
        assert!(!earlier.matches(&task));

        let page = TaskFilter::new().with_offset(1).with_limit(2);
        assert_eq!(page.paginate(vec![1, 2, 3, 4]), vec![2, 3]);
        assert_eq!(
            TaskFilter::new().with_offset(10).paginate(vec![1, 2]),
            Vec::<i32>::new()
        );
        assert_eq!(TaskFilter::new().paginate(vec![1, 2]), vec![1, 2]);
    }

    #[test]
    fn test_stats_counters() {
        let mut stats = TaskStats::default();
        stats.total_tasks = 2;
        stats.adjust(TaskStatus::Pending, 2);
        stats.transition(TaskStatus::Pending, TaskStatus::Processing);
        stats.transition(TaskStatus::Processing, TaskStatus::Processing);

        assert_eq!(stats.count(TaskStatus::Pending), 1);
        assert_eq!(stats.count(TaskStatus::Processing), 1);

        let parsed = TaskStats::from_counters([
            ("total_tasks", 4),
            ("completed_tasks", 3),
            ("retrying_tasks", 1),
            ("bogus", 9),
        ]);
        assert_eq!(parsed.total_tasks, 4);
        assert_eq!(parsed.completed_tasks, 3);
        assert_eq!(parsed.retrying_tasks, 1);
        assert_eq!(parsed.pending_tasks, 0);
    }
}
