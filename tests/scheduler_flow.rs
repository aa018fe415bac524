//! End-to-end scheduler tests: workers, retries and timeouts over the
//! in-memory queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use chrono::Utc;
use loganalysis::scheduler::{
    MemoryTaskQueue, QueueService, ResultMap, RetryPolicy, Scheduler, SchedulerConfig, Task,
    TaskProcessor, TaskQueue, TaskStatus, TaskType,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Processor whose behavior is chosen per test.
struct ScriptedProcessor {
    calls: AtomicUsize,
    mode: Mode,
}

enum Mode {
    Succeed,
    Fail,
    FailOnce,
    Hang,
}

impl ScriptedProcessor {
    fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            mode,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskProcessor for ScriptedProcessor {
    async fn process_task(&self, task: &Task) -> anyhow::Result<ResultMap> {
        let previous_calls = self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            Mode::FailOnce if previous_calls == 0 => bail!("analysis service returned 503"),
            Mode::Succeed | Mode::FailOnce => {
                let mut result = ResultMap::new();
                result.insert("task".to_string(), json!(task.id.to_string()));
                Ok(result)
            }
            Mode::Fail => bail!("analysis service returned 503"),
            Mode::Hang => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(ResultMap::new())
            }
        }
    }

    fn can_process(&self, task_type: TaskType) -> bool {
        task_type == TaskType::LogAnalysis
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

fn fast_config(workers: usize) -> SchedulerConfig {
    SchedulerConfig::new(workers)
        .with_poll_timeout(Duration::from_millis(20))
        .with_shutdown_timeout(Duration::from_secs(5))
        .with_retry_policy(RetryPolicy {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        })
}

/// Polls until the task reaches a terminal status.
async fn wait_for_terminal(queue: &dyn TaskQueue, id: Uuid) -> Task {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let task = queue.get_task(id).await.expect("task should exist");
        if task.status.is_terminal() {
            return task;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {} stuck in {}",
            id,
            task.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_successful_task_through_service() {
    let queue = Arc::new(MemoryTaskQueue::new());
    let processor = ScriptedProcessor::new(Mode::Succeed);
    let mut service = QueueService::new(
        queue.clone(),
        fast_config(2),
        [processor.clone() as Arc<dyn TaskProcessor>],
    )
    .unwrap();

    let shutdown = CancellationToken::new();
    service.start(&shutdown).unwrap();
    assert!(service.is_running());

    let task = service
        .schedule_log_analysis(vec!["log-1".to_string()])
        .await
        .unwrap();
    let done = wait_for_terminal(queue.as_ref(), task.id).await;

    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());
    assert_eq!(
        done.result.as_ref().and_then(|r| r.get("task")),
        Some(&json!(task.id.to_string()))
    );

    service.stop().await.unwrap();
    assert!(!service.is_running());

    let stats = service.get_scheduler_stats().await;
    assert_eq!(stats.processed_tasks, 1);
    assert_eq!(stats.failed_tasks, 0);
    assert_eq!(processor.calls(), 1);
    assert_eq!(queue.leased_len().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failures_retry_until_bound() {
    let queue = Arc::new(MemoryTaskQueue::new());
    let processor = ScriptedProcessor::new(Mode::Fail);
    let mut scheduler = Scheduler::new(queue.clone(), fast_config(2));
    scheduler.register_processor(processor.clone()).unwrap();

    let task = Task::log_analysis(["log-1"]).with_max_retries(3);
    scheduler.schedule_task(&task).await.unwrap();

    let shutdown = CancellationToken::new();
    scheduler.start(&shutdown).unwrap();
    let done = wait_for_terminal(queue.as_ref(), task.id).await;
    scheduler.stop().await.unwrap();

    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.retry_count, 3);
    assert!(done
        .error_msg
        .as_deref()
        .is_some_and(|msg| msg.contains("503")));
    assert_eq!(processor.calls(), 4);

    let stats = scheduler.stats().await;
    assert_eq!(stats.retried_tasks, 3);
    assert_eq!(stats.failed_tasks, 1);

    let queue_stats = queue.get_stats().await.unwrap();
    assert_eq!(queue_stats.failed_tasks, 1);
    assert_eq!(queue_stats.retrying_tasks, 0);
    assert_eq!(queue_stats.processing_tasks, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_processing_timeout_fails_task() {
    let queue = Arc::new(MemoryTaskQueue::new());
    let mut scheduler = Scheduler::new(
        queue.clone(),
        fast_config(1).with_job_timeout(Duration::from_millis(50)),
    );
    scheduler
        .register_processor(ScriptedProcessor::new(Mode::Hang))
        .unwrap();

    let task = Task::log_analysis(["log-1"]).with_max_retries(0);
    scheduler.schedule_task(&task).await.unwrap();

    let shutdown = CancellationToken::new();
    scheduler.start(&shutdown).unwrap();
    let done = wait_for_terminal(queue.as_ref(), task.id).await;
    scheduler.stop().await.unwrap();

    assert_eq!(done.status, TaskStatus::Failed);
    assert!(done
        .error_msg
        .as_deref()
        .is_some_and(|msg| msg.contains("timed out")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_task_without_processor_fails() {
    let queue = Arc::new(MemoryTaskQueue::new());
    let mut scheduler = Scheduler::new(queue.clone(), fast_config(1));

    // Bypasses schedule_task, which refuses types without a processor
    let task = Task::log_analysis(["log-1"]);
    queue.enqueue(&task).await.unwrap();

    let shutdown = CancellationToken::new();
    scheduler.start(&shutdown).unwrap();
    let done = wait_for_terminal(queue.as_ref(), task.id).await;
    scheduler.stop().await.unwrap();

    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(
        done.error_msg.as_deref(),
        Some("no processor found for task type: log_analysis")
    );
    assert_eq!(done.retry_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelling_parent_token_stops_workers() {
    let queue = Arc::new(MemoryTaskQueue::new());
    let processor = ScriptedProcessor::new(Mode::Succeed);
    let mut scheduler = Scheduler::new(queue.clone(), fast_config(2));
    scheduler.register_processor(processor.clone()).unwrap();

    let shutdown = CancellationToken::new();
    scheduler.start(&shutdown).unwrap();
    shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Workers exited; a new task stays pending
    let task = Task::log_analysis(["log-1"]);
    scheduler.schedule_task(&task).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        queue.get_task(task.id).await.unwrap().status,
        TaskStatus::Pending
    );
    assert_eq!(processor.calls(), 0);
    scheduler.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retry_then_success_clears_error() {
    let queue = Arc::new(MemoryTaskQueue::new());
    let processor = ScriptedProcessor::new(Mode::FailOnce);
    let mut scheduler = Scheduler::new(queue.clone(), fast_config(1));
    scheduler.register_processor(processor.clone()).unwrap();

    let task = Task::log_analysis(["log-1"]).with_max_retries(3);
    scheduler.schedule_task(&task).await.unwrap();

    let shutdown = CancellationToken::new();
    scheduler.start(&shutdown).unwrap();
    let done = wait_for_terminal(queue.as_ref(), task.id).await;
    scheduler.stop().await.unwrap();

    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.retry_count, 1);
    assert!(done.error_msg.is_none());
    assert_eq!(processor.calls(), 2);

    let stats = scheduler.stats().await;
    assert_eq!(stats.retried_tasks, 1);
    assert_eq!(stats.processed_tasks, 1);
    assert_eq!(stats.failed_tasks, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_maintenance_purges_expired_tasks() {
    let queue = Arc::new(MemoryTaskQueue::new());
    let mut scheduler = Scheduler::new(
        queue.clone(),
        fast_config(1).with_cleanup_interval(Duration::from_millis(20)),
    );
    scheduler
        .register_processor(ScriptedProcessor::new(Mode::Succeed))
        .unwrap();

    let mut stale = Task::log_analysis(["log-1"]);
    stale.created_at = Utc::now() - chrono::Duration::hours(25);
    queue.enqueue(&stale).await.unwrap();
    // Finish it by hand so no worker touches it before the purge
    let mut claimed = queue
        .dequeue_with_timeout(Duration::from_millis(50))
        .await
        .unwrap()
        .expect("stale task should be claimable");
    claimed.mark_as_completed(None);
    queue.update_task(&claimed).await.unwrap();

    let fresh = Task::log_analysis(["log-2"]);
    scheduler.schedule_task(&fresh).await.unwrap();

    let shutdown = CancellationToken::new();
    scheduler.start(&shutdown).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while queue.get_task(stale.id).await.is_ok() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "expired task was never purged"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let done = wait_for_terminal(queue.as_ref(), fresh.id).await;
    scheduler.stop().await.unwrap();

    assert_eq!(done.status, TaskStatus::Completed);
    let stats = queue.get_stats().await.unwrap();
    assert_eq!(stats.total_tasks, 1);
    assert_eq!(stats.completed_tasks, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_maintenance_requeues_expired_lease() {
    let queue = Arc::new(MemoryTaskQueue::new().with_lease_duration(Duration::from_millis(30)));
    let processor = ScriptedProcessor::new(Mode::Succeed);
    let mut scheduler = Scheduler::new(
        queue.clone(),
        fast_config(1)
            .with_cleanup_interval(Duration::from_millis(20))
            .with_reclaim_leases(true),
    );
    scheduler.register_processor(processor.clone()).unwrap();

    let task = Task::log_analysis(["log-1"]).with_max_retries(3);
    scheduler.schedule_task(&task).await.unwrap();
    // A claim whose worker never reports back
    queue
        .dequeue_with_timeout(Duration::from_millis(50))
        .await
        .unwrap()
        .expect("task should be claimable");

    let shutdown = CancellationToken::new();
    scheduler.start(&shutdown).unwrap();
    let done = wait_for_terminal(queue.as_ref(), task.id).await;
    scheduler.stop().await.unwrap();

    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.retry_count, 1);
    assert_eq!(processor.calls(), 1);
    assert_eq!(queue.leased_len().await, 0);
}
