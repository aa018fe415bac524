//! In-process task queue.
//!
//! Mirrors the Redis layout with ordered sets guarded by one mutex. Every
//! operation runs inside a single lock section, which gives the same
//! atomicity as a `MULTI/EXEC` pipeline. Used by tests and single-process
//! deployments that do not need persistence.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use super::queue::{lease_expired_message, QueueError, TaskQueue, LEASE_DURATION};
use super::task::{Task, TaskFilter, TaskStats, TaskStatus};

/// Set of task ids ordered by score, ties broken by insertion order.
#[derive(Debug)]
struct ScoredSet<S: Ord + Copy> {
    entries: BTreeSet<(S, u64, Uuid)>,
    index: HashMap<Uuid, (S, u64)>,
    next_seq: u64,
}

impl<S: Ord + Copy> ScoredSet<S> {
    fn new() -> Self {
        Self {
            entries: BTreeSet::new(),
            index: HashMap::new(),
            next_seq: 0,
        }
    }

    fn insert(&mut self, id: Uuid, score: S) {
        self.remove(id);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((score, seq, id));
        self.index.insert(id, (score, seq));
    }

    fn remove(&mut self, id: Uuid) -> bool {
        match self.index.remove(&id) {
            Some((score, seq)) => self.entries.remove(&(score, seq, id)),
            None => false,
        }
    }

    fn pop_first(&mut self) -> Option<Uuid> {
        let (_, _, id) = self.entries.pop_first()?;
        self.index.remove(&id);
        Some(id)
    }

    fn first_score(&self) -> Option<S> {
        self.entries.first().map(|(score, _, _)| *score)
    }

    /// Removes and returns every id scored at or below `max`.
    fn take_due(&mut self, max: S) -> Vec<Uuid> {
        let mut due = Vec::new();
        while let Some(&(score, _, id)) = self.entries.first() {
            if score > max {
                break;
            }
            self.remove(id);
            due.push(id);
        }
        due
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug)]
struct State {
    bodies: HashMap<Uuid, Task>,
    status: HashMap<Uuid, TaskStatus>,
    ready: ScoredSet<Reverse<i32>>,
    delayed: ScoredSet<DateTime<Utc>>,
    leases: ScoredSet<DateTime<Utc>>,
    stats: TaskStats,
    lease: chrono::Duration,
}

impl State {
    fn new() -> Self {
        Self {
            bodies: HashMap::new(),
            status: HashMap::new(),
            ready: ScoredSet::new(),
            delayed: ScoredSet::new(),
            leases: ScoredSet::new(),
            stats: TaskStats::default(),
            lease: to_chrono(LEASE_DURATION),
        }
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        for id in self.delayed.take_due(now) {
            let Some(task) = self.bodies.get_mut(&id) else {
                continue;
            };
            let previous = task.status;
            task.mark_as_pending();
            let (status, priority) = (task.status, task.priority);

            self.ready.insert(id, Reverse(priority));
            self.status.insert(id, status);
            self.stats.transition(previous, status);
        }
    }

    fn claim_next(&mut self, now: DateTime<Utc>) -> Option<Task> {
        while let Some(id) = self.ready.pop_first() {
            let Some(task) = self.bodies.get_mut(&id) else {
                continue;
            };
            let previous = task.status;
            task.mark_as_processing();
            let claimed = task.clone();

            self.status.insert(id, claimed.status);
            self.stats.transition(previous, claimed.status);
            self.leases.insert(id, now + self.lease);

            return Some(claimed);
        }
        None
    }

    /// Writes a known task in its current status.
    ///
    /// Returns `TaskNotFound` without touching anything when the task was
    /// deleted or purged in the meantime. Otherwise the task ends up in
    /// exactly the index its status calls for.
    fn apply_update(&mut self, task: &Task, now: DateTime<Utc>) -> Result<(), QueueError> {
        let Some(previous) = self.status.insert(task.id, task.status) else {
            self.status.remove(&task.id);
            return Err(QueueError::TaskNotFound(task.id));
        };
        self.bodies.insert(task.id, task.clone());
        self.stats.transition(previous, task.status);

        self.ready.remove(task.id);
        self.delayed.remove(task.id);
        self.leases.remove(task.id);
        match task.status {
            TaskStatus::Pending => self.ready.insert(task.id, Reverse(task.priority)),
            TaskStatus::Retrying => self.delayed.insert(task.id, task.scheduled_at),
            TaskStatus::Processing => self.leases.insert(task.id, now + self.lease),
            TaskStatus::Completed | TaskStatus::Failed => {}
        }

        Ok(())
    }

    fn remove(&mut self, id: Uuid) {
        self.bodies.remove(&id);
        self.ready.remove(id);
        self.delayed.remove(id);
        self.leases.remove(id);

        if let Some(status) = self.status.remove(&id) {
            self.stats.adjust(status, -1);
            self.stats.total_tasks -= 1;
        }
    }
}

/// Task queue held entirely in process memory.
///
/// Task bodies do not expire on their own; `cleanup_expired_tasks` removes
/// them once they pass the TTL.
#[derive(Debug)]
pub struct MemoryTaskQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::new()),
            notify: Notify::new(),
        }
    }

    /// Sets how long a claim is held before reclaim may requeue it.
    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.state.get_mut().lease = to_chrono(lease);
        self
    }

    /// Number of tasks waiting in the ready index.
    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    /// Number of tasks waiting in the delayed index.
    pub async fn delayed_len(&self) -> usize {
        self.state.lock().await.delayed.len()
    }

    /// Number of claims currently holding a lease.
    pub async fn leased_len(&self) -> usize {
        self.state.lock().await.leases.len()
    }
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, task: &Task) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            state.bodies.insert(task.id, task.clone());
            state.status.insert(task.id, task.status);

            match task.status {
                TaskStatus::Pending => state.ready.insert(task.id, Reverse(task.priority)),
                TaskStatus::Retrying => state.delayed.insert(task.id, task.scheduled_at),
                _ => {}
            }

            state.stats.total_tasks += 1;
            state.stats.adjust(task.status, 1);
        }

        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue_with_timeout(&self, timeout: Duration) -> Result<Option<Task>, QueueError> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        loop {
            // Registered before the lock so a concurrent enqueue is not missed
            let notified = self.notify.notified();

            let next_due = {
                let mut state = self.state.lock().await;
                let now = Utc::now();
                state.promote_due(now);
                if let Some(task) = state.claim_next(now) {
                    return Ok(Some(task));
                }
                state.delayed.first_score()
            };

            let mut wait = next_due.map(|due| (due - Utc::now()).to_std().unwrap_or(Duration::ZERO));
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(None);
                }
                wait = Some(wait.map_or(remaining, |w| w.min(remaining)));
            }

            match wait {
                Some(wait) => {
                    let _ = tokio::time::timeout(wait, notified).await;
                }
                None => notified.await,
            }
        }
    }

    async fn update_task(&self, task: &Task) -> Result<(), QueueError> {
        self.state.lock().await.apply_update(task, Utc::now())?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Task, QueueError> {
        let state = self.state.lock().await;
        state
            .bodies
            .get(&id)
            .cloned()
            .ok_or(QueueError::TaskNotFound(id))
    }

    async fn get_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, QueueError> {
        let state = self.state.lock().await;

        let mut tasks: Vec<Task> = state
            .status
            .iter()
            .filter(|(_, status)| filter.status.map_or(true, |wanted| wanted == **status))
            .filter_map(|(id, _)| state.bodies.get(id))
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();

        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        Ok(filter.paginate(tasks))
    }

    async fn delete_task(&self, id: Uuid) -> Result<(), QueueError> {
        self.state.lock().await.remove(id);
        Ok(())
    }

    async fn get_stats(&self) -> Result<TaskStats, QueueError> {
        Ok(self.state.lock().await.stats)
    }

    async fn cleanup_expired_tasks(&self) -> Result<u64, QueueError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let expired: Vec<Uuid> = state
            .bodies
            .values()
            .filter(|task| task.is_expired_at(now))
            .map(|task| task.id)
            .collect();

        for id in &expired {
            state.remove(*id);
        }

        Ok(expired.len() as u64)
    }

    async fn reclaim_expired_leases(&self) -> Result<u64, QueueError> {
        let mut reclaimed = 0;
        {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            for id in state.leases.take_due(now) {
                let Some(mut task) = state.bodies.get(&id).cloned() else {
                    continue;
                };
                if task.status != TaskStatus::Processing {
                    continue;
                }

                if task.should_retry() {
                    task.mark_as_retrying(Duration::ZERO);
                } else {
                    let message = lease_expired_message(&task);
                    task.mark_as_failed(message);
                }

                tracing::warn!(
                    task_id = %task.id,
                    status = %task.status,
                    retry_count = task.retry_count,
                    "Reclaimed task with expired lease"
                );

                state.apply_update(&task, now)?;
                reclaimed += 1;
            }
        }

        if reclaimed > 0 {
            self.notify.notify_waiters();
        }
        Ok(reclaimed)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::minutes(10))
}
