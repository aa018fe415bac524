//! Redis-backed task queue.
//!
//! Uses sorted sets for the ready, delayed and lease indices, a hash for the
//! status index and another for the counters. Enqueue is a `MULTI/EXEC`
//! pipeline; every later state change runs as one Lua script, so the body,
//! the indices and the counters always move together.
//!
//! # Claiming
//!
//! A worker reads the head of the ready index, prepares the claimed body and
//! hands both to the transition script. The script applies the claim only if
//! the entry is still in the ready index and the stored body is unchanged, so
//! a task id is handed to exactly one caller and a failed round trip leaves
//! the task where it was. Delayed promotion and lease reclaim are guarded the
//! same way.
//!
//! Waiting for work polls at `poll_interval` instead of issuing a blocking
//! pop, because the shared [`ConnectionManager`] multiplexes one connection
//! and a server-side block would stall every other command on it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::queue::{lease_expired_message, QueueError, QueueKeys, TaskQueue, LEASE_DURATION};
use super::task::{Task, TaskFilter, TaskStats, TaskStatus, TASK_TTL};

/// Default interval between ready-index polls while waiting for work.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Moves one task to a new status in a single server-side step.
///
/// KEYS: body, status hash, counters hash, ready, delayed, lease.
/// ARGV: member, expected body ('' skips the check), new body, TTL seconds,
/// new status, ready score, delayed score, lease score, guard (the KEYS
/// position the member must still be in, 0 for none).
///
/// Returns 0 without writing when the task has no status entry, the stored
/// body changed, or the guard entry is already gone. Counter fields are
/// `<status>_tasks`.
const TRANSITION_SCRIPT: &str = r#"
local member = ARGV[1]
local previous = redis.call('HGET', KEYS[2], member)
if not previous then
  return 0
end
if ARGV[2] ~= '' and redis.call('GET', KEYS[1]) ~= ARGV[2] then
  return 0
end
local guard = tonumber(ARGV[9])
if guard > 0 and redis.call('ZREM', KEYS[guard], member) == 0 then
  return 0
end

local status = ARGV[5]
redis.call('SET', KEYS[1], ARGV[3], 'EX', ARGV[4])
redis.call('HSET', KEYS[2], member, status)
if previous ~= status then
  redis.call('HINCRBY', KEYS[3], previous .. '_tasks', -1)
  redis.call('HINCRBY', KEYS[3], status .. '_tasks', 1)
end

redis.call('ZREM', KEYS[4], member)
redis.call('ZREM', KEYS[5], member)
redis.call('ZREM', KEYS[6], member)
if status == 'pending' then
  redis.call('ZADD', KEYS[4], ARGV[6], member)
elseif status == 'retrying' then
  redis.call('ZADD', KEYS[5], ARGV[7], member)
elseif status == 'processing' then
  redis.call('ZADD', KEYS[6], ARGV[8], member)
end
return 1
"#;

/// Removes a task from every structure and its counters.
///
/// KEYS as for the transition script. ARGV: member, total counter field.
const DELETE_SCRIPT: &str = r#"
local member = ARGV[1]
local previous = redis.call('HGET', KEYS[2], member)
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[4], member)
redis.call('ZREM', KEYS[5], member)
redis.call('ZREM', KEYS[6], member)
redis.call('HDEL', KEYS[2], member)
if previous then
  redis.call('HINCRBY', KEYS[3], previous .. '_tasks', -1)
  redis.call('HINCRBY', KEYS[3], ARGV[2], -1)
  return 1
end
return 0
"#;

/// Index a transition must remove the task from before it applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Guard {
    None = 0,
    Ready = 4,
    Delayed = 5,
    Lease = 6,
}

/// Redis-based task queue.
pub struct RedisTaskQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    keys: QueueKeys,
    poll_interval: Duration,
    transition_script: Script,
    delete_script: Script,
}

impl RedisTaskQueue {
    /// Connects to Redis and creates a new task queue.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `key_prefix` - Prefix for every key of this queue
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, key_prefix: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, key_prefix))
    }

    /// Creates a queue from an existing ConnectionManager.
    ///
    /// Useful when sharing a connection across multiple components.
    pub fn from_connection(redis: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            redis,
            keys: QueueKeys::new(key_prefix),
            poll_interval: DEFAULT_POLL_INTERVAL,
            transition_script: Script::new(TRANSITION_SCRIPT),
            delete_script: Script::new(DELETE_SCRIPT),
        }
    }

    /// Sets how often the ready index is polled while waiting.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    /// Loads a task together with its stored body.
    async fn load_raw(&self, id: Uuid) -> Result<Option<(String, Task)>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.get(self.keys.data(id)).await?;

        match data {
            Some(body) => {
                let task = serde_json::from_str(&body)?;
                Ok(Some((body, task)))
            }
            None => Ok(None),
        }
    }

    async fn load(&self, id: Uuid) -> Result<Option<Task>, QueueError> {
        Ok(self.load_raw(id).await?.map(|(_, task)| task))
    }

    async fn load_member(&self, member: &str) -> Result<Option<(String, Task)>, QueueError> {
        match Uuid::parse_str(member) {
            Ok(id) => self.load_raw(id).await,
            Err(e) => {
                warn!(member = %member, error = %e, "Skipping index entry with an invalid id");
                Ok(None)
            }
        }
    }

    /// Writes `task` in its current status through the transition script.
    ///
    /// Returns whether the transition applied.
    async fn transition(
        &self,
        task: &Task,
        expected_body: Option<&str>,
        guard: Guard,
    ) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let body = serde_json::to_string(task)?;
        let lease_expiry = Utc::now() + lease_duration();

        let applied: i64 = self
            .transition_script
            .key(self.keys.data(task.id))
            .key(&self.keys.status)
            .key(&self.keys.stats)
            .key(&self.keys.ready)
            .key(&self.keys.schedule)
            .key(&self.keys.processing)
            .arg(task.id.to_string())
            .arg(expected_body.unwrap_or(""))
            .arg(body)
            .arg(TASK_TTL.as_secs())
            .arg(task.status.as_str())
            .arg(task.priority)
            .arg(time_score(task.scheduled_at))
            .arg(time_score(lease_expiry))
            .arg(guard as u8)
            .invoke_async(&mut conn)
            .await?;

        Ok(applied == 1)
    }

    /// Moves every delayed task that is due into the ready index.
    async fn promote_due_tasks(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let due: Vec<String> = conn
            .zrangebyscore(&self.keys.schedule, "-inf", time_score(Utc::now()))
            .await?;

        let mut promoted = 0;
        for member in due {
            let Some((stored, mut task)) = self.load_member(&member).await? else {
                continue;
            };

            task.mark_as_pending();
            // Only the caller that still finds the entry promotes it
            if self.transition(&task, Some(&stored), Guard::Delayed).await? {
                promoted += 1;
            }
        }

        if promoted > 0 {
            debug!(promoted = promoted, "Promoted delayed tasks to the ready index");
        }

        Ok(promoted)
    }

    /// Claims the highest-priority ready task.
    async fn claim_next(&self) -> Result<Option<Task>, QueueError> {
        let mut conn = self.redis.clone();

        loop {
            let head: Vec<String> = conn.zrevrange(&self.keys.ready, 0, 0).await?;
            let Some(member) = head.into_iter().next() else {
                return Ok(None);
            };

            let Some((stored, mut task)) = self.load_member(&member).await? else {
                warn!(task_id = %member, "Dropping ready entry without a stored body");
                let _: i64 = conn.zrem(&self.keys.ready, &member).await?;
                continue;
            };

            task.mark_as_processing();
            if self.transition(&task, Some(&stored), Guard::Ready).await? {
                return Ok(Some(task));
            }
            // Lost the race for this entry; look at the new head
        }
    }

    /// Returns ids from the status index, optionally restricted to one status.
    async fn indexed_ids(&self, status: Option<TaskStatus>) -> Result<Vec<Uuid>, QueueError> {
        let mut conn = self.redis.clone();
        let entries: HashMap<String, String> = conn.hgetall(&self.keys.status).await?;

        Ok(entries
            .into_iter()
            .filter(|(_, s)| status.map_or(true, |wanted| wanted.as_str() == s))
            .filter_map(|(id, _)| Uuid::parse_str(&id).ok())
            .collect())
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, task: &Task) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let member = task.id.to_string();

        let body = serde_json::to_string(task)?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("SET")
            .arg(self.keys.data(task.id))
            .arg(body)
            .arg("EX")
            .arg(TASK_TTL.as_secs())
            .ignore();

        match task.status {
            TaskStatus::Pending => {
                pipe.zadd(&self.keys.ready, &member, task.priority).ignore();
            }
            TaskStatus::Retrying => {
                pipe.zadd(&self.keys.schedule, &member, time_score(task.scheduled_at))
                    .ignore();
            }
            _ => {}
        }

        pipe.hset(&self.keys.status, &member, task.status.as_str())
            .ignore();
        pipe.hincr(&self.keys.stats, TaskStats::TOTAL_FIELD, 1)
            .ignore();
        pipe.hincr(&self.keys.stats, task.status.counter_field(), 1)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    async fn dequeue_with_timeout(&self, timeout: Duration) -> Result<Option<Task>, QueueError> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        loop {
            self.promote_due_tasks().await?;

            if let Some(task) = self.claim_next().await? {
                return Ok(Some(task));
            }

            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    remaining.min(self.poll_interval)
                }
                None => self.poll_interval,
            };

            tokio::time::sleep(wait).await;
        }
    }

    async fn update_task(&self, task: &Task) -> Result<(), QueueError> {
        if self.transition(task, None, Guard::None).await? {
            Ok(())
        } else {
            Err(QueueError::TaskNotFound(task.id))
        }
    }

    async fn get_task(&self, id: Uuid) -> Result<Task, QueueError> {
        self.load(id).await?.ok_or(QueueError::TaskNotFound(id))
    }

    async fn get_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, QueueError> {
        let ids = self.indexed_ids(filter.status).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let keys: Vec<String> = ids.iter().map(|id| self.keys.data(*id)).collect();
        let bodies: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut tasks: Vec<Task> = bodies
            .into_iter()
            .flatten()
            .filter_map(|body| match serde_json::from_str::<Task>(&body) {
                Ok(task) => Some(task),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable task body");
                    None
                }
            })
            .filter(|task| filter.matches(task))
            .collect();

        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        Ok(filter.paginate(tasks))
    }

    async fn delete_task(&self, id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let _: i64 = self
            .delete_script
            .key(self.keys.data(id))
            .key(&self.keys.status)
            .key(&self.keys.stats)
            .key(&self.keys.ready)
            .key(&self.keys.schedule)
            .key(&self.keys.processing)
            .arg(id.to_string())
            .arg(TaskStats::TOTAL_FIELD)
            .invoke_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn get_stats(&self) -> Result<TaskStats, QueueError> {
        let mut conn = self.redis.clone();
        let counters: HashMap<String, i64> = conn.hgetall(&self.keys.stats).await?;

        Ok(TaskStats::from_counters(
            counters.iter().map(|(field, value)| (field.as_str(), *value)),
        ))
    }

    async fn cleanup_expired_tasks(&self) -> Result<u64, QueueError> {
        let now = Utc::now();
        let mut removed = 0;

        for id in self.indexed_ids(None).await? {
            // A missing body means Redis already expired it; drop the indices too
            let expired = match self.load(id).await {
                Ok(Some(task)) => task.is_expired_at(now),
                Ok(None) => true,
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Skipping task during cleanup");
                    false
                }
            };

            if expired {
                self.delete_task(id).await?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    async fn reclaim_expired_leases(&self) -> Result<u64, QueueError> {
        let mut conn = self.redis.clone();
        let expired: Vec<String> = conn
            .zrangebyscore(&self.keys.processing, "-inf", time_score(Utc::now()))
            .await?;

        let mut reclaimed = 0;
        for member in expired {
            let Some((stored, mut task)) = self.load_member(&member).await? else {
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

            if !self.transition(&task, Some(&stored), Guard::Lease).await? {
                continue;
            }

            warn!(
                task_id = %task.id,
                status = %task.status,
                retry_count = task.retry_count,
                "Reclaimed task with expired lease"
            );
            reclaimed += 1;
        }

        Ok(reclaimed)
    }
}

/// Sorted-set score for a point in time (epoch milliseconds).
fn time_score(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn lease_duration() -> chrono::Duration {
    chrono::Duration::from_std(LEASE_DURATION).unwrap_or_else(|_| chrono::Duration::minutes(10))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_score_orders_by_time() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(1);

        assert!(time_score(now) < time_score(later));
        assert_eq!(time_score(later) - time_score(now), 1000);
    }

    #[test]
    fn test_lease_duration_is_ten_minutes() {
        assert_eq!(lease_duration(), chrono::Duration::minutes(10));
    }

    #[test]
    fn test_scripts_use_status_counter_fields() {
        // The scripts derive counter fields as `<status>_tasks`
        for status in TaskStatus::ALL {
            assert_eq!(status.counter_field(), format!("{}_tasks", status.as_str()));
        }
        assert!(DELETE_SCRIPT.contains("'_tasks'"));
        assert!(TRANSITION_SCRIPT.contains("'_tasks'"));
    }

    #[test]
    fn test_guard_positions_match_script_keys() {
        assert_eq!(Guard::None as u8, 0);
        assert_eq!(Guard::Ready as u8, 4);
        assert_eq!(Guard::Delayed as u8, 5);
        assert_eq!(Guard::Lease as u8, 6);
    }

    #[test]
    fn test_default_poll_interval_is_below_worker_timeout() {
        assert!(DEFAULT_POLL_INTERVAL < Duration::from_secs(5));
    }
}
