use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const QUEUE_KEY: &str = "render:tasks";
const PROCESSING_PREFIX: &str = "render:processing:";
const LEASE_PREFIX: &str = "render:lease:";

/// Task payload handed from submission to a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderTask {
    pub job_id: Uuid,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub filename: String,
    /// Render command with `{input}`/`{output}` already replaced by quoted absolute paths.
    pub command: String,
}

/// At-least-once task queue between submission and execution.
///
/// Each handle is one consumer. Delivered tasks sit in that consumer's
/// in-flight list until acknowledged; a consumer keeps them by renewing
/// its lease.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: &RenderTask) -> Result<(), QueueError>;

    /// Take the next task, moving it to this consumer's in-flight list until `complete` is called.
    async fn dequeue(&self) -> Result<Option<RenderTask>, QueueError>;

    /// Acknowledge a delivered task.
    async fn complete(&self, task: &RenderTask) -> Result<(), QueueError>;

    /// Renew this consumer's lease for `ttl`.
    async fn heartbeat(&self, ttl: Duration) -> Result<(), QueueError>;

    /// Put tasks held by consumers without a live lease back on the queue.
    /// Returns how many moved.
    async fn requeue_abandoned(&self) -> Result<u64, QueueError>;

    /// Number of tasks waiting for a worker.
    async fn depth(&self) -> Result<u64, QueueError>;
}

/// Redis-backed task queue: one pending list, plus an in-flight list and a
/// lease key per consumer.
pub struct RedisTaskQueue {
    client: redis::Client,
    consumer: Uuid,
}

impl RedisTaskQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            consumer: Uuid::new_v4(),
        })
    }

    pub fn consumer(&self) -> Uuid {
        self.consumer
    }

    fn processing_key(&self) -> String {
        format!("{PROCESSING_PREFIX}{}", self.consumer)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, task: &RenderTask) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(task).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<RenderTask>, QueueError> {
        let mut conn = self.connection().await?;
        let result: Option<String> = conn
            .rpoplpush(QUEUE_KEY, self.processing_key())
            .await
            .map_err(QueueError::Redis)?;

        match result {
            Some(payload) => {
                let task: RenderTask =
                    serde_json::from_str(&payload).map_err(QueueError::Serialize)?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn complete(&self, task: &RenderTask) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(task).map_err(QueueError::Serialize)?;
        conn.lrem::<_, _, ()>(self.processing_key(), 1, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn heartbeat(&self, ttl: Duration) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        conn.set_ex::<_, _, ()>(
            format!("{LEASE_PREFIX}{}", self.consumer),
            1,
            ttl.as_secs().max(1),
        )
        .await
        .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn requeue_abandoned(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let lists: Vec<String> = conn
            .keys(format!("{PROCESSING_PREFIX}*"))
            .await
            .map_err(QueueError::Redis)?;

        let mut moved = 0;
        for list in lists {
            let owner = list.trim_start_matches(PROCESSING_PREFIX);
            let alive: bool = conn
                .exists(format!("{LEASE_PREFIX}{owner}"))
                .await
                .map_err(QueueError::Redis)?;
            if alive {
                continue;
            }
            loop {
                let result: Option<String> = conn
                    .rpoplpush(&list, QUEUE_KEY)
                    .await
                    .map_err(QueueError::Redis)?;
                if result.is_none() {
                    break;
                }
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(QUEUE_KEY).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }
}

#[derive(Default)]
struct MemoryLists {
    pending: VecDeque<RenderTask>,
    in_flight: HashMap<Uuid, Vec<RenderTask>>,
    leases: HashMap<Uuid, Instant>,
}

/// In-process FIFO queue with the same delivery semantics as the Redis queue.
/// Handles created with [`MemoryTaskQueue::consumer`] share the lists.
pub struct MemoryTaskQueue {
    lists: Arc<Mutex<MemoryLists>>,
    consumer: Uuid,
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self {
            lists: Arc::default(),
            consumer: Uuid::new_v4(),
        }
    }

    /// Another consumer of the same queue.
    pub fn consumer(&self) -> Self {
        Self {
            lists: Arc::clone(&self.lists),
            consumer: Uuid::new_v4(),
        }
    }

    /// Delivered but unacknowledged tasks across all consumers.
    pub fn in_flight(&self) -> usize {
        self.lists
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_flight
            .values()
            .map(Vec::len)
            .sum()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, task: &RenderTask) -> Result<(), QueueError> {
        let mut lists = self.lists.lock().unwrap_or_else(PoisonError::into_inner);
        lists.pending.push_back(task.clone());
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<RenderTask>, QueueError> {
        let mut lists = self.lists.lock().unwrap_or_else(PoisonError::into_inner);
        let task = lists.pending.pop_front();
        if let Some(task) = &task {
            lists
                .in_flight
                .entry(self.consumer)
                .or_default()
                .push(task.clone());
        }
        Ok(task)
    }

    async fn complete(&self, task: &RenderTask) -> Result<(), QueueError> {
        let mut lists = self.lists.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(held) = lists.in_flight.get_mut(&self.consumer) {
            if let Some(pos) = held.iter().position(|t| t == task) {
                held.remove(pos);
            }
        }
        Ok(())
    }

    async fn heartbeat(&self, ttl: Duration) -> Result<(), QueueError> {
        let mut lists = self.lists.lock().unwrap_or_else(PoisonError::into_inner);
        lists.leases.insert(self.consumer, Instant::now() + ttl);
        Ok(())
    }

    async fn requeue_abandoned(&self) -> Result<u64, QueueError> {
        let now = Instant::now();
        let mut lists = self.lists.lock().unwrap_or_else(PoisonError::into_inner);
        lists.leases.retain(|_, expiry| *expiry > now);

        let dead: Vec<Uuid> = lists
            .in_flight
            .keys()
            .filter(|owner| !lists.leases.contains_key(*owner))
            .copied()
            .collect();

        let mut count = 0;
        for owner in dead {
            let moved = lists.in_flight.remove(&owner).unwrap_or_default();
            count += moved.len() as u64;
            for task in moved.into_iter().rev() {
                lists.pending.push_front(task);
            }
        }
        Ok(count)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let lists = self.lists.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(lists.pending.len() as u64)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str) -> RenderTask {
        RenderTask {
            job_id: Uuid::new_v4(),
            input_path: PathBuf::from(format!("/uploads/{name}")),
            output_path: PathBuf::from(format!("/uploads/rendered/{name}")),
            filename: name.to_string(),
            command: format!("cp '/uploads/{name}' '/uploads/rendered/{name}'"),
        }
    }

    #[tokio::test]
    async fn test_memory_queue_is_fifo() {
        let queue = MemoryTaskQueue::new();
        let first = task("a.mp4");
        let second = task("b.mp4");
        queue.enqueue(&first).await.unwrap();
        queue.enqueue(&second).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 2);

        assert_eq!(queue.dequeue().await.unwrap(), Some(first));
        assert_eq!(queue.dequeue().await.unwrap(), Some(second));
        assert_eq!(queue.dequeue().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unacknowledged_tasks_are_redelivered() {
        let queue = MemoryTaskQueue::new();
        let first = task("a.mp4");
        let second = task("b.mp4");
        queue.enqueue(&first).await.unwrap();
        queue.enqueue(&second).await.unwrap();

        let delivered = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(queue.in_flight(), 1);

        assert_eq!(queue.requeue_abandoned().await.unwrap(), 1);
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.dequeue().await.unwrap(), Some(delivered));
    }

    #[tokio::test]
    async fn test_complete_removes_in_flight_task() {
        let queue = MemoryTaskQueue::new();
        let t = task("a.mp4");
        queue.enqueue(&t).await.unwrap();
        let delivered = queue.dequeue().await.unwrap().unwrap();
        queue.complete(&delivered).await.unwrap();

        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.requeue_abandoned().await.unwrap(), 0);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_live_lease_keeps_tasks_with_their_consumer() {
        let first = MemoryTaskQueue::new();
        let second = first.consumer();
        let t = task("a.mp4");
        first.enqueue(&t).await.unwrap();

        first.heartbeat(Duration::from_secs(30)).await.unwrap();
        first.dequeue().await.unwrap().unwrap();

        // A second consumer starting up leaves the running task alone.
        second.heartbeat(Duration::from_secs(30)).await.unwrap();
        assert_eq!(second.requeue_abandoned().await.unwrap(), 0);
        assert_eq!(second.dequeue().await.unwrap(), None);
        assert_eq!(first.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_expired_lease_releases_tasks() {
        let first = MemoryTaskQueue::new();
        let second = first.consumer();
        let t = task("a.mp4");
        first.enqueue(&t).await.unwrap();

        first.heartbeat(Duration::from_millis(20)).await.unwrap();
        first.dequeue().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(second.requeue_abandoned().await.unwrap(), 1);
        assert_eq!(second.dequeue().await.unwrap(), Some(t));
    }

    #[test]
    fn test_task_payload_round_trips() {
        let t = task("with space.mp4");
        let payload = serde_json::to_string(&t).unwrap();
        let back: RenderTask = serde_json::from_str(&payload).unwrap();
        assert_eq!(back, t);
    }
}
