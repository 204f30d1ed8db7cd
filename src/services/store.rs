use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::models::job::{JobUpdate, RenderJob, TransitionError};

pub const KEY_PREFIX: &str = "render:job:";

/// Bound on establishing a Redis connection before the store degrades to its cache.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Redis key of a job record.
pub fn job_key(id: Uuid) -> String {
    format!("{KEY_PREFIX}{id}")
}

/// Durable key-value store with per-key expiry holding serialized job records.
#[async_trait]
pub trait RecordBackend: Send + Sync {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Every live value whose key starts with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Redis-backed record store using `SETEX` per job.
pub struct RedisBackend {
    client: redis::Client,
}

impl RedisBackend {
    pub fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url).map_err(StoreError::Redis)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        match tokio::time::timeout(CONNECT_TIMEOUT, self.client.get_multiplexed_async_connection())
            .await
        {
            Ok(conn) => conn.map_err(StoreError::Redis),
            Err(_) => Err(StoreError::Unavailable(format!(
                "no connection within {}ms",
                CONNECT_TIMEOUT.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl RecordBackend for RedisBackend {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .map_err(StoreError::Redis)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(key).await.map_err(StoreError::Redis)?;
        Ok(value)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        let keys: Vec<String> = conn
            .keys(format!("{prefix}*"))
            .await
            .map_err(StoreError::Redis)?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.get(key);
        }
        // Keys may expire between KEYS and GET.
        let values: Vec<Option<String>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(StoreError::Redis)?;
        Ok(values.into_iter().flatten().collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key).await.map_err(StoreError::Redis)?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(StoreError::Redis)?;
        Ok(())
    }
}

/// In-process backend with the same expiry semantics, for single-process runs and tests.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a raw value without going through the job store.
    pub fn insert_raw(&self, key: &str, value: &str, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.values().filter(|(_, expiry)| *expiry > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordBackend for MemoryBackend {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.insert_raw(key, value, ttl);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some((value, expiry)) if *expiry > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, (_, expiry)| *expiry > now);
        Ok(entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(_, (value, _))| value.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

struct CachedJob {
    job: RenderJob,
    cached_at: Instant,
}

/// Two-tier job store: a process-local cache in front of the persistent backend.
///
/// Persistent failures are logged and absorbed; the cache then stays
/// authoritative for this process. Cache entries older than `max_cache_age`
/// are re-read from the backend, which may have been updated by another
/// process.
pub struct JobStore {
    backend: Arc<dyn RecordBackend>,
    cache: RwLock<HashMap<Uuid, CachedJob>>,
    ttl: Duration,
    max_cache_age: Duration,
}

impl JobStore {
    pub fn new(
        backend: Arc<dyn RecordBackend>,
        ttl: Duration,
        max_cache_age: Duration,
    ) -> Self {
        Self {
            backend,
            cache: RwLock::new(HashMap::new()),
            ttl,
            max_cache_age,
        }
    }

    pub fn backend(&self) -> &dyn RecordBackend {
        self.backend.as_ref()
    }

    /// Cache the record and write it through with a refreshed expiry.
    pub async fn put(&self, job: &RenderJob) {
        self.cache_insert(job.clone());

        let payload = match serde_json::to_string(job) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to serialize job record");
                return;
            }
        };

        if let Err(e) = self.backend.put(&job_key(job.id), &payload, self.ttl).await {
            tracing::warn!(
                job_id = %job.id,
                error = %e,
                "Failed to persist job record, continuing with cached copy"
            );
        }
    }

    /// Look a job up, preferring a fresh cache entry over a backend read.
    pub async fn get(&self, id: Uuid) -> Option<RenderJob> {
        let cached = self.cache_lookup(id);
        if let Some((job, fresh)) = &cached {
            if *fresh {
                return Some(job.clone());
            }
        }

        match self.read_persisted(id).await {
            Ok(Some(job)) => {
                self.cache_insert(job.clone());
                Some(job)
            }
            Ok(None) => {
                if cached.is_some() {
                    self.evict(id);
                }
                None
            }
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Job store unreachable, serving cached copy");
                cached.map(|(job, _)| job)
            }
        }
    }

    /// All persisted jobs, newest first. Falls back to the cache when the backend is down.
    pub async fn list_all(&self) -> Vec<RenderJob> {
        let mut jobs: Vec<RenderJob> = match self.backend.scan_prefix(KEY_PREFIX).await {
            Ok(values) => {
                let jobs: Vec<RenderJob> = values
                    .iter()
                    .filter_map(|raw| match serde_json::from_str::<RenderJob>(raw) {
                        Ok(job) => Some(job),
                        Err(e) => {
                            tracing::warn!(error = %e, "Skipping unreadable job record");
                            None
                        }
                    })
                    .collect();
                self.retain_cached(&jobs);
                jobs
            }
            Err(e) => {
                tracing::warn!(error = %e, "Job store unreachable, listing cached jobs");
                self.cached_jobs()
            }
        };

        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Remove the record from the backend and the cache.
    pub async fn delete(&self, id: Uuid) {
        self.evict(id);
        if let Err(e) = self.backend.delete(&job_key(id)).await {
            tracing::warn!(job_id = %id, error = %e, "Failed to delete persisted job record");
        }
    }

    /// Apply a transition to the current record and persist it.
    ///
    /// The record is read from the backend, not the cache, so a job deleted
    /// by another process is seen as gone. Returns `Ok(None)` when the job no
    /// longer exists; a deleted job is never recreated.
    pub async fn update(
        &self,
        id: Uuid,
        update: JobUpdate,
    ) -> Result<Option<RenderJob>, TransitionError> {
        let Some(mut job) = self.current(id).await else {
            return Ok(None);
        };

        if job.apply(update, Utc::now())? {
            self.put(&job).await;
        }
        Ok(Some(job))
    }

    /// Replace cached entries with the given records.
    pub fn refresh_cache(&self, jobs: &[RenderJob]) {
        for job in jobs {
            self.cache_insert(job.clone());
        }
    }

    pub fn evict(&self, id: Uuid) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.remove(&id);
    }

    /// Backend copy of a record. The cache answers only when the backend cannot.
    async fn current(&self, id: Uuid) -> Option<RenderJob> {
        match self.read_persisted(id).await {
            Ok(Some(job)) => Some(job),
            Ok(None) => {
                self.evict(id);
                None
            }
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Job store unreachable, updating cached copy");
                self.cache_lookup(id).map(|(job, _)| job)
            }
        }
    }

    async fn read_persisted(&self, id: Uuid) -> Result<Option<RenderJob>, StoreError> {
        let Some(raw) = self.backend.get(&job_key(id)).await? else {
            return Ok(None);
        };
        let job = serde_json::from_str(&raw).map_err(StoreError::Serialize)?;
        Ok(Some(job))
    }

    /// Cached copy and whether it is still fresh. Entries older than the
    /// record TTL have expired from the backend too and are dropped.
    fn cache_lookup(&self, id: Uuid) -> Option<(RenderJob, bool)> {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let age = cache.get(&id)?.cached_at.elapsed();
        if age >= self.ttl {
            cache.remove(&id);
            return None;
        }
        cache
            .get(&id)
            .map(|entry| (entry.job.clone(), age < self.max_cache_age))
    }

    /// Drop cached entries the backend no longer holds, and any past the TTL.
    fn retain_cached(&self, persisted: &[RenderJob]) {
        let live: HashSet<Uuid> = persisted.iter().map(|job| job.id).collect();
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.retain(|id, entry| live.contains(id) && entry.cached_at.elapsed() < self.ttl);
    }

    fn cache_insert(&self, job: RenderJob) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.insert(
            job.id,
            CachedJob {
                job,
                cached_at: Instant::now(),
            },
        );
    }

    fn cached_jobs(&self) -> Vec<RenderJob> {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.retain(|_, entry| entry.cached_at.elapsed() < self.ttl);
        cache.values().map(|entry| entry.job.clone()).collect()
    }

    /// Number of records held in the local cache.
    pub fn cached_len(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Record backend unavailable: {0}")]
    Unavailable(String),
}
