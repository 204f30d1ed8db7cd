use render_jobs::{
    models::job::{JobStatus, JobUpdate, RenderJob},
    services::{
        queue::{RedisTaskQueue, RenderTask, TaskQueue},
        store::{job_key, JobStore, RecordBackend, RedisBackend},
    },
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;
use uuid::Uuid;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn store(backend: Arc<dyn RecordBackend>) -> JobStore {
    JobStore::new(backend, Duration::from_secs(60), Duration::from_millis(100))
}

/// Integration test: job records written by one process are visible to another
///
/// Note: This requires a running Redis instance reachable via REDIS_URL.
#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration_test -- --ignored
async fn test_record_round_trip_between_stores() {
    let backend: Arc<dyn RecordBackend> =
        Arc::new(RedisBackend::new(&redis_url()).expect("Failed to initialize Redis backend"));
    assert_ok!(backend.health_check().await);

    let api = store(Arc::clone(&backend));
    let worker = store(Arc::clone(&backend));

    let job = RenderJob::new("a.mp4", "a.mp4", "tool {input} {output}", None);
    api.put(&job).await;

    // Cache miss in the second store reads the persisted record.
    assert_eq!(worker.get(job.id).await, Some(job.clone()));

    let updated = worker
        .update(job.id, JobUpdate::StartProcessing)
        .await
        .expect("Transition rejected")
        .expect("Record missing");
    assert_eq!(updated.status(), JobStatus::Processing);

    // The API copy goes stale and is re-read.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        api.get(job.id).await.map(|j| j.status()),
        Some(JobStatus::Processing)
    );

    assert!(api.list_all().await.iter().any(|j| j.id == job.id));

    api.delete(job.id).await;
    assert_eq!(assert_ok!(backend.get(&job_key(job.id)).await), None);
    assert!(worker.update(job.id, JobUpdate::Progress(10)).await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn test_records_expire() {
    let backend: Arc<dyn RecordBackend> =
        Arc::new(RedisBackend::new(&redis_url()).expect("Failed to initialize Redis backend"));
    let key = job_key(Uuid::new_v4());

    assert_ok!(backend.put(&key, "{}", Duration::from_secs(1)).await);
    assert!(assert_ok!(backend.get(&key).await).is_some());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(assert_ok!(backend.get(&key).await).is_none());
}

#[tokio::test]
#[ignore]
async fn test_queue_delivery_and_requeue() {
    let worker_a = RedisTaskQueue::new(&redis_url()).expect("Failed to initialize job queue");
    let worker_b = RedisTaskQueue::new(&redis_url()).expect("Failed to initialize job queue");
    // Start from a queue with no tasks left over from other runs.
    assert_ok!(worker_a.requeue_abandoned().await);
    while let Some(task) = assert_ok!(worker_a.dequeue().await) {
        assert_ok!(worker_a.complete(&task).await);
    }

    let task = RenderTask {
        job_id: Uuid::new_v4(),
        input_path: PathBuf::from("/tmp/in.mp4"),
        output_path: PathBuf::from("/tmp/out.mp4"),
        filename: "in.mp4".to_string(),
        command: "true".to_string(),
    };
    assert_ok!(worker_a.enqueue(&task).await);
    assert_eq!(assert_ok!(worker_a.depth().await), 1);

    assert_ok!(worker_a.heartbeat(Duration::from_secs(2)).await);
    let delivered = assert_ok!(worker_a.dequeue().await).expect("Task not delivered");
    assert_eq!(delivered, task);
    assert_eq!(assert_ok!(worker_a.depth().await), 0);

    // A live lease keeps the task with its consumer.
    assert_eq!(assert_ok!(worker_b.requeue_abandoned().await), 0);

    // Once the lease lapses another consumer takes it back.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(assert_ok!(worker_b.requeue_abandoned().await), 1);
    let redelivered = assert_ok!(worker_b.dequeue().await).expect("Task not redelivered");
    assert_eq!(redelivered, task);
    assert_ok!(worker_b.complete(&redelivered).await);
    assert_eq!(assert_ok!(worker_b.requeue_abandoned().await), 0);
}
