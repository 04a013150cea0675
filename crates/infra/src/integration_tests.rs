//! Integration tests for the full staging pipeline.
//!
//! Tests: TaskEnqueuer → MemoryQueue → ConsumerBridge → WorkerPool →
//! JobProcessor → StagingClient → image record + job updates
//!
//! Verifies:
//! - A successful prediction ends `ready` and the delivery is acknowledged
//! - A prediction that never finishes ends `error`, and the retry is a no-op
//! - A delivery timeout with no retries left still ends `error`
//! - Invalid submissions never reach the consumer side

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use roomstage_ai::{
    InMemoryObjectStore, InferenceApi, InferenceError, NewPrediction, Prediction, StagingClient, StagingConfig,
};
use roomstage_core::{ImageId, ImageStatus};
use roomstage_events::{EventBus, InMemoryEventBus, JobUpdateEvent, JobUpdateStatus, Subscription};

use crate::images::{ImageRepository, InMemoryImageRepository};
use crate::jobs::{
    ConsumerBridge, ExecutionOptions, JobProcessor, StagingTask, SubmitError, TaskEnqueuer, WorkerPool,
    WorkerPoolConfig, WorkerPoolHandle,
};
use crate::queue::{MemoryQueue, MemoryQueueConfig, QueueStats};

/// Provider whose predictions settle in the given status on the first poll.
struct FixedProvider {
    status: &'static str,
    created: AtomicU32,
}

impl FixedProvider {
    fn new(status: &'static str) -> Arc<Self> {
        Arc::new(Self {
            status,
            created: AtomicU32::new(0),
        })
    }

    fn prediction(&self, status: &str) -> Prediction {
        serde_json::from_value(json!({
            "id": "pred-1",
            "status": status,
            "output": "https://cdn.provider/out/0.png",
        }))
        .unwrap()
    }
}

#[async_trait]
impl InferenceApi for FixedProvider {
    async fn create_prediction(&self, _request: &NewPrediction) -> Result<Prediction, InferenceError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(self.prediction("starting"))
    }

    async fn get_prediction(&self, _id: &str) -> Result<Prediction, InferenceError> {
        Ok(self.prediction(self.status))
    }

    async fn download(&self, _url: &str) -> Result<Vec<u8>, InferenceError> {
        Ok(b"staged-room".to_vec())
    }
}

struct Pipeline {
    enqueuer: TaskEnqueuer,
    queue: MemoryQueue,
    bridge: Arc<ConsumerBridge>,
    images: Arc<InMemoryImageRepository>,
    store: Arc<InMemoryObjectStore>,
    updates: Subscription<JobUpdateEvent>,
    workers: WorkerPoolHandle,
    shutdown: CancellationToken,
}

fn pipeline(provider: Arc<FixedProvider>) -> Pipeline {
    let shutdown = CancellationToken::new();
    let queue = MemoryQueue::new(MemoryQueueConfig::default().with_concurrency(2));
    let bridge = Arc::new(ConsumerBridge::with_shutdown(2, shutdown.clone()));
    let images = Arc::new(InMemoryImageRepository::new());

    let store = Arc::new(InMemoryObjectStore::new("bucket"));
    let stager = Arc::new(StagingClient::new(
        store.clone(),
        provider,
        StagingConfig::default().with_model_version("model-v1"),
    ));

    let bus = Arc::new(InMemoryEventBus::new());
    let updates = bus.subscribe();
    let publisher = Arc::new(roomstage_events::EventPublisher::new(bus));

    let processor = Arc::new(JobProcessor::new(images.clone(), stager, publisher));
    let workers = WorkerPool::new(bridge.clone(), processor).spawn(
        WorkerPoolConfig::default()
            .with_concurrency(2)
            .with_idle_backoff(Duration::from_millis(5)),
        shutdown.clone(),
    );

    let consumer = queue.clone();
    let handler = bridge.clone();
    let token = shutdown.clone();
    tokio::spawn(async move { consumer.run(handler, token).await });

    Pipeline {
        enqueuer: TaskEnqueuer::new(Arc::new(queue.clone()), "default"),
        queue,
        bridge,
        images,
        store,
        updates,
        workers,
        shutdown,
    }
}

async fn settle(queue: &MemoryQueue, done: impl Fn(&QueueStats) -> bool) {
    for _ in 0..10_000 {
        if done(&queue.stats()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("pipeline did not settle: {:?}", queue.stats());
}

fn drain(updates: &Subscription<JobUpdateEvent>) -> Vec<JobUpdateEvent> {
    std::iter::from_fn(|| updates.try_recv().ok()).collect()
}

#[tokio::test(start_paused = true)]
async fn successful_prediction_ends_ready() {
    let p = pipeline(FixedProvider::new("succeeded"));
    let id = ImageId::new("img-1").unwrap();
    p.store.insert("uploads/img-1.jpg", b"room-photo".to_vec());
    p.images.create_queued(&id).await.unwrap();

    let task = StagingTask::new("img-1", "s3://bucket/uploads/img-1.jpg").with_room_type("living room");
    p.enqueuer.submit(&task, &ExecutionOptions::default()).await.unwrap();

    settle(&p.queue, |s| s.succeeded == 1).await;

    let record = p.images.get(&id).await.unwrap();
    assert_eq!(record.status, ImageStatus::Ready);
    assert_eq!(record.staged_url.as_deref(), Some("s3://bucket/staged/img-1.png"));
    assert!(p.store.object("staged/img-1.png").is_some());

    let statuses: Vec<_> = drain(&p.updates).into_iter().map(|e| e.status).collect();
    assert_eq!(statuses, vec![JobUpdateStatus::Processing, JobUpdateStatus::Ready]);
    assert_eq!(p.bridge.pending_count(), 0);

    p.shutdown.cancel();
    p.workers.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stuck_prediction_times_out_and_retry_is_a_no_op() {
    let provider = FixedProvider::new("processing");
    let p = pipeline(provider.clone());
    let id = ImageId::new("img-2").unwrap();
    p.store.insert("uploads/img-2.jpg", b"room-photo".to_vec());
    p.images.create_queued(&id).await.unwrap();

    let task = StagingTask::new("img-2", "s3://bucket/uploads/img-2.jpg");
    p.enqueuer.submit(&task, &ExecutionOptions::default()).await.unwrap();

    // First attempt fails after the five minute budget; the retry sees a
    // terminal image and acknowledges without calling the provider again.
    settle(&p.queue, |s| s.retried == 1 && s.succeeded == 1).await;

    let record = p.images.get(&id).await.unwrap();
    assert_eq!(record.status, ImageStatus::Error);
    assert!(record.error.unwrap().contains("did not finish"));
    assert_eq!(provider.created.load(Ordering::SeqCst), 1);
    assert!(p.queue.dead_letters().is_empty());

    let events = drain(&p.updates);
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].status, JobUpdateStatus::Error);
    assert!(events[1].error.is_some());

    p.shutdown.cancel();
    p.workers.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_dead_letters_after_error() {
    let p = pipeline(FixedProvider::new("failed"));
    let id = ImageId::new("img-3").unwrap();
    p.store.insert("uploads/img-3.jpg", b"room-photo".to_vec());
    p.images.create_queued(&id).await.unwrap();

    let task = StagingTask::new("img-3", "s3://bucket/uploads/img-3.jpg");
    p.enqueuer
        .submit(&task, &ExecutionOptions::default().with_retry_budget(0))
        .await
        .unwrap();

    settle(&p.queue, |s| s.dead_lettered == 1).await;

    assert_eq!(p.images.get(&id).await.unwrap().status, ImageStatus::Error);
    let dead = p.queue.dead_letters();
    assert_eq!(dead[0].attempts, 1);
    assert!(dead[0].reason.contains("as failed"));

    p.shutdown.cancel();
    p.workers.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn delivery_timeout_without_retries_ends_error() {
    let p = pipeline(FixedProvider::new("processing"));
    let id = ImageId::new("img-5").unwrap();
    p.store.insert("uploads/img-5.jpg", b"room-photo".to_vec());
    p.images.create_queued(&id).await.unwrap();

    let task = StagingTask::new("img-5", "s3://bucket/uploads/img-5.jpg");
    let options = ExecutionOptions::default()
        .with_retry_budget(0)
        .with_timeout(Duration::from_secs(30));
    p.enqueuer.submit(&task, &options).await.unwrap();

    settle(&p.queue, |s| s.dead_lettered == 1).await;

    // The processor records the failure after the queue has given up.
    let mut statuses = Vec::new();
    for _ in 0..100 {
        statuses.extend(drain(&p.updates).into_iter().map(|e| e.status));
        if statuses.contains(&JobUpdateStatus::Error) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(statuses, vec![JobUpdateStatus::Processing, JobUpdateStatus::Error]);

    let record = p.images.get(&id).await.unwrap();
    assert_eq!(record.status, ImageStatus::Error);
    assert!(record.error.unwrap().contains("delivery timed out"));

    p.shutdown.cancel();
    p.workers.shutdown().await;
}

#[tokio::test]
async fn invalid_submission_never_reaches_the_bridge() {
    let p = pipeline(FixedProvider::new("succeeded"));

    let err = p
        .enqueuer
        .submit(&StagingTask::new("img-4", ""), &ExecutionOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, SubmitError::Validation(_)));
    assert_eq!(p.queue.stats().enqueued, 0);
    assert!(p.bridge.get_next_job().is_none());

    p.shutdown.cancel();
    p.workers.shutdown().await;
}
