//! Worker pool pulling jobs from the consumer bridge.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::bridge::ConsumerBridge;
use super::processor::{JobProcessor, ProcessError};
use super::types::BridgeJob;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks.
    pub concurrency: usize,
    /// Sleep between polls while the bridge is empty.
    pub idle_backoff: Duration,
    /// Name for logging.
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            idle_backoff: Duration::from_millis(50),
            name: "staging-workers".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }
}

/// Worker pool runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

fn lock(stats: &Mutex<WorkerStats>) -> MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: CancellationToken,
    tracker: TaskTracker,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Stop pulling new jobs and wait for the running ones to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> WorkerStats {
        let mut stats = lock(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Pulls jobs from a [`ConsumerBridge`], runs them through a [`JobProcessor`]
/// and reports each outcome back to the bridge.
#[derive(Clone)]
pub struct WorkerPool {
    bridge: Arc<ConsumerBridge>,
    processor: Arc<JobProcessor>,
}

impl WorkerPool {
    pub fn new(bridge: Arc<ConsumerBridge>, processor: Arc<JobProcessor>) -> Self {
        Self { bridge, processor }
    }

    /// Spawn `config.concurrency` workers that run until `shutdown` fires.
    pub fn spawn(self, config: WorkerPoolConfig, shutdown: CancellationToken) -> WorkerPoolHandle {
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let tracker = TaskTracker::new();

        for worker in 0..config.concurrency.max(1) {
            let pool = self.clone();
            let config = config.clone();
            let shutdown = shutdown.clone();
            let stats = stats.clone();
            tracker.spawn(async move { pool.worker_loop(worker, config, shutdown, stats).await });
        }
        info!(pool = %config.name, concurrency = config.concurrency, "worker pool started");

        WorkerPoolHandle {
            shutdown,
            tracker,
            stats,
            started: Instant::now(),
        }
    }

    /// Process at most one job. Returns `None` when the bridge is empty.
    pub async fn run_once(&self) -> Option<Result<(), ProcessError>> {
        let job = self.bridge.get_next_job()?;
        Some(self.handle(job).await)
    }

    async fn handle(&self, job: BridgeJob) -> Result<(), ProcessError> {
        let result = self.processor.process_job(&job).await;
        match &result {
            Ok(()) => self.bridge.mark_job_completed(job.id),
            Err(e) => self.bridge.mark_job_failed(job.id, e.to_string()),
        }
        result
    }

    async fn worker_loop(
        self,
        worker: usize,
        config: WorkerPoolConfig,
        shutdown: CancellationToken,
        stats: Arc<Mutex<WorkerStats>>,
    ) {
        debug!(pool = %config.name, worker, "worker started");

        while !shutdown.is_cancelled() {
            let job = match self.bridge.get_next_job() {
                Some(job) => job,
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(config.idle_backoff) => {}
                    }
                    continue;
                }
            };

            let job_id = job.id;
            lock(&stats).current_running += 1;
            let result = self.handle(job).await;

            let mut s = lock(&stats);
            s.current_running = s.current_running.saturating_sub(1);
            s.jobs_processed += 1;
            match result {
                Ok(()) => s.jobs_succeeded += 1,
                Err(e) => {
                    s.jobs_failed += 1;
                    drop(s);
                    warn!(pool = %config.name, worker, %job_id, error = %e, "job failed");
                }
            }
        }

        debug!(pool = %config.name, worker, "worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use roomstage_ai::{Stager, StagingError, StagingRequest};
    use roomstage_core::{ImageId, ImageStatus};
    use roomstage_events::{EventPublisher, InMemoryEventBus};

    use crate::images::{ImageRepository, InMemoryImageRepository};
    use crate::jobs::task::{StagingTask, TASK_TYPE_STAGE};
    use crate::queue::{DeliveryHandler, TaskMessage};

    struct InstantStager;

    #[async_trait]
    impl Stager for InstantStager {
        async fn stage(&self, request: &StagingRequest, _cancel: &CancellationToken) -> Result<String, StagingError> {
            Ok(format!("s3://bucket/staged/{}.png", request.image_id))
        }
    }

    fn pool() -> (WorkerPool, Arc<ConsumerBridge>, Arc<InMemoryImageRepository>) {
        let bridge = Arc::new(ConsumerBridge::new(2));
        let images = Arc::new(InMemoryImageRepository::new());
        let publisher = Arc::new(EventPublisher::new(Arc::new(InMemoryEventBus::new())));
        let processor = Arc::new(JobProcessor::new(images.clone(), Arc::new(InstantStager), publisher));
        (WorkerPool::new(bridge.clone(), processor), bridge, images)
    }

    #[tokio::test]
    async fn run_once_on_empty_bridge_returns_none() {
        let (pool, _bridge, _images) = pool();
        assert!(pool.run_once().await.is_none());
    }

    #[tokio::test]
    async fn workers_drain_bridge_and_acknowledge() {
        let (pool, bridge, images) = pool();
        let id = ImageId::new("img-7").unwrap();
        images.create_queued(&id).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = pool.spawn(
            WorkerPoolConfig::default().with_concurrency(2).with_idle_backoff(Duration::from_millis(1)),
            shutdown.clone(),
        );

        let payload = StagingTask::new("img-7", "s3://bucket/uploads/img-7.png").encode().unwrap();
        let outcome = bridge
            .deliver(CancellationToken::new(), TaskMessage::new(TASK_TYPE_STAGE, payload))
            .await;

        assert_eq!(outcome, Ok(()));
        assert_eq!(images.get(&id).await.unwrap().status, ImageStatus::Ready);
        assert_eq!(handle.stats().jobs_succeeded, 1);

        handle.shutdown().await;
        assert!(shutdown.is_cancelled());
    }
}
