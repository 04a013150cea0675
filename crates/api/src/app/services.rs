use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use roomstage_ai::{
    HttpObjectStore, InMemoryObjectStore, InferenceApi, ObjectStore, ReplicateApi, StagingClient, StagingConfig,
};
use roomstage_core::ImageId;
use roomstage_events::{EventPublisher, InMemoryEventBus, JobUpdateEvent, StatusPublisher, Subscription};
use roomstage_infra::images::{ImageRepository, InMemoryImageRepository};
use roomstage_infra::jobs::{ConsumerBridge, JobProcessor, TaskEnqueuer, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
use roomstage_infra::queue::{MemoryQueue, MemoryQueueConfig, QueueError};

#[cfg(feature = "redis")]
use roomstage_infra::event_bus::RedisPubSubEventBus;
#[cfg(feature = "redis")]
use roomstage_infra::images::PostgresImageRepository;
#[cfg(feature = "redis")]
use roomstage_infra::queue::{RedisStreamsConfig, RedisStreamsQueue};

use crate::config::AppConfig;

/// Per-request HTTP timeout for provider and storage calls.
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Where SSE handlers read job updates from.
#[derive(Clone)]
pub enum UpdateFeed {
    InMemory(Arc<InMemoryEventBus<JobUpdateEvent>>),
    #[cfg(feature = "redis")]
    Redis(Arc<RedisPubSubEventBus>),
}

impl UpdateFeed {
    /// Subscription that yields updates for `image_id` only.
    pub fn subscribe(&self, image_id: &ImageId) -> Subscription<JobUpdateEvent> {
        match self {
            UpdateFeed::InMemory(bus) => bus.subscribe_key(image_id.as_str()),
            #[cfg(feature = "redis")]
            UpdateFeed::Redis(bus) => bus.subscribe_image(image_id),
        }
    }
}

/// Shared state behind the HTTP handlers.
#[derive(Clone)]
pub struct AppServices {
    pub enqueuer: TaskEnqueuer,
    pub images: Arc<dyn ImageRepository>,
    pub updates: UpdateFeed,
}

enum Consumer {
    Memory(MemoryQueue),
    #[cfg(feature = "redis")]
    Redis { queue: RedisStreamsQueue, queues: Vec<String> },
}

/// Consumer side of the pipeline, built but not yet running.
pub struct Pipeline {
    consumer: Consumer,
    bridge: Arc<ConsumerBridge>,
    workers: WorkerPool,
    worker_config: WorkerPoolConfig,
}

/// Running consumer + worker pool.
pub struct PipelineHandle {
    bridge: Arc<ConsumerBridge>,
    consumer: JoinHandle<Result<(), QueueError>>,
    workers: WorkerPoolHandle,
    shutdown: CancellationToken,
}

impl Pipeline {
    /// Start the queue consumer and the worker pool under `shutdown`.
    pub fn start(self, shutdown: CancellationToken) -> PipelineHandle {
        let handler = self.bridge.clone();
        let token = shutdown.clone();
        let consumer = match self.consumer {
            Consumer::Memory(queue) => tokio::spawn(async move { queue.run(handler, token).await }),
            #[cfg(feature = "redis")]
            Consumer::Redis { queue, queues } => tokio::spawn(async move { queue.run(&queues, handler, token).await }),
        };

        let workers = self.workers.spawn(self.worker_config, shutdown.clone());
        PipelineHandle {
            bridge: self.bridge,
            consumer,
            workers,
            shutdown,
        }
    }
}

impl PipelineHandle {
    /// Cancel in-flight deliveries, then wait for the consumer and workers.
    ///
    /// The bridge goes first so processors see the shutdown before their
    /// delivery contexts are cancelled.
    pub async fn shutdown(self) {
        self.bridge.shutdown();
        self.shutdown.cancel();
        match self.consumer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "queue consumer exited with error"),
            Err(e) => warn!(error = %e, "queue consumer task panicked"),
        }
        self.workers.shutdown().await;
    }
}

/// Wire the stores, queue, staging client and worker pool from `config`.
pub async fn build_services(config: &AppConfig) -> anyhow::Result<(AppServices, Pipeline)> {
    if config.use_persistent_stores {
        #[cfg(feature = "redis")]
        {
            return build_persistent_services(config).await;
        }
        #[cfg(not(feature = "redis"))]
        {
            warn!("USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory");
        }
    }

    build_in_memory_services(config)
}

/// In-memory wiring (dev/test): memory queue, image map, process-local bus.
pub fn build_in_memory_services(config: &AppConfig) -> anyhow::Result<(AppServices, Pipeline)> {
    let queue = MemoryQueue::new(
        MemoryQueueConfig::default()
            .with_concurrency(config.concurrency)
            .with_name(config.default_queue.clone()),
    );
    let images: Arc<dyn ImageRepository> = Arc::new(InMemoryImageRepository::new());
    let bus = Arc::new(InMemoryEventBus::new());
    let publisher = Arc::new(EventPublisher::new(bus.clone()));

    let services = AppServices {
        enqueuer: TaskEnqueuer::new(Arc::new(queue.clone()), config.default_queue.clone())
            .with_queues(config.queues.iter().cloned()),
        images: images.clone(),
        updates: UpdateFeed::InMemory(bus),
    };
    let pipeline = pipeline(config, Consumer::Memory(queue), images, publisher)?;

    info!(concurrency = config.concurrency, "in-memory services ready");
    Ok((services, pipeline))
}

#[cfg(feature = "redis")]
async fn build_persistent_services(config: &AppConfig) -> anyhow::Result<(AppServices, Pipeline)> {
    let database_url = config.database_url.as_deref().context("DATABASE_URL is required")?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("failed to connect to postgres")?;
    let repo = PostgresImageRepository::new(pool);
    repo.ensure_schema().await.context("failed to prepare images table")?;
    let images: Arc<dyn ImageRepository> = Arc::new(repo);

    let queue = RedisStreamsQueue::new(
        &config.redis_url,
        RedisStreamsConfig::default().with_concurrency(config.concurrency),
    )
    .context("invalid REDIS_URL")?;
    let bus = Arc::new(RedisPubSubEventBus::new(&config.redis_url, None).context("invalid REDIS_URL")?);
    let publisher = Arc::new(EventPublisher::new(bus.clone()));

    let services = AppServices {
        enqueuer: TaskEnqueuer::new(Arc::new(queue.clone()), config.default_queue.clone())
            .with_queues(config.queues.iter().cloned()),
        images: images.clone(),
        updates: UpdateFeed::Redis(bus),
    };
    let consumer = Consumer::Redis {
        queue,
        queues: config.queues.clone(),
    };
    let pipeline = pipeline(config, consumer, images, publisher)?;

    info!(concurrency = config.concurrency, "persistent services ready");
    Ok((services, pipeline))
}

fn pipeline(
    config: &AppConfig,
    consumer: Consumer,
    images: Arc<dyn ImageRepository>,
    publisher: Arc<dyn StatusPublisher>,
) -> anyhow::Result<Pipeline> {
    let staging = &config.staging;

    let store: Arc<dyn ObjectStore> = match &staging.storage_endpoint {
        Some(endpoint) => Arc::new(
            HttpObjectStore::new(endpoint.clone(), staging.bucket.clone(), HTTP_REQUEST_TIMEOUT)
                .context("failed to build object store client")?,
        ),
        None => {
            warn!("STORAGE_ENDPOINT not set; staged images are kept in memory");
            Arc::new(InMemoryObjectStore::new(staging.bucket.clone()))
        }
    };

    if staging.api_token.is_none() {
        warn!("REPLICATE_API_TOKEN not set; provider calls will be rejected");
    }
    let api: Arc<dyn InferenceApi> = Arc::new(
        ReplicateApi::new(
            staging.api_base_url.clone(),
            staging.api_token.clone().unwrap_or_default(),
            HTTP_REQUEST_TIMEOUT,
        )
        .context("failed to build inference client")?,
    );

    let stager = Arc::new(StagingClient::new(
        store,
        api,
        StagingConfig::default()
            .with_model_version(staging.model_version.clone())
            .with_poll_interval(staging.poll_interval)
            .with_timeout(staging.timeout),
    ));

    let bridge = Arc::new(ConsumerBridge::new(config.concurrency));
    let processor = Arc::new(JobProcessor::new(images, stager, publisher));

    Ok(Pipeline {
        consumer,
        workers: WorkerPool::new(bridge.clone(), processor),
        bridge,
        worker_config: WorkerPoolConfig::default()
            .with_concurrency(config.concurrency)
            .with_idle_backoff(config.idle_backoff),
    })
}
