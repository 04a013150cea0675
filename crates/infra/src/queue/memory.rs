//! In-process queue substrate for tests and single-node development.
//!
//! Honours the full [`DeliveryParams`] contract (retry budget, per-attempt
//! timeout, scheduled dispatch, deadline) and keeps a dead-letter list, but
//! nothing survives the process.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::transport::{DeliveryHandler, DeliveryParams, QueueError, TaskInfo, TaskMessage, TaskQueue};

/// Memory queue configuration.
#[derive(Debug, Clone)]
pub struct MemoryQueueConfig {
    /// Maximum deliveries in flight at once.
    pub concurrency: usize,
    /// Retry budget applied when a task does not set one.
    pub default_max_retry: u32,
    /// Delay before a failed task is redelivered.
    pub retry_delay: Duration,
    /// Name for logging.
    pub name: String,
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            default_max_retry: 3,
            retry_delay: Duration::from_secs(1),
            name: "memory-queue".to_string(),
        }
    }
}

impl MemoryQueueConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_default_max_retry(mut self, max_retry: u32) -> Self {
        self.default_max_retry = max_retry;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Queue runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    /// Delivery attempts, including redeliveries.
    pub delivered: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

/// A task that exhausted its retry budget or missed its deadline.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub info: TaskInfo,
    pub message: TaskMessage,
    pub attempts: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug)]
struct QueuedTask {
    info: TaskInfo,
    message: TaskMessage,
    params: DeliveryParams,
    attempts: u32,
}

#[derive(Debug)]
struct Inner {
    config: MemoryQueueConfig,
    tx: mpsc::UnboundedSender<QueuedTask>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<QueuedTask>>>,
    closed: CancellationToken,
    dead_letters: Mutex<Vec<DeadLetter>>,
    stats: Mutex<QueueStats>,
}

/// In-memory [`TaskQueue`] plus a consumer loop that pushes into a
/// [`DeliveryHandler`].
///
/// Queue names are labels only: every queue shares one channel and the
/// single consumer serves them all in arrival order. Which names are
/// accepted is up to the producer (see `TaskEnqueuer::with_queues`).
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryQueue {
    pub fn new(config: MemoryQueueConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                tx,
                rx: Mutex::new(Some(rx)),
                closed: CancellationToken::new(),
                dead_letters: Mutex::new(Vec::new()),
                stats: Mutex::new(QueueStats::default()),
            }),
        }
    }

    pub fn stats(&self) -> QueueStats {
        lock(&self.inner.stats).clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock(&self.inner.dead_letters).clone()
    }

    /// Consume tasks and push them into `handler` until `shutdown` fires.
    ///
    /// In-flight deliveries see their context cancelled on shutdown; the call
    /// returns once they have all finished. Only one consumer may run per queue.
    pub async fn run(&self, handler: Arc<dyn DeliveryHandler>, shutdown: CancellationToken) -> Result<(), QueueError> {
        let mut rx = lock(&self.inner.rx)
            .take()
            .ok_or_else(|| QueueError::Backend("consumer already running".to_string()))?;

        let name = self.inner.config.name.clone();
        let permits = Arc::new(Semaphore::new(self.inner.config.concurrency.max(1)));
        let tracker = TaskTracker::new();
        info!(queue = %name, concurrency = self.inner.config.concurrency, "memory queue consumer started");

        loop {
            let task = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(task) => task,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = shutdown.cancelled() => {
                    warn!(queue = %name, task_id = %task.info.id, "consumer stopping; undelivered task dropped");
                    break;
                }
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let inner = self.inner.clone();
            let handler = handler.clone();
            let shutdown = shutdown.clone();
            tracker.spawn(async move {
                let _permit = permit;
                inner.dispatch(handler.as_ref(), task, &shutdown).await;
            });
        }

        self.inner.closed.cancel();
        tracker.close();
        tracker.wait().await;
        info!(queue = %name, "memory queue consumer stopped");
        Ok(())
    }
}

/// Time an attempt may run: the tighter of the task timeout and its deadline.
fn attempt_limit(params: &DeliveryParams, now: DateTime<Utc>) -> Option<Duration> {
    let until_deadline = params.deadline.and_then(|d| (d - now).to_std().ok());
    match (params.timeout, until_deadline) {
        (Some(t), Some(d)) => Some(t.min(d)),
        (t, d) => t.or(d),
    }
}

impl Inner {
    fn schedule(&self, task: QueuedTask, delay: Option<Duration>) {
        match delay {
            Some(delay) if !delay.is_zero() => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = tx.send(task) {
                        warn!(task_id = %e.0.info.id, "queue closed before scheduled task became due");
                    }
                });
            }
            _ => {
                if let Err(e) = self.tx.send(task) {
                    warn!(task_id = %e.0.info.id, "queue closed; task dropped");
                }
            }
        }
    }

    fn dead_letter(&self, task: QueuedTask, reason: String) {
        warn!(
            queue = %self.config.name,
            task_id = %task.info.id,
            attempts = task.attempts,
            reason = %reason,
            "task dead-lettered"
        );
        lock(&self.stats).dead_lettered += 1;
        lock(&self.dead_letters).push(DeadLetter {
            info: task.info,
            message: task.message,
            attempts: task.attempts,
            reason,
            dead_lettered_at: Utc::now(),
        });
    }

    async fn dispatch(&self, handler: &dyn DeliveryHandler, mut task: QueuedTask, shutdown: &CancellationToken) {
        let now = Utc::now();
        if task.params.deadline.is_some_and(|deadline| now >= deadline) {
            self.dead_letter(task, "deadline exceeded".to_string());
            return;
        }

        task.attempts += 1;
        lock(&self.stats).delivered += 1;
        debug!(task_id = %task.info.id, queue = %task.info.queue, attempt = task.attempts, "delivering task");

        let ctx = shutdown.child_token();
        let deliver = handler.deliver(ctx.clone(), task.message.clone());
        tokio::pin!(deliver);

        let outcome = match attempt_limit(&task.params, now) {
            None => deliver.await,
            Some(limit) => {
                tokio::select! {
                    outcome = &mut deliver => outcome,
                    _ = tokio::time::sleep(limit) => {
                        debug!(task_id = %task.info.id, limit_ms = limit.as_millis() as u64, "attempt timed out");
                        ctx.cancel();
                        deliver.await
                    }
                }
            }
        };

        match outcome {
            Ok(()) => {
                lock(&self.stats).succeeded += 1;
                debug!(task_id = %task.info.id, attempt = task.attempts, "task acknowledged");
            }
            Err(error) if shutdown.is_cancelled() => {
                warn!(task_id = %task.info.id, error = %error, "consumer shutting down; task not redelivered");
            }
            Err(error) => {
                let budget = task.params.max_retry.unwrap_or(self.config.default_max_retry);
                if task.attempts <= budget {
                    lock(&self.stats).retried += 1;
                    warn!(
                        task_id = %task.info.id,
                        attempt = task.attempts,
                        max_retry = budget,
                        error = %error,
                        "delivery failed; scheduling retry"
                    );
                    self.schedule(task, Some(self.config.retry_delay));
                } else {
                    self.dead_letter(task, error.to_string());
                }
            }
        }
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, message: TaskMessage, params: DeliveryParams) -> Result<TaskInfo, QueueError> {
        if self.inner.closed.is_cancelled() {
            return Err(QueueError::Closed);
        }

        let info = TaskInfo {
            id: Uuid::now_v7().to_string(),
            queue: params.queue.clone(),
        };
        let delay = params.process_at.and_then(|at| (at - Utc::now()).to_std().ok());

        lock(&self.inner.stats).enqueued += 1;
        self.inner.schedule(
            QueuedTask {
                info: info.clone(),
                message,
                params,
                attempts: 0,
            },
            delay,
        );
        Ok(info)
    }
}
