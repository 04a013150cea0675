//! Consumer bridge: adapts the queue's push deliveries to a pull-based job
//! source and correlates each delivery with the result the processor reports.
//!
//! ## Lifecycle of a delivery
//!
//! 1. `deliver` mints a [`JobId`], registers a oneshot sender for it and puts
//!    a [`BridgeJob`] on a bounded channel (capacity `2 × concurrency`).
//! 2. A worker pulls it with [`ConsumerBridge::get_next_job`], processes it
//!    and reports through `mark_job_completed` / `mark_job_failed`.
//! 3. `deliver` returns that result to the transport, which acknowledges or
//!    redelivers.
//!
//! If the delivery context (or the bridge) is cancelled first, the entry is
//! evicted and any later report for that id is a silent no-op.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::types::{BridgeJob, JobId};
use crate::queue::{DeliveryError, DeliveryHandler, TaskMessage};

type Completion = Result<(), String>;
type PendingTable = Mutex<HashMap<JobId, oneshot::Sender<Completion>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a correlation entry when the delivery ends, however it ends.
struct Eviction<'a> {
    pending: &'a PendingTable,
    id: JobId,
}

impl Drop for Eviction<'_> {
    fn drop(&mut self) {
        if lock(self.pending).remove(&self.id).is_some() {
            debug!(job_id = %self.id, "correlation entry evicted");
        }
    }
}

/// Push→pull adapter between a queue substrate and the worker pool.
#[derive(Debug)]
pub struct ConsumerBridge {
    tx: mpsc::Sender<BridgeJob>,
    rx: Mutex<mpsc::Receiver<BridgeJob>>,
    pending: PendingTable,
    shutdown: CancellationToken,
    capacity: usize,
}

impl ConsumerBridge {
    pub fn new(concurrency: usize) -> Self {
        Self::with_shutdown(concurrency, CancellationToken::new())
    }

    /// Bridge whose in-flight deliveries are all cancelled when `shutdown` fires.
    pub fn with_shutdown(concurrency: usize, shutdown: CancellationToken) -> Self {
        let capacity = concurrency.max(1) * 2;
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            pending: Mutex::new(HashMap::new()),
            shutdown,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Deliveries still waiting for a result.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Cancel every in-flight delivery.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Next delivered job, or `None` right away if nothing is ready.
    ///
    /// Jobs whose delivery was cancelled while they sat in the channel are
    /// skipped: nobody is waiting for their result any more.
    pub fn get_next_job(&self) -> Option<BridgeJob> {
        let mut rx = lock(&self.rx);
        loop {
            match rx.try_recv() {
                Ok(job) if job.ctx.is_cancelled() => {
                    debug!(job_id = %job.id, "skipping job whose delivery was cancelled");
                }
                Ok(job) => return Some(job),
                Err(_) => return None,
            }
        }
    }

    pub fn mark_job_completed(&self, id: JobId) {
        self.resolve(id, Ok(()));
    }

    pub fn mark_job_failed(&self, id: JobId, message: impl Into<String>) {
        self.resolve(id, Err(message.into()));
    }

    fn resolve(&self, id: JobId, result: Completion) {
        let sender = lock(&self.pending).remove(&id);
        match sender {
            Some(sender) => {
                if sender.send(result).is_err() {
                    debug!(job_id = %id, "delivery ended before its result arrived");
                }
            }
            None => debug!(job_id = %id, "no pending delivery for job; report ignored"),
        }
    }
}

#[async_trait]
impl DeliveryHandler for ConsumerBridge {
    async fn deliver(&self, ctx: CancellationToken, message: TaskMessage) -> Result<(), DeliveryError> {
        let id = JobId::new();
        let job_ctx = ctx.child_token();
        let (result_tx, result_rx) = oneshot::channel();

        lock(&self.pending).insert(id, result_tx);
        let _eviction = Eviction {
            pending: &self.pending,
            id,
        };

        let job = BridgeJob {
            id,
            task_type: message.task_type,
            payload: message.payload,
            ctx: job_ctx.clone(),
            shutdown: self.shutdown.clone(),
        };

        tokio::select! {
            biased;
            _ = job_ctx.cancelled() => {
                debug!(job_id = %id, "delivery cancelled before the job was queued");
                return Err(DeliveryError::Cancelled);
            }
            _ = self.shutdown.cancelled() => {
                job_ctx.cancel();
                return Err(DeliveryError::Cancelled);
            }
            sent = self.tx.send(job) => {
                if sent.is_err() {
                    return Err(DeliveryError::Failed("bridge channel closed".to_string()));
                }
            }
        }

        tokio::select! {
            biased;
            result = result_rx => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(message)) => Err(DeliveryError::Failed(message)),
                Err(_) => Err(DeliveryError::Failed("job dropped without a result".to_string())),
            },
            _ = job_ctx.cancelled() => {
                warn!(job_id = %id, "delivery cancelled while job was in flight");
                Err(DeliveryError::Cancelled)
            }
            _ = self.shutdown.cancelled() => {
                job_ctx.cancel();
                warn!(job_id = %id, "bridge shut down while job was in flight");
                Err(DeliveryError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::task::JoinHandle;

    fn message() -> TaskMessage {
        TaskMessage::new("image:stage", b"{}".to_vec())
    }

    fn spawn_delivery(bridge: &Arc<ConsumerBridge>, ctx: CancellationToken) -> JoinHandle<Result<(), DeliveryError>> {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.deliver(ctx, message()).await })
    }

    async fn next_job(bridge: &ConsumerBridge) -> BridgeJob {
        for _ in 0..1_000 {
            if let Some(job) = bridge.get_next_job() {
                return job;
            }
            tokio::task::yield_now().await;
        }
        panic!("no job was delivered");
    }

    async fn wait_pending(bridge: &ConsumerBridge, expected: usize) {
        for _ in 0..1_000 {
            if bridge.pending_count() == expected {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("pending count stuck at {}", bridge.pending_count());
    }

    #[test]
    fn empty_bridge_returns_immediately() {
        let bridge = ConsumerBridge::new(4);
        assert!(bridge.get_next_job().is_none());
        assert_eq!(bridge.capacity(), 8);
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let bridge = ConsumerBridge::new(1);
        bridge.mark_job_completed(JobId::new());
        bridge.mark_job_failed(JobId::new(), "late");
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn completion_acknowledges_delivery() {
        let bridge = Arc::new(ConsumerBridge::new(2));
        let delivery = spawn_delivery(&bridge, CancellationToken::new());

        let job = next_job(&bridge).await;
        assert_eq!(job.task_type, "image:stage");
        assert_eq!(bridge.pending_count(), 1);

        bridge.mark_job_completed(job.id);
        assert_eq!(delivery.await.unwrap(), Ok(()));
        assert_eq!(bridge.pending_count(), 0);

        // A duplicate report is a no-op.
        bridge.mark_job_completed(job.id);
    }

    #[tokio::test]
    async fn failure_is_returned_to_transport() {
        let bridge = Arc::new(ConsumerBridge::new(2));
        let delivery = spawn_delivery(&bridge, CancellationToken::new());

        let job = next_job(&bridge).await;
        bridge.mark_job_failed(job.id, "provider timed out");

        assert_eq!(
            delivery.await.unwrap(),
            Err(DeliveryError::Failed("provider timed out".to_string()))
        );
    }

    #[tokio::test]
    async fn cancelled_delivery_evicts_entry() {
        let bridge = Arc::new(ConsumerBridge::new(2));
        let ctx = CancellationToken::new();
        let delivery = spawn_delivery(&bridge, ctx.clone());

        let job = next_job(&bridge).await;
        ctx.cancel();

        assert_eq!(delivery.await.unwrap(), Err(DeliveryError::Cancelled));
        assert_eq!(bridge.pending_count(), 0);
        assert!(job.ctx.is_cancelled());
        assert!(!job.is_shutting_down());

        // Late report after eviction.
        bridge.mark_job_completed(job.id);
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_while_channel_is_full() {
        let bridge = Arc::new(ConsumerBridge::new(1));
        let first = spawn_delivery(&bridge, CancellationToken::new());
        let second = spawn_delivery(&bridge, CancellationToken::new());
        wait_pending(&bridge, 2).await;

        let ctx = CancellationToken::new();
        let blocked = spawn_delivery(&bridge, ctx.clone());
        wait_pending(&bridge, 3).await;

        ctx.cancel();
        assert_eq!(blocked.await.unwrap(), Err(DeliveryError::Cancelled));
        assert_eq!(bridge.pending_count(), 2);

        for _ in 0..2 {
            let job = next_job(&bridge).await;
            bridge.mark_job_completed(job.id);
        }
        assert_eq!(first.await.unwrap(), Ok(()));
        assert_eq!(second.await.unwrap(), Ok(()));
        assert!(bridge.get_next_job().is_none());
    }

    #[tokio::test]
    async fn skips_jobs_cancelled_before_pickup() {
        let bridge = Arc::new(ConsumerBridge::new(2));
        let ctx = CancellationToken::new();
        let delivery = spawn_delivery(&bridge, ctx.clone());
        wait_pending(&bridge, 1).await;
        // Let the delivery reach its second wait so the job is in the channel.
        tokio::time::sleep(Duration::from_millis(10)).await;

        ctx.cancel();
        assert_eq!(delivery.await.unwrap(), Err(DeliveryError::Cancelled));
        assert!(bridge.get_next_job().is_none());
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_deliveries() {
        let bridge = Arc::new(ConsumerBridge::new(2));
        let a = spawn_delivery(&bridge, CancellationToken::new());
        let b = spawn_delivery(&bridge, CancellationToken::new());
        let job = next_job(&bridge).await;

        bridge.shutdown();

        assert_eq!(a.await.unwrap(), Err(DeliveryError::Cancelled));
        assert_eq!(b.await.unwrap(), Err(DeliveryError::Cancelled));
        assert!(job.ctx.is_cancelled());
        assert!(job.is_shutting_down());
        assert_eq!(bridge.pending_count(), 0);
        assert!(bridge.is_shut_down());
    }
}
