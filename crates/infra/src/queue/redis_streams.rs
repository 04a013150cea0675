//! Redis Streams-backed queue substrate (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Stream key**: `{prefix}:{queue}`, one stream per queue
//! - **Consumer group**: shared by every worker process of a deployment
//! - **Dead-letter stream**: `{prefix}:{queue}:dlq`
//! - **Delayed set**: `{prefix}:delayed`, a sorted set scored by due time
//!   (epoch millis). Scheduled tasks and retries wait here and are promoted
//!   onto their stream when due.
//!
//! A failed delivery is acknowledged and re-parked in the delayed set with
//! its attempt count bumped, so the retry budget travels with the task.
//!
//! Entries left pending in the group by a consumer that died mid-delivery
//! are taken over with XAUTOCLAIM once idle for longer than `claim_idle`,
//! at startup and every `reclaim_interval` after that.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::transport::{
    DeliveryError, DeliveryHandler, DeliveryParams, QueueError, TaskInfo, TaskMessage, TaskQueue,
};

/// Default key prefix for task streams
const DEFAULT_PREFIX: &str = "roomstage:tasks";

/// Default consumer group
const DEFAULT_GROUP: &str = "roomstage-workers";

/// Delayed tasks promoted per sweep
const PROMOTE_BATCH: isize = 100;

/// XAUTOCLAIM cursor for a full scan of the pending list
const CLAIM_START: &str = "0-0";

#[derive(Debug, Clone)]
pub struct RedisStreamsConfig {
    pub prefix: String,
    pub group: String,
    /// Unique within the group.
    pub consumer: String,
    pub concurrency: usize,
    pub default_max_retry: u32,
    pub retry_delay: Duration,
    /// XREADGROUP block time; also bounds how late a delayed task is promoted.
    pub block: Duration,
    /// Pending entries idle this long are reclaimed from their consumer.
    /// Must exceed the longest attempt.
    pub claim_idle: Duration,
    pub reclaim_interval: Duration,
}

impl Default for RedisStreamsConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: format!("consumer-{}", Uuid::now_v7()),
            concurrency: 4,
            default_max_retry: 3,
            retry_delay: Duration::from_secs(5),
            block: Duration::from_secs(1),
            claim_idle: Duration::from_secs(600),
            reclaim_interval: Duration::from_secs(30),
        }
    }
}

impl RedisStreamsConfig {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

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

    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle = idle;
        self
    }
}

/// Task as stored in a stream entry or the delayed set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredTask {
    id: String,
    queue: String,
    task_type: String,
    payload: Vec<u8>,
    #[serde(default)]
    attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_retry: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deadline: Option<DateTime<Utc>>,
}

impl StoredTask {
    fn encode(&self) -> Result<String, QueueError> {
        serde_json::to_string(self).map_err(|e| QueueError::Encoding(e.to_string()))
    }

    fn decode(raw: &str) -> Result<Self, QueueError> {
        serde_json::from_str(raw).map_err(|e| QueueError::Encoding(e.to_string()))
    }

    fn message(&self) -> TaskMessage {
        TaskMessage::new(self.task_type.clone(), self.payload.clone())
    }

    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    fn attempt_limit(&self, now: DateTime<Utc>) -> Option<Duration> {
        let timeout = self.timeout_ms.map(Duration::from_millis);
        let until_deadline = self.deadline.and_then(|d| (d - now).to_std().ok());
        match (timeout, until_deadline) {
            (Some(t), Some(d)) => Some(t.min(d)),
            (t, d) => t.or(d),
        }
    }
}

fn backend(e: redis::RedisError) -> QueueError {
    QueueError::Backend(e.to_string())
}

/// What happens to a stream entry once its delivery has returned.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Settlement {
    Ack,
    /// Interrupted by shutdown: appended again unchanged.
    Requeue,
    /// Parked in the delayed set with the attempt counted.
    Retry { attempts: u32 },
    DeadLetter { attempts: u32, reason: String },
}

fn settle(
    task: &StoredTask,
    outcome: &Result<(), DeliveryError>,
    shutting_down: bool,
    default_max_retry: u32,
) -> Settlement {
    match outcome {
        Ok(()) => Settlement::Ack,
        Err(_) if shutting_down => Settlement::Requeue,
        Err(error) => {
            let attempts = task.attempts + 1;
            if attempts <= task.max_retry.unwrap_or(default_max_retry) {
                Settlement::Retry { attempts }
            } else {
                Settlement::DeadLetter {
                    attempts,
                    reason: error.to_string(),
                }
            }
        }
    }
}

/// A stream entry handed to this consumer, read fresh or reclaimed.
#[derive(Debug)]
struct PendingEntry {
    stream_key: String,
    entry_id: String,
    task: Option<String>,
}

#[derive(Debug)]
struct Shared {
    client: redis::Client,
    config: RedisStreamsConfig,
}

/// Redis Streams [`TaskQueue`] with a consumer-group delivery loop.
#[derive(Debug, Clone)]
pub struct RedisStreamsQueue {
    shared: Arc<Shared>,
}

impl RedisStreamsQueue {
    pub fn new(redis_url: impl AsRef<str>, config: RedisStreamsConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(backend)?;
        Ok(Self {
            shared: Arc::new(Shared { client, config }),
        })
    }

    pub fn stream_key(&self, queue: &str) -> String {
        self.shared.stream_key(queue)
    }

    pub fn dlq_key(&self, queue: &str) -> String {
        format!("{}:dlq", self.shared.stream_key(queue))
    }

    /// Consume `queues` and push deliveries into `handler` until `shutdown` fires.
    pub async fn run(
        &self,
        queues: &[String],
        handler: Arc<dyn DeliveryHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), QueueError> {
        let shared = &self.shared;
        let config = &shared.config;
        let mut conn = shared.connection().await?;
        // XREADGROUP BLOCK would stall every other command on a shared connection.
        let mut reader = shared.connection().await?;

        let keys: Vec<String> = queues.iter().map(|q| shared.stream_key(q)).collect();
        for key in &keys {
            shared.ensure_consumer_group(&mut conn, key).await?;
        }
        let ids = vec![">"; keys.len()];

        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let tracker = TaskTracker::new();
        let mut cursors = vec![CLAIM_START.to_string(); keys.len()];
        let mut last_reclaim: Option<Instant> = None;
        info!(group = %config.group, consumer = %config.consumer, queues = ?queues, "redis streams consumer started");

        while !shutdown.is_cancelled() {
            if let Err(e) = shared.promote_due(&mut conn).await {
                error!(error = %e, "failed to promote delayed tasks");
            }

            let available = permits.available_permits();
            if available == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(50)) => continue,
                }
            }

            let mut batch = Vec::new();
            if last_reclaim.is_none_or(|at| at.elapsed() >= config.reclaim_interval) {
                last_reclaim = Some(Instant::now());
                for (key, cursor) in keys.iter().zip(cursors.iter_mut()) {
                    match shared.claim_idle(&mut conn, key, cursor.as_str(), available).await {
                        Ok((next, claimed)) => {
                            if !claimed.is_empty() {
                                warn!(stream = %key, reclaimed = claimed.len(), "reclaimed idle pending entries");
                            }
                            *cursor = next;
                            batch.extend(claimed);
                        }
                        Err(e) => error!(stream = %key, error = %e, "XAUTOCLAIM failed"),
                    }
                }
            }

            if batch.is_empty() {
                let opts = StreamReadOptions::default()
                    .group(&config.group, &config.consumer)
                    .count(available)
                    .block(config.block.as_millis() as usize);

                // Not raced against shutdown: a dropped read would strand the
                // entries Redis already assigned to this consumer. BLOCK bounds
                // the wait.
                let read: Result<Option<StreamReadReply>, redis::RedisError> =
                    reader.xread_options(&keys, &ids, &opts).await;
                match read {
                    Ok(Some(reply)) => {
                        for stream in reply.keys {
                            for entry in stream.ids {
                                batch.push(PendingEntry {
                                    stream_key: stream.key.clone(),
                                    task: entry.get("task"),
                                    entry_id: entry.id,
                                });
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(error = %e, "XREADGROUP failed");
                        tokio::time::sleep(config.block).await;
                    }
                }
            }

            for entry in batch {
                // Every entry already read is dispatched, waiting for a slot
                // if the reply outgrew the free ones.
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };

                let task = match entry.task.as_deref().map(StoredTask::decode) {
                    Some(Ok(task)) => task,
                    other => {
                        warn!(stream = %entry.stream_key, entry_id = %entry.entry_id, error = ?other.map(|r| r.err()), "dropping undecodable stream entry");
                        shared.ack(&mut conn, &entry.stream_key, &entry.entry_id).await;
                        continue;
                    }
                };

                let shared = shared.clone();
                let handler = handler.clone();
                let shutdown = shutdown.clone();
                let conn = conn.clone();
                tracker.spawn(async move {
                    let _permit = permit;
                    shared
                        .dispatch(conn, handler.as_ref(), &entry.stream_key, &entry.entry_id, task, &shutdown)
                        .await;
                });
            }
        }

        tracker.close();
        tracker.wait().await;
        info!(group = %config.group, consumer = %config.consumer, "redis streams consumer stopped");
        Ok(())
    }
}

impl Shared {
    fn stream_key(&self, queue: &str) -> String {
        format!("{}:{}", self.config.prefix, queue)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.config.prefix)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        self.client.get_multiplexed_async_connection().await.map_err(backend)
    }

    /// Create the consumer group (and stream) if missing.
    async fn ensure_consumer_group(&self, conn: &mut MultiplexedConnection, key: &str) -> Result<(), QueueError> {
        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(key, &self.config.group, "0").await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::Backend(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    /// XAUTOCLAIM up to `count` entries idle for `claim_idle` from any
    /// consumer in the group, scanning from `cursor`. Returns the next cursor.
    async fn claim_idle(
        &self,
        conn: &mut MultiplexedConnection,
        key: &str,
        cursor: &str,
        count: usize,
    ) -> Result<(String, Vec<PendingEntry>), QueueError> {
        let reply: Vec<redis::Value> = redis::cmd("XAUTOCLAIM")
            .arg(key)
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg(self.config.claim_idle.as_millis() as u64)
            .arg(cursor)
            .arg("COUNT")
            .arg(count.max(1))
            .query_async(conn)
            .await
            .map_err(backend)?;

        let next: String = match reply.first() {
            Some(value) => redis::from_redis_value(value).map_err(backend)?,
            None => CLAIM_START.to_string(),
        };
        let raw_entries: Vec<redis::Value> = match reply.get(1) {
            Some(value) => redis::from_redis_value(value).map_err(backend)?,
            None => Vec::new(),
        };

        let mut entries = Vec::with_capacity(raw_entries.len());
        for raw in &raw_entries {
            // Entries deleted from the stream come back without fields.
            let (entry_id, fields): (String, Option<Vec<(String, String)>>) =
                redis::from_redis_value(raw).map_err(backend)?;
            entries.push(PendingEntry {
                stream_key: key.to_string(),
                entry_id,
                task: fields.and_then(|f| f.into_iter().find(|(k, _)| k == "task").map(|(_, v)| v)),
            });
        }
        Ok((next, entries))
    }

    async fn append(&self, conn: &mut MultiplexedConnection, task: &StoredTask) -> Result<(), QueueError> {
        let encoded = task.encode()?;
        let _: String = conn
            .xadd(self.stream_key(&task.queue), "*", &[("task", encoded)])
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn park(&self, conn: &mut MultiplexedConnection, task: &StoredTask, due: DateTime<Utc>) -> Result<(), QueueError> {
        let encoded = task.encode()?;
        let _: i64 = conn
            .zadd(self.delayed_key(), encoded, due.timestamp_millis())
            .await
            .map_err(backend)?;
        Ok(())
    }

    /// Move due tasks from the delayed set onto their streams.
    ///
    /// ZREM decides ownership when several consumers sweep at once.
    async fn promote_due(&self, conn: &mut MultiplexedConnection) -> Result<usize, QueueError> {
        let now = Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore_limit(self.delayed_key(), "-inf", now, 0, PROMOTE_BATCH)
            .await
            .map_err(backend)?;

        let mut promoted = 0;
        for member in due {
            let removed: i64 = conn.zrem(self.delayed_key(), &member).await.map_err(backend)?;
            if removed == 0 {
                continue;
            }
            match StoredTask::decode(&member) {
                Ok(task) => {
                    self.append(conn, &task).await?;
                    promoted += 1;
                }
                Err(e) => warn!(error = %e, "dropping undecodable delayed task"),
            }
        }
        if promoted > 0 {
            debug!(promoted, "promoted delayed tasks");
        }
        Ok(promoted)
    }

    async fn ack(&self, conn: &mut MultiplexedConnection, stream_key: &str, entry_id: &str) {
        let acked: redis::RedisResult<i64> = conn.xack(stream_key, &self.config.group, &[entry_id]).await;
        if let Err(e) = acked {
            error!(stream = %stream_key, entry_id = %entry_id, error = %e, "XACK failed");
        }
    }

    async fn dead_letter(&self, conn: &mut MultiplexedConnection, stream_key: &str, task: &StoredTask, reason: &str) {
        let encoded = match task.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "failed to encode dead letter");
                return;
            }
        };
        let added: redis::RedisResult<String> = conn
            .xadd(
                format!("{stream_key}:dlq"),
                "*",
                &[
                    ("task", encoded),
                    ("reason", reason.to_string()),
                    ("failed_at", Utc::now().to_rfc3339()),
                ],
            )
            .await;
        match added {
            Ok(_) => warn!(task_id = %task.id, attempts = task.attempts, reason = %reason, "task sent to dead-letter stream"),
            Err(e) => error!(task_id = %task.id, error = %e, "DLQ XADD failed"),
        }
    }

    #[instrument(skip(self, conn, handler, task, shutdown), fields(task_id = %task.id, queue = %task.queue))]
    async fn dispatch(
        &self,
        mut conn: MultiplexedConnection,
        handler: &dyn DeliveryHandler,
        stream_key: &str,
        entry_id: &str,
        mut task: StoredTask,
        shutdown: &CancellationToken,
    ) {
        let now = Utc::now();
        if task.expired(now) {
            self.dead_letter(&mut conn, stream_key, &task, "deadline exceeded").await;
            self.ack(&mut conn, stream_key, entry_id).await;
            return;
        }

        let ctx = shutdown.child_token();
        let deliver = handler.deliver(ctx.clone(), task.message());
        tokio::pin!(deliver);
        let outcome = match task.attempt_limit(now) {
            None => deliver.await,
            Some(limit) => tokio::select! {
                outcome = &mut deliver => outcome,
                _ = tokio::time::sleep(limit) => {
                    ctx.cancel();
                    deliver.await
                }
            },
        };

        match settle(&task, &outcome, shutdown.is_cancelled(), self.config.default_max_retry) {
            Settlement::Ack => {
                debug!(attempt = task.attempts + 1, "task acknowledged");
            }
            Settlement::Requeue => {
                debug!("consumer shutting down; re-queueing task");
                if let Err(e) = self.append(&mut conn, &task).await {
                    // Not acknowledged either: it stays pending until reclaimed.
                    error!(error = %e, "failed to re-queue task on shutdown");
                    return;
                }
            }
            Settlement::Retry { attempts } => {
                task.attempts = attempts;
                let due = Utc::now() + chrono::Duration::from_std(self.config.retry_delay).unwrap_or_default();
                warn!(attempt = attempts, error = ?outcome.err(), "delivery failed; scheduling retry");
                if let Err(e) = self.park(&mut conn, &task, due).await {
                    error!(error = %e, "failed to schedule retry; leaving entry pending");
                    return;
                }
            }
            Settlement::DeadLetter { attempts, reason } => {
                task.attempts = attempts;
                self.dead_letter(&mut conn, stream_key, &task, &reason).await;
            }
        }

        self.ack(&mut conn, stream_key, entry_id).await;
    }
}

#[async_trait]
impl TaskQueue for RedisStreamsQueue {
    async fn enqueue(&self, message: TaskMessage, params: DeliveryParams) -> Result<TaskInfo, QueueError> {
        let task = StoredTask {
            id: Uuid::now_v7().to_string(),
            queue: params.queue,
            task_type: message.task_type,
            payload: message.payload,
            attempts: 0,
            max_retry: params.max_retry,
            timeout_ms: params.timeout.map(|t| t.as_millis() as u64),
            deadline: params.deadline,
        };

        let mut conn = self.shared.connection().await?;
        match params.process_at {
            Some(at) if at > Utc::now() => self.shared.park(&mut conn, &task, at).await?,
            _ => self.shared.append(&mut conn, &task).await?,
        }

        Ok(TaskInfo {
            id: task.id,
            queue: task.queue,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored() -> StoredTask {
        StoredTask {
            id: "t-1".into(),
            queue: "default".into(),
            task_type: "image:stage".into(),
            payload: br#"{"image_id":"img-1"}"#.to_vec(),
            attempts: 2,
            max_retry: Some(5),
            timeout_ms: None,
            deadline: None,
        }
    }

    #[test]
    fn key_layout() {
        let queue = RedisStreamsQueue::new(
            "redis://localhost:6379",
            RedisStreamsConfig::default().with_prefix("test:tasks"),
        )
        .unwrap();
        assert_eq!(queue.stream_key("default"), "test:tasks:default");
        assert_eq!(queue.dlq_key("default"), "test:tasks:default:dlq");
        assert_eq!(queue.shared.delayed_key(), "test:tasks:delayed");
    }

    #[test]
    fn stored_task_keeps_retry_state() {
        let decoded = StoredTask::decode(&stored().encode().unwrap()).unwrap();
        assert_eq!(decoded, stored());
        assert_eq!(decoded.message().task_type, "image:stage");
    }

    #[test]
    fn attempt_limit_prefers_tighter_bound() {
        let now = Utc::now();
        let mut task = stored();
        assert_eq!(task.attempt_limit(now), None);

        task.timeout_ms = Some(60_000);
        task.deadline = Some(now + chrono::Duration::seconds(10));
        assert_eq!(task.attempt_limit(now), Some(Duration::from_secs(10)));
    }

    fn failed() -> Result<(), DeliveryError> {
        Err(DeliveryError::Failed("provider down".into()))
    }

    #[test]
    fn success_is_acknowledged_even_during_shutdown() {
        assert_eq!(settle(&stored(), &Ok(()), true, 3), Settlement::Ack);
    }

    #[test]
    fn shutdown_requeues_without_counting_the_attempt() {
        assert_eq!(settle(&stored(), &Err(DeliveryError::Cancelled), true, 3), Settlement::Requeue);
        assert_eq!(settle(&stored(), &failed(), true, 3), Settlement::Requeue);
    }

    #[test]
    fn failures_retry_until_the_task_budget_is_spent() {
        let mut task = stored();
        task.attempts = 4;
        assert_eq!(settle(&task, &failed(), false, 0), Settlement::Retry { attempts: 5 });

        task.attempts = 5;
        assert_eq!(
            settle(&task, &failed(), false, 0),
            Settlement::DeadLetter {
                attempts: 6,
                reason: "delivery failed: provider down".into(),
            }
        );
    }

    #[test]
    fn unset_budget_falls_back_to_the_queue_default() {
        let mut task = stored();
        task.attempts = 0;
        task.max_retry = None;
        assert_eq!(settle(&task, &failed(), false, 1), Settlement::Retry { attempts: 1 });

        task.max_retry = Some(0);
        assert!(matches!(
            settle(&task, &Err(DeliveryError::Cancelled), false, 1),
            Settlement::DeadLetter { attempts: 1, ref reason } if reason == "delivery cancelled"
        ));
    }

    #[test]
    fn expired_tasks_are_detected_before_delivery() {
        let now = Utc::now();
        let mut task = stored();
        assert!(!task.expired(now));
        task.deadline = Some(now);
        assert!(task.expired(now));
        task.deadline = Some(now + chrono::Duration::seconds(1));
        assert!(!task.expired(now));
    }

    #[test]
    fn reclaim_outlasts_the_staging_timeout() {
        let config = RedisStreamsConfig::default();
        assert!(config.claim_idle > Duration::from_secs(300));
        assert_eq!(config.with_claim_idle(Duration::from_secs(900)).claim_idle, Duration::from_secs(900));
    }
}
