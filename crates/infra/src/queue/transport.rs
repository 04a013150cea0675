//! Queue substrate seam: producer-side enqueue and consumer-side push delivery.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// One unit of work as the substrate sees it: a discriminator plus opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_type: String,
    pub payload: Vec<u8>,
}

impl TaskMessage {
    pub fn new(task_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
        }
    }
}

/// Transport-level delivery parameters.
///
/// `None` means "not set": the substrate applies its own default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryParams {
    pub queue: String,
    /// Redeliveries allowed after the first attempt.
    pub max_retry: Option<u32>,
    /// Per-attempt processing limit.
    pub timeout: Option<Duration>,
    /// Earliest dispatch time.
    pub process_at: Option<DateTime<Utc>>,
    /// No attempt may start (or keep running) past this point.
    pub deadline: Option<DateTime<Utc>>,
}

impl DeliveryParams {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            max_retry: None,
            timeout: None,
            process_at: None,
            deadline: None,
        }
    }
}

/// Handle returned by the substrate for an accepted task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    pub queue: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("queue encoding error: {0}")]
    Encoding(String),
}

/// Outcome reported back to the substrate by a delivery handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The delivery context was cancelled (timeout, deadline or shutdown)
    /// before a result was produced.
    #[error("delivery cancelled")]
    Cancelled,

    /// Processing failed; the substrate redelivers per its retry policy.
    #[error("delivery failed: {0}")]
    Failed(String),
}

/// Producer side of the substrate.
#[async_trait]
pub trait TaskQueue: Send + Sync + 'static {
    async fn enqueue(&self, message: TaskMessage, params: DeliveryParams) -> Result<TaskInfo, QueueError>;
}

/// Consumer side: the substrate pushes each delivery into a handler and
/// acknowledges on `Ok`, redelivers or dead-letters on `Err`.
///
/// `ctx` is cancelled when the attempt times out, passes its deadline or the
/// consumer shuts down.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn deliver(&self, ctx: CancellationToken, message: TaskMessage) -> Result<(), DeliveryError>;
}
