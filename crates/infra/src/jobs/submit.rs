//! Producer side: validate, serialise and enqueue staging tasks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, instrument};

use roomstage_core::DomainError;

use super::task::{StagingTask, TASK_TYPE_STAGE};
use crate::queue::{DeliveryParams, QueueError, TaskInfo, TaskMessage, TaskQueue};

/// Per-submission overrides. Every field left `None` falls back to the
/// enqueuer (queue) or transport (everything else) default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Target queue; blank counts as unset.
    pub queue: Option<String>,
    /// Redeliveries after the first attempt. `Some(0)` disables retries.
    pub retry_budget: Option<u32>,
    /// Per-attempt processing limit; zero counts as unset.
    pub timeout: Option<Duration>,
    pub not_before: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
}

impl ExecutionOptions {
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_retry_budget(mut self, retries: u32) -> Self {
        self.retry_budget = Some(retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    pub fn with_deadline(mut self, at: DateTime<Utc>) -> Self {
        self.deadline = Some(at);
        self
    }

    /// Map onto transport parameters, resolving the queue against `default_queue`.
    pub fn delivery_params(&self, default_queue: &str) -> DeliveryParams {
        let queue = self
            .queue
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .unwrap_or(default_queue);

        DeliveryParams {
            queue: queue.to_string(),
            max_retry: self.retry_budget,
            timeout: self.timeout.filter(|t| !t.is_zero()),
            process_at: self.not_before,
            deadline: self.deadline,
        }
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid staging task: {0}")]
    Validation(#[from] DomainError),

    #[error("queue '{0}' is not served by any consumer")]
    UnknownQueue(String),

    #[error("failed to serialise staging task: {0}")]
    Serialization(String),

    #[error("failed to enqueue staging task: {0}")]
    Transport(#[from] QueueError),
}

/// Submits staging tasks to a [`TaskQueue`].
///
/// Only queues some consumer reads are accepted; the default queue always is.
#[derive(Clone)]
pub struct TaskEnqueuer {
    queue: Arc<dyn TaskQueue>,
    default_queue: String,
    served: Vec<String>,
}

impl TaskEnqueuer {
    pub fn new(queue: Arc<dyn TaskQueue>, default_queue: impl Into<String>) -> Self {
        let default_queue = default_queue.into();
        Self {
            queue,
            served: vec![default_queue.clone()],
            default_queue,
        }
    }

    /// Also accept submissions for `queues`.
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for queue in queues {
            let queue = queue.into();
            if !self.served.contains(&queue) {
                self.served.push(queue);
            }
        }
        self
    }

    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }

    pub fn queues(&self) -> &[String] {
        &self.served
    }

    /// Transport parameters for `options`, or `UnknownQueue` if they name a
    /// queue nothing consumes.
    pub fn delivery_params(&self, options: &ExecutionOptions) -> Result<DeliveryParams, SubmitError> {
        let params = options.delivery_params(&self.default_queue);
        if !self.served.contains(&params.queue) {
            return Err(SubmitError::UnknownQueue(params.queue));
        }
        Ok(params)
    }

    /// Validate and enqueue `task`. Nothing reaches the transport unless the
    /// task is valid, targets a served queue and is fully serialised.
    #[instrument(skip(self, task, options), fields(image_id = %task.image_id))]
    pub async fn submit(&self, task: &StagingTask, options: &ExecutionOptions) -> Result<TaskInfo, SubmitError> {
        task.validate()?;
        let params = self.delivery_params(options)?;

        let payload = task.encode().map_err(|e| SubmitError::Serialization(e.to_string()))?;
        let info = self
            .queue
            .enqueue(TaskMessage::new(TASK_TYPE_STAGE, payload), params)
            .await?;

        info!(
            task_id = %info.id,
            queue = %info.queue,
            retry_budget = ?options.retry_budget,
            "staging task enqueued"
        );
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingQueue {
        calls: Mutex<Vec<(TaskMessage, DeliveryParams)>>,
        fail: bool,
    }

    #[async_trait]
    impl TaskQueue for RecordingQueue {
        async fn enqueue(&self, message: TaskMessage, params: DeliveryParams) -> Result<TaskInfo, QueueError> {
            if self.fail {
                return Err(QueueError::Backend("connection refused".into()));
            }
            let queue = params.queue.clone();
            self.calls.lock().unwrap().push((message, params));
            Ok(TaskInfo {
                id: "task-1".into(),
                queue,
            })
        }
    }

    fn enqueuer(queue: Arc<RecordingQueue>) -> TaskEnqueuer {
        TaskEnqueuer::new(queue, "default")
    }

    #[tokio::test]
    async fn submits_serialised_task_to_default_queue() {
        let queue = Arc::new(RecordingQueue::default());
        let task = StagingTask::new("img-1", "https://x/a.jpg").with_seed(9);

        let info = enqueuer(queue.clone())
            .submit(&task, &ExecutionOptions::default())
            .await
            .unwrap();

        assert_eq!(info, TaskInfo { id: "task-1".into(), queue: "default".into() });
        let calls = queue.calls.lock().unwrap();
        let (message, params) = &calls[0];
        assert_eq!(message.task_type, TASK_TYPE_STAGE);
        assert_eq!(StagingTask::decode(&message.payload).unwrap(), task);
        assert_eq!(params, &DeliveryParams::new("default"));
    }

    #[tokio::test]
    async fn empty_original_url_never_reaches_transport() {
        let queue = Arc::new(RecordingQueue::default());

        let err = enqueuer(queue.clone())
            .submit(&StagingTask::new("img-1", ""), &ExecutionOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SubmitError::Validation(_)));
        assert!(queue.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_is_wrapped() {
        let queue = Arc::new(RecordingQueue {
            fail: true,
            ..Default::default()
        });

        let err = enqueuer(queue)
            .submit(&StagingTask::new("img-1", "s3://b/k"), &ExecutionOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SubmitError::Transport(QueueError::Backend(_))));
    }

    #[test]
    fn options_map_onto_delivery_params() {
        let at = Utc::now();
        let options = ExecutionOptions::default()
            .with_queue("critical")
            .with_retry_budget(0)
            .with_timeout(Duration::from_secs(600))
            .with_not_before(at)
            .with_deadline(at + chrono::Duration::hours(1));

        let params = options.delivery_params("default");
        assert_eq!(params.queue, "critical");
        assert_eq!(params.max_retry, Some(0));
        assert_eq!(params.timeout, Some(Duration::from_secs(600)));
        assert_eq!(params.process_at, Some(at));
        assert_eq!(params.deadline, Some(at + chrono::Duration::hours(1)));
    }

    #[test]
    fn blank_queue_and_zero_timeout_are_unset() {
        let options = ExecutionOptions::default()
            .with_queue("  ")
            .with_timeout(Duration::ZERO);

        let params = options.delivery_params("default");
        assert_eq!(params.queue, "default");
        assert_eq!(params.timeout, None);
    }

    #[tokio::test]
    async fn unserved_queue_is_rejected_before_transport() {
        let queue = Arc::new(RecordingQueue::default());
        let enqueuer = enqueuer(queue.clone()).with_queues(["critical", "default"]);
        assert_eq!(enqueuer.queues(), ["default".to_string(), "critical".to_string()]);

        let task = StagingTask::new("img-1", "s3://b/k");
        let err = enqueuer
            .submit(&task, &ExecutionOptions::default().with_queue("bulk"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::UnknownQueue(ref q) if q == "bulk"));
        assert!(queue.calls.lock().unwrap().is_empty());

        let info = enqueuer
            .submit(&task, &ExecutionOptions::default().with_queue("critical"))
            .await
            .unwrap();
        assert_eq!(info.queue, "critical");
    }
}
