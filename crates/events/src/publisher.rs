//! Best-effort publication of job status updates.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::job_update::JobUpdateEvent;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Every attempt failed; `last_error` is the final bus error.
    #[error("publish failed after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Sink for job status notifications, as seen by the job processor.
///
/// Callers must never let a publish failure fail the job itself.
#[async_trait]
pub trait StatusPublisher: Send + Sync + 'static {
    async fn publish(&self, event: JobUpdateEvent) -> Result<(), PublishError>;
}

/// Retry settings for [`EventPublisher`].
#[derive(Debug, Clone)]
pub struct PublishRetry {
    /// Total attempts including the first one (min 1).
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles afterwards.
    pub base_backoff: Duration,
    /// Upper bound on a single delay.
    pub max_backoff: Duration,
}

impl Default for PublishRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl PublishRetry {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Publishes [`JobUpdateEvent`]s to an [`EventBus`] with a small bounded retry.
///
/// Bus implementations are synchronous (they may do blocking IO), so each
/// attempt runs on the blocking pool.
#[derive(Debug)]
pub struct EventPublisher<B> {
    bus: Arc<B>,
    retry: PublishRetry,
}

impl<B> EventPublisher<B> {
    pub fn new(bus: Arc<B>) -> Self {
        Self {
            bus,
            retry: PublishRetry::default(),
        }
    }

    pub fn with_retry(mut self, retry: PublishRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }
}

#[async_trait]
impl<B> StatusPublisher for EventPublisher<B>
where
    B: EventBus<JobUpdateEvent> + 'static,
{
    async fn publish(&self, event: JobUpdateEvent) -> Result<(), PublishError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let bus = self.bus.clone();
            let message = event.clone();
            let last_error = match tokio::task::spawn_blocking(move || bus.publish(message)).await {
                Ok(Ok(())) => {
                    debug!(image_id = %event.image_id, status = %event.status, attempt, "job update published");
                    return Ok(());
                }
                Ok(Err(e)) => format!("{e:?}"),
                Err(join) => join.to_string(),
            };

            if attempt >= max_attempts {
                warn!(
                    image_id = %event.image_id,
                    status = %event.status,
                    attempts = attempt,
                    error = %last_error,
                    "giving up publishing job update"
                );
                return Err(PublishError::Exhausted {
                    attempts: attempt,
                    last_error,
                });
            }

            tokio::time::sleep(self.retry.delay_after(attempt)).await;
        }
    }
}
