//! Job processor: the per-image state machine behind one delivered task.
//!
//! ```text
//! received ─► validated ─► processing ─┬─► ready  (mark_job_completed)
//!                                      └─► error  (mark_job_failed)
//! ```

use std::sync::Arc;

use thiserror::Error;
use tracing::{Span, error, field, info, instrument, warn};

use roomstage_ai::{Stager, StagingError};
use roomstage_core::{DomainError, ImageId};
use roomstage_events::{JobUpdateEvent, StatusPublisher};

use super::task::{StagingTask, TASK_TYPE_STAGE};
use super::types::BridgeJob;
use crate::images::{ImageRepository, RepositoryError};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("invalid task payload: {0}")]
    Payload(#[source] DomainError),

    #[error("image repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Staging(#[from] StagingError),
}

/// Drives one staging job from delivery to a terminal image status.
pub struct JobProcessor {
    images: Arc<dyn ImageRepository>,
    stager: Arc<dyn Stager>,
    publisher: Arc<dyn StatusPublisher>,
}

impl JobProcessor {
    pub fn new(images: Arc<dyn ImageRepository>, stager: Arc<dyn Stager>, publisher: Arc<dyn StatusPublisher>) -> Self {
        Self {
            images,
            stager,
            publisher,
        }
    }

    /// Process `job`. `Ok` means the delivery can be acknowledged.
    ///
    /// Publish failures and a failed `processing` write are logged only; the
    /// staging failure and a failed terminal write are returned.
    #[instrument(skip(self, job), fields(job_id = %job.id, task_type = %job.task_type, image_id = field::Empty))]
    pub async fn process_job(&self, job: &BridgeJob) -> Result<(), ProcessError> {
        if job.task_type != TASK_TYPE_STAGE {
            warn!("rejecting job with unknown task type");
            return Err(ProcessError::UnknownTaskType(job.task_type.clone()));
        }

        let request = StagingTask::decode(&job.payload)
            .and_then(|task| task.to_request())
            .map_err(|e| {
                warn!(error = %e, "rejecting malformed staging payload");
                ProcessError::Payload(e)
            })?;
        let image_id = request.image_id.clone();
        Span::current().record("image_id", field::display(&image_id));

        match self.images.mark_processing(&image_id).await {
            Ok(_) => {}
            Err(e) if e.is_terminal_conflict() => {
                info!(error = %e, "image already finished; acknowledging redelivery without work");
                return Ok(());
            }
            Err(e) => warn!(error = %e, "failed to mark image processing; continuing"),
        }
        self.notify(JobUpdateEvent::processing(image_id.clone())).await;

        match self.stager.stage(&request, &job.ctx).await {
            Ok(location) => {
                if let Err(e) = self.images.mark_ready(&image_id, &location).await {
                    error!(error = %e, %location, "failed to record staged result");
                    return Err(e.into());
                }
                self.notify(JobUpdateEvent::ready(image_id)).await;
                info!(%location, "image staged");
                Ok(())
            }
            Err(err) if err.is_cancelled() && job.is_shutting_down() => {
                // Left in `processing`; a redelivery after restart resumes from there.
                warn!(error = %err, "staging cancelled by shutdown");
                Err(err.into())
            }
            Err(err) if err.is_cancelled() => {
                let message = format!("{err}: delivery timed out");
                warn!(error = %message, "staging cancelled with its delivery");
                self.fail(image_id, message).await;
                Err(err.into())
            }
            Err(err) => {
                let message = err.to_string();
                warn!(stage = err.stage(), error = %message, "staging failed");
                self.fail(image_id, message).await;
                Err(err.into())
            }
        }
    }

    async fn fail(&self, image_id: ImageId, message: String) {
        if let Err(e) = self.images.mark_error(&image_id, &message).await {
            warn!(error = %e, "failed to record staging failure");
        }
        self.notify(JobUpdateEvent::error(image_id, message)).await;
    }

    async fn notify(&self, event: JobUpdateEvent) {
        let status = event.status;
        if let Err(e) = self.publisher.publish(event).await {
            warn!(%status, error = %e, "status event dropped");
        }
    }
}
