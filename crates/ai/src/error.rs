use std::time::Duration;

use thiserror::Error;

use roomstage_core::ImageId;

use crate::inference::{InferenceError, PredictionStatus};
use crate::storage::StorageError;

/// Failure of a staging call, tagged with the image and the step that failed.
///
/// The variants keep "the provider rejected the input" (`Rejected`), "the
/// provider never finished" (`TimedOut`) and "our own storage failed"
/// (`SourceDownload`, `Upload`) distinguishable for logs and for the message
/// stored on the image record.
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("image {image_id}: failed to read source image: {source}")]
    SourceDownload { image_id: ImageId, source: StorageError },

    #[error("image {image_id}: prediction submission failed: {source}")]
    Submit { image_id: ImageId, source: InferenceError },

    #[error("image {image_id}: polling prediction {prediction_id} failed: {source}")]
    Poll {
        image_id: ImageId,
        prediction_id: String,
        source: InferenceError,
    },

    #[error("image {image_id}: provider reported prediction {prediction_id} as {status}: {reason}")]
    Rejected {
        image_id: ImageId,
        prediction_id: String,
        status: PredictionStatus,
        reason: String,
    },

    #[error("image {image_id}: prediction {prediction_id} did not finish within {}s", .after.as_secs())]
    TimedOut {
        image_id: ImageId,
        prediction_id: String,
        after: Duration,
    },

    #[error("image {image_id}: prediction {prediction_id} succeeded without a usable output")]
    MissingOutput { image_id: ImageId, prediction_id: String },

    #[error("image {image_id}: failed to download staged output: {source}")]
    OutputDownload { image_id: ImageId, source: InferenceError },

    #[error("image {image_id}: failed to store staged output: {source}")]
    Upload { image_id: ImageId, source: StorageError },

    #[error("image {image_id}: staging cancelled")]
    Cancelled { image_id: ImageId },
}

impl StagingError {
    pub fn image_id(&self) -> &ImageId {
        match self {
            StagingError::SourceDownload { image_id, .. }
            | StagingError::Submit { image_id, .. }
            | StagingError::Poll { image_id, .. }
            | StagingError::Rejected { image_id, .. }
            | StagingError::TimedOut { image_id, .. }
            | StagingError::MissingOutput { image_id, .. }
            | StagingError::OutputDownload { image_id, .. }
            | StagingError::Upload { image_id, .. }
            | StagingError::Cancelled { image_id } => image_id,
        }
    }

    /// Short machine-friendly name of the failing step (for log fields).
    pub fn stage(&self) -> &'static str {
        match self {
            StagingError::SourceDownload { .. } => "source_download",
            StagingError::Submit { .. } => "submit",
            StagingError::Poll { .. } => "poll",
            StagingError::Rejected { .. } => "rejected",
            StagingError::TimedOut { .. } => "timed_out",
            StagingError::MissingOutput { .. } => "missing_output",
            StagingError::OutputDownload { .. } => "output_download",
            StagingError::Upload { .. } => "upload",
            StagingError::Cancelled { .. } => "cancelled",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StagingError::TimedOut { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StagingError::Cancelled { .. })
    }
}
