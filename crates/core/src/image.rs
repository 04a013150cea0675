//! Image record as seen by the staging pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainResult;
use crate::id::ImageId;
use crate::status::ImageStatus;

/// Persistent state of one uploaded image.
///
/// The record is owned by the image repository; the pipeline only drives its
/// status forward through the `mark_*` methods, which enforce
/// [`ImageStatus::can_transition_to`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub image_id: ImageId,
    pub status: ImageStatus,
    /// Human-readable failure message (only set in `error`).
    pub error: Option<String>,
    /// Location of the staged output (only set in `ready`).
    pub staged_url: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ImageRecord {
    /// A freshly uploaded image waiting for staging.
    pub fn queued(image_id: ImageId) -> Self {
        Self {
            image_id,
            status: ImageStatus::Queued,
            error: None,
            staged_url: None,
            started_at: None,
            finished_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Move to `processing`. Idempotent; keeps the first `started_at`.
    pub fn mark_processing(&mut self) -> DomainResult<()> {
        self.status.check_transition(ImageStatus::Processing)?;
        let now = Utc::now();
        self.status = ImageStatus::Processing;
        self.started_at.get_or_insert(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_ready(&mut self, staged_url: impl Into<String>) -> DomainResult<()> {
        self.status.check_transition(ImageStatus::Ready)?;
        let now = Utc::now();
        self.status = ImageStatus::Ready;
        self.staged_url = Some(staged_url.into());
        self.error = None;
        self.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_error(&mut self, message: impl Into<String>) -> DomainResult<()> {
        self.status.check_transition(ImageStatus::Error)?;
        let now = Utc::now();
        self.status = ImageStatus::Error;
        self.error = Some(message.into());
        self.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DomainError;

    fn record() -> ImageRecord {
        ImageRecord::queued(ImageId::new("img-1").unwrap())
    }

    #[test]
    fn happy_path_lifecycle() {
        let mut r = record();
        r.mark_processing().unwrap();
        let started = r.started_at;
        assert!(started.is_some());

        // Redelivery while processing keeps the original start time.
        r.mark_processing().unwrap();
        assert_eq!(r.started_at, started);

        r.mark_ready("s3://bucket/staged/img-1.jpg").unwrap();
        assert_eq!(r.status, ImageStatus::Ready);
        assert_eq!(r.staged_url.as_deref(), Some("s3://bucket/staged/img-1.jpg"));
        assert!(r.finished_at.is_some());
    }

    #[test]
    fn terminal_record_rejects_further_changes() {
        let mut r = record();
        r.mark_processing().unwrap();
        r.mark_error("provider timed out").unwrap();

        let before = r.clone();
        assert_eq!(
            r.mark_processing(),
            Err(DomainError::invalid_transition(ImageStatus::Error, ImageStatus::Processing))
        );
        assert!(r.mark_ready("s3://x").is_err());
        assert_eq!(r, before);
    }
}
