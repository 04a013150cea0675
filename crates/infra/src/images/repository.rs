//! Image repository seam and its in-memory implementation.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use roomstage_core::{DomainError, ImageId, ImageRecord, ImageStatus};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("image not found: {0}")]
    NotFound(ImageId),

    /// The record is already in a state the requested change cannot follow.
    #[error("image {image_id}: illegal status transition {from} -> {to}")]
    InvalidTransition {
        image_id: ImageId,
        from: ImageStatus,
        to: ImageStatus,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

impl RepositoryError {
    fn from_domain(image_id: &ImageId, err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition { from, to } => RepositoryError::InvalidTransition {
                image_id: image_id.clone(),
                from,
                to,
            },
            other => RepositoryError::Storage(other.to_string()),
        }
    }

    /// Whether the record had already reached `ready` or `error`.
    pub fn is_terminal_conflict(&self) -> bool {
        matches!(self, RepositoryError::InvalidTransition { from, .. } if from.is_terminal())
    }
}

/// Persistence of image status as driven by the job processor.
///
/// Every `mark_*` only moves a record forward; a request that would regress
/// it fails with [`RepositoryError::InvalidTransition`] and changes nothing.
#[async_trait]
pub trait ImageRepository: Send + Sync + 'static {
    /// Register an image as `queued`. Existing records are returned untouched.
    async fn create_queued(&self, image_id: &ImageId) -> Result<ImageRecord, RepositoryError>;

    async fn get(&self, image_id: &ImageId) -> Result<ImageRecord, RepositoryError>;

    /// Idempotent while already `processing`.
    async fn mark_processing(&self, image_id: &ImageId) -> Result<ImageRecord, RepositoryError>;

    async fn mark_ready(&self, image_id: &ImageId, staged_url: &str) -> Result<ImageRecord, RepositoryError>;

    async fn mark_error(&self, image_id: &ImageId, message: &str) -> Result<ImageRecord, RepositoryError>;
}

/// In-memory image repository for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryImageRepository {
    records: RwLock<HashMap<ImageId, ImageRecord>>,
}

impl InMemoryImageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(
        &self,
        image_id: &ImageId,
        apply: impl FnOnce(&mut ImageRecord) -> Result<(), DomainError>,
    ) -> Result<ImageRecord, RepositoryError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .get_mut(image_id)
            .ok_or_else(|| RepositoryError::NotFound(image_id.clone()))?;

        // Apply to a copy so a rejected transition leaves the record as it was.
        let mut next = record.clone();
        apply(&mut next).map_err(|e| RepositoryError::from_domain(image_id, e))?;
        *record = next.clone();
        Ok(next)
    }
}

#[async_trait]
impl ImageRepository for InMemoryImageRepository {
    async fn create_queued(&self, image_id: &ImageId) -> Result<ImageRecord, RepositoryError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .entry(image_id.clone())
            .or_insert_with(|| ImageRecord::queued(image_id.clone()));
        Ok(record.clone())
    }

    async fn get(&self, image_id: &ImageId) -> Result<ImageRecord, RepositoryError> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(image_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(image_id.clone()))
    }

    async fn mark_processing(&self, image_id: &ImageId) -> Result<ImageRecord, RepositoryError> {
        self.update(image_id, ImageRecord::mark_processing)
    }

    async fn mark_ready(&self, image_id: &ImageId, staged_url: &str) -> Result<ImageRecord, RepositoryError> {
        self.update(image_id, |record| record.mark_ready(staged_url))
    }

    async fn mark_error(&self, image_id: &ImageId, message: &str) -> Result<ImageRecord, RepositoryError> {
        self.update(image_id, |record| record.mark_error(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> ImageId {
        ImageId::new("img-1").unwrap()
    }

    #[tokio::test]
    async fn drives_record_forward() {
        let repo = InMemoryImageRepository::new();
        repo.create_queued(&id()).await.unwrap();

        let processing = repo.mark_processing(&id()).await.unwrap();
        assert_eq!(processing.status, ImageStatus::Processing);
        let again = repo.mark_processing(&id()).await.unwrap();
        assert_eq!(again.started_at, processing.started_at);

        let ready = repo.mark_ready(&id(), "s3://bucket/staged/img-1.jpg").await.unwrap();
        assert_eq!(ready.status, ImageStatus::Ready);
        assert_eq!(ready.staged_url.as_deref(), Some("s3://bucket/staged/img-1.jpg"));
    }

    #[tokio::test]
    async fn terminal_states_are_never_overwritten() {
        let repo = InMemoryImageRepository::new();
        repo.create_queued(&id()).await.unwrap();
        repo.mark_error(&id(), "provider timed out").await.unwrap();

        let err = repo.mark_processing(&id()).await.unwrap_err();
        assert!(err.is_terminal_conflict());
        let err = repo.mark_ready(&id(), "s3://x").await.unwrap_err();
        assert!(err.is_terminal_conflict());

        let record = repo.get(&id()).await.unwrap();
        assert_eq!(record.status, ImageStatus::Error);
        assert_eq!(record.error.as_deref(), Some("provider timed out"));
        assert_eq!(record.staged_url, None);
    }

    #[tokio::test]
    async fn create_queued_keeps_existing_record() {
        let repo = InMemoryImageRepository::new();
        repo.create_queued(&id()).await.unwrap();
        repo.mark_processing(&id()).await.unwrap();

        let record = repo.create_queued(&id()).await.unwrap();
        assert_eq!(record.status, ImageStatus::Processing);
    }

    #[tokio::test]
    async fn unknown_image_is_not_found() {
        let repo = InMemoryImageRepository::new();
        assert_eq!(
            repo.mark_processing(&id()).await.unwrap_err(),
            RepositoryError::NotFound(id())
        );
    }
}
