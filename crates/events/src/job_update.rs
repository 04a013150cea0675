use serde::{Deserialize, Serialize};

use roomstage_core::{ImageId, ImageStatus};

use crate::bus::Keyed;

/// Status values a job update can carry.
///
/// `queued` is never published: an image is queued before the pipeline sees it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobUpdateStatus {
    Processing,
    Ready,
    Error,
}

impl JobUpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobUpdateStatus::Processing => "processing",
            JobUpdateStatus::Ready => "ready",
            JobUpdateStatus::Error => "error",
        }
    }
}

impl From<JobUpdateStatus> for ImageStatus {
    fn from(value: JobUpdateStatus) -> Self {
        match value {
            JobUpdateStatus::Processing => ImageStatus::Processing,
            JobUpdateStatus::Ready => ImageStatus::Ready,
            JobUpdateStatus::Error => ImageStatus::Error,
        }
    }
}

impl core::fmt::Display for JobUpdateStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification published on every image status transition.
///
/// Wire format: `{"image_id": "...", "status": "processing"|"ready"|"error", "error"?: "..."}`.
/// Not persisted; subscribers treat it as a cache-invalidation hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUpdateEvent {
    pub image_id: ImageId,
    pub status: JobUpdateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Keyed for JobUpdateEvent {
    fn key(&self) -> &str {
        self.image_id.as_str()
    }
}

impl JobUpdateEvent {
    pub fn processing(image_id: ImageId) -> Self {
        Self {
            image_id,
            status: JobUpdateStatus::Processing,
            error: None,
        }
    }

    pub fn ready(image_id: ImageId) -> Self {
        Self {
            image_id,
            status: JobUpdateStatus::Ready,
            error: None,
        }
    }

    pub fn error(image_id: ImageId, message: impl Into<String>) -> Self {
        Self {
            image_id,
            status: JobUpdateStatus::Error,
            error: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn img(id: &str) -> ImageId {
        ImageId::new(id).unwrap()
    }

    #[test]
    fn omits_error_when_absent() {
        let v = serde_json::to_value(JobUpdateEvent::processing(img("img-1"))).unwrap();
        assert_eq!(v, json!({"image_id": "img-1", "status": "processing"}));
    }

    #[test]
    fn carries_error_message() {
        let v = serde_json::to_value(JobUpdateEvent::error(img("img-1"), "boom")).unwrap();
        assert_eq!(v, json!({"image_id": "img-1", "status": "error", "error": "boom"}));
    }

    #[test]
    fn decodes_payload_without_error_field() {
        let ev: JobUpdateEvent =
            serde_json::from_str(r#"{"image_id":"img-9","status":"ready"}"#).unwrap();
        assert_eq!(ev, JobUpdateEvent::ready(img("img-9")));
    }
}
