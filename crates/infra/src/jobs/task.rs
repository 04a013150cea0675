//! Staging task wire contract shared by producer and consumer processes.

use serde::{Deserialize, Serialize};

use roomstage_ai::StagingRequest;
use roomstage_core::{DomainError, DomainResult, ImageId};

/// Discriminator carried next to every staging payload.
pub const TASK_TYPE_STAGE: &str = "image:stage";

/// Body of an `image:stage` task.
///
/// Identifiers stay plain strings on the wire so that a malformed task can
/// still be decoded and rejected with a precise message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingTask {
    pub image_id: String,
    pub original_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

impl StagingTask {
    pub fn new(image_id: impl Into<String>, original_url: impl Into<String>) -> Self {
        Self {
            image_id: image_id.into(),
            original_url: original_url.into(),
            room_type: None,
            style: None,
            seed: None,
        }
    }

    pub fn with_room_type(mut self, room_type: impl Into<String>) -> Self {
        self.room_type = Some(room_type.into());
        self
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Required fields must be non-blank.
    pub fn validate(&self) -> DomainResult<()> {
        if self.image_id.trim().is_empty() {
            return Err(DomainError::validation("image_id is required"));
        }
        if self.original_url.trim().is_empty() {
            return Err(DomainError::validation("original_url is required"));
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode and validate a payload received from the queue.
    pub fn decode(payload: &[u8]) -> DomainResult<Self> {
        let task: StagingTask = serde_json::from_slice(payload)
            .map_err(|e| DomainError::validation(format!("malformed staging payload: {e}")))?;
        task.validate()?;
        Ok(task)
    }

    /// Normalised request for the staging client. Blank hints count as absent.
    pub fn to_request(&self) -> DomainResult<StagingRequest> {
        self.validate()?;
        Ok(StagingRequest {
            image_id: ImageId::new(self.image_id.trim())?,
            original_url: self.original_url.trim().to_string(),
            room_type: non_blank(self.room_type.as_deref()),
            style: non_blank(self.style.as_deref()),
            seed: self.seed,
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_omits_absent_hints() {
        let task = StagingTask::new("img-1", "https://x/a.jpg");
        let json = String::from_utf8(task.encode().unwrap()).unwrap();
        assert_eq!(json, r#"{"image_id":"img-1","original_url":"https://x/a.jpg"}"#);
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let task = StagingTask::decode(
            br#"{"image_id":"img-1","original_url":"s3://b/k.png","style":"scandinavian","seed":7,"priority":"high"}"#,
        )
        .unwrap();
        assert_eq!(task.style.as_deref(), Some("scandinavian"));
        assert_eq!(task.seed, Some(7));
    }

    #[test]
    fn decode_rejects_missing_or_blank_fields() {
        assert!(StagingTask::decode(br#"{"image_id":"img-1"}"#).is_err());
        assert!(StagingTask::decode(br#"{"image_id":" ","original_url":"s3://b/k"}"#).is_err());
        assert!(StagingTask::decode(b"not json").is_err());
    }

    #[test]
    fn request_drops_blank_hints() {
        let request = StagingTask::new(" img-1 ", "s3://b/k.png")
            .with_room_type("  ")
            .with_style("boho")
            .to_request()
            .unwrap();
        assert_eq!(request.image_id.as_str(), "img-1");
        assert_eq!(request.room_type, None);
        assert_eq!(request.style.as_deref(), Some("boho"));
    }
}
