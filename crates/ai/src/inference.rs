//! Managed inference API seam (prediction submit / poll / fetch).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InferenceError {
    /// The request never got a response (connect, TLS, timeout, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// The provider answered with a non-success HTTP status.
    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The provider's response body could not be decoded.
    #[error("malformed provider response: {0}")]
    Decode(String),
}

/// Lifecycle status reported by the provider.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
    #[serde(other)]
    Unknown,
}

impl PredictionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionStatus::Starting => "starting",
            PredictionStatus::Processing => "processing",
            PredictionStatus::Succeeded => "succeeded",
            PredictionStatus::Failed => "failed",
            PredictionStatus::Canceled => "canceled",
            PredictionStatus::Unknown => "unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PredictionStatus::Succeeded | PredictionStatus::Failed | PredictionStatus::Canceled
        )
    }
}

impl core::fmt::Display for PredictionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input block of a prediction request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionInput {
    /// Source image as a URL or `data:` URI.
    pub image: String,
    pub prompt: String,
    pub negative_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

/// Body of `POST /v1/predictions`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewPrediction {
    pub version: String,
    pub input: PredictionInput,
}

/// Prediction as returned by create/get.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub status: PredictionStatus,
    #[serde(default)]
    pub output: Option<JsonValue>,
    #[serde(default)]
    pub error: Option<JsonValue>,
}

impl Prediction {
    /// First output URL, if the output has a usable shape.
    ///
    /// Models return either a single URL string or a list of URLs.
    pub fn output_url(&self) -> Option<&str> {
        let url = match self.output.as_ref()? {
            JsonValue::String(s) => s.as_str(),
            JsonValue::Array(items) => items.iter().find_map(|v| v.as_str())?,
            _ => return None,
        };
        let url = url.trim();
        if url.is_empty() { None } else { Some(url) }
    }

    /// Provider-supplied failure reason, flattened to text.
    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            JsonValue::Null => None,
            JsonValue::String(s) if s.trim().is_empty() => None,
            JsonValue::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Client for a prediction-style inference provider.
#[async_trait]
pub trait InferenceApi: Send + Sync + 'static {
    async fn create_prediction(&self, request: &NewPrediction) -> Result<Prediction, InferenceError>;

    async fn get_prediction(&self, id: &str) -> Result<Prediction, InferenceError>;

    /// Fetch the bytes of a produced output.
    async fn download(&self, url: &str) -> Result<Vec<u8>, InferenceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn prediction(output: JsonValue) -> Prediction {
        serde_json::from_value(json!({"id": "p1", "status": "succeeded", "output": output})).unwrap()
    }

    #[test]
    fn reads_single_and_list_outputs() {
        assert_eq!(prediction(json!("https://x/out.png")).output_url(), Some("https://x/out.png"));
        assert_eq!(
            prediction(json!(["https://x/0.png", "https://x/1.png"])).output_url(),
            Some("https://x/0.png")
        );
    }

    #[test]
    fn rejects_unusable_outputs() {
        assert_eq!(prediction(json!(null)).output_url(), None);
        assert_eq!(prediction(json!([])).output_url(), None);
        assert_eq!(prediction(json!({"url": "https://x"})).output_url(), None);
        assert_eq!(prediction(json!("  ")).output_url(), None);
    }

    #[test]
    fn tolerates_unknown_statuses() {
        let p: Prediction = serde_json::from_value(json!({"id": "p1", "status": "queued_somewhere"})).unwrap();
        assert_eq!(p.status, PredictionStatus::Unknown);
        assert!(!p.status.is_terminal());
    }

    #[test]
    fn seed_is_omitted_when_absent() {
        let body = NewPrediction {
            version: "v1".into(),
            input: PredictionInput {
                image: "data:image/png;base64,AA==".into(),
                prompt: "p".into(),
                negative_prompt: "n".into(),
                seed: None,
            },
        };
        let v = serde_json::to_value(&body).unwrap();
        assert!(v["input"].get("seed").is_none());
    }
}
