//! HTTP client for a Replicate-compatible predictions API.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::inference::{InferenceApi, InferenceError, NewPrediction, Prediction};

pub const DEFAULT_BASE_URL: &str = "https://api.replicate.com";

/// Predictions API over HTTPS with bearer-token auth.
#[derive(Debug, Clone)]
pub struct ReplicateApi {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ReplicateApi {
    /// Build a client. `request_timeout` bounds each individual HTTP call; the
    /// overall prediction deadline is enforced by the staging client.
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, InferenceError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| InferenceError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn predictions_url(&self) -> String {
        format!("{}/v1/predictions", self.base_url)
    }

    async fn decode_prediction(response: reqwest::Response) -> Result<Prediction, InferenceError> {
        let response = check_status(response).await?;
        response
            .json::<Prediction>()
            .await
            .map_err(|e| InferenceError::Decode(e.to_string()))
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, InferenceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(InferenceError::Status {
        status: status.as_u16(),
        body,
    })
}

fn transport(e: reqwest::Error) -> InferenceError {
    InferenceError::Transport(e.to_string())
}

#[async_trait]
impl InferenceApi for ReplicateApi {
    async fn create_prediction(&self, request: &NewPrediction) -> Result<Prediction, InferenceError> {
        debug!(version = %request.version, "creating prediction");
        let response = self
            .http
            .post(self.predictions_url())
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await
            .map_err(transport)?;

        Self::decode_prediction(response).await
    }

    async fn get_prediction(&self, id: &str) -> Result<Prediction, InferenceError> {
        let response = self
            .http
            .get(format!("{}/{}", self.predictions_url(), id))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport)?;

        Self::decode_prediction(response).await
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, InferenceError> {
        let response = self.http.get(url).send().await.map_err(transport)?;
        let response = check_status(response).await?;
        let bytes = response.bytes().await.map_err(transport)?;
        Ok(bytes.to_vec())
    }
}
