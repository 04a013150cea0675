//! AI staging client: source fetch → prediction → bounded poll → store result.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use roomstage_core::ImageId;

use crate::error::StagingError;
use crate::inference::{InferenceApi, NewPrediction, Prediction, PredictionInput, PredictionStatus};
use crate::job::{Stager, StagingRequest};
use crate::prompt::build_prompt;
use crate::storage::{ObjectStore, content_type_for, extension_of, object_key_from_url};

/// Staging client configuration.
#[derive(Debug, Clone)]
pub struct StagingConfig {
    /// Model version id passed to the provider.
    pub model_version: String,
    /// Delay between status polls.
    pub poll_interval: Duration,
    /// Wall-clock budget for a prediction, measured from submission.
    pub timeout: Duration,
    /// Key prefix for stored results (`{prefix}/{image_id}.{ext}`).
    pub output_prefix: String,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            model_version: String::new(),
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(5 * 60),
            output_prefix: "staged".to_string(),
        }
    }
}

impl StagingConfig {
    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = version.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_output_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.output_prefix = prefix.into();
        self
    }
}

/// [`Stager`] backed by an object store and a prediction-style inference API.
pub struct StagingClient {
    store: Arc<dyn ObjectStore>,
    api: Arc<dyn InferenceApi>,
    config: StagingConfig,
}

impl StagingClient {
    pub fn new(store: Arc<dyn ObjectStore>, api: Arc<dyn InferenceApi>, config: StagingConfig) -> Self {
        Self { store, api, config }
    }

    pub fn config(&self) -> &StagingConfig {
        &self.config
    }

    fn output_key(&self, image_id: &ImageId, output_url: &str) -> String {
        let ext = extension_of(output_url).unwrap_or_else(|| "png".to_string());
        format!("{}/{}.{}", self.config.output_prefix.trim_end_matches('/'), image_id, ext)
    }

    /// Poll until the prediction reaches a terminal status or the deadline passes.
    async fn wait_for_completion(
        &self,
        image_id: &ImageId,
        mut prediction: Prediction,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Prediction, StagingError> {
        let prediction_id = prediction.id.clone();
        let mut polls: u32 = 0;

        loop {
            match prediction.status {
                PredictionStatus::Succeeded => return Ok(prediction),
                PredictionStatus::Failed | PredictionStatus::Canceled => {
                    return Err(StagingError::Rejected {
                        image_id: image_id.clone(),
                        prediction_id,
                        status: prediction.status,
                        reason: prediction
                            .error_message()
                            .unwrap_or_else(|| "no reason given".to_string()),
                    });
                }
                _ => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StagingError::TimedOut {
                    image_id: image_id.clone(),
                    prediction_id,
                    after: self.config.timeout,
                });
            }

            let wake = (now + self.config.poll_interval).min(deadline);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(StagingError::Cancelled { image_id: image_id.clone() });
                }
                _ = tokio::time::sleep_until(wake) => {}
            }

            polls += 1;
            let polled = guarded(cancel, image_id, tokio::time::timeout_at(deadline, self.api.get_prediction(&prediction_id))).await?;
            prediction = match polled {
                Ok(result) => result.map_err(|source| StagingError::Poll {
                    image_id: image_id.clone(),
                    prediction_id: prediction_id.clone(),
                    source,
                })?,
                Err(_elapsed) => {
                    return Err(StagingError::TimedOut {
                        image_id: image_id.clone(),
                        prediction_id,
                        after: self.config.timeout,
                    });
                }
            };
            debug!(%image_id, prediction_id = %prediction_id, status = %prediction.status, polls, "polled prediction");
        }
    }
}

/// Run `fut` unless `cancel` fires first.
async fn guarded<F, T>(cancel: &CancellationToken, image_id: &ImageId, fut: F) -> Result<T, StagingError>
where
    F: Future<Output = T>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(StagingError::Cancelled { image_id: image_id.clone() }),
        out = fut => Ok(out),
    }
}

#[async_trait]
impl Stager for StagingClient {
    #[instrument(skip(self, request, cancel), fields(image_id = %request.image_id))]
    async fn stage(&self, request: &StagingRequest, cancel: &CancellationToken) -> Result<String, StagingError> {
        let image_id = &request.image_id;

        let source_key = object_key_from_url(&request.original_url).map_err(|source| StagingError::SourceDownload {
            image_id: image_id.clone(),
            source,
        })?;
        let source = guarded(cancel, image_id, self.store.get(&source_key))
            .await?
            .map_err(|source| StagingError::SourceDownload {
                image_id: image_id.clone(),
                source,
            })?;

        let prompt = build_prompt(request.room_type.as_deref(), request.style.as_deref());
        let body = NewPrediction {
            version: self.config.model_version.clone(),
            input: PredictionInput {
                image: format!("data:{};base64,{}", content_type_for(&source_key), BASE64.encode(&source)),
                prompt: prompt.prompt,
                negative_prompt: prompt.negative_prompt,
                seed: request.seed,
            },
        };

        let deadline = Instant::now() + self.config.timeout;
        let created = guarded(cancel, image_id, self.api.create_prediction(&body))
            .await?
            .map_err(|source| StagingError::Submit {
                image_id: image_id.clone(),
                source,
            })?;
        info!(%image_id, prediction_id = %created.id, "prediction submitted");

        let finished = match self.wait_for_completion(image_id, created, deadline, cancel).await {
            Ok(p) => p,
            Err(e) => {
                warn!(%image_id, stage = e.stage(), error = %e, "prediction did not succeed");
                return Err(e);
            }
        };

        let output_url = finished
            .output_url()
            .ok_or_else(|| StagingError::MissingOutput {
                image_id: image_id.clone(),
                prediction_id: finished.id.clone(),
            })?
            .to_string();

        let bytes = guarded(cancel, image_id, self.api.download(&output_url))
            .await?
            .map_err(|source| StagingError::OutputDownload {
                image_id: image_id.clone(),
                source,
            })?;

        let key = self.output_key(image_id, &output_url);
        let location = guarded(cancel, image_id, self.store.put(&key, bytes, content_type_for(&key)))
            .await?
            .map_err(|source| StagingError::Upload {
                image_id: image_id.clone(),
                source,
            })?;

        info!(%image_id, %location, "staged image stored");
        Ok(location)
    }
}
