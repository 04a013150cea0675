use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use roomstage_core::ImageId;

use crate::error::StagingError;

/// Normalised input of one staging call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingRequest {
    pub image_id: ImageId,
    pub original_url: String,
    pub room_type: Option<String>,
    pub style: Option<String>,
    pub seed: Option<i64>,
}

/// Turns a room photo into a staged image.
///
/// Implementations must observe `cancel`: when it fires (delivery timeout,
/// shutdown) the call returns [`StagingError::Cancelled`] promptly instead of
/// outliving the job that started it.
#[async_trait]
pub trait Stager: Send + Sync + 'static {
    /// Stage the image and return the location of the stored result.
    async fn stage(&self, request: &StagingRequest, cancel: &CancellationToken) -> Result<String, StagingError>;
}
