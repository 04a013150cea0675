//! Staging submission and image status lookups.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;

use roomstage_core::ImageId;
use roomstage_infra::jobs::SubmitError;

use crate::app::dto::{StageAccepted, StageRequest};
use crate::app::errors::{json_error, repository_error_to_response, submit_error_to_response};
use crate::app::services::AppServices;

/// POST /stage
///
/// Records the image as `queued` and submits a staging task for it.
/// Responds 202 with the task id; invalid tasks and unserved queues are
/// rejected with 400 before anything is stored or enqueued.
pub async fn stage(
    Extension(services): Extension<Arc<AppServices>>,
    Json(req): Json<StageRequest>,
) -> axum::response::Response {
    let task = req.task();
    if let Err(e) = task.validate() {
        return submit_error_to_response(SubmitError::Validation(e));
    }
    let image_id = match ImageId::new(task.image_id.trim()) {
        Ok(id) => id,
        Err(e) => return submit_error_to_response(SubmitError::Validation(e)),
    };
    let options = req.execution_options();
    if let Err(e) = services.enqueuer.delivery_params(&options) {
        return submit_error_to_response(e);
    }

    let record = match services.images.create_queued(&image_id).await {
        Ok(record) => record,
        Err(e) => return repository_error_to_response(e),
    };
    if record.status.is_terminal() {
        return json_error(
            StatusCode::CONFLICT,
            "already_finished",
            format!("image {image_id} is already {}", record.status),
        );
    }

    match services.enqueuer.submit(&task, &options).await {
        Ok(info) => {
            info!(%image_id, task_id = %info.id, "staging requested");
            (
                StatusCode::ACCEPTED,
                Json(StageAccepted {
                    task_id: info.id,
                    queue: info.queue,
                    image_id: image_id.into_inner(),
                    status: record.status,
                }),
            )
                .into_response()
        }
        Err(e) => submit_error_to_response(e),
    }
}

/// GET /images/:id
pub async fn get_image(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let image_id = match ImageId::new(id) {
        Ok(id) => id,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()),
    };

    match services.images.get(&image_id).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => repository_error_to_response(e),
    }
}
