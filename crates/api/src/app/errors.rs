use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use roomstage_infra::images::RepositoryError;
use roomstage_infra::jobs::SubmitError;
use roomstage_infra::queue::QueueError;

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::Validation(e) => json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
        e @ SubmitError::UnknownQueue(_) => json_error(StatusCode::BAD_REQUEST, "unknown_queue", e.to_string()),
        SubmitError::Serialization(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialization_error", msg),
        SubmitError::Transport(QueueError::Closed) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_closed", "queue is shutting down")
        }
        SubmitError::Transport(e) => json_error(StatusCode::BAD_GATEWAY, "queue_error", e.to_string()),
    }
}

pub fn repository_error_to_response(err: RepositoryError) -> axum::response::Response {
    match err {
        RepositoryError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("image {id} not found")),
        e @ RepositoryError::InvalidTransition { .. } => json_error(StatusCode::CONFLICT, "conflict", e.to_string()),
        RepositoryError::Storage(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
