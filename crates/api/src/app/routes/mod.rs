use axum::{
    routing::{get, post},
    Router,
};

pub mod event_stream;
pub mod images;
pub mod system;

/// Router for the staging endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/stage", post(images::stage))
        .route("/images/:id", get(images::get_image))
        .route("/images/:id/events", get(event_stream::image_events))
}
