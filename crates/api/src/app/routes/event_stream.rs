//! Per-image job update stream.
//!
//! Provides a real-time SSE stream of `JobUpdateEvent`s for one image so a
//! client can follow staging without polling.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{
        IntoResponse,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use roomstage_core::ImageId;
use roomstage_events::JobUpdateStatus;

use crate::app::errors::{json_error, repository_error_to_response};
use crate::app::services::AppServices;

type SseSender = UnboundedSender<Result<SseEvent, std::convert::Infallible>>;

/// GET /images/:id/events
///
/// Streams updates for one image via Server-Sent Events. The first event is
/// a `snapshot` of the current record; each later `update` event carries
/// `{image_id, status, error?}`. The stream ends after a terminal update.
/// Unknown images get a 404, as with `GET /images/:id`.
pub async fn image_events(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let image_id = match ImageId::new(id) {
        Ok(id) => id,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()),
    };

    // Subscribe before reading the record so no update falls in between.
    let subscription = services.updates.subscribe(&image_id);
    let snapshot = match services.images.get(&image_id).await {
        Ok(record) => record,
        Err(e) => return repository_error_to_response(e),
    };

    let (tx, rx) = unbounded_channel::<Result<SseEvent, std::convert::Infallible>>();
    send_json(&tx, "snapshot", &snapshot);

    if !snapshot.status.is_terminal() {
        // Spawn a blocking task that drains the subscription into the channel.
        tokio::task::spawn_blocking(move || {
            let mut last_heartbeat = std::time::Instant::now();

            loop {
                match subscription.recv_timeout(Duration::from_millis(1000)) {
                    Ok(event) => {
                        let terminal = matches!(event.status, JobUpdateStatus::Ready | JobUpdateStatus::Error);
                        if !send_json(&tx, "update", &event) || terminal {
                            break;
                        }
                        last_heartbeat = std::time::Instant::now();
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                        if tx.is_closed() {
                            break;
                        }
                        if last_heartbeat.elapsed() > Duration::from_secs(15) {
                            let heartbeat = SseEvent::default().event("heartbeat").data("{}");
                            if tx.send(Ok(heartbeat)).is_err() {
                                break;
                            }
                            last_heartbeat = std::time::Instant::now();
                        }
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!(%image_id, "image event stream closed");
        });
    }

    let stream = UnboundedReceiverStream::new(rx);
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

/// Send `value` as a JSON SSE event. Returns false once the client is gone.
fn send_json<T: serde::Serialize>(tx: &SseSender, kind: &'static str, value: &T) -> bool {
    match serde_json::to_string(value) {
        Ok(json) => tx.send(Ok(SseEvent::default().event(kind).data(json))).is_ok(),
        Err(_) => true,
    }
}
