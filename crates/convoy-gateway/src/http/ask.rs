//! Native ask entrypoint.
//!
//! Accepts an `AskRequest` and dispatches it onto the ai queue. When the
//! chat already has an active pipeline, the message is appended to the
//! per-chat queue instead; the running pipeline collapses queued messages
//! into one follow-on turn when its stream ends.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::{info, warn};

use convoy_core::types::AskRequest;

use crate::app::AppState;

pub async fn ask(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AskRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    if request.chat_id.is_empty() || request.message_history.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "chat_id and message_history are required"})),
        ));
    }

    // Queue gate: exactly one pipeline per chat; later arrivals queue.
    match state.ctx.markers.get(&request.chat_id).await {
        Ok(Some(active_task_id)) => {
            if let Err(e) = state.ctx.queues.push(&request.chat_id, &request).await {
                warn!(chat_id = %request.chat_id, error = %e, "failed to queue message");
                return Err((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "failed to queue message"})),
                ));
            }
            info!(chat_id = %request.chat_id, %active_task_id, "message queued behind active pipeline");
            return Ok((
                StatusCode::ACCEPTED,
                Json(json!({"queued": true, "active_task_id": active_task_id})),
            ));
        }
        Ok(None) => {}
        Err(e) => {
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": format!("marker lookup failed: {e}")})),
            ))
        }
    }

    let chat_id = request.chat_id.clone();
    let task_id = state.ctx.dispatcher.dispatch(
        "ai",
        "ask",
        json!({"request_data": request}),
        None,
    );
    // Claim the chat immediately so a racing second message queues rather
    // than double-dispatching; the pipeline re-asserts the same marker.
    if let Err(e) = state.ctx.markers.set(&chat_id, &task_id).await {
        warn!(%chat_id, error = %e, "failed to pre-claim chat marker");
    }

    info!(%chat_id, %task_id, "ask task dispatched");
    Ok((StatusCode::OK, Json(json!({"task_id": task_id}))))
}
