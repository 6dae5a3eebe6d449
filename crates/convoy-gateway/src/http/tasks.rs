//! Task and skill control: status polling, turn revocation, and
//! per-invocation skill cancellation.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};
use tracing::info;

use crate::app::AppState;

pub async fn task_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Json<Value> {
    let report = state.ctx.dispatcher.status(&task_id);
    Json(json!({
        "task_id": task_id,
        "status": report.status,
        "result": report.result,
        "error": report.error,
    }))
}

/// Revoke a running turn. The pipeline finishes at the next chunk
/// boundary, keeping any partial text.
pub async fn revoke_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Json<Value> {
    let revoked = state.ctx.revoke_run(&task_id);
    info!(%task_id, revoked, "revocation requested");
    Json(json!({"task_id": task_id, "revoked": revoked}))
}

/// Cancel a single skill invocation. The outer turn continues with an
/// empty result for that tool call.
pub async fn cancel_skill(
    State(state): State<Arc<AppState>>,
    Path(skill_task_id): Path<String>,
) -> Json<Value> {
    let cancelled = state.ctx.flags.cancel(&skill_task_id).await.is_ok();
    Json(json!({"skill_task_id": skill_task_id, "cancelled": cancelled}))
}
