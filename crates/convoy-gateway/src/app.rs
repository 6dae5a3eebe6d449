use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use convoy_pipeline::{PipelineContext, RequestPipeline};

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub ctx: Arc<PipelineContext>,
    pub pipeline: Arc<RequestPipeline>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(crate::http::health::health))
        .route("/v1/ask", post(crate::http::ask::ask))
        .route(
            "/v1/chat/completions",
            post(crate::http::openai_compat::chat_completions),
        )
        .route("/v1/tasks/{task_id}", get(crate::http::tasks::task_status))
        .route(
            "/v1/tasks/{task_id}/revoke",
            post(crate::http::tasks::revoke_task),
        )
        .route(
            "/v1/skills/{skill_task_id}/cancel",
            post(crate::http::tasks::cancel_skill),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
