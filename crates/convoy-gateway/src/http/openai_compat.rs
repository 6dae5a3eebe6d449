//! OpenAI-compatible /v1/chat/completions endpoint.
//!
//! Messages map directly onto the native request shape; advisory fields
//! land in `user_preferences`. Streaming responses are Server-Sent Events
//! (`data: <json>\n\n`, terminated by `data: [DONE]\n\n`) bridged from the
//! chat stream channel; resolved embeds are sent after the text, once.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use convoy_bus::{chat_stream_channel, BusEvent};
use convoy_core::types::{
    AskRequest, EmbedStatus, HistoryMessage, MessageContent, Role,
};
use convoy_pipeline::cleanup::sha256_hex;

use crate::app::AppState;

#[derive(Debug, Deserialize)]
pub struct OpenAiRequest {
    #[serde(default)]
    pub model: String,
    pub messages: Vec<OpenAiInboundMessage>,
    #[serde(default)]
    pub stream: bool,
    /// Stable conversation handle; one chat per user value.
    pub user: Option<String>,
    /// Advisory fields (temperature, top_p, ...) pass through as
    /// preferences.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiInboundMessage {
    pub role: String,
    pub content: Value,
}

#[derive(Debug, Serialize)]
pub struct OpenAiResponse {
    pub id: String,
    pub object: String,
    pub model: String,
    pub choices: Vec<Choice>,
}

#[derive(Debug, Serialize)]
pub struct Choice {
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct OpenAiMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeds: Option<Vec<Value>>,
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OpenAiRequest>,
) -> Result<axum::response::Response, (StatusCode, Json<Value>)> {
    if req.messages.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": {"message": "messages must not be empty"}})),
        ));
    }

    let request = translate_request(&req);
    info!(chat_id = %request.chat_id, stream = req.stream, "OpenAI-compatible request");

    // Queue gate applies here too; a queued message cannot be streamed, so
    // the caller gets an acknowledgment instead.
    if let Ok(Some(active_task_id)) = state.ctx.markers.get(&request.chat_id).await {
        if let Err(e) = state.ctx.queues.push(&request.chat_id, &request).await {
            warn!(error = %e, "failed to queue OpenAI-compatible request");
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": {"message": "failed to queue message"}})),
            ));
        }
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({"queued": true, "active_task_id": active_task_id})),
        )
            .into_response());
    }

    if req.stream {
        Ok(handle_streaming(state, request).await.into_response())
    } else {
        Ok(handle_non_streaming(state, request).await.into_response())
    }
}

fn translate_request(req: &OpenAiRequest) -> AskRequest {
    let user = req.user.clone().unwrap_or_else(|| "api".to_string());
    let now = chrono::Utc::now().timestamp();
    let count = req.messages.len() as i64;

    let message_history: Vec<HistoryMessage> = req
        .messages
        .iter()
        .enumerate()
        .map(|(i, m)| HistoryMessage {
            role: match m.role.as_str() {
                "assistant" => Role::Assistant,
                "system" => Role::System,
                "tool" => Role::Tool,
                _ => Role::User,
            },
            content: match &m.content {
                Value::String(s) => MessageContent::Text(s.clone()),
                Value::Array(blocks) => MessageContent::Blocks(blocks.clone()),
                other => MessageContent::Text(other.to_string()),
            },
            created_at: now - (count - i as i64),
            sender_name: None,
            category: None,
        })
        .collect();

    let mut user_preferences: BTreeMap<String, Value> = req.extra.clone();
    if !req.model.is_empty() {
        user_preferences.insert("requested_model".to_string(), json!(req.model));
    }

    AskRequest {
        chat_id: format!("api-{user}"),
        message_id: Uuid::new_v4().to_string(),
        user_id: user.clone(),
        user_id_hash: sha256_hex(&user),
        message_history,
        chat_has_title: true,
        is_incognito: false,
        // REST API callers get no web-app side effects (typing events,
        // postprocessing).
        is_external: true,
        mate_id: None,
        active_focus_id: None,
        user_preferences,
        app_settings_memories_metadata: None,
    }
}

async fn handle_non_streaming(state: Arc<AppState>, request: AskRequest) -> impl IntoResponse {
    let task_id = Uuid::new_v4().to_string();
    let summary = state.pipeline.run(&task_id, request).await;

    let finish = finish_reason(&summary);
    let reply = OpenAiResponse {
        id: format!("chatcmpl-{task_id}"),
        object: "chat.completion".to_string(),
        model: summary
            .preprocessing
            .as_ref()
            .and_then(|p| p.selected_main_llm_model_id.clone())
            .unwrap_or_default(),
        choices: vec![Choice {
            index: 0,
            message: Some(OpenAiMessage {
                role: Some("assistant".to_string()),
                content: Some(summary.response_text),
                embeds: None,
            }),
            delta: None,
            finish_reason: Some(finish),
        }],
    };
    (StatusCode::OK, Json(reply))
}

async fn handle_streaming(
    state: Arc<AppState>,
    request: AskRequest,
) -> Sse<impl futures_util::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let task_id = Uuid::new_v4().to_string();
    let completion_id = format!("chatcmpl-{task_id}");
    let chat_channel = chat_stream_channel(&request.chat_id);

    // Subscribe before dispatch so no chunk is missed.
    let mut rx = state.ctx.bus.subscribe(&chat_channel);
    let dispatched_task_id = state.ctx.dispatcher.dispatch(
        "ai",
        "ask",
        json!({"request_data": request}),
        None,
    );

    let stream = async_stream::stream! {
        let mut sent_len = 0usize;
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            };
            let BusEvent::AiMessageChunk(chunk) = event else {
                continue;
            };
            if chunk.task_id != dispatched_task_id {
                continue;
            }

            if chunk.is_final_chunk {
                // Resolved embeds ride after the text, once.
                let embeds = resolved_embeds(&state, &dispatched_task_id).await;
                if !embeds.is_empty() {
                    let payload = sse_chunk(&completion_id, OpenAiMessage {
                        role: None,
                        content: None,
                        embeds: Some(embeds),
                    }, None);
                    yield Ok(Event::default().data(payload));
                }

                let reason = if chunk.interrupted_by_revocation || chunk.interrupted_by_soft_limit {
                    "length"
                } else if chunk.error {
                    "error"
                } else {
                    "stop"
                };
                let payload = sse_chunk(&completion_id, OpenAiMessage::default(), Some(reason));
                yield Ok(Event::default().data(payload));
                yield Ok(Event::default().data("[DONE]"));
                break;
            }

            // full_content_so_far is a running concatenation; the delta is
            // whatever we have not sent yet.
            let full = chunk.full_content_so_far;
            if full.len() > sent_len {
                let delta = full[sent_len..].to_string();
                sent_len = full.len();
                let payload = sse_chunk(&completion_id, OpenAiMessage {
                    role: Some("assistant".to_string()),
                    content: Some(delta),
                    embeds: None,
                }, None);
                yield Ok(Event::default().data(payload));
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn sse_chunk(id: &str, delta: OpenAiMessage, finish_reason: Option<&str>) -> String {
    let chunk = OpenAiResponse {
        id: id.to_string(),
        object: "chat.completion.chunk".to_string(),
        model: String::new(),
        choices: vec![Choice {
            index: 0,
            message: None,
            delta: Some(delta),
            finish_reason: finish_reason.map(String::from),
        }],
    };
    serde_json::to_string(&chunk).unwrap_or_default()
}

async fn resolved_embeds(state: &AppState, task_id: &str) -> Vec<Value> {
    let hashed_task_id = sha256_hex(task_id);
    match state.ctx.embeds.scan().await {
        Ok(records) => records
            .into_iter()
            .filter(|r| r.hashed_task_id == hashed_task_id && r.status == EmbedStatus::Ok)
            .map(|r| json!({"embed_id": r.embed_id, "app_id": r.app_id, "skill_id": r.skill_id}))
            .collect(),
        Err(e) => {
            warn!(error = %e, "embed scan failed while closing SSE stream");
            Vec::new()
        }
    }
}

fn finish_reason(summary: &convoy_pipeline::PipelineRunSummary) -> String {
    if summary.interrupted_by_revocation || summary.interrupted_by_soft_time_limit {
        "length".to_string()
    } else {
        "stop".to_string()
    }
}
