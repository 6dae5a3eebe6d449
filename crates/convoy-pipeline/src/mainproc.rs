//! Main processing: the streaming tool-calling loop.
//!
//! Streams the selected model's reply token-by-token onto the chat
//! channel, executing skill calls (bounded fan-out of 5) between steps and
//! feeding their results back to the model. The run token is checked at
//! every chunk boundary; revocation and the soft time limit break the loop
//! at the next boundary, still publish the final marker with the matching
//! interruption flag, and keep any partial text for persistence.

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use convoy_bus::{chat_stream_channel, message_persisted_channel, BusEvent, ChunkEvent,
    MessagePersistedEvent};
use convoy_core::types::{AskRequest, PreprocessingResult, Role};
use convoy_model::{ChatRequest, ModelGateway, StreamEvent, ToolCall};
use convoy_skills::{ExecuteOptions, SkillOutcome, MAX_PARALLEL_REQUESTS};

use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::instructions::disclaimer_text;
use crate::secrets::{CipherService, SecretsGateway};
use crate::storage::{PersistedMessage, StorageGateway};
use crate::token::RunToken;

#[derive(Debug)]
pub struct MainOutcome {
    pub text: String,
    pub was_revoked: bool,
    pub was_soft_limited: bool,
    pub messages_version: Option<u64>,
}

pub async fn process_main(
    ctx: &PipelineContext,
    task_id: &str,
    request: &AskRequest,
    pre: &PreprocessingResult,
    token: &RunToken,
) -> Result<MainOutcome> {
    let chat_channel = chat_stream_channel(&request.chat_id);
    let candidates = model_candidates(pre);
    if candidates.is_empty() {
        return Err(PipelineError::MainProcessing(
            "no main model selected by preprocessing".to_string(),
        ));
    }

    let system = build_system_prompt(ctx, request, pre);
    let tools = ctx.registry.tool_definitions(
        &pre.relevant_app_skills,
        &ctx.config.pipeline.always_include_skills,
    );
    let mut raw_messages = history_as_raw_messages(request);

    let mut accumulator = String::new();
    let mut sequence: u64 = 0;
    let mut was_revoked = false;
    let mut was_soft_limited = false;
    let mut candidate_index = 0usize;

    'outer: for iteration in 0..ctx.config.pipeline.max_tool_iterations {
        if check_interruption(token, &mut was_revoked, &mut was_soft_limited) {
            break;
        }

        let request_for_step = ChatRequest {
            model: candidates[candidate_index].clone(),
            system: system.clone(),
            messages: Vec::new(),
            raw_messages: Some(raw_messages.clone()),
            max_tokens: 8192,
            temperature: pre.llm_response_temp,
            tools: tools.clone(),
            forced_tool: None,
        };

        debug!(task_id, iteration, model = %request_for_step.model, "tool loop iteration");

        let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);
        let gateway = Arc::clone(&ctx.model_gateway);
        let stream_handle =
            tokio::spawn(async move { gateway.send_stream(&request_for_step, tx).await });

        let mut step_text = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut stream_error: Option<String> = None;

        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::TextDelta { text } => {
                    if check_interruption(token, &mut was_revoked, &mut was_soft_limited) {
                        drop(rx);
                        stream_handle.abort();
                        break 'outer;
                    }
                    step_text.push_str(&text);
                    accumulator.push_str(&text);
                    sequence += 1;
                    publish_chunk(ctx, &chat_channel, task_id, request, &accumulator, sequence);
                }
                StreamEvent::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall { id, name, input });
                }
                StreamEvent::Done { stop_reason, .. } => {
                    debug!(task_id, ?stop_reason, "stream step done");
                }
                StreamEvent::Error { message } => {
                    stream_error = Some(message);
                }
            }
        }

        if let Ok(Err(e)) = stream_handle.await {
            stream_error.get_or_insert_with(|| e.to_string());
        }

        if let Some(message) = stream_error {
            // A candidate that failed before producing anything can be
            // swapped for the next one; mid-stream failures keep the
            // partial text and end the turn.
            if step_text.is_empty() && candidate_index + 1 < candidates.len() {
                warn!(task_id, error = %message, "model stream failed, trying next candidate");
                candidate_index += 1;
                continue;
            }
            if accumulator.is_empty() {
                return Err(PipelineError::MainProcessing(format!(
                    "model stream failed: {message}"
                )));
            }
            warn!(task_id, error = %message, "model stream failed mid-response, keeping partial text");
            break;
        }

        if tool_calls.is_empty() {
            info!(task_id, iteration, "tool loop complete, no more tool calls");
            break;
        }

        raw_messages.push(json!({
            "role": "assistant",
            "content": step_text,
            "tool_calls": tool_calls.iter().map(|c| json!({
                "id": c.id, "name": c.name, "input": c.input,
            })).collect::<Vec<_>>(),
        }));

        let results = execute_tool_calls(ctx, task_id, request, tool_calls).await;
        for (call_id, content, is_error) in results {
            raw_messages.push(json!({
                "role": "tool",
                "tool_call_id": call_id,
                "content": content,
                "is_error": is_error,
            }));
        }

        if iteration + 1 == ctx.config.pipeline.max_tool_iterations {
            warn!(task_id, "tool loop hit maximum iterations");
        }
    }

    // Advice disclaimers ride after the full reply, never inside the
    // prompt.
    if let Some(kind) = pre.requires_advice_disclaimer {
        if !accumulator.is_empty() && !was_revoked && !was_soft_limited {
            accumulator.push_str("\n\n");
            accumulator.push_str(disclaimer_text(kind, &pre.output_language));
            sequence += 1;
            publish_chunk(ctx, &chat_channel, task_id, request, &accumulator, sequence);
            let now = chrono::Utc::now().timestamp();
            if let Err(e) = ctx
                .disclaimers
                .record(&request.chat_id, kind.as_str(), now)
                .await
            {
                warn!(task_id, error = %e, "failed to record disclaimer state");
            }
        }
    }

    publish_final_marker(
        ctx,
        &chat_channel,
        task_id,
        request,
        sequence + 1,
        was_revoked,
        was_soft_limited,
        false,
    );

    // Partial text from an interrupted stream is still worth keeping.
    let messages_version = if !accumulator.is_empty() && !request.is_incognito {
        persist_response(ctx, task_id, request, &accumulator).await
    } else {
        None
    };

    Ok(MainOutcome {
        text: accumulator,
        was_revoked,
        was_soft_limited,
        messages_version,
    })
}

fn model_candidates(pre: &PreprocessingResult) -> Vec<String> {
    let mut candidates = Vec::new();
    for model in [
        pre.selected_main_llm_model_id.as_ref(),
        pre.selected_secondary_model_id.as_ref(),
        pre.selected_fallback_model_id.as_ref(),
    ]
    .into_iter()
    .flatten()
    {
        if !candidates.contains(model) {
            candidates.push(model.clone());
        }
    }
    candidates
}

fn check_interruption(token: &RunToken, revoked: &mut bool, soft_limited: &mut bool) -> bool {
    if token.is_revoked() {
        *revoked = true;
        return true;
    }
    if token.is_soft_limited() {
        *soft_limited = true;
        return true;
    }
    false
}

fn build_system_prompt(
    ctx: &PipelineContext,
    request: &AskRequest,
    pre: &PreprocessingResult,
) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(mate) = pre
        .selected_mate_id
        .as_ref()
        .and_then(|id| ctx.config.mates.iter().find(|m| &m.id == id))
    {
        if let Some(prompt) = &mate.default_system_prompt {
            parts.push(prompt.clone());
        }
    }

    if let Some(focus_id) = &request.active_focus_id {
        if let Some(focus) = ctx.registry.focus(focus_id) {
            if let Some(prompt) = &focus.prompt {
                parts.push(prompt.clone());
            }
        } else {
            warn!(focus_id, "active focus mode not found in registry");
        }
    }

    if !pre.load_app_settings_and_memories.is_empty() {
        parts.push(format!(
            "The client has loaded these user settings/memories for this \
             turn: {}.",
            pre.load_app_settings_and_memories.join(", ")
        ));
    }

    if !pre.relevant_embedded_previews.is_empty() {
        parts.push(format!(
            "When useful, emit embedded previews of these types: {}.",
            pre.relevant_embedded_previews.join(", ")
        ));
    }

    parts.push(format!(
        "Respond in the language '{}' unless the user explicitly asks otherwise.",
        pre.output_language
    ));

    parts.join("\n\n")
}

fn history_as_raw_messages(request: &AskRequest) -> Vec<Value> {
    request
        .message_history
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::System => "system",
                Role::Tool => "tool",
            };
            match &m.content {
                convoy_core::types::MessageContent::Text(t) => {
                    json!({"role": role, "content": t})
                }
                convoy_core::types::MessageContent::Blocks(blocks) => {
                    json!({"role": role, "content": blocks})
                }
            }
        })
        .collect()
}

/// Execute one step's tool calls with bounded parallelism. Results come
/// back in call order; each carries (tool_call_id, content, is_error).
async fn execute_tool_calls(
    ctx: &PipelineContext,
    task_id: &str,
    request: &AskRequest,
    calls: Vec<ToolCall>,
) -> Vec<(String, String, bool)> {
    let mut results: Vec<(usize, String, String, bool)> =
        futures_util::stream::iter(calls.into_iter().enumerate().map(|(index, call)| {
            async move {
                let (content, is_error) = run_tool_call(ctx, task_id, request, &call).await;
                (index, call.id, content, is_error)
            }
        }))
        .buffer_unordered(MAX_PARALLEL_REQUESTS)
        .collect()
        .await;
    results.sort_by_key(|(index, _, _, _)| *index);
    results
        .into_iter()
        .map(|(_, id, content, is_error)| (id, content, is_error))
        .collect()
}

async fn run_tool_call(
    ctx: &PipelineContext,
    task_id: &str,
    request: &AskRequest,
    call: &ToolCall,
) -> (String, bool) {
    // The model sometimes mangles tool names the same way the
    // preprocessor does; the shared resolver fixes what it can.
    let Some(spec) = ctx.registry.resolve_spec(&call.name) else {
        warn!(task_id, tool = %call.name, "model called an unknown tool");
        return (
            json!({"error": format!("unknown tool: {}", call.name)}).to_string(),
            true,
        );
    };
    let identifier = spec.identifier.as_str();

    let skill_task_id = Uuid::new_v4().to_string();
    let opts = ExecuteOptions {
        chat_id: Some(request.chat_id.clone()),
        message_id: Some(request.message_id.clone()),
        user_id: Some(request.user_id.clone()),
        skill_task_id: Some(skill_task_id.clone()),
        defer_on_rate_limit: true,
        ..Default::default()
    };

    let mut outcomes = ctx
        .executor
        .execute_batched(&spec.app_id, &spec.skill_id, call.input.clone(), &opts)
        .await;

    match outcomes.remove(0) {
        SkillOutcome::Ok(value) => (value.to_string(), false),
        SkillOutcome::Cancelled => {
            // User dropped this one tool call; the turn continues with
            // whatever the other tools returned.
            info!(task_id, skill = identifier, %skill_task_id, "skill cancelled, continuing with empty result");
            (String::new(), false)
        }
        SkillOutcome::Blocked => {
            warn!(task_id, skill = identifier, "skill result blocked by content sanitizer, dropped");
            (String::new(), false)
        }
        SkillOutcome::Scheduled { task_id: deferred } => {
            info!(task_id, skill = identifier, deferred_task = %deferred, "skill deferred by rate limit");
            (
                json!({"status": "scheduled", "task_id": deferred}).to_string(),
                false,
            )
        }
        SkillOutcome::Failed(e) => {
            warn!(task_id, skill = identifier, error = %e, "skill failed");
            (json!({"error": e.to_string()}).to_string(), true)
        }
    }
}

fn publish_chunk(
    ctx: &PipelineContext,
    channel: &str,
    task_id: &str,
    request: &AskRequest,
    full_content: &str,
    sequence: u64,
) {
    ctx.bus.publish(
        channel,
        BusEvent::AiMessageChunk(ChunkEvent {
            task_id: task_id.to_string(),
            chat_id: request.chat_id.clone(),
            message_id: task_id.to_string(),
            user_message_id: request.message_id.clone(),
            full_content_so_far: full_content.to_string(),
            sequence,
            is_final_chunk: false,
            interrupted_by_soft_limit: false,
            interrupted_by_revocation: false,
            error: false,
        }),
    );
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn publish_final_marker(
    ctx: &PipelineContext,
    channel: &str,
    task_id: &str,
    request: &AskRequest,
    sequence: u64,
    revoked: bool,
    soft_limited: bool,
    error: bool,
) {
    ctx.bus.publish(
        channel,
        BusEvent::AiMessageChunk(ChunkEvent {
            task_id: task_id.to_string(),
            chat_id: request.chat_id.clone(),
            message_id: task_id.to_string(),
            user_message_id: request.message_id.clone(),
            full_content_so_far: String::new(),
            sequence,
            is_final_chunk: true,
            interrupted_by_soft_limit: soft_limited,
            interrupted_by_revocation: revoked,
            error,
        }),
    );
}

async fn persist_response(
    ctx: &PipelineContext,
    task_id: &str,
    request: &AskRequest,
    text: &str,
) -> Option<u64> {
    let key = match ctx.secrets.chat_key(&request.chat_id).await {
        Ok(key) => key,
        Err(e) => {
            error!(task_id, error = %e, "chat key unavailable, response not persisted");
            return None;
        }
    };
    let encrypted = match CipherService::encrypt(&key, text.as_bytes()) {
        Ok(enc) => enc,
        Err(e) => {
            error!(task_id, error = %e, "encryption failed, response not persisted");
            return None;
        }
    };

    let message = PersistedMessage {
        client_message_id: task_id.to_string(),
        chat_id: request.chat_id.clone(),
        hashed_user_id: request.user_id_hash.clone(),
        sender_name: "assistant".to_string(),
        encrypted_content: encrypted,
        created_at: chrono::Utc::now().timestamp(),
    };

    match ctx.storage.persist_assistant_message(&message).await {
        Ok(version) => {
            if !request.is_external {
                ctx.bus.publish(
                    &message_persisted_channel(&request.user_id_hash),
                    BusEvent::ChatMessageAdded(MessagePersistedEvent {
                        task_id: task_id.to_string(),
                        chat_id: request.chat_id.clone(),
                        message_id: task_id.to_string(),
                        messages_version: version,
                    }),
                );
            }
            Some(version)
        }
        Err(e) => {
            error!(task_id, error = %e, "storage gateway rejected assistant message");
            None
        }
    }
}
