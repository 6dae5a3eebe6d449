//! Postprocessing: suggestions and memory extraction after the reply.
//!
//! Phase 1 is one LLM tool call producing follow-up and new-chat
//! suggestions, a refined summary, a harmfulness verdict, app
//! recommendations, and the settings/memory categories this exchange
//! touched. Phase 2 runs only when phase 1 picked at least one category,
//! with the call restricted to those categories' schemas.

use serde_json::{json, Value};
use tracing::{info, warn};

use convoy_core::types::{AskRequest, PostProcessingResult, PreprocessingResult, SuggestedMemory};
use convoy_model::{send_with_fallbacks, ChatMessage, ChatRequest, ModelGateway, ToolDefinition};

use crate::context::PipelineContext;
use crate::instructions::{MEMORY_TOOL_NAME, POSTPROCESS_TOOL_NAME};

pub async fn handle_postprocessing(
    ctx: &PipelineContext,
    task_id: &str,
    request: &AskRequest,
    pre: &PreprocessingResult,
    assistant_response: &str,
) -> Option<PostProcessingResult> {
    let last_user_message = request.last_user_message_text().unwrap_or_default();
    let chat_summary = pre.chat_summary.as_deref().unwrap_or_default();

    // New-chat suggestions use the user's UI language so multilingual
    // users don't get a mixed-language welcome screen; follow-ups stay in
    // the chat's language.
    let chat_language = pre.output_language.clone();
    let system_language = request.user_system_language();

    let dynamic_context = json!({
        "LAST_USER_MESSAGE": last_user_message,
        "ASSISTANT_RESPONSE": assistant_response,
        "CHAT_SUMMARY": chat_summary,
        "CHAT_TAGS": pre.chat_tags,
        "AVAILABLE_APP_IDS": ctx.registry.app_ids(),
        "AVAILABLE_SETTINGS_MEMORY_CATEGORIES": ctx.registry.memory_category_ids(),
        "CHAT_OUTPUT_LANGUAGE": chat_language,
        "USER_SYSTEM_LANGUAGE": system_language,
    });
    let system = format!(
        "{}\n\nContext:\n{}",
        ctx.instructions.postprocess_system_prompt, dynamic_context
    );

    let model = ctx.config.pipeline.default_llms.postprocessing_model.clone();
    let fallbacks = ctx.config.fallback_models_for(&model);
    let llm_request = ChatRequest {
        model,
        system,
        messages: trimmed_history(request),
        raw_messages: None,
        max_tokens: 2048,
        temperature: Some(0.5),
        tools: vec![tool_from(&ctx.instructions.postprocess_tool, POSTPROCESS_TOOL_NAME)],
        forced_tool: Some(POSTPROCESS_TOOL_NAME.to_string()),
    };

    let args = match send_with_fallbacks(ctx.model_gateway.as_ref(), &llm_request, &fallbacks).await
    {
        Ok((response, _)) => response.tool_arguments().cloned(),
        Err(e) => {
            warn!(task_id, error = %e, "postprocessing LLM call failed");
            None
        }
    }?;

    let mut result = PostProcessingResult {
        follow_up_request_suggestions: string_list(&args, "follow_up_request_suggestions"),
        new_chat_request_suggestions: string_list(&args, "new_chat_request_suggestions"),
        chat_summary: args
            .get("chat_summary")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(String::from),
        harmful_response: args
            .get("harmful_response")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        top_recommended_apps_for_user: string_list(&args, "top_recommended_apps_for_user"),
        relevant_settings_memory_categories: validated_categories(ctx, &args),
        suggested_settings_memories: Vec::new(),
    };

    if !result.relevant_settings_memory_categories.is_empty() {
        result.suggested_settings_memories = handle_memory_generation(
            ctx,
            task_id,
            &last_user_message,
            assistant_response,
            &result.relevant_settings_memory_categories,
        )
        .await;
    }

    info!(
        task_id,
        follow_ups = result.follow_up_request_suggestions.len(),
        new_chats = result.new_chat_request_suggestions.len(),
        memories = result.suggested_settings_memories.len(),
        "postprocessing finished"
    );
    Some(result)
}

/// Phase 2: structured memory entries restricted to the selected
/// categories' schemas.
async fn handle_memory_generation(
    ctx: &PipelineContext,
    task_id: &str,
    last_user_message: &str,
    assistant_response: &str,
    categories: &[String],
) -> Vec<SuggestedMemory> {
    let schemas = ctx.registry.category_schemas(categories);
    if schemas.is_empty() {
        warn!(task_id, ?categories, "no schemas for selected memory categories, skipping phase 2");
        return Vec::new();
    }

    let system = format!(
        "{}\n\nCategory schemas:\n{}\n\nExchange:\nUser: {}\nAssistant: {}",
        ctx.instructions.memory_system_prompt,
        json!(schemas),
        last_user_message,
        assistant_response,
    );

    let model = ctx.config.pipeline.default_llms.postprocessing_model.clone();
    let llm_request = ChatRequest {
        model,
        system,
        messages: Vec::new(),
        raw_messages: None,
        max_tokens: 2048,
        temperature: Some(0.2),
        tools: vec![tool_from(&ctx.instructions.memory_tool, MEMORY_TOOL_NAME)],
        forced_tool: Some(MEMORY_TOOL_NAME.to_string()),
    };

    let args = match ctx.model_gateway.send(&llm_request).await {
        Ok(response) => response.tool_arguments().cloned(),
        Err(e) => {
            warn!(task_id, error = %e, "memory generation LLM call failed");
            None
        }
    };
    let Some(args) = args else {
        return Vec::new();
    };

    let Some(Value::Array(entries)) = args.get("entries") else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let category = entry.get("category")?.as_str()?.to_string();
            if !categories.contains(&category) {
                warn!(task_id, %category, "memory entry for unselected category, dropped");
                return None;
            }
            Some(SuggestedMemory {
                category,
                item_key: entry.get("item_key")?.as_str()?.to_string(),
                value: entry.get("value")?.clone(),
            })
        })
        .collect()
}

fn validated_categories(ctx: &PipelineContext, args: &Value) -> Vec<String> {
    let known = ctx.registry.memory_category_ids();
    string_list(args, "relevant_settings_memory_categories")
        .into_iter()
        .filter(|c| known.contains(&c.as_str()))
        .collect()
}

fn string_list(args: &Value, key: &str) -> Vec<String> {
    match args.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

/// The last few turns give the suggestion model enough context without
/// re-sending the whole history.
fn trimmed_history(request: &AskRequest) -> Vec<ChatMessage> {
    let tail = convoy_model::context::truncate_history_to_budget(&request.message_history, 8_000);
    tail.iter()
        .map(|m| ChatMessage {
            role: match m.role {
                convoy_core::types::Role::User => "user",
                convoy_core::types::Role::Assistant => "assistant",
                convoy_core::types::Role::System => "system",
                convoy_core::types::Role::Tool => "tool",
            }
            .to_string(),
            content: m.content.to_prompt_text(),
        })
        .collect()
}

fn tool_from(tool: &Value, default_name: &str) -> ToolDefinition {
    ToolDefinition {
        name: tool
            .pointer("/function/name")
            .and_then(Value::as_str)
            .unwrap_or(default_name)
            .to_string(),
        description: tool
            .pointer("/function/description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        input_schema: tool
            .pointer("/function/parameters")
            .cloned()
            .unwrap_or_else(|| json!({"type": "object"})),
    }
}
