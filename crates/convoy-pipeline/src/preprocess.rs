//! Preprocessing: the gatekeeper stage.
//!
//! Runs once before any streaming. Checks credits, sanitizes user input,
//! classifies the request with one LLM tool call, validates and normalizes
//! every field the model returned, selects the mate and the main model,
//! and decides whether an advice disclaimer must follow the reply.
//!
//! The model's output is never trusted: every enum-typed field is remapped
//! to a safe default when invalid, list fields are filtered against the
//! known universe, and a made-up category earns exactly one retry with an
//! emphatic schema before falling back to `general_knowledge`.

use std::collections::BTreeSet;

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use convoy_core::sanitize::sanitize_user_text_traced;
use convoy_core::types::{
    normalize_output_language, AskRequest, Complexity, DisclaimerKind, MessageContent,
    PreprocessingResult, RejectionReason, Role, TaskArea, UserOverrides,
};
use convoy_kv::DisclaimerRecord;
use convoy_model::{
    send_with_fallbacks, ChatMessage, ChatRequest, ModelGateway, ToolDefinition,
};
use convoy_skills::SkillRegistry;

use crate::context::PipelineContext;
use crate::credit::{check_credits, CreditGate};
use crate::instructions::PREPROCESS_TOOL_NAME;
use crate::selector::ModelSelector;

/// Same-type disclaimers are re-shown after this long.
const DISCLAIMER_COOLDOWN_SECS: i64 = 30 * 60;

pub async fn handle_preprocessing(
    ctx: &PipelineContext,
    task_id: &str,
    request: &mut AskRequest,
    overrides: &mut UserOverrides,
) -> PreprocessingResult {
    info!(task_id, chat_id = %request.chat_id, "preprocessing started");

    // Credit gate first: nothing else runs for an unfunded request.
    if let CreditGate::Rejected(result) = check_credits(ctx, task_id, &request.user_id).await {
        return *result;
    }

    // Character-level sanitization of every user message, BEFORE any LLM
    // sees the text.
    sanitize_user_messages(task_id, request);

    let truncated_history = convoy_model::context::truncate_history_to_budget(
        &request.message_history,
        ctx.config.pipeline.history_token_budget,
    );

    // One-shot metadata (title, icons, category) is only generated on the
    // first turn of a chat.
    let mut tool_def = ctx.instructions.preprocess_tool.clone();
    if request.chat_has_title {
        prune_one_shot_fields(&mut tool_def);
    }

    let mates = &ctx.config.mates;
    if mates.is_empty() {
        error!(task_id, "no mates configured, cannot derive categories");
        return PreprocessingResult::rejected(
            RejectionReason::InternalErrorMissingMatesConfig,
            "Mate configuration is missing or empty, cannot determine categories.",
        );
    }

    let mut categories: BTreeSet<String> = mates.iter().map(|m| m.category.clone()).collect();
    categories.insert("general_knowledge".to_string());
    let categories: Vec<String> = categories.into_iter().collect();

    let available_skills = ctx.registry.annotated_skills();
    let available_focus_ids: Vec<String> = ctx
        .registry
        .focus_identifiers()
        .into_iter()
        .map(String::from)
        .collect();
    let available_settings_keys =
        parse_client_settings_metadata(request.app_settings_memories_metadata.as_deref());

    let system_prompt = build_system_prompt(
        &ctx.instructions.preprocess_system_prompt,
        &categories,
        &available_skills,
        &available_focus_ids,
        &available_settings_keys,
    );

    let messages = history_as_chat_messages(&truncated_history);
    let preprocessing_model = ctx.config.pipeline.default_llms.preprocessing_model.clone();
    let fallbacks = ctx.config.fallback_models_for(&preprocessing_model);

    let Some(mut args) = call_preprocessing_llm(
        ctx.model_gateway.as_ref(),
        &preprocessing_model,
        &fallbacks,
        &system_prompt,
        &messages,
        &tool_def,
    )
    .await
    else {
        return PreprocessingResult::rejected(
            RejectionReason::InternalErrorLlmPreprocessingFailed,
            "Preprocessing LLM failed to analyze the request or returned no arguments.",
        );
    };

    // Score gates: >= threshold rejects, harm checked before misuse.
    let harmful = coerce_score(args.get("harmful_or_illegal"));
    let misuse = coerce_score(args.get("misuse_risk"));
    let thresholds = &ctx.config.pipeline.thresholds;

    if harmful >= thresholds.harmful_content_score {
        warn!(task_id, score = harmful, "request flagged for harmful content");
        return rejection_with_scores(
            RejectionReason::HarmfulOrIllegalDetected,
            format!("Request flagged as potentially harmful or illegal (score: {harmful})."),
            harmful,
            misuse,
            &args,
        );
    }
    if misuse >= thresholds.misuse_risk_score {
        warn!(task_id, score = misuse, "request flagged for misuse risk");
        return rejection_with_scores(
            RejectionReason::MisuseDetected,
            format!("Request flagged for high misuse risk (score: {misuse})."),
            harmful,
            misuse,
            &args,
        );
    }

    let complexity = Complexity::parse_lenient(args.get("complexity").and_then(Value::as_str));
    let task_area = TaskArea::parse_lenient(args.get("task_area").and_then(Value::as_str));
    let user_unhappy = args
        .get("user_unhappy")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    // Missing or malformed sensitivity flag defaults to true: excluding
    // CN-origin models is the safe direction.
    let china_related = match args.get("china_model_sensitive") {
        Some(Value::Bool(b)) => *b,
        other => {
            warn!(task_id, value = ?other, "china_model_sensitive missing or not a bool, defaulting to true");
            true
        }
    };

    // Category must come from the configured set; one retry with an
    // emphatic instruction before giving up.
    let llm_category = args
        .get("category")
        .and_then(Value::as_str)
        .map(String::from);
    let mut validated_category = match llm_category {
        Some(category) if categories.contains(&category) => category,
        Some(category) => {
            warn!(task_id, %category, "invalid category from LLM, retrying once");
            retry_category(
                ctx,
                task_id,
                &preprocessing_model,
                &fallbacks,
                &system_prompt,
                &messages,
                &tool_def,
                &categories,
                &mut args,
            )
            .await
            .unwrap_or_else(|| "general_knowledge".to_string())
        }
        None => {
            warn!(task_id, "LLM provided no category, falling back to general_knowledge");
            "general_knowledge".to_string()
        }
    };

    let llm_response_temp = coerce_temp(args.get("llm_response_temp"));

    // Mate selection: first mate whose category matches; @mate overrides
    // by id, then by category, adopting the mate's category either way.
    let mut selected_mate_id = mates
        .iter()
        .find(|m| m.category == validated_category)
        .map(|m| m.id.clone());
    // A mate pinned on the request (queued follow-on turns inherit the
    // previous turn's persona) beats category-based selection so the
    // persona never flips mid-conversation.
    if let Some(pinned) = &request.mate_id {
        if mates.iter().any(|m| &m.id == pinned) {
            selected_mate_id = Some(pinned.clone());
        } else {
            warn!(task_id, mate_id = %pinned, "request pinned an unknown mate, keeping automatic selection");
        }
    }
    if let Some(override_value) = &overrides.mate_id {
        let by_id = mates.iter().find(|m| &m.id == override_value);
        let resolved = by_id.or_else(|| mates.iter().find(|m| &m.category == override_value));
        match resolved {
            Some(mate) => {
                selected_mate_id = Some(mate.id.clone());
                validated_category = mate.category.clone();
                info!(task_id, mate_id = %mate.id, category = %mate.category, "applied mate override");
            }
            None => warn!(
                task_id,
                value = %override_value,
                "mate override matched neither an id nor a category, keeping automatic selection"
            ),
        }
    }

    let selection = select_main_model(
        ctx,
        task_id,
        overrides,
        task_area,
        complexity,
        china_related,
        user_unhappy,
    );

    // Settings/memories keys: normalize the separators the model tends to
    // invent, then keep only keys the client actually offered.
    let load_app_settings_and_memories = validate_settings_keys(
        task_id,
        string_list(&args, "load_app_settings_and_memories"),
        &available_settings_keys,
    );

    let relevant_embedded_previews = string_list(&args, "relevant_embedded_previews");

    let chat_summary = match args.get("chat_summary").and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Some(s.to_string()),
        _ => {
            error!(
                task_id,
                "chat_summary missing or empty from preprocessing LLM; postprocessing will be skipped"
            );
            None
        }
    };

    let mut chat_tags = string_list(&args, "chat_tags");
    if chat_tags.len() > 10 {
        warn!(task_id, count = chat_tags.len(), "chat_tags over limit, truncating to 10");
        chat_tags.truncate(10);
    }

    let output_language =
        normalize_output_language(args.get("output_language").and_then(Value::as_str));

    let relevant_app_skills = resolve_identifiers(
        task_id,
        "skill",
        string_list(&args, "relevant_app_skills"),
        &ctx.registry,
        SkillRegistry::resolve_skill,
    );
    let relevant_focus_modes = resolve_identifiers(
        task_id,
        "focus mode",
        string_list(&args, "relevant_focus_modes"),
        &ctx.registry,
        SkillRegistry::resolve_focus,
    );

    // Title and icons travel together or not at all.
    let title = args.get("title").and_then(Value::as_str).map(String::from);
    let icon_names = string_list(&args, "icon_names");

    let requires_advice_disclaimer =
        decide_disclaimer(ctx, task_id, &request.chat_id, &validated_category).await;

    let (server_provider_name, server_region) = match selection
        .model_id
        .as_deref()
        .and_then(|id| id.split_once('/'))
    {
        Some((provider, model)) => {
            let (name, region) = ctx.config.server_identity(provider, model);
            (Some(name), region)
        }
        None => (None, None),
    };

    info!(task_id, category = %validated_category, model = ?selection.model_id, "preprocessing finished");

    PreprocessingResult {
        can_proceed: true,
        rejection_reason: None,
        error_message: None,
        harmful_or_illegal_score: Some(harmful),
        misuse_risk_score: Some(misuse),
        category: Some(validated_category),
        complexity: Some(complexity),
        llm_response_temp: Some(llm_response_temp),
        output_language,
        load_app_settings_and_memories,
        relevant_embedded_previews,
        title,
        icon_names,
        chat_summary,
        chat_tags,
        relevant_app_skills,
        relevant_focus_modes,
        selected_mate_id,
        selected_main_llm_model_id: selection.model_id,
        selected_main_llm_model_name: selection.model_name,
        selected_secondary_model_id: selection.secondary_model_id,
        selected_fallback_model_id: selection.fallback_model_id,
        model_selection_reason: selection.reason,
        filtered_cn_models: selection.filtered_cn_models,
        server_provider_name,
        server_region,
        requires_advice_disclaimer,
        raw_llm_response: Some(Value::Object(args)),
    }
}

fn sanitize_user_messages(task_id: &str, request: &mut AskRequest) {
    for msg in &mut request.message_history {
        if msg.role != Role::User {
            continue;
        }
        if let MessageContent::Text(text) = &msg.content {
            let (clean, changed) = sanitize_user_text_traced(text);
            if changed {
                debug!(
                    task_id,
                    original_len = text.chars().count(),
                    sanitized_len = clean.chars().count(),
                    "sanitized invisible characters out of user message"
                );
                msg.content = MessageContent::Text(clean);
            }
        }
    }
}

fn history_as_chat_messages(history: &[convoy_core::types::HistoryMessage]) -> Vec<ChatMessage> {
    history
        .iter()
        .map(|m| ChatMessage {
            role: match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::System => "system",
                Role::Tool => "tool",
            }
            .to_string(),
            content: m.content.to_prompt_text(),
        })
        .collect()
}

fn build_system_prompt(
    base: &str,
    categories: &[String],
    skills: &[String],
    focus_modes: &[String],
    settings_keys: &BTreeSet<String>,
) -> String {
    let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let dynamic_context = json!({
        "CATEGORIES_LIST": categories,
        "AVAILABLE_APP_SKILLS": skills,
        "AVAILABLE_FOCUS_MODES": focus_modes,
        "AVAILABLE_APP_SETTINGS_AND_MEMORIES": settings_keys,
        "CURRENT_DATE_TIME": now,
    });
    format!("{base}\n\nDynamic context:\n{dynamic_context}")
}

async fn call_preprocessing_llm(
    gateway: &dyn ModelGateway,
    model: &str,
    fallbacks: &[String],
    system: &str,
    messages: &[ChatMessage],
    tool_def: &Value,
) -> Option<serde_json::Map<String, Value>> {
    let request = ChatRequest {
        model: model.to_string(),
        system: system.to_string(),
        messages: messages.to_vec(),
        raw_messages: None,
        max_tokens: 4096,
        temperature: Some(0.1),
        tools: vec![tool_definition_from(tool_def)],
        forced_tool: Some(PREPROCESS_TOOL_NAME.to_string()),
    };

    match send_with_fallbacks(gateway, &request, fallbacks).await {
        Ok((response, _model)) => match response.tool_arguments() {
            Some(Value::Object(map)) if !map.is_empty() => Some(map.clone()),
            _ => {
                warn!("preprocessing LLM returned no tool arguments");
                None
            }
        },
        Err(e) => {
            error!(error = %e, "preprocessing LLM call failed on all candidates");
            None
        }
    }
}

fn tool_definition_from(tool: &Value) -> ToolDefinition {
    ToolDefinition {
        name: tool
            .pointer("/function/name")
            .and_then(Value::as_str)
            .unwrap_or(PREPROCESS_TOOL_NAME)
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

fn prune_one_shot_fields(tool: &mut Value) {
    for field in ["title", "icon_names", "category"] {
        if let Some(props) = tool
            .pointer_mut("/function/parameters/properties")
            .and_then(Value::as_object_mut)
        {
            props.remove(field);
        }
        if let Some(required) = tool
            .pointer_mut("/function/parameters/required")
            .and_then(Value::as_array_mut)
        {
            required.retain(|v| v != field);
        }
    }
}

/// Retry the whole call once with a MUST-be-one-of category description.
/// The retry's skill preselection is unioned with the first call's: an
/// invalid category often comes with a suboptimal skill pick, and the
/// downstream filter drops anything bogus anyway.
#[allow(clippy::too_many_arguments)]
async fn retry_category(
    ctx: &PipelineContext,
    task_id: &str,
    model: &str,
    fallbacks: &[String],
    system: &str,
    messages: &[ChatMessage],
    tool_def: &Value,
    categories: &[String],
    args: &mut serde_json::Map<String, Value>,
) -> Option<String> {
    let mut retry_tool = tool_def.clone();
    if let Some(desc) = retry_tool
        .pointer_mut("/function/parameters/properties/category/description")
    {
        let existing = desc.as_str().unwrap_or_default();
        *desc = json!(format!(
            "{existing} **CRITICAL: You MUST select EXACTLY one category from this list: \
             {categories:?}. DO NOT invent new categories. If unsure, use 'general_knowledge'.**"
        ));
    }

    let retry_args = call_preprocessing_llm(
        ctx.model_gateway.as_ref(),
        model,
        fallbacks,
        system,
        messages,
        &retry_tool,
    )
    .await?;

    // Union of skill preselections, first call's order preserved.
    if let Some(Value::Array(retry_skills)) = retry_args.get("relevant_app_skills") {
        let mut merged = string_list(args, "relevant_app_skills");
        for skill in retry_skills.iter().filter_map(Value::as_str) {
            if !merged.iter().any(|s| s == skill) {
                merged.push(skill.to_string());
            }
        }
        args.insert("relevant_app_skills".to_string(), json!(merged));
    }

    match retry_args.get("category").and_then(Value::as_str) {
        Some(category) if categories.contains(&category.to_string()) => {
            info!(task_id, %category, "category retry produced a valid category");
            Some(category.to_string())
        }
        other => {
            warn!(task_id, retry_category = ?other, "category retry still invalid, using general_knowledge");
            None
        }
    }
}

struct MainModelSelection {
    model_id: Option<String>,
    model_name: Option<String>,
    secondary_model_id: Option<String>,
    fallback_model_id: Option<String>,
    reason: Option<String>,
    filtered_cn_models: bool,
}

fn select_main_model(
    ctx: &PipelineContext,
    task_id: &str,
    overrides: &mut UserOverrides,
    task_area: TaskArea,
    complexity: Complexity,
    china_related: bool,
    user_unhappy: bool,
) -> MainModelSelection {
    // `@best-model:<category>` resolves to the leaderboard's top entry and
    // then behaves like a regular model override.
    if overrides.model_id.is_none() {
        if let Some(category) = overrides.best_model_category.clone() {
            match ctx
                .leaderboard
                .as_ref()
                .and_then(|board| board.best_for_category(&category, china_related))
            {
                Some(entry) => {
                    info!(task_id, %category, model = %entry.full_model_id(), "resolved @best-model override");
                    overrides.model_id = Some(entry.full_model_id());
                    overrides.model_provider = None;
                }
                None => warn!(
                    task_id,
                    %category,
                    "no leaderboard entry for @best-model category, falling back to auto-selection"
                ),
            }
        }
    }

    if let Some(override_model) = overrides.model_id.clone() {
        let (model_id, reason) = if override_model.contains('/') {
            (
                override_model.clone(),
                format!("User override: {override_model}"),
            )
        } else if let Some(provider) = &overrides.model_provider {
            (
                format!("{provider}/{override_model}"),
                format!("User override with provider: {provider}/{override_model}"),
            )
        } else if let Some(provider) = ctx.config.find_provider_for_model(&override_model) {
            (
                format!("{provider}/{override_model}"),
                format!("User override (provider resolved): {provider}/{override_model}"),
            )
        } else {
            // Let it through so the billing preflight produces a clear
            // error about the missing provider.
            warn!(task_id, model = %override_model, "could not resolve provider for override model");
            (
                override_model.clone(),
                format!("User override (unresolved provider): {override_model}"),
            )
        };

        let model_name = model_id
            .split_once('/')
            .and_then(|(provider, model)| ctx.config.model_display_name(provider, model))
            .or_else(|| {
                Some(
                    model_id
                        .split_once('/')
                        .map(|(_, m)| m.to_string())
                        .unwrap_or_else(|| model_id.clone()),
                )
            });

        return MainModelSelection {
            model_id: Some(model_id),
            model_name,
            secondary_model_id: None,
            fallback_model_id: None,
            reason: Some(reason),
            filtered_cn_models: china_related,
        };
    }

    if ctx.config.pipeline.enable_auto_model_selection {
        if let Some(board) = &ctx.leaderboard {
            if let Some(selection) = ModelSelector::new(board).select_models(
                task_area,
                complexity,
                china_related,
                user_unhappy,
            ) {
                let model_name = selection
                    .primary_model_id
                    .split_once('/')
                    .map(|(provider, model)| {
                        ctx.config
                            .model_display_name(provider, model)
                            .unwrap_or_else(|| model.to_string())
                    });
                info!(
                    task_id,
                    primary = %selection.primary_model_id,
                    secondary = ?selection.secondary_model_id,
                    fallback = ?selection.fallback_model_id,
                    "auto model selection completed"
                );
                return MainModelSelection {
                    model_id: Some(selection.primary_model_id),
                    model_name,
                    secondary_model_id: selection.secondary_model_id,
                    fallback_model_id: selection.fallback_model_id,
                    reason: Some(selection.selection_reason),
                    filtered_cn_models: selection.filtered_cn_models,
                };
            }
        }
        warn!(task_id, "auto model selection unavailable, using configured defaults");
    }

    let llms = &ctx.config.pipeline.default_llms;
    let (model_id, model_name) = match complexity {
        Complexity::Complex => (
            llms.main_processing_complex.clone(),
            llms.main_processing_complex_name.clone(),
        ),
        Complexity::Simple => (
            llms.main_processing_simple.clone(),
            llms.main_processing_simple_name.clone(),
        ),
    };
    MainModelSelection {
        model_id: Some(model_id),
        model_name,
        secondary_model_id: None,
        fallback_model_id: None,
        reason: Some(format!(
            "Configured default (auto-selection {}, complexity={complexity:?})",
            if ctx.config.pipeline.enable_auto_model_selection {
                "failed"
            } else {
                "disabled"
            }
        )),
        filtered_cn_models: china_related,
    }
}

async fn decide_disclaimer(
    ctx: &PipelineContext,
    task_id: &str,
    chat_id: &str,
    category: &str,
) -> Option<DisclaimerKind> {
    let kind = DisclaimerKind::for_category(category)?;
    let now = chrono::Utc::now().timestamp();
    let needed = match ctx.disclaimers.last(chat_id).await {
        Ok(record) => should_inject_disclaimer(record.as_ref(), kind, now),
        Err(e) => {
            // Fail-safe: a broken record never suppresses a legally
            // required disclaimer.
            warn!(task_id, chat_id, error = %e, "disclaimer state unreadable, injecting");
            true
        }
    };
    if needed {
        info!(task_id, chat_id, kind = kind.as_str(), "advice disclaimer will be appended");
        Some(kind)
    } else {
        debug!(task_id, chat_id, kind = kind.as_str(), "disclaimer shown recently, skipping");
        None
    }
}

fn should_inject_disclaimer(
    record: Option<&DisclaimerRecord>,
    kind: DisclaimerKind,
    now: i64,
) -> bool {
    let Some(record) = record else {
        return true;
    };
    if record.last_disclaimer_type.as_deref() != Some(kind.as_str()) {
        return true;
    }
    match record.last_disclaimer_timestamp {
        Some(ts) => now - ts >= DISCLAIMER_COOLDOWN_SECS,
        // Same type but no timestamp: inject to be safe.
        None => true,
    }
}

fn rejection_with_scores(
    reason: RejectionReason,
    message: String,
    harmful: f64,
    misuse: f64,
    args: &serde_json::Map<String, Value>,
) -> PreprocessingResult {
    let mut result = PreprocessingResult::rejected(reason, message);
    result.harmful_or_illegal_score = Some(harmful);
    result.misuse_risk_score = Some(misuse);
    result.category = args.get("category").and_then(Value::as_str).map(String::from);
    result.title = args.get("title").and_then(Value::as_str).map(String::from);
    result.icon_names = string_list(args, "icon_names");
    result.raw_llm_response = Some(Value::Object(args.clone()));
    result
}

/// Coerce any numeric-ish score to f64 clamped to [0, 10]; garbage is 0.
fn coerce_score(value: Option<&Value>) -> f64 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.unwrap_or(0.0).clamp(0.0, 10.0)
}

/// Temperature clamped to [0, 2], defaulting to 0.4.
fn coerce_temp(value: Option<&Value>) -> f64 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.unwrap_or(0.4).clamp(0.0, 2.0)
}

fn string_list(args: &serde_json::Map<String, Value>, key: &str) -> Vec<String> {
    match args.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

/// Client metadata arrives as `"<app_id>-<item_type>"`; the canonical key
/// form used everywhere downstream is `"<app_id>:<item_type>"`.
fn parse_client_settings_metadata(metadata: Option<&[String]>) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    let Some(metadata) = metadata else {
        return keys;
    };
    for raw in metadata {
        match raw.split_once('-') {
            Some((app_id, item_type)) if !app_id.is_empty() && !item_type.is_empty() => {
                keys.insert(format!("{app_id}:{item_type}"));
            }
            _ => warn!(key = %raw, "invalid app_settings_memories_metadata key, skipping"),
        }
    }
    keys
}

/// Normalize the separator the model used to the canonical `app:item`
/// form: `": "`, `" : "`, `" - "`, `" -"`, `"- "`, and a lone hyphen all
/// collapse to `:`.
fn normalize_settings_key(key: &str) -> String {
    let mut normalized = key.trim().to_string();
    normalized = normalized.replace(" : ", ":");
    normalized = normalized.replace(": ", ":");
    normalized = normalized.replace(" - ", ":");
    normalized = normalized.replace(" -", ":").replace("- ", ":");
    if !normalized.contains(':') && normalized.contains('-') {
        normalized = normalized.replacen('-', ":", 1);
    }
    normalized.trim().to_string()
}

fn validate_settings_keys(
    task_id: &str,
    raw_keys: Vec<String>,
    available: &BTreeSet<String>,
) -> Vec<String> {
    let mut validated = Vec::new();
    let mut dropped = Vec::new();
    for raw in raw_keys {
        let normalized = normalize_settings_key(&raw);
        if available.contains(&normalized) {
            if normalized != raw {
                debug!(task_id, %raw, %normalized, "corrected settings key format");
            }
            if !validated.contains(&normalized) {
                validated.push(normalized);
            }
        } else {
            dropped.push(raw);
        }
    }
    if !dropped.is_empty() {
        warn!(task_id, dropped = ?dropped, "dropped settings keys not offered by the client");
    }
    validated
}

/// Run a list of LLM-emitted identifiers through a resolver, dropping
/// unresolvable entries and deduplicating while preserving order. An empty
/// result means "none preselected", never "all".
fn resolve_identifiers(
    task_id: &str,
    what: &str,
    raw: Vec<String>,
    registry: &SkillRegistry,
    resolve: for<'a> fn(&'a SkillRegistry, &str) -> Option<&'a str>,
) -> Vec<String> {
    let mut resolved = Vec::new();
    let mut corrected = Vec::new();
    let mut invalid = Vec::new();
    for name in raw {
        match resolve(registry, &name) {
            Some(valid) => {
                if valid != name {
                    corrected.push(format!("{name} -> {valid}"));
                }
                if !resolved.iter().any(|r| r == valid) {
                    resolved.push(valid.to_string());
                }
            }
            None => invalid.push(name),
        }
    }
    if !corrected.is_empty() {
        info!(task_id, what, corrected = ?corrected, "corrected hallucinated identifiers");
    }
    if !invalid.is_empty() {
        warn!(task_id, what, invalid = ?invalid, "dropped unresolvable identifiers");
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scores_clamp_and_default() {
        assert_eq!(coerce_score(Some(&json!(7.5))), 7.5);
        assert_eq!(coerce_score(Some(&json!(-3))), 0.0);
        assert_eq!(coerce_score(Some(&json!(42))), 10.0);
        assert_eq!(coerce_score(Some(&json!("8"))), 8.0);
        assert_eq!(coerce_score(Some(&json!("high"))), 0.0);
        assert_eq!(coerce_score(None), 0.0);
    }

    #[test]
    fn temperature_boundaries() {
        assert_eq!(coerce_temp(Some(&json!(2.0))), 2.0);
        assert_eq!(coerce_temp(Some(&json!(2.001))), 2.0);
        assert_eq!(coerce_temp(Some(&json!(-0.5))), 0.0);
        assert_eq!(coerce_temp(None), 0.4);
    }

    #[test]
    fn settings_key_normalization_variants() {
        assert_eq!(normalize_settings_key("code:preferred_tech"), "code:preferred_tech");
        assert_eq!(normalize_settings_key("code: preferred_tech"), "code:preferred_tech");
        assert_eq!(normalize_settings_key("code : preferred_tech"), "code:preferred_tech");
        assert_eq!(normalize_settings_key("code - preferred_tech"), "code:preferred_tech");
        assert_eq!(normalize_settings_key("code -preferred_tech"), "code:preferred_tech");
        assert_eq!(normalize_settings_key("code- preferred_tech"), "code:preferred_tech");
        assert_eq!(normalize_settings_key("code-preferred_tech"), "code:preferred_tech");
    }

    #[test]
    fn settings_keys_filter_against_client_set() {
        let available: BTreeSet<String> =
            ["code:preferred_tech".to_string(), "travel:trips".to_string()].into();
        let validated = validate_settings_keys(
            "t",
            vec![
                "code - preferred_tech".to_string(),
                "travel:trips".to_string(),
                "music:taste".to_string(),
            ],
            &available,
        );
        assert_eq!(validated, vec!["code:preferred_tech", "travel:trips"]);
    }

    #[test]
    fn client_metadata_parses_on_first_hyphen() {
        let keys = parse_client_settings_metadata(Some(&[
            "code-preferred_technologies".to_string(),
            "travel-trips".to_string(),
            "broken".to_string(),
            "-empty".to_string(),
        ]));
        assert!(keys.contains("code:preferred_technologies"));
        assert!(keys.contains("travel:trips"));
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn disclaimer_cooldown_rules() {
        let now = 10_000;
        // No record: inject.
        assert!(should_inject_disclaimer(None, DisclaimerKind::Medical, now));
        // Different type: inject.
        let other = DisclaimerRecord {
            last_disclaimer_type: Some("legal".into()),
            last_disclaimer_timestamp: Some(now - 60),
        };
        assert!(should_inject_disclaimer(Some(&other), DisclaimerKind::Medical, now));
        // Same type, inside cooldown: skip.
        let recent = DisclaimerRecord {
            last_disclaimer_type: Some("medical".into()),
            last_disclaimer_timestamp: Some(now - 60),
        };
        assert!(!should_inject_disclaimer(Some(&recent), DisclaimerKind::Medical, now));
        // Same type, cooldown elapsed: inject.
        let stale = DisclaimerRecord {
            last_disclaimer_type: Some("medical".into()),
            last_disclaimer_timestamp: Some(now - DISCLAIMER_COOLDOWN_SECS),
        };
        assert!(should_inject_disclaimer(Some(&stale), DisclaimerKind::Medical, now));
        // Same type, no timestamp: inject.
        let broken = DisclaimerRecord {
            last_disclaimer_type: Some("medical".into()),
            last_disclaimer_timestamp: None,
        };
        assert!(should_inject_disclaimer(Some(&broken), DisclaimerKind::Medical, now));
    }

    #[test]
    fn one_shot_fields_prune_from_properties_and_required() {
        let mut tool = crate::instructions::InstructionSet::builtin().preprocess_tool;
        prune_one_shot_fields(&mut tool);
        let props = tool.pointer("/function/parameters/properties").unwrap();
        assert!(props.get("title").is_none());
        assert!(props.get("icon_names").is_none());
        assert!(props.get("category").is_none());
        let required = tool
            .pointer("/function/parameters/required")
            .unwrap()
            .as_array()
            .unwrap();
        assert!(!required.iter().any(|v| v == "title" || v == "category"));
        assert!(required.iter().any(|v| v == "chat_summary"));
    }
}
