//! Top-level request orchestration.
//!
//! One run per `AskRequest`: preprocessing gates the request, the typing
//! event announces the turn, billing is preflighted before a single token
//! streams, the main processor streams and tool-calls, the per-chat queue
//! is drained into a follow-on task before postprocessing starts, and
//! every failure path funnels through the cleanup coordinator.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{error, info, warn};

use convoy_bus::{
    chat_stream_channel, typing_events_channel, BusEvent, PostProcessingEvent, TypingStartedEvent,
};
use convoy_core::logsafe;
use convoy_core::overrides::parse_overrides_from_request;
use convoy_core::types::{
    AskRequest, HistoryMessage, MessageContent, PostProcessingResult, PreprocessingResult,
    QueuedMessage, Role,
};

use crate::cleanup::CleanupCoordinator;
use crate::context::PipelineContext;
use crate::debug::Stage;
use crate::error::{PipelineError, Result};
use crate::mainproc::{process_main, publish_final_marker, MainOutcome};
use crate::postprocess::handle_postprocessing;
use crate::preprocess::handle_preprocessing;
use crate::storage::StorageGateway;
use crate::token::RunToken;

/// Separator used when collapsing queued messages into one follow-on
/// request. Tests depend on the exact text.
const QUEUE_COLLAPSE_SEPARATOR: &str = "\n\n";

#[derive(Debug, Default)]
pub struct PipelineRunSummary {
    pub task_id: String,
    pub status: RunStatus,
    pub preprocessing: Option<PreprocessingResult>,
    pub response_text: String,
    pub postprocessing: Option<PostProcessingResult>,
    pub interrupted_by_soft_time_limit: bool,
    pub interrupted_by_revocation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunStatus {
    #[default]
    Completed,
    CompletedPartiallySoftLimit,
    CompletedPartiallyRevoked,
    Rejected,
    Failed,
}

pub struct RequestPipeline {
    ctx: Arc<PipelineContext>,
    cleanup: CleanupCoordinator,
}

impl RequestPipeline {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        let cleanup = CleanupCoordinator::new(ctx.markers.clone(), ctx.embeds.clone());
        Self { ctx, cleanup }
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    /// Run one request under the soft and hard time limits. The soft limit
    /// trips the run token so the stream finalizes cleanly with partial
    /// results; the hard limit unwinds through cleanup.
    pub async fn run(&self, task_id: &str, request: AskRequest) -> PipelineRunSummary {
        if logsafe::request_logging_enabled() {
            info!(task_id, request = %logsafe::request_for_logging(&request), "ask task received");
        } else {
            info!(task_id, "ask task received");
        }

        let token = RunToken::new();
        self.ctx
            .run_tokens
            .insert(task_id.to_string(), token.clone());

        // Soft limit: cooperative, checked at chunk boundaries.
        let soft_limit = Duration::from_secs(self.ctx.config.pipeline.soft_time_limit_secs);
        let soft_token = token.clone();
        let soft_timer = tokio::spawn(async move {
            tokio::time::sleep(soft_limit).await;
            soft_token.trip_soft_limit();
        });

        let hard_limit = Duration::from_secs(self.ctx.config.pipeline.hard_time_limit_secs);
        let chat_id = request.chat_id.clone();
        let result = tokio::time::timeout(hard_limit, self.run_inner(task_id, request)).await;

        soft_timer.abort();
        self.ctx.run_tokens.remove(task_id);

        match result {
            Ok(summary) => summary,
            Err(_elapsed) => {
                error!(task_id, "hard time limit exceeded, unwinding through cleanup");
                self.cleanup
                    .run(&chat_id, task_id, token.is_revoked(), "hard time limit exceeded")
                    .await;
                PipelineRunSummary {
                    task_id: task_id.to_string(),
                    status: RunStatus::Failed,
                    interrupted_by_soft_time_limit: true,
                    ..Default::default()
                }
            }
        }
    }

    async fn run_inner(&self, task_id: &str, mut request: AskRequest) -> PipelineRunSummary {
        let token = self
            .ctx
            .run_tokens
            .get(task_id)
            .map(|t| t.value().clone())
            .unwrap_or_default();

        if let Err(e) = self.ctx.markers.set(&request.chat_id, task_id).await {
            return self
                .fail(task_id, &request, &token, &format!("failed to claim chat: {e}"))
                .await;
        }

        // Step 0: @mention overrides, stripped out of the message the
        // model will see.
        let mut overrides = parse_overrides_from_request(&mut request);
        if overrides.has_overrides() {
            info!(task_id, ?overrides, "user overrides detected");
        }

        // Step 1: preprocessing.
        // Debug snapshots capture FULL content (the ring is encrypted per
        // user); the log-safe views are only for plaintext logs.
        let pre = handle_preprocessing(&self.ctx, task_id, &mut request, &mut overrides).await;
        self.ctx
            .debug
            .record(
                task_id,
                &request.chat_id,
                &request.user_id,
                Stage::Preprocessor,
                serde_json::to_value(&request).unwrap_or_default(),
                serde_json::to_value(&pre).unwrap_or_default(),
            )
            .await;

        // A single explicit @focus mention activates that focus for the
        // turn.
        if overrides.focus_modes.len() == 1 {
            let (app_id, focus_id) = &overrides.focus_modes[0];
            request.active_focus_id = Some(format!("{app_id}-{focus_id}"));
        }

        if !pre.can_proceed {
            return self.reject(task_id, &request, &token, pre).await;
        }

        // Billing preflight: misconfiguration must surface before any
        // token is metered.
        if let Err(e) = self.billing_preflight(&pre) {
            error!(task_id, error = %e, "billing preflight failed");
            return self.fail(task_id, &request, &token, &e.to_string()).await;
        }

        self.publish_typing_started(task_id, &request, &pre);

        // Step 2: main streaming.
        let outcome = match process_main(&self.ctx, task_id, &request, &pre, &token).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(task_id, error = %e, "main processing failed");
                return self.fail(task_id, &request, &token, &e.to_string()).await;
            }
        };
        self.ctx
            .debug
            .record(
                task_id,
                &request.chat_id,
                &request.user_id,
                Stage::MainProcessor,
                json!({
                    "selected_model": pre.selected_main_llm_model_id,
                    "preselected_skills": pre.relevant_app_skills,
                    "chat_summary": pre.chat_summary,
                    "message_history_count": request.message_history.len(),
                }),
                json!({
                    "full_response": outcome.text,
                    "was_revoked": outcome.was_revoked,
                    "was_soft_limited": outcome.was_soft_limited,
                    "messages_version": outcome.messages_version,
                }),
            )
            .await;

        // Queue drain happens BEFORE postprocessing: the next turn may
        // start while suggestions are still being generated.
        if let Err(e) = self.drain_queue(task_id, &request, &pre, &outcome).await {
            warn!(task_id, error = %e, "queue drain failed (non-fatal)");
        }

        // Step 3: postprocessing.
        let post = self.postprocess(task_id, &request, &pre, &outcome).await;

        let status = if outcome.was_soft_limited {
            RunStatus::CompletedPartiallySoftLimit
        } else if outcome.was_revoked {
            RunStatus::CompletedPartiallyRevoked
        } else {
            RunStatus::Completed
        };
        if outcome.was_revoked || outcome.was_soft_limited {
            // Interrupted runs still have to finalize their embeds.
            self.cleanup
                .run(&request.chat_id, task_id, outcome.was_revoked, "interrupted")
                .await;
        }

        info!(task_id, ?status, "ask task finished");
        PipelineRunSummary {
            task_id: task_id.to_string(),
            status,
            interrupted_by_soft_time_limit: outcome.was_soft_limited,
            interrupted_by_revocation: outcome.was_revoked,
            preprocessing: Some(pre),
            response_text: outcome.text,
            postprocessing: post,
        }
    }

    fn billing_preflight(&self, pre: &PreprocessingResult) -> Result<()> {
        if !self.ctx.config.pipeline.billing_enabled {
            return Ok(());
        }
        let model_id = pre
            .selected_main_llm_model_id
            .as_deref()
            .ok_or_else(|| {
                PipelineError::BillingPreflight(
                    "selected main model id missing from preprocessing".to_string(),
                )
            })?;
        let (provider, model) = model_id.split_once('/').ok_or_else(|| {
            PipelineError::BillingPreflight(format!(
                "model id '{model_id}' must include a provider prefix (format 'provider/model')"
            ))
        })?;
        if self.ctx.config.provider(provider).is_none() {
            return Err(PipelineError::BillingPreflight(format!(
                "no configuration for provider '{provider}'"
            )));
        }
        if self.ctx.config.model_pricing(provider, model).is_none() {
            return Err(PipelineError::BillingPreflight(format!(
                "pricing missing for model '{model}' under provider '{provider}'"
            )));
        }
        Ok(())
    }

    fn publish_typing_started(
        &self,
        task_id: &str,
        request: &AskRequest,
        pre: &PreprocessingResult,
    ) {
        // External API calls never see web-app lifecycle events.
        if request.is_external {
            return;
        }

        // Title and icons are atomic: both or neither.
        let (title, icon_names) = match (&pre.title, pre.icon_names.is_empty()) {
            (Some(title), false) => (Some(title.clone()), Some(pre.icon_names.clone())),
            (Some(_), true) | (None, false) => {
                warn!(
                    task_id,
                    has_title = pre.title.is_some(),
                    has_icons = !pre.icon_names.is_empty(),
                    "inconsistent title/icon_names pair, skipping chat metadata"
                );
                (None, None)
            }
            (None, true) => (None, None),
        };

        let event = TypingStartedEvent {
            task_id: task_id.to_string(),
            chat_id: request.chat_id.clone(),
            user_id: request.user_id.clone(),
            user_id_hash: request.user_id_hash.clone(),
            user_message_id: request.message_id.clone(),
            category: pre
                .category
                .clone()
                .unwrap_or_else(|| "general_knowledge".to_string()),
            model_name: pre.selected_main_llm_model_name.clone(),
            provider_name: pre.server_provider_name.clone(),
            server_region: pre.server_region.clone(),
            title,
            icon_names,
        };
        self.ctx.bus.publish(
            &typing_events_channel(&request.user_id_hash),
            BusEvent::AiProcessingStartedEvent(event),
        );
    }

    /// Clear the marker, collapse queued messages into one follow-on
    /// request, and dispatch it as a fresh task that inherits the mate
    /// selected this turn.
    async fn drain_queue(
        &self,
        task_id: &str,
        request: &AskRequest,
        pre: &PreprocessingResult,
        outcome: &MainOutcome,
    ) -> std::result::Result<(), convoy_kv::KvError> {
        self.ctx.markers.clear(&request.chat_id).await?;

        let queued = self.ctx.queues.drain(&request.chat_id).await?;
        if queued.is_empty() {
            return Ok(());
        }

        info!(
            task_id,
            count = queued.len(),
            "collapsing queued messages into a follow-on request"
        );
        let Some(follow_on) = build_follow_on_request(request, pre, &outcome.text, queued) else {
            warn!(task_id, "queued messages carried no usable content");
            return Ok(());
        };

        let kwargs = json!({
            "request_data": follow_on,
        });
        let new_task_id = self.ctx.dispatcher.dispatch("ai", "ask", kwargs, None);
        self.ctx
            .markers
            .set(&request.chat_id, &new_task_id)
            .await?;
        info!(task_id, %new_task_id, "follow-on task dispatched, postprocessing continues in parallel");
        Ok(())
    }

    async fn postprocess(
        &self,
        task_id: &str,
        request: &AskRequest,
        pre: &PreprocessingResult,
        outcome: &MainOutcome,
    ) -> Option<PostProcessingResult> {
        if outcome.was_soft_limited {
            info!(task_id, "skipping postprocessing: soft time limit hit");
            return None;
        }
        if outcome.was_revoked {
            info!(task_id, "skipping postprocessing: run was revoked");
            return None;
        }
        if request.is_external {
            info!(task_id, "skipping postprocessing: external request");
            return None;
        }
        if outcome.text.is_empty() {
            info!(task_id, "skipping postprocessing: empty response");
            return None;
        }
        if pre.chat_summary.is_none() {
            error!(
                task_id,
                "skipping postprocessing: preprocessing produced no chat summary"
            );
            return None;
        }

        let post = handle_postprocessing(&self.ctx, task_id, request, pre, &outcome.text).await?;

        // The client prefers the postprocessing summary — it has seen the
        // latest exchange.
        let final_summary = post
            .chat_summary
            .clone()
            .or_else(|| pre.chat_summary.clone());
        let event = PostProcessingEvent {
            task_id: task_id.to_string(),
            chat_id: request.chat_id.clone(),
            user_id: request.user_id.clone(),
            user_id_hash: request.user_id_hash.clone(),
            follow_up_request_suggestions: post.follow_up_request_suggestions.clone(),
            new_chat_request_suggestions: post.new_chat_request_suggestions.clone(),
            chat_summary: final_summary,
            chat_tags: pre.chat_tags.clone(),
            harmful_response: post.harmful_response,
            top_recommended_apps_for_user: post.top_recommended_apps_for_user.clone(),
            suggested_settings_memories: post.suggested_settings_memories.clone(),
        };
        self.ctx.bus.publish(
            &typing_events_channel(&request.user_id_hash),
            BusEvent::PostProcessingCompleted(event),
        );

        self.ctx
            .debug
            .record(
                task_id,
                &request.chat_id,
                &request.user_id,
                Stage::Postprocessor,
                json!({
                    "last_user_message": request.last_user_message_text(),
                    "assistant_response": outcome.text,
                    "chat_summary_source": if post.chat_summary.is_some() {
                        "postprocessing"
                    } else {
                        "preprocessing"
                    },
                }),
                serde_json::to_value(&post).unwrap_or_default(),
            )
            .await;

        Some(post)
    }

    /// Rejection: the pipeline ends normally, with a persisted system
    /// notice when there is a message, and never a content token.
    async fn reject(
        &self,
        task_id: &str,
        request: &AskRequest,
        token: &RunToken,
        pre: PreprocessingResult,
    ) -> PipelineRunSummary {
        let reason = pre.rejection_reason;
        info!(task_id, ?reason, "request rejected by preprocessing");

        if let Some(message) = pre.error_message.as_deref().filter(|m| !m.is_empty()) {
            if let Err(e) = self
                .ctx
                .storage
                .persist_system_notice(&request.chat_id, &request.message_id, &request.user_id_hash, message)
                .await
            {
                error!(task_id, error = %e, "failed to persist rejection notice");
            }
        }

        let suppress_typing = reason.map(|r| r.suppresses_typing()).unwrap_or(false);
        if !suppress_typing {
            self.publish_typing_started(task_id, request, &pre);
        }

        // Close the stream for any listener: one final marker, no content.
        publish_final_marker(
            &self.ctx,
            &chat_stream_channel(&request.chat_id),
            task_id,
            request,
            1,
            false,
            false,
            true,
        );

        self.cleanup
            .run(
                &request.chat_id,
                task_id,
                token.is_revoked(),
                pre.error_message.as_deref().unwrap_or("rejected"),
            )
            .await;

        PipelineRunSummary {
            task_id: task_id.to_string(),
            status: RunStatus::Rejected,
            preprocessing: Some(pre),
            ..Default::default()
        }
    }

    async fn fail(
        &self,
        task_id: &str,
        request: &AskRequest,
        token: &RunToken,
        message: &str,
    ) -> PipelineRunSummary {
        // One error chunk so clients stop waiting, then cleanup.
        let channel = chat_stream_channel(&request.chat_id);
        self.ctx.bus.publish(
            &channel,
            BusEvent::AiMessageChunk(convoy_bus::ChunkEvent {
                task_id: task_id.to_string(),
                chat_id: request.chat_id.clone(),
                message_id: task_id.to_string(),
                user_message_id: request.message_id.clone(),
                full_content_so_far: format!("Error: {message}"),
                sequence: 1,
                is_final_chunk: true,
                interrupted_by_soft_limit: token.is_soft_limited(),
                interrupted_by_revocation: token.is_revoked(),
                error: true,
            }),
        );

        self.cleanup
            .run(&request.chat_id, task_id, token.is_revoked(), message)
            .await;

        PipelineRunSummary {
            task_id: task_id.to_string(),
            status: RunStatus::Failed,
            interrupted_by_revocation: token.is_revoked(),
            interrupted_by_soft_time_limit: token.is_soft_limited(),
            ..Default::default()
        }
    }
}

/// Collapse queued messages into one follow-on request: contents joined in
/// arrival order, history extended with the reply just produced, the mate
/// pinned to this turn's selection so the persona doesn't flip
/// mid-conversation.
fn build_follow_on_request(
    request: &AskRequest,
    pre: &PreprocessingResult,
    assistant_response: &str,
    queued: Vec<QueuedMessage>,
) -> Option<AskRequest> {
    let mut combined_parts: Vec<String> = Vec::new();
    let mut first_meta: Option<&QueuedMessage> = None;

    for message in &queued {
        let Some(content) = message.last_user_message_text().filter(|c| !c.is_empty()) else {
            warn!(
                message_id = %message.message_id,
                "queued message without extractable content, skipping"
            );
            continue;
        };
        combined_parts.push(content);
        first_meta.get_or_insert(message);
    }

    let first = first_meta?;
    let combined_content = combined_parts.join(QUEUE_COLLAPSE_SEPARATOR);
    let now = chrono::Utc::now().timestamp();

    let mut history = request.message_history.clone();
    if !assistant_response.is_empty() {
        history.push(HistoryMessage {
            role: Role::Assistant,
            content: MessageContent::Text(assistant_response.to_string()),
            created_at: now,
            sender_name: Some("assistant".to_string()),
            category: None,
        });
    }
    history.push(HistoryMessage {
        role: Role::User,
        content: MessageContent::Text(combined_content),
        created_at: now,
        sender_name: Some("user".to_string()),
        category: None,
    });

    Some(AskRequest {
        chat_id: request.chat_id.clone(),
        message_id: first.message_id.clone(),
        user_id: first.user_id.clone(),
        user_id_hash: first.user_id_hash.clone(),
        message_history: history,
        chat_has_title: true,
        is_incognito: request.is_incognito,
        is_external: request.is_external,
        // Keep the mate chosen this turn; re-selection mid-conversation
        // would switch personas under the user.
        mate_id: pre.selected_mate_id.clone(),
        active_focus_id: first
            .active_focus_id
            .clone()
            .or_else(|| request.active_focus_id.clone()),
        user_preferences: request.user_preferences.clone(),
        app_settings_memories_metadata: request.app_settings_memories_metadata.clone(),
    })
}

/// Dispatcher handler for `apps.ai.tasks.skill_ask`: deserializes the
/// request and runs the pipeline under its limits.
pub struct AskTaskHandler {
    pipeline: Arc<RequestPipeline>,
}

impl AskTaskHandler {
    pub fn new(pipeline: Arc<RequestPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait::async_trait]
impl convoy_skills::TaskHandler for AskTaskHandler {
    async fn run(&self, task: &convoy_skills::TaskEnvelope) -> convoy_skills::TaskResult {
        let request: AskRequest = serde_json::from_value(
            task.kwargs
                .get("request_data")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
        )
        .map_err(|e| format!("invalid ask request payload: {e}"))?;

        let summary = self.pipeline.run(&task.task_id, request).await;
        Ok(json!({
            "status": format!("{:?}", summary.status),
            "response_length": summary.response_text.chars().count(),
            "interrupted_by_soft_time_limit": summary.interrupted_by_soft_time_limit,
            "interrupted_by_revocation": summary.interrupted_by_revocation,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn message(role: Role, text: &str, at: i64) -> HistoryMessage {
        HistoryMessage {
            role,
            content: MessageContent::Text(text.to_string()),
            created_at: at,
            sender_name: None,
            category: None,
        }
    }

    fn request_with(chat_id: &str, history: Vec<HistoryMessage>) -> AskRequest {
        AskRequest {
            chat_id: chat_id.into(),
            message_id: "m0".into(),
            user_id: "u1".into(),
            user_id_hash: "h1".into(),
            message_history: history,
            chat_has_title: false,
            is_incognito: false,
            is_external: false,
            mate_id: None,
            active_focus_id: None,
            user_preferences: BTreeMap::new(),
            app_settings_memories_metadata: None,
        }
    }

    #[test]
    fn queue_collapse_joins_with_double_newline() {
        let request = request_with("c2", vec![message(Role::User, "original", 1)]);
        let pre = PreprocessingResult {
            selected_mate_id: Some("sophia".into()),
            ..Default::default()
        };

        let mut q1 = request_with("c2", vec![message(Role::User, "one", 2)]);
        q1.message_id = "q1".into();
        let mut q2 = request_with("c2", vec![message(Role::User, "two", 3)]);
        q2.message_id = "q2".into();

        let follow_on = build_follow_on_request(&request, &pre, "the reply", vec![q1, q2]).unwrap();

        assert_eq!(
            follow_on.last_user_message_text().as_deref(),
            Some("one\n\ntwo")
        );
        assert_eq!(follow_on.mate_id.as_deref(), Some("sophia"));
        assert!(follow_on.chat_has_title);
        assert_eq!(follow_on.message_id, "q1");
        // History: original user + assistant reply + combined message.
        assert_eq!(follow_on.message_history.len(), 3);
        assert_eq!(follow_on.message_history[1].role, Role::Assistant);
        assert_eq!(
            follow_on.message_history[1].content.as_text(),
            Some("the reply")
        );
    }

    #[test]
    fn queue_collapse_skips_malformed_entries() {
        let request = request_with("c3", vec![message(Role::User, "hi", 1)]);
        let pre = PreprocessingResult::default();

        let empty = request_with("c3", vec![]);
        let mut ok = request_with("c3", vec![message(Role::User, "still here", 2)]);
        ok.message_id = "q-ok".into();

        let follow_on =
            build_follow_on_request(&request, &pre, "reply", vec![empty, ok]).unwrap();
        assert_eq!(
            follow_on.last_user_message_text().as_deref(),
            Some("still here")
        );
        assert_eq!(follow_on.message_id, "q-ok");
    }

    #[test]
    fn queue_collapse_with_no_usable_content_is_none() {
        let request = request_with("c4", vec![message(Role::User, "hi", 1)]);
        let pre = PreprocessingResult::default();
        let empty = request_with("c4", vec![]);
        assert!(build_follow_on_request(&request, &pre, "reply", vec![empty]).is_none());
    }
}
