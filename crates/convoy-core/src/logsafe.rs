//! Metadata-only views of user data for logging.
//!
//! Message content, summaries, tags, and suggestions never appear in logs,
//! even in development; only counts and lengths do. Production
//! (`SERVER_ENVIRONMENT=production`) suppresses request logging entirely at
//! the call sites.

use serde_json::{json, Value};

use crate::types::{AskRequest, PostProcessingResult, PreprocessingResult};

const REDACTED: &str = "[REDACTED_CONTENT]";

/// Whether request metadata may be logged at all.
pub fn request_logging_enabled() -> bool {
    std::env::var("SERVER_ENVIRONMENT")
        .map(|v| v != "production")
        .unwrap_or(true)
}

/// Request view with per-message metadata instead of content.
pub fn request_for_logging(request: &AskRequest) -> Value {
    let messages: Vec<Value> = request
        .message_history
        .iter()
        .map(|m| {
            json!({
                "role": m.role,
                "category": m.category,
                "created_at": m.created_at,
                "content_length": m.content.char_len(),
            })
        })
        .collect();

    json!({
        "chat_id": request.chat_id,
        "message_id": request.message_id,
        "chat_has_title": request.chat_has_title,
        "is_incognito": request.is_incognito,
        "is_external": request.is_external,
        "mate_id": request.mate_id,
        "active_focus_id": request.active_focus_id,
        "message_history": {
            "count": request.message_history.len(),
            "messages": messages,
        },
    })
}

/// Preprocessing view with summary/tags/title reduced to lengths.
pub fn preprocessing_for_logging(result: &PreprocessingResult) -> Value {
    json!({
        "can_proceed": result.can_proceed,
        "rejection_reason": result.rejection_reason,
        "category": result.category,
        "complexity": result.complexity,
        "output_language": result.output_language,
        "selected_main_llm_model_id": result.selected_main_llm_model_id,
        "selected_mate_id": result.selected_mate_id,
        "relevant_app_skills": result.relevant_app_skills,
        "chat_summary": result.chat_summary.as_ref().map(|s| {
            json!({"length": s.chars().count(), "content": REDACTED})
        }),
        "chat_tags": {"count": result.chat_tags.len(), "content": REDACTED},
        "title": result.title.as_ref().map(|t| {
            json!({"length": t.chars().count(), "content": REDACTED})
        }),
    })
}

/// Postprocessing view with suggestion text reduced to lengths.
pub fn postprocessing_for_logging(result: &PostProcessingResult) -> Value {
    let lengths = |items: &[String]| -> Vec<Value> {
        items
            .iter()
            .map(|s| json!({"length": s.chars().count()}))
            .collect()
    };

    json!({
        "follow_up_request_suggestions": {
            "count": result.follow_up_request_suggestions.len(),
            "suggestions": lengths(&result.follow_up_request_suggestions),
            "content": REDACTED,
        },
        "new_chat_request_suggestions": {
            "count": result.new_chat_request_suggestions.len(),
            "suggestions": lengths(&result.new_chat_request_suggestions),
            "content": REDACTED,
        },
        "chat_summary": result.chat_summary.as_ref().map(|s| {
            json!({"length": s.chars().count(), "content": REDACTED})
        }),
        "harmful_response": result.harmful_response,
        "relevant_settings_memory_categories": result.relevant_settings_memory_categories,
        "suggested_settings_memories_count": result.suggested_settings_memories.len(),
    })
}

/// Response snippet for logs: length only.
pub fn response_snippet_for_logging(response: &str) -> String {
    format!("[Response length: {} chars, content: REDACTED]", response.chars().count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HistoryMessage, MessageContent, Role};
    use std::collections::BTreeMap;

    #[test]
    fn request_view_carries_no_content() {
        let request = AskRequest {
            chat_id: "c1".into(),
            message_id: "m1".into(),
            user_id: "u1".into(),
            user_id_hash: "h1".into(),
            message_history: vec![HistoryMessage {
                role: Role::User,
                content: MessageContent::Text("extremely secret text".into()),
                created_at: 0,
                sender_name: None,
                category: None,
            }],
            chat_has_title: false,
            is_incognito: false,
            is_external: false,
            mate_id: None,
            active_focus_id: None,
            user_preferences: BTreeMap::new(),
            app_settings_memories_metadata: None,
        };

        let rendered = request_for_logging(&request).to_string();
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("content_length"));
    }

    #[test]
    fn preprocessing_view_redacts_summary() {
        let result = PreprocessingResult {
            can_proceed: true,
            chat_summary: Some("user asked about rust".into()),
            chat_tags: vec!["rust".into()],
            ..Default::default()
        };
        let rendered = preprocessing_for_logging(&result).to_string();
        assert!(!rendered.contains("asked about"));
        assert!(rendered.contains("REDACTED"));
    }
}
