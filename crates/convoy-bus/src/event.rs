//! Wire events carried by the stream bus.
//!
//! The `type` tag and field names are the client contract; renames here are
//! protocol changes.

use serde::{Deserialize, Serialize};

use convoy_core::types::SuggestedMemory;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    AiMessageChunk(ChunkEvent),
    AiProcessingStartedEvent(TypingStartedEvent),
    PostProcessingCompleted(PostProcessingEvent),
    ChatMessageAdded(MessagePersistedEvent),
}

/// One increment of the assistant's reply on `chat_stream::<chat_id>`.
///
/// `full_content_so_far` is the running concatenation, so consumers joining
/// late (or seeing duplicates after a broker restart) recover by keeping
/// the highest `sequence`. The final marker sets `is_final_chunk` and
/// carries no content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkEvent {
    pub task_id: String,
    pub chat_id: String,
    /// Id of the assistant message being generated (equals the task id).
    pub message_id: String,
    /// Id of the user message that triggered this reply.
    pub user_message_id: String,
    pub full_content_so_far: String,
    pub sequence: u64,
    pub is_final_chunk: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub interrupted_by_soft_limit: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub interrupted_by_revocation: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

/// Lifecycle: the assistant started working on a turn.
///
/// `title` and `icon_names` are present only together, and only on the
/// first turn of a chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingStartedEvent {
    pub task_id: String,
    pub chat_id: String,
    pub user_id: String,
    pub user_id_hash: String,
    pub user_message_id: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_names: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostProcessingEvent {
    pub task_id: String,
    pub chat_id: String,
    pub user_id: String,
    pub user_id_hash: String,
    pub follow_up_request_suggestions: Vec<String>,
    pub new_chat_request_suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_summary: Option<String>,
    pub chat_tags: Vec<String>,
    pub harmful_response: bool,
    pub top_recommended_apps_for_user: Vec<String>,
    pub suggested_settings_memories: Vec<SuggestedMemory>,
}

/// The assistant message was saved; clients bump their cache to
/// `messages_version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePersistedEvent {
    pub task_id: String,
    pub chat_id: String,
    pub message_id: String,
    pub messages_version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_event_wire_tag() {
        let event = BusEvent::AiMessageChunk(ChunkEvent {
            task_id: "t".into(),
            chat_id: "c".into(),
            message_id: "t".into(),
            user_message_id: "m".into(),
            full_content_so_far: "Hi".into(),
            sequence: 1,
            ..Default::default()
        });
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], "ai_message_chunk");
        assert_eq!(wire["full_content_so_far"], "Hi");
        // Interruption flags are omitted unless set.
        assert!(wire.get("interrupted_by_revocation").is_none());
    }

    #[test]
    fn final_marker_keeps_flags() {
        let event = BusEvent::AiMessageChunk(ChunkEvent {
            is_final_chunk: true,
            interrupted_by_revocation: true,
            ..Default::default()
        });
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["is_final_chunk"], true);
        assert_eq!(wire["interrupted_by_revocation"], true);
    }
}
