//! Request and result types shared across the pipeline stages.
//!
//! Everything here crosses a stage boundary, so the ad-hoc string "kinds" of
//! a dynamic runtime become closed enums with explicit unknown-value
//! handling at the edges (see the validation passes in `convoy-pipeline`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Two-letter ISO 639-1 codes the response language may be forced to.
pub const SUPPORTED_OUTPUT_LANGUAGES: [&str; 20] = [
    "en", "de", "zh", "es", "fr", "pt", "ru", "ja", "ko", "it", "tr", "vi", "id", "pl", "nl",
    "ar", "hi", "th", "cs", "sv",
];

/// Clamp an LLM-provided language code to the supported set, defaulting to "en".
pub fn normalize_output_language(lang: Option<&str>) -> String {
    match lang {
        Some(l) if SUPPORTED_OUTPUT_LANGUAGES.contains(&l) => l.to_string(),
        _ => "en".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// Message content is either plain text or a list of structured multimodal
/// blocks (images, files). Blocks are passed through opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<serde_json::Value>),
}

impl MessageContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(t) => Some(t),
            MessageContent::Blocks(_) => None,
        }
    }

    /// Flatten to a prompt-ready string. Structured blocks contribute their
    /// `text` fields; non-text blocks are skipped.
    pub fn to_prompt_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn char_len(&self) -> usize {
        match self {
            MessageContent::Text(t) => t.chars().count(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| b.to_string().chars().count())
                .sum(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: Role,
    pub content: MessageContent,
    /// Unix seconds. Within one request the history is chronologically
    /// non-decreasing in this field.
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// One assistant turn: the new user message plus its chat history.
///
/// Immutable inside the core except for two allowed mutations: user-input
/// sanitization may rewrite message content, and override parsing may strip
/// `@...` mention syntax from the last user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskRequest {
    pub chat_id: String,
    pub message_id: String,
    pub user_id: String,
    pub user_id_hash: String,
    pub message_history: Vec<HistoryMessage>,
    #[serde(default)]
    pub chat_has_title: bool,
    #[serde(default)]
    pub is_incognito: bool,
    #[serde(default)]
    pub is_external: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mate_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_focus_id: Option<String>,
    #[serde(default)]
    pub user_preferences: BTreeMap<String, serde_json::Value>,
    /// Client-supplied list of available settings/memories keys, each of the
    /// form `"<app_id>-<item_type>"`. The client is the source of truth; the
    /// preprocessor filters LLM selections against this set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_settings_memories_metadata: Option<Vec<String>>,
}

impl AskRequest {
    /// The content of the most recent user message, flattened to text.
    pub fn last_user_message_text(&self) -> Option<String> {
        self.message_history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.to_prompt_text())
    }

    /// The user's UI language from preferences, defaulting to English.
    pub fn user_system_language(&self) -> String {
        self.user_preferences
            .get("language")
            .and_then(|v| v.as_str())
            .unwrap_or("en")
            .to_string()
    }
}

/// Queued messages carry the same shape as a live request.
pub type QueuedMessage = AskRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    InsufficientCredits,
    HarmfulOrIllegalDetected,
    MisuseDetected,
    InternalErrorMissingUserId,
    InternalErrorUserDataNotFound,
    InternalErrorMissingInstructions,
    InternalErrorMissingMatesConfig,
    InternalErrorLlmPreprocessingFailed,
}

impl RejectionReason {
    /// Rejections that produce a system notice rather than an assistant
    /// bubble suppress the typing indicator.
    pub fn suppresses_typing(&self) -> bool {
        matches!(
            self,
            RejectionReason::InsufficientCredits
                | RejectionReason::InternalErrorLlmPreprocessingFailed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Complex,
}

impl Complexity {
    /// Unknown values fall back to Complex (the more capable model).
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        match raw {
            Some("simple") => Complexity::Simple,
            Some("complex") => Complexity::Complex,
            _ => Complexity::Complex,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskArea {
    Code,
    Math,
    Creative,
    Instruction,
    General,
}

impl TaskArea {
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        match raw {
            Some("code") => TaskArea::Code,
            Some("math") => TaskArea::Math,
            Some("creative") => TaskArea::Creative,
            Some("instruction") => TaskArea::Instruction,
            _ => TaskArea::General,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskArea::Code => "code",
            TaskArea::Math => "math",
            TaskArea::Creative => "creative",
            TaskArea::Instruction => "instruction",
            TaskArea::General => "general",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisclaimerKind {
    Financial,
    Medical,
    Legal,
    MentalHealth,
}

impl DisclaimerKind {
    /// Hard-coded category → disclaimer mapping. Deliberately not
    /// configurable: these exist for legal compliance.
    pub fn for_category(category: &str) -> Option<Self> {
        match category {
            "finance" => Some(DisclaimerKind::Financial),
            "medical_health" => Some(DisclaimerKind::Medical),
            "legal_law" => Some(DisclaimerKind::Legal),
            "life_coach_psychology" => Some(DisclaimerKind::MentalHealth),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DisclaimerKind::Financial => "financial",
            DisclaimerKind::Medical => "medical",
            DisclaimerKind::Legal => "legal",
            DisclaimerKind::MentalHealth => "mental_health",
        }
    }
}

/// Output of the preprocessing stage. Every enum-typed field is either valid
/// or has been remapped to its safe default before this struct is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessingResult {
    pub can_proceed: bool,
    pub rejection_reason: Option<RejectionReason>,
    pub error_message: Option<String>,

    pub harmful_or_illegal_score: Option<f64>,
    pub misuse_risk_score: Option<f64>,
    pub category: Option<String>,
    pub complexity: Option<Complexity>,
    pub llm_response_temp: Option<f64>,
    #[serde(default = "default_language")]
    pub output_language: String,

    pub load_app_settings_and_memories: Vec<String>,
    pub relevant_embedded_previews: Vec<String>,
    pub title: Option<String>,
    pub icon_names: Vec<String>,
    pub chat_summary: Option<String>,
    pub chat_tags: Vec<String>,
    pub relevant_app_skills: Vec<String>,
    pub relevant_focus_modes: Vec<String>,

    pub selected_mate_id: Option<String>,
    pub selected_main_llm_model_id: Option<String>,
    pub selected_main_llm_model_name: Option<String>,
    pub selected_secondary_model_id: Option<String>,
    pub selected_fallback_model_id: Option<String>,
    pub model_selection_reason: Option<String>,
    pub filtered_cn_models: bool,
    pub server_provider_name: Option<String>,
    pub server_region: Option<String>,

    pub requires_advice_disclaimer: Option<DisclaimerKind>,

    /// Raw tool-call arguments from the preprocessing LLM, kept for the
    /// debug recorder.
    pub raw_llm_response: Option<serde_json::Value>,
}

fn default_language() -> String {
    "en".to_string()
}

impl Default for PreprocessingResult {
    fn default() -> Self {
        Self {
            can_proceed: false,
            rejection_reason: None,
            error_message: None,
            harmful_or_illegal_score: None,
            misuse_risk_score: None,
            category: None,
            complexity: None,
            llm_response_temp: None,
            output_language: default_language(),
            load_app_settings_and_memories: Vec::new(),
            relevant_embedded_previews: Vec::new(),
            title: None,
            icon_names: Vec::new(),
            chat_summary: None,
            chat_tags: Vec::new(),
            relevant_app_skills: Vec::new(),
            relevant_focus_modes: Vec::new(),
            selected_mate_id: None,
            selected_main_llm_model_id: None,
            selected_main_llm_model_name: None,
            selected_secondary_model_id: None,
            selected_fallback_model_id: None,
            model_selection_reason: None,
            filtered_cn_models: false,
            server_provider_name: None,
            server_region: None,
            requires_advice_disclaimer: None,
            raw_llm_response: None,
        }
    }
}

impl PreprocessingResult {
    pub fn rejected(reason: RejectionReason, error_message: impl Into<String>) -> Self {
        Self {
            rejection_reason: Some(reason),
            error_message: Some(error_message.into()),
            ..Default::default()
        }
    }
}

/// A structured settings/memory entry suggested by postprocessing phase 2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedMemory {
    pub category: String,
    pub item_key: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostProcessingResult {
    pub follow_up_request_suggestions: Vec<String>,
    pub new_chat_request_suggestions: Vec<String>,
    /// May supersede the preprocessing summary (it has seen the latest
    /// exchange).
    pub chat_summary: Option<String>,
    pub harmful_response: bool,
    pub top_recommended_apps_for_user: Vec<String>,
    pub relevant_settings_memory_categories: Vec<String>,
    pub suggested_settings_memories: Vec<SuggestedMemory>,
}

/// Overrides parsed from `@mention` syntax in the last user message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserOverrides {
    pub model_id: Option<String>,
    pub model_provider: Option<String>,
    pub best_model_category: Option<String>,
    pub mate_id: Option<String>,
    pub skills: Vec<(String, String)>,
    pub focus_modes: Vec<(String, String)>,
}

impl UserOverrides {
    pub fn has_overrides(&self) -> bool {
        self.model_id.is_some()
            || self.model_provider.is_some()
            || self.best_model_category.is_some()
            || self.mate_id.is_some()
            || !self.skills.is_empty()
            || !self.focus_modes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedStatus {
    Processing,
    Ok,
    Error,
    Cancelled,
}

/// External auxiliary artifact (generated image, transcript, …) referenced
/// by id. The core does not own embed content but must transition dangling
/// `processing` embeds on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedRecord {
    pub embed_id: String,
    pub app_id: String,
    pub skill_id: String,
    pub status: EmbedStatus,
    pub hashed_chat_id: String,
    pub hashed_task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_language_falls_back_to_english() {
        assert_eq!(normalize_output_language(Some("de")), "de");
        assert_eq!(normalize_output_language(Some("xx")), "en");
        assert_eq!(normalize_output_language(None), "en");
    }

    #[test]
    fn complexity_unknown_is_complex() {
        assert_eq!(Complexity::parse_lenient(Some("simple")), Complexity::Simple);
        assert_eq!(Complexity::parse_lenient(Some("medium")), Complexity::Complex);
        assert_eq!(Complexity::parse_lenient(None), Complexity::Complex);
    }

    #[test]
    fn disclaimer_mapping_is_fixed() {
        assert_eq!(
            DisclaimerKind::for_category("finance"),
            Some(DisclaimerKind::Financial)
        );
        assert_eq!(
            DisclaimerKind::for_category("life_coach_psychology"),
            Some(DisclaimerKind::MentalHealth)
        );
        assert_eq!(DisclaimerKind::for_category("general_knowledge"), None);
    }

    #[test]
    fn untagged_content_roundtrips() {
        let text: MessageContent = serde_json::from_str("\"hello\"").unwrap();
        assert_eq!(text.as_text(), Some("hello"));

        let blocks: MessageContent =
            serde_json::from_str(r#"[{"type":"text","text":"hi"},{"type":"image","url":"x"}]"#)
                .unwrap();
        assert_eq!(blocks.to_prompt_text(), "hi");
    }

    #[test]
    fn last_user_message_skips_assistant_turns() {
        let req = AskRequest {
            chat_id: "c".into(),
            message_id: "m".into(),
            user_id: "u".into(),
            user_id_hash: "h".into(),
            message_history: vec![
                HistoryMessage {
                    role: Role::User,
                    content: MessageContent::Text("first".into()),
                    created_at: 1,
                    sender_name: None,
                    category: None,
                },
                HistoryMessage {
                    role: Role::Assistant,
                    content: MessageContent::Text("reply".into()),
                    created_at: 2,
                    sender_name: None,
                    category: None,
                },
                HistoryMessage {
                    role: Role::User,
                    content: MessageContent::Text("second".into()),
                    created_at: 3,
                    sender_name: None,
                    category: None,
                },
            ],
            chat_has_title: true,
            is_incognito: false,
            is_external: false,
            mate_id: None,
            active_focus_id: None,
            user_preferences: BTreeMap::new(),
            app_settings_memories_metadata: None,
        };
        assert_eq!(req.last_user_message_text().as_deref(), Some("second"));
    }
}
