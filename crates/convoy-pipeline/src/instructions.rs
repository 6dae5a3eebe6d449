//! Built-in instruction set: tool schemas and prompts for the three
//! stages, plus user-facing templates (rejection messages, disclaimers)
//! with per-language variants and an English fallback.
//!
//! Tool schemas use the `{"function": {"name", "parameters"}}` shape so the
//! preprocessor can prune one-shot fields (`title`, `icon_names`,
//! `category`) out of both `properties` and `required` on follow-up turns.

use serde_json::{json, Value};

use convoy_core::types::DisclaimerKind;

pub const PREPROCESS_TOOL_NAME: &str = "preprocess_request";
pub const POSTPROCESS_TOOL_NAME: &str = "postprocess_response";
pub const MEMORY_TOOL_NAME: &str = "suggest_settings_memories";

#[derive(Debug, Clone)]
pub struct InstructionSet {
    pub preprocess_tool: Value,
    pub preprocess_system_prompt: String,
    pub postprocess_tool: Value,
    pub postprocess_system_prompt: String,
    pub memory_tool: Value,
    pub memory_system_prompt: String,
}

impl Default for InstructionSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl InstructionSet {
    pub fn builtin() -> Self {
        Self {
            preprocess_tool: preprocess_tool(),
            preprocess_system_prompt: PREPROCESS_SYSTEM_PROMPT.to_string(),
            postprocess_tool: postprocess_tool(),
            postprocess_system_prompt: POSTPROCESS_SYSTEM_PROMPT.to_string(),
            memory_tool: memory_tool(),
            memory_system_prompt: MEMORY_SYSTEM_PROMPT.to_string(),
        }
    }
}

const PREPROCESS_SYSTEM_PROMPT: &str = "\
You are the gatekeeper stage of an AI assistant. Analyze the conversation \
and call the preprocess_request tool exactly once with your analysis. \
Score harmfulness and misuse risk honestly, classify the request into one \
of the available categories, estimate complexity and task area, detect the \
user's language, select relevant skills and focus modes from the available \
lists only, and summarize the chat so far in at most 20 words.";

const POSTPROCESS_SYSTEM_PROMPT: &str = "\
The assistant just answered the user. Call the postprocess_response tool \
exactly once with follow-up suggestions the user might send next in this \
chat, fresh new-chat suggestions, a refined chat summary, whether the \
response itself was harmful, app recommendations, and which \
settings/memory categories (if any) this exchange revealed information \
worth remembering for.";

const MEMORY_SYSTEM_PROMPT: &str = "\
Extract durable user facts from this exchange as structured entries. Call \
the suggest_settings_memories tool exactly once. Only use the provided \
category schemas; skip anything speculative or transient.";

fn preprocess_tool() -> Value {
    json!({
        "function": {
            "name": PREPROCESS_TOOL_NAME,
            "description": "Report the analysis of the user's request.",
            "parameters": {
                "type": "object",
                "properties": {
                    "harmful_or_illegal": {
                        "type": "number",
                        "description": "0-10 score for harmful or illegal intent."
                    },
                    "misuse_risk": {
                        "type": "number",
                        "description": "0-10 score for scams, spam or platform misuse."
                    },
                    "category": {
                        "type": "string",
                        "description": "Topic category of the request. Must be one of the available categories."
                    },
                    "complexity": {
                        "type": "string",
                        "enum": ["simple", "complex"],
                        "description": "How capable a model this request needs."
                    },
                    "task_area": {
                        "type": "string",
                        "enum": ["code", "math", "creative", "instruction", "general"],
                        "description": "Dominant task area, used for model selection."
                    },
                    "user_unhappy": {
                        "type": "boolean",
                        "description": "True when the user is dissatisfied with previous answers."
                    },
                    "china_model_sensitive": {
                        "type": "boolean",
                        "description": "True when the topic is politically sensitive for China-origin models."
                    },
                    "llm_response_temp": {
                        "type": "number",
                        "description": "Suggested sampling temperature for the reply, 0.0-2.0."
                    },
                    "output_language": {
                        "type": "string",
                        "description": "ISO 639-1 code of the language the reply should use."
                    },
                    "load_app_settings_and_memories": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Settings/memories keys worth loading, format 'app_id:item_key'. Only keys from the available list."
                    },
                    "relevant_embedded_previews": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Embedded preview types the reply may need (code, math, music, ...)."
                    },
                    "relevant_app_skills": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Skill identifiers ('app_id-skill_id') likely useful for this turn. Only from the available list."
                    },
                    "relevant_focus_modes": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Focus mode identifiers ('app_id-focus_id') that could help."
                    },
                    "title": {
                        "type": "string",
                        "description": "Short chat title, first message only."
                    },
                    "icon_names": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "1-3 icon names matching the request topic, first message only."
                    },
                    "chat_summary": {
                        "type": "string",
                        "description": "Summary of the full conversation so far, max 20 words."
                    },
                    "chat_tags": {
                        "type": "array",
                        "items": {"type": "string"},
                        "maxItems": 10,
                        "description": "Up to 10 tags for categorization and search."
                    }
                },
                "required": [
                    "harmful_or_illegal", "misuse_risk", "category", "complexity",
                    "task_area", "china_model_sensitive", "llm_response_temp",
                    "output_language", "chat_summary", "title", "icon_names"
                ]
            }
        }
    })
}

fn postprocess_tool() -> Value {
    json!({
        "function": {
            "name": POSTPROCESS_TOOL_NAME,
            "description": "Report suggestions and metadata for the completed exchange.",
            "parameters": {
                "type": "object",
                "properties": {
                    "follow_up_request_suggestions": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "2-4 short messages the user might plausibly send next, in the chat's language."
                    },
                    "new_chat_request_suggestions": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "2-4 fresh conversation starters, in the user's system language."
                    },
                    "chat_summary": {
                        "type": "string",
                        "description": "Refined chat summary including the latest exchange, max 20 words."
                    },
                    "harmful_response": {
                        "type": "boolean",
                        "description": "True when the assistant response itself is harmful."
                    },
                    "top_recommended_apps_for_user": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "App ids the user would benefit from, from the available list."
                    },
                    "relevant_settings_memory_categories": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Settings/memory category ids this exchange revealed durable information for."
                    }
                },
                "required": [
                    "follow_up_request_suggestions", "new_chat_request_suggestions",
                    "chat_summary", "harmful_response"
                ]
            }
        }
    })
}

fn memory_tool() -> Value {
    json!({
        "function": {
            "name": MEMORY_TOOL_NAME,
            "description": "Report structured settings/memory entries extracted from the exchange.",
            "parameters": {
                "type": "object",
                "properties": {
                    "entries": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "category": {"type": "string"},
                                "item_key": {"type": "string"},
                                "value": {}
                            },
                            "required": ["category", "item_key", "value"]
                        }
                    }
                },
                "required": ["entries"]
            }
        }
    })
}

/// Translated "insufficient credits" message; English is the fallback.
pub fn insufficient_credits_message(lang: &str) -> &'static str {
    match lang {
        "de" => {
            "Du hast nicht genügend Guthaben für diese Anfrage. Bitte kaufe \
             mehr Guthaben oder aktiviere die automatische Aufladung mit \
             einer gültigen Zahlungsmethode."
        }
        "fr" => {
            "Vous n'avez pas assez de crédits pour cette demande. Achetez \
             des crédits ou activez la recharge automatique avec un moyen \
             de paiement valide."
        }
        "es" => {
            "No tienes créditos suficientes para esta solicitud. Compra más \
             créditos o activa la recarga automática con un método de pago \
             válido."
        }
        _ => {
            "You don't have enough credits to complete this request. Please \
             buy more credits or activate auto top-up with a valid payment \
             method."
        }
    }
}

/// Advice disclaimer appended after the response for sensitive categories.
pub fn disclaimer_text(kind: DisclaimerKind, lang: &str) -> &'static str {
    match (kind, lang) {
        (DisclaimerKind::Financial, "de") => {
            "Hinweis: Dies ist keine Finanzberatung. Sprich für \
             Anlageentscheidungen mit einer zugelassenen Fachperson."
        }
        (DisclaimerKind::Financial, _) => {
            "Note: This is not financial advice. For investment decisions, \
             consult a licensed professional."
        }
        (DisclaimerKind::Medical, "de") => {
            "Hinweis: Dies ersetzt keine ärztliche Beratung. Wende dich bei \
             gesundheitlichen Fragen an medizinisches Fachpersonal."
        }
        (DisclaimerKind::Medical, _) => {
            "Note: This does not replace medical advice. For health \
             concerns, consult a medical professional."
        }
        (DisclaimerKind::Legal, _) => {
            "Note: This is not legal advice. For legal matters, consult a \
             qualified attorney in your jurisdiction."
        }
        (DisclaimerKind::MentalHealth, _) => {
            "Note: This is not a substitute for professional mental health \
             support. If you are struggling, please reach out to a \
             qualified professional or a local support line."
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocess_tool_has_prunable_one_shot_fields() {
        let tool = preprocess_tool();
        let props = &tool["function"]["parameters"]["properties"];
        assert!(props.get("title").is_some());
        assert!(props.get("icon_names").is_some());
        assert!(props.get("category").is_some());
        let required = tool["function"]["parameters"]["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v == "chat_summary"));
    }

    #[test]
    fn credits_message_falls_back_to_english() {
        assert!(insufficient_credits_message("xx").contains("credits"));
        assert!(insufficient_credits_message("de").contains("Guthaben"));
    }

    #[test]
    fn every_disclaimer_kind_has_text() {
        for kind in [
            DisclaimerKind::Financial,
            DisclaimerKind::Medical,
            DisclaimerKind::Legal,
            DisclaimerKind::MentalHealth,
        ] {
            assert!(!disclaimer_text(kind, "en").is_empty());
        }
    }
}
