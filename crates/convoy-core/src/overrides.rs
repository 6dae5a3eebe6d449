//! `@mention` override syntax in user messages.
//!
//! Users can pin a model, persona, skill, or focus mode for a single turn:
//!
//! - `@ai-model:claude-sonnet-4-5` / `@ai-model:gpt-x:openai` /
//!   `@ai-model:openai/gpt-x`
//! - `@best-model:coding` — top leaderboard entry for a category
//! - `@mate:sophia` or `@mate:software_development` (id or category)
//! - `@skill:web:search`
//! - `@focus:research:deep_dive`
//!
//! The mention syntax is stripped from the message so the LLM sees the
//! actual query.

use regex::Regex;
use std::sync::OnceLock;

use crate::types::{AskRequest, MessageContent, Role, UserOverrides};

fn mention_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"@(ai-model|best-model|mate|skill|focus):(\S+)").expect("static regex")
    })
}

/// Parse overrides out of a message body, returning the overrides and the
/// cleaned text with mention syntax removed.
pub fn parse_overrides(content: &str) -> (UserOverrides, String) {
    let mut overrides = UserOverrides::default();
    let re = mention_regex();

    for caps in re.captures_iter(content) {
        let kind = &caps[1];
        let value = &caps[2];
        match kind {
            "ai-model" => {
                if value.contains('/') {
                    // Full "provider/model" reference, taken as-is.
                    overrides.model_id = Some(value.to_string());
                    overrides.model_provider = None;
                } else if let Some((model, provider)) = value.split_once(':') {
                    overrides.model_id = Some(model.to_string());
                    overrides.model_provider = Some(provider.to_string());
                } else {
                    overrides.model_id = Some(value.to_string());
                }
            }
            "best-model" => overrides.best_model_category = Some(value.to_string()),
            "mate" => overrides.mate_id = Some(value.to_string()),
            "skill" => {
                if let Some((app, skill)) = value.split_once(':') {
                    overrides.skills.push((app.to_string(), skill.to_string()));
                } else {
                    tracing::warn!(mention = value, "ignoring @skill without app:skill form");
                }
            }
            "focus" => {
                if let Some((app, focus)) = value.split_once(':') {
                    overrides
                        .focus_modes
                        .push((app.to_string(), focus.to_string()));
                } else {
                    tracing::warn!(mention = value, "ignoring @focus without app:focus form");
                }
            }
            _ => unreachable!("regex alternatives are exhaustive"),
        }
    }

    let cleaned = re.replace_all(content, "");
    let cleaned = collapse_whitespace(&cleaned);
    (overrides, cleaned)
}

/// Parse overrides from the last user message of a request, rewriting that
/// message's content in place with the mention syntax removed. This is one
/// of the two allowed mutations of an [`AskRequest`].
pub fn parse_overrides_from_request(request: &mut AskRequest) -> UserOverrides {
    let Some(last_user) = request
        .message_history
        .iter_mut()
        .rev()
        .find(|m| m.role == Role::User)
    else {
        return UserOverrides::default();
    };

    let MessageContent::Text(text) = &last_user.content else {
        // Structured blocks never carry mention syntax from our clients.
        return UserOverrides::default();
    };

    let (overrides, cleaned) = parse_overrides(text);
    if overrides.has_overrides() {
        last_user.content = MessageContent::Text(cleaned);
    }
    overrides
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_space = false;
    for c in s.chars() {
        if c == ' ' {
            if !last_was_space {
                out.push(c);
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_model_reference() {
        let (o, cleaned) = parse_overrides("@ai-model:openai/gpt-x what is rust?");
        assert_eq!(o.model_id.as_deref(), Some("openai/gpt-x"));
        assert!(o.model_provider.is_none());
        assert_eq!(cleaned, "what is rust?");
    }

    #[test]
    fn parses_model_with_provider_suffix() {
        let (o, _) = parse_overrides("@ai-model:claude-sonnet-4-5:anthropic hi");
        assert_eq!(o.model_id.as_deref(), Some("claude-sonnet-4-5"));
        assert_eq!(o.model_provider.as_deref(), Some("anthropic"));
    }

    #[test]
    fn parses_best_model_and_mate() {
        let (o, cleaned) = parse_overrides("@best-model:coding @mate:sophia review this");
        assert_eq!(o.best_model_category.as_deref(), Some("coding"));
        assert_eq!(o.mate_id.as_deref(), Some("sophia"));
        assert_eq!(cleaned, "review this");
        assert!(o.has_overrides());
    }

    #[test]
    fn parses_skills_and_focus_modes() {
        let (o, _) = parse_overrides("@skill:web:search @focus:research:deep_dive go");
        assert_eq!(o.skills, vec![("web".to_string(), "search".to_string())]);
        assert_eq!(
            o.focus_modes,
            vec![("research".to_string(), "deep_dive".to_string())]
        );
    }

    #[test]
    fn malformed_skill_mention_is_dropped() {
        let (o, _) = parse_overrides("@skill:websearch go");
        assert!(o.skills.is_empty());
    }

    #[test]
    fn plain_text_has_no_overrides() {
        let (o, cleaned) = parse_overrides("email me at user@example.com");
        assert!(!o.has_overrides());
        assert_eq!(cleaned, "email me at user@example.com");
    }
}
