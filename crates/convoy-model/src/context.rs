//! Token budgeting for prompt assembly.
//!
//! Uses the cheap ~4-characters-per-token estimate: exact tokenization is
//! not worth its cost here, the budget only needs to keep the prompt inside
//! the preprocessing model's context window.

use convoy_core::types::HistoryMessage;

const CHARS_PER_TOKEN: usize = 4;

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

fn message_tokens(msg: &HistoryMessage) -> usize {
    // Small fixed overhead per message for role/framing.
    4 + msg.content.char_len().div_ceil(CHARS_PER_TOKEN)
}

/// Keep the newest messages that fit within `max_tokens`, preserving
/// chronological order. The last message is always kept, even when it alone
/// exceeds the budget.
pub fn truncate_history_to_budget(
    history: &[HistoryMessage],
    max_tokens: usize,
) -> Vec<HistoryMessage> {
    let mut kept_rev: Vec<&HistoryMessage> = Vec::new();
    let mut used = 0usize;

    for msg in history.iter().rev() {
        let cost = message_tokens(msg);
        if !kept_rev.is_empty() && used + cost > max_tokens {
            break;
        }
        used += cost;
        kept_rev.push(msg);
    }

    let dropped = history.len() - kept_rev.len();
    if dropped > 0 {
        tracing::debug!(dropped, kept = kept_rev.len(), "truncated history to token budget");
    }

    kept_rev.into_iter().rev().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::types::{MessageContent, Role};

    fn msg(role: Role, text: &str, at: i64) -> HistoryMessage {
        HistoryMessage {
            role,
            content: MessageContent::Text(text.to_string()),
            created_at: at,
            sender_name: None,
            category: None,
        }
    }

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn keeps_tail_within_budget() {
        let history = vec![
            msg(Role::User, &"a".repeat(400), 1),
            msg(Role::Assistant, &"b".repeat(400), 2),
            msg(Role::User, &"c".repeat(40), 3),
        ];
        // Budget fits the last two messages only.
        let kept = truncate_history_to_budget(&history, 120);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].created_at, 2);
        assert_eq!(kept[1].created_at, 3);
    }

    #[test]
    fn last_message_survives_even_over_budget() {
        let history = vec![msg(Role::User, &"x".repeat(10_000), 1)];
        let kept = truncate_history_to_budget(&history, 10);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn full_history_kept_when_it_fits() {
        let history = vec![
            msg(Role::User, "hi", 1),
            msg(Role::Assistant, "hello", 2),
        ];
        let kept = truncate_history_to_budget(&history, 1000);
        assert_eq!(kept.len(), 2);
    }
}
