//! Key formats for the shared store. Kept in one place so the wire layout
//! is auditable at a glance.

pub fn rate_limit(provider: &str, skill: &str, model: Option<&str>, second: i64) -> String {
    match model {
        Some(m) => format!("rate_limit:{provider}:{skill}:{m}:{second}"),
        None => format!("rate_limit:{provider}:{skill}:{second}"),
    }
}

pub fn cancelled_skill(skill_task_id: &str) -> String {
    format!("cancelled_skill:{skill_task_id}")
}

pub fn active_ai_task(chat_id: &str) -> String {
    format!("active_ai_task:{chat_id}")
}

pub fn chat_queue(chat_id: &str) -> String {
    format!("chat:{chat_id}:queued_messages")
}

pub fn chat_list_item_data(chat_id: &str) -> String {
    format!("chat:{chat_id}:list_item_data")
}

pub fn embed(embed_id: &str) -> String {
    format!("embed:{embed_id}")
}

pub const EMBED_PREFIX: &str = "embed:";

pub fn user(user_id: &str) -> String {
    format!("user:{user_id}")
}

pub fn debug_requests(user_id: &str) -> String {
    format!("debug:{user_id}:requests")
}
