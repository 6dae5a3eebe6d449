//! Skill invocation over HTTP with retry, cancellation, rate limiting,
//! and batched fan-out.
//!
//! Retries use a fresh client per attempt so geo-proxied upstreams rotate
//! IPs; 4xx never retries, 5xx/timeout/network retries once after a short
//! delay. Cancellation is checked before every attempt and re-checked after
//! a successful response, because the user may have cancelled while the
//! request was in flight.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use convoy_kv::CancellationFlags;

use crate::dispatch::{TaskDispatcher, TaskEnvelope, TaskHandler, TaskResult};
use crate::rate_limit::{DeferralContext, RateLimitOutcome, RateLimiter};
use crate::registry::SkillRegistry;
use crate::sanitizer::{ContentSanitizer, SanitizeOutcome};

pub const DEFAULT_SKILL_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_SKILL_MAX_RETRIES: u32 = 1;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Maximum parallel requests folded into one batched skill call.
pub const MAX_PARALLEL_REQUESTS: usize = 5;

#[derive(Debug, Clone, Error)]
pub enum SkillError {
    #[error("unknown skill '{0}'")]
    UnknownSkill(String),

    #[error("skill returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("skill timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("response decode error: {0}")]
    Decode(String),

    #[error("empty requests array")]
    EmptyRequests,

    #[error("external content sanitization failed")]
    Sanitization,
}

/// Result of one skill invocation. Cancellation and rate-limit scheduling
/// are ordinary variants, not errors: the tool loop proceeds past them.
#[derive(Debug)]
pub enum SkillOutcome {
    Ok(Value),
    Cancelled,
    /// The sanitizer flagged the result as high-risk; it has been dropped.
    Blocked,
    /// Execution was deferred through the dispatcher due to a rate limit.
    Scheduled { task_id: String },
    Failed(SkillError),
}

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub timeout: Duration,
    pub max_retries: u32,
    pub chat_id: Option<String>,
    pub message_id: Option<String>,
    pub user_id: Option<String>,
    /// Fresh UUID per invocation; drives per-invocation cancellation.
    pub skill_task_id: Option<String>,
    /// Allow long rate-limit waits to reschedule through the dispatcher.
    pub defer_on_rate_limit: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SKILL_TIMEOUT,
            max_retries: DEFAULT_SKILL_MAX_RETRIES,
            chat_id: None,
            message_id: None,
            user_id: None,
            skill_task_id: None,
            defer_on_rate_limit: false,
        }
    }
}

pub struct SkillExecutor {
    registry: Arc<SkillRegistry>,
    flags: CancellationFlags,
    rate_limiter: RateLimiter,
    sanitizer: Arc<ContentSanitizer>,
    dispatcher: OnceLock<Arc<TaskDispatcher>>,
    deferral_followup: OnceLock<Arc<dyn TaskHandler>>,
}

impl SkillExecutor {
    pub fn new(
        registry: Arc<SkillRegistry>,
        flags: CancellationFlags,
        rate_limiter: RateLimiter,
        sanitizer: Arc<ContentSanitizer>,
    ) -> Self {
        Self {
            registry,
            flags,
            rate_limiter,
            sanitizer,
            dispatcher: OnceLock::new(),
            deferral_followup: OnceLock::new(),
        }
    }

    /// Wire the dispatcher after construction (the dispatcher's default
    /// handler points back at this executor).
    pub fn set_dispatcher(&self, dispatcher: Arc<TaskDispatcher>) {
        let _ = self.dispatcher.set(dispatcher);
    }

    /// Follow-up run after a rate-limit-deferred skill completes.
    pub fn set_deferral_followup(&self, followup: Arc<dyn TaskHandler>) {
        let _ = self.deferral_followup.set(followup);
    }

    pub fn cancellation_flags(&self) -> &CancellationFlags {
        &self.flags
    }

    /// Execute one skill call.
    pub async fn execute(
        &self,
        app_id: &str,
        skill_id: &str,
        arguments: Value,
        opts: &ExecuteOptions,
    ) -> SkillOutcome {
        // Cancelled before we even started: nothing to do.
        if let Some(id) = &opts.skill_task_id {
            if self.flags.is_cancelled(id).await {
                info!(app_id, skill_id, skill_task_id = %id, "skill cancelled before execution");
                return SkillOutcome::Cancelled;
            }
        }

        let identifier = format!("{app_id}-{skill_id}");
        let Some(spec) = self.registry.get(&identifier) else {
            return SkillOutcome::Failed(SkillError::UnknownSkill(identifier));
        };

        if let Some(provider) = spec.provider.clone() {
            let deferral = if opts.defer_on_rate_limit {
                self.dispatcher.get().map(|dispatcher| DeferralContext {
                    dispatcher: Arc::clone(dispatcher),
                    app_id: app_id.to_string(),
                    skill_id: skill_id.to_string(),
                    arguments: arguments.clone(),
                    chat_id: opts.chat_id.clone(),
                    message_id: opts.message_id.clone(),
                    followup: self.deferral_followup.get().cloned(),
                })
            } else {
                None
            };
            let outcome = self
                .rate_limiter
                .wait(&provider, skill_id, spec.rate_limit_model.as_deref(), deferral)
                .await;
            if let RateLimitOutcome::Scheduled { task_id } = outcome {
                return SkillOutcome::Scheduled { task_id };
            }
        }

        let mut body = match arguments {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        // Underscore prefix marks request metadata, not skill arguments.
        if let Some(chat_id) = &opts.chat_id {
            body.insert("_chat_id".to_string(), json!(chat_id));
        }
        if let Some(message_id) = &opts.message_id {
            body.insert("_message_id".to_string(), json!(message_id));
        }
        if let Some(user_id) = &opts.user_id {
            body.insert("_user_id".to_string(), json!(user_id));
        }
        let body = Value::Object(body);
        let endpoint = spec.endpoint.clone();
        let external_content = spec.external_content;

        let total_attempts = opts.max_retries + 1;
        let mut last_error = SkillError::Network("no attempt made".to_string());

        for attempt in 0..total_attempts {
            if attempt > 0 {
                if let Some(id) = &opts.skill_task_id {
                    if self.flags.is_cancelled(id).await {
                        info!(app_id, skill_id, "skill cancelled before retry");
                        return SkillOutcome::Cancelled;
                    }
                }
                debug!(app_id, skill_id, attempt, "retrying skill with fresh connection");
                tokio::time::sleep(RETRY_DELAY).await;
            }

            // Fresh client per attempt so an upstream proxy rotates IPs.
            let client = match reqwest::Client::builder().timeout(opts.timeout).build() {
                Ok(c) => c,
                Err(e) => return SkillOutcome::Failed(SkillError::Network(e.to_string())),
            };

            match client.post(&endpoint).json(&body).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        // Cancellation may have landed while the request
                        // was in flight; discard the result if so.
                        if let Some(id) = &opts.skill_task_id {
                            if self.flags.is_cancelled(id).await {
                                info!(app_id, skill_id, "skill cancelled after execution, discarding result");
                                return SkillOutcome::Cancelled;
                            }
                        }
                        let result = match response.json::<Value>().await {
                            Ok(v) => v,
                            Err(_) => json!({"content": ""}),
                        };
                        if external_content {
                            return self.sanitize_result(app_id, skill_id, result, opts).await;
                        }
                        return SkillOutcome::Ok(result);
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    if status.is_client_error() {
                        // 4xx is our bug or a bad argument: retrying won't help.
                        return SkillOutcome::Failed(SkillError::Status {
                            status: status.as_u16(),
                            body: truncate(&body_text, 512),
                        });
                    }
                    warn!(app_id, skill_id, %status, attempt, "skill returned server error");
                    last_error = SkillError::Status {
                        status: status.as_u16(),
                        body: truncate(&body_text, 512),
                    };
                }
                Err(e) if e.is_timeout() => {
                    warn!(app_id, skill_id, attempt, "skill timed out");
                    last_error = SkillError::Timeout {
                        secs: opts.timeout.as_secs(),
                    };
                }
                Err(e) => {
                    warn!(app_id, skill_id, attempt, error = %e, "skill network error");
                    last_error = SkillError::Network(e.to_string());
                }
            }
        }

        warn!(app_id, skill_id, attempts = total_attempts, error = %last_error, "skill failed after all attempts");
        SkillOutcome::Failed(last_error)
    }

    /// Execute with batched-input detection: a `requests` array (or the
    /// legacy "some argument is a list" shape) becomes ONE call carrying
    /// the full `requests` array, truncated to [`MAX_PARALLEL_REQUESTS`];
    /// the skill fans out internally.
    pub async fn execute_batched(
        &self,
        app_id: &str,
        skill_id: &str,
        arguments: Value,
        opts: &ExecuteOptions,
    ) -> Vec<SkillOutcome> {
        match plan_batch(arguments) {
            BatchPlan::Empty => vec![SkillOutcome::Failed(SkillError::EmptyRequests)],
            BatchPlan::Single(args) => vec![self.execute(app_id, skill_id, args, opts).await],
            BatchPlan::Batched { args, truncated_from } => {
                if let Some(original) = truncated_from {
                    warn!(
                        app_id,
                        skill_id,
                        original,
                        limit = MAX_PARALLEL_REQUESTS,
                        "truncating batched skill requests"
                    );
                }
                vec![self.execute(app_id, skill_id, args, opts).await]
            }
        }
    }

    async fn sanitize_result(
        &self,
        app_id: &str,
        skill_id: &str,
        result: Value,
        opts: &ExecuteOptions,
    ) -> SkillOutcome {
        let context_id = opts
            .skill_task_id
            .clone()
            .unwrap_or_else(|| format!("{app_id}-{skill_id}"));
        let serialized = result.to_string();
        match self
            .sanitizer
            .sanitize(&serialized, "skill_result", &context_id)
            .await
        {
            SanitizeOutcome::Clean(clean) => match serde_json::from_str::<Value>(&clean) {
                Ok(v) => SkillOutcome::Ok(v),
                Err(e) => SkillOutcome::Failed(SkillError::Decode(e.to_string())),
            },
            SanitizeOutcome::Blocked => SkillOutcome::Blocked,
            SanitizeOutcome::Failed => SkillOutcome::Failed(SkillError::Sanitization),
        }
    }
}

enum BatchPlan {
    Single(Value),
    Batched {
        args: Value,
        /// Original request count when truncation happened.
        truncated_from: Option<usize>,
    },
    Empty,
}

/// Normalize batched-input shapes. The standard form is a `requests`
/// array; the legacy form puts a list where a scalar belongs
/// (`{"query": ["a", "b"]}`) and is converted to the standard form.
fn plan_batch(arguments: Value) -> BatchPlan {
    let Value::Object(map) = &arguments else {
        return BatchPlan::Single(arguments);
    };

    if let Some(Value::Array(requests)) = map.get("requests") {
        return match requests.len() {
            0 => BatchPlan::Empty,
            1 => BatchPlan::Single(arguments),
            n if n > MAX_PARALLEL_REQUESTS => {
                let mut truncated = map.clone();
                truncated.insert(
                    "requests".to_string(),
                    Value::Array(requests[..MAX_PARALLEL_REQUESTS].to_vec()),
                );
                BatchPlan::Batched {
                    args: Value::Object(truncated),
                    truncated_from: Some(n),
                }
            }
            _ => BatchPlan::Batched {
                args: arguments,
                truncated_from: None,
            },
        };
    }

    // Legacy shape: first argument holding a multi-element list fans out.
    for (key, value) in map {
        if let Value::Array(items) = value {
            if items.len() > 1 {
                let original = items.len();
                let take = items.len().min(MAX_PARALLEL_REQUESTS);
                let requests: Vec<Value> = items[..take]
                    .iter()
                    .map(|item| {
                        let mut one = map.clone();
                        one.insert(key.clone(), item.clone());
                        Value::Object(one)
                    })
                    .collect();
                return BatchPlan::Batched {
                    args: json!({ "requests": requests }),
                    truncated_from: (original > MAX_PARALLEL_REQUESTS).then_some(original),
                };
            }
        }
    }

    BatchPlan::Single(arguments)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let cut = s
        .char_indices()
        .take_while(|(i, _)| *i <= max)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(0);
    format!("{}…", &s[..cut])
}

/// Default dispatcher handler: every `apps.<app>.tasks.skill_<skill>` task
/// that has no dedicated handler is an HTTP skill call.
pub struct HttpSkillHandler {
    executor: Arc<SkillExecutor>,
}

impl HttpSkillHandler {
    pub fn new(executor: Arc<SkillExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl TaskHandler for HttpSkillHandler {
    async fn run(&self, task: &TaskEnvelope) -> TaskResult {
        let (app_id, skill_id) = parse_task_name(&task.name)
            .ok_or_else(|| format!("unroutable task name '{}'", task.name))?;
        let arguments = task.kwargs.get("arguments").cloned().unwrap_or(Value::Null);
        let opts = ExecuteOptions {
            chat_id: task
                .kwargs
                .get("_chat_id")
                .and_then(|v| v.as_str())
                .map(String::from),
            message_id: task
                .kwargs
                .get("_message_id")
                .and_then(|v| v.as_str())
                .map(String::from),
            ..Default::default()
        };
        match self
            .executor
            .execute_batched(&app_id, &skill_id, arguments, &opts)
            .await
            .remove(0)
        {
            SkillOutcome::Ok(v) => Ok(v),
            SkillOutcome::Cancelled => Ok(json!({"cancelled": true})),
            SkillOutcome::Blocked => Ok(json!({"blocked": true})),
            SkillOutcome::Scheduled { task_id } => Ok(json!({"scheduled_task_id": task_id})),
            SkillOutcome::Failed(e) => Err(e.to_string()),
        }
    }
}

fn parse_task_name(name: &str) -> Option<(String, String)> {
    let rest = name.strip_prefix("apps.")?;
    let (app_id, tail) = rest.split_once('.')?;
    let skill_id = tail.strip_prefix("tasks.skill_")?;
    Some((app_id.to_string(), skill_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::config::ConvoyConfig;
    use convoy_kv::MemoryStore;
    use convoy_model::ScriptedGateway;
    use std::collections::BTreeMap;

    fn executor() -> SkillExecutor {
        let store: Arc<dyn convoy_kv::KvStore> = Arc::new(MemoryStore::new());
        let config = Arc::new(ConvoyConfig::default());
        let mut apps = BTreeMap::new();
        apps.insert(
            "web".to_string(),
            convoy_core::config::AppManifest {
                name: None,
                skills: vec![convoy_core::config::SkillManifest {
                    id: "search".into(),
                    name: None,
                    description: None,
                    preprocessor_hint: None,
                    external_content: false,
                    input_schema: None,
                    provider: None,
                    rate_limit_model: None,
                }],
                focuses: Vec::new(),
                settings_memory_categories: Vec::new(),
            },
        );
        let registry = Arc::new(SkillRegistry::from_manifests(&apps));
        SkillExecutor::new(
            registry,
            CancellationFlags::new(Arc::clone(&store)),
            RateLimiter::new(Arc::clone(&store), config),
            Arc::new(ContentSanitizer::new(
                Arc::new(ScriptedGateway::new()),
                "m/s".into(),
            )),
        )
    }

    #[tokio::test]
    async fn cancelled_before_execution_short_circuits() {
        let exec = executor();
        exec.cancellation_flags().cancel("st-1").await.unwrap();
        let opts = ExecuteOptions {
            skill_task_id: Some("st-1".into()),
            ..Default::default()
        };
        let outcome = exec
            .execute("web", "search", json!({"query": "x"}), &opts)
            .await;
        assert!(matches!(outcome, SkillOutcome::Cancelled));
    }

    #[tokio::test]
    async fn unknown_skill_fails_without_network() {
        let exec = executor();
        let outcome = exec
            .execute("maps", "route", json!({}), &ExecuteOptions::default())
            .await;
        assert!(matches!(
            outcome,
            SkillOutcome::Failed(SkillError::UnknownSkill(_))
        ));
    }

    #[test]
    fn batch_of_seven_truncates_to_five() {
        let requests: Vec<Value> = (0..7).map(|i| json!({"query": i})).collect();
        match plan_batch(json!({ "requests": requests })) {
            BatchPlan::Batched {
                args,
                truncated_from,
            } => {
                assert_eq!(args["requests"].as_array().unwrap().len(), 5);
                assert_eq!(truncated_from, Some(7));
            }
            _ => panic!("expected batched plan"),
        }
    }

    #[test]
    fn single_request_array_stays_single() {
        match plan_batch(json!({"requests": [{"query": "a"}]})) {
            BatchPlan::Single(args) => {
                assert_eq!(args["requests"].as_array().unwrap().len(), 1);
            }
            _ => panic!("expected single plan"),
        }
    }

    #[test]
    fn empty_request_array_is_empty() {
        assert!(matches!(
            plan_batch(json!({"requests": []})),
            BatchPlan::Empty
        ));
    }

    #[test]
    fn legacy_list_converts_to_requests() {
        match plan_batch(json!({"query": ["a", "b", "c"]})) {
            BatchPlan::Batched {
                args,
                truncated_from,
            } => {
                let requests = args["requests"].as_array().unwrap();
                assert_eq!(requests.len(), 3);
                assert_eq!(requests[0]["query"], "a");
                assert_eq!(requests[2]["query"], "c");
                assert!(truncated_from.is_none());
            }
            _ => panic!("expected batched plan"),
        }
    }

    #[test]
    fn task_name_roundtrip() {
        assert_eq!(
            parse_task_name("apps.web.tasks.skill_search"),
            Some(("web".to_string(), "search".to_string()))
        );
        assert_eq!(parse_task_name("other.thing"), None);
    }
}
