//! Provider rate limit enforcement.
//!
//! Sliding window at 1-second granularity: one counter per
//! `(provider, skill[, model], second)` with a 2-second TTL, atomically
//! incremented on every check. Requests are never rejected — short waits
//! sleep in place, long waits are rescheduled through the dispatcher so the
//! worker slot frees up.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use convoy_core::config::ConvoyConfig;
use convoy_kv::{keys, KvStore};

use crate::dispatch::{TaskDispatcher, TaskHandler};

/// Waits at or above this go through the dispatcher instead of sleeping.
const SCHEDULE_THRESHOLD_SECS: f64 = 2.0;
const MIN_RETRY_AFTER_SECS: f64 = 0.1;
const COUNTER_TTL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct RateLimitCheck {
    pub allowed: bool,
    /// Seconds until the next window opens; only set when not allowed.
    pub retry_after: Option<f64>,
}

/// Control-flow result of [`RateLimiter::wait`] — never an error.
#[derive(Debug)]
pub enum RateLimitOutcome {
    Allowed,
    DelayedShort { slept: Duration },
    Scheduled { task_id: String },
}

/// Everything needed to re-enqueue the skill invocation when the wait is
/// long enough to schedule instead of sleep.
pub struct DeferralContext {
    pub dispatcher: Arc<TaskDispatcher>,
    pub app_id: String,
    pub skill_id: String,
    pub arguments: serde_json::Value,
    pub chat_id: Option<String>,
    pub message_id: Option<String>,
    /// Runs when the deferred skill completes (publishes the user-facing
    /// continuation message).
    pub followup: Option<Arc<dyn TaskHandler>>,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    config: Arc<ConvoyConfig>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>, config: Arc<ConvoyConfig>) -> Self {
        Self { store, config }
    }

    /// Atomically count this request against the current second. Missing
    /// configuration or an unavailable backend allow the request: the
    /// upstream provider still enforces its own limits, ours is an
    /// optimization and a fairness aid.
    pub async fn check(
        &self,
        provider: &str,
        skill: &str,
        model: Option<&str>,
    ) -> RateLimitCheck {
        let Some(spec) = self.config.rate_limit_for(provider) else {
            warn!(provider, "no rate limit configuration, allowing request");
            return allowed();
        };
        let Some(requests_per_second) = spec.requests_per_second else {
            debug!(provider, "unlimited rate limit");
            return allowed();
        };

        let now = chrono::Utc::now();
        let current_second = now.timestamp();
        let key = keys::rate_limit(provider, skill, model, current_second);

        let count = match self.store.incr_and_expire(&key, COUNTER_TTL).await {
            Ok(count) => count,
            Err(e) => {
                warn!(provider, skill, error = %e, "rate counter unavailable, allowing request");
                return allowed();
            }
        };

        if count > requests_per_second as i64 {
            let elapsed_in_second =
                (now.timestamp_millis() - current_second * 1000) as f64 / 1000.0;
            let retry_after = (1.0 - elapsed_in_second).max(MIN_RETRY_AFTER_SECS);
            debug!(
                provider,
                skill,
                count,
                requests_per_second,
                retry_after,
                "rate limit exceeded"
            );
            return RateLimitCheck {
                allowed: false,
                retry_after: Some(retry_after),
            };
        }

        allowed()
    }

    /// Wait for the limit to clear. Short waits sleep and proceed
    /// regardless of the recheck (the window resets every second); long
    /// waits enqueue the invocation with a countdown and signal
    /// [`RateLimitOutcome::Scheduled`] so the caller can free its slot.
    pub async fn wait(
        &self,
        provider: &str,
        skill: &str,
        model: Option<&str>,
        deferral: Option<DeferralContext>,
    ) -> RateLimitOutcome {
        let check = self.check(provider, skill, model).await;
        if check.allowed {
            return RateLimitOutcome::Allowed;
        }
        let retry_after = check.retry_after.unwrap_or(MIN_RETRY_AFTER_SECS);

        if retry_after < SCHEDULE_THRESHOLD_SECS {
            let sleep_for = Duration::from_secs_f64(retry_after);
            tokio::time::sleep(sleep_for).await;
            let recheck = self.check(provider, skill, model).await;
            if !recheck.allowed {
                warn!(provider, skill, retry_after, "rate limit still active after short wait, proceeding anyway");
            }
            return RateLimitOutcome::DelayedShort { slept: sleep_for };
        }

        if let Some(ctx) = deferral {
            let countdown = Duration::from_secs(retry_after.ceil() as u64 + 1);
            let mut kwargs = json!({ "arguments": ctx.arguments });
            if let Some(chat_id) = &ctx.chat_id {
                kwargs["_chat_id"] = json!(chat_id);
            }
            if let Some(message_id) = &ctx.message_id {
                kwargs["_message_id"] = json!(message_id);
            }
            let task_id = ctx.dispatcher.dispatch_chained(
                &ctx.app_id,
                &ctx.skill_id,
                kwargs,
                Some(countdown),
                ctx.followup,
            );
            info!(
                provider,
                skill,
                retry_after,
                countdown_secs = countdown.as_secs(),
                %task_id,
                "long rate-limit wait, scheduled deferred execution"
            );
            return RateLimitOutcome::Scheduled { task_id };
        }

        // No dispatcher available: one long sleep, then proceed regardless.
        info!(provider, skill, retry_after, "long rate-limit wait, sleeping in place");
        let sleep_for = Duration::from_secs_f64(retry_after);
        tokio::time::sleep(sleep_for).await;
        let recheck = self.check(provider, skill, model).await;
        if !recheck.allowed {
            warn!(provider, skill, "rate limit still active after long wait, proceeding anyway");
        }
        RateLimitOutcome::DelayedShort { slept: sleep_for }
    }
}

fn allowed() -> RateLimitCheck {
    RateLimitCheck {
        allowed: true,
        retry_after: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::config::{ProviderConfig, RateLimitSpec, RateLimitsConfig};
    use convoy_kv::MemoryStore;

    fn limiter(rps: Option<u32>) -> RateLimiter {
        let mut config = ConvoyConfig::default();
        config.providers.insert(
            "brave".to_string(),
            ProviderConfig {
                name: None,
                models: Vec::new(),
                rate_limits: Some(RateLimitsConfig::Direct(RateLimitSpec {
                    requests_per_second: rps,
                    requests_per_month: None,
                })),
                fallback_models: Vec::new(),
            },
        );
        RateLimiter::new(Arc::new(MemoryStore::new()), Arc::new(config))
    }

    #[tokio::test]
    async fn allows_up_to_limit_within_one_second() {
        let limiter = limiter(Some(3));
        let mut allowed_count = 0;
        for _ in 0..5 {
            if limiter.check("brave", "search", None).await.allowed {
                allowed_count += 1;
            }
        }
        // All five checks hit the same second window.
        assert_eq!(allowed_count, 3);
    }

    #[tokio::test]
    async fn denial_reports_retry_after() {
        let limiter = limiter(Some(1));
        assert!(limiter.check("brave", "search", None).await.allowed);
        let denied = limiter.check("brave", "search", None).await;
        assert!(!denied.allowed);
        let retry_after = denied.retry_after.unwrap();
        assert!((MIN_RETRY_AFTER_SECS..=1.0).contains(&retry_after));
    }

    #[tokio::test]
    async fn unconfigured_provider_is_unlimited() {
        let limiter = limiter(Some(1));
        for _ in 0..10 {
            assert!(limiter.check("unknown", "skill", None).await.allowed);
        }
    }

    #[tokio::test]
    async fn unlimited_spec_is_unlimited() {
        let limiter = limiter(None);
        for _ in 0..10 {
            assert!(limiter.check("brave", "search", None).await.allowed);
        }
    }

    #[tokio::test]
    async fn model_key_isolates_counters() {
        let limiter = limiter(Some(1));
        assert!(limiter.check("brave", "search", Some("m1")).await.allowed);
        assert!(limiter.check("brave", "search", Some("m2")).await.allowed);
        assert!(!limiter.check("brave", "search", Some("m1")).await.allowed);
    }

    #[tokio::test]
    async fn short_wait_sleeps_then_proceeds() {
        let limiter = limiter(Some(1));
        assert!(limiter.check("brave", "search", None).await.allowed);
        let outcome = limiter.wait("brave", "search", None, None).await;
        match outcome {
            RateLimitOutcome::DelayedShort { slept } => {
                assert!(slept <= Duration::from_secs(1));
            }
            other => panic!("expected DelayedShort, got {other:?}"),
        }
    }
}
