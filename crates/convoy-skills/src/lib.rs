//! Skill-execution substrate: the registry of callable skills, the HTTP
//! executor with retry/cancellation/batching, provider rate limiting, the
//! external-content sanitizer, and the per-app task dispatcher.

pub mod dispatch;
pub mod executor;
pub mod rate_limit;
pub mod registry;
pub mod sanitizer;

pub use dispatch::{
    queue_name, task_name, TaskDispatcher, TaskEnvelope, TaskHandler, TaskResult,
    TaskStatusReport,
};
pub use executor::{
    ExecuteOptions, HttpSkillHandler, SkillError, SkillExecutor, SkillOutcome,
    DEFAULT_SKILL_MAX_RETRIES, DEFAULT_SKILL_TIMEOUT, MAX_PARALLEL_REQUESTS,
};
pub use rate_limit::{DeferralContext, RateLimitCheck, RateLimitOutcome, RateLimiter};
pub use registry::{skill_endpoint, FocusSpec, SkillRegistry, SkillSpec};
pub use sanitizer::{ContentSanitizer, SanitizeOutcome};
