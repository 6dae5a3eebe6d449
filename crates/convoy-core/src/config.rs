use std::collections::BTreeMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Pipeline timing constants — worker runtime enforces the hard limit.
pub const DEFAULT_SOFT_TIME_LIMIT_SECS: u64 = 300;
pub const DEFAULT_HARD_TIME_LIMIT_SECS: u64 = 360;
pub const DEFAULT_HISTORY_TOKEN_BUDGET: usize = 120_000;
pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 25;
pub const DEFAULT_APP_INTERNAL_PORT: u16 = 8000;

/// Top-level config (convoy.toml + CONVOY_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvoyConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Provider id → provider definition (models, pricing, rate limits).
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Persona presets selected by category.
    #[serde(default)]
    pub mates: Vec<MateConfig>,
    /// App id → declarative manifest of its skills / focus modes / memory
    /// categories. Built into the `SkillRegistry` at worker boot.
    #[serde(default)]
    pub apps: BTreeMap<String, AppManifest>,
}

impl Default for ConvoyConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            pipeline: PipelineConfig::default(),
            providers: BTreeMap::new(),
            mates: Vec::new(),
            apps: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_soft_limit")]
    pub soft_time_limit_secs: u64,
    #[serde(default = "default_hard_limit")]
    pub hard_time_limit_secs: u64,
    #[serde(default = "default_history_budget")]
    pub history_token_budget: usize,
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    /// When false (self-hosted mode) the credit gate is skipped entirely.
    #[serde(default = "bool_true")]
    pub billing_enabled: bool,
    /// Opt-in for leaderboard-based model selection.
    #[serde(default)]
    pub enable_auto_model_selection: bool,
    /// Skills present in every main-processor tool list regardless of
    /// preselection (safety net for critical capabilities).
    #[serde(default)]
    pub always_include_skills: Vec<String>,
    /// Apps expected to be reachable; a warning is logged when one is
    /// missing from the discovered set.
    #[serde(default = "default_critical_apps")]
    pub critical_apps: Vec<String>,
    #[serde(default)]
    pub thresholds: ScoreThresholds,
    #[serde(default)]
    pub default_llms: DefaultLlms,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            soft_time_limit_secs: default_soft_limit(),
            hard_time_limit_secs: default_hard_limit(),
            history_token_budget: default_history_budget(),
            max_tool_iterations: default_max_tool_iterations(),
            billing_enabled: true,
            enable_auto_model_selection: false,
            always_include_skills: Vec::new(),
            critical_apps: default_critical_apps(),
            thresholds: ScoreThresholds::default(),
            default_llms: DefaultLlms::default(),
        }
    }
}

/// Rejection thresholds for the preprocessing score gates (`>=` rejects).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreThresholds {
    #[serde(default = "default_harm_threshold")]
    pub harmful_content_score: f64,
    #[serde(default = "default_misuse_threshold")]
    pub misuse_risk_score: f64,
}

impl Default for ScoreThresholds {
    fn default() -> Self {
        Self {
            harmful_content_score: default_harm_threshold(),
            misuse_risk_score: default_misuse_threshold(),
        }
    }
}

/// Model ids are always the full `"provider/model"` form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultLlms {
    #[serde(default = "default_preprocessing_model")]
    pub preprocessing_model: String,
    #[serde(default = "default_simple_model")]
    pub main_processing_simple: String,
    pub main_processing_simple_name: Option<String>,
    #[serde(default = "default_complex_model")]
    pub main_processing_complex: String,
    pub main_processing_complex_name: Option<String>,
    #[serde(default = "default_postprocessing_model")]
    pub postprocessing_model: String,
    #[serde(default = "default_sanitizer_model")]
    pub sanitizer_model: String,
}

impl Default for DefaultLlms {
    fn default() -> Self {
        Self {
            preprocessing_model: default_preprocessing_model(),
            main_processing_simple: default_simple_model(),
            main_processing_simple_name: None,
            main_processing_complex: default_complex_model(),
            main_processing_complex_name: None,
            postprocessing_model: default_postprocessing_model(),
            sanitizer_model: default_sanitizer_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: Option<String>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    /// Either direct limits or a plan map (`free`/`base`/`pro`). The active
    /// plan comes from the `<PROVIDER>_PLAN` env var, default `pro`.
    pub rate_limits: Option<RateLimitsConfig>,
    /// Model ids (`provider/model`) to try when this provider's primary
    /// model fails during preprocessing.
    #[serde(default)]
    pub fallback_models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    /// Human display name, e.g. "Claude Haiku 4.5".
    pub name: Option<String>,
    pub pricing: Option<ModelPricing>,
    /// Which server entry actually hosts the model by default.
    pub default_server: Option<String>,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    pub name: Option<String>,
    /// e.g. "EU", "US", "APAC".
    pub region: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RateLimitsConfig {
    Direct(RateLimitSpec),
    Plans(BTreeMap<String, RateLimitSpec>),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RateLimitSpec {
    /// `None` means unlimited.
    pub requests_per_second: Option<u32>,
    pub requests_per_month: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MateConfig {
    pub id: String,
    pub name: Option<String>,
    pub category: String,
    pub default_system_prompt: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppManifest {
    pub name: Option<String>,
    #[serde(default)]
    pub skills: Vec<SkillManifest>,
    #[serde(default)]
    pub focuses: Vec<FocusManifest>,
    #[serde(default)]
    pub settings_memory_categories: Vec<MemoryCategory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillManifest {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    /// One-line hint shown to the preprocessing LLM for tool preselection.
    pub preprocessor_hint: Option<String>,
    /// Marks skills whose results carry external text and must pass the
    /// content sanitizer before reaching the main model.
    #[serde(default)]
    pub external_content: bool,
    /// JSON Schema for the skill's arguments (validated at the boundary).
    pub input_schema: Option<serde_json::Value>,
    /// Upstream provider id for rate limiting (e.g. "brave").
    pub provider: Option<String>,
    /// Model-specific rate limit key, when the provider limits per model.
    pub rate_limit_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FocusManifest {
    pub id: String,
    pub name: Option<String>,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryCategory {
    pub id: String,
    pub name: Option<String>,
    pub schema: Option<serde_json::Value>,
}

impl ConvoyConfig {
    /// Load config from a TOML file with CONVOY_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ConvoyConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CONVOY_").split("__"))
            .extract()
            .map_err(|e| crate::error::ConvoyError::Config(e.to_string()))?;

        Ok(config)
    }

    pub fn provider(&self, provider_id: &str) -> Option<&ProviderConfig> {
        self.providers.get(provider_id)
    }

    pub fn model(&self, provider_id: &str, model_id: &str) -> Option<&ModelConfig> {
        self.provider(provider_id)
            .and_then(|p| p.models.iter().find(|m| m.id == model_id))
    }

    /// Human display name for a model, when configured.
    pub fn model_display_name(&self, provider_id: &str, model_id: &str) -> Option<String> {
        self.model(provider_id, model_id)
            .and_then(|m| m.name.clone())
    }

    pub fn model_pricing(&self, provider_id: &str, model_id: &str) -> Option<ModelPricing> {
        self.model(provider_id, model_id).and_then(|m| m.pricing)
    }

    /// Find the provider that hosts a bare model id (used when an override
    /// names a model without a provider prefix).
    pub fn find_provider_for_model(&self, model_id: &str) -> Option<&str> {
        self.providers
            .iter()
            .find(|(_, p)| p.models.iter().any(|m| m.id == model_id))
            .map(|(id, _)| id.as_str())
    }

    /// Resolve the active rate-limit spec for a provider, honoring the
    /// `<PROVIDER>_PLAN` env var (uppercase, hyphens → underscores, default
    /// "pro"). `None` means no limits are configured (fail-open).
    pub fn rate_limit_for(&self, provider_id: &str) -> Option<RateLimitSpec> {
        let limits = self.provider(provider_id)?.rate_limits.as_ref()?;
        match limits {
            RateLimitsConfig::Direct(spec) => Some(*spec),
            RateLimitsConfig::Plans(plans) => {
                let env_var = format!("{}_PLAN", provider_id.to_uppercase().replace('-', "_"));
                let plan = std::env::var(env_var)
                    .map(|v| v.to_lowercase())
                    .unwrap_or_else(|_| "pro".to_string());
                plans.get(&plan).copied().or_else(|| {
                    tracing::warn!(provider = provider_id, %plan, "rate plan not configured");
                    None
                })
            }
        }
    }

    /// The server (host) name and region behind a `provider/model` id,
    /// resolved through the model's `default_server` entry. Falls back to
    /// the provider name, then the capitalized provider id.
    pub fn server_identity(&self, provider_id: &str, model_id: &str) -> (String, Option<String>) {
        let fallback = |p: Option<&ProviderConfig>| {
            p.and_then(|p| p.name.clone())
                .unwrap_or_else(|| capitalize(provider_id))
        };

        let Some(provider) = self.provider(provider_id) else {
            return (capitalize(provider_id), None);
        };
        let Some(model) = provider.models.iter().find(|m| m.id == model_id) else {
            return (fallback(Some(provider)), None);
        };
        let Some(server_id) = model.default_server.as_deref() else {
            return (fallback(Some(provider)), None);
        };
        match model.servers.iter().find(|s| s.id == server_id) {
            Some(server) => (
                server
                    .name
                    .clone()
                    .unwrap_or_else(|| capitalize(server_id)),
                server.region.clone(),
            ),
            None => (capitalize(server_id), None),
        }
    }

    /// Preprocessing fallback chain for a `provider/model` id, from the
    /// provider's config.
    pub fn fallback_models_for(&self, full_model_id: &str) -> Vec<String> {
        let Some((provider_id, _)) = full_model_id.split_once('/') else {
            return Vec::new();
        };
        self.provider(provider_id)
            .map(|p| p.fallback_models.clone())
            .unwrap_or_default()
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn default_port() -> u16 {
    8200
}
fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_soft_limit() -> u64 {
    DEFAULT_SOFT_TIME_LIMIT_SECS
}
fn default_hard_limit() -> u64 {
    DEFAULT_HARD_TIME_LIMIT_SECS
}
fn default_history_budget() -> usize {
    DEFAULT_HISTORY_TOKEN_BUDGET
}
fn default_max_tool_iterations() -> usize {
    DEFAULT_MAX_TOOL_ITERATIONS
}
fn default_harm_threshold() -> f64 {
    7.0
}
fn default_misuse_threshold() -> f64 {
    8.0
}
fn default_critical_apps() -> Vec<String> {
    vec!["web".to_string(), "ai".to_string()]
}
fn default_preprocessing_model() -> String {
    "mistral/mistral-small-latest".to_string()
}
fn default_simple_model() -> String {
    "mistral/mistral-small-latest".to_string()
}
fn default_complex_model() -> String {
    "anthropic/claude-sonnet-4-5".to_string()
}
fn default_postprocessing_model() -> String {
    "mistral/mistral-small-latest".to_string()
}
fn default_sanitizer_model() -> String {
    "mistral/ministral-8b-latest".to_string()
}
fn bool_true() -> bool {
    true
}

fn default_config_path() -> String {
    std::env::var("CONVOY_CONFIG").unwrap_or_else(|_| "convoy.toml".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_plans() -> ConvoyConfig {
        let mut cfg = ConvoyConfig::default();
        let mut plans = BTreeMap::new();
        plans.insert(
            "free".to_string(),
            RateLimitSpec {
                requests_per_second: Some(1),
                requests_per_month: None,
            },
        );
        plans.insert(
            "pro".to_string(),
            RateLimitSpec {
                requests_per_second: Some(20),
                requests_per_month: None,
            },
        );
        cfg.providers.insert(
            "brave".to_string(),
            ProviderConfig {
                name: Some("Brave".to_string()),
                models: Vec::new(),
                rate_limits: Some(RateLimitsConfig::Plans(plans)),
                fallback_models: Vec::new(),
            },
        );
        cfg
    }

    #[test]
    fn plan_defaults_to_pro() {
        let cfg = config_with_plans();
        std::env::remove_var("BRAVE_PLAN");
        let spec = cfg.rate_limit_for("brave").unwrap();
        assert_eq!(spec.requests_per_second, Some(20));
    }

    #[test]
    fn missing_provider_means_unlimited() {
        let cfg = ConvoyConfig::default();
        assert!(cfg.rate_limit_for("nonexistent").is_none());
    }

    #[test]
    fn server_identity_falls_back_to_capitalized_id() {
        let mut cfg = ConvoyConfig::default();
        cfg.providers.insert(
            "openai".to_string(),
            ProviderConfig {
                name: None,
                models: vec![ModelConfig {
                    id: "gpt-x".to_string(),
                    name: Some("GPT X".to_string()),
                    pricing: None,
                    default_server: Some("azure".to_string()),
                    servers: vec![ServerConfig {
                        id: "azure".to_string(),
                        name: Some("Azure".to_string()),
                        region: Some("EU".to_string()),
                    }],
                }],
                rate_limits: None,
                fallback_models: Vec::new(),
            },
        );

        let (name, region) = cfg.server_identity("openai", "gpt-x");
        assert_eq!(name, "Azure");
        assert_eq!(region.as_deref(), Some("EU"));

        let (name, region) = cfg.server_identity("openai", "unknown-model");
        assert_eq!(name, "Openai");
        assert!(region.is_none());
    }

    #[test]
    fn find_provider_for_bare_model_id() {
        let mut cfg = ConvoyConfig::default();
        cfg.providers.insert(
            "anthropic".to_string(),
            ProviderConfig {
                name: None,
                models: vec![ModelConfig {
                    id: "claude-sonnet-4-5".to_string(),
                    name: None,
                    pricing: None,
                    default_server: None,
                    servers: Vec::new(),
                }],
                rate_limits: None,
                fallback_models: Vec::new(),
            },
        );
        assert_eq!(
            cfg.find_provider_for_model("claude-sonnet-4-5"),
            Some("anthropic")
        );
        assert_eq!(cfg.find_provider_for_model("gpt-x"), None);
    }
}
