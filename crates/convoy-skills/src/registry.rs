//! Skill registry built at worker boot from the declarative app manifest.
//!
//! Replaces runtime module discovery: every `(app_id, skill_id)` the system
//! can call is known up front, together with its endpoint, schema,
//! preprocessor hint, and rate-limit provider. The registry also owns the
//! hallucination resolver that maps common LLM misspellings of tool names
//! back to valid identifiers.

use std::collections::{BTreeMap, HashMap};

use tracing::warn;

use convoy_core::config::{AppManifest, MemoryCategory};
use convoy_core::config::DEFAULT_APP_INTERNAL_PORT;
use convoy_model::ToolDefinition;

/// The AI's own entry skill is the pipeline itself, never a tool.
const ENTRY_SKILL: (&str, &str) = ("ai", "ask");

#[derive(Debug, Clone)]
pub struct SkillSpec {
    pub app_id: String,
    pub skill_id: String,
    /// `<app_id>-<skill_id>`, the tool-facing identifier.
    pub identifier: String,
    pub endpoint: String,
    pub description: Option<String>,
    pub preprocessor_hint: Option<String>,
    pub external_content: bool,
    pub input_schema: Option<serde_json::Value>,
    pub provider: Option<String>,
    pub rate_limit_model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FocusSpec {
    pub app_id: String,
    pub focus_id: String,
    pub identifier: String,
    pub prompt: Option<String>,
}

#[derive(Default)]
pub struct SkillRegistry {
    skills: BTreeMap<String, SkillSpec>,
    focuses: BTreeMap<String, FocusSpec>,
    memory_categories: BTreeMap<String, MemoryCategory>,
    app_ids: Vec<String>,
    skill_resolver: HashMap<String, String>,
    focus_resolver: HashMap<String, String>,
}

impl SkillRegistry {
    pub fn from_manifests(apps: &BTreeMap<String, AppManifest>) -> Self {
        let mut registry = SkillRegistry::default();

        for (app_id, manifest) in apps {
            registry.app_ids.push(app_id.clone());

            for skill in &manifest.skills {
                if (app_id.as_str(), skill.id.as_str()) == ENTRY_SKILL {
                    continue;
                }
                let identifier = format!("{app_id}-{}", skill.id);
                registry.skills.insert(
                    identifier.clone(),
                    SkillSpec {
                        app_id: app_id.clone(),
                        skill_id: skill.id.clone(),
                        identifier,
                        endpoint: skill_endpoint(app_id, &skill.id),
                        description: skill.description.clone(),
                        preprocessor_hint: skill.preprocessor_hint.clone(),
                        external_content: skill.external_content,
                        input_schema: skill.input_schema.clone(),
                        provider: skill.provider.clone(),
                        rate_limit_model: skill.rate_limit_model.clone(),
                    },
                );
            }

            for focus in &manifest.focuses {
                let identifier = format!("{app_id}-{}", focus.id);
                registry.focuses.insert(
                    identifier.clone(),
                    FocusSpec {
                        app_id: app_id.clone(),
                        focus_id: focus.id.clone(),
                        identifier,
                        prompt: focus.prompt.clone(),
                    },
                );
            }

            for category in &manifest.settings_memory_categories {
                registry
                    .memory_categories
                    .insert(category.id.clone(), category.clone());
            }
        }

        registry.skill_resolver = build_resolver(registry.skills.keys());
        registry.focus_resolver = build_resolver(registry.focuses.keys());
        registry
    }

    pub fn get(&self, identifier: &str) -> Option<&SkillSpec> {
        self.skills.get(identifier)
    }

    pub fn get_by_parts(&self, app_id: &str, skill_id: &str) -> Option<&SkillSpec> {
        self.skills.get(&format!("{app_id}-{skill_id}"))
    }

    /// Map an LLM-emitted skill name to a valid identifier, tolerating the
    /// common hallucination variants. `None` means truly unknown.
    pub fn resolve_skill(&self, name: &str) -> Option<&str> {
        self.skill_resolver.get(name).map(String::as_str)
    }

    /// Resolve a (possibly hallucinated) tool name straight to its spec.
    pub fn resolve_spec(&self, name: &str) -> Option<&SkillSpec> {
        self.resolve_skill(name).and_then(|id| self.skills.get(id))
    }

    pub fn resolve_focus(&self, name: &str) -> Option<&str> {
        self.focus_resolver.get(name).map(String::as_str)
    }

    pub fn focus(&self, identifier: &str) -> Option<&FocusSpec> {
        self.focuses.get(identifier)
    }

    pub fn skill_identifiers(&self) -> Vec<&str> {
        self.skills.keys().map(String::as_str).collect()
    }

    /// Identifiers annotated with preprocessor hints, for the preprocessing
    /// LLM's dynamic context.
    pub fn annotated_skills(&self) -> Vec<String> {
        self.skills
            .values()
            .map(|s| match &s.preprocessor_hint {
                Some(hint) => format!("{}: {}", s.identifier, hint.trim()),
                None => s.identifier.clone(),
            })
            .collect()
    }

    pub fn focus_identifiers(&self) -> Vec<&str> {
        self.focuses.keys().map(String::as_str).collect()
    }

    pub fn app_ids(&self) -> &[String] {
        &self.app_ids
    }

    pub fn memory_category_ids(&self) -> Vec<&str> {
        self.memory_categories.keys().map(String::as_str).collect()
    }

    /// Schemas for the selected memory categories; unknown ids are skipped.
    pub fn category_schemas(&self, ids: &[String]) -> BTreeMap<String, serde_json::Value> {
        ids.iter()
            .filter_map(|id| {
                self.memory_categories
                    .get(id)
                    .and_then(|c| c.schema.clone().map(|s| (id.clone(), s)))
            })
            .collect()
    }

    /// Warn when expected apps are absent from the manifest — a missing
    /// critical app means the model will be told about capabilities it
    /// doesn't have.
    pub fn check_critical_apps(&self, critical: &[String]) {
        let missing: Vec<&str> = critical
            .iter()
            .filter(|app| !self.app_ids.contains(app))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            warn!(
                missing = ?missing,
                available = ?self.app_ids,
                "critical apps not available; their skills cannot be called"
            );
        }
    }

    /// Tool definitions for the main-processor tool list: the preselected
    /// skills plus the always-include set, deduplicated preserving order.
    pub fn tool_definitions(
        &self,
        preselected: &[String],
        always_include: &[String],
    ) -> Vec<ToolDefinition> {
        let mut seen = Vec::new();
        let mut defs = Vec::new();
        for identifier in preselected.iter().chain(always_include.iter()) {
            if seen.contains(identifier) {
                continue;
            }
            seen.push(identifier.clone());
            match self.skills.get(identifier) {
                Some(spec) => defs.push(ToolDefinition {
                    name: spec.identifier.clone(),
                    description: spec
                        .description
                        .clone()
                        .or_else(|| spec.preprocessor_hint.clone())
                        .unwrap_or_else(|| spec.identifier.clone()),
                    input_schema: spec
                        .input_schema
                        .clone()
                        .unwrap_or_else(|| serde_json::json!({"type": "object"})),
                }),
                None => warn!(identifier, "skipping unknown skill in tool list"),
            }
        }
        defs
    }
}

pub fn skill_endpoint(app_id: &str, skill_id: &str) -> String {
    format!("http://app-{app_id}:{DEFAULT_APP_INTERNAL_PORT}/skills/{skill_id}")
}

/// Resolver table for one identifier namespace: exact name, underscore
/// twin, duplicated-last-segment form, and its underscore twin all map back
/// to the valid identifier.
fn build_resolver<'a>(valid: impl Iterator<Item = &'a String>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for id in valid {
        map.insert(id.clone(), id.clone());

        let underscored = id.replace('-', "_");
        map.insert(underscored.clone(), id.clone());

        let parts: Vec<&str> = id.split('-').collect();
        if parts.len() >= 2 {
            let last = parts[parts.len() - 1];
            map.insert(format!("{id}-{last}"), id.clone());
            map.insert(format!("{underscored}_{last}"), id.clone());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::config::SkillManifest;

    fn manifests() -> BTreeMap<String, AppManifest> {
        let mut apps = BTreeMap::new();
        apps.insert(
            "web".to_string(),
            AppManifest {
                name: Some("Web".into()),
                skills: vec![
                    SkillManifest {
                        id: "search".into(),
                        name: None,
                        description: Some("Search the web".into()),
                        preprocessor_hint: Some("Current events lookups".into()),
                        external_content: true,
                        input_schema: None,
                        provider: Some("brave".into()),
                        rate_limit_model: None,
                    },
                    SkillManifest {
                        id: "read".into(),
                        name: None,
                        description: None,
                        preprocessor_hint: None,
                        external_content: true,
                        input_schema: None,
                        provider: None,
                        rate_limit_model: None,
                    },
                ],
                focuses: Vec::new(),
                settings_memory_categories: Vec::new(),
            },
        );
        apps.insert(
            "ai".to_string(),
            AppManifest {
                name: None,
                skills: vec![SkillManifest {
                    id: "ask".into(),
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
        apps
    }

    #[test]
    fn entry_skill_is_excluded() {
        let registry = SkillRegistry::from_manifests(&manifests());
        assert!(registry.get("ai-ask").is_none());
        assert!(registry.get("web-search").is_some());
    }

    #[test]
    fn resolver_corrects_hallucinated_names() {
        let registry = SkillRegistry::from_manifests(&manifests());
        assert_eq!(registry.resolve_skill("web-search"), Some("web-search"));
        assert_eq!(registry.resolve_skill("web_search"), Some("web-search"));
        assert_eq!(
            registry.resolve_skill("web-search-search"),
            Some("web-search")
        );
        assert_eq!(
            registry.resolve_skill("web_search_search"),
            Some("web-search")
        );
        assert_eq!(registry.resolve_skill("maps-search"), None);
    }

    #[test]
    fn annotated_skills_carry_hints() {
        let registry = SkillRegistry::from_manifests(&manifests());
        let annotated = registry.annotated_skills();
        assert!(annotated.contains(&"web-search: Current events lookups".to_string()));
        assert!(annotated.contains(&"web-read".to_string()));
    }

    #[test]
    fn tool_definitions_union_dedups() {
        let registry = SkillRegistry::from_manifests(&manifests());
        let defs = registry.tool_definitions(
            &["web-search".to_string()],
            &["web-search".to_string(), "web-read".to_string()],
        );
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["web-search", "web-read"]);
    }

    #[test]
    fn endpoint_format() {
        assert_eq!(
            skill_endpoint("web", "search"),
            "http://app-web:8000/skills/search"
        );
    }
}
