use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;
use vigil_protocol::EntityType;

use crate::error::ValidationError;
use crate::profile::ActionState;

pub const RULE_TYPE_KIND: &str = "rule-type";
pub const DOCUMENT_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ReleasePhase {
    Alpha,
    Beta,
    Ga,
    Deprecated,
    #[default]
    Unspecified,
}

/// Severity wrapper matching the `severity: { value: high }` document layout.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeveritySpec {
    #[serde(default)]
    pub value: Severity,
}

/// Project/provider scope of a document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Context {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl Context {
    pub fn for_project(project_id: Uuid) -> Self {
        Self {
            project: Some(project_id.to_string()),
            provider: None,
        }
    }

    pub fn project_id(&self) -> Option<Uuid> {
        self.project
            .as_deref()
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }
}

/// A `type`-tagged plug-in section (`ingest`, `eval`, `remediate`, `alert`).
///
/// The tag selects the implementation; the remaining keys are that implementation's
/// configuration, conventionally nested under a key equal to the tag
/// (`{type: rest, rest: {...}}`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PluginSpec {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

impl PluginSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            config: Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// The configuration block named after the tag, if any.
    pub fn section(&self) -> Option<&Value> {
        self.config.get(&self.kind)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }
}

pub type IngestSpec = PluginSpec;
pub type EvalSpec = PluginSpec;

/// Remediation or alert configuration of a rule type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ActionSpec {
    #[serde(rename = "type", default)]
    pub kind: String,
    /// State used when the profile does not say otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_state: Option<ActionState>,
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

impl ActionSpec {
    pub fn section(&self) -> Option<&Value> {
        self.config.get(&self.kind)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleTypeDef {
    pub in_entity: EntityType,
    pub rule_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_schema: Option<Value>,
    pub ingest: IngestSpec,
    pub eval: EvalSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediate: Option<ActionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<ActionSpec>,
}

/// A reusable rule template: schemas, ingest and eval procedure, actions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleType {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub guidance: String,
    #[serde(default)]
    pub severity: SeveritySpec,
    #[serde(default)]
    pub release_phase: ReleasePhase,
    pub def: RuleTypeDef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<Uuid>,
}

fn default_version() -> String {
    DOCUMENT_VERSION.to_string()
}

fn default_kind() -> String {
    RULE_TYPE_KIND.to_string()
}

impl RuleType {
    pub fn new(name: impl Into<String>, def: RuleTypeDef) -> Self {
        Self {
            id: None,
            version: default_version(),
            kind: default_kind(),
            name: name.into(),
            display_name: String::new(),
            context: None,
            description: String::new(),
            guidance: String::new(),
            severity: SeveritySpec::default(),
            release_phase: ReleasePhase::default(),
            def,
            subscription_id: None,
        }
    }

    pub fn project_id(&self) -> Option<Uuid> {
        self.context.as_ref().and_then(Context::project_id)
    }

    /// Key used when fingerprinting ingest results. Stored rule types use their id.
    pub fn cache_key(&self) -> String {
        self.id
            .map(|id| id.to_string())
            .unwrap_or_else(|| self.name.clone())
    }

    pub fn display(&self) -> &str {
        if self.display_name.is_empty() {
            &self.name
        } else {
            &self.display_name
        }
    }

    /// Shape validation performed after decoding a document.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::new("rule type name cannot be empty"));
        }
        if self.kind != RULE_TYPE_KIND {
            return Err(ValidationError::for_rule_type(
                &self.name,
                format!("unexpected document type {:?}", self.kind),
            ));
        }
        if !self.def.rule_schema.is_object() {
            return Err(ValidationError::for_rule_type(
                &self.name,
                "rule_schema must be a JSON object",
            ));
        }
        if let Some(schema) = &self.def.param_schema {
            if !(schema.is_object() || schema.is_null()) {
                return Err(ValidationError::for_rule_type(
                    &self.name,
                    "param_schema must be a JSON object",
                ));
            }
        }
        if self.def.ingest.kind.trim().is_empty() {
            return Err(ValidationError::for_rule_type(
                &self.name,
                "ingest type cannot be empty",
            ));
        }
        if self.def.eval.kind.trim().is_empty() {
            return Err(ValidationError::for_rule_type(
                &self.name,
                "eval type cannot be empty",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_def() -> RuleTypeDef {
        RuleTypeDef {
            in_entity: EntityType::Repository,
            rule_schema: json!({"type": "object"}),
            param_schema: None,
            ingest: PluginSpec::new("builtin"),
            eval: PluginSpec::new("deny-by-default").with("policy", json!("default allow = true")),
            remediate: None,
            alert: None,
        }
    }

    #[test]
    fn plugin_spec_flattens_configuration() {
        let spec: PluginSpec = serde_json::from_value(json!({
            "type": "rest",
            "rest": {"endpoint": "/repos/{{ owner }}"}
        }))
        .unwrap();
        assert_eq!(spec.kind, "rest");
        assert_eq!(spec.section().unwrap()["endpoint"], "/repos/{{ owner }}");
    }

    #[test]
    fn validate_requires_object_schema() {
        let mut def = sample_def();
        def.rule_schema = json!("nope");
        let err = RuleType::new("broken", def).validate().unwrap_err();
        assert_eq!(err.rule_type.as_deref(), Some("broken"));
    }

    #[test]
    fn cache_key_prefers_id() {
        let mut rule_type = RuleType::new("passthrough", sample_def());
        assert_eq!(rule_type.cache_key(), "passthrough");
        let id = Uuid::new_v4();
        rule_type.id = Some(id);
        assert_eq!(rule_type.cache_key(), id.to_string());
    }
}
