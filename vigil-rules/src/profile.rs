use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use vigil_protocol::EntityType;

use crate::error::{ParseError, ValidationError};
use crate::rule_type::{Context, RuleType, DOCUMENT_VERSION};
use crate::selectors::Selection;

pub const PROFILE_KIND: &str = "profile";

/// Whether an action runs, is skipped, or is rendered without side effects.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ActionState {
    #[serde(rename = "on")]
    On,
    #[serde(rename = "off")]
    Off,
    #[serde(rename = "dry_run", alias = "dry-run")]
    DryRun,
}

impl ActionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionState::On => "on",
            ActionState::Off => "off",
            ActionState::DryRun => "dry_run",
        }
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "on" => Ok(ActionState::On),
            "off" => Ok(ActionState::Off),
            "dry_run" | "dry-run" => Ok(ActionState::DryRun),
            other => Err(format!("unknown action state {other:?}")),
        }
    }
}

/// One application of a rule type inside a profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleInvocation {
    #[serde(rename = "type")]
    pub rule_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub def: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RuleInvocation {
    pub fn new(rule_type: impl Into<String>, def: Value) -> Self {
        Self {
            rule_type: rule_type.into(),
            name: None,
            def,
            params: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name used in records and logs: the explicit name, else the rule type.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.rule_type)
    }
}

/// A profile selector: an expression that must hold for the profile to apply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityType>,
    pub selector: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// A named, project-scoped policy made of per-entity ordered rule lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ProfileDocument", into = "ProfileDocument")]
pub struct Profile {
    pub id: Option<Uuid>,
    pub version: String,
    pub name: String,
    pub display_name: String,
    pub context: Option<Context>,
    pub remediate: Option<ActionState>,
    pub alert: Option<ActionState>,
    pub rules: BTreeMap<EntityType, Vec<RuleInvocation>>,
    pub selection: Vec<ProfileSelector>,
    pub labels: Vec<String>,
    pub subscription_id: Option<Uuid>,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            version: DOCUMENT_VERSION.to_string(),
            name: name.into(),
            display_name: String::new(),
            context: None,
            remediate: None,
            alert: None,
            rules: BTreeMap::new(),
            selection: Vec::new(),
            labels: Vec::new(),
            subscription_id: None,
        }
    }

    pub fn with_rule(mut self, entity_type: EntityType, rule: RuleInvocation) -> Self {
        self.rules.entry(entity_type).or_default().push(rule);
        self
    }

    pub fn project_id(&self) -> Option<Uuid> {
        self.context.as_ref().and_then(Context::project_id)
    }

    /// Decodes a JSON document, keeping shape violations as [`ValidationError`]s.
    pub fn from_value(value: Value) -> Result<Self, ParseError> {
        let document: ProfileDocument =
            serde_json::from_value(value).map_err(|err| ParseError::Json(err.to_string()))?;
        Ok(Profile::try_from(document)?)
    }

    pub fn rules_for(&self, entity_type: EntityType) -> &[RuleInvocation] {
        self.rules
            .get(&entity_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Effective remediation state for a rule of the given type.
    pub fn remediate_state(&self, rule_type: &RuleType) -> ActionState {
        self.remediate
            .or_else(|| {
                rule_type
                    .def
                    .remediate
                    .as_ref()
                    .and_then(|spec| spec.default_state)
            })
            .unwrap_or(ActionState::Off)
    }

    /// Effective alert state for a rule of the given type.
    pub fn alert_state(&self, rule_type: &RuleType) -> ActionState {
        self.alert
            .or_else(|| rule_type.def.alert.as_ref().and_then(|spec| spec.default_state))
            .unwrap_or(ActionState::On)
    }

    /// Validates the canonical profile.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::new("profile name cannot be empty"));
        }
        match &self.context {
            None => return Err(ValidationError::new("profile context cannot be empty")),
            Some(context) if context.project.as_deref().map_or(true, str::is_empty) => {
                return Err(ValidationError::new(
                    "profile context must reference a project",
                ))
            }
            Some(_) => {}
        }
        if self.rules.values().all(Vec::is_empty) {
            return Err(ValidationError::new("profile must contain at least one rule"));
        }
        for (entity_type, rules) in &self.rules {
            validate_rule_list(*entity_type, rules)?;
        }
        Selection::compile(&self.selection)
            .map_err(|err| ValidationError::new(format!("invalid selector: {err}")))?;
        Ok(())
    }
}

fn validate_rule_list(
    entity_type: EntityType,
    rules: &[RuleInvocation],
) -> Result<(), ValidationError> {
    if rules.is_empty() {
        return Err(ValidationError::new(format!(
            "{entity_type} rule list cannot be empty"
        )));
    }
    let mut names = HashSet::new();
    for rule in rules {
        if rule.rule_type.trim().is_empty() {
            return Err(ValidationError::new(format!(
                "{entity_type} rule has an empty type"
            )));
        }
        if rule.def.is_null() {
            return Err(ValidationError::for_rule_type(
                &rule.rule_type,
                "rule definition cannot be empty",
            ));
        }
        if let Some(params) = &rule.params {
            if !(params.is_object() || params.is_null()) {
                return Err(ValidationError::for_rule_type(
                    &rule.rule_type,
                    "rule params must be an object",
                ));
            }
        }
        if let Some(name) = &rule.name {
            if !names.insert(name.as_str()) {
                return Err(ValidationError::for_rule_type(
                    &rule.rule_type,
                    format!("duplicate rule name {name:?}"),
                ));
            }
        }
    }
    Ok(())
}

/// On-disk layout of a profile: one optional list per entity type.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProfileDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<Uuid>,
    #[serde(default = "default_version")]
    version: String,
    #[serde(rename = "type", default = "default_kind")]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    context: Option<Context>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remediate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    alert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    repository: Option<Vec<Option<RawInvocation>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    artifact: Option<Vec<Option<RawInvocation>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pull_request: Option<Vec<Option<RawInvocation>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    build_environment: Option<Vec<Option<RawInvocation>>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    selection: Vec<ProfileSelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subscription_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawInvocation {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    rule_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    def: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

fn default_version() -> String {
    DOCUMENT_VERSION.to_string()
}

fn default_kind() -> String {
    PROFILE_KIND.to_string()
}

impl ProfileDocument {
    fn list_mut(&mut self, entity_type: EntityType) -> &mut Option<Vec<Option<RawInvocation>>> {
        match entity_type {
            EntityType::Repository => &mut self.repository,
            EntityType::Artifact => &mut self.artifact,
            EntityType::PullRequest => &mut self.pull_request,
            EntityType::BuildEnvironment => &mut self.build_environment,
        }
    }
}

fn parse_state(field: &str, raw: Option<String>) -> Result<Option<ActionState>, ValidationError> {
    match raw {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ValidationError::new(format!("invalid {field} value {raw:?}"))),
    }
}

fn convert_list(
    entity_type: EntityType,
    raw: Vec<Option<RawInvocation>>,
) -> Result<Vec<RuleInvocation>, ValidationError> {
    if raw.is_empty() {
        return Err(ValidationError::new(format!(
            "{entity_type} rule list cannot be empty"
        )));
    }
    raw.into_iter()
        .map(|entry| {
            let entry = entry.ok_or_else(|| {
                ValidationError::new(format!("{entity_type} rule list contains a nil rule"))
            })?;
            let rule_type = entry
                .rule_type
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| {
                    ValidationError::new(format!("{entity_type} rule has an empty type"))
                })?;
            let def = entry.def.ok_or_else(|| {
                ValidationError::for_rule_type(&rule_type, "rule definition cannot be empty")
            })?;
            Ok(RuleInvocation {
                rule_type,
                name: entry.name,
                def,
                params: entry.params,
            })
        })
        .collect()
}

impl TryFrom<ProfileDocument> for Profile {
    type Error = ValidationError;

    fn try_from(mut doc: ProfileDocument) -> Result<Self, Self::Error> {
        if doc.kind != PROFILE_KIND {
            return Err(ValidationError::new(format!(
                "unexpected document type {:?}",
                doc.kind
            )));
        }
        let mut rules = BTreeMap::new();
        for entity_type in EntityType::ALL {
            if let Some(list) = doc.list_mut(entity_type).take() {
                rules.insert(entity_type, convert_list(entity_type, list)?);
            }
        }
        Ok(Profile {
            id: doc.id,
            version: doc.version,
            name: doc.name,
            display_name: doc.display_name,
            context: doc.context,
            remediate: parse_state("remediate", doc.remediate)?,
            alert: parse_state("alert", doc.alert)?,
            rules,
            selection: doc.selection,
            labels: doc.labels,
            subscription_id: doc.subscription_id,
        })
    }
}

impl From<Profile> for ProfileDocument {
    fn from(profile: Profile) -> Self {
        let mut doc = ProfileDocument {
            id: profile.id,
            version: profile.version,
            kind: PROFILE_KIND.to_string(),
            name: profile.name,
            display_name: profile.display_name,
            context: profile.context,
            remediate: profile.remediate.map(|state| state.as_str().to_string()),
            alert: profile.alert.map(|state| state.as_str().to_string()),
            repository: None,
            artifact: None,
            pull_request: None,
            build_environment: None,
            selection: profile.selection,
            labels: profile.labels,
            subscription_id: profile.subscription_id,
        };
        for (entity_type, rules) in profile.rules {
            let raw = rules
                .into_iter()
                .map(|rule| {
                    Some(RawInvocation {
                        rule_type: Some(rule.rule_type),
                        name: rule.name,
                        def: Some(rule.def),
                        params: rule.params,
                    })
                })
                .collect();
            *doc.list_mut(entity_type) = Some(raw);
        }
        doc
    }
}
