//! Reading profiles and rule types from YAML or JSON.

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::ParseError;
use crate::profile::{Profile, PROFILE_KIND};
use crate::rule_type::{RuleType, RULE_TYPE_KIND};

/// Text format of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
}

impl Format {
    /// Guesses the format from the first non-whitespace byte.
    pub fn detect(bytes: &[u8]) -> Self {
        match bytes.iter().find(|byte| !byte.is_ascii_whitespace()) {
            Some(b'{') | Some(b'[') => Format::Json,
            _ => Format::Yaml,
        }
    }

    /// Format implied by a file extension, if any.
    pub fn from_extension(path: &Path) -> Option<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Some(Format::Json),
            Some("yaml") | Some("yml") => Some(Format::Yaml),
            _ => None,
        }
    }
}

/// A document read from disk, dispatched on its `type` field.
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    RuleType(RuleType),
    Profile(Profile),
}

fn to_json(bytes: &[u8], hint: Option<Format>) -> Result<Value, ParseError> {
    match hint.unwrap_or_else(|| Format::detect(bytes)) {
        Format::Json => {
            serde_json::from_slice(bytes).map_err(|err| ParseError::Json(err.to_string()))
        }
        Format::Yaml => {
            serde_yaml::from_slice(bytes).map_err(|err| ParseError::Yaml(err.to_string()))
        }
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ParseError> {
    serde_json::from_value(value).map_err(|err| ParseError::Json(err.to_string()))
}

fn read_all<R: Read>(mut reader: R) -> Result<Vec<u8>, ParseError> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn document_kind(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

fn expect_kind(value: &Value, expected: &'static str) -> Result<(), ParseError> {
    match document_kind(value) {
        None => Ok(()),
        Some(kind) if kind == expected => Ok(()),
        Some(kind) => Err(ParseError::UnexpectedKind {
            expected,
            found: kind.to_string(),
        }),
    }
}

/// Parses and validates a rule type. YAML is transcoded to JSON before decoding.
pub fn parse_rule_type<R: Read>(reader: R, hint: Option<Format>) -> Result<RuleType, ParseError> {
    let value = to_json(&read_all(reader)?, hint)?;
    expect_kind(&value, RULE_TYPE_KIND)?;
    let rule_type: RuleType = decode(value)?;
    rule_type.validate()?;
    Ok(rule_type)
}

/// Parses a profile, checking its shape while decoding and validating it afterwards.
pub fn parse_profile<R: Read>(reader: R, hint: Option<Format>) -> Result<Profile, ParseError> {
    let value = to_json(&read_all(reader)?, hint)?;
    expect_kind(&value, PROFILE_KIND)?;
    let profile = Profile::from_value(value)?;
    profile.validate()?;
    Ok(profile)
}

/// Parses a profile without requiring a project context; callers fill it in.
pub fn parse_profile_unscoped<R: Read>(
    reader: R,
    hint: Option<Format>,
) -> Result<Profile, ParseError> {
    let value = to_json(&read_all(reader)?, hint)?;
    expect_kind(&value, PROFILE_KIND)?;
    Profile::from_value(value)
}

/// Serializes a profile to YAML. Parsing the output yields an equal profile.
pub fn profile_to_yaml(profile: &Profile) -> Result<String, ParseError> {
    serde_yaml::to_string(profile).map_err(|err| ParseError::Serialize(err.to_string()))
}

pub fn rule_type_to_yaml(rule_type: &RuleType) -> Result<String, ParseError> {
    serde_yaml::to_string(rule_type).map_err(|err| ParseError::Serialize(err.to_string()))
}

/// Loads every `.json`, `.yaml` and `.yml` document under `path` (a file or a flat directory).
pub fn load_documents(path: impl AsRef<Path>) -> Result<Vec<Document>, ParseError> {
    let path = path.as_ref();
    let read_error = |path: &Path, source| ParseError::ReadPath {
        path: path.display().to_string(),
        source,
    };

    if !path.is_dir() {
        return load_file(path).map(|document| vec![document]);
    }

    let mut entries = fs::read_dir(path)
        .map_err(|err| read_error(path, err))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| read_error(path, err))?;
    entries.sort_by_key(|entry| entry.path());

    let mut documents = Vec::new();
    for entry in entries {
        let file_path = entry.path();
        if file_path.is_dir() || Format::from_extension(&file_path).is_none() {
            continue;
        }
        documents.push(load_file(&file_path)?);
    }
    debug!(path = %path.display(), count = documents.len(), "loaded documents");
    Ok(documents)
}

fn load_file(path: &Path) -> Result<Document, ParseError> {
    let bytes = fs::read(path).map_err(|source| ParseError::ReadPath {
        path: path.display().to_string(),
        source,
    })?;
    let hint = Format::from_extension(path);
    let value = to_json(&bytes, hint)?;
    match document_kind(&value) {
        Some(PROFILE_KIND) => parse_profile_unscoped(bytes.as_slice(), hint).map(Document::Profile),
        Some(RULE_TYPE_KIND) => parse_rule_type(bytes.as_slice(), hint).map(Document::RuleType),
        other => Err(ParseError::UnexpectedKind {
            expected: "rule-type or profile",
            found: other.unwrap_or_default().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{ActionState, ProfileSelector, RuleInvocation};
    use crate::rule_type::Context;
    use serde_json::json;
    use std::io::Write;
    use uuid::Uuid;
    use vigil_protocol::EntityType;

    const PROFILE_YAML: &str = r#"
version: v1
type: profile
name: test-profile
context:
  project: 6d2d1a56-8c57-4b0f-9f4b-0c2f1e7a7b10
remediate: "off"
alert: dry_run
future_field: ignored
repository:
  - type: passthrough
    def: {}
  - type: branch_protection
    name: main-branch
    params:
      branch: main
    def:
      required_approving_review_count: 2
selection:
  - entity: repository
    selector: repository.name != 'foo/skip'
"#;

    const RULE_TYPE_JSON: &str = r#"
    {
      "version": "v1",
      "type": "rule-type",
      "name": "passthrough",
      "context": {"provider": "github"},
      "severity": {"value": "medium"},
      "release_phase": "beta",
      "def": {
        "in_entity": "repository",
        "rule_schema": {"type": "object"},
        "ingest": {"type": "builtin"},
        "eval": {"type": "deny-by-default", "policy": "default allow = true"}
      }
    }"#;

    #[test]
    fn detects_format_from_leading_byte() {
        assert_eq!(Format::detect(b"  \n{\"a\": 1}"), Format::Json);
        assert_eq!(Format::detect(b"name: x"), Format::Yaml);
        assert_eq!(Format::detect(b""), Format::Yaml);
    }

    #[test]
    fn parses_yaml_profile() {
        let profile = parse_profile(PROFILE_YAML.as_bytes(), None).expect("parse");
        assert_eq!(profile.name, "test-profile");
        assert_eq!(profile.remediate, Some(ActionState::Off));
        assert_eq!(profile.alert, Some(ActionState::DryRun));
        let rules = profile.rules_for(EntityType::Repository);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1].display_name(), "main-branch");
        assert_eq!(rules[1].params, Some(json!({"branch": "main"})));
        assert_eq!(profile.selection.len(), 1);
    }

    #[test]
    fn parses_json_rule_type() {
        let rule_type = parse_rule_type(RULE_TYPE_JSON.as_bytes(), None).expect("parse");
        assert_eq!(rule_type.def.in_entity, EntityType::Repository);
        assert_eq!(rule_type.def.eval.kind, "deny-by-default");
        assert_eq!(rule_type.def.eval.get("policy"), Some(&json!("default allow = true")));
    }

    #[test]
    fn rejects_wrong_document_kind() {
        let err = parse_profile(RULE_TYPE_JSON.as_bytes(), Some(Format::Json)).unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedKind { .. }));
    }

    #[test]
    fn empty_entity_list_fails() {
        let input = "name: p\ncontext: {project: x}\nrepository: []\n";
        let err = parse_profile(input.as_bytes(), None).unwrap_err();
        assert!(err.to_string().contains("rule list cannot be empty"));
    }

    #[test]
    fn missing_context_fails_validation() {
        let input = "name: p\nrepository:\n  - type: a\n    def: {}\n";
        assert!(matches!(
            parse_profile(input.as_bytes(), None),
            Err(ParseError::Validation(_))
        ));
        assert!(parse_profile_unscoped(input.as_bytes(), None).is_ok());
    }

    #[test]
    fn yaml_round_trip_is_lossless() {
        let mut profile = Profile::new("round-trip")
            .with_rule(
                EntityType::Repository,
                RuleInvocation::new("a", json!({"enabled": true, "nested": {"n": 1.5}}))
                    .with_params(json!({"branch": "main"})),
            )
            .with_rule(
                EntityType::Artifact,
                RuleInvocation::new("b", json!({"tags": ["x", "y"]})).with_name("named"),
            );
        profile.context = Some(Context::for_project(Uuid::new_v4()));
        profile.remediate = Some(ActionState::DryRun);
        profile.alert = Some(ActionState::On);
        profile.selection.push(ProfileSelector {
            entity: Some(EntityType::Artifact),
            selector: "artifact.name == 'x'".into(),
            description: "only x".into(),
        });

        let yaml = profile_to_yaml(&profile).expect("serialize");
        let parsed = parse_profile(yaml.as_bytes(), Some(Format::Yaml)).expect("parse");
        assert_eq!(parsed, profile);
    }

    #[test]
    fn loads_documents_from_directory() {
        let dir = std::env::temp_dir().join(format!("vigil-docs-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        fs::File::create(dir.join("rule.json"))
            .unwrap()
            .write_all(RULE_TYPE_JSON.as_bytes())
            .unwrap();
        fs::File::create(dir.join("profile.yaml"))
            .unwrap()
            .write_all(PROFILE_YAML.as_bytes())
            .unwrap();
        fs::File::create(dir.join("notes.txt"))
            .unwrap()
            .write_all(b"ignored")
            .unwrap();

        let documents = load_documents(&dir).expect("load");
        fs::remove_dir_all(&dir).ok();

        assert_eq!(documents.len(), 2);
        assert!(matches!(documents[0], Document::Profile(_)));
        assert!(matches!(documents[1], Document::RuleType(_)));
    }
}
