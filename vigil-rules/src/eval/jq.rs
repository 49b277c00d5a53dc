use async_trait::async_trait;
use jsonpath_lib::select;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{EvalInput, EvalOutput, Evaluator};
use crate::error::{EngineError, EvalError};
use crate::expr::values_equal;
use crate::ingest::section_config;
use crate::rule_type::EvalSpec;

/// A jq-style accessor such as `.settings.branches[0]['required-checks']`, resolved as
/// the JSONPath `$.settings.branches[0]['required-checks']`.
#[derive(Debug, Clone, PartialEq)]
struct Path {
    raw: String,
    jsonpath: String,
}

impl Path {
    fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        let rest = trimmed
            .strip_prefix('.')
            .ok_or_else(|| format!("path {raw:?} must start with '.'"))?;
        let jsonpath = if rest.is_empty() || rest.starts_with('[') {
            format!("${rest}")
        } else {
            format!("$.{rest}")
        };
        select(&Value::Null, &jsonpath).map_err(|err| format!("invalid path {raw:?}: {err:?}"))?;
        Ok(Self {
            raw: trimmed.to_string(),
            jsonpath,
        })
    }

    /// Missing paths resolve to `null`; several matches resolve to an array of them.
    fn resolve(&self, document: &Value) -> Value {
        match select(document, &self.jsonpath) {
            Ok(matches) => match matches.as_slice() {
                [] => Value::Null,
                [single] => (*single).clone(),
                many => Value::Array(many.iter().map(|value| (*value).clone()).collect()),
            },
            Err(_) => Value::Null,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Accessor {
    def: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawAssertion {
    ingested: Accessor,
    #[serde(default)]
    profile: Option<Accessor>,
    #[serde(default)]
    constant: Option<Value>,
}

#[derive(Debug, Clone)]
enum Expected {
    Profile(Path),
    Constant(Value),
}

#[derive(Debug, Clone)]
struct Assertion {
    ingested: Path,
    expected: Expected,
}

/// Compares ingested values with values from the rule definition (or constants).
/// Every assertion must hold.
#[derive(Debug)]
pub struct JqEvaluator {
    assertions: Vec<Assertion>,
}

impl JqEvaluator {
    pub fn new(spec: &EvalSpec) -> Result<Self, EngineError> {
        let raw: Vec<RawAssertion> = section_config(spec, "jq evaluator")?;
        if raw.is_empty() {
            return Err(EngineError::config("jq evaluator", "no assertions configured"));
        }
        let assertions = raw
            .into_iter()
            .map(|assertion| {
                let ingested = Path::parse(&assertion.ingested.def)?;
                let expected = match (assertion.profile, assertion.constant) {
                    (Some(profile), None) => Expected::Profile(Path::parse(&profile.def)?),
                    (None, Some(constant)) => Expected::Constant(constant),
                    _ => {
                        return Err(format!(
                            "assertion on {} needs exactly one of profile or constant",
                            ingested.raw
                        ))
                    }
                };
                Ok(Assertion { ingested, expected })
            })
            .collect::<Result<Vec<_>, String>>()
            .map_err(|reason| EngineError::config("jq evaluator", reason))?;
        Ok(Self { assertions })
    }
}

#[async_trait]
impl Evaluator for JqEvaluator {
    fn kind(&self) -> &str {
        super::JQ
    }

    async fn eval(&self, input: &EvalInput<'_>) -> Result<EvalOutput, EvalError> {
        let mut mismatches = Vec::new();
        for assertion in &self.assertions {
            let actual = assertion.ingested.resolve(&input.ingested.object);
            let expected = match &assertion.expected {
                Expected::Profile(path) => path.resolve(input.def),
                Expected::Constant(value) => value.clone(),
            };
            if !values_equal(&actual, &expected) {
                mismatches.push(json!({
                    "path": assertion.ingested.raw,
                    "actual": actual,
                    "expected": expected,
                }));
            }
        }

        if mismatches.is_empty() {
            return Ok(EvalOutput::default());
        }
        let paths: Vec<&str> = mismatches
            .iter()
            .filter_map(|mismatch| mismatch["path"].as_str())
            .collect();
        Err(EvalError::Failed {
            message: format!("data does not match profile at {}", paths.join(", ")),
            details: json!({ "mismatches": mismatches }),
        })
    }
}
