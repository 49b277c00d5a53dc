//! Backward-compatibility check for rule type updates.
//!
//! An update may only widen what a rule type accepts: every document valid under the old
//! `rule_schema` / `param_schema` must stay valid under the new one (after applying the
//! new schema's defaults). Length, range, size and format constraints may only be relaxed;
//! composition keywords and references may not be introduced or changed.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::error::RuleTypeError;
use crate::expr::values_equal;
use crate::rule_type::RuleType;
use crate::schema::is_empty_schema;

/// Validates that `new` can replace `old` without rejecting previously valid rules.
pub fn validate_rule_type_update(old: &RuleType, new: &RuleType) -> Result<(), RuleTypeError> {
    new.validate()
        .map_err(|err| RuleTypeError::invalid(&new.name, err.message))?;

    if old.def.in_entity != new.def.in_entity {
        return Err(RuleTypeError::invalid(
            &new.name,
            format!(
                "in_entity cannot change from {} to {}",
                old.def.in_entity, new.def.in_entity
            ),
        ));
    }

    check_schema_compat(&old.def.rule_schema, &new.def.rule_schema)
        .map_err(|reason| RuleTypeError::invalid(&new.name, format!("rule_schema: {reason}")))?;

    let old_params = old.def.param_schema.as_ref();
    let new_params = new.def.param_schema.as_ref();
    if !is_empty_schema(old_params) {
        if is_empty_schema(new_params) {
            return Err(RuleTypeError::invalid(
                &new.name,
                "param_schema: cannot be removed",
            ));
        }
        if let (Some(old_params), Some(new_params)) = (old_params, new_params) {
            check_schema_compat(old_params, new_params).map_err(|reason| {
                RuleTypeError::invalid(&new.name, format!("param_schema: {reason}"))
            })?;
        }
    }
    Ok(())
}

/// Checks that `new` accepts at least what `old` accepts.
pub fn check_schema_compat(old: &Value, new: &Value) -> Result<(), String> {
    compare("", old, new)
}

fn type_set(schema: &Value) -> Option<BTreeSet<String>> {
    match schema.get("type")? {
        Value::String(kind) => Some(BTreeSet::from([kind.clone()])),
        Value::Array(kinds) => Some(
            kinds
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        ),
        _ => None,
    }
}

fn required_set(schema: &Value) -> BTreeSet<String> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn properties(schema: &Value) -> Option<&Map<String, Value>> {
    schema.get("properties").and_then(Value::as_object)
}

fn location(path: &str) -> &str {
    if path.is_empty() {
        "<root>"
    } else {
        path
    }
}

fn child(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn compare(path: &str, old: &Value, new: &Value) -> Result<(), String> {
    compare_types(path, old, new)?;
    compare_enums(path, old, new)?;
    compare_required(path, old, new)?;
    compare_properties(path, old, new)?;

    compare_bounds(path, old, new)?;
    compare_fixed(path, old, new)?;
    compare_additional(path, old, new)?;

    match (old.get("items"), new.get("items")) {
        (Some(old_items), Some(new_items)) => compare(&format!("{path}[]"), old_items, new_items)?,
        (None, Some(_)) => {
            return Err(format!("{}: items constraint cannot be added", location(path)))
        }
        _ => {}
    }
    Ok(())
}

/// Keywords whose upper bound may only grow.
const UPPER_BOUNDS: &[&str] = &[
    "maxLength",
    "maximum",
    "exclusiveMaximum",
    "maxItems",
    "maxProperties",
    "maxContains",
];

/// Keywords whose lower bound may only shrink.
const LOWER_BOUNDS: &[&str] = &[
    "minLength",
    "minimum",
    "exclusiveMinimum",
    "minItems",
    "minProperties",
    "minContains",
];

/// Keywords that may not be introduced or changed at all.
const FIXED: &[&str] = &[
    "const",
    "pattern",
    "format",
    "allOf",
    "anyOf",
    "oneOf",
    "not",
    "if",
    "then",
    "else",
    "$ref",
    "$dynamicRef",
    "patternProperties",
    "propertyNames",
    "dependencies",
    "dependentRequired",
    "dependentSchemas",
    "prefixItems",
    "contains",
    "unevaluatedItems",
    "unevaluatedProperties",
];

fn compare_bounds(path: &str, old: &Value, new: &Value) -> Result<(), String> {
    for keyword in UPPER_BOUNDS {
        check_bound(path, keyword, old, new, |old, new| new >= old)?;
    }
    for keyword in LOWER_BOUNDS {
        check_bound(path, keyword, old, new, |old, new| new <= old)?;
    }

    if let Some(new_step) = new.get("multipleOf").and_then(Value::as_f64) {
        let divides = old
            .get("multipleOf")
            .and_then(Value::as_f64)
            .map_or(false, |old_step| (old_step / new_step).fract() == 0.0);
        if !divides {
            return Err(format!(
                "{}: multipleOf {new_step} rejects previously valid values",
                location(path)
            ));
        }
    }

    let unique = |schema: &Value| schema.get("uniqueItems") == Some(&Value::Bool(true));
    if unique(new) && !unique(old) {
        return Err(format!(
            "{}: uniqueItems cannot be introduced",
            location(path)
        ));
    }
    Ok(())
}

fn check_bound(
    path: &str,
    keyword: &str,
    old: &Value,
    new: &Value,
    widens: impl Fn(f64, f64) -> bool,
) -> Result<(), String> {
    let Some(new_bound) = new.get(keyword) else {
        return Ok(());
    };
    let new_bound = new_bound
        .as_f64()
        .ok_or_else(|| format!("{}: {keyword} must be a number", location(path)))?;
    match old.get(keyword).and_then(Value::as_f64) {
        Some(old_bound) if widens(old_bound, new_bound) => Ok(()),
        Some(old_bound) => Err(format!(
            "{}: {keyword} tightened from {old_bound} to {new_bound}",
            location(path)
        )),
        None => Err(format!(
            "{}: {keyword} cannot be introduced",
            location(path)
        )),
    }
}

fn compare_fixed(path: &str, old: &Value, new: &Value) -> Result<(), String> {
    for keyword in FIXED {
        let Some(new_value) = new.get(*keyword) else {
            continue;
        };
        match old.get(*keyword) {
            Some(old_value) if values_equal(old_value, new_value) => {}
            Some(_) => {
                return Err(format!("{}: {keyword} cannot change", location(path)));
            }
            None => {
                return Err(format!(
                    "{}: {keyword} cannot be introduced",
                    location(path)
                ));
            }
        }
    }
    Ok(())
}

fn compare_additional(path: &str, old: &Value, new: &Value) -> Result<(), String> {
    let open = |value: Option<&Value>| match value {
        None | Some(Value::Bool(true)) => true,
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    };
    let old_additional = old.get("additionalProperties");
    let new_additional = new.get("additionalProperties");
    if open(new_additional) || old_additional == Some(&Value::Bool(false)) {
        return Ok(());
    }
    match (old_additional, new_additional) {
        (Some(old_schema @ Value::Object(_)), Some(new_schema @ Value::Object(_))) => compare(
            &child(path, "additionalProperties"),
            old_schema,
            new_schema,
        ),
        _ if open(old_additional) && new_additional == Some(&Value::Bool(false)) => Err(format!(
            "{}: additional properties can no longer be closed",
            location(path)
        )),
        _ => Err(format!(
            "{}: additionalProperties narrowed",
            location(path)
        )),
    }
}

fn compare_types(path: &str, old: &Value, new: &Value) -> Result<(), String> {
    match (type_set(old), type_set(new)) {
        (None, Some(new_types)) => Err(format!(
            "{}: type narrowed to {new_types:?}",
            location(path)
        )),
        (Some(old_types), Some(new_types)) => {
            for kind in &old_types {
                let widened = kind == "integer" && new_types.contains("number");
                if !new_types.contains(kind) && !widened {
                    return Err(format!(
                        "{}: type {kind} is no longer accepted (now {new_types:?})",
                        location(path)
                    ));
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn compare_enums(path: &str, old: &Value, new: &Value) -> Result<(), String> {
    let old_enum = old.get("enum").and_then(Value::as_array);
    let new_enum = new.get("enum").and_then(Value::as_array);
    match (old_enum, new_enum) {
        (None, Some(_)) => Err(format!("{}: enum cannot be introduced", location(path))),
        (Some(old_values), Some(new_values)) => {
            for value in old_values {
                if !new_values.iter().any(|candidate| values_equal(candidate, value)) {
                    return Err(format!(
                        "{}: enum value {value} was removed",
                        location(path)
                    ));
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn compare_required(path: &str, old: &Value, new: &Value) -> Result<(), String> {
    let old_required = required_set(old);
    let new_required = required_set(new);
    if let Some(field) = old_required.difference(&new_required).next() {
        return Err(format!(
            "{}: field {field} must remain required",
            location(path)
        ));
    }
    for field in new_required.difference(&old_required) {
        let has_default = properties(new)
            .and_then(|props| props.get(field))
            .map_or(false, |schema| schema.get("default").is_some());
        if !has_default {
            return Err(format!(
                "{}: new required field {field} needs a default",
                location(path)
            ));
        }
    }
    Ok(())
}

fn compare_properties(path: &str, old: &Value, new: &Value) -> Result<(), String> {
    let Some(old_props) = properties(old) else {
        return Ok(());
    };
    let empty = Map::new();
    let new_props = properties(new).unwrap_or(&empty);
    for (key, old_schema) in old_props {
        let Some(new_schema) = new_props.get(key) else {
            return Err(format!("{}: property removed", child(path, key)));
        };
        compare(&child(path, key), old_schema, new_schema)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule_type::{PluginSpec, RuleTypeDef};
    use crate::schema::{apply_defaults, SchemaValidator};
    use serde_json::json;
    use test_case::test_case;
    use vigil_protocol::EntityType;

    fn rule_type(rule_schema: Value, param_schema: Option<Value>) -> RuleType {
        RuleType::new(
            "branch_protection",
            RuleTypeDef {
                in_entity: EntityType::Repository,
                rule_schema,
                param_schema,
                ingest: PluginSpec::new("rest"),
                eval: PluginSpec::new("jq"),
                remediate: None,
                alert: None,
            },
        )
    }

    fn enabled(kind: &str) -> Value {
        json!({
            "type": "object",
            "properties": {"enabled": {"type": kind}},
            "required": ["enabled"]
        })
    }

    #[test]
    fn narrowing_property_type_is_rejected() {
        let err = validate_rule_type_update(
            &rule_type(enabled("boolean"), None),
            &rule_type(enabled("string"), None),
        )
        .unwrap_err();
        assert!(matches!(err, RuleTypeError::RuleTypeInvalid { .. }));
        assert!(err.to_string().contains("enabled"));
    }

    #[test]
    fn identical_schema_is_compatible() {
        validate_rule_type_update(
            &rule_type(enabled("boolean"), None),
            &rule_type(enabled("boolean"), None),
        )
        .expect("compatible");
    }

    #[test_case(json!({"type": "integer"}), json!({"type": "number"}), true ; "integer widens to number")]
    #[test_case(json!({"type": "number"}), json!({"type": "integer"}), false ; "number narrows to integer")]
    #[test_case(json!({"type": "string"}), json!({"type": ["string", "null"]}), true ; "type union widens")]
    #[test_case(json!({}), json!({"type": "string"}), false ; "type introduced")]
    #[test_case(json!({"enum": ["a", "b"]}), json!({"enum": ["a", "b", "c"]}), true ; "enum extended")]
    #[test_case(json!({"enum": ["a", "b"]}), json!({"enum": ["a"]}), false ; "enum value removed")]
    #[test_case(json!({"enum": ["a"]}), json!({}), true ; "enum dropped")]
    #[test_case(json!({"type": "array", "items": {"type": "integer"}}), json!({"type": "array", "items": {"type": "string"}}), false ; "items narrowed")]
    #[test_case(json!({"type": "object"}), json!({"type": "object", "additionalProperties": false}), false ; "closed object")]
    #[test_case(
        json!({"type": "object", "properties": {"a": {"type": "string"}}}),
        json!({"type": "object", "properties": {}}),
        false ; "property removed")]
    #[test_case(
        json!({"type": "object", "properties": {"a": {"type": "string"}}}),
        json!({"type": "object", "properties": {"a": {"type": "string"}, "b": {"type": "integer"}}}),
        true ; "optional property added")]
    #[test_case(
        json!({"type": "object", "properties": {"a": {"type": "string"}}}),
        json!({"type": "object", "properties": {"a": {"type": "string"}, "b": {"type": "integer"}}, "required": ["b"]}),
        false ; "required property without default")]
    #[test_case(
        json!({"type": "object", "properties": {"a": {"type": "string"}}}),
        json!({"type": "object", "properties": {"a": {"type": "string"}, "b": {"type": "integer", "default": 3}}, "required": ["b"]}),
        true ; "required property with default")]
    #[test_case(
        json!({"type": "object", "properties": {"a": {"type": "string"}}, "required": ["a"]}),
        json!({"type": "object", "properties": {"a": {"type": "string"}}}),
        false ; "required dropped")]
    fn schema_compatibility(old: Value, new: Value, compatible: bool) {
        assert_eq!(check_schema_compat(&old, &new).is_ok(), compatible);
    }

    #[test_case(json!({"type": "string"}), json!({"type": "string", "maxLength": 3}), json!("longer") ; "max length introduced")]
    #[test_case(json!({"type": "string", "maxLength": 8}), json!({"type": "string", "maxLength": 3}), json!("longer") ; "max length tightened")]
    #[test_case(json!({"type": "string", "minLength": 1}), json!({"type": "string", "minLength": 2}), json!("a") ; "min length raised")]
    #[test_case(json!({"type": "string"}), json!({"type": "string", "pattern": "^a"}), json!("b") ; "pattern introduced")]
    #[test_case(json!({"type": "integer"}), json!({"type": "integer", "minimum": 0}), json!(-1) ; "minimum introduced")]
    #[test_case(json!({"type": "integer", "maximum": 10}), json!({"type": "integer", "exclusiveMaximum": 10}), json!(10) ; "maximum made exclusive")]
    #[test_case(json!({"type": "integer", "multipleOf": 2}), json!({"type": "integer", "multipleOf": 4}), json!(2) ; "multiple of coarsened")]
    #[test_case(json!({}), json!({"const": "a"}), json!("b") ; "const introduced")]
    #[test_case(json!({"type": "array"}), json!({"type": "array", "maxItems": 1}), json!([1, 2]) ; "max items introduced")]
    #[test_case(json!({"type": "array"}), json!({"type": "array", "uniqueItems": true}), json!([1, 1]) ; "unique items introduced")]
    #[test_case(json!({"type": "object"}), json!({"type": "object", "minProperties": 1}), json!({}) ; "min properties introduced")]
    #[test_case(json!({"type": "object"}), json!({"type": "object", "additionalProperties": {"type": "string"}}), json!({"x": 1}) ; "additional properties typed")]
    #[test_case(
        json!({"type": "object", "additionalProperties": {"type": ["string", "integer"]}}),
        json!({"type": "object", "additionalProperties": {"type": "string"}}),
        json!({"x": 1}) ; "additional properties narrowed")]
    #[test_case(json!({}), json!({"anyOf": [{"type": "string"}]}), json!(1) ; "any of introduced")]
    #[test_case(json!({}), json!({"not": {"type": "integer"}}), json!(1) ; "not introduced")]
    fn narrowing_constraints_are_rejected(old: Value, new: Value, document: Value) {
        let old_validator = SchemaValidator::compile(&old).unwrap();
        let new_validator = SchemaValidator::compile(&new).unwrap();
        assert!(old_validator.validate(&document).is_ok());
        assert!(new_validator.validate(&document).is_err());
        assert!(check_schema_compat(&old, &new).is_err());
    }

    #[test_case(json!({"type": "string", "maxLength": 3}), json!({"type": "string", "maxLength": 8}) ; "max length raised")]
    #[test_case(json!({"type": "string", "maxLength": 3}), json!({"type": "string"}) ; "max length dropped")]
    #[test_case(json!({"type": "integer", "minimum": 5}), json!({"type": "integer", "minimum": 0}) ; "minimum lowered")]
    #[test_case(json!({"type": "integer", "multipleOf": 4}), json!({"type": "integer", "multipleOf": 2}) ; "multiple of refined")]
    #[test_case(json!({"pattern": "^a"}), json!({"pattern": "^a"}) ; "pattern kept")]
    #[test_case(
        json!({"type": "object", "additionalProperties": {"type": "string"}}),
        json!({"type": "object", "additionalProperties": {"type": ["string", "null"]}}) ; "additional properties widened")]
    #[test_case(
        json!({"type": "object", "additionalProperties": false}),
        json!({"type": "object", "additionalProperties": {"type": "string"}}) ; "closed object reopened")]
    fn widening_constraints_are_accepted(old: Value, new: Value) {
        check_schema_compat(&old, &new).expect("compatible");
    }

    #[test]
    fn param_schema_cannot_be_removed() {
        let params = json!({"type": "object", "properties": {"branch": {"type": "string"}}});
        let err = validate_rule_type_update(
            &rule_type(json!({}), Some(params)),
            &rule_type(json!({}), None),
        )
        .unwrap_err();
        assert!(err.to_string().contains("param_schema"));
    }

    #[test]
    fn in_entity_cannot_change() {
        let old = rule_type(json!({}), None);
        let mut new = old.clone();
        new.def.in_entity = EntityType::Artifact;
        assert!(validate_rule_type_update(&old, &new).is_err());
    }

    #[test]
    fn compatible_updates_keep_accepting_old_documents() {
        let old = json!({
            "type": "object",
            "properties": {
                "enabled": {"type": "boolean"},
                "level": {"type": "integer", "enum": [1, 2]},
                "paths": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["enabled"]
        });
        let new = json!({
            "type": "object",
            "properties": {
                "enabled": {"type": "boolean"},
                "level": {"type": "number", "enum": [1, 2, 3]},
                "paths": {"type": "array", "items": {"type": ["string", "null"]}},
                "mode": {"type": "string", "default": "strict"}
            },
            "required": ["enabled", "mode"]
        });
        check_schema_compat(&old, &new).expect("compatible");

        let old_validator = SchemaValidator::compile(&old).unwrap();
        let new_validator = SchemaValidator::compile(&new).unwrap();
        let documents = [
            json!({"enabled": true}),
            json!({"enabled": false, "level": 2}),
            json!({"enabled": true, "paths": ["a", "b"]}),
            json!({"enabled": true, "level": 1, "paths": [], "extra": 7}),
        ];
        for document in documents {
            assert!(old_validator.validate(&document).is_ok());
            let mut upgraded = document.clone();
            apply_defaults(&new, &mut upgraded);
            assert!(
                new_validator.validate(&upgraded).is_ok(),
                "{document} rejected after update"
            );
        }
    }
}
