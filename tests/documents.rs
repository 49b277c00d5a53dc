mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use test_case::test_case;
use vigil::engine::{RuleTypeService, ServiceError};
use vigil::protocol::{Properties, PropertyValue};
use vigil::rules::{
    parse_profile, profile_to_yaml, ActionState, RuleInvocation, RuleTypeError,
};

use common::{passthrough_rule_type, profile, World};

fn tag_shaped_struct(tag: &str, value: &str) -> PropertyValue {
    PropertyValue::Struct(BTreeMap::from([
        ("type".to_string(), PropertyValue::from(tag)),
        ("value".to_string(), PropertyValue::from(value)),
    ]))
}

#[test_case(PropertyValue::Int64(i64::MIN) ; "smallest signed")]
#[test_case(PropertyValue::Int64(i64::MAX) ; "largest signed")]
#[test_case(PropertyValue::Uint64(u64::MAX) ; "largest unsigned")]
#[test_case(PropertyValue::Double(0.5) ; "fraction")]
#[test_case(PropertyValue::List(vec![PropertyValue::Bool(true), PropertyValue::from("x")]) ; "list")]
#[test_case(tag_shaped_struct("int64", "5") ; "struct shaped like an int64")]
#[test_case(tag_shaped_struct("struct", "x") ; "struct shaped like a struct tag")]
fn property_values_survive_the_wire(value: PropertyValue) {
    let props = Properties::new([("value", value)]).unwrap();
    let wire = serde_json::to_string(&props.to_wire()).unwrap();
    let decoded: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&wire).unwrap();
    assert_eq!(Properties::from_wire(&decoded).unwrap(), props);
}

#[test]
fn non_finite_doubles_never_reach_the_wire() {
    assert!(Properties::new([("score", PropertyValue::Double(f64::NAN))]).is_err());
}

#[test]
fn large_integers_are_tagged_on_the_wire() {
    let props = Properties::new([("id", PropertyValue::Uint64(u64::MAX))]).unwrap();
    assert_eq!(
        serde_json::Value::Object(props.to_wire()),
        json!({"id": {"type": "uint64", "value": "18446744073709551615"}})
    );
}

#[test]
fn profile_yaml_round_trips() {
    let world = World::new();
    let original = profile(
        "test-profile",
        world.project_id,
        vec![
            RuleInvocation::new("passthrough", json!({})),
            RuleInvocation::new("branch_protection", json!({"enabled": true}))
                .with_name("main-branch")
                .with_params(json!({"branch": "main"})),
        ],
        ActionState::Off,
        ActionState::DryRun,
    );

    let yaml = profile_to_yaml(&original).unwrap();
    let parsed = parse_profile(yaml.as_bytes(), None).unwrap();
    assert_eq!(parsed, original);
}

fn enabled_schema(kind: &str) -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {"enabled": {"type": kind}},
        "required": ["enabled"]
    })
}

#[tokio::test]
async fn incompatible_rule_type_update_is_rejected() {
    let world = World::new();
    let service = RuleTypeService::new(Arc::new(world.store.clone()));
    let mut original = passthrough_rule_type(world.project_id);
    original.def.rule_schema = enabled_schema("boolean");
    service
        .create_rule_type(world.project_id, original, None)
        .await
        .unwrap();

    let mut changed = passthrough_rule_type(world.project_id);
    changed.def.rule_schema = enabled_schema("string");
    let err = service
        .update_rule_type(world.project_id, changed, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::RuleType(RuleTypeError::RuleTypeInvalid { .. })
    ));
}

#[tokio::test]
async fn namespaced_rule_type_needs_a_subscription() {
    let world = World::new();
    let service = RuleTypeService::new(Arc::new(world.store.clone()));
    let mut rule_type = passthrough_rule_type(world.project_id);
    rule_type.name = "stacklok/passthrough".into();

    let err = service
        .create_rule_type(world.project_id, rule_type, None)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "cannot create a rule type or profile with a namespace through the API"
    );
}
