//! `{{ path }}` placeholder rendering for endpoints and request bodies.

use serde_json::{Map, Value};
use vigil_protocol::EntityWithProperties;

use crate::expr::Expr;

/// Builds the root document placeholders are resolved against.
///
/// Entity properties are reachable both at the top level (`{{ owner }}`) and under
/// `properties`; `entity`, `params` and `profile` (the rule definition) are also bound.
pub fn context(entity: &EntityWithProperties, def: &Value, params: &Value) -> Map<String, Value> {
    let properties = entity.properties.to_plain_json();
    let mut root = match &properties {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    root.insert("properties".into(), properties);
    root.insert("entity".into(), entity.to_document());
    root.insert("params".into(), params.clone());
    root.insert("profile".into(), def.clone());
    root
}

fn resolve(expression: &str, root: &Value) -> Result<Value, String> {
    let expr = Expr::parse(expression).map_err(|err| format!("{{{{ {expression} }}}}: {err}"))?;
    let value = expr
        .eval(root)
        .map_err(|err| format!("{{{{ {expression} }}}}: {err}"))?;
    if value.is_null() {
        return Err(format!("{{{{ {expression} }}}} has no value"));
    }
    Ok(value)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Renders every placeholder in `template`. Unresolvable placeholders are errors.
pub fn render_str(template: &str, root: &Value) -> Result<String, String> {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| format!("unterminated placeholder in {template:?}"))?;
        output.push_str(&stringify(&resolve(after[..end].trim(), root)?));
        rest = &after[end + 2..];
    }
    output.push_str(rest);
    Ok(output)
}

/// Renders placeholders inside every string of a JSON value.
///
/// A string consisting of a single placeholder is replaced by the resolved value itself,
/// so numbers and objects keep their type.
pub fn render_value(template: &Value, root: &Value) -> Result<Value, String> {
    match template {
        Value::String(text) => {
            let trimmed = text.trim();
            if let Some(inner) = trimmed
                .strip_prefix("{{")
                .and_then(|rest| rest.strip_suffix("}}"))
                .filter(|inner| !inner.contains("{{") && !inner.contains("}}"))
            {
                return resolve(inner.trim(), root);
            }
            render_str(text, root).map(Value::String)
        }
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(item, root))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| Ok((key.clone(), render_value(value, root)?)))
            .collect::<Result<Map<_, _>, String>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}
