use std::fmt;

use serde_json::Value;

/// A compiled JSON Schema together with its source document.
pub struct SchemaValidator {
    schema: Value,
    validator: jsonschema::Validator,
}

impl fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaValidator")
            .field("schema", &self.schema)
            .finish()
    }
}

impl SchemaValidator {
    pub fn compile(schema: &Value) -> Result<Self, String> {
        let validator = jsonschema::validator_for(schema).map_err(|err| err.to_string())?;
        Ok(Self {
            schema: schema.clone(),
            validator,
        })
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    /// Validates an instance, returning every violation as `<json pointer>: <message>`.
    pub fn validate(&self, instance: &Value) -> Result<(), Vec<String>> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(instance)
            .map(|err| format!("{}: {}", err.instance_path, err))
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Whether a schema declares nothing at all (absent, `null` or `{}`).
pub fn is_empty_schema(schema: Option<&Value>) -> bool {
    match schema {
        None | Some(Value::Null) => true,
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

/// Fills in `default` values declared by object properties that the instance omits.
pub fn apply_defaults(schema: &Value, instance: &mut Value) {
    let (Some(properties), Some(target)) = (
        schema.get("properties").and_then(Value::as_object),
        instance.as_object_mut(),
    ) else {
        return;
    };
    for (key, property) in properties {
        match target.get_mut(key) {
            Some(existing) => apply_defaults(property, existing),
            None => {
                if let Some(default) = property.get("default") {
                    target.insert(key.clone(), default.clone());
                }
            }
        }
    }
}
