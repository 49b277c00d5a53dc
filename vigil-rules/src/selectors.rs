use serde_json::{Map, Value};
use vigil_protocol::{EntityType, EntityWithProperties};

use crate::error::ExprError;
use crate::expr::Expr;
use crate::profile::ProfileSelector;

#[derive(Debug, Clone)]
struct CompiledSelector {
    entity: Option<EntityType>,
    expr: Expr,
    source: String,
    description: String,
}

/// Result of checking a profile's selectors against one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selected {
    Yes,
    No { selector: String, description: String },
}

impl Selected {
    pub fn is_selected(&self) -> bool {
        matches!(self, Selected::Yes)
    }
}

/// Compiled selectors of one profile.
///
/// Each selector sees the entity document twice: under `entity` and under its entity
/// type name (`repository.name == "foo/test"`). A selector bound to another entity
/// type is ignored.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    selectors: Vec<CompiledSelector>,
}

impl Selection {
    pub fn compile(selectors: &[ProfileSelector]) -> Result<Self, ExprError> {
        let selectors = selectors
            .iter()
            .map(|selector| {
                Ok(CompiledSelector {
                    entity: selector.entity,
                    expr: Expr::parse(&selector.selector)?,
                    source: selector.selector.clone(),
                    description: selector.description.clone(),
                })
            })
            .collect::<Result<Vec<_>, ExprError>>()?;
        Ok(Self { selectors })
    }

    pub fn is_empty(&self) -> bool {
        self.selectors.is_empty()
    }

    pub fn select(&self, entity: &EntityWithProperties) -> Result<Selected, ExprError> {
        if self.selectors.is_empty() {
            return Ok(Selected::Yes);
        }
        let entity_type = entity.entity_type();
        let document = entity.to_document();
        let mut root = Map::new();
        root.insert("entity".to_string(), document.clone());
        root.insert(entity_type.as_str().to_string(), document);
        let root = Value::Object(root);

        for selector in &self.selectors {
            if selector.entity.map_or(false, |bound| bound != entity_type) {
                continue;
            }
            if !selector.expr.eval_bool(&root)? {
                return Ok(Selected::No {
                    selector: selector.source.clone(),
                    description: selector.description.clone(),
                });
            }
        }
        Ok(Selected::Yes)
    }
}
