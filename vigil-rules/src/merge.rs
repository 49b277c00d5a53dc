use std::collections::BTreeMap;

use tracing::warn;
use uuid::Uuid;
use vigil_protocol::EntityType;

use crate::profile::{ActionState, Profile, ProfileSelector, RuleInvocation};
use crate::rule_type::Context;

/// One row of a profile listing: the profile header plus the JSON-packed rules of one
/// entity type. A profile without rules yields a row with no entity type.
#[derive(Debug, Clone, Default)]
pub struct ProfileRow {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    pub project_id: Uuid,
    pub remediate: Option<String>,
    pub alert: Option<String>,
    pub labels: Vec<String>,
    pub subscription_id: Option<Uuid>,
    pub selectors: Vec<ProfileSelector>,
    pub entity_type: Option<String>,
    pub contextual_rules: Option<Vec<u8>>,
}

fn action_state(profile: &str, field: &str, raw: Option<&str>) -> Option<ActionState> {
    let raw = raw.filter(|value| !value.is_empty())?;
    match raw.parse() {
        Ok(state) => Some(state),
        Err(err) => {
            warn!(profile, field, error = %err, "ignoring stored action state");
            None
        }
    }
}

fn header(row: &ProfileRow) -> Profile {
    let mut profile = Profile::new(row.name.clone());
    profile.id = Some(row.id);
    profile.display_name = row.display_name.clone();
    profile.context = Some(Context::for_project(row.project_id));
    profile.remediate = action_state(&row.name, "remediate", row.remediate.as_deref());
    profile.alert = action_state(&row.name, "alert", row.alert.as_deref());
    profile.labels = row.labels.clone();
    profile.subscription_id = row.subscription_id;
    profile.selection = row.selectors.clone();
    profile
}

/// Groups rows by profile name and assembles each profile.
///
/// A ruleset that fails to decode is logged and skipped; the rest of the profile (and
/// the other profiles) are still returned. Profiles come back ordered by name.
pub fn merge_profile_rows(rows: impl IntoIterator<Item = ProfileRow>) -> Vec<Profile> {
    let mut profiles: BTreeMap<String, Profile> = BTreeMap::new();

    for row in rows {
        let profile = profiles
            .entry(row.name.clone())
            .or_insert_with(|| header(&row));

        let Some(raw_entity) = row.entity_type.as_deref() else {
            continue;
        };
        let entity_type: EntityType = match raw_entity.parse() {
            Ok(entity_type) => entity_type,
            Err(err) => {
                warn!(profile = %row.name, error = %err, "skipping ruleset with unknown entity type");
                continue;
            }
        };
        let Some(packed) = row.contextual_rules.as_deref() else {
            continue;
        };
        match serde_json::from_slice::<Vec<RuleInvocation>>(packed) {
            Ok(rules) if rules.is_empty() => {}
            Ok(rules) => {
                profile.rules.insert(entity_type, rules);
            }
            Err(err) => {
                warn!(
                    profile = %row.name,
                    entity_type = %entity_type,
                    error = %err,
                    "skipping ruleset that failed to decode"
                );
            }
        }
    }

    profiles.into_values().collect()
}
