//! Naming and namespacing rules for rule types and profiles.
//!
//! A name may carry exactly one `/`; the prefix is its namespace. Namespaced names are
//! reserved for documents created by a subscription (bundle), plain names for users.

use std::sync::OnceLock;

use regex::Regex;
use uuid::Uuid;

use crate::error::RuleTypeError;

const MAX_NAME_LEN: usize = 200;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z][-_A-Za-z0-9]*(/[A-Za-z][-_A-Za-z0-9]*)?$")
            .unwrap_or_else(|err| unreachable!("static name pattern is valid: {err}"))
    })
}

/// Namespace prefix of a name, if any.
pub fn namespace_of(name: &str) -> Option<&str> {
    name.split_once('/').map(|(namespace, _)| namespace)
}

/// Checks the character set and shape of a rule type or profile name.
pub fn validate_name(name: &str) -> Result<(), RuleTypeError> {
    let invalid = |reason: &str| RuleTypeError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("name is too long"));
    }
    if name.matches('/').count() > 1 {
        return Err(invalid("name may contain at most one namespace separator"));
    }
    if !name_pattern().is_match(name) {
        return Err(invalid(
            "name must start with a letter and contain only letters, digits, '-' and '_'",
        ));
    }
    Ok(())
}

/// Namespacing rules applied when a document is created.
pub fn validate_namespace_for_create(
    name: &str,
    subscription_id: Option<Uuid>,
) -> Result<(), RuleTypeError> {
    validate_name(name)?;
    match (namespace_of(name), subscription_id) {
        (Some(_), None) => Err(RuleTypeError::NamespacedWithoutSubscription),
        (None, Some(_)) => Err(RuleTypeError::MissingNamespace(name.to_string())),
        _ => Ok(()),
    }
}

/// Namespacing rules applied when a document is replaced.
///
/// `existing_subscription` owns the stored document; `subscription_id` is the caller.
pub fn validate_namespace_for_update(
    existing_name: &str,
    existing_subscription: Option<Uuid>,
    new_name: &str,
    subscription_id: Option<Uuid>,
) -> Result<(), RuleTypeError> {
    validate_name(new_name)?;
    if namespace_of(existing_name) != namespace_of(new_name) {
        return Err(RuleTypeError::NamespaceChanged {
            old: existing_name.to_string(),
            new: new_name.to_string(),
        });
    }
    if existing_subscription.is_some() && existing_subscription != subscription_id {
        return Err(RuleTypeError::ManagedBySubscription(
            existing_name.to_string(),
        ));
    }
    validate_namespace_for_create(new_name, subscription_id)
}

/// Labels may only be set by subscriptions, and never change afterwards.
pub fn validate_labels(
    labels: &[String],
    subscription_id: Option<Uuid>,
    existing: Option<&[String]>,
) -> Result<(), RuleTypeError> {
    if let Some(existing) = existing {
        if existing != labels {
            return Err(RuleTypeError::LabelsImmutable);
        }
        return Ok(());
    }
    if !labels.is_empty() && subscription_id.is_none() {
        return Err(RuleTypeError::LabelsNotAllowed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("secret_scanning", true ; "plain")]
    #[test_case("stacklok/ctlog", true ; "namespaced")]
    #[test_case("a/b/c", false ; "two separators")]
    #[test_case("1abc", false ; "leading digit")]
    #[test_case("has space", false ; "whitespace")]
    #[test_case("", false ; "empty")]
    fn name_validation(name: &str, ok: bool) {
        assert_eq!(validate_name(name).is_ok(), ok);
    }

    #[test]
    fn namespaced_create_requires_subscription() {
        let err = validate_namespace_for_create("stacklok/ctlog", None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot create a rule type or profile with a namespace through the API"
        );
        assert!(validate_namespace_for_create("stacklok/ctlog", Some(Uuid::new_v4())).is_ok());
    }

    #[test]
    fn subscriptions_must_namespace() {
        assert!(matches!(
            validate_namespace_for_create("ctlog", Some(Uuid::new_v4())),
            Err(RuleTypeError::MissingNamespace(_))
        ));
    }

    #[test]
    fn updates_keep_namespace_and_owner() {
        let subscription = Some(Uuid::new_v4());
        assert!(validate_namespace_for_update(
            "stacklok/ctlog",
            subscription,
            "other/ctlog",
            subscription
        )
        .is_err());
        assert!(matches!(
            validate_namespace_for_update("stacklok/ctlog", subscription, "stacklok/ctlog", None),
            Err(RuleTypeError::ManagedBySubscription(_))
        ));
        assert!(validate_namespace_for_update("mine", None, "mine", None).is_ok());
    }

    #[test]
    fn labels_rules() {
        let labels = vec!["managed".to_string()];
        assert_eq!(
            validate_labels(&labels, None, None),
            Err(RuleTypeError::LabelsNotAllowed)
        );
        assert!(validate_labels(&labels, Some(Uuid::new_v4()), None).is_ok());
        assert_eq!(
            validate_labels(&[], None, Some(&labels)),
            Err(RuleTypeError::LabelsImmutable)
        );
    }
}
