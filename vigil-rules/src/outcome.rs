//! Evaluation and action outcomes and their persisted status values.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ActionError, EvalError};
use crate::eval::EvalOutput;
use crate::ingest::IngestResult;

macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} {other:?}", stringify!($name))),
                }
            }
        }
    };
}

status_enum!(
    /// Persisted evaluation status.
    EvalStatus {
        Success => "success",
        Failure => "failure",
        Skipped => "skipped",
        Error => "error",
        Pending => "pending",
    }
);

status_enum!(
    RemediationStatus {
        Success => "success",
        Failure => "failure",
        Skipped => "skipped",
        Error => "error",
        NotAvailable => "not_available",
        Pending => "pending",
    }
);

status_enum!(
    AlertStatus {
        On => "on",
        Off => "off",
        Error => "error",
        Skipped => "skipped",
        NotAvailable => "not_available",
    }
);

impl EvalStatus {
    pub fn from_result(result: &Result<EvalOutput, EvalError>) -> Self {
        match result {
            Ok(_) => EvalStatus::Success,
            Err(EvalError::Failed { .. }) => EvalStatus::Failure,
            Err(EvalError::Skipped(_)) | Err(EvalError::SkipSilently) => EvalStatus::Skipped,
            Err(EvalError::Error(_)) => EvalStatus::Error,
        }
    }
}

impl RemediationStatus {
    pub fn from_result(result: &Result<ActionOutput, ActionError>) -> Self {
        match result {
            Ok(_) => RemediationStatus::Success,
            Err(ActionError::Failed(_)) => RemediationStatus::Failure,
            Err(ActionError::Skipped(_)) | Err(ActionError::RemediationSkipped) => {
                RemediationStatus::Skipped
            }
            Err(ActionError::NotAvailable(_)) => RemediationStatus::NotAvailable,
            Err(ActionError::Error(_)) => RemediationStatus::Error,
        }
    }
}

impl AlertStatus {
    pub fn from_result(result: &Result<AlertOutput, ActionError>) -> Self {
        match result {
            Ok(output) => output.status,
            Err(ActionError::Skipped(_)) | Err(ActionError::RemediationSkipped) => {
                AlertStatus::Skipped
            }
            Err(ActionError::NotAvailable(_)) => AlertStatus::NotAvailable,
            Err(ActionError::Failed(_)) | Err(ActionError::Error(_)) => AlertStatus::Error,
        }
    }
}

/// Result of evaluating one rule invocation.
#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub result: Result<EvalOutput, EvalError>,
    /// Ingested data the evaluation ran on, when ingest succeeded.
    pub ingested: Option<Arc<IngestResult>>,
}

impl EvalOutcome {
    pub fn new(result: Result<EvalOutput, EvalError>) -> Self {
        Self {
            result,
            ingested: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Err(EvalError::Error(message.into())))
    }

    pub fn status(&self) -> EvalStatus {
        EvalStatus::from_result(&self.result)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.result, Err(EvalError::Failed { .. }))
    }

    pub fn is_skip_silently(&self) -> bool {
        matches!(self.result, Err(EvalError::SkipSilently))
    }

    /// Human-readable details stored with the evaluation row.
    pub fn details(&self) -> String {
        match &self.result {
            Ok(_) => String::new(),
            Err(EvalError::Failed { message, .. }) => message.clone(),
            Err(err) => err.to_string(),
        }
    }

    /// Structured view handed to action templates as `eval`.
    pub fn to_document(&self) -> Value {
        let details = match &self.result {
            Ok(output) => output.details.clone(),
            Err(EvalError::Failed { details, .. }) => details.clone(),
            Err(_) => Value::Null,
        };
        json!({
            "status": self.status().as_str(),
            "message": self.details(),
            "details": details,
        })
    }
}

/// Statuses recorded by the previous evaluation of the same rule, profile and entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreviousEvaluation {
    pub eval_status: Option<EvalStatus>,
    pub remediation_status: Option<RemediationStatus>,
    pub alert_status: Option<AlertStatus>,
    pub remediation_metadata: Value,
    pub alert_metadata: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutput {
    pub details: Value,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertOutput {
    pub status: AlertStatus,
    pub details: Value,
    pub metadata: Value,
}

/// Outcome of the remediate and alert slots of one rule evaluation.
#[derive(Debug, Clone)]
pub struct ActionsOutcome {
    pub remediate: Result<ActionOutput, ActionError>,
    pub alert: Result<AlertOutput, ActionError>,
}

fn error_details(err: &ActionError) -> Value {
    json!({ "error": err.to_string() })
}

impl ActionsOutcome {
    /// Both slots skipped, e.g. because evaluation never ran.
    pub fn skipped(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            remediate: Err(ActionError::Skipped(reason.clone())),
            alert: Err(ActionError::Skipped(reason)),
        }
    }

    pub fn remediate_status(&self) -> RemediationStatus {
        RemediationStatus::from_result(&self.remediate)
    }

    pub fn alert_status(&self) -> AlertStatus {
        AlertStatus::from_result(&self.alert)
    }

    pub fn remediate_details(&self) -> Value {
        match &self.remediate {
            Ok(output) => output.details.clone(),
            Err(err) => error_details(err),
        }
    }

    pub fn remediate_metadata(&self) -> Value {
        match &self.remediate {
            Ok(output) => output.metadata.clone(),
            Err(_) => Value::Null,
        }
    }

    pub fn alert_details(&self) -> Value {
        match &self.alert {
            Ok(output) => output.details.clone(),
            Err(err) => error_details(err),
        }
    }

    pub fn alert_metadata(&self) -> Value {
        match &self.alert {
            Ok(output) => output.metadata.clone(),
            Err(_) => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Ok(EvalOutput::default()), EvalStatus::Success ; "success")]
    #[test_case(Err(EvalError::failed("no")), EvalStatus::Failure ; "failure")]
    #[test_case(Err(EvalError::Skipped("x".into())), EvalStatus::Skipped ; "skipped")]
    #[test_case(Err(EvalError::SkipSilently), EvalStatus::Skipped ; "skip silently")]
    #[test_case(Err(EvalError::Error("db".into())), EvalStatus::Error ; "error")]
    fn eval_status_translation(result: Result<EvalOutput, EvalError>, expected: EvalStatus) {
        assert_eq!(EvalStatus::from_result(&result), expected);
    }

    #[test_case(Err(ActionError::RemediationSkipped), RemediationStatus::Skipped ; "remediation skipped")]
    #[test_case(Err(ActionError::NotAvailable("none".into())), RemediationStatus::NotAvailable ; "not available")]
    #[test_case(Err(ActionError::Failed("500".into())), RemediationStatus::Failure ; "failed")]
    #[test_case(Ok(ActionOutput::default()), RemediationStatus::Success ; "success")]
    fn remediation_status_translation(
        result: Result<ActionOutput, ActionError>,
        expected: RemediationStatus,
    ) {
        assert_eq!(RemediationStatus::from_result(&result), expected);
    }

    #[test]
    fn statuses_parse_their_own_text() {
        for status in [
            AlertStatus::On,
            AlertStatus::Off,
            AlertStatus::Error,
            AlertStatus::Skipped,
            AlertStatus::NotAvailable,
        ] {
            assert_eq!(status.as_str().parse::<AlertStatus>().unwrap(), status);
        }
        assert_eq!(
            serde_json::to_value(RemediationStatus::NotAvailable).unwrap(),
            json!("not_available")
        );
        assert!("maybe".parse::<EvalStatus>().is_err());
    }

    #[test]
    fn failure_outcome_exposes_message_and_details() {
        let outcome = EvalOutcome::new(Err(EvalError::Failed {
            message: "branch unprotected".into(),
            details: json!({"branch": "main"}),
        }));
        assert!(outcome.is_failure());
        assert_eq!(outcome.details(), "branch unprotected");
        let doc = outcome.to_document();
        assert_eq!(doc["status"], "failure");
        assert_eq!(doc["details"]["branch"], "main");
    }

    #[test]
    fn skipped_actions_record_reason() {
        let outcome = ActionsOutcome::skipped("evaluation error");
        assert_eq!(outcome.remediate_status(), RemediationStatus::Skipped);
        assert_eq!(outcome.alert_status(), AlertStatus::Skipped);
        assert_eq!(
            outcome.alert_details()["error"],
            "action skipped: evaluation error"
        );
    }
}
