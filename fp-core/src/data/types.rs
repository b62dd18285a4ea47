//! Outcome and result records shared by every component

use serde::{Deserialize, Serialize};

use crate::error::FpError;

/// Outcome of one stage or component call
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Warning,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Warning => "warning",
            Outcome::Failure => "failure",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-failing completion of a component call: success, or success with a
/// warning worth surfacing in the report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub outcome: Outcome,
    pub message: String,
}

impl Completion {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Success,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Warning,
            message: message.into(),
        }
    }

    pub fn is_warning(&self) -> bool {
        self.outcome == Outcome::Warning
    }
}

/// One entry of a run's audit trail. Field names are part of the report
/// format consumed by other tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl StageResult {
    pub fn from_completion(stage: &str, completion: Completion, duration_ms: u64) -> Self {
        Self {
            stage: stage.to_string(),
            outcome: completion.outcome,
            duration_ms,
            message: completion.message,
            error_kind: None,
            remediation: None,
        }
    }

    /// Record an error, optionally downgraded to a warning by `force`
    pub fn from_error(stage: &str, error: &FpError, duration_ms: u64, forced: bool) -> Self {
        let (outcome, message) = if forced {
            (
                Outcome::Warning,
                format!("{} (continuing because --force is set)", error),
            )
        } else {
            (Outcome::Failure, error.to_string())
        };

        Self {
            stage: stage.to_string(),
            outcome,
            duration_ms,
            message,
            error_kind: Some(error.kind().to_string()),
            remediation: if forced {
                None
            } else {
                error.remediation().map(str::to_string)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Outcome::Warning).unwrap(), "\"warning\"");
        let parsed: Outcome = serde_json::from_str("\"failure\"").unwrap();
        assert_eq!(parsed, Outcome::Failure);
    }

    #[test]
    fn test_outcome_ordering_is_severity() {
        assert!(Outcome::Success < Outcome::Warning);
        assert!(Outcome::Warning < Outcome::Failure);
    }

    #[test]
    fn test_forced_error_becomes_warning() {
        let err = FpError::load("module not present after insmod");
        let forced = StageResult::from_error("build_and_load", &err, 12, true);
        assert_eq!(forced.outcome, Outcome::Warning);
        assert!(forced.message.contains("--force"));
        assert_eq!(forced.error_kind.as_deref(), Some("load_error"));
        assert!(forced.remediation.is_none());

        let failed = StageResult::from_error("build_and_load", &err, 12, false);
        assert_eq!(failed.outcome, Outcome::Failure);
        assert!(failed.remediation.is_some());
    }

    #[test]
    fn test_optional_fields_omitted() {
        let result = StageResult::from_completion("device_rules", Completion::success("unchanged"), 3);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["stage"], "device_rules");
        assert_eq!(json["outcome"], "success");
        assert!(json.get("error_kind").is_none());
    }
}
