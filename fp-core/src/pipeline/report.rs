//! Run report consumed by CI and dashboards. Field names and outcome values
//! are a stable format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::data::{Outcome, StageResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Verification mode, absent for installation runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    pub success: bool,
    pub total_duration_ms: u64,
    pub stages: Vec<StageResult>,
}

impl PipelineReport {
    /// Success is the absence of failures; warnings do not count
    pub fn new(started_at: DateTime<Utc>, total_duration_ms: u64, stages: Vec<StageResult>) -> Self {
        let success = !stages.iter().any(|s| s.outcome == Outcome::Failure);
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            mode: None,
            success,
            total_duration_ms,
            stages,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == name)
    }

    pub fn has_stage(&self, name: &str) -> bool {
        self.stage(name).is_some()
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.stages.iter().filter(|s| s.outcome == outcome).count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Completion;

    #[test]
    fn test_warnings_do_not_fail_the_run() {
        let stages = vec![
            StageResult::from_completion("probe_environment", Completion::success("ok"), 3),
            StageResult::from_completion("compatibility_check", Completion::warning("no device detected"), 1),
        ];
        let report = PipelineReport::new(Utc::now(), 4, stages);
        assert!(report.success);
        assert_eq!(report.count(Outcome::Warning), 1);
        assert!(report.has_stage("compatibility_check"));
    }

    #[test]
    fn test_json_field_names_are_stable() {
        let error = crate::error::FpError::Detection("unknown".into());
        let report = PipelineReport::new(
            Utc::now(),
            7,
            vec![StageResult::from_error("resolve_dependencies", &error, 0, false)],
        );
        assert!(!report.success);

        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        for key in ["run_id", "started_at", "success", "total_duration_ms", "stages"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert!(value.get("mode").is_none());
        let stage = &value["stages"][0];
        assert_eq!(stage["stage"], "resolve_dependencies");
        assert_eq!(stage["outcome"], "failure");
        assert_eq!(stage["error_kind"], "detection_error");
        assert!(stage["remediation"].is_string());
    }
}
