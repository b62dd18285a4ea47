//! Compatibility Gate
//!
//! Hardware and environment checks run before anything is installed.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{device, paths};
use crate::data::{Completion, Outcome};
use crate::driver::DriverArtifact;
use crate::error::{FpError, Result};
use crate::host::Host;
use crate::service::InitSystem;
use crate::system::{SystemProfile, UNKNOWN};

/// Verdict of a gate run: the worst finding plus every non-passing reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReport {
    pub outcome: Outcome,
    pub reasons: Vec<String>,
}

impl GateReport {
    pub fn pass() -> Self {
        Self {
            outcome: Outcome::Success,
            reasons: Vec::new(),
        }
    }

    pub fn warning(reason: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Warning,
            reasons: vec![reason.into()],
        }
    }

    pub fn failure(reasons: Vec<String>) -> Self {
        Self {
            outcome: Outcome::Failure,
            reasons,
        }
    }

    fn record(&mut self, outcome: Outcome, reason: String) {
        self.outcome = self.outcome.max(outcome);
        self.reasons.push(reason);
    }

    /// Failure becomes [`FpError::CompatibilityFailure`]; anything else
    /// completes, with a warning when there were reasons.
    pub fn into_result(self) -> Result<Completion> {
        match self.outcome {
            Outcome::Failure => Err(FpError::CompatibilityFailure { reasons: self.reasons }),
            Outcome::Warning => Ok(Completion::warning(self.reasons.join("; "))),
            Outcome::Success => Ok(Completion::success("all compatibility checks passed")),
        }
    }
}

/// Anything that can judge a profile. The orchestrator only sees this trait.
pub trait CompatibilityCheck {
    fn check(&self, profile: &SystemProfile) -> GateReport;
}

/// The standard checks against a live host
pub struct CompatibilityGate<'a> {
    host: &'a dyn Host,
    artifact: DriverArtifact,
}

impl<'a> CompatibilityGate<'a> {
    pub fn new(host: &'a dyn Host, artifact: DriverArtifact) -> Self {
        Self { host, artifact }
    }
}

impl CompatibilityCheck for CompatibilityGate<'_> {
    fn check(&self, profile: &SystemProfile) -> GateReport {
        let mut report = GateReport::pass();

        if !profile.is_root {
            report.record(Outcome::Failure, "root privileges are required".to_string());
        }

        if profile.kernel_release == UNKNOWN {
            report.record(Outcome::Failure, "kernel release could not be determined".to_string());
        } else {
            let build_dir = paths::kernel_build_dir(&profile.kernel_release);
            if !self.host.path_exists(Path::new(&build_dir)) {
                report.record(
                    Outcome::Failure,
                    format!("kernel headers for {} not found at {}", profile.kernel_release, build_dir),
                );
            }
        }

        if !profile.has_target_device() {
            report.record(
                Outcome::Warning,
                format!("no device detected ({} {})", device::DEVICE_NAME, device::USB_ID),
            );
        }

        if profile.distribution_id == UNKNOWN {
            report.record(Outcome::Warning, "distribution not recognized".to_string());
        }

        if profile.init_system == InitSystem::Unknown {
            report.record(Outcome::Warning, "init system not recognized".to_string());
        }

        if !self.artifact.source_present(self.host) {
            report.record(
                Outcome::Failure,
                format!("driver source not found at {}", self.artifact.source_dir.display()),
            );
        }

        debug!(outcome = %report.outcome, reasons = report.reasons.len(), "Compatibility gate finished");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FakeHost;
    use crate::system::PackageManager;

    fn good_profile() -> SystemProfile {
        let mut profile = SystemProfile {
            distribution_id: "ubuntu".into(),
            distribution_version: "22.04".into(),
            package_manager: PackageManager::Apt,
            init_system: InitSystem::Systemd,
            kernel_release: "6.5.0-fake".into(),
            is_root: true,
            ..SystemProfile::unknown()
        };
        profile.detected_device_ids.insert(device::USB_ID.into());
        profile
    }

    fn ready_host() -> FakeHost {
        FakeHost::new()
            .with_file("/lib/modules/6.5.0-fake/build/Makefile", "")
            .with_file("/usr/src/fp_xiaomi/Makefile", "")
    }

    fn gate(host: &FakeHost) -> CompatibilityGate<'_> {
        CompatibilityGate::new(host, DriverArtifact::new("/usr/src/fp_xiaomi", "fp_xiaomi"))
    }

    #[test]
    fn test_all_checks_pass() {
        let host = ready_host();
        let report = gate(&host).check(&good_profile());
        assert_eq!(report, GateReport::pass());
        assert!(!report.into_result().unwrap().is_warning());
    }

    #[test]
    fn test_missing_device_is_warning() {
        let host = ready_host();
        let mut profile = good_profile();
        profile.detected_device_ids.clear();

        let report = gate(&host).check(&profile);
        assert_eq!(report.outcome, Outcome::Warning);
        assert!(report.reasons[0].starts_with("no device detected"));
    }

    #[test]
    fn test_failures_dominate_and_list_every_reason() {
        let host = FakeHost::new();
        let profile = SystemProfile {
            is_root: false,
            ..good_profile()
        };

        let report = gate(&host).check(&profile);
        assert_eq!(report.outcome, Outcome::Failure);
        assert_eq!(report.reasons.len(), 3);

        match report.into_result() {
            Err(FpError::CompatibilityFailure { reasons }) => assert!(reasons[0].contains("root")),
            other => panic!("expected compatibility failure, got {:?}", other),
        }
    }
}
