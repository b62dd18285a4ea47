//! Read-only verification runner
//!
//! Runs subsets of the pipeline's checks without installing anything and
//! reports them in the same format as an installation run.

use std::str::FromStr;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data::{Completion, InstallerConfig, Outcome, StageResult, StateLayout};
use crate::error::FpError;
use crate::fallback::{FallbackManager, Strategy};
use crate::gate::{CompatibilityCheck, CompatibilityGate};
use crate::host::Host;
use crate::pipeline::{post_install_checks, stages, Aborted, Controller, PipelineReport, Policy};
use crate::system;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Compatibility gate only
    Quick,
    /// Gate and post-install checks
    Standard,
    /// Standard plus per-strategy availability
    Comprehensive,
    /// Standard, always reported as JSON
    Ci,
    /// Comprehensive with debug logging
    Development,
    /// Comprehensive; warnings fail the run
    Release,
}

impl RunMode {
    pub const ALL: [RunMode; 6] = [
        RunMode::Quick,
        RunMode::Standard,
        RunMode::Comprehensive,
        RunMode::Ci,
        RunMode::Development,
        RunMode::Release,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Quick => "quick",
            RunMode::Standard => "standard",
            RunMode::Comprehensive => "comprehensive",
            RunMode::Ci => "ci",
            RunMode::Development => "development",
            RunMode::Release => "release",
        }
    }

    fn runs_post_install(&self) -> bool {
        !matches!(self, RunMode::Quick)
    }

    fn runs_strategy_checks(&self) -> bool {
        matches!(self, RunMode::Comprehensive | RunMode::Development | RunMode::Release)
    }

    pub fn forces_json(&self) -> bool {
        matches!(self, RunMode::Ci)
    }

    pub fn debug_logging(&self) -> bool {
        matches!(self, RunMode::Development)
    }

    pub fn strict(&self) -> bool {
        matches!(self, RunMode::Release)
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = FpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunMode::ALL
            .into_iter()
            .find(|m| m.as_str() == s.to_ascii_lowercase())
            .ok_or_else(|| FpError::config(format!("unknown verification mode {:?}", s)))
    }
}

/// Stage name of a strategy availability check
pub fn strategy_stage(strategy: Strategy) -> String {
    format!("strategy_{}", strategy.as_str().replace('-', "_"))
}

pub struct Verifier<'a> {
    host: &'a dyn Host,
    layout: StateLayout,
    config: InstallerConfig,
    gate: Option<Box<dyn CompatibilityCheck + 'a>>,
}

impl<'a> Verifier<'a> {
    pub fn new(host: &'a dyn Host, layout: StateLayout, config: InstallerConfig) -> Self {
        Self {
            host,
            layout,
            config,
            gate: None,
        }
    }

    pub fn with_gate(mut self, gate: Box<dyn CompatibilityCheck + 'a>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn run(&self, mode: RunMode) -> PipelineReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(%mode, "Starting verification");

        let mut ctl = Controller::new(false);
        let _ = self.checks(mode, &mut ctl);
        let results = ctl.into_results();

        let mut report = PipelineReport::new(started_at, clock.elapsed().as_millis() as u64, results);
        report.mode = Some(mode.to_string());
        if mode.strict() && report.count(Outcome::Warning) > 0 {
            report.success = false;
        }
        info!(%mode, success = report.success, "Verification finished");
        report
    }

    fn checks(&self, mode: RunMode, ctl: &mut Controller) -> Result<(), Aborted> {
        let host = self.host;

        let profile = system::probe(host);
        let message = format!(
            "{} {} ({}, {})",
            profile.distribution_id, profile.distribution_version, profile.package_manager, profile.init_system
        );
        ctl.record(stages::PROBE, Policy::Fatal, Instant::now(), Ok(((), Completion::success(message))))?;

        // Failures are reported, not fatal: every check should run
        let started = Instant::now();
        let report = match &self.gate {
            Some(gate) => gate.check(&profile),
            None => CompatibilityGate::new(host, self.config.artifact()).check(&profile),
        };
        let gate_result = report.into_result().map(|done| ((), done));
        record_failure_and_continue(ctl, stages::COMPATIBILITY, started, gate_result);

        if mode.runs_post_install() {
            for (name, started, result) in post_install_checks(host, &self.config.module_name) {
                ctl.record(name, Policy::Advisory, started, result.map(|c| ((), c)))?;
            }
        }

        if mode.runs_strategy_checks() {
            let manager = FallbackManager::new(host, self.layout.clone(), self.config.clone());
            let list = manager.list().unwrap_or_default();
            for info in list {
                let completion = if info.available {
                    Completion::success(format!("{} available", info.strategy))
                } else {
                    Completion::warning(info.unavailable_reason.unwrap_or_else(|| "unavailable".to_string()))
                };
                ctl.record(&strategy_stage(info.strategy), Policy::Advisory, Instant::now(), Ok(((), completion)))?;
            }
        }

        Ok(())
    }
}

fn record_failure_and_continue(
    ctl: &mut Controller,
    stage: &str,
    started: Instant,
    result: crate::error::Result<((), Completion)>,
) {
    if let Err(Aborted) = ctl.record(stage, Policy::Fatal, started, result) {
        info!(stage, "Check failed; continuing with the remaining checks");
    }
}

/// Stage results of a report that count against `mode`
pub fn offending_stages(report: &PipelineReport, mode: RunMode) -> Vec<&StageResult> {
    report
        .stages
        .iter()
        .filter(|s| s.outcome == Outcome::Failure || (mode.strict() && s.outcome == Outcome::Warning))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::GateReport;
    use crate::host::FakeHost;
    use crate::system::SystemProfile;
    use tempfile::TempDir;

    struct FixedGate(GateReport);

    impl CompatibilityCheck for FixedGate {
        fn check(&self, _profile: &SystemProfile) -> GateReport {
            self.0.clone()
        }
    }

    fn verifier<'a>(host: &'a FakeHost, dir: &TempDir, gate: GateReport) -> Verifier<'a> {
        Verifier::new(host, StateLayout::new(dir.path()), InstallerConfig::default())
            .with_gate(Box::new(FixedGate(gate)))
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("CI".parse::<RunMode>().unwrap(), RunMode::Ci);
        assert!("nightly".parse::<RunMode>().is_err());
        assert!(RunMode::Ci.forces_json());
        assert!(RunMode::Development.debug_logging());
    }

    #[test]
    fn test_quick_runs_gate_only() {
        let dir = TempDir::new().unwrap();
        let host = FakeHost::new();
        let report = verifier(&host, &dir, GateReport::pass()).run(RunMode::Quick);
        let names: Vec<&str> = report.stages.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(names, vec![stages::PROBE, stages::COMPATIBILITY]);
        assert!(report.success);
        assert_eq!(report.mode.as_deref(), Some("quick"));
    }

    #[test]
    fn test_gate_failure_does_not_stop_checks() {
        let dir = TempDir::new().unwrap();
        let host = FakeHost::new();
        let report = verifier(&host, &dir, GateReport::failure(vec!["not root".into()])).run(RunMode::Standard);
        assert!(!report.success);
        assert!(report.has_stage(stages::POST_DEVICE_NODE));
    }

    #[test]
    fn test_release_counts_warnings() {
        let dir = TempDir::new().unwrap();
        let host = FakeHost::new();

        let comprehensive = verifier(&host, &dir, GateReport::pass()).run(RunMode::Comprehensive);
        assert!(comprehensive.success);
        assert!(comprehensive.has_stage("strategy_user_space_only"));

        let release = verifier(&host, &dir, GateReport::pass()).run(RunMode::Release);
        assert!(!release.success);
        assert!(!offending_stages(&release, RunMode::Release).is_empty());
    }
}
