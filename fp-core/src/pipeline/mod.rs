//! Orchestrator
//!
//! Runs the installation stages in order. Stages only return results; the
//! [`Controller`] alone decides, from [`PipelineOptions`] and each stage's
//! [`Policy`], whether the run continues.

mod report;

pub use report::PipelineReport;

use std::path::Path;
use std::thread;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::constants::device;
use crate::data::{Completion, InstallerConfig, StageResult, StateLayout};
use crate::deps;
use crate::driver;
use crate::error::{FpError, Result};
use crate::fallback::FallbackManager;
use crate::gate::{CompatibilityCheck, CompatibilityGate};
use crate::host::Host;
use crate::rules;
use crate::service;
use crate::system::{self, SystemProfile};

/// Stable stage identifiers used in reports
pub mod stages {
    pub const PROBE: &str = "probe_environment";
    pub const RESOLVE: &str = "resolve_dependencies";
    pub const COMPATIBILITY: &str = "compatibility_check";
    pub const INSTALL_DEPENDENCIES: &str = "install_dependencies";
    pub const BUILD_AND_LOAD: &str = "build_and_load";
    pub const DEVICE_RULES: &str = "device_rules";
    pub const CONFIGURE_SERVICES: &str = "configure_services";
    pub const INSTALL_FALLBACK: &str = "install_fallback";
    pub const POST_DEVICE_DETECTION: &str = "post_install_device_detection";
    pub const POST_MODULE_LOADED: &str = "post_install_module_loaded";
    pub const POST_DEVICE_NODE: &str = "post_install_device_node";
}

/// Options fixed for the whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineOptions {
    /// Continue past a failed compatibility gate or driver verification
    pub force: bool,
    pub skip_tests: bool,
    pub debug: bool,
    pub install_fallback: bool,
    pub auto_configure: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            force: false,
            skip_tests: false,
            debug: false,
            install_fallback: false,
            auto_configure: true,
        }
    }
}

/// How the controller treats a stage error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Record a failure and stop
    Fatal,
    /// Like `Fatal`, unless `force` is set and the error is overridable
    Gate,
    /// Record a warning and continue
    Advisory,
}

/// The run was stopped; the report is already complete
#[derive(Debug)]
pub struct Aborted;

/// Records stage results and applies the abort/override policy
pub struct Controller {
    force: bool,
    results: Vec<StageResult>,
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

impl Controller {
    pub fn new(force: bool) -> Self {
        Self {
            force,
            results: Vec::new(),
        }
    }

    /// Record a finished stage. `Ok(Some(value))` to continue with a value,
    /// `Ok(None)` to continue past an overridden failure, `Err(Aborted)` to stop.
    pub fn record<T>(
        &mut self,
        stage: &str,
        policy: Policy,
        started: Instant,
        result: Result<(T, Completion)>,
    ) -> std::result::Result<Option<T>, Aborted> {
        let duration = elapsed_ms(started);
        match result {
            Ok((value, completion)) => {
                debug!(stage, outcome = %completion.outcome, "{}", completion.message);
                self.results.push(StageResult::from_completion(stage, completion, duration));
                Ok(Some(value))
            }
            Err(e) => {
                let continue_anyway = match policy {
                    Policy::Fatal => false,
                    Policy::Gate => self.force && e.is_force_overridable(),
                    Policy::Advisory => true,
                };
                if continue_anyway {
                    warn!(stage, "{}", e);
                    let mut result = StageResult::from_error(stage, &e, duration, true);
                    if policy == Policy::Advisory {
                        result.message = e.to_string();
                    }
                    self.results.push(result);
                    Ok(None)
                } else {
                    error!(stage, "{}", e);
                    self.results.push(StageResult::from_error(stage, &e, duration, false));
                    Err(Aborted)
                }
            }
        }
    }

    /// Time and record `f`
    pub fn run<T>(
        &mut self,
        stage: &str,
        policy: Policy,
        f: impl FnOnce() -> Result<(T, Completion)>,
    ) -> std::result::Result<Option<T>, Aborted> {
        let started = Instant::now();
        let result = f();
        self.record(stage, policy, started, result)
    }

    pub fn into_results(self) -> Vec<StageResult> {
        self.results
    }
}

/// Independent read-only checks run after installation
pub(crate) fn post_install_checks(host: &dyn Host, module: &str) -> Vec<(&'static str, Instant, Result<Completion>)> {
    let device_detection = || -> Result<Completion> {
        if host.has_usb_device(device::USB_ID) {
            Ok(Completion::success(format!("{} detected", device::USB_ID)))
        } else {
            Err(FpError::Detection(format!("{} not detected on the USB bus", device::USB_ID)))
        }
    };
    let module_loaded = || -> Result<Completion> {
        if host.is_module_loaded(module) {
            Ok(Completion::success(format!("{} loaded", module)))
        } else {
            Err(FpError::load(format!("{} is not loaded", module)))
        }
    };
    let device_node = || -> Result<Completion> {
        if host.path_exists(Path::new(device::DEVICE_NODE)) {
            Ok(Completion::success(format!("{} present", device::DEVICE_NODE)))
        } else {
            Err(FpError::load(format!("{} is missing", device::DEVICE_NODE)))
        }
    };

    let started = Instant::now();
    thread::scope(|s| {
        let handles = [
            (stages::POST_DEVICE_DETECTION, s.spawn(device_detection)),
            (stages::POST_MODULE_LOADED, s.spawn(module_loaded)),
            (stages::POST_DEVICE_NODE, s.spawn(device_node)),
        ];
        handles
            .into_iter()
            .map(|(name, handle)| {
                let result = handle
                    .join()
                    .unwrap_or_else(|_| Err(FpError::generic(format!("{} check panicked", name))));
                (name, started, result)
            })
            .collect()
    })
}

/// Composes every stage into one installation run
pub struct Orchestrator<'a> {
    host: &'a dyn Host,
    layout: StateLayout,
    config: InstallerConfig,
    gate: Option<Box<dyn CompatibilityCheck + 'a>>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(host: &'a dyn Host, layout: StateLayout, config: InstallerConfig) -> Self {
        Self {
            host,
            layout,
            config,
            gate: None,
        }
    }

    /// Replace the standard compatibility checks
    pub fn with_gate(mut self, gate: Box<dyn CompatibilityCheck + 'a>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn run(&self, options: PipelineOptions) -> PipelineReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(?options, "Starting installation");

        let mut controller = Controller::new(options.force);
        // An abort has already been recorded by the controller
        let _ = self.stages(&options, &mut controller);

        let report = PipelineReport::new(started_at, elapsed_ms(clock), controller.into_results());
        info!(success = report.success, stages = report.stages.len(), "Installation finished");
        report
    }

    fn stages(&self, options: &PipelineOptions, ctl: &mut Controller) -> std::result::Result<(), Aborted> {
        let host = self.host;

        // 1. Probe
        let profile = ctl
            .run(stages::PROBE, Policy::Fatal, || {
                let profile = system::probe(host);
                let unknown = profile.unknown_fields();
                let completion = if unknown.is_empty() {
                    Completion::success(format!(
                        "{} {} ({}, {})",
                        profile.distribution_id, profile.distribution_version, profile.package_manager, profile.init_system
                    ))
                } else {
                    Completion::warning(format!("could not determine: {}", unknown.join(", ")))
                };
                Ok((profile, completion))
            })?
            .unwrap_or_else(SystemProfile::unknown);

        // 2. Resolve dependencies: never overridable
        let set = ctl
            .run(stages::RESOLVE, Policy::Fatal, || {
                let set = deps::resolve(profile.package_manager, &profile.kernel_release)?;
                let message = format!(
                    "{} required and {} optional packages for {}",
                    set.required.len(),
                    set.optional.len(),
                    set.package_manager
                );
                Ok((set, Completion::success(message)))
            })?
            .ok_or(Aborted)?;

        // 3. Compatibility gate
        if !options.skip_tests {
            ctl.run(stages::COMPATIBILITY, Policy::Gate, || {
                let report = match &self.gate {
                    Some(gate) => gate.check(&profile),
                    None => CompatibilityGate::new(host, self.config.artifact()).check(&profile),
                };
                Ok(((), report.into_result()?))
            })?;
        }

        // 4. Dependencies
        ctl.run(stages::INSTALL_DEPENDENCIES, Policy::Fatal, || {
            Ok(((), deps::install(host, &set)?))
        })?;

        // 5. Build & load
        ctl.run(stages::BUILD_AND_LOAD, Policy::Gate, || {
            let artifact = self.config.artifact();
            let done = driver::build_and_load(host, &artifact, &profile, options.debug, self.config.build_timeout())?;
            Ok(((), done))
        })?;

        // 6. Device rules
        ctl.run(stages::DEVICE_RULES, Policy::Fatal, || Ok(((), rules::install(host)?)))?;

        // 7. Services
        if options.auto_configure {
            ctl.run(stages::CONFIGURE_SERVICES, Policy::Fatal, || {
                Ok(((), service::configure(host, &profile)?))
            })?;
        }

        // 8. Fallback manager
        if options.install_fallback {
            ctl.run(stages::INSTALL_FALLBACK, Policy::Fatal, || {
                let manager = FallbackManager::new(host, self.layout.clone(), self.config.clone());
                Ok(((), manager.install(false)?))
            })?;
        }

        // 9. Post-install checks
        if !options.skip_tests {
            for (name, started, result) in post_install_checks(host, &self.config.module_name) {
                ctl.record(name, Policy::Advisory, started, result.map(|c| ((), c)))?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Outcome;
    use crate::gate::GateReport;
    use crate::host::FakeHost;
    use tempfile::TempDir;

    struct FixedGate(GateReport);

    impl CompatibilityCheck for FixedGate {
        fn check(&self, _profile: &SystemProfile) -> GateReport {
            self.0.clone()
        }
    }

    fn ubuntu_host() -> FakeHost {
        FakeHost::new()
            .with_file("/etc/os-release", "ID=ubuntu\nVERSION_ID=\"22.04\"\n")
            .with_file("/run/systemd/system/.keep", "")
            .with_file("/usr/src/fp_xiaomi/Makefile", "")
            .with_file("/usr/src/fp_xiaomi/fp_xiaomi.ko", "")
    }

    fn names(report: &PipelineReport) -> Vec<&str> {
        report.stages.iter().map(|s| s.stage.as_str()).collect()
    }

    #[test]
    fn test_unknown_package_manager_aborts_even_with_force() {
        let dir = TempDir::new().unwrap();
        let host = FakeHost::new();
        let options = PipelineOptions { force: true, ..Default::default() };
        let report = Orchestrator::new(&host, StateLayout::new(dir.path()), InstallerConfig::default()).run(options);

        assert!(!report.success);
        assert_eq!(names(&report), vec![stages::PROBE, stages::RESOLVE]);
        assert_eq!(report.stages[1].error_kind.as_deref(), Some("detection_error"));
    }

    #[test]
    fn test_forced_build_failure_continues_as_warning() {
        let dir = TempDir::new().unwrap();
        let host = ubuntu_host().fail_command("make", "fp_xiaomi.c:12: error");
        let options = PipelineOptions { force: true, skip_tests: true, ..Default::default() };
        let report = Orchestrator::new(&host, StateLayout::new(dir.path()), InstallerConfig::default())
            .with_gate(Box::new(FixedGate(GateReport::pass())))
            .run(options);

        assert!(report.success);
        let build = report.stage(stages::BUILD_AND_LOAD).unwrap();
        assert_eq!(build.outcome, Outcome::Warning);
        assert!(build.message.contains("--force"));
        assert!(report.has_stage(stages::DEVICE_RULES));
    }

    #[test]
    fn test_build_failure_without_force_aborts() {
        let dir = TempDir::new().unwrap();
        let host = ubuntu_host().fail_command("make", "fp_xiaomi.c:12: error");
        let report = Orchestrator::new(&host, StateLayout::new(dir.path()), InstallerConfig::default())
            .with_gate(Box::new(FixedGate(GateReport::pass())))
            .run(PipelineOptions::default());

        assert!(!report.success);
        assert_eq!(names(&report).last(), Some(&stages::BUILD_AND_LOAD));
        assert!(report.stage(stages::BUILD_AND_LOAD).unwrap().remediation.is_some());
    }

    #[test]
    fn test_dependency_failure_is_never_forced() {
        let dir = TempDir::new().unwrap();
        let host = ubuntu_host()
            .fail_command("dpkg -s", "")
            .fail_command("apt-get install -y build-essential", "E: broken");
        let options = PipelineOptions { force: true, skip_tests: true, ..Default::default() };
        let report = Orchestrator::new(&host, StateLayout::new(dir.path()), InstallerConfig::default()).run(options);

        assert!(!report.success);
        assert_eq!(names(&report).last(), Some(&stages::INSTALL_DEPENDENCIES));
    }

    #[test]
    fn test_post_install_failures_are_warnings() {
        let dir = TempDir::new().unwrap();
        let host = ubuntu_host();
        let report = Orchestrator::new(&host, StateLayout::new(dir.path()), InstallerConfig::default())
            .with_gate(Box::new(FixedGate(GateReport::warning("no device detected"))))
            .run(PipelineOptions { auto_configure: false, ..Default::default() });

        assert!(report.success);
        assert!(!report.has_stage(stages::CONFIGURE_SERVICES));
        assert!(!report.has_stage(stages::INSTALL_FALLBACK));
        let detection = report.stage(stages::POST_DEVICE_DETECTION).unwrap();
        assert_eq!(detection.outcome, Outcome::Warning);
        assert!(!detection.message.contains("--force"));
        assert_eq!(report.stage(stages::POST_MODULE_LOADED).unwrap().outcome, Outcome::Success);
    }

    #[test]
    fn test_controller_policies() {
        let mut ctl = Controller::new(false);
        let ok: std::result::Result<Option<u8>, Aborted> =
            ctl.run("a", Policy::Fatal, || Ok((1, Completion::success("fine"))));
        assert_eq!(ok.unwrap(), Some(1));

        let advisory = ctl.run::<()>("b", Policy::Advisory, || Err(FpError::load("gone")));
        assert!(matches!(advisory, Ok(None)));

        let gate = ctl.run::<()>("c", Policy::Gate, || Err(FpError::build("bad")));
        assert!(gate.is_err());

        let outcomes: Vec<Outcome> = ctl.into_results().iter().map(|r| r.outcome).collect();
        assert_eq!(outcomes, vec![Outcome::Success, Outcome::Warning, Outcome::Failure]);
    }
}
