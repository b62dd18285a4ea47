//! Fallback Strategy Manager
//!
//! State machine over the durable [`StateRecord`]:
//!
//! ```text
//! Uninstalled --install--> Installed --activate(S)--> Active(S) --test--> Tested(S, verdict)
//!                              ^                          |
//!                              +--------- restore --------+   (recorded as Restored)
//! ```
//!
//! Every mutating operation holds the [`StateLock`] for its whole duration.
//! `status` and `list` read live host state and never take the lock.

mod strategy;

pub use strategy::{Strategy, StrategyContext, Verdict};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::constants::{backup, device, module_params, paths, services};
use crate::data::{
    BackupSnapshot, Completion, FallbackConfig, FallbackState, InstallerConfig, SnapshotMeta, StateLayout,
    StateLock, StateRecord, StateStore,
};
use crate::error::{FpError, Result};
use crate::host::{Host, ModuleLoad, ServiceStatus, ServiceUnit};
use crate::rules;

/// Outcome of [`FallbackManager::test`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestReport {
    pub strategy: Strategy,
    pub verdict: Verdict,
    pub device_detected: bool,
    pub communication: bool,
    pub recognized: bool,
}

/// One row of [`FallbackManager::list`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyInfo {
    pub strategy: Strategy,
    pub description: &'static str,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unavailable_reason: Option<String>,
    pub active: bool,
}

/// Live view of the host returned by [`FallbackManager::status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FallbackStatus {
    pub installed: bool,
    pub config_present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<FallbackStatusConfig>,
    pub recorded_state: String,
    pub snapshot_present: bool,
    pub device_present: bool,
    pub device_node_present: bool,
    pub driver_loaded: bool,
    pub driver_parameters: BTreeMap<String, String>,
    pub services: BTreeMap<String, ServiceStatus>,
    /// Strategies whose effects are detected on the host right now
    pub active_strategies: Vec<Strategy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FallbackStatusConfig {
    pub enabled: bool,
    pub default_strategy: Strategy,
    pub auto_fallback: bool,
    pub timeout: u64,
}

impl From<FallbackConfig> for FallbackStatusConfig {
    fn from(config: FallbackConfig) -> Self {
        Self {
            enabled: config.enabled,
            default_strategy: config.default_strategy,
            auto_fallback: config.auto_fallback,
            timeout: config.timeout_secs,
        }
    }
}

/// Health of the primary driver as seen by the monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// Nothing to judge: no reader attached
    NoDevice,
    Unhealthy(String),
}

/// Driver parameters reported by `status` and carried in snapshots
const DRIVER_PARAMS: [&str; 3] = [module_params::COMPAT_MODE, module_params::MINIMAL_MODE, module_params::DEBUG];

fn is_default_param(value: &str) -> bool {
    matches!(value, "" | "0" | "N" | "n")
}

pub struct FallbackManager<'a> {
    host: &'a dyn Host,
    store: StateStore,
    config: InstallerConfig,
}

impl<'a> FallbackManager<'a> {
    pub fn new(host: &'a dyn Host, layout: StateLayout, config: InstallerConfig) -> Self {
        Self {
            host,
            store: StateStore::new(layout),
            config,
        }
    }

    pub fn layout(&self) -> &StateLayout {
        self.store.layout()
    }

    fn ctx(&self) -> StrategyContext<'_> {
        StrategyContext::new(self.host, &self.config)
    }

    fn lock(&self) -> Result<StateLock> {
        StateLock::acquire(&self.store.layout().lock_file)
    }

    fn monitor_unit(&self) -> ServiceUnit {
        ServiceUnit {
            name: services::MONITOR.to_string(),
            description: format!("{} fallback monitor", device::DEVICE_NAME),
            exec: self.config.monitor_exec.clone(),
        }
    }

    // ------------------------------------------------------------------------
    // install / uninstall
    // ------------------------------------------------------------------------

    /// Provision configuration and the monitor hook. A second call without
    /// `reinstall` is a warning no-op.
    pub fn install(&self, reinstall: bool) -> Result<Completion> {
        let _lock = self.lock()?;
        let mut record = self.store.load_record()?;

        if record.state.is_installed() && !reinstall {
            let message = match record.state.active_strategy() {
                Some(strategy) => format!("{} and {} is active; nothing changed", FpError::AlreadyInstalled, strategy),
                None => format!("{}; use --reinstall to rewrite it", FpError::AlreadyInstalled),
            };
            return Ok(Completion::warning(message));
        }

        FallbackConfig::default().save(self.layout())?;

        let mut warning = None;
        let hook = self
            .host
            .install_service_unit(&self.monitor_unit())
            .and_then(|_| self.host.set_service_enabled(services::MONITOR, true));
        if let Err(e) = hook {
            warn!("Monitor hook not registered: {}", e);
            warning = Some(format!("monitor hook not registered: {}", e));
        }

        if !record.state.is_installed() || record.state.active_strategy().is_none() {
            record.state = FallbackState::Installed;
        }
        self.store.save_record(&mut record)?;
        info!(state = %record.state, "Fallback manager installed");

        Ok(match warning {
            Some(w) => Completion::warning(format!("fallback manager installed; {}", w)),
            None => Completion::success("fallback manager installed"),
        })
    }

    /// Remove hook, configuration and state. Refused while a strategy is active.
    pub fn uninstall(&self) -> Result<Completion> {
        let _lock = self.lock()?;
        let record = self.store.load_record()?;

        if !record.state.is_installed() {
            return Ok(Completion::warning("fallback manager is not installed; nothing to remove"));
        }
        if let Some(strategy) = record.state.active_strategy() {
            return Err(FpError::InvalidState {
                state: record.state.to_string(),
                reason: format!("{} is active; run restore first", strategy),
            });
        }

        if self.host.service_status(services::MONITOR).installed {
            self.host.remove_service_unit(services::MONITOR)?;
        }
        self.store.remove_all()?;
        info!("Fallback manager uninstalled");
        Ok(Completion::success("fallback manager uninstalled"))
    }

    // ------------------------------------------------------------------------
    // backup
    // ------------------------------------------------------------------------

    /// Non-default parameters of the loaded primary driver
    fn driver_params(&self) -> BTreeMap<String, String> {
        DRIVER_PARAMS
            .iter()
            .filter_map(|p| {
                self.host
                    .module_parameter(&self.config.module_name, p)
                    .filter(|v| !is_default_param(v))
                    .map(|v| (p.to_string(), v))
            })
            .collect()
    }

    fn capture_snapshot(&self) -> Result<BackupSnapshot> {
        let mut loaded_modules = self.host.loaded_modules();
        loaded_modules.sort();

        let mut module_params = BTreeMap::new();
        if loaded_modules.contains(&self.config.module_name) {
            let params = self.driver_params();
            if !params.is_empty() {
                module_params.insert(self.config.module_name.clone(), params);
            }
        }

        let services = services::MANAGED
            .iter()
            .map(|name| (name.to_string(), self.host.service_status(name)))
            .collect();

        let mut strategy_files = BTreeMap::new();
        for (path, _) in backup::TRACKED_FILES {
            if let Some(contents) = self.host.read_bytes(Path::new(path))? {
                strategy_files.insert(PathBuf::from(path), contents);
            }
        }

        Ok(BackupSnapshot {
            timestamp: Utc::now(),
            loaded_modules,
            module_params,
            rules: self.host.read_file(Path::new(paths::UDEV_RULES_FILE))?,
            services,
            strategy_files,
        })
    }

    /// Take a snapshot unless a strategy is active, in which case the
    /// existing last-known-good snapshot is returned untouched.
    fn backup_locked(&self, record: &mut StateRecord) -> Result<SnapshotMeta> {
        if record.state.active_strategy().is_some() {
            if let Some(meta) = &record.snapshot {
                debug!("Strategy active, keeping snapshot from {}", meta.timestamp);
                return Ok(meta.clone());
            }
        }

        let snapshot = self.capture_snapshot()?;
        let meta = self.store.save_snapshot(&snapshot)?;
        record.snapshot = Some(meta.clone());
        self.store.save_record(record)?;
        Ok(meta)
    }

    pub fn backup(&self) -> Result<SnapshotMeta> {
        let _lock = self.lock()?;
        let mut record = self.store.load_record()?;
        if !record.state.is_installed() {
            return Err(FpError::NotInstalled);
        }
        self.backup_locked(&mut record)
    }

    // ------------------------------------------------------------------------
    // activate / restore
    // ------------------------------------------------------------------------

    /// Bring live modules, rules, strategy files and services back to
    /// `snapshot`
    fn reconcile(&self, snapshot: &BackupSnapshot) -> Result<()> {
        let host = self.host;
        let module = &self.config.module_name;
        let no_params = BTreeMap::new();

        let wanted = snapshot.loaded_modules.iter().any(|m| m == module);
        let saved_params = snapshot.module_params.get(module).unwrap_or(&no_params);
        if !wanted || (host.is_module_loaded(module) && self.driver_params() != *saved_params) {
            host.unload_module(module)?;
        }
        for name in &snapshot.loaded_modules {
            if host.is_module_loaded(name) {
                continue;
            }
            let mut request = if name == module && self.config.artifact().object_present(host) {
                ModuleLoad::from_object(name.as_str(), self.config.artifact().object_path())
            } else {
                ModuleLoad::by_name(name.as_str())
            };
            for (key, value) in snapshot.module_params.get(name).unwrap_or(&no_params) {
                request = request.param(key.as_str(), value.as_str());
            }
            host.load_module(&request)?;
        }

        let rules_path = Path::new(paths::UDEV_RULES_FILE);
        let mut rules_changed = match &snapshot.rules {
            Some(rules) => rules::ensure_rules_file(host, rules_path, rules)?,
            None => host.remove_file(rules_path)?,
        };

        for (path, _) in backup::TRACKED_FILES {
            let path = Path::new(path);
            let saved = snapshot.strategy_files.get(path);
            if host.read_bytes(path)?.as_ref() == saved {
                continue;
            }
            match saved {
                Some(contents) => host.write_bytes(path, contents)?,
                None => {
                    host.remove_file(path)?;
                }
            }
            debug!("Restored {:?}", path);
            rules_changed |= path.extension().is_some_and(|ext| ext == "rules");
        }
        if rules_changed {
            rules::reload_udev(host)?;
        }

        for (name, saved) in &snapshot.services {
            let live = host.service_status(name);
            if !saved.installed {
                if live.installed {
                    host.remove_service_unit(name)?;
                }
                continue;
            }
            if live.enabled != saved.enabled {
                host.set_service_enabled(name, saved.enabled)?;
            }
            if live.active != saved.active {
                host.set_service_running(name, saved.active)?;
            }
        }
        Ok(())
    }

    /// Undo a failed activation: remove the strategy's effects and bring the
    /// host back to the snapshot.
    fn roll_back(&self, strategies: &[Strategy], meta: &SnapshotMeta) {
        for strategy in strategies {
            if let Err(e) = strategy.deactivate(&self.ctx()) {
                warn!("Rollback of {} incomplete: {}", strategy, e);
            }
        }
        match self.store.load_snapshot(meta).and_then(|s| self.reconcile(&s)) {
            Ok(()) => debug!("Host reconciled to snapshot after failed activation"),
            Err(e) => warn!("Could not reconcile host to snapshot: {}", e),
        }
    }

    /// Back up, then switch to `strategy`, fully deactivating any strategy
    /// already in effect first.
    pub fn activate(&self, strategy: Strategy) -> Result<Completion> {
        let _lock = self.lock()?;
        let mut record = self.store.load_record()?;
        if !record.state.is_installed() {
            return Err(FpError::NotInstalled);
        }

        let ctx = self.ctx();
        let previous = record.state.active_strategy();

        if previous == Some(strategy) && strategy.verify(&ctx).is_ok() {
            return Ok(Completion::success(format!("{} already active", strategy)));
        }

        strategy.preflight(&ctx)?;

        let had_snapshot = record.snapshot.is_some() && previous.is_some();
        let meta = self.backup_locked(&mut record)?;

        let mut touched = vec![strategy];
        let switched = match previous {
            Some(previous) => {
                info!(from = %previous, to = %strategy, "Switching fallback strategy");
                touched.push(previous);
                previous.deactivate(&ctx)
            }
            None => Ok(()),
        };

        let applied = switched
            .and_then(|_| strategy.activate(&ctx))
            .and_then(|_| strategy.verify(&ctx));
        if let Err(e) = applied {
            warn!("Activation of {} failed: {}", strategy, e);
            self.roll_back(&touched, &meta);

            record.state = FallbackState::Installed;
            if !had_snapshot {
                self.store.clear_snapshot()?;
                record.snapshot = None;
            }
            self.store.save_record(&mut record)?;

            return Err(match e {
                e @ FpError::StrategyActivation { .. } => e,
                other => FpError::activation(strategy.as_str(), other.to_string()),
            });
        }

        record.state = FallbackState::Active { strategy };
        self.store.save_record(&mut record)?;
        info!(strategy = %strategy, "Fallback strategy active");
        Ok(Completion::success(format!("{} active", strategy)))
    }

    /// Revert everything the active strategy introduced using the snapshot
    pub fn restore(&self) -> Result<Completion> {
        let _lock = self.lock()?;
        let mut record = self.store.load_record()?;

        let Some(meta) = record.snapshot.clone() else {
            return Err(FpError::NoBackup);
        };
        let snapshot = self.store.load_snapshot(&meta)?;

        if let Some(strategy) = record.state.active_strategy() {
            strategy.deactivate(&self.ctx())?;
        }
        self.reconcile(&snapshot)?;

        self.store.clear_snapshot()?;
        record.snapshot = None;
        record.state = FallbackState::Restored;
        self.store.save_record(&mut record)?;

        info!(snapshot = %meta.timestamp, "Restored pre-fallback state");
        Ok(Completion::success(format!(
            "restored host state captured at {}",
            meta.timestamp.to_rfc3339()
        )))
    }

    // ------------------------------------------------------------------------
    // test / status / list
    // ------------------------------------------------------------------------

    /// Probe the active strategy and record the verdict. Does not touch
    /// driver state.
    pub fn test(&self) -> Result<TestReport> {
        let _lock = self.lock()?;
        let mut record = self.store.load_record()?;
        let Some(strategy) = record.state.active_strategy() else {
            return Err(FpError::InvalidState {
                state: record.state.to_string(),
                reason: "no strategy is active".to_string(),
            });
        };

        let ctx = self.ctx();
        let (device_detected, communication, recognized) = thread::scope(|s| {
            let device = s.spawn(|| self.host.has_usb_device(device::USB_ID));
            let communication = s.spawn(|| strategy.communication_ok(&ctx));
            let recognized = s.spawn(|| strategy.recognized(&ctx));
            (
                device.join().unwrap_or(false),
                communication.join().unwrap_or(false),
                recognized.join().unwrap_or(false),
            )
        });

        let verdict = Verdict::from_signals(device_detected, communication, recognized);
        record.state = FallbackState::Tested { strategy, verdict };
        self.store.save_record(&mut record)?;
        info!(strategy = %strategy, verdict = %verdict, "Tested fallback strategy");

        Ok(TestReport {
            strategy,
            verdict,
            device_detected,
            communication,
            recognized,
        })
    }

    /// Live status; reads the host, not the cached state record
    pub fn status(&self) -> Result<FallbackStatus> {
        let record = self.store.load_record()?;
        let config = FallbackConfig::load(self.layout())?;
        let ctx = self.ctx();
        let module = &self.config.module_name;

        let mut service_names: Vec<&str> = services::MANAGED.to_vec();
        service_names.push(services::MONITOR);

        let driver_parameters = DRIVER_PARAMS
            .iter()
            .filter_map(|p| self.host.module_parameter(module, p).map(|v| (p.to_string(), v)))
            .collect();

        Ok(FallbackStatus {
            installed: record.state.is_installed(),
            config_present: config.is_some(),
            config: config.map(Into::into),
            recorded_state: record.state.to_string(),
            snapshot_present: record.snapshot.is_some(),
            device_present: self.host.has_usb_device(device::USB_ID),
            device_node_present: self.host.path_exists(Path::new(device::DEVICE_NODE)),
            driver_loaded: self.host.is_module_loaded(module),
            driver_parameters,
            services: service_names
                .into_iter()
                .map(|n| (n.to_string(), self.host.service_status(n)))
                .collect(),
            active_strategies: Strategy::ALL.into_iter().filter(|s| s.is_live(&ctx)).collect(),
        })
    }

    pub fn list(&self) -> Result<Vec<StrategyInfo>> {
        let record = self.store.load_record()?;
        let ctx = self.ctx();
        Ok(Strategy::ALL
            .into_iter()
            .map(|strategy| {
                let preflight = strategy.preflight(&ctx);
                StrategyInfo {
                    strategy,
                    description: strategy.description(),
                    available: preflight.is_ok(),
                    unavailable_reason: preflight.err().map(|e| e.to_string()),
                    active: record.state.active_strategy() == Some(strategy),
                }
            })
            .collect())
    }

    /// Health of the primary driver: loaded, and its node present while the
    /// reader is attached.
    pub fn primary_health(&self) -> Health {
        if !self.host.has_usb_device(device::USB_ID) {
            return Health::NoDevice;
        }
        if !self.host.is_module_loaded(&self.config.module_name) {
            return Health::Unhealthy(format!("{} is not loaded", self.config.module_name));
        }
        if !self.host.path_exists(Path::new(device::DEVICE_NODE)) {
            return Health::Unhealthy(format!("{} is missing", device::DEVICE_NODE));
        }
        Health::Healthy
    }

    pub fn recorded_state(&self) -> Result<FallbackState> {
        Ok(self.store.load_record()?.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Outcome;
    use crate::host::FakeHost;
    use tempfile::TempDir;

    fn driver_host() -> FakeHost {
        FakeHost::new()
            .with_device(device::USB_ID)
            .with_file("/usr/src/fp_xiaomi/Makefile", "")
            .with_file("/usr/src/fp_xiaomi/fp_xiaomi.ko", "")
            .with_file(paths::UDEV_RULES_FILE, "# original rules\n")
            .with_service(services::FPRINTD, ServiceStatus { installed: true, active: true, enabled: true })
    }

    fn manager<'a>(host: &'a FakeHost, dir: &TempDir) -> FallbackManager<'a> {
        FallbackManager::new(host, StateLayout::new(dir.path()), InstallerConfig::default())
    }

    #[test]
    fn test_install_twice_is_warning() {
        let dir = TempDir::new().unwrap();
        let host = driver_host();
        let mgr = manager(&host, &dir);

        assert_eq!(mgr.install(false).unwrap().outcome, Outcome::Success);
        let second = mgr.install(false).unwrap();
        assert_eq!(second.outcome, Outcome::Warning);
        assert!(second.message.starts_with(&FpError::AlreadyInstalled.to_string()));
        assert!(host.units().contains_key(services::MONITOR));
        assert!(!host.service_status(services::MONITOR).active);
        assert_eq!(mgr.recorded_state().unwrap(), FallbackState::Installed);
    }

    #[test]
    fn test_activate_requires_install() {
        let dir = TempDir::new().unwrap();
        let host = driver_host();
        let err = manager(&host, &dir).activate(Strategy::CompatibilityMode).unwrap_err();
        assert!(matches!(err, FpError::NotInstalled));
    }

    #[test]
    fn test_compat_mode_activate_then_restore() {
        let dir = TempDir::new().unwrap();
        let host = driver_host().with_module(device::MODULE_NAME);
        let mgr = manager(&host, &dir);
        mgr.install(false).unwrap();

        mgr.activate(Strategy::CompatibilityMode).unwrap();
        assert_eq!(
            host.module_parameter(device::MODULE_NAME, "compat_mode").as_deref(),
            Some("1")
        );
        assert_eq!(mgr.status().unwrap().active_strategies, vec![Strategy::CompatibilityMode]);

        mgr.restore().unwrap();
        assert!(host.is_module_loaded(device::MODULE_NAME));
        assert!(host.module_parameter(device::MODULE_NAME, "compat_mode").is_none());
        assert_eq!(mgr.recorded_state().unwrap(), FallbackState::Restored);
        assert!(mgr.status().unwrap().active_strategies.is_empty());
    }

    #[test]
    fn test_restore_reloads_driver_with_saved_parameters() {
        let dir = TempDir::new().unwrap();
        let host = driver_host();
        let mgr = manager(&host, &dir);
        mgr.config.artifact().load(&host, &[(module_params::DEBUG, "1")]).unwrap();
        mgr.install(false).unwrap();

        mgr.activate(Strategy::CompatibilityMode).unwrap();
        assert!(host.module_parameter(device::MODULE_NAME, module_params::DEBUG).is_none());

        mgr.restore().unwrap();
        assert_eq!(
            host.module_params(device::MODULE_NAME),
            Some(BTreeMap::from([(module_params::DEBUG.to_string(), "1".to_string())]))
        );
    }

    #[test]
    fn test_restore_puts_back_preexisting_strategy_files() {
        let dir = TempDir::new().unwrap();
        let host = driver_host()
            .with_file("/usr/lib/x86_64-linux-gnu/libfprint-2.so.2", "")
            .with_file(paths::GENERIC_RULES_FILE, "# admin rules\n");
        host.set_output("busctl", "ao 1 \"/net/reactivated/Fprint/Device/0\"");
        let mgr = manager(&host, &dir);
        mgr.install(false).unwrap();

        mgr.activate(Strategy::GenericLibrary).unwrap();
        assert_eq!(host.file(paths::GENERIC_RULES_FILE), Some(rules::generic_rules()));
        assert_eq!(mgr.status().unwrap().active_strategies, vec![Strategy::GenericLibrary]);

        mgr.restore().unwrap();
        assert_eq!(host.file(paths::GENERIC_RULES_FILE).as_deref(), Some("# admin rules\n"));
        assert!(host.file(paths::USERSPACE_RULES_FILE).is_none());
        assert!(mgr.status().unwrap().active_strategies.is_empty());
    }

    #[test]
    fn test_failed_activation_leaves_state_installed() {
        let dir = TempDir::new().unwrap();
        let host = driver_host().fail_module_load(device::MODULE_NAME);
        let mgr = manager(&host, &dir);
        mgr.install(false).unwrap();

        let err = mgr.activate(Strategy::MinimalDriver).unwrap_err();
        assert_eq!(err.exit_code(), 4);
        assert_eq!(mgr.recorded_state().unwrap(), FallbackState::Installed);
        assert!(matches!(mgr.restore(), Err(FpError::NoBackup)));
    }

    #[test]
    fn test_preflight_failure_mutates_nothing() {
        let dir = TempDir::new().unwrap();
        let host = FakeHost::new();
        let mgr = manager(&host, &dir);
        mgr.install(false).unwrap();
        let before = host.commands();

        assert!(mgr.activate(Strategy::GenericLibrary).is_err());
        assert_eq!(host.commands(), before);
        assert!(!mgr.layout().backup_modules().exists());
    }

    #[test]
    fn test_backup_is_kept_while_active() {
        let dir = TempDir::new().unwrap();
        let host = driver_host();
        let mgr = manager(&host, &dir);
        mgr.install(false).unwrap();

        mgr.activate(Strategy::MinimalDriver).unwrap();
        let first = mgr.backup().unwrap();
        host.load_module(&ModuleLoad::by_name("extra")).unwrap();
        let second = mgr.backup().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_test_records_verdict() {
        let dir = TempDir::new().unwrap();
        let host = driver_host();
        let mgr = manager(&host, &dir);
        mgr.install(false).unwrap();
        mgr.activate(Strategy::CompatibilityMode).unwrap();

        let report = mgr.test().unwrap();
        assert!(report.device_detected);
        assert!(report.communication);
        assert_eq!(report.verdict, Verdict::Partial);

        host.set_output("busctl", "ao 1 \"/net/reactivated/Fprint/Device/0\"");
        assert_eq!(mgr.test().unwrap().verdict, Verdict::Pass);
        assert_eq!(
            mgr.recorded_state().unwrap(),
            FallbackState::Tested { strategy: Strategy::CompatibilityMode, verdict: Verdict::Pass }
        );
        assert!(host.is_module_loaded(device::MODULE_NAME));
    }

    #[test]
    fn test_uninstall_refused_while_active() {
        let dir = TempDir::new().unwrap();
        let host = driver_host();
        let mgr = manager(&host, &dir);
        mgr.install(false).unwrap();
        mgr.activate(Strategy::MinimalDriver).unwrap();

        assert!(matches!(mgr.uninstall(), Err(FpError::InvalidState { .. })));
        mgr.restore().unwrap();
        mgr.uninstall().unwrap();
        assert!(!mgr.layout().fallback_config.exists());
        assert!(!host.units().contains_key(services::MONITOR));
    }

    #[test]
    fn test_list_reports_availability() {
        let dir = TempDir::new().unwrap();
        let host = driver_host();
        let mgr = manager(&host, &dir);
        let list = mgr.list().unwrap();
        assert_eq!(list.len(), 4);
        let generic = list.iter().find(|i| i.strategy == Strategy::GenericLibrary).unwrap();
        assert!(!generic.available);
        assert!(generic.unavailable_reason.as_deref().unwrap().contains("libfprint"));
        assert!(list.iter().find(|i| i.strategy == Strategy::MinimalDriver).unwrap().available);
    }

    #[test]
    fn test_primary_health() {
        let dir = TempDir::new().unwrap();
        let host = driver_host();
        let mgr = manager(&host, &dir);
        assert!(matches!(mgr.primary_health(), Health::Unhealthy(_)));

        mgr.config.artifact().load(&host, &[]).unwrap();
        assert_eq!(mgr.primary_health(), Health::Healthy);

        host.detach_device(device::USB_ID);
        assert_eq!(mgr.primary_health(), Health::NoDevice);
    }
}
