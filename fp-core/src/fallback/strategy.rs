//! The closed set of fallback strategies and their procedures
//!
//! Every strategy carries four procedures:
//! - `preflight`: read-only checks, run before anything is mutated
//! - `activate`: apply the strategy's effects
//! - `verify`: post-condition read from live state
//! - `deactivate`: remove exactly what `activate` introduced

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::{capabilities, device, module_params, paths, services};
use crate::data::InstallerConfig;
use crate::deps;
use crate::driver::DriverArtifact;
use crate::error::{FpError, Result};
use crate::host::{Host, HostCommand, ServiceUnit};
use crate::rules;
use crate::system;

/// Alternative operating mode replacing the primary driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    GenericLibrary,
    CompatibilityMode,
    MinimalDriver,
    UserSpaceOnly,
}

/// Result of testing the active strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Partial,
    Fail,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Partial => "partial",
            Verdict::Fail => "fail",
        }
    }

    /// Pass needs all three signals; without a device it is a fail
    pub fn from_signals(device_detected: bool, communication: bool, recognized: bool) -> Self {
        match (device_detected, communication && recognized) {
            (false, _) => Verdict::Fail,
            (true, true) => Verdict::Pass,
            (true, false) => Verdict::Partial,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a strategy procedure needs from the outside world
pub struct StrategyContext<'a> {
    pub host: &'a dyn Host,
    pub config: &'a InstallerConfig,
}

impl<'a> StrategyContext<'a> {
    pub fn new(host: &'a dyn Host, config: &'a InstallerConfig) -> Self {
        Self { host, config }
    }

    fn artifact(&self) -> DriverArtifact {
        self.config.artifact()
    }

    fn module_param_set(&self, param: &str) -> bool {
        matches!(
            self.host
                .module_parameter(&self.config.module_name, param)
                .as_deref(),
            Some("1") | Some("Y") | Some("y")
        )
    }

    fn capability_mask(&self) -> Option<u32> {
        let raw = self.host.read_file(Path::new(device::CAPABILITIES_ATTR)).ok()??;
        let raw = raw.trim();
        let hex = raw.strip_prefix("0x").unwrap_or(raw);
        u32::from_str_radix(hex, 16).ok()
    }

    /// fprintd enumerates at least one device
    pub fn fprintd_lists_device(&self) -> bool {
        self.host
            .run(&HostCommand::from_argv(services::FPRINTD_LIST_DEVICES))
            .map(|out| out.success && out.stdout.contains(services::FPRINTD_DEVICE_PREFIX))
            .unwrap_or(false)
    }

    fn userspace_unit(&self) -> ServiceUnit {
        ServiceUnit {
            name: services::USERSPACE.to_string(),
            description: format!("{} user-space driver", device::DEVICE_NAME),
            exec: self.config.userspace_daemon.clone(),
        }
    }
}

const LIBFPRINT_CANDIDATES: &[&str] = &[
    "/usr/lib/x86_64-linux-gnu/libfprint-2.so.2",
    "/usr/lib/aarch64-linux-gnu/libfprint-2.so.2",
    "/usr/lib64/libfprint-2.so.2",
    "/usr/lib/libfprint-2.so.2",
];

/// Library produced by `make userspace` in the driver source tree
const BUILT_LIBRARY: &str = "libfp_xiaomi.so";

fn libfprint_present(host: &dyn Host) -> bool {
    LIBFPRINT_CANDIDATES.iter().any(|p| host.path_exists(Path::new(p)))
}

fn generic_stack_present(host: &dyn Host) -> bool {
    libfprint_present(host) && host.service_status(services::FPRINTD).installed
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::GenericLibrary,
        Strategy::CompatibilityMode,
        Strategy::MinimalDriver,
        Strategy::UserSpaceOnly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::GenericLibrary => "generic-library",
            Strategy::CompatibilityMode => "compatibility-mode",
            Strategy::MinimalDriver => "minimal-driver",
            Strategy::UserSpaceOnly => "user-space-only",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Strategy::GenericLibrary => "hand the reader to libfprint's generic handling through fprintd",
            Strategy::CompatibilityMode => "reload the primary driver with compat_mode=1",
            Strategy::MinimalDriver => "reload the primary driver with capture and verify only",
            Strategy::UserSpaceOnly => "run a supervised user-space driver, no kernel module",
        }
    }

    fn activation_error(&self, reason: impl Into<String>) -> FpError {
        FpError::activation(self.as_str(), reason)
    }

    /// Read-only checks that must pass before anything is mutated
    pub fn preflight(&self, ctx: &StrategyContext) -> Result<()> {
        let artifact = ctx.artifact();
        match self {
            Strategy::GenericLibrary => {
                if !generic_stack_present(ctx.host) {
                    deps::resolve_fingerprint_stack(system::package_manager(ctx.host)).map_err(|_| {
                        self.activation_error("libfprint is not installed and no supported package manager was found")
                    })?;
                }
            }
            Strategy::CompatibilityMode | Strategy::MinimalDriver => {
                if !artifact.object_present(ctx.host) {
                    return Err(self.activation_error(format!(
                        "driver object {} is missing; build the driver first",
                        artifact.object_path().display()
                    )));
                }
            }
            Strategy::UserSpaceOnly => {
                if !artifact.source_present(ctx.host) {
                    return Err(self.activation_error(format!(
                        "driver source {} is missing; cannot build the user-space library",
                        artifact.source_dir.display()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Apply the strategy. The caller rolls back on error.
    pub fn activate(&self, ctx: &StrategyContext) -> Result<()> {
        let artifact = ctx.artifact();
        let host = ctx.host;
        info!(strategy = %self, "Activating fallback strategy");

        match self {
            Strategy::GenericLibrary => {
                if !generic_stack_present(host) {
                    let stack = deps::resolve_fingerprint_stack(system::package_manager(host))
                        .map_err(|e| self.activation_error(e.to_string()))?;
                    deps::install(host, &stack)
                        .map_err(|e| self.activation_error(format!("could not install libfprint: {}", e)))?;
                }

                host.unload_module(&artifact.module_name)?;
                if rules::ensure_rules_file(host, Path::new(paths::GENERIC_RULES_FILE), &rules::generic_rules())? {
                    rules::reload_udev(host)?;
                }
                host.set_service_enabled(services::FPRINTD, true)?;
                host.set_service_running(services::FPRINTD, false)?;
                host.set_service_running(services::FPRINTD, true)?;
            }
            Strategy::CompatibilityMode => {
                artifact
                    .reload(host, &[(module_params::COMPAT_MODE, "1")])
                    .map_err(|e| self.activation_error(e.to_string()))?;
            }
            Strategy::MinimalDriver => {
                artifact
                    .reload(host, &[(module_params::MINIMAL_MODE, "1")])
                    .map_err(|e| self.activation_error(e.to_string()))?;
            }
            Strategy::UserSpaceOnly => {
                host.unload_module(&artifact.module_name)?;

                let source = artifact.source_dir.to_string_lossy().to_string();
                host.run_checked(
                    &HostCommand::new("make")
                        .args(["-C", source.as_str(), "userspace"])
                        .timeout(ctx.config.build_timeout()),
                )
                .map_err(|e| self.activation_error(format!("user-space library build failed: {}", e)))?;
                let built = artifact.source_dir.join(BUILT_LIBRARY);
                let library = host.read_bytes(&built)?.ok_or_else(|| {
                    self.activation_error(format!("build did not produce {}", built.display()))
                })?;
                host.write_bytes(Path::new(paths::USERSPACE_LIBRARY), &library)?;

                if rules::ensure_rules_file(host, Path::new(paths::USERSPACE_RULES_FILE), &rules::userspace_rules())? {
                    rules::reload_udev(host)?;
                }

                host.install_service_unit(&ctx.userspace_unit())?;
                host.set_service_enabled(services::USERSPACE, true)?;
                host.set_service_running(services::USERSPACE, true)?;
            }
        }
        Ok(())
    }

    /// Post-condition of [`Strategy::activate`], read from live state
    pub fn verify(&self, ctx: &StrategyContext) -> Result<()> {
        let host = ctx.host;
        let module = &ctx.config.module_name;
        let check = |ok: bool, reason: &str| if ok { Ok(()) } else { Err(self.activation_error(reason)) };

        match self {
            Strategy::GenericLibrary => check(
                ctx.fprintd_lists_device(),
                "fprintd does not list the reader",
            ),
            Strategy::CompatibilityMode => {
                check(host.is_module_loaded(module), "driver is not loaded")?;
                check(
                    ctx.module_param_set(module_params::COMPAT_MODE),
                    "driver loaded without compat_mode",
                )
            }
            Strategy::MinimalDriver => {
                check(host.is_module_loaded(module), "driver is not loaded")?;
                check(
                    ctx.module_param_set(module_params::MINIMAL_MODE),
                    "driver loaded without minimal_mode",
                )?;
                match ctx.capability_mask() {
                    Some(mask) => check(
                        mask & !capabilities::MINIMAL_MASK == 0,
                        "driver still reports the full feature set",
                    ),
                    None => Ok(()),
                }
            }
            Strategy::UserSpaceOnly => {
                check(host.has_usb_device(device::USB_ID), "reader is not attached")?;
                check(
                    host.path_exists(Path::new(paths::USERSPACE_LIBRARY)),
                    "user-space library is not installed",
                )?;
                check(
                    host.service_status(services::USERSPACE).active,
                    "user-space service is not running",
                )?;
                check(
                    !host.is_module_loaded(module),
                    "kernel driver is still loaded",
                )
            }
        }
    }

    /// Remove this strategy's effects. Safe when nothing was applied.
    pub fn deactivate(&self, ctx: &StrategyContext) -> Result<()> {
        let host = ctx.host;
        debug!(strategy = %self, "Deactivating fallback strategy");

        match self {
            Strategy::GenericLibrary => {
                if host.remove_file(Path::new(paths::GENERIC_RULES_FILE))? {
                    rules::reload_udev(host)?;
                }
            }
            Strategy::CompatibilityMode | Strategy::MinimalDriver => {
                host.unload_module(&ctx.config.module_name)?;
            }
            Strategy::UserSpaceOnly => {
                if host.service_status(services::USERSPACE).installed {
                    host.set_service_running(services::USERSPACE, false)?;
                    host.set_service_enabled(services::USERSPACE, false)?;
                    host.remove_service_unit(services::USERSPACE)?;
                }
                host.remove_file(Path::new(paths::USERSPACE_LIBRARY))?;
                if host.remove_file(Path::new(paths::USERSPACE_RULES_FILE))? {
                    rules::reload_udev(host)?;
                }
            }
        }
        Ok(())
    }

    /// Whether this strategy's effects are present on the host right now
    pub fn is_live(&self, ctx: &StrategyContext) -> bool {
        let host = ctx.host;
        let loaded = host.is_module_loaded(&ctx.config.module_name);
        match self {
            Strategy::GenericLibrary => host
                .read_file(Path::new(paths::GENERIC_RULES_FILE))
                .ok()
                .flatten()
                .is_some_and(|contents| contents == rules::generic_rules()),
            Strategy::CompatibilityMode => loaded && ctx.module_param_set(module_params::COMPAT_MODE),
            Strategy::MinimalDriver => loaded && ctx.module_param_set(module_params::MINIMAL_MODE),
            Strategy::UserSpaceOnly => host.service_status(services::USERSPACE).installed,
        }
    }

    /// Whether a working communication path exists under this strategy
    pub fn communication_ok(&self, ctx: &StrategyContext) -> bool {
        let host = ctx.host;
        match self {
            Strategy::GenericLibrary => libfprint_present(host),
            Strategy::CompatibilityMode | Strategy::MinimalDriver => {
                self.verify(ctx).is_ok() && host.path_exists(Path::new(device::DEVICE_NODE))
            }
            Strategy::UserSpaceOnly => {
                !host.is_module_loaded(&ctx.config.module_name)
                    && host.path_exists(Path::new(paths::USERSPACE_LIBRARY))
            }
        }
    }

    /// Whether the consumer of this strategy recognises the reader
    pub fn recognized(&self, ctx: &StrategyContext) -> bool {
        match self {
            Strategy::UserSpaceOnly => ctx.host.service_status(services::USERSPACE).active,
            _ => ctx.fprintd_lists_device(),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = FpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "generic-library" | "generic" | "libfprint" | "GenericLibrary" => Ok(Strategy::GenericLibrary),
            "compatibility-mode" | "compat" | "CompatibilityMode" => Ok(Strategy::CompatibilityMode),
            "minimal-driver" | "minimal" | "MinimalDriver" => Ok(Strategy::MinimalDriver),
            "user-space-only" | "userspace" | "UserSpaceOnly" => Ok(Strategy::UserSpaceOnly),
            other => Err(FpError::UnknownStrategy(other.to_string())),
        }
    }
}
