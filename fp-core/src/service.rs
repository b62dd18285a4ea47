//! Service Management
//!
//! Init-system detection, unit templates and the service configurator.
//!
//! # Supported Init Systems
//! - **systemd** (most Linux distros)
//! - **OpenRC** (Gentoo, Alpine, Artix)
//! - **runit** (Void Linux, Artix)
//!
//! Templates and command lines are built here; [`crate::host::LinuxHost`]
//! executes them.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::services::FPRINTD;
use crate::data::Completion;
use crate::error::{FpError, Result};
use crate::host::{Host, HostCommand, ServiceUnit};
use crate::system::SystemProfile;

/// Detected init system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitSystem {
    Systemd,
    #[serde(rename = "openrc")]
    OpenRC,
    Runit,
    Unknown,
}

impl std::fmt::Display for InitSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitSystem::Systemd => write!(f, "systemd"),
            InitSystem::OpenRC => write!(f, "openrc"),
            InitSystem::Runit => write!(f, "runit"),
            InitSystem::Unknown => write!(f, "unknown"),
        }
    }
}

/// Detect the init system in use
pub fn detect_init_system(host: &dyn Host) -> InitSystem {
    if host.path_exists(Path::new("/run/systemd/system")) {
        return InitSystem::Systemd;
    }

    if host.path_exists(Path::new("/sbin/openrc")) || host.path_exists(Path::new("/usr/sbin/openrc")) {
        return InitSystem::OpenRC;
    }

    if host.path_exists(Path::new("/run/runit")) || host.path_exists(Path::new("/etc/runit")) {
        return InitSystem::Runit;
    }

    // PID 1 process name
    if let Ok(Some(comm)) = host.read_file(Path::new("/proc/1/comm")) {
        let init = comm.trim();
        if init.contains("systemd") {
            return InitSystem::Systemd;
        } else if init.contains("runit") {
            return InitSystem::Runit;
        } else if (init.contains("openrc") || init == "init")
            && host.path_exists(Path::new("/etc/init.d"))
            && host.path_exists(Path::new("/etc/conf.d"))
        {
            return InitSystem::OpenRC;
        }
    }

    InitSystem::Unknown
}

// ============================================================================
// Service file templates
// ============================================================================

/// One file that makes up a registered service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFile {
    pub path: PathBuf,
    pub contents: String,
    pub executable: bool,
}

fn systemd_service(unit: &ServiceUnit) -> String {
    format!(
        r#"[Unit]
Description={}
After=local-fs.target systemd-udevd.service

[Service]
Type=simple
ExecStart={}
Restart=on-failure
RestartSec=5

[Install]
WantedBy=multi-user.target
"#,
        unit.description, unit.exec
    )
}

fn openrc_service(unit: &ServiceUnit) -> String {
    let (command, args) = unit.exec.split_once(' ').unwrap_or((unit.exec.as_str(), ""));
    format!(
        r#"#!/sbin/openrc-run

name="{name}"
description="{description}"
command="{command}"
command_args="{args}"
command_background=true
pidfile="/run/{name}.pid"

depend() {{
    need localmount
    after udev
}}
"#,
        name = unit.name,
        description = unit.description,
        command = command,
        args = args,
    )
}

fn runit_run_script(unit: &ServiceUnit) -> String {
    format!(
        r#"#!/bin/sh
# {}
exec {} 2>&1
"#,
        unit.description, unit.exec
    )
}

/// Files to write when registering `unit` with `init`
pub fn unit_files(init: InitSystem, unit: &ServiceUnit) -> Result<Vec<UnitFile>> {
    match init {
        InitSystem::Systemd => Ok(vec![UnitFile {
            path: PathBuf::from(format!("/etc/systemd/system/{}.service", unit.name)),
            contents: systemd_service(unit),
            executable: false,
        }]),
        InitSystem::OpenRC => Ok(vec![UnitFile {
            path: PathBuf::from(format!("/etc/init.d/{}", unit.name)),
            contents: openrc_service(unit),
            executable: true,
        }]),
        InitSystem::Runit => Ok(vec![UnitFile {
            path: PathBuf::from(format!("/etc/sv/{}/run", unit.name)),
            contents: runit_run_script(unit),
            executable: true,
        }]),
        InitSystem::Unknown => Err(FpError::UnsupportedInitSystem(
            "unknown init system, cannot register service".to_string(),
        )),
    }
}

/// Paths owned by a registered service
pub fn unit_paths(init: InitSystem, name: &str) -> Vec<PathBuf> {
    match init {
        InitSystem::Systemd => vec![PathBuf::from(format!("/etc/systemd/system/{}.service", name))],
        InitSystem::OpenRC => vec![PathBuf::from(format!("/etc/init.d/{}", name))],
        InitSystem::Runit => vec![
            PathBuf::from(format!("/etc/sv/{}/run", name)),
            PathBuf::from(format!("/var/service/{}", name)),
        ],
        InitSystem::Unknown => Vec::new(),
    }
}

// ============================================================================
// Command builders
// ============================================================================

/// Command telling the init system to pick up new unit files
pub fn reload_command(init: InitSystem) -> Option<HostCommand> {
    match init {
        InitSystem::Systemd => Some(HostCommand::new("systemctl").arg("daemon-reload")),
        _ => None,
    }
}

pub fn run_state_command(init: InitSystem, name: &str, running: bool) -> Result<HostCommand> {
    let verb = if running { "start" } else { "stop" };
    match init {
        InitSystem::Systemd => Ok(HostCommand::new("systemctl")
            .arg(verb)
            .arg(format!("{}.service", name))),
        InitSystem::OpenRC => Ok(HostCommand::new("rc-service").args([name, verb])),
        InitSystem::Runit => Ok(HostCommand::new("sv").args([if running { "up" } else { "down" }, name])),
        InitSystem::Unknown => Err(FpError::UnsupportedInitSystem(format!(
            "cannot {} {} with an unknown init system",
            verb, name
        ))),
    }
}

pub fn enable_command(init: InitSystem, name: &str, enabled: bool) -> Result<HostCommand> {
    match init {
        InitSystem::Systemd => Ok(HostCommand::new("systemctl")
            .arg(if enabled { "enable" } else { "disable" })
            .arg(format!("{}.service", name))),
        InitSystem::OpenRC => Ok(HostCommand::new("rc-update").args([
            if enabled { "add" } else { "del" },
            name,
            "default",
        ])),
        InitSystem::Runit => {
            let link = format!("/var/service/{}", name);
            if enabled {
                Ok(HostCommand::new("ln")
                    .arg("-sf")
                    .arg(format!("/etc/sv/{}", name))
                    .arg(link))
            } else {
                Ok(HostCommand::new("rm").arg("-f").arg(link))
            }
        }
        InitSystem::Unknown => Err(FpError::UnsupportedInitSystem(format!(
            "cannot change enablement of {} with an unknown init system",
            name
        ))),
    }
}

// ============================================================================
// Service configurator
// ============================================================================

/// Ensure the services the driver needs end-to-end are enabled and running.
///
/// Safe to re-run: a service already enabled and running is left alone.
pub fn configure(host: &dyn Host, profile: &SystemProfile) -> Result<Completion> {
    if profile.init_system == InitSystem::Unknown {
        return Ok(Completion::warning(format!(
            "unknown init system; enable and start {} manually",
            FPRINTD
        )));
    }

    let status = host.service_status(FPRINTD);
    if !status.installed {
        return Ok(Completion::warning(format!(
            "{} is not installed; fingerprint login will not be available",
            FPRINTD
        )));
    }

    let mut changes = Vec::new();
    if !status.enabled {
        host.set_service_enabled(FPRINTD, true)?;
        changes.push("enabled");
    }
    if !status.active {
        host.set_service_running(FPRINTD, true)?;
        changes.push("started");
    }

    if changes.is_empty() {
        debug!("{} already enabled and running", FPRINTD);
        Ok(Completion::success(format!("{} already enabled and running", FPRINTD)))
    } else {
        info!(service = FPRINTD, changes = ?changes, "Configured service");
        Ok(Completion::success(format!("{} {}", FPRINTD, changes.join(" and "))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Outcome;
    use crate::host::{FakeHost, ServiceStatus};

    fn systemd_profile() -> SystemProfile {
        SystemProfile {
            init_system: InitSystem::Systemd,
            ..SystemProfile::unknown()
        }
    }

    #[test]
    fn test_detect_systemd_from_run_dir() {
        let host = FakeHost::new().with_file("/run/systemd/system/.keep", "");
        assert_eq!(detect_init_system(&host), InitSystem::Systemd);
    }

    #[test]
    fn test_detect_from_pid1_comm() {
        let host = FakeHost::new().with_file("/proc/1/comm", "runit\n");
        assert_eq!(detect_init_system(&host), InitSystem::Runit);
        assert_eq!(detect_init_system(&FakeHost::new()), InitSystem::Unknown);
    }

    #[test]
    fn test_systemd_unit_template() {
        let unit = ServiceUnit {
            name: "fp-xiaomi-userspace".into(),
            description: "FPC user-space driver".into(),
            exec: "/usr/local/libexec/fp-xiaomi-userspace --foreground".into(),
        };
        let files = unit_files(InitSystem::Systemd, &unit).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, PathBuf::from("/etc/systemd/system/fp-xiaomi-userspace.service"));
        assert!(files[0].contents.contains("ExecStart=/usr/local/libexec/fp-xiaomi-userspace --foreground"));
        assert!(unit_files(InitSystem::Unknown, &unit).is_err());
    }

    #[test]
    fn test_openrc_template_splits_args() {
        let unit = ServiceUnit {
            name: "mon".into(),
            description: "monitor".into(),
            exec: "/usr/bin/fpinstall fallback monitor".into(),
        };
        let files = unit_files(InitSystem::OpenRC, &unit).unwrap();
        assert!(files[0].contents.contains("command=\"/usr/bin/fpinstall\""));
        assert!(files[0].contents.contains("command_args=\"fallback monitor\""));
        assert!(files[0].executable);
    }

    #[test]
    fn test_configure_starts_fprintd_once() {
        let host = FakeHost::new().with_service(
            FPRINTD,
            ServiceStatus { installed: true, active: false, enabled: false },
        );

        let first = configure(&host, &systemd_profile()).unwrap();
        assert_eq!(first.outcome, Outcome::Success);
        assert_eq!(first.message, "fprintd enabled and started");

        let second = configure(&host, &systemd_profile()).unwrap();
        assert_eq!(second.outcome, Outcome::Success);
        assert!(second.message.contains("already"));
        assert_eq!(host.service_status(FPRINTD), ServiceStatus { installed: true, active: true, enabled: true });
    }

    #[test]
    fn test_configure_warns_without_fprintd() {
        let host = FakeHost::new();
        let result = configure(&host, &systemd_profile()).unwrap();
        assert_eq!(result.outcome, Outcome::Warning);

        let unknown = configure(&host, &SystemProfile::unknown()).unwrap();
        assert_eq!(unknown.outcome, Outcome::Warning);
    }
}
