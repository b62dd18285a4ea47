//! Dependency Installer
//!
//! Maps a package manager to the packages the driver build needs and
//! installs whatever is missing. Re-running on a prepared system only issues
//! queries.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::constants::timing;
use crate::data::Completion;
use crate::error::{FpError, Result};
use crate::host::{Host, HostCommand};
use crate::system::{PackageManager, UNKNOWN};

/// Packages to ensure for one package manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencySet {
    pub package_manager: PackageManager,
    /// Build toolchain, kernel headers, libusb development files
    pub required: Vec<String>,
    /// Generic fingerprint stack and dkms; failures only warn
    pub optional: Vec<String>,
}

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// libfprint and fprintd package names
fn fingerprint_stack(package_manager: PackageManager) -> Option<[&'static str; 2]> {
    match package_manager {
        PackageManager::Apt => Some(["libfprint-2-2", "fprintd"]),
        PackageManager::Dnf | PackageManager::Pacman => Some(["libfprint", "fprintd"]),
        PackageManager::Zypper => Some(["libfprint2", "fprintd"]),
        PackageManager::Unknown => None,
    }
}

/// The generic fingerprint stack as a required set, for the generic-library
/// fallback strategy
pub fn resolve_fingerprint_stack(package_manager: PackageManager) -> Result<DependencySet> {
    let packages = fingerprint_stack(package_manager).ok_or_else(|| {
        FpError::Detection("package manager not recognized; cannot install libfprint".to_string())
    })?;
    Ok(DependencySet {
        package_manager,
        required: owned(&packages),
        optional: Vec::new(),
    })
}

/// Resolve the dependency set for a package manager.
///
/// `kernel_release` picks the matching headers package where the
/// distribution versions them.
pub fn resolve(package_manager: PackageManager, kernel_release: &str) -> Result<DependencySet> {
    let known_kernel = !kernel_release.is_empty() && kernel_release != UNKNOWN;

    let required = match package_manager {
        PackageManager::Apt => {
            let headers = if known_kernel {
                format!("linux-headers-{}", kernel_release)
            } else {
                "linux-headers-generic".to_string()
            };
            let mut required = owned(&["build-essential", "libusb-1.0-0-dev", "pkg-config"]);
            required.insert(1, headers);
            required
        }
        PackageManager::Dnf => {
            let headers = if known_kernel {
                format!("kernel-devel-{}", kernel_release)
            } else {
                "kernel-devel".to_string()
            };
            let mut required = owned(&["gcc", "make", "libusb1-devel", "pkgconf-pkg-config"]);
            required.insert(2, headers);
            required
        }
        PackageManager::Pacman => owned(&["base-devel", "linux-headers", "libusb", "pkgconf"]),
        PackageManager::Zypper => owned(&["gcc", "make", "kernel-default-devel", "libusb-1_0-devel", "pkg-config"]),
        PackageManager::Unknown => {
            return Err(FpError::Detection(
                "package manager not recognized; cannot resolve dependencies".to_string(),
            ))
        }
    };

    let mut optional: Vec<String> = fingerprint_stack(package_manager)
        .into_iter()
        .flatten()
        .map(str::to_string)
        .collect();
    optional.push("dkms".to_string());

    Ok(DependencySet {
        package_manager,
        required,
        optional,
    })
}

fn query_command(pm: PackageManager, package: &str) -> HostCommand {
    match pm {
        PackageManager::Apt => HostCommand::new("dpkg").arg("-s").arg(package),
        PackageManager::Dnf | PackageManager::Zypper | PackageManager::Unknown => {
            HostCommand::new("rpm").arg("-q").arg(package)
        }
        PackageManager::Pacman => HostCommand::new("pacman").arg("-Q").arg(package),
    }
}

fn refresh_command(pm: PackageManager) -> HostCommand {
    let command = match pm {
        PackageManager::Apt => HostCommand::from_argv(&["apt-get", "update"]),
        PackageManager::Dnf => HostCommand::from_argv(&["dnf", "makecache"]),
        PackageManager::Pacman => HostCommand::from_argv(&["pacman", "-Sy"]),
        PackageManager::Zypper | PackageManager::Unknown => {
            HostCommand::from_argv(&["zypper", "--non-interactive", "refresh"])
        }
    };
    command.timeout(timing::PACKAGE_TIMEOUT)
}

fn install_command(pm: PackageManager, packages: &[String]) -> HostCommand {
    let command = match pm {
        PackageManager::Apt => HostCommand::from_argv(&["apt-get", "install", "-y"]),
        PackageManager::Dnf => HostCommand::from_argv(&["dnf", "install", "-y"]),
        PackageManager::Pacman => HostCommand::from_argv(&["pacman", "-S", "--noconfirm", "--needed"]),
        PackageManager::Zypper | PackageManager::Unknown => {
            HostCommand::from_argv(&["zypper", "--non-interactive", "install"])
        }
    };
    command.args(packages.iter().cloned()).timeout(timing::PACKAGE_TIMEOUT)
}

fn is_installed(host: &dyn Host, pm: PackageManager, package: &str) -> bool {
    host.run(&query_command(pm, package))
        .map(|out| out.success)
        .unwrap_or(false)
}

fn failure_reason(error: FpError) -> String {
    match error {
        FpError::CommandFailed { stderr, status, .. } if stderr.is_empty() => status,
        FpError::CommandFailed { stderr, .. } => stderr,
        other => other.to_string(),
    }
}

/// Install every missing package of `set`.
///
/// Required failures are a [`FpError::Dependency`]; optional failures only
/// downgrade the result to a warning.
pub fn install(host: &dyn Host, set: &DependencySet) -> Result<Completion> {
    let pm = set.package_manager;
    let missing_required: Vec<String> = set
        .required
        .iter()
        .filter(|p| !is_installed(host, pm, p))
        .cloned()
        .collect();
    let missing_optional: Vec<String> = set
        .optional
        .iter()
        .filter(|p| !is_installed(host, pm, p))
        .cloned()
        .collect();

    if missing_required.is_empty() && missing_optional.is_empty() {
        debug!("All {} dependencies present", set.required.len() + set.optional.len());
        return Ok(Completion::success(format!(
            "all {} packages already installed",
            set.required.len() + set.optional.len()
        )));
    }

    info!(
        package_manager = %pm,
        required = ?missing_required,
        optional = ?missing_optional,
        "Installing missing packages"
    );

    if let Err(e) = host.run_checked(&refresh_command(pm)) {
        warn!("Package index refresh failed: {}", e);
    }

    if !missing_required.is_empty() {
        host.run_checked(&install_command(pm, &missing_required))
            .map_err(|e| FpError::Dependency {
                package: missing_required.join(" "),
                reason: failure_reason(e),
            })?;
    }

    let mut skipped = Vec::new();
    for package in &missing_optional {
        if let Err(e) = host.run_checked(&install_command(pm, std::slice::from_ref(package))) {
            warn!("Optional package {} not installed: {}", package, e);
            skipped.push(package.as_str());
        }
    }

    let installed = missing_required.len() + missing_optional.len() - skipped.len();
    if skipped.is_empty() {
        Ok(Completion::success(format!("installed {} packages", installed)))
    } else {
        Ok(Completion::warning(format!(
            "installed {} packages; optional packages unavailable: {}",
            installed,
            skipped.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Outcome;
    use crate::host::FakeHost;

    #[test]
    fn test_resolve_uses_kernel_release() {
        let set = resolve(PackageManager::Apt, "6.5.0-14-generic").unwrap();
        assert_eq!(set.required[1], "linux-headers-6.5.0-14-generic");
        let set = resolve(PackageManager::Dnf, UNKNOWN).unwrap();
        assert!(set.required.contains(&"kernel-devel".to_string()));
    }

    #[test]
    fn test_fingerprint_stack_is_required_set() {
        let set = resolve_fingerprint_stack(PackageManager::Zypper).unwrap();
        assert_eq!(set.required, vec!["libfprint2", "fprintd"]);
        assert!(set.optional.is_empty());
        assert_eq!(
            resolve(PackageManager::Apt, "6.5.0").unwrap().optional,
            vec!["libfprint-2-2", "fprintd", "dkms"]
        );
        assert!(resolve_fingerprint_stack(PackageManager::Unknown).is_err());
    }

    #[test]
    fn test_unknown_package_manager_is_detection_error() {
        let err = resolve(PackageManager::Unknown, "6.5.0").unwrap_err();
        assert_eq!(err.kind(), "detection_error");
        assert!(!err.is_force_overridable());
    }

    #[test]
    fn test_present_packages_are_not_reinstalled() {
        let host = FakeHost::new();
        let set = resolve(PackageManager::Pacman, "6.5.0").unwrap();
        let result = install(&host, &set).unwrap();
        assert_eq!(result.outcome, Outcome::Success);
        assert!(host.commands().iter().all(|c| c.starts_with("pacman -Q ")));
    }

    #[test]
    fn test_missing_packages_install_after_one_refresh() {
        let host = FakeHost::new().fail_command("dpkg -s", "not installed");
        let set = resolve(PackageManager::Apt, "6.5.0").unwrap();
        let result = install(&host, &set).unwrap();
        assert_eq!(result.outcome, Outcome::Success);

        let commands = host.commands();
        assert_eq!(commands.iter().filter(|c| *c == "apt-get update").count(), 1);
        assert!(commands.iter().any(|c| c.starts_with("apt-get install -y build-essential")));
    }

    #[test]
    fn test_optional_failure_is_warning_required_failure_is_error() {
        let host = FakeHost::new()
            .fail_command("rpm -q", "")
            .fail_command("dnf install -y dkms", "No match for argument: dkms");
        let set = resolve(PackageManager::Dnf, "6.5.0").unwrap();
        let result = install(&host, &set).unwrap();
        assert_eq!(result.outcome, Outcome::Warning);
        assert!(result.message.contains("dkms"));

        let host = FakeHost::new()
            .fail_command("rpm -q", "")
            .fail_command("zypper --non-interactive install gcc", "repository unreachable");
        let set = resolve(PackageManager::Zypper, "6.5.0").unwrap();
        match install(&host, &set) {
            Err(FpError::Dependency { reason, .. }) => assert_eq!(reason, "repository unreachable"),
            other => panic!("expected dependency error, got {:?}", other),
        }
    }
}
