//! Environment probing
//!
//! Read-only detection of distribution, package manager, init system and
//! attached hardware. Probing never fails: anything unrecognized is reported
//! as `unknown` and left for the orchestrator to judge.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::{device, paths};
use crate::error::FpError;
use crate::host::Host;
use crate::service::{detect_init_system, InitSystem};

/// Sentinel for values the probe could not determine
pub const UNKNOWN: &str = "unknown";

/// Supported package managers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Dnf,
    Pacman,
    Zypper,
    Unknown,
}

impl PackageManager {
    pub const SUPPORTED: [PackageManager; 4] = [
        PackageManager::Apt,
        PackageManager::Dnf,
        PackageManager::Pacman,
        PackageManager::Zypper,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PackageManager::Apt => "apt",
            PackageManager::Dnf => "dnf",
            PackageManager::Pacman => "pacman",
            PackageManager::Zypper => "zypper",
            PackageManager::Unknown => UNKNOWN,
        }
    }

    /// Package manager used by a distribution family
    pub fn for_distribution(id: &str) -> Self {
        match id {
            "ubuntu" | "debian" | "linuxmint" | "pop" | "elementary" | "zorin" | "kali" => PackageManager::Apt,
            "fedora" | "rhel" | "centos" | "rocky" | "almalinux" | "nobara" => PackageManager::Dnf,
            "arch" | "manjaro" | "endeavouros" | "garuda" | "artix" => PackageManager::Pacman,
            "sles" | "suse" => PackageManager::Zypper,
            id if id.starts_with("opensuse") => PackageManager::Zypper,
            _ => PackageManager::Unknown,
        }
    }

    fn binary(&self) -> Option<&'static str> {
        match self {
            PackageManager::Apt => Some("/usr/bin/apt-get"),
            PackageManager::Dnf => Some("/usr/bin/dnf"),
            PackageManager::Pacman => Some("/usr/bin/pacman"),
            PackageManager::Zypper => Some("/usr/bin/zypper"),
            PackageManager::Unknown => None,
        }
    }
}

impl std::fmt::Display for PackageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageManager {
    type Err = FpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "apt" | "apt-get" => Ok(PackageManager::Apt),
            "dnf" | "yum" => Ok(PackageManager::Dnf),
            "pacman" => Ok(PackageManager::Pacman),
            "zypper" => Ok(PackageManager::Zypper),
            "unknown" => Ok(PackageManager::Unknown),
            other => Err(FpError::Detection(format!("unrecognized package manager {:?}", other))),
        }
    }
}

/// What the probe found on this host. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemProfile {
    pub distribution_id: String,
    pub distribution_version: String,
    pub package_manager: PackageManager,
    pub init_system: InitSystem,
    pub detected_device_ids: BTreeSet<String>,
    pub kernel_release: String,
    pub is_root: bool,
}

impl SystemProfile {
    /// Profile with every field set to its sentinel
    pub fn unknown() -> Self {
        Self {
            distribution_id: UNKNOWN.to_string(),
            distribution_version: UNKNOWN.to_string(),
            package_manager: PackageManager::Unknown,
            init_system: InitSystem::Unknown,
            detected_device_ids: BTreeSet::new(),
            kernel_release: UNKNOWN.to_string(),
            is_root: false,
        }
    }

    /// Whether the target reader is attached
    pub fn has_target_device(&self) -> bool {
        self.detected_device_ids.contains(device::USB_ID)
    }

    /// Fields still at their sentinel value
    pub fn unknown_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.distribution_id == UNKNOWN {
            fields.push("distribution");
        }
        if self.package_manager == PackageManager::Unknown {
            fields.push("package manager");
        }
        if self.init_system == InitSystem::Unknown {
            fields.push("init system");
        }
        if self.kernel_release == UNKNOWN {
            fields.push("kernel release");
        }
        fields
    }
}

fn os_release_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^([A-Z_][A-Z0-9_]*)=(?:"([^"]*)"|'([^']*)'|(.*))$"#).expect("valid os-release regex")
    })
}

/// Parse `/etc/os-release` content into key/value pairs
pub fn parse_os_release(content: &str) -> BTreeMap<String, String> {
    let re = os_release_line();
    content
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line.trim())?;
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
            Some((caps[1].to_string(), value))
        })
        .collect()
}

fn detect_package_manager(host: &dyn Host, os_release: &BTreeMap<String, String>) -> PackageManager {
    if let Some(id) = os_release.get("ID") {
        let pm = PackageManager::for_distribution(&id.to_ascii_lowercase());
        if pm != PackageManager::Unknown {
            return pm;
        }
    }

    if let Some(like) = os_release.get("ID_LIKE") {
        for id in like.split_whitespace() {
            let pm = PackageManager::for_distribution(&id.to_ascii_lowercase());
            if pm != PackageManager::Unknown {
                return pm;
            }
        }
    }

    PackageManager::SUPPORTED
        .into_iter()
        .find(|pm| pm.binary().is_some_and(|b| host.path_exists(Path::new(b))))
        .unwrap_or(PackageManager::Unknown)
}

fn read_os_release(host: &dyn Host) -> BTreeMap<String, String> {
    match host.read_file(Path::new(paths::OS_RELEASE)) {
        Ok(Some(content)) => parse_os_release(&content),
        Ok(None) => BTreeMap::new(),
        Err(e) => {
            debug!("Could not read {}: {}", paths::OS_RELEASE, e);
            BTreeMap::new()
        }
    }
}

/// Package manager of the host, without a full probe
pub fn package_manager(host: &dyn Host) -> PackageManager {
    detect_package_manager(host, &read_os_release(host))
}

/// Probe the host. Never fails; unknown values use the `unknown` sentinel.
pub fn probe(host: &dyn Host) -> SystemProfile {
    let os_release = read_os_release(host);

    let non_empty = |key: &str| {
        os_release
            .get(key)
            .filter(|v| !v.is_empty())
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_else(|| UNKNOWN.to_string())
    };

    let kernel_release = host.kernel_release();
    let profile = SystemProfile {
        distribution_id: non_empty("ID"),
        distribution_version: non_empty("VERSION_ID"),
        package_manager: detect_package_manager(host, &os_release),
        init_system: detect_init_system(host),
        detected_device_ids: host
            .usb_devices()
            .into_iter()
            .map(|id| id.to_ascii_lowercase())
            .collect(),
        kernel_release: if kernel_release.trim().is_empty() {
            UNKNOWN.to_string()
        } else {
            kernel_release.trim().to_string()
        },
        is_root: host.is_root(),
    };

    info!(
        distribution = %profile.distribution_id,
        version = %profile.distribution_version,
        package_manager = %profile.package_manager,
        init = %profile.init_system,
        device = profile.has_target_device(),
        "Probed environment"
    );
    profile
}
