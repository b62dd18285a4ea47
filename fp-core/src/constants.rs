//! Constants and configuration values for fpinstall
//!
//! Centralizes device identifiers, host paths, service names, package sets
//! and timeouts. Add new magic values here rather than inline.

use std::time::Duration;

/// Target device and driver identity
pub mod device {
    /// USB vendor id of the FPC sensor
    pub const USB_VENDOR_ID: &str = "10a5";

    /// USB product id of the FPC sensor
    pub const USB_PRODUCT_ID: &str = "9201";

    /// `vendor:product` form used in [`crate::SystemProfile::detected_device_ids`]
    pub const USB_ID: &str = "10a5:9201";

    /// Human-readable device name
    pub const DEVICE_NAME: &str = "FPC Fingerprint Reader (Xiaomi)";

    /// Kernel module name of the primary driver
    pub const MODULE_NAME: &str = "fp_xiaomi";

    /// Character device created by the primary driver for the first reader
    pub const DEVICE_NODE: &str = "/dev/fp_xiaomi0";

    /// Capability attribute exported by the driver in sysfs
    pub const CAPABILITIES_ATTR: &str = "/sys/class/fp_xiaomi/fp_xiaomi0/capabilities";
}

/// Driver capability bits as exported through sysfs
pub mod capabilities {
    pub const CAPTURE: u32 = 0x0001;
    pub const VERIFY: u32 = 0x0002;
    pub const IDENTIFY: u32 = 0x0004;
    pub const TEMPLATE_STORAGE: u32 = 0x0008;
    pub const LIVE_DETECTION: u32 = 0x0010;
    pub const NAVIGATION: u32 = 0x0020;

    /// Feature set the driver keeps in minimal mode
    pub const MINIMAL_MASK: u32 = CAPTURE | VERIFY;
}

/// Module parameters understood by the primary driver
pub mod module_params {
    pub const COMPAT_MODE: &str = "compat_mode";
    pub const MINIMAL_MODE: &str = "minimal_mode";
    pub const DEBUG: &str = "debug";
}

/// Host paths
pub mod paths {
    /// Device activation rules installed for the primary driver
    pub const UDEV_RULES_FILE: &str = "/etc/udev/rules.d/60-fp-xiaomi.rules";

    /// Rules installed by the generic-library strategy
    pub const GENERIC_RULES_FILE: &str = "/etc/udev/rules.d/61-fp-xiaomi-generic.rules";

    /// Rules installed by the user-space strategy
    pub const USERSPACE_RULES_FILE: &str = "/etc/udev/rules.d/61-fp-xiaomi-userspace.rules";

    /// Distribution identification
    pub const OS_RELEASE: &str = "/etc/os-release";

    /// Kernel module list
    pub const PROC_MODULES: &str = "/proc/modules";

    /// Kernel release
    pub const PROC_OSRELEASE: &str = "/proc/sys/kernel/osrelease";

    /// USB device directory in sysfs
    pub const SYS_USB_DEVICES: &str = "/sys/bus/usb/devices";

    /// Module parameter directory in sysfs
    pub const SYS_MODULE: &str = "/sys/module";

    /// Kernel module build tree for a given release
    pub fn kernel_build_dir(release: &str) -> String {
        format!("/lib/modules/{}/build", release)
    }

    /// Installed user-space communication library
    pub const USERSPACE_LIBRARY: &str = "/usr/local/lib/libfp_xiaomi.so";

    /// Default location of the external driver source tree
    pub const DEFAULT_SOURCE_DIR: &str = "/usr/src/fp_xiaomi";

    /// Installer settings, relative to the state root
    pub const INSTALLER_CONFIG: &str = "etc/fpinstall/installer.json";

    /// Fallback configuration, relative to the state root
    pub const FALLBACK_CONFIG: &str = "etc/fpinstall/fallback.conf";

    /// Versioned state record, relative to the state root
    pub const STATE_FILE: &str = "var/lib/fpinstall/state.json";

    /// Backup directory, relative to the state root
    pub const BACKUP_DIR: &str = "var/lib/fpinstall/backup";

    /// Advisory lock file, relative to the state root
    pub const LOCK_FILE: &str = "run/fpinstall.lock";
}

/// Backup snapshot file names inside [`paths::BACKUP_DIR`]
pub mod backup {
    pub const MODULES_FILE: &str = "modules.txt";
    pub const RULES_FILE: &str = "rules.backup";
    pub const SERVICES_FILE: &str = "services.txt";

    /// Files a fallback strategy may create or replace, with the name of
    /// their copy in the backup directory
    pub const TRACKED_FILES: &[(&str, &str)] = &[
        (super::paths::GENERIC_RULES_FILE, "generic-rules.backup"),
        (super::paths::USERSPACE_RULES_FILE, "userspace-rules.backup"),
        (super::paths::USERSPACE_LIBRARY, "libfp_xiaomi.so.backup"),
    ];
}

/// Service names
pub mod services {
    /// Fingerprint daemon consuming libfprint devices
    pub const FPRINTD: &str = "fprintd";

    /// Supervised user-space driver service
    pub const USERSPACE: &str = "fp-xiaomi-userspace";

    /// Fallback monitor hook
    pub const MONITOR: &str = "fp-xiaomi-fallback-monitor";

    /// Services whose state is captured in backup snapshots
    pub const MANAGED: &[&str] = &[FPRINTD, USERSPACE];

    /// D-Bus call listing devices known to fprintd
    pub const FPRINTD_LIST_DEVICES: &[&str] = &[
        "busctl",
        "call",
        "net.reactivated.Fprint",
        "/net/reactivated/Fprint/Manager",
        "net.reactivated.Fprint.Manager",
        "GetDevices",
    ];

    /// Object path prefix of fprintd devices in the listing above
    pub const FPRINTD_DEVICE_PREFIX: &str = "/net/reactivated/Fprint/Device/";
}

/// Fallback manager defaults
pub mod fallback {
    /// Seconds the primary driver may stay unhealthy before auto-fallback
    pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

    /// Monitor polling interval in seconds
    pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 5;

    /// Current version of the state record
    pub const STATE_VERSION: u32 = 1;
}

/// Bounds on external command invocations
pub mod timing {
    use super::Duration;

    /// Default command timeout
    pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

    /// Driver build timeout
    pub const BUILD_TIMEOUT: Duration = Duration::from_secs(600);

    /// Package installation timeout
    pub const PACKAGE_TIMEOUT: Duration = Duration::from_secs(900);

    /// Module load/unload timeout
    pub const MODULE_TIMEOUT: Duration = Duration::from_secs(30);

    /// Poll interval while waiting for a child process
    pub const COMMAND_POLL: Duration = Duration::from_millis(50);

    /// Time given to udev to create the device node after a module load
    pub const DEVICE_SETTLE: Duration = Duration::from_millis(500);
}
