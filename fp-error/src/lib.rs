//! Unified error handling for fpinstall
//!
//! This crate provides a single error type used across the installer, the
//! fallback manager and the command line. Each variant maps onto one class of
//! the installer's error taxonomy; the orchestrator decides abort-vs-continue
//! from [`FpError::is_force_overridable`], never the stage that raised it.

use std::io;
use std::path::PathBuf;

/// Result type alias using FpError
pub type Result<T> = std::result::Result<T, FpError>;

/// Unified error type for all fpinstall operations
#[derive(thiserror::Error, Debug)]
pub enum FpError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    // ============================================================================
    // Installation Pipeline Errors
    // ============================================================================
    #[error("Environment not recognized: {0}")]
    Detection(String),

    #[error("Dependency installation failed for {package}: {reason}")]
    Dependency {
        package: String,
        reason: String,
    },

    #[error("Compatibility check failed: {}", .reasons.join("; "))]
    CompatibilityFailure {
        reasons: Vec<String>,
    },

    #[error("Driver build failed: {0}")]
    Build(String),

    #[error("Driver load failed: {0}")]
    Load(String),

    // ============================================================================
    // Fallback Manager Errors
    // ============================================================================
    #[error("Cannot activate {strategy}: {reason}")]
    StrategyActivation {
        strategy: String,
        reason: String,
    },

    #[error("No backup snapshot exists; nothing to restore")]
    NoBackup,

    #[error("Fallback manager is already installed")]
    AlreadyInstalled,

    #[error("Fallback manager is not installed")]
    NotInstalled,

    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("Operation not valid in state {state}: {reason}")]
    InvalidState {
        state: String,
        reason: String,
    },

    #[error("Another fpinstall process holds the state lock {0}")]
    LockHeld(PathBuf),

    #[error("Backup snapshot is corrupt: {0}")]
    CorruptBackup(String),

    // ============================================================================
    // External Command Errors
    // ============================================================================
    #[error("Command `{command}` timed out after {seconds}s")]
    Timeout {
        command: String,
        seconds: u64,
    },

    #[error("Command `{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    // ============================================================================
    // Configuration and Service Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Init system not supported: {0}")]
    UnsupportedInitSystem(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),
}

impl FpError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a service error from a string
    pub fn service(msg: impl Into<String>) -> Self {
        Self::Service(msg.into())
    }

    /// Create a build error from a string
    pub fn build(msg: impl Into<String>) -> Self {
        Self::Build(msg.into())
    }

    /// Create a load error from a string
    pub fn load(msg: impl Into<String>) -> Self {
        Self::Load(msg.into())
    }

    /// Create a strategy activation error
    pub fn activation(strategy: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StrategyActivation {
            strategy: strategy.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable identifier used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) | Self::FileRead { .. } | Self::FileWrite { .. } => "io_error",
            Self::Detection(_) => "detection_error",
            Self::Dependency { .. } => "dependency_error",
            Self::CompatibilityFailure { .. } => "compatibility_failure",
            Self::Build(_) => "build_error",
            Self::Load(_) => "load_error",
            Self::StrategyActivation { .. } => "strategy_activation_error",
            Self::NoBackup => "no_backup_error",
            Self::AlreadyInstalled => "already_installed",
            Self::NotInstalled => "not_installed",
            Self::UnknownStrategy(_) => "unknown_strategy",
            Self::InvalidState { .. } => "invalid_state",
            Self::LockHeld(_) => "lock_held",
            Self::CorruptBackup(_) => "corrupt_backup",
            Self::Timeout { .. } => "timeout",
            Self::CommandFailed { .. } => "command_failed",
            Self::Config(_) | Self::JsonParse(_) => "config_error",
            Self::Service(_) | Self::UnsupportedInitSystem(_) => "service_error",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Generic(_) => "error",
        }
    }

    /// Whether `force` may downgrade this failure to a warning.
    ///
    /// Only the compatibility gate and the driver build/load verification
    /// qualify.
    pub fn is_force_overridable(&self) -> bool {
        matches!(
            self,
            Self::CompatibilityFailure { .. } | Self::Build(_) | Self::Load(_)
        )
    }

    /// Human-readable next step shown next to a failure in reports.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            Self::Detection(_) => Some(
                "install on a supported distribution (apt, dnf, pacman or zypper based)",
            ),
            Self::Dependency { .. } => Some(
                "check network access and the package manager output, then re-run the installer",
            ),
            Self::CompatibilityFailure { .. } => {
                Some("fix the reported problems, or use --force to continue anyway")
            }
            Self::Build(_) => Some(
                "check that kernel headers match the running kernel, or use --force and a fallback strategy",
            ),
            Self::Load(_) => Some(
                "inspect `dmesg` for driver errors, or use --force and activate a fallback strategy",
            ),
            Self::StrategyActivation { .. } => {
                Some("run `fpinstall fallback list` to see which strategies are available")
            }
            Self::NoBackup => Some("activate a strategy before calling restore"),
            Self::NotInstalled => Some("run `fpinstall fallback install` first"),
            Self::UnknownStrategy(_) => Some(
                "valid strategies: generic-library, compatibility-mode, minimal-driver, user-space-only",
            ),
            Self::LockHeld(_) => Some("wait for the other fpinstall process to finish"),
            Self::CorruptBackup(_) => {
                Some("inspect the backup directory; restore manually if needed")
            }
            Self::Timeout { .. } => Some("re-run with --debug to see where the command hangs"),
            Self::PermissionDenied(_) => Some("re-run as root (for example with sudo)"),
            Self::UnsupportedInitSystem(_) => Some("start the required services manually"),
            _ => None,
        }
    }

    /// Process exit code for the command line.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::UnknownStrategy(_) => 2,
            Self::NoBackup => 3,
            Self::StrategyActivation { .. } => 4,
            Self::LockHeld(_) => 5,
            _ => 1,
        }
    }
}

// Allow converting from String to FpError
impl From<String> for FpError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to FpError
impl From<&str> for FpError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_gates_are_force_overridable() {
        assert!(FpError::CompatibilityFailure { reasons: vec![] }.is_force_overridable());
        assert!(FpError::build("make failed").is_force_overridable());
        assert!(FpError::load("no module").is_force_overridable());

        assert!(!FpError::Detection("unknown".into()).is_force_overridable());
        assert!(!FpError::Dependency {
            package: "gcc".into(),
            reason: "404".into()
        }
        .is_force_overridable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(FpError::NoBackup.exit_code(), 3);
        assert_eq!(FpError::UnknownStrategy("x".into()).exit_code(), 2);
        assert_eq!(FpError::activation("MinimalDriver", "missing").exit_code(), 4);
        assert_eq!(FpError::generic("boom").exit_code(), 1);
    }

    #[test]
    fn test_compatibility_message_lists_reasons() {
        let err = FpError::CompatibilityFailure {
            reasons: vec!["not root".into(), "no headers".into()],
        };
        assert_eq!(err.to_string(), "Compatibility check failed: not root; no headers");
        assert!(err.remediation().unwrap().contains("--force"));
    }
}
