//! Host access
//!
//! Every side effect the installer and the fallback manager have on the
//! machine goes through [`Host`]. [`LinuxHost`] talks to the running system;
//! [`FakeHost`] keeps an in-memory model of one for tests.

mod fake;
mod linux;

pub use fake::FakeHost;
pub use linux::LinuxHost;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::timing;
use crate::error::{FpError, Result};

/// An external command with a bounded run time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl HostCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: timing::COMMAND_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build a command from a slice whose first element is the program
    pub fn from_argv(argv: &[&str]) -> Self {
        let mut iter = argv.iter();
        let program = iter.next().copied().unwrap_or_default();
        Self::new(program).args(iter.copied())
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Turn a non-zero exit into [`FpError::CommandFailed`]
    pub fn check(self, command: &HostCommand) -> Result<Self> {
        if self.success {
            return Ok(self);
        }
        Err(FpError::CommandFailed {
            command: command.to_string(),
            status: self
                .status
                .map(|s| format!("exit {}", s))
                .unwrap_or_else(|| "killed".to_string()),
            stderr: self.stderr.trim().to_string(),
        })
    }
}

/// Request to load a kernel module
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleLoad {
    pub name: String,
    /// Load this object file with `insmod` instead of resolving by name
    pub object: Option<PathBuf>,
    pub params: Vec<(String, String)>,
}

impl ModuleLoad {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn from_object(name: impl Into<String>, object: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            object: Some(object.into()),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }
}

/// Live state of one service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub installed: bool,
    pub active: bool,
    pub enabled: bool,
}

/// A supervised background service to register with the init system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUnit {
    pub name: String,
    pub description: String,
    /// Full command line of the supervised process
    pub exec: String,
}

/// Narrow interface to the machine
pub trait Host: Send + Sync {
    /// Read a text file, `None` when it does not exist
    fn read_file(&self, path: &Path) -> Result<Option<String>>;

    /// Create or replace a text file, creating parent directories
    fn write_file(&self, path: &Path, contents: &str) -> Result<()>;

    /// Read a file as raw bytes, `None` when it does not exist
    fn read_bytes(&self, path: &Path) -> Result<Option<Vec<u8>>>;

    /// Create or replace a file with raw bytes, creating parent directories
    fn write_bytes(&self, path: &Path, contents: &[u8]) -> Result<()>;

    /// Remove a file, returning whether it existed
    fn remove_file(&self, path: &Path) -> Result<bool>;

    fn path_exists(&self, path: &Path) -> bool;

    fn kernel_release(&self) -> String;

    fn is_root(&self) -> bool;

    /// Attached USB devices as `vvvv:pppp` ids
    fn usb_devices(&self) -> Vec<String>;

    /// Names of currently loaded kernel modules
    fn loaded_modules(&self) -> Vec<String>;

    /// Current value of a loaded module's parameter
    fn module_parameter(&self, module: &str, param: &str) -> Option<String>;

    fn load_module(&self, request: &ModuleLoad) -> Result<()>;

    /// Unload a module; unloading a module that is not loaded succeeds
    fn unload_module(&self, module: &str) -> Result<()>;

    fn service_status(&self, name: &str) -> ServiceStatus;

    fn install_service_unit(&self, unit: &ServiceUnit) -> Result<()>;

    fn remove_service_unit(&self, name: &str) -> Result<()>;

    fn set_service_enabled(&self, name: &str, enabled: bool) -> Result<()>;

    fn set_service_running(&self, name: &str, running: bool) -> Result<()>;

    /// Run an external command, killing it at its timeout
    fn run(&self, command: &HostCommand) -> Result<CommandOutput>;

    // ------------------------------------------------------------------------
    // Provided helpers
    // ------------------------------------------------------------------------

    fn is_module_loaded(&self, module: &str) -> bool {
        self.loaded_modules().iter().any(|m| m == module)
    }

    fn has_usb_device(&self, id: &str) -> bool {
        self.usb_devices().iter().any(|d| d.eq_ignore_ascii_case(id))
    }

    /// Run a command and fail on non-zero exit
    fn run_checked(&self, command: &HostCommand) -> Result<CommandOutput> {
        self.run(command)?.check(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_display_and_argv() {
        let cmd = HostCommand::from_argv(&["make", "-C", "/usr/src/fp_xiaomi"]);
        assert_eq!(cmd.program, "make");
        assert_eq!(cmd.to_string(), "make -C /usr/src/fp_xiaomi");
        assert_eq!(cmd.timeout, timing::COMMAND_TIMEOUT);
    }

    #[test]
    fn test_check_maps_failure() {
        let cmd = HostCommand::new("rmmod").arg("fp_xiaomi");
        let err = CommandOutput::failed(1, "Module in use\n").check(&cmd).unwrap_err();
        match err {
            FpError::CommandFailed { command, status, stderr } => {
                assert_eq!(command, "rmmod fp_xiaomi");
                assert_eq!(status, "exit 1");
                assert_eq!(stderr, "Module in use");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
