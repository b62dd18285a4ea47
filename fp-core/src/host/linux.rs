//! [`Host`] implementation for the running Linux system

use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::thread;
use std::time::Instant;

use regex::Regex;
use tracing::{debug, trace, warn};

use super::{CommandOutput, Host, HostCommand, ModuleLoad, ServiceStatus, ServiceUnit};
use crate::constants::{paths, timing};
use crate::error::{FpError, Result};
use crate::service::{self, detect_init_system, InitSystem};

/// The machine fpinstall runs on
#[derive(Debug, Clone)]
pub struct LinuxHost {
    init: InitSystem,
}

impl LinuxHost {
    /// Connect to the running system, detecting its init system
    pub fn new() -> Self {
        let mut host = Self { init: InitSystem::Unknown };
        host.init = detect_init_system(&host);
        debug!("Detected init system: {}", host.init);
        host
    }

    pub fn with_init(init: InitSystem) -> Self {
        Self { init }
    }

    pub fn init_system(&self) -> InitSystem {
        self.init
    }

    fn quiet_success(&self, argv: &[&str]) -> bool {
        self.run(&HostCommand::from_argv(argv))
            .map(|o| o.success)
            .unwrap_or(false)
    }

    fn stdout_of(&self, argv: &[&str]) -> Option<String> {
        self.run(&HostCommand::from_argv(argv))
            .ok()
            .filter(|o| o.success)
            .map(|o| o.stdout)
    }

    fn usb_from_sysfs(&self) -> Option<Vec<String>> {
        let entries = fs::read_dir(paths::SYS_USB_DEVICES).ok()?;
        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let dir = entry.path();
            let vendor = fs::read_to_string(dir.join("idVendor"));
            let product = fs::read_to_string(dir.join("idProduct"));
            if let (Ok(vendor), Ok(product)) = (vendor, product) {
                ids.push(format!("{}:{}", vendor.trim(), product.trim()).to_ascii_lowercase());
            }
        }
        Some(ids)
    }

    fn usb_from_lsusb(&self) -> Vec<String> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(r"ID ([0-9a-fA-F]{4}):([0-9a-fA-F]{4})").expect("valid lsusb regex"));

        self.stdout_of(&["lsusb"])
            .map(|out| {
                re.captures_iter(&out)
                    .map(|c| format!("{}:{}", &c[1], &c[2]).to_ascii_lowercase())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for LinuxHost {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn write_err(path: &Path) -> impl FnOnce(io::Error) -> FpError + '_ {
    move |source| match source.kind() {
        io::ErrorKind::PermissionDenied => FpError::PermissionDenied(format!("cannot write {}", path.display())),
        _ => FpError::FileWrite {
            path: path.to_path_buf(),
            source,
        },
    }
}

impl Host for LinuxHost {
    fn read_file(&self, path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FpError::FileRead {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err(parent))?;
        }
        fs::write(path, contents).map_err(write_err(path))
    }

    fn read_bytes(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FpError::FileRead {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    fn write_bytes(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err(parent))?;
        }
        fs::write(path, contents).map_err(write_err(path))
    }

    fn remove_file(&self, path: &Path) -> Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(write_err(path)(e)),
        }
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn kernel_release(&self) -> String {
        fs::read_to_string(paths::PROC_OSRELEASE)
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }

    fn is_root(&self) -> bool {
        // SAFETY: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() == 0 }
    }

    fn usb_devices(&self) -> Vec<String> {
        match self.usb_from_sysfs() {
            Some(ids) if !ids.is_empty() => ids,
            _ => self.usb_from_lsusb(),
        }
    }

    fn loaded_modules(&self) -> Vec<String> {
        fs::read_to_string(paths::PROC_MODULES)
            .map(|content| {
                content
                    .lines()
                    .filter_map(|line| line.split_whitespace().next())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn module_parameter(&self, module: &str, param: &str) -> Option<String> {
        let path = Path::new(paths::SYS_MODULE)
            .join(module)
            .join("parameters")
            .join(param);
        fs::read_to_string(path).ok().map(|v| v.trim().to_string())
    }

    fn load_module(&self, request: &ModuleLoad) -> Result<()> {
        let command = match &request.object {
            Some(object) => HostCommand::new("insmod").arg(object.to_string_lossy()),
            None => HostCommand::new("modprobe").arg(request.name.as_str()),
        };
        let command = command
            .args(request.params.iter().map(|(k, v)| format!("{}={}", k, v)))
            .timeout(timing::MODULE_TIMEOUT);

        self.run_checked(&command)?;
        debug!("Loaded module {}", request.name);
        Ok(())
    }

    fn unload_module(&self, module: &str) -> Result<()> {
        if !self.is_module_loaded(module) {
            trace!("Module {} not loaded, nothing to unload", module);
            return Ok(());
        }
        self.run_checked(&HostCommand::new("rmmod").arg(module).timeout(timing::MODULE_TIMEOUT))?;
        debug!("Unloaded module {}", module);
        Ok(())
    }

    fn service_status(&self, name: &str) -> ServiceStatus {
        match self.init {
            InitSystem::Systemd => {
                let unit = format!("{}.service", name);
                let installed = self
                    .stdout_of(&["systemctl", "show", "-p", "LoadState", "--value", &unit])
                    .map(|s| s.trim() == "loaded")
                    .unwrap_or(false);
                ServiceStatus {
                    installed,
                    active: installed && self.quiet_success(&["systemctl", "is-active", "--quiet", &unit]),
                    enabled: installed && self.quiet_success(&["systemctl", "is-enabled", "--quiet", &unit]),
                }
            }
            InitSystem::OpenRC => {
                let installed = Path::new("/etc/init.d").join(name).exists();
                let enabled = installed
                    && self
                        .stdout_of(&["rc-update", "show", "default"])
                        .map(|out| {
                            out.lines()
                                .any(|l| l.split('|').next().map(str::trim) == Some(name))
                        })
                        .unwrap_or(false);
                ServiceStatus {
                    installed,
                    active: installed && self.quiet_success(&["rc-service", name, "status"]),
                    enabled,
                }
            }
            InitSystem::Runit => {
                let installed = Path::new("/etc/sv").join(name).join("run").exists();
                ServiceStatus {
                    installed,
                    active: installed
                        && self
                            .stdout_of(&["sv", "status", name])
                            .map(|s| s.contains("run:"))
                            .unwrap_or(false),
                    enabled: Path::new("/var/service").join(name).exists(),
                }
            }
            InitSystem::Unknown => ServiceStatus::default(),
        }
    }

    fn install_service_unit(&self, unit: &ServiceUnit) -> Result<()> {
        for file in service::unit_files(self.init, unit)? {
            self.write_file(&file.path, &file.contents)?;
            if file.executable {
                fs::set_permissions(&file.path, fs::Permissions::from_mode(0o755))
                    .map_err(write_err(&file.path))?;
            }
            debug!("Wrote service file {:?}", file.path);
        }

        if let Some(reload) = service::reload_command(self.init) {
            self.run_checked(&reload)?;
        }
        Ok(())
    }

    fn remove_service_unit(&self, name: &str) -> Result<()> {
        let status = self.service_status(name);
        if status.active {
            self.set_service_running(name, false)?;
        }
        if status.enabled {
            self.set_service_enabled(name, false)?;
        }

        let paths: Vec<PathBuf> = service::unit_paths(self.init, name);
        for path in &paths {
            self.remove_file(path)?;
        }
        if self.init == InitSystem::Runit {
            if let Some(dir) = paths.first().and_then(|p| p.parent()) {
                let _ = fs::remove_dir(dir);
            }
        }

        if let Some(reload) = service::reload_command(self.init) {
            self.run_checked(&reload)?;
        }
        Ok(())
    }

    fn set_service_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let command = service::enable_command(self.init, name, enabled)?;
        self.run(&command)?
            .check(&command)
            .map_err(|e| FpError::service(format!("{}: {}", name, e)))?;
        Ok(())
    }

    fn set_service_running(&self, name: &str, running: bool) -> Result<()> {
        let command = service::run_state_command(self.init, name, running)?;
        self.run(&command)?
            .check(&command)
            .map_err(|e| FpError::service(format!("{}: {}", name, e)))?;
        Ok(())
    }

    fn run(&self, command: &HostCommand) -> Result<CommandOutput> {
        trace!("Running {}", command);
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| FpError::CommandFailed {
                command: command.to_string(),
                status: "not started".to_string(),
                stderr: e.to_string(),
            })?;

        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let deadline = Instant::now() + command.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                warn!("{} exceeded {:?}, killing it", command, command.timeout);
                let _ = child.kill();
                let _ = child.wait();
                return Err(FpError::Timeout {
                    command: command.to_string(),
                    seconds: command.timeout.as_secs(),
                });
            }
            thread::sleep(timing::COMMAND_POLL);
        };

        Ok(CommandOutput {
            success: status.success(),
            status: status.code(),
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_run_captures_output() {
        let host = LinuxHost::with_init(InitSystem::Unknown);
        let out = host.run(&HostCommand::from_argv(&["sh", "-c", "echo hi; echo err >&2"])).unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[test]
    fn test_run_kills_on_timeout() {
        let host = LinuxHost::with_init(InitSystem::Unknown);
        let cmd = HostCommand::from_argv(&["sleep", "5"]).timeout(Duration::from_millis(200));
        let started = Instant::now();
        match host.run(&cmd) {
            Err(FpError::Timeout { command, .. }) => assert_eq!(command, "sleep 5"),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_missing_program_is_command_failure() {
        let host = LinuxHost::with_init(InitSystem::Unknown);
        let err = host.run(&HostCommand::new("/nonexistent/fpinstall-test")).unwrap_err();
        assert_eq!(err.kind(), "command_failed");
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let host = LinuxHost::with_init(InitSystem::Unknown);
        let path = dir.path().join("etc/udev/rules.d/60-test.rules");

        assert!(host.read_file(&path).unwrap().is_none());
        host.write_file(&path, "rule\n").unwrap();
        assert_eq!(host.read_file(&path).unwrap().as_deref(), Some("rule\n"));
        assert!(host.remove_file(&path).unwrap());
        assert!(!host.remove_file(&path).unwrap());

        let lib = dir.path().join("usr/local/lib/libfp_xiaomi.so");
        host.write_bytes(&lib, &[0x7f, b'E', b'L', b'F', 0xff]).unwrap();
        assert_eq!(host.read_bytes(&lib).unwrap(), Some(vec![0x7f, b'E', b'L', b'F', 0xff]));
    }

    #[test]
    fn test_denied_write_maps_to_permission_error() {
        let path = Path::new("/etc/udev/rules.d/60-fp-xiaomi.rules");
        let err = write_err(path)(io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(err.kind(), "permission_denied");
        assert!(err.to_string().contains("60-fp-xiaomi.rules"));

        let err = write_err(path)(io::Error::from(io::ErrorKind::InvalidData));
        assert_eq!(err.kind(), "io_error");
    }

    #[test]
    fn test_unknown_init_has_no_services() {
        let host = LinuxHost::with_init(InitSystem::Unknown);
        assert_eq!(host.service_status("fprintd"), ServiceStatus::default());
        assert!(host.set_service_running("fprintd", true).is_err());
    }
}
