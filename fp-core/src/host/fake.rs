//! In-memory [`Host`] used by tests

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::{CommandOutput, Host, HostCommand, ModuleLoad, ServiceStatus, ServiceUnit};
use crate::constants::{device, module_params};
use crate::error::{FpError, Result};

#[derive(Debug)]
struct FakeState {
    files: BTreeMap<PathBuf, String>,
    modules: BTreeMap<String, BTreeMap<String, String>>,
    services: BTreeMap<String, ServiceStatus>,
    units: BTreeMap<String, ServiceUnit>,
    usb: BTreeSet<String>,
    kernel_release: String,
    root: bool,
    commands: Vec<String>,
    failing: BTreeMap<String, String>,
    hanging: BTreeSet<String>,
    missing: BTreeSet<String>,
    outputs: BTreeMap<String, String>,
    failing_loads: BTreeSet<String>,
    node_on_load: bool,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            files: BTreeMap::new(),
            modules: BTreeMap::new(),
            services: BTreeMap::new(),
            units: BTreeMap::new(),
            usb: BTreeSet::new(),
            kernel_release: "6.5.0-fake".to_string(),
            root: true,
            commands: Vec::new(),
            failing: BTreeMap::new(),
            hanging: BTreeSet::new(),
            missing: BTreeSet::new(),
            outputs: BTreeMap::new(),
            failing_loads: BTreeSet::new(),
            node_on_load: true,
        }
    }
}

/// Find the entry whose key is the program name or a prefix of the full
/// command line. Longest key wins.
fn lookup<'a, V>(map: &'a BTreeMap<String, V>, command: &HostCommand) -> Option<&'a V> {
    let line = command.to_string();
    map.iter()
        .filter(|(key, _)| **key == command.program || line.starts_with(key.as_str()))
        .max_by_key(|(key, _)| key.len())
        .map(|(_, v)| v)
}

/// Simulated machine. Loading the primary driver while the reader is
/// attached creates its device node, like udev would.
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<FakeState>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------------
    // Builders
    // ------------------------------------------------------------------------

    pub fn with_file(self, path: impl Into<PathBuf>, contents: &str) -> Self {
        self.state.lock().files.insert(path.into(), contents.to_string());
        self
    }

    pub fn with_device(self, id: &str) -> Self {
        self.state.lock().usb.insert(id.to_ascii_lowercase());
        self
    }

    pub fn with_module(self, name: &str) -> Self {
        self.state.lock().modules.insert(name.to_string(), BTreeMap::new());
        self
    }

    pub fn with_service(self, name: &str, status: ServiceStatus) -> Self {
        self.state.lock().services.insert(name.to_string(), status);
        self
    }

    pub fn with_kernel_release(self, release: &str) -> Self {
        self.state.lock().kernel_release = release.to_string();
        self
    }

    pub fn as_user(self) -> Self {
        self.state.lock().root = false;
        self
    }

    /// Make every command matching `pattern` exit 1 with `stderr`
    pub fn fail_command(self, pattern: &str, stderr: &str) -> Self {
        self.state.lock().failing.insert(pattern.to_string(), stderr.to_string());
        self
    }

    /// Make every command matching `pattern` run into its timeout
    pub fn hang_command(self, pattern: &str) -> Self {
        self.state.lock().hanging.insert(pattern.to_string());
        self
    }

    /// Make every command matching `pattern` fail to start
    pub fn missing_program(self, pattern: &str) -> Self {
        self.state.lock().missing.insert(pattern.to_string());
        self
    }

    pub fn fail_module_load(self, name: &str) -> Self {
        self.state.lock().failing_loads.insert(name.to_string());
        self
    }

    /// Loading the driver does not produce a device node
    pub fn without_device_node(self) -> Self {
        self.state.lock().node_on_load = false;
        self
    }

    /// Set stdout of commands matching `pattern`
    pub fn set_output(&self, pattern: &str, stdout: &str) {
        self.state.lock().outputs.insert(pattern.to_string(), stdout.to_string());
    }

    pub fn clear_failure(&self, pattern: &str) {
        self.state.lock().failing.remove(pattern);
    }

    pub fn detach_device(&self, id: &str) {
        self.state.lock().usb.remove(&id.to_ascii_lowercase());
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn file(&self, path: impl AsRef<Path>) -> Option<String> {
        self.state.lock().files.get(path.as_ref()).cloned()
    }

    pub fn modules(&self) -> Vec<String> {
        self.state.lock().modules.keys().cloned().collect()
    }

    pub fn module_params(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.state.lock().modules.get(name).cloned()
    }

    /// Every command run so far, rendered as command lines
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub fn units(&self) -> BTreeMap<String, ServiceUnit> {
        self.state.lock().units.clone()
    }

    pub fn services(&self) -> BTreeMap<String, ServiceStatus> {
        self.state.lock().services.clone()
    }
}

impl FakeState {
    /// Mutations of system files need root, like on a real host
    fn require_root(&self, what: impl std::fmt::Display) -> Result<()> {
        if self.root {
            Ok(())
        } else {
            Err(FpError::PermissionDenied(format!("cannot modify {}", what)))
        }
    }
}

impl Host for FakeHost {
    fn read_file(&self, path: &Path) -> Result<Option<String>> {
        Ok(self.state.lock().files.get(path).cloned())
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.require_root(path.display())?;
        state.files.insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn read_bytes(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        Ok(self.state.lock().files.get(path).map(|c| c.as_bytes().to_vec()))
    }

    fn write_bytes(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.require_root(path.display())?;
        state
            .files
            .insert(path.to_path_buf(), String::from_utf8_lossy(contents).into_owned());
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.files.contains_key(path) {
            return Ok(false);
        }
        state.require_root(path.display())?;
        Ok(state.files.remove(path).is_some())
    }

    fn path_exists(&self, path: &Path) -> bool {
        let state = self.state.lock();
        state.files.contains_key(path) || state.files.keys().any(|p| p.starts_with(path))
    }

    fn kernel_release(&self) -> String {
        self.state.lock().kernel_release.clone()
    }

    fn is_root(&self) -> bool {
        self.state.lock().root
    }

    fn usb_devices(&self) -> Vec<String> {
        self.state.lock().usb.iter().cloned().collect()
    }

    fn loaded_modules(&self) -> Vec<String> {
        self.modules()
    }

    fn module_parameter(&self, module: &str, param: &str) -> Option<String> {
        self.state.lock().modules.get(module)?.get(param).cloned()
    }

    fn load_module(&self, request: &ModuleLoad) -> Result<()> {
        let mut state = self.state.lock();
        let program = if request.object.is_some() { "insmod" } else { "modprobe" };
        state.commands.push(format!("{} {}", program, request.name));
        state.require_root(&request.name)?;

        if state.failing_loads.contains(&request.name) {
            return Err(FpError::CommandFailed {
                command: format!("{} {}", program, request.name),
                status: "exit 1".to_string(),
                stderr: "Invalid module format".to_string(),
            });
        }
        if let Some(object) = &request.object {
            if !state.files.contains_key(object) {
                return Err(FpError::CommandFailed {
                    command: format!("insmod {}", object.display()),
                    status: "exit 1".to_string(),
                    stderr: format!("could not load module {}: No such file or directory", object.display()),
                });
            }
        }

        let params: BTreeMap<String, String> = request.params.iter().cloned().collect();
        let minimal = params.get(module_params::MINIMAL_MODE).map(String::as_str) == Some("1");
        state.modules.insert(request.name.clone(), params);

        if request.name == device::MODULE_NAME && state.node_on_load && state.usb.contains(device::USB_ID) {
            let caps = if minimal { "0x0003" } else { "0x003f" };
            state.files.insert(PathBuf::from(device::DEVICE_NODE), String::new());
            state.files.insert(PathBuf::from(device::CAPABILITIES_ATTR), caps.to_string());
        }
        Ok(())
    }

    fn unload_module(&self, module: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.modules.contains_key(module) {
            state.require_root(module)?;
        }
        if state.modules.remove(module).is_some() {
            state.commands.push(format!("rmmod {}", module));
        }
        if module == device::MODULE_NAME {
            state.files.remove(Path::new(device::DEVICE_NODE));
            state.files.remove(Path::new(device::CAPABILITIES_ATTR));
        }
        Ok(())
    }

    fn service_status(&self, name: &str) -> ServiceStatus {
        self.state.lock().services.get(name).copied().unwrap_or_default()
    }

    fn install_service_unit(&self, unit: &ServiceUnit) -> Result<()> {
        let mut state = self.state.lock();
        state.units.insert(unit.name.clone(), unit.clone());
        state.services.entry(unit.name.clone()).or_default().installed = true;
        Ok(())
    }

    fn remove_service_unit(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.units.remove(name);
        state.services.remove(name);
        Ok(())
    }

    fn set_service_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut state = self.state.lock();
        match state.services.get_mut(name) {
            Some(status) if status.installed => {
                status.enabled = enabled;
                Ok(())
            }
            _ if !enabled => Ok(()),
            _ => Err(FpError::service(format!("{} is not installed", name))),
        }
    }

    fn set_service_running(&self, name: &str, running: bool) -> Result<()> {
        let mut state = self.state.lock();
        match state.services.get_mut(name) {
            Some(status) if status.installed => {
                status.active = running;
                Ok(())
            }
            _ if !running => Ok(()),
            _ => Err(FpError::service(format!("{} is not installed", name))),
        }
    }

    fn run(&self, command: &HostCommand) -> Result<CommandOutput> {
        let mut state = self.state.lock();
        state.commands.push(command.to_string());

        let line = command.to_string();
        let matches = |k: &String| *k == command.program || line.starts_with(k.as_str());
        if state.missing.iter().any(matches) {
            return Err(FpError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: No such file or directory", command.program),
            )));
        }
        if state.hanging.iter().any(|k| *k == command.program || line.starts_with(k.as_str())) {
            return Err(FpError::Timeout {
                command: command.to_string(),
                seconds: command.timeout.as_secs(),
            });
        }
        if let Some(stderr) = lookup(&state.failing, command) {
            return Ok(CommandOutput::failed(1, stderr.clone()));
        }
        Ok(CommandOutput::ok(lookup(&state.outputs, command).cloned().unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_load_creates_node_only_with_device() {
        let host = FakeHost::new().with_device(device::USB_ID);
        host.load_module(&ModuleLoad::by_name(device::MODULE_NAME)).unwrap();
        assert!(host.path_exists(Path::new(device::DEVICE_NODE)));
        assert_eq!(host.file(device::CAPABILITIES_ATTR).as_deref(), Some("0x003f"));

        host.unload_module(device::MODULE_NAME).unwrap();
        assert!(!host.path_exists(Path::new(device::DEVICE_NODE)));

        let bare = FakeHost::new();
        bare.load_module(&ModuleLoad::by_name(device::MODULE_NAME)).unwrap();
        assert!(bare.is_module_loaded(device::MODULE_NAME));
        assert!(!bare.path_exists(Path::new(device::DEVICE_NODE)));
    }

    #[test]
    fn test_minimal_mode_reduces_capabilities() {
        let host = FakeHost::new().with_device(device::USB_ID);
        let load = ModuleLoad::by_name(device::MODULE_NAME).param(module_params::MINIMAL_MODE, "1");
        host.load_module(&load).unwrap();
        assert_eq!(host.file(device::CAPABILITIES_ATTR).as_deref(), Some("0x0003"));
        assert_eq!(host.module_parameter(device::MODULE_NAME, module_params::MINIMAL_MODE).as_deref(), Some("1"));
    }

    #[test]
    fn test_insmod_requires_object_file() {
        let host = FakeHost::new();
        let err = host
            .load_module(&ModuleLoad::from_object("fp_xiaomi", "/usr/src/fp_xiaomi/fp_xiaomi.ko"))
            .unwrap_err();
        assert_eq!(err.kind(), "command_failed");
    }

    #[test]
    fn test_command_matching() {
        let host = FakeHost::new()
            .fail_command("apt-get install", "E: Unable to locate package")
            .hang_command("make");
        host.set_output("dpkg-query", "install ok installed");

        assert!(host.run(&HostCommand::from_argv(&["apt-get", "update"])).unwrap().success);
        assert!(!host.run(&HostCommand::from_argv(&["apt-get", "install", "-y", "gcc"])).unwrap().success);
        assert!(matches!(
            host.run(&HostCommand::from_argv(&["make", "-C", "/x"])),
            Err(FpError::Timeout { .. })
        ));
        let out = host.run(&HostCommand::from_argv(&["dpkg-query", "-W", "gcc"])).unwrap();
        assert_eq!(out.stdout, "install ok installed");
        assert_eq!(host.commands().len(), 4);
    }

    #[test]
    fn test_unprivileged_host_refuses_mutation() {
        let host = FakeHost::new().with_module(device::MODULE_NAME).as_user();
        let err = host.write_file(Path::new("/etc/udev/rules.d/61-x.rules"), "x").unwrap_err();
        assert_eq!(err.kind(), "permission_denied");
        assert!(err.remediation().is_some());
        assert!(matches!(
            host.unload_module(device::MODULE_NAME),
            Err(FpError::PermissionDenied(_))
        ));
        assert!(host.is_module_loaded(device::MODULE_NAME));
        assert!(!host.remove_file(Path::new("/nonexistent")).unwrap());
    }

    #[test]
    fn test_binary_files_round_trip() {
        let host = FakeHost::new();
        let path = Path::new("/usr/local/lib/libfp_xiaomi.so");
        assert!(host.read_bytes(path).unwrap().is_none());
        host.write_bytes(path, b"\x7fELF").unwrap();
        assert_eq!(host.read_bytes(path).unwrap().as_deref(), Some(&b"\x7fELF"[..]));
    }

    #[test]
    fn test_missing_program_fails_to_start() {
        let host = FakeHost::new().missing_program("make");
        let err = host.run(&HostCommand::from_argv(&["make", "-C", "/x"])).unwrap_err();
        assert_eq!(err.kind(), "io_error");
    }

    #[test]
    fn test_services_require_install() {
        let host = FakeHost::new();
        assert!(host.set_service_running("fprintd", true).is_err());
        assert!(host.set_service_running("fprintd", false).is_ok());

        host.install_service_unit(&ServiceUnit {
            name: "fp-xiaomi-userspace".into(),
            description: "d".into(),
            exec: "/bin/true".into(),
        })
        .unwrap();
        host.set_service_enabled("fp-xiaomi-userspace", true).unwrap();
        assert!(host.service_status("fp-xiaomi-userspace").enabled);

        host.remove_service_unit("fp-xiaomi-userspace").unwrap();
        assert_eq!(host.service_status("fp-xiaomi-userspace"), ServiceStatus::default());
    }
}
