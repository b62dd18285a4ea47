//! Build & load of the external kernel driver
//!
//! The driver itself is an external artifact: a source tree with a Makefile
//! producing `<module>.ko`. This module builds it, loads it and verifies the
//! result against live kernel state.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::constants::{device, module_params, timing};
use crate::data::Completion;
use crate::error::{FpError, Result};
use crate::host::{Host, HostCommand, ModuleLoad};
use crate::system::SystemProfile;

/// Location and identity of the driver artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverArtifact {
    pub source_dir: PathBuf,
    pub module_name: String,
    pub object_name: String,
}

impl DriverArtifact {
    pub fn new(source_dir: impl Into<PathBuf>, module_name: &str) -> Self {
        Self {
            source_dir: source_dir.into(),
            module_name: module_name.to_string(),
            object_name: format!("{}.ko", module_name),
        }
    }

    pub fn makefile(&self) -> PathBuf {
        self.source_dir.join("Makefile")
    }

    pub fn object_path(&self) -> PathBuf {
        self.source_dir.join(&self.object_name)
    }

    pub fn source_present(&self, host: &dyn Host) -> bool {
        host.path_exists(&self.makefile())
    }

    pub fn object_present(&self, host: &dyn Host) -> bool {
        host.path_exists(&self.object_path())
    }

    pub fn is_loaded(&self, host: &dyn Host) -> bool {
        host.is_module_loaded(&self.module_name)
    }

    /// Compile the module. Failures and timeouts are build errors.
    pub fn build(&self, host: &dyn Host, timeout: Duration) -> Result<()> {
        if !self.source_present(host) {
            return Err(FpError::build(format!(
                "driver source not found at {}",
                self.source_dir.display()
            )));
        }

        let command = HostCommand::new("make")
            .arg("-C")
            .arg(self.source_dir.to_string_lossy())
            .timeout(timeout);

        info!("Building {} in {:?}", self.module_name, self.source_dir);
        match host.run_checked(&command) {
            Ok(_) => {}
            Err(FpError::Timeout { seconds, .. }) => {
                return Err(FpError::build(format!("make timed out after {}s", seconds)))
            }
            Err(FpError::CommandFailed { stderr, .. }) => {
                return Err(FpError::build(last_lines(&stderr, 5)))
            }
            Err(e) => return Err(FpError::build(format!("make could not run: {}", e))),
        }

        if !self.object_present(host) {
            return Err(FpError::build(format!(
                "build finished but {} was not produced",
                self.object_path().display()
            )));
        }
        Ok(())
    }

    /// Load the built object with the given parameters
    pub fn load(&self, host: &dyn Host, params: &[(&str, &str)]) -> Result<()> {
        let mut request = ModuleLoad::from_object(&self.module_name, self.object_path());
        for (key, value) in params {
            request = request.param(*key, *value);
        }

        host.load_module(&request).map_err(|e| match e {
            FpError::CommandFailed { stderr, .. } => FpError::load(stderr),
            FpError::Timeout { seconds, .. } => FpError::load(format!("insmod timed out after {}s", seconds)),
            other => other,
        })
    }

    /// Unload (if loaded) and load again with `params`
    pub fn reload(&self, host: &dyn Host, params: &[(&str, &str)]) -> Result<()> {
        host.unload_module(&self.module_name)
            .map_err(|e| FpError::load(format!("could not unload {}: {}", self.module_name, e)))?;
        self.load(host, params)
    }

    /// Check live kernel state: module listed, and the device node present
    /// when the reader is attached.
    pub fn verify(&self, host: &dyn Host, expect_node: bool) -> Result<()> {
        if !self.is_loaded(host) {
            return Err(FpError::load(format!("{} is not listed in /proc/modules", self.module_name)));
        }

        if expect_node && !wait_for_node(host) {
            return Err(FpError::load(format!(
                "{} loaded but {} did not appear",
                self.module_name,
                device::DEVICE_NODE
            )));
        }
        Ok(())
    }
}

fn wait_for_node(host: &dyn Host) -> bool {
    let node = Path::new(device::DEVICE_NODE);
    if host.path_exists(node) {
        return true;
    }
    thread::sleep(timing::DEVICE_SETTLE);
    host.path_exists(node)
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    let tail = lines[start..].join("\n");
    if tail.is_empty() {
        "make exited with an error".to_string()
    } else {
        tail
    }
}

/// The Build & Load stage.
///
/// Already loaded and verified is a no-op. If verification fails after this
/// call loaded the module, it is unloaded again before returning.
pub fn build_and_load(
    host: &dyn Host,
    artifact: &DriverArtifact,
    profile: &SystemProfile,
    debug_mode: bool,
    build_timeout: Duration,
) -> Result<Completion> {
    let expect_node = profile.has_target_device();

    if artifact.is_loaded(host) && artifact.verify(host, expect_node).is_ok() {
        debug!("{} already loaded and verified", artifact.module_name);
        return Ok(Completion::success(format!("{} already loaded", artifact.module_name)));
    }

    artifact.build(host, build_timeout)?;

    let params: &[(&str, &str)] = if debug_mode { &[(module_params::DEBUG, "1")] } else { &[] };
    artifact.reload(host, params)?;

    if let Err(e) = artifact.verify(host, expect_node) {
        warn!("Verification failed, unloading {}: {}", artifact.module_name, e);
        if let Err(unload) = host.unload_module(&artifact.module_name) {
            warn!("Rollback unload failed: {}", unload);
        }
        return Err(e);
    }

    let message = if expect_node {
        format!("{} built, loaded and {} present", artifact.module_name, device::DEVICE_NODE)
    } else {
        format!("{} built and loaded (no device attached)", artifact.module_name)
    };
    info!("{}", message);
    Ok(Completion::success(message))
}
