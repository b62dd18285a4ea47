//! Installer settings and fallback configuration
//!
//! - `installer.json`: JSON, every field defaulted, missing file means defaults
//! - `fallback.conf`: flat `key=value` text, format kept stable for other tools

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::{device, fallback, paths, timing};
use crate::data::persistence::{read_optional, write_atomic, StateLayout};
use crate::driver::DriverArtifact;
use crate::error::{FpError, Result};
use crate::fallback::Strategy;

// ============================================================================
// Installer settings
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    /// Source tree of the external driver artifact
    pub source_dir: PathBuf,
    /// Kernel module built from `source_dir`
    pub module_name: String,
    /// Supervised process registered by the user-space strategy
    pub userspace_daemon: String,
    /// Command line run by the fallback monitor hook
    pub monitor_exec: String,
    pub build_timeout_secs: u64,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from(paths::DEFAULT_SOURCE_DIR),
            module_name: device::MODULE_NAME.to_string(),
            userspace_daemon: "/usr/local/libexec/fp-xiaomi-userspace --foreground".to_string(),
            monitor_exec: "/usr/local/bin/fpinstall fallback monitor".to_string(),
            build_timeout_secs: timing::BUILD_TIMEOUT.as_secs(),
        }
    }
}

impl InstallerConfig {
    pub fn artifact(&self) -> DriverArtifact {
        DriverArtifact::new(&self.source_dir, &self.module_name)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }
}

/// Load installer settings, falling back to defaults when the file is absent
pub fn load_installer_config(layout: &StateLayout) -> Result<InstallerConfig> {
    match read_optional(&layout.installer_config)? {
        Some(contents) => {
            let config = serde_json::from_str(&contents).map_err(|e| {
                FpError::config(format!(
                    "Failed to parse {}: {}",
                    layout.installer_config.display(),
                    e
                ))
            })?;
            Ok(config)
        }
        None => {
            debug!("No installer config at {:?}, using defaults", layout.installer_config);
            Ok(InstallerConfig::default())
        }
    }
}

pub fn save_installer_config(layout: &StateLayout, config: &InstallerConfig) -> Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    write_atomic(&layout.installer_config, &json)
}

// ============================================================================
// Fallback configuration
// ============================================================================

/// Durable fallback settings stored as `key=value` lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub default_strategy: Strategy,
    pub auto_fallback: bool,
    pub timeout_secs: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_strategy: Strategy::GenericLibrary,
            auto_fallback: true,
            timeout_secs: fallback::DEFAULT_TIMEOUT_SECS,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(FpError::config(format!("{}: expected a boolean, got {:?}", key, value))),
    }
}

impl FallbackConfig {
    pub fn parse(text: &str) -> Result<Self> {
        let mut config = Self::default();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                FpError::config(format!("line {}: expected key=value, got {:?}", lineno + 1, line))
            })?;
            let key = key.trim();
            let value = value.trim().trim_matches('"');

            match key {
                "enabled" => config.enabled = parse_bool(key, value)?,
                "default_strategy" => {
                    config.default_strategy = value
                        .parse()
                        .map_err(|_| FpError::config(format!("default_strategy: unknown strategy {:?}", value)))?
                }
                "auto_fallback" => config.auto_fallback = parse_bool(key, value)?,
                "timeout" => {
                    config.timeout_secs = value
                        .parse()
                        .map_err(|_| FpError::config(format!("timeout: expected seconds, got {:?}", value)))?
                }
                other => warn!("Ignoring unknown fallback config key {:?}", other),
            }
        }

        Ok(config)
    }

    pub fn render(&self) -> String {
        format!(
            "# fpinstall fallback configuration\n\
             enabled={}\n\
             default_strategy={}\n\
             auto_fallback={}\n\
             timeout={}\n",
            self.enabled, self.default_strategy, self.auto_fallback, self.timeout_secs
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Load the configuration, `None` when the manager is not installed
    pub fn load(layout: &StateLayout) -> Result<Option<Self>> {
        read_optional(&layout.fallback_config)?
            .map(|text| Self::parse(&text))
            .transpose()
    }

    pub fn save(&self, layout: &StateLayout) -> Result<()> {
        write_atomic(&layout.fallback_config, &self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fallback_config_render_parse() {
        let config = FallbackConfig {
            enabled: false,
            default_strategy: Strategy::MinimalDriver,
            auto_fallback: false,
            timeout_secs: 90,
        };
        let text = config.render();
        assert!(text.contains("default_strategy=minimal-driver\n"));
        assert_eq!(FallbackConfig::parse(&text).unwrap(), config);
    }

    #[test]
    fn test_fallback_config_tolerates_comments_and_unknown_keys() {
        let text = "# comment\n\nenabled = yes\nfuture_key=1\ndefault_strategy=\"compat\"\ntimeout=5\n";
        let config = FallbackConfig::parse(text).unwrap();
        assert!(config.enabled);
        assert_eq!(config.default_strategy, Strategy::CompatibilityMode);
        assert_eq!(config.timeout_secs, 5);
        assert!(config.auto_fallback);
    }

    #[test]
    fn test_fallback_config_rejects_bad_values() {
        assert!(FallbackConfig::parse("enabled=maybe").is_err());
        assert!(FallbackConfig::parse("timeout=soon").is_err());
        assert!(FallbackConfig::parse("default_strategy=magic").is_err());
        assert!(FallbackConfig::parse("no equals sign").is_err());
    }

    #[test]
    fn test_installer_config_defaults_when_missing() {
        let dir = TempDir::new().unwrap();
        let layout = StateLayout::new(dir.path());
        let config = load_installer_config(&layout).unwrap();
        assert_eq!(config, InstallerConfig::default());

        let custom = InstallerConfig {
            source_dir: PathBuf::from("/opt/fp"),
            ..InstallerConfig::default()
        };
        save_installer_config(&layout, &custom).unwrap();
        assert_eq!(load_installer_config(&layout).unwrap(), custom);
    }

    #[test]
    fn test_installer_config_partial_json() {
        let dir = TempDir::new().unwrap();
        let layout = StateLayout::new(dir.path());
        write_atomic(&layout.installer_config, r#"{"build_timeout_secs": 5}"#).unwrap();
        let config = load_installer_config(&layout).unwrap();
        assert_eq!(config.build_timeout(), Duration::from_secs(5));
        assert_eq!(config.module_name, "fp_xiaomi");
    }
}
