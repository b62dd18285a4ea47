//! Versioned fallback state record and backup snapshot storage
//!
//! `state.json` holds the lifecycle state plus metadata of the current
//! snapshot; the snapshot contents live as plain text in the backup
//! directory so they can be inspected and restored by hand.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::constants::backup::TRACKED_FILES;
use crate::constants::fallback::STATE_VERSION;
use crate::data::persistence::{read_optional, read_optional_bytes, remove_optional, write_atomic, StateLayout};
use crate::error::{FpError, Result};
use crate::fallback::{Strategy, Verdict};
use crate::host::ServiceStatus;

/// Lifecycle of the fallback manager on this host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "lowercase")]
pub enum FallbackState {
    Uninstalled,
    Installed,
    Active { strategy: Strategy },
    Tested { strategy: Strategy, verdict: Verdict },
    Restored,
}

impl FallbackState {
    /// Strategy currently in effect, if any
    pub fn active_strategy(&self) -> Option<Strategy> {
        match self {
            FallbackState::Active { strategy } | FallbackState::Tested { strategy, .. } => Some(*strategy),
            _ => None,
        }
    }

    pub fn is_installed(&self) -> bool {
        !matches!(self, FallbackState::Uninstalled)
    }

    pub fn phase(&self) -> &'static str {
        match self {
            FallbackState::Uninstalled => "uninstalled",
            FallbackState::Installed => "installed",
            FallbackState::Active { .. } => "active",
            FallbackState::Tested { .. } => "tested",
            FallbackState::Restored => "restored",
        }
    }
}

impl std::fmt::Display for FallbackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FallbackState::Active { strategy } => write!(f, "active({})", strategy),
            FallbackState::Tested { strategy, verdict } => write!(f, "tested({}, {})", strategy, verdict),
            other => f.write_str(other.phase()),
        }
    }
}

/// Metadata of the current snapshot kept in the state record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub timestamp: DateTime<Utc>,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub version: u32,
    pub state: FallbackState,
    #[serde(default)]
    pub snapshot: Option<SnapshotMeta>,
    pub updated_at: DateTime<Utc>,
}

impl Default for StateRecord {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            state: FallbackState::Uninstalled,
            snapshot: None,
            updated_at: Utc::now(),
        }
    }
}

/// Loaded module names with the parameters recorded for each
pub type ModuleList = (Vec<String>, BTreeMap<String, BTreeMap<String, String>>);

/// Host state captured before a fallback strategy is activated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSnapshot {
    pub timestamp: DateTime<Utc>,
    pub loaded_modules: Vec<String>,
    /// Non-default driver parameters per loaded module
    pub module_params: BTreeMap<String, BTreeMap<String, String>>,
    /// Copy of the device activation rules, `None` if none were installed
    pub rules: Option<String>,
    pub services: BTreeMap<String, ServiceStatus>,
    /// Prior contents of the files a strategy may replace; absent keys were
    /// absent on the host
    pub strategy_files: BTreeMap<PathBuf, Vec<u8>>,
}

impl BackupSnapshot {
    /// One module per line, followed by its `key=value` parameters
    pub fn render_modules(&self) -> String {
        let mut out = String::new();
        for module in &self.loaded_modules {
            out.push_str(module);
            if let Some(params) = self.module_params.get(module) {
                for (key, value) in params {
                    out.push_str(&format!(" {}={}", key, value));
                }
            }
            out.push('\n');
        }
        out
    }

    pub fn render_services(&self) -> String {
        let mut out = String::new();
        for (name, status) in &self.services {
            out.push_str(&format!(
                "[{}]\ninstalled={}\nactive={}\nenabled={}\n\n",
                name, status.installed, status.active, status.enabled
            ));
        }
        out
    }

    pub fn parse_modules(text: &str) -> Result<ModuleList> {
        let mut names = Vec::new();
        let mut params = BTreeMap::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let mut fields = line.split_whitespace();
            let Some(name) = fields.next() else { continue };
            let mut module_params = BTreeMap::new();
            for field in fields {
                let (key, value) = field
                    .split_once('=')
                    .ok_or_else(|| FpError::CorruptBackup(format!("bad module parameter {:?}", field)))?;
                module_params.insert(key.to_string(), value.to_string());
            }
            if !module_params.is_empty() {
                params.insert(name.to_string(), module_params);
            }
            names.push(name.to_string());
        }
        Ok((names, params))
    }

    pub fn parse_services(text: &str) -> Result<BTreeMap<String, ServiceStatus>> {
        let mut services = BTreeMap::new();
        let mut current: Option<(String, ServiceStatus)> = None;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                if let Some((name, status)) = current.take() {
                    services.insert(name, status);
                }
                current = Some((name.to_string(), ServiceStatus::default()));
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| FpError::CorruptBackup(format!("bad service line {:?}", line)))?;
            let (_, status) = current
                .as_mut()
                .ok_or_else(|| FpError::CorruptBackup(format!("service key outside section: {:?}", line)))?;
            let value = value.trim() == "true";
            match key.trim() {
                "installed" => status.installed = value,
                "active" => status.active = value,
                "enabled" => status.enabled = value,
                other => return Err(FpError::CorruptBackup(format!("unknown service key {:?}", other))),
            }
        }

        if let Some((name, status)) = current {
            services.insert(name, status);
        }
        Ok(services)
    }

    /// SHA-256 over the serialized snapshot files
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.render_modules().as_bytes());
        hasher.update([0u8]);
        match &self.rules {
            Some(rules) => {
                hasher.update(b"rules:");
                hasher.update(rules.as_bytes());
            }
            None => hasher.update(b"rules:none"),
        }
        hasher.update([0u8]);
        hasher.update(self.render_services().as_bytes());
        for (path, _) in TRACKED_FILES {
            hasher.update([0u8]);
            hasher.update(path.as_bytes());
            match self.strategy_files.get(Path::new(path)) {
                Some(contents) => {
                    hasher.update(b":");
                    hasher.update(contents);
                }
                None => hasher.update(b":none"),
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Read/write access to the durable fallback state
#[derive(Debug, Clone)]
pub struct StateStore {
    layout: StateLayout,
}

impl StateStore {
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    /// Load the state record; a missing file means the manager is uninstalled
    pub fn load_record(&self) -> Result<StateRecord> {
        let Some(contents) = read_optional(&self.layout.state_file)? else {
            return Ok(StateRecord::default());
        };

        let record: StateRecord = serde_json::from_str(&contents)?;
        if record.version > STATE_VERSION {
            return Err(FpError::config(format!(
                "state file version {} is newer than supported version {}",
                record.version, STATE_VERSION
            )));
        }
        Ok(record)
    }

    pub fn save_record(&self, record: &mut StateRecord) -> Result<()> {
        record.version = STATE_VERSION;
        record.updated_at = Utc::now();
        let json = serde_json::to_string_pretty(record)?;
        write_atomic(&self.layout.state_file, &json)
    }

    /// Persist a snapshot, replacing the previous one
    pub fn save_snapshot(&self, snapshot: &BackupSnapshot) -> Result<SnapshotMeta> {
        write_atomic(&self.layout.backup_modules(), &snapshot.render_modules())?;
        match &snapshot.rules {
            Some(rules) => write_atomic(&self.layout.backup_rules(), rules)?,
            None => remove_optional(&self.layout.backup_rules())?,
        }
        write_atomic(&self.layout.backup_services(), &snapshot.render_services())?;
        for (path, name) in TRACKED_FILES {
            let copy = self.layout.backup_tracked(name);
            match snapshot.strategy_files.get(Path::new(path)) {
                Some(contents) => write_atomic(&copy, contents)?,
                None => remove_optional(&copy)?,
            }
        }

        let meta = SnapshotMeta {
            timestamp: snapshot.timestamp,
            digest: snapshot.digest(),
        };
        info!(timestamp = %meta.timestamp, "Saved backup snapshot");
        Ok(meta)
    }

    /// Read the snapshot described by `meta`, verifying its digest
    pub fn load_snapshot(&self, meta: &SnapshotMeta) -> Result<BackupSnapshot> {
        let modules = read_optional(&self.layout.backup_modules())?
            .ok_or_else(|| FpError::CorruptBackup("modules.txt is missing".to_string()))?;
        let services = read_optional(&self.layout.backup_services())?
            .ok_or_else(|| FpError::CorruptBackup("services.txt is missing".to_string()))?;
        let rules = read_optional(&self.layout.backup_rules())?;
        let (loaded_modules, module_params) = BackupSnapshot::parse_modules(&modules)?;

        let mut strategy_files = BTreeMap::new();
        for (path, name) in TRACKED_FILES {
            if let Some(contents) = read_optional_bytes(&self.layout.backup_tracked(name))? {
                strategy_files.insert(PathBuf::from(path), contents);
            }
        }

        let snapshot = BackupSnapshot {
            timestamp: meta.timestamp,
            loaded_modules,
            module_params,
            rules,
            services: BackupSnapshot::parse_services(&services)?,
            strategy_files,
        };

        if snapshot.digest() != meta.digest {
            return Err(FpError::CorruptBackup(format!(
                "digest mismatch in {}",
                self.layout.backup_dir.display()
            )));
        }
        debug!("Loaded backup snapshot from {}", meta.timestamp);
        Ok(snapshot)
    }

    pub fn clear_snapshot(&self) -> Result<()> {
        for (_, name) in TRACKED_FILES {
            remove_optional(&self.layout.backup_tracked(name))?;
        }
        remove_optional(&self.layout.backup_modules())?;
        remove_optional(&self.layout.backup_rules())?;
        remove_optional(&self.layout.backup_services())
    }

    /// Remove every durable artifact (uninstall)
    pub fn remove_all(&self) -> Result<()> {
        self.clear_snapshot()?;
        remove_optional(&self.layout.fallback_config)?;
        remove_optional(&self.layout.state_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_snapshot() -> BackupSnapshot {
        let mut services = BTreeMap::new();
        services.insert(
            "fprintd".to_string(),
            ServiceStatus { installed: true, active: true, enabled: false },
        );
        services.insert("fp-xiaomi-userspace".to_string(), ServiceStatus::default());
        let mut module_params = BTreeMap::new();
        module_params.insert(
            "fp_xiaomi".to_string(),
            BTreeMap::from([("debug".to_string(), "1".to_string())]),
        );
        BackupSnapshot {
            timestamp: Utc::now(),
            loaded_modules: vec!["fp_xiaomi".into(), "usbcore".into()],
            module_params,
            rules: Some("SUBSYSTEM==\"usb\"\n".into()),
            services,
            strategy_files: BTreeMap::from([(
                PathBuf::from("/etc/udev/rules.d/61-fp-xiaomi-generic.rules"),
                b"# admin rules\n".to_vec(),
            )]),
        }
    }

    #[test]
    fn test_missing_state_is_uninstalled() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(StateLayout::new(dir.path()));
        assert_eq!(store.load_record().unwrap().state, FallbackState::Uninstalled);
    }

    #[test]
    fn test_record_persists_tagged_state() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(StateLayout::new(dir.path()));

        let mut record = StateRecord {
            state: FallbackState::Tested {
                strategy: Strategy::UserSpaceOnly,
                verdict: Verdict::Partial,
            },
            ..StateRecord::default()
        };
        store.save_record(&mut record).unwrap();

        let text = std::fs::read_to_string(&store.layout().state_file).unwrap();
        assert!(text.contains("\"phase\": \"tested\""));
        assert!(text.contains("\"strategy\": \"user-space-only\""));
        assert_eq!(store.load_record().unwrap().state, record.state);
    }

    #[test]
    fn test_newer_state_version_rejected() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(StateLayout::new(dir.path()));
        let mut record = StateRecord::default();
        store.save_record(&mut record).unwrap();

        let path = &store.layout().state_file;
        let text = std::fs::read_to_string(path).unwrap().replace("\"version\": 1", "\"version\": 99");
        std::fs::write(path, text).unwrap();
        assert!(store.load_record().is_err());
    }

    #[test]
    fn test_snapshot_files_and_digest() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(StateLayout::new(dir.path()));
        let snapshot = sample_snapshot();

        let meta = store.save_snapshot(&snapshot).unwrap();
        let services = std::fs::read_to_string(store.layout().backup_services()).unwrap();
        assert!(services.contains("[fprintd]\ninstalled=true\nactive=true\nenabled=false"));
        let modules = std::fs::read_to_string(store.layout().backup_modules()).unwrap();
        assert_eq!(modules, "fp_xiaomi debug=1\nusbcore\n");
        assert_eq!(
            std::fs::read(store.layout().backup_tracked("generic-rules.backup")).unwrap(),
            b"# admin rules\n"
        );

        assert_eq!(store.load_snapshot(&meta).unwrap(), snapshot);

        std::fs::write(store.layout().backup_modules(), "tampered\n").unwrap();
        assert!(matches!(store.load_snapshot(&meta), Err(FpError::CorruptBackup(_))));
    }

    #[test]
    fn test_snapshot_without_rules_removes_stale_copy() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(StateLayout::new(dir.path()));
        store.save_snapshot(&sample_snapshot()).unwrap();

        let snapshot = BackupSnapshot { rules: None, ..sample_snapshot() };
        let meta = store.save_snapshot(&snapshot).unwrap();
        assert!(!store.layout().backup_rules().exists());
        assert_eq!(store.load_snapshot(&meta).unwrap().rules, None);
    }

    #[test]
    fn test_absent_strategy_files_stay_absent() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(StateLayout::new(dir.path()));
        store.save_snapshot(&sample_snapshot()).unwrap();

        let snapshot = BackupSnapshot {
            strategy_files: BTreeMap::new(),
            ..sample_snapshot()
        };
        let meta = store.save_snapshot(&snapshot).unwrap();
        assert!(!store.layout().backup_tracked("generic-rules.backup").exists());
        assert!(store.load_snapshot(&meta).unwrap().strategy_files.is_empty());

        store.clear_snapshot().unwrap();
        assert!(!store.layout().backup_modules().exists());
    }

    #[test]
    fn test_malformed_module_parameter_is_corrupt() {
        assert!(matches!(
            BackupSnapshot::parse_modules("fp_xiaomi debug\n"),
            Err(FpError::CorruptBackup(_))
        ));
    }
}
