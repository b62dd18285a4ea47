//! On-disk layout of the durable fallback state and the primitives used to
//! write it safely.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::constants::{backup, paths};
use crate::error::{FpError, Result};

/// Locations of everything the fallback manager persists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    pub root: PathBuf,
    pub installer_config: PathBuf,
    pub fallback_config: PathBuf,
    pub state_file: PathBuf,
    pub backup_dir: PathBuf,
    pub lock_file: PathBuf,
}

impl StateLayout {
    /// Layout rooted at `root` (`/` on a real system)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            installer_config: root.join(paths::INSTALLER_CONFIG),
            fallback_config: root.join(paths::FALLBACK_CONFIG),
            state_file: root.join(paths::STATE_FILE),
            backup_dir: root.join(paths::BACKUP_DIR),
            lock_file: root.join(paths::LOCK_FILE),
            root,
        }
    }

    pub fn system() -> Self {
        Self::new("/")
    }

    pub fn backup_modules(&self) -> PathBuf {
        self.backup_dir.join(backup::MODULES_FILE)
    }

    pub fn backup_rules(&self) -> PathBuf {
        self.backup_dir.join(backup::RULES_FILE)
    }

    pub fn backup_services(&self) -> PathBuf {
        self.backup_dir.join(backup::SERVICES_FILE)
    }

    /// Backup copy of one of [`backup::TRACKED_FILES`]
    pub fn backup_tracked(&self, name: &str) -> PathBuf {
        self.backup_dir.join(name)
    }
}

impl Default for StateLayout {
    fn default() -> Self {
        Self::system()
    }
}

/// Read a file, `None` when it does not exist
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FpError::FileRead {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Read a file as raw bytes, `None` when it does not exist
pub fn read_optional_bytes(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FpError::FileRead {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Remove a file if present
pub fn remove_optional(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FpError::FileWrite {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Write `contents` to `path` atomically: temp file, fsync, rename
pub fn write_atomic(path: &Path, contents: impl AsRef<[u8]>) -> Result<()> {
    let write_err = |source| FpError::FileWrite {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "state".to_string());
    let temp_path = path.with_file_name(format!(".{}.tmp", file_name));

    let mut file = File::create(&temp_path).map_err(write_err)?;
    file.write_all(contents.as_ref()).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);

    fs::rename(&temp_path, path).map_err(write_err)?;
    debug!("Wrote {:?}", path);
    Ok(())
}

/// Exclusive advisory lock serializing writers of the fallback state.
///
/// Released when dropped.
#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
}

impl StateLock {
    /// Take the lock without blocking; fails with [`FpError::LockHeld`] if
    /// another invocation holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| FpError::FileWrite {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|source| FpError::FileWrite {
                path: path.to_path_buf(),
                source,
            })?;

        // SAFETY: flock only operates on the descriptor, which stays open for
        // as long as `file` lives.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(FpError::LockHeld(path.to_path_buf()));
            }
            return Err(FpError::Io(err));
        }

        debug!("Acquired state lock {:?}", path);
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor is still owned by `self.file`.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_is_rooted() {
        let layout = StateLayout::new("/tmp/root");
        assert_eq!(layout.fallback_config, PathBuf::from("/tmp/root/etc/fpinstall/fallback.conf"));
        assert_eq!(layout.backup_rules(), PathBuf::from("/tmp/root/var/lib/fpinstall/backup/rules.backup"));
        assert_eq!(StateLayout::system().lock_file, PathBuf::from("/run/fpinstall.lock"));
    }

    #[test]
    fn test_write_atomic_creates_parents_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/state.json");

        write_atomic(&path, "one").unwrap();
        write_atomic(&path, "two").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        assert!(!dir.path().join("a/b/.state.json.tmp").exists());
    }

    #[test]
    fn test_read_and_remove_optional() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing");
        assert!(read_optional(&path).unwrap().is_none());
        assert!(read_optional_bytes(&path).unwrap().is_none());
        remove_optional(&path).unwrap();

        write_atomic(&path, [0x7fu8, b'E', b'L', b'F']).unwrap();
        assert_eq!(read_optional_bytes(&path).unwrap().as_deref(), Some(&b"\x7fELF"[..]));
    }

    #[test]
    fn test_second_lock_is_rejected_until_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run/fpinstall.lock");

        let first = StateLock::acquire(&path).unwrap();
        match StateLock::acquire(&path) {
            Err(FpError::LockHeld(p)) => assert_eq!(p, path),
            other => panic!("expected LockHeld, got {:?}", other.map(|_| ())),
        }

        drop(first);
        assert!(StateLock::acquire(&path).is_ok());
    }
}
