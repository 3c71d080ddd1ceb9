//! An injectable root for the procfs/sysfs tunables the plug-ins touch.
//!
//! Production code reads and writes absolute paths under `/`. Tests
//! construct a [`SystemTunables`] rooted at a `tempfile` directory and
//! populate it with a fake sysfs tree, the same "injectable base path"
//! pattern used elsewhere in this workspace for on-disk state.
//!
//! Each plug-in owns its own `SystemTunables` with an explicit lifecycle,
//! rather than sharing one process-wide global, so save/restore state never
//! leaks between unrelated plug-ins or test runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Reads and writes tunables rooted at a configurable base path, and
/// remembers prior values so callers can restore them later.
#[derive(Debug, Default)]
pub struct SystemTunables {
    root: PathBuf,
    saved: HashMap<PathBuf, String>,
}

impl SystemTunables {
    /// Creates a new tunables accessor rooted at `root` (`/` in production).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            saved: HashMap::new(),
        }
    }

    /// Resolves a tunable path (given relative to the filesystem root, e.g.
    /// `/proc/sys/vm/watchdog`) against this instance's root.
    fn resolve(&self, path: &str) -> PathBuf {
        let relative = path.strip_prefix('/').unwrap_or(path);
        self.root.join(relative)
    }

    /// Reads the current contents of `path`, trimmed.
    ///
    /// # Errors
    ///
    /// Propagates the underlying I/O error.
    pub fn read(&self, path: &str) -> std::io::Result<String> {
        let resolved = self.resolve(path);
        Ok(std::fs::read_to_string(resolved)?.trim().to_string())
    }

    /// Writes `value` to `path`.
    ///
    /// # Errors
    ///
    /// Propagates the underlying I/O error.
    pub fn write(&self, path: &str, value: &str) -> std::io::Result<()> {
        std::fs::write(self.resolve(path), value)
    }

    /// Reads and remembers the current value of `path`, then writes `value`
    /// to it. The remembered value can later be restored with
    /// [`SystemTunables::restore`].
    ///
    /// # Errors
    ///
    /// Propagates the underlying I/O error from either the read or the
    /// write.
    pub fn set(&mut self, path: &str, value: &str) -> std::io::Result<()> {
        let previous = self.read(path)?;
        self.saved.insert(PathBuf::from(path), previous);
        self.write(path, value)
    }

    /// Restores `path` to the value captured by a prior [`SystemTunables::set`]
    /// call. A no-op if `path` was never captured.
    ///
    /// # Errors
    ///
    /// Propagates the underlying I/O error.
    pub fn restore(&mut self, path: &str) -> std::io::Result<()> {
        if let Some(value) = self.saved.remove(&PathBuf::from(path)) {
            self.write(path, &value)?;
        }
        Ok(())
    }

    /// The root this instance resolves paths against.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_restore_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proc/sys/kernel/watchdog");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "1").unwrap();

        let mut sys = SystemTunables::new(dir.path());
        sys.set("/proc/sys/kernel/watchdog", "0").unwrap();
        assert_eq!(sys.read("/proc/sys/kernel/watchdog").unwrap(), "0");

        sys.restore("/proc/sys/kernel/watchdog").unwrap();
        assert_eq!(sys.read("/proc/sys/kernel/watchdog").unwrap(), "1");
    }

    #[test]
    fn restore_without_set_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut sys = SystemTunables::new(dir.path());
        assert!(sys.restore("/proc/sys/kernel/watchdog").is_ok());
    }
}
