//! Huge-pages plug-in: pre-allocates huge pages for guests whose domain XML
//! requests `<memoryBacking><hugepages/></memoryBacking>`.
//!
//! Allocation forces transparent huge pages off first so the kernel isn't
//! fighting itself over page sizes, then writes the requested
//! `nr_hugepages` count and polls until the kernel actually honors it (or
//! the configured wait elapses, whichever comes first).

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::{MemoryError, Result};
use crate::model::{GuestConfig, Target};
use crate::plugin::Plugin;
use crate::sys::SystemTunables;

const HUGEPAGES_1G_KB: u64 = 1_048_576;
const HUGEPAGES_2M_KB: u64 = 2_048;
const TRANSPARENT_HUGEPAGE_PATH: &str = "/sys/kernel/mm/transparent_hugepage/enabled";

fn page_size_kb(bytes: u64) -> u64 {
    if bytes.div_ceil(1024) >= HUGEPAGES_1G_KB {
        HUGEPAGES_1G_KB
    } else {
        HUGEPAGES_2M_KB
    }
}

/// Required page count for a `bytes`-sized request at `page_kb` page size:
/// `ceil(ceil(bytes/1024)/page_kb)`. Rounds up twice, once converting to
/// KiB and once dividing into pages, so a request never ends up with less
/// memory than asked for.
fn required_pages(bytes: u64, page_kb: u64) -> u64 {
    bytes.div_ceil(1024).div_ceil(page_kb)
}

fn nr_hugepages_path(page_kb: u64) -> String {
    format!("/sys/kernel/mm/hugepages/hugepages-{page_kb}kB/nr_hugepages")
}

/// Allocates and frees huge pages for running guests, tracking the pending
/// deallocation size per guest so `release` doesn't need the domain XML to
/// still describe the same memory size it did at `prepare` time.
pub struct HugePagesPlugin {
    sys: SystemTunables,
    wait_duration: Duration,
    allocated: std::collections::HashMap<String, (u64, u64)>,
    transparent_hugepage_saved: bool,
}

impl HugePagesPlugin {
    /// Builds the plug-in rooted at `root` (`/` in production), polling up
    /// to `wait_duration` for an allocation to land.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, wait_duration: Duration) -> Self {
        Self {
            sys: SystemTunables::new(root),
            wait_duration,
            allocated: std::collections::HashMap::new(),
            transparent_hugepage_saved: false,
        }
    }

    fn sync(&self) {
        let _ = std::process::Command::new("sync").status();
    }

    fn allocated_count(&self, page_kb: u64) -> std::result::Result<u64, MemoryError> {
        let path = nr_hugepages_path(page_kb);
        self.sys
            .read(&path)
            .map_err(|source| MemoryError::Read { path: path.into(), source })?
            .parse()
            .map_err(|_| MemoryError::Read {
                path: path.into(),
                source: std::io::Error::other("non-numeric nr_hugepages"),
            })
    }

    fn allocate(&mut self, bytes: u64) -> std::result::Result<(), MemoryError> {
        let page_kb = page_size_kb(bytes);
        let pages = required_pages(bytes, page_kb);
        let path = nr_hugepages_path(page_kb);

        if !self.transparent_hugepage_saved {
            self.sys
                .set(TRANSPARENT_HUGEPAGE_PATH, "never")
                .map_err(|source| MemoryError::Write { path: TRANSPARENT_HUGEPAGE_PATH.into(), source })?;
            self.transparent_hugepage_saved = true;
        }

        let current = self.allocated_count(page_kb)?;
        let target = current + pages;
        info!(pages, page_kb, "allocating new hugepages");
        self.sys
            .write(&path, &target.to_string())
            .map_err(|source| MemoryError::Write { path: path.into(), source })?;

        let start = Instant::now();
        loop {
            if self.allocated_count(page_kb)? >= target {
                return Ok(());
            }
            if start.elapsed() >= self.wait_duration {
                return Err(MemoryError::AllocationTimeout {
                    requested: target,
                    actual: self.allocated_count(page_kb)?,
                    page_kb,
                });
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    fn deallocate(&mut self, page_kb: u64, pages: u64) {
        let path = nr_hugepages_path(page_kb);
        let current = match self.allocated_count(page_kb) {
            Ok(current) => current,
            Err(err) => {
                warn!(error = %err, "failed to read current hugepage count, skipping deallocation");
                return;
            }
        };
        let target = current.saturating_sub(pages);
        if let Err(err) = self.sys.write(&path, &target.to_string()) {
            warn!(path, error = %err, "failed to deallocate hugepages");
        }

        if self.allocated.is_empty() && self.transparent_hugepage_saved {
            if let Err(err) = self.sys.restore(TRANSPARENT_HUGEPAGE_PATH) {
                warn!(error = %err, "failed to restore transparent hugepage mode");
            }
            self.transparent_hugepage_saved = false;
        }
    }
}

impl Plugin for HugePagesPlugin {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn prepare(&mut self, guest: &GuestConfig) -> Result<()> {
        if !guest.hugepages_backed {
            return Ok(());
        }
        self.sync();
        self.sys
            .write("/proc/sys/vm/drop_caches", "3")
            .map_err(|source| MemoryError::Write { path: "/proc/sys/vm/drop_caches".into(), source })?;
        self.sys
            .write("/proc/sys/vm/compact_memory", "1")
            .map_err(|source| MemoryError::Write { path: "/proc/sys/vm/compact_memory".into(), source })?;

        let page_kb = page_size_kb(guest.memory_bytes);
        let pages = required_pages(guest.memory_bytes, page_kb);
        self.allocate(guest.memory_bytes)?;
        self.allocated.insert(guest.name.clone(), (page_kb, pages));
        Ok(())
    }

    fn release(&mut self, guest: &GuestConfig) {
        if !guest.hugepages_backed {
            return;
        }
        let Some((page_kb, pages)) = self.allocated.remove(&guest.name) else {
            return;
        };
        self.deallocate(page_kb, pages);
    }

    fn target_changed(&mut self, _target: &Target) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(dir: &std::path::Path, page_kb: u64) {
        let pages_dir = dir.join(format!("sys/kernel/mm/hugepages/hugepages-{page_kb}kB"));
        std::fs::create_dir_all(&pages_dir).unwrap();
        std::fs::write(pages_dir.join("nr_hugepages"), "0").unwrap();

        let thp_dir = dir.join("sys/kernel/mm/transparent_hugepage");
        std::fs::create_dir_all(&thp_dir).unwrap();
        std::fs::write(thp_dir.join("enabled"), "always").unwrap();

        for path in ["proc/sys/vm/drop_caches", "proc/sys/vm/compact_memory"] {
            let full = dir.join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(&full, "0").unwrap();
        }
    }

    fn hugepages_guest(name: &str, bytes: u64) -> GuestConfig {
        let mut guest = GuestConfig::empty(name.to_string());
        guest.memory_bytes = bytes;
        guest.hugepages_backed = true;
        guest
    }

    #[test]
    fn page_size_selection_picks_1g_pages_at_the_gib_threshold() {
        assert_eq!(page_size_kb(4 * 1024 * 1024 * 1024), HUGEPAGES_1G_KB);
        assert_eq!(required_pages(4 * 1024 * 1024 * 1024, HUGEPAGES_1G_KB), 4);
        assert_eq!(page_size_kb(512 * 1024 * 1024), HUGEPAGES_2M_KB);
    }

    #[test]
    fn allocation_writes_requested_page_count_and_forces_thp_off() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path(), HUGEPAGES_1G_KB);
        let mut plugin = HugePagesPlugin::new(dir.path(), Duration::from_millis(200));

        let guest = hugepages_guest("win10", 4 * 1024 * 1024 * 1024);
        plugin.prepare(&guest).unwrap();

        let nr_path = dir.path().join(format!("sys/kernel/mm/hugepages/hugepages-{HUGEPAGES_1G_KB}kB/nr_hugepages"));
        assert_eq!(std::fs::read_to_string(&nr_path).unwrap(), "4");
        let thp_path = dir.path().join("sys/kernel/mm/transparent_hugepage/enabled");
        assert_eq!(std::fs::read_to_string(&thp_path).unwrap(), "never");

        plugin.release(&guest);
        assert_eq!(std::fs::read_to_string(&nr_path).unwrap(), "0");
        assert_eq!(std::fs::read_to_string(&thp_path).unwrap(), "always");
    }

    #[test]
    fn allocation_timeout_message_names_requested_and_actual() {
        let err = MemoryError::AllocationTimeout { requested: 4, actual: 2, page_kb: HUGEPAGES_1G_KB };
        let message = err.to_string();
        assert!(message.contains('4'));
        assert!(message.contains('2'));
    }

    #[test]
    fn guest_without_hugepages_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path(), HUGEPAGES_1G_KB);
        let mut plugin = HugePagesPlugin::new(dir.path(), Duration::from_millis(200));
        let guest = GuestConfig::empty("idle".to_string());
        plugin.prepare(&guest).unwrap();
        let nr_path = dir.path().join(format!("sys/kernel/mm/hugepages/hugepages-{HUGEPAGES_1G_KB}kB/nr_hugepages"));
        assert_eq!(std::fs::read_to_string(&nr_path).unwrap(), "0");
    }
}
