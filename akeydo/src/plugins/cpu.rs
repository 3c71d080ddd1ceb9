//! CPU shielding plug-in: keeps host kernel threads off the CPUs pinned to
//! running guests via a control-group v2 cpuset partition.
//!
//! The host cpuset is always `all_cpus - vm_cpus`, with CPU 0 kept in the
//! host set unconditionally since several kernel paths assume it stays
//! schedulable. The partition is written into the three cgroups that
//! contain almost all host-side processes: `init.scope`, `user.slice`, and
//! `system.slice`.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use tracing::warn;

use crate::error::{CpuError, Result};
use crate::model::{GuestConfig, Target};
use crate::plugin::Plugin;
use crate::sys::SystemTunables;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const HOST_CGROUPS: [&str; 3] = ["init.scope", "user.slice", "system.slice"];

/// System tunables this plug-in shields the host from noisy-neighbor
/// scheduling effects with, captured only while at least one guest is
/// shielded and restored once none remain.
const AMBIENT_TUNABLES: [(&str, &str); 3] = [
    ("/proc/sys/vm/stat_interval", "120"),
    ("/proc/sys/kernel/watchdog", "0"),
    ("/sys/bus/workqueue/devices/writeback/numa", "1"),
];

/// Restricts host cgroups to CPUs not pinned to any running guest.
pub struct CpuShieldPlugin {
    sys: SystemTunables,
    all_cpus: BTreeSet<u32>,
    shielded: HashMap<String, BTreeSet<u32>>,
}

impl CpuShieldPlugin {
    /// Builds the plug-in rooted at `root` (`/` in production) with
    /// `total_cpus` CPUs available to shield. Enables the `cpuset`
    /// controller under the unified hierarchy; a failure here is logged,
    /// not fatal, since the first `prepare` call will fail loudly anyway if
    /// the hierarchy is unusable.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, total_cpus: u32) -> Self {
        let sys = SystemTunables::new(root);
        if let Err(err) = sys.write(&format!("{CGROUP_ROOT}/cgroup.subtree_control"), "+cpuset") {
            warn!(error = %err, "failed to enable cpuset controller");
        }
        Self {
            sys,
            all_cpus: (0..total_cpus).collect(),
            shielded: HashMap::new(),
        }
    }

    fn vm_cpus(&self) -> BTreeSet<u32> {
        self.shielded.values().flatten().copied().collect()
    }

    fn write_host_cpus(&self) -> std::result::Result<(), CpuError> {
        let mut host_cpus = &self.all_cpus - &self.vm_cpus();
        host_cpus.insert(0);
        let config = host_cpus.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
        for cgroup in HOST_CGROUPS {
            let path = format!("{CGROUP_ROOT}/{cgroup}/cpuset.cpus");
            self.sys.write(&path, &config).map_err(|source| CpuError::Write { path: path.into(), source })?;
        }
        Ok(())
    }
}

impl Plugin for CpuShieldPlugin {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn prepare(&mut self, guest: &GuestConfig) -> Result<()> {
        if guest.pinned_cpus.is_empty() {
            return Ok(());
        }
        if self.shielded.is_empty() {
            for (path, value) in AMBIENT_TUNABLES {
                self.sys.set(path, value).map_err(|source| CpuError::Write { path: path.into(), source })?;
            }
        }
        self.shielded.insert(guest.name.clone(), guest.pinned_cpus.clone());
        self.write_host_cpus()?;
        Ok(())
    }

    fn release(&mut self, guest: &GuestConfig) {
        if self.shielded.remove(&guest.name).is_none() {
            return;
        }
        if let Err(err) = self.write_host_cpus() {
            warn!(guest = %guest.name, error = %err, "failed to widen host cpuset on release");
        }
        if self.shielded.is_empty() {
            for (path, _) in AMBIENT_TUNABLES {
                if let Err(err) = self.sys.restore(path) {
                    warn!(path, error = %err, "failed to restore tunable");
                }
            }
        }
    }

    fn target_changed(&mut self, _target: &Target) {}
}
