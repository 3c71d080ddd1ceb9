//! GPU passthrough plug-in: detaches and re-attaches the boot GPU for
//! passthrough, and declares the detaching guest the effective host.
//!
//! `prepare` walks: stop the display manager, unbind vtconsoles, unbind the
//! EFI framebuffer if the boot GPU owns it, detach matching libvirt node
//! devices, unload the native driver, load the VFIO stack. `release` runs
//! the exact reverse. Per-vendor driver shims cover the module lists each
//! vendor's driver actually needs unloaded/reloaded.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{GpuError, Result};
use crate::model::{GuestConfig, PciAddress, Target};
use crate::orchestrator::HostHandle;
use crate::plugin::Plugin;
use crate::sys::SystemTunables;

const VTCONSOLE_DIR: &str = "/sys/class/vtconsole";
const FRAMEBUFFER_DRIVER_DIR: &str = "/sys/bus/platform/drivers/efi-framebuffer";
const FRAMEBUFFER_DEVICE: &str = "efi-framebuffer.0";

/// A per-vendor driver shim, selected by the boot GPU's `uevent` `DRIVER=`
/// value. Unknown or missing drivers fall back to [`BaseDriver`], which
/// still runs the full vtconsole/framebuffer/VFIO sequence — only the
/// kernel module load/unload step is vendor-specific.
trait DriverShim {
    /// Loads this GPU's native driver modules back in, on release.
    fn load(&self) -> Result<()> {
        Ok(())
    }

    /// Unloads this GPU's native driver modules, on prepare.
    fn unload(&self) -> Result<()> {
        Ok(())
    }

    /// Whether the framebuffer should be rebound/unbound for this driver.
    /// `nouveau` opts out: its kernel driver manages its own framebuffer.
    fn manages_framebuffer(&self) -> bool {
        true
    }
}

struct BaseDriver;
impl DriverShim for BaseDriver {}

/// Reverses the module list for unload, matching `for module in
/// reversed(self._MODULES): subprocess.call(["rmmod", module])`.
fn modprobe_all(modules: &[&str]) -> Result<()> {
    for module in modules {
        run_best_effort("modprobe", &[module]);
    }
    Ok(())
}

fn rmmod_all(modules: &[&str]) -> Result<()> {
    for module in modules.iter().rev() {
        run_best_effort("rmmod", &[module]);
    }
    Ok(())
}

struct NvidiaDriver;
impl DriverShim for NvidiaDriver {
    fn load(&self) -> Result<()> {
        modprobe_all(&["nvidia", "nvidia_modeset", "nvidia_drm", "nvidia_uvm"])?;
        if PathBuf::from("/usr/bin/nvidia-xconfig").is_file() {
            run_best_effort("/usr/bin/nvidia-xconfig", &["--query-gpu-info"]);
        }
        Ok(())
    }

    fn unload(&self) -> Result<()> {
        rmmod_all(&["nvidia", "nvidia_modeset", "nvidia_drm", "nvidia_uvm"])
    }
}

struct AmdgpuDriver;
impl DriverShim for AmdgpuDriver {
    fn load(&self) -> Result<()> {
        modprobe_all(&["amdgpu"])
    }

    fn unload(&self) -> Result<()> {
        rmmod_all(&["amdgpu"])
    }
}

struct NouveauDriver;
impl DriverShim for NouveauDriver {
    // Inherits the default no-op `load`/`unload`: nouveau's kernel driver
    // doesn't need module reload, only the framebuffer override below.

    fn manages_framebuffer(&self) -> bool {
        false
    }
}

fn driver_for(name: &str) -> Box<dyn DriverShim> {
    match name {
        "nvidia" => Box::new(NvidiaDriver),
        "amdgpu" => Box::new(AmdgpuDriver),
        "nouveau" => Box::new(NouveauDriver),
        other => {
            warn!(driver = other, "no driver shim for this DRIVER, falling back to the base shim");
            Box::new(BaseDriver)
        }
    }
}

/// Best-effort subprocess invocation: a missing tool (`systemctl` on a
/// non-systemd host, say) is tolerated rather than treated as fatal, since
/// the GPU handoff should proceed regardless of which helper tools exist.
fn run_best_effort(command: &str, args: &[&str]) {
    match std::process::Command::new(command).args(args).status() {
        Ok(status) if !status.success() => {
            debug!(command, ?args, %status, "subprocess exited non-zero");
        }
        Ok(_) => {}
        Err(err) => {
            debug!(command, ?args, error = %err, "failed to spawn subprocess");
        }
    }
}

fn stop_display_manager() {
    debug!("stopping the display manager");
    run_best_effort("systemctl", &["stop", "display-manager"]);
    run_best_effort("killall", &["gdm-x-session"]);
    run_best_effort("killall", &["gdm-wayland-session"]);
}

fn start_display_manager() {
    debug!("starting the display manager");
    run_best_effort("systemctl", &["start", "display-manager"]);
}

/// Reads `uevent` under an already-resolved sysfs device directory into a
/// `KEY=value` map.
fn read_uevent(sys: &SystemTunables, addr: &PciAddress) -> std::result::Result<HashMap<String, String>, GpuError> {
    let path = format!("/sys/bus/pci/devices/{addr}/uevent");
    let contents = sys.read(&path).map_err(|source| GpuError::SysfsAccess { path: path.into(), source })?;
    Ok(contents
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect())
}

fn is_boot_gpu(sys: &SystemTunables, addr: &PciAddress) -> bool {
    let path = format!("/sys/bus/pci/devices/{addr}/boot_vga");
    match sys.read(&path) {
        Ok(value) => value.trim().starts_with('1'),
        Err(_) => false,
    }
}

/// Lists `/sys/class/vtconsole/*`, in the order the kernel created them
/// (ascending `vtcon<N>`).
fn vtconsoles(sys: &SystemTunables) -> Vec<String> {
    let root = sys.root().join(VTCONSOLE_DIR.strip_prefix('/').unwrap());
    let Ok(entries) = std::fs::read_dir(&root) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}

/// Unbinds every vtconsole, in reverse discovery order so rebinding on
/// release restores the original order.
fn unbind_vtcons(sys: &SystemTunables) {
    for name in vtconsoles(sys).into_iter().rev() {
        let path = format!("{VTCONSOLE_DIR}/{name}/bind");
        debug!(vtconsole = %name, "unbinding");
        if let Err(err) = sys.write(&path, "0") {
            warn!(vtconsole = %name, error = %err, "failed to unbind vtconsole");
        }
    }
}

/// Re-binds every vtconsole, in discovery order — the exact reverse of
/// [`unbind_vtcons`].
fn bind_vtcons(sys: &SystemTunables) {
    for name in vtconsoles(sys) {
        let path = format!("{VTCONSOLE_DIR}/{name}/bind");
        debug!(vtconsole = %name, "binding");
        if let Err(err) = sys.write(&path, "1") {
            warn!(vtconsole = %name, error = %err, "failed to bind vtconsole");
        }
    }
}

fn unbind_framebuffer(sys: &SystemTunables) {
    let unbind_path = format!("{FRAMEBUFFER_DRIVER_DIR}/unbind");
    if sys.root().join(unbind_path.strip_prefix('/').unwrap()).is_file() {
        debug!("unbinding the framebuffer");
        if let Err(err) = sys.write(&unbind_path, FRAMEBUFFER_DEVICE) {
            warn!(error = %err, "failed to unbind framebuffer");
        }
        std::thread::sleep(Duration::from_secs(5));
    } else {
        debug!("no efi-framebuffer driver to unbind");
    }
}

fn bind_framebuffer(sys: &SystemTunables) {
    let bind_path = format!("{FRAMEBUFFER_DRIVER_DIR}/bind");
    if sys.root().join(bind_path.strip_prefix('/').unwrap()).is_file() {
        debug!("rebinding the framebuffer");
        if let Err(err) = sys.write(&bind_path, FRAMEBUFFER_DEVICE) {
            warn!(error = %err, "failed to rebind framebuffer");
        }
    } else {
        debug!("no efi-framebuffer driver to rebind");
    }
}

/// Lists `virsh nodedev-list` output, keeping only node-devs that both match
/// `pci_DDDD_BB_SS_` for this GPU's domain/bus/slot and whose full function
/// address is one of `config.pci_devices`.
fn matching_node_devs(addr: &PciAddress, config: &GuestConfig) -> Vec<String> {
    let output = match std::process::Command::new("virsh").arg("nodedev-list").output() {
        Ok(output) => output,
        Err(err) => {
            warn!(error = %err, "failed to list virsh node devices");
            return Vec::new();
        }
    };
    let stdout = String::from_utf8_lossy(&output.stdout);
    let prefix = format!("pci_{:04x}_{:02x}_{:02x}_", addr.domain, addr.bus, addr.slot);
    stdout
        .split_whitespace()
        .filter(|id| id.starts_with(&prefix))
        .filter(|id| config.pci_devices.iter().any(|d| &d.node_dev_id() == id))
        .map(str::to_string)
        .collect()
}

fn nodedev_detach(node_devs: &[String]) {
    debug!(?node_devs, "detaching node devices");
    for id in node_devs {
        run_best_effort("virsh", &["nodedev-detach", id]);
    }
}

fn nodedev_reattach(node_devs: &[String]) {
    debug!(?node_devs, "reattaching node devices");
    for id in node_devs.iter().rev() {
        run_best_effort("virsh", &["nodedev-reattach", id]);
    }
}

/// What was done for a guest's boot GPU, remembered so `release` can reverse
/// it exactly without needing the domain XML to still describe the same PCI
/// topology it did at `prepare` time.
struct Detached {
    addr: PciAddress,
    driver_name: String,
    node_devs: Vec<String>,
}

/// Detaches and re-attaches the boot GPU for passthrough, one guest at a
/// time (only the first `boot_vga` device in a guest's `pci_devices` is
/// handled; non-boot GPUs are left to libvirt's ordinary hostdev handling).
pub struct GpuPlugin {
    sys: SystemTunables,
    host: HostHandle,
    detached: HashMap<String, Detached>,
}

impl GpuPlugin {
    /// Builds the plug-in rooted at `root` (`/` in production), using
    /// `host` to reassign the effective host once the boot GPU has been
    /// detached (and to clear that reassignment on release).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, host: HostHandle) -> Self {
        Self {
            sys: SystemTunables::new(root),
            host,
            detached: HashMap::new(),
        }
    }

    fn boot_gpu(&self, guest: &GuestConfig) -> Option<PciAddress> {
        guest.pci_devices.iter().find(|addr| is_boot_gpu(&self.sys, addr)).copied()
    }
}

impl Plugin for GpuPlugin {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn prepare(&mut self, guest: &GuestConfig) -> Result<()> {
        let Some(addr) = self.boot_gpu(guest) else {
            return Ok(());
        };
        let uevent = read_uevent(&self.sys, &addr)?;
        let driver_name = uevent.get("DRIVER").cloned().unwrap_or_default();
        let driver = driver_for(&driver_name);

        stop_display_manager();
        unbind_vtcons(&self.sys);
        if driver.manages_framebuffer() {
            unbind_framebuffer(&self.sys);
        }
        let node_devs = matching_node_devs(&addr, guest);
        nodedev_detach(&node_devs);
        driver.unload()?;
        run_best_effort("modprobe", &["vfio_pci"]);
        run_best_effort("modprobe", &["vfio"]);
        run_best_effort("modprobe", &["vfio_iommu_type1"]);
        run_best_effort("modprobe", &["vfio_virqfd"]);

        self.host.set_host(Some(guest.name.clone()));
        self.detached.insert(guest.name.clone(), Detached { addr, driver_name, node_devs });
        Ok(())
    }

    fn release(&mut self, guest: &GuestConfig) {
        let Some(detached) = self.detached.remove(&guest.name) else {
            return;
        };
        let driver = driver_for(&detached.driver_name);

        nodedev_reattach(&detached.node_devs);
        if let Err(err) = driver.load() {
            warn!(guest = %guest.name, error = %err, "failed to reload GPU driver modules");
        }
        if driver.manages_framebuffer() {
            bind_framebuffer(&self.sys);
        }
        bind_vtcons(&self.sys);
        start_display_manager();
        self.host.set_host(None);
    }

    fn target_changed(&mut self, _target: &Target) {}
}
