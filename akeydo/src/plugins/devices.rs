//! The device-replication plug-in: the component that actually fans
//! physical input devices out to the host and whichever guests have
//! requested them.
//!
//! `prepare`/`release` recover the true source path by stripping the
//! `"<vm_name>-"` prefix libvirt's qemu hook adds to each requested
//! `/dev/input/by-id/` entry, and `target_changed` force-grabs every
//! managed device so a freshly-focused guest notices devices it hasn't
//! grabbed yet.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::Settings;
use crate::device::{DeviceFactory, ReplicatedDevice, ReplicatorEvent};
use crate::error::{DeviceError, Result};
use crate::focus::FocusHandle;
use crate::model::{Chord, GuestConfig, Target};
use crate::plugin::Plugin;

/// Recovers the physical source path libvirt's hook mangled with the guest
/// name: `"/dev/input/by-id/<vm_name>-<device>"` -> `"/dev/input/by-id/<device>"`.
fn source_path_for(guest_name: &str, evdev_path: &str) -> String {
    let prefix = format!("{guest_name}-");
    match evdev_path.rsplit_once('/') {
        Some((dir, basename)) => {
            let stripped = basename.strip_prefix(&prefix).unwrap_or(basename);
            format!("{dir}/{stripped}")
        }
        None => evdev_path.strip_prefix(&prefix).unwrap_or(evdev_path).to_string(),
    }
}

/// Polls for a character device to appear at `path`, giving up after `wait`.
fn wait_for_device(path: &str, wait: Duration) -> std::result::Result<(), DeviceError> {
    use std::os::unix::fs::FileTypeExt;

    let start = Instant::now();
    loop {
        if let Ok(metadata) = std::fs::metadata(path) {
            if metadata.file_type().is_char_device() {
                return Ok(());
            }
        }
        if start.elapsed() >= wait {
            return Err(DeviceError::Unavailable { path: path.into() });
        }
        std::thread::sleep(Duration::from_secs(1));
    }
}

/// Owns one [`ReplicatedDevice`] per physical source path, creating them
/// lazily as guests request them and eagerly for any `devices.by_id` entry.
pub struct DeviceManagerPlugin {
    factory: Arc<dyn DeviceFactory>,
    focus: FocusHandle,
    events_tx: mpsc::Sender<ReplicatorEvent>,
    delay: Duration,
    qemu_chord: Chord,
    release_chord: Option<Chord>,
    toggle_chord: Chord,
    host_hotkey: Option<Chord>,
    guest_hotkeys: HashMap<String, Chord>,
    wait_duration: Duration,
    always_on_paths: Vec<String>,
    devices: Mutex<HashMap<String, ReplicatedDevice>>,
}

impl DeviceManagerPlugin {
    /// Builds the plug-in and eagerly attaches the host to every
    /// `devices.by_id` device. A `by_id` device that never appears is logged
    /// and skipped, not fatal to startup.
    #[must_use]
    pub fn new(
        settings: &Settings,
        focus: FocusHandle,
        events_tx: mpsc::Sender<ReplicatorEvent>,
        factory: Arc<dyn DeviceFactory>,
    ) -> Self {
        let guest_hotkeys = settings
            .hotkeys
            .virtual_machines
            .keys()
            .filter_map(|name| settings.hotkeys.guest_chord(name).map(|chord| (name.clone(), chord)))
            .collect();

        let manager = Self {
            factory,
            focus,
            events_tx,
            delay: Duration::from_millis(settings.hotkeys.delay),
            qemu_chord: settings.hotkeys.qemu.clone(),
            release_chord: settings.hotkeys.release.clone(),
            toggle_chord: settings.hotkeys.toggle_chord().clone(),
            host_hotkey: settings.hotkeys.host.clone(),
            guest_hotkeys,
            wait_duration: Duration::from_secs(settings.devices.wait_duration),
            always_on_paths: settings
                .devices
                .by_id
                .iter()
                .map(|name| format!("/dev/input/by-id/{name}"))
                .collect(),
            devices: Mutex::new(HashMap::new()),
        };

        for path in manager.always_on_paths.clone() {
            if let Err(err) = wait_for_device(&path, manager.wait_duration) {
                warn!(path, error = %err, "always-on device never appeared, skipping");
                continue;
            }
            let device = manager.get_or_create(&path, true);
            device.attach(Target::Host, None);
        }

        manager
    }

    fn get_or_create(&self, source_path: &str, always_on: bool) -> ReplicatedDevice {
        let mut devices = self.devices.lock().unwrap();
        if let Some(device) = devices.get(source_path) {
            return device.clone();
        }
        let device = ReplicatedDevice::new(
            source_path,
            Arc::clone(&self.factory),
            self.focus.clone(),
            self.events_tx.clone(),
            self.delay,
            self.qemu_chord.clone(),
            self.release_chord.clone(),
            self.toggle_chord.clone(),
            self.host_hotkey.clone(),
            always_on,
        );
        devices.insert(source_path.to_string(), device.clone());
        device
    }

    fn hotkey_for(&self, guest: &GuestConfig) -> Option<Chord> {
        guest.hotkey.clone().or_else(|| self.guest_hotkeys.get(&guest.name).cloned())
    }
}

impl Plugin for DeviceManagerPlugin {
    fn name(&self) -> &'static str {
        "devices"
    }

    fn prepare(&mut self, guest: &GuestConfig) -> Result<()> {
        let hotkey = self.hotkey_for(guest);
        for evdev_path in &guest.evdev_paths {
            let source_path = source_path_for(&guest.name, evdev_path);
            wait_for_device(&source_path, self.wait_duration)?;
            let always_on = self.always_on_paths.iter().any(|p| p == &source_path);
            let device = self.get_or_create(&source_path, always_on);
            device.attach(Target::Guest(guest.name.clone()), hotkey.clone());
        }
        Ok(())
    }

    fn release(&mut self, guest: &GuestConfig) {
        let hotkey = self.hotkey_for(guest);
        for evdev_path in &guest.evdev_paths {
            let source_path = source_path_for(&guest.name, evdev_path);
            let device = self.devices.lock().unwrap().get(&source_path).cloned();
            if let Some(device) = device {
                device.detach(Target::Guest(guest.name.clone()), hotkey.clone());
            }
        }
    }

    fn target_changed(&mut self, _target: &Target) {
        for device in self.devices.lock().unwrap().values() {
            device.force_grab();
        }
    }

    fn stop(&mut self) {
        for device in self.devices.lock().unwrap().values() {
            device.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeDeviceFactory;
    use crate::focus::FocusState;
    use std::collections::BTreeSet;
    use std::sync::Mutex as StdMutex;

    fn focus() -> FocusHandle {
        FocusHandle::new(Arc::new(StdMutex::new(FocusState::default())))
    }

    fn guest(name: &str, evdev_paths: &[&str]) -> GuestConfig {
        GuestConfig {
            name: name.to_string(),
            memory_bytes: 0,
            hugepages_backed: false,
            pinned_cpus: BTreeSet::new(),
            pci_devices: BTreeSet::new(),
            evdev_paths: evdev_paths.iter().map(|s| s.to_string()).collect(),
            hotkey: None,
        }
    }

    #[test]
    fn source_path_strips_guest_prefix() {
        assert_eq!(
            source_path_for("win10", "/dev/input/by-id/win10-usb-kbd"),
            "/dev/input/by-id/usb-kbd"
        );
        assert_eq!(
            source_path_for("win10", "/dev/input/by-id/usb-kbd"),
            "/dev/input/by-id/usb-kbd"
        );
    }

    #[test]
    fn prepare_attaches_guest_sink_and_release_detaches_it() {
        let factory = Arc::new(FakeDeviceFactory::new());
        factory.source("/dev/input/by-id/usb-kbd"); // make the device "exist"
        let settings = Settings::default();
        let (tx, _rx) = mpsc::channel();
        let mut plugin = DeviceManagerPlugin::new(&settings, focus(), tx, factory.clone());

        let guest = guest("win10", &["/dev/input/by-id/win10-usb-kbd"]);
        // Device existence is checked via stat(2) in wait_for_device, which the
        // fake factory doesn't back with a real file; exercise the path-derivation
        // and attach/detach bookkeeping directly instead of through prepare/release.
        let device = plugin.get_or_create("/dev/input/by-id/usb-kbd", false);
        device.attach(Target::Guest(guest.name.clone()), None);
        std::thread::sleep(Duration::from_millis(20));
        assert!(factory.sink_exists("win10"));

        plugin.release(&guest);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!factory.sink_exists("win10"));
    }
}
