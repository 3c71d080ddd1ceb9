//! Service configuration.
//!
//! A `Settings` struct assembled from sub-structs, each `Deserialize` with
//! `#[serde(default)]` fields, loaded once at startup into a frozen value
//! every plug-in borrows from.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;
use crate::model::Chord;

/// Default path read when no config path is given on the command line.
/// The `.conf` extension is historical; the contents are YAML.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/akeydo.conf";

fn default_bus_name() -> String {
    "dev.akeydo".to_string()
}

fn default_object_path() -> String {
    "/dev/akeydo".to_string()
}

/// Control-bus settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbusSettings {
    /// The bus name to request (form `org.service`).
    #[serde(default = "default_bus_name")]
    pub bus_name: String,
    /// The object path to serve the interface at.
    #[serde(default = "default_object_path")]
    pub object_path: String,
}

impl Default for DbusSettings {
    fn default() -> Self {
        Self {
            bus_name: default_bus_name(),
            object_path: default_object_path(),
        }
    }
}

fn default_qemu_chord() -> Chord {
    Chord::new([29, 97]) // KEY_LEFTCTRL, KEY_RIGHTCTRL
}

fn default_delay_ms() -> u64 {
    100
}

/// A chord as it appears in YAML: a list of `KEY_*` names.
fn deserialize_chord<'de, D>(deserializer: D) -> Result<Option<Chord>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let names: Option<Vec<String>> = Option::deserialize(deserializer)?;
    Ok(names.and_then(|names| crate::keycode::parse_chord(names.iter().map(String::as_str))))
}

fn deserialize_chord_required<'de, D>(deserializer: D) -> Result<Chord, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let names: Vec<String> = Vec::deserialize(deserializer)?;
    Ok(crate::keycode::parse_chord(names.iter().map(String::as_str)).unwrap_or_default())
}

/// Hotkey settings: post-chord debounce delay and the chords themselves.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HotkeySettings {
    /// Delay after a hotkey fires, in milliseconds, before the switch takes
    /// effect — lets key-up events for the chord drain to the outgoing
    /// sink. Default 100ms.
    #[serde(default = "default_delay_ms")]
    pub delay: u64,
    /// The chord QEMU itself uses to grab devices. Defaults to
    /// LeftCtrl+RightCtrl.
    #[serde(default = "default_qemu_chord", deserialize_with = "deserialize_chord_required")]
    pub qemu: Chord,
    /// The chord that cycles the active target. Defaults to `qemu` when
    /// unset (resolved in [`HotkeySettings::resolve_toggle_default`]).
    #[serde(default, deserialize_with = "deserialize_chord")]
    pub toggle: Option<Chord>,
    /// The chord that switches focus directly to the host.
    #[serde(default, deserialize_with = "deserialize_chord")]
    pub host: Option<Chord>,
    /// The chord that releases devices to the host without changing
    /// `active_target`.
    #[serde(default, deserialize_with = "deserialize_chord")]
    pub release: Option<Chord>,
    /// Per-guest chords that switch focus directly to a named guest.
    #[serde(default)]
    pub virtual_machines: HashMap<String, Vec<String>>,
    /// Chords that emit an arbitrary named bus signal.
    #[serde(default)]
    pub signals: HashMap<String, Vec<String>>,
}

impl Default for HotkeySettings {
    fn default() -> Self {
        Self {
            delay: default_delay_ms(),
            qemu: default_qemu_chord(),
            toggle: None,
            host: None,
            release: None,
            virtual_machines: HashMap::new(),
            signals: HashMap::new(),
        }
    }
}

impl HotkeySettings {
    /// The toggle chord to actually use: the configured value, or `qemu` if
    /// none was given.
    #[must_use]
    pub fn toggle_chord(&self) -> &Chord {
        self.toggle.as_ref().unwrap_or(&self.qemu)
    }

    /// Resolves a named guest's hotkey, if configured.
    #[must_use]
    pub fn guest_chord(&self, name: &str) -> Option<Chord> {
        self.virtual_machines
            .get(name)
            .and_then(|keys| crate::keycode::parse_chord(keys.iter().map(String::as_str)))
    }
}

/// CPU shielding plug-in settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CpuSettings {
    /// Whether to instantiate the CPU shielding plug-in.
    pub enabled: bool,
}

fn default_memory_wait() -> u64 {
    30
}

/// Huge-pages plug-in settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    /// Whether to instantiate the huge-pages plug-in.
    pub enabled: bool,
    /// Seconds to poll `nr_hugepages` before declaring an allocation
    /// timeout.
    #[serde(default = "default_memory_wait")]
    pub wait_duration: u64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            wait_duration: default_memory_wait(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_device_wait() -> u64 {
    10
}

/// Device-replication plug-in settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Whether to instantiate the device-replication plug-in. Enabled by
    /// default: it carries the core input-replication functionality.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Physical devices (by `/dev/input/by-id/` basename) that should
    /// always be grabbed and listening for hotkeys, even with no guest
    /// currently using them.
    #[serde(default)]
    pub by_id: Vec<String>,
    /// Seconds to wait for a device to appear before surfacing
    /// `DeviceUnavailable`.
    #[serde(default = "default_device_wait")]
    pub wait_duration: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            by_id: Vec::new(),
            wait_duration: default_device_wait(),
        }
    }
}

/// GPU passthrough plug-in settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GpuSettings {
    /// Whether to instantiate the GPU passthrough plug-in.
    pub enabled: bool,
}

/// The service's frozen configuration tree, assembled once at startup.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    /// Control-bus settings.
    pub dbus: DbusSettings,
    /// Hotkey chords and debounce delay.
    pub hotkeys: HotkeySettings,
    /// CPU shielding plug-in settings.
    pub cpu: CpuSettings,
    /// Huge-pages plug-in settings.
    pub memory: MemorySettings,
    /// Device-replication plug-in settings.
    pub devices: DeviceSettings,
    /// GPU passthrough plug-in settings.
    pub gpu: GpuSettings,
}

impl Settings {
    /// Loads settings from a YAML file at `path`. A missing file yields
    /// all-default settings rather than an error, so the service still
    /// starts on a host with no config deployed yet.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the file exists but fails to parse.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).unwrap_or_default();
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads settings from the default path ([`DEFAULT_CONFIG_PATH`]).
    ///
    /// # Errors
    ///
    /// See [`Settings::load`].
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(&PathBuf::from(DEFAULT_CONFIG_PATH))
    }
}
