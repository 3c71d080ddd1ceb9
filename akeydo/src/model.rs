//! Core data types shared by the parser, orchestrator, and plug-ins.

use std::collections::BTreeSet;
use std::fmt;

use tracing::warn;

/// The logical destination for input events.
///
/// `Target::Host` is the distinguished sentinel representing the real
/// machine; every other target is a guest identified by name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Target {
    /// The true physical host, or whichever guest has assumed its role
    /// (see [`crate::orchestrator::Orchestrator::set_host`]).
    Host,
    /// A guest, identified by the name libvirt assigned it.
    Guest(String),
}

impl Target {
    /// The guest name, if this target is a guest.
    #[must_use]
    pub fn guest_name(&self) -> Option<&str> {
        match self {
            Target::Host => None,
            Target::Guest(name) => Some(name),
        }
    }
}

impl fmt::Display for Target {
    /// Renders `"host device"` for [`Target::Host`], the guest name
    /// otherwise — the exact strings `Toggle` returns and the `Target`
    /// bus property emits.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Host => write!(f, "host device"),
            Target::Guest(name) => write!(f, "{name}"),
        }
    }
}

/// An unordered set of key codes that must be *exactly* held down
/// (no extras) for a hotkey to fire.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Chord(BTreeSet<u16>);

impl Chord {
    /// Builds a chord from an iterator of evdev key codes.
    pub fn new(keys: impl IntoIterator<Item = u16>) -> Self {
        Self(keys.into_iter().collect())
    }

    /// Whether the chord contains no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates the key codes that make up this chord.
    pub fn keys(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().copied()
    }

    /// Exact-match test against the set of currently-held keys.
    ///
    /// This is a strict equality check, not a subset test: extra keys held
    /// down prevent the chord from firing.
    #[must_use]
    pub fn matches(&self, held: &BTreeSet<u16>) -> bool {
        !self.is_empty() && &self.0 == held
    }
}

impl FromIterator<u16> for Chord {
    fn from_iter<T: IntoIterator<Item = u16>>(iter: T) -> Self {
        Self::new(iter)
    }
}

/// A PCI function address, as found in `<hostdev>` / `<address>` elements
/// and in sysfs/`virsh nodedev-*` identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciAddress {
    /// PCI domain.
    pub domain: u16,
    /// PCI bus.
    pub bus: u8,
    /// PCI slot (device).
    pub slot: u8,
    /// PCI function.
    pub function: u8,
}

impl fmt::Display for PciAddress {
    /// Renders the sysfs `DDDD:BB:SS.F` form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:01x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

impl PciAddress {
    /// Renders the `pci_DDDD_BB_SS_F` node-dev id form used by
    /// `virsh nodedev-detach`/`nodedev-reattach`.
    #[must_use]
    pub fn node_dev_id(&self) -> String {
        format!(
            "pci_{:04x}_{:02x}_{:02x}_{:01x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

/// An immutable snapshot of the fields of a libvirt domain XML document that
/// this service cares about. Parsed once per lifecycle call (`Prepare` or
/// `Release`) and discarded at the end of that call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestConfig {
    /// The guest's libvirt domain name; uniquely identifies it.
    pub name: String,
    /// Requested memory, in bytes.
    pub memory_bytes: u64,
    /// Whether `<memoryBacking><hugepages/></memoryBacking>` was present.
    pub hugepages_backed: bool,
    /// CPUs pinned via `<cputune><vcpupin cpuset="...">`.
    pub pinned_cpus: BTreeSet<u32>,
    /// PCI hostdev addresses.
    pub pci_devices: BTreeSet<PciAddress>,
    /// Absolute evdev paths under `/dev/input/by-id/` requested for
    /// passthrough, filtered to those whose basename is prefixed with
    /// `"<name>-"`. The prefix itself is kept; callers that need the
    /// underlying physical source path strip it themselves (see
    /// `plugins::devices::source_path_for`).
    pub evdev_paths: BTreeSet<String>,
    /// An optional per-guest hotkey that switches focus directly to this
    /// guest, parsed from `<metadata><akeydo:settings>`.
    pub hotkey: Option<Chord>,
}

impl GuestConfig {
    /// An all-empty config for `name`, used for best-effort release cleanup
    /// when the domain XML for a `Release` call fails to parse.
    #[must_use]
    pub fn empty(name: String) -> Self {
        Self {
            name,
            memory_bytes: 0,
            hugepages_backed: false,
            pinned_cpus: BTreeSet::new(),
            pci_devices: BTreeSet::new(),
            evdev_paths: BTreeSet::new(),
            hotkey: None,
        }
    }
}

/// Multiplier table for `<memory unit="...">`, covering libvirt's full set
/// of byte/binary/decimal unit spellings. Units not present here are
/// malformed and rejected by the caller.
#[must_use]
pub fn memory_unit_multiplier(unit: &str) -> Option<u64> {
    const KI: u64 = 1024;
    const MI: u64 = KI * 1024;
    const GI: u64 = MI * 1024;
    const TI: u64 = GI * 1024;
    const KD: u64 = 1000;
    const MD: u64 = KD * 1000;
    const GD: u64 = MD * 1000;
    const TD: u64 = GD * 1000;

    Some(match unit {
        "b" | "bytes" => 1,
        "KB" => KD,
        "k" | "KiB" => KI,
        "MB" => MD,
        "M" | "MiB" => MI,
        "GB" => GD,
        "G" | "GiB" => GI,
        "TB" => TD,
        "T" | "TiB" => TI,
        _ => return None,
    })
}

/// Parses a `<memory unit="...">N</memory>` pair into a byte count.
/// Unit defaults to bytes when absent or unrecognized.
#[must_use]
pub fn parse_memory(value: u64, unit: Option<&str>) -> u64 {
    let multiplier = unit.and_then(memory_unit_multiplier).unwrap_or(1);
    value.saturating_mul(multiplier)
}

/// Parses a comma-separated cpuset string (e.g. `"1-3,5,7-6"`) into the set
/// of CPU indices it names. Whitespace around tokens is tolerated. A token
/// that fails to parse is logged and dropped rather than failing the whole
/// parse; an inverted range (`upper < lower`) is normalized.
#[must_use]
pub fn parse_cpuset(cpuset: &str) -> BTreeSet<u32> {
    let mut cpus = BTreeSet::new();
    for token in cpuset.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if let Some((lower, upper)) = token.split_once('-') {
            match (lower.trim().parse::<u32>(), upper.trim().parse::<u32>()) {
                (Ok(lower), Ok(upper)) => {
                    let (lo, hi) = if upper < lower { (upper, lower) } else { (lower, upper) };
                    cpus.extend(lo..=hi);
                }
                _ => warn!("unable to parse cpuset range {token:?}"),
            }
        } else {
            match token.parse::<u32>() {
                Ok(cpu) => {
                    cpus.insert(cpu);
                }
                Err(_) => warn!("unable to parse cpuset token {token:?}"),
            }
        }
    }
    cpus
}
