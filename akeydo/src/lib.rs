//! # akeydo
//!
//! Input replication and VM-lifecycle resource shielding for KVM/QEMU
//! passthrough hosts.
//!
//! This crate reacts to libvirt's `Prepare`/`Release` lifecycle hooks for a
//! guest and, for each one, steers a physical keyboard/mouse between the
//! host and any number of guests at keystroke granularity, shields pinned
//! CPU cores from the host scheduler, pre-allocates huge pages, and detaches
//! the boot GPU for passthrough. A control-bus endpoint (see [`bus`])
//! exposes the active target, a cycle operation, and the two lifecycle
//! hooks themselves.
//!
//! ## Architecture
//!
//! - [`device`] — the input replicator: grabs one physical device, fans it
//!   out to a virtual sink per target, and detects hotkey chords on the
//!   live event stream. The hard engineering in this crate; see
//!   [`device::ReplicatedDevice`].
//! - [`orchestrator`] — the target ring, focus state, and plug-in dispatch.
//!   See [`orchestrator::Orchestrator`].
//! - [`plugin`] / [`plugins`] — the fixed, compile-time registry of
//!   resource-shielding concerns: device replication, CPU shielding,
//!   huge-pages, and GPU passthrough.
//! - [`xml`] — parses libvirt domain XML into an immutable [`model::GuestConfig`].
//! - [`config`] — the service's YAML-sourced settings tree.
//! - [`bus`] — the `dev.akeydo` control-bus interface.
//! - [`sys`] — an injectable procfs/sysfs accessor the plug-ins use, so
//!   tests can root it at a `tempfile` directory instead of `/`.
//! - [`keycode`] — `KEY_*` name to evdev code lookup, for hotkeys configured
//!   in YAML or libvirt metadata.
//! - [`error`] — the crate's error taxonomy.

pub mod bus;
pub mod config;
pub mod device;
pub mod error;
pub mod focus;
pub mod keycode;
pub mod model;
pub mod orchestrator;
pub mod plugin;
pub mod plugins;
pub mod sys;
pub mod xml;

pub use config::Settings;
pub use error::{AkeydoError, Result};
pub use model::{GuestConfig, Target};
pub use orchestrator::Orchestrator;
