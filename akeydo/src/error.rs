//! Error types for the akeydo service.

use std::path::PathBuf;

use thiserror::Error;

/// The top-level error type for all akeydo operations.
#[derive(Error, Debug)]
pub enum AkeydoError {
    /// Error parsing libvirt domain XML or service configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error operating a replicated input device.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Error from the CPU shielding plug-in.
    #[error("cpu plug-in error: {0}")]
    Cpu(#[from] CpuError),

    /// Error from the huge-pages plug-in.
    #[error("memory plug-in error: {0}")]
    Memory(#[from] MemoryError),

    /// Error from the GPU passthrough plug-in.
    #[error("gpu plug-in error: {0}")]
    Gpu(#[from] GpuError),

    /// Error reaching or claiming the control bus.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

/// Errors parsing libvirt domain XML or the service's own YAML configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The XML document has no root element, or the root has no `<name>`.
    #[error("invalid guest configuration: {reason}")]
    InvalidConfig {
        /// Description of what was missing or malformed.
        reason: String,
    },

    /// The XML document could not be parsed at all.
    #[error("malformed XML: {0}")]
    Xml(#[from] roxmltree::Error),

    /// The YAML settings file exists but could not be parsed.
    #[error("malformed settings file '{}': {source}", path.display())]
    Yaml {
        /// Path to the settings file.
        path: PathBuf,
        /// The underlying YAML parsing error.
        #[source]
        source: serde_yaml::Error,
    },
}

/// Errors operating a physical source device or its virtual sinks.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The source device node does not exist, or exists but is not a
    /// character device, after `devices.wait_duration` seconds of retrying.
    #[error("device unavailable: {path}")]
    Unavailable {
        /// The source device path that never became available.
        path: PathBuf,
    },

    /// Creating the virtual sink device failed.
    #[error("failed to create virtual device for target '{target}': {source}")]
    SinkCreate {
        /// The target the sink was being created for.
        target: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Grabbing the source device exclusively failed in a way that is not
    /// one of the tolerated transient conditions (busy / not found).
    #[error("failed to grab source device '{path}': {source}")]
    Grab {
        /// The source device path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A background replicator task panicked or exited unexpectedly; surfaced
    /// to the orchestrator, which tears the device down.
    #[error("replicator task for '{path}' failed: {reason}")]
    TaskFailed {
        /// The source device path whose task failed.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },
}

/// Errors from the CPU shielding plug-in.
#[derive(Error, Debug)]
pub enum CpuError {
    /// A cgroup or procfs/sysfs tunable write failed.
    #[error("failed to write '{}': {source}", path.display())]
    Write {
        /// The file that could not be written.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A tunable read (for save/restore) failed.
    #[error("failed to read '{}': {source}", path.display())]
    Read {
        /// The file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the huge-pages plug-in.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// A sysfs/procfs tunable write failed.
    #[error("failed to write '{}': {source}", path.display())]
    Write {
        /// The file that could not be written.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A sysfs/procfs tunable read failed.
    #[error("failed to read '{}': {source}", path.display())]
    Read {
        /// The file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The huge-page pool did not reach the requested size within the
    /// polling timeout.
    #[error(
        "timed out waiting for {requested} pages of size {page_kb}kB (have {actual})"
    )]
    AllocationTimeout {
        /// The total page count that was requested.
        requested: u64,
        /// The page count actually observed when the timeout elapsed.
        actual: u64,
        /// The huge-page size, in kB.
        page_kb: u64,
    },
}

/// Errors from the GPU passthrough plug-in.
#[derive(Error, Debug)]
pub enum GpuError {
    /// A sysfs tunable read or write failed.
    #[error("failed to access '{}': {source}", path.display())]
    SysfsAccess {
        /// The sysfs path that could not be accessed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Spawning a subprocess (`virsh`, `modprobe`, `systemctl`, ...) failed.
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        /// The command that could not be spawned.
        command: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors establishing or using the control bus.
#[derive(Error, Debug)]
pub enum BusError {
    /// The bus name request was denied, or did not resolve within the 30s
    /// startup timeout. Fatal at startup.
    #[error("bus name request denied or timed out")]
    Denied,

    /// The underlying zbus connection failed.
    #[error("bus connection failed: {0}")]
    Connection(#[from] zbus::Error),
}

/// Convenience alias for `Result<T, AkeydoError>`.
pub type Result<T> = std::result::Result<T, AkeydoError>;
