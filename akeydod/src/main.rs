//! Daemon entry point for akeydo: libvirt hook glue, logging, and signal
//! handling.
//!
//! Two modes, since this binary doubles as both the long-running service
//! and the libvirt qemu hook script that invokes it:
//!
//! - `akeydod serve` (the default): runs the service — connects to the
//!   control bus, builds the plug-in registry from `Settings`, and blocks
//!   until a termination signal arrives.
//! - `akeydod hook <name> <op> <sub-op> <extra-op>`: a short-lived client
//!   invocation. Reads the guest's domain XML from stdin and calls
//!   `Prepare`/`Release` on the already-running daemon over the bus, the
//!   way libvirt's `qemu` hook script invokes this binary for every guest
//!   lifecycle transition.

mod signals;

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use akeydo::config::Settings;
use akeydo::device::evdev_io::EvdevDeviceFactory;
use akeydo::orchestrator::{Orchestrator, OrchestratorHandles};
use akeydo::plugins::cpu::CpuShieldPlugin;
use akeydo::plugins::devices::DeviceManagerPlugin;
use akeydo::plugins::gpu::GpuPlugin;
use akeydo::plugins::memory::HugePagesPlugin;
use akeydo::plugin::Plugin;
use akeydo::{bus, AkeydoError};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use zbus::blocking::Connection;

/// akeydo — input replication and resource shielding for KVM/QEMU
/// passthrough hosts.
#[derive(Parser)]
#[command(name = "akeydod", version, about)]
struct Cli {
    /// Path to the YAML settings file.
    #[arg(long, default_value = akeydo::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available CLI commands. Defaults to [`Commands::Serve`] when omitted, so
/// a bare `akeydod` still runs the service.
#[derive(Subcommand)]
enum Commands {
    /// Runs the service: connects to the control bus and blocks until a
    /// termination signal arrives.
    Serve,

    /// Invokes a lifecycle hook on the already-running daemon over the bus.
    /// Reads the guest's domain XML from stdin, matching the way libvirt's
    /// `qemu` hook script invokes this binary.
    Hook {
        /// The guest's libvirt domain name.
        name: String,
        /// The libvirt hook operation (`"prepare"` or `"release"`).
        op: String,
        /// The hook sub-operation (`"begin"`/`"end"` in practice).
        sub_op: String,
        /// The hook's extra operation argument (`"-"` in practice).
        extra_op: String,
    },
}

fn main() -> ExitCode {
    let level = std::env::var("LOGLEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .init();

    let cli = Cli::parse();

    let result = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_serve(&cli.config),
        Commands::Hook { name, op, sub_op, extra_op } => run_hook(&cli.config, &name, &op, &sub_op, &extra_op),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "fatal startup error");
            ExitCode::FAILURE
        }
    }
}

/// Builds the fixed, compile-time plug-in registry from `Settings`: device
/// replication first (always enabled; it's the core of this service), then
/// CPU shielding, huge-pages, and GPU passthrough in the order a guest's
/// resources should be prepared and released in reverse. The closure runs
/// inside [`Orchestrator::spawn`], after the orchestrator's channels exist
/// but before the orchestrator thread starts processing commands.
fn build_plugins(settings: &Settings, handles: OrchestratorHandles) -> Vec<Box<dyn Plugin>> {
    let mut plugins: Vec<Box<dyn Plugin>> = Vec::new();

    if settings.devices.enabled {
        let factory = Arc::new(EvdevDeviceFactory);
        plugins.push(Box::new(DeviceManagerPlugin::new(
            settings,
            handles.focus.clone(),
            handles.replicator_events.clone(),
            factory,
        )));
    }
    if settings.cpu.enabled {
        let total_cpus = num_cpus();
        plugins.push(Box::new(CpuShieldPlugin::new("/", total_cpus)));
    }
    if settings.memory.enabled {
        plugins.push(Box::new(HugePagesPlugin::new(
            "/",
            std::time::Duration::from_secs(settings.memory.wait_duration),
        )));
    }
    if settings.gpu.enabled {
        plugins.push(Box::new(GpuPlugin::new("/", handles.host.clone())));
    }

    plugins
}

/// Counts online CPUs via `/proc/cpuinfo`, one of the procfs surfaces the
/// CPU-shielding plug-in reads alongside the cgroup tree.
fn num_cpus() -> u32 {
    std::fs::read_to_string("/proc/cpuinfo")
        .map(|contents| contents.lines().filter(|line| line.starts_with("processor")).count() as u32)
        .unwrap_or(1)
        .max(1)
}

fn run_serve(config_path: &PathBuf) -> Result<(), AkeydoError> {
    let settings = Settings::load(config_path)?;
    info!(path = %config_path.display(), "loaded configuration");

    signals::install();

    let dbus_settings = settings.dbus.clone();
    let orchestrator = Arc::new(Orchestrator::spawn(
        move |handles| build_plugins(&settings, handles),
        |_target| {},
    ));

    let bus_handle = bus::serve(&dbus_settings, Arc::clone(&orchestrator))?;
    info!(bus_name = %dbus_settings.bus_name, object_path = %dbus_settings.object_path, "serving control bus");

    let mut last_target = orchestrator.focus_handle().current().to_string();
    while !signals::shutdown_requested() {
        std::thread::sleep(std::time::Duration::from_millis(200));
        let current = orchestrator.focus_handle().current().to_string();
        if current != last_target {
            bus_handle.notify_target_changed(&current);
            last_target = current;
        }
    }

    info!("shutdown signal received, stopping");
    orchestrator.stop();
    Ok(())
}

fn run_hook(config_path: &PathBuf, name: &str, op: &str, sub_op: &str, extra_op: &str) -> Result<(), AkeydoError> {
    let settings = Settings::load(config_path)?;

    let mut xml = String::new();
    std::io::stdin()
        .read_to_string(&mut xml)
        .map_err(|source| akeydo::error::DeviceError::TaskFailed {
            path: "<stdin>".into(),
            reason: source.to_string(),
        })?;

    let connection = Connection::system().map_err(akeydo::error::BusError::Connection)?;
    let proxy = zbus::blocking::Proxy::new(
        &connection,
        settings.dbus.bus_name.as_str(),
        settings.dbus.object_path.as_str(),
        "dev.akeydo",
    )
    .map_err(akeydo::error::BusError::Connection)?;

    let accepted: bool = match op {
        "prepare" => proxy
            .call("Prepare", &(name, sub_op, extra_op, xml.as_str()))
            .map_err(akeydo::error::BusError::Connection)?,
        "release" => proxy
            .call("Release", &(name, sub_op, extra_op, xml.as_str()))
            .map_err(akeydo::error::BusError::Connection)?,
        other => {
            error!(op = other, "unrecognized hook operation");
            return Ok(());
        }
    };

    if !accepted {
        error!(guest = name, op, "hook rejected by daemon");
        return Err(akeydo::error::BusError::Denied.into());
    }
    Ok(())
}
