//! The `dev.akeydo` control-bus interface.
//!
//! Exposes `Toggle`, `Prepare`, `Release`, and a `Target` property-change
//! signal over `zbus`. This module is thin on purpose: every method
//! immediately delegates to [`Orchestrator`], which already does the real
//! work on its own thread.
//!
//! Uses `zbus::blocking` throughout to match the rest of the workspace's
//! synchronous, thread-per-concern concurrency model rather than pulling in
//! an async runtime for this one seam.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use zbus::blocking::{connection, Connection};
use zbus::interface;
use zbus::zvariant::Value;

use crate::config::DbusSettings;
use crate::error::{BusError, Result};
use crate::orchestrator::Orchestrator;

/// How long [`serve`] waits for `request_name` to resolve before treating
/// ACL denial as a fatal startup error.
const REQUEST_NAME_TIMEOUT: Duration = Duration::from_secs(30);

/// The object served at `Settings.dbus.object_path`, implementing the
/// `dev.akeydo` interface.
#[derive(Clone)]
struct AkeydoObject {
    orchestrator: Arc<Orchestrator>,
}

#[interface(name = "dev.akeydo")]
impl AkeydoObject {
    /// Cycles the active target and returns its display name.
    async fn toggle(&self) -> String {
        self.orchestrator.toggle()
    }

    /// The `Prepare` lifecycle hook. `sub_op`/`extra_op` are accepted to
    /// match the libvirt hook call signature (`"begin"`/`"-"` in practice)
    /// but otherwise unused.
    #[zbus(name = "Prepare")]
    async fn prepare(&self, name: String, sub_op: String, extra_op: String, xml: String) -> bool {
        let _ = (sub_op, extra_op);
        self.orchestrator.prepare(name, xml)
    }

    /// The `Release` lifecycle hook (`sub_op = "end"` in practice).
    #[zbus(name = "Release")]
    async fn release(&self, name: String, sub_op: String, extra_op: String, xml: String) -> bool {
        let _ = (sub_op, extra_op);
        self.orchestrator.release(name, xml)
    }

    /// The current effective target's display name. Read-only: it only
    /// ever changes from the orchestrator side (`Toggle`, a hotkey, a
    /// lifecycle call), never from a client `Set` call.
    #[zbus(property)]
    async fn target(&self) -> String {
        self.orchestrator.focus_handle().current().to_string()
    }
}

/// A live connection to the control bus, serving the `dev.akeydo`
/// interface. Dropping this does not disconnect; call [`BusHandle::close`]
/// (or just let the process exit) to tear down.
pub struct BusHandle {
    connection: Connection,
    object_path: String,
}

impl BusHandle {
    /// Emits a `Target` property-change signal carrying `target`'s current
    /// display name.
    ///
    /// Built by hand rather than through the interface macro's generated
    /// `target_changed` helper: that helper expects to run on the same
    /// async executor the interface body runs on, whereas this is called
    /// from the orchestrator's own thread whenever focus changes.
    pub fn notify_target_changed(&self, target: &str) {
        let mut changed: HashMap<&str, Value<'_>> = HashMap::new();
        changed.insert("Target", Value::from(target));
        let invalidated: Vec<&str> = Vec::new();

        let result = self.connection.emit_signal(
            None::<()>,
            self.object_path.as_str(),
            "org.freedesktop.DBus.Properties",
            "PropertiesChanged",
            &("dev.akeydo", changed, invalidated),
        );
        if let Err(err) = result {
            warn!(error = %err, "failed to emit Target property-change signal");
        }
    }
}

/// Connects to the system bus, requests `settings.bus_name`, and serves the
/// `dev.akeydo` interface at `settings.object_path`.
///
/// # Errors
///
/// Returns [`BusError::Denied`] if the name request does not resolve within
/// 30s (bus ACL policy is the host's concern, not this process's, but it
/// must not hang waiting on one), or [`BusError::Connection`] for any other
/// bus failure.
pub fn serve(settings: &DbusSettings, orchestrator: Arc<Orchestrator>) -> Result<BusHandle> {
    let object = AkeydoObject { orchestrator };
    let bus_name = settings.bus_name.clone();
    let object_path = settings.object_path.clone();

    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::Builder::new()
        .name("akeydo-bus".to_string())
        .spawn(move || {
            let built = connection::Builder::system()
                .and_then(|builder| builder.serve_at(object_path.as_str(), object))
                .and_then(|builder| builder.name(bus_name.as_str()))
                .and_then(connection::Builder::build);
            let _ = tx.send(built);
        })
        .expect("failed to spawn control-bus thread");

    let connection = rx
        .recv_timeout(REQUEST_NAME_TIMEOUT)
        .map_err(|_| BusError::Denied)?
        .map_err(BusError::Connection)?;

    Ok(BusHandle { connection, object_path: settings.object_path.clone() })
}
