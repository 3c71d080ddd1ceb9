//! The hook orchestrator: target ring, lifecycle dispatch, focus state.
//!
//! Runs its own thread consuming a single command queue, so `Prepare`,
//! `Release`, `Toggle`, and replicator-posted events (`released` flips,
//! ring advances, direct-target hotkeys) are all processed one at a time —
//! no separate locking scheme is needed across them.

use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{error, warn};

use crate::device::ReplicatorEvent;
use crate::focus::{FocusHandle, FocusState};
use crate::model::{GuestConfig, Target};
use crate::plugin::Plugin;

enum Command {
    Prepare { name: String, xml: String, reply: mpsc::Sender<bool> },
    Release { name: String, xml: String, reply: mpsc::Sender<bool> },
    Toggle { reply: mpsc::Sender<String> },
    SetHost { guest: Option<String> },
    Replicator(ReplicatorEvent),
    Stop,
}

/// A cheaply-clonable handle the GPU plug-in uses to declare a guest the
/// effective host (or clear an existing declaration), without owning a
/// reference to the [`Orchestrator`] itself. Mirrors [`crate::focus::FocusHandle`]
/// in the opposite direction: that one lets replicators read focus without
/// owning the orchestrator, this one lets a plug-in write to it the same way.
#[derive(Clone)]
pub struct HostHandle(mpsc::Sender<Command>);

impl HostHandle {
    /// Declares `guest` the effective host, or clears an existing
    /// declaration when `None`. Fire-and-forget: queues onto the
    /// orchestrator's command channel and does not wait for it to apply.
    pub fn set_host(&self, guest: Option<String>) {
        let _ = self.0.send(Command::SetHost { guest });
    }

    /// Builds a standalone `HostHandle` for exercising a plug-in's
    /// `set_host` calls without a live [`Orchestrator`], matching the way
    /// `plugins/devices.rs`'s tests drive `ReplicatedDevice` directly rather
    /// than through the full command loop.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn for_test() -> (Self, mpsc::Receiver<Option<String>>) {
        let (tx, rx) = mpsc::channel::<Command>();
        let (out_tx, out_rx) = mpsc::channel();
        thread::spawn(move || {
            while let Ok(Command::SetHost { guest }) = rx.recv() {
                if out_tx.send(guest).is_err() {
                    break;
                }
            }
        });
        (Self(tx), out_rx)
    }
}

/// The handles a plug-in needs to reach back into the orchestrator, handed
/// to the plug-in-construction closure passed to [`Orchestrator::spawn`]
/// before the orchestrator itself exists.
#[derive(Clone)]
pub struct OrchestratorHandles {
    /// Read-only view onto the current focus state.
    pub focus: FocusHandle,
    /// Channel replicators post [`ReplicatorEvent`]s to.
    pub replicator_events: mpsc::Sender<ReplicatorEvent>,
    /// Handle the GPU plug-in uses to reassign the host role.
    pub host: HostHandle,
}

struct Worker {
    targets: Vec<Target>,
    active_target: Target,
    host_override: Option<String>,
    released: bool,
    plugins: Vec<Box<dyn Plugin>>,
    focus_state: Arc<Mutex<FocusState>>,
    on_target_changed: Box<dyn Fn(Target) + Send>,
}

impl Worker {
    fn has_target(&self, name: &str) -> bool {
        self.targets.iter().any(|t| t.guest_name() == Some(name))
    }

    fn host_target(&self) -> Target {
        match &self.host_override {
            Some(name) => Target::Guest(name.clone()),
            None => Target::Host,
        }
    }

    fn effective_target(&self) -> Target {
        if self.released {
            return self.host_target();
        }
        if self.active_target == Target::Host {
            self.host_target()
        } else {
            self.active_target.clone()
        }
    }

    /// Pushes the current (targets, active_target, host_override,
    /// released) state to the shared `FocusState`, then notifies the bus
    /// layer and every plug-in of the new effective target. Updating all of
    /// it under one lock acquisition means readers via `FocusHandle` never
    /// see a half-updated state.
    fn publish(&mut self) {
        let effective = self.effective_target();
        {
            let mut state = self.focus_state.lock().unwrap();
            state.active_target = self.active_target.clone();
            state.host_override = self.host_override.clone();
            state.released = self.released;
        }
        (self.on_target_changed)(effective.clone());
        for plugin in &mut self.plugins {
            plugin.target_changed(&effective);
        }
    }

    fn prepare(&mut self, name: String, xml: String) -> bool {
        if self.has_target(&name) {
            warn!(guest = %name, "duplicate Prepare rejected");
            return false;
        }
        let config = match crate::xml::parse_guest_config(&xml) {
            Ok(config) => config,
            Err(err) => {
                warn!(guest = %name, error = %err, "failed to parse guest XML");
                return false;
            }
        };

        self.targets.push(Target::Guest(name.clone()));

        for idx in 0..self.plugins.len() {
            if let Err(err) = self.plugins[idx].prepare(&config) {
                error!(
                    guest = %name,
                    plugin = self.plugins[idx].name(),
                    error = %err,
                    "plug-in prepare failed, rolling back"
                );
                for rollback in (0..idx).rev() {
                    self.plugins[rollback].release(&config);
                }
                self.targets.retain(|t| t.guest_name() != Some(name.as_str()));
                return false;
            }
        }
        true
    }

    fn release(&mut self, name: String, xml: String) -> bool {
        if !self.has_target(&name) {
            warn!(guest = %name, "Release for unknown guest");
            return false;
        }
        let config = crate::xml::parse_guest_config(&xml).unwrap_or_else(|err| {
            warn!(
                guest = %name,
                error = %err,
                "failed to parse guest XML on release; falling back to best-effort cleanup"
            );
            GuestConfig::empty(name.clone())
        });

        self.targets.retain(|t| t.guest_name() != Some(name.as_str()));
        if self.host_override.as_deref() == Some(name.as_str()) {
            self.host_override = None;
        }
        if self.active_target.guest_name() == Some(name.as_str()) {
            self.active_target = self.host_target();
        }
        self.publish();

        for plugin in self.plugins.iter_mut().rev() {
            plugin.release(&config);
        }
        true
    }

    fn toggle(&mut self) -> Target {
        if !self.targets.is_empty() {
            let idx = self
                .targets
                .iter()
                .position(|t| *t == self.active_target)
                .unwrap_or(0);
            let next = self.targets[(idx + 1) % self.targets.len()].clone();
            if next != self.active_target {
                self.active_target = next;
                self.publish();
            }
        }
        self.effective_target()
    }

    fn set_host(&mut self, guest: Option<String>) {
        self.host_override = guest;
        match &self.host_override {
            Some(_) => {
                self.targets.retain(|t| *t != Target::Host);
                if self.active_target == Target::Host {
                    self.active_target = self.host_target();
                }
            }
            None => {
                if !self.targets.contains(&Target::Host) {
                    self.targets.insert(0, Target::Host);
                }
            }
        }
        self.publish();
    }

    fn handle_replicator_event(&mut self, event: ReplicatorEvent) {
        match event {
            ReplicatorEvent::Released => {
                self.released = !self.released;
                self.publish();
            }
            ReplicatorEvent::Toggled => {
                self.toggle();
            }
            ReplicatorEvent::TargetSet(target) => {
                if self.active_target != target {
                    self.active_target = target;
                    self.publish();
                }
            }
        }
    }
}

/// The running orchestrator: target ring, focus state, and the set of
/// enabled plug-ins, all owned by a dedicated thread.
pub struct Orchestrator {
    cmd_tx: mpsc::Sender<Command>,
    replicator_events: mpsc::Sender<ReplicatorEvent>,
    focus: FocusHandle,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Builds the plug-in list via `build_plugins`, then spawns the
    /// orchestrator thread with those plug-ins invoked in declaration order
    /// on `prepare` (reverse order on `release`); `on_target_changed` is
    /// called every time the effective target changes (the bus layer's
    /// hook for emitting the `Target` property-change signal).
    ///
    /// Plug-ins are built from an [`OrchestratorHandles`] rather than
    /// passed in ready-made, because some (the device manager, the GPU
    /// plug-in) need a [`FocusHandle`] or a [`HostHandle`] that only exists
    /// once the orchestrator's channels are up — channels this method
    /// creates before calling `build_plugins`.
    #[must_use]
    pub fn spawn<F>(
        build_plugins: F,
        on_target_changed: impl Fn(Target) + Send + 'static,
    ) -> Self
    where
        F: FnOnce(OrchestratorHandles) -> Vec<Box<dyn Plugin>>,
    {
        let focus_state = Arc::new(Mutex::new(FocusState::default()));
        let focus = FocusHandle::new(Arc::clone(&focus_state));

        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (repl_tx, repl_rx) = mpsc::channel::<ReplicatorEvent>();

        let plugins = build_plugins(OrchestratorHandles {
            focus: focus.clone(),
            replicator_events: repl_tx.clone(),
            host: HostHandle(cmd_tx.clone()),
        });

        let relay_tx = cmd_tx.clone();
        thread::Builder::new()
            .name("akeydo-replicator-relay".to_string())
            .spawn(move || {
                while let Ok(event) = repl_rx.recv() {
                    if relay_tx.send(Command::Replicator(event)).is_err() {
                        break;
                    }
                }
            })
            .expect("failed to spawn replicator relay thread");

        let worker_handle = thread::Builder::new()
            .name("akeydo-orchestrator".to_string())
            .spawn(move || {
                let mut worker = Worker {
                    targets: vec![Target::Host],
                    active_target: Target::Host,
                    host_override: None,
                    released: false,
                    plugins,
                    focus_state,
                    on_target_changed: Box::new(on_target_changed),
                };
                while let Ok(command) = cmd_rx.recv() {
                    match command {
                        Command::Prepare { name, xml, reply } => {
                            let ok = worker.prepare(name, xml);
                            let _ = reply.send(ok);
                        }
                        Command::Release { name, xml, reply } => {
                            let ok = worker.release(name, xml);
                            let _ = reply.send(ok);
                        }
                        Command::Toggle { reply } => {
                            let target = worker.toggle();
                            let _ = reply.send(target.to_string());
                        }
                        Command::SetHost { guest } => worker.set_host(guest),
                        Command::Replicator(event) => worker.handle_replicator_event(event),
                        Command::Stop => {
                            for plugin in worker.plugins.iter_mut().rev() {
                                plugin.stop();
                            }
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn orchestrator thread");

        Self {
            cmd_tx,
            replicator_events: repl_tx,
            focus,
            worker: Mutex::new(Some(worker_handle)),
        }
    }

    /// A read-only handle to the current focus state, for handing to
    /// [`crate::device::ReplicatedDevice`] instances.
    #[must_use]
    pub fn focus_handle(&self) -> FocusHandle {
        self.focus.clone()
    }

    /// The channel replicators post [`ReplicatorEvent`]s to.
    #[must_use]
    pub fn replicator_events(&self) -> mpsc::Sender<ReplicatorEvent> {
        self.replicator_events.clone()
    }

    /// Runs the `Prepare` lifecycle hook, blocking until the orchestrator
    /// thread has processed it.
    #[must_use]
    pub fn prepare(&self, name: impl Into<String>, xml: impl Into<String>) -> bool {
        let (reply, rx) = mpsc::channel();
        let sent = self.cmd_tx.send(Command::Prepare {
            name: name.into(),
            xml: xml.into(),
            reply,
        });
        if sent.is_err() {
            return false;
        }
        rx.recv().unwrap_or(false)
    }

    /// Runs the `Release` lifecycle hook, blocking until processed.
    #[must_use]
    pub fn release(&self, name: impl Into<String>, xml: impl Into<String>) -> bool {
        let (reply, rx) = mpsc::channel();
        let sent = self.cmd_tx.send(Command::Release {
            name: name.into(),
            xml: xml.into(),
            reply,
        });
        if sent.is_err() {
            return false;
        }
        rx.recv().unwrap_or(false)
    }

    /// Advances the ring and returns the new effective target's display
    /// name.
    #[must_use]
    pub fn toggle(&self) -> String {
        let (reply, rx) = mpsc::channel();
        if self.cmd_tx.send(Command::Toggle { reply }).is_err() {
            return self.focus.current().to_string();
        }
        rx.recv().unwrap_or_else(|_| self.focus.current().to_string())
    }

    /// Declares `guest` the effective host (or clears an existing
    /// override when `None`).
    pub fn set_host(&self, guest: Option<String>) {
        let _ = self.cmd_tx.send(Command::SetHost { guest });
    }

    /// Runs every plug-in's `stop`, in reverse declaration order, and
    /// joins the orchestrator thread. Idempotent.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingPlugin {
        prepared: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    impl Plugin for RecordingPlugin {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn prepare(&mut self, _guest: &GuestConfig) -> Result<()> {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn release(&mut self, _guest: &GuestConfig) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn domain_for(name: &str) -> String {
        format!("<domain><name>{name}</name></domain>")
    }

    #[test]
    fn duplicate_prepare_is_rejected() {
        let orchestrator = Orchestrator::spawn(|_| Vec::new(), |_| {});
        assert!(orchestrator.prepare("x", domain_for("x")));
        assert!(!orchestrator.prepare("x", domain_for("x")));
        orchestrator.stop();
    }

    #[test]
    fn ring_cycle_round_trips() {
        let orchestrator = Orchestrator::spawn(|_| Vec::new(), |_| {});
        assert!(orchestrator.prepare("a", domain_for("a")));
        assert!(orchestrator.prepare("b", domain_for("b")));

        assert_eq!(orchestrator.toggle(), "a");
        assert_eq!(orchestrator.toggle(), "b");
        assert_eq!(orchestrator.toggle(), "host device");
        orchestrator.stop();
    }

    #[test]
    fn release_of_active_guest_resets_to_host() {
        let orchestrator = Orchestrator::spawn(|_| Vec::new(), |_| {});
        orchestrator.prepare("a", domain_for("a"));
        assert_eq!(orchestrator.toggle(), "a");

        assert!(orchestrator.release("a", domain_for("a")));
        assert_eq!(orchestrator.toggle(), "host device");
        orchestrator.stop();
    }

    #[test]
    fn plugin_prepare_failure_rolls_back_and_rejects_target() {
        struct FailingPlugin;
        impl Plugin for FailingPlugin {
            fn name(&self) -> &'static str {
                "failing"
            }
            fn prepare(&mut self, _guest: &GuestConfig) -> Result<()> {
                Err(crate::error::CpuError::Write {
                    path: "/dev/null".into(),
                    source: std::io::Error::other("boom"),
                }
                .into())
            }
            fn release(&mut self, _guest: &GuestConfig) {}
        }

        let prepared = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicUsize::new(0));
        let plugins: Vec<Box<dyn Plugin>> = vec![
            Box::new(RecordingPlugin { prepared: Arc::clone(&prepared), released: Arc::clone(&released) }),
            Box::new(FailingPlugin),
        ];
        let orchestrator = Orchestrator::spawn(|_| plugins, |_| {});
        assert!(!orchestrator.prepare("x", domain_for("x")));
        assert_eq!(prepared.load(Ordering::SeqCst), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        // Rejected target means a second Prepare for the same name is not a duplicate.
        assert!(orchestrator.prepare("x", domain_for("x")));
        orchestrator.stop();
    }

    #[test]
    fn plugins_run_in_declaration_and_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));

        struct OrderPlugin {
            id: &'static str,
            order: Arc<Mutex<Vec<String>>>,
        }
        impl Plugin for OrderPlugin {
            fn name(&self) -> &'static str {
                self.id
            }
            fn prepare(&mut self, _guest: &GuestConfig) -> Result<()> {
                self.order.lock().unwrap().push(format!("prepare:{}", self.id));
                Ok(())
            }
            fn release(&mut self, _guest: &GuestConfig) {
                self.order.lock().unwrap().push(format!("release:{}", self.id));
            }
        }

        let plugins: Vec<Box<dyn Plugin>> = vec![
            Box::new(OrderPlugin { id: "first", order: Arc::clone(&order) }),
            Box::new(OrderPlugin { id: "second", order: Arc::clone(&order) }),
        ];
        let orchestrator = Orchestrator::spawn(|_| plugins, |_| {});
        orchestrator.prepare("x", domain_for("x"));
        orchestrator.release("x", domain_for("x"));
        orchestrator.stop();

        assert_eq!(
            *order.lock().unwrap(),
            vec!["prepare:first", "prepare:second", "release:second", "release:first"]
        );
    }
}
