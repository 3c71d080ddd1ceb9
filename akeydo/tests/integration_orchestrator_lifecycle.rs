//! End-to-end lifecycle tests against the public `Orchestrator` API: the
//! target ring, focus publication, and plug-in dispatch order, all driven
//! through `Prepare`/`Release`/`Toggle` rather than the `Worker` internals.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use akeydo::error::Result;
use akeydo::model::{GuestConfig, Target};
use akeydo::orchestrator::Orchestrator;
use akeydo::plugin::Plugin;

fn domain_xml(name: &str) -> String {
    format!(
        r#"<domain type='kvm'>
             <name>{name}</name>
             <memory unit='GiB'>2</memory>
           </domain>"#
    )
}

struct RecordingPlugin {
    log: Arc<Mutex<Vec<String>>>,
}

impl Plugin for RecordingPlugin {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn prepare(&mut self, guest: &GuestConfig) -> Result<()> {
        self.log.lock().unwrap().push(format!("prepare:{}", guest.name));
        Ok(())
    }

    fn release(&mut self, guest: &GuestConfig) {
        self.log.lock().unwrap().push(format!("release:{}", guest.name));
    }

    fn target_changed(&mut self, target: &Target) {
        self.log.lock().unwrap().push(format!("target:{target}"));
    }

    fn stop(&mut self) {
        self.log.lock().unwrap().push("stop".to_string());
    }
}

#[test]
fn three_guests_cycle_through_the_ring_and_back_to_host() {
    let orchestrator = Orchestrator::spawn(|_handles| Vec::new(), |_target| {});

    assert!(orchestrator.prepare("win10", domain_xml("win10")));
    assert!(orchestrator.prepare("macos", domain_xml("macos")));
    assert!(orchestrator.prepare("linux", domain_xml("linux")));

    assert_eq!(orchestrator.toggle(), "win10");
    assert_eq!(orchestrator.toggle(), "macos");
    assert_eq!(orchestrator.toggle(), "linux");
    assert_eq!(orchestrator.toggle(), "host device");
    assert_eq!(orchestrator.toggle(), "win10");

    orchestrator.stop();
}

#[test]
fn releasing_a_guest_mid_ring_does_not_disturb_the_remaining_order() {
    let orchestrator = Orchestrator::spawn(|_handles| Vec::new(), |_target| {});

    orchestrator.prepare("a", domain_xml("a"));
    orchestrator.prepare("b", domain_xml("b"));
    orchestrator.prepare("c", domain_xml("c"));
    assert_eq!(orchestrator.toggle(), "a");
    assert_eq!(orchestrator.toggle(), "b");

    assert!(orchestrator.release("b", domain_xml("b")));
    // Releasing the active guest drops focus back to the host.
    assert_eq!(orchestrator.toggle(), "c");
    assert_eq!(orchestrator.toggle(), "host device");
    assert_eq!(orchestrator.toggle(), "a");

    orchestrator.stop();
}

#[test]
fn plugin_sees_every_lifecycle_call_and_every_target_change_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let plugin_log = Arc::clone(&log);
    let orchestrator = Orchestrator::spawn(
        move |_handles| {
            let plugins: Vec<Box<dyn Plugin>> = vec![Box::new(RecordingPlugin { log: plugin_log })];
            plugins
        },
        |_target| {},
    );

    orchestrator.prepare("win10", domain_xml("win10"));
    orchestrator.toggle();
    orchestrator.release("win10", domain_xml("win10"));
    orchestrator.stop();

    let entries = log.lock().unwrap().clone();
    assert_eq!(
        entries,
        vec![
            "prepare:win10".to_string(),
            "target:win10".to_string(),
            "target:host device".to_string(),
            "release:win10".to_string(),
            "stop".to_string(),
        ]
    );
}

#[test]
fn invalid_xml_rejects_prepare_without_registering_a_target() {
    let orchestrator = Orchestrator::spawn(|_handles| Vec::new(), |_target| {});

    assert!(!orchestrator.prepare("broken", "<domain><name>broken</name"));
    // A well-formed Prepare for the same name afterwards still succeeds,
    // proving the failed attempt left no half-registered target behind.
    assert!(orchestrator.prepare("broken", domain_xml("broken")));

    orchestrator.stop();
}

#[test]
fn gpu_plugin_host_override_is_reflected_through_the_focus_handle() {
    let orchestrator = Orchestrator::spawn(
        |handles| {
            // Simulates what the GPU plug-in does when the boot GPU belongs
            // to a guest: declare that guest the effective host.
            handles.host.set_host(Some("win10".to_string()));
            Vec::new()
        },
        |_target| {},
    );

    // Give the orchestrator thread a moment to process the queued SetHost.
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(orchestrator.focus_handle().current(), Target::Guest("win10".to_string()));

    orchestrator.stop();
}

#[test]
fn stop_runs_plugin_teardown_exactly_once_even_if_called_twice() {
    let stopped = Arc::new(AtomicUsize::new(0));

    struct CountingStopPlugin {
        stopped: Arc<AtomicUsize>,
    }
    impl Plugin for CountingStopPlugin {
        fn name(&self) -> &'static str {
            "counting-stop"
        }
        fn prepare(&mut self, _guest: &GuestConfig) -> Result<()> {
            Ok(())
        }
        fn release(&mut self, _guest: &GuestConfig) {}
        fn stop(&mut self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    let plugin_stopped = Arc::clone(&stopped);
    let orchestrator = Orchestrator::spawn(
        move |_handles| {
            let plugins: Vec<Box<dyn Plugin>> = vec![Box::new(CountingStopPlugin { stopped: plugin_stopped })];
            plugins
        },
        |_target| {},
    );

    orchestrator.stop();
    orchestrator.stop();

    assert_eq!(stopped.load(Ordering::SeqCst), 1);
}
