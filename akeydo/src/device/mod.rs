//! Shared-device input replication.
//!
//! A [`ReplicatedDevice`] owns one physical source device and fans its
//! events out to one virtual sink per attached target (the host, plus any
//! guest that has requested the device). Three independent chord detectors
//! watch the event stream for the release, toggle, and per-guest hotkeys
//! and report what they see back to the orchestrator; they never mutate
//! orchestrator state directly, which is what lets a `ReplicatedDevice` be
//! constructed without a circular reference to it.

mod event;
pub mod evdev_io;
pub mod fake;

pub use event::{InputEvent, EV_KEY, EV_SYN};

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::focus::FocusHandle;
use crate::model::{Chord, Target};

/// A physical input device this process reads events from.
pub trait Source: Send {
    /// Exclusively grabs the device, so only this process sees its events.
    fn grab(&mut self) -> io::Result<()>;
    /// Releases an exclusive grab taken by [`Source::grab`].
    fn ungrab(&mut self) -> io::Result<()>;
    /// Waits up to `timeout` for the next event. Returns `Ok(None)` on a
    /// timeout with no event, never blocking past `timeout`, so that a
    /// cancellation flag can be checked between polls.
    fn poll_event(&mut self, timeout: Duration) -> io::Result<Option<InputEvent>>;
    /// The key codes currently held down, as tracked by the kernel/evdev
    /// after the most recently read event.
    fn active_keys(&self) -> BTreeSet<u16>;

    /// Exposes the concrete type so a [`DeviceFactory`] can downcast to it
    /// when it needs source-specific state (e.g. capability cloning for a
    /// real evdev source) that doesn't belong on this trait.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// A virtual device events are replicated to.
pub trait Sink: Send {
    /// Writes a single event to the device.
    fn write_event(&mut self, event: InputEvent) -> io::Result<()>;
    /// Emits an `EV_SYN` report, flushing any events written since the last
    /// sync.
    fn sync(&mut self) -> io::Result<()>;
    /// Exclusively grabs the device.
    fn grab(&mut self) -> io::Result<()>;
    /// Releases an exclusive grab.
    fn ungrab(&mut self) -> io::Result<()>;
}

/// Opens sources and creates sinks. Production code backs this with real
/// evdev/uinput devices; tests back it with in-memory fakes.
pub trait DeviceFactory: Send + Sync {
    /// Opens the source device at `path`.
    ///
    /// # Errors
    ///
    /// Propagates the underlying I/O error (device missing, wrong type,
    /// permission denied).
    fn open_source(&self, path: &str) -> io::Result<Box<dyn Source>>;

    /// Creates a new sink cloning `source`'s capabilities, labeled for the
    /// given target (e.g. `"host"` or a guest name), and publishes it at
    /// the conventional `/dev/input/by-id/<label>-<device>` path.
    ///
    /// # Errors
    ///
    /// Propagates the underlying I/O error.
    fn create_sink(&self, source: &dyn Source, label: &str) -> io::Result<Box<dyn Sink>>;
}

/// What a chord detector reports back to the orchestrator. Sent
/// fire-and-forget; the replicator thread never waits on a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicatorEvent {
    /// The release chord fired: flip `released`, without touching
    /// `active_target`.
    Released,
    /// The toggle chord fired: advance to the next element of the ring.
    Toggled,
    /// A direct-target chord fired: jump straight to this target.
    TargetSet(Target),
}

fn target_label(target: &Target) -> String {
    match target {
        Target::Host => "host".to_string(),
        Target::Guest(name) => name.clone(),
    }
}

struct State {
    source: Option<Box<dyn Source>>,
    sinks: HashMap<Target, Box<dyn Sink>>,
    hotkeys: HashMap<Chord, Target>,
}

struct Inner {
    source_path: String,
    device_name: String,
    factory: Arc<dyn DeviceFactory>,
    focus: FocusHandle,
    events_tx: mpsc::Sender<ReplicatorEvent>,
    delay: Duration,
    qemu_chord: Chord,
    release_chord: Option<Chord>,
    toggle_chord: Chord,
    /// `devices.by_id` devices: never torn down just because the guest
    /// count dropped to zero, only on an explicit [`ReplicatedDevice::stop`].
    always_on: bool,
    state: Mutex<State>,
    cancel: AtomicBool,
    threads: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

/// Manages replication of one physical device across the host and any
/// guests that have requested it.
///
/// Cheap to clone: internally an `Arc`, so the orchestrator can hand copies
/// to its plug-ins without fighting the borrow checker.
#[derive(Clone)]
pub struct ReplicatedDevice {
    inner: Arc<Inner>,
}

impl ReplicatedDevice {
    /// Builds a device manager for the source at `source_path`. The source
    /// is not opened, and no threads are spawned, until the first
    /// [`ReplicatedDevice::attach`] call.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_path: impl Into<String>,
        factory: Arc<dyn DeviceFactory>,
        focus: FocusHandle,
        events_tx: mpsc::Sender<ReplicatorEvent>,
        delay: Duration,
        qemu_chord: Chord,
        release_chord: Option<Chord>,
        toggle_chord: Chord,
        host_hotkey: Option<Chord>,
        always_on: bool,
    ) -> Self {
        let source_path = source_path.into();
        let device_name = source_path
            .rsplit('/')
            .next()
            .unwrap_or(&source_path)
            .to_string();
        let mut hotkeys = HashMap::new();
        if let Some(chord) = host_hotkey {
            hotkeys.insert(chord, Target::Host);
        }
        Self {
            inner: Arc::new(Inner {
                source_path,
                device_name,
                factory,
                focus,
                events_tx,
                delay,
                qemu_chord,
                release_chord,
                toggle_chord,
                always_on,
                state: Mutex::new(State {
                    source: None,
                    sinks: HashMap::new(),
                    hotkeys,
                }),
                cancel: AtomicBool::new(false),
                threads: Mutex::new(None),
            }),
        }
    }

    /// Attaches `target`, creating its sink (opening the source and
    /// spawning the grab/replicate threads first, if this is the first
    /// attachment). Registers `hotkey` as a direct switch to `target`, if
    /// given.
    pub fn attach(&self, target: Target, hotkey: Option<Chord>) {
        if let Some(chord) = hotkey {
            self.inner
                .state
                .lock()
                .unwrap()
                .hotkeys
                .insert(chord, target.clone());
        }
        self.start();
        self.create_sink(target);
    }

    /// Detaches `target`, destroying its sink and removing `hotkey` from
    /// the monitored set. Once only the host sink remains, the whole
    /// device is torn down: with no guest left to replicate to, there's
    /// nothing left to watch the physical device for.
    pub fn detach(&self, target: Target, hotkey: Option<Chord>) {
        let remaining = {
            let mut state = self.inner.state.lock().unwrap();
            state.sinks.remove(&target);
            if let Some(chord) = hotkey {
                state.hotkeys.remove(&chord);
            }
            state.sinks.len()
        };
        if remaining <= 1 && !self.inner.always_on {
            self.stop();
        }
    }

    /// Forces the sink for the currently active target to grab itself,
    /// then feeds it the configured QEMU chord as a synthetic key-down and
    /// key-up. Used to make a freshly-focused guest notice devices it
    /// hasn't grabbed yet. A no-op if there is no sink for the current
    /// target, or if the sink can't be grabbed.
    pub fn force_grab(&self) {
        let target = self.inner.focus.current();
        let mut state = self.inner.state.lock().unwrap();
        let Some(sink) = state.sinks.get_mut(&target) else {
            return;
        };
        if sink.grab().is_err() {
            return;
        }
        let _ = sink.ungrab();
        debug!(device = %self.inner.device_name, %target, "forcing grab");
        for value in [1, 0] {
            for code in self.inner.qemu_chord.keys() {
                let _ = sink.write_event(InputEvent { event_type: EV_KEY, code, value });
            }
        }
        let _ = sink.sync();
    }

    /// Stops replicating this device entirely: cancels the grab/replicate
    /// threads, destroys every sink, and ungrabs and closes the source.
    /// Idempotent.
    pub fn stop(&self) {
        self.inner.cancel.store(true, Ordering::Relaxed);
        if let Some((grab, replicate)) = self.inner.threads.lock().unwrap().take() {
            let _ = grab.join();
            let _ = replicate.join();
        }
        self.inner.cancel.store(false, Ordering::Relaxed);

        let mut state = self.inner.state.lock().unwrap();
        state.sinks.clear();
        if let Some(mut source) = state.source.take() {
            let _ = source.ungrab();
            info!(device = %self.inner.device_name, "ungrabbed source device");
        }
    }

    fn start(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.source.is_none() {
                let mut source = match self.inner.factory.open_source(&self.inner.source_path) {
                    Ok(source) => source,
                    Err(err) => {
                        warn!(device = %self.inner.device_name, error = %err, "failed to open source device");
                        return;
                    }
                };
                let _ = source.grab();
                let host_sink = self
                    .inner
                    .factory
                    .create_sink(source.as_ref(), &target_label(&Target::Host))
                    .ok();
                state.source = Some(source);
                if let Some(sink) = host_sink {
                    state.sinks.insert(Target::Host, sink);
                }
            }
        }

        let mut threads = self.inner.threads.lock().unwrap();
        if threads.is_none() {
            self.inner.cancel.store(false, Ordering::Relaxed);
            let grab_inner = Arc::clone(&self.inner);
            let replicate_inner = Arc::clone(&self.inner);
            let grab = thread::Builder::new()
                .name(format!("grab:{}", self.inner.device_name))
                .spawn(move || run_grab_loop(&grab_inner))
                .expect("failed to spawn grab thread");
            let replicate = thread::Builder::new()
                .name(format!("replicate:{}", self.inner.device_name))
                .spawn(move || run_replicate_loop(&replicate_inner))
                .expect("failed to spawn replicate thread");
            *threads = Some((grab, replicate));
        }
    }

    fn create_sink(&self, target: Target) {
        let mut state = self.inner.state.lock().unwrap();
        if state.sinks.contains_key(&target) {
            return;
        }
        let Some(source) = state.source.as_deref() else {
            return;
        };
        match self.inner.factory.create_sink(source, &target_label(&target)) {
            Ok(sink) => {
                info!(device = %self.inner.device_name, %target, "created replicated sink");
                state.sinks.insert(target, sink);
            }
            Err(err) => {
                warn!(device = %self.inner.device_name, %target, error = %err, "failed to create sink");
            }
        }
    }
}

/// Re-grabs the source every ten seconds, tolerating any I/O error as a
/// transient condition (device temporarily unplugged or busy).
fn run_grab_loop(inner: &Inner) {
    while !inner.cancel.load(Ordering::Relaxed) {
        {
            let mut state = inner.state.lock().unwrap();
            if let Some(source) = state.source.as_mut() {
                let _ = source.grab();
            }
        }
        sleep_cancellable(&inner.cancel, Duration::from_secs(10));
    }
}

/// Sleeps for `total`, checking `cancel` every 200ms so cancellation is
/// observed promptly rather than only once per full sleep.
fn sleep_cancellable(cancel: &AtomicBool, total: Duration) {
    let step = Duration::from_millis(200);
    let mut waited = Duration::ZERO;
    while waited < total {
        if cancel.load(Ordering::Relaxed) {
            return;
        }
        let chunk = step.min(total - waited);
        thread::sleep(chunk);
        waited += chunk;
    }
}

/// Syncs the sink for the currently active target and sleeps the
/// configured debounce delay. Returns whether a current sink existed at
/// all; detectors only fire when it did, since there is nothing to hand
/// a chord off to otherwise.
fn flush_and_delay(inner: &Inner) -> bool {
    let target = inner.focus.current();
    let had_sink = {
        let mut state = inner.state.lock().unwrap();
        match state.sinks.get_mut(&target) {
            Some(sink) => {
                let _ = sink.sync();
                true
            }
            None => false,
        }
    };
    if had_sink {
        thread::sleep(inner.delay);
    }
    had_sink
}

/// Polls the source for events, forwards them to the current sink first
/// (pass-through happens before chord detection, so an outgoing sink still
/// receives every key-up event in a chord), then runs the three
/// independent chord detectors against `EV_KEY` events.
fn run_replicate_loop(inner: &Inner) {
    let mut release_armed = false;
    let mut toggle_armed = false;
    let mut hotkey_armed: Option<Chord> = None;

    while !inner.cancel.load(Ordering::Relaxed) {
        let event = {
            let mut state = inner.state.lock().unwrap();
            let Some(source) = state.source.as_mut() else {
                break;
            };
            match source.poll_event(Duration::from_millis(200)) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(_) => break,
            }
        };

        let target = inner.focus.current();
        {
            let mut state = inner.state.lock().unwrap();
            if let Some(sink) = state.sinks.get_mut(&target) {
                let _ = sink.write_event(event);
            }
        }

        if event.event_type != EV_KEY {
            continue;
        }

        let active_keys = {
            let state = inner.state.lock().unwrap();
            state.source.as_deref().map(Source::active_keys).unwrap_or_default()
        };

        if event.is_key_down() && inner.release_chord.as_ref().is_some_and(|c| c.matches(&active_keys)) {
            release_armed = true;
        } else if release_armed && active_keys.is_empty() && flush_and_delay(inner) {
            release_armed = false;
            let _ = inner.events_tx.send(ReplicatorEvent::Released);
        }

        if event.is_key_down() && inner.toggle_chord.matches(&active_keys) {
            toggle_armed = true;
        } else if toggle_armed && active_keys.is_empty() && flush_and_delay(inner) {
            toggle_armed = false;
            let _ = inner.events_tx.send(ReplicatorEvent::Toggled);
        }

        if event.is_key_down() {
            let matched = {
                let state = inner.state.lock().unwrap();
                state
                    .hotkeys
                    .keys()
                    .find(|chord| chord.matches(&active_keys))
                    .cloned()
            };
            if matched.is_some() {
                hotkey_armed = matched;
            }
        } else if let Some(chord) = hotkey_armed.clone() {
            if active_keys.is_empty() && flush_and_delay(inner) {
                let resolved = inner.state.lock().unwrap().hotkeys.get(&chord).cloned();
                hotkey_armed = None;
                if let Some(target) = resolved {
                    let _ = inner.events_tx.send(ReplicatorEvent::TargetSet(target));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeDeviceFactory;
    use crate::focus::{FocusHandle, FocusState};
    use std::sync::Mutex as StdMutex;

    fn handle(state: FocusState) -> FocusHandle {
        FocusHandle::new(Arc::new(StdMutex::new(state)))
    }

    fn new_device(
        factory: Arc<FakeDeviceFactory>,
        focus: FocusHandle,
        tx: mpsc::Sender<ReplicatorEvent>,
    ) -> ReplicatedDevice {
        ReplicatedDevice::new(
            "/dev/input/by-id/kbd",
            factory,
            focus,
            tx,
            Duration::from_millis(5),
            Chord::new([29, 97]),
            Some(Chord::new([125])),
            Chord::new([29, 56]),
            None,
            false,
        )
    }

    #[test]
    fn attach_creates_host_and_guest_sinks() {
        let factory = Arc::new(FakeDeviceFactory::new());
        let focus = handle(FocusState::default());
        let (tx, _rx) = mpsc::channel();
        let device = new_device(Arc::clone(&factory), focus, tx);

        device.attach(Target::Guest("win10".into()), None);
        std::thread::sleep(Duration::from_millis(20));

        assert!(factory.sink_exists("host"));
        assert!(factory.sink_exists("win10"));
        device.stop();
    }

    #[test]
    fn pass_through_reaches_active_target_before_chord_fires() {
        let factory = Arc::new(FakeDeviceFactory::new());
        let focus = handle(FocusState {
            active_target: Target::Guest("win10".into()),
            host_override: None,
            released: false,
        });
        let (tx, rx) = mpsc::channel();
        let device = new_device(Arc::clone(&factory), focus, tx);
        device.attach(Target::Guest("win10".into()), None);

        let source = factory.source("/dev/input/by-id/kbd");
        source.push_down(30); // KEY_A, unrelated to any chord
        source.push_up(30);
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(factory.events_written("win10"), 2);
        assert!(rx.try_recv().is_err());
        device.stop();
    }

    #[test]
    fn toggle_chord_fires_after_full_release_with_debounce() {
        let factory = Arc::new(FakeDeviceFactory::new());
        let focus = handle(FocusState::default());
        let (tx, rx) = mpsc::channel();
        let device = new_device(Arc::clone(&factory), focus, tx);
        device.attach(Target::Host, None);

        let source = factory.source("/dev/input/by-id/kbd");
        source.push_down(29);
        source.push_down(56);
        source.push_up(29);
        source.push_up(56);

        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(event, ReplicatorEvent::Toggled);
        device.stop();
    }

    #[test]
    fn extra_key_held_before_the_chord_prevents_it_from_ever_arming() {
        let factory = Arc::new(FakeDeviceFactory::new());
        let focus = handle(FocusState::default());
        let (tx, rx) = mpsc::channel();
        let device = new_device(Arc::clone(&factory), focus, tx);
        device.attach(Target::Host, None);

        let source = factory.source("/dev/input/by-id/kbd");
        // Key 2 is already held by the time 29+56 go down, so `active_keys`
        // never equals the chord exactly and the detector never arms.
        source.push_down(2);
        source.push_down(29);
        source.push_down(56);
        source.push_up(2);
        source.push_up(29);
        source.push_up(56);
        std::thread::sleep(Duration::from_millis(30));

        assert!(rx.try_recv().is_err());
        device.stop();
    }

    #[test]
    fn toggle_chord_held_as_a_subset_of_a_larger_held_group_still_fires_once_released() {
        let factory = Arc::new(FakeDeviceFactory::new());
        let focus = handle(FocusState::default());
        let (tx, rx) = mpsc::channel();
        let device = new_device(Arc::clone(&factory), focus, tx);
        device.attach(Target::Host, None);

        let source = factory.source("/dev/input/by-id/kbd");
        // The chord {29,56} matches exactly the instant 56 goes down; the
        // extra key 2 held afterwards doesn't re-arm or disarm the
        // detector (the state table has no "reset while armed"
        // transition), so it still fires once every key releases.
        source.push_down(29);
        source.push_down(56);
        source.push_down(2);
        source.push_up(29);
        source.push_up(56);
        source.push_up(2);

        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(event, ReplicatorEvent::Toggled);
        device.stop();
    }

    #[test]
    fn guest_hotkey_sets_target_directly() {
        let factory = Arc::new(FakeDeviceFactory::new());
        let focus = handle(FocusState::default());
        let (tx, rx) = mpsc::channel();
        let device = new_device(Arc::clone(&factory), focus, tx);
        device.attach(Target::Guest("win10".into()), Some(Chord::new([30])));

        let source = factory.source("/dev/input/by-id/kbd");
        source.push_down(30);
        source.push_up(30);

        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(event, ReplicatorEvent::TargetSet(Target::Guest("win10".into())));
        device.stop();
    }

    #[test]
    fn detaching_down_to_host_only_stops_the_device() {
        let factory = Arc::new(FakeDeviceFactory::new());
        let focus = handle(FocusState::default());
        let (tx, _rx) = mpsc::channel();
        let device = new_device(Arc::clone(&factory), focus, tx);
        device.attach(Target::Guest("win10".into()), None);
        std::thread::sleep(Duration::from_millis(20));
        assert!(factory.sink_exists("win10"));

        device.detach(Target::Guest("win10".into()), None);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!factory.sink_exists("win10"));
        assert!(!factory.sink_exists("host"));
        assert!(factory.source_ungrabbed("/dev/input/by-id/kbd"));
    }

    #[test]
    fn always_on_device_survives_dropping_to_host_only() {
        let factory = Arc::new(FakeDeviceFactory::new());
        let focus = handle(FocusState::default());
        let (tx, _rx) = mpsc::channel();
        let device = ReplicatedDevice::new(
            "/dev/input/by-id/kbd",
            Arc::clone(&factory),
            focus,
            tx,
            Duration::from_millis(5),
            Chord::new([29, 97]),
            None,
            Chord::new([29, 56]),
            None,
            true,
        );
        device.attach(Target::Guest("win10".into()), None);
        std::thread::sleep(Duration::from_millis(20));
        device.detach(Target::Guest("win10".into()), None);
        std::thread::sleep(Duration::from_millis(20));

        assert!(factory.sink_exists("host"));
        assert!(!factory.source_ungrabbed("/dev/input/by-id/kbd"));
        device.stop();
    }
}
