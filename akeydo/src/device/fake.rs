//! In-memory [`Source`]/[`Sink`] doubles, for exercising [`super::ReplicatedDevice`]
//! without a real evdev character device or uinput node.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use super::{InputEvent, Sink, Source, DeviceFactory};

#[derive(Default)]
struct FakeSourceState {
    events: Mutex<VecDeque<InputEvent>>,
    ready: Condvar,
    active_keys: Mutex<BTreeSet<u16>>,
    grabbed: Mutex<bool>,
}

/// A handle tests use to feed events into a device opened through a
/// [`FakeDeviceFactory`], from outside whatever thread is reading it.
#[derive(Clone)]
pub struct FakeSourceHandle(Arc<FakeSourceState>);

impl FakeSourceHandle {
    /// Pushes a key-down event and marks `code` held.
    pub fn push_down(&self, code: u16) {
        self.0.active_keys.lock().unwrap().insert(code);
        self.push(InputEvent::key_down(code));
    }

    /// Pushes a key-up event and marks `code` released.
    pub fn push_up(&self, code: u16) {
        self.0.active_keys.lock().unwrap().remove(&code);
        self.push(InputEvent::key_up(code));
    }

    fn push(&self, event: InputEvent) {
        self.0.events.lock().unwrap().push_back(event);
        self.0.ready.notify_all();
    }
}

struct FakeSource(Arc<FakeSourceState>);

impl Source for FakeSource {
    fn grab(&mut self) -> io::Result<()> {
        *self.0.grabbed.lock().unwrap() = true;
        Ok(())
    }

    fn ungrab(&mut self) -> io::Result<()> {
        *self.0.grabbed.lock().unwrap() = false;
        Ok(())
    }

    fn poll_event(&mut self, timeout: Duration) -> io::Result<Option<InputEvent>> {
        let events = self.0.events.lock().unwrap();
        let (mut events, timed_out) = self.0.ready.wait_timeout_while(events, timeout, |q| q.is_empty())
            .unwrap();
        if timed_out.timed_out() && events.is_empty() {
            return Ok(None);
        }
        Ok(events.pop_front())
    }

    fn active_keys(&self) -> BTreeSet<u16> {
        self.0.active_keys.lock().unwrap().clone()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[derive(Default)]
struct FakeSinkState {
    events: Mutex<Vec<InputEvent>>,
    syncs: AtomicUsize,
    grabbed: Mutex<bool>,
}

struct FakeSink(Arc<FakeSinkState>);

impl Sink for FakeSink {
    fn write_event(&mut self, event: InputEvent) -> io::Result<()> {
        self.0.events.lock().unwrap().push(event);
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.0.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn grab(&mut self) -> io::Result<()> {
        *self.0.grabbed.lock().unwrap() = true;
        Ok(())
    }

    fn ungrab(&mut self) -> io::Result<()> {
        *self.0.grabbed.lock().unwrap() = false;
        Ok(())
    }
}

/// A [`DeviceFactory`] backed entirely by in-memory state, keyed by source
/// path and sink label, with inspection methods for assertions.
#[derive(Default)]
pub struct FakeDeviceFactory {
    sources: Mutex<HashMap<String, Arc<FakeSourceState>>>,
    sinks: Mutex<HashMap<String, Arc<FakeSinkState>>>,
}

impl FakeDeviceFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn source_state(&self, path: &str) -> Arc<FakeSourceState> {
        Arc::clone(
            self.sources
                .lock()
                .unwrap()
                .entry(path.to_string())
                .or_insert_with(|| Arc::new(FakeSourceState::default())),
        )
    }

    /// A handle to push events into the source at `path`, creating it if
    /// it hasn't been opened yet.
    #[must_use]
    pub fn source(&self, path: &str) -> FakeSourceHandle {
        FakeSourceHandle(self.source_state(path))
    }

    /// Whether a sink labeled `label` currently exists.
    #[must_use]
    pub fn sink_exists(&self, label: &str) -> bool {
        self.sinks.lock().unwrap().contains_key(label)
    }

    /// The number of events written to the sink labeled `label`.
    #[must_use]
    pub fn events_written(&self, label: &str) -> usize {
        self.sinks
            .lock()
            .unwrap()
            .get(label)
            .map(|sink| sink.events.lock().unwrap().len())
            .unwrap_or(0)
    }

    /// Whether the source at `path` is currently ungrabbed (never opened
    /// counts as ungrabbed).
    #[must_use]
    pub fn source_ungrabbed(&self, path: &str) -> bool {
        !self
            .sources
            .lock()
            .unwrap()
            .get(path)
            .map(|source| *source.grabbed.lock().unwrap())
            .unwrap_or(false)
    }
}

impl DeviceFactory for FakeDeviceFactory {
    fn open_source(&self, path: &str) -> io::Result<Box<dyn Source>> {
        Ok(Box::new(FakeSource(self.source_state(path))))
    }

    fn create_sink(&self, _source: &dyn Source, label: &str) -> io::Result<Box<dyn Sink>> {
        let state = Arc::new(FakeSinkState::default());
        self.sinks.lock().unwrap().insert(label.to_string(), Arc::clone(&state));
        Ok(Box::new(FakeSink(state)))
    }
}
