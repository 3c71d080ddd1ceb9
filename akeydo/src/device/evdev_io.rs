//! Real evdev/uinput-backed [`Source`]/[`Sink`]/[`DeviceFactory`] implementations.

use std::collections::{BTreeSet, VecDeque};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::PathBuf;
use std::time::Duration;

use evdev::uinput::VirtualDeviceBuilder;
use evdev::{Device, EventType, InputEvent as EvdevInputEvent};
use nix::poll::{poll, PollFd, PollFlags};
use tracing::debug;

use super::{InputEvent, Sink, Source, DeviceFactory};

/// A physical character device opened for exclusive reading.
pub struct EvdevSource {
    device: Device,
    name: String,
    pending: VecDeque<InputEvent>,
}

impl EvdevSource {
    fn open(path: &str) -> io::Result<Self> {
        let device = Device::open(path)?;
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        Ok(Self { device, name, pending: VecDeque::new() })
    }
}

impl Source for EvdevSource {
    fn grab(&mut self) -> io::Result<()> {
        self.device.grab()
    }

    fn ungrab(&mut self) -> io::Result<()> {
        self.device.ungrab()
    }

    fn poll_event(&mut self, timeout: Duration) -> io::Result<Option<InputEvent>> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }

        let raw_fd = self.device.as_raw_fd();
        // SAFETY: `raw_fd` is owned by `self.device` and outlives this poll call.
        let borrowed = unsafe { BorrowedFd::borrow_raw(raw_fd) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        let ready = poll(&mut fds, timeout.as_millis() as i32).map_err(io::Error::from)?;
        if ready == 0 {
            return Ok(None);
        }

        for event in self.device.fetch_events()? {
            self.pending.push_back(translate(event));
        }
        Ok(self.pending.pop_front())
    }

    fn active_keys(&self) -> BTreeSet<u16> {
        self.device
            .get_key_state()
            .map(|keys| keys.iter().map(|key| key.code()).collect())
            .unwrap_or_default()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn translate(event: EvdevInputEvent) -> InputEvent {
    InputEvent {
        event_type: event.event_type().0,
        code: event.code(),
        value: event.value(),
    }
}

/// A virtual uinput device cloning a source's key capabilities, symlinked
/// under `/dev/input/by-id/<label>-<device>`.
pub struct EvdevSink {
    device: evdev::uinput::VirtualDevice,
    link_path: PathBuf,
}

impl Sink for EvdevSink {
    fn write_event(&mut self, event: InputEvent) -> io::Result<()> {
        let event = EvdevInputEvent::new(EventType(event.event_type), event.code, event.value);
        self.device.emit(&[event])
    }

    fn sync(&mut self) -> io::Result<()> {
        let event = EvdevInputEvent::new(EventType::SYNCHRONIZATION, 0, 0);
        self.device.emit(&[event])
    }

    fn grab(&mut self) -> io::Result<()> {
        self.device.grab()
    }

    fn ungrab(&mut self) -> io::Result<()> {
        self.device.ungrab()
    }
}

impl Drop for EvdevSink {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.link_path);
    }
}

/// Builds real evdev sources and uinput sinks.
#[derive(Debug, Default)]
pub struct EvdevDeviceFactory;

impl DeviceFactory for EvdevDeviceFactory {
    fn open_source(&self, path: &str) -> io::Result<Box<dyn Source>> {
        Ok(Box::new(EvdevSource::open(path)?))
    }

    fn create_sink(&self, source: &dyn Source, label: &str) -> io::Result<Box<dyn Sink>> {
        let source = source.as_any().downcast_ref::<EvdevSource>().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "create_sink given a non-evdev source")
        })?;

        let keys = source.device.supported_keys().map(|set| set.to_owned());
        let mut builder = VirtualDeviceBuilder::new()?.name(&format!("akeydo-{label}"));
        if let Some(keys) = keys {
            builder = builder.with_keys(&keys)?;
        }
        let mut device = builder.build()?;

        let mut nodes = device.enumerate_dev_nodes_blocking()?;
        let node_path = match nodes.next() {
            Some(Ok(path)) => path,
            Some(Err(err)) => return Err(err),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "uinput device produced no /dev/input node",
                ))
            }
        };
        drop(nodes);

        let link_path = PathBuf::from(format!("/dev/input/by-id/{label}-{}", source.name));
        if link_path.is_symlink() {
            debug!(path = %link_path.display(), "removing stale symlink");
            let _ = std::fs::remove_file(&link_path);
        }
        std::os::unix::fs::symlink(&node_path, &link_path)?;

        Ok(Box::new(EvdevSink { device, link_path }))
    }
}
