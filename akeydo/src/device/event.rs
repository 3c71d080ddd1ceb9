//! A minimal, evdev-independent representation of an input event.
//!
//! Keeping this decoupled from `evdev::InputEvent` lets the replicator's
//! [`super::Source`]/[`super::Sink`] traits be exercised against in-memory
//! fakes in tests without touching a real character device or uinput node.

/// The evdev event-type constant for key events (`EV_KEY`).
pub const EV_KEY: u16 = 0x01;
/// The evdev event-type constant for synchronization events (`EV_SYN`).
pub const EV_SYN: u16 = 0x00;

/// A single input event, as read from a source or written to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    /// The evdev event type (`EV_KEY`, `EV_REL`, `EV_SYN`, ...).
    pub event_type: u16,
    /// The event code (e.g. a `KEY_*` code for `EV_KEY`).
    pub code: u16,
    /// The event value. For `EV_KEY`: `1` is key-down, `0` is key-up, `2`
    /// is autorepeat.
    pub value: i32,
}

impl InputEvent {
    /// Builds a key-down (`value == 1`) event for `code`.
    #[must_use]
    pub fn key_down(code: u16) -> Self {
        Self { event_type: EV_KEY, code, value: 1 }
    }

    /// Builds a key-up (`value == 0`) event for `code`.
    #[must_use]
    pub fn key_up(code: u16) -> Self {
        Self { event_type: EV_KEY, code, value: 0 }
    }

    /// Whether this is a key-down event.
    #[must_use]
    pub fn is_key_down(&self) -> bool {
        self.event_type == EV_KEY && self.value == 1
    }
}
