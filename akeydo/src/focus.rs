//! The orchestrator's focus state, and a read-only handle replicators use
//! to resolve it without pulling in a full reference to the orchestrator.
//!
//! Breaks what would otherwise be a cyclic orchestrator↔replicator
//! reference: the replicator borrows orchestrator state through a thin
//! read-only interface and never owns the orchestrator itself.

use std::sync::{Arc, Mutex};

use crate::model::Target;

/// The orchestrator fields that determine which sink currently receives
/// events. Mutated only on the orchestrator's own thread; read (via
/// [`FocusHandle`]) from any replicator thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusState {
    /// The current element of the target ring.
    pub active_target: Target,
    /// A guest that has assumed the host's role (boot GPU reassigned to
    /// it), if any.
    pub host_override: Option<String>,
    /// When true, events are steered to the host sink regardless of
    /// `active_target`, without altering it.
    pub released: bool,
}

impl Default for FocusState {
    fn default() -> Self {
        Self {
            active_target: Target::Host,
            host_override: None,
            released: false,
        }
    }
}

impl FocusState {
    /// The target that should actually receive events right now.
    /// `released` and the active ring position are independent: a release
    /// steers everything to the host sink without disturbing which guest
    /// the ring is parked on, so toggling resumes there once re-armed.
    #[must_use]
    pub fn effective_target(&self) -> Target {
        if self.released {
            return self.host_target();
        }
        if self.active_target == Target::Host {
            self.host_target()
        } else {
            self.active_target.clone()
        }
    }

    fn host_target(&self) -> Target {
        match &self.host_override {
            Some(name) => Target::Guest(name.clone()),
            None => Target::Host,
        }
    }
}

/// A cheaply-clonable, read-only view onto the orchestrator's focus state.
#[derive(Debug, Clone, Default)]
pub struct FocusHandle(Arc<Mutex<FocusState>>);

impl FocusHandle {
    /// Creates a new handle sharing the given backing state. The
    /// orchestrator retains the write side; this type only exposes reads.
    #[must_use]
    pub fn new(state: Arc<Mutex<FocusState>>) -> Self {
        Self(state)
    }

    /// Snapshots the currently effective target.
    #[must_use]
    pub fn current(&self) -> Target {
        self.0.lock().unwrap().effective_target()
    }
}
