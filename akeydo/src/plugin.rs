//! The extension point every resource-shielding concern implements.
//!
//! `Prepare`/`Release` lifecycle hooks driven by libvirt, plus a
//! target-change notification for plug-ins (today, only device replication)
//! that care about focus moving.

use crate::error::Result;
use crate::model::{GuestConfig, Target};

/// A resource-shielding concern hooked into guest lifecycle events.
///
/// Plug-ins are invoked in declaration order on `prepare` and in reverse
/// order on `release`, so a plug-in that depends on another having already
/// acted (CPU shielding depending on huge pages being reserved, say) can
/// rely on ordering rather than querying the other plug-in directly.
pub trait Plugin: Send {
    /// A short name for logging.
    fn name(&self) -> &'static str;

    /// Called before a guest starts, with its parsed domain configuration.
    /// Returning an error aborts the guest's `Prepare` call; plug-ins
    /// already `prepare`d for this guest are rolled back via `release`.
    fn prepare(&mut self, guest: &GuestConfig) -> Result<()>;

    /// Called after a guest stops. Best-effort: a release failure is
    /// logged, not propagated, since there is no further fallback state to
    /// roll back to.
    fn release(&mut self, guest: &GuestConfig);

    /// Called whenever the active target changes, after the change has
    /// taken effect. The default implementation does nothing; only the
    /// device-replication plug-in overrides it.
    fn target_changed(&mut self, _target: &Target) {}

    /// Called once at shutdown, after every guest has been released.
    /// The default implementation does nothing.
    fn stop(&mut self) {}
}
