//! Signal handling glue: installs handlers for `SIGINT`/`SIGQUIT`/`SIGTERM`
//! that flip a flag the main loop polls, so shutdown runs on the main
//! thread (`Orchestrator::stop`, which itself reverses every plug-in)
//! rather than inside an async-signal-unsafe handler.

use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_signal: c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Installs the handler for each of `SIGINT`, `SIGQUIT`, and `SIGTERM`, so
/// the main loop can stop the orchestrator cleanly instead of dying mid
/// plug-in teardown. A `sigaction(2)` failure here would only happen from a
/// kernel-level misconfiguration (e.g. a restrictive seccomp filter) and is
/// treated as an unrecoverable startup error.
pub fn install() {
    // SAFETY: `on_terminate` only performs an atomic store, which is
    // async-signal-safe; `sigaction` itself is inherently unsafe because it
    // replaces process-wide signal disposition.
    unsafe {
        let action = SigAction::new(SigHandler::Handler(on_terminate), SaFlags::empty(), SigSet::empty());
        for signal in [Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTERM] {
            sigaction(signal, &action).expect("failed to install signal handler");
        }
    }
}

/// Whether a termination signal has been received since [`install`] ran.
#[must_use]
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}
