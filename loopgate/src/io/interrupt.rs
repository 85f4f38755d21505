//! Operator interrupt (SIGINT/SIGTERM) detection.
//!
//! The handler only flips an atomic flag. Long-running waits (agent
//! invocations, readiness polls) check [`requested`] on every tick and unwind
//! cooperatively so done-gate teardown still runs.

use std::sync::atomic::{AtomicBool, Ordering};

static REQUESTED: AtomicBool = AtomicBool::new(false);

/// Whether an interrupt signal has been received.
pub fn requested() -> bool {
    REQUESTED.load(Ordering::SeqCst)
}

/// Install SIGINT and SIGTERM handlers that set the interrupt flag.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn install_handlers() {
    extern "C" fn on_signal(_: libc::c_int) {
        REQUESTED.store(true, Ordering::SeqCst);
    }
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only performs an atomic store, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

#[cfg(not(unix))]
pub fn install_handlers() {}
