//! SIGINT/SIGTERM → `DispatcherStopHandle::stop` wiring.
//!
//! `Dispatcher::run` blocks the calling thread inside `Chain::run`, so a
//! signal handler cannot call `stop` directly (it only sets a flag, per
//! POSIX async-signal-safety rules); a watcher thread polls that flag and
//! does the actual stopping, mirroring how `netchain::StopHandle` is itself
//! designed to be driven from a thread other than the reactor's own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use nix::sys::signal::{self, SigHandler, Signal};

use dispatcher::DispatcherStopHandle;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown_signal(_: i32) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Install handlers for `SIGINT`/`SIGTERM` and spawn a watcher thread that
/// calls `stop.stop(drain_timeout)` the first time either fires.
pub fn install(stop: DispatcherStopHandle, drain_timeout: Duration) -> nix::Result<()> {
    // SAFETY: the handler only stores to a `static AtomicBool`, the one
    // operation POSIX guarantees is safe from within a signal handler.
    unsafe {
        signal::signal(Signal::SIGINT, SigHandler::Handler(on_shutdown_signal))?;
        signal::signal(Signal::SIGTERM, SigHandler::Handler(on_shutdown_signal))?;
    }

    thread::spawn(move || loop {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            tracing::info!("shutdown signal received, draining and stopping dispatcher");
            stop.stop(drain_timeout);
            break;
        }
        thread::sleep(Duration::from_millis(100));
    });

    Ok(())
}
