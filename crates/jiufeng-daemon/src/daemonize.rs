//! Background detach for `!foreground` runs (`spec.md §6`: `-f` "run in
//! foreground"; implied default is to detach).
//!
//! The double-fork, `setsid`, redirect-standard-fds sequence is the
//! textbook Unix daemonization recipe; `nix`'s `unistd`/`fcntl` wrappers
//! stand in for the original's raw `fork(2)`/`setsid(2)` calls.

use std::os::fd::RawFd;

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{close, dup2, fork, setsid, ForkResult};

pub fn daemonize() -> nix::Result<()> {
    // SAFETY: called once, early in `main`, before any threads exist —
    // `fork` in a multi-threaded process is the unsound case this avoids.
    match unsafe { fork()? } {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid()?;

    // SAFETY: see above; still single-threaded (the first fork's child).
    match unsafe { fork()? } {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    redirect_standard_fds()
}

fn redirect_standard_fds() -> nix::Result<()> {
    let devnull: RawFd = open("/dev/null", OFlag::O_RDWR, Mode::empty())?;
    for fd in [0, 1, 2] {
        dup2(devnull, fd)?;
    }
    if devnull > 2 {
        close(devnull)?;
    }
    Ok(())
}
