//! Single-threaded reactor chain (`spec.md §4.C`/`§5`).
//!
//! A [`Chain`] owns an ordered list of [`ChainObject`]s and a self-pipe
//! wake channel, and drives them through the original's four-step
//! iteration: zero interest, pre-select every object (collecting the
//! smallest requested block time), a single multiplexed wait, then
//! post-select every object. Exactly one thread ever calls [`Chain::run`];
//! every `ChainObject` implementation in this crate is `!Send` by design
//! (state is only ever touched from that thread — `spec.md §5`).
//!
//! `mio::Poll`/`mio::Events` stands in for the original's `select()` over
//! `fd_set`s: each object registers its own sources once via
//! [`ChainObject::register`] and reacts to the shared [`mio::Events`] list
//! in `post_select`, matching the "iterate the three fd sets" contract
//! without needing per-token dispatch plumbing in the chain itself.

mod acsocket;
mod asocket;
pub mod buffer;
mod assocket;
pub mod error;
mod invariants;
pub mod utimer;

pub use acsocket::{Acsocket, ConnHandle};
pub use asocket::{Asocket, AsocketHandler, AsocketId, ConnState, Outbox};
pub use assocket::Assocket;
pub use buffer::JiukunBuffer;
pub use error::{AsocketError, ChainError, DisconnectReason};
pub use utimer::{TimerKey, Utimer, UtimerHandle};

use std::cell::Cell;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::unix::pipe;
use mio::{Events, Poll, Registry, Token};

/// A shared counter handing out `mio::Token`s unique within one `Chain`.
///
/// Every source registered against a single `mio::Poll` needs a distinct
/// `Token` — two fds sharing one would make `post_select` dispatch
/// readiness to the wrong object. A plain per-object counter (e.g. an
/// `Assocket` numbering its own accepted connections from its listener's
/// token) is not enough once more than one such object shares a chain, since
/// each would restart its own count from a value another object already
/// claimed. Cloning a `TokenAllocator` shares the same underlying counter
/// (`Rc<Cell<_>>`, matching every other cross-object handle in this crate
/// that never leaves the chain thread), so every chain object that needs to
/// mint tokens for connections it accepts or dials draws from the same
/// sequence as the chain itself.
#[derive(Clone)]
pub struct TokenAllocator(Rc<Cell<usize>>);

impl TokenAllocator {
    #[must_use]
    pub fn alloc(&self) -> Token {
        let next = self.0.get();
        self.0.set(next + 1);
        Token(next)
    }
}

/// One participant in the reactor: declares interest before the wait and
/// reacts to readiness after it.
pub trait ChainObject {
    /// Register this object's sources with `registry`. Called exactly once,
    /// when the object is appended to the chain.
    fn register(&mut self, registry: &Registry) -> io::Result<()>;

    /// Called before the multiplexed wait. Returns the largest block
    /// duration this object is willing to tolerate, or `None` for no
    /// preference (the loop default is "infinite" until some object
    /// contributes a bound — matching `utimer`, which always does once it
    /// holds an item).
    fn pre_select(&mut self) -> Option<Duration>;

    /// Called after the wait, once per iteration, with the full readiness
    /// list. Implementations filter `events` for their own token(s).
    /// Errors are logged by the chain and never abort the loop
    /// (`spec.md §7`: "the chain itself never exits because of a callback
    /// error").
    fn post_select(&mut self, events: &Events) -> io::Result<()>;
}

const WAKE_TOKEN: Token = Token(0);

struct WakeObject {
    receiver: pipe::Receiver,
}

impl ChainObject for WakeObject {
    fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.receiver, WAKE_TOKEN, mio::Interest::READABLE)
    }

    fn pre_select(&mut self) -> Option<Duration> {
        None
    }

    fn post_select(&mut self, events: &Events) -> io::Result<()> {
        if events.iter().any(|e| e.token() == WAKE_TOKEN) {
            let mut drain = [0u8; 64];
            loop {
                match self.receiver.read(&mut drain) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

/// The reactor: one `mio::Poll`, a wake pipe, and an ordered object list.
///
/// `ChainObject`s are appended in any order; the chain does not reorder
/// them. Every object is torn down (dropped) when the `Chain` itself is
/// dropped — ownership flows one way, chain to objects, never back
/// (`spec.md` DESIGN NOTES: "express this as one-way ownership").
pub struct Chain {
    poll: Poll,
    objects: Vec<Box<dyn ChainObject>>,
    running: Arc<AtomicBool>,
    wake_sender: pipe::Sender,
    wake_fd: Arc<OwnedFd>,
    tokens: TokenAllocator,
}

impl Chain {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let (sender, receiver) = pipe::new()?;
        let wake_fd = dup_as_owned_fd(sender.as_raw_fd())?;
        let mut wake = WakeObject { receiver };
        wake.register(poll.registry())?;

        Ok(Self {
            poll,
            objects: vec![Box::new(wake)],
            running: Arc::new(AtomicBool::new(false)),
            wake_sender: sender,
            wake_fd: Arc::new(wake_fd),
            tokens: TokenAllocator(Rc::new(Cell::new(1))),
        })
    }

    /// Access to the poll registry, for objects that need to register
    /// additional sources beyond the one passed to `append`.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Allocate a fresh `mio::Token` unique within this chain, for objects
    /// that manage more than one source (e.g. `Assocket`'s pool of
    /// accepted connections).
    pub fn next_token(&mut self) -> Token {
        self.tokens.alloc()
    }

    /// A cloneable handle onto this chain's token counter. Pass one to each
    /// `Assocket`/`Acsocket` built for this chain so every connection they
    /// accept or dial draws its `Token` from the same sequence as the chain
    /// itself and as every other object sharing it — see [`TokenAllocator`].
    #[must_use]
    pub fn token_allocator(&self) -> TokenAllocator {
        self.tokens.clone()
    }

    /// Append a chain object, registering its sources. The chain owns it
    /// from this point on.
    pub fn append(&mut self, mut object: Box<dyn ChainObject>) -> io::Result<()> {
        object.register(self.poll.registry())?;
        self.objects.push(object);
        Ok(())
    }

    /// A cloneable flag a caller may poll from another thread to notice
    /// when the chain has stopped (the chain itself runs on one thread
    /// only; this is read-only outside observation).
    #[must_use]
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Stop the loop. Safe to call from any thread: writes one byte to the
    /// wake pipe so a blocked `poll.poll` returns immediately, then the
    /// running loop drains one final iteration and returns
    /// (`spec.md §4.C`).
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: Arc::clone(&self.running),
            wake_fd: Arc::clone(&self.wake_fd),
        }
    }

    fn wake(&mut self) {
        let _ = self.wake_sender.write(&[1u8]);
    }

    /// Run the reactor loop until `stop_handle().stop()` is called.
    pub fn run(&mut self) -> io::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let mut events = Events::with_capacity(256);

        loop {
            let mut timeout: Option<Duration> = None;
            for object in &mut self.objects {
                if let Some(bound) = object.pre_select() {
                    timeout = Some(match timeout {
                        Some(existing) if existing <= bound => existing,
                        _ => bound,
                    });
                }
            }

            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for object in &mut self.objects {
                if let Err(e) = object.post_select(&events) {
                    tracing::warn!(error = %e, "chain object post_select failed; continuing");
                }
            }

            if !self.running.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
    }
}

/// A handle used to request the reactor stop, from any thread.
///
/// Holds its own duplicate of the wake pipe's write end so `stop()` can
/// write to it without touching the `Chain` (which lives on the reactor
/// thread) — matching the original's `stop_chain`, callable from any
/// thread, writing one byte so the blocked `select()`-equivalent returns
/// immediately regardless of how far away the next utimer deadline is.
#[derive(Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
    wake_fd: Arc<OwnedFd>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = nix::unistd::write(self.wake_fd.as_ref(), &[1u8]);
    }
}

fn dup_as_owned_fd(fd: std::os::fd::RawFd) -> io::Result<OwnedFd> {
    let dup = nix::unistd::dup(fd).map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
    // SAFETY: `dup` just returned a freshly-duplicated, uniquely-owned fd.
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn liveness_stop_returns_promptly_with_far_future_utimer() {
        // `Chain` holds `Box<dyn ChainObject>`, trait objects that are
        // `!Send` by design (the objects behind them use `Rc`), so the
        // chain itself never moves to another thread: it runs on whichever
        // thread calls `run`. Only `StopHandle` (backed by `Arc`) crosses
        // threads, here to simulate an external signal arriving mid-wait.
        let mut chain = Chain::new().unwrap();
        let mut utimer = crate::Utimer::new();
        utimer.handle().schedule(Duration::from_secs(3600), || {}, || {});
        chain.append(Box::new(utimer)).unwrap();

        let stop = chain.stop_handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stop.stop();
        });

        let start = Instant::now();
        chain.run().unwrap();
        stopper.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
