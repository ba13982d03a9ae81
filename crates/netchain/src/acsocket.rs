//! Fixed-capacity pool of outbound connection slots (`spec.md §4.C`).

use std::cell::RefCell;
use std::io;
use std::path::Path;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jiukun_slab::Jiukun;
use mio::net::UnixStream;
use mio::{Events, Registry};

use crate::asocket::{Asocket, AsocketHandler, AsocketId};
use crate::{AsocketError, ChainObject, ConnState, TokenAllocator};

/// A handle to one outbound connection slot, returned by `connect_to`.
/// Opaque beyond identity — callers address the connection by `close`/
/// `send` through the owning `Acsocket`, not by reaching into the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnHandle(pub(crate) AsocketId);

impl ConnHandle {
    /// The slot index backing this connection, i.e. the same `AsocketId`
    /// that `AsocketHandler` callbacks receive for it. Callers that hand
    /// out their own handles alongside `ConnHandle` (e.g. to route a
    /// callback `id` back to caller-side per-connection state) need this to
    /// build that mapping themselves — a fresh `connect_to` may land in a
    /// slot a previous, now-closed connection used, so the mapping cannot
    /// be assumed from call order alone.
    #[must_use]
    pub fn raw(&self) -> AsocketId {
        self.0
    }
}

/// Outbound connection pool: `capacity` slots, each free or bound to an
/// `Asocket`. `used` is guarded independently by a mutex so slot claims
/// (`spec.md §4.C`: "a mutex protects the free/used marking") are cheap
/// and safe to perform from whichever thread calls `connect_to`, even
/// though the `Asocket`s themselves are only ever touched on the chain
/// thread that runs `post_select`.
pub struct Acsocket {
    pool: Arc<Jiukun>,
    handler: Rc<RefCell<dyn AsocketHandler>>,
    capacity: usize,
    used: Arc<Mutex<Vec<bool>>>,
    slots: Vec<Option<Asocket>>,
    tokens: TokenAllocator,
    registry: Option<Registry>,
}

impl Acsocket {
    /// `tokens` mints a `Token` for each outbound connection this pool
    /// dials, drawn from the same chain-wide sequence as every other chain
    /// object sharing `tokens` — see [`TokenAllocator`].
    #[must_use]
    pub fn new(capacity: usize, tokens: TokenAllocator, pool: Arc<Jiukun>, handler: Rc<RefCell<dyn AsocketHandler>>) -> Self {
        Self {
            pool,
            handler,
            capacity,
            used: Arc::new(Mutex::new(vec![false; capacity])),
            slots: (0..capacity).map(|_| None).collect(),
            tokens,
            registry: None,
        }
    }

    /// Claim a free slot and start a non-blocking connect to `path`.
    /// Completion (success or failure) is delivered asynchronously via
    /// `AsocketHandler::on_connect`.
    pub fn connect_to(&mut self, path: impl AsRef<Path>) -> Result<ConnHandle, AsocketError> {
        let slot = {
            let mut used = self.used.lock().unwrap();
            let slot = used.iter().position(|&u| !u).ok_or(AsocketError::NoSlot)?;
            used[slot] = true;
            slot
        };

        let stream = match UnixStream::connect(path.as_ref()) {
            Ok(s) => s,
            Err(e) => {
                self.used.lock().unwrap()[slot] = false;
                return Err(AsocketError::Io(e));
            }
        };

        let token = self.tokens.alloc();

        let mut asocket = Asocket::connecting(slot, stream, token, Arc::clone(&self.pool), Rc::clone(&self.handler));
        if let Some(registry) = &self.registry {
            registry
                .register(asocket.stream_mut(), token, mio::Interest::READABLE | mio::Interest::WRITABLE)
                .map_err(AsocketError::Io)?;
        }
        self.slots[slot] = Some(asocket);
        Ok(ConnHandle(slot))
    }

    /// Queue `data` for sending on a connected handle.
    pub fn send(&mut self, handle: ConnHandle, data: Vec<u8>) -> Result<(), AsocketError> {
        self.slots
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(AsocketError::NoSlot)?
            .send(data);
        Ok(())
    }

    /// Close a connection, releasing its slot once the disconnect callback
    /// has fired.
    pub fn close(&mut self, handle: ConnHandle) {
        if let Some(Some(asocket)) = self.slots.get_mut(handle.0) {
            asocket.close();
        }
    }

    #[must_use]
    pub fn in_use_count(&self) -> usize {
        self.used.lock().unwrap().iter().filter(|&&u| u).count()
    }
}

impl ChainObject for Acsocket {
    fn register(&mut self, registry: &Registry) -> io::Result<()> {
        // `connect_to` may run before this object is appended to a chain
        // (e.g. a caller wiring up connections at construction time); any
        // slots claimed in the meantime still need registering now.
        for slot in self.slots.iter_mut().flatten() {
            registry.register(
                slot.stream_mut(),
                slot.token(),
                mio::Interest::READABLE | mio::Interest::WRITABLE,
            )?;
        }
        self.registry = Some(registry.try_clone()?);
        Ok(())
    }

    fn pre_select(&mut self) -> Option<Duration> {
        None
    }

    fn post_select(&mut self, events: &Events) -> io::Result<()> {
        for slot in &mut self.slots {
            if let Some(asocket) = slot {
                asocket.post_select(events)?;
                if asocket.state() == ConnState::Closed {
                    let idx = asocket.id();
                    *slot = None;
                    self.used.lock().unwrap()[idx] = false;
                }
            }
        }
        Ok(())
    }
}
