//! Listening socket plus a fixed-capacity pool of accepted asockets
//! (`spec.md §4.C`: "a listening socket plus a fixed-capacity array of
//! asockets bound to accepted connections").

use std::cell::RefCell;
use std::io::{self, ErrorKind};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use jiukun_slab::Jiukun;
use mio::net::UnixListener;
use mio::{Events, Interest, Registry, Token};

use crate::asocket::{Asocket, AsocketHandler, AsocketId};
use crate::{ChainObject, ConnState, TokenAllocator};

/// A listener plus the pool of asockets it has accepted. `capacity` bounds
/// how many simultaneous accepted connections this service will carry;
/// once full, further `accept()`s are deferred to the next readiness pass.
pub struct Assocket {
    listener: UnixListener,
    listener_token: Token,
    pool: Arc<Jiukun>,
    handler: Rc<RefCell<dyn AsocketHandler>>,
    capacity: usize,
    next_id: AsocketId,
    tokens: TokenAllocator,
    sockets: Vec<Asocket>,
    registry: Option<Registry>,
}

impl Assocket {
    /// `tokens` mints every `Token` this `Assocket` ever registers — its own
    /// listener's and each accepted connection's — from the chain-wide
    /// sequence, so they never collide with tokens another chain object
    /// (e.g. the service's own `Acsocket`) draws from the same `Chain`.
    pub fn new(
        listener: UnixListener,
        tokens: TokenAllocator,
        capacity: usize,
        pool: Arc<Jiukun>,
        handler: Rc<RefCell<dyn AsocketHandler>>,
    ) -> Self {
        let listener_token = tokens.alloc();
        Self {
            listener,
            listener_token,
            pool,
            handler,
            capacity,
            next_id: 0,
            tokens,
            sockets: Vec::new(),
            registry: None,
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.sockets.len()
    }

    fn accept_one(&mut self) -> io::Result<bool> {
        if self.sockets.len() >= self.capacity {
            return Ok(false);
        }
        match self.listener.accept() {
            Ok((stream, _addr)) => {
                let id = self.next_id;
                self.next_id += 1;
                let token = self.tokens.alloc();

                let mut asocket = Asocket::connected(
                    id,
                    stream,
                    token,
                    Arc::clone(&self.pool),
                    Rc::clone(&self.handler),
                );
                if let Some(registry) = &self.registry {
                    registry.register(
                        asocket.stream_mut(),
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    )?;
                }
                self.handler.borrow_mut().on_connect(id, Ok(()));
                self.sockets.push(asocket);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl ChainObject for Assocket {
    fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.listener, self.listener_token, Interest::READABLE)?;
        self.registry = Some(registry.try_clone()?);
        Ok(())
    }

    fn pre_select(&mut self) -> Option<Duration> {
        None
    }

    fn post_select(&mut self, events: &Events) -> io::Result<()> {
        if events.iter().any(|e| e.token() == self.listener_token) {
            // Accept until it would block (`spec.md §4.C`).
            while self.accept_one()? {}
        }

        for socket in &mut self.sockets {
            socket.post_select(events)?;
        }
        self.sockets.retain(|s| s.state() != ConnState::Closed);
        Ok(())
    }
}
